use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::llm::ToolDefinition;

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct ToolManifest {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default = "empty_object_schema")]
    pub input_schema: Value,
}

fn empty_object_schema() -> Value {
    json!({ "type": "object", "properties": {} })
}

impl ToolManifest {
    pub fn builder(name: impl Into<String>) -> ToolManifestBuilder {
        ToolManifestBuilder::new(name)
    }

    pub fn required_inputs(&self) -> Vec<&str> {
        self.input_schema["required"]
            .as_array()
            .map(|items| items.iter().filter_map(Value::as_str).collect())
            .unwrap_or_default()
    }

    pub fn definition(&self) -> ToolDefinition {
        ToolDefinition {
            name: self.name.clone(),
            description: self.description.clone().unwrap_or_default(),
            input_schema: self.input_schema.clone(),
        }
    }
}

pub struct ToolManifestBuilder {
    manifest: ToolManifest,
}

impl ToolManifestBuilder {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            manifest: ToolManifest {
                name: name.into(),
                description: None,
                input_schema: empty_object_schema(),
            },
        }
    }

    pub fn description(mut self, description: impl Into<String>) -> Self {
        self.manifest.description = Some(description.into());
        self
    }

    /// 声明一个输入字段
    pub fn input(mut self, name: &str, type_name: &str, required: bool) -> Self {
        let schema = &mut self.manifest.input_schema;
        schema["properties"][name] = json!({ "type": type_name });
        if required {
            match schema["required"].as_array_mut() {
                Some(items) => items.push(Value::String(name.to_string())),
                None => schema["required"] = json!([name]),
            }
        }
        self
    }

    pub fn build(self) -> ToolManifest {
        self.manifest
    }
}
