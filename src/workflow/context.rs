use std::collections::BTreeMap;

use once_cell::sync::Lazy;
use regex::{Captures, Regex};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

static PLACEHOLDER: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"\{\{\s*([A-Za-z0-9_\-]+(?:\.[A-Za-z0-9_\-]+)*)\s*\}\}")
        .expect("placeholder pattern compiles")
});

/// 工作流运行中逐步扩展的变量表
///
/// 每一步返回新的上下文，旧值保持不变，便于回放与调试。
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ExecutionContext {
    vars: BTreeMap<String, Value>,
}

impl ExecutionContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_map(map: Map<String, Value>) -> Self {
        Self {
            vars: map.into_iter().collect(),
        }
    }

    /// 对象按键展开，其余值放到 `input` 下
    pub fn from_value(value: Value) -> Self {
        match value {
            Value::Object(map) => Self::from_map(map),
            Value::Null => Self::default(),
            other => Self::default().with("input", other),
        }
    }

    pub fn with(&self, key: impl Into<String>, value: Value) -> Self {
        let mut vars = self.vars.clone();
        vars.insert(key.into(), value);
        Self { vars }
    }

    pub fn without(&self, key: &str) -> Self {
        let mut vars = self.vars.clone();
        vars.remove(key);
        Self { vars }
    }

    pub fn merged(&self, entries: impl IntoIterator<Item = (String, Value)>) -> Self {
        let mut vars = self.vars.clone();
        vars.extend(entries);
        Self { vars }
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.vars.get(key)
    }

    /// 支持 `a.b.c` 形式的嵌套查找
    pub fn lookup(&self, path: &str) -> Option<&Value> {
        let mut parts = path.split('.');
        let mut current = self.vars.get(parts.next()?)?;
        for part in parts {
            current = match current {
                Value::Object(map) => map.get(part)?,
                Value::Array(items) => items.get(part.parse::<usize>().ok()?)?,
                _ => return None,
            };
        }
        Some(current)
    }

    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.lookup(key).and_then(Value::as_str)
    }

    pub fn contains(&self, key: &str) -> bool {
        self.vars.contains_key(key)
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.vars.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.vars.len()
    }

    pub fn is_empty(&self) -> bool {
        self.vars.is_empty()
    }

    pub fn to_value(&self) -> Value {
        Value::Object(
            self.vars
                .iter()
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect(),
        )
    }

    /// 渲染 `{{var}}` 占位符，未知变量原样保留
    pub fn render(&self, template: &str) -> String {
        PLACEHOLDER
            .replace_all(template, |caps: &Captures<'_>| match self.lookup(&caps[1]) {
                Some(Value::String(text)) => text.clone(),
                Some(Value::Null) => String::new(),
                Some(other) => other.to_string(),
                None => caps[0].to_string(),
            })
            .into_owned()
    }
}
