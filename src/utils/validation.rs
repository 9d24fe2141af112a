use crate::config::AgentConfig;
use crate::error::{PilotError, Result};

/// 配置验证器
pub struct ConfigValidator;

impl ConfigValidator {
    pub fn validate_agent(config: &AgentConfig) -> Result<()> {
        Self::validate_non_empty("agent id", &config.id)?;
        Self::validate_non_empty("agent name", &config.name)?;
        Self::validate_non_empty("system prompt", &config.system_prompt)?;
        Self::validate_temperature(config.temperature)?;
        if config.max_steps == 0 {
            return Err(PilotError::config("max steps must be at least 1"));
        }
        if config.max_tokens == 0 {
            return Err(PilotError::config("max tokens must be at least 1"));
        }
        Self::validate_threshold("min_confidence", config.eval.min_confidence)?;
        Self::validate_threshold("auto_send_threshold", config.eval.auto_send_threshold)?;
        for source in &config.sources {
            Self::validate_non_empty("fetch source name", &source.name)?;
            Self::validate_non_empty("fetch source kind", &source.kind)?;
        }
        Ok(())
    }

    pub fn validate_non_empty(what: &str, value: &str) -> Result<()> {
        if value.trim().is_empty() {
            return Err(PilotError::config(format!("{what} must not be empty")));
        }
        Ok(())
    }

    pub fn validate_temperature(temperature: f32) -> Result<()> {
        if !(0.0..=2.0).contains(&temperature) {
            return Err(PilotError::config(format!(
                "temperature {temperature} out of range 0.0..=2.0"
            )));
        }
        Ok(())
    }

    pub fn validate_threshold(name: &str, value: f64) -> Result<()> {
        if !(0.0..=1.0).contains(&value) {
            return Err(PilotError::config(format!(
                "{name} {value} out of range 0.0..=1.0"
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn agent() -> AgentConfig {
        AgentConfig::new("a1", "Writer", "Write politely.")
    }

    #[test]
    fn test_valid_agent() {
        assert!(ConfigValidator::validate_agent(&agent()).is_ok());
    }

    #[test]
    fn test_empty_prompt() {
        let mut config = agent();
        config.system_prompt = "  ".into();
        assert!(ConfigValidator::validate_agent(&config).is_err());
    }

    #[test]
    fn test_zero_steps() {
        let mut config = agent();
        config.max_steps = 0;
        assert!(ConfigValidator::validate_agent(&config).is_err());
    }

    #[test]
    fn test_threshold_range() {
        let mut config = agent();
        config.eval.auto_send_threshold = 1.2;
        assert!(ConfigValidator::validate_agent(&config).is_err());
    }
}
