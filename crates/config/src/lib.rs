//! Configuration loading and validation for hivemind.
//!
//! Loads configuration from a TOML file with environment variable overrides.
//! Validates all settings at startup: budgets, gate thresholds, and rate
//! rules are configuration, not structure, so a bad config file fails fast
//! here rather than misbehaving at dispatch time.

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

/// The root configuration structure.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrchestratorConfig {
    /// LLM defaults
    #[serde(default)]
    pub llm: LlmConfig,

    /// Conversation engine settings
    #[serde(default)]
    pub engine: EngineConfig,

    /// Sub-agent settings
    #[serde(default)]
    pub sub_agent: SubAgentConfig,

    /// Dispatch protocol limits
    #[serde(default)]
    pub dispatch: DispatchConfig,

    /// Circuit breaker levels, narrowest scope first (the check order)
    #[serde(default = "default_circuit_levels")]
    pub circuit_levels: Vec<CircuitLevelConfig>,

    /// Named rate-limit rules
    #[serde(default = "default_rate_rules")]
    pub rate_limits: Vec<RateRuleConfig>,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            llm: LlmConfig::default(),
            engine: EngineConfig::default(),
            sub_agent: SubAgentConfig::default(),
            dispatch: DispatchConfig::default(),
            circuit_levels: default_circuit_levels(),
            rate_limits: default_rate_rules(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LlmConfig {
    /// Default model
    #[serde(default = "default_model")]
    pub model: String,

    /// Default temperature
    #[serde(default = "default_temperature")]
    pub temperature: f32,

    /// Default max tokens per LLM response
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,

    /// Per-call deadline in seconds
    #[serde(default = "default_llm_timeout")]
    pub timeout_secs: u64,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            model: default_model(),
            temperature: default_temperature(),
            max_tokens: default_max_tokens(),
            timeout_secs: default_llm_timeout(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Hard cap on loop iterations per turn; exceeding it truncates, never loops
    #[serde(default = "default_max_iterations")]
    pub max_iterations: u32,

    /// Stop an idle engine actor after this many seconds
    #[serde(default = "default_idle_timeout")]
    pub idle_timeout_secs: u64,

    /// Persist the conversation snapshot every N completed iterations
    #[serde(default = "default_persist_every")]
    pub persist_every_iterations: u32,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_iterations: default_max_iterations(),
            idle_timeout_secs: default_idle_timeout(),
            persist_every_iterations: default_persist_every(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubAgentConfig {
    /// Turn budget per sub-agent. Must be smaller than the engine's:
    /// sub-agents are meant to be narrow.
    #[serde(default = "default_sub_agent_turns")]
    pub max_turns: u32,
}

impl Default for SubAgentConfig {
    fn default() -> Self {
        Self {
            max_turns: default_sub_agent_turns(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DispatchConfig {
    /// Maximum agents in one dispatch batch
    #[serde(default = "default_batch_limit")]
    pub max_agents_per_batch: usize,

    /// Maximum live sub-agents per conversation
    #[serde(default = "default_active_limit")]
    pub max_active_agents: usize,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            max_agents_per_batch: default_batch_limit(),
            max_active_agents: default_active_limit(),
        }
    }
}

/// One circuit breaker level.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CircuitLevelConfig {
    /// Level name (e.g., "skill", "domain", "conversation", "system")
    pub level: String,

    /// Failures within the window that trip the circuit
    pub threshold: usize,

    /// Sliding failure window in seconds
    pub window_secs: u64,

    /// How long the circuit stays open before probing, in seconds
    pub cooldown_secs: u64,

    /// Whether a success while closed clears the failure window
    #[serde(default)]
    pub reset_on_success: bool,
}

/// One named rate-limit rule.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateRuleConfig {
    /// Rule name, referenced by the engine ("llm", "dispatch")
    pub name: String,

    /// Window length in seconds
    pub window_secs: u64,

    /// Maximum admitted events per window
    pub limit: usize,
}

impl RateRuleConfig {
    pub fn window(&self) -> Duration {
        Duration::from_secs(self.window_secs)
    }
}

fn default_model() -> String {
    "anthropic/claude-sonnet-4".into()
}
fn default_temperature() -> f32 {
    0.7
}
fn default_max_tokens() -> u32 {
    4096
}
fn default_llm_timeout() -> u64 {
    120
}
fn default_max_iterations() -> u32 {
    25
}
fn default_idle_timeout() -> u64 {
    900
}
fn default_persist_every() -> u32 {
    5
}
fn default_sub_agent_turns() -> u32 {
    10
}
fn default_batch_limit() -> usize {
    8
}
fn default_active_limit() -> usize {
    16
}

fn default_circuit_levels() -> Vec<CircuitLevelConfig> {
    vec![
        CircuitLevelConfig {
            level: "skill".into(),
            threshold: 5,
            window_secs: 60,
            cooldown_secs: 30,
            reset_on_success: false,
        },
        CircuitLevelConfig {
            level: "domain".into(),
            threshold: 10,
            window_secs: 60,
            cooldown_secs: 60,
            reset_on_success: false,
        },
        CircuitLevelConfig {
            level: "conversation".into(),
            threshold: 15,
            window_secs: 120,
            cooldown_secs: 60,
            reset_on_success: false,
        },
        CircuitLevelConfig {
            level: "system".into(),
            threshold: 50,
            window_secs: 60,
            cooldown_secs: 120,
            reset_on_success: false,
        },
    ]
}

fn default_rate_rules() -> Vec<RateRuleConfig> {
    vec![
        RateRuleConfig {
            name: "llm".into(),
            window_secs: 60,
            limit: 60,
        },
        RateRuleConfig {
            name: "dispatch".into(),
            window_secs: 60,
            limit: 20,
        },
    ]
}

/// Configuration errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to parse config file: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

impl OrchestratorConfig {
    /// Load from a TOML file, apply environment overrides, validate.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path)?;
        let mut config: Self = toml::from_str(&raw)?;
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    /// Defaults plus environment overrides, validated.
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = Self::default();
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    /// Environment variables win over file values.
    fn apply_env_overrides(&mut self) {
        if let Ok(model) = std::env::var("HIVEMIND_MODEL") {
            self.llm.model = model;
        }
        if let Ok(v) = std::env::var("HIVEMIND_MAX_ITERATIONS")
            && let Ok(n) = v.parse()
        {
            self.engine.max_iterations = n;
        }
        if let Ok(v) = std::env::var("HIVEMIND_SUB_AGENT_MAX_TURNS")
            && let Ok(n) = v.parse()
        {
            self.sub_agent.max_turns = n;
        }
        if let Ok(v) = std::env::var("HIVEMIND_LLM_TIMEOUT_SECS")
            && let Ok(n) = v.parse()
        {
            self.llm.timeout_secs = n;
        }
    }

    /// Validate all settings. Called at startup so bad values fail fast.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.engine.max_iterations == 0 {
            return Err(ConfigError::Invalid(
                "engine.max_iterations must be at least 1".into(),
            ));
        }
        if self.sub_agent.max_turns == 0 {
            return Err(ConfigError::Invalid(
                "sub_agent.max_turns must be at least 1".into(),
            ));
        }
        if self.sub_agent.max_turns >= self.engine.max_iterations {
            return Err(ConfigError::Invalid(format!(
                "sub_agent.max_turns ({}) must be smaller than engine.max_iterations ({})",
                self.sub_agent.max_turns, self.engine.max_iterations
            )));
        }
        if self.dispatch.max_agents_per_batch == 0 {
            return Err(ConfigError::Invalid(
                "dispatch.max_agents_per_batch must be at least 1".into(),
            ));
        }
        if !(0.0..=2.0).contains(&self.llm.temperature) {
            return Err(ConfigError::Invalid(format!(
                "llm.temperature must be between 0.0 and 2.0, got {}",
                self.llm.temperature
            )));
        }
        for level in &self.circuit_levels {
            if level.threshold == 0 || level.window_secs == 0 {
                return Err(ConfigError::Invalid(format!(
                    "circuit level '{}' needs a positive threshold and window",
                    level.level
                )));
            }
        }
        for rule in &self.rate_limits {
            if rule.limit == 0 || rule.window_secs == 0 {
                return Err(ConfigError::Invalid(format!(
                    "rate rule '{}' needs a positive limit and window",
                    rule.name
                )));
            }
        }
        Ok(())
    }

    /// Look up a rate rule by name.
    pub fn rate_rule(&self, name: &str) -> Option<&RateRuleConfig> {
        self.rate_limits.iter().find(|r| r.name == name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn defaults_are_valid() {
        let config = OrchestratorConfig::default();
        config.validate().unwrap();
        assert!(config.sub_agent.max_turns < config.engine.max_iterations);
        assert_eq!(config.circuit_levels[0].level, "skill");
    }

    #[test]
    fn load_from_toml_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"
[llm]
model = "test-model"

[engine]
max_iterations = 30

[sub_agent]
max_turns = 6

[[circuit_levels]]
level = "skill"
threshold = 3
window_secs = 30
cooldown_secs = 15

[[rate_limits]]
name = "llm"
window_secs = 10
limit = 5
"#
        )
        .unwrap();

        let config = OrchestratorConfig::load(file.path()).unwrap();
        assert_eq!(config.llm.model, "test-model");
        assert_eq!(config.engine.max_iterations, 30);
        assert_eq!(config.sub_agent.max_turns, 6);
        assert_eq!(config.circuit_levels.len(), 1);
        assert_eq!(config.rate_rule("llm").unwrap().limit, 5);
        // Unspecified sections fall back to defaults.
        assert_eq!(config.dispatch.max_agents_per_batch, 8);
    }

    #[test]
    fn sub_agent_budget_must_be_narrower() {
        let mut config = OrchestratorConfig::default();
        config.sub_agent.max_turns = config.engine.max_iterations;
        assert!(config.validate().is_err());
    }

    #[test]
    fn zero_iterations_rejected() {
        let mut config = OrchestratorConfig::default();
        config.engine.max_iterations = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn zero_threshold_rejected() {
        let mut config = OrchestratorConfig::default();
        config.circuit_levels[0].threshold = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn unknown_rate_rule_is_none() {
        let config = OrchestratorConfig::default();
        assert!(config.rate_rule("nonexistent").is_none());
        assert!(config.rate_rule("dispatch").is_some());
    }
}
