//! The collaborator bundle shared by the engine and every sub-agent.

use std::sync::Arc;
use std::time::Duration;

use hivemind_config::OrchestratorConfig;
use hivemind_core::event::EventBus;
use hivemind_core::llm::LlmClient;
use hivemind_core::skill::{SkillExecutor, SkillRegistry};
use hivemind_resilience::{CircuitBreaker, RateLimiter};

/// Everything an agent loop needs to run: the LLM client, the skill
/// collaborators, both resource gates, the event bus, and the config.
///
/// Cheap to clone; every field is an `Arc`. The engine and all sub-agents
/// of a deployment share one context, which is what makes the gates global:
/// a circuit opened by one agent is open for everyone.
#[derive(Clone)]
pub struct AgentContext {
    pub llm: Arc<dyn LlmClient>,
    pub executor: Arc<dyn SkillExecutor>,
    pub registry: Arc<dyn SkillRegistry>,
    pub breaker: Arc<CircuitBreaker>,
    pub limiter: Arc<RateLimiter>,
    pub event_bus: Arc<EventBus>,
    pub config: Arc<OrchestratorConfig>,
}

/// Build the multi-level breaker from the configured levels, preserving
/// their order (narrowest scope first is the check order).
pub fn breaker_from_config(config: &OrchestratorConfig) -> CircuitBreaker {
    CircuitBreaker::new(
        config
            .circuit_levels
            .iter()
            .map(|level| hivemind_resilience::LevelPolicy {
                level: level.level.clone(),
                threshold: level.threshold,
                window: Duration::from_secs(level.window_secs),
                cooldown: Duration::from_secs(level.cooldown_secs),
                reset_on_success: level.reset_on_success,
            })
            .collect(),
    )
}
