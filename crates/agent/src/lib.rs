//! Sub-agent runtime: the pure per-iteration decision function, the scoped
//! sub-agent actor, and the wave scheduler that runs dispatched batches.

pub mod context;
pub mod loop_runner;
pub mod scheduler;
pub mod sub_agent;

pub use context::{AgentContext, breaker_from_config};
pub use loop_runner::{AwaitCall, LoopDecision, ToolInvocation, decide};
pub use scheduler::{AgentScheduler, plan_waves};
pub use sub_agent::{HelpRequest, SubAgent, SubAgentHandle};

#[cfg(test)]
pub(crate) mod test_support;
