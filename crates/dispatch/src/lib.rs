//! The dispatch protocol — meta-tools the orchestrator LLM uses to discover
//! skills, spawn scoped sub-agents, and collect their results.
//!
//! Everything here is a pure request/response handler over the skill
//! registry collaborator; the engine owns the side effects (queueing specs,
//! running the scheduler, answering tool calls).

pub mod protocol;
pub mod skill_lookup;
pub mod validate;

pub use protocol::{
    DispatchAgentArgs, GetAgentResultsArgs, GetSkillArgs, RequestHelpArgs, SendAgentUpdateArgs,
    ToolName, meta_tool_definitions, request_help_definition,
};
pub use skill_lookup::get_skill;
pub use validate::{BatchVerdict, DispatchLimits, DispatchValidator};
