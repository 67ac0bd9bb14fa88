//! The meta-tool contracts exposed to the orchestrator LLM.
//!
//! Four tools let the model discover skills, spawn scoped sub-agents, and
//! collect their results. Tool names resolve through a closed enum with a
//! fallback variant for skill calls — a lookup table, not reflection.

use serde::{Deserialize, Serialize};

use hivemind_core::llm::ToolDefinition;

pub const GET_SKILL: &str = "get_skill";
pub const DISPATCH_AGENT: &str = "dispatch_agent";
pub const GET_AGENT_RESULTS: &str = "get_agent_results";
pub const SEND_AGENT_UPDATE: &str = "send_agent_update";
pub const REQUEST_HELP: &str = "request_help";

/// Every tool name the loop can route. Skill calls fall through to the
/// `Skill` variant and are checked against scope and registry downstream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ToolName {
    GetSkill,
    DispatchAgent,
    GetAgentResults,
    SendAgentUpdate,
    /// Sub-agent only: ask the parent engine for guidance
    RequestHelp,
    /// Anything else is treated as a qualified skill name
    Skill(String),
}

impl ToolName {
    pub fn resolve(name: &str) -> Self {
        match name {
            GET_SKILL => Self::GetSkill,
            DISPATCH_AGENT => Self::DispatchAgent,
            GET_AGENT_RESULTS => Self::GetAgentResults,
            SEND_AGENT_UPDATE => Self::SendAgentUpdate,
            REQUEST_HELP => Self::RequestHelp,
            other => Self::Skill(other.to_string()),
        }
    }
}

/// Arguments for `get_skill`. All optional: progressive disclosure starts
/// from no arguments at all.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GetSkillArgs {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub domain: Option<String>,

    /// A skill name, `domain.skill`, or `domain.all`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub skill: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub search: Option<String>,
}

/// Arguments for `dispatch_agent`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DispatchAgentArgs {
    pub mission: String,

    /// Qualified skill names the sub-agent may use
    pub scope: Vec<String>,

    /// Sibling agent ids whose results must be available first
    #[serde(default)]
    pub depends_on: Vec<String>,

    /// Optional caller-chosen id; autogenerated when absent
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent_id: Option<String>,
}

/// Arguments for `get_agent_results`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GetAgentResultsArgs {
    pub agent_ids: Vec<String>,
}

/// Arguments for `send_agent_update`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SendAgentUpdateArgs {
    pub agent_id: String,
    pub message: String,
}

/// Arguments for `request_help` (sub-agent side).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestHelpArgs {
    pub question: String,
}

/// The meta-tool definitions handed to the orchestrator LLM alongside any
/// directly-executable skills.
pub fn meta_tool_definitions() -> Vec<ToolDefinition> {
    vec![
        ToolDefinition {
            name: GET_SKILL.into(),
            description: "Discover available skills. Call with no arguments to list all \
                          domains; with a domain to see its skills; with skill set to \
                          'domain.skill' for one definition or 'domain.all' for every \
                          skill in a domain; or with search for keyword matching."
                .into(),
            parameters: serde_json::json!({
                "type": "object",
                "properties": {
                    "domain": { "type": "string", "description": "Domain name to inspect" },
                    "skill": { "type": "string", "description": "Qualified 'domain.skill' name, or 'domain.all'" },
                    "search": { "type": "string", "description": "Keyword to match against names, descriptions, and tags" }
                }
            }),
        },
        ToolDefinition {
            name: DISPATCH_AGENT.into(),
            description: "Spawn a scoped sub-agent for one mission. The scope must be a \
                          subset of your own skills. Use depends_on to order agents that \
                          need another agent's result."
                .into(),
            parameters: serde_json::json!({
                "type": "object",
                "properties": {
                    "mission": { "type": "string", "description": "What the sub-agent should accomplish" },
                    "scope": {
                        "type": "array",
                        "items": { "type": "string" },
                        "description": "Qualified skill names the sub-agent may use"
                    },
                    "depends_on": {
                        "type": "array",
                        "items": { "type": "string" },
                        "description": "Sibling agent ids whose results must be available first"
                    },
                    "agent_id": { "type": "string", "description": "Optional id to reference this agent later" }
                },
                "required": ["mission", "scope"]
            }),
        },
        ToolDefinition {
            name: GET_AGENT_RESULTS.into(),
            description: "Run all queued sub-agents and wait for the named agents to \
                          finish, then return their results."
                .into(),
            parameters: serde_json::json!({
                "type": "object",
                "properties": {
                    "agent_ids": {
                        "type": "array",
                        "items": { "type": "string" },
                        "description": "Agent ids to wait for"
                    }
                },
                "required": ["agent_ids"]
            }),
        },
        ToolDefinition {
            name: SEND_AGENT_UPDATE.into(),
            description: "Send a best-effort note to a running sub-agent. Delivery is \
                          not guaranteed."
                .into(),
            parameters: serde_json::json!({
                "type": "object",
                "properties": {
                    "agent_id": { "type": "string" },
                    "message": { "type": "string" }
                },
                "required": ["agent_id", "message"]
            }),
        },
    ]
}

/// The help tool offered to sub-agents in addition to their scoped skills.
pub fn request_help_definition() -> ToolDefinition {
    ToolDefinition {
        name: REQUEST_HELP.into(),
        description: "Ask the dispatching conversation for guidance when you are stuck \
                      or missing information. Your loop pauses until an answer arrives."
            .into(),
        parameters: serde_json::json!({
            "type": "object",
            "properties": {
                "question": { "type": "string", "description": "What you need to know" }
            },
            "required": ["question"]
        }),
    }
}
