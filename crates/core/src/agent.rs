//! Sub-agent domain types: specs, scopes, and terminal outcomes.

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

use crate::error::GateError;
use crate::message::ConversationId;

/// An explicit allow-list of fully-qualified skill names. A sub-agent may
/// never invoke anything outside its scope, and a dispatched scope is never
/// wider than the dispatcher's own.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Scope(BTreeSet<String>);

impl Scope {
    pub fn new(skills: impl IntoIterator<Item = impl Into<String>>) -> Self {
        Self(skills.into_iter().map(Into::into).collect())
    }

    /// Whether this scope permits the given qualified skill name.
    pub fn allows(&self, skill: &str) -> bool {
        self.0.contains(skill)
    }

    /// Scope containment: every skill here is also in `other`.
    pub fn is_subset_of(&self, other: &Scope) -> bool {
        self.0.is_subset(&other.0)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = &str> {
        self.0.iter().map(String::as_str)
    }
}

impl FromIterator<String> for Scope {
    fn from_iter<T: IntoIterator<Item = String>>(iter: T) -> Self {
        Self(iter.into_iter().collect())
    }
}

/// A validated, immutable sub-agent specification. Created by the engine when
/// a `dispatch_agent` call passes validation; never mutated after scheduling.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentSpec {
    /// Unique within the parent conversation
    pub agent_id: String,

    /// Natural-language goal
    pub mission: String,

    /// Allow-list of qualified skill names
    pub scope: Scope,

    /// Sibling agent ids whose results must be available first
    #[serde(default, skip_serializing_if = "BTreeSet::is_empty")]
    pub depends_on: BTreeSet<String>,

    /// The conversation that dispatched this agent
    pub parent_conversation_id: ConversationId,
}

/// Sub-agent lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentStatus {
    Pending,
    Running,
    AwaitingHelp,
    Completed,
    Crashed,
}

impl AgentStatus {
    /// Terminal states never resume.
    pub fn is_terminal(&self) -> bool {
        matches!(self, AgentStatus::Completed | AgentStatus::Crashed)
    }
}

/// What a completed sub-agent produced.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentResult {
    pub agent_id: String,

    /// The agent's final answer text
    pub summary: String,

    /// Turns the agent consumed
    pub turns_used: u32,

    /// True when the agent hit its turn budget and was cut off gracefully
    pub truncated: bool,
}

/// Terminal outcome of one dispatched agent, as reported to the engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum AgentOutcome {
    /// The agent reached a final answer (possibly truncated)
    Completed(AgentResult),

    /// The agent's task panicked or failed irrecoverably
    Crashed { agent_id: String, reason: String },

    /// A dependency crashed, so this agent was never started
    Skipped { agent_id: String, blocked_on: String },

    /// A resource gate rejected the wave before this agent started; retryable
    GateRejected { agent_id: String, gate: GateError },
}

impl AgentOutcome {
    pub fn agent_id(&self) -> &str {
        match self {
            AgentOutcome::Completed(r) => &r.agent_id,
            AgentOutcome::Crashed { agent_id, .. }
            | AgentOutcome::Skipped { agent_id, .. }
            | AgentOutcome::GateRejected { agent_id, .. } => agent_id,
        }
    }

    pub fn is_completed(&self) -> bool {
        matches!(self, AgentOutcome::Completed(_))
    }
}

/// A raw `dispatch_agent` request parsed from an LLM tool call, before
/// validation turns it into an [`AgentSpec`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DispatchRequest {
    /// The tool call this request came from (for the paired tool result)
    #[serde(skip)]
    pub call_id: String,

    pub mission: String,

    /// Requested qualified skill names
    pub scope: Vec<String>,

    /// Requested sibling dependencies (agent ids from the same batch)
    #[serde(default)]
    pub depends_on: Vec<String>,

    /// Optional caller-chosen id; autogenerated when absent
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent_id: Option<String>,
}
