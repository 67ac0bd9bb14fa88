//! Error types for the hivemind domain.
//!
//! Uses `thiserror` for ergonomic error definitions.
//! Each bounded context has its own error variant. Gate failures are kept
//! separate from skill/LLM failures so callers can tell a retryable
//! back-pressure signal from a real fault.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// The top-level error type for all hivemind operations.
#[derive(Debug, Error)]
pub enum Error {
    // --- LLM client errors ---
    #[error("LLM error: {0}")]
    Llm(#[from] LlmError),

    // --- Skill execution errors ---
    #[error("Skill error: {0}")]
    Skill(#[from] SkillError),

    // --- Resource gate failures (retryable) ---
    #[error("Gate rejected: {0}")]
    Gate(#[from] GateError),

    // --- Dispatch validation errors ---
    #[error("Dispatch error: {0}")]
    Dispatch(#[from] DispatchError),

    // --- Scheduling errors ---
    #[error("Schedule error: {0}")]
    Schedule(#[from] ScheduleError),

    // --- Persistence collaborator errors ---
    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    // --- Configuration errors ---
    #[error("Configuration error: {message}")]
    Config { message: String },

    // --- Serialization ---
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Conversation not found: {0}")]
    ConversationNotFound(String),

    #[error("Engine stopped: {0}")]
    EngineStopped(String),

    // --- Generic ---
    #[error("Internal error: {0}")]
    Internal(String),
}

/// Result type alias using our Error.
pub type Result<T> = std::result::Result<T, Error>;

// --- Bounded context errors ---

#[derive(Debug, Clone, Error)]
pub enum LlmError {
    #[error("API request failed: {message} (status: {status_code})")]
    Api { status_code: u16, message: String },

    #[error("Rate limited by provider, retry after {retry_after_secs}s")]
    RateLimited { retry_after_secs: u64 },

    #[error("Request timed out after {timeout_secs}s")]
    Timeout { timeout_secs: u64 },

    #[error("Network error: {0}")]
    Network(String),

    #[error("Provider returned an empty response")]
    EmptyResponse,

    #[error("Client not configured: {0}")]
    NotConfigured(String),

    #[error("Stream interrupted: {0}")]
    StreamInterrupted(String),
}

#[derive(Debug, Clone, Error)]
pub enum SkillError {
    #[error("Skill not found: {0}")]
    NotFound(String),

    #[error("Skill execution failed: {skill} — {reason}")]
    ExecutionFailed { skill: String, reason: String },

    #[error("Skill timed out: {skill} after {timeout_secs}s")]
    Timeout { skill: String, timeout_secs: u64 },

    #[error("Invalid skill arguments: {0}")]
    InvalidArguments(String),

    #[error("Skill '{skill}' is outside the scope of agent {agent_id}")]
    OutOfScope { skill: String, agent_id: String },
}

/// Resource gate failures. Always retryable: the caller should back off or
/// pick another path, never treat these as fatal. Serializable because a
/// gate rejection travels inside an [`crate::agent::AgentOutcome`].
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
pub enum GateError {
    #[error("Circuit open at level '{level}' for key '{key}'")]
    CircuitOpen { level: String, key: String },

    #[error("Rate limited for key '{key}', retry after {retry_after_ms}ms")]
    RateLimited { key: String, retry_after_ms: u64 },
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DispatchError {
    #[error("Unknown skill: {0}")]
    UnknownSkill(String),

    #[error("Scope escalation: skill '{skill}' is not in the dispatcher's scope")]
    ScopeEscalation { skill: String },

    #[error("Dispatch batch of {requested} exceeds the limit of {limit}")]
    BatchLimitExceeded { requested: usize, limit: usize },

    #[error("Too many active agents: {active} of {limit}")]
    TooManyActiveAgents { active: usize, limit: usize },

    #[error("Duplicate agent id: {0}")]
    DuplicateAgentId(String),

    #[error("Agent '{agent_id}' depends on unknown sibling '{depends_on}'")]
    UnknownDependency { agent_id: String, depends_on: String },

    #[error("Mission must not be empty")]
    EmptyMission,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ScheduleError {
    #[error("Dependency cycle detected among agents: {0:?}")]
    CycleDetected(Vec<String>),

    #[error("Gate rejected the wave: {0}")]
    Gate(#[from] GateError),
}

#[derive(Debug, Clone, Error)]
pub enum StoreError {
    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Conversation not found in store: {0}")]
    NotFound(String),
}

impl GateError {
    /// Gate failures are the retryable class of errors; every other class
    /// should be handled, not retried blindly.
    pub fn is_retryable(&self) -> bool {
        true
    }
}
