//! # hivemind Core
//!
//! Domain types, collaborator traits, and error definitions for the hivemind
//! multi-agent orchestration runtime. This crate has **zero framework
//! dependencies** — it defines the domain model that all other crates
//! implement against.
//!
//! ## Design Philosophy
//!
//! Every external collaborator (LLM client, skill execution, skill registry,
//! persistence) is defined as a trait here. Implementations live outside the
//! core. This enables:
//! - Swapping implementations via configuration
//! - Easy testing with scripted mock implementations
//! - Clean dependency graph (all crates depend inward on core)

pub mod agent;
pub mod error;
pub mod event;
pub mod llm;
pub mod message;
pub mod skill;
pub mod store;

// Re-export key types at crate root for ergonomics
pub use agent::{AgentOutcome, AgentResult, AgentSpec, AgentStatus, DispatchRequest, Scope};
pub use error::{
    DispatchError, Error, GateError, LlmError, Result, ScheduleError, SkillError, StoreError,
};
pub use event::{DomainEvent, EventBus};
pub use llm::{FinishReason, LlmClient, LlmRequest, LlmResponse, StreamChunk, ToolDefinition, Usage};
pub use message::{
    Conversation, ConversationId, ConversationStatus, Message, MessageToolCall, Role, TokenUsage,
};
pub use skill::{
    ExecutionContext, SkillDefinition, SkillExecutor, SkillRegistry, SkillResult,
    StaticSkillRegistry,
};
pub use store::{ConversationStore, InMemoryStore};
