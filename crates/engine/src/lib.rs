//! The hivemind conversation engine.
//!
//! `Engine` is the actor that owns one conversation and drives its tool
//! loop; `EngineRegistry` keeps exactly one live actor per conversation id.
//! The HTTP surface, concrete skills, and LLM clients live outside this
//! workspace and plug in through the traits in `hivemind-core`.

pub mod engine;
pub mod registry;

pub use engine::{Engine, EngineCommand, EngineHandle, EngineState};
pub use registry::EngineRegistry;

#[cfg(test)]
pub(crate) mod test_mocks;
