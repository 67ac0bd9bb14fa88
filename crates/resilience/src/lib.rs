//! Resource gates for the hivemind runtime.
//!
//! Both gates are consulted before every LLM call and sub-agent wave. A gate
//! failure is retryable back-pressure, surfaced as a
//! [`hivemind_core::error::GateError`] distinct from tool and LLM failures
//! so the orchestrator LLM can back off or pick another path.

pub mod circuit_breaker;
pub mod rate_limiter;

pub use circuit_breaker::{CircuitBreaker, LevelPolicy};
pub use rate_limiter::RateLimiter;
