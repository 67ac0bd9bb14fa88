//! Multi-level circuit breaker.
//!
//! Each level (e.g., per-skill, per-domain, per-conversation, system-wide)
//! has its own key space and its own threshold, failure window, and cooldown.
//! The level list is configuration, not structure: the breaker is built from
//! whatever levels the caller hands it.
//!
//! Transition rules per (level, key):
//! - closed → open when failures within the sliding window reach the
//!   level's threshold
//! - open → half-open once the cooldown has elapsed (observed on check)
//! - half-open → closed on the next success
//! - half-open → open on the next failure
//!
//! All mutation goes through `check`/`record_*`; callers never touch circuit
//! state directly. State is held in sharded mutex-guarded maps so concurrent
//! callers on different keys don't contend on one lock.

use chrono::Utc;
use std::collections::{HashMap, VecDeque};
use std::hash::{DefaultHasher, Hash, Hasher};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tracing::{debug, warn};

use hivemind_core::error::GateError;
use hivemind_core::event::{DomainEvent, EventBus};

const SHARD_COUNT: usize = 16;

/// Threshold/window/cooldown for one breaker level.
#[derive(Debug, Clone)]
pub struct LevelPolicy {
    /// Level name (e.g., "skill", "domain", "conversation", "system")
    pub level: String,

    /// Failures within `window` that trip the circuit
    pub threshold: usize,

    /// Sliding failure window
    pub window: Duration,

    /// How long the circuit stays open before probing
    pub cooldown: Duration,

    /// Whether a success while closed clears the failure window
    pub reset_on_success: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Closed,
    Open,
    HalfOpen,
}

/// Per-(level, key) state. Created on the first failure observation and
/// pruned once the window empties while closed.
#[derive(Debug)]
struct CircuitState {
    failures: VecDeque<Instant>,
    state: State,
    opened_at: Option<Instant>,
}

impl CircuitState {
    fn new() -> Self {
        Self {
            failures: VecDeque::new(),
            state: State::Closed,
            opened_at: None,
        }
    }

    fn prune(&mut self, window: Duration, now: Instant) {
        while let Some(&oldest) = self.failures.front() {
            if now.duration_since(oldest) > window {
                self.failures.pop_front();
            } else {
                break;
            }
        }
    }
}

/// The multi-level failure gate.
pub struct CircuitBreaker {
    policies: Vec<LevelPolicy>,
    shards: Vec<Mutex<HashMap<(String, String), CircuitState>>>,
    event_bus: Option<Arc<EventBus>>,
}

impl CircuitBreaker {
    /// Build a breaker from a level list. Order matters for `check_all`:
    /// put the narrowest scope first.
    pub fn new(policies: Vec<LevelPolicy>) -> Self {
        let shards = (0..SHARD_COUNT)
            .map(|_| Mutex::new(HashMap::new()))
            .collect();
        Self {
            policies,
            shards,
            event_bus: None,
        }
    }

    /// Publish circuit transitions on the domain event bus.
    pub fn with_event_bus(mut self, bus: Arc<EventBus>) -> Self {
        self.event_bus = Some(bus);
        self
    }

    /// The configured level names, in check order.
    pub fn levels(&self) -> impl Iterator<Item = &str> {
        self.policies.iter().map(|p| p.level.as_str())
    }

    /// Gate one call at one level. `Ok` means the call may proceed.
    pub fn check(&self, level: &str, key: &str) -> Result<(), GateError> {
        self.check_at(level, key, Instant::now())
    }

    /// Gate one call across several (level, key) pairs, short-circuiting at
    /// the first open circuit. Pass pairs narrowest scope first so a single
    /// call gates dispatch at every granularity without redundant work.
    pub fn check_all(&self, pairs: &[(&str, &str)]) -> Result<(), GateError> {
        let now = Instant::now();
        for (level, key) in pairs {
            self.check_at(level, key, now)?;
        }
        Ok(())
    }

    /// Record a failure observation at one level.
    pub fn record_failure(&self, level: &str, key: &str) {
        self.record_failure_at(level, key, Instant::now());
    }

    /// Record a success observation at one level.
    pub fn record_success(&self, level: &str, key: &str) {
        self.record_success_at(level, key, Instant::now());
    }

    pub(crate) fn check_at(&self, level: &str, key: &str, now: Instant) -> Result<(), GateError> {
        let Some(policy) = self.policy(level) else {
            // Unconfigured level never gates.
            debug!(level, "Circuit check for unconfigured level");
            return Ok(());
        };

        let mut shard = self.shard(level, key);
        let entry_key = (level.to_string(), key.to_string());
        let Some(circuit) = shard.get_mut(&entry_key) else {
            return Ok(());
        };

        let mut drained = false;
        let verdict = match circuit.state {
            State::Closed => {
                // A closed circuit whose failures have all aged out is done;
                // drop it so dormant keys don't accumulate.
                circuit.prune(policy.window, now);
                drained = circuit.failures.is_empty();
                Ok(())
            }
            State::HalfOpen => Ok(()),
            State::Open => {
                let opened_at = circuit.opened_at.unwrap_or(now);
                if now.duration_since(opened_at) >= policy.cooldown {
                    // Cooldown elapsed: let one probe call through.
                    circuit.state = State::HalfOpen;
                    debug!(level, key, "Circuit half-open, probing");
                    Ok(())
                } else {
                    Err(GateError::CircuitOpen {
                        level: level.to_string(),
                        key: key.to_string(),
                    })
                }
            }
        };
        if drained {
            shard.remove(&entry_key);
        }
        verdict
    }

    pub(crate) fn record_failure_at(&self, level: &str, key: &str, now: Instant) {
        let Some(policy) = self.policy(level).cloned() else {
            return;
        };

        let mut shard = self.shard(level, key);
        let circuit = shard
            .entry((level.to_string(), key.to_string()))
            .or_insert_with(CircuitState::new);

        circuit.failures.push_back(now);
        circuit.prune(policy.window, now);

        let tripped = match circuit.state {
            State::HalfOpen => true,
            State::Closed => circuit.failures.len() >= policy.threshold,
            State::Open => false,
        };

        if tripped {
            circuit.state = State::Open;
            circuit.opened_at = Some(now);
            warn!(
                level,
                key,
                failures = circuit.failures.len(),
                "Circuit opened"
            );
            if let Some(bus) = &self.event_bus {
                bus.publish(DomainEvent::CircuitOpened {
                    level: level.to_string(),
                    key: key.to_string(),
                    timestamp: Utc::now(),
                });
            }
        }
    }

    pub(crate) fn record_success_at(&self, level: &str, key: &str, now: Instant) {
        let Some(policy) = self.policy(level).cloned() else {
            return;
        };

        let mut shard = self.shard(level, key);
        let entry_key = (level.to_string(), key.to_string());
        let Some(circuit) = shard.get_mut(&entry_key) else {
            return;
        };

        match circuit.state {
            State::HalfOpen => {
                circuit.state = State::Closed;
                circuit.opened_at = None;
                circuit.failures.clear();
                debug!(level, key, "Circuit closed after successful probe");
                if let Some(bus) = &self.event_bus {
                    bus.publish(DomainEvent::CircuitClosed {
                        level: level.to_string(),
                        key: key.to_string(),
                        timestamp: Utc::now(),
                    });
                }
            }
            State::Closed => {
                if policy.reset_on_success {
                    circuit.failures.clear();
                } else {
                    circuit.prune(policy.window, now);
                }
            }
            State::Open => {}
        }

        // Lifecycle: empty closed circuits are dropped entirely.
        if circuit.state == State::Closed && circuit.failures.is_empty() {
            shard.remove(&entry_key);
        }
    }

    /// Number of tracked (level, key) circuits, for observability.
    pub fn tracked_circuits(&self) -> usize {
        self.shards.iter().map(|s| s.lock().unwrap().len()).sum()
    }

    fn policy(&self, level: &str) -> Option<&LevelPolicy> {
        self.policies.iter().find(|p| p.level == level)
    }

    fn shard(
        &self,
        level: &str,
        key: &str,
    ) -> std::sync::MutexGuard<'_, HashMap<(String, String), CircuitState>> {
        let mut hasher = DefaultHasher::new();
        level.hash(&mut hasher);
        key.hash(&mut hasher);
        let idx = (hasher.finish() as usize) % SHARD_COUNT;
        self.shards[idx].lock().unwrap()
    }
}
