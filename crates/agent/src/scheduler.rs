//! Wave scheduling for dispatched agents.
//!
//! Dependencies within a batch form a DAG; Kahn's algorithm layers it into
//! waves, everything in a wave runs concurrently, and a cycle is a
//! structural error raised before any agent starts. Crashes never cascade
//! as panics: each agent runs in its own task and failure is an outcome,
//! with dependents of a failed agent skipped transitively.

use std::collections::{BTreeSet, HashMap};

use chrono::Utc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use hivemind_core::agent::{AgentOutcome, AgentResult, AgentSpec};
use hivemind_core::error::{GateError, Result, ScheduleError};
use hivemind_core::event::DomainEvent;

use crate::context::AgentContext;
use crate::sub_agent::{HelpRequest, SubAgent};

/// Layer a batch into dependency waves.
///
/// Only edges between batch members order the waves; a dependency on an
/// agent outside the batch is a runtime concern, not a planning one. An
/// unbreakable remainder means a cycle, reported with every involved id.
pub fn plan_waves(specs: &[AgentSpec]) -> std::result::Result<Vec<Vec<AgentSpec>>, ScheduleError> {
    let batch_ids: BTreeSet<&str> = specs.iter().map(|s| s.agent_id.as_str()).collect();
    let mut remaining: Vec<AgentSpec> = specs.to_vec();
    let mut placed: BTreeSet<String> = BTreeSet::new();
    let mut waves = Vec::new();

    while !remaining.is_empty() {
        let (ready, blocked): (Vec<AgentSpec>, Vec<AgentSpec>) =
            remaining.into_iter().partition(|spec| {
                spec.depends_on
                    .iter()
                    .all(|dep| placed.contains(dep) || !batch_ids.contains(dep.as_str()))
            });

        if ready.is_empty() {
            let mut cycle: Vec<String> = blocked.into_iter().map(|s| s.agent_id).collect();
            cycle.sort();
            return Err(ScheduleError::CycleDetected(cycle));
        }

        placed.extend(ready.iter().map(|s| s.agent_id.clone()));
        waves.push(ready);
        remaining = blocked;
    }

    Ok(waves)
}

/// Runs validated batches of agents wave by wave.
#[derive(Clone)]
pub struct AgentScheduler {
    ctx: AgentContext,
}

impl AgentScheduler {
    pub fn new(ctx: AgentContext) -> Self {
        Self { ctx }
    }

    /// Run one batch to completion and report a terminal outcome for every
    /// spec.
    ///
    /// `prior` holds outcomes from earlier batches of the same
    /// conversation; dependencies resolve against it when the sibling is
    /// not part of this batch. `updates` are notes queued via
    /// `send_agent_update` before the batch started, delivered into each
    /// agent's mailbox at spawn.
    ///
    /// A cycle fails the whole batch before anything runs. A gate
    /// rejection marks the rejected wave and everything after it
    /// `GateRejected` — retryable, unlike a crash.
    pub async fn run_batch(
        &self,
        specs: Vec<AgentSpec>,
        prior: &HashMap<String, AgentOutcome>,
        updates: &HashMap<String, Vec<String>>,
        help_tx: mpsc::Sender<HelpRequest>,
    ) -> Result<HashMap<String, AgentOutcome>> {
        let waves = plan_waves(&specs)?;

        let mut outcomes: HashMap<String, AgentOutcome> = HashMap::new();
        let mut results: HashMap<String, AgentResult> = HashMap::new();
        for outcome in prior.values() {
            if let AgentOutcome::Completed(result) = outcome {
                results.insert(result.agent_id.clone(), result.clone());
            }
        }
        let mut gate_closed: Option<GateError> = None;

        for (wave_index, wave) in waves.into_iter().enumerate() {
            let mut runnable = Vec::new();
            for spec in wave {
                if let Some(gate) = &gate_closed {
                    self.finish(
                        &mut outcomes,
                        AgentOutcome::GateRejected {
                            agent_id: spec.agent_id.clone(),
                            gate: gate.clone(),
                        },
                        &spec.parent_conversation_id.to_string(),
                    );
                    continue;
                }
                let blocked_on = spec.depends_on.iter().find_map(|dep| {
                    match outcomes.get(dep).or_else(|| prior.get(dep)) {
                        Some(AgentOutcome::Completed(_)) => None,
                        // A skipped dependency already names the failure root;
                        // report that, not the intermediate link.
                        Some(AgentOutcome::Skipped { blocked_on, .. }) => {
                            Some(blocked_on.clone())
                        }
                        _ => Some(dep.clone()),
                    }
                });
                if let Some(blocked_on) = blocked_on {
                    self.finish(
                        &mut outcomes,
                        AgentOutcome::Skipped {
                            agent_id: spec.agent_id.clone(),
                            blocked_on,
                        },
                        &spec.parent_conversation_id.to_string(),
                    );
                    continue;
                }
                runnable.push(spec);
            }

            if runnable.is_empty() {
                continue;
            }

            if let Err(gate) = self.gate_wave(&runnable) {
                warn!(wave = wave_index, %gate, "Wave rejected by a resource gate");
                for spec in runnable {
                    self.finish(
                        &mut outcomes,
                        AgentOutcome::GateRejected {
                            agent_id: spec.agent_id.clone(),
                            gate: gate.clone(),
                        },
                        &spec.parent_conversation_id.to_string(),
                    );
                }
                gate_closed = Some(gate);
                continue;
            }

            let handles = self.spawn_wave(runnable, wave_index, &results, updates, &help_tx);
            let (wave_specs, joins): (Vec<_>, Vec<_>) = handles.into_iter().unzip();
            let joined = futures::future::join_all(joins).await;
            for (spec, join) in wave_specs.into_iter().zip(joined) {
                let conv_key = spec.parent_conversation_id.to_string();
                let outcome = match join {
                    Ok(Ok(result)) => {
                        results.insert(result.agent_id.clone(), result.clone());
                        AgentOutcome::Completed(result)
                    }
                    Ok(Err(err)) => {
                        self.ctx.breaker.record_failure("conversation", &conv_key);
                        AgentOutcome::Crashed {
                            agent_id: spec.agent_id.clone(),
                            reason: err.to_string(),
                        }
                    }
                    Err(join_err) => {
                        self.ctx.breaker.record_failure("conversation", &conv_key);
                        let reason = if join_err.is_panic() {
                            "agent task panicked".to_string()
                        } else {
                            "agent task was cancelled".to_string()
                        };
                        AgentOutcome::Crashed {
                            agent_id: spec.agent_id.clone(),
                            reason,
                        }
                    }
                };
                self.finish(&mut outcomes, outcome, &conv_key);
            }
        }

        Ok(outcomes)
    }

    fn gate_wave(&self, wave: &[AgentSpec]) -> std::result::Result<(), GateError> {
        let conv_key = wave[0].parent_conversation_id.to_string();
        self.ctx
            .breaker
            .check_all(&[("conversation", &conv_key), ("system", "dispatch")])?;
        if let Some(rule) = self.ctx.config.rate_rule("dispatch") {
            // All or nothing: a wave never starts half its agents.
            self.ctx.limiter.check_and_record_n(
                &format!("dispatch:{conv_key}"),
                rule.window(),
                rule.limit,
                wave.len(),
            )?;
        }
        Ok(())
    }

    fn spawn_wave(
        &self,
        wave: Vec<AgentSpec>,
        wave_index: usize,
        results: &HashMap<String, AgentResult>,
        updates: &HashMap<String, Vec<String>>,
        help_tx: &mpsc::Sender<HelpRequest>,
    ) -> Vec<(AgentSpec, JoinHandle<Result<AgentResult>>)> {
        wave.into_iter()
            .map(|spec| {
                let dependency_results: Vec<AgentResult> = spec
                    .depends_on
                    .iter()
                    .filter_map(|dep| results.get(dep).cloned())
                    .collect();
                let (agent, handle) = SubAgent::new(
                    spec.clone(),
                    self.ctx.clone(),
                    help_tx.clone(),
                    dependency_results,
                );
                if let Some(notes) = updates.get(&spec.agent_id) {
                    for note in notes {
                        handle.send_update(note.clone());
                    }
                }
                self.ctx.event_bus.publish(DomainEvent::AgentSpawned {
                    conversation_id: spec.parent_conversation_id.to_string(),
                    agent_id: spec.agent_id.clone(),
                    wave: wave_index,
                    timestamp: Utc::now(),
                });
                info!(
                    agent_id = %spec.agent_id,
                    wave = wave_index,
                    "Spawning sub-agent"
                );
                let join = tokio::spawn(agent.run());
                (spec, join)
            })
            .collect()
    }

    fn finish(
        &self,
        outcomes: &mut HashMap<String, AgentOutcome>,
        outcome: AgentOutcome,
        conv_key: &str,
    ) {
        let label = match &outcome {
            AgentOutcome::Completed(_) => "completed",
            AgentOutcome::Crashed { .. } => "crashed",
            AgentOutcome::Skipped { .. } => "skipped",
            AgentOutcome::GateRejected { .. } => "gate_rejected",
        };
        self.ctx.event_bus.publish(DomainEvent::AgentFinished {
            conversation_id: conv_key.to_string(),
            agent_id: outcome.agent_id().to_string(),
            outcome: label.to_string(),
            timestamp: Utc::now(),
        });
        outcomes.insert(outcome.agent_id().to_string(), outcome);
    }
}
