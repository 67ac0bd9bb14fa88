//! `dispatch_agent` validation.
//!
//! Requests are validated before anything is queued: the requested scope
//! must be a subset of the dispatcher's own scope, every skill must exist,
//! and batch/active caps hold. A failed request never spawns an agent;
//! the paired tool result tells the LLM what to fix.

use std::collections::BTreeSet;
use tracing::debug;
use uuid::Uuid;

use hivemind_core::agent::{AgentSpec, DispatchRequest, Scope};
use hivemind_core::error::DispatchError;
use hivemind_core::message::ConversationId;
use hivemind_core::skill::SkillRegistry;

/// Caps applied to a dispatch batch.
#[derive(Debug, Clone, Copy)]
pub struct DispatchLimits {
    /// Maximum agents in one batch
    pub max_agents_per_batch: usize,

    /// Maximum live sub-agents per conversation
    pub max_active_agents: usize,
}

/// Validates dispatch batches against the registry and the caller's scope.
pub struct DispatchValidator<'a> {
    registry: &'a dyn SkillRegistry,
    limits: DispatchLimits,
}

/// Per-request verdicts, in request order, paired with the originating tool
/// call id so the engine can answer each call individually.
pub type BatchVerdict = Vec<(String, Result<AgentSpec, DispatchError>)>;

impl<'a> DispatchValidator<'a> {
    pub fn new(registry: &'a dyn SkillRegistry, limits: DispatchLimits) -> Self {
        Self { registry, limits }
    }

    /// Validate a batch of `dispatch_agent` requests from one loop iteration.
    ///
    /// `queued_ids` are siblings already pending from earlier iterations:
    /// new requests may depend on them. `active_agents` counts live agents
    /// plus pending specs for the cap check.
    pub fn validate_batch(
        &self,
        requests: Vec<DispatchRequest>,
        parent_scope: &Scope,
        parent_conversation_id: &ConversationId,
        queued_ids: &BTreeSet<String>,
        active_agents: usize,
    ) -> BatchVerdict {
        if requests.len() > self.limits.max_agents_per_batch {
            let err = DispatchError::BatchLimitExceeded {
                requested: requests.len(),
                limit: self.limits.max_agents_per_batch,
            };
            return requests
                .into_iter()
                .map(|r| (r.call_id, Err(err.clone())))
                .collect();
        }

        // Ids visible to depends_on: already-queued siblings plus every id
        // in this batch (forward references within a batch are allowed).
        let mut known_ids = queued_ids.clone();
        let batch_ids: Vec<String> = requests
            .iter()
            .map(|r| {
                r.agent_id
                    .clone()
                    .unwrap_or_else(|| format!("agent_{}", &Uuid::new_v4().to_string()[..8]))
            })
            .collect();
        known_ids.extend(batch_ids.iter().cloned());

        let mut accepted = 0usize;
        let mut seen: BTreeSet<String> = BTreeSet::new();
        requests
            .into_iter()
            .zip(batch_ids)
            .map(|(request, agent_id)| {
                let call_id = request.call_id.clone();
                let verdict = self.validate_one(
                    request,
                    agent_id,
                    parent_scope,
                    parent_conversation_id,
                    queued_ids,
                    &known_ids,
                    &mut seen,
                    active_agents + accepted,
                );
                if verdict.is_ok() {
                    accepted += 1;
                }
                (call_id, verdict)
            })
            .collect()
    }

    #[allow(clippy::too_many_arguments)]
    fn validate_one(
        &self,
        request: DispatchRequest,
        agent_id: String,
        parent_scope: &Scope,
        parent_conversation_id: &ConversationId,
        queued_ids: &BTreeSet<String>,
        known_ids: &BTreeSet<String>,
        seen: &mut BTreeSet<String>,
        occupancy: usize,
    ) -> Result<AgentSpec, DispatchError> {
        if request.mission.trim().is_empty() {
            return Err(DispatchError::EmptyMission);
        }

        if occupancy >= self.limits.max_active_agents {
            return Err(DispatchError::TooManyActiveAgents {
                active: occupancy,
                limit: self.limits.max_active_agents,
            });
        }

        if queued_ids.contains(&agent_id) || !seen.insert(agent_id.clone()) {
            return Err(DispatchError::DuplicateAgentId(agent_id));
        }

        for skill in &request.scope {
            if !self.registry.contains(skill) {
                return Err(DispatchError::UnknownSkill(skill.clone()));
            }
            if !parent_scope.allows(skill) {
                debug!(skill, agent_id, "Scope escalation rejected");
                return Err(DispatchError::ScopeEscalation {
                    skill: skill.clone(),
                });
            }
        }

        let mut depends_on = BTreeSet::new();
        for dep in &request.depends_on {
            if dep == &agent_id || !known_ids.contains(dep) {
                return Err(DispatchError::UnknownDependency {
                    agent_id,
                    depends_on: dep.clone(),
                });
            }
            depends_on.insert(dep.clone());
        }

        Ok(AgentSpec {
            agent_id,
            mission: request.mission,
            scope: Scope::new(request.scope),
            depends_on,
            parent_conversation_id: parent_conversation_id.clone(),
        })
    }
}
