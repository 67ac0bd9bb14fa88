//! The per-conversation engine actor.
//!
//! One tokio task owns one `Conversation` exclusively; everything else
//! talks to it through a command mailbox. A turn is one user message driven
//! through the tool loop to a terminal decision, with an iteration budget
//! that truncates instead of looping forever. The engine is also where the
//! dispatch protocol becomes side effects: validated specs are queued, a
//! `get_agent_results` call runs them through the scheduler, and help
//! requests from paused sub-agents are answered between waves.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use serde_json::json;
use tokio::sync::{mpsc, oneshot};
use tokio::time::timeout;
use tracing::{debug, info, warn};

use hivemind_agent::loop_runner::{deferred_result, malformed_result};
use hivemind_agent::{
    AgentContext, AgentScheduler, AwaitCall, HelpRequest, LoopDecision, ToolInvocation, decide,
};
use hivemind_core::agent::{AgentOutcome, AgentSpec, DispatchRequest, Scope};
use hivemind_core::error::{Error, LlmError, Result};
use hivemind_core::event::DomainEvent;
use hivemind_core::llm::{LlmRequest, LlmResponse};
use hivemind_core::message::{
    Conversation, ConversationId, ConversationStatus, Message, TokenUsage,
};
use hivemind_core::skill::{ExecutionContext, SkillRegistry};
use hivemind_core::store::ConversationStore;
use hivemind_dispatch::{
    DispatchLimits, DispatchValidator, SendAgentUpdateArgs, get_skill, meta_tool_definitions,
};

const COMMAND_MAILBOX: usize = 32;

const SYSTEM_PROMPT: &str = "You are an orchestrator. You know no skills up front: call \
    get_skill to discover what is installed, call skills directly by their qualified \
    'domain.skill' name, and use dispatch_agent to delegate independent work to scoped \
    sub-agents. Collect delegated work with get_agent_results before answering. Reply \
    with plain text (no tool calls) when the user's request is done.";

/// Commands accepted by a running engine actor.
pub enum EngineCommand {
    /// Run one full turn and reply with the final answer
    SendMessage {
        content: String,
        reply_tx: oneshot::Sender<Result<String>>,
    },

    /// Snapshot the conversation state without mutating it
    GetState { reply_tx: oneshot::Sender<EngineState> },

    /// Stop the actor after persisting
    Stop,
}

/// A read-only snapshot of one engine's conversation.
#[derive(Debug, Clone)]
pub struct EngineState {
    pub conversation_id: ConversationId,
    pub status: ConversationStatus,
    pub iteration_count: u32,
    pub token_usage: TokenUsage,
    pub message_count: usize,
    pub queued_agents: usize,
    pub finished_agents: usize,
}

/// Cheap, cloneable handle to one engine actor.
#[derive(Clone)]
pub struct EngineHandle {
    pub conversation_id: ConversationId,
    tx: mpsc::Sender<EngineCommand>,
}

impl EngineHandle {
    /// Run one turn. Errors out if the actor is gone.
    pub async fn send_message(&self, content: impl Into<String>) -> Result<String> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(EngineCommand::SendMessage {
                content: content.into(),
                reply_tx,
            })
            .await
            .map_err(|_| Error::EngineStopped(self.conversation_id.to_string()))?;
        reply_rx
            .await
            .map_err(|_| Error::EngineStopped(self.conversation_id.to_string()))?
    }

    pub async fn state(&self) -> Result<EngineState> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(EngineCommand::GetState { reply_tx })
            .await
            .map_err(|_| Error::EngineStopped(self.conversation_id.to_string()))?;
        reply_rx
            .await
            .map_err(|_| Error::EngineStopped(self.conversation_id.to_string()))
    }

    /// Ask the actor to persist and stop. Idempotent.
    pub async fn stop(&self) {
        let _ = self.tx.send(EngineCommand::Stop).await;
    }

    pub fn is_alive(&self) -> bool {
        !self.tx.is_closed()
    }
}

/// The conversation actor.
pub struct Engine {
    conversation: Conversation,
    ctx: AgentContext,
    store: Arc<dyn ConversationStore>,
    scheduler: AgentScheduler,
    scope: Scope,
    queued: Vec<AgentSpec>,
    agent_outcomes: HashMap<String, AgentOutcome>,
    pending_updates: HashMap<String, Vec<String>>,
}

impl Engine {
    /// Spawn the actor and return its handle.
    pub fn spawn(
        conversation: Conversation,
        ctx: AgentContext,
        store: Arc<dyn ConversationStore>,
    ) -> EngineHandle {
        let (tx, rx) = mpsc::channel(COMMAND_MAILBOX);
        let handle = EngineHandle {
            conversation_id: conversation.id.clone(),
            tx,
        };
        let scope = full_scope(ctx.registry.as_ref());
        let engine = Self {
            conversation,
            scheduler: AgentScheduler::new(ctx.clone()),
            ctx,
            store,
            scope,
            queued: Vec::new(),
            agent_outcomes: HashMap::new(),
            pending_updates: HashMap::new(),
        };
        tokio::spawn(engine.run(rx));
        handle
    }

    async fn run(mut self, mut rx: mpsc::Receiver<EngineCommand>) {
        let idle = Duration::from_secs(self.ctx.config.engine.idle_timeout_secs);
        info!(conversation_id = %self.conversation.id, "Engine started");

        loop {
            let command = tokio::select! {
                command = rx.recv() => match command {
                    Some(command) => command,
                    None => break,
                },
                _ = tokio::time::sleep(idle) => {
                    info!(conversation_id = %self.conversation.id, "Engine idle, stopping");
                    break;
                }
            };

            match command {
                EngineCommand::SendMessage { content, reply_tx } => {
                    let result = self.handle_turn(content).await;
                    let _ = reply_tx.send(result);
                }
                EngineCommand::GetState { reply_tx } => {
                    let _ = reply_tx.send(self.snapshot());
                }
                EngineCommand::Stop => break,
            }
        }

        if let Err(err) = self.store.save(&self.conversation).await {
            warn!(
                conversation_id = %self.conversation.id,
                error = %err,
                "Final persist failed on shutdown"
            );
        }
        info!(conversation_id = %self.conversation.id, "Engine stopped");
    }

    fn snapshot(&self) -> EngineState {
        EngineState {
            conversation_id: self.conversation.id.clone(),
            status: self.conversation.status,
            iteration_count: self.conversation.iteration_count,
            token_usage: self.conversation.token_usage,
            message_count: self.conversation.messages.len(),
            queued_agents: self.queued.len(),
            finished_agents: self.agent_outcomes.len(),
        }
    }

    /// One user message to one final answer.
    async fn handle_turn(&mut self, content: String) -> Result<String> {
        if self.conversation.messages.is_empty() {
            self.conversation.push(Message::system(SYSTEM_PROMPT));
        }
        self.conversation.status = ConversationStatus::Running;
        self.conversation.iteration_count = 0;
        self.conversation.push(Message::user(content));

        let max_iterations = self.ctx.config.engine.max_iterations;
        let mut truncated = false;

        let answer = loop {
            if self.conversation.iteration_count >= max_iterations {
                truncated = true;
                warn!(
                    conversation_id = %self.conversation.id,
                    max_iterations,
                    "Iteration budget exhausted, truncating turn"
                );
                break self.truncation_answer(max_iterations);
            }
            self.conversation.iteration_count += 1;

            self.admit_llm_call()?;
            let response = self.complete().await?;
            self.conversation.push(response.to_message());

            match decide(&response) {
                LoopDecision::Final(text) => break text,
                LoopDecision::Empty => {
                    self.conversation.status = ConversationStatus::Failed;
                    return Err(Error::Llm(LlmError::EmptyResponse));
                }
                LoopDecision::Continue(invocations) => {
                    self.handle_invocations(invocations).await;
                }
                LoopDecision::Dispatch { requests, rest } => {
                    self.handle_dispatch(requests);
                    self.handle_invocations(rest).await;
                }
                LoopDecision::AwaitResults { calls, rest } => {
                    self.handle_await(calls).await;
                    self.handle_invocations(rest).await;
                }
            }

            self.maybe_persist().await;
        };

        self.conversation.status = ConversationStatus::Done;
        self.ctx.event_bus.publish(DomainEvent::TurnCompleted {
            conversation_id: self.conversation.id.to_string(),
            iterations: self.conversation.iteration_count,
            truncated,
            timestamp: Utc::now(),
        });
        if let Err(err) = self.store.save(&self.conversation).await {
            warn!(conversation_id = %self.conversation.id, error = %err, "Persist failed");
        }
        Ok(answer)
    }

    fn truncation_answer(&self, max_iterations: u32) -> String {
        let progress = self
            .conversation
            .last_assistant_text()
            .unwrap_or("No final answer was produced.");
        format!("[truncated after {max_iterations} iterations] {progress}")
    }

    /// Gate the next LLM call. The engine does not back off; a gate failure
    /// surfaces to the caller as a retryable error.
    fn admit_llm_call(&self) -> Result<()> {
        let conv_key = self.conversation.id.to_string();
        self.ctx
            .breaker
            .check_all(&[("conversation", &conv_key), ("system", "llm")])
            .map_err(Error::Gate)?;
        if let Some(rule) = self.ctx.config.rate_rule("llm") {
            self.ctx
                .limiter
                .check_and_record(&format!("llm:{conv_key}"), rule.window(), rule.limit)
                .map_err(Error::Gate)?;
        }
        Ok(())
    }

    async fn complete(&mut self) -> Result<LlmResponse> {
        let llm = &self.ctx.config.llm;
        let request = LlmRequest {
            model: llm.model.clone(),
            messages: self.conversation.messages.clone(),
            temperature: llm.temperature,
            max_tokens: Some(llm.max_tokens),
            tools: meta_tool_definitions(),
        };
        let deadline = Duration::from_secs(llm.timeout_secs);
        let conv_key = self.conversation.id.to_string();

        let outcome = timeout(deadline, self.ctx.llm.chat_completion(request)).await;
        match outcome {
            Ok(Ok(response)) => {
                self.ctx.breaker.record_success("conversation", &conv_key);
                self.ctx.breaker.record_success("system", "llm");
                if let Some(usage) = response.usage {
                    self.conversation.token_usage.accumulate(
                        usage.prompt_tokens,
                        usage.completion_tokens,
                        usage.total_tokens,
                    );
                    self.ctx.event_bus.publish(DomainEvent::TokenUsageUpdated {
                        conversation_id: conv_key,
                        usage: self.conversation.token_usage,
                        timestamp: Utc::now(),
                    });
                }
                Ok(response)
            }
            Ok(Err(err)) => {
                self.ctx.breaker.record_failure("conversation", &conv_key);
                self.ctx.breaker.record_failure("system", "llm");
                self.conversation.status = ConversationStatus::Failed;
                Err(Error::Llm(err))
            }
            Err(_) => {
                self.ctx.breaker.record_failure("conversation", &conv_key);
                self.ctx.breaker.record_failure("system", "llm");
                self.conversation.status = ConversationStatus::Failed;
                Err(Error::Llm(LlmError::Timeout {
                    timeout_secs: llm.timeout_secs,
                }))
            }
        }
    }

    async fn handle_invocations(&mut self, invocations: Vec<ToolInvocation>) {
        for invocation in invocations {
            match invocation {
                ToolInvocation::Skill {
                    call_id,
                    skill,
                    params,
                } => {
                    let content = self.execute_skill(&skill, params).await;
                    self.conversation.push(Message::tool_result(call_id, content));
                }
                ToolInvocation::GetSkill { call_id, args } => {
                    let payload = get_skill(self.ctx.registry.as_ref(), &args);
                    self.conversation
                        .push(Message::tool_result(call_id, payload.to_string()));
                }
                ToolInvocation::SendAgentUpdate { call_id, args } => {
                    let content = self.route_update(args);
                    self.conversation.push(Message::tool_result(call_id, content));
                }
                ToolInvocation::RequestHelp { call_id, .. } => {
                    self.conversation.push(Message::tool_result(
                        call_id,
                        "request_help is only available to sub-agents.",
                    ));
                }
                ToolInvocation::Malformed {
                    call_id,
                    tool,
                    error,
                } => {
                    self.conversation
                        .push(Message::tool_result(call_id, malformed_result(&tool, &error)));
                }
                ToolInvocation::Deferred { call_id, tool } => {
                    self.conversation
                        .push(Message::tool_result(call_id, deferred_result(&tool)));
                }
            }
        }
    }

    /// Execute one skill directly from the engine loop.
    async fn execute_skill(&self, skill: &str, params: serde_json::Value) -> String {
        if !self.ctx.registry.contains(skill) {
            return format!(
                "Unknown skill '{skill}'. Call get_skill to discover what is installed."
            );
        }

        let domain = skill.split_once('.').map(|(d, _)| d).unwrap_or(skill);
        let conv_key = self.conversation.id.to_string();
        if let Err(gate) = self.ctx.breaker.check_all(&[
            ("skill", skill),
            ("domain", domain),
            ("conversation", &conv_key),
            ("system", "skills"),
        ]) {
            return format!("Skill temporarily unavailable: {gate}. Try another approach.");
        }

        let context = ExecutionContext {
            conversation_id: self.conversation.id.clone(),
            agent_id: None,
        };
        let started = Instant::now();
        let outcome = self.ctx.executor.execute(skill, params, &context).await;
        let success = matches!(&outcome, Ok(result) if result.success);

        self.ctx.event_bus.publish(DomainEvent::SkillExecuted {
            skill: skill.to_string(),
            agent_id: None,
            success,
            duration_ms: started.elapsed().as_millis() as u64,
            timestamp: Utc::now(),
        });

        match outcome {
            Ok(result) => {
                if result.success {
                    self.ctx.breaker.record_success("skill", skill);
                    self.ctx.breaker.record_success("domain", domain);
                } else {
                    self.ctx.breaker.record_failure("skill", skill);
                    self.ctx.breaker.record_failure("domain", domain);
                }
                result.content
            }
            Err(err) => {
                self.ctx.breaker.record_failure("skill", skill);
                self.ctx.breaker.record_failure("domain", domain);
                self.ctx.breaker.record_failure("conversation", &conv_key);
                self.ctx.breaker.record_failure("system", "skills");
                format!("Skill failed: {err}")
            }
        }
    }

    /// Validate a dispatch batch and queue what passes. Every tool call
    /// gets an individual verdict; a rejection never cancels its siblings.
    fn handle_dispatch(&mut self, requests: Vec<DispatchRequest>) {
        let known_ids: BTreeSet<String> = self
            .queued
            .iter()
            .map(|s| s.agent_id.clone())
            .chain(self.agent_outcomes.keys().cloned())
            .collect();
        let limits = DispatchLimits {
            max_agents_per_batch: self.ctx.config.dispatch.max_agents_per_batch,
            max_active_agents: self.ctx.config.dispatch.max_active_agents,
        };
        let validator = DispatchValidator::new(self.ctx.registry.as_ref(), limits);
        let verdicts = validator.validate_batch(
            requests,
            &self.scope,
            &self.conversation.id,
            &known_ids,
            self.queued.len(),
        );

        for (call_id, verdict) in verdicts {
            let content = match verdict {
                Ok(spec) => {
                    debug!(
                        conversation_id = %self.conversation.id,
                        agent_id = %spec.agent_id,
                        "Agent queued"
                    );
                    let ack = json!({
                        "agent_id": spec.agent_id,
                        "status": "queued",
                        "note": "call get_agent_results to run queued agents"
                    })
                    .to_string();
                    self.queued.push(spec);
                    ack
                }
                Err(err) => format!("Dispatch rejected: {err}"),
            };
            self.conversation.push(Message::tool_result(call_id, content));
        }
    }

    /// Route a best-effort update toward a queued agent.
    fn route_update(&mut self, args: SendAgentUpdateArgs) -> String {
        if let Some(outcome) = self.agent_outcomes.get(&args.agent_id) {
            let label = match outcome {
                AgentOutcome::Completed(_) => "completed",
                AgentOutcome::Crashed { .. } => "crashed",
                AgentOutcome::Skipped { .. } => "skipped",
                AgentOutcome::GateRejected { .. } => "gate_rejected",
            };
            return format!("Agent '{}' already finished ({label}); update dropped.", args.agent_id);
        }
        if self.queued.iter().any(|s| s.agent_id == args.agent_id) {
            self.pending_updates
                .entry(args.agent_id.clone())
                .or_default()
                .push(args.message);
            format!(
                "Update queued for agent '{}'. Delivery is best-effort.",
                args.agent_id
            )
        } else {
            format!("Unknown agent id '{}'; nothing was delivered.", args.agent_id)
        }
    }

    /// Run the queued batch (if any), answering help requests while it
    /// runs, then answer each `get_agent_results` call.
    async fn handle_await(&mut self, calls: Vec<AwaitCall>) {
        if !self.queued.is_empty() {
            self.conversation.status = ConversationStatus::AwaitingSubAgents;
            let batch = std::mem::take(&mut self.queued);
            let updates = std::mem::take(&mut self.pending_updates);
            let scheduler = self.scheduler.clone();
            let prior = self.agent_outcomes.clone();
            let (help_tx, mut help_rx) = mpsc::channel::<HelpRequest>(16);

            let run = async move { scheduler.run_batch(batch, &prior, &updates, help_tx).await };
            tokio::pin!(run);

            let outcome = loop {
                tokio::select! {
                    result = &mut run => break result,
                    Some(help) = help_rx.recv() => {
                        self.conversation.status = ConversationStatus::AwaitingHelp;
                        self.answer_help(help).await;
                        self.conversation.status = ConversationStatus::AwaitingSubAgents;
                    }
                }
            };
            self.conversation.status = ConversationStatus::Running;

            match outcome {
                Ok(outcomes) => self.agent_outcomes.extend(outcomes),
                Err(err) => {
                    // Structural failure: the batch never started. Tell the
                    // model what was wrong so it can re-dispatch.
                    for call in calls {
                        self.conversation.push(Message::tool_result(
                            call.call_id,
                            format!("The queued batch could not be scheduled: {err}"),
                        ));
                    }
                    return;
                }
            }
        }

        for call in calls {
            let results: serde_json::Map<String, serde_json::Value> = call
                .agent_ids
                .iter()
                .map(|id| {
                    let value = match self.agent_outcomes.get(id) {
                        Some(outcome) => serde_json::to_value(outcome).unwrap_or_else(
                            |_| json!({ "outcome": "unrepresentable" }),
                        ),
                        None => json!({
                            "outcome": "unknown",
                            "message": "no agent with this id was dispatched"
                        }),
                    };
                    (id.clone(), value)
                })
                .collect();
            self.conversation.push(Message::tool_result(
                call.call_id,
                json!({ "results": results }).to_string(),
            ));
        }
    }

    /// Answer one paused sub-agent with a single side LLM call over the
    /// conversation context. Failures answer locally; the agent never hangs
    /// on its parent.
    async fn answer_help(&self, request: HelpRequest) {
        info!(
            conversation_id = %self.conversation.id,
            agent_id = %request.agent_id,
            "Answering a help request"
        );
        let llm = &self.ctx.config.llm;
        let mut messages = self.conversation.messages.clone();
        messages.push(Message::system(format!(
            "Sub-agent '{}' is paused on a question: {}\nAnswer concisely from this \
             conversation's context. Plain text only.",
            request.agent_id, request.question
        )));
        let llm_request = LlmRequest {
            model: llm.model.clone(),
            messages,
            temperature: llm.temperature,
            max_tokens: Some(llm.max_tokens),
            tools: vec![],
        };
        let deadline = Duration::from_secs(llm.timeout_secs);

        let answer = match timeout(deadline, self.ctx.llm.chat_completion(llm_request)).await {
            Ok(Ok(response)) => response
                .content
                .filter(|c| !c.trim().is_empty())
                .unwrap_or_else(|| {
                    "No guidance available; proceed with your best judgement.".to_string()
                }),
            _ => "No guidance available; proceed with your best judgement.".to_string(),
        };
        let _ = request.answer_tx.send(answer);
    }

    async fn maybe_persist(&self) {
        let every = self.ctx.config.engine.persist_every_iterations;
        if every > 0 && self.conversation.iteration_count % every == 0 {
            if let Err(err) = self.store.save(&self.conversation).await {
                warn!(
                    conversation_id = %self.conversation.id,
                    error = %err,
                    "Periodic persist failed"
                );
            }
        }
    }
}

/// The engine's own scope: everything the registry knows. Dispatched scopes
/// narrow from here.
fn full_scope(registry: &dyn SkillRegistry) -> Scope {
    registry
        .domains()
        .into_iter()
        .flat_map(|domain| registry.skills_in(&domain))
        .map(|def| def.qualified_name())
        .collect()
}
