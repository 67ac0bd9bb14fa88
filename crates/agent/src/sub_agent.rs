//! The scoped sub-agent actor.
//!
//! A sub-agent is one tokio task running a bounded tool loop over a single
//! mission. It sees only the skills in its scope plus `request_help`; scope
//! violations come back as corrective tool results, never as executions.
//! Exhausting the turn budget is a graceful completion with `truncated`
//! set, not a crash — a crash is a panic or an unrecoverable error, and the
//! scheduler isolates it through the task's `JoinHandle`.

use std::time::{Duration, Instant};

use chrono::Utc;
use serde_json::Value;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::timeout;
use tracing::{debug, info, warn};

use hivemind_core::agent::{AgentResult, AgentSpec, AgentStatus};
use hivemind_core::error::{Error, GateError, LlmError, Result};
use hivemind_core::event::DomainEvent;
use hivemind_core::llm::{LlmRequest, LlmResponse, ToolDefinition};
use hivemind_core::message::{Message, Role};
use hivemind_core::skill::ExecutionContext;
use hivemind_dispatch::request_help_definition;

use crate::context::AgentContext;
use crate::loop_runner::{self, LoopDecision, ToolInvocation};

/// Attempts to pass the gates before one LLM call is abandoned.
const GATE_RETRIES: usize = 3;

/// Queued updates a slow agent can hold before senders see a full mailbox.
const UPDATE_MAILBOX: usize = 8;

/// A question routed from a sub-agent to the conversation that dispatched
/// it. The agent's loop is suspended on `answer_tx` until the engine
/// replies or drops the sender.
#[derive(Debug)]
pub struct HelpRequest {
    pub agent_id: String,
    pub question: String,
    pub answer_tx: oneshot::Sender<String>,
}

/// Live handle to a running sub-agent, held by the scheduler.
#[derive(Debug, Clone)]
pub struct SubAgentHandle {
    pub agent_id: String,
    update_tx: mpsc::Sender<String>,
    status_rx: watch::Receiver<AgentStatus>,
}

impl SubAgentHandle {
    pub fn status(&self) -> AgentStatus {
        *self.status_rx.borrow()
    }

    /// Deliver a best-effort note. Returns false when the mailbox is full
    /// or the agent is gone; the caller reports that, it never retries.
    pub fn send_update(&self, message: impl Into<String>) -> bool {
        self.update_tx.try_send(message.into()).is_ok()
    }
}

/// One dispatched agent, ready to run.
pub struct SubAgent {
    spec: AgentSpec,
    ctx: AgentContext,
    help_tx: mpsc::Sender<HelpRequest>,
    update_rx: mpsc::Receiver<String>,
    status_tx: watch::Sender<AgentStatus>,
    dependency_results: Vec<AgentResult>,
}

impl SubAgent {
    /// Build the agent and the handle the scheduler keeps.
    ///
    /// `dependency_results` are the completed results of every sibling in
    /// `depends_on`; the scheduler guarantees they exist before this agent
    /// starts.
    pub fn new(
        spec: AgentSpec,
        ctx: AgentContext,
        help_tx: mpsc::Sender<HelpRequest>,
        dependency_results: Vec<AgentResult>,
    ) -> (Self, SubAgentHandle) {
        let (update_tx, update_rx) = mpsc::channel(UPDATE_MAILBOX);
        let (status_tx, status_rx) = watch::channel(AgentStatus::Pending);
        let handle = SubAgentHandle {
            agent_id: spec.agent_id.clone(),
            update_tx,
            status_rx,
        };
        let agent = Self {
            spec,
            ctx,
            help_tx,
            update_rx,
            status_tx,
            dependency_results,
        };
        (agent, handle)
    }

    /// Run the mission to a terminal state.
    ///
    /// `Ok` covers both a final answer and a truncated one; `Err` is a
    /// crash from the scheduler's point of view.
    pub async fn run(mut self) -> Result<AgentResult> {
        let _ = self.status_tx.send(AgentStatus::Running);
        let conv_key = self.spec.parent_conversation_id.to_string();
        let tools = self.tool_definitions();
        let max_turns = self.ctx.config.sub_agent.max_turns;

        let mut messages = vec![
            Message::system(self.system_prompt()),
            Message::user(self.spec.mission.clone()),
        ];

        info!(
            agent_id = %self.spec.agent_id,
            conversation_id = %conv_key,
            scope = self.spec.scope.len(),
            "Sub-agent starting"
        );

        for turn in 1..=max_turns {
            self.drain_updates(&mut messages);
            self.admit_llm_call(&conv_key).await?;

            let response = self.complete(&conv_key, &messages, &tools).await?;
            messages.push(response.to_message());

            match loop_runner::decide(&response) {
                LoopDecision::Final(summary) => {
                    let _ = self.status_tx.send(AgentStatus::Completed);
                    info!(agent_id = %self.spec.agent_id, turns = turn, "Sub-agent completed");
                    return Ok(AgentResult {
                        agent_id: self.spec.agent_id,
                        summary,
                        turns_used: turn,
                        truncated: false,
                    });
                }
                LoopDecision::Continue(invocations) => {
                    for invocation in invocations {
                        self.handle_invocation(invocation, &mut messages).await;
                    }
                }
                LoopDecision::Dispatch { requests, rest } => {
                    // Sub-agents never fan out further; depth stays at one.
                    for request in requests {
                        messages.push(Message::tool_result(
                            request.call_id,
                            "Sub-agents cannot dispatch agents. Use your scoped \
                             skills, or request_help if the mission needs more.",
                        ));
                    }
                    for invocation in rest {
                        self.handle_invocation(invocation, &mut messages).await;
                    }
                }
                LoopDecision::AwaitResults { calls, rest } => {
                    for call in calls {
                        messages.push(Message::tool_result(
                            call.call_id,
                            "Sub-agents have no dispatched agents to wait for.",
                        ));
                    }
                    for invocation in rest {
                        self.handle_invocation(invocation, &mut messages).await;
                    }
                }
                LoopDecision::Empty => {
                    let _ = self.status_tx.send(AgentStatus::Crashed);
                    return Err(Error::Llm(LlmError::EmptyResponse));
                }
            }
        }

        // Budget exhausted: wrap up with whatever progress exists.
        let summary = messages
            .iter()
            .rev()
            .find(|m| m.role == Role::Assistant && !m.content.is_empty())
            .map(|m| m.content.clone())
            .unwrap_or_else(|| "No final answer was produced.".to_string());

        let _ = self.status_tx.send(AgentStatus::Completed);
        warn!(
            agent_id = %self.spec.agent_id,
            max_turns,
            "Sub-agent hit its turn budget, truncating"
        );
        Ok(AgentResult {
            agent_id: self.spec.agent_id,
            summary: format!("[truncated after {max_turns} turns] {summary}"),
            turns_used: max_turns,
            truncated: true,
        })
    }

    fn system_prompt(&self) -> String {
        let scope: Vec<&str> = self.spec.scope.iter().collect();
        let mut prompt = format!(
            "You are a focused sub-agent with one mission. You may only use \
             these skills: {}. Call request_help if you are stuck. Answer \
             with plain text (no tool calls) when the mission is done.",
            scope.join(", ")
        );
        for dep in &self.dependency_results {
            prompt.push_str(&format!(
                "\n\nResult from agent '{}': {}",
                dep.agent_id, dep.summary
            ));
        }
        prompt
    }

    /// The scoped skill definitions plus `request_help`. Skills outside the
    /// scope are simply not offered.
    fn tool_definitions(&self) -> Vec<ToolDefinition> {
        let mut tools: Vec<ToolDefinition> = self
            .spec
            .scope
            .iter()
            .filter_map(|qualified| {
                let (domain, name) = qualified.split_once('.')?;
                self.ctx.registry.get(domain, name)
            })
            .map(|def| ToolDefinition {
                name: def.qualified_name(),
                description: def.description.clone(),
                parameters: def.parameters.clone(),
            })
            .collect();
        tools.push(request_help_definition());
        tools
    }

    fn drain_updates(&mut self, messages: &mut Vec<Message>) {
        while let Ok(update) = self.update_rx.try_recv() {
            debug!(agent_id = %self.spec.agent_id, "Update received");
            messages.push(Message::system(format!(
                "Update from the dispatching conversation: {update}"
            )));
        }
    }

    /// Pass both gates or give up after a few backoffs. Gate failures are
    /// back-pressure; only repeated rejection becomes a crash.
    async fn admit_llm_call(&self, conv_key: &str) -> Result<()> {
        let mut attempt = 0;
        loop {
            match self.try_gates(conv_key) {
                Ok(()) => return Ok(()),
                Err(gate) => {
                    attempt += 1;
                    if attempt >= GATE_RETRIES {
                        let _ = self.status_tx.send(AgentStatus::Crashed);
                        return Err(Error::Gate(gate));
                    }
                    let backoff = match &gate {
                        GateError::RateLimited { retry_after_ms, .. } => {
                            Duration::from_millis((*retry_after_ms).clamp(100, 30_000))
                        }
                        GateError::CircuitOpen { .. } => Duration::from_secs(2),
                    };
                    warn!(
                        agent_id = %self.spec.agent_id,
                        %gate,
                        attempt,
                        "Gate rejected LLM call, backing off"
                    );
                    tokio::time::sleep(backoff).await;
                }
            }
        }
    }

    fn try_gates(&self, conv_key: &str) -> std::result::Result<(), GateError> {
        self.ctx
            .breaker
            .check_all(&[("conversation", conv_key), ("system", "llm")])?;
        if let Some(rule) = self.ctx.config.rate_rule("llm") {
            self.ctx.limiter.check_and_record(
                &format!("llm:{conv_key}"),
                rule.window(),
                rule.limit,
            )?;
        }
        Ok(())
    }

    async fn complete(
        &self,
        conv_key: &str,
        messages: &[Message],
        tools: &[ToolDefinition],
    ) -> Result<LlmResponse> {
        let llm = &self.ctx.config.llm;
        let request = LlmRequest {
            model: llm.model.clone(),
            messages: messages.to_vec(),
            temperature: llm.temperature,
            max_tokens: Some(llm.max_tokens),
            tools: tools.to_vec(),
        };
        let deadline = Duration::from_secs(llm.timeout_secs);

        match timeout(deadline, self.ctx.llm.chat_completion(request)).await {
            Ok(Ok(response)) => {
                self.ctx.breaker.record_success("conversation", conv_key);
                self.ctx.breaker.record_success("system", "llm");
                Ok(response)
            }
            Ok(Err(err)) => {
                self.ctx.breaker.record_failure("conversation", conv_key);
                self.ctx.breaker.record_failure("system", "llm");
                let _ = self.status_tx.send(AgentStatus::Crashed);
                Err(Error::Llm(err))
            }
            Err(_) => {
                self.ctx.breaker.record_failure("conversation", conv_key);
                self.ctx.breaker.record_failure("system", "llm");
                let _ = self.status_tx.send(AgentStatus::Crashed);
                Err(Error::Llm(LlmError::Timeout {
                    timeout_secs: llm.timeout_secs,
                }))
            }
        }
    }

    async fn handle_invocation(&self, invocation: ToolInvocation, messages: &mut Vec<Message>) {
        match invocation {
            ToolInvocation::Skill {
                call_id,
                skill,
                params,
            } => {
                let content = self.execute_skill(&skill, params).await;
                messages.push(Message::tool_result(call_id, content));
            }
            ToolInvocation::RequestHelp { call_id, question } => {
                let answer = self.ask_for_help(question).await;
                messages.push(Message::tool_result(call_id, answer));
            }
            ToolInvocation::GetSkill { call_id, .. }
            | ToolInvocation::SendAgentUpdate { call_id, .. } => {
                messages.push(Message::tool_result(
                    call_id,
                    "This tool is not available to sub-agents. Your scoped \
                     skills are already in your tool list.",
                ));
            }
            ToolInvocation::Malformed {
                call_id,
                tool,
                error,
            } => {
                messages.push(Message::tool_result(
                    call_id,
                    loop_runner::malformed_result(&tool, &error),
                ));
            }
            ToolInvocation::Deferred { call_id, tool } => {
                messages.push(Message::tool_result(
                    call_id,
                    loop_runner::deferred_result(&tool),
                ));
            }
        }
    }

    /// Execute one scoped skill. Every failure mode becomes a tool result
    /// string so the loop keeps moving; only the gates and the breaker see
    /// the difference between rejection and fault.
    async fn execute_skill(&self, skill: &str, params: Value) -> String {
        if !self.spec.scope.allows(skill) {
            warn!(
                agent_id = %self.spec.agent_id,
                skill,
                "Out-of-scope skill call rejected"
            );
            let scope: Vec<&str> = self.spec.scope.iter().collect();
            return format!(
                "Skill '{}' is outside this agent's scope. Allowed skills: {}.",
                skill,
                scope.join(", ")
            );
        }

        let domain = skill.split_once('.').map(|(d, _)| d).unwrap_or(skill);
        let conv_key = self.spec.parent_conversation_id.to_string();
        if let Err(gate) = self.ctx.breaker.check_all(&[
            ("skill", skill),
            ("domain", domain),
            ("conversation", &conv_key),
            ("system", "skills"),
        ]) {
            return format!("Skill temporarily unavailable: {gate}. Try another approach.");
        }

        let context = ExecutionContext {
            conversation_id: self.spec.parent_conversation_id.clone(),
            agent_id: Some(self.spec.agent_id.clone()),
        };
        let started = Instant::now();
        let outcome = self.ctx.executor.execute(skill, params, &context).await;
        let success = matches!(&outcome, Ok(result) if result.success);

        self.ctx.event_bus.publish(DomainEvent::SkillExecuted {
            skill: skill.to_string(),
            agent_id: Some(self.spec.agent_id.clone()),
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

    /// Suspend on the parent until an answer arrives. A vanished parent is
    /// answered locally so the agent can still finish on its own.
    async fn ask_for_help(&self, question: String) -> String {
        let _ = self.status_tx.send(AgentStatus::AwaitingHelp);
        self.ctx.event_bus.publish(DomainEvent::HelpRequested {
            conversation_id: self.spec.parent_conversation_id.to_string(),
            agent_id: self.spec.agent_id.clone(),
            timestamp: Utc::now(),
        });

        let (answer_tx, answer_rx) = oneshot::channel();
        let request = HelpRequest {
            agent_id: self.spec.agent_id.clone(),
            question,
            answer_tx,
        };

        let answer = match self.help_tx.send(request).await {
            Ok(()) => match answer_rx.await {
                Ok(answer) => answer,
                Err(_) => {
                    "No answer arrived. Proceed with your best judgement.".to_string()
                }
            },
            Err(_) => {
                "The dispatching conversation is gone. Proceed with your best judgement."
                    .to_string()
            }
        };
        let _ = self.status_tx.send(AgentStatus::Running);
        answer
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{scripted_context, text_response, tool_call_response};
    use hivemind_core::llm::FinishReason;
    use hivemind_core::message::ConversationId;
    use hivemind_core::agent::Scope;
    use std::collections::BTreeSet;

    fn spec(scope: &[&str]) -> AgentSpec {
        AgentSpec {
            agent_id: "agent_a".into(),
            mission: "summarize the inbox".into(),
            scope: Scope::new(scope.iter().copied()),
            depends_on: BTreeSet::new(),
            parent_conversation_id: ConversationId::from("conv_1"),
        }
    }

    fn help_channel() -> (mpsc::Sender<HelpRequest>, mpsc::Receiver<HelpRequest>) {
        mpsc::channel(4)
    }

    #[tokio::test]
    async fn final_answer_completes_in_one_turn() {
        let (ctx, _client, _executor) = scripted_context(vec![Ok(text_response("inbox is empty"))]);
        let (help_tx, _help_rx) = help_channel();
        let (agent, handle) = SubAgent::new(spec(&["email.read"]), ctx, help_tx, vec![]);

        let result = agent.run().await.unwrap();
        assert_eq!(result.summary, "inbox is empty");
        assert_eq!(result.turns_used, 1);
        assert!(!result.truncated);
        assert_eq!(handle.status(), AgentStatus::Completed);
    }

    #[tokio::test]
    async fn out_of_scope_skill_is_rejected_not_executed() {
        let (ctx, client, executor) = scripted_context(vec![
            Ok(tool_call_response("c1", "files.delete", "{}")),
            Ok(text_response("done without deleting")),
        ]);
        let (help_tx, _help_rx) = help_channel();
        let (agent, _handle) = SubAgent::new(spec(&["email.read"]), ctx, help_tx, vec![]);

        let result = agent.run().await.unwrap();
        assert_eq!(result.turns_used, 2);

        // The executor never saw the out-of-scope call.
        assert!(executor.calls().is_empty());

        // The second request carried a corrective tool result.
        let requests = client.requests();
        let last = &requests[1].messages;
        let correction = last.iter().rev().find(|m| m.role == Role::Tool).unwrap();
        assert!(correction.content.contains("outside this agent's scope"));
    }

    #[tokio::test]
    async fn in_scope_skill_executes_and_loops() {
        let (ctx, _client, executor) = scripted_context(vec![
            Ok(tool_call_response("c1", "email.read", r#"{"folder": "inbox"}"#)),
            Ok(text_response("two unread messages")),
        ]);
        let (help_tx, _help_rx) = help_channel();
        let (agent, _handle) = SubAgent::new(spec(&["email.read"]), ctx, help_tx, vec![]);

        let result = agent.run().await.unwrap();
        assert_eq!(result.summary, "two unread messages");
        assert_eq!(executor.calls(), vec!["email.read"]);
    }

    #[tokio::test]
    async fn turn_budget_exhaustion_truncates_gracefully() {
        // Every turn asks for another skill call; the budget cuts it off.
        let responses = (0..20)
            .map(|i| Ok(tool_call_response(&format!("c{i}"), "email.read", "{}")))
            .collect();
        let (ctx, _client, _executor) = scripted_context(responses);
        let max_turns = ctx.config.sub_agent.max_turns;
        let (help_tx, _help_rx) = help_channel();
        let (agent, _handle) = SubAgent::new(spec(&["email.read"]), ctx, help_tx, vec![]);

        let result = agent.run().await.unwrap();
        assert!(result.truncated);
        assert_eq!(result.turns_used, max_turns);
        assert!(result.summary.starts_with("[truncated"));
    }

    #[tokio::test]
    async fn help_round_trip_resumes_the_loop() {
        let (ctx, _client, _executor) = scripted_context(vec![
            Ok(tool_call_response(
                "c1",
                "request_help",
                r#"{"question": "which inbox?"}"#,
            )),
            Ok(text_response("summarized the work inbox")),
        ]);
        let (help_tx, mut help_rx) = help_channel();
        let (agent, handle) = SubAgent::new(spec(&["email.read"]), ctx, help_tx, vec![]);

        let parent = tokio::spawn(async move {
            let request = help_rx.recv().await.unwrap();
            assert_eq!(request.agent_id, "agent_a");
            assert_eq!(request.question, "which inbox?");
            request.answer_tx.send("the work inbox".to_string()).unwrap();
        });

        let result = agent.run().await.unwrap();
        parent.await.unwrap();
        assert_eq!(result.summary, "summarized the work inbox");
        assert_eq!(handle.status(), AgentStatus::Completed);
    }

    #[tokio::test]
    async fn dropped_help_channel_answers_locally() {
        let (ctx, _client, _executor) = scripted_context(vec![
            Ok(tool_call_response(
                "c1",
                "request_help",
                r#"{"question": "anyone there?"}"#,
            )),
            Ok(text_response("carried on alone")),
        ]);
        let (help_tx, help_rx) = help_channel();
        drop(help_rx);
        let (agent, _handle) = SubAgent::new(spec(&["email.read"]), ctx, help_tx, vec![]);

        let result = agent.run().await.unwrap();
        assert_eq!(result.summary, "carried on alone");
    }

    #[tokio::test]
    async fn queued_updates_are_injected_before_the_turn() {
        let (ctx, client, _executor) = scripted_context(vec![Ok(text_response("acknowledged"))]);
        let (help_tx, _help_rx) = help_channel();
        let (agent, handle) = SubAgent::new(spec(&["email.read"]), ctx, help_tx, vec![]);

        assert!(handle.send_update("prefer the work inbox"));
        let _ = agent.run().await.unwrap();

        let requests = client.requests();
        assert!(requests[0].messages.iter().any(|m| {
            m.role == Role::System && m.content.contains("prefer the work inbox")
        }));
    }

    #[tokio::test]
    async fn dependency_results_reach_the_system_prompt() {
        let (ctx, client, _executor) = scripted_context(vec![Ok(text_response("built on it"))]);
        let (help_tx, _help_rx) = help_channel();
        let deps = vec![AgentResult {
            agent_id: "agent_dep".into(),
            summary: "the quarterly numbers".into(),
            turns_used: 2,
            truncated: false,
        }];
        let (agent, _handle) = SubAgent::new(spec(&["email.read"]), ctx, help_tx, deps);

        let _ = agent.run().await.unwrap();
        let requests = client.requests();
        assert!(requests[0].messages[0]
            .content
            .contains("the quarterly numbers"));
    }

    #[tokio::test]
    async fn llm_failure_is_a_crash() {
        let (ctx, _client, _executor) = scripted_context(vec![Err(LlmError::Api {
            status_code: 500,
            message: "upstream down".into(),
        })]);
        let (help_tx, _help_rx) = help_channel();
        let (agent, handle) = SubAgent::new(spec(&["email.read"]), ctx, help_tx, vec![]);

        let err = agent.run().await.unwrap_err();
        assert!(matches!(err, Error::Llm(LlmError::Api { .. })));
        assert_eq!(handle.status(), AgentStatus::Crashed);
    }

    #[tokio::test]
    async fn empty_response_is_a_crash() {
        let mut response = text_response("");
        response.content = None;
        response.finish_reason = FinishReason::Stop;
        let (ctx, _client, _executor) = scripted_context(vec![Ok(response)]);
        let (help_tx, _help_rx) = help_channel();
        let (agent, _handle) = SubAgent::new(spec(&["email.read"]), ctx, help_tx, vec![]);

        let err = agent.run().await.unwrap_err();
        assert!(matches!(err, Error::Llm(LlmError::EmptyResponse)));
    }
}
