//! Mocks for the engine crate's tests.
//!
//! One client serves both sides of a test: engine-loop requests (recognized
//! by the meta tools) play back a script, while sub-agent requests
//! (recognized by `request_help` in the tool list) answer from the mission
//! text, since concurrent agents would race a strict script.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;

use hivemind_agent::{AgentContext, breaker_from_config};
use hivemind_config::OrchestratorConfig;
use hivemind_core::error::{LlmError, SkillError};
use hivemind_core::event::EventBus;
use hivemind_core::llm::{FinishReason, LlmClient, LlmRequest, LlmResponse, Usage};
use hivemind_core::message::{MessageToolCall, Role};
use hivemind_core::skill::{ExecutionContext, SkillExecutor, SkillResult, StaticSkillRegistry};
use hivemind_resilience::RateLimiter;

pub(crate) type Script = Vec<Result<LlmResponse, LlmError>>;

pub(crate) fn text_response(content: &str) -> LlmResponse {
    LlmResponse {
        content: Some(content.to_string()),
        tool_calls: vec![],
        finish_reason: FinishReason::Stop,
        usage: Some(Usage {
            prompt_tokens: 20,
            completion_tokens: 10,
            total_tokens: 30,
        }),
        model: "mock".into(),
    }
}

pub(crate) fn tool_call_response(call_id: &str, name: &str, arguments: &str) -> LlmResponse {
    tool_calls_response(vec![(call_id, name, arguments.to_string())])
}

pub(crate) fn tool_calls_response(calls: Vec<(&str, &str, String)>) -> LlmResponse {
    LlmResponse {
        content: None,
        tool_calls: calls
            .into_iter()
            .map(|(id, name, arguments)| MessageToolCall {
                id: id.into(),
                name: name.into(),
                arguments,
            })
            .collect(),
        finish_reason: FinishReason::ToolCalls,
        usage: Some(Usage {
            prompt_tokens: 20,
            completion_tokens: 10,
            total_tokens: 30,
        }),
        model: "mock".into(),
    }
}

pub(crate) struct HybridClient {
    script: Mutex<VecDeque<Result<LlmResponse, LlmError>>>,
    requests: Mutex<Vec<LlmRequest>>,
}

impl HybridClient {
    pub(crate) fn new(script: Script) -> Self {
        Self {
            script: Mutex::new(script.into()),
            requests: Mutex::new(Vec::new()),
        }
    }

    pub(crate) fn requests(&self) -> Vec<LlmRequest> {
        self.requests.lock().unwrap().clone()
    }
}

#[async_trait]
impl LlmClient for HybridClient {
    fn name(&self) -> &str {
        "hybrid"
    }

    async fn chat_completion(&self, request: LlmRequest) -> Result<LlmResponse, LlmError> {
        let is_sub_agent = request.tools.iter().any(|t| t.name == "request_help");
        self.requests.lock().unwrap().push(request.clone());

        if !is_sub_agent {
            return self
                .script
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or(Err(LlmError::EmptyResponse));
        }

        let mission = request
            .messages
            .iter()
            .find(|m| m.role == Role::User)
            .map(|m| m.content.clone())
            .unwrap_or_default();

        if mission.contains("explode") {
            return Err(LlmError::Api {
                status_code: 500,
                message: "mock upstream failure".into(),
            });
        }
        if mission.contains("ask for help") {
            let answered = request.messages.iter().any(|m| m.role == Role::Tool);
            if !answered {
                return Ok(tool_call_response(
                    "h1",
                    "request_help",
                    r#"{"question": "which inbox?"}"#,
                ));
            }
            let guidance = request
                .messages
                .iter()
                .rev()
                .find(|m| m.role == Role::Tool)
                .map(|m| m.content.clone())
                .unwrap_or_default();
            return Ok(text_response(&format!("done with guidance: {guidance}")));
        }
        Ok(text_response(&format!("done: {mission}")))
    }
}

struct EchoExecutor;

#[async_trait]
impl SkillExecutor for EchoExecutor {
    async fn execute(
        &self,
        skill: &str,
        _params: serde_json::Value,
        _context: &ExecutionContext,
    ) -> Result<SkillResult, SkillError> {
        Ok(SkillResult::ok(format!("executed {skill}")))
    }
}

pub(crate) fn engine_context(
    script: Script,
    config: OrchestratorConfig,
) -> (AgentContext, Arc<HybridClient>) {
    let client = Arc::new(HybridClient::new(script));
    let registry = StaticSkillRegistry::from_triples([
        ("email", "read", "Read recent emails"),
        ("email", "send", "Send an email"),
        ("calendar", "list", "List calendar events"),
    ]);
    let breaker = breaker_from_config(&config);
    let ctx = AgentContext {
        llm: client.clone(),
        executor: Arc::new(EchoExecutor),
        registry: Arc::new(registry),
        breaker: Arc::new(breaker),
        limiter: Arc::new(RateLimiter::new()),
        event_bus: Arc::new(EventBus::default()),
        config: Arc::new(config),
    };
    (ctx, client)
}
