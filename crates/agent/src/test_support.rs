//! Shared mocks for the agent crate's tests: a scripted LLM client, a
//! mission-sensitive client for scheduler scenarios, and a recording
//! skill executor.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;

use hivemind_config::OrchestratorConfig;
use hivemind_core::error::{LlmError, SkillError};
use hivemind_core::event::EventBus;
use hivemind_core::llm::{FinishReason, LlmClient, LlmRequest, LlmResponse};
use hivemind_core::message::{MessageToolCall, Role};
use hivemind_core::skill::{ExecutionContext, SkillExecutor, SkillResult, StaticSkillRegistry};
use hivemind_resilience::RateLimiter;

use crate::context::{AgentContext, breaker_from_config};

pub(crate) fn text_response(content: &str) -> LlmResponse {
    LlmResponse {
        content: Some(content.to_string()),
        tool_calls: vec![],
        finish_reason: FinishReason::Stop,
        usage: Some(hivemind_core::llm::Usage {
            prompt_tokens: 10,
            completion_tokens: 5,
            total_tokens: 15,
        }),
        model: "mock".into(),
    }
}

pub(crate) fn tool_call_response(call_id: &str, name: &str, arguments: &str) -> LlmResponse {
    LlmResponse {
        content: None,
        tool_calls: vec![MessageToolCall {
            id: call_id.into(),
            name: name.into(),
            arguments: arguments.into(),
        }],
        finish_reason: FinishReason::ToolCalls,
        usage: Some(hivemind_core::llm::Usage {
            prompt_tokens: 10,
            completion_tokens: 5,
            total_tokens: 15,
        }),
        model: "mock".into(),
    }
}

/// Plays back a fixed script of responses, recording every request.
pub(crate) struct ScriptedClient {
    script: Mutex<VecDeque<Result<LlmResponse, LlmError>>>,
    requests: Mutex<Vec<LlmRequest>>,
}

impl ScriptedClient {
    pub(crate) fn new(script: Vec<Result<LlmResponse, LlmError>>) -> Self {
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
impl LlmClient for ScriptedClient {
    fn name(&self) -> &str {
        "scripted"
    }

    async fn chat_completion(&self, request: LlmRequest) -> Result<LlmResponse, LlmError> {
        self.requests.lock().unwrap().push(request);
        self.script
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or(Err(LlmError::EmptyResponse))
    }
}

/// Answers based on the mission text in the user message. Used by scheduler
/// tests where several agents share one client and a strict script would
/// race.
pub(crate) struct MissionClient {
    pub(crate) fail_token: Option<&'static str>,
    pub(crate) panic_token: Option<&'static str>,
    requests: Mutex<Vec<LlmRequest>>,
}

impl MissionClient {
    pub(crate) fn new() -> Self {
        Self {
            fail_token: None,
            panic_token: None,
            requests: Mutex::new(Vec::new()),
        }
    }

    pub(crate) fn fail_on(mut self, token: &'static str) -> Self {
        self.fail_token = Some(token);
        self
    }

    pub(crate) fn panic_on(mut self, token: &'static str) -> Self {
        self.panic_token = Some(token);
        self
    }

    pub(crate) fn requests(&self) -> Vec<LlmRequest> {
        self.requests.lock().unwrap().clone()
    }
}

#[async_trait]
impl LlmClient for MissionClient {
    fn name(&self) -> &str {
        "mission"
    }

    async fn chat_completion(&self, request: LlmRequest) -> Result<LlmResponse, LlmError> {
        let mission = request
            .messages
            .iter()
            .find(|m| m.role == Role::User)
            .map(|m| m.content.clone())
            .unwrap_or_default();
        self.requests.lock().unwrap().push(request);

        if let Some(token) = self.panic_token
            && mission.contains(token)
        {
            panic!("mock client panic for mission: {mission}");
        }
        if let Some(token) = self.fail_token
            && mission.contains(token)
        {
            return Err(LlmError::Api {
                status_code: 500,
                message: "mock upstream failure".into(),
            });
        }
        Ok(text_response(&format!("done: {mission}")))
    }
}

/// Executes nothing; records qualified skill names and echoes success.
#[derive(Default)]
pub(crate) struct RecordingExecutor {
    calls: Mutex<Vec<String>>,
}

impl RecordingExecutor {
    pub(crate) fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl SkillExecutor for RecordingExecutor {
    async fn execute(
        &self,
        skill: &str,
        _params: serde_json::Value,
        _context: &ExecutionContext,
    ) -> Result<SkillResult, SkillError> {
        self.calls.lock().unwrap().push(skill.to_string());
        Ok(SkillResult::ok(format!("executed {skill}")))
    }
}

pub(crate) fn test_registry() -> StaticSkillRegistry {
    StaticSkillRegistry::from_triples([
        ("email", "read", "Read recent emails"),
        ("email", "send", "Send an email"),
        ("calendar", "list", "List calendar events"),
    ])
}

pub(crate) fn context_with_client(
    llm: Arc<dyn LlmClient>,
    config: OrchestratorConfig,
) -> (AgentContext, Arc<RecordingExecutor>) {
    let executor = Arc::new(RecordingExecutor::default());
    let breaker = breaker_from_config(&config);
    let ctx = AgentContext {
        llm,
        executor: executor.clone(),
        registry: Arc::new(test_registry()),
        breaker: Arc::new(breaker),
        limiter: Arc::new(RateLimiter::new()),
        event_bus: Arc::new(EventBus::default()),
        config: Arc::new(config),
    };
    (ctx, executor)
}

pub(crate) fn scripted_context(
    script: Vec<Result<LlmResponse, LlmError>>,
) -> (AgentContext, Arc<ScriptedClient>, Arc<RecordingExecutor>) {
    let client = Arc::new(ScriptedClient::new(script));
    let (ctx, executor) = context_with_client(client.clone(), OrchestratorConfig::default());
    (ctx, client, executor)
}
