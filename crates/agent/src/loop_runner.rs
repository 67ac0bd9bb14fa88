//! The per-iteration decision function.
//!
//! One LLM response in, one decision out. No I/O, no clocks, no channels:
//! the engine and sub-agents own the side effects, this module only decides
//! what the response means. Keeping it pure is what makes the loop testable
//! without a live provider.

use serde_json::Value;

use hivemind_core::agent::DispatchRequest;
use hivemind_core::llm::{FinishReason, LlmResponse};
use hivemind_core::message::MessageToolCall;
use hivemind_dispatch::protocol::GET_AGENT_RESULTS;
use hivemind_dispatch::{
    DispatchAgentArgs, GetAgentResultsArgs, GetSkillArgs, RequestHelpArgs, SendAgentUpdateArgs,
    ToolName,
};

/// One routed tool call from an assistant response. Malformed calls are
/// carried through rather than dropped: every call id in the response must
/// get a paired tool result, including the broken ones.
#[derive(Debug, Clone)]
pub enum ToolInvocation {
    /// A qualified skill call, arguments already parsed to JSON
    Skill {
        call_id: String,
        skill: String,
        params: Value,
    },

    /// Progressive skill discovery
    GetSkill { call_id: String, args: GetSkillArgs },

    /// Best-effort note to a dispatched agent
    SendAgentUpdate {
        call_id: String,
        args: SendAgentUpdateArgs,
    },

    /// Sub-agent only: ask the dispatching conversation for guidance
    RequestHelp { call_id: String, question: String },

    /// Arguments failed to parse; answered with a corrective tool result
    Malformed {
        call_id: String,
        tool: String,
        error: String,
    },

    /// Valid, but not executed this iteration because a dispatch decision
    /// took precedence; answered with a "call again" tool result
    Deferred { call_id: String, tool: String },
}

impl ToolInvocation {
    pub fn call_id(&self) -> &str {
        match self {
            ToolInvocation::Skill { call_id, .. }
            | ToolInvocation::GetSkill { call_id, .. }
            | ToolInvocation::SendAgentUpdate { call_id, .. }
            | ToolInvocation::RequestHelp { call_id, .. }
            | ToolInvocation::Malformed { call_id, .. }
            | ToolInvocation::Deferred { call_id, .. } => call_id,
        }
    }
}

/// One `get_agent_results` call: wait for these agents, then answer this
/// call id with their outcomes.
#[derive(Debug, Clone)]
pub struct AwaitCall {
    pub call_id: String,
    pub agent_ids: Vec<String>,
}

/// What the loop should do with one LLM response.
///
/// Exactly one decision per response. When a response mixes tool kinds,
/// dispatch wins over awaiting results, which wins over plain tool
/// execution; whatever lost the tie-break rides along in `rest` so its
/// call ids still get answered.
#[derive(Debug, Clone)]
pub enum LoopDecision {
    /// Execute these invocations, append their results, loop again
    Continue(Vec<ToolInvocation>),

    /// Validate and queue these dispatch requests
    Dispatch {
        requests: Vec<DispatchRequest>,
        rest: Vec<ToolInvocation>,
    },

    /// Run queued agents and block until the named agents finish
    AwaitResults {
        calls: Vec<AwaitCall>,
        rest: Vec<ToolInvocation>,
    },

    /// The model is done; this is the answer for the user
    Final(String),

    /// Neither content nor tool calls came back
    Empty,
}

/// Classify one assistant response.
///
/// A response with no tool calls is terminal only when the model stopped
/// on its own: content cut off at the token limit loops again so the model
/// can finish its thought. A response with tool calls is never terminal,
/// whatever the finish reason says.
pub fn decide(response: &LlmResponse) -> LoopDecision {
    if response.tool_calls.is_empty() {
        return match response.content.as_deref() {
            Some(text) if !text.trim().is_empty() => {
                if response.finish_reason == FinishReason::Length {
                    LoopDecision::Continue(Vec::new())
                } else {
                    LoopDecision::Final(text.to_string())
                }
            }
            _ => LoopDecision::Empty,
        };
    }

    let mut requests = Vec::new();
    let mut awaits = Vec::new();
    let mut rest = Vec::new();

    for call in &response.tool_calls {
        match ToolName::resolve(&call.name) {
            ToolName::DispatchAgent => match parse_args::<DispatchAgentArgs>(call) {
                Ok(args) => requests.push(DispatchRequest {
                    call_id: call.id.clone(),
                    mission: args.mission,
                    scope: args.scope,
                    depends_on: args.depends_on,
                    agent_id: args.agent_id,
                }),
                Err(error) => rest.push(malformed(call, error)),
            },
            ToolName::GetAgentResults => match parse_args::<GetAgentResultsArgs>(call) {
                Ok(args) => awaits.push(AwaitCall {
                    call_id: call.id.clone(),
                    agent_ids: args.agent_ids,
                }),
                Err(error) => rest.push(malformed(call, error)),
            },
            ToolName::GetSkill => match parse_args::<GetSkillArgs>(call) {
                Ok(args) => rest.push(ToolInvocation::GetSkill {
                    call_id: call.id.clone(),
                    args,
                }),
                Err(error) => rest.push(malformed(call, error)),
            },
            ToolName::SendAgentUpdate => match parse_args::<SendAgentUpdateArgs>(call) {
                Ok(args) => rest.push(ToolInvocation::SendAgentUpdate {
                    call_id: call.id.clone(),
                    args,
                }),
                Err(error) => rest.push(malformed(call, error)),
            },
            ToolName::RequestHelp => match parse_args::<RequestHelpArgs>(call) {
                Ok(args) => rest.push(ToolInvocation::RequestHelp {
                    call_id: call.id.clone(),
                    question: args.question,
                }),
                Err(error) => rest.push(malformed(call, error)),
            },
            ToolName::Skill(skill) => match parse_args::<Value>(call) {
                Ok(params) => rest.push(ToolInvocation::Skill {
                    call_id: call.id.clone(),
                    skill,
                    params,
                }),
                Err(error) => rest.push(malformed(call, error)),
            },
        }
    }

    if !requests.is_empty() {
        // Awaiting in the same response as a dispatch would race the queue;
        // the await calls are deferred and answered with a retry hint.
        rest.extend(awaits.into_iter().map(|a| ToolInvocation::Deferred {
            call_id: a.call_id,
            tool: GET_AGENT_RESULTS.to_string(),
        }));
        return LoopDecision::Dispatch { requests, rest };
    }

    if !awaits.is_empty() {
        return LoopDecision::AwaitResults {
            calls: awaits,
            rest,
        };
    }

    LoopDecision::Continue(rest)
}

fn parse_args<T: serde::de::DeserializeOwned>(call: &MessageToolCall) -> Result<T, String> {
    let raw = if call.arguments.trim().is_empty() {
        "{}"
    } else {
        &call.arguments
    };
    serde_json::from_str(raw).map_err(|e| e.to_string())
}

fn malformed(call: &MessageToolCall, error: String) -> ToolInvocation {
    ToolInvocation::Malformed {
        call_id: call.id.clone(),
        tool: call.name.clone(),
        error,
    }
}

/// The corrective tool result for a deferred call.
pub fn deferred_result(tool: &str) -> String {
    format!("{tool} was not executed this iteration because dispatch_agent took precedence. Call it again by itself.")
}

/// The corrective tool result for a malformed call.
pub fn malformed_result(tool: &str, error: &str) -> String {
    format!("Invalid arguments for {tool}: {error}. Fix the arguments and call it again.")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn response(content: Option<&str>, calls: Vec<MessageToolCall>) -> LlmResponse {
        let finish_reason = if calls.is_empty() {
            FinishReason::Stop
        } else {
            FinishReason::ToolCalls
        };
        LlmResponse {
            content: content.map(String::from),
            tool_calls: calls,
            finish_reason,
            usage: None,
            model: "test".into(),
        }
    }

    fn call(id: &str, name: &str, arguments: &str) -> MessageToolCall {
        MessageToolCall {
            id: id.into(),
            name: name.into(),
            arguments: arguments.into(),
        }
    }

    #[test]
    fn content_without_tool_calls_is_final() {
        let decision = decide(&response(Some("All done."), vec![]));
        assert!(matches!(decision, LoopDecision::Final(text) if text == "All done."));
    }

    #[test]
    fn blank_response_is_empty() {
        assert!(matches!(
            decide(&response(None, vec![])),
            LoopDecision::Empty
        ));
        assert!(matches!(
            decide(&response(Some("   "), vec![])),
            LoopDecision::Empty
        ));
    }

    #[test]
    fn skill_calls_continue_the_loop() {
        let decision = decide(&response(
            None,
            vec![call("c1", "email.read", r#"{"folder": "inbox"}"#)],
        ));
        let LoopDecision::Continue(invocations) = decision else {
            panic!("expected Continue");
        };
        assert_eq!(invocations.len(), 1);
        assert!(matches!(
            &invocations[0],
            ToolInvocation::Skill { skill, params, .. }
                if skill == "email.read" && params["folder"] == "inbox"
        ));
    }

    #[test]
    fn empty_argument_string_parses_as_empty_object() {
        let decision = decide(&response(None, vec![call("c1", "get_skill", "")]));
        let LoopDecision::Continue(invocations) = decision else {
            panic!("expected Continue");
        };
        assert!(matches!(&invocations[0], ToolInvocation::GetSkill { .. }));
    }

    #[test]
    fn broken_arguments_become_malformed_not_dropped() {
        let decision = decide(&response(
            None,
            vec![call("c1", "dispatch_agent", "{not json")],
        ));
        let LoopDecision::Continue(invocations) = decision else {
            panic!("expected Continue");
        };
        assert!(matches!(
            &invocations[0],
            ToolInvocation::Malformed { call_id, tool, .. }
                if call_id == "c1" && tool == "dispatch_agent"
        ));
    }

    #[test]
    fn dispatch_wins_over_other_calls() {
        let decision = decide(&response(
            None,
            vec![
                call(
                    "c1",
                    "dispatch_agent",
                    r#"{"mission": "summarize inbox", "scope": ["email.read"]}"#,
                ),
                call("c2", "get_agent_results", r#"{"agent_ids": ["x"]}"#),
                call("c3", "email.read", "{}"),
            ],
        ));
        let LoopDecision::Dispatch { requests, rest } = decision else {
            panic!("expected Dispatch");
        };
        assert_eq!(requests.len(), 1);
        assert_eq!(requests[0].call_id, "c1");
        // The await call is deferred, the skill call rides along.
        assert_eq!(rest.len(), 2);
        assert!(matches!(&rest[0], ToolInvocation::Skill { .. }));
        assert!(
            matches!(&rest[1], ToolInvocation::Deferred { call_id, .. } if call_id == "c2")
        );
    }

    #[test]
    fn await_results_collects_agent_ids() {
        let decision = decide(&response(
            None,
            vec![call(
                "c1",
                "get_agent_results",
                r#"{"agent_ids": ["a", "b"]}"#,
            )],
        ));
        let LoopDecision::AwaitResults { calls, rest } = decision else {
            panic!("expected AwaitResults");
        };
        assert!(rest.is_empty());
        assert_eq!(calls[0].agent_ids, vec!["a", "b"]);
    }

    #[test]
    fn request_help_routes_with_question() {
        let decision = decide(&response(
            None,
            vec![call("c1", "request_help", r#"{"question": "which inbox?"}"#)],
        ));
        let LoopDecision::Continue(invocations) = decision else {
            panic!("expected Continue");
        };
        assert!(matches!(
            &invocations[0],
            ToolInvocation::RequestHelp { question, .. } if question == "which inbox?"
        ));
    }

    #[test]
    fn length_cut_content_is_not_final() {
        let mut resp = response(Some("the first half of an ans"), vec![]);
        resp.finish_reason = FinishReason::Length;
        let LoopDecision::Continue(invocations) = decide(&resp) else {
            panic!("expected Continue so the model can finish");
        };
        assert!(invocations.is_empty());
    }

    #[test]
    fn tool_calls_beat_content_even_on_stop() {
        let mut resp = response(Some("thinking..."), vec![call("c1", "email.read", "{}")]);
        resp.finish_reason = FinishReason::Stop;
        assert!(matches!(decide(&resp), LoopDecision::Continue(_)));
    }
}
