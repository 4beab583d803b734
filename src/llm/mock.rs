//! Scripted 补全客户端（用于测试与离线演示，无需 API）
//!
//! 每个阶段一个响应队列，按调用顺序出队；队列为空时退回演示响应（若启用）或报不可用。
//! 同时记录每次调用的阶段与输入，便于测试断言。

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;

use async_trait::async_trait;
use serde_json::json;

use crate::llm::{CompletionClient, CompletionRequest, LlmError, RawCompletion};
use crate::stage::StageId;

/// 一次被记录的调用
#[derive(Debug, Clone)]
pub struct RecordedCall {
    pub stage: StageId,
    pub input: String,
    pub session_id: String,
}

/// Scripted 客户端
#[derive(Debug, Default)]
pub struct ScriptedClient {
    queues: Mutex<HashMap<StageId, VecDeque<Result<RawCompletion, LlmError>>>>,
    calls: Mutex<Vec<RecordedCall>>,
    demo_fallback: bool,
}

impl ScriptedClient {
    pub fn new() -> Self {
        Self::default()
    }

    /// 离线演示：队列为空时按阶段给出固定响应
    pub fn demo() -> Self {
        Self {
            demo_fallback: true,
            ..Self::default()
        }
    }

    /// 追加一条文本响应
    pub fn push_text(&self, stage: StageId, text: impl Into<String>) -> &Self {
        self.push(stage, Ok(RawCompletion::Text(text.into())))
    }

    /// 追加一条已结构化的响应
    pub fn push_json(&self, stage: StageId, value: serde_json::Value) -> &Self {
        self.push(stage, Ok(RawCompletion::Structured(value)))
    }

    pub fn push_error(&self, stage: StageId, err: LlmError) -> &Self {
        self.push(stage, Err(err))
    }

    pub fn push(&self, stage: StageId, response: Result<RawCompletion, LlmError>) -> &Self {
        if let Ok(mut queues) = self.queues.lock() {
            queues.entry(stage).or_default().push_back(response);
        }
        self
    }

    pub fn calls(&self) -> Vec<RecordedCall> {
        self.calls.lock().map(|c| c.clone()).unwrap_or_default()
    }

    pub fn calls_for(&self, stage: StageId) -> usize {
        self.calls().iter().filter(|c| c.stage == stage).count()
    }

    fn demo_response(request: &CompletionRequest<'_>) -> RawCompletion {
        let value = match request.stage {
            StageId::Coordinator if request.input.contains(crate::stage::PRESENT_MARKER) => json!({
                "user_message": "I checked our records and prepared a solution for your problem. Our team will follow up if anything else is needed."
            }),
            StageId::Coordinator if request.input.contains(crate::stage::RECOVERY_MARKER) => json!({
                "user_message": "Sorry, I need a little more detail. Could you describe the problem again?"
            }),
            StageId::Coordinator => {
                let words = request.input.split_whitespace().count();
                if words > 12 {
                    json!({
                        "user_message": "Thanks, I'm looking into it.",
                        "gathered_info": { "problem_description": request.input }
                    })
                } else {
                    json!({
                        "user_message": "Could you tell me which screen or report shows the problem, and what you expected to see?"
                    })
                }
            }
            StageId::Lookup => json!({
                "status": "not_found",
                "internal_summary": "No similar ticket found in the knowledge base."
            }),
            StageId::Diagnosis => json!({
                "diagnostic_summary": "Demo diagnosis.",
                "investigation_details_md": "## Investigation\n- demo",
                "next_step_recommendation": "Forward to resolution planning."
            }),
            StageId::Resolution => json!({
                "action_type": "Detailed Guidance",
                "description": "Demo resolution plan.",
                "requires_human_approval": true
            }),
            StageId::KnowledgeBuilder => json!({ "records": [] }),
        };
        RawCompletion::Text(format!("```json\n{}\n```", value))
    }
}

#[async_trait]
impl CompletionClient for ScriptedClient {
    async fn complete(&self, request: CompletionRequest<'_>) -> Result<RawCompletion, LlmError> {
        if let Ok(mut calls) = self.calls.lock() {
            calls.push(RecordedCall {
                stage: request.stage,
                input: request.input.to_string(),
                session_id: request.session.session_id.clone(),
            });
        }

        let next = self
            .queues
            .lock()
            .ok()
            .and_then(|mut queues| queues.get_mut(&request.stage).and_then(VecDeque::pop_front));

        match next {
            Some(response) => response,
            None if self.demo_fallback => Ok(Self::demo_response(&request)),
            None => Err(LlmError::Unavailable(format!(
                "no scripted response for stage {}",
                request.stage
            ))),
        }
    }

    fn name(&self) -> &str {
        "scripted"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::SessionContext;

    fn request<'a>(stage: StageId, input: &'a str, session: &'a SessionContext) -> CompletionRequest<'a> {
        CompletionRequest {
            stage,
            system_prompt: "",
            input,
            session,
        }
    }

    #[tokio::test]
    async fn test_queue_order_and_recording() {
        let client = ScriptedClient::new();
        client
            .push_text(StageId::Lookup, "first")
            .push_error(StageId::Lookup, LlmError::Timeout);
        let ctx = SessionContext::conversation("s1", 1);

        let first = client.complete(request(StageId::Lookup, "in", &ctx)).await;
        assert_eq!(first, Ok(RawCompletion::Text("first".into())));
        let second = client.complete(request(StageId::Lookup, "in", &ctx)).await;
        assert_eq!(second, Err(LlmError::Timeout));
        assert_eq!(client.calls_for(StageId::Lookup), 2);
        assert_eq!(client.calls()[0].session_id, "s1");
    }

    #[tokio::test]
    async fn test_empty_queue_is_unavailable() {
        let client = ScriptedClient::new();
        let ctx = SessionContext::default();
        let result = client.complete(request(StageId::Diagnosis, "x", &ctx)).await;
        assert!(matches!(result, Err(LlmError::Unavailable(_))));
    }
}
