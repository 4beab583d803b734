//! ConversationOrchestrator：驱动单轮对话的 阶段 → 解析 → 路由 循环
//!
//! 每轮从协调者开始，内部升级（Lookup → Diagnosis → Resolution → Coordinator）不需要用户输入，
//! 直到让出（等待用户）或结束。失败从不向上传播：一律转为合成的失败结果并回退到协调者，
//! 用户只会看到通用的恢复话术。

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use serde::Serialize;
use tokio::sync::mpsc;
use tracing::Instrument;

use crate::config::AppConfig;
use crate::core::recovery::{CONVERSATION_CLOSED_MESSAGE, HOP_LIMIT_MESSAGE};
use crate::core::{truncate_chars, FailureKind, RecoveryEngine};
use crate::llm::{RetryConfig, SessionContext};
use crate::stage::{StageId, StageInvoker, StageResult};
use crate::triage::router::{self, FallbackCause, RouteReason, RouteTarget, RoutingDecision};
use crate::triage::{compose_input, ConversationState, SessionStore};

/// 对话入口请求
#[derive(Debug, Clone)]
pub struct ChatRequest {
    pub message: String,
    pub session_id: String,
    pub stream: bool,
}

/// 让出控制时返回给调用方的载荷
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TurnReply {
    pub user_message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub next_node: Option<String>,
}

impl TurnReply {
    fn yielded(message: impl Into<String>) -> Self {
        Self {
            user_message: message.into(),
            next_node: None,
        }
    }

    fn ended(message: impl Into<String>) -> Self {
        Self {
            user_message: message.into(),
            next_node: Some("END".to_string()),
        }
    }

    pub fn is_end(&self) -> bool {
        self.next_node.as_deref() == Some("END")
    }
}

/// 流式事件：进度只带面向用户的文案，不暴露阶段名
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TurnEvent {
    Progress { step: usize, message: String },
    Reply(TurnReply),
}

pub enum ChatResponse {
    Complete(TurnReply),
    Stream(mpsc::UnboundedReceiver<TurnEvent>),
}

fn progress_text(stage: StageId, presenting: bool) -> &'static str {
    match stage {
        StageId::Coordinator if presenting => "Preparing the answer...",
        StageId::Coordinator => "Reading your message...",
        StageId::Lookup => "Searching similar solved tickets...",
        StageId::Diagnosis => "Investigating the cause...",
        StageId::Resolution => "Preparing a solution plan...",
        StageId::KnowledgeBuilder => "Working...",
    }
}

fn send_event(tx: Option<&mpsc::UnboundedSender<TurnEvent>>, event: TurnEvent) {
    if let Some(tx) = tx {
        let _ = tx.send(event);
    }
}

pub struct ConversationOrchestrator {
    invoker: StageInvoker,
    sessions: Arc<dyn SessionStore>,
    /// 每个会话一把锁：同一会话内阶段严格串行
    locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
    recovery: RecoveryEngine,
    retry: RetryConfig,
    max_stage_hops: usize,
    transcript_window: usize,
}

impl ConversationOrchestrator {
    pub fn new(invoker: StageInvoker, sessions: Arc<dyn SessionStore>, cfg: &AppConfig) -> Self {
        Self {
            invoker,
            sessions,
            locks: Mutex::new(HashMap::new()),
            recovery: RecoveryEngine::new(),
            retry: cfg.retry.interactive_policy(),
            max_stage_hops: cfg.app.max_stage_hops.max(1),
            transcript_window: cfg.app.transcript_window.max(1),
        }
    }

    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    /// 对话入口：非流式直接返回最终载荷；流式返回事件接收端，最后一个事件为 Reply
    pub async fn chat(self: &Arc<Self>, request: ChatRequest) -> ChatResponse {
        if request.stream {
            let (tx, rx) = mpsc::unbounded_channel();
            let this = Arc::clone(self);
            tokio::spawn(async move {
                this.run_turn(&request.session_id, &request.message, Some(&tx))
                    .await;
            });
            ChatResponse::Stream(rx)
        } else {
            ChatResponse::Complete(
                self.run_turn(&request.session_id, &request.message, None)
                    .await,
            )
        }
    }

    /// 读取会话状态快照
    pub async fn state(&self, session_id: &str) -> Option<ConversationState> {
        self.sessions.load(session_id).await
    }

    fn session_lock(&self, session_id: &str) -> Arc<tokio::sync::Mutex<()>> {
        let mut locks = self.locks.lock().unwrap_or_else(|e| e.into_inner());
        locks.entry(session_id.to_string()).or_default().clone()
    }

    /// 轮次结束后回收会话锁：只剩表内与本轮持有的两份引用时移除
    fn release_session_lock(&self, session_id: &str, lock: Arc<tokio::sync::Mutex<()>>) {
        let mut locks = self.locks.lock().unwrap_or_else(|e| e.into_inner());
        if Arc::strong_count(&lock) <= 2 {
            locks.remove(session_id);
        }
    }

    /// 执行一轮对话，结束时发送 Reply 事件并保存状态
    pub async fn run_turn(
        &self,
        session_id: &str,
        message: &str,
        events: Option<&mpsc::UnboundedSender<TurnEvent>>,
    ) -> TurnReply {
        let lock = self.session_lock(session_id);
        let guard = lock.lock().await;

        let span = tracing::info_span!("turn", session_id = %session_id);
        let reply = async {
            let mut state = self
                .sessions
                .load(session_id)
                .await
                .unwrap_or_else(|| ConversationState::new(session_id));

            let reply = if state.terminal {
                tracing::info!("Message received on a concluded conversation");
                TurnReply::ended(CONVERSATION_CLOSED_MESSAGE)
            } else {
                state.begin_turn(message);
                self.drive(&mut state, events).await
            };

            tracing::info!(
                turn = state.turn,
                history = state.history.len(),
                terminal = state.terminal,
                "Turn finished"
            );
            self.sessions.save(state).await;
            send_event(events, TurnEvent::Reply(reply.clone()));
            reply
        }
        .instrument(span)
        .await;

        drop(guard);
        self.release_session_lock(session_id, lock);
        reply
    }

    async fn drive(
        &self,
        state: &mut ConversationState,
        events: Option<&mpsc::UnboundedSender<TurnEvent>>,
    ) -> TurnReply {
        let mut recovering = false;
        let mut hops = 0;

        loop {
            if hops >= self.max_stage_hops {
                tracing::warn!(hops, "Stage hop limit reached; yielding to user");
                state.presenting = false;
                state.apply(&RoutingDecision::new(RouteTarget::Yield, RouteReason::AwaitUser));
                return TurnReply::yielded(HOP_LIMIT_MESSAGE);
            }
            hops += 1;

            let stage = state.current_stage;
            send_event(
                events,
                TurnEvent::Progress {
                    step: hops,
                    message: progress_text(stage, state.presenting).to_string(),
                },
            );

            let result = self.execute_stage(stage, state, recovering).await;
            let decision = router::decide(&result, state);

            if let Some(hint) = &decision.ignored_hint {
                tracing::debug!(stage = %stage, hint = %hint, "Ignoring routing hint that disagrees with the routing table");
            }
            tracing::debug!(stage = %stage, next = ?decision.next, reason = ?decision.reason, "Routed");

            let user_message = result.user_message().map(str::to_string);
            state.record(result);

            if decision.is_fallback() && stage == StageId::Coordinator {
                let kind = match &decision.reason {
                    RouteReason::Fallback(FallbackCause::StageFailed(kind)) => *kind,
                    _ => FailureKind::InvalidPayload,
                };
                let action = self.recovery.handle(kind);
                state.apply(&RoutingDecision::new(RouteTarget::Yield, RouteReason::AwaitUser));
                return TurnReply::yielded(action.user_message());
            }

            recovering = decision.is_fallback();
            state.apply(&decision);

            match decision.next {
                RouteTarget::Stage(_) => continue,
                RouteTarget::Yield => {
                    let text = user_message.unwrap_or_else(|| {
                        self.recovery
                            .handle(FailureKind::InvalidPayload)
                            .user_message()
                            .to_string()
                    });
                    return TurnReply::yielded(text);
                }
                RouteTarget::End => {
                    return TurnReply::ended(user_message.unwrap_or_default());
                }
            }
        }
    }

    /// 执行一个阶段；任何错误都转为合成的失败结果
    async fn execute_stage(
        &self,
        stage: StageId,
        state: &ConversationState,
        recovering: bool,
    ) -> StageResult {
        let input = compose_input(stage, state, recovering, self.transcript_window);
        let session = SessionContext::conversation(&state.session_id, state.turn);

        match self
            .invoker
            .execute(stage, &input, &session, &self.retry, None)
            .await
        {
            Ok(result) => result,
            Err(err) => {
                tracing::warn!(
                    stage = %stage,
                    class = err.class(),
                    "Stage failed: {}",
                    truncate_chars(&err.to_string(), 500)
                );
                StageResult::failure(
                    stage,
                    FailureKind::from(&err),
                    truncate_chars(&err.to_string(), 500),
                )
            }
        }
    }
}
