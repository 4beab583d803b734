//! 会话状态：每个活跃会话一份，跨轮次保存在 SessionStore 中
//!
//! history 只追加不收缩；current_stage 永远是已知阶段之一，终止由 terminal 标记。

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::stage::{StageId, StageResult};
use crate::triage::{RouteReason, RouteTarget, RoutingDecision};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConversationState {
    pub session_id: String,
    /// 各阶段输出，按执行顺序追加
    pub history: Vec<StageResult>,
    pub current_stage: StageId,
    /// 从用户对话中提炼的结构化信息，更新时整体替换
    pub gathered_info: Option<Value>,
    pub terminal: bool,
    /// 协调者当前是在向用户呈现 Lookup / Resolution 的结果
    pub presenting: bool,
    /// 用户原话，按时间顺序
    pub user_messages: Vec<String>,
    pub turn: u64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl ConversationState {
    pub fn new(session_id: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            session_id: session_id.into(),
            history: Vec::new(),
            current_stage: StageId::Coordinator,
            gathered_info: None,
            terminal: false,
            presenting: false,
            user_messages: Vec::new(),
            turn: 0,
            created_at: now,
            updated_at: now,
        }
    }

    /// 新一轮用户输入：回到协调者
    pub fn begin_turn(&mut self, message: impl Into<String>) {
        self.turn += 1;
        self.user_messages.push(message.into());
        self.current_stage = StageId::Coordinator;
        self.updated_at = Utc::now();
    }

    /// 追加一次阶段输出；协调者给出的 gathered_info 整体替换旧值
    pub fn record(&mut self, result: StageResult) {
        if result.stage_id == StageId::Coordinator && !self.presenting {
            if let Some(info) = result.gathered_info() {
                self.gathered_info = Some(info.clone());
            }
        }
        self.history.push(result);
        self.updated_at = Utc::now();
    }

    /// 按路由决策推进
    pub fn apply(&mut self, decision: &RoutingDecision) {
        match decision.next {
            RouteTarget::Stage(stage) => {
                self.current_stage = stage;
                self.presenting = matches!(
                    decision.reason,
                    RouteReason::PresentAnswer | RouteReason::PresentPlan
                );
            }
            RouteTarget::Yield => {
                self.current_stage = StageId::Coordinator;
            }
            RouteTarget::End => {
                self.current_stage = StageId::Coordinator;
                self.presenting = false;
                self.terminal = true;
            }
        }
        self.updated_at = Utc::now();
    }

    /// 某阶段最近一次成功输出
    pub fn latest_from(&self, stage: StageId) -> Option<&StageResult> {
        self.history
            .iter()
            .rev()
            .find(|r| r.stage_id == stage && !r.is_failure())
    }

    /// 协调者待呈现的结果：最近一次成功的 Lookup 或 Resolution 输出
    pub fn presentable(&self) -> Option<&StageResult> {
        self.history.iter().rev().find(|r| {
            !r.is_failure() && matches!(r.stage_id, StageId::Lookup | StageId::Resolution)
        })
    }

    /// 最近 n 条用户消息
    pub fn recent_user_messages(&self, n: usize) -> &[String] {
        let start = self.user_messages.len().saturating_sub(n);
        &self.user_messages[start..]
    }
}
