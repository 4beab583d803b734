//! Router：纯决策函数
//!
//! 输入最近一次阶段输出与会话状态，按固定的信号表给出下一步；无 I/O、无副作用。
//! 阶段自报的 `next_node` 只作参考：未知取值回退到协调者，已知但与表不符的取值被忽略。
//!
//! | 产出阶段 | 信号 | 决策 |
//! |---|---|---|
//! | Coordinator（非呈现） | 有 gathered_info | → Lookup |
//! | Coordinator（非呈现） | 有 user_message | 让出给用户 |
//! | Lookup | status == answered | → Coordinator（呈现） |
//! | Lookup | status == not_found | → Diagnosis |
//! | Diagnosis | 恒定 | → Resolution |
//! | Resolution | 恒定 | → Coordinator（呈现） |
//! | Coordinator（呈现中） | 有 user_message | END |
//! | 任意 | 失败 / 无法识别 | → Coordinator（错误标记） |

use serde::Serialize;

use crate::core::FailureKind;
use crate::stage::{StageId, StageResult};
use crate::triage::ConversationState;

/// 路由目标
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case", tag = "kind", content = "stage")]
pub enum RouteTarget {
    Stage(StageId),
    /// 等待下一条用户输入
    Yield,
    /// 会话结束
    End,
}

/// 回退原因
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FallbackCause {
    StageFailed(FailureKind),
    UnrecognizedPayload,
    RejectedHint(String),
}

/// 决策依据
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RouteReason {
    NeedsLookup,
    AwaitUser,
    PresentAnswer,
    Escalate,
    FixedEdge,
    PresentPlan,
    Concluded,
    Fallback(FallbackCause),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RoutingDecision {
    pub next: RouteTarget,
    pub reason: RouteReason,
    /// 与信号表不一致而被忽略的阶段自报路由
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ignored_hint: Option<String>,
}

impl RoutingDecision {
    pub fn new(next: RouteTarget, reason: RouteReason) -> Self {
        Self {
            next,
            reason,
            ignored_hint: None,
        }
    }

    fn fallback(cause: FallbackCause) -> Self {
        Self::new(
            RouteTarget::Stage(StageId::Coordinator),
            RouteReason::Fallback(cause),
        )
    }

    pub fn is_fallback(&self) -> bool {
        matches!(self.reason, RouteReason::Fallback(_))
    }
}

/// 阶段自报路由的合法取值
fn parse_hint(hint: &str) -> Option<RouteTarget> {
    match hint.trim() {
        h if h.eq_ignore_ascii_case("end") => Some(RouteTarget::End),
        h if h.eq_ignore_ascii_case("yield") => Some(RouteTarget::Yield),
        h => h.parse::<StageId>().ok().map(RouteTarget::Stage),
    }
}

/// 信号表
fn table(result: &StageResult, state: &ConversationState) -> RoutingDecision {
    use RouteReason::*;
    use RouteTarget::*;

    if let Some(kind) = result.failure {
        return RoutingDecision::fallback(FallbackCause::StageFailed(kind));
    }

    match result.stage_id {
        StageId::Coordinator if !state.presenting => {
            if result.gathered_info().is_some() {
                RoutingDecision::new(Stage(StageId::Lookup), NeedsLookup)
            } else if result.user_message().is_some() {
                RoutingDecision::new(Yield, AwaitUser)
            } else {
                RoutingDecision::fallback(FallbackCause::UnrecognizedPayload)
            }
        }
        StageId::Coordinator => match result.user_message() {
            Some(_) => RoutingDecision::new(End, Concluded),
            None => RoutingDecision::fallback(FallbackCause::UnrecognizedPayload),
        },
        StageId::Lookup => match result.get_str("status") {
            Some(s) if s.eq_ignore_ascii_case("answered") => {
                RoutingDecision::new(Stage(StageId::Coordinator), PresentAnswer)
            }
            Some(s) if s.eq_ignore_ascii_case("not_found") => {
                RoutingDecision::new(Stage(StageId::Diagnosis), Escalate)
            }
            _ => RoutingDecision::fallback(FallbackCause::UnrecognizedPayload),
        },
        StageId::Diagnosis => RoutingDecision::new(Stage(StageId::Resolution), FixedEdge),
        StageId::Resolution => RoutingDecision::new(Stage(StageId::Coordinator), PresentPlan),
        StageId::KnowledgeBuilder => RoutingDecision::fallback(FallbackCause::UnrecognizedPayload),
    }
}

/// 给出下一步
pub fn decide(result: &StageResult, state: &ConversationState) -> RoutingDecision {
    let mut decision = table(result, state);
    if decision.is_fallback() {
        return decision;
    }

    if let Some(hint) = result.routing_hint() {
        match parse_hint(hint) {
            None => {
                return RoutingDecision::fallback(FallbackCause::RejectedHint(hint.to_string()));
            }
            Some(target) if target != decision.next => {
                decision.ignored_hint = Some(hint.to_string());
            }
            Some(_) => {}
        }
    }
    decision
}
