//! 错误恢复引擎
//!
//! 将失败标记映射为面向用户的话术。用户侧永远看不到原始错误、阶段名或 Schema 细节，
//! 只会收到「仍在排查」或「请补充说明」这类通用回复。

use crate::core::FailureKind;

/// 恢复引擎给出的用户侧动作
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecoveryAction {
    /// 请用户补充或换个说法
    AskUser(String),
    /// 告知用户仍在排查 / 已升级给人工
    Escalate(String),
}

impl RecoveryAction {
    pub fn user_message(&self) -> &str {
        match self {
            RecoveryAction::AskUser(msg) | RecoveryAction::Escalate(msg) => msg,
        }
    }
}

/// 单轮阶段跳数耗尽时的回复
pub const HOP_LIMIT_MESSAGE: &str = "I'm still investigating your request and have passed it to our support team. I'll get back to you as soon as I have an answer.";

/// 会话已结束后再次收到消息时的回复
pub const CONVERSATION_CLOSED_MESSAGE: &str = "This conversation has already been concluded. Please start a new conversation if you need further help.";

/// 语义化错误恢复：失败类型 -> 用户话术
#[derive(Debug, Default)]
pub struct RecoveryEngine;

impl RecoveryEngine {
    pub fn new() -> Self {
        Self
    }

    pub fn handle(&self, kind: FailureKind) -> RecoveryAction {
        match kind {
            FailureKind::Transient => RecoveryAction::Escalate(
                "Sorry, I'm still looking into this. Please give me a moment and send your message again.".to_string(),
            ),
            FailureKind::Malformed | FailureKind::InvalidPayload => RecoveryAction::AskUser(
                "Sorry, I couldn't fully understand the problem yet. Could you rephrase it or add a few more details?".to_string(),
            ),
            FailureKind::Unavailable => RecoveryAction::Escalate(
                "Sorry, I can't complete the analysis right now. I've escalated your request to our support team.".to_string(),
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_recovery_transient() {
        let engine = RecoveryEngine::new();
        assert!(matches!(
            engine.handle(FailureKind::Transient),
            RecoveryAction::Escalate(_)
        ));
    }

    #[test]
    fn test_recovery_invalid_payload_asks_user() {
        let engine = RecoveryEngine::new();
        let action = engine.handle(FailureKind::InvalidPayload);
        assert!(matches!(action, RecoveryAction::AskUser(_)));
        assert!(action.user_message().contains("rephrase"));
    }

    #[test]
    fn test_recovery_messages_are_not_technical() {
        let engine = RecoveryEngine::new();
        for kind in [
            FailureKind::Transient,
            FailureKind::Malformed,
            FailureKind::InvalidPayload,
            FailureKind::Unavailable,
        ] {
            let msg = engine.handle(kind).user_message().to_lowercase();
            assert!(!msg.contains("json"));
            assert!(!msg.contains("error"));
            assert!(!msg.contains("stage"));
        }
    }
}
