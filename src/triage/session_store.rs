//! 会话存储抽象层
//!
//! 会话状态按 session_id 存取；每个会话同一时刻只有一个写者（由编排器的会话锁保证）。

use std::collections::HashMap;

use async_trait::async_trait;
use tokio::sync::RwLock;

use crate::triage::ConversationState;

/// 会话存储接口
#[async_trait]
pub trait SessionStore: Send + Sync {
    async fn load(&self, session_id: &str) -> Option<ConversationState>;

    async fn save(&self, state: ConversationState);

    async fn active_count(&self) -> usize;
}

/// 内存会话存储
#[derive(Debug, Default)]
pub struct MemorySessionStore {
    sessions: RwLock<HashMap<String, ConversationState>>,
}

impl MemorySessionStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl SessionStore for MemorySessionStore {
    async fn load(&self, session_id: &str) -> Option<ConversationState> {
        self.sessions.read().await.get(session_id).cloned()
    }

    async fn save(&self, state: ConversationState) {
        self.sessions
            .write()
            .await
            .insert(state.session_id.clone(), state);
    }

    async fn active_count(&self) -> usize {
        self.sessions
            .read()
            .await
            .values()
            .filter(|s| !s.terminal)
            .count()
    }
}
