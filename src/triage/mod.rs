//! 对话分诊：会话状态、路由决策、输入组装、会话存储与编排循环

pub mod input;
pub mod orchestrator;
pub mod router;
pub mod session_store;
pub mod state;

pub use input::compose_input;
pub use orchestrator::{ChatRequest, ChatResponse, ConversationOrchestrator, TurnEvent, TurnReply};
pub use router::{decide, FallbackCause, RouteReason, RouteTarget, RoutingDecision};
pub use session_store::{MemorySessionStore, SessionStore};
pub use state::ConversationState;
