//! 核心层：错误分类、恢复话术、协作式中断

pub mod error;
pub mod recovery;
pub mod shutdown;

pub use error::{truncate_chars, FailureKind, TriageError};
pub use recovery::{RecoveryAction, RecoveryEngine};
pub use shutdown::{ShutdownManager, ShutdownReason};
