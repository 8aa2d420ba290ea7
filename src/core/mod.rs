//! 核心编排层：错误与恢复、会话监管、任务编排

pub mod error;
pub mod orchestrator;
pub mod recovery;
pub mod session_supervisor;

pub use error::{AgentError, RecoveryAction};
pub use orchestrator::{Orchestrator, TaskHandle};
pub use recovery::RecoveryEngine;
pub use session_supervisor::SessionSupervisor;
