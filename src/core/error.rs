//! Agent 错误类型与恢复动作
//!
//! 与 RecoveryEngine 配合：可恢复错误（格式错误、未知工具）转为 RetryWithPrompt，
//! 其余（Provider 全部失败、配置/路径错误）终止当前任务。

use thiserror::Error;

use crate::llm::LlmError;

/// 控制循环运行过程中可能出现的错误
#[derive(Error, Debug)]
pub enum AgentError {
    #[error("JSON parse error: {0}")]
    JsonParseError(String),

    #[error("Tool execution failed: {0}")]
    ToolExecutionFailed(String),

    #[error("Hallucinated tool: {0}")]
    HallucinatedTool(String),

    #[error("LLM error: {0}")]
    Llm(#[from] LlmError),

    #[error("Config error: {0}")]
    ConfigError(String),

    #[error("Path escape attempt: {0}")]
    PathEscape(String),

    #[error("Task join error: {0}")]
    TaskJoin(String),
}

/// 恢复引擎根据错误类型给出的建议动作
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecoveryAction {
    /// 将提示注入下一轮，让 LLM 重试（如 JSON 格式错误）
    RetryWithPrompt(String),
    /// 终止当前任务
    Abort,
}
