//! 错误恢复引擎
//!
//! 根据 AgentError 类型返回 RecoveryAction，供控制循环决定是带提示重试还是终止。
//! 重试同样消耗迭代预算，因此不会无限循环。

use crate::core::{AgentError, RecoveryAction};

/// 语义化错误恢复：将错误映射为可执行动作
#[derive(Debug, Default)]
pub struct RecoveryEngine;

impl RecoveryEngine {
    pub fn new() -> Self {
        Self
    }

    /// available_tools 用于在未知工具时提示模型可用工具
    pub fn handle(&self, err: &AgentError, available_tools: &[String]) -> RecoveryAction {
        match err {
            AgentError::JsonParseError(raw) => RecoveryAction::RetryWithPrompt(format!(
                "Your previous reply was not valid JSON: {raw}. \
                 To call a tool, reply with exactly one JSON object and nothing else: \
                 {{\"tool\": \"<name>\", \"args\": {{...}}}}. \
                 For example: {{\"tool\": \"echo\", \"args\": {{\"text\": \"hi\"}}}}. \
                 To finish, reply with plain text."
            )),
            AgentError::HallucinatedTool(name) => {
                let mut tools = available_tools.to_vec();
                tools.sort();
                RecoveryAction::RetryWithPrompt(format!(
                    "Tool '{name}' does not exist. Available tools: {}.",
                    tools.join(", ")
                ))
            }
            // 工具失败以观察形式进入反思，不走这里
            AgentError::Llm(_)
            | AgentError::ToolExecutionFailed(_)
            | AgentError::ConfigError(_)
            | AgentError::PathEscape(_)
            | AgentError::TaskJoin(_) => RecoveryAction::Abort,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::LlmError;

    #[test]
    fn test_recovery_json_parse_error() {
        let engine = RecoveryEngine::new();
        let err = AgentError::JsonParseError("invalid json".to_string());
        match engine.handle(&err, &[]) {
            RecoveryAction::RetryWithPrompt(msg) => assert!(msg.contains("JSON")),
            other => panic!("Expected RetryWithPrompt, got {other:?}"),
        }
    }

    #[test]
    fn test_recovery_hallucinated_tool_lists_tools() {
        let engine = RecoveryEngine::new();
        let err = AgentError::HallucinatedTool("fake_tool".to_string());
        let tools = vec!["read_file".to_string(), "echo".to_string()];
        match engine.handle(&err, &tools) {
            RecoveryAction::RetryWithPrompt(msg) => {
                assert!(msg.contains("fake_tool"));
                assert!(msg.contains("echo, read_file"));
            }
            other => panic!("Expected RetryWithPrompt, got {other:?}"),
        }
    }

    #[test]
    fn test_recovery_path_escape_aborts() {
        let engine = RecoveryEngine::new();
        let err = AgentError::PathEscape("../etc/passwd".to_string());
        assert_eq!(engine.handle(&err, &[]), RecoveryAction::Abort);
    }

    #[test]
    fn test_recovery_provider_exhaustion_aborts() {
        let engine = RecoveryEngine::new();
        let err = AgentError::Llm(LlmError::AllProvidersFailed(Vec::new()));
        assert_eq!(engine.handle(&err, &[]), RecoveryAction::Abort);
    }

}
