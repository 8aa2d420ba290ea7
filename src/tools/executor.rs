//! 工具执行器
//!
//! 持有 ToolRegistry 与全局超时：低风险调用直接执行并返回观察结果；高风险调用不执行，
//! 返回 PendingConfirmation，由控制循环挂起等待确认后调用 execute_confirmed。
//! 每次实际执行输出结构化审计日志（JSON）。

use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use crate::core::AgentError;
use crate::learning::ErrorClass;
use crate::tools::{ConfirmationRequest, RiskLevel, Tool, ToolContext, ToolRegistry};

/// 工具自身时限之外留给清理（收集部分输出、杀进程）的余量
const TIMEOUT_GRACE: Duration = Duration::from_secs(2);

/// 一次工具执行的观察结果
#[derive(Debug, Clone, Serialize)]
pub struct ToolObservation {
    pub tool_call_id: String,
    pub tool: String,
    pub args: Value,
    pub success: bool,
    pub output: String,
    pub error: Option<String>,
    pub exit_code: Option<i32>,
    pub error_class: Option<ErrorClass>,
    pub duration_ms: u64,
}

impl ToolObservation {
    fn failed(tool_call_id: &str, tool: &str, args: Value, error: String, class: ErrorClass) -> Self {
        Self {
            tool_call_id: tool_call_id.to_string(),
            tool: tool.to_string(),
            args,
            success: false,
            output: String::new(),
            error: Some(error),
            exit_code: None,
            error_class: Some(class),
            duration_ms: 0,
        }
    }

    /// 送回模型的观察文本
    pub fn to_prompt(&self) -> String {
        match &self.error {
            None => format!("[{}] ok\n{}", self.tool, self.output),
            Some(e) if self.output.is_empty() => format!("[{}] error: {e}", self.tool),
            Some(e) => format!("[{}] error: {e}\n{}", self.tool, self.output),
        }
    }
}

/// 执行历史中的一条记录（只追加）
#[derive(Debug, Clone, Serialize)]
pub struct ToolExecutionRecord {
    pub tool: String,
    pub args: Value,
    pub success: bool,
    pub error_class: Option<ErrorClass>,
    pub timestamp: DateTime<Utc>,
    pub step_id: Option<u32>,
}

impl ToolExecutionRecord {
    pub fn from_observation(obs: &ToolObservation, step_id: Option<u32>) -> Self {
        Self {
            tool: obs.tool.clone(),
            args: obs.args.clone(),
            success: obs.success,
            error_class: obs.error_class,
            timestamp: Utc::now(),
            step_id,
        }
    }
}

/// 待执行的工具调用
#[derive(Debug, Clone)]
pub struct ToolInvocation {
    pub tool_call_id: String,
    pub tool: String,
    pub args: Value,
}

/// execute 的结果
#[derive(Debug, Clone)]
pub enum ExecutionOutcome {
    Completed(ToolObservation),
    /// 高风险：未执行，等待确认；command 为展示给确认方的命令
    PendingConfirmation { command: String },
}

/// 工具执行器：对每次调用施加超时，失败分类后作为观察返回（不向上抛错）
pub struct ToolExecutor {
    registry: Arc<ToolRegistry>,
    timeout: Duration,
}

impl ToolExecutor {
    pub fn new(registry: Arc<ToolRegistry>, timeout_secs: u64) -> Self {
        Self {
            registry,
            timeout: Duration::from_secs(timeout_secs.max(1)),
        }
    }

    pub fn tool_names(&self) -> Vec<String> {
        self.registry.tool_names()
    }

    pub fn registry(&self) -> &ToolRegistry {
        &self.registry
    }

    /// 低风险直接执行；高风险返回 PendingConfirmation；未知工具返回 HallucinatedTool
    pub async fn execute(
        &self,
        call: &ToolInvocation,
        cancel: &CancellationToken,
    ) -> Result<ExecutionOutcome, AgentError> {
        let tool = self
            .registry
            .get(&call.tool)
            .ok_or_else(|| AgentError::HallucinatedTool(call.tool.clone()))?;
        if tool.risk(&call.args) == RiskLevel::High {
            let command = tool.command_preview(&call.args);
            tracing::info!(tool = %call.tool, command = %command, "high-risk tool call requires confirmation");
            return Ok(ExecutionOutcome::PendingConfirmation { command });
        }
        Ok(ExecutionOutcome::Completed(
            self.run(tool, &call.tool_call_id, call.args.clone(), cancel).await,
        ))
    }

    /// 确认后按确认方给出的命令执行（不再做风险判断）
    pub async fn execute_confirmed(
        &self,
        request: &ConfirmationRequest,
        command: &str,
        cancel: &CancellationToken,
    ) -> ToolObservation {
        let Some(tool) = self.registry.get(&request.tool) else {
            return ToolObservation::failed(
                &request.tool_call_id,
                &request.tool,
                request.args.clone(),
                format!("Unknown tool: {}", request.tool),
                ErrorClass::UnknownTool,
            );
        };
        let args = tool.confirmed_args(&request.args, command);
        self.run(tool, &request.tool_call_id, args, cancel).await
    }

    async fn run(
        &self,
        tool: Arc<dyn Tool>,
        tool_call_id: &str,
        args: Value,
        cancel: &CancellationToken,
    ) -> ToolObservation {
        let name = tool.name().to_string();
        let start = Instant::now();
        let preview = args_preview(&args);
        let ctx = ToolContext::new(cancel.child_token(), self.timeout);

        let result = tokio::select! {
            r = tokio::time::timeout(self.timeout + TIMEOUT_GRACE, tool.execute(args.clone(), &ctx)) => {
                r.map_err(|_| format!("Tool '{name}' timed out after {}s", self.timeout.as_secs()))
            }
            _ = cancel.cancelled() => Err("cancelled".to_string()),
        };

        let (ok, outcome): (bool, &str) = match &result {
            Ok(Ok(out)) if out.success() => (true, "ok"),
            Ok(Ok(_)) => (false, "nonzero_exit"),
            Ok(Err(_)) => (false, "error"),
            Err(_) => (false, "timeout_or_cancelled"),
        };
        let duration_ms = start.elapsed().as_millis() as u64;
        let audit = serde_json::json!({
            "event": "tool_audit",
            "tool": name,
            "tool_call_id": tool_call_id,
            "ok": ok,
            "outcome": outcome,
            "duration_ms": duration_ms,
            "args_preview": preview,
        });
        tracing::info!(audit = %audit.to_string(), "tool");

        let mut obs = match result {
            Ok(Ok(out)) if out.success() => ToolObservation {
                tool_call_id: tool_call_id.to_string(),
                tool: name,
                args,
                success: true,
                output: out.content,
                error: None,
                exit_code: out.exit_code,
                error_class: None,
                duration_ms: 0,
            },
            Ok(Ok(out)) => {
                let code = out.exit_code.unwrap_or(-1);
                let message = format!("exit code {code}");
                ToolObservation {
                    tool_call_id: tool_call_id.to_string(),
                    tool: name,
                    args,
                    success: false,
                    error_class: Some(ErrorClass::classify(&format!("{message} {}", out.content))),
                    output: out.content,
                    error: Some(message),
                    exit_code: out.exit_code,
                    duration_ms: 0,
                }
            }
            Ok(Err(e)) | Err(e) => {
                let class = ErrorClass::classify(&e);
                ToolObservation::failed(tool_call_id, &name, args, e, class)
            }
        };
        obs.duration_ms = duration_ms;
        obs
    }
}

fn args_preview(args: &Value) -> String {
    let s = args.to_string();
    if s.chars().count() > 200 {
        format!("{}...", s.chars().take(200).collect::<String>())
    } else {
        s
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ShellSection;
    use crate::tools::{EchoTool, RunInTerminalTool};

    fn executor() -> ToolExecutor {
        let mut registry = ToolRegistry::new();
        registry.register(EchoTool);
        registry.register(RunInTerminalTool::new(&ShellSection::default(), std::env::temp_dir()));
        ToolExecutor::new(Arc::new(registry), 5)
    }

    fn call(tool: &str, args: Value) -> ToolInvocation {
        ToolInvocation {
            tool_call_id: "call-1".into(),
            tool: tool.into(),
            args,
        }
    }

    #[tokio::test]
    async fn test_low_risk_runs_immediately() {
        let exec = executor();
        let outcome = exec
            .execute(&call("echo", serde_json::json!({"text": "hi"})), &CancellationToken::new())
            .await
            .unwrap();
        match outcome {
            ExecutionOutcome::Completed(obs) => {
                assert!(obs.success);
                assert_eq!(obs.output, "hi");
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_high_risk_is_not_executed() {
        let exec = executor();
        let outcome = exec
            .execute(
                &call("run_in_terminal", serde_json::json!({"command": "rm important.txt"})),
                &CancellationToken::new(),
            )
            .await
            .unwrap();
        assert!(matches!(outcome, ExecutionOutcome::PendingConfirmation { command } if command == "rm important.txt"));
    }

    #[tokio::test]
    async fn test_unknown_tool_is_hallucinated() {
        let exec = executor();
        let err = exec
            .execute(&call("teleport", Value::Null), &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, AgentError::HallucinatedTool(name) if name == "teleport"));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_confirmed_runs_exact_command() {
        let exec = executor();
        let request = ConfirmationRequest {
            task_id: "t".into(),
            tool_call_id: "call-1".into(),
            confirmation_id: "conf-1".into(),
            tool: "run_in_terminal".into(),
            args: serde_json::json!({"command": "rm nothing-here"}),
            command: "rm nothing-here".into(),
            step_id: None,
            requested_at: Utc::now(),
        };
        let obs = exec
            .execute_confirmed(&request, "echo confirmed", &CancellationToken::new())
            .await;
        assert!(obs.success);
        assert_eq!(obs.output, "confirmed");
        assert_eq!(obs.args["command"], "echo confirmed");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_nonzero_exit_is_failure() {
        let exec = executor();
        let outcome = exec
            .execute(
                &call("run_in_terminal", serde_json::json!({"command": "ls /definitely/missing/dir"})),
                &CancellationToken::new(),
            )
            .await
            .unwrap();
        let ExecutionOutcome::Completed(obs) = outcome else {
            panic!("expected completion");
        };
        assert!(!obs.success);
        assert!(obs.exit_code.is_some());
        assert_eq!(obs.error_class, Some(ErrorClass::NotFound));
    }
}
