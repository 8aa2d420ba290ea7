//! run_in_terminal：受限 Shell 执行
//!
//! - 禁止子串（rm -rf、mkfs、fork bomb 等）一律拒绝
//! - allowed_commands 非空时只允许其中的命令名（首词）
//! - 命中 high_risk_patterns 的命令标记为 High，需确认后执行
//! - 子进程可取消、受时限约束；取消或超时时返回已收集到的部分输出

use std::collections::HashSet;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;
use serde_json::Value;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::Command;
use tokio::task::JoinHandle;
use tokio::time::Instant;

use crate::config::ShellSection;
use crate::tools::{RiskLevel, Tool, ToolContext, ToolOutput};

/// 禁止的命令/子串（即使白名单中有同名，也不允许带这些参数）
const FORBIDDEN_SUBSTR: &[&str] = &[
    "rm -rf /",
    "rm -fr /",
    "mkfs",
    "dd if=",
    "> /dev/sd",
    "chmod 777 /",
    "curl | sh",
    "wget | sh",
    ":(){ :|:& };:", // fork bomb
];

/// 输出上限，超出部分丢弃
const MAX_OUTPUT_BYTES: usize = 64 * 1024;

type SharedBuf = Arc<Mutex<String>>;

fn spawn_reader<R>(reader: R, buf: SharedBuf, prefix: &'static str) -> JoinHandle<()>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut lines = BufReader::new(reader).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            let mut b = buf.lock().unwrap_or_else(PoisonError::into_inner);
            if b.len() < MAX_OUTPUT_BYTES {
                b.push_str(prefix);
                b.push_str(&line);
                b.push('\n');
            }
        }
    })
}

/// Shell 工具
pub struct RunInTerminalTool {
    allowed_commands: HashSet<String>,
    high_risk_patterns: Vec<String>,
    workdir: PathBuf,
}

impl RunInTerminalTool {
    pub fn new(config: &ShellSection, workdir: impl Into<PathBuf>) -> Self {
        Self {
            allowed_commands: config
                .allowed_commands
                .iter()
                .map(|s| s.to_lowercase())
                .collect(),
            high_risk_patterns: config
                .high_risk_patterns
                .iter()
                .map(|s| s.to_lowercase())
                .collect(),
            workdir: workdir.into(),
        }
    }

    fn command_arg(args: &Value) -> &str {
        args.get("command")
            .and_then(|v| v.as_str())
            .unwrap_or("")
            .trim()
    }

    fn is_allowed(&self, raw: &str) -> Result<(), String> {
        let raw_lower = raw.to_lowercase();
        for forbidden in FORBIDDEN_SUBSTR {
            if raw_lower.contains(forbidden) {
                return Err(format!("Forbidden pattern: {forbidden}"));
            }
        }
        let name = raw_lower.split_whitespace().next().unwrap_or("");
        if name.is_empty() {
            return Err("Empty command".to_string());
        }
        if self.allowed_commands.is_empty() || self.allowed_commands.contains(name) {
            return Ok(());
        }
        Err(format!("Command '{name}' not in allowlist"))
    }

    pub fn is_high_risk(&self, command: &str) -> bool {
        // 末尾补空格，使 "rm " 之类的模式也能匹配命令末尾的词
        let padded = format!("{} ", command.to_lowercase());
        self.high_risk_patterns.iter().any(|p| padded.contains(p.as_str()))
    }
}

#[async_trait]
impl Tool for RunInTerminalTool {
    fn name(&self) -> &str {
        "run_in_terminal"
    }

    fn description(&self) -> &str {
        "Run a shell command in the workspace. Destructive commands require user confirmation. Args: {\"command\": \"...\"}"
    }

    fn parameters_schema(&self) -> Value {
        serde_json::json!({
            "type": "object",
            "properties": {
                "command": {
                    "type": "string",
                    "description": "The shell command to execute"
                }
            },
            "required": ["command"]
        })
    }

    fn risk(&self, args: &Value) -> RiskLevel {
        if self.is_high_risk(Self::command_arg(args)) {
            RiskLevel::High
        } else {
            RiskLevel::Low
        }
    }

    async fn execute(&self, args: Value, ctx: &ToolContext) -> Result<ToolOutput, String> {
        let command = Self::command_arg(&args);
        self.is_allowed(command)?;

        tracing::info!(command = %command, "run_in_terminal execute");

        let mut cmd = if cfg!(target_os = "windows") {
            let mut c = Command::new("cmd");
            c.args(["/C", command]);
            c
        } else {
            let mut c = Command::new("sh");
            c.args(["-c", command]);
            c
        };
        cmd.current_dir(&self.workdir)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        // 独立进程组，超时/取消时连同后台子进程一起结束
        #[cfg(unix)]
        cmd.process_group(0);

        let deadline = Instant::now() + ctx.timeout;
        let mut child = cmd.spawn().map_err(|e| format!("Execution failed: {e}"))?;
        let pid = child.id();
        let buf: SharedBuf = Arc::new(Mutex::new(String::new()));
        let mut readers = Vec::new();
        if let Some(out) = child.stdout.take() {
            readers.push(spawn_reader(out, buf.clone(), ""));
        }
        if let Some(err) = child.stderr.take() {
            readers.push(spawn_reader(err, buf.clone(), "stderr: "));
        }

        let interrupted = tokio::select! {
            status = child.wait() => {
                let status = status.map_err(|e| format!("Execution failed: {e}"))?;
                // 后台进程可能仍持有管道：剩余时限内收集输出，之后放弃
                let drained = tokio::select! {
                    res = tokio::time::timeout_at(deadline, join_readers(&mut readers)) => res.is_ok(),
                    _ = ctx.cancel.cancelled() => false,
                };
                if !drained {
                    tracing::warn!(command = %command, "output pipes still open after exit, dropping background processes");
                    kill_group(pid).await;
                    for r in &readers {
                        r.abort();
                    }
                }
                let content = buf.lock().unwrap_or_else(PoisonError::into_inner).clone();
                return Ok(ToolOutput::with_exit_code(
                    content.trim_end().to_string(),
                    status.code().unwrap_or(-1),
                ));
            }
            _ = ctx.cancel.cancelled() => "cancelled".to_string(),
            _ = tokio::time::sleep_until(deadline) => format!("timed out after {}s", ctx.timeout.as_secs()),
        };

        kill_group(pid).await;
        let _ = child.kill().await;
        for r in &readers {
            r.abort();
        }
        let partial = buf.lock().unwrap_or_else(PoisonError::into_inner).clone();
        tracing::warn!(command = %command, reason = %interrupted, "run_in_terminal interrupted");
        Err(format!(
            "Command {interrupted}. Partial output:\n{}",
            partial.trim_end()
        ))
    }
}

async fn join_readers(readers: &mut [JoinHandle<()>]) {
    for r in readers.iter_mut() {
        let _ = r.await;
    }
}

/// 结束整个进程组（尽力而为）
#[cfg(unix)]
async fn kill_group(pid: Option<u32>) {
    if let Some(pid) = pid {
        let _ = Command::new("kill")
            .args(["-KILL", "--", &format!("-{pid}")])
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .await;
    }
}

#[cfg(not(unix))]
async fn kill_group(_pid: Option<u32>) {}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio_util::sync::CancellationToken;

    fn tool(allowed: &[&str]) -> RunInTerminalTool {
        let config = ShellSection {
            allowed_commands: allowed.iter().map(|s| s.to_string()).collect(),
            ..ShellSection::default()
        };
        RunInTerminalTool::new(&config, std::env::temp_dir())
    }

    fn ctx(secs: u64) -> ToolContext {
        ToolContext::new(CancellationToken::new(), Duration::from_secs(secs))
    }

    #[test]
    fn test_risk_classification() {
        let t = tool(&[]);
        assert_eq!(t.risk(&serde_json::json!({"command": "rm notes.txt"})), RiskLevel::High);
        assert_eq!(t.risk(&serde_json::json!({"command": "git push origin main"})), RiskLevel::High);
        assert_eq!(t.risk(&serde_json::json!({"command": "ls -la"})), RiskLevel::Low);
        assert_eq!(t.risk(&serde_json::json!({"command": "echo format"})), RiskLevel::Low);
    }

    #[test]
    fn test_allowlist_and_forbidden() {
        let t = tool(&["ls", "echo"]);
        assert!(t.is_allowed("ls -la").is_ok());
        assert!(t.is_allowed("cat /etc/hosts").is_err());
        assert!(t.is_allowed("").is_err());
        let open = tool(&[]);
        assert!(open.is_allowed("rm -rf /").is_err());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_exit_code_captured() {
        let t = tool(&[]);
        let out = t
            .execute(serde_json::json!({"command": "echo hi; exit 3"}), &ctx(5))
            .await
            .unwrap();
        assert_eq!(out.exit_code, Some(3));
        assert!(out.content.contains("hi"));
        assert!(!out.success());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_timeout_returns_partial_output() {
        let t = tool(&[]);
        let err = t
            .execute(serde_json::json!({"command": "echo started; sleep 5"}), &ctx(1))
            .await
            .unwrap_err();
        assert!(err.contains("timed out"));
        assert!(err.contains("started"));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_cancel_stops_command() {
        let t = tool(&[]);
        let c = ctx(30);
        let cancel = c.cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(200)).await;
            cancel.cancel();
        });
        let err = t
            .execute(serde_json::json!({"command": "sleep 10"}), &c)
            .await
            .unwrap_err();
        assert!(err.contains("cancelled"));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_background_process_does_not_hide_exit() {
        let t = tool(&[]);
        let started = std::time::Instant::now();
        let out = t
            .execute(serde_json::json!({"command": "echo started; sleep 20 &"}), &ctx(1))
            .await
            .unwrap();
        assert!(started.elapsed() < Duration::from_secs(3));
        assert_eq!(out.exit_code, Some(0));
        assert!(out.success());
        assert!(out.content.contains("started"));
    }
}
