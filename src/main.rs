//! Hive - 任务编排控制循环命令行入口
//!
//! 用法：`hive [--config <path>] "<goal>"`，目标以 `/skill-id` 开头时绑定对应技能。
//! 过程事件以 JSON Lines 写到 stdout；高风险命令在 stdin 上确认：
//! `y` 同意原命令，回车或 `n` 拒绝，其他文本视为修改后的命令。Ctrl+C 取消任务。

use std::path::PathBuf;
use std::time::Duration;

use anyhow::Context;
use hive::config::load_config;
use hive::core::{Orchestrator, TaskHandle};
use hive::react::LoopEvent;
use hive::tools::ConfirmationResponse;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, BufReader, Lines};

fn parse_args() -> anyhow::Result<(Option<PathBuf>, String)> {
    let mut args = std::env::args().skip(1);
    let mut config_path = None;
    let mut goal = Vec::new();
    while let Some(arg) = args.next() {
        if arg == "--config" {
            let path = args.next().context("--config requires a path")?;
            config_path = Some(PathBuf::from(path));
        } else {
            goal.push(arg);
        }
    }
    let goal = goal.join(" ");
    if goal.trim().is_empty() {
        anyhow::bail!("usage: hive [--config <path>] \"<goal>\"");
    }
    Ok((config_path, goal))
}

/// 在确认时限内读一行；超时、EOF 或读失败返回 None
async fn read_reply<R>(lines: &mut Lines<R>, limit: Duration) -> Option<String>
where
    R: AsyncBufRead + Unpin,
{
    match tokio::time::timeout(limit, lines.next_line()).await {
        Ok(Ok(line)) => line,
        Ok(Err(e)) => {
            tracing::warn!(error = %e, "failed to read confirmation reply");
            None
        }
        Err(_) => None,
    }
}

/// 读取一行确认输入并回复给任务；时限内无回复按拒绝处理
async fn answer_confirmation<R>(
    handle: &TaskHandle,
    input: &mut Lines<R>,
    limit: Duration,
    tool_call_id: String,
    confirmation_id: String,
    command: String,
) where
    R: AsyncBufRead + Unpin,
{
    eprintln!("Run `{command}`? [y / N / edited command]");
    let Some(line) = read_reply(input, limit).await else {
        eprintln!("No reply within {}s, command cancelled", limit.as_secs());
        if let Err(e) = handle.cancel_confirmation(&confirmation_id) {
            tracing::debug!(error = %e, "confirmation already resolved");
        }
        return;
    };
    let answer = line.trim();
    let result = match answer {
        "" | "n" | "N" | "no" => handle.cancel_confirmation(&confirmation_id),
        "y" | "Y" | "yes" => handle.confirm(ConfirmationResponse {
            tool_call_id,
            confirmation_id,
            command,
        }),
        edited => handle.confirm(ConfirmationResponse {
            tool_call_id,
            confirmation_id,
            command: edited.to_string(),
        }),
    };
    if let Err(e) = result {
        // 可能已超时被移除
        tracing::warn!(error = %e, "confirmation reply was not accepted");
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let (config_path, goal) = parse_args()?;
    let config = load_config(config_path).context("Failed to load config")?;
    hive::observability::init(config.app.log_level.as_deref().unwrap_or("info"));

    let orchestrator =
        Orchestrator::from_config(&config).context("Failed to create orchestrator")?;
    let mut handle = orchestrator.spawn_task(goal);
    let mut stdin = BufReader::new(tokio::io::stdin()).lines();
    let reply_limit = Duration::from_secs(config.tools.confirmation_timeout_secs.max(1));

    loop {
        tokio::select! {
            event = handle.next_event() => {
                let Some(event) = event else { break };
                println!("{}", serde_json::to_string(&event)?);
                if let LoopEvent::AwaitingConfirmation { tool_call_id, confirmation_id, command } = event {
                    tokio::select! {
                        _ = answer_confirmation(&handle, &mut stdin, reply_limit, tool_call_id, confirmation_id, command) => {}
                        _ = tokio::signal::ctrl_c() => handle.abort(),
                    }
                }
            }
            _ = tokio::signal::ctrl_c() => {
                tracing::warn!("interrupted, cancelling task");
                handle.abort();
            }
        }
    }

    let outcome = handle.join().await.context("Task did not complete")?;
    orchestrator.shutdown();
    if !outcome.success {
        std::process::exit(1);
    }
    Ok(())
}
