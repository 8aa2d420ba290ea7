//! 高风险操作的确认挂起 / 恢复
//!
//! 控制循环遇到 High 风险调用时，把 ConfirmationRequest 登记到 ConfirmationBroker 并让出控制，
//! 直到外部发来 confirm / cancel（或会话超时、任务取消）。挂起期间不轮询，只等待 oneshot。

use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;

/// 挂起中的工具调用（跨挂起边界保存的恢复令牌）
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConfirmationRequest {
    pub task_id: String,
    pub tool_call_id: String,
    pub confirmation_id: String,
    pub tool: String,
    pub args: serde_json::Value,
    pub command: String,
    pub step_id: Option<u32>,
    pub requested_at: DateTime<Utc>,
}

/// 外部确认消息：{toolCallId, confirmationId, command}
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConfirmationResponse {
    pub tool_call_id: String,
    pub confirmation_id: String,
    pub command: String,
}

/// 确认结果
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfirmationDecision {
    /// 按该命令原样执行
    Proceed { command: String },
    Cancelled { reason: String },
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfirmationError {
    #[error("No pending confirmation: {0}")]
    Unknown(String),

    #[error("Tool call mismatch for confirmation {confirmation_id}: expected {expected}, got {got}")]
    ToolCallMismatch {
        confirmation_id: String,
        expected: String,
        got: String,
    },
}

/// 等待确认的凭据；由 register 返回，交给 wait 消费
#[derive(Debug)]
pub struct ConfirmationTicket {
    pub request: ConfirmationRequest,
    receiver: oneshot::Receiver<ConfirmationDecision>,
}

struct PendingEntry {
    request: ConfirmationRequest,
    sender: oneshot::Sender<ConfirmationDecision>,
}

/// 挂起中确认的登记处
#[derive(Default)]
pub struct ConfirmationBroker {
    pending: Mutex<HashMap<String, PendingEntry>>,
}

impl ConfirmationBroker {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, PendingEntry>> {
        self.pending.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn register(&self, request: ConfirmationRequest) -> ConfirmationTicket {
        let (sender, receiver) = oneshot::channel();
        self.lock().insert(
            request.confirmation_id.clone(),
            PendingEntry {
                request: request.clone(),
                sender,
            },
        );
        ConfirmationTicket { request, receiver }
    }

    /// 批准：tool_call_id 必须与登记时一致
    pub fn confirm(&self, response: ConfirmationResponse) -> Result<(), ConfirmationError> {
        let mut pending = self.lock();
        let entry = pending
            .get(&response.confirmation_id)
            .ok_or_else(|| ConfirmationError::Unknown(response.confirmation_id.clone()))?;
        if entry.request.tool_call_id != response.tool_call_id {
            return Err(ConfirmationError::ToolCallMismatch {
                confirmation_id: response.confirmation_id.clone(),
                expected: entry.request.tool_call_id.clone(),
                got: response.tool_call_id,
            });
        }
        if let Some(entry) = pending.remove(&response.confirmation_id) {
            let _ = entry.sender.send(ConfirmationDecision::Proceed {
                command: response.command,
            });
        }
        Ok(())
    }

    pub fn cancel(&self, confirmation_id: &str) -> Result<(), ConfirmationError> {
        let entry = self
            .lock()
            .remove(confirmation_id)
            .ok_or_else(|| ConfirmationError::Unknown(confirmation_id.to_string()))?;
        let _ = entry.sender.send(ConfirmationDecision::Cancelled {
            reason: "cancelled by user".to_string(),
        });
        Ok(())
    }

    /// 取消所有挂起中的确认
    pub fn cancel_all(&self, reason: &str) {
        let drained: Vec<PendingEntry> = self.lock().drain().map(|(_, e)| e).collect();
        for entry in drained {
            let _ = entry.sender.send(ConfirmationDecision::Cancelled {
                reason: reason.to_string(),
            });
        }
    }

    pub fn pending(&self) -> Vec<ConfirmationRequest> {
        self.lock().values().map(|e| e.request.clone()).collect()
    }

    /// 挂起直到外部决定；超时或任务取消均视为 Cancelled，且登记项被移除
    pub async fn wait(
        &self,
        ticket: ConfirmationTicket,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> ConfirmationDecision {
        let id = ticket.request.confirmation_id.clone();
        let decision = tokio::select! {
            d = ticket.receiver => d.unwrap_or(ConfirmationDecision::Cancelled {
                reason: "confirmation channel closed".to_string(),
            }),
            _ = tokio::time::sleep(timeout) => ConfirmationDecision::Cancelled {
                reason: format!("confirmation timed out after {}s", timeout.as_secs()),
            },
            _ = cancel.cancelled() => ConfirmationDecision::Cancelled {
                reason: "task aborted".to_string(),
            },
        };
        self.lock().remove(&id);
        decision
    }
}
