//! 会话监管：任务生命周期与取消
//!
//! 持有根 CancellationToken；每个任务拿到一个子 token，可单独取消，shutdown 时全部取消。

use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};

use tokio_util::sync::CancellationToken;

/// 进程级生命周期管理：根取消令牌 + 活跃任务表
#[derive(Debug, Default)]
pub struct SessionSupervisor {
    cancel_token: CancellationToken,
    tasks: Mutex<HashMap<String, CancellationToken>>,
}

impl SessionSupervisor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel_token.clone()
    }

    /// 登记任务并返回其子 token
    pub fn register(&self, task_id: &str) -> CancellationToken {
        let token = self.cancel_token.child_token();
        self.tasks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(task_id.to_string(), token.clone());
        token
    }

    /// 任务结束后移除
    pub fn finish(&self, task_id: &str) {
        self.tasks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(task_id);
    }

    /// 取消单个任务；任务不存在返回 false
    pub fn cancel_task(&self, task_id: &str) -> bool {
        let tasks = self.tasks.lock().unwrap_or_else(PoisonError::into_inner);
        match tasks.get(task_id) {
            Some(token) => {
                token.cancel();
                true
            }
            None => false,
        }
    }

    pub fn active_tasks(&self) -> Vec<String> {
        let mut ids: Vec<String> = self
            .tasks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .cloned()
            .collect();
        ids.sort();
        ids
    }

    /// 取消全部任务（Ctrl+C / 进程退出）
    pub fn shutdown(&self) {
        tracing::info!(active = self.active_tasks().len(), "supervisor shutting down");
        self.cancel_token.cancel();
    }

    pub fn is_shutdown(&self) -> bool {
        self.cancel_token.is_cancelled()
    }
}
