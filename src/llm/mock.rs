//! Mock LLM 客户端（用于测试与无 API Key 的本地运行）
//!
//! - MockLlmClient：首轮回显为 echo Tool Call，看到工具观察结果后直接给出最终回复
//! - ScriptedLlmClient：按脚本依次返回文本 / 错误 / 挂起，用于驱动控制循环与 Router 测试

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, PoisonError};

use async_trait::async_trait;

use crate::llm::{Completion, CompletionOptions, LlmClient, LlmError, Usage};
use crate::memory::{Message, Role};

fn estimate_usage(messages: &[Message], reply: &str) -> Usage {
    let prompt: usize = messages.iter().map(|m| m.content.len() / 4).sum();
    Usage::new(prompt as u64, (reply.len() / 4) as u64)
}

/// Mock 客户端：回显用户最后一条消息
#[derive(Debug, Default)]
pub struct MockLlmClient;

#[async_trait]
impl LlmClient for MockLlmClient {
    async fn complete(
        &self,
        messages: &[Message],
        _options: &CompletionOptions,
    ) -> Result<Completion, LlmError> {
        let reply = match messages.last() {
            Some(m) if m.role == Role::Tool => {
                format!("Done. Last observation:\n{}", m.content)
            }
            _ => {
                let last_user = messages
                    .iter()
                    .rev()
                    .find(|m| m.role == Role::User)
                    .map(|m| m.content.as_str())
                    .unwrap_or("(no input)");
                serde_json::json!({
                    "tool": "echo",
                    "args": { "text": format!("Echo from Mock: {last_user}") }
                })
                .to_string()
            }
        };
        let usage = estimate_usage(messages, &reply);
        Ok(Completion::new(reply, usage))
    }
}

/// 脚本中的一条回复
#[derive(Debug, Clone)]
pub enum ScriptedReply {
    Text(String),
    Fail(String),
    /// 永不返回（用于超时 / 取消测试）
    Hang,
}

impl ScriptedReply {
    pub fn text(s: impl Into<String>) -> Self {
        Self::Text(s.into())
    }

    /// 便捷构造：JSON Tool Call
    pub fn tool(name: &str, args: serde_json::Value) -> Self {
        Self::Text(serde_json::json!({ "tool": name, "args": args }).to_string())
    }

    pub fn fail(s: impl Into<String>) -> Self {
        Self::Fail(s.into())
    }
}

/// 脚本化客户端：依次弹出回复；脚本耗尽后重复 `exhausted` 回复（默认报错）
pub struct ScriptedLlmClient {
    script: Mutex<VecDeque<ScriptedReply>>,
    exhausted: ScriptedReply,
    calls: AtomicUsize,
    seen: Mutex<Vec<Vec<Message>>>,
}

impl ScriptedLlmClient {
    pub fn new(script: impl IntoIterator<Item = ScriptedReply>) -> Self {
        Self {
            script: Mutex::new(script.into_iter().collect()),
            exhausted: ScriptedReply::Fail("script exhausted".to_string()),
            calls: AtomicUsize::new(0),
            seen: Mutex::new(Vec::new()),
        }
    }

    /// 始终返回同一回复
    pub fn repeating(reply: ScriptedReply) -> Self {
        Self {
            exhausted: reply,
            ..Self::new(Vec::new())
        }
    }

    pub fn with_exhausted(mut self, reply: ScriptedReply) -> Self {
        self.exhausted = reply;
        self
    }

    /// 已发生的调用次数
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// 每次调用收到的消息（含 system）
    pub fn seen_messages(&self) -> Vec<Vec<Message>> {
        self.seen.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    pub fn push(&self, reply: ScriptedReply) {
        self.script
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push_back(reply);
    }
}

#[async_trait]
impl LlmClient for ScriptedLlmClient {
    async fn complete(
        &self,
        messages: &[Message],
        _options: &CompletionOptions,
    ) -> Result<Completion, LlmError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.seen
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(messages.to_vec());
        let next = self
            .script
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .pop_front()
            .unwrap_or_else(|| self.exhausted.clone());
        match next {
            ScriptedReply::Text(text) => {
                let usage = estimate_usage(messages, &text);
                Ok(Completion::new(text, usage))
            }
            ScriptedReply::Fail(e) => Err(LlmError::ApiError(e)),
            ScriptedReply::Hang => std::future::pending().await,
        }
    }
}
