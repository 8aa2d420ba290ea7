//! 对话历史：单个任务的消息序列
//!
//! 控制循环按轮次累积 system / user / assistant / tool 消息，整体作为 Provider Router 的输入。

use serde::{Deserialize, Serialize};

/// 消息角色（与 LLM API 一致；Tool 为工具观察结果）
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
    System,
    Tool,
}

/// 单条消息
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Message {
    pub role: Role,
    pub content: String,
}

impl Message {
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            content: content.into(),
        }
    }

    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: Role::System,
            content: content.into(),
        }
    }

    pub fn tool(content: impl Into<String>) -> Self {
        Self {
            role: Role::Tool,
            content: content.into(),
        }
    }
}

/// 任务内对话：首条 system 可替换（重规划时），其余只追加
#[derive(Clone, Debug, Default)]
pub struct Conversation {
    messages: Vec<Message>,
}

impl Conversation {
    pub fn new(system_prompt: impl Into<String>) -> Self {
        Self {
            messages: vec![Message::system(system_prompt)],
        }
    }

    pub fn push(&mut self, msg: Message) {
        self.messages.push(msg);
    }

    /// 替换首条 system 消息（不存在则插入到最前）
    pub fn replace_system(&mut self, system_prompt: impl Into<String>) {
        let system = Message::system(system_prompt);
        match self.messages.first_mut() {
            Some(first) if first.role == Role::System => *first = system,
            _ => self.messages.insert(0, system),
        }
    }

    pub fn messages(&self) -> &[Message] {
        &self.messages
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_replace_system_keeps_history() {
        let mut conv = Conversation::new("v1");
        conv.push(Message::user("goal"));
        conv.replace_system("v2");
        assert_eq!(conv.len(), 2);
        assert_eq!(conv.messages()[0].content, "v2");
        assert_eq!(conv.messages()[1].content, "goal");
    }

    #[test]
    fn test_replace_system_inserts_when_missing() {
        let mut conv = Conversation::default();
        conv.push(Message::user("goal"));
        conv.replace_system("sys");
        assert_eq!(conv.messages()[0].role, Role::System);
        assert_eq!(conv.len(), 2);
    }
}
