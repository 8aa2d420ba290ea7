//! 工具注册表
//!
//! 所有工具实现 Tool trait（name / description / risk / execute），由 ToolRegistry 按名注册与查找；
//! 控制循环与约束校验只依赖工具名，不依赖具体实现。

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use serde_json::Value;
use tokio_util::sync::CancellationToken;

/// 风险等级：High 需人工确认后执行
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RiskLevel {
    Low,
    High,
}

/// 单次执行上下文：取消令牌与时限（长时间运行的工具据此返回部分输出）
#[derive(Debug, Clone)]
pub struct ToolContext {
    pub cancel: CancellationToken,
    pub timeout: Duration,
}

impl ToolContext {
    pub fn new(cancel: CancellationToken, timeout: Duration) -> Self {
        Self { cancel, timeout }
    }
}

/// 工具输出；exit_code 仅命令类工具提供，非 0 视为失败
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ToolOutput {
    pub content: String,
    pub exit_code: Option<i32>,
}

impl ToolOutput {
    pub fn text(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            exit_code: None,
        }
    }

    pub fn with_exit_code(content: impl Into<String>, code: i32) -> Self {
        Self {
            content: content.into(),
            exit_code: Some(code),
        }
    }

    pub fn success(&self) -> bool {
        self.exit_code.map_or(true, |c| c == 0)
    }
}

/// 工具 trait：名称、描述（供 LLM 理解）、参数 schema、风险评估、异步执行（args 为 JSON）
#[async_trait]
pub trait Tool: Send + Sync {
    /// 工具名称（用于 JSON 中的 "tool" 字段）
    fn name(&self) -> &str;

    /// 工具描述（供 LLM 理解功能）
    fn description(&self) -> &str;

    /// 参数 JSON Schema
    fn parameters_schema(&self) -> Value {
        serde_json::json!({
            "type": "object",
            "properties": {},
            "required": []
        })
    }

    /// 本次调用的风险等级
    fn risk(&self, _args: &Value) -> RiskLevel {
        RiskLevel::Low
    }

    /// 展示给确认方的命令文本
    fn command_preview(&self, args: &Value) -> String {
        args.get("command")
            .and_then(Value::as_str)
            .map(String::from)
            .unwrap_or_else(|| format!("{} {}", self.name(), args))
    }

    /// 确认方批准的命令写回参数（默认覆盖 "command" 字段）
    fn confirmed_args(&self, args: &Value, command: &str) -> Value {
        let mut args = args.clone();
        if let Some(obj) = args.as_object_mut() {
            if obj.contains_key("command") {
                obj.insert("command".to_string(), Value::String(command.to_string()));
            }
        }
        args
    }

    /// 执行工具
    async fn execute(&self, args: Value, ctx: &ToolContext) -> Result<ToolOutput, String>;
}

/// 工具注册表：按名称存储 Arc<dyn Tool>
#[derive(Default)]
pub struct ToolRegistry {
    tools: HashMap<String, Arc<dyn Tool>>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, tool: impl Tool + 'static) {
        let name = tool.name().to_string();
        self.tools.insert(name, Arc::new(tool));
    }

    pub fn register_arc(&mut self, tool: Arc<dyn Tool>) {
        self.tools.insert(tool.name().to_string(), tool);
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Tool>> {
        self.tools.get(name).cloned()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.tools.contains_key(name)
    }

    pub fn tool_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.tools.keys().cloned().collect();
        names.sort();
        names
    }

    /// 工具 schema JSON，拼入 system prompt
    pub fn to_schema_json(&self) -> String {
        let mut tools: Vec<(&String, &Arc<dyn Tool>)> = self.tools.iter().collect();
        tools.sort_by(|a, b| a.0.cmp(b.0));
        let tools: Vec<Value> = tools
            .into_iter()
            .map(|(name, tool)| {
                serde_json::json!({
                    "name": name,
                    "description": tool.description(),
                    "parameters": tool.parameters_schema()
                })
            })
            .collect();
        serde_json::to_string_pretty(&tools).unwrap_or_else(|_| "[]".to_string())
    }
}
