//! 工具调用 JSON Schema 生成（schemars）
//!
//! 将「合法 tool call」的 JSON 结构注入 system prompt，减少 LLM 输出格式错误。

use schemars::{schema_for, JsonSchema};

/// 工具调用格式：与 planner 解析的 `{"tool": "...", "args": {...}}` 一致（仅用于 Schema 生成）
#[allow(dead_code)]
#[derive(JsonSchema)]
struct ToolCallFormat {
    /// 一句话说明为什么调用该工具（可选，成功后可沉淀为教训）
    pub thought: Option<String>,
    /// 工具名，如 read_file、write_file、list_dir、run_in_terminal、echo
    pub tool: String,
    /// 工具参数，依工具不同而不同（path、content、command、text 等）
    pub args: serde_json::Map<String, serde_json::Value>,
}

/// 返回工具调用的 JSON Schema 字符串
pub fn tool_call_schema_json() -> String {
    let schema = schema_for!(ToolCallFormat);
    serde_json::to_string_pretty(&schema).unwrap_or_default()
}
