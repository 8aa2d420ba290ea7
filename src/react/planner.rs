//! Planner：system prompt 拼装与模型输出解析
//!
//! 模型要么输出一个 JSON Tool Call（`{"tool": "...", "args": {...}}`，可带 thought），
//! 要么输出纯文本作为最终回复。

use serde::{Deserialize, Serialize};

use crate::core::AgentError;
use crate::learning::Lesson;
use crate::skills::StructuredPlan;
use crate::tools::tool_call_schema_json;

/// LLM 返回的 Tool Call
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolCall {
    #[serde(default)]
    pub thought: Option<String>,
    pub tool: String,
    #[serde(default)]
    pub args: serde_json::Value,
}

/// Planner 输出
#[derive(Debug, Clone)]
pub enum PlannerOutput {
    /// 直接回复用户（任务结束）
    Response(String),
    /// 需要执行工具
    ToolCall(ToolCall),
}

fn looks_like_tool_call(text: &str) -> bool {
    text.contains("\"tool\"")
}

/// 解析 LLM 输出：含 `"tool"` 键的 JSON 为 ToolCall（格式错误返回 JsonParseError），否则为 Response
pub fn parse_llm_output(output: &str) -> Result<PlannerOutput, AgentError> {
    let trimmed = output.trim();

    // 提取 JSON 块（```json ... ``` 或裸 JSON）
    let json_str = if let Some(start) = trimmed.find("```json") {
        let rest = &trimmed[start + 7..];
        rest.find("```").map(|end| rest[..end].trim()).unwrap_or(rest.trim())
    } else if let Some(start) = trimmed.find('{') {
        match trimmed.rfind('}') {
            Some(end) if end > start => &trimmed[start..=end],
            // 未闭合：交给 serde 报错
            _ => &trimmed[start..],
        }
    } else {
        return Ok(PlannerOutput::Response(trimmed.to_string()));
    };

    if !looks_like_tool_call(json_str) {
        return Ok(PlannerOutput::Response(trimmed.to_string()));
    }

    let mut parsed: ToolCall = serde_json::from_str(json_str)
        .map_err(|e| AgentError::JsonParseError(format!("{e}: {json_str}")))?;

    if parsed.tool.trim().is_empty() {
        return Err(AgentError::JsonParseError(format!("empty tool name: {json_str}")));
    }
    if parsed.args.is_null() {
        parsed.args = serde_json::json!({});
    }
    Ok(PlannerOutput::ToolCall(parsed))
}

const BASE_PROMPT: &str = "You are an autonomous task agent. Work towards the user's goal one action at a time.\n\
To act, reply with exactly one JSON object: {\"thought\": \"why\", \"tool\": \"<name>\", \"args\": {...}}.\n\
When the goal is achieved, reply with a plain-text summary and no JSON.";

/// 拼装 system prompt：基础说明 + 工具 schema + 计划（如有）
pub fn build_system_prompt(base: Option<&str>, tools_schema: &str, plan: Option<&StructuredPlan>) -> String {
    let mut out = String::from(base.unwrap_or(BASE_PROMPT));
    out.push_str("\n\nTool call format (JSON Schema):\n");
    out.push_str(&tool_call_schema_json());
    out.push_str("\n\nAvailable tools:\n");
    out.push_str(tools_schema);
    if let Some(plan) = plan {
        out.push_str("\n\n");
        out.push_str(&plan.render());
        out.push_str("Complete the steps in order. Only the allowed tools may be used.");
    }
    out
}

/// 反思提示：失败原因 + 检索到的教训
pub fn reflection_prompt(reason: &str, lessons: &[Lesson]) -> String {
    let mut out = format!("The last action did not achieve the current step: {reason}\n");
    if lessons.is_empty() {
        out.push_str("No earlier lessons match this failure.\n");
    } else {
        out.push_str("Lessons from earlier failures:\n");
        for l in lessons {
            out.push_str(&l.render());
            out.push('\n');
        }
    }
    out.push_str("Try a different approach.");
    out
}
