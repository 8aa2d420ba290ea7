//! 控制循环过程事件：按状态转换顺序推送给传输层（JSON，type 字段区分）

use serde::Serialize;

use super::monitor::ProblemReport;

/// 单步过程事件（可序列化为 JSON 供前端展示）
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case", rename_all_fields = "camelCase")]
pub enum LoopEvent {
    /// 绑定（或重规划后重新绑定）了结构化计划
    PlanBound {
        skill: String,
        plan_id: String,
        revision: u32,
        steps: usize,
    },
    /// 进入 Reasoning（第几轮）
    Reasoning { iteration: u32 },
    /// 模型提出的工具调用
    ToolCall {
        tool_call_id: String,
        name: String,
        args: serde_json::Value,
    },
    /// 约束校验拒绝：不执行、不产生 tool_result
    ToolDenied {
        tool_call_id: String,
        name: String,
        reason: String,
    },
    AwaitingConfirmation {
        tool_call_id: String,
        confirmation_id: String,
        command: String,
    },
    ConfirmationResolved {
        confirmation_id: String,
        approved: bool,
        detail: String,
    },
    ToolResult {
        tool_call_id: String,
        name: String,
        success: bool,
        #[serde(skip_serializing_if = "Option::is_none")]
        output: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
    MilestoneChecked {
        step_id: u32,
        passed: bool,
        reason: String,
    },
    /// 进入 Reflecting：注入检索到的教训后重试
    Reflecting {
        step_id: Option<u32>,
        attempt: u32,
        lessons: Vec<String>,
    },
    /// 反思后通过，沉淀教训
    LessonLearned { signature: String, stored: bool },
    Replanning { reason: String, revision: u32 },
    /// 结构化问题报告（终止前）
    ProblemGuidance(ProblemReport),
    /// 最终回复
    Message { content: String, finished: bool },
}

impl LoopEvent {
    /// 事件类型名（与 JSON 的 type 字段一致）
    pub fn kind(&self) -> &'static str {
        match self {
            Self::PlanBound { .. } => "plan_bound",
            Self::Reasoning { .. } => "reasoning",
            Self::ToolCall { .. } => "tool_call",
            Self::ToolDenied { .. } => "tool_denied",
            Self::AwaitingConfirmation { .. } => "awaiting_confirmation",
            Self::ConfirmationResolved { .. } => "confirmation_resolved",
            Self::ToolResult { .. } => "tool_result",
            Self::MilestoneChecked { .. } => "milestone_checked",
            Self::Reflecting { .. } => "reflecting",
            Self::LessonLearned { .. } => "lesson_learned",
            Self::Replanning { .. } => "replanning",
            Self::ProblemGuidance(_) => "problem_guidance",
            Self::Message { .. } => "message",
        }
    }
}
