//! 约束校验：执行前按计划的 allowed / forbidden 判定工具调用
//!
//! forbidden 命中即拒绝；allowed 非空且不含该工具则拒绝；未绑定计划时一律放行。

use crate::skills::StructuredPlan;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConstraintDecision {
    Allowed,
    Denied { reason: String },
}

impl ConstraintDecision {
    pub fn is_allowed(&self) -> bool {
        matches!(self, Self::Allowed)
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct ConstraintValidator;

impl ConstraintValidator {
    pub fn new() -> Self {
        Self
    }

    pub fn check(&self, tool: &str, plan: Option<&StructuredPlan>) -> ConstraintDecision {
        let Some(plan) = plan else {
            return ConstraintDecision::Allowed;
        };
        let constraints = &plan.tool_constraints;
        let allowed: Vec<&str> = constraints
            .allowed
            .iter()
            .map(String::as_str)
            .filter(|t| !constraints.forbidden.contains(*t))
            .collect();
        let allowed_text = if constraints.allowed.is_empty() {
            "any tool not forbidden".to_string()
        } else {
            allowed.join(", ")
        };

        if constraints.forbidden.contains(tool) {
            return ConstraintDecision::Denied {
                reason: format!(
                    "Tool '{tool}' is forbidden by skill '{}'. Allowed tools: {allowed_text}",
                    plan.skill_binding
                ),
            };
        }
        if !constraints.allowed.is_empty() && !constraints.allowed.contains(tool) {
            return ConstraintDecision::Denied {
                reason: format!(
                    "Tool '{tool}' is not allowed by skill '{}'. Allowed tools: {allowed_text}",
                    plan.skill_binding
                ),
            };
        }
        ConstraintDecision::Allowed
    }
}
