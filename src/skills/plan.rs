//! 结构化计划：技能绑定 + 工具约束 + 有序步骤
//!
//! 计划创建后不可变；重规划生成新的计划（revision + 1），旧计划保留在执行历史中。

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// 计划生成错误
#[derive(Error, Debug, Clone)]
pub enum PlanError {
    #[error("Unknown skill: {0}")]
    UnknownSkill(String),

    #[error("Invalid skill definition '{skill}': {reason}")]
    InvalidSkill { skill: String, reason: String },

    #[error("Skill loading failed: {0}")]
    Load(String),
}

/// 工具约束：forbidden 永远优先；allowed 为空表示不限制
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToolConstraints {
    pub allowed: BTreeSet<String>,
    pub forbidden: BTreeSet<String>,
}

impl ToolConstraints {
    pub fn new<A, F>(allowed: A, forbidden: F) -> Self
    where
        A: IntoIterator,
        A::Item: Into<String>,
        F: IntoIterator,
        F::Item: Into<String>,
    {
        Self {
            allowed: allowed.into_iter().map(Into::into).collect(),
            forbidden: forbidden.into_iter().map(Into::into).collect(),
        }
    }

    pub fn is_unrestricted(&self) -> bool {
        self.allowed.is_empty() && self.forbidden.is_empty()
    }
}

/// 计划步骤；expect 为里程碑断言文本（见 react::milestone）
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Step {
    pub id: u32,
    pub description: String,
    pub expect: String,
}

impl Step {
    pub fn new(id: u32, description: impl Into<String>, expect: impl Into<String>) -> Self {
        Self {
            id,
            description: description.into(),
            expect: expect.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StructuredPlan {
    pub plan_id: String,
    pub revision: u32,
    pub skill_binding: String,
    pub tool_constraints: ToolConstraints,
    pub steps: Vec<Step>,
}

impl StructuredPlan {
    pub fn new(skill_binding: impl Into<String>, tool_constraints: ToolConstraints, steps: Vec<Step>) -> Self {
        Self {
            plan_id: uuid::Uuid::new_v4().to_string(),
            revision: 0,
            skill_binding: skill_binding.into(),
            tool_constraints,
            steps,
        }
    }

    /// 以当前计划为前驱，构造修订版（新 id，revision + 1）
    pub fn succeeded_by(&self, mut next: StructuredPlan) -> StructuredPlan {
        next.revision = self.revision + 1;
        next
    }

    pub fn step(&self, index: usize) -> Option<&Step> {
        self.steps.get(index)
    }

    /// 注入 system prompt 的计划描述
    pub fn render(&self) -> String {
        let mut out = format!("Active skill: {}\n", self.skill_binding);
        if !self.tool_constraints.allowed.is_empty() {
            let allowed: Vec<&str> = self.tool_constraints.allowed.iter().map(String::as_str).collect();
            out.push_str(&format!("Allowed tools: {}\n", allowed.join(", ")));
        }
        if !self.tool_constraints.forbidden.is_empty() {
            let forbidden: Vec<&str> = self.tool_constraints.forbidden.iter().map(String::as_str).collect();
            out.push_str(&format!("Forbidden tools: {}\n", forbidden.join(", ")));
        }
        if !self.steps.is_empty() {
            out.push_str("Steps:\n");
            for s in &self.steps {
                out.push_str(&format!("{}. {} (expect: {})\n", s.id, s.description, s.expect));
            }
        }
        out
    }
}

/// 确定性兜底计划：单步、无约束，只要求工具成功
pub fn fallback_plan(goal: &str, skill: &str) -> StructuredPlan {
    let description = if goal.trim().is_empty() {
        "Complete the requested task".to_string()
    } else {
        format!("Complete the goal: {}", goal.trim())
    };
    StructuredPlan::new(skill, ToolConstraints::default(), vec![Step::new(1, description, "success")])
}

/// 解析 `/skill rest` 前缀；无前导 `/` 时返回 ("", 全文)
pub fn parse_command(input: &str) -> (String, String) {
    let trimmed = input.trim_start();
    let Some(rest) = trimmed.strip_prefix('/') else {
        return (String::new(), input.to_string());
    };
    let mut parts = rest.splitn(2, char::is_whitespace);
    let skill = parts.next().unwrap_or("").to_string();
    let args = parts.next().unwrap_or("").trim().to_string();
    (skill, args)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_command() {
        assert_eq!(
            parse_command("/write-config create app.toml"),
            ("write-config".to_string(), "create app.toml".to_string())
        );
        assert_eq!(parse_command("/status"), ("status".to_string(), String::new()));
        assert_eq!(parse_command("just do it"), (String::new(), "just do it".to_string()));
        assert_eq!(parse_command("path /tmp"), (String::new(), "path /tmp".to_string()));
    }

    #[test]
    fn test_fallback_plan_is_single_unrestricted_step() {
        let plan = fallback_plan("tidy the repo", "tidy");
        assert_eq!(plan.steps.len(), 1);
        assert_eq!(plan.steps[0].expect, "success");
        assert!(plan.tool_constraints.is_unrestricted());
        assert_eq!(plan.skill_binding, "tidy");
    }

    #[test]
    fn test_revision_chain() {
        let first = fallback_plan("a", "s");
        let second = first.succeeded_by(fallback_plan("a", "s"));
        assert_eq!(second.revision, 1);
        assert_ne!(first.plan_id, second.plan_id);
    }

    #[test]
    fn test_render_lists_constraints() {
        let plan = StructuredPlan::new(
            "cfg",
            ToolConstraints::new(["read_file", "write_file"], ["run_in_terminal"]),
            vec![Step::new(1, "write it", "file exists")],
        );
        let text = plan.render();
        assert!(text.contains("Allowed tools: read_file, write_file"));
        assert!(text.contains("Forbidden tools: run_in_terminal"));
        assert!(text.contains("1. write it (expect: file exists)"));
    }
}
