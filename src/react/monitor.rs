//! 进度监控：迭代 / 反思 / 约束违规计数，决定 continue / replan / abort
//!
//! PlanState 是单个计划上的运行游标（重规划时整体替换）；ProgressMonitor 持有任务级计数。
//! abort 总是附带结构化的 ProblemReport，而不是裸错误字符串。

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::config::OrchestratorSection;
use crate::learning::{ErrorClass, Lesson};
use crate::llm::LlmError;
use crate::skills::{Step, StructuredPlan};
use crate::tools::ToolExecutionRecord;

/// 单步的一次校验结果
#[derive(Debug, Clone, Serialize)]
pub struct StepAttempt {
    pub step_id: u32,
    pub passed: bool,
    pub reason: String,
    pub at: DateTime<Utc>,
}

/// 计划运行游标
#[derive(Debug, Clone)]
pub struct PlanState {
    plan: Option<Arc<StructuredPlan>>,
    current_step: usize,
    history: Vec<StepAttempt>,
    /// 当前步骤上（自上次通过以来）的失败次数
    reflections: u32,
}

impl PlanState {
    pub fn new(plan: Option<Arc<StructuredPlan>>) -> Self {
        Self {
            plan,
            current_step: 0,
            history: Vec::new(),
            reflections: 0,
        }
    }

    pub fn plan(&self) -> Option<&StructuredPlan> {
        self.plan.as_deref()
    }

    pub fn shared_plan(&self) -> Option<Arc<StructuredPlan>> {
        self.plan.clone()
    }

    pub fn current_step(&self) -> Option<&Step> {
        self.plan.as_ref().and_then(|p| p.step(self.current_step))
    }

    pub fn is_complete(&self) -> bool {
        self.plan
            .as_ref()
            .map_or(false, |p| self.current_step >= p.steps.len())
    }

    pub fn history(&self) -> &[StepAttempt] {
        &self.history
    }

    pub fn reflections(&self) -> u32 {
        self.reflections
    }

    /// 当前步骤通过：推进游标、清零反思计数；返回通过前的反思次数
    pub fn record_pass(&mut self, reason: &str) -> u32 {
        let prior = self.reflections;
        if let Some(step) = self.current_step() {
            self.history.push(StepAttempt {
                step_id: step.id,
                passed: true,
                reason: reason.to_string(),
                at: Utc::now(),
            });
            self.current_step += 1;
        }
        self.reflections = 0;
        prior
    }

    /// 当前步骤（或无计划时的隐式步骤）失败
    pub fn record_failure(&mut self, reason: &str) {
        if let Some(step) = self.current_step() {
            self.history.push(StepAttempt {
                step_id: step.id,
                passed: false,
                reason: reason.to_string(),
                at: Utc::now(),
            });
        }
        self.reflections += 1;
    }

    /// 无计划时工具成功视为取得进展；返回此前的反思次数
    pub fn record_progress(&mut self) -> u32 {
        std::mem::take(&mut self.reflections)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Low,
    Medium,
    High,
    Critical,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ProblemClass {
    ProviderUnavailable,
    IterationLimit,
    StepFailed,
    ConstraintViolation,
    Cancelled,
}

/// 面向用户的结构化问题报告
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProblemReport {
    pub severity: Severity,
    pub problem_class: ProblemClass,
    pub description: String,
    pub attempted: Vec<String>,
    pub steps: Vec<String>,
    pub auto_fixes: Vec<String>,
    pub info_needed: Vec<String>,
}

impl ProblemReport {
    fn new(severity: Severity, problem_class: ProblemClass, description: impl Into<String>) -> Self {
        Self {
            severity,
            problem_class,
            description: description.into(),
            attempted: Vec::new(),
            steps: Vec::new(),
            auto_fixes: Vec::new(),
            info_needed: Vec::new(),
        }
    }

    pub fn provider_unavailable(err: &LlmError, cooldown_secs: u64) -> Self {
        let mut r = Self::new(
            Severity::Critical,
            ProblemClass::ProviderUnavailable,
            format!("No language model provider could complete the request: {err}"),
        );
        r.steps = vec![
            "Check network connectivity and the API keys referenced by [llm.providers]".to_string(),
            format!("Wait for the circuit cool-down ({cooldown_secs}s) and retry the task"),
            "Add a backup provider with a higher priority number to [llm.providers]".to_string(),
        ];
        r.auto_fixes = vec!["Reset provider circuits once connectivity is restored".to_string()];
        r
    }

    pub fn iteration_limit(limit: u32) -> Self {
        let mut r = Self::new(
            Severity::High,
            ProblemClass::IterationLimit,
            format!("Stopped after {limit} reasoning iterations without finishing the task"),
        );
        r.steps = vec![
            "Split the goal into smaller tasks".to_string(),
            "Bind a skill with explicit steps so progress can be checked".to_string(),
            "Raise orchestrator.max_iterations if the task is legitimately long".to_string(),
        ];
        r.info_needed = vec!["Which part of the goal should be done first?".to_string()];
        r
    }

    pub fn step_failed(step: Option<&Step>, attempts: u32, last_reason: &str, class: Option<ErrorClass>, lessons: &[Lesson]) -> Self {
        let description = match step {
            Some(s) => format!(
                "Step {} ({}) failed {attempts} times; last failure: {last_reason}",
                s.id, s.description
            ),
            None => format!("The task failed {attempts} times in a row; last failure: {last_reason}"),
        };
        let mut r = Self::new(Severity::High, ProblemClass::StepFailed, description);
        r.steps.extend(lessons.iter().map(|l| l.content.clone()));
        if let Some(s) = step {
            r.steps.push(format!("Verify the expected outcome '{}' is achievable as stated", s.expect));
        }
        r.steps.push("Review the attempted actions below and adjust the goal or the inputs".to_string());
        let (fixes, info): (&[&str], &[&str]) = match class {
            Some(ErrorClass::NotFound) => (
                &["Create the missing file or directory before retrying"],
                &["Where should the missing resource come from?"],
            ),
            Some(ErrorClass::PermissionDenied) => (
                &["Run inside a workspace the agent can write to"],
                &["Can the required permissions be granted?"],
            ),
            Some(ErrorClass::Timeout) => (&["Increase tools.tool_timeout_secs"], &[]),
            Some(ErrorClass::InvalidArguments) | Some(ErrorClass::Syntax) => (
                &[],
                &["What are the correct arguments or the exact expected format?"],
            ),
            Some(ErrorClass::Network) => (&["Retry once the network is reachable"], &[]),
            _ => (&[], &["What does a successful result look like for this step?"]),
        };
        r.auto_fixes = fixes.iter().map(|s| s.to_string()).collect();
        r.info_needed = info.iter().map(|s| s.to_string()).collect();
        r
    }

    pub fn constraint_violations(count: u32, plan: Option<&StructuredPlan>, last_tool: &str) -> Self {
        let skill = plan.map(|p| p.skill_binding.as_str()).unwrap_or("");
        let mut r = Self::new(
            Severity::Medium,
            ProblemClass::ConstraintViolation,
            format!("The model proposed disallowed tools {count} times (last: '{last_tool}') under skill '{skill}'"),
        );
        if let Some(p) = plan {
            let allowed: Vec<&str> = p.tool_constraints.allowed.iter().map(String::as_str).collect();
            if !allowed.is_empty() {
                r.steps.push(format!("Rephrase the goal so it can be done with: {}", allowed.join(", ")));
            }
        }
        r.steps.push("Run the task without a /skill prefix to lift tool restrictions".to_string());
        r.info_needed = vec![format!("Should '{last_tool}' be permitted for skill '{skill}'?")];
        r
    }

    pub fn cancelled() -> Self {
        let mut r = Self::new(Severity::Low, ProblemClass::Cancelled, "The task was cancelled");
        r.steps = vec!["Start the task again when ready".to_string()];
        r
    }

    /// 附上最近的执行记录（what was attempted）
    pub fn with_attempted(mut self, history: &[ToolExecutionRecord], limit: usize) -> Self {
        let start = history.len().saturating_sub(limit);
        self.attempted = history[start..]
            .iter()
            .map(|h| {
                let outcome = if h.success {
                    "ok".to_string()
                } else {
                    h.error_class.map_or("failed".to_string(), |c| format!("failed ({c})"))
                };
                format!("{} {} -> {outcome}", h.tool, h.args)
            })
            .collect();
        self
    }

    /// 最终消息文本
    pub fn summary(&self) -> String {
        let mut out = self.description.clone();
        if !self.steps.is_empty() {
            out.push_str("\nNext steps:");
            for (i, s) in self.steps.iter().enumerate() {
                out.push_str(&format!("\n{}. {s}", i + 1));
            }
        }
        if !self.info_needed.is_empty() {
            out.push_str("\nInformation needed:");
            for s in &self.info_needed {
                out.push_str(&format!("\n- {s}"));
            }
        }
        out
    }
}

#[derive(Debug, Clone)]
pub enum Decision {
    Continue,
    Replan { reason: String },
    Abort(ProblemReport),
}

#[derive(Debug, Clone, Copy)]
pub struct MonitorLimits {
    pub max_iterations: u32,
    pub max_reflections_per_step: u32,
    pub max_constraint_violations: u32,
    pub max_replans: u32,
}

impl Default for MonitorLimits {
    fn default() -> Self {
        Self::from(&OrchestratorSection::default())
    }
}

impl From<&OrchestratorSection> for MonitorLimits {
    fn from(c: &OrchestratorSection) -> Self {
        Self {
            max_iterations: c.max_iterations.max(1),
            max_reflections_per_step: c.max_reflections_per_step.max(1),
            max_constraint_violations: c.max_constraint_violations,
            max_replans: c.max_replans,
        }
    }
}

/// 任务级进度监控
#[derive(Debug)]
pub struct ProgressMonitor {
    limits: MonitorLimits,
    iterations: u32,
    constraint_violations: u32,
    replans: u32,
}

impl ProgressMonitor {
    pub fn new(limits: MonitorLimits) -> Self {
        Self {
            limits,
            iterations: 0,
            constraint_violations: 0,
            replans: 0,
        }
    }

    pub fn iterations(&self) -> u32 {
        self.iterations
    }

    fn can_replan(&self, plan: Option<&StructuredPlan>) -> bool {
        plan.is_some() && self.replans < self.limits.max_replans
    }

    /// 进入 Reasoning 前调用；超过全局迭代上限则终止
    pub fn on_iteration(&mut self) -> Decision {
        if self.iterations >= self.limits.max_iterations {
            return Decision::Abort(ProblemReport::iteration_limit(self.limits.max_iterations));
        }
        self.iterations += 1;
        Decision::Continue
    }

    /// 约束拒绝；计数超过阈值时升级为重规划（无法重规划则终止）
    pub fn on_constraint_violation(&mut self, plan: Option<&StructuredPlan>, tool: &str) -> Decision {
        self.constraint_violations += 1;
        if self.constraint_violations <= self.limits.max_constraint_violations {
            return Decision::Continue;
        }
        if self.can_replan(plan) {
            Decision::Replan {
                reason: format!(
                    "{} constraint violations (last: '{tool}')",
                    self.constraint_violations
                ),
            }
        } else {
            Decision::Abort(ProblemReport::constraint_violations(self.constraint_violations, plan, tool))
        }
    }

    /// 步骤失败（已计入 state）；同一步骤失败次数达到上限时升级
    pub fn on_step_failure(
        &self,
        state: &PlanState,
        last_reason: &str,
        class: Option<ErrorClass>,
        lessons: &[Lesson],
    ) -> Decision {
        if state.reflections() < self.limits.max_reflections_per_step {
            return Decision::Continue;
        }
        if self.can_replan(state.plan()) {
            let step = state
                .current_step()
                .map(|s| format!("step {}", s.id))
                .unwrap_or_else(|| "the task".to_string());
            Decision::Replan {
                reason: format!("{step} failed {} times: {last_reason}", state.reflections()),
            }
        } else {
            Decision::Abort(ProblemReport::step_failed(
                state.current_step(),
                state.reflections(),
                last_reason,
                class,
                lessons,
            ))
        }
    }

    /// 重规划完成：计数 +1，清零约束违规
    pub fn on_replanned(&mut self) {
        self.replans += 1;
        self.constraint_violations = 0;
    }
}
