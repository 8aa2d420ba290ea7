//! 计划提供者：generate(goal, skill) -> StructuredPlan
//!
//! 生成失败时由 plan_or_fallback 退回确定性的兜底计划，控制循环永远能拿到一个计划。

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;

use super::{fallback_plan, PlanError, SkillLoader, StructuredPlan};

#[async_trait]
pub trait PlanProvider: Send + Sync {
    async fn generate(&self, goal: &str, skill: &str) -> Result<StructuredPlan, PlanError>;
}

/// 基于 SkillLoader 的计划提供者
pub struct SkillPlanProvider {
    loader: Arc<SkillLoader>,
}

impl SkillPlanProvider {
    pub fn new(loader: Arc<SkillLoader>) -> Self {
        Self { loader }
    }
}

#[async_trait]
impl PlanProvider for SkillPlanProvider {
    async fn generate(&self, _goal: &str, skill: &str) -> Result<StructuredPlan, PlanError> {
        self.loader.get(skill).await?.to_plan()
    }
}

/// 固定计划表（测试与嵌入式使用）
#[derive(Default)]
pub struct StaticPlanProvider {
    plans: HashMap<String, StructuredPlan>,
}

impl StaticPlanProvider {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_plan(mut self, skill: impl Into<String>, plan: StructuredPlan) -> Self {
        self.plans.insert(skill.into(), plan);
        self
    }
}

#[async_trait]
impl PlanProvider for StaticPlanProvider {
    async fn generate(&self, _goal: &str, skill: &str) -> Result<StructuredPlan, PlanError> {
        self.plans
            .get(skill)
            .map(|p| StructuredPlan {
                plan_id: uuid::Uuid::new_v4().to_string(),
                ..p.clone()
            })
            .ok_or_else(|| PlanError::UnknownSkill(skill.to_string()))
    }
}

/// 生成计划，失败时退回兜底计划
pub async fn plan_or_fallback(provider: &dyn PlanProvider, goal: &str, skill: &str) -> StructuredPlan {
    match provider.generate(goal, skill).await {
        Ok(plan) => plan,
        Err(e) => {
            tracing::warn!(skill = %skill, error = %e, "plan generation failed, using fallback plan");
            fallback_plan(goal, skill)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::skills::{Step, ToolConstraints};

    #[tokio::test]
    async fn test_static_provider_and_fallback() {
        let plan = StructuredPlan::new(
            "cfg",
            ToolConstraints::new(["read_file"], Vec::<String>::new()),
            vec![Step::new(1, "read", "success")],
        );
        let provider = StaticPlanProvider::new().with_plan("cfg", plan.clone());

        let got = plan_or_fallback(&provider, "goal", "cfg").await;
        assert_eq!(got.steps, plan.steps);
        assert_ne!(got.plan_id, plan.plan_id);

        let fallback = plan_or_fallback(&provider, "goal", "unknown").await;
        assert!(fallback.tool_constraints.is_unrestricted());
        assert_eq!(fallback.steps.len(), 1);
    }
}
