//! 技能系统
//!
//! 技能（Skill）声明一个任务的工具约束与有序步骤，绑定后成为不可变的 StructuredPlan。
//! 任务输入以 `/skill-id 参数` 开头时绑定对应技能。
//!
//! 目录结构：
//! ```text
//! config/skills/
//! ├── write-config/
//! │   ├── skill.toml      # 元数据 + allowed_tools / forbidden_tools + [[steps]]
//! │   └── capability.md   # 能力描述（可选）
//! └── ...
//! ```

mod loader;
mod plan;
mod provider;

pub use loader::{Skill, SkillCache, SkillLoader, SkillMeta, StepSpec};
pub use plan::{fallback_plan, parse_command, PlanError, Step, StructuredPlan, ToolConstraints};
pub use provider::{plan_or_fallback, PlanProvider, SkillPlanProvider, StaticPlanProvider};
