//! 认知层：Planner、约束校验、里程碑校验、进度监控与控制循环

pub mod constraints;
pub mod events;
pub mod loop_;
pub mod milestone;
pub mod monitor;
pub mod planner;

pub use constraints::{ConstraintDecision, ConstraintValidator};
pub use events::LoopEvent;
pub use loop_::{ControlLoop, LoopDeps, LoopSettings, LoopState, TaskOutcome};
pub use milestone::{Milestone, MilestoneResult, MilestoneValidator};
pub use monitor::{
    Decision, MonitorLimits, PlanState, ProblemClass, ProblemReport, ProgressMonitor, Severity,
    StepAttempt,
};
pub use planner::{
    build_system_prompt, parse_llm_output, reflection_prompt, PlannerOutput, ToolCall,
};
