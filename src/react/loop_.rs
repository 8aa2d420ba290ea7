//! 编排控制循环
//!
//! Reasoning -> 约束校验 -> Executing -> (AwaitingConfirmation) -> Observing -> 里程碑校验
//! -> 通过则推进 / 失败则 Reflecting -> 超限则 Replanning 或终止。
//! 每次状态转换都会向 events 通道推送 LoopEvent；终止时总是以 Message { finished: true } 收尾。

use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::config::AppConfig;
use crate::core::{AgentError, RecoveryAction, RecoveryEngine};
use crate::learning::{ErrorClass, ErrorLearningService, LessonOutcome};
use crate::llm::{CompletionOptions, LlmError, ProviderRouter};
use crate::memory::{Conversation, Message};
use crate::react::constraints::{ConstraintDecision, ConstraintValidator};
use crate::react::events::LoopEvent;
use crate::react::milestone::MilestoneValidator;
use crate::react::monitor::{Decision, MonitorLimits, PlanState, ProblemReport, ProgressMonitor};
use crate::react::planner::{build_system_prompt, parse_llm_output, reflection_prompt, PlannerOutput};
use crate::skills::{parse_command, plan_or_fallback, PlanProvider, StructuredPlan};
use crate::tools::{
    ConfirmationBroker, ConfirmationDecision, ConfirmationRequest, ConfirmationTicket,
    ExecutionOutcome, ToolExecutionRecord, ToolExecutor, ToolInvocation, ToolObservation,
};

/// tool_result 事件里 output 的最大字符数
const OBSERVATION_PREVIEW_CHARS: usize = 200;
/// ProblemReport.attempted 保留的最近执行条数
const ATTEMPTED_IN_REPORT: usize = 5;

/// 循环参数
#[derive(Debug, Clone)]
pub struct LoopSettings {
    pub limits: MonitorLimits,
    pub confirmation_timeout: Duration,
    pub completion: CompletionOptions,
    /// 覆盖内置的基础 system prompt
    pub base_prompt: Option<String>,
    /// 写进 provider_unavailable 报告的熔断冷却秒数
    pub cooldown_secs: u64,
}

impl Default for LoopSettings {
    fn default() -> Self {
        Self::from_config(&AppConfig::default())
    }
}

impl LoopSettings {
    pub fn from_config(config: &AppConfig) -> Self {
        Self {
            limits: MonitorLimits::from(&config.orchestrator),
            confirmation_timeout: Duration::from_secs(config.tools.confirmation_timeout_secs),
            completion: CompletionOptions::default(),
            base_prompt: None,
            cooldown_secs: config.router.cooldown_secs,
        }
    }
}

/// 跨任务共享的依赖
pub struct LoopDeps {
    pub router: Arc<ProviderRouter>,
    pub executor: Arc<ToolExecutor>,
    pub learning: Arc<ErrorLearningService>,
    pub plans: Arc<dyn PlanProvider>,
    pub milestones: MilestoneValidator,
    pub constraints: ConstraintValidator,
    pub recovery: RecoveryEngine,
    pub settings: LoopSettings,
}

/// 对外可见的循环状态（日志 / 调试用）
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LoopState {
    Init,
    Reasoning,
    AwaitingConstraintCheck,
    Executing,
    AwaitingConfirmation,
    Observing,
    Reflecting,
    Replanning,
    Terminated,
}

/// 任务结束时的结果
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskOutcome {
    pub task_id: String,
    pub success: bool,
    /// 最终回复；失败时为问题报告摘要
    pub content: String,
    pub report: Option<ProblemReport>,
    pub iterations: u32,
    pub history: Vec<ToolExecutionRecord>,
    /// 依次绑定过的计划（含重规划后的修订版）
    pub plans: Vec<StructuredPlan>,
}

struct Proposed {
    invocation: ToolInvocation,
    thought: Option<String>,
}

enum Termination {
    Answer(String),
    Failed(ProblemReport),
    Cancelled,
}

enum Phase {
    Reasoning,
    ConstraintCheck(Proposed),
    Executing(Proposed),
    AwaitingConfirmation(ConfirmationTicket, Option<String>),
    ExecutingConfirmed(ConfirmationRequest, String),
    Observing(ToolObservation),
    Reflecting { reason: String, class: Option<ErrorClass> },
    Replanning { reason: String },
    Terminated(Termination),
}

impl Phase {
    fn state(&self) -> LoopState {
        match self {
            Self::Reasoning => LoopState::Reasoning,
            Self::ConstraintCheck(_) => LoopState::AwaitingConstraintCheck,
            Self::Executing(_) | Self::ExecutingConfirmed(..) => LoopState::Executing,
            Self::AwaitingConfirmation(..) => LoopState::AwaitingConfirmation,
            Self::Observing(_) => LoopState::Observing,
            Self::Reflecting { .. } => LoopState::Reflecting,
            Self::Replanning { .. } => LoopState::Replanning,
            Self::Terminated(_) => LoopState::Terminated,
        }
    }
}

/// 单次任务运行中的可变状态
struct Run {
    goal: String,
    skill: String,
    conversation: Conversation,
    plan_state: PlanState,
    monitor: ProgressMonitor,
    history: Vec<ToolExecutionRecord>,
    plans: Vec<Arc<StructuredPlan>>,
    /// 最近一次失败对应的错误模式签名（反思后成功时据此沉淀教训）
    last_signature: Option<String>,
    last_thought: Option<String>,
}

/// 单个任务的控制循环
pub struct ControlLoop {
    deps: Arc<LoopDeps>,
    task_id: String,
    events: mpsc::UnboundedSender<LoopEvent>,
    confirmations: Arc<ConfirmationBroker>,
    cancel: CancellationToken,
}

impl ControlLoop {
    pub fn new(
        deps: Arc<LoopDeps>,
        task_id: impl Into<String>,
        events: mpsc::UnboundedSender<LoopEvent>,
        confirmations: Arc<ConfirmationBroker>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            deps,
            task_id: task_id.into(),
            events,
            confirmations,
            cancel,
        }
    }

    pub fn task_id(&self) -> &str {
        &self.task_id
    }

    fn emit(&self, event: LoopEvent) {
        // 接收端可能已经放弃订阅
        let _ = self.events.send(event);
    }

    /// 运行到终止；永不返回错误，失败以 TaskOutcome.report 表达
    pub async fn run(self, input: &str) -> TaskOutcome {
        let mut run = self.start(input).await;
        let mut phase = Phase::Reasoning;
        loop {
            tracing::debug!(task_id = %self.task_id, state = ?phase.state(), "loop transition");
            phase = match phase {
                Phase::Reasoning => self.reason(&mut run).await,
                Phase::ConstraintCheck(p) => self.check_constraints(&mut run, p),
                Phase::Executing(p) => self.execute(&mut run, p).await,
                Phase::AwaitingConfirmation(ticket, thought) => {
                    self.await_confirmation(&mut run, ticket, thought).await
                }
                Phase::ExecutingConfirmed(request, command) => {
                    let obs = self
                        .deps
                        .executor
                        .execute_confirmed(&request, &command, &self.cancel)
                        .await;
                    Phase::Observing(obs)
                }
                Phase::Observing(obs) => self.observe(&mut run, obs).await,
                Phase::Reflecting { reason, class } => self.reflect(&mut run, reason, class).await,
                Phase::Replanning { reason } => self.replan(&mut run, reason).await,
                Phase::Terminated(t) => return self.finish(run, t),
            };
        }
    }

    async fn start(&self, input: &str) -> Run {
        tracing::debug!(task_id = %self.task_id, state = ?LoopState::Init, "loop transition");
        let (skill, rest) = parse_command(input);
        let goal = if rest.trim().is_empty() {
            input.trim().to_string()
        } else {
            rest.trim().to_string()
        };

        let plan = if skill.is_empty() {
            None
        } else {
            let plan = Arc::new(plan_or_fallback(self.deps.plans.as_ref(), &goal, &skill).await);
            self.emit_plan_bound(&plan);
            Some(plan)
        };

        let system = self.system_prompt(plan.as_deref());
        let mut conversation = Conversation::new(system);
        conversation.push(Message::user(goal.clone()));

        tracing::info!(task_id = %self.task_id, skill = %skill, "task started");
        Run {
            goal,
            skill,
            conversation,
            plan_state: PlanState::new(plan.clone()),
            monitor: ProgressMonitor::new(self.deps.settings.limits),
            history: Vec::new(),
            plans: plan.into_iter().collect(),
            last_signature: None,
            last_thought: None,
        }
    }

    fn system_prompt(&self, plan: Option<&StructuredPlan>) -> String {
        build_system_prompt(
            self.deps.settings.base_prompt.as_deref(),
            &self.deps.executor.registry().to_schema_json(),
            plan,
        )
    }

    fn emit_plan_bound(&self, plan: &StructuredPlan) {
        self.emit(LoopEvent::PlanBound {
            skill: plan.skill_binding.clone(),
            plan_id: plan.plan_id.clone(),
            revision: plan.revision,
            steps: plan.steps.len(),
        });
    }

    async fn reason(&self, run: &mut Run) -> Phase {
        if self.cancel.is_cancelled() {
            return Phase::Terminated(Termination::Cancelled);
        }
        if let Decision::Abort(report) = run.monitor.on_iteration() {
            return Phase::Terminated(Termination::Failed(report));
        }
        self.emit(LoopEvent::Reasoning {
            iteration: run.monitor.iterations(),
        });

        let completion = match self
            .deps
            .router
            .complete_cancellable(
                run.conversation.messages(),
                &self.deps.settings.completion,
                &self.cancel,
            )
            .await
        {
            Ok(c) => c,
            Err(LlmError::Cancelled) => return Phase::Terminated(Termination::Cancelled),
            Err(e) => {
                tracing::error!(task_id = %self.task_id, error = %e, "no provider could complete the request");
                return self.recover(run, AgentError::Llm(e));
            }
        };

        match parse_llm_output(&completion.text) {
            Ok(PlannerOutput::Response(text)) => {
                run.conversation.push(Message::assistant(text.clone()));
                Phase::Terminated(Termination::Answer(text))
            }
            Ok(PlannerOutput::ToolCall(call)) => {
                run.conversation.push(Message::assistant(completion.text.trim()));
                Phase::ConstraintCheck(Proposed {
                    invocation: ToolInvocation {
                        tool_call_id: uuid::Uuid::new_v4().to_string(),
                        tool: call.tool,
                        args: call.args,
                    },
                    thought: call.thought,
                })
            }
            Err(err) => {
                run.conversation.push(Message::assistant(completion.text.trim()));
                self.recover(run, err)
            }
        }
    }

    /// 可恢复错误注入提示后回到 Reasoning；不可恢复的终止并给出报告
    fn recover(&self, run: &mut Run, err: AgentError) -> Phase {
        match self
            .deps
            .recovery
            .handle(&err, &self.deps.executor.tool_names())
        {
            RecoveryAction::RetryWithPrompt(prompt) => {
                tracing::warn!(task_id = %self.task_id, error = %err, "recovering from loop error");
                run.conversation.push(Message::user(prompt));
                Phase::Reasoning
            }
            RecoveryAction::Abort => {
                let report = match &err {
                    AgentError::Llm(e) => {
                        ProblemReport::provider_unavailable(e, self.deps.settings.cooldown_secs)
                    }
                    other => ProblemReport::step_failed(
                        run.plan_state.current_step(),
                        run.plan_state.reflections(),
                        &other.to_string(),
                        None,
                        &[],
                    ),
                };
                Phase::Terminated(Termination::Failed(report))
            }
        }
    }

    fn check_constraints(&self, run: &mut Run, proposed: Proposed) -> Phase {
        let call = &proposed.invocation;
        self.emit(LoopEvent::ToolCall {
            tool_call_id: call.tool_call_id.clone(),
            name: call.tool.clone(),
            args: call.args.clone(),
        });

        match self
            .deps
            .constraints
            .check(&call.tool, run.plan_state.plan())
        {
            ConstraintDecision::Allowed => Phase::Executing(proposed),
            ConstraintDecision::Denied { reason } => {
                tracing::info!(task_id = %self.task_id, tool = %call.tool, "tool call denied by plan constraints");
                self.emit(LoopEvent::ToolDenied {
                    tool_call_id: call.tool_call_id.clone(),
                    name: call.tool.clone(),
                    reason: reason.clone(),
                });
                run.conversation.push(Message::tool(format!(
                    "[{}] denied: {reason}\nThe call was not executed; choose an allowed tool.",
                    call.tool
                )));
                match run
                    .monitor
                    .on_constraint_violation(run.plan_state.plan(), &call.tool)
                {
                    Decision::Continue => Phase::Reasoning,
                    Decision::Replan { reason } => Phase::Replanning { reason },
                    Decision::Abort(report) => Phase::Terminated(Termination::Failed(report)),
                }
            }
        }
    }

    async fn execute(&self, run: &mut Run, proposed: Proposed) -> Phase {
        let call = proposed.invocation;
        match self.deps.executor.execute(&call, &self.cancel).await {
            Ok(ExecutionOutcome::Completed(obs)) => {
                run.last_thought = proposed.thought;
                Phase::Observing(obs)
            }
            Ok(ExecutionOutcome::PendingConfirmation { command }) => {
                let request = ConfirmationRequest {
                    task_id: self.task_id.clone(),
                    tool_call_id: call.tool_call_id,
                    confirmation_id: uuid::Uuid::new_v4().to_string(),
                    tool: call.tool,
                    args: call.args,
                    command,
                    step_id: run.plan_state.current_step().map(|s| s.id),
                    requested_at: chrono::Utc::now(),
                };
                let ticket = self.confirmations.register(request);
                self.emit(LoopEvent::AwaitingConfirmation {
                    tool_call_id: ticket.request.tool_call_id.clone(),
                    confirmation_id: ticket.request.confirmation_id.clone(),
                    command: ticket.request.command.clone(),
                });
                Phase::AwaitingConfirmation(ticket, proposed.thought)
            }
            Err(err) => {
                let message = err.to_string();
                self.emit(LoopEvent::ToolResult {
                    tool_call_id: call.tool_call_id.clone(),
                    name: call.tool.clone(),
                    success: false,
                    output: None,
                    error: Some(message.clone()),
                });
                run.history.push(ToolExecutionRecord {
                    tool: call.tool.clone(),
                    args: call.args.clone(),
                    success: false,
                    error_class: Some(ErrorClass::UnknownTool),
                    timestamp: chrono::Utc::now(),
                    step_id: run.plan_state.current_step().map(|s| s.id),
                });
                let pattern = self
                    .deps
                    .learning
                    .record(&call.tool, ErrorClass::UnknownTool, &message);
                run.last_signature = Some(pattern.signature);
                self.recover(run, err)
            }
        }
    }

    async fn await_confirmation(
        &self,
        run: &mut Run,
        ticket: ConfirmationTicket,
        thought: Option<String>,
    ) -> Phase {
        let request = ticket.request.clone();
        tracing::info!(
            task_id = %self.task_id,
            confirmation_id = %request.confirmation_id,
            "waiting for confirmation"
        );
        let decision = self
            .confirmations
            .wait(ticket, self.deps.settings.confirmation_timeout, &self.cancel)
            .await;
        if self.cancel.is_cancelled() {
            return Phase::Terminated(Termination::Cancelled);
        }

        match decision {
            ConfirmationDecision::Proceed { command } => {
                self.emit(LoopEvent::ConfirmationResolved {
                    confirmation_id: request.confirmation_id.clone(),
                    approved: true,
                    detail: command.clone(),
                });
                run.last_thought = thought;
                Phase::ExecutingConfirmed(request, command)
            }
            ConfirmationDecision::Cancelled { reason } => {
                self.emit(LoopEvent::ConfirmationResolved {
                    confirmation_id: request.confirmation_id.clone(),
                    approved: false,
                    detail: reason.clone(),
                });
                run.conversation.push(Message::tool(format!(
                    "[{}] cancelled: {reason}\nThe command `{}` was not executed.",
                    request.tool, request.command
                )));
                Phase::Reasoning
            }
        }
    }

    async fn observe(&self, run: &mut Run, obs: ToolObservation) -> Phase {
        if self.cancel.is_cancelled() {
            return Phase::Terminated(Termination::Cancelled);
        }
        self.emit(LoopEvent::ToolResult {
            tool_call_id: obs.tool_call_id.clone(),
            name: obs.tool.clone(),
            success: obs.success,
            output: (!obs.output.is_empty()).then(|| preview(&obs.output)),
            error: obs.error.clone(),
        });
        let step = run.plan_state.current_step().cloned();
        run.history
            .push(ToolExecutionRecord::from_observation(&obs, step.as_ref().map(|s| s.id)));
        run.conversation.push(Message::tool(obs.to_prompt()));

        if !obs.success {
            let class = obs.error_class.unwrap_or(ErrorClass::Unknown);
            let context = obs.error.clone().unwrap_or_else(|| obs.output.clone());
            let pattern = self.deps.learning.record(&obs.tool, class, &context);
            run.last_signature = Some(pattern.signature);
        }

        let Some(step) = step else {
            // 无计划（或计划已走完）：以工具成败判断进展
            if obs.success {
                if run.plan_state.record_progress() > 0 {
                    let goal = run.goal.clone();
                    self.learn(run, &obs, &goal).await;
                }
                return Phase::Reasoning;
            }
            return Phase::Reflecting {
                reason: obs.error.clone().unwrap_or_else(|| "tool failed".to_string()),
                class: obs.error_class,
            };
        };

        let result = self.deps.milestones.check(&step.expect, &obs);
        self.emit(LoopEvent::MilestoneChecked {
            step_id: step.id,
            passed: result.passed,
            reason: result.reason.clone(),
        });

        if result.passed {
            if run.plan_state.record_pass(&result.reason) > 0 {
                self.learn(run, &obs, &step.description).await;
            }
            let next = match run.plan_state.current_step() {
                Some(next) => format!(
                    "Step {} passed. Next, step {}: {} (expected: {})",
                    step.id, next.id, next.description, next.expect
                ),
                None => "All plan steps are complete. Reply with a short plain-text summary.".to_string(),
            };
            run.conversation.push(Message::user(next));
            return Phase::Reasoning;
        }

        if obs.success {
            let pattern =
                self.deps
                    .learning
                    .record(&obs.tool, ErrorClass::MilestoneFailed, &result.reason);
            run.last_signature = Some(pattern.signature);
        }
        Phase::Reflecting {
            reason: result.reason,
            class: obs.error_class.or(Some(ErrorClass::MilestoneFailed)),
        }
    }

    /// 反思后成功：把纠正做法沉淀为教训
    async fn learn(&self, run: &mut Run, obs: &ToolObservation, context: &str) {
        let Some(signature) = run.last_signature.take() else {
            return;
        };
        let correction = match run.last_thought.take() {
            Some(thought) if !thought.trim().is_empty() => format!(
                "{}\nWhat worked: call `{}` with {}",
                thought.trim(),
                obs.tool,
                obs.args
            ),
            _ => format!(
                "For '{context}', calling `{}` with {} succeeded after earlier failures",
                obs.tool, obs.args
            ),
        };
        let outcome = self.deps.learning.extract_lesson(&signature, &correction).await;
        let stored = matches!(outcome, LessonOutcome::Stored(_));
        tracing::debug!(task_id = %self.task_id, signature = %signature, stored, "lesson extraction finished");
        self.emit(LoopEvent::LessonLearned { signature, stored });
    }

    async fn reflect(&self, run: &mut Run, reason: String, class: Option<ErrorClass>) -> Phase {
        run.plan_state.record_failure(&reason);
        let query = run
            .last_signature
            .as_deref()
            .and_then(|sig| self.deps.learning.pattern(sig))
            .map(|p| p.query_text())
            .unwrap_or_else(|| reason.clone());
        let lessons = tokio::select! {
            lessons = self.deps.learning.retrieve(&query) => lessons,
            _ = self.cancel.cancelled() => return Phase::Terminated(Termination::Cancelled),
        };

        match run
            .monitor
            .on_step_failure(&run.plan_state, &reason, class, &lessons)
        {
            Decision::Continue => {
                self.emit(LoopEvent::Reflecting {
                    step_id: run.plan_state.current_step().map(|s| s.id),
                    attempt: run.plan_state.reflections(),
                    lessons: lessons.iter().map(|l| l.content.clone()).collect(),
                });
                run.conversation
                    .push(Message::user(reflection_prompt(&reason, &lessons)));
                Phase::Reasoning
            }
            Decision::Replan { reason } => Phase::Replanning { reason },
            Decision::Abort(report) => Phase::Terminated(Termination::Failed(report)),
        }
    }

    async fn replan(&self, run: &mut Run, reason: String) -> Phase {
        let Some(previous) = run.plan_state.shared_plan() else {
            return Phase::Terminated(Termination::Failed(ProblemReport::step_failed(
                None,
                run.plan_state.reflections(),
                &reason,
                None,
                &[],
            )));
        };
        run.monitor.on_replanned();
        let revision = previous.revision + 1;
        tracing::info!(task_id = %self.task_id, revision, reason = %reason, "replanning");
        self.emit(LoopEvent::Replanning {
            reason: reason.clone(),
            revision,
        });

        let goal = format!("{}\n\nThe previous plan failed: {reason}", run.goal);
        let fresh = plan_or_fallback(self.deps.plans.as_ref(), &goal, &run.skill).await;
        let next = Arc::new(previous.succeeded_by(fresh));

        run.plan_state = PlanState::new(Some(next.clone()));
        run.plans.push(next.clone());
        run.last_signature = None;
        run.conversation.replace_system(self.system_prompt(Some(&next)));
        run.conversation.push(Message::user(format!(
            "The previous plan failed ({reason}). Revision {revision} of the plan is now active; start from its first step."
        )));
        self.emit_plan_bound(&next);
        Phase::Reasoning
    }

    fn finish(&self, run: Run, termination: Termination) -> TaskOutcome {
        let (success, content, report) = match termination {
            Termination::Answer(text) => (true, text, None),
            Termination::Failed(report) => {
                let report = report.with_attempted(&run.history, ATTEMPTED_IN_REPORT);
                tracing::warn!(
                    task_id = %self.task_id,
                    problem = ?report.problem_class,
                    severity = ?report.severity,
                    "task terminated with a problem report"
                );
                self.emit(LoopEvent::ProblemGuidance(report.clone()));
                (false, report.summary(), Some(report))
            }
            Termination::Cancelled => {
                self.confirmations.cancel_all("task aborted");
                let report = ProblemReport::cancelled().with_attempted(&run.history, ATTEMPTED_IN_REPORT);
                (false, "Task cancelled".to_string(), Some(report))
            }
        };
        self.emit(LoopEvent::Message {
            content: content.clone(),
            finished: true,
        });
        tracing::info!(
            task_id = %self.task_id,
            success,
            iterations = run.monitor.iterations(),
            "task finished"
        );
        TaskOutcome {
            task_id: self.task_id.clone(),
            success,
            content,
            report,
            iterations: run.monitor.iterations(),
            history: run.history,
            plans: run.plans.iter().map(|p| StructuredPlan::clone(p)).collect(),
        }
    }
}

fn preview(text: &str) -> String {
    if text.chars().count() <= OBSERVATION_PREVIEW_CHARS {
        return text.to_string();
    }
    let head: String = text.chars().take(OBSERVATION_PREVIEW_CHARS).collect();
    format!("{head}...")
}
