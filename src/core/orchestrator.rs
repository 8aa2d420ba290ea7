//! 编排器：装配 Router / 工具 / 错误学习 / 计划提供方，并为每个任务启动一个控制循环
//!
//! 每个任务在独立的 tokio task 中运行，通过 TaskHandle 拉取事件、回复确认、取消或等待结果。

use std::path::PathBuf;
use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::config::AppConfig;
use crate::core::{AgentError, RecoveryEngine, SessionSupervisor};
use crate::learning::{ErrorLearningService, LearningMetrics};
use crate::llm::{ProviderRouter, ProviderSnapshot};
use crate::memory::InMemoryLessonIndex;
use crate::react::{
    ConstraintValidator, ControlLoop, LoopDeps, LoopEvent, LoopSettings, MilestoneValidator,
    TaskOutcome,
};
use crate::skills::{SkillLoader, SkillPlanProvider};
use crate::tools::{
    default_registry, ConfirmationBroker, ConfirmationError, ConfirmationRequest,
    ConfirmationResponse, SafeFs, ToolExecutor,
};

/// 运行中任务的句柄
pub struct TaskHandle {
    task_id: String,
    events: mpsc::UnboundedReceiver<LoopEvent>,
    confirmations: Arc<ConfirmationBroker>,
    cancel: CancellationToken,
    join: JoinHandle<TaskOutcome>,
}

impl TaskHandle {
    pub fn task_id(&self) -> &str {
        &self.task_id
    }

    /// 下一个过程事件；循环结束且事件取尽后返回 None
    pub async fn next_event(&mut self) -> Option<LoopEvent> {
        self.events.recv().await
    }

    pub fn try_next_event(&mut self) -> Option<LoopEvent> {
        self.events.try_recv().ok()
    }

    /// 同意（可附带修改后的命令）挂起的高风险调用
    pub fn confirm(&self, response: ConfirmationResponse) -> Result<(), ConfirmationError> {
        self.confirmations.confirm(response)
    }

    /// 拒绝挂起的调用；循环记录取消观察后继续
    pub fn cancel_confirmation(&self, confirmation_id: &str) -> Result<(), ConfirmationError> {
        self.confirmations.cancel(confirmation_id)
    }

    pub fn pending_confirmations(&self) -> Vec<ConfirmationRequest> {
        self.confirmations.pending()
    }

    /// 取消整个任务
    pub fn abort(&self) {
        self.cancel.cancel();
    }

    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub async fn join(self) -> Result<TaskOutcome, AgentError> {
        self.join
            .await
            .map_err(|e| AgentError::TaskJoin(e.to_string()))
    }

    /// 取尽全部事件后等待结果
    pub async fn collect(mut self) -> Result<(Vec<LoopEvent>, TaskOutcome), AgentError> {
        let mut events = Vec::new();
        while let Some(ev) = self.events.recv().await {
            events.push(ev);
        }
        let outcome = self.join().await?;
        Ok((events, outcome))
    }
}

/// 多任务编排器
pub struct Orchestrator {
    deps: Arc<LoopDeps>,
    supervisor: Arc<SessionSupervisor>,
}

impl Orchestrator {
    pub fn new(deps: LoopDeps) -> Self {
        Self {
            deps: Arc::new(deps),
            supervisor: Arc::new(SessionSupervisor::new()),
        }
    }

    /// 按配置装配全部依赖；工作目录不存在时创建
    pub fn from_config(config: &AppConfig) -> Result<Self, AgentError> {
        let workspace = match &config.app.workspace_root {
            Some(root) => root.clone(),
            None => std::env::current_dir()
                .map_err(|e| AgentError::ConfigError(format!("cannot resolve current dir: {e}")))?
                .join("workspace"),
        };
        std::fs::create_dir_all(&workspace).map_err(|e| {
            AgentError::ConfigError(format!("cannot create workspace {}: {e}", workspace.display()))
        })?;
        let workspace: PathBuf = workspace.canonicalize().unwrap_or(workspace);
        tracing::info!(workspace = %workspace.display(), "orchestrator workspace ready");

        let router = Arc::new(ProviderRouter::from_config(&config.llm, &config.router));
        let registry = default_registry(&workspace, &config.tools);
        let executor = Arc::new(ToolExecutor::new(
            Arc::new(registry),
            config.tools.tool_timeout_secs,
        ));
        let learning = ErrorLearningService::init_global(
            config.learning.clone(),
            Some(Arc::new(InMemoryLessonIndex::default())),
        );
        let loader = match &config.orchestrator.skills_dir {
            Some(dir) => SkillLoader::new(dir),
            None => SkillLoader::from_default(),
        };

        Ok(Self::new(LoopDeps {
            router,
            executor,
            learning,
            plans: Arc::new(SkillPlanProvider::new(Arc::new(loader))),
            milestones: MilestoneValidator::new(Some(SafeFs::new(&workspace))),
            constraints: ConstraintValidator::new(),
            recovery: RecoveryEngine::new(),
            settings: LoopSettings::from_config(config),
        }))
    }

    pub fn deps(&self) -> &Arc<LoopDeps> {
        &self.deps
    }

    /// 启动一个任务；事件与确认通过返回的句柄交互
    pub fn spawn_task(&self, input: impl Into<String>) -> TaskHandle {
        let input = input.into();
        let task_id = uuid::Uuid::new_v4().to_string();
        let cancel = self.supervisor.register(&task_id);
        let confirmations = Arc::new(ConfirmationBroker::new());
        let (tx, rx) = mpsc::unbounded_channel();

        let control = ControlLoop::new(
            Arc::clone(&self.deps),
            task_id.clone(),
            tx,
            Arc::clone(&confirmations),
            cancel.clone(),
        );
        let supervisor = Arc::clone(&self.supervisor);
        let id = task_id.clone();
        let join = tokio::spawn(async move {
            let outcome = control.run(&input).await;
            supervisor.finish(&id);
            outcome
        });

        TaskHandle {
            task_id,
            events: rx,
            confirmations,
            cancel,
            join,
        }
    }

    /// 运行到结束（不关心过程事件）
    pub async fn run_task(&self, input: impl Into<String>) -> Result<TaskOutcome, AgentError> {
        self.spawn_task(input).join().await
    }

    pub fn cancel_task(&self, task_id: &str) -> bool {
        self.supervisor.cancel_task(task_id)
    }

    pub fn active_tasks(&self) -> Vec<String> {
        self.supervisor.active_tasks()
    }

    pub fn provider_snapshot(&self) -> Vec<ProviderSnapshot> {
        self.deps.router.snapshot()
    }

    /// 手动闭合某个 Provider 的熔断器
    pub fn reset_provider(&self, name: &str) -> bool {
        self.deps.router.reset(name)
    }

    pub fn learning_metrics(&self) -> LearningMetrics {
        self.deps.learning.metrics()
    }

    pub fn shutdown(&self) {
        self.supervisor.shutdown();
    }
}
