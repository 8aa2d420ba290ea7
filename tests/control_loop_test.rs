//! 控制循环端到端测试：脚本化 LLM + 静态计划，断言事件序列与终止结果

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use hive::config::{LearningSection, ToolsSection};
use hive::core::{Orchestrator, RecoveryEngine};
use hive::learning::ErrorLearningService;
use hive::llm::{
    LlmClient, ProviderRouter, RouterConfig, ScriptedLlmClient, ScriptedReply,
};
use hive::memory::InMemoryLessonIndex;
use hive::react::{
    ConstraintValidator, LoopDeps, LoopEvent, LoopSettings, MilestoneValidator, MonitorLimits,
    ProblemClass, Severity, TaskOutcome,
};
use hive::skills::{StaticPlanProvider, Step, StructuredPlan, ToolConstraints};
use hive::tools::{default_registry, ConfirmationResponse, SafeFs, ToolExecutor};
use serde_json::json;
use tempfile::TempDir;

struct Harness {
    orchestrator: Orchestrator,
    learning: Arc<ErrorLearningService>,
    workspace: TempDir,
}

fn limits(max_iterations: u32, max_reflections_per_step: u32, max_replans: u32) -> MonitorLimits {
    MonitorLimits {
        max_iterations,
        max_reflections_per_step,
        max_constraint_violations: 3,
        max_replans,
    }
}

fn harness_with_router(router: ProviderRouter, plans: StaticPlanProvider, limits: MonitorLimits) -> Harness {
    let workspace = tempfile::tempdir().unwrap();
    let registry = default_registry(workspace.path(), &ToolsSection::default());
    let learning = Arc::new(ErrorLearningService::new(
        LearningSection::default(),
        Some(Arc::new(InMemoryLessonIndex::default())),
    ));
    let mut settings = LoopSettings::default();
    settings.limits = limits;
    settings.confirmation_timeout = Duration::from_secs(5);

    let deps = LoopDeps {
        router: Arc::new(router),
        executor: Arc::new(ToolExecutor::new(Arc::new(registry), 5)),
        learning: Arc::clone(&learning),
        plans: Arc::new(plans),
        milestones: MilestoneValidator::new(Some(SafeFs::new(workspace.path()))),
        constraints: ConstraintValidator::new(),
        recovery: RecoveryEngine::new(),
        settings,
    };
    Harness {
        orchestrator: Orchestrator::new(deps),
        learning,
        workspace,
    }
}

fn harness(llm: Arc<ScriptedLlmClient>, plans: StaticPlanProvider, limits: MonitorLimits) -> Harness {
    let router = ProviderRouter::new(RouterConfig::default()).with_provider("scripted", 0, llm);
    harness_with_router(router, plans, limits)
}

fn single_step_plan(skill: &str, allowed: &[&str], expect: &str) -> StructuredPlan {
    StructuredPlan::new(
        skill,
        ToolConstraints::new(allowed.iter().copied(), Vec::<String>::new()),
        vec![Step::new(1, "do the work", expect)],
    )
}

async fn run(h: &Harness, input: &str) -> (Vec<LoopEvent>, TaskOutcome) {
    let handle = h.orchestrator.spawn_task(input);
    tokio::time::timeout(Duration::from_secs(20), handle.collect())
        .await
        .expect("task did not finish in time")
        .unwrap()
}

fn kinds(events: &[LoopEvent]) -> Vec<&'static str> {
    events.iter().map(LoopEvent::kind).collect()
}

fn write(workspace: &Path, name: &str, content: &str) {
    std::fs::write(workspace.join(name), content).unwrap();
}

#[tokio::test]
async fn test_denied_tool_is_never_executed() {
    let llm = Arc::new(ScriptedLlmClient::new([
        ScriptedReply::tool("run_in_terminal", json!({ "command": "touch app.toml" })),
        ScriptedReply::tool("write_file", json!({ "path": "app.toml", "content": "port = 8080" })),
        ScriptedReply::text("Wrote app.toml."),
    ]));
    let plans = StaticPlanProvider::new().with_plan(
        "write-config",
        single_step_plan("write-config", &["read_file", "write_file"], "file exists"),
    );
    let h = harness(llm.clone(), plans, MonitorLimits::default());

    let (events, outcome) = run(&h, "/write-config create app.toml").await;

    assert_eq!(
        kinds(&events),
        vec![
            "plan_bound",
            "reasoning",
            "tool_call",
            "tool_denied",
            "reasoning",
            "tool_call",
            "tool_result",
            "milestone_checked",
            "reasoning",
            "message",
        ]
    );
    assert!(!events.iter().any(|e| matches!(
        e,
        LoopEvent::ToolResult { name, .. } if name == "run_in_terminal"
    )));
    match &events[3] {
        LoopEvent::ToolDenied { name, reason, .. } => {
            assert_eq!(name, "run_in_terminal");
            assert!(reason.contains("read_file, write_file"));
        }
        other => panic!("unexpected {other:?}"),
    }
    assert!(matches!(&events[7], LoopEvent::MilestoneChecked { step_id: 1, passed: true, .. }));
    assert!(outcome.success);
    assert_eq!(outcome.content, "Wrote app.toml.");
    assert_eq!(outcome.history.len(), 1);
    assert!(h.workspace.path().join("app.toml").exists());
    assert_eq!(llm.calls(), 3);
}

#[tokio::test]
async fn test_read_step_passes_on_existing_file() {
    let llm = Arc::new(ScriptedLlmClient::new([
        ScriptedReply::tool("read_file", json!({ "path": "a.txt" })),
        ScriptedReply::text("The file says hello."),
    ]));
    let plans = StaticPlanProvider::new()
        .with_plan("cfg", single_step_plan("cfg", &["read_file"], "output contains hello"));
    let h = harness(llm, plans, MonitorLimits::default());
    write(h.workspace.path(), "a.txt", "hello");

    let (events, outcome) = run(&h, "/cfg show a.txt").await;

    assert!(events
        .iter()
        .any(|e| matches!(e, LoopEvent::MilestoneChecked { passed: true, .. })));
    assert!(outcome.success);
    assert_eq!(outcome.history[0].step_id, Some(1));
}

#[tokio::test]
async fn test_repeated_milestone_failure_ends_with_problem_guidance() {
    let llm = Arc::new(ScriptedLlmClient::repeating(ScriptedReply::tool(
        "echo",
        json!({ "text": "working on it" }),
    )));
    let plans =
        StaticPlanProvider::new().with_plan("cfg", single_step_plan("cfg", &[], "file exists out.toml"));
    let h = harness(llm, plans, limits(20, 3, 0));

    let (events, outcome) = run(&h, "/cfg write out.toml").await;

    let reflecting = events.iter().filter(|e| e.kind() == "reflecting").count();
    assert_eq!(reflecting, 2);
    let failed_checks = events
        .iter()
        .filter(|e| matches!(e, LoopEvent::MilestoneChecked { passed: false, .. }))
        .count();
    assert_eq!(failed_checks, 3);

    let n = events.len();
    match (&events[n - 2], &events[n - 1]) {
        (LoopEvent::ProblemGuidance(report), LoopEvent::Message { finished, .. }) => {
            assert!(*finished);
            assert_eq!(report.problem_class, ProblemClass::StepFailed);
            assert!(report.severity >= Severity::High);
            assert!(!report.steps.is_empty());
            assert!(!report.attempted.is_empty());
        }
        other => panic!("unexpected tail {other:?}"),
    }
    assert!(!outcome.success);
    assert!(outcome.report.is_some());
    assert!(h.learning.metrics().total_errors_recorded >= 3);
}

#[tokio::test]
async fn test_provider_exhaustion_reports_provider_unavailable() {
    let primary: Arc<dyn LlmClient> = Arc::new(ScriptedLlmClient::repeating(ScriptedReply::fail("503")));
    let backup: Arc<dyn LlmClient> = Arc::new(ScriptedLlmClient::repeating(ScriptedReply::fail("connection reset")));
    let router = ProviderRouter::new(RouterConfig::default())
        .with_provider("primary", 0, primary)
        .with_provider("backup", 1, backup);
    let h = harness_with_router(router, StaticPlanProvider::new(), MonitorLimits::default());

    let (events, outcome) = run(&h, "summarize the logs").await;

    assert_eq!(kinds(&events), vec!["reasoning", "problem_guidance", "message"]);
    let report = outcome.report.expect("report");
    assert_eq!(report.problem_class, ProblemClass::ProviderUnavailable);
    assert_eq!(report.severity, Severity::Critical);
    assert!(report.description.contains("primary"));
    assert!(report.description.contains("backup"));

    let snapshot = h.orchestrator.provider_snapshot();
    assert_eq!(snapshot.len(), 2);
    assert!(snapshot.iter().all(|p| p.consecutive_failures == 1));
}

#[cfg(unix)]
#[tokio::test]
async fn test_confirmation_with_edited_command() {
    let llm = Arc::new(ScriptedLlmClient::new([
        ScriptedReply::tool("run_in_terminal", json!({ "command": "rm -f scratch.txt" })),
        ScriptedReply::text("Cleaned up."),
    ]));
    let h = harness(llm.clone(), StaticPlanProvider::new(), MonitorLimits::default());

    let mut handle = h.orchestrator.spawn_task("remove the scratch file");
    let mut events = Vec::new();
    while let Some(ev) = handle.next_event().await {
        if let LoopEvent::AwaitingConfirmation { tool_call_id, confirmation_id, command } = &ev {
            assert_eq!(command, "rm -f scratch.txt");
            assert_eq!(handle.pending_confirmations().len(), 1);
            handle
                .confirm(ConfirmationResponse {
                    tool_call_id: tool_call_id.clone(),
                    confirmation_id: confirmation_id.clone(),
                    command: "echo confirmed".to_string(),
                })
                .unwrap();
        }
        events.push(ev);
    }
    let outcome = handle.join().await.unwrap();

    assert_eq!(
        kinds(&events),
        vec![
            "reasoning",
            "tool_call",
            "awaiting_confirmation",
            "confirmation_resolved",
            "tool_result",
            "reasoning",
            "message",
        ]
    );
    match &events[4] {
        LoopEvent::ToolResult { success, output, .. } => {
            assert!(*success);
            assert!(output.as_deref().unwrap_or("").contains("confirmed"));
        }
        other => panic!("unexpected {other:?}"),
    }
    assert!(outcome.success);
    assert_eq!(outcome.history[0].args["command"], "echo confirmed");
}

#[tokio::test]
async fn test_rejected_confirmation_returns_to_reasoning() {
    let llm = Arc::new(ScriptedLlmClient::new([
        ScriptedReply::tool("run_in_terminal", json!({ "command": "rm -f data.db" })),
        ScriptedReply::text("Left the database alone."),
    ]));
    let h = harness(llm.clone(), StaticPlanProvider::new(), MonitorLimits::default());

    let mut handle = h.orchestrator.spawn_task("reset the database");
    let mut events = Vec::new();
    while let Some(ev) = handle.next_event().await {
        if let LoopEvent::AwaitingConfirmation { confirmation_id, .. } = &ev {
            handle.cancel_confirmation(confirmation_id).unwrap();
        }
        events.push(ev);
    }
    let outcome = handle.join().await.unwrap();

    assert!(!events.iter().any(|e| e.kind() == "tool_result"));
    assert!(events.iter().any(|e| matches!(
        e,
        LoopEvent::ConfirmationResolved { approved: false, .. }
    )));
    assert!(outcome.success);
    let last_prompt = llm.seen_messages().pop().unwrap();
    assert!(last_prompt
        .iter()
        .any(|m| m.content.contains("was not executed")));
}

#[tokio::test]
async fn test_lesson_learned_after_reflection() {
    let correction = json!({
        "thought": "The file did not exist, so create `notes.txt` with write_file before reading it",
        "tool": "write_file",
        "args": { "path": "notes.txt", "content": "todo" }
    });
    let llm = Arc::new(ScriptedLlmClient::new([
        ScriptedReply::tool("read_file", json!({ "path": "notes.txt" })),
        ScriptedReply::text(correction.to_string()),
        ScriptedReply::text("notes.txt created."),
    ]));
    let h = harness(llm, StaticPlanProvider::new(), MonitorLimits::default());

    let (events, outcome) = run(&h, "make sure notes.txt exists").await;

    assert!(outcome.success);
    let reflect_at = events.iter().position(|e| e.kind() == "reflecting").expect("reflecting");
    let learned_at = events.iter().position(|e| e.kind() == "lesson_learned").expect("lesson");
    assert!(reflect_at < learned_at);
    match &events[learned_at] {
        LoopEvent::LessonLearned { stored, .. } => assert!(*stored),
        other => panic!("unexpected {other:?}"),
    }
    assert_eq!(h.learning.metrics().stored_lessons, 1);
    assert!(h.workspace.path().join("notes.txt").exists());
}

#[tokio::test]
async fn test_exhausted_reflections_trigger_replan() {
    let llm = Arc::new(ScriptedLlmClient::new([
        ScriptedReply::tool("echo", json!({ "text": "not yet" })),
        ScriptedReply::tool("write_file", json!({ "path": "out.toml", "content": "a = 1" })),
        ScriptedReply::text("Wrote out.toml."),
    ]));
    let plans = StaticPlanProvider::new()
        .with_plan("cfg", single_step_plan("cfg", &["echo", "write_file"], "file exists out.toml"));
    let h = harness(llm, plans, limits(20, 1, 1));

    let (events, outcome) = run(&h, "/cfg create out.toml").await;

    let bound: Vec<u32> = events
        .iter()
        .filter_map(|e| match e {
            LoopEvent::PlanBound { revision, .. } => Some(*revision),
            _ => None,
        })
        .collect();
    assert_eq!(bound, vec![0, 1]);
    assert!(events
        .iter()
        .any(|e| matches!(e, LoopEvent::Replanning { revision: 1, .. })));
    assert!(outcome.success);
    assert_eq!(outcome.plans.len(), 2);
    assert_ne!(outcome.plans[0].plan_id, outcome.plans[1].plan_id);
}

#[tokio::test]
async fn test_abort_cancels_in_flight_call() {
    let llm = Arc::new(ScriptedLlmClient::repeating(ScriptedReply::Hang));
    let h = harness(llm, StaticPlanProvider::new(), MonitorLimits::default());

    let mut handle = h.orchestrator.spawn_task("wait forever");
    let first = handle.next_event().await.unwrap();
    assert_eq!(first.kind(), "reasoning");
    handle.abort();
    let (events, outcome) = tokio::time::timeout(Duration::from_secs(5), handle.collect())
        .await
        .unwrap()
        .unwrap();

    assert_eq!(kinds(&events), vec!["message"]);
    assert!(matches!(
        &events[0],
        LoopEvent::Message { content, finished: true } if content == "Task cancelled"
    ));
    assert_eq!(outcome.report.unwrap().problem_class, ProblemClass::Cancelled);
    // 取消不计入 Provider 失败
    assert_eq!(h.orchestrator.provider_snapshot()[0].consecutive_failures, 0);
}

#[tokio::test]
async fn test_iteration_limit_terminates() {
    let llm = Arc::new(ScriptedLlmClient::repeating(ScriptedReply::tool(
        "echo",
        json!({ "text": "again" }),
    )));
    let h = harness(llm, StaticPlanProvider::new(), limits(2, 3, 0));

    let (events, outcome) = run(&h, "loop").await;

    assert_eq!(events.iter().filter(|e| e.kind() == "reasoning").count(), 2);
    let report = outcome.report.expect("report");
    assert_eq!(report.problem_class, ProblemClass::IterationLimit);
    assert_eq!(outcome.iterations, 2);
}

#[tokio::test]
async fn test_unknown_tool_is_recovered() {
    let llm = Arc::new(ScriptedLlmClient::new([
        ScriptedReply::tool("teleport", json!({})),
        ScriptedReply::text("Cannot teleport; done."),
    ]));
    let h = harness(llm.clone(), StaticPlanProvider::new(), MonitorLimits::default());

    let (events, outcome) = run(&h, "go somewhere").await;

    assert!(events.iter().any(|e| matches!(
        e,
        LoopEvent::ToolResult { success: false, name, .. } if name == "teleport"
    )));
    assert!(outcome.success);
    let second = &llm.seen_messages()[1];
    assert!(second
        .last()
        .map_or(false, |m| m.content.contains("Available tools")));
}
