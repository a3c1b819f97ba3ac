//! The cognitive run controller: owns one run's lifecycle, budgets, step
//! executor, step-success inference, and post-run reflection/metrics.
//!
//! State machine per run:
//! `pending -> planning -> executing -> reflecting -> completed`, with any
//! state able to transition to `failed` or `stopped`. Hitting an action
//! budget is expected behaviour, not an error: remaining steps are marked
//! skipped and the run result becomes `partial`.

pub mod improvement;
pub mod reflection;

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{error, info, warn};

use crate::browser::BrowserSession;
use crate::config::RunBudgets;
use crate::context::NoemaContext;
use crate::decision::{DecisionEngine, PlannedAction, STUCK_LOOP_THRESHOLD};
use crate::narration::NarrationType;
use crate::optimizer::{RolloutDriver, RolloutOutcome};
use crate::planner::{GeneratedBy, PlanStep, TestPlan};
use crate::sensing::{ObservationBus, Sensing};
use crate::sequences::MIN_REPLAY_CONFIDENCE;
use crate::store::{ActionType, RunMetrics, RunRecord, SequenceAction};

pub use improvement::{ImprovementAnalyzer, ImprovementSummary};
pub use reflection::{
    build_reflection, overall_result, suggest_next_goal, MemorySavings, QaReport, Reflection,
    RunResult, StepResult, StepSummary,
};

/// Decision cycles per rollout during optimization.
const ROLLOUT_MAX_CYCLES: usize = 6;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunState {
    Pending,
    Planning,
    Executing,
    Reflecting,
    Completed,
    Failed,
    Stopped,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunOptions {
    pub goal: String,
    pub url: String,
    #[serde(default)]
    pub enable_optimization: bool,
    #[serde(default)]
    pub budgets: RunBudgets,
}

/// Live view served by `GET /run/:id/state`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunStatus {
    pub run_id: String,
    pub goal: String,
    pub url: String,
    pub state: RunState,
    pub started_at: DateTime<Utc>,
    pub elapsed_ms: u64,
    pub steps_total: u32,
    pub steps_completed: u32,
    pub actions_taken: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<RunResult>,
}

/// Shared handle for one run: live counters, stop flag, final report.
pub struct RunHandle {
    pub run_id: String,
    goal: String,
    url: String,
    started_at: DateTime<Utc>,
    state: RwLock<RunState>,
    steps_total: AtomicU32,
    steps_completed: AtomicU32,
    actions_taken: AtomicU32,
    stop_requested: AtomicBool,
    report: RwLock<Option<QaReport>>,
}

impl RunHandle {
    pub fn new(run_id: &str, goal: &str, url: &str) -> Arc<Self> {
        Arc::new(Self {
            run_id: run_id.to_string(),
            goal: goal.to_string(),
            url: url.to_string(),
            started_at: Utc::now(),
            state: RwLock::new(RunState::Pending),
            steps_total: AtomicU32::new(0),
            steps_completed: AtomicU32::new(0),
            actions_taken: AtomicU32::new(0),
            stop_requested: AtomicBool::new(false),
            report: RwLock::new(None),
        })
    }

    pub fn state(&self) -> RunState {
        *self.state.read()
    }

    fn set_state(&self, state: RunState) {
        *self.state.write() = state;
    }

    pub fn request_stop(&self) {
        self.stop_requested.store(true, Ordering::SeqCst);
    }

    pub fn is_stop_requested(&self) -> bool {
        self.stop_requested.load(Ordering::SeqCst)
    }

    pub fn actions_taken(&self) -> u32 {
        self.actions_taken.load(Ordering::SeqCst)
    }

    pub fn report(&self) -> Option<QaReport> {
        self.report.read().clone()
    }

    pub fn status(&self) -> RunStatus {
        RunStatus {
            run_id: self.run_id.clone(),
            goal: self.goal.clone(),
            url: self.url.clone(),
            state: self.state(),
            started_at: self.started_at,
            elapsed_ms: (Utc::now() - self.started_at).num_milliseconds().max(0) as u64,
            steps_total: self.steps_total.load(Ordering::SeqCst),
            steps_completed: self.steps_completed.load(Ordering::SeqCst),
            actions_taken: self.actions_taken(),
            result: self.report.read().as_ref().map(|r| r.result),
        }
    }
}

#[derive(Default)]
pub struct RunRegistry {
    runs: RwLock<HashMap<String, Arc<RunHandle>>>,
}

impl RunRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, handle: Arc<RunHandle>) {
        self.runs.write().insert(handle.run_id.clone(), handle);
    }

    pub fn get(&self, run_id: &str) -> Option<Arc<RunHandle>> {
        self.runs.read().get(run_id).cloned()
    }

    pub fn list(&self) -> Vec<Arc<RunHandle>> {
        self.runs.read().values().cloned().collect()
    }
}

/// Reject goals whose target URL is malformed. Two scheme prefixes in one
/// string is the classic copy-paste accident and gets a dedicated message.
pub fn validate_target_url(url: &str) -> Result<(), String> {
    let trimmed = url.trim();
    if trimmed.is_empty() {
        return Err("target URL must not be empty".to_string());
    }
    let schemes = trimmed.matches("http://").count() + trimmed.matches("https://").count();
    if schemes > 1 {
        return Err("invalid URL: multiple URLs concatenated".to_string());
    }
    let parsed = url::Url::parse(trimmed).map_err(|e| format!("invalid URL: {e}"))?;
    if !matches!(parsed.scheme(), "http" | "https") {
        return Err(format!("unsupported URL scheme: {}", parsed.scheme()));
    }
    Ok(())
}

#[derive(Clone)]
struct StepAction {
    kind: ActionType,
    selector: Option<String>,
    value_template: Option<String>,
    rationale: String,
    success: bool,
}

enum StepVerdict {
    Passed,
    FailedIndicator(String),
    Undecided,
}

/// Step-success inference. A step passes when at least one of:
/// (a) the action hint executed successfully;
/// (b) a success sentinel from `expected_results` appears in the last DOM
///     snapshot (substring, case-insensitive);
/// (c) any non-no_op action succeeded and the DOM shows no error messages.
/// It fails outright when a DOM error message matches the failure
/// indicator (substring, either direction, case-insensitive).
fn infer_step_verdict(
    step: &PlanStep,
    actions: &[StepAction],
    dom: Option<&crate::browser::DomSnapshot>,
) -> StepVerdict {
    if let Some(dom) = dom {
        let indicator = step.failure_indicator.trim().to_lowercase();
        if !indicator.is_empty() {
            for message in &dom.error_messages {
                let message_lower = message.to_lowercase();
                if message_lower.contains(&indicator) || indicator.contains(&message_lower) {
                    return StepVerdict::FailedIndicator(message.clone());
                }
            }
        }
    }

    let hint_ok = actions.iter().any(|a| a.success && a.kind == step.action_hint);
    if hint_ok {
        return StepVerdict::Passed;
    }

    if let Some(dom) = dom {
        let haystack = format!("{} {} {}", dom.title, dom.url, dom.body_text_preview).to_lowercase();
        let sentinel = step
            .expected_results
            .iter()
            .map(|e| e.trim().to_lowercase())
            .any(|e| !e.is_empty() && haystack.contains(&e));
        if sentinel {
            return StepVerdict::Passed;
        }
        let any_success = actions
            .iter()
            .any(|a| a.success && a.kind != ActionType::NoOp);
        if any_success && dom.error_messages.is_empty() {
            return StepVerdict::Passed;
        }
    }

    StepVerdict::Undecided
}

pub struct CognitiveRunController {
    ctx: Arc<NoemaContext>,
    handle: Arc<RunHandle>,
    options: RunOptions,
    llm_calls: AtomicU32,
}

impl CognitiveRunController {
    pub fn new(ctx: Arc<NoemaContext>, handle: Arc<RunHandle>, options: RunOptions) -> Self {
        Self {
            ctx,
            handle,
            options,
            llm_calls: AtomicU32::new(0),
        }
    }

    /// Drive the run to completion. Every exit path emits `run_completed`
    /// and leaves a report on the handle; internal errors surface as a
    /// failed run, never as a panic or a missing report.
    pub async fn run(self) -> QaReport {
        let run_id = self.handle.run_id.clone();
        match self.execute().await {
            Ok(report) => report,
            Err(err) => {
                error!(run = %run_id, error = %err, "run failed");
                self.handle.set_state(RunState::Failed);
                self.ctx.narration.emit(
                    NarrationType::Error,
                    Some(&run_id),
                    format!("I had to abandon this run: {err}"),
                    None,
                );
                let report = self.failure_report(&err).await;
                *self.handle.report.write() = Some(report.clone());
                self.ctx.narration.emit(
                    NarrationType::RunCompleted,
                    Some(&run_id),
                    "I finished the run with a failure".to_string(),
                    serde_json::to_value(&report).ok(),
                );
                report
            }
        }
    }

    async fn execute(&self) -> anyhow::Result<QaReport> {
        let run_id = self.handle.run_id.clone();
        let goal = self.options.goal.clone();
        let url = self.options.url.clone();
        let started = Instant::now();
        let run_started_at = Utc::now();

        let models_before = self.ctx.store.models.count().await? as u32;
        let _ = self.ctx.identity.refresh().await;

        self.handle.set_state(RunState::Planning);
        self.ctx.narration.emit(
            NarrationType::RunStarted,
            Some(&run_id),
            format!("I am starting a run: {goal}"),
            Some(json!({ "url": url })),
        );
        self.ctx
            .store
            .runs
            .create(RunRecord::new(&run_id, &goal))
            .await?;

        let plan = self
            .ctx
            .planner
            .generate(&goal, &url, &self.options.budgets)
            .await;
        if plan.generated_by == GeneratedBy::Llm {
            self.llm_calls.fetch_add(1, Ordering::SeqCst);
        }
        self.handle
            .steps_total
            .store(plan.total_steps as u32, Ordering::SeqCst);
        self.ctx.narration.emit(
            NarrationType::PlanGenerated,
            Some(&run_id),
            format!("I planned {} test steps for this goal", plan.total_steps),
            serde_json::to_value(&plan).ok(),
        );

        self.handle.set_state(RunState::Executing);
        let session = self
            .ctx
            .sessions
            .create(&run_id)
            .await
            .map_err(|e| anyhow::anyhow!("browser session: {e}"))?;
        self.ctx.browsers.insert(session.clone());

        let engine = DecisionEngine::new(
            &run_id,
            self.ctx.store.clone(),
            self.ctx.llm.clone(),
            self.ctx.narration.clone(),
            self.ctx.sensing.clone(),
            self.ctx.credentials.clone(),
        );

        let outcome = self.execute_steps(&plan, &session, &engine).await?;

        self.handle.set_state(RunState::Reflecting);
        let video_path = match session.close().await {
            Ok(path) => Some(path),
            Err(err) => {
                warn!(error = %err, "browser close failed");
                None
            }
        };
        self.ctx.browsers.remove(&run_id);

        let report = self
            .finalise(
                plan,
                outcome,
                video_path,
                started.elapsed().as_millis() as u64,
                run_started_at,
                models_before,
            )
            .await?;

        *self.handle.report.write() = Some(report.clone());
        if self.handle.is_stop_requested() {
            self.handle.set_state(RunState::Stopped);
        } else {
            self.handle.set_state(RunState::Completed);
        }

        self.ctx.narration.emit(
            NarrationType::RunCompleted,
            Some(&self.handle.run_id),
            match report.result {
                RunResult::Pass => "I finished the run: every step passed".to_string(),
                RunResult::Partial => "I finished the run with partial results".to_string(),
                RunResult::Fail => "I finished the run: the goal could not be verified".to_string(),
            },
            serde_json::to_value(&report).ok(),
        );

        // deep-learn handoff: background, never blocks the report
        if self.options.enable_optimization {
            let ctx = self.ctx.clone();
            let run_id = self.handle.run_id.clone();
            let goal = self.options.goal.clone();
            let url = self.options.url.clone();
            tokio::spawn(async move {
                let driver = BrowserRolloutDriver::new(ctx.clone());
                if let Err(err) = ctx.optimizer.optimize(&run_id, &goal, &url, &driver).await {
                    warn!(run = %run_id, error = %err, "experience optimization failed");
                }
            });
        }

        let _ = self.ctx.identity.refresh().await;
        Ok(report)
    }

    async fn execute_steps(
        &self,
        plan: &TestPlan,
        session: &Arc<BrowserSession>,
        engine: &DecisionEngine,
    ) -> anyhow::Result<StepLoopOutcome> {
        let run_id = &self.handle.run_id;
        let goal = &self.options.goal;
        let url = &self.options.url;
        let budgets = &self.options.budgets;

        let mut outcome = StepLoopOutcome::default();

        for (index, step) in plan.steps.iter().enumerate() {
            if self.handle.is_stop_requested() {
                self.mark_remaining_skipped(&plan.steps[index..], &mut outcome, "run stopped");
                break;
            }
            if self.handle.actions_taken() >= budgets.max_total_actions {
                self.ctx.narration.narrate(
                    Some(run_id),
                    "I used up my action budget; skipping the remaining steps",
                );
                self.mark_remaining_skipped(&plan.steps[index..], &mut outcome, "action budget exhausted");
                break;
            }

            self.ctx.narration.emit(
                NarrationType::PlanStepStarted,
                Some(run_id),
                format!("I am starting step {}: {}", index + 1, step.title),
                Some(json!({ "step_id": step.step_id, "title": step.title })),
            );

            let mut step_actions: Vec<StepAction> = Vec::new();
            let mut from_memory = false;
            let mut interrupted = false;

            // replay branch: a remembered sequence bypasses the decision LLM
            if let Some(sequence) = self
                .ctx
                .sequences
                .find(&step.title, url, MIN_REPLAY_CONFIDENCE)
                .await?
            {
                if !sequence.requires_credentials || self.ctx.credentials.is_configured() {
                    self.ctx.narration.narrate(
                        Some(run_id),
                        format!("I remember how to do {:?} on this site; replaying it", step.title),
                    );
                    let mut replay_ok = true;
                    for action in &sequence.actions {
                        if self.handle.is_stop_requested() {
                            interrupted = true;
                            replay_ok = false;
                            break;
                        }
                        let planned = PlannedAction {
                            kind: action.kind,
                            selector: action.selector.clone(),
                            value: action.value_template.clone(),
                            rationale: action.rationale.clone(),
                            expected_outcome: step.expected_outcome.clone(),
                        };
                        let decided = engine
                            .execute_planned(session, step, planned, Vec::new(), Vec::new(), false)
                            .await?;
                        self.handle.actions_taken.fetch_add(1, Ordering::SeqCst);
                        outcome.track(&decided);
                        step_actions.push(StepAction {
                            kind: decided.kind,
                            selector: decided.selector.clone(),
                            value_template: decided.value_template.clone(),
                            rationale: decided.rationale.clone(),
                            success: decided.success,
                        });
                        if !decided.success {
                            // one failure terminates the replay and falls
                            // through to the LLM branch
                            self.ctx.sequences.record_failure(&sequence.id).await?;
                            replay_ok = false;
                            break;
                        }
                    }
                    if replay_ok && !step_actions.is_empty() {
                        from_memory = true;
                        outcome.steps_from_memory += 1;
                        self.ctx.sequences.mark_used(&sequence.id).await?;
                    }
                }
            }

            // LLM branch: bounded sense-decide-act cycles
            if !from_memory && !interrupted {
                for _cycle in 0..budgets.max_cycles_per_step {
                    if self.handle.actions_taken() >= budgets.max_total_actions {
                        break;
                    }
                    if self.handle.is_stop_requested() {
                        interrupted = true;
                        break;
                    }
                    if engine.is_stuck_in_loop(STUCK_LOOP_THRESHOLD) {
                        self.ctx.narration.narrate(
                            Some(run_id),
                            "I am repeating the same action without progress; moving on",
                        );
                        break;
                    }

                    let decided = engine.decide_and_act(session, goal, step).await?;
                    self.handle.actions_taken.fetch_add(1, Ordering::SeqCst);
                    if decided.llm_called {
                        self.llm_calls.fetch_add(1, Ordering::SeqCst);
                    }
                    outcome.track(&decided);
                    step_actions.push(StepAction {
                        kind: decided.kind,
                        selector: decided.selector.clone(),
                        value_template: decided.value_template.clone(),
                        rationale: decided.rationale.clone(),
                        success: decided.success,
                    });

                    match infer_step_verdict(step, &step_actions, engine.last_dom().as_ref()) {
                        StepVerdict::Passed | StepVerdict::FailedIndicator(_) => break,
                        StepVerdict::Undecided => {}
                    }
                }
            }

            let (result, failure_reason) = if interrupted {
                (StepResult::Skipped, Some("run stopped".to_string()))
            } else if from_memory {
                (StepResult::Pass, None)
            } else {
                match infer_step_verdict(step, &step_actions, engine.last_dom().as_ref()) {
                    StepVerdict::Passed => (StepResult::Pass, None),
                    StepVerdict::FailedIndicator(message) => (
                        StepResult::Fail,
                        Some(format!("failure indicator matched: {message}")),
                    ),
                    StepVerdict::Undecided => (
                        StepResult::Fail,
                        Some("step budget exhausted without meeting success criteria".to_string()),
                    ),
                }
            };

            self.handle.steps_completed.fetch_add(1, Ordering::SeqCst);
            outcome.steps.push(StepSummary {
                step_id: step.step_id.clone(),
                title: step.title.clone(),
                result,
                actions: step_actions.len() as u32,
                from_memory,
                failure_reason: failure_reason.clone(),
            });
            self.ctx.narration.emit(
                NarrationType::PlanStepCompleted,
                Some(run_id),
                match result {
                    StepResult::Pass => format!("I completed step {:?}", step.title),
                    StepResult::Fail => format!("Step {:?} failed", step.title),
                    StepResult::Skipped => format!("I skipped step {:?}", step.title),
                },
                Some(json!({
                    "step_id": step.step_id,
                    "result": result,
                    "from_memory": from_memory,
                    "failure_reason": failure_reason,
                })),
            );

            // a passing step with enough substance becomes a cached sequence
            if result == StepResult::Pass {
                let successful: Vec<SequenceAction> = step_actions
                    .iter()
                    .filter(|a| a.success && a.kind != ActionType::NoOp)
                    .map(|a| SequenceAction {
                        kind: a.kind,
                        selector: a.selector.clone(),
                        value_template: a.value_template.clone(),
                        inputs: serde_json::Value::Null,
                        rationale: a.rationale.clone(),
                    })
                    .collect();
                if successful.len() >= 2 {
                    let requires_credentials = successful.iter().any(|a| {
                        a.value_template
                            .as_deref()
                            .is_some_and(|v| self.ctx.credentials.mentions_credentials(v))
                    });
                    self.ctx
                        .sequences
                        .record_success(&step.title, url, successful, run_id, requires_credentials)
                        .await?;
                }
            }

            engine.reset_step_history();
        }

        Ok(outcome)
    }

    fn mark_remaining_skipped(
        &self,
        remaining: &[PlanStep],
        outcome: &mut StepLoopOutcome,
        reason: &str,
    ) {
        for step in remaining {
            outcome.steps.push(StepSummary {
                step_id: step.step_id.clone(),
                title: step.title.clone(),
                result: StepResult::Skipped,
                actions: 0,
                from_memory: false,
                failure_reason: Some(reason.to_string()),
            });
        }
    }

    async fn finalise(
        &self,
        plan: TestPlan,
        outcome: StepLoopOutcome,
        video_path: Option<std::path::PathBuf>,
        duration_ms: u64,
        run_started_at: DateTime<Utc>,
        models_before: u32,
    ) -> anyhow::Result<QaReport> {
        let run_id = self.handle.run_id.clone();
        let goal = &self.options.goal;
        let task_type = improvement::task_type_of(goal);

        // attribute the run record
        let actions = outcome.action_ids.clone();
        let outcomes = outcome.outcome_ids.clone();
        let observations = self
            .ctx
            .store
            .observations
            .list(|o| o.source.run_id.as_deref() == Some(run_id.as_str()))
            .await?;
        let observation_ids: Vec<String> = observations.iter().map(|o| o.id.clone()).collect();
        let models_touched = outcome.models_touched.clone();
        let experiences_touched = outcome.experiences_touched.clone();
        self.ctx
            .store
            .runs
            .update_with(&run_id, move |record| {
                record.actions = actions;
                record.outcomes = outcomes;
                record.observations_used = observation_ids;
                record.models_touched = models_touched;
                record.experiences_touched = experiences_touched;
                record.finished_at = Some(Utc::now());
                Ok(())
            })
            .await?;

        let models_after = self.ctx.store.models.count().await? as u32;
        let models_updated = self
            .ctx
            .store
            .models
            .list(|m| m.last_updated >= run_started_at && m.created_at < run_started_at)
            .await?
            .len() as u32;

        let steps_attempted = outcome
            .steps
            .iter()
            .filter(|s| s.result != StepResult::Skipped)
            .count() as u32;
        let failure_count = outcome.failed_actions;
        let tool_calls = self.handle.actions_taken();

        let prior_same_type = self
            .ctx
            .store
            .metrics
            .list(|m| m.task_type == task_type)
            .await?
            .len();
        let plan_reused = plan.generated_by == GeneratedBy::BuiltIn && prior_same_type > 0;

        let avg_actions_per_step = if steps_attempted > 0 {
            f64::from(tool_calls) / f64::from(steps_attempted)
        } else {
            f64::from(crate::planner::ESTIMATED_ACTIONS_PER_STEP)
        };
        let llm_calls_saved = u32::from(plan_reused)
            + (outcome.steps_from_memory as f64 * avg_actions_per_step).round() as u32;

        let mut result = overall_result(&outcome.steps);
        if self.handle.is_stop_requested() {
            result = RunResult::Partial;
        }

        let mut metrics = RunMetrics::new(&run_id, &task_type);
        metrics.steps_taken = steps_attempted;
        metrics.tool_calls = tool_calls;
        metrics.success = result == RunResult::Pass;
        metrics.experiences_used = outcome.experiences_touched.len() as u32;
        metrics.models_created = models_after.saturating_sub(models_before);
        metrics.models_updated = models_updated;
        metrics.observations_created = observations.len() as u32;
        metrics.failure_count = failure_count;
        metrics.duration_ms = duration_ms;
        metrics.llm_calls_made = self.llm_calls.load(Ordering::SeqCst);
        metrics.llm_calls_saved = llm_calls_saved;
        metrics.plan_reused = plan_reused;
        metrics.steps_from_memory = outcome.steps_from_memory;

        let improvement = self.ctx.improvement.analyze(&metrics).await.ok();
        let metrics = self.ctx.store.metrics.create(metrics).await?;

        let events = self.ctx.narration.history(Some(&run_id));
        let reflection = build_reflection(
            goal,
            &events,
            &outcome.steps,
            &metrics,
            improvement.as_ref(),
        );
        let suggested_next_goal = suggest_next_goal(goal, &outcome.steps);

        info!(
            run = %run_id,
            result = ?result,
            steps = outcome.steps.len(),
            actions = tool_calls,
            "run finalised"
        );

        Ok(QaReport {
            run_id,
            goal: goal.clone(),
            url: self.options.url.clone(),
            result,
            plan,
            steps: outcome.steps,
            reflection,
            memory_savings: MemorySavings {
                llm_calls_saved,
                plan_reused,
                steps_from_memory: outcome.steps_from_memory,
                avg_actions_per_step,
            },
            improvement,
            video_url: video_path.map(|p| {
                format!(
                    "/evidence/videos/{}",
                    p.file_name().map(|f| f.to_string_lossy().into_owned()).unwrap_or_default()
                )
            }),
            suggested_next_goal,
            metrics,
        })
    }

    async fn failure_report(&self, err: &anyhow::Error) -> QaReport {
        let run_id = self.handle.run_id.clone();
        let metrics = RunMetrics::new(&run_id, improvement::task_type_of(&self.options.goal));
        QaReport {
            run_id: run_id.clone(),
            goal: self.options.goal.clone(),
            url: self.options.url.clone(),
            result: RunResult::Fail,
            plan: TestPlan {
                title: format!("Test plan: {}", self.options.goal),
                rationale: "run failed before or during planning".to_string(),
                steps: Vec::new(),
                total_steps: 0,
                estimated_actions: 0,
                generated_by: GeneratedBy::BuiltIn,
            },
            steps: Vec::new(),
            reflection: Reflection {
                what_observed: format!("The run aborted: {err}"),
                what_believed: "No belief changes were recorded.".to_string(),
                what_tried: "The run did not complete its plan.".to_string(),
                what_worked_better: "Nothing; the run aborted.".to_string(),
                what_learned: "Nothing durable.".to_string(),
                improvement_summary: "Not comparable.".to_string(),
                open_questions: vec![format!("What caused: {err}?")],
                next_best_action: "Retry the run once the underlying issue is fixed.".to_string(),
            },
            memory_savings: MemorySavings {
                llm_calls_saved: 0,
                plan_reused: false,
                steps_from_memory: 0,
                avg_actions_per_step: 0.0,
            },
            improvement: None,
            video_url: None,
            suggested_next_goal: "Retry the run".to_string(),
            metrics,
        }
    }
}

#[derive(Default)]
struct StepLoopOutcome {
    steps: Vec<StepSummary>,
    steps_from_memory: u32,
    failed_actions: u32,
    action_ids: Vec<String>,
    outcome_ids: Vec<String>,
    models_touched: Vec<String>,
    experiences_touched: Vec<String>,
}

impl StepLoopOutcome {
    fn track(&mut self, decided: &crate::decision::DecisionOutcome) {
        self.action_ids.push(decided.action.id.clone());
        self.outcome_ids.push(decided.outcome.id.clone());
        if !decided.success {
            self.failed_actions += 1;
        }
        for id in &decided.models_used {
            if !self.models_touched.contains(id) {
                self.models_touched.push(id.clone());
            }
        }
        for id in &decided.experiences_used {
            if !self.experiences_touched.contains(id) {
                self.experiences_touched.push(id.clone());
            }
        }
    }
}

/// Stop a run: flips the stop flag and closes the browser session with the
/// bounded close. The active step is cancelled after the currently
/// executing action returns.
pub async fn stop_run(ctx: &NoemaContext, run_id: &str) -> bool {
    let Some(handle) = ctx.runs.get(run_id) else {
        return false;
    };
    handle.request_stop();
    if let Some(session) = ctx.browsers.get(run_id) {
        if let Err(err) = session.close().await {
            warn!(run = run_id, error = %err, "close during stop failed");
        }
    }
    info!(run = run_id, "stop requested");
    true
}

/// Production rollout driver: a fresh browser session per rollout and a
/// bounded decision loop, sensing wired to a bus with no belief
/// subscribers so optimization can never mutate mental models.
pub struct BrowserRolloutDriver {
    ctx: Arc<NoemaContext>,
}

impl BrowserRolloutDriver {
    pub fn new(ctx: Arc<NoemaContext>) -> Self {
        Self { ctx }
    }
}

#[async_trait]
impl RolloutDriver for BrowserRolloutDriver {
    async fn run_rollout(
        &self,
        task: &str,
        url: &str,
        hint: &str,
        rollout_index: usize,
    ) -> anyhow::Result<RolloutOutcome> {
        let rollout_id = format!("rollout-{rollout_index}-{}", crate::store::new_id());
        let started = Instant::now();

        let session = self
            .ctx
            .sessions
            .create(&rollout_id)
            .await
            .map_err(|e| anyhow::anyhow!("rollout session: {e}"))?;

        // quiet sensing: observations are recorded, beliefs are untouched
        let sensing = Arc::new(Sensing::new(
            self.ctx.store.clone(),
            Arc::new(ObservationBus::new()),
            None,
        ));
        let engine = DecisionEngine::new(
            &rollout_id,
            self.ctx.store.clone(),
            self.ctx.llm.clone(),
            self.ctx.narration.clone(),
            sensing,
            self.ctx.credentials.clone(),
        );

        let step = PlanStep {
            step_id: format!("rollout_{rollout_index}"),
            title: task.to_string(),
            description: format!("{task}. Hint: {hint}"),
            test_steps: Vec::new(),
            expected_results: Vec::new(),
            action_hint: ActionType::NavigateToUrl,
            expected_outcome: "the goal is verifiably reached".to_string(),
            failure_indicator: "error".to_string(),
            priority: crate::planner::StepPriority::Critical,
        };

        // first action is always the navigation, then bounded free cycles
        let nav = engine
            .execute_planned(
                &session,
                &step,
                PlannedAction {
                    kind: ActionType::NavigateToUrl,
                    selector: None,
                    value: Some(url.to_string()),
                    rationale: "open the target site for this rollout".to_string(),
                    expected_outcome: "page loads".to_string(),
                },
                Vec::new(),
                Vec::new(),
                false,
            )
            .await?;

        let mut actions = 1usize;
        let mut screenshots = nav.outcome.artifacts.screenshots.len();
        let mut log_chars: usize = nav.outcome.artifacts.logs.iter().map(String::len).sum();
        let mut network_errors = nav.outcome.artifacts.network_errors.len();
        let mut last_error = nav.outcome.error_message.clone();
        let mut any_success = nav.success;

        if nav.success {
            for _ in 0..ROLLOUT_MAX_CYCLES {
                if engine.is_stuck_in_loop(STUCK_LOOP_THRESHOLD) {
                    break;
                }
                let decided = engine.decide_and_act(&session, task, &step).await?;
                actions += 1;
                screenshots += decided.outcome.artifacts.screenshots.len();
                log_chars += decided
                    .outcome
                    .artifacts
                    .logs
                    .iter()
                    .map(String::len)
                    .sum::<usize>();
                network_errors += decided.outcome.artifacts.network_errors.len();
                if decided.success && decided.kind != ActionType::NoOp {
                    any_success = true;
                } else if let Some(error) = &decided.outcome.error_message {
                    last_error = Some(error.clone());
                }
            }
        }

        let dom_clean = engine
            .last_dom()
            .map(|dom| dom.error_messages.is_empty())
            .unwrap_or(false);
        let success = any_success && dom_clean;

        let observations = self
            .ctx
            .store
            .observations
            .list(|o| o.source.run_id.as_deref() == Some(rollout_id.as_str()))
            .await?
            .len();

        let _ = session.close().await;

        Ok(RolloutOutcome {
            hint: hint.to_string(),
            success,
            actions,
            screenshots,
            log_chars,
            network_errors,
            observations,
            duration_ms: started.elapsed().as_millis() as u64,
            error_message: if success { None } else { last_error },
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::browser::DomSnapshot;

    fn plan_step(hint: ActionType) -> PlanStep {
        PlanStep {
            step_id: "step_1".into(),
            title: "Login with valid credentials".into(),
            description: String::new(),
            test_steps: vec![],
            expected_results: vec!["inventory".into()],
            action_hint: hint,
            expected_outcome: String::new(),
            failure_indicator: "error message visible".into(),
            priority: crate::planner::StepPriority::Critical,
        }
    }

    fn action(kind: ActionType, success: bool) -> StepAction {
        StepAction {
            kind,
            selector: None,
            value_template: None,
            rationale: String::new(),
            success,
        }
    }

    #[test]
    fn url_validation_rejects_concatenated_urls() {
        let err = validate_target_url("https://a.comhttps://b.com").unwrap_err();
        assert!(err.contains("multiple URLs concatenated"));
        assert!(validate_target_url("https://www.saucedemo.com").is_ok());
        assert!(validate_target_url("ftp://example.com").is_err());
        assert!(validate_target_url("   ").is_err());
    }

    #[test]
    fn hint_success_passes_the_step() {
        let step = plan_step(ActionType::FillInput);
        let actions = vec![action(ActionType::FillInput, true)];
        assert!(matches!(
            infer_step_verdict(&step, &actions, None),
            StepVerdict::Passed
        ));
    }

    #[test]
    fn dom_sentinel_passes_case_insensitively() {
        let step = plan_step(ActionType::ClickElement);
        let actions = vec![action(ActionType::FillInput, false)];
        let dom = DomSnapshot {
            title: "Swag Labs".into(),
            body_text_preview: "INVENTORY list with products".into(),
            ..Default::default()
        };
        assert!(matches!(
            infer_step_verdict(&step, &actions, Some(&dom)),
            StepVerdict::Passed
        ));
    }

    #[test]
    fn failure_indicator_beats_success_criteria() {
        let step = plan_step(ActionType::FillInput);
        let actions = vec![action(ActionType::FillInput, true)];
        let dom = DomSnapshot {
            error_messages: vec!["Error message visible: username required".into()],
            ..Default::default()
        };
        assert!(matches!(
            infer_step_verdict(&step, &actions, Some(&dom)),
            StepVerdict::FailedIndicator(_)
        ));
    }

    #[test]
    fn inference_is_idempotent_for_a_given_dom() {
        let step = plan_step(ActionType::ClickElement);
        let actions = vec![action(ActionType::ClickElement, true)];
        let dom = DomSnapshot::default();
        for _ in 0..3 {
            assert!(matches!(
                infer_step_verdict(&step, &actions, Some(&dom)),
                StepVerdict::Passed
            ));
        }
    }

    #[test]
    fn no_success_and_no_sentinel_is_undecided() {
        let step = plan_step(ActionType::ClickElement);
        let actions = vec![action(ActionType::NoOp, true)];
        let dom = DomSnapshot::default();
        assert!(matches!(
            infer_step_verdict(&step, &actions, Some(&dom)),
            StepVerdict::Undecided
        ));
    }
}
