//! Post-run reflection and the QA report.
//!
//! Reflection is deterministic: it is assembled from the run's narration
//! timeline, step results, and metrics. No LLM is involved, so a report is
//! always produced even during a full provider outage.

use serde::{Deserialize, Serialize};

use super::improvement::ImprovementSummary;
use crate::narration::{NarrationEvent, NarrationType};
use crate::planner::TestPlan;
use crate::store::RunMetrics;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunResult {
    Pass,
    Fail,
    Partial,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepResult {
    Pass,
    Fail,
    Skipped,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepSummary {
    pub step_id: String,
    pub title: String,
    pub result: StepResult,
    pub actions: u32,
    pub from_memory: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure_reason: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemorySavings {
    pub llm_calls_saved: u32,
    pub plan_reused: bool,
    pub steps_from_memory: u32,
    pub avg_actions_per_step: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Reflection {
    pub what_observed: String,
    pub what_believed: String,
    pub what_tried: String,
    pub what_worked_better: String,
    pub what_learned: String,
    pub improvement_summary: String,
    pub open_questions: Vec<String>,
    pub next_best_action: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QaReport {
    pub run_id: String,
    pub goal: String,
    pub url: String,
    pub result: RunResult,
    pub plan: TestPlan,
    pub steps: Vec<StepSummary>,
    pub reflection: Reflection,
    pub memory_savings: MemorySavings,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub improvement: Option<ImprovementSummary>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub video_url: Option<String>,
    pub suggested_next_goal: String,
    pub metrics: RunMetrics,
}

/// Overall result from the step results: all pass -> pass, nothing passed
/// -> fail, otherwise partial.
pub fn overall_result(steps: &[StepSummary]) -> RunResult {
    if steps.is_empty() {
        return RunResult::Fail;
    }
    let passed = steps.iter().filter(|s| s.result == StepResult::Pass).count();
    if passed == steps.len() {
        RunResult::Pass
    } else if passed == 0 {
        RunResult::Fail
    } else {
        RunResult::Partial
    }
}

pub fn build_reflection(
    goal: &str,
    events: &[NarrationEvent],
    steps: &[StepSummary],
    metrics: &RunMetrics,
    improvement: Option<&ImprovementSummary>,
) -> Reflection {
    let observed = events
        .iter()
        .filter(|e| e.kind == NarrationType::EvidenceCaptured)
        .count();
    let beliefs_formed = events
        .iter()
        .filter(|e| e.kind == NarrationType::BeliefFormed)
        .count();
    let failures: Vec<&StepSummary> = steps
        .iter()
        .filter(|s| s.result == StepResult::Fail)
        .collect();
    let from_memory = steps.iter().filter(|s| s.from_memory).count();

    let what_observed = format!(
        "I created {} observations and captured {} pieces of evidence across {} steps.",
        metrics.observations_created, observed, metrics.steps_taken
    );
    let what_believed = if beliefs_formed == 0 {
        "My mental models of this application did not change during this run.".to_string()
    } else {
        format!(
            "I formed or revised {} beliefs about this application ({} created, {} updated).",
            beliefs_formed, metrics.models_created, metrics.models_updated
        )
    };
    let what_tried = format!(
        "I executed {} browser actions over {} plan steps, {} of which I replayed from memory.",
        metrics.tool_calls, metrics.steps_taken, from_memory
    );
    let what_worked_better = if from_memory > 0 {
        format!(
            "Replaying remembered action sequences saved roughly {} decision calls.",
            metrics.llm_calls_saved
        )
    } else if failures.is_empty() {
        "Working the plan in priority order completed every step without detours.".to_string()
    } else {
        "Nothing clearly outperformed the baseline approach this run.".to_string()
    };
    let what_learned = if metrics.experiences_added > 0 {
        format!("I kept {} new heuristics for future runs.", metrics.experiences_added)
    } else {
        "No new heuristics were durable enough to keep.".to_string()
    };
    let improvement_summary = match improvement {
        Some(summary) if summary.prior_runs > 0 => format!(
            "Against {} prior {} runs I {}.",
            summary.prior_runs,
            summary.task_type,
            if summary.has_improved { "improved" } else { "did not improve" }
        ),
        _ => "I have no prior runs of this task type to compare against.".to_string(),
    };

    let open_questions = failures
        .iter()
        .map(|s| {
            format!(
                "Why did step {:?} fail{}?",
                s.title,
                s.failure_reason
                    .as_deref()
                    .map(|r| format!(" ({r})"))
                    .unwrap_or_default()
            )
        })
        .collect();

    let next_best_action = if let Some(first_failure) = failures.first() {
        format!("Re-test the failed step {:?} in isolation.", first_failure.title)
    } else if from_memory == 0 && metrics.steps_taken > 0 {
        "Repeat this goal to let the sequence cache take over the routine steps.".to_string()
    } else {
        format!("Extend coverage beyond {goal:?} to an adjacent flow.")
    };

    Reflection {
        what_observed,
        what_believed,
        what_tried,
        what_worked_better,
        what_learned,
        improvement_summary,
        open_questions,
        next_best_action,
    }
}

/// Deterministic follow-up suggestion for the report.
pub fn suggest_next_goal(goal: &str, steps: &[StepSummary]) -> String {
    if let Some(failed) = steps.iter().find(|s| s.result == StepResult::Fail) {
        return format!("Investigate and re-test: {}", failed.title);
    }
    let lower = goal.to_lowercase();
    for (keyword, suggestion) in [
        ("login", "Test the checkout flow end to end"),
        ("cart", "Test checkout with an empty cart and with invalid payment data"),
        ("checkout", "Test order history and cancellation"),
        ("form", "Test the same form with boundary-length inputs"),
    ] {
        if lower.contains(keyword) {
            return suggestion.to_string();
        }
    }
    "Repeat this goal to reinforce the learned action sequences".to_string()
}
