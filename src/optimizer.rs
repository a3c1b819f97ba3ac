//! Experience optimizer: training-free K-rollout learning.
//!
//! After a run, K rollouts of the same task execute sequentially against
//! the same belief context, each with a different deterministic prompt
//! hint. Outcomes are scored purely from observable signals, ranked, and
//! when a clear winner emerges, advisory experiences are extracted.
//!
//! This loop learns what *works*; the belief engine learns what is *true*.
//! The optimizer never touches mental models, and nothing here may call
//! into the belief engine.

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{info, warn};

use crate::llm::{extract_json_block, LlmClient, LlmRequest};
use crate::narration::{NarrationBus, NarrationType};
use crate::store::{Experience, StoreContext, EXPERIENCE_MAX_WORDS};

/// Default rollouts per optimization.
pub const DEFAULT_ROLLOUTS: usize = 2;
/// Minimum score gap between the top two rollouts for a clear winner.
pub const DEFAULT_MIN_WIN_MARGIN: f64 = 0.15;

/// Deterministic hints; rollout `i` gets `HINTS[i % HINTS.len()]`. The
/// hint varies the prompt, never the belief state.
pub const HINTS: &[&str] = &[
    "Take the most direct path to the goal and avoid exploratory clicks.",
    "Verify every state change with an explicit visibility check before moving on.",
    "Prefer stable data-test or id selectors over text-based matching.",
    "Wait for network idle after every form submission before asserting results.",
];

/// Observable signals from one rollout.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RolloutOutcome {
    pub hint: String,
    pub success: bool,
    pub actions: usize,
    pub screenshots: usize,
    pub log_chars: usize,
    pub network_errors: usize,
    pub observations: usize,
    pub duration_ms: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RolloutScore {
    pub success: f64,
    pub evidence_clarity: f64,
    pub error_specificity: f64,
    pub ambiguity_reduction: f64,
    pub signal_strength: f64,
    pub overall: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OptimizationReport {
    pub run_id: String,
    pub rollouts: Vec<RolloutOutcome>,
    pub scores: Vec<RolloutScore>,
    pub winner_index: usize,
    pub win_margin: f64,
    pub has_clear_winner: bool,
    pub experiences_added: Vec<String>,
}

/// Seam for executing one rollout. The production driver spins up a fresh
/// browser session and runs a bounded decision loop; tests script outcomes.
#[async_trait]
pub trait RolloutDriver: Send + Sync {
    async fn run_rollout(
        &self,
        task: &str,
        url: &str,
        hint: &str,
        rollout_index: usize,
    ) -> anyhow::Result<RolloutOutcome>;
}

/// Evaluation criteria weights.
const W_SUCCESS: f64 = 0.30;
const W_EVIDENCE: f64 = 0.20;
const W_ERROR: f64 = 0.20;
const W_AMBIGUITY: f64 = 0.15;
const W_SIGNAL: f64 = 0.15;

const ERROR_PATTERNS: &[&str] = &[
    "timeout",
    "not found",
    "element not visible",
    "navigation failed",
    "selector invalid",
    "connection refused",
    "net::ERR",
];

pub fn score_rollout(outcome: &RolloutOutcome) -> RolloutScore {
    let success = if outcome.success { 1.0 } else { 0.0 };

    let mut evidence_clarity = 0.0;
    if outcome.screenshots > 0 {
        evidence_clarity += 0.4;
    }
    if outcome.log_chars > 0 {
        evidence_clarity += 0.3;
    }
    if outcome.log_chars > 500 {
        evidence_clarity += 0.2;
    }
    if outcome.network_errors > 0 {
        evidence_clarity += 0.1;
    }

    let error_specificity = if outcome.success {
        0.8
    } else {
        let message = outcome.error_message.as_deref().unwrap_or_default();
        let lower = message.to_lowercase();
        let mut score: f64 = 0.3;
        for pattern in ERROR_PATTERNS {
            if lower.contains(&pattern.to_lowercase()) {
                score += 0.15;
            }
        }
        if message.len() > 30 {
            score += 0.1;
        }
        if message.len() > 80 {
            score += 0.1;
        }
        score.min(1.0)
    };

    let mut ambiguity_reduction = 0.3 + (outcome.observations as f64 * 0.05).min(0.4);
    if outcome.success {
        ambiguity_reduction += 0.3;
    } else if outcome.error_message.is_some() {
        ambiguity_reduction += 0.2;
    }
    let ambiguity_reduction = ambiguity_reduction.min(1.0);

    let mut signal_strength: f64 = 0.3;
    if outcome.success {
        signal_strength += 0.4;
    }
    if outcome.duration_ms < 10_000 {
        signal_strength += 0.2;
    } else if outcome.duration_ms < 30_000 {
        signal_strength += 0.1;
    }
    if outcome.screenshots >= 2 {
        signal_strength += 0.1;
    }
    let signal_strength = signal_strength.min(1.0);

    let overall = W_SUCCESS * success
        + W_EVIDENCE * evidence_clarity
        + W_ERROR * error_specificity
        + W_AMBIGUITY * ambiguity_reduction
        + W_SIGNAL * signal_strength;

    RolloutScore {
        success,
        evidence_clarity,
        error_specificity,
        ambiguity_reduction,
        signal_strength,
        overall,
    }
}

pub struct ExperienceOptimizer {
    store: Arc<StoreContext>,
    llm: Arc<LlmClient>,
    narration: Arc<NarrationBus>,
    rollouts: usize,
    min_win_margin: f64,
}

impl ExperienceOptimizer {
    pub fn new(store: Arc<StoreContext>, llm: Arc<LlmClient>, narration: Arc<NarrationBus>) -> Self {
        Self {
            store,
            llm,
            narration,
            rollouts: DEFAULT_ROLLOUTS,
            min_win_margin: DEFAULT_MIN_WIN_MARGIN,
        }
    }

    pub fn with_rollouts(mut self, k: usize) -> Self {
        self.rollouts = k.max(1);
        self
    }

    /// Run the optimization for a finished run. Rollouts execute strictly
    /// sequentially; one failed rollout is recorded as a failed outcome,
    /// not an abort.
    pub async fn optimize(
        &self,
        run_id: &str,
        task: &str,
        url: &str,
        driver: &dyn RolloutDriver,
    ) -> anyhow::Result<OptimizationReport> {
        info!(run = run_id, k = self.rollouts, "starting experience optimization");
        self.narration.narrate(
            Some(run_id),
            format!("I am replaying this task {} more times to learn what works best", self.rollouts),
        );

        let mut rollouts = Vec::with_capacity(self.rollouts);
        for index in 0..self.rollouts {
            let hint = HINTS[index % HINTS.len()];
            let outcome = match driver.run_rollout(task, url, hint, index).await {
                Ok(outcome) => outcome,
                Err(err) => {
                    warn!(error = %err, rollout = index, "rollout failed");
                    RolloutOutcome {
                        hint: hint.to_string(),
                        success: false,
                        error_message: Some(err.to_string()),
                        ..Default::default()
                    }
                }
            };
            rollouts.push(outcome);
        }

        let scores: Vec<RolloutScore> = rollouts.iter().map(score_rollout).collect();
        let mut ranked: Vec<usize> = (0..scores.len()).collect();
        ranked.sort_by(|&a, &b| {
            scores[b]
                .overall
                .partial_cmp(&scores[a].overall)
                .unwrap_or(std::cmp::Ordering::Equal)
        });

        let winner_index = ranked[0];
        let (win_margin, has_clear_winner) = if ranked.len() == 1 {
            // a single rollout trivially wins
            (1.0, true)
        } else {
            let margin = scores[ranked[0]].overall - scores[ranked[1]].overall;
            (margin, margin >= self.min_win_margin)
        };

        let experiences_added = if has_clear_winner {
            self.extract_experiences(run_id, task, &rollouts, &scores, winner_index)
                .await?
        } else {
            info!(win_margin, "no clear winner; skipping experience extraction");
            Vec::new()
        };

        self.narration.narrate(
            Some(run_id),
            format!(
                "I finished deep learning: {} rollouts, {} new heuristics",
                rollouts.len(),
                experiences_added.len()
            ),
        );

        Ok(OptimizationReport {
            run_id: run_id.to_string(),
            rollouts,
            scores,
            winner_index,
            win_margin,
            has_clear_winner,
            experiences_added,
        })
    }

    async fn extract_experiences(
        &self,
        run_id: &str,
        task: &str,
        rollouts: &[RolloutOutcome],
        scores: &[RolloutScore],
        winner_index: usize,
    ) -> anyhow::Result<Vec<String>> {
        let comparison = rollouts
            .iter()
            .zip(scores)
            .enumerate()
            .map(|(i, (rollout, score))| {
                format!(
                    "rollout {i}{}: hint={:?} success={} actions={} duration_ms={} score={:.2} error={:?}",
                    if i == winner_index { " (winner)" } else { "" },
                    rollout.hint,
                    rollout.success,
                    rollout.actions,
                    rollout.duration_ms,
                    score.overall,
                    rollout.error_message,
                )
            })
            .collect::<Vec<_>>()
            .join("\n");

        let prompt = format!(
            "I compared several attempts at the same browser QA task.\nTask: {task}\n\n\
{comparison}\n\n\
Extract up to 3 advisory heuristics explaining what made the winner work \
better. Each statement must be at most {EXPERIENCE_MAX_WORDS} words, \
actionable, and free of run-specific details. Respond with a JSON object: \
{{\"experiences\":[{{\"statement\",\"scope\":[\"keyword\"]}}]}}."
        );

        let response = match self.llm.generate(&LlmRequest::json(prompt)).await {
            Ok(response) => response,
            Err(err) => {
                warn!(error = %err, "experience extraction LLM failed; none extracted");
                return Ok(Vec::new());
            }
        };
        let parsed: ExtractedExperiences =
            match serde_json::from_str(extract_json_block(&response.text)) {
                Ok(parsed) => parsed,
                Err(err) => {
                    warn!(error = %err, "experience extraction response malformed");
                    return Ok(Vec::new());
                }
            };

        let existing: Vec<String> = self
            .store
            .experiences
            .list_all()
            .await?
            .iter()
            .map(|e| normalise_statement(&e.statement))
            .collect();

        let mut added = Vec::new();
        let mut seen_batch = Vec::new();
        for draft in parsed.experiences {
            let statement = draft.statement.trim().to_string();
            if statement.is_empty()
                || statement.split_whitespace().count() > EXPERIENCE_MAX_WORDS
            {
                continue;
            }
            let normalised = normalise_statement(&statement);
            if existing.contains(&normalised) || seen_batch.contains(&normalised) {
                continue;
            }
            seen_batch.push(normalised);

            let mut experience = Experience::new(statement.clone(), draft.scope, 0.7);
            experience.source_runs = vec![run_id.to_string()];
            let created = self.store.experiences.create(experience).await?;

            self.narration.emit(
                NarrationType::ExperienceLearned,
                Some(run_id),
                format!("I learned a new heuristic: {statement}"),
                Some(json!({ "experience_id": created.id })),
            );
            added.push(created.id);
        }
        Ok(added)
    }
}

fn normalise_statement(statement: &str) -> String {
    statement
        .to_lowercase()
        .chars()
        .filter(|c| c.is_alphanumeric() || c.is_whitespace())
        .collect::<String>()
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
}

#[derive(Debug, Deserialize)]
struct ExtractedExperiences {
    #[serde(default)]
    experiences: Vec<ExperienceDraft>,
}

#[derive(Debug, Deserialize)]
struct ExperienceDraft {
    statement: String,
    #[serde(default)]
    scope: Vec<String>,
}
