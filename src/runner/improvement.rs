//! Improvement analysis: compares a finished run against prior runs of the
//! same task type.

use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::store::{RunMetrics, StoreContext};

/// Relative change below this fraction counts as "same".
pub const IMPROVEMENT_THRESHOLD: f64 = 0.10;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Verdict {
    Improved,
    Same,
    Regressed,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricDelta {
    pub name: String,
    pub current: f64,
    pub prior_mean: f64,
    pub relative_delta: f64,
    pub verdict: Verdict,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImprovementSummary {
    pub task_type: String,
    pub prior_runs: usize,
    pub metrics: Vec<MetricDelta>,
    pub has_improved: bool,
}

/// First keyword-extracted token of the goal. Runs compare only against
/// prior runs sharing this token.
pub fn task_type_of(goal: &str) -> String {
    crate::sequences::extract_keywords(goal)
        .into_iter()
        .next()
        .unwrap_or_else(|| "general".to_string())
}

pub struct ImprovementAnalyzer {
    store: Arc<StoreContext>,
}

impl ImprovementAnalyzer {
    pub fn new(store: Arc<StoreContext>) -> Self {
        Self { store }
    }

    pub async fn analyze(&self, current: &RunMetrics) -> anyhow::Result<ImprovementSummary> {
        let priors = self
            .store
            .metrics
            .list(|m| m.task_type == current.task_type && m.run_id != current.run_id)
            .await?;

        let mut metrics = Vec::new();
        if !priors.is_empty() {
            metrics.push(delta(
                "steps_taken",
                f64::from(current.steps_taken),
                mean(&priors, |m| f64::from(m.steps_taken)),
                true,
            ));
            metrics.push(delta(
                "failure_count",
                f64::from(current.failure_count),
                mean(&priors, |m| f64::from(m.failure_count)),
                true,
            ));
            metrics.push(delta(
                "duration_ms",
                current.duration_ms as f64,
                mean(&priors, |m| m.duration_ms as f64),
                true,
            ));
            metrics.push(delta(
                "experiences_used",
                f64::from(current.experiences_used),
                mean(&priors, |m| f64::from(m.experiences_used)),
                false,
            ));
        }

        let improved = metrics.iter().filter(|m| m.verdict == Verdict::Improved).count();
        let regressed = metrics.iter().filter(|m| m.verdict == Verdict::Regressed).count();

        Ok(ImprovementSummary {
            task_type: current.task_type.clone(),
            prior_runs: priors.len(),
            metrics,
            has_improved: improved > regressed,
        })
    }
}

fn mean(priors: &[RunMetrics], f: impl Fn(&RunMetrics) -> f64) -> f64 {
    if priors.is_empty() {
        return 0.0;
    }
    priors.iter().map(f).sum::<f64>() / priors.len() as f64
}

/// `lower_is_better` holds for cost-like metrics (steps, failures,
/// duration); experiences_used improves when it rises.
fn delta(name: &str, current: f64, prior_mean: f64, lower_is_better: bool) -> MetricDelta {
    let relative_delta = if prior_mean.abs() < f64::EPSILON {
        if current.abs() < f64::EPSILON {
            0.0
        } else if lower_is_better {
            1.0
        } else {
            -1.0
        }
    } else {
        (current - prior_mean) / prior_mean
    };

    let signed = if lower_is_better {
        relative_delta
    } else {
        -relative_delta
    };
    let verdict = if signed <= -IMPROVEMENT_THRESHOLD {
        Verdict::Improved
    } else if signed >= IMPROVEMENT_THRESHOLD {
        Verdict::Regressed
    } else {
        Verdict::Same
    };

    MetricDelta {
        name: name.to_string(),
        current,
        prior_mean,
        relative_delta,
        verdict,
    }
}
