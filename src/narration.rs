//! The narration bus: a monotonic, in-memory event stream with per-run
//! filtering, bounded history, and first-person formatting.
//!
//! Emission is synchronous. Live subscribers hang off a broadcast channel,
//! so a slow or dropped listener can never stall the publisher. Every
//! message is passed through the credential masker before it is stored or
//! fanned out; raw credential values must never appear in narration.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::debug;

/// Placeholder substituted for any secret value in narrated text.
pub const MASK_PLACEHOLDER: &str = "********";

/// Bounded history length; comfortably above the required 500.
pub const HISTORY_CAPACITY: usize = 1000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NarrationType {
    System,
    Narration,
    ActionStarted,
    ActionCompleted,
    EvidenceCaptured,
    BeliefFormed,
    ExperienceLearned,
    PlanGenerated,
    PlanStepStarted,
    PlanStepCompleted,
    RunStarted,
    RunCompleted,
    Error,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NarrationEvent {
    pub event_id: String,
    pub seq: u64,
    #[serde(rename = "type")]
    pub kind: NarrationType,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
    pub timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub run_id: Option<String>,
}

/// Replaces every known secret with a fixed placeholder. Built once from
/// config (`TEST_USERNAME`, `TEST_PASSWORD`, and all string values in
/// `TEST_CREDENTIALS_JSON`).
#[derive(Debug, Clone, Default)]
pub struct CredentialMasker {
    secrets: Vec<String>,
}

impl CredentialMasker {
    pub fn new(mut secrets: Vec<String>) -> Self {
        secrets.retain(|s| s.len() >= 2);
        // longest first, so overlapping secrets mask fully
        secrets.sort_by_key(|s| std::cmp::Reverse(s.len()));
        Self { secrets }
    }

    pub fn mask(&self, text: &str) -> String {
        let mut masked = text.to_string();
        for secret in &self.secrets {
            if masked.contains(secret.as_str()) {
                masked = masked.replace(secret.as_str(), MASK_PLACEHOLDER);
            }
        }
        masked
    }

    pub fn mask_value(&self, value: &serde_json::Value) -> serde_json::Value {
        match value {
            serde_json::Value::String(s) => serde_json::Value::String(self.mask(s)),
            serde_json::Value::Array(items) => {
                serde_json::Value::Array(items.iter().map(|v| self.mask_value(v)).collect())
            }
            serde_json::Value::Object(map) => serde_json::Value::Object(
                map.iter()
                    .map(|(k, v)| (k.clone(), self.mask_value(v)))
                    .collect(),
            ),
            other => other.clone(),
        }
    }
}

pub struct NarrationBus {
    seq: AtomicU64,
    history: RwLock<VecDeque<NarrationEvent>>,
    tx: broadcast::Sender<NarrationEvent>,
    masker: CredentialMasker,
}

impl NarrationBus {
    pub fn new(masker: CredentialMasker) -> Self {
        let (tx, _) = broadcast::channel(256);
        Self {
            seq: AtomicU64::new(0),
            history: RwLock::new(VecDeque::with_capacity(HISTORY_CAPACITY)),
            tx,
            masker,
        }
    }

    /// Emit one event. Masks the message and data, stamps a strictly
    /// monotonic sequence number, appends to the bounded history, and fans
    /// out to live subscribers. Never fails: a bus with no listeners is
    /// normal.
    pub fn emit(
        &self,
        kind: NarrationType,
        run_id: Option<&str>,
        message: impl Into<String>,
        data: Option<serde_json::Value>,
    ) -> NarrationEvent {
        let event = NarrationEvent {
            event_id: uuid::Uuid::new_v4().to_string(),
            seq: self.seq.fetch_add(1, Ordering::SeqCst) + 1,
            kind,
            message: self.masker.mask(&message.into()),
            data: data.map(|d| self.masker.mask_value(&d)),
            timestamp: Utc::now(),
            run_id: run_id.map(str::to_string),
        };

        {
            let mut history = self.history.write();
            if history.len() >= HISTORY_CAPACITY {
                history.pop_front();
            }
            history.push_back(event.clone());
        }

        // send() only errors when no receiver exists, which is fine
        let _ = self.tx.send(event.clone());
        debug!(seq = event.seq, kind = ?event.kind, "narrated");
        event
    }

    /// Convenience wrapper for plain first-person narration.
    pub fn narrate(&self, run_id: Option<&str>, message: impl Into<String>) -> NarrationEvent {
        self.emit(NarrationType::Narration, run_id, message, None)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<NarrationEvent> {
        self.tx.subscribe()
    }

    pub fn history(&self, run_id: Option<&str>) -> Vec<NarrationEvent> {
        let history = self.history.read();
        history
            .iter()
            .filter(|event| match run_id {
                Some(id) => event.run_id.as_deref() == Some(id),
                None => true,
            })
            .cloned()
            .collect()
    }

    /// Events with `seq > since`, optionally filtered to one run.
    pub fn events_since(&self, since: u64, run_id: Option<&str>) -> Vec<NarrationEvent> {
        let history = self.history.read();
        history
            .iter()
            .filter(|event| event.seq > since)
            .filter(|event| match run_id {
                Some(id) => event.run_id.as_deref() == Some(id),
                None => true,
            })
            .cloned()
            .collect()
    }

    pub fn current_seq(&self) -> u64 {
        self.seq.load(Ordering::SeqCst)
    }

    /// Drop a finished run's events from the bounded history.
    pub fn cleanup_run(&self, run_id: &str) {
        let mut history = self.history.write();
        history.retain(|event| event.run_id.as_deref() != Some(run_id));
    }

    pub fn masker(&self) -> &CredentialMasker {
        &self.masker
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn seq_is_strictly_monotonic() {
        let bus = NarrationBus::new(CredentialMasker::default());
        let first = bus.narrate(None, "I am starting the run");
        let second = bus.narrate(None, "I am opening the page");
        assert!(second.seq > first.seq);
        assert_eq!(bus.events_since(first.seq, None).len(), 1);
    }

    #[test]
    fn credentials_are_masked_in_message_and_data() {
        let masker = CredentialMasker::new(vec!["standard_user".into(), "secret_sauce".into()]);
        let bus = NarrationBus::new(masker);
        let event = bus.emit(
            NarrationType::ActionStarted,
            Some("run-1"),
            "I am typing standard_user into the username field",
            Some(serde_json::json!({"value": "secret_sauce"})),
        );
        assert!(!event.message.contains("standard_user"));
        assert!(event.message.contains(MASK_PLACEHOLDER));
        assert_eq!(
            event.data.unwrap()["value"],
            serde_json::json!(MASK_PLACEHOLDER)
        );
    }

    #[test]
    fn history_is_filtered_by_run_and_bounded() {
        let bus = NarrationBus::new(CredentialMasker::default());
        for i in 0..(HISTORY_CAPACITY + 10) {
            let run = if i % 2 == 0 { "even" } else { "odd" };
            bus.narrate(Some(run), format!("event {i}"));
        }
        assert!(bus.history(None).len() <= HISTORY_CAPACITY);
        assert!(bus.history(Some("even")).iter().all(|e| e.run_id.as_deref() == Some("even")));

        bus.cleanup_run("even");
        assert!(bus.history(Some("even")).is_empty());
        assert!(!bus.history(Some("odd")).is_empty());
    }

    #[tokio::test]
    async fn subscribers_receive_live_events() {
        let bus = NarrationBus::new(CredentialMasker::default());
        let mut rx = bus.subscribe();
        bus.narrate(Some("run-9"), "I captured a screenshot");
        let event = rx.recv().await.unwrap();
        assert_eq!(event.run_id.as_deref(), Some("run-9"));
    }
}
