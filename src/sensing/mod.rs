//! Sensing: turns raw text, logs, and screenshots into validated
//! Observations.
//!
//! The pipeline is strictly ordered within one `ingest`: chunk, score
//! salience, create the observation, publish it on the observation bus.
//! Bus callbacks run synchronously in subscription order; each handler
//! spawns its own task, so one failing consumer cannot starve the rest.

use std::sync::Arc;

use regex::Regex;
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tracing::debug;

use crate::semantic::CogneeClient;
use crate::store::{Observation, ObservationSource, ObservationType, StoreContext};

/// Maximum characters per text chunk before the chunker splits.
pub const MAX_CHUNK_CHARS: usize = 1200;

#[derive(Debug, Clone)]
pub enum SensoryInput {
    Text {
        content: String,
        source: String,
    },
    Log {
        content: String,
        source: String,
    },
    Screenshot {
        /// Path of the stored image, when already on disk.
        file_path: Option<String>,
        /// Raw image payload, when handed over the wire.
        base64: Option<String>,
        /// Vision description, when one is available.
        description: Option<String>,
        source: String,
    },
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct IngestReceipt {
    pub observation_ids: Vec<String>,
    pub evidence_ids: Vec<String>,
    pub chunk_count: usize,
}

type ObservationHandler = Arc<dyn Fn(Observation) -> tokio::task::JoinHandle<()> + Send + Sync>;

struct ObservationSubscriber {
    id: String,
    name: String,
    handler: ObservationHandler,
}

/// In-process fan-out for freshly created observations. Separate from the
/// narration bus on purpose: narration is for humans, this is for engines.
#[derive(Default)]
pub struct ObservationBus {
    subscribers: RwLock<Vec<ObservationSubscriber>>,
}

impl ObservationBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn subscribe(&self, name: &str, handler: ObservationHandler) -> String {
        let id = uuid::Uuid::new_v4().to_string();
        self.subscribers.write().await.push(ObservationSubscriber {
            id: id.clone(),
            name: name.to_string(),
            handler,
        });
        debug!(subscriber = name, "observation bus subscription added");
        id
    }

    pub async fn unsubscribe(&self, subscription_id: &str) {
        self.subscribers
            .write()
            .await
            .retain(|s| s.id != subscription_id);
    }

    pub async fn publish(&self, observation: &Observation) {
        let subscribers = self.subscribers.read().await;
        for subscriber in subscribers.iter() {
            // handlers run in their own tasks; a panicking consumer is
            // isolated from the publisher and from later subscribers
            let _handle = (subscriber.handler)(observation.clone());
        }
    }

    pub async fn subscriber_count(&self) -> usize {
        self.subscribers.read().await.len()
    }
}

pub struct Sensing {
    store: Arc<StoreContext>,
    bus: Arc<ObservationBus>,
    semantic: Option<Arc<CogneeClient>>,
}

impl Sensing {
    pub fn new(
        store: Arc<StoreContext>,
        bus: Arc<ObservationBus>,
        semantic: Option<Arc<CogneeClient>>,
    ) -> Self {
        Self {
            store,
            bus,
            semantic,
        }
    }

    pub fn bus(&self) -> &Arc<ObservationBus> {
        &self.bus
    }

    /// Ingest one input. Text is chunked semantically, logs per entry,
    /// screenshots become a single observation. Each chunk becomes one
    /// observation; identical inputs ingested twice intentionally produce
    /// fresh observations with identical chunking.
    pub async fn ingest(
        &self,
        input: SensoryInput,
        run_id: Option<&str>,
    ) -> anyhow::Result<IngestReceipt> {
        let mut receipt = IngestReceipt::default();

        match input {
            SensoryInput::Text { content, source } => {
                for chunk in chunk_text(&content, MAX_CHUNK_CHARS) {
                    let obs = self
                        .create_observation(ObservationType::Text, &chunk, &source, run_id, None)
                        .await?;
                    receipt.observation_ids.push(obs.id.clone());
                    receipt.evidence_ids.push(obs.id);
                    receipt.chunk_count += 1;
                }
            }
            SensoryInput::Log { content, source } => {
                for entry in chunk_log(&content) {
                    let obs = self
                        .create_observation(ObservationType::Log, &entry, &source, run_id, None)
                        .await?;
                    receipt.observation_ids.push(obs.id.clone());
                    receipt.evidence_ids.push(obs.id);
                    receipt.chunk_count += 1;
                }
            }
            SensoryInput::Screenshot {
                file_path,
                base64,
                description,
                source,
            } => {
                let summary = description
                    .filter(|d| !d.trim().is_empty())
                    .unwrap_or_else(|| "Screenshot captured".to_string());
                let raw_ref = file_path.or_else(|| base64.map(|_| "inline:base64".to_string()));
                let obs = self
                    .create_observation(
                        ObservationType::Screenshot,
                        &summary,
                        &source,
                        run_id,
                        raw_ref,
                    )
                    .await?;
                receipt.observation_ids.push(obs.id.clone());
                receipt.evidence_ids.push(obs.id);
                receipt.chunk_count += 1;
            }
        }

        Ok(receipt)
    }

    async fn create_observation(
        &self,
        kind: ObservationType,
        content: &str,
        sensor: &str,
        run_id: Option<&str>,
        raw_ref: Option<String>,
    ) -> anyhow::Result<Observation> {
        let mut obs = Observation::new(
            kind,
            summarise(content),
            ObservationSource {
                sensor: sensor.to_string(),
                session_id: None,
                run_id: run_id.map(str::to_string),
            },
        );
        obs.salience = salience_for(content);
        obs.key_points = key_points(content);
        obs.entities = extract_entities(content);
        obs.raw_ref = raw_ref;

        let obs = self.store.observations.create(obs).await?;

        if let Some(semantic) = &self.semantic {
            // best effort; semantic memory failures are non-fatal
            semantic.index_chunk(content, &obs.entities).await;
        }

        self.bus.publish(&obs).await;
        Ok(obs)
    }
}

/// Keyword-rule salience. Fatal/error/timeout score high, info/debug low.
pub fn salience_for(content: &str) -> f64 {
    let lower = content.to_lowercase();
    if lower.contains("fatal") || lower.contains("panic") {
        0.95
    } else if lower.contains("error") || lower.contains("exception") || lower.contains("failed") {
        0.85
    } else if lower.contains("timeout") || lower.contains("timed out") {
        0.8
    } else if lower.contains("warn") {
        0.6
    } else if lower.contains("succeeded") || lower.contains("success") {
        // routine success signals carry little new information
        0.4
    } else if lower.contains("debug") || lower.contains("trace") {
        0.2
    } else if lower.contains("info") {
        0.3
    } else {
        0.5
    }
}

/// Semantic chunking for prose: split on blank lines, then pack sentences
/// up to the size cap. Deterministic for identical input.
pub fn chunk_text(text: &str, max_chars: usize) -> Vec<String> {
    let mut chunks = Vec::new();
    for paragraph in text.split("\n\n") {
        let paragraph = paragraph.trim();
        if paragraph.is_empty() {
            continue;
        }
        if paragraph.len() <= max_chars {
            chunks.push(paragraph.to_string());
            continue;
        }

        let mut current = String::new();
        for sentence in split_sentences(paragraph) {
            if !current.is_empty() && current.len() + sentence.len() + 1 > max_chars {
                chunks.push(current.trim().to_string());
                current = String::new();
            }
            current.push_str(&sentence);
            current.push(' ');
        }
        if !current.trim().is_empty() {
            chunks.push(current.trim().to_string());
        }
    }
    chunks
}

/// Logs chunk per non-empty entry line.
pub fn chunk_log(content: &str) -> Vec<String> {
    content
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .map(str::to_string)
        .collect()
}

fn split_sentences(text: &str) -> Vec<String> {
    let splitter = Regex::new(r"(?s).*?(?:[.!?]\s+|$)").expect("static regex");
    splitter
        .find_iter(text)
        .map(|m| m.as_str().trim().to_string())
        .filter(|s| !s.is_empty())
        .collect()
}

fn summarise(content: &str) -> String {
    const MAX_SUMMARY_CHARS: usize = 240;
    let flattened = content.split_whitespace().collect::<Vec<_>>().join(" ");
    if flattened.len() <= MAX_SUMMARY_CHARS {
        flattened
    } else {
        let mut cut = MAX_SUMMARY_CHARS;
        while !flattened.is_char_boundary(cut) {
            cut -= 1;
        }
        format!("{}...", &flattened[..cut])
    }
}

fn key_points(content: &str) -> Vec<String> {
    split_sentences(content)
        .into_iter()
        .filter(|s| s.len() > 10)
        .take(3)
        .collect()
}

/// Entities worth matching candidate models on: URLs, domains, HTTP status
/// codes, and error identifiers.
pub fn extract_entities(content: &str) -> Vec<String> {
    let mut entities = Vec::new();

    let url_re = Regex::new(r"https?://[^\s\)\]]+").expect("static regex");
    for m in url_re.find_iter(content) {
        if let Ok(parsed) = url::Url::parse(m.as_str()) {
            if let Some(host) = parsed.host_str() {
                push_unique(&mut entities, host.trim_start_matches("www.").to_string());
            }
        }
    }

    let status_re = Regex::new(r"\b([45]\d\d)\b").expect("static regex");
    for m in status_re.find_iter(content) {
        push_unique(&mut entities, format!("http_{}", m.as_str()));
    }

    let err_re = Regex::new(r"\bnet::ERR_[A-Z_]+\b").expect("static regex");
    for m in err_re.find_iter(content) {
        push_unique(&mut entities, m.as_str().to_string());
    }

    for keyword in ["login", "cart", "checkout", "logout", "form", "navigation"] {
        if content.to_lowercase().contains(keyword) {
            push_unique(&mut entities, keyword.to_string());
        }
    }

    entities
}

fn push_unique(target: &mut Vec<String>, value: String) {
    if !target.contains(&value) {
        target.push(value);
    }
}
