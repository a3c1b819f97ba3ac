//! The typed store: validated JSON-backed collections with write-through
//! persistence. The store is the single owner of persisted state; every
//! component reaches it through repositories, and mental-model mutations
//! carry an audit reason.

pub mod records;
pub mod repository;

use std::path::{Path, PathBuf};

use chrono::Utc;
use thiserror::Error;
use tracing::info;

pub use records::*;
pub use repository::Repository;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("validation failed at `{path}`: {message}")]
    Validation { path: String, message: String },

    #[error("invalid mutation: {0}")]
    InvalidMutation(String),

    #[error("{collection} collection is corrupt: {message}")]
    Corrupt {
        collection: &'static str,
        message: String,
    },

    #[error("I/O error on {collection} collection: {source}")]
    Io {
        collection: &'static str,
        #[source]
        source: std::io::Error,
    },

    #[error("{collection} record not found: {id}")]
    NotFound {
        collection: &'static str,
        id: String,
    },

    #[error("{collection} record already exists: {id}")]
    Conflict {
        collection: &'static str,
        id: String,
    },

    #[error("{0} collection not loaded")]
    NotLoaded(&'static str),
}

/// Audited update payload for mental models.
#[derive(Debug, Clone, Default)]
pub struct ModelPatch {
    pub change_summary: String,
    pub delta_confidence: f64,
    pub evidence_ids: Vec<String>,
    /// Array fields to merge-dedup into the model.
    pub tags: Vec<String>,
    pub core_principles: Vec<String>,
    pub assumptions: Vec<String>,
    pub procedures: Vec<String>,
    pub failure_modes: Vec<String>,
    pub diagnostics: Vec<String>,
    pub examples: Vec<String>,
    /// Replacement summary, when the belief engine rewrites it.
    pub summary: Option<String>,
}

/// All repositories plus the evidence directories, constructed once and
/// threaded through the context.
pub struct StoreContext {
    data_dir: PathBuf,
    pub observations: Repository<Observation>,
    pub models: Repository<MentalModel>,
    pub experiences: Repository<Experience>,
    pub graph: Repository<GraphEdge>,
    pub actions: Repository<ActionRecord>,
    pub outcomes: Repository<ActionOutcome>,
    pub runs: Repository<RunRecord>,
    pub sequences: Repository<ActionSequence>,
    pub metrics: Repository<RunMetrics>,
    pub identity: Repository<Identity>,
}

impl StoreContext {
    pub fn open(data_dir: impl AsRef<Path>) -> std::io::Result<Self> {
        let data_dir = data_dir.as_ref().to_path_buf();
        std::fs::create_dir_all(&data_dir)?;
        std::fs::create_dir_all(data_dir.join("screenshots"))?;
        std::fs::create_dir_all(data_dir.join("videos"))?;
        info!(dir = %data_dir.display(), "opened state directory");

        Ok(Self {
            observations: Repository::new(&data_dir),
            models: Repository::new(&data_dir),
            experiences: Repository::new(&data_dir),
            graph: Repository::new(&data_dir),
            actions: Repository::new(&data_dir),
            outcomes: Repository::new(&data_dir),
            runs: Repository::new(&data_dir),
            sequences: Repository::new(&data_dir),
            metrics: Repository::new(&data_dir),
            identity: Repository::new(&data_dir),
            data_dir,
        })
    }

    pub fn data_dir(&self) -> &Path {
        &self.data_dir
    }

    pub fn screenshots_dir(&self) -> PathBuf {
        self.data_dir.join("screenshots")
    }

    pub fn videos_dir(&self) -> PathBuf {
        self.data_dir.join("videos")
    }

    /// Observations are immutable; deletion only stamps `deleted_at`.
    pub async fn soft_delete_observation(&self, id: &str) -> Result<Observation, StoreError> {
        self.observations
            .update_with(id, |obs| {
                if obs.deleted_at.is_some() {
                    return Err(StoreError::InvalidMutation(format!(
                        "observation {id} is already deleted"
                    )));
                }
                obs.deleted_at = Some(Utc::now());
                Ok(())
            })
            .await
    }

    /// Apply an audited patch to a mental model: merge-dedup the array
    /// fields, clip the confidence, append exactly one history entry, and
    /// promote `candidate -> active` when the promotion threshold is
    /// crossed. `created_at` and past history entries are immutable.
    pub async fn update_model(&self, id: &str, patch: ModelPatch) -> Result<MentalModel, StoreError> {
        if patch.change_summary.trim().is_empty() {
            return Err(StoreError::InvalidMutation(
                "model updates must carry a change_summary".to_string(),
            ));
        }

        self.models
            .update_with(id, |model| {
                let now = Utc::now();

                merge_dedup(&mut model.tags, &patch.tags);
                merge_dedup(&mut model.core_principles, &patch.core_principles);
                merge_dedup(&mut model.assumptions, &patch.assumptions);
                merge_dedup(&mut model.procedures, &patch.procedures);
                merge_dedup(&mut model.failure_modes, &patch.failure_modes);
                merge_dedup(&mut model.diagnostics, &patch.diagnostics);
                merge_dedup(&mut model.examples, &patch.examples);
                merge_dedup(&mut model.evidence_ids, &patch.evidence_ids);
                if let Some(summary) = &patch.summary {
                    model.summary = summary.clone();
                }

                model.update_history.push(ModelHistoryEntry {
                    ts: now,
                    change_summary: patch.change_summary.clone(),
                    delta_confidence: patch.delta_confidence,
                    evidence_ids: patch.evidence_ids.clone(),
                });
                model.confidence = model.confidence_from_history();
                model.last_updated = now;

                if model.status == ModelStatus::Candidate
                    && model.confidence >= MODEL_PROMOTION_CONFIDENCE
                {
                    model.status = ModelStatus::Active;
                }
                Ok(())
            })
            .await
    }

    /// Guarded raw-field update used to reject mutations that a well-behaved
    /// caller cannot produce: overwriting `created_at` or rewriting history.
    pub async fn replace_model_guarded(&self, replacement: MentalModel) -> Result<MentalModel, StoreError> {
        let id = replacement.id.clone();
        self.models
            .update_with(&id, |model| {
                if replacement.created_at != model.created_at {
                    return Err(StoreError::InvalidMutation(
                        "created_at is immutable".to_string(),
                    ));
                }
                if replacement.update_history.len() < model.update_history.len()
                    || replacement
                        .update_history
                        .iter()
                        .zip(model.update_history.iter())
                        .any(|(new, old)| {
                            new.ts != old.ts
                                || new.change_summary != old.change_summary
                                || new.delta_confidence != old.delta_confidence
                        })
                {
                    return Err(StoreError::InvalidMutation(
                        "update_history is append-only".to_string(),
                    ));
                }
                *model = replacement.clone();
                Ok(())
            })
            .await
    }
}

fn merge_dedup(target: &mut Vec<String>, additions: &[String]) {
    for addition in additions {
        let trimmed = addition.trim();
        if trimmed.is_empty() {
            continue;
        }
        if !target.iter().any(|existing| existing == trimmed) {
            target.push(trimmed.to_string());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_store() -> StoreContext {
        let dir = std::env::temp_dir().join(format!("noema_test_{}", uuid::Uuid::new_v4()));
        StoreContext::open(dir).unwrap()
    }

    #[tokio::test]
    async fn model_patch_appends_history_and_promotes() {
        let store = temp_store();
        let model = MentalModel::candidate(
            "Inventory page lists products",
            ModelDomain::SoftwareQa,
            "After login the inventory page renders product cards",
            0.5,
            "initial observation",
            vec!["obs-1".into()],
        );
        let id = model.id.clone();
        store.models.create(model).await.unwrap();

        let updated = store
            .update_model(
                &id,
                ModelPatch {
                    change_summary: "confirmed by second run".into(),
                    delta_confidence: 0.2,
                    evidence_ids: vec!["obs-2".into(), "obs-1".into()],
                    tags: vec!["inventory".into()],
                    ..Default::default()
                },
            )
            .await
            .unwrap();

        assert_eq!(updated.update_history.len(), 2);
        assert!((updated.confidence - 0.7).abs() < 1e-9);
        assert_eq!(updated.status, ModelStatus::Active);
        // evidence union, no duplicates
        assert_eq!(updated.evidence_ids, vec!["obs-1".to_string(), "obs-2".to_string()]);
    }

    #[tokio::test]
    async fn history_rewrite_is_rejected() {
        let store = temp_store();
        let model = MentalModel::candidate(
            "Checkout requires address",
            ModelDomain::SoftwareQa,
            "The checkout form blocks submission without an address",
            0.4,
            "initial",
            vec![],
        );
        let id = model.id.clone();
        store.models.create(model.clone()).await.unwrap();

        let mut tampered = model;
        tampered.update_history[0].delta_confidence = 1.0;
        tampered.confidence = 1.0;
        assert!(matches!(
            store.replace_model_guarded(tampered).await,
            Err(StoreError::InvalidMutation(_))
        ));

        let unchanged = store.models.get(&id).await.unwrap().unwrap();
        assert!((unchanged.confidence - 0.4).abs() < 1e-9);
    }

    #[tokio::test]
    async fn created_at_is_immutable() {
        let store = temp_store();
        let model = MentalModel::candidate(
            "Cart badge shows item count",
            ModelDomain::SoftwareQa,
            "Adding a product increments the cart badge",
            0.5,
            "initial",
            vec![],
        );
        store.models.create(model.clone()).await.unwrap();

        let mut tampered = model;
        tampered.created_at = Utc::now();
        assert!(matches!(
            store.replace_model_guarded(tampered).await,
            Err(StoreError::InvalidMutation(_))
        ));
    }

    #[tokio::test]
    async fn observation_soft_delete_keeps_record() {
        let store = temp_store();
        let obs = Observation::new(
            ObservationType::Log,
            "console error: net::ERR_CONNECTION_REFUSED",
            ObservationSource {
                sensor: "log".into(),
                ..Default::default()
            },
        );
        let id = obs.id.clone();
        store.observations.create(obs).await.unwrap();

        store.soft_delete_observation(&id).await.unwrap();
        let deleted = store.observations.get(&id).await.unwrap().unwrap();
        assert!(deleted.deleted_at.is_some());
        assert!(store.soft_delete_observation(&id).await.is_err());
    }

    #[tokio::test]
    async fn clip_keeps_confidence_in_bounds() {
        let store = temp_store();
        let model = MentalModel::candidate(
            "Logout clears session",
            ModelDomain::SoftwareQa,
            "Logging out redirects to the login page",
            0.9,
            "initial",
            vec![],
        );
        let id = model.id.clone();
        store.models.create(model).await.unwrap();

        let updated = store
            .update_model(
                &id,
                ModelPatch {
                    change_summary: "strong confirmation".into(),
                    delta_confidence: 0.5,
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert!((updated.confidence - 1.0).abs() < 1e-9);

        let updated = store
            .update_model(
                &id,
                ModelPatch {
                    change_summary: "contradicting evidence".into(),
                    delta_confidence: -2.0,
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert!((updated.confidence - 0.0).abs() < 1e-9);
    }
}
