//! The belief engine: turns salient observations into audited mental-model
//! mutations and typed graph edges.
//!
//! Only this engine mutates mental models. It never reads experiences, and
//! the experience optimizer never reaches in here; the two learning loops
//! must not cross-contaminate.

use std::collections::HashSet;
use std::sync::Arc;

use serde::Deserialize;
use serde_json::json;
use tracing::{debug, info, warn};

use crate::llm::{extract_json_block, LlmClient, LlmRequest};
use crate::narration::{NarrationBus, NarrationType};
use crate::semantic::CogneeClient;
use crate::store::{
    EdgeRelation, GraphEdge, MentalModel, ModelDomain, ModelPatch, Observation, StoreContext,
};

/// Observations below this salience produce zero belief changes.
pub const DEFAULT_SALIENCE_THRESHOLD: f64 = 0.5;
/// At most this many candidate models are offered to the LLM.
pub const MAX_CANDIDATE_MODELS: usize = 5;
/// Evidence snippets retrieved from semantic memory per observation.
pub const EVIDENCE_TOP_K: usize = 5;

#[derive(Debug, Clone, Default)]
pub struct BeliefOutcome {
    pub models_created: u32,
    pub models_updated: u32,
    pub edges_touched: u32,
    pub contradictions: u32,
}

impl BeliefOutcome {
    pub fn is_empty(&self) -> bool {
        self.models_created == 0 && self.models_updated == 0 && self.edges_touched == 0
    }
}

#[derive(Debug, Deserialize, Default)]
pub struct BeliefDelta {
    #[serde(default)]
    pub create_models: Vec<ModelDraft>,
    #[serde(default)]
    pub update_models: Vec<ModelUpdate>,
    #[serde(default)]
    pub graph_updates: Vec<EdgeAssertion>,
    #[serde(default)]
    pub contradictions: Vec<Contradiction>,
}

#[derive(Debug, Deserialize)]
pub struct ModelDraft {
    pub title: String,
    #[serde(default)]
    pub domain: Option<String>,
    pub summary: String,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub core_principles: Vec<String>,
    #[serde(default)]
    pub assumptions: Vec<String>,
    #[serde(default)]
    pub procedures: Vec<String>,
    #[serde(default)]
    pub failure_modes: Vec<String>,
    #[serde(default)]
    pub diagnostics: Vec<String>,
    #[serde(default)]
    pub examples: Vec<String>,
    #[serde(default = "default_draft_confidence")]
    pub confidence: f64,
}

fn default_draft_confidence() -> f64 {
    0.4
}

#[derive(Debug, Deserialize)]
pub struct ModelUpdate {
    pub model_id: String,
    pub change_summary: String,
    #[serde(default)]
    pub delta_confidence: f64,
    #[serde(default)]
    pub add_tags: Vec<String>,
    #[serde(default)]
    pub add_core_principles: Vec<String>,
    #[serde(default)]
    pub add_assumptions: Vec<String>,
    #[serde(default)]
    pub add_procedures: Vec<String>,
    #[serde(default)]
    pub add_failure_modes: Vec<String>,
    #[serde(default)]
    pub add_diagnostics: Vec<String>,
    #[serde(default)]
    pub add_examples: Vec<String>,
    #[serde(default)]
    pub summary: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct EdgeAssertion {
    pub from_model: String,
    pub to_model: String,
    pub relation: String,
    #[serde(default = "default_edge_weight")]
    pub weight: f64,
}

fn default_edge_weight() -> f64 {
    0.5
}

#[derive(Debug, Deserialize)]
pub struct Contradiction {
    #[serde(default)]
    pub model_id: Option<String>,
    pub statement: String,
}

pub struct BeliefEngine {
    store: Arc<StoreContext>,
    llm: Arc<LlmClient>,
    narration: Arc<NarrationBus>,
    semantic: Option<Arc<CogneeClient>>,
    salience_threshold: f64,
}

impl BeliefEngine {
    pub fn new(
        store: Arc<StoreContext>,
        llm: Arc<LlmClient>,
        narration: Arc<NarrationBus>,
        semantic: Option<Arc<CogneeClient>>,
    ) -> Self {
        Self {
            store,
            llm,
            narration,
            semantic,
            salience_threshold: DEFAULT_SALIENCE_THRESHOLD,
        }
    }

    pub fn with_salience_threshold(mut self, threshold: f64) -> Self {
        self.salience_threshold = threshold;
        self
    }

    /// Process one observation end to end. Low-salience observations are
    /// skipped without any LLM call or store mutation.
    pub async fn process_observation(&self, obs: &Observation) -> anyhow::Result<BeliefOutcome> {
        if obs.salience < self.salience_threshold {
            debug!(
                observation = %obs.id,
                salience = obs.salience,
                "below salience threshold; skipping"
            );
            return Ok(BeliefOutcome::default());
        }

        let candidates = self.select_candidates(obs).await?;
        let edges = self.edges_touching(&candidates).await?;
        let evidence = match &self.semantic {
            Some(semantic) => semantic.search(&obs.summary, EVIDENCE_TOP_K).await,
            None => Vec::new(),
        };

        let prompt = self.build_prompt(obs, &candidates, &edges, &evidence);
        let response = match self.llm.generate(&LlmRequest::json(prompt)).await {
            Ok(response) => response,
            Err(err) => {
                warn!(error = %err, observation = %obs.id, "belief LLM call failed; no updates");
                return Ok(BeliefOutcome::default());
            }
        };

        let delta: BeliefDelta = match serde_json::from_str(extract_json_block(&response.text)) {
            Ok(delta) => delta,
            Err(err) => {
                warn!(error = %err, "belief LLM returned malformed delta; no updates");
                return Ok(BeliefOutcome::default());
            }
        };

        self.apply_delta(obs, delta, &candidates).await
    }

    /// Candidate models ranked by tag/entity overlap with the observation.
    async fn select_candidates(&self, obs: &Observation) -> anyhow::Result<Vec<MentalModel>> {
        let needles: HashSet<String> = obs
            .entities
            .iter()
            .chain(obs.key_points.iter())
            .flat_map(|s| s.split_whitespace())
            .map(|s| s.to_lowercase())
            .collect();

        let mut scored: Vec<(usize, MentalModel)> = self
            .store
            .models
            .list(|m| m.status != crate::store::ModelStatus::Deprecated)
            .await?
            .into_iter()
            .map(|model| {
                let score = model
                    .tags
                    .iter()
                    .map(|t| t.to_lowercase())
                    .filter(|t| needles.contains(t))
                    .count()
                    + model
                        .title
                        .split_whitespace()
                        .map(|w| w.to_lowercase())
                        .filter(|w| needles.contains(w))
                        .count();
                (score, model)
            })
            .filter(|(score, _)| *score > 0)
            .collect();

        scored.sort_by(|a, b| b.0.cmp(&a.0));
        Ok(scored
            .into_iter()
            .take(MAX_CANDIDATE_MODELS)
            .map(|(_, model)| model)
            .collect())
    }

    async fn edges_touching(&self, candidates: &[MentalModel]) -> anyhow::Result<Vec<GraphEdge>> {
        let ids: HashSet<&str> = candidates.iter().map(|m| m.id.as_str()).collect();
        Ok(self
            .store
            .graph
            .list(|edge| {
                ids.contains(edge.from_model.as_str()) || ids.contains(edge.to_model.as_str())
            })
            .await?)
    }

    fn build_prompt(
        &self,
        obs: &Observation,
        candidates: &[MentalModel],
        edges: &[GraphEdge],
        evidence: &[crate::semantic::EvidenceSnippet],
    ) -> String {
        let candidate_block = candidates
            .iter()
            .map(|m| {
                format!(
                    "- id={} title={:?} confidence={:.2} summary={:?} tags={:?}",
                    m.id, m.title, m.confidence, m.summary, m.tags
                )
            })
            .collect::<Vec<_>>()
            .join("\n");
        let edge_block = edges
            .iter()
            .map(|e| format!("- {} -[{:?}]-> {} (weight {:.2})", e.from_model, e.relation, e.to_model, e.weight))
            .collect::<Vec<_>>()
            .join("\n");
        let evidence_block = evidence
            .iter()
            .map(|s| format!("- {}", s.text))
            .collect::<Vec<_>>()
            .join("\n");

        format!(
            "You maintain a graph of mental model records about a web application \
under test.\n\nNew observation ({kind:?}, salience {salience:.2}):\n{summary}\n\
Key points: {key_points:?}\nEntities: {entities:?}\n\n\
Candidate mental model records:\n{candidates}\n\nKnown edges:\n{edges}\n\n\
Related evidence:\n{evidence}\n\n\
Respond with a JSON object: {{\"create_models\":[{{\"title\",\"domain\" \
(software_QA|programming|research|general),\"summary\",\"tags\":[],\"confidence\"}}],\
\"update_models\":[{{\"model_id\",\"change_summary\",\"delta_confidence\",\
\"add_tags\":[],\"add_failure_modes\":[]}}],\
\"graph_updates\":[{{\"from_model\",\"to_model\",\"relation\" \
(depends_on|explains|extends|contradicts),\"weight\"}}],\
\"contradictions\":[{{\"model_id\",\"statement\"}}]}}.\n\
Only assert what the observation supports. Prefer updating an existing \
record over creating a near-duplicate.",
            kind = obs.kind,
            salience = obs.salience,
            summary = obs.summary,
            key_points = obs.key_points,
            entities = obs.entities,
            candidates = if candidate_block.is_empty() { "(none)".to_string() } else { candidate_block },
            edges = if edge_block.is_empty() { "(none)".to_string() } else { edge_block },
            evidence = if evidence_block.is_empty() { "(none)".to_string() } else { evidence_block },
        )
    }

    async fn apply_delta(
        &self,
        obs: &Observation,
        delta: BeliefDelta,
        candidates: &[MentalModel],
    ) -> anyhow::Result<BeliefOutcome> {
        let mut outcome = BeliefOutcome::default();
        let known_ids: HashSet<&str> = candidates.iter().map(|m| m.id.as_str()).collect();

        for draft in delta.create_models {
            let domain = parse_domain(draft.domain.as_deref());
            let mut model = MentalModel::candidate(
                draft.title,
                domain,
                draft.summary,
                draft.confidence,
                format!("created from observation {}", obs.id),
                vec![obs.id.clone()],
            );
            model.tags = draft.tags;
            model.core_principles = draft.core_principles;
            model.assumptions = draft.assumptions;
            model.procedures = draft.procedures;
            model.failure_modes = draft.failure_modes;
            model.diagnostics = draft.diagnostics;
            model.examples = draft.examples;

            let created = self.store.models.create(model).await?;
            outcome.models_created += 1;
            self.narration.emit(
                NarrationType::BeliefFormed,
                obs.source.run_id.as_deref(),
                format!("I formed a new belief: {}", created.title),
                Some(json!({ "model_id": created.id, "confidence": created.confidence })),
            );
        }

        for update in delta.update_models {
            if !known_ids.contains(update.model_id.as_str()) {
                warn!(model = %update.model_id, "update targets a non-candidate model; skipping");
                continue;
            }
            let patch = ModelPatch {
                change_summary: update.change_summary,
                delta_confidence: update.delta_confidence,
                evidence_ids: vec![obs.id.clone()],
                tags: update.add_tags,
                core_principles: update.add_core_principles,
                assumptions: update.add_assumptions,
                procedures: update.add_procedures,
                failure_modes: update.add_failure_modes,
                diagnostics: update.add_diagnostics,
                examples: update.add_examples,
                summary: update.summary,
            };
            match self.store.update_model(&update.model_id, patch).await {
                Ok(updated) => {
                    outcome.models_updated += 1;
                    self.narration.emit(
                        NarrationType::BeliefFormed,
                        obs.source.run_id.as_deref(),
                        format!(
                            "I revised my belief {:?} (confidence now {:.2})",
                            updated.title, updated.confidence
                        ),
                        Some(json!({ "model_id": updated.id, "confidence": updated.confidence })),
                    );
                }
                Err(err) => warn!(error = %err, "model update rejected"),
            }
        }

        for assertion in delta.graph_updates {
            match self.assert_edge(&assertion, &obs.id).await {
                Ok(true) => outcome.edges_touched += 1,
                Ok(false) => {}
                Err(err) => warn!(error = %err, "graph update rejected"),
            }
        }

        // policy: contradictions surface to the operator, they are not applied
        for contradiction in delta.contradictions {
            outcome.contradictions += 1;
            warn!(
                model = ?contradiction.model_id,
                statement = %contradiction.statement,
                "belief contradiction surfaced, not applied"
            );
            self.narration.emit(
                NarrationType::Narration,
                obs.source.run_id.as_deref(),
                format!(
                    "I noticed evidence contradicting an existing belief: {}",
                    contradiction.statement
                ),
                contradiction.model_id.map(|id| json!({ "model_id": id })),
            );
        }

        if !outcome.is_empty() {
            info!(
                observation = %obs.id,
                created = outcome.models_created,
                updated = outcome.models_updated,
                edges = outcome.edges_touched,
                "belief delta applied"
            );
        }
        Ok(outcome)
    }

    /// Create the edge, or strengthen the existing edge between the same
    /// ordered pair with additional evidence.
    async fn assert_edge(&self, assertion: &EdgeAssertion, evidence_id: &str) -> anyhow::Result<bool> {
        let Some(relation) = parse_relation(&assertion.relation) else {
            warn!(relation = %assertion.relation, "unknown edge relation; skipping");
            return Ok(false);
        };
        if !self.store.models.exists(&assertion.from_model).await?
            || !self.store.models.exists(&assertion.to_model).await?
        {
            warn!("edge endpoints not found; skipping");
            return Ok(false);
        }

        let existing = self
            .store
            .graph
            .list(|edge| {
                edge.from_model == assertion.from_model && edge.to_model == assertion.to_model
            })
            .await?;

        if let Some(edge) = existing.into_iter().next() {
            let evidence_id = evidence_id.to_string();
            let weight = assertion.weight;
            self.store
                .graph
                .update_with(&edge.id, move |edge| {
                    edge.weight = (edge.weight + weight * 0.5).min(1.0);
                    if !edge.evidence_ids.contains(&evidence_id) {
                        edge.evidence_ids.push(evidence_id.clone());
                    }
                    edge.last_updated = chrono::Utc::now();
                    Ok(())
                })
                .await?;
        } else {
            self.store
                .graph
                .create(GraphEdge::new(
                    assertion.from_model.clone(),
                    assertion.to_model.clone(),
                    relation,
                    assertion.weight,
                    vec![evidence_id.to_string()],
                ))
                .await?;
        }
        Ok(true)
    }
}

fn parse_domain(raw: Option<&str>) -> ModelDomain {
    match raw {
        Some("software_QA") => ModelDomain::SoftwareQa,
        Some("programming") => ModelDomain::Programming,
        Some("research") => ModelDomain::Research,
        _ => ModelDomain::General,
    }
}

fn parse_relation(raw: &str) -> Option<EdgeRelation> {
    match raw {
        "depends_on" => Some(EdgeRelation::DependsOn),
        "explains" => Some(EdgeRelation::Explains),
        "extends" => Some(EdgeRelation::Extends),
        "contradicts" => Some(EdgeRelation::Contradicts),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::MockClient;
    use crate::narration::CredentialMasker;
    use crate::store::{ObservationSource, ObservationType};

    fn temp_store() -> Arc<StoreContext> {
        let dir = std::env::temp_dir().join(format!("noema_test_{}", uuid::Uuid::new_v4()));
        Arc::new(StoreContext::open(dir).unwrap())
    }

    fn engine_with(store: Arc<StoreContext>, mock: MockClient) -> BeliefEngine {
        BeliefEngine::new(
            store,
            Arc::new(LlmClient::Mock(mock)),
            Arc::new(NarrationBus::new(CredentialMasker::default())),
            None,
        )
    }

    fn observation(summary: &str, salience: f64) -> Observation {
        let mut obs = Observation::new(
            ObservationType::Log,
            summary,
            ObservationSource {
                sensor: "test".into(),
                run_id: Some("run-1".into()),
                ..Default::default()
            },
        );
        obs.salience = salience;
        obs.entities = crate::sensing::extract_entities(summary);
        obs
    }

    #[tokio::test]
    async fn low_salience_produces_zero_belief_changes() {
        let store = temp_store();
        let mock = MockClient::with_responses(vec![
            r#"{"create_models":[{"title":"should not exist","summary":"x"}]}"#.into(),
        ]);
        let engine = engine_with(store.clone(), mock);

        let obs = observation("debug: nothing interesting", 0.2);
        let outcome = engine.process_observation(&obs).await.unwrap();

        assert!(outcome.is_empty());
        assert_eq!(store.models.count().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn create_and_update_apply_with_audit_history() {
        let store = temp_store();

        let seed = MentalModel::candidate(
            "Login form rejects bad credentials",
            ModelDomain::SoftwareQa,
            "Submitting wrong credentials shows an error banner",
            0.5,
            "initial",
            vec![],
        );
        let mut seed = seed;
        seed.tags = vec!["login".into()];
        let seed_id = seed.id.clone();
        store.models.create(seed).await.unwrap();

        let mock = MockClient::with_responses(vec![format!(
            r#"{{"create_models":[{{"title":"Error banners use data-test attributes","domain":"software_QA","summary":"Error banners carry data-test=error","tags":["login"],"confidence":0.4}}],
                "update_models":[{{"model_id":"{seed_id}","change_summary":"confirmed by error banner","delta_confidence":0.2}}]}}"#
        )]);
        let engine = engine_with(store.clone(), mock);

        let obs = observation("error: login failed for https://www.saucedemo.com", 0.9);
        let obs = store.observations.create(obs).await.unwrap();
        let outcome = engine.process_observation(&obs).await.unwrap();

        assert_eq!(outcome.models_created, 1);
        assert_eq!(outcome.models_updated, 1);

        let updated = store.models.get(&seed_id).await.unwrap().unwrap();
        assert_eq!(updated.update_history.len(), 2);
        assert!((updated.confidence - 0.7).abs() < 1e-9);
        assert!(updated.evidence_ids.contains(&obs.id));
        assert_eq!(updated.status, crate::store::ModelStatus::Active);
    }

    #[tokio::test]
    async fn edge_reassertion_strengthens_existing_edge() {
        let store = temp_store();
        let a = store
            .models
            .create(MentalModel::candidate(
                "Login works",
                ModelDomain::SoftwareQa,
                "login ok",
                0.5,
                "initial",
                vec![],
            ))
            .await
            .unwrap();
        let b = store
            .models
            .create(MentalModel::candidate(
                "Cart works",
                ModelDomain::SoftwareQa,
                "cart ok",
                0.5,
                "initial",
                vec![],
            ))
            .await
            .unwrap();

        let engine = engine_with(store.clone(), MockClient::new());
        let assertion = EdgeAssertion {
            from_model: b.id.clone(),
            to_model: a.id.clone(),
            relation: "depends_on".into(),
            weight: 0.6,
        };
        engine.assert_edge(&assertion, "obs-1").await.unwrap();
        engine.assert_edge(&assertion, "obs-2").await.unwrap();

        let edges = store.graph.list_all().await.unwrap();
        assert_eq!(edges.len(), 1);
        assert!(edges[0].weight > 0.6);
        assert_eq!(edges[0].evidence_ids.len(), 2);
    }

    #[tokio::test]
    async fn contradictions_are_surfaced_not_applied() {
        let store = temp_store();
        let model = store
            .models
            .create(MentalModel::candidate(
                "Checkout never fails",
                ModelDomain::SoftwareQa,
                "checkout always succeeds",
                0.8,
                "initial",
                vec![],
            ))
            .await
            .unwrap();

        let mock = MockClient::with_responses(vec![format!(
            r#"{{"contradictions":[{{"model_id":"{}","statement":"checkout failed with a 500"}}]}}"#,
            model.id
        )]);
        let engine = engine_with(store.clone(), mock);

        let obs = observation("error: checkout returned 500", 0.9);
        let outcome = engine.process_observation(&obs).await.unwrap();

        assert_eq!(outcome.contradictions, 1);
        let unchanged = store.models.get(&model.id).await.unwrap().unwrap();
        assert!((unchanged.confidence - 0.8).abs() < 1e-9);
        assert_eq!(unchanged.update_history.len(), 1);
    }
}
