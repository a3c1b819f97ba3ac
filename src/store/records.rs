//! Persisted entity types and their per-entity invariants.
//!
//! Every record carries a UUID primary key and UTC timestamps, and is
//! validated on every write and on load. Validation failures on load are
//! fatal: corrupt persistence must surface, not silently drop records.

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use super::StoreError;

pub fn new_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

/// A record that can live in a typed collection.
pub trait Record: Clone + Serialize + DeserializeOwned + Send + Sync + 'static {
    /// File stem of the backing collection (`<collection>.json`).
    const COLLECTION: &'static str;

    fn id(&self) -> &str;

    /// Per-entity invariants, checked at write time and at load.
    fn validate(&self) -> Result<(), StoreError>;
}

fn invalid<T>(collection: &str, field: &str, message: impl Into<String>) -> Result<T, StoreError> {
    Err(StoreError::Validation {
        path: format!("{collection}.{field}"),
        message: message.into(),
    })
}

fn check_unit_interval(
    collection: &str,
    field: &str,
    value: f64,
) -> Result<(), StoreError> {
    if !(0.0..=1.0).contains(&value) || value.is_nan() {
        return invalid(collection, field, format!("must be in [0,1], got {value}"));
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Observations
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ObservationType {
    Log,
    Text,
    Screenshot,
    VideoFrame,
    AudioTranscript,
    Human,
    TestResult,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ObservationSource {
    pub sensor: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub run_id: Option<String>,
}

/// A validated, typed record of a perceived input. Immutable after
/// creation; deletion is a soft delete via `deleted_at`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Observation {
    pub id: String,
    #[serde(rename = "type")]
    pub kind: ObservationType,
    pub summary: String,
    #[serde(default)]
    pub key_points: Vec<String>,
    #[serde(default)]
    pub entities: Vec<String>,
    pub salience: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub raw_ref: Option<String>,
    pub source: ObservationSource,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deleted_at: Option<DateTime<Utc>>,
}

impl Observation {
    pub fn new(kind: ObservationType, summary: impl Into<String>, source: ObservationSource) -> Self {
        Self {
            id: new_id(),
            kind,
            summary: summary.into(),
            key_points: Vec::new(),
            entities: Vec::new(),
            salience: 0.5,
            raw_ref: None,
            source,
            created_at: Utc::now(),
            deleted_at: None,
        }
    }
}

impl Record for Observation {
    const COLLECTION: &'static str = "observations";

    fn id(&self) -> &str {
        &self.id
    }

    fn validate(&self) -> Result<(), StoreError> {
        if self.summary.trim().is_empty() {
            return invalid(Self::COLLECTION, "summary", "must not be empty");
        }
        check_unit_interval(Self::COLLECTION, "salience", self.salience)?;
        if self.source.sensor.trim().is_empty() {
            return invalid(Self::COLLECTION, "source.sensor", "must name the sensor");
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Mental models
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ModelDomain {
    #[serde(rename = "software_QA")]
    SoftwareQa,
    #[serde(rename = "programming")]
    Programming,
    #[serde(rename = "research")]
    Research,
    #[serde(rename = "general")]
    General,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ModelStatus {
    Active,
    Candidate,
    Deprecated,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelHistoryEntry {
    pub ts: DateTime<Utc>,
    pub change_summary: String,
    pub delta_confidence: f64,
    #[serde(default)]
    pub evidence_ids: Vec<String>,
}

/// A durable, confidence-weighted statement about the system under test.
/// Only the belief engine mutates these, and every mutation appends to the
/// audit history. Invariant: `confidence` equals the clipped sum of the
/// history deltas.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MentalModel {
    pub id: String,
    pub title: String,
    pub domain: ModelDomain,
    #[serde(default)]
    pub tags: Vec<String>,
    pub summary: String,
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
    pub confidence: f64,
    pub status: ModelStatus,
    #[serde(default)]
    pub evidence_ids: Vec<String>,
    pub created_at: DateTime<Utc>,
    pub last_updated: DateTime<Utc>,
    pub update_history: Vec<ModelHistoryEntry>,
}

/// Confidence at which a candidate model is promoted to active.
pub const MODEL_PROMOTION_CONFIDENCE: f64 = 0.6;

impl MentalModel {
    /// A freshly created model starts as a candidate with one history entry
    /// recording its initial confidence as the first delta.
    pub fn candidate(
        title: impl Into<String>,
        domain: ModelDomain,
        summary: impl Into<String>,
        confidence: f64,
        change_summary: impl Into<String>,
        evidence_ids: Vec<String>,
    ) -> Self {
        let now = Utc::now();
        let confidence = confidence.clamp(0.0, 1.0);
        Self {
            id: new_id(),
            title: title.into(),
            domain,
            tags: Vec::new(),
            summary: summary.into(),
            core_principles: Vec::new(),
            assumptions: Vec::new(),
            procedures: Vec::new(),
            failure_modes: Vec::new(),
            diagnostics: Vec::new(),
            examples: Vec::new(),
            confidence,
            status: ModelStatus::Candidate,
            evidence_ids: evidence_ids.clone(),
            created_at: now,
            last_updated: now,
            update_history: vec![ModelHistoryEntry {
                ts: now,
                change_summary: change_summary.into(),
                delta_confidence: confidence,
                evidence_ids,
            }],
        }
    }

    /// Confidence recomputed from the audit history.
    pub fn confidence_from_history(&self) -> f64 {
        self.update_history
            .iter()
            .map(|entry| entry.delta_confidence)
            .sum::<f64>()
            .clamp(0.0, 1.0)
    }
}

impl Record for MentalModel {
    const COLLECTION: &'static str = "mental_models";

    fn id(&self) -> &str {
        &self.id
    }

    fn validate(&self) -> Result<(), StoreError> {
        if self.title.trim().is_empty() {
            return invalid(Self::COLLECTION, "title", "must not be empty");
        }
        check_unit_interval(Self::COLLECTION, "confidence", self.confidence)?;
        if self.update_history.is_empty() {
            return invalid(Self::COLLECTION, "update_history", "must have >= 1 entry");
        }
        let expected = self.confidence_from_history();
        if (self.confidence - expected).abs() > 1e-9 {
            return invalid(
                Self::COLLECTION,
                "confidence",
                format!("must equal clipped history sum {expected}, got {}", self.confidence),
            );
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Experiences
// ---------------------------------------------------------------------------

/// Maximum statement length, in words.
pub const EXPERIENCE_MAX_WORDS: usize = 32;

/// A short advisory heuristic about what actions work well. Advisory only;
/// never consulted by the belief engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Experience {
    pub id: String,
    pub statement: String,
    #[serde(default)]
    pub scope: Vec<String>,
    pub confidence: f64,
    #[serde(default)]
    pub source_runs: Vec<String>,
    pub created_at: DateTime<Utc>,
    pub last_updated: DateTime<Utc>,
}

impl Experience {
    pub fn new(statement: impl Into<String>, scope: Vec<String>, confidence: f64) -> Self {
        let now = Utc::now();
        Self {
            id: new_id(),
            statement: statement.into(),
            scope,
            confidence: confidence.clamp(0.0, 1.0),
            source_runs: Vec::new(),
            created_at: now,
            last_updated: now,
        }
    }
}

impl Record for Experience {
    const COLLECTION: &'static str = "experiences";

    fn id(&self) -> &str {
        &self.id
    }

    fn validate(&self) -> Result<(), StoreError> {
        if self.statement.trim().is_empty() {
            return invalid(Self::COLLECTION, "statement", "must not be empty");
        }
        let words = self.statement.split_whitespace().count();
        if words > EXPERIENCE_MAX_WORDS {
            return invalid(
                Self::COLLECTION,
                "statement",
                format!("must be <= {EXPERIENCE_MAX_WORDS} words, got {words}"),
            );
        }
        check_unit_interval(Self::COLLECTION, "confidence", self.confidence)
    }
}

// ---------------------------------------------------------------------------
// Graph edges
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EdgeRelation {
    DependsOn,
    Explains,
    Extends,
    Contradicts,
}

/// Typed edge between two mental models. At most one edge exists per
/// ordered `(from, to)` pair; re-assertion strengthens the weight.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GraphEdge {
    pub id: String,
    pub from_model: String,
    pub to_model: String,
    pub relation: EdgeRelation,
    pub weight: f64,
    #[serde(default)]
    pub evidence_ids: Vec<String>,
    pub created_at: DateTime<Utc>,
    pub last_updated: DateTime<Utc>,
}

impl GraphEdge {
    pub fn new(
        from_model: impl Into<String>,
        to_model: impl Into<String>,
        relation: EdgeRelation,
        weight: f64,
        evidence_ids: Vec<String>,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: new_id(),
            from_model: from_model.into(),
            to_model: to_model.into(),
            relation,
            weight: weight.clamp(0.0, 1.0),
            evidence_ids,
            created_at: now,
            last_updated: now,
        }
    }
}

impl Record for GraphEdge {
    const COLLECTION: &'static str = "graph";

    fn id(&self) -> &str {
        &self.id
    }

    fn validate(&self) -> Result<(), StoreError> {
        if self.from_model == self.to_model {
            return invalid(Self::COLLECTION, "to_model", "self-edges are not allowed");
        }
        check_unit_interval(Self::COLLECTION, "weight", self.weight)
    }
}

// ---------------------------------------------------------------------------
// Actions and outcomes
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionType {
    NavigateToUrl,
    ClickElement,
    FillInput,
    SubmitForm,
    CheckElementVisible,
    CaptureScreenshot,
    WaitForNetworkIdle,
    NoOp,
}

impl ActionType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ActionType::NavigateToUrl => "navigate_to_url",
            ActionType::ClickElement => "click_element",
            ActionType::FillInput => "fill_input",
            ActionType::SubmitForm => "submit_form",
            ActionType::CheckElementVisible => "check_element_visible",
            ActionType::CaptureScreenshot => "capture_screenshot",
            ActionType::WaitForNetworkIdle => "wait_for_network_idle",
            ActionType::NoOp => "no_op",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim() {
            "navigate_to_url" => Some(ActionType::NavigateToUrl),
            "click_element" => Some(ActionType::ClickElement),
            "fill_input" => Some(ActionType::FillInput),
            "submit_form" => Some(ActionType::SubmitForm),
            "check_element_visible" => Some(ActionType::CheckElementVisible),
            "capture_screenshot" => Some(ActionType::CaptureScreenshot),
            "wait_for_network_idle" => Some(ActionType::WaitForNetworkIdle),
            "no_op" => Some(ActionType::NoOp),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActionRecord {
    pub id: String,
    pub run_id: String,
    #[serde(rename = "type")]
    pub kind: ActionType,
    pub rationale: String,
    /// Action inputs with credential values masked; raw values never land
    /// in the store.
    pub inputs: serde_json::Value,
    pub expected_outcome: String,
    pub created_at: DateTime<Utc>,
}

impl ActionRecord {
    pub fn new(run_id: impl Into<String>, kind: ActionType, rationale: impl Into<String>) -> Self {
        Self {
            id: new_id(),
            run_id: run_id.into(),
            kind,
            rationale: rationale.into(),
            inputs: serde_json::Value::Null,
            expected_outcome: String::new(),
            created_at: Utc::now(),
        }
    }
}

impl Record for ActionRecord {
    const COLLECTION: &'static str = "actions";

    fn id(&self) -> &str {
        &self.id
    }

    fn validate(&self) -> Result<(), StoreError> {
        if self.run_id.trim().is_empty() {
            return invalid(Self::COLLECTION, "run_id", "must reference a run");
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ActionArtifacts {
    #[serde(default)]
    pub screenshots: Vec<String>,
    #[serde(default)]
    pub logs: Vec<String>,
    #[serde(default)]
    pub network_errors: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dom_snapshot: Option<serde_json::Value>,
}

/// One execution result for an action. Actions may accumulate several
/// outcomes when a higher layer retries.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActionOutcome {
    pub id: String,
    pub action_id: String,
    pub success: bool,
    pub duration_ms: u64,
    #[serde(default)]
    pub artifacts: ActionArtifacts,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl ActionOutcome {
    pub fn new(action_id: impl Into<String>, success: bool, duration_ms: u64) -> Self {
        Self {
            id: new_id(),
            action_id: action_id.into(),
            success,
            duration_ms,
            artifacts: ActionArtifacts::default(),
            error_message: None,
            created_at: Utc::now(),
        }
    }
}

impl Record for ActionOutcome {
    const COLLECTION: &'static str = "action_outcomes";

    fn id(&self) -> &str {
        &self.id
    }

    fn validate(&self) -> Result<(), StoreError> {
        if self.action_id.trim().is_empty() {
            return invalid(Self::COLLECTION, "action_id", "must reference an action");
        }
        if !self.success && self.error_message.is_none() {
            return invalid(
                Self::COLLECTION,
                "error_message",
                "failed outcomes must carry an error message",
            );
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Runs
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunRecord {
    pub id: String,
    pub task: String,
    #[serde(default)]
    pub observations_used: Vec<String>,
    #[serde(default)]
    pub models_touched: Vec<String>,
    #[serde(default)]
    pub experiences_touched: Vec<String>,
    #[serde(default)]
    pub actions: Vec<String>,
    #[serde(default)]
    pub outcomes: Vec<String>,
    pub started_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
}

impl RunRecord {
    pub fn new(id: impl Into<String>, task: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            task: task.into(),
            observations_used: Vec::new(),
            models_touched: Vec::new(),
            experiences_touched: Vec::new(),
            actions: Vec::new(),
            outcomes: Vec::new(),
            started_at: Utc::now(),
            finished_at: None,
        }
    }
}

impl Record for RunRecord {
    const COLLECTION: &'static str = "runs";

    fn id(&self) -> &str {
        &self.id
    }

    fn validate(&self) -> Result<(), StoreError> {
        if self.task.trim().is_empty() {
            return invalid(Self::COLLECTION, "task", "must not be empty");
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Action sequences
// ---------------------------------------------------------------------------

/// Confidence floor/start/ceiling for cached sequences.
pub const SEQUENCE_CONFIDENCE_FLOOR: f64 = 0.1;
pub const SEQUENCE_CONFIDENCE_START: f64 = 0.6;
pub const SEQUENCE_SUCCESS_BONUS: f64 = 0.1;
pub const SEQUENCE_FAILURE_PENALTY: f64 = 0.2;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SequenceAction {
    #[serde(rename = "type")]
    pub kind: ActionType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub selector: Option<String>,
    /// Credential values are tokenised as `${username}` / `${password}`;
    /// detokenisation happens just-in-time at replay.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value_template: Option<String>,
    #[serde(default)]
    pub inputs: serde_json::Value,
    #[serde(default)]
    pub rationale: String,
}

/// An ordered, credential-tokenised list of atomic browser actions that
/// historically succeeded for a `(domain, step)` pair.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActionSequence {
    pub id: String,
    pub url_domain: String,
    pub step_keywords: Vec<String>,
    pub step_title: String,
    pub actions: Vec<SequenceAction>,
    pub success_count: u32,
    pub failure_count: u32,
    pub confidence: f64,
    pub requires_credentials: bool,
    pub source_run_id: String,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_used_at: Option<DateTime<Utc>>,
}

impl Record for ActionSequence {
    const COLLECTION: &'static str = "action_sequences";

    fn id(&self) -> &str {
        &self.id
    }

    fn validate(&self) -> Result<(), StoreError> {
        if self.url_domain.trim().is_empty() {
            return invalid(Self::COLLECTION, "url_domain", "must not be empty");
        }
        if self.actions.is_empty() {
            return invalid(Self::COLLECTION, "actions", "must not be empty");
        }
        if !(SEQUENCE_CONFIDENCE_FLOOR..=1.0).contains(&self.confidence) {
            return invalid(
                Self::COLLECTION,
                "confidence",
                format!("must be in [{SEQUENCE_CONFIDENCE_FLOOR},1.0], got {}", self.confidence),
            );
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Run metrics
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunMetrics {
    pub id: String,
    pub run_id: String,
    pub task_type: String,
    pub steps_taken: u32,
    pub tool_calls: u32,
    pub rollouts_used: u32,
    pub success: bool,
    pub experiences_used: u32,
    pub experiences_added: u32,
    pub models_created: u32,
    pub models_updated: u32,
    pub observations_created: u32,
    pub failure_count: u32,
    pub duration_ms: u64,
    pub llm_calls_made: u32,
    pub llm_calls_saved: u32,
    pub plan_reused: bool,
    pub steps_from_memory: u32,
    pub created_at: DateTime<Utc>,
}

impl RunMetrics {
    pub fn new(run_id: impl Into<String>, task_type: impl Into<String>) -> Self {
        Self {
            id: new_id(),
            run_id: run_id.into(),
            task_type: task_type.into(),
            steps_taken: 0,
            tool_calls: 0,
            rollouts_used: 0,
            success: false,
            experiences_used: 0,
            experiences_added: 0,
            models_created: 0,
            models_updated: 0,
            observations_created: 0,
            failure_count: 0,
            duration_ms: 0,
            llm_calls_made: 0,
            llm_calls_saved: 0,
            plan_reused: false,
            steps_from_memory: 0,
            created_at: Utc::now(),
        }
    }
}

impl Record for RunMetrics {
    const COLLECTION: &'static str = "run_metrics";

    fn id(&self) -> &str {
        &self.id
    }

    fn validate(&self) -> Result<(), StoreError> {
        if self.run_id.trim().is_empty() {
            return invalid(Self::COLLECTION, "run_id", "must reference a run");
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Identity
// ---------------------------------------------------------------------------

/// Process-wide singleton, recomputed from the collections at run
/// boundaries.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Identity {
    pub id: String,
    pub created_at: DateTime<Utc>,
    pub total_runs: u64,
    pub total_observations: u64,
    pub total_models: u64,
    pub total_experiences: u64,
    #[serde(default)]
    pub domains_seen: Vec<String>,
    pub last_active_at: DateTime<Utc>,
}

impl Default for Identity {
    fn default() -> Self {
        let now = Utc::now();
        Self {
            id: new_id(),
            created_at: now,
            total_runs: 0,
            total_observations: 0,
            total_models: 0,
            total_experiences: 0,
            domains_seen: Vec::new(),
            last_active_at: now,
        }
    }
}

impl Record for Identity {
    const COLLECTION: &'static str = "identity";

    fn id(&self) -> &str {
        &self.id
    }

    fn validate(&self) -> Result<(), StoreError> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn model_confidence_must_match_history() {
        let mut model = MentalModel::candidate(
            "Login requires valid session cookie",
            ModelDomain::SoftwareQa,
            "The app redirects to /login without a session cookie",
            0.5,
            "initial",
            vec![],
        );
        assert!(model.validate().is_ok());

        model.confidence = 0.9;
        assert!(model.validate().is_err());
    }

    #[test]
    fn experience_statement_is_word_bounded() {
        let short = Experience::new("Prefer stable ids over text selectors", vec![], 0.7);
        assert!(short.validate().is_ok());

        let long = Experience::new(
            (0..40).map(|i| format!("w{i}")).collect::<Vec<_>>().join(" "),
            vec![],
            0.7,
        );
        assert!(long.validate().is_err());
    }

    #[test]
    fn failed_outcome_requires_error_message() {
        let mut outcome = ActionOutcome::new("a-1", false, 12);
        assert!(outcome.validate().is_err());
        outcome.error_message = Some("element not found".into());
        assert!(outcome.validate().is_ok());
    }

    #[test]
    fn action_type_round_trips_through_names() {
        for kind in [
            ActionType::NavigateToUrl,
            ActionType::ClickElement,
            ActionType::FillInput,
            ActionType::SubmitForm,
            ActionType::CheckElementVisible,
            ActionType::CaptureScreenshot,
            ActionType::WaitForNetworkIdle,
            ActionType::NoOp,
        ] {
            assert_eq!(ActionType::parse(kind.as_str()), Some(kind));
        }
    }
}
