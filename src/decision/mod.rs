//! The decision engine: single-shot, single-action.
//!
//! Each invocation builds a context from beliefs, experiences, the action
//! history for this step, the last DOM snapshot, and the last vision note,
//! asks the LLM for exactly one atomic action, executes it, persists the
//! action and its outcome, and feeds the outcome back through sensing.
//!
//! Vision analysis is dispatched fire-and-forget with a timeout; its result
//! lands in a slot consumed by the *next* decision. This is a deliberate
//! freshness/latency trade-off: the engine always sees the previous
//! screenshot's analysis, and the hot path never blocks on vision.

pub mod credentials;

use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use serde::Deserialize;
use serde_json::json;
use tracing::{debug, warn};

use crate::browser::{BrowserSession, DomSnapshot};
use crate::llm::{extract_json_block, LlmClient, LlmRequest};
use crate::narration::{NarrationBus, NarrationType};
use crate::planner::PlanStep;
use crate::sensing::{Sensing, SensoryInput};
use crate::store::{
    ActionOutcome, ActionRecord, ActionType, ModelStatus, StoreContext,
};

pub use credentials::{TestCredentials, TokenisedString, PASSWORD_TOKEN, USERNAME_TOKEN};

/// Action records offered to the LLM as recent history.
pub const RECENT_ACTION_WINDOW: usize = 8;
/// Identical consecutive actions that count as a loop.
pub const STUCK_LOOP_THRESHOLD: usize = 3;
/// Outcomes kept when the per-step history is reset.
pub const CARRYOVER_OUTCOMES: usize = 2;
/// Mental models below this confidence stay out of the context.
pub const MODEL_CONFIDENCE_THRESHOLD: f64 = 0.5;
/// Context caps.
pub const MAX_CONTEXT_MODELS: usize = 5;
pub const MAX_CONTEXT_EXPERIENCES: usize = 5;
/// Budget for the background vision task.
pub const VISION_TIMEOUT: Duration = Duration::from_secs(8);

/// One decided (but maybe not yet executed) atomic action. The `value`
/// field holds the raw execution value; callers tokenise or mask before
/// anything is stored or narrated.
#[derive(Clone)]
pub struct PlannedAction {
    pub kind: ActionType,
    pub selector: Option<String>,
    pub value: Option<String>,
    pub rationale: String,
    pub expected_outcome: String,
}

impl PlannedAction {
    pub fn no_op(rationale: impl Into<String>) -> Self {
        Self {
            kind: ActionType::NoOp,
            selector: None,
            value: None,
            rationale: rationale.into(),
            expected_outcome: "nothing changes".to_string(),
        }
    }
}

/// Execution result of one atomic action. Deterministic failures (bad
/// selector, navigation error) are data, not errors: the engine does not
/// retry, a higher layer may.
#[derive(Debug, Clone, Default)]
pub struct ExecutionResult {
    pub success: bool,
    pub duration_ms: u64,
    pub error: Option<String>,
    pub screenshots: Vec<String>,
}

/// Execute one atomic action against the session. Shared by the decision
/// engine and the sequence-cache replay path.
pub async fn perform_action(
    session: &BrowserSession,
    kind: ActionType,
    selector: Option<&str>,
    value: Option<&str>,
) -> ExecutionResult {
    let started = Instant::now();
    let mut result = ExecutionResult::default();

    let outcome: Result<(), String> = match kind {
        ActionType::NavigateToUrl => {
            let url = value.or(selector).unwrap_or_default();
            session.navigate(url).await.map_err(|e| e.to_string())
        }
        ActionType::ClickElement => match selector {
            Some(selector) => session.click(selector).await.map_err(|e| e.to_string()),
            None => Err("click_element requires a selector".to_string()),
        },
        ActionType::FillInput => match (selector, value) {
            (Some(selector), Some(value)) => {
                session.fill(selector, value).await.map_err(|e| e.to_string())
            }
            _ => Err("fill_input requires a selector and a value".to_string()),
        },
        ActionType::SubmitForm => {
            let selector = selector.unwrap_or("form");
            session.submit(selector).await.map_err(|e| e.to_string())
        }
        ActionType::CheckElementVisible => match selector {
            Some(selector) => match session.check_visible(selector).await {
                Ok(true) => Ok(()),
                Ok(false) => Err(format!("element not visible: {selector}")),
                Err(e) => Err(e.to_string()),
            },
            None => Err("check_element_visible requires a selector".to_string()),
        },
        ActionType::CaptureScreenshot => session
            .take_screenshot(true, selector)
            .await
            .map(|path| {
                result.screenshots.push(path.to_string_lossy().into_owned());
            })
            .map_err(|e| e.to_string()),
        ActionType::WaitForNetworkIdle => session
            .wait_for_network_idle()
            .await
            .map_err(|e| e.to_string()),
        ActionType::NoOp => Ok(()),
    };

    // post-action evidence screenshot, best effort
    if kind != ActionType::CaptureScreenshot && kind != ActionType::NoOp {
        if let Ok(path) = session.take_screenshot(false, None).await {
            result.screenshots.push(path.to_string_lossy().into_owned());
        }
    }

    result.duration_ms = started.elapsed().as_millis() as u64;
    match outcome {
        Ok(()) => result.success = true,
        Err(message) => {
            result.success = false;
            result.error = Some(message);
        }
    }
    result
}

#[derive(Debug, Clone, PartialEq)]
struct ActionTrace {
    kind: ActionType,
    selector: Option<String>,
    value_masked: Option<String>,
    success: bool,
}

/// Everything the controller needs back from one decision cycle.
pub struct DecisionOutcome {
    pub action: ActionRecord,
    pub outcome: ActionOutcome,
    pub kind: ActionType,
    pub selector: Option<String>,
    /// Tokenised value, safe to store in a sequence.
    pub value_template: Option<String>,
    pub rationale: String,
    pub success: bool,
    pub dom: Option<DomSnapshot>,
    pub models_used: Vec<String>,
    pub experiences_used: Vec<String>,
    pub llm_called: bool,
}

/// Per-run decision engine. Holds the step-local action history, the last
/// DOM snapshot, and the vision slot.
pub struct DecisionEngine {
    run_id: String,
    store: Arc<StoreContext>,
    llm: Arc<LlmClient>,
    narration: Arc<NarrationBus>,
    sensing: Arc<Sensing>,
    credentials: Arc<TestCredentials>,
    vision_slot: Arc<Mutex<Option<String>>>,
    last_dom: Mutex<Option<DomSnapshot>>,
    history: Mutex<Vec<ActionTrace>>,
}

impl DecisionEngine {
    pub fn new(
        run_id: &str,
        store: Arc<StoreContext>,
        llm: Arc<LlmClient>,
        narration: Arc<NarrationBus>,
        sensing: Arc<Sensing>,
        credentials: Arc<TestCredentials>,
    ) -> Self {
        Self {
            run_id: run_id.to_string(),
            store,
            llm,
            narration,
            sensing,
            credentials,
            vision_slot: Arc::new(Mutex::new(None)),
            last_dom: Mutex::new(None),
            history: Mutex::new(Vec::new()),
        }
    }

    /// True iff the last `threshold` actions share type, selector, and
    /// value. The orchestrator consults this to break hopeless cycles.
    pub fn is_stuck_in_loop(&self, threshold: usize) -> bool {
        let history = self.history.lock();
        if history.len() < threshold {
            return false;
        }
        let tail = &history[history.len() - threshold..];
        let first = &tail[0];
        tail.iter().all(|trace| {
            trace.kind == first.kind
                && trace.selector == first.selector
                && trace.value_masked == first.value_masked
        })
    }

    /// Reset the per-step history, keeping the last few outcomes for
    /// cross-step continuity.
    pub fn reset_step_history(&self) {
        let mut history = self.history.lock();
        let keep_from = history.len().saturating_sub(CARRYOVER_OUTCOMES);
        history.drain(..keep_from);
    }

    pub fn seed_dom(&self, dom: DomSnapshot) {
        *self.last_dom.lock() = Some(dom);
    }

    pub fn last_dom(&self) -> Option<DomSnapshot> {
        self.last_dom.lock().clone()
    }

    /// One sense-decide-act cycle. Never errors out of an LLM failure: the
    /// degraded decision is a `no_op` naming the failure.
    pub async fn decide_and_act(
        &self,
        session: &BrowserSession,
        goal: &str,
        step: &PlanStep,
    ) -> anyhow::Result<DecisionOutcome> {
        // vision from the previous cycle, if the background task landed it
        let vision_note = self.vision_slot.lock().take();
        let (prompt, models_used, experiences_used) =
            self.build_context(goal, step, vision_note.as_deref()).await?;

        let (planned, llm_called) = match self.llm.generate(&LlmRequest::json(prompt)).await {
            Ok(response) => match parse_planned_action(&response.text) {
                Ok(planned) => (planned, true),
                Err(err) => {
                    warn!(error = %err, "decision response unparseable; degrading to no_op");
                    (
                        PlannedAction::no_op(format!("decision response unparseable: {err}")),
                        true,
                    )
                }
            },
            Err(err) => {
                warn!(error = %err, "decision LLM failed; degrading to no_op");
                (
                    PlannedAction::no_op(format!("decision LLM unavailable: {err}")),
                    true,
                )
            }
        };

        let outcome = self
            .execute_planned(session, step, planned, models_used, experiences_used, llm_called)
            .await?;
        Ok(outcome)
    }

    /// Execute an already-decided action and do the book-keeping. The
    /// replay path uses this directly, bypassing the LLM.
    pub async fn execute_planned(
        &self,
        session: &BrowserSession,
        step: &PlanStep,
        planned: PlannedAction,
        models_used: Vec<String>,
        experiences_used: Vec<String>,
        llm_called: bool,
    ) -> anyhow::Result<DecisionOutcome> {
        let masked_value = planned
            .value
            .as_deref()
            .map(|v| self.credentials.mask(&self.credentials.detokenise(v)));

        let mut record = ActionRecord::new(&self.run_id, planned.kind, &planned.rationale);
        record.expected_outcome = planned.expected_outcome.clone();
        record.inputs = json!({
            "selector": planned.selector,
            "value": masked_value,
            "step_id": step.step_id,
        });
        let record = self.store.actions.create(record).await?;

        self.narration.emit(
            NarrationType::ActionStarted,
            Some(&self.run_id),
            format!(
                "I am performing {} for step {:?}",
                planned.kind.as_str(),
                step.title
            ),
            Some(json!({
                "action_id": record.id,
                "action": planned.kind.as_str(),
                "selector": planned.selector,
            })),
        );

        let raw_value = planned
            .value
            .as_deref()
            .map(|v| self.credentials.detokenise(v));
        let exec = perform_action(
            session,
            planned.kind,
            planned.selector.as_deref(),
            raw_value.as_deref(),
        )
        .await;

        let dom = session.extract_dom().await.ok();
        if let Some(dom) = &dom {
            *self.last_dom.lock() = Some(dom.clone());
        }

        let console = session.console_logs(true);
        let network = session.network_errors(true);

        let mut outcome = ActionOutcome::new(&record.id, exec.success, exec.duration_ms);
        outcome.error_message = exec.error.clone();
        outcome.artifacts.screenshots = exec.screenshots.clone();
        outcome.artifacts.logs = console
            .iter()
            .map(|c| format!("[{}] {}", c.level, c.text))
            .collect();
        outcome.artifacts.network_errors = network
            .iter()
            .map(|n| match n.status {
                Some(status) => format!("{} {} ({})", status, n.url, n.error),
                None => format!("{} ({})", n.url, n.error),
            })
            .collect();
        outcome.artifacts.dom_snapshot = dom.as_ref().and_then(|d| serde_json::to_value(d).ok());
        let outcome = self.store.outcomes.create(outcome).await?;

        for screenshot in &exec.screenshots {
            self.narration.emit(
                NarrationType::EvidenceCaptured,
                Some(&self.run_id),
                "I captured a screenshot as evidence",
                Some(json!({ "path": screenshot })),
            );
        }
        self.narration.emit(
            NarrationType::ActionCompleted,
            Some(&self.run_id),
            match (&exec.success, &exec.error) {
                (true, _) => format!("I completed {} successfully", planned.kind.as_str()),
                (false, Some(error)) => {
                    format!("I could not complete {}: {error}", planned.kind.as_str())
                }
                (false, None) => format!("I could not complete {}", planned.kind.as_str()),
            },
            Some(json!({
                "action_id": record.id,
                "success": exec.success,
                "duration_ms": exec.duration_ms,
            })),
        );

        // fire-and-forget vision for the freshest screenshot; the result is
        // consumed by the NEXT decision, never awaited here
        if let Some(path) = exec.screenshots.last() {
            self.dispatch_vision(path.clone());
        }

        self.feed_back_through_sensing(&planned, &exec, &console, &network)
            .await;

        self.history.lock().push(ActionTrace {
            kind: planned.kind,
            selector: planned.selector.clone(),
            value_masked: masked_value,
            success: exec.success,
        });

        let value_template = planned
            .value
            .as_deref()
            .map(|v| self.credentials.tokenise(&self.credentials.detokenise(v)));

        Ok(DecisionOutcome {
            action: record,
            success: outcome.success,
            outcome,
            kind: planned.kind,
            selector: planned.selector,
            value_template,
            rationale: planned.rationale,
            dom,
            models_used,
            experiences_used,
            llm_called,
        })
    }

    fn dispatch_vision(&self, screenshot_path: String) {
        let llm = self.llm.clone();
        let slot = self.vision_slot.clone();
        tokio::spawn(async move {
            let png = match tokio::fs::read(&screenshot_path).await {
                Ok(png) => png,
                Err(_) => return,
            };
            let analysis = tokio::time::timeout(
                VISION_TIMEOUT,
                llm.describe_image(
                    &png,
                    "Describe this web page screenshot for a QA agent: visible state, \
                     error messages, and the most relevant interactive elements.",
                ),
            )
            .await;
            match analysis {
                Ok(Ok(text)) => *slot.lock() = Some(text),
                Ok(Err(err)) => debug!(error = %err, "vision analysis failed; skipped"),
                Err(_) => debug!("vision analysis timed out; skipped"),
            }
        });
    }

    async fn feed_back_through_sensing(
        &self,
        planned: &PlannedAction,
        exec: &ExecutionResult,
        console: &[crate::browser::ConsoleEntry],
        network: &[crate::browser::NetworkFailure],
    ) {
        let mut lines = vec![match (&exec.success, &exec.error) {
            (true, _) => format!("action {} succeeded in {}ms", planned.kind.as_str(), exec.duration_ms),
            (false, Some(error)) => format!("action {} failed: {error}", planned.kind.as_str()),
            (false, None) => format!("action {} failed", planned.kind.as_str()),
        }];
        for entry in console.iter().filter(|c| c.level == "error" || c.level == "warn") {
            lines.push(format!("console {}: {}", entry.level, self.credentials.mask(&entry.text)));
        }
        for failure in network {
            lines.push(match failure.status {
                Some(status) => format!("network error {} on {}", status, failure.url),
                None => format!("network failure on {}: {}", failure.url, failure.error),
            });
        }

        let ingest = self
            .sensing
            .ingest(
                SensoryInput::Log {
                    content: lines.join("\n"),
                    source: "decision_engine".to_string(),
                },
                Some(&self.run_id),
            )
            .await;
        if let Err(err) = ingest {
            warn!(error = %err, "sensing feedback failed");
        }
    }

    async fn build_context(
        &self,
        goal: &str,
        step: &PlanStep,
        vision_note: Option<&str>,
    ) -> anyhow::Result<(String, Vec<String>, Vec<String>)> {
        let mut models = self
            .store
            .models
            .list(|m| {
                m.status != ModelStatus::Deprecated && m.confidence >= MODEL_CONFIDENCE_THRESHOLD
            })
            .await?;
        models.sort_by(|a, b| b.confidence.partial_cmp(&a.confidence).unwrap_or(std::cmp::Ordering::Equal));
        models.truncate(MAX_CONTEXT_MODELS);

        let step_words: Vec<String> = format!("{} {}", goal, step.title)
            .to_lowercase()
            .split_whitespace()
            .map(str::to_string)
            .collect();
        let mut experiences = self.store.experiences.list_all().await?;
        experiences.sort_by(|a, b| {
            let overlap = |e: &crate::store::Experience| {
                e.scope
                    .iter()
                    .filter(|s| step_words.contains(&s.to_lowercase()))
                    .count()
            };
            overlap(b)
                .cmp(&overlap(a))
                .then(b.confidence.partial_cmp(&a.confidence).unwrap_or(std::cmp::Ordering::Equal))
        });
        experiences.truncate(MAX_CONTEXT_EXPERIENCES);

        let model_ids = models.iter().map(|m| m.id.clone()).collect();
        let experience_ids = experiences.iter().map(|e| e.id.clone()).collect();

        let beliefs_block = if models.is_empty() {
            "(nothing yet)".to_string()
        } else {
            models
                .iter()
                .map(|m| format!("- {} (confidence {:.2}): {}", m.title, m.confidence, m.summary))
                .collect::<Vec<_>>()
                .join("\n")
        };
        let experiences_block = if experiences.is_empty() {
            "(none yet)".to_string()
        } else {
            experiences
                .iter()
                .map(|e| format!("- {}", e.statement))
                .collect::<Vec<_>>()
                .join("\n")
        };

        let history_block = {
            let history = self.history.lock();
            if history.is_empty() {
                "(no actions taken yet this step)".to_string()
            } else {
                history
                    .iter()
                    .rev()
                    .take(RECENT_ACTION_WINDOW)
                    .rev()
                    .map(|trace| {
                        format!(
                            "- {} selector={} value={} -> {}",
                            trace.kind.as_str(),
                            trace.selector.as_deref().unwrap_or("-"),
                            trace.value_masked.as_deref().unwrap_or("-"),
                            if trace.success { "ok" } else { "failed" }
                        )
                    })
                    .collect::<Vec<_>>()
                    .join("\n")
            }
        };

        let dom_block = self
            .last_dom
            .lock()
            .as_ref()
            .and_then(|dom| serde_json::to_string(dom).ok())
            .unwrap_or_else(|| "(no snapshot yet; navigate first)".to_string());

        let credentials_block = self
            .credentials
            .prompt_block()
            .unwrap_or_else(|| "(no test credentials configured)".to_string());

        let prompt = format!(
            "You are driving a real browser through a QA test plan.\n\
Goal: {goal}\nCurrent step: {title}\nStep description: {description}\n\
Expected results: {expected:?}\n\n\
What I believe about this application:\n{beliefs}\n\n\
Heuristics that worked before:\n{experiences}\n\n\
Actions already taken this step:\n{history}\n\n\
Current DOM snapshot:\n{dom}\n\n\
Latest screenshot analysis:\n{vision}\n\n\
{credentials}\n\n\
Choose exactly one next action. Respond with a JSON object: \
{{\"action\" (navigate_to_url|click_element|fill_input|submit_form|\
check_element_visible|capture_screenshot|wait_for_network_idle|no_op),\
\"selector\",\"value\",\"rationale\",\"expected_outcome\"}}. \
Use CSS selectors from the snapshot. Never invent selectors.",
            title = step.title,
            description = step.description,
            expected = step.expected_results,
            beliefs = beliefs_block,
            experiences = experiences_block,
            history = history_block,
            dom = dom_block,
            vision = vision_note.unwrap_or("(not available yet)"),
            credentials = credentials_block,
        );

        Ok((prompt, model_ids, experience_ids))
    }
}

#[derive(Debug, Deserialize)]
struct RawDecision {
    action: String,
    #[serde(default)]
    selector: Option<String>,
    #[serde(default)]
    value: Option<String>,
    #[serde(default)]
    rationale: String,
    #[serde(default)]
    expected_outcome: String,
}

fn parse_planned_action(text: &str) -> anyhow::Result<PlannedAction> {
    let raw: RawDecision = serde_json::from_str(extract_json_block(text))?;
    let kind = ActionType::parse(&raw.action)
        .ok_or_else(|| anyhow::anyhow!("unknown action type: {}", raw.action))?;
    Ok(PlannedAction {
        kind,
        selector: raw.selector.filter(|s| !s.trim().is_empty()),
        value: raw.value.filter(|v| !v.trim().is_empty()),
        rationale: raw.rationale,
        expected_outcome: raw.expected_outcome,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::browser::testing::ScriptedPage;
    use crate::config::NoemaConfig;
    use crate::llm::MockClient;
    use crate::narration::CredentialMasker;
    use crate::planner::{PlanStep, StepPriority};
    use crate::sensing::ObservationBus;

    fn temp_store() -> Arc<StoreContext> {
        let dir = std::env::temp_dir().join(format!("noema_test_{}", uuid::Uuid::new_v4()));
        Arc::new(StoreContext::open(dir).unwrap())
    }

    fn step() -> PlanStep {
        PlanStep {
            step_id: "step_1".into(),
            title: "Login with valid credentials".into(),
            description: "Authenticate with the configured test credentials".into(),
            test_steps: vec![],
            expected_results: vec!["inventory".into()],
            action_hint: ActionType::FillInput,
            expected_outcome: "logged in".into(),
            failure_indicator: "error message visible".into(),
            priority: StepPriority::Critical,
        }
    }

    fn engine_with(
        store: Arc<StoreContext>,
        mock: MockClient,
        credentials: TestCredentials,
    ) -> (DecisionEngine, Arc<NarrationBus>) {
        let narration = Arc::new(NarrationBus::new(CredentialMasker::new(vec![
            "standard_user".into(),
            "secret_sauce".into(),
        ])));
        let sensing = Arc::new(Sensing::new(
            store.clone(),
            Arc::new(ObservationBus::new()),
            None,
        ));
        let engine = DecisionEngine::new(
            "run-1",
            store,
            Arc::new(LlmClient::Mock(mock)),
            narration.clone(),
            sensing,
            Arc::new(credentials),
        );
        (engine, narration)
    }

    fn session() -> (Arc<ScriptedPage>, Arc<BrowserSession>) {
        let dir = std::env::temp_dir().join(format!("noema_test_{}", uuid::Uuid::new_v4()));
        std::fs::create_dir_all(dir.join("screenshots")).unwrap();
        std::fs::create_dir_all(dir.join("videos")).unwrap();
        let page = Arc::new(ScriptedPage::new());
        let session = BrowserSession::with_driver("run-1", page.clone(), &dir);
        (page, session)
    }

    fn credentials() -> TestCredentials {
        let mut config = NoemaConfig::default();
        config.test_username = Some("standard_user".into());
        config.test_password = Some("secret_sauce".into());
        TestCredentials::from_config(&config)
    }

    #[tokio::test]
    async fn decision_executes_and_persists_action_and_outcome() {
        let store = temp_store();
        let mock = MockClient::with_responses(vec![
            r##"{"action":"fill_input","selector":"#user-name","value":"standard_user","rationale":"enter username","expected_outcome":"field filled"}"##.into(),
        ]);
        let (engine, _) = engine_with(store.clone(), mock, credentials());
        let (page, session) = session();

        let outcome = engine
            .decide_and_act(&session, "Test login", &step())
            .await
            .unwrap();

        assert!(outcome.success);
        assert!(outcome.llm_called);
        assert_eq!(outcome.kind, ActionType::FillInput);
        assert_eq!(store.actions.count().await.unwrap(), 1);
        assert_eq!(store.outcomes.count().await.unwrap(), 1);
        // the fake received the raw value, the store only the masked one
        assert!(page.actions().iter().any(|a| a == "fill #user-name=standard_user"));
        let record = store.actions.list_all().await.unwrap().remove(0);
        assert!(!record.inputs.to_string().contains("standard_user"));
        // credential in the value template is tokenised
        assert_eq!(outcome.value_template.as_deref(), Some("${username}"));
    }

    #[tokio::test]
    async fn llm_outage_degrades_to_no_op_with_named_failure() {
        let store = temp_store();
        let (engine, _) = engine_with(store.clone(), MockClient::failing(503), credentials());
        let (_, session) = session();

        let outcome = engine
            .decide_and_act(&session, "Test login", &step())
            .await
            .unwrap();

        assert_eq!(outcome.kind, ActionType::NoOp);
        assert!(outcome.success);
        assert!(outcome.rationale.contains("decision LLM unavailable"));
        assert!(outcome.rationale.contains("503"));
    }

    #[tokio::test]
    async fn stuck_loop_detection_requires_identical_triples() {
        let store = temp_store();
        let responses = vec![
            r##"{"action":"click_element","selector":"#login","rationale":"r","expected_outcome":"e"}"##.to_string();
            3
        ];
        let (engine, _) = engine_with(store, MockClient::with_responses(responses), credentials());
        let (_, session) = session();

        for _ in 0..2 {
            engine.decide_and_act(&session, "g", &step()).await.unwrap();
        }
        assert!(!engine.is_stuck_in_loop(STUCK_LOOP_THRESHOLD));
        engine.decide_and_act(&session, "g", &step()).await.unwrap();
        assert!(engine.is_stuck_in_loop(STUCK_LOOP_THRESHOLD));

        engine.reset_step_history();
        assert!(!engine.is_stuck_in_loop(STUCK_LOOP_THRESHOLD));
    }

    #[tokio::test]
    async fn deterministic_failure_is_an_outcome_not_an_error() {
        let store = temp_store();
        let mock = MockClient::with_responses(vec![
            r##"{"action":"click_element","selector":"#missing","rationale":"r","expected_outcome":"e"}"##.into(),
        ]);
        let (engine, _) = engine_with(store.clone(), mock, credentials());
        let (page, session) = session();
        page.fail_selector("#missing");

        let outcome = engine.decide_and_act(&session, "g", &step()).await.unwrap();
        assert!(!outcome.success);
        assert!(outcome.outcome.error_message.as_deref().unwrap().contains("#missing"));
    }

    #[tokio::test]
    async fn narration_from_decisions_never_contains_credentials() {
        let store = temp_store();
        let mock = MockClient::with_responses(vec![
            r##"{"action":"fill_input","selector":"#password","value":"secret_sauce","rationale":"typing secret_sauce","expected_outcome":"filled"}"##.into(),
        ]);
        let (engine, narration) = engine_with(store, mock, credentials());
        let (_, session) = session();

        engine.decide_and_act(&session, "g", &step()).await.unwrap();
        for event in narration.history(None) {
            assert!(!event.message.contains("secret_sauce"), "{}", event.message);
            if let Some(data) = &event.data {
                assert!(!data.to_string().contains("secret_sauce"));
            }
        }
    }
}
