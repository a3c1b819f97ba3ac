//! Plan generation: one-shot production of a prioritised, ordered test-case
//! list from goal + URL + current beliefs and experiences.
//!
//! The primary path asks the LLM; any failure (transport, outage, or a
//! malformed plan) falls back to a rule engine that expands goal keywords
//! into a fixed library of QA test cases, happy and negative. Either way
//! the plan is trimmed to the action budget before it is returned.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::config::RunBudgets;
use crate::llm::{extract_json_block, LlmClient, LlmRequest};
use crate::store::{ActionType, ModelStatus, StoreContext};

/// Estimated browser actions per plan step, for report sizing.
pub const ESTIMATED_ACTIONS_PER_STEP: u32 = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepPriority {
    Critical,
    Important,
    NiceToHave,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GeneratedBy {
    Llm,
    BuiltIn,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlanStep {
    pub step_id: String,
    pub title: String,
    pub description: String,
    #[serde(default)]
    pub test_steps: Vec<String>,
    #[serde(default)]
    pub expected_results: Vec<String>,
    pub action_hint: ActionType,
    pub expected_outcome: String,
    pub failure_indicator: String,
    pub priority: StepPriority,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TestPlan {
    pub title: String,
    pub rationale: String,
    pub steps: Vec<PlanStep>,
    pub total_steps: usize,
    pub estimated_actions: u32,
    pub generated_by: GeneratedBy,
}

pub struct PlanGenerator {
    store: Arc<StoreContext>,
    llm: Arc<LlmClient>,
}

impl PlanGenerator {
    pub fn new(store: Arc<StoreContext>, llm: Arc<LlmClient>) -> Self {
        Self { store, llm }
    }

    /// Produce a plan. Never fails: the built-in rule engine is always
    /// available as the degraded path.
    pub async fn generate(&self, goal: &str, url: &str, budgets: &RunBudgets) -> TestPlan {
        let steps = match self.generate_with_llm(goal, url).await {
            Ok(steps) if !steps.is_empty() => {
                info!(steps = steps.len(), "plan generated by LLM");
                return self.finalise(goal, steps, GeneratedBy::Llm, budgets);
            }
            Ok(_) => {
                warn!("LLM produced an empty plan; using built-in test cases");
                built_in_steps(goal)
            }
            Err(err) => {
                warn!(error = %err, "plan LLM unavailable; using built-in test cases");
                built_in_steps(goal)
            }
        };
        self.finalise(goal, steps, GeneratedBy::BuiltIn, budgets)
    }

    fn finalise(
        &self,
        goal: &str,
        steps: Vec<PlanStep>,
        generated_by: GeneratedBy,
        budgets: &RunBudgets,
    ) -> TestPlan {
        let steps = trim_to_budget(steps, budgets);
        let total_steps = steps.len();
        TestPlan {
            title: format!("Test plan: {goal}"),
            rationale: match generated_by {
                GeneratedBy::Llm => "Derived from the goal and accumulated knowledge".to_string(),
                GeneratedBy::BuiltIn => {
                    "Derived from goal keywords via the built-in QA test-case library".to_string()
                }
            },
            steps,
            total_steps,
            estimated_actions: total_steps as u32 * ESTIMATED_ACTIONS_PER_STEP,
            generated_by,
        }
    }

    async fn generate_with_llm(&self, goal: &str, url: &str) -> anyhow::Result<Vec<PlanStep>> {
        let beliefs = self
            .store
            .models
            .list(|m| m.status == ModelStatus::Active)
            .await?
            .into_iter()
            .take(8)
            .map(|m| format!("- {} (confidence {:.2})", m.title, m.confidence))
            .collect::<Vec<_>>()
            .join("\n");
        let experiences = self
            .store
            .experiences
            .list_all()
            .await?
            .into_iter()
            .take(8)
            .map(|e| format!("- {}", e.statement))
            .collect::<Vec<_>>()
            .join("\n");

        let prompt = format!(
            "Design a prioritised QA test plan for a web application.\n\
Goal: {goal}\nTarget URL: {url}\n\n\
What I currently believe about this application:\n{beliefs}\n\n\
Heuristics from previous runs:\n{experiences}\n\n\
Respond with a JSON object: {{\"title\",\"rationale\",\"steps\":[{{\
\"title\",\"description\",\"test_steps\":[],\"expected_results\":[],\
\"action_hint\" (one of navigate_to_url|click_element|fill_input|submit_form|\
check_element_visible|capture_screenshot|wait_for_network_idle),\
\"expected_outcome\",\"failure_indicator\",\
\"priority\" (critical|important|nice_to_have)}}]}}.\n\
The first step must navigate to the target URL and the last step must verify \
the final application state. Include at least one negative test case.",
            beliefs = if beliefs.is_empty() { "(nothing yet)".to_string() } else { beliefs },
            experiences = if experiences.is_empty() { "(none yet)".to_string() } else { experiences },
        );

        let response = self.llm.generate(&LlmRequest::json(prompt)).await?;
        let parsed: LlmPlan = serde_json::from_str(extract_json_block(&response.text))?;

        let steps = parsed
            .steps
            .into_iter()
            .enumerate()
            .map(|(index, draft)| PlanStep {
                step_id: format!("step_{}", index + 1),
                title: draft.title,
                description: draft.description,
                test_steps: draft.test_steps,
                expected_results: draft.expected_results,
                action_hint: draft
                    .action_hint
                    .as_deref()
                    .and_then(ActionType::parse)
                    .unwrap_or(ActionType::CheckElementVisible),
                expected_outcome: draft.expected_outcome,
                failure_indicator: draft.failure_indicator,
                priority: match draft.priority.as_deref() {
                    Some("critical") => StepPriority::Critical,
                    Some("nice_to_have") => StepPriority::NiceToHave,
                    _ => StepPriority::Important,
                },
            })
            .collect();
        Ok(steps)
    }
}

#[derive(Debug, Deserialize)]
struct LlmPlan {
    #[serde(default)]
    steps: Vec<LlmPlanStep>,
}

#[derive(Debug, Deserialize)]
struct LlmPlanStep {
    title: String,
    #[serde(default)]
    description: String,
    #[serde(default)]
    test_steps: Vec<String>,
    #[serde(default)]
    expected_results: Vec<String>,
    #[serde(default)]
    action_hint: Option<String>,
    #[serde(default)]
    expected_outcome: String,
    #[serde(default)]
    failure_indicator: String,
    #[serde(default)]
    priority: Option<String>,
}

/// Budget-trim: `max_steps = max(3, max_total_actions / max_cycles_per_step)`.
/// The first (navigation) and last (final verification) steps are pinned;
/// the middle is kept in priority order.
pub fn trim_to_budget(steps: Vec<PlanStep>, budgets: &RunBudgets) -> Vec<PlanStep> {
    let max_steps = std::cmp::max(
        3,
        (budgets.max_total_actions / budgets.max_cycles_per_step.max(1)) as usize,
    );
    if steps.len() <= max_steps {
        return renumber(steps);
    }

    let mut steps = steps;
    let last = steps.pop().expect("non-empty plan");
    let first = steps.remove(0);

    let mut middle: Vec<(usize, PlanStep)> = steps.into_iter().enumerate().collect();
    // stable by original position within the same priority
    middle.sort_by(|a, b| a.1.priority.cmp(&b.1.priority).then(a.0.cmp(&b.0)));
    middle.truncate(max_steps.saturating_sub(2));
    middle.sort_by_key(|(index, _)| *index);

    let mut trimmed = Vec::with_capacity(max_steps);
    trimmed.push(first);
    trimmed.extend(middle.into_iter().map(|(_, step)| step));
    trimmed.push(last);
    renumber(trimmed)
}

fn renumber(mut steps: Vec<PlanStep>) -> Vec<PlanStep> {
    for (index, step) in steps.iter_mut().enumerate() {
        step.step_id = format!("step_{}", index + 1);
    }
    steps
}

fn step(
    title: &str,
    description: &str,
    action_hint: ActionType,
    expected_results: &[&str],
    failure_indicator: &str,
    priority: StepPriority,
) -> PlanStep {
    PlanStep {
        step_id: String::new(),
        title: title.to_string(),
        description: description.to_string(),
        test_steps: Vec::new(),
        expected_results: expected_results.iter().map(|s| s.to_string()).collect(),
        action_hint,
        expected_outcome: expected_results.first().unwrap_or(&"").to_string(),
        failure_indicator: failure_indicator.to_string(),
        priority,
    }
}

/// Fixed QA test-case library, keyed on goal keywords. Happy paths plus
/// the matching negative cases.
pub fn built_in_steps(goal: &str) -> Vec<PlanStep> {
    let lower = goal.to_lowercase();
    let mut steps = vec![step(
        "Navigate to the target site",
        "Open the target URL and confirm the page renders",
        ActionType::NavigateToUrl,
        &["page title", "no error"],
        "navigation failed",
        StepPriority::Critical,
    )];

    if lower.contains("login") || lower.contains("log in") || lower.contains("sign in") {
        steps.push(step(
            "Login with invalid credentials",
            "Submit the login form with a wrong password and expect a visible error",
            ActionType::FillInput,
            &["error", "invalid"],
            "logged in without valid credentials",
            StepPriority::Important,
        ));
        steps.push(step(
            "Login with valid credentials",
            "Authenticate with the configured test credentials",
            ActionType::FillInput,
            &["inventory", "dashboard", "welcome", "logout"],
            "error message visible after login",
            StepPriority::Critical,
        ));
    }

    if lower.contains("product") || lower.contains("catalog") {
        steps.push(step(
            "Open a product detail page",
            "Click through to a product detail view",
            ActionType::ClickElement,
            &["price", "description"],
            "detail page failed to render",
            StepPriority::Important,
        ));
    }

    if lower.contains("cart") || lower.contains("basket") {
        steps.push(step(
            "Add a product to cart",
            "Add the first listed product to the shopping cart",
            ActionType::ClickElement,
            &["cart", "badge", "1"],
            "cart badge did not change",
            StepPriority::Critical,
        ));
        steps.push(step(
            "Verify cart contents",
            "Open the cart and confirm the added product is listed",
            ActionType::ClickElement,
            &["cart", "item", "checkout"],
            "cart is empty",
            StepPriority::Important,
        ));
    }

    if lower.contains("checkout") || lower.contains("purchase") || lower.contains("order") {
        steps.push(step(
            "Proceed to checkout",
            "Start the checkout flow from the cart",
            ActionType::ClickElement,
            &["checkout", "information"],
            "checkout did not open",
            StepPriority::Critical,
        ));
        steps.push(step(
            "Submit checkout with missing fields",
            "Submit the checkout form with required fields empty and expect an error",
            ActionType::SubmitForm,
            &["error", "required"],
            "order accepted with missing fields",
            StepPriority::Important,
        ));
        steps.push(step(
            "Complete checkout with valid details",
            "Fill the checkout form with valid data and finish the order",
            ActionType::SubmitForm,
            &["complete", "thank you", "confirmation"],
            "order failed",
            StepPriority::Critical,
        ));
    }

    if lower.contains("form") && !lower.contains("login") {
        steps.push(step(
            "Submit the form with invalid data",
            "Submit the main form with invalid values and expect validation errors",
            ActionType::SubmitForm,
            &["error", "invalid", "required"],
            "form accepted invalid data",
            StepPriority::Important,
        ));
        steps.push(step(
            "Submit the form with valid data",
            "Fill and submit the main form with valid values",
            ActionType::SubmitForm,
            &["success", "submitted", "thank"],
            "form submission failed",
            StepPriority::Critical,
        ));
    }

    if lower.contains("nav") || lower.contains("menu") || lower.contains("browse") {
        steps.push(step(
            "Exercise primary navigation links",
            "Open the main navigation entries and confirm each page renders",
            ActionType::ClickElement,
            &["page", "heading"],
            "navigation target failed to render",
            StepPriority::NiceToHave,
        ));
    }

    if lower.contains("login") || lower.contains("logout") || lower.contains("sign out") {
        steps.push(step(
            "Logout from the application",
            "End the session and confirm the login page returns",
            ActionType::ClickElement,
            &["login", "sign in"],
            "still logged in after logout",
            StepPriority::Important,
        ));
    }

    steps.push(step(
        "Verify final application state",
        "Capture final evidence and confirm no error messages remain",
        ActionType::CaptureScreenshot,
        &["no error"],
        "error message visible",
        StepPriority::Important,
    ));

    steps
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::MockClient;

    fn temp_store() -> Arc<StoreContext> {
        let dir = std::env::temp_dir().join(format!("noema_test_{}", uuid::Uuid::new_v4()));
        Arc::new(StoreContext::open(dir).unwrap())
    }

    #[test]
    fn login_and_cart_goal_expands_to_full_flow() {
        let steps = built_in_steps("Test login and cart flow");
        let titles: Vec<&str> = steps.iter().map(|s| s.title.as_str()).collect();
        assert!(steps.len() >= 6);
        assert!(titles.iter().any(|t| t.contains("Navigate")));
        assert!(titles.iter().any(|t| t.contains("Login with invalid credentials")));
        assert!(titles.iter().any(|t| t.contains("Login with valid credentials")));
        assert!(titles.iter().any(|t| t.contains("Add a product to cart")));
        assert!(titles.iter().any(|t| t.contains("Verify cart contents")));
        assert!(titles.iter().any(|t| t.contains("Logout")));
    }

    #[test]
    fn trim_pins_first_and_last_and_sorts_middle_by_priority() {
        let steps = built_in_steps("Test login, cart, checkout, product, form, nav flow");
        assert!(steps.len() > 5);
        let budgets = RunBudgets {
            max_total_actions: 20,
            max_cycles_per_step: 4,
        };
        let trimmed = trim_to_budget(steps.clone(), &budgets);
        assert_eq!(trimmed.len(), 5);
        assert_eq!(trimmed.first().unwrap().title, steps.first().unwrap().title);
        assert_eq!(trimmed.last().unwrap().title, steps.last().unwrap().title);
        // the surviving middle contains only the highest-priority cases
        assert!(trimmed[1..trimmed.len() - 1]
            .iter()
            .all(|s| s.priority == StepPriority::Critical));
        // step ids renumbered
        assert_eq!(trimmed[0].step_id, "step_1");
        assert_eq!(trimmed[4].step_id, "step_5");
    }

    #[test]
    fn trim_floor_is_three_steps() {
        let steps = built_in_steps("Test login flow");
        let budgets = RunBudgets {
            max_total_actions: 2,
            max_cycles_per_step: 8,
        };
        let trimmed = trim_to_budget(steps, &budgets);
        assert_eq!(trimmed.len(), 3);
    }

    #[tokio::test]
    async fn llm_failure_falls_back_to_built_in() {
        let generator = PlanGenerator::new(
            temp_store(),
            Arc::new(LlmClient::Mock(MockClient::failing(503))),
        );
        let plan = generator
            .generate(
                "Test login and cart flow",
                "https://www.saucedemo.com",
                &RunBudgets::default(),
            )
            .await;
        assert_eq!(plan.generated_by, GeneratedBy::BuiltIn);
        assert!(plan.total_steps >= 6);
    }

    #[tokio::test]
    async fn malformed_llm_plan_falls_back_to_built_in() {
        let generator = PlanGenerator::new(
            temp_store(),
            Arc::new(LlmClient::Mock(MockClient::with_responses(vec![
                "not json at all".into(),
            ]))),
        );
        let plan = generator
            .generate("Test form flow", "https://example.com", &RunBudgets::default())
            .await;
        assert_eq!(plan.generated_by, GeneratedBy::BuiltIn);
    }

    #[tokio::test]
    async fn well_formed_llm_plan_is_used() {
        let payload = r#"{"title":"t","rationale":"r","steps":[
            {"title":"Navigate to the target URL","action_hint":"navigate_to_url","priority":"critical","expected_outcome":"page loads","failure_indicator":"navigation failed"},
            {"title":"Check the hero section","action_hint":"check_element_visible","priority":"important","expected_outcome":"hero visible","failure_indicator":"hero missing"},
            {"title":"Verify final state","action_hint":"capture_screenshot","priority":"important","expected_outcome":"no errors","failure_indicator":"error banner"}
        ]}"#;
        let generator = PlanGenerator::new(
            temp_store(),
            Arc::new(LlmClient::Mock(MockClient::with_responses(vec![payload.into()]))),
        );
        let plan = generator
            .generate("Smoke test", "https://example.com", &RunBudgets::default())
            .await;
        assert_eq!(plan.generated_by, GeneratedBy::Llm);
        assert_eq!(plan.total_steps, 3);
        assert_eq!(plan.steps[0].step_id, "step_1");
        assert_eq!(plan.steps[0].action_hint, ActionType::NavigateToUrl);
    }
}
