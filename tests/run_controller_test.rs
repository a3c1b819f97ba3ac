//! End-to-end controller scenarios against the mock provider and scripted
//! browser sessions. No network, no real browser, no real LLM.

mod common;

use std::time::Duration;

use common::{
    decision, mock_of, run_to_completion, scripted_page_with, storefront_dom, test_context,
};
use noema::llm::MockClient;
use noema::narration::NarrationType;
use noema::runner::{
    stop_run, CognitiveRunController, RunHandle, RunOptions, RunResult, RunState, StepResult,
};
use noema::store::{ActionSequence, ActionType, SequenceAction};

const SAUCEDEMO: &str = "https://www.saucedemo.com";

fn push_first_run_responses(mock: &MockClient) {
    // plan call falls through to the built-in library
    mock.push_response("{}");
    // step 1: navigate (hint match after one action)
    mock.push_response(decision("navigate_to_url", None, Some(SAUCEDEMO)));
    // step 2: login with invalid credentials, two actions so the step is
    // worth caching (click is off-hint, fill matches the hint)
    mock.push_response(decision("click_element", Some("#login-button"), None));
    mock.push_response(decision("fill_input", Some("#user-name"), Some("wrong_user")));
    // step 3: login with valid credentials, again two actions
    mock.push_response(decision("click_element", Some(".login_logo"), None));
    mock.push_response(decision("fill_input", Some("#password"), Some("secret_sauce")));
    // step 4..6: single hint-matching actions
    mock.push_response(decision("click_element", Some("#add-to-cart"), None));
    mock.push_response(decision("click_element", Some(".shopping_cart_link"), None));
    mock.push_response(decision("click_element", Some("#logout_sidebar_link"), None));
    // step 7: final verification
    mock.push_response(decision("capture_screenshot", None, None));
}

#[tokio::test]
async fn first_run_builds_plan_executes_steps_and_caches_sequences() {
    let (ctx, factory) = test_context(MockClient::new()).await;
    factory.push_page(scripted_page_with(storefront_dom()));
    push_first_run_responses(mock_of(&ctx));

    let report = run_to_completion(&ctx, "Test login and cart flow", SAUCEDEMO, false).await;

    // the built-in library expands login+cart into the full flow
    assert!(report.plan.total_steps >= 6);
    let titles: Vec<&str> = report.plan.steps.iter().map(|s| s.title.as_str()).collect();
    for expected in [
        "Navigate",
        "Login with invalid credentials",
        "Login with valid credentials",
        "Add a product to cart",
        "Verify cart contents",
        "Logout",
    ] {
        assert!(
            titles.iter().any(|t| t.contains(expected)),
            "missing step {expected:?} in {titles:?}"
        );
    }

    assert!(matches!(report.result, RunResult::Pass | RunResult::Partial));
    assert!(report.steps.iter().all(|s| s.result == StepResult::Pass));

    // every scripted decision was consumed, none left over
    assert_eq!(mock_of(&ctx).scripted_remaining(), 0);

    // step lifecycle events pair up, as do action events
    let events = ctx.narration.history(Some(&report.run_id));
    let count = |kind: NarrationType| events.iter().filter(|e| e.kind == kind).count();
    assert_eq!(count(NarrationType::PlanStepStarted), report.steps.len());
    assert_eq!(count(NarrationType::PlanStepCompleted), report.steps.len());
    assert_eq!(
        count(NarrationType::ActionStarted),
        count(NarrationType::ActionCompleted)
    );
    assert_eq!(count(NarrationType::RunStarted), 1);
    assert_eq!(count(NarrationType::RunCompleted), 1);

    // credentials never reach narration
    for event in &events {
        assert!(!event.message.contains("secret_sauce"), "{}", event.message);
        assert!(!event.message.contains("standard_user"), "{}", event.message);
        if let Some(data) = &event.data {
            let raw = data.to_string();
            assert!(!raw.contains("secret_sauce"), "{raw}");
        }
    }

    // the two-action login steps became one reinforced cached sequence
    let sequences = ctx.store.sequences.list_all().await.unwrap();
    assert!(!sequences.is_empty());
    assert!(sequences.iter().all(|s| s.url_domain == "saucedemo.com"));
    let login_seq = sequences
        .iter()
        .find(|s| s.step_keywords.contains(&"login".to_string()))
        .expect("login sequence cached");
    assert!(login_seq.confidence >= 0.7 - 1e-9);
    // stored values are tokenised, never raw
    let serialised = serde_json::to_string(&sequences).unwrap();
    assert!(!serialised.contains("secret_sauce"));

    // global budget was honoured
    assert!(report.metrics.tool_calls <= ctx.config.budgets.max_total_actions);
}

#[tokio::test]
async fn second_identical_run_replays_login_from_memory_without_decision_calls() {
    let (ctx, factory) = test_context(MockClient::new()).await;
    factory.push_page(scripted_page_with(storefront_dom()));
    push_first_run_responses(mock_of(&ctx));
    let first = run_to_completion(&ctx, "Test login and cart flow", SAUCEDEMO, false).await;
    assert_eq!(first.memory_savings.steps_from_memory, 0);

    // second run: scripted responses only for the steps that cannot
    // replay; the login steps must consume nothing
    factory.push_page(scripted_page_with(storefront_dom()));
    let mock = mock_of(&ctx);
    mock.push_response("{}");
    mock.push_response(decision("navigate_to_url", None, Some(SAUCEDEMO)));
    mock.push_response(decision("click_element", Some("#add-to-cart"), None));
    mock.push_response(decision("click_element", Some(".shopping_cart_link"), None));
    mock.push_response(decision("click_element", Some("#logout_sidebar_link"), None));
    mock.push_response(decision("capture_screenshot", None, None));

    let second = run_to_completion(&ctx, "Test login and cart flow", SAUCEDEMO, false).await;

    assert!(second.memory_savings.steps_from_memory >= 1);
    assert!(second.memory_savings.llm_calls_saved >= 1);
    let from_memory: Vec<_> = second.steps.iter().filter(|s| s.from_memory).collect();
    assert!(from_memory.iter().any(|s| s.title.contains("Login")));
    // zero decision LLM calls for the replayed steps: the scripted queue
    // drained exactly, nothing was consumed out of order
    assert_eq!(mock_of(&ctx).scripted_remaining(), 0);
    assert!(matches!(second.result, RunResult::Pass | RunResult::Partial));

    // replay success may only raise confidence
    let sequences = ctx.store.sequences.list_all().await.unwrap();
    assert!(sequences.iter().all(|s| s.confidence >= 0.7 - 1e-9));
}

#[tokio::test]
async fn stop_mid_run_finalises_video_and_reports_partial() {
    let (ctx, factory) = test_context(MockClient::new()).await;
    let page = scripted_page_with(storefront_dom());
    page.set_action_delay(Duration::from_millis(150));
    factory.push_page(page);

    let mock = mock_of(&ctx);
    mock.push_response("{}");
    mock.push_response(decision("navigate_to_url", None, Some(SAUCEDEMO)));
    // step 2 actions that never satisfy the success criteria
    for _ in 0..8 {
        mock.push_response(decision("click_element", Some("#somewhere"), None));
        mock.push_response(decision("click_element", Some("#elsewhere"), None));
    }

    let run_id = noema::store::new_id();
    let handle = RunHandle::new(&run_id, "Test login flow", SAUCEDEMO);
    ctx.runs.insert(handle.clone());
    let controller = CognitiveRunController::new(
        ctx.clone(),
        handle.clone(),
        RunOptions {
            goal: "Test login flow".to_string(),
            url: SAUCEDEMO.to_string(),
            enable_optimization: false,
            budgets: ctx.config.budgets.clone(),
        },
    );
    let task = tokio::spawn(controller.run());

    // wait until step 2 is underway, then stop
    let mut rx = ctx.narration.subscribe();
    loop {
        let event = tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("narration before timeout")
            .expect("bus open");
        if event.kind == NarrationType::PlanStepStarted
            && event
                .data
                .as_ref()
                .is_some_and(|d| d["step_id"] == serde_json::json!("step_2"))
        {
            break;
        }
    }
    assert!(stop_run(&ctx, &run_id).await);

    let report = task.await.unwrap();
    assert_eq!(handle.state(), RunState::Stopped);
    assert_eq!(report.result, RunResult::Partial);
    assert_eq!(report.steps.first().unwrap().result, StepResult::Pass);
    assert!(report.steps[1..]
        .iter()
        .all(|s| s.result == StepResult::Skipped));

    // the video manifest was finalised despite the stop
    let video = ctx.store.videos_dir().join(format!("{run_id}.json"));
    assert!(video.exists());
    assert!(report.video_url.is_some());
}

#[tokio::test]
async fn llm_outage_degrades_to_no_op_but_replays_still_fire() {
    let (ctx, factory) = test_context(MockClient::failing(503)).await;
    factory.push_page(scripted_page_with(storefront_dom()));

    // a remembered login sequence from an earlier life
    let seeded = ActionSequence {
        id: noema::store::new_id(),
        url_domain: "saucedemo.com".to_string(),
        step_keywords: vec!["login".into(), "valid".into(), "credentials".into()],
        step_title: "Login with valid credentials".to_string(),
        actions: vec![
            SequenceAction {
                kind: ActionType::FillInput,
                selector: Some("#user-name".into()),
                value_template: Some("${username}".into()),
                inputs: serde_json::Value::Null,
                rationale: "enter username".into(),
            },
            SequenceAction {
                kind: ActionType::FillInput,
                selector: Some("#password".into()),
                value_template: Some("${password}".into()),
                inputs: serde_json::Value::Null,
                rationale: "enter password".into(),
            },
        ],
        success_count: 2,
        failure_count: 0,
        confidence: 0.8,
        requires_credentials: true,
        source_run_id: "previous-run".to_string(),
        created_at: chrono::Utc::now(),
        last_used_at: None,
    };
    ctx.store.sequences.create(seeded).await.unwrap();

    let report = run_to_completion(&ctx, "Test login flow", SAUCEDEMO, false).await;

    // the outage produced no_op actions naming the failure
    let actions = ctx.store.actions.list_all().await.unwrap();
    let no_ops: Vec<_> = actions
        .iter()
        .filter(|a| a.kind == ActionType::NoOp)
        .collect();
    assert!(!no_ops.is_empty());
    assert!(no_ops
        .iter()
        .all(|a| a.rationale.contains("decision LLM unavailable")));
    assert!(no_ops.iter().any(|a| a.rationale.contains("503")));

    // the cached sequence still replayed both login steps from memory
    let replayed: Vec<_> = report.steps.iter().filter(|s| s.from_memory).collect();
    assert!(replayed.iter().any(|s| s.title.contains("Login")));

    // the run still terminated with a complete report
    assert_eq!(report.result, RunResult::Partial);
    let events = ctx.narration.history(Some(&report.run_id));
    assert!(events
        .iter()
        .any(|e| e.kind == NarrationType::RunCompleted));

    // raw credentials were typed into the page but never narrated
    let page_actions = factory.created_runs();
    assert_eq!(page_actions.len(), 1);
    for event in &events {
        assert!(!event.message.contains("secret_sauce"));
    }
}

#[tokio::test]
async fn exhausted_global_budget_skips_remaining_steps() {
    let (ctx, factory) = test_context(MockClient::new()).await;
    let page = scripted_page_with(storefront_dom());
    page.fail_selector("#missing");
    factory.push_page(page);

    let mock = mock_of(&ctx);
    mock.push_response("{}");
    mock.push_response(decision("navigate_to_url", None, Some(SAUCEDEMO)));
    mock.push_response(decision("click_element", Some("#missing"), None));

    let run_id = noema::store::new_id();
    let handle = RunHandle::new(&run_id, "Test login flow", SAUCEDEMO);
    ctx.runs.insert(handle.clone());
    let mut budgets = ctx.config.budgets.clone();
    budgets.max_total_actions = 2;
    let controller = CognitiveRunController::new(
        ctx.clone(),
        handle,
        RunOptions {
            goal: "Test login flow".to_string(),
            url: SAUCEDEMO.to_string(),
            enable_optimization: false,
            budgets,
        },
    );
    let report = controller.run().await;

    assert!(report.metrics.tool_calls <= 2);
    assert_eq!(report.result, RunResult::Partial);
    let skipped: Vec<_> = report
        .steps
        .iter()
        .filter(|s| s.result == StepResult::Skipped)
        .collect();
    assert!(!skipped.is_empty());
    assert!(skipped
        .iter()
        .all(|s| s.failure_reason.as_deref() == Some("action budget exhausted")));
}
