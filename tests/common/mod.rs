//! Shared fixtures for the integration tests: a context wired to the mock
//! provider and scripted browser sessions.
#![allow(dead_code)]

use std::path::PathBuf;
use std::sync::Arc;

use noema::browser::testing::{ScriptedPage, ScriptedSessionFactory};
use noema::browser::DomSnapshot;
use noema::llm::{LlmClient, MockClient};
use noema::runner::{CognitiveRunController, QaReport, RunHandle, RunOptions};
use noema::{NoemaConfig, NoemaContext};

pub fn temp_data_dir() -> PathBuf {
    std::env::temp_dir().join(format!("noema_test_{}", uuid::Uuid::new_v4()))
}

pub fn test_config(data_dir: &PathBuf) -> NoemaConfig {
    let mut config = NoemaConfig::default();
    config.data_dir = data_dir.clone();
    config.test_username = Some("standard_user".to_string());
    config.test_password = Some("secret_sauce".to_string());
    config
}

pub async fn test_context(mock: MockClient) -> (Arc<NoemaContext>, Arc<ScriptedSessionFactory>) {
    let data_dir = temp_data_dir();
    std::fs::create_dir_all(&data_dir).unwrap();
    let config = test_config(&data_dir);
    let factory = Arc::new(ScriptedSessionFactory::new(&data_dir));
    let ctx = NoemaContext::initialize_with(
        config,
        Arc::new(LlmClient::Mock(mock)),
        factory.clone(),
    )
    .await
    .unwrap();
    (ctx, factory)
}

pub fn mock_of(ctx: &NoemaContext) -> &MockClient {
    match ctx.llm.as_ref() {
        LlmClient::Mock(mock) => mock,
        _ => panic!("test context must use the mock provider"),
    }
}

/// Storefront DOM with one benign (non-matching) error banner so a single
/// off-hint action cannot satisfy the "no visible errors" criterion.
pub fn storefront_dom() -> DomSnapshot {
    DomSnapshot {
        title: "Swag Labs".to_string(),
        body_text_preview: "Storefront with products".to_string(),
        error_messages: vec!["promo banner offline notice".to_string()],
        ..Default::default()
    }
}

pub fn scripted_page_with(dom: DomSnapshot) -> Arc<ScriptedPage> {
    let page = Arc::new(ScriptedPage::new());
    page.set_snapshot(dom);
    page
}

pub async fn run_to_completion(
    ctx: &Arc<NoemaContext>,
    goal: &str,
    url: &str,
    enable_optimization: bool,
) -> QaReport {
    let run_id = noema::store::new_id();
    let handle = RunHandle::new(&run_id, goal, url);
    ctx.runs.insert(handle.clone());
    let controller = CognitiveRunController::new(
        ctx.clone(),
        handle,
        RunOptions {
            goal: goal.to_string(),
            url: url.to_string(),
            enable_optimization,
            budgets: ctx.config.budgets.clone(),
        },
    );
    controller.run().await
}

pub fn decision(action: &str, selector: Option<&str>, value: Option<&str>) -> String {
    serde_json::json!({
        "action": action,
        "selector": selector,
        "value": value,
        "rationale": format!("scripted {action}"),
        "expected_outcome": "scripted outcome",
    })
    .to_string()
}
