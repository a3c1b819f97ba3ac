//! Process configuration, resolved once from the environment.
//!
//! Every recognised variable has a sensible default so a bare `noema serve`
//! works against a local WebDriver and an on-disk state directory.

use std::collections::HashMap;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// Default API port when `NOEMA_API_PORT` is unset.
pub const DEFAULT_API_PORT: u16 = 8200;
/// Default Cognee sidecar endpoint.
pub const DEFAULT_COGNEE_URL: &str = "http://localhost:8100";
/// Default WebDriver endpoint (chromedriver / geckodriver).
pub const DEFAULT_WEBDRIVER_URL: &str = "http://localhost:4444";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunBudgets {
    /// Global cap on browser actions per run.
    pub max_total_actions: u32,
    /// Cap on decision cycles within a single plan step.
    pub max_cycles_per_step: u32,
}

impl Default for RunBudgets {
    fn default() -> Self {
        Self {
            max_total_actions: 60,
            max_cycles_per_step: 8,
        }
    }
}

#[derive(Debug, Clone)]
pub struct NoemaConfig {
    pub api_port: u16,
    pub data_dir: PathBuf,
    pub webdriver_url: String,

    pub gemini_api_key: Option<String>,
    pub gemini_model: String,
    pub gemini_vision_model: String,
    pub openai_api_key: Option<String>,

    pub cognee_url: String,
    pub cognee_enabled: bool,

    pub test_username: Option<String>,
    pub test_password: Option<String>,
    /// Extra site credentials, parsed from `TEST_CREDENTIALS_JSON`.
    pub test_credentials_extra: HashMap<String, String>,

    pub budgets: RunBudgets,
}

impl Default for NoemaConfig {
    fn default() -> Self {
        Self {
            api_port: DEFAULT_API_PORT,
            data_dir: PathBuf::from(".noema"),
            webdriver_url: DEFAULT_WEBDRIVER_URL.to_string(),
            gemini_api_key: None,
            gemini_model: "gemini-2.0-flash".to_string(),
            gemini_vision_model: "gemini-2.0-flash".to_string(),
            openai_api_key: None,
            cognee_url: DEFAULT_COGNEE_URL.to_string(),
            cognee_enabled: false,
            test_username: None,
            test_password: None,
            test_credentials_extra: HashMap::new(),
            budgets: RunBudgets::default(),
        }
    }
}

impl NoemaConfig {
    /// Resolve configuration from process environment variables.
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Some(port) = env_var("NOEMA_API_PORT").and_then(|v| v.parse().ok()) {
            config.api_port = port;
        }
        if let Some(dir) = env_var("NOEMA_DATA_DIR") {
            config.data_dir = PathBuf::from(dir);
        }
        if let Some(url) = env_var("NOEMA_WEBDRIVER_URL") {
            config.webdriver_url = url;
        }

        config.gemini_api_key = env_var("GEMINI_API_KEY").or_else(|| env_var("GOOGLE_API_KEY"));
        if let Some(model) = env_var("GEMINI_MODEL") {
            config.gemini_model = model;
        }
        config.gemini_vision_model = env_var("GEMINI_VISION_MODEL")
            .unwrap_or_else(|| config.gemini_model.clone());
        config.openai_api_key = env_var("OPENAI_API_KEY");

        if let Some(url) = env_var("COGNEE_SERVICE_URL") {
            config.cognee_url = url;
        }
        config.cognee_enabled = env_var("COGNEE_ENABLED")
            .map(|v| matches!(v.to_lowercase().as_str(), "1" | "true" | "yes"))
            .unwrap_or(false);

        config.test_username = env_var("TEST_USERNAME");
        config.test_password = env_var("TEST_PASSWORD");
        config.test_credentials_extra = env_var("TEST_CREDENTIALS_JSON")
            .and_then(|raw| parse_credentials_json(&raw))
            .unwrap_or_default();

        config
    }

    /// Every secret string that must never reach narration or logs.
    pub fn secret_values(&self) -> Vec<String> {
        let mut secrets = Vec::new();
        if let Some(u) = &self.test_username {
            secrets.push(u.clone());
        }
        if let Some(p) = &self.test_password {
            secrets.push(p.clone());
        }
        for value in self.test_credentials_extra.values() {
            secrets.push(value.clone());
        }
        secrets.retain(|s| !s.is_empty());
        secrets
    }
}

fn env_var(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.trim().is_empty())
}

/// `TEST_CREDENTIALS_JSON` is a flat object; nested objects are flattened
/// with dotted keys so every string value can be masked.
fn parse_credentials_json(raw: &str) -> Option<HashMap<String, String>> {
    let value: serde_json::Value = serde_json::from_str(raw).ok()?;
    let mut flat = HashMap::new();
    flatten_strings("", &value, &mut flat);
    Some(flat)
}

fn flatten_strings(prefix: &str, value: &serde_json::Value, out: &mut HashMap<String, String>) {
    match value {
        serde_json::Value::String(s) => {
            out.insert(prefix.trim_start_matches('.').to_string(), s.clone());
        }
        serde_json::Value::Object(map) => {
            for (key, nested) in map {
                flatten_strings(&format!("{prefix}.{key}"), nested, out);
            }
        }
        _ => {}
    }
}
