//! Client for the external semantic memory sidecar (Cognee).
//!
//! Semantic memory is strictly best-effort: indexing and retrieval failures
//! are logged and swallowed, never propagated into the sensing or belief
//! pipelines.

use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{debug, warn};

use crate::config::NoemaConfig;

const REQUEST_TIMEOUT_SECS: u64 = 10;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EvidenceSnippet {
    pub text: String,
    #[serde(default)]
    pub score: f64,
}

pub struct CogneeClient {
    http: reqwest::Client,
    base_url: String,
}

impl CogneeClient {
    pub fn from_config(config: &NoemaConfig) -> Option<Self> {
        if !config.cognee_enabled {
            return None;
        }
        let http = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(REQUEST_TIMEOUT_SECS))
            .build()
            .unwrap_or_default();
        Some(Self {
            http,
            base_url: config.cognee_url.trim_end_matches('/').to_string(),
        })
    }

    /// Index one chunk of content. Failures are non-fatal.
    pub async fn index_chunk(&self, text: &str, tags: &[String]) {
        let body = json!({ "content": text, "tags": tags });
        match self
            .http
            .post(format!("{}/index", self.base_url))
            .json(&body)
            .send()
            .await
        {
            Ok(response) if response.status().is_success() => {
                debug!(chars = text.len(), "indexed chunk in semantic memory");
            }
            Ok(response) => {
                warn!(status = %response.status(), "semantic memory rejected chunk");
            }
            Err(err) => {
                warn!(error = %err, "semantic memory unreachable; skipping index");
            }
        }
    }

    /// Retrieve the top-K snippets for a query. Returns an empty list on
    /// any failure.
    pub async fn search(&self, query: &str, top_k: usize) -> Vec<EvidenceSnippet> {
        let body = json!({ "query": query, "top_k": top_k });
        let response = match self
            .http
            .post(format!("{}/search", self.base_url))
            .json(&body)
            .send()
            .await
        {
            Ok(response) if response.status().is_success() => response,
            Ok(response) => {
                warn!(status = %response.status(), "semantic memory search failed");
                return Vec::new();
            }
            Err(err) => {
                warn!(error = %err, "semantic memory unreachable; skipping retrieval");
                return Vec::new();
            }
        };

        match response.json::<Vec<EvidenceSnippet>>().await {
            Ok(snippets) => snippets.into_iter().take(top_k).collect(),
            Err(err) => {
                warn!(error = %err, "semantic memory returned malformed results");
                Vec::new()
            }
        }
    }
}
