//! Deterministic mock provider.
//!
//! Satisfies the same contract as the real providers. Tests script exact
//! responses (or failures); unscripted calls fall back to deterministic
//! defaults keyed on stable prompt markers, so every engine exercises its
//! degraded path instead of hanging.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;

use super::{LlmError, LlmRequest, LlmResponse};

const MOCK_MODEL: &str = "mock-1";

enum Scripted {
    Text(String),
    HttpError(u16),
}

#[derive(Default)]
pub struct MockClient {
    responses: Mutex<VecDeque<Scripted>>,
    calls: AtomicU64,
    fail_all_with: Option<u16>,
}

impl MockClient {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every call fails with the given HTTP status (outage simulation).
    pub fn failing(status: u16) -> Self {
        Self {
            fail_all_with: Some(status),
            ..Self::default()
        }
    }

    pub fn with_responses(responses: Vec<String>) -> Self {
        let client = Self::new();
        for response in responses {
            client.push_response(response);
        }
        client
    }

    pub fn push_response(&self, text: impl Into<String>) {
        self.responses.lock().push_back(Scripted::Text(text.into()));
    }

    pub fn push_error(&self, status: u16) {
        self.responses.lock().push_back(Scripted::HttpError(status));
    }

    /// Total calls observed, including vision calls.
    pub fn calls(&self) -> u64 {
        self.calls.load(Ordering::SeqCst)
    }

    /// Scripted responses not yet consumed. Tests use this to prove a
    /// code path made no LLM calls.
    pub fn scripted_remaining(&self) -> usize {
        self.responses.lock().len()
    }

    pub fn generate(&self, request: &LlmRequest) -> Result<LlmResponse, LlmError> {
        self.calls.fetch_add(1, Ordering::SeqCst);

        if let Some(status) = self.fail_all_with {
            return Err(LlmError::Http {
                status,
                message: "mock outage".to_string(),
            });
        }
        if let Some(scripted) = self.responses.lock().pop_front() {
            return match scripted {
                Scripted::Text(text) => Ok(LlmResponse {
                    text,
                    model: MOCK_MODEL.to_string(),
                }),
                Scripted::HttpError(status) => Err(LlmError::Http {
                    status,
                    message: "mock scripted error".to_string(),
                }),
            };
        }

        Ok(LlmResponse {
            text: Self::default_for(&request.prompt).to_string(),
            model: MOCK_MODEL.to_string(),
        })
    }

    pub fn describe_image(&self, _png: &[u8], _prompt: &str) -> Result<String, LlmError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if let Some(status) = self.fail_all_with {
            return Err(LlmError::Http {
                status,
                message: "mock outage".to_string(),
            });
        }
        Ok("A web page with a form and a primary button.".to_string())
    }

    fn default_for(prompt: &str) -> &'static str {
        if prompt.contains("Choose exactly one next action") {
            r#"{"action":"no_op","rationale":"mock provider default","expected_outcome":"nothing changes"}"#
        } else if prompt.contains("mental model") {
            r#"{"create_models":[],"update_models":[],"graph_updates":[],"contradictions":[]}"#
        } else if prompt.contains("advisory heuristics") {
            r#"{"experiences":[]}"#
        } else {
            "{}"
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scripted_responses_are_consumed_in_order() {
        let mock = MockClient::with_responses(vec!["one".into(), "two".into()]);
        let req = LlmRequest::text("anything");
        assert_eq!(mock.generate(&req).unwrap().text, "one");
        assert_eq!(mock.generate(&req).unwrap().text, "two");
        // falls through to defaults afterwards
        assert_eq!(mock.generate(&req).unwrap().text, "{}");
        assert_eq!(mock.calls(), 3);
    }

    #[test]
    fn decision_default_is_a_no_op() {
        let mock = MockClient::new();
        let req = LlmRequest::json("... Choose exactly one next action ...");
        let text = mock.generate(&req).unwrap().text;
        assert!(text.contains("no_op"));
    }
}
