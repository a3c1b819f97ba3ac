//! OpenAI provider (chat completions REST API).

use base64::Engine;
use serde_json::{json, Value};

use super::{LlmError, LlmRequest, LlmResponse};

const API_URL: &str = "https://api.openai.com/v1/chat/completions";
const DEFAULT_MODEL: &str = "gpt-4o-mini";
const REQUEST_TIMEOUT_SECS: u64 = 30;

pub struct OpenAiClient {
    http: reqwest::Client,
    api_key: String,
    model: String,
}

impl OpenAiClient {
    pub fn new(api_key: String) -> Self {
        let http = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(REQUEST_TIMEOUT_SECS))
            .build()
            .unwrap_or_default();
        Self {
            http,
            api_key,
            model: DEFAULT_MODEL.to_string(),
        }
    }

    pub async fn generate(&self, request: &LlmRequest) -> Result<LlmResponse, LlmError> {
        let mut messages = Vec::new();
        if let Some(system) = &request.system {
            messages.push(json!({ "role": "system", "content": system }));
        }
        messages.push(json!({ "role": "user", "content": request.prompt }));

        let mut body = json!({
            "model": self.model,
            "messages": messages,
            "temperature": request.temperature,
            "max_tokens": request.max_output_tokens,
        });
        if request.json_output {
            body["response_format"] = json!({ "type": "json_object" });
        }

        let text = self.call(&body).await?;
        Ok(LlmResponse {
            text,
            model: self.model.clone(),
        })
    }

    pub async fn describe_image(&self, png: &[u8], prompt: &str) -> Result<String, LlmError> {
        let encoded = base64::engine::general_purpose::STANDARD.encode(png);
        let body = json!({
            "model": self.model,
            "messages": [{
                "role": "user",
                "content": [
                    { "type": "text", "text": prompt },
                    { "type": "image_url", "image_url": { "url": format!("data:image/png;base64,{encoded}") } }
                ]
            }],
            "max_tokens": 512,
        });
        self.call(&body).await
    }

    async fn call(&self, body: &Value) -> Result<String, LlmError> {
        let response = self
            .http
            .post(API_URL)
            .bearer_auth(&self.api_key)
            .json(body)
            .send()
            .await?;

        let status = response.status();
        let payload: Value = response.json().await.map_err(LlmError::from)?;
        if !status.is_success() {
            let message = payload["error"]["message"]
                .as_str()
                .unwrap_or("unknown error")
                .to_string();
            return Err(LlmError::Http {
                status: status.as_u16(),
                message,
            });
        }

        payload["choices"][0]["message"]["content"]
            .as_str()
            .map(str::to_string)
            .ok_or_else(|| LlmError::Malformed("no choice content in response".to_string()))
    }
}
