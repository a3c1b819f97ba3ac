//! Gemini provider (generateContent REST API).

use base64::Engine;
use serde_json::{json, Value};

use super::{LlmError, LlmRequest, LlmResponse};

const API_BASE: &str = "https://generativelanguage.googleapis.com/v1beta/models";
const REQUEST_TIMEOUT_SECS: u64 = 30;

pub struct GeminiClient {
    http: reqwest::Client,
    api_key: String,
    model: String,
    vision_model: String,
}

impl GeminiClient {
    pub fn new(api_key: String, model: String, vision_model: String) -> Self {
        let http = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(REQUEST_TIMEOUT_SECS))
            .build()
            .unwrap_or_default();
        Self {
            http,
            api_key,
            model,
            vision_model,
        }
    }

    pub async fn generate(&self, request: &LlmRequest) -> Result<LlmResponse, LlmError> {
        let mut generation_config = json!({
            "temperature": request.temperature,
            "maxOutputTokens": request.max_output_tokens,
        });
        if request.json_output {
            generation_config["responseMimeType"] = json!("application/json");
        }

        let mut body = json!({
            "contents": [{ "role": "user", "parts": [{ "text": request.prompt }] }],
            "generationConfig": generation_config,
        });
        if let Some(system) = &request.system {
            body["systemInstruction"] = json!({ "parts": [{ "text": system }] });
        }

        let text = self.call(&self.model, &body).await?;
        Ok(LlmResponse {
            text,
            model: self.model.clone(),
        })
    }

    pub async fn describe_image(&self, png: &[u8], prompt: &str) -> Result<String, LlmError> {
        let encoded = base64::engine::general_purpose::STANDARD.encode(png);
        let body = json!({
            "contents": [{
                "role": "user",
                "parts": [
                    { "text": prompt },
                    { "inlineData": { "mimeType": "image/png", "data": encoded } }
                ]
            }],
            "generationConfig": { "temperature": 0.2, "maxOutputTokens": 512 },
        });
        self.call(&self.vision_model, &body).await
    }

    async fn call(&self, model: &str, body: &Value) -> Result<String, LlmError> {
        let url = format!("{API_BASE}/{model}:generateContent?key={}", self.api_key);
        let response = self.http.post(&url).json(body).send().await?;

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

        payload["candidates"][0]["content"]["parts"][0]["text"]
            .as_str()
            .map(str::to_string)
            .ok_or_else(|| LlmError::Malformed("no candidate text in response".to_string()))
    }
}
