use std::env;
use std::thread;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use reqwest::blocking::{Client as HttpClient, Response as HttpResponse};
use serde_json::{json, Map, Value};

use crate::{non_empty_env, truncate_text};

pub const DEFAULT_MODEL: &str = "gemini-1.5-flash-latest";
pub const DEFAULT_API_BASE: &str = "https://generativelanguage.googleapis.com/v1beta";
/// Sent as a header so the key never appears in a URL or in transport errors.
const API_KEY_HEADER: &str = "x-goog-api-key";

#[derive(Debug, Clone, PartialEq)]
pub enum VisionPart {
    Text(String),
    InlineImage { mime_type: String, data: Vec<u8> },
}

#[derive(Debug, Clone, PartialEq)]
pub struct VisionRequest {
    pub model: String,
    pub api_key: String,
    pub parts: Vec<VisionPart>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct VisionResponse {
    /// Concatenated text parts of the first candidate, `None` when empty.
    pub text: Option<String>,
    pub block_reason: Option<String>,
}

/// A hosted multimodal model that turns images plus text into text.
pub trait VisionProvider: Send + Sync {
    fn name(&self) -> &str;
    fn generate(&self, request: &VisionRequest) -> Result<VisionResponse>;
}

/// Transport knobs for the Gemini client, read from the environment.
#[derive(Debug, Clone, PartialEq)]
pub struct TransportSettings {
    pub api_base: String,
    pub request_timeout_s: f64,
    pub transport_retries: usize,
    pub retry_backoff_s: f64,
}

impl Default for TransportSettings {
    fn default() -> Self {
        Self {
            api_base: DEFAULT_API_BASE.to_string(),
            request_timeout_s: 90.0,
            transport_retries: 2,
            retry_backoff_s: 1.2,
        }
    }
}

impl TransportSettings {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let defaults = Self::default();
        Self {
            api_base: lookup("GEMINI_API_BASE")
                .map(|value| value.trim().trim_end_matches('/').to_string())
                .filter(|value| !value.is_empty())
                .unwrap_or(defaults.api_base),
            request_timeout_s: clamped_f64(
                lookup("GRAPHCHAT_REQUEST_TIMEOUT"),
                defaults.request_timeout_s,
                15.0,
                300.0,
            ),
            transport_retries: clamped_f64(
                lookup("GRAPHCHAT_TRANSPORT_RETRIES"),
                defaults.transport_retries as f64,
                0.0,
                4.0,
            )
            .round() as usize,
            retry_backoff_s: clamped_f64(
                lookup("GRAPHCHAT_RETRY_BACKOFF"),
                defaults.retry_backoff_s,
                0.1,
                10.0,
            ),
        }
    }
}

fn clamped_f64(raw: Option<String>, default: f64, min: f64, max: f64) -> f64 {
    raw.and_then(|text| text.trim().parse::<f64>().ok())
        .filter(|value| value.is_finite())
        .unwrap_or(default)
        .clamp(min, max)
}

/// Model name from `GRAPHCHAT_MODEL`, falling back to the default.
pub fn model_from_env() -> String {
    non_empty_env("GRAPHCHAT_MODEL").unwrap_or_else(|| DEFAULT_MODEL.to_string())
}

/// Credential from `GEMINI_API_KEY`, then `GOOGLE_API_KEY`.
pub fn api_key_from_env() -> Option<String> {
    non_empty_env("GEMINI_API_KEY").or_else(|| non_empty_env("GOOGLE_API_KEY"))
}

pub struct GeminiProvider {
    settings: TransportSettings,
    http: HttpClient,
}

impl GeminiProvider {
    pub fn new(settings: TransportSettings) -> Self {
        Self {
            settings,
            http: HttpClient::new(),
        }
    }

    fn endpoint_for_model(&self, model: &str) -> String {
        let trimmed = model.trim();
        let model_path = if trimmed.starts_with("models/") {
            trimmed.to_string()
        } else {
            format!("models/{trimmed}")
        };
        format!("{}/{}:generateContent", self.settings.api_base, model_path)
    }

    fn build_payload(request: &VisionRequest) -> Value {
        let parts: Vec<Value> = request
            .parts
            .iter()
            .map(|part| match part {
                VisionPart::Text(text) => json!({ "text": text }),
                VisionPart::InlineImage { mime_type, data } => json!({
                    "inlineData": {
                        "mimeType": mime_type,
                        "data": BASE64.encode(data),
                    }
                }),
            })
            .collect();
        json!({
            "contents": [{
                "role": "user",
                "parts": parts,
            }]
        })
    }

    fn post_with_transport_retries(
        &self,
        endpoint: &str,
        api_key: &str,
        payload: &Value,
    ) -> Result<HttpResponse> {
        let max_retries = self.settings.transport_retries;
        for attempt in 0..=max_retries {
            let response = self
                .http
                .post(endpoint)
                .header(API_KEY_HEADER, api_key)
                .timeout(Duration::from_secs_f64(self.settings.request_timeout_s))
                .json(payload)
                .send();

            match response {
                Ok(ok) => return Ok(ok),
                Err(raw) => {
                    let err = anyhow::Error::new(raw)
                        .context(format!("Gemini request failed ({endpoint})"));
                    if !is_retryable_transport_error(&err) || attempt >= max_retries {
                        return Err(err);
                    }
                    let delay_s = self.settings.retry_backoff_s * (attempt as f64 + 1.0);
                    thread::sleep(Duration::from_secs_f64(delay_s));
                }
            }
        }

        bail!("Gemini request failed ({endpoint}): retries exhausted")
    }

    fn parse_response(payload: &Value) -> VisionResponse {
        let text = payload
            .get("candidates")
            .and_then(Value::as_array)
            .and_then(|candidates| candidates.first())
            .and_then(|candidate| candidate.get("content"))
            .and_then(|content| content.get("parts"))
            .and_then(Value::as_array)
            .map(|parts| {
                parts
                    .iter()
                    .filter_map(|part| part.get("text").and_then(Value::as_str))
                    .collect::<String>()
            })
            .filter(|text| !text.is_empty());
        let block_reason = payload
            .get("promptFeedback")
            .or_else(|| payload.get("prompt_feedback"))
            .and_then(Value::as_object)
            .and_then(|feedback| {
                feedback
                    .get("blockReason")
                    .or_else(|| feedback.get("block_reason"))
            })
            .and_then(Value::as_str)
            .map(str::trim)
            .filter(|reason| !reason.is_empty())
            .map(str::to_string);
        VisionResponse { text, block_reason }
    }
}

impl VisionProvider for GeminiProvider {
    fn name(&self) -> &str {
        "gemini"
    }

    fn generate(&self, request: &VisionRequest) -> Result<VisionResponse> {
        let endpoint = self.endpoint_for_model(&request.model);
        let payload = Self::build_payload(request);
        let response = self.post_with_transport_retries(&endpoint, &request.api_key, &payload)?;
        let response_payload = response_json_or_error("Gemini", response)?;
        Ok(Self::parse_response(&response_payload))
    }
}

fn response_json_or_error(provider: &str, response: HttpResponse) -> Result<Value> {
    let status = response.status();
    let code = status.as_u16();
    let body = response
        .text()
        .with_context(|| format!("{provider} response body read failed"))?;
    if !status.is_success() {
        bail!(
            "{provider} request failed ({code}): {}",
            truncate_text(&provider_error_message(&body), 512)
        );
    }
    let parsed: Value = serde_json::from_str(&body)
        .with_context(|| format!("{provider} returned invalid JSON payload"))?;
    Ok(parsed)
}

/// Pulls `error.message` out of a Google API error body when there is one.
fn provider_error_message(body: &str) -> String {
    serde_json::from_str::<Map<String, Value>>(body)
        .ok()
        .and_then(|payload| {
            payload
                .get("error")
                .and_then(|error| error.get("message"))
                .and_then(Value::as_str)
                .map(str::to_string)
        })
        .unwrap_or_else(|| body.trim().to_string())
}

fn is_retryable_transport_error(err: &anyhow::Error) -> bool {
    err.chain().any(|cause| {
        cause
            .downcast_ref::<reqwest::Error>()
            .map(|reqwest_err| reqwest_err.is_timeout() || reqwest_err.is_connect())
            .unwrap_or(false)
    })
}
