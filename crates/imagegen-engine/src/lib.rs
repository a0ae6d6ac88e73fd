pub mod alibaba;
pub mod autocrop;
pub mod config;
pub mod error;
pub mod extract;
pub mod glm;
pub mod google;
pub mod imagery;
pub mod runner;

use std::collections::BTreeMap;
use std::time::{Duration, Instant};

use anyhow::{bail, Context, Result};
use imagegen_contracts::{GenerationRequest, GenerationResponse, Provider, TaskType};
use reqwest::blocking::{Client as HttpClient, RequestBuilder, Response as HttpResponse};
use serde_json::{json, Value};

pub use crate::alibaba::AlibabaAdapter;
pub use crate::config::{AlibabaConfig, AutocropOptions, GlmConfig, GoogleConfig, RunnerConfig};
pub use crate::error::ProviderError;
pub use crate::extract::ImageHeuristics;
pub use crate::glm::GlmAdapter;
pub use crate::google::GoogleAdapter;

pub type Headers = Vec<(&'static str, String)>;

const ERROR_BODY_PREVIEW_CHARS: usize = 500;
const REQUEST_ID_KEYS: [&str; 3] = ["request_id", "id", "task_id"];

/// Translator between the unified request/response model and one concrete
/// provider HTTP API. `generate` has a shared default pipeline; providers
/// supply payloads, headers, and any extraction specifics.
pub trait ProviderAdapter: Send + Sync {
    fn provider(&self) -> Provider;
    fn http(&self) -> &HttpClient;
    fn timeout(&self) -> Duration;
    fn text2image_url(&self) -> &str;
    fn image2image_url(&self) -> &str;
    fn build_headers(&self) -> Result<Headers>;
    fn build_payload(&self, request: &GenerationRequest) -> Result<Value>;

    fn target_url(&self, request: &GenerationRequest) -> Result<String> {
        let target = match request.task_type {
            TaskType::TextToImage => self.text2image_url(),
            TaskType::ImageToImage => self.image2image_url(),
        };
        if target.trim().is_empty() {
            bail!(ProviderError::MissingEndpoint {
                provider: self.provider(),
                task: request.task_type,
            });
        }
        Ok(target.to_string())
    }

    fn request_id_keys(&self) -> &[&str] {
        &REQUEST_ID_KEYS
    }

    fn extract_request_id(&self, raw: &Value) -> String {
        extract_request_id(raw, self.request_id_keys())
    }

    fn extract_images(&self, raw: &Value) -> Vec<String> {
        ImageHeuristics::default().collect(raw)
    }

    fn generate(&self, request: &GenerationRequest) -> Result<GenerationResponse> {
        generate_once(self, request)
    }
}

/// The default single-POST pipeline: resolve URL, build payload and headers,
/// one timed HTTP round trip, then normalize the body into a response.
pub fn generate_once<A: ProviderAdapter + ?Sized>(
    adapter: &A,
    request: &GenerationRequest,
) -> Result<GenerationResponse> {
    let url = adapter.target_url(request)?;
    let payload = adapter.build_payload(request)?;
    let headers = adapter.build_headers()?;

    let started = Instant::now();
    let raw = post_json(
        adapter.http(),
        adapter.provider(),
        &url,
        &headers,
        &payload,
        adapter.timeout(),
    )?;
    let latency_ms = started.elapsed().as_millis() as u64;

    Ok(GenerationResponse {
        request_id: adapter.extract_request_id(&raw),
        provider: request.provider,
        model: request.model.clone(),
        task_type: request.task_type,
        images: adapter.extract_images(&raw),
        latency_ms,
        raw_response: raw,
    })
}

pub(crate) fn post_json(
    http: &HttpClient,
    provider: Provider,
    url: &str,
    headers: &Headers,
    payload: &Value,
    timeout: Duration,
) -> Result<Value> {
    let builder = apply_headers(http.post(url).timeout(timeout).json(payload), headers);
    let response = builder
        .send()
        .with_context(|| format!("{provider} request failed ({url})"))?;
    read_json_body(provider, response)
}

/// Body is parsed as JSON when possible, otherwise wrapped as
/// `{"raw_text": ...}` so diagnostics always carry the payload. Non-2xx
/// statuses become a structured HTTP error with a truncated preview.
pub(crate) fn read_json_body(provider: Provider, response: HttpResponse) -> Result<Value> {
    let status = response.status();
    let body = response
        .text()
        .with_context(|| format!("{provider} response body read failed"))?;
    let raw = json_or_raw_text(&body);
    if !status.is_success() {
        bail!(ProviderError::Http {
            provider,
            status: status.as_u16(),
            body_preview: truncate_text(&raw.to_string(), ERROR_BODY_PREVIEW_CHARS),
        });
    }
    Ok(raw)
}

pub(crate) fn json_or_raw_text(body: &str) -> Value {
    serde_json::from_str(body).unwrap_or_else(|_| json!({ "raw_text": body }))
}

pub(crate) fn apply_headers(mut builder: RequestBuilder, headers: &Headers) -> RequestBuilder {
    for (name, value) in headers {
        builder = builder.header(*name, value.as_str());
    }
    builder
}

pub fn extract_request_id(raw: &Value, keys: &[&str]) -> String {
    if let Some(map) = raw.as_object() {
        for key in keys {
            if let Some(value) = map.get(*key).and_then(Value::as_str) {
                let trimmed = value.trim();
                if !trimmed.is_empty() {
                    return trimmed.to_string();
                }
            }
        }
    }
    fallback_request_id()
}

/// Locally generated stand-in when the provider did not return an id.
/// Collision-unlikely, not collision-proof.
pub fn fallback_request_id() -> String {
    let hex = uuid::Uuid::new_v4().simple().to_string();
    hex[..12].to_string()
}

pub fn truncate_text(value: &str, max_chars: usize) -> String {
    if value.chars().count() <= max_chars {
        return value.to_string();
    }
    value.chars().take(max_chars).collect()
}

#[derive(Default)]
pub struct AdapterRegistry {
    adapters: BTreeMap<Provider, Box<dyn ProviderAdapter>>,
}

impl AdapterRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_env() -> Self {
        let mut registry = Self::new();
        registry.register(AlibabaAdapter::new(AlibabaConfig::from_env()));
        registry.register(GoogleAdapter::new(GoogleConfig::from_env()));
        registry.register(GlmAdapter::new(GlmConfig::from_env()));
        registry
    }

    pub fn register<A: ProviderAdapter + 'static>(&mut self, adapter: A) {
        self.adapters.insert(adapter.provider(), Box::new(adapter));
    }

    pub fn get(&self, provider: Provider) -> Option<&dyn ProviderAdapter> {
        self.adapters
            .get(&provider)
            .map(|adapter| adapter.as_ref())
    }

    pub fn providers(&self) -> Vec<Provider> {
        self.adapters.keys().copied().collect()
    }
}
