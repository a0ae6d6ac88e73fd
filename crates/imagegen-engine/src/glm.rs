use std::time::Duration;

use anyhow::{bail, Result};
use imagegen_contracts::{GenerationRequest, Provider, TaskType};
use reqwest::blocking::Client as HttpClient;
use serde_json::{json, Map, Value};

use crate::config::GlmConfig;
use crate::error::ProviderError;
use crate::imagery::parse_input_image;
use crate::{Headers, ProviderAdapter};

/// GLM speaks a flat OpenAI-style images endpoint, so this adapter is the
/// whole default pipeline with a thin payload on top.
pub struct GlmAdapter {
    config: GlmConfig,
    http: HttpClient,
}

impl GlmAdapter {
    pub fn new(config: GlmConfig) -> Self {
        Self {
            config,
            http: HttpClient::new(),
        }
    }
}

impl ProviderAdapter for GlmAdapter {
    fn provider(&self) -> Provider {
        Provider::Glm
    }

    fn http(&self) -> &HttpClient {
        &self.http
    }

    fn timeout(&self) -> Duration {
        self.config.timeout
    }

    fn text2image_url(&self) -> &str {
        &self.config.text2image_url
    }

    fn image2image_url(&self) -> &str {
        &self.config.image2image_url
    }

    fn build_headers(&self) -> Result<Headers> {
        if self.config.api_key.is_empty() {
            bail!(ProviderError::MissingApiKey {
                provider: Provider::Glm,
            });
        }
        Ok(vec![
            ("Authorization", format!("Bearer {}", self.config.api_key)),
            ("Content-Type", "application/json".to_string()),
        ])
    }

    fn build_payload(&self, request: &GenerationRequest) -> Result<Value> {
        let mut payload = Map::new();
        payload.insert("model".to_string(), json!(request.model));
        payload.insert("prompt".to_string(), json!(request.prompt));
        if let Some(size) = request.size.as_deref() {
            payload.insert("size".to_string(), json!(size));
        }
        // The endpoint defaults to one image; only an explicit batch is sent.
        if request.n > 1 {
            payload.insert("n".to_string(), json!(request.n));
        }
        if let Some(seed) = request.seed {
            payload.insert("seed".to_string(), json!(seed));
        }
        if let Some(negative_prompt) = request.negative_prompt.as_deref() {
            payload.insert("negative_prompt".to_string(), json!(negative_prompt));
        }
        if request.task_type == TaskType::ImageToImage {
            if let Some(image) = parse_input_image(request.input_image.as_deref()) {
                payload.insert("image_url".to_string(), json!(image.value));
            }
        }
        for (key, value) in &request.extra {
            payload.insert(key.clone(), value.clone());
        }
        Ok(Value::Object(payload))
    }
}
