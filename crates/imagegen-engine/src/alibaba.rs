use std::thread;
use std::time::{Duration, Instant};

use anyhow::{bail, Context, Result};
use imagegen_contracts::{GenerationRequest, GenerationResponse, Provider, TaskType};
use reqwest::blocking::Client as HttpClient;
use serde_json::{json, Map, Value};

use crate::config::AlibabaConfig;
use crate::error::{sync_unsupported, ProviderError};
use crate::imagery::parse_input_image;
use crate::{apply_headers, generate_once, read_json_body, Headers, ProviderAdapter};

const TASKS_PATH_PREFIX: &str = "/api/v1/tasks/";

/// DashScope adapter. The sync endpoint serves most models; some models only
/// accept the create-then-poll task protocol, which this adapter speaks
/// transparently (always in async mode, or as a fallback when the sync
/// endpoint rejects the model).
pub struct AlibabaAdapter {
    config: AlibabaConfig,
    http: HttpClient,
}

impl AlibabaAdapter {
    pub fn new(config: AlibabaConfig) -> Self {
        Self {
            config,
            http: HttpClient::new(),
        }
    }

    fn generate_async(&self, request: &GenerationRequest) -> Result<GenerationResponse> {
        let create_url = if self.config.async_url.trim().is_empty() {
            derive_async_url(&self.target_url(request)?)
        } else {
            self.config.async_url.clone()
        };
        let payload = self.build_payload(request)?;
        let mut headers = self.build_headers()?;
        headers.push(("X-DashScope-Async", "enable".to_string()));

        let started = Instant::now();
        let builder = apply_headers(
            self.http
                .post(&create_url)
                .timeout(self.config.timeout)
                .json(&payload),
            &headers,
        );
        let response = builder
            .send()
            .with_context(|| format!("alibaba async create request failed ({create_url})"))?;
        let create_raw = read_json_body(Provider::Alibaba, response)?;

        let Some(task_id) = extract_task_id(&create_raw) else {
            bail!(ProviderError::Protocol {
                provider: Provider::Alibaba,
                detail: format!("async create missing task_id: {create_raw}"),
            });
        };

        let task_url = build_task_url(&create_url, &task_id)?;
        let final_raw = self.poll_task(&task_url, &headers)?;
        let latency_ms = started.elapsed().as_millis() as u64;

        Ok(GenerationResponse {
            request_id: task_id,
            provider: request.provider,
            model: request.model.clone(),
            task_type: request.task_type,
            images: self.extract_images(&final_raw),
            latency_ms,
            raw_response: json!({
                "create_task": create_raw,
                "task_result": final_raw,
            }),
        })
    }

    /// Blocking poll loop: GET the task until it reaches a terminal status
    /// or the deadline passes. An exceeded deadline is a distinct timeout
    /// error; the task's true outcome is unknown at that point.
    fn poll_task(&self, task_url: &str, headers: &Headers) -> Result<Value> {
        let deadline = Instant::now() + self.config.poll_timeout;
        while Instant::now() < deadline {
            let builder = apply_headers(
                self.http.get(task_url).timeout(self.config.timeout),
                headers,
            );
            let response = builder
                .send()
                .with_context(|| format!("alibaba async poll request failed ({task_url})"))?;
            let poll_raw = read_json_body(Provider::Alibaba, response)?;

            match extract_task_status(&poll_raw).as_str() {
                "SUCCEEDED" | "SUCCESS" => return Ok(poll_raw),
                "FAILED" | "CANCELED" | "CANCELLED" => bail!(ProviderError::Protocol {
                    provider: Provider::Alibaba,
                    detail: format!("async task failed: {poll_raw}"),
                }),
                _ => thread::sleep(self.config.poll_interval),
            }
        }
        bail!(ProviderError::PollTimeout {
            provider: Provider::Alibaba,
            seconds: self.config.poll_timeout.as_secs(),
        })
    }
}

impl ProviderAdapter for AlibabaAdapter {
    fn provider(&self) -> Provider {
        Provider::Alibaba
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
                provider: Provider::Alibaba,
            });
        }
        Ok(vec![
            ("Authorization", format!("Bearer {}", self.config.api_key)),
            ("Content-Type", "application/json".to_string()),
        ])
    }

    fn build_payload(&self, request: &GenerationRequest) -> Result<Value> {
        let mut content = vec![json!({ "text": request.prompt })];
        if let Some(image) = parse_input_image(request.input_image.as_deref()) {
            content.push(json!({ "image": image.value }));
        }

        let enable_interleave = request.task_type != TaskType::ImageToImage;
        let mut parameters = Map::new();
        parameters.insert("enable_interleave".to_string(), json!(enable_interleave));
        parameters.insert("watermark".to_string(), json!(false));
        if let Some(size) = request.size.as_deref() {
            parameters.insert("size".to_string(), json!(size.replace('x', "*")));
        }
        // The interleaved (text-to-image) family counts images as max_images.
        if enable_interleave {
            parameters.insert("max_images".to_string(), json!(request.n));
        } else {
            parameters.insert("n".to_string(), json!(request.n));
        }
        if let Some(seed) = request.seed {
            parameters.insert("seed".to_string(), json!(seed));
        }
        if let Some(negative_prompt) = request.negative_prompt.as_deref() {
            parameters.insert("negative_prompt".to_string(), json!(negative_prompt));
        }

        let mut payload = Map::new();
        payload.insert("model".to_string(), json!(request.model));
        payload.insert(
            "input".to_string(),
            json!({ "messages": [{ "role": "user", "content": content }] }),
        );
        payload.insert("parameters".to_string(), Value::Object(parameters));

        // Shallow last-wins override for rapid experimentation.
        for (key, value) in &request.extra {
            payload.insert(key.clone(), value.clone());
        }
        Ok(Value::Object(payload))
    }

    fn generate(&self, request: &GenerationRequest) -> Result<GenerationResponse> {
        if self.config.async_mode {
            return self.generate_async(request);
        }
        match generate_once(self, request) {
            Err(err) if sync_unsupported(&err) => self.generate_async(request),
            other => other,
        }
    }
}

fn derive_async_url(url: &str) -> String {
    url.replace("/multimodal-generation/", "/image-generation/")
}

fn build_task_url(create_url: &str, task_id: &str) -> Result<String> {
    let mut url = reqwest::Url::parse(create_url)
        .with_context(|| format!("invalid alibaba async create URL: {create_url}"))?;
    url.set_path(&format!("{TASKS_PATH_PREFIX}{task_id}"));
    url.set_query(None);
    url.set_fragment(None);
    Ok(url.to_string())
}

fn extract_task_id(raw: &Value) -> Option<String> {
    let map = raw.as_object()?;
    let nested = map
        .get("output")
        .and_then(Value::as_object)
        .and_then(|output| output.get("task_id"))
        .and_then(Value::as_str);
    let value = nested.or_else(|| map.get("task_id").and_then(Value::as_str))?;
    let trimmed = value.trim();
    if trimmed.is_empty() {
        return None;
    }
    Some(trimmed.to_string())
}

fn extract_task_status(raw: &Value) -> String {
    let status = raw
        .as_object()
        .and_then(|map| {
            map.get("output")
                .and_then(Value::as_object)
                .and_then(|output| output.get("task_status"))
                .and_then(Value::as_str)
                .or_else(|| map.get("task_status").and_then(Value::as_str))
        })
        .unwrap_or("UNKNOWN");
    status.to_ascii_uppercase()
}
