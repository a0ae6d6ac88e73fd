use std::time::Duration;

use anyhow::{bail, Context, Result};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use imagegen_contracts::{GenerationRequest, Provider, TaskType};
use reqwest::blocking::Client as HttpClient;
use serde_json::{json, Map, Value};

use crate::config::GoogleConfig;
use crate::error::ProviderError;
use crate::extract::dedup_preserving_order;
use crate::imagery::{parse_input_image, InputImage, InputImageKind};
use crate::{truncate_text, Headers, ProviderAdapter, ERROR_BODY_PREVIEW_CHARS};

const REQUEST_ID_KEYS_GOOGLE: [&str; 4] = ["request_id", "id", "task_id", "responseId"];

/// Aspect ratios the generateContent image config accepts.
const SUPPORTED_ASPECT_RATIOS: [&str; 5] = ["1:1", "3:4", "4:3", "9:16", "16:9"];

pub struct GoogleAdapter {
    config: GoogleConfig,
    http: HttpClient,
}

impl GoogleAdapter {
    pub fn new(config: GoogleConfig) -> Self {
        Self {
            config,
            http: HttpClient::new(),
        }
    }

    /// Normalize any input-image reference into generateContent inline data.
    /// Remote URLs are fetched and re-encoded since the API takes bytes only.
    fn inline_data_from_input(&self, input: &InputImage) -> Result<Value> {
        let (mime_type, data) = match input.kind {
            InputImageKind::DataUri => {
                let (header, payload) = input
                    .value
                    .split_once(',')
                    .with_context(|| "malformed data URI input image")?;
                (mime_from_data_uri_header(header), payload.to_string())
            }
            InputImageKind::Url => {
                let response = self
                    .http
                    .get(&input.value)
                    .timeout(self.config.timeout)
                    .send()
                    .with_context(|| {
                        format!("google input image fetch failed ({})", input.value)
                    })?;
                let status = response.status();
                let content_type = response
                    .headers()
                    .get(reqwest::header::CONTENT_TYPE)
                    .and_then(|value| value.to_str().ok())
                    .map(mime_from_content_type)
                    .unwrap_or_else(|| "image/png".to_string());
                let bytes = response
                    .bytes()
                    .with_context(|| "google input image body read failed")?;
                if !status.is_success() {
                    bail!(ProviderError::Http {
                        provider: Provider::Google,
                        status: status.as_u16(),
                        body_preview: truncate_text(
                            &String::from_utf8_lossy(&bytes),
                            ERROR_BODY_PREVIEW_CHARS,
                        ),
                    });
                }
                (content_type, BASE64.encode(&bytes))
            }
            InputImageKind::Base64 => ("image/png".to_string(), input.value.clone()),
        };
        Ok(json!({ "inline_data": { "mime_type": mime_type, "data": data } }))
    }
}

impl ProviderAdapter for GoogleAdapter {
    fn provider(&self) -> Provider {
        Provider::Google
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

    fn target_url(&self, request: &GenerationRequest) -> Result<String> {
        let template = match request.task_type {
            TaskType::TextToImage => self.text2image_url(),
            TaskType::ImageToImage => self.image2image_url(),
        };
        if template.trim().is_empty() {
            bail!(ProviderError::MissingEndpoint {
                provider: Provider::Google,
                task: request.task_type,
            });
        }
        Ok(template.replace("{model}", &request.model))
    }

    fn build_headers(&self) -> Result<Headers> {
        if self.config.api_key.is_empty() {
            bail!(ProviderError::MissingApiKey {
                provider: Provider::Google,
            });
        }
        Ok(vec![
            ("x-goog-api-key", self.config.api_key.clone()),
            ("Content-Type", "application/json".to_string()),
        ])
    }

    fn build_payload(&self, request: &GenerationRequest) -> Result<Value> {
        let mut parts = vec![json!({ "text": request.prompt })];
        if request.task_type == TaskType::ImageToImage {
            if let Some(input) = parse_input_image(request.input_image.as_deref()) {
                parts.push(self.inline_data_from_input(&input)?);
            }
        }

        let mut generation_config = Map::new();
        generation_config.insert("responseModalities".to_string(), json!(["IMAGE"]));
        if let Some(ratio) = request.size.as_deref().and_then(size_to_aspect_ratio) {
            generation_config.insert("imageConfig".to_string(), json!({ "aspectRatio": ratio }));
        }

        let mut payload = Map::new();
        payload.insert(
            "contents".to_string(),
            json!([{ "parts": Value::Array(parts) }]),
        );
        payload.insert(
            "generationConfig".to_string(),
            Value::Object(generation_config),
        );
        for (key, value) in &request.extra {
            payload.insert(key.clone(), value.clone());
        }
        Ok(Value::Object(payload))
    }

    fn request_id_keys(&self) -> &[&str] {
        &REQUEST_ID_KEYS_GOOGLE
    }

    /// generateContent returns images as inlineData parts, not URL fields.
    /// The generic heuristics run first; inline parts are synthesized into
    /// data URIs and appended after.
    fn extract_images(&self, raw: &Value) -> Vec<String> {
        let mut images = crate::ImageHeuristics::default().collect(raw);
        walk_inline_data(raw, &mut images);
        dedup_preserving_order(images)
    }
}

fn mime_from_data_uri_header(header: &str) -> String {
    if header.contains(':') && header.contains(';') {
        if let Some(rest) = header.split(':').nth(1) {
            if let Some(mime) = rest.split(';').next() {
                if !mime.is_empty() {
                    return mime.to_string();
                }
            }
        }
    }
    "image/png".to_string()
}

fn mime_from_content_type(content_type: &str) -> String {
    let mime = content_type.split(';').next().unwrap_or("").trim();
    if mime.is_empty() {
        "image/png".to_string()
    } else {
        mime.to_string()
    }
}

/// Reduce an explicit WxH size to a supported aspect ratio string. Sizes
/// that do not reduce to a supported ratio are silently dropped; the API
/// rejects arbitrary ratios outright.
pub fn size_to_aspect_ratio(size: &str) -> Option<String> {
    let (width, height) = parse_size_pair(size)?;
    let ratio = reduce_ratio(width, height);
    SUPPORTED_ASPECT_RATIOS
        .contains(&ratio.as_str())
        .then_some(ratio)
}

fn parse_size_pair(size: &str) -> Option<(u32, u32)> {
    let lowered = size.to_ascii_lowercase();
    let (width, height) = lowered.split_once('x')?;
    let width: u32 = width.trim().parse().ok()?;
    let height: u32 = height.trim().parse().ok()?;
    if width == 0 || height == 0 {
        return None;
    }
    Some((width, height))
}

fn reduce_ratio(width: u32, height: u32) -> String {
    let divisor = gcd(width, height);
    format!("{}:{}", width / divisor, height / divisor)
}

fn gcd(mut a: u32, mut b: u32) -> u32 {
    while b != 0 {
        let remainder = a % b;
        a = b;
        b = remainder;
    }
    a
}

fn walk_inline_data(node: &Value, out: &mut Vec<String>) {
    match node {
        Value::Object(map) => {
            for (key, value) in map {
                if (key == "inlineData" || key == "inline_data") && value.is_object() {
                    if let Some(data) = value.get("data").and_then(Value::as_str) {
                        let mime = value
                            .get("mimeType")
                            .or_else(|| value.get("mime_type"))
                            .and_then(Value::as_str)
                            .unwrap_or("image/png");
                        out.push(format!("data:{mime};base64,{data}"));
                        continue;
                    }
                }
                walk_inline_data(value, out);
            }
        }
        Value::Array(items) => {
            for item in items {
                walk_inline_data(item, out);
            }
        }
        _ => {}
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use imagegen_contracts::{GenerationRequest, Provider, TaskType};
    use serde_json::{json, Map};

    use super::{
        mime_from_content_type, mime_from_data_uri_header, size_to_aspect_ratio, GoogleAdapter,
    };
    use crate::config::GoogleConfig;
    use crate::ProviderAdapter;

    fn test_config() -> GoogleConfig {
        GoogleConfig {
            api_key: "google-test".to_string(),
            text2image_url:
                "https://generativelanguage.googleapis.com/v1beta/models/{model}:generateContent"
                    .to_string(),
            image2image_url:
                "https://generativelanguage.googleapis.com/v1beta/models/{model}:generateContent"
                    .to_string(),
            timeout: Duration::from_secs(120),
        }
    }

    fn text_request() -> GenerationRequest {
        GenerationRequest {
            provider: Provider::Google,
            model: "gemini-2.5-flash-image".to_string(),
            task_type: TaskType::TextToImage,
            prompt: "A lighthouse in fog".to_string(),
            negative_prompt: None,
            input_image: None,
            size: Some("1920x1080".to_string()),
            n: 1,
            seed: None,
            extra: Map::new(),
        }
    }

    #[test]
    fn model_substituted_into_endpoint() {
        let adapter = GoogleAdapter::new(test_config());
        let url = adapter.target_url(&text_request()).unwrap();
        assert_eq!(
            url,
            "https://generativelanguage.googleapis.com/v1beta/models/gemini-2.5-flash-image:generateContent"
        );
    }

    #[test]
    fn supported_sizes_become_aspect_ratios() {
        assert_eq!(size_to_aspect_ratio("1920x1080"), Some("16:9".to_string()));
        assert_eq!(size_to_aspect_ratio("1000x1000"), Some("1:1".to_string()));
        assert_eq!(size_to_aspect_ratio("768X1024"), Some("3:4".to_string()));
        assert_eq!(size_to_aspect_ratio("1920x1081"), None);
        assert_eq!(size_to_aspect_ratio("0x100"), None);
        assert_eq!(size_to_aspect_ratio("garbage"), None);
    }

    #[test]
    fn payload_carries_parts_and_image_modality() {
        let adapter = GoogleAdapter::new(test_config());
        let payload = adapter.build_payload(&text_request()).unwrap();

        assert_eq!(
            payload["contents"][0]["parts"],
            json!([{ "text": "A lighthouse in fog" }])
        );
        assert_eq!(
            payload["generationConfig"]["responseModalities"],
            json!(["IMAGE"])
        );
        assert_eq!(
            payload["generationConfig"]["imageConfig"]["aspectRatio"],
            json!("16:9")
        );
    }

    #[test]
    fn unsupported_size_omits_image_config() {
        let adapter = GoogleAdapter::new(test_config());
        let mut request = text_request();
        request.size = Some("1234x777".to_string());
        let payload = adapter.build_payload(&request).unwrap();
        assert!(payload["generationConfig"].get("imageConfig").is_none());
    }

    #[test]
    fn data_uri_input_becomes_inline_data_verbatim() {
        let adapter = GoogleAdapter::new(test_config());
        let mut request = text_request();
        request.task_type = TaskType::ImageToImage;
        request.input_image = Some("data:image/jpeg;base64,aGVsbG8=".to_string());

        let payload = adapter.build_payload(&request).unwrap();
        assert_eq!(
            payload["contents"][0]["parts"][1],
            json!({ "inline_data": { "mime_type": "image/jpeg", "data": "aGVsbG8=" } })
        );
    }

    #[test]
    fn raw_base64_input_defaults_to_png_mime() {
        let adapter = GoogleAdapter::new(test_config());
        let mut request = text_request();
        request.task_type = TaskType::ImageToImage;
        request.input_image = Some("aGVsbG8=".to_string());

        let payload = adapter.build_payload(&request).unwrap();
        assert_eq!(
            payload["contents"][0]["parts"][1]["inline_data"]["mime_type"],
            json!("image/png")
        );
    }

    #[test]
    fn mime_parsing_falls_back_to_png() {
        assert_eq!(mime_from_data_uri_header("data:image/webp;base64"), "image/webp");
        assert_eq!(mime_from_data_uri_header("data:image/png"), "image/png");
        assert_eq!(mime_from_content_type("image/jpeg; charset=binary"), "image/jpeg");
        assert_eq!(mime_from_content_type("  "), "image/png");
    }

    #[test]
    fn inline_data_parts_extracted_as_data_uris() {
        let adapter = GoogleAdapter::new(test_config());
        let raw = json!({
            "responseId": "resp_1",
            "candidates": [{
                "content": {
                    "parts": [
                        {"text": "here is your image"},
                        {"inlineData": {"mimeType": "image/png", "data": "aGVsbG8="}}
                    ]
                }
            }]
        });
        assert_eq!(
            adapter.extract_images(&raw),
            vec!["data:image/png;base64,aGVsbG8=".to_string()]
        );
    }

    #[test]
    fn url_images_precede_inline_data_in_mixed_bodies() {
        let adapter = GoogleAdapter::new(test_config());
        let raw = json!({
            "image_url": "https://cdn.example.com/a.png",
            "candidates": [{
                "content": {
                    "parts": [{"inlineData": {"mimeType": "image/png", "data": "QUJD"}}]
                }
            }]
        });
        assert_eq!(
            adapter.extract_images(&raw),
            vec![
                "https://cdn.example.com/a.png".to_string(),
                "data:image/png;base64,QUJD".to_string(),
            ]
        );
    }

    #[test]
    fn text_to_image_ignores_any_input_image() {
        let adapter = GoogleAdapter::new(test_config());
        let mut request = text_request();
        request.input_image = Some("data:image/png;base64,aGVsbG8=".to_string());

        let payload = adapter.build_payload(&request).unwrap();
        assert_eq!(
            payload["contents"][0]["parts"],
            json!([{ "text": "A lighthouse in fog" }])
        );
    }

    #[test]
    fn inline_data_without_mime_defaults_to_png() {
        let adapter = GoogleAdapter::new(test_config());
        let raw = json!({"inline_data": {"data": "QUJD"}});
        assert_eq!(
            adapter.extract_images(&raw),
            vec!["data:image/png;base64,QUJD".to_string()]
        );
    }

    #[test]
    fn response_id_recognized_as_request_id() {
        let adapter = GoogleAdapter::new(test_config());
        let raw = json!({"responseId": "resp_42"});
        assert_eq!(adapter.extract_request_id(&raw), "resp_42");
    }

    #[test]
    fn missing_api_key_is_rejected() {
        let mut config = test_config();
        config.api_key = String::new();
        let adapter = GoogleAdapter::new(config);
        assert!(adapter.build_headers().is_err());
    }
}
