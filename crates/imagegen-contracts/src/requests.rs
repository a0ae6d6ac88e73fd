use std::fmt;
use std::str::FromStr;

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Provider {
    Alibaba,
    Google,
    Glm,
}

impl Provider {
    pub fn as_str(&self) -> &'static str {
        match self {
            Provider::Alibaba => "alibaba",
            Provider::Google => "google",
            Provider::Glm => "glm",
        }
    }

    pub fn all() -> [Provider; 3] {
        [Provider::Alibaba, Provider::Google, Provider::Glm]
    }
}

impl fmt::Display for Provider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Provider {
    type Err = anyhow::Error;

    fn from_str(raw: &str) -> Result<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "alibaba" => Ok(Provider::Alibaba),
            "google" => Ok(Provider::Google),
            "glm" => Ok(Provider::Glm),
            other => bail!("unknown provider '{other}' (expected alibaba, google, or glm)"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskType {
    TextToImage,
    ImageToImage,
}

impl TaskType {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskType::TextToImage => "text_to_image",
            TaskType::ImageToImage => "image_to_image",
        }
    }
}

impl fmt::Display for TaskType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TaskType {
    type Err = anyhow::Error;

    fn from_str(raw: &str) -> Result<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "text_to_image" => Ok(TaskType::TextToImage),
            "image_to_image" => Ok(TaskType::ImageToImage),
            other => {
                bail!("unknown task_type '{other}' (expected text_to_image or image_to_image)")
            }
        }
    }
}

/// One generation call. Built once per attempt and never mutated; the
/// auto-crop preprocessor derives a new value instead of editing in place.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GenerationRequest {
    pub provider: Provider,
    pub model: String,
    pub task_type: TaskType,
    pub prompt: String,
    #[serde(default)]
    pub negative_prompt: Option<String>,
    #[serde(default)]
    pub input_image: Option<String>,
    #[serde(default)]
    pub size: Option<String>,
    #[serde(default = "default_n")]
    pub n: u32,
    #[serde(default)]
    pub seed: Option<i64>,
    #[serde(default)]
    pub extra: Map<String, Value>,
}

fn default_n() -> u32 {
    1
}

impl GenerationRequest {
    /// Deserialize and validate in one step; used for batch files and
    /// persisted request.json replay.
    pub fn from_json(value: Value) -> Result<Self> {
        let request: GenerationRequest =
            serde_json::from_value(value).context("invalid generation request")?;
        request.validate()?;
        Ok(request)
    }

    pub fn validate(&self) -> Result<()> {
        if self.model.trim().is_empty() {
            bail!("model must not be blank");
        }
        if self.prompt.trim().is_empty() {
            bail!("prompt must not be blank");
        }
        if let Some(size) = self.size.as_deref() {
            if size.trim().is_empty() {
                bail!("size must not be blank");
            }
        }
        if let Some(negative_prompt) = self.negative_prompt.as_deref() {
            if negative_prompt.trim().is_empty() {
                bail!("negative_prompt must not be blank");
            }
        }
        if self.n < 1 {
            bail!("n must be at least 1");
        }
        if self.task_type == TaskType::ImageToImage
            && self
                .input_image
                .as_deref()
                .map(str::trim)
                .filter(|value| !value.is_empty())
                .is_none()
        {
            bail!("input_image is required for image_to_image");
        }
        Ok(())
    }

    pub fn to_value(&self) -> Value {
        serde_json::to_value(self).unwrap_or(Value::Null)
    }
}

/// Normalized result of a completed call. `images` holds HTTP(S) URLs or
/// `data:image/...;base64,...` URIs, deduplicated in first-seen order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GenerationResponse {
    pub request_id: String,
    pub provider: Provider,
    pub model: String,
    pub task_type: TaskType,
    pub images: Vec<String>,
    pub latency_ms: u64,
    pub raw_response: Value,
}

impl GenerationResponse {
    pub fn to_value(&self) -> Value {
        serde_json::to_value(self).unwrap_or(Value::Null)
    }
}
