use std::env;
use std::time::Duration;

pub const ALIBABA_HOST_INTL: &str = "https://dashscope-intl.aliyuncs.com";
pub const ALIBABA_HOST_CN: &str = "https://dashscope.aliyuncs.com";
pub const ALIBABA_SYNC_PATH: &str = "/api/v1/services/aigc/multimodal-generation/generation";
pub const ALIBABA_ASYNC_PATH: &str = "/api/v1/services/aigc/image-generation/generation";
pub const GOOGLE_GENERATE_CONTENT_URL: &str =
    "https://generativelanguage.googleapis.com/v1beta/models/{model}:generateContent";
pub const GLM_BASE_URL_DEFAULT: &str = "https://open.bigmodel.cn/api/paas/v4";
pub const GLM_IMAGE_GENERATIONS_PATH: &str = "/images/generations";

/// DashScope hard per-side pixel bounds for image-to-image inputs.
pub const ALIBABA_IMAGE_MIN: u32 = 512;
pub const ALIBABA_IMAGE_MAX: u32 = 2048;

pub const AUTOCROP_ENV: &str = "IGT_ALIBABA_IMAGE2IMAGE_AUTOCROP";
pub const PERSIST_PREPROCESSED_INPUT_ENV: &str = "IGT_PERSIST_PREPROCESSED_INPUT";

pub fn non_empty_env(name: &str) -> Option<String> {
    env::var(name)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

pub fn env_flag(name: &str, default: bool) -> bool {
    match non_empty_env(name) {
        Some(value) => matches!(
            value.to_ascii_lowercase().as_str(),
            "1" | "true" | "yes" | "on"
        ),
        None => default,
    }
}

fn env_u64(name: &str, default: u64) -> u64 {
    non_empty_env(name)
        .and_then(|value| value.parse().ok())
        .unwrap_or(default)
}

fn env_u32(name: &str, default: u32) -> u32 {
    non_empty_env(name)
        .and_then(|value| value.parse().ok())
        .unwrap_or(default)
}

pub fn http_timeout_from_env() -> Duration {
    Duration::from_secs(env_u64("HTTP_TIMEOUT_SECONDS", 120))
}

#[derive(Debug, Clone)]
pub struct AlibabaConfig {
    pub api_key: String,
    pub text2image_url: String,
    pub image2image_url: String,
    pub timeout: Duration,
    pub async_mode: bool,
    pub async_url: String,
    pub poll_interval: Duration,
    pub poll_timeout: Duration,
}

impl AlibabaConfig {
    pub fn from_env() -> Self {
        let host = match non_empty_env("ALIBABA_REGION")
            .map(|value| value.to_ascii_lowercase())
            .as_deref()
        {
            Some("cn") => ALIBABA_HOST_CN,
            _ => ALIBABA_HOST_INTL,
        };
        let text2image_url = non_empty_env("ALIBABA_TEXT2IMAGE_URL")
            .unwrap_or_else(|| format!("{host}{ALIBABA_SYNC_PATH}"));
        let image2image_url =
            non_empty_env("ALIBABA_IMAGE2IMAGE_URL").unwrap_or_else(|| text2image_url.clone());
        Self {
            api_key: non_empty_env("ALIBABA_API_KEY").unwrap_or_default(),
            async_mode: env_flag("ALIBABA_ASYNC", false),
            async_url: non_empty_env("ALIBABA_ASYNC_URL")
                .unwrap_or_else(|| format!("{host}{ALIBABA_ASYNC_PATH}")),
            poll_interval: Duration::from_secs(env_u64("ALIBABA_POLL_INTERVAL_SECONDS", 10)),
            poll_timeout: Duration::from_secs(env_u64("ALIBABA_POLL_TIMEOUT_SECONDS", 300)),
            timeout: http_timeout_from_env(),
            text2image_url,
            image2image_url,
        }
    }
}

#[derive(Debug, Clone)]
pub struct GoogleConfig {
    pub api_key: String,
    pub text2image_url: String,
    pub image2image_url: String,
    pub timeout: Duration,
}

impl GoogleConfig {
    pub fn from_env() -> Self {
        Self {
            api_key: non_empty_env("GOOGLE_API_KEY").unwrap_or_default(),
            text2image_url: non_empty_env("GOOGLE_TEXT2IMAGE_URL")
                .unwrap_or_else(|| GOOGLE_GENERATE_CONTENT_URL.to_string()),
            image2image_url: non_empty_env("GOOGLE_IMAGE2IMAGE_URL")
                .unwrap_or_else(|| GOOGLE_GENERATE_CONTENT_URL.to_string()),
            timeout: http_timeout_from_env(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct GlmConfig {
    pub api_key: String,
    pub text2image_url: String,
    pub image2image_url: String,
    pub timeout: Duration,
}

impl GlmConfig {
    pub fn from_env() -> Self {
        let base_url =
            non_empty_env("GLM_BASE_URL").unwrap_or_else(|| GLM_BASE_URL_DEFAULT.to_string());
        let text2image_url = non_empty_env("GLM_TEXT2IMAGE_URL")
            .unwrap_or_else(|| format!("{base_url}{GLM_IMAGE_GENERATIONS_PATH}"));
        let image2image_url =
            non_empty_env("GLM_IMAGE2IMAGE_URL").unwrap_or_else(|| text2image_url.clone());
        Self {
            api_key: non_empty_env("GLM_API_KEY").unwrap_or_default(),
            timeout: http_timeout_from_env(),
            text2image_url,
            image2image_url,
        }
    }
}

/// Auto-crop is opt-in; persistence of the preprocessed input is a separate
/// opt-in on top of it.
#[derive(Debug, Clone)]
pub struct AutocropOptions {
    pub enabled: bool,
    pub persist_input: bool,
    pub http_timeout: Duration,
}

impl Default for AutocropOptions {
    fn default() -> Self {
        Self {
            enabled: false,
            persist_input: false,
            http_timeout: Duration::from_secs(120),
        }
    }
}

impl AutocropOptions {
    pub fn from_env() -> Self {
        Self {
            enabled: env_flag(AUTOCROP_ENV, false),
            persist_input: env_flag(PERSIST_PREPROCESSED_INPUT_ENV, false),
            http_timeout: http_timeout_from_env(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct RunnerConfig {
    pub max_retries: u32,
    pub retry_delay: Duration,
    /// Extension for the readable alias written next to downloaded `.bin`
    /// files; None disables the alias copy.
    pub bin_alias_ext: Option<String>,
    pub persist_preprocessed: bool,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            max_retries: 1,
            retry_delay: Duration::from_secs(2),
            bin_alias_ext: Some("png".to_string()),
            persist_preprocessed: false,
        }
    }
}

impl RunnerConfig {
    pub fn from_env() -> Self {
        Self {
            max_retries: env_u32("MAX_RETRIES", 1),
            retry_delay: Duration::from_secs(env_u64("RETRY_DELAY_SECONDS", 2)),
            bin_alias_ext: resolve_bin_alias_ext(
                non_empty_env("IGT_BIN_ALIAS_FORMAT").as_deref().unwrap_or("png"),
            ),
            persist_preprocessed: env_flag(PERSIST_PREPROCESSED_INPUT_ENV, false),
        }
    }
}

pub fn resolve_bin_alias_ext(raw: &str) -> Option<String> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "off" | "none" | "disable" | "disabled" | "" => None,
        "jpg" | "jpeg" => Some("jpg".to_string()),
        _ => Some("png".to_string()),
    }
}
