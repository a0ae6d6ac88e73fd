use std::fs;
use std::path::{Path, PathBuf};
use std::thread;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use imagegen_contracts::{GenerationRequest, GenerationResponse, TaskType};
use reqwest::blocking::Client as HttpClient;
use serde_json::json;

use crate::autocrop::{cleanup_temp_files, prepare_request};
use crate::config::{AutocropOptions, RunnerConfig};
use crate::imagery::{infer_image_size, safe_b64_decode};
use crate::ProviderAdapter;

const IMAGE_DOWNLOAD_TIMEOUT: Duration = Duration::from_secs(60);

/// Completed run plus everything needed to persist it: the request as it
/// was actually sent (post-preprocessing) and any temp files awaiting
/// cleanup.
pub struct RunArtifacts {
    pub request: GenerationRequest,
    pub response: GenerationResponse,
    pub temp_paths: Vec<PathBuf>,
}

/// Preprocess, then attempt the call up to `1 + max_retries` times. Temp
/// files survive a successful run so they can be persisted; a final failure
/// cleans them up before returning the error.
pub fn run_with_retry_with_artifacts(
    adapter: &dyn ProviderAdapter,
    request: &GenerationRequest,
    autocrop: &AutocropOptions,
    config: &RunnerConfig,
) -> Result<RunArtifacts> {
    let (prepared, temp_paths) = prepare_request(request, autocrop)?;

    let mut last_error = None;
    for attempt in 0..=config.max_retries {
        match adapter.generate(&prepared) {
            Ok(response) => {
                return Ok(RunArtifacts {
                    request: prepared,
                    response,
                    temp_paths,
                })
            }
            Err(err) => {
                last_error = Some(err);
                if attempt < config.max_retries {
                    thread::sleep(config.retry_delay);
                }
            }
        }
    }

    cleanup_temp_files(&temp_paths);
    let err = last_error.unwrap_or_else(|| anyhow!("no attempts were made"));
    Err(err.context(format!(
        "request failed after {} attempt(s)",
        config.max_retries + 1
    )))
}

pub fn run_with_retry(
    adapter: &dyn ProviderAdapter,
    request: &GenerationRequest,
    autocrop: &AutocropOptions,
    config: &RunnerConfig,
) -> Result<GenerationResponse> {
    let artifacts = run_with_retry_with_artifacts(adapter, request, autocrop, config)?;
    cleanup_temp_files(&artifacts.temp_paths);
    Ok(artifacts.response)
}

/// Write one run directory under `output_dir`:
/// `{timestamp}_{provider}_{task}_{request_id}/` containing request.json,
/// response.json, saved_images.json, the downloaded/decoded images, and
/// (when enabled) copies of preprocessed inputs.
pub fn persist_run(
    output_dir: &Path,
    artifacts: &RunArtifacts,
    config: &RunnerConfig,
) -> Result<PathBuf> {
    let response = &artifacts.response;
    let timestamp = chrono::Local::now().format("%Y%m%d-%H%M%S");
    let run_dir = output_dir.join(format!(
        "{timestamp}_{}_{}_{}",
        response.provider, response.task_type, response.request_id
    ));
    fs::create_dir_all(&run_dir)
        .with_context(|| format!("run directory creation failed ({})", run_dir.display()))?;

    write_pretty_json(&run_dir.join("request.json"), &artifacts.request.to_value())?;
    write_pretty_json(&run_dir.join("response.json"), &response.to_value())?;

    let saved = save_images(&run_dir, &response.images, config)?;
    write_pretty_json(&run_dir.join("saved_images.json"), &json!(saved))?;

    if config.persist_preprocessed && !artifacts.temp_paths.is_empty() {
        persist_preprocessed_inputs(&run_dir, &artifacts.temp_paths)?;
    }
    Ok(run_dir)
}

fn write_pretty_json(path: &Path, value: &serde_json::Value) -> Result<()> {
    let body = serde_json::to_string_pretty(value).context("JSON serialization failed")?;
    fs::write(path, body).with_context(|| format!("write failed ({})", path.display()))
}

fn persist_preprocessed_inputs(run_dir: &Path, temp_paths: &[PathBuf]) -> Result<()> {
    let target_dir = run_dir.join("preprocessed_inputs");
    fs::create_dir_all(&target_dir)
        .with_context(|| format!("directory creation failed ({})", target_dir.display()))?;

    let mut names = Vec::new();
    for path in temp_paths {
        let Some(name) = path.file_name() else {
            continue;
        };
        fs::copy(path, target_dir.join(name))
            .with_context(|| format!("preprocessed input copy failed ({})", path.display()))?;
        names.push(name.to_string_lossy().into_owned());
    }
    write_pretty_json(&run_dir.join("preprocessed_inputs.json"), &json!(names))
}

/// Materialize each image reference as a file in the run directory. Every
/// branch has a lossless fallback so a run directory never silently drops
/// an image the provider returned.
pub fn save_images(run_dir: &Path, images: &[String], config: &RunnerConfig) -> Result<Vec<String>> {
    let mut saved = Vec::new();
    for (index, image) in images.iter().enumerate() {
        let stem = format!("image_{}", index + 1);
        let name = if image.starts_with("http://") || image.starts_with("https://") {
            save_url_image(run_dir, &stem, image, config)?
        } else if image.starts_with("data:image/") {
            save_data_uri_image(run_dir, &stem, image)?
        } else {
            save_raw_base64_image(run_dir, &stem, image)?
        };
        saved.push(name);
    }
    Ok(saved)
}

fn save_url_image(
    run_dir: &Path,
    stem: &str,
    url: &str,
    config: &RunnerConfig,
) -> Result<String> {
    let downloaded = HttpClient::new()
        .get(url)
        .timeout(IMAGE_DOWNLOAD_TIMEOUT)
        .send()
        .ok()
        .filter(|response| response.status().is_success())
        .and_then(|response| response.bytes().ok());

    let Some(bytes) = downloaded else {
        // Signed URLs expire; keep the reference so the run stays auditable.
        let name = format!("{stem}.url.txt");
        fs::write(run_dir.join(&name), url)
            .with_context(|| format!("image URL note write failed ({name})"))?;
        return Ok(name);
    };

    let name = format!("{stem}.bin");
    fs::write(run_dir.join(&name), &bytes)
        .with_context(|| format!("image write failed ({name})"))?;
    if let Some(ext) = config.bin_alias_ext.as_deref() {
        let alias = format!("{stem}.{ext}");
        fs::copy(run_dir.join(&name), run_dir.join(alias))
            .with_context(|| format!("image alias copy failed ({name})"))?;
    }
    Ok(name)
}

fn save_data_uri_image(run_dir: &Path, stem: &str, uri: &str) -> Result<String> {
    let decoded = uri.split_once(',').and_then(|(header, payload)| {
        let cleaned: String = payload.chars().filter(|c| !c.is_ascii_whitespace()).collect();
        safe_b64_decode(&cleaned).map(|bytes| (data_uri_extension(header), bytes))
    });

    match decoded {
        Some((ext, bytes)) => {
            let name = format!("{stem}.{ext}");
            fs::write(run_dir.join(&name), bytes)
                .with_context(|| format!("image write failed ({name})"))?;
            Ok(name)
        }
        None => {
            let name = format!("{stem}.txt");
            fs::write(run_dir.join(&name), uri)
                .with_context(|| format!("image text fallback write failed ({name})"))?;
            Ok(name)
        }
    }
}

fn save_raw_base64_image(run_dir: &Path, stem: &str, value: &str) -> Result<String> {
    match safe_b64_decode(value) {
        Some(bytes) => {
            let name = format!("{stem}.png");
            fs::write(run_dir.join(&name), bytes)
                .with_context(|| format!("image write failed ({name})"))?;
            Ok(name)
        }
        None => {
            let name = format!("{stem}.txt");
            fs::write(run_dir.join(&name), value)
                .with_context(|| format!("image text fallback write failed ({name})"))?;
            Ok(name)
        }
    }
}

fn data_uri_extension(header: &str) -> String {
    let subtype = header
        .strip_prefix("data:image/")
        .map(|rest| rest.split(';').next().unwrap_or(""))
        .unwrap_or("");
    if subtype.is_empty() || !subtype.chars().all(|c| c.is_ascii_alphanumeric()) {
        "png".to_string()
    } else {
        subtype.to_ascii_lowercase()
    }
}

/// Size resolution order: explicit request size, then the input image's own
/// dimensions for image-to-image, then the text-to-image default.
pub fn resolve_request_size(
    task_type: TaskType,
    supplied: Option<&str>,
    input_image: Option<&str>,
) -> Option<String> {
    if let Some(size) = supplied.map(str::trim).filter(|s| !s.is_empty()) {
        return Some(size.to_string());
    }
    match task_type {
        TaskType::ImageToImage => input_image.and_then(infer_image_size),
        TaskType::TextToImage => Some("1024x1024".to_string()),
    }
}

/// One row of a compare/batch summary.
#[derive(Debug, Clone)]
pub struct TargetResult {
    pub provider: String,
    pub model: String,
    pub prompt: String,
    pub status: String,
    pub run_dir: String,
    pub error: String,
}

pub fn summarize_results(results: &[TargetResult]) -> String {
    let mut csv = String::from("provider,model,prompt,status,run_dir,error\n");
    for row in results {
        let fields = [
            &row.provider,
            &row.model,
            &row.prompt,
            &row.status,
            &row.run_dir,
            &row.error,
        ];
        let line: Vec<String> = fields.iter().map(|field| escape_csv(field)).collect();
        csv.push_str(&line.join(","));
        csv.push('\n');
    }
    csv
}

fn escape_csv(value: &str) -> String {
    if value.contains(',') || value.contains('"') || value.contains('\n') {
        format!("\"{}\"", value.replace('"', "\"\""))
    } else {
        value.to_string()
    }
}
