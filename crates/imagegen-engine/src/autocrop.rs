use std::fs;
use std::io::Write as _;
use std::path::PathBuf;

use anyhow::{Context, Result};
use image::imageops::FilterType;
use image::{DynamicImage, GenericImageView, ImageFormat};
use imagegen_contracts::{GenerationRequest, Provider, TaskType};
use reqwest::blocking::Client as HttpClient;

use crate::config::{AutocropOptions, ALIBABA_IMAGE_MAX, ALIBABA_IMAGE_MIN};
use crate::imagery::{is_url, load_image_bytes};

const TEMP_PREFIX: &str = "imagegen_autocrop_";

/// Rewrite an Alibaba image-to-image request so its input fits the DashScope
/// per-side pixel bounds. Returns the (possibly rewritten) request plus any
/// temp files created, which the caller must clean up after the run.
///
/// Preprocessing is best effort: unreadable or undecodable inputs pass
/// through untouched and the provider reports the real error.
pub fn prepare_request(
    request: &GenerationRequest,
    options: &AutocropOptions,
) -> Result<(GenerationRequest, Vec<PathBuf>)> {
    let passthrough = || (request.clone(), Vec::new());

    if !options.enabled
        || request.provider != Provider::Alibaba
        || request.task_type != TaskType::ImageToImage
    {
        return Ok(passthrough());
    }
    let Some(input) = request.input_image.as_deref().filter(|v| !v.is_empty()) else {
        return Ok(passthrough());
    };
    let Some(bytes) = load_source_bytes(input, options) else {
        return Ok(passthrough());
    };
    let Ok(source) = image::load_from_memory(&bytes) else {
        return Ok(passthrough());
    };

    let (width, height) = source.dimensions();
    let explicit = request.size.as_deref().and_then(parse_size);
    let (target_w, target_h) = match explicit {
        None => fit_size_within_bounds(width, height),
        Some(pair) if pair == (width, height) => fit_size_within_bounds(width, height),
        Some(pair) => clamp_size(pair),
    };

    let mut prepared = request.clone();
    prepared.size = Some(format!("{target_w}x{target_h}"));

    if (target_w, target_h) == (width, height) {
        // Already in bounds at the requested size; the source is forwarded
        // unchanged, optionally copied out for the run artifacts.
        if options.persist_input {
            let path = write_temp_bytes(&bytes)?;
            prepared.input_image = Some(path.to_string_lossy().into_owned());
            return Ok((prepared, vec![path]));
        }
        return Ok((prepared, Vec::new()));
    }

    let cropped = center_crop_and_resize(&source, target_w, target_h);
    let path = write_temp_png(&cropped)?;
    prepared.input_image = Some(path.to_string_lossy().into_owned());
    Ok((prepared, vec![path]))
}

fn load_source_bytes(input: &str, options: &AutocropOptions) -> Option<Vec<u8>> {
    if is_url(input) {
        let response = HttpClient::new()
            .get(input)
            .timeout(options.http_timeout)
            .send()
            .ok()?;
        if !response.status().is_success() {
            return None;
        }
        return response.bytes().ok().map(|bytes| bytes.to_vec());
    }
    load_image_bytes(input)
}

pub fn parse_size(size: &str) -> Option<(u32, u32)> {
    let lowered = size.to_ascii_lowercase();
    let (width, height) = lowered.split_once('x')?;
    let width: u32 = width.trim().parse().ok()?;
    let height: u32 = height.trim().parse().ok()?;
    if width == 0 || height == 0 {
        return None;
    }
    Some((width, height))
}

/// Scale a source size uniformly so both sides land inside
/// [ALIBABA_IMAGE_MIN, ALIBABA_IMAGE_MAX], preserving aspect ratio as far
/// as rounding allows.
pub fn fit_size_within_bounds(width: u32, height: u32) -> (u32, u32) {
    if width == 0 || height == 0 {
        return (ALIBABA_IMAGE_MIN, ALIBABA_IMAGE_MIN);
    }
    let max = ALIBABA_IMAGE_MAX as f64;
    let min = ALIBABA_IMAGE_MIN as f64;
    let mut w = width as f64;
    let mut h = height as f64;

    if w > max || h > max {
        let scale = (max / w).min(max / h);
        w *= scale;
        h *= scale;
    }
    if w < min || h < min {
        let scale = (min / w).max(min / h);
        w *= scale;
        h *= scale;
    }
    (clamp_side(w.round() as u32), clamp_side(h.round() as u32))
}

pub fn clamp_size((width, height): (u32, u32)) -> (u32, u32) {
    (clamp_side(width), clamp_side(height))
}

fn clamp_side(value: u32) -> u32 {
    value.clamp(ALIBABA_IMAGE_MIN, ALIBABA_IMAGE_MAX)
}

/// Largest centered crop at the target aspect ratio, then an exact resize
/// down (or up) to the target.
pub fn center_crop_and_resize(source: &DynamicImage, target_w: u32, target_h: u32) -> DynamicImage {
    let (width, height) = source.dimensions();
    let target_ratio = target_w as f64 / target_h as f64;
    let source_ratio = width as f64 / height as f64;

    let (crop_w, crop_h) = if source_ratio > target_ratio {
        let crop_w = (height as f64 * target_ratio).round() as u32;
        (crop_w.clamp(1, width), height)
    } else {
        let crop_h = (width as f64 / target_ratio).round() as u32;
        (width, crop_h.clamp(1, height))
    };
    let left = (width - crop_w) / 2;
    let top = (height - crop_h) / 2;

    let cropped = source.crop_imm(left, top, crop_w, crop_h);
    let resized = cropped.resize_exact(target_w, target_h, FilterType::Lanczos3);
    match resized {
        DynamicImage::ImageRgb8(_) | DynamicImage::ImageRgba8(_) => resized,
        other => DynamicImage::ImageRgb8(other.to_rgb8()),
    }
}

fn write_temp_png(image: &DynamicImage) -> Result<PathBuf> {
    let file = tempfile::Builder::new()
        .prefix(TEMP_PREFIX)
        .suffix(".png")
        .tempfile()
        .context("autocrop temp file creation failed")?;
    let (_, path) = file
        .keep()
        .context("autocrop temp file could not be kept")?;
    image
        .save_with_format(&path, ImageFormat::Png)
        .with_context(|| format!("autocrop temp PNG write failed ({})", path.display()))?;
    Ok(path)
}

/// Byte-for-byte copy of the untouched source, keeping its real format's
/// extension so downstream tools open it correctly.
fn write_temp_bytes(bytes: &[u8]) -> Result<PathBuf> {
    let extension = image::guess_format(bytes)
        .ok()
        .and_then(|format| format.extensions_str().first().copied())
        .unwrap_or("png");
    let mut file = tempfile::Builder::new()
        .prefix(TEMP_PREFIX)
        .suffix(&format!(".{extension}"))
        .tempfile()
        .context("autocrop temp file creation failed")?;
    file.write_all(bytes)
        .context("autocrop temp file write failed")?;
    let (_, path) = file
        .keep()
        .context("autocrop temp file could not be kept")?;
    Ok(path)
}

/// Best-effort removal of preprocessing temp files.
pub fn cleanup_temp_files(paths: &[PathBuf]) {
    for path in paths {
        if let Err(err) = fs::remove_file(path) {
            eprintln!("warning: temp file cleanup failed ({}): {err}", path.display());
        }
    }
}

#[cfg(test)]
mod tests {
    use image::{DynamicImage, GenericImageView, ImageFormat, RgbImage};
    use imagegen_contracts::{GenerationRequest, Provider, TaskType};
    use serde_json::Map;

    use super::{
        center_crop_and_resize, cleanup_temp_files, fit_size_within_bounds, parse_size,
        prepare_request,
    };
    use crate::config::AutocropOptions;

    fn request_with_image(input: &str) -> GenerationRequest {
        GenerationRequest {
            provider: Provider::Alibaba,
            model: "qwen-image-edit".to_string(),
            task_type: TaskType::ImageToImage,
            prompt: "Make it night".to_string(),
            negative_prompt: None,
            input_image: Some(input.to_string()),
            size: None,
            n: 1,
            seed: None,
            extra: Map::new(),
        }
    }

    fn png_file(dir: &std::path::Path, width: u32, height: u32) -> std::path::PathBuf {
        let path = dir.join(format!("src_{width}x{height}.png"));
        let image = DynamicImage::ImageRgb8(RgbImage::new(width, height));
        image.save_with_format(&path, ImageFormat::Png).unwrap();
        path
    }

    fn enabled_options() -> AutocropOptions {
        AutocropOptions {
            enabled: true,
            ..AutocropOptions::default()
        }
    }

    #[test]
    fn parse_size_accepts_wxh_only() {
        assert_eq!(parse_size("1024x768"), Some((1024, 768)));
        assert_eq!(parse_size("1024X768"), Some((1024, 768)));
        assert_eq!(parse_size(" 800 x 600 "), Some((800, 600)));
        assert_eq!(parse_size("0x600"), None);
        assert_eq!(parse_size("1024"), None);
        assert_eq!(parse_size("widexhigh"), None);
    }

    #[test]
    fn oversized_source_scales_down_preserving_ratio() {
        assert_eq!(fit_size_within_bounds(3242, 2160), (2048, 1364));
        assert_eq!(fit_size_within_bounds(4096, 4096), (2048, 2048));
    }

    #[test]
    fn undersized_source_scales_up_to_minimum() {
        assert_eq!(fit_size_within_bounds(256, 256), (512, 512));
        assert_eq!(fit_size_within_bounds(300, 200), (768, 512));
        assert_eq!(fit_size_within_bounds(0, 100), (512, 512));
    }

    #[test]
    fn in_bounds_source_is_unchanged() {
        assert_eq!(fit_size_within_bounds(1024, 768), (1024, 768));
        assert_eq!(fit_size_within_bounds(512, 2048), (512, 2048));
    }

    #[test]
    fn center_crop_hits_exact_target() {
        let source = DynamicImage::ImageRgb8(RgbImage::new(100, 50));
        let result = center_crop_and_resize(&source, 60, 60);
        assert_eq!(result.dimensions(), (60, 60));

        let wide = center_crop_and_resize(&source, 200, 50);
        assert_eq!(wide.dimensions(), (200, 50));
    }

    #[test]
    fn disabled_or_foreign_requests_pass_through() -> anyhow::Result<()> {
        let request = request_with_image("data:image/png;base64,aGVsbG8=");

        let (prepared, temps) = prepare_request(&request, &AutocropOptions::default())?;
        assert_eq!(prepared.input_image, request.input_image);
        assert!(temps.is_empty());

        let mut google = request.clone();
        google.provider = Provider::Google;
        let (prepared, temps) = prepare_request(&google, &enabled_options())?;
        assert_eq!(prepared.input_image, google.input_image);
        assert!(temps.is_empty());

        let mut text = request.clone();
        text.task_type = TaskType::TextToImage;
        text.input_image = None;
        let (_, temps) = prepare_request(&text, &enabled_options())?;
        assert!(temps.is_empty());
        Ok(())
    }

    #[test]
    fn undecodable_input_passes_through() -> anyhow::Result<()> {
        let request = request_with_image("definitely-not-an-image");
        let (prepared, temps) = prepare_request(&request, &enabled_options())?;
        assert_eq!(prepared.input_image, request.input_image);
        assert!(temps.is_empty());
        Ok(())
    }

    #[test]
    fn oversized_input_is_cropped_to_temp_png() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let source = png_file(dir.path(), 2100, 1400);

        let request = request_with_image(source.to_str().unwrap());
        let (prepared, temps) = prepare_request(&request, &enabled_options())?;

        assert_eq!(prepared.size.as_deref(), Some("2048x1365"));
        assert_eq!(temps.len(), 1);
        let temp = &temps[0];
        assert!(temp.exists());
        assert_eq!(prepared.input_image.as_deref(), temp.to_str());

        let written = image::open(temp)?;
        assert_eq!(written.dimensions(), (2048, 1365));

        cleanup_temp_files(&temps);
        assert!(!temp.exists());
        Ok(())
    }

    #[test]
    fn explicit_size_is_clamped_then_cropped() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let source = png_file(dir.path(), 1000, 1000);

        let mut request = request_with_image(source.to_str().unwrap());
        request.size = Some("4000x300".to_string());
        let (prepared, temps) = prepare_request(&request, &enabled_options())?;

        assert_eq!(prepared.size.as_deref(), Some("2048x512"));
        assert_eq!(temps.len(), 1);
        assert_eq!(image::open(&temps[0])?.dimensions(), (2048, 512));

        cleanup_temp_files(&temps);
        Ok(())
    }

    #[test]
    fn in_bounds_input_keeps_original_reference() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let source = png_file(dir.path(), 1024, 768);

        let request = request_with_image(source.to_str().unwrap());
        let (prepared, temps) = prepare_request(&request, &enabled_options())?;

        assert_eq!(prepared.size.as_deref(), Some("1024x768"));
        assert_eq!(prepared.input_image, request.input_image);
        assert!(temps.is_empty());
        Ok(())
    }

    #[test]
    fn persist_flag_copies_untouched_source() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let source = png_file(dir.path(), 1024, 768);
        let original_bytes = std::fs::read(&source)?;

        let request = request_with_image(source.to_str().unwrap());
        let options = AutocropOptions {
            enabled: true,
            persist_input: true,
            ..AutocropOptions::default()
        };
        let (prepared, temps) = prepare_request(&request, &options)?;

        assert_eq!(temps.len(), 1);
        assert_ne!(prepared.input_image, request.input_image);
        assert_eq!(std::fs::read(&temps[0])?, original_bytes);
        assert_eq!(temps[0].extension().and_then(|e| e.to_str()), Some("png"));

        cleanup_temp_files(&temps);
        Ok(())
    }
}
