use std::fs;
use std::io::Write as _;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand, ValueEnum};
use imagegen_contracts::{GenerationRequest, Provider, TaskType};
use imagegen_engine::autocrop::cleanup_temp_files;
use imagegen_engine::runner::{
    persist_run, resolve_request_size, run_with_retry_with_artifacts, summarize_results,
    TargetResult,
};
use imagegen_engine::{AdapterRegistry, AutocropOptions, RunnerConfig};
use serde_json::{Map, Value};

const SPINNER_FRAMES: [char; 4] = ['|', '/', '-', '\\'];
const SPINNER_TICK: Duration = Duration::from_millis(200);

#[derive(Parser)]
#[command(name = "imagegen", about = "Exercise image generation provider APIs")]
struct Cli {
    /// Directory that receives one subdirectory per run.
    #[arg(long, global = true, default_value = "runs")]
    output_dir: PathBuf,

    /// Override the auto-crop environment default for Alibaba image-to-image.
    #[arg(long, global = true, value_enum)]
    auto_crop: Option<Toggle>,

    /// Override whether preprocessed inputs are copied into the run directory.
    #[arg(long, global = true, value_enum)]
    persist_preprocessed_input: Option<Toggle>,

    /// Suppress the progress spinner.
    #[arg(long, global = true)]
    quiet: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// One request against one provider.
    Single(SingleArgs),
    /// The same prompt against two provider/model targets.
    Compare(CompareArgs),
    /// One provider/model across a file of prompts.
    Batch(BatchArgs),
}

#[derive(Args)]
struct SharedArgs {
    /// Input image for image_to_image: path, URL, data URI, or raw base64.
    #[arg(long)]
    input_image: Option<String>,

    /// Requested size as WxH, e.g. 1024x1024.
    #[arg(long)]
    size: Option<String>,

    #[arg(long, value_enum, default_value = "off")]
    negative_prompt_enabled: Toggle,

    #[arg(long)]
    negative_prompt: Option<String>,

    /// Number of images to request.
    #[arg(long, default_value_t = 1)]
    n: u32,

    #[arg(long)]
    seed: Option<i64>,

    /// Path to a JSON object merged into the provider payload last.
    #[arg(long)]
    extra_json: Option<PathBuf>,
}

#[derive(Args)]
struct SingleArgs {
    #[arg(long)]
    provider: String,

    #[arg(long)]
    model: String,

    #[arg(long, default_value = "text_to_image")]
    task_type: String,

    #[arg(long)]
    prompt: String,

    #[command(flatten)]
    shared: SharedArgs,
}

#[derive(Args)]
struct CompareArgs {
    #[arg(long)]
    prompt: String,

    #[arg(long, default_value = "text_to_image")]
    task_type: String,

    #[arg(long)]
    provider_a: Option<String>,

    #[arg(long)]
    model_a: Option<String>,

    #[arg(long)]
    provider_b: Option<String>,

    #[arg(long)]
    model_b: Option<String>,

    /// Legacy shorthand for --provider-a alibaba --model-a <MODEL>.
    #[arg(long)]
    model_alibaba: Option<String>,

    /// Legacy shorthand for --provider-b google --model-b <MODEL>.
    #[arg(long)]
    model_google: Option<String>,

    #[command(flatten)]
    shared: SharedArgs,
}

#[derive(Args)]
struct BatchArgs {
    #[arg(long)]
    provider: String,

    #[arg(long)]
    model: String,

    #[arg(long, default_value = "text_to_image")]
    task_type: String,

    /// Text file with one prompt per line; blank lines are skipped.
    #[arg(long)]
    prompts_file: PathBuf,

    #[command(flatten)]
    shared: SharedArgs,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum Toggle {
    On,
    Off,
}

impl Toggle {
    fn is_on(self) -> bool {
        self == Toggle::On
    }
}

fn main() {
    if let Err(err) = run() {
        eprintln!("imagegen error: {err:#}");
        std::process::exit(1);
    }
}

fn run() -> Result<()> {
    let cli = Cli::parse();

    let mut autocrop = AutocropOptions::from_env();
    let mut runner_config = RunnerConfig::from_env();
    if let Some(toggle) = cli.auto_crop {
        autocrop.enabled = toggle.is_on();
    }
    if let Some(toggle) = cli.persist_preprocessed_input {
        autocrop.persist_input = toggle.is_on();
        runner_config.persist_preprocessed = toggle.is_on();
    }

    let registry = AdapterRegistry::from_env();
    fs::create_dir_all(&cli.output_dir).with_context(|| {
        format!("output directory creation failed ({})", cli.output_dir.display())
    })?;

    match &cli.command {
        Command::Single(args) => run_single(&cli, args, &registry, &autocrop, &runner_config),
        Command::Compare(args) => run_compare(&cli, args, &registry, &autocrop, &runner_config),
        Command::Batch(args) => run_batch(&cli, args, &registry, &autocrop, &runner_config),
    }
}

fn run_single(
    cli: &Cli,
    args: &SingleArgs,
    registry: &AdapterRegistry,
    autocrop: &AutocropOptions,
    runner_config: &RunnerConfig,
) -> Result<()> {
    let provider: Provider = args.provider.parse()?;
    let request = build_request(
        provider,
        &args.model,
        &args.task_type,
        &args.prompt,
        &args.shared,
    )?;

    let run_dir = execute_and_persist(cli, registry, &request, autocrop, runner_config)?;
    println!("ok provider={provider} run_dir={}", run_dir.display());
    Ok(())
}

fn run_compare(
    cli: &Cli,
    args: &CompareArgs,
    registry: &AdapterRegistry,
    autocrop: &AutocropOptions,
    runner_config: &RunnerConfig,
) -> Result<()> {
    let targets = resolve_compare_targets(args)?;
    let mut results = Vec::new();

    for (provider, model) in &targets {
        let request = build_request(*provider, model, &args.task_type, &args.prompt, &args.shared)?;
        match execute_and_persist(cli, registry, &request, autocrop, runner_config) {
            Ok(run_dir) => {
                println!("ok provider={provider} run_dir={}", run_dir.display());
                results.push(target_result(&request, "ok", &run_dir.display().to_string(), ""));
            }
            Err(err) => {
                println!("failed provider={provider} error={err:#}");
                results.push(target_result(&request, "failed", "", &format!("{err:#}")));
            }
        }
    }

    let summary_path = cli.output_dir.join("compare_summary.csv");
    fs::write(&summary_path, summarize_results(&results))
        .with_context(|| format!("summary write failed ({})", summary_path.display()))?;
    println!("summary={}", summary_path.display());
    Ok(())
}

fn run_batch(
    cli: &Cli,
    args: &BatchArgs,
    registry: &AdapterRegistry,
    autocrop: &AutocropOptions,
    runner_config: &RunnerConfig,
) -> Result<()> {
    let provider: Provider = args.provider.parse()?;
    let prompts = read_prompts(&args.prompts_file)?;
    let total = prompts.len();
    let mut results = Vec::new();

    for (index, prompt) in prompts.iter().enumerate() {
        println!(
            "batch {}/{total} provider={provider} model={}",
            index + 1,
            args.model
        );
        let request = build_request(provider, &args.model, &args.task_type, prompt, &args.shared)?;
        match execute_and_persist(cli, registry, &request, autocrop, runner_config) {
            Ok(run_dir) => {
                println!("ok prompt={} run_dir={}", preview(prompt), run_dir.display());
                results.push(target_result(&request, "ok", &run_dir.display().to_string(), ""));
            }
            Err(err) => {
                println!("failed prompt={} error={err:#}", preview(prompt));
                results.push(target_result(&request, "failed", "", &format!("{err:#}")));
            }
        }
    }

    let summary_path = cli.output_dir.join("batch_summary.csv");
    fs::write(&summary_path, summarize_results(&results))
        .with_context(|| format!("summary write failed ({})", summary_path.display()))?;
    println!("summary={}", summary_path.display());
    Ok(())
}

fn execute_and_persist(
    cli: &Cli,
    registry: &AdapterRegistry,
    request: &GenerationRequest,
    autocrop: &AutocropOptions,
    runner_config: &RunnerConfig,
) -> Result<PathBuf> {
    let Some(adapter) = registry.get(request.provider) else {
        bail!("no adapter registered for provider {}", request.provider);
    };
    let label = format!("{} {}", request.provider, request.model);
    let artifacts = with_progress(&label, cli.quiet, || {
        run_with_retry_with_artifacts(adapter, request, autocrop, runner_config)
    })?;
    let persisted = persist_run(&cli.output_dir, &artifacts, runner_config);
    cleanup_temp_files(&artifacts.temp_paths);
    persisted
}

fn build_request(
    provider: Provider,
    model: &str,
    task_type: &str,
    prompt: &str,
    shared: &SharedArgs,
) -> Result<GenerationRequest> {
    let task_type: TaskType = task_type.parse()?;
    let negative_prompt = resolve_negative_prompt(
        shared.negative_prompt_enabled.is_on(),
        shared.negative_prompt.as_deref(),
    )?;
    let extra = match &shared.extra_json {
        Some(path) => read_extra(path)?,
        None => Map::new(),
    };
    let size = resolve_request_size(task_type, shared.size.as_deref(), shared.input_image.as_deref());

    let request = GenerationRequest {
        provider,
        model: model.to_string(),
        task_type,
        prompt: prompt.to_string(),
        negative_prompt,
        input_image: shared.input_image.clone(),
        size,
        n: shared.n,
        seed: shared.seed,
        extra,
    };
    request.validate()?;
    Ok(request)
}

/// Negative prompt text is only forwarded when explicitly enabled; enabling
/// it without text is an operator mistake worth failing fast on.
fn resolve_negative_prompt(enabled: bool, text: Option<&str>) -> Result<Option<String>> {
    if !enabled {
        return Ok(None);
    }
    match text.map(str::trim).filter(|t| !t.is_empty()) {
        Some(text) => Ok(Some(text.to_string())),
        None => bail!("--negative-prompt-enabled on requires --negative-prompt text"),
    }
}

fn read_extra(path: &Path) -> Result<Map<String, Value>> {
    let body = fs::read_to_string(path)
        .with_context(|| format!("extra JSON read failed ({})", path.display()))?;
    let value: Value = serde_json::from_str(&body)
        .with_context(|| format!("extra JSON parse failed ({})", path.display()))?;
    match value {
        Value::Object(map) => Ok(map),
        _ => bail!("extra JSON must be an object ({})", path.display()),
    }
}

fn read_prompts(path: &Path) -> Result<Vec<String>> {
    let body = fs::read_to_string(path)
        .with_context(|| format!("prompts file read failed ({})", path.display()))?;
    let prompts: Vec<String> = body
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .map(str::to_string)
        .collect();
    if prompts.is_empty() {
        bail!("prompts file is empty ({})", path.display());
    }
    Ok(prompts)
}

fn resolve_compare_targets(args: &CompareArgs) -> Result<Vec<(Provider, String)>> {
    let new_mode = [&args.provider_a, &args.model_a, &args.provider_b, &args.model_b];
    let new_set = new_mode.iter().filter(|field| field.is_some()).count();
    let legacy_mode = [&args.model_alibaba, &args.model_google];
    let legacy_set = legacy_mode.iter().filter(|field| field.is_some()).count();

    if new_set > 0 && legacy_set > 0 {
        bail!(
            "use either --provider-a/--model-a/--provider-b/--model-b \
             or --model-alibaba/--model-google, not both"
        );
    }
    if new_set > 0 {
        if new_set < 4 {
            bail!("compare requires --provider-a, --model-a, --provider-b, and --model-b together");
        }
        let provider_a: Provider = args.provider_a.as_deref().unwrap_or_default().parse()?;
        let provider_b: Provider = args.provider_b.as_deref().unwrap_or_default().parse()?;
        return Ok(vec![
            (provider_a, args.model_a.clone().unwrap_or_default()),
            (provider_b, args.model_b.clone().unwrap_or_default()),
        ]);
    }
    if legacy_set > 0 {
        if legacy_set < 2 {
            bail!("compare requires both --model-alibaba and --model-google");
        }
        return Ok(vec![
            (Provider::Alibaba, args.model_alibaba.clone().unwrap_or_default()),
            (Provider::Google, args.model_google.clone().unwrap_or_default()),
        ]);
    }
    bail!(
        "compare requires target models: --provider-a/--model-a/--provider-b/--model-b \
         or --model-alibaba/--model-google"
    )
}

fn target_result(
    request: &GenerationRequest,
    status: &str,
    run_dir: &str,
    error: &str,
) -> TargetResult {
    TargetResult {
        provider: request.provider.to_string(),
        model: request.model.clone(),
        prompt: request.prompt.clone(),
        status: status.to_string(),
        run_dir: run_dir.to_string(),
        error: error.to_string(),
    }
}

fn preview(text: &str) -> String {
    text.chars().take(40).collect()
}

/// Run `action` on the calling thread while a spinner ticks on stdout.
/// Quiet mode skips the spinner entirely.
fn with_progress<T>(label: &str, quiet: bool, action: impl FnOnce() -> Result<T>) -> Result<T> {
    if quiet {
        return action();
    }

    let running = Arc::new(AtomicBool::new(true));
    let spinner_flag = Arc::clone(&running);
    let spinner_label = label.to_string();
    let started = Instant::now();

    let spinner = thread::spawn(move || {
        let mut frame = 0usize;
        while spinner_flag.load(Ordering::Relaxed) {
            let glyph = SPINNER_FRAMES[frame % SPINNER_FRAMES.len()];
            print!(
                "\r[waiting {glyph}] {spinner_label} ... {}s",
                started.elapsed().as_secs()
            );
            let _ = std::io::stdout().flush();
            frame += 1;
            thread::sleep(SPINNER_TICK);
        }
        print!("\r{}\r", " ".repeat(120));
        let _ = std::io::stdout().flush();
    });

    let result = action();
    running.store(false, Ordering::Relaxed);
    let _ = spinner.join();

    if result.is_ok() {
        println!("done in {}s: {label}", started.elapsed().as_secs());
    }
    result
}
