use std::io::{self, BufRead, Write};
use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use easel_contracts::catalog::ModelCatalog;
use easel_contracts::credentials::{non_empty_env, Credentials};
use easel_contracts::events::{timestamp_millis, EventLog};
use easel_contracts::tasks::{BatchReport, CostBreakdown, GenerationResult, GenerationTask};
use easel_engine::{
    BatchOptions, BatchProgress, DryRunClient, GenerationClient, SpendingDecision, SpendingGuard,
    Studio, TaskRunner,
};
use serde_json::{json, Value};

#[derive(Debug, Parser)]
#[command(name = "easel", version, about = "Batch front end for AI image-generation APIs")]
struct Cli {
    /// Directory of model descriptor JSON files layered over the built-ins.
    #[arg(long, global = true)]
    models_dir: Option<PathBuf>,
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// List the models the catalog knows about.
    Models,
    /// Project the cost of a batch without running it.
    Estimate(EstimateArgs),
    /// Expand, gate, and run a batch.
    Generate(GenerateArgs),
    /// Interactive batch builder.
    Wizard(WizardArgs),
    /// Line-delimited JSON request/response server over stdio.
    Serve(ServeArgs),
}

#[derive(Debug, Parser)]
struct EstimateArgs {
    #[arg(long = "model", required = true)]
    models: Vec<String>,
    #[arg(long = "prompt", required = true)]
    prompts: Vec<String>,
    /// Tasks per (model, prompt) pair.
    #[arg(long, default_value_t = 1)]
    iterations: u64,
    /// Images per task.
    #[arg(long, default_value_t = 1)]
    images: u64,
    #[arg(long)]
    size: Option<String>,
}

#[derive(Debug, Parser)]
struct GenerateArgs {
    #[arg(long = "model", required = true)]
    models: Vec<String>,
    #[arg(long = "prompt", required = true)]
    prompts: Vec<String>,
    #[arg(long, default_value_t = 1)]
    iterations: u64,
    #[arg(long, default_value_t = 1)]
    images: u64,
    #[arg(long)]
    size: Option<String>,
    /// Peak concurrent provider requests.
    #[arg(long, default_value_t = 2)]
    concurrency: usize,
    /// Directory to download the generated images into.
    #[arg(long)]
    out: Option<PathBuf>,
    #[arg(long)]
    events: Option<PathBuf>,
    /// Spending limit in USD for this run.
    #[arg(long)]
    limit_usd: Option<f64>,
    /// Skip the over-limit confirmation prompt.
    #[arg(long)]
    yes: bool,
    /// Generate placeholder images locally instead of calling the provider.
    #[arg(long)]
    dry_run: bool,
}

#[derive(Debug, Parser)]
struct WizardArgs {
    #[arg(long)]
    limit_usd: Option<f64>,
    #[arg(long)]
    yes: bool,
    #[arg(long)]
    dry_run: bool,
}

#[derive(Debug, Parser)]
struct ServeArgs {
    #[arg(long)]
    limit_usd: Option<f64>,
    #[arg(long)]
    dry_run: bool,
}

fn main() {
    match run() {
        Ok(code) => std::process::exit(code),
        Err(err) => {
            eprintln!("easel error: {err:#}");
            std::process::exit(1);
        }
    }
}

fn run() -> Result<i32> {
    let cli = Cli::parse();
    let models_dir = cli
        .models_dir
        .or_else(|| non_empty_env("EASEL_MODELS_DIR").map(PathBuf::from));
    let load = ModelCatalog::load(models_dir.as_deref())?;
    for warning in &load.warnings {
        eprintln!("warning: {warning}");
    }
    let catalog = load.catalog;

    match cli.command {
        Command::Models => {
            cmd_models(&catalog);
            Ok(0)
        }
        Command::Estimate(args) => {
            cmd_estimate(&catalog, args);
            Ok(0)
        }
        Command::Generate(args) => cmd_generate(catalog, args),
        Command::Wizard(args) => cmd_wizard(catalog, args),
        Command::Serve(args) => cmd_serve(catalog, args),
    }
}

fn cmd_models(catalog: &ModelCatalog) {
    println!("{:<28} {:>12} {:>14}  name", "id", "$/image", "max per call");
    for descriptor in catalog.list() {
        println!(
            "{:<28} {:>12.3} {:>14}  {}",
            descriptor.id,
            descriptor.cost_per_image_usd,
            descriptor.max_images_per_call,
            descriptor.name
        );
    }
}

fn cmd_estimate(catalog: &ModelCatalog, args: EstimateArgs) {
    let plan = SessionPlan {
        models: args.models,
        prompts: args.prompts,
        iterations: args.iterations,
        images: args.images,
        size: args.size,
        ..SessionPlan::default()
    };
    let tasks = expand_tasks(&plan);
    warn_unknown_models(catalog, &tasks);
    render_breakdown(&easel_engine::estimate_cost(&tasks, catalog));
}

fn cmd_generate(catalog: ModelCatalog, args: GenerateArgs) -> Result<i32> {
    let plan = SessionPlan {
        models: args.models,
        prompts: args.prompts,
        iterations: args.iterations,
        images: args.images,
        size: args.size,
        concurrency: args.concurrency,
        output_dir: args.out,
    };
    let guard = spending_guard(args.limit_usd);
    run_plan(catalog, guard, &plan, args.yes, args.dry_run, args.events)
}

fn cmd_wizard(catalog: ModelCatalog, args: WizardArgs) -> Result<i32> {
    let stdin = io::stdin();
    let mut input = stdin.lock();

    println!("easel wizard: build a batch step by step.");
    let plan = SessionPlan::default();
    let plan = step_models(plan, &catalog, &mut input)?;
    let plan = step_prompts(plan, &mut input)?;
    let plan = step_settings(plan, &mut input)?;

    println!(
        "Plan: {} model(s) x {} prompt(s) x {} iteration(s), {} image(s) per task.",
        plan.models.len(),
        plan.prompts.len(),
        plan.iterations,
        plan.images
    );
    let guard = spending_guard(args.limit_usd);
    run_plan(catalog, guard, &plan, args.yes, args.dry_run, None)
}

fn cmd_serve(catalog: ModelCatalog, args: ServeArgs) -> Result<i32> {
    let studio = Studio::new(catalog, spending_guard(args.limit_usd));
    let runner = build_runner(args.dry_run)?;
    let stdin = io::stdin();
    let stdout = io::stdout();
    serve_loop(&studio, runner.as_ref(), &mut stdin.lock(), &mut stdout.lock())
}

// ---------------------------------------------------------------------------
// Session plan and batch pipeline

/// Everything a batch run needs, assembled up front and passed forward
/// unchanged; wizard steps consume a plan and return the next one.
#[derive(Debug, Clone)]
struct SessionPlan {
    models: Vec<String>,
    prompts: Vec<String>,
    iterations: u64,
    images: u64,
    size: Option<String>,
    concurrency: usize,
    output_dir: Option<PathBuf>,
}

impl Default for SessionPlan {
    fn default() -> Self {
        Self {
            models: Vec::new(),
            prompts: Vec::new(),
            iterations: 1,
            images: 1,
            size: None,
            concurrency: 2,
            output_dir: None,
        }
    }
}

/// Flattens (prompts x models x iterations) into an ordered task list;
/// `sequence_index` is the task's final position.
fn expand_tasks(plan: &SessionPlan) -> Vec<GenerationTask> {
    let mut tasks = Vec::new();
    for prompt in &plan.prompts {
        for model in &plan.models {
            for _ in 0..plan.iterations.max(1) {
                let mut task = GenerationTask::new(model.clone(), prompt.clone());
                if plan.images > 1 {
                    task.parameters.insert("n".to_string(), json!(plan.images));
                }
                if let Some(size) = &plan.size {
                    task.parameters.insert("size".to_string(), json!(size));
                }
                task.sequence_index = tasks.len();
                tasks.push(task);
            }
        }
    }
    tasks
}

fn run_plan(
    catalog: ModelCatalog,
    guard: SpendingGuard,
    plan: &SessionPlan,
    assume_yes: bool,
    dry_run: bool,
    events_override: Option<PathBuf>,
) -> Result<i32> {
    let mut tasks = expand_tasks(plan);
    if tasks.is_empty() {
        bail!("nothing to generate: need at least one model and one prompt");
    }
    warn_unknown_models(&catalog, &tasks);
    easel_engine::clamp_image_counts(&mut tasks, &catalog);

    let batch_id = format!("batch-{}", timestamp_millis());
    let events_path = events_override.or_else(|| {
        plan.output_dir
            .as_ref()
            .map(|dir| dir.join("events.jsonl"))
    });
    let mut studio = Studio::new(catalog, guard);
    if let Some(path) = events_path {
        studio = studio.with_events(EventLog::new(path, batch_id));
    }

    let estimate = studio.estimate_cost(&tasks);
    render_breakdown(&estimate);

    let mut confirmed = assume_yes;
    if let SpendingDecision::RequireConfirmation {
        estimated_cost_usd,
        threshold_usd,
    } = studio.check_spending(&estimate, confirmed)
    {
        println!(
            "Estimated cost ${estimated_cost_usd:.2} exceeds the ${threshold_usd:.2} spending limit."
        );
        if !confirm_on_stdin()? {
            println!("Aborted.");
            return Ok(1);
        }
        confirmed = true;
    }
    debug_assert_eq!(
        studio.check_spending(&estimate, confirmed),
        SpendingDecision::Allow
    );

    let runner = build_runner(dry_run)?;
    let options = BatchOptions {
        concurrency_limit: plan.concurrency,
        output_dir: plan.output_dir.clone(),
    };
    let mut on_progress = |progress: &BatchProgress<'_>| render_progress(progress);
    let report = studio.run_batch(runner.as_ref(), &tasks, &options, Some(&mut on_progress))?;
    render_report(&report);
    Ok(if report.succeeded == 0 { 1 } else { 0 })
}

fn build_runner(dry_run: bool) -> Result<Box<dyn TaskRunner>> {
    if dry_run {
        return Ok(Box::new(DryRunClient));
    }
    let credentials = Credentials::resolve().context(
        "no API key configured; set EASEL_API_KEY or add ~/.easel/credentials.json",
    )?;
    Ok(Box::new(GenerationClient::new(credentials)?))
}

fn spending_guard(limit_usd: Option<f64>) -> SpendingGuard {
    match limit_usd {
        Some(threshold) => SpendingGuard::new(threshold),
        None => SpendingGuard::from_env(),
    }
}

fn warn_unknown_models(catalog: &ModelCatalog, tasks: &[GenerationTask]) {
    let mut reported: Vec<&str> = Vec::new();
    for task in tasks {
        if catalog.get(&task.model_id).is_none() && !reported.contains(&task.model_id.as_str()) {
            eprintln!(
                "warning: model '{}' is not in the catalog; estimating at the fallback rate",
                task.model_id
            );
            reported.push(task.model_id.as_str());
        }
    }
}

fn confirm_on_stdin() -> Result<bool> {
    print!("Proceed anyway? [y/N] ");
    io::stdout().flush()?;
    let mut line = String::new();
    io::stdin().read_line(&mut line)?;
    Ok(matches!(
        line.trim().to_ascii_lowercase().as_str(),
        "y" | "yes"
    ))
}

// ---------------------------------------------------------------------------
// Rendering

fn render_breakdown(estimate: &CostBreakdown) {
    println!("Projected cost:");
    for (model, usage) in &estimate.per_model {
        println!(
            "  {model}: {} image(s), ${:.3}",
            usage.image_count, usage.cost_usd
        );
    }
    println!("  total: ${:.2}", estimate.total_cost_usd);
}

fn render_progress(progress: &BatchProgress<'_>) {
    match progress.last {
        GenerationResult::Success {
            image_urls,
            saved_paths,
            duration_ms,
        } => {
            let saved = if saved_paths.is_empty() {
                String::new()
            } else {
                format!(", {} saved", saved_paths.len())
            };
            println!(
                "  [{}/{}] task {} ok: {} image(s) in {:.1}s{saved}",
                progress.completed,
                progress.total,
                progress.task_index,
                image_urls.len(),
                *duration_ms as f64 / 1000.0
            );
        }
        GenerationResult::Failure { reason, .. } => {
            println!(
                "  [{}/{}] task {} failed: {reason}",
                progress.completed, progress.total, progress.task_index
            );
        }
    }
}

fn render_report(report: &BatchReport) {
    println!(
        "Batch finished: {}/{} succeeded, {} failed, {:.1}s total.",
        report.succeeded,
        report.total,
        report.failed,
        report.total_duration_ms as f64 / 1000.0
    );
    for (index, result) in report.results.iter().enumerate() {
        match result {
            GenerationResult::Success { image_urls, .. } => {
                for url in image_urls {
                    println!("  task {index}: {url}");
                }
            }
            GenerationResult::Failure { reason, .. } => {
                println!("  task {index}: FAILED ({reason})");
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Wizard steps

fn step_models(
    plan: SessionPlan,
    catalog: &ModelCatalog,
    input: &mut impl BufRead,
) -> Result<SessionPlan> {
    println!("Available models:");
    let ids: Vec<&str> = catalog.list().map(|m| m.id.as_str()).collect();
    for (index, descriptor) in catalog.list().enumerate() {
        println!(
            "  {}. {} (${:.3}/image) - {}",
            index + 1,
            descriptor.id,
            descriptor.cost_per_image_usd,
            descriptor.name
        );
    }
    print!("Select models (numbers or ids, space separated) [1]: ");
    io::stdout().flush()?;
    let line = read_trimmed_line(input)?;

    let mut models = Vec::new();
    if line.is_empty() {
        if let Some(first) = ids.first() {
            models.push((*first).to_string());
        }
    } else {
        for token in line.split_whitespace() {
            let id = match token.parse::<usize>() {
                Ok(number) if number >= 1 && number <= ids.len() => ids[number - 1].to_string(),
                Ok(number) => bail!("no model numbered {number}"),
                Err(_) => token.to_string(),
            };
            if !models.contains(&id) {
                models.push(id);
            }
        }
    }
    if models.is_empty() {
        bail!("no models selected");
    }
    Ok(SessionPlan { models, ..plan })
}

fn step_prompts(plan: SessionPlan, input: &mut impl BufRead) -> Result<SessionPlan> {
    print!("Prompts (quote each one, e.g. \"a red fox\" \"a blue bird\"): ");
    io::stdout().flush()?;
    let line = read_trimmed_line(input)?;
    let prompts =
        shell_words::split(&line).map_err(|err| anyhow::anyhow!("unbalanced quotes: {err}"))?;
    let prompts: Vec<String> = prompts
        .into_iter()
        .map(|prompt| prompt.trim().to_string())
        .filter(|prompt| !prompt.is_empty())
        .collect();
    if prompts.is_empty() {
        bail!("at least one prompt is required");
    }
    Ok(SessionPlan { prompts, ..plan })
}

fn step_settings(plan: SessionPlan, input: &mut impl BufRead) -> Result<SessionPlan> {
    print!("Iterations per (model, prompt) [1]: ");
    io::stdout().flush()?;
    let iterations = parse_or_default(&read_trimmed_line(input)?, 1u64)?;

    print!("Images per task [1]: ");
    io::stdout().flush()?;
    let images = parse_or_default(&read_trimmed_line(input)?, 1u64)?;

    print!("Concurrency [2]: ");
    io::stdout().flush()?;
    let concurrency = parse_or_default(&read_trimmed_line(input)?, 2usize)?;

    print!("Output directory (empty to skip downloads): ");
    io::stdout().flush()?;
    let raw_dir = read_trimmed_line(input)?;
    let output_dir = if raw_dir.is_empty() {
        None
    } else {
        Some(PathBuf::from(raw_dir))
    };

    Ok(SessionPlan {
        iterations,
        images,
        concurrency,
        output_dir,
        ..plan
    })
}

fn parse_or_default<T: std::str::FromStr>(raw: &str, default: T) -> Result<T> {
    if raw.is_empty() {
        return Ok(default);
    }
    raw.parse::<T>()
        .map_err(|_| anyhow::anyhow!("could not parse '{raw}'"))
}

fn read_trimmed_line(input: &mut impl BufRead) -> Result<String> {
    let mut line = String::new();
    input.read_line(&mut line)?;
    Ok(line.trim().to_string())
}

// ---------------------------------------------------------------------------
// Protocol server

fn serve_loop(
    studio: &Studio,
    runner: &dyn TaskRunner,
    input: &mut impl BufRead,
    output: &mut impl Write,
) -> Result<i32> {
    let mut line = String::new();
    loop {
        line.clear();
        if input.read_line(&mut line)? == 0 {
            break;
        }
        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }
        let response = handle_request(studio, runner, trimmed);
        serde_json::to_writer(&mut *output, &response)?;
        output.write_all(b"\n")?;
        output.flush()?;
    }
    Ok(0)
}

fn handle_request(studio: &Studio, runner: &dyn TaskRunner, raw: &str) -> Value {
    let request: Value = match serde_json::from_str(raw) {
        Ok(request) => request,
        Err(err) => return error_response(Value::Null, &format!("invalid request JSON: {err}")),
    };
    let id = request.get("id").cloned().unwrap_or(Value::Null);
    let op = request.get("op").and_then(Value::as_str).unwrap_or("");

    match op {
        "list_models" => {
            let models: Vec<Value> = studio
                .catalog()
                .list()
                .map(|descriptor| {
                    json!({
                        "id": descriptor.id,
                        "name": descriptor.name,
                        "cost_per_image_usd": descriptor.cost_per_image_usd,
                        "max_images_per_call": descriptor.max_images_per_call,
                    })
                })
                .collect();
            ok_response(id, json!({ "models": models }))
        }
        "estimate_cost" => match parse_tasks(&request) {
            Ok(tasks) => {
                let estimate = studio.estimate_cost(&tasks);
                ok_response(id, json!({ "estimate": estimate }))
            }
            Err(reason) => error_response(id, &reason),
        },
        "check_spending" => match parse_tasks(&request) {
            Ok(tasks) => {
                let confirmed = request_confirmed(&request);
                let estimate = studio.estimate_cost(&tasks);
                ok_response(id, decision_value(studio.check_spending(&estimate, confirmed)))
            }
            Err(reason) => error_response(id, &reason),
        },
        "run_batch" => match parse_tasks(&request) {
            Ok(mut tasks) => {
                let confirmed = request_confirmed(&request);
                easel_engine::clamp_image_counts(&mut tasks, studio.catalog());
                let estimate = studio.estimate_cost(&tasks);
                // Over-limit submissions get a normal response, not an
                // error; the caller resubmits the full task list with
                // "confirmed": true.
                let decision = studio.check_spending(&estimate, confirmed);
                if let SpendingDecision::RequireConfirmation { .. } = decision {
                    return ok_response(id, decision_value(decision));
                }
                let options = BatchOptions {
                    concurrency_limit: request
                        .get("concurrency")
                        .and_then(Value::as_u64)
                        .map(|value| value as usize)
                        .unwrap_or(2),
                    output_dir: request
                        .get("output_dir")
                        .and_then(Value::as_str)
                        .map(PathBuf::from),
                };
                match studio.run_batch(runner, &tasks, &options, None) {
                    Ok(report) => {
                        ok_response(id, json!({ "status": "completed", "report": report }))
                    }
                    Err(err) => error_response(id, &err.to_string()),
                }
            }
            Err(reason) => error_response(id, &reason),
        },
        other => error_response(id, &format!("unknown op '{other}'")),
    }
}

fn parse_tasks(request: &Value) -> Result<Vec<GenerationTask>, String> {
    let rows = request
        .get("tasks")
        .and_then(Value::as_array)
        .ok_or_else(|| "missing 'tasks' array".to_string())?;
    if rows.is_empty() {
        return Err("'tasks' must not be empty".to_string());
    }
    rows.iter()
        .enumerate()
        .map(|(index, row)| {
            let mut task: GenerationTask = serde_json::from_value(row.clone())
                .map_err(|err| format!("task {index}: {err}"))?;
            task.sequence_index = index;
            Ok(task)
        })
        .collect()
}

fn request_confirmed(request: &Value) -> bool {
    request
        .get("confirmed")
        .and_then(Value::as_bool)
        .unwrap_or(false)
}

fn decision_value(decision: SpendingDecision) -> Value {
    match decision {
        SpendingDecision::Allow => json!({ "status": "allow" }),
        SpendingDecision::RequireConfirmation {
            estimated_cost_usd,
            threshold_usd,
        } => json!({
            "status": "confirmation_required",
            "estimated_cost_usd": estimated_cost_usd,
            "threshold_usd": threshold_usd,
        }),
    }
}

fn ok_response(id: Value, result: Value) -> Value {
    json!({ "id": id, "ok": true, "result": result })
}

fn error_response(id: Value, reason: &str) -> Value {
    json!({ "id": id, "ok": false, "error": reason })
}
