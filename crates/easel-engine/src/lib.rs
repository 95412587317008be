use std::panic::{catch_unwind, AssertUnwindSafe};
use std::path::{Path, PathBuf};
use std::sync::mpsc;
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{bail, Context, Result};
use easel_contracts::catalog::ModelCatalog;
use easel_contracts::credentials::{non_empty_env, Credentials};
use easel_contracts::events::{timestamp_millis, EventLog, EventPayload};
use easel_contracts::tasks::{
    BatchReport, CostBreakdown, GenerationResult, GenerationTask, ModelUsage,
};
use image::{Rgb, RgbImage};
use reqwest::blocking::{Client as HttpClient, Response as HttpResponse};
use serde_json::{json, Map, Value};
use thiserror::Error;
use uuid::Uuid;

/// Charged per image when a task's model is missing from the catalog.
/// Deliberately at the high end of the shipped per-image prices so an
/// unknown model inflates the estimate instead of slipping past the
/// spending gate as free.
pub const FALLBACK_COST_PER_IMAGE_USD: f64 = 0.10;

pub const DEFAULT_SPENDING_LIMIT_USD: f64 = 5.0;

const DEFAULT_REQUEST_TIMEOUT_S: f64 = 120.0;
const MAX_ERROR_BODY_CHARS: usize = 512;

#[derive(Debug, Error)]
pub enum BatchConfigError {
    #[error("concurrency_limit must be at least 1, got {0}")]
    InvalidConcurrency(usize),
    #[error("batch contains no tasks")]
    EmptyBatch,
    #[error("output directory {path} is unusable: {source}")]
    OutputDir {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

// ---------------------------------------------------------------------------
// Cost estimation

/// Deterministic cost projection for a task list. Pure; unknown models
/// are charged [`FALLBACK_COST_PER_IMAGE_USD`] and still appear in the
/// per-model rows under their requested id.
pub fn estimate_cost(tasks: &[GenerationTask], catalog: &ModelCatalog) -> CostBreakdown {
    let mut breakdown = CostBreakdown::default();
    for task in tasks {
        let (unit_cost_usd, images) = match catalog.get(&task.model_id) {
            Some(descriptor) => (
                descriptor.cost_per_image_usd,
                task.image_count().min(descriptor.max_images_per_call),
            ),
            None => (FALLBACK_COST_PER_IMAGE_USD, task.image_count()),
        };
        let cost_usd = unit_cost_usd * images as f64;
        let entry = breakdown
            .per_model
            .entry(task.model_id.clone())
            .or_insert(ModelUsage {
                image_count: 0,
                cost_usd: 0.0,
            });
        entry.image_count += images;
        entry.cost_usd += cost_usd;
        breakdown.total_cost_usd += cost_usd;
    }
    breakdown
}

/// Rewrites each task's `n` parameter down to its model's per-call
/// ceiling, so the gated estimate and the outbound request always
/// describe the same image count. Tasks whose model is not in the
/// catalog are left as requested; the estimator charges those at the
/// fallback rate for the full count.
pub fn clamp_image_counts(tasks: &mut [GenerationTask], catalog: &ModelCatalog) {
    for task in tasks {
        let Some(descriptor) = catalog.get(&task.model_id) else {
            continue;
        };
        if task.image_count() > descriptor.max_images_per_call {
            task.parameters.insert(
                "n".to_string(),
                Value::Number(descriptor.max_images_per_call.into()),
            );
        }
    }
}

// ---------------------------------------------------------------------------
// Spending guard

/// Outcome of the spending gate. `RequireConfirmation` is a signal the
/// caller must answer by re-invoking with `confirmed = true`, not an
/// error and not a silent block.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum SpendingDecision {
    Allow,
    RequireConfirmation {
        estimated_cost_usd: f64,
        threshold_usd: f64,
    },
}

/// Stateless cost ceiling, re-evaluated for every batch. Confirming
/// one batch never exempts the next.
#[derive(Debug, Clone, Copy)]
pub struct SpendingGuard {
    pub threshold_usd: f64,
}

impl SpendingGuard {
    pub fn new(threshold_usd: f64) -> Self {
        Self { threshold_usd }
    }

    pub fn from_env() -> Self {
        let threshold_usd = non_empty_env("EASEL_SPENDING_LIMIT_USD")
            .and_then(|raw| raw.parse::<f64>().ok())
            .filter(|value| value.is_finite() && *value >= 0.0)
            .unwrap_or(DEFAULT_SPENDING_LIMIT_USD);
        Self { threshold_usd }
    }

    pub fn check(&self, estimate: &CostBreakdown, confirmed: bool) -> SpendingDecision {
        if confirmed || estimate.total_cost_usd <= self.threshold_usd {
            SpendingDecision::Allow
        } else {
            SpendingDecision::RequireConfirmation {
                estimated_cost_usd: estimate.total_cost_usd,
                threshold_usd: self.threshold_usd,
            }
        }
    }
}

impl Default for SpendingGuard {
    fn default() -> Self {
        Self::new(DEFAULT_SPENDING_LIMIT_USD)
    }
}

// ---------------------------------------------------------------------------
// Task execution

/// Executes exactly one task. Implementations must convert every
/// provider problem into a `Failure` result; nothing escapes as an
/// error across this boundary.
pub trait TaskRunner: Sync {
    fn run(&self, task: &GenerationTask, output_dir: Option<&Path>) -> GenerationResult;
}

/// HTTP client for the generation provider: one outbound request per
/// task, response-shape normalization, optional image persistence.
pub struct GenerationClient {
    credentials: Credentials,
    http: HttpClient,
}

impl GenerationClient {
    pub fn new(credentials: Credentials) -> Result<Self> {
        let timeout_s = request_timeout_seconds();
        let http = HttpClient::builder()
            .timeout(Duration::from_secs_f64(timeout_s))
            .build()
            .context("failed to build HTTP client")?;
        Ok(Self { credentials, http })
    }

    fn submit(&self, task: &GenerationTask) -> Result<Value> {
        let endpoint = format!("{}/v1/images/generations", self.credentials.api_base);
        let payload = build_request_payload(task);
        let response = self
            .http
            .post(&endpoint)
            .bearer_auth(&self.credentials.api_key)
            .json(&Value::Object(payload))
            .send()
            .with_context(|| format!("generation request failed ({endpoint})"))?;
        response_json_or_error("provider", response)
    }

    fn download(&self, url: &str) -> Result<(Vec<u8>, Option<String>)> {
        let response = self
            .http
            .get(url)
            .send()
            .with_context(|| format!("image download failed ({url})"))?;
        if !response.status().is_success() {
            let code = response.status().as_u16();
            let body = response.text().unwrap_or_default();
            bail!(
                "image download failed ({code}): {}",
                truncate_text(&body, MAX_ERROR_BODY_CHARS)
            );
        }
        let mime_type = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|value| value.to_str().ok())
            .map(str::to_string);
        let bytes = response
            .bytes()
            .context("failed reading image bytes")?
            .to_vec();
        Ok((bytes, mime_type))
    }

}

type FetchFn<'a> = dyn Fn(&str) -> Result<(Vec<u8>, Option<String>)> + 'a;

/// Fetches each URL into `dir` through `fetch`. One URL's failure
/// skips that file only; the returned paths are the files actually
/// written.
fn persist_images(
    task: &GenerationTask,
    urls: &[String],
    dir: &Path,
    fetch: &FetchFn<'_>,
) -> Vec<PathBuf> {
    let stamp = timestamp_millis();
    let mut saved = Vec::new();
    for url in urls {
        let (bytes, mime_type) = match fetch(url) {
            Ok(downloaded) => downloaded,
            Err(err) => {
                eprintln!("warning: {:#}", err);
                continue;
            }
        };
        let ext = extension_from_mime(mime_type.as_deref());
        let path = dir.join(unique_artifact_name(
            &task.model_id,
            task.sequence_index,
            stamp,
            ext,
        ));
        if let Err(err) = std::fs::write(&path, bytes) {
            eprintln!("warning: failed to write {}: {err}", path.display());
            continue;
        }
        saved.push(path);
    }
    saved
}

impl TaskRunner for GenerationClient {
    fn run(&self, task: &GenerationTask, output_dir: Option<&Path>) -> GenerationResult {
        let started = Instant::now();
        let payload = match self.submit(task) {
            Ok(payload) => payload,
            Err(err) => {
                return GenerationResult::Failure {
                    reason: format!("{err:#}"),
                    duration_ms: elapsed_ms(started),
                }
            }
        };

        let image_urls = extract_image_urls(&payload);
        if image_urls.is_empty() {
            return GenerationResult::Failure {
                reason: "no images returned".to_string(),
                duration_ms: elapsed_ms(started),
            };
        }

        let saved_paths = match output_dir {
            Some(dir) => persist_images(task, &image_urls, dir, &|url| self.download(url)),
            None => Vec::new(),
        };

        GenerationResult::Success {
            image_urls,
            saved_paths,
            duration_ms: elapsed_ms(started),
        }
    }
}

fn build_request_payload(task: &GenerationTask) -> Map<String, Value> {
    let mut payload = Map::new();
    payload.insert("model".to_string(), Value::String(task.model_id.clone()));
    payload.insert("prompt".to_string(), Value::String(task.prompt.clone()));
    payload.insert("n".to_string(), Value::Number(task.image_count().into()));
    for (key, value) in &task.parameters {
        let normalized = key.trim().to_ascii_lowercase();
        if matches!(normalized.as_str(), "model" | "prompt" | "n") {
            continue;
        }
        payload.insert(key.clone(), value.clone());
    }
    payload
}

// ---------------------------------------------------------------------------
// Response normalization

type UrlExtractor = fn(&Value) -> Vec<String>;

/// Known provider response shapes, tried in this order. The first
/// extractor yielding at least one URL wins; adding a shape is a new
/// row here, not a branch edit.
const RESPONSE_EXTRACTORS: &[(&str, UrlExtractor)] = &[
    ("data_array", extract_data_array),
    ("image_object", extract_image_object),
    ("nested_output", extract_nested_output),
];

pub fn extract_image_urls(payload: &Value) -> Vec<String> {
    for (_shape, extractor) in RESPONSE_EXTRACTORS {
        let urls = extractor(payload);
        if !urls.is_empty() {
            return urls;
        }
    }
    Vec::new()
}

fn push_url(out: &mut Vec<String>, raw: &str) {
    let trimmed = raw.trim();
    if !trimmed.is_empty()
        && trimmed.starts_with("http")
        && !out.iter().any(|existing| existing == trimmed)
    {
        out.push(trimmed.to_string());
    }
}

/// Flat `data` array of URL objects or plain strings.
fn extract_data_array(payload: &Value) -> Vec<String> {
    let mut out = Vec::new();
    let Some(rows) = payload.get("data").and_then(Value::as_array) else {
        return out;
    };
    for row in rows {
        match row {
            Value::String(url) => push_url(&mut out, url),
            Value::Object(obj) => {
                if let Some(url) = obj.get("url").and_then(Value::as_str) {
                    push_url(&mut out, url);
                }
            }
            _ => {}
        }
    }
    out
}

/// Single `image` object or an `images` list.
fn extract_image_object(payload: &Value) -> Vec<String> {
    let mut out = Vec::new();
    match payload.get("image") {
        Some(Value::String(url)) => push_url(&mut out, url),
        Some(Value::Object(obj)) => {
            if let Some(url) = obj.get("url").and_then(Value::as_str) {
                push_url(&mut out, url);
            }
        }
        _ => {}
    }
    if let Some(rows) = payload.get("images").and_then(Value::as_array) {
        for row in rows {
            match row {
                Value::String(url) => push_url(&mut out, url),
                Value::Object(obj) => {
                    if let Some(url) = obj.get("url").and_then(Value::as_str) {
                        push_url(&mut out, url);
                    }
                }
                _ => {}
            }
        }
    }
    out
}

/// Nested wrapper objects (`output`, `result`, `url`, `urls`), walked
/// recursively with a depth cap.
fn extract_nested_output(payload: &Value) -> Vec<String> {
    let mut out = Vec::new();
    collect_wrapped_urls(payload, &mut out, 0);
    out
}

fn collect_wrapped_urls(value: &Value, out: &mut Vec<String>, depth: usize) {
    if depth > 6 {
        return;
    }
    match value {
        Value::String(url) => push_url(out, url),
        Value::Array(rows) => {
            for row in rows {
                collect_wrapped_urls(row, out, depth + 1);
            }
        }
        Value::Object(obj) => {
            for key in ["url", "urls", "output", "result", "artifacts"] {
                if let Some(inner) = obj.get(key) {
                    collect_wrapped_urls(inner, out, depth + 1);
                }
            }
        }
        _ => {}
    }
}

// ---------------------------------------------------------------------------
// Dry-run client

/// Offline stand-in for the provider: synthesizes solid-color
/// placeholder PNGs instead of calling out. Drives `--dry-run`.
pub struct DryRunClient;

impl TaskRunner for DryRunClient {
    fn run(&self, task: &GenerationTask, output_dir: Option<&Path>) -> GenerationResult {
        let started = Instant::now();
        let stamp = timestamp_millis();
        let mut image_urls = Vec::new();
        let mut saved_paths = Vec::new();
        for idx in 0..task.image_count() {
            image_urls.push(format!(
                "dryrun://{}/{}/{idx}",
                task.model_id, task.sequence_index
            ));
            if let Some(dir) = output_dir {
                let path = dir.join(unique_artifact_name(
                    &task.model_id,
                    task.sequence_index,
                    stamp,
                    "png",
                ));
                if let Err(err) = write_placeholder_image(&path, 64, 64, &task.prompt) {
                    return GenerationResult::Failure {
                        reason: format!("{err:#}"),
                        duration_ms: elapsed_ms(started),
                    };
                }
                saved_paths.push(path);
            }
        }
        GenerationResult::Success {
            image_urls,
            saved_paths,
            duration_ms: elapsed_ms(started),
        }
    }
}

fn write_placeholder_image(path: &Path, width: u32, height: u32, prompt: &str) -> Result<()> {
    let (r, g, b) = color_from_prompt(prompt);
    let mut canvas = RgbImage::new(width, height);
    for pixel in canvas.pixels_mut() {
        *pixel = Rgb([r, g, b]);
    }
    canvas
        .save(path)
        .with_context(|| format!("failed to save {}", path.display()))?;
    Ok(())
}

fn color_from_prompt(prompt: &str) -> (u8, u8, u8) {
    let mut hash: u64 = 0xcbf2_9ce4_8422_2325;
    for byte in prompt.bytes() {
        hash ^= u64::from(byte);
        hash = hash.wrapping_mul(0x0000_0100_0000_01b3);
    }
    let bytes = hash.to_be_bytes();
    (bytes[0], bytes[1], bytes[2])
}

// ---------------------------------------------------------------------------
// Batch orchestrator

#[derive(Debug, Clone)]
pub struct BatchOptions {
    pub concurrency_limit: usize,
    pub output_dir: Option<PathBuf>,
}

impl Default for BatchOptions {
    fn default() -> Self {
        Self {
            concurrency_limit: 2,
            output_dir: None,
        }
    }
}

/// Payload handed to the progress callback after each task completes.
#[derive(Debug)]
pub struct BatchProgress<'a> {
    pub completed: usize,
    pub total: usize,
    pub task_index: usize,
    pub last: &'a GenerationResult,
}

pub type ProgressFn<'a> = dyn FnMut(&BatchProgress<'_>) + 'a;

/// Runs the tasks in sequential windows of `concurrency_limit`,
/// recording each outcome at its original index. A window's tasks run
/// on scoped threads and report through a channel; the next window
/// starts only once the window drains, so at most `concurrency_limit`
/// tasks are ever in flight. Task failures are isolated: the batch
/// always runs to completion, and the only error this function itself
/// raises is a configuration error.
pub fn run_batch(
    runner: &dyn TaskRunner,
    tasks: &[GenerationTask],
    options: &BatchOptions,
    mut on_progress: Option<&mut ProgressFn<'_>>,
) -> Result<BatchReport, BatchConfigError> {
    if options.concurrency_limit < 1 {
        return Err(BatchConfigError::InvalidConcurrency(
            options.concurrency_limit,
        ));
    }
    if tasks.is_empty() {
        return Err(BatchConfigError::EmptyBatch);
    }
    if let Some(dir) = &options.output_dir {
        std::fs::create_dir_all(dir).map_err(|source| BatchConfigError::OutputDir {
            path: dir.clone(),
            source,
        })?;
    }

    let started = Instant::now();
    let total = tasks.len();
    let output_dir = options.output_dir.as_deref();
    let mut slots: Vec<Option<GenerationResult>> = Vec::with_capacity(total);
    slots.resize_with(total, || None);
    let mut completed = 0usize;

    for (window_index, window) in tasks.chunks(options.concurrency_limit).enumerate() {
        let window_start = window_index * options.concurrency_limit;
        let (tx, rx) = mpsc::channel::<(usize, GenerationResult)>();
        thread::scope(|scope| {
            for (offset, task) in window.iter().enumerate() {
                let tx = tx.clone();
                scope.spawn(move || {
                    let outcome = catch_unwind(AssertUnwindSafe(|| runner.run(task, output_dir)));
                    let result = outcome.unwrap_or_else(|panic| GenerationResult::Failure {
                        reason: format!("task panicked: {}", panic_text(panic.as_ref())),
                        duration_ms: 0,
                    });
                    let _ = tx.send((offset, result));
                });
            }
            drop(tx);
            for (offset, result) in rx {
                completed += 1;
                if let Some(callback) = &mut on_progress {
                    callback(&BatchProgress {
                        completed,
                        total,
                        task_index: window_start + offset,
                        last: &result,
                    });
                }
                slots[window_start + offset] = Some(result);
            }
        });
    }

    let results: Vec<GenerationResult> = slots
        .into_iter()
        .map(|slot| {
            slot.unwrap_or_else(|| GenerationResult::Failure {
                reason: "task result missing".to_string(),
                duration_ms: 0,
            })
        })
        .collect();
    let succeeded = results.iter().filter(|result| result.is_success()).count();

    Ok(BatchReport {
        total,
        succeeded,
        failed: total - succeeded,
        results,
        total_duration_ms: elapsed_ms(started),
    })
}

fn panic_text(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(text) = panic.downcast_ref::<&str>() {
        (*text).to_string()
    } else if let Some(text) = panic.downcast_ref::<String>() {
        text.clone()
    } else {
        "unknown panic".to_string()
    }
}

// ---------------------------------------------------------------------------
// Facade

/// Ties catalog, guard, and event log together behind the surface the
/// front ends call: estimate, gate, run.
pub struct Studio {
    catalog: ModelCatalog,
    guard: SpendingGuard,
    events: Option<EventLog>,
}

impl Studio {
    pub fn new(catalog: ModelCatalog, guard: SpendingGuard) -> Self {
        Self {
            catalog,
            guard,
            events: None,
        }
    }

    pub fn with_events(mut self, events: EventLog) -> Self {
        self.events = Some(events);
        self
    }

    pub fn catalog(&self) -> &ModelCatalog {
        &self.catalog
    }

    pub fn guard(&self) -> &SpendingGuard {
        &self.guard
    }

    pub fn estimate_cost(&self, tasks: &[GenerationTask]) -> CostBreakdown {
        estimate_cost(tasks, &self.catalog)
    }

    pub fn check_spending(&self, estimate: &CostBreakdown, confirmed: bool) -> SpendingDecision {
        let decision = self.guard.check(estimate, confirmed);
        if let SpendingDecision::RequireConfirmation {
            estimated_cost_usd,
            threshold_usd,
        } = decision
        {
            self.emit(
                "spending_gate",
                map_object(json!({
                    "estimated_cost_usd": estimated_cost_usd,
                    "threshold_usd": threshold_usd,
                })),
            );
        }
        decision
    }

    pub fn run_batch(
        &self,
        runner: &dyn TaskRunner,
        tasks: &[GenerationTask],
        options: &BatchOptions,
        mut on_progress: Option<&mut ProgressFn<'_>>,
    ) -> Result<BatchReport, BatchConfigError> {
        self.emit(
            "batch_started",
            map_object(json!({
                "total": tasks.len(),
                "concurrency_limit": options.concurrency_limit,
            })),
        );

        let mut chained = |progress: &BatchProgress<'_>| {
            self.emit(
                "task_completed",
                map_object(json!({
                    "task_index": progress.task_index,
                    "completed": progress.completed,
                    "total": progress.total,
                    "status": if progress.last.is_success() { "success" } else { "failure" },
                    "reason": progress.last.failure_reason(),
                })),
            );
            if let Some(callback) = &mut on_progress {
                callback(progress);
            }
        };

        let report = run_batch(runner, tasks, options, Some(&mut chained))?;

        self.emit(
            "batch_finished",
            map_object(json!({
                "succeeded": report.succeeded,
                "failed": report.failed,
                "total_duration_ms": report.total_duration_ms,
            })),
        );
        Ok(report)
    }

    // Event-log trouble must never fail a batch.
    fn emit(&self, event: &str, payload: EventPayload) {
        if let Some(events) = &self.events {
            let _ = events.append(event, payload);
        }
    }
}

// ---------------------------------------------------------------------------
// Shared helpers

fn response_json_or_error(context_label: &str, response: HttpResponse) -> Result<Value> {
    let status = response.status();
    let code = status.as_u16();
    let body = response
        .text()
        .with_context(|| format!("{context_label} response body read failed"))?;
    if !status.is_success() {
        let kind = match code {
            401 | 403 => "authentication failed",
            429 => "rate limited",
            400 | 422 => "malformed request",
            _ => "request failed",
        };
        bail!(
            "{context_label} {kind} ({code}): {}",
            truncate_text(&body, MAX_ERROR_BODY_CHARS)
        );
    }
    serde_json::from_str(&body)
        .with_context(|| format!("{context_label} returned invalid JSON payload"))
}

/// Collision-free by construction: model id, per-task sequence marker,
/// timestamp, and a random suffix. Never derived from the URL.
fn unique_artifact_name(model_id: &str, sequence_index: usize, stamp: u128, ext: &str) -> String {
    let suffix = Uuid::new_v4().simple().to_string();
    format!(
        "{}-{sequence_index:03}-{stamp}-{}.{ext}",
        sanitize_component(model_id),
        &suffix[..8]
    )
}

fn sanitize_component(raw: &str) -> String {
    let cleaned: String = raw
        .chars()
        .map(|ch| {
            if ch.is_ascii_alphanumeric() || ch == '-' || ch == '_' || ch == '.' {
                ch
            } else {
                '-'
            }
        })
        .collect();
    if cleaned.is_empty() {
        "model".to_string()
    } else {
        cleaned
    }
}

fn extension_from_mime(mime_type: Option<&str>) -> &'static str {
    let normalized = mime_type
        .map(|value| value.split(';').next().unwrap_or("").trim().to_ascii_lowercase());
    match normalized.as_deref() {
        Some("image/jpeg") | Some("image/jpg") => "jpg",
        Some("image/webp") => "webp",
        _ => "png",
    }
}

fn request_timeout_seconds() -> f64 {
    non_empty_env("EASEL_REQUEST_TIMEOUT_S")
        .and_then(|raw| raw.parse::<f64>().ok())
        .filter(|value| value.is_finite() && *value > 0.0)
        .unwrap_or(DEFAULT_REQUEST_TIMEOUT_S)
}

fn elapsed_ms(started: Instant) -> u64 {
    u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX)
}

fn truncate_text(value: &str, max_chars: usize) -> String {
    if value.chars().count() <= max_chars {
        return value.to_string();
    }
    value.chars().take(max_chars).collect::<String>() + "…"
}

fn map_object(value: Value) -> Map<String, Value> {
    value.as_object().cloned().unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use easel_contracts::catalog::ModelCatalog;
    use serde_json::json;

    use super::*;

    fn task_at(model: &str, index: usize) -> GenerationTask {
        let mut task = GenerationTask::new(model, format!("prompt {index}"));
        task.sequence_index = index;
        task
    }

    fn tasks(count: usize) -> Vec<GenerationTask> {
        (0..count).map(|index| task_at("sdxl", index)).collect()
    }

    fn catalog() -> ModelCatalog {
        ModelCatalog::load(None).expect("builtin catalog").catalog
    }

    /// Sleeps per task, fails scripted indices, and tracks the
    /// in-flight high-water mark.
    struct ScriptedRunner {
        delays_ms: Vec<u64>,
        failing: Vec<usize>,
        in_flight: AtomicUsize,
        max_in_flight: AtomicUsize,
    }

    impl ScriptedRunner {
        fn new(delays_ms: Vec<u64>, failing: Vec<usize>) -> Self {
            Self {
                delays_ms,
                failing,
                in_flight: AtomicUsize::new(0),
                max_in_flight: AtomicUsize::new(0),
            }
        }
    }

    impl TaskRunner for ScriptedRunner {
        fn run(&self, task: &GenerationTask, _output_dir: Option<&Path>) -> GenerationResult {
            let running = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_in_flight.fetch_max(running, Ordering::SeqCst);
            let delay = self
                .delays_ms
                .get(task.sequence_index)
                .copied()
                .unwrap_or(0);
            if delay > 0 {
                thread::sleep(Duration::from_millis(delay));
            }
            self.in_flight.fetch_sub(1, Ordering::SeqCst);
            if self.failing.contains(&task.sequence_index) {
                GenerationResult::Failure {
                    reason: "provider timeout".to_string(),
                    duration_ms: delay,
                }
            } else {
                GenerationResult::Success {
                    image_urls: vec![format!("https://img.example/{}.png", task.sequence_index)],
                    saved_paths: Vec::new(),
                    duration_ms: delay,
                }
            }
        }
    }

    fn success_url(result: &GenerationResult) -> &str {
        match result {
            GenerationResult::Success { image_urls, .. } => &image_urls[0],
            GenerationResult::Failure { reason, .. } => panic!("expected success, got {reason}"),
        }
    }

    #[test]
    fn five_tasks_two_wide_all_succeed_in_input_order() {
        let runner = ScriptedRunner::new(vec![0; 5], Vec::new());
        let options = BatchOptions {
            concurrency_limit: 2,
            output_dir: None,
        };
        let report = run_batch(&runner, &tasks(5), &options, None).expect("batch runs");
        assert_eq!(report.total, 5);
        assert_eq!(report.succeeded, 5);
        assert_eq!(report.failed, 0);
        assert_eq!(report.results.len(), 5);
        for (index, result) in report.results.iter().enumerate() {
            assert_eq!(success_url(result), format!("https://img.example/{index}.png"));
        }
    }

    #[test]
    fn results_keep_input_order_under_uneven_latency() {
        let runner = ScriptedRunner::new(vec![80, 5, 60, 10], Vec::new());
        let options = BatchOptions {
            concurrency_limit: 4,
            output_dir: None,
        };
        let report = run_batch(&runner, &tasks(4), &options, None).expect("batch runs");
        for (index, result) in report.results.iter().enumerate() {
            assert_eq!(success_url(result), format!("https://img.example/{index}.png"));
        }
    }

    #[test]
    fn concurrency_never_exceeds_the_limit() {
        let runner = ScriptedRunner::new(vec![20; 6], Vec::new());
        let options = BatchOptions {
            concurrency_limit: 2,
            output_dir: None,
        };
        run_batch(&runner, &tasks(6), &options, None).expect("batch runs");
        assert!(runner.max_in_flight.load(Ordering::SeqCst) <= 2);
    }

    #[test]
    fn one_failure_leaves_the_rest_untouched() {
        let runner = ScriptedRunner::new(vec![0; 3], vec![1]);
        let options = BatchOptions {
            concurrency_limit: 2,
            output_dir: None,
        };
        let report = run_batch(&runner, &tasks(3), &options, None).expect("batch runs");
        assert_eq!(report.succeeded, 2);
        assert_eq!(report.failed, 1);
        assert!(report.results[0].is_success());
        assert_eq!(
            report.results[1].failure_reason(),
            Some("provider timeout")
        );
        assert!(report.results[2].is_success());
    }

    #[test]
    fn progress_fires_once_per_task_with_increasing_count() {
        let runner = ScriptedRunner::new(vec![15, 5, 25, 10, 0], Vec::new());
        let options = BatchOptions {
            concurrency_limit: 3,
            output_dir: None,
        };
        let mut counts = Vec::new();
        let mut seen_indices = Vec::new();
        let mut callback = |progress: &BatchProgress<'_>| {
            counts.push(progress.completed);
            seen_indices.push(progress.task_index);
            assert_eq!(progress.total, 5);
        };
        run_batch(&runner, &tasks(5), &options, Some(&mut callback)).expect("batch runs");
        assert_eq!(counts, vec![1, 2, 3, 4, 5]);
        seen_indices.sort_unstable();
        assert_eq!(seen_indices, vec![0, 1, 2, 3, 4]);
    }

    #[test]
    fn configuration_errors_are_rejected_up_front() {
        let runner = ScriptedRunner::new(Vec::new(), Vec::new());
        let zero_wide = BatchOptions {
            concurrency_limit: 0,
            output_dir: None,
        };
        assert!(matches!(
            run_batch(&runner, &tasks(1), &zero_wide, None),
            Err(BatchConfigError::InvalidConcurrency(0))
        ));
        assert!(matches!(
            run_batch(&runner, &[], &BatchOptions::default(), None),
            Err(BatchConfigError::EmptyBatch)
        ));
    }

    #[test]
    fn panicking_task_becomes_a_failure_for_its_slot_only() {
        struct PanickyRunner;
        impl TaskRunner for PanickyRunner {
            fn run(&self, task: &GenerationTask, _dir: Option<&Path>) -> GenerationResult {
                if task.sequence_index == 1 {
                    panic!("boom");
                }
                GenerationResult::Success {
                    image_urls: vec!["https://img.example/ok.png".to_string()],
                    saved_paths: Vec::new(),
                    duration_ms: 0,
                }
            }
        }
        let report = run_batch(
            &PanickyRunner,
            &tasks(3),
            &BatchOptions::default(),
            None,
        )
        .expect("batch runs");
        assert_eq!(report.succeeded, 2);
        assert!(report.results[1]
            .failure_reason()
            .is_some_and(|reason| reason.contains("boom")));
    }

    #[test]
    fn spending_gate_requires_confirmation_above_threshold() {
        let guard = SpendingGuard::new(5.0);
        let mut estimate = CostBreakdown::default();
        estimate.total_cost_usd = 6.0;
        assert_eq!(
            guard.check(&estimate, false),
            SpendingDecision::RequireConfirmation {
                estimated_cost_usd: 6.0,
                threshold_usd: 5.0,
            }
        );
        assert_eq!(guard.check(&estimate, true), SpendingDecision::Allow);

        estimate.total_cost_usd = 4.0;
        assert_eq!(guard.check(&estimate, false), SpendingDecision::Allow);
        assert_eq!(guard.check(&estimate, true), SpendingDecision::Allow);
    }

    #[test]
    fn estimate_sums_per_model_and_total() {
        let catalog = catalog();
        let mut list = vec![task_at("gpt-image-1", 0), task_at("sdxl", 1)];
        list[0].parameters.insert("n".to_string(), json!(2));
        let breakdown = estimate_cost(&list, &catalog);
        let gpt = &breakdown.per_model["gpt-image-1"];
        assert_eq!(gpt.image_count, 2);
        assert!((gpt.cost_usd - 0.08).abs() < 1e-9);
        assert!((breakdown.total_cost_usd - 0.082).abs() < 1e-9);
    }

    #[test]
    fn unknown_model_is_charged_the_conservative_fallback() {
        let breakdown = estimate_cost(&[task_at("not-a-model", 0)], &catalog());
        assert!((breakdown.total_cost_usd - FALLBACK_COST_PER_IMAGE_USD).abs() < 1e-9);
        assert!(breakdown.per_model.contains_key("not-a-model"));
    }

    #[test]
    fn adding_a_task_never_lowers_the_estimate() {
        let catalog = catalog();
        let mut list = tasks(3);
        let base = estimate_cost(&list, &catalog).total_cost_usd;
        list.push(task_at("gpt-image-1", 3));
        let extended = estimate_cost(&list, &catalog).total_cost_usd;
        assert!(extended >= base);
    }

    #[test]
    fn image_count_is_clamped_to_the_model_ceiling() {
        let catalog = catalog();
        let mut task = task_at("imagen-4", 0);
        task.parameters.insert("n".to_string(), json!(99));
        let breakdown = estimate_cost(&[task], &catalog);
        assert_eq!(breakdown.per_model["imagen-4"].image_count, 4);
    }

    #[test]
    fn gate_and_payload_agree_on_clamped_image_counts() {
        let catalog = catalog();
        let mut list = vec![task_at("imagen-4", 0)];
        list[0].parameters.insert("n".to_string(), json!(99));
        clamp_image_counts(&mut list, &catalog);

        let breakdown = estimate_cost(&list, &catalog);
        assert_eq!(breakdown.per_model["imagen-4"].image_count, 4);
        let payload = build_request_payload(&list[0]);
        assert_eq!(payload["n"], json!(4));

        // Unknown models are charged for what they request, so their
        // count must not be rewritten either.
        let mut unknown = vec![task_at("not-a-model", 0)];
        unknown[0].parameters.insert("n".to_string(), json!(7));
        clamp_image_counts(&mut unknown, &catalog);
        assert_eq!(unknown[0].image_count(), 7);
    }

    #[test]
    fn extractors_cover_the_known_response_shapes() {
        let flat = json!({"data": [{"url": "https://img.example/a.png"}, {"url": "https://img.example/b.png"}]});
        assert_eq!(extract_image_urls(&flat).len(), 2);

        let strings = json!({"data": ["https://img.example/a.png"]});
        assert_eq!(extract_image_urls(&strings).len(), 1);

        let single = json!({"image": {"url": "https://img.example/a.png"}});
        assert_eq!(extract_image_urls(&single).len(), 1);

        let listed = json!({"images": ["https://img.example/a.png", {"url": "https://img.example/b.png"}]});
        assert_eq!(extract_image_urls(&listed).len(), 2);

        let nested = json!({"output": {"result": {"urls": ["https://img.example/a.png"]}}});
        assert_eq!(extract_image_urls(&nested).len(), 1);
    }

    #[test]
    fn extractor_priority_is_fixed_and_duplicates_drop() {
        let mixed = json!({
            "data": [{"url": "https://img.example/data.png"}],
            "output": ["https://img.example/output.png"],
        });
        assert_eq!(
            extract_image_urls(&mixed),
            vec!["https://img.example/data.png".to_string()]
        );

        let repeated = json!({"data": [
            {"url": "https://img.example/a.png"},
            {"url": "https://img.example/a.png"},
        ]});
        assert_eq!(extract_image_urls(&repeated).len(), 1);
    }

    #[test]
    fn unrecognized_payload_yields_no_urls() {
        let empty = json!({"data": [{"b64_json": "AAAA"}]});
        assert!(extract_image_urls(&empty).is_empty());
        assert!(extract_image_urls(&json!({"status": "ok"})).is_empty());
    }

    #[test]
    fn artifact_names_are_filesystem_safe_and_distinct() {
        let first = unique_artifact_name("fal-ai/fast-sdxl", 7, 1700000000000, "png");
        let second = unique_artifact_name("fal-ai/fast-sdxl", 7, 1700000000000, "png");
        assert!(first.starts_with("fal-ai-fast-sdxl-007-1700000000000-"));
        assert!(!first.contains('/'));
        assert_ne!(first, second);
    }

    #[test]
    fn a_failed_download_skips_that_file_only() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let task = task_at("sdxl", 0);
        let urls = vec![
            "https://img.example/a.png".to_string(),
            "https://img.example/b.png".to_string(),
            "https://img.example/c.png".to_string(),
        ];
        let fetch = |url: &str| {
            if url.ends_with("b.png") {
                bail!("image download failed (503)");
            }
            Ok((vec![0u8; 4], Some("image/png".to_string())))
        };
        let saved = persist_images(&task, &urls, temp.path(), &fetch);
        assert_eq!(saved.len(), 2);
        for path in &saved {
            assert!(path.exists());
        }
        Ok(())
    }

    #[test]
    fn dry_run_writes_placeholders_and_reports_paths() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let out = temp.path().join("renders");
        let mut list = tasks(2);
        list[0].parameters.insert("n".to_string(), json!(2));
        let options = BatchOptions {
            concurrency_limit: 2,
            output_dir: Some(out.clone()),
        };
        let report = run_batch(&DryRunClient, &list, &options, None).expect("batch runs");
        assert_eq!(report.succeeded, 2);
        match &report.results[0] {
            GenerationResult::Success {
                image_urls,
                saved_paths,
                ..
            } => {
                assert_eq!(image_urls.len(), 2);
                assert_eq!(saved_paths.len(), 2);
                for path in saved_paths {
                    assert!(path.exists());
                }
            }
            GenerationResult::Failure { reason, .. } => panic!("dry run failed: {reason}"),
        }
        Ok(())
    }

    #[test]
    fn dry_run_without_output_dir_saves_nothing() {
        let report = run_batch(&DryRunClient, &tasks(1), &BatchOptions::default(), None)
            .expect("batch runs");
        match &report.results[0] {
            GenerationResult::Success { saved_paths, .. } => assert!(saved_paths.is_empty()),
            GenerationResult::Failure { reason, .. } => panic!("dry run failed: {reason}"),
        }
    }

    #[test]
    fn studio_emits_batch_lifecycle_events() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let events_path = temp.path().join("events.jsonl");
        let studio = Studio::new(catalog(), SpendingGuard::new(5.0))
            .with_events(EventLog::new(&events_path, "batch-test"));

        let list = tasks(2);
        let estimate = studio.estimate_cost(&list);
        assert_eq!(studio.check_spending(&estimate, false), SpendingDecision::Allow);
        studio
            .run_batch(&DryRunClient, &list, &BatchOptions::default(), None)
            .expect("batch runs");

        let content = std::fs::read_to_string(&events_path)?;
        let events: Vec<Value> = content
            .lines()
            .map(|line| serde_json::from_str(line))
            .collect::<Result<_, _>>()?;
        let kinds: Vec<&str> = events
            .iter()
            .filter_map(|event| event["event"].as_str())
            .collect();
        assert_eq!(
            kinds,
            vec!["batch_started", "task_completed", "task_completed", "batch_finished"]
        );
        Ok(())
    }

    #[test]
    fn studio_logs_the_spending_gate_signal() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let events_path = temp.path().join("events.jsonl");
        let studio = Studio::new(catalog(), SpendingGuard::new(0.0))
            .with_events(EventLog::new(&events_path, "batch-test"));

        let estimate = studio.estimate_cost(&tasks(1));
        let decision = studio.check_spending(&estimate, false);
        assert!(matches!(
            decision,
            SpendingDecision::RequireConfirmation { .. }
        ));

        let content = std::fs::read_to_string(&events_path)?;
        assert!(content.contains("spending_gate"));
        Ok(())
    }

    #[test]
    fn build_payload_merges_parameters_without_clobbering() {
        let mut task = task_at("sdxl", 0);
        task.parameters.insert("size".to_string(), json!("512x512"));
        task.parameters.insert("Model".to_string(), json!("evil-override"));
        task.parameters.insert("n".to_string(), json!(3));
        let payload = build_request_payload(&task);
        assert_eq!(payload["model"], json!("sdxl"));
        assert_eq!(payload["n"], json!(3));
        assert_eq!(payload["size"], json!("512x512"));
        assert!(!payload.contains_key("Model"));
    }

    #[test]
    fn mime_extension_fallbacks_to_png() {
        assert_eq!(extension_from_mime(Some("image/jpeg; charset=binary")), "jpg");
        assert_eq!(extension_from_mime(Some("image/webp")), "webp");
        assert_eq!(extension_from_mime(Some("application/json")), "png");
        assert_eq!(extension_from_mime(None), "png");
    }
}
