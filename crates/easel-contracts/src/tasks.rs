use std::path::PathBuf;

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// One unit of work: a single (model, prompt, parameters) generation
/// request. Immutable once built; `sequence_index` is the task's
/// position in its batch and is what result ordering keys on.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GenerationTask {
    pub model_id: String,
    pub prompt: String,
    #[serde(default)]
    pub parameters: Map<String, Value>,
    #[serde(default)]
    pub sequence_index: usize,
}

impl GenerationTask {
    pub fn new(model_id: impl Into<String>, prompt: impl Into<String>) -> Self {
        Self {
            model_id: model_id.into(),
            prompt: prompt.into(),
            parameters: Map::new(),
            sequence_index: 0,
        }
    }

    /// Requested image count for this task (`n` parameter, minimum 1).
    pub fn image_count(&self) -> u64 {
        self.parameters
            .get("n")
            .and_then(Value::as_u64)
            .filter(|value| *value > 0)
            .unwrap_or(1)
    }
}

/// Outcome of one task. Created exactly once, by the client; a
/// provider problem is data here, never an error crossing the batch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum GenerationResult {
    Success {
        image_urls: Vec<String>,
        #[serde(default)]
        saved_paths: Vec<PathBuf>,
        duration_ms: u64,
    },
    Failure {
        reason: String,
        duration_ms: u64,
    },
}

impl GenerationResult {
    pub fn is_success(&self) -> bool {
        matches!(self, GenerationResult::Success { .. })
    }

    pub fn failure_reason(&self) -> Option<&str> {
        match self {
            GenerationResult::Failure { reason, .. } => Some(reason),
            GenerationResult::Success { .. } => None,
        }
    }
}

/// Aggregate over one orchestrator run. `results` is always in input
/// order, one entry per task, successes and failures mixed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchReport {
    pub total: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub results: Vec<GenerationResult>,
    pub total_duration_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelUsage {
    pub image_count: u64,
    pub cost_usd: f64,
}

/// Projected spend for a task list, recomputed on demand.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct CostBreakdown {
    pub total_cost_usd: f64,
    pub per_model: IndexMap<String, ModelUsage>,
}
