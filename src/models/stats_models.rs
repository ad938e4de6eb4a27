// src/models/stats_models.rs
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::models::core::RunId;

/// Lifecycle of a batch through the pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum BatchState {
    Queued,
    Keying,
    Weighting,
    Persisted,
    Failed,
}

impl BatchState {
    pub fn as_str(&self) -> &'static str {
        match self {
            BatchState::Queued => "queued",
            BatchState::Keying => "normalizing/keying",
            BatchState::Weighting => "weighting",
            BatchState::Persisted => "persisted",
            BatchState::Failed => "failed",
        }
    }
}

/// Counts for one pipeline stage.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct StageStats {
    pub stage: String,
    pub received: usize,
    pub emitted: usize,
    pub dropped: usize,
    pub persisted: usize,
    pub persistence_calls: usize,
    pub elapsed_secs: f64,
}

impl StageStats {
    pub fn new(stage: &str) -> Self {
        Self {
            stage: stage.to_string(),
            ..Default::default()
        }
    }

    pub fn finish(&mut self, elapsed: Duration) {
        self.elapsed_secs = elapsed.as_secs_f64();
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EmbeddingOutcome {
    Completed,
    Disabled,
    /// The job failed and retrieval continues on blocking keys only.
    KeyOnlyFallback { reason: String },
}

/// Per-run summary printed by the CLI.
#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    pub run_id: RunId,
    pub description: String,
    pub state: BatchState,
    pub started_at: DateTime<Utc>,
    pub idf_population: String,
    pub idf_documents: usize,
    pub stages: Vec<StageStats>,
    pub embeddings: EmbeddingOutcome,
    pub total_elapsed_secs: f64,
}

impl RunReport {
    pub fn new(run_id: RunId, description: &str) -> Self {
        Self {
            run_id,
            description: description.to_string(),
            state: BatchState::Queued,
            started_at: Utc::now(),
            idf_population: String::new(),
            idf_documents: 0,
            stages: Vec::new(),
            embeddings: EmbeddingOutcome::Disabled,
            total_elapsed_secs: 0.0,
        }
    }

    pub fn stage(&self, name: &str) -> Option<&StageStats> {
        self.stages.iter().find(|s| s.stage == name)
    }

    pub fn uses_vectors(&self) -> bool {
        matches!(self.embeddings, EmbeddingOutcome::Completed)
    }
}
