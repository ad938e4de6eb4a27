// src/utils/logging.rs - Stage level logging helpers for the batch pipeline
use log::{debug, error, info, warn};
use std::time::Instant;

use crate::models::core::{CustomerId, RunId};
use crate::models::stats_models::{BatchState, StageStats};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StageKind {
    Keying,
    Weighting,
    Embedding,
    Retrieval,
}

#[derive(Clone)]
pub struct StageLogger {
    stage_name: &'static str,
    stage_emoji: &'static str,
    run_id: RunId,
    start_time: Instant,
}

impl StageLogger {
    pub fn new(stage: StageKind, run_id: RunId) -> Self {
        let (stage_name, stage_emoji) = match stage {
            StageKind::Keying => ("KEYING", "🔑"),
            StageKind::Weighting => ("WEIGHTING", "⚖️"),
            StageKind::Embedding => ("EMBEDDING", "🧠"),
            StageKind::Retrieval => ("RETRIEVAL", "🔍"),
        };
        Self {
            stage_name,
            stage_emoji,
            run_id,
            start_time: Instant::now(),
        }
    }

    pub fn log_start(&self, records: usize, workers: usize) {
        info!(
            "[{}] {} 🚀 Starting stage for run {}: {} records, {} workers",
            self.stage_name, self.stage_emoji, self.run_id, records, workers
        );
    }

    pub fn log_phase(&self, phase: &str, details: Option<&str>) {
        let elapsed = self.start_time.elapsed();
        match details {
            Some(details) => info!(
                "[{}] {} 🔄 Phase: {} - {} [+{:.1}s]",
                self.stage_name, self.stage_emoji, phase, details, elapsed.as_secs_f32()
            ),
            None => info!(
                "[{}] {} 🔄 Phase: {} [+{:.1}s]",
                self.stage_name, self.stage_emoji, phase, elapsed.as_secs_f32()
            ),
        }
    }

    pub fn log_flush(&self, batch_num: usize, rows: usize) {
        if batch_num % 10 == 0 || batch_num == 1 {
            info!(
                "[{}] {} 📦 Flushed batch {} ({} rows) [+{:.1}s]",
                self.stage_name, self.stage_emoji, batch_num, rows, self.start_time.elapsed().as_secs_f32()
            );
        } else {
            debug!(
                "[{}] {} 📦 Flushed batch {} ({} rows)",
                self.stage_name, self.stage_emoji, batch_num, rows
            );
        }
    }

    pub fn log_dropped(&self, customer_id: CustomerId, reason: &str) {
        warn!(
            "[{}] {} ⚠️  Dropped customer {}: {}",
            self.stage_name, self.stage_emoji, customer_id, reason
        );
    }

    pub fn log_completion(&self, stats: &StageStats) {
        info!(
            "[{}] {} ✅ Completed in {:.2?}: {} received, {} emitted, {} dropped, {} rows persisted in {} calls",
            self.stage_name,
            self.stage_emoji,
            self.start_time.elapsed(),
            stats.received,
            stats.emitted,
            stats.dropped,
            stats.persisted,
            stats.persistence_calls
        );
    }

    pub fn log_warning(&self, message: &str) {
        warn!("[{}] {} ⚠️  {}", self.stage_name, self.stage_emoji, message);
    }

    pub fn log_error(&self, message: &str) {
        error!("[{}] {} ❌ {}", self.stage_name, self.stage_emoji, message);
    }
}

pub fn log_state_transition(run_id: RunId, from: BatchState, to: BatchState) {
    info!("🔄 Run {}: {} → {}", run_id, from.as_str(), to.as_str());
}

pub fn log_run_start(run_id: RunId, description: &str, records: usize) {
    info!("🚀 ===== MATCHING RUN {} STARTING =====", run_id);
    info!("📅 Description: {}", description);
    info!("📊 Records in run: {}", records);
}

pub fn log_run_completion(run_id: RunId, duration: std::time::Duration, stages: &[StageStats]) {
    info!("🎉 ===== MATCHING RUN {} COMPLETED in {:.2?} =====", run_id, duration);
    for stage in stages {
        info!(
            "  {}: {} received, {} emitted, {} dropped, {} persisted ({} calls, {:.2}s)",
            stage.stage,
            stage.received,
            stage.emitted,
            stage.dropped,
            stage.persisted,
            stage.persistence_calls,
            stage.elapsed_secs
        );
    }
}
