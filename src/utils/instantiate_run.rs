// src/utils/instantiate_run.rs
use anyhow::{Context, Result};
use log::info;

use crate::matching::store::MatchStore;
use crate::models::core::RunId;

pub const BATCH_RUN_DESCRIPTION: &str = "Batch Record Matching";
pub const SINGLE_RUN_DESCRIPTION: &str = "Single Record Matching";
pub const BASELINE_RUN_DESCRIPTION: &str = "Default run";

/// Mints a fresh run id for a batch or single-record request.
pub async fn create_new_run(store: &dyn MatchStore, description: &str) -> Result<RunId> {
    let run_id = store
        .create_run(description)
        .await
        .with_context(|| format!("Failed to create run '{}'", description))?;
    info!("Created run {} ({})", run_id, description);
    Ok(run_id)
}
