// src/utils/record_source.rs
use std::path::Path;

use anyhow::{Context, Result};
use log::{info, warn};

use crate::error::MatchError;
use crate::models::core::CustomerRecord;
use crate::models::matching::MatchRequest;

/// Reads a batch CSV with a header row of
/// `first_name,last_name,phone_number,street,city,state,zip_code`.
///
/// Rows that cannot be parsed are logged and skipped. Returned records are
/// lower-cased and carry no id yet.
pub fn read_batch_csv(csv_path: &Path) -> Result<Vec<CustomerRecord>> {
    let mut reader = csv::ReaderBuilder::new()
        .trim(csv::Trim::All)
        .flexible(true)
        .from_path(csv_path)
        .with_context(|| format!("Failed to open CSV file: {}", csv_path.display()))?;

    let headers = reader
        .headers()
        .context("Failed to read CSV headers")?
        .clone();
    for required in ["first_name", "last_name", "street"] {
        if !headers.iter().any(|h| h == required) {
            return Err(MatchError::Input(format!(
                "{} is missing the '{}' column",
                csv_path.display(),
                required
            ))
            .into());
        }
    }

    let mut records = Vec::new();
    let mut skipped = 0usize;
    for (idx, result) in reader.deserialize::<MatchRequest>().enumerate() {
        match result {
            Ok(request) => records.push(request.into_record()),
            Err(e) => {
                skipped += 1;
                warn!("Skipping row {}: {}", idx + 1, e);
            }
        }
    }
    info!(
        "Read {} records from {} ({} rows skipped)",
        records.len(),
        csv_path.display(),
        skipped
    );
    Ok(records)
}
