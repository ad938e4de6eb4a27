// src/matching/reference_corpus.rs
use std::collections::HashMap;
use std::sync::Arc;

use anyhow::{Context, Result};
use log::info;

use crate::error::MatchError;
use crate::matching::normalize::normalize;
use crate::matching::store::MatchStore;
use crate::models::core::{CustomerRecord, BASELINE_RUN};

/// Width of a blocking key, and so the default corpus size.
pub const DEFAULT_REFERENCE_SIZE: usize = 10;

/// Representative normalized strings that blocking keys are measured against.
///
/// Entries are held in canonical order (sorted, deduplicated) so bit `i` of a
/// key always refers to the same entity regardless of how the backing read
/// returned them. Cloning shares the underlying list.
#[derive(Debug, Clone, Default)]
pub struct ReferenceCorpus {
    entities: Arc<Vec<String>>,
}

impl ReferenceCorpus {
    pub fn new<I, S>(entities: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut normalized: Vec<String> = entities
            .into_iter()
            .map(|e| normalize(e.as_ref()))
            .filter(|e| !e.is_empty())
            .collect();
        normalized.sort();
        normalized.dedup();
        Self {
            entities: Arc::new(normalized),
        }
    }

    /// Loads the corpus once per process. An unreachable store or an empty
    /// table is a configuration error: keys cannot be computed without it.
    pub async fn load(store: &dyn MatchStore) -> Result<Self> {
        let raw = store
            .load_reference_entities()
            .await
            .context(MatchError::Configuration(
                "reference corpus could not be loaded".to_string(),
            ))?;
        let corpus = Self::new(raw);
        if corpus.is_empty() {
            return Err(MatchError::Configuration(
                "reference_entities is empty".to_string(),
            )
            .into());
        }
        info!("Loaded reference corpus with {} entities", corpus.len());
        Ok(corpus)
    }

    /// Derives the corpus from the baseline population and replaces the
    /// stored one with it.
    pub async fn rebuild(store: &dyn MatchStore, size: usize) -> Result<Self> {
        if size == 0 {
            return Err(MatchError::Configuration("reference corpus size must be positive".to_string()).into());
        }
        let records = store
            .fetch_run_records(BASELINE_RUN)
            .await
            .context("Failed to load baseline records for the reference corpus")?;
        let selected = select_reference_streets(&records, size);
        if selected.is_empty() {
            return Err(MatchError::Configuration(format!(
                "none of the {} baseline records has a usable street",
                records.len()
            ))
            .into());
        }
        let written = store
            .replace_reference_entities(&selected)
            .await
            .context("Failed to store the reference corpus")?;
        info!(
            "Rebuilt reference corpus: {} entities from {} baseline records",
            written,
            records.len()
        );
        Ok(Self::new(selected))
    }

    pub fn entities(&self) -> &[String] {
        &self.entities
    }

    pub fn len(&self) -> usize {
        self.entities.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entities.is_empty()
    }
}

/// The `size` most frequent distinct normalized streets, ties broken by
/// value so the selection does not depend on record order.
pub fn select_reference_streets(records: &[CustomerRecord], size: usize) -> Vec<String> {
    let mut counts: HashMap<String, usize> = HashMap::new();
    for record in records {
        let street = normalize(&record.street);
        if !street.is_empty() {
            *counts.entry(street).or_insert(0) += 1;
        }
    }
    let mut ranked: Vec<(String, usize)> = counts.into_iter().collect();
    ranked.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
    ranked.into_iter().take(size).map(|(street, _)| street).collect()
}
