// src/matching/tfidf.rs
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use anyhow::{Context, Result};
use log::{debug, warn};
use tokio::task::JoinSet;

use crate::error::MatchError;
use crate::matching::ngram::{ngrams, word_tokens};
use crate::matching::normalize::{normalize, normalize_name};
use crate::models::core::{CustomerRecord, FieldType, RunId, TokenWeight};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TokenGranularity {
    CharNgram(usize),
    Word,
}

impl TokenGranularity {
    pub fn tokenize(&self, text: &str) -> Vec<String> {
        match self {
            TokenGranularity::CharNgram(n) => ngrams(text, *n),
            TokenGranularity::Word => word_tokens(text),
        }
    }
}

impl fmt::Display for TokenGranularity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TokenGranularity::CharNgram(n) => write!(f, "ngram({})", n),
            TokenGranularity::Word => write!(f, "word"),
        }
    }
}

/// Which column a run's token weights land in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WeightMode {
    TfIdf,
    Frequency,
}

impl WeightMode {
    pub fn column(&self) -> &'static str {
        match self {
            WeightMode::TfIdf => "ngram_tfidf",
            WeightMode::Frequency => "ngram_frequency",
        }
    }
}

impl FromStr for WeightMode {
    type Err = MatchError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "tfidf" | "tf-idf" => Ok(WeightMode::TfIdf),
            "frequency" | "freq" => Ok(WeightMode::Frequency),
            other => Err(MatchError::Configuration(format!("unknown weight mode '{}'", other))),
        }
    }
}

/// Records whose document frequencies back a run's idf table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IdfPopulation {
    /// The baseline universe (run 0) only.
    Baseline,
    /// Baseline plus the records of the run being weighted.
    BaselinePlusRun,
    /// The run's own records only. Used for the baseline itself; query runs
    /// reject it since their weights would not share a table with run 0.
    RunOnly,
}

impl IdfPopulation {
    pub fn as_str(&self) -> &'static str {
        match self {
            IdfPopulation::Baseline => "baseline",
            IdfPopulation::BaselinePlusRun => "baseline_plus_run",
            IdfPopulation::RunOnly => "run",
        }
    }
}

impl FromStr for IdfPopulation {
    type Err = MatchError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "baseline" => Ok(IdfPopulation::Baseline),
            "baseline_plus_run" => Ok(IdfPopulation::BaselinePlusRun),
            "run" | "run_only" => Ok(IdfPopulation::RunOnly),
            other => Err(MatchError::Configuration(format!("unknown idf population '{}'", other))),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct TfIdfConfig {
    pub granularity: TokenGranularity,
    pub weight_mode: WeightMode,
    pub idf_population: IdfPopulation,
    /// Width of the document-frequency pass.
    pub workers: usize,
}

impl Default for TfIdfConfig {
    fn default() -> Self {
        Self {
            granularity: TokenGranularity::CharNgram(3),
            weight_mode: WeightMode::TfIdf,
            idf_population: IdfPopulation::Baseline,
            workers: num_cpus::get().clamp(10, 50),
        }
    }
}

/// Tokens of each weighted field of a record. Fields that normalize to
/// nothing yield no tokens.
pub fn record_tokens(record: &CustomerRecord, granularity: TokenGranularity) -> Vec<(FieldType, Vec<String>)> {
    let street = normalize(&record.street);
    let name = normalize_name(&record.full_name());
    vec![
        (FieldType::Street, granularity.tokenize(&street)),
        (FieldType::Name, granularity.tokenize(&name)),
    ]
}

/// Per-token document counts over a population of records.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DocumentFrequency {
    pub counts: HashMap<(FieldType, String), usize>,
    pub documents: usize,
}

impl DocumentFrequency {
    /// Counts each (field, token) at most once for the record.
    pub fn add_record(&mut self, record: &CustomerRecord, granularity: TokenGranularity) {
        self.documents += 1;
        let mut seen: HashSet<(FieldType, String)> = HashSet::new();
        for (field, tokens) in record_tokens(record, granularity) {
            for token in tokens {
                seen.insert((field, token));
            }
        }
        for key in seen {
            *self.counts.entry(key).or_insert(0) += 1;
        }
    }

    pub fn merge(&mut self, other: DocumentFrequency) {
        self.documents += other.documents;
        for (key, count) in other.counts {
            *self.counts.entry(key).or_insert(0) += count;
        }
    }
}

/// Document frequency over `records`, split across `workers` tasks that each
/// fill a local map; the maps are reduced once every task has finished.
pub async fn count_document_frequency(
    records: Arc<Vec<CustomerRecord>>,
    granularity: TokenGranularity,
    workers: usize,
) -> Result<DocumentFrequency> {
    if records.is_empty() {
        return Ok(DocumentFrequency::default());
    }
    let chunk_size = records.len().div_ceil(workers.max(1));
    let mut tasks = JoinSet::new();
    for start in (0..records.len()).step_by(chunk_size) {
        let records = Arc::clone(&records);
        tasks.spawn(async move {
            let end = (start + chunk_size).min(records.len());
            let mut local = DocumentFrequency::default();
            for record in &records[start..end] {
                local.add_record(record, granularity);
            }
            local
        });
    }

    let mut total = DocumentFrequency::default();
    while let Some(joined) = tasks.join_next().await {
        let local = joined.context("Document frequency task failed")?;
        total.merge(local);
    }
    debug!(
        "Document frequency: {} documents, {} distinct tokens",
        total.documents,
        total.counts.len()
    );
    Ok(total)
}

/// ln(total documents / document frequency) per (field, token).
#[derive(Debug, Clone, Default, PartialEq)]
pub struct IdfTable {
    pub values: HashMap<(FieldType, String), f64>,
    pub documents: usize,
}

impl IdfTable {
    pub fn from_frequency(df: &DocumentFrequency) -> Self {
        let mut values = HashMap::with_capacity(df.counts.len());
        if df.documents > 0 {
            let total = df.documents as f64;
            for (key, count) in &df.counts {
                if *count == 0 {
                    continue;
                }
                values.insert(key.clone(), (total / *count as f64).ln());
            }
        }
        Self {
            values,
            documents: df.documents,
        }
    }

    pub fn get(&self, field: FieldType, token: &str) -> Option<f64> {
        self.values.get(&(field, token.to_string())).copied()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

/// Weights for every token of one record.
///
/// In `TfIdf` mode a token absent from the idf table has no defined weight and
/// is skipped. In `Frequency` mode the weight is the raw count.
pub fn weigh_record(
    record: &CustomerRecord,
    config: &TfIdfConfig,
    idf: &IdfTable,
    run_id: RunId,
) -> Vec<TokenWeight> {
    let mut weights = Vec::new();
    for (field, tokens) in record_tokens(record, config.granularity) {
        if tokens.is_empty() {
            continue;
        }
        let total = tokens.len() as f64;
        let mut counts: HashMap<String, usize> = HashMap::new();
        for token in tokens {
            *counts.entry(token).or_insert(0) += 1;
        }
        let mut missing = 0usize;
        for (token, count) in counts {
            let weight = match config.weight_mode {
                WeightMode::Frequency => count as f64,
                WeightMode::TfIdf => match idf.get(field, &token) {
                    Some(idf_value) => (count as f64 / total) * idf_value,
                    None => {
                        missing += 1;
                        continue;
                    }
                },
            };
            weights.push(TokenWeight {
                customer_id: record.customer_id,
                field,
                token,
                weight,
                run_id,
            });
        }
        if missing > 0 {
            debug!(
                "Customer {}: {} {} tokens have no idf entry and were skipped",
                record.customer_id,
                missing,
                field.as_str()
            );
        }
    }
    if weights.is_empty() && config.weight_mode == WeightMode::TfIdf && !idf.is_empty() {
        warn!("Customer {} produced no weighted tokens", record.customer_id);
    }
    weights
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(id: i32, first: &str, last: &str, street: &str) -> CustomerRecord {
        CustomerRecord {
            customer_id: id,
            first_name: first.into(),
            last_name: last.into(),
            street: street.into(),
            ..Default::default()
        }
    }

    fn word_config() -> TfIdfConfig {
        TfIdfConfig {
            granularity: TokenGranularity::Word,
            weight_mode: WeightMode::TfIdf,
            idf_population: IdfPopulation::RunOnly,
            workers: 3,
        }
    }

    #[test]
    fn test_document_frequency_counts_once_per_record() {
        let mut df = DocumentFrequency::default();
        df.add_record(&record(1, "ann", "ann", "5 ann st"), TokenGranularity::Word);
        assert_eq!(df.documents, 1);
        assert_eq!(df.counts[&(FieldType::Name, "ann".to_string())], 1);
        // same token in different fields stays distinct
        assert_eq!(df.counts[&(FieldType::Street, "ann".to_string())], 1);
    }

    #[tokio::test]
    async fn test_parallel_count_matches_sequential() {
        let records: Vec<CustomerRecord> = (0..47)
            .map(|i| record(i, "pat", &format!("lee{}", i % 5), &format!("{} oak ave", i % 7)))
            .collect();
        let mut sequential = DocumentFrequency::default();
        for r in &records {
            sequential.add_record(r, TokenGranularity::CharNgram(3));
        }
        let parallel = count_document_frequency(Arc::new(records), TokenGranularity::CharNgram(3), 4)
            .await
            .unwrap();
        assert_eq!(parallel, sequential);
    }

    #[tokio::test]
    async fn test_empty_population() {
        let df = count_document_frequency(Arc::new(Vec::new()), TokenGranularity::Word, 4)
            .await
            .unwrap();
        assert_eq!(df.documents, 0);
        assert!(IdfTable::from_frequency(&df).is_empty());
    }

    #[test]
    fn test_idf_is_non_negative_and_zero_for_universal_tokens() {
        let mut df = DocumentFrequency::default();
        df.add_record(&record(1, "ann", "lee", "1 oak ave"), TokenGranularity::Word);
        df.add_record(&record(2, "bob", "lee", "2 oak st"), TokenGranularity::Word);
        df.add_record(&record(3, "cy", "lee", "3 elm st"), TokenGranularity::Word);
        let idf = IdfTable::from_frequency(&df);
        assert!(idf.values.values().all(|v| *v >= 0.0));
        assert_eq!(idf.get(FieldType::Name, "lee"), Some(0.0));
        let rare = idf.get(FieldType::Name, "ann").unwrap();
        assert!((rare - 3f64.ln()).abs() < 1e-12);
    }

    #[test]
    fn test_weights_are_tf_times_idf() {
        let mut df = DocumentFrequency::default();
        let a = record(1, "ann", "lee", "1 oak oak");
        df.add_record(&a, TokenGranularity::Word);
        df.add_record(&record(2, "bob", "lee", "2 elm st"), TokenGranularity::Word);
        let idf = IdfTable::from_frequency(&df);

        let weights = weigh_record(&a, &word_config(), &idf, 4);
        let oak = weights
            .iter()
            .find(|w| w.field == FieldType::Street && w.token == "oak")
            .unwrap();
        // tf = 2/3, idf = ln(2/1)
        assert!((oak.weight - (2.0 / 3.0) * 2f64.ln()).abs() < 1e-12);
        assert_eq!(oak.run_id, 4);
        let lee = weights.iter().find(|w| w.token == "lee").unwrap();
        assert_eq!(lee.weight, 0.0);
    }

    #[test]
    fn test_tokens_missing_from_idf_are_skipped() {
        let idf = IdfTable::default();
        let weights = weigh_record(&record(1, "ann", "lee", "1 oak ave"), &word_config(), &idf, 1);
        assert!(weights.is_empty());
    }

    #[test]
    fn test_frequency_mode_uses_raw_counts() {
        let config = TfIdfConfig {
            weight_mode: WeightMode::Frequency,
            ..word_config()
        };
        let weights = weigh_record(&record(1, "ann", "ann", "1 oak ave"), &config, &IdfTable::default(), 1);
        let ann = weights.iter().find(|w| w.field == FieldType::Name && w.token == "ann").unwrap();
        assert_eq!(ann.weight, 2.0);
    }

    #[test]
    fn test_mode_and_population_parse() {
        assert_eq!("TFIDF".parse::<WeightMode>().unwrap(), WeightMode::TfIdf);
        assert_eq!("baseline_plus_run".parse::<IdfPopulation>().unwrap(), IdfPopulation::BaselinePlusRun);
        assert!("sometimes".parse::<IdfPopulation>().is_err());
    }
}
