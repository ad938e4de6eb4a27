// src/matching/test_support.rs
//! In-memory collaborators for tests.
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};

use anyhow::Result;
use async_trait::async_trait;

use crate::candidate_generation::candidate_generation::RetrievalConfig;
use crate::embedding::job::{EmbeddingJob, JobStatus, RunningJob};
use crate::error::MatchError;
use crate::matching::store::MatchStore;
use crate::matching::tfidf::{IdfTable, WeightMode};
use crate::models::core::{BlockingKey, CustomerId, CustomerRecord, FieldType, RunId, TokenWeight, BASELINE_RUN};
use crate::models::matching::{CandidateRecord, KeyedRecord, QueryContext, TokenMap};

#[derive(Default)]
struct State {
    reference: Vec<String>,
    runs: BTreeMap<RunId, String>,
    next_customer_id: CustomerId,
    records: BTreeMap<(RunId, CustomerId), CustomerRecord>,
    keys: HashMap<(RunId, CustomerId), BlockingKey>,
    tokens: HashMap<(RunId, CustomerId, FieldType, String), (WeightMode, f64)>,
    idf: HashMap<RunId, IdfTable>,
    embeddings: HashMap<(RunId, CustomerId), Vec<f32>>,
    fail_reads: bool,
    key_upserts: usize,
    fail_key_upsert_on: Option<usize>,
}

/// `MatchStore` backed by maps. Writes are keyed like the Postgres unique
/// constraints, so repeated upserts overwrite.
#[derive(Clone, Default)]
pub struct MemoryStore {
    state: Arc<Mutex<State>>,
}

fn cosine_distance(a: &[f32], b: &[f32]) -> Option<f64> {
    let dot: f64 = a.iter().zip(b).map(|(x, y)| *x as f64 * *y as f64).sum();
    let na: f64 = a.iter().map(|x| (*x as f64).powi(2)).sum::<f64>().sqrt();
    let nb: f64 = b.iter().map(|x| (*x as f64).powi(2)).sum::<f64>().sqrt();
    if na == 0.0 || nb == 0.0 {
        return None;
    }
    Some(1.0 - dot / (na * nb))
}

impl MemoryStore {
    pub fn with_reference<I, S>(entities: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let store = Self::default();
        store.lock().reference = entities.into_iter().map(Into::into).collect();
        store
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, State> {
        self.state.lock().unwrap()
    }

    pub fn fail_reads(&self, fail: bool) {
        self.lock().fail_reads = fail;
    }

    /// Makes the `n`th key upsert (1-based, counted from now) fail once.
    pub fn fail_key_upsert_on(&self, n: usize) {
        let mut state = self.lock();
        state.fail_key_upsert_on = Some(state.key_upserts + n);
    }

    /// Stores baseline records with their key and optional embedding.
    pub fn seed_baseline(&self, rows: Vec<(CustomerRecord, &str, Option<Vec<f32>>)>) {
        let mut state = self.lock();
        state.runs.entry(BASELINE_RUN).or_insert_with(|| "Default run".to_string());
        for (record, key, embedding) in rows {
            let id = record.customer_id;
            state.next_customer_id = state.next_customer_id.max(id);
            if let Ok(key) = BlockingKey::parse(key) {
                state.keys.insert((BASELINE_RUN, id), key);
            }
            if let Some(embedding) = embedding {
                state.embeddings.insert((BASELINE_RUN, id), embedding);
            }
            state.records.insert((BASELINE_RUN, id), record);
        }
    }

    pub fn set_embedding(&self, run_id: RunId, customer_id: CustomerId, embedding: Vec<f32>) {
        self.lock().embeddings.insert((run_id, customer_id), embedding);
    }

    pub fn key_rows(&self, run_id: RunId) -> usize {
        self.lock().keys.keys().filter(|(r, _)| *r == run_id).count()
    }

    pub fn token_rows(&self, run_id: RunId) -> usize {
        self.lock().tokens.keys().filter(|(r, ..)| *r == run_id).count()
    }

    pub fn keys_for(&self, run_id: RunId) -> HashMap<CustomerId, String> {
        self.lock()
            .keys
            .iter()
            .filter(|((r, _), _)| *r == run_id)
            .map(|((_, id), key)| (*id, key.as_str().to_string()))
            .collect()
    }

    pub fn idf_for(&self, run_id: RunId) -> Option<IdfTable> {
        self.lock().idf.get(&run_id).cloned()
    }

    fn token_map(state: &State, run_id: RunId, customer_id: CustomerId) -> TokenMap {
        state
            .tokens
            .iter()
            .filter(|((r, id, ..), _)| *r == run_id && *id == customer_id)
            .map(|((_, _, field, token), (_, weight))| ((*field, token.clone()), *weight))
            .collect()
    }

    fn check_reads(state: &State) -> Result<()> {
        if state.fail_reads {
            return Err(MatchError::storage("store unreachable").into());
        }
        Ok(())
    }
}

#[async_trait]
impl MatchStore for MemoryStore {
    async fn load_reference_entities(&self) -> Result<Vec<String>> {
        let state = self.lock();
        Self::check_reads(&state)?;
        let mut entities = state.reference.clone();
        entities.sort();
        Ok(entities)
    }

    async fn replace_reference_entities(&self, entities: &[String]) -> Result<usize> {
        self.lock().reference = entities.to_vec();
        Ok(entities.len())
    }

    async fn create_run(&self, description: &str) -> Result<RunId> {
        let mut state = self.lock();
        let next = state.runs.keys().next_back().map_or(1, |last| (*last + 1).max(1));
        state.runs.insert(next, description.to_string());
        Ok(next)
    }

    async fn ensure_baseline_run(&self) -> Result<()> {
        self.lock()
            .runs
            .entry(BASELINE_RUN)
            .or_insert_with(|| "Default run".to_string());
        Ok(())
    }

    async fn clear_run_outputs(&self, run_id: RunId) -> Result<()> {
        let mut state = self.lock();
        state.keys.retain(|(r, _), _| *r != run_id);
        state.tokens.retain(|(r, ..), _| *r != run_id);
        state.idf.remove(&run_id);
        state.embeddings.retain(|(r, _), _| *r != run_id);
        Ok(())
    }

    async fn fetch_run_records(&self, run_id: RunId) -> Result<Vec<CustomerRecord>> {
        let state = self.lock();
        Self::check_reads(&state)?;
        Ok(state
            .records
            .iter()
            .filter(|((r, _), _)| *r == run_id)
            .map(|(_, record)| record.clone())
            .collect())
    }

    async fn insert_records(&self, run_id: RunId, records: &[CustomerRecord]) -> Result<Vec<CustomerId>> {
        let mut state = self.lock();
        let mut ids = Vec::with_capacity(records.len());
        for record in records {
            state.next_customer_id += 1;
            let id = state.next_customer_id;
            let mut stored = record.clone().lowercased();
            stored.customer_id = id;
            state.records.insert((run_id, id), stored);
            ids.push(id);
        }
        Ok(ids)
    }

    async fn upsert_keys(&self, run_id: RunId, batch: &[KeyedRecord]) -> Result<usize> {
        let mut state = self.lock();
        state.key_upserts += 1;
        if state.fail_key_upsert_on == Some(state.key_upserts) {
            state.fail_key_upsert_on = None;
            // half the batch lands before the failure, like a dropped connection
            for keyed in batch.iter().take(batch.len() / 2) {
                state.keys.insert((run_id, keyed.customer_id), keyed.key.clone());
            }
            return Err(MatchError::storage("connection lost during key upsert").into());
        }
        for keyed in batch {
            state.keys.insert((run_id, keyed.customer_id), keyed.key.clone());
        }
        Ok(batch.len())
    }

    async fn replace_idf(&self, run_id: RunId, table: &IdfTable) -> Result<usize> {
        self.lock().idf.insert(run_id, table.clone());
        Ok(table.values.len())
    }

    async fn load_idf(&self, run_id: RunId) -> Result<Option<IdfTable>> {
        let state = self.lock();
        Self::check_reads(&state)?;
        Ok(state.idf.get(&run_id).cloned())
    }

    async fn upsert_token_weights(&self, run_id: RunId, mode: WeightMode, batch: &[TokenWeight]) -> Result<usize> {
        let mut state = self.lock();
        for w in batch {
            state
                .tokens
                .insert((run_id, w.customer_id, w.field, w.token.clone()), (mode, w.weight));
        }
        Ok(batch.len())
    }

    async fn fetch_query_context(&self, run_id: RunId, customer_id: CustomerId) -> Result<QueryContext> {
        let state = self.lock();
        Self::check_reads(&state)?;
        let record = state
            .records
            .get(&(run_id, customer_id))
            .cloned()
            .ok_or_else(|| MatchError::Input(format!("customer {} not in run {}", customer_id, run_id)))?;
        Ok(QueryContext {
            record,
            key: state.keys.get(&(run_id, customer_id)).cloned(),
            tokens: Self::token_map(&state, run_id, customer_id),
            embedding: state.embeddings.get(&(run_id, customer_id)).cloned(),
        })
    }

    async fn fetch_candidates(
        &self,
        query: &QueryContext,
        retrieval: &RetrievalConfig,
        use_vectors: bool,
    ) -> Result<Vec<CandidateRecord>> {
        let state = self.lock();
        Self::check_reads(&state)?;
        let mut found = Vec::new();
        for ((run_id, id), record) in &state.records {
            if *run_id != BASELINE_RUN {
                continue;
            }
            let key = state.keys.get(&(BASELINE_RUN, *id)).cloned();
            let key_match = query.key.is_some() && key == query.key;
            let distance = match (&query.embedding, use_vectors) {
                (Some(q), true) => state
                    .embeddings
                    .get(&(BASELINE_RUN, *id))
                    .and_then(|e| cosine_distance(q, e)),
                _ => None,
            };
            let near = distance.is_some_and(|d| d < retrieval.max_vector_distance);
            if key_match || near {
                found.push(CandidateRecord {
                    record: record.clone(),
                    key,
                    tokens: Self::token_map(&state, BASELINE_RUN, *id),
                    vector_distance: distance,
                });
            }
        }
        found.truncate(retrieval.candidate_limit);
        Ok(found)
    }

    async fn run_customer_ids(&self, run_id: RunId) -> Result<Vec<CustomerId>> {
        let state = self.lock();
        Self::check_reads(&state)?;
        Ok(state
            .records
            .keys()
            .filter(|(r, _)| *r == run_id)
            .map(|(_, id)| *id)
            .collect())
    }
}

/// Embedding job that writes a fixed vector per record straight into a
/// `MemoryStore`, or fails when configured to.
pub struct FakeEmbeddingJob {
    store: MemoryStore,
    fail_with: Option<String>,
}

impl FakeEmbeddingJob {
    pub fn succeeding(store: MemoryStore) -> Self {
        Self { store, fail_with: None }
    }

    pub fn failing(store: MemoryStore, reason: &str) -> Self {
        Self {
            store,
            fail_with: Some(reason.to_string()),
        }
    }
}

struct FinishedJob(JobStatus);

#[async_trait]
impl RunningJob for FinishedJob {
    async fn poll(&mut self) -> Result<JobStatus> {
        Ok(self.0.clone())
    }

    async fn abort(&mut self) {}
}

#[async_trait]
impl EmbeddingJob for FakeEmbeddingJob {
    async fn submit(&self, run_id: RunId) -> Result<Box<dyn RunningJob>> {
        if let Some(reason) = &self.fail_with {
            return Ok(Box::new(FinishedJob(JobStatus::Failed(reason.clone()))));
        }
        let ids = self.store.run_customer_ids(run_id).await?;
        for id in ids {
            let record = self
                .store
                .fetch_query_context(run_id, id)
                .await?
                .record;
            // records on the same street land on the same vector
            let seed = record.street.len() as f32;
            self.store.set_embedding(run_id, id, vec![1.0, seed / 100.0]);
        }
        Ok(Box::new(FinishedJob(JobStatus::Succeeded)))
    }
}
