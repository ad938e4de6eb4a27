// src/matching/store.rs
use anyhow::Result;
use async_trait::async_trait;

use crate::candidate_generation::candidate_generation::RetrievalConfig;
use crate::matching::tfidf::{IdfTable, WeightMode};
use crate::models::core::{CustomerId, CustomerRecord, RunId, TokenWeight};
use crate::models::matching::{CandidateRecord, KeyedRecord, QueryContext};

/// The relational storage collaborator.
///
/// Every write is keyed by (record id, run id) so re-running a failed batch
/// overwrites rows instead of duplicating them. Failures carry
/// [`MatchError::Storage`](crate::error::MatchError::Storage) in their chain.
#[async_trait]
pub trait MatchStore: Send + Sync {
    /// Reference entities in canonical (sorted) order.
    async fn load_reference_entities(&self) -> Result<Vec<String>>;

    /// Replaces the whole reference corpus in one transaction.
    async fn replace_reference_entities(&self, entities: &[String]) -> Result<usize>;

    async fn create_run(&self, description: &str) -> Result<RunId>;

    async fn ensure_baseline_run(&self) -> Result<()>;

    /// Drops keys, tokens, idf rows and embeddings previously derived for the run.
    async fn clear_run_outputs(&self, run_id: RunId) -> Result<()>;

    async fn fetch_run_records(&self, run_id: RunId) -> Result<Vec<CustomerRecord>>;

    /// Stores input rows for a run, returning their assigned ids in input order.
    async fn insert_records(&self, run_id: RunId, records: &[CustomerRecord]) -> Result<Vec<CustomerId>>;

    async fn upsert_keys(&self, run_id: RunId, batch: &[KeyedRecord]) -> Result<usize>;

    /// Replaces the run's persisted idf table.
    async fn replace_idf(&self, run_id: RunId, table: &IdfTable) -> Result<usize>;

    /// The persisted idf table of a run, `None` when nothing was stored.
    async fn load_idf(&self, run_id: RunId) -> Result<Option<IdfTable>>;

    async fn upsert_token_weights(
        &self,
        run_id: RunId,
        mode: WeightMode,
        batch: &[TokenWeight],
    ) -> Result<usize>;

    async fn fetch_query_context(&self, run_id: RunId, customer_id: CustomerId) -> Result<QueryContext>;

    /// Baseline records sharing the query key, or within the vector distance
    /// bound when `use_vectors` is set and the query carries an embedding.
    async fn fetch_candidates(
        &self,
        query: &QueryContext,
        retrieval: &RetrievalConfig,
        use_vectors: bool,
    ) -> Result<Vec<CandidateRecord>>;

    async fn run_customer_ids(&self, run_id: RunId) -> Result<Vec<CustomerId>>;
}
