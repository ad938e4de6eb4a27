// src/candidate_generation/candidate_generation.rs

use anyhow::{Context, Result};
use log::{debug, warn};
use pgvector::Vector;
use postgres_types::ToSql;
use tokio_postgres::Row;

use crate::error::MatchError;
use crate::matching::db::load_token_maps;
use crate::matching::store::MatchStore;
use crate::models::core::{BlockingKey, CustomerRecord, BASELINE_RUN};
use crate::models::matching::{CandidateRecord, QueryContext};
use crate::utils::db_connect::PgPool;

/// How candidates are pulled from the baseline population.
#[derive(Debug, Clone, PartialEq)]
pub struct RetrievalConfig {
    /// Ranked candidates returned per query.
    pub top_n: usize,
    /// Baseline rows fetched per query before scoring.
    pub candidate_limit: usize,
    /// Embedding distance below which a record is a candidate without a key match.
    pub max_vector_distance: f64,
    pub use_vectors: bool,
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            top_n: 10,
            candidate_limit: 100,
            max_vector_distance: 0.8,
            use_vectors: true,
        }
    }
}

/// Baseline candidates for one query record.
///
/// `use_vectors` is the run level decision (embeddings present and enabled);
/// without a key or an embedding there is nothing to join on and the result
/// is empty.
pub async fn retrieve_candidates(
    store: &dyn MatchStore,
    query: &QueryContext,
    retrieval: &RetrievalConfig,
    use_vectors: bool,
) -> Result<Vec<CandidateRecord>> {
    let vectors = use_vectors && retrieval.use_vectors && query.embedding.is_some();
    if query.key.is_none() && !vectors {
        warn!(
            "Customer {} has neither a blocking key nor an embedding, no candidates",
            query.record.customer_id
        );
        return Ok(Vec::new());
    }

    let mut candidates = store
        .fetch_candidates(query, retrieval, vectors)
        .await
        .with_context(|| format!("Failed to retrieve candidates for customer {}", query.record.customer_id))?;
    candidates.retain(|c| c.record.customer_id != query.record.customer_id);
    candidates.truncate(retrieval.candidate_limit);
    debug!(
        "Customer {}: {} candidates (vectors: {})",
        query.record.customer_id,
        candidates.len(),
        vectors
    );
    Ok(candidates)
}

const CANDIDATE_COLUMNS: &str = "
    c.customer_id, c.first_name, c.last_name, c.phone_number,
    c.street, c.city, c.state, c.zip_code, k.binary_key";

fn row_to_candidate(row: &Row) -> Result<CandidateRecord> {
    let key: Option<String> = row.try_get("binary_key").context("Missing binary_key column")?;
    let record = CustomerRecord {
        customer_id: row.try_get("customer_id")?,
        first_name: row.try_get::<_, Option<String>>("first_name")?.unwrap_or_default(),
        last_name: row.try_get::<_, Option<String>>("last_name")?.unwrap_or_default(),
        phone_number: row.try_get::<_, Option<String>>("phone_number")?.unwrap_or_default(),
        street: row.try_get::<_, Option<String>>("street")?.unwrap_or_default(),
        city: row.try_get::<_, Option<String>>("city")?.unwrap_or_default(),
        state: row.try_get::<_, Option<String>>("state")?.unwrap_or_default(),
        zip_code: row.try_get::<_, Option<String>>("zip_code")?.unwrap_or_default(),
    };
    Ok(CandidateRecord {
        key: key.as_deref().and_then(|k| BlockingKey::parse(k).ok()),
        record,
        tokens: Default::default(),
        vector_distance: row.try_get("distance")?,
    })
}

/// Postgres side of retrieval: joins the query against run 0 on key equality
/// and, when requested, on embedding distance.
pub async fn fetch_baseline_candidates(
    pool: &PgPool,
    query: &QueryContext,
    retrieval: &RetrievalConfig,
    use_vectors: bool,
) -> Result<Vec<CandidateRecord>> {
    let conn = pool
        .get()
        .await
        .context(MatchError::storage("Failed to get DB connection for candidate retrieval"))?;

    let key = query.key.as_ref().map(|k| k.as_str().to_string());
    let limit = retrieval.candidate_limit as i64;
    let baseline = BASELINE_RUN;

    let rows = match (&query.embedding, use_vectors) {
        (Some(embedding), true) => {
            let sql = format!(
                "SELECT {cols}, (cv.vector_embedding <=> $2)::float8 AS distance
                 FROM customer_matching c
                 LEFT JOIN customer_keys k ON k.customer_id = c.customer_id AND k.run_id = $5
                 LEFT JOIN customer_vector_embedding cv ON cv.customer_id = c.customer_id AND cv.run_id = $5
                 WHERE c.run_id = $5
                   AND (k.binary_key = $1 OR (cv.vector_embedding <=> $2) < $3)
                 ORDER BY (k.binary_key = $1) DESC NULLS LAST, distance ASC NULLS LAST, c.customer_id
                 LIMIT $4",
                cols = CANDIDATE_COLUMNS
            );
            let vector = Vector::from(embedding.clone());
            let params: [&(dyn ToSql + Sync); 5] =
                [&key, &vector, &retrieval.max_vector_distance, &limit, &baseline];
            conn.query(sql.as_str(), &params)
                .await
                .context(MatchError::storage("Candidate query with vectors failed"))?
        }
        _ => {
            let sql = format!(
                "SELECT {cols}, NULL::float8 AS distance
                 FROM customer_matching c
                 JOIN customer_keys k ON k.customer_id = c.customer_id AND k.run_id = $3
                 WHERE c.run_id = $3 AND k.binary_key = $1
                 ORDER BY c.customer_id
                 LIMIT $2",
                cols = CANDIDATE_COLUMNS
            );
            let params: [&(dyn ToSql + Sync); 3] = [&key, &limit, &baseline];
            conn.query(sql.as_str(), &params)
                .await
                .context(MatchError::storage("Key-only candidate query failed"))?
        }
    };
    drop(conn);

    let mut candidates = rows.iter().map(row_to_candidate).collect::<Result<Vec<_>>>()?;
    if candidates.is_empty() {
        return Ok(candidates);
    }

    let ids: Vec<i32> = candidates.iter().map(|c| c.record.customer_id).collect();
    let mut token_maps = load_token_maps(pool, BASELINE_RUN, &ids).await?;
    for candidate in &mut candidates {
        if let Some(tokens) = token_maps.remove(&candidate.record.customer_id) {
            candidate.tokens = tokens;
        }
    }
    Ok(candidates)
}
