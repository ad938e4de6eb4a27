// src/matching/db.rs
use std::collections::HashMap;

use anyhow::{Context, Result};
use async_trait::async_trait;
use log::{debug, info};
use pgvector::Vector;
use postgres_types::ToSql;

use crate::candidate_generation::candidate_generation::{fetch_baseline_candidates, RetrievalConfig};
use crate::error::MatchError;
use crate::matching::store::MatchStore;
use crate::matching::tfidf::{IdfTable, WeightMode};
use crate::models::core::{
    BlockingKey, CustomerId, CustomerRecord, FieldType, RunId, TokenWeight, BASELINE_RUN,
};
use crate::models::matching::{CandidateRecord, KeyedRecord, QueryContext, TokenMap};
use crate::utils::db_connect::PgPool;
use crate::utils::instantiate_run::BASELINE_RUN_DESCRIPTION;

// Process in chunks to stay well below the bind parameter limit
const CHUNK_SIZE: usize = 1000;

const RECORD_COLUMNS: &str =
    "customer_id, first_name, last_name, phone_number, street, city, state, zip_code";

fn row_to_record(row: &tokio_postgres::Row) -> Result<CustomerRecord> {
    let text = |col: &str| -> Result<String> {
        Ok(row
            .try_get::<_, Option<String>>(col)
            .with_context(|| format!("Failed to read column {}", col))?
            .unwrap_or_default())
    };
    Ok(CustomerRecord {
        customer_id: row.try_get("customer_id")?,
        first_name: text("first_name")?,
        last_name: text("last_name")?,
        phone_number: text("phone_number")?,
        street: text("street")?,
        city: text("city")?,
        state: text("state")?,
        zip_code: text("zip_code")?,
    })
}

/// Token weights of `ids` in `run_id`, grouped per customer.
pub async fn load_token_maps(
    pool: &PgPool,
    run_id: RunId,
    ids: &[CustomerId],
) -> Result<HashMap<CustomerId, TokenMap>> {
    if ids.is_empty() {
        return Ok(HashMap::new());
    }
    let conn = pool
        .get()
        .await
        .context(MatchError::storage("Failed to get DB connection for token lookup"))?;
    let ids_vec: Vec<i32> = ids.to_vec();
    let rows = conn
        .query(
            "SELECT customer_id, entity_type_id, ngram_token,
                    COALESCE(ngram_tfidf, ngram_frequency, 0)::float8 AS weight
             FROM customer_tokens
             WHERE run_id = $1 AND customer_id = ANY($2)",
            &[&run_id, &ids_vec],
        )
        .await
        .context(MatchError::storage("Failed to query customer_tokens"))?;

    let mut maps: HashMap<CustomerId, TokenMap> = HashMap::new();
    for row in rows {
        let customer_id: i32 = row.get("customer_id");
        let entity_type_id: i32 = row.get("entity_type_id");
        let Some(field) = FieldType::from_entity_type_id(entity_type_id) else {
            continue;
        };
        maps.entry(customer_id)
            .or_default()
            .insert((field, row.get("ngram_token")), row.get("weight"));
    }
    Ok(maps)
}

/// `MatchStore` over the Postgres schema.
#[derive(Clone)]
pub struct PgMatchStore {
    pool: PgPool,
}

impl PgMatchStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl MatchStore for PgMatchStore {
    async fn load_reference_entities(&self) -> Result<Vec<String>> {
        let conn = self
            .pool
            .get()
            .await
            .context(MatchError::storage("Failed to get DB connection for reference entities"))?;
        let rows = conn
            .query(
                "SELECT DISTINCT entity_value FROM reference_entities
                 WHERE entity_value IS NOT NULL ORDER BY entity_value",
                &[],
            )
            .await
            .context(MatchError::storage("Failed to query reference_entities"))?;
        Ok(rows.iter().map(|r| r.get::<_, String>("entity_value")).collect())
    }

    async fn replace_reference_entities(&self, entities: &[String]) -> Result<usize> {
        let mut conn = self
            .pool
            .get()
            .await
            .context(MatchError::storage("Failed to get DB connection for reference entities"))?;
        let transaction = conn
            .transaction()
            .await
            .context(MatchError::storage("Failed to start transaction for reference entities"))?;

        transaction
            .execute("DELETE FROM reference_entities", &[])
            .await
            .context(MatchError::storage("Failed to clear reference_entities"))?;

        let mut written = 0usize;
        for chunk in entities.chunks(CHUNK_SIZE) {
            let mut params: Vec<&(dyn ToSql + Sync)> = Vec::with_capacity(chunk.len());
            let mut groups = Vec::with_capacity(chunk.len());
            for (i, entity) in chunk.iter().enumerate() {
                groups.push(format!("(${})", i + 1));
                params.push(entity);
            }
            let query = format!(
                "INSERT INTO reference_entities (entity_value) VALUES {}",
                groups.join(", ")
            );
            written += transaction
                .execute(query.as_str(), &params)
                .await
                .context(MatchError::storage("Failed to insert reference_entities"))? as usize;
        }

        transaction
            .commit()
            .await
            .context(MatchError::storage("Failed to commit reference entities"))?;
        info!("Stored {} reference entities", written);
        Ok(written)
    }

    async fn create_run(&self, description: &str) -> Result<RunId> {
        let conn = self
            .pool
            .get()
            .await
            .context(MatchError::storage("Failed to get DB connection for create_run"))?;
        let row = conn
            .query_one(
                "INSERT INTO runs (description) VALUES ($1) RETURNING run_id",
                &[&description],
            )
            .await
            .context(MatchError::storage("Failed to insert run"))?;
        Ok(row.get("run_id"))
    }

    async fn ensure_baseline_run(&self) -> Result<()> {
        let conn = self
            .pool
            .get()
            .await
            .context(MatchError::storage("Failed to get DB connection for baseline run"))?;
        conn.execute(
            "INSERT INTO runs (run_id, description) VALUES ($1, $2)
             ON CONFLICT (run_id) DO NOTHING",
            &[&BASELINE_RUN, &BASELINE_RUN_DESCRIPTION],
        )
        .await
        .context(MatchError::storage("Failed to ensure baseline run"))?;
        Ok(())
    }

    async fn clear_run_outputs(&self, run_id: RunId) -> Result<()> {
        let mut conn = self
            .pool
            .get()
            .await
            .context(MatchError::storage("Failed to get DB connection for clear_run_outputs"))?;
        let transaction = conn
            .transaction()
            .await
            .context(MatchError::storage("Failed to start transaction for clear_run_outputs"))?;
        for table in [
            "customer_keys",
            "customer_tokens",
            "tokens_idf",
            "customer_vector_embedding",
        ] {
            let deleted = transaction
                .execute(format!("DELETE FROM {} WHERE run_id = $1", table).as_str(), &[&run_id])
                .await
                .context(MatchError::storage(format!("Failed to clear {} for run {}", table, run_id)))?;
            debug!("Cleared {} rows from {} for run {}", deleted, table, run_id);
        }
        transaction
            .commit()
            .await
            .context(MatchError::storage("Failed to commit clear_run_outputs"))?;
        Ok(())
    }

    async fn fetch_run_records(&self, run_id: RunId) -> Result<Vec<CustomerRecord>> {
        let conn = self
            .pool
            .get()
            .await
            .context(MatchError::storage("Failed to get DB connection for run records"))?;
        let rows = conn
            .query(
                format!(
                    "SELECT {} FROM customer_matching WHERE run_id = $1 ORDER BY customer_id",
                    RECORD_COLUMNS
                )
                .as_str(),
                &[&run_id],
            )
            .await
            .context(MatchError::storage("Failed to query customer_matching"))?;
        rows.iter().map(row_to_record).collect()
    }

    async fn insert_records(&self, run_id: RunId, records: &[CustomerRecord]) -> Result<Vec<CustomerId>> {
        if records.is_empty() {
            return Ok(Vec::new());
        }
        let mut conn = self
            .pool
            .get()
            .await
            .context(MatchError::storage("Failed to get DB connection for insert_records"))?;
        let transaction = conn
            .transaction()
            .await
            .context(MatchError::storage("Failed to start transaction for insert_records"))?;

        let mut ids = Vec::with_capacity(records.len());
        // 8 parameters per row
        for chunk in records.chunks(CHUNK_SIZE / 2) {
            let mut query = String::from(
                "INSERT INTO customer_matching
                    (first_name, last_name, phone_number, street, city, state, zip_code, run_id)
                 VALUES ",
            );
            let mut params: Vec<&(dyn ToSql + Sync)> = Vec::with_capacity(chunk.len() * 8);
            let mut groups = Vec::with_capacity(chunk.len());
            for (i, record) in chunk.iter().enumerate() {
                let base = i * 8;
                groups.push(format!(
                    "(${}, ${}, ${}, ${}, ${}, ${}, ${}, ${})",
                    base + 1,
                    base + 2,
                    base + 3,
                    base + 4,
                    base + 5,
                    base + 6,
                    base + 7,
                    base + 8
                ));
                params.push(&record.first_name);
                params.push(&record.last_name);
                params.push(&record.phone_number);
                params.push(&record.street);
                params.push(&record.city);
                params.push(&record.state);
                params.push(&record.zip_code);
                params.push(&run_id);
            }
            query.push_str(&groups.join(", "));
            query.push_str(" RETURNING customer_id");

            let rows = transaction
                .query(query.as_str(), &params)
                .await
                .context(MatchError::storage("Failed to insert customer_matching rows"))?;
            ids.extend(rows.iter().map(|r| r.get::<_, i32>("customer_id")));
        }

        transaction
            .commit()
            .await
            .context(MatchError::storage("Failed to commit insert_records"))?;
        info!("Inserted {} records into run {}", ids.len(), run_id);
        Ok(ids)
    }

    async fn upsert_keys(&self, run_id: RunId, batch: &[KeyedRecord]) -> Result<usize> {
        if batch.is_empty() {
            return Ok(0);
        }
        let mut conn = self
            .pool
            .get()
            .await
            .context(MatchError::storage("Failed to get DB connection for upsert_keys"))?;
        let transaction = conn
            .transaction()
            .await
            .context(MatchError::storage("Failed to start transaction for upsert_keys"))?;

        let mut written = 0usize;
        for chunk in batch.chunks(CHUNK_SIZE) {
            let keys: Vec<&str> = chunk.iter().map(|k| k.key.as_str()).collect();
            let mut params: Vec<&(dyn ToSql + Sync)> = Vec::with_capacity(chunk.len() * 3);
            let mut groups = Vec::with_capacity(chunk.len());
            for (i, item) in chunk.iter().enumerate() {
                let base = i * 3;
                groups.push(format!("(${}, ${}, ${})", base + 1, base + 2, base + 3));
                params.push(&item.customer_id);
                params.push(&keys[i]);
                params.push(&run_id);
            }
            let query = format!(
                "INSERT INTO customer_keys (customer_id, binary_key, run_id) VALUES {}
                 ON CONFLICT (customer_id, run_id) DO UPDATE SET binary_key = EXCLUDED.binary_key",
                groups.join(", ")
            );
            written += transaction
                .execute(query.as_str(), &params)
                .await
                .context(MatchError::storage("Failed to upsert customer_keys"))? as usize;
        }

        transaction
            .commit()
            .await
            .context(MatchError::storage("Failed to commit upsert_keys"))?;
        Ok(written)
    }

    async fn replace_idf(&self, run_id: RunId, table: &IdfTable) -> Result<usize> {
        let mut conn = self
            .pool
            .get()
            .await
            .context(MatchError::storage("Failed to get DB connection for replace_idf"))?;
        let transaction = conn
            .transaction()
            .await
            .context(MatchError::storage("Failed to start transaction for replace_idf"))?;

        transaction
            .execute("DELETE FROM tokens_idf WHERE run_id = $1", &[&run_id])
            .await
            .context(MatchError::storage("Failed to clear tokens_idf"))?;

        let entries: Vec<(i32, &str, f64)> = table
            .values
            .iter()
            .map(|((field, token), idf)| (field.entity_type_id(), token.as_str(), *idf))
            .collect();

        let mut written = 0usize;
        for chunk in entries.chunks(CHUNK_SIZE) {
            let mut params: Vec<&(dyn ToSql + Sync)> = Vec::with_capacity(chunk.len() * 4);
            let mut groups = Vec::with_capacity(chunk.len());
            for (i, (entity_type_id, token, idf)) in chunk.iter().enumerate() {
                let base = i * 4;
                groups.push(format!("(${}, ${}, ${}, ${})", base + 1, base + 2, base + 3, base + 4));
                params.push(entity_type_id);
                params.push(token);
                params.push(idf);
                params.push(&run_id);
            }
            let query = format!(
                "INSERT INTO tokens_idf (entity_type_id, ngram_token, ngram_idf, run_id) VALUES {}",
                groups.join(", ")
            );
            written += transaction
                .execute(query.as_str(), &params)
                .await
                .context(MatchError::storage("Failed to insert tokens_idf"))? as usize;
        }

        transaction
            .commit()
            .await
            .context(MatchError::storage("Failed to commit replace_idf"))?;
        info!("Stored {} idf entries for run {}", written, run_id);
        Ok(written)
    }

    async fn load_idf(&self, run_id: RunId) -> Result<Option<IdfTable>> {
        let conn = self
            .pool
            .get()
            .await
            .context(MatchError::storage("Failed to get DB connection for load_idf"))?;
        let rows = conn
            .query(
                "SELECT entity_type_id, ngram_token, ngram_idf::float8 AS ngram_idf
                 FROM tokens_idf WHERE run_id = $1",
                &[&run_id],
            )
            .await
            .context(MatchError::storage("Failed to query tokens_idf"))?;
        if rows.is_empty() {
            return Ok(None);
        }
        let documents: i64 = conn
            .query_one(
                "SELECT COUNT(*) AS documents FROM customer_matching WHERE run_id = $1",
                &[&run_id],
            )
            .await
            .context(MatchError::storage("Failed to count run records"))?
            .get("documents");

        let mut table = IdfTable {
            values: HashMap::with_capacity(rows.len()),
            documents: documents.max(0) as usize,
        };
        for row in rows {
            if let Some(field) = FieldType::from_entity_type_id(row.get("entity_type_id")) {
                table.values.insert((field, row.get("ngram_token")), row.get("ngram_idf"));
            }
        }
        Ok(Some(table))
    }

    async fn upsert_token_weights(
        &self,
        run_id: RunId,
        mode: WeightMode,
        batch: &[TokenWeight],
    ) -> Result<usize> {
        if batch.is_empty() {
            return Ok(0);
        }
        let mut conn = self
            .pool
            .get()
            .await
            .context(MatchError::storage("Failed to get DB connection for token weights"))?;
        let transaction = conn
            .transaction()
            .await
            .context(MatchError::storage("Failed to start transaction for token weights"))?;

        let column = mode.column();
        let mut written = 0usize;
        for chunk in batch.chunks(CHUNK_SIZE) {
            let type_ids: Vec<i32> = chunk.iter().map(|w| w.field.entity_type_id()).collect();
            let mut params: Vec<&(dyn ToSql + Sync)> = Vec::with_capacity(chunk.len() * 5);
            let mut groups = Vec::with_capacity(chunk.len());
            for (i, weight) in chunk.iter().enumerate() {
                let base = i * 5;
                groups.push(format!(
                    "(${}, ${}, ${}, ${}, ${})",
                    base + 1,
                    base + 2,
                    base + 3,
                    base + 4,
                    base + 5
                ));
                params.push(&weight.customer_id);
                params.push(&type_ids[i]);
                params.push(&weight.token);
                params.push(&weight.weight);
                params.push(&run_id);
            }
            let query = format!(
                "INSERT INTO customer_tokens (customer_id, entity_type_id, ngram_token, {col}, run_id)
                 VALUES {values}
                 ON CONFLICT (customer_id, entity_type_id, ngram_token, run_id)
                 DO UPDATE SET {col} = EXCLUDED.{col}",
                col = column,
                values = groups.join(", ")
            );
            written += transaction
                .execute(query.as_str(), &params)
                .await
                .context(MatchError::storage("Failed to upsert customer_tokens"))? as usize;
        }

        transaction
            .commit()
            .await
            .context(MatchError::storage("Failed to commit token weights"))?;
        Ok(written)
    }

    async fn fetch_query_context(&self, run_id: RunId, customer_id: CustomerId) -> Result<QueryContext> {
        let conn = self
            .pool
            .get()
            .await
            .context(MatchError::storage("Failed to get DB connection for query context"))?;
        let row = conn
            .query_opt(
                format!(
                    "SELECT {}, k.binary_key
                     FROM customer_matching c
                     LEFT JOIN customer_keys k ON k.customer_id = c.customer_id AND k.run_id = c.run_id
                     WHERE c.customer_id = $1 AND c.run_id = $2",
                    RECORD_COLUMNS
                        .split(", ")
                        .map(|c| format!("c.{}", c))
                        .collect::<Vec<_>>()
                        .join(", ")
                )
                .as_str(),
                &[&customer_id, &run_id],
            )
            .await
            .context(MatchError::storage("Failed to query customer record"))?
            .ok_or_else(|| {
                MatchError::Input(format!("customer {} not found in run {}", customer_id, run_id))
            })?;
        let record = row_to_record(&row)?;
        let key = row
            .get::<_, Option<String>>("binary_key")
            .and_then(|k| BlockingKey::parse(&k).ok());

        let embedding = conn
            .query_opt(
                "SELECT vector_embedding FROM customer_vector_embedding
                 WHERE customer_id = $1 AND run_id = $2",
                &[&customer_id, &run_id],
            )
            .await
            .context(MatchError::storage("Failed to query customer_vector_embedding"))?
            .and_then(|r| r.get::<_, Option<Vector>>("vector_embedding"))
            .map(|v| v.to_vec());
        drop(conn);

        let tokens = load_token_maps(&self.pool, run_id, &[customer_id])
            .await?
            .remove(&customer_id)
            .unwrap_or_default();

        Ok(QueryContext {
            record,
            key,
            tokens,
            embedding,
        })
    }

    async fn fetch_candidates(
        &self,
        query: &QueryContext,
        retrieval: &RetrievalConfig,
        use_vectors: bool,
    ) -> Result<Vec<CandidateRecord>> {
        fetch_baseline_candidates(&self.pool, query, retrieval, use_vectors).await
    }

    async fn run_customer_ids(&self, run_id: RunId) -> Result<Vec<CustomerId>> {
        let conn = self
            .pool
            .get()
            .await
            .context(MatchError::storage("Failed to get DB connection for run ids"))?;
        let rows = conn
            .query(
                "SELECT customer_id FROM customer_matching WHERE run_id = $1 ORDER BY customer_id",
                &[&run_id],
            )
            .await
            .context(MatchError::storage("Failed to query run customer ids"))?;
        Ok(rows.iter().map(|r| r.get("customer_id")).collect())
    }
}
