// src/models/matching.rs
use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::models::core::{BlockingKey, CustomerId, CustomerRecord, FieldType, RunId};
use crate::models::stats_models::RunReport;

/// Token weights of one record keyed by (field, token).
pub type TokenMap = HashMap<(FieldType, String), f64>;

/// Fields of an incoming record before it is assigned an id.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MatchRequest {
    pub first_name: String,
    pub last_name: String,
    #[serde(default)]
    pub phone_number: String,
    pub street: String,
    #[serde(default)]
    pub city: String,
    #[serde(default)]
    pub state: String,
    #[serde(default)]
    pub zip_code: String,
}

impl MatchRequest {
    pub fn into_record(self) -> CustomerRecord {
        CustomerRecord {
            customer_id: 0,
            first_name: self.first_name,
            last_name: self.last_name,
            phone_number: self.phone_number,
            street: self.street,
            city: self.city,
            state: self.state,
            zip_code: self.zip_code,
        }
        .lowercased()
    }
}

/// Output of the keying stage for one record.
#[derive(Debug, Clone, PartialEq)]
pub struct KeyedRecord {
    pub customer_id: CustomerId,
    pub key: BlockingKey,
}

/// Everything retrieval and scoring need about the query side.
#[derive(Debug, Clone, Default)]
pub struct QueryContext {
    pub record: CustomerRecord,
    pub key: Option<BlockingKey>,
    pub tokens: TokenMap,
    pub embedding: Option<Vec<f32>>,
}

/// A baseline record returned by retrieval, before scoring.
#[derive(Debug, Clone, Default)]
pub struct CandidateRecord {
    pub record: CustomerRecord,
    pub key: Option<BlockingKey>,
    pub tokens: TokenMap,
    /// Embedding distance reported by the store, lower is closer.
    pub vector_distance: Option<f64>,
}

/// Individual similarity signals of one pairing.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct MatchSignals {
    pub bin_key_match: u8,
    pub tfidf_score: f64,
    pub first_name: f64,
    pub last_name: f64,
    pub street: f64,
    pub city: f64,
    pub phone: f64,
    pub zip: f64,
    pub vector_distance: Option<f64>,
}

/// A scored pairing of the query record with one baseline record.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Candidate {
    pub customer_id: CustomerId,
    pub first_name: String,
    pub last_name: String,
    pub street: String,
    pub city: String,
    pub zip_code: String,
    pub phone_number: String,
    pub signals: MatchSignals,
    pub score: f64,
}

/// Ranked candidates of one query record.
#[derive(Debug, Clone, Serialize)]
pub struct RecordMatches {
    pub customer_id: CustomerId,
    pub candidates: Vec<Candidate>,
}

/// Result of matching an uploaded batch against the baseline.
#[derive(Debug, Clone, Serialize)]
pub struct BatchOutcome {
    pub run: RunReport,
    /// Records that could not be matched, with the reason.
    pub skipped: Vec<(CustomerId, String)>,
    pub matches: Vec<RecordMatches>,
}

/// Result of matching a single record.
#[derive(Debug, Clone, Serialize)]
pub struct SingleOutcome {
    pub run_id: RunId,
    pub customer_id: CustomerId,
    pub uses_vectors: bool,
    pub candidates: Vec<Candidate>,
}
