// src/matching/scorer.rs
use std::collections::HashSet;

use log::{debug, warn};

use crate::error::MatchError;
use crate::matching::ngram::similarity;
use crate::matching::normalize::{normalize_digits, normalize_name, NormalizedText};
use crate::models::matching::{Candidate, CandidateRecord, MatchSignals, QueryContext, TokenMap};

pub const MIN_SCORE: f64 = 1.0;
pub const MAX_SCORE: f64 = 100.0;

/// Linear weights of the composite score. With weights summing to 1.0 a
/// candidate that maxes every signal scores 100.
#[derive(Debug, Clone, PartialEq)]
pub struct ScoringWeights {
    pub vector: f64,
    pub tfidf: f64,
    pub first_name: f64,
    pub last_name: f64,
    pub street: f64,
    pub city: f64,
    pub phone: f64,
    pub zip: f64,
    pub key_match: f64,
    /// N-gram size of the field level similarities.
    pub field_ngram_size: usize,
}

impl Default for ScoringWeights {
    fn default() -> Self {
        Self {
            vector: 0.25,
            tfidf: 0.20,
            first_name: 0.10,
            last_name: 0.10,
            street: 0.15,
            city: 0.05,
            phone: 0.05,
            zip: 0.05,
            key_match: 0.05,
            field_ngram_size: 3,
        }
    }
}

impl ScoringWeights {
    pub fn total(&self) -> f64 {
        self.vector
            + self.tfidf
            + self.first_name
            + self.last_name
            + self.street
            + self.city
            + self.phone
            + self.zip
            + self.key_match
    }

    fn as_slice(&self) -> [f64; 9] {
        [
            self.vector,
            self.tfidf,
            self.first_name,
            self.last_name,
            self.street,
            self.city,
            self.phone,
            self.zip,
            self.key_match,
        ]
    }

    pub fn has_negative(&self) -> bool {
        self.as_slice().iter().any(|w| *w < 0.0 || w.is_nan())
    }
}

/// Sum over shared (field, token) pairs of the product of both weights.
pub fn tfidf_overlap(query: &TokenMap, candidate: &TokenMap) -> f64 {
    let (small, large) = if query.len() <= candidate.len() {
        (query, candidate)
    } else {
        (candidate, query)
    };
    small
        .iter()
        .filter_map(|(key, w)| large.get(key).map(|other| w * other))
        .sum()
}

/// Weighted fusion of the signals, scaled to and clamped into [1, 100].
/// Vector distances are turned into a similarity as `1 - distance`.
///
/// The tf-idf overlap is unbounded so its contribution is capped at 1.0; a
/// missing vector distance contributes nothing.
pub fn composite_score(signals: &MatchSignals, weights: &ScoringWeights) -> f64 {
    let unit = |x: f64| if x.is_finite() { x.clamp(0.0, 1.0) } else { 0.0 };
    let vector = signals.vector_distance.map_or(0.0, |d| unit(1.0 - d));
    let raw = weights.vector * vector
        + weights.tfidf * unit(signals.tfidf_score)
        + weights.first_name * unit(signals.first_name)
        + weights.last_name * unit(signals.last_name)
        + weights.street * unit(signals.street)
        + weights.city * unit(signals.city)
        + weights.phone * unit(signals.phone)
        + weights.zip * unit(signals.zip)
        + weights.key_match * f64::from(signals.bin_key_match);
    // four decimals, so weights summing to 1.0 reach exactly 100
    let scaled = (raw * MAX_SCORE * 1e4).round() / 1e4;
    if scaled.is_finite() {
        scaled.clamp(MIN_SCORE, MAX_SCORE)
    } else {
        MIN_SCORE
    }
}

/// Signals of one pairing. Fails when the candidate street normalizes to nothing.
pub fn score_candidate(
    query: &QueryContext,
    query_street: &str,
    candidate: &CandidateRecord,
    weights: &ScoringWeights,
) -> Result<Candidate, MatchError> {
    let candidate_street = NormalizedText::parse(&candidate.record.street)?;
    let n = weights.field_ngram_size;
    let q = &query.record;
    let c = &candidate.record;

    let bin_key_match = match (&query.key, &candidate.key) {
        (Some(a), Some(b)) if a == b => 1,
        _ => 0,
    };
    let signals = MatchSignals {
        bin_key_match,
        tfidf_score: tfidf_overlap(&query.tokens, &candidate.tokens),
        first_name: similarity(&normalize_name(&q.first_name), &normalize_name(&c.first_name), n),
        last_name: similarity(&normalize_name(&q.last_name), &normalize_name(&c.last_name), n),
        street: similarity(query_street, candidate_street.as_str(), n),
        city: similarity(&normalize_name(&q.city), &normalize_name(&c.city), n),
        phone: similarity(&normalize_digits(&q.phone_number), &normalize_digits(&c.phone_number), n),
        zip: similarity(&normalize_digits(&q.zip_code), &normalize_digits(&c.zip_code), n),
        vector_distance: candidate.vector_distance,
    };
    let score = composite_score(&signals, weights);

    Ok(Candidate {
        customer_id: c.customer_id,
        first_name: c.first_name.clone(),
        last_name: c.last_name.clone(),
        street: c.street.clone(),
        city: c.city.clone(),
        zip_code: c.zip_code.clone(),
        phone_number: c.phone_number.clone(),
        signals,
        score,
    })
}

/// Scores and orders candidates: descending score, ties by ascending id,
/// truncated to `top_n`. Candidates with unusable streets are skipped.
pub fn rank_candidates(
    query: &QueryContext,
    candidates: Vec<CandidateRecord>,
    weights: &ScoringWeights,
    top_n: usize,
) -> Vec<Candidate> {
    let query_street = crate::matching::normalize::normalize(&query.record.street);
    let mut seen = HashSet::new();
    let mut scored: Vec<Candidate> = Vec::with_capacity(candidates.len());
    for candidate in candidates {
        if !seen.insert(candidate.record.customer_id) {
            continue;
        }
        match score_candidate(query, &query_street, &candidate, weights) {
            Ok(c) => scored.push(c),
            Err(e) => warn!(
                "Skipping candidate {} for customer {}: {}",
                candidate.record.customer_id, query.record.customer_id, e
            ),
        }
    }
    scored.sort_by(|a, b| {
        b.score
            .total_cmp(&a.score)
            .then_with(|| a.customer_id.cmp(&b.customer_id))
    });
    scored.truncate(top_n);
    debug!(
        "Customer {}: kept {} ranked candidates",
        query.record.customer_id,
        scored.len()
    );
    scored
}
