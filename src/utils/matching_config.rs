// src/utils/matching_config.rs
use std::env;
use std::str::FromStr;
use std::time::Duration;

use log::{info, warn};

use crate::candidate_generation::candidate_generation::RetrievalConfig;
use crate::embedding::job::EmbeddingConfig;
use crate::error::MatchError;
use crate::matching::blocking::BlockingParams;
use crate::matching::scorer::ScoringWeights;
use crate::matching::stage::PipelineConfig;
use crate::matching::tfidf::{IdfPopulation, TfIdfConfig, TokenGranularity, WeightMode};

/// Every tunable of a matching run, threaded explicitly into each component.
#[derive(Debug, Clone, Default)]
pub struct MatchingConfig {
    pub blocking: BlockingParams,
    pub tfidf: TfIdfConfig,
    pub pipeline: PipelineConfig,
    pub scoring: ScoringWeights,
    pub retrieval: RetrievalConfig,
    pub embedding: EmbeddingConfig,
}

fn env_parse<T: FromStr>(key: &str, default: T) -> T {
    match env::var(key) {
        Ok(raw) => match raw.trim().parse() {
            Ok(value) => value,
            Err(_) => {
                warn!("Ignoring unparsable {}='{}', using default", key, raw);
                default
            }
        },
        Err(_) => default,
    }
}

impl MatchingConfig {
    pub fn from_env() -> Result<Self, MatchError> {
        let defaults = MatchingConfig::default();

        let blocking = BlockingParams {
            ngram_size: env_parse("BLOCKING_NGRAM_SIZE", defaults.blocking.ngram_size),
            threshold: env_parse("BLOCKING_THRESHOLD", defaults.blocking.threshold),
        };

        let tfidf_ngram_size = env_parse("TFIDF_NGRAM_SIZE", 3usize);
        let granularity = match env::var("TFIDF_TOKENIZER")
            .unwrap_or_else(|_| "ngram".to_string())
            .trim()
            .to_lowercase()
            .as_str()
        {
            "ngram" => TokenGranularity::CharNgram(tfidf_ngram_size),
            "word" => TokenGranularity::Word,
            other => {
                return Err(MatchError::Configuration(format!(
                    "TFIDF_TOKENIZER must be 'ngram' or 'word', got '{}'",
                    other
                )))
            }
        };
        let weight_mode: WeightMode = env::var("TFIDF_WEIGHT_MODE")
            .unwrap_or_else(|_| "tfidf".to_string())
            .parse()?;
        let idf_population: IdfPopulation = env::var("TFIDF_IDF_POPULATION")
            .unwrap_or_else(|_| "baseline".to_string())
            .parse()?;
        let tfidf = TfIdfConfig {
            granularity,
            weight_mode,
            idf_population,
            workers: env_parse("TFIDF_WORKERS", defaults.tfidf.workers),
        };

        let pipeline = PipelineConfig {
            workers: env_parse("PIPELINE_WORKERS", defaults.pipeline.workers),
            queue_capacity: env_parse("PIPELINE_QUEUE_CAPACITY", defaults.pipeline.queue_capacity),
            persist_batch_size: env_parse("PIPELINE_BATCH_SIZE", defaults.pipeline.persist_batch_size),
        };

        let d = &defaults.scoring;
        let scoring = ScoringWeights {
            vector: env_parse("SCORE_WEIGHT_VECTOR", d.vector),
            tfidf: env_parse("SCORE_WEIGHT_TFIDF", d.tfidf),
            first_name: env_parse("SCORE_WEIGHT_FIRST_NAME", d.first_name),
            last_name: env_parse("SCORE_WEIGHT_LAST_NAME", d.last_name),
            street: env_parse("SCORE_WEIGHT_STREET", d.street),
            city: env_parse("SCORE_WEIGHT_CITY", d.city),
            phone: env_parse("SCORE_WEIGHT_PHONE", d.phone),
            zip: env_parse("SCORE_WEIGHT_ZIP", d.zip),
            key_match: env_parse("SCORE_WEIGHT_KEY_MATCH", d.key_match),
            field_ngram_size: env_parse("SCORE_FIELD_NGRAM_SIZE", d.field_ngram_size),
        };

        let retrieval = RetrievalConfig {
            top_n: env_parse("MATCH_TOP_N", defaults.retrieval.top_n),
            candidate_limit: env_parse("MATCH_CANDIDATE_LIMIT", defaults.retrieval.candidate_limit),
            max_vector_distance: env_parse("MATCH_MAX_VECTOR_DISTANCE", defaults.retrieval.max_vector_distance),
            use_vectors: env_parse("MATCH_USE_VECTORS", defaults.retrieval.use_vectors),
        };

        let e = &defaults.embedding;
        let embedding = EmbeddingConfig {
            enabled: env_parse("EMBEDDING_ENABLED", e.enabled),
            script_path: env::var("EMBEDDING_SCRIPT_PATH").unwrap_or_else(|_| e.script_path.clone()),
            interpreter: env::var("EMBEDDING_INTERPRETER").unwrap_or_else(|_| e.interpreter.clone()),
            timeout: Duration::from_secs(env_parse("EMBEDDING_TIMEOUT_SECS", e.timeout.as_secs())),
            poll_interval: Duration::from_millis(env_parse(
                "EMBEDDING_POLL_INTERVAL_MS",
                e.poll_interval.as_millis() as u64,
            )),
            allow_key_only_fallback: env_parse("EMBEDDING_KEY_ONLY_FALLBACK", e.allow_key_only_fallback),
        };

        let config = MatchingConfig {
            blocking,
            tfidf,
            pipeline,
            scoring,
            retrieval,
            embedding,
        };
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), MatchError> {
        let invalid = |msg: &str| Err(MatchError::Configuration(msg.to_string()));

        if self.blocking.ngram_size == 0 {
            return invalid("BLOCKING_NGRAM_SIZE must be at least 1");
        }
        if !(0.0..=1.0).contains(&self.blocking.threshold) {
            return invalid("BLOCKING_THRESHOLD must be within [0, 1]");
        }
        if self.tfidf.granularity == TokenGranularity::CharNgram(0) {
            return invalid("TFIDF_NGRAM_SIZE must be at least 1");
        }
        if self.tfidf.idf_population == IdfPopulation::RunOnly {
            return invalid("TFIDF_IDF_POPULATION=run weighs queries against a table the baseline was never weighed with");
        }
        if self.tfidf.workers == 0 {
            return invalid("TFIDF_WORKERS must be at least 1");
        }
        if self.pipeline.workers == 0 || self.pipeline.queue_capacity == 0 || self.pipeline.persist_batch_size == 0 {
            return invalid("PIPELINE_WORKERS, PIPELINE_QUEUE_CAPACITY and PIPELINE_BATCH_SIZE must be positive");
        }
        if self.scoring.has_negative() {
            return invalid("score weights must be non-negative");
        }
        if self.scoring.field_ngram_size == 0 {
            return invalid("SCORE_FIELD_NGRAM_SIZE must be at least 1");
        }
        if self.retrieval.top_n == 0 || self.retrieval.candidate_limit == 0 {
            return invalid("MATCH_TOP_N and MATCH_CANDIDATE_LIMIT must be positive");
        }
        if !(0.0..=2.0).contains(&self.retrieval.max_vector_distance) {
            return invalid("MATCH_MAX_VECTOR_DISTANCE must be within [0, 2]");
        }
        if self.embedding.enabled && self.embedding.poll_interval.is_zero() {
            return invalid("EMBEDDING_POLL_INTERVAL_MS must be positive");
        }
        Ok(())
    }

    pub fn log_config(&self) {
        info!("🔧 Matching Configuration:");
        info!(
            "   🔑 Blocking: n={}, threshold={}",
            self.blocking.ngram_size, self.blocking.threshold
        );
        info!(
            "   ⚖️  TF-IDF: tokenizer={}, mode={:?}, idf population={}, workers={}",
            self.tfidf.granularity,
            self.tfidf.weight_mode,
            self.tfidf.idf_population.as_str(),
            self.tfidf.workers
        );
        info!(
            "   🚦 Pipeline: {} workers, queue capacity {}, persist batch {}",
            self.pipeline.workers, self.pipeline.queue_capacity, self.pipeline.persist_batch_size
        );
        let total = self.scoring.total();
        if (total - 1.0).abs() > 1e-6 {
            warn!("   ⚠️  Score weights sum to {:.3}, composite scores will saturate or compress", total);
        }
        info!(
            "   🎯 Retrieval: top {}, limit {}, vectors {} (max distance {})",
            self.retrieval.top_n,
            self.retrieval.candidate_limit,
            if self.retrieval.use_vectors { "on" } else { "off" },
            self.retrieval.max_vector_distance
        );
        info!(
            "   🧠 Embeddings: {} ({} {}, timeout {:?}, key-only fallback {})",
            if self.embedding.enabled { "enabled" } else { "disabled" },
            self.embedding.interpreter,
            self.embedding.script_path,
            self.embedding.timeout,
            self.embedding.allow_key_only_fallback
        );
    }
}
