// src/matching/blocking.rs
use crate::error::MatchError;
use crate::matching::ngram::similarity;
use crate::matching::normalize::NormalizedText;
use crate::matching::reference_corpus::ReferenceCorpus;
use crate::models::core::{BlockingKey, BLOCKING_KEY_LEN};

/// N-gram size and similarity threshold used to set a key bit.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BlockingParams {
    pub ngram_size: usize,
    pub threshold: f64,
}

impl BlockingParams {
    /// Bigrams with a low bar: most records near a reference entity light its bit.
    pub fn bigram_loose() -> Self {
        Self {
            ngram_size: 2,
            threshold: 0.1,
        }
    }

    /// Trigrams with a high bar: only close variants light a bit.
    pub fn trigram_strict() -> Self {
        Self {
            ngram_size: 3,
            threshold: 0.7,
        }
    }
}

impl Default for BlockingParams {
    fn default() -> Self {
        Self::bigram_loose()
    }
}

/// Signature of `text` against the first ten corpus entries.
///
/// Bit `i` is `1` when the similarity to entry `i` reaches the threshold.
/// A corpus shorter than ten entries leaves the remaining bits at `0`.
pub fn compute_key(corpus: &ReferenceCorpus, text: &str, params: &BlockingParams) -> BlockingKey {
    BlockingKey::from_bits(
        corpus
            .entities()
            .iter()
            .take(BLOCKING_KEY_LEN)
            .map(|entry| similarity(text, entry, params.ngram_size) >= params.threshold),
    )
}

/// Normalizer and key computation bundled for the keying stage workers.
#[derive(Debug, Clone)]
pub struct BlockingKeyGenerator {
    corpus: ReferenceCorpus,
    params: BlockingParams,
}

impl BlockingKeyGenerator {
    pub fn new(corpus: ReferenceCorpus, params: BlockingParams) -> Self {
        Self { corpus, params }
    }

    /// Keys a raw street. Fails only when nothing survives normalization.
    pub fn key_for(&self, raw_street: &str) -> Result<BlockingKey, MatchError> {
        let text = NormalizedText::parse(raw_street)?;
        Ok(compute_key(&self.corpus, text.as_str(), &self.params))
    }

    pub fn corpus(&self) -> &ReferenceCorpus {
        &self.corpus
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn assert_well_formed(key: &BlockingKey) {
        assert_eq!(key.as_str().len(), 10);
        assert!(key.as_str().chars().all(|c| c == '0' || c == '1'));
    }

    #[test]
    fn test_main_street_scenario() {
        let corpus = ReferenceCorpus::new(["123 main st"]);
        let generator = BlockingKeyGenerator::new(corpus, BlockingParams::bigram_loose());
        let key = generator.key_for("123 Main Street").unwrap();
        assert_eq!(key.as_str(), "1000000000");
    }

    #[test]
    fn test_key_length_for_any_corpus_size() {
        let params = BlockingParams::bigram_loose();
        let empty = ReferenceCorpus::new(Vec::<String>::new());
        let single = ReferenceCorpus::new(["1 oak ave"]);
        let large = ReferenceCorpus::new((0..25).map(|i| format!("{} oak ave", i)));
        for corpus in [empty, single, large] {
            assert_well_formed(&compute_key(&corpus, "14 oak ave", &params));
        }
        let empty = ReferenceCorpus::new(Vec::<String>::new());
        assert_eq!(compute_key(&empty, "14 oak ave", &params).as_str(), "0000000000");
    }

    #[test]
    fn test_only_first_ten_entries_are_consulted() {
        let corpus = ReferenceCorpus::new((10..30).map(|i| format!("{} elm st", i)));
        let strict = BlockingParams { ngram_size: 3, threshold: 0.99 };
        // matches the 15th entry exactly, which is past the tenth bit
        assert_eq!(compute_key(&corpus, "24 elm st", &strict).as_str(), "0000000000");
        assert_eq!(compute_key(&corpus, "12 elm st", &strict).as_str(), "0010000000");
    }

    #[test]
    fn test_keys_are_deterministic() {
        let corpus = ReferenceCorpus::new(["1 oak ave", "77 sunset blvd", "9 elm st", "pobox 4"]);
        let generator = BlockingKeyGenerator::new(corpus, BlockingParams::trigram_strict());
        let first = generator.key_for("77 Sunset Boulevard").unwrap();
        for _ in 0..5 {
            assert_eq!(generator.key_for("77 Sunset Boulevard").unwrap(), first);
        }
    }

    #[test]
    fn test_same_street_same_key() {
        let corpus = ReferenceCorpus::new(["1 oak ave", "77 sunset blvd", "9 elm st"]);
        let generator = BlockingKeyGenerator::new(corpus, BlockingParams::bigram_loose());
        assert_eq!(
            generator.key_for("9 Elm Street").unwrap(),
            generator.key_for("9 elm st.").unwrap()
        );
    }

    #[test]
    fn test_empty_street_is_input_error() {
        let generator = BlockingKeyGenerator::new(ReferenceCorpus::new(["1 oak ave"]), BlockingParams::default());
        assert!(matches!(generator.key_for("  ,, "), Err(MatchError::Input(_))));
    }
}
