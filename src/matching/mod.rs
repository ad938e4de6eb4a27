pub mod blocking;
pub mod db;
pub mod manager;
pub mod ngram;
pub mod normalize;
pub mod reference_corpus;
pub mod scorer;
pub mod stage;
pub mod store;
pub mod tfidf;

#[cfg(test)]
pub mod test_support;
