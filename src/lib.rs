// src/lib.rs
pub mod candidate_generation;
pub mod embedding;
pub mod error;
pub mod matching;
pub mod models;
pub mod utils;

pub use error::{ErrorPayload, MatchError};
