//! revisit-core — Visitor data model and embedding matcher.
//!
//! Embeddings are produced by an external recognition pipeline; this crate
//! only compares them and describes the records the ledger keeps.

pub mod matcher;
pub mod types;

pub use matcher::{CosineMatcher, Matcher};
pub use types::{
    Embedding, MatchResult, Observation, ObservationId, ResolutionEvent, VisitorId, VisitorRecord,
    VisitorStats,
};
