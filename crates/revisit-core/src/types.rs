use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Stable visitor key.
///
/// Ids allocated by the ledger grow monotonically, so ascending id order is
/// also creation order. Declared identities from upstream share the same space.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct VisitorId(pub u64);

impl VisitorId {
    /// Largest id a store can hold (signed 64-bit keys).
    pub const MAX: VisitorId = VisitorId(i64::MAX as u64);

    pub fn is_storable(self) -> bool {
        self <= Self::MAX
    }
}

impl fmt::Display for VisitorId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Correlation id assigned to every observation on receipt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ObservationId(pub Uuid);

impl ObservationId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for ObservationId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ObservationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Face embedding vector (typically 512-dimensional for ArcFace-style models).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Embedding {
    pub values: Vec<f32>,
}

impl Embedding {
    pub fn new(values: Vec<f32>) -> Self {
        Self { values }
    }

    pub fn dim(&self) -> usize {
        self.values.len()
    }

    /// Euclidean norm.
    pub fn norm(&self) -> f32 {
        self.values.iter().map(|v| v * v).sum::<f32>().sqrt()
    }

    /// Compute cosine similarity between two embeddings.
    ///
    /// Returns a value in [-1, 1]. Higher = more similar. Returns 0.0 when
    /// either vector has zero norm or when the dimensions differ.
    pub fn similarity(&self, other: &Embedding) -> f32 {
        if self.values.len() != other.values.len() {
            return 0.0;
        }

        let mut dot = 0.0f32;
        let mut norm_a = 0.0f32;
        let mut norm_b = 0.0f32;

        for (a, b) in self.values.iter().zip(other.values.iter()) {
            dot += a * b;
            norm_a += a * a;
            norm_b += b * b;
        }

        let denom = norm_a.sqrt() * norm_b.sqrt();
        if denom > 0.0 {
            (dot / denom).clamp(-1.0, 1.0)
        } else {
            0.0
        }
    }

    /// True when every component is finite.
    pub fn is_finite(&self) -> bool {
        self.values.iter().all(|v| v.is_finite())
    }
}

/// A visitor as persisted by the ledger.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VisitorRecord {
    pub id: VisitorId,
    pub display_name: String,
    /// Reference embeddings, oldest first. Empty only for records created
    /// from a declared identity that carried no embedding.
    pub embeddings: Vec<Embedding>,
    /// Always >= 1.
    pub visit_count: u32,
    pub first_seen: DateTime<Utc>,
    /// Always >= `first_seen`.
    pub last_seen: DateTime<Utc>,
}

impl VisitorRecord {
    /// Count a visit captured at `at`. `last_seen` never moves backward.
    pub fn touch(&mut self, at: DateTime<Utc>) {
        self.visit_count = self.visit_count.saturating_add(1);
        self.advance_last_seen(at);
    }

    /// Move `last_seen` forward to `at`, ignoring out-of-order captures.
    pub fn advance_last_seen(&mut self, at: DateTime<Utc>) {
        if at > self.last_seen {
            self.last_seen = at;
        }
    }

    /// Append a reference embedding, keeping at most `max` of them.
    ///
    /// The first (enrollment) reference is kept; the oldest accumulated one
    /// is evicted when the set is full.
    pub fn push_reference(&mut self, embedding: Embedding, max: usize) {
        if max <= 1 && !self.embeddings.is_empty() {
            return;
        }
        self.embeddings.push(embedding);
        while self.embeddings.len() > max.max(1) {
            self.embeddings.remove(1);
        }
    }
}

/// One face sighting delivered by an ingestion collaborator.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Observation {
    /// Absent when the source declares the identity directly.
    #[serde(default)]
    pub embedding: Option<Embedding>,
    /// Upstream-assigned identity; bypasses matching when present.
    #[serde(default)]
    pub declared_id: Option<VisitorId>,
    /// Upstream visit count used for reconciliation.
    #[serde(default)]
    pub declared_visit_count: Option<u32>,
    /// When the face was observed. Orders `last_seen`, not arrival order.
    pub captured_at: DateTime<Utc>,
    #[serde(default)]
    pub camera_id: Option<String>,
    #[serde(default)]
    pub image_path: Option<String>,
}

impl Observation {
    /// Observation carrying only an embedding, as delivered by a camera pipeline.
    pub fn from_embedding(embedding: Embedding, captured_at: DateTime<Utc>) -> Self {
        Self {
            embedding: Some(embedding),
            declared_id: None,
            declared_visit_count: None,
            captured_at,
            camera_id: None,
            image_path: None,
        }
    }

    /// Observation carrying an upstream-assigned identity.
    pub fn declared(
        id: VisitorId,
        visit_count: Option<u32>,
        captured_at: DateTime<Utc>,
    ) -> Self {
        Self {
            embedding: None,
            declared_id: Some(id),
            declared_visit_count: visit_count,
            captured_at,
            camera_id: None,
            image_path: None,
        }
    }
}

/// Best gallery match for a probe embedding.
#[derive(Debug, Clone, PartialEq)]
pub struct MatchResult {
    pub visitor_id: VisitorId,
    pub name: String,
    /// Cosine similarity of the best reference, in [0, 1].
    pub confidence: f32,
}

/// Outcome of resolving one observation, published after the ledger commits.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResolutionEvent {
    pub observation_id: ObservationId,
    pub visitor_id: VisitorId,
    pub name: String,
    pub is_known: bool,
    pub confidence: f32,
    pub timestamp: DateTime<Utc>,
    pub visit_count: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub camera_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image_path: Option<String>,
}

/// Aggregate counts over the ledger for a time window.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VisitorStats {
    pub window_start: DateTime<Utc>,
    pub total_visitors: u64,
    pub total_visits: u64,
    /// Records first seen at or after `window_start`.
    pub new_in_window: u64,
    /// Records with more than one visit last seen at or after `window_start`.
    pub returning_in_window: u64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};

    fn emb(values: &[f32]) -> Embedding {
        Embedding::new(values.to_vec())
    }

    fn record() -> VisitorRecord {
        let t0 = Utc.with_ymd_and_hms(2024, 5, 1, 9, 0, 0).unwrap();
        VisitorRecord {
            id: VisitorId(1),
            display_name: "Unknown Visitor".into(),
            embeddings: vec![emb(&[1.0, 0.0])],
            visit_count: 1,
            first_seen: t0,
            last_seen: t0,
        }
    }

    #[test]
    fn test_cosine_similarity_identical() {
        let a = emb(&[1.0, 0.0, 0.0]);
        let b = emb(&[1.0, 0.0, 0.0]);
        assert!((a.similarity(&b) - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_cosine_similarity_self_nonunit() {
        let a = emb(&[3.0, -4.0, 12.0]);
        assert!((a.similarity(&a) - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_cosine_similarity_orthogonal() {
        let a = emb(&[1.0, 0.0]);
        let b = emb(&[0.0, 1.0]);
        assert!(a.similarity(&b).abs() < 1e-6);
    }

    #[test]
    fn test_cosine_similarity_opposite() {
        let a = emb(&[1.0, 0.0]);
        let b = emb(&[-1.0, 0.0]);
        assert!((a.similarity(&b) + 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_cosine_similarity_symmetric() {
        let a = emb(&[0.3, 0.9, -0.2]);
        let b = emb(&[0.5, 0.1, 0.7]);
        assert_eq!(a.similarity(&b), b.similarity(&a));
    }

    #[test]
    fn test_cosine_similarity_zero_vector() {
        let zero = emb(&[0.0, 0.0]);
        let b = emb(&[1.0, 0.0]);
        assert_eq!(zero.similarity(&b), 0.0);
        assert_eq!(b.similarity(&zero), 0.0);
        assert_eq!(zero.similarity(&zero), 0.0);
    }

    #[test]
    fn test_cosine_similarity_dimension_mismatch() {
        let a = emb(&[1.0, 0.0]);
        let b = emb(&[1.0, 0.0, 0.0]);
        assert_eq!(a.similarity(&b), 0.0);
    }

    #[test]
    fn test_visitor_id_storable_bound() {
        assert!(VisitorId(1).is_storable());
        assert!(VisitorId(i64::MAX as u64).is_storable());
        assert!(!VisitorId(i64::MAX as u64 + 1).is_storable());
        assert!(!VisitorId(u64::MAX).is_storable());
    }

    #[test]
    fn test_touch_never_moves_last_seen_backward() {
        let mut r = record();
        let later = r.last_seen + Duration::minutes(5);
        r.touch(later);
        r.touch(later - Duration::minutes(10));
        assert_eq!(r.visit_count, 3);
        assert_eq!(r.last_seen, later);
    }

    #[test]
    fn test_push_reference_keeps_first_and_caps() {
        let mut r = record();
        r.push_reference(emb(&[0.0, 1.0]), 3);
        r.push_reference(emb(&[0.5, 0.5]), 3);
        r.push_reference(emb(&[0.2, 0.8]), 3);
        assert_eq!(r.embeddings.len(), 3);
        assert_eq!(r.embeddings[0], emb(&[1.0, 0.0]));
        assert_eq!(r.embeddings[2], emb(&[0.2, 0.8]));
    }

    #[test]
    fn test_push_reference_disabled_with_max_one() {
        let mut r = record();
        r.push_reference(emb(&[0.0, 1.0]), 1);
        assert_eq!(r.embeddings, vec![emb(&[1.0, 0.0])]);
    }

    #[test]
    fn test_observation_json_defaults() {
        let json = r#"{"embedding":[0.1,0.2],"captured_at":"2024-05-01T09:00:00Z"}"#;
        let obs: Observation = serde_json::from_str(json).unwrap();
        assert_eq!(obs.embedding.unwrap().dim(), 2);
        assert!(obs.declared_id.is_none());
        assert!(obs.declared_visit_count.is_none());
    }
}
