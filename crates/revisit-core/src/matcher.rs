//! Nearest-neighbour matching of a probe embedding against known visitors.
//!
//! A bounded linear scan: every reference embedding of every record is
//! compared, `O(visitors × references × dim)`.

use crate::types::{Embedding, MatchResult, VisitorRecord};

/// Strategy for comparing a probe embedding against a gallery of visitors.
pub trait Matcher {
    /// Return the best-scoring visitor if its score is at least `threshold`.
    ///
    /// Ties keep the first record yielded by `gallery`; callers pass records
    /// in ascending id order so the lowest id wins.
    fn best_match<'a, I>(&self, probe: &Embedding, gallery: I, threshold: f32) -> Option<MatchResult>
    where
        I: IntoIterator<Item = &'a VisitorRecord>;
}

/// Cosine similarity matcher.
#[derive(Debug, Clone, Copy, Default)]
pub struct CosineMatcher;

impl Matcher for CosineMatcher {
    fn best_match<'a, I>(&self, probe: &Embedding, gallery: I, threshold: f32) -> Option<MatchResult>
    where
        I: IntoIterator<Item = &'a VisitorRecord>,
    {
        // Scores <= 0 never win; confidence stays within [0, 1].
        let mut best_score = 0.0f32;
        let mut best: Option<&VisitorRecord> = None;
        let mut mismatched = 0usize;
        let mut first_mismatch = None;

        for record in gallery {
            for reference in &record.embeddings {
                if reference.dim() != probe.dim() {
                    mismatched += 1;
                    if first_mismatch.is_none() {
                        first_mismatch = Some((record.id, reference.dim()));
                    }
                    continue;
                }
                let score = probe.similarity(reference);
                if score > best_score {
                    best_score = score;
                    best = Some(record);
                }
            }
        }

        if let Some((visitor, reference_dim)) = first_mismatch {
            tracing::warn!(
                probe_dim = probe.dim(),
                mismatched,
                first_visitor = %visitor,
                reference_dim,
                "embedding dimension mismatch; scoring pairs as 0"
            );
        }

        match best {
            Some(record) if best_score >= threshold => Some(MatchResult {
                visitor_id: record.id,
                name: record.display_name.clone(),
                confidence: best_score,
            }),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::VisitorId;
    use chrono::{TimeZone, Utc};
    use tracing_test::traced_test;

    fn visitor(id: u64, name: &str, refs: &[&[f32]]) -> VisitorRecord {
        let t = Utc.with_ymd_and_hms(2024, 5, 1, 9, 0, 0).unwrap();
        VisitorRecord {
            id: VisitorId(id),
            display_name: name.into(),
            embeddings: refs.iter().map(|r| Embedding::new(r.to_vec())).collect(),
            visit_count: 1,
            first_seen: t,
            last_seen: t,
        }
    }

    fn probe(values: &[f32]) -> Embedding {
        Embedding::new(values.to_vec())
    }

    fn two_axes() -> Vec<VisitorRecord> {
        vec![
            visitor(1, "east", &[&[1.0, 0.0]]),
            visitor(2, "north", &[&[0.0, 1.0]]),
        ]
    }

    #[test]
    fn test_exact_match_each_axis() {
        let gallery = two_axes();

        let m = CosineMatcher.best_match(&probe(&[1.0, 0.0]), &gallery, 0.7).unwrap();
        assert_eq!(m.visitor_id, VisitorId(1));
        assert_eq!(m.name, "east");
        assert!((m.confidence - 1.0).abs() < 1e-6);

        let m = CosineMatcher.best_match(&probe(&[0.0, 1.0]), &gallery, 0.7).unwrap();
        assert_eq!(m.visitor_id, VisitorId(2));
    }

    #[test]
    fn test_threshold_boundary_diagonal() {
        let gallery = two_axes();
        let diagonal = probe(&[0.7, 0.7]);

        let m = CosineMatcher.best_match(&diagonal, &gallery, 0.7).unwrap();
        assert!((m.confidence - std::f32::consts::FRAC_1_SQRT_2).abs() < 1e-4);

        assert!(CosineMatcher.best_match(&diagonal, &gallery, 0.71).is_none());
    }

    #[test]
    fn test_never_returns_below_threshold() {
        let gallery = vec![
            visitor(1, "a", &[&[0.9, 0.1, 0.0]]),
            visitor(2, "b", &[&[0.1, 0.9, 0.3]]),
            visitor(3, "c", &[&[0.0, 0.2, 1.0]]),
        ];
        let probes = [[1.0, 0.0, 0.0], [0.3, 0.3, 0.3], [0.0, 1.0, 1.0], [-1.0, 0.0, 0.0]];
        for threshold in [0.0, 0.5, 0.8, 0.95, 1.0] {
            for p in &probes {
                if let Some(m) = CosineMatcher.best_match(&probe(p), &gallery, threshold) {
                    assert!(m.confidence >= threshold, "{} < {threshold}", m.confidence);
                }
            }
        }
    }

    #[test]
    fn test_scans_every_reference() {
        // Best reference is the last one of the last visitor.
        let gallery = vec![
            visitor(1, "decoy1", &[&[0.0, 1.0, 0.0]]),
            visitor(2, "decoy2", &[&[0.0, 0.0, 1.0], &[0.0, 1.0, 1.0]]),
            visitor(3, "match", &[&[0.0, 1.0, 0.0], &[1.0, 0.0, 0.0]]),
        ];
        let m = CosineMatcher.best_match(&probe(&[1.0, 0.0, 0.0]), &gallery, 0.5).unwrap();
        assert_eq!(m.visitor_id, VisitorId(3));
        assert_eq!(m.name, "match");
    }

    #[test]
    fn test_tie_keeps_first_in_order() {
        let gallery = vec![
            visitor(4, "first", &[&[1.0, 0.0]]),
            visitor(9, "second", &[&[2.0, 0.0]]),
        ];
        let m = CosineMatcher.best_match(&probe(&[1.0, 0.0]), &gallery, 0.5).unwrap();
        assert_eq!(m.visitor_id, VisitorId(4));
    }

    #[test]
    fn test_dimension_mismatch_scores_zero() {
        let gallery = vec![
            visitor(1, "wide", &[&[1.0, 0.0, 0.0]]),
            visitor(2, "narrow", &[&[0.6, 0.8]]),
        ];
        let m = CosineMatcher.best_match(&probe(&[1.0, 0.0]), &gallery, 0.5).unwrap();
        assert_eq!(m.visitor_id, VisitorId(2));

        let only_wide = &gallery[..1];
        assert!(CosineMatcher.best_match(&probe(&[1.0, 0.0]), only_wide, 0.0).is_none());
    }

    #[test]
    #[traced_test]
    fn test_dimension_mismatch_warns_once_per_call() {
        let gallery = vec![
            visitor(1, "wide", &[&[1.0, 0.0, 0.0], &[0.0, 1.0, 0.0]]),
            visitor(2, "narrow", &[&[0.6, 0.8]]),
            visitor(3, "wider", &[&[1.0, 0.0, 0.0, 0.0]]),
        ];
        let m = CosineMatcher.best_match(&probe(&[1.0, 0.0]), &gallery, 0.5).unwrap();
        assert_eq!(m.visitor_id, VisitorId(2));

        logs_assert(|lines: &[&str]| {
            let warnings: Vec<_> = lines.iter().filter(|l| l.contains("dimension mismatch")).collect();
            match warnings.as_slice() {
                [line] if line.contains("mismatched=3") => Ok(()),
                other => Err(format!("expected one summary warning, got {other:?}")),
            }
        });
    }

    #[test]
    fn test_zero_probe_never_matches() {
        let gallery = two_axes();
        assert!(CosineMatcher.best_match(&probe(&[0.0, 0.0]), &gallery, 0.0).is_none());
    }

    #[test]
    fn test_empty_gallery() {
        let gallery: Vec<VisitorRecord> = Vec::new();
        assert!(CosineMatcher.best_match(&probe(&[1.0, 0.0]), &gallery, 0.5).is_none());
    }
}
