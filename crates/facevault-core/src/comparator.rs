//! Embedding comparison: tolerance-filtered, ascending-distance matching.

use crate::error::FaceError;
use crate::types::{Embedding, FaceMatch, GalleryEntry};
use std::sync::Arc;

/// Tolerance used by callers that do not choose one.
///
/// Never applied implicitly: every matching operation takes a tolerance.
pub const DEFAULT_TOLERANCE: f32 = 0.4;

/// Reject tolerances that cannot be compared against a distance.
pub fn validate_tolerance(tolerance: f32) -> Result<(), FaceError> {
    if tolerance.is_finite() && tolerance >= 0.0 {
        Ok(())
    } else {
        Err(FaceError::InvalidInput(format!(
            "tolerance must be a finite non-negative number, got {tolerance}"
        )))
    }
}

/// Compare a probe against keyed candidates.
///
/// Returns every candidate with `distance <= tolerance`, ascending by
/// distance. Equal distances keep candidate order.
pub fn compare<'a, K, I>(
    probe: &Embedding,
    candidates: I,
    tolerance: f32,
) -> Result<Vec<(K, f32)>, FaceError>
where
    I: IntoIterator<Item = (K, &'a Embedding)>,
{
    validate_tolerance(tolerance)?;
    if !probe.is_finite() {
        return Err(FaceError::InvalidInput(
            "probe embedding contains non-finite values".to_string(),
        ));
    }

    let mut matches = Vec::new();
    for (key, candidate) in candidates {
        let distance = probe.euclidean_distance(candidate).ok_or_else(|| {
            FaceError::InvalidInput(format!(
                "embedding dimensionality mismatch: probe has {}, candidate has {}",
                probe.dimension(),
                candidate.dimension()
            ))
        })?;
        if distance <= tolerance {
            matches.push((key, distance));
        }
    }

    // `sort_by` is stable: ties stay in insertion order.
    matches.sort_by(|a, b| a.1.total_cmp(&b.1));
    Ok(matches)
}

/// Strategy for matching a probe embedding against gallery entries.
///
/// Implementations must return exactly the entries within tolerance,
/// ascending by distance with ties in gallery order.
pub trait Matcher: Send + Sync {
    fn compare(
        &self,
        probe: &Embedding,
        gallery: &[Arc<GalleryEntry>],
        tolerance: f32,
    ) -> Result<Vec<FaceMatch>, FaceError>;
}

/// Exhaustive Euclidean matcher. Visits every gallery entry.
#[derive(Debug, Clone, Copy, Default)]
pub struct EuclideanMatcher;

impl Matcher for EuclideanMatcher {
    fn compare(
        &self,
        probe: &Embedding,
        gallery: &[Arc<GalleryEntry>],
        tolerance: f32,
    ) -> Result<Vec<FaceMatch>, FaceError> {
        let hits = compare(
            probe,
            gallery.iter().map(|entry| (entry, &entry.embedding)),
            tolerance,
        )?;
        Ok(hits
            .into_iter()
            .map(|(entry, distance)| FaceMatch {
                identity: entry.identity,
                display_name: entry.display_name.clone(),
                distance,
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::default_display_name;
    use chrono::Utc;

    fn emb(values: &[f32]) -> Embedding {
        Embedding::new(values.to_vec())
    }

    fn entry(identity: i64, values: &[f32]) -> Arc<GalleryEntry> {
        Arc::new(GalleryEntry {
            identity,
            display_name: default_display_name(identity),
            embedding: emb(values),
            representative_image: Vec::new().into(),
            created_at: Utc::now(),
        })
    }

    #[test]
    fn test_compare_includes_at_exact_tolerance() {
        let probe = emb(&[0.0, 0.0]);
        let at = emb(&[0.0, 0.5]);
        let out = compare(&probe, [("at", &at)], 0.5).unwrap();
        assert_eq!(out, vec![("at", 0.5)]);
    }

    #[test]
    fn test_compare_excludes_beyond_tolerance() {
        let probe = emb(&[0.0, 0.0]);
        let far = emb(&[0.0, 0.5]);
        let out = compare(&probe, [("far", &far)], 0.4).unwrap();
        assert!(out.is_empty());
    }

    #[test]
    fn test_compare_sorted_ascending() {
        let probe = emb(&[0.0]);
        let c = [emb(&[0.3]), emb(&[0.1]), emb(&[0.2]), emb(&[0.9])];
        let out = compare(&probe, c.iter().enumerate(), 0.4).unwrap();
        let keys: Vec<usize> = out.iter().map(|(k, _)| *k).collect();
        assert_eq!(keys, vec![1, 2, 0]);
        assert!(out.windows(2).all(|w| w[0].1 <= w[1].1));
    }

    #[test]
    fn test_compare_ties_keep_insertion_order() {
        let probe = emb(&[0.0, 0.0]);
        let c = [emb(&[0.0, 0.2]), emb(&[0.2, 0.0]), emb(&[0.0, -0.2]), emb(&[0.0, 0.1])];
        let out = compare(&probe, c.iter().enumerate(), 0.4).unwrap();
        let keys: Vec<usize> = out.iter().map(|(k, _)| *k).collect();
        assert_eq!(keys, vec![3, 0, 1, 2]);
    }

    #[test]
    fn test_compare_dimension_mismatch_is_invalid_input() {
        let probe = emb(&[0.0, 0.0]);
        let bad = emb(&[0.0, 0.0, 0.0]);
        let err = compare(&probe, [(1, &bad)], 0.4).unwrap_err();
        assert!(matches!(err, FaceError::InvalidInput(_)));
    }

    #[test]
    fn test_compare_rejects_bad_tolerance() {
        let probe = emb(&[0.0]);
        for tol in [-0.1, f32::NAN, f32::INFINITY] {
            let err = compare::<u8, _>(&probe, [], tol).unwrap_err();
            assert!(matches!(err, FaceError::InvalidInput(_)), "tolerance {tol}");
        }
    }

    #[test]
    fn test_compare_rejects_non_finite_probe() {
        let candidate = emb(&[0.0, 0.0]);
        for bad in [f32::NAN, f32::INFINITY] {
            let probe = emb(&[bad, 0.0]);
            let err = compare(&probe, [(1, &candidate)], 0.4).unwrap_err();
            assert!(matches!(err, FaceError::InvalidInput(_)), "component {bad}");
        }
    }

    #[test]
    fn test_compare_zero_tolerance_matches_identical_only() {
        let probe = emb(&[0.25, 0.5]);
        let same = emb(&[0.25, 0.5]);
        let near = emb(&[0.25, 0.5001]);
        let out = compare(&probe, [("same", &same), ("near", &near)], 0.0).unwrap();
        assert_eq!(out, vec![("same", 0.0)]);
    }

    #[test]
    fn test_euclidean_matcher_visits_all_entries() {
        // Closest entry is last in the gallery.
        let gallery = vec![
            entry(1, &[0.3, 0.0]),
            entry(2, &[1.0, 1.0]),
            entry(3, &[0.0, 0.1]),
        ];
        let out = EuclideanMatcher
            .compare(&emb(&[0.0, 0.0]), &gallery, 0.4)
            .unwrap();
        let ids: Vec<i64> = out.iter().map(|m| m.identity).collect();
        assert_eq!(ids, vec![3, 1]);
        assert_eq!(out[0].display_name, "Person_3");
    }

    #[test]
    fn test_euclidean_matcher_empty_gallery() {
        let out = EuclideanMatcher.compare(&emb(&[1.0]), &[], 0.4).unwrap();
        assert!(out.is_empty());
    }
}
