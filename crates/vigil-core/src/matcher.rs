//! Identity matching: nearest known encoding under a distance threshold.

use serde::{Deserialize, Serialize};

use crate::types::{FaceEncoding, KnownIdentity};

/// Default maximum encoding distance accepted as the same person.
pub const DEFAULT_DISTANCE_THRESHOLD: f64 = 0.6;

/// Outcome of comparing one candidate against the known set.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MatchResult {
    pub matched: bool,
    /// Name of the matched identity; `None` unless `matched`.
    pub name: Option<String>,
    /// Distance to the nearest known encoding (`+inf` when nothing is known).
    pub distance: f64,
}

impl MatchResult {
    fn no_match(distance: f64) -> Self {
        Self {
            matched: false,
            name: None,
            distance,
        }
    }
}

/// Compares a candidate encoding against a set of known identities.
pub trait Matcher {
    fn compare(&self, candidate: &FaceEncoding, known: &[KnownIdentity], threshold: f64)
        -> MatchResult;
}

/// Single-decision Euclidean matcher.
///
/// Picks the identity at minimum distance (first in order on ties) and
/// accepts it iff that distance is `<= threshold`. An empty known set is a
/// valid state and simply yields no match.
#[derive(Debug, Clone, Copy, Default)]
pub struct EuclideanMatcher;

impl Matcher for EuclideanMatcher {
    fn compare(
        &self,
        candidate: &FaceEncoding,
        known: &[KnownIdentity],
        threshold: f64,
    ) -> MatchResult {
        let mut best: Option<(&KnownIdentity, f64)> = None;
        for identity in known {
            let distance = candidate.distance(&identity.encoding);
            match best {
                Some((_, best_distance)) if distance >= best_distance => {}
                _ => best = Some((identity, distance)),
            }
        }

        let Some((identity, distance)) = best else {
            return MatchResult::no_match(f64::INFINITY);
        };

        if distance <= threshold {
            MatchResult {
                matched: true,
                name: Some(identity.name.clone()),
                distance,
            }
        } else {
            MatchResult::no_match(distance)
        }
    }
}

/// Match `candidate` against `known` with the Euclidean policy.
pub fn match_identity(
    candidate: &FaceEncoding,
    known: &[KnownIdentity],
    distance_threshold: f64,
) -> MatchResult {
    EuclideanMatcher.compare(candidate, known, distance_threshold)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn enc(values: &[f64]) -> FaceEncoding {
        FaceEncoding::new(values.to_vec()).unwrap()
    }

    fn identity(name: &str, values: &[f64]) -> KnownIdentity {
        KnownIdentity {
            name: name.to_string(),
            encoding: enc(values),
        }
    }

    fn gallery() -> Vec<KnownIdentity> {
        vec![
            identity("alice", &[0.0, 0.0, 0.0]),
            identity("bob", &[1.0, 1.0, 1.0]),
            identity("carol", &[-1.0, 0.5, 2.0]),
        ]
    }

    #[test]
    fn test_exact_candidate_matches_every_entry() {
        let known = gallery();
        for entry in &known {
            let result = match_identity(&entry.encoding, &known, DEFAULT_DISTANCE_THRESHOLD);
            assert!(result.matched);
            assert_eq!(result.name.as_deref(), Some(entry.name.as_str()));
            assert!(result.distance.abs() < 1e-12);
        }
    }

    #[test]
    fn test_near_candidate_matches_alice() {
        let known = vec![identity("alice", &[0.2, 0.4, 0.6])];
        let candidate = enc(&[0.3, 0.4, 0.6]);
        let result = match_identity(&candidate, &known, 0.6);
        assert!(result.matched);
        assert_eq!(result.name.as_deref(), Some("alice"));
        assert!((result.distance - 0.1).abs() < 1e-9);
    }

    #[test]
    fn test_far_candidate_rejected() {
        let known = gallery();
        let candidate = enc(&[10.0, 10.0, 10.0]);
        let result = match_identity(&candidate, &known, DEFAULT_DISTANCE_THRESHOLD);
        assert!(!result.matched);
        assert!(result.name.is_none());
        assert!(result.distance > DEFAULT_DISTANCE_THRESHOLD);
    }

    #[test]
    fn test_threshold_is_inclusive() {
        let known = vec![identity("alice", &[0.0, 0.0])];
        let candidate = enc(&[0.5, 0.0]);
        assert!(match_identity(&candidate, &known, 0.5).matched);
        assert!(!match_identity(&candidate, &known, 0.49).matched);
    }

    #[test]
    fn test_empty_known_set() {
        let result = match_identity(&enc(&[0.0]), &[], DEFAULT_DISTANCE_THRESHOLD);
        assert!(!result.matched);
        assert!(result.name.is_none());
        assert!(result.distance.is_infinite());
    }

    #[test]
    fn test_nearest_wins_over_first_within_threshold() {
        // both within threshold; the closer one must win regardless of order
        let known = vec![identity("far", &[0.5, 0.0]), identity("near", &[0.1, 0.0])];
        let result = match_identity(&enc(&[0.0, 0.0]), &known, 0.6);
        assert_eq!(result.name.as_deref(), Some("near"));
    }

    #[test]
    fn test_tie_goes_to_first() {
        let known = vec![identity("first", &[1.0, 0.0]), identity("second", &[-1.0, 0.0])];
        let result = match_identity(&enc(&[0.0, 0.0]), &known, 2.0);
        assert_eq!(result.name.as_deref(), Some("first"));
    }

    #[test]
    fn test_dimension_mismatch_never_matches() {
        let known = vec![identity("alice", &[0.0, 0.0, 0.0])];
        let result = match_identity(&enc(&[0.0, 0.0]), &known, f64::MAX);
        assert!(!result.matched);
    }

    #[test]
    fn test_nan_threshold_fails_closed() {
        let known = gallery();
        let result = match_identity(&known[0].encoding, &known, f64::NAN);
        assert!(!result.matched);
    }
}
