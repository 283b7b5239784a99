//! Nearest-identity matching.

use crate::types::{Embedding, KnownFace, MatchResult};

/// Default acceptance threshold on L2 distance.
pub const DEFAULT_MATCH_THRESHOLD: f32 = 0.4;

/// Strategy for comparing a query embedding against the known faces.
///
/// Implementations must be stateless per call: the result depends only on
/// the query, the gallery contents and the threshold.
pub trait Matcher {
    fn best_match(&self, query: &Embedding, gallery: &[KnownFace], threshold: f32) -> MatchResult;
}

/// Exhaustive Euclidean matcher, O(N·D) per query.
///
/// The first entry (in insertion order) with the minimum distance wins.
/// A match is accepted only when that distance is strictly below the
/// threshold.
#[derive(Debug, Clone, Copy, Default)]
pub struct L2Matcher;

impl Matcher for L2Matcher {
    fn best_match(&self, query: &Embedding, gallery: &[KnownFace], threshold: f32) -> MatchResult {
        let mut best_dist = f32::INFINITY;
        let mut best_idx: Option<usize> = None;

        for (i, known) in gallery.iter().enumerate() {
            let dist = query.euclidean_distance(&known.embedding);
            // Strict comparison keeps the earliest entry on ties.
            if best_idx.is_none() || dist < best_dist {
                best_dist = dist;
                best_idx = Some(i);
            }
        }

        match best_idx {
            Some(idx) if best_dist < threshold => MatchResult {
                label: Some(gallery[idx].label.clone()),
                distance: best_dist,
            },
            _ => MatchResult::unknown(best_dist),
        }
    }
}
