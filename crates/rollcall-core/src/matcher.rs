//! Nearest-neighbour matching of a query embedding against the known set.

use crate::types::{Embedding, KnownIdentity, MatchResult};
use thiserror::Error;

/// Distance reported when there is nothing to compare against.
///
/// Not a real L2 value; kept at 1.0 because stored attendance scores and
/// threshold tuning already assume it.
pub const EMPTY_GALLERY_DISTANCE: f32 = 1.0;

/// Default raw L2 threshold for unnormalised ArcFace embeddings.
pub const DEFAULT_THRESHOLD: f32 = 20.0;

#[derive(Error, Debug, PartialEq)]
pub enum MatchError {
    #[error("embedding dimension mismatch: query has {query}, known set has {known}")]
    DimensionMismatch { query: usize, known: usize },
    #[error("query embedding is empty")]
    EmptyQuery,
}

/// Strategy for comparing a query embedding against the known set.
pub trait Matcher: Send + Sync {
    fn best_match(
        &self,
        query: &Embedding,
        known: &[KnownIdentity],
        threshold: f32,
    ) -> Result<MatchResult, MatchError>;
}

/// Exhaustive Euclidean matcher.
///
/// Scans every known embedding; a match requires `min_distance < threshold`.
/// Equal minima resolve to the first entry in snapshot order. Entries whose
/// dimension differs from the query are skipped; only a query that fits none
/// of them is an error.
pub struct L2Matcher;

impl Matcher for L2Matcher {
    fn best_match(
        &self,
        query: &Embedding,
        known: &[KnownIdentity],
        threshold: f32,
    ) -> Result<MatchResult, MatchError> {
        if query.values.is_empty() {
            return Err(MatchError::EmptyQuery);
        }
        if known.is_empty() {
            return Ok(MatchResult::unknown(EMPTY_GALLERY_DISTANCE));
        }

        let mut best: Option<(usize, f32)> = None;
        let mut skipped = 0usize;

        for (i, entry) in known.iter().enumerate() {
            if entry.embedding.dim() != query.dim() {
                skipped += 1;
                continue;
            }
            let distance = query.euclidean_distance(&entry.embedding);
            if best.map_or(true, |(_, d)| distance < d) {
                best = Some((i, distance));
            }
        }

        let Some((best_idx, best_distance)) = best else {
            return Err(MatchError::DimensionMismatch {
                query: query.dim(),
                known: known[0].embedding.dim(),
            });
        };
        if skipped > 0 {
            tracing::debug!(skipped, query_dim = query.dim(), "skipped known embeddings of another dimension");
        }

        if best_distance < threshold {
            let entry = &known[best_idx];
            Ok(MatchResult {
                identity_id: Some(entry.identity_id),
                display_name: entry.display_name.clone(),
                distance: best_distance,
            })
        } else {
            Ok(MatchResult::unknown(best_distance))
        }
    }
}
