//! Contact matching by Euclidean distance in embedding space.
//!
//! The matcher is a pure ranking function: it never filters by an absolute
//! confidence threshold. Display thresholds belong to the caller.

use crate::types::Embedding;
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum MatchError {
    #[error("invalid embedding: {0}")]
    InvalidEmbedding(String),
    #[error("dimension mismatch for contact {contact_id}: query has {expected}, candidate has {actual}")]
    DimensionMismatch {
        contact_id: String,
        expected: usize,
        actual: usize,
    },
}

/// A known contact's match target.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Candidate {
    pub contact_id: String,
    pub embedding: Embedding,
}

/// One ranked contact suggestion.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Suggestion {
    pub contact_id: String,
    /// Bounded match score in (0, 1]; for ranking and display only.
    pub confidence: f32,
    pub distance: f32,
}

/// Map a Euclidean distance to a confidence in (0, 1].
///
/// 1.0 at distance 0, strictly decreasing, approaching 0 as distance grows.
pub fn distance_to_confidence(distance: f32) -> f32 {
    1.0 / (1.0 + distance.max(0.0))
}

/// Strategy for ranking known contacts against a query embedding.
pub trait Matcher {
    fn rank(
        &self,
        query: &Embedding,
        candidates: &[Candidate],
        limit: usize,
    ) -> Result<Vec<Suggestion>, MatchError>;
}

/// Nearest-neighbour ranking over every candidate.
#[derive(Debug, Clone, Copy, Default)]
pub struct EuclideanMatcher;

impl Matcher for EuclideanMatcher {
    fn rank(
        &self,
        query: &Embedding,
        candidates: &[Candidate],
        limit: usize,
    ) -> Result<Vec<Suggestion>, MatchError> {
        if !query.is_well_formed() {
            return Err(MatchError::InvalidEmbedding(format!(
                "query must be a non-empty finite vector (dim {})",
                query.dim()
            )));
        }

        let mut ranked = Vec::with_capacity(candidates.len());
        for candidate in candidates {
            let distance = query
                .euclidean_distance(&candidate.embedding)
                .ok_or_else(|| MatchError::DimensionMismatch {
                    contact_id: candidate.contact_id.clone(),
                    expected: query.dim(),
                    actual: candidate.embedding.dim(),
                })?;
            if !distance.is_finite() {
                tracing::warn!(contact_id = %candidate.contact_id, "match target out of range; excluded");
                continue;
            }
            ranked.push(Suggestion {
                contact_id: candidate.contact_id.clone(),
                confidence: distance_to_confidence(distance),
                distance,
            });
        }

        // Nearest first. Sorting on distance rather than the rounded
        // confidence keeps close distances apart; equal ones keep candidate
        // order since `sort_by` is stable.
        ranked.sort_by(|a, b| a.distance.total_cmp(&b.distance));
        ranked.truncate(limit);
        Ok(ranked)
    }
}
