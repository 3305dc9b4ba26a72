//! Delegate selection among competing agents.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use super::similarity::{Descriptor, SimilarityScorer};
use crate::error::DelegationError;

/// An agent that might take over a request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DelegationCandidate {
    pub candidate_id: String,
    pub descriptor: Descriptor,
    pub accepts_delegation: bool,
}

/// Outcome of one selection.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DelegationDecision {
    /// Winning candidate, if any scored above the threshold.
    pub selected: Option<String>,
    /// Score of every candidate that could be scored.
    pub scores: Vec<(String, f32)>,
    /// Candidates whose scoring failed, with the reason.
    pub failures: Vec<(String, String)>,
}

/// Picks the best delegate for a query.
pub struct DelegationScorer {
    scorer: Arc<dyn SimilarityScorer>,
    threshold: f32,
}

impl DelegationScorer {
    pub fn new(scorer: Arc<dyn SimilarityScorer>, threshold: f32) -> Self {
        Self { scorer, threshold }
    }

    pub fn threshold(&self) -> f32 {
        self.threshold
    }

    /// Score the eligible candidates and pick a winner.
    ///
    /// The current agent and candidates that refuse delegation are never
    /// considered. A winner must score strictly above the threshold; equal
    /// top scores go to the lexicographically smallest id. If every
    /// eligible candidate fails to score, the call fails.
    pub async fn select_delegate(
        &self,
        query: &str,
        current_id: Option<&str>,
        candidates: &[DelegationCandidate],
    ) -> Result<DelegationDecision, DelegationError> {
        let eligible: Vec<&DelegationCandidate> = candidates
            .iter()
            .filter(|c| c.accepts_delegation && Some(c.candidate_id.as_str()) != current_id)
            .collect();
        if eligible.is_empty() {
            return Ok(DelegationDecision::default());
        }

        let query_vector = self.scorer.embed_query(query).await?;

        let mut decision = DelegationDecision::default();
        for candidate in &eligible {
            match self.scorer.score(&query_vector, &candidate.descriptor).await {
                Ok(score) => decision.scores.push((candidate.candidate_id.clone(), score)),
                Err(e) => {
                    warn!(candidate = %candidate.candidate_id, error = %e, "Candidate scoring failed");
                    decision
                        .failures
                        .push((candidate.candidate_id.clone(), e.to_string()));
                }
            }
        }

        if decision.scores.is_empty() {
            return Err(DelegationError::AllFailed {
                count: decision.failures.len(),
                failures: decision
                    .failures
                    .iter()
                    .map(|(id, reason)| {
                        DelegationError::Scoring {
                            candidate: id.clone(),
                            reason: reason.clone(),
                        }
                        .to_string()
                    })
                    .collect(),
            });
        }

        decision.selected = decision
            .scores
            .iter()
            .filter(|(_, score)| *score > self.threshold)
            .min_by(|a, b| b.1.total_cmp(&a.1).then_with(|| a.0.cmp(&b.0)))
            .map(|(id, _)| id.clone());

        match &decision.selected {
            Some(id) => info!(delegate = %id, candidates = eligible.len(), "Delegate selected"),
            None => debug!(candidates = eligible.len(), threshold = self.threshold, "No delegate above threshold"),
        }
        Ok(decision)
    }
}
