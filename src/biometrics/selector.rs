//! Best-match selection over stored templates

use serde::Serialize;
use std::sync::Arc;

use super::store::{StoredTemplate, VectorStore};
use super::recognition_vector;
use crate::config::{HostAuthMode, HostModeConfig};
use crate::device::{ExtractedFaceprints, FaceprintMatcher, Faceprints, MatcherConfidenceLevel};
use crate::error::Result;

/// Candidate selection knobs
#[derive(Debug, Clone, Copy)]
pub struct MatchPolicy {
    pub mode: HostAuthMode,
    pub max_results: usize,
    pub score_threshold: f32,
    pub confidence: MatcherConfidenceLevel,
}

impl MatchPolicy {
    pub fn from_config(config: &HostModeConfig) -> Self {
        Self {
            mode: config.auth_type,
            max_results: config.hybrid_max_results,
            score_threshold: config.hybrid_score_threshold,
            confidence: MatcherConfidenceLevel::High,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub enum MatchDecision {
    Matched {
        user_id: String,
        score: f32,
        /// The adapted template was written back
        updated: bool,
    },
    Forbidden,
}

struct Best<'a> {
    template: &'a StoredTemplate,
    score: f32,
    should_update: bool,
    updated: Faceprints,
}

pub struct MatchSelector {
    store: Arc<dyn VectorStore>,
    matcher: Arc<dyn FaceprintMatcher>,
    policy: MatchPolicy,
}

impl MatchSelector {
    pub fn new(
        store: Arc<dyn VectorStore>,
        matcher: Arc<dyn FaceprintMatcher>,
        policy: MatchPolicy,
    ) -> Self {
        Self {
            store,
            matcher,
            policy,
        }
    }

    pub fn policy(&self) -> &MatchPolicy {
        &self.policy
    }

    /// Templates to scan for `probe`: the nearest neighbors in hybrid mode,
    /// every stored template in device mode
    pub fn candidates(&self, probe: &ExtractedFaceprints) -> Result<Vec<StoredTemplate>> {
        let candidates = match self.policy.mode {
            HostAuthMode::Hybrid => self
                .store
                .nearest(
                    &recognition_vector(&probe.features),
                    self.policy.max_results,
                    self.policy.score_threshold,
                )?
                .into_iter()
                .map(|hit| hit.template)
                .collect(),
            HostAuthMode::Device => self.store.list_all()?,
        };
        Ok(candidates)
    }

    /// Scan `candidates` in order and keep the best successful match
    ///
    /// Ties keep the first candidate seen. A candidate the matcher rejects is
    /// skipped; a matcher error aborts the scan. When the winner's match asks
    /// for it, its adapted template is written back (at most one write).
    pub fn select_best(
        &self,
        probe: &ExtractedFaceprints,
        candidates: &[StoredTemplate],
    ) -> Result<MatchDecision> {
        log::info!("Searching in {} DB faceprints...", candidates.len());

        let mut best: Option<Best<'_>> = None;
        for (i, candidate) in candidates.iter().enumerate() {
            if !candidate.faceprints.is_well_formed() {
                log::warn!("Skipping malformed template {} ({})", i, candidate.id);
                continue;
            }

            let output =
                self.matcher
                    .match_faceprints(probe, &candidate.faceprints, self.policy.confidence)?;
            log::debug!("match_result for candidate {}: {:?}", i, output.result);

            if !output.result.success {
                continue;
            }
            log::info!(
                "Match success for candidate {} with score {}",
                i,
                output.result.score
            );
            if best.as_ref().map_or(true, |b| output.result.score > b.score) {
                best = Some(Best {
                    template: candidate,
                    score: output.result.score,
                    should_update: output.result.should_update,
                    updated: output.updated,
                });
            }
        }

        let Some(best) = best else {
            return Ok(MatchDecision::Forbidden);
        };

        let user_id = best.template.user_id.clone();
        if best.should_update {
            self.store.update_faceprints(&user_id, &best.updated)?;
        }

        Ok(MatchDecision::Matched {
            user_id,
            score: best.score,
            updated: best.should_update,
        })
    }

    /// Candidate lookup followed by selection
    pub fn identify(&self, probe: &ExtractedFaceprints) -> Result<MatchDecision> {
        let candidates = self.candidates(probe)?;
        self.select_best(probe, &candidates)
    }
}
