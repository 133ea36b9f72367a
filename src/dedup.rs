use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::errors::PipelineError;
use crate::geometry::overlap_percentage;
use crate::matcher::HomographyEstimator;

/// Drops frames that mostly repeat the previously kept one.
///
/// The walk is sequential and order-dependent: each candidate is compared
/// with the current anchor only, and a kept candidate becomes the anchor.
/// Callers must pass paths already sorted.
pub struct OverlapDeduplicator {
    matcher: Arc<dyn HomographyEstimator>,
    threshold: f64,
    resize: u32,
}

impl OverlapDeduplicator {
    pub fn new(matcher: Arc<dyn HomographyEstimator>, threshold: f64, resize: u32) -> Self {
        Self {
            matcher,
            threshold,
            resize,
        }
    }

    pub fn threshold(&self) -> f64 {
        self.threshold
    }

    pub fn compute_overlap(&self, anchor: &Path, candidate: &Path) -> Result<f64, PipelineError> {
        let estimate = self.matcher.estimate(anchor, candidate, self.resize)?;
        overlap_percentage(
            &estimate.homography,
            estimate.anchor_size,
            estimate.candidate_size,
        )
    }

    pub fn filter_folder(&self, images: &[PathBuf]) -> Vec<PathBuf> {
        let Some((first, rest)) = images.split_first() else {
            return Vec::new();
        };

        let mut survivors = vec![first.clone()];
        let mut anchor = first;

        for candidate in rest {
            let overlap = match self.compute_overlap(anchor, candidate) {
                Ok(overlap) => overlap,
                Err(e) => {
                    log::warn!(
                        "overlap {} -> {} failed, keeping candidate: {e}",
                        anchor.display(),
                        candidate.display()
                    );
                    0.0
                }
            };

            // equal to threshold counts as redundant; zero overlap never does
            if overlap > 0.0 && overlap >= self.threshold {
                log::debug!(
                    "drop {} ({overlap:.1}% over {})",
                    candidate.display(),
                    anchor.display()
                );
                continue;
            }

            survivors.push(candidate.clone());
            anchor = candidate;
        }

        log::info!("dedup kept {}/{} images", survivors.len(), images.len());
        survivors
    }
}
