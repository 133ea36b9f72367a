//! Pairwise image matcher client.
//!
//! Keypoint matching itself runs in an external service; this module only
//! ships two images over and reads back the estimated homography.

use base64::{engine::general_purpose::STANDARD, Engine as _};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use crate::errors::PipelineError;
use crate::geometry::Homography;

/// A homography plus the pixel frames it was estimated in.
#[derive(Debug, Clone, Copy)]
pub struct MatchEstimate {
    pub homography: Homography,
    /// `(width, height)` of the anchor as seen by the matcher.
    pub anchor_size: (f64, f64),
    pub candidate_size: (f64, f64),
}

pub trait HomographyEstimator: Send + Sync {
    /// Estimate the transform taking `anchor` pixels into `candidate` pixels.
    /// `resize` caps the longest side the matcher works at.
    fn estimate(
        &self,
        anchor: &Path,
        candidate: &Path,
        resize: u32,
    ) -> Result<MatchEstimate, PipelineError>;
}

#[derive(Serialize)]
struct MatchRequest {
    image_a: String,
    image_b: String,
    resize: u32,
}

#[derive(Deserialize)]
struct MatchResponse {
    #[serde(rename = "H")]
    h: Vec<Vec<f64>>,
    /// `[width, height]` of each image after the matcher's resize.
    #[serde(default)]
    size_a: Option<[f64; 2]>,
    #[serde(default)]
    size_b: Option<[f64; 2]>,
}

/// Talks to a matcher service over HTTP.
pub struct HttpMatcher {
    client: reqwest::blocking::Client,
    url: String,
}

impl HttpMatcher {
    pub fn new(url: &str, timeout: Duration) -> Result<Self, PipelineError> {
        let client = reqwest::blocking::Client::builder()
            .timeout(timeout)
            .build()?;

        Ok(Self {
            client,
            url: url.to_string(),
        })
    }
}

impl HomographyEstimator for HttpMatcher {
    fn estimate(
        &self,
        anchor: &Path,
        candidate: &Path,
        resize: u32,
    ) -> Result<MatchEstimate, PipelineError> {
        let request = MatchRequest {
            image_a: STANDARD.encode(std::fs::read(anchor)?),
            image_b: STANDARD.encode(std::fs::read(candidate)?),
            resize,
        };

        let response: MatchResponse = self
            .client
            .post(&self.url)
            .json(&request)
            .send()
            .and_then(|r| r.error_for_status())
            .and_then(|r| r.json())?;

        let homography = Homography::from_rows(&response.h)?;
        let anchor_size = match response.size_a {
            Some([w, h]) => (w, h),
            None => resized_dimensions(anchor, resize)?,
        };
        let candidate_size = match response.size_b {
            Some([w, h]) => (w, h),
            None => resized_dimensions(candidate, resize)?,
        };

        Ok(MatchEstimate {
            homography,
            anchor_size,
            candidate_size,
        })
    }
}

/// Image dimensions scaled so the longest side is at most `resize`.
fn resized_dimensions(path: &Path, resize: u32) -> Result<(f64, f64), PipelineError> {
    let (w, h) = image::image_dimensions(path)
        .map_err(|e| PipelineError::DegenerateGeometry(format!("{}: {e}", path.display())))?;
    Ok(scale_to_longest_side(w, h, resize))
}

pub fn scale_to_longest_side(width: u32, height: u32, resize: u32) -> (f64, f64) {
    let (w, h) = (width as f64, height as f64);
    let longest = w.max(h);
    if resize == 0 || longest <= resize as f64 {
        return (w, h);
    }
    let scale = resize as f64 / longest;
    (w * scale, h * scale)
}
