//! Footprint overlap between two frames related by a homography.

use crate::errors::PipelineError;

pub type Point = (f64, f64);

/// Projective 3x3 transform from anchor pixel space into candidate space.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Homography([[f64; 3]; 3]);

impl Homography {
    pub fn new(m: [[f64; 3]; 3]) -> Result<Self, PipelineError> {
        if m.iter().flatten().any(|v| !v.is_finite()) {
            return Err(PipelineError::DegenerateGeometry(
                "homography has non-finite entries".to_string(),
            ));
        }
        Ok(Self(m))
    }

    /// Accepts any nested rows; anything that is not exactly 3x3 is rejected.
    pub fn from_rows(rows: &[Vec<f64>]) -> Result<Self, PipelineError> {
        if rows.len() != 3 || rows.iter().any(|r| r.len() != 3) {
            let shape: Vec<usize> = rows.iter().map(Vec::len).collect();
            return Err(PipelineError::DegenerateGeometry(format!(
                "homography must be 3x3, got rows of {shape:?}"
            )));
        }

        let mut m = [[0f64; 3]; 3];
        for (dst, src) in m.iter_mut().zip(rows) {
            dst.copy_from_slice(src);
        }
        Self::new(m)
    }

    #[cfg(test)]
    pub fn identity() -> Self {
        Self([[1.0, 0.0, 0.0], [0.0, 1.0, 0.0], [0.0, 0.0, 1.0]])
    }

    #[cfg(test)]
    pub fn translation(dx: f64, dy: f64) -> Self {
        Self([[1.0, 0.0, dx], [0.0, 1.0, dy], [0.0, 0.0, 1.0]])
    }

    /// Returns `None` for points mapped to infinity.
    pub fn project(&self, (x, y): Point) -> Option<Point> {
        let m = &self.0;
        let w = m[2][0] * x + m[2][1] * y + m[2][2];
        if w.abs() < f64::EPSILON {
            return None;
        }
        let px = (m[0][0] * x + m[0][1] * y + m[0][2]) / w;
        let py = (m[1][0] * x + m[1][1] * y + m[1][2]) / w;
        (px.is_finite() && py.is_finite()).then_some((px, py))
    }
}

fn rectangle(width: f64, height: f64) -> Vec<Point> {
    vec![(0.0, 0.0), (width, 0.0), (width, height), (0.0, height)]
}

/// Shoelace area, always non-negative.
pub fn polygon_area(poly: &[Point]) -> f64 {
    if poly.len() < 3 {
        return 0.0;
    }
    let twice: f64 = poly
        .iter()
        .zip(poly.iter().cycle().skip(1))
        .map(|(a, b)| a.0 * b.1 - b.0 * a.1)
        .sum();
    (twice / 2.0).abs()
}

fn cross(a: Point, b: Point, p: Point) -> f64 {
    (b.0 - a.0) * (p.1 - a.1) - (b.1 - a.1) * (p.0 - a.0)
}

fn segment_intersection(p: Point, q: Point, a: Point, b: Point) -> Point {
    let cp = cross(a, b, p);
    let cq = cross(a, b, q);
    let t = cp / (cp - cq);
    (p.0 + t * (q.0 - p.0), p.1 + t * (q.1 - p.1))
}

/// Sutherland–Hodgman: clip `subject` by the convex, counter-clockwise `clip`.
pub fn clip_polygon(subject: &[Point], clip: &[Point]) -> Vec<Point> {
    let mut output = subject.to_vec();

    for (i, &a) in clip.iter().enumerate() {
        let b = clip[(i + 1) % clip.len()];
        let input = std::mem::take(&mut output);
        if input.is_empty() {
            break;
        }

        for (j, &current) in input.iter().enumerate() {
            let previous = input[(j + input.len() - 1) % input.len()];
            let current_inside = cross(a, b, current) >= 0.0;
            let previous_inside = cross(a, b, previous) >= 0.0;

            if current_inside {
                if !previous_inside {
                    output.push(segment_intersection(previous, current, a, b));
                }
                output.push(current);
            } else if previous_inside {
                output.push(segment_intersection(previous, current, a, b));
            }
        }
    }

    output
}

/// Percentage (0–100) of the anchor's projected footprint that falls inside
/// the candidate frame.
///
/// Sizes are `(width, height)` in the pixel frames the homography was
/// estimated in. A zero-area projection yields 0.
pub fn overlap_percentage(
    h: &Homography,
    anchor_size: (f64, f64),
    candidate_size: (f64, f64),
) -> Result<f64, PipelineError> {
    let projected: Vec<Point> = rectangle(anchor_size.0, anchor_size.1)
        .into_iter()
        .map(|corner| h.project(corner))
        .collect::<Option<_>>()
        .ok_or_else(|| {
            PipelineError::DegenerateGeometry("anchor corner projects to infinity".to_string())
        })?;

    let anchor_area = polygon_area(&projected);
    if anchor_area <= f64::EPSILON {
        return Ok(0.0);
    }

    let clip = rectangle(candidate_size.0, candidate_size.1);
    let intersection = polygon_area(&clip_polygon(&projected, &clip));

    Ok((intersection / anchor_area * 100.0).clamp(0.0, 100.0))
}
