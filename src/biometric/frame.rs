//! Face landmark frame analysis.
//!
//! Landmarks arrive as a flat `[x0, y0, z0, x1, y1, z1, ...]` array in
//! normalised image coordinates, using the 468-point face mesh numbering.

use super::ModelError;
use serde::Serialize;

/// Nose tip; origin of the normalised frame.
const ANCHOR: usize = 1;
/// Forehead and chin, spanning the face height.
const TOP: usize = 10;
const BOTTOM: usize = 152;
/// Left and right cheek, spanning the face width.
const LEFT: usize = 234;
const RIGHT: usize = 454;

/// Fewest landmarks that include every reference point.
pub const MIN_LANDMARKS: usize = RIGHT + 1;

/// Depth is flatter than the face outline by this factor.
const DEPTH_SCALE: f32 = 0.85;

const MIN_SCALE: f32 = 1e-4;

/// Geometry of one frame, taken before normalisation.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FrameAnalysis {
    pub min_x: f32,
    pub min_y: f32,
    pub max_x: f32,
    pub max_y: f32,
    pub yaw: f32,
    pub pitch: f32,
}

#[derive(Clone, Copy)]
struct Point {
    x: f32,
    y: f32,
    z: f32,
}

fn point(landmarks: &[f32], index: usize) -> Point {
    let base = index * 3;
    Point {
        x: landmarks[base],
        y: landmarks[base + 1],
        z: landmarks[base + 2],
    }
}

fn planar_distance(a: Point, b: Point) -> f32 {
    (a.x - b.x).hypot(a.y - b.y)
}

/// Measure a frame, then normalise it in place.
///
/// Points are translated so the nose tip is the origin and divided by the
/// mean of face height and width, making frames comparable across camera
/// distance. A degenerate face (scale under `1e-4`) is left untouched.
pub fn analyze_frame(landmarks: &mut [f32]) -> Result<FrameAnalysis, ModelError> {
    let count = landmarks.len() / 3;
    if count < MIN_LANDMARKS {
        return Err(ModelError::TooFewLandmarks {
            got: count,
            need: MIN_LANDMARKS,
        });
    }
    let landmarks = &mut landmarks[..count * 3];

    // Box starts inverted over the unit square
    let (mut min_x, mut min_y, mut max_x, mut max_y) = (1.0f32, 1.0f32, 0.0f32, 0.0f32);
    for xyz in landmarks.chunks_exact(3) {
        min_x = min_x.min(xyz[0]);
        max_x = max_x.max(xyz[0]);
        min_y = min_y.min(xyz[1]);
        max_y = max_y.max(xyz[1]);
    }

    let anchor = point(landmarks, ANCHOR);
    let top = point(landmarks, TOP);
    let bottom = point(landmarks, BOTTOM);
    let left = point(landmarks, LEFT);
    let right = point(landmarks, RIGHT);

    let yaw = right.z - left.z;
    let pitch = top.z - bottom.z;

    let height = planar_distance(top, bottom);
    let width = planar_distance(left, right);
    let scale = (height + width) / 2.0;

    if scale > MIN_SCALE {
        for xyz in landmarks.chunks_exact_mut(3) {
            xyz[0] = (xyz[0] - anchor.x) / scale;
            xyz[1] = (xyz[1] - anchor.y) / scale;
            xyz[2] = (xyz[2] - anchor.z) / (scale * DEPTH_SCALE);
        }
    }

    Ok(FrameAnalysis {
        min_x,
        min_y,
        max_x,
        max_y,
        yaw,
        pitch,
    })
}
