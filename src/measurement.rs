//! Blob measurements produced by the capture collaborator.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::coords::{Axis, CoordinateSpace, Point2, Transformer};

/// A single detected blob.
///
/// Immutable once captured; derived values are new measurements.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BlobMeasurement {
    pub x: f64,
    pub y: f64,
    /// Blob diameter, expressed along the X axis of `space`.
    pub size: f64,
    /// Detector confidence.
    pub response: f64,
    pub captured_at: DateTime<Utc>,
    pub space: CoordinateSpace,
}

impl BlobMeasurement {
    pub fn new(x: f64, y: f64, size: f64, response: f64, space: CoordinateSpace) -> Self {
        Self {
            x,
            y,
            size,
            response,
            captured_at: Utc::now(),
            space,
        }
    }

    pub fn position(&self) -> Point2 {
        Point2::new(self.x, self.y, self.space)
    }

    /// Position component along an axis.
    pub fn get(&self, axis: Axis) -> f64 {
        self.position().get(axis)
    }

    /// Re-express this measurement in another space, keeping timestamp and response.
    pub fn normalized(&self, transformer: &Transformer, to: CoordinateSpace) -> BlobMeasurement {
        let p = transformer.convert(self.position(), to);
        BlobMeasurement {
            x: p.x,
            y: p.y,
            size: transformer.delta(self.size, Axis::X, self.space, to),
            response: self.response,
            captured_at: self.captured_at,
            space: to,
        }
    }

    /// Shorthand for normalizing into pattern space.
    pub fn to_pattern(&self, transformer: &Transformer) -> BlobMeasurement {
        self.normalized(transformer, CoordinateSpace::Pattern)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_to_pattern_converts_position_and_size() {
        let t = Transformer::for_image(1000.0, 500.0);
        let m = BlobMeasurement::new(750.0, 125.0, 50.0, 0.9, CoordinateSpace::Camera);
        let p = m.to_pattern(&t);

        assert_eq!(p.space, CoordinateSpace::Pattern);
        assert!((p.x - 0.5).abs() < 1e-12);
        assert!((p.y + 0.5).abs() < 1e-12);
        assert!((p.size - 0.1).abs() < 1e-12);
        assert_eq!(p.captured_at, m.captured_at);
        assert_eq!(p.response, 0.9);
    }
}
