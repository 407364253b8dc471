//! Coordinate space tags and tagged coordinate values.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// The five coordinate spaces a measurement or target can be expressed in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CoordinateSpace {
    /// Raw pixels, origin top-left.
    Camera,
    /// Normalized [0,1] x [0,1], aspect-distorted.
    Viewport,
    /// Normalized to the longer image dimension, aspect-corrected.
    Isotropic,
    /// [-1,1] x [-1,1], viewport recentered.
    Centered,
    /// Device/target space. Numerically identical to `Centered` for now.
    Pattern,
}

impl CoordinateSpace {
    pub const ALL: [CoordinateSpace; 5] = [
        CoordinateSpace::Camera,
        CoordinateSpace::Viewport,
        CoordinateSpace::Isotropic,
        CoordinateSpace::Centered,
        CoordinateSpace::Pattern,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            CoordinateSpace::Camera => "camera",
            CoordinateSpace::Viewport => "viewport",
            CoordinateSpace::Isotropic => "isotropic",
            CoordinateSpace::Centered => "centered",
            CoordinateSpace::Pattern => "pattern",
        }
    }
}

impl fmt::Display for CoordinateSpace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error returned when a coordinate space tag cannot be parsed.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("Unknown coordinate space: {0}")]
pub struct ParseSpaceError(pub String);

impl FromStr for CoordinateSpace {
    type Err = ParseSpaceError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "camera" => Ok(CoordinateSpace::Camera),
            "viewport" => Ok(CoordinateSpace::Viewport),
            "isotropic" => Ok(CoordinateSpace::Isotropic),
            "centered" => Ok(CoordinateSpace::Centered),
            "pattern" => Ok(CoordinateSpace::Pattern),
            other => Err(ParseSpaceError(other.to_string())),
        }
    }
}

/// Axis selector for per-axis quantities.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Axis {
    X,
    Y,
}

impl Axis {
    pub const BOTH: [Axis; 2] = [Axis::X, Axis::Y];
}

impl fmt::Display for Axis {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Axis::X => f.write_str("x"),
            Axis::Y => f.write_str("y"),
        }
    }
}

/// A 2D point tagged with the space it is expressed in.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Point2 {
    pub x: f64,
    pub y: f64,
    pub space: CoordinateSpace,
}

impl Point2 {
    pub fn new(x: f64, y: f64, space: CoordinateSpace) -> Self {
        Self { x, y, space }
    }

    pub fn camera(x: f64, y: f64) -> Self {
        Self::new(x, y, CoordinateSpace::Camera)
    }

    pub fn viewport(x: f64, y: f64) -> Self {
        Self::new(x, y, CoordinateSpace::Viewport)
    }

    pub fn pattern(x: f64, y: f64) -> Self {
        Self::new(x, y, CoordinateSpace::Pattern)
    }

    /// Component along the given axis.
    pub fn get(&self, axis: Axis) -> f64 {
        match axis {
            Axis::X => self.x,
            Axis::Y => self.y,
        }
    }

    /// Component-wise difference `self - other`.
    ///
    /// # Panics
    /// Panics if the two points are tagged with different spaces.
    pub fn offset_from(&self, other: &Point2) -> Point2 {
        assert_eq!(
            self.space, other.space,
            "cannot subtract points from different coordinate spaces"
        );
        Point2::new(self.x - other.x, self.y - other.y, self.space)
    }
}

/// A width/height pair in a given space.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Size2 {
    pub width: f64,
    pub height: f64,
}

/// Region of interest rectangle in viewport space.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Roi {
    pub x: f64,
    pub y: f64,
    pub width: f64,
    pub height: f64,
}

impl Roi {
    pub fn new(x: f64, y: f64, width: f64, height: f64) -> Self {
        Self {
            x,
            y,
            width,
            height,
        }
    }

    /// Whether a viewport-space coordinate lies inside the rectangle (edges inclusive).
    pub fn contains_viewport(&self, x: f64, y: f64) -> bool {
        x >= self.x && x <= self.x + self.width && y >= self.y && y <= self.y + self.height
    }
}

/// Image context shared by all conversions of one capture session.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ConvertContext {
    pub width: f64,
    pub height: f64,
    pub roi: Option<Roi>,
}

impl ConvertContext {
    pub fn new(width: f64, height: f64) -> Self {
        Self {
            width,
            height,
            roi: None,
        }
    }

    pub fn max_dim(&self) -> f64 {
        self.width.max(self.height)
    }

    /// Pixel extent along an axis.
    pub fn dim(&self, axis: Axis) -> f64 {
        match axis {
            Axis::X => self.width,
            Axis::Y => self.height,
        }
    }

    /// Letterbox offset that recenters the shorter axis in isotropic space.
    pub fn isotropic_offset(&self, axis: Axis) -> f64 {
        (self.max_dim() - self.dim(axis)) / 2.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_space_round_trips_through_str() {
        for space in CoordinateSpace::ALL {
            assert_eq!(space.as_str().parse::<CoordinateSpace>(), Ok(space));
        }
        assert!("screen".parse::<CoordinateSpace>().is_err());
    }

    #[test]
    fn test_roi_contains() {
        let roi = Roi::new(0.25, 0.25, 0.5, 0.5);
        assert!(roi.contains_viewport(0.5, 0.5));
        assert!(roi.contains_viewport(0.25, 0.75));
        assert!(!roi.contains_viewport(0.1, 0.5));
    }

    #[test]
    #[should_panic]
    fn test_offset_from_rejects_mixed_spaces() {
        let a = Point2::camera(1.0, 2.0);
        let b = Point2::pattern(0.0, 0.0);
        let _ = a.offset_from(&b);
    }

    #[test]
    fn test_isotropic_offset_landscape() {
        let ctx = ConvertContext::new(1920.0, 1080.0);
        assert_eq!(ctx.isotropic_offset(Axis::X), 0.0);
        assert_eq!(ctx.isotropic_offset(Axis::Y), 420.0);
    }
}
