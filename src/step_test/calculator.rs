//! Step-test arithmetic.
//!
//! A step test nudges one actuator by a small known amount and watches the
//! blob move. The ratio gives pattern-space displacement per actuator step,
//! which is later inverted to find how many steps reach a target.

use serde::{Deserialize, Serialize};

use crate::coords::Axis;
use crate::measurement::BlobMeasurement;

/// Sensitivities smaller than this are treated as noise.
pub const MIN_SENSITIVITY: f64 = 1e-6;

/// Default perturbation magnitude for a step test.
pub const DEFAULT_DELTA_STEPS: i32 = 100;

/// Absolute position bounds of an actuator, in steps.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ActuatorLimits {
    pub min_steps: i32,
    pub max_steps: i32,
}

impl Default for ActuatorLimits {
    fn default() -> Self {
        Self {
            min_steps: -1200,
            max_steps: 1200,
        }
    }
}

impl ActuatorLimits {
    pub fn new(min_steps: i32, max_steps: i32) -> Self {
        Self {
            min_steps,
            max_steps,
        }
    }

    /// The centered home position.
    pub fn center(&self) -> i32 {
        let (min, max) = (i64::from(self.min_steps), i64::from(self.max_steps));
        // Lies within [min, max], so the narrowing cannot wrap.
        (min + (max - min) / 2) as i32
    }

    /// Largest absolute step count a move may request.
    pub fn max_abs_steps(&self) -> u32 {
        self.min_steps.unsigned_abs().max(self.max_steps.unsigned_abs())
    }

    pub fn clamp(&self, position: i32) -> i32 {
        position.clamp(self.min_steps, self.max_steps)
    }

    pub fn contains(&self, position: i32) -> bool {
        (self.min_steps..=self.max_steps).contains(&position)
    }
}

/// Step-test parameters recorded with every run summary.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StepTestSettings {
    pub delta_steps: i32,
    /// Mount rotation of the array relative to the camera.
    pub rotation_degrees: f64,
    pub limits: ActuatorLimits,
}

impl Default for StepTestSettings {
    fn default() -> Self {
        Self {
            delta_steps: DEFAULT_DELTA_STEPS,
            rotation_degrees: 0.0,
            limits: ActuatorLimits::default(),
        }
    }
}

impl StepTestSettings {
    pub fn with_delta_steps(mut self, delta_steps: i32) -> Self {
        self.delta_steps = delta_steps;
        self
    }

    pub fn with_rotation(mut self, rotation_degrees: f64) -> Self {
        self.rotation_degrees = rotation_degrees;
        self
    }

    pub fn with_limits(mut self, limits: ActuatorLimits) -> Self {
        self.limits = limits;
        self
    }
}

/// Mechanical sign of an axis at a mount rotation.
///
/// At 0° the X axis is flipped and Y is not; 180° inverts both. Rotations
/// snap to the nearest multiple of 180°.
pub fn axis_sign(axis: Axis, rotation_degrees: f64) -> i32 {
    let half_turns = (rotation_degrees / 180.0).round() as i64;
    let base = match axis {
        Axis::X => -1,
        Axis::Y => 1,
    };
    if half_turns.rem_euclid(2) == 1 {
        -base
    } else {
        base
    }
}

/// Signed step offset for a step test, clamped so home plus offset stays in bounds.
///
/// Returns `None` unless `delta_steps` is strictly positive.
pub fn get_axis_step_delta(
    axis: Axis,
    delta_steps: i32,
    rotation_degrees: f64,
    limits: &ActuatorLimits,
) -> Option<i32> {
    if delta_steps <= 0 {
        return None;
    }
    let home = limits.center();
    let signed = axis_sign(axis, rotation_degrees).saturating_mul(delta_steps);
    Some(limits.clamp(home.saturating_add(signed)).saturating_sub(home))
}

/// Outcome of perturbing one axis.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AxisStepTestResult {
    pub axis: Axis,
    pub delta_steps: i32,
    /// Signed displacement in the measurements' space.
    pub displacement: f64,
    pub per_step: Option<f64>,
    pub size_delta: f64,
}

/// Compare a perturbed measurement against the home measurement.
pub fn compute_axis_step_test_result(
    home: &BlobMeasurement,
    step: &BlobMeasurement,
    axis: Axis,
    delta_steps: i32,
) -> AxisStepTestResult {
    let displacement = step.get(axis) - home.get(axis);
    let per_step = if delta_steps > 0 {
        Some(displacement / delta_steps as f64)
    } else {
        None
    };
    AxisStepTestResult {
        axis,
        delta_steps,
        displacement,
        per_step,
        size_delta: step.size - home.size,
    }
}

/// Arithmetic mean, `None` when empty.
pub fn compute_average_size_delta(values: &[f64]) -> Option<f64> {
    if values.is_empty() {
        None
    } else {
        Some(values.iter().sum::<f64>() / values.len() as f64)
    }
}

/// Step count that produces `target_displacement` at the measured sensitivity.
///
/// `None` when the sensitivity is missing or below the noise floor, or when the
/// answer would exceed the actuator's range.
pub fn compute_alignment_target_steps(
    target_displacement: f64,
    per_step_sensitivity: Option<f64>,
    limits: &ActuatorLimits,
) -> Option<i32> {
    let sensitivity = per_step_sensitivity?;
    if !sensitivity.is_finite() || sensitivity.abs() < MIN_SENSITIVITY {
        return None;
    }
    let steps = (target_displacement / sensitivity).round();
    if !steps.is_finite() || steps.abs() > f64::from(limits.max_abs_steps()) {
        return None;
    }
    Some(steps as i32)
}

/// Per-axis sensitivity, pattern units per step.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct StepToDisplacement {
    pub x: Option<f64>,
    pub y: Option<f64>,
}

impl StepToDisplacement {
    pub fn get(&self, axis: Axis) -> Option<f64> {
        match axis {
            Axis::X => self.x,
            Axis::Y => self.y,
        }
    }

    /// Whether both axes carry a sensitivity above the noise floor.
    pub fn is_usable(&self) -> bool {
        Axis::BOTH
            .iter()
            .all(|&axis| matches!(self.get(axis), Some(s) if s.abs() >= MIN_SENSITIVITY))
    }
}

/// Both axis tests merged.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CombinedStepTest {
    pub step_to_displacement: StepToDisplacement,
    pub size_delta_at_step_test: Option<f64>,
}

pub fn combine_step_test_results(
    x: Option<&AxisStepTestResult>,
    y: Option<&AxisStepTestResult>,
) -> CombinedStepTest {
    let size_deltas: Vec<f64> = [x, y].iter().flatten().map(|r| r.size_delta).collect();
    CombinedStepTest {
        step_to_displacement: StepToDisplacement {
            x: x.and_then(|r| r.per_step),
            y: y.and_then(|r| r.per_step),
        },
        size_delta_at_step_test: compute_average_size_delta(&size_deltas),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coords::CoordinateSpace;

    fn blob(x: f64, y: f64, size: f64) -> BlobMeasurement {
        BlobMeasurement::new(x, y, size, 1.0, CoordinateSpace::Pattern)
    }

    #[test]
    fn test_axis_step_delta_signs() {
        let limits = ActuatorLimits::default();
        assert_eq!(get_axis_step_delta(Axis::X, 100, 0.0, &limits), Some(-100));
        assert_eq!(get_axis_step_delta(Axis::Y, 100, 0.0, &limits), Some(100));
        assert_eq!(get_axis_step_delta(Axis::X, 100, 180.0, &limits), Some(100));
        assert_eq!(get_axis_step_delta(Axis::Y, 100, 180.0, &limits), Some(-100));
    }

    #[test]
    fn test_axis_step_delta_requires_positive_magnitude() {
        let limits = ActuatorLimits::default();
        for axis in Axis::BOTH {
            assert_eq!(get_axis_step_delta(axis, 0, 0.0, &limits), None);
            assert_eq!(get_axis_step_delta(axis, -5, 180.0, &limits), None);
        }
    }

    #[test]
    fn test_axis_step_delta_clamps_to_limits() {
        let limits = ActuatorLimits::new(-50, 50);
        assert_eq!(get_axis_step_delta(Axis::X, 100, 0.0, &limits), Some(-50));
        assert_eq!(get_axis_step_delta(Axis::Y, 100, 0.0, &limits), Some(50));
    }

    #[test]
    fn test_extreme_limits_do_not_overflow() {
        let full = ActuatorLimits::new(i32::MIN, i32::MAX);
        assert_eq!(full.center(), -1);
        assert_eq!(full.max_abs_steps(), 1 << 31);
        assert_eq!(get_axis_step_delta(Axis::Y, 100, 0.0, &full), Some(100));
        assert_eq!(get_axis_step_delta(Axis::Y, i32::MAX, 0.0, &full), Some(i32::MAX));
        assert_eq!(get_axis_step_delta(Axis::X, i32::MAX, 0.0, &full), Some(-i32::MAX));

        let lower = ActuatorLimits::new(i32::MIN, 0);
        assert_eq!(lower.center(), -(1 << 30));
        assert_eq!(compute_alignment_target_steps(-3.0e9, Some(1.0), &full), None);
        assert_eq!(compute_alignment_target_steps(-2.0e9, Some(1.0), &full), Some(-2_000_000_000));
    }

    #[test]
    fn test_axis_sign_snaps_rotation() {
        assert_eq!(axis_sign(Axis::X, 10.0), -1);
        assert_eq!(axis_sign(Axis::X, 170.0), 1);
        assert_eq!(axis_sign(Axis::X, 360.0), -1);
        assert_eq!(axis_sign(Axis::Y, -180.0), -1);
    }

    #[test]
    fn test_step_test_result() {
        let home = blob(0.10, 0.20, 0.05);
        let step = blob(0.08, 0.20, 0.06);
        let result = compute_axis_step_test_result(&home, &step, Axis::X, 100);
        assert!((result.displacement + 0.02).abs() < 1e-12);
        assert!((result.per_step.unwrap() + 0.0002).abs() < 1e-12);
        assert!((result.size_delta - 0.01).abs() < 1e-12);

        let untested = compute_axis_step_test_result(&home, &step, Axis::Y, 0);
        assert_eq!(untested.per_step, None);
    }

    #[test]
    fn test_average_size_delta() {
        assert_eq!(compute_average_size_delta(&[]), None);
        assert_eq!(compute_average_size_delta(&[1.0, 2.0, 6.0]), Some(3.0));
    }

    #[test]
    fn test_alignment_target_steps() {
        let limits = ActuatorLimits::default();
        assert_eq!(compute_alignment_target_steps(0.105, Some(0.001), &limits), Some(105));
        assert_eq!(compute_alignment_target_steps(-0.105, Some(0.001), &limits), Some(-105));
        assert_eq!(compute_alignment_target_steps(0.1, None, &limits), None);
        assert_eq!(compute_alignment_target_steps(0.1, Some(0.0), &limits), None);
        assert_eq!(compute_alignment_target_steps(0.1, Some(5e-7), &limits), None);
        assert_eq!(compute_alignment_target_steps(1e10, Some(0.001), &limits), None);
    }

    #[test]
    fn test_combine_averages_present_axes() {
        let x = AxisStepTestResult {
            axis: Axis::X,
            delta_steps: 100,
            displacement: 0.1,
            per_step: Some(0.001),
            size_delta: 0.02,
        };
        let y = AxisStepTestResult {
            axis: Axis::Y,
            delta_steps: 100,
            displacement: 0.2,
            per_step: Some(0.002),
            size_delta: 0.04,
        };
        let both = combine_step_test_results(Some(&x), Some(&y));
        assert!((both.size_delta_at_step_test.unwrap() - 0.03).abs() < 1e-12);
        assert_eq!(both.step_to_displacement.x, Some(0.001));
        assert_eq!(both.step_to_displacement.y, Some(0.002));
        assert!(both.step_to_displacement.is_usable());

        let only_y = combine_step_test_results(None, Some(&y));
        assert_eq!(only_y.size_delta_at_step_test, Some(0.04));
        assert!(!only_y.step_to_displacement.is_usable());

        let neither = combine_step_test_results(None, None);
        assert_eq!(neither.size_delta_at_step_test, None);
    }
}
