//! Runner configuration.

use serde::{Deserialize, Serialize};

use crate::coords::{ConvertContext, Roi};
use crate::stats::OutlierOptions;
use crate::step_test::StepTestSettings;

/// How the runner advances between phases.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunMode {
    /// Advance through every tile and phase without intervention.
    #[default]
    Auto,
    /// Suspend after each phase until `advance_step` is called.
    Step,
}

/// Attempts per hardware operation before a tile is marked as failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RetryPolicy {
    pub capture_attempts: u32,
    pub motor_attempts: u32,
    pub retry_delay_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            capture_attempts: 2,
            motor_attempts: 1,
            retry_delay_ms: 200,
        }
    }
}

/// Closed-loop alignment after the measurement pass. Disabled with zero iterations.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AlignmentSettings {
    pub max_iterations: u32,
    /// Accepted residual per axis, pattern units.
    pub tolerance: f64,
}

impl Default for AlignmentSettings {
    fn default() -> Self {
        Self {
            max_iterations: 0,
            tolerance: 0.002,
        }
    }
}

/// Everything the runner needs besides the grid and the collaborators.
#[derive(Debug, Clone, PartialEq)]
pub struct RunnerConfig {
    pub mode: RunMode,
    pub context: ConvertContext,
    pub step_test: StepTestSettings,
    pub capture_timeout_ms: u64,
    pub motor_timeout_ms: u64,
    pub retry: RetryPolicy,
    pub outliers: OutlierOptions,
    /// Gap between tiles as a fraction of the tile footprint.
    pub gap_ratio: f64,
    pub alignment: AlignmentSettings,
    pub move_speed_sps: Option<u32>,
    /// Home every controller before the first tile.
    pub home_all_on_start: bool,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            mode: RunMode::Auto,
            context: ConvertContext::new(1920.0, 1080.0),
            step_test: StepTestSettings::default(),
            capture_timeout_ms: 5000,
            motor_timeout_ms: 10_000,
            retry: RetryPolicy::default(),
            outliers: OutlierOptions::default(),
            gap_ratio: 0.0,
            alignment: AlignmentSettings::default(),
            move_speed_sps: None,
            home_all_on_start: true,
        }
    }
}

impl RunnerConfig {
    pub fn with_mode(mut self, mode: RunMode) -> Self {
        self.mode = mode;
        self
    }

    pub fn with_image_size(mut self, width: f64, height: f64) -> Self {
        self.context = ConvertContext {
            width,
            height,
            ..self.context
        };
        self
    }

    pub fn with_roi(mut self, roi: Option<Roi>) -> Self {
        self.context.roi = roi;
        self
    }

    pub fn with_step_test(mut self, step_test: StepTestSettings) -> Self {
        self.step_test = step_test;
        self
    }

    pub fn with_timeouts(mut self, capture_ms: u64, motor_ms: u64) -> Self {
        self.capture_timeout_ms = capture_ms;
        self.motor_timeout_ms = motor_ms;
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_outliers(mut self, outliers: OutlierOptions) -> Self {
        self.outliers = outliers;
        self
    }

    pub fn with_gap_ratio(mut self, gap_ratio: f64) -> Self {
        self.gap_ratio = gap_ratio;
        self
    }

    pub fn with_alignment(mut self, alignment: AlignmentSettings) -> Self {
        self.alignment = alignment;
        self
    }

    pub fn with_move_speed(mut self, speed_sps: Option<u32>) -> Self {
        self.move_speed_sps = speed_sps;
        self
    }

    pub fn with_home_all_on_start(mut self, home_all: bool) -> Self {
        self.home_all_on_start = home_all;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_runner_config_default() {
        let config = RunnerConfig::default();
        assert_eq!(config.mode, RunMode::Auto);
        assert_eq!(config.retry.capture_attempts, 2);
        assert_eq!(config.alignment.max_iterations, 0);
        assert!(config.home_all_on_start);
    }

    #[test]
    fn test_runner_config_builder() {
        let config = RunnerConfig::default()
            .with_mode(RunMode::Step)
            .with_image_size(640.0, 480.0)
            .with_roi(Some(Roi::new(0.1, 0.1, 0.8, 0.8)))
            .with_timeouts(100, 200)
            .with_gap_ratio(0.1);

        assert_eq!(config.mode, RunMode::Step);
        assert_eq!(config.context.width, 640.0);
        assert!(config.context.roi.is_some());
        assert_eq!(config.motor_timeout_ms, 200);
        assert_eq!(config.gap_ratio, 0.1);
    }
}
