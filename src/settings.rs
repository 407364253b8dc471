//! Persisted calibration settings.
//! Stored in the platform-specific config directory via `directories::ProjectDirs`.

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;

use crate::calibration::{AlignmentSettings, RetryPolicy, RunMode, RunnerConfig};
use crate::coords::Roi;
use crate::stats::OutlierOptions;
use crate::step_test::{ActuatorLimits, StepTestSettings, DEFAULT_DELTA_STEPS};

/// Errors from persisting settings.
#[derive(Error, Debug)]
pub enum SettingsError {
    #[error("Cannot determine config directory")]
    NoConfigDir,
    #[error("Settings I/O failed: {0}")]
    Io(#[from] std::io::Error),
    #[error("Failed to serialize settings: {0}")]
    Json(#[from] serde_json::Error),
}

/// Calibration settings that can be saved and loaded.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CalibrationSettings {
    /// Grid rows
    pub grid_rows: u32,
    /// Grid columns
    pub grid_cols: u32,
    /// Camera image width in pixels
    pub image_width: f64,
    /// Camera image height in pixels
    pub image_height: f64,
    /// Region of interest in viewport units (optional)
    pub roi: Option<Roi>,
    /// Drive mode ("auto" or "step")
    pub mode: String,
    /// Step-test perturbation in actuator steps
    pub delta_steps: i32,
    /// Array mount rotation in degrees
    pub rotation_degrees: f64,
    /// Lower actuator bound in steps
    pub min_steps: i32,
    /// Upper actuator bound in steps
    pub max_steps: i32,
    /// Capture timeout in milliseconds
    pub capture_timeout_ms: u64,
    /// Motor command timeout in milliseconds
    pub motor_timeout_ms: u64,
    /// Capture attempts per measurement
    pub capture_attempts: u32,
    /// Attempts per absolute move
    pub motor_attempts: u32,
    /// Delay between attempts in milliseconds
    pub retry_delay_ms: u64,
    /// Outlier threshold in normalized MADs
    pub mad_threshold: f64,
    /// Gap between tiles relative to the tile footprint
    pub gap_ratio: f64,
    /// Alignment iterations per tile (0 disables alignment)
    pub alignment_iterations: u32,
    /// Alignment tolerance in pattern units
    pub alignment_tolerance: f64,
    /// Move speed in steps per second (0 = controller default)
    pub move_speed_sps: u32,
    /// Home all controllers before the first tile
    pub home_all_on_start: bool,
    /// Where the CLI writes the run summary
    pub summary_path: String,
}

impl Default for CalibrationSettings {
    fn default() -> Self {
        let limits = ActuatorLimits::default();
        let retry = RetryPolicy::default();
        let alignment = AlignmentSettings::default();
        Self {
            grid_rows: 2,
            grid_cols: 3,
            image_width: 1920.0,
            image_height: 1080.0,
            roi: None,
            mode: "auto".to_string(),
            delta_steps: DEFAULT_DELTA_STEPS,
            rotation_degrees: 0.0,
            min_steps: limits.min_steps,
            max_steps: limits.max_steps,
            capture_timeout_ms: 5000,
            motor_timeout_ms: 10_000,
            capture_attempts: retry.capture_attempts,
            motor_attempts: retry.motor_attempts,
            retry_delay_ms: retry.retry_delay_ms,
            mad_threshold: OutlierOptions::default().mad_threshold,
            gap_ratio: 0.0,
            alignment_iterations: alignment.max_iterations,
            alignment_tolerance: alignment.tolerance,
            move_speed_sps: 0,
            home_all_on_start: true,
            summary_path: "calibration_summary.json".to_string(),
        }
    }
}

impl CalibrationSettings {
    /// Get the config directory path.
    pub fn config_dir() -> Option<PathBuf> {
        directories::ProjectDirs::from("com", "moderras", "tile-calibration")
            .map(|dirs| dirs.config_dir().to_path_buf())
    }

    /// Get the settings file path.
    pub fn settings_path() -> Option<PathBuf> {
        Self::config_dir().map(|dir| dir.join("settings.json"))
    }

    /// Load settings from the config file, falling back to defaults.
    pub fn load() -> Self {
        match Self::settings_path() {
            Some(path) => Self::load_from(&path),
            None => Self::default(),
        }
    }

    /// Load settings from `path`. Missing or unreadable files yield defaults.
    pub fn load_from(path: &Path) -> Self {
        let loaded: Self = fs::read_to_string(path)
            .ok()
            .and_then(|content| serde_json::from_str(&content).ok())
            .unwrap_or_default();
        loaded.backfilled()
    }

    /// Replace zero or empty fields, as written by older config files, with defaults.
    fn backfilled(mut self) -> Self {
        let defaults = Self::default();
        if self.grid_rows == 0 {
            self.grid_rows = defaults.grid_rows;
        }
        if self.grid_cols == 0 {
            self.grid_cols = defaults.grid_cols;
        }
        if self.image_width <= 0.0 {
            self.image_width = defaults.image_width;
        }
        if self.image_height <= 0.0 {
            self.image_height = defaults.image_height;
        }
        if self.mode.is_empty() {
            self.mode = defaults.mode;
        }
        if self.min_steps >= self.max_steps {
            self.min_steps = defaults.min_steps;
            self.max_steps = defaults.max_steps;
        }
        if self.capture_attempts == 0 {
            self.capture_attempts = defaults.capture_attempts;
        }
        if self.motor_attempts == 0 {
            self.motor_attempts = defaults.motor_attempts;
        }
        if self.mad_threshold <= 0.0 {
            self.mad_threshold = defaults.mad_threshold;
        }
        if self.alignment_tolerance <= 0.0 {
            self.alignment_tolerance = defaults.alignment_tolerance;
        }
        if self.summary_path.is_empty() {
            self.summary_path = defaults.summary_path;
        }
        self
    }

    /// Save settings to the config file.
    pub fn save(&self) -> Result<PathBuf, SettingsError> {
        let path = Self::settings_path().ok_or(SettingsError::NoConfigDir)?;
        self.save_to(&path)?;
        Ok(path)
    }

    /// Save settings to `path`, creating parent directories as needed.
    pub fn save_to(&self, path: &Path) -> Result<(), SettingsError> {
        if let Some(dir) = path.parent() {
            fs::create_dir_all(dir)?;
        }
        let content = serde_json::to_string_pretty(self)?;
        fs::write(path, content)?;
        Ok(())
    }

    pub fn run_mode(&self) -> RunMode {
        match self.mode.to_lowercase().as_str() {
            "step" => RunMode::Step,
            _ => RunMode::Auto,
        }
    }

    /// Runner configuration described by these settings.
    pub fn to_runner_config(&self) -> RunnerConfig {
        let step_test = StepTestSettings::default()
            .with_delta_steps(self.delta_steps)
            .with_rotation(self.rotation_degrees)
            .with_limits(ActuatorLimits::new(self.min_steps, self.max_steps));

        RunnerConfig::default()
            .with_mode(self.run_mode())
            .with_image_size(self.image_width, self.image_height)
            .with_roi(self.roi)
            .with_step_test(step_test)
            .with_timeouts(self.capture_timeout_ms, self.motor_timeout_ms)
            .with_retry(RetryPolicy {
                capture_attempts: self.capture_attempts,
                motor_attempts: self.motor_attempts,
                retry_delay_ms: self.retry_delay_ms,
            })
            .with_outliers(OutlierOptions::default().with_threshold(self.mad_threshold))
            .with_gap_ratio(self.gap_ratio)
            .with_alignment(AlignmentSettings {
                max_iterations: self.alignment_iterations,
                tolerance: self.alignment_tolerance,
            })
            .with_move_speed((self.move_speed_sps > 0).then_some(self.move_speed_sps))
            .with_home_all_on_start(self.home_all_on_start)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    fn temp_settings_path() -> PathBuf {
        std::env::temp_dir()
            .join(format!("tile-calibration-{}", Uuid::new_v4()))
            .join("settings.json")
    }

    #[test]
    fn test_save_and_load() {
        let path = temp_settings_path();
        let settings = CalibrationSettings {
            grid_rows: 4,
            mode: "step".to_string(),
            roi: Some(Roi::new(0.1, 0.2, 0.5, 0.5)),
            ..Default::default()
        };

        settings.save_to(&path).unwrap();
        let loaded = CalibrationSettings::load_from(&path);

        assert_eq!(loaded.grid_rows, 4);
        assert_eq!(loaded.run_mode(), RunMode::Step);
        assert_eq!(loaded.roi, settings.roi);
        let _ = fs::remove_dir_all(path.parent().unwrap());
    }

    #[test]
    fn test_missing_file_yields_defaults() {
        let loaded = CalibrationSettings::load_from(&temp_settings_path());
        assert_eq!(loaded, CalibrationSettings::default());
    }

    #[test]
    fn test_backfill_older_file() {
        let path = temp_settings_path();
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(&path, r#"{"grid_rows": 0, "grid_cols": 5, "mode": "", "capture_attempts": 0}"#)
            .unwrap();

        let loaded = CalibrationSettings::load_from(&path);
        let defaults = CalibrationSettings::default();

        assert_eq!(loaded.grid_rows, defaults.grid_rows);
        assert_eq!(loaded.grid_cols, 5);
        assert_eq!(loaded.mode, "auto");
        assert_eq!(loaded.capture_attempts, defaults.capture_attempts);
        let _ = fs::remove_dir_all(path.parent().unwrap());
    }

    #[test]
    fn test_to_runner_config() {
        let settings = CalibrationSettings {
            image_width: 640.0,
            image_height: 480.0,
            delta_steps: 50,
            rotation_degrees: 180.0,
            alignment_iterations: 4,
            move_speed_sps: 0,
            ..Default::default()
        };
        let config = settings.to_runner_config();

        assert_eq!(config.mode, RunMode::Auto);
        assert_eq!(config.context.width, 640.0);
        assert_eq!(config.step_test.delta_steps, 50);
        assert_eq!(config.step_test.rotation_degrees, 180.0);
        assert_eq!(config.alignment.max_iterations, 4);
        assert_eq!(config.move_speed_sps, None);
        assert_eq!(config.retry.capture_attempts, 2);
    }
}
