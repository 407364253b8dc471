//! Runner and per-tile state published to observers.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::config::RunMode;
use super::summary::CalibrationRunSummary;
use crate::coords::Point2;
use crate::grid::{Tile, TileAssignment};
use crate::measurement::BlobMeasurement;
use crate::step_test::{AxisStepTestResult, StepToDisplacement};

/// Tile status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TileStatus {
    #[default]
    Pending,
    InProgress,
    /// Both axes produced usable sensitivities.
    Completed,
    /// Measured, but at least one axis is unusable for alignment or the
    /// alignment pass could not finish.
    Partial,
    /// Alignment ran out of iterations.
    MaxIterations,
    Skipped,
    Error,
}

impl TileStatus {
    /// Whether the tile produced a home measurement and sensitivities.
    pub fn is_measured(&self) -> bool {
        matches!(
            self,
            TileStatus::Completed | TileStatus::Partial | TileStatus::MaxIterations
        )
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, TileStatus::Pending | TileStatus::InProgress)
    }
}

/// The phase a tile is currently in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TilePhase {
    Home,
    Baseline,
    StepX,
    StepY,
    Align,
}

/// Runner lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunnerPhase {
    #[default]
    Idle,
    Running,
    Completed,
    Error,
    Aborted,
}

impl RunnerPhase {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            RunnerPhase::Completed | RunnerPhase::Error | RunnerPhase::Aborted
        )
    }
}

/// Signed actuator offsets from home, per axis.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct AxisSteps {
    pub x: i32,
    pub y: i32,
}

/// Metrics accumulated as a tile's phases complete.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TileMetrics {
    /// Baseline measurement, pattern space.
    pub home: Option<BlobMeasurement>,
    /// `home - ideal_target`.
    pub home_offset: Option<Point2>,
    pub ideal_target: Option<Point2>,
    pub step_to_displacement: StepToDisplacement,
    pub size_delta_at_step_test: Option<f64>,
    pub step_tests: Vec<AxisStepTestResult>,
    pub alignment_steps: Option<AxisSteps>,
    pub alignment_residual: Option<Point2>,
    /// Hardware failure that stopped the alignment pass for this tile.
    /// The measurements above stay valid.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub alignment_error: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TileRunState {
    pub tile: Tile,
    pub key: String,
    pub assignment: TileAssignment,
    pub status: TileStatus,
    pub phase: Option<TilePhase>,
    pub metrics: Option<TileMetrics>,
    pub error: Option<String>,
}

impl TileRunState {
    pub fn new(tile: Tile, assignment: TileAssignment) -> Self {
        Self {
            tile,
            key: tile.key(),
            assignment,
            status: TileStatus::Pending,
            phase: None,
            metrics: None,
            error: None,
        }
    }
}

/// Aggregate tile counts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct RunProgress {
    pub total: usize,
    pub completed: usize,
    pub failed: usize,
    pub skipped: usize,
}

impl RunProgress {
    pub fn from_tiles(tiles: &[TileRunState]) -> Self {
        let mut progress = RunProgress {
            total: tiles.len(),
            ..Default::default()
        };
        for tile in tiles {
            match tile.status {
                s if s.is_measured() => progress.completed += 1,
                TileStatus::Error => progress.failed += 1,
                TileStatus::Skipped => progress.skipped += 1,
                _ => {}
            }
        }
        progress
    }

    /// Tiles that reached a terminal status.
    pub fn resolved(&self) -> usize {
        self.completed + self.failed + self.skipped
    }
}

/// Full runner snapshot. Observers receive a fresh copy on every change.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CalibrationRunnerState {
    pub phase: RunnerPhase,
    pub mode: RunMode,
    /// Row-major.
    pub tiles: Vec<TileRunState>,
    pub active_tile: Option<String>,
    /// Set while a step-mode runner waits for `advance_step`.
    pub awaiting_advance: bool,
    /// Step-mode pauses so far; tells consecutive pauses apart.
    pub checkpoints: u64,
    pub progress: RunProgress,
    pub summary: Option<CalibrationRunSummary>,
    pub error: Option<String>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl CalibrationRunnerState {
    pub fn tile(&self, key: &str) -> Option<&TileRunState> {
        self.tiles.iter().find(|t| t.key == key)
    }

    pub(crate) fn tile_mut(&mut self, key: &str) -> Option<&mut TileRunState> {
        self.tiles.iter_mut().find(|t| t.key == key)
    }

    pub fn is_terminal(&self) -> bool {
        self.phase.is_terminal()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::grid::MotorRef;

    fn tile_state(col: u32, status: TileStatus) -> TileRunState {
        let assignment = TileAssignment::new(MotorRef::new("m", 0), MotorRef::new("m", 1));
        TileRunState {
            status,
            ..TileRunState::new(Tile::new(0, col), assignment)
        }
    }

    #[test]
    fn test_progress_counts() {
        let tiles = vec![
            tile_state(0, TileStatus::Completed),
            tile_state(1, TileStatus::Partial),
            tile_state(2, TileStatus::MaxIterations),
            tile_state(3, TileStatus::Error),
            tile_state(4, TileStatus::Skipped),
            tile_state(5, TileStatus::Pending),
            tile_state(6, TileStatus::InProgress),
        ];
        let progress = RunProgress::from_tiles(&tiles);
        assert_eq!(
            progress,
            RunProgress {
                total: 7,
                completed: 3,
                failed: 1,
                skipped: 1
            }
        );
        assert_eq!(progress.resolved(), 5);
    }

    #[test]
    fn test_status_serializes_kebab_case() {
        let json = serde_json::to_string(&TileStatus::MaxIterations).unwrap();
        assert_eq!(json, "\"max-iterations\"");
        let json = serde_json::to_string(&TileStatus::InProgress).unwrap();
        assert_eq!(json, "\"in-progress\"");
    }
}
