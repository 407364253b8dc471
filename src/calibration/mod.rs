//! Tile-by-tile calibration of a mirror array.
//!
//! [`CalibrationRunner`] walks the grid in row-major order. Each tile is
//! homed, captured at rest and step-tested on both axes; the final pass
//! rejects blob-size outliers, derives the [`GridBlueprint`](crate::grid::GridBlueprint)
//! and fills every tile's ideal target.

mod config;
mod runner;
mod state;
mod summary;

pub use config::{AlignmentSettings, RetryPolicy, RunMode, RunnerConfig};
pub use runner::{CalibrationRunner, RunnerError, RunnerHandle, StateCallback};
pub use state::{
    AxisSteps, CalibrationRunnerState, RunProgress, RunnerPhase, TileMetrics, TilePhase,
    TileRunState, TileStatus,
};
pub use summary::{CalibrationRunSummary, GridSize, OutlierAnalysis, TileSummary};
