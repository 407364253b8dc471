// Copyright 2025 ModerRAS
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! # Tile Calibration
//!
//! Calibration of a grid of motorized mirror tiles observed by a camera.
//!
//! Each tile reflects a light blob onto a projection surface. The runner
//! moves every tile's two actuators, measures where its blob lands and how
//! far it moves per actuator step, and derives the ideal tiled layout the
//! array should form.
//!
//! ## Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use tile_calibration::{CalibrationRunner, RunnerConfig, SimulatedRig};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let (rig, grid) = SimulatedRig::grid(2, 3, 1920.0, 1080.0);
//!     let rig = Arc::new(rig);
//!
//!     let config = RunnerConfig::default().with_image_size(1920.0, 1080.0);
//!     let runner = CalibrationRunner::new(grid, config, rig.clone(), rig)?;
//!     let state = runner.run().await;
//!
//!     if let Some(summary) = state.summary {
//!         println!("{}", summary.to_json()?);
//!     }
//!     Ok(())
//! }
//! ```

pub mod calibration;
pub mod coords;
pub mod grid;
pub mod hardware;
pub mod measurement;
pub mod settings;
pub mod stats;
pub mod step_test;

pub use calibration::{
    CalibrationRunSummary, CalibrationRunner, CalibrationRunnerState, RunMode, RunnerConfig,
    RunnerError, RunnerHandle, RunnerPhase, TileStatus,
};
pub use coords::{CoordinateSpace, Point2, Transformer};
pub use grid::{ConfigError, GridBlueprint, GridConfig, MotorRef, Tile, TileAssignment};
pub use hardware::{CaptureSource, HardwareError, MotorController, SimulatedRig};
pub use measurement::BlobMeasurement;
pub use settings::CalibrationSettings;
