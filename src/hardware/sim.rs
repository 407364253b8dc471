//! Deterministic in-process rig implementing both collaborator traits.
//!
//! Each tile reflects a blob whose camera position moves linearly with its
//! two actuators. Only the tile whose actuator moved last is lit, so a
//! capture always reports that tile.

use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use super::{CaptureSource, Completion, HardwareError, MotorController, MoveCommand};
use crate::coords::CoordinateSpace;
use crate::grid::{GridConfig, MotorRef, Tile, TileAssignment};
use crate::measurement::BlobMeasurement;
use crate::step_test::ActuatorLimits;

/// Motors per simulated controller board.
const MOTORS_PER_BOARD: usize = 8;

/// Optical model of one simulated tile.
#[derive(Debug, Clone, PartialEq)]
pub struct SimulatedTile {
    pub assignment: TileAssignment,
    /// Blob center with both actuators at home, camera pixels.
    pub home_px: (f64, f64),
    /// Camera pixels moved per actuator step, per axis.
    pub px_per_step: (f64, f64),
    pub blob_size_px: f64,
    /// Blob growth per step away from home.
    pub defocus_px_per_step: f64,
}

#[derive(Debug, Default)]
struct SimState {
    positions: HashMap<MotorRef, i32>,
    active: Option<String>,
    fail_capture: HashSet<String>,
    fail_motor: HashSet<String>,
    /// Captures left to fail with a transport error.
    glitches: usize,
    captures: usize,
}

/// Simulated mirror array and camera.
#[derive(Debug)]
pub struct SimulatedRig {
    tiles: BTreeMap<String, SimulatedTile>,
    owners: HashMap<MotorRef, String>,
    limits: ActuatorLimits,
    latency: Duration,
    state: Mutex<SimState>,
}

impl SimulatedRig {
    pub fn new(tiles: BTreeMap<String, SimulatedTile>, limits: ActuatorLimits) -> Self {
        let mut owners = HashMap::new();
        let mut positions = HashMap::new();
        for (key, tile) in &tiles {
            for motor in [&tile.assignment.x, &tile.assignment.y] {
                owners.insert(motor.clone(), key.clone());
                positions.insert(motor.clone(), limits.center());
            }
        }
        Self {
            tiles,
            owners,
            limits,
            latency: Duration::ZERO,
            state: Mutex::new(SimState {
                positions,
                ..SimState::default()
            }),
        }
    }

    /// A `rows` x `cols` array viewed by a `width` x `height` camera, plus its grid config.
    ///
    /// Tiles sit on a regular pitch around the image center with a small
    /// deterministic misalignment each.
    pub fn grid(rows: u32, cols: u32, width: f64, height: f64) -> (Self, GridConfig) {
        let pitch = (width / (cols as f64 + 1.0)).min(height / (rows as f64 + 1.0));
        let origin_x = width / 2.0 - pitch * (cols as f64 - 1.0) / 2.0;
        let origin_y = height / 2.0 - pitch * (rows as f64 - 1.0) / 2.0;

        let mut config = GridConfig::new(rows, cols);
        let mut tiles = BTreeMap::new();
        for (index, tile) in config.tiles().into_iter().enumerate() {
            let mac = format!("sim-{:02}", index * 2 / MOTORS_PER_BOARD);
            let base = ((index * 2) % MOTORS_PER_BOARD) as u8;
            let assignment =
                TileAssignment::new(MotorRef::new(mac.clone(), base), MotorRef::new(mac, base + 1));

            let jitter = |seed: u32| ((seed % 5) as f64 - 2.0) * pitch * 0.04;
            let home_px = (
                origin_x + tile.col as f64 * pitch + jitter(tile.row * 7 + tile.col * 3),
                origin_y + tile.row as f64 * pitch + jitter(tile.row * 3 + tile.col * 11 + 1),
            );

            config.assignments.insert(tile.key(), assignment.clone());
            tiles.insert(
                tile.key(),
                SimulatedTile {
                    assignment,
                    home_px,
                    // X is mounted mirrored.
                    px_per_step: (-0.5, 0.5),
                    blob_size_px: pitch * 0.9,
                    defocus_px_per_step: 0.01,
                },
            );
        }

        (Self::new(tiles, ActuatorLimits::default()), config)
    }

    /// Delay every command and capture by `latency`.
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    /// Override the blob diameter of one tile.
    pub fn with_blob_size(mut self, tile: Tile, blob_size_px: f64) -> Self {
        if let Some(sim) = self.tiles.get_mut(&tile.key()) {
            sim.blob_size_px = blob_size_px;
        }
        self
    }

    /// Make captures of this tile report no blob.
    pub fn fail_capture_for(&self, tile: Tile) {
        self.lock().fail_capture.insert(tile.key());
    }

    /// Make the next `count` captures fail outright, whatever tile is lit.
    pub fn fail_next_captures(&self, count: usize) {
        self.lock().glitches = count;
    }

    /// Make every command to this controller fail.
    pub fn fail_motor_for(&self, mac: &str) {
        self.lock().fail_motor.insert(mac.to_string());
    }

    /// Current position of a motor, if it exists.
    pub fn position(&self, motor: &MotorRef) -> Option<i32> {
        self.lock().positions.get(motor).copied()
    }

    /// Number of captures served so far.
    pub fn captures(&self) -> usize {
        self.lock().captures
    }

    pub fn tile(&self, tile: Tile) -> Option<&SimulatedTile> {
        self.tiles.get(&tile.key())
    }

    fn lock(&self) -> MutexGuard<'_, SimState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    async fn settle(&self) {
        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }
    }

    fn set_position(&self, motor: MotorRef, position: i32) -> Result<Completion, HardwareError> {
        let mut state = self.lock();
        if state.fail_motor.contains(&motor.mac) {
            return Err(HardwareError::CommandFailed(format!("{} not responding", motor.mac)));
        }
        let Some(owner) = self.owners.get(&motor) else {
            return Err(HardwareError::CommandFailed(format!("unknown motor {}", motor)));
        };
        if !self.limits.contains(position) {
            return Err(HardwareError::OutOfRange {
                motor: motor.to_string(),
                position,
            });
        }
        tracing::debug!("sim: {} -> {}", motor, position);
        state.active = Some(owner.clone());
        state.positions.insert(motor.clone(), position);
        Ok(Completion {
            mac: motor.mac,
            motor_id: Some(motor.motor_index),
            position_steps: Some(position),
        })
    }
}

#[async_trait]
impl CaptureSource for SimulatedRig {
    async fn capture_measurement(&self) -> Result<Option<BlobMeasurement>, HardwareError> {
        self.settle().await;
        let mut state = self.lock();
        state.captures += 1;
        if state.glitches > 0 {
            state.glitches -= 1;
            return Err(HardwareError::CaptureFailed("frame dropped".to_string()));
        }

        let Some(key) = state.active.clone() else {
            return Ok(None);
        };
        if state.fail_capture.contains(&key) {
            return Ok(None);
        }
        let Some(sim) = self.tiles.get(&key) else {
            return Ok(None);
        };

        let center = i64::from(self.limits.center());
        let offset = |motor: &MotorRef| {
            let position = state.positions.get(motor).map_or(center, |p| i64::from(*p));
            (position - center) as f64
        };
        let dx = offset(&sim.assignment.x);
        let dy = offset(&sim.assignment.y);

        Ok(Some(BlobMeasurement::new(
            sim.home_px.0 + dx * sim.px_per_step.0,
            sim.home_px.1 + dy * sim.px_per_step.1,
            sim.blob_size_px + (dx.abs() + dy.abs()) * sim.defocus_px_per_step,
            1.0,
            CoordinateSpace::Camera,
        )))
    }
}

#[async_trait]
impl MotorController for SimulatedRig {
    async fn move_motor(&self, cmd: MoveCommand) -> Result<Completion, HardwareError> {
        self.settle().await;
        self.set_position(MotorRef::new(cmd.mac, cmd.motor_id), cmd.position_steps)
    }

    async fn home_motor(&self, mac: &str, motor_id: u8) -> Result<Completion, HardwareError> {
        self.settle().await;
        self.set_position(MotorRef::new(mac, motor_id), self.limits.center())
    }

    async fn nudge_motor(
        &self,
        mac: &str,
        motor_id: u8,
        delta_steps: i32,
    ) -> Result<Completion, HardwareError> {
        self.settle().await;
        let motor = MotorRef::new(mac, motor_id);
        let current = self.position(&motor).unwrap_or(self.limits.center());
        self.set_position(motor, current.saturating_add(delta_steps))
    }

    async fn home_all(&self, macs: &[String]) -> Result<Vec<Completion>, HardwareError> {
        self.settle().await;
        let mut state = self.lock();
        if let Some(mac) = macs.iter().find(|mac| state.fail_motor.contains(*mac)) {
            return Err(HardwareError::CommandFailed(format!("{} not responding", mac)));
        }
        let center = self.limits.center();
        let mut completions = Vec::new();
        for motor in self.owners.keys().filter(|m| macs.contains(&m.mac)) {
            state.positions.insert(motor.clone(), center);
            completions.push(Completion {
                mac: motor.mac.clone(),
                motor_id: Some(motor.motor_index),
                position_steps: Some(center),
            });
        }
        state.active = None;
        Ok(completions)
    }
}
