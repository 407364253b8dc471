//! Boundary to the camera capture and motor-command collaborators.
//!
//! The runner only sees these traits. Real transports and detectors live
//! outside this crate; [`SimulatedRig`] implements both for demos and tests.

mod sim;

use async_trait::async_trait;
use futures::future::join_all;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::grid::MotorRef;
use crate::measurement::BlobMeasurement;

pub use sim::{SimulatedRig, SimulatedTile};

/// Capture and actuator failures.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum HardwareError {
    #[error("Capture failed: {0}")]
    CaptureFailed(String),
    #[error("No blob detected")]
    NoBlob,
    #[error("Motor {0} is busy")]
    Busy(String),
    #[error("Position {position} out of range for motor {motor}")]
    OutOfRange { motor: String, position: i32 },
    #[error("Motor command failed: {0}")]
    CommandFailed(String),
    #[error("Timed out after {0}ms")]
    Timeout(u64),
}

/// Absolute move request for one actuator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MoveCommand {
    pub mac: String,
    pub motor_id: u8,
    pub position_steps: i32,
    pub speed_sps: Option<u32>,
}

impl MoveCommand {
    pub fn to(motor: &MotorRef, position_steps: i32) -> Self {
        Self {
            mac: motor.mac.clone(),
            motor_id: motor.motor_index,
            position_steps,
            speed_sps: None,
        }
    }

    pub fn with_speed(mut self, speed_sps: Option<u32>) -> Self {
        self.speed_sps = speed_sps;
        self
    }
}

/// Acknowledgement that a motor command finished.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Completion {
    pub mac: String,
    pub motor_id: Option<u8>,
    /// Final position, when the controller reports one.
    pub position_steps: Option<i32>,
}

/// Source of blob measurements.
///
/// `Ok(None)` means the detector found nothing; callers treat it like an error.
#[async_trait]
pub trait CaptureSource: Send + Sync {
    async fn capture_measurement(&self) -> Result<Option<BlobMeasurement>, HardwareError>;
}

/// Motor command transport.
#[async_trait]
pub trait MotorController: Send + Sync {
    /// Move to an absolute position.
    async fn move_motor(&self, cmd: MoveCommand) -> Result<Completion, HardwareError>;

    /// Run the homing routine of one motor.
    async fn home_motor(&self, mac: &str, motor_id: u8) -> Result<Completion, HardwareError>;

    /// Move relative to the current position.
    async fn nudge_motor(
        &self,
        mac: &str,
        motor_id: u8,
        delta_steps: i32,
    ) -> Result<Completion, HardwareError>;

    /// Home every motor on the given controllers.
    async fn home_all(&self, macs: &[String]) -> Result<Vec<Completion>, HardwareError>;
}

/// Dispatch independent moves concurrently and wait for all of them.
///
/// One failure does not stop the rest; results come back in command order.
pub async fn dispatch_moves(
    motors: &dyn MotorController,
    commands: Vec<MoveCommand>,
) -> Vec<Result<Completion, HardwareError>> {
    join_all(commands.into_iter().map(|cmd| motors.move_motor(cmd))).await
}
