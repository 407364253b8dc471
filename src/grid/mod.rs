//! Tile grid model: identities, actuator mapping and the derived blueprint.

mod blueprint;
mod config;

pub use blueprint::{GridBlueprint, TileGap};
pub use config::{ConfigError, GridConfig, MotorRef, Tile, TileAssignment};
