//! Tile identities, actuator assignments and grid configuration.

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use thiserror::Error;

use crate::coords::Axis;

static TILE_KEY_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^\s*(\d+)\s*[-,]\s*(\d+)\s*$").expect("valid tile key regex"));

/// Configuration errors. Raised before a run starts.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("Invalid grid size: {rows}x{cols}")]
    InvalidGridSize { rows: u32, cols: u32 },
    #[error("Malformed tile key: {0}")]
    MalformedKey(String),
    #[error("Tile {0} has no actuator assignment")]
    MissingAssignment(String),
    #[error("Assignment for tile {0} lies outside the grid")]
    UnknownTile(String),
    #[error("Actuator {mac}#{motor_index} is assigned to both {first} and {second}")]
    DuplicateActuator {
        mac: String,
        motor_index: u8,
        first: String,
        second: String,
    },
}

/// One grid cell.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Tile {
    pub row: u32,
    pub col: u32,
}

impl Tile {
    pub fn new(row: u32, col: u32) -> Self {
        Self { row, col }
    }

    /// Canonical `"row-col"` key.
    pub fn key(&self) -> String {
        format!("{}-{}", self.row, self.col)
    }

    /// Parse `"row-col"` or `"row,col"`.
    pub fn parse_key(key: &str) -> Result<Self, ConfigError> {
        let malformed = || ConfigError::MalformedKey(key.to_string());
        let captures = TILE_KEY_RE.captures(key).ok_or_else(malformed)?;
        let row = captures[1].parse().map_err(|_| malformed())?;
        let col = captures[2].parse().map_err(|_| malformed())?;
        Ok(Self { row, col })
    }
}

impl fmt::Display for Tile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.row, self.col)
    }
}

/// Identity of a single actuator.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MotorRef {
    /// Node address of the controller board.
    pub mac: String,
    pub motor_index: u8,
}

impl MotorRef {
    pub fn new(mac: impl Into<String>, motor_index: u8) -> Self {
        Self {
            mac: mac.into(),
            motor_index,
        }
    }
}

impl fmt::Display for MotorRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.mac, self.motor_index)
    }
}

/// The X and Y actuators moving one tile.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TileAssignment {
    pub x: MotorRef,
    pub y: MotorRef,
}

impl TileAssignment {
    pub fn new(x: MotorRef, y: MotorRef) -> Self {
        Self { x, y }
    }

    pub fn motor(&self, axis: Axis) -> &MotorRef {
        match axis {
            Axis::X => &self.x,
            Axis::Y => &self.y,
        }
    }
}

/// Grid dimensions and the mirror-to-actuator mapping.
///
/// Immutable for a runner's lifetime; a change means a new runner.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GridConfig {
    pub rows: u32,
    pub cols: u32,
    /// Keyed by tile key; either key form is accepted on input.
    pub assignments: BTreeMap<String, TileAssignment>,
}

impl GridConfig {
    pub fn new(rows: u32, cols: u32) -> Self {
        Self {
            rows,
            cols,
            assignments: BTreeMap::new(),
        }
    }

    pub fn with_assignment(mut self, tile: Tile, assignment: TileAssignment) -> Self {
        self.assignments.insert(tile.key(), assignment);
        self
    }

    /// Tiles in row-major order.
    pub fn tiles(&self) -> Vec<Tile> {
        (0..self.rows)
            .flat_map(|row| (0..self.cols).map(move |col| Tile::new(row, col)))
            .collect()
    }

    /// Distinct controller addresses referenced by the mapping.
    pub fn macs(&self) -> Vec<String> {
        let mut macs: Vec<String> = self
            .assignments
            .values()
            .flat_map(|a| [a.x.mac.clone(), a.y.mac.clone()])
            .collect();
        macs.sort();
        macs.dedup();
        macs
    }

    /// Check the grid and resolve every tile's assignment.
    pub fn validate(&self) -> Result<BTreeMap<Tile, TileAssignment>, ConfigError> {
        if self.rows == 0 || self.cols == 0 {
            return Err(ConfigError::InvalidGridSize {
                rows: self.rows,
                cols: self.cols,
            });
        }

        let mut resolved = BTreeMap::new();
        for (key, assignment) in &self.assignments {
            let tile = Tile::parse_key(key)?;
            if tile.row >= self.rows || tile.col >= self.cols {
                return Err(ConfigError::UnknownTile(key.clone()));
            }
            resolved.insert(tile, assignment.clone());
        }

        let mut owners: BTreeMap<(String, u8), Tile> = BTreeMap::new();
        for tile in self.tiles() {
            let assignment = resolved
                .get(&tile)
                .ok_or_else(|| ConfigError::MissingAssignment(tile.key()))?;
            for axis in Axis::BOTH {
                let motor = assignment.motor(axis);
                let id = (motor.mac.clone(), motor.motor_index);
                if let Some(first) = owners.insert(id, tile) {
                    return Err(ConfigError::DuplicateActuator {
                        mac: motor.mac.clone(),
                        motor_index: motor.motor_index,
                        first: first.key(),
                        second: tile.key(),
                    });
                }
            }
        }

        Ok(resolved)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn assignment(mac: &str, base: u8) -> TileAssignment {
        TileAssignment::new(MotorRef::new(mac, base), MotorRef::new(mac, base + 1))
    }

    #[test]
    fn test_parse_key_forms() {
        assert_eq!(Tile::parse_key("2-3"), Ok(Tile::new(2, 3)));
        assert_eq!(Tile::parse_key("2,3"), Ok(Tile::new(2, 3)));
        assert_eq!(Tile::parse_key(" 10 , 0 "), Ok(Tile::new(10, 0)));
        assert!(Tile::parse_key("a-b").is_err());
        assert!(Tile::parse_key("1-2-3").is_err());
        assert_eq!(Tile::new(4, 7).key(), "4-7");
    }

    #[test]
    fn test_validate_resolves_both_key_forms() {
        let mut config = GridConfig::new(1, 2);
        config.assignments.insert("0,0".to_string(), assignment("aa", 0));
        config.assignments.insert("0-1".to_string(), assignment("aa", 2));
        let resolved = config.validate().unwrap();
        assert_eq!(resolved.len(), 2);
        assert_eq!(resolved[&Tile::new(0, 0)].y.motor_index, 1);
    }

    #[test]
    fn test_validate_rejects_bad_configs() {
        assert_eq!(
            GridConfig::new(0, 3).validate(),
            Err(ConfigError::InvalidGridSize { rows: 0, cols: 3 })
        );

        let missing = GridConfig::new(1, 2).with_assignment(Tile::new(0, 0), assignment("aa", 0));
        assert_eq!(missing.validate(), Err(ConfigError::MissingAssignment("0-1".into())));

        let outside = GridConfig::new(1, 1)
            .with_assignment(Tile::new(0, 0), assignment("aa", 0))
            .with_assignment(Tile::new(3, 0), assignment("aa", 2));
        assert_eq!(outside.validate(), Err(ConfigError::UnknownTile("3-0".into())));

        let shared = GridConfig::new(1, 2)
            .with_assignment(Tile::new(0, 0), assignment("aa", 0))
            .with_assignment(Tile::new(0, 1), assignment("aa", 1));
        assert!(matches!(shared.validate(), Err(ConfigError::DuplicateActuator { .. })));
    }

    #[test]
    fn test_tiles_row_major() {
        let config = GridConfig::new(2, 2);
        let keys: Vec<String> = config.tiles().iter().map(Tile::key).collect();
        assert_eq!(keys, vec!["0-0", "0-1", "1-0", "1-1"]);
    }
}
