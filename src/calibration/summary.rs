//! Persistable result of a calibration run.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use uuid::Uuid;

use super::state::{AxisSteps, TileRunState, TileStatus};
use crate::coords::Point2;
use crate::grid::{GridBlueprint, TileAssignment};
use crate::measurement::BlobMeasurement;
use crate::stats::{OutlierOptions, OutlierResult};
use crate::step_test::{StepTestSettings, StepToDisplacement};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct GridSize {
    pub rows: u32,
    pub cols: u32,
}

/// Blob-size outlier statistics over the measured tiles.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OutlierAnalysis {
    pub median: f64,
    pub mad: f64,
    pub n_mad: f64,
    pub mad_threshold: f64,
    pub upper_threshold: f64,
    pub lower_threshold: f64,
    pub inlier_count: usize,
    /// Tile keys whose blob size was rejected.
    pub outlier_keys: Vec<String>,
}

impl OutlierAnalysis {
    pub fn from_result(result: &OutlierResult<(String, f64)>, options: &OutlierOptions) -> Self {
        Self {
            median: result.median,
            mad: result.mad,
            n_mad: result.n_mad,
            mad_threshold: options.mad_threshold,
            upper_threshold: result.upper_threshold,
            lower_threshold: result.lower_threshold,
            inlier_count: result.inliers.len(),
            outlier_keys: result.outliers.iter().map(|(key, _)| key.clone()).collect(),
        }
    }

    pub fn is_outlier(&self, key: &str) -> bool {
        self.outlier_keys.iter().any(|k| k == key)
    }
}

/// Per-tile entry of a run summary. Only measured tiles appear.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TileSummary {
    pub row: u32,
    pub col: u32,
    pub status: TileStatus,
    pub assignment: TileAssignment,
    pub home: BlobMeasurement,
    pub home_offset: Point2,
    pub ideal_target: Point2,
    pub step_to_displacement: StepToDisplacement,
    pub size_delta_at_step_test: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub alignment_steps: Option<AxisSteps>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub alignment_error: Option<String>,
    #[serde(default)]
    pub is_outlier: bool,
}

impl TileSummary {
    /// `None` unless the tile is measured and the final pass filled its targets.
    pub fn from_state(tile: &TileRunState, analysis: Option<&OutlierAnalysis>) -> Option<Self> {
        if !tile.status.is_measured() {
            return None;
        }
        let metrics = tile.metrics.as_ref()?;
        Some(Self {
            row: tile.tile.row,
            col: tile.tile.col,
            status: tile.status,
            assignment: tile.assignment.clone(),
            home: metrics.home.clone()?,
            home_offset: metrics.home_offset?,
            ideal_target: metrics.ideal_target?,
            step_to_displacement: metrics.step_to_displacement,
            size_delta_at_step_test: metrics.size_delta_at_step_test,
            alignment_steps: metrics.alignment_steps,
            alignment_error: metrics.alignment_error.clone(),
            is_outlier: analysis.is_some_and(|a| a.is_outlier(&tile.key)),
        })
    }
}

/// Everything needed to reproduce the tiled layout later.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CalibrationRunSummary {
    pub run_id: Uuid,
    pub created_at: DateTime<Utc>,
    pub grid: GridSize,
    pub grid_blueprint: GridBlueprint,
    pub step_test_settings: StepTestSettings,
    pub tiles: BTreeMap<String, TileSummary>,
    pub outlier_analysis: Option<OutlierAnalysis>,
}

impl CalibrationRunSummary {
    pub fn build(
        tiles: &[TileRunState],
        blueprint: GridBlueprint,
        step_test_settings: StepTestSettings,
        outlier_analysis: Option<OutlierAnalysis>,
    ) -> Self {
        let entries = tiles
            .iter()
            .filter_map(|t| {
                TileSummary::from_state(t, outlier_analysis.as_ref()).map(|s| (t.key.clone(), s))
            })
            .collect();

        Self {
            run_id: Uuid::new_v4(),
            created_at: Utc::now(),
            grid: GridSize {
                rows: blueprint.rows,
                cols: blueprint.cols,
            },
            grid_blueprint: blueprint,
            step_test_settings,
            tiles: entries,
            outlier_analysis,
        }
    }

    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string_pretty(self)
    }

    pub fn from_json(json: &str) -> serde_json::Result<Self> {
        serde_json::from_str(json)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::calibration::state::TileMetrics;
    use crate::coords::{CoordinateSpace, Transformer};
    use crate::grid::{MotorRef, Tile};

    fn measured(tile: Tile, status: TileStatus, size: f64) -> TileRunState {
        let assignment = TileAssignment::new(MotorRef::new("aa", 0), MotorRef::new("aa", 1));
        let home = BlobMeasurement::new(0.1, -0.2, size, 1.0, CoordinateSpace::Pattern);
        TileRunState {
            status,
            metrics: Some(TileMetrics {
                home: Some(home),
                home_offset: Some(Point2::pattern(0.01, 0.0)),
                ideal_target: Some(Point2::pattern(0.09, -0.2)),
                step_to_displacement: StepToDisplacement {
                    x: Some(0.001),
                    y: None,
                },
                ..Default::default()
            }),
            ..TileRunState::new(tile, assignment)
        }
    }

    fn blueprint() -> GridBlueprint {
        GridBlueprint::derive(
            1,
            3,
            0.2,
            Point2::pattern(0.0, 0.0),
            0.0,
            &Transformer::for_image(1000.0, 1000.0),
        )
    }

    #[test]
    fn test_summary_keeps_only_measured_tiles() {
        let mut failed = measured(Tile::new(0, 1), TileStatus::Error, 0.2);
        failed.error = Some("No blob detected".to_string());
        let tiles = vec![
            measured(Tile::new(0, 0), TileStatus::Completed, 0.2),
            failed,
            measured(Tile::new(0, 2), TileStatus::Partial, 0.2),
        ];

        let settings = StepTestSettings::default();
        let summary = CalibrationRunSummary::build(&tiles, blueprint(), settings, None);

        assert_eq!(summary.grid, GridSize { rows: 1, cols: 3 });
        assert_eq!(summary.tiles.keys().collect::<Vec<_>>(), vec!["0-0", "0-2"]);
        assert_eq!(summary.tiles["0-2"].status, TileStatus::Partial);
        assert!(!summary.tiles["0-0"].is_outlier);
    }

    #[test]
    fn test_tile_without_targets_is_left_out() {
        let mut tile = measured(Tile::new(0, 0), TileStatus::Completed, 0.2);
        if let Some(metrics) = tile.metrics.as_mut() {
            metrics.ideal_target = None;
        }
        assert!(TileSummary::from_state(&tile, None).is_none());
    }

    #[test]
    fn test_summary_json_round_trip() {
        let tiles = vec![measured(Tile::new(0, 0), TileStatus::Completed, 0.2)];
        let analysis = OutlierAnalysis {
            median: 0.2,
            mad: 0.0,
            n_mad: 0.0,
            mad_threshold: 3.0,
            upper_threshold: 0.2,
            lower_threshold: 0.2,
            inlier_count: 0,
            outlier_keys: vec!["0-0".to_string()],
        };
        let settings = StepTestSettings::default();
        let summary = CalibrationRunSummary::build(&tiles, blueprint(), settings, Some(analysis));
        assert!(summary.tiles["0-0"].is_outlier);

        let json = summary.to_json().unwrap();
        assert!(json.contains("\"gridBlueprint\""));
        assert!(json.contains("\"stepToDisplacement\""));

        let back = CalibrationRunSummary::from_json(&json).unwrap();
        assert_eq!(back.run_id, summary.run_id);
        assert_eq!(back.tiles.len(), 1);
        assert_eq!(back.outlier_analysis.unwrap().outlier_keys, vec!["0-0"]);
    }
}
