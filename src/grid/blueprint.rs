//! Ideal tiled layout derived from the observed tiles.

use serde::{Deserialize, Serialize};

use super::config::Tile;
use crate::coords::{Axis, CoordinateSpace, Point2, Size2, Transformer};

/// Extent of the pattern space along either axis ([-1, 1]).
const PATTERN_EXTENT: f64 = 2.0;

/// Gap between neighbouring tiles, pattern units.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct TileGap {
    pub x: f64,
    pub y: f64,
}

/// Canonical footprint, gap and origin of the tiled pattern.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GridBlueprint {
    pub rows: u32,
    pub cols: u32,
    /// Robust median blob diameter, pattern X units.
    pub computed_tile_size: f64,
    pub ideal_tile_footprint: Size2,
    /// Ideal footprint shrunk so the whole grid fits in pattern space.
    pub adjusted_tile_footprint: Size2,
    pub tile_gap: TileGap,
    /// Top-left corner of the grid.
    pub grid_origin: Point2,
    /// Center of the observed tiles.
    pub camera_origin_offset: Point2,
}

impl GridBlueprint {
    /// Lay out a `rows` x `cols` grid of `tile_size` tiles centered on `center`.
    ///
    /// `tile_size` and `center` are in pattern space.
    pub fn derive(
        rows: u32,
        cols: u32,
        tile_size: f64,
        center: Point2,
        gap_ratio: f64,
        transformer: &Transformer,
    ) -> Self {
        let center = transformer.to_pattern(center);
        // Same physical diameter, expressed on the pattern Y axis.
        let pixels = transformer.delta(
            tile_size,
            Axis::X,
            CoordinateSpace::Pattern,
            CoordinateSpace::Camera,
        );
        let height = transformer.delta(
            pixels,
            Axis::Y,
            CoordinateSpace::Camera,
            CoordinateSpace::Pattern,
        );
        let ideal = Size2 {
            width: tile_size,
            height,
        };

        let gap_ratio = gap_ratio.max(0.0);
        let span = |count: u32, extent: f64| {
            count as f64 * extent + count.saturating_sub(1) as f64 * extent * gap_ratio
        };
        let total_w = span(cols, ideal.width);
        let total_h = span(rows, ideal.height);
        let mut scale = 1.0_f64;
        if total_w > PATTERN_EXTENT {
            scale = scale.min(PATTERN_EXTENT / total_w);
        }
        if total_h > PATTERN_EXTENT {
            scale = scale.min(PATTERN_EXTENT / total_h);
        }

        let adjusted = Size2 {
            width: ideal.width * scale,
            height: ideal.height * scale,
        };
        let tile_gap = TileGap {
            x: adjusted.width * gap_ratio,
            y: adjusted.height * gap_ratio,
        };
        let grid_origin = Point2::pattern(
            center.x - total_w * scale / 2.0,
            center.y - total_h * scale / 2.0,
        );

        Self {
            rows,
            cols,
            computed_tile_size: tile_size,
            ideal_tile_footprint: ideal,
            adjusted_tile_footprint: adjusted,
            tile_gap,
            grid_origin,
            camera_origin_offset: center,
        }
    }

    /// Pattern-space center the tile should occupy.
    pub fn ideal_target(&self, tile: Tile) -> Point2 {
        let w = self.adjusted_tile_footprint.width;
        let h = self.adjusted_tile_footprint.height;
        Point2::pattern(
            self.grid_origin.x + tile.col as f64 * (w + self.tile_gap.x) + w / 2.0,
            self.grid_origin.y + tile.row as f64 * (h + self.tile_gap.y) + h / 2.0,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const EPS: f64 = 1e-9;

    #[test]
    fn test_square_image_grid_is_symmetric() {
        let t = Transformer::for_image(1000.0, 1000.0);
        let bp = GridBlueprint::derive(2, 2, 0.2, Point2::pattern(0.0, 0.0), 0.0, &t);

        assert!((bp.ideal_tile_footprint.height - 0.2).abs() < EPS);
        assert_eq!(bp.adjusted_tile_footprint, bp.ideal_tile_footprint);
        assert!((bp.grid_origin.x + 0.2).abs() < EPS);

        let a = bp.ideal_target(Tile::new(0, 0));
        let d = bp.ideal_target(Tile::new(1, 1));
        assert!((a.x + 0.1).abs() < EPS && (a.y + 0.1).abs() < EPS);
        assert!((d.x - 0.1).abs() < EPS && (d.y - 0.1).abs() < EPS);
    }

    #[test]
    fn test_height_follows_aspect() {
        let t = Transformer::for_image(2000.0, 1000.0);
        let bp = GridBlueprint::derive(1, 1, 0.1, Point2::pattern(0.0, 0.0), 0.0, &t);
        assert!((bp.ideal_tile_footprint.height - 0.2).abs() < EPS);
    }

    #[test]
    fn test_gap_and_offset_center() {
        let t = Transformer::for_image(1000.0, 1000.0);
        let bp = GridBlueprint::derive(1, 3, 0.2, Point2::pattern(0.1, -0.3), 0.5, &t);
        assert!((bp.tile_gap.x - 0.1).abs() < EPS);

        let middle = bp.ideal_target(Tile::new(0, 1));
        assert!((middle.x - 0.1).abs() < EPS);
        assert!((middle.y + 0.3).abs() < EPS);

        let right = bp.ideal_target(Tile::new(0, 2));
        assert!((right.x - middle.x - 0.3).abs() < EPS);
    }

    #[test]
    fn test_oversized_grid_is_shrunk_to_fit() {
        let t = Transformer::for_image(1000.0, 1000.0);
        let bp = GridBlueprint::derive(1, 4, 1.0, Point2::pattern(0.0, 0.0), 0.0, &t);
        assert!((bp.adjusted_tile_footprint.width - 0.5).abs() < EPS);
        assert!((bp.ideal_tile_footprint.width - 1.0).abs() < EPS);
        assert!((bp.grid_origin.x + 1.0).abs() < EPS);
    }
}
