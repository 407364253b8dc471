//! Point and delta conversion between coordinate spaces.
//!
//! Every conversion goes through viewport space: a source point is first
//! brought to viewport, then taken out to the destination. Adding a space
//! only needs its two viewport-adjacent functions.

use super::space::{Axis, ConvertContext, CoordinateSpace, Point2, Roi};

/// Convert a tagged point into another space.
pub fn convert(point: Point2, to: CoordinateSpace, ctx: &ConvertContext) -> Point2 {
    if point.space == to {
        return point;
    }
    let (vx, vy) = to_viewport(point.x, point.y, point.space, ctx);
    let (x, y) = from_viewport(vx, vy, to, ctx);
    Point2::new(x, y, to)
}

/// Convert raw coordinates between two named spaces.
pub fn convert_xy(
    x: f64,
    y: f64,
    from: CoordinateSpace,
    to: CoordinateSpace,
    ctx: &ConvertContext,
) -> (f64, f64) {
    let p = convert(Point2::new(x, y, from), to, ctx);
    (p.x, p.y)
}

/// Convert a scalar delta along one axis.
///
/// A delta has no origin, so only the scale factors of each space apply.
pub fn convert_delta(
    delta: f64,
    axis: Axis,
    from: CoordinateSpace,
    to: CoordinateSpace,
    ctx: &ConvertContext,
) -> f64 {
    if from == to {
        return delta;
    }
    let viewport = delta / viewport_scale(axis, from, ctx);
    viewport * viewport_scale(axis, to, ctx)
}

/// Units of `space` per one viewport unit along `axis`.
fn viewport_scale(axis: Axis, space: CoordinateSpace, ctx: &ConvertContext) -> f64 {
    match space {
        CoordinateSpace::Viewport => 1.0,
        CoordinateSpace::Camera => ctx.dim(axis),
        CoordinateSpace::Centered | CoordinateSpace::Pattern => 2.0,
        CoordinateSpace::Isotropic => ctx.dim(axis) / ctx.max_dim(),
    }
}

fn to_viewport(x: f64, y: f64, from: CoordinateSpace, ctx: &ConvertContext) -> (f64, f64) {
    match from {
        CoordinateSpace::Viewport => (x, y),
        CoordinateSpace::Camera => (x / ctx.width, y / ctx.height),
        CoordinateSpace::Centered | CoordinateSpace::Pattern => ((x + 1.0) / 2.0, (y + 1.0) / 2.0),
        CoordinateSpace::Isotropic => {
            let max_dim = ctx.max_dim();
            let px = x * max_dim - ctx.isotropic_offset(Axis::X);
            let py = y * max_dim - ctx.isotropic_offset(Axis::Y);
            (px / ctx.width, py / ctx.height)
        }
    }
}

fn from_viewport(x: f64, y: f64, to: CoordinateSpace, ctx: &ConvertContext) -> (f64, f64) {
    match to {
        CoordinateSpace::Viewport => (x, y),
        CoordinateSpace::Camera => (x * ctx.width, y * ctx.height),
        CoordinateSpace::Centered | CoordinateSpace::Pattern => (x * 2.0 - 1.0, y * 2.0 - 1.0),
        CoordinateSpace::Isotropic => {
            // Detector noise can put blobs just outside the frame.
            let max_dim = ctx.max_dim();
            let ix = (x * ctx.width + ctx.isotropic_offset(Axis::X)) / max_dim;
            let iy = (y * ctx.height + ctx.isotropic_offset(Axis::Y)) / max_dim;
            (ix.clamp(0.0, 1.0), iy.clamp(0.0, 1.0))
        }
    }
}

/// A conversion context bundled with convenience methods.
///
/// The context is never mutated in place; `with_roi` returns a new transformer.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Transformer {
    ctx: ConvertContext,
}

impl Transformer {
    pub fn new(ctx: ConvertContext) -> Self {
        Self { ctx }
    }

    /// Transformer for an image of the given pixel dimensions.
    pub fn for_image(width: f64, height: f64) -> Self {
        Self::new(ConvertContext::new(width, height))
    }

    pub fn context(&self) -> &ConvertContext {
        &self.ctx
    }

    pub fn roi(&self) -> Option<Roi> {
        self.ctx.roi
    }

    /// Return a copy with the region of interest replaced.
    pub fn with_roi(&self, roi: Option<Roi>) -> Self {
        Self {
            ctx: ConvertContext { roi, ..self.ctx },
        }
    }

    pub fn convert(&self, point: Point2, to: CoordinateSpace) -> Point2 {
        convert(point, to, &self.ctx)
    }

    pub fn to_viewport(&self, point: Point2) -> Point2 {
        self.convert(point, CoordinateSpace::Viewport)
    }

    pub fn to_camera(&self, point: Point2) -> Point2 {
        self.convert(point, CoordinateSpace::Camera)
    }

    pub fn to_centered(&self, point: Point2) -> Point2 {
        self.convert(point, CoordinateSpace::Centered)
    }

    pub fn to_pattern(&self, point: Point2) -> Point2 {
        self.convert(point, CoordinateSpace::Pattern)
    }

    pub fn to_isotropic(&self, point: Point2) -> Point2 {
        self.convert(point, CoordinateSpace::Isotropic)
    }

    pub fn delta(&self, delta: f64, axis: Axis, from: CoordinateSpace, to: CoordinateSpace) -> f64 {
        convert_delta(delta, axis, from, to, &self.ctx)
    }

    /// Whether the point falls inside the region of interest. Always true without one.
    pub fn contains(&self, point: Point2) -> bool {
        match self.ctx.roi {
            Some(roi) => {
                let v = self.to_viewport(point);
                roi.contains_viewport(v.x, v.y)
            }
            None => true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const EPS: f64 = 1e-9;

    fn close(a: f64, b: f64) -> bool {
        (a - b).abs() < EPS
    }

    fn sample_points(space: CoordinateSpace) -> Vec<Point2> {
        let raw: &[(f64, f64)] = match space {
            CoordinateSpace::Camera => &[(0.0, 0.0), (640.0, 360.0), (1919.0, 5.5)],
            CoordinateSpace::Viewport => &[(0.0, 1.0), (0.5, 0.5), (0.13, 0.87)],
            // Only the aspect-valid band round-trips exactly (clamping applies outside it).
            CoordinateSpace::Isotropic => &[(0.5, 0.5), (0.1, 0.3), (0.9, 0.7)],
            CoordinateSpace::Centered | CoordinateSpace::Pattern => {
                &[(-1.0, 1.0), (0.0, 0.0), (0.25, -0.6)]
            }
        };
        raw.iter().map(|&(x, y)| Point2::new(x, y, space)).collect()
    }

    #[test]
    fn test_round_trip_every_pair() {
        let ctx = ConvertContext::new(1920.0, 1080.0);
        for from in CoordinateSpace::ALL {
            for to in CoordinateSpace::ALL {
                for p in sample_points(from) {
                    let there = convert(p, to, &ctx);
                    assert_eq!(there.space, to);
                    let back = convert(there, from, &ctx);
                    assert!(
                        close(back.x, p.x) && close(back.y, p.y),
                        "{from} -> {to} -> {from}: {:?} became {:?}",
                        p,
                        back
                    );
                }
            }
        }
    }

    #[test]
    fn test_identity_conversion() {
        let ctx = ConvertContext::new(800.0, 600.0);
        let p = Point2::new(3.5, -2.0, CoordinateSpace::Camera);
        assert_eq!(convert(p, CoordinateSpace::Camera, &ctx), p);
        let same = convert_delta(
            7.0,
            Axis::Y,
            CoordinateSpace::Pattern,
            CoordinateSpace::Pattern,
            &ctx,
        );
        assert_eq!(same, 7.0);
    }

    #[test]
    fn test_camera_center_is_pattern_origin() {
        let ctx = ConvertContext::new(1920.0, 1080.0);
        let p = convert(Point2::camera(960.0, 540.0), CoordinateSpace::Pattern, &ctx);
        assert!(close(p.x, 0.0) && close(p.y, 0.0));
    }

    #[test]
    fn test_isotropic_letterboxes_short_axis() {
        let ctx = ConvertContext::new(1920.0, 1080.0);
        let top_left = convert(Point2::viewport(0.0, 0.0), CoordinateSpace::Isotropic, &ctx);
        assert!(close(top_left.x, 0.0));
        assert!(close(top_left.y, 420.0 / 1920.0));
    }

    #[test]
    fn test_isotropic_clamps_only_on_the_way_in() {
        let ctx = ConvertContext::new(1000.0, 500.0);
        let outside = convert(Point2::camera(1010.0, -20.0), CoordinateSpace::Isotropic, &ctx);
        assert_eq!(outside.x, 1.0);
        assert!(outside.y >= 0.0);

        let edge = Point2::new(0.5, 0.0, CoordinateSpace::Isotropic);
        let back = convert(edge, CoordinateSpace::Viewport, &ctx);
        assert!(back.y < 0.0);
    }

    #[test]
    fn test_delta_uses_scale_only() {
        let ctx = ConvertContext::new(1920.0, 1080.0);
        use CoordinateSpace::{Camera, Isotropic, Pattern};

        let dx = convert_delta(192.0, Axis::X, Camera, Pattern, &ctx);
        let dy = convert_delta(108.0, Axis::Y, Camera, Pattern, &ctx);
        assert!(close(dx, 0.2));
        assert!(close(dy, 0.2));

        let iso = convert_delta(108.0, Axis::Y, Camera, Isotropic, &ctx);
        assert!(close(iso, 108.0 / 1920.0));
        let back = convert_delta(iso, Axis::Y, Isotropic, Camera, &ctx);
        assert!(close(back, 108.0));
    }

    #[test]
    fn test_with_roi_returns_new_transformer() {
        let base = Transformer::for_image(100.0, 100.0);
        let roi = Roi::new(0.0, 0.0, 0.5, 0.5);
        let scoped = base.with_roi(Some(roi));

        assert_eq!(base.roi(), None);
        assert_eq!(scoped.roi(), Some(roi));
        assert!(scoped.contains(Point2::camera(10.0, 10.0)));
        assert!(!scoped.contains(Point2::camera(90.0, 10.0)));
        assert!(base.contains(Point2::camera(90.0, 10.0)));
    }
}
