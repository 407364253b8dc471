//! Coordinate spaces and conversions between them.

mod space;
mod transform;

pub use space::{Axis, ConvertContext, CoordinateSpace, ParseSpaceError, Point2, Roi, Size2};
pub use transform::{convert, convert_delta, convert_xy, Transformer};
