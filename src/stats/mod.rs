//! Robust statistics for rejecting bad tiles and measurements.

mod robust;

pub use robust::{
    compute_mad, compute_median, compute_normalized_mad, detect_outliers,
    detect_outliers_with_keys, robust_max, robust_min, OutlierDirection, OutlierOptions,
    OutlierResult, DEFAULT_MAD_THRESHOLD, MAD_TO_SIGMA,
};
