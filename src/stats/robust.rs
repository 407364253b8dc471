//! Median/MAD based outlier detection.
//!
//! Mean and standard deviation are dragged around by the very outliers they
//! are meant to find. Median and MAD tolerate up to half the samples being
//! bad, which matters when a few tiles lost their blob or have a stuck
//! actuator.

use serde::{Deserialize, Serialize};

/// Scale factor making MAD a consistent estimator of sigma for normal data.
pub const MAD_TO_SIGMA: f64 = 1.4826;

/// Default outlier threshold in normalized MADs.
pub const DEFAULT_MAD_THRESHOLD: f64 = 3.0;

/// Which side of the median counts as an outlier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutlierDirection {
    #[default]
    Both,
    High,
    Low,
}

/// Outlier detection options.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OutlierOptions {
    pub mad_threshold: f64,
    pub direction: OutlierDirection,
}

impl Default for OutlierOptions {
    fn default() -> Self {
        Self {
            mad_threshold: DEFAULT_MAD_THRESHOLD,
            direction: OutlierDirection::Both,
        }
    }
}

impl OutlierOptions {
    pub fn with_threshold(mut self, mad_threshold: f64) -> Self {
        self.mad_threshold = mad_threshold;
        self
    }

    pub fn with_direction(mut self, direction: OutlierDirection) -> Self {
        self.direction = direction;
        self
    }
}

/// Result of outlier detection. `T` is the sample type (a number or a whole record).
#[derive(Debug, Clone, PartialEq)]
pub struct OutlierResult<T> {
    pub inliers: Vec<T>,
    pub outliers: Vec<T>,
    /// Positions of the outliers in the original input.
    pub outlier_indices: Vec<usize>,
    pub median: f64,
    pub mad: f64,
    pub n_mad: f64,
    pub upper_threshold: f64,
    pub lower_threshold: f64,
}

/// Median of the values; 0 for empty input. The input is not reordered.
pub fn compute_median(values: &[f64]) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    let mut sorted = values.to_vec();
    sorted.sort_by(|a, b| a.total_cmp(b));
    let mid = sorted.len() / 2;
    if sorted.len() % 2 == 0 {
        (sorted[mid - 1] + sorted[mid]) / 2.0
    } else {
        sorted[mid]
    }
}

/// Median absolute deviation around `median`; 0 for fewer than two values.
pub fn compute_mad(values: &[f64], median: f64) -> f64 {
    if values.len() < 2 {
        return 0.0;
    }
    let deviations: Vec<f64> = values.iter().map(|v| (v - median).abs()).collect();
    compute_median(&deviations)
}

/// MAD scaled to estimate the standard deviation.
pub fn compute_normalized_mad(values: &[f64], median: f64) -> f64 {
    compute_mad(values, median) * MAD_TO_SIGMA
}

/// Classify values as inliers or outliers.
pub fn detect_outliers(values: &[f64], options: &OutlierOptions) -> OutlierResult<f64> {
    detect_outliers_with_keys(values, |v| *v, options)
}

/// Classify arbitrary records by a numeric value, keeping whole records in both buckets.
pub fn detect_outliers_with_keys<T, F>(
    entries: &[T],
    extractor: F,
    options: &OutlierOptions,
) -> OutlierResult<T>
where
    T: Clone,
    F: Fn(&T) -> f64,
{
    let values: Vec<f64> = entries.iter().map(&extractor).collect();
    let median = compute_median(&values);
    let mad = compute_mad(&values, median);
    let n_mad = mad * MAD_TO_SIGMA;
    let limit = options.mad_threshold * n_mad;
    let upper_threshold = median + limit;
    let lower_threshold = median - limit;

    let mut inliers = Vec::with_capacity(entries.len());
    let mut outliers = Vec::new();
    let mut outlier_indices = Vec::new();

    for (i, (entry, value)) in entries.iter().zip(&values).enumerate() {
        let high = *value - median > limit;
        let low = median - *value > limit;
        let is_outlier = match options.direction {
            OutlierDirection::Both => high || low,
            OutlierDirection::High => high,
            OutlierDirection::Low => low,
        };
        if is_outlier {
            outliers.push(entry.clone());
            outlier_indices.push(i);
        } else {
            inliers.push(entry.clone());
        }
    }

    OutlierResult {
        inliers,
        outliers,
        outlier_indices,
        median,
        mad,
        n_mad,
        upper_threshold,
        lower_threshold,
    }
}

/// Maximum of the inlier set, falling back to the plain maximum.
pub fn robust_max(values: &[f64], options: &OutlierOptions) -> f64 {
    robust_extremum(values, options, f64::max)
}

/// Minimum of the inlier set, falling back to the plain minimum.
pub fn robust_min(values: &[f64], options: &OutlierOptions) -> f64 {
    robust_extremum(values, options, f64::min)
}

fn robust_extremum(values: &[f64], options: &OutlierOptions, pick: fn(f64, f64) -> f64) -> f64 {
    let fold = |vals: &[f64]| vals.iter().copied().reduce(pick).unwrap_or(0.0);
    if values.len() < 2 {
        return fold(values);
    }
    let result = detect_outliers(values, options);
    if result.inliers.is_empty() {
        fold(values)
    } else {
        fold(&result.inliers)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_median() {
        assert_eq!(compute_median(&[]), 0.0);
        assert_eq!(compute_median(&[1.0, 2.0, 3.0, 4.0]), 2.5);
        assert_eq!(compute_median(&[5.0, 1.0, 3.0]), 3.0);
    }

    #[test]
    fn test_median_leaves_input_untouched() {
        let values = vec![9.0, 1.0, 5.0];
        let _ = compute_median(&values);
        assert_eq!(values, vec![9.0, 1.0, 5.0]);
    }

    #[test]
    fn test_mad() {
        assert_eq!(compute_mad(&[1.0, 2.0, 3.0, 4.0, 5.0], 3.0), 1.0);
        assert_eq!(compute_mad(&[], 0.0), 0.0);
        assert_eq!(compute_mad(&[42.0], 42.0), 0.0);
        assert!((compute_normalized_mad(&[1.0, 2.0, 3.0, 4.0, 5.0], 3.0) - 1.4826).abs() < 1e-12);
    }

    #[test]
    fn test_detect_single_high_outlier() {
        let result = detect_outliers(&[1.0, 2.0, 3.0, 4.0, 100.0], &OutlierOptions::default());
        assert_eq!(result.outliers, vec![100.0]);
        assert_eq!(result.outlier_indices, vec![4]);
        assert_eq!(result.inliers, vec![1.0, 2.0, 3.0, 4.0]);
        assert_eq!(result.median, 3.0);
        assert_eq!(result.mad, 1.0);
        assert!((result.upper_threshold - (3.0 + 3.0 * 1.4826)).abs() < 1e-12);
        assert!((result.lower_threshold - (3.0 - 3.0 * 1.4826)).abs() < 1e-12);
    }

    #[test]
    fn test_direction_filters_sides() {
        let values = [-100.0, 1.0, 2.0, 3.0, 4.0, 100.0];
        let high_only = OutlierOptions::default().with_direction(OutlierDirection::High);
        let high = detect_outliers(&values, &high_only);
        assert_eq!(high.outliers, vec![100.0]);
        assert_eq!(high.outlier_indices, vec![5]);

        let low_only = OutlierOptions::default().with_direction(OutlierDirection::Low);
        let low = detect_outliers(&values, &low_only);
        assert_eq!(low.outliers, vec![-100.0]);
        assert_eq!(low.outlier_indices, vec![0]);

        let both = detect_outliers(&values, &OutlierOptions::default());
        assert_eq!(both.outlier_indices, vec![0, 5]);
        assert_eq!(both.inliers, vec![1.0, 2.0, 3.0, 4.0]);
    }

    #[test]
    fn test_keyed_detection_keeps_records() {
        let entries = vec![("0-0", 10.0), ("0-1", 11.0), ("1-0", 10.5), ("1-1", 40.0)];
        let result = detect_outliers_with_keys(&entries, |e| e.1, &OutlierOptions::default());
        assert_eq!(result.outliers, vec![("1-1", 40.0)]);
        assert_eq!(result.inliers.len(), 3);
        assert_eq!(result.inliers[0].0, "0-0");
    }

    #[test]
    fn test_robust_extrema() {
        let opts = OutlierOptions::default();
        assert_eq!(robust_max(&[1.0, 2.0, 3.0, 4.0, 100.0], &opts), 4.0);
        assert_eq!(robust_max(&[100.0, 200.0, 300.0], &opts), 300.0);
        assert_eq!(robust_min(&[-50.0, 1.0, 2.0, 3.0, 4.0], &opts), 1.0);
        assert_eq!(robust_max(&[7.0], &opts), 7.0);
        assert_eq!(robust_min(&[], &opts), 0.0);
    }
}
