use serde::{Deserialize, Serialize};

use crate::error::FitError;

const VARIANCE_FLOOR: f64 = 1e-6;
const DEFAULT_BIN_COUNT: usize = 20;
const MONOTONE_TOLERANCE: f64 = 0.5;

/// One annotated comparison point: where the tracker put a keypoint, where it
/// actually was, and the tracker's reported confidence.
#[derive(Debug, Clone)]
pub struct CalibrationPair {
    pub confidence: f64,
    pub tracked: Vec<f64>,
    pub reference: Vec<f64>,
}

impl CalibrationPair {
    fn squared_error(&self) -> f64 {
        self.tracked
            .iter()
            .zip(&self.reference)
            .map(|(a, b)| (a - b) * (a - b))
            .sum()
    }
}

/// Monotone non-increasing map from keypoint confidence to expected spatial
/// noise variance. Fit once, shared read-only across recordings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum NoiseModel {
    /// Step function over a fitted confidence grid, produced by isotonic
    /// regression of empirical errors. Lookups outside the grid clamp to the
    /// boundary bins.
    Isotonic {
        grid: Vec<f64>,
        variance: Vec<f64>,
    },
    /// Calibration-free prior: `variance = max(conf, floor)^-gamma`.
    ConfidencePower { gamma: f64 },
}

impl NoiseModel {
    /// Fit the confidence-to-variance map from annotated comparisons.
    ///
    /// Squared errors are binned by confidence and pooled under a
    /// non-increasing constraint (pool-adjacent-violators). Fails when fewer
    /// than `min_points` pairs are supplied or when the raw binned errors
    /// disagree with any monotone fit badly enough to signal corrupt input.
    pub fn calibrate(pairs: &[CalibrationPair], min_points: usize) -> Result<Self, FitError> {
        if pairs.is_empty() || pairs.len() < min_points {
            return Err(FitError::calibration(format!(
                "{} comparison points supplied, need at least {}",
                pairs.len(),
                min_points.max(1)
            )));
        }
        for pair in pairs {
            if pair.tracked.len() != pair.reference.len() {
                return Err(FitError::calibration(
                    "tracked and reference positions have mismatched dimensions",
                ));
            }
            if !pair.confidence.is_finite() || !pair.squared_error().is_finite() {
                return Err(FitError::calibration(
                    "non-finite confidence or position in calibration data",
                ));
            }
        }

        let mut sorted: Vec<(f64, f64)> = pairs
            .iter()
            .map(|p| (p.confidence, p.squared_error()))
            .collect();
        sorted.sort_by(|a, b| a.0.total_cmp(&b.0));

        let bin_count = DEFAULT_BIN_COUNT.min(sorted.len());
        let per_bin = sorted.len() / bin_count;
        let mut grid = Vec::with_capacity(bin_count);
        let mut raw_means = Vec::with_capacity(bin_count);
        let mut weights = Vec::with_capacity(bin_count);
        for b in 0..bin_count {
            let start = b * per_bin;
            let end = if b + 1 == bin_count {
                sorted.len()
            } else {
                start + per_bin
            };
            let chunk = &sorted[start..end];
            let n = chunk.len() as f64;
            grid.push(chunk.iter().map(|(c, _)| c).sum::<f64>() / n);
            raw_means.push(chunk.iter().map(|(_, e)| e).sum::<f64>() / n);
            weights.push(n);
        }

        let variance = pava_non_increasing(&raw_means, &weights);

        // Large disagreement between the raw bin means and the best monotone
        // fit means the error does not actually decrease with confidence.
        let scale = raw_means.iter().sum::<f64>() / raw_means.len() as f64;
        let deviation = raw_means
            .iter()
            .zip(&variance)
            .map(|(raw, fit)| (raw - fit).abs())
            .sum::<f64>()
            / raw_means.len() as f64;
        if scale > 0.0 && deviation / scale > MONOTONE_TOLERANCE {
            return Err(FitError::calibration(format!(
                "binned errors are non-monotone in confidence (relative deviation {:.3})",
                deviation / scale
            )));
        }

        let variance = variance
            .into_iter()
            .map(|v| v.max(VARIANCE_FLOOR))
            .collect();
        Ok(Self::Isotonic { grid, variance })
    }

    pub fn from_confidence_power(gamma: f64) -> Self {
        Self::ConfidencePower { gamma }
    }

    /// Expected noise variance for a confidence score. Always strictly
    /// positive; inputs outside the fitted range are clamped to the boundary.
    pub fn variance(&self, confidence: f64) -> f64 {
        match self {
            Self::Isotonic { grid, variance } => {
                let c = confidence.clamp(grid[0], grid[grid.len() - 1]);
                let idx = grid.partition_point(|&g| g <= c).saturating_sub(1);
                variance[idx]
            }
            Self::ConfidencePower { gamma } => {
                confidence.clamp(VARIANCE_FLOOR, 1.0).powf(-gamma)
            }
        }
    }
}

/// Pool-adjacent-violators under a non-increasing constraint.
fn pava_non_increasing(values: &[f64], weights: &[f64]) -> Vec<f64> {
    // Negate and fit non-decreasing, the textbook direction.
    let mut blocks: Vec<(f64, f64, usize)> = Vec::with_capacity(values.len());
    for (&v, &w) in values.iter().zip(weights) {
        blocks.push((-v, w, 1));
        while blocks.len() >= 2 {
            let last = blocks[blocks.len() - 1];
            let prev = blocks[blocks.len() - 2];
            if prev.0 <= last.0 {
                break;
            }
            blocks.pop();
            blocks.pop();
            let w_sum = prev.1 + last.1;
            let merged = (
                (prev.0 * prev.1 + last.0 * last.1) / w_sum,
                w_sum,
                prev.2 + last.2,
            );
            blocks.push(merged);
        }
    }
    let mut out = Vec::with_capacity(values.len());
    for (mean, _, count) in blocks {
        out.extend(std::iter::repeat(-mean).take(count));
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_pair(confidence: f64, error: f64) -> CalibrationPair {
        CalibrationPair {
            confidence,
            tracked: vec![error, 0.0],
            reference: vec![0.0, 0.0],
        }
    }

    fn decreasing_error_pairs(n: usize) -> Vec<CalibrationPair> {
        (0..n)
            .map(|i| {
                let conf = i as f64 / (n - 1) as f64;
                make_pair(conf, 2.0 * (1.0 - conf) + 0.1)
            })
            .collect()
    }

    #[test]
    fn too_few_points_rejected() {
        let pairs = decreasing_error_pairs(5);
        assert!(matches!(
            NoiseModel::calibrate(&pairs, 10),
            Err(FitError::Calibration { .. })
        ));
    }

    #[test]
    fn fitted_map_is_monotone_non_increasing() {
        let pairs = decreasing_error_pairs(200);
        let model = NoiseModel::calibrate(&pairs, 10).unwrap();
        let mut prev = f64::INFINITY;
        for i in 0..=100 {
            let v = model.variance(i as f64 / 100.0);
            assert!(v > 0.0);
            assert!(v <= prev + 1e-12);
            prev = v;
        }
    }

    #[test]
    fn extrapolation_clamps_to_boundaries() {
        let pairs = decreasing_error_pairs(100);
        let model = NoiseModel::calibrate(&pairs, 10).unwrap();
        assert_eq!(model.variance(-5.0), model.variance(0.0));
        assert_eq!(model.variance(7.0), model.variance(1.0));
    }

    #[test]
    fn increasing_error_signals_bad_data() {
        // Error grows with confidence: the opposite of a usable calibration.
        let pairs: Vec<CalibrationPair> = (0..200)
            .map(|i| {
                let conf = i as f64 / 199.0;
                make_pair(conf, 3.0 * conf + 0.1)
            })
            .collect();
        assert!(matches!(
            NoiseModel::calibrate(&pairs, 10),
            Err(FitError::Calibration { .. })
        ));
    }

    #[test]
    fn confidence_power_prior_is_monotone_and_positive() {
        let model = NoiseModel::from_confidence_power(2.0);
        assert!(model.variance(0.0) >= model.variance(0.5));
        assert!(model.variance(0.5) >= model.variance(1.0));
        assert!(model.variance(0.0).is_finite());
        assert!((model.variance(1.0) - 1.0).abs() < 1e-12);
    }

    #[test]
    fn pava_pools_violators() {
        let fit = pava_non_increasing(&[1.0, 3.0, 2.0], &[1.0, 1.0, 1.0]);
        // First pair violates the non-increasing constraint and is pooled.
        assert!((fit[0] - 2.0).abs() < 1e-12);
        assert!((fit[1] - 2.0).abs() < 1e-12);
        assert!((fit[2] - 2.0).abs() < 1e-12);
    }
}
