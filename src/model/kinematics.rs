//! Centroid and heading updates: the rigid-motion part of the model.
//! The centroid follows a Gaussian random walk smoothed against keypoint
//! evidence; the heading conditional is von Mises.

use ndarray::{Array1, Array2, Array3};
use rand::rngs::StdRng;

use crate::model::draw;

/// Resample the centroid trajectory for one recording.
///
/// Evidence per frame is the noise-weighted offset between raw keypoints and
/// the rotated reconstruction; the prior is a random walk with per-frame
/// displacement variance `sigmasq_loc` (scalar forward filter, backward
/// sampling, one spatial dimension at a time).
pub(crate) fn resample_centroid(
    raw: &Array3<f64>,
    recon: &Array3<f64>,
    heading: &Array1<f64>,
    weights: &Array2<f64>,
    sigmasq_loc: f64,
    rng: &mut StdRng,
) -> Array2<f64> {
    let (frames, keypoints, dim) = raw.dim();
    let mut v = Array2::<f64>::zeros((frames, dim));
    if frames == 0 {
        return v;
    }

    let mut evidence = Array2::<f64>::zeros((frames, dim));
    let mut evidence_var = Array1::<f64>::zeros(frames);
    for t in 0..frames {
        let (cos_h, sin_h) = (heading[t].cos(), heading[t].sin());
        let mut total_weight = 0.0;
        for k in 0..keypoints {
            let w = weights[[t, k]];
            total_weight += w;
            let (rx, ry) = (recon[[t, k, 0]], recon[[t, k, 1]]);
            let world_x = cos_h * rx - sin_h * ry;
            let world_y = sin_h * rx + cos_h * ry;
            evidence[[t, 0]] += w * (raw[[t, k, 0]] - world_x);
            evidence[[t, 1]] += w * (raw[[t, k, 1]] - world_y);
            if dim == 3 {
                evidence[[t, 2]] += w * (raw[[t, k, 2]] - recon[[t, k, 2]]);
            }
        }
        let total_weight = total_weight.max(1e-12);
        for d in 0..dim {
            evidence[[t, d]] /= total_weight;
        }
        evidence_var[t] = 1.0 / total_weight;
    }

    let mut filtered_mean = vec![0.0f64; frames];
    let mut filtered_var = vec![0.0f64; frames];
    for d in 0..dim {
        filtered_mean[0] = evidence[[0, d]];
        filtered_var[0] = evidence_var[0];
        for t in 1..frames {
            let pred_var = filtered_var[t - 1] + sigmasq_loc;
            let gain = pred_var / (pred_var + evidence_var[t]);
            filtered_mean[t] =
                filtered_mean[t - 1] + gain * (evidence[[t, d]] - filtered_mean[t - 1]);
            filtered_var[t] = (1.0 - gain) * pred_var;
        }

        let mut next = filtered_mean[frames - 1]
            + filtered_var[frames - 1].sqrt() * draw::standard_normal(rng);
        v[[frames - 1, d]] = next;
        for t in (0..frames - 1).rev() {
            let gain = filtered_var[t] / (filtered_var[t] + sigmasq_loc);
            let mean = filtered_mean[t] + gain * (next - filtered_mean[t]);
            let var = (1.0 - gain) * filtered_var[t];
            next = mean + var.max(0.0).sqrt() * draw::standard_normal(rng);
            v[[t, d]] = next;
        }
    }

    v
}

/// Resample the heading sequence for one recording from its per-frame von
/// Mises conditional given centroid and reconstruction.
pub(crate) fn resample_heading(
    raw: &Array3<f64>,
    recon: &Array3<f64>,
    v: &Array2<f64>,
    weights: &Array2<f64>,
    rng: &mut StdRng,
) -> Array1<f64> {
    let (frames, keypoints, _) = raw.dim();
    let mut heading = Array1::<f64>::zeros(frames);
    for t in 0..frames {
        let mut a = 0.0;
        let mut b = 0.0;
        for k in 0..keypoints {
            let w = weights[[t, k]];
            let dx = raw[[t, k, 0]] - v[[t, 0]];
            let dy = raw[[t, k, 1]] - v[[t, 1]];
            let (rx, ry) = (recon[[t, k, 0]], recon[[t, k, 1]]);
            a += w * (dx * rx + dy * ry);
            b += w * (dy * rx - dx * ry);
        }
        let concentration = (a * a + b * b).sqrt();
        let mu = b.atan2(a);
        heading[t] = draw::von_mises(rng, mu, concentration);
    }
    heading
}

/// Per-keypoint residual statistics for the observation-noise update.
#[derive(Debug, Clone)]
pub(crate) struct ObsNoiseStats {
    pub weighted_sq: Vec<f64>,
    pub count: Vec<f64>,
}

impl ObsNoiseStats {
    pub(crate) fn new(keypoints: usize) -> Self {
        Self {
            weighted_sq: vec![0.0; keypoints],
            count: vec![0.0; keypoints],
        }
    }

    pub(crate) fn merge(&mut self, other: &ObsNoiseStats) {
        for k in 0..self.weighted_sq.len() {
            self.weighted_sq[k] += other.weighted_sq[k];
            self.count[k] += other.count[k];
        }
    }
}

/// Accumulate squared reconstruction residuals, normalized by the confidence
/// noise prior, for one recording.
pub(crate) fn accumulate_obs_noise_stats(
    y_ego: &Array2<f64>,
    recon_flat: &Array2<f64>,
    noise_prior: &Array2<f64>,
    keypoints: usize,
    dim: usize,
) -> ObsNoiseStats {
    let frames = y_ego.dim().0;
    let mut stats = ObsNoiseStats::new(keypoints);
    for t in 0..frames {
        for k in 0..keypoints {
            let prior = noise_prior[[t, k]].max(1e-12);
            let mut sq = 0.0;
            for d in 0..dim {
                let resid = y_ego[[t, k * dim + d]] - recon_flat[[t, k * dim + d]];
                sq += resid * resid;
            }
            stats.weighted_sq[k] += sq / prior;
            stats.count[k] += dim as f64;
        }
    }
    stats
}

/// Draw new per-keypoint observation-noise scales from their inverse-gamma
/// posterior.
pub(crate) fn resample_obs_noise(
    stats: &ObsNoiseStats,
    shape_prior: f64,
    scale_prior: f64,
    rng: &mut StdRng,
) -> Vec<f64> {
    stats
        .weighted_sq
        .iter()
        .zip(&stats.count)
        .map(|(&sq, &n)| {
            let shape = shape_prior + n / 2.0;
            let scale = scale_prior + 0.5 * sq;
            draw::inverse_gamma(rng, shape, scale)
        })
        .collect()
}
