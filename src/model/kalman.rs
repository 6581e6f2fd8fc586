//! Linear-Gaussian sampling of the continuous latent trajectory: an
//! information-form Kalman filter forward, then backward sampling from the
//! joint posterior, conditioned on the current syllable sequence.

use nalgebra::{DMatrix, DVector};
use ndarray::Array2;
use rand::rngs::StdRng;

use crate::model::draw;
use crate::model::params::ArParams;
use crate::pose::pca::LatentBasis;

/// Sample `x_{0..T}` given egocentric observations `y` (`frames x pose_dim`),
/// per-entry observation variances, the syllable sequence, and the
/// per-syllable dynamics. Observation model: `y_t = mean + U x_t + eps_t`.
pub(crate) fn sample_latent_trajectory(
    y: &Array2<f64>,
    obs_var: &Array2<f64>,
    z: &[usize],
    ar: &[ArParams],
    basis: &LatentBasis,
    rng: &mut StdRng,
) -> Array2<f64> {
    let frames = y.dim().0;
    let pose_dim = basis.pose_dim();
    let latent_dim = basis.latent_dim();
    let mut x = Array2::<f64>::zeros((frames, latent_dim));
    if frames == 0 {
        return x;
    }

    let components = &basis.components;

    // Diffuse prior around the direct projection of the first frame.
    let prior_scale = basis
        .explained_variance
        .first()
        .copied()
        .unwrap_or(1.0)
        .max(1.0)
        * 10.0;

    let mut filtered_means: Vec<DVector<f64>> = Vec::with_capacity(frames);
    let mut filtered_covs: Vec<DMatrix<f64>> = Vec::with_capacity(frames);

    let mut y_t = DVector::<f64>::zeros(pose_dim);
    for t in 0..frames {
        for p in 0..pose_dim {
            y_t[p] = y[[t, p]];
        }

        let (pred_mean, pred_cov) = if t == 0 {
            (
                basis.project(&y_t),
                DMatrix::<f64>::identity(latent_dim, latent_dim) * prior_scale,
            )
        } else {
            let params = &ar[z[t]];
            let mean = &params.dynamics * &filtered_means[t - 1] + &params.bias;
            let mut cov =
                &params.dynamics * &filtered_covs[t - 1] * params.dynamics.transpose();
            for d in 0..latent_dim {
                cov[(d, d)] += params.noise[d];
            }
            (mean, cov)
        };

        // Information-form measurement update; the observation noise is
        // diagonal so U' R^-1 U accumulates row by row.
        let pred_chol = draw::cholesky_with_jitter(pred_cov);
        let mut precision = pred_chol.inverse();
        let mut info = &precision * &pred_mean;
        for p in 0..pose_dim {
            let weight = 1.0 / obs_var[[t, p]].max(1e-12);
            let row = components.row(p);
            let innov = y_t[p] - basis.mean[p];
            for a in 0..latent_dim {
                info[a] += row[a] * weight * innov;
                for b in a..latent_dim {
                    let value = row[a] * weight * row[b];
                    precision[(a, b)] += value;
                    if a != b {
                        precision[(b, a)] += value;
                    }
                }
            }
        }
        let post_chol = draw::cholesky_with_jitter(precision);
        let cov = post_chol.inverse();
        let mean = &cov * info;
        filtered_means.push(mean);
        filtered_covs.push(cov);
    }

    // Backward sampling.
    let last = draw::sample_mvn(
        rng,
        &filtered_means[frames - 1],
        filtered_covs[frames - 1].clone(),
    );
    for d in 0..latent_dim {
        x[[frames - 1, d]] = last[d];
    }

    let mut next = last;
    for t in (0..frames - 1).rev() {
        let params = &ar[z[t + 1]];
        let cross = &filtered_covs[t] * params.dynamics.transpose();
        let mut innov_cov = &params.dynamics * &cross;
        for d in 0..latent_dim {
            innov_cov[(d, d)] += params.noise[d];
        }
        let innov_chol = draw::cholesky_with_jitter(innov_cov);
        // gain' = innov_cov^-1 * dynamics * cov_t, so gain = cross * innov_cov^-1
        let gain = innov_chol.inverse() * cross.transpose();
        let pred = &params.dynamics * &filtered_means[t] + &params.bias;
        let mean = &filtered_means[t] + gain.transpose() * (&next - pred);
        let cov = &filtered_covs[t] - gain.transpose() * &params.dynamics * &filtered_covs[t];
        let sample = draw::sample_mvn(rng, &mean, cov);
        for d in 0..latent_dim {
            x[[t, d]] = sample[d];
        }
        next = sample;
    }

    x
}

#[cfg(test)]
mod tests {
    use super::*;

    fn identity_basis(pose_dim: usize, latent_dim: usize) -> LatentBasis {
        LatentBasis {
            mean: DVector::zeros(pose_dim),
            components: DMatrix::from_fn(pose_dim, latent_dim, |r, c| {
                if r == c {
                    1.0
                } else {
                    0.0
                }
            }),
            explained_variance: vec![1.0; latent_dim],
        }
    }

    fn static_dynamics(latent_dim: usize, noise: f64) -> ArParams {
        ArParams {
            dynamics: DMatrix::identity(latent_dim, latent_dim),
            bias: DVector::zeros(latent_dim),
            noise: DVector::from_element(latent_dim, noise),
        }
    }

    #[test]
    fn tight_observations_pin_the_trajectory() {
        let frames = 50;
        let basis = identity_basis(4, 2);
        let y = Array2::from_shape_fn((frames, 4), |(t, p)| {
            if p < 2 {
                (t as f64 * 0.1 + p as f64).sin()
            } else {
                0.0
            }
        });
        let obs_var = Array2::from_elem((frames, 4), 1e-6);
        let z = vec![0usize; frames];
        let ar = vec![static_dynamics(2, 1.0)];
        let mut rng = draw::derive_rng(0, 0, 0);
        let x = sample_latent_trajectory(&y, &obs_var, &z, &ar, &basis, &mut rng);
        for t in 0..frames {
            for d in 0..2 {
                assert!((x[[t, d]] - y[[t, d]]).abs() < 0.05);
            }
        }
    }

    #[test]
    fn noisy_observations_are_smoothed_toward_dynamics() {
        // Static dynamics with tiny process noise: the posterior mean is
        // close to the average of the noisy observations.
        let frames = 400;
        let basis = identity_basis(2, 1);
        let mut rng = draw::derive_rng(1, 0, 0);
        let y = Array2::from_shape_fn((frames, 2), |(_, p)| {
            if p == 0 {
                3.0 + 0.5 * draw::standard_normal(&mut rng)
            } else {
                0.0
            }
        });
        let obs_var = Array2::from_elem((frames, 2), 0.25);
        let z = vec![0usize; frames];
        let ar = vec![static_dynamics(1, 1e-6)];
        let mut rng = draw::derive_rng(2, 0, 0);
        let x = sample_latent_trajectory(&y, &obs_var, &z, &ar, &basis, &mut rng);
        let mid = x[[frames / 2, 0]];
        assert!((mid - 3.0).abs() < 0.3);
    }

    #[test]
    fn sampling_is_deterministic_given_rng_state() {
        let frames = 30;
        let basis = identity_basis(3, 2);
        let y = Array2::from_shape_fn((frames, 3), |(t, p)| ((t + p) % 5) as f64);
        let obs_var = Array2::from_elem((frames, 3), 0.5);
        let z = vec![0usize; frames];
        let ar = vec![static_dynamics(2, 0.3)];
        let a = sample_latent_trajectory(
            &y,
            &obs_var,
            &z,
            &ar,
            &basis,
            &mut draw::derive_rng(3, 4, 5),
        );
        let b = sample_latent_trajectory(
            &y,
            &obs_var,
            &z,
            &ar,
            &basis,
            &mut draw::derive_rng(3, 4, 5),
        );
        assert_eq!(a, b);
    }

    #[test]
    fn output_shape_matches_input() {
        let basis = identity_basis(4, 2);
        let y = Array2::zeros((17, 4));
        let obs_var = Array2::from_elem((17, 4), 1.0);
        let z = vec![0usize; 17];
        let ar = vec![static_dynamics(2, 0.5)];
        let mut rng = draw::derive_rng(4, 0, 0);
        let x = sample_latent_trajectory(&y, &obs_var, &z, &ar, &basis, &mut rng);
        assert_eq!(x.dim(), (17, 2));
    }
}
