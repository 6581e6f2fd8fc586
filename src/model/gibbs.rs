//! One Gibbs sweep over the model state: the alternating-update core of the
//! inference engine. Update order within a sweep is fixed as
//! (z, transitions, AR, x, v, h, sigmasq); recordings are processed in
//! parallel wherever their updates are independent given global parameters.

use ndarray::{Array2, Array3};
use rayon::prelude::*;

use crate::error::FitError;
use crate::model::states::ModelState;
use crate::model::{ar, draw, hmm, kalman, kinematics};
use crate::pose::pca::LatentBasis;

const LN_2PI: f64 = 1.837_877_066_409_345_5;

const STAGE_Z: u64 = 1;
const STAGE_TRANSITIONS: u64 = 2;
const STAGE_AR: u64 = 3;
const STAGE_X: u64 = 4;
const STAGE_CENTROID: u64 = 5;
const STAGE_HEADING: u64 = 6;
const STAGE_OBS_NOISE: u64 = 7;

fn stream(stage: u64, recording: usize) -> u64 {
    stage.wrapping_mul(1_000_003).wrapping_add(recording as u64)
}

/// Which parts of the state a sweep touches.
#[derive(Debug, Clone, Copy)]
pub(crate) struct SweepOptions {
    /// Resample the continuous latent trajectory and kinematics. Off during
    /// the AR-only phase, where geometry stays pinned to the direct
    /// projection.
    pub full: bool,
    /// Update global parameters. Off in apply mode, where a frozen model is
    /// run against new data.
    pub update_params: bool,
}

/// Observation-side inputs that stay fixed across a fitting run.
#[derive(Debug)]
pub(crate) struct GibbsData {
    /// World-frame coordinates of the modeled keypoints, `(T, K, D)` per
    /// recording.
    pub raw: Vec<Array3<f64>>,
    /// Confidence noise prior per keypoint entry, `(T, K)` per recording.
    pub noise_prior: Vec<Array2<f64>>,
    pub keypoints: usize,
    pub dim: usize,
}

/// Run one sweep. The egocentric observations consumed by the continuous
/// updates are always derived on the fly from the raw coordinates and the
/// current kinematics, so the sweep is a pure function of (state, data,
/// seed, iteration) — the property checkpoint resume relies on. Returns the
/// log-joint diagnostic for this iteration.
pub(crate) fn sweep(
    state: &mut ModelState,
    data: &GibbsData,
    basis: &LatentBasis,
    seed: u64,
    iteration: usize,
    options: SweepOptions,
) -> Result<f64, FitError> {
    let iter = iteration as u64;
    let num_syllables = state.num_syllables();
    let mut log_prob = 0.0;

    // (z) discrete syllable sequences. Per-recording terms are collected in
    // recording order and folded sequentially so the result does not depend
    // on thread scheduling.
    {
        let params = &state.params;
        let log_norms: Vec<f64> = state
            .recordings
            .par_iter_mut()
            .enumerate()
            .map(|(idx, rec)| {
                let mut rng = draw::derive_rng(seed, iter, stream(STAGE_Z, idx));
                let log_lik = ar::ar_log_likelihoods(&rec.x, &params.ar);
                let (z, log_norm) =
                    hmm::forward_filter_backward_sample(&log_lik, &params.transitions, &mut rng);
                rec.z = z;
                log_norm
            })
            .collect();
        log_prob += log_norms.iter().sum::<f64>();
    }

    if options.update_params {
        // (transitions) sticky Dirichlet posterior.
        let sequences: Vec<&[usize]> = state.recordings.iter().map(|r| r.z.as_slice()).collect();
        let counts = hmm::count_transitions(&sequences, num_syllables);
        let mut rng = draw::derive_rng(seed, iter, stream(STAGE_TRANSITIONS, 0));
        state.params.transitions = hmm::resample_transitions(
            &counts,
            state.hyperparams.alpha,
            state.hyperparams.kappa,
            &mut rng,
        );

        // (AR) per-syllable dynamics from pooled sufficient statistics,
        // merged in recording order.
        let per_recording: Vec<Vec<ar::ArSuffStats>> = state
            .recordings
            .par_iter()
            .map(|rec| ar::accumulate_ar_stats(&rec.x, &rec.z, num_syllables))
            .collect();
        let mut stats = vec![ar::ArSuffStats::new(state.params.latent_dim()); num_syllables];
        for part in &per_recording {
            for (a, p) in stats.iter_mut().zip(part) {
                a.merge(p);
            }
        }
        let mut rng = draw::derive_rng(seed, iter, stream(STAGE_AR, 0));
        state.params.ar = ar::resample_ar_params(&stats, &state.hyperparams, &mut rng);
    }

    if options.full {
        // (x) continuous latent trajectories.
        {
            let params = &state.params;
            state
                .recordings
                .par_iter_mut()
                .enumerate()
                .for_each(|(idx, rec)| {
                    let mut rng = draw::derive_rng(seed, iter, stream(STAGE_X, idx));
                    let ego = egocentric_observations(&data.raw[idx], &rec.v, &rec.h, data.dim);
                    let obs_var = observation_variances(
                        &data.noise_prior[idx],
                        &params.sigmasq,
                        data.keypoints,
                        data.dim,
                    );
                    rec.x = kalman::sample_latent_trajectory(
                        &ego,
                        &obs_var,
                        &rec.z,
                        &params.ar,
                        basis,
                        &mut rng,
                    );
                });
        }

        // (v, h) kinematics.
        {
            let params = &state.params;
            let hyper = &state.hyperparams;
            state
                .recordings
                .par_iter_mut()
                .enumerate()
                .for_each(|(idx, rec)| {
                    let recon = reconstruct_frames(basis, &rec.x, data.keypoints, data.dim);
                    let weights = evidence_weights(
                        &data.noise_prior[idx],
                        &params.sigmasq,
                        data.keypoints,
                    );

                    let mut rng = draw::derive_rng(seed, iter, stream(STAGE_CENTROID, idx));
                    rec.v = kinematics::resample_centroid(
                        &data.raw[idx],
                        &recon,
                        &rec.h,
                        &weights,
                        hyper.sigmasq_loc,
                        &mut rng,
                    );

                    let mut rng = draw::derive_rng(seed, iter, stream(STAGE_HEADING, idx));
                    rec.h = kinematics::resample_heading(
                        &data.raw[idx],
                        &recon,
                        &rec.v,
                        &weights,
                        &mut rng,
                    );
                });
        }

        // (sigmasq) observation-noise scales and the observation-side
        // log-likelihood diagnostic.
        let per_recording: Vec<kinematics::ObsNoiseStats> = state
            .recordings
            .par_iter()
            .enumerate()
            .map(|(idx, rec)| {
                let ego = egocentric_observations(&data.raw[idx], &rec.v, &rec.h, data.dim);
                let recon = reconstruct_flat(basis, &rec.x);
                kinematics::accumulate_obs_noise_stats(
                    &ego,
                    &recon,
                    &data.noise_prior[idx],
                    data.keypoints,
                    data.dim,
                )
            })
            .collect();
        let mut noise_stats = kinematics::ObsNoiseStats::new(data.keypoints);
        for part in &per_recording {
            noise_stats.merge(part);
        }

        if options.update_params {
            let mut rng = draw::derive_rng(seed, iter, stream(STAGE_OBS_NOISE, 0));
            let sigmasq = kinematics::resample_obs_noise(
                &noise_stats,
                state.hyperparams.obs_noise_shape,
                state.hyperparams.obs_noise_scale,
                &mut rng,
            );
            for (k, value) in sigmasq.into_iter().enumerate() {
                state.params.sigmasq[k] = value;
            }
        }

        log_prob += observation_log_likelihood(state, data, basis);
    }

    state.check_finite(iteration)?;
    Ok(log_prob)
}

/// Per-entry observation variances `(T, pose_dim)`.
fn observation_variances(
    noise_prior: &Array2<f64>,
    sigmasq: &nalgebra::DVector<f64>,
    keypoints: usize,
    dim: usize,
) -> Array2<f64> {
    let frames = noise_prior.dim().0;
    Array2::from_shape_fn((frames, keypoints * dim), |(t, p)| {
        let k = p / dim;
        sigmasq[k] * noise_prior[[t, k]]
    })
}

/// Inverse-variance weights `(T, keypoints)` for the kinematics evidence.
fn evidence_weights(
    noise_prior: &Array2<f64>,
    sigmasq: &nalgebra::DVector<f64>,
    keypoints: usize,
) -> Array2<f64> {
    let frames = noise_prior.dim().0;
    Array2::from_shape_fn((frames, keypoints), |(t, k)| {
        1.0 / (sigmasq[k] * noise_prior[[t, k]]).max(1e-12)
    })
}

/// Reconstruct egocentric keypoint positions from the latent trajectory,
/// shaped `(T, keypoints, dim)`.
pub(crate) fn reconstruct_frames(
    basis: &LatentBasis,
    x: &Array2<f64>,
    keypoints: usize,
    dim: usize,
) -> Array3<f64> {
    let flat = reconstruct_flat(basis, x);
    let frames = x.dim().0;
    Array3::from_shape_fn((frames, keypoints, dim), |(t, k, d)| {
        flat[[t, k * dim + d]]
    })
}

pub(crate) fn reconstruct_flat(basis: &LatentBasis, x: &Array2<f64>) -> Array2<f64> {
    let (frames, latent_dim) = x.dim();
    let pose_dim = basis.pose_dim();
    let mut out = Array2::<f64>::zeros((frames, pose_dim));
    let mut latent = nalgebra::DVector::<f64>::zeros(latent_dim);
    for t in 0..frames {
        for d in 0..latent_dim {
            latent[d] = x[[t, d]];
        }
        let recon = basis.reconstruct(&latent);
        for p in 0..pose_dim {
            out[[t, p]] = recon[p];
        }
    }
    out
}

/// Re-express raw world coordinates in the egocentric frame defined by the
/// current centroid and heading.
pub(crate) fn egocentric_observations(
    raw: &Array3<f64>,
    v: &Array2<f64>,
    h: &ndarray::Array1<f64>,
    dim: usize,
) -> Array2<f64> {
    let (frames, keypoints, _) = raw.dim();
    let mut ego = Array2::<f64>::zeros((frames, keypoints * dim));
    for t in 0..frames {
        let (cos_h, sin_h) = (h[t].cos(), h[t].sin());
        for k in 0..keypoints {
            let dx = raw[[t, k, 0]] - v[[t, 0]];
            let dy = raw[[t, k, 1]] - v[[t, 1]];
            ego[[t, k * dim]] = cos_h * dx + sin_h * dy;
            ego[[t, k * dim + 1]] = -sin_h * dx + cos_h * dy;
            if dim == 3 {
                ego[[t, k * dim + 2]] = raw[[t, k, 2]] - v[[t, 2]];
            }
        }
    }
    ego
}

fn observation_log_likelihood(state: &ModelState, data: &GibbsData, basis: &LatentBasis) -> f64 {
    let terms: Vec<f64> = state
        .recordings
        .par_iter()
        .enumerate()
        .map(|(idx, rec)| {
            let ego = egocentric_observations(&data.raw[idx], &rec.v, &rec.h, data.dim);
            let recon = reconstruct_flat(basis, &rec.x);
            let frames = rec.num_frames();
            let mut total = 0.0;
            for t in 0..frames {
                for k in 0..data.keypoints {
                    let var =
                        (state.params.sigmasq[k] * data.noise_prior[idx][[t, k]]).max(1e-12);
                    for d in 0..data.dim {
                        let p = k * data.dim + d;
                        let resid = ego[[t, p]] - recon[[t, p]];
                        total += -0.5 * (var.ln() + LN_2PI + resid * resid / var);
                    }
                }
            }
            total
        })
        .collect();
    terms.iter().sum()
}
