//! Per-syllable autoregressive dynamics: likelihood evaluation and the
//! conjugate Normal-Inverse-Gamma coefficient update.

use nalgebra::{DMatrix, DVector};
use ndarray::Array2;
use rand::rngs::StdRng;

use crate::model::draw;
use crate::model::params::{ArParams, HyperParams};

const LN_2PI: f64 = 1.837_877_066_409_345_5;

/// Per-frame log-likelihood of each syllable's dynamics explaining the step
/// into that frame, shape `(frames, syllables)`. Frame 0 carries no dynamics
/// evidence and scores zero for every syllable.
pub(crate) fn ar_log_likelihoods(x: &Array2<f64>, ar: &[ArParams]) -> Array2<f64> {
    let (frames, latent_dim) = x.dim();
    let syllables = ar.len();
    let mut log_lik = Array2::<f64>::zeros((frames, syllables));
    if frames == 0 {
        return log_lik;
    }

    // Per-syllable constant term of the diagonal Gaussian.
    let constants: Vec<f64> = ar
        .iter()
        .map(|p| -0.5 * p.noise.iter().map(|q| q.ln() + LN_2PI).sum::<f64>())
        .collect();

    let mut prev = DVector::<f64>::zeros(latent_dim);
    for t in 1..frames {
        for d in 0..latent_dim {
            prev[d] = x[[t - 1, d]];
        }
        for (j, params) in ar.iter().enumerate() {
            let pred = &params.dynamics * &prev + &params.bias;
            let mut quad = 0.0;
            for d in 0..latent_dim {
                let resid = x[[t, d]] - pred[d];
                quad += resid * resid / params.noise[d];
            }
            log_lik[[t, j]] = constants[j] - 0.5 * quad;
        }
    }
    log_lik
}

/// Sufficient statistics of the AR regression for one syllable, in the
/// augmented basis `phi = [x_prev; 1]`.
#[derive(Debug, Clone)]
pub(crate) struct ArSuffStats {
    pub sxx: DMatrix<f64>,
    pub sxy: DMatrix<f64>,
    pub syy: DVector<f64>,
    pub n: f64,
}

impl ArSuffStats {
    pub(crate) fn new(latent_dim: usize) -> Self {
        Self {
            sxx: DMatrix::zeros(latent_dim + 1, latent_dim + 1),
            sxy: DMatrix::zeros(latent_dim + 1, latent_dim),
            syy: DVector::zeros(latent_dim),
            n: 0.0,
        }
    }

    pub(crate) fn merge(&mut self, other: &ArSuffStats) {
        self.sxx += &other.sxx;
        self.sxy += &other.sxy;
        self.syy += &other.syy;
        self.n += other.n;
    }
}

/// Accumulate AR sufficient statistics for one recording.
pub(crate) fn accumulate_ar_stats(
    x: &Array2<f64>,
    z: &[usize],
    syllables: usize,
) -> Vec<ArSuffStats> {
    let (frames, latent_dim) = x.dim();
    let mut stats = vec![ArSuffStats::new(latent_dim); syllables];
    let mut phi = DVector::<f64>::zeros(latent_dim + 1);
    phi[latent_dim] = 1.0;
    for t in 1..frames {
        for d in 0..latent_dim {
            phi[d] = x[[t - 1, d]];
        }
        let bucket = &mut stats[z[t]];
        bucket.n += 1.0;
        for a in 0..=latent_dim {
            for b in a..=latent_dim {
                let value = phi[a] * phi[b];
                bucket.sxx[(a, b)] += value;
                if a != b {
                    bucket.sxx[(b, a)] += value;
                }
            }
            for d in 0..latent_dim {
                bucket.sxy[(a, d)] += phi[a] * x[[t, d]];
            }
        }
        for d in 0..latent_dim {
            bucket.syy[d] += x[[t, d]] * x[[t, d]];
        }
    }
    stats
}

/// Draw new AR parameters for every syllable from the Normal-Inverse-Gamma
/// posterior. The coefficient prior shrinks toward identity dynamics with
/// zero bias, so syllables with no assigned frames stay well-behaved.
pub(crate) fn resample_ar_params(
    stats: &[ArSuffStats],
    hyperparams: &HyperParams,
    rng: &mut StdRng,
) -> Vec<ArParams> {
    let latent_dim = stats
        .first()
        .map(|s| s.syy.len())
        .expect("at least one syllable");
    let ridge = hyperparams.ar_ridge;

    let mut out = Vec::with_capacity(stats.len());
    for bucket in stats {
        let mut lambda_n = bucket.sxx.clone();
        for i in 0..=latent_dim {
            lambda_n[(i, i)] += ridge;
        }
        let chol = draw::cholesky_with_jitter(lambda_n);

        let mut dynamics = DMatrix::<f64>::zeros(latent_dim, latent_dim);
        let mut bias = DVector::<f64>::zeros(latent_dim);
        let mut noise = DVector::<f64>::zeros(latent_dim);

        for d in 0..latent_dim {
            // Prior mean: unit self-weight, everything else zero.
            let mut eta = bucket.sxy.column(d).clone_owned();
            eta[d] += ridge;
            let w_n = chol.solve(&eta);

            let a_n = hyperparams.ar_noise_shape + bucket.n / 2.0;
            let b_n = hyperparams.ar_noise_scale
                + 0.5 * (bucket.syy[d] + ridge - w_n.dot(&eta));
            let b_n = b_n.max(hyperparams.ar_noise_scale);
            let q_d = draw::inverse_gamma(rng, a_n, b_n);

            let eps = draw::standard_normal_vector(rng, latent_dim + 1);
            let u = chol
                .l()
                .transpose()
                .solve_upper_triangular(&eps)
                .unwrap_or_else(|| DVector::zeros(latent_dim + 1));
            let w = &w_n + u * q_d.sqrt();

            for c in 0..latent_dim {
                dynamics[(d, c)] = w[c];
            }
            bias[d] = w[latent_dim];
            noise[d] = q_d;
        }

        out.push(ArParams {
            dynamics,
            bias,
            noise,
        });
    }
    out
}
