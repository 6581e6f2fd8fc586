use nalgebra::{DMatrix, DVector};
use rand::rngs::StdRng;
use serde::{Deserialize, Serialize};

use crate::config::FitConfig;
use crate::model::draw;

/// Autoregressive dynamics of one syllable: `x_t ~ N(A x_{t-1} + b, diag(q))`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ArParams {
    pub dynamics: DMatrix<f64>,
    pub bias: DVector<f64>,
    /// Diagonal process-noise variances.
    pub noise: DVector<f64>,
}

/// Global model parameters shared by all recordings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelParams {
    /// One AR parameter set per syllable.
    pub ar: Vec<ArParams>,
    /// Row-stochastic transition matrix between syllables.
    pub transitions: DMatrix<f64>,
    /// Per-keypoint observation-noise scale, multiplying the confidence
    /// noise prior.
    pub sigmasq: DVector<f64>,
}

impl ModelParams {
    /// Seed parameters before the first sweep. Dynamics start near identity
    /// with small per-syllable perturbations (otherwise every syllable
    /// explains the data equally and the labels never differentiate);
    /// process noise starts at the empirical frame-to-frame latent variance.
    pub(crate) fn init(
        num_syllables: usize,
        latent_dim: usize,
        num_keypoints: usize,
        latent_step_variance: &DVector<f64>,
        kappa: f64,
        rng: &mut StdRng,
    ) -> Self {
        let mut ar = Vec::with_capacity(num_syllables);
        for _ in 0..num_syllables {
            let mut dynamics = DMatrix::<f64>::identity(latent_dim, latent_dim) * 0.95;
            for v in dynamics.iter_mut() {
                *v += 0.01 * draw::standard_normal(rng);
            }
            let bias = DVector::from_fn(latent_dim, |i, _| {
                0.05 * latent_step_variance[i].sqrt() * draw::standard_normal(rng)
            });
            let noise = latent_step_variance.map(|v| v.max(1e-8));
            ar.push(ArParams {
                dynamics,
                bias,
                noise,
            });
        }

        let l = num_syllables as f64;
        let mut transitions = DMatrix::from_element(num_syllables, num_syllables, 1.0);
        for i in 0..num_syllables {
            transitions[(i, i)] += kappa.max(0.0) / l.max(1.0);
            let row_sum: f64 = transitions.row(i).iter().sum();
            for j in 0..num_syllables {
                transitions[(i, j)] /= row_sum;
            }
        }

        Self {
            ar,
            transitions,
            sigmasq: DVector::from_element(num_keypoints, 1.0),
        }
    }

    pub fn num_syllables(&self) -> usize {
        self.transitions.nrows()
    }

    pub fn latent_dim(&self) -> usize {
        self.ar.first().map(|p| p.bias.len()).unwrap_or(0)
    }
}

/// Fixed hyperparameters of one fitting run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HyperParams {
    /// Sticky transition bias (duration control).
    pub kappa: f64,
    /// Dirichlet concentration of the transition prior.
    pub alpha: f64,
    /// Expected per-frame centroid displacement variance.
    pub sigmasq_loc: f64,
    /// Ridge precision of the AR coefficient prior (shrinks dynamics toward
    /// identity).
    pub ar_ridge: f64,
    /// Inverse-gamma prior on AR process noise.
    pub ar_noise_shape: f64,
    pub ar_noise_scale: f64,
    /// Inverse-gamma prior on observation-noise scales.
    pub obs_noise_shape: f64,
    pub obs_noise_scale: f64,
}

impl HyperParams {
    pub(crate) fn from_config(config: &FitConfig) -> Self {
        Self {
            kappa: config.kappa,
            alpha: config.alpha,
            sigmasq_loc: config.sigmasq_loc,
            ar_ridge: 0.1,
            ar_noise_shape: 2.0,
            ar_noise_scale: 0.01,
            obs_noise_shape: 2.0,
            obs_noise_scale: 0.01,
        }
    }
}
