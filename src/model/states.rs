use ndarray::{Array1, Array2};
use serde::{Deserialize, Serialize};

use crate::error::FitError;
use crate::model::params::{HyperParams, ModelParams};

/// Latent variables of one recording. Every per-frame sequence has length
/// equal to the recording's frame count at all times.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecordingStates {
    pub name: String,
    /// Discrete syllable label per frame.
    pub z: Vec<usize>,
    /// Continuous latent pose, shape `(frames, latent_dim)`.
    pub x: Array2<f64>,
    /// World-frame centroid, shape `(frames, spatial_dim)`.
    pub v: Array2<f64>,
    /// Heading angle per frame in radians.
    pub h: Array1<f64>,
}

impl RecordingStates {
    pub fn num_frames(&self) -> usize {
        self.z.len()
    }
}

/// All latent variables and parameters of one fitting run. Mutated in place
/// by every inference iteration; owned exclusively by one run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelState {
    pub recordings: Vec<RecordingStates>,
    pub params: ModelParams,
    pub hyperparams: HyperParams,
}

impl ModelState {
    pub fn num_syllables(&self) -> usize {
        self.params.num_syllables()
    }

    pub fn latent_dim(&self) -> usize {
        self.params.latent_dim()
    }

    /// Verify the structural invariants: full-length per-frame sequences,
    /// in-range labels, row-stochastic transitions.
    pub(crate) fn check_invariants(&self) -> Result<(), FitError> {
        let num_syllables = self.num_syllables();
        let latent_dim = self.latent_dim();
        for rec in &self.recordings {
            let frames = rec.z.len();
            if rec.x.dim() != (frames, latent_dim)
                || rec.v.dim().0 != frames
                || rec.h.len() != frames
            {
                return Err(FitError::config(format!(
                    "recording '{}': per-frame sequences have inconsistent lengths",
                    rec.name
                )));
            }
            if let Some(&label) = rec.z.iter().find(|&&label| label >= num_syllables) {
                return Err(FitError::config(format!(
                    "recording '{}': syllable label {label} out of range (max {num_syllables})",
                    rec.name
                )));
            }
        }
        for i in 0..num_syllables {
            let row_sum: f64 = self.params.transitions.row(i).iter().sum();
            if (row_sum - 1.0).abs() > 1e-6 {
                return Err(FitError::config(format!(
                    "transition row {i} sums to {row_sum}, expected 1"
                )));
            }
        }
        Ok(())
    }

    /// Verify that every continuous quantity is finite. A non-finite value
    /// anywhere means the current run can no longer be trusted and must be
    /// aborted in favor of the last checkpoint.
    pub(crate) fn check_finite(&self, iteration: usize) -> Result<(), FitError> {
        for rec in &self.recordings {
            if rec.x.iter().any(|v| !v.is_finite()) {
                return Err(FitError::numerical(
                    iteration,
                    format!("latent trajectory of recording '{}'", rec.name),
                ));
            }
            if rec.v.iter().any(|v| !v.is_finite()) || rec.h.iter().any(|v| !v.is_finite()) {
                return Err(FitError::numerical(
                    iteration,
                    format!("centroid/heading of recording '{}'", rec.name),
                ));
            }
        }
        for (j, ar) in self.params.ar.iter().enumerate() {
            let finite = ar.dynamics.iter().all(|v| v.is_finite())
                && ar.bias.iter().all(|v| v.is_finite())
                && ar.noise.iter().all(|v| v.is_finite() && *v > 0.0);
            if !finite {
                return Err(FitError::numerical(
                    iteration,
                    format!("AR parameters of syllable {j}"),
                ));
            }
        }
        if self.params.transitions.iter().any(|v| !v.is_finite())
            || self
                .params
                .sigmasq
                .iter()
                .any(|v| !v.is_finite() || *v <= 0.0)
        {
            return Err(FitError::numerical(
                iteration,
                "transition matrix or observation noise scales",
            ));
        }
        Ok(())
    }
}
