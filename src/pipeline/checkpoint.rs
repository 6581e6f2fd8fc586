use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::FitError;
use crate::model::states::ModelState;
use crate::pipeline::runtime::FitPhase;
use crate::pose::calibration::NoiseModel;
use crate::pose::pca::LatentBasis;

pub const CHECKPOINT_VERSION: u32 = 1;

/// Structural summary used to reject resumption under an incompatible
/// configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Fingerprint {
    pub latent_dim: usize,
    pub num_syllables: usize,
    pub keypoints: usize,
    pub spatial_dim: usize,
    pub seed: u64,
}

/// Immutable snapshot of a fitting run: the full model state plus the frozen
/// artifacts (latent basis, noise model) needed to continue it. A sequence
/// of checkpoints forms the fitting history.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Checkpoint {
    pub version: u32,
    pub iteration: usize,
    pub phase: FitPhase,
    /// Log-joint diagnostic at this iteration.
    pub log_prob: f64,
    pub state: ModelState,
    pub basis: LatentBasis,
    pub noise_model: NoiseModel,
    pub fingerprint: Fingerprint,
}

impl Checkpoint {
    /// Persist atomically: the snapshot is written to a sibling temp file
    /// and renamed into place, so a crash mid-write never corrupts an
    /// existing checkpoint.
    pub fn save(&self, path: impl AsRef<Path>) -> Result<(), FitError> {
        let path = path.as_ref();
        let data = serde_json::to_vec(self).map_err(|e| FitError::json("encode checkpoint", e))?;
        let mut tmp = path.as_os_str().to_owned();
        tmp.push(".tmp");
        let tmp = std::path::PathBuf::from(tmp);
        std::fs::write(&tmp, &data).map_err(|e| FitError::io("write checkpoint temp file", e))?;
        std::fs::rename(&tmp, path).map_err(|e| FitError::io("rename checkpoint into place", e))?;
        tracing::debug!(
            iteration = self.iteration,
            path = %path.display(),
            "checkpoint: persisted"
        );
        Ok(())
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, FitError> {
        let data = std::fs::read_to_string(path.as_ref())
            .map_err(|e| FitError::io("read checkpoint", e))?;
        let checkpoint: Self =
            serde_json::from_str(&data).map_err(|e| FitError::json("parse checkpoint", e))?;
        if checkpoint.version != CHECKPOINT_VERSION {
            return Err(FitError::resume(format!(
                "checkpoint version {} is not supported (expected {CHECKPOINT_VERSION})",
                checkpoint.version
            )));
        }
        Ok(checkpoint)
    }
}
