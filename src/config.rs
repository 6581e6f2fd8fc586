use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::FitError;

/// Configuration for one model fitting run.
///
/// Body parts are referenced by name; `anterior_bodyparts` and
/// `posterior_bodyparts` define the heading axis, `use_bodyparts` optionally
/// restricts which parts enter the centroid and the latent basis.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FitConfig {
    pub bodyparts: Vec<String>,
    pub use_bodyparts: Option<Vec<String>>,
    pub anterior_bodyparts: Vec<String>,
    pub posterior_bodyparts: Vec<String>,

    /// Video frame rate, used to interpret duration-related hyperparameters.
    pub fps: f64,
    /// Keypoints with confidence below this threshold are interpolated and
    /// down-weighted during inference.
    pub conf_threshold: f64,
    /// Exponent of the confidence-to-noise prior `variance ~ conf^-gamma`
    /// used when no calibrated noise model is supplied.
    pub conf_power: f64,
    /// Recordings shorter than this are rejected at formatting time.
    pub min_frames: usize,

    /// Dimension of the continuous latent pose state.
    pub latent_dim: usize,
    /// Upper bound on the number of discrete syllables.
    pub num_syllables: usize,
    /// Sticky transition bias: larger values favor self-transitions and
    /// therefore longer syllable durations.
    pub kappa: f64,
    /// Dirichlet concentration of the transition prior.
    pub alpha: f64,
    /// Expected per-frame centroid displacement variance, in squared
    /// coordinate units. Scale commensurate with fps and animal size.
    pub sigmasq_loc: f64,

    pub ar_only_iters: usize,
    pub full_iters: usize,
    /// Emit a checkpoint every this many iterations.
    pub checkpoint_every: usize,
    pub seed: u64,

    /// Stop early when the log-joint diagnostic varies by less than
    /// `early_stop_tol` over a trailing window of this many iterations.
    pub early_stop_window: Option<usize>,
    pub early_stop_tol: f64,

    /// Odd median-filter window applied to syllable labels on extraction.
    /// Zero disables smoothing.
    pub label_smoothing_window: usize,
}

impl Default for FitConfig {
    fn default() -> Self {
        Self {
            bodyparts: Vec::new(),
            use_bodyparts: None,
            anterior_bodyparts: Vec::new(),
            posterior_bodyparts: Vec::new(),
            fps: 30.0,
            conf_threshold: 0.5,
            conf_power: 2.0,
            min_frames: 10,
            latent_dim: 10,
            num_syllables: 20,
            kappa: 1e4,
            alpha: 5.7,
            sigmasq_loc: 0.5,
            ar_only_iters: 50,
            full_iters: 200,
            checkpoint_every: 25,
            seed: 0,
            early_stop_window: None,
            early_stop_tol: 1e-2,
            label_smoothing_window: 0,
        }
    }
}

impl FitConfig {
    pub fn load(path: impl AsRef<Path>) -> Result<Self, FitError> {
        let data = std::fs::read_to_string(path.as_ref())
            .map_err(|e| FitError::io("read fit config", e))?;
        let config: Self =
            serde_json::from_str(&data).map_err(|e| FitError::json("parse fit config", e))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), FitError> {
        if self.bodyparts.is_empty() {
            return Err(FitError::config("bodyparts list is empty"));
        }
        if self.anterior_bodyparts.is_empty() || self.posterior_bodyparts.is_empty() {
            return Err(FitError::config(
                "anterior and posterior bodypart subsets must be non-empty",
            ));
        }
        if matches!(&self.use_bodyparts, Some(subset) if subset.is_empty()) {
            return Err(FitError::config("use_bodyparts subset is empty"));
        }
        for name in self
            .anterior_bodyparts
            .iter()
            .chain(&self.posterior_bodyparts)
            .chain(self.use_bodyparts.iter().flatten())
        {
            if !self.bodyparts.iter().any(|b| b == name) {
                return Err(FitError::config(format!(
                    "bodypart '{name}' is not in the bodyparts list"
                )));
            }
        }
        if !(0.0..=1.0).contains(&self.conf_threshold) {
            return Err(FitError::config(format!(
                "conf_threshold must be in [0, 1], got {}",
                self.conf_threshold
            )));
        }
        if self.latent_dim == 0 {
            return Err(FitError::config("latent_dim must be at least 1"));
        }
        if self.num_syllables < 2 {
            return Err(FitError::config("num_syllables must be at least 2"));
        }
        if self.kappa < 0.0 || self.alpha <= 0.0 {
            return Err(FitError::config(
                "kappa must be non-negative and alpha positive",
            ));
        }
        if self.sigmasq_loc <= 0.0 {
            return Err(FitError::config("sigmasq_loc must be positive"));
        }
        if self.fps <= 0.0 {
            return Err(FitError::config("fps must be positive"));
        }
        if self.checkpoint_every == 0 {
            return Err(FitError::config("checkpoint_every must be at least 1"));
        }
        if self.label_smoothing_window != 0 && self.label_smoothing_window % 2 == 0 {
            return Err(FitError::config(
                "label_smoothing_window must be odd (or zero to disable)",
            ));
        }
        Ok(())
    }

    /// Indices of the configured subset into the bodyparts list, or all
    /// indices when no subset is configured.
    pub(crate) fn use_indices(&self) -> Vec<usize> {
        match &self.use_bodyparts {
            Some(subset) => subset
                .iter()
                .filter_map(|name| self.bodyparts.iter().position(|b| b == name))
                .collect(),
            None => (0..self.bodyparts.len()).collect(),
        }
    }

    pub(crate) fn anterior_indices(&self) -> Vec<usize> {
        self.anterior_bodyparts
            .iter()
            .filter_map(|name| self.bodyparts.iter().position(|b| b == name))
            .collect()
    }

    pub(crate) fn posterior_indices(&self) -> Vec<usize> {
        self.posterior_bodyparts
            .iter()
            .filter_map(|name| self.bodyparts.iter().position(|b| b == name))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base_config() -> FitConfig {
        FitConfig {
            bodyparts: vec!["nose".into(), "ear".into(), "tail".into()],
            anterior_bodyparts: vec!["nose".into()],
            posterior_bodyparts: vec!["tail".into()],
            ..FitConfig::default()
        }
    }

    #[test]
    fn default_config_validates_once_bodyparts_are_set() {
        assert!(base_config().validate().is_ok());
    }

    #[test]
    fn unknown_subset_bodypart_rejected() {
        let mut config = base_config();
        config.use_bodyparts = Some(vec!["paw".into()]);
        assert!(matches!(
            config.validate(),
            Err(FitError::Config { .. })
        ));
    }

    #[test]
    fn even_smoothing_window_rejected() {
        let mut config = base_config();
        config.label_smoothing_window = 4;
        assert!(config.validate().is_err());
    }

    #[test]
    fn use_indices_defaults_to_all() {
        let config = base_config();
        assert_eq!(config.use_indices(), vec![0, 1, 2]);
        assert_eq!(config.anterior_indices(), vec![0]);
        assert_eq!(config.posterior_indices(), vec![2]);
    }
}
