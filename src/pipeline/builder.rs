use nalgebra::DVector;
use ndarray::Array2;

use crate::config::FitConfig;
use crate::error::FitError;
use crate::model::draw;
use crate::model::params::{HyperParams, ModelParams};
use crate::model::states::{ModelState, RecordingStates};
use crate::pipeline::defaults::RandomInitializer;
use crate::pipeline::runtime::{
    build_gibbs_data, project_frames, FitPhase, ModelFitter, ModelFitterParts,
};
use crate::pipeline::traits::SyllableInitializer;
use crate::pose::calibration::NoiseModel;
use crate::pose::pca::fit_pca;
use crate::types::Dataset;

const STREAM_INIT_PARAMS: u64 = 9001;
const STREAM_INIT_LABELS: u64 = 9002;

/// Builds a [`ModelFitter`]: formats the dataset, fits the latent basis,
/// seeds the model state, and hands over an engine in the AR-only phase.
pub struct ModelFitterBuilder {
    config: FitConfig,
    noise_model: Option<NoiseModel>,
    initializer: Option<Box<dyn SyllableInitializer>>,
}

impl ModelFitterBuilder {
    pub fn new(config: FitConfig) -> Self {
        Self {
            config,
            noise_model: None,
            initializer: None,
        }
    }

    /// Use a calibrated noise model instead of the confidence-power prior.
    pub fn with_noise_model(mut self, noise_model: NoiseModel) -> Self {
        self.noise_model = Some(noise_model);
        self
    }

    pub fn with_initializer(mut self, initializer: Box<dyn SyllableInitializer>) -> Self {
        self.initializer = Some(initializer);
        self
    }

    pub fn build(self, dataset: &Dataset) -> Result<ModelFitter, FitError> {
        self.config.validate()?;

        let noise_model = self
            .noise_model
            .unwrap_or_else(|| NoiseModel::from_confidence_power(self.config.conf_power));
        let initializer = self
            .initializer
            .unwrap_or_else(|| Box::new(RandomInitializer));

        let (data, poses) = build_gibbs_data(dataset, &self.config, &noise_model)?;

        let basis = fit_pca(&poses, self.config.latent_dim)?;

        // Direct projection seeds the latent trajectories.
        let latents: Vec<Array2<f64>> = poses
            .iter()
            .map(|pose| project_frames(&basis, &pose.egocentric))
            .collect();

        // Empirical frame-to-frame variance per latent dimension anchors the
        // initial AR process noise at the data's own scale.
        let latent_dim = self.config.latent_dim;
        let mut step_var = DVector::<f64>::zeros(latent_dim);
        let mut steps = 0usize;
        for x in &latents {
            let frames = x.dim().0;
            for t in 1..frames {
                for d in 0..latent_dim {
                    let diff = x[[t, d]] - x[[t - 1, d]];
                    step_var[d] += diff * diff;
                }
            }
            steps += frames.saturating_sub(1);
        }
        if steps > 0 {
            step_var /= steps as f64;
        } else {
            step_var.fill(1.0);
        }

        let mut params_rng = draw::derive_rng(self.config.seed, 0, STREAM_INIT_PARAMS);
        let params = ModelParams::init(
            self.config.num_syllables,
            latent_dim,
            data.keypoints,
            &step_var,
            self.config.kappa,
            &mut params_rng,
        );

        let mut label_rng = draw::derive_rng(self.config.seed, 0, STREAM_INIT_LABELS);
        let labels = initializer.initialize(&latents, self.config.num_syllables, &mut label_rng);
        if labels.len() != poses.len() {
            return Err(FitError::config(format!(
                "initializer returned {} label sequences for {} recordings",
                labels.len(),
                poses.len()
            )));
        }

        let mut recordings = Vec::with_capacity(poses.len());
        for ((pose, x), z) in poses.iter().zip(latents).zip(labels) {
            if z.len() != pose.num_frames() {
                return Err(FitError::config(format!(
                    "initializer returned {} labels for recording '{}' with {} frames",
                    z.len(),
                    pose.name,
                    pose.num_frames()
                )));
            }
            recordings.push(RecordingStates {
                name: pose.name.clone(),
                z,
                x,
                v: pose.centroid.clone(),
                h: pose.heading.clone(),
            });
        }

        let state = ModelState {
            recordings,
            params,
            hyperparams: HyperParams::from_config(&self.config),
        };
        state.check_invariants()?;

        tracing::info!(
            recordings = state.recordings.len(),
            latent_dim,
            num_syllables = self.config.num_syllables,
            "fitter: initialized"
        );

        Ok(ModelFitter::from_parts(ModelFitterParts {
            config: self.config,
            basis,
            noise_model,
            data,
            state,
            iteration: 0,
            phase: FitPhase::ArOnly,
            history: Vec::new(),
            last_log_prob: f64::MIN,
        }))
    }
}
