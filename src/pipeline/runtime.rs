use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use ndarray::Array2;
use serde::{Deserialize, Serialize};

use crate::config::FitConfig;
use crate::error::FitError;
use crate::model::draw;
use crate::model::gibbs::{self, GibbsData, SweepOptions};
use crate::model::states::{ModelState, RecordingStates};
use crate::pipeline::checkpoint::{Checkpoint, Fingerprint, CHECKPOINT_VERSION};
use crate::pipeline::results;
use crate::pose::calibration::NoiseModel;
use crate::pose::formatter::format_recording;
use crate::pose::pca::LatentBasis;
use crate::types::{Dataset, ResultSet};

/// Phase of the fitting state machine. The builder performs the transition
/// out of the implicit uninitialized state; `run_full` performs
/// `ArOnly -> Full`; exhausting the requested iterations (or the early-stop
/// plateau) yields `Converged`, cancellation yields `Stopped`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FitPhase {
    ArOnly,
    Full,
    Converged,
    Stopped,
}

/// Cooperative cancellation for a running fit, checked between iterations.
#[derive(Clone)]
pub struct CancelHandle(Arc<AtomicBool>);

impl CancelHandle {
    pub fn cancel(&self) {
        self.0.store(true, Ordering::Relaxed);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Relaxed)
    }
}

enum PhaseOutcome {
    Completed,
    EarlyStopped,
    Cancelled,
}

pub(crate) struct ModelFitterParts {
    pub config: FitConfig,
    pub basis: LatentBasis,
    pub noise_model: NoiseModel,
    pub data: GibbsData,
    pub state: ModelState,
    pub iteration: usize,
    pub phase: FitPhase,
    pub history: Vec<Checkpoint>,
    /// Diagnostic of the last completed sweep; `f64::MIN` before the first
    /// sweep (kept finite so checkpoints always serialize cleanly).
    pub last_log_prob: f64,
}

/// The inference engine: owns one model state exclusively and advances it
/// through AR-only and full Gibbs sweeps, emitting checkpoints as it goes.
#[derive(Debug)]
pub struct ModelFitter {
    config: FitConfig,
    basis: LatentBasis,
    noise_model: NoiseModel,
    data: GibbsData,
    state: ModelState,
    phase: FitPhase,
    iteration: usize,
    last_log_prob: f64,
    log_prob_window: Vec<f64>,
    history: Vec<Checkpoint>,
    cancel: Arc<AtomicBool>,
}

impl ModelFitter {
    pub(crate) fn from_parts(parts: ModelFitterParts) -> Self {
        Self {
            config: parts.config,
            basis: parts.basis,
            noise_model: parts.noise_model,
            data: parts.data,
            state: parts.state,
            phase: parts.phase,
            iteration: parts.iteration,
            last_log_prob: parts.last_log_prob,
            log_prob_window: Vec::new(),
            history: parts.history,
            cancel: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn phase(&self) -> FitPhase {
        self.phase
    }

    pub fn iteration(&self) -> usize {
        self.iteration
    }

    pub fn state(&self) -> &ModelState {
        &self.state
    }

    pub fn basis(&self) -> &LatentBasis {
        &self.basis
    }

    pub fn checkpoints(&self) -> &[Checkpoint] {
        &self.history
    }

    pub fn latest_checkpoint(&self) -> Option<&Checkpoint> {
        self.history.last()
    }

    pub fn cancel_handle(&self) -> CancelHandle {
        CancelHandle(Arc::clone(&self.cancel))
    }

    /// Run the configured AR-only iterations followed by the configured full
    /// iterations.
    pub fn run(&mut self) -> Result<(), FitError> {
        self.run_ar_only(self.config.ar_only_iters)?;
        if self.phase == FitPhase::Stopped {
            return Ok(());
        }
        self.run_full(self.config.full_iters)
    }

    /// Advance the AR-only phase: syllables, transitions, and AR dynamics
    /// update while the latent trajectory stays pinned to the direct
    /// projection.
    pub fn run_ar_only(&mut self, iterations: usize) -> Result<(), FitError> {
        if self.phase != FitPhase::ArOnly {
            return Err(FitError::config(format!(
                "AR-only fitting is not valid from phase {:?}",
                self.phase
            )));
        }
        let options = SweepOptions {
            full: false,
            update_params: true,
        };
        match self.run_phase(iterations, options, false)? {
            PhaseOutcome::Cancelled => self.enter_stopped(),
            PhaseOutcome::Completed | PhaseOutcome::EarlyStopped => {}
        }
        Ok(())
    }

    /// Advance the full phase: the complete sweep including the latent
    /// trajectory, kinematics, and observation noise. Transitions out of
    /// AR-only on first call.
    pub fn run_full(&mut self, iterations: usize) -> Result<(), FitError> {
        match self.phase {
            FitPhase::ArOnly => {
                tracing::info!(
                    iteration = self.iteration,
                    "fitter: entering full-model phase"
                );
                self.phase = FitPhase::Full;
            }
            FitPhase::Full => {}
            other => {
                return Err(FitError::config(format!(
                    "full fitting is not valid from phase {other:?}"
                )));
            }
        }
        let options = SweepOptions {
            full: true,
            update_params: true,
        };
        match self.run_phase(iterations, options, true)? {
            PhaseOutcome::Cancelled => self.enter_stopped(),
            PhaseOutcome::Completed | PhaseOutcome::EarlyStopped => {
                self.phase = FitPhase::Converged;
            }
        }
        Ok(())
    }

    fn run_phase(
        &mut self,
        iterations: usize,
        options: SweepOptions,
        allow_early_stop: bool,
    ) -> Result<PhaseOutcome, FitError> {
        for _ in 0..iterations {
            if self.cancel.load(Ordering::Relaxed) {
                self.push_checkpoint();
                return Ok(PhaseOutcome::Cancelled);
            }

            let log_prob = gibbs::sweep(
                &mut self.state,
                &self.data,
                &self.basis,
                self.config.seed,
                self.iteration,
                options,
            )
            .map_err(|e| {
                tracing::error!(
                    iteration = self.iteration,
                    last_checkpoint = ?self.history.last().map(|c| c.iteration),
                    error = %e,
                    "fitter: aborting run, last checkpoint preserved"
                );
                e
            })?;

            self.iteration += 1;
            self.last_log_prob = log_prob;
            tracing::debug!(
                iteration = self.iteration,
                log_prob = format!("{log_prob:.3}"),
                "fitter: sweep complete"
            );

            if self.iteration % self.config.checkpoint_every == 0 {
                self.push_checkpoint();
            }

            if allow_early_stop {
                if let Some(window) = self.config.early_stop_window {
                    self.log_prob_window.push(log_prob);
                    let len = self.log_prob_window.len();
                    if len > window {
                        self.log_prob_window.drain(..len - window);
                    }
                    if self.log_prob_window.len() == window && window > 0 {
                        let max = self
                            .log_prob_window
                            .iter()
                            .copied()
                            .fold(f64::NEG_INFINITY, f64::max);
                        let min = self
                            .log_prob_window
                            .iter()
                            .copied()
                            .fold(f64::INFINITY, f64::min);
                        if max - min < self.config.early_stop_tol {
                            tracing::info!(
                                iteration = self.iteration,
                                window,
                                "fitter: log-probability plateau, stopping early"
                            );
                            self.push_checkpoint();
                            return Ok(PhaseOutcome::EarlyStopped);
                        }
                    }
                }
            }
        }
        self.push_checkpoint();
        Ok(PhaseOutcome::Completed)
    }

    fn enter_stopped(&mut self) {
        tracing::warn!(
            iteration = self.iteration,
            "fitter: cancelled, last checkpoint preserved"
        );
        self.phase = FitPhase::Stopped;
    }

    fn fingerprint(&self) -> Fingerprint {
        Fingerprint {
            latent_dim: self.config.latent_dim,
            num_syllables: self.config.num_syllables,
            keypoints: self.data.keypoints,
            spatial_dim: self.data.dim,
            seed: self.config.seed,
        }
    }

    /// Snapshot the current state as an immutable checkpoint.
    pub fn checkpoint(&self) -> Checkpoint {
        Checkpoint {
            version: CHECKPOINT_VERSION,
            iteration: self.iteration,
            phase: match self.phase {
                FitPhase::ArOnly => FitPhase::ArOnly,
                // Converged/Stopped snapshots resume into the full phase.
                _ => FitPhase::Full,
            },
            log_prob: self.last_log_prob,
            state: self.state.clone(),
            basis: self.basis.clone(),
            noise_model: self.noise_model.clone(),
            fingerprint: self.fingerprint(),
        }
    }

    fn push_checkpoint(&mut self) {
        if self
            .history
            .last()
            .map(|c| c.iteration == self.iteration)
            .unwrap_or(false)
        {
            return;
        }
        let checkpoint = self.checkpoint();
        self.history.push(checkpoint);
    }

    /// Rebuild a fitter from a checkpoint and the original dataset.
    /// Continuation replays the exact trajectory of an uninterrupted run
    /// with the same seed.
    pub fn resume(
        checkpoint: Checkpoint,
        dataset: &Dataset,
        config: FitConfig,
    ) -> Result<Self, FitError> {
        config.validate()?;
        if checkpoint.version != CHECKPOINT_VERSION {
            return Err(FitError::resume(format!(
                "checkpoint version {} is not supported",
                checkpoint.version
            )));
        }

        let expected = Fingerprint {
            latent_dim: config.latent_dim,
            num_syllables: config.num_syllables,
            keypoints: config.use_indices().len(),
            spatial_dim: dataset.spatial_dim().unwrap_or(0),
            seed: config.seed,
        };
        if checkpoint.fingerprint != expected {
            return Err(FitError::resume(format!(
                "checkpoint fingerprint {:?} does not match configuration {:?}",
                checkpoint.fingerprint, expected
            )));
        }

        let (data, _poses) = build_gibbs_data(dataset, &config, &checkpoint.noise_model)?;

        if checkpoint.state.recordings.len() != data.raw.len() {
            return Err(FitError::resume(format!(
                "checkpoint has {} recordings, dataset has {}",
                checkpoint.state.recordings.len(),
                data.raw.len()
            )));
        }
        for (rec, raw) in checkpoint.state.recordings.iter().zip(&data.raw) {
            if rec.num_frames() != raw.dim().0 {
                return Err(FitError::resume(format!(
                    "recording '{}' has {} frames in the checkpoint but {} in the dataset",
                    rec.name,
                    rec.num_frames(),
                    raw.dim().0
                )));
            }
        }

        checkpoint.state.check_invariants()?;

        tracing::info!(
            iteration = checkpoint.iteration,
            phase = ?checkpoint.phase,
            "fitter: resumed from checkpoint"
        );

        Ok(Self::from_parts(ModelFitterParts {
            config,
            basis: checkpoint.basis.clone(),
            noise_model: checkpoint.noise_model.clone(),
            data,
            state: checkpoint.state.clone(),
            iteration: checkpoint.iteration,
            phase: checkpoint.phase,
            last_log_prob: checkpoint.log_prob,
            history: vec![checkpoint],
        }))
    }

    /// Adjust the duration-control hyperparameter between phases (typically
    /// after inspecting syllable durations from an AR-only fit).
    pub fn update_kappa(&mut self, kappa: f64) -> Result<(), FitError> {
        if kappa < 0.0 {
            return Err(FitError::config("kappa must be non-negative"));
        }
        tracing::info!(old = self.state.hyperparams.kappa, new = kappa, "fitter: kappa updated");
        self.state.hyperparams.kappa = kappa;
        self.config.kappa = kappa;
        Ok(())
    }

    /// Extract per-recording results from the current state.
    pub fn extract_results(&self) -> ResultSet {
        results::extract(&self.state, self.config.label_smoothing_window)
    }

    /// Run the fitted model against new data with frozen global parameters
    /// (states-only resampling) and extract results.
    pub fn apply(
        &self,
        dataset: &Dataset,
        num_iters: usize,
        ar_only: bool,
    ) -> Result<ResultSet, FitError> {
        let (data, poses) = build_gibbs_data(dataset, &self.config, &self.noise_model)?;
        if data.keypoints != self.data.keypoints || data.dim != self.data.dim {
            return Err(FitError::config(format!(
                "apply dataset has {} keypoints in {}D, model was fit on {} in {}D",
                data.keypoints, data.dim, self.data.keypoints, self.data.dim
            )));
        }

        let apply_seed = self.config.seed ^ 0x6170_706c_795f_7273;
        let mut rng = draw::derive_rng(apply_seed, 0, 0);
        let recordings =
            seed_recording_states(&poses, &self.basis, self.config.num_syllables, &mut rng);

        let mut state = ModelState {
            recordings,
            params: self.state.params.clone(),
            hyperparams: self.state.hyperparams.clone(),
        };

        let options = SweepOptions {
            full: !ar_only,
            update_params: false,
        };
        for iteration in 0..num_iters {
            gibbs::sweep(&mut state, &data, &self.basis, apply_seed, iteration, options)?;
        }

        Ok(results::extract(&state, self.config.label_smoothing_window))
    }
}

/// Format a dataset and assemble the observation-side inputs of the sweeps.
pub(crate) fn build_gibbs_data(
    dataset: &Dataset,
    config: &FitConfig,
    noise_model: &NoiseModel,
) -> Result<(GibbsData, Vec<crate::types::AlignedPose>), FitError> {
    if dataset.is_empty() {
        return Err(FitError::format("dataset contains no recordings"));
    }
    let dim = dataset.spatial_dim().expect("non-empty dataset");
    let use_indices = config.use_indices();
    let keypoints = use_indices.len();

    let mut poses = Vec::with_capacity(dataset.len());
    let mut raw = Vec::with_capacity(dataset.len());
    let mut noise_prior = Vec::with_capacity(dataset.len());

    for recording in dataset.recordings() {
        let pose = format_recording(recording, config)?;

        // World coordinates of the modeled keypoints, with the formatter's
        // interpolation applied (exact inverse of the egocentric transform).
        let frames = pose.num_frames();
        let mut world = ndarray::Array3::<f64>::zeros((frames, keypoints, dim));
        for t in 0..frames {
            let (cos_h, sin_h) = (pose.heading[t].cos(), pose.heading[t].sin());
            for k in 0..keypoints {
                let ex = pose.egocentric[[t, k * dim]];
                let ey = pose.egocentric[[t, k * dim + 1]];
                world[[t, k, 0]] = cos_h * ex - sin_h * ey + pose.centroid[[t, 0]];
                world[[t, k, 1]] = sin_h * ex + cos_h * ey + pose.centroid[[t, 1]];
                if dim == 3 {
                    world[[t, k, 2]] = pose.egocentric[[t, k * dim + 2]] + pose.centroid[[t, 2]];
                }
            }
        }
        raw.push(world);

        let prior = Array2::from_shape_fn((frames, keypoints), |(t, k)| {
            noise_model.variance(recording.confidences[[t, use_indices[k]]])
        });
        noise_prior.push(prior);
        poses.push(pose);
    }

    Ok((
        GibbsData {
            raw,
            noise_prior,
            keypoints,
            dim,
        },
        poses,
    ))
}

/// Seed per-recording states from aligned poses: latents from the direct
/// projection, labels uniform at random.
pub(crate) fn seed_recording_states(
    poses: &[crate::types::AlignedPose],
    basis: &LatentBasis,
    num_syllables: usize,
    rng: &mut rand::rngs::StdRng,
) -> Vec<RecordingStates> {
    use rand::Rng;

    let mut recordings = Vec::with_capacity(poses.len());
    for pose in poses {
        let frames = pose.num_frames();
        let x = project_frames(basis, &pose.egocentric);
        let z = (0..frames).map(|_| rng.gen_range(0..num_syllables)).collect();
        recordings.push(RecordingStates {
            name: pose.name.clone(),
            z,
            x,
            v: pose.centroid.clone(),
            h: pose.heading.clone(),
        });
    }
    recordings
}

pub(crate) fn project_frames(basis: &LatentBasis, egocentric: &Array2<f64>) -> Array2<f64> {
    let (frames, pose_dim) = egocentric.dim();
    let latent_dim = basis.latent_dim();
    let mut x = Array2::<f64>::zeros((frames, latent_dim));
    let mut row = nalgebra::DVector::<f64>::zeros(pose_dim);
    for t in 0..frames {
        for p in 0..pose_dim {
            row[p] = egocentric[[t, p]];
        }
        let latent = basis.project(&row);
        for d in 0..latent_dim {
            x[[t, d]] = latent[d];
        }
    }
    x
}
