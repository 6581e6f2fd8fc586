pub mod config;
pub mod error;
pub mod model;
pub mod pipeline;
pub mod pose;
pub mod types;

pub use config::FitConfig;
pub use error::FitError;
pub use model::{ArParams, HyperParams, ModelParams, ModelState, RecordingStates};
pub use pipeline::builder::ModelFitterBuilder;
pub use pipeline::checkpoint::{Checkpoint, Fingerprint};
pub use pipeline::defaults::{ChangepointInitializer, RandomInitializer};
pub use pipeline::runtime::{CancelHandle, FitPhase, ModelFitter};
pub use pipeline::traits::SyllableInitializer;
pub use pose::{fit_pca, format_recording, CalibrationPair, LatentBasis, NoiseModel};
pub use types::{AlignedPose, Dataset, Recording, ResultRecord, ResultSet};
