pub(crate) mod ar;
pub(crate) mod draw;
pub(crate) mod gibbs;
pub(crate) mod hmm;
pub(crate) mod kalman;
pub(crate) mod kinematics;
pub mod params;
pub mod states;

pub use params::{ArParams, HyperParams, ModelParams};
pub use states::{ModelState, RecordingStates};
