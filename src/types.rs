use std::collections::BTreeMap;

use ndarray::{Array1, Array2, Array3};
use serde::{Deserialize, Serialize};

use crate::error::FitError;

/// One tracked recording: keypoint coordinates and per-keypoint confidence
/// scores for every video frame.
#[derive(Debug, Clone)]
pub struct Recording {
    pub name: String,
    /// Shape `(frames, keypoints, spatial_dim)`, spatial_dim 2 or 3.
    pub coordinates: Array3<f64>,
    /// Shape `(frames, keypoints)`, values in `[0, 1]`.
    pub confidences: Array2<f64>,
}

impl Recording {
    pub fn new(
        name: impl Into<String>,
        coordinates: Array3<f64>,
        confidences: Array2<f64>,
    ) -> Result<Self, FitError> {
        let (frames, keypoints, dim) = coordinates.dim();
        if dim != 2 && dim != 3 {
            return Err(FitError::format(format!(
                "spatial dimension must be 2 or 3, got {dim}"
            )));
        }
        if confidences.dim() != (frames, keypoints) {
            return Err(FitError::format(format!(
                "confidence shape {:?} does not match coordinates {:?}",
                confidences.dim(),
                (frames, keypoints)
            )));
        }
        Ok(Self {
            name: name.into(),
            coordinates,
            confidences,
        })
    }

    pub fn num_frames(&self) -> usize {
        self.coordinates.dim().0
    }

    pub fn num_keypoints(&self) -> usize {
        self.coordinates.dim().1
    }

    pub fn spatial_dim(&self) -> usize {
        self.coordinates.dim().2
    }
}

/// An ordered collection of recordings sharing one skeleton definition.
///
/// Insertion order is preserved so that fitting is deterministic given the
/// same dataset construction sequence.
#[derive(Debug, Clone, Default)]
pub struct Dataset {
    recordings: Vec<Recording>,
}

impl Dataset {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, recording: Recording) -> Result<(), FitError> {
        if let Some(first) = self.recordings.first() {
            if recording.num_keypoints() != first.num_keypoints()
                || recording.spatial_dim() != first.spatial_dim()
            {
                return Err(FitError::format(format!(
                    "recording '{}' has {} keypoints in {}D, dataset has {} in {}D",
                    recording.name,
                    recording.num_keypoints(),
                    recording.spatial_dim(),
                    first.num_keypoints(),
                    first.spatial_dim()
                )));
            }
        }
        if self.recordings.iter().any(|r| r.name == recording.name) {
            return Err(FitError::format(format!(
                "duplicate recording name '{}'",
                recording.name
            )));
        }
        self.recordings.push(recording);
        Ok(())
    }

    pub fn recordings(&self) -> &[Recording] {
        &self.recordings
    }

    pub fn is_empty(&self) -> bool {
        self.recordings.is_empty()
    }

    pub fn len(&self) -> usize {
        self.recordings.len()
    }

    pub fn num_keypoints(&self) -> Option<usize> {
        self.recordings.first().map(|r| r.num_keypoints())
    }

    pub fn spatial_dim(&self) -> Option<usize> {
        self.recordings.first().map(|r| r.spatial_dim())
    }
}

/// Per-frame egocentric pose representation for one recording.
///
/// Frame count always equals the source recording's frame count; missing or
/// low-confidence keypoints are interpolated and flagged in `outlier_mask`
/// instead of being dropped.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AlignedPose {
    pub name: String,
    /// Centroid-subtracted, heading-rotated coordinates, shape `(frames, keypoints * dim)`.
    pub egocentric: Array2<f64>,
    /// World-frame centroid per frame, shape `(frames, dim)`.
    pub centroid: Array2<f64>,
    /// Heading angle per frame in radians.
    pub heading: Array1<f64>,
    /// True where confidence fell below the configured threshold.
    pub outlier_mask: Array2<bool>,
}

impl AlignedPose {
    pub fn num_frames(&self) -> usize {
        self.egocentric.dim().0
    }
}

/// Final per-recording model output, trimmed to the recording's frame count.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResultRecord {
    /// Discrete syllable label per frame.
    pub syllable: Vec<usize>,
    /// Continuous latent pose per frame.
    pub latent_state: Vec<Vec<f64>>,
    /// World-frame centroid per frame.
    pub centroid: Vec<Vec<f64>>,
    /// Heading angle per frame in radians.
    pub heading: Vec<f64>,
}

/// Model outputs keyed by recording name.
pub type ResultSet = BTreeMap<String, ResultRecord>;
