use ndarray::{Array1, Array2, Array3};

use crate::config::FitConfig;
use crate::error::FitError;
use crate::types::{AlignedPose, Recording};

/// Convert a raw recording into its egocentric pose representation.
///
/// Keypoints with confidence below `conf_threshold` are linearly interpolated
/// from neighboring confident frames and flagged in the outlier mask; the
/// output frame count always equals the input frame count. A recording where
/// every frame is below threshold (e.g. all-zero confidence) is accepted:
/// every entry is flagged and the raw coordinates are used as-is, leaving the
/// down-weighting to the observation noise model.
pub fn format_recording(recording: &Recording, config: &FitConfig) -> Result<AlignedPose, FitError> {
    let frames = recording.num_frames();
    let keypoints = recording.num_keypoints();
    let dim = recording.spatial_dim();

    if frames < config.min_frames {
        return Err(FitError::format(format!(
            "recording '{}' has {} frames, need at least {}",
            recording.name, frames, config.min_frames
        )));
    }
    if keypoints != config.bodyparts.len() {
        return Err(FitError::format(format!(
            "recording '{}' has {} keypoints, config names {} bodyparts",
            recording.name,
            keypoints,
            config.bodyparts.len()
        )));
    }

    let mut mask = Array2::<bool>::from_elem((frames, keypoints), false);
    for t in 0..frames {
        for k in 0..keypoints {
            let below = recording.confidences[[t, k]] < config.conf_threshold;
            let broken = (0..dim).any(|d| !recording.coordinates[[t, k, d]].is_finite());
            mask[[t, k]] = below || broken;
        }
    }

    let filled = interpolate_flagged(&recording.coordinates, &mask, &recording.name)?;

    let use_indices = config.use_indices();
    let anterior = config.anterior_indices();
    let posterior = config.posterior_indices();

    let mut centroid = Array2::<f64>::zeros((frames, dim));
    let mut heading = Array1::<f64>::zeros(frames);
    for t in 0..frames {
        for d in 0..dim {
            let mut sum = 0.0;
            for &k in &use_indices {
                sum += filled[[t, k, d]];
            }
            centroid[[t, d]] = sum / use_indices.len() as f64;
        }

        let front = subset_mean_xy(&filled, t, &anterior);
        let back = subset_mean_xy(&filled, t, &posterior);
        heading[t] = (front.1 - back.1).atan2(front.0 - back.0);
    }

    // Egocentric frame: subtract the centroid, then rotate so the heading
    // axis points along +x. The z coordinate (if any) is translation-only.
    let mut egocentric = Array2::<f64>::zeros((frames, use_indices.len() * dim));
    for t in 0..frames {
        let (cos_h, sin_h) = (heading[t].cos(), heading[t].sin());
        for (j, &k) in use_indices.iter().enumerate() {
            let dx = filled[[t, k, 0]] - centroid[[t, 0]];
            let dy = filled[[t, k, 1]] - centroid[[t, 1]];
            egocentric[[t, j * dim]] = cos_h * dx + sin_h * dy;
            egocentric[[t, j * dim + 1]] = -sin_h * dx + cos_h * dy;
            if dim == 3 {
                egocentric[[t, j * dim + 2]] = filled[[t, k, 2]] - centroid[[t, 2]];
            }
        }
    }

    let outlier_mask = Array2::from_shape_fn((frames, use_indices.len()), |(t, j)| {
        mask[[t, use_indices[j]]]
    });

    let flagged = outlier_mask.iter().filter(|&&m| m).count();
    if flagged > 0 {
        tracing::debug!(
            recording = recording.name.as_str(),
            flagged_entries = flagged,
            total_entries = outlier_mask.len(),
            "formatter: low-confidence keypoints interpolated and flagged"
        );
    }

    Ok(AlignedPose {
        name: recording.name.clone(),
        egocentric,
        centroid,
        heading,
        outlier_mask,
    })
}

/// Linear interpolation of flagged entries per keypoint coordinate, anchored
/// on confident finite frames. Falls back to any finite frame when a keypoint
/// has no confident frame at all; errors only when a coordinate channel has
/// no finite value anywhere (no usable signal).
fn interpolate_flagged(
    coordinates: &Array3<f64>,
    mask: &Array2<bool>,
    name: &str,
) -> Result<Array3<f64>, FitError> {
    let (frames, keypoints, dim) = coordinates.dim();
    let mut filled = coordinates.clone();

    for k in 0..keypoints {
        let confident: Vec<usize> = (0..frames).filter(|&t| !mask[[t, k]]).collect();
        let anchors = if confident.is_empty() {
            // All frames below threshold: anchor on whatever finite values
            // exist so the sequence stays full-length.
            let finite: Vec<usize> = (0..frames)
                .filter(|&t| (0..dim).all(|d| coordinates[[t, k, d]].is_finite()))
                .collect();
            if finite.is_empty() {
                return Err(FitError::format(format!(
                    "recording '{name}': keypoint {k} has no usable signal in any frame"
                )));
            }
            finite
        } else {
            confident
        };

        for d in 0..dim {
            for t in 0..frames {
                if !mask[[t, k]] && coordinates[[t, k, d]].is_finite() {
                    continue;
                }
                let next = anchors.partition_point(|&a| a < t);
                let value = match (next.checked_sub(1).map(|i| anchors[i]), anchors.get(next)) {
                    (Some(lo), Some(&hi)) => {
                        let w = (t - lo) as f64 / (hi - lo) as f64;
                        coordinates[[lo, k, d]] * (1.0 - w) + coordinates[[hi, k, d]] * w
                    }
                    (Some(lo), None) => coordinates[[lo, k, d]],
                    (None, Some(&hi)) => coordinates[[hi, k, d]],
                    (None, None) => unreachable!("anchors is non-empty"),
                };
                filled[[t, k, d]] = value;
            }
        }
    }

    Ok(filled)
}

fn subset_mean_xy(coords: &Array3<f64>, t: usize, indices: &[usize]) -> (f64, f64) {
    let n = indices.len() as f64;
    let x = indices.iter().map(|&k| coords[[t, k, 0]]).sum::<f64>() / n;
    let y = indices.iter().map(|&k| coords[[t, k, 1]]).sum::<f64>() / n;
    (x, y)
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::Array;

    fn make_config(keypoints: usize) -> FitConfig {
        FitConfig {
            bodyparts: (0..keypoints).map(|i| format!("kp{i}")).collect(),
            anterior_bodyparts: vec!["kp0".into()],
            posterior_bodyparts: vec![format!("kp{}", keypoints - 1)],
            min_frames: 3,
            ..FitConfig::default()
        }
    }

    fn make_recording(frames: usize, keypoints: usize, confidence: f64) -> Recording {
        let coordinates = Array3::from_shape_fn((frames, keypoints, 2), |(t, k, d)| {
            t as f64 * 0.1 + k as f64 + d as f64 * 0.5
        });
        let confidences = Array::from_elem((frames, keypoints), confidence);
        Recording::new("rec", coordinates, confidences).unwrap()
    }

    #[test]
    fn output_length_equals_input_length() {
        let recording = make_recording(20, 4, 1.0);
        let pose = format_recording(&recording, &make_config(4)).unwrap();
        assert_eq!(pose.num_frames(), 20);
        assert_eq!(pose.centroid.dim(), (20, 2));
        assert_eq!(pose.heading.len(), 20);
    }

    #[test]
    fn too_few_frames_rejected() {
        let recording = make_recording(2, 4, 1.0);
        let err = format_recording(&recording, &make_config(4)).unwrap_err();
        assert!(matches!(err, FitError::Format { .. }));
    }

    #[test]
    fn zero_confidence_recording_is_flagged_not_dropped() {
        let recording = make_recording(15, 4, 0.0);
        let pose = format_recording(&recording, &make_config(4)).unwrap();
        assert_eq!(pose.num_frames(), 15);
        assert!(pose.outlier_mask.iter().all(|&m| m));
    }

    #[test]
    fn low_confidence_entries_are_interpolated() {
        let mut recording = make_recording(10, 4, 1.0);
        // Knock out keypoint 1 in frame 5; interpolation should bridge it.
        recording.confidences[[5, 1]] = 0.0;
        recording.coordinates[[5, 1, 0]] = 1000.0;
        let pose = format_recording(&recording, &make_config(4)).unwrap();
        assert!(pose.outlier_mask[[5, 1]]);
        // Egocentric values stay in the range of the neighbors, not 1000.
        assert!(pose.egocentric.row(5).iter().all(|v| v.abs() < 10.0));
    }

    #[test]
    fn all_nan_keypoint_is_an_error() {
        let mut recording = make_recording(10, 4, 1.0);
        for t in 0..10 {
            for d in 0..2 {
                recording.coordinates[[t, 2, d]] = f64::NAN;
            }
        }
        assert!(format_recording(&recording, &make_config(4)).is_err());
    }

    #[test]
    fn heading_points_along_anterior_axis() {
        // Anterior keypoint sits to the +y of the posterior one: heading pi/2.
        let mut coordinates = Array3::zeros((5, 2, 2));
        for t in 0..5 {
            coordinates[[t, 0, 1]] = 1.0; // kp0 (anterior) at (0, 1)
        }
        let confidences = Array::from_elem((5, 2), 1.0);
        let recording = Recording::new("rec", coordinates, confidences).unwrap();
        let pose = format_recording(&recording, &make_config(2)).unwrap();
        for t in 0..5 {
            assert!((pose.heading[t] - std::f64::consts::FRAC_PI_2).abs() < 1e-12);
        }
    }
}
