use crate::model::states::ModelState;
use crate::types::{ResultRecord, ResultSet};

/// Project a model state into per-recording result records.
///
/// Pure function of its inputs: calling it twice on the same state yields
/// identical records. Sequences are emitted at the recording's full frame
/// count (the formatter never drops frames, so no trimming offsets apply).
pub(crate) fn extract(state: &ModelState, smoothing_window: usize) -> ResultSet {
    state
        .recordings
        .iter()
        .map(|rec| {
            let frames = rec.num_frames();
            let syllable = if smoothing_window >= 3 {
                median_filter_labels(&rec.z, smoothing_window)
            } else {
                rec.z.clone()
            };
            let record = ResultRecord {
                syllable,
                latent_state: (0..frames)
                    .map(|t| rec.x.row(t).to_vec())
                    .collect(),
                centroid: (0..frames)
                    .map(|t| rec.v.row(t).to_vec())
                    .collect(),
                heading: rec.h.to_vec(),
            };
            (rec.name.clone(), record)
        })
        .collect()
}

/// Median filter over integer labels, window centered and clamped at the
/// boundaries. Removes single-frame label flickers.
fn median_filter_labels(labels: &[usize], window: usize) -> Vec<usize> {
    let half = window / 2;
    let n = labels.len();
    let mut scratch = Vec::with_capacity(window);
    (0..n)
        .map(|t| {
            let lo = t.saturating_sub(half);
            let hi = (t + half + 1).min(n);
            scratch.clear();
            scratch.extend_from_slice(&labels[lo..hi]);
            scratch.sort_unstable();
            scratch[scratch.len() / 2]
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::FitConfig;
    use crate::model::draw;
    use crate::model::params::{HyperParams, ModelParams};
    use crate::model::states::RecordingStates;
    use nalgebra::DVector;
    use ndarray::{Array1, Array2};

    fn make_state() -> ModelState {
        let mut rng = draw::derive_rng(0, 0, 0);
        let params = ModelParams::init(4, 2, 3, &DVector::from_element(2, 1.0), 10.0, &mut rng);
        ModelState {
            recordings: vec![RecordingStates {
                name: "session1".into(),
                z: vec![0, 0, 1, 0, 0, 2, 2, 2],
                x: Array2::from_shape_fn((8, 2), |(t, d)| (t * 2 + d) as f64),
                v: Array2::from_shape_fn((8, 2), |(t, d)| t as f64 + d as f64 * 0.5),
                h: Array1::from_shape_fn(8, |t| t as f64 * 0.1),
            }],
            params,
            hyperparams: HyperParams::from_config(&FitConfig::default()),
        }
    }

    #[test]
    fn extraction_is_deterministic() {
        let state = make_state();
        let a = extract(&state, 0);
        let b = extract(&state, 0);
        assert_eq!(a, b);
    }

    #[test]
    fn lengths_match_recording_frame_count() {
        let results = extract(&make_state(), 0);
        let record = &results["session1"];
        assert_eq!(record.syllable.len(), 8);
        assert_eq!(record.latent_state.len(), 8);
        assert_eq!(record.centroid.len(), 8);
        assert_eq!(record.heading.len(), 8);
        assert_eq!(record.latent_state[3], vec![6.0, 7.0]);
    }

    #[test]
    fn median_filter_removes_single_frame_flicker() {
        let labels = vec![0, 0, 1, 0, 0, 2, 2, 2];
        let filtered = median_filter_labels(&labels, 3);
        assert_eq!(filtered, vec![0, 0, 0, 0, 0, 2, 2, 2]);
    }

    #[test]
    fn smoothing_window_is_applied_through_extract() {
        let state = make_state();
        let smoothed = extract(&state, 3);
        assert_eq!(smoothed["session1"].syllable, vec![0, 0, 0, 0, 0, 2, 2, 2]);
    }
}
