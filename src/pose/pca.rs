use nalgebra::{DMatrix, DVector};
use serde::{Deserialize, Serialize};

use crate::error::FitError;
use crate::types::AlignedPose;

const RANK_TOLERANCE: f64 = 1e-10;

/// Fixed orthonormal projection from egocentric pose space to the latent
/// space. Immutable after fitting.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LatentBasis {
    /// Global mean of the egocentric coordinates, length `pose_dim`.
    pub mean: DVector<f64>,
    /// Orthonormal columns, `pose_dim x latent_dim`, ordered by explained
    /// variance.
    pub components: DMatrix<f64>,
    /// Eigenvalue of each retained component.
    pub explained_variance: Vec<f64>,
}

impl LatentBasis {
    pub fn pose_dim(&self) -> usize {
        self.components.nrows()
    }

    pub fn latent_dim(&self) -> usize {
        self.components.ncols()
    }

    /// Project one egocentric pose row into the latent space.
    pub fn project(&self, pose: &DVector<f64>) -> DVector<f64> {
        self.components.tr_mul(&(pose - &self.mean))
    }

    /// Reconstruct an egocentric pose row from a latent vector.
    pub fn reconstruct(&self, latent: &DVector<f64>) -> DVector<f64> {
        &self.components * latent + &self.mean
    }
}

/// Fit a PCA basis over the aligned poses of all recordings.
///
/// Frames where the majority of keypoints are outlier-flagged are excluded
/// from the fit (they still get projected later; the basis is just not
/// estimated from them). Centering uses the global mean. Deterministic given
/// identical input ordering: eigenvectors are sign-fixed so the largest
/// absolute loading is positive.
pub fn fit_pca(poses: &[AlignedPose], latent_dim: usize) -> Result<LatentBasis, FitError> {
    let pose_dim = poses
        .first()
        .map(|p| p.egocentric.dim().1)
        .ok_or_else(|| FitError::dimensionality("no aligned poses supplied"))?;

    if latent_dim > pose_dim {
        return Err(FitError::dimensionality(format!(
            "latent_dim {latent_dim} exceeds pose dimension {pose_dim}"
        )));
    }

    let mut rows: Vec<usize> = Vec::new();
    let mut clean_count = 0usize;
    for pose in poses {
        let frames = pose.num_frames();
        let keypoints = pose.outlier_mask.dim().1;
        for t in 0..frames {
            let flagged = (0..keypoints).filter(|&k| pose.outlier_mask[[t, k]]).count();
            if flagged * 2 < keypoints {
                clean_count += 1;
            }
        }
        rows.push(frames);
    }
    let total_frames: usize = rows.iter().sum();
    // A heavily occluded dataset still gets a basis from all of its frames.
    let use_all = clean_count < latent_dim.max(2);
    let sample_count = if use_all { total_frames } else { clean_count };

    if sample_count < latent_dim {
        return Err(FitError::dimensionality(format!(
            "{sample_count} usable frames cannot support latent_dim {latent_dim}"
        )));
    }

    let mut mean = DVector::<f64>::zeros(pose_dim);
    let visit = |f: &mut dyn FnMut(&[f64])| {
        for pose in poses {
            let keypoints = pose.outlier_mask.dim().1;
            for t in 0..pose.num_frames() {
                let flagged = (0..keypoints).filter(|&k| pose.outlier_mask[[t, k]]).count();
                if !use_all && flagged * 2 >= keypoints {
                    continue;
                }
                f(pose.egocentric.row(t).to_slice().expect("contiguous row"));
            }
        }
    };

    visit(&mut |row| {
        for (i, &v) in row.iter().enumerate() {
            mean[i] += v;
        }
    });
    mean /= sample_count as f64;

    let mut cov = DMatrix::<f64>::zeros(pose_dim, pose_dim);
    visit(&mut |row| {
        for i in 0..pose_dim {
            let di = row[i] - mean[i];
            for j in i..pose_dim {
                cov[(i, j)] += di * (row[j] - mean[j]);
            }
        }
    });
    cov /= sample_count as f64;
    for i in 0..pose_dim {
        for j in 0..i {
            cov[(i, j)] = cov[(j, i)];
        }
    }

    let eigen = cov.symmetric_eigen();
    let mut order: Vec<usize> = (0..pose_dim).collect();
    order.sort_by(|&a, &b| eigen.eigenvalues[b].total_cmp(&eigen.eigenvalues[a]));

    let leading = eigen.eigenvalues[order[0]].max(0.0);
    let cutoff = eigen.eigenvalues[order[latent_dim - 1]];
    if cutoff <= leading * RANK_TOLERANCE || cutoff <= 0.0 {
        return Err(FitError::dimensionality(format!(
            "data rank is below requested latent_dim {latent_dim}"
        )));
    }

    let mut components = DMatrix::<f64>::zeros(pose_dim, latent_dim);
    let mut explained_variance = Vec::with_capacity(latent_dim);
    for (out_col, &src_col) in order.iter().take(latent_dim).enumerate() {
        let col = eigen.eigenvectors.column(src_col);
        let peak = col
            .iter()
            .enumerate()
            .max_by(|a, b| a.1.abs().total_cmp(&b.1.abs()))
            .map(|(i, _)| i)
            .unwrap_or(0);
        let sign = if col[peak] < 0.0 { -1.0 } else { 1.0 };
        for r in 0..pose_dim {
            components[(r, out_col)] = sign * col[r];
        }
        explained_variance.push(eigen.eigenvalues[src_col]);
    }

    let total_variance: f64 = eigen.eigenvalues.iter().map(|v| v.max(0.0)).sum();
    if total_variance > 0.0 {
        let captured: f64 = explained_variance.iter().sum();
        tracing::info!(
            latent_dim,
            explained = format!("{:.1}%", 100.0 * captured / total_variance),
            "pca: fitted latent basis"
        );
    }

    Ok(LatentBasis {
        mean,
        components,
        explained_variance,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::{Array1, Array2};

    fn make_pose(frames: usize, pose_dim: usize, f: impl Fn(usize, usize) -> f64) -> AlignedPose {
        AlignedPose {
            name: "rec".into(),
            egocentric: Array2::from_shape_fn((frames, pose_dim), |(t, j)| f(t, j)),
            centroid: Array2::zeros((frames, 2)),
            heading: Array1::zeros(frames),
            outlier_mask: Array2::from_elem((frames, pose_dim / 2), false),
        }
    }

    #[test]
    fn components_are_orthonormal() {
        let pose = make_pose(200, 6, |t, j| {
            let phase = t as f64 * 0.1;
            (phase + j as f64).sin() + 0.3 * (phase * 1.7 + j as f64 * 2.0).cos()
        });
        let basis = fit_pca(&[pose], 3).unwrap();
        let gram = basis.components.tr_mul(&basis.components);
        for i in 0..3 {
            for j in 0..3 {
                let expected = if i == j { 1.0 } else { 0.0 };
                assert!((gram[(i, j)] - expected).abs() < 1e-8);
            }
        }
    }

    #[test]
    fn variance_is_ordered_descending() {
        // One frequency per column keeps the covariance full rank.
        let pose = make_pose(300, 4, |t, j| {
            (t as f64 * 0.05 * (j + 1) as f64).sin() * (4 - j) as f64
        });
        let basis = fit_pca(&[pose], 3).unwrap();
        for w in basis.explained_variance.windows(2) {
            assert!(w[0] >= w[1]);
        }
    }

    #[test]
    fn excessive_latent_dim_rejected() {
        let pose = make_pose(50, 4, |t, j| (t + j) as f64);
        assert!(matches!(
            fit_pca(&[pose], 5),
            Err(FitError::Dimensionality { .. })
        ));
    }

    #[test]
    fn rank_deficient_data_rejected() {
        // Every column identical: rank 1.
        let pose = make_pose(50, 4, |t, _| t as f64);
        assert!(fit_pca(&[pose], 2).is_err());
    }

    #[test]
    fn deterministic_across_repeated_fits() {
        let pose = make_pose(100, 6, |t, j| ((t * 7 + j * 13) % 23) as f64 * 0.1);
        let a = fit_pca(&[pose.clone()], 2).unwrap();
        let b = fit_pca(&[pose], 2).unwrap();
        assert_eq!(a.components, b.components);
        assert_eq!(a.mean, b.mean);
    }

    #[test]
    fn project_reconstruct_round_trip_on_basis_span() {
        let pose = make_pose(200, 6, |t, j| {
            let phase = t as f64 * 0.1;
            (phase + j as f64).sin() + 0.4 * (phase * 2.3 + j as f64 * 1.7).cos()
        });
        let basis = fit_pca(&[pose], 3).unwrap();
        let latent = DVector::from_vec(vec![0.5, -1.0, 0.25]);
        let recovered = basis.project(&basis.reconstruct(&latent));
        for i in 0..3 {
            assert!((recovered[i] - latent[i]).abs() < 1e-9);
        }
    }
}
