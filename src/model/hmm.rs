//! Discrete-state inference: forward filtering, backward sampling, and the
//! sticky Dirichlet transition update. All recursions run in log space.

use nalgebra::DMatrix;
use ndarray::Array2;
use rand::rngs::StdRng;
use rand::Rng;

use crate::model::draw;

pub(crate) fn log_sum_exp(xs: &[f64]) -> f64 {
    let max = xs.iter().copied().fold(f64::NEG_INFINITY, f64::max);
    if !max.is_finite() {
        return max;
    }
    max + xs.iter().map(|&x| (x - max).exp()).sum::<f64>().ln()
}

/// Sample a state sequence from its posterior given per-frame log-likelihoods
/// (`frames x states`) and a row-stochastic transition matrix.
///
/// Returns the sampled sequence and the forward normalizer
/// `log p(observations)` under the current parameters.
pub(crate) fn forward_filter_backward_sample(
    log_lik: &Array2<f64>,
    transitions: &DMatrix<f64>,
    rng: &mut StdRng,
) -> (Vec<usize>, f64) {
    let (frames, states) = log_lik.dim();
    if frames == 0 {
        return (Vec::new(), 0.0);
    }

    let log_trans =
        DMatrix::from_fn(states, states, |i, j| transitions[(i, j)].max(1e-300).ln());

    // Forward pass, normalized per frame to avoid drift on long recordings.
    let mut alpha = Array2::<f64>::zeros((frames, states));
    let mut log_norm = 0.0;
    let uniform_init = -(states as f64).ln();
    let mut scratch = vec![0.0f64; states];

    for i in 0..states {
        alpha[[0, i]] = uniform_init + log_lik[[0, i]];
    }
    let norm0 = log_sum_exp(alpha.row(0).to_slice().expect("contiguous row"));
    log_norm += norm0;
    for i in 0..states {
        alpha[[0, i]] -= norm0;
    }

    for t in 1..frames {
        for i in 0..states {
            for (j, slot) in scratch.iter_mut().enumerate() {
                *slot = alpha[[t - 1, j]] + log_trans[(j, i)];
            }
            alpha[[t, i]] = log_lik[[t, i]] + log_sum_exp(&scratch);
        }
        let norm = log_sum_exp(alpha.row(t).to_slice().expect("contiguous row"));
        log_norm += norm;
        for i in 0..states {
            alpha[[t, i]] -= norm;
        }
    }

    // Backward sampling.
    let mut z = vec![0usize; frames];
    z[frames - 1] = sample_categorical_log(
        alpha.row(frames - 1).to_slice().expect("contiguous row"),
        rng,
    );
    for t in (0..frames - 1).rev() {
        for (j, slot) in scratch.iter_mut().enumerate() {
            *slot = alpha[[t, j]] + log_trans[(j, z[t + 1])];
        }
        z[t] = sample_categorical_log(&scratch, rng);
    }

    (z, log_norm)
}

fn sample_categorical_log(log_weights: &[f64], rng: &mut StdRng) -> usize {
    let norm = log_sum_exp(log_weights);
    let mut u: f64 = rng.gen();
    for (i, &lw) in log_weights.iter().enumerate() {
        u -= (lw - norm).exp();
        if u <= 0.0 {
            return i;
        }
    }
    log_weights.len() - 1
}

/// Count labeled transitions across all recordings.
pub(crate) fn count_transitions(sequences: &[&[usize]], states: usize) -> DMatrix<f64> {
    let mut counts = DMatrix::<f64>::zeros(states, states);
    for z in sequences {
        for pair in z.windows(2) {
            counts[(pair[0], pair[1])] += 1.0;
        }
    }
    counts
}

/// Resample the transition matrix from its Dirichlet posterior with a sticky
/// bias `kappa` on the diagonal. Each row is renormalized to sum to one.
pub(crate) fn resample_transitions(
    counts: &DMatrix<f64>,
    alpha: f64,
    kappa: f64,
    rng: &mut StdRng,
) -> DMatrix<f64> {
    let states = counts.nrows();
    let base = alpha / states as f64;
    let mut transitions = DMatrix::<f64>::zeros(states, states);
    let mut weights = vec![0.0f64; states];
    for i in 0..states {
        for (j, w) in weights.iter_mut().enumerate() {
            *w = base + counts[(i, j)] + if i == j { kappa } else { 0.0 };
        }
        let row = draw::dirichlet(rng, &weights);
        for (j, p) in row.into_iter().enumerate() {
            transitions[(i, j)] = p;
        }
    }
    transitions
}
