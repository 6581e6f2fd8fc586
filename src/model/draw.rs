//! Seed-threaded sampling primitives for the Gibbs sweeps.
//!
//! Every random draw in the crate flows through an `StdRng` derived
//! deterministically from `(seed, iteration, stream)`, so a resumed fit
//! replays the exact trajectory of an uninterrupted one regardless of
//! thread scheduling.

use nalgebra::{Cholesky, DMatrix, DVector};
use rand::distributions::Distribution;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use statrs::distribution::{Gamma, Normal};

/// Derive the RNG for one sampling stage. `stream` disambiguates stages and
/// per-recording lanes within an iteration.
pub(crate) fn derive_rng(seed: u64, iteration: u64, stream: u64) -> StdRng {
    let mut key = seed ^ 0x5851_f42d_4c95_7f2d;
    key = key
        .wrapping_add(iteration.wrapping_mul(0x9e37_79b9_7f4a_7c15))
        .wrapping_add(stream.wrapping_mul(0xbf58_476d_1ce4_e5b9));
    // splitmix64 finalizer to decorrelate nearby (iteration, stream) pairs
    key = (key ^ (key >> 30)).wrapping_mul(0xbf58_476d_1ce4_e5b9);
    key = (key ^ (key >> 27)).wrapping_mul(0x94d0_49bb_1331_11eb);
    StdRng::seed_from_u64(key ^ (key >> 31))
}

pub(crate) fn standard_normal(rng: &mut StdRng) -> f64 {
    Normal::new(0.0, 1.0)
        .expect("unit normal parameters")
        .sample(rng)
}

pub(crate) fn standard_normal_vector(rng: &mut StdRng, n: usize) -> DVector<f64> {
    let normal = Normal::new(0.0, 1.0).expect("unit normal parameters");
    DVector::from_iterator(n, (0..n).map(|_| normal.sample(rng)))
}

pub(crate) fn gamma(rng: &mut StdRng, shape: f64, rate: f64) -> f64 {
    let shape = shape.max(1e-6);
    let rate = rate.max(1e-12);
    Gamma::new(shape, rate)
        .expect("positive gamma parameters")
        .sample(rng)
}

/// Draw from InverseGamma(shape, scale).
pub(crate) fn inverse_gamma(rng: &mut StdRng, shape: f64, scale: f64) -> f64 {
    1.0 / gamma(rng, shape, scale).max(1e-300)
}

/// Draw one transition-matrix row from Dirichlet(weights).
pub(crate) fn dirichlet(rng: &mut StdRng, weights: &[f64]) -> Vec<f64> {
    let mut draws: Vec<f64> = weights.iter().map(|&w| gamma(rng, w, 1.0)).collect();
    let total: f64 = draws.iter().sum();
    if total <= 0.0 {
        let uniform = 1.0 / draws.len() as f64;
        draws.iter_mut().for_each(|d| *d = uniform);
    } else {
        draws.iter_mut().for_each(|d| *d /= total);
    }
    draws
}

/// Draw from a von Mises distribution (Best & Fisher rejection sampler).
pub(crate) fn von_mises(rng: &mut StdRng, mu: f64, kappa: f64) -> f64 {
    use std::f64::consts::PI;
    if kappa < 1e-6 {
        return rng.gen_range(-PI..PI);
    }
    let a = 1.0 + (1.0 + 4.0 * kappa * kappa).sqrt();
    let b = (a - (2.0 * a).sqrt()) / (2.0 * kappa);
    let r = (1.0 + b * b) / (2.0 * b);
    loop {
        let u1: f64 = rng.gen();
        let z = (PI * u1).cos();
        let f = (1.0 + r * z) / (r + z);
        let c = kappa * (r - f);
        let u2: f64 = rng.gen();
        if c * (2.0 - c) - u2 > 0.0 || (c / u2).ln() + 1.0 - c >= 0.0 {
            let u3: f64 = rng.gen();
            let theta = if u3 > 0.5 { mu + f.acos() } else { mu - f.acos() };
            return wrap_angle(theta);
        }
    }
}

/// Cholesky factorization with escalating diagonal jitter. Covariance and
/// precision matrices in the sweeps are positive definite up to roundoff;
/// the jitter absorbs the roundoff cases without changing the math
/// meaningfully.
pub(crate) fn cholesky_with_jitter(matrix: DMatrix<f64>) -> Cholesky<f64, nalgebra::Dyn> {
    let n = matrix.nrows();
    let mut jitter = 0.0;
    loop {
        let mut attempt = matrix.clone();
        for i in 0..n {
            attempt[(i, i)] += jitter;
        }
        if let Some(chol) = Cholesky::new(attempt) {
            return chol;
        }
        jitter = if jitter == 0.0 { 1e-10 } else { jitter * 10.0 };
        if jitter > 1e6 {
            let diag = DMatrix::from_fn(n, n, |i, j| {
                if i == j {
                    matrix[(i, i)].abs().max(1.0)
                } else {
                    0.0
                }
            });
            return Cholesky::new(diag).expect("positive diagonal matrix");
        }
    }
}

/// Draw from a multivariate normal with the given mean and covariance.
pub(crate) fn sample_mvn(rng: &mut StdRng, mean: &DVector<f64>, cov: DMatrix<f64>) -> DVector<f64> {
    let n = mean.len();
    let symmetrized = (&cov + cov.transpose()) * 0.5;
    let chol = cholesky_with_jitter(symmetrized);
    mean + chol.l() * standard_normal_vector(rng, n)
}

/// Wrap an angle into `(-pi, pi]`.
pub(crate) fn wrap_angle(theta: f64) -> f64 {
    use std::f64::consts::PI;
    let wrapped = theta.rem_euclid(2.0 * PI);
    if wrapped > PI {
        wrapped - 2.0 * PI
    } else {
        wrapped
    }
}
