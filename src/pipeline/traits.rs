use ndarray::Array2;
use rand::rngs::StdRng;

/// Policy for seeding the discrete syllable sequences before the first
/// sweep, given the directly-projected latent trajectories.
pub trait SyllableInitializer: Send + Sync {
    /// Return one label sequence per recording; each must have the same
    /// length as the corresponding latent trajectory and labels in
    /// `0..num_syllables`.
    fn initialize(
        &self,
        latents: &[Array2<f64>],
        num_syllables: usize,
        rng: &mut StdRng,
    ) -> Vec<Vec<usize>>;
}
