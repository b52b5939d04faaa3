/// Random utility functions
use rand::prelude::*;

#[inline(always)]
pub fn dot(x: &[f32], y: &[f32]) -> f32 {
    x.iter().zip(y.iter()).map(|(xi, yi)| xi * yi).sum()
}

#[inline(always)]
pub fn l2norm(x: &[f32]) -> f32 {
    dot(x, x).sqrt()
}

/// y += a * x
#[inline(always)]
pub fn axpy(a: f32, x: &[f32], y: &mut [f32]) {
    y.iter_mut().zip(x.iter()).for_each(|(yi, xi)| *yi += a * xi);
}

#[inline]
pub fn all_finite(x: &[f32]) -> bool {
    x.iter().all(|xi| xi.is_finite())
}

/// Fills a vector with uniform noise in [-1, 1] and rescales it to unit length.
pub fn random_unit_vector(out: &mut [f32], rng: &mut impl Rng) {
    let mut norm = 0f32;
    out.iter_mut().for_each(|ei| {
        *ei = 2f32 * rng.gen::<f32>() - 1f32;
        norm += ei.powf(2f32);
    });
    norm = norm.sqrt();
    if norm > 0. {
        out.iter_mut().for_each(|ei| *ei /= norm);
    }
}

/// Samples `amount` distinct positions from `0..length`, returned in increasing order so that
/// ordered features keep their relative positions.
pub fn sample_ordered_indices(length: usize, amount: usize, rng: &mut impl Rng) -> Vec<usize> {
    if amount >= length {
        return (0..length).collect()
    }
    let mut idxs = rand::seq::index::sample(rng, length, amount).into_vec();
    idxs.sort_unstable();
    idxs
}
