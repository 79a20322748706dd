use rayon::prelude::*;

/// Rescales `grad` so that its L2 norm is at most `max_norm`.
///
/// A non positive `max_norm` disables clipping.
///
/// # Returns
/// The norm of the gradient before clipping.
pub fn clip_by_norm(grad: &mut [f32], max_norm: f32) -> f32 {
    let norm = grad.par_iter().map(|g| g * g).sum::<f32>().sqrt();

    if max_norm > 0. && norm > max_norm {
        let scale = max_norm / norm;
        grad.par_iter_mut().for_each(|g| *g *= scale);
    }

    norm
}
