use ndarray::{Array2, ArrayView2};

/// The weight of the auxiliary class head in the mixed loss.
pub const MIX_CLASS_WEIGHT: f32 = 0.1;

/// A label loss over `[batch, classes]` predictions.
pub trait LossFn: Send {
    fn loss(&self, y_pred: ArrayView2<f32>, y: ArrayView2<f32>) -> f32;

    /// The gradient of `loss` with respect to `y_pred`.
    fn loss_prime(&self, y_pred: ArrayView2<f32>, y: ArrayView2<f32>) -> Array2<f32>;

    /// Combines the main predictions with an auxiliary class head, both scored against `y`.
    fn loss_mix(&self, y_pred: ArrayView2<f32>, y_class: ArrayView2<f32>, y: ArrayView2<f32>) -> f32 {
        self.loss(y_pred, y) + MIX_CLASS_WEIGHT * self.loss(y_class, y)
    }

    /// The gradients of `loss_mix` with respect to `y_pred` and `y_class`.
    fn loss_mix_prime(
        &self,
        y_pred: ArrayView2<f32>,
        y_class: ArrayView2<f32>,
        y: ArrayView2<f32>,
    ) -> (Array2<f32>, Array2<f32>) {
        let d_class = self.loss_prime(y_class, y) * MIX_CLASS_WEIGHT;
        (self.loss_prime(y_pred, y), d_class)
    }
}
