use ndarray::{Array2, ArrayView2, Zip};

use super::LossFn;

/// Squared error summed over the classes and averaged over the batch.
#[derive(Default, Clone, Copy)]
pub struct Mse;

impl LossFn for Mse {
    fn loss(&self, y_pred: ArrayView2<f32>, y: ArrayView2<f32>) -> f32 {
        let rows = y_pred.nrows().max(1) as f32;
        let total = Zip::from(&y_pred)
            .and(&y)
            .fold(0., |acc, &p, &y| acc + (p - y) * (p - y));

        total / rows
    }

    fn loss_prime(&self, y_pred: ArrayView2<f32>, y: ArrayView2<f32>) -> Array2<f32> {
        let scale = 2. / y_pred.nrows().max(1) as f32;
        Zip::from(&y_pred).and(&y).map_collect(|&p, &y| scale * (p - y))
    }
}
