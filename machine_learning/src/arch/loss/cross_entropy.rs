use ndarray::{Array2, ArrayView2, Zip};

use super::LossFn;

const EPSILON: f32 = 1e-5;

/// Binary cross entropy summed over the classes and averaged over the batch.
#[derive(Default, Clone, Copy)]
pub struct CrossEntropy;

impl CrossEntropy {
    pub fn new() -> Self {
        Self
    }
}

impl LossFn for CrossEntropy {
    fn loss(&self, y_pred: ArrayView2<f32>, y: ArrayView2<f32>) -> f32 {
        let rows = y_pred.nrows().max(1) as f32;

        let total = Zip::from(&y_pred).and(&y).fold(0., |acc, &p, &y| {
            acc - (y * (p + EPSILON).ln() + (1. - y) * (1. - p + EPSILON).ln())
        });

        total / rows
    }

    fn loss_prime(&self, y_pred: ArrayView2<f32>, y: ArrayView2<f32>) -> Array2<f32> {
        let rows = y_pred.nrows().max(1) as f32;

        Zip::from(&y_pred)
            .and(&y)
            .map_collect(|&p, &y| (-(y / (p + EPSILON)) + (1. - y) / (1. - p + EPSILON)) / rows)
    }
}
