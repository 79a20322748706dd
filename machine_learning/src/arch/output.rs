use ndarray::{Array2, ArrayD, ArrayView2, ArrayViewD};

/// One input batch as seen by a model.
#[derive(Debug)]
pub struct ModelInput<'a> {
    /// `[batch, features]` or `[batch, frames, features]`.
    pub raw_features: ArrayViewD<'a, f32>,
    /// `[batch, vocab_size]` multi-hot labels.
    pub labels: ArrayView2<'a, f32>,
    /// The true amount of frames of each example.
    pub num_frames: &'a [usize],
}

/// Assigns a new value to a non trainable variable, e.g. a moving average.
#[derive(Debug, Clone, PartialEq)]
pub struct UpdateOp {
    pub variable: String,
    pub value: Vec<f32>,
}

/// The result bundle of a model's forward pass.
///
/// Only `predictions` is required, absent optional terms default to zero and an empty
/// `update_ops` means no barrier is needed before the label loss is read.
#[derive(Debug, Clone)]
pub struct ModelOutput {
    pub predictions: ArrayD<f32>,
    pub bottleneck: Option<Array2<f32>>,
    pub predictions_class: Option<ArrayD<f32>>,
    pub loss: Option<f32>,
    pub loss_sparse: Option<f32>,
    pub regularization_loss: Option<f32>,
    pub update_ops: Vec<UpdateOp>,
}

impl ModelOutput {
    pub fn new(predictions: ArrayD<f32>) -> Self {
        Self {
            predictions,
            bottleneck: None,
            predictions_class: None,
            loss: None,
            loss_sparse: None,
            regularization_loss: None,
            update_ops: Vec::new(),
        }
    }

    /// The bottleneck activations, a zero scalar when the model has none.
    pub fn bottleneck_or_zero(&self) -> ArrayD<f32> {
        match &self.bottleneck {
            Some(b) => b.clone().into_dyn(),
            None => ArrayD::zeros(vec![]),
        }
    }

    pub fn loss_sparse_or_zero(&self) -> f32 {
        self.loss_sparse.unwrap_or(0.)
    }

    pub fn regularization_loss_or_zero(&self) -> f32 {
        self.regularization_loss.unwrap_or(0.)
    }
}

/// The gradient of the label loss with respect to the model outputs.
#[derive(Debug, Clone)]
pub struct OutputGrad {
    /// Shaped like `ModelOutput::predictions`, `None` when the model provided its own loss.
    pub predictions: Option<ArrayD<f32>>,
    /// Shaped like `ModelOutput::predictions_class` when the mixed loss was used.
    pub predictions_class: Option<ArrayD<f32>>,
    pub regularization_penalty: f32,
}

impl OutputGrad {
    pub fn predictions(&self) -> Option<ArrayViewD<'_, f32>> {
        self.predictions.as_ref().map(|p| p.view())
    }
}
