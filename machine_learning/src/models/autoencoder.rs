use ndarray::{Array1, Array2, ArrayView2, Axis, Ix2};
use rand::rngs::StdRng;

use crate::{
    MlErr, Result,
    arch::{
        Activation, Model, ModelInput, ModelOutput, ModelParams, OutputGrad, UpdateOp,
        layers::Dense,
    },
    variables::{Gradients, Variable, VariableStore},
};

const SCOPE: &str = "model";
const L2_PENALTY: f32 = 1e-8;

/// Target mean activation of the bottleneck units.
const SPARSITY_TARGET: f32 = 0.05;
const SPARSITY_WEIGHT: f32 = 0.1;
const MOVING_MEAN_DECAY: f32 = 0.99;
const MOVING_MEAN: &str = "model/hidden_2/moving_mean";

/// Reconstructs the multi-hot label vector through a two layer bottleneck:
/// `hidden_1 -> hidden_2 -> output_1 -> output_2`.
pub struct LabelsAutoencoder {
    params: ModelParams,
    layers: [Dense; 4],
    bottleneck: Array2<f32>,
}

impl LabelsAutoencoder {
    pub fn new(params: ModelParams) -> Self {
        let ModelParams {
            vocab_size: v,
            hidden_size_1: h1,
            hidden_size_2: h2,
        } = params;

        Self {
            params,
            layers: [
                Dense::new("hidden_1", (v, h1), Some(Activation::Relu)),
                Dense::new("hidden_2", (h1, h2), Some(Activation::Sigmoid)),
                Dense::new("output_1", (h2, h1), Some(Activation::Relu)),
                Dense::new("output_2", (h1, v), Some(Activation::Sigmoid)),
            ],
            bottleneck: Array2::zeros((0, 0)),
        }
    }

    /// Runs every layer, returns the bottleneck and the reconstruction.
    fn run(&mut self, vars: &VariableStore, x: ArrayView2<f32>) -> Result<(Array2<f32>, Array2<f32>)> {
        if x.ncols() != self.params.vocab_size {
            return Err(MlErr::ShapeMismatch {
                name: "labels".into(),
                got: x.shape().to_vec(),
                expected: vec![x.nrows(), self.params.vocab_size],
            });
        }

        let mut a = x.to_owned();
        let mut bottleneck = None;

        for layer in self.layers.iter_mut() {
            let (w, b) = layer.params(SCOPE, vars)?;
            a = layer.forward(w, b, a.view()).to_owned();

            if layer.name() == "hidden_2" {
                bottleneck = Some(a.clone());
            }
        }

        let bottleneck = bottleneck.unwrap_or_else(|| Array2::zeros((x.nrows(), 0)));
        self.bottleneck = bottleneck.clone();
        Ok((bottleneck, a))
    }

    /// Backpropagates from the reconstruction, injecting `d_bottleneck` at the bottleneck.
    fn backprop(
        &self,
        vars: &VariableStore,
        d_pred: Array2<f32>,
        d_bottleneck: Option<Array2<f32>>,
    ) -> Result<Gradients> {
        let mut grads = Gradients::new();
        let mut d = d_pred;

        for layer in self.layers.iter().rev() {
            if layer.name() == "hidden_2" {
                if let Some(extra) = &d_bottleneck {
                    d += extra;
                }
            }

            let (w, _) = layer.params(SCOPE, vars)?;
            let (dw, db, dx) = layer.backward(w, d);
            grads.accumulate(&layer.weights_name(SCOPE), &flat(dw));
            grads.accumulate(&layer.biases_name(SCOPE), &flat_1(db));
            d = dx;
        }

        Ok(grads)
    }

    fn d_predictions(&self, grad: &OutputGrad) -> Result<Array2<f32>> {
        match &grad.predictions {
            Some(d) => d
                .clone()
                .into_dimensionality::<Ix2>()
                .map_err(|_| MlErr::RankMismatch {
                    name: "predictions gradient".into(),
                    got: d.ndim(),
                    expected: 2,
                }),
            None => Ok(Array2::zeros((self.bottleneck.nrows(), self.params.vocab_size))),
        }
    }
}

impl Model for LabelsAutoencoder {
    fn create_variables(&self, rng: &mut StdRng) -> Result<Vec<Variable>> {
        let mut vars = Vec::with_capacity(2 * self.layers.len());

        for layer in &self.layers {
            vars.extend(layer.variables(SCOPE, L2_PENALTY, rng)?);
        }

        Ok(vars)
    }

    fn forward(&mut self, vars: &VariableStore, input: &ModelInput<'_>) -> Result<ModelOutput> {
        let (bottleneck, predictions) = self.run(vars, input.labels)?;

        let mut output = ModelOutput::new(predictions.into_dyn());
        output.bottleneck = Some(bottleneck);
        Ok(output)
    }

    fn backward(&mut self, vars: &VariableStore, grad: &OutputGrad) -> Result<Gradients> {
        let d_pred = self.d_predictions(grad)?;
        self.backprop(vars, d_pred, None)
    }
}

/// A `LabelsAutoencoder` with a KL sparsity penalty on the bottleneck units.
///
/// The batch mean activation of each unit is tracked in a non trainable moving average
/// which is published as an update op.
pub struct SparseLabelsAutoencoder {
    inner: LabelsAutoencoder,
}

impl SparseLabelsAutoencoder {
    pub fn new(params: ModelParams) -> Self {
        Self {
            inner: LabelsAutoencoder::new(params),
        }
    }

    /// The batch mean activation of every bottleneck unit, kept away from 0 and 1.
    fn rho_hat(bottleneck: &Array2<f32>) -> Array1<f32> {
        bottleneck
            .mean_axis(Axis(0))
            .unwrap_or_else(|| Array1::zeros(bottleneck.ncols()))
            .mapv(|r| r.clamp(1e-6, 1. - 1e-6))
    }
}

impl Model for SparseLabelsAutoencoder {
    fn create_variables(&self, rng: &mut StdRng) -> Result<Vec<Variable>> {
        let mut vars = self.inner.create_variables(rng)?;
        let moving_mean = vec![SPARSITY_TARGET; self.inner.params.hidden_size_2];
        vars.push(Variable::new(
            MOVING_MEAN,
            vec![moving_mean.len()],
            moving_mean,
            false,
        )?);

        Ok(vars)
    }

    fn forward(&mut self, vars: &VariableStore, input: &ModelInput<'_>) -> Result<ModelOutput> {
        let (bottleneck, predictions) = self.inner.run(vars, input.labels)?;
        let rho_hat = Self::rho_hat(&bottleneck);

        let rho = SPARSITY_TARGET;
        let kl: f32 = rho_hat
            .iter()
            .map(|&r| rho * (rho / r).ln() + (1. - rho) * ((1. - rho) / (1. - r)).ln())
            .sum();

        let old = vars.get(MOVING_MEAN)?.data();
        let value = old
            .iter()
            .zip(&rho_hat)
            .map(|(m, r)| MOVING_MEAN_DECAY * m + (1. - MOVING_MEAN_DECAY) * r)
            .collect();

        let mut output = ModelOutput::new(predictions.into_dyn());
        output.bottleneck = Some(bottleneck);
        output.loss_sparse = Some(SPARSITY_WEIGHT * kl);
        output.update_ops.push(UpdateOp {
            variable: MOVING_MEAN.to_string(),
            value,
        });

        Ok(output)
    }

    fn backward(&mut self, vars: &VariableStore, grad: &OutputGrad) -> Result<Gradients> {
        let d_pred = self.inner.d_predictions(grad)?;

        let bottleneck = &self.inner.bottleneck;
        let rows = bottleneck.nrows().max(1) as f32;
        let rho = SPARSITY_TARGET;
        let d_rho = Self::rho_hat(bottleneck)
            .mapv(|r| SPARSITY_WEIGHT * (-rho / r + (1. - rho) / (1. - r)) / rows);

        let d_bottleneck = Array2::from_shape_fn(bottleneck.raw_dim(), |(_, j)| d_rho[j]);
        self.inner.backprop(vars, d_pred, Some(d_bottleneck))
    }
}

fn flat(a: Array2<f32>) -> Vec<f32> {
    a.iter().copied().collect()
}

fn flat_1(a: Array1<f32>) -> Vec<f32> {
    a.to_vec()
}
