use machine_learning::{
    arch::{Model, ModelInput, ModelOutput, OutputGrad, loss::LossFn},
    optimization::clip_by_norm,
    schedule::ExponentialDecay,
    variables::{Gradients, VariableStore},
};
use ndarray::{Array2, ArrayD, ArrayView2, ArrayViewD, Ix2, IxDyn};

use crate::{
    Result, TrainErr,
    data::{Batch, InputPipeline},
    session::Session,
};

/// The loss terms of one step.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LossTerms {
    pub label: f32,
    pub sparse: f32,
    /// The model's own regularization plus every registered weight decay.
    pub regularization: f32,
    /// `penalty * regularization + label + sparse`.
    pub total: f32,
    /// Whether the model's update ops were assigned before the label loss was computed.
    pub barrier: bool,
}

/// The values fetched by one training step.
#[derive(Debug, Clone)]
pub struct StepOutput {
    pub global_step: u64,
    pub learning_rate: f32,
    pub loss: LossTerms,
    /// `[examples, classes]`, frame level predictions flattened.
    pub predictions: Array2<f32>,
    /// Aligned with `predictions`.
    pub labels: Array2<f32>,
    /// A zero scalar when the model has no bottleneck.
    pub bottleneck: ArrayD<f32>,
    pub input_raw: ArrayD<f32>,
    pub num_frames: Vec<usize>,
    /// The amount of videos in the batch.
    pub examples: usize,
}

/// One optimization step: forward pass, losses, gradients, clipping and the update.
pub struct TrainOp {
    model: Box<dyn Model>,
    loss_fn: Box<dyn LossFn>,
    schedule: ExponentialDecay,
    regularization_penalty: f32,
    clip_gradient_norm: f32,
}

impl TrainOp {
    /// Creates a new `TrainOp`.
    ///
    /// # Arguments
    /// * `model` - The resolved model.
    /// * `loss_fn` - The configured label loss.
    /// * `schedule` - The learning rate schedule.
    /// * `regularization_penalty` - The weight of the regularization loss.
    /// * `clip_gradient_norm` - The norm every gradient tensor is clipped to, disabled if not positive.
    pub fn new(
        model: Box<dyn Model>,
        loss_fn: Box<dyn LossFn>,
        schedule: ExponentialDecay,
        regularization_penalty: f32,
        clip_gradient_norm: f32,
    ) -> Self {
        Self {
            model,
            loss_fn,
            schedule,
            regularization_penalty,
            clip_gradient_norm,
        }
    }

    pub fn learning_rate(&self, global_step: u64) -> f32 {
        self.schedule.rate(global_step)
    }

    /// Runs one step over the next batch of `input`.
    ///
    /// # Returns
    /// `Ok(None)` once the input is exhausted.
    pub fn run_step(
        &mut self,
        session: &mut dyn Session,
        input: &mut InputPipeline,
    ) -> Result<Option<StepOutput>> {
        match input.next_batch()? {
            Some(batch) => self.step(session, batch).map(Some),
            None => Ok(None),
        }
    }

    /// Runs one step over `batch`.
    pub fn step(&mut self, session: &mut dyn Session, batch: Batch) -> Result<StepOutput> {
        let learning_rate = self.learning_rate(session.global_step());
        session.pull()?;

        let input = ModelInput {
            raw_features: batch.raw_features.view(),
            labels: batch.labels.view(),
            num_frames: &batch.num_frames,
        };

        let output = self.model.forward(session.variables(), &input)?;
        let pred_shape = output.predictions.shape().to_vec();
        let (predictions, labels) = flatten(output.predictions.view(), batch.labels.view())?;

        let class = match &output.predictions_class {
            Some(class) => Some(flatten(class.view(), batch.labels.view())?.0),
            None => None,
        };

        let barrier = !output.update_ops.is_empty();
        if barrier {
            session.assign(&output.update_ops)?;
        }

        let (label, grad) = self.label_loss(&output, &predictions, class.as_ref(), &labels, &pred_shape)?;

        let vars = session.variables();
        let regularization = output.regularization_loss_or_zero() + vars.decay_loss();
        let sparse = output.loss_sparse_or_zero();
        let total = self.regularization_penalty * regularization + label + sparse;

        let grads = self.model.backward(vars, &grad)?;
        let grads = self.with_weight_decay(grads, vars)?;

        let global_step = session.apply(learning_rate, grads)?;

        Ok(StepOutput {
            global_step,
            learning_rate,
            loss: LossTerms {
                label,
                sparse,
                regularization,
                total,
                barrier,
            },
            predictions,
            labels,
            bottleneck: output.bottleneck_or_zero(),
            examples: batch.len(),
            input_raw: batch.raw_features,
            num_frames: batch.num_frames,
        })
    }

    /// Selects the label loss: the model's own, the mixed loss if the model has a class head,
    /// otherwise the configured loss.
    fn label_loss(
        &self,
        output: &ModelOutput,
        predictions: &Array2<f32>,
        class: Option<&Array2<f32>>,
        labels: &Array2<f32>,
        pred_shape: &[usize],
    ) -> Result<(f32, OutputGrad)> {
        let mut grad = OutputGrad {
            predictions: None,
            predictions_class: None,
            regularization_penalty: self.regularization_penalty,
        };

        if let Some(loss) = output.loss {
            return Ok((loss, grad));
        }

        let (p, y) = (predictions.view(), labels.view());
        let loss = match class {
            Some(class) => {
                let class_shape = output
                    .predictions_class
                    .as_ref()
                    .map(|c| c.shape().to_vec())
                    .unwrap_or_default();

                let (d_pred, d_class) = self.loss_fn.loss_mix_prime(p, class.view(), y);
                grad.predictions = Some(unflatten(d_pred, pred_shape)?);
                grad.predictions_class = Some(unflatten(d_class, &class_shape)?);
                self.loss_fn.loss_mix(p, class.view(), y)
            }
            None => {
                grad.predictions = Some(unflatten(self.loss_fn.loss_prime(p, y), pred_shape)?);
                self.loss_fn.loss(p, y)
            }
        };

        Ok((loss, grad))
    }

    /// Adds the weight decay gradients, aligns them with the trainable variables and clips
    /// each tensor.
    fn with_weight_decay(&self, mut grads: Gradients, vars: &VariableStore) -> Result<Vec<Vec<f32>>> {
        for var in vars.trainable().filter(|v| v.weight_decay() != 0.) {
            let scale = self.regularization_penalty * var.weight_decay();
            let decay: Vec<f32> = var.data().iter().map(|w| scale * w).collect();
            grads.accumulate(var.name(), &decay);
        }

        let mut aligned = grads.into_aligned(vars)?;
        for grad in aligned.iter_mut() {
            clip_by_norm(grad, self.clip_gradient_norm);
        }

        Ok(aligned)
    }
}

/// Reshapes rank 3 predictions into `[batch * frames, classes]`, repeating each label row once
/// per frame.
///
/// # Returns
/// The aligned predictions and labels or a contract error if the predictions aren't of rank
/// 2 or 3 or don't match the labels.
fn flatten(predictions: ArrayViewD<f32>, labels: ArrayView2<f32>) -> Result<(Array2<f32>, Array2<f32>)> {
    let shape = predictions.shape();
    let (rows, classes) = labels.dim();

    let mismatch = || {
        TrainErr::Contract(format!(
            "predictions of shape {shape:?} don't match labels of shape [{rows}, {classes}]"
        ))
    };

    match *shape {
        [b, c] if b == rows && c == classes => {
            let p = predictions
                .into_dimensionality::<Ix2>()
                .map_err(|e| TrainErr::Contract(e.to_string()))?;
            Ok((p.to_owned(), labels.to_owned()))
        }
        [b, frames, c] if b == rows && c == classes => {
            let p = predictions
                .to_shape((b * frames, c))
                .map_err(|e| TrainErr::Contract(e.to_string()))?
                .into_owned();
            let y = Array2::from_shape_fn((b * frames, c), |(i, j)| labels[[i / frames, j]]);
            Ok((p, y))
        }
        [_, _] | [_, _, _] => Err(mismatch()),
        _ => Err(TrainErr::Contract(format!(
            "predictions must be of rank 2 or 3, got shape {shape:?}"
        ))),
    }
}

fn unflatten(grad: Array2<f32>, shape: &[usize]) -> Result<ArrayD<f32>> {
    grad.into_shape_with_order(IxDyn(shape))
        .map_err(|e| TrainErr::Contract(e.to_string()))
}

#[cfg(test)]
mod tests {
    use machine_learning::{
        arch::{ModelParams, UpdateOp, loss::CrossEntropy},
        models::LabelsAutoencoder,
        optimization::{GradientDescent, Optimizer, OptimizerState},
        variables::Variable,
    };
    use ndarray::{Array3, array};
    use rand::{SeedableRng, rngs::StdRng};

    use super::*;
    use crate::session::LocalSession;

    /// Emits `[batch, 2, classes]` predictions of 0.5 and a moving mean update.
    struct FrameModel;

    impl Model for FrameModel {
        fn create_variables(&self, _: &mut StdRng) -> machine_learning::Result<Vec<Variable>> {
            Ok(vec![
                Variable::zeros("model/w", vec![1], true),
                Variable::zeros("model/moving_mean", vec![1], false),
            ])
        }

        fn forward(
            &mut self,
            _: &VariableStore,
            input: &ModelInput<'_>,
        ) -> machine_learning::Result<ModelOutput> {
            let (b, c) = input.labels.dim();
            let mut output = ModelOutput::new(Array3::from_elem((b, 2, c), 0.5).into_dyn());
            output.update_ops.push(UpdateOp {
                variable: "model/moving_mean".into(),
                value: vec![0.75],
            });
            Ok(output)
        }

        fn backward(&mut self, _: &VariableStore, grad: &OutputGrad) -> machine_learning::Result<Gradients> {
            assert_eq!(grad.predictions().unwrap().ndim(), 3);
            let mut grads = Gradients::new();
            grads.accumulate("model/w", &[1.]);
            Ok(grads)
        }
    }

    /// Emits rank 1 predictions.
    struct FlatModel;

    impl Model for FlatModel {
        fn create_variables(&self, _: &mut StdRng) -> machine_learning::Result<Vec<Variable>> {
            Ok(vec![Variable::zeros("model/w", vec![1], true)])
        }

        fn forward(&mut self, _: &VariableStore, input: &ModelInput<'_>) -> machine_learning::Result<ModelOutput> {
            Ok(ModelOutput::new(ArrayD::zeros(vec![input.labels.nrows()])))
        }

        fn backward(&mut self, _: &VariableStore, _: &OutputGrad) -> machine_learning::Result<Gradients> {
            Ok(Gradients::new())
        }
    }

    /// Emits constant `[batch, classes]` predictions, optionally with its own loss, a class
    /// head or a moving mean update.
    #[derive(Default)]
    struct ScriptedModel {
        loss: Option<f32>,
        class_head: bool,
        update_ops: bool,
    }

    const PRED: f32 = 0.25;
    const CLASS: f32 = 0.75;

    impl Model for ScriptedModel {
        fn create_variables(&self, _: &mut StdRng) -> machine_learning::Result<Vec<Variable>> {
            Ok(vec![
                Variable::zeros("model/w", vec![1], true),
                Variable::zeros("model/moving_mean", vec![1], false),
            ])
        }

        fn forward(&mut self, _: &VariableStore, input: &ModelInput<'_>) -> machine_learning::Result<ModelOutput> {
            let dim = input.labels.dim();
            let mut output = ModelOutput::new(Array2::from_elem(dim, PRED).into_dyn());
            output.loss = self.loss;

            if self.class_head {
                output.predictions_class = Some(Array2::from_elem(dim, CLASS).into_dyn());
            }

            if self.update_ops {
                output.update_ops.push(UpdateOp {
                    variable: "model/moving_mean".into(),
                    value: vec![1.],
                });
            }

            Ok(output)
        }

        fn backward(&mut self, _: &VariableStore, _: &OutputGrad) -> machine_learning::Result<Gradients> {
            let mut grads = Gradients::new();
            grads.accumulate("model/w", &[1.]);
            Ok(grads)
        }
    }

    /// A local session counting the assignments it receives.
    struct CountingSession {
        inner: LocalSession,
        assigns: usize,
    }

    impl Session for CountingSession {
        fn is_chief(&self) -> bool {
            true
        }

        fn variables(&self) -> &VariableStore {
            self.inner.variables()
        }

        fn global_step(&self) -> u64 {
            self.inner.global_step()
        }

        fn pull(&mut self) -> Result<()> {
            self.inner.pull()
        }

        fn assign(&mut self, ops: &[UpdateOp]) -> Result<()> {
            self.assigns += 1;
            self.inner.assign(ops)
        }

        fn apply(&mut self, learning_rate: f32, grads: Vec<Vec<f32>>) -> Result<u64> {
            self.inner.apply(learning_rate, grads)
        }

        fn optimizer_state(&self) -> Option<Vec<OptimizerState>> {
            self.inner.optimizer_state()
        }

        fn close(&mut self) -> Result<()> {
            self.inner.close()
        }
    }

    fn label_loss_of(model: ScriptedModel) -> f32 {
        let mut session = session_for(&model);
        let mut op = train_op(Box::new(model), 1.);
        op.step(&mut session, batch(array![[1., 0.]])).unwrap().loss.label
    }

    fn session_for(model: &dyn Model) -> LocalSession {
        let vars = model.create_variables(&mut StdRng::seed_from_u64(0)).unwrap();
        let store = VariableStore::new(vars).unwrap();
        let optimizers: Vec<Box<dyn Optimizer>> = store
            .trainable()
            .map(|_| Box::new(GradientDescent::new()) as Box<dyn Optimizer>)
            .collect();
        LocalSession::new(store, optimizers, 0).unwrap()
    }

    fn train_op(model: Box<dyn Model>, penalty: f32) -> TrainOp {
        let schedule = ExponentialDecay::new(0.1, 0.5, 4, 2).unwrap();
        TrainOp::new(model, Box::new(CrossEntropy::new()), schedule, penalty, 0.)
    }

    fn batch(labels: Array2<f32>) -> Batch {
        let n = labels.nrows();
        Batch {
            ids: (0..n).map(|i| i.to_string()).collect(),
            raw_features: ArrayD::zeros(vec![n, 3]),
            labels,
            num_frames: vec![1; n],
        }
    }

    #[test]
    fn frame_predictions_are_flattened_with_repeated_labels() {
        let mut session = session_for(&FrameModel);
        let mut op = train_op(Box::new(FrameModel), 1.);

        let out = op.step(&mut session, batch(array![[1., 0.], [0., 1.]])).unwrap();

        assert_eq!(out.predictions.dim(), (4, 2));
        assert_eq!(out.labels.row(1).to_vec(), vec![1., 0.]);
        assert_eq!(out.labels.row(2).to_vec(), vec![0., 1.]);
        assert_eq!(out.global_step, 1);
        assert_eq!(out.examples, 2);
    }

    #[test]
    fn update_ops_run_as_a_barrier_before_the_update() {
        let mut session = session_for(&FrameModel);
        let mut op = train_op(Box::new(FrameModel), 1.);

        let out = op.step(&mut session, batch(array![[1., 0.]])).unwrap();

        assert!(out.loss.barrier);
        assert_eq!(session.variables().get("model/moving_mean").unwrap().data(), &[0.75]);
        assert!((session.variables().get("model/w").unwrap().data()[0] + 0.1).abs() < 1e-6);
    }

    #[test]
    fn absent_optional_outputs_default_to_zero() {
        let mut session = session_for(&FrameModel);
        let mut op = train_op(Box::new(FrameModel), 0.);

        let out = op.step(&mut session, batch(array![[1., 0.]])).unwrap();

        assert_eq!(out.bottleneck.ndim(), 0);
        assert_eq!(out.bottleneck.sum(), 0.);
        assert_eq!(out.loss.sparse, 0.);
        assert_eq!(out.loss.total, out.loss.label);
    }

    #[test]
    fn no_update_ops_means_no_barrier() {
        let model = ScriptedModel::default();
        let mut session = CountingSession {
            inner: session_for(&model),
            assigns: 0,
        };
        let mut op = train_op(Box::new(model), 1.);

        let out = op.step(&mut session, batch(array![[1., 0.]])).unwrap();

        assert!(!out.loss.barrier);
        assert_eq!(session.assigns, 0);
        assert_eq!(session.variables().get("model/moving_mean").unwrap().data(), &[0.]);
    }

    #[test]
    fn update_ops_are_assigned_once_per_step() {
        let model = ScriptedModel {
            update_ops: true,
            ..Default::default()
        };
        let mut session = CountingSession {
            inner: session_for(&model),
            assigns: 0,
        };
        let mut op = train_op(Box::new(model), 1.);

        let out = op.step(&mut session, batch(array![[1., 0.]])).unwrap();

        assert!(out.loss.barrier);
        assert_eq!(session.assigns, 1);
        assert_eq!(session.variables().get("model/moving_mean").unwrap().data(), &[1.]);
    }

    #[test]
    fn the_model_loss_takes_precedence() {
        let label = label_loss_of(ScriptedModel {
            loss: Some(2.5),
            class_head: true,
            ..Default::default()
        });

        assert_eq!(label, 2.5);
    }

    #[test]
    fn a_class_head_selects_the_mixed_loss() {
        let label = label_loss_of(ScriptedModel {
            class_head: true,
            ..Default::default()
        });

        let y = array![[1., 0.]];
        let p = Array2::from_elem((1, 2), PRED);
        let c = Array2::from_elem((1, 2), CLASS);
        let expected = CrossEntropy::new().loss_mix(p.view(), c.view(), y.view());

        assert!((label - expected).abs() < 1e-6);
        assert!((label - CrossEntropy::new().loss(p.view(), y.view())).abs() > 1e-3);
    }

    #[test]
    fn otherwise_the_configured_loss_scores_the_predictions() {
        let label = label_loss_of(ScriptedModel::default());

        let y = array![[1., 0.]];
        let p = Array2::from_elem((1, 2), PRED);
        let expected = CrossEntropy::new().loss(p.view(), y.view());

        assert!((label - expected).abs() < 1e-6);
    }

    #[test]
    fn predictions_of_another_rank_violate_the_contract() {
        let mut session = session_for(&FlatModel);
        let mut op = train_op(Box::new(FlatModel), 1.);

        let err = op.step(&mut session, batch(array![[1., 0.]])).unwrap_err();
        assert!(matches!(err, TrainErr::Contract(_)));
    }

    #[test]
    fn the_autoencoder_lowers_its_loss() {
        let params = ModelParams {
            vocab_size: 6,
            hidden_size_1: 8,
            hidden_size_2: 3,
        };
        let model = LabelsAutoencoder::new(params);
        let mut session = session_for(&model);
        let schedule = ExponentialDecay::new(0.5, 1., 1000, 2).unwrap();
        let mut op = TrainOp::new(Box::new(model), Box::new(CrossEntropy::new()), schedule, 1., 0.);

        let labels = array![[1., 0., 0., 1., 0., 0.], [0., 1., 0., 0., 0., 1.]];
        let first = op.step(&mut session, batch(labels.clone())).unwrap();
        let mut last = first.clone();
        for _ in 0..50 {
            last = op.step(&mut session, batch(labels.clone())).unwrap();
        }

        assert!(last.loss.label < first.loss.label);
        assert_eq!(last.global_step, 51);
        assert!(first.loss.regularization > 0.);
        assert_eq!(first.bottleneck.shape(), &[2, 3]);
    }
}
