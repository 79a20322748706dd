use std::mem;

use comms::specs::server::{ShardInit, ShardStatus, VariableSpec};
use machine_learning::{optimization::Optimizer, registry::Catalog};
use rayon::prelude::*;

use super::{Result, ShardErr};

/// The variables a parameter server holds together with their optimizers.
pub struct ParameterShard {
    variables: Vec<VariableSpec>,
    params: Box<[f32]>,
    optimizers: Vec<Box<dyn Optimizer>>,
    global_step: Option<u64>,
}

impl ParameterShard {
    /// Creates a new `ParameterShard`.
    ///
    /// # Arguments
    /// * `catalog` - The registry used to resolve the optimizer.
    /// * `init` - The layout of the shard.
    /// * `values` - The initial value of every variable, concatenated in layout order.
    ///
    /// # Returns
    /// The shard or an error if the optimizer is unknown or `values` doesn't match the layout.
    pub fn new(catalog: &Catalog, init: ShardInit, values: &[f32]) -> Result<Self> {
        let expected = init.len();
        if values.len() != expected {
            return Err(ShardErr::SizeMismatch {
                got: values.len(),
                expected,
            });
        }

        let lens: Vec<_> = init.variables.iter().map(|v| v.len).collect();
        let optimizers = catalog.optimizers(&init.optimizer, &lens)?;

        Ok(Self {
            variables: init.variables,
            params: values.into(),
            optimizers,
            global_step: init.global_step,
        })
    }

    pub fn len(&self) -> usize {
        self.params.len()
    }

    pub fn status(&self, shard: usize) -> ShardStatus {
        ShardStatus {
            shard,
            initialized: true,
            global_step: self.global_step,
        }
    }

    /// Copies every variable into `out`, concatenated in layout order.
    pub fn pull(&self, out: &mut Vec<f32>) {
        out.clear();
        out.extend_from_slice(&self.params);
    }

    /// Applies `grad` to every variable in parallel and advances the global step if this
    /// shard owns it.
    ///
    /// # Arguments
    /// * `learning_rate` - The learning rate of the step.
    /// * `grad` - The gradient of every variable, concatenated in layout order.
    ///
    /// # Returns
    /// The new global step or an error on a size mismatch.
    pub fn push(&mut self, learning_rate: f32, grad: &[f32]) -> Result<Option<u64>> {
        if grad.len() != self.params.len() {
            return Err(ShardErr::SizeMismatch {
                got: grad.len(),
                expected: self.params.len(),
            });
        }

        let mut params = Vec::with_capacity(self.variables.len());
        let mut grads = Vec::with_capacity(self.variables.len());
        let (mut p_rest, mut g_rest) = (&mut self.params[..], grad);

        for var in &self.variables {
            let (p, p_tail) = mem::take(&mut p_rest).split_at_mut(var.len);
            let (g, g_tail) = g_rest.split_at(var.len);
            params.push(p);
            grads.push(g);
            p_rest = p_tail;
            g_rest = g_tail;
        }

        self.optimizers
            .par_iter_mut()
            .zip(params.into_par_iter())
            .zip(grads.into_par_iter())
            .try_for_each(|((optimizer, p), g)| optimizer.update_params(learning_rate, g, p))?;

        if let Some(step) = self.global_step.as_mut() {
            *step += 1;
        }

        Ok(self.global_step)
    }
}

#[cfg(test)]
mod tests {
    use comms::specs::server::OptimizerSpec;

    use super::*;

    fn init(global_step: Option<u64>) -> ShardInit {
        ShardInit {
            shard: 0,
            variables: vec![
                VariableSpec {
                    name: "model/hidden_1/weights".into(),
                    len: 2,
                },
                VariableSpec {
                    name: "model/hidden_1/biases".into(),
                    len: 1,
                },
            ],
            optimizer: OptimizerSpec::new("GradientDescentOptimizer"),
            global_step,
        }
    }

    #[test]
    fn push_updates_every_variable_and_the_step() {
        let catalog = Catalog::default();
        let mut shard = ParameterShard::new(&catalog, init(Some(7)), &[1., 2., 3.]).unwrap();

        let step = shard.push(0.5, &[2., 2., 2.]).unwrap();
        assert_eq!(step, Some(8));

        let mut out = Vec::new();
        shard.pull(&mut out);
        assert_eq!(out, [0., 1., 2.]);
    }

    #[test]
    fn shards_without_the_step_report_none() {
        let catalog = Catalog::default();
        let mut shard = ParameterShard::new(&catalog, init(None), &[0.; 3]).unwrap();
        assert_eq!(shard.push(0.1, &[0.; 3]).unwrap(), None);
    }

    #[test]
    fn mismatched_values_are_rejected() {
        let catalog = Catalog::default();
        assert!(ParameterShard::new(&catalog, init(None), &[0.; 2]).is_err());

        let mut shard = ParameterShard::new(&catalog, init(None), &[0.; 3]).unwrap();
        assert!(shard.push(0.1, &[0.; 4]).is_err());
    }
}
