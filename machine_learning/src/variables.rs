use std::collections::HashMap;

use ndarray::{ArrayView1, ArrayView2, ArrayViewD, IxDyn};
use serde::{Deserialize, Serialize};

use crate::{MlErr, Result};

/// A named, shaped tensor owned by the model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Variable {
    name: String,
    shape: Vec<usize>,
    data: Vec<f32>,
    trainable: bool,
    #[serde(default)]
    weight_decay: f32,
}

impl Variable {
    /// Creates a new `Variable`.
    ///
    /// # Arguments
    /// * `name` - The fully qualified name, e.g. `model/hidden_1/weights`.
    /// * `shape` - The dimensions of the tensor.
    /// * `data` - The row major values.
    /// * `trainable` - Whether the optimizer updates this variable.
    ///
    /// # Returns
    /// The variable or a size mismatch if `data` doesn't fill `shape`.
    pub fn new(
        name: impl Into<String>,
        shape: Vec<usize>,
        data: Vec<f32>,
        trainable: bool,
    ) -> Result<Self> {
        let var = Self {
            name: name.into(),
            shape,
            data,
            trainable,
            weight_decay: 0.,
        };

        var.check()?;
        Ok(var)
    }

    /// Creates a new zero filled `Variable`.
    pub fn zeros(name: impl Into<String>, shape: Vec<usize>, trainable: bool) -> Self {
        let len = shape.iter().product();

        Self {
            name: name.into(),
            shape,
            data: vec![0.; len],
            trainable,
            weight_decay: 0.,
        }
    }

    /// Registers an L2 weight decay term of `scale * sum(w^2) / 2` for this variable.
    pub fn with_weight_decay(mut self, scale: f32) -> Self {
        self.weight_decay = scale;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn shape(&self) -> &[usize] {
        &self.shape
    }

    pub fn trainable(&self) -> bool {
        self.trainable
    }

    pub fn weight_decay(&self) -> f32 {
        self.weight_decay
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn data(&self) -> &[f32] {
        &self.data
    }

    pub fn data_mut(&mut self) -> &mut [f32] {
        &mut self.data
    }

    /// Returns the weight decay loss of this variable, zero if it has none.
    pub fn decay_loss(&self) -> f32 {
        if self.weight_decay == 0. {
            return 0.;
        }

        self.weight_decay * self.data.iter().map(|w| w * w).sum::<f32>() / 2.
    }

    pub fn view(&self) -> Result<ArrayViewD<'_, f32>> {
        ArrayViewD::from_shape(IxDyn(&self.shape), &self.data).map_err(|_| MlErr::ShapeMismatch {
            name: self.name.clone(),
            got: vec![self.data.len()],
            expected: self.shape.clone(),
        })
    }

    /// Views the variable as a matrix.
    ///
    /// # Returns
    /// The view or a shape mismatch if the variable is not of rank 2.
    pub fn view2(&self) -> Result<ArrayView2<'_, f32>> {
        let &[rows, cols] = self.shape.as_slice() else {
            return Err(self.rank_err(2));
        };

        ArrayView2::from_shape((rows, cols), &self.data).map_err(|_| self.rank_err(2))
    }

    /// Views the variable as a vector.
    ///
    /// # Returns
    /// The view or a shape mismatch if the variable is not of rank 1.
    pub fn view1(&self) -> Result<ArrayView1<'_, f32>> {
        let &[len] = self.shape.as_slice() else {
            return Err(self.rank_err(1));
        };

        ArrayView1::from_shape(len, &self.data).map_err(|_| self.rank_err(1))
    }

    /// Overwrites the values of this variable.
    ///
    /// # Returns
    /// A size mismatch if `values` isn't as long as the variable.
    pub fn assign(&mut self, values: &[f32]) -> Result<()> {
        if values.len() != self.data.len() {
            return Err(MlErr::SizeMismatch {
                a: "assigned values",
                b: "variable",
                got: values.len(),
                expected: self.data.len(),
            });
        }

        self.data.copy_from_slice(values);
        Ok(())
    }

    fn check(&self) -> Result<()> {
        let expected = self.shape.iter().product();
        if self.data.len() != expected {
            return Err(MlErr::SizeMismatch {
                a: "variable data",
                b: "variable shape",
                got: self.data.len(),
                expected,
            });
        }

        Ok(())
    }

    fn rank_err(&self, rank: usize) -> MlErr {
        MlErr::RankMismatch {
            name: self.name.clone(),
            got: self.shape.len(),
            expected: rank,
        }
    }
}

/// The ordered set of every variable of a model, trainable ones first in declaration order.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "Vec<Variable>", into = "Vec<Variable>")]
pub struct VariableStore {
    vars: Vec<Variable>,
    #[serde(skip)]
    index: HashMap<String, usize>,
}

impl VariableStore {
    /// Creates a new `VariableStore`.
    ///
    /// # Arguments
    /// * `vars` - The variables, names must be unique.
    ///
    /// # Returns
    /// The store or an error if a name is repeated or a variable is malformed.
    pub fn new(vars: Vec<Variable>) -> Result<Self> {
        let mut index = HashMap::with_capacity(vars.len());

        for (i, var) in vars.iter().enumerate() {
            var.check()?;

            if index.insert(var.name.clone(), i).is_some() {
                return Err(MlErr::DuplicateVariable(var.name.clone()));
            }
        }

        Ok(Self { vars, index })
    }

    pub fn get(&self, name: &str) -> Result<&Variable> {
        self.index
            .get(name)
            .map(|&i| &self.vars[i])
            .ok_or_else(|| MlErr::UnknownVariable(name.to_string()))
    }

    pub fn get_mut(&mut self, name: &str) -> Result<&mut Variable> {
        match self.index.get(name) {
            Some(&i) => Ok(&mut self.vars[i]),
            None => Err(MlErr::UnknownVariable(name.to_string())),
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = &Variable> {
        self.vars.iter()
    }

    pub fn trainable(&self) -> impl Iterator<Item = &Variable> {
        self.vars.iter().filter(|v| v.trainable)
    }

    pub fn trainable_mut(&mut self) -> impl Iterator<Item = &mut Variable> {
        self.vars.iter_mut().filter(|v| v.trainable)
    }

    /// Returns the total amount of trainable floats.
    pub fn trainable_len(&self) -> usize {
        self.trainable().map(Variable::len).sum()
    }

    /// Returns the sum of every registered weight decay loss.
    pub fn decay_loss(&self) -> f32 {
        self.trainable().map(Variable::decay_loss).sum()
    }

    /// Finds the trainable variables whose name contains every one of `patterns`.
    pub fn find_trainable(&self, patterns: &[&str]) -> Vec<&Variable> {
        self.trainable()
            .filter(|v| patterns.iter().all(|p| v.name.contains(p)))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.vars.len()
    }

    pub fn is_empty(&self) -> bool {
        self.vars.is_empty()
    }
}

impl TryFrom<Vec<Variable>> for VariableStore {
    type Error = MlErr;

    fn try_from(vars: Vec<Variable>) -> Result<Self> {
        Self::new(vars)
    }
}

impl From<VariableStore> for Vec<Variable> {
    fn from(store: VariableStore) -> Self {
        store.vars
    }
}

/// The gradient of the total loss with respect to each trainable variable, by name.
#[derive(Debug, Default, Clone)]
pub struct Gradients {
    by_name: HashMap<String, Vec<f32>>,
}

impl Gradients {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds `grad` to the gradient of `name`, creating it if needed.
    pub fn accumulate(&mut self, name: &str, grad: &[f32]) {
        match self.by_name.get_mut(name) {
            Some(acc) => acc.iter_mut().zip(grad).for_each(|(a, g)| *a += g),
            None => {
                self.by_name.insert(name.to_string(), grad.to_vec());
            }
        }
    }

    pub fn get(&self, name: &str) -> Option<&[f32]> {
        self.by_name.get(name).map(Vec::as_slice)
    }

    /// Aligns the gradients with the trainable variables of `store`.
    ///
    /// Variables the loss doesn't depend on get a zero gradient.
    ///
    /// # Returns
    /// One buffer per trainable variable or an error on a size mismatch or an unknown name.
    pub fn into_aligned(mut self, store: &VariableStore) -> Result<Vec<Vec<f32>>> {
        let mut aligned = Vec::new();

        for var in store.trainable() {
            let grad = self
                .by_name
                .remove(var.name())
                .unwrap_or_else(|| vec![0.; var.len()]);

            if grad.len() != var.len() {
                return Err(MlErr::SizeMismatch {
                    a: "gradient",
                    b: "variable",
                    got: grad.len(),
                    expected: var.len(),
                });
            }

            aligned.push(grad);
        }

        match self.by_name.into_keys().next() {
            Some(name) => Err(MlErr::UnknownVariable(name)),
            None => Ok(aligned),
        }
    }
}
