//! Resolves configuration supplied names into models, losses and optimizers.

use std::{
    collections::HashMap,
    fmt::{self, Display},
};

use comms::specs::server::{OptimizerParams, OptimizerSpec};
use log::debug;

use crate::{
    MlErr, Result,
    arch::{
        Model, ModelParams,
        loss::{CrossEntropy, LossFn, Mse},
    },
    models::{LabelsAutoencoder, SparseLabelsAutoencoder},
    optimization::{Adam, GradientDescent, Momentum, Optimizer},
};

pub type ModelFactory = fn(ModelParams) -> Box<dyn Model>;
pub type LossFactory = fn() -> Box<dyn LossFn>;

/// Builds the optimizer of a single variable of the given length.
pub type OptimizerFactory = fn(&OptimizerParams, usize) -> Box<dyn Optimizer>;

/// The capability families a component may implement.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Family {
    Model,
    Loss,
    Optimizer,
}

impl Display for Family {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Family::Model => "model",
            Family::Loss => "loss",
            Family::Optimizer => "optimizer",
        };

        f.write_str(s)
    }
}

/// A registered implementation, tagged by the capability it provides.
#[derive(Clone, Copy)]
pub enum Component {
    Model(ModelFactory),
    Loss(LossFactory),
    Optimizer(OptimizerFactory),
}

impl Component {
    pub fn family(&self) -> Family {
        match self {
            Component::Model(_) => Family::Model,
            Component::Loss(_) => Family::Loss,
            Component::Optimizer(_) => Family::Optimizer,
        }
    }
}

/// A named group of components.
pub struct Module {
    name: String,
    components: HashMap<String, Component>,
}

impl Module {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            components: HashMap::new(),
        }
    }

    /// Registers `component` under `name`, replacing any previous entry.
    pub fn with(mut self, name: impl Into<String>, component: Component) -> Self {
        self.components.insert(name.into(), component);
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

/// The ordered list of modules searched when resolving a name.
pub struct Catalog {
    modules: Vec<Module>,
}

impl Catalog {
    pub fn new(modules: Vec<Module>) -> Self {
        Self { modules }
    }

    /// Appends `module` to the search path, it has the lowest priority.
    pub fn push(&mut self, module: Module) {
        self.modules.push(module);
    }

    /// Finds the first module that defines `name` and checks its family.
    ///
    /// # Arguments
    /// * `family` - The capability the caller requires.
    /// * `name` - The configured name.
    ///
    /// # Returns
    /// The component, `ComponentNotFound` if no module defines `name` or
    /// `IncompatibleComponent` if the first definition has another family.
    pub fn resolve(&self, family: Family, name: &str) -> Result<Component> {
        let (module, component) = self
            .modules
            .iter()
            .find_map(|m| m.components.get(name).map(|c| (m.name(), c)))
            .ok_or_else(|| MlErr::ComponentNotFound {
                family,
                name: name.to_string(),
            })?;

        debug!(module = module; "resolved {family} {name}");

        if component.family() != family {
            return Err(MlErr::IncompatibleComponent {
                family,
                name: name.to_string(),
                found: component.family(),
            });
        }

        Ok(*component)
    }

    pub fn model(&self, name: &str) -> Result<ModelFactory> {
        match self.resolve(Family::Model, name)? {
            Component::Model(factory) => Ok(factory),
            other => Err(self.mismatch(Family::Model, name, other)),
        }
    }

    pub fn loss(&self, name: &str) -> Result<LossFactory> {
        match self.resolve(Family::Loss, name)? {
            Component::Loss(factory) => Ok(factory),
            other => Err(self.mismatch(Family::Loss, name, other)),
        }
    }

    pub fn optimizer(&self, name: &str) -> Result<OptimizerFactory> {
        match self.resolve(Family::Optimizer, name)? {
            Component::Optimizer(factory) => Ok(factory),
            other => Err(self.mismatch(Family::Optimizer, name, other)),
        }
    }

    /// Resolves the optimizer of `spec` and builds one instance per variable length.
    pub fn optimizers(&self, spec: &OptimizerSpec, lens: &[usize]) -> Result<Vec<Box<dyn Optimizer>>> {
        let factory = self.optimizer(&spec.name)?;
        Ok(lens.iter().map(|&len| factory(&spec.params, len)).collect())
    }

    fn mismatch(&self, family: Family, name: &str, found: Component) -> MlErr {
        MlErr::IncompatibleComponent {
            family,
            name: name.to_string(),
            found: found.family(),
        }
    }
}

impl Default for Catalog {
    /// The built in models, losses and optimizers, in that search order.
    fn default() -> Self {
        let models = Module::new("models")
            .with(
                "LabelsAutoencoder",
                Component::Model(|p| Box::new(LabelsAutoencoder::new(p))),
            )
            .with(
                "SparseLabelsAutoencoder",
                Component::Model(|p| Box::new(SparseLabelsAutoencoder::new(p))),
            );

        let losses = Module::new("losses")
            .with("CrossEntropyLoss", Component::Loss(|| Box::new(CrossEntropy)))
            .with("MeanSquaredErrorLoss", Component::Loss(|| Box::new(Mse)));

        let optimizers = Module::new("optimizers")
            .with(
                "GradientDescentOptimizer",
                Component::Optimizer(|_, _| Box::new(GradientDescent)),
            )
            .with(
                "MomentumOptimizer",
                Component::Optimizer(|p, len| Box::new(Momentum::new(len, p.momentum))),
            )
            .with(
                "AdamOptimizer",
                Component::Optimizer(|p, len| {
                    Box::new(Adam::new(len, p.beta1, p.beta2, p.epsilon))
                }),
            );

        Self::new(vec![models, losses, optimizers])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_names_resolve() {
        let catalog = Catalog::default();

        assert!(catalog.model("LabelsAutoencoder").is_ok());
        assert!(catalog.loss("CrossEntropyLoss").is_ok());
        assert!(catalog.optimizer("AdamOptimizer").is_ok());
    }

    #[test]
    fn unknown_names_are_not_found() {
        let err = Catalog::default().model("LogisticModel").err();
        assert_eq!(
            err,
            Some(MlErr::ComponentNotFound {
                family: Family::Model,
                name: "LogisticModel".into()
            })
        );
    }

    #[test]
    fn names_of_another_family_are_incompatible() {
        let err = Catalog::default().optimizer("CrossEntropyLoss").err();
        assert_eq!(
            err,
            Some(MlErr::IncompatibleComponent {
                family: Family::Optimizer,
                name: "CrossEntropyLoss".into(),
                found: Family::Loss,
            })
        );
    }

    #[test]
    fn first_module_defining_a_name_wins() {
        let shadow = Module::new("custom").with("AdamOptimizer", Component::Loss(|| Box::new(Mse)));
        let mut modules = vec![shadow];
        modules.extend(Catalog::default().modules);
        let catalog = Catalog::new(modules);

        assert!(matches!(
            catalog.optimizer("AdamOptimizer"),
            Err(MlErr::IncompatibleComponent { found: Family::Loss, .. })
        ));
    }

    #[test]
    fn optimizers_are_built_per_variable() {
        let spec = OptimizerSpec::new("MomentumOptimizer");
        let optimizers = Catalog::default().optimizers(&spec, &[3, 5]).unwrap();

        assert_eq!(optimizers.len(), 2);
        assert_eq!(optimizers[1].state().slots[0].len(), 5);
    }
}
