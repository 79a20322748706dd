use std::{
    error::Error,
    fmt::{self, Display},
};

use crate::registry::Family;

/// The result type used in the entire machine learning module.
pub type Result<T> = std::result::Result<T, MlErr>;

/// The machine learning module's error type.
#[derive(Debug, Clone, PartialEq)]
pub enum MlErr {
    SizeMismatch {
        a: &'static str,
        b: &'static str,
        got: usize,
        expected: usize,
    },
    ShapeMismatch {
        name: String,
        got: Vec<usize>,
        expected: Vec<usize>,
    },
    RankMismatch {
        name: String,
        got: usize,
        expected: usize,
    },
    DuplicateVariable(String),
    UnknownVariable(String),
    ComponentNotFound {
        family: Family,
        name: String,
    },
    IncompatibleComponent {
        family: Family,
        name: String,
        found: Family,
    },
    ForwardParameter {
        layer: &'static str,
        kind: &'static str,
        matches: usize,
    },
    InvalidHyperParameter {
        name: &'static str,
        reason: String,
    },
    InvalidOptimizerState {
        optimizer: &'static str,
        reason: String,
    },
}

impl Display for MlErr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MlErr::SizeMismatch {
                a,
                b,
                got,
                expected,
            } => write!(
                f,
                "There's a size mismatch between {a} and {b}, got {got} and expected {expected}"
            ),
            MlErr::ShapeMismatch {
                name,
                got,
                expected,
            } => write!(
                f,
                "The tensor {name} has shape {got:?} but {expected:?} was expected"
            ),
            MlErr::RankMismatch {
                name,
                got,
                expected,
            } => write!(f, "The tensor {name} has rank {got} but rank {expected} was expected"),
            MlErr::DuplicateVariable(name) => {
                write!(f, "The variable {name} was declared more than once")
            }
            MlErr::UnknownVariable(name) => write!(f, "There's no variable named {name}"),
            MlErr::ComponentNotFound { family, name } => {
                write!(f, "Unable to find {family} {name} in any of the registered modules")
            }
            MlErr::IncompatibleComponent {
                family,
                name,
                found,
            } => write!(
                f,
                "{name} is registered as a {found}, it doesn't implement the {family} capability"
            ),
            MlErr::ForwardParameter {
                layer,
                kind,
                matches,
            } => write!(
                f,
                "Expected exactly one trainable {kind} tensor for {layer}, found {matches}"
            ),
            MlErr::InvalidHyperParameter { name, reason } => {
                write!(f, "Invalid value for {name}: {reason}")
            }
            MlErr::InvalidOptimizerState { optimizer, reason } => {
                write!(f, "Can't restore the {optimizer} state: {reason}")
            }
        }
    }
}

impl Error for MlErr {}
