mod cross_entropy;
mod loss_fn;
mod mse;

pub use cross_entropy::CrossEntropy;
pub use loss_fn::{LossFn, MIX_CLASS_WEIGHT};
pub use mse::Mse;
