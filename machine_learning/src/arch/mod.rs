mod activation;
pub mod layers;
pub mod loss;
mod model;
mod output;

pub use activation::Activation;
pub use model::{Model, ModelParams};
pub use output::{ModelInput, ModelOutput, OutputGrad, UpdateOp};
