pub mod arch;
pub mod error;
pub mod metrics;
pub mod models;
pub mod optimization;
pub mod registry;
pub mod schedule;
pub mod variables;

pub use error::{MlErr, Result};
