pub mod cluster;
pub mod error;
pub mod server;

pub use error::{Result, SpecErr};
