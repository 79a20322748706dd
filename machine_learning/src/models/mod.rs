mod autoencoder;

pub use autoencoder::{LabelsAutoencoder, SparseLabelsAutoencoder};
