use std::{fs, path::Path};

use comms::specs::server::OptimizerSpec;
use machine_learning::arch::ModelParams;
use serde::{Deserialize, Serialize};

use crate::{Result, TrainErr};

/// The flags of a training run.
///
/// Every field has a default so a config file only needs to list what it overrides.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TrainingConfig {
    pub train_dir: String,
    pub train_data_pattern: String,
    /// Comma separated, paired one to one with `feature_sizes`.
    pub feature_names: String,
    pub feature_sizes: String,
    pub frame_features: bool,
    /// Frame level input whose records may come without labels.
    pub frame_only: bool,
    pub model: String,
    pub start_new_model: bool,
    pub batch_size: usize,
    pub label_loss: String,
    pub regularization_penalty: f32,
    pub base_learning_rate: f32,
    pub learning_rate_decay: f32,
    pub learning_rate_decay_examples: u64,
    /// `None` reads the input forever.
    pub num_epochs: Option<usize>,
    pub num_readers: usize,
    pub optimizer: String,
    pub clip_gradient_norm: f32,
    pub log_device_placement: bool,
    pub vocab_size: usize,
    pub hidden_size_1: usize,
    pub hidden_size_2: usize,
    pub seed: Option<u64>,
    pub save_model_secs: u64,
    pub save_summaries_secs: u64,
    pub max_to_keep: usize,
}

impl Default for TrainingConfig {
    fn default() -> Self {
        Self {
            train_dir: "/tmp/yt8m_model/".into(),
            train_data_pattern: String::new(),
            feature_names: "mean_rgb".into(),
            feature_sizes: "1024".into(),
            frame_features: false,
            frame_only: false,
            model: "LabelsAutoencoder".into(),
            start_new_model: false,
            batch_size: 1024,
            label_loss: "CrossEntropyLoss".into(),
            regularization_penalty: 1.,
            base_learning_rate: 0.001,
            learning_rate_decay: 0.95,
            learning_rate_decay_examples: 4_000_000,
            num_epochs: Some(5),
            num_readers: 8,
            optimizer: "AdamOptimizer".into(),
            clip_gradient_norm: 0.1,
            log_device_placement: false,
            vocab_size: 4716,
            hidden_size_1: 1024,
            hidden_size_2: 128,
            seed: None,
            save_model_secs: 900,
            save_summaries_secs: 120,
            max_to_keep: 2,
        }
    }
}

impl TrainingConfig {
    /// Parses a configuration from a json document.
    pub fn from_json(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Reads and parses the json configuration file at `path`.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let json = fs::read_to_string(path)?;
        Self::from_json(&json)
    }

    /// Checks the flags that would otherwise fail in the middle of the run.
    pub fn validate(&self) -> Result<()> {
        if self.batch_size == 0 {
            return Err(TrainErr::Config("batch_size must be positive".into()));
        }

        if self.num_readers == 0 {
            return Err(TrainErr::Config("num_readers must be positive".into()));
        }

        if self.num_epochs == Some(0) {
            return Err(TrainErr::Config("num_epochs must be positive or null".into()));
        }

        self.features().map(|_| ())
    }

    /// Pairs the comma separated feature names with their sizes.
    ///
    /// # Returns
    /// The `(name, size)` pairs or a configuration error if the lists have different lengths
    /// or a size isn't a number.
    pub fn features(&self) -> Result<Vec<(String, usize)>> {
        let names: Vec<&str> = split_list(&self.feature_names);
        let sizes: Vec<&str> = split_list(&self.feature_sizes);

        if names.len() != sizes.len() {
            return Err(TrainErr::Config(format!(
                "length of the feature names (={}) != length of feature sizes (={})",
                names.len(),
                sizes.len()
            )));
        }

        names
            .into_iter()
            .zip(sizes)
            .map(|(name, size)| {
                let size = size.parse().map_err(|_| {
                    TrainErr::Config(format!("feature size {size:?} of {name} is not a number"))
                })?;

                Ok((name.to_string(), size))
            })
            .collect()
    }

    pub fn model_params(&self) -> ModelParams {
        ModelParams {
            vocab_size: self.vocab_size,
            hidden_size_1: self.hidden_size_1,
            hidden_size_2: self.hidden_size_2,
        }
    }

    pub fn optimizer_spec(&self) -> OptimizerSpec {
        OptimizerSpec::new(self.optimizer.clone())
    }
}

fn split_list(list: &str) -> Vec<&str> {
    list.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_fields_take_the_defaults() {
        let config = TrainingConfig::from_json(r#"{ "batch_size": 16 }"#).unwrap();

        assert_eq!(config.batch_size, 16);
        assert_eq!(config.optimizer, "AdamOptimizer");
        assert_eq!(config.num_epochs, Some(5));
        assert_eq!(config.max_to_keep, 2);
    }

    #[test]
    fn null_epochs_means_unbounded() {
        let config = TrainingConfig::from_json(r#"{ "num_epochs": null }"#).unwrap();
        assert_eq!(config.num_epochs, None);
    }

    #[test]
    fn features_are_paired_by_position() {
        let config = TrainingConfig {
            feature_names: "rgb, audio".into(),
            feature_sizes: "1024,128".into(),
            ..Default::default()
        };

        let features = config.features().unwrap();
        assert_eq!(features, vec![("rgb".into(), 1024), ("audio".into(), 128)]);
    }

    #[test]
    fn feature_lists_of_different_length_are_rejected() {
        let json = r#"{ "feature_names": "rgb,audio", "feature_sizes": "1024" }"#;
        let err = TrainingConfig::from_json(json).unwrap_err();
        assert!(matches!(err, TrainErr::Config(_)));
    }
}
