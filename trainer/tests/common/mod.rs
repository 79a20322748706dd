#![allow(dead_code)]

use std::{fs, path::Path};

use serde_json::json;
use trainer::TrainingConfig;

pub const VOCAB: usize = 8;
pub const FEATURES: usize = 2;

/// Writes `examples` synthetic videos split over `files` json lines files.
///
/// # Returns
/// The glob matching every written file.
pub fn write_dataset(dir: &Path, examples: usize, files: usize) -> String {
    let data = dir.join("data");
    fs::create_dir_all(&data).unwrap();

    let mut lines = vec![String::new(); files];
    for i in 0..examples {
        let record = json!({
            "id": format!("video{i}"),
            "labels": [i % VOCAB, (i * 3 + 1) % VOCAB],
            "mean_rgb": [i as f32 / examples as f32, 1. - i as f32 / examples as f32],
        });

        lines[i % files].push_str(&record.to_string());
        lines[i % files].push('\n');
    }

    for (k, content) in lines.iter().enumerate() {
        fs::write(data.join(format!("train-{k}.jsonl")), content).unwrap();
    }

    data.join("*.jsonl").to_string_lossy().into_owned()
}

/// A small local configuration training over `pattern` into `train_dir`.
pub fn config(train_dir: &Path, pattern: &str) -> TrainingConfig {
    TrainingConfig {
        train_dir: train_dir.to_string_lossy().into_owned(),
        train_data_pattern: pattern.to_string(),
        feature_names: "mean_rgb".into(),
        feature_sizes: FEATURES.to_string(),
        batch_size: 10,
        num_epochs: Some(1),
        num_readers: 1,
        base_learning_rate: 0.01,
        vocab_size: VOCAB,
        hidden_size_1: 6,
        hidden_size_2: 3,
        seed: Some(7),
        ..Default::default()
    }
}
