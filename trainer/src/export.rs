//! Writes the forward parameter blocks as whitespace separated text matrices.

use std::{
    fs::{self, File},
    io::{BufWriter, Write},
    path::{Path, PathBuf},
};

use log::info;
use machine_learning::variables::VariableStore;
use ndarray::Array2;

use crate::{Result, graph::ForwardParameter};

/// Writes block `i` of `params` to `<train_dir>/autoencoder_layer{i}.model`.
///
/// Every row of a block is one line of values in scientific notation with 18 decimals.
///
/// # Arguments
/// * `train_dir` - The training directory.
/// * `params` - The forward parameter blocks, in order.
/// * `store` - The trained variables.
///
/// # Returns
/// The paths of the written files.
pub fn export_parameters(
    train_dir: &Path,
    params: &[ForwardParameter],
    store: &VariableStore,
) -> Result<Vec<PathBuf>> {
    fs::create_dir_all(train_dir)?;

    params
        .iter()
        .enumerate()
        .map(|(i, param)| {
            let path = train_dir.join(format!("autoencoder_layer{i}.model"));
            write_matrix(&path, &param.matrix(store)?)?;

            info!(block = param.block.as_str(); "exported {}", path.display());
            Ok(path)
        })
        .collect()
}

fn write_matrix(path: &Path, matrix: &Array2<f32>) -> Result<()> {
    let mut out = BufWriter::new(File::create(path)?);

    for row in matrix.rows() {
        let line: Vec<String> = row.iter().map(|&v| format_value(v)).collect();
        writeln!(out, "{}", line.join(" "))?;
    }

    out.flush()?;
    Ok(())
}

/// Formats `v` like `%.18e`: a signed exponent of at least two digits.
fn format_value(v: f32) -> String {
    if v.is_nan() {
        return "nan".into();
    }
    if v.is_infinite() {
        return v.to_string();
    }

    let s = format!("{:.18e}", v as f64);
    match s.split_once('e') {
        Some((mantissa, exp)) => {
            let (sign, digits) = match exp.strip_prefix('-') {
                Some(digits) => ('-', digits),
                None => ('+', exp),
            };
            format!("{mantissa}e{sign}{digits:0>2}")
        }
        None => s,
    }
}
