//! The monitoring stream: one json event per line in `<train_dir>/events.jsonl`.

use std::{
    fs::{self, File, OpenOptions},
    io::{BufRead, BufReader, BufWriter, Write},
    path::{Path, PathBuf},
    time::{Duration, SystemTime, UNIX_EPOCH},
};

use machine_learning::metrics;
use ndarray::ArrayView2;
use serde::{Deserialize, Serialize};

use crate::Result;

pub const EVENTS_FILE: &str = "events.jsonl";
const HISTOGRAM_BUCKETS: usize = 30;

/// The distribution of the values of a tensor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Histogram {
    pub min: f32,
    pub max: f32,
    pub num: usize,
    pub sum: f64,
    pub sum_squares: f64,
    /// The upper limit of each bucket.
    pub bucket_limits: Vec<f32>,
    pub buckets: Vec<usize>,
}

impl Histogram {
    /// Buckets `values` uniformly between their minimum and maximum.
    pub fn new(values: &[f32]) -> Self {
        let (min, max) = values
            .iter()
            .fold((f32::INFINITY, f32::NEG_INFINITY), |(lo, hi), &v| {
                (lo.min(v), hi.max(v))
            });

        if values.is_empty() {
            return Self {
                min: 0.,
                max: 0.,
                num: 0,
                sum: 0.,
                sum_squares: 0.,
                bucket_limits: Vec::new(),
                buckets: Vec::new(),
            };
        }

        let n = if max > min { HISTOGRAM_BUCKETS } else { 1 };
        let width = (max - min) / n as f32;
        let bucket_limits = (1..=n).map(|i| min + width * i as f32).collect();
        let mut buckets = vec![0; n];

        for &v in values {
            let i = if width > 0. {
                (((v - min) / width) as usize).min(n - 1)
            } else {
                0
            };
            buckets[i] += 1;
        }

        Self {
            min,
            max,
            num: values.len(),
            sum: values.iter().map(|&v| v as f64).sum(),
            sum_squares: values.iter().map(|&v| (v as f64).powi(2)).sum(),
            bucket_limits,
            buckets,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SummaryValue {
    Scalar(f32),
    Histogram(Histogram),
}

impl SummaryValue {
    pub fn as_scalar(&self) -> Option<f32> {
        match self {
            SummaryValue::Scalar(v) => Some(*v),
            SummaryValue::Histogram(_) => None,
        }
    }
}

/// A single monitoring event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    pub step: u64,
    pub wall_time: f64,
    pub tag: String,
    pub value: SummaryValue,
}

/// The batch quality of one step, reported by the master.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TrainingMetrics {
    pub hit_at_one: f32,
    pub perr: f32,
    pub gap: f32,
    pub examples_per_second: f32,
}

impl TrainingMetrics {
    /// Evaluates the predictions of a step.
    ///
    /// # Arguments
    /// * `predictions` - The flattened predictions of the step.
    /// * `labels` - The labels aligned with them.
    /// * `examples` - The amount of videos in the batch.
    /// * `elapsed` - How long the step took.
    pub fn new(
        predictions: ArrayView2<f32>,
        labels: ArrayView2<f32>,
        examples: usize,
        elapsed: Duration,
    ) -> Self {
        let secs = elapsed.as_secs_f32();
        let examples_per_second = if secs > 0. { examples as f32 / secs } else { 0. };

        Self {
            hit_at_one: metrics::hit_at_one(predictions, labels),
            perr: metrics::precision_at_equal_recall(predictions, labels),
            gap: metrics::global_average_precision(predictions, labels),
            examples_per_second,
        }
    }

    /// The `(tag, value)` pairs written to the monitoring stream.
    pub fn events(&self) -> [(&'static str, f32); 4] {
        [
            ("model/Training_Hit@1", self.hit_at_one),
            ("model/Training_Perr", self.perr),
            ("model/Training_GAP", self.gap),
            ("global_step/Examples/Second", self.examples_per_second),
        ]
    }
}

/// Appends events to the monitoring stream of a training directory.
pub struct SummaryWriter {
    path: PathBuf,
    writer: BufWriter<File>,
}

impl SummaryWriter {
    /// Opens the stream of `train_dir` in append mode, creating the directory if needed.
    pub fn create(train_dir: &Path) -> Result<Self> {
        fs::create_dir_all(train_dir)?;
        let path = train_dir.join(EVENTS_FILE);
        let file = OpenOptions::new().create(true).append(true).open(&path)?;

        Ok(Self {
            path,
            writer: BufWriter::new(file),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn scalar(&mut self, tag: &str, value: f32, step: u64) -> Result<()> {
        self.write(tag, SummaryValue::Scalar(value), step)
    }

    pub fn histogram(&mut self, tag: &str, values: &[f32], step: u64) -> Result<()> {
        self.write(tag, SummaryValue::Histogram(Histogram::new(values)), step)
    }

    fn write(&mut self, tag: &str, value: SummaryValue, step: u64) -> Result<()> {
        let wall_time = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs_f64())
            .unwrap_or_default();

        let event = Event {
            step,
            wall_time,
            tag: tag.to_string(),
            value,
        };

        serde_json::to_writer(&mut self.writer, &event)?;
        self.writer.write_all(b"\n")?;
        Ok(())
    }

    pub fn flush(&mut self) -> Result<()> {
        self.writer.flush()?;
        Ok(())
    }
}

/// Reads every event of the stream at `path`.
pub fn read_events(path: &Path) -> Result<Vec<Event>> {
    let reader = BufReader::new(File::open(path)?);
    let mut events = Vec::new();

    for line in reader.lines() {
        let line = line?;
        if !line.is_empty() {
            events.push(serde_json::from_str(&line)?);
        }
    }

    Ok(events)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn histograms_count_every_value() {
        let h = Histogram::new(&[0., 1., 1., 2., 3.]);

        assert_eq!(h.num, 5);
        assert_eq!(h.buckets.iter().sum::<usize>(), 5);
        assert_eq!(h.buckets.last(), Some(&1));
        assert_eq!(h.sum, 7.);

        let flat = Histogram::new(&[0.5; 4]);
        assert_eq!(flat.buckets, vec![4]);
    }

    #[test]
    fn metrics_of_perfect_predictions() {
        let labels = ndarray::array![[1., 0., 0.], [0., 0., 1.]];
        let predictions = ndarray::array![[0.9, 0.1, 0.2], [0.1, 0.3, 0.8]];

        let m = TrainingMetrics::new(predictions.view(), labels.view(), 2, Duration::from_millis(500));

        assert_eq!(m.hit_at_one, 1.);
        assert_eq!(m.perr, 1.);
        assert_eq!(m.examples_per_second, 4.);
        assert_eq!(m.events()[2].0, "model/Training_GAP");
    }

    #[test]
    fn events_are_appended_as_json_lines() {
        let dir = tempfile::tempdir().unwrap();

        let mut writer = SummaryWriter::create(dir.path()).unwrap();
        writer.scalar("model/Training_GAP", 0.5, 3).unwrap();
        writer.histogram("model/input_raw", &[1., 2.], 3).unwrap();
        writer.flush().unwrap();

        let events = read_events(writer.path()).unwrap();
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].tag, "model/Training_GAP");
        assert_eq!(events[0].value.as_scalar(), Some(0.5));
        assert!(matches!(events[1].value, SummaryValue::Histogram(_)));
    }
}
