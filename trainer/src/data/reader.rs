use std::{
    collections::HashMap,
    fs::File,
    io::{self, BufRead, BufReader},
    path::Path,
};

use serde::Deserialize;
use serde_json::Value;

use crate::Result;

/// Frame level videos are truncated to this amount of frames.
pub const MAX_FRAMES: usize = 300;

/// A single decoded video.
#[derive(Debug, Clone, PartialEq)]
pub struct Example {
    pub id: String,
    /// `frames * feature_dim` values, row major by frame.
    pub features: Vec<f32>,
    pub frames: usize,
    /// Multi-hot over the label vocabulary.
    pub labels: Vec<f32>,
}

/// Decodes the examples of one input file.
pub trait Reader: Send + Sync {
    /// The size of the label vocabulary.
    fn num_classes(&self) -> usize;

    /// The width of one (aggregated or per frame) feature vector.
    fn feature_dim(&self) -> usize;

    /// Whether examples carry a frame axis.
    fn frame_level(&self) -> bool;

    /// Reads every example of the file at `path`.
    ///
    /// # Returns
    /// The examples or an io error naming the offending line.
    fn read_file(&self, path: &Path) -> Result<Vec<Example>>;
}

/// One json line: `{"id": .., "labels": [..], "<feature>": ..}`.
#[derive(Debug, Deserialize)]
struct RawRecord {
    #[serde(default)]
    id: String,
    labels: Option<Vec<usize>>,
    #[serde(flatten)]
    features: HashMap<String, Value>,
}

/// The layout shared by every reader.
#[derive(Debug, Clone)]
struct Layout {
    num_classes: usize,
    features: Vec<(String, usize)>,
}

impl Layout {
    fn feature_dim(&self) -> usize {
        self.features.iter().map(|(_, size)| size).sum()
    }

    fn labels(&self, labels: Option<Vec<usize>>, required: bool) -> io::Result<Vec<f32>> {
        let labels = match labels {
            Some(labels) => labels,
            None if required => return Err(invalid("missing labels")),
            None => Vec::new(),
        };

        let mut dense = vec![0.; self.num_classes];
        for label in labels {
            let slot = dense.get_mut(label).ok_or_else(|| {
                invalid(format!(
                    "label {label} out of range for a vocabulary of {}",
                    self.num_classes
                ))
            })?;

            *slot = 1.;
        }

        Ok(dense)
    }

    fn take_feature<T>(&self, record: &mut RawRecord, name: &str) -> io::Result<T>
    where
        T: for<'de> Deserialize<'de>,
    {
        let value = record
            .features
            .remove(name)
            .ok_or_else(|| invalid(format!("missing feature {name}")))?;

        serde_json::from_value(value).map_err(|e| invalid(format!("feature {name}: {e}")))
    }
}

fn invalid(detail: impl Into<String>) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, detail.into())
}

/// Parses a json lines file line by line, skipping blank lines.
fn read_lines<F>(path: &Path, mut parse: F) -> Result<Vec<Example>>
where
    F: FnMut(RawRecord) -> io::Result<Example>,
{
    let reader = BufReader::new(File::open(path)?);
    let mut examples = Vec::new();

    for (i, line) in reader.lines().enumerate() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }

        let located = |e: io::Error| invalid(format!("{}:{}: {e}", path.display(), i + 1));
        let record: RawRecord =
            serde_json::from_str(&line).map_err(|e| located(invalid(e.to_string())))?;

        examples.push(parse(record).map_err(located)?);
    }

    Ok(examples)
}

/// Reads video level features, one vector per feature name.
#[derive(Debug, Clone)]
pub struct AggregatedFeatureReader {
    layout: Layout,
}

impl AggregatedFeatureReader {
    /// Creates a new `AggregatedFeatureReader`.
    ///
    /// # Arguments
    /// * `num_classes` - The size of the label vocabulary.
    /// * `features` - The `(name, size)` pairs concatenated into the feature vector.
    pub fn new(num_classes: usize, features: Vec<(String, usize)>) -> Self {
        Self {
            layout: Layout {
                num_classes,
                features,
            },
        }
    }

    fn parse(&self, mut record: RawRecord) -> io::Result<Example> {
        let layout = &self.layout;
        let mut features = Vec::with_capacity(layout.feature_dim());

        for (name, size) in &layout.features {
            let values: Vec<f32> = layout.take_feature(&mut record, name)?;
            if values.len() != *size {
                return Err(invalid(format!(
                    "feature {name} has {} values, expected {size}",
                    values.len()
                )));
            }

            features.extend(values);
        }

        Ok(Example {
            id: record.id,
            features,
            frames: 1,
            labels: layout.labels(record.labels, true)?,
        })
    }
}

impl Reader for AggregatedFeatureReader {
    fn num_classes(&self) -> usize {
        self.layout.num_classes
    }

    fn feature_dim(&self) -> usize {
        self.layout.feature_dim()
    }

    fn frame_level(&self) -> bool {
        false
    }

    fn read_file(&self, path: &Path) -> Result<Vec<Example>> {
        read_lines(path, |record| self.parse(record))
    }
}

/// Reads frame level features, a list of per frame vectors per feature name.
#[derive(Debug, Clone)]
pub struct FrameFeatureReader {
    layout: Layout,
    max_frames: usize,
    labels_required: bool,
}

impl FrameFeatureReader {
    /// Creates a new `FrameFeatureReader`.
    ///
    /// # Arguments
    /// * `num_classes` - The size of the label vocabulary.
    /// * `features` - The `(name, size)` pairs concatenated into each frame.
    pub fn new(num_classes: usize, features: Vec<(String, usize)>) -> Self {
        Self {
            layout: Layout {
                num_classes,
                features,
            },
            max_frames: MAX_FRAMES,
            labels_required: true,
        }
    }

    pub fn with_max_frames(mut self, max_frames: usize) -> Self {
        self.max_frames = max_frames;
        self
    }

    fn parse(&self, mut record: RawRecord) -> io::Result<Example> {
        let layout = &self.layout;
        let mut per_feature = Vec::with_capacity(layout.features.len());

        for (name, size) in &layout.features {
            let mut frames: Vec<Vec<f32>> = layout.take_feature(&mut record, name)?;
            frames.truncate(self.max_frames);

            if let Some(frame) = frames.iter().find(|f| f.len() != *size) {
                return Err(invalid(format!(
                    "a frame of {name} has {} values, expected {size}",
                    frame.len()
                )));
            }

            per_feature.push(frames);
        }

        let frames = per_feature.iter().map(Vec::len).min().unwrap_or(0);
        if per_feature.iter().any(|f| f.len() != frames) {
            return Err(invalid("features have a different amount of frames"));
        }

        let mut features = Vec::with_capacity(frames * layout.feature_dim());
        for i in 0..frames {
            for feature in &per_feature {
                features.extend_from_slice(&feature[i]);
            }
        }

        Ok(Example {
            id: record.id,
            features,
            frames,
            labels: layout.labels(record.labels, self.labels_required)?,
        })
    }
}

impl Reader for FrameFeatureReader {
    fn num_classes(&self) -> usize {
        self.layout.num_classes
    }

    fn feature_dim(&self) -> usize {
        self.layout.feature_dim()
    }

    fn frame_level(&self) -> bool {
        true
    }

    fn read_file(&self, path: &Path) -> Result<Vec<Example>> {
        read_lines(path, |record| self.parse(record))
    }
}

/// A frame level reader for records that may come without labels, those get an all zero row.
#[derive(Debug, Clone)]
pub struct FrameFeatureOnlyReader {
    inner: FrameFeatureReader,
}

impl FrameFeatureOnlyReader {
    pub fn new(num_classes: usize, features: Vec<(String, usize)>) -> Self {
        let mut inner = FrameFeatureReader::new(num_classes, features);
        inner.labels_required = false;
        Self { inner }
    }
}

impl Reader for FrameFeatureOnlyReader {
    fn num_classes(&self) -> usize {
        self.inner.num_classes()
    }

    fn feature_dim(&self) -> usize {
        self.inner.feature_dim()
    }

    fn frame_level(&self) -> bool {
        true
    }

    fn read_file(&self, path: &Path) -> Result<Vec<Example>> {
        self.inner.read_file(path)
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::*;
    use crate::TrainErr;

    fn file_with(lines: &[&str]) -> tempfile::NamedTempFile {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        for line in lines {
            writeln!(file, "{line}").unwrap();
        }
        file
    }

    #[test]
    fn aggregated_features_are_concatenated_in_order() {
        let file = file_with(&[
            r#"{"id": "a", "labels": [0, 2], "rgb": [1.0, 2.0], "audio": [3.0]}"#,
            "",
            r#"{"id": "b", "labels": [], "rgb": [4.0, 5.0], "audio": [6.0]}"#,
        ]);
        let reader = AggregatedFeatureReader::new(3, vec![("rgb".into(), 2), ("audio".into(), 1)]);

        let examples = reader.read_file(file.path()).unwrap();

        assert_eq!(examples.len(), 2);
        assert_eq!(examples[0].features, vec![1., 2., 3.]);
        assert_eq!(examples[0].labels, vec![1., 0., 1.]);
        assert_eq!(examples[1].labels, vec![0., 0., 0.]);
    }

    #[test]
    fn out_of_vocabulary_labels_are_rejected() {
        let file = file_with(&[r#"{"id": "a", "labels": [7], "rgb": [1.0]}"#]);
        let reader = AggregatedFeatureReader::new(3, vec![("rgb".into(), 1)]);

        let err = reader.read_file(file.path()).unwrap_err();
        assert!(matches!(err, TrainErr::Io(e) if e.kind() == io::ErrorKind::InvalidData));
    }

    #[test]
    fn frames_are_interleaved_and_truncated() {
        let file = file_with(&[
            r#"{"id": "v", "labels": [1], "rgb": [[1.0], [2.0], [3.0]], "audio": [[-1.0], [-2.0], [-3.0]]}"#,
        ]);
        let reader = FrameFeatureReader::new(2, vec![("rgb".into(), 1), ("audio".into(), 1)])
            .with_max_frames(2);

        let examples = reader.read_file(file.path()).unwrap();

        assert_eq!(examples[0].frames, 2);
        assert_eq!(examples[0].features, vec![1., -1., 2., -2.]);
    }

    #[test]
    fn frame_only_reader_accepts_unlabeled_records() {
        let file = file_with(&[r#"{"id": "v", "rgb": [[1.0, 2.0]]}"#]);
        let features = vec![("rgb".to_string(), 2)];

        let only = FrameFeatureOnlyReader::new(4, features.clone());
        let examples = only.read_file(file.path()).unwrap();
        assert_eq!(examples[0].labels, vec![0.; 4]);

        let strict = FrameFeatureReader::new(4, features);
        assert!(strict.read_file(file.path()).is_err());
    }
}
