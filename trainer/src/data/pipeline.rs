use std::{
    io,
    path::PathBuf,
    sync::Arc,
    thread::{self, JoinHandle},
};

use log::{debug, info};
use ndarray::{Array2, Array3, ArrayD};
use parking_lot::Mutex;
use rand::{SeedableRng, rngs::StdRng, seq::SliceRandom};
use serde::{Deserialize, Serialize};

use super::{
    queue::ShuffleQueue,
    reader::{AggregatedFeatureReader, Example, FrameFeatureOnlyReader, FrameFeatureReader, Reader},
};
use crate::{Result, TrainErr};

/// One training batch.
#[derive(Debug, Clone)]
pub struct Batch {
    pub ids: Vec<String>,
    /// `[batch, feature_dim]`, or `[batch, frames, feature_dim]` for frame level input.
    pub raw_features: ArrayD<f32>,
    /// `[batch, num_classes]` multi-hot.
    pub labels: Array2<f32>,
    pub num_frames: Vec<usize>,
}

impl Batch {
    pub fn len(&self) -> usize {
        self.ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }
}

/// Everything needed to rebuild the input pipeline, stored in the meta graph.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InputSettings {
    pub data_pattern: String,
    pub features: Vec<(String, usize)>,
    pub frame_features: bool,
    pub frame_only: bool,
    pub num_classes: usize,
    pub batch_size: usize,
    pub num_readers: usize,
    pub num_epochs: Option<usize>,
    pub seed: Option<u64>,
}

impl InputSettings {
    /// Selects the reader matching the input flags.
    pub fn reader(&self) -> Arc<dyn Reader> {
        let features = self.features.clone();

        match (self.frame_features, self.frame_only) {
            (true, true) => Arc::new(FrameFeatureOnlyReader::new(self.num_classes, features)),
            (true, false) => Arc::new(FrameFeatureReader::new(self.num_classes, features)),
            (false, _) => Arc::new(AggregatedFeatureReader::new(self.num_classes, features)),
        }
    }

    fn rng(&self, stream: u64) -> StdRng {
        match self.seed {
            Some(seed) => StdRng::seed_from_u64(seed.wrapping_add(stream)),
            None => StdRng::from_os_rng(),
        }
    }
}

/// Hands out the input files, shuffled once per epoch.
struct FilenameQueue {
    files: Vec<PathBuf>,
    order: Vec<PathBuf>,
    epochs_started: usize,
    num_epochs: Option<usize>,
    rng: StdRng,
}

impl FilenameQueue {
    fn next(&mut self) -> Option<PathBuf> {
        if self.order.is_empty() {
            if self.num_epochs.is_some_and(|n| self.epochs_started >= n) {
                return None;
            }

            self.epochs_started += 1;
            self.order = self.files.clone();
            self.order.shuffle(&mut self.rng);
            debug!(epoch = self.epochs_started; "starting input epoch");
        }

        self.order.pop()
    }
}

/// Reads examples from the files matching a glob with a pool of reader threads and serves
/// shuffled batches out of them.
pub struct InputPipeline {
    settings: InputSettings,
    reader: Arc<dyn Reader>,
    files: Vec<PathBuf>,
    queue: Arc<ShuffleQueue<Example>>,
    threads: Vec<JoinHandle<()>>,
    started: bool,
}

impl InputPipeline {
    /// Resolves the input files of `settings`.
    ///
    /// No thread is started until the first batch is requested.
    ///
    /// # Arguments
    /// * `settings` - The input flags.
    /// * `reader` - Decodes each input file.
    ///
    /// # Returns
    /// The pipeline or an io error if the pattern is invalid or matches no file.
    pub fn open(settings: InputSettings, reader: Arc<dyn Reader>) -> Result<Self> {
        if settings.batch_size == 0 || settings.num_readers == 0 {
            return Err(TrainErr::Config(
                "batch_size and num_readers must be positive".into(),
            ));
        }

        let files = glob_files(&settings.data_pattern)?;

        info!("Using batch size of {} for training.", settings.batch_size);
        info!("Number of training files: {}.", files.len());

        let capacity = 5 * settings.batch_size;
        let queue = ShuffleQueue::new(
            capacity,
            settings.batch_size,
            settings.num_readers,
            settings.rng(1),
        );

        Ok(Self {
            settings,
            reader,
            files,
            queue: Arc::new(queue),
            threads: Vec::new(),
            started: false,
        })
    }

    pub fn files(&self) -> &[PathBuf] {
        &self.files
    }

    fn start(&mut self) {
        let filenames = Arc::new(Mutex::new(FilenameQueue {
            files: self.files.clone(),
            order: Vec::new(),
            epochs_started: 0,
            num_epochs: self.settings.num_epochs,
            rng: self.settings.rng(0),
        }));

        for id in 0..self.settings.num_readers {
            let filenames = filenames.clone();
            let queue = self.queue.clone();
            let reader = self.reader.clone();

            let handle = thread::spawn(move || {
                read_files(id, &filenames, &queue, reader.as_ref());
                queue.producer_done();
            });

            self.threads.push(handle);
        }

        self.started = true;
    }

    /// Returns the next batch.
    ///
    /// # Returns
    /// `Ok(None)` once every epoch has been consumed, or the error a reader failed with.
    pub fn next_batch(&mut self) -> Result<Option<Batch>> {
        if !self.started {
            self.start();
        }

        let Some(examples) = self.queue.dequeue_many(self.settings.batch_size)? else {
            return Ok(None);
        };

        let batch = if self.reader.frame_level() {
            frame_batch(examples, self.reader.feature_dim(), self.reader.num_classes())
        } else {
            aggregated_batch(examples, self.reader.feature_dim(), self.reader.num_classes())
        };

        Ok(Some(batch))
    }
}

impl Drop for InputPipeline {
    fn drop(&mut self) {
        self.queue.close();

        for handle in self.threads.drain(..) {
            let _ = handle.join();
        }
    }
}

/// Lists the files matching `pattern`, sorted.
///
/// # Returns
/// The files or an io error naming the pattern if it is invalid or matches nothing.
pub fn glob_files(pattern: &str) -> Result<Vec<PathBuf>> {
    let not_found = || {
        io::Error::new(
            io::ErrorKind::NotFound,
            format!("Unable to find training files. data_pattern='{pattern}'."),
        )
    };

    let entries = glob::glob(pattern).map_err(|e| {
        io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("invalid data_pattern='{pattern}': {e}"),
        )
    })?;

    let mut files = Vec::new();
    for entry in entries {
        let path = entry.map_err(|e| io::Error::new(e.error().kind(), e.to_string()))?;
        if path.is_file() {
            files.push(path);
        }
    }

    if files.is_empty() {
        return Err(not_found().into());
    }

    files.sort();
    Ok(files)
}

fn read_files(
    id: usize,
    filenames: &Mutex<FilenameQueue>,
    queue: &ShuffleQueue<Example>,
    reader: &dyn Reader,
) {
    loop {
        if queue.is_closed() {
            return;
        }

        let Some(path) = filenames.lock().next() else {
            return;
        };

        debug!(reader = id; "reading {}", path.display());

        match reader.read_file(&path) {
            Ok(examples) => {
                for example in examples {
                    if !queue.push(example) {
                        return;
                    }
                }
            }
            Err(e) => {
                queue.fail(e);
                return;
            }
        }
    }
}

fn labels_of(examples: &[Example], num_classes: usize) -> Array2<f32> {
    let mut labels = Array2::zeros((examples.len(), num_classes));

    for (mut row, example) in labels.rows_mut().into_iter().zip(examples) {
        for (slot, &label) in row.iter_mut().zip(&example.labels) {
            *slot = label;
        }
    }

    labels
}

fn aggregated_batch(examples: Vec<Example>, dim: usize, num_classes: usize) -> Batch {
    let labels = labels_of(&examples, num_classes);
    let mut features = Array2::zeros((examples.len(), dim));

    for (mut row, example) in features.rows_mut().into_iter().zip(&examples) {
        for (slot, &x) in row.iter_mut().zip(&example.features) {
            *slot = x;
        }
    }

    Batch {
        num_frames: vec![1; examples.len()],
        ids: examples.into_iter().map(|e| e.id).collect(),
        raw_features: features.into_dyn(),
        labels,
    }
}

/// Pads every video to the longest one of the batch.
fn frame_batch(examples: Vec<Example>, dim: usize, num_classes: usize) -> Batch {
    let labels = labels_of(&examples, num_classes);
    let max_frames = examples.iter().map(|e| e.frames).max().unwrap_or(0);
    let mut features = Array3::zeros((examples.len(), max_frames, dim));

    for (mut video, example) in features.outer_iter_mut().zip(&examples) {
        for (mut frame, values) in video.outer_iter_mut().zip(example.features.chunks(dim.max(1))) {
            for (slot, &x) in frame.iter_mut().zip(values) {
                *slot = x;
            }
        }
    }

    Batch {
        num_frames: examples.iter().map(|e| e.frames).collect(),
        ids: examples.into_iter().map(|e| e.id).collect(),
        raw_features: features.into_dyn(),
        labels,
    }
}

#[cfg(test)]
mod tests {
    use std::{fs, io::Write};

    use super::*;

    fn settings(pattern: String, batch_size: usize, num_epochs: Option<usize>) -> InputSettings {
        InputSettings {
            data_pattern: pattern,
            features: vec![("rgb".into(), 2)],
            frame_features: false,
            frame_only: false,
            num_classes: 3,
            batch_size,
            num_readers: 2,
            num_epochs,
            seed: Some(3),
        }
    }

    fn write_shards(dir: &std::path::Path, shards: usize, per_shard: usize) {
        for s in 0..shards {
            let mut file = fs::File::create(dir.join(format!("train{s}.jsonl"))).unwrap();
            for i in 0..per_shard {
                let id = s * per_shard + i;
                writeln!(
                    file,
                    r#"{{"id": "{id}", "labels": [{}], "rgb": [{id}.0, 1.0]}}"#,
                    id % 3
                )
                .unwrap();
            }
        }
    }

    #[test]
    fn an_empty_glob_fails_before_reading() {
        let dir = tempfile::tempdir().unwrap();
        let pattern = dir.path().join("*.jsonl").display().to_string();
        let s = settings(pattern, 4, Some(1));
        let reader = s.reader();

        let err = InputPipeline::open(s, reader).err().unwrap();
        match err {
            TrainErr::Io(e) => assert!(e.to_string().contains("Unable to find training files")),
            other => panic!("unexpected error {other}"),
        }
    }

    #[test]
    fn every_example_is_served_once_per_epoch() {
        let dir = tempfile::tempdir().unwrap();
        write_shards(dir.path(), 3, 7);
        let pattern = dir.path().join("*.jsonl").display().to_string();
        let s = settings(pattern, 5, Some(2));
        let reader = s.reader();

        let mut pipeline = InputPipeline::open(s, reader).unwrap();
        assert_eq!(pipeline.files().len(), 3);

        let mut ids = Vec::new();
        while let Some(batch) = pipeline.next_batch().unwrap() {
            assert_eq!(batch.raw_features.shape(), &[batch.len(), 2]);
            assert_eq!(batch.labels.shape(), &[batch.len(), 3]);
            ids.extend(batch.ids);
        }

        assert_eq!(ids.len(), 42);
        ids.sort_by_key(|id| id.parse::<usize>().unwrap());
        ids.dedup();
        assert_eq!(ids.len(), 21);
    }

    #[test]
    fn frame_batches_are_padded_to_the_longest_video() {
        let examples = vec![
            Example {
                id: "a".into(),
                features: vec![1., 2., 3., 4.],
                frames: 2,
                labels: vec![1., 0.],
            },
            Example {
                id: "b".into(),
                features: vec![5., 6.],
                frames: 1,
                labels: vec![0., 1.],
            },
        ];

        let batch = frame_batch(examples, 2, 2);

        assert_eq!(batch.raw_features.shape(), &[2, 2, 2]);
        assert_eq!(batch.num_frames, vec![2, 1]);
        assert_eq!(batch.raw_features[[1, 0, 1]], 6.);
        assert_eq!(batch.raw_features[[1, 1, 0]], 0.);
    }
}
