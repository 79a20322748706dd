//! The input pipeline: file globbing, reader threads and the shuffling batch queue.

mod pipeline;
mod queue;
mod reader;

pub use pipeline::{Batch, InputPipeline, InputSettings, glob_files};
pub use queue::ShuffleQueue;
pub use reader::{
    AggregatedFeatureReader, Example, FrameFeatureOnlyReader, FrameFeatureReader, MAX_FRAMES,
    Reader,
};
