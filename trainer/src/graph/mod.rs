//! The training graph: one optimization step plus the named handles the loop reads.

mod builder;
mod handles;
mod meta;
mod params;
mod train_op;

pub use builder::{BuiltGraph, GraphBuilder, input_settings};
pub use handles::{GraphHandles, Handle};
pub use meta::{MetaGraph, ScheduleSettings};
pub use params::{FORWARD_BLOCKS, ForwardParameter, check_forward_parameters, forward_parameters};
pub use train_op::{LossTerms, StepOutput, TrainOp};
