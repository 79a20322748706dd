//! The wire protocol between trainers and parameter servers, and the cluster specs both
//! sides agree on.

mod frame;
pub mod msg;
pub mod specs;

pub use frame::{Decode, Encode, FrameReceiver, FrameSender, FrameWord, MAX_FRAME_LEN, channel};
