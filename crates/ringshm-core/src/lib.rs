#![doc = include_str!("../README.md")]
#![forbid(unsafe_op_in_unsafe_fn)]

mod clock;
mod error;
mod ring;
mod segment;
mod sync;

pub use clock::now_micros;
pub use error::{RingBufferError, SegmentError};
pub use ring::{required_size, RingBuffer, MAX_SLOTS};
pub use segment::{Permissions, Segment};
