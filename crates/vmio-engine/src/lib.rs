//! vmio Engine - concurrent image copy
//!
//! Streams extents between two backends with a pool of workers. Each
//! worker owns an independent clone of the source and destination and
//! a private aligned buffer; coordination happens only through a
//! bounded closeable queue.

pub mod copy;
pub mod progress;
pub mod queue;

pub use copy::{CopyOptions, Request, copy};
pub use progress::Progress;
pub use queue::{Closed, Queue};
