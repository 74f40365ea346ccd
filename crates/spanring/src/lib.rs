//! Lock-free building blocks for a streaming span recorder.
//!
//! Application threads serialize finished spans straight into a bounded
//! [`SpanBuffer`]; a single I/O thread periodically promotes the readable
//! region to an *allotment*, wraps it into a report and consumes it once the
//! bytes are on the wire. [`BlockAllocator`] and [`FragmentChain`] support
//! zero-copy report assembly on the consumer side.
//!
//! # Concurrency model
//!
//! - [`SpanBuffer`]: any number of producers, exactly one consumer.
//! - [`BlockAllocator`]: allocate/deallocate from any thread.
//! - [`FragmentChain`]: single-threaded, built and drained on the consumer.
//!
//! # Example
//!
//! ```
//! use spanring::SpanBuffer;
//! use std::io::Write;
//!
//! let buffer = SpanBuffer::with_capacity(1 << 10);
//! let added = buffer.add(5, |w| w.write_all(b"hello"));
//! assert!(added);
//!
//! let allotted = buffer.allot();
//! assert_eq!(allotted, 5);
//! let (first, second) = buffer.allotment();
//! assert_eq!(first, b"hello");
//! assert!(second.is_empty());
//! buffer.consume(5);
//! ```

mod block_alloc;
mod buffer;
mod chain;

pub use block_alloc::BlockAllocator;
pub use buffer::{RingWriter, SpanBuffer};
pub use chain::{FragmentChain, CHAIN_NODE_BLOCK_SIZE};

use thiserror::Error;

/// Errors surfaced by the lock-free core.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum RingError {
    /// The block allocator has no free blocks left.
    #[error("block allocator exhausted")]
    Exhausted,
}
