#![allow(clippy::result_large_err)]
//! ObjectIO Image I/O
//!
//! This crate is the public I/O entry layer of an ObjectIO block image. Every
//! read, write, discard, write-same, compare-and-write and flush enters here,
//! is validated against the image, and is handed to the image's dispatch
//! pipeline as a single [`ImageDispatchSpec`] tagged with the API-start layer.
//!
//! # Features
//!
//! - **Async and sync entry points**: `aio_*` calls return immediately, the
//!   synchronous wrappers block until the pipeline resolves the request
//! - **Size clipping**: write-class requests are clipped to the image size
//! - **Completion tracking**: exactly-once resolution with callback, blocking,
//!   oneshot and event-socket delivery
//! - **Latency accounting**: per-operation latency histograms
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────┐
//! │     Caller      │  (aio_* / sync API)
//! └────────┬────────┘
//!          │
//! ┌────────▼────────┐
//! │   Entry layer   │
//! │  - validity     │
//! │  - clipping     │
//! │  - AioCompletion│
//! └────────┬────────┘
//!          │  ImageDispatchSpec (ApiStart)
//! ┌────────▼────────┐
//! │ ImageDispatcher │  (MemoryDispatcher, ...)
//! └─────────────────┘
//! ```

pub mod api;
pub mod clip;
pub mod completion;
pub mod dispatch;
pub mod error;
pub mod event;
pub mod image;
pub mod memory;
pub mod perf;
pub mod types;

#[cfg(test)]
mod testing;

pub use api::{
    aio_compare_and_write, aio_discard, aio_flush, aio_read, aio_write, aio_write_same,
    compare_and_write, discard, flush, read, write, write_same,
};
pub use clip::clip_io;
pub use completion::{AioCompletion, CompletionSink, CompletionState, SaferCond};
pub use dispatch::{ImageDispatchSpec, ImageDispatcher, ImageRequest};
pub use error::{BlockError, BlockResult};
pub use event::EventSocket;
pub use image::{Image, ImageCtx, ImageOptions};
pub use memory::MemoryDispatcher;
pub use perf::{IoStats, LatencyHistogram, OpStats};
pub use types::{
    AioType, FlushSource, ImageDispatchLayer, ImageExtent, ImageExtents, MismatchOffset, OpFlags,
    ReadResult,
};

/// Default object size: 4MB (matches EC stripe size)
pub const DEFAULT_OBJECT_SIZE: u64 = 4 * 1024 * 1024;
