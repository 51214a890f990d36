//! Shared I/O vocabulary: operation kinds, dispatch layers, flags and the
//! per-request output slots handed to the pipeline.

use bytes::{Bytes, BytesMut};
use parking_lot::Mutex;
use std::fmt;
use std::sync::Arc;

/// Kind of operation a completion tracks
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AioType {
    #[default]
    None,
    Generic,
    Open,
    Close,
    Read,
    Write,
    Discard,
    Flush,
    WriteSame,
    CompareAndWrite,
}

impl AioType {
    pub fn as_str(&self) -> &'static str {
        match self {
            AioType::None => "none",
            AioType::Generic => "generic",
            AioType::Open => "open",
            AioType::Close => "close",
            AioType::Read => "read",
            AioType::Write => "write",
            AioType::Discard => "discard",
            AioType::Flush => "flush",
            AioType::WriteSame => "writesame",
            AioType::CompareAndWrite => "compare_and_write",
        }
    }
}

impl fmt::Display for AioType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Layers of the image dispatch pipeline, outermost first.
///
/// A request tagged with a layer is first observed by the layer that
/// follows it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ImageDispatchLayer {
    None = 0,
    ApiStart = 1,
    Queue,
    Qos,
    ExclusiveLock,
    Refresh,
    InternalStart,
    Migration,
    Journal,
    WriteBlock,
    WritebackCache,
    Crypto,
    Core,
    Last,
}

/// Origin of a flush request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlushSource {
    User,
    Internal,
    Shutdown,
    ExclusiveLockSkipRefresh,
    Refresh,
    WritebackCache,
}

/// Per-request operation hints passed through to the backing store
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Hash)]
pub struct OpFlags(u32);

impl OpFlags {
    pub const NONE: OpFlags = OpFlags(0);
    pub const FADVISE_RANDOM: OpFlags = OpFlags(0x4);
    pub const FADVISE_SEQUENTIAL: OpFlags = OpFlags(0x8);
    pub const FADVISE_WILLNEED: OpFlags = OpFlags(0x10);
    pub const FADVISE_DONTNEED: OpFlags = OpFlags(0x20);
    pub const FADVISE_NOCACHE: OpFlags = OpFlags(0x40);

    pub const fn from_bits(bits: u32) -> Self {
        OpFlags(bits)
    }

    pub const fn bits(self) -> u32 {
        self.0
    }

    pub const fn contains(self, other: OpFlags) -> bool {
        self.0 & other.0 == other.0
    }

    pub const fn union(self, other: OpFlags) -> Self {
        OpFlags(self.0 | other.0)
    }
}

impl std::ops::BitOr for OpFlags {
    type Output = OpFlags;

    fn bitor(self, rhs: OpFlags) -> OpFlags {
        self.union(rhs)
    }
}

impl fmt::Display for OpFlags {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

/// A byte range in the logical image address space
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ImageExtent {
    /// Start offset in bytes
    pub offset: u64,
    /// Length in bytes
    pub length: u64,
}

impl ImageExtent {
    pub fn new(offset: u64, length: u64) -> Self {
        Self { offset, length }
    }

    /// Exclusive end offset
    pub fn end(&self) -> u64 {
        self.offset.saturating_add(self.length)
    }
}

pub type ImageExtents = Vec<ImageExtent>;

/// Destination for the data returned by a read.
///
/// Cloning shares the buffer; the pipeline fills it and the caller takes the
/// bytes once the completion resolves.
#[derive(Clone, Default)]
pub struct ReadResult {
    /// Bytes assembled by the pipeline
    buffer: Arc<Mutex<BytesMut>>,
}

impl ReadResult {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append data for the next extent of the request
    pub fn append(&self, data: &[u8]) {
        self.buffer.lock().extend_from_slice(data);
    }

    /// Number of bytes assembled so far
    pub fn len(&self) -> usize {
        self.buffer.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Take the assembled data, leaving the sink empty
    pub fn take(&self) -> Bytes {
        self.buffer.lock().split().freeze()
    }
}

impl fmt::Debug for ReadResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReadResult").field("len", &self.len()).finish()
    }
}

/// Output slot for the offset of the first differing byte of a
/// compare-and-write
#[derive(Debug, Clone, Default)]
pub struct MismatchOffset {
    /// Absolute image offset, set on mismatch
    slot: Arc<Mutex<Option<u64>>>,
}

impl MismatchOffset {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self, offset: u64) {
        *self.slot.lock() = Some(offset);
    }

    pub fn get(&self) -> Option<u64> {
        *self.slot.lock()
    }
}
