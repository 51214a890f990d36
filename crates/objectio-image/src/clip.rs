//! Bounds clipping against the current image size

use crate::error::{BlockError, BlockResult};
use crate::image::ImageCtx;

/// Clip `len` so that `off + len` stays within the image.
///
/// The shared side of the size lock is held only while the size is read.
/// Zero-length requests are always valid. A request that starts at or beyond
/// the end of the image is rejected with [`BlockError::InvalidRequest`].
pub fn clip_io<I: ImageCtx + ?Sized>(image: &I, off: u64, len: u64) -> BlockResult<u64> {
    let size = *image.size_lock().read();
    clip_to_size(size, off, len)
}

/// Clip against an already-read image size
pub fn clip_to_size(size: u64, off: u64, len: u64) -> BlockResult<u64> {
    if len == 0 {
        return Ok(0);
    }

    if off >= size {
        return Err(BlockError::InvalidRequest {
            offset: off,
            length: len,
            size,
        });
    }

    Ok(len.min(size - off))
}
