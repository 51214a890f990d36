//! Image I/O error types
//!
//! Completions carry a signed result code (negative errno on failure). The
//! synchronous API surfaces the same outcome as a [`BlockError`]; the code is
//! always recoverable with [`BlockError::errno`].

use thiserror::Error;

/// Image I/O error
#[derive(Error, Debug)]
pub enum BlockError {
    /// The image has no usable backing data store
    #[error("Device unavailable: {0}")]
    DeviceUnavailable(String),

    /// Request starts at or beyond the end of the image
    #[error("Invalid IO request: offset {offset} length {length} image size {size}")]
    InvalidRequest { offset: u64, length: u64, size: u64 },

    /// Malformed request arguments
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// Compare-and-write found differing data
    #[error("Compare mismatch at offset {offset}")]
    CompareMismatch { offset: u64 },

    /// Error code surfaced by the dispatch pipeline
    #[error("Pipeline error: {}", errno_description(.0))]
    Pipeline(i64),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl BlockError {
    /// Negative errno equivalent of this error
    pub fn errno(&self) -> i64 {
        match self {
            BlockError::DeviceUnavailable(_) => -i64::from(libc::ENODEV),
            BlockError::InvalidRequest { .. } | BlockError::InvalidArgument(_) => {
                -i64::from(libc::EINVAL)
            }
            BlockError::CompareMismatch { .. } => -i64::from(libc::EILSEQ),
            BlockError::Pipeline(code) => *code,
            BlockError::Io(e) => e.raw_os_error().map_or(-i64::from(libc::EIO), |c| -i64::from(c)),
            BlockError::Internal(_) => -i64::from(libc::EIO),
        }
    }

    /// Map a negative completion result code back to an error.
    ///
    /// Compare mismatches are not reconstructed here since the code alone
    /// does not carry the mismatch offset.
    pub fn from_errno(code: i64) -> Self {
        if code == -i64::from(libc::ENODEV) {
            BlockError::DeviceUnavailable("missing data pool".to_string())
        } else {
            BlockError::Pipeline(code)
        }
    }
}

fn errno_description(code: &i64) -> String {
    match i32::try_from(-*code) {
        Ok(raw) => format!("{} ({})", std::io::Error::from_raw_os_error(raw), code),
        Err(_) => format!("result code {}", code),
    }
}

/// Result type for image I/O operations
pub type BlockResult<T> = Result<T, BlockError>;
