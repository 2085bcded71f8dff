//! Loader status codes.
//!
//! The core never panics and never propagates decoder errors upward: every
//! fallible operation reports one of these codes, either on the returned
//! handle, on the texture record, or via the loader's last-error slot.

use thiserror::Error;

/// Status code reported by every public loader operation.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[non_exhaustive]
pub enum LoaderError {
    #[default]
    #[error("Success")]
    Success,

    /// A texture ID outside the registered range was passed in.
    #[error("Invalid texture ID")]
    InvalidTextureId,

    /// The dense ID space (`max_textures`) is exhausted.
    #[error("Maximum textures exceeded")]
    MaxTexturesExceeded,

    /// The file path could not be opened or probed.
    #[error("File not found")]
    FileNotFound,

    /// Decoding failed (corrupt data, unsupported format, source error).
    #[error("Image load failed")]
    ImageLoadFailed,

    /// A device or pinned allocation failed.
    #[error("Out of memory")]
    OutOfMemory,

    /// Caller-supplied arguments were rejected before any state changed.
    #[error("Invalid parameter")]
    InvalidParameter,

    /// The GPU runtime reported a failure.
    #[error("HIP error")]
    HipError,
}

impl LoaderError {
    #[inline]
    pub fn is_success(self) -> bool {
        self == LoaderError::Success
    }

    /// True for errors that leave the texture retryable on the next request.
    #[inline]
    pub fn is_retryable(self) -> bool {
        matches!(
            self,
            LoaderError::FileNotFound
                | LoaderError::ImageLoadFailed
                | LoaderError::OutOfMemory
                | LoaderError::HipError
        )
    }
}
