//! On-disk formats used by the recording engines
//!
//! - `npy`: NumPy `.npy` arrays whose header is rewritten in place as
//!   records are appended
//! - `block_file`: interleaved multichannel `i16` file assembled from
//!   per-channel writes arriving out of step

pub mod block_file;
pub mod npy;

pub use block_file::SequentialBlockFile;
pub use npy::{read_npy, BaseType, NpyElement, NpyFile, NpyHeader, NpyType};

use thiserror::Error;

/// Errors from the file format layer
#[derive(Debug, Error)]
pub enum FormatError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid NPY magic bytes")]
    InvalidMagic,

    #[error("Unsupported NPY version {major}.{minor}")]
    UnsupportedVersion { major: u8, minor: u8 },

    #[error("Malformed NPY header: {0}")]
    MalformedHeader(String),

    #[error("NPY dtype mismatch: file has '{actual}', expected '{expected}'")]
    DtypeMismatch { expected: String, actual: String },

    #[error("Channel {channel} out of range ({n_channels} channels)")]
    ChannelOutOfRange { channel: usize, n_channels: usize },
}

impl FormatError {
    /// Check if this is an IO error
    pub fn is_io(&self) -> bool {
        matches!(self, FormatError::Io(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = FormatError::ChannelOutOfRange {
            channel: 5,
            n_channels: 4,
        };
        assert_eq!(err.to_string(), "Channel 5 out of range (4 channels)");

        let err: FormatError = std::io::Error::new(std::io::ErrorKind::NotFound, "gone").into();
        assert!(err.is_io());
    }
}
