//! Common error type for the recording pipeline
//!
//! # Design Principles (KISS)
//! - Each component keeps its own thiserror enum
//! - `PipelineError` wraps them for callers that drive several components
//! - Binaries convert to anyhow at the edge

use thiserror::Error;

use crate::config::ConfigError;
use crate::emulator::EmulatorError;
use crate::format::FormatError;
use crate::queue::QueueError;
use crate::record::RecordError;
use crate::sync::SyncError;

/// Errors of any pipeline component
#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Queue error: {0}")]
    Queue(#[from] QueueError),

    #[error("File format error: {0}")]
    Format(#[from] FormatError),

    #[error("Recording error: {0}")]
    Record(#[from] RecordError),

    #[error("Synchronization error: {0}")]
    Sync(#[from] SyncError),

    #[error("Emulator error: {0}")]
    Emulator(#[from] EmulatorError),

    /// I/O error (file operations)
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type alias using PipelineError
pub type PipelineResult<T> = Result<T, PipelineError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_io_error_from() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "file not found");
        let err: PipelineError = io_err.into();
        assert!(err.to_string().contains("I/O error"));
    }

    #[test]
    fn test_component_errors_wrap() {
        let err: PipelineError = SyncError::NotSynchronized(3).into();
        assert!(err.to_string().contains("Stream 3 is not synchronized"));

        let err: PipelineError = RecordError::UnknownEngine("X".into()).into();
        assert!(matches!(err, PipelineError::Record(_)));
    }
}
