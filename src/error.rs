//! Error types for UnAudio

use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum UnAudioError {
    #[error("Invalid parameter: {0}")]
    InvalidParameter(String),

    #[error("Engine is not initialized")]
    NotInitialized,

    #[error("Engine is already initialized")]
    AlreadyInitialized,

    #[error("Audio device not found: {0}")]
    DeviceNotFound(String),

    #[error("Platform audio error: {0}")]
    Platform(String),

    #[error("Voice pool exhausted")]
    OutOfHandles,

    #[error("Memory budget exceeded: requested {requested} bytes, {available} available")]
    OutOfMemory { requested: usize, available: usize },

    #[error("Decode failed: {0}")]
    DecodeFailed(String),

    #[error("Format not supported: {0}")]
    FormatNotSupported(String),
}

pub type Result<T> = std::result::Result<T, UnAudioError>;

/// Result code returned by the flat API for a successful call.
pub const RESULT_OK: i32 = 0;

impl UnAudioError {
    /// Stable integer code used across the flat function boundary.
    pub fn code(&self) -> i32 {
        match self {
            Self::InvalidParameter(_) => -1,
            Self::NotInitialized => -2,
            Self::DecodeFailed(_) => -3,
            Self::Platform(_) => -4,
            Self::OutOfMemory { .. } => -5,
            Self::FormatNotSupported(_) => -7,
            Self::AlreadyInitialized => -8,
            Self::DeviceNotFound(_) => -9,
            Self::OutOfHandles => -10,
        }
    }

    pub(crate) fn invalid(msg: impl Into<String>) -> Self {
        Self::InvalidParameter(msg.into())
    }
}

/// Collapses a `Result` into a flat result code.
pub fn result_code(result: &Result<()>) -> i32 {
    match result {
        Ok(()) => RESULT_OK,
        Err(e) => e.code(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codes_are_negative_and_distinct() {
        let errors = [
            UnAudioError::invalid("x"),
            UnAudioError::NotInitialized,
            UnAudioError::AlreadyInitialized,
            UnAudioError::DeviceNotFound("none".into()),
            UnAudioError::Platform("boom".into()),
            UnAudioError::OutOfHandles,
            UnAudioError::OutOfMemory {
                requested: 1,
                available: 0,
            },
            UnAudioError::DecodeFailed("bad".into()),
            UnAudioError::FormatNotSupported("???".into()),
        ];

        let mut codes: Vec<i32> = errors.iter().map(|e| e.code()).collect();
        assert!(codes.iter().all(|c| *c < 0));
        codes.sort_unstable();
        codes.dedup();
        assert_eq!(codes.len(), errors.len());
    }

    #[test]
    fn result_code_maps_ok_to_zero() {
        assert_eq!(result_code(&Ok(())), RESULT_OK);
        assert_eq!(result_code(&Err(UnAudioError::OutOfHandles)), -10);
    }
}
