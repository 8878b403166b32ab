//! Engine error taxonomy

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Result alias used across the engine.
pub type Result<T> = std::result::Result<T, EngineError>;

/// Engine errors
#[derive(Error, Debug, Clone, PartialEq)]
pub enum EngineError {
    #[error("Capture permission denied: {0}")]
    PermissionDenied(String),

    #[error("Failed to enumerate devices: {0}")]
    EnumerationFailed(String),

    #[error("Device unavailable: {0}")]
    DeviceUnavailable(String),

    #[error("Capture stream failed: {0}")]
    StreamFailed(String),

    #[error("Source is not active: {0}")]
    NotActive(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Unknown analyzer: {0}")]
    UnknownAnalyzer(String),

    #[error("Unknown source: {0}")]
    UnknownSource(String),

    #[error("Unknown percussion detector: {0}")]
    UnknownDetector(String),

    #[error("Engine has been destroyed")]
    Destroyed,
}

/// Stable error code carried by `error` events
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    PermissionDenied,
    EnumerationFailed,
    DeviceUnavailable,
    StreamFailed,
    NotActive,
    InvalidConfig,
    NotFound,
    Destroyed,
}

impl EngineError {
    pub fn code(&self) -> ErrorCode {
        match self {
            Self::PermissionDenied(_) => ErrorCode::PermissionDenied,
            Self::EnumerationFailed(_) => ErrorCode::EnumerationFailed,
            Self::DeviceUnavailable(_) => ErrorCode::DeviceUnavailable,
            Self::StreamFailed(_) => ErrorCode::StreamFailed,
            Self::NotActive(_) => ErrorCode::NotActive,
            Self::InvalidConfig(_) => ErrorCode::InvalidConfig,
            Self::UnknownAnalyzer(_) | Self::UnknownSource(_) | Self::UnknownDetector(_) => {
                ErrorCode::NotFound
            }
            Self::Destroyed => ErrorCode::Destroyed,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lookup_failures_share_not_found_code() {
        assert_eq!(
            EngineError::UnknownAnalyzer("analyzer-1".into()).code(),
            ErrorCode::NotFound
        );
        assert_eq!(
            EngineError::UnknownDetector("kick".into()).code(),
            ErrorCode::NotFound
        );
        assert_eq!(
            EngineError::PermissionDenied("denied".into()).code(),
            ErrorCode::PermissionDenied
        );
    }

    #[test]
    fn error_code_serializes_snake_case() {
        let json = serde_json::to_string(&ErrorCode::DeviceUnavailable).unwrap();
        assert_eq!(json, "\"device_unavailable\"");
    }
}
