//! Error taxonomy shared by every connector, executor, and artifact operation.
//!
//! Validation errors (`InvalidConfig`, `MissingParameter`, `InvalidPayload`,
//! `UnsupportedMethod`, ...) are raised before any network or filesystem
//! I/O. Transport and remote-service errors carry enough context to tell
//! which connector and endpoint failed.

use thiserror::Error;

use crate::connector::ActionType;

/// Result alias used across the workspace.
pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    #[error("{0}")]
    InvalidConfig(String),

    #[error("unsupported connector protocol: {0}")]
    UnsupportedProtocol(String),

    #[error("unsupported auth type: {0}")]
    UnsupportedAuthType(String),

    #[error("unsupported http method: {0}")]
    UnsupportedMethod(String),

    #[error("no {0} action found in connector")]
    ActionNotFound(ActionType),

    #[error("missing value for parameter `{0}`")]
    MissingParameter(String),

    #[error("invalid payload: {0}")]
    InvalidPayload(String),

    #[error("failed to load private key from {path}: {reason}")]
    KeyLoad { path: String, reason: String },

    #[error("failed to sign request: {0}")]
    Signing(String),

    #[error("connector `{connector}` failed to reach {endpoint}: {message}")]
    Transport {
        connector: String,
        endpoint: String,
        message: String,
    },

    #[error("remote service returned status {status}: {body}")]
    RemoteService { status: u16, body: String },

    #[error("invalid response: {0}")]
    InvalidResponse(String),

    #[error("script error: {0}")]
    Script(String),

    #[error("invalid uri: {0}")]
    InvalidUri(String),

    #[error("invalid model archive: {0}")]
    InvalidArchive(String),

    #[error("model file hash mismatch: expected {expected}, computed {actual}")]
    HashMismatch { expected: String, actual: String },

    #[error("Model format is {format}, but find {extension} file")]
    ModelFormatMismatch { format: String, extension: String },

    #[error("Find multiple model files, but expected only one")]
    MultipleModelFiles,

    #[error("Can't find model file")]
    NoModelFile,

    #[error("No tokenizer file")]
    NoTokenizerFile,

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Shorthand for `Error::InvalidConfig(msg.into())`.
    pub fn invalid_config(msg: impl Into<String>) -> Self {
        Self::InvalidConfig(msg.into())
    }

    /// HTTP status carried by a remote-service failure, if any.
    pub fn status(&self) -> Option<u16> {
        match self {
            Self::RemoteService { status, .. } => Some(*status),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_invalid_config_displays_bare_message() {
        let err = Error::invalid_config("Missing tenant id");
        assert_eq!(err.to_string(), "Missing tenant id");
    }

    #[test]
    fn test_archive_messages() {
        let err = Error::ModelFormatMismatch {
            format: "TORCH_SCRIPT".into(),
            extension: ".onnx".into(),
        };
        assert_eq!(
            err.to_string(),
            "Model format is TORCH_SCRIPT, but find .onnx file"
        );
        assert_eq!(
            Error::MultipleModelFiles.to_string(),
            "Find multiple model files, but expected only one"
        );
        assert_eq!(Error::NoModelFile.to_string(), "Can't find model file");
        assert_eq!(Error::NoTokenizerFile.to_string(), "No tokenizer file");
    }

    #[test]
    fn test_status_only_for_remote_errors() {
        let remote = Error::RemoteService {
            status: 404,
            body: "{}".into(),
        };
        assert_eq!(remote.status(), Some(404));
        assert_eq!(Error::NoModelFile.status(), None);
    }
}
