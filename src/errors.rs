use std::fmt;

use itertools::Itertools;
use serde_json::{json, Value};
use thiserror::Error;

pub type Result<T> = std::result::Result<T, UploadError>;

pub const ALREADY_PENDING_REQUEST: i64 = -1730;
pub const MISSING_PARAMS: i64 = -1731;
pub const UNSUPPORTED_TYPE: i64 = -1732;
pub const INVALID_BINARY_RECEIVE: i64 = -1733;
pub const LOADING_BINARY_FAILED: i64 = -1734;
pub const INVALID_PATH: i64 = -1736;
/// Generic runtime failure, also used for cancelled requests.
pub const RUNTIME_ERROR: i64 = -1;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum UploadError {
    #[error("Already pending binary request")]
    AlreadyPendingRequest,
    #[error("Missing params")]
    MissingParams,
    #[error("Unsupported type")]
    UnsupportedType {
        index: usize,
        supported_types: Vec<String>,
    },
    #[error(
        "Invalid binary received; no more files expected or current file \
         is complete"
    )]
    InvalidBinaryReceive,
    #[error("{0}")]
    LoadingBinaryFailed(String),
    #[error("No loader found for '{0}'")]
    NoLoaderFound(String),
    #[error("Invalid path '{0}'")]
    InvalidPath(String),
    #[error("Configuration error: {0}")]
    Config(String),
    #[error("IO error: {0}")]
    Io(String),
    #[error("Request cancelled")]
    Cancelled,
}

impl UploadError {
    /// JSON-RPC error code reported to clients.
    pub fn code(&self) -> i64 {
        match self {
            Self::AlreadyPendingRequest => ALREADY_PENDING_REQUEST,
            Self::MissingParams => MISSING_PARAMS,
            Self::UnsupportedType { .. } => UNSUPPORTED_TYPE,
            Self::InvalidBinaryReceive => INVALID_BINARY_RECEIVE,
            Self::LoadingBinaryFailed(_) | Self::NoLoaderFound(_) => {
                LOADING_BINARY_FAILED
            }
            Self::InvalidPath(_) => INVALID_PATH,
            Self::Config(_) | Self::Io(_) | Self::Cancelled => RUNTIME_ERROR,
        }
    }

    /// Structured payload attached to the JSON-RPC error, if any.
    pub fn data(&self) -> Option<Value> {
        match self {
            Self::UnsupportedType {
                index,
                supported_types,
            } => Some(json!({
                "index": index,
                "supportedTypes": supported_types,
            })),
            _ => None,
        }
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }
}

impl From<std::io::Error> for UploadError {
    fn from(e: std::io::Error) -> Self {
        Self::Io(e.to_string())
    }
}

impl From<serde_json::Error> for UploadError {
    fn from(e: serde_json::Error) -> Self {
        Self::Config(e.to_string())
    }
}

/// Failure reported by a format-specific loader.
#[derive(Error, Debug)]
pub enum LoadError {
    #[error("Loading cancelled")]
    Cancelled,
    #[error("{0}")]
    Invalid(String),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<LoadError> for UploadError {
    fn from(e: LoadError) -> Self {
        match e {
            LoadError::Cancelled => UploadError::Cancelled,
            other => UploadError::LoadingBinaryFailed(other.to_string()),
        }
    }
}

impl From<UploadError> for LoadError {
    fn from(e: UploadError) -> Self {
        match e {
            UploadError::Cancelled => LoadError::Cancelled,
            other => LoadError::Invalid(other.to_string()),
        }
    }
}

/// Comma separated list, used when logging rejected types.
pub struct TypeList<'a>(pub &'a [String]);

impl fmt::Display for TypeList<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.iter().join(", "))
    }
}
