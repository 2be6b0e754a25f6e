use std::path::PathBuf;

use serde::Serialize;
use thiserror::Error;

use crate::dmm::ParseError;

/// Unified error type for mapwright operations
#[derive(Debug, Error)]
pub enum MapwrightError {
    // IO errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to read file '{path}': {source}")]
    FileRead {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Failed to write file '{path}': {source}")]
    FileWrite {
        path: PathBuf,
        source: std::io::Error,
    },

    // Map format errors
    #[error("Failed to parse map '{path}': {source}")]
    MapParse { path: PathBuf, source: ParseError },

    #[error("Map file '{0}' is not valid UTF-8")]
    InvalidEncoding(PathBuf),

    // Backup errors
    #[error("Could not determine backup directory")]
    NoBackupDir,
}

/// Result type alias for mapwright operations
pub type Result<T> = std::result::Result<T, MapwrightError>;

/// A serializable representation of MapwrightError for IPC with an editor shell
#[derive(Debug, Clone, Serialize)]
pub struct SerializableError {
    /// Error kind/variant name
    pub kind: String,
    /// Human-readable error message
    pub message: String,
    /// Associated path (if applicable)
    pub path: Option<PathBuf>,
}

impl From<&MapwrightError> for SerializableError {
    fn from(err: &MapwrightError) -> Self {
        let kind = match err {
            MapwrightError::Io(_) => "Io",
            MapwrightError::FileRead { .. } => "FileRead",
            MapwrightError::FileWrite { .. } => "FileWrite",
            MapwrightError::MapParse { .. } => "MapParse",
            MapwrightError::InvalidEncoding(_) => "InvalidEncoding",
            MapwrightError::NoBackupDir => "NoBackupDir",
        }
        .to_string();

        let path = match err {
            MapwrightError::FileRead { path, .. } => Some(path.clone()),
            MapwrightError::FileWrite { path, .. } => Some(path.clone()),
            MapwrightError::MapParse { path, .. } => Some(path.clone()),
            MapwrightError::InvalidEncoding(path) => Some(path.clone()),
            _ => None,
        };

        Self {
            kind,
            message: err.to_string(),
            path,
        }
    }
}

impl From<MapwrightError> for SerializableError {
    fn from(err: MapwrightError) -> Self {
        SerializableError::from(&err)
    }
}

impl MapwrightError {
    /// Convert to a serializable representation for IPC
    pub fn to_serializable(&self) -> SerializableError {
        SerializableError::from(self)
    }
}
