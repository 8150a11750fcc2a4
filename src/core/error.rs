//! Error types for the tumulus library
//!
//! Provides a single error type for tiling, detection and clustering operations.
//! Only configuration-level errors are meant to abort a whole run; the pipeline
//! catches and records everything else per raster or per tile.

use std::fmt;

/// Main error type for tumulus operations
#[derive(Debug)]
pub enum Error {
    /// Invalid tile/overlap sizing or other pipeline settings
    InvalidConfig(String),

    /// Oracle credentials were not supplied
    MissingCredentials(String),

    /// Affine transform with zero resolution or non-finite coefficients
    InvalidTransform(String),

    /// Raster could not be decoded or carries no georeferencing
    RasterError(String),

    /// File I/O error
    IoError(std::io::Error),

    /// HTTP-specific error (non-retryable status, malformed body)
    HttpError(String),

    /// Network connectivity issues, timeouts, rate limiting, server errors
    NetworkError(String),

    /// The oracle answered but produced no usable text (blocked, empty candidate)
    OracleRejected(String),

    /// JSON (de)serialization failure on ledger, metadata or GeoJSON files
    SerializationError(serde_json::Error),

    /// Tile image encoding failure
    ImageError(String),

    /// Invalid parameters or malformed input files
    InvalidInput(String),
}

impl Error {
    /// Whether this error comes from the transport layer and may succeed on a later run
    pub fn is_transport(&self) -> bool {
        matches!(self, Error::NetworkError(_) | Error::HttpError(_))
    }

    /// Whether this error must abort the run before any work is done
    pub fn is_fatal(&self) -> bool {
        matches!(self, Error::InvalidConfig(_) | Error::MissingCredentials(_))
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::InvalidConfig(msg) => {
                write!(f, "Invalid configuration: {msg}")
            }
            Error::MissingCredentials(msg) => {
                write!(f, "Missing credentials: {msg}")
            }
            Error::InvalidTransform(msg) => {
                write!(f, "Invalid transform: {msg}")
            }
            Error::RasterError(msg) => {
                write!(f, "Raster error: {msg}")
            }
            Error::IoError(err) => {
                write!(f, "I/O error: {err}")
            }
            Error::HttpError(msg) => {
                write!(f, "HTTP error: {msg}")
            }
            Error::NetworkError(msg) => {
                write!(f, "Network error: {msg}")
            }
            Error::OracleRejected(msg) => {
                write!(f, "Oracle rejected request: {msg}")
            }
            Error::SerializationError(err) => {
                write!(f, "Serialization error: {err}")
            }
            Error::ImageError(msg) => {
                write!(f, "Image error: {msg}")
            }
            Error::InvalidInput(msg) => {
                write!(f, "Invalid input: {msg}")
            }
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::IoError(err) => Some(err),
            Error::SerializationError(err) => Some(err),
            _ => None,
        }
    }
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Error::IoError(err)
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::SerializationError(err)
    }
}

impl From<reqwest::Error> for Error {
    fn from(err: reqwest::Error) -> Self {
        if err.is_connect() || err.is_timeout() {
            Error::NetworkError(err.to_string())
        } else {
            Error::HttpError(err.to_string())
        }
    }
}

impl From<image::ImageError> for Error {
    fn from(err: image::ImageError) -> Self {
        Error::ImageError(err.to_string())
    }
}

impl From<tiff::TiffError> for Error {
    fn from(err: tiff::TiffError) -> Self {
        Error::RasterError(err.to_string())
    }
}

impl From<geojson::Error> for Error {
    fn from(err: geojson::Error) -> Self {
        Error::InvalidInput(format!("GeoJSON: {err}"))
    }
}

impl From<tempfile::PersistError> for Error {
    fn from(err: tempfile::PersistError) -> Self {
        Error::IoError(err.error)
    }
}

/// Convenience result type for tumulus operations
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transport_classification() {
        assert!(Error::NetworkError("timeout".to_string()).is_transport());
        assert!(Error::HttpError("403 Forbidden".to_string()).is_transport());
        assert!(!Error::OracleRejected("SAFETY".to_string()).is_transport());
        assert!(!Error::InvalidInput("bad".to_string()).is_transport());
    }

    #[test]
    fn test_fatal_classification() {
        assert!(Error::InvalidConfig("overlap".to_string()).is_fatal());
        assert!(Error::MissingCredentials("GOOGLE_API_KEY".to_string()).is_fatal());
        assert!(!Error::RasterError("no bands".to_string()).is_fatal());
        assert!(!Error::NetworkError("reset".to_string()).is_fatal());
    }

    #[test]
    fn test_display_messages() {
        let err = Error::InvalidConfig("overlap (512) must be smaller than tile size (512)".to_string());
        assert_eq!(
            err.to_string(),
            "Invalid configuration: overlap (512) must be smaller than tile size (512)"
        );

        let io = Error::from(std::io::Error::new(std::io::ErrorKind::NotFound, "gone"));
        assert!(io.to_string().starts_with("I/O error:"));
        assert!(std::error::Error::source(&io).is_some());
    }

    #[test]
    fn test_from_serde_json() {
        let parse: std::result::Result<serde_json::Value, _> = serde_json::from_str("{not json");
        let err = Error::from(parse.unwrap_err());
        assert!(matches!(err, Error::SerializationError(_)));
    }
}
