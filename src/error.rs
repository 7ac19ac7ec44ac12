use std::io;
use std::path::PathBuf;

use thiserror::Error;

// Coarse failure classes a caller can branch on
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Input,
    EmptyResult,
    Geometry,
    Io,
}

/// Fatal failures of a curve number run.
///
/// Recoverable data-quality conditions (invalid hydrologic groups, lookup
/// misses, uncoercible codes) are not errors; they travel in
/// [`crate::Diagnostics`].
#[derive(Debug, Error)]
pub enum CnError {
    #[error("no input provided: {0}")]
    MissingInput(String),

    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("invalid lookup configuration: {0}")]
    InvalidLookup(String),

    #[error("file unreadable as geospatial data: {path}: {reason}")]
    Unreadable { path: PathBuf, reason: String },

    #[error("no valid curve numbers produced: {0}")]
    EmptyResult(String),

    #[error("geometry error: {0}")]
    Geometry(String),

    #[error("i/o failure on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("configuration error: {0}")]
    Config(String),
}

impl CnError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            CnError::MissingInput(_)
            | CnError::InvalidInput(_)
            | CnError::InvalidLookup(_)
            | CnError::Unreadable { .. }
            | CnError::Config(_) => ErrorKind::Input,
            CnError::EmptyResult(_) => ErrorKind::EmptyResult,
            CnError::Geometry(_) => ErrorKind::Geometry,
            CnError::Io { .. } => ErrorKind::Io,
        }
    }

    pub(crate) fn io(path: impl Into<PathBuf>, source: io::Error) -> Self {
        CnError::Io {
            path: path.into(),
            source,
        }
    }

    pub(crate) fn unreadable(path: impl Into<PathBuf>, reason: impl ToString) -> Self {
        CnError::Unreadable {
            path: path.into(),
            reason: reason.to_string(),
        }
    }
}

pub type Result<T> = std::result::Result<T, CnError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn messages_carry_user_visible_reason() {
        let err = CnError::EmptyResult("all 3 polygons lack a lookup entry".into());
        assert!(err.to_string().starts_with("no valid curve numbers produced"));
        assert_eq!(err.kind(), ErrorKind::EmptyResult);

        let err = CnError::unreadable("soil.geojson", "not a FeatureCollection");
        assert!(err.to_string().contains("file unreadable as geospatial data"));
        assert_eq!(err.kind(), ErrorKind::Input);
    }

    #[test]
    fn io_errors_keep_their_source() {
        let err = CnError::io(
            "out/cn.tif",
            io::Error::new(io::ErrorKind::PermissionDenied, "denied"),
        );
        assert_eq!(err.kind(), ErrorKind::Io);
        assert!(std::error::Error::source(&err).is_some());
    }
}
