//! Error taxonomy shared by the engine.
//!
//! Conditions that mean "nothing to do" (duplicates, empty loads) are not
//! errors; they surface as empty `Ok` values. Everything else is one of
//! the variants below. Backend failures always keep their cause.

/// Result alias used across the engine.
pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("dataset not found: {0}")]
    DatasetNotFound(String),

    #[error("unsupported file type: {file_type}")]
    UnsupportedFileType { file_type: String },

    #[error("mismatching embedding provider configs: {0}")]
    EmbeddingConfigMismatch(String),

    #[error("invalid filter expression: {0}")]
    InvalidFilter(String),

    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("ingestion flow failed for file {filename:?}: {source}")]
    Flow {
        filename: String,
        #[source]
        source: anyhow::Error,
    },

    #[error("postprocessor {name} failed: {source}")]
    Postprocess {
        name: String,
        #[source]
        source: anyhow::Error,
    },

    #[error("{op}: {source}")]
    Backend {
        op: String,
        #[source]
        source: anyhow::Error,
    },
}

impl Error {
    /// Wrap a storage or provider failure with the operation that hit it.
    pub fn backend(op: impl Into<String>, source: impl Into<anyhow::Error>) -> Self {
        Error::Backend {
            op: op.into(),
            source: source.into(),
        }
    }

    pub fn is_dataset_not_found(&self) -> bool {
        matches!(self, Error::DatasetNotFound(_))
    }
}

/// Attach backend context to any `anyhow`-compatible result.
pub trait BackendContext<T> {
    fn backend<F, S>(self, op: F) -> Result<T>
    where
        F: FnOnce() -> S,
        S: Into<String>;
}

impl<T, E> BackendContext<T> for std::result::Result<T, E>
where
    E: Into<anyhow::Error>,
{
    fn backend<F, S>(self, op: F) -> Result<T>
    where
        F: FnOnce() -> S,
        S: Into<String>,
    {
        self.map_err(|e| Error::backend(op(), e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backend_error_keeps_cause() {
        let res: std::result::Result<(), anyhow::Error> = Err(anyhow::anyhow!("disk full"));
        let err = res.backend(|| "add documents to dataset \"a\"").unwrap_err();
        assert_eq!(
            err.to_string(),
            "add documents to dataset \"a\": disk full"
        );
        let source = std::error::Error::source(&err).expect("source");
        assert_eq!(source.to_string(), "disk full");
    }

    #[test]
    fn unsupported_file_type_names_type() {
        let err = Error::UnsupportedFileType {
            file_type: "application/octet-stream".to_string(),
        };
        assert!(err.to_string().contains("application/octet-stream"));
    }
}
