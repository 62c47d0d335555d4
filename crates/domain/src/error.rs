use std::path::PathBuf;
use std::sync::Arc;

/// Shared error type used across all mcporter crates.
#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("IO: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("unknown server: {0}")]
    UnknownServer(String),

    #[error("server '{0}' is already defined")]
    DuplicateServer(String),

    #[error("config {}: {message}", path.display())]
    ConfigParse { path: PathBuf, message: String },

    #[error("import {}: {message}", path.display())]
    ImportParse { path: PathBuf, message: String },

    #[error("environment variable {0} is not set")]
    MissingEnvVar(String),

    #[error("unauthorized: {0}")]
    Unauthorized(String),

    #[error("OAuth flow cannot be completed on this transport: {0}")]
    OAuthUnsupported(String),

    #[error("auth: {0}")]
    Auth(String),

    #[error("transport: {0}")]
    Transport(String),

    #[error("protocol: {0}")]
    Protocol(String),

    #[error("timed out after {0:?}")]
    Timeout(std::time::Duration),

    /// A connect failure observed through a shared (pooled) future.
    #[error("{0}")]
    Pooled(Arc<Error>),

    #[error("{0}")]
    Other(String),
}

impl Error {
    /// Unwrap [`Error::Pooled`] layers and return the underlying error.
    pub fn root(&self) -> &Error {
        let mut err = self;
        while let Error::Pooled(inner) = err {
            err = inner;
        }
        err
    }
}

pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn root_unwraps_pooled_layers() {
        let inner = Error::MissingEnvVar("API_KEY".into());
        let pooled = Error::Pooled(Arc::new(Error::Pooled(Arc::new(inner))));
        assert!(matches!(pooled.root(), Error::MissingEnvVar(v) if v == "API_KEY"));
    }

    #[test]
    fn root_is_identity_for_plain_errors() {
        let err = Error::UnknownServer("linear".into());
        assert!(matches!(err.root(), Error::UnknownServer(_)));
    }

    #[test]
    fn display_includes_path_for_config_parse() {
        let err = Error::ConfigParse {
            path: PathBuf::from("/tmp/mcporter.json"),
            message: "expected value at line 1".into(),
        };
        let msg = err.to_string();
        assert!(msg.contains("/tmp/mcporter.json"));
        assert!(msg.contains("expected value"));
    }
}
