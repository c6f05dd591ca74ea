//! The closed error taxonomy of the archive core.
//!
//! Every failure surfaced by this crate is one of the variants below.
//! Extension code (product types, remote backends, hooks) reports through
//! [`Error::Plugin`]; anything a plug-in leaks that is not already a
//! [`Error`] is wrapped into that variant at the registry boundary.

pub type Result<T> = std::result::Result<T, Error>;

#[derive(thiserror::Error, Debug)]
pub enum Error {
    /// Invalid or missing configuration, or an extension that is not
    /// registered under the configured name.
    #[error("configuration error: {0}")]
    Config(String),

    /// Invalid namespace definition or field reference.
    #[error("schema error: {0}")]
    Schema(String),

    /// Lex, parse, type, or parameter failure in the expression language.
    #[error("expression error: {0}")]
    Expression(String),

    /// Unique-constraint violation in the catalogue.
    #[error("conflict: {0}")]
    Conflict(String),

    /// A lookup by UUID, name, or properties yielded nothing.
    #[error("not found: {0}")]
    NotFound(String),

    /// The operation is refused in the product's current state.
    #[error("invalid state: {0}")]
    State(String),

    /// Storage backend I/O failure, hash mismatch, or remote fetch failure.
    #[error("storage error: {message}")]
    Storage {
        message: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// Database-level failure not modelled by any other variant.
    #[error("backend error: {message}")]
    Backend {
        message: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// A plug-in raised, returned incompatible data, or is missing a
    /// mandatory attribute.
    #[error("plug-in error: {0}")]
    Plugin(String),
}

impl Error {
    pub fn storage(message: impl Into<String>) -> Self {
        Error::Storage {
            message: message.into(),
            source: None,
        }
    }

    pub fn storage_with(
        message: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Error::Storage {
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }

    pub fn backend(message: impl Into<String>) -> Self {
        Error::Backend {
            message: message.into(),
            source: None,
        }
    }

    pub fn backend_with(
        message: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Error::Backend {
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Error::Storage {
            message: err.to_string(),
            source: Some(Box::new(err)),
        }
    }
}
