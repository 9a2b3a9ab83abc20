//! Error types for configuration document I/O

/// Errors from reading or writing the configuration document.
///
/// Reload failures never reach callers of the typed getters; they are logged
/// and recorded on the snapshot instead. These surface from explicit document
/// writes and from the reload path's internal bookkeeping.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("config file I/O error: {0}")]
    Io(String),

    #[error("config parse error: {0}")]
    Parse(String),

    #[error("config serialize error: {0}")]
    Serialize(String),
}

/// Result alias for configuration operations.
pub type Result<T> = std::result::Result<T, Error>;
