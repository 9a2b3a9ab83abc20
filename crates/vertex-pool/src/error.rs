//! Error types for pool and location loading

/// Errors from loading failover state.
///
/// Selection itself never fails: an empty pool is an explicit `None`.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("locations file I/O error: {0}")]
    LocationsIo(String),

    #[error("locations file parse error: {0}")]
    LocationsParse(String),
}

/// Result alias for pool operations.
pub type Result<T> = std::result::Result<T, Error>;
