//! Bootstrap error types

use thiserror::Error;

/// Errors raised while loading the gateway's bootstrap settings
#[derive(Error, Debug)]
pub enum Error {
    #[error("Gateway config error: {0}")]
    Config(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("TOML parse error: {0}")]
    Toml(#[from] toml::de::Error),
}

/// Result alias using common Error
pub type Result<T> = std::result::Result<T, Error>;
