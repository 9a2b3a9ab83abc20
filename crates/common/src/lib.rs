//! Common types shared by the Vertex gateway crates

mod secret;
mod error;

pub use secret::Secret;
pub use error::{Error, Result};
