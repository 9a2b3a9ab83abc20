//! Hot-reloading gateway configuration
//!
//! The configuration document is a flat JSON object on disk. `ConfigStore` keeps
//! the parsed document in memory and re-reads it only when the file's
//! modification time moves forward; every read goes through the store, so edits
//! (by hand or through the admin API) take effect on the next access without a
//! restart.
//!
//! `Settings` layers one typed accessor per recognized key over the store. It
//! never caches values, which is what keeps the key pools and the failover
//! engine hot-reloadable.

pub mod error;
pub mod settings;
pub mod store;

pub use error::{Error, Result};
pub use settings::Settings;
pub use store::{ConfigSnapshot, ConfigStore};
