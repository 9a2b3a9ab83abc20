//! Credential rotation and regional failover for Vertex AI calls
//!
//! Two key pools (express API keys and service-account credentials) share one
//! selection contract: the pool's contents are re-derived from the hot config on
//! every access, and only the round-robin cursor lives in memory. The location
//! manager owns the ordered region list and shifts traffic to the next region
//! after a run of consecutive 429s.
//!
//! Call pattern for a request handler:
//! 1. `LocationManager::current_location` + `KeyPool::select_configured`
//! 2. Perform the upstream call (outside any lock held here)
//! 3. `report_success` / `report_error(status)` exactly once per attempt

pub mod error;
pub mod keys;
pub mod location;
pub mod outcome;

pub use error::{Error, Result};
pub use keys::{ExpressKeys, KeyPool, SecretSource, SelectedKey, ServiceAccounts};
pub use location::{FALLBACK_LOCATION, LocationManager, LocationStatus, RegionSwitch, load_locations};
pub use outcome::{UpstreamOutcome, classify_status};
