//! Region failover state machine
//!
//! State is `(current_index, consecutive_429s)` over a fixed, ordered region
//! list. With auto-switch enabled, each 429 bumps the counter; reaching the
//! threshold moves to the next region (wrapping) and zeroes the counter. Only a
//! success resets the counter otherwise. Other error statuses leave it alone,
//! so a run of 429s interleaved with 5xx still counts as consecutive.
//!
//! The admin path may also move `current_index` directly. Both writers go
//! through one mutex that is only held for the in-memory update, never across
//! config reads or upstream calls.

use std::path::Path;
use std::sync::{Mutex, MutexGuard, PoisonError};

use serde::Serialize;
use tracing::{info, warn};
use vertex_config::Settings;

use crate::error::{Error, Result};
use crate::outcome::{UpstreamOutcome, classify_status};

/// Region returned when the list is empty.
pub const FALLBACK_LOCATION: &str = "global";

/// A failover from one region to the next.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegionSwitch {
    pub from: String,
    pub to: String,
}

/// Point-in-time view for the admin and health endpoints.
#[derive(Debug, Clone, Serialize)]
pub struct LocationStatus {
    pub current: String,
    pub index: usize,
    pub consecutive_429s: u32,
    pub threshold: u32,
    pub auto_switch: bool,
    pub locations: Vec<String>,
}

#[derive(Debug, Default)]
struct LocationState {
    current_index: usize,
    consecutive_429s: u32,
}

/// Ordered region list plus the active-region pointer.
pub struct LocationManager {
    locations: Vec<String>,
    state: Mutex<LocationState>,
    settings: Settings,
}

impl LocationManager {
    /// Start on the configured default region, or the first region if the
    /// default is not listed.
    pub fn new(locations: Vec<String>, settings: Settings) -> Self {
        let default_location = settings.default_location();
        let current_index = match locations.iter().position(|l| *l == default_location) {
            Some(index) => index,
            None => {
                warn!(
                    default_location = %default_location,
                    "default location not in location list, using first available"
                );
                0
            }
        };
        let manager = Self {
            locations,
            state: Mutex::new(LocationState {
                current_index,
                consecutive_429s: 0,
            }),
            settings,
        };
        info!(location = %manager.current_location(), "initial location set");
        manager
    }

    /// Load the region list from `path` and build the manager.
    pub fn load(path: &Path, settings: Settings) -> Self {
        let locations = load_locations(path, &settings.default_location());
        Self::new(locations, settings)
    }

    pub fn locations(&self) -> &[String] {
        &self.locations
    }

    pub fn current_location(&self) -> String {
        let index = self.lock().current_index;
        self.location_at(index).to_string()
    }

    /// Record a successful upstream call.
    pub fn report_success(&self) {
        self.lock().consecutive_429s = 0;
    }

    /// Record a failed upstream call by HTTP status.
    ///
    /// Only 429 counts, and only while `AUTO_SWITCH_LOCATION` is on. Returns
    /// the switch when this report triggered one.
    pub fn report_error(&self, status: u16) -> Option<RegionSwitch> {
        if !self.settings.auto_switch_location() || status != 429 {
            return None;
        }
        let threshold = self.threshold();

        let switch = {
            let mut state = self.lock();
            state.consecutive_429s += 1;
            warn!(
                consecutive = state.consecutive_429s,
                threshold, "received 429 from upstream"
            );
            if state.consecutive_429s < threshold {
                return None;
            }
            state.consecutive_429s = 0;
            if self.locations.is_empty() {
                return None;
            }
            let from = self.location_at(state.current_index).to_string();
            state.current_index = (state.current_index + 1) % self.locations.len();
            RegionSwitch {
                from,
                to: self.location_at(state.current_index).to_string(),
            }
        };

        info!(from = %switch.from, to = %switch.to, "switching location after repeated 429s");
        Some(switch)
    }

    /// Report by status: 2xx is a success, everything else an error.
    pub fn report_status(&self, status: u16) -> Option<RegionSwitch> {
        match classify_status(status) {
            UpstreamOutcome::Success => {
                self.report_success();
                None
            }
            UpstreamOutcome::RateLimited | UpstreamOutcome::Failed => self.report_error(status),
        }
    }

    /// Point at `region` directly, bypassing the 429 counter.
    ///
    /// Returns `true` if the pointer moved. Unknown regions are ignored.
    pub fn force_location(&self, region: &str) -> bool {
        let Some(index) = self.locations.iter().position(|l| l == region) else {
            warn!(region, "cannot force location not present in location list");
            return false;
        };
        let moved = {
            let mut state = self.lock();
            let moved = state.current_index != index;
            state.current_index = index;
            moved
        };
        if moved {
            info!(region, "current location set by admin");
        }
        moved
    }

    pub fn status(&self) -> LocationStatus {
        let auto_switch = self.settings.auto_switch_location();
        let threshold = self.threshold();
        let (index, consecutive_429s) = {
            let state = self.lock();
            (state.current_index, state.consecutive_429s)
        };
        LocationStatus {
            current: self.location_at(index).to_string(),
            index,
            consecutive_429s,
            threshold,
            auto_switch,
            locations: self.locations.clone(),
        }
    }

    fn threshold(&self) -> u32 {
        self.settings
            .max_retries_before_switch()
            .clamp(1, i64::from(u32::MAX)) as u32
    }

    fn location_at(&self, index: usize) -> &str {
        self.locations
            .get(index)
            .map(String::as_str)
            .unwrap_or(FALLBACK_LOCATION)
    }

    fn lock(&self) -> MutexGuard<'_, LocationState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Read the ordered region list, falling back to `[default_location]`.
pub fn load_locations(path: &Path, default_location: &str) -> Vec<String> {
    match read_locations(path) {
        Ok(locations) => {
            info!(path = %path.display(), count = locations.len(), "loaded locations");
            locations
        }
        Err(e) => {
            warn!(
                path = %path.display(),
                error = %e,
                default_location,
                "using default location only"
            );
            vec![default_location.to_string()]
        }
    }
}

fn read_locations(path: &Path) -> Result<Vec<String>> {
    let contents = std::fs::read_to_string(path)
        .map_err(|e| Error::LocationsIo(format!("reading {}: {e}", path.display())))?;
    serde_json::from_str(&contents).map_err(|e| Error::LocationsParse(e.to_string()))
}
