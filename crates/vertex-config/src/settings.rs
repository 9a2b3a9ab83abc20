//! Typed accessors over the hot-reloaded configuration document
//!
//! One method per recognized key. Each call goes back through the
//! `ConfigStore`, so a value changed on disk is visible on the next call.
//! Holders of a `Settings` must not stash the results beyond a single request.

use std::sync::{Arc, Mutex, PoisonError};
use std::time::SystemTime;

use serde_json::Value;
use tracing::warn;

use crate::store::ConfigStore;

pub const API_KEY: &str = "API_KEY";
pub const VERTEX_EXPRESS_API_KEY: &str = "VERTEX_EXPRESS_API_KEY";
pub const GOOGLE_CREDENTIALS_JSON: &str = "GOOGLE_CREDENTIALS_JSON";
pub const CREDENTIALS_DIR: &str = "CREDENTIALS_DIR";
pub const ROUNDROBIN: &str = "ROUNDROBIN";
pub const AUTO_SWITCH_LOCATION: &str = "AUTO_SWITCH_LOCATION";
pub const MAX_RETRIES_BEFORE_SWITCH: &str = "MAX_RETRIES_BEFORE_SWITCH";
pub const DEFAULT_LOCATION: &str = "DEFAULT_LOCATION";
pub const PROXY_URL: &str = "PROXY_URL";

/// Shared secret shipped as the default; operators are warned at startup when
/// it is still in place.
pub const DEFAULT_API_KEY: &str = "123456";
pub const DEFAULT_CREDENTIALS_DIR: &str = "/app/credentials";
pub const DEFAULT_REGION: &str = "asia-southeast1";

/// Cheap-to-clone handle over the process-wide `ConfigStore`.
#[derive(Clone)]
pub struct Settings {
    store: Arc<ConfigStore>,
    /// mtime of the document whose malformed credentials were last reported.
    credentials_reported: Arc<Mutex<Option<SystemTime>>>,
}

impl Settings {
    pub fn new(store: Arc<ConfigStore>) -> Self {
        Self {
            store,
            credentials_reported: Arc::new(Mutex::new(None)),
        }
    }

    pub fn store(&self) -> &Arc<ConfigStore> {
        &self.store
    }

    /// Shared secret for inbound clients and the admin API.
    pub fn api_key(&self) -> String {
        self.store.get_string(API_KEY, DEFAULT_API_KEY)
    }

    /// Express API keys from the comma-separated `VERTEX_EXPRESS_API_KEY`.
    ///
    /// Whitespace around each key is trimmed and blank entries are dropped.
    /// A non-string value yields no keys.
    pub fn express_api_keys(&self) -> Vec<String> {
        match self.store.get(VERTEX_EXPRESS_API_KEY) {
            Some(Value::String(raw)) => raw
                .split(',')
                .map(str::trim)
                .filter(|k| !k.is_empty())
                .map(str::to_owned)
                .collect(),
            _ => Vec::new(),
        }
    }

    /// Service-account credentials from `GOOGLE_CREDENTIALS_JSON`, each as
    /// compact JSON text.
    ///
    /// Accepts an object, an array of objects, or a string holding either (a
    /// string may also hold several objects joined by commas). Entries without
    /// `client_email` and `private_key` strings are skipped, with one warning
    /// per loaded document rather than one per call.
    pub fn service_account_credentials(&self) -> Vec<String> {
        let Some(raw) = self.store.get(GOOGLE_CREDENTIALS_JSON) else {
            return Vec::new();
        };
        let Some(entries) = credential_entries(raw) else {
            if self.first_report_for_document() {
                warn!("{GOOGLE_CREDENTIALS_JSON} is not valid JSON, ignoring");
            }
            return Vec::new();
        };

        let total = entries.len();
        let credentials: Vec<String> = entries
            .into_iter()
            .filter(is_service_account)
            .map(|entry| entry.to_string())
            .collect();
        let skipped = total - credentials.len();
        if skipped > 0 && self.first_report_for_document() {
            warn!(skipped, "skipping malformed service account entries in {GOOGLE_CREDENTIALS_JSON}");
        }
        credentials
    }

    /// True the first time it is asked for the currently loaded document.
    fn first_report_for_document(&self) -> bool {
        let modified = self.store.snapshot().modified();
        let mut reported = self
            .credentials_reported
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if modified.is_some() && *reported == modified {
            return false;
        }
        *reported = modified;
        true
    }

    /// Directory of service-account files, consumed by credential loaders
    /// outside this crate.
    pub fn credentials_dir(&self) -> String {
        self.store.get_string(CREDENTIALS_DIR, DEFAULT_CREDENTIALS_DIR)
    }

    /// Round-robin (`true`) or random (`false`) key selection.
    pub fn round_robin(&self) -> bool {
        self.store.get_bool(ROUNDROBIN, false)
    }

    pub fn auto_switch_location(&self) -> bool {
        self.store.get_bool(AUTO_SWITCH_LOCATION, false)
    }

    /// Consecutive 429s that trigger a region switch.
    pub fn max_retries_before_switch(&self) -> i64 {
        self.store.get_int(MAX_RETRIES_BEFORE_SWITCH, 1)
    }

    pub fn default_location(&self) -> String {
        self.store.get_string(DEFAULT_LOCATION, DEFAULT_REGION)
    }

    /// Outbound HTTP proxy. Falls back to `HTTPS_PROXY`, then `PROXY_URL`
    /// from the environment when the document leaves it empty.
    pub fn proxy_url(&self) -> Option<String> {
        let configured = self.store.get_string(PROXY_URL, "");
        if !configured.trim().is_empty() {
            return Some(configured);
        }
        ["HTTPS_PROXY", "PROXY_URL"]
            .iter()
            .filter_map(|var| std::env::var(var).ok())
            .find(|v| !v.trim().is_empty())
    }
}

/// Candidate entries, or `None` when a string value is not JSON at all.
fn credential_entries(raw: Value) -> Option<Vec<Value>> {
    match raw {
        Value::Object(_) => Some(vec![raw]),
        Value::Array(items) => Some(items),
        Value::String(text) => {
            let text = text.trim();
            if text.is_empty() {
                return Some(Vec::new());
            }
            match serde_json::from_str::<Value>(text) {
                Ok(parsed @ (Value::Object(_) | Value::Array(_))) => credential_entries(parsed),
                _ => match serde_json::from_str::<Value>(&format!("[{text}]")) {
                    Ok(Value::Array(items)) => Some(items),
                    _ => None,
                },
            }
        }
        _ => Some(Vec::new()),
    }
}

fn is_service_account(entry: &Value) -> bool {
    ["client_email", "private_key"]
        .iter()
        .all(|field| entry.get(field).is_some_and(Value::is_string))
}
