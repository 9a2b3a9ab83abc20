//! Key selection pools
//!
//! A `KeyPool` never stores its keys. Every call asks its `SecretSource` for the
//! current list, which reads through the hot config, so adding or removing a key
//! in the config file takes effect on the next selection. The only pool-owned
//! state is the round-robin cursor, which is clamped back to 0 whenever the list
//! has shrunk beneath it.
//!
//! Because the list and the cursor are read separately, a reconfiguration between
//! two calls can shift which key a cursor value lands on. Selection fairness is
//! best-effort under concurrent edits.

use std::sync::{Mutex, PoisonError};

use common::Secret;
use rand::seq::SliceRandom;
use tracing::{debug, warn};
use vertex_config::Settings;

/// Supplies the current ordered list of secrets for one pool.
pub trait SecretSource: Send + Sync {
    /// Pool name for logs and metrics.
    fn label(&self) -> &'static str;

    /// Current secrets, in configuration order.
    fn secrets(&self) -> Vec<String>;
}

/// Express API keys from `VERTEX_EXPRESS_API_KEY`.
pub struct ExpressKeys {
    settings: Settings,
}

impl ExpressKeys {
    pub fn new(settings: Settings) -> Self {
        Self { settings }
    }
}

impl SecretSource for ExpressKeys {
    fn label(&self) -> &'static str {
        "express"
    }

    fn secrets(&self) -> Vec<String> {
        self.settings.express_api_keys()
    }
}

/// Service-account credentials from `GOOGLE_CREDENTIALS_JSON`.
pub struct ServiceAccounts {
    settings: Settings,
}

impl ServiceAccounts {
    pub fn new(settings: Settings) -> Self {
        Self { settings }
    }
}

impl SecretSource for ServiceAccounts {
    fn label(&self) -> &'static str {
        "service_account"
    }

    fn secrets(&self) -> Vec<String> {
        self.settings.service_account_credentials()
    }
}

/// A selected credential and its position in the configured list.
#[derive(Debug, Clone)]
pub struct SelectedKey {
    pub index: usize,
    pub secret: Secret<String>,
}

/// Selection pool over a `SecretSource`.
pub struct KeyPool<S> {
    source: S,
    settings: Settings,
    cursor: Mutex<usize>,
}

impl KeyPool<ExpressKeys> {
    pub fn express(settings: Settings) -> Self {
        Self::new(ExpressKeys::new(settings.clone()), settings)
    }
}

impl KeyPool<ServiceAccounts> {
    pub fn service_accounts(settings: Settings) -> Self {
        Self::new(ServiceAccounts::new(settings.clone()), settings)
    }
}

impl<S: SecretSource> KeyPool<S> {
    /// `settings` supplies the process-wide `ROUNDROBIN` flag.
    pub fn new(source: S, settings: Settings) -> Self {
        Self {
            source,
            settings,
            cursor: Mutex::new(0),
        }
    }

    pub fn label(&self) -> &'static str {
        self.source.label()
    }

    /// Number of keys configured right now.
    pub fn total_count(&self) -> usize {
        self.source.secrets().len()
    }

    /// Uniformly random key: shuffle an indexed copy and take the head.
    pub fn select_random(&self) -> Option<SelectedKey> {
        let secrets = self.secrets_or_warn()?;
        let mut indexed: Vec<(usize, String)> = secrets.into_iter().enumerate().collect();
        indexed.shuffle(&mut rand::rng());
        let (index, secret) = indexed.swap_remove(0);
        debug!(pool = self.label(), index, "selected key (random)");
        Some(SelectedKey {
            index,
            secret: Secret::new(secret),
        })
    }

    /// Key at the cursor, then advance the cursor by one (wrapping).
    pub fn select_round_robin(&self) -> Option<SelectedKey> {
        let secrets = self.secrets_or_warn()?;
        let len = secrets.len();
        let index = {
            let mut cursor = self.cursor.lock().unwrap_or_else(PoisonError::into_inner);
            if *cursor >= len {
                *cursor = 0;
            }
            let index = *cursor;
            *cursor = (index + 1) % len;
            index
        };
        debug!(pool = self.label(), index, "selected key (round-robin)");
        let secret = secrets.into_iter().nth(index)?;
        Some(SelectedKey {
            index,
            secret: Secret::new(secret),
        })
    }

    /// Round-robin or random, per the `ROUNDROBIN` flag read on this call.
    pub fn select_configured(&self) -> Option<SelectedKey> {
        if self.settings.round_robin() {
            self.select_round_robin()
        } else {
            self.select_random()
        }
    }

    /// Every key with its index, for handlers that retry across the pool.
    pub fn list_all_indexed(&self) -> Vec<SelectedKey> {
        self.source
            .secrets()
            .into_iter()
            .enumerate()
            .map(|(index, secret)| SelectedKey {
                index,
                secret: Secret::new(secret),
            })
            .collect()
    }

    fn secrets_or_warn(&self) -> Option<Vec<String>> {
        let secrets = self.source.secrets();
        if secrets.is_empty() {
            warn!(pool = self.label(), "no keys available for selection");
            return None;
        }
        Some(secrets)
    }
}
