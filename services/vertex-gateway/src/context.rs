//! Long-lived service objects shared by every handler

use std::path::PathBuf;
use std::sync::Arc;

use tracing::{error, info, warn};
use vertex_config::settings::DEFAULT_API_KEY;
use vertex_config::{ConfigStore, Settings};
use vertex_pool::{ExpressKeys, KeyPool, LocationManager, ServiceAccounts};

/// Everything built once at startup and handed to handlers through axum `State`.
#[derive(Clone)]
pub struct AppContext {
    pub settings: Settings,
    pub express: Arc<KeyPool<ExpressKeys>>,
    pub service_accounts: Arc<KeyPool<ServiceAccounts>>,
    pub locations: Arc<LocationManager>,
    pub locations_path: PathBuf,
}

impl AppContext {
    /// Wire the hot config, both key pools and the region manager.
    pub fn build(config_file: PathBuf, locations_file: PathBuf) -> Self {
        let store = Arc::new(ConfigStore::new(config_file));
        let settings = Settings::new(store);
        let locations = LocationManager::load(&locations_file, settings.clone());
        Self {
            express: Arc::new(KeyPool::express(settings.clone())),
            service_accounts: Arc::new(KeyPool::service_accounts(settings.clone())),
            locations: Arc::new(locations),
            locations_path: locations_file,
            settings,
        }
    }

    pub fn has_credentials(&self) -> bool {
        self.express.total_count() > 0 || self.service_accounts.total_count() > 0
    }

    /// Conditions an operator should hear about before traffic arrives.
    pub fn startup_warnings(&self) -> Vec<StartupWarning> {
        let mut warnings = Vec::new();
        if let Some(e) = self.settings.store().snapshot().last_error() {
            warnings.push(StartupWarning::ConfigUnparsed(e.to_string()));
        }
        if self.settings.api_key() == DEFAULT_API_KEY {
            warnings.push(StartupWarning::DefaultApiKey);
        }
        if !self.has_credentials() {
            warnings.push(StartupWarning::NoCredentials);
        }
        warnings
    }

    /// Log what the gateway will serve with. Never fails: an empty gateway
    /// still starts so the admin page can be used to fix it.
    pub fn log_startup_diagnostics(&self) -> Vec<StartupWarning> {
        info!(
            config_file = %self.settings.store().path().display(),
            express_keys = self.express.total_count(),
            service_accounts = self.service_accounts.total_count(),
            locations = self.locations.locations().len(),
            current_location = %self.locations.current_location(),
            round_robin = self.settings.round_robin(),
            auto_switch = self.settings.auto_switch_location(),
            "credential pools ready"
        );

        let warnings = self.startup_warnings();
        for warning in &warnings {
            if warning.is_error() {
                error!("{warning}");
            } else {
                warn!("{warning}");
            }
        }
        warnings
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StartupWarning {
    ConfigUnparsed(String),
    DefaultApiKey,
    NoCredentials,
}

impl StartupWarning {
    /// Only an empty gateway is logged at error level.
    pub fn is_error(&self) -> bool {
        matches!(self, StartupWarning::NoCredentials)
    }
}

impl std::fmt::Display for StartupWarning {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StartupWarning::ConfigUnparsed(e) => {
                write!(f, "config file could not be parsed, running on defaults: {e}")
            }
            StartupWarning::DefaultApiKey => write!(
                f,
                "API_KEY is unset or left at its default value; change it before exposing the gateway"
            ),
            StartupWarning::NoCredentials => write!(
                f,
                "no credentials configured: set VERTEX_EXPRESS_API_KEY or GOOGLE_CREDENTIALS_JSON, \
                 every proxied request will fail until then"
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write(dir: &tempfile::TempDir, name: &str, contents: &str) -> PathBuf {
        let path = dir.path().join(name);
        std::fs::write(&path, contents).unwrap();
        path
    }

    #[test]
    fn build_wires_pools_and_locations() {
        let dir = tempfile::tempdir().unwrap();
        let config = write(
            &dir,
            "config.json",
            r#"{"VERTEX_EXPRESS_API_KEY": "k1,k2", "DEFAULT_LOCATION": "europe-west4"}"#,
        );
        let locations = write(&dir, "locations.json", r#"["us-central1", "europe-west4"]"#);

        let ctx = AppContext::build(config, locations.clone());
        assert_eq!(ctx.express.total_count(), 2);
        assert_eq!(ctx.service_accounts.total_count(), 0);
        assert_eq!(ctx.locations.current_location(), "europe-west4");
        assert_eq!(ctx.locations_path, locations);
        assert!(ctx.has_credentials());
    }

    #[test]
    fn missing_files_build_an_empty_gateway() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = AppContext::build(
            dir.path().join("config.json"),
            dir.path().join("locations.json"),
        );
        assert!(!ctx.has_credentials());
        assert_eq!(
            ctx.locations.current_location(),
            vertex_config::settings::DEFAULT_REGION
        );

        let warnings = ctx.log_startup_diagnostics();
        assert_eq!(
            warnings,
            vec![StartupWarning::DefaultApiKey, StartupWarning::NoCredentials]
        );
        let errors: Vec<_> = warnings.iter().filter(|w| w.is_error()).collect();
        assert_eq!(errors, vec![&StartupWarning::NoCredentials]);
    }

    #[test]
    fn configured_gateway_starts_quietly() {
        let dir = tempfile::tempdir().unwrap();
        let config = write(
            &dir,
            "config.json",
            r#"{"API_KEY": "s3cret", "VERTEX_EXPRESS_API_KEY": "k1"}"#,
        );
        let ctx = AppContext::build(config, dir.path().join("locations.json"));
        assert!(ctx.log_startup_diagnostics().is_empty());
    }

    #[test]
    fn unparseable_config_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let config = write(&dir, "config.json", "{ not json");
        let ctx = AppContext::build(config, dir.path().join("locations.json"));

        let warnings = ctx.startup_warnings();
        assert!(matches!(warnings[0], StartupWarning::ConfigUnparsed(_)));
        assert!(warnings.contains(&StartupWarning::NoCredentials));
        assert!(warnings[0].to_string().starts_with("config file could not be parsed"));
    }
}
