//! Bootstrap settings
//!
//! These are read once at startup and cover what cannot change while the
//! process runs: the listen address, where the hot-reloaded JSON document and
//! the region list live, and upstream transport limits. Everything an operator
//! tunes at runtime (keys, strategy, failover) lives in the JSON document.
//!
//! Path precedence: `--config` CLI arg > `GATEWAY_CONFIG` env var > default
//! file name. A missing bootstrap file means all defaults.

use serde::Deserialize;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};

/// Placeholder in `upstream.base_url` replaced by the active region.
pub const LOCATION_PLACEHOLDER: &str = "{location}";

/// Root bootstrap configuration
#[derive(Debug, Default, Deserialize)]
pub struct GatewayConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub paths: PathsConfig,
    #[serde(default)]
    pub upstream: UpstreamConfig,
}

#[derive(Debug, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_listen_addr")]
    pub listen_addr: SocketAddr,
}

/// Locations of the hot config document and the region list
#[derive(Debug, Deserialize)]
pub struct PathsConfig {
    #[serde(default = "default_config_file")]
    pub config_file: PathBuf,
    #[serde(default = "default_locations_file")]
    pub locations_file: PathBuf,
}

/// Upstream transport settings
#[derive(Debug, Clone, Deserialize)]
pub struct UpstreamConfig {
    /// Base URL template; `{location}` is replaced by the active region
    #[serde(default = "default_base_url")]
    pub base_url: String,
    #[serde(default = "default_timeout")]
    pub timeout_secs: u64,
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,
    /// Attempts per request, each with a different key, while upstream answers 429
    #[serde(default = "default_max_attempts")]
    pub max_attempts: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_addr: default_listen_addr(),
        }
    }
}

impl Default for PathsConfig {
    fn default() -> Self {
        Self {
            config_file: default_config_file(),
            locations_file: default_locations_file(),
        }
    }
}

impl Default for UpstreamConfig {
    fn default() -> Self {
        Self {
            base_url: default_base_url(),
            timeout_secs: default_timeout(),
            max_connections: default_max_connections(),
            max_attempts: default_max_attempts(),
        }
    }
}

fn default_listen_addr() -> SocketAddr {
    SocketAddr::from(([0, 0, 0, 0], 8050))
}

fn default_config_file() -> PathBuf {
    PathBuf::from("config.json")
}

fn default_locations_file() -> PathBuf {
    PathBuf::from("locations.json")
}

fn default_base_url() -> String {
    "https://{location}-aiplatform.googleapis.com".to_string()
}

fn default_timeout() -> u64 {
    300
}

fn default_max_connections() -> usize {
    1000
}

fn default_max_attempts() -> usize {
    3
}

impl UpstreamConfig {
    /// Base URL for a region. The `global` region has no regional host
    /// prefix, so `{location}-` collapses away for it.
    pub fn base_url_for(&self, location: &str) -> String {
        let template = self.base_url.trim_end_matches('/');
        if location == vertex_pool::FALLBACK_LOCATION {
            template
                .replace(&format!("{LOCATION_PLACEHOLDER}-"), "")
                .replace(LOCATION_PLACEHOLDER, location)
        } else {
            template.replace(LOCATION_PLACEHOLDER, location)
        }
    }
}

impl GatewayConfig {
    /// Load and validate bootstrap settings from a TOML file.
    pub fn load(path: &Path) -> common::Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let config: GatewayConfig = toml::from_str(&contents)?;
        config.validate()?;
        Ok(config)
    }

    /// Like [`GatewayConfig::load`], but a missing file yields defaults.
    pub fn load_or_default(path: &Path) -> common::Result<Self> {
        if path.exists() {
            Self::load(path)
        } else {
            Ok(Self::default())
        }
    }

    fn validate(&self) -> common::Result<()> {
        let base_url = &self.upstream.base_url;
        if !base_url.starts_with("http://") && !base_url.starts_with("https://") {
            return Err(common::Error::Config(format!(
                "upstream.base_url must start with http:// or https://, got: {base_url}"
            )));
        }
        if self.upstream.timeout_secs == 0 {
            return Err(common::Error::Config(
                "upstream.timeout_secs must be greater than 0".into(),
            ));
        }
        if self.upstream.max_connections == 0 {
            return Err(common::Error::Config(
                "upstream.max_connections must be greater than 0".into(),
            ));
        }
        if self.upstream.max_attempts == 0 {
            return Err(common::Error::Config(
                "upstream.max_attempts must be greater than 0".into(),
            ));
        }
        Ok(())
    }

    /// Resolve the bootstrap file path from CLI arg or GATEWAY_CONFIG env var.
    pub fn resolve_path(cli_path: Option<&str>) -> PathBuf {
        if let Some(p) = cli_path {
            return PathBuf::from(p);
        }
        if let Ok(p) = std::env::var("GATEWAY_CONFIG") {
            return PathBuf::from(p);
        }
        PathBuf::from("vertex-gateway.toml")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    /// Serializes tests that mutate environment variables.
    static ENV_MUTEX: Mutex<()> = Mutex::new(());

    /// SAFETY: Callers must hold ENV_MUTEX to prevent concurrent env mutation.
    unsafe fn set_env(key: &str, val: &str) {
        unsafe { std::env::set_var(key, val) };
    }

    unsafe fn remove_env(key: &str) {
        unsafe { std::env::remove_var(key) };
    }

    fn write_toml(dir: &tempfile::TempDir, contents: &str) -> PathBuf {
        let path = dir.path().join("vertex-gateway.toml");
        std::fs::write(&path, contents).unwrap();
        path
    }

    #[test]
    fn full_file_overrides_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_toml(
            &dir,
            r#"
[server]
listen_addr = "127.0.0.1:9000"

[paths]
config_file = "/etc/vertex/config.json"
locations_file = "/etc/vertex/locations.json"

[upstream]
base_url = "https://{location}-aiplatform.googleapis.com"
timeout_secs = 30
max_connections = 64
max_attempts = 5
"#,
        );

        let config = GatewayConfig::load(&path).unwrap();
        assert_eq!(config.server.listen_addr.port(), 9000);
        assert_eq!(config.paths.config_file, PathBuf::from("/etc/vertex/config.json"));
        assert_eq!(config.upstream.timeout_secs, 30);
        assert_eq!(config.upstream.max_connections, 64);
        assert_eq!(config.upstream.max_attempts, 5);
    }

    #[test]
    fn empty_file_uses_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_toml(&dir, "");

        let config = GatewayConfig::load(&path).unwrap();
        assert_eq!(config.server.listen_addr.port(), 8050);
        assert_eq!(config.paths.config_file, PathBuf::from("config.json"));
        assert_eq!(config.paths.locations_file, PathBuf::from("locations.json"));
        assert_eq!(config.upstream.timeout_secs, 300);
        assert_eq!(config.upstream.max_attempts, 3);
    }

    #[test]
    fn missing_file_is_an_error_for_load_but_not_for_load_or_default() {
        let missing = Path::new("/nonexistent/vertex-gateway.toml");
        assert!(GatewayConfig::load(missing).is_err());
        let config = GatewayConfig::load_or_default(missing).unwrap();
        assert_eq!(config.upstream.max_connections, 1000);
    }

    #[test]
    fn invalid_toml_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_toml(&dir, "[server\nlisten_addr = ");
        assert!(matches!(
            GatewayConfig::load(&path),
            Err(common::Error::Toml(_))
        ));
    }

    #[test]
    fn base_url_without_scheme_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_toml(&dir, "[upstream]\nbase_url = \"aiplatform.googleapis.com\"\n");
        let err = GatewayConfig::load(&path).unwrap_err().to_string();
        assert!(err.contains("base_url must start with http"), "got: {err}");
    }

    #[test]
    fn zero_limits_are_rejected() {
        for field in ["timeout_secs", "max_connections", "max_attempts"] {
            let dir = tempfile::tempdir().unwrap();
            let path = write_toml(&dir, &format!("[upstream]\n{field} = 0\n"));
            let err = GatewayConfig::load(&path).unwrap_err().to_string();
            assert!(err.contains(field), "{field}: got {err}");
        }
    }

    #[test]
    fn base_url_substitutes_region() {
        let upstream = UpstreamConfig::default();
        assert_eq!(
            upstream.base_url_for("us-central1"),
            "https://us-central1-aiplatform.googleapis.com"
        );
        assert_eq!(
            upstream.base_url_for("global"),
            "https://aiplatform.googleapis.com"
        );

        let fixed = UpstreamConfig {
            base_url: "http://127.0.0.1:9999/".into(),
            ..UpstreamConfig::default()
        };
        assert_eq!(fixed.base_url_for("europe-west4"), "http://127.0.0.1:9999");
    }

    #[test]
    fn resolve_path_precedence() {
        let _lock = ENV_MUTEX.lock().unwrap();

        unsafe { set_env("GATEWAY_CONFIG", "/env/gateway.toml") };
        assert_eq!(
            GatewayConfig::resolve_path(Some("/cli/gateway.toml")),
            PathBuf::from("/cli/gateway.toml")
        );
        assert_eq!(
            GatewayConfig::resolve_path(None),
            PathBuf::from("/env/gateway.toml")
        );

        unsafe { remove_env("GATEWAY_CONFIG") };
        assert_eq!(
            GatewayConfig::resolve_path(None),
            PathBuf::from("vertex-gateway.toml")
        );
    }
}
