//! Modification-time driven configuration cache
//!
//! Every accessor stats the configuration file and compares its mtime against
//! the one recorded on the live snapshot. Only a strictly newer mtime triggers a
//! re-read. The parsed document is published through an `ArcSwap`, so a reader
//! holds either the old mapping or the new one, never a half-built map.
//!
//! A missing file leaves the cache untouched (defaults apply). A malformed file
//! keeps the previous mapping and records the error on the snapshot, but not
//! the mtime: a file caught half-written is read again on the next call even if
//! the finished write lands within the same mtime tick.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::SystemTime;

use arc_swap::ArcSwap;
use serde_json::{Map, Value};
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

use crate::error::{Error, Result};

/// One parsed configuration document plus the mtime it was observed at.
#[derive(Debug, Clone, Default)]
pub struct ConfigSnapshot {
    values: Arc<Map<String, Value>>,
    modified: Option<SystemTime>,
    last_error: Option<String>,
}

impl ConfigSnapshot {
    pub fn values(&self) -> &Map<String, Value> {
        &self.values
    }

    /// Modification time of the file this snapshot last observed.
    pub fn modified(&self) -> Option<SystemTime> {
        self.modified
    }

    /// Error from the most recent reload attempt, if it failed.
    pub fn last_error(&self) -> Option<&str> {
        self.last_error.as_deref()
    }
}

/// Lazily reloading key/value cache backed by a JSON document on disk.
pub struct ConfigStore {
    path: PathBuf,
    snapshot: ArcSwap<ConfigSnapshot>,
    write_lock: Mutex<()>,
}

impl ConfigStore {
    /// Create a store for `path` and load it if the file exists.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        let store = Self {
            path: path.into(),
            snapshot: ArcSwap::from_pointee(ConfigSnapshot::default()),
            write_lock: Mutex::new(()),
        };
        store.reload_if_needed();
        let snapshot = store.snapshot.load();
        if snapshot.modified.is_none() && snapshot.last_error.is_none() {
            info!(path = %store.path.display(), "config file not found, using defaults");
        }
        store
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Current snapshot, reloading first if the file changed.
    pub fn snapshot(&self) -> Arc<ConfigSnapshot> {
        self.reload_if_needed();
        self.snapshot.load_full()
    }

    /// Raw value for `key`. JSON `null` counts as absent.
    pub fn get(&self, key: &str) -> Option<Value> {
        self.reload_if_needed();
        let snapshot = self.snapshot.load();
        snapshot.values.get(key).filter(|v| !v.is_null()).cloned()
    }

    /// String view of `key`. Non-string scalars are rendered as JSON text.
    pub fn get_string(&self, key: &str, default: &str) -> String {
        match self.get(key) {
            Some(Value::String(s)) => s,
            Some(other) => other.to_string(),
            None => default.to_string(),
        }
    }

    /// Native booleans, or a case-insensitive `"true"` string. Anything else
    /// present is `false`; absent keys yield `default`.
    pub fn get_bool(&self, key: &str, default: bool) -> bool {
        match self.get(key) {
            None => default,
            Some(Value::Bool(b)) => b,
            Some(Value::String(s)) => s.trim().eq_ignore_ascii_case("true"),
            Some(_) => false,
        }
    }

    /// Best-effort integer. Floats truncate toward zero, booleans count as 0/1,
    /// strings are parsed after trimming; everything else yields `default`.
    pub fn get_int(&self, key: &str, default: i64) -> i64 {
        match self.get(key) {
            Some(Value::Number(n)) => n
                .as_i64()
                .or_else(|| n.as_f64().filter(|f| f.is_finite()).map(|f| f.trunc() as i64))
                .unwrap_or(default),
            Some(Value::Bool(b)) => i64::from(b),
            Some(Value::String(s)) => s.trim().parse().unwrap_or(default),
            _ => default,
        }
    }

    /// Best-effort float with the same coercions as [`ConfigStore::get_int`].
    pub fn get_float(&self, key: &str, default: f64) -> f64 {
        match self.get(key) {
            Some(Value::Number(n)) => n.as_f64().unwrap_or(default),
            Some(Value::Bool(b)) => f64::from(u8::from(b)),
            Some(Value::String(s)) => s.trim().parse().unwrap_or(default),
            _ => default,
        }
    }

    /// Read the document straight from disk, bypassing the cache.
    ///
    /// Used by the admin data endpoint to show exactly what is on disk. A
    /// missing or malformed file reads as an empty object.
    pub fn read_document(&self) -> Value {
        match read_object(&self.path) {
            Ok(values) => Value::Object(values),
            Err(e) => {
                debug!(path = %self.path.display(), error = %e, "config document unreadable");
                Value::Object(Map::new())
            }
        }
    }

    /// Replace the whole document on disk and publish it immediately.
    ///
    /// Writes go to a temp file in the same directory followed by a rename, so
    /// a concurrent reload sees either the old file or the new one. Writers are
    /// serialized; readers are never blocked.
    pub async fn write_document(&self, document: Map<String, Value>) -> Result<()> {
        let _guard = self.write_lock.lock().await;
        write_atomic(&self.path, &document).await?;

        let modified = tokio::fs::metadata(&self.path)
            .await
            .and_then(|m| m.modified())
            .map_err(|e| Error::Io(format!("reading config mtime: {e}")))?;

        self.snapshot.store(Arc::new(ConfigSnapshot {
            values: Arc::new(document),
            modified: Some(modified),
            last_error: None,
        }));
        info!(path = %self.path.display(), "configuration document replaced");
        Ok(())
    }

    fn reload_if_needed(&self) {
        let modified = match std::fs::metadata(&self.path).and_then(|m| m.modified()) {
            Ok(modified) => modified,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return,
            Err(e) => {
                warn!(path = %self.path.display(), error = %e, "failed to stat config file");
                return;
            }
        };

        let current = self.snapshot.load();
        if current.modified.is_some_and(|seen| modified <= seen) {
            return;
        }

        let next = match read_object(&self.path) {
            Ok(values) => {
                debug!(path = %self.path.display(), keys = values.len(), "reloaded configuration");
                ConfigSnapshot {
                    values: Arc::new(values),
                    modified: Some(modified),
                    last_error: None,
                }
            }
            Err(e) => {
                let message = e.to_string();
                if current.last_error.as_deref() == Some(message.as_str()) {
                    debug!(path = %self.path.display(), error = %e, "config file still unparseable");
                    return;
                }
                error!(
                    path = %self.path.display(),
                    error = %e,
                    "failed to reload config, keeping previous values"
                );
                ConfigSnapshot {
                    values: Arc::clone(&current.values),
                    modified: current.modified,
                    last_error: Some(message),
                }
            }
        };
        self.snapshot.store(Arc::new(next));
    }
}

fn read_object(path: &Path) -> Result<Map<String, Value>> {
    let contents = std::fs::read_to_string(path)
        .map_err(|e| Error::Io(format!("reading {}: {e}", path.display())))?;
    match serde_json::from_str::<Value>(&contents) {
        Ok(Value::Object(values)) => Ok(values),
        Ok(_) => Err(Error::Parse(
            "configuration document must be a JSON object".into(),
        )),
        Err(e) => Err(Error::Parse(e.to_string())),
    }
}

/// Write the document atomically with four-space indentation.
///
/// The file may hold API keys and service-account material, so it is created
/// with 0600 permissions on unix.
async fn write_atomic(path: &Path, document: &Map<String, Value>) -> Result<()> {
    let mut buf = Vec::new();
    let formatter = serde_json::ser::PrettyFormatter::with_indent(b"    ");
    let mut serializer = serde_json::Serializer::with_formatter(&mut buf, formatter);
    serde::Serialize::serialize(document, &mut serializer)
        .map_err(|e| Error::Serialize(e.to_string()))?;

    let dir = match path.parent() {
        Some(dir) if !dir.as_os_str().is_empty() => dir.to_path_buf(),
        _ => PathBuf::from("."),
    };
    let file_name = path
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or("config.json");
    let tmp_path = dir.join(format!(".{file_name}.tmp.{}", std::process::id()));

    tokio::fs::write(&tmp_path, &buf)
        .await
        .map_err(|e| Error::Io(format!("writing temp config file: {e}")))?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let perms = std::fs::Permissions::from_mode(0o600);
        tokio::fs::set_permissions(&tmp_path, perms)
            .await
            .map_err(|e| Error::Io(format!("setting config file permissions: {e}")))?;
    }

    tokio::fs::rename(&tmp_path, path)
        .await
        .map_err(|e| Error::Io(format!("renaming temp config file: {e}")))?;

    debug!(path = %path.display(), "persisted configuration document");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn set_mtime(path: &Path, at: SystemTime) {
        let file = std::fs::File::options().write(true).open(path).unwrap();
        file.set_modified(at).unwrap();
    }

    fn write_with_mtime(path: &Path, contents: &str, at: SystemTime) {
        std::fs::write(path, contents).unwrap();
        set_mtime(path, at);
    }

    fn an_hour_ago() -> SystemTime {
        SystemTime::now() - Duration::from_secs(3600)
    }

    #[test]
    fn missing_file_yields_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let store = ConfigStore::new(dir.path().join("config.json"));

        assert_eq!(store.get("API_KEY"), None);
        assert_eq!(store.get_string("API_KEY", "123456"), "123456");
        assert!(store.get_bool("ROUNDROBIN", true));
        assert_eq!(store.get_int("MAX_RETRIES_BEFORE_SWITCH", 1), 1);
        assert!(store.snapshot().modified().is_none());
    }

    #[test]
    fn unchanged_mtime_keeps_cached_value() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        let t0 = an_hour_ago();
        write_with_mtime(&path, r#"{"DEFAULT_LOCATION":"us-central1"}"#, t0);

        let store = ConfigStore::new(&path);
        assert_eq!(store.get_string("DEFAULT_LOCATION", ""), "us-central1");

        // New content, same mtime: the cache must not notice.
        write_with_mtime(&path, r#"{"DEFAULT_LOCATION":"europe-west4"}"#, t0);
        assert_eq!(store.get_string("DEFAULT_LOCATION", ""), "us-central1");

        set_mtime(&path, t0 + Duration::from_secs(5));
        assert_eq!(store.get_string("DEFAULT_LOCATION", ""), "europe-west4");
    }

    #[test]
    fn parse_failure_keeps_previous_snapshot_and_records_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        let t0 = an_hour_ago();
        write_with_mtime(&path, r#"{"ROUNDROBIN":true}"#, t0);

        let store = ConfigStore::new(&path);
        assert!(store.get_bool("ROUNDROBIN", false));

        write_with_mtime(&path, "{ not json", t0 + Duration::from_secs(1));
        assert!(store.get_bool("ROUNDROBIN", false));
        let snapshot = store.snapshot();
        assert!(snapshot.last_error().is_some());
        assert_eq!(snapshot.modified(), Some(t0));

        // Fixing the file clears the recorded error.
        write_with_mtime(&path, r#"{"ROUNDROBIN":false}"#, t0 + Duration::from_secs(2));
        assert!(!store.get_bool("ROUNDROBIN", true));
        assert!(store.snapshot().last_error().is_none());
    }

    #[test]
    fn half_written_file_is_reread_within_the_same_mtime() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        let t0 = an_hour_ago();
        write_with_mtime(&path, r#"{"DEFAULT_LOCATION":"us-central1"}"#, t0);
        let store = ConfigStore::new(&path);

        let t1 = t0 + Duration::from_secs(1);
        write_with_mtime(&path, r#"{"DEFAULT_LOCATION":"eur"#, t1);
        assert_eq!(store.get_string("DEFAULT_LOCATION", ""), "us-central1");
        assert!(store.snapshot().last_error().is_some());

        // The writer finishes inside the same mtime tick.
        write_with_mtime(&path, r#"{"DEFAULT_LOCATION":"europe-west4"}"#, t1);
        assert_eq!(store.get_string("DEFAULT_LOCATION", ""), "europe-west4");
        let snapshot = store.snapshot();
        assert!(snapshot.last_error().is_none());
        assert_eq!(snapshot.modified(), Some(t1));
    }

    #[test]
    fn non_object_document_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        write_with_mtime(&path, r#"["us-central1"]"#, an_hour_ago());

        let store = ConfigStore::new(&path);
        assert!(store.snapshot().last_error().is_some());
        assert!(store.snapshot().values().is_empty());
    }

    #[test]
    fn deleting_file_keeps_cache() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        write_with_mtime(&path, r#"{"API_KEY":"s3cret"}"#, an_hour_ago());

        let store = ConfigStore::new(&path);
        assert_eq!(store.get_string("API_KEY", "123456"), "s3cret");

        std::fs::remove_file(&path).unwrap();
        assert_eq!(store.get_string("API_KEY", "123456"), "s3cret");
    }

    #[test]
    fn bool_coercion() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        write_with_mtime(
            &path,
            r#"{"A":true,"B":"TRUE","C":"False","D":1,"E":null,"F":"yes"}"#,
            an_hour_ago(),
        );
        let store = ConfigStore::new(&path);

        assert!(store.get_bool("A", false));
        assert!(store.get_bool("B", false));
        assert!(!store.get_bool("C", true));
        assert!(!store.get_bool("D", true));
        assert!(store.get_bool("E", true), "null behaves like a missing key");
        assert!(!store.get_bool("F", true));
        assert!(store.get_bool("MISSING", true));
    }

    #[test]
    fn numeric_coercion_never_fails() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        write_with_mtime(
            &path,
            r#"{"I":3,"S":" 7 ","F":2.9,"B":true,"BAD":"three","O":{"x":1},"FS":"1.5"}"#,
            an_hour_ago(),
        );
        let store = ConfigStore::new(&path);

        assert_eq!(store.get_int("I", 0), 3);
        assert_eq!(store.get_int("S", 0), 7);
        assert_eq!(store.get_int("F", 0), 2);
        assert_eq!(store.get_int("B", 0), 1);
        assert_eq!(store.get_int("BAD", 9), 9);
        assert_eq!(store.get_int("O", 9), 9);
        assert_eq!(store.get_int("FS", 9), 9);
        assert_eq!(store.get_float("FS", 0.0), 1.5);
        assert_eq!(store.get_float("I", 0.0), 3.0);
        assert_eq!(store.get_float("BAD", 0.25), 0.25);
    }

    #[test]
    fn read_document_bypasses_cache() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        let t0 = an_hour_ago();
        write_with_mtime(&path, r#"{"A":"cached"}"#, t0);
        let store = ConfigStore::new(&path);

        write_with_mtime(&path, r#"{"A":"on-disk"}"#, t0);
        assert_eq!(store.get_string("A", ""), "cached");
        assert_eq!(store.read_document()["A"], "on-disk");

        std::fs::write(&path, "garbage").unwrap();
        assert_eq!(store.read_document(), serde_json::json!({}));
    }

    #[tokio::test]
    async fn write_document_publishes_immediately() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        let store = ConfigStore::new(&path);

        let mut doc = Map::new();
        doc.insert("AUTO_SWITCH_LOCATION".into(), Value::Bool(true));
        store.write_document(doc).await.unwrap();

        assert!(store.get_bool("AUTO_SWITCH_LOCATION", false));
        let on_disk = std::fs::read_to_string(&path).unwrap();
        assert!(on_disk.contains("    \"AUTO_SWITCH_LOCATION\": true"), "{on_disk}");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn written_document_is_owner_only() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        let store = ConfigStore::new(&path);
        store.write_document(Map::new()).await.unwrap();

        let mode = std::fs::metadata(&path).unwrap().permissions().mode() & 0o777;
        assert_eq!(mode, 0o600, "config file must be 0600, got {mode:o}");
    }
}
