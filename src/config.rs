//! Configuration for the transcript pipeline.
//!
//! Configuration sources (highest priority first):
//! 1. Environment variables (SCRIBEFLOW_HOME, ENCRYPTION_KEYS, ...)
//! 2. Config file (.scribeflow/config.yaml)
//! 3. Defaults (~/.scribeflow)
//!
//! Config file discovery:
//! - Searches current directory and parents for .scribeflow/config.yaml
//! - Paths in config file are relative to the .scribeflow/ directory

use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::OnceLock;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::adapters::{ClinicalDocumentSettings, GrantType, LegacyRestSettings};
use crate::core::{BreakerConfig, IdempotencySettings, ReprocessorSettings, RetryPolicy};
use crate::crypto::{parse_key_list, EncryptionSettings, KeyError, KeyPolicy, KeySource};
use crate::ingest::dead_letter_queue;

/// Global cached settings (stores Result to handle init errors)
static SETTINGS: OnceLock<Result<Settings, String>> = OnceLock::new();

/// Raw config file schema (matches YAML structure)
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ConfigFile {
    #[serde(default)]
    pub version: Option<String>,
    #[serde(default)]
    pub environment: Option<String>,
    #[serde(default)]
    pub paths: PathsConfig,
    #[serde(default)]
    pub queue: QueueConfig,
    #[serde(default)]
    pub idempotency: IdempotencySettings,
    #[serde(default)]
    pub breakers: BreakersConfig,
    #[serde(default)]
    pub retry: RetryConfig,
    #[serde(default)]
    pub reprocessor: ReprocessorSettings,
    #[serde(default)]
    pub encryption: EncryptionSettings,
    #[serde(default)]
    pub clinical: ClinicalDocumentSettings,
    #[serde(default)]
    pub legacy: LegacyRestSettings,
    #[serde(default)]
    pub retention_days: u32,
    #[serde(default)]
    pub drain_wait_seconds: Option<u64>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct PathsConfig {
    /// State directory (relative to .scribeflow/)
    pub home: Option<String>,
    /// SQLite database file (relative to .scribeflow/)
    pub database: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct QueueConfig {
    #[serde(default = "default_queue_name")]
    pub name: String,
    #[serde(default = "default_depth_poll")]
    pub depth_poll_secs: u64,
}

fn default_queue_name() -> String {
    "transcriptions".to_string()
}
fn default_depth_poll() -> u64 {
    15
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            name: default_queue_name(),
            depth_poll_secs: default_depth_poll(),
        }
    }
}

/// One breaker per hop; they never share state
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BreakersConfig {
    #[serde(default)]
    pub publish: BreakerConfig,
    #[serde(default)]
    pub clinical: BreakerConfig,
    #[serde(default)]
    pub legacy: BreakerConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    #[serde(default = "RetryPolicy::publish")]
    pub publish: RetryPolicy,
    #[serde(default = "RetryPolicy::delivery")]
    pub delivery: RetryPolicy,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            publish: RetryPolicy::publish(),
            delivery: RetryPolicy::delivery(),
        }
    }
}

/// Resolved settings with absolute paths and env overrides applied
#[derive(Debug, Clone, Serialize)]
pub struct Settings {
    pub environment: String,
    /// State directory (queues live under it)
    pub home: PathBuf,
    pub database: PathBuf,
    pub queue: String,
    pub queue_depth_poll_secs: u64,
    pub idempotency: IdempotencySettings,
    pub breakers: BreakersConfig,
    pub retry: RetryConfig,
    pub reprocessor: ReprocessorSettings,
    #[serde(skip)]
    pub encryption: EncryptionSettings,
    pub key_policy: KeyPolicy,
    #[serde(skip)]
    pub clinical: ClinicalDocumentSettings,
    #[serde(skip)]
    pub legacy: LegacyRestSettings,
    /// 0 disables the purge job
    pub retention_days: u32,
    pub drain_wait_seconds: u64,
    /// Path to config file (if found)
    pub config_file: Option<PathBuf>,
}

impl Settings {
    pub fn dead_letter_queue(&self) -> String {
        dead_letter_queue(&self.queue)
    }

    pub fn queues_dir(&self) -> PathBuf {
        self.home.join("queues")
    }

    pub fn is_production(&self) -> bool {
        self.environment == "prod"
    }
}

/// Find config file by searching current directory and parents
fn find_config_file() -> Option<PathBuf> {
    let mut current = std::env::current_dir().ok()?;

    loop {
        let config_path = current.join(".scribeflow").join("config.yaml");
        if config_path.exists() {
            return Some(config_path);
        }

        if !current.pop() {
            break;
        }
    }

    None
}

/// Load and parse config file
fn load_config_file(path: &Path) -> Result<ConfigFile> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    serde_yaml::from_str(&content)
        .with_context(|| format!("Failed to parse config file: {}", path.display()))
}

/// Resolve a path that may be relative to the config directory
fn resolve_path(base: &Path, path_str: &str) -> PathBuf {
    let path = PathBuf::from(path_str);
    if path.is_absolute() {
        path
    } else {
        base.join(path)
            .canonicalize()
            .unwrap_or_else(|_| base.join(path_str))
    }
}

fn parse_bool(raw: &str) -> Option<bool> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

/// Read and parse one environment override
fn env_value<T>(env: &dyn Fn(&str) -> Option<String>, name: &str) -> Result<Option<T>>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match env(name) {
        Some(raw) if !raw.trim().is_empty() => raw
            .trim()
            .parse::<T>()
            .map(Some)
            .map_err(|e| anyhow::anyhow!("Invalid value for {}: {}", name, e)),
        _ => Ok(None),
    }
}

fn env_bool(env: &dyn Fn(&str) -> Option<String>, name: &str) -> Result<Option<bool>> {
    match env(name) {
        Some(raw) if !raw.trim().is_empty() => parse_bool(&raw)
            .map(Some)
            .with_context(|| format!("Invalid boolean for {}: {}", name, raw)),
        _ => Ok(None),
    }
}

fn env_string(env: &dyn Fn(&str) -> Option<String>, name: &str) -> Option<String> {
    env(name).filter(|v| !v.trim().is_empty())
}

/// Apply environment overrides on top of the file values
fn apply_env(file: &mut ConfigFile, env: &dyn Fn(&str) -> Option<String>) -> Result<()> {
    if let Some(name) = env_string(env, "ENV").or_else(|| env_string(env, "ENVIRONMENT_NAME")) {
        file.environment = Some(name);
    }
    if let Some(queue) = env_string(env, "TRANSCRIPTION_QUEUE") {
        file.queue.name = queue;
    }
    if let Some(secs) = env_value(env, "QUEUE_DEPTH_POLL_INTERVAL")? {
        file.queue.depth_poll_secs = secs;
    }

    let idem = &mut file.idempotency;
    if let Some(v) = env_bool(env, "ENABLE_IDEMPOTENCY")? {
        idem.enabled = v;
    }
    if let Some(v) = env_bool(env, "ENABLE_FAST_PATH_IDEMPOTENCY")? {
        idem.fast_path_enabled = v;
    }
    if let Some(v) = env_value(env, "IDEMPOTENCY_CACHE_SIZE")? {
        idem.cache_size = v;
    }
    if let Some(v) = env_value(env, "IDEMPOTENCY_TTL_SECONDS")? {
        idem.fast_path_ttl_seconds = v;
    }
    if let Some(v) = env_bool(env, "USE_BLOOM_IDEMPOTENCY")? {
        idem.bloom_enabled = v;
    }
    if let Some(v) = env_value(env, "BLOOM_ERROR_RATE")? {
        idem.bloom_error_rate = v;
    }
    if let Some(v) = env_value(env, "BLOOM_CAPACITY")? {
        idem.bloom_capacity = v;
    }
    if let Some(v) = env_bool(env, "ENABLE_DB_IDEMPOTENCY")? {
        idem.db_enabled = v;
    }
    if let Some(v) = env_value(env, "IDEMPOTENCY_DB_TTL_SECONDS")? {
        idem.db_ttl_seconds = v;
    }

    if let Some(v) = env_value(env, "MAX_REPROCESS_ATTEMPTS")? {
        file.reprocessor.max_attempts = v;
    }
    if let Some(v) = env_value(env, "BACKOFF_BASE_SECONDS")? {
        file.reprocessor.backoff_base_seconds = v;
    }

    let enc = &mut file.encryption;
    if let Some(v) = env_bool(env, "ENABLE_FIELD_ENCRYPTION")? {
        enc.enabled = v;
    }
    if let Some(raw) = env_string(env, "ENCRYPTION_KEYS") {
        enc.keys.clear();
        for (kid, key) in parse_key_list(&raw) {
            if enc.keys.contains_key(&kid) {
                warn!(kid = %kid, "duplicate encryption key id; keeping the first");
                continue;
            }
            enc.keys.insert(kid, key);
        }
    }
    if let Some(kid) = env_string(env, "PRIMARY_ENCRYPTION_KEY_ID") {
        enc.primary_key_id = Some(kid);
    }
    if let Some(v) = env_value(env, "ENCRYPTION_ROTATE_HOURS")? {
        enc.rotate_hours = v;
    }

    let clinical = &mut file.clinical;
    if let Some(v) = env_string(env, "CLINICAL_FHIR_BASE_URL") {
        clinical.base_url = Some(v);
    }
    if let Some(v) = env_string(env, "CLINICAL_SITE") {
        clinical.site = v;
    }
    if let Some(v) = env_string(env, "CLINICAL_FHIR_CLIENT_ID") {
        clinical.client_id = Some(v);
    }
    if let Some(v) = env_string(env, "CLINICAL_FHIR_CLIENT_SECRET") {
        clinical.client_secret = Some(v);
    }
    if let Some(v) = env_string(env, "CLINICAL_FHIR_USERNAME") {
        clinical.username = Some(v);
    }
    if let Some(v) = env_string(env, "CLINICAL_FHIR_PASSWORD") {
        clinical.password = Some(v);
    }
    if let Some(v) = env_string(env, "CLINICAL_FHIR_SCOPES") {
        clinical.scopes = Some(v);
    }
    if let Some(v) = env_string(env, "CLINICAL_FHIR_GRANT_TYPE") {
        clinical.grant_type = match v.trim() {
            "password" => GrantType::Password,
            "client_credentials" => GrantType::ClientCredentials,
            other => anyhow::bail!("Invalid value for CLINICAL_FHIR_GRANT_TYPE: {}", other),
        };
    }

    if let Some(v) = env_string(env, "LEGACY_API_URL") {
        file.legacy.api_url = Some(v);
    }
    if let Some(v) = env_string(env, "LEGACY_API_KEY") {
        file.legacy.api_key = Some(v);
    }
    if let Some(v) = env_string(env, "LEGACY_API_USER") {
        file.legacy.user = v;
    }

    if let Some(v) = env_value(env, "RETENTION_DAYS")? {
        file.retention_days = v;
    }
    if let Some(v) = env_value(env, "DRAIN_WAIT_SECONDS")? {
        file.drain_wait_seconds = Some(v);
    }
    Ok(())
}

/// Resolve settings from an optional config file and an env lookup
fn resolve(config_file: Option<PathBuf>, env: &dyn Fn(&str) -> Option<String>) -> Result<Settings> {
    let default_home = dirs::home_dir()
        .context("Failed to determine home directory")?
        .join(".scribeflow");

    let mut file = match config_file {
        Some(ref path) => load_config_file(path)?,
        None => ConfigFile::default(),
    };
    apply_env(&mut file, env)?;

    // Paths in the file are relative to .scribeflow/
    let config_dir = config_file
        .as_ref()
        .and_then(|p| p.parent())
        .map(Path::to_path_buf);

    let home = if let Some(env_home) = env_string(env, "SCRIBEFLOW_HOME") {
        PathBuf::from(env_home)
    } else if let (Some(dir), Some(home)) = (&config_dir, &file.paths.home) {
        resolve_path(dir, home)
    } else {
        default_home
    };

    let database = if let Some(env_db) = env_string(env, "SCRIBEFLOW_DATABASE") {
        PathBuf::from(env_db)
    } else if let (Some(dir), Some(db)) = (&config_dir, &file.paths.database) {
        resolve_path(dir, db)
    } else {
        home.join("transcripts.db")
    };

    let environment = file.environment.unwrap_or_else(|| "dev".to_string());
    let key_policy = if environment == "prod" {
        KeyPolicy::Strict
    } else {
        KeyPolicy::Permissive
    };

    Ok(Settings {
        environment,
        home,
        database,
        queue: file.queue.name,
        queue_depth_poll_secs: file.queue.depth_poll_secs,
        idempotency: file.idempotency,
        breakers: file.breakers,
        retry: file.retry,
        reprocessor: file.reprocessor,
        encryption: file.encryption,
        key_policy,
        clinical: file.clinical,
        legacy: file.legacy,
        retention_days: file.retention_days,
        drain_wait_seconds: file.drain_wait_seconds.unwrap_or(60),
        config_file,
    })
}

/// Load settings from all sources
fn load_settings() -> Result<Settings> {
    resolve(find_config_file(), &|name| std::env::var(name).ok())
}

/// Get the global settings (loads once, then cached)
pub fn settings() -> Result<&'static Settings> {
    let result = SETTINGS.get_or_init(|| load_settings().map_err(|e| format!("{:#}", e)));

    match result {
        Ok(settings) => Ok(settings),
        Err(e) => anyhow::bail!("{}", e),
    }
}

/// Re-read every source, bypassing the cache (key reload, tests)
pub fn reload_settings() -> Result<Settings> {
    load_settings()
}

/// Key source that re-reads the config file and environment on every load
#[derive(Debug, Default, Clone, Copy)]
pub struct SettingsKeySource;

impl KeySource for SettingsKeySource {
    fn load(&self) -> Result<EncryptionSettings, KeyError> {
        reload_settings()
            .map(|s| s.encryption)
            .map_err(|e| KeyError::Source(format!("{:#}", e)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::io::Write;
    use tempfile::TempDir;

    fn env_from(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |name| map.get(name).cloned()
    }

    fn write_config(temp: &TempDir, body: &str) -> PathBuf {
        let dir = temp.path().join(".scribeflow");
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("config.yaml");
        let mut file = std::fs::File::create(&path).unwrap();
        writeln!(file, "{}", body).unwrap();
        path
    }

    #[test]
    fn test_defaults_without_file() {
        let settings = resolve(None, &env_from(&[])).unwrap();

        let expected_home = dirs::home_dir().unwrap().join(".scribeflow");
        assert_eq!(settings.home, expected_home);
        assert_eq!(settings.database, expected_home.join("transcripts.db"));
        assert_eq!(settings.queue, "transcriptions");
        assert_eq!(settings.dead_letter_queue(), "transcriptions_dlq");
        assert_eq!(settings.queue_depth_poll_secs, 15);
        assert_eq!(settings.key_policy, KeyPolicy::Permissive);
        assert_eq!(settings.breakers.publish.failure_threshold, 5);
        assert_eq!(settings.retry.publish.max_attempts, 3);
        assert_eq!(settings.reprocessor.max_attempts, 5);
        assert!(settings.idempotency.enabled);
        assert_eq!(settings.legacy.user, "guest");
        assert_eq!(settings.clinical.site, "default");
        assert_eq!(settings.encryption.rotation_batch_size, 500);
        assert!(settings.config_file.is_none());
    }

    #[test]
    fn test_config_file_parsing() {
        let temp = TempDir::new().unwrap();
        let path = write_config(
            &temp,
            r#"
version: "1.0"
environment: staging
paths:
  home: ./state
queue:
  name: notes
breakers:
  clinical:
    failure_threshold: 2
    reset_seconds: 5
idempotency:
  db_enabled: true
encryption:
  enabled: true
  primary_key_id: k1
  keys:
    k1: AAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAA=
retention_days: 30
"#,
        );

        let settings = resolve(Some(path.clone()), &env_from(&[])).unwrap();
        assert_eq!(settings.environment, "staging");
        assert_eq!(settings.home, path.parent().unwrap().join("state"));
        assert_eq!(settings.database, settings.home.join("transcripts.db"));
        assert_eq!(settings.queue, "notes");
        assert_eq!(settings.breakers.clinical.failure_threshold, 2);
        assert_eq!(settings.breakers.legacy.failure_threshold, 5);
        assert!(settings.idempotency.db_enabled);
        assert_eq!(settings.encryption.primary_key_id.as_deref(), Some("k1"));
        assert_eq!(settings.retention_days, 30);
        assert_eq!(settings.config_file, Some(path));
    }

    #[test]
    fn test_env_overrides_file() {
        let temp = TempDir::new().unwrap();
        let path = write_config(&temp, "queue:\n  name: notes\nretention_days: 30\n");

        let env = env_from(&[
            ("TRANSCRIPTION_QUEUE", "dictations"),
            ("RETENTION_DAYS", "7"),
            ("ENV", "prod"),
            ("SCRIBEFLOW_HOME", "/srv/scribeflow"),
            ("ENABLE_IDEMPOTENCY", "false"),
            ("MAX_REPROCESS_ATTEMPTS", "2"),
        ]);
        let settings = resolve(Some(path), &env).unwrap();

        assert_eq!(settings.queue, "dictations");
        assert_eq!(settings.retention_days, 7);
        assert_eq!(settings.key_policy, KeyPolicy::Strict);
        assert!(settings.is_production());
        assert_eq!(settings.home, PathBuf::from("/srv/scribeflow"));
        assert_eq!(settings.queues_dir(), PathBuf::from("/srv/scribeflow/queues"));
        assert!(!settings.idempotency.enabled);
        assert_eq!(settings.reprocessor.max_attempts, 2);
    }

    #[test]
    fn test_encryption_keys_from_env_keep_first_duplicate() {
        let env = env_from(&[
            ("ENABLE_FIELD_ENCRYPTION", "1"),
            ("ENCRYPTION_KEYS", "k1:first, k2:second, k1:third"),
            ("PRIMARY_ENCRYPTION_KEY_ID", "k2"),
        ]);
        let settings = resolve(None, &env).unwrap();

        assert!(settings.encryption.enabled);
        assert_eq!(settings.encryption.keys.len(), 2);
        assert_eq!(settings.encryption.keys["k1"], "first");
        assert_eq!(settings.encryption.primary_key_id.as_deref(), Some("k2"));
    }

    #[test]
    fn test_invalid_env_value_is_an_error() {
        let err = resolve(None, &env_from(&[("RETENTION_DAYS", "soon")])).unwrap_err();
        assert!(err.to_string().contains("RETENTION_DAYS"));

        let err = resolve(None, &env_from(&[("ENABLE_IDEMPOTENCY", "maybe")])).unwrap_err();
        assert!(err.to_string().contains("ENABLE_IDEMPOTENCY"));
    }

    #[test]
    fn test_resolve_relative_path() {
        let base = PathBuf::from("/home/user/project/.scribeflow");

        assert_eq!(
            resolve_path(&base, "./state"),
            PathBuf::from("/home/user/project/.scribeflow/state")
        );
        assert_eq!(
            resolve_path(&base, "/absolute/path"),
            PathBuf::from("/absolute/path")
        );
    }
}
