//! Export configuration.
//!
//! Loaded once from a TOML file at startup, validated, and then shared
//! read-only (`Arc<ExportConfig>` or `&ExportConfig`) for the whole run.

use anyhow::{anyhow, bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

use crate::sources::SourceKind;

/// Main configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ExportConfig {
    pub firebase: FirebaseConfig,
    #[serde(default)]
    pub export: ExportOptions,
    #[serde(default)]
    pub limits: LimitsConfig,
    #[serde(default)]
    pub retry: RetryConfig,
    #[serde(default)]
    pub observability: ObservabilityConfig,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct FirebaseConfig {
    pub project_id: String,
    /// Bucket name; the storage source is skipped when absent
    #[serde(default)]
    pub storage_bucket: Option<String>,
    /// Database URL; the realtime database source is skipped when absent
    #[serde(default)]
    pub realtime_db_url: Option<String>,
    /// Environment variable holding an already-issued OAuth access token
    #[serde(default = "default_access_token_env")]
    pub access_token_env: String,
    #[serde(default = "default_firestore_database")]
    pub firestore_database: String,
    #[serde(default)]
    pub endpoints: EndpointsConfig,
}

fn default_access_token_env() -> String {
    "FIRESAFE_ACCESS_TOKEN".to_string()
}

fn default_firestore_database() -> String {
    "(default)".to_string()
}

/// Base URLs of the platform REST APIs. Overridable for emulators and tests.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct EndpointsConfig {
    #[serde(default = "default_firestore_url")]
    pub firestore: String,
    #[serde(default = "default_identity_toolkit_url")]
    pub identity_toolkit: String,
    #[serde(default = "default_storage_url")]
    pub storage: String,
}

fn default_firestore_url() -> String {
    "https://firestore.googleapis.com".to_string()
}

fn default_identity_toolkit_url() -> String {
    "https://identitytoolkit.googleapis.com".to_string()
}

fn default_storage_url() -> String {
    "https://storage.googleapis.com".to_string()
}

impl Default for EndpointsConfig {
    fn default() -> Self {
        Self {
            firestore: default_firestore_url(),
            identity_toolkit: default_identity_toolkit_url(),
            storage: default_storage_url(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ExportOptions {
    #[serde(default = "default_output_dir")]
    pub output_dir: PathBuf,
    #[serde(default)]
    pub sources: SourcesConfig,
    #[serde(default = "default_true")]
    pub include_subcollections: bool,
    #[serde(default)]
    pub include_storage_files: bool,
    #[serde(default = "default_max_storage_file_size_mb")]
    pub max_storage_file_size_mb: u64,
    #[serde(default = "default_large_batch")]
    pub firestore_batch_size: usize,
    #[serde(default = "default_large_batch")]
    pub auth_batch_size: usize,
    #[serde(default = "default_small_batch")]
    pub storage_batch_size: usize,
    #[serde(default = "default_small_batch")]
    pub realtime_db_batch_size: usize,
    #[serde(default = "default_storage_concurrent_files")]
    pub storage_concurrent_files: usize,
    #[serde(default = "default_max_concurrent_sources")]
    pub max_concurrent_sources: usize,
}

fn default_output_dir() -> PathBuf {
    PathBuf::from("firebase-export")
}

fn default_true() -> bool {
    true
}

fn default_max_storage_file_size_mb() -> u64 {
    100
}

fn default_large_batch() -> usize {
    1000
}

fn default_small_batch() -> usize {
    100
}

fn default_storage_concurrent_files() -> usize {
    50
}

fn default_max_concurrent_sources() -> usize {
    1
}

impl Default for ExportOptions {
    fn default() -> Self {
        Self {
            output_dir: default_output_dir(),
            sources: SourcesConfig::default(),
            include_subcollections: true,
            include_storage_files: false,
            max_storage_file_size_mb: default_max_storage_file_size_mb(),
            firestore_batch_size: default_large_batch(),
            auth_batch_size: default_large_batch(),
            storage_batch_size: default_small_batch(),
            realtime_db_batch_size: default_small_batch(),
            storage_concurrent_files: default_storage_concurrent_files(),
            max_concurrent_sources: default_max_concurrent_sources(),
        }
    }
}

/// Per-source inclusion flags
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct SourcesConfig {
    #[serde(default = "default_true")]
    pub firestore: bool,
    #[serde(default = "default_true")]
    pub auth: bool,
    #[serde(default = "default_true")]
    pub storage: bool,
    #[serde(default = "default_true")]
    pub realtime_db: bool,
}

impl Default for SourcesConfig {
    fn default() -> Self {
        Self {
            firestore: true,
            auth: true,
            storage: true,
            realtime_db: true,
        }
    }
}

/// Read ceilings enforced by the safety limiter. `None` means unlimited.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct LimitsConfig {
    #[serde(default = "default_read_ceiling")]
    pub max_firestore_reads: Option<u64>,
    #[serde(default = "default_read_ceiling")]
    pub max_auth_exports: Option<u64>,
    #[serde(default)]
    pub max_storage_objects: Option<u64>,
    #[serde(default)]
    pub max_realtime_db_reads: Option<u64>,
}

fn default_read_ceiling() -> Option<u64> {
    Some(50_000)
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            max_firestore_reads: default_read_ceiling(),
            max_auth_exports: default_read_ceiling(),
            max_storage_objects: None,
            max_realtime_db_reads: None,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RetryConfig {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
}

fn default_max_attempts() -> u32 {
    5
}

fn default_base_delay_ms() -> u64 {
    200
}

fn default_max_delay_ms() -> u64 {
    10_000
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            base_delay_ms: default_base_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
        }
    }
}

/// Observability configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ObservabilityConfig {
    /// Log format: "pretty" (default) or "json"
    /// Override with LOG_FORMAT env var
    #[serde(default = "default_log_format")]
    pub log_format: String,

    /// Log level filter string
    /// Override with RUST_LOG env var
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Render per-source progress bars on stderr
    #[serde(default = "default_true")]
    pub show_progress: bool,
}

fn default_log_format() -> String {
    "pretty".to_string()
}

fn default_log_level() -> String {
    "info,firesafe=debug".to_string()
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_format: default_log_format(),
            log_level: default_log_level(),
            show_progress: true,
        }
    }
}

/// Expand ~ to home directory in path
pub fn expand_tilde(path: &Path) -> Result<PathBuf> {
    let s = path.to_string_lossy();
    if let Some(rest) = s.strip_prefix("~/") {
        let home = dirs::home_dir().ok_or_else(|| anyhow!("Cannot determine home directory"))?;
        Ok(home.join(rest))
    } else if s == "~" {
        dirs::home_dir().ok_or_else(|| anyhow!("Cannot determine home directory"))
    } else {
        Ok(path.to_path_buf())
    }
}

impl ExportConfig {
    /// Minimal configuration for a project, every other key at its default.
    pub fn for_project(project_id: impl Into<String>) -> Self {
        Self {
            firebase: FirebaseConfig {
                project_id: project_id.into(),
                storage_bucket: None,
                realtime_db_url: None,
                access_token_env: default_access_token_env(),
                firestore_database: default_firestore_database(),
                endpoints: EndpointsConfig::default(),
            },
            export: ExportOptions::default(),
            limits: LimitsConfig::default(),
            retry: RetryConfig::default(),
            observability: ObservabilityConfig::default(),
        }
    }

    /// Load, expand and validate a config file.
    pub fn load(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        Self::from_toml_str(&content)
            .with_context(|| format!("Invalid config file {}", path.display()))
    }

    pub fn from_toml_str(content: &str) -> Result<Self> {
        let mut config: ExportConfig = toml::from_str(content)?;
        config.expand_paths()?;
        config.validate()?;
        Ok(config)
    }

    fn expand_paths(&mut self) -> Result<()> {
        self.export.output_dir = expand_tilde(&self.export.output_dir)?;
        Ok(())
    }

    /// Reject values the engine cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.firebase.project_id.trim().is_empty() {
            bail!("firebase.project_id must not be empty");
        }
        for kind in SourceKind::ALL {
            if self.batch_size(kind) == 0 {
                bail!("batch size for '{}' must be at least 1", kind);
            }
        }
        if self.export.storage_concurrent_files == 0 {
            bail!("export.storage_concurrent_files must be at least 1");
        }
        if self.export.max_concurrent_sources == 0 {
            bail!("export.max_concurrent_sources must be at least 1");
        }
        if self.retry.max_attempts == 0 {
            bail!("retry.max_attempts must be at least 1");
        }
        if self.retry.base_delay_ms > self.retry.max_delay_ms {
            bail!("retry.base_delay_ms must not exceed retry.max_delay_ms");
        }
        if let Some(url) = &self.firebase.realtime_db_url {
            url::Url::parse(url)
                .with_context(|| format!("firebase.realtime_db_url '{}' is not a URL", url))?;
        }
        Ok(())
    }

    /// Sources that are switched on and have the identifiers they need.
    pub fn enabled_sources(&self) -> Vec<SourceKind> {
        let flags = &self.export.sources;
        let mut out = Vec::new();
        if flags.firestore {
            out.push(SourceKind::Firestore);
        }
        if flags.auth {
            out.push(SourceKind::Auth);
        }
        if flags.storage && self.firebase.storage_bucket.is_some() {
            out.push(SourceKind::Storage);
        }
        if flags.realtime_db && self.firebase.realtime_db_url.is_some() {
            out.push(SourceKind::RealtimeDb);
        }
        out
    }

    pub fn batch_size(&self, kind: SourceKind) -> usize {
        match kind {
            SourceKind::Firestore => self.export.firestore_batch_size,
            SourceKind::Auth => self.export.auth_batch_size,
            SourceKind::Storage => self.export.storage_batch_size,
            SourceKind::RealtimeDb => self.export.realtime_db_batch_size,
        }
    }

    /// Read ceiling for a source, `None` when unlimited.
    pub fn ceiling(&self, kind: SourceKind) -> Option<u64> {
        match kind {
            SourceKind::Firestore => self.limits.max_firestore_reads,
            SourceKind::Auth => self.limits.max_auth_exports,
            SourceKind::Storage => self.limits.max_storage_objects,
            SourceKind::RealtimeDb => self.limits.max_realtime_db_reads,
        }
    }

    pub fn max_reads_per_source(&self) -> Vec<(SourceKind, Option<u64>)> {
        SourceKind::ALL.iter().map(|k| (*k, self.ceiling(*k))).collect()
    }

    pub fn max_storage_file_size_bytes(&self) -> u64 {
        self.export.max_storage_file_size_mb.saturating_mul(1024 * 1024)
    }

    /// Read the bearer token from the configured environment variable.
    pub fn access_token(&self) -> Result<String> {
        let var = &self.firebase.access_token_env;
        std::env::var(var)
            .ok()
            .filter(|t| !t.trim().is_empty())
            .ok_or_else(|| anyhow!("Environment variable {} is not set or empty", var))
    }

    pub fn checkpoint_path(&self) -> PathBuf {
        self.export.output_dir.join(crate::checkpoint::CHECKPOINT_FILE)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_minimal_config_uses_defaults() {
        let config = ExportConfig::from_toml_str(
            r#"
            [firebase]
            project_id = "demo-project"
            "#,
        )
        .unwrap();

        assert_eq!(config.firebase.access_token_env, "FIRESAFE_ACCESS_TOKEN");
        assert_eq!(config.firebase.firestore_database, "(default)");
        assert_eq!(config.export.output_dir, PathBuf::from("firebase-export"));
        assert_eq!(config.batch_size(SourceKind::Firestore), 1000);
        assert_eq!(config.batch_size(SourceKind::Storage), 100);
        assert_eq!(config.ceiling(SourceKind::Auth), Some(50_000));
        assert_eq!(config.ceiling(SourceKind::Storage), None);
        assert_eq!(config.retry.max_attempts, 5);
        assert_eq!(config.observability.log_level, "info,firesafe=debug");
        assert!(config.export.include_subcollections);
        assert!(!config.export.include_storage_files);
    }

    #[test]
    fn test_enabled_sources_need_identifiers() {
        let mut config = ExportConfig::for_project("p");
        assert_eq!(
            config.enabled_sources(),
            vec![SourceKind::Firestore, SourceKind::Auth]
        );

        config.firebase.storage_bucket = Some("p.appspot.com".into());
        config.firebase.realtime_db_url = Some("https://p.firebaseio.com".into());
        config.export.sources.auth = false;
        assert_eq!(
            config.enabled_sources(),
            vec![SourceKind::Firestore, SourceKind::Storage, SourceKind::RealtimeDb]
        );
    }

    #[test]
    fn test_validate_rejects_zero_batch() {
        let err = ExportConfig::from_toml_str(
            r#"
            [firebase]
            project_id = "p"

            [export]
            auth_batch_size = 0
            "#,
        )
        .unwrap_err();
        assert!(format!("{:#}", err).contains("auth"));
    }

    #[test]
    fn test_validate_rejects_empty_project() {
        let config = ExportConfig::for_project("  ");
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_limit_overrides_keep_other_defaults() {
        let config = ExportConfig::from_toml_str(
            r#"
            [firebase]
            project_id = "p"

            [limits]
            max_storage_objects = 10
            "#,
        )
        .unwrap();
        assert_eq!(config.ceiling(SourceKind::Firestore), Some(50_000));
        assert_eq!(config.ceiling(SourceKind::Storage), Some(10));
    }

    #[test]
    fn test_expand_tilde() {
        let expanded = expand_tilde(Path::new("~/exports")).unwrap();
        assert!(!expanded.to_string_lossy().starts_with('~'));
        assert_eq!(
            expand_tilde(Path::new("relative/dir")).unwrap(),
            PathBuf::from("relative/dir")
        );
    }
}
