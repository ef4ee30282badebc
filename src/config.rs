//! TOML configuration parsing and validation.
//!
//! The [`Config`] struct is loaded once at process start by [`load_config`]
//! and passed by reference into every constructor. Secrets (storage keys, the
//! language-model API key) are resolved from the environment during loading,
//! so no component reads ambient state on its own.

use anyhow::{bail, Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};

/// Longest presigned-URL lifetime accepted by S3 (seven days).
const MAX_PRESIGN_EXPIRY_SECS: u64 = 7 * 24 * 60 * 60;

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub db: DbConfig,
    pub server: ServerConfig,
    pub storage: StorageConfig,
    #[serde(default)]
    pub analyzer: AnalyzerConfig,
    #[serde(default)]
    pub worker: WorkerConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct DbConfig {
    pub path: PathBuf,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    pub bind: String,
    #[serde(default = "default_max_upload_bytes")]
    pub max_upload_bytes: usize,
}

fn default_max_upload_bytes() -> usize {
    5 * 1024 * 1024
}

#[derive(Debug, Deserialize, Clone)]
pub struct StorageConfig {
    /// Host and optional port of the S3-compatible endpoint, e.g. `localhost:9000`.
    pub endpoint: String,
    pub bucket: String,
    #[serde(default = "default_region")]
    pub region: String,
    /// Use `https` instead of `http` when talking to the endpoint.
    #[serde(default)]
    pub secure: bool,
    #[serde(default = "default_presign_expiry_secs")]
    pub presign_expiry_secs: u64,
    #[serde(default)]
    pub access_key: Option<String>,
    #[serde(default)]
    pub secret_key: Option<String>,
    #[serde(default)]
    pub session_token: Option<String>,
}

fn default_region() -> String {
    "us-east-1".to_string()
}
fn default_presign_expiry_secs() -> u64 {
    3600
}

#[derive(Debug, Deserialize, Clone)]
pub struct AnalyzerConfig {
    #[serde(default = "default_base_url")]
    pub base_url: String,
    #[serde(default = "default_model")]
    pub model: String,
    #[serde(default = "default_max_input_chars")]
    pub max_input_chars: usize,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default)]
    pub api_key: Option<String>,
}

impl Default for AnalyzerConfig {
    fn default() -> Self {
        Self {
            base_url: default_base_url(),
            model: default_model(),
            max_input_chars: default_max_input_chars(),
            timeout_secs: default_timeout_secs(),
            api_key: None,
        }
    }
}

fn default_base_url() -> String {
    "https://openrouter.ai/api/v1".to_string()
}
fn default_model() -> String {
    "gpt-4o-mini".to_string()
}
fn default_max_input_chars() -> usize {
    100_000
}
fn default_timeout_secs() -> u64 {
    120
}

/// Background analysis pool sizing.
#[derive(Debug, Deserialize, Clone)]
pub struct WorkerConfig {
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            concurrency: default_concurrency(),
            queue_capacity: default_queue_capacity(),
        }
    }
}

fn default_concurrency() -> usize {
    2
}
fn default_queue_capacity() -> usize {
    64
}

impl Config {
    /// Fills unset secrets from an environment lookup.
    ///
    /// Values already present in the file win over the environment.
    pub fn resolve_secrets<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        let first_of = |keys: &[&str]| keys.iter().find_map(|k| lookup(k).filter(|v| !v.is_empty()));

        if self.storage.access_key.is_none() {
            self.storage.access_key = first_of(&["DOCAI_STORAGE_ACCESS_KEY", "AWS_ACCESS_KEY_ID"]);
        }
        if self.storage.secret_key.is_none() {
            self.storage.secret_key =
                first_of(&["DOCAI_STORAGE_SECRET_KEY", "AWS_SECRET_ACCESS_KEY"]);
        }
        if self.storage.session_token.is_none() {
            self.storage.session_token = first_of(&["AWS_SESSION_TOKEN"]);
        }
        if self.analyzer.api_key.is_none() {
            self.analyzer.api_key = first_of(&["OPENROUTER_API_KEY", "OPENAI_API_KEY"]);
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.server.max_upload_bytes == 0 {
            bail!("server.max_upload_bytes must be > 0");
        }
        if self.storage.bucket.trim().is_empty() {
            bail!("storage.bucket must not be empty");
        }
        if self.storage.endpoint.trim().is_empty() {
            bail!("storage.endpoint must not be empty");
        }
        if !(1..=MAX_PRESIGN_EXPIRY_SECS).contains(&self.storage.presign_expiry_secs) {
            bail!(
                "storage.presign_expiry_secs must be in [1, {}]",
                MAX_PRESIGN_EXPIRY_SECS
            );
        }
        if self.analyzer.max_input_chars == 0 {
            bail!("analyzer.max_input_chars must be > 0");
        }
        if self.worker.concurrency == 0 {
            bail!("worker.concurrency must be >= 1");
        }
        if self.worker.queue_capacity == 0 {
            bail!("worker.queue_capacity must be >= 1");
        }
        Ok(())
    }
}

pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let mut config: Config =
        toml::from_str(&content).with_context(|| "Failed to parse config file")?;

    config.resolve_secrets(|key| std::env::var(key).ok());
    config.validate()?;

    Ok(config)
}
