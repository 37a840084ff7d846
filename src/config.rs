use std::{
    fs,
    path::{Path, PathBuf},
    time::Duration,
};

use anyhow::{Context, Result, anyhow};
use jsonschema::{JSONSchema, ValidationError};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::{
    git::CommandGitSettings, intent::DeployMode, intent::IntentPolicy,
    reconciler::ReconcilerSettings, stream::StreamSettings,
};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub mode: ModeSetting,
    #[serde(default)]
    pub stream: StreamConfig,
    #[serde(default)]
    pub deploy: DeployConfig,
    #[serde(default)]
    pub reconcile: ReconcileConfig,
    #[serde(default)]
    pub git: GitConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Which key of a stream record drives deployments on this machine.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ModeSetting {
    Staging,
    Publish,
    /// Publish on `tlp` hosts, staging everywhere else.
    #[default]
    Auto,
}

impl ModeSetting {
    pub fn resolve(self) -> DeployMode {
        match self {
            ModeSetting::Staging => DeployMode::Staging,
            ModeSetting::Publish => DeployMode::Publish,
            ModeSetting::Auto => {
                mode_for_host(sysinfo::System::host_name().as_deref().unwrap_or_default())
            }
        }
    }
}

pub fn mode_for_host(host_name: &str) -> DeployMode {
    if host_name.contains("tlp") {
        DeployMode::Publish
    } else {
        DeployMode::Staging
    }
}

fn default_stream_url() -> String {
    "http://pubsub.apache.org:2069/".to_string()
}

fn default_connect_timeout_secs() -> u64 {
    30
}

fn default_idle_timeout_secs() -> u64 {
    30
}

fn default_reconnect_backoff_secs() -> u64 {
    30
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StreamConfig {
    #[serde(default = "default_stream_url")]
    pub url: String,
    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,
    #[serde(default = "default_idle_timeout_secs")]
    pub idle_timeout_secs: u64,
    #[serde(default = "default_reconnect_backoff_secs")]
    pub reconnect_backoff_secs: u64,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            url: default_stream_url(),
            connect_timeout_secs: default_connect_timeout_secs(),
            idle_timeout_secs: default_idle_timeout_secs(),
            reconnect_backoff_secs: default_reconnect_backoff_secs(),
        }
    }
}

fn default_root_dir() -> PathBuf {
    PathBuf::from("/www")
}

fn default_trusted_source_prefix() -> String {
    "https://gitbox.apache.org/repos/asf/".to_string()
}

fn default_org_domain() -> String {
    "apache.org".to_string()
}

fn default_protected_targets() -> Vec<String> {
    vec!["www.apache.org".to_string()]
}

fn default_branch() -> String {
    "asf-site".to_string()
}

fn default_pusher() -> String {
    "root".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeployConfig {
    #[serde(default = "default_root_dir")]
    pub root_dir: PathBuf,
    #[serde(default = "default_trusted_source_prefix")]
    pub trusted_source_prefix: String,
    #[serde(default = "default_org_domain")]
    pub org_domain: String,
    #[serde(default = "default_protected_targets")]
    pub protected_targets: Vec<String>,
    #[serde(default = "default_branch")]
    pub default_branch: String,
    #[serde(default = "default_pusher")]
    pub default_pusher: String,
}

impl Default for DeployConfig {
    fn default() -> Self {
        Self {
            root_dir: default_root_dir(),
            trusted_source_prefix: default_trusted_source_prefix(),
            org_domain: default_org_domain(),
            protected_targets: default_protected_targets(),
            default_branch: default_branch(),
            default_pusher: default_pusher(),
        }
    }
}

fn default_reconcile_interval_ms() -> u64 {
    5_000
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReconcileConfig {
    #[serde(default = "default_reconcile_interval_ms")]
    pub interval_ms: u64,
}

impl Default for ReconcileConfig {
    fn default() -> Self {
        Self {
            interval_ms: default_reconcile_interval_ms(),
        }
    }
}

fn default_git_binary() -> PathBuf {
    PathBuf::from("git")
}

fn default_git_timeout_secs() -> u64 {
    600
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GitConfig {
    #[serde(default = "default_git_binary")]
    pub binary: PathBuf,
    #[serde(default = "default_git_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for GitConfig {
    fn default() -> Self {
        Self {
            binary: default_git_binary(),
            timeout_secs: default_git_timeout_secs(),
        }
    }
}

fn default_enabled_true() -> bool {
    true
}

fn default_logging_dir() -> PathBuf {
    PathBuf::from("./logs")
}

fn default_logging_filter() -> String {
    "info".to_string()
}

fn default_logging_rotation() -> LoggingRotation {
    LoggingRotation::Daily
}

fn default_logging_retention_days() -> usize {
    14
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum LoggingRotation {
    Daily,
    Hourly,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_logging_dir")]
    pub dir: PathBuf,
    #[serde(default = "default_logging_filter")]
    pub filter: String,
    #[serde(default = "default_logging_rotation")]
    pub rotation: LoggingRotation,
    #[serde(default = "default_logging_retention_days")]
    pub retention_days: usize,
    #[serde(default = "default_enabled_true")]
    pub stderr_warn_enabled: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            dir: default_logging_dir(),
            filter: default_logging_filter(),
            rotation: default_logging_rotation(),
            retention_days: default_logging_retention_days(),
            stderr_warn_enabled: true,
        }
    }
}

impl Config {
    pub fn load(config_path: &Path) -> Result<Self> {
        let config_content = fs::read_to_string(config_path)
            .with_context(|| format!("failed to read {}", config_path.display()))?;
        let config_value: Value = json5::from_str(&config_content)
            .with_context(|| format!("failed to parse {}", config_path.display()))?;

        let config_base = resolve_config_base(config_path)?;
        let config_base = config_base.as_path();
        let schema_path = resolve_schema_path(config_base, &config_value)?;
        validate_against_schema(&config_value, &schema_path)?;

        let mut config: Config =
            serde_json::from_value(config_value).context("failed to deserialize config")?;

        if !config.deploy.root_dir.is_absolute() {
            config.deploy.root_dir = config_base.join(&config.deploy.root_dir);
        }
        if !config.logging.dir.is_absolute() {
            config.logging.dir = config_base.join(&config.logging.dir);
        }

        Ok(config)
    }

    pub fn intent_policy(&self) -> IntentPolicy {
        IntentPolicy {
            mode: self.mode.resolve(),
            trusted_source_prefix: self.deploy.trusted_source_prefix.clone(),
            org_domain: self.deploy.org_domain.clone(),
            protected_targets: self.deploy.protected_targets.clone(),
            default_branch: self.deploy.default_branch.clone(),
            default_pusher: self.deploy.default_pusher.clone(),
        }
    }

    pub fn stream_settings(&self) -> StreamSettings {
        StreamSettings {
            url: self.stream.url.clone(),
            connect_timeout: Duration::from_secs(self.stream.connect_timeout_secs.max(1)),
            idle_timeout: Duration::from_secs(self.stream.idle_timeout_secs.max(1)),
            reconnect_backoff: Duration::from_secs(self.stream.reconnect_backoff_secs),
        }
    }

    pub fn reconciler_settings(&self) -> ReconcilerSettings {
        ReconcilerSettings {
            root_dir: self.deploy.root_dir.clone(),
            interval: Duration::from_millis(self.reconcile.interval_ms.max(1)),
        }
    }

    pub fn git_settings(&self) -> CommandGitSettings {
        CommandGitSettings {
            binary: self.git.binary.clone(),
            timeout: Duration::from_secs(self.git.timeout_secs.max(1)),
        }
    }
}

/// Absolute directory of the config file; roots derived from it are never relative.
fn resolve_config_base(config_path: &Path) -> Result<PathBuf> {
    let parent = config_path
        .parent()
        .filter(|parent| !parent.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    std::path::absolute(parent)
        .with_context(|| format!("failed to resolve config directory {}", parent.display()))
}

fn resolve_schema_path(config_base: &Path, config_value: &Value) -> Result<PathBuf> {
    if let Some(path_text) = config_value.get("$schema").and_then(|value| value.as_str()) {
        let configured = PathBuf::from(path_text);
        if configured.is_absolute() {
            return Ok(configured);
        }
        return Ok(config_base.join(&configured));
    }

    let local_default = config_base.join("staged.schema.json");
    if local_default.exists() {
        return Ok(local_default);
    }

    Err(anyhow!(
        "unable to resolve schema path: expected $schema in config or staged.schema.json next to it"
    ))
}

fn validate_against_schema(config_value: &Value, schema_path: &Path) -> Result<()> {
    let schema_content = fs::read_to_string(schema_path)
        .with_context(|| format!("failed to read schema {}", schema_path.display()))?;
    let schema: Value = serde_json::from_str(&schema_content)
        .with_context(|| format!("failed to parse schema {}", schema_path.display()))?;

    let compiled =
        JSONSchema::compile(&schema).map_err(|e| anyhow!("failed to compile schema: {e}"))?;

    match compiled.validate(config_value) {
        Ok(()) => Ok(()),
        Err(errors_iter) => {
            let validation_errors: Vec<ValidationError> = errors_iter.collect();
            let messages: Vec<String> = validation_errors
                .into_iter()
                .map(|error| error.to_string())
                .collect();
            Err(anyhow!("config validation failed: {}", messages.join("; ")))
        }
    }
}
