//! Configuration module
//!
//! File settings, overridden by `MESH_KUBE_*` environment variables, then by
//! command line flags.

mod env;
mod file;

pub use env::{EnvConfig, ENV_PREFIX};
pub use file::{expand_path, find_config_file, CONFIG_LOCATIONS};

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::informer::{DEFAULT_POLL_INTERVAL, FAST_POLL_INTERVAL};
use crate::k8s::{ClientSetOptions, ComponentTable, ConnectionOptions};
use crate::remote::{DISCOVERY_MONITORING_PORT, PROXY_ADMIN_PORT};
use crate::retry::RetryConfig;

/// Application configuration
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub connection: ConnectionConfig,
    pub sync: SyncConfig,
    pub mesh: MeshConfig,
    pub retry: RetryConfig,
}

/// Cluster connection settings
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ConnectionConfig {
    /// Kubeconfig path; `~/` is expanded
    pub kubeconfig: Option<String>,
    pub context: Option<String>,
    pub namespace: Option<String>,
    pub connect_timeout_secs: Option<u64>,
    pub read_timeout_secs: Option<u64>,
    pub accept_invalid_certs: bool,
}

/// Cache sync settings
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// Bounds cache sync and the wait for deleted objects to disappear
    pub timeout_secs: u64,
    pub poll_interval_ms: u64,
    /// Poll as fast as possible
    pub fast: bool,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            timeout_secs: 60,
            poll_interval_ms: DEFAULT_POLL_INTERVAL.as_millis() as u64,
            fast: false,
        }
    }
}

impl SyncConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    pub fn poll_interval(&self) -> Duration {
        if self.fast {
            FAST_POLL_INTERVAL
        } else {
            Duration::from_millis(self.poll_interval_ms)
        }
    }
}

/// Service mesh settings
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct MeshConfig {
    pub revision: Option<String>,
    /// Namespace of the control plane
    pub namespace: String,
    pub discovery_port: u16,
    pub proxy_admin_port: u16,
    pub http_timeout_secs: u64,
    /// Exec fallback used when probing versions
    pub components: ComponentTable,
}

impl Default for MeshConfig {
    fn default() -> Self {
        Self {
            revision: None,
            namespace: "istio-system".to_string(),
            discovery_port: DISCOVERY_MONITORING_PORT,
            proxy_admin_port: PROXY_ADMIN_PORT,
            http_timeout_secs: 30,
            components: ComponentTable::default(),
        }
    }
}

impl AppConfig {
    /// Load configuration from a YAML or JSON file
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        let config: Self = if file::is_yaml_file(path) {
            serde_yaml::from_str(&content)
                .with_context(|| format!("Failed to parse YAML config: {}", path.display()))?
        } else {
            serde_json::from_str(&content)
                .with_context(|| format!("Failed to parse JSON config: {}", path.display()))?
        };

        config.validate()?;
        Ok(config)
    }

    /// Load `path`, or the first file found in the standard locations, or
    /// the defaults
    pub fn load_or_default(path: Option<&Path>) -> Result<Self> {
        match path.map(Path::to_path_buf).or_else(find_config_file) {
            Some(path) => Self::load(path),
            None => Ok(Self::default()),
        }
    }

    /// Save configuration to file
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        let content = if file::is_yaml_file(path) {
            serde_yaml::to_string(self).context("Failed to serialize config")?
        } else {
            serde_json::to_string_pretty(self).context("Failed to serialize config")?
        };

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create directory: {}", parent.display()))?;
        }
        std::fs::write(path, content)
            .with_context(|| format!("Failed to write config file: {}", path.display()))?;
        Ok(())
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        if self.sync.timeout_secs == 0 {
            anyhow::bail!("sync.timeout_secs must be positive");
        }
        if self.mesh.discovery_port == 0 || self.mesh.proxy_admin_port == 0 {
            anyhow::bail!("mesh ports must be non-zero");
        }
        if self.connection.connect_timeout_secs == Some(0) || self.connection.read_timeout_secs == Some(0) {
            anyhow::bail!("connection timeouts must be positive");
        }
        if self.sync.poll_interval_ms == 0 && !self.sync.fast {
            anyhow::bail!("sync.poll_interval_ms must be positive");
        }
        let multiplier = self.retry.backoff_multiplier;
        if !(multiplier >= 1.0 && multiplier.is_finite()) {
            anyhow::bail!(
                "retry.backoff_multiplier must be a finite value of at least 1.0, got {}",
                self.retry.backoff_multiplier
            );
        }
        Ok(())
    }

    /// Apply environment overrides
    pub fn merge_env(&mut self, env: &EnvConfig) {
        if let Some(kubeconfig) = &env.kubeconfig {
            self.connection.kubeconfig = Some(kubeconfig.clone());
        }
        if let Some(context) = &env.context {
            self.connection.context = Some(context.clone());
        }
        if let Some(namespace) = &env.namespace {
            self.connection.namespace = Some(namespace.clone());
        }
        if let Some(revision) = &env.revision {
            self.mesh.revision = Some(revision.clone());
        }
        if let Some(namespace) = &env.mesh_namespace {
            self.mesh.namespace = namespace.clone();
        }
        if let Some(timeout) = env.sync_timeout {
            self.sync.timeout_secs = timeout;
        }
    }

    pub fn connection_options(&self) -> ConnectionOptions {
        let connection = &self.connection;
        ConnectionOptions {
            kubeconfig: connection.kubeconfig.as_deref().map(expand_path),
            context: connection.context.clone(),
            namespace: connection.namespace.clone(),
            connect_timeout: connection.connect_timeout_secs.map(Duration::from_secs),
            read_timeout: connection.read_timeout_secs.map(Duration::from_secs),
            accept_invalid_certs: connection.accept_invalid_certs,
        }
    }

    pub fn client_set_options(&self) -> ClientSetOptions {
        ClientSetOptions {
            revision: self.mesh.revision.clone(),
            retry: self.retry.clone(),
            poll_interval: self.sync.poll_interval(),
            http_timeout_secs: self.mesh.http_timeout_secs,
            proxy_admin_port: self.mesh.proxy_admin_port,
            discovery_port: self.mesh.discovery_port,
            components: self.mesh.components.clone(),
            deletion_timeout: self.sync.timeout(),
        }
    }

    /// Kubeconfig path as configured, after `~` expansion
    pub fn kubeconfig_path(&self) -> Option<PathBuf> {
        self.connection.kubeconfig.as_deref().map(expand_path)
    }
}
