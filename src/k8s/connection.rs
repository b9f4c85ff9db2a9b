//! Connection handle resolution
//!
//! Turns kubeconfig files, contexts and in-cluster settings into one
//! validated, immutable [`ConnectionHandle`] shared by every client.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use kube::config::{KubeConfigOptions, Kubeconfig};
use kube::{Client, Config};
use tracing::{debug, info};

use crate::error::{Error, Result};

/// How to locate and tune the cluster connection
#[derive(Clone, Debug, Default)]
pub struct ConnectionOptions {
    /// Explicit kubeconfig file; otherwise `KUBECONFIG`, `~/.kube/config`
    /// or the in-cluster service account
    pub kubeconfig: Option<PathBuf>,
    /// Kubeconfig context; the current context when unset
    pub context: Option<String>,
    /// Overrides the context's namespace
    pub namespace: Option<String>,
    pub connect_timeout: Option<Duration>,
    pub read_timeout: Option<Duration>,
    pub accept_invalid_certs: bool,
}

struct Inner {
    config: Config,
    context: Option<String>,
}

/// Validated cluster connection settings. Cheap to clone, never mutated.
#[derive(Clone)]
pub struct ConnectionHandle {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for ConnectionHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionHandle")
            .field("cluster_url", &self.inner.config.cluster_url.to_string())
            .field("namespace", &self.inner.config.default_namespace)
            .field("context", &self.inner.context)
            .finish()
    }
}

impl ConnectionHandle {
    /// Validate `config`, reporting every problem in a single error.
    pub fn from_config(config: Config) -> Result<Self> {
        Self::validated(config, None)
    }

    /// Load configuration according to `options`.
    pub async fn resolve(options: &ConnectionOptions) -> Result<Self> {
        let kube_options = KubeConfigOptions {
            context: options.context.clone(),
            ..Default::default()
        };

        let mut config = match &options.kubeconfig {
            Some(path) => {
                debug!(path = %path.display(), "Reading kubeconfig");
                let kubeconfig = Kubeconfig::read_from(path).map_err(|e| {
                    Error::configuration(format!(
                        "failed to read kubeconfig {}: {e}",
                        path.display()
                    ))
                })?;
                Config::from_custom_kubeconfig(kubeconfig, &kube_options)
                    .await
                    .map_err(|e| Error::configuration(format!("invalid kubeconfig: {e}")))?
            }
            None if options.context.is_some() => Config::from_kubeconfig(&kube_options)
                .await
                .map_err(|e| Error::configuration(format!("invalid kubeconfig: {e}")))?,
            None => Config::infer()
                .await
                .map_err(|e| Error::configuration(format!("no usable cluster configuration: {e}")))?,
        };

        if let Some(namespace) = &options.namespace {
            config.default_namespace = namespace.clone();
        }
        if options.connect_timeout.is_some() {
            config.connect_timeout = options.connect_timeout;
        }
        if options.read_timeout.is_some() {
            config.read_timeout = options.read_timeout;
        }
        if options.accept_invalid_certs {
            config.accept_invalid_certs = true;
        }

        let handle = Self::validated(config, options.context.clone())?;
        info!(
            cluster = %handle.cluster_url(),
            namespace = %handle.default_namespace(),
            "Resolved cluster connection"
        );
        Ok(handle)
    }

    fn validated(config: Config, context: Option<String>) -> Result<Self> {
        let problems = validate(&config);
        if !problems.is_empty() {
            return Err(Error::configuration(format!(
                "invalid connection handle: {}",
                problems.join("; ")
            )));
        }
        Ok(Self {
            inner: Arc::new(Inner { config, context }),
        })
    }

    pub fn config(&self) -> &Config {
        &self.inner.config
    }

    pub fn cluster_url(&self) -> String {
        self.inner.config.cluster_url.to_string()
    }

    pub fn default_namespace(&self) -> &str {
        &self.inner.config.default_namespace
    }

    pub fn context(&self) -> Option<&str> {
        self.inner.context.as_deref()
    }

    /// Build a client over this connection
    pub fn connect(&self) -> Result<Client> {
        Client::try_from(self.inner.config.clone()).map_err(|e| {
            Error::configuration(format!(
                "failed to create client for {}: {e}",
                self.cluster_url()
            ))
        })
    }
}

fn validate(config: &Config) -> Vec<String> {
    let mut problems = Vec::new();

    let url = &config.cluster_url;
    match url.scheme_str() {
        Some("http") | Some("https") => {}
        Some(other) => problems.push(format!("unsupported scheme {other} in cluster URL {url}")),
        None => problems.push(format!("cluster URL {url} has no scheme")),
    }
    if url.host().map_or(true, str::is_empty) {
        problems.push(format!("cluster URL {url} has no host"));
    }
    if config.default_namespace.trim().is_empty() {
        problems.push("default namespace is empty".to_string());
    }
    if config.connect_timeout == Some(Duration::ZERO) {
        problems.push("connect timeout is zero".to_string());
    }
    if config.read_timeout == Some(Duration::ZERO) {
        problems.push("read timeout is zero".to_string());
    }

    problems
}
