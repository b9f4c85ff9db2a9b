//! Environment variable configuration
//!
//! Provides environment variable overrides for configuration.

use std::env;

/// Environment variable prefix
pub const ENV_PREFIX: &str = "MESH_KUBE";

/// Overrides read from `MESH_KUBE_*` variables
#[derive(Clone, Debug, Default)]
pub struct EnvConfig {
    /// Kubeconfig from MESH_KUBE_KUBECONFIG, then KUBECONFIG
    pub kubeconfig: Option<String>,
    /// Context from MESH_KUBE_CONTEXT
    pub context: Option<String>,
    /// Namespace from MESH_KUBE_NAMESPACE
    pub namespace: Option<String>,
    /// Control plane revision from MESH_KUBE_REVISION
    pub revision: Option<String>,
    /// Control plane namespace from MESH_KUBE_MESH_NAMESPACE
    pub mesh_namespace: Option<String>,
    /// Sync timeout in seconds from MESH_KUBE_SYNC_TIMEOUT
    pub sync_timeout: Option<u64>,
    /// Config file from MESH_KUBE_CONFIG
    pub config_file: Option<String>,
    /// Verbose from MESH_KUBE_VERBOSE
    pub verbose: Option<bool>,
}

impl EnvConfig {
    /// Load configuration from environment variables
    pub fn load() -> Self {
        Self {
            kubeconfig: get_env("KUBECONFIG").or_else(|| env::var("KUBECONFIG").ok()),
            context: get_env("CONTEXT"),
            namespace: get_env("NAMESPACE"),
            revision: get_env("REVISION"),
            mesh_namespace: get_env("MESH_NAMESPACE"),
            sync_timeout: get_env_parse("SYNC_TIMEOUT"),
            config_file: get_env("CONFIG"),
            verbose: get_env_bool("VERBOSE"),
        }
    }

    /// Check if any prefixed variable is set
    pub fn has_any(&self) -> bool {
        self.context.is_some()
            || self.namespace.is_some()
            || self.revision.is_some()
            || self.mesh_namespace.is_some()
            || self.sync_timeout.is_some()
            || self.config_file.is_some()
            || self.verbose.is_some()
    }
}

/// Get environment variable with prefix
fn get_env(name: &str) -> Option<String> {
    env::var(format!("{ENV_PREFIX}_{name}"))
        .ok()
        .filter(|v| !v.is_empty())
}

/// Get environment variable and parse to type
fn get_env_parse<T: std::str::FromStr>(name: &str) -> Option<T> {
    get_env(name).and_then(|v| v.parse().ok())
}

/// Get environment variable as boolean
fn get_env_bool(name: &str) -> Option<bool> {
    get_env(name).map(|v| {
        matches!(
            v.to_lowercase().as_str(),
            "1" | "true" | "yes" | "on" | "enabled"
        )
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Sets variables for the lifetime of the guard
    struct EnvGuard {
        previous: Vec<(String, Option<String>)>,
    }

    impl EnvGuard {
        fn set(vars: &[(&str, &str)]) -> Self {
            let previous = vars
                .iter()
                .map(|(k, v)| {
                    let key = format!("{ENV_PREFIX}_{k}");
                    let old = env::var(&key).ok();
                    env::set_var(&key, v);
                    (key, old)
                })
                .collect();
            Self { previous }
        }
    }

    impl Drop for EnvGuard {
        fn drop(&mut self) {
            for (key, value) in &self.previous {
                match value {
                    Some(v) => env::set_var(key, v),
                    None => env::remove_var(key),
                }
            }
        }
    }

    #[test]
    fn test_env_config_default() {
        let config = EnvConfig::default();
        assert!(config.context.is_none());
        assert!(!config.has_any());
    }

    #[test]
    fn test_prefixed_variables_are_read() {
        let _guard = EnvGuard::set(&[
            ("REVISION", "canary"),
            ("SYNC_TIMEOUT", "15"),
            ("VERBOSE", "yes"),
            ("MESH_NAMESPACE", ""),
        ]);

        let config = EnvConfig::load();
        assert_eq!(config.revision.as_deref(), Some("canary"));
        assert_eq!(config.sync_timeout, Some(15));
        assert_eq!(config.verbose, Some(true));
        assert!(config.mesh_namespace.is_none());
        assert!(config.has_any());
    }
}
