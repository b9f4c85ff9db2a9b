//! CLI argument parsing
//!
//! Defines command-line interface using clap.

use std::path::PathBuf;

use clap::{Parser, Subcommand, ValueEnum};

use mesh_kube::config::AppConfig;
use mesh_kube::remote::PROXY_ADMIN_PORT;

/// Kubernetes and service mesh operations against one cluster
#[derive(Parser, Debug)]
#[command(name = "mesh-kube")]
#[command(version)]
#[command(about = "Inspect and operate a service mesh through the Kubernetes API")]
#[command(long_about = None)]
pub struct Args {
    #[command(subcommand)]
    pub command: Command,

    /// Configuration file (YAML or JSON)
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    /// Kubeconfig file
    #[arg(long, global = true)]
    pub kubeconfig: Option<String>,

    /// Kubeconfig context
    #[arg(long, global = true)]
    pub context: Option<String>,

    /// Namespace, overriding the context and manifests
    #[arg(short, long, global = true)]
    pub namespace: Option<String>,

    /// Control plane revision
    #[arg(long, global = true)]
    pub revision: Option<String>,

    /// Enable verbose output
    #[arg(short, long, global = true)]
    pub verbose: bool,
}

impl Args {
    /// Apply command line overrides on top of file and environment settings
    pub fn apply_to(&self, config: &mut AppConfig) {
        if let Some(kubeconfig) = &self.kubeconfig {
            config.connection.kubeconfig = Some(kubeconfig.clone());
        }
        if let Some(context) = &self.context {
            config.connection.context = Some(context.clone());
        }
        if let Some(namespace) = &self.namespace {
            config.connection.namespace = Some(namespace.clone());
        }
        if let Some(revision) = &self.revision {
            config.mesh.revision = Some(revision.clone());
        }
    }
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Show API server and control plane versions
    Version {
        /// Namespace of the control plane
        #[arg(long)]
        mesh_namespace: Option<String>,

        /// Print JSON
        #[arg(long)]
        json: bool,
    },

    /// List pods
    Pods {
        /// Label selector; repeat to combine
        #[arg(short = 'l', long = "selector")]
        selectors: Vec<String>,
    },

    /// Run a command in a pod
    Exec {
        pod: String,

        #[arg(short, long)]
        container: Option<String>,

        /// Command and arguments, after `--`
        #[arg(last = true, required = true)]
        command: Vec<String>,
    },

    /// Print the logs of a pod
    Logs {
        pod: String,

        #[arg(short, long)]
        container: Option<String>,

        /// Logs of the previous container instance
        #[arg(long)]
        previous: bool,
    },

    /// Forward a local port to a pod until interrupted
    PortForward {
        pod: String,

        /// Pod port
        port: u16,

        /// Local port; 0 picks a free one
        #[arg(long, default_value = "0")]
        local_port: u16,

        #[arg(long, default_value = "localhost")]
        address: String,
    },

    /// GET a path on a pod port through a temporary forward
    ProxyGet {
        pod: String,

        path: String,

        #[arg(long, default_value_t = PROXY_ADMIN_PORT)]
        port: u16,
    },

    /// GET a path on every discovery pod
    DiscoveryGet {
        path: String,

        /// Namespace of the control plane
        #[arg(long)]
        mesh_namespace: Option<String>,
    },

    /// Server-side apply manifests
    Apply(FileArgs),

    /// Delete the objects described by manifests
    Delete(FileArgs),

    /// Start informers and wait for their caches to sync
    Sync {
        /// Resources to cache
        #[arg(long, value_enum, default_values_t = [ResourceKind::Pods])]
        resource: Vec<ResourceKind>,

        /// Timeout in seconds
        #[arg(long)]
        timeout: Option<u64>,
    },
}

/// Manifest files
#[derive(Parser, Debug)]
pub struct FileArgs {
    /// YAML file; repeat for more
    #[arg(short = 'f', long = "filename", required = true)]
    pub files: Vec<PathBuf>,

    /// Validate on the server without persisting
    #[arg(long)]
    pub dry_run: bool,
}

/// Resources the `sync` command can cache
#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
pub enum ResourceKind {
    Pods,
    Services,
    Endpoints,
    Configmaps,
    Namespaces,
    Crds,
    Virtualservices,
    Destinationrules,
    Gateways,
    Httproutes,
    Serviceexports,
}
