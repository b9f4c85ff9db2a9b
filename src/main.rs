//! mesh-kube - Kubernetes and service mesh operations from the command line
//!
//! ## Usage
//!
//! ```bash
//! # API server and control plane versions
//! mesh-kube version
//!
//! # Run a command in a pod container
//! mesh-kube -n echo exec a-0 -c app -- curl -s localhost:8080
//!
//! # Forward a local port until Ctrl-C
//! mesh-kube -n echo port-forward a-0 8080 --local-port 18080
//!
//! # Sidecar admin endpoint and control plane debug endpoints
//! mesh-kube -n echo proxy-get a-0 config_dump
//! mesh-kube discovery-get debug/syncz
//!
//! # Manifests
//! mesh-kube -n echo apply -f app.yaml --dry-run
//!
//! # Warm up caches
//! mesh-kube sync --resource pods --resource virtualservices --timeout 30
//! ```

use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use k8s_openapi::api::core::v1::{ConfigMap, Endpoints, Namespace, Pod, Service};
use k8s_openapi::apiextensions_apiserver::pkg::apis::apiextensions::v1::CustomResourceDefinition;
use tracing::{info, warn};

use mesh_kube::config::{expand_path, AppConfig, EnvConfig};
use mesh_kube::informer::{Selectors, Store};
use mesh_kube::k8s::{
    pod_ready, ClientSet, ConnectionHandle, DestinationRule, Gateway, HTTPRoute, ServiceExport,
    VirtualService,
};
use mesh_kube::remote::{LocalBinding, PodTarget};
use mesh_kube::utils::logger::{init_logger, LogLevel};

mod cli;

use cli::{Args, Command, FileArgs, ResourceKind};

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let env = EnvConfig::load();
    init_logger(LogLevel::from_verbose(
        args.verbose || env.verbose.unwrap_or(false),
    ));

    let config_path = args
        .config
        .clone()
        .or_else(|| env.config_file.as_deref().map(expand_path));
    let mut config = AppConfig::load_or_default(config_path.as_deref())?;
    config.merge_env(&env);
    args.apply_to(&mut config);
    config.validate()?;

    let handle = ConnectionHandle::resolve(&config.connection_options())
        .await
        .context("Failed to resolve cluster connection")?;
    let clients = ClientSet::with_options(&handle, config.client_set_options())
        .context("Failed to create Kubernetes clients")?;

    let result = run(args.command, args.namespace.as_deref(), &clients, &config).await;
    clients.shutdown().await;
    result
}

async fn run(
    command: Command,
    namespace_override: Option<&str>,
    clients: &ClientSet,
    config: &AppConfig,
) -> Result<()> {
    let namespace = clients.handle().default_namespace().to_string();
    let target = |pod: &str, container: Option<String>| {
        let target = PodTarget::new(namespace.as_str(), pod);
        match container {
            Some(container) => target.container(container),
            None => target,
        }
    };

    match command {
        Command::Version {
            mesh_namespace,
            json,
        } => {
            let mesh_namespace = mesh_namespace.unwrap_or_else(|| config.mesh.namespace.clone());
            show_versions(clients, &mesh_namespace, json).await?;
        }
        Command::Pods { selectors } => {
            let selectors: Vec<&str> = selectors.iter().map(String::as_str).collect();
            let pods = clients.pods().pods_for_selector(&namespace, &selectors).await?;
            println!("{:<50} {:<12} READY", "NAME", "PHASE");
            for pod in &pods {
                let phase = pod.status.as_ref().and_then(|s| s.phase.as_deref());
                println!(
                    "{:<50} {:<12} {}",
                    pod.metadata.name.as_deref().unwrap_or_default(),
                    phase.unwrap_or("Unknown"),
                    pod_ready(pod)
                );
            }
        }
        Command::Exec {
            pod,
            container,
            command,
        } => {
            let output = clients.remote().exec(&target(&pod, container), command).await?;
            print!("{}", output.stdout);
            eprint!("{}", output.stderr);
        }
        Command::Logs {
            pod,
            container,
            previous,
        } => {
            let logs = clients.remote().logs(&target(&pod, container), previous).await?;
            print!("{logs}");
        }
        Command::PortForward {
            pod,
            port,
            local_port,
            address,
        } => {
            let mut forward = clients
                .remote()
                .port_forward(&target(&pod, None), port, &LocalBinding::new(address, local_port))
                .await?;
            println!("Forwarding from {} -> {}", forward.address(), port);
            tokio::signal::ctrl_c()
                .await
                .context("Failed to listen for interrupt")?;
            forward.close().await;
        }
        Command::ProxyGet { pod, path, port } => {
            let response = clients
                .remote()
                .request_over_forward(&target(&pod, None), port, "GET", &path)
                .await?;
            if !response.is_success() {
                warn!(status = response.status_code, "Request returned an error status");
            }
            print!("{}", response.body);
        }
        Command::DiscoveryGet {
            path,
            mesh_namespace,
        } => {
            let mesh_namespace = mesh_namespace.unwrap_or_else(|| config.mesh.namespace.clone());
            let out = clients.all_discovery_do(&mesh_namespace, &path).await?;
            for (pod, body) in &out.results {
                println!("== {pod} ==");
                println!("{body}");
            }
            for failure in &out.failures {
                eprintln!("{failure}");
            }
        }
        Command::Apply(FileArgs { files, dry_run }) => {
            let applied = clients
                .manifests()
                .apply_yaml_files(namespace_override, &files, dry_run)
                .await?;
            info!(applied, dry_run, "Applied manifests");
        }
        Command::Delete(FileArgs { files, dry_run }) => {
            let deleted = clients
                .manifests()
                .delete_yaml_files(namespace_override, &files, dry_run)
                .await?;
            info!(deleted, dry_run, "Deleted manifests");
        }
        Command::Sync { resource, timeout } => {
            let timeout = timeout
                .map(Duration::from_secs)
                .unwrap_or_else(|| config.sync.timeout());
            sync(clients, &resource, timeout).await?;
        }
    }

    Ok(())
}

async fn show_versions(clients: &ClientSet, mesh_namespace: &str, json: bool) -> Result<()> {
    let server = clients
        .kubernetes_version()
        .await
        .context("Failed to read API server version")?;
    let mesh = clients
        .mesh_versions(mesh_namespace)
        .await
        .with_context(|| format!("Failed to read control plane versions in {mesh_namespace}"))?;

    if json {
        let out = serde_json::json!({
            "kubernetes": server.git_version,
            "controlPlane": mesh.results.values().collect::<Vec<_>>(),
        });
        println!("{}", serde_json::to_string_pretty(&out)?);
    } else {
        println!("kubernetes: {}", server.git_version);
        for info in mesh.results.values() {
            println!("{} ({}): {}", info.component, info.pod, info.info.version);
        }
    }
    for failure in &mesh.failures {
        warn!(%failure, "Version probe failed");
    }
    Ok(())
}

type Counter = Box<dyn Fn() -> usize>;

fn counter<K: Send + Sync + 'static>(store: Store<K>) -> Counter {
    Box::new(move || store.len())
}

fn register(clients: &ClientSet, kind: ResourceKind) -> mesh_kube::Result<Counter> {
    let all = Selectors::default;
    Ok(match kind {
        ResourceKind::Pods => counter(clients.kube_informer().typed::<Pod>(all())?),
        ResourceKind::Services => counter(clients.kube_informer().typed::<Service>(all())?),
        ResourceKind::Endpoints => counter(clients.kube_informer().typed::<Endpoints>(all())?),
        ResourceKind::Configmaps => counter(clients.kube_informer().typed::<ConfigMap>(all())?),
        ResourceKind::Namespaces => counter(clients.kube_informer().typed::<Namespace>(all())?),
        ResourceKind::Crds => {
            counter(clients.ext_informer().typed::<CustomResourceDefinition>(all())?)
        }
        ResourceKind::Virtualservices => {
            counter(clients.mesh_informer().typed::<VirtualService>(all())?)
        }
        ResourceKind::Destinationrules => {
            counter(clients.mesh_informer().typed::<DestinationRule>(all())?)
        }
        ResourceKind::Gateways => counter(clients.gateway_api_informer().typed::<Gateway>(all())?),
        ResourceKind::Httproutes => {
            counter(clients.gateway_api_informer().typed::<HTTPRoute>(all())?)
        }
        ResourceKind::Serviceexports => {
            counter(clients.mcs_informer().typed::<ServiceExport>(all())?)
        }
    })
}

async fn sync(clients: &ClientSet, kinds: &[ResourceKind], timeout: Duration) -> Result<()> {
    let mut counters = Vec::new();
    for kind in kinds {
        counters.push((*kind, register(clients, *kind)?));
    }

    if !clients.run_and_wait(timeout).await {
        anyhow::bail!(
            "caches not synced within {:?}: {}",
            timeout,
            clients.coordinator().unsynced().join(", ")
        );
    }

    for (kind, count) in &counters {
        println!("{:<20} {}", format!("{kind:?}").to_lowercase(), count());
    }
    Ok(())
}
