//! Client set over one connection handle
//!
//! Builds every API group client, its informer factory and the remote pod
//! helpers from a single [`ConnectionHandle`].

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use k8s_openapi::apimachinery::pkg::version::Info;
use kube::Client;
use tokio::sync::OnceCell;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use super::connection::ConnectionHandle;
use super::dynamic::{DynamicClient, MetadataClient};
use super::ext::ExtClient;
use super::gateway::GatewayClient;
use super::manifest::{Manifests, DEFAULT_DELETION_TIMEOUT, DELETION_POLL_INTERVAL};
use super::mcs::McsClient;
use super::mesh::MeshClient;
use super::pod::{pod_target, PodManager};
use super::version::{ComponentTable, MeshVersions, ServerInfo};
use crate::error::{Error, Result};
use crate::fanout::FanOut;
use crate::http::{HttpClient, DEFAULT_TIMEOUT_SECS};
use crate::informer::{InformerFactory, LifecycleCoordinator, DEFAULT_POLL_INTERVAL};
use crate::remote::{KubePodTransport, RemotePods, DISCOVERY_MONITORING_PORT, PROXY_ADMIN_PORT};
use crate::retry::RetryConfig;

/// Tuning for a [`ClientSet`]
#[derive(Clone, Debug)]
pub struct ClientSetOptions {
    /// Control plane revision used for pod lookups
    pub revision: Option<String>,
    /// Reflector backoff
    pub retry: RetryConfig,
    /// How often sync waits poll the caches
    pub poll_interval: Duration,
    /// Timeout of requests sent over port forwards
    pub http_timeout_secs: u64,
    pub proxy_admin_port: u16,
    pub discovery_port: u16,
    /// Exec fallback for version probing
    pub components: ComponentTable,
    /// Wait for objects deleted from manifests to disappear
    pub deletion_timeout: Duration,
}

impl Default for ClientSetOptions {
    fn default() -> Self {
        Self {
            revision: None,
            retry: RetryConfig::default(),
            poll_interval: DEFAULT_POLL_INTERVAL,
            http_timeout_secs: DEFAULT_TIMEOUT_SECS,
            proxy_admin_port: PROXY_ADMIN_PORT,
            discovery_port: DISCOVERY_MONITORING_PORT,
            components: ComponentTable::default(),
            deletion_timeout: DEFAULT_DELETION_TIMEOUT,
        }
    }
}

#[derive(Clone)]
struct Informers {
    kube: InformerFactory,
    ext: InformerFactory,
    dynamic: InformerFactory,
    metadata: InformerFactory,
    mesh: InformerFactory,
    gateway_api: InformerFactory,
    mcs: InformerFactory,
}

/// Every API group client of one cluster, with shared informer factories
/// and one lifecycle coordinator. Cheap to clone.
#[derive(Clone)]
pub struct ClientSet {
    handle: ConnectionHandle,
    kube: Client,
    ext: ExtClient,
    dynamic: DynamicClient,
    metadata: MetadataClient,
    mesh: MeshClient,
    gateway_api: GatewayClient,
    mcs: McsClient,
    informers: Informers,
    coordinator: LifecycleCoordinator,
    revision: Option<String>,
    remote: RemotePods,
    pods: PodManager,
    manifests: Manifests,
    versions: MeshVersions,
    server_version: Arc<OnceCell<Info>>,
}

impl ClientSet {
    /// Client set with default options
    pub fn new(handle: &ConnectionHandle) -> Result<Self> {
        Self::with_options(handle, ClientSetOptions::default())
    }

    /// Build every client. Either all succeed or a single configuration
    /// error is returned.
    pub fn with_options(handle: &ConnectionHandle, options: ClientSetOptions) -> Result<Self> {
        let kube = handle.connect()?;
        let http = HttpClient::with_timeout(options.http_timeout_secs)?;

        let coordinator = LifecycleCoordinator::new(CancellationToken::new(), options.poll_interval);
        let factory = |group: &str| {
            InformerFactory::new(group, kube.clone(), coordinator.clone(), options.retry.clone())
        };
        let informers = Informers {
            kube: factory("kube"),
            ext: factory("ext"),
            dynamic: factory("dynamic"),
            metadata: factory("metadata"),
            mesh: factory("mesh"),
            gateway_api: factory("gateway-api"),
            mcs: factory("mcs"),
        };

        let dynamic = DynamicClient::new(kube.clone(), handle.default_namespace());
        let remote = RemotePods::new(
            Arc::new(KubePodTransport::new(kube.clone())),
            http,
            coordinator.cancellation(),
        )
        .with_admin_port(options.proxy_admin_port)
        .with_discovery_port(options.discovery_port);
        let pods = PodManager::new(kube.clone(), options.revision.clone());

        debug!(cluster = %handle.cluster_url(), revision = ?options.revision, "Built client set");
        Ok(Self {
            handle: handle.clone(),
            ext: ExtClient::new(kube.clone()),
            metadata: MetadataClient::new(kube.clone()),
            mesh: MeshClient::new(kube.clone()),
            gateway_api: GatewayClient::new(kube.clone()),
            mcs: McsClient::new(kube.clone()),
            manifests: Manifests::new(dynamic.clone())
                .with_deletion_wait(options.deletion_timeout, DELETION_POLL_INTERVAL),
            versions: MeshVersions::new(pods.clone(), remote.clone(), options.components),
            dynamic,
            informers,
            coordinator,
            revision: options.revision,
            remote,
            pods,
            server_version: Arc::new(OnceCell::new()),
            kube,
        })
    }

    pub fn handle(&self) -> &ConnectionHandle {
        &self.handle
    }

    pub fn revision(&self) -> Option<&str> {
        self.revision.as_deref()
    }

    /// Core API client
    pub fn kube(&self) -> &Client {
        &self.kube
    }

    pub fn ext(&self) -> &ExtClient {
        &self.ext
    }

    pub fn dynamic(&self) -> &DynamicClient {
        &self.dynamic
    }

    pub fn metadata(&self) -> &MetadataClient {
        &self.metadata
    }

    pub fn mesh(&self) -> &MeshClient {
        &self.mesh
    }

    pub fn gateway_api(&self) -> &GatewayClient {
        &self.gateway_api
    }

    pub fn mcs(&self) -> &McsClient {
        &self.mcs
    }

    pub fn kube_informer(&self) -> &InformerFactory {
        &self.informers.kube
    }

    pub fn ext_informer(&self) -> &InformerFactory {
        &self.informers.ext
    }

    pub fn dynamic_informer(&self) -> &InformerFactory {
        &self.informers.dynamic
    }

    pub fn metadata_informer(&self) -> &InformerFactory {
        &self.informers.metadata
    }

    pub fn mesh_informer(&self) -> &InformerFactory {
        &self.informers.mesh
    }

    pub fn gateway_api_informer(&self) -> &InformerFactory {
        &self.informers.gateway_api
    }

    pub fn mcs_informer(&self) -> &InformerFactory {
        &self.informers.mcs
    }

    pub fn coordinator(&self) -> &LifecycleCoordinator {
        &self.coordinator
    }

    /// Exec, logs and port forwarding
    pub fn remote(&self) -> &RemotePods {
        &self.remote
    }

    pub fn pods(&self) -> &PodManager {
        &self.pods
    }

    pub fn manifests(&self) -> &Manifests {
        &self.manifests
    }

    pub fn versions(&self) -> &MeshVersions {
        &self.versions
    }

    /// Start every registered informer and wait for their caches.
    pub async fn run_and_wait(&self, timeout: Duration) -> bool {
        self.coordinator.run_and_wait(timeout).await
    }

    /// Stop the informers and any operation still waiting on them
    pub async fn shutdown(&self) {
        self.coordinator.shutdown().await;
    }

    /// API server version, fetched on first use
    pub async fn kubernetes_version(&self) -> Result<Info> {
        let info = self
            .server_version
            .get_or_try_init(|| async {
                let info = self.kube.apiserver_version().await?;
                info!(version = %info.git_version, "Fetched API server version");
                Ok::<_, Error>(info)
            })
            .await?;
        Ok(info.clone())
    }

    /// GET `path` on the monitoring port of every running discovery pod in
    /// `namespace`.
    pub async fn all_discovery_do(&self, namespace: &str, path: &str) -> Result<FanOut<String>> {
        let pods = self.pods.discovery_pods(namespace).await?;
        let targets: Vec<_> = pods.iter().filter_map(|pod| pod_target(pod, None)).collect();
        self.remote.discovery_do(&targets, path).await
    }

    /// Versions of the control plane running in `namespace`
    pub async fn mesh_versions(&self, namespace: &str) -> Result<FanOut<ServerInfo>> {
        self.versions.probe(namespace).await
    }
}

/// Run `fut`, failing with a transient error once `deadline` elapses.
pub async fn with_deadline<T, F>(deadline: Duration, fut: F) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    tokio::time::timeout(deadline, fut)
        .await
        .map_err(|_| Error::transient(format!("deadline of {deadline:?} exceeded")))?
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::informer::{LifecycleState, Selectors, Store};
    use crate::testing::{test_handle, FakeSource};
    use k8s_openapi::api::core::v1::{ConfigMap, Pod};

    #[tokio::test]
    async fn test_client_set_shares_one_handle() {
        let handle = test_handle();
        let clients = ClientSet::new(&handle).unwrap();

        assert_eq!(clients.handle().cluster_url(), handle.cluster_url());
        assert_eq!(clients.dynamic().default_namespace(), "default");
        assert_eq!(clients.kube_informer().group(), "kube");
        assert_eq!(clients.gateway_api_informer().group(), "gateway-api");
        assert_eq!(clients.remote().discovery_port(), DISCOVERY_MONITORING_PORT);
        assert!(clients.revision().is_none());
    }

    #[tokio::test]
    async fn test_options_reach_clients() {
        let options = ClientSetOptions {
            revision: Some("canary".to_string()),
            discovery_port: 16014,
            deletion_timeout: Duration::from_secs(7),
            ..Default::default()
        };
        let clients = ClientSet::with_options(&test_handle(), options).unwrap();

        assert_eq!(clients.revision(), Some("canary"));
        assert_eq!(clients.pods().revision(), Some("canary"));
        assert_eq!(clients.remote().discovery_port(), 16014);
        assert!(clients.versions().table().get("istiod").is_some());
        assert_eq!(clients.manifests().deletion_timeout(), Duration::from_secs(7));
    }

    #[tokio::test]
    async fn test_factories_share_the_coordinator() {
        let clients = ClientSet::new(&test_handle()).unwrap();

        let pods: Store<Pod> = clients.kube_informer().typed(Selectors::default()).unwrap();
        let again: Store<Pod> = clients.kube_informer().typed(Selectors::default()).unwrap();
        assert!(pods.shares_with(&again));

        let _: Store<ConfigMap> = clients
            .mesh_informer()
            .informer("fake", FakeSource::builder().build())
            .unwrap();
        assert_eq!(clients.coordinator().registered().len(), 2);

        clients.coordinator().cancel();
        assert_eq!(clients.coordinator().state(), LifecycleState::Cancelled);
    }

    #[tokio::test]
    async fn test_clones_share_informer_state() {
        let clients = ClientSet::new(&test_handle()).unwrap();
        let copy = clients.clone();

        let source = FakeSource::<ConfigMap>::builder().build();
        let store = copy.ext_informer().informer("configmaps", source).unwrap();
        assert!(clients.run_and_wait(Duration::from_secs(5)).await);
        assert!(store.is_synced());
        assert!(copy.coordinator().is_started());
        clients.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_with_deadline_maps_elapsed_to_transient() {
        let err = tokio_test::assert_err!(
            with_deadline(Duration::from_millis(10), async {
                tokio::time::sleep(Duration::from_secs(1)).await;
                Ok(())
            })
            .await
        );
        assert!(err.is_transient());
        assert!(err.to_string().contains("deadline"));

        let value = tokio_test::assert_ok!(with_deadline(Duration::from_secs(1), async { Ok(7) }).await);
        assert_eq!(value, 7);
    }
}
