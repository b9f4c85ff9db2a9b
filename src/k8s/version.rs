//! Control plane version probing

use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::Pod;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use super::pod::{pod_target, PodManager};
use crate::error::{Error, Result, TargetError};
use crate::fanout::{FanOut, DEFAULT_CONCURRENCY};
use crate::remote::{PodTarget, RemotePods};

/// Label naming the control plane component of a pod
pub const COMPONENT_LABEL: &str = "istio";

const MIXER_TYPE_LABEL: &str = "istio-mixer-type";

/// Build metadata reported by a control plane component
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuildInfo {
    #[serde(default)]
    pub version: String,
    #[serde(default, rename = "tag")]
    pub git_tag: String,
    #[serde(default, rename = "revision")]
    pub git_revision: String,
    #[serde(default, rename = "status")]
    pub build_status: String,
}

/// Version of one running component
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ServerInfo {
    pub component: String,
    pub pod: String,
    pub info: BuildInfo,
}

/// Parse the monitoring `/version` answer, `<version>-<revision>-<status>`.
/// Anything with fewer parts is taken as a bare version.
pub fn parse_version_string(text: &str) -> BuildInfo {
    let text = text.trim();
    let parts: Vec<&str> = text.split('-').collect();
    let n = parts.len();
    if n < 3 {
        return BuildInfo {
            version: text.to_string(),
            ..Default::default()
        };
    }

    let version = parts[..n - 2].join("-");
    BuildInfo {
        git_tag: version.clone(),
        version,
        git_revision: parts[n - 2].to_string(),
        build_status: parts[n - 1].to_string(),
    }
}

#[derive(Deserialize)]
struct VersionOutput {
    #[serde(rename = "clientVersion")]
    client_version: Option<BuildInfo>,
}

/// Binary and container used to ask a component for its version
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ComponentExec {
    pub binary: String,
    pub container: String,
}

impl ComponentExec {
    pub fn new(binary: &str, container: &str) -> Self {
        Self {
            binary: binary.to_string(),
            container: container.to_string(),
        }
    }
}

/// Component name to exec fallback
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ComponentTable {
    entries: BTreeMap<String, ComponentExec>,
}

impl Default for ComponentTable {
    fn default() -> Self {
        let discovery = ComponentExec::new("/usr/local/bin/pilot-discovery", "discovery");
        let mixer = ComponentExec::new("/usr/local/bin/mixs", "mixer");
        let entries = [
            ("pilot", discovery.clone()),
            ("istiod", discovery),
            ("citadel", ComponentExec::new("/usr/local/bin/istio_ca", "citadel")),
            ("galley", ComponentExec::new("/usr/local/bin/galley", "galley")),
            ("telemetry", mixer.clone()),
            ("policy", mixer),
            (
                "sidecar-injector",
                ComponentExec::new("/usr/local/bin/sidecar-injector", "sidecar-injector-webhook"),
            ),
        ]
        .into_iter()
        .map(|(name, exec)| (name.to_string(), exec))
        .collect();
        Self { entries }
    }
}

impl ComponentTable {
    pub fn insert(&mut self, component: impl Into<String>, exec: ComponentExec) {
        self.entries.insert(component.into(), exec);
    }

    pub fn get(&self, component: &str) -> Option<&ComponentExec> {
        self.entries.get(component)
    }

    /// Component name and exec fallback for a pod's labels
    pub fn resolve(&self, labels: &BTreeMap<String, String>) -> Result<(String, &ComponentExec)> {
        let component = labels.get(COMPONENT_LABEL).map(String::as_str).unwrap_or_default();
        let component = match component {
            "statsd-prom-bridge" => {
                return Err(Error::configuration(format!(
                    "{component} doesn't support version"
                )))
            }
            "mixer" => labels.get(MIXER_TYPE_LABEL).map(String::as_str).unwrap_or_default(),
            other => other,
        };

        self.entries
            .get(component)
            .map(|exec| (component.to_string(), exec))
            .ok_or_else(|| Error::configuration(format!("unknown control plane component {component:?}")))
    }
}

/// Asks every control plane pod for its version
#[derive(Clone)]
pub struct MeshVersions {
    pods: PodManager,
    remote: RemotePods,
    table: ComponentTable,
}

impl MeshVersions {
    pub fn new(pods: PodManager, remote: RemotePods, table: ComponentTable) -> Self {
        Self { pods, remote, table }
    }

    pub fn table(&self) -> &ComponentTable {
        &self.table
    }

    /// Versions of the running discovery pods in `namespace`
    pub async fn probe(&self, namespace: &str) -> Result<FanOut<ServerInfo>> {
        let pods = self.pods.discovery_pods(namespace).await?;
        if pods.is_empty() {
            return Err(Error::configuration(format!(
                "no running control plane pods in {namespace:?}"
            )));
        }
        self.probe_pods(&pods).await
    }

    /// Versions of the given pods, keyed by `namespace/name`. The monitoring
    /// endpoint is tried first, then the component binary inside its container.
    pub async fn probe_pods(&self, pods: &[Pod]) -> Result<FanOut<ServerInfo>> {
        let keyed: Vec<(String, &Pod)> = pods
            .iter()
            .filter_map(|p| pod_target(p, None).map(|target| (target.key(), p)))
            .collect();
        FanOut::run(
            keyed.iter().map(|(key, _)| key.clone()),
            DEFAULT_CONCURRENCY,
            |key| {
                let pod = keyed.iter().find(|(k, _)| *k == key).map(|(_, p)| *p);
                async move {
                    let pod = pod.ok_or_else(|| Error::configuration(format!("unknown pod {key}")))?;
                    self.probe_pod(pod).await
                }
            },
        )
        .await
    }

    async fn probe_pod(&self, pod: &Pod) -> Result<ServerInfo> {
        let target = pod_target(pod, None)
            .ok_or_else(|| Error::configuration("pod without a name"))?;
        let labels = pod.metadata.labels.clone().unwrap_or_default();
        let component = labels.get(COMPONENT_LABEL).cloned().unwrap_or_default();

        let endpoint = match self
            .remote
            .transport()
            .proxy_get(&target, self.remote.discovery_port(), "version")
            .await
        {
            Ok(body) if !body.trim().is_empty() => {
                debug!(%target, version = body.trim(), "Version from monitoring endpoint");
                return Ok(ServerInfo {
                    component,
                    pod: target.name,
                    info: parse_version_string(&body),
                });
            }
            Ok(_) => Error::transient(format!("empty version from {target}")),
            Err(e) => e,
        };

        warn!(%target, error = %endpoint, "Version endpoint failed, trying exec");
        match self.exec_version(&target, &labels).await {
            Ok(info) => Ok(info),
            Err(exec) => Err(Error::Aggregate(vec![
                TargetError::new(
                    format!("{}:{}/version", target.name, self.remote.discovery_port()),
                    endpoint,
                ),
                TargetError::new(format!("{} exec", target.name), exec),
            ])),
        }
    }

    async fn exec_version(
        &self,
        target: &PodTarget,
        labels: &BTreeMap<String, String>,
    ) -> Result<ServerInfo> {
        let (component, exec) = self.table.resolve(labels)?;
        let in_container = target.clone().container(exec.container.as_str());
        let output = self
            .remote
            .exec(&in_container, [exec.binary.as_str(), "version", "-o", "json"])
            .await?;

        let info = serde_json::from_str::<VersionOutput>(&output.stdout)
            .ok()
            .and_then(|v| v.client_version)
            .filter(|info| !info.version.is_empty())
            .ok_or_else(|| {
                Error::transient(format!(
                    "error reading {} {} container version: {}",
                    target.name, exec.container, output.stderr
                ))
            })?;

        Ok(ServerInfo {
            component,
            pod: target.name.clone(),
            info,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::http::HttpClient;
    use crate::testing::{test_client, FakePodTransport};
    use kube::core::ObjectMeta;
    use std::sync::Arc;
    use tokio_util::sync::CancellationToken;

    fn pod(name: &str, labels: &[(&str, &str)]) -> Pod {
        Pod {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                namespace: Some("istio-system".to_string()),
                labels: Some(
                    labels
                        .iter()
                        .map(|(k, v)| (k.to_string(), v.to_string()))
                        .collect(),
                ),
                ..Default::default()
            },
            ..Default::default()
        }
    }

    fn versions(transport: FakePodTransport) -> MeshVersions {
        let remote = RemotePods::new(
            Arc::new(transport),
            HttpClient::new().unwrap(),
            CancellationToken::new(),
        );
        MeshVersions::new(
            PodManager::new(test_client(), None),
            remote,
            ComponentTable::default(),
        )
    }

    #[test]
    fn test_parse_version_string() {
        let info = parse_version_string("1.20.0-beta.1-4ff0cd5fa2-Clean\n");
        assert_eq!(info.version, "1.20.0-beta.1");
        assert_eq!(info.git_tag, "1.20.0-beta.1");
        assert_eq!(info.git_revision, "4ff0cd5fa2");
        assert_eq!(info.build_status, "Clean");

        let bare = parse_version_string("1.20.0");
        assert_eq!(bare.version, "1.20.0");
        assert!(bare.git_revision.is_empty());

        assert_eq!(parse_version_string("1.20-dev").version, "1.20-dev");
    }

    #[test]
    fn test_component_table_resolution() {
        let table = ComponentTable::default();
        let labels = |pairs: &[(&str, &str)]| -> BTreeMap<String, String> {
            pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect()
        };

        let (name, exec) = table.resolve(&labels(&[("istio", "pilot")])).unwrap();
        assert_eq!(name, "pilot");
        assert_eq!(exec.container, "discovery");

        let (name, exec) = table
            .resolve(&labels(&[("istio", "mixer"), ("istio-mixer-type", "policy")]))
            .unwrap();
        assert_eq!(name, "policy");
        assert_eq!(exec.binary, "/usr/local/bin/mixs");

        for component in ["pilot", "istiod", "citadel", "galley", "telemetry", "policy", "sidecar-injector"] {
            let exec = table.get(component).unwrap();
            assert!(exec.binary.starts_with("/usr/local/bin/"), "{component}: {}", exec.binary);
        }

        let err = table.resolve(&labels(&[("istio", "statsd-prom-bridge")])).unwrap_err();
        assert!(err.to_string().contains("doesn't support version"));
        assert!(table.resolve(&labels(&[("istio", "ingressgateway")])).is_err());
        assert!(table.resolve(&labels(&[])).is_err());
    }

    #[test]
    fn test_component_table_is_configurable() {
        let table: ComponentTable = serde_yaml::from_str(
            "ztunnel:\n  binary: /usr/local/bin/ztunnel\n  container: istio-proxy\n",
        )
        .unwrap();
        assert_eq!(table.get("ztunnel").unwrap().container, "istio-proxy");
        assert!(table.get("pilot").is_none());
    }

    #[tokio::test]
    async fn test_probe_prefers_monitoring_endpoint() {
        let transport = FakePodTransport::builder()
            .proxy("istiod-a", 15014, "version", "1.20.1-abc123-Clean")
            .build();
        let versions = versions(transport.clone());

        let out = versions
            .probe_pods(&[pod("istiod-a", &[("istio", "pilot")])])
            .await
            .unwrap();

        let info = out.get("istio-system/istiod-a").unwrap();
        assert_eq!(info.component, "pilot");
        assert_eq!(info.info.version, "1.20.1");
        assert_eq!(info.info.build_status, "Clean");
        assert!(transport.exec_calls().is_empty());
    }

    #[tokio::test]
    async fn test_probe_falls_back_to_exec() {
        let transport = FakePodTransport::builder()
            .exec_ok(
                "istiod-b",
                "/usr/local/bin/pilot-discovery version -o json",
                r#"{"clientVersion":{"version":"1.19.3","revision":"f00d","status":"Clean","tag":"1.19.3"}}"#,
                "",
            )
            .build();
        let versions = versions(transport.clone());

        let out = versions
            .probe_pods(&[pod("istiod-b", &[("istio", "istiod")])])
            .await
            .unwrap();

        let info = out.get("istio-system/istiod-b").unwrap();
        assert_eq!(info.info.version, "1.19.3");
        assert_eq!(info.info.git_revision, "f00d");
        assert_eq!(
            transport.exec_calls(),
            vec![vec![
                "/usr/local/bin/pilot-discovery".to_string(),
                "version".to_string(),
                "-o".to_string(),
                "json".to_string(),
            ]]
        );
    }

    #[tokio::test]
    async fn test_probe_keeps_partial_results() {
        let transport = FakePodTransport::builder()
            .proxy("istiod-a", 15014, "version", "1.20.1-abc123-Clean")
            .exec_ok("istiod-c", "/usr/local/bin/pilot-discovery version -o json", "{}", "no version")
            .build();
        let versions = versions(transport);

        let out = versions
            .probe_pods(&[
                pod("istiod-a", &[("istio", "pilot")]),
                pod("istiod-c", &[("istio", "pilot")]),
            ])
            .await
            .unwrap();

        assert!(out.get("istio-system/istiod-a").is_some());
        assert_eq!(out.failures.len(), 1);
        assert_eq!(out.failures[0].target, "istio-system/istiod-c");
        assert!(out.failures[0].to_string().contains("error reading istiod-c discovery container version"));
    }

    #[tokio::test]
    async fn test_probe_fails_when_every_pod_fails() {
        let versions = versions(FakePodTransport::builder().build());
        let err = versions
            .probe_pods(&[pod("gw", &[("istio", "ingressgateway")])])
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Aggregate(_)));
    }
}
