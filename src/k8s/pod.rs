//! Pod queries and readiness checks

use std::time::Duration;

use k8s_openapi::api::core::v1::Pod;
use kube::api::{Api, ListParams};
use kube::Client;
use tracing::{debug, info};

use crate::error::{Error, Result};
use crate::remote::PodTarget;
use crate::retry::retry_until;

/// Label carrying the control plane revision
pub const REVISION_LABEL: &str = "istio.io/rev";

/// Pod lookups, revision aware for control plane queries
#[derive(Clone)]
pub struct PodManager {
    client: Client,
    revision: Option<String>,
}

impl PodManager {
    pub fn new(client: Client, revision: Option<String>) -> Self {
        Self { client, revision }
    }

    fn api(&self, namespace: &str) -> Api<Pod> {
        Api::namespaced(self.client.clone(), namespace)
    }

    pub fn revision(&self) -> Option<&str> {
        self.revision.as_deref()
    }

    /// Pods matching all of `label_selectors`
    pub async fn pods_for_selector(&self, namespace: &str, label_selectors: &[&str]) -> Result<Vec<Pod>> {
        let selector = label_selectors.join(",");
        let mut params = ListParams::default();
        if !selector.is_empty() {
            params = params.labels(&selector);
        }
        let list = self.api(namespace).list(&params).await?;
        debug!(namespace, selector = %selector, count = list.items.len(), "Listed pods");
        Ok(list.items)
    }

    /// Control plane pods, restricted to the configured revision
    pub async fn control_plane_pods(
        &self,
        namespace: &str,
        labels: Option<&str>,
        fields: Option<&str>,
    ) -> Result<Vec<Pod>> {
        let mut params = ListParams::default();
        if let Some(selector) = revision_selector(labels, self.revision.as_deref()) {
            params = params.labels(&selector);
        }
        if let Some(fields) = fields {
            params = params.fields(fields);
        }
        Ok(self.api(namespace).list(&params).await?.items)
    }

    /// Running discovery pods of the configured revision
    pub async fn discovery_pods(&self, namespace: &str) -> Result<Vec<Pod>> {
        self.control_plane_pods(namespace, Some("app=istiod"), Some("status.phase=Running"))
            .await
    }

    /// Wait until at least one pod matches and every match is ready
    pub async fn wait_ready(
        &self,
        namespace: &str,
        label_selectors: &[&str],
        timeout: Duration,
        delay: Duration,
    ) -> Result<Vec<Pod>> {
        let pods = retry_until(
            &format!("pods {} in {}", label_selectors.join(","), namespace),
            timeout,
            delay,
            || async {
                let pods = self.pods_for_selector(namespace, label_selectors).await?;
                pods_ready(&pods)?;
                Ok(pods)
            },
        )
        .await?;

        info!(namespace, count = pods.len(), "Pods ready");
        Ok(pods)
    }
}

/// Join `labels` with the revision label when a revision is set
pub fn revision_selector(labels: Option<&str>, revision: Option<&str>) -> Option<String> {
    let labels = labels.filter(|l| !l.is_empty());
    match (labels, revision.filter(|r| !r.is_empty())) {
        (Some(labels), Some(rev)) => Some(format!("{labels},{REVISION_LABEL}={rev}")),
        (None, Some(rev)) => Some(format!("{REVISION_LABEL}={rev}")),
        (Some(labels), None) => Some(labels.to_string()),
        (None, None) => None,
    }
}

/// Running with the Ready condition true
pub fn pod_ready(pod: &Pod) -> bool {
    let Some(status) = &pod.status else {
        return false;
    };
    status.phase.as_deref() == Some("Running")
        && status
            .conditions
            .iter()
            .flatten()
            .any(|c| c.type_ == "Ready" && c.status == "True")
}

/// Fails unless `pods` is non-empty and every pod is ready
pub fn pods_ready(pods: &[Pod]) -> Result<()> {
    if pods.is_empty() {
        return Err(Error::transient("no pods found"));
    }

    let not_ready: Vec<String> = pods
        .iter()
        .filter(|pod| !pod_ready(pod))
        .map(|pod| {
            let phase = pod
                .status
                .as_ref()
                .and_then(|s| s.phase.clone())
                .unwrap_or_else(|| "Unknown".to_string());
            format!(
                "{}/{} ({phase})",
                pod.metadata.namespace.as_deref().unwrap_or_default(),
                pod.metadata.name.as_deref().unwrap_or_default()
            )
        })
        .collect();

    if not_ready.is_empty() {
        Ok(())
    } else {
        Err(Error::transient(format!("pods not ready: {}", not_ready.join(", "))))
    }
}

/// Exec/forward target for a listed pod
pub fn pod_target(pod: &Pod, container: Option<&str>) -> Option<PodTarget> {
    let name = pod.metadata.name.as_deref()?;
    let namespace = pod.metadata.namespace.as_deref().unwrap_or("default");
    let target = PodTarget::new(namespace, name);
    Some(match container {
        Some(container) => target.container(container),
        None => target,
    })
}
