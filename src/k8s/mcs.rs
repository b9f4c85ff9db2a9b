//! Multi-cluster services client (`multicluster.x-k8s.io/v1alpha1`)

use kube::api::Api;
use kube::{Client, CustomResource};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::ext::{crd_name, ExtClient};
use crate::error::Result;

pub const MCS_GROUP: &str = "multicluster.x-k8s.io";

/// Marks a service for export to the cluster set
#[derive(CustomResource, Clone, Debug, Serialize, Deserialize, Default, JsonSchema)]
#[kube(
    group = "multicluster.x-k8s.io",
    version = "v1alpha1",
    kind = "ServiceExport",
    namespaced
)]
#[kube(status = "ServiceExportStatus")]
pub struct ServiceExportSpec {}

#[derive(Clone, Debug, Serialize, Deserialize, Default, JsonSchema)]
pub struct ServiceExportStatus {
    #[serde(default)]
    pub conditions: Vec<serde_json::Value>,
}

/// Service imported from the cluster set
#[derive(CustomResource, Clone, Debug, Serialize, Deserialize, Default, JsonSchema)]
#[kube(
    group = "multicluster.x-k8s.io",
    version = "v1alpha1",
    kind = "ServiceImport",
    namespaced
)]
pub struct ServiceImportSpec {
    /// ClusterSetIP or Headless
    #[serde(rename = "type", skip_serializing_if = "Option::is_none")]
    pub import_type: Option<String>,

    #[serde(default)]
    pub ports: Vec<ImportPort>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub ips: Vec<String>,
}

#[derive(Clone, Debug, Serialize, Deserialize, Default, JsonSchema)]
pub struct ImportPort {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    pub port: i32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub protocol: Option<String>,
}

/// Multi-cluster services client
#[derive(Clone)]
pub struct McsClient {
    client: Client,
    ext: ExtClient,
}

impl McsClient {
    pub fn new(client: Client) -> Self {
        Self {
            ext: ExtClient::new(client.clone()),
            client,
        }
    }

    pub fn service_exports(&self, namespace: &str) -> Api<ServiceExport> {
        Api::namespaced(self.client.clone(), namespace)
    }

    pub fn service_imports(&self, namespace: &str) -> Api<ServiceImport> {
        Api::namespaced(self.client.clone(), namespace)
    }

    pub async fn installed(&self) -> Result<bool> {
        let names = [
            crd_name("serviceexports", MCS_GROUP),
            crd_name("serviceimports", MCS_GROUP),
        ];
        self.ext
            .crds_installed(&[names[0].as_str(), names[1].as_str()])
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_service_export_is_empty_spec() {
        let export = ServiceExport::new("reviews", ServiceExportSpec {});
        let json = serde_json::to_value(&export).unwrap();
        assert_eq!(json["apiVersion"], "multicluster.x-k8s.io/v1alpha1");
        assert_eq!(json["metadata"]["name"], "reviews");
    }

    #[test]
    fn test_service_import_type_field() {
        let import: ServiceImport = serde_json::from_value(serde_json::json!({
            "apiVersion": "multicluster.x-k8s.io/v1alpha1",
            "kind": "ServiceImport",
            "metadata": {"name": "reviews", "namespace": "bookinfo"},
            "spec": {"type": "ClusterSetIP", "ports": [{"port": 9080, "protocol": "TCP"}]}
        }))
        .unwrap();
        assert_eq!(import.spec.import_type.as_deref(), Some("ClusterSetIP"));
        assert_eq!(import.spec.ports[0].port, 9080);
    }
}
