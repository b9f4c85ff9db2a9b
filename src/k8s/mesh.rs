//! Mesh networking client
//!
//! Typed Istio networking resources of `networking.istio.io/v1beta1`. Only
//! the commonly inspected fields are typed; the rest is kept as raw JSON so
//! round trips through the client lose nothing.

use std::collections::BTreeMap;

use kube::api::Api;
use kube::{Client, CustomResource};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::ext::{crd_name, ExtClient};
use crate::error::Result;

/// API group of the mesh networking resources
pub const MESH_NETWORKING_GROUP: &str = "networking.istio.io";

/// Traffic routing rules for a set of hosts
#[derive(CustomResource, Clone, Debug, Serialize, Deserialize, Default, JsonSchema)]
#[kube(
    group = "networking.istio.io",
    version = "v1beta1",
    kind = "VirtualService",
    namespaced
)]
pub struct VirtualServiceSpec {
    #[serde(default)]
    pub hosts: Vec<String>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub gateways: Vec<String>,

    #[serde(rename = "exportTo", default, skip_serializing_if = "Vec::is_empty")]
    pub export_to: Vec<String>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub http: Vec<serde_json::Value>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tcp: Vec<serde_json::Value>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tls: Vec<serde_json::Value>,
}

/// Policies applied to traffic for a host after routing
#[derive(CustomResource, Clone, Debug, Serialize, Deserialize, Default, JsonSchema)]
#[kube(
    group = "networking.istio.io",
    version = "v1beta1",
    kind = "DestinationRule",
    namespaced
)]
pub struct DestinationRuleSpec {
    pub host: String,

    #[serde(rename = "trafficPolicy", skip_serializing_if = "Option::is_none")]
    pub traffic_policy: Option<serde_json::Value>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub subsets: Vec<Subset>,

    #[serde(rename = "exportTo", default, skip_serializing_if = "Vec::is_empty")]
    pub export_to: Vec<String>,
}

/// Named subset of a destination's endpoints
#[derive(Clone, Debug, Serialize, Deserialize, Default, JsonSchema)]
pub struct Subset {
    pub name: String,
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
    #[serde(rename = "trafficPolicy", skip_serializing_if = "Option::is_none")]
    pub traffic_policy: Option<serde_json::Value>,
}

/// Entry adding an external service to the mesh registry
#[derive(CustomResource, Clone, Debug, Serialize, Deserialize, Default, JsonSchema)]
#[kube(
    group = "networking.istio.io",
    version = "v1beta1",
    kind = "ServiceEntry",
    namespaced
)]
pub struct ServiceEntrySpec {
    #[serde(default)]
    pub hosts: Vec<String>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub addresses: Vec<String>,

    #[serde(default)]
    pub ports: Vec<ServicePort>,

    /// MESH_EXTERNAL or MESH_INTERNAL
    #[serde(skip_serializing_if = "Option::is_none")]
    pub location: Option<String>,

    /// NONE, STATIC or DNS
    #[serde(skip_serializing_if = "Option::is_none")]
    pub resolution: Option<String>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub endpoints: Vec<serde_json::Value>,
}

#[derive(Clone, Debug, Serialize, Deserialize, Default, JsonSchema)]
pub struct ServicePort {
    pub number: u32,
    pub protocol: String,
    pub name: String,
    #[serde(rename = "targetPort", skip_serializing_if = "Option::is_none")]
    pub target_port: Option<u32>,
}

/// Mesh networking client
#[derive(Clone)]
pub struct MeshClient {
    client: Client,
    ext: ExtClient,
}

impl MeshClient {
    pub fn new(client: Client) -> Self {
        Self {
            ext: ExtClient::new(client.clone()),
            client,
        }
    }

    pub fn virtual_services(&self, namespace: &str) -> Api<VirtualService> {
        Api::namespaced(self.client.clone(), namespace)
    }

    pub fn destination_rules(&self, namespace: &str) -> Api<DestinationRule> {
        Api::namespaced(self.client.clone(), namespace)
    }

    pub fn service_entries(&self, namespace: &str) -> Api<ServiceEntry> {
        Api::namespaced(self.client.clone(), namespace)
    }

    /// Check if the mesh networking CRDs are installed
    pub async fn installed(&self) -> Result<bool> {
        let names: Vec<String> = ["virtualservices", "destinationrules", "serviceentries"]
            .iter()
            .map(|plural| crd_name(plural, MESH_NETWORKING_GROUP))
            .collect();
        let names: Vec<&str> = names.iter().map(String::as_str).collect();
        self.ext.crds_installed(&names).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kube::Resource;

    #[test]
    fn test_resource_identity() {
        assert_eq!(VirtualService::plural(&()), "virtualservices");
        assert_eq!(DestinationRule::api_version(&()), "networking.istio.io/v1beta1");
        assert_eq!(ServiceEntry::kind(&()), "ServiceEntry");
    }

    #[test]
    fn test_unknown_route_fields_survive_round_trip() {
        let yaml = r#"
apiVersion: networking.istio.io/v1beta1
kind: VirtualService
metadata:
  name: reviews
  namespace: bookinfo
spec:
  hosts: [reviews]
  http:
  - route:
    - destination:
        host: reviews
        subset: v2
      weight: 25
"#;
        let vs: VirtualService = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(vs.spec.hosts, vec!["reviews"]);

        let json = serde_json::to_value(&vs).unwrap();
        assert_eq!(json["spec"]["http"][0]["route"][0]["weight"], 25);
        assert!(json["spec"].get("gateways").is_none());
    }

    #[test]
    fn test_destination_rule_subsets() {
        let yaml = r#"
apiVersion: networking.istio.io/v1beta1
kind: DestinationRule
metadata:
  name: reviews
spec:
  host: reviews.bookinfo.svc.cluster.local
  subsets:
  - name: v1
    labels:
      version: v1
"#;
        let dr: DestinationRule = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(dr.spec.subsets[0].labels.get("version").map(String::as_str), Some("v1"));
    }
}
