//! Gateway API client
//!
//! Typed `Gateway` and `HTTPRoute` resources of `gateway.networking.k8s.io/v1`.

use std::time::Duration;

use kube::api::Api;
use kube::{Client, CustomResource};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use tracing::info;

use super::ext::{crd_name, ExtClient};
use crate::error::{Error, Result};
use crate::retry::retry_until;

/// API group of the Gateway API
pub const GATEWAY_API_GROUP: &str = "gateway.networking.k8s.io";

/// Gateway custom resource specification
#[derive(CustomResource, Clone, Debug, Serialize, Deserialize, Default, JsonSchema)]
#[kube(
    group = "gateway.networking.k8s.io",
    version = "v1",
    kind = "Gateway",
    namespaced
)]
#[kube(status = "GatewayStatus")]
pub struct GatewaySpec {
    #[serde(rename = "gatewayClassName")]
    pub gateway_class_name: String,

    #[serde(default)]
    pub listeners: Vec<Listener>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub addresses: Vec<GatewayAddress>,
}

/// Gateway listener
#[derive(Clone, Debug, Serialize, Deserialize, Default, JsonSchema)]
pub struct Listener {
    pub name: String,
    pub port: u16,
    /// HTTP, HTTPS, TLS, TCP or UDP
    pub protocol: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hostname: Option<String>,
}

/// Address requested for or assigned to a gateway
#[derive(Clone, Debug, Serialize, Deserialize, Default, JsonSchema)]
pub struct GatewayAddress {
    /// IPAddress or Hostname
    #[serde(rename = "type", skip_serializing_if = "Option::is_none")]
    pub address_type: Option<String>,
    pub value: String,
}

/// Gateway status
#[derive(Clone, Debug, Serialize, Deserialize, Default, JsonSchema)]
pub struct GatewayStatus {
    #[serde(default)]
    pub addresses: Vec<GatewayAddress>,
    #[serde(default)]
    pub conditions: Vec<Condition>,
}

/// Status condition shared by Gateway API resources
#[derive(Clone, Debug, Serialize, Deserialize, Default, JsonSchema)]
pub struct Condition {
    #[serde(rename = "type")]
    pub condition_type: String,
    /// True, False or Unknown
    pub status: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl Condition {
    fn is_true(&self, condition_type: &str) -> bool {
        self.condition_type == condition_type && self.status == "True"
    }
}

/// HTTPRoute custom resource specification
#[derive(CustomResource, Clone, Debug, Serialize, Deserialize, Default, JsonSchema)]
#[kube(
    group = "gateway.networking.k8s.io",
    version = "v1",
    kind = "HTTPRoute",
    namespaced
)]
#[kube(status = "HTTPRouteStatus")]
pub struct HTTPRouteSpec {
    #[serde(rename = "parentRefs", default)]
    pub parent_refs: Vec<ParentRef>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub hostnames: Vec<String>,

    #[serde(default)]
    pub rules: Vec<HTTPRouteRule>,
}

/// Reference from a route to the gateway it attaches to
#[derive(Clone, Debug, Serialize, Deserialize, Default, JsonSchema)]
pub struct ParentRef {
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
    #[serde(rename = "sectionName", skip_serializing_if = "Option::is_none")]
    pub section_name: Option<String>,
}

/// HTTPRoute routing rule
#[derive(Clone, Debug, Serialize, Deserialize, Default, JsonSchema)]
pub struct HTTPRouteRule {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub matches: Vec<HTTPRouteMatch>,

    #[serde(rename = "backendRefs", default, skip_serializing_if = "Vec::is_empty")]
    pub backend_refs: Vec<BackendRef>,
}

/// Path match of a rule
#[derive(Clone, Debug, Serialize, Deserialize, Default, JsonSchema)]
pub struct HTTPRouteMatch {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub path: Option<PathMatch>,
}

#[derive(Clone, Debug, Serialize, Deserialize, Default, JsonSchema)]
pub struct PathMatch {
    /// Exact, PathPrefix or RegularExpression
    #[serde(rename = "type", skip_serializing_if = "Option::is_none")]
    pub match_type: Option<String>,
    pub value: String,
}

/// Backend service of a rule
#[derive(Clone, Debug, Serialize, Deserialize, Default, JsonSchema)]
pub struct BackendRef {
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub weight: Option<i32>,
}

/// HTTPRoute status
#[derive(Clone, Debug, Serialize, Deserialize, Default, JsonSchema)]
pub struct HTTPRouteStatus {
    #[serde(default)]
    pub parents: Vec<RouteParentStatus>,
}

#[derive(Clone, Debug, Serialize, Deserialize, Default, JsonSchema)]
pub struct RouteParentStatus {
    #[serde(rename = "parentRef")]
    pub parent_ref: ParentRef,
    #[serde(rename = "controllerName")]
    pub controller_name: String,
    #[serde(default)]
    pub conditions: Vec<Condition>,
}

/// Gateway API client
#[derive(Clone)]
pub struct GatewayClient {
    client: Client,
    ext: ExtClient,
}

impl GatewayClient {
    pub fn new(client: Client) -> Self {
        Self {
            ext: ExtClient::new(client.clone()),
            client,
        }
    }

    pub fn gateways(&self, namespace: &str) -> Api<Gateway> {
        Api::namespaced(self.client.clone(), namespace)
    }

    pub fn http_routes(&self, namespace: &str) -> Api<HTTPRoute> {
        Api::namespaced(self.client.clone(), namespace)
    }

    /// Check if the Gateway API CRDs are installed
    pub async fn installed(&self) -> Result<bool> {
        let names: Vec<String> = ["gateways", "httproutes", "gatewayclasses"]
            .iter()
            .map(|plural| crd_name(plural, GATEWAY_API_GROUP))
            .collect();
        let names: Vec<&str> = names.iter().map(String::as_str).collect();
        self.ext.crds_installed(&names).await
    }

    /// Wait until the gateway is programmed and return its address
    pub async fn wait_ready(&self, name: &str, namespace: &str, timeout: Duration) -> Result<String> {
        let gateways = self.gateways(namespace);
        let api = &gateways;
        let address = retry_until(
            &format!("gateway {namespace}/{name}"),
            timeout,
            Duration::from_secs(2),
            move || async move {
                let gateway = api.get(name).await?;
                if !gateway_ready(&gateway) {
                    return Err(Error::transient("not programmed yet"));
                }
                gateway_address(&gateway)
                    .ok_or_else(|| Error::transient("no address assigned yet"))
            },
        )
        .await?;

        info!("Gateway {}/{} is ready at {}", namespace, name, address);
        Ok(address)
    }
}

/// Whether the gateway reports Programmed (or, for older controllers, Accepted)
pub fn gateway_ready(gateway: &Gateway) -> bool {
    gateway.status.as_ref().is_some_and(|status| {
        status
            .conditions
            .iter()
            .any(|c| c.is_true("Programmed") || c.is_true("Accepted"))
    })
}

/// First IP address of the gateway, else its first address of any type
pub fn gateway_address(gateway: &Gateway) -> Option<String> {
    let status = gateway.status.as_ref()?;
    status
        .addresses
        .iter()
        .find(|a| a.address_type.as_deref() == Some("IPAddress"))
        .or_else(|| status.addresses.first())
        .map(|a| a.value.clone())
}

/// Whether every parent accepted the route
pub fn route_accepted(route: &HTTPRoute) -> bool {
    route.status.as_ref().is_some_and(|status| {
        !status.parents.is_empty()
            && status
                .parents
                .iter()
                .all(|p| p.conditions.iter().any(|c| c.is_true("Accepted")))
    })
}
