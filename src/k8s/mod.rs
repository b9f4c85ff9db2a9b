//! Kubernetes API clients
//!
//! Connection resolution, the per-group clients bundled in [`ClientSet`],
//! manifest apply/delete and control plane pod helpers.

mod client;
mod connection;
mod dynamic;
mod ext;
mod gateway;
mod manifest;
mod mcs;
mod mesh;
mod pod;
mod version;

pub use client::{with_deadline, ClientSet, ClientSetOptions};
pub use connection::{ConnectionHandle, ConnectionOptions};
pub use dynamic::{DiscoveryCache, DynamicClient, MetadataClient, Resolved};
pub use ext::{crd_name, ExtClient};
pub use gateway::{
    gateway_address, gateway_ready, route_accepted, BackendRef, Condition, Gateway, GatewayAddress,
    GatewayClient, GatewaySpec, GatewayStatus, HTTPRoute, HTTPRouteMatch, HTTPRouteRule,
    HTTPRouteSpec, HTTPRouteStatus, Listener, ParentRef, PathMatch, RouteParentStatus,
    GATEWAY_API_GROUP,
};
pub use manifest::{
    effective_namespace, non_empty_files, parse_documents, wait_for_deletion, Document, Manifests,
    DEFAULT_DELETION_TIMEOUT, DELETION_POLL_INTERVAL, FIELD_MANAGER,
};
pub use mcs::{
    ImportPort, McsClient, ServiceExport, ServiceExportSpec, ServiceExportStatus, ServiceImport,
    ServiceImportSpec, MCS_GROUP,
};
pub use mesh::{
    DestinationRule, DestinationRuleSpec, MeshClient, ServiceEntry, ServiceEntrySpec, ServicePort,
    Subset, VirtualService, VirtualServiceSpec, MESH_NETWORKING_GROUP,
};
pub use pod::{pod_ready, pod_target, pods_ready, revision_selector, PodManager, REVISION_LABEL};
pub use version::{
    parse_version_string, BuildInfo, ComponentExec, ComponentTable, MeshVersions, ServerInfo,
    COMPONENT_LABEL,
};
