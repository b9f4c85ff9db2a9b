//! mesh-kube: Kubernetes client set for service mesh tooling
//!
//! One validated [`k8s::ConnectionHandle`] feeds a [`k8s::ClientSet`] holding
//! every API group client, a shared informer factory per group and the
//! lifecycle coordinator that starts the caches. Remote pod operations (exec,
//! logs, port forwarding) live in [`remote`].
//!
//! ```no_run
//! use std::time::Duration;
//! use k8s_openapi::api::core::v1::Pod;
//! use mesh_kube::informer::{Selectors, Store};
//! use mesh_kube::k8s::{ClientSet, ConnectionHandle, ConnectionOptions};
//!
//! # async fn demo() -> mesh_kube::Result<()> {
//! let handle = ConnectionHandle::resolve(&ConnectionOptions::default()).await?;
//! let clients = ClientSet::new(&handle)?;
//! let pods: Store<Pod> = clients.kube_informer().typed(Selectors::default())?;
//! if clients.run_and_wait(Duration::from_secs(30)).await {
//!     println!("{} pods cached", pods.len());
//! }
//! clients.shutdown().await;
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod error;
pub mod fanout;
pub mod http;
pub mod informer;
pub mod k8s;
pub mod remote;
pub mod retry;
pub mod utils;

#[cfg(any(test, feature = "testing"))]
pub mod testing;

pub use error::{Error, Result, TargetError};
