//! Local listener tunnelling accepted connections to a pod port.

use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpListener;
use tokio::task::{JoinHandle, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::transport::PodTransport;
use super::PodTarget;
use crate::error::Result;

const ACCEPT_BACKOFF: Duration = Duration::from_millis(50);

/// Local address a forward listens on
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LocalBinding {
    pub address: String,
    /// 0 picks an ephemeral port
    pub port: u16,
}

impl Default for LocalBinding {
    fn default() -> Self {
        Self {
            address: "localhost".to_string(),
            port: 0,
        }
    }
}

impl LocalBinding {
    pub fn new(address: impl Into<String>, port: u16) -> Self {
        Self {
            address: address.into(),
            port,
        }
    }
}

impl fmt::Display for LocalBinding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.address, self.port)
    }
}

/// Running port forward.
///
/// The local port is released by [`close`](Self::close); dropping the handle
/// cancels the listener without waiting for it.
pub struct PortForward {
    local_addr: SocketAddr,
    target: PodTarget,
    pod_port: u16,
    cancel: CancellationToken,
    accept: Option<JoinHandle<()>>,
}

impl PortForward {
    pub(crate) async fn start(
        transport: Arc<dyn PodTransport>,
        target: PodTarget,
        pod_port: u16,
        binding: &LocalBinding,
        parent: &CancellationToken,
    ) -> Result<Self> {
        let listener = TcpListener::bind((binding.address.as_str(), binding.port)).await?;
        let local_addr = listener.local_addr()?;
        let cancel = parent.child_token();

        info!(%target, pod_port, %local_addr, "Port forward listening");
        let accept = tokio::spawn(accept_loop(
            listener,
            transport,
            target.clone(),
            pod_port,
            cancel.clone(),
        ));

        Ok(Self {
            local_addr,
            target,
            pod_port,
            cancel,
            accept: Some(accept),
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// `host:port` suitable for building URLs
    pub fn address(&self) -> String {
        self.local_addr.to_string()
    }

    pub fn target(&self) -> &PodTarget {
        &self.target
    }

    pub fn pod_port(&self) -> u16 {
        self.pod_port
    }

    pub fn is_closed(&self) -> bool {
        self.accept.is_none()
    }

    /// Stop listening and tear down open tunnels. The local port is free once
    /// this returns. Calling it again is a no-op.
    pub async fn close(&mut self) {
        let Some(accept) = self.accept.take() else {
            return;
        };
        self.cancel.cancel();
        if let Err(e) = accept.await {
            warn!(target = %self.target, error = %e, "Port forward task ended abnormally");
        }
        debug!(target = %self.target, local_addr = %self.local_addr, "Port forward closed");
    }
}

impl Drop for PortForward {
    fn drop(&mut self) {
        self.cancel.cancel();
        if let Some(accept) = self.accept.take() {
            accept.abort();
        }
    }
}

async fn accept_loop(
    listener: TcpListener,
    transport: Arc<dyn PodTransport>,
    target: PodTarget,
    pod_port: u16,
    cancel: CancellationToken,
) {
    let mut connections = JoinSet::new();

    loop {
        let accepted = tokio::select! {
            _ = cancel.cancelled() => break,
            accepted = listener.accept() => accepted,
            // reap finished tunnels so the set does not grow unbounded
            Some(_) = connections.join_next(), if !connections.is_empty() => continue,
        };

        match accepted {
            Ok((conn, peer)) => {
                debug!(%target, %peer, pod_port, "Accepted forwarded connection");
                let transport = transport.clone();
                let target = target.clone();
                let cancel = cancel.clone();
                connections.spawn(async move {
                    tokio::select! {
                        _ = cancel.cancelled() => {}
                        result = transport.forward(&target, pod_port, conn) => {
                            if let Err(e) = result {
                                warn!(%target, pod_port, error = %e, "Forwarded connection failed");
                            }
                        }
                    }
                });
            }
            Err(e) => {
                warn!(%target, error = %e, "Accept failed");
                tokio::time::sleep(ACCEPT_BACKOFF).await;
            }
        }
    }

    drop(listener);
    connections.shutdown().await;
}
