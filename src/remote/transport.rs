//! Pod-level transports: exec, logs, port tunnels and API server proxy.

use async_trait::async_trait;
use k8s_openapi::api::core::v1::Pod;
use kube::api::{Api, AttachParams, LogParams};
use kube::Client;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::net::TcpStream;
use tracing::debug;

use super::PodTarget;
use crate::error::{Error, Result};

/// Raw outcome of a remote command
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ExecResult {
    pub stdout: String,
    pub stderr: String,
    /// Remote failure message; `None` when the command succeeded
    pub failure: Option<String>,
}

/// Seam between [`RemotePods`](super::RemotePods) and the cluster.
#[async_trait]
pub trait PodTransport: Send + Sync + 'static {
    /// Run `command` without stdin or tty.
    async fn exec(&self, target: &PodTarget, command: Vec<String>) -> Result<ExecResult>;

    /// Complete log text of the target container.
    async fn logs(&self, target: &PodTarget, previous: bool) -> Result<String>;

    /// Tunnel one accepted local connection to `port` on the pod until either
    /// side closes.
    async fn forward(&self, target: &PodTarget, port: u16, conn: TcpStream) -> Result<()>;

    /// GET `path` on `port` of the pod through the API server proxy.
    async fn proxy_get(&self, target: &PodTarget, port: u16, path: &str) -> Result<String>;
}

/// Transport over the kube-rs websocket subprotocols
#[derive(Clone)]
pub struct KubePodTransport {
    client: Client,
}

impl KubePodTransport {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    fn pods(&self, namespace: &str) -> Api<Pod> {
        Api::namespaced(self.client.clone(), namespace)
    }
}

#[async_trait]
impl PodTransport for KubePodTransport {
    async fn exec(&self, target: &PodTarget, command: Vec<String>) -> Result<ExecResult> {
        let mut params = AttachParams::default()
            .stdin(false)
            .stdout(true)
            .stderr(true)
            .tty(false);
        if let Some(container) = &target.container {
            params = params.container(container.clone());
        }

        debug!(%target, ?command, "Exec");
        let mut attached = self.pods(&target.namespace).exec(&target.name, command, &params).await?;

        let status = attached.take_status();
        let stdout = attached.stdout();
        let stderr = attached.stderr();
        let (stdout, stderr) = tokio::try_join!(read_all(stdout), read_all(stderr))?;
        let status = match status {
            Some(status) => status.await,
            None => None,
        };
        attached
            .join()
            .await
            .map_err(|e| Error::transient(format!("exec stream for {target} failed: {e}")))?;

        let failure = status.and_then(|status| match status.status.as_deref() {
            Some("Success") | None => None,
            Some(_) => Some(
                status
                    .message
                    .or(status.reason)
                    .unwrap_or_else(|| "command failed".to_string()),
            ),
        });

        Ok(ExecResult {
            stdout,
            stderr,
            failure,
        })
    }

    async fn logs(&self, target: &PodTarget, previous: bool) -> Result<String> {
        let params = LogParams {
            container: target.container.clone(),
            previous,
            ..Default::default()
        };
        self.pods(&target.namespace)
            .logs(&target.name, &params)
            .await
            .map_err(|e| match e {
                kube::Error::Api(_) => Error::Kube(e),
                other => Error::Io(std::io::Error::other(other)),
            })
    }

    async fn forward(&self, target: &PodTarget, port: u16, mut conn: TcpStream) -> Result<()> {
        let mut forwarder = self.pods(&target.namespace).portforward(&target.name, &[port]).await?;
        let mut upstream = forwarder.take_stream(port).ok_or_else(|| {
            Error::transient(format!("port {port} of {target} missing from forwarder"))
        })?;

        let (sent, received) = tokio::io::copy_bidirectional(&mut conn, &mut upstream).await?;
        debug!(%target, port, sent, received, "Forwarded connection closed");

        drop(upstream);
        forwarder
            .join()
            .await
            .map_err(|e| Error::transient(format!("port forward to {target} failed: {e}")))
    }

    async fn proxy_get(&self, target: &PodTarget, port: u16, path: &str) -> Result<String> {
        let uri = format!(
            "/api/v1/namespaces/{}/pods/{}:{}/proxy/{}",
            target.namespace,
            target.name,
            port,
            path.trim_start_matches('/')
        );
        let request = ::http::Request::get(uri)
            .body(Vec::new())
            .map_err(|e| Error::serialization(e.to_string()))?;
        Ok(self.client.request_text(request).await?)
    }
}

async fn read_all<R: AsyncRead + Unpin>(reader: Option<R>) -> Result<String> {
    let mut out = String::new();
    if let Some(mut reader) = reader {
        let mut buf = Vec::new();
        reader.read_to_end(&mut buf).await?;
        out = String::from_utf8_lossy(&buf).into_owned();
    }
    Ok(out)
}
