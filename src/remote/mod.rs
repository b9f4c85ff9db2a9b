//! Remote pod operations
//!
//! Exec, logs and port forwarding against individual pods, plus HTTP requests
//! tunnelled through a short-lived forward (sidecar admin and control plane
//! debug endpoints).

mod forward;
mod transport;

pub use forward::{LocalBinding, PortForward};
pub use transport::{ExecResult, KubePodTransport, PodTransport};

use std::fmt;
use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::error::{Error, Result};
use crate::fanout::{FanOut, DEFAULT_CONCURRENCY};
use crate::http::{HttpClient, HttpRequest, HttpResponse};

/// Sidecar proxy admin port
pub const PROXY_ADMIN_PORT: u16 = 15000;

/// Control plane monitoring/debug port
pub const DISCOVERY_MONITORING_PORT: u16 = 15014;

/// Pod (and optionally container) an operation is aimed at
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct PodTarget {
    pub name: String,
    pub namespace: String,
    /// `None` selects the pod's default container
    pub container: Option<String>,
}

impl PodTarget {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            namespace: namespace.into(),
            container: None,
        }
    }

    pub fn container(mut self, container: impl Into<String>) -> Self {
        self.container = Some(container.into());
        self
    }

    /// `namespace/name`, unique across namespaces
    pub fn key(&self) -> String {
        format!("{}/{}", self.namespace, self.name)
    }
}

impl fmt::Display for PodTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.container {
            Some(container) => write!(f, "{}/{} {}", self.namespace, self.name, container),
            None => write!(f, "{}/{}", self.namespace, self.name),
        }
    }
}

/// Captured output of a successful remote command
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ExecOutput {
    pub stdout: String,
    pub stderr: String,
}

/// Exec, logs and port forwarding over a [`PodTransport`]
#[derive(Clone)]
pub struct RemotePods {
    transport: Arc<dyn PodTransport>,
    http: HttpClient,
    cancel: CancellationToken,
    admin_port: u16,
    discovery_port: u16,
}

impl RemotePods {
    pub fn new(transport: Arc<dyn PodTransport>, http: HttpClient, cancel: CancellationToken) -> Self {
        Self {
            transport,
            http,
            cancel,
            admin_port: PROXY_ADMIN_PORT,
            discovery_port: DISCOVERY_MONITORING_PORT,
        }
    }

    pub fn with_admin_port(mut self, port: u16) -> Self {
        self.admin_port = port;
        self
    }

    pub fn with_discovery_port(mut self, port: u16) -> Self {
        self.discovery_port = port;
        self
    }

    pub fn discovery_port(&self) -> u16 {
        self.discovery_port
    }

    pub fn transport(&self) -> Arc<dyn PodTransport> {
        self.transport.clone()
    }

    /// Run `command` in the target container. A failed command yields
    /// [`Error::RemoteExecution`] with whatever output was captured.
    pub async fn exec<I, S>(&self, target: &PodTarget, command: I) -> Result<ExecOutput>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let command: Vec<String> = command.into_iter().map(Into::into).collect();
        if command.is_empty() {
            return Err(Error::configuration(format!("empty command for {target}")));
        }

        let result = tokio::select! {
            _ = self.cancel.cancelled() => {
                return Err(Error::transient(format!("exec into {target} cancelled")));
            }
            result = self.transport.exec(target, command) => result?,
        };

        match result.failure {
            None => Ok(ExecOutput {
                stdout: result.stdout,
                stderr: result.stderr,
            }),
            Some(message) => Err(Error::RemoteExecution {
                target: target.to_string(),
                message,
                stdout: result.stdout,
                stderr: result.stderr,
            }),
        }
    }

    /// Whitespace-separated form of [`exec`](Self::exec)
    pub async fn exec_str(&self, target: &PodTarget, command: &str) -> Result<ExecOutput> {
        self.exec(target, command.split_whitespace()).await
    }

    /// Stdout of a successful command
    pub async fn exec_stdout<I, S>(&self, target: &PodTarget, command: I) -> Result<String>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Ok(self.exec(target, command).await?.stdout)
    }

    /// Whole log of the target container, or of its previous instance
    pub async fn logs(&self, target: &PodTarget, previous: bool) -> Result<String> {
        tokio::select! {
            _ = self.cancel.cancelled() => {
                Err(Error::transient(format!("log read from {target} cancelled")))
            }
            logs = self.transport.logs(target, previous) => logs,
        }
    }

    /// Listen on `binding` and tunnel every connection to `pod_port`.
    pub async fn port_forward(
        &self,
        target: &PodTarget,
        pod_port: u16,
        binding: &LocalBinding,
    ) -> Result<PortForward> {
        PortForward::start(
            self.transport.clone(),
            target.clone(),
            pod_port,
            binding,
            &self.cancel,
        )
        .await
    }

    /// One HTTP request to `pod_port` through a temporary forward. The
    /// forward is closed on every path.
    pub async fn request_over_forward(
        &self,
        target: &PodTarget,
        pod_port: u16,
        method: &str,
        path: &str,
    ) -> Result<HttpResponse> {
        let mut forward = self
            .port_forward(target, pod_port, &LocalBinding::new("127.0.0.1", 0))
            .await?;

        let url = format!("http://{}/{}", forward.address(), path.trim_start_matches('/'));
        debug!(%target, pod_port, %url, "Request over port forward");
        let response = tokio::select! {
            _ = self.cancel.cancelled() => {
                Err(Error::transient(format!("request to {target} cancelled")))
            }
            response = self.http.send(HttpRequest::new(method, url)) => response,
        };

        forward.close().await;
        response.map_err(|e| match e {
            Error::Http(inner) => Error::transient(format!(
                "failure running port forward request to {target}: {inner}"
            )),
            other => other,
        })
    }

    /// Request against the sidecar proxy admin endpoint
    pub async fn proxy_admin(&self, target: &PodTarget, method: &str, path: &str) -> Result<String> {
        let response = self
            .request_over_forward(target, self.admin_port, method, path)
            .await?;
        Ok(response.body)
    }

    /// GET `path` on the monitoring port of every target. Results are keyed
    /// by `namespace/name`; empty answers are dropped and the call fails only
    /// when every target failed.
    pub async fn discovery_do(&self, targets: &[PodTarget], path: &str) -> Result<FanOut<String>> {
        if targets.is_empty() {
            return Err(Error::configuration("unable to find any discovery instances"));
        }

        let out = FanOut::run(
            targets.iter().map(PodTarget::key),
            DEFAULT_CONCURRENCY,
            |key| async move {
                let target = targets
                    .iter()
                    .find(|t| t.key() == key)
                    .ok_or_else(|| Error::configuration(format!("unknown target {key}")))?;
                let response = self
                    .request_over_forward(target, self.discovery_port, "GET", path)
                    .await?;
                Ok(response.body)
            },
        )
        .await?
        .retain(|body| !body.is_empty());

        info!(
            path,
            responded = out.results.len(),
            failed = out.failures.len(),
            "Discovery request finished"
        );
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::FakePodTransport;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::{TcpListener, TcpStream};

    fn remote(transport: FakePodTransport) -> RemotePods {
        RemotePods::new(
            Arc::new(transport),
            HttpClient::with_timeout(5).unwrap(),
            CancellationToken::new(),
        )
    }

    fn istiod(name: &str) -> PodTarget {
        PodTarget::new("istio-system", name).container("discovery")
    }

    /// Minimal HTTP server answering every request with `body`
    async fn http_backend(body: &'static str) -> u16 {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            loop {
                let Ok((mut conn, _)) = listener.accept().await else {
                    return;
                };
                tokio::spawn(async move {
                    let mut buf = [0u8; 2048];
                    let _ = conn.read(&mut buf).await;
                    let reply = format!(
                        "HTTP/1.1 200 OK\r\ncontent-length: {}\r\nconnection: close\r\n\r\n{}",
                        body.len(),
                        body
                    );
                    let _ = conn.write_all(reply.as_bytes()).await;
                });
            }
        });
        port
    }

    #[test]
    fn test_pod_target_display() {
        assert_eq!(PodTarget::new("default", "app-1").to_string(), "default/app-1");
        assert_eq!(istiod("istiod-1").to_string(), "istio-system/istiod-1 discovery");
    }

    #[tokio::test]
    async fn test_exec_success_returns_output() {
        let transport = FakePodTransport::builder()
            .exec_ok("istiod-1", "pilot-discovery version", "1.20.0\n", "")
            .build();
        let out = remote(transport.clone())
            .exec_str(&istiod("istiod-1"), "pilot-discovery   version")
            .await
            .unwrap();

        assert_eq!(out.stdout, "1.20.0\n");
        assert_eq!(
            transport.exec_calls(),
            vec![vec!["pilot-discovery".to_string(), "version".to_string()]]
        );
    }

    #[tokio::test]
    async fn test_exec_failure_carries_stderr() {
        let transport = FakePodTransport::builder()
            .exec_failure(
                "istiod-1",
                "cat /missing",
                "command terminated with exit code 1",
                "cat: /missing: No such file or directory",
            )
            .build();
        let err = remote(transport)
            .exec_str(&istiod("istiod-1"), "cat /missing")
            .await
            .unwrap_err();

        assert!(matches!(err, Error::RemoteExecution { .. }));
        let text = err.to_string();
        assert!(text.contains("istio-system/istiod-1 discovery"));
        assert!(text.contains("No such file or directory"));
    }

    #[tokio::test]
    async fn test_empty_command_is_rejected() {
        let err = remote(FakePodTransport::builder().build())
            .exec_str(&istiod("istiod-1"), "   ")
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Configuration(_)));
    }

    #[tokio::test]
    async fn test_logs_previous_instance() {
        let transport = FakePodTransport::builder()
            .logs("app-1", false, "current\n")
            .logs("app-1", true, "crashed\n")
            .build();
        let pods = remote(transport);
        let target = PodTarget::new("default", "app-1");

        assert_eq!(pods.logs(&target, true).await.unwrap(), "crashed\n");
        assert_eq!(pods.logs(&target, false).await.unwrap(), "current\n");
    }

    #[tokio::test]
    async fn test_interrupted_logs_are_io_errors() {
        let transport = FakePodTransport::builder().logs_interrupted("app-1").build();
        let err = remote(transport)
            .logs(&PodTarget::new("default", "app-1"), false)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Io(_)));
    }

    #[tokio::test]
    async fn test_port_forward_tunnels_and_close_frees_port() {
        let backend = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let backend_port = backend.local_addr().unwrap().port();
        tokio::spawn(async move {
            while let Ok((mut conn, _)) = backend.accept().await {
                tokio::spawn(async move {
                    let mut buf = [0u8; 64];
                    let n = conn.read(&mut buf).await.unwrap_or(0);
                    let _ = conn.write_all(&buf[..n]).await;
                });
            }
        });

        let transport = FakePodTransport::builder().backend(8080, backend_port).build();
        let pods = remote(transport);
        let mut forward = pods
            .port_forward(
                &PodTarget::new("default", "echo"),
                8080,
                &LocalBinding::new("127.0.0.1", 0),
            )
            .await
            .unwrap();
        let addr = forward.local_addr();

        let mut conn = TcpStream::connect(addr).await.unwrap();
        conn.write_all(b"ping").await.unwrap();
        let mut buf = [0u8; 4];
        conn.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ping");
        drop(conn);

        forward.close().await;
        assert!(forward.is_closed());
        forward.close().await;

        // the port can be bound again immediately
        let rebound = TcpListener::bind(addr).await;
        assert!(rebound.is_ok());
    }

    #[test]
    fn test_target_key_includes_namespace() {
        assert_eq!(istiod("istiod-1").key(), "istio-system/istiod-1");
        assert_eq!(istiod("istiod-1").to_string(), "istio-system/istiod-1 discovery");
    }

    #[tokio::test]
    async fn test_proxy_admin_goes_through_forward() {
        let backend_port = http_backend("LIVE").await;
        let transport = FakePodTransport::builder()
            .backend(PROXY_ADMIN_PORT, backend_port)
            .build();

        let body = remote(transport.clone())
            .proxy_admin(&PodTarget::new("default", "app-1"), "GET", "ready")
            .await
            .unwrap();
        assert_eq!(body, "LIVE");
        assert_eq!(transport.forwarded_ports(), vec![PROXY_ADMIN_PORT]);
    }

    #[tokio::test]
    async fn test_request_over_forward_fails_without_backend() {
        let transport = FakePodTransport::builder().build();
        let err = remote(transport)
            .request_over_forward(&PodTarget::new("default", "app-1"), 15000, "GET", "/stats")
            .await
            .unwrap_err();
        assert!(err.is_transient());
    }

    #[tokio::test]
    async fn test_discovery_do_skips_failed_and_empty() {
        let backend_port = http_backend("{\"sync\":\"ok\"}").await;
        let transport = FakePodTransport::builder()
            .pod_backend("istiod-1", DISCOVERY_MONITORING_PORT, backend_port)
            .build();

        let out = remote(transport)
            .discovery_do(&[istiod("istiod-1"), istiod("istiod-2")], "/debug/syncz")
            .await
            .unwrap();

        assert_eq!(out.results.len(), 1);
        assert!(out.get("istio-system/istiod-1").unwrap().contains("sync"));
        assert_eq!(out.failures.len(), 1);
        assert_eq!(out.failures[0].target, "istio-system/istiod-2");
    }

    #[tokio::test]
    async fn test_discovery_do_keeps_same_name_in_other_namespaces() {
        let backend_port = http_backend("{\"sync\":\"ok\"}").await;
        let transport = FakePodTransport::builder()
            .pod_backend("istiod", DISCOVERY_MONITORING_PORT, backend_port)
            .build();
        let targets = [
            PodTarget::new("istio-system", "istiod"),
            PodTarget::new("istio-canary", "istiod"),
        ];

        let out = remote(transport)
            .discovery_do(&targets, "/debug/syncz")
            .await
            .unwrap();

        assert_eq!(
            out.results.keys().collect::<Vec<_>>(),
            vec!["istio-canary/istiod", "istio-system/istiod"]
        );
        assert!(out.is_complete());
    }

    #[tokio::test]
    async fn test_discovery_do_without_pods_fails() {
        let err = remote(FakePodTransport::builder().build())
            .discovery_do(&[], "/debug/syncz")
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Configuration(_)));
    }
}
