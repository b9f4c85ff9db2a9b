//! Scripted pod transport.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;
use tokio::net::TcpStream;

use crate::error::{Error, Result};
use crate::remote::{ExecResult, PodTarget, PodTransport};

#[derive(Default)]
struct Script {
    /// (pod, joined command) -> result
    exec: HashMap<(String, String), ExecResult>,
    /// (pod, previous) -> log text; `None` means the stream breaks
    logs: HashMap<(String, bool), Option<String>>,
    /// (pod or "*", pod port) -> local port
    backends: HashMap<(String, u16), u16>,
    /// (pod, port, path) -> body
    proxy: HashMap<(String, u16, String), String>,
}

#[derive(Default)]
struct Calls {
    exec: Vec<Vec<String>>,
    forwarded: Vec<u16>,
    proxied: Vec<String>,
}

/// Pod transport answering from canned results. Forwards are tunnelled to
/// local TCP backends.
#[derive(Clone)]
pub struct FakePodTransport {
    script: Arc<Script>,
    calls: Arc<Mutex<Calls>>,
}

/// Builder for [`FakePodTransport`]
#[derive(Default)]
pub struct FakePodTransportBuilder {
    script: Script,
}

impl FakePodTransportBuilder {
    /// `command` succeeds in `pod` with the given output
    pub fn exec_ok(mut self, pod: &str, command: &str, stdout: &str, stderr: &str) -> Self {
        self.script.exec.insert(
            (pod.to_string(), normalize(command)),
            ExecResult {
                stdout: stdout.to_string(),
                stderr: stderr.to_string(),
                failure: None,
            },
        );
        self
    }

    /// `command` fails in `pod` with `message` and `stderr`
    pub fn exec_failure(mut self, pod: &str, command: &str, message: &str, stderr: &str) -> Self {
        self.script.exec.insert(
            (pod.to_string(), normalize(command)),
            ExecResult {
                stdout: String::new(),
                stderr: stderr.to_string(),
                failure: Some(message.to_string()),
            },
        );
        self
    }

    pub fn logs(mut self, pod: &str, previous: bool, text: &str) -> Self {
        self.script
            .logs
            .insert((pod.to_string(), previous), Some(text.to_string()));
        self
    }

    /// Log streams of `pod` break mid-read
    pub fn logs_interrupted(mut self, pod: &str) -> Self {
        self.script.logs.insert((pod.to_string(), false), None);
        self.script.logs.insert((pod.to_string(), true), None);
        self
    }

    /// Forwards to `pod_port` of any pod reach `127.0.0.1:local_port`
    pub fn backend(mut self, pod_port: u16, local_port: u16) -> Self {
        self.script
            .backends
            .insert(("*".to_string(), pod_port), local_port);
        self
    }

    /// Forwards to `pod_port` of `pod` reach `127.0.0.1:local_port`
    pub fn pod_backend(mut self, pod: &str, pod_port: u16, local_port: u16) -> Self {
        self.script
            .backends
            .insert((pod.to_string(), pod_port), local_port);
        self
    }

    /// API server proxy GET of `path` on `port` of `pod` returns `body`
    pub fn proxy(mut self, pod: &str, port: u16, path: &str, body: &str) -> Self {
        self.script.proxy.insert(
            (pod.to_string(), port, path.trim_start_matches('/').to_string()),
            body.to_string(),
        );
        self
    }

    pub fn build(self) -> FakePodTransport {
        FakePodTransport {
            script: Arc::new(self.script),
            calls: Arc::new(Mutex::new(Calls::default())),
        }
    }
}

impl FakePodTransport {
    pub fn builder() -> FakePodTransportBuilder {
        FakePodTransportBuilder::default()
    }

    /// Commands executed so far, in order
    pub fn exec_calls(&self) -> Vec<Vec<String>> {
        self.calls().exec.clone()
    }

    /// Pod ports of every forwarded connection, in order
    pub fn forwarded_ports(&self) -> Vec<u16> {
        self.calls().forwarded.clone()
    }

    /// `pod:port/path` of every proxied request, in order
    pub fn proxied(&self) -> Vec<String> {
        self.calls().proxied.clone()
    }

    fn calls(&self) -> std::sync::MutexGuard<'_, Calls> {
        self.calls.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[async_trait]
impl PodTransport for FakePodTransport {
    async fn exec(&self, target: &PodTarget, command: Vec<String>) -> Result<ExecResult> {
        let joined = command.join(" ");
        self.calls().exec.push(command);

        Ok(self
            .script
            .exec
            .get(&(target.name.clone(), joined.clone()))
            .cloned()
            .unwrap_or_else(|| ExecResult {
                stdout: String::new(),
                stderr: format!("{joined}: not found"),
                failure: Some("command terminated with exit code 127".to_string()),
            }))
    }

    async fn logs(&self, target: &PodTarget, previous: bool) -> Result<String> {
        match self.script.logs.get(&(target.name.clone(), previous)) {
            Some(Some(text)) => Ok(text.clone()),
            Some(None) => Err(Error::Io(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                "log stream interrupted",
            ))),
            None => Ok(String::new()),
        }
    }

    async fn forward(&self, target: &PodTarget, port: u16, mut conn: TcpStream) -> Result<()> {
        self.calls().forwarded.push(port);

        let local = self
            .script
            .backends
            .get(&(target.name.clone(), port))
            .or_else(|| self.script.backends.get(&("*".to_string(), port)))
            .copied()
            .ok_or_else(|| Error::transient(format!("connection refused by {target}:{port}")))?;

        let mut upstream = TcpStream::connect(("127.0.0.1", local)).await?;
        tokio::io::copy_bidirectional(&mut conn, &mut upstream).await?;
        Ok(())
    }

    async fn proxy_get(&self, target: &PodTarget, port: u16, path: &str) -> Result<String> {
        let path = path.trim_start_matches('/').to_string();
        self.calls()
            .proxied
            .push(format!("{}:{}/{}", target.name, port, path));

        self.script
            .proxy
            .get(&(target.name.clone(), port, path))
            .cloned()
            .ok_or_else(|| Error::transient(format!("no route to {target}:{port}")))
    }
}

fn normalize(command: &str) -> String {
    command.split_whitespace().collect::<Vec<_>>().join(" ")
}
