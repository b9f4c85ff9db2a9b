//! Test doubles for the informer and remote pod seams.
//!
//! Available to unit tests and, through the `testing` feature, to downstream
//! test suites.

mod pods;
mod source;

pub use pods::{FakePodTransport, FakePodTransportBuilder};
pub use source::{FakeSource, FakeSourceBuilder};

use kube::{Client, Config};

/// Client pointed at an unreachable address. Useful where a [`Client`] must
/// exist but is never expected to answer. Needs a tokio runtime.
pub fn test_client() -> Client {
    let url = "http://127.0.0.1:1"
        .parse()
        .expect("static test URL is valid");
    Client::try_from(Config::new(url)).expect("client from static config")
}

/// Validated handle for the same unreachable address as [`test_client`]
pub fn test_handle() -> crate::k8s::ConnectionHandle {
    let url = "http://127.0.0.1:1"
        .parse()
        .expect("static test URL is valid");
    crate::k8s::ConnectionHandle::from_config(Config::new(url)).expect("valid static handle")
}
