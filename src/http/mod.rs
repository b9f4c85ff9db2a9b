//! HTTP client for admin endpoints reached over port forwards.

mod client;

pub use client::{HttpClient, HttpRequest, HttpResponse, DEFAULT_TIMEOUT_SECS};
