//! Upstream transport.
//!
//! The worker never talks to reqwest directly; it goes through [`Network`] so
//! the strategies can be exercised against an in-process network in tests.

use color_eyre::{eyre::eyre, Result};
use std::future::Future;
use thiserror::Error;

use crate::http::{append_header, Headers, Request, Response};

/// Failures reaching the upstream. A non-ok status is not an error here; the
/// strategies decide what a 4xx/5xx means.
#[derive(Debug, Error)]
pub enum FetchError {
  #[error("Upstream unreachable: {0}")]
  Unreachable(String),

  #[error("Network error: {0}")]
  Transport(#[from] reqwest::Error),

  #[error("Invalid request: {0}")]
  InvalidRequest(String),
}

/// Headers that describe a single connection and must not be forwarded.
const HOP_BY_HOP: &[&str] = &[
  "connection",
  "content-length",
  "host",
  "keep-alive",
  "proxy-connection",
  "te",
  "trailer",
  "transfer-encoding",
  "upgrade",
];

pub fn is_hop_by_hop(name: &str) -> bool {
  HOP_BY_HOP.contains(&name)
}

/// Something that can perform a request against the upstream.
pub trait Network: Send + Sync {
  /// Perform the request. No deadline is applied beyond the transport's own.
  fn fetch(&self, request: &Request) -> impl Future<Output = Result<Response, FetchError>> + Send;
}

/// reqwest-backed network.
#[derive(Clone)]
pub struct HttpNetwork {
  client: reqwest::Client,
}

impl HttpNetwork {
  pub fn new() -> Result<Self> {
    let client = reqwest::Client::builder()
      .user_agent(concat!("signage-relay/", env!("CARGO_PKG_VERSION")))
      .build()
      .map_err(|e| eyre!("Failed to create HTTP client: {}", e))?;

    Ok(Self { client })
  }
}

impl Network for HttpNetwork {
  async fn fetch(&self, request: &Request) -> Result<Response, FetchError> {
    let method = reqwest::Method::from_bytes(request.method.as_bytes())
      .map_err(|e| FetchError::InvalidRequest(format!("{}: {}", request.method, e)))?;

    let mut builder = self.client.request(method, request.url.clone());
    for (name, value) in &request.headers {
      if !is_hop_by_hop(name) {
        builder = builder.header(name.as_str(), value.as_str());
      }
    }
    if !request.body.is_empty() {
      builder = builder.body(request.body.clone());
    }

    let response = builder.send().await.map_err(|e| {
      if e.is_connect() || e.is_timeout() {
        FetchError::Unreachable(format!("{}: {}", request.url, e))
      } else {
        FetchError::Transport(e)
      }
    })?;

    let status = response.status();
    let mut headers = Headers::new();
    for (name, value) in response.headers() {
      if let Ok(value) = value.to_str() {
        append_header(&mut headers, name.as_str(), value);
      }
    }
    let body = response.bytes().await?;

    Ok(Response {
      status: status.as_u16(),
      status_text: status.canonical_reason().unwrap_or_default().to_string(),
      headers,
      body,
    })
  }
}
