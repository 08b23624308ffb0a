//! The network primitive the interceptor falls back to.

use async_trait::async_trait;
use reqwest::header::{HeaderName, HeaderValue};
use std::time::Duration;

use crate::error::{Error, Result};
use crate::http::{FetchMode, Headers, Request, Response};

/// An async fetch that may fail.
///
/// Any `Err` is treated as a network failure by the strategies. Timeouts are
/// the transport's business and surface the same way.
#[async_trait]
pub trait Transport: Send + Sync + 'static {
  async fn fetch(&self, request: &Request, mode: FetchMode) -> Result<Response>;
}

/// reqwest-backed transport.
#[derive(Clone)]
pub struct HttpTransport {
  client: reqwest::Client,
}

impl HttpTransport {
  pub fn new(timeout: Duration) -> Result<Self> {
    let client = reqwest::Client::builder()
      .timeout(timeout)
      .user_agent(concat!("offgrid/", env!("CARGO_PKG_VERSION")))
      .build()
      .map_err(|e| Error::Config(format!("failed to build http client: {}", e)))?;

    Ok(Self { client })
  }
}

#[async_trait]
impl Transport for HttpTransport {
  async fn fetch(&self, request: &Request, mode: FetchMode) -> Result<Response> {
    let url = request.url().as_str();
    let mut builder = self
      .client
      .request(request.method().clone(), request.url().clone());

    for (name, value) in request.headers().iter() {
      if let (Ok(name), Ok(value)) = (
        HeaderName::from_bytes(name.as_bytes()),
        HeaderValue::from_str(value),
      ) {
        builder = builder.header(name, value);
      }
    }

    if mode == FetchMode::Reload {
      builder = builder
        .header(reqwest::header::CACHE_CONTROL, "no-cache")
        .header(reqwest::header::PRAGMA, "no-cache");
    }

    let response = builder.send().await.map_err(|e| Error::network(url, e))?;

    let status = response.status().as_u16();
    let headers: Headers = response
      .headers()
      .iter()
      .filter_map(|(name, value)| value.to_str().ok().map(|v| (name.as_str(), v.to_string())))
      .collect();
    let body = response
      .bytes()
      .await
      .map_err(|e| Error::network(url, e))?
      .to_vec();

    Ok(Response::new(status, headers, body))
  }
}
