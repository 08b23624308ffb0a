//! Request and response values that flow through the interceptor.

use reqwest::Method;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use url::Url;

use crate::error::{Error, Result};

/// Header map with lowercased names.
///
/// Repeated headers are folded into one comma separated value, which is all the
/// cache needs to store and replay a response.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Headers(BTreeMap<String, String>);

impl Headers {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn insert(&mut self, name: &str, value: impl Into<String>) {
    let value = value.into();
    self
      .0
      .entry(name.to_ascii_lowercase())
      .and_modify(|existing| {
        existing.push_str(", ");
        existing.push_str(&value);
      })
      .or_insert(value);
  }

  pub fn get(&self, name: &str) -> Option<&str> {
    self.0.get(&name.to_ascii_lowercase()).map(String::as_str)
  }

  pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
    self.0.iter().map(|(k, v)| (k.as_str(), v.as_str()))
  }
}

impl<K: AsRef<str>, V: Into<String>> FromIterator<(K, V)> for Headers {
  fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
    let mut headers = Headers::new();
    for (name, value) in iter {
      headers.insert(name.as_ref(), value);
    }
    headers
  }
}

/// How the transport should treat intermediate HTTP caches.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum FetchMode {
  /// Let intermediaries answer as they normally would
  #[default]
  Default,
  /// Force revalidation with the origin (used when precaching)
  Reload,
}

/// One outgoing request observed by the interceptor.
#[derive(Debug, Clone)]
pub struct Request {
  method: Method,
  url: Url,
  headers: Headers,
}

impl Request {
  pub fn new(method: Method, url: Url) -> Self {
    Self {
      method,
      url,
      headers: Headers::new(),
    }
  }

  pub fn get(url: Url) -> Self {
    Self::new(Method::GET, url)
  }

  /// Build a request from textual method and absolute URL.
  pub fn parse(method: &str, url: &str) -> Result<Self> {
    let method = Method::from_bytes(method.to_ascii_uppercase().as_bytes())
      .map_err(|_| Error::UnsupportedMethod(method.to_string()))?;
    let url = Url::parse(url).map_err(|e| Error::InvalidUrl {
      url: url.to_string(),
      reason: e.to_string(),
    })?;
    Ok(Self::new(method, url))
  }

  pub fn with_header(mut self, name: &str, value: impl Into<String>) -> Self {
    self.headers.insert(name, value);
    self
  }

  pub fn method(&self) -> &Method {
    &self.method
  }

  pub fn url(&self) -> &Url {
    &self.url
  }

  pub fn headers(&self) -> &Headers {
    &self.headers
  }

  /// Whether the request declares that it accepts an HTML document.
  ///
  /// A request without an `Accept` header is treated as not accepting HTML.
  pub fn accepts_html(&self) -> bool {
    self
      .headers
      .get("accept")
      .is_some_and(|accept| accept.contains("text/html"))
  }
}

/// A fully materialized response.
///
/// Not `Clone`: a response handed to the caller and a response written to a
/// cache must be two separate values produced by [`Response::tee`].
#[derive(Debug, PartialEq, Eq)]
pub struct Response {
  status: u16,
  headers: Headers,
  body: Vec<u8>,
}

impl Response {
  pub fn new(status: u16, headers: Headers, body: Vec<u8>) -> Self {
    Self {
      status,
      headers,
      body,
    }
  }

  pub fn status(&self) -> u16 {
    self.status
  }

  pub fn headers(&self) -> &Headers {
    &self.headers
  }

  pub fn body(&self) -> &[u8] {
    &self.body
  }

  pub fn into_body(self) -> Vec<u8> {
    self.body
  }

  /// Only plain 200 responses are ever written to a cache generation.
  pub fn is_cacheable(&self) -> bool {
    self.status == 200
  }

  /// Split into two independent copies: one to return, one to persist.
  pub fn tee(self) -> (Response, Response) {
    let copy = Response {
      status: self.status,
      headers: self.headers.clone(),
      body: self.body.clone(),
    };
    (self, copy)
  }
}
