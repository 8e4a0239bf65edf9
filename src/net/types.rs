//! Request and response values passed through the cache tiers.

use reqwest::Method;
use serde::de::DeserializeOwned;
use url::Url;

use crate::error::NetworkError;

/// How the request was issued by the page.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestMode {
  /// Top-level navigation to an HTML document
  Navigate,
  SameOrigin,
  /// Cross-origin request with CORS
  Cors,
}

/// An outbound request as seen by the interceptor.
#[derive(Debug, Clone)]
pub struct Request {
  pub method: Method,
  pub url: Url,
  /// Value of the Accept header, if any
  pub accept: Option<String>,
  pub mode: RequestMode,
  pub body: Option<Vec<u8>>,
  pub content_type: Option<String>,
}

impl Request {
  pub fn get(url: Url) -> Self {
    Self {
      method: Method::GET,
      url,
      accept: None,
      mode: RequestMode::SameOrigin,
      body: None,
      content_type: None,
    }
  }

  /// A navigation request for an HTML page.
  pub fn navigate(url: Url) -> Self {
    Self {
      accept: Some("text/html,application/xhtml+xml".to_string()),
      mode: RequestMode::Navigate,
      ..Self::get(url)
    }
  }

  /// A JSON POST.
  pub fn post_json(url: Url, body: Vec<u8>) -> Self {
    Self {
      method: Method::POST,
      body: Some(body),
      content_type: Some("application/json".to_string()),
      ..Self::get(url)
    }
  }

  #[cfg(test)]
  pub fn with_accept(mut self, accept: impl Into<String>) -> Self {
    self.accept = Some(accept.into());
    self
  }

  pub fn with_mode(mut self, mode: RequestMode) -> Self {
    self.mode = mode;
    self
  }

  /// Only GET requests are ever served from or written to a cache tier.
  pub fn is_idempotent_read(&self) -> bool {
    self.method == Method::GET
  }

  /// Cache identity: method plus fully-qualified URL.
  pub fn identity(&self) -> String {
    format!("{} {}", self.method, self.url)
  }
}

/// Where a response came from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResponseSource {
  /// Fresh data from network
  Network,
  /// Served from the named cache tier
  Cache { tier: String },
  /// Synthesized locally, nothing was cached
  Offline,
}

/// A captured response.
#[derive(Debug, Clone, PartialEq)]
pub struct Response {
  pub status: u16,
  pub content_type: Option<String>,
  pub body: Vec<u8>,
  pub source: ResponseSource,
}

impl Response {
  pub fn new(status: u16, content_type: Option<&str>, body: impl Into<Vec<u8>>) -> Self {
    Self {
      status,
      content_type: content_type.map(String::from),
      body: body.into(),
      source: ResponseSource::Network,
    }
  }

  /// 2xx
  pub fn is_ok(&self) -> bool {
    (200..300).contains(&self.status)
  }

  pub fn from_tier(mut self, tier: &str) -> Self {
    self.source = ResponseSource::Cache {
      tier: tier.to_string(),
    };
    self
  }

  #[cfg(test)]
  pub fn is_from_cache(&self) -> bool {
    matches!(self.source, ResponseSource::Cache { .. })
  }

  #[cfg(test)]
  pub fn text(&self) -> String {
    String::from_utf8_lossy(&self.body).into_owned()
  }

  pub fn json<T: DeserializeOwned>(&self, url: &Url) -> Result<T, NetworkError> {
    serde_json::from_slice(&self.body).map_err(|e| NetworkError::Decode {
      url: url.to_string(),
      reason: e.to_string(),
    })
  }
}
