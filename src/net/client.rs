use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

use reqwest::header::{ACCEPT, CONTENT_TYPE};
use tracing::debug;

use super::types::{Request, Response};
use crate::error::NetworkError;

/// A boxed, sendable future.
pub type BoxFuture<T> = Pin<Box<dyn Future<Output = T> + Send>>;

/// Anything that can perform a network round trip.
///
/// Futures are `'static` so the cache tiers can detach background refreshes.
pub trait Fetch: Send + Sync {
  fn fetch(&self, request: Request) -> BoxFuture<Result<Response, NetworkError>>;
}

/// reqwest-backed fetcher.
#[derive(Clone)]
pub struct HttpFetcher {
  client: reqwest::Client,
}

impl HttpFetcher {
  pub fn new(timeout: Duration) -> Result<Self, NetworkError> {
    let client = reqwest::Client::builder()
      .timeout(timeout)
      .build()
      .map_err(|e| NetworkError::Transport {
        url: String::new(),
        reason: format!("failed to build HTTP client: {}", e),
      })?;
    Ok(Self { client })
  }
}

impl Fetch for HttpFetcher {
  fn fetch(&self, request: Request) -> BoxFuture<Result<Response, NetworkError>> {
    let client = self.client.clone();
    Box::pin(async move {
      let url = request.url.to_string();
      let transport = |e: reqwest::Error| NetworkError::Transport {
        url: url.clone(),
        reason: e.to_string(),
      };

      let mut builder = client.request(request.method.clone(), request.url.clone());
      if let Some(accept) = &request.accept {
        builder = builder.header(ACCEPT, accept);
      }
      if let Some(content_type) = &request.content_type {
        builder = builder.header(CONTENT_TYPE, content_type);
      }
      if let Some(body) = request.body {
        builder = builder.body(body);
      }

      let response = builder.send().await.map_err(transport)?;
      let status = response.status().as_u16();
      let content_type = response
        .headers()
        .get(CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .map(String::from);
      let body = response.bytes().await.map_err(transport)?;

      debug!(%url, status, bytes = body.len(), "fetched");
      Ok(Response {
        status,
        content_type,
        body: body.to_vec(),
        source: super::ResponseSource::Network,
      })
    })
  }
}
