//! Request classification into resource classes.

use url::{Origin, Url};

use crate::net::{Request, RequestMode};

const STATIC_PREFIX: &str = "/static/";
const STATIC_EXTENSIONS: &[&str] = &[
  "css", "js", "png", "jpg", "jpeg", "gif", "svg", "woff", "woff2", "ttf", "ico",
];

/// The category a request falls into, which selects its caching strategy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResourceClass {
  /// Same-origin static asset: cache-first
  Static,
  /// Navigable HTML page: cache-first with background refresh
  Page,
  /// Everything else on our origin: network-first
  Dynamic,
  /// Allow-listed cross-origin resource: cache-first, cross-origin mode
  External,
}

/// Decides which requests are intercepted and how.
#[derive(Debug, Clone)]
pub struct Classifier {
  origin: Origin,
  allowed_hosts: Vec<String>,
}

impl Classifier {
  pub fn new(origin: &Url, allowed_hosts: &[String]) -> Self {
    Self {
      origin: origin.origin(),
      allowed_hosts: allowed_hosts.iter().map(|h| h.to_lowercase()).collect(),
    }
  }

  /// Classify a request. `None` means the request is not intercepted and must go
  /// straight to the network.
  pub fn classify(&self, request: &Request) -> Option<ResourceClass> {
    if !request.is_idempotent_read() {
      return None;
    }

    if request.url.origin() != self.origin {
      return request
        .url
        .host_str()
        .filter(|host| self.is_allowed_host(host))
        .map(|_| ResourceClass::External);
    }

    // Static wins over Page even when the Accept header asks for HTML.
    if is_static_path(request.url.path()) {
      Some(ResourceClass::Static)
    } else if is_html_request(request) {
      Some(ResourceClass::Page)
    } else {
      Some(ResourceClass::Dynamic)
    }
  }

  /// Exact host or any subdomain of an allow-listed host.
  pub fn is_allowed_host(&self, host: &str) -> bool {
    let host = host.to_lowercase();
    self.allowed_hosts.iter().any(|allowed| {
      host == *allowed
        || host
          .strip_suffix(allowed.as_str())
          .is_some_and(|rest| rest.ends_with('.'))
    })
  }
}

fn is_static_path(path: &str) -> bool {
  if path.starts_with(STATIC_PREFIX) {
    return true;
  }
  path
    .rsplit_once('.')
    .map(|(_, ext)| {
      let ext = ext.to_lowercase();
      STATIC_EXTENSIONS.contains(&ext.as_str())
    })
    .unwrap_or(false)
}

fn is_html_request(request: &Request) -> bool {
  request.mode == RequestMode::Navigate
    || request
      .accept
      .as_deref()
      .is_some_and(|accept| accept.contains("text/html"))
}
