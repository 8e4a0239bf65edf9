//! Responses synthesized when neither the network nor any tier can answer.

use crate::net::{Response, ResponseSource};

const OFFLINE_PAGE: &str = r#"<!DOCTYPE html>
<html lang="en">
<head>
<meta charset="UTF-8">
<meta name="viewport" content="width=device-width, initial-scale=1.0">
<title>AQUA - Offline</title>
<style>
body { font-family: sans-serif; background: #0b1120; color: #fff; display: flex; align-items: center; justify-content: center; min-height: 100vh; margin: 0; text-align: center; }
.container { max-width: 400px; padding: 2rem; }
h2 { color: #00d2ff; }
p { color: #cbd5e1; line-height: 1.6; }
a { color: #00ff88; margin: 0 0.5rem; }
</style>
</head>
<body>
<div class="container">
<h2>You're Offline</h2>
<p>No internet connection detected. This page wasn't cached for offline use.</p>
<p><a href="/">Go Home</a><a href="">Retry</a></p>
</div>
</body>
</html>
"#;

const OFFLINE_ERROR: &str =
  r#"{"error":"Offline","message":"No internet connection and resource not cached","offline":true}"#;

/// HTTP 503
pub const SERVICE_UNAVAILABLE: u16 = 503;

fn synthesized(content_type: Option<&str>, body: &str) -> Response {
  Response {
    source: ResponseSource::Offline,
    ..Response::new(SERVICE_UNAVAILABLE, content_type, body.as_bytes().to_vec())
  }
}

/// Self-contained page for navigations that cannot be served.
pub fn offline_page() -> Response {
  synthesized(Some("text/html"), OFFLINE_PAGE)
}

/// Structured error for non-page requests.
pub fn offline_error() -> Response {
  synthesized(Some("application/json"), OFFLINE_ERROR)
}

/// Empty response for external resources, so a missing font or library never
/// blocks a page.
pub fn external_unavailable() -> Response {
  synthesized(None, "")
}
