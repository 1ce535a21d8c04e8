//! Request and response types shared by the worker, the cache and the listener.

use bytes::Bytes;
use std::collections::BTreeMap;
use url::Url;

/// Header map keyed by lower-cased header name.
pub type Headers = BTreeMap<String, String>;

/// Marker header set on responses synthesized while offline.
pub const OFFLINE_HEADER: &str = "x-offline";

/// Validators a page sends against its own HTTP cache. The worker keeps its
/// own copies, so these never reach the upstream from an intercepted request.
const CONDITIONAL_HEADERS: &[&str] = &[
  "if-match",
  "if-modified-since",
  "if-none-match",
  "if-range",
  "if-unmodified-since",
];

/// Add a header value, keeping earlier values of the same name. Repeated
/// `set-cookie` values are separated by newlines since they cannot be
/// comma-joined; everything else is joined with `, `.
pub fn append_header(headers: &mut Headers, name: &str, value: &str) {
  let name = name.to_ascii_lowercase();
  let separator = if name == "set-cookie" { "\n" } else { ", " };
  headers
    .entry(name)
    .and_modify(|existing| {
      existing.push_str(separator);
      existing.push_str(value);
    })
    .or_insert_with(|| value.to_string());
}

/// Split a stored header back into the field lines to write on the wire.
pub fn header_lines<'a>(name: &'a str, value: &'a str) -> impl Iterator<Item = (&'a str, &'a str)> {
  value.split('\n').map(move |v| (name, v))
}

/// How a request was initiated by the governed page.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum RequestMode {
  /// Top-level page navigation
  Navigate,
  /// Anything a page loads on its own behalf (scripts, JSON, images)
  #[default]
  Subresource,
}

/// An outbound request from a governed page.
#[derive(Debug, Clone)]
pub struct Request {
  pub method: String,
  pub url: Url,
  pub headers: Headers,
  pub body: Bytes,
  pub mode: RequestMode,
}

impl Request {
  /// Create a GET request for a subresource.
  pub fn get(url: Url) -> Self {
    Self {
      method: "GET".to_string(),
      url,
      headers: Headers::new(),
      body: Bytes::new(),
      mode: RequestMode::Subresource,
    }
  }

  pub fn with_mode(mut self, mode: RequestMode) -> Self {
    self.mode = mode;
    self
  }

  pub fn with_header(mut self, name: &str, value: impl Into<String>) -> Self {
    self.headers.insert(name.to_ascii_lowercase(), value.into());
    self
  }

  pub fn path(&self) -> &str {
    self.url.path()
  }

  pub fn is_navigation(&self) -> bool {
    self.mode == RequestMode::Navigate
  }

  /// Whether this asks for part of the resource only.
  pub fn is_range(&self) -> bool {
    self.headers.contains_key("range")
  }

  /// Drop the page's cache validators so the upstream answers with a full body.
  pub fn without_conditionals(mut self) -> Self {
    self.headers.retain(|name, _| !CONDITIONAL_HEADERS.contains(&name.as_str()));
    self
  }
}

/// A response, either live from the network, replayed from a partition, or
/// synthesized locally.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Response {
  pub status: u16,
  pub status_text: String,
  pub headers: Headers,
  pub body: Bytes,
}

impl Response {
  pub fn new(status: u16, status_text: impl Into<String>) -> Self {
    Self {
      status,
      status_text: status_text.into(),
      headers: Headers::new(),
      body: Bytes::new(),
    }
  }

  pub fn with_header(mut self, name: &str, value: impl Into<String>) -> Self {
    self.headers.insert(name.to_ascii_lowercase(), value.into());
    self
  }

  pub fn with_body(mut self, body: impl Into<Bytes>) -> Self {
    self.body = body.into();
    self
  }

  /// A 200 response carrying a JSON document.
  pub fn json(value: &serde_json::Value) -> Self {
    Self::new(200, "OK")
      .with_header("content-type", "application/json")
      .with_body(value.to_string())
  }

  /// Minimal response for a static request that could not be served at all.
  pub fn service_unavailable() -> Self {
    Self::new(503, "Service Unavailable")
      .with_header("content-type", "text/plain")
      .with_body("Offline")
  }

  /// Whether the status is in the 2xx range.
  pub fn is_ok(&self) -> bool {
    (200..300).contains(&self.status)
  }

  /// Whether this response may be stored for `request`: a full 2xx body.
  /// Partial content never stands in for the whole resource.
  pub fn is_cacheable_for(&self, request: &Request) -> bool {
    self.is_ok() && self.status != 206 && !request.is_range()
  }

  pub fn header(&self, name: &str) -> Option<&str> {
    self
      .headers
      .get(&name.to_ascii_lowercase())
      .map(String::as_str)
  }

  /// Whether this response was synthesized by the fallback path.
  pub fn is_offline(&self) -> bool {
    self.header(OFFLINE_HEADER) == Some("true")
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_ok_range() {
    assert!(Response::new(200, "OK").is_ok());
    assert!(Response::new(204, "No Content").is_ok());
    assert!(!Response::new(304, "Not Modified").is_ok());
    assert!(!Response::new(500, "Internal Server Error").is_ok());
  }

  #[test]
  fn test_partial_content_is_not_cacheable() {
    let url = Url::parse("http://signage.test/static/media/adzan.mp3").unwrap();
    let full = Request::get(url.clone());
    let ranged = Request::get(url).with_header("Range", "bytes=0-2");

    assert!(Response::new(200, "OK").is_cacheable_for(&full));
    assert!(!Response::new(206, "Partial Content").is_cacheable_for(&full));
    assert!(!Response::new(200, "OK").is_cacheable_for(&ranged));
    assert!(!Response::new(404, "Not Found").is_cacheable_for(&full));
  }

  #[test]
  fn test_without_conditionals() {
    let request = Request::get(Url::parse("http://signage.test/api/settings").unwrap())
      .with_header("If-None-Match", "\"abc\"")
      .with_header("If-Modified-Since", "Sat, 07 Mar 2026 12:00:00 GMT")
      .with_header("Accept", "application/json")
      .without_conditionals();

    assert_eq!(request.headers.len(), 1);
    assert!(request.headers.contains_key("accept"));
  }

  #[test]
  fn test_repeated_headers_are_kept() {
    let mut headers = Headers::new();
    append_header(&mut headers, "Vary", "Accept");
    append_header(&mut headers, "vary", "Accept-Encoding");
    append_header(&mut headers, "Set-Cookie", "a=1");
    append_header(&mut headers, "Set-Cookie", "b=2");

    assert_eq!(headers["vary"], "Accept, Accept-Encoding");
    let cookies: Vec<_> = header_lines("set-cookie", &headers["set-cookie"]).collect();
    assert_eq!(cookies, vec![("set-cookie", "a=1"), ("set-cookie", "b=2")]);
  }

  #[test]
  fn test_header_lookup_is_case_insensitive() {
    let response = Response::new(200, "OK").with_header("Content-Type", "text/html");
    assert_eq!(response.header("content-type"), Some("text/html"));
    assert_eq!(response.header("CONTENT-TYPE"), Some("text/html"));
  }

  #[test]
  fn test_service_unavailable() {
    let response = Response::service_unavailable();
    assert_eq!(response.status, 503);
    assert_eq!(response.body.as_ref(), b"Offline");
    assert!(!response.is_offline());
  }
}
