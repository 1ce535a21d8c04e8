//! Request classification.

use crate::http::Request;

/// What the worker does with a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Classification {
  /// Passed through untouched
  Ignored,
  /// Network-first against the API partition
  Api,
  /// Cache-first against the runtime partition
  Static,
}

/// Classify a request. Rules are checked in order and the first match wins.
pub fn classify(request: &Request, api_prefix: &str) -> Classification {
  if !request.method.eq_ignore_ascii_case("GET") {
    return Classification::Ignored;
  }

  if !matches!(request.url.scheme(), "http" | "https") {
    return Classification::Ignored;
  }

  if request.url.path().starts_with(api_prefix) {
    return Classification::Api;
  }

  Classification::Static
}
