//! Core types for the partition cache.

use chrono::{DateTime, Utc};
use sha2::{Digest, Sha256};
use std::fmt;
use url::Url;

use crate::http::Request;

/// Normalized identity of a cached request: upper-cased method plus the full
/// URL including its query. Fragments never reach the network, so they are
/// dropped.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RequestKey {
  method: String,
  url: String,
}

impl RequestKey {
  pub fn new(method: &str, url: &Url) -> Self {
    let mut url = url.clone();
    url.set_fragment(None);
    Self {
      method: method.to_ascii_uppercase(),
      url: url.into(),
    }
  }

  pub fn from_request(request: &Request) -> Self {
    Self::new(&request.method, &request.url)
  }

  /// Rebuild a key from stored columns.
  pub(crate) fn from_parts(method: String, url: String) -> Self {
    Self { method, url }
  }

  pub fn method(&self) -> &str {
    &self.method
  }

  pub fn url(&self) -> &str {
    &self.url
  }

  /// SHA256 hash for stable, fixed-length storage keys.
  pub fn hash(&self) -> String {
    let mut hasher = Sha256::new();
    hasher.update(self.method.as_bytes());
    hasher.update(b" ");
    hasher.update(self.url.as_bytes());
    hex::encode(hasher.finalize())
  }
}

impl fmt::Display for RequestKey {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "{} {}", self.method, self.url)
  }
}

/// The three partitions owned by one worker version.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Partitions {
  /// Shell pages and bundles, pre-warmed at install
  pub static_assets: String,
  /// Static requests cached on first use
  pub runtime: String,
  /// API responses from network-first requests
  pub api: String,
}

impl Partitions {
  /// Partition names for `version`, e.g. `mosque-api-v1.0.0`.
  pub fn for_version(prefix: &str, version: &str) -> Self {
    Self {
      static_assets: format!("{}-static-{}", prefix, version),
      runtime: format!("{}-runtime-{}", prefix, version),
      api: format!("{}-api-{}", prefix, version),
    }
  }

  pub fn names(&self) -> [&str; 3] {
    [&self.static_assets, &self.runtime, &self.api]
  }

  /// Whether `name` is one of this version's partitions.
  pub fn contains(&self, name: &str) -> bool {
    self.names().contains(&name)
  }
}

/// Result from a retrieval strategy, including data and metadata about the source.
#[derive(Debug, Clone)]
pub struct CacheResult<T> {
  /// The actual data
  pub data: T,
  /// Where the data came from
  pub source: CacheSource,
  /// When the data was cached (if from cache)
  pub cached_at: Option<DateTime<Utc>>,
  /// Whether the upstream answered; `None` when no fetch was attempted
  pub reachable: Option<bool>,
}

impl<T> CacheResult<T> {
  /// Create a new result from fresh network data.
  pub fn from_network(data: T) -> Self {
    Self {
      data,
      source: CacheSource::Network,
      cached_at: None,
      reachable: Some(true),
    }
  }

  /// Create a new result from a partition entry.
  pub fn from_cache(data: T, cached_at: DateTime<Utc>) -> Self {
    Self {
      data,
      source: CacheSource::Cache,
      cached_at: Some(cached_at),
      reachable: None,
    }
  }

  /// Create a new result from a synthesized placeholder.
  pub fn fallback(data: T) -> Self {
    Self {
      data,
      source: CacheSource::Fallback,
      cached_at: None,
      reachable: None,
    }
  }

  /// Create a new result for a request nothing could serve.
  pub fn unavailable(data: T) -> Self {
    Self {
      data,
      source: CacheSource::Unavailable,
      cached_at: None,
      reachable: Some(false),
    }
  }

  /// Record whether the upstream answered while producing this result.
  pub fn with_reachable(mut self, reachable: bool) -> Self {
    self.reachable = Some(reachable);
    self
  }
}

/// Indicates where a response came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheSource {
  /// Live response from the upstream
  Network,
  /// Replayed from a partition
  Cache,
  /// Synthesized placeholder
  Fallback,
  /// Nothing available; synthetic 503
  Unavailable,
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_key_normalization() {
    let url = Url::parse("http://signage.test/api/weather?city=malang#top").unwrap();
    let key = RequestKey::new("get", &url);
    assert_eq!(key.method(), "GET");
    assert_eq!(key.url(), "http://signage.test/api/weather?city=malang");
  }

  #[test]
  fn test_query_is_part_of_identity() {
    let a = Url::parse("http://signage.test/api/weather?city=malang").unwrap();
    let b = Url::parse("http://signage.test/api/weather?city=batu").unwrap();
    assert_ne!(RequestKey::new("GET", &a).hash(), RequestKey::new("GET", &b).hash());
  }

  #[test]
  fn test_hash_is_stable() {
    let url = Url::parse("http://signage.test/display").unwrap();
    let hash = RequestKey::new("GET", &url).hash();
    assert_eq!(hash.len(), 64);
    assert_eq!(hash, RequestKey::new("GET", &url).hash());
  }

  #[test]
  fn test_partition_names() {
    let partitions = Partitions::for_version("mosque", "v2");
    assert_eq!(partitions.static_assets, "mosque-static-v2");
    assert_eq!(partitions.runtime, "mosque-runtime-v2");
    assert_eq!(partitions.api, "mosque-api-v2");
    assert!(partitions.contains("mosque-api-v2"));
    assert!(!partitions.contains("mosque-api-v1"));
  }
}
