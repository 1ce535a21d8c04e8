//! Retrieval strategies that orchestrate partition lookups with network fetching.

use chrono::Local;
use std::future::Future;
use std::sync::Arc;
use tracing::{debug, warn};

use super::storage::{CachedResponse, PartitionStore};
use super::traits::{CacheResult, Partitions, RequestKey};
use crate::fallback;
use crate::http::{Request, Response};
use crate::network::FetchError;

/// Cache layer that decides, per request, between partitions, the network and
/// a synthesized fallback.
///
/// Both strategies always produce a response; network and storage failures are
/// handled here and never reach the caller.
pub struct CacheLayer<S: PartitionStore> {
  storage: Arc<S>,
  partitions: Partitions,
  /// Cached pages offered to a navigation that cannot reach the network
  navigation_fallbacks: Vec<RequestKey>,
}

impl<S: PartitionStore> CacheLayer<S> {
  /// Create a new cache layer writing into `partitions`.
  pub fn new(storage: Arc<S>, partitions: Partitions) -> Self {
    Self {
      storage,
      partitions,
      navigation_fallbacks: Vec::new(),
    }
  }

  /// Set the pages tried, in order, for offline navigations.
  pub fn with_navigation_fallbacks(mut self, keys: Vec<RequestKey>) -> Self {
    self.navigation_fallbacks = keys;
    self
  }

  /// Network-first, used for API requests.
  ///
  /// 1. Fetch from network - if ok, store a copy in the API partition
  /// 2. On failure or non-ok status, replay any cached entry
  /// 3. Otherwise synthesize an offline placeholder (status 200)
  pub async fn network_first<F, Fut>(&self, request: &Request, fetcher: F) -> CacheResult<Response>
  where
    F: FnOnce() -> Fut,
    Fut: Future<Output = Result<Response, FetchError>>,
  {
    let key = RequestKey::from_request(request);

    let reachable = match fetcher().await {
      Ok(response) if response.is_ok() => {
        if response.is_cacheable_for(request) {
          self.store(&self.partitions.api, &key, &response);
        }
        return CacheResult::from_network(response);
      }
      Ok(response) => {
        debug!(key = %key, status = response.status, "upstream not ok, trying cache");
        true
      }
      Err(e) => {
        debug!(key = %key, error = %e, "network request failed, trying cache");
        false
      }
    };

    if let Some(cached) = self.lookup(&key) {
      return CacheResult::from_cache(cached.response, cached.cached_at).with_reachable(reachable);
    }

    debug!(key = %key, "no cached entry, serving offline placeholder");
    let response = fallback::offline_response(request.path(), &Local::now());
    CacheResult::fallback(response).with_reachable(reachable)
  }

  /// Cache-first, used for static assets.
  ///
  /// 1. Any partition hit is returned as-is, without revalidation
  /// 2. On a miss, fetch; full ok responses are stored in the runtime partition
  /// 3. If the network is down, navigations get a cached page and everything
  ///    else gets a 503
  pub async fn cache_first<F, Fut>(&self, request: &Request, fetcher: F) -> CacheResult<Response>
  where
    F: FnOnce() -> Fut,
    Fut: Future<Output = Result<Response, FetchError>>,
  {
    let key = RequestKey::from_request(request);

    if let Some(cached) = self.lookup(&key) {
      return CacheResult::from_cache(cached.response, cached.cached_at);
    }

    match fetcher().await {
      Ok(response) => {
        if response.is_cacheable_for(request) {
          self.store(&self.partitions.runtime, &key, &response);
        }
        CacheResult::from_network(response)
      }
      Err(e) => {
        debug!(key = %key, error = %e, "fetch failed");

        if request.is_navigation() {
          for fallback_key in &self.navigation_fallbacks {
            if let Some(cached) = self.lookup(fallback_key) {
              return CacheResult::from_cache(cached.response, cached.cached_at)
                .with_reachable(false);
            }
          }
        }

        CacheResult::unavailable(Response::service_unavailable())
      }
    }
  }

  /// Best-effort write; a failed put never prevents serving the response.
  fn store(&self, partition: &str, key: &RequestKey, response: &Response) {
    if let Err(e) = self.storage.put(partition, key, response) {
      warn!(partition, key = %key, error = %e, "failed to cache response");
    }
  }

  /// Lookup across all partitions; storage errors count as a miss.
  fn lookup(&self, key: &RequestKey) -> Option<CachedResponse> {
    match self.storage.match_request(key, None) {
      Ok(cached) => cached,
      Err(e) => {
        warn!(key = %key, error = %e, "cache lookup failed");
        None
      }
    }
  }
}

impl<S: PartitionStore> Clone for CacheLayer<S> {
  fn clone(&self) -> Self {
    Self {
      storage: Arc::clone(&self.storage),
      partitions: self.partitions.clone(),
      navigation_fallbacks: self.navigation_fallbacks.clone(),
    }
  }
}
