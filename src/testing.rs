//! In-process network and fixtures for tests.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use crate::cache::SqliteStorage;
use crate::config::Config;
use crate::http::{Request, Response};
use crate::network::{FetchError, Network};
use crate::worker::Worker;

/// Network that answers from a route table keyed by URL path, with 304 for a
/// matching `if-none-match`.
pub struct MockNetwork {
  routes: Mutex<HashMap<String, Response>>,
  online: AtomicBool,
  calls: AtomicUsize,
}

impl MockNetwork {
  pub fn new() -> Self {
    Self {
      routes: Mutex::new(HashMap::new()),
      online: AtomicBool::new(true),
      calls: AtomicUsize::new(0),
    }
  }

  pub fn route(&self, path: &str, response: Response) {
    self
      .routes
      .lock()
      .unwrap()
      .insert(path.to_string(), response);
  }

  pub fn set_online(&self, online: bool) {
    self.online.store(online, Ordering::SeqCst);
  }

  pub fn calls(&self) -> usize {
    self.calls.load(Ordering::SeqCst)
  }
}

impl Network for MockNetwork {
  async fn fetch(&self, request: &Request) -> Result<Response, FetchError> {
    self.calls.fetch_add(1, Ordering::SeqCst);

    if !self.online.load(Ordering::SeqCst) {
      return Err(FetchError::Unreachable(request.url.to_string()));
    }

    let response = self.routes.lock().unwrap().get(request.url.path()).cloned();
    let Some(response) = response else {
      return Ok(Response::new(404, "Not Found"));
    };

    // Answer revalidation the way an HTTP server would
    let validator = request.headers.get("if-none-match").map(String::as_str);
    if validator.is_some() && validator == response.header("etag") {
      return Ok(Response::new(304, "Not Modified"));
    }
    Ok(response)
  }
}

pub fn test_config(version: &str) -> Config {
  Config {
    upstream: "http://signage.test".to_string(),
    version: version.to_string(),
    ..Config::default()
  }
}

/// Worker over in-memory storage with every default asset and endpoint routed.
pub fn test_worker(version: &str) -> Worker<SqliteStorage, MockNetwork> {
  let storage = Arc::new(SqliteStorage::open_in_memory().unwrap());
  worker_with_storage(version, storage)
}

/// Worker for `version` over shared storage, as after an upgrade.
pub fn worker_with_storage(
  version: &str,
  storage: Arc<SqliteStorage>,
) -> Worker<SqliteStorage, MockNetwork> {
  let config = test_config(version);
  let network = MockNetwork::new();
  for path in config.static_assets.iter().chain(&config.api_endpoints) {
    network.route(
      path,
      Response::new(200, "OK").with_body(format!("{} {}", version, path)),
    );
  }
  Worker::new(config, storage, network).unwrap()
}
