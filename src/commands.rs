//! Out-of-band commands from the foreground pages and the background sync trigger.

use color_eyre::{eyre::eyre, Result};
use futures::future::join_all;
use serde::Deserialize;
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::cache::{PartitionStore, RequestKey};
use crate::http::Request;
use crate::network::Network;

/// A message posted by a governed page, tagged by its `type` field.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Command {
  /// Activate the waiting version now
  SkipWaiting,
  /// Re-fetch every API endpoint into the API partition
  CacheUpdate,
  /// Delete every partition of every version
  ClearCache,
  /// Any other message type; ignored
  #[serde(other)]
  Unknown,
}

impl Command {
  /// Interpret a message payload. Anything without a recognised `type` is
  /// [`Command::Unknown`].
  pub fn parse(payload: &Value) -> Command {
    Command::deserialize(payload).unwrap_or(Command::Unknown)
  }
}

/// Re-fetch each request and overwrite its entry in `partition`. Failures are
/// swallowed; returns how many entries were refreshed.
pub async fn update_partition<S, N>(
  storage: &S,
  network: &N,
  partition: &str,
  requests: &[Request],
) -> usize
where
  S: PartitionStore,
  N: Network,
{
  let results = join_all(requests.iter().map(|request| async move {
    let key = RequestKey::from_request(request);
    match network.fetch(request).await {
      Ok(response) if response.is_cacheable_for(request) => {
        match storage.put(partition, &key, &response) {
          Ok(()) => true,
          Err(e) => {
            warn!(partition, key = %key, error = %e, "failed to store updated entry");
            false
          }
        }
      }
      Ok(response) => {
        debug!(key = %key, status = response.status, "update skipped");
        false
      }
      Err(e) => {
        debug!(key = %key, error = %e, "update skipped");
        false
      }
    }
  }))
  .await;

  let refreshed = results.into_iter().filter(|ok| *ok).count();
  info!(refreshed, total = requests.len(), "cache updated");
  refreshed
}

/// Delete every partition regardless of version. Returns how many were deleted.
pub fn clear_all<S: PartitionStore>(storage: &S) -> Result<usize> {
  let names = storage.list_names()?;
  let mut deleted = 0;
  for name in &names {
    if storage.delete(name)? {
      deleted += 1;
    }
  }
  info!(deleted, "all caches cleared");
  Ok(deleted)
}

/// Re-fetch a single request and overwrite its entry in `partition`.
pub async fn resync<S, N>(storage: &S, network: &N, partition: &str, request: &Request) -> Result<()>
where
  S: PartitionStore,
  N: Network,
{
  let response = network
    .fetch(request)
    .await
    .map_err(|e| eyre!("Sync fetch of {} failed: {}", request.url, e))?;

  if !response.is_cacheable_for(request) {
    return Err(eyre!(
      "Sync fetch of {} returned {}",
      request.url,
      response.status
    ));
  }

  storage.put(partition, &RequestKey::from_request(request), &response)
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::cache::SqliteStorage;
  use crate::http::Response;
  use crate::testing::MockNetwork;
  use serde_json::json;
  use url::Url;

  fn requests(paths: &[&str]) -> Vec<Request> {
    let base = Url::parse("http://signage.test").unwrap();
    paths
      .iter()
      .map(|p| Request::get(base.join(p).unwrap()))
      .collect()
  }

  #[test]
  fn test_parse_known_commands() {
    assert_eq!(Command::parse(&json!({"type": "SKIP_WAITING"})), Command::SkipWaiting);
    assert_eq!(Command::parse(&json!({"type": "CACHE_UPDATE"})), Command::CacheUpdate);
    assert_eq!(Command::parse(&json!({"type": "CLEAR_CACHE"})), Command::ClearCache);
  }

  #[test]
  fn test_parse_tolerates_extra_fields() {
    let payload = json!({"type": "CLEAR_CACHE", "reason": "admin"});
    assert_eq!(Command::parse(&payload), Command::ClearCache);
  }

  #[test]
  fn test_parse_unknown() {
    assert_eq!(Command::parse(&json!({"type": "REBOOT"})), Command::Unknown);
    assert_eq!(Command::parse(&json!({"kind": "CLEAR_CACHE"})), Command::Unknown);
    assert_eq!(Command::parse(&json!("CLEAR_CACHE")), Command::Unknown);
  }

  #[tokio::test]
  async fn test_update_swallows_failures() {
    let storage = SqliteStorage::open_in_memory().unwrap();
    let network = MockNetwork::new();
    network.route("/api/settings", Response::new(200, "OK").with_body("{}"));
    network.route("/api/weather", Response::new(503, "Service Unavailable"));

    let refreshed = update_partition(
      &storage,
      &network,
      "mosque-api-v1",
      &requests(&["/api/settings", "/api/weather", "/api/unknown"]),
    )
    .await;

    assert_eq!(refreshed, 1);
    assert_eq!(storage.keys("mosque-api-v1").unwrap().len(), 1);
  }

  #[tokio::test]
  async fn test_update_survives_storage_write_failure() {
    let storage = SqliteStorage::open_in_memory().unwrap();
    storage.reject_entry_writes().unwrap();
    let network = MockNetwork::new();
    network.route("/api/settings", Response::new(200, "OK").with_body("{}"));

    let refreshed = update_partition(
      &storage,
      &network,
      "mosque-api-v1",
      &requests(&["/api/settings"]),
    )
    .await;

    assert_eq!(refreshed, 0);
    assert_eq!(network.calls(), 1);
  }

  #[tokio::test]
  async fn test_update_skips_partial_content() {
    let storage = SqliteStorage::open_in_memory().unwrap();
    let network = MockNetwork::new();
    network.route("/api/quran-verses", Response::new(206, "Partial Content").with_body("[{"));

    let refreshed = update_partition(
      &storage,
      &network,
      "mosque-api-v1",
      &requests(&["/api/quran-verses"]),
    )
    .await;

    assert_eq!(refreshed, 0);
    assert!(storage.list_names().unwrap().is_empty());
  }

  #[test]
  fn test_clear_all() {
    let storage = SqliteStorage::open_in_memory().unwrap();
    storage.open("mosque-static-v1").unwrap();
    storage.open("mosque-api-v2").unwrap();
    storage.open("legacy").unwrap();

    assert_eq!(clear_all(&storage).unwrap(), 3);
    assert!(storage.list_names().unwrap().is_empty());
  }

  #[tokio::test]
  async fn test_resync_reports_failure() {
    let storage = SqliteStorage::open_in_memory().unwrap();
    let network = MockNetwork::new();
    network.set_online(false);

    let request = &requests(&["/api/prayer-times"])[0];
    assert!(resync(&storage, &network, "mosque-api-v1", request).await.is_err());
    assert!(storage.list_names().unwrap().is_empty());
  }
}
