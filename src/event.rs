use color_eyre::Result;
use serde_json::Value;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::{info, warn};

use crate::cache::PartitionStore;
use crate::http::Request;
use crate::network::Network;
use crate::worker::{FetchOutcome, Worker};

/// Events delivered to a worker by its host
#[derive(Debug)]
pub enum Event {
  /// A new version was registered
  Install,
  /// The waiting version may take over
  Activate,
  /// A governed page issued a request
  Fetch {
    request: Request,
    client_id: Option<String>,
  },
  /// A governed page posted a command message
  Message(Value),
  /// A background sync tag fired
  Sync(String),
}

/// Result of dispatching an event
#[derive(Debug)]
pub enum Outcome {
  Done,
  Fetch(FetchOutcome),
}

/// Deliver one event to the worker. Install and message events hand off to
/// activation when the waiting version asked to skip waiting.
pub async fn dispatch<S, N>(worker: &Worker<S, N>, event: Event) -> Result<Outcome>
where
  S: PartitionStore,
  N: Network,
{
  match event {
    Event::Install => {
      worker.on_install().await?;
      activate_if_ready(worker).await?;
    }
    Event::Activate => worker.on_activate().await?,
    Event::Fetch { request, client_id } => {
      let outcome = worker.on_fetch(request, client_id.as_deref()).await;
      return Ok(Outcome::Fetch(outcome));
    }
    Event::Message(payload) => {
      worker.on_message(&payload).await?;
      activate_if_ready(worker).await?;
    }
    Event::Sync(tag) => worker.on_sync(&tag).await,
  }
  Ok(Outcome::Done)
}

async fn activate_if_ready<S, N>(worker: &Worker<S, N>) -> Result<()>
where
  S: PartitionStore,
  N: Network,
{
  if worker.wants_activation() {
    worker.on_activate().await?;
  }
  Ok(())
}

/// Bring the worker's version into service: install and activate it unless it
/// is already the active version.
pub async fn start<S, N>(worker: &Worker<S, N>) -> Result<()>
where
  S: PartitionStore,
  N: Network,
{
  if worker.is_active() {
    info!(version = %worker.version(), "version already active");
    return Ok(());
  }

  dispatch(worker, Event::Install).await?;
  if !worker.is_active() {
    // Nothing else releases a waiting version on this host
    dispatch(worker, Event::Activate).await?;
  }
  Ok(())
}

/// Tracks upstream reachability as observed by intercepted requests.
#[derive(Debug, Default)]
pub struct Connectivity {
  offline: AtomicBool,
}

impl Connectivity {
  pub fn new() -> Self {
    Self::default()
  }

  /// Record one observation (`None` means the request said nothing about the
  /// upstream). Returns true when this observation restores connectivity.
  pub fn observe(&self, reachable: Option<bool>) -> bool {
    match reachable {
      Some(false) => {
        if !self.offline.swap(true, Ordering::SeqCst) {
          warn!("upstream unreachable, serving offline");
        }
        false
      }
      Some(true) => {
        let restored = self.offline.swap(false, Ordering::SeqCst);
        if restored {
          info!("upstream reachable again");
        }
        restored
      }
      None => false,
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::lifecycle::WorkerState;
  use crate::testing::test_worker;
  use serde_json::json;

  #[tokio::test]
  async fn test_start_installs_and_activates() {
    let worker = test_worker("v1");
    start(&worker).await.unwrap();

    assert_eq!(worker.state(), Some(WorkerState::Active));
    assert_eq!(
      worker.storage().active_version().unwrap().as_deref(),
      Some("v1")
    );
  }

  #[tokio::test]
  async fn test_start_twice_fetches_once() {
    let worker = test_worker("v1");
    start(&worker).await.unwrap();
    let calls = worker.network().calls();

    start(&worker).await.unwrap();
    assert_eq!(worker.network().calls(), calls);
  }

  #[tokio::test]
  async fn test_install_event_hands_off_to_activation() {
    let worker = test_worker("v1");
    let outcome = dispatch(&worker, Event::Install).await.unwrap();

    assert!(matches!(outcome, Outcome::Done));
    assert!(worker.is_active());
  }

  #[tokio::test]
  async fn test_fetch_event() {
    let worker = test_worker("v1");
    start(&worker).await.unwrap();

    let request = Request::get(worker.resolve("/manifest.json").unwrap());
    let outcome = dispatch(
      &worker,
      Event::Fetch {
        request,
        client_id: Some("screen-1".to_string()),
      },
    )
    .await
    .unwrap();

    match outcome {
      Outcome::Fetch(FetchOutcome::Respond(result)) => {
        assert_eq!(result.data.body.as_ref(), b"v1 /manifest.json");
      }
      other => panic!("unexpected outcome {:?}", other),
    }
  }

  #[tokio::test]
  async fn test_message_event() {
    let worker = test_worker("v1");
    start(&worker).await.unwrap();

    dispatch(&worker, Event::Message(json!({"type": "CLEAR_CACHE"})))
      .await
      .unwrap();
    assert!(worker.storage().list_names().unwrap().is_empty());

    dispatch(&worker, Event::Message(json!({"type": "SKIP_WAITING"})))
      .await
      .unwrap();
    assert!(worker.is_active());
  }

  #[test]
  fn test_connectivity_reports_restore_once() {
    let connectivity = Connectivity::new();
    assert!(!connectivity.observe(Some(true)));

    assert!(!connectivity.observe(Some(false)));
    assert!(!connectivity.observe(Some(false)));
    assert!(!connectivity.observe(None));

    assert!(connectivity.observe(Some(true)));
    assert!(!connectivity.observe(Some(true)));
  }
}
