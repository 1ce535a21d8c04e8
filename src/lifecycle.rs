//! Worker version lifecycle: install, waiting, activation, retirement.
//!
//! ```text
//! Registration
//!     ├── installing (WorkerVersion)
//!     ├── waiting    (WorkerVersion)
//!     ├── active     (WorkerVersion)
//!     └── redundant  (retired versions)
//! ```

use chrono::{DateTime, Utc};
use color_eyre::Result;
use futures::future::join_all;
use std::collections::HashMap;
use std::fmt;
use tracing::{debug, info, warn};

use crate::cache::{PartitionStore, Partitions, RequestKey};
use crate::http::Request;
use crate::network::Network;

/// Worker version state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerState {
  /// Pre-warming the static partition
  Installing,
  /// Installed, waiting for activation
  Waiting,
  /// Purging stale partitions
  Activating,
  /// Active and serving requests
  Active,
  /// Replaced by a newer version or failed to install
  Redundant,
}

impl fmt::Display for WorkerState {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self {
      WorkerState::Installing => write!(f, "installing"),
      WorkerState::Waiting => write!(f, "waiting"),
      WorkerState::Activating => write!(f, "activating"),
      WorkerState::Active => write!(f, "active"),
      WorkerState::Redundant => write!(f, "redundant"),
    }
  }
}

/// One version of the worker and where it is in its lifecycle.
#[derive(Debug, Clone)]
pub struct WorkerVersion {
  pub version: String,
  pub state: WorkerState,
  pub state_changed_at: DateTime<Utc>,
}

impl WorkerVersion {
  fn new(version: &str, state: WorkerState) -> Self {
    Self {
      version: version.to_string(),
      state,
      state_changed_at: Utc::now(),
    }
  }

  fn set_state(&mut self, state: WorkerState) {
    self.state = state;
    self.state_changed_at = Utc::now();
  }
}

/// The versions known to this host. Several can coexist during an upgrade.
#[derive(Debug, Default)]
pub struct Registration {
  installing: Option<WorkerVersion>,
  waiting: Option<WorkerVersion>,
  active: Option<WorkerVersion>,
  redundant: Vec<WorkerVersion>,
  skip_waiting: bool,
}

impl Registration {
  /// Seed the registration with the version that was active before start-up.
  pub fn new(active_version: Option<&str>) -> Self {
    Self {
      active: active_version.map(|v| WorkerVersion::new(v, WorkerState::Active)),
      ..Self::default()
    }
  }

  pub fn active_version(&self) -> Option<&str> {
    self.active.as_ref().map(|w| w.version.as_str())
  }

  /// The most recent record of `version`, if the registration knows it.
  pub fn find(&self, version: &str) -> Option<&WorkerVersion> {
    [&self.installing, &self.waiting, &self.active]
      .into_iter()
      .flatten()
      .chain(self.redundant.iter().rev())
      .find(|w| w.version == version)
  }

  pub fn state_of(&self, version: &str) -> Option<WorkerState> {
    self.find(version).map(|w| w.state)
  }

  pub fn begin_install(&mut self, version: &str) {
    if let Some(mut previous) = self.installing.take() {
      previous.set_state(WorkerState::Redundant);
      self.redundant.push(previous);
    }
    self.installing = Some(WorkerVersion::new(version, WorkerState::Installing));
  }

  /// Transition installing to waiting. A version already waiting is replaced.
  pub fn install_complete(&mut self) {
    if let Some(mut worker) = self.installing.take() {
      worker.set_state(WorkerState::Waiting);
      if let Some(mut replaced) = self.waiting.replace(worker) {
        replaced.set_state(WorkerState::Redundant);
        self.redundant.push(replaced);
      }
    }
  }

  pub fn install_failed(&mut self) {
    if let Some(mut worker) = self.installing.take() {
      worker.set_state(WorkerState::Redundant);
      self.redundant.push(worker);
    }
  }

  /// Request activation of the waiting version without waiting for clients.
  pub fn skip_waiting(&mut self) {
    self.skip_waiting = true;
  }

  pub fn ready_to_activate(&self) -> bool {
    self.skip_waiting && self.waiting.is_some()
  }

  /// Mark the waiting version as activating and return its version.
  pub fn begin_activate(&mut self) -> Option<String> {
    let worker = self.waiting.as_mut()?;
    worker.set_state(WorkerState::Activating);
    Some(worker.version.clone())
  }

  /// Promote the activating version; the previously active one becomes redundant.
  pub fn finish_activate(&mut self) {
    let Some(mut worker) = self.waiting.take() else {
      return;
    };
    worker.set_state(WorkerState::Active);
    if let Some(mut old) = self.active.replace(worker) {
      old.set_state(WorkerState::Redundant);
      self.redundant.push(old);
    }
    self.skip_waiting = false;
  }
}

/// Upper bound on remembered clients; the least recently seen is forgotten.
const MAX_CLIENTS: usize = 1024;

#[derive(Debug)]
struct Client {
  controller: Option<String>,
  last_seen: u64,
}

/// Governed pages and the version controlling each.
#[derive(Debug)]
pub struct ClientRegistry {
  clients: HashMap<String, Client>,
  capacity: usize,
  clock: u64,
}

impl Default for ClientRegistry {
  fn default() -> Self {
    Self::with_capacity(MAX_CLIENTS)
  }
}

impl ClientRegistry {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn with_capacity(capacity: usize) -> Self {
    Self {
      clients: HashMap::new(),
      capacity: capacity.max(1),
      clock: 0,
    }
  }

  /// Record a client. A new client is controlled by `active`, if any; a known
  /// client keeps its controller until the next claim. Returns the controller.
  pub fn observe(&mut self, client_id: &str, active: Option<&str>) -> Option<&str> {
    self.clock += 1;
    if !self.clients.contains_key(client_id) && self.clients.len() >= self.capacity {
      self.evict_oldest();
    }

    let clock = self.clock;
    let client = self
      .clients
      .entry(client_id.to_string())
      .or_insert_with(|| Client {
        controller: active.map(str::to_string),
        last_seen: clock,
      });
    client.last_seen = clock;
    client.controller.as_deref()
  }

  fn evict_oldest(&mut self) {
    let oldest = self
      .clients
      .iter()
      .min_by_key(|(_, client)| client.last_seen)
      .map(|(id, _)| id.clone());
    if let Some(id) = oldest {
      debug!(client = %id, "forgetting idle client");
      self.clients.remove(&id);
    }
  }

  /// Take control of every known client. Returns how many changed controller.
  pub fn claim(&mut self, version: &str) -> usize {
    let mut changed = 0;
    for client in self.clients.values_mut() {
      if client.controller.as_deref() != Some(version) {
        client.controller = Some(version.to_string());
        changed += 1;
      }
    }
    changed
  }

  pub fn len(&self) -> usize {
    self.clients.len()
  }
}

/// Outcome of pre-warming a partition.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PrewarmReport {
  pub cached: usize,
  pub failed: usize,
}

/// Fetch every request concurrently and store ok responses in `partition`.
/// Individual failures are logged and skipped.
pub async fn prewarm<S, N>(
  storage: &S,
  network: &N,
  partition: &str,
  requests: &[Request],
) -> PrewarmReport
where
  S: PartitionStore,
  N: Network,
{
  let results = join_all(requests.iter().map(|request| async move {
    let key = RequestKey::from_request(request);
    match network.fetch(request).await {
      Ok(response) if response.is_cacheable_for(request) => match storage.put(partition, &key, &response) {
        Ok(()) => true,
        Err(e) => {
          warn!(key = %key, error = %e, "failed to store pre-warmed asset");
          false
        }
      },
      Ok(response) => {
        warn!(key = %key, status = response.status, "asset not cached");
        false
      }
      Err(e) => {
        warn!(key = %key, error = %e, "asset not cached");
        false
      }
    }
  }))
  .await;

  let cached = results.iter().filter(|ok| **ok).count();
  PrewarmReport {
    cached,
    failed: results.len() - cached,
  }
}

/// Delete every partition that is not one of `keep`. Returns the deleted names.
pub fn purge_stale<S: PartitionStore>(storage: &S, keep: &Partitions) -> Result<Vec<String>> {
  let mut deleted = Vec::new();

  for name in storage.list_names()? {
    if keep.contains(&name) {
      continue;
    }
    match storage.delete(&name) {
      Ok(_) => {
        info!(partition = %name, "deleted stale partition");
        deleted.push(name);
      }
      Err(e) => warn!(partition = %name, error = %e, "failed to delete stale partition"),
    }
  }

  debug!(count = deleted.len(), "purge complete");
  Ok(deleted)
}
