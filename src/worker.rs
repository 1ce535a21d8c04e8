use chrono::{DateTime, Utc};
use color_eyre::{eyre::eyre, Result};
use serde::Serialize;
use serde_json::Value;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tracing::{debug, error, info, warn};
use url::Url;

use crate::cache::{CacheLayer, CacheResult, PartitionStore, Partitions, RequestKey};
use crate::classify::{classify, Classification};
use crate::commands::{self, Command};
use crate::config::Config;
use crate::http::{Request, Response};
use crate::lifecycle::{self, ClientRegistry, Registration, WorkerState};
use crate::network::Network;

/// What the worker did with an intercepted request.
#[derive(Debug)]
pub enum FetchOutcome {
  /// The worker produced the response
  Respond(CacheResult<Response>),
  /// Not handled by the worker; the host forwards the request untouched
  Passthrough(Request),
}

/// Snapshot of the registration and partitions.
#[derive(Debug, Serialize)]
pub struct StatusReport {
  pub version: String,
  pub state: Option<String>,
  pub state_changed_at: Option<DateTime<Utc>>,
  pub active_version: Option<String>,
  pub clients: usize,
  pub partitions: Vec<PartitionSummary>,
}

#[derive(Debug, Serialize)]
pub struct PartitionSummary {
  pub name: String,
  pub entries: usize,
  /// Belongs to this worker's version
  pub current: bool,
}

/// One version of the offline worker.
///
/// Owns the partition names for its version and exposes one entry point per
/// event kind: install, activate, fetch, message and sync.
pub struct Worker<S: PartitionStore, N: Network> {
  config: Config,
  origin: Url,
  storage: Arc<S>,
  network: N,
  partitions: Partitions,
  cache: CacheLayer<S>,
  static_requests: Vec<Request>,
  api_requests: Vec<Request>,
  sync_request: Request,
  registration: Mutex<Registration>,
  clients: Mutex<ClientRegistry>,
}

impl<S: PartitionStore, N: Network> Worker<S, N> {
  pub fn new(config: Config, storage: Arc<S>, network: N) -> Result<Self> {
    let origin = config.upstream_url()?;
    let partitions = Partitions::for_version(&config.partition_prefix, &config.version);

    let navigation_fallbacks = config
      .navigation_fallbacks
      .iter()
      .map(|path| Ok(RequestKey::new("GET", &resolve(&origin, path)?)))
      .collect::<Result<Vec<_>>>()?;

    // Pre-warm bypasses intermediary caches
    let static_requests = config
      .static_assets
      .iter()
      .map(|path| Ok(Request::get(resolve(&origin, path)?).with_header("cache-control", "no-cache")))
      .collect::<Result<Vec<_>>>()?;

    let api_requests = config
      .api_endpoints
      .iter()
      .map(|path| Ok(Request::get(resolve(&origin, path)?)))
      .collect::<Result<Vec<_>>>()?;

    let sync_request = Request::get(resolve(&origin, &config.sync.endpoint)?);

    let active = storage.active_version()?;
    let cache = CacheLayer::new(Arc::clone(&storage), partitions.clone())
      .with_navigation_fallbacks(navigation_fallbacks);

    Ok(Self {
      config,
      origin,
      storage,
      network,
      partitions,
      cache,
      static_requests,
      api_requests,
      sync_request,
      registration: Mutex::new(Registration::new(active.as_deref())),
      clients: Mutex::new(ClientRegistry::new()),
    })
  }

  pub fn version(&self) -> &str {
    &self.config.version
  }

  pub fn config(&self) -> &Config {
    &self.config
  }

  pub fn partitions(&self) -> &Partitions {
    &self.partitions
  }

  pub fn storage(&self) -> &S {
    &self.storage
  }

  pub fn network(&self) -> &N {
    &self.network
  }

  /// Resolve a path (with optional query) against the upstream origin.
  pub fn resolve(&self, path: &str) -> Result<Url> {
    resolve(&self.origin, path)
  }

  fn registration(&self) -> MutexGuard<'_, Registration> {
    self
      .registration
      .lock()
      .unwrap_or_else(PoisonError::into_inner)
  }

  fn clients(&self) -> MutexGuard<'_, ClientRegistry> {
    self.clients.lock().unwrap_or_else(PoisonError::into_inner)
  }

  /// Lifecycle state of this worker's version.
  pub fn state(&self) -> Option<WorkerState> {
    self.registration().state_of(self.version())
  }

  pub fn is_active(&self) -> bool {
    self.registration().active_version() == Some(self.version())
  }

  /// Whether a waiting version should be activated now.
  pub fn wants_activation(&self) -> bool {
    self.registration().ready_to_activate()
  }

  /// Install: open the static partition, pre-warm it, then skip waiting.
  pub async fn on_install(&self) -> Result<()> {
    if self.is_active() {
      debug!(version = %self.version(), "already active, nothing to install");
      return Ok(());
    }

    info!(version = %self.version(), "installing");
    self.registration().begin_install(self.version());

    if let Err(e) = self.storage.open(&self.partitions.static_assets) {
      self.registration().install_failed();
      return Err(e);
    }

    let report = lifecycle::prewarm(
      &*self.storage,
      &self.network,
      &self.partitions.static_assets,
      &self.static_requests,
    )
    .await;
    info!(
      version = %self.version(),
      cached = report.cached,
      failed = report.failed,
      "static assets pre-warmed"
    );

    let mut registration = self.registration();
    registration.install_complete();
    registration.skip_waiting();
    debug!(version = %self.version(), "skip waiting");

    Ok(())
  }

  /// Activate: purge partitions of other versions and claim every client.
  pub async fn on_activate(&self) -> Result<()> {
    let Some(version) = self.registration().begin_activate() else {
      debug!("no waiting version to activate");
      return Ok(());
    };

    info!(version = %version, "activating");
    let purged = lifecycle::purge_stale(&*self.storage, &self.partitions);

    if let Err(e) = self.storage.set_active_version(&version) {
      warn!(version = %version, error = %e, "failed to record active version");
    }
    self.registration().finish_activate();

    let claimed = self.clients().claim(&version);
    info!(version = %version, claimed, "activated");

    purged.map(|deleted| debug!(version = %version, deleted = deleted.len(), "stale partitions purged"))
  }

  /// Fetch: answer an intercepted request, or hand it back for passthrough.
  pub async fn on_fetch(&self, request: Request, client_id: Option<&str>) -> FetchOutcome {
    let classification = classify(&request, &self.config.api_prefix);
    if classification == Classification::Ignored || !self.controls(client_id) {
      return FetchOutcome::Passthrough(request);
    }
    let request = request.without_conditionals();

    let result = if classification == Classification::Api {
      self
        .cache
        .network_first(&request, || self.network.fetch(&request))
        .await
    } else {
      self
        .cache
        .cache_first(&request, || self.network.fetch(&request))
        .await
    };

    debug!(
      url = %request.url,
      source = ?result.source,
      status = result.data.status,
      "served"
    );
    FetchOutcome::Respond(result)
  }

  /// Whether this version governs requests from `client_id`. Requests without
  /// a client are governed whenever this version is active.
  fn controls(&self, client_id: Option<&str>) -> bool {
    let active = self.registration().active_version().map(str::to_string);

    let controller = match client_id {
      Some(id) => self
        .clients()
        .observe(id, active.as_deref())
        .map(str::to_string),
      None => active,
    };

    controller.as_deref() == Some(self.version())
  }

  /// Message: run a command posted by a governed page.
  pub async fn on_message(&self, payload: &Value) -> Result<()> {
    let command = Command::parse(payload);
    info!(command = ?command, "message received");

    match command {
      Command::SkipWaiting => self.registration().skip_waiting(),
      Command::CacheUpdate => {
        commands::update_partition(
          &*self.storage,
          &self.network,
          &self.partitions.api,
          &self.api_requests,
        )
        .await;
      }
      Command::ClearCache => {
        commands::clear_all(&*self.storage)?;
      }
      Command::Unknown => debug!(payload = %payload, "ignoring unknown message"),
    }

    Ok(())
  }

  /// Sync: refresh the designated endpoint when the configured tag fires.
  /// Failures are logged, never returned.
  pub async fn on_sync(&self, tag: &str) {
    if tag != self.config.sync.tag {
      debug!(tag, "ignoring sync tag");
      return;
    }

    match commands::resync(
      &*self.storage,
      &self.network,
      &self.partitions.api,
      &self.sync_request,
    )
    .await
    {
      Ok(()) => info!(tag, url = %self.sync_request.url, "synced"),
      Err(e) => error!(tag, error = %e, "sync failed"),
    }
  }

  pub fn status(&self) -> Result<StatusReport> {
    let partitions = self
      .storage
      .list_names()?
      .into_iter()
      .map(|name| {
        Ok(PartitionSummary {
          entries: self.storage.keys(&name)?.len(),
          current: self.partitions.contains(&name),
          name,
        })
      })
      .collect::<Result<Vec<_>>>()?;

    let clients = self.clients().len();
    let registration = self.registration();

    let current = registration.find(self.version());

    Ok(StatusReport {
      version: self.version().to_string(),
      state: current.map(|w| w.state.to_string()),
      state_changed_at: current.map(|w| w.state_changed_at),
      active_version: registration.active_version().map(str::to_string),
      clients,
      partitions,
    })
  }
}

/// Resolve `path` against the upstream origin. Scheme-relative and absolute
/// targets that name another origin are rejected.
fn resolve(origin: &Url, path: &str) -> Result<Url> {
  let url = origin
    .join(path)
    .map_err(|e| eyre!("Invalid path {}: {}", path, e))?;

  if url.origin() != origin.origin() {
    return Err(eyre!("Path {} leaves the upstream origin", path));
  }
  Ok(url)
}
