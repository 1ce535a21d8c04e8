mod cache;
mod classify;
mod commands;
mod config;
mod event;
mod fallback;
mod http;
mod lifecycle;
mod network;
mod server;
#[cfg(test)]
mod testing;
mod worker;

use clap::{Parser, Subcommand};
use color_eyre::{eyre::eyre, Result};
use serde_json::Value;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::info;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use cache::{PartitionStore, SqliteStorage};
use event::{dispatch, Event};
use http::{Request, RequestMode, Response};
use network::{HttpNetwork, Network};
use worker::{FetchOutcome, Worker};

#[derive(Parser, Debug)]
#[command(name = "signage-relay")]
#[command(about = "Offline-first caching intermediary for a mosque signage display")]
#[command(version)]
struct Args {
  /// Path to config file (default: $XDG_CONFIG_HOME/signage-relay/config.yaml)
  #[arg(short, long, global = true)]
  config: Option<PathBuf>,

  #[command(subcommand)]
  action: Action,
}

#[derive(Subcommand, Debug)]
enum Action {
  /// Bring the configured version into service and listen for the display
  Serve {
    /// Listen address (overrides config)
    #[arg(short, long)]
    listen: Option<String>,
  },
  /// Install and activate the configured version unless it is already active
  Install,
  /// Send one request through the worker and print the response
  Fetch {
    /// Path relative to the upstream, e.g. /api/prayer-times
    path: String,
    /// Treat the request as a page navigation
    #[arg(long)]
    navigate: bool,
    /// Print the status line and headers
    #[arg(short, long)]
    include: bool,
  },
  /// Post a command message, e.g. '{"type":"CACHE_UPDATE"}'
  Message { payload: String },
  /// Fire a background sync tag (default: the configured tag)
  Sync { tag: Option<String> },
  /// List partitions
  Partitions {
    /// Also list the keys in each partition
    #[arg(short, long)]
    keys: bool,
  },
  /// Print registration state as JSON
  Status,
}

/// Log to stderr, and to a daily file when a log directory is configured.
/// Use RUST_LOG to control the level (e.g. RUST_LOG=signage_relay=debug).
fn init_tracing(log_dir: Option<&Path>) -> Result<Option<WorkerGuard>> {
  let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

  let (file_layer, guard) = match log_dir {
    Some(dir) => {
      std::fs::create_dir_all(dir)
        .map_err(|e| eyre!("Failed to create log directory {}: {}", dir.display(), e))?;
      let appender = tracing_appender::rolling::daily(dir, "signage-relay.log");
      let (writer, guard) = tracing_appender::non_blocking(appender);
      (
        Some(fmt::layer().with_writer(writer).with_ansi(false)),
        Some(guard),
      )
    }
    None => (None, None),
  };

  tracing_subscriber::registry()
    .with(fmt::layer().with_writer(io::stderr))
    .with(file_layer)
    .with(filter)
    .init();

  Ok(guard)
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
  color_eyre::install()?;

  let args = Args::parse();

  // Load configuration
  let config = config::Config::load(args.config.as_deref())?;
  let _log_guard = init_tracing(config.log.dir.as_deref())?;

  let storage = Arc::new(SqliteStorage::open(config.storage.path.as_deref())?);
  let worker = Arc::new(Worker::new(config, storage, HttpNetwork::new()?)?);

  match args.action {
    Action::Serve { listen } => {
      event::start(&worker).await?;
      let addr = listen.unwrap_or_else(|| worker.config().listen.clone());
      server::serve(worker, &addr).await?;
    }
    Action::Install => {
      event::start(&worker).await?;
      print_json(&serde_json::to_value(worker.status()?)?)?;
    }
    Action::Fetch {
      path,
      navigate,
      include,
    } => {
      event::start(&worker).await?;
      let response = fetch(&worker, &path, navigate).await?;
      print_response(&response, include)?;
    }
    Action::Message { payload } => {
      let payload: Value = serde_json::from_str(&payload)
        .map_err(|e| eyre!("Failed to parse message payload: {}", e))?;
      event::start(&worker).await?;
      dispatch(&worker, Event::Message(payload)).await?;
    }
    Action::Sync { tag } => {
      event::start(&worker).await?;
      let tag = tag.unwrap_or_else(|| worker.config().sync.tag.clone());
      dispatch(&worker, Event::Sync(tag)).await?;
    }
    Action::Partitions { keys } => list_partitions(worker.storage(), keys)?,
    Action::Status => print_json(&serde_json::to_value(worker.status()?)?)?,
  }

  Ok(())
}

async fn fetch<S, N>(worker: &Worker<S, N>, path: &str, navigate: bool) -> Result<Response>
where
  S: PartitionStore,
  N: Network,
{
  let mode = if navigate {
    RequestMode::Navigate
  } else {
    RequestMode::Subresource
  };
  let request = Request::get(worker.resolve(path)?).with_mode(mode);

  match worker.on_fetch(request, None).await {
    FetchOutcome::Respond(result) => {
      info!(source = ?result.source, cached_at = ?result.cached_at, "fetched");
      Ok(result.data)
    }
    FetchOutcome::Passthrough(request) => Ok(worker.network().fetch(&request).await?),
  }
}

fn list_partitions<S: PartitionStore>(storage: &S, keys: bool) -> Result<()> {
  let mut out = io::stdout().lock();
  for name in storage.list_names()? {
    let entries = storage.keys(&name)?;
    writeln!(out, "{} ({} entries)", name, entries.len())?;
    if keys {
      for key in entries {
        writeln!(out, "  {}", key)?;
      }
    }
  }
  Ok(())
}

fn print_response(response: &Response, include: bool) -> Result<()> {
  let mut out = io::stdout().lock();
  if include {
    writeln!(out, "{} {}", response.status, response.status_text)?;
    for (name, value) in &response.headers {
      writeln!(out, "{}: {}", name, value)?;
    }
    writeln!(out)?;
  }
  out.write_all(&response.body)?;
  out.flush()?;
  Ok(())
}

fn print_json(value: &Value) -> Result<()> {
  println!("{}", serde_json::to_string_pretty(value)?);
  Ok(())
}
