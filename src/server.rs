//! Local HTTP/1.1 intermediary.
//!
//! The display pages point at this listener instead of the upstream. Every
//! request becomes a fetch event for the worker; requests the worker does not
//! govern are forwarded upstream unchanged. Requests under `/__relay/` are
//! control calls: command messages, sync triggers and status.

use bytes::{Bytes, BytesMut};
use color_eyre::{eyre::eyre, Result};
use serde::Deserialize;
use serde_json::Value;
use std::fmt::Display;
use std::net::SocketAddr;
use std::sync::Arc;
use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, error, info, warn};

use crate::cache::PartitionStore;
use crate::event::{dispatch, Connectivity, Event, Outcome};
use crate::http::{append_header, header_lines, Headers, Request, RequestMode, Response};
use crate::network::{is_hop_by_hop, Network};
use crate::worker::{FetchOutcome, Worker};

/// Maximum size of a buffered request (8 MiB).
const MAX_REQUEST_SIZE: usize = 8 * 1024 * 1024;

/// Initial read buffer capacity per connection.
const INITIAL_BUF_SIZE: usize = 4096;

const MAX_HEADERS: usize = 64;

/// Path prefix reserved for control calls.
const CONTROL_PREFIX: &str = "/__relay/";

/// Header a page may set to identify itself as a client.
const CLIENT_ID_HEADER: &str = "x-client-id";

#[derive(Debug, Error)]
enum ParseError {
  #[error("malformed request: {0}")]
  Malformed(#[from] httparse::Error),

  #[error("invalid content-length")]
  InvalidContentLength,

  #[error("request body too large")]
  TooLarge,
}

/// A request as read off the socket.
#[derive(Debug)]
struct Incoming {
  method: String,
  target: String,
  headers: Headers,
  body: Bytes,
  keep_alive: bool,
}

#[derive(Debug, Deserialize)]
struct SyncTrigger {
  tag: String,
}

/// Bind `addr` and serve until the process ends.
pub async fn serve<S, N>(worker: Arc<Worker<S, N>>, addr: &str) -> Result<()>
where
  S: PartitionStore + 'static,
  N: Network + 'static,
{
  let listener = TcpListener::bind(addr)
    .await
    .map_err(|e| eyre!("Failed to bind to {}: {}", addr, e))?;
  run(listener, worker).await
}

/// Accept connections on an already bound listener.
pub async fn run<S, N>(listener: TcpListener, worker: Arc<Worker<S, N>>) -> Result<()>
where
  S: PartitionStore + 'static,
  N: Network + 'static,
{
  let local_addr = listener.local_addr()?;
  info!(address = %local_addr, version = %worker.version(), "listening");

  let connectivity = Arc::new(Connectivity::new());

  loop {
    let (stream, peer) = match listener.accept().await {
      Ok(pair) => pair,
      Err(e) => {
        error!(error = %e, "failed to accept connection");
        continue;
      }
    };

    debug!(peer = %peer, "connection accepted");
    let worker = Arc::clone(&worker);
    let connectivity = Arc::clone(&connectivity);

    tokio::spawn(async move {
      if let Err(e) = handle_connection(stream, peer, worker, connectivity).await {
        warn!(peer = %peer, error = %e, "connection closed with error");
      }
    });
  }
}

async fn handle_connection<S, N>(
  mut stream: TcpStream,
  peer: SocketAddr,
  worker: Arc<Worker<S, N>>,
  connectivity: Arc<Connectivity>,
) -> std::io::Result<()>
where
  S: PartitionStore + 'static,
  N: Network + 'static,
{
  let mut buf = BytesMut::with_capacity(INITIAL_BUF_SIZE);

  loop {
    if stream.read_buf(&mut buf).await? == 0 {
      debug!(peer = %peer, "connection closed by peer");
      return Ok(());
    }

    if buf.len() > MAX_REQUEST_SIZE {
      warn!(peer = %peer, "request too large");
      let response = Response::new(413, "Payload Too Large").with_body("Request entity too large");
      write_response(&mut stream, &response, false).await?;
      return Ok(());
    }

    // Pipelined requests are answered in order
    loop {
      let (incoming, consumed) = match parse_request(&buf) {
        Ok(Some(parsed)) => parsed,
        Ok(None) => break,
        Err(e) => {
          warn!(peer = %peer, error = %e, "bad request");
          let response = match e {
            ParseError::TooLarge => Response::new(413, "Payload Too Large"),
            _ => Response::new(400, "Bad Request"),
          }
          .with_body(e.to_string());
          write_response(&mut stream, &response, false).await?;
          return Ok(());
        }
      };
      let _ = buf.split_to(consumed);

      let keep_alive = incoming.keep_alive;
      debug!(
        peer = %peer,
        method = %incoming.method,
        target = %incoming.target,
        "dispatching request"
      );

      let response = handle(&worker, &connectivity, incoming, peer).await;
      write_response(&mut stream, &response, keep_alive).await?;

      if !keep_alive {
        return Ok(());
      }
    }
  }
}

/// Parse one request from the front of `buf`. Returns the request and the
/// number of bytes it occupies, or `None` until the whole body has arrived.
fn parse_request(buf: &[u8]) -> Result<Option<(Incoming, usize)>, ParseError> {
  let mut header_buf = [httparse::EMPTY_HEADER; MAX_HEADERS];
  let mut req = httparse::Request::new(&mut header_buf);

  let offset = match req.parse(buf)? {
    httparse::Status::Complete(offset) => offset,
    httparse::Status::Partial => return Ok(None),
  };
  let (Some(method), Some(target), Some(version)) = (req.method, req.path, req.version) else {
    return Ok(None);
  };

  let mut headers = Headers::new();
  for h in req.headers.iter() {
    append_header(&mut headers, h.name, &String::from_utf8_lossy(h.value));
  }

  let content_length = headers
    .get("content-length")
    .map(|v| v.trim().parse::<usize>())
    .transpose()
    .map_err(|_| ParseError::InvalidContentLength)?
    .unwrap_or(0);
  if content_length > MAX_REQUEST_SIZE {
    return Err(ParseError::TooLarge);
  }

  let total = offset
    .checked_add(content_length)
    .ok_or(ParseError::TooLarge)?;
  if buf.len() < total {
    return Ok(None);
  }

  let keep_alive = match headers.get("connection") {
    Some(v) if v.eq_ignore_ascii_case("close") => false,
    Some(v) if v.eq_ignore_ascii_case("keep-alive") => true,
    _ => version == 1,
  };

  let incoming = Incoming {
    method: method.to_string(),
    target: target.to_string(),
    headers,
    body: Bytes::copy_from_slice(&buf[offset..total]),
    keep_alive,
  };
  Ok(Some((incoming, total)))
}

async fn handle<S, N>(
  worker: &Arc<Worker<S, N>>,
  connectivity: &Connectivity,
  incoming: Incoming,
  peer: SocketAddr,
) -> Response
where
  S: PartitionStore + 'static,
  N: Network + 'static,
{
  let path = incoming.target.split('?').next().unwrap_or_default();
  if let Some(endpoint) = path.strip_prefix(CONTROL_PREFIX) {
    return control(worker, endpoint, &incoming).await;
  }

  let client_id = incoming
    .headers
    .get(CLIENT_ID_HEADER)
    .cloned()
    .unwrap_or_else(|| peer.ip().to_string());

  let request = match to_request(worker, incoming) {
    Ok(request) => request,
    Err(e) => return Response::new(400, "Bad Request").with_body(e.to_string()),
  };

  let event = Event::Fetch {
    request,
    client_id: Some(client_id),
  };
  match dispatch(worker, event).await {
    Ok(Outcome::Fetch(FetchOutcome::Respond(result))) => {
      if connectivity.observe(result.reachable) {
        deliver_sync(worker);
      }
      result.data
    }
    Ok(Outcome::Fetch(FetchOutcome::Passthrough(request))) => {
      forward(worker, connectivity, &request).await
    }
    Ok(Outcome::Done) => internal_error("fetch produced no response"),
    Err(e) => internal_error(e),
  }
}

async fn control<S, N>(worker: &Worker<S, N>, endpoint: &str, incoming: &Incoming) -> Response
where
  S: PartitionStore,
  N: Network,
{
  match (incoming.method.as_str(), endpoint) {
    ("GET", "status") => match worker.status() {
      Ok(report) => match serde_json::to_value(&report) {
        Ok(value) => Response::json(&value),
        Err(e) => internal_error(e),
      },
      Err(e) => internal_error(e),
    },
    ("POST", "message") => match serde_json::from_slice::<Value>(&incoming.body) {
      Ok(payload) => accepted(dispatch(worker, Event::Message(payload)).await),
      Err(e) => bad_request(e),
    },
    ("POST", "sync") => match serde_json::from_slice::<SyncTrigger>(&incoming.body) {
      Ok(trigger) => accepted(dispatch(worker, Event::Sync(trigger.tag)).await),
      Err(e) => bad_request(e),
    },
    (_, "status" | "message" | "sync") => Response::new(405, "Method Not Allowed"),
    _ => Response::new(404, "Not Found"),
  }
}

/// Forward a request the worker does not govern.
async fn forward<S, N>(
  worker: &Arc<Worker<S, N>>,
  connectivity: &Connectivity,
  request: &Request,
) -> Response
where
  S: PartitionStore + 'static,
  N: Network + 'static,
{
  match worker.network().fetch(request).await {
    Ok(response) => {
      if connectivity.observe(Some(true)) {
        deliver_sync(worker);
      }
      response
    }
    Err(e) => {
      connectivity.observe(Some(false));
      warn!(method = %request.method, url = %request.url, error = %e, "passthrough failed");
      Response::new(502, "Bad Gateway").with_body("Upstream unreachable")
    }
  }
}

/// Fire the configured sync tag in the background.
fn deliver_sync<S, N>(worker: &Arc<Worker<S, N>>)
where
  S: PartitionStore + 'static,
  N: Network + 'static,
{
  let worker = Arc::clone(worker);
  let tag = worker.config().sync.tag.clone();

  tokio::spawn(async move {
    info!(tag = %tag, "connectivity restored, delivering sync");
    if let Err(e) = dispatch(&worker, Event::Sync(tag)).await {
      warn!(error = %e, "sync delivery failed");
    }
  });
}

fn to_request<S, N>(worker: &Worker<S, N>, incoming: Incoming) -> Result<Request>
where
  S: PartitionStore,
  N: Network,
{
  let url = worker.resolve(&incoming.target)?;
  let mode = if is_navigation(&incoming) {
    RequestMode::Navigate
  } else {
    RequestMode::Subresource
  };

  Ok(Request {
    method: incoming.method,
    url,
    headers: incoming.headers,
    body: incoming.body,
    mode,
  })
}

/// Browsers mark navigations with `sec-fetch-mode`; older ones only with an
/// HTML accept header.
fn is_navigation(incoming: &Incoming) -> bool {
  match incoming.headers.get("sec-fetch-mode") {
    Some(mode) => mode == "navigate",
    None => {
      incoming.method == "GET"
        && incoming
          .headers
          .get("accept")
          .is_some_and(|accept| accept.contains("text/html"))
    }
  }
}

fn accepted(result: Result<Outcome>) -> Response {
  match result {
    Ok(_) => Response::new(202, "Accepted"),
    Err(e) => internal_error(e),
  }
}

fn bad_request(e: impl Display) -> Response {
  Response::new(400, "Bad Request").with_body(e.to_string())
}

fn internal_error(e: impl Display) -> Response {
  error!(error = %e, "request failed");
  Response::new(500, "Internal Server Error").with_body(e.to_string())
}

/// Status line and headers, framed for this listener's connection handling.
fn response_head(response: &Response, keep_alive: bool) -> String {
  let mut head = format!("HTTP/1.1 {} {}\r\n", response.status, response.status_text);
  for (name, value) in &response.headers {
    if is_hop_by_hop(name) {
      continue;
    }
    for (name, value) in header_lines(name, value) {
      head.push_str(&format!("{}: {}\r\n", name, value));
    }
  }
  head.push_str(&format!("content-length: {}\r\n", response.body.len()));
  head.push_str(if keep_alive {
    "connection: keep-alive\r\n\r\n"
  } else {
    "connection: close\r\n\r\n"
  });
  head
}

async fn write_response(
  stream: &mut TcpStream,
  response: &Response,
  keep_alive: bool,
) -> std::io::Result<()> {
  let head = response_head(response, keep_alive);
  stream.write_all(head.as_bytes()).await?;
  stream.write_all(&response.body).await?;
  stream.flush().await
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::event::start;
  use crate::testing::test_worker;

  fn parse(raw: &str) -> Option<(Incoming, usize)> {
    parse_request(raw.as_bytes()).unwrap()
  }

  async fn roundtrip(addr: SocketAddr, raw: &str) -> String {
    let mut stream = TcpStream::connect(addr).await.unwrap();
    stream.write_all(raw.as_bytes()).await.unwrap();
    let mut out = Vec::new();
    stream.read_to_end(&mut out).await.unwrap();
    String::from_utf8_lossy(&out).into_owned()
  }

  #[test]
  fn test_parse_simple_get() {
    let raw = "GET /display?screen=1 HTTP/1.1\r\nHost: localhost\r\nX-Client-Id: lobby\r\n\r\n";
    let (incoming, consumed) = parse(raw).unwrap();

    assert_eq!(consumed, raw.len());
    assert_eq!(incoming.method, "GET");
    assert_eq!(incoming.target, "/display?screen=1");
    assert_eq!(incoming.headers.get("x-client-id").map(String::as_str), Some("lobby"));
    assert!(incoming.body.is_empty());
    assert!(incoming.keep_alive);
  }

  #[test]
  fn test_parse_waits_for_headers_and_body() {
    assert!(parse("GET / HTTP/1.1\r\nHost: local").is_none());

    let head = "POST /__relay/message HTTP/1.1\r\nContent-Length: 22\r\n\r\n";
    assert!(parse(&format!("{}{{\"type\":", head)).is_none());

    let raw = format!("{}{{\"type\":\"CLEAR_CACHE\"}}", head);
    let (incoming, consumed) = parse(&raw).unwrap();
    assert_eq!(consumed, raw.len());
    assert_eq!(incoming.body.as_ref(), b"{\"type\":\"CLEAR_CACHE\"}");
  }

  #[test]
  fn test_parse_connection_semantics() {
    let (close, _) = parse("GET / HTTP/1.1\r\nConnection: close\r\n\r\n").unwrap();
    assert!(!close.keep_alive);

    let (http10, _) = parse("GET / HTTP/1.0\r\n\r\n").unwrap();
    assert!(!http10.keep_alive);
  }

  #[test]
  fn test_parse_rejects_bad_content_length() {
    let raw = "POST / HTTP/1.1\r\nContent-Length: lots\r\n\r\n";
    assert!(matches!(
      parse_request(raw.as_bytes()),
      Err(ParseError::InvalidContentLength)
    ));
  }

  #[test]
  fn test_parse_rejects_oversized_content_length() {
    let raw = "POST / HTTP/1.1\r\nContent-Length: 18446744073709551615\r\n\r\n";
    assert!(matches!(
      parse_request(raw.as_bytes()),
      Err(ParseError::TooLarge)
    ));

    let raw = format!("POST / HTTP/1.1\r\nContent-Length: {}\r\n\r\n", MAX_REQUEST_SIZE + 1);
    assert!(matches!(
      parse_request(raw.as_bytes()),
      Err(ParseError::TooLarge)
    ));
  }

  #[test]
  fn test_parse_keeps_repeated_headers() {
    let raw = "GET / HTTP/1.1\r\nAccept: text/html\r\nAccept: application/json\r\n\r\n";
    let (incoming, _) = parse(raw).unwrap();
    assert_eq!(
      incoming.headers.get("accept").map(String::as_str),
      Some("text/html, application/json")
    );
  }

  #[test]
  fn test_response_head_writes_each_cookie() {
    let mut response = Response::new(200, "OK").with_body("ok");
    append_header(&mut response.headers, "set-cookie", "session=1");
    append_header(&mut response.headers, "set-cookie", "theme=dark");
    append_header(&mut response.headers, "transfer-encoding", "chunked");

    let head = response_head(&response, false);
    assert!(head.contains("set-cookie: session=1\r\nset-cookie: theme=dark\r\n"));
    assert!(!head.contains("transfer-encoding"));
    assert!(head.ends_with("content-length: 2\r\nconnection: close\r\n\r\n"));
  }

  #[test]
  fn test_foreign_targets_are_rejected() {
    let worker = test_worker("v1");
    for target in ["//evil.example/steal", "http://other.example/x"] {
      let (incoming, _) = parse(&format!("GET {} HTTP/1.1\r\n\r\n", target)).unwrap();
      assert!(to_request(&worker, incoming).is_err(), "{}", target);
    }

    let (local, _) = parse("GET /display?screen=2 HTTP/1.1\r\n\r\n").unwrap();
    let request = to_request(&worker, local).unwrap();
    assert_eq!(request.url.as_str(), "http://signage.test/display?screen=2");
  }

  #[test]
  fn test_navigation_detection() {
    let (fetch_mode, _) = parse("GET /display HTTP/1.1\r\nSec-Fetch-Mode: navigate\r\n\r\n").unwrap();
    assert!(is_navigation(&fetch_mode));

    let (accept, _) =
      parse("GET /display HTTP/1.1\r\nAccept: text/html,application/xhtml+xml\r\n\r\n").unwrap();
    assert!(is_navigation(&accept));

    let (script, _) =
      parse("GET /static/js/bundle.js HTTP/1.1\r\nSec-Fetch-Mode: no-cors\r\nAccept: text/html\r\n\r\n")
        .unwrap();
    assert!(!is_navigation(&script));
  }

  #[tokio::test]
  async fn test_offline_api_request_over_tcp() {
    let worker = Arc::new(test_worker("v1"));
    start(&worker).await.unwrap();
    worker.network().set_online(false);

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(run(listener, Arc::clone(&worker)));

    let response = roundtrip(
      addr,
      "GET /api/weather HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n\r\n",
    )
    .await;

    assert!(response.starts_with("HTTP/1.1 200 OK (Offline)\r\n"));
    assert!(response.contains("x-offline: true\r\n"));
    assert!(response.contains("connection: close\r\n"));
    assert!(response.contains("\"offline\":true"));
  }

  #[tokio::test]
  async fn test_control_calls_over_tcp() {
    let worker = Arc::new(test_worker("v1"));
    start(&worker).await.unwrap();

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(run(listener, Arc::clone(&worker)));

    let body = r#"{"type":"CLEAR_CACHE"}"#;
    let response = roundtrip(
      addr,
      &format!(
        "POST /__relay/message HTTP/1.1\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
        body.len(),
        body
      ),
    )
    .await;
    assert!(response.starts_with("HTTP/1.1 202 Accepted\r\n"));
    assert!(worker.storage().list_names().unwrap().is_empty());

    let status = roundtrip(
      addr,
      "GET /__relay/status HTTP/1.1\r\nConnection: close\r\n\r\n",
    )
    .await;
    assert!(status.starts_with("HTTP/1.1 200 OK\r\n"));
    assert!(status.contains("\"active_version\":\"v1\""));

    let missing = roundtrip(
      addr,
      "GET /__relay/unknown HTTP/1.1\r\nConnection: close\r\n\r\n",
    )
    .await;
    assert!(missing.starts_with("HTTP/1.1 404 Not Found\r\n"));

    let foreign = roundtrip(
      addr,
      "GET //evil.example/steal HTTP/1.1\r\nConnection: close\r\n\r\n",
    )
    .await;
    assert!(foreign.starts_with("HTTP/1.1 400 Bad Request\r\n"));
    assert_eq!(worker.network().calls(), worker.config().static_assets.len());
  }

  #[tokio::test]
  async fn test_ignored_request_is_forwarded() {
    let worker = Arc::new(test_worker("v1"));
    start(&worker).await.unwrap();
    worker.network().route(
      "/api/announcements",
      Response::new(201, "Created").with_body("stored"),
    );

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(run(listener, Arc::clone(&worker)));

    let response = roundtrip(
      addr,
      "POST /api/announcements HTTP/1.1\r\nContent-Length: 2\r\nConnection: close\r\n\r\n{}",
    )
    .await;
    assert!(response.starts_with("HTTP/1.1 201 Created\r\n"));
    assert!(response.ends_with("stored"));

    worker.network().set_online(false);
    let response = roundtrip(
      addr,
      "POST /api/announcements HTTP/1.1\r\nContent-Length: 2\r\nConnection: close\r\n\r\n{}",
    )
    .await;
    assert!(response.starts_with("HTTP/1.1 502 Bad Gateway\r\n"));
  }
}
