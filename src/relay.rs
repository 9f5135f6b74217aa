// Copyright 2018-2026 the Deno authors. MIT license.

//! Process-wide relay state and the client-facing accept loop.
//!
//! Everything shared lives on an explicit [`Relay`] value handed to each
//! connection task; there are no ambient globals.

use std::convert::Infallible;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use bytes::Bytes;
use http::Method;
use http::StatusCode;
use http_body_util::combinators::BoxBody;
use http_body_util::Empty;
use http_body_util::Full;
use hyper::body::Incoming;
use hyper::Request;
use hyper::Response;
use hyper_util::rt::TokioIo;
use log::debug;
use log::warn;
use parking_lot::Mutex;
use tokio::net::TcpListener;
use tokio::net::TcpStream;

use crate::config::Config;
use crate::errors::RelayError;
use crate::http_proxy;
use crate::manager;
use crate::manager::ManagerChannel;
use crate::pending::PendingDecisions;
use crate::protocol::ControlFrame;
use crate::protocol::Decision;
use crate::registry::TunnelRegistry;
use crate::tunnel;

pub type HttpBody = BoxBody<Bytes, Infallible>;

pub struct Relay {
  pub config: Config,
  pub registry: TunnelRegistry,
  pub pending: PendingDecisions,
  pub(crate) http_client: reqwest::Client,
  manager: Mutex<Option<Arc<ManagerChannel>>>,
  generations: AtomicU64,
}

impl Relay {
  pub fn new(config: Config) -> Result<Relay, anyhow::Error> {
    // Redirects are never followed (the manager must see every hop) and
    // ambient proxy env vars are ignored: this process dials targets on
    // its own.
    let http_client = reqwest::Client::builder()
      .redirect(reqwest::redirect::Policy::none())
      .no_proxy()
      .build()?;
    Ok(Relay {
      registry: TunnelRegistry::new(config.max_tunnels),
      pending: PendingDecisions::new(config.decision_timeout),
      http_client,
      manager: Mutex::new(None),
      generations: AtomicU64::new(1),
      config,
    })
  }

  pub fn manager(&self) -> Option<Arc<ManagerChannel>> {
    self.manager.lock().clone()
  }

  pub(crate) fn next_generation(&self) -> u64 {
    self.generations.fetch_add(1, Ordering::Relaxed)
  }

  /// Publishes a freshly authenticated channel. Any prior channel is torn
  /// down first, under the same lock, so none of its waiters or tunnels
  /// can leak into the new session.
  pub(crate) fn install_manager(&self, channel: Arc<ManagerChannel>) {
    let mut slot = self.manager.lock();
    if let Some(old) = slot.take() {
      warn!(
        "manager handover, closing channel generation {}",
        old.generation()
      );
      self.teardown(&old);
    }
    *slot = Some(channel);
  }

  /// Tears down the channel of the given generation unless it has already
  /// been superseded.
  pub(crate) fn on_channel_closed(&self, generation: u64) {
    let mut slot = self.manager.lock();
    let is_current =
      matches!(slot.as_ref(), Some(channel) if channel.generation() == generation);
    if !is_current {
      return;
    }
    if let Some(old) = slot.take() {
      self.teardown(&old);
    }
  }

  /// Fails every in-flight RPC and closes every relayed client socket.
  /// All of it is synchronous, so by the time this returns no stale state
  /// is reachable.
  fn teardown(&self, channel: &ManagerChannel) {
    channel.close();
    self.pending.fail_all();
    for handle in self.registry.drain() {
      handle.shutdown();
    }
  }

  /// One review round trip: register the waiter, enqueue the frame, await
  /// the decision. The waiter is registered before the frame is sent so a
  /// reply can never race past the table.
  pub async fn review(
    &self,
    id: &str,
    frame: ControlFrame,
  ) -> Result<Decision, RelayError> {
    let Some(channel) = self.manager() else {
      return Err(RelayError::ManagerNotConnected);
    };
    let waiter = self.pending.register(id);
    if channel.send(frame).await.is_err() {
      self.pending.remove(id);
      return Err(RelayError::ManagerDisconnected);
    }
    waiter.wait().await.map_err(RelayError::from_decision)
  }

  pub(crate) async fn send_to_manager(
    &self,
    frame: ControlFrame,
  ) -> Result<(), RelayError> {
    let Some(channel) = self.manager() else {
      return Err(RelayError::ManagerNotConnected);
    };
    channel.send(frame).await
  }
}

pub async fn serve(relay: Arc<Relay>, listener: TcpListener) {
  loop {
    let (stream, _) = match listener.accept().await {
      Ok(accepted) => accepted,
      Err(err) => {
        warn!("accept failed: {err}");
        continue;
      }
    };
    tokio::spawn(serve_connection(relay.clone(), stream));
  }
}

async fn serve_connection(relay: Arc<Relay>, stream: TcpStream) {
  let io = TokioIo::new(stream);
  let service = hyper::service::service_fn(move |req| {
    let relay = relay.clone();
    async move { handle_request(relay, req).await }
  });
  let conn = hyper::server::conn::http1::Builder::new()
    .serve_connection(io, service)
    .with_upgrades();
  if let Err(err) = conn.await {
    debug!("client connection error: {err:?}");
  }
}

async fn handle_request(
  relay: Arc<Relay>,
  mut req: Request<Incoming>,
) -> Result<Response<HttpBody>, anyhow::Error> {
  if fastwebsockets::upgrade::is_upgrade_request(&req) {
    return manager::handle_upgrade(relay, &mut req);
  }
  if req.method() == Method::CONNECT {
    return Ok(tunnel::handle(relay, req).await);
  }
  if req.uri().scheme().is_some() {
    return Ok(http_proxy::handle(relay, req).await);
  }
  Ok(status_response(
    StatusCode::BAD_REQUEST,
    "proxy requests must use an absolute URI",
  ))
}

pub(crate) fn empty_body() -> HttpBody {
  BoxBody::new(Empty::new())
}

pub(crate) fn full_body(bytes: Bytes) -> HttpBody {
  BoxBody::new(Full::new(bytes))
}

pub(crate) fn status_response(
  status: StatusCode,
  message: &str,
) -> Response<HttpBody> {
  let mut response = Response::new(full_body(Bytes::from(message.to_string())));
  *response.status_mut() = status;
  response
}

pub(crate) fn error_response(err: &RelayError) -> Response<HttpBody> {
  status_response(err.status(), &err.to_string())
}
