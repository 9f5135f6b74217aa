// Copyright 2018-2026 the Deno authors. MIT license.

//! The manager control channel and its upgrade gate.
//!
//! At most one channel is live at a time. Every outbound frame leaves
//! through a single writer task so frames never interleave on the wire;
//! inbound frames are dispatched to the pending-decision table or the
//! tunnel registry. Teardown is guarded by a generation counter so a
//! superseded channel can never tear down its successor.

use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use fastwebsockets::upgrade::UpgradeFut;
use fastwebsockets::FragmentCollectorRead;
use fastwebsockets::Frame;
use fastwebsockets::OpCode;
use fastwebsockets::WebSocketError;
use fastwebsockets::WebSocketRead;
use fastwebsockets::WebSocketWrite;
use http::StatusCode;
use hyper::body::Incoming;
use hyper::upgrade::Upgraded;
use hyper::Request;
use hyper::Response;
use hyper_util::rt::TokioIo;
use log::debug;
use log::info;
use log::warn;
use tokio::io::ReadHalf;
use tokio::io::WriteHalf;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::errors::RelayError;
use crate::protocol::ControlFrame;
use crate::relay::empty_body;
use crate::relay::status_response;
use crate::relay::HttpBody;
use crate::relay::Relay;

/// Dedicated path the manager upgrades on.
pub const MANAGER_PATH: &str = "/manager";
pub const TOKEN_HEADER: &str = "x-manager-token";

const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(30);
const OUTBOUND_QUEUE: usize = 32;

pub(crate) enum Outbound {
  Frame(ControlFrame),
  Ping,
  Control(OpCode, Vec<u8>),
}

pub struct ManagerChannel {
  generation: u64,
  outbound: mpsc::Sender<Outbound>,
  awaiting_pong: AtomicBool,
  cancel: CancellationToken,
}

impl ManagerChannel {
  pub fn generation(&self) -> u64 {
    self.generation
  }

  /// Queues a frame behind everything previously queued. Blocks while the
  /// writer is backed up so a slow manager applies backpressure instead
  /// of reordering frames; fails once the channel is torn down.
  pub async fn send(&self, frame: ControlFrame) -> Result<(), RelayError> {
    self
      .outbound
      .send(Outbound::Frame(frame))
      .await
      .map_err(|_| RelayError::ManagerDisconnected)
  }

  pub(crate) fn close(&self) {
    self.cancel.cancel();
  }
}

/// Accepts the control-channel upgrade when the path and token match.
/// A bad token gets `401`; an upgrade on any other path is an error the
/// connection loop turns into a close without an HTTP response.
pub fn handle_upgrade(
  relay: Arc<Relay>,
  req: &mut Request<Incoming>,
) -> Result<Response<HttpBody>, anyhow::Error> {
  if req.uri().path() != MANAGER_PATH {
    anyhow::bail!("websocket upgrade on unexpected path {}", req.uri().path());
  }
  if !token_matches(req, &relay.config.manager_token) {
    warn!("manager upgrade with a bad token rejected");
    return Ok(status_response(
      StatusCode::UNAUTHORIZED,
      "invalid manager token",
    ));
  }
  let (response, upgrade) = fastwebsockets::upgrade::upgrade(req)?;
  tokio::spawn(run_channel(relay, upgrade));
  Ok(response.map(|_| empty_body()))
}

fn token_matches<B>(req: &Request<B>, expected: &str) -> bool {
  if let Some(value) = req.headers().get(TOKEN_HEADER) {
    if value.as_bytes() == expected.as_bytes() {
      return true;
    }
  }
  req
    .uri()
    .query()
    .map(|query| {
      query
        .split('&')
        .filter_map(|pair| pair.split_once('='))
        .any(|(key, value)| key == "token" && value == expected)
    })
    .unwrap_or(false)
}

async fn run_channel(relay: Arc<Relay>, upgrade: UpgradeFut) {
  let mut ws = match upgrade.await {
    Ok(ws) => ws,
    Err(err) => {
      warn!("manager upgrade failed: {err}");
      return;
    }
  };
  ws.set_writev(true);
  // Control frames are answered through the writer task, never inline, so
  // every write on this socket is serialized.
  ws.set_auto_close(false);
  ws.set_auto_pong(false);

  let (read_half, write_half) = ws.split(tokio::io::split);
  let (outbound_tx, outbound_rx) = mpsc::channel(OUTBOUND_QUEUE);
  let cancel = CancellationToken::new();
  let channel = Arc::new(ManagerChannel {
    generation: relay.next_generation(),
    outbound: outbound_tx,
    awaiting_pong: AtomicBool::new(false),
    cancel: cancel.clone(),
  });
  relay.install_manager(channel.clone());
  info!("manager connected (generation {})", channel.generation);

  tokio::spawn(write_loop(write_half, outbound_rx, cancel));
  tokio::spawn(keepalive_loop(relay.clone(), channel.clone()));

  read_loop(&relay, &channel, read_half).await;
  relay.on_channel_closed(channel.generation);
  info!("manager disconnected (generation {})", channel.generation);
}

async fn read_loop(
  relay: &Relay,
  channel: &ManagerChannel,
  reader: WebSocketRead<ReadHalf<TokioIo<Upgraded>>>,
) {
  let mut reader = FragmentCollectorRead::new(reader);
  let obligated = channel.outbound.clone();
  let mut send_fn = move |frame: Frame<'_>| {
    let tx = obligated.clone();
    let opcode = frame.opcode;
    let payload = frame.payload.to_vec();
    async move {
      tx
        .send(Outbound::Control(opcode, payload))
        .await
        .map_err(|_| WebSocketError::ConnectionClosed)
    }
  };
  loop {
    let frame = tokio::select! {
      _ = channel.cancel.cancelled() => break,
      frame = reader.read_frame(&mut send_fn) => match frame {
        Ok(frame) => frame,
        Err(err) => {
          debug!("manager read failed: {err}");
          break;
        }
      },
    };
    match frame.opcode {
      OpCode::Text => match std::str::from_utf8(&frame.payload) {
        Ok(text) => dispatch(relay, text),
        Err(_) => warn!("non-utf8 text frame from manager dropped"),
      },
      OpCode::Binary => warn!("unexpected binary frame from manager dropped"),
      OpCode::Ping => {
        let pong = Outbound::Control(OpCode::Pong, frame.payload.to_vec());
        if channel.outbound.send(pong).await.is_err() {
          break;
        }
      }
      OpCode::Pong => channel.awaiting_pong.store(false, Ordering::SeqCst),
      OpCode::Close => break,
      OpCode::Continuation => {}
    }
  }
}

/// Routes one decoded inbound frame. Failures here are per-frame: logged
/// and dropped, never fatal to the channel.
fn dispatch(relay: &Relay, text: &str) {
  let frame = match ControlFrame::decode(text) {
    Ok(frame) => frame,
    Err(err) => {
      warn!("undecodable frame from manager dropped: {err}");
      return;
    }
  };
  match frame {
    ControlFrame::Decision(decision) => {
      let id = decision.id.clone();
      if !relay.pending.complete(&id, decision) {
        debug!("decision for unknown request {id} dropped");
      }
    }
    ControlFrame::Data(data) => {
      let Some(handle) = relay.registry.lookup(&data.id) else {
        debug!("data for unknown tunnel {} dropped", data.id);
        return;
      };
      match crate::protocol::from_base64(&data.data) {
        Ok(bytes) => {
          if !handle.send_data(Bytes::from(bytes)) {
            debug!("tunnel {} is gone, data dropped", data.id);
          }
        }
        Err(err) => {
          warn!("invalid data payload for tunnel {}: {err}", data.id)
        }
      }
    }
    ControlFrame::End { id } => {
      if let Some(handle) = relay.registry.lookup(&id) {
        handle.shutdown();
      }
      relay.registry.unregister(&id);
    }
    ControlFrame::ReviewRequest(_) | ControlFrame::ResponseReview(_) => {
      debug!("unexpected inbound frame ignored");
    }
  }
}

async fn write_loop(
  mut writer: WebSocketWrite<WriteHalf<TokioIo<Upgraded>>>,
  mut outbound: mpsc::Receiver<Outbound>,
  cancel: CancellationToken,
) {
  loop {
    let message = tokio::select! {
      _ = cancel.cancelled() => break,
      message = outbound.recv() => match message {
        Some(message) => message,
        None => break,
      },
    };
    let frame = match message {
      Outbound::Frame(frame) => match frame.encode() {
        Ok(text) => Frame::text(text.into_bytes().into()),
        Err(err) => {
          warn!("unencodable frame skipped: {err}");
          continue;
        }
      },
      Outbound::Ping => Frame::new(true, OpCode::Ping, None, vec![].into()),
      Outbound::Control(opcode, payload) => {
        Frame::new(true, opcode, None, payload.into())
      }
    };
    if let Err(err) = writer.write_frame(frame).await {
      debug!("manager write failed: {err}");
      break;
    }
  }
  let _ = writer.write_frame(Frame::close_raw(vec![].into())).await;
}

/// Sends a liveness probe every tick; a probe that was never acknowledged
/// by the next tick declares the channel dead.
async fn keepalive_loop(relay: Arc<Relay>, channel: Arc<ManagerChannel>) {
  let mut interval = tokio::time::interval(KEEPALIVE_INTERVAL);
  interval.tick().await;
  loop {
    tokio::select! {
      _ = channel.cancel.cancelled() => return,
      _ = interval.tick() => {}
    }
    if channel.awaiting_pong.swap(true, Ordering::SeqCst) {
      warn!("manager missed a keepalive, closing the channel");
      relay.on_channel_closed(channel.generation);
      return;
    }
    if channel.outbound.send(Outbound::Ping).await.is_err() {
      return;
    }
  }
}
