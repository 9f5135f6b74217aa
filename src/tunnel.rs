// Copyright 2018-2026 the Deno authors. MIT license.

//! CONNECT tunnels: the manager reviews the intent, then bytes flow
//! either straight to the target (direct splice) or frame-by-frame
//! through the manager (relayed).

use std::sync::Arc;

use http::StatusCode;
use hyper::body::Incoming;
use hyper::Request;
use hyper::Response;
use hyper_util::rt::TokioIo;
use log::debug;
use log::warn;
use tokio::io::AsyncReadExt;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::config::ConnectMode;
use crate::errors::RelayError;
use crate::http_proxy::collect_headers;
use crate::protocol;
use crate::protocol::ControlFrame;
use crate::protocol::DataFrame;
use crate::protocol::DecisionAction;
use crate::protocol::ReviewKind;
use crate::protocol::ReviewRequest;
use crate::registry::TunnelCommand;
use crate::registry::TunnelHandle;
use crate::relay::empty_body;
use crate::relay::error_response;
use crate::relay::status_response;
use crate::relay::HttpBody;
use crate::relay::Relay;

const TUNNEL_BUF_SIZE: usize = 16 * 1024;

pub async fn handle(
  relay: Arc<Relay>,
  req: Request<Incoming>,
) -> Response<HttpBody> {
  let Some(authority) = req.uri().authority().cloned() else {
    return status_response(StatusCode::BAD_REQUEST, "CONNECT requires host:port");
  };
  let host = authority.host().to_string();
  let port = authority.port_u16().unwrap_or(443);
  let headers = collect_headers(req.headers());

  let review_id = Uuid::new_v4().to_string();
  let review = relay
    .review(
      &review_id,
      ControlFrame::ReviewRequest(ReviewRequest {
        id: review_id.clone(),
        kind: ReviewKind::Connect,
        method: None,
        url: None,
        headers,
        body: None,
        host: Some(host.clone()),
        port: Some(port),
      }),
    )
    .await;
  match review {
    Ok(decision) if decision.action == DecisionAction::Reject => {
      let reason = decision
        .reason
        .unwrap_or_else(|| "rejected by manager".to_string());
      return error_response(&RelayError::Rejected(reason));
    }
    Ok(_) => {}
    Err(err) => {
      debug!("connect review for {host}:{port} failed: {err}");
      return error_response(&err);
    }
  }

  match relay.config.connect_mode {
    ConnectMode::Direct => direct_splice(req, host, port).await,
    ConnectMode::Relayed => relayed(relay, req, host, port),
  }
}

/// Dials the target before answering, so a dial failure still turns into
/// a normal error response. After the 200 the two sockets are spliced
/// until either side closes.
async fn direct_splice(
  req: Request<Incoming>,
  host: String,
  port: u16,
) -> Response<HttpBody> {
  let mut target = match TcpStream::connect((host.as_str(), port)).await {
    Ok(target) => target,
    Err(err) => {
      debug!("connect to {host}:{port} failed: {err}");
      return error_response(&RelayError::TargetIo(err));
    }
  };
  tokio::spawn(async move {
    let upgraded = match hyper::upgrade::on(req).await {
      Ok(upgraded) => upgraded,
      Err(err) => {
        debug!("connect upgrade failed: {err}");
        return;
      }
    };
    let mut client = TokioIo::new(upgraded);
    if let Err(err) =
      tokio::io::copy_bidirectional(&mut client, &mut target).await
    {
      debug!("tunnel to {host}:{port} closed: {err}");
    }
  });
  Response::new(empty_body())
}

/// Registers the client socket so inbound `data` frames can find it, then
/// pumps client bytes out as `data` frames until either side ends.
fn relayed(
  relay: Arc<Relay>,
  req: Request<Incoming>,
  host: String,
  port: u16,
) -> Response<HttpBody> {
  let (handle, commands) = TunnelHandle::new();
  let Some(id) = relay.registry.register(handle) else {
    warn!("tunnel limit reached, refusing CONNECT to {host}:{port}");
    return error_response(&RelayError::TooManyTunnels);
  };
  tokio::spawn(run_relayed(relay, req, id, host, port, commands));
  Response::new(empty_body())
}

async fn run_relayed(
  relay: Arc<Relay>,
  req: Request<Incoming>,
  id: String,
  host: String,
  port: u16,
  mut commands: mpsc::UnboundedReceiver<TunnelCommand>,
) {
  let upgraded = match hyper::upgrade::on(req).await {
    Ok(upgraded) => upgraded,
    Err(err) => {
      debug!("connect upgrade failed: {err}");
      relay.registry.unregister(&id);
      return;
    }
  };
  let (mut reader, mut writer) = tokio::io::split(TokioIo::new(upgraded));
  let mut buf = vec![0u8; TUNNEL_BUF_SIZE];
  loop {
    tokio::select! {
      command = commands.recv() => match command {
        Some(TunnelCommand::Data(bytes)) => {
          if writer.write_all(&bytes).await.is_err() {
            break;
          }
        }
        // The manager ended the tunnel, or the channel itself is gone.
        Some(TunnelCommand::Shutdown) | None => {
          relay.registry.unregister(&id);
          let _ = writer.shutdown().await;
          return;
        }
      },
      read = reader.read(&mut buf) => {
        let n = match read {
          Ok(0) | Err(_) => break,
          Ok(n) => n,
        };
        let frame = ControlFrame::Data(DataFrame {
          id: id.clone(),
          host: Some(host.clone()),
          port: Some(port),
          data: protocol::to_base64(&buf[..n]),
        });
        if relay.send_to_manager(frame).await.is_err() {
          break;
        }
      }
    }
  }
  // The client side is done: withdraw the tunnel and tell the manager.
  relay.registry.unregister(&id);
  if let Err(err) =
    relay.send_to_manager(ControlFrame::End { id: id.clone() }).await
  {
    debug!("end frame for tunnel {id} not delivered: {err}");
  }
  let _ = writer.shutdown().await;
}
