// Copyright 2018-2026 the Deno authors. MIT license.

use std::net::SocketAddr;
use std::process;
use std::sync::Arc;

use log::error;
use log::info;
use proxy_relay::config::Config;
use proxy_relay::Relay;

fn init_logging() {
  env_logger::Builder::from_env(
    env_logger::Env::new()
      .filter_or("RELAY_LOG", "info")
      .write_style("RELAY_LOG_STYLE"),
  )
  .init();
}

#[tokio::main]
async fn main() {
  init_logging();
  let config = match Config::from_env() {
    Ok(config) => config,
    Err(err) => {
      error!("{err:#}");
      process::exit(1);
    }
  };
  let addr = SocketAddr::from(([0, 0, 0, 0], config.port));
  let listener = match tokio::net::TcpListener::bind(addr).await {
    Ok(listener) => listener,
    Err(err) => {
      error!("failed to bind {addr}: {err}");
      process::exit(1);
    }
  };
  let relay = match Relay::new(config) {
    Ok(relay) => Arc::new(relay),
    Err(err) => {
      error!("{err:#}");
      process::exit(1);
    }
  };
  info!("relay listening on {addr}");
  tokio::select! {
    _ = proxy_relay::serve(relay, listener) => {}
    _ = tokio::signal::ctrl_c() => info!("shutting down"),
  }
}
