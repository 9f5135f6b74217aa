// Copyright 2018-2026 the Deno authors. MIT license.

//! Environment-driven configuration.

use std::env;
use std::fmt::Display;
use std::str::FromStr;
use std::time::Duration;

use anyhow::bail;

/// How CONNECT tunnels move bytes after the manager approves the intent:
/// dialed directly and spliced, or relayed frame-by-frame through the
/// manager. The mode is fixed for the lifetime of the process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectMode {
  Direct,
  Relayed,
}

impl FromStr for ConnectMode {
  type Err = String;

  fn from_str(s: &str) -> Result<ConnectMode, String> {
    match s.to_ascii_lowercase().as_str() {
      "direct" => Ok(ConnectMode::Direct),
      "relayed" => Ok(ConnectMode::Relayed),
      other => Err(format!("expected \"direct\" or \"relayed\", got \"{other}\"")),
    }
  }
}

#[derive(Debug, Clone)]
pub struct Config {
  pub port: u16,
  pub manager_token: String,
  pub decision_timeout: Duration,
  pub max_body_bytes: usize,
  pub connect_mode: ConnectMode,
  pub max_tunnels: usize,
}

impl Config {
  pub fn from_env() -> Result<Config, anyhow::Error> {
    let Ok(manager_token) = env::var("MANAGER_TOKEN") else {
      bail!("MANAGER_TOKEN must be set");
    };
    if manager_token.is_empty() {
      bail!("MANAGER_TOKEN must not be empty");
    }
    Ok(Config {
      port: parse_env("PORT", 3000)?,
      manager_token,
      decision_timeout: Duration::from_millis(parse_env(
        "DECISION_TIMEOUT_MS",
        8000,
      )?),
      max_body_bytes: parse_env("MAX_BODY_BYTES", 32 * 1024 * 1024)?,
      connect_mode: parse_env("CONNECT_MODE", ConnectMode::Relayed)?,
      max_tunnels: parse_env("MAX_TUNNELS", 1024)?,
    })
  }
}

fn parse_env<T>(name: &str, default: T) -> Result<T, anyhow::Error>
where
  T: FromStr,
  T::Err: Display,
{
  match env::var(name) {
    Ok(value) => match value.parse() {
      Ok(parsed) => Ok(parsed),
      Err(err) => bail!("invalid {name}: {err}"),
    },
    Err(_) => Ok(default),
  }
}
