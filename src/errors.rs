// Copyright 2018-2026 the Deno authors. MIT license.

//! Error kinds surfaced to proxy clients.
//!
//! Errors are handled at the closest handler boundary and translated into
//! an HTTP status; only transport loss on the manager channel has effects
//! beyond a single connection.

use http::StatusCode;
use thiserror::Error;

/// Why a registered decision waiter resolved without a decision.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum DecisionError {
  #[error("decision deadline elapsed")]
  Timeout,
  #[error("manager disconnected")]
  Disconnected,
}

#[derive(Debug, Error)]
pub enum RelayError {
  #[error("no manager is connected")]
  ManagerNotConnected,
  #[error("manager decision timed out")]
  ManagerTimeout,
  #[error("manager disconnected")]
  ManagerDisconnected,
  #[error("{0}")]
  Rejected(String),
  #[error("target request failed: {0}")]
  Target(#[from] reqwest::Error),
  #[error("target connection failed: {0}")]
  TargetIo(#[from] std::io::Error),
  #[error("request body exceeds the configured limit")]
  BodyTooLarge,
  #[error("tunnel limit reached")]
  TooManyTunnels,
  #[error("internal proxy error: {0}")]
  Internal(anyhow::Error),
}

impl RelayError {
  pub fn status(&self) -> StatusCode {
    match self {
      RelayError::ManagerNotConnected => StatusCode::BAD_GATEWAY,
      RelayError::ManagerTimeout | RelayError::ManagerDisconnected => {
        StatusCode::GATEWAY_TIMEOUT
      }
      RelayError::Rejected(_) => StatusCode::FORBIDDEN,
      RelayError::Target(_) | RelayError::TargetIo(_) => {
        StatusCode::BAD_GATEWAY
      }
      RelayError::BodyTooLarge => StatusCode::PAYLOAD_TOO_LARGE,
      RelayError::TooManyTunnels | RelayError::Internal(_) => {
        StatusCode::INTERNAL_SERVER_ERROR
      }
    }
  }

  pub fn from_decision(err: DecisionError) -> RelayError {
    match err {
      DecisionError::Timeout => RelayError::ManagerTimeout,
      DecisionError::Disconnected => RelayError::ManagerDisconnected,
    }
  }
}
