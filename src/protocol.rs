// Copyright 2018-2026 the Deno authors. MIT license.

//! Wire format of the manager control channel.
//!
//! Every message is a single JSON text per WebSocket frame, tagged by
//! `type`. Fields that may carry arbitrary bytes travel base64-encoded.

use base64::prelude::BASE64_STANDARD;
use base64::Engine;
use indexmap::IndexMap;
use serde::Deserialize;
use serde::Serialize;

/// Header maps preserve the order they arrived in.
pub type Headers = IndexMap<String, String>;

#[derive(Debug, thiserror::Error)]
pub enum FrameError {
  #[error("malformed control frame: {0}")]
  Malformed(#[from] serde_json::Error),
  #[error("invalid base64 payload: {0}")]
  Base64(#[from] base64::DecodeError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReviewKind {
  Http,
  Connect,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DecisionAction {
  Accept,
  Reject,
}

/// Fields the manager may override on a reviewed request or response.
/// Absent fields mean "unchanged". `headers` is shallow-merged over the
/// original map; `body` replaces the original outright.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Overrides {
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub method: Option<String>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub url: Option<String>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub status: Option<u16>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub headers: Option<Headers>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub body: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReviewRequest {
  pub id: String,
  pub kind: ReviewKind,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub method: Option<String>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub url: Option<String>,
  #[serde(default, skip_serializing_if = "Headers::is_empty")]
  pub headers: Headers,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub body: Option<String>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub host: Option<String>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub port: Option<u16>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Decision {
  pub id: String,
  pub action: DecisionAction,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub reason: Option<String>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub modified: Option<Overrides>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResponseReview {
  pub id: String,
  pub status: u16,
  #[serde(default, skip_serializing_if = "Headers::is_empty")]
  pub headers: Headers,
  pub body: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DataFrame {
  pub id: String,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub host: Option<String>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub port: Option<u16>,
  pub data: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum ControlFrame {
  ReviewRequest(ReviewRequest),
  Decision(Decision),
  ResponseReview(ResponseReview),
  Data(DataFrame),
  End { id: String },
}

impl ControlFrame {
  pub fn encode(&self) -> Result<String, FrameError> {
    Ok(serde_json::to_string(self)?)
  }

  /// A decode failure is never fatal: callers log and drop the frame so a
  /// buggy manager cannot take the relay down.
  pub fn decode(text: &str) -> Result<ControlFrame, FrameError> {
    Ok(serde_json::from_str(text)?)
  }
}

pub fn to_base64(bytes: &[u8]) -> String {
  BASE64_STANDARD.encode(bytes)
}

pub fn from_base64(text: &str) -> Result<Vec<u8>, FrameError> {
  Ok(BASE64_STANDARD.decode(text)?)
}

#[cfg(test)]
mod tests {
  use pretty_assertions::assert_eq;

  use super::*;

  #[test]
  fn decodes_accept_decision() {
    let frame = ControlFrame::decode(
      r#"{"type":"decision","id":"r1","action":"accept"}"#,
    )
    .unwrap();
    let ControlFrame::Decision(decision) = frame else {
      panic!("expected a decision");
    };
    assert_eq!(decision.id, "r1");
    assert_eq!(decision.action, DecisionAction::Accept);
    assert_eq!(decision.reason, None);
    assert_eq!(decision.modified, None);
  }

  #[test]
  fn decodes_reject_with_reason() {
    let frame = ControlFrame::decode(
      r#"{"type":"decision","id":"r2","action":"reject","reason":"blocked"}"#,
    )
    .unwrap();
    let ControlFrame::Decision(decision) = frame else {
      panic!("expected a decision");
    };
    assert_eq!(decision.action, DecisionAction::Reject);
    assert_eq!(decision.reason.as_deref(), Some("blocked"));
  }

  #[test]
  fn decodes_decision_with_overrides() {
    let frame = ControlFrame::decode(
      r#"{"type":"decision","id":"r3","action":"accept","modified":{"url":"http://other.test/b","headers":{"x-extra":"1"}}}"#,
    )
    .unwrap();
    let ControlFrame::Decision(decision) = frame else {
      panic!("expected a decision");
    };
    let modified = decision.modified.unwrap();
    assert_eq!(modified.url.as_deref(), Some("http://other.test/b"));
    assert_eq!(modified.headers.unwrap()["x-extra"], "1");
    assert_eq!(modified.method, None);
    assert_eq!(modified.body, None);
  }

  #[test]
  fn rejects_unknown_type() {
    assert!(ControlFrame::decode(r#"{"type":"bogus","id":"x"}"#).is_err());
  }

  #[test]
  fn rejects_untagged_and_malformed_frames() {
    assert!(ControlFrame::decode(r#"{"id":"x"}"#).is_err());
    assert!(ControlFrame::decode("not json").is_err());
    assert!(
      ControlFrame::decode(r#"{"type":"decision","id":"x"}"#).is_err(),
      "decision without an action must not decode"
    );
  }

  #[test]
  fn encodes_review_request_shape() {
    let frame = ControlFrame::ReviewRequest(ReviewRequest {
      id: "r4".to_string(),
      kind: ReviewKind::Http,
      method: Some("GET".to_string()),
      url: Some("http://example.test/a".to_string()),
      headers: Headers::from_iter([(
        "host".to_string(),
        "example.test".to_string(),
      )]),
      body: Some(to_base64(b"")),
      host: None,
      port: None,
    });
    let value: serde_json::Value =
      serde_json::from_str(&frame.encode().unwrap()).unwrap();
    assert_eq!(value["type"], "review-request");
    assert_eq!(value["kind"], "http");
    assert_eq!(value["method"], "GET");
    assert_eq!(value["url"], "http://example.test/a");
    assert_eq!(value["headers"]["host"], "example.test");
    assert!(value.get("hostname").is_none());
  }

  #[test]
  fn encodes_end_frame() {
    let frame = ControlFrame::End {
      id: "7".to_string(),
    };
    let value: serde_json::Value =
      serde_json::from_str(&frame.encode().unwrap()).unwrap();
    assert_eq!(value["type"], "end");
    assert_eq!(value["id"], "7");
  }

  #[test]
  fn data_payload_round_trips() {
    let payload = b"\x00\x01binary\xff";
    let encoded = to_base64(payload);
    assert_eq!(from_base64(&encoded).unwrap(), payload);
    assert!(from_base64("not base64!").is_err());
  }
}
