// Copyright 2018-2026 the Deno authors. MIT license.

//! Plain-HTTP proxying for absolute-URI requests: buffer the body, have
//! the manager review the request, forward it, have the manager review
//! the response, reply to the client.

use std::sync::Arc;

use bytes::Bytes;
use http::header::HeaderName;
use http::header::HeaderValue;
use http::HeaderMap;
use http::StatusCode;
use http_body_util::BodyExt;
use http_body_util::Limited;
use hyper::body::Incoming;
use hyper::Request;
use hyper::Response;
use log::debug;
use log::warn;
use uuid::Uuid;

use crate::errors::RelayError;
use crate::protocol;
use crate::protocol::ControlFrame;
use crate::protocol::DecisionAction;
use crate::protocol::Headers;
use crate::protocol::Overrides;
use crate::protocol::ResponseReview;
use crate::protocol::ReviewKind;
use crate::protocol::ReviewRequest;
use crate::relay::error_response;
use crate::relay::full_body;
use crate::relay::HttpBody;
use crate::relay::Relay;

/// Hop-by-hop headers never travel end to end; `host` and
/// `content-length` are regenerated on the forwarded message.
const STRIPPED_HEADERS: &[&str] = &[
  "connection",
  "proxy-connection",
  "keep-alive",
  "transfer-encoding",
  "te",
  "trailer",
  "upgrade",
  "host",
  "content-length",
];

pub async fn handle(
  relay: Arc<Relay>,
  req: Request<Incoming>,
) -> Response<HttpBody> {
  match run(relay, req).await {
    Ok(response) => response,
    Err(err) => {
      debug!("proxied request failed: {err}");
      error_response(&err)
    }
  }
}

async fn run(
  relay: Arc<Relay>,
  req: Request<Incoming>,
) -> Result<Response<HttpBody>, RelayError> {
  let (parts, body) = req.into_parts();
  let url = parts.uri.to_string();
  let method = parts.method.to_string();
  let headers = collect_headers(&parts.headers);
  let body = read_body(body, relay.config.max_body_bytes).await?;

  let review_id = Uuid::new_v4().to_string();
  let decision = relay
    .review(
      &review_id,
      ControlFrame::ReviewRequest(ReviewRequest {
        id: review_id.clone(),
        kind: ReviewKind::Http,
        method: Some(method.clone()),
        url: Some(url.clone()),
        headers: headers.clone(),
        body: Some(protocol::to_base64(&body)),
        host: None,
        port: None,
      }),
    )
    .await?;
  if decision.action == DecisionAction::Reject {
    return Err(RelayError::Rejected(rejection_reason(decision.reason)));
  }
  let (method, url, headers, body) =
    apply_request_overrides(method, url, headers, body, decision.modified);

  let target_response = forward(&relay, &method, &url, &headers, body).await?;
  let status = target_response.status().as_u16();
  let response_headers = collect_headers(target_response.headers());
  let response_body =
    target_response.bytes().await.map_err(RelayError::Target)?;

  let review_id = Uuid::new_v4().to_string();
  let review = relay
    .review(
      &review_id,
      ControlFrame::ResponseReview(ResponseReview {
        id: review_id.clone(),
        status,
        headers: response_headers.clone(),
        body: protocol::to_base64(&response_body),
      }),
    )
    .await;
  match review {
    Ok(decision) => {
      if decision.action == DecisionAction::Reject {
        return Err(RelayError::Rejected(rejection_reason(decision.reason)));
      }
      let (status, headers, body) = apply_response_overrides(
        status,
        response_headers,
        response_body,
        decision.modified,
      );
      client_response(status, headers, body)
    }
    Err(err) => {
      // Degraded but correct: once the target has answered, the client is
      // not penalized for manager flakiness.
      warn!("response review failed ({err}), forwarding original response");
      client_response(status, response_headers, response_body)
    }
  }
}

async fn read_body(body: Incoming, limit: usize) -> Result<Bytes, RelayError> {
  match Limited::new(body, limit).collect().await {
    Ok(collected) => Ok(collected.to_bytes()),
    Err(err)
      if err.downcast_ref::<http_body_util::LengthLimitError>().is_some() =>
    {
      Err(RelayError::BodyTooLarge)
    }
    Err(err) => Err(RelayError::Internal(anyhow::anyhow!(
      "failed to read request body: {err}"
    ))),
  }
}

pub(crate) fn collect_headers(headers: &HeaderMap) -> Headers {
  let mut map = Headers::new();
  for (name, value) in headers {
    let Ok(value) = value.to_str() else {
      warn!("non-utf8 header {name} dropped");
      continue;
    };
    map.insert(name.as_str().to_string(), value.to_string());
  }
  map
}

fn rejection_reason(reason: Option<String>) -> String {
  reason.unwrap_or_else(|| "rejected by manager".to_string())
}

fn apply_request_overrides(
  method: String,
  url: String,
  mut headers: Headers,
  body: Bytes,
  modified: Option<Overrides>,
) -> (String, String, Headers, Bytes) {
  let Some(modified) = modified else {
    return (method, url, headers, body);
  };
  let method = modified.method.unwrap_or(method);
  let url = modified.url.unwrap_or(url);
  if let Some(merged) = modified.headers {
    for (name, value) in merged {
      headers.insert(name.to_ascii_lowercase(), value);
    }
  }
  let body = replace_body(body, modified.body);
  (method, url, headers, body)
}

fn apply_response_overrides(
  status: u16,
  mut headers: Headers,
  body: Bytes,
  modified: Option<Overrides>,
) -> (u16, Headers, Bytes) {
  let Some(modified) = modified else {
    return (status, headers, body);
  };
  let status = modified.status.unwrap_or(status);
  if let Some(merged) = modified.headers {
    for (name, value) in merged {
      headers.insert(name.to_ascii_lowercase(), value);
    }
  }
  let body = replace_body(body, modified.body);
  (status, headers, body)
}

fn replace_body(original: Bytes, replacement: Option<String>) -> Bytes {
  match replacement {
    Some(replacement) => match protocol::from_base64(&replacement) {
      Ok(bytes) => Bytes::from(bytes),
      Err(err) => {
        warn!("invalid base64 in a modified body, keeping the original: {err}");
        original
      }
    },
    None => original,
  }
}

async fn forward(
  relay: &Relay,
  method: &str,
  url: &str,
  headers: &Headers,
  body: Bytes,
) -> Result<reqwest::Response, RelayError> {
  let method = http::Method::from_bytes(method.as_bytes()).map_err(|err| {
    RelayError::Internal(anyhow::anyhow!("invalid request method: {err}"))
  })?;
  let url = url::Url::parse(url).map_err(|err| {
    RelayError::Internal(anyhow::anyhow!("invalid target url: {err}"))
  })?;
  let mut header_map = HeaderMap::new();
  for (name, value) in headers {
    if STRIPPED_HEADERS.contains(&name.as_str()) {
      continue;
    }
    let header_name = match HeaderName::from_bytes(name.as_bytes()) {
      Ok(header_name) => header_name,
      Err(_) => {
        warn!("unrepresentable header name {name} dropped");
        continue;
      }
    };
    let header_value = match HeaderValue::from_str(value) {
      Ok(header_value) => header_value,
      Err(_) => {
        warn!("unrepresentable value for header {name} dropped");
        continue;
      }
    };
    header_map.insert(header_name, header_value);
  }
  relay
    .http_client
    .request(method, url)
    .headers(header_map)
    .body(body)
    .send()
    .await
    .map_err(RelayError::Target)
}

fn client_response(
  status: u16,
  headers: Headers,
  body: Bytes,
) -> Result<Response<HttpBody>, RelayError> {
  let status = StatusCode::from_u16(status).map_err(|err| {
    RelayError::Internal(anyhow::anyhow!("invalid status from manager: {err}"))
  })?;
  let mut response = Response::new(full_body(body));
  *response.status_mut() = status;
  for (name, value) in headers {
    if STRIPPED_HEADERS.contains(&name.as_str()) {
      continue;
    }
    let Ok(name) = HeaderName::from_bytes(name.as_bytes()) else {
      continue;
    };
    let Ok(value) = HeaderValue::from_str(&value) else {
      continue;
    };
    response.headers_mut().insert(name, value);
  }
  Ok(response)
}

#[cfg(test)]
mod tests {
  use pretty_assertions::assert_eq;

  use super::*;

  fn headers(pairs: &[(&str, &str)]) -> Headers {
    pairs
      .iter()
      .map(|(name, value)| (name.to_string(), value.to_string()))
      .collect()
  }

  #[test]
  fn no_overrides_is_identity() {
    let original = headers(&[("host", "example.test"), ("x-a", "1")]);
    let (method, url, merged, body) = apply_request_overrides(
      "GET".to_string(),
      "http://example.test/a".to_string(),
      original.clone(),
      Bytes::from_static(b"payload"),
      None,
    );
    assert_eq!(method, "GET");
    assert_eq!(url, "http://example.test/a");
    assert_eq!(merged, original);
    assert_eq!(body, Bytes::from_static(b"payload"));
  }

  #[test]
  fn url_override_keeps_original_headers() {
    let (_, url, merged, _) = apply_request_overrides(
      "GET".to_string(),
      "http://example.test/a".to_string(),
      headers(&[("x-orig", "1")]),
      Bytes::new(),
      Some(Overrides {
        url: Some("http://other.test/b".to_string()),
        ..Default::default()
      }),
    );
    assert_eq!(url, "http://other.test/b");
    assert_eq!(merged["x-orig"], "1");
  }

  #[test]
  fn header_merge_is_shallow() {
    let (_, _, merged, _) = apply_request_overrides(
      "GET".to_string(),
      "http://example.test/a".to_string(),
      headers(&[("x-keep", "old"), ("x-replace", "old")]),
      Bytes::new(),
      Some(Overrides {
        headers: Some(headers(&[("X-Replace", "new"), ("x-added", "1")])),
        ..Default::default()
      }),
    );
    assert_eq!(merged["x-keep"], "old");
    assert_eq!(merged["x-replace"], "new");
    assert_eq!(merged["x-added"], "1");
  }

  #[test]
  fn body_override_replaces_and_decodes() {
    let (_, _, _, body) = apply_request_overrides(
      "POST".to_string(),
      "http://example.test/a".to_string(),
      Headers::new(),
      Bytes::from_static(b"old"),
      Some(Overrides {
        body: Some(protocol::to_base64(b"new body")),
        ..Default::default()
      }),
    );
    assert_eq!(body, Bytes::from_static(b"new body"));
  }

  #[test]
  fn invalid_body_override_keeps_original() {
    let (_, _, _, body) = apply_request_overrides(
      "POST".to_string(),
      "http://example.test/a".to_string(),
      Headers::new(),
      Bytes::from_static(b"old"),
      Some(Overrides {
        body: Some("***".to_string()),
        ..Default::default()
      }),
    );
    assert_eq!(body, Bytes::from_static(b"old"));
  }

  #[test]
  fn response_status_override() {
    let (status, merged, _) = apply_response_overrides(
      200,
      headers(&[("content-type", "text/plain")]),
      Bytes::new(),
      Some(Overrides {
        status: Some(404),
        ..Default::default()
      }),
    );
    assert_eq!(status, 404);
    assert_eq!(merged["content-type"], "text/plain");
  }

  #[test]
  fn client_response_strips_hop_by_hop_headers() {
    let response = client_response(
      200,
      headers(&[
        ("content-type", "text/plain"),
        ("connection", "keep-alive"),
        ("transfer-encoding", "chunked"),
        ("content-length", "999"),
      ]),
      Bytes::from_static(b"hi"),
    )
    .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(response.headers()["content-type"], "text/plain");
    assert!(!response.headers().contains_key("connection"));
    assert!(!response.headers().contains_key("transfer-encoding"));
    assert!(!response.headers().contains_key("content-length"));
  }
}
