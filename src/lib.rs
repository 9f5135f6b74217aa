// Copyright 2018-2026 the Deno authors. MIT license.

//! An intercepting HTTP/HTTPS forward proxy. Every request is forwarded
//! over a single authenticated WebSocket control channel to an external
//! manager, which may inspect, modify, approve, or reject both the
//! request and the response before they reach the target or the client.
//! CONNECT tunnels are either spliced directly to the target after
//! approval or relayed byte-by-byte through the manager.

pub mod config;
pub mod errors;
pub mod http_proxy;
pub mod manager;
pub mod pending;
pub mod protocol;
pub mod registry;
pub mod relay;
pub mod tunnel;

pub use relay::serve;
pub use relay::Relay;
