// Copyright 2018-2026 the Deno authors. MIT license.

//! Live relayed tunnels, keyed by connection id.

use std::collections::HashMap;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;

use bytes::Bytes;
use parking_lot::Mutex;
use tokio::sync::mpsc;

/// Instruction for the task that owns a tunneled client socket.
#[derive(Debug)]
pub enum TunnelCommand {
  Data(Bytes),
  Shutdown,
}

/// Cheap handle to a tunnel task. A lookup never holds the registry lock
/// across a socket write; bytes go through this channel instead.
#[derive(Debug, Clone)]
pub struct TunnelHandle {
  tx: mpsc::UnboundedSender<TunnelCommand>,
}

impl TunnelHandle {
  pub fn new() -> (TunnelHandle, mpsc::UnboundedReceiver<TunnelCommand>) {
    let (tx, rx) = mpsc::unbounded_channel();
    (TunnelHandle { tx }, rx)
  }

  /// Returns false when the tunnel task is already gone, which callers
  /// treat as a benign race and drop the data.
  pub fn send_data(&self, data: Bytes) -> bool {
    self.tx.send(TunnelCommand::Data(data)).is_ok()
  }

  pub fn shutdown(&self) {
    let _ = self.tx.send(TunnelCommand::Shutdown);
  }
}

pub struct TunnelRegistry {
  next_id: AtomicU64,
  capacity: usize,
  tunnels: Mutex<HashMap<String, TunnelHandle>>,
}

impl TunnelRegistry {
  pub fn new(capacity: usize) -> TunnelRegistry {
    TunnelRegistry {
      next_id: AtomicU64::new(1),
      capacity,
      tunnels: Mutex::new(HashMap::new()),
    }
  }

  /// Allocates the next connection id and stores the handle under it.
  /// Returns `None` when the tunnel limit is reached.
  pub fn register(&self, handle: TunnelHandle) -> Option<String> {
    let mut tunnels = self.tunnels.lock();
    if tunnels.len() >= self.capacity {
      return None;
    }
    let id = self.next_id.fetch_add(1, Ordering::Relaxed).to_string();
    tunnels.insert(id.clone(), handle);
    Some(id)
  }

  pub fn lookup(&self, id: &str) -> Option<TunnelHandle> {
    self.tunnels.lock().get(id).cloned()
  }

  pub fn unregister(&self, id: &str) {
    self.tunnels.lock().remove(id);
  }

  /// Removes every tunnel, returning the handles so the caller can shut
  /// them down outside the lock.
  pub fn drain(&self) -> Vec<TunnelHandle> {
    self.tunnels.lock().drain().map(|(_, handle)| handle).collect()
  }

  pub fn len(&self) -> usize {
    self.tunnels.lock().len()
  }

  pub fn is_empty(&self) -> bool {
    self.len() == 0
  }
}

#[cfg(test)]
mod tests {
  use pretty_assertions::assert_eq;

  use super::*;

  #[test]
  fn ids_are_monotonic_and_unique() {
    let registry = TunnelRegistry::new(16);
    let (a, _rx_a) = TunnelHandle::new();
    let (b, _rx_b) = TunnelHandle::new();
    let first: u64 = registry.register(a).unwrap().parse().unwrap();
    let second: u64 = registry.register(b).unwrap().parse().unwrap();
    assert!(second > first);
  }

  #[test]
  fn lookup_after_unregister_is_empty() {
    let registry = TunnelRegistry::new(16);
    let (handle, _rx) = TunnelHandle::new();
    let id = registry.register(handle).unwrap();
    assert!(registry.lookup(&id).is_some());
    registry.unregister(&id);
    assert!(registry.lookup(&id).is_none());
    // Unregistering twice is a no-op.
    registry.unregister(&id);
  }

  #[test]
  fn capacity_is_enforced() {
    let registry = TunnelRegistry::new(1);
    let (a, _rx_a) = TunnelHandle::new();
    let (b, _rx_b) = TunnelHandle::new();
    let id = registry.register(a).unwrap();
    assert!(registry.register(b).is_none());
    registry.unregister(&id);
    let (c, _rx_c) = TunnelHandle::new();
    assert!(registry.register(c).is_some());
  }

  #[test]
  fn drain_empties_the_registry() {
    let registry = TunnelRegistry::new(16);
    let (a, mut rx_a) = TunnelHandle::new();
    let (b, _rx_b) = TunnelHandle::new();
    registry.register(a).unwrap();
    registry.register(b).unwrap();
    let handles = registry.drain();
    assert_eq!(handles.len(), 2);
    assert!(registry.is_empty());
    for handle in &handles {
      handle.shutdown();
    }
    assert!(matches!(rx_a.try_recv(), Ok(TunnelCommand::Shutdown)));
  }

  #[test]
  fn send_data_reports_a_dead_tunnel() {
    let (handle, rx) = TunnelHandle::new();
    assert!(handle.send_data(Bytes::from_static(b"abc")));
    drop(rx);
    assert!(!handle.send_data(Bytes::from_static(b"abc")));
  }
}
