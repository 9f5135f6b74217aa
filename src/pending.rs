// Copyright 2018-2026 the Deno authors. MIT license.

//! In-flight review RPCs awaiting a manager decision.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::oneshot;

use crate::errors::DecisionError;
use crate::protocol::Decision;

type WaiterMap = Arc<Mutex<HashMap<String, oneshot::Sender<Decision>>>>;

pub struct PendingDecisions {
  deadline: Duration,
  waiters: WaiterMap,
}

/// A registered waiter. `wait` resolves exactly once: with the manager's
/// decision, with `Timeout` when the deadline elapses, or with
/// `Disconnected` when the whole table is failed.
pub struct DecisionWaiter {
  id: String,
  deadline: Duration,
  rx: oneshot::Receiver<Decision>,
  waiters: WaiterMap,
}

impl PendingDecisions {
  pub fn new(deadline: Duration) -> PendingDecisions {
    PendingDecisions {
      deadline,
      waiters: Arc::new(Mutex::new(HashMap::new())),
    }
  }

  /// Registers a waiter for `id`. Registration is synchronous so a reply
  /// racing the send cannot slip past the table.
  pub fn register(&self, id: &str) -> DecisionWaiter {
    let (tx, rx) = oneshot::channel();
    self.waiters.lock().insert(id.to_string(), tx);
    DecisionWaiter {
      id: id.to_string(),
      deadline: self.deadline,
      rx,
      waiters: self.waiters.clone(),
    }
  }

  /// Resolves the waiter for `id`. Returns false when no waiter is
  /// registered; a late reply is dropped silently by the caller.
  pub fn complete(&self, id: &str, decision: Decision) -> bool {
    let Some(tx) = self.waiters.lock().remove(id) else {
      return false;
    };
    tx.send(decision).is_ok()
  }

  pub fn remove(&self, id: &str) {
    self.waiters.lock().remove(id);
  }

  /// Fails every in-flight RPC with `Disconnected`. Dropping the senders
  /// resolves the receivers immediately.
  pub fn fail_all(&self) {
    self.waiters.lock().drain().for_each(drop);
  }

  pub fn len(&self) -> usize {
    self.waiters.lock().len()
  }

  pub fn is_empty(&self) -> bool {
    self.len() == 0
  }
}

impl DecisionWaiter {
  pub async fn wait(self) -> Result<Decision, DecisionError> {
    match tokio::time::timeout(self.deadline, self.rx).await {
      Ok(Ok(decision)) => Ok(decision),
      Ok(Err(_)) => Err(DecisionError::Disconnected),
      Err(_) => {
        self.waiters.lock().remove(&self.id);
        Err(DecisionError::Timeout)
      }
    }
  }
}
