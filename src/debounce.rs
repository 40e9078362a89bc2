//! Debounced-request policy.
//!
//! A newer request replaces the pending one instead of queueing behind it.
//! Each request is represented by a [`PendingOp`] that can be cancelled
//! from outside.

use std::future::Future;
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::trace;

/// Cancellable handle for one debounced request.
#[derive(Debug, Clone)]
pub struct PendingOp {
  token: CancellationToken,
}

impl PendingOp {
  pub fn cancel(&self) {
    self.token.cancel();
  }

  pub fn is_cancelled(&self) -> bool {
    self.token.is_cancelled()
  }
}

pub struct Debouncer {
  window: Duration,
  pending: Mutex<Option<CancellationToken>>,
}

impl Debouncer {
  pub fn new(window: Duration) -> Self {
    Self {
      window,
      pending: Mutex::new(None),
    }
  }

  /// Start a new request, cancelling the one still pending.
  pub fn begin(&self) -> PendingOp {
    let token = CancellationToken::new();
    let previous = self
      .pending
      .lock()
      .unwrap_or_else(PoisonError::into_inner)
      .replace(token.clone());
    if let Some(previous) = previous {
      trace!("Replacing pending request");
      previous.cancel();
    }
    PendingOp { token }
  }

  /// Wait out the window, then run `op` unless `pending` was replaced or
  /// cancelled in the meantime. Returns `None` when superseded.
  pub async fn run<F>(&self, pending: &PendingOp, op: F) -> Option<F::Output>
  where
    F: Future,
  {
    tokio::select! {
      biased;
      _ = pending.token.cancelled() => return None,
      _ = tokio::time::sleep(self.window) => {}
    }
    tokio::select! {
      biased;
      _ = pending.token.cancelled() => None,
      output = op => Some(output),
    }
  }

  /// `begin` + `run`.
  pub async fn call<F>(&self, op: F) -> Option<F::Output>
  where
    F: Future,
  {
    let pending = self.begin();
    self.run(&pending, op).await
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use std::sync::atomic::{AtomicUsize, Ordering};
  use std::sync::Arc;

  #[tokio::test(start_paused = true)]
  async fn test_newer_request_replaces_pending() {
    let debouncer = Arc::new(Debouncer::new(Duration::from_millis(300)));
    let runs = Arc::new(AtomicUsize::new(0));

    let mut handles = Vec::new();
    for term in ["m", "ma", "map"] {
      let debouncer = debouncer.clone();
      let runs = runs.clone();
      handles.push(tokio::spawn(async move {
        debouncer
          .call(async move {
            runs.fetch_add(1, Ordering::SeqCst);
            term
          })
          .await
      }));
      tokio::time::sleep(Duration::from_millis(100)).await;
    }

    let mut results = Vec::new();
    for handle in handles {
      results.push(handle.await.unwrap());
    }
    assert_eq!(results, vec![None, None, Some("map")]);
    assert_eq!(runs.load(Ordering::SeqCst), 1);
  }

  #[tokio::test(start_paused = true)]
  async fn test_requests_outside_window_all_run() {
    let debouncer = Debouncer::new(Duration::from_millis(50));
    assert_eq!(debouncer.call(async { 1 }).await, Some(1));
    assert_eq!(debouncer.call(async { 2 }).await, Some(2));
  }

  #[tokio::test(start_paused = true)]
  async fn test_external_cancel() {
    let debouncer = Debouncer::new(Duration::from_millis(50));
    let pending = debouncer.begin();
    pending.cancel();
    assert!(pending.is_cancelled());
    assert_eq!(debouncer.run(&pending, async { 1 }).await, None);
  }
}
