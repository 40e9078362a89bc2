use std::future::Future;
use std::sync::Arc;

use tokio::sync::Semaphore;
use tracing::trace;

/// Bounded-parallelism gate.
///
/// At most `max_concurrent` tasks run at once; excess callers wait in FIFO
/// order (tokio's semaphore is fair).
#[derive(Clone)]
pub struct ConcurrencyLimiter {
  name: &'static str,
  semaphore: Arc<Semaphore>,
  max_concurrent: usize,
}

impl ConcurrencyLimiter {
  pub fn new(name: &'static str, max_concurrent: usize) -> Self {
    let max_concurrent = max_concurrent.max(1);
    Self {
      name,
      semaphore: Arc::new(Semaphore::new(max_concurrent)),
      max_concurrent,
    }
  }

  pub fn max_concurrent(&self) -> usize {
    self.max_concurrent
  }

  /// Tasks currently admitted.
  pub fn running(&self) -> usize {
    self.max_concurrent - self.semaphore.available_permits()
  }

  /// Run `task` once a slot is free.
  pub async fn run<F, T>(&self, task: F) -> T
  where
    F: Future<Output = T>,
  {
    // The semaphore is never closed, so acquire only fails if that changes
    let permit = self.semaphore.acquire().await.ok();
    trace!(limiter = self.name, running = self.running(), "task admitted");
    let output = task.await;
    drop(permit);
    output
  }
}

/// One limiter per task class, so saturating one class cannot starve another.
#[derive(Clone)]
pub struct Limiters {
  pub page: ConcurrencyLimiter,
  pub repository: ConcurrencyLimiter,
  pub count: ConcurrencyLimiter,
}

impl Limiters {
  pub fn new(page: usize, repository: usize, count: usize) -> Self {
    Self {
      page: ConcurrencyLimiter::new("page", page),
      repository: ConcurrencyLimiter::new("repository", repository),
      count: ConcurrencyLimiter::new("count", count),
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use futures::future::join_all;
  use std::sync::atomic::{AtomicUsize, Ordering};
  use std::sync::Mutex;
  use std::time::Duration;

  #[tokio::test(start_paused = true)]
  async fn test_never_exceeds_max_concurrent() {
    let limiter = ConcurrencyLimiter::new("page", 2);
    let running = Arc::new(AtomicUsize::new(0));
    let peak = Arc::new(AtomicUsize::new(0));

    let tasks = (0..6).map(|_| {
      let limiter = limiter.clone();
      let running = running.clone();
      let peak = peak.clone();
      async move {
        limiter
          .run(async {
            let now = running.fetch_add(1, Ordering::SeqCst) + 1;
            peak.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(10)).await;
            running.fetch_sub(1, Ordering::SeqCst);
          })
          .await
      }
    });
    join_all(tasks).await;

    assert_eq!(peak.load(Ordering::SeqCst), 2);
    assert_eq!(limiter.running(), 0);
  }

  #[tokio::test(start_paused = true)]
  async fn test_waiters_are_released_in_fifo_order() {
    let limiter = ConcurrencyLimiter::new("repository", 1);
    let order = Arc::new(Mutex::new(Vec::new()));

    let tasks = (0..4).map(|i| {
      let limiter = limiter.clone();
      let order = order.clone();
      async move {
        limiter
          .run(async {
            order.lock().unwrap().push(i);
            tokio::time::sleep(Duration::from_millis(5)).await;
          })
          .await
      }
    });
    join_all(tasks).await;

    assert_eq!(*order.lock().unwrap(), vec![0, 1, 2, 3]);
  }

  #[tokio::test(start_paused = true)]
  async fn test_classes_are_independent() {
    let limiters = Limiters::new(1, 1, 1);
    let page = limiters.page.clone();
    let hold = tokio::spawn(async move {
      page
        .run(tokio::time::sleep(Duration::from_secs(60)))
        .await
    });
    tokio::task::yield_now().await;

    // Page class is saturated; the count class still runs immediately
    let value = tokio::time::timeout(Duration::from_millis(1), limiters.count.run(async { 7 }))
      .await
      .unwrap();
    assert_eq!(value, 7);
    hold.abort();
  }

  #[test]
  fn test_zero_capacity_is_raised_to_one() {
    assert_eq!(ConcurrencyLimiter::new("count", 0).max_concurrent(), 1);
  }
}
