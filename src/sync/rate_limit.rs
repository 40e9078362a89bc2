//! Rate-limit tracking from response metadata.
//!
//! The tracker is pure state: callers record every response and decide what
//! to do with the derived level. Persisting the snapshot across sessions is
//! the caller's job (see `ApiSession`).

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

/// Ceiling assumed for anonymous callers when nothing is known yet.
pub const ANONYMOUS_LIMIT: u32 = 60;

/// Remaining budget at or below which the level is reported as low.
pub const LOW_BUDGET_THRESHOLD: u32 = 10;

/// Serializable snapshot of rate-limit state.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RateLimitState {
  pub remaining: Option<u32>,
  pub reset_at: Option<DateTime<Utc>>,
  /// When the limited period started (first 403 seen)
  pub limited_since: Option<DateTime<Utc>>,
}

/// Warning level derived from the current state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RateLimitLevel {
  Unknown,
  Healthy,
  Low,
  Exhausted,
}

#[derive(Debug, Clone, Default)]
pub struct RateLimitTracker {
  state: RateLimitState,
}

impl RateLimitTracker {
  pub fn new() -> Self {
    Self::default()
  }

  /// Restore a persisted snapshot, dropping it if its window already reset.
  pub fn restore(state: RateLimitState) -> Self {
    let mut tracker = Self { state };
    tracker.is_stale();
    tracker
  }

  pub fn snapshot(&self) -> RateLimitState {
    self.state.clone()
  }

  /// Overwrite state with the latest response metadata. Most recent wins.
  pub fn record(&mut self, remaining: u32, reset_at: DateTime<Utc>) {
    self.state.remaining = Some(remaining);
    self.state.reset_at = Some(reset_at);
    if remaining > 0 {
      self.state.limited_since = None;
    } else if self.state.limited_since.is_none() {
      self.state.limited_since = Some(Utc::now());
    }
  }

  /// Record an explicit rate-limit rejection.
  pub fn mark_exhausted(&mut self, reset_at: Option<DateTime<Utc>>) {
    let now = Utc::now();
    self.state.remaining = Some(0);
    self.state.reset_at = reset_at.or(self.state.reset_at).or(Some(now + Duration::hours(1)));
    self.state.limited_since.get_or_insert(now);
  }

  /// Remaining calls, or the anonymous ceiling when unknown.
  pub fn remaining_budget(&self) -> u32 {
    self.state.remaining.unwrap_or(ANONYMOUS_LIMIT)
  }

  pub fn reset_at(&self) -> Option<DateTime<Utc>> {
    self.state.reset_at
  }

  /// True iff the budget is zero and the reset time is still ahead.
  pub fn is_exhausted(&self) -> bool {
    match (self.state.remaining, self.state.reset_at) {
      (Some(0), Some(reset_at)) => reset_at > Utc::now(),
      _ => false,
    }
  }

  /// True iff the reset time has passed; state is cleared in that case.
  pub fn is_stale(&mut self) -> bool {
    match self.state.reset_at {
      Some(reset_at) if reset_at <= Utc::now() => {
        self.clear();
        true
      }
      _ => false,
    }
  }

  pub fn clear(&mut self) {
    self.state = RateLimitState::default();
  }

  pub fn level(&self) -> RateLimitLevel {
    match self.state.remaining {
      None => RateLimitLevel::Unknown,
      Some(_) if self.is_exhausted() => RateLimitLevel::Exhausted,
      Some(0) => RateLimitLevel::Unknown,
      Some(n) if n <= LOW_BUDGET_THRESHOLD => RateLimitLevel::Low,
      Some(_) => RateLimitLevel::Healthy,
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_unknown_budget_assumes_anonymous_ceiling() {
    let tracker = RateLimitTracker::new();
    assert_eq!(tracker.remaining_budget(), ANONYMOUS_LIMIT);
    assert_eq!(tracker.level(), RateLimitLevel::Unknown);
    assert!(!tracker.is_exhausted());
  }

  #[test]
  fn test_most_recent_record_wins() {
    let mut tracker = RateLimitTracker::new();
    let later = Utc::now() + Duration::minutes(30);
    tracker.record(100, later);
    tracker.record(4999, later + Duration::minutes(5));
    assert_eq!(tracker.remaining_budget(), 4999);
    assert_eq!(tracker.reset_at(), Some(later + Duration::minutes(5)));
    assert_eq!(tracker.level(), RateLimitLevel::Healthy);
  }

  #[test]
  fn test_exhausted_only_before_reset() {
    let mut tracker = RateLimitTracker::new();
    tracker.record(0, Utc::now() + Duration::minutes(10));
    assert!(tracker.is_exhausted());
    assert_eq!(tracker.level(), RateLimitLevel::Exhausted);
    assert!(tracker.snapshot().limited_since.is_some());

    tracker.record(0, Utc::now() - Duration::seconds(1));
    assert!(!tracker.is_exhausted());
  }

  #[test]
  fn test_stale_clears_state() {
    let mut tracker = RateLimitTracker::new();
    tracker.record(3, Utc::now() - Duration::seconds(5));
    assert!(tracker.is_stale());
    assert_eq!(tracker.snapshot(), RateLimitState::default());
    assert!(!tracker.is_stale());
  }

  #[test]
  fn test_low_level() {
    let mut tracker = RateLimitTracker::new();
    tracker.record(LOW_BUDGET_THRESHOLD, Utc::now() + Duration::minutes(1));
    assert_eq!(tracker.level(), RateLimitLevel::Low);
  }

  #[test]
  fn test_mark_exhausted_keeps_known_reset() {
    let mut tracker = RateLimitTracker::new();
    let reset = Utc::now() + Duration::minutes(7);
    tracker.record(5, reset);
    tracker.mark_exhausted(None);
    assert!(tracker.is_exhausted());
    assert_eq!(tracker.reset_at(), Some(reset));
  }

  #[test]
  fn test_restore_drops_expired_snapshot() {
    let expired = RateLimitState {
      remaining: Some(0),
      reset_at: Some(Utc::now() - Duration::minutes(1)),
      limited_since: None,
    };
    assert_eq!(RateLimitTracker::restore(expired).snapshot(), RateLimitState::default());

    let live = RateLimitState {
      remaining: Some(12),
      reset_at: Some(Utc::now() + Duration::minutes(1)),
      limited_since: None,
    };
    assert_eq!(RateLimitTracker::restore(live.clone()).snapshot(), live);
  }
}
