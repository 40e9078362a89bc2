use chrono::{DateTime, Utc};
use thiserror::Error;

/// Errors surfaced by the synchronization engine.
///
/// Failures are always scoped to one page or one repository; none of these
/// abort a whole synchronization cycle.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum SyncError {
  /// 401 even after the anonymous retry.
  #[error("Authentication failed")]
  AuthenticationInvalid,

  /// 403/429 with rate-limit semantics.
  #[error("Rate limit exceeded{}", reset_suffix(.reset_at))]
  RateLimitExceeded { reset_at: Option<DateTime<Utc>> },

  /// Repository or issue not found (or not accessible).
  #[error("Not found: {resource}")]
  NotFound { resource: String },

  /// Any other network or HTTP failure.
  #[error("Network error: {message}")]
  TransientNetworkFailure { message: String },

  /// The cycle that issued the request was superseded.
  #[error("Request cancelled")]
  Cancelled,

  #[error("Storage error: {message}")]
  Storage { message: String },

  #[error("Failed to decode response: {message}")]
  Decode { message: String },
}

fn reset_suffix(reset_at: &Option<DateTime<Utc>>) -> String {
  match reset_at {
    Some(at) => format!(". Resets at {}", at.format("%H:%M:%S UTC")),
    None => String::new(),
  }
}

impl SyncError {
  #[inline]
  pub fn not_found(resource: impl Into<String>) -> Self {
    Self::NotFound {
      resource: resource.into(),
    }
  }

  #[inline]
  pub fn network(message: impl Into<String>) -> Self {
    Self::TransientNetworkFailure {
      message: message.into(),
    }
  }

  #[inline]
  pub fn decode(e: impl std::fmt::Display) -> Self {
    Self::Decode {
      message: e.to_string(),
    }
  }

  #[inline]
  pub fn storage(e: impl std::fmt::Display) -> Self {
    Self::Storage {
      message: e.to_string(),
    }
  }

  #[inline]
  pub fn is_rate_limited(&self) -> bool {
    matches!(self, Self::RateLimitExceeded { .. })
  }

  #[inline]
  pub fn is_not_found(&self) -> bool {
    matches!(self, Self::NotFound { .. })
  }

  #[inline]
  pub fn is_cancelled(&self) -> bool {
    matches!(self, Self::Cancelled)
  }
}

/// Result type for engine operations.
pub type Result<T> = std::result::Result<T, SyncError>;

#[cfg(test)]
mod tests {
  use super::*;
  use chrono::TimeZone;

  #[test]
  fn test_rate_limit_message_includes_reset() {
    let at = Utc.with_ymd_and_hms(2025, 1, 1, 12, 30, 0).unwrap();
    let err = SyncError::RateLimitExceeded { reset_at: Some(at) };
    assert_eq!(err.to_string(), "Rate limit exceeded. Resets at 12:30:00 UTC");
    assert!(err.is_rate_limited());

    let err = SyncError::RateLimitExceeded { reset_at: None };
    assert_eq!(err.to_string(), "Rate limit exceeded");
  }

  #[test]
  fn test_predicates() {
    assert!(SyncError::not_found("modelearth/gone").is_not_found());
    assert!(SyncError::Cancelled.is_cancelled());
    assert!(!SyncError::network("reset").is_rate_limited());
  }
}
