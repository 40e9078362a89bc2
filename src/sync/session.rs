//! One authenticated, rate-limit-aware request against the remote API.
//!
//! Every request goes through [`ApiSession::get`], which records rate-limit
//! headers, applies the credential fallback and classifies the response.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use chrono::{DateTime, Utc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::cache::KvStore;
use crate::event::{EngineEvent, EventBus, Warning};
use crate::github::client::{ApiRequest, ApiResponse, ResponseKind, Transport};

use super::credentials::{AuthFallback, CredentialAttempt, CredentialManager};
use super::error::{Result, SyncError};
use super::rate_limit::{RateLimitLevel, RateLimitState, RateLimitTracker};

/// Storage key of the persisted rate-limit snapshot.
pub const RATE_LIMIT_KEY: &str = "issue-sync:rate_limit";

/// Successful outcome of a request.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionResponse {
  NotModified,
  Body {
    bytes: Vec<u8>,
    etag: Option<String>,
  },
}

pub struct ApiSession {
  transport: Arc<dyn Transport>,
  credentials: CredentialManager,
  rate_limit: Mutex<RateLimitTracker>,
  store: Arc<dyn KvStore>,
  events: EventBus,
  rate_limit_warned: AtomicBool,
}

impl ApiSession {
  /// Create a session, restoring any persisted rate-limit snapshot.
  pub fn new(
    transport: Arc<dyn Transport>,
    token: Option<String>,
    store: Arc<dyn KvStore>,
    events: EventBus,
  ) -> Self {
    let tracker = match store.get(RATE_LIMIT_KEY) {
      Ok(Some(bytes)) => serde_json::from_slice::<RateLimitState>(&bytes)
        .map(RateLimitTracker::restore)
        .unwrap_or_default(),
      Ok(None) => RateLimitTracker::new(),
      Err(e) => {
        warn!(error = %e, "Failed to restore rate-limit state");
        RateLimitTracker::new()
      }
    };

    Self {
      transport,
      credentials: CredentialManager::new(token),
      rate_limit: Mutex::new(tracker),
      store,
      events,
      rate_limit_warned: AtomicBool::new(false),
    }
  }

  fn tracker(&self) -> MutexGuard<'_, RateLimitTracker> {
    self.rate_limit.lock().unwrap_or_else(PoisonError::into_inner)
  }

  pub fn credentials(&self) -> &CredentialManager {
    &self.credentials
  }

  /// Re-arm the per-cycle rate-limit warning.
  pub fn begin_cycle(&self) {
    self.rate_limit_warned.store(false, Ordering::SeqCst);
  }

  pub fn rate_limit(&self) -> RateLimitState {
    self.tracker().snapshot()
  }

  pub fn rate_limit_level(&self) -> RateLimitLevel {
    self.tracker().level()
  }

  pub fn remaining_budget(&self) -> u32 {
    self.tracker().remaining_budget()
  }

  pub fn is_rate_limited(&self) -> bool {
    let mut tracker = self.tracker();
    tracker.is_stale();
    tracker.is_exhausted()
  }

  /// Forget rate-limit state, e.g. after a credential change.
  pub fn clear_rate_limit(&self) {
    self.tracker().clear();
    if let Err(e) = self.store.delete(RATE_LIMIT_KEY) {
      warn!(error = %e, "Failed to delete rate-limit state");
    }
  }

  /// Replace the credential.
  pub fn set_credential(&self, token: Option<String>) {
    self.credentials.set(token);
    self.clear_rate_limit();
  }

  fn persist_rate_limit(&self, state: &RateLimitState) {
    let result = serde_json::to_vec(state)
      .map_err(|e| color_eyre::eyre::eyre!("Failed to serialize rate-limit state: {}", e))
      .and_then(|bytes| self.store.set(RATE_LIMIT_KEY, &bytes));
    if let Err(e) = result {
      warn!(error = %e, "Failed to persist rate-limit state");
    }
  }

  fn record(&self, response: &ApiResponse) {
    let Some(headers) = response.rate_limit else {
      return;
    };
    let snapshot = {
      let mut tracker = self.tracker();
      tracker.record(headers.remaining, headers.reset_at);
      tracker.snapshot()
    };
    self.persist_rate_limit(&snapshot);
  }

  fn on_rate_limited(&self, response: Option<&ApiResponse>) -> SyncError {
    let reset_header = response.and_then(|r| r.rate_limit).map(|r| r.reset_at);
    let snapshot = {
      let mut tracker = self.tracker();
      tracker.mark_exhausted(reset_header);
      tracker.snapshot()
    };
    self.persist_rate_limit(&snapshot);
    self.rate_limited_error(snapshot.reset_at)
  }

  fn rate_limited_error(&self, reset_at: Option<DateTime<Utc>>) -> SyncError {
    if !self.rate_limit_warned.swap(true, Ordering::SeqCst) {
      warn!(?reset_at, "Rate limit exceeded");
      self
        .events
        .emit(EngineEvent::Warning(Warning::RateLimited { reset_at }));
    }
    SyncError::RateLimitExceeded { reset_at }
  }

  /// Fail the way a request would while the budget is exhausted. Warns
  /// once per cycle.
  pub fn check_rate_limit(&self) -> Result<()> {
    if self.is_rate_limited() {
      let reset_at = self.tracker().reset_at();
      return Err(self.rate_limited_error(reset_at));
    }
    Ok(())
  }

  /// Issue `request`, retrying once without a credential on 401.
  pub async fn get(&self, request: ApiRequest, cancel: &CancellationToken) -> Result<SessionResponse> {
    self.check_rate_limit()?;

    let (mut attempt_request, mut attempt) = self.credentials.authorize(request.clone());
    loop {
      debug!(path = %attempt_request.path, page = ?attempt_request.query_param("page"), "GET");
      let response = tokio::select! {
        biased;
        _ = cancel.cancelled() => return Err(SyncError::Cancelled),
        response = self.transport.get(attempt_request) => response?,
      };
      self.record(&response);

      match response.kind() {
        ResponseKind::Ok => {
          return Ok(SessionResponse::Body {
            bytes: response.body,
            etag: response.etag,
          })
        }
        ResponseKind::NotModified => return Ok(SessionResponse::NotModified),
        ResponseKind::Unauthorized => match self.credentials.on_unauthorized(&attempt) {
          AuthFallback::RetryAnonymous { warn } => {
            if warn {
              self
                .events
                .emit(EngineEvent::Warning(Warning::InvalidCredential));
            }
            attempt_request = ApiRequest {
              credential: None,
              ..request.clone()
            };
            attempt = CredentialAttempt::Anonymous;
          }
          AuthFallback::GiveUp => return Err(SyncError::AuthenticationInvalid),
        },
        ResponseKind::RateLimited => return Err(self.on_rate_limited(Some(&response))),
        ResponseKind::NotFound => return Err(SyncError::not_found(request.path.clone())),
        ResponseKind::Failed(status) => {
          return Err(SyncError::network(format!(
            "HTTP {} for {}: {}",
            status,
            request.path,
            response.error_message()
          )))
        }
      }
    }
  }
}
