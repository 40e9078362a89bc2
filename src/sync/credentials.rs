use std::sync::{Mutex, PoisonError};

use tracing::warn;

use crate::github::client::ApiRequest;

/// Which credential a request was sent with.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CredentialAttempt {
  Authenticated(String),
  Anonymous,
}

/// What to do after a 401.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthFallback {
  /// Retry the same request once without a credential. `warn` is true only
  /// for the first failure since the credential was set.
  RetryAnonymous { warn: bool },
  /// The request was already anonymous; stop.
  GiveUp,
}

#[derive(Debug, Default)]
struct CredentialState {
  token: Option<String>,
  warned: bool,
}

/// Holds zero or one bearer credential and demotes to anonymous mode on
/// authentication failure.
#[derive(Debug, Default)]
pub struct CredentialManager {
  state: Mutex<CredentialState>,
}

impl CredentialManager {
  pub fn new(token: Option<String>) -> Self {
    let manager = Self::default();
    manager.set(token);
    manager
  }

  fn lock(&self) -> std::sync::MutexGuard<'_, CredentialState> {
    self.state.lock().unwrap_or_else(PoisonError::into_inner)
  }

  /// Replace the credential. Blank tokens mean anonymous.
  pub fn set(&self, token: Option<String>) {
    let mut state = self.lock();
    state.token = token.filter(|t| !t.trim().is_empty());
    state.warned = false;
  }

  pub fn has_credential(&self) -> bool {
    self.lock().token.is_some()
  }

  /// Attach the current credential (if any) to `request`.
  pub fn authorize(&self, mut request: ApiRequest) -> (ApiRequest, CredentialAttempt) {
    let token = self.lock().token.clone();
    let attempt = match token {
      Some(token) => {
        request.credential = Some(token.clone());
        CredentialAttempt::Authenticated(token)
      }
      None => {
        request.credential = None;
        CredentialAttempt::Anonymous
      }
    };
    (request, attempt)
  }

  /// Handle a 401 received for a request sent with `attempt`.
  ///
  /// The credential is only cleared if it is still the one that failed, so
  /// concurrent page fetches failing together clear it once and warn once.
  pub fn on_unauthorized(&self, attempt: &CredentialAttempt) -> AuthFallback {
    let CredentialAttempt::Authenticated(failed) = attempt else {
      return AuthFallback::GiveUp;
    };

    let mut state = self.lock();
    if state.token.as_deref() == Some(failed.as_str()) {
      warn!("Credential rejected by the API, continuing anonymously");
      state.token = None;
    }
    let warn = !state.warned;
    state.warned = true;
    AuthFallback::RetryAnonymous { warn }
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_authorize_attaches_token() {
    let manager = CredentialManager::new(Some("secret".to_string()));
    let (request, attempt) = manager.authorize(ApiRequest::get("/x"));
    assert_eq!(request.credential.as_deref(), Some("secret"));
    assert_eq!(attempt, CredentialAttempt::Authenticated("secret".to_string()));
  }

  #[test]
  fn test_blank_token_is_anonymous() {
    let manager = CredentialManager::new(Some("  ".to_string()));
    assert!(!manager.has_credential());
    let (request, attempt) = manager.authorize(ApiRequest::get("/x"));
    assert!(request.credential.is_none());
    assert_eq!(attempt, CredentialAttempt::Anonymous);
  }

  #[test]
  fn test_unauthorized_clears_and_warns_once() {
    let manager = CredentialManager::new(Some("revoked".to_string()));
    let attempt = CredentialAttempt::Authenticated("revoked".to_string());

    assert_eq!(
      manager.on_unauthorized(&attempt),
      AuthFallback::RetryAnonymous { warn: true }
    );
    assert!(!manager.has_credential());

    // A second in-flight request that used the same token
    assert_eq!(
      manager.on_unauthorized(&attempt),
      AuthFallback::RetryAnonymous { warn: false }
    );
  }

  #[test]
  fn test_anonymous_failure_gives_up() {
    let manager = CredentialManager::new(None);
    assert_eq!(
      manager.on_unauthorized(&CredentialAttempt::Anonymous),
      AuthFallback::GiveUp
    );
  }

  #[test]
  fn test_new_credential_rearms_warning() {
    let manager = CredentialManager::new(Some("a".to_string()));
    manager.on_unauthorized(&CredentialAttempt::Authenticated("a".to_string()));
    manager.set(Some("b".to_string()));
    assert_eq!(
      manager.on_unauthorized(&CredentialAttempt::Authenticated("b".to_string())),
      AuthFallback::RetryAnonymous { warn: true }
    );
  }

  #[test]
  fn test_stale_failure_does_not_clear_new_token() {
    let manager = CredentialManager::new(Some("old".to_string()));
    manager.set(Some("new".to_string()));
    manager.on_unauthorized(&CredentialAttempt::Authenticated("old".to_string()));
    assert!(manager.has_credential());
  }
}
