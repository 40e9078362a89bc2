use chrono::{DateTime, Utc};
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::mpsc;

use crate::cache::CacheSource;

/// User-visible warnings. Each is emitted at most once per credential
/// lifetime (credential) or per cycle (rate limit).
#[derive(Debug, Clone, PartialEq)]
pub enum Warning {
  /// The credential was rejected and the engine continues anonymously
  InvalidCredential,
  RateLimited { reset_at: Option<DateTime<Utc>> },
}

/// Engine notifications
#[derive(Debug, Clone, PartialEq)]
pub enum EngineEvent {
  /// A repository's issues entered the unified collection
  RepositoryLoaded {
    repo: String,
    count: usize,
    source: CacheSource,
  },
  /// A repository was removed from the active set (not found, inaccessible)
  RepositoryDropped { repo: String, reason: String },
  Warning(Warning),
  /// A refresh pass finished; `issues` is the unified collection size
  CycleCompleted { issues: usize },
}

type Listener = Arc<dyn Fn(&EngineEvent) + Send + Sync>;

#[derive(Default)]
struct Subscribers {
  listeners: Vec<Listener>,
  channels: Vec<mpsc::UnboundedSender<EngineEvent>>,
}

/// Fan-out of engine events to callbacks and channel subscribers
#[derive(Clone, Default)]
pub struct EventBus {
  inner: Arc<Mutex<Subscribers>>,
}

impl EventBus {
  pub fn new() -> Self {
    Self::default()
  }

  /// Register a callback invoked for every event
  pub fn on_update<F>(&self, callback: F)
  where
    F: Fn(&EngineEvent) + Send + Sync + 'static,
  {
    self
      .inner
      .lock()
      .unwrap_or_else(PoisonError::into_inner)
      .listeners
      .push(Arc::new(callback));
  }

  /// Receive events on a channel. Dropping the receiver unsubscribes.
  pub fn subscribe(&self) -> mpsc::UnboundedReceiver<EngineEvent> {
    let (tx, rx) = mpsc::unbounded_channel();
    self
      .inner
      .lock()
      .unwrap_or_else(PoisonError::into_inner)
      .channels
      .push(tx);
    rx
  }

  pub fn emit(&self, event: EngineEvent) {
    // Callbacks run outside the lock so they may register further listeners
    let listeners = {
      let mut subscribers = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
      subscribers
        .channels
        .retain(|tx| tx.send(event.clone()).is_ok());
      subscribers.listeners.clone()
    };
    for listener in listeners {
      listener(&event);
    }
  }
}
