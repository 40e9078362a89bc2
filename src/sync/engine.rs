//! The synchronizer and the `Engine` facade presentation code talks to.
//!
//! Per repository and state scope the engine moves through
//! `Uncached -> Fetching -> Cached` and `Cached -> Revalidating -> Cached`.
//! All mutable state lives in one `Engine` instance; engines never share
//! in-memory state.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use chrono::{DateTime, Utc};
use futures::stream::{FuturesUnordered, StreamExt};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::cache::{CacheKey, CacheSource, ConditionalCache, EntryMetadata, KvStore, NoopStore, SqliteStore};
use crate::config::Config;
use crate::debounce::Debouncer;
use crate::event::{EngineEvent, EventBus};
use crate::github::api_types::{decode_single_issue, ApiComment};
use crate::github::catalog::{CatalogContext, CatalogSource, ManifestCatalog, RemoteCatalog};
use crate::github::client::{ApiRequest, HttpTransport, Transport};
use crate::github::types::{Comment, Issue, Repository};
use crate::query::{self, FilterState, Page, RepoSelector, StateFilter};

use super::error::{Result, SyncError};
use super::fetcher::{PaginatedFetcher, WalkOutcome, WalkStop};
use super::limiter::Limiters;
use super::rate_limit::{RateLimitLevel, RateLimitState};
use super::session::{ApiSession, SessionResponse};

/// Lower bound on the auto refresh interval.
const MIN_AUTO_REFRESH_PERIOD: std::time::Duration = std::time::Duration::from_secs(1);

/// Engine tuning, normally derived from [`Config`].
#[derive(Debug, Clone)]
pub struct EngineOptions {
  pub owner: String,
  /// Fetched first; the only repository in anonymous mode
  pub default_repo: String,
  pub ttl: chrono::Duration,
  pub per_page: u32,
  pub page_window: usize,
  pub page_concurrency: usize,
  pub repo_concurrency: usize,
  pub count_concurrency: usize,
  pub page_size: usize,
  pub auto_refresh: bool,
  pub search_debounce: std::time::Duration,
}

impl EngineOptions {
  pub fn from_config(config: &Config) -> Self {
    Self {
      owner: config.github.owner.clone(),
      default_repo: config.github.default_repo.clone(),
      ttl: config.cache.ttl(),
      per_page: config.sync.per_page,
      page_window: config.sync.page_window,
      page_concurrency: config.sync.page_concurrency,
      repo_concurrency: config.sync.repo_concurrency,
      count_concurrency: config.sync.count_concurrency,
      page_size: config.sync.page_size,
      auto_refresh: config.cache.auto_refresh,
      search_debounce: std::time::Duration::from_millis(config.sync.search_debounce_ms),
    }
  }
}

impl Default for EngineOptions {
  fn default() -> Self {
    Self::from_config(&Config::default())
  }
}

/// Synchronization state of one (repository, state) scope.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RepoSyncStatus {
  Uncached,
  Fetching,
  Cached { written_at: DateTime<Utc> },
  Revalidating,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum MergeMode {
  /// Add ids not yet present; existing entries win
  Append,
  /// Replace everything in the repository/state scope
  Replace,
  /// Insert or overwrite by id, keep everything else
  Upsert,
}

/// What one refresh pass did, per repository name.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SyncReport {
  /// Fetched from the network (including zero-issue results)
  pub loaded: Vec<String>,
  /// Served from a fresh cache entry or confirmed unchanged
  pub cached: Vec<String>,
  /// Walk cut short; whatever arrived was merged
  pub partial: Vec<String>,
  /// Not attempted because the rate limit was exhausted
  pub skipped: Vec<String>,
  pub dropped: Vec<String>,
  pub failed: Vec<String>,
  pub rate_limited: bool,
  pub cancelled: bool,
}

#[derive(Debug)]
enum RepoOutcome {
  Loaded,
  Cached,
  Partial { rate_limited: bool },
  Skipped,
  Dropped,
  Failed,
  Cancelled,
}

impl SyncReport {
  fn record(&mut self, repo: String, outcome: RepoOutcome) {
    match outcome {
      RepoOutcome::Loaded => self.loaded.push(repo),
      RepoOutcome::Cached => self.cached.push(repo),
      RepoOutcome::Partial { rate_limited } => {
        self.rate_limited |= rate_limited;
        self.partial.push(repo);
      }
      RepoOutcome::Skipped => self.skipped.push(repo),
      RepoOutcome::Dropped => self.dropped.push(repo),
      RepoOutcome::Failed => self.failed.push(repo),
      RepoOutcome::Cancelled => self.cancelled = true,
    }
  }
}

#[derive(Default)]
struct SyncState {
  catalog: Vec<Repository>,
  catalog_loaded: bool,
  dropped: HashSet<String>,
  /// The unified collection, keyed by issue id
  issues: HashMap<u64, Issue>,
  status: HashMap<(String, StateFilter), RepoSyncStatus>,
  active_state: StateFilter,
}

struct Inner {
  options: EngineOptions,
  session: Arc<ApiSession>,
  fetcher: PaginatedFetcher,
  cache: ConditionalCache,
  limiters: Limiters,
  catalog: Arc<dyn CatalogSource>,
  events: EventBus,
  debouncer: Debouncer,
  state: Mutex<SyncState>,
  cycle: Mutex<CancellationToken>,
}

/// Owns every piece of mutable synchronization state. Cheap to clone.
#[derive(Clone)]
pub struct Engine {
  inner: Arc<Inner>,
}

impl Engine {
  pub fn new(
    options: EngineOptions,
    token: Option<String>,
    transport: Arc<dyn Transport>,
    store: Arc<dyn KvStore>,
    catalog: Arc<dyn CatalogSource>,
  ) -> Self {
    let events = EventBus::new();
    let session = Arc::new(ApiSession::new(transport, token, store.clone(), events.clone()));
    let limiters = Limiters::new(
      options.page_concurrency,
      options.repo_concurrency,
      options.count_concurrency,
    );
    let fetcher = PaginatedFetcher::new(
      session.clone(),
      limiters.page.clone(),
      options.owner.clone(),
      options.per_page,
      options.page_window,
    );

    Self {
      inner: Arc::new(Inner {
        cache: ConditionalCache::new(store, options.ttl),
        debouncer: Debouncer::new(options.search_debounce),
        options,
        session,
        fetcher,
        limiters,
        catalog,
        events,
        state: Mutex::new(SyncState::default()),
        cycle: Mutex::new(CancellationToken::new()),
      }),
    }
  }

  /// Build an engine from configuration: HTTP transport, SQLite cache (or
  /// none when disabled), catalog per `discover_all`/manifest settings and
  /// the credential from the environment.
  pub fn from_config(config: &Config) -> color_eyre::Result<Self> {
    let transport = HttpTransport::new(&config.github.api_url)?;

    let store: Arc<dyn KvStore> = if config.cache.enabled {
      Arc::new(SqliteStore::open(config.cache.path.as_deref())?)
    } else {
      Arc::new(NoopStore)
    };

    let catalog: Arc<dyn CatalogSource> = if config.sync.discover_all {
      Arc::new(RemoteCatalog)
    } else if let Some(path) = &config.manifest {
      Arc::new(ManifestCatalog::from_path(path)?)
    } else if !config.repositories.is_empty() {
      Arc::new(ManifestCatalog::new(config.repositories.clone()))
    } else {
      Arc::new(ManifestCatalog::fallback())
    };

    Ok(Self::new(
      EngineOptions::from_config(config),
      Config::api_token(),
      Arc::new(transport),
      store,
      catalog,
    ))
  }

  fn state(&self) -> MutexGuard<'_, SyncState> {
    self.inner.state.lock().unwrap_or_else(PoisonError::into_inner)
  }

  fn current_cycle(&self) -> CancellationToken {
    self
      .inner
      .cycle
      .lock()
      .unwrap_or_else(PoisonError::into_inner)
      .clone()
  }

  /// Cancel everything in flight and issue a fresh cycle token.
  fn begin_cycle(&self) -> CancellationToken {
    let token = CancellationToken::new();
    let previous = std::mem::replace(
      &mut *self.inner.cycle.lock().unwrap_or_else(PoisonError::into_inner),
      token.clone(),
    );
    previous.cancel();
    self.inner.session.begin_cycle();
    token
  }

  pub fn has_credential(&self) -> bool {
    self.inner.session.credentials().has_credential()
  }

  // --------------------------------------------------------------------------
  // Notifications
  // --------------------------------------------------------------------------

  pub fn on_update<F>(&self, callback: F)
  where
    F: Fn(&EngineEvent) + Send + Sync + 'static,
  {
    self.inner.events.on_update(callback);
  }

  pub fn subscribe(&self) -> tokio::sync::mpsc::UnboundedReceiver<EngineEvent> {
    self.inner.events.subscribe()
  }

  fn emit(&self, event: EngineEvent) {
    self.inner.events.emit(event);
  }

  // --------------------------------------------------------------------------
  // Catalog
  // --------------------------------------------------------------------------

  /// Load the repository catalog. Falls back to the built-in list when the
  /// configured source fails or is empty.
  pub async fn load_repositories(&self) -> Vec<Repository> {
    let cancel = self.current_cycle();
    let ctx = CatalogContext {
      session: &self.inner.session,
      cache: &self.inner.cache,
      owner: &self.inner.options.owner,
      cancel: &cancel,
    };

    let mut loaded = match self.inner.catalog.load(ctx).await {
      Ok(repos) if !repos.is_empty() => repos,
      Ok(_) => {
        warn!(source = self.inner.catalog.name(), "Catalog is empty, using built-in list");
        self.fallback_catalog()
      }
      Err(e) => {
        warn!(source = self.inner.catalog.name(), error = %e, "Catalog load failed, using built-in list");
        self.fallback_catalog()
      }
    };

    let default_repo = &self.inner.options.default_repo;
    if !loaded.iter().any(|r| &r.name == default_repo) {
      loaded.insert(0, Repository::new(&self.inner.options.owner, default_repo));
    }

    let mut state = self.state();
    for repo in loaded.iter_mut() {
      if let Some(previous) = state.catalog.iter().find(|p| p.name == repo.name) {
        repo.inherit_counts(previous);
      }
    }
    info!(count = loaded.len(), source = self.inner.catalog.name(), "Catalog loaded");
    state.catalog = loaded.clone();
    state.catalog_loaded = true;
    loaded
  }

  fn fallback_catalog(&self) -> Vec<Repository> {
    ManifestCatalog::fallback()
      .entries()
      .iter()
      .cloned()
      .map(|entry| entry.into_repository(&self.inner.options.owner))
      .collect()
  }

  /// Repositories synchronized by an `all` refresh. Anonymous mode only
  /// uses the default repository to conserve budget.
  pub fn repositories(&self) -> Vec<Repository> {
    let anonymous = !self.has_credential();
    let default_repo = &self.inner.options.default_repo;
    let state = self.state();
    state
      .catalog
      .iter()
      .filter(|r| !state.dropped.contains(&r.name))
      .filter(|r| !anonymous || &r.name == default_repo)
      .cloned()
      .collect()
  }

  fn resolve_targets(&self, target: &RepoSelector) -> Vec<Repository> {
    match target {
      RepoSelector::All => self.repositories(),
      RepoSelector::Named(name) => {
        let state = self.state();
        if state.dropped.contains(name) {
          return Vec::new();
        }
        let repo = state
          .catalog
          .iter()
          .find(|r| &r.name == name)
          .cloned()
          .unwrap_or_else(|| Repository::new(&self.inner.options.owner, name));
        vec![repo]
      }
    }
  }

  // --------------------------------------------------------------------------
  // Synchronization
  // --------------------------------------------------------------------------

  /// Start a new cycle for `filter`: cancels the previous cycle, loads the
  /// catalog on first use and refreshes the selected repositories.
  pub async fn load_data(&self, filter: &FilterState, force: bool) -> SyncReport {
    self.begin_cycle();
    let needs_catalog = {
      let mut state = self.state();
      state.active_state = filter.state;
      !state.catalog_loaded
    };
    if needs_catalog {
      self.load_repositories().await;
    }
    self.refresh(&filter.repo, force).await
  }

  /// Refresh `target`. The default repository goes first; the rest run
  /// through the repository limiter and are skipped once the rate limit is
  /// exhausted.
  pub async fn refresh(&self, target: &RepoSelector, force: bool) -> SyncReport {
    let cancel = self.current_cycle();
    // Each pass may warn about the rate limit once
    self.inner.session.begin_cycle();
    let state_filter = self.state().active_state;
    let mut targets = self.resolve_targets(target);
    let mut report = SyncReport::default();

    let halt = AtomicBool::new(false);
    let default_repo = &self.inner.options.default_repo;
    if let Some(pos) = targets.iter().position(|r| &r.name == default_repo) {
      let repo = targets.remove(pos);
      let (name, outcome) = self
        .sync_limited(&repo, state_filter, force, &cancel, &halt)
        .await;
      report.record(name, outcome);
    }

    let mut pending: FuturesUnordered<_> = targets
      .iter()
      .map(|repo| self.sync_limited(repo, state_filter, force, &cancel, &halt))
      .collect();
    while let Some((name, outcome)) = pending.next().await {
      report.record(name, outcome);
    }
    drop(pending);

    if !report.cancelled {
      let issues = self.state().issues.len();
      debug!(?report, "Refresh finished");
      self.emit(EngineEvent::CycleCompleted { issues });
    }
    report
  }

  async fn sync_limited(
    &self,
    repo: &Repository,
    state: StateFilter,
    force: bool,
    cancel: &CancellationToken,
    halt: &AtomicBool,
  ) -> (String, RepoOutcome) {
    let outcome = self
      .inner
      .limiters
      .repository
      .run(async {
        if cancel.is_cancelled() {
          return RepoOutcome::Cancelled;
        }
        if halt.load(Ordering::SeqCst) || self.inner.session.check_rate_limit().is_err() {
          // A fresh cache entry can still be served without spending budget
          if !force && self.serve_fresh_cache(repo, state) {
            return RepoOutcome::Cached;
          }
          debug!(repo = %repo.name, "Skipped, rate limit exhausted");
          return RepoOutcome::Skipped;
        }
        self.sync_repository(repo, state, force, cancel).await
      })
      .await;
    if matches!(outcome, RepoOutcome::Partial { rate_limited: true }) {
      halt.store(true, Ordering::SeqCst);
    }
    (repo.name.clone(), outcome)
  }

  fn set_status(&self, repo: &str, state: StateFilter, status: RepoSyncStatus) {
    self
      .state()
      .status
      .insert((repo.to_string(), state), status);
  }

  /// Current state machine position of a scope.
  pub fn status(&self, repo: &str, state: StateFilter) -> RepoSyncStatus {
    self
      .state()
      .status
      .get(&(repo.to_string(), state))
      .copied()
      .unwrap_or(RepoSyncStatus::Uncached)
  }

  fn read_cache(&self, key: &CacheKey) -> Option<crate::cache::CachedRead<Issue>> {
    match self.inner.cache.read::<Issue>(key) {
      Ok(read) => read,
      Err(e) => {
        warn!(key = %key, error = %e, "Cache read failed");
        None
      }
    }
  }

  /// Merge a fresh cache entry if there is one. Returns whether it did.
  fn serve_fresh_cache(&self, repo: &Repository, state: StateFilter) -> bool {
    let key = CacheKey::issues(&repo.name, state.as_param());
    let Some(read) = self.read_cache(&key).filter(|r| r.fresh) else {
      return false;
    };
    let count = read.entry.entities.len();
    let resolved = read.entry.metadata.issue_count.map(|c| c as usize).unwrap_or(count);
    self.merge(&repo.name, state, read.entry.entities, MergeMode::Append);
    self.set_status(
      &repo.name,
      state,
      RepoSyncStatus::Cached {
        written_at: read.entry.written_at,
      },
    );
    self.update_counts(&repo.name, state, resolved);
    debug!(repo = %repo.name, count, "Served from cache");
    self.emit(EngineEvent::RepositoryLoaded {
      repo: repo.name.clone(),
      count,
      source: CacheSource::CacheFresh,
    });
    true
  }

  async fn sync_repository(
    &self,
    repo: &Repository,
    state: StateFilter,
    force: bool,
    cancel: &CancellationToken,
  ) -> RepoOutcome {
    if !force && self.serve_fresh_cache(repo, state) {
      return RepoOutcome::Cached;
    }

    let key = CacheKey::issues(&repo.name, state.as_param());
    let cached = self.read_cache(&key);
    let previous_status = cached
      .as_ref()
      .map(|c| RepoSyncStatus::Cached {
        written_at: c.entry.written_at,
      })
      .unwrap_or(RepoSyncStatus::Uncached);
    let revalidating = cached.is_some();
    self.set_status(
      &repo.name,
      state,
      if revalidating {
        RepoSyncStatus::Revalidating
      } else {
        RepoSyncStatus::Fetching
      },
    );

    let etag = cached.as_ref().and_then(|c| c.entry.etag.clone());
    let result = self
      .inner
      .fetcher
      .walk(repo, state.as_param(), etag.as_deref(), cancel)
      .await;

    // Responses from a superseded cycle never touch state
    if cancel.is_cancelled() {
      self.set_status(&repo.name, state, previous_status);
      return RepoOutcome::Cancelled;
    }

    match result {
      Err(SyncError::Cancelled) => {
        self.set_status(&repo.name, state, previous_status);
        RepoOutcome::Cancelled
      }
      Err(e) if e.is_not_found() => {
        self.set_status(&repo.name, state, RepoSyncStatus::Uncached);
        self.drop_repository(&repo.name, e.to_string());
        RepoOutcome::Dropped
      }
      Err(e) => {
        // Prior cached data stays authoritative
        warn!(repo = %repo.name, error = %e, "Repository fetch failed");
        self.set_status(&repo.name, state, previous_status);
        RepoOutcome::Failed
      }
      Ok(WalkOutcome::NotModified) => {
        let entry = match self.inner.cache.touch::<Issue>(&key) {
          Ok(Some(entry)) => Some(entry),
          Ok(None) => cached.map(|c| c.entry),
          Err(e) => {
            warn!(key = %key, error = %e, "Failed to touch cache entry");
            cached.map(|c| c.entry)
          }
        };
        let Some(entry) = entry else {
          self.set_status(&repo.name, state, RepoSyncStatus::Uncached);
          return RepoOutcome::Failed;
        };
        let count = entry.entities.len();
        self.merge(&repo.name, state, entry.entities, MergeMode::Replace);
        self.set_status(
          &repo.name,
          state,
          RepoSyncStatus::Cached {
            written_at: entry.written_at,
          },
        );
        self.update_counts(&repo.name, state, count);
        self.emit(EngineEvent::RepositoryLoaded {
          repo: repo.name.clone(),
          count,
          source: CacheSource::Revalidated,
        });
        RepoOutcome::Cached
      }
      Ok(WalkOutcome::Fetched(walk)) => {
        let count = walk.issues.len();
        match walk.stop {
          WalkStop::Complete if count == 0 => {
            // Nothing is persisted for an empty scope, and what was cached
            // before is obsolete
            if revalidating {
              debug!(repo = %repo.name, "Scope is now empty, dropping cached issues");
              if let Err(e) = self.inner.cache.remove(&key) {
                warn!(key = %key, error = %e, "Failed to remove cache entry");
              }
            }
            self.merge(&repo.name, state, Vec::new(), MergeMode::Replace);
            self.set_status(&repo.name, state, RepoSyncStatus::Uncached);
            self.update_counts(&repo.name, state, 0);
            self.emit(EngineEvent::RepositoryLoaded {
              repo: repo.name.clone(),
              count: 0,
              source: CacheSource::Network,
            });
            RepoOutcome::Loaded
          }
          WalkStop::Complete => {
            let issues = stamp(walk.issues);
            let metadata = EntryMetadata {
              rate_limit: Some(self.inner.session.rate_limit()),
              issue_count: Some(count as u32),
            };
            let status = match self.inner.cache.write(&key, &issues, walk.etag, metadata) {
              Ok(_) => RepoSyncStatus::Cached {
                written_at: Utc::now(),
              },
              Err(e) => {
                warn!(key = %key, error = %e, "Failed to write cache entry");
                RepoSyncStatus::Uncached
              }
            };
            let mode = if revalidating || force {
              MergeMode::Replace
            } else {
              MergeMode::Append
            };
            self.merge(&repo.name, state, issues, mode);
            self.set_status(&repo.name, state, status);
            self.update_counts(&repo.name, state, count);
            info!(repo = %repo.name, count, pages = walk.pages, "Repository loaded");
            self.emit(EngineEvent::RepositoryLoaded {
              repo: repo.name.clone(),
              count,
              source: CacheSource::Network,
            });
            RepoOutcome::Loaded
          }
          WalkStop::RateLimited { .. } | WalkStop::Failed(_) | WalkStop::Truncated => {
            let rate_limited = matches!(walk.stop, WalkStop::RateLimited { .. });
            // Partial results are merged for this session only
            self.merge(&repo.name, state, stamp(walk.issues), MergeMode::Upsert);
            self.set_status(&repo.name, state, previous_status);
            if count > 0 {
              self.emit(EngineEvent::RepositoryLoaded {
                repo: repo.name.clone(),
                count,
                source: CacheSource::Partial,
              });
            }
            RepoOutcome::Partial { rate_limited }
          }
        }
      }
    }
  }

  fn merge(&self, repo: &str, scope: StateFilter, incoming: Vec<Issue>, mode: MergeMode) {
    let mut state = self.state();
    let mut replaced: HashMap<u64, Issue> = HashMap::new();
    if mode == MergeMode::Replace {
      let ids: Vec<u64> = state
        .issues
        .values()
        .filter(|i| i.repository == repo && scope.matches(i.state))
        .map(|i| i.id)
        .collect();
      for id in ids {
        if let Some(issue) = state.issues.remove(&id) {
          replaced.insert(id, issue);
        }
      }
    }

    for mut issue in incoming {
      let existing = replaced.get(&issue.id).or_else(|| state.issues.get(&issue.id));
      if let Some(existing) = existing {
        if mode == MergeMode::Append {
          continue;
        }
        issue.last_refreshed = issue.last_refreshed.max(existing.last_refreshed);
        if issue.comment_details.is_none() {
          issue.comment_details = existing.comment_details.clone();
        }
      }
      state.issues.insert(issue.id, issue);
    }
  }

  fn update_counts(&self, repo: &str, scope: StateFilter, count: usize) {
    // The default repository always has issues; zero means "not resolved"
    let resolved = if count == 0 && repo == self.inner.options.default_repo {
      None
    } else {
      Some(count as u32)
    };
    let mut state = self.state();
    if let Some(entry) = state.catalog.iter_mut().find(|r| r.name == repo) {
      match scope {
        StateFilter::Open => entry.open_issue_count = resolved,
        StateFilter::Closed => entry.closed_issue_count = resolved,
        StateFilter::All => entry.total_issue_count = resolved,
      }
    }
  }

  fn drop_repository(&self, repo: &str, reason: String) {
    {
      let mut state = self.state();
      state.dropped.insert(repo.to_string());
      state.issues.retain(|_, i| i.repository != repo);
    }
    warn!(repo, reason = %reason, "Repository dropped from active set");
    self.emit(EngineEvent::RepositoryDropped {
      repo: repo.to_string(),
      reason,
    });
  }

  // --------------------------------------------------------------------------
  // Single issue operations
  // --------------------------------------------------------------------------

  fn locate(&self, id: u64) -> Result<(Repository, Issue)> {
    let state = self.state();
    let issue = state
      .issues
      .get(&id)
      .cloned()
      .ok_or_else(|| SyncError::not_found(format!("issue {}", id)))?;
    let repo = state
      .catalog
      .iter()
      .find(|r| r.name == issue.repository)
      .cloned()
      .unwrap_or_else(|| Repository::new(&self.inner.options.owner, &issue.repository));
    Ok((repo, issue))
  }

  /// Refetch one issue and replace it in the unified collection.
  pub async fn refresh_issue(&self, id: u64) -> Result<Issue> {
    let (repo, current) = self.locate(id)?;
    let path = format!(
      "/repos/{}/{}/issues/{}",
      self.inner.options.owner, repo.name, current.number
    );
    let cancel = self.current_cycle();

    let response = match self.inner.session.get(ApiRequest::get(path), &cancel).await {
      Ok(response) => response,
      Err(e) if e.is_not_found() => {
        self.state().issues.remove(&id);
        return Err(e);
      }
      Err(e) => return Err(e),
    };

    let bytes = match response {
      SessionResponse::Body { bytes, .. } => bytes,
      SessionResponse::NotModified => return Ok(current),
    };
    let Some(issue) = decode_single_issue(&bytes, &repo).map_err(SyncError::decode)? else {
      // Converted to a pull request or no longer valid
      self.state().issues.remove(&id);
      return Err(SyncError::not_found(format!("issue {}", id)));
    };

    let issue = stamp(vec![issue]).remove(0);
    self.merge(&repo.name, StateFilter::All, vec![issue], MergeMode::Upsert);
    self
      .state()
      .issues
      .get(&id)
      .cloned()
      .ok_or_else(|| SyncError::not_found(format!("issue {}", id)))
  }

  /// Fetch comment bodies for one issue and attach them to it.
  pub async fn load_comments(&self, id: u64) -> Result<Vec<Comment>> {
    let (repo, issue) = self.locate(id)?;
    let cancel = self.current_cycle();
    let path = format!(
      "/repos/{}/{}/issues/{}/comments",
      self.inner.options.owner, repo.name, issue.number
    );

    let mut comments = Vec::new();
    for page in 1..=10u32 {
      let request = ApiRequest::get(path.as_str())
        .param("per_page", 100)
        .param("page", page);
      let bytes = match self.inner.session.get(request, &cancel).await? {
        SessionResponse::Body { bytes, .. } => bytes,
        SessionResponse::NotModified => break,
      };
      let records: Vec<ApiComment> = serde_json::from_slice(&bytes).map_err(SyncError::decode)?;
      let count = records.len();
      comments.extend(records.into_iter().map(Comment::from));
      if count < 100 {
        break;
      }
    }

    if let Some(issue) = self.state().issues.get_mut(&id) {
      issue.comment_details = Some(comments.clone());
    }
    Ok(comments)
  }

  /// Resolve open-issue counts for every active repository through the
  /// count limiter. Fresh cache entries are used before the network.
  pub async fn load_issue_counts(&self) -> Vec<Repository> {
    let cancel = self.current_cycle();
    let repos = self.repositories();
    let mut pending: FuturesUnordered<_> = repos
      .iter()
      .map(|repo| {
        self
          .inner
          .limiters
          .count
          .run(self.count_open_issues(repo, &cancel))
      })
      .collect();
    while pending.next().await.is_some() {}
    drop(pending);
    self.repositories()
  }

  async fn count_open_issues(&self, repo: &Repository, cancel: &CancellationToken) {
    let key = CacheKey::issues(&repo.name, StateFilter::Open.as_param());
    if let Some(read) = self.read_cache(&key).filter(|r| r.fresh) {
      let count = read
        .entry
        .metadata
        .issue_count
        .map(|c| c as usize)
        .unwrap_or(read.entry.entities.len());
      self.update_counts(&repo.name, StateFilter::Open, count);
      return;
    }
    if self.inner.session.is_rate_limited() {
      return;
    }

    match self
      .inner
      .fetcher
      .walk(repo, StateFilter::Open.as_param(), None, cancel)
      .await
    {
      Ok(WalkOutcome::Fetched(walk)) if walk.is_complete() => {
        let count = walk.issues.len();
        let metadata = EntryMetadata {
          rate_limit: Some(self.inner.session.rate_limit()),
          issue_count: Some(count as u32),
        };
        let issues = stamp(walk.issues);
        if let Err(e) = self.inner.cache.write(&key, &issues, walk.etag, metadata) {
          warn!(key = %key, error = %e, "Failed to write cache entry");
        }
        self.update_counts(&repo.name, StateFilter::Open, count);
      }
      Ok(_) => {}
      Err(e) if e.is_not_found() => self.drop_repository(&repo.name, e.to_string()),
      Err(e) => debug!(repo = %repo.name, error = %e, "Count unavailable"),
    }
  }

  // --------------------------------------------------------------------------
  // Reads
  // --------------------------------------------------------------------------

  /// Filtered, sorted page of the unified collection. Never touches the
  /// network.
  pub fn get_page(&self, filter: &FilterState) -> Page {
    let state = self.state();
    query::apply(state.issues.values(), filter, self.inner.options.page_size)
  }

  /// `get_page` behind the search debouncer. `None` when a newer search
  /// replaced this one.
  pub async fn search(&self, filter: FilterState) -> Option<Page> {
    self
      .inner
      .debouncer
      .call(async move { self.get_page(&filter) })
      .await
  }

  pub fn issue_count(&self) -> usize {
    self.state().issues.len()
  }

  pub fn labels(&self) -> Vec<String> {
    query::label_facet(self.state().issues.values())
  }

  pub fn assignees(&self) -> Vec<String> {
    query::assignee_facet(self.state().issues.values())
  }

  pub fn rate_limit(&self) -> RateLimitState {
    self.inner.session.rate_limit()
  }

  pub fn rate_limit_level(&self) -> RateLimitLevel {
    self.inner.session.rate_limit_level()
  }

  pub fn remaining_budget(&self) -> u32 {
    self.inner.session.remaining_budget()
  }

  // --------------------------------------------------------------------------
  // Maintenance
  // --------------------------------------------------------------------------

  /// Delete every cache entry and reset per-repository memory state.
  pub fn clear_cache(&self) -> Result<usize> {
    let removed = self.inner.cache.clear().map_err(SyncError::storage)?;
    {
      let mut state = self.state();
      state.issues.clear();
      state.status.clear();
      for repo in state.catalog.iter_mut() {
        repo.open_issue_count = None;
        repo.closed_issue_count = None;
        repo.total_issue_count = None;
      }
    }
    self.inner.session.begin_cycle();
    info!(removed, "Cache cleared");
    Ok(removed)
  }

  /// Swap the credential. In-flight requests are cancelled and everything
  /// cached under the old identity is discarded.
  pub fn set_credential(&self, token: Option<String>) -> Result<()> {
    self.begin_cycle();
    self.inner.session.set_credential(token);
    self.state().dropped.clear();
    self.clear_cache()?;
    Ok(())
  }

  /// Periodically force-refresh every repository. Only runs with a
  /// credential and `auto_refresh` enabled; stops once the credential is
  /// gone.
  pub fn spawn_auto_refresh(&self) -> Option<JoinHandle<()>> {
    if !self.inner.options.auto_refresh || !self.has_credential() {
      return None;
    }
    let period = self
      .inner
      .options
      .ttl
      .to_std()
      .unwrap_or(std::time::Duration::from_secs(600))
      .max(MIN_AUTO_REFRESH_PERIOD);
    let engine = self.clone();
    Some(tokio::spawn(async move {
      let mut interval = tokio::time::interval(period);
      // The first tick completes immediately
      interval.tick().await;
      loop {
        interval.tick().await;
        if !engine.has_credential() {
          info!("Credential gone, stopping auto refresh");
          break;
        }
        let report = engine.refresh(&RepoSelector::All, true).await;
        debug!(?report, "Auto refresh finished");
      }
    }))
  }
}

/// Set `last_refreshed` on freshly fetched issues.
fn stamp(mut issues: Vec<Issue>) -> Vec<Issue> {
  let now = Utc::now();
  for issue in &mut issues {
    issue.last_refreshed = Some(now);
  }
  issues
}
