//! Walks the paginated issues endpoint of one repository.
//!
//! Page 1 is fetched alone (it carries the revalidation token and tells us
//! whether more pages exist). Later pages run in a rolling window through
//! the page limiter and are assembled back in page order.

use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use futures::stream::{FuturesUnordered, StreamExt};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::github::api_types::{decode_issue_page, IssuePage};
use crate::github::client::ApiRequest;
use crate::github::types::{Issue, Repository};

use super::error::{Result, SyncError};
use super::limiter::ConcurrencyLimiter;
use super::session::{ApiSession, SessionResponse};

/// Hard stop for runaway walks (100 pages of 100 issues).
pub const MAX_PAGES: u32 = 100;

/// Why a walk ended.
#[derive(Debug, Clone, PartialEq)]
pub enum WalkStop {
  /// A short or empty page was reached
  Complete,
  /// Remaining pages were abandoned on a rate-limit response
  RateLimited { reset_at: Option<DateTime<Utc>> },
  /// A later page failed; earlier pages are kept
  Failed(SyncError),
  /// The page cap was reached before a short page
  Truncated,
}

#[derive(Debug, Clone)]
pub struct Walk {
  pub issues: Vec<Issue>,
  /// Revalidation token of page 1
  pub etag: Option<String>,
  pub pages: u32,
  pub stop: WalkStop,
}

impl Walk {
  pub fn is_complete(&self) -> bool {
    self.stop == WalkStop::Complete
  }
}

#[derive(Debug, Clone)]
pub enum WalkOutcome {
  /// The server confirmed the cached collection is current
  NotModified,
  Fetched(Walk),
}

#[derive(Clone)]
pub struct PaginatedFetcher {
  session: Arc<ApiSession>,
  limiter: ConcurrencyLimiter,
  owner: String,
  per_page: u32,
  window: usize,
}

impl PaginatedFetcher {
  pub fn new(
    session: Arc<ApiSession>,
    limiter: ConcurrencyLimiter,
    owner: impl Into<String>,
    per_page: u32,
    window: usize,
  ) -> Self {
    Self {
      session,
      limiter,
      owner: owner.into(),
      per_page: per_page.clamp(1, 100),
      window: window.max(1),
    }
  }

  fn page_request(&self, repo: &Repository, state: &str, page: u32) -> ApiRequest {
    ApiRequest::get(format!("/repos/{}/{}/issues", self.owner, repo.name))
      .param("state", state)
      .param("per_page", self.per_page)
      .param("page", page)
  }

  async fn fetch_page(
    &self,
    repo: &Repository,
    state: &str,
    page: u32,
    cancel: &CancellationToken,
  ) -> (u32, Result<IssuePage>) {
    let result = self
      .limiter
      .run(async {
        match self
          .session
          .get(self.page_request(repo, state, page), cancel)
          .await?
        {
          SessionResponse::Body { bytes, .. } => {
            decode_issue_page(&bytes, repo).map_err(SyncError::decode)
          }
          SessionResponse::NotModified => Err(SyncError::network(format!(
            "Unexpected 304 for page {} of {}",
            page, repo.name
          ))),
        }
      })
      .await;
    (page, result)
  }

  fn is_last(&self, page: &IssuePage) -> bool {
    page.raw_len < self.per_page as usize
  }

  /// Fetch every page of `repo` issues in `state`.
  ///
  /// `etag` is attached to page 1 only. Errors on page 1 are returned as
  /// errors, except rate limiting, which yields an empty partial walk.
  /// Errors on later pages produce a partial walk.
  pub async fn walk(
    &self,
    repo: &Repository,
    state: &str,
    etag: Option<&str>,
    cancel: &CancellationToken,
  ) -> Result<WalkOutcome> {
    let first_request = self.page_request(repo, state, 1).with_etag(etag);
    let first = self
      .limiter
      .run(self.session.get(first_request, cancel))
      .await;

    let (bytes, first_etag) = match first {
      Ok(SessionResponse::NotModified) => {
        debug!(repo = %repo.name, state, "Not modified");
        return Ok(WalkOutcome::NotModified);
      }
      Ok(SessionResponse::Body { bytes, etag }) => (bytes, etag),
      Err(SyncError::RateLimitExceeded { reset_at }) => {
        return Ok(WalkOutcome::Fetched(Walk {
          issues: Vec::new(),
          etag: None,
          pages: 0,
          stop: WalkStop::RateLimited { reset_at },
        }))
      }
      Err(e) => return Err(e),
    };

    let first_page = decode_issue_page(&bytes, repo).map_err(SyncError::decode)?;
    log_page(repo, 1, &first_page);
    let mut done = self.is_last(&first_page);
    let mut pages: BTreeMap<u32, Vec<Issue>> = BTreeMap::new();
    pages.insert(1, first_page.issues);

    let mut stop = WalkStop::Complete;
    let mut next_page = 2;
    let mut in_flight = FuturesUnordered::new();

    loop {
      while !done && in_flight.len() < self.window && next_page <= MAX_PAGES {
        in_flight.push(self.fetch_page(repo, state, next_page, cancel));
        next_page += 1;
      }

      let Some((page, result)) = in_flight.next().await else {
        break;
      };

      match result {
        Ok(decoded) => {
          log_page(repo, page, &decoded);
          if self.is_last(&decoded) {
            // In-flight pages still finish; nothing new is scheduled
            done = true;
          }
          pages.insert(page, decoded.issues);
        }
        Err(SyncError::Cancelled) => return Err(SyncError::Cancelled),
        Err(SyncError::RateLimitExceeded { reset_at }) => {
          info!(repo = %repo.name, page, "Rate limited, abandoning remaining pages");
          stop = WalkStop::RateLimited { reset_at };
          break;
        }
        Err(e) => {
          warn!(repo = %repo.name, page, error = %e, "Page fetch failed");
          done = true;
          if stop == WalkStop::Complete {
            stop = WalkStop::Failed(e);
          }
        }
      }
    }

    if !done && next_page > MAX_PAGES && stop == WalkStop::Complete {
      warn!(repo = %repo.name, "Stopped after {} pages", MAX_PAGES);
      stop = WalkStop::Truncated;
    }

    let page_count = pages.len() as u32;
    let mut seen = HashSet::new();
    let issues: Vec<Issue> = pages
      .into_values()
      .flatten()
      .filter(|issue| seen.insert(issue.id))
      .collect();

    debug!(repo = %repo.name, state, issues = issues.len(), pages = page_count, "Walk finished");
    Ok(WalkOutcome::Fetched(Walk {
      issues,
      etag: first_etag,
      pages: page_count,
      stop,
    }))
  }
}

fn log_page(repo: &Repository, page: u32, decoded: &IssuePage) {
  debug!(
    repo = %repo.name,
    page,
    records = decoded.raw_len,
    issues = decoded.issues.len(),
    pull_requests = decoded.pull_requests,
    discarded = decoded.discarded,
    "Page decoded"
  );
}
