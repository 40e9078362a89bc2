//! Serde-deserializable types matching GitHub REST API responses.
//!
//! These types are separate from domain types so that a single malformed
//! record can be discarded without failing the whole page.

use chrono::{DateTime, Utc};
use serde::Deserialize;
use serde_json::Value;

use super::types::{Assignee, Comment, Issue, IssueState, Label, Repository};

// ============================================================================
// Common nested field types
// ============================================================================

#[derive(Debug, Deserialize)]
pub struct ApiLabel {
  pub name: String,
  pub color: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct ApiUser {
  pub login: String,
}

/// Error body returned alongside non-2xx statuses
#[derive(Debug, Default, Deserialize)]
pub struct ApiErrorBody {
  #[serde(default)]
  pub message: Option<String>,
}

impl ApiErrorBody {
  pub fn parse(body: &[u8]) -> Self {
    serde_json::from_slice(body).unwrap_or_default()
  }
}

// ============================================================================
// Issues endpoint
// ============================================================================

/// Issue-like record from `/repos/{owner}/{repo}/issues`.
///
/// Every field is optional so that validation happens in `into_issue`
/// rather than in serde.
#[derive(Debug, Deserialize)]
pub struct ApiIssue {
  pub id: Option<u64>,
  pub number: Option<u64>,
  pub title: Option<String>,
  pub body: Option<String>,
  pub state: Option<String>,
  pub created_at: Option<DateTime<Utc>>,
  pub updated_at: Option<DateTime<Utc>>,
  pub html_url: Option<String>,
  #[serde(default)]
  pub labels: Vec<ApiLabel>,
  #[serde(default)]
  pub assignees: Vec<ApiUser>,
  pub comments: Option<u32>,
  /// Present (and non-null) only on pull requests
  pub pull_request: Option<Value>,
}

impl ApiIssue {
  pub fn is_pull_request(&self) -> bool {
    self.pull_request.is_some()
  }

  /// Convert to a domain issue owned by `repo`, or `None` if the record
  /// fails validation.
  pub fn into_issue(self, repo: &Repository) -> Option<Issue> {
    let state = IssueState::parse(self.state.as_deref()?)?;
    let created_at = self.created_at?;
    let issue = Issue {
      id: self.id?,
      number: self.number?,
      title: self.title?,
      body: self.body,
      state,
      created_at,
      updated_at: self.updated_at.unwrap_or(created_at),
      repository: repo.name.clone(),
      repository_url: repo.url.clone(),
      html_url: self.html_url?,
      labels: self
        .labels
        .into_iter()
        .map(|l| Label {
          name: l.name,
          color: l.color,
        })
        .collect(),
      assignees: self
        .assignees
        .into_iter()
        .map(|a| Assignee { login: a.login })
        .collect(),
      comments: self.comments.unwrap_or(0),
      comment_details: None,
      last_refreshed: None,
    };
    issue.is_valid().then_some(issue)
  }
}

/// One decoded page of the issues endpoint.
#[derive(Debug)]
pub struct IssuePage {
  /// Number of records the server returned, before any filtering.
  /// This is what the pagination termination check looks at.
  pub raw_len: usize,
  pub issues: Vec<Issue>,
  pub pull_requests: usize,
  pub discarded: usize,
}

/// Decode a page body, stripping pull requests and invalid records.
pub fn decode_issue_page(body: &[u8], repo: &Repository) -> serde_json::Result<IssuePage> {
  let records: Vec<Value> = serde_json::from_slice(body)?;
  let raw_len = records.len();
  let mut issues = Vec::with_capacity(raw_len);
  let mut pull_requests = 0;
  let mut discarded = 0;

  for record in records {
    let Ok(api_issue) = serde_json::from_value::<ApiIssue>(record) else {
      discarded += 1;
      continue;
    };
    if api_issue.is_pull_request() {
      pull_requests += 1;
      continue;
    }
    match api_issue.into_issue(repo) {
      Some(issue) => issues.push(issue),
      None => discarded += 1,
    }
  }

  Ok(IssuePage {
    raw_len,
    issues,
    pull_requests,
    discarded,
  })
}

/// Decode a single issue response (`/repos/{owner}/{repo}/issues/{number}`).
pub fn decode_single_issue(body: &[u8], repo: &Repository) -> serde_json::Result<Option<Issue>> {
  let api_issue: ApiIssue = serde_json::from_slice(body)?;
  if api_issue.is_pull_request() {
    return Ok(None);
  }
  Ok(api_issue.into_issue(repo))
}

// ============================================================================
// Comments endpoint
// ============================================================================

#[derive(Debug, Deserialize)]
pub struct ApiComment {
  pub id: u64,
  pub user: Option<ApiUser>,
  #[serde(default)]
  pub body: String,
  pub created_at: DateTime<Utc>,
  pub html_url: Option<String>,
}

impl From<ApiComment> for Comment {
  fn from(c: ApiComment) -> Self {
    Self {
      id: c.id,
      author: c.user.map(|u| u.login),
      body: c.body,
      created_at: c.created_at,
      html_url: c.html_url,
    }
  }
}

// ============================================================================
// Repository listing endpoint
// ============================================================================

#[derive(Debug, Deserialize)]
pub struct ApiRepository {
  pub name: String,
  pub description: Option<String>,
  pub default_branch: Option<String>,
  pub html_url: Option<String>,
  #[serde(default = "default_true")]
  pub has_issues: bool,
  #[serde(default)]
  pub archived: bool,
}

fn default_true() -> bool {
  true
}

impl ApiRepository {
  /// Only repositories that accept issues and are not archived are listed.
  pub fn is_listable(&self) -> bool {
    self.has_issues && !self.archived
  }

  pub fn into_repository(self, owner: &str) -> Repository {
    let mut repo = Repository::new(owner, &self.name);
    repo.description = self.description.unwrap_or_default();
    if let Some(branch) = self.default_branch {
      repo.default_branch = branch;
    }
    if let Some(url) = self.html_url {
      repo.url = url;
    }
    repo
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use serde_json::json;

  fn repo() -> Repository {
    Repository::new("modelearth", "projects")
  }

  #[test]
  fn test_decode_strips_pull_requests_and_invalid_records() {
    let body = json!([
      {
        "id": 1, "number": 10, "title": "Real issue", "state": "open",
        "created_at": "2024-01-01T00:00:00Z", "updated_at": "2024-01-02T00:00:00Z",
        "html_url": "https://github.com/modelearth/projects/issues/10",
        "labels": [{"name": "bug", "color": "ff0000"}],
        "assignees": [{"login": "octocat"}],
        "comments": 2
      },
      {
        "id": 2, "number": 11, "title": "A PR", "state": "open",
        "created_at": "2024-01-01T00:00:00Z",
        "html_url": "https://github.com/modelearth/projects/pull/11",
        "pull_request": {"url": "https://api.github.com/x"}
      },
      {
        "id": 3, "number": 12, "title": "  ", "state": "open",
        "created_at": "2024-01-01T00:00:00Z",
        "html_url": "https://github.com/modelearth/projects/issues/12"
      },
      {
        "id": "not-a-number", "number": 13, "title": "Bad id", "state": "open",
        "created_at": "2024-01-01T00:00:00Z",
        "html_url": "https://github.com/modelearth/projects/issues/13"
      },
      {
        "id": 5, "number": 14, "title": "Weird state", "state": "draft",
        "created_at": "2024-01-01T00:00:00Z",
        "html_url": "https://github.com/modelearth/projects/issues/14"
      }
    ]);
    let page = decode_issue_page(body.to_string().as_bytes(), &repo()).unwrap();

    assert_eq!(page.raw_len, 5);
    assert_eq!(page.pull_requests, 1);
    assert_eq!(page.discarded, 3);
    assert_eq!(page.issues.len(), 1);

    let issue = &page.issues[0];
    assert_eq!(issue.number, 10);
    assert_eq!(issue.repository, "projects");
    assert_eq!(issue.repository_url, "https://github.com/modelearth/projects");
    assert!(issue.has_label("bug"));
    assert!(issue.is_assigned_to("octocat"));
    assert!(issue.last_refreshed.is_none());
  }

  #[test]
  fn test_missing_updated_at_falls_back_to_created() {
    let body = json!({
      "id": 1, "number": 1, "title": "t", "state": "closed",
      "created_at": "2024-03-01T00:00:00Z",
      "html_url": "https://github.com/modelearth/projects/issues/1"
    });
    let issue = decode_single_issue(body.to_string().as_bytes(), &repo())
      .unwrap()
      .unwrap();
    assert_eq!(issue.updated_at, issue.created_at);
    assert_eq!(issue.state, IssueState::Closed);
  }

  #[test]
  fn test_repository_listing_filter() {
    let archived: ApiRepository =
      serde_json::from_value(json!({"name": "old", "archived": true})).unwrap();
    let no_issues: ApiRepository =
      serde_json::from_value(json!({"name": "docs", "has_issues": false})).unwrap();
    let ok: ApiRepository = serde_json::from_value(json!({
      "name": "feed", "description": "FeedPlayer", "default_branch": "dev"
    }))
    .unwrap();

    assert!(!archived.is_listable());
    assert!(!no_issues.is_listable());
    assert!(ok.is_listable());

    let repo = ok.into_repository("modelearth");
    assert_eq!(repo.default_branch, "dev");
    assert_eq!(repo.url, "https://github.com/modelearth/feed");
  }
}
