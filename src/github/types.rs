use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::cache::Cacheable;

/// Issue state as reported by the remote API.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IssueState {
  Open,
  Closed,
}

impl IssueState {
  pub fn parse(s: &str) -> Option<Self> {
    match s {
      "open" => Some(Self::Open),
      "closed" => Some(Self::Closed),
      _ => None,
    }
  }

  pub fn as_str(&self) -> &'static str {
    match self {
      Self::Open => "open",
      Self::Closed => "closed",
    }
  }
}

/// Issue label
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Label {
  pub name: String,
  pub color: Option<String>,
}

/// Issue assignee
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Assignee {
  pub login: String,
}

/// A loaded issue comment
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Comment {
  pub id: u64,
  pub author: Option<String>,
  pub body: String,
  pub created_at: DateTime<Utc>,
  pub html_url: Option<String>,
}

/// An issue merged into the unified collection.
///
/// Pull requests never become an `Issue`; they are stripped when a page is
/// decoded.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Issue {
  pub id: u64,
  /// Sequence number, unique within `repository`
  pub number: u64,
  pub title: String,
  pub body: Option<String>,
  pub state: IssueState,
  pub created_at: DateTime<Utc>,
  pub updated_at: DateTime<Utc>,
  /// Owning repository name
  pub repository: String,
  pub repository_url: String,
  pub html_url: String,
  #[serde(default)]
  pub labels: Vec<Label>,
  #[serde(default)]
  pub assignees: Vec<Assignee>,
  /// Comment count reported by the API
  #[serde(default)]
  pub comments: u32,
  /// Comment bodies, only present once explicitly loaded
  #[serde(default)]
  pub comment_details: Option<Vec<Comment>>,
  /// When this local copy was fetched. Set by the engine, never by the API.
  #[serde(default)]
  pub last_refreshed: Option<DateTime<Utc>>,
}

impl Issue {
  /// Validity check applied before anything enters the unified collection.
  ///
  /// Numeric id and number, creation time and state are guaranteed by the
  /// type; title and URL still have to be checked.
  pub fn is_valid(&self) -> bool {
    !self.title.trim().is_empty() && !self.html_url.is_empty()
  }

  pub fn has_label(&self, name: &str) -> bool {
    self.labels.iter().any(|l| l.name == name)
  }

  pub fn is_assigned_to(&self, login: &str) -> bool {
    self.assignees.iter().any(|a| a.login == login)
  }
}

/// A repository from the catalog.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Repository {
  pub name: String,
  pub display_name: String,
  #[serde(default)]
  pub description: String,
  #[serde(default = "default_branch")]
  pub default_branch: String,
  /// Issue counts stay `None` until a fetch resolves them
  #[serde(default)]
  pub open_issue_count: Option<u32>,
  #[serde(default)]
  pub closed_issue_count: Option<u32>,
  #[serde(default)]
  pub total_issue_count: Option<u32>,
  pub url: String,
}

fn default_branch() -> String {
  "main".to_string()
}

impl Repository {
  pub fn new(owner: &str, name: &str) -> Self {
    Self {
      name: name.to_string(),
      display_name: name.to_string(),
      description: String::new(),
      default_branch: default_branch(),
      open_issue_count: None,
      closed_issue_count: None,
      total_issue_count: None,
      url: format!("https://github.com/{}/{}", owner, name),
    }
  }

  /// Copy counts already resolved on `other` without touching catalog fields.
  pub fn inherit_counts(&mut self, other: &Repository) {
    self.open_issue_count = self.open_issue_count.or(other.open_issue_count);
    self.closed_issue_count = self.closed_issue_count.or(other.closed_issue_count);
    self.total_issue_count = self.total_issue_count.or(other.total_issue_count);
  }
}

// ============================================================================
// Cacheable implementations
// ============================================================================

impl Cacheable for Issue {
  fn cache_key(&self) -> String {
    self.id.to_string()
  }

  fn entity_type() -> &'static str {
    "issue"
  }

  fn is_valid(&self) -> bool {
    Issue::is_valid(self)
  }
}

impl Cacheable for Repository {
  fn cache_key(&self) -> String {
    self.name.clone()
  }

  fn entity_type() -> &'static str {
    "repository"
  }

  fn is_valid(&self) -> bool {
    !self.name.is_empty()
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  fn issue(title: &str, html_url: &str) -> Issue {
    let now = Utc::now();
    Issue {
      id: 1,
      number: 1,
      title: title.to_string(),
      body: None,
      state: IssueState::Open,
      created_at: now,
      updated_at: now,
      repository: "projects".to_string(),
      repository_url: "https://github.com/modelearth/projects".to_string(),
      html_url: html_url.to_string(),
      labels: vec![],
      assignees: vec![],
      comments: 0,
      comment_details: None,
      last_refreshed: None,
    }
  }

  #[test]
  fn test_blank_title_is_invalid() {
    assert!(!issue("   ", "https://github.com/x/y/issues/1").is_valid());
    assert!(!issue("Title", "").is_valid());
    assert!(issue("Title", "https://github.com/x/y/issues/1").is_valid());
  }

  #[test]
  fn test_state_parse() {
    assert_eq!(IssueState::parse("open"), Some(IssueState::Open));
    assert_eq!(IssueState::parse("closed"), Some(IssueState::Closed));
    assert_eq!(IssueState::parse("merged"), None);
  }

  #[test]
  fn test_inherit_counts_keeps_known_values() {
    let mut repo = Repository::new("modelearth", "feed");
    repo.open_issue_count = Some(3);
    let mut old = Repository::new("modelearth", "feed");
    old.open_issue_count = Some(9);
    old.total_issue_count = Some(12);
    repo.inherit_counts(&old);
    assert_eq!(repo.open_issue_count, Some(3));
    assert_eq!(repo.total_issue_count, Some(12));
  }
}
