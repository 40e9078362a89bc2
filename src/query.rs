//! Query engine: filters, sorts and paginates the unified collection.
//!
//! Everything here is a pure function of the collection and a
//! [`FilterState`]; it never touches the network or the cache.

use std::cmp::Ordering;
use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

use crate::github::types::{Issue, IssueState};

/// Default number of issues per presentation page.
pub const DEFAULT_PAGE_SIZE: usize = 10;

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum RepoSelector {
  #[default]
  All,
  Named(String),
}

impl RepoSelector {
  pub fn matches(&self, repository: &str) -> bool {
    match self {
      Self::All => true,
      Self::Named(name) => name == repository,
    }
  }
}

impl FromStr for RepoSelector {
  type Err = String;

  fn from_str(s: &str) -> Result<Self, Self::Err> {
    match s.trim() {
      "" => Err("repository must not be empty".to_string()),
      "all" => Ok(Self::All),
      name => Ok(Self::Named(name.to_string())),
    }
  }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SortKey {
  #[default]
  Updated,
  Created,
  Comments,
  Title,
  Number,
}

impl SortKey {
  fn compare(&self, a: &Issue, b: &Issue) -> Ordering {
    match self {
      Self::Updated => b.updated_at.cmp(&a.updated_at),
      Self::Created => b.created_at.cmp(&a.created_at),
      Self::Comments => b.comments.cmp(&a.comments),
      Self::Title => a
        .title
        .to_lowercase()
        .cmp(&b.title.to_lowercase())
        .then_with(|| a.title.cmp(&b.title)),
      Self::Number => b.number.cmp(&a.number),
    }
  }
}

impl FromStr for SortKey {
  type Err = String;

  fn from_str(s: &str) -> Result<Self, Self::Err> {
    match s {
      "updated" => Ok(Self::Updated),
      "created" => Ok(Self::Created),
      "comments" => Ok(Self::Comments),
      "title" => Ok(Self::Title),
      "number" => Ok(Self::Number),
      other => Err(format!("unknown sort key: {}", other)),
    }
  }
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum AssigneeFilter {
  #[default]
  All,
  Unassigned,
  Login(String),
}

impl AssigneeFilter {
  fn matches(&self, issue: &Issue) -> bool {
    match self {
      Self::All => true,
      Self::Unassigned => issue.assignees.is_empty(),
      Self::Login(login) => issue.is_assigned_to(login),
    }
  }
}

impl FromStr for AssigneeFilter {
  type Err = String;

  fn from_str(s: &str) -> Result<Self, Self::Err> {
    match s.trim() {
      "" | "all" => Ok(Self::All),
      "unassigned" => Ok(Self::Unassigned),
      login => Ok(Self::Login(login.to_string())),
    }
  }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum StateFilter {
  #[default]
  Open,
  Closed,
  All,
}

impl StateFilter {
  /// Value of the `state` query parameter.
  pub fn as_param(&self) -> &'static str {
    match self {
      Self::Open => "open",
      Self::Closed => "closed",
      Self::All => "all",
    }
  }

  pub fn matches(&self, state: IssueState) -> bool {
    match self {
      Self::Open => state == IssueState::Open,
      Self::Closed => state == IssueState::Closed,
      Self::All => true,
    }
  }
}

impl FromStr for StateFilter {
  type Err = String;

  fn from_str(s: &str) -> Result<Self, Self::Err> {
    match s {
      "open" => Ok(Self::Open),
      "closed" => Ok(Self::Closed),
      "all" => Ok(Self::All),
      other => Err(format!("unknown state: {}", other)),
    }
  }
}

impl fmt::Display for StateFilter {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(self.as_param())
  }
}

/// Presentation layout. Carried through untouched.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ViewMode {
  #[default]
  Short,
  List,
  Card,
}

/// Presentation-owned filter configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FilterState {
  pub repo: RepoSelector,
  pub sort: SortKey,
  pub assignee: AssigneeFilter,
  pub label: Option<String>,
  pub search: String,
  pub state: StateFilter,
  /// 1-based page index
  pub page: usize,
  pub view: ViewMode,
}

impl Default for FilterState {
  fn default() -> Self {
    Self {
      repo: RepoSelector::All,
      sort: SortKey::Updated,
      assignee: AssigneeFilter::All,
      label: None,
      search: String::new(),
      state: StateFilter::Open,
      page: 1,
      view: ViewMode::Short,
    }
  }
}

impl FilterState {
  fn matches_search(&self, issue: &Issue, term: &str) -> bool {
    if term.is_empty() {
      return true;
    }
    issue.title.to_lowercase().contains(term)
      || issue
        .body
        .as_deref()
        .map(|b| b.to_lowercase().contains(term))
        .unwrap_or(false)
      || issue.number.to_string().contains(term.trim_start_matches('#'))
  }

  /// Filters in order: repository, state, assignee, label, search.
  pub fn matches(&self, issue: &Issue) -> bool {
    let term = self.search.trim().to_lowercase();
    self.repo.matches(&issue.repository)
      && self.state.matches(issue.state)
      && self.assignee.matches(issue)
      && self.label.as_deref().map_or(true, |l| issue.has_label(l))
      && self.matches_search(issue, &term)
  }
}

/// One presentation page.
#[derive(Debug, Clone, PartialEq)]
pub struct Page {
  pub items: Vec<Issue>,
  pub total_count: usize,
  pub page_count: usize,
  /// Page actually served after clamping
  pub page: usize,
}

/// Filter, sort and paginate `issues` according to `filter`.
pub fn apply<'a, I>(issues: I, filter: &FilterState, page_size: usize) -> Page
where
  I: IntoIterator<Item = &'a Issue>,
{
  let page_size = page_size.max(1);
  let mut matched: Vec<&Issue> = issues.into_iter().filter(|i| filter.matches(i)).collect();
  matched.sort_by(|a, b| filter.sort.compare(a, b).then_with(|| b.id.cmp(&a.id)));

  let total_count = matched.len();
  let page_count = total_count.div_ceil(page_size);
  let page = filter.page.clamp(1, page_count.max(1));
  let items = matched
    .into_iter()
    .skip((page - 1) * page_size)
    .take(page_size)
    .cloned()
    .collect();

  Page {
    items,
    total_count,
    page_count,
    page,
  }
}

/// Distinct label names, sorted.
pub fn label_facet<'a, I>(issues: I) -> Vec<String>
where
  I: IntoIterator<Item = &'a Issue>,
{
  issues
    .into_iter()
    .flat_map(|i| i.labels.iter().map(|l| l.name.clone()))
    .collect::<BTreeSet<_>>()
    .into_iter()
    .collect()
}

/// Distinct assignee logins, sorted.
pub fn assignee_facet<'a, I>(issues: I) -> Vec<String>
where
  I: IntoIterator<Item = &'a Issue>,
{
  issues
    .into_iter()
    .flat_map(|i| i.assignees.iter().map(|a| a.login.clone()))
    .collect::<BTreeSet<_>>()
    .into_iter()
    .collect()
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::github::types::{Assignee, Label};
  use chrono::{Duration, TimeZone, Utc};

  fn issue(id: u64, repo: &str, title: &str) -> Issue {
    let base = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
    Issue {
      id,
      number: id,
      title: title.to_string(),
      body: Some(format!("body of {}", title)),
      state: IssueState::Open,
      created_at: base + Duration::days(id as i64),
      updated_at: base + Duration::days(100 - id as i64),
      repository: repo.to_string(),
      repository_url: format!("https://github.com/modelearth/{}", repo),
      html_url: format!("https://github.com/modelearth/{}/issues/{}", repo, id),
      labels: Vec::new(),
      assignees: Vec::new(),
      comments: (id % 3) as u32,
      comment_details: None,
      last_refreshed: None,
    }
  }

  fn sample() -> Vec<Issue> {
    let mut issues = vec![
      issue(1, "projects", "Fix map legend"),
      issue(2, "projects", "add CSV export"),
      issue(3, "localsite", "Navigation broken"),
      issue(4, "localsite", "Update README"),
      issue(5, "feed", "Video autoplay"),
    ];
    issues[1].labels.push(Label {
      name: "bug".to_string(),
      color: None,
    });
    issues[2].labels.push(Label {
      name: "bug".to_string(),
      color: None,
    });
    issues[2].assignees.push(Assignee {
      login: "octo".to_string(),
    });
    issues[4].state = IssueState::Closed;
    issues
  }

  fn ids(page: &Page) -> Vec<u64> {
    page.items.iter().map(|i| i.id).collect()
  }

  #[test]
  fn test_filters_compose() {
    let issues = sample();
    let mut filter = FilterState {
      label: Some("bug".to_string()),
      sort: SortKey::Number,
      ..FilterState::default()
    };
    assert_eq!(ids(&apply(&issues, &filter, 10)), vec![3, 2]);

    filter.repo = RepoSelector::Named("localsite".to_string());
    assert_eq!(ids(&apply(&issues, &filter, 10)), vec![3]);

    filter.repo = RepoSelector::All;
    filter.label = None;
    filter.assignee = AssigneeFilter::Unassigned;
    assert_eq!(ids(&apply(&issues, &filter, 10)), vec![4, 2, 1]);

    filter.assignee = AssigneeFilter::Login("octo".to_string());
    assert_eq!(ids(&apply(&issues, &filter, 10)), vec![3]);
  }

  #[test]
  fn test_state_selector() {
    let issues = sample();
    let mut filter = FilterState {
      state: StateFilter::Closed,
      ..FilterState::default()
    };
    assert_eq!(ids(&apply(&issues, &filter, 10)), vec![5]);
    filter.state = StateFilter::All;
    assert_eq!(apply(&issues, &filter, 10).total_count, 5);
  }

  #[test]
  fn test_search_is_case_insensitive_over_title_body_number() {
    let issues = sample();
    let mut filter = FilterState {
      search: "NAVIGATION".to_string(),
      ..FilterState::default()
    };
    assert_eq!(ids(&apply(&issues, &filter, 10)), vec![3]);

    filter.search = "body of update".to_string();
    assert_eq!(ids(&apply(&issues, &filter, 10)), vec![4]);

    filter.search = "#2".to_string();
    assert_eq!(ids(&apply(&issues, &filter, 10)), vec![2]);
  }

  #[test]
  fn test_sort_orders() {
    let issues = sample();
    let mut filter = FilterState {
      state: StateFilter::All,
      ..FilterState::default()
    };

    // Newest update first: id 1 was updated last
    assert_eq!(ids(&apply(&issues, &filter, 10)), vec![1, 2, 3, 4, 5]);

    filter.sort = SortKey::Created;
    assert_eq!(ids(&apply(&issues, &filter, 10)), vec![5, 4, 3, 2, 1]);

    filter.sort = SortKey::Title;
    assert_eq!(ids(&apply(&issues, &filter, 10)), vec![2, 1, 3, 4, 5]);

    filter.sort = SortKey::Comments;
    assert_eq!(ids(&apply(&issues, &filter, 10))[..2], [5, 2]);
  }

  #[test]
  fn test_page_is_clamped() {
    let issues = sample();
    let mut filter = FilterState {
      state: StateFilter::All,
      sort: SortKey::Number,
      page: 9,
      ..FilterState::default()
    };
    let page = apply(&issues, &filter, 2);
    assert_eq!(page.page_count, 3);
    assert_eq!(page.page, 3);
    assert_eq!(ids(&page), vec![1]);

    filter.page = 0;
    let page = apply(&issues, &filter, 2);
    assert_eq!(page.page, 1);
    assert_eq!(ids(&page), vec![5, 4]);

    filter.search = "no such thing".to_string();
    let page = apply(&issues, &filter, 2);
    assert_eq!((page.total_count, page.page_count, page.page), (0, 0, 1));
    assert!(page.items.is_empty());
  }

  #[test]
  fn test_facets() {
    let issues = sample();
    assert_eq!(label_facet(&issues), vec!["bug".to_string()]);
    assert_eq!(assignee_facet(&issues), vec!["octo".to_string()]);
  }

  #[test]
  fn test_parse_selectors() {
    assert_eq!("all".parse::<RepoSelector>().unwrap(), RepoSelector::All);
    assert_eq!(
      "projects".parse::<RepoSelector>().unwrap(),
      RepoSelector::Named("projects".to_string())
    );
    assert_eq!("comments".parse::<SortKey>().unwrap(), SortKey::Comments);
    assert!("stars".parse::<SortKey>().is_err());
    assert_eq!(
      "unassigned".parse::<AssigneeFilter>().unwrap(),
      AssigneeFilter::Unassigned
    );
    assert_eq!("closed".parse::<StateFilter>().unwrap().as_param(), "closed");
  }
}
