use clap::Parser;
use color_eyre::Result;
use std::path::PathBuf;
use tracing::info;
use tracing_subscriber::EnvFilter;

use issue_sync::query::AssigneeFilter;
use issue_sync::sync::RateLimitLevel;
use issue_sync::{
  Comment, Config, Engine, EngineEvent, FilterState, Issue, Page, RepoSelector, SortKey, StateFilter,
};

#[derive(Parser, Debug)]
#[command(name = "issue-sync")]
#[command(about = "Browse issues across many GitHub repositories with a local cache")]
#[command(version)]
struct Args {
  /// Path to config file (default: $XDG_CONFIG_HOME/issue-sync/config.yaml)
  #[arg(short, long)]
  config: Option<PathBuf>,

  /// Repository name, or "all"
  #[arg(short, long, default_value = "all")]
  repo: RepoSelector,

  /// open, closed or all
  #[arg(short, long, default_value = "open")]
  state: StateFilter,

  /// updated, created, comments, title or number
  #[arg(long, default_value = "updated")]
  sort: SortKey,

  /// all, unassigned or a login
  #[arg(short, long, default_value = "all")]
  assignee: AssigneeFilter,

  #[arg(short, long)]
  label: Option<String>,

  /// Matches title, body or issue number
  #[arg(long, default_value = "")]
  search: String,

  #[arg(short, long, default_value_t = 1)]
  page: usize,

  /// Ignore fresh cache entries
  #[arg(long)]
  refresh: bool,

  /// Delete every cache entry before loading
  #[arg(long)]
  clear_cache: bool,

  /// Also resolve open-issue counts for every repository
  #[arg(long)]
  counts: bool,

  /// List the known labels and assignees
  #[arg(long)]
  facets: bool,

  /// Refetch one issue by id and show its comments
  #[arg(long, value_name = "ID")]
  issue: Option<u64>,

  /// Keep running and reprint the page after every background refresh
  #[arg(short, long)]
  watch: bool,
}

/// Log to a daily file in the data directory; stdout is for results.
fn init_logging() -> Result<tracing_appender::non_blocking::WorkerGuard> {
  let log_dir = Config::data_dir()?;
  std::fs::create_dir_all(&log_dir)?;
  let appender = tracing_appender::rolling::daily(log_dir, "issue-sync.log");
  let (writer, guard) = tracing_appender::non_blocking(appender);

  let env_filter = match EnvFilter::try_from_default_env() {
    Ok(filter) => filter,
    Err(_) => EnvFilter::new("issue_sync=info"),
  };
  tracing_subscriber::fmt()
    .with_env_filter(env_filter)
    .with_writer(writer)
    .with_ansi(false)
    .init();
  Ok(guard)
}

fn print_issue(issue: &Issue, comments: &[Comment]) {
  println!("{} #{}: {}", issue.repository, issue.number, issue.title);
  println!("{} | updated {} | {}", issue.state.as_str(), issue.updated_at.format("%Y-%m-%d"), issue.html_url);
  if let Some(body) = &issue.body {
    println!("\n{}\n", body);
  }
  for comment in comments {
    println!(
      "-- {} on {}\n{}",
      comment.author.as_deref().unwrap_or("ghost"),
      comment.created_at.format("%Y-%m-%d"),
      comment.body
    );
  }
}

fn print_page(page: &Page) {
  for issue in &page.items {
    let labels: Vec<&str> = issue.labels.iter().map(|l| l.name.as_str()).collect();
    println!(
      "{:<24} #{:<6} {:<6} {}{}",
      issue.repository,
      issue.number,
      issue.state.as_str(),
      issue.title,
      if labels.is_empty() {
        String::new()
      } else {
        format!("  [{}]", labels.join(", "))
      }
    );
  }
  println!(
    "-- page {}/{} ({} issues)",
    page.page,
    page.page_count.max(1),
    page.total_count
  );
}

#[tokio::main]
async fn main() -> Result<()> {
  color_eyre::install()?;

  let args = Args::parse();
  let _guard = init_logging()?;

  let config = Config::load(args.config.as_deref())?;
  let engine = Engine::from_config(&config)?;

  if args.clear_cache {
    let removed = engine.clear_cache()?;
    println!("Cleared {} cache entries", removed);
  }

  let filter = FilterState {
    repo: args.repo,
    sort: args.sort,
    assignee: args.assignee,
    label: args.label,
    search: args.search,
    state: args.state,
    page: args.page,
    ..FilterState::default()
  };

  let report = engine.load_data(&filter, args.refresh).await;
  info!(?report, issues = engine.issue_count(), "Initial load finished");
  if args.counts {
    for repo in engine.load_issue_counts().await {
      let count = repo
        .open_issue_count
        .map(|c| c.to_string())
        .unwrap_or_else(|| "?".to_string());
      println!("{:<32} {:>6} open", repo.display_name, count);
    }
  }

  if let Some(id) = args.issue {
    let issue = engine.refresh_issue(id).await?;
    let comments = engine.load_comments(id).await?;
    print_issue(&issue, &comments);
    return Ok(());
  }

  if args.facets {
    println!("labels: {}", engine.labels().join(", "));
    println!("assignees: {}", engine.assignees().join(", "));
  }

  print_page(&engine.get_page(&filter));

  for repo in &report.dropped {
    eprintln!("Repository {} is not accessible and was skipped", repo);
  }
  if !engine.has_credential() {
    eprintln!("No token set (ISSUE_SYNC_TOKEN or GITHUB_TOKEN): only {} was loaded", config.github.default_repo);
  }
  let rate_limit = engine.rate_limit();
  match engine.rate_limit_level() {
    RateLimitLevel::Exhausted => eprintln!(
      "Rate limit exhausted{}",
      rate_limit
        .reset_at
        .map(|at| format!(", resets at {}", at.format("%H:%M UTC")))
        .unwrap_or_default()
    ),
    RateLimitLevel::Low => eprintln!(
      "Rate limit low: {} requests left",
      engine.remaining_budget()
    ),
    RateLimitLevel::Healthy | RateLimitLevel::Unknown => {}
  }

  if args.watch {
    let Some(handle) = engine.spawn_auto_refresh() else {
      eprintln!("Auto refresh needs a token and cache.auto_refresh enabled");
      return Ok(());
    };
    let mut events = engine.subscribe();
    loop {
      tokio::select! {
        _ = tokio::signal::ctrl_c() => break,
        event = events.recv() => match event {
          Some(EngineEvent::CycleCompleted { .. }) => print_page(&engine.get_page(&filter)),
          Some(_) => {}
          None => break,
        },
      }
    }
    handle.abort();
  }

  Ok(())
}
