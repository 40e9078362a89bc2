//! Repository catalog providers.
//!
//! Both providers yield the same [`Repository`] shape; the engine does not
//! care which one it was given.

use std::path::Path;

use async_trait::async_trait;
use chrono::{Duration, Utc};
use color_eyre::{eyre::eyre, Result as EyreResult};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::cache::{CacheKey, ConditionalCache, EntryMetadata};
use crate::sync::error::{Result, SyncError};
use crate::sync::session::{ApiSession, SessionResponse};

use super::api_types::ApiRepository;
use super::client::ApiRequest;
use super::types::Repository;

/// Remote catalog entries stay fresh for an hour.
pub const CATALOG_TTL_MINUTES: i64 = 60;

const CATALOG_PER_PAGE: u32 = 100;
const CATALOG_MAX_PAGES: u32 = 20;

/// What a provider may use while loading.
pub struct CatalogContext<'a> {
  pub session: &'a ApiSession,
  pub cache: &'a ConditionalCache,
  pub owner: &'a str,
  pub cancel: &'a CancellationToken,
}

#[async_trait]
pub trait CatalogSource: Send + Sync {
  fn name(&self) -> &'static str;

  async fn load(&self, ctx: CatalogContext<'_>) -> Result<Vec<Repository>>;
}

/// One manifest row.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManifestEntry {
  pub name: String,
  #[serde(default)]
  pub display_name: Option<String>,
  #[serde(default)]
  pub description: Option<String>,
  #[serde(default)]
  pub default_branch: Option<String>,
}

impl ManifestEntry {
  fn new(name: &str, display_name: &str, description: &str, default_branch: &str) -> Self {
    Self {
      name: name.to_string(),
      display_name: Some(display_name.to_string()),
      description: Some(description.to_string()),
      default_branch: Some(default_branch.to_string()),
    }
  }

  pub fn into_repository(self, owner: &str) -> Repository {
    let mut repo = Repository::new(owner, &self.name);
    if let Some(display_name) = self.display_name.filter(|d| !d.is_empty()) {
      repo.display_name = display_name;
    }
    if let Some(description) = self.description {
      repo.description = description;
    }
    if let Some(default_branch) = self.default_branch.filter(|b| !b.is_empty()) {
      repo.default_branch = default_branch;
    }
    repo
  }
}

/// Catalog from a static manifest.
#[derive(Debug, Clone)]
pub struct ManifestCatalog {
  entries: Vec<ManifestEntry>,
}

impl ManifestCatalog {
  pub fn new(entries: Vec<ManifestEntry>) -> Self {
    Self { entries }
  }

  /// Read a YAML manifest (a list of entries).
  pub fn from_path(path: &Path) -> EyreResult<Self> {
    let contents = std::fs::read_to_string(path)
      .map_err(|e| eyre!("Failed to read manifest {}: {}", path.display(), e))?;
    let entries: Vec<ManifestEntry> = serde_yaml::from_str(&contents)
      .map_err(|e| eyre!("Failed to parse manifest {}: {}", path.display(), e))?;
    Ok(Self::new(entries))
  }

  /// Built-in list used when no manifest is configured.
  pub fn fallback() -> Self {
    let rows = [
      ("modelearth", "ModelEarth", "Main ModelEarth repository", "master"),
      ("localsite", "LocalSite", "Core CSS/JS utilities", "main"),
      ("realitystream", "RealityStream", "ML Models and Visualization", "main"),
      ("feed", "Feed", "FeedPlayer video/gallery", "main"),
      ("swiper", "Swiper", "UI swiper components", "main"),
      ("comparison", "Comparison", "Trade Flow tools", "main"),
      ("codechat", "CodeChat", "Code chat interface", "main"),
      ("home", "Home", "Home page content", "main"),
      ("cloud", "Cloud", "Cloud platform tools", "main"),
      ("projects", "Projects", "Project showcases", "main"),
      ("team", "Team", "Rust REST API for Azure", "main"),
      ("products", "Products", "Products frontend and python", "main"),
      ("products-data", "Products Data", "Products data output", "main"),
      ("profile", "Profile", "Profile frontend analysis", "main"),
      ("exiobase", "Exiobase", "Trade flow output to .csv and SQL", "main"),
      ("io", "IO", "Input-output analysis", "main"),
      ("useeio.js", "USEEIO.JS", "JavaScript footprint tools", "dev"),
      ("useeio-widgets", "USEEIO Widgets", "USEEIO React widgets", "master"),
      (
        "useeio-widgets-without-react",
        "USEEIO Widgets Without React",
        "USEEIO widgets without React",
        "master",
      ),
      ("useeiopy", "USEEIO Python", "Python USEEIO library", "master"),
      ("useeio_api", "USEEIO API", "USEEIO REST API", "master"),
      ("useeio", "USEEIO Core", "Core USEEIO model", "master"),
      ("useeior", "USEEIO R", "R package for USEEIO", "master"),
      ("useeio-state", "USEEIO State", "State-level USEEIO data", "main"),
      ("useeio-json", "USEEIO JSON", "USEEIO JSON data", "main"),
      ("mario", "Mario", "Multi-regional input-output", "main"),
      ("webroot", "Webroot", "PartnerTools webroot", "main"),
      ("data-pipeline", "Data Pipeline", "Python data processing pipeline", "main"),
      ("community-data", "Community data", "Community-level data outputs", "master"),
      ("community-timelines", "Community Timeline", "Timeline data for communities", "main"),
      ("community-zipcodes", "Community Zipcodes", "ZIP code level community data", "main"),
      ("community-forecasting", "Community Forecasting", "Forecasting frontend", "main"),
      ("dataflow", "Data flow", "Data flow NextJS UX", "main"),
    ];
    Self::new(
      rows
        .iter()
        .map(|(name, display, description, branch)| {
          ManifestEntry::new(name, display, description, branch)
        })
        .collect(),
    )
  }

  pub fn entries(&self) -> &[ManifestEntry] {
    &self.entries
  }
}

#[async_trait]
impl CatalogSource for ManifestCatalog {
  fn name(&self) -> &'static str {
    "manifest"
  }

  async fn load(&self, ctx: CatalogContext<'_>) -> Result<Vec<Repository>> {
    Ok(
      self
        .entries
        .iter()
        .cloned()
        .map(|entry| entry.into_repository(ctx.owner))
        .collect(),
    )
  }
}

/// Catalog from the repository-listing endpoint. Lists every repository of
/// the owner with issues enabled, so it is opt-in.
#[derive(Debug, Clone, Default)]
pub struct RemoteCatalog;

impl RemoteCatalog {
  async fn list(&self, ctx: &CatalogContext<'_>, path: &str) -> Result<Vec<Repository>> {
    let mut repositories = Vec::new();
    for page in 1..=CATALOG_MAX_PAGES {
      let request = ApiRequest::get(path)
        .param("per_page", CATALOG_PER_PAGE)
        .param("type", "all")
        .param("sort", "name")
        .param("page", page);
      let bytes = match ctx.session.get(request, ctx.cancel).await? {
        SessionResponse::Body { bytes, .. } => bytes,
        SessionResponse::NotModified => break,
      };
      let records: Vec<ApiRepository> = serde_json::from_slice(&bytes).map_err(SyncError::decode)?;
      let count = records.len();
      repositories.extend(
        records
          .into_iter()
          .filter(ApiRepository::is_listable)
          .map(|r| r.into_repository(ctx.owner)),
      );
      if count < CATALOG_PER_PAGE as usize {
        break;
      }
    }
    Ok(repositories)
  }
}

#[async_trait]
impl CatalogSource for RemoteCatalog {
  fn name(&self) -> &'static str {
    "remote"
  }

  async fn load(&self, ctx: CatalogContext<'_>) -> Result<Vec<Repository>> {
    let key = CacheKey::repositories(ctx.owner);
    match ctx.cache.read::<Repository>(&key) {
      Ok(Some(read)) if Utc::now() - read.entry.written_at < Duration::minutes(CATALOG_TTL_MINUTES) => {
        debug!(owner = ctx.owner, count = read.entry.entities.len(), "Catalog from cache");
        return Ok(read.entry.entities);
      }
      Ok(_) => {}
      Err(e) => warn!(error = %e, "Failed to read catalog cache"),
    }

    let org_path = format!("/orgs/{}/repos", ctx.owner);
    let repositories = match self.list(&ctx, &org_path).await {
      Err(e) if e.is_not_found() => {
        info!(owner = ctx.owner, "Not an organization, listing user repositories");
        self.list(&ctx, &format!("/users/{}/repos", ctx.owner)).await?
      }
      other => other?,
    };

    if let Err(e) = ctx
      .cache
      .write(&key, &repositories, None, EntryMetadata::default())
    {
      warn!(error = %e, "Failed to cache catalog");
    }
    Ok(repositories)
  }
}
