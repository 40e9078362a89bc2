use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::header::{HeaderMap, ACCEPT, AUTHORIZATION, ETAG, IF_NONE_MATCH, USER_AGENT};
use reqwest::StatusCode;
use url::Url;

use crate::sync::error::{Result, SyncError};

use super::api_types::ApiErrorBody;

/// A GET request against the REST API.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApiRequest {
  /// Path relative to the API root, e.g. `/repos/modelearth/projects/issues`
  pub path: String,
  pub query: Vec<(String, String)>,
  /// Bearer credential, attached by the credential manager
  pub credential: Option<String>,
  /// Revalidation token sent as `If-None-Match`
  pub etag: Option<String>,
}

impl ApiRequest {
  pub fn get(path: impl Into<String>) -> Self {
    Self {
      path: path.into(),
      query: Vec::new(),
      credential: None,
      etag: None,
    }
  }

  pub fn param(mut self, name: &str, value: impl ToString) -> Self {
    self.query.push((name.to_string(), value.to_string()));
    self
  }

  pub fn with_etag(mut self, etag: Option<&str>) -> Self {
    self.etag = etag.map(String::from);
    self
  }

  /// Look up a query parameter.
  pub fn query_param(&self, name: &str) -> Option<&str> {
    self
      .query
      .iter()
      .find(|(k, _)| k == name)
      .map(|(_, v)| v.as_str())
  }
}

/// Rate-limit metadata carried by every response.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimitHeaders {
  pub remaining: u32,
  pub reset_at: DateTime<Utc>,
}

/// Raw response; status interpretation happens in `kind()`.
#[derive(Debug, Clone)]
pub struct ApiResponse {
  pub status: u16,
  pub etag: Option<String>,
  pub rate_limit: Option<RateLimitHeaders>,
  pub body: Vec<u8>,
}

/// Response classification shared by every caller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResponseKind {
  Ok,
  NotModified,
  Unauthorized,
  RateLimited,
  NotFound,
  Failed(u16),
}

impl ApiResponse {
  pub fn kind(&self) -> ResponseKind {
    match self.status {
      200..=299 => ResponseKind::Ok,
      304 => ResponseKind::NotModified,
      401 => ResponseKind::Unauthorized,
      403 | 429 if self.is_rate_limit_response() => ResponseKind::RateLimited,
      404 | 410 => ResponseKind::NotFound,
      status => ResponseKind::Failed(status),
    }
  }

  /// A 403 is only a rate-limit response when the body says so or the
  /// remaining budget header reads zero; otherwise it is a permission error.
  fn is_rate_limit_response(&self) -> bool {
    if self.status == 429 {
      return true;
    }
    let message_says_so = ApiErrorBody::parse(&self.body)
      .message
      .map(|m| m.to_lowercase().contains("rate limit"))
      .unwrap_or(false);
    let budget_exhausted = self.rate_limit.map(|r| r.remaining == 0).unwrap_or(false);
    message_says_so || budget_exhausted
  }

  pub fn error_message(&self) -> String {
    ApiErrorBody::parse(&self.body)
      .message
      .unwrap_or_else(|| format!("HTTP {}", self.status))
  }
}

/// The remote API seam. Production uses [`HttpTransport`]; tests script
/// responses in memory.
#[async_trait]
pub trait Transport: Send + Sync {
  async fn get(&self, request: ApiRequest) -> Result<ApiResponse>;
}

/// Extract the revalidation token from response headers.
pub fn extract_etag(headers: &HeaderMap) -> Option<String> {
  headers
    .get(ETAG)
    .and_then(|v| v.to_str().ok())
    .map(String::from)
}

/// Extract rate-limit metadata (`x-ratelimit-remaining` / `x-ratelimit-reset`).
pub fn parse_rate_limit_headers(headers: &HeaderMap) -> Option<RateLimitHeaders> {
  let remaining = headers
    .get("x-ratelimit-remaining")
    .and_then(|v| v.to_str().ok())
    .and_then(|v| v.parse::<u32>().ok())?;
  let reset_epoch = headers
    .get("x-ratelimit-reset")
    .and_then(|v| v.to_str().ok())
    .and_then(|v| v.parse::<i64>().ok())?;
  let reset_at = DateTime::from_timestamp(reset_epoch, 0).unwrap_or_else(Utc::now);
  Some(RateLimitHeaders {
    remaining,
    reset_at,
  })
}

/// reqwest-backed transport.
#[derive(Clone)]
pub struct HttpTransport {
  client: reqwest::Client,
  base_url: Url,
}

impl HttpTransport {
  pub fn new(api_url: &str) -> Result<Self> {
    // Url::join drops the last segment unless the base ends with a slash
    let normalized = format!("{}/", api_url.trim_end_matches('/'));
    let base_url = Url::parse(&normalized)
      .map_err(|e| SyncError::network(format!("Invalid API URL {}: {}", api_url, e)))?;
    let client = reqwest::Client::builder()
      .build()
      .map_err(|e| SyncError::network(format!("Failed to create HTTP client: {}", e)))?;
    Ok(Self { client, base_url })
  }

  fn url_for(&self, request: &ApiRequest) -> Result<Url> {
    let mut url = self
      .base_url
      .join(request.path.trim_start_matches('/'))
      .map_err(|e| SyncError::network(format!("Invalid path {}: {}", request.path, e)))?;
    if !request.query.is_empty() {
      url.query_pairs_mut().extend_pairs(request.query.iter());
    }
    Ok(url)
  }
}

#[async_trait]
impl Transport for HttpTransport {
  async fn get(&self, request: ApiRequest) -> Result<ApiResponse> {
    let url = self.url_for(&request)?;

    let mut builder = self
      .client
      .get(url)
      .header(ACCEPT, "application/vnd.github.v3+json")
      .header(USER_AGENT, "issue-sync");
    if let Some(token) = &request.credential {
      builder = builder.header(AUTHORIZATION, format!("Bearer {}", token));
    }
    if let Some(etag) = &request.etag {
      builder = builder.header(IF_NONE_MATCH, etag);
    }

    let response = builder
      .send()
      .await
      .map_err(|e| SyncError::network(format!("HTTP request failed: {}", e)))?;

    let status = response.status();
    let headers = response.headers().clone();
    let body = if status == StatusCode::NOT_MODIFIED {
      Vec::new()
    } else {
      response
        .bytes()
        .await
        .map_err(|e| SyncError::network(format!("Failed to read response body: {}", e)))?
        .to_vec()
    };

    Ok(ApiResponse {
      status: status.as_u16(),
      etag: extract_etag(&headers),
      rate_limit: parse_rate_limit_headers(&headers),
      body,
    })
  }
}
