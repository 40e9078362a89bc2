//! Fetch orchestration: rate limiting, credentials, concurrency classes,
//! pagination and the engine that ties them together.

pub mod credentials;
pub mod engine;
pub mod error;
pub mod fetcher;
pub mod limiter;
pub mod rate_limit;
pub mod session;

pub use engine::{Engine, EngineOptions, RepoSyncStatus, SyncReport};
pub use error::{Result, SyncError};
pub use rate_limit::{RateLimitLevel, RateLimitState};
