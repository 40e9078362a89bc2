//! Issue synchronization and cache engine for browsing issues across many
//! GitHub repositories of one owner.
//!
//! The [`Engine`] fetches issues through a rate-limit aware session, caches
//! them with TTL and ETag revalidation, and serves filtered pages from a
//! unified in-memory collection.

pub mod cache;
pub mod config;
pub mod debounce;
pub mod event;
pub mod github;
pub mod query;
pub mod sync;

pub use config::Config;
pub use event::{EngineEvent, EventBus, Warning};
pub use github::types::{Comment, Issue, IssueState, Repository};
pub use query::{FilterState, Page, RepoSelector, SortKey, StateFilter};
pub use sync::{Engine, EngineOptions, SyncError, SyncReport};
