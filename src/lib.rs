//! Gmail Bulk Manager
//!
//! Finds the senders that fill a mailbox and acts on them in bulk:
//! unsubscribe, move everything from a sender to trash, back it up as CSV,
//! or mark unread mail as read. Work runs as one background job at a time; a local web UI or the
//! CLI polls its progress.
//!
//! # Overview
//!
//! - **Filters**: declarative constraints compiled into Gmail search queries
//! - **Batching**: ordered, bounded batches with retry and per-item failures
//! - **Jobs**: a single-slot engine whose status is safe to poll at any time
//! - **Aggregation**: per-sender counts and sizes ranked for review
//! - **Unsubscribe**: `List-Unsubscribe` headers, one-click POST, body links
//!
//! # Example Usage
//!
//! ```no_run
//! use gmail_bulk::{auth, client::ProductionGmailClient, config::Config};
//! use gmail_bulk::engine::{JobEngine, MarkReadRequest};
//! use gmail_bulk::models::CountLimit;
//! use gmail_bulk::progress::ProgressStore;
//! use gmail_bulk::rate_limiter::QuotaRateLimiter;
//! use gmail_bulk::unsubscribe::HttpUnsubscriber;
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = Config::load("config.toml".as_ref()).await?;
//!
//!     let hub = auth::initialize_gmail_hub(
//!         &config.auth.credentials_path,
//!         &config.auth.token_cache_path,
//!     )
//!     .await?;
//!     let client = ProductionGmailClient::new(hub, QuotaRateLimiter::from_config(&config.rate_limit));
//!
//!     let engine = JobEngine::new(
//!         Arc::new(client),
//!         Arc::new(HttpUnsubscriber::new()?),
//!         ProgressStore::new(),
//!         &config,
//!     );
//!     engine.start_mark_read(MarkReadRequest {
//!         count: CountLimit::All,
//!         filters: Default::default(),
//!     })?;
//!     println!("{}", engine.status().message);
//!     Ok(())
//! }
//! ```
//!
//! # Module Organization
//!
//! - [`aggregator`] - Per-sender statistics and ranking
//! - [`auth`] - OAuth2 authentication and Gmail API initialization
//! - [`batch`] - Batched mutations with retry
//! - [`cli`] - Command-line interface
//! - [`client`] - Gmail API client trait and production adapter
//! - [`config`] - Configuration management
//! - [`engine`] - Job orchestration
//! - [`error`] - Error types and result aliases
//! - [`export`] - CSV backups of message metadata
//! - [`filters`] - Filter specs and query compilation
//! - [`models`] - Core data structures
//! - [`poller`] - Status polling loop
//! - [`progress`] - Single-slot job status store
//! - [`rate_limiter`] - Quota-unit token bucket
//! - [`scanner`] - Paged listing and metadata fetching
//! - [`server`] - Web UI and JSON API
//! - [`unsubscribe`] - Unsubscribe link discovery and requests

pub mod aggregator;
pub mod auth;
pub mod batch;
pub mod cli;
pub mod client;
pub mod config;
pub mod engine;
pub mod error;
pub mod export;
pub mod filters;
pub mod models;
pub mod poller;
pub mod progress;
pub mod rate_limiter;
pub mod scanner;
pub mod server;
pub mod unsubscribe;

// Re-export commonly used types for convenience
pub use error::{GmailError, Result};

// Core data models
pub use models::{
    BatchResult, BulkAction, CandidateMessage, CountLimit, JobKind, MessageMetadata,
    SenderSummary, UnsubscribeLink, UnsubscribeTarget,
};

pub use filters::{FilterSpec, GmailQuery};
pub use batch::{BatchExecutor, RetryPolicy};
pub use engine::{DeleteRequest, DownloadRequest, JobEngine, MarkReadRequest, ScanPurpose, ScanRequest};
pub use progress::{JobState, JobStatus, ProgressStore, ProgressWriter};
pub use aggregator::SenderAggregator;

// Config types
pub use config::{AuthConfig, Config, JobsConfig, RateLimitConfig, ScanConfig, ServerConfig};

// Client traits
pub use client::{GmailClient, ProductionGmailClient};
pub use unsubscribe::{HttpUnsubscriber, UnsubscribeOutcome, Unsubscriber};

// CLI types (for binary usage)
pub use cli::{Cli, Commands, ProgressReporter};
