//! # Legis Collector
//!
//! The concurrency core of a legislative-data collector: a lazily filled,
//! prefetching queue over paged sources (database queries, "next page" links
//! on parliamentary websites) whose items are fanned out to a worker pool,
//! and a bounded pool of expensive browser sessions the workers borrow from.
//!
//! ## Components
//!
//! | Component | Role |
//! |-----------|------|
//! | [`PageSource`] | Produces successive pages; an empty page means exhausted |
//! | [`Prefetcher`] | Keeps at most one page fetch in flight, triggered by a low-water-mark |
//! | [`StreamingQueue`] | Single-consumer queue; `poll`, `into_stream` and parallel `for_each` |
//! | [`WorkerPool`] | Fixed set of tokio worker tasks draining a shared job channel |
//! | [`ResourcePool`] | At most `capacity` live resources, FIFO waiters, consuming [`Lease`]s |
//! | [`Collector`] | One run: a session pool plus queue passes that lease a session per item |
//!
//! Page fetches run on a dedicated single-worker pool by default, so item
//! handlers keep the whole handler pool. [`StreamingQueue::shared`] (or
//! `share_worker_pool` in [`QueueConfig`]) runs both on one pool instead.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use futures::FutureExt;
//! use legis_collector::{Collector, Config, DbPage, DbPageSource, PageRequest};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let collector = Collector::new(
//!         Config::default(),
//!         || async { Ok(String::from("browser session")) }.boxed(),
//!         |_session| async { Ok(()) }.boxed(),
//!     )?;
//!
//!     let bills = DbPageSource::with_page_size(20, |request: PageRequest| async move {
//!         let ids: Vec<usize> = (request.offset()..request.offset() + request.size).collect();
//!         Ok(DbPage::new(ids, request.number < 4))
//!     });
//!
//!     let report = collector
//!         .collect("bills", bills, |id, session| async move {
//!             println!("scraping bill {} with {}", id, *session);
//!             Ok(())
//!         })
//!         .await?;
//!     println!("{} bills, {} failed", report.dispatched, report.failed);
//!
//!     collector.shutdown().await;
//!     Ok(())
//! }
//! ```
//!
//! ## CLI Usage
//!
//! ```bash
//! legis-collector run --pages 20 --page-size 20 --capacity 8
//! legis-collector --config collector.json validate
//! legis-collector show-config
//! ```

/// Configuration for queues, the resource pool and health thresholds
pub mod config;

/// Error types and error handling utilities
pub mod error;

/// Paged item sources
pub mod page_source;

/// Single-flight background page fetching
pub mod prefetcher;

/// Prefetching queue and parallel drain
pub mod streaming_queue;

/// Bounded pool of expensive resources
pub mod resource_pool;

/// Worker tasks for fetches and item handlers
pub mod worker;

/// Run-level composition of queue and resource pool
pub mod collector;

/// Command-line interface implementation
pub mod cli;

/// Metrics handles and Prometheus exporter setup
pub mod metrics;

/// Health checks for sources and the resource pool
pub mod health;

/// Utility functions and helpers
pub mod utils;


pub use cli::*;
pub use collector::*;
pub use config::*;
pub use error::*;
pub use health::*;
pub use self::metrics::*;
pub use page_source::*;
pub use prefetcher::*;
pub use resource_pool::*;
pub use streaming_queue::*;
pub use utils::*;
pub use worker::*;
