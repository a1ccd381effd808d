//! tenderscrape: batch scrape orchestrator for NIC-family e-procurement
//! portals.
//!
//! The crate schedules portal runs across workers with per-domain
//! politeness, reconciles extracted tenders against a persistent SQLite
//! store, watchdogs stuck runs, keeps crash-safe checkpoints, and exports
//! per-portal workbooks. Browser/HTTP fetching sits behind the
//! [`fetch::PortalFetcher`] trait; everything else is portable
//! orchestration.

pub mod checkpoint;
pub mod config;
pub mod export;
pub mod fetch;
pub mod ingest;
pub mod refresh_watch;
pub mod scrape_engine;
pub mod scrape_events;
pub mod store;
pub mod tender_id;

pub use checkpoint::{CheckpointData, Checkpointer};
pub use config::{AppSettings, BatchConfig, BatchMode, IpSafetyConfig, Portal};
pub use export::{ExportKind, export_portal_current, export_run};
pub use fetch::{DepartmentInfo, FetchError, HttpPortalFetcher, PortalFetcher, RawTenderRow};
pub use ingest::{ImportOutcome, import_export_file};
pub use refresh_watch::{RefreshWatcher, ScrapeRequest};
pub use scrape_engine::{
    BatchOutcome, BatchScheduler, DomainLimiter, PortalRunner, PortalSummary, StopToken,
};
pub use scrape_events::{ScrapeEvent, ScrapeEventBus};
pub use store::{ScopeMode, TenderRecord, TenderStore};
