//! The batch scrape engine: scheduler, per-portal runs, politeness,
//! watchdog, and run reports.

pub mod domain_limiter;
pub mod portal_run;
pub mod report;
pub mod scheduler;
pub mod stop;
pub mod watchdog;

pub use domain_limiter::{DomainLimiter, DomainSlot};
pub use portal_run::{PortalRunOptions, PortalRunner, PortalSummary};
pub use report::{RunReport, prepare_report_dir, write_portal_report};
pub use scheduler::{BatchOutcome, BatchScheduler, resolve_selection};
pub use stop::{StopToken, sleep_with_stop};
pub use watchdog::{ActivityTracker, WatchdogConfig, spawn_watchdog};
