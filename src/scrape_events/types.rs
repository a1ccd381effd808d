//! Event type definitions for the scrape event channel.
//!
//! One tagged union replaces the per-callback wiring the shells used to
//! carry: log lines, progress ticks, department loads, errors, and
//! completion summaries all flow through the same channel, and consumers
//! (CLI, GUI, tests) subscribe to what they need.

use serde::{Deserialize, Serialize};

use crate::scrape_engine::portal_run::PortalSummary;

/// Events emitted during a batch run.
///
/// Serialized with a `type` tag so `--json-events` output is one
/// self-describing object per line.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ScrapeEvent {
    /// Coarse status line for the active portal.
    Status {
        portal: String,
        message: String,
        timestamp: chrono::DateTime<chrono::Utc>,
    },
    /// Free-form log line scoped to a portal (or the batch when empty).
    Log {
        portal: String,
        message: String,
        timestamp: chrono::DateTime<chrono::Utc>,
    },
    /// Department-level progress inside a portal run.
    Progress {
        portal: String,
        dept_current: usize,
        dept_total: usize,
        extracted: u64,
        expected: u64,
        pending_depts: usize,
        department: String,
        timestamp: chrono::DateTime<chrono::Utc>,
    },
    /// The department list for a portal has been fetched and validated.
    DepartmentsLoaded {
        portal: String,
        department_count: usize,
        expected_tenders: u64,
        timestamp: chrono::DateTime<chrono::Utc>,
    },
    /// One department finished; carries the reconciliation counters for the
    /// batch that was just upserted. This is the checkpointing trigger.
    DepartmentCompleted {
        portal: String,
        department: String,
        inserted_new: u64,
        updated_closing_date: u64,
        unchanged: u64,
        skipped_existing: u64,
        timestamp: chrono::DateTime<chrono::Utc>,
    },
    /// A recoverable or fatal error observed during a run.
    Error {
        portal: String,
        message: String,
        timestamp: chrono::DateTime<chrono::Utc>,
    },
    /// A portal run finished (any status) with its summary.
    Completed {
        portal: String,
        summary: PortalSummary,
        timestamp: chrono::DateTime<chrono::Utc>,
    },
}

impl ScrapeEvent {
    #[must_use]
    pub fn status(portal: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Status {
            portal: portal.into(),
            message: message.into(),
            timestamp: chrono::Utc::now(),
        }
    }

    #[must_use]
    pub fn log(portal: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Log {
            portal: portal.into(),
            message: message.into(),
            timestamp: chrono::Utc::now(),
        }
    }

    #[must_use]
    pub fn progress(
        portal: impl Into<String>,
        dept_current: usize,
        dept_total: usize,
        extracted: u64,
        expected: u64,
        pending_depts: usize,
        department: impl Into<String>,
    ) -> Self {
        Self::Progress {
            portal: portal.into(),
            dept_current,
            dept_total,
            extracted,
            expected,
            pending_depts,
            department: department.into(),
            timestamp: chrono::Utc::now(),
        }
    }

    #[must_use]
    pub fn departments_loaded(
        portal: impl Into<String>,
        department_count: usize,
        expected_tenders: u64,
    ) -> Self {
        Self::DepartmentsLoaded {
            portal: portal.into(),
            department_count,
            expected_tenders,
            timestamp: chrono::Utc::now(),
        }
    }

    #[must_use]
    pub fn department_completed(
        portal: impl Into<String>,
        department: impl Into<String>,
        inserted_new: u64,
        updated_closing_date: u64,
        unchanged: u64,
        skipped_existing: u64,
    ) -> Self {
        Self::DepartmentCompleted {
            portal: portal.into(),
            department: department.into(),
            inserted_new,
            updated_closing_date,
            unchanged,
            skipped_existing,
            timestamp: chrono::Utc::now(),
        }
    }

    #[must_use]
    pub fn error(portal: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Error {
            portal: portal.into(),
            message: message.into(),
            timestamp: chrono::Utc::now(),
        }
    }

    #[must_use]
    pub fn completed(portal: impl Into<String>, summary: PortalSummary) -> Self {
        Self::Completed {
            portal: portal.into(),
            summary,
            timestamp: chrono::Utc::now(),
        }
    }

    /// Portal name the event is scoped to.
    #[must_use]
    pub fn portal(&self) -> &str {
        match self {
            Self::Status { portal, .. }
            | Self::Log { portal, .. }
            | Self::Progress { portal, .. }
            | Self::DepartmentsLoaded { portal, .. }
            | Self::DepartmentCompleted { portal, .. }
            | Self::Error { portal, .. }
            | Self::Completed { portal, .. } => portal,
        }
    }
}
