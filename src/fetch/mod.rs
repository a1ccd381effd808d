//! Portal fetching contract.
//!
//! The scraper never owns browser or HTTP lifecycle details; it talks to a
//! `PortalFetcher` that lists departments and returns the tender rows for
//! one department. The bundled `HttpPortalFetcher` covers NIC-shaped portals
//! that render without JavaScript; anything else plugs in behind the same
//! trait.

pub mod http;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use url::Url;

use crate::config::Portal;

pub use http::HttpPortalFetcher;

/// Query keys that carry session state and must never be persisted.
const SESSION_QUERY_KEYS: &[&str] = &["session", "sp", "jsessionid", "sid", "phpsessid"];

/// Serial-cell values that mark a header row.
const HEADER_SERIALS: &[&str] = &["s.no", "sr.no", "serial", "#"];

/// Name-cell values that mark a header row.
const HEADER_NAMES: &[&str] = &[
    "organisation name",
    "department name",
    "organization",
    "organization name",
];

/// Text fragments that indicate the fetch session died underneath us.
const SESSION_DEAD_MARKERS: &[&str] = &[
    "session",
    "invalid session",
    "timeout",
    "connection",
    "disconnected",
    "chrome not reachable",
    "target window already closed",
    "unable to discover open pages",
    "net::",
];

/// Errors surfaced by a portal fetcher.
#[derive(Debug, thiserror::Error)]
pub enum FetchError {
    #[error("fetch timed out: {0}")]
    Timeout(String),
    #[error("fetch session dead: {0}")]
    SessionDead(String),
    #[error("http error: {0}")]
    Http(String),
    #[error("parse error: {0}")]
    Parse(String),
}

impl FetchError {
    /// Classify an error message; promotes to `SessionDead` when the text
    /// matches a known session-dead marker.
    #[must_use]
    pub fn classify(message: String) -> Self {
        if is_session_dead_text(&message) {
            Self::SessionDead(message)
        } else {
            Self::Http(message)
        }
    }

    /// True when the scraper should tear down and reinitialize the fetch
    /// session before retrying.
    #[must_use]
    pub fn needs_recovery(&self) -> bool {
        matches!(self, Self::Timeout(_) | Self::SessionDead(_))
    }
}

impl From<reqwest::Error> for FetchError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            Self::Timeout(err.to_string())
        } else if err.is_connect() {
            Self::SessionDead(err.to_string())
        } else {
            Self::classify(err.to_string())
        }
    }
}

/// True iff the text matches a session-dead / recoverable-error marker.
#[must_use]
pub fn is_session_dead_text(text: &str) -> bool {
    let payload = text.to_lowercase();
    SESSION_DEAD_MARKERS.iter().any(|m| payload.contains(m))
}

/// One department row from a portal's organisation list.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DepartmentInfo {
    pub s_no: String,
    pub name: String,
    pub count_text: String,
    pub direct_url: String,
}

impl DepartmentInfo {
    /// A department is valid iff the serial parses as a positive integer and
    /// neither cell is a header literal. Header-like rows are always
    /// skipped.
    #[must_use]
    pub fn is_valid(&self) -> bool {
        let serial = self.s_no.trim().to_lowercase();
        let name = self.name.trim().to_lowercase();
        if HEADER_SERIALS.contains(&serial.as_str()) || HEADER_NAMES.contains(&name.as_str()) {
            return false;
        }
        serial.parse::<u64>().map(|n| n > 0).unwrap_or(false)
    }

    /// Advertised tender count, when the cell is numeric.
    #[must_use]
    pub fn advertised_count(&self) -> Option<u64> {
        self.count_text.trim().parse().ok()
    }

    /// Lowercased, trimmed name used for resume bookkeeping.
    #[must_use]
    pub fn normalized_name(&self) -> String {
        self.name.trim().to_lowercase()
    }
}

/// One raw tender row extracted from a department listing.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawTenderRow {
    pub s_no: String,
    pub published_date: String,
    pub closing_date: String,
    pub opening_date: String,
    pub title_ref: String,
    pub organisation_chain: String,
    pub direct_url: String,
    pub status_url: String,
}

/// Departments plus the advertised grand total from the listing page.
#[derive(Debug, Clone, Default)]
pub struct DepartmentListing {
    pub departments: Vec<DepartmentInfo>,
    pub expected_total: u64,
}

/// The fetch contract the scraper depends on.
#[async_trait]
pub trait PortalFetcher: Send + Sync {
    /// Fetch and parse the organisation list for a portal.
    async fn fetch_department_list(&self, portal: &Portal)
    -> Result<DepartmentListing, FetchError>;

    /// Fetch the tender rows for one department. Session-bearing navigation
    /// happens inside the fetcher; callers pass the department, never a raw
    /// URL.
    async fn fetch_department_rows(
        &self,
        portal: &Portal,
        department: &DepartmentInfo,
    ) -> Result<Vec<RawTenderRow>, FetchError>;

    /// Tear down and rebuild the fetch session (watchdog recovery path).
    async fn reinitialize(&self) -> Result<(), FetchError>;
}

/// Strip volatile session parameters from a department direct URL.
///
/// Removes any query key equal to one of the known session keys or
/// containing the substring `session`. Unparseable URLs pass through
/// unchanged.
#[must_use]
pub fn sanitize_department_direct_url(raw: &str) -> String {
    let raw = raw.trim();
    if raw.is_empty() {
        return String::new();
    }
    let Ok(mut url) = Url::parse(raw) else {
        return raw.to_string();
    };
    if url.query().is_none() {
        return raw.to_string();
    }

    let kept: Vec<(String, String)> = url
        .query_pairs()
        .filter(|(key, _)| {
            let key = key.trim().to_lowercase();
            !SESSION_QUERY_KEYS.contains(&key.as_str()) && !key.contains("session")
        })
        .map(|(k, v)| (k.into_owned(), v.into_owned()))
        .collect();

    url.set_query(None);
    if !kept.is_empty() {
        let mut pairs = url.query_pairs_mut();
        for (key, value) in &kept {
            pairs.append_pair(key, value);
        }
    }
    url.to_string()
}
