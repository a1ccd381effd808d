//! Portal configuration: identity, organisation-list URL derivation, and the
//! `base_urls.csv` loader.
//!
//! A portal is immutable for the duration of a run. The organisation-list URL
//! is derived from the base URL when the CSV does not carry one, and the
//! keyword is a filename-safe slug of the host used for export file stems.

use anyhow::{Context, Result};
use log::{info, warn};
use serde::{Deserialize, Serialize};
use std::path::Path;
use url::Url;

use crate::tender_id::{PortalSkill, resolve_portal_skill};

/// Query suffix of the NIC "Tenders by Organisation" front-end page.
const ORG_LIST_QUERY: &str = "page=FrontEndTendersByOrganisation&service=page";

/// Built-in portal used when no CSV is available.
pub const FALLBACK_PORTAL_NAME: &str = "HP Tenders (Fallback)";
const FALLBACK_BASE_URL: &str = "https://hptenders.gov.in/nicgep/app";

/// A single e-procurement portal, created from configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Portal {
    pub name: String,
    pub base_url: String,
    pub org_list_url: String,
    pub keyword: String,
}

impl Portal {
    /// Build a portal from a name and base URL, deriving the org-list URL
    /// and keyword.
    pub fn new(name: &str, base_url: &str) -> Result<Self> {
        let base_url = base_url.trim();
        let parsed = Url::parse(base_url)
            .with_context(|| format!("Invalid base URL for portal '{name}': {base_url}"))?;
        Ok(Self {
            name: name.trim().to_string(),
            base_url: base_url.to_string(),
            org_list_url: derive_org_list_url(&parsed),
            keyword: keyword_from_url(&parsed),
        })
    }

    /// Build a portal with an explicit keyword (CSV rows may carry one).
    pub fn with_keyword(name: &str, base_url: &str, keyword: &str) -> Result<Self> {
        let mut portal = Self::new(name, base_url)?;
        if !keyword.trim().is_empty() {
            portal.keyword = keyword.trim().to_string();
        }
        Ok(portal)
    }

    /// Hostname used for per-domain politeness, lowercased. Returns
    /// `"unknown"` when the base URL has no host.
    #[must_use]
    pub fn domain(&self) -> String {
        Url::parse(&self.base_url)
            .ok()
            .and_then(|u| u.host_str().map(|h| h.to_lowercase()))
            .unwrap_or_else(|| "unknown".to_string())
    }

    /// Scraping skill for this portal.
    #[must_use]
    pub fn skill(&self) -> PortalSkill {
        resolve_portal_skill(&self.name, &self.base_url, &self.org_list_url)
    }

    /// Normalized portal key: case-insensitive, whitespace-trimmed.
    #[must_use]
    pub fn key(&self) -> String {
        normalize_portal_name(&self.name)
    }
}

/// Case-insensitive, trimmed portal name used as the store key.
#[must_use]
pub fn normalize_portal_name(name: &str) -> String {
    name.trim().to_lowercase()
}

/// Derive the organisation-list URL: base URL with the TendersByOrganisation
/// query in place of any existing query or fragment.
fn derive_org_list_url(base: &Url) -> String {
    let mut url = base.clone();
    url.set_query(Some(ORG_LIST_QUERY));
    url.set_fragment(None);
    url.to_string()
}

/// Filename-safe slug of the URL host: lowercased, every non-alphanumeric
/// folded to `_` (`hptenders.gov.in` -> `hptenders_gov_in`).
#[must_use]
pub fn keyword_from_url(url: &Url) -> String {
    let host = url.host_str().unwrap_or("portal").to_lowercase();
    host.chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '_' })
        .collect()
}

/// The built-in fallback portal.
#[must_use]
pub fn fallback_portal() -> Portal {
    Portal::new(FALLBACK_PORTAL_NAME, FALLBACK_BASE_URL)
        .expect("fallback portal URL is valid")
}

#[derive(Debug, Deserialize)]
struct PortalCsvRow {
    #[serde(rename = "Name", default)]
    name: String,
    #[serde(rename = "BaseURL", default)]
    base_url: String,
    #[serde(rename = "Keyword", default)]
    keyword: String,
}

/// Load portal configurations from a `Name, BaseURL, Keyword` CSV.
///
/// Rows with a missing BaseURL are dropped with a warning. Results are
/// sorted by name, case-insensitive, for stable presentation order.
pub fn load_portals(csv_path: &Path) -> Result<Vec<Portal>> {
    let mut reader = csv::Reader::from_path(csv_path)
        .with_context(|| format!("Failed to open portal list: {}", csv_path.display()))?;

    let mut portals = Vec::new();
    for (idx, record) in reader.deserialize::<PortalCsvRow>().enumerate() {
        let row = match record {
            Ok(row) => row,
            Err(err) => {
                warn!("Skipping malformed portal row {}: {err}", idx + 2);
                continue;
            }
        };
        if row.base_url.trim().is_empty() {
            warn!("Skipping portal row '{}' with missing BaseURL", row.name.trim());
            continue;
        }
        match Portal::with_keyword(&row.name, &row.base_url, &row.keyword) {
            Ok(portal) => portals.push(portal),
            Err(err) => warn!("Skipping portal row '{}': {err}", row.name.trim()),
        }
    }

    portals.sort_by_key(|p| p.name.to_lowercase());
    info!("Loaded {} portal configuration(s) from {}", portals.len(), csv_path.display());
    Ok(portals)
}

/// Append a new portal to the CSV, refusing duplicates by BaseURL.
pub fn append_portal(csv_path: &Path, name: &str, base_url: &str) -> Result<Portal> {
    let base_url = base_url.trim();
    if name.trim().is_empty() || !(base_url.starts_with("http://") || base_url.starts_with("https://")) {
        anyhow::bail!("Invalid portal entry: name='{name}', base_url='{base_url}'");
    }

    if csv_path.exists() {
        let existing = load_portals(csv_path)?;
        if existing.iter().any(|p| p.base_url == base_url) {
            anyhow::bail!("Portal URL already configured: {base_url}");
        }
    }

    let portal = Portal::new(name, base_url)?;
    let write_header = !csv_path.exists()
        || std::fs::metadata(csv_path).map(|m| m.len() == 0).unwrap_or(true);

    let file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(csv_path)
        .with_context(|| format!("Failed to open portal list for append: {}", csv_path.display()))?;
    let mut writer = csv::WriterBuilder::new()
        .has_headers(false)
        .from_writer(file);
    if write_header {
        writer.write_record(["Name", "BaseURL", "Keyword"])?;
    }
    writer.write_record([&portal.name, &portal.base_url, &portal.keyword])?;
    writer.flush()?;

    info!("Appended portal '{}' to {}", portal.name, csv_path.display());
    Ok(portal)
}

/// Find a portal by its normalized name.
#[must_use]
pub fn portal_by_name<'a>(portals: &'a [Portal], name: &str) -> Option<&'a Portal> {
    let key = normalize_portal_name(name);
    portals.iter().find(|p| p.key() == key)
}
