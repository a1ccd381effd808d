//! HTTP-based portal fetcher for NIC-shaped listing pages.
//!
//! NIC "TendersByOrganisation" pages render their tables server-side, so a
//! plain HTTP client with an HTML parser covers them. The department list
//! and the per-department listing share the `#table` layout; only the column
//! meanings differ.

use async_trait::async_trait;
use log::{debug, warn};
use reqwest::Client;
use scraper::{Html, Selector};
use std::time::Duration;
use tokio::sync::RwLock;
use url::Url;

use crate::config::Portal;
use crate::config::settings::TimeoutSettings;

use super::{
    DepartmentInfo, DepartmentListing, FetchError, PortalFetcher, RawTenderRow,
    sanitize_department_direct_url,
};

const USER_AGENT: &str =
    "Mozilla/5.0 (X11; Linux x86_64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/126.0 Safari/537.36";

/// Stateless-HTTP implementation of `PortalFetcher`.
///
/// `reinitialize` swaps the client out wholesale, dropping pooled
/// connections and cookies, which is the HTTP analogue of restarting a
/// browser session.
pub struct HttpPortalFetcher {
    client: RwLock<Client>,
    page_timeout: Duration,
}

impl HttpPortalFetcher {
    pub fn new(timeouts: &TimeoutSettings) -> Result<Self, FetchError> {
        let page_timeout = Duration::from_secs(timeouts.page_load_timeout_secs.max(1));
        Ok(Self {
            client: RwLock::new(build_client(page_timeout)?),
            page_timeout,
        })
    }

    async fn get_html(&self, url: &str) -> Result<String, FetchError> {
        let client = self.client.read().await.clone();
        let response = client.get(url).send().await?;
        let status = response.status();
        if !status.is_success() {
            // The status line is part of the message so rate-block detection
            // can match on "429"/"503".
            return Err(FetchError::Http(format!(
                "{} {} for {url}",
                status.as_u16(),
                status.canonical_reason().unwrap_or("error")
            )));
        }
        Ok(response.text().await?)
    }
}

fn build_client(page_timeout: Duration) -> Result<Client, FetchError> {
    // Several state portals serve incomplete certificate chains.
    Client::builder()
        .user_agent(USER_AGENT)
        .timeout(page_timeout)
        .danger_accept_invalid_certs(true)
        .cookie_store(true)
        .build()
        .map_err(FetchError::from)
}

#[async_trait]
impl PortalFetcher for HttpPortalFetcher {
    async fn fetch_department_list(
        &self,
        portal: &Portal,
    ) -> Result<DepartmentListing, FetchError> {
        let html = self.get_html(&portal.org_list_url).await?;
        let listing = parse_department_list(&html, &portal.org_list_url)?;
        debug!(
            "Fetched {} department row(s) from '{}' (expected {} tenders)",
            listing.departments.len(),
            portal.name,
            listing.expected_total
        );
        Ok(listing)
    }

    async fn fetch_department_rows(
        &self,
        portal: &Portal,
        department: &DepartmentInfo,
    ) -> Result<Vec<RawTenderRow>, FetchError> {
        if department.direct_url.is_empty() {
            return Err(FetchError::Parse(format!(
                "department '{}' has no direct link on portal '{}'",
                department.name, portal.name
            )));
        }
        let html = self.get_html(&department.direct_url).await?;
        parse_department_rows(&html, &department.direct_url)
    }

    async fn reinitialize(&self) -> Result<(), FetchError> {
        warn!("Reinitializing HTTP fetch session");
        let fresh = build_client(self.page_timeout)?;
        *self.client.write().await = fresh;
        Ok(())
    }
}

fn table_row_selector() -> Selector {
    Selector::parse("#table tr").expect("row selector")
}

fn cell_selector() -> Selector {
    Selector::parse("td").expect("cell selector")
}

fn anchor_selector() -> Selector {
    Selector::parse("a").expect("anchor selector")
}

fn cell_text(cell: &scraper::ElementRef<'_>) -> String {
    cell.text().collect::<String>().trim().to_string()
}

fn resolve_href(base: &str, href: &str) -> String {
    match Url::parse(base).and_then(|b| b.join(href)) {
        Ok(url) => sanitize_department_direct_url(url.as_str()),
        Err(_) => String::new(),
    }
}

/// Parse the organisation list table: serial, name, advertised count (the
/// count cell carries the department link).
pub fn parse_department_list(html: &str, base_url: &str) -> Result<DepartmentListing, FetchError> {
    let document = Html::parse_document(html);
    let rows: Vec<_> = document.select(&table_row_selector()).collect();
    if rows.is_empty() {
        return Err(FetchError::Parse("department table '#table' not found".to_string()));
    }

    let cells_sel = cell_selector();
    let anchor_sel = anchor_selector();
    let mut listing = DepartmentListing::default();

    for row in rows {
        let cells: Vec<_> = row.select(&cells_sel).collect();
        if cells.len() < 3 {
            continue;
        }
        let s_no = cell_text(&cells[0]);
        let name = cell_text(&cells[1]);
        let count_text = cell_text(&cells[2]);

        let direct_url = cells[2]
            .select(&anchor_sel)
            .next()
            .and_then(|a| a.value().attr("href"))
            .map(|href| resolve_href(base_url, href))
            .unwrap_or_default();

        if let Ok(count) = count_text.parse::<u64>() {
            listing.expected_total += count;
        }

        listing.departments.push(DepartmentInfo {
            s_no,
            name,
            count_text,
            direct_url,
        });
    }

    Ok(listing)
}

/// Parse a department listing table into raw tender rows. Columns: serial,
/// published, closing, opening, title+ref (linked), organisation chain.
pub fn parse_department_rows(html: &str, base_url: &str) -> Result<Vec<RawTenderRow>, FetchError> {
    let document = Html::parse_document(html);
    let rows: Vec<_> = document.select(&table_row_selector()).collect();
    if rows.is_empty() {
        return Err(FetchError::Parse("tender table '#table' not found".to_string()));
    }

    let cells_sel = cell_selector();
    let anchor_sel = anchor_selector();
    let mut tenders = Vec::new();

    for row in rows {
        let cells: Vec<_> = row.select(&cells_sel).collect();
        if cells.len() < 6 {
            continue;
        }
        let s_no = cell_text(&cells[0]);
        // Header and pagination rows carry non-numeric serials.
        if s_no.parse::<u64>().is_err() {
            continue;
        }

        let mut anchors = cells[4].select(&anchor_sel);
        let direct_url = anchors
            .next()
            .and_then(|a| a.value().attr("href"))
            .map(|href| resolve_href(base_url, href))
            .unwrap_or_default();
        let status_url = anchors
            .next()
            .and_then(|a| a.value().attr("href"))
            .map(|href| resolve_href(base_url, href))
            .unwrap_or_default();

        tenders.push(RawTenderRow {
            s_no,
            published_date: cell_text(&cells[1]),
            closing_date: cell_text(&cells[2]),
            opening_date: cell_text(&cells[3]),
            title_ref: cell_text(&cells[4]),
            organisation_chain: cell_text(&cells[5]),
            direct_url,
            status_url,
        });
    }

    Ok(tenders)
}
