//! End-to-end portal run scenarios against a real temp store: first
//! scrape, unchanged re-scrape, closing-date extension, and sticky
//! cancellation.

mod common;

use std::path::Path;
use std::sync::Arc;
use tempfile::TempDir;

use common::{PortalScript, ScriptedFetcher, dept, tender_row};
use tenderscrape::config::{IpSafetyConfig, Portal};
use tenderscrape::fetch::PortalFetcher;
use tenderscrape::scrape_engine::portal_run::{
    PortalRunOptions, PortalRunner, STATUS_COMPLETED, STATUS_NO_DEPARTMENTS,
};
use tenderscrape::scrape_engine::{DomainLimiter, PortalSummary, StopToken};
use tenderscrape::scrape_events::ScrapeEventBus;
use tenderscrape::store::{ScopeMode, TenderStore};

fn hp_portal() -> Portal {
    Portal::new("HP Tenders", "https://hptenders.gov.in/nicgep/app").expect("portal")
}

fn quiet_limiter() -> Arc<DomainLimiter> {
    Arc::new(DomainLimiter::new(IpSafetyConfig {
        per_domain_max: 1,
        min_delay_sec: 0.0,
        max_delay_sec: 0.0,
        cooldown_sec: 0,
        max_retries: 0,
    }))
}

fn roads_script(closing_1001: &str) -> PortalScript {
    PortalScript::new(vec![
        dept("S.No", "Organisation Name", "Tender Count"),
        dept("1", "Roads", "3"),
    ])
    .with_rows(
        "Roads",
        vec![
            tender_row("2026_HP_1001_1", closing_1001),
            tender_row("2026_HP_1002_1", "31/12/2026 15:00"),
            tender_row("2026_HP_1003_1", "31/12/2026 15:00"),
        ],
    )
}

async fn run_portal(
    store: &TenderStore,
    fetcher: Arc<ScriptedFetcher>,
    out_dir: &Path,
    only_new: bool,
) -> PortalSummary {
    let options = PortalRunOptions {
        scope: ScopeMode::All,
        only_new,
        delta_sweep: false,
        selected_departments: None,
        resume_departments: Default::default(),
        watchdog: Default::default(),
        export_enabled: true,
    };
    let runner = PortalRunner::new(
        hp_portal(),
        store.clone(),
        fetcher as Arc<dyn PortalFetcher>,
        quiet_limiter(),
        Arc::new(ScrapeEventBus::default()),
        out_dir.to_path_buf(),
        options,
    );
    runner.run(&StopToken::new()).await
}

#[tokio::test]
async fn test_first_scrape_inserts_and_exports() {
    let dir = TempDir::new().expect("temp dir");
    let store = TenderStore::open(&dir.path().join("tenders.sqlite3"))
        .await
        .expect("open store");

    let fetcher = ScriptedFetcher::new();
    fetcher.script_portal("HP Tenders", roads_script("31/12/2026 15:00"));

    let summary = run_portal(&store, fetcher.into_arc(), dir.path(), true).await;

    assert_eq!(summary.status, STATUS_COMPLETED);
    assert_eq!(summary.expected_total_tenders, 3);
    assert_eq!(summary.extracted_total_tenders, 3);
    assert_eq!(summary.skipped_existing_total, 0);
    assert_eq!(summary.processed_departments, 1);
    assert!(!summary.partial_saved);

    // Export file with the keyword stem and xlsx extension.
    let output = summary.output_file_path.expect("export path");
    let name = Path::new(&output)
        .file_name()
        .expect("file name")
        .to_string_lossy()
        .to_string();
    assert!(name.starts_with("hptenders_gov_in_tenders_"));
    assert!(name.ends_with(".xlsx"));
    assert!(Path::new(&output).exists());

    assert_eq!(
        store.tender_count_for_portal("HP Tenders").await.expect("count"),
        3
    );
}

#[tokio::test]
async fn test_rescrape_unchanged_skips_everything() {
    let dir = TempDir::new().expect("temp dir");
    let store = TenderStore::open(&dir.path().join("tenders.sqlite3"))
        .await
        .expect("open store");

    let first = ScriptedFetcher::new();
    first.script_portal("HP Tenders", roads_script("31/12/2026 15:00"));
    run_portal(&store, first.into_arc(), dir.path(), true).await;

    let second = ScriptedFetcher::new();
    second.script_portal("HP Tenders", roads_script("31/12/2026 15:00"));
    let summary = run_portal(&store, second.into_arc(), dir.path(), true).await;

    assert_eq!(summary.status, STATUS_COMPLETED);
    assert_eq!(summary.extracted_total_tenders, 0);
    assert_eq!(summary.skipped_existing_total, 3);
    assert_eq!(summary.closing_date_reprocessed_total, 0);
    assert_eq!(
        store.tender_count_for_portal("HP Tenders").await.expect("count"),
        3
    );
}

#[tokio::test]
async fn test_closing_date_extension_reprocessed() {
    let dir = TempDir::new().expect("temp dir");
    let store = TenderStore::open(&dir.path().join("tenders.sqlite3"))
        .await
        .expect("open store");

    let first = ScriptedFetcher::new();
    first.script_portal("HP Tenders", roads_script("31/12/2026 15:00"));
    run_portal(&store, first.into_arc(), dir.path(), true).await;

    // Portal now reports an extended deadline for 1001 only.
    let second = ScriptedFetcher::new();
    second.script_portal("HP Tenders", roads_script("05/01/2027 15:00"));
    let summary = run_portal(&store, second.into_arc(), dir.path(), true).await;

    assert_eq!(summary.extracted_total_tenders, 1);
    assert_eq!(summary.skipped_existing_total, 2);
    assert_eq!(summary.closing_date_reprocessed_total, 1);

    let snapshot = store
        .existing_tender_snapshot_for_portal("HP Tenders")
        .await
        .expect("snapshot");
    assert_eq!(
        snapshot.get("2026_HP_1001_1").map(String::as_str),
        Some("05/01/2027 15:00")
    );
}

#[tokio::test]
async fn test_cancellation_is_sticky_through_rescrape() {
    let dir = TempDir::new().expect("temp dir");
    let store = TenderStore::open(&dir.path().join("tenders.sqlite3"))
        .await
        .expect("open store");

    let first = ScriptedFetcher::new();
    first.script_portal("HP Tenders", roads_script("31/12/2026 15:00"));
    run_portal(&store, first.into_arc(), dir.path(), true).await;

    let updated = store
        .mark_cancelled("HP Tenders", &["2026_HP_1002_1".to_string()], "cancelled_page")
        .await
        .expect("mark cancelled");
    assert_eq!(updated, 1);

    // Re-scrape sees the same id with the same data: lifecycle stays
    // cancelled while last-seen moves.
    let second = ScriptedFetcher::new();
    second.script_portal("HP Tenders", roads_script("31/12/2026 15:00"));
    run_portal(&store, second.into_arc(), dir.path(), true).await;

    assert_eq!(
        store
            .lifecycle_for("HP Tenders", "2026_HP_1002_1")
            .await
            .expect("lifecycle"),
        Some("cancelled".to_string())
    );
}

#[tokio::test]
async fn test_empty_department_list_reports_no_departments() {
    let dir = TempDir::new().expect("temp dir");
    let store = TenderStore::open(&dir.path().join("tenders.sqlite3"))
        .await
        .expect("open store");

    // Only header-like rows: zero valid departments.
    let fetcher = ScriptedFetcher::new();
    fetcher.script_portal(
        "HP Tenders",
        PortalScript::new(vec![dept("S.No", "Organisation Name", "Tender Count")]),
    );
    let summary = run_portal(&store, fetcher.into_arc(), dir.path(), true).await;

    assert_eq!(summary.status, STATUS_NO_DEPARTMENTS);
    assert_eq!(summary.extracted_total_tenders, 0);
    assert!(summary.output_file_path.is_none());
}

#[tokio::test]
async fn test_rows_without_extractable_id_are_dropped() {
    let dir = TempDir::new().expect("temp dir");
    let store = TenderStore::open(&dir.path().join("tenders.sqlite3"))
        .await
        .expect("open store");

    let mut nameless = tender_row("2026_HP_1001_1", "31/12/2026 15:00");
    nameless.title_ref = "Annual maintenance contract".to_string();
    let script = PortalScript::new(vec![dept("1", "Roads", "2")]).with_rows(
        "Roads",
        vec![nameless, tender_row("2026_HP_1002_1", "31/12/2026 15:00")],
    );
    let fetcher = ScriptedFetcher::new();
    fetcher.script_portal("HP Tenders", script);

    let summary = run_portal(&store, fetcher.into_arc(), dir.path(), true).await;
    // The id-less row is neither extracted nor skipped.
    assert_eq!(summary.extracted_total_tenders, 1);
    assert_eq!(summary.skipped_existing_total, 0);
    assert_eq!(
        store.tender_count_for_portal("HP Tenders").await.expect("count"),
        1
    );
}

#[tokio::test]
async fn test_resume_departments_are_not_revisited() {
    let dir = TempDir::new().expect("temp dir");
    let store = TenderStore::open(&dir.path().join("tenders.sqlite3"))
        .await
        .expect("open store");

    let script = PortalScript::new(vec![dept("1", "Roads", "1"), dept("2", "Bridges", "1")])
        .with_rows("Roads", vec![tender_row("2026_HP_1001_1", "31/12/2026 15:00")])
        .with_rows("Bridges", vec![tender_row("2026_HP_2001_1", "31/12/2026 15:00")]);
    let fetcher = ScriptedFetcher::new();
    fetcher.script_portal("HP Tenders", script);
    let fetcher = fetcher.into_arc();

    let options = PortalRunOptions {
        scope: ScopeMode::All,
        only_new: true,
        resume_departments: std::iter::once("roads".to_string()).collect(),
        export_enabled: false,
        ..PortalRunOptions::default()
    };
    let runner = PortalRunner::new(
        hp_portal(),
        store.clone(),
        Arc::clone(&fetcher) as Arc<dyn PortalFetcher>,
        quiet_limiter(),
        Arc::new(ScrapeEventBus::default()),
        dir.path().to_path_buf(),
        options,
    );
    let summary = runner.run(&StopToken::new()).await;

    assert_eq!(summary.resume_skipped_departments, 1);
    assert_eq!(summary.processed_departments, 1);
    assert_eq!(summary.extracted_total_tenders, 1);
    assert_eq!(
        fetcher.row_calls.load(std::sync::atomic::Ordering::SeqCst),
        1
    );
}
