//! Batch scheduler scenarios: rate-block retry, cooperative stop with a
//! kept checkpoint, and checkpoint resume.

mod common;

use std::sync::Arc;
use tempfile::TempDir;

use common::{PortalScript, ScriptedFetcher, dept, tender_row};
use tenderscrape::checkpoint::Checkpointer;
use tenderscrape::config::{BatchConfig, BatchMode, IpSafetyConfig, Portal};
use tenderscrape::fetch::{FetchError, PortalFetcher};
use tenderscrape::scrape_engine::{BatchScheduler, StopToken};
use tenderscrape::scrape_events::ScrapeEventBus;
use tenderscrape::store::TenderStore;

fn portal(name: &str, host: &str) -> Portal {
    Portal::new(name, &format!("https://{host}/nicgep/app")).expect("portal")
}

fn quick_config(mode: BatchMode, max_retries: u32) -> BatchConfig {
    BatchConfig {
        mode,
        max_parallel: 2,
        only_new: true,
        delta_mode: tenderscrape::config::DeltaMode::Full,
        ip_safety: IpSafetyConfig {
            per_domain_max: 1,
            min_delay_sec: 0.0,
            max_delay_sec: 0.0,
            cooldown_sec: 0,
            max_retries,
        },
    }
}

fn one_dept_script(prefix: &str) -> PortalScript {
    PortalScript::new(vec![dept("1", "Roads", "1")]).with_rows(
        "Roads",
        vec![tender_row(&format!("2026_{prefix}_1001_1"), "31/12/2026 15:00")],
    )
}

async fn scheduler_for(
    dir: &TempDir,
    fetcher: Arc<ScriptedFetcher>,
    config: BatchConfig,
) -> (BatchScheduler, TenderStore) {
    let store = TenderStore::open(&dir.path().join("tenders.sqlite3"))
        .await
        .expect("open store");
    let scheduler = BatchScheduler::new(
        store.clone(),
        fetcher as Arc<dyn PortalFetcher>,
        Arc::new(ScrapeEventBus::default()),
        config,
        dir.path().join("exports"),
        dir.path().join("state"),
    );
    (scheduler, store)
}

#[tokio::test(start_paused = true)]
async fn test_rate_block_backoff_then_recovery() {
    let dir = TempDir::new().expect("temp dir");
    let fetcher = ScriptedFetcher::new();
    fetcher.script_portal("HP Tenders", one_dept_script("HP"));
    fetcher.fail_next_list(
        "HP Tenders",
        FetchError::Http("429 Too Many Requests".to_string()),
    );
    let fetcher = fetcher.into_arc();

    let (scheduler, store) = scheduler_for(
        &dir,
        Arc::clone(&fetcher),
        quick_config(BatchMode::Parallel, 2),
    )
    .await;

    let outcome = scheduler
        .run(
            vec![portal("HP Tenders", "hptenders.gov.in")],
            StopToken::new(),
            None,
        )
        .await
        .expect("batch run");

    let summary = outcome.summaries.get("HP Tenders").expect("summary");
    assert_eq!(summary.status, "Scraping completed");
    assert_eq!(summary.extracted_total_tenders, 1);
    // The blocked first attempt stays on the record.
    assert!(summary.errors.iter().any(|e| e.contains("429")));
    assert!(fetcher.list_calls.load(std::sync::atomic::Ordering::SeqCst) >= 2);
    assert_eq!(
        store.tender_count_for_portal("HP Tenders").await.expect("count"),
        1
    );
}

#[tokio::test]
async fn test_stop_mid_batch_keeps_checkpoint_with_remaining() {
    let dir = TempDir::new().expect("temp dir");

    let fetcher = ScriptedFetcher::new();
    fetcher.script_portal("Portal A", one_dept_script("AA"));
    let b_script = PortalScript::new(vec![
        dept("1", "B One", "1"),
        dept("2", "B Two", "1"),
        dept("3", "B Three", "1"),
    ])
    .with_rows("B One", vec![tender_row("2026_BB_0001_1", "31/12/2026 15:00")])
    .with_rows("B Two", vec![tender_row("2026_BB_0002_1", "31/12/2026 15:00")])
    .with_rows("B Three", vec![tender_row("2026_BB_0003_1", "31/12/2026 15:00")]);
    fetcher.script_portal("Portal B", b_script);
    fetcher.script_portal("Portal C", one_dept_script("CC"));

    let stop = StopToken::new();
    let stop_from_hook = stop.clone();
    fetcher.set_department_hook(Box::new(move |portal_name, dept_name| {
        if portal_name == "Portal B" && dept_name == "B Two" {
            stop_from_hook.set();
        }
    }));
    let fetcher = fetcher.into_arc();

    let (scheduler, store) = scheduler_for(
        &dir,
        Arc::clone(&fetcher),
        quick_config(BatchMode::Sequential, 0),
    )
    .await;
    let checkpoint_path = scheduler.checkpoint_path();

    let portals = vec![
        portal("Portal A", "a.gov.in"),
        portal("Portal B", "b.gov.in"),
        portal("Portal C", "c.gov.in"),
    ];
    let outcome = scheduler
        .run(portals, stop, None)
        .await
        .expect("batch run");

    // A finalized cleanly; B observed the stop at a department boundary and
    // saved partial; C never started.
    let a = outcome.summaries.get("Portal A").expect("A summary");
    assert_eq!(a.status, "Scraping completed");
    let b = outcome.summaries.get("Portal B").expect("B summary");
    assert!(b.partial_saved);
    assert_eq!(b.processed_departments, 2);
    assert!(!outcome.summaries.contains_key("Portal C"));

    // B's committed rows are valid data.
    assert_eq!(
        store.tender_count_for_portal("Portal B").await.expect("count"),
        2
    );

    // The checkpoint survives with C remaining.
    assert!(checkpoint_path.exists());
    let data = Checkpointer::load(&checkpoint_path).expect("load checkpoint");
    assert_eq!(data.remaining_portals, vec!["Portal C".to_string()]);
}

#[tokio::test]
async fn test_checkpoint_resume_completes_all_portals() {
    let dir = TempDir::new().expect("temp dir");

    let fetcher = ScriptedFetcher::new();
    fetcher.script_portal("Portal A", one_dept_script("AA"));
    fetcher.script_portal("Portal B", one_dept_script("BB"));
    let stop = StopToken::new();
    let stop_from_hook = stop.clone();
    fetcher.set_department_hook(Box::new(move |portal_name, _| {
        if portal_name == "Portal A" {
            // Stop right after A's only department: B never starts.
            stop_from_hook.set();
        }
    }));
    let fetcher = fetcher.into_arc();

    let (scheduler, _store) = scheduler_for(
        &dir,
        Arc::clone(&fetcher),
        quick_config(BatchMode::Sequential, 0),
    )
    .await;
    let checkpoint_path = scheduler.checkpoint_path();

    let all_portals = vec![portal("Portal A", "a.gov.in"), portal("Portal B", "b.gov.in")];
    let first = scheduler
        .run(all_portals.clone(), stop, None)
        .await
        .expect("first batch");
    let completed_before: Vec<String> = first.summaries.keys().cloned().collect();

    let prior = Checkpointer::load(&checkpoint_path).expect("checkpoint after stop");
    assert!(!prior.remaining_portals.is_empty());

    // Second run: exactly the remaining portals, resumed.
    let remaining: Vec<Portal> = all_portals
        .iter()
        .filter(|p| prior.remaining_portals.contains(&p.name))
        .cloned()
        .collect();
    let (scheduler2, _) = scheduler_for(
        &dir,
        Arc::clone(&fetcher),
        quick_config(BatchMode::Sequential, 0),
    )
    .await;
    let second = scheduler2
        .run(remaining, StopToken::new(), Some(prior))
        .await
        .expect("resume batch");

    // Union of completions across the restart covers the initial selection.
    let mut completed_after: Vec<String> = second.summaries.keys().cloned().collect();
    let mut union = completed_before;
    union.append(&mut completed_after);
    union.sort();
    union.dedup();
    assert_eq!(union, vec!["Portal A".to_string(), "Portal B".to_string()]);

    // Nothing remains, so the checkpoint is gone.
    assert!(!checkpoint_path.exists());
    // Resume base keeps displayed totals monotone.
    assert!(second.totals.tenders >= first.totals.tenders);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_parallel_same_host_serialized_by_domain_slot() {
    let dir = TempDir::new().expect("temp dir");

    let fetcher = ScriptedFetcher::new();
    fetcher.script_portal("Shared One", one_dept_script("S1"));
    fetcher.script_portal("Shared Two", one_dept_script("S2"));

    // Track concurrent department fetches against the shared host.
    let in_flight = Arc::new(std::sync::atomic::AtomicUsize::new(0));
    let max_seen = Arc::new(std::sync::atomic::AtomicUsize::new(0));
    let (in_flight_hook, max_seen_hook) = (Arc::clone(&in_flight), Arc::clone(&max_seen));
    fetcher.set_department_hook(Box::new(move |_, _| {
        let now = in_flight_hook.fetch_add(1, std::sync::atomic::Ordering::SeqCst) + 1;
        max_seen_hook.fetch_max(now, std::sync::atomic::Ordering::SeqCst);
        std::thread::sleep(std::time::Duration::from_millis(20));
        in_flight_hook.fetch_sub(1, std::sync::atomic::Ordering::SeqCst);
    }));
    let fetcher = fetcher.into_arc();

    let (scheduler, _store) = scheduler_for(
        &dir,
        Arc::clone(&fetcher),
        quick_config(BatchMode::Parallel, 0),
    )
    .await;

    let outcome = scheduler
        .run(
            vec![
                portal("Shared One", "shared.gov.in"),
                portal("Shared Two", "shared.gov.in"),
            ],
            StopToken::new(),
            None,
        )
        .await
        .expect("batch run");

    assert_eq!(outcome.summaries.len(), 2);
    // per_domain_max = 1: never two fetches against the host at once.
    assert_eq!(max_seen.load(std::sync::atomic::Ordering::SeqCst), 1);
}
