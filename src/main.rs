//! Non-interactive command-line entry point.
//!
//! `tenderscrape --url <portal-name> department --all` scrapes a portal's
//! departments through the batch scheduler, with optional NDJSON event
//! output for driving shells and supervisors. `reconcile-cancelled` marks
//! portal tender ids as cancelled from inline lists or TXT/CSV files.

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use log::{info, warn};
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tenderscrape::config::{self, AppSettings, BatchConfig, BatchMode, Portal};
use tenderscrape::fetch::{HttpPortalFetcher, PortalFetcher};
use tenderscrape::refresh_watch::RefreshWatcher;
use tenderscrape::scrape_engine::{BatchScheduler, StopToken, resolve_selection};
use tenderscrape::scrape_events::ScrapeEventBus;
use tenderscrape::store::{ScopeMode, TenderStore};
use tenderscrape::{checkpoint, store};

#[derive(Debug, Parser)]
#[command(name = "tenderscrape", version, about = "Batch tender scrape orchestrator")]
struct Cli {
    /// Portal name as configured in the portal list
    #[arg(long = "url")]
    url: Option<String>,

    /// Output directory for exports (defaults to the settings download dir)
    #[arg(long)]
    output: Option<PathBuf>,

    /// Log file path (stderr when omitted)
    #[arg(long)]
    log: Option<PathBuf>,

    /// External job identifier carried into log lines
    #[arg(long = "job-id")]
    job_id: Option<String>,

    /// Emit one JSON event per line on stdout
    #[arg(long = "json-events")]
    json_events: bool,

    /// Portal list CSV (Name, BaseURL, Keyword)
    #[arg(long = "base-urls", default_value = "base_urls.csv")]
    base_urls: PathBuf,

    /// Settings file
    #[arg(long, default_value = "settings.json")]
    settings: PathBuf,

    /// State directory (store, checkpoints, reports); defaults to the
    /// platform-local data dir
    #[arg(long = "state-dir")]
    state_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Scrape departments of the selected portal
    Department(DepartmentArgs),
    /// Mark portal tender ids as cancelled in the datastore
    ReconcileCancelled(ReconcileArgs),
    /// Import previously exported scrape CSVs into the datastore
    Import(ImportArgs),
    /// Run the refresh-watch daemon: signature-check watched portals and
    /// scrape on change
    Watch,
}

#[derive(Debug, Args)]
struct DepartmentArgs {
    /// Scrape every valid department
    #[arg(long)]
    all: bool,

    /// With --all: keep only departments whose name contains this substring
    #[arg(long)]
    filter: Option<String>,

    /// Explicit department names (alternative to --all)
    names: Vec<String>,

    /// Department worker count (listing scrapes are sequential; values
    /// above 1 are coerced)
    #[arg(long = "dept-workers", default_value_t = 1)]
    dept_workers: usize,

    /// Skip tenders already in the store with an unchanged closing date
    #[arg(long = "only-new")]
    only_new: bool,
}

#[derive(Debug, Args)]
struct ImportArgs {
    /// Single export CSV to import
    #[arg(long)]
    file: Option<PathBuf>,

    /// Directory to sweep for export CSVs (used when --file is absent)
    #[arg(long = "source-dir", default_value = "Tender_Downloads")]
    source_dir: PathBuf,

    /// Only consider files modified in the last N days
    #[arg(long, default_value_t = 180)]
    days: u32,

    /// Maximum number of files to import in one sweep
    #[arg(long = "max-files", default_value_t = 25)]
    max_files: usize,

    /// Portal name override (otherwise taken from the file)
    #[arg(long)]
    portal: Option<String>,
}

#[derive(Debug, Args)]
struct ReconcileArgs {
    /// Portal name as stored on tender rows
    #[arg(long)]
    portal: String,

    /// Cancellation source tag
    #[arg(long, default_value = "cancelled_page")]
    source: String,

    /// Comma- or space-separated tender ids
    #[arg(long, num_args = 0..)]
    ids: Vec<String>,

    /// TXT/CSV file with tender ids
    #[arg(long = "ids-file")]
    ids_file: Option<PathBuf>,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    if let Err(err) = init_logging(cli.log.as_deref()) {
        eprintln!("failed to initialize logging: {err}");
        std::process::exit(2);
    }

    match run(cli).await {
        Ok(code) => std::process::exit(code),
        Err(err) => {
            log::error!("{err:#}");
            std::process::exit(1);
        }
    }
}

fn init_logging(log_path: Option<&Path>) -> Result<()> {
    let mut builder =
        env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"));
    if let Some(path) = log_path {
        let file = std::fs::File::create(path)
            .with_context(|| format!("Failed to open log file: {}", path.display()))?;
        builder.target(env_logger::Target::Pipe(Box::new(file)));
    }
    builder.init();
    Ok(())
}

async fn run(cli: Cli) -> Result<i32> {
    let job_id = cli
        .job_id
        .clone()
        .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
    info!("tenderscrape job {job_id} starting");

    let settings = AppSettings::load(&cli.settings)?;
    let portals = load_portal_list(&cli.base_urls);

    match &cli.command {
        Command::Department(args) => run_department(&cli, args, &settings, &portals, &job_id).await,
        Command::ReconcileCancelled(args) => run_reconcile(&cli, args, &settings).await,
        Command::Import(args) => run_import(&cli, args, &settings).await,
        Command::Watch => run_watch(&cli, settings, &portals).await,
    }
}

fn load_portal_list(csv_path: &Path) -> Vec<Portal> {
    match config::load_portals(csv_path) {
        Ok(portals) if !portals.is_empty() => portals,
        Ok(_) | Err(_) => {
            warn!(
                "Portal list {} missing or empty; using built-in fallback portal",
                csv_path.display()
            );
            vec![config::portals::fallback_portal()]
        }
    }
}

fn state_dir(cli: &Cli) -> PathBuf {
    cli.state_dir.clone().unwrap_or_else(|| {
        dirs::data_local_dir()
            .map(|dir| dir.join("tenderscrape"))
            .unwrap_or_else(|| PathBuf::from("data"))
    })
}

fn store_path(cli: &Cli, settings: &AppSettings) -> PathBuf {
    settings
        .central_sqlite_db_path
        .clone()
        .unwrap_or_else(|| state_dir(cli).join("tenders.sqlite3"))
}

async fn open_store(cli: &Cli, settings: &AppSettings) -> Result<TenderStore> {
    let db_path = store_path(cli, settings);
    let tender_store = TenderStore::open(&db_path).await?;

    let interrupted = tender_store.mark_interrupted_runs().await?;
    if interrupted > 0 {
        warn!("{interrupted} run(s) from a previous crash marked interrupted");
    }

    if let Some(backup_root) = &settings.sqlite_backup_directory {
        if let Err(err) =
            store::backup::ensure_daily_backup(&db_path, backup_root, settings.backup_retention_days())
                .await
        {
            warn!("Store backup failed: {err:#}");
        }
    }
    Ok(tender_store)
}

async fn run_department(
    cli: &Cli,
    args: &DepartmentArgs,
    settings: &AppSettings,
    portals: &[Portal],
    job_id: &str,
) -> Result<i32> {
    let portal_name = cli
        .url
        .as_deref()
        .context("--url <portal-name> is required for the department subcommand")?;
    let selection = resolve_selection(portals, &[portal_name.to_string()]);
    let portal = selection
        .first()
        .with_context(|| format!("portal '{portal_name}' not found in the portal list"))?
        .clone();

    if !args.all && args.names.is_empty() {
        anyhow::bail!("department: pass --all or an explicit list of department names");
    }
    if args.dept_workers > 1 {
        warn!(
            "--dept-workers {} requested; department listings are scraped sequentially",
            args.dept_workers
        );
    }

    let tender_store = open_store(cli, settings).await?;
    let fetcher: Arc<dyn PortalFetcher> = Arc::new(HttpPortalFetcher::new(&settings.timeouts)?);
    let bus = Arc::new(ScrapeEventBus::default());

    let printer = cli.json_events.then(|| spawn_json_event_printer(&bus));

    let selected_departments = resolve_department_selection(args, &portal, fetcher.as_ref()).await?;
    let scope = if selected_departments.is_some() {
        ScopeMode::Selected
    } else {
        ScopeMode::All
    };
    if let Some(departments) = &selected_departments {
        info!(
            "Job {job_id}: scraping {} selected department(s) on '{}'",
            departments.len(),
            portal.name
        );
    }

    let output_dir = cli
        .output
        .clone()
        .or_else(|| settings.download_directory.clone())
        .unwrap_or_else(|| PathBuf::from("Tender_Downloads"));

    let batch_config = BatchConfig {
        mode: BatchMode::Sequential,
        max_parallel: 1,
        only_new: args.only_new,
        delta_mode: settings.batch_delta_mode,
        ..BatchConfig::default()
    };

    let scheduler = BatchScheduler::new(
        tender_store.clone(),
        Arc::clone(&fetcher),
        Arc::clone(&bus),
        batch_config,
        output_dir,
        state_dir(cli),
    )
    .with_scope(scope)
    .with_department_selection(selected_departments);

    // Resume from a prior interrupted batch covering this portal, if any.
    let resume = checkpoint::Checkpointer::load(&scheduler.checkpoint_path())
        .filter(|data| data.remaining_portals.iter().any(|name| name == &portal.name));

    let stop = StopToken::new();
    let stop_for_signal = stop.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Stop requested; finishing at the next department boundary");
            stop_for_signal.set();
        }
    });

    let outcome = scheduler.run(vec![portal.clone()], stop, resume).await?;

    if let Some(printer) = printer {
        printer.abort();
    }

    let summary = outcome
        .summaries
        .get(&portal.name)
        .context("portal run produced no summary")?;
    info!(
        "Job {job_id} finished: {} (extracted={}, skipped={})",
        summary.status, summary.extracted_total_tenders, summary.skipped_existing_total
    );
    tender_store.close().await;

    Ok(if summary.is_error() { 1 } else { 0 })
}

/// Resolve the department subset: explicit names, or `--all` with an
/// optional substring filter applied against the live department list.
async fn resolve_department_selection(
    args: &DepartmentArgs,
    portal: &Portal,
    fetcher: &dyn PortalFetcher,
) -> Result<Option<Vec<String>>> {
    if !args.all {
        return Ok(Some(args.names.clone()));
    }
    let Some(filter) = &args.filter else {
        return Ok(None);
    };

    let needle = filter.trim().to_lowercase();
    let listing = fetcher
        .fetch_department_list(portal)
        .await
        .map_err(|err| anyhow::anyhow!("department list fetch failed: {err}"))?;
    let matching: Vec<String> = listing
        .departments
        .iter()
        .filter(|dept| dept.is_valid())
        .filter(|dept| dept.normalized_name().contains(&needle))
        .map(|dept| dept.name.clone())
        .collect();
    info!(
        "Department filter '{filter}' matched {} department(s)",
        matching.len()
    );
    Ok(Some(matching))
}

fn spawn_json_event_printer(bus: &Arc<ScrapeEventBus>) -> tokio::task::JoinHandle<()> {
    let mut receiver = bus.subscribe();
    tokio::spawn(async move {
        loop {
            match receiver.recv().await {
                Ok(event) => {
                    if let Ok(line) = serde_json::to_string(&event) {
                        println!("{line}");
                    }
                }
                Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => continue,
                Err(tokio::sync::broadcast::error::RecvError::Closed) => return,
            }
        }
    })
}

/// Refresh-watch daemon: the watcher ticks on its own timer and hands
/// change-triggered portals to a one-portal full-scope batch as soon as the
/// scheduler is idle. Watch rules, signature state, and history persist in
/// the settings file across restarts.
async fn run_watch(cli: &Cli, mut settings: AppSettings, portals: &[Portal]) -> Result<i32> {
    if settings.refresh_watch_portals.is_empty() {
        warn!("No refresh-watch rules configured in {}", cli.settings.display());
    }

    let tender_store = open_store(cli, &settings).await?;
    let fetcher: Arc<dyn PortalFetcher> = Arc::new(HttpPortalFetcher::new(&settings.timeouts)?);
    let bus = Arc::new(ScrapeEventBus::default());
    let printer = cli.json_events.then(|| spawn_json_event_printer(&bus));

    let (scrape_tx, mut scrape_rx) = tokio::sync::mpsc::unbounded_channel();
    let scheduler_busy = Arc::new(std::sync::atomic::AtomicBool::new(false));
    let watcher = Arc::new(RefreshWatcher::new(
        portals.to_vec(),
        Arc::clone(&fetcher),
        Arc::clone(&bus),
        settings.refresh_watch_portals.clone(),
        settings.refresh_watch_state.clone(),
        settings.refresh_watch_history.clone(),
        scrape_tx,
        Arc::clone(&scheduler_busy),
    ));

    let stop = StopToken::new();
    let stop_for_signal = stop.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Stop requested; shutting down refresh watch");
            stop_for_signal.set();
        }
    });

    let watcher_task = tokio::spawn(
        Arc::clone(&watcher).run(settings.watch_loop_seconds(), stop.clone()),
    );

    let output_dir = cli
        .output
        .clone()
        .or_else(|| settings.download_directory.clone())
        .unwrap_or_else(|| PathBuf::from("Tender_Downloads"));

    while !stop.is_set() {
        let request = tokio::select! {
            request = scrape_rx.recv() => match request {
                Some(request) => request,
                None => break,
            },
            () = wait_for_stop(&stop) => break,
        };

        let selection = resolve_selection(portals, &[request.portal.clone()]);
        let Some(portal) = selection.first().cloned() else {
            continue;
        };

        scheduler_busy.store(true, std::sync::atomic::Ordering::SeqCst);
        let batch_config = BatchConfig {
            mode: BatchMode::Sequential,
            max_parallel: 1,
            only_new: request.only_new,
            delta_mode: settings.batch_delta_mode,
            ..BatchConfig::default()
        };
        let scheduler = BatchScheduler::new(
            tender_store.clone(),
            Arc::clone(&fetcher),
            Arc::clone(&bus),
            batch_config,
            output_dir.clone(),
            state_dir(cli),
        )
        .with_scope(request.scope);
        if let Err(err) = scheduler.run(vec![portal], stop.clone(), None).await {
            warn!("Watch-triggered scrape failed for '{}': {err:#}", request.portal);
        }
        scheduler_busy.store(false, std::sync::atomic::Ordering::SeqCst);

        persist_watch_state(&watcher, &mut settings, &cli.settings);
    }

    stop.set();
    let _ = watcher_task.await;
    persist_watch_state(&watcher, &mut settings, &cli.settings);
    if let Some(printer) = printer {
        printer.abort();
    }
    tender_store.close().await;
    Ok(0)
}

async fn wait_for_stop(stop: &StopToken) {
    while !stop.is_set() {
        tokio::time::sleep(std::time::Duration::from_millis(200)).await;
    }
}

fn persist_watch_state(watcher: &RefreshWatcher, settings: &mut AppSettings, path: &Path) {
    let (rules, state, history) = watcher.snapshot();
    settings.refresh_watch_portals = rules;
    settings.refresh_watch_state = state;
    settings.refresh_watch_history = history;
    if let Err(err) = settings.save(path) {
        warn!("Failed to persist watch state: {err:#}");
    }
}

/// Import one export file, or sweep a directory for recent exports that
/// have not been imported yet.
async fn run_import(cli: &Cli, args: &ImportArgs, settings: &AppSettings) -> Result<i32> {
    let tender_store = open_store(cli, settings).await?;

    let candidates = match &args.file {
        Some(file) => vec![file.clone()],
        None => tenderscrape::ingest::collect_export_files(
            &args.source_dir,
            args.days,
            args.max_files,
        )?,
    };
    if candidates.is_empty() {
        println!("No recent export files found to import.");
        tender_store.close().await;
        return Ok(0);
    }

    let already_imported = tender_store.recorded_output_paths().await?;
    let mut imported_files = 0u32;
    let mut imported_rows = 0u64;
    let mut skipped_existing = 0u32;
    let mut failed = 0u32;

    // Oldest first so re-imports supersede in scrape order.
    for path in candidates.iter().rev() {
        let file_abs = path
            .canonicalize()
            .unwrap_or_else(|_| path.clone())
            .to_string_lossy()
            .to_string();
        if already_imported.contains(&file_abs) {
            skipped_existing += 1;
            continue;
        }
        match tenderscrape::ingest::import_export_file(
            &tender_store,
            path,
            args.portal.as_deref(),
        )
        .await
        {
            Ok(outcome) => {
                imported_files += 1;
                imported_rows += outcome.imported_rows;
                println!(
                    "Imported {:>4} rows from {} -> run_id={}",
                    outcome.imported_rows,
                    path.display(),
                    outcome.run_id
                );
            }
            Err(err) => {
                failed += 1;
                warn!("Skipped {}: {err:#}", path.display());
            }
        }
    }

    println!("--- Import Summary ---");
    println!("Imported files: {imported_files}");
    println!("Imported rows : {imported_rows}");
    println!("Skipped already-imported: {skipped_existing}");
    println!("Failed files : {failed}");
    tender_store.close().await;
    Ok(if imported_files == 0 && failed > 0 { 1 } else { 0 })
}

async fn run_reconcile(cli: &Cli, args: &ReconcileArgs, settings: &AppSettings) -> Result<i32> {
    let mut ids = parse_ids_inline(&args.ids);
    if let Some(path) = &args.ids_file {
        ids.extend(parse_ids_from_file(path)?);
    }
    if ids.is_empty() {
        anyhow::bail!("no tender ids provided; use --ids and/or --ids-file");
    }

    let tender_store = open_store(cli, settings).await?;
    let id_list: Vec<String> = ids.into_iter().collect();
    let updated = tender_store
        .mark_cancelled(&args.portal, &id_list, &args.source)
        .await?;
    println!(
        "Cancelled reconcile complete | portal={} | input_ids={} | updated_rows={updated}",
        args.portal,
        id_list.len()
    );
    tender_store.close().await;
    Ok(0)
}

fn parse_ids_inline(values: &[String]) -> BTreeSet<String> {
    values
        .iter()
        .flat_map(|item| item.split([',', '\n']))
        .flat_map(str::split_whitespace)
        .map(|token| token.trim().to_string())
        .filter(|token| !token.is_empty())
        .collect()
}

fn parse_ids_from_file(path: &Path) -> Result<BTreeSet<String>> {
    let extension = path
        .extension()
        .and_then(|e| e.to_str())
        .unwrap_or_default()
        .to_lowercase();
    let mut ids = BTreeSet::new();

    match extension.as_str() {
        "txt" | "log" => {
            let text = std::fs::read_to_string(path)
                .with_context(|| format!("Failed to read ids file: {}", path.display()))?;
            ids.extend(
                text.lines()
                    .map(str::trim)
                    .filter(|line| !line.is_empty())
                    .map(str::to_string),
            );
        }
        "csv" => {
            let mut reader = csv::Reader::from_path(path)
                .with_context(|| format!("Failed to read ids file: {}", path.display()))?;
            let headers = reader.headers()?.clone();
            let id_column = headers.iter().position(|h| {
                matches!(
                    h.trim().to_lowercase().as_str(),
                    "tender_id" | "tender id" | "tender_id_extracted"
                )
            });
            for record in reader.records() {
                let record = record?;
                match id_column {
                    Some(col) => {
                        if let Some(value) = record.get(col) {
                            let value = value.trim();
                            if !value.is_empty() {
                                ids.insert(value.to_string());
                            }
                        }
                    }
                    None => {
                        for cell in record.iter() {
                            let value = cell.trim();
                            if !value.is_empty() {
                                ids.insert(value.to_string());
                            }
                        }
                    }
                }
            }
        }
        other => anyhow::bail!("unsupported ids file extension: .{other}"),
    }
    Ok(ids)
}
