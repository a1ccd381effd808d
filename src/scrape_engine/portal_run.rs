//! Single-portal run: department iteration, row extraction, dedup against
//! the store, and crash-safe bookkeeping.
//!
//! One runner instance drives one portal to completion inside one batch. A
//! run makes up to two attempts: when the watchdog raises recovery (or the
//! pass dies on a session-shaped error), the fetch session is reinitialized
//! and the portal is retried once, with resume bookkeeping carrying over.
//! Department failures never abort a portal; only a stop request or a
//! persistent store conflict does.

use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::Arc;

use crate::config::Portal;
use crate::export;
use crate::fetch::{DepartmentInfo, FetchError, PortalFetcher, RawTenderRow};
use crate::scrape_events::{ScrapeEvent, ScrapeEventBus};
use crate::store::{RunOutcome, ScopeMode, StoreError, TenderRecord, TenderStore};
use crate::tender_id::{
    extract_tender_id_by_skill, is_valid_canonical_id, normalize_closing_date,
};

use super::domain_limiter::DomainLimiter;
use super::stop::{StopToken, sleep_with_stop};
use super::watchdog::{ActivityTracker, WatchdogConfig, spawn_watchdog};

pub const STATUS_COMPLETED: &str = "Scraping completed";
pub const STATUS_NO_DEPARTMENTS: &str = "No departments found";
pub const STATUS_ERROR: &str = "Error during scraping";
pub const STATUS_STOPPED: &str = "Stopped";

/// End-of-run summary for one portal.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PortalSummary {
    pub status: String,
    pub expected_total_tenders: u64,
    pub extracted_total_tenders: u64,
    pub skipped_existing_total: u64,
    pub processed_departments: usize,
    pub resume_skipped_departments: usize,
    pub processed_department_names: Vec<String>,
    pub extracted_tender_ids: Vec<String>,
    pub closing_date_reprocessed_total: u64,
    pub delta_sweep_extracted: u64,
    pub output_file_path: Option<String>,
    pub output_file_type: Option<String>,
    pub partial_saved: bool,
    pub errors: Vec<String>,
}

impl PortalSummary {
    #[must_use]
    pub fn is_error(&self) -> bool {
        self.status.to_lowercase().contains("error")
    }

    /// Short status for the run record.
    #[must_use]
    pub fn run_status(&self) -> &'static str {
        let status = self.status.to_lowercase();
        if status.contains("no departments") {
            "no departments found"
        } else if status.contains("error") {
            "error"
        } else if status.contains("stop") {
            "stopped"
        } else {
            "completed"
        }
    }
}

/// Per-run options supplied by the scheduler.
#[derive(Debug, Clone, Default)]
pub struct PortalRunOptions {
    pub scope: ScopeMode,
    pub only_new: bool,
    /// Run the quick second pass after a clean only-new run.
    pub delta_sweep: bool,
    /// Restrict the run to these department names (trimmed,
    /// case-insensitive). `None` means every valid department.
    pub selected_departments: Option<Vec<String>>,
    /// Lowercased names of departments already completed before a resume.
    pub resume_departments: HashSet<String>,
    pub watchdog: WatchdogConfig,
    /// Write the workbook/CSV export when the run produced rows.
    pub export_enabled: bool,
}

/// Drives one portal run to completion.
pub struct PortalRunner {
    portal: Portal,
    store: TenderStore,
    fetcher: Arc<dyn PortalFetcher>,
    limiter: Arc<DomainLimiter>,
    bus: Arc<ScrapeEventBus>,
    output_dir: PathBuf,
    options: PortalRunOptions,
}

struct PassOutput {
    summary: PortalSummary,
    recovery_worthy: bool,
}

impl PortalRunner {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        portal: Portal,
        store: TenderStore,
        fetcher: Arc<dyn PortalFetcher>,
        limiter: Arc<DomainLimiter>,
        bus: Arc<ScrapeEventBus>,
        output_dir: PathBuf,
        options: PortalRunOptions,
    ) -> Self {
        Self {
            portal,
            store,
            fetcher,
            limiter,
            bus,
            output_dir,
            options,
        }
    }

    /// Run the portal: up to two attempts with session recovery in between,
    /// an optional delta sweep, then export and atomic run finalization.
    pub async fn run(&self, stop: &StopToken) -> PortalSummary {
        let portal_name = self.portal.name.clone();
        let run_id = match self
            .store
            .start_run(&portal_name, &self.portal.base_url, self.options.scope)
            .await
        {
            Ok(run_id) => run_id,
            Err(err) => {
                let summary = error_summary(format!("could not create run record: {err}"));
                self.bus
                    .emit(ScrapeEvent::error(&portal_name, summary.errors[0].clone()));
                return summary;
            }
        };

        let mut summary: Option<PortalSummary> = None;
        let mut resume = self.options.resume_departments.clone();

        for attempt in 0..2u8 {
            if stop.is_set() {
                break;
            }

            let trigger = StopToken::new();
            let tracker = ActivityTracker::new();
            let composite = stop.child_with(&trigger);
            let watchdog = spawn_watchdog(
                portal_name.clone(),
                tracker.clone(),
                stop.clone(),
                trigger.clone(),
                self.options.watchdog,
            );

            let pass = self
                .run_pass(run_id, &composite, &tracker, &resume, true)
                .await;
            watchdog.finish().await;

            // Departments completed this attempt are not re-visited by the
            // recovery retry.
            resume.extend(pass.summary.processed_department_names.iter().cloned());
            let triggered = trigger.is_set();
            let recoverable = triggered || pass.recovery_worthy;
            let clean = !triggered && !pass.summary.is_error();
            summary = Some(merge_attempts(summary.take(), pass.summary));

            if clean {
                break;
            }
            if attempt == 0 && recoverable && !stop.is_set() {
                self.bus.emit(ScrapeEvent::log(
                    &portal_name,
                    "Watchdog/session recovery: retrying portal with a fresh fetch session",
                ));
                if let Err(err) = self.fetcher.reinitialize().await {
                    warn!("Fetch session reinitialize failed for {portal_name}: {err}");
                }
                trigger.clear();
                continue;
            }
            break;
        }

        let mut summary = summary.unwrap_or_else(|| {
            let mut stopped = PortalSummary::default();
            stopped.status = STATUS_STOPPED.to_string();
            stopped.partial_saved = true;
            stopped
        });

        if self.options.delta_sweep
            && self.options.only_new
            && !stop.is_set()
            && !summary.is_error()
            && summary.status != STATUS_NO_DEPARTMENTS
        {
            self.bus.emit(ScrapeEvent::log(
                &portal_name,
                "Starting optional final delta sweep (quick second pass)",
            ));
            let trigger = StopToken::new();
            let tracker = ActivityTracker::new();
            let composite = stop.child_with(&trigger);
            let watchdog = spawn_watchdog(
                portal_name.clone(),
                tracker.clone(),
                stop.clone(),
                trigger.clone(),
                self.options.watchdog,
            );
            let sweep = self
                .run_pass(run_id, &composite, &tracker, &HashSet::new(), false)
                .await;
            watchdog.finish().await;
            summary = merge_delta_sweep(summary, sweep.summary);
            self.bus.emit(ScrapeEvent::log(
                &portal_name,
                format!("Delta sweep extracted: {}", summary.delta_sweep_extracted),
            ));
        }

        if self.options.export_enabled {
            self.export_run(run_id, &mut summary).await;
        }

        let outcome = RunOutcome {
            status: summary.run_status().to_string(),
            expected_total: summary.expected_total_tenders,
            extracted_total: summary.extracted_total_tenders,
            skipped_existing_total: summary.skipped_existing_total,
            partial_saved: summary.partial_saved,
            output_file_path: summary.output_file_path.clone(),
            output_file_type: summary.output_file_type.clone(),
        };
        if let Err(err) = self.store.finalize_run(run_id, &outcome).await {
            warn!("Failed to finalize run {run_id} for {portal_name}: {err}");
            summary.errors.push(format!("finalize failed: {err}"));
        }

        let gap = summary
            .expected_total_tenders
            .saturating_sub(summary.extracted_total_tenders)
            .saturating_sub(summary.skipped_existing_total);
        self.bus.emit(ScrapeEvent::log(
            &portal_name,
            format!(
                "Verification summary -> expected={}, extracted={}, skipped_known={}, remaining_gap={gap}",
                summary.expected_total_tenders,
                summary.extracted_total_tenders,
                summary.skipped_existing_total
            ),
        ));
        self.bus
            .emit(ScrapeEvent::completed(&portal_name, summary.clone()));
        summary
    }

    async fn export_run(&self, run_id: i64, summary: &mut PortalSummary) {
        match export::export_run(
            &self.store,
            run_id,
            &self.output_dir,
            &self.portal.keyword,
            summary.partial_saved,
        )
        .await
        {
            Ok(Some((path, kind))) => {
                let save_kind = if summary.partial_saved { "PARTIAL" } else { "FINAL" };
                self.bus.emit(ScrapeEvent::log(
                    &self.portal.name,
                    format!("{save_kind} output saved: {}", path.display()),
                ));
                summary.output_file_path = Some(path.to_string_lossy().to_string());
                summary.output_file_type = Some(kind.as_str().to_string());
            }
            Ok(None) => {
                debug!("Run {run_id} produced no rows; no export written");
            }
            Err(err) => {
                warn!("Export failed for run {run_id}: {err}");
                summary.errors.push(format!("export failed: {err}"));
            }
        }
    }

    /// One pass over the portal's departments.
    async fn run_pass(
        &self,
        run_id: i64,
        stop: &StopToken,
        tracker: &ActivityTracker,
        resume_departments: &HashSet<String>,
        resume_enabled: bool,
    ) -> PassOutput {
        let portal_name = self.portal.name.clone();
        let skill = self.portal.skill();

        self.bus
            .emit(ScrapeEvent::status(&portal_name, "Fetching departments..."));

        let listing = match self.fetcher.fetch_department_list(&self.portal).await {
            Ok(listing) => listing,
            Err(err) => {
                let message = format!("department list fetch failed: {err}");
                self.bus.emit(ScrapeEvent::error(&portal_name, &message));
                return PassOutput {
                    summary: error_summary(message),
                    recovery_worthy: err.needs_recovery(),
                };
            }
        };
        tracker.touch();

        let mut valid: Vec<DepartmentInfo> = listing
            .departments
            .into_iter()
            .filter(DepartmentInfo::is_valid)
            .collect();
        if valid.is_empty() {
            self.bus
                .emit(ScrapeEvent::log(&portal_name, "No departments found."));
            let mut summary = PortalSummary::default();
            summary.status = STATUS_NO_DEPARTMENTS.to_string();
            return PassOutput {
                summary,
                recovery_worthy: false,
            };
        }

        let expected_total: u64 = valid.iter().filter_map(DepartmentInfo::advertised_count).sum();
        if let Some(selected) = &self.options.selected_departments {
            let wanted: HashSet<String> =
                selected.iter().map(|name| name.trim().to_lowercase()).collect();
            valid.retain(|dept| wanted.contains(&dept.normalized_name()));
        }

        self.bus.emit(ScrapeEvent::departments_loaded(
            &portal_name,
            valid.len(),
            expected_total,
        ));
        info!(
            "{portal_name}: {} valid department(s), expected {} tender(s)",
            valid.len(),
            expected_total
        );

        let (known_ids, snapshot) = if self.options.only_new {
            let ids = self
                .store
                .existing_tender_ids_for_portal(&portal_name)
                .await
                .unwrap_or_default();
            let snapshot = self
                .store
                .existing_tender_snapshot_for_portal(&portal_name)
                .await
                .unwrap_or_default();
            info!("{portal_name}: {} known tender id(s) for new-only filtering", ids.len());
            (ids, snapshot)
        } else {
            Default::default()
        };
        if !resume_enabled && self.options.only_new {
            self.bus.emit(ScrapeEvent::log(
                &portal_name,
                "Delta sweep: re-checking all departments with tender-id de-duplication.",
            ));
        }

        let mut summary = PortalSummary {
            status: STATUS_COMPLETED.to_string(),
            expected_total_tenders: expected_total,
            ..PortalSummary::default()
        };
        let mut seen_this_run: HashSet<String> = HashSet::new();
        let total_depts = valid.len();

        for (idx, dept) in valid.iter().enumerate() {
            if stop.is_set() {
                summary.status = STATUS_STOPPED.to_string();
                summary.partial_saved = true;
                break;
            }
            if resume_enabled && resume_departments.contains(&dept.normalized_name()) {
                summary.resume_skipped_departments += 1;
                continue;
            }

            if !sleep_with_stop(self.limiter.jitter_delay(), stop).await {
                summary.status = STATUS_STOPPED.to_string();
                summary.partial_saved = true;
                break;
            }

            let rows = match self.fetch_rows_with_recovery(dept, stop, tracker).await {
                Ok(rows) => rows,
                Err(err) => {
                    let message = format!("department '{}' failed: {err}", dept.name);
                    warn!("{portal_name}: {message}");
                    summary.errors.push(message.clone());
                    self.bus.emit(ScrapeEvent::error(&portal_name, message));
                    continue;
                }
            };
            tracker.touch();

            let mut skipped_ids = Vec::new();
            let batch = self.build_batch(
                dept,
                &rows,
                skill,
                &known_ids,
                &snapshot,
                &mut seen_this_run,
                &mut skipped_ids,
                &mut summary,
            );

            let mut dept_counters = crate::store::UpsertCounters::default();
            if !batch.is_empty() {
                match self
                    .store
                    .upsert_current_tenders(&portal_name, run_id, &batch)
                    .await
                {
                    Ok(counters) => {
                        dept_counters = counters;
                        summary.extracted_total_tenders += batch.len() as u64;
                        summary.closing_date_reprocessed_total += counters.updated_closing_date;
                    }
                    Err(err @ StoreError::Conflict(_)) => {
                        let message = format!("store conflict persisted: {err}");
                        summary.errors.push(message.clone());
                        self.bus.emit(ScrapeEvent::error(&portal_name, message));
                        summary.status = STATUS_ERROR.to_string();
                        summary.partial_saved = true;
                        break;
                    }
                    Err(err) => {
                        let message = format!("store write failed: {err}");
                        summary.errors.push(message.clone());
                        self.bus.emit(ScrapeEvent::error(&portal_name, message));
                        summary.status = STATUS_ERROR.to_string();
                        summary.partial_saved = true;
                        break;
                    }
                }
            }

            if !skipped_ids.is_empty() {
                // A skipped row is still a sighting.
                if let Err(err) = self.store.touch_last_seen(&portal_name, &skipped_ids).await {
                    warn!("{portal_name}: last-seen touch failed: {err}");
                }
            }

            summary.processed_departments += 1;
            summary.processed_department_names.push(dept.normalized_name());
            self.bus.emit(ScrapeEvent::department_completed(
                &portal_name,
                &dept.name,
                dept_counters.inserted_new,
                dept_counters.updated_closing_date,
                dept_counters.unchanged,
                summary.skipped_existing_total,
            ));
            self.bus.emit(ScrapeEvent::progress(
                &portal_name,
                idx + 1,
                total_depts,
                summary.extracted_total_tenders,
                expected_total,
                total_depts.saturating_sub(idx + 1),
                &dept.name,
            ));
            tracker.touch();
        }

        PassOutput {
            summary,
            recovery_worthy: false,
        }
    }

    /// Fetch one department's rows with a single session-recovery retry.
    async fn fetch_rows_with_recovery(
        &self,
        dept: &DepartmentInfo,
        stop: &StopToken,
        tracker: &ActivityTracker,
    ) -> Result<Vec<RawTenderRow>, FetchError> {
        match self.fetcher.fetch_department_rows(&self.portal, dept).await {
            Ok(rows) => Ok(rows),
            Err(err) if err.needs_recovery() && !stop.is_set() => {
                self.bus.emit(ScrapeEvent::log(
                    &self.portal.name,
                    format!("Session recovery for department '{}': {err}", dept.name),
                ));
                self.fetcher.reinitialize().await?;
                tracker.touch();
                self.fetcher.fetch_department_rows(&self.portal, dept).await
            }
            Err(err) => Err(err),
        }
    }

    /// Canonicalize rows and apply the fast-path dedup filter.
    #[allow(clippy::too_many_arguments)]
    fn build_batch(
        &self,
        dept: &DepartmentInfo,
        rows: &[RawTenderRow],
        skill: crate::tender_id::PortalSkill,
        known_ids: &HashSet<String>,
        snapshot: &std::collections::HashMap<String, String>,
        seen_this_run: &mut HashSet<String>,
        skipped_ids: &mut Vec<String>,
        summary: &mut PortalSummary,
    ) -> Vec<TenderRecord> {
        let mut batch = Vec::new();
        for row in rows {
            let id = extract_tender_id_by_skill(&row.title_ref, skill);
            if !is_valid_canonical_id(&id) {
                debug!(
                    "Dropping row with no extractable tender id on '{}': {}",
                    dept.name,
                    row.title_ref.chars().take(80).collect::<String>()
                );
                continue;
            }
            if !seen_this_run.insert(id.clone()) {
                continue;
            }
            if known_ids.contains(&id) {
                let unchanged = snapshot
                    .get(&id)
                    .map(|existing| {
                        normalize_closing_date(existing) == normalize_closing_date(&row.closing_date)
                    })
                    .unwrap_or(false);
                if unchanged {
                    summary.skipped_existing_total += 1;
                    skipped_ids.push(id);
                    continue;
                }
            }
            summary.extracted_tender_ids.push(id.clone());
            batch.push(TenderRecord {
                portal_name: self.portal.name.clone(),
                department_name: dept.name.clone(),
                tender_id: id,
                published_date: row.published_date.clone(),
                closing_date: row.closing_date.clone(),
                opening_date: row.opening_date.clone(),
                title_ref: row.title_ref.clone(),
                organisation_chain: row.organisation_chain.clone(),
                direct_url: row.direct_url.clone(),
                status_url: row.status_url.clone(),
                emd_amount: String::new(),
                emd_amount_numeric: None,
            });
        }
        batch
    }
}

fn error_summary(message: String) -> PortalSummary {
    PortalSummary {
        status: STATUS_ERROR.to_string(),
        errors: vec![message],
        ..PortalSummary::default()
    }
}

/// Fold a retry attempt into the accumulated summary: counters add, name and
/// id sets union, errors accumulate. The latest attempt decides the status,
/// so a clean recovery retry clears the first attempt's error.
fn merge_attempts(first: Option<PortalSummary>, second: PortalSummary) -> PortalSummary {
    let Some(first) = first else {
        return second;
    };
    let status = second.status.clone();
    let mut merged = combine(first, second);
    merged.status = status;
    merged
}

/// Fold the delta sweep into the main summary per the portal report
/// contract: counters add, the sweep's extraction count is recorded
/// separately, and an error in either pass marks the run.
fn merge_delta_sweep(first: PortalSummary, delta: PortalSummary) -> PortalSummary {
    let delta_extracted = delta.extracted_total_tenders;
    let status = if first.is_error() || delta.is_error() {
        STATUS_ERROR.to_string()
    } else {
        first.status.clone()
    };
    let mut merged = combine(first, delta);
    merged.status = status;
    merged.delta_sweep_extracted = delta_extracted;
    merged
}

fn combine(first: PortalSummary, second: PortalSummary) -> PortalSummary {
    let mut names: Vec<String> = first
        .processed_department_names
        .iter()
        .chain(second.processed_department_names.iter())
        .cloned()
        .collect();
    names.sort();
    names.dedup();

    let mut ids: Vec<String> = first
        .extracted_tender_ids
        .iter()
        .chain(second.extracted_tender_ids.iter())
        .cloned()
        .collect();
    ids.sort();
    ids.dedup();

    let status = second.status.clone();

    let mut errors = first.errors;
    errors.extend(second.errors);

    PortalSummary {
        status,
        expected_total_tenders: first.expected_total_tenders.max(second.expected_total_tenders),
        extracted_total_tenders: first.extracted_total_tenders + second.extracted_total_tenders,
        skipped_existing_total: first.skipped_existing_total + second.skipped_existing_total,
        processed_departments: first.processed_departments + second.processed_departments,
        resume_skipped_departments: first.resume_skipped_departments
            + second.resume_skipped_departments,
        processed_department_names: names,
        extracted_tender_ids: ids,
        closing_date_reprocessed_total: first.closing_date_reprocessed_total
            + second.closing_date_reprocessed_total,
        delta_sweep_extracted: first.delta_sweep_extracted + second.delta_sweep_extracted,
        output_file_path: second.output_file_path.or(first.output_file_path),
        output_file_type: second.output_file_type.or(first.output_file_type),
        partial_saved: first.partial_saved || second.partial_saved,
        errors,
    }
}
