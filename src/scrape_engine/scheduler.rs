//! Batch scheduler: dispatches portal runs sequentially or through a
//! bounded worker pool.
//!
//! The scheduler is the only spawner. Workers draw portals from a FIFO
//! queue, hold a per-domain slot for the lifetime of their run, and report
//! completions back over a channel; the scheduler alone writes checkpoints
//! and reports. A stop request prevents new portal starts, while in-flight
//! portals wind down at department boundaries with a partial save.

use anyhow::Result;
use log::{info, warn};
use std::collections::{BTreeMap, VecDeque};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::{Mutex, mpsc};
use tokio::task::JoinSet;

use crate::checkpoint::{CheckpointData, CheckpointTotals, Checkpointer};
use crate::config::{BatchConfig, BatchMode, DeltaMode, Portal};
use crate::fetch::PortalFetcher;
use crate::scrape_events::{ScrapeEvent, ScrapeEventBus};
use crate::store::{ScopeMode, TenderStore};

use super::domain_limiter::DomainLimiter;
use super::portal_run::{PortalRunOptions, PortalRunner, PortalSummary};
use super::report::{RunReport, prepare_report_dir, write_portal_report};
use super::stop::{StopToken, sleep_with_stop};
use super::watchdog::WatchdogConfig;

/// Upper bound on parallel workers regardless of configuration.
fn worker_hard_cap() -> usize {
    num_cpus::get().clamp(2, 8)
}

/// End-of-batch aggregate.
#[derive(Debug, Default)]
pub struct BatchOutcome {
    pub summaries: BTreeMap<String, PortalSummary>,
    pub totals: CheckpointTotals,
    pub report_dir: PathBuf,
    pub stopped: bool,
}

/// Dispatches a batch of portal runs.
pub struct BatchScheduler {
    store: TenderStore,
    fetcher: Arc<dyn PortalFetcher>,
    bus: Arc<ScrapeEventBus>,
    config: BatchConfig,
    download_dir: PathBuf,
    state_dir: PathBuf,
    watchdog: WatchdogConfig,
    scope: ScopeMode,
    selected_departments: Option<Vec<String>>,
}

impl BatchScheduler {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        store: TenderStore,
        fetcher: Arc<dyn PortalFetcher>,
        bus: Arc<ScrapeEventBus>,
        config: BatchConfig,
        download_dir: PathBuf,
        state_dir: PathBuf,
    ) -> Self {
        Self {
            store,
            fetcher,
            bus,
            config: config.clamped(),
            download_dir,
            state_dir,
            watchdog: WatchdogConfig::default(),
            scope: ScopeMode::All,
            selected_departments: None,
        }
    }

    /// Override the scope recorded on run records (the refresh watcher uses
    /// `watch-triggered`).
    #[must_use]
    pub fn with_scope(mut self, scope: ScopeMode) -> Self {
        self.scope = scope;
        self
    }

    /// Restrict every portal run in this batch to the given department
    /// names (the CLI department subcommand uses this).
    #[must_use]
    pub fn with_department_selection(mut self, departments: Option<Vec<String>>) -> Self {
        self.selected_departments = departments;
        self
    }

    /// Checkpoint file location for this installation.
    #[must_use]
    pub fn checkpoint_path(&self) -> PathBuf {
        self.state_dir.join("checkpoints").join("batch_checkpoint.json")
    }

    /// Run the batch over `portals`. A checkpoint from a previous
    /// interrupted batch may be supplied to resume: its remaining portals
    /// should be the selection, and per-portal completed departments are
    /// honored.
    pub async fn run(
        &self,
        portals: Vec<Portal>,
        stop: StopToken,
        resume: Option<CheckpointData>,
    ) -> Result<BatchOutcome> {
        let names: Vec<String> = portals.iter().map(|p| p.name.clone()).collect();
        let worker_count = match self.config.mode {
            BatchMode::Sequential => 1,
            BatchMode::Parallel => self
                .config
                .max_parallel
                .min(portals.len().max(1))
                .min(worker_hard_cap()),
        };
        let worker_names: Vec<String> =
            (1..=worker_count).map(|n| format!("worker-{n}")).collect();

        let checkpointer = Arc::new(Checkpointer::begin_batch(
            self.checkpoint_path(),
            &names,
            worker_count,
            worker_names,
            resume.as_ref(),
        ));
        let report_dir = prepare_report_dir(&self.state_dir)?;
        let limiter = Arc::new(DomainLimiter::new(self.config.ip_safety.clone()));

        let pump_done = StopToken::new();
        let pump = self.spawn_checkpoint_pump(Arc::clone(&checkpointer), pump_done.clone());

        let mut outcome = BatchOutcome {
            report_dir: report_dir.clone(),
            ..BatchOutcome::default()
        };

        let resume_ref = resume.as_ref();
        match self.config.mode {
            BatchMode::Sequential => {
                self.run_sequential(
                    &portals,
                    &stop,
                    &limiter,
                    &checkpointer,
                    &report_dir,
                    resume_ref,
                    &mut outcome,
                )
                .await;
            }
            BatchMode::Parallel => {
                self.run_parallel(
                    portals,
                    worker_count,
                    &stop,
                    &limiter,
                    &checkpointer,
                    &report_dir,
                    resume_ref,
                    &mut outcome,
                )
                .await;
            }
        }

        pump_done.set();
        let _ = pump.await;

        outcome.totals = checkpointer.totals();
        outcome.stopped = stop.is_set();
        checkpointer.finish_batch()?;

        self.bus.emit(ScrapeEvent::status("", "Batch scraping completed"));
        info!(
            "Batch finished: {} portal(s), {} tender(s), stopped={}",
            outcome.summaries.len(),
            outcome.totals.tenders,
            outcome.stopped
        );
        Ok(outcome)
    }

    #[allow(clippy::too_many_arguments)]
    async fn run_sequential(
        &self,
        portals: &[Portal],
        stop: &StopToken,
        limiter: &Arc<DomainLimiter>,
        checkpointer: &Arc<Checkpointer>,
        report_dir: &PathBuf,
        resume: Option<&CheckpointData>,
        outcome: &mut BatchOutcome,
    ) {
        let total = portals.len();
        for (idx, portal) in portals.iter().enumerate() {
            if stop.is_set() {
                self.bus.emit(ScrapeEvent::log(
                    "",
                    "Batch stop requested. Ending remaining portals.",
                ));
                break;
            }
            if idx > 0 {
                let delay = limiter.jitter_delay();
                self.bus.emit(ScrapeEvent::log(
                    &portal.name,
                    format!(
                        "Sequential IP safety delay: sleeping {:.1}s before next portal",
                        delay.as_secs_f64()
                    ),
                ));
                if !sleep_with_stop(delay, stop).await {
                    break;
                }
            }

            self.bus.emit(ScrapeEvent::log(
                &portal.name,
                format!("BATCH PORTAL {}/{total} START", idx + 1),
            ));
            let started_at = chrono::Local::now();
            let summary = self
                .run_one_portal(portal.clone(), stop.clone(), Arc::clone(limiter), resume)
                .await;
            self.record_completion(portal, summary, started_at, checkpointer, report_dir, outcome);
        }
    }

    #[allow(clippy::too_many_arguments)]
    async fn run_parallel(
        &self,
        portals: Vec<Portal>,
        worker_count: usize,
        stop: &StopToken,
        limiter: &Arc<DomainLimiter>,
        checkpointer: &Arc<Checkpointer>,
        report_dir: &PathBuf,
        resume: Option<&CheckpointData>,
        outcome: &mut BatchOutcome,
    ) {
        let queue: Arc<Mutex<VecDeque<Portal>>> = Arc::new(Mutex::new(portals.into_iter().collect()));
        let (done_tx, mut done_rx) =
            mpsc::unbounded_channel::<(Portal, PortalSummary, chrono::DateTime<chrono::Local>)>();
        let mut workers = JoinSet::new();

        for worker_id in 0..worker_count {
            let queue = Arc::clone(&queue);
            let done_tx = done_tx.clone();
            let stop = stop.clone();
            let limiter = Arc::clone(limiter);
            let scheduler = self.clone_for_worker();
            let resume = resume.cloned();

            workers.spawn(async move {
                loop {
                    if stop.is_set() {
                        return;
                    }
                    let Some(portal) = queue.lock().await.pop_front() else {
                        return;
                    };
                    let started_at = chrono::Local::now();
                    let summary = scheduler
                        .run_portal_with_politeness(
                            portal.clone(),
                            &stop,
                            &limiter,
                            resume.as_ref(),
                            worker_id,
                        )
                        .await;
                    if done_tx.send((portal, summary, started_at)).is_err() {
                        return;
                    }
                }
            });
        }
        drop(done_tx);

        // Single writer: completions are serialized here.
        while let Some((portal, summary, started_at)) = done_rx.recv().await {
            self.record_completion(&portal, summary, started_at, checkpointer, report_dir, outcome);
        }
        while workers.join_next().await.is_some() {}
    }

    fn clone_for_worker(&self) -> Self {
        Self {
            store: self.store.clone(),
            fetcher: Arc::clone(&self.fetcher),
            bus: Arc::clone(&self.bus),
            config: self.config.clone(),
            download_dir: self.download_dir.clone(),
            state_dir: self.state_dir.clone(),
            watchdog: self.watchdog,
            scope: self.scope,
            selected_departments: self.selected_departments.clone(),
        }
    }

    /// Parallel-mode portal execution: domain slot, IP-safety delay,
    /// probable-block retries, cooldown on release.
    async fn run_portal_with_politeness(
        &self,
        portal: Portal,
        stop: &StopToken,
        limiter: &Arc<DomainLimiter>,
        resume: Option<&CheckpointData>,
        worker_id: usize,
    ) -> PortalSummary {
        let domain = portal.domain();
        self.bus.emit(ScrapeEvent::log(
            &portal.name,
            format!("worker-{} waiting for domain slot (domain={domain})", worker_id + 1),
        ));
        let Some(slot) = limiter.acquire(&domain, stop).await else {
            let mut summary = PortalSummary::default();
            summary.status = super::portal_run::STATUS_STOPPED.to_string();
            summary.partial_saved = true;
            return summary;
        };

        let mut summary = PortalSummary::default();
        let mut carried_errors: Vec<String> = Vec::new();
        let max_retries = limiter.max_retries();
        for attempt in 0..=max_retries {
            if stop.is_set() {
                summary.status = super::portal_run::STATUS_STOPPED.to_string();
                summary.partial_saved = true;
                break;
            }

            summary = self
                .run_one_portal(portal.clone(), stop.clone(), Arc::clone(limiter), resume)
                .await;
            if !carried_errors.is_empty() {
                let mut errors = carried_errors.clone();
                errors.extend(summary.errors.drain(..));
                summary.errors = errors;
            }

            let block_text = summary.errors.join(" | ");
            if summary.is_error() && attempt < max_retries && limiter.is_probable_block(&block_text)
            {
                let backoff = limiter.backoff_delay(attempt);
                self.bus.emit(ScrapeEvent::log(
                    &portal.name,
                    format!(
                        "probable IP/rate block detected; retrying after {}s (attempt {}/{})",
                        backoff.as_secs(),
                        attempt + 1,
                        max_retries + 1
                    ),
                ));
                if !sleep_with_stop(backoff, stop).await {
                    break;
                }
                carried_errors = summary.errors.clone();
                continue;
            }
            break;
        }

        slot.release(stop).await;
        summary
    }

    async fn run_one_portal(
        &self,
        portal: Portal,
        stop: StopToken,
        limiter: Arc<DomainLimiter>,
        resume: Option<&CheckpointData>,
    ) -> PortalSummary {
        let resume_departments = if self.config.only_new {
            resume
                .map(|data| data.processed_departments_for(&portal.name))
                .unwrap_or_default()
        } else {
            Default::default()
        };

        let options = PortalRunOptions {
            scope: self.scope,
            only_new: self.config.only_new,
            delta_sweep: self.config.delta_mode == DeltaMode::Quick,
            selected_departments: self.selected_departments.clone(),
            resume_departments,
            watchdog: self.watchdog,
            export_enabled: true,
        };
        let runner = PortalRunner::new(
            portal,
            self.store.clone(),
            Arc::clone(&self.fetcher),
            limiter,
            Arc::clone(&self.bus),
            self.download_dir.clone(),
            options,
        );
        runner.run(&stop).await
    }

    fn record_completion(
        &self,
        portal: &Portal,
        summary: PortalSummary,
        started_at: chrono::DateTime<chrono::Local>,
        checkpointer: &Arc<Checkpointer>,
        report_dir: &PathBuf,
        outcome: &mut BatchOutcome,
    ) {
        if let Err(err) = checkpointer.note_portal_completed(&portal.name, &summary) {
            // Checkpoint IO failures never fail the run; the next event
            // retries the write.
            warn!("Checkpoint write failed after '{}': {err}", portal.name);
        }

        let report = RunReport::from_summary(
            &portal.name,
            &summary,
            started_at,
            chrono::Local::now(),
            self.config.delta_mode == DeltaMode::Quick && self.config.only_new,
        );
        match write_portal_report(report_dir, &report) {
            Ok((json_path, _)) => {
                self.bus.emit(ScrapeEvent::log(
                    &portal.name,
                    format!("Run report saved: {}", json_path.display()),
                ));
            }
            Err(err) => warn!("Report write failed for '{}': {err}", portal.name),
        }

        outcome.summaries.insert(portal.name.clone(), summary);
    }

    /// Pump department-completion and progress events into the checkpoint.
    fn spawn_checkpoint_pump(
        &self,
        checkpointer: Arc<Checkpointer>,
        done: StopToken,
    ) -> tokio::task::JoinHandle<()> {
        let mut receiver = self.bus.subscribe();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    event = receiver.recv() => match event {
                        Ok(ScrapeEvent::DepartmentCompleted { portal, department, .. }) => {
                            if let Err(err) =
                                checkpointer.note_department_completed(&portal, &department)
                            {
                                warn!("Checkpoint department write failed: {err}");
                            }
                        }
                        Ok(ScrapeEvent::Progress {
                            portal,
                            dept_current,
                            dept_total,
                            extracted,
                            expected,
                            ..
                        }) => {
                            if let Err(err) = checkpointer.note_progress(
                                &portal,
                                dept_current,
                                dept_total,
                                extracted,
                                expected,
                            ) {
                                warn!("Checkpoint progress write failed: {err}");
                            }
                        }
                        Ok(_) => {}
                        Err(tokio::sync::broadcast::error::RecvError::Lagged(missed)) => {
                            warn!("Checkpoint pump lagged; {missed} event(s) skipped");
                        }
                        Err(tokio::sync::broadcast::error::RecvError::Closed) => return,
                    },
                    () = wait_for(&done) => return,
                }
            }
        })
    }
}

async fn wait_for(token: &StopToken) {
    while !token.is_set() {
        tokio::time::sleep(std::time::Duration::from_millis(100)).await;
    }
}

/// Resolve selected portal names against the configured portal list,
/// preserving selection order and warning on unknown names.
#[must_use]
pub fn resolve_selection(portals: &[Portal], selected: &[String]) -> Vec<Portal> {
    let mut resolved = Vec::new();
    for name in selected {
        match crate::config::portal_by_name(portals, name) {
            Some(portal) => resolved.push(portal.clone()),
            None => warn!("Portal '{name}' not found in configuration; skipping"),
        }
    }
    resolved
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Portal;

    #[test]
    fn test_resolve_selection_preserves_order_and_skips_unknown() {
        let portals = vec![
            Portal::new("Alpha", "https://alpha.gov.in/app").expect("portal"),
            Portal::new("Beta", "https://beta.gov.in/app").expect("portal"),
        ];
        let resolved = resolve_selection(
            &portals,
            &[
                "beta".to_string(),
                "Missing".to_string(),
                " ALPHA ".to_string(),
            ],
        );
        let names: Vec<&str> = resolved.iter().map(|p| p.name.as_str()).collect();
        assert_eq!(names, vec!["Beta", "Alpha"]);
    }

    #[test]
    fn test_worker_hard_cap_bounds() {
        let cap = worker_hard_cap();
        assert!((2..=8).contains(&cap));
    }
}
