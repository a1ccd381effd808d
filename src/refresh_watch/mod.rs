//! Refresh Watch: periodic department-listing signature checks that trigger
//! a full scrape when a watched portal changes.
//!
//! The watcher runs on its own timer and never scrapes while the scheduler
//! is busy. A detected change queues the portal; pending portals drain one
//! per tick once the scheduler goes idle, as full-scope scrape requests.
//! Rules, per-portal signature state, and the event history ring are
//! persisted through the settings file by the caller.

pub mod signature;

use anyhow::{Context, Result};
use log::{info, warn};
use parking_lot::Mutex;
use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::mpsc;

use crate::config::settings::{WatchEvent, WatchPortalState, WatchRule};
use crate::config::{Portal, portal_by_name};
use crate::fetch::PortalFetcher;
use crate::scrape_events::{ScrapeEvent, ScrapeEventBus};
use crate::scrape_engine::stop::{StopToken, sleep_with_stop};
use crate::store::ScopeMode;

pub use signature::compute_department_signature;

/// Events kept in the history ring buffer.
pub const HISTORY_LIMIT: usize = 50;

/// Floor on a rule's check interval.
const MIN_INTERVAL_SECS: i64 = 60;

/// A scrape request queued for the scheduler.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScrapeRequest {
    pub portal: String,
    pub only_new: bool,
    pub scope: ScopeMode,
}

struct WatcherState {
    rules: BTreeMap<String, WatchRule>,
    portal_state: BTreeMap<String, WatchPortalState>,
    history: VecDeque<WatchEvent>,
    pending: BTreeSet<String>,
}

/// The Refresh Watch daemon.
pub struct RefreshWatcher {
    portals: Vec<Portal>,
    fetcher: Arc<dyn PortalFetcher>,
    bus: Arc<ScrapeEventBus>,
    state: Mutex<WatcherState>,
    scrape_tx: mpsc::UnboundedSender<ScrapeRequest>,
    scheduler_busy: Arc<AtomicBool>,
}

impl RefreshWatcher {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        portals: Vec<Portal>,
        fetcher: Arc<dyn PortalFetcher>,
        bus: Arc<ScrapeEventBus>,
        rules: Vec<WatchRule>,
        prior_state: BTreeMap<String, WatchPortalState>,
        prior_history: Vec<WatchEvent>,
        scrape_tx: mpsc::UnboundedSender<ScrapeRequest>,
        scheduler_busy: Arc<AtomicBool>,
    ) -> Self {
        let mut history: VecDeque<WatchEvent> = prior_history.into();
        while history.len() > HISTORY_LIMIT {
            history.pop_front();
        }
        Self {
            portals,
            fetcher,
            bus,
            state: Mutex::new(WatcherState {
                rules: rules.into_iter().map(|r| (r.portal.clone(), r)).collect(),
                portal_state: prior_state,
                history,
                pending: BTreeSet::new(),
            }),
            scrape_tx,
            scheduler_busy,
        }
    }

    /// Watch loop: tick then sleep, until stopped.
    pub async fn run(self: Arc<Self>, loop_seconds: u64, stop: StopToken) {
        let period = std::time::Duration::from_secs(loop_seconds.max(5));
        info!("Refresh watch started (every {}s)", period.as_secs());
        while !stop.is_set() {
            self.tick().await;
            if !sleep_with_stop(period, &stop).await {
                break;
            }
        }
        info!("Refresh watch stopped");
    }

    /// One watcher iteration: drain one pending portal if the scheduler is
    /// idle, then run every rule that is due.
    pub async fn tick(&self) {
        let idle = !self.scheduler_busy.load(Ordering::SeqCst);

        if idle {
            let next_pending = {
                let mut state = self.state.lock();
                let next = state.pending.iter().next().cloned();
                if let Some(name) = &next {
                    state.pending.remove(name);
                }
                next
            };
            if let Some(portal_name) = next_pending {
                self.trigger_scrape(&portal_name);
            }
        }

        if !idle {
            return;
        }

        let due: Vec<String> = {
            let now_epoch = chrono::Utc::now().timestamp();
            let state = self.state.lock();
            state
                .rules
                .values()
                .filter(|rule| rule.enabled)
                .filter(|rule| {
                    let interval =
                        (rule.interval_minutes as i64 * 60).max(MIN_INTERVAL_SECS);
                    let last_check = state
                        .portal_state
                        .get(&rule.portal)
                        .map(|s| s.last_check_epoch)
                        .unwrap_or(0);
                    now_epoch - last_check >= interval
                })
                .map(|rule| rule.portal.clone())
                .collect()
        };

        for portal_name in due {
            match self.check_portal_for_change(&portal_name).await {
                Ok(true) => {
                    self.state.lock().pending.insert(portal_name);
                }
                Ok(false) => {}
                Err(err) => {
                    warn!("Watch check failed for '{portal_name}': {err}");
                    self.record_event(&portal_name, "ERROR", &format!("Watch check failed: {err}"));
                }
            }
        }
    }

    /// Fetch the organisation list and compare its signature with the stored
    /// one. Returns true when a change was detected. The first check stores
    /// a baseline and reports no change.
    pub async fn check_portal_for_change(&self, portal_name: &str) -> Result<bool> {
        let portal = portal_by_name(&self.portals, portal_name)
            .with_context(|| format!("portal '{portal_name}' not configured"))?
            .clone();

        let listing = self
            .fetcher
            .fetch_department_list(&portal)
            .await
            .with_context(|| format!("department list fetch failed for '{portal_name}'"))?;
        if listing.departments.is_empty() {
            self.record_event(portal_name, "CHECK", "No departments fetched");
            self.touch_check(portal_name, None, 0);
            return Ok(false);
        }

        let (sig, dept_count) = compute_department_signature(&listing.departments);
        let previous = {
            let state = self.state.lock();
            state
                .portal_state
                .get(portal_name)
                .map(|s| s.signature.clone())
                .unwrap_or_default()
        };
        self.touch_check(portal_name, Some(sig.clone()), dept_count);

        if previous.is_empty() {
            info!("Watch baseline captured for '{portal_name}' ({dept_count} departments)");
            return Ok(false);
        }
        if previous != sig {
            self.record_event(
                portal_name,
                "CHANGE",
                &format!("Signature changed, departments={dept_count}"),
            );
            self.bus.emit(ScrapeEvent::log(
                portal_name,
                format!("Refresh watch: change detected ({dept_count} departments)"),
            ));
            return Ok(true);
        }
        self.record_event(
            portal_name,
            "CHECK",
            &format!("No change, departments={dept_count}"),
        );
        Ok(false)
    }

    /// Queue a portal manually, ahead of its interval.
    pub fn request_manual(&self, portal_name: &str) {
        self.state.lock().pending.insert(portal_name.to_string());
        self.record_event(portal_name, "MANUAL", "Manual trigger queued");
    }

    /// Pending portals not yet handed to the scheduler.
    #[must_use]
    pub fn pending(&self) -> Vec<String> {
        self.state.lock().pending.iter().cloned().collect()
    }

    /// Snapshot of rules, per-portal state, and history for persistence
    /// into the settings file.
    #[must_use]
    pub fn snapshot(
        &self,
    ) -> (
        Vec<WatchRule>,
        BTreeMap<String, WatchPortalState>,
        Vec<WatchEvent>,
    ) {
        let state = self.state.lock();
        (
            state.rules.values().cloned().collect(),
            state.portal_state.clone(),
            state.history.iter().cloned().collect(),
        )
    }

    /// Export the event history to CSV.
    pub fn export_history_csv(&self, path: &Path) -> Result<()> {
        let history: Vec<WatchEvent> = {
            let state = self.state.lock();
            state.history.iter().cloned().collect()
        };
        let mut writer = csv::Writer::from_path(path)
            .with_context(|| format!("Failed to create history export: {}", path.display()))?;
        writer.write_record(["timestamp", "portal", "event", "detail"])?;
        for event in history {
            writer.write_record([event.timestamp, event.portal, event.event, event.detail])?;
        }
        writer.flush()?;
        Ok(())
    }

    fn trigger_scrape(&self, portal_name: &str) {
        // Watch-triggered scrapes are full scope: only_new off so an
        // extended deadline or re-listing is reconciled, not skipped.
        let request = ScrapeRequest {
            portal: portal_name.to_string(),
            only_new: false,
            scope: ScopeMode::WatchTriggered,
        };
        match self.scrape_tx.send(request) {
            Ok(()) => {
                self.record_event(portal_name, "TRIGGER", "Triggered full scrape");
                info!("Refresh watch triggered full scrape for '{portal_name}'");
            }
            Err(_) => {
                // Receiver gone; keep the portal queued for a later tick.
                self.state.lock().pending.insert(portal_name.to_string());
                self.record_event(portal_name, "QUEUE", "Runner unavailable; queued");
            }
        }
    }

    fn touch_check(&self, portal_name: &str, signature: Option<String>, dept_count: usize) {
        let mut state = self.state.lock();
        let entry = state.portal_state.entry(portal_name.to_string()).or_default();
        entry.last_check_epoch = chrono::Utc::now().timestamp();
        if let Some(signature) = signature {
            entry.signature = signature;
            entry.department_count = dept_count;
        }
    }

    fn record_event(&self, portal: &str, event: &str, detail: &str) {
        let mut state = self.state.lock();
        state.history.push_back(WatchEvent {
            timestamp: chrono::Local::now().format("%Y-%m-%dT%H:%M:%S").to_string(),
            portal: portal.to_string(),
            event: event.to_string(),
            detail: detail.to_string(),
        });
        while state.history.len() > HISTORY_LIMIT {
            state.history.pop_front();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fetch::{DepartmentInfo, DepartmentListing, FetchError, RawTenderRow};
    use async_trait::async_trait;

    struct ScriptedFetcher {
        listings: Mutex<Vec<Vec<DepartmentInfo>>>,
    }

    impl ScriptedFetcher {
        fn new(listings: Vec<Vec<DepartmentInfo>>) -> Self {
            Self {
                listings: Mutex::new(listings),
            }
        }
    }

    #[async_trait]
    impl PortalFetcher for ScriptedFetcher {
        async fn fetch_department_list(
            &self,
            _portal: &Portal,
        ) -> Result<DepartmentListing, FetchError> {
            let mut listings = self.listings.lock();
            let departments = if listings.len() > 1 {
                listings.remove(0)
            } else {
                listings.first().cloned().unwrap_or_default()
            };
            Ok(DepartmentListing {
                departments,
                expected_total: 0,
            })
        }

        async fn fetch_department_rows(
            &self,
            _portal: &Portal,
            _department: &DepartmentInfo,
        ) -> Result<Vec<RawTenderRow>, FetchError> {
            Ok(Vec::new())
        }

        async fn reinitialize(&self) -> Result<(), FetchError> {
            Ok(())
        }
    }

    fn dept(s_no: &str, name: &str, count: &str) -> DepartmentInfo {
        DepartmentInfo {
            s_no: s_no.to_string(),
            name: name.to_string(),
            count_text: count.to_string(),
            direct_url: String::new(),
        }
    }

    fn watcher_with(
        listings: Vec<Vec<DepartmentInfo>>,
    ) -> (
        Arc<RefreshWatcher>,
        mpsc::UnboundedReceiver<ScrapeRequest>,
        Arc<AtomicBool>,
    ) {
        let portal = Portal::new("HP Tenders", "https://hptenders.gov.in/nicgep/app")
            .expect("portal");
        let (tx, rx) = mpsc::unbounded_channel();
        let busy = Arc::new(AtomicBool::new(false));
        let watcher = Arc::new(RefreshWatcher::new(
            vec![portal],
            Arc::new(ScriptedFetcher::new(listings)),
            Arc::new(ScrapeEventBus::default()),
            vec![WatchRule {
                portal: "HP Tenders".to_string(),
                interval_minutes: 1,
                enabled: true,
            }],
            BTreeMap::new(),
            Vec::new(),
            tx,
            Arc::clone(&busy),
        ));
        (watcher, rx, busy)
    }

    #[tokio::test]
    async fn test_baseline_then_change_triggers_full_scrape() {
        let (watcher, mut rx, _busy) = watcher_with(vec![
            vec![dept("1", "Roads", "10")],
            vec![dept("1", "Roads", "11")],
        ]);

        // First check: baseline, nothing pending.
        let changed = watcher
            .check_portal_for_change("HP Tenders")
            .await
            .expect("baseline check");
        assert!(!changed);

        // Second check: count text changed, portal becomes pending.
        let changed = watcher
            .check_portal_for_change("HP Tenders")
            .await
            .expect("change check");
        assert!(changed);
        watcher.state.lock().pending.insert("HP Tenders".to_string());

        // A tick with an idle scheduler drains the pending portal.
        watcher.tick().await;
        let request = rx.try_recv().expect("scrape request");
        assert_eq!(request.portal, "HP Tenders");
        assert!(!request.only_new);
        assert_eq!(request.scope, ScopeMode::WatchTriggered);
    }

    #[tokio::test]
    async fn test_no_change_records_check_event() {
        let (watcher, _rx, _busy) = watcher_with(vec![vec![dept("1", "Roads", "10")]]);
        watcher
            .check_portal_for_change("HP Tenders")
            .await
            .expect("baseline");
        let changed = watcher
            .check_portal_for_change("HP Tenders")
            .await
            .expect("second check");
        assert!(!changed);

        let (_, state, history) = watcher.snapshot();
        assert_eq!(state.get("HP Tenders").expect("state").department_count, 1);
        assert!(history.iter().any(|e| e.event == "CHECK"));
    }

    #[tokio::test]
    async fn test_busy_scheduler_defers_pending() {
        let (watcher, mut rx, busy) = watcher_with(vec![vec![dept("1", "Roads", "10")]]);
        watcher.request_manual("HP Tenders");

        busy.store(true, Ordering::SeqCst);
        watcher.tick().await;
        assert!(rx.try_recv().is_err());
        assert_eq!(watcher.pending(), vec!["HP Tenders".to_string()]);

        busy.store(false, Ordering::SeqCst);
        watcher.tick().await;
        assert_eq!(rx.try_recv().expect("request").portal, "HP Tenders");
        assert!(watcher.pending().is_empty());
    }

    #[tokio::test]
    async fn test_history_ring_buffer_capped() {
        let (watcher, _rx, _busy) = watcher_with(vec![vec![dept("1", "Roads", "10")]]);
        for i in 0..(HISTORY_LIMIT + 20) {
            watcher.record_event("HP Tenders", "CHECK", &format!("tick {i}"));
        }
        let (_, _, history) = watcher.snapshot();
        assert_eq!(history.len(), HISTORY_LIMIT);
        assert!(history[0].detail.contains("tick 20"));
    }

    #[tokio::test]
    async fn test_history_csv_export() {
        let dir = tempfile::TempDir::new().expect("temp dir");
        let (watcher, _rx, _busy) = watcher_with(vec![vec![dept("1", "Roads", "10")]]);
        watcher.record_event("HP Tenders", "CHANGE", "Signature changed, departments=1");

        let path = dir.path().join("watch_history.csv");
        watcher.export_history_csv(&path).expect("export history");
        let text = std::fs::read_to_string(&path).expect("read export");
        assert!(text.starts_with("timestamp,portal,event,detail"));
        assert!(text.contains("CHANGE"));
    }
}
