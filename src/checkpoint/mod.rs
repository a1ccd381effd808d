//! Crash-safe batch checkpoints.
//!
//! One JSON blob records the whole scheduler state: which portals are done,
//! which departments each in-flight portal has completed, and the running
//! totals. It is rewritten after every material event with a temp-file
//! rename so a crash can never leave a torn file, and deleted only when a
//! batch ends with nothing remaining.
//!
//! On resume, totals loaded from the checkpoint become the resume base;
//! live counters add on top so displayed totals never regress.

use anyhow::{Context, Result};
use log::{debug, info, warn};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::path::{Path, PathBuf};

use crate::scrape_engine::portal_run::PortalSummary;

pub const CHECKPOINT_VERSION: u32 = 1;

/// Batch-wide counter totals.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckpointTotals {
    pub tenders: u64,
    pub departments: u64,
    pub portals: u64,
    pub skipped_existing: u64,
    pub closing_date_reprocessed: u64,
}

/// Per-portal progress stored in the checkpoint.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PortalProgress {
    pub processed_departments: Vec<String>,
    pub dept_current: usize,
    pub dept_total: usize,
    pub expected_departments: usize,
    pub tenders_found: u64,
    pub expected_tenders: u64,
    pub status: String,
    pub updated_at: String,
}

/// The persisted checkpoint payload.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CheckpointData {
    pub version: u32,
    pub updated_at: String,
    pub is_scraping: bool,
    pub all_portals: Vec<String>,
    pub completed_portals: Vec<String>,
    pub remaining_portals: Vec<String>,
    pub worker_count: usize,
    pub worker_names: Vec<String>,
    pub totals: CheckpointTotals,
    pub portal_progress: BTreeMap<String, PortalProgress>,
}

impl CheckpointData {
    /// Departments already completed for a portal, lowercased and trimmed,
    /// for the scraper's resume set.
    #[must_use]
    pub fn processed_departments_for(&self, portal: &str) -> HashSet<String> {
        self.portal_progress
            .get(portal)
            .map(|progress| {
                progress
                    .processed_departments
                    .iter()
                    .map(|name| name.trim().to_lowercase())
                    .filter(|name| !name.is_empty())
                    .collect()
            })
            .unwrap_or_default()
    }
}

/// Serializes checkpoint writes for one batch. Owned by the scheduler; all
/// progress reaches it through the scheduler's event loop.
pub struct Checkpointer {
    path: PathBuf,
    state: Mutex<CheckpointData>,
    /// Totals carried over from a resumed checkpoint.
    resume_base: CheckpointTotals,
}

impl Checkpointer {
    /// Load an existing checkpoint, if any.
    pub fn load(path: &Path) -> Option<CheckpointData> {
        let raw = std::fs::read_to_string(path).ok()?;
        match serde_json::from_str::<CheckpointData>(&raw) {
            Ok(data) => Some(data),
            Err(err) => {
                warn!("Failed to parse checkpoint {}: {err}", path.display());
                None
            }
        }
    }

    /// Start a fresh batch checkpoint, optionally carrying the resume base
    /// from a prior checkpoint.
    pub fn begin_batch(
        path: PathBuf,
        all_portals: &[String],
        worker_count: usize,
        worker_names: Vec<String>,
        resume_from: Option<&CheckpointData>,
    ) -> Self {
        let resume_base = resume_from.map(|data| data.totals).unwrap_or_default();
        let mut state = CheckpointData {
            version: CHECKPOINT_VERSION,
            is_scraping: true,
            all_portals: all_portals.to_vec(),
            remaining_portals: all_portals.to_vec(),
            worker_count,
            worker_names,
            totals: resume_base,
            ..CheckpointData::default()
        };
        if let Some(prior) = resume_from {
            // Keep department progress for portals still in this batch.
            for (portal, progress) in &prior.portal_progress {
                if state.all_portals.contains(portal) {
                    state.portal_progress.insert(portal.clone(), progress.clone());
                }
            }
        }
        Self {
            path,
            state: Mutex::new(state),
            resume_base,
        }
    }

    /// Totals from the resumed checkpoint (zero for a fresh batch).
    #[must_use]
    pub fn resume_base(&self) -> CheckpointTotals {
        self.resume_base
    }

    /// Record a completed department for a portal and write the checkpoint.
    pub fn note_department_completed(&self, portal: &str, department: &str) -> Result<()> {
        {
            let mut state = self.state.lock();
            let entry = state.portal_progress.entry(portal.to_string()).or_default();
            let normalized = department.trim().to_lowercase();
            if !normalized.is_empty() {
                let mut set: BTreeSet<String> =
                    entry.processed_departments.iter().cloned().collect();
                set.insert(normalized);
                entry.processed_departments = set.into_iter().collect();
            }
            entry.updated_at = now_iso();
            state.totals.departments += 1;
        }
        self.write()
    }

    /// Record a progress tick for a portal (counter changes only; written
    /// because displayed totals must survive a crash).
    pub fn note_progress(
        &self,
        portal: &str,
        dept_current: usize,
        dept_total: usize,
        tenders_found: u64,
        expected_tenders: u64,
    ) -> Result<()> {
        {
            let mut state = self.state.lock();
            let entry = state.portal_progress.entry(portal.to_string()).or_default();
            entry.dept_current = dept_current;
            entry.dept_total = dept_total;
            entry.expected_departments = dept_total;
            entry.tenders_found = tenders_found;
            entry.expected_tenders = expected_tenders;
            entry.status = "running".to_string();
            entry.updated_at = now_iso();
        }
        self.write()
    }

    /// Record a completed portal with its summary and write the checkpoint.
    pub fn note_portal_completed(&self, portal: &str, summary: &PortalSummary) -> Result<()> {
        {
            let mut state = self.state.lock();
            if !state.completed_portals.iter().any(|name| name == portal) {
                state.completed_portals.push(portal.to_string());
            }
            let completed: HashSet<String> = state.completed_portals.iter().cloned().collect();
            state.remaining_portals = state
                .all_portals
                .iter()
                .filter(|name| !completed.contains(*name))
                .cloned()
                .collect();

            state.totals.tenders += summary.extracted_total_tenders;
            state.totals.skipped_existing += summary.skipped_existing_total;
            state.totals.closing_date_reprocessed += summary.closing_date_reprocessed_total;
            state.totals.portals += 1;

            let entry = state.portal_progress.entry(portal.to_string()).or_default();
            let mut set: BTreeSet<String> = entry.processed_departments.iter().cloned().collect();
            set.extend(
                summary
                    .processed_department_names
                    .iter()
                    .map(|name| name.trim().to_lowercase())
                    .filter(|name| !name.is_empty()),
            );
            entry.processed_departments = set.into_iter().collect();
            entry.status = summary.status.clone();
            entry.tenders_found = summary.extracted_total_tenders;
            entry.updated_at = now_iso();
        }
        self.write()
    }

    /// Displayed totals: resume base plus everything recorded this batch is
    /// already folded into the state, so this is a plain snapshot.
    #[must_use]
    pub fn totals(&self) -> CheckpointTotals {
        self.state.lock().totals
    }

    /// Portals not yet completed.
    #[must_use]
    pub fn remaining_portals(&self) -> Vec<String> {
        self.state.lock().remaining_portals.clone()
    }

    /// End the batch: the checkpoint file survives only when portals
    /// remain.
    pub fn finish_batch(&self) -> Result<()> {
        let remaining = {
            let mut state = self.state.lock();
            state.is_scraping = false;
            state.remaining_portals.len()
        };
        if remaining == 0 {
            if self.path.exists() {
                std::fs::remove_file(&self.path)
                    .with_context(|| format!("Failed to remove checkpoint: {}", self.path.display()))?;
                info!("Batch complete; checkpoint cleared");
            }
            Ok(())
        } else {
            info!("Batch ended with {remaining} portal(s) remaining; checkpoint kept");
            self.write()
        }
    }

    /// Atomic write: serialize to a temp file next to the target, then
    /// rename over it.
    fn write(&self) -> Result<()> {
        let payload = {
            let mut state = self.state.lock();
            state.updated_at = now_iso();
            serde_json::to_string_pretty(&*state).context("Failed to encode checkpoint")?
        };

        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create checkpoint dir: {}", parent.display()))?;
        }
        let tmp_path = self.path.with_extension("json.tmp");
        std::fs::write(&tmp_path, payload)
            .with_context(|| format!("Failed to write checkpoint temp: {}", tmp_path.display()))?;
        std::fs::rename(&tmp_path, &self.path)
            .with_context(|| format!("Failed to replace checkpoint: {}", self.path.display()))?;
        debug!("Checkpoint written: {}", self.path.display());
        Ok(())
    }
}

fn now_iso() -> String {
    chrono::Local::now().format("%Y-%m-%dT%H:%M:%S").to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn portals() -> Vec<String> {
        vec!["A".to_string(), "B".to_string(), "C".to_string()]
    }

    fn completed_summary(extracted: u64) -> PortalSummary {
        PortalSummary {
            status: "Scraping completed".to_string(),
            extracted_total_tenders: extracted,
            processed_department_names: vec!["roads".to_string(), " Bridges ".to_string()],
            ..PortalSummary::default()
        }
    }

    #[test]
    fn test_checkpoint_written_and_loadable() {
        let dir = TempDir::new().expect("temp dir");
        let path = dir.path().join("checkpoint.json");
        let checkpointer =
            Checkpointer::begin_batch(path.clone(), &portals(), 2, vec![], None);

        checkpointer
            .note_department_completed("A", "Roads")
            .expect("note department");
        let loaded = Checkpointer::load(&path).expect("load checkpoint");
        assert_eq!(loaded.version, CHECKPOINT_VERSION);
        assert!(loaded.is_scraping);
        assert_eq!(loaded.remaining_portals, portals());
        assert_eq!(
            loaded.processed_departments_for("A"),
            HashSet::from(["roads".to_string()])
        );
    }

    #[test]
    fn test_completed_portals_shrink_remaining() {
        let dir = TempDir::new().expect("temp dir");
        let path = dir.path().join("checkpoint.json");
        let checkpointer =
            Checkpointer::begin_batch(path.clone(), &portals(), 2, vec![], None);

        checkpointer
            .note_portal_completed("B", &completed_summary(7))
            .expect("note portal");

        let loaded = Checkpointer::load(&path).expect("load checkpoint");
        assert_eq!(loaded.completed_portals, vec!["B".to_string()]);
        assert_eq!(
            loaded.remaining_portals,
            vec!["A".to_string(), "C".to_string()]
        );
        assert_eq!(loaded.totals.tenders, 7);
        assert_eq!(loaded.totals.portals, 1);
        // Department names are lowercased, trimmed, deduplicated.
        assert_eq!(
            loaded.processed_departments_for("B"),
            HashSet::from(["roads".to_string(), "bridges".to_string()])
        );
    }

    #[test]
    fn test_finish_batch_deletes_only_when_nothing_remains() {
        let dir = TempDir::new().expect("temp dir");
        let path = dir.path().join("checkpoint.json");
        let checkpointer =
            Checkpointer::begin_batch(path.clone(), &portals(), 1, vec![], None);

        checkpointer
            .note_portal_completed("A", &completed_summary(1))
            .expect("portal A");
        checkpointer.finish_batch().expect("finish with remaining");
        assert!(path.exists(), "checkpoint must survive an incomplete batch");

        checkpointer
            .note_portal_completed("B", &completed_summary(1))
            .expect("portal B");
        checkpointer
            .note_portal_completed("C", &completed_summary(1))
            .expect("portal C");
        checkpointer.finish_batch().expect("finish clean");
        assert!(!path.exists(), "checkpoint must be cleared after a full batch");
    }

    #[test]
    fn test_resume_base_carries_totals_and_progress() {
        let dir = TempDir::new().expect("temp dir");
        let path = dir.path().join("checkpoint.json");

        let first = Checkpointer::begin_batch(path.clone(), &portals(), 1, vec![], None);
        first
            .note_portal_completed("A", &completed_summary(5))
            .expect("portal A");
        first.finish_batch().expect("finish first");

        let prior = Checkpointer::load(&path).expect("load prior");
        let remaining = prior.remaining_portals.clone();
        assert_eq!(remaining, vec!["B".to_string(), "C".to_string()]);

        let second =
            Checkpointer::begin_batch(path.clone(), &remaining, 1, vec![], Some(&prior));
        assert_eq!(second.resume_base().tenders, 5);
        // Totals never regress: the base is already folded in.
        assert_eq!(second.totals().tenders, 5);
        second
            .note_portal_completed("B", &completed_summary(2))
            .expect("portal B");
        assert_eq!(second.totals().tenders, 7);
    }

    #[test]
    fn test_load_missing_or_corrupt() {
        let dir = TempDir::new().expect("temp dir");
        let path = dir.path().join("checkpoint.json");
        assert!(Checkpointer::load(&path).is_none());
        std::fs::write(&path, "{broken").expect("write corrupt");
        assert!(Checkpointer::load(&path).is_none());
    }
}
