//! Per-portal run reports.
//!
//! Every portal run in a batch leaves a JSON/CSV report pair under
//! `batch_run_reports/run_<timestamp>/`, whatever its outcome. The CSV is a
//! one-row flattening of the JSON for spreadsheet triage.

use anyhow::{Context, Result};
use log::info;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use super::portal_run::PortalSummary;

/// Error messages kept in a report.
const MAX_REPORT_ERRORS: usize = 30;

/// One portal's run report.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunReport {
    pub portal: String,
    pub started_at: String,
    pub completed_at: String,
    pub duration_sec: f64,
    pub status: String,
    pub attempted_departments: usize,
    pub processed_departments: usize,
    pub resume_skipped_departments: usize,
    pub expected_tenders: u64,
    pub extracted_tenders: u64,
    pub skipped_known_tenders: u64,
    pub closing_date_reprocessed: u64,
    pub output_file_path: Option<String>,
    pub output_file_type: Option<String>,
    pub partial_saved: bool,
    pub delta_sweep_enabled: bool,
    pub delta_sweep_extracted: u64,
    pub error_count: usize,
    pub errors: Vec<String>,
}

impl RunReport {
    #[must_use]
    pub fn from_summary(
        portal: &str,
        summary: &PortalSummary,
        started_at: chrono::DateTime<chrono::Local>,
        completed_at: chrono::DateTime<chrono::Local>,
        delta_sweep_enabled: bool,
    ) -> Self {
        let duration = (completed_at - started_at).num_milliseconds().max(0) as f64 / 1000.0;
        Self {
            portal: portal.to_string(),
            started_at: started_at.format("%Y-%m-%dT%H:%M:%S").to_string(),
            completed_at: completed_at.format("%Y-%m-%dT%H:%M:%S").to_string(),
            duration_sec: duration,
            status: summary.status.clone(),
            attempted_departments: summary.processed_departments
                + summary.resume_skipped_departments,
            processed_departments: summary.processed_departments,
            resume_skipped_departments: summary.resume_skipped_departments,
            expected_tenders: summary.expected_total_tenders,
            extracted_tenders: summary.extracted_total_tenders,
            skipped_known_tenders: summary.skipped_existing_total,
            closing_date_reprocessed: summary.closing_date_reprocessed_total,
            output_file_path: summary.output_file_path.clone(),
            output_file_type: summary.output_file_type.clone(),
            partial_saved: summary.partial_saved,
            delta_sweep_enabled,
            delta_sweep_extracted: summary.delta_sweep_extracted,
            error_count: summary.errors.len(),
            errors: summary.errors.iter().take(MAX_REPORT_ERRORS).cloned().collect(),
        }
    }

    /// Gap between what the portal advertised and what this run accounted
    /// for.
    #[must_use]
    pub fn remaining_gap(&self) -> u64 {
        self.expected_tenders
            .saturating_sub(self.extracted_tenders)
            .saturating_sub(self.skipped_known_tenders)
    }
}

/// Create `batch_run_reports/run_<timestamp>/` under `root`.
pub fn prepare_report_dir(root: &Path) -> Result<PathBuf> {
    let stamp = chrono::Local::now().format("%Y%m%d_%H%M%S");
    let report_dir = root.join("batch_run_reports").join(format!("run_{stamp}"));
    std::fs::create_dir_all(&report_dir)
        .with_context(|| format!("Failed to create report dir: {}", report_dir.display()))?;
    Ok(report_dir)
}

/// Write the JSON and CSV report pair. Returns both paths.
pub fn write_portal_report(report_dir: &Path, report: &RunReport) -> Result<(PathBuf, PathBuf)> {
    std::fs::create_dir_all(report_dir)
        .with_context(|| format!("Failed to create report dir: {}", report_dir.display()))?;

    let safe_name = {
        let name = sanitize_filename::sanitize(&report.portal);
        if name.is_empty() { "portal".to_string() } else { name }
    };
    let stamp = chrono::Local::now().format("%Y%m%d_%H%M%S");
    let json_path = report_dir.join(format!("{safe_name}_{stamp}.json"));
    let csv_path = report_dir.join(format!("{safe_name}_{stamp}.csv"));

    let payload = serde_json::to_string_pretty(report).context("Failed to encode report")?;
    std::fs::write(&json_path, payload)
        .with_context(|| format!("Failed to write report: {}", json_path.display()))?;

    let mut writer = csv::Writer::from_path(&csv_path)
        .with_context(|| format!("Failed to create report: {}", csv_path.display()))?;
    writer.write_record([
        "portal",
        "started_at",
        "completed_at",
        "duration_sec",
        "status",
        "attempted_departments",
        "processed_departments",
        "resume_skipped_departments",
        "expected_tenders",
        "extracted_tenders",
        "skipped_known_tenders",
        "closing_date_reprocessed",
        "output_file_path",
        "output_file_type",
        "partial_saved",
        "delta_sweep_enabled",
        "delta_sweep_extracted",
        "error_count",
        "errors",
    ])?;
    writer.write_record([
        report.portal.clone(),
        report.started_at.clone(),
        report.completed_at.clone(),
        format!("{:.3}", report.duration_sec),
        report.status.clone(),
        report.attempted_departments.to_string(),
        report.processed_departments.to_string(),
        report.resume_skipped_departments.to_string(),
        report.expected_tenders.to_string(),
        report.extracted_tenders.to_string(),
        report.skipped_known_tenders.to_string(),
        report.closing_date_reprocessed.to_string(),
        report.output_file_path.clone().unwrap_or_default(),
        report.output_file_type.clone().unwrap_or_default(),
        report.partial_saved.to_string(),
        report.delta_sweep_enabled.to_string(),
        report.delta_sweep_extracted.to_string(),
        report.error_count.to_string(),
        report.errors.join(" | "),
    ])?;
    writer.flush()?;

    info!("Run report saved: {}", json_path.display());
    Ok((json_path, csv_path))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn sample_summary() -> PortalSummary {
        PortalSummary {
            status: "Scraping completed".to_string(),
            expected_total_tenders: 10,
            extracted_total_tenders: 6,
            skipped_existing_total: 3,
            processed_departments: 4,
            resume_skipped_departments: 1,
            errors: vec!["department 'Roads' failed: timeout".to_string()],
            ..PortalSummary::default()
        }
    }

    #[test]
    fn test_report_from_summary_and_gap() {
        let started = chrono::Local::now();
        let completed = started + chrono::Duration::seconds(90);
        let report = RunReport::from_summary("HP Tenders", &sample_summary(), started, completed, true);

        assert_eq!(report.duration_sec, 90.0);
        assert_eq!(report.attempted_departments, 5);
        assert_eq!(report.error_count, 1);
        assert_eq!(report.remaining_gap(), 1);
    }

    #[test]
    fn test_write_report_pair() {
        let dir = TempDir::new().expect("temp dir");
        let report_dir = prepare_report_dir(dir.path()).expect("report dir");
        assert!(report_dir.to_string_lossy().contains("batch_run_reports"));

        let started = chrono::Local::now();
        let report =
            RunReport::from_summary("HP / Tenders", &sample_summary(), started, started, false);
        let (json_path, csv_path) =
            write_portal_report(&report_dir, &report).expect("write report");

        assert!(json_path.exists());
        assert!(csv_path.exists());
        // Slashes in portal names must not create directories.
        assert_eq!(json_path.parent(), Some(report_dir.as_path()));

        let loaded: RunReport = serde_json::from_str(
            &std::fs::read_to_string(&json_path).expect("read json"),
        )
        .expect("parse json");
        assert_eq!(loaded.extracted_tenders, 6);

        let csv_text = std::fs::read_to_string(&csv_path).expect("read csv");
        assert!(csv_text.lines().count() >= 2);
        assert!(csv_text.contains("timeout"));
    }
}
