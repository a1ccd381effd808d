//! Application settings persisted as `settings.json`.
//!
//! Missing keys are filled from defaults on load; an absent file is created
//! with the default structure. The refresh-watch rules, signature state, and
//! event history live in the same file as everything else so the watcher
//! survives restarts.

use anyhow::{Context, Result};
use log::{info, warn};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

/// Whether the delta sweep (§ portal run, final pass) runs after an
/// only-new portal run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum DeltaMode {
    #[default]
    Quick,
    Full,
}

/// When workbook exports are produced.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ExportPolicy {
    #[default]
    OnDemand,
    Always,
    Interval,
}

/// A single refresh-watch rule.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct WatchRule {
    pub portal: String,
    pub interval_minutes: u64,
    pub enabled: bool,
}

/// Persisted per-portal watch state: last signature and check time.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct WatchPortalState {
    #[serde(default)]
    pub signature: String,
    #[serde(default)]
    pub department_count: usize,
    #[serde(default)]
    pub last_check_epoch: i64,
}

/// One recorded refresh-watch event.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct WatchEvent {
    pub timestamp: String,
    pub portal: String,
    pub event: String,
    pub detail: String,
}

/// Fetch-related timeout knobs, in seconds.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TimeoutSettings {
    pub page_load_timeout_secs: u64,
    pub element_wait_timeout_secs: u64,
    pub stabilize_wait_secs: u64,
    pub post_action_wait_secs: u64,
    pub captcha_check_timeout_secs: u64,
    pub download_wait_timeout_secs: u64,
    pub popup_wait_timeout_secs: u64,
    pub post_download_click_wait_secs: u64,
}

impl Default for TimeoutSettings {
    fn default() -> Self {
        Self {
            page_load_timeout_secs: 30,
            element_wait_timeout_secs: 15,
            stabilize_wait_secs: 2,
            post_action_wait_secs: 1,
            captcha_check_timeout_secs: 5,
            download_wait_timeout_secs: 60,
            popup_wait_timeout_secs: 5,
            post_download_click_wait_secs: 2,
        }
    }
}

/// The settings file contents.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct AppSettings {
    pub download_directory: Option<PathBuf>,
    pub department_parallel_workers: usize,
    pub batch_delta_mode: DeltaMode,
    pub refresh_watch_enabled: bool,
    pub refresh_watch_loop_seconds: u64,
    pub refresh_watch_portals: Vec<WatchRule>,
    pub refresh_watch_state: BTreeMap<String, WatchPortalState>,
    pub refresh_watch_history: Vec<WatchEvent>,
    pub central_sqlite_db_path: Option<PathBuf>,
    pub sqlite_backup_directory: Option<PathBuf>,
    pub sqlite_backup_retention_days: u32,
    pub excel_export_policy: ExportPolicy,
    pub excel_export_interval_days: u32,
    pub timeouts: TimeoutSettings,
}

impl Default for AppSettings {
    fn default() -> Self {
        Self {
            download_directory: None,
            department_parallel_workers: 1,
            batch_delta_mode: DeltaMode::Quick,
            refresh_watch_enabled: false,
            refresh_watch_loop_seconds: 30,
            refresh_watch_portals: Vec::new(),
            refresh_watch_state: BTreeMap::new(),
            refresh_watch_history: Vec::new(),
            central_sqlite_db_path: None,
            sqlite_backup_directory: None,
            sqlite_backup_retention_days: 30,
            excel_export_policy: ExportPolicy::OnDemand,
            excel_export_interval_days: 2,
            timeouts: TimeoutSettings::default(),
        }
    }
}

impl AppSettings {
    /// Load settings, filling defaults for missing keys. Creates the file
    /// with defaults when it does not exist; a corrupt file is replaced with
    /// defaults after a warning.
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            info!("Settings file not found, creating defaults at {}", path.display());
            let settings = Self::default();
            settings.save(path)?;
            return Ok(settings);
        }

        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read settings: {}", path.display()))?;
        match serde_json::from_str::<Self>(&raw) {
            Ok(settings) => Ok(settings),
            Err(err) => {
                warn!("Failed to parse settings ({err}); rewriting defaults");
                let settings = Self::default();
                settings.save(path)?;
                Ok(settings)
            }
        }
    }

    /// Save settings as pretty-printed JSON.
    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create settings dir: {}", parent.display()))?;
        }
        let payload = serde_json::to_string_pretty(self).context("Failed to encode settings")?;
        std::fs::write(path, payload)
            .with_context(|| format!("Failed to write settings: {}", path.display()))?;
        Ok(())
    }

    /// Watch loop period with the documented floor of 5 seconds.
    #[must_use]
    pub fn watch_loop_seconds(&self) -> u64 {
        self.refresh_watch_loop_seconds.max(5)
    }

    /// Backup retention with the documented floor of 7 days.
    #[must_use]
    pub fn backup_retention_days(&self) -> u32 {
        self.sqlite_backup_retention_days.max(7)
    }

    /// Export interval with the documented floor of 1 day.
    #[must_use]
    pub fn export_interval_days(&self) -> u32 {
        self.excel_export_interval_days.max(1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_load_creates_defaults() {
        let dir = TempDir::new().expect("temp dir");
        let path = dir.path().join("settings.json");
        let settings = AppSettings::load(&path).expect("load settings");
        assert_eq!(settings, AppSettings::default());
        assert!(path.exists());
    }

    #[test]
    fn test_missing_keys_filled_from_defaults() {
        let dir = TempDir::new().expect("temp dir");
        let path = dir.path().join("settings.json");
        std::fs::write(&path, r#"{"refresh_watch_enabled": true}"#).expect("write partial");

        let settings = AppSettings::load(&path).expect("load settings");
        assert!(settings.refresh_watch_enabled);
        assert_eq!(settings.department_parallel_workers, 1);
        assert_eq!(settings.batch_delta_mode, DeltaMode::Quick);
        assert_eq!(settings.sqlite_backup_retention_days, 30);
    }

    #[test]
    fn test_corrupt_file_replaced_with_defaults() {
        let dir = TempDir::new().expect("temp dir");
        let path = dir.path().join("settings.json");
        std::fs::write(&path, "{not json").expect("write corrupt");

        let settings = AppSettings::load(&path).expect("load settings");
        assert_eq!(settings, AppSettings::default());
    }

    #[test]
    fn test_clamped_getters() {
        let mut settings = AppSettings::default();
        settings.refresh_watch_loop_seconds = 1;
        settings.sqlite_backup_retention_days = 2;
        settings.excel_export_interval_days = 0;
        assert_eq!(settings.watch_loop_seconds(), 5);
        assert_eq!(settings.backup_retention_days(), 7);
        assert_eq!(settings.export_interval_days(), 1);
    }

    #[test]
    fn test_roundtrip() {
        let dir = TempDir::new().expect("temp dir");
        let path = dir.path().join("settings.json");
        let mut settings = AppSettings::default();
        settings.refresh_watch_portals.push(WatchRule {
            portal: "HP Tenders".to_string(),
            interval_minutes: 30,
            enabled: true,
        });
        settings.save(&path).expect("save settings");

        let loaded = AppSettings::load(&path).expect("load settings");
        assert_eq!(loaded, settings);
    }
}
