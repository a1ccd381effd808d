//! Batch run configuration and the persisted batch profile file.
//!
//! `IpSafetyConfig` carries the per-domain politeness knobs; every field is
//! clamped on construction so invalid values degrade to the documented
//! defaults instead of failing a batch. `BatchProfileStore` persists named
//! portal groups and the last-used settings to `batch_scrape_profiles.json`.

use anyhow::{Context, Result};
use log::warn;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;

use super::settings::DeltaMode;

/// Scheduler dispatch mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum BatchMode {
    #[default]
    Sequential,
    Parallel,
}

/// Per-domain politeness knobs applied by the domain limiter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct IpSafetyConfig {
    pub per_domain_max: usize,
    pub min_delay_sec: f64,
    pub max_delay_sec: f64,
    pub cooldown_sec: u64,
    pub max_retries: u32,
}

impl Default for IpSafetyConfig {
    fn default() -> Self {
        Self {
            per_domain_max: 1,
            min_delay_sec: 1.0,
            max_delay_sec: 3.0,
            cooldown_sec: 10,
            max_retries: 2,
        }
    }
}

impl IpSafetyConfig {
    /// Clamp every knob into its valid range: `per_domain_max >= 1`,
    /// `min_delay >= 0`, `max_delay >= min_delay`, `cooldown >= 0`.
    #[must_use]
    pub fn clamped(mut self) -> Self {
        self.per_domain_max = self.per_domain_max.max(1);
        if !self.min_delay_sec.is_finite() || self.min_delay_sec < 0.0 {
            self.min_delay_sec = Self::default().min_delay_sec;
        }
        if !self.max_delay_sec.is_finite() || self.max_delay_sec < self.min_delay_sec {
            self.max_delay_sec = self.min_delay_sec.max(Self::default().max_delay_sec);
        }
        self
    }
}

/// Configuration for one batch run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BatchConfig {
    pub mode: BatchMode,
    pub max_parallel: usize,
    pub only_new: bool,
    pub delta_mode: DeltaMode,
    pub ip_safety: IpSafetyConfig,
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            mode: BatchMode::Sequential,
            max_parallel: 2,
            only_new: true,
            delta_mode: DeltaMode::Quick,
            ip_safety: IpSafetyConfig::default(),
        }
    }
}

impl BatchConfig {
    /// Clamp nested knobs and the worker count.
    #[must_use]
    pub fn clamped(mut self) -> Self {
        self.max_parallel = self.max_parallel.max(1);
        self.ip_safety = self.ip_safety.clamped();
        self
    }
}

/// Contents of `batch_scrape_profiles.json`.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct BatchProfileData {
    pub groups: BTreeMap<String, Vec<String>>,
    pub last_selection: Vec<String>,
    #[serde(flatten)]
    pub last_config: BatchConfig,
}

/// Persists batch groups and the last-used batch settings.
pub struct BatchProfileStore {
    path: PathBuf,
    data: BatchProfileData,
}

impl BatchProfileStore {
    /// Load the profile file, falling back to defaults on a missing or
    /// corrupt file.
    pub fn open(path: PathBuf) -> Self {
        let data = match std::fs::read_to_string(&path) {
            Ok(raw) => match serde_json::from_str::<BatchProfileData>(&raw) {
                Ok(data) => data,
                Err(err) => {
                    warn!("Failed to parse batch profiles ({err}); using defaults");
                    BatchProfileData::default()
                }
            },
            Err(_) => BatchProfileData::default(),
        };
        Self { path, data }
    }

    /// Named portal groups.
    #[must_use]
    pub fn groups(&self) -> &BTreeMap<String, Vec<String>> {
        &self.data.groups
    }

    /// Save a named group. Portal names are deduplicated and sorted; an
    /// empty group name is rejected.
    pub fn save_group(&mut self, group_name: &str, portal_names: &[String]) -> Result<()> {
        let clean_name = group_name.trim();
        if clean_name.is_empty() {
            anyhow::bail!("Group name must not be empty");
        }
        let mut unique: Vec<String> = portal_names
            .iter()
            .filter(|name| !name.trim().is_empty())
            .map(|name| name.trim().to_string())
            .collect();
        unique.sort();
        unique.dedup();
        self.data.groups.insert(clean_name.to_string(), unique);
        self.persist()
    }

    /// Delete a named group. Returns true when the group existed.
    pub fn delete_group(&mut self, group_name: &str) -> Result<bool> {
        let removed = self.data.groups.remove(group_name).is_some();
        if removed {
            self.persist()?;
        }
        Ok(removed)
    }

    /// Remember the last-used selection and settings.
    pub fn save_last_settings(&mut self, selection: &[String], config: BatchConfig) -> Result<()> {
        let mut selection: Vec<String> = selection
            .iter()
            .filter(|name| !name.trim().is_empty())
            .map(|name| name.trim().to_string())
            .collect();
        selection.sort();
        selection.dedup();
        self.data.last_selection = selection;
        self.data.last_config = config.clamped();
        self.persist()
    }

    /// Last-used selection and settings, clamped.
    #[must_use]
    pub fn last_settings(&self) -> (Vec<String>, BatchConfig) {
        (
            self.data.last_selection.clone(),
            self.data.last_config.clone().clamped(),
        )
    }

    fn persist(&self) -> Result<()> {
        let payload =
            serde_json::to_string_pretty(&self.data).context("Failed to encode batch profiles")?;
        std::fs::write(&self.path, payload)
            .with_context(|| format!("Failed to write batch profiles: {}", self.path.display()))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_ip_safety_clamping() {
        let clamped = IpSafetyConfig {
            per_domain_max: 0,
            min_delay_sec: -1.0,
            max_delay_sec: 0.5,
            cooldown_sec: 0,
            max_retries: 0,
        }
        .clamped();
        assert_eq!(clamped.per_domain_max, 1);
        assert_eq!(clamped.min_delay_sec, 1.0);
        assert!(clamped.max_delay_sec >= clamped.min_delay_sec);
    }

    #[test]
    fn test_max_delay_raised_to_min_delay() {
        let clamped = IpSafetyConfig {
            per_domain_max: 2,
            min_delay_sec: 5.0,
            max_delay_sec: 1.0,
            cooldown_sec: 10,
            max_retries: 2,
        }
        .clamped();
        assert_eq!(clamped.min_delay_sec, 5.0);
        assert_eq!(clamped.max_delay_sec, 5.0);
    }

    #[test]
    fn test_profile_roundtrip() {
        let dir = TempDir::new().expect("temp dir");
        let path = dir.path().join("batch_scrape_profiles.json");

        let mut store = BatchProfileStore::open(path.clone());
        store
            .save_group("north", &["HP Tenders".into(), "JK Tenders".into(), "HP Tenders".into()])
            .expect("save group");
        store
            .save_last_settings(
                &["HP Tenders".into()],
                BatchConfig {
                    mode: BatchMode::Parallel,
                    max_parallel: 3,
                    only_new: false,
                    delta_mode: DeltaMode::Full,
                    ip_safety: IpSafetyConfig::default(),
                },
            )
            .expect("save settings");

        let reloaded = BatchProfileStore::open(path);
        assert_eq!(
            reloaded.groups().get("north"),
            Some(&vec!["HP Tenders".to_string(), "JK Tenders".to_string()])
        );
        let (selection, config) = reloaded.last_settings();
        assert_eq!(selection, vec!["HP Tenders".to_string()]);
        assert_eq!(config.mode, BatchMode::Parallel);
        assert_eq!(config.max_parallel, 3);
    }

    #[test]
    fn test_corrupt_profile_file_uses_defaults() {
        let dir = TempDir::new().expect("temp dir");
        let path = dir.path().join("batch_scrape_profiles.json");
        std::fs::write(&path, "oops").expect("write corrupt");

        let store = BatchProfileStore::open(path);
        let (selection, config) = store.last_settings();
        assert!(selection.is_empty());
        assert_eq!(config, BatchConfig::default());
    }
}
