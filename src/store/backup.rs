//! Tiered store backups: daily copies with weekly/monthly/yearly promotion.
//!
//! On store open, the caller asks for a backup; one is written only when the
//! current day has none yet. The tier a copy lands in is computed at write
//! time (Monday -> weekly, first of month -> monthly, Jan 1 -> yearly), and
//! pruning is a plain scan under the backup root.

use anyhow::{Context, Result};
use chrono::{Datelike, Local, NaiveDate};
use log::{debug, info, warn};
use std::path::{Path, PathBuf};

/// Weekly backups kept after pruning.
const WEEKLY_KEEP: usize = 16;
/// Monthly backups kept after pruning.
const MONTHLY_KEEP: usize = 24;
/// Yearly backups kept after pruning.
const YEARLY_KEEP: usize = 7;

const TIERS: &[&str] = &["daily", "weekly", "monthly", "yearly"];

/// Write today's backup if missing, then prune expired copies.
///
/// `retention_days` applies to the daily tier and is clamped to at least 7.
/// Returns the path of the daily backup for today (freshly written or
/// already present).
pub async fn ensure_daily_backup(
    db_path: &Path,
    backup_root: &Path,
    retention_days: u32,
) -> Result<PathBuf> {
    let today = Local::now().date_naive();
    let stem = db_path
        .file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or("tenders");
    let file_name = format!("{stem}_{}.sqlite3", today.format("%Y%m%d"));

    let daily_dir = backup_root.join("daily");
    tokio::fs::create_dir_all(&daily_dir)
        .await
        .with_context(|| format!("Failed to create backup dir: {}", daily_dir.display()))?;
    let daily_path = daily_dir.join(&file_name);

    if !daily_path.exists() {
        tokio::fs::copy(db_path, &daily_path)
            .await
            .with_context(|| format!("Failed to write backup: {}", daily_path.display()))?;
        info!("Store backup written: {}", daily_path.display());

        for tier in promotion_tiers(today) {
            let tier_dir = backup_root.join(tier);
            tokio::fs::create_dir_all(&tier_dir).await?;
            let tier_path = tier_dir.join(&file_name);
            if !tier_path.exists() {
                tokio::fs::copy(db_path, &tier_path).await?;
                debug!("Backup promoted to {tier}: {}", tier_path.display());
            }
        }
    }

    prune_backups(backup_root, retention_days.max(7)).await?;
    Ok(daily_path)
}

/// Tiers beyond daily that today's backup is promoted into.
fn promotion_tiers(date: NaiveDate) -> Vec<&'static str> {
    let mut tiers = Vec::new();
    if date.weekday() == chrono::Weekday::Mon {
        tiers.push("weekly");
    }
    if date.day() == 1 {
        tiers.push("monthly");
    }
    if date.month() == 1 && date.day() == 1 {
        tiers.push("yearly");
    }
    tiers
}

/// Prune: daily by age, the promoted tiers by count (oldest first).
pub async fn prune_backups(backup_root: &Path, retention_days: u32) -> Result<()> {
    for tier in TIERS {
        let dir = backup_root.join(tier);
        if !dir.exists() {
            continue;
        }
        let mut dated: Vec<(NaiveDate, PathBuf)> = Vec::new();
        let mut entries = tokio::fs::read_dir(&dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            match backup_date(&path) {
                Some(date) => dated.push((date, path)),
                None => debug!("Ignoring non-backup file: {}", path.display()),
            }
        }
        dated.sort();

        let expired: Vec<PathBuf> = match *tier {
            "daily" => {
                let cutoff = Local::now().date_naive()
                    - chrono::Duration::days(i64::from(retention_days));
                dated
                    .iter()
                    .filter(|(date, _)| *date < cutoff)
                    .map(|(_, path)| path.clone())
                    .collect()
            }
            "weekly" => over_count(&dated, WEEKLY_KEEP),
            "monthly" => over_count(&dated, MONTHLY_KEEP),
            _ => over_count(&dated, YEARLY_KEEP),
        };

        for path in expired {
            if let Err(err) = tokio::fs::remove_file(&path).await {
                warn!("Failed to prune backup {}: {err}", path.display());
            } else {
                debug!("Pruned backup {}", path.display());
            }
        }
    }
    Ok(())
}

fn over_count(dated: &[(NaiveDate, PathBuf)], keep: usize) -> Vec<PathBuf> {
    if dated.len() <= keep {
        return Vec::new();
    }
    dated[..dated.len() - keep]
        .iter()
        .map(|(_, path)| path.clone())
        .collect()
}

/// Parse the `_YYYYMMDD` suffix out of a backup file name.
fn backup_date(path: &Path) -> Option<NaiveDate> {
    let stem = path.file_stem()?.to_str()?;
    let (_, date_part) = stem.rsplit_once('_')?;
    NaiveDate::parse_from_str(date_part, "%Y%m%d").ok()
}
