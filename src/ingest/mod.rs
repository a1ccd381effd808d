//! Import previously exported scrape files back into the datastore.
//!
//! Each imported file becomes its own run (scope `import`) whose rows
//! replace anything previously attached to that run and reconcile into the
//! current state through the usual canonical-pair upsert. The source file
//! path is recorded as the run's output path, which doubles as the
//! already-imported marker on later sweeps.

use anyhow::{Context, Result};
use log::{info, warn};
use std::collections::HashMap;
use std::path::{Path, PathBuf};

use crate::store::{RunOutcome, ScopeMode, TenderRecord, TenderStore};
use crate::tender_id::{extract_tender_id_from_title, is_valid_canonical_id, normalize_tender_id};

/// Export columns that identify a scrape export (at least two must match).
const SIGNAL_COLUMNS: &[&str] = &[
    "Department Name",
    "Title and Ref.No./Tender ID",
    "Tender ID (Extracted)",
    "Direct URL",
    "Status URL",
];

/// Outcome of importing one file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImportOutcome {
    pub run_id: i64,
    pub portal_name: String,
    pub imported_rows: u64,
    pub dropped_rows: u64,
}

/// Header-position lookup tolerant of the `e-Published Date` spelling.
struct ColumnMap(HashMap<String, usize>);

impl ColumnMap {
    fn from_headers(headers: &csv::StringRecord) -> Self {
        let mut map = HashMap::new();
        for (idx, header) in headers.iter().enumerate() {
            let name = header.trim_start_matches('\u{feff}').trim();
            let canonical = match name {
                "e-Published Date" => "Published Date",
                "Department" => "Department Name",
                other => other,
            };
            map.insert(canonical.to_string(), idx);
        }
        Self(map)
    }

    fn get<'r>(&self, record: &'r csv::StringRecord, column: &str) -> &'r str {
        self.0
            .get(column)
            .and_then(|idx| record.get(*idx))
            .map(str::trim)
            .unwrap_or("")
    }

    fn signal_count(&self) -> usize {
        SIGNAL_COLUMNS
            .iter()
            .filter(|column| self.0.contains_key(**column))
            .count()
    }
}

/// True when the CSV headers look like one of our scrape exports rather
/// than some unrelated spreadsheet.
fn looks_like_scrape_export(columns: &ColumnMap) -> bool {
    columns.signal_count() >= 2
}

/// Portal name for a file: the `Portal` column when present, else the
/// export file stem up to `_tenders_`.
fn infer_portal_name(path: &Path, columns: &ColumnMap, first_row: Option<&csv::StringRecord>) -> String {
    if let Some(row) = first_row {
        let from_column = columns.get(row, "Portal");
        if !from_column.is_empty() {
            return from_column.to_string();
        }
    }
    let stem = path.file_stem().and_then(|s| s.to_str()).unwrap_or("imported");
    match stem.split_once("_tenders_") {
        Some((keyword, _)) => keyword.trim_end_matches("_partial").to_string(),
        None => stem.to_string(),
    }
}

/// Parse an exported CSV into store records. Rows without a usable
/// canonical id are dropped and counted.
pub fn parse_export_csv(path: &Path) -> Result<(String, Vec<TenderRecord>, u64)> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read export file: {}", path.display()))?;
    let raw = raw.trim_start_matches('\u{feff}');

    let mut reader = csv::Reader::from_reader(raw.as_bytes());
    let headers = reader.headers()?.clone();
    let columns = ColumnMap::from_headers(&headers);
    if !looks_like_scrape_export(&columns) {
        anyhow::bail!("{} does not look like a scrape export", path.display());
    }

    let records: Vec<csv::StringRecord> = reader
        .records()
        .collect::<std::result::Result<_, _>>()
        .with_context(|| format!("Failed to parse export file: {}", path.display()))?;
    let portal_name = infer_portal_name(path, &columns, records.first());

    let mut rows = Vec::new();
    let mut dropped = 0u64;
    for record in &records {
        let title_ref = columns.get(record, "Title and Ref.No./Tender ID").to_string();
        let mut tender_id = normalize_tender_id(columns.get(record, "Tender ID (Extracted)"));
        if !is_valid_canonical_id(&tender_id) {
            tender_id = extract_tender_id_from_title(&title_ref);
        }
        if !is_valid_canonical_id(&tender_id) {
            dropped += 1;
            continue;
        }

        let emd_amount = columns.get(record, "EMD Amount").to_string();
        let emd_amount_numeric = emd_amount.replace(',', "").parse::<f64>().ok();
        rows.push(TenderRecord {
            portal_name: portal_name.clone(),
            department_name: columns.get(record, "Department Name").to_string(),
            tender_id,
            published_date: columns.get(record, "Published Date").to_string(),
            closing_date: columns.get(record, "Closing Date").to_string(),
            opening_date: columns.get(record, "Opening Date").to_string(),
            title_ref,
            organisation_chain: columns.get(record, "Organisation Chain").to_string(),
            direct_url: columns.get(record, "Direct URL").to_string(),
            status_url: columns.get(record, "Status URL").to_string(),
            emd_amount,
            emd_amount_numeric,
        });
    }

    Ok((portal_name, rows, dropped))
}

/// Import one exported CSV as a new `import` run.
pub async fn import_export_file(
    store: &TenderStore,
    path: &Path,
    portal_override: Option<&str>,
) -> Result<ImportOutcome> {
    let (inferred_portal, rows, dropped) = parse_export_csv(path)?;
    let portal_name = portal_override
        .map(str::to_string)
        .unwrap_or(inferred_portal);
    if rows.is_empty() {
        anyhow::bail!("{} contains no importable rows", path.display());
    }

    let file_abs = path
        .canonicalize()
        .unwrap_or_else(|_| path.to_path_buf())
        .to_string_lossy()
        .to_string();
    let run_id = store
        .start_run(&portal_name, "imported://export", ScopeMode::Import)
        .await?;
    let saved = store.replace_run_tenders(run_id, &rows).await?;
    store
        .finalize_run(
            run_id,
            &RunOutcome {
                status: "imported".to_string(),
                expected_total: rows.len() as u64,
                extracted_total: saved,
                skipped_existing_total: 0,
                partial_saved: false,
                output_file_path: Some(file_abs),
                output_file_type: Some("csv".to_string()),
            },
        )
        .await?;

    info!(
        "Imported {saved} row(s) from {} into run {run_id} for '{portal_name}'",
        path.display()
    );
    if dropped > 0 {
        warn!("{dropped} row(s) without a canonical tender id dropped from {}", path.display());
    }
    Ok(ImportOutcome {
        run_id,
        portal_name,
        imported_rows: saved,
        dropped_rows: dropped,
    })
}

/// Candidate export files under a directory, newest first, filtered to CSVs
/// modified within the last `days` and capped at `max_files`.
pub fn collect_export_files(source_dir: &Path, days: u32, max_files: usize) -> Result<Vec<PathBuf>> {
    let cutoff = std::time::SystemTime::now()
        - std::time::Duration::from_secs(u64::from(days.max(1)) * 86_400);
    let mut candidates: Vec<(std::time::SystemTime, PathBuf)> = Vec::new();

    let mut stack = vec![source_dir.to_path_buf()];
    while let Some(dir) = stack.pop() {
        let entries = std::fs::read_dir(&dir)
            .with_context(|| format!("Failed to read source dir: {}", dir.display()))?;
        for entry in entries {
            let entry = entry?;
            let path = entry.path();
            if path.is_dir() {
                stack.push(path);
                continue;
            }
            let is_csv = path
                .extension()
                .and_then(|e| e.to_str())
                .map(|e| e.eq_ignore_ascii_case("csv"))
                .unwrap_or(false);
            if !is_csv {
                continue;
            }
            let modified = entry.metadata()?.modified()?;
            if modified >= cutoff {
                candidates.push((modified, path));
            }
        }
    }

    candidates.sort_by(|a, b| b.0.cmp(&a.0));
    candidates.truncate(max_files.max(1));
    Ok(candidates.into_iter().map(|(_, path)| path).collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    const EXPORT_CSV: &str = "\u{feff}Department Name,S.No,e-Published Date,Closing Date,Opening Date,Organisation Chain,Title and Ref.No./Tender ID,Tender ID (Extracted),Direct URL,Status URL\n\
Roads,1,01/12/2026,31/12/2026 15:00,01/01/2027 10:00,HP PWD,Road works [2026_HP_1001_1],2026_HP_1001_1,https://x/app?id=1,\n\
Roads,2,01/12/2026,31/12/2026 15:00,01/01/2027 10:00,HP PWD,No id here,,https://x/app?id=2,\n";

    #[test]
    fn test_parse_export_csv_maps_columns_and_drops_idless_rows() {
        let dir = TempDir::new().expect("temp dir");
        let path = dir.path().join("hptenders_gov_in_tenders_20260801_120000.csv");
        std::fs::write(&path, EXPORT_CSV).expect("write export");

        let (portal, rows, dropped) = parse_export_csv(&path).expect("parse");
        assert_eq!(portal, "hptenders_gov_in");
        assert_eq!(rows.len(), 1);
        assert_eq!(dropped, 1);
        let row = &rows[0];
        assert_eq!(row.tender_id, "2026_HP_1001_1");
        assert_eq!(row.published_date, "01/12/2026");
        assert_eq!(row.department_name, "Roads");
    }

    #[test]
    fn test_partial_stem_strips_marker() {
        let dir = TempDir::new().expect("temp dir");
        let path = dir.path().join("hptenders_gov_in_partial_tenders_20260801_120000.csv");
        std::fs::write(&path, EXPORT_CSV).expect("write export");
        let (portal, _, _) = parse_export_csv(&path).expect("parse");
        assert_eq!(portal, "hptenders_gov_in");
    }

    #[test]
    fn test_non_export_csv_rejected() {
        let dir = TempDir::new().expect("temp dir");
        let path = dir.path().join("random.csv");
        std::fs::write(&path, "a,b,c\n1,2,3\n").expect("write csv");
        assert!(parse_export_csv(&path).is_err());
    }

    #[tokio::test]
    async fn test_import_creates_run_and_current_state() {
        let dir = TempDir::new().expect("temp dir");
        let path = dir.path().join("hptenders_gov_in_tenders_20260801_120000.csv");
        std::fs::write(&path, EXPORT_CSV).expect("write export");

        let store = TenderStore::open(&dir.path().join("tenders.sqlite3"))
            .await
            .expect("open store");
        let outcome = import_export_file(&store, &path, Some("HP Tenders"))
            .await
            .expect("import");

        assert_eq!(outcome.imported_rows, 1);
        assert_eq!(outcome.dropped_rows, 1);
        assert_eq!(outcome.portal_name, "HP Tenders");
        assert_eq!(
            store.tender_count_for_portal("HP Tenders").await.expect("count"),
            1
        );

        let paths = store.recorded_output_paths().await.expect("paths");
        assert_eq!(paths.len(), 1);
    }

    #[test]
    fn test_collect_export_files_filters_and_orders() {
        let dir = TempDir::new().expect("temp dir");
        std::fs::write(dir.path().join("one_tenders_a.csv"), EXPORT_CSV).expect("write");
        std::fs::write(dir.path().join("ignore.xlsx"), b"not csv").expect("write");
        let nested = dir.path().join("nested");
        std::fs::create_dir_all(&nested).expect("mkdir");
        std::fs::write(nested.join("two_tenders_b.csv"), EXPORT_CSV).expect("write");

        let files = collect_export_files(dir.path(), 30, 10).expect("collect");
        assert_eq!(files.len(), 2);
        assert!(files.iter().all(|p| p.extension().unwrap() == "csv"));
    }
}
