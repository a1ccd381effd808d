//! Tabular exports of scraped tenders.
//!
//! Preferred writer is an xlsx workbook; when that fails the exporter falls
//! back to UTF-8 CSV with a BOM so spreadsheet tools pick up the encoding.
//! Output is a deterministic function of the rows: same input, same bytes,
//! only the timestamp in the filename varies.

use anyhow::{Context, Result};
use log::{info, warn};
use std::io::Write;
use std::path::{Path, PathBuf};

use crate::store::{ExportRow, TenderStore};

/// Column order of every export.
pub const EXPORT_COLUMNS: [&str; 10] = [
    "Department Name",
    "S.No",
    "e-Published Date",
    "Closing Date",
    "Opening Date",
    "Organisation Chain",
    "Title and Ref.No./Tender ID",
    "Tender ID (Extracted)",
    "Direct URL",
    "Status URL",
];

/// Which writer produced the file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExportKind {
    Excel,
    Csv,
}

impl ExportKind {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Excel => "excel",
            Self::Csv => "csv",
        }
    }
}

/// Export one run's rows. Returns `None` when the run has no rows (no file
/// is written for an empty run).
pub async fn export_run(
    store: &TenderStore,
    run_id: i64,
    out_dir: &Path,
    keyword: &str,
    partial: bool,
) -> Result<Option<(PathBuf, ExportKind)>> {
    let rows = store.export_rows_for_run(run_id).await?;
    write_export(&rows, out_dir, keyword, partial)
}

/// Export a portal's full current state.
pub async fn export_portal_current(
    store: &TenderStore,
    portal_name: &str,
    out_dir: &Path,
    keyword: &str,
) -> Result<Option<(PathBuf, ExportKind)>> {
    let rows = store.export_rows_for_portal(portal_name).await?;
    write_export(&rows, out_dir, keyword, false)
}

/// Write rows to `<keyword>[_partial]_tenders_<YYYYmmdd_HHMMSS>.{xlsx,csv}`.
pub fn write_export(
    rows: &[ExportRow],
    out_dir: &Path,
    keyword: &str,
    partial: bool,
) -> Result<Option<(PathBuf, ExportKind)>> {
    if rows.is_empty() {
        return Ok(None);
    }
    std::fs::create_dir_all(out_dir)
        .with_context(|| format!("Failed to create export dir: {}", out_dir.display()))?;

    let timestamp = chrono::Local::now().format("%Y%m%d_%H%M%S");
    let suffix = if partial { "_partial" } else { "" };
    let stem = format!("{keyword}{suffix}_tenders_{timestamp}");

    let xlsx_path = out_dir.join(format!("{stem}.xlsx"));
    match write_xlsx(rows, &xlsx_path) {
        Ok(()) => {
            info!("Export written: {}", xlsx_path.display());
            Ok(Some((xlsx_path, ExportKind::Excel)))
        }
        Err(err) => {
            warn!("Workbook writer failed ({err}); falling back to CSV");
            let csv_path = out_dir.join(format!("{stem}.csv"));
            write_csv(rows, &csv_path)?;
            info!("Export written: {}", csv_path.display());
            Ok(Some((csv_path, ExportKind::Csv)))
        }
    }
}

fn row_cells(row: &ExportRow, s_no: usize) -> [String; 10] {
    [
        row.department_name.clone(),
        s_no.to_string(),
        row.published_date.clone(),
        row.closing_date.clone(),
        row.opening_date.clone(),
        row.organisation_chain.clone(),
        row.title_ref.clone(),
        row.tender_id_extracted.clone(),
        row.direct_url.clone(),
        row.status_url.clone(),
    ]
}

fn write_xlsx(rows: &[ExportRow], path: &Path) -> Result<()> {
    let mut workbook = rust_xlsxwriter::Workbook::new();
    let worksheet = workbook.add_worksheet();

    for (col, header) in EXPORT_COLUMNS.iter().enumerate() {
        worksheet.write_string(0, col as u16, *header)?;
    }
    for (idx, row) in rows.iter().enumerate() {
        let cells = row_cells(row, idx + 1);
        for (col, value) in cells.iter().enumerate() {
            worksheet.write_string(idx as u32 + 1, col as u16, value)?;
        }
    }

    workbook.save(path)?;
    Ok(())
}

fn write_csv(rows: &[ExportRow], path: &Path) -> Result<()> {
    let mut file = std::fs::File::create(path)
        .with_context(|| format!("Failed to create export file: {}", path.display()))?;
    // BOM so spreadsheet tools detect UTF-8.
    file.write_all(b"\xef\xbb\xbf")?;

    let mut writer = csv::Writer::from_writer(file);
    writer.write_record(EXPORT_COLUMNS)?;
    for (idx, row) in rows.iter().enumerate() {
        writer.write_record(row_cells(row, idx + 1))?;
    }
    writer.flush()?;
    Ok(())
}
