use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use arrow_array::{Date32Array, RecordBatch, StringArray, UInt64Array};
use arrow_schema::{DataType, Field as ArrowField, Schema};
use chrono::NaiveDate;
use parquet::arrow::ArrowWriter;
use rollup_core::SnapshotRecord;
use serde::Serialize;
use sha2::{Digest, Sha256};
use tokio::fs;

use crate::runner::RunSummary;

#[derive(Debug, Clone, Serialize)]
pub struct ParquetManifest {
    pub schema_version: u32,
    pub files: Vec<ParquetManifestFile>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ParquetManifestFile {
    pub name: String,
    pub path: String,
    pub sha256: String,
    pub bytes: u64,
    pub rows: usize,
}

/// Writes `<root>/<run_id>/run_summary.json` and `run_brief.md`.
pub async fn write_run_report<O: Serialize>(
    reports_root: &Path,
    summary: &RunSummary,
    written: &[O],
) -> Result<PathBuf> {
    let reports_dir = reports_root.join(summary.run_id.to_string());
    fs::create_dir_all(&reports_dir)
        .await
        .with_context(|| format!("creating {}", reports_dir.display()))?;

    let json = serde_json::to_vec_pretty(&serde_json::json!({
        "summary": summary,
        "written": written,
    }))
    .context("serializing run summary")?;
    fs::write(reports_dir.join("run_summary.json"), json)
        .await
        .context("writing run_summary.json")?;

    fs::write(reports_dir.join("run_brief.md"), run_brief(summary))
        .await
        .context("writing run_brief.md")?;

    Ok(reports_dir)
}

fn run_brief(summary: &RunSummary) -> String {
    let mut lines = vec![
        format!("# Run `{}`", summary.job_id),
        String::new(),
        format!("- Run ID: `{}`", summary.run_id),
        format!("- Kind: {}", summary.kind.as_str()),
        format!("- Window: {}", summary.window),
        format!("- Started: {}", summary.started_at),
        format!("- Finished: {}", summary.finished_at),
        format!("- Status: **{}**", summary.status.as_str()),
        String::new(),
        "## Counts".to_string(),
        format!(
            "- Chunks: {} processed, {} failed",
            summary.chunks_processed, summary.chunks_failed
        ),
        format!(
            "- Records: {} scanned, {} folded, {} already folded",
            summary.folds.records_scanned, summary.folds.records_folded, summary.folds.already_folded
        ),
        format!(
            "- Skipped: {} invalid timestamp, {} missing owner",
            summary.folds.skipped_invalid_timestamp, summary.folds.skipped_missing_owner
        ),
        format!(
            "- Outputs: {} touched, {} inserted, {} updated, {} unchanged, {} suppressed",
            summary.buckets_touched,
            summary.records_inserted,
            summary.records_updated,
            summary.records_unchanged,
            summary.reminders_suppressed
        ),
    ];
    if summary.write_failures > 0 {
        lines.push(format!("- Write failures: {}", summary.write_failures));
    }
    if let Some(error) = &summary.error {
        lines.push(String::new());
        lines.push(format!("> {error}"));
    }
    lines.push(String::new());
    lines.join("\n")
}

/// Exports snapshots to `<reports_dir>/snapshots/snapshots.parquet`, one row
/// per bucket and measure, plus a `manifest.json` next to it.
pub async fn export_snapshots_parquet(reports_dir: &Path, snapshots: &[SnapshotRecord]) -> Result<PathBuf> {
    let snapshot_dir = reports_dir.join("snapshots");
    fs::create_dir_all(&snapshot_dir)
        .await
        .with_context(|| format!("creating {}", snapshot_dir.display()))?;

    let parquet_path = snapshot_dir.join("snapshots.parquet");
    let rows = write_snapshots_parquet(&parquet_path, snapshots)?;

    let manifest = ParquetManifest {
        schema_version: 1,
        files: vec![manifest_entry("snapshots", reports_dir, &parquet_path, rows)?],
    };
    let manifest_path = snapshot_dir.join("manifest.json");
    let bytes = serde_json::to_vec_pretty(&manifest).context("serializing parquet manifest")?;
    fs::write(&manifest_path, bytes)
        .await
        .with_context(|| format!("writing {}", manifest_path.display()))?;
    Ok(manifest_path)
}

fn write_parquet(path: &Path, batch: RecordBatch) -> Result<()> {
    let file = File::create(path).with_context(|| format!("creating {}", path.display()))?;
    let mut writer = ArrowWriter::try_new(file, batch.schema(), None)
        .with_context(|| format!("opening parquet writer {}", path.display()))?;
    writer
        .write(&batch)
        .with_context(|| format!("writing record batch {}", path.display()))?;
    writer
        .close()
        .with_context(|| format!("closing parquet writer {}", path.display()))?;
    Ok(())
}

fn days_since_epoch(date: NaiveDate) -> i32 {
    let epoch = NaiveDate::from_ymd_opt(1970, 1, 1).unwrap_or_default();
    (date - epoch).num_days() as i32
}

fn write_snapshots_parquet(path: &Path, snapshots: &[SnapshotRecord]) -> Result<usize> {
    let rows: Vec<(&SnapshotRecord, &str, String)> = snapshots
        .iter()
        .flat_map(|s| {
            s.totals
                .iter()
                .map(move |(measure, total)| (s, measure.as_str(), total.to_string()))
        })
        .collect();

    let schema = Arc::new(Schema::new(vec![
        ArrowField::new("bucket_key", DataType::Utf8, false),
        ArrowField::new("period_start", DataType::Date32, false),
        ArrowField::new("period_end", DataType::Date32, false),
        ArrowField::new("source_count", DataType::UInt64, false),
        ArrowField::new("measure", DataType::Utf8, false),
        ArrowField::new("total", DataType::Utf8, false),
    ]));

    let bucket_keys = StringArray::from(
        rows.iter()
            .map(|(s, _, _)| Some(s.bucket.to_string()))
            .collect::<Vec<_>>(),
    );
    let period_starts = Date32Array::from(
        rows.iter()
            .map(|(s, _, _)| days_since_epoch(s.period_start))
            .collect::<Vec<_>>(),
    );
    let period_ends = Date32Array::from(
        rows.iter()
            .map(|(s, _, _)| days_since_epoch(s.period_end))
            .collect::<Vec<_>>(),
    );
    let source_counts = UInt64Array::from(rows.iter().map(|(s, _, _)| s.source_count).collect::<Vec<_>>());
    let measures = StringArray::from(rows.iter().map(|(_, m, _)| Some(*m)).collect::<Vec<_>>());
    let totals = StringArray::from(
        rows.iter()
            .map(|(_, _, t)| Some(t.as_str()))
            .collect::<Vec<_>>(),
    );

    let batch = RecordBatch::try_new(
        schema,
        vec![
            Arc::new(bucket_keys),
            Arc::new(period_starts),
            Arc::new(period_ends),
            Arc::new(source_counts),
            Arc::new(measures),
            Arc::new(totals),
        ],
    )
    .context("building snapshots record batch")?;
    write_parquet(path, batch)?;
    Ok(rows.len())
}

fn manifest_entry(name: &str, reports_dir: &Path, path: &Path, rows: usize) -> Result<ParquetManifestFile> {
    let bytes = std::fs::read(path).with_context(|| format!("reading {}", path.display()))?;
    let mut hasher = Sha256::new();
    hasher.update(&bytes);
    let sha256 = hex::encode(hasher.finalize());
    let rel = path
        .strip_prefix(reports_dir)
        .unwrap_or(path)
        .display()
        .to_string();
    Ok(ParquetManifestFile {
        name: name.to_string(),
        path: rel,
        sha256,
        bytes: bytes.len() as u64,
        rows,
    })
}
