use std::path::Path;
use std::time::Duration;

use afflink_core::{ItemRecord, TableRow};
use afflink_remote::{TableGateway, TableProbe};
use afflink_storage::load_items;
use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{info, info_span, warn, Instrument};
use uuid::Uuid;

#[derive(Debug, Clone, Copy)]
pub struct UploadOptions {
    pub batch_size: usize,
    pub batch_delay: Duration,
}

impl Default for UploadOptions {
    fn default() -> Self {
        Self {
            batch_size: 50,
            batch_delay: Duration::from_millis(500),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BatchFailure {
    /// One-based batch number.
    pub batch: usize,
    pub rows: usize,
    pub detail: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct UploadReport {
    pub total_rows: usize,
    pub batches: usize,
    pub uploaded: usize,
    pub failed: usize,
    pub failures: Vec<BatchFailure>,
}

#[derive(Debug, Clone, Serialize)]
pub struct UploadSummary {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub content_range: Option<String>,
    pub report: UploadReport,
}

pub fn reshape(items: &[ItemRecord]) -> Vec<TableRow> {
    items.iter().map(TableRow::from).collect()
}

/// Submit `rows` in fixed-size batches, one upsert per batch. A failed batch
/// is counted and skipped; the next batch is still sent.
pub async fn upload_rows(
    table: &dyn TableGateway,
    rows: &[TableRow],
    options: UploadOptions,
) -> UploadReport {
    let batches: Vec<&[TableRow]> = rows.chunks(options.batch_size.max(1)).collect();
    info!(
        batches = batches.len(),
        batch_size = options.batch_size,
        "splitting rows into batches"
    );

    let mut report = UploadReport {
        total_rows: rows.len(),
        batches: batches.len(),
        uploaded: 0,
        failed: 0,
        failures: Vec::new(),
    };

    for (index, batch) in batches.iter().enumerate() {
        let number = index + 1;
        info!(batch = number, of = batches.len(), rows = batch.len(), "processing batch");
        match table.upsert(batch).await {
            Ok(status) => {
                report.uploaded += batch.len();
                info!(batch = number, status, rows = batch.len(), "batch uploaded");
            }
            Err(err) => {
                report.failed += batch.len();
                warn!(batch = number, error = %err, "error processing batch");
                report.failures.push(BatchFailure {
                    batch: number,
                    rows: batch.len(),
                    detail: err.to_string(),
                });
            }
        }

        if number < batches.len() && !options.batch_delay.is_zero() {
            tokio::time::sleep(options.batch_delay).await;
        }
    }

    report
}

/// Probe the table, then reshape and upsert every record in `input`.
/// A failing probe aborts before any row is sent.
pub async fn upload_file(
    table: &dyn TableGateway,
    input: &Path,
    options: UploadOptions,
) -> Result<UploadSummary> {
    let run_id = Uuid::new_v4();
    let started_at = Utc::now();
    let span = info_span!("upload", %run_id);

    async {
        let items = load_items(input).await?;
        info!(count = items.len(), input = %input.display(), "loaded items");

        let probe: TableProbe = table.probe(1).await.context("fetching table structure")?;
        info!(content_range = probe.content_range.as_deref().unwrap_or(""), "table info");

        let rows = reshape(&items);
        let report = upload_rows(table, &rows, options).await;
        info!(
            uploaded = report.uploaded,
            failed = report.failed,
            "upload complete"
        );

        Ok(UploadSummary {
            run_id,
            started_at,
            finished_at: Utc::now(),
            content_range: probe.content_range,
            report,
        })
    }
    .instrument(span)
    .await
}
