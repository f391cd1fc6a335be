//! Batch stages: convert links, normalize them, upload the result.

mod config;
mod convert;
mod upload;

use std::path::Path;
use std::sync::Arc;

use afflink_core::{Agent, ItemRecord};
use afflink_remote::{HttpLinkConverter, RestTable, TableGateway, TableProbe};
use afflink_storage::{build_http_client, load_items, save_items};
use anyhow::{Context, Result};
use serde::Serialize;
use serde_json::{Map, Value as JsonValue};
use tracing::info;

pub use config::{ConfigFile, SyncConfig, CONFIG_PATH_ENV, DEFAULT_CONFIG_PATH};
pub use convert::{
    convert_file, convert_items, ConversionFailure, ConvertOptions, ConvertReport,
    ConvertSummary, ItemOutcome,
};
pub use upload::{
    reshape, upload_file, upload_rows, BatchFailure, UploadOptions, UploadReport, UploadSummary,
};

#[derive(Debug, Clone, Serialize)]
pub struct NormalizeSummary {
    pub path: String,
    pub total: usize,
    pub updated: usize,
    pub sha256: String,
}

/// Prepend the default scheme to every `link` missing one. Returns how many
/// records changed; a second pass always returns zero.
pub fn normalize_links(items: &mut [ItemRecord]) -> usize {
    items
        .iter_mut()
        .map(ItemRecord::normalize_link)
        .filter(|changed| *changed)
        .count()
}

/// Normalize the artifact at `path` in place.
pub async fn normalize_file(path: &Path) -> Result<NormalizeSummary> {
    let mut items = load_items(path).await?;
    info!(count = items.len(), path = %path.display(), "loaded items");
    let updated = normalize_links(&mut items);
    let stored = save_items(path, &items).await?;
    info!(updated, path = %stored.path.display(), "added https:// prefix");
    Ok(NormalizeSummary {
        path: stored.path.display().to_string(),
        total: items.len(),
        updated,
        sha256: stored.content_hash,
    })
}

/// JSON kind of every column in a sample row, in column order.
pub fn column_kinds(row: &Map<String, JsonValue>) -> Vec<(String, &'static str)> {
    row.iter()
        .map(|(name, value)| {
            let kind = match value {
                JsonValue::Null => "null",
                JsonValue::Bool(_) => "bool",
                JsonValue::Number(_) => "number",
                JsonValue::String(_) => "string",
                JsonValue::Array(_) => "array",
                JsonValue::Object(_) => "object",
            };
            (name.clone(), kind)
        })
        .collect()
}

pub async fn probe_table(table: &dyn TableGateway) -> Result<TableProbe> {
    let probe = table.probe(1).await.context("fetching sample row")?;
    info!(
        status = probe.status,
        bytes = probe.body.len(),
        content_range = probe.content_range.as_deref().unwrap_or(""),
        "table probed"
    );
    Ok(probe)
}

fn rest_table(config: &SyncConfig) -> Result<RestTable> {
    let client = build_http_client(&config.http_client())?;
    RestTable::new(client, &config.rest_table()?)
}

pub async fn run_convert(config: &SyncConfig, agent: Agent) -> Result<ConvertSummary> {
    let client = build_http_client(&config.http_client())?;
    let converter = HttpLinkConverter::new(client, config.conversion_url()?)?
        .with_timeout(config.conversion_timeout);
    let options = ConvertOptions {
        agent,
        referral_tag: config.referral_tag()?.to_string(),
        concurrency: config.concurrency,
    };
    convert_file(
        Arc::new(converter),
        &config.input_path,
        &config.output_path,
        &options,
    )
    .await
}

pub async fn run_normalize(config: &SyncConfig) -> Result<NormalizeSummary> {
    normalize_file(&config.output_path).await
}

pub async fn run_upload(config: &SyncConfig) -> Result<UploadSummary> {
    let table = rest_table(config)?;
    let options = UploadOptions {
        batch_size: config.batch_size,
        batch_delay: config.batch_delay,
    };
    upload_file(&table, &config.output_path, options).await
}

pub async fn run_probe(config: &SyncConfig) -> Result<TableProbe> {
    let table = rest_table(config)?;
    info!(endpoint = %table.endpoint(), "checking table structure");
    probe_table(&table).await
}
