use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};

use afflink_core::{Agent, ItemRecord};
use afflink_remote::LinkConverter;
use afflink_storage::{load_items, save_items};
use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{info, info_span, warn, Instrument};
use uuid::Uuid;

#[derive(Debug, Clone)]
pub struct ConvertOptions {
    /// Agent selected for the run; reported in logs and the summary.
    pub agent: Agent,
    pub referral_tag: String,
    pub concurrency: usize,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ItemOutcome {
    Converted { agents: usize },
    Failed(String),
    Skipped,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ConversionFailure {
    /// Zero-based position in the input file; `None` when the worker died.
    pub index: Option<usize>,
    pub reason: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct ConvertReport {
    pub total: usize,
    pub converted: usize,
    pub failed: usize,
    pub skipped: usize,
    pub elapsed: Duration,
    pub failures: Vec<ConversionFailure>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ConvertSummary {
    pub run_id: Uuid,
    pub agent: Agent,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub report: ConvertReport,
    pub output: String,
    pub output_sha256: String,
}

async fn convert_one(
    converter: &dyn LinkConverter,
    item: &mut ItemRecord,
    referral_tag: &str,
) -> ItemOutcome {
    let Some(link) = item.link().map(str::to_owned) else {
        return ItemOutcome::Skipped;
    };
    item.preserve_rawlink();

    match converter.convert(&link).await {
        Ok(payload) => {
            let links = payload.affiliate_links(referral_tag);
            let agents = links.len();
            for (agent, url) in links {
                item.set_agent_link(agent, url);
            }
            ItemOutcome::Converted { agents }
        }
        Err(err) => ItemOutcome::Failed(err.to_string()),
    }
}

/// Fan every record out to the converter with at most `concurrency` calls in
/// flight. The returned records are in input order; a failed record keeps its
/// original fields plus `rawlink`.
pub async fn convert_items(
    converter: Arc<dyn LinkConverter>,
    items: Vec<ItemRecord>,
    options: &ConvertOptions,
) -> (Vec<ItemRecord>, ConvertReport) {
    let started = Instant::now();
    let total = items.len();
    let permits = Arc::new(Semaphore::new(
        options.concurrency.clamp(1, Semaphore::MAX_PERMITS),
    ));
    let referral_tag: Arc<str> = Arc::from(options.referral_tag.as_str());

    let mut tasks = JoinSet::new();
    for (index, item) in items.iter().enumerate() {
        let converter = Arc::clone(&converter);
        let permits = Arc::clone(&permits);
        let referral_tag = Arc::clone(&referral_tag);
        let mut item = item.clone();
        tasks.spawn(async move {
            let outcome = match permits.acquire_owned().await {
                Ok(_permit) => {
                    convert_one(converter.as_ref(), &mut item, &referral_tag).await
                }
                Err(_) => ItemOutcome::Failed("worker pool closed".to_string()),
            };
            (index, item, outcome)
        });
    }

    // Slots start as the input so a worker that dies leaves its record intact.
    let mut slots = items;
    let mut report = ConvertReport {
        total,
        converted: 0,
        failed: 0,
        skipped: 0,
        elapsed: Duration::ZERO,
        failures: Vec::new(),
    };
    let mut processed = 0usize;

    while let Some(joined) = tasks.join_next().await {
        processed += 1;
        match joined {
            Ok((index, item, outcome)) => {
                slots[index] = item;
                match outcome {
                    ItemOutcome::Converted { agents } => {
                        report.converted += 1;
                        if report.converted % 10 == 0 || processed == total {
                            info!(
                                processed,
                                total,
                                converted = report.converted,
                                failed = report.failed,
                                last_agents = agents,
                                "conversion progress"
                            );
                        }
                    }
                    ItemOutcome::Failed(reason) => {
                        report.failed += 1;
                        warn!(item = index + 1, %reason, "failed item");
                        info!(
                            processed,
                            total,
                            converted = report.converted,
                            failed = report.failed,
                            "conversion progress"
                        );
                        report.failures.push(ConversionFailure {
                            index: Some(index),
                            reason,
                        });
                    }
                    ItemOutcome::Skipped => report.skipped += 1,
                }
            }
            Err(err) => {
                report.failed += 1;
                warn!(error = %err, "conversion worker aborted");
                report.failures.push(ConversionFailure {
                    index: None,
                    reason: err.to_string(),
                });
            }
        }
    }

    report.failures.sort_by_key(|f| f.index);
    report.elapsed = started.elapsed();
    (slots, report)
}

/// Load `input`, convert every record and write the full result set to `output`.
pub async fn convert_file(
    converter: Arc<dyn LinkConverter>,
    input: &Path,
    output: &Path,
    options: &ConvertOptions,
) -> Result<ConvertSummary> {
    let run_id = Uuid::new_v4();
    let started_at = Utc::now();
    let span = info_span!("convert", %run_id, agent = %options.agent);

    async {
        let items = load_items(input).await?;
        info!(count = items.len(), input = %input.display(), "loaded items");
        info!(workers = options.concurrency, "starting parallel conversion");

        let (items, report) = convert_items(converter, items, options).await;

        let stored = save_items(output, &items).await?;
        info!(
            output = %stored.path.display(),
            elapsed_secs = report.elapsed.as_secs_f64(),
            converted = report.converted,
            failed = report.failed,
            skipped = report.skipped,
            "conversion complete"
        );

        Ok(ConvertSummary {
            run_id,
            agent: options.agent,
            started_at,
            finished_at: Utc::now(),
            report,
            output: stored.path.display().to_string(),
            output_sha256: stored.content_hash,
        })
    }
    .instrument(span)
    .await
}
