mod logging;

use std::process::ExitCode;

use afflink_core::Agent;
use afflink_sync::{column_kinds, SyncConfig};
use anyhow::{anyhow, Result};
use clap::{CommandFactory, Parser, Subcommand};
use tracing::error;

#[derive(Debug, Parser)]
#[command(name = "afflink")]
#[command(about = "Convert product links to affiliate links and sync them to the product table")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Convert links from the input file to affiliate links
    Convert {
        /// Agent that receives the link when the converter answers with a bare URL
        #[arg(default_value_t = Agent::default())]
        agent: Agent,
    },
    /// Add the https:// prefix to links in the converted file
    AddHttps,
    /// Upload the converted file to the product table
    Upload,
    /// Show the columns of a sample row from the product table
    Schema,
}

async fn execute(command: Commands) -> Result<()> {
    let config = SyncConfig::from_env()?;

    match command {
        Commands::Convert { agent } => {
            let summary = afflink_sync::run_convert(&config, agent).await?;
            let report = &summary.report;
            println!(
                "conversion complete in {:.2}s: agent={} converted={}/{} failed={}/{} skipped={} output={}",
                report.elapsed.as_secs_f64(),
                summary.agent,
                report.converted,
                report.total,
                report.failed,
                report.total,
                report.skipped,
                summary.output
            );
        }
        Commands::AddHttps => {
            let summary = afflink_sync::run_normalize(&config).await?;
            println!(
                "added https:// prefix to {} of {} links in {}",
                summary.updated, summary.total, summary.path
            );
        }
        Commands::Upload => {
            let summary = afflink_sync::run_upload(&config).await?;
            let report = &summary.report;
            println!(
                "upload complete: run_id={} uploaded={} failed={} batches={}",
                summary.run_id, report.uploaded, report.failed, report.batches
            );
            for failure in &report.failures {
                println!(
                    "  batch {} ({} rows): {}",
                    failure.batch, failure.rows, failure.detail
                );
            }
        }
        Commands::Schema => {
            let probe = afflink_sync::run_probe(&config).await?;
            println!("table `{}` responded with {}", config.table, probe.status);
            let sample = probe.sample()?;
            match sample.first() {
                Some(row) => {
                    println!("sample record:");
                    for (column, kind) in column_kinds(row) {
                        println!("  {column}: {kind}");
                    }
                }
                None => println!("no data found in table"),
            }
            println!("response headers:");
            for (name, value) in &probe.headers {
                println!("  {name}: {value}");
            }
        }
    }

    Ok(())
}

/// No command prints usage and succeeds.
async fn run(command: Option<Commands>) -> Result<()> {
    let Some(command) = command else {
        Cli::command().print_help()?;
        return Ok(());
    };

    logging::init("info");

    tokio::select! {
        result = execute(command) => result,
        _ = tokio::signal::ctrl_c() => Err(anyhow!("process interrupted by user")),
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(err) => {
            let _ = err.print();
            return if err.use_stderr() {
                ExitCode::FAILURE
            } else {
                ExitCode::SUCCESS
            };
        }
    };

    let code = match run(cli.command).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            error!("{err:#}");
            ExitCode::FAILURE
        }
    };
    println!("\nDone");
    code
}
