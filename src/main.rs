// src/main.rs
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use indicatif::{ProgressBar, ProgressStyle};
use log::{error, info, warn};
use serde::Serialize;

use matcher_lib::embedding::job::{EmbeddingJob, ScriptEmbeddingJob};
use matcher_lib::error::SuccessPayload;
use matcher_lib::matching::db::PgMatchStore;
use matcher_lib::matching::manager::{build_baseline, match_batch, match_single, MatchContext};
use matcher_lib::matching::reference_corpus::{ReferenceCorpus, DEFAULT_REFERENCE_SIZE};
use matcher_lib::models::matching::MatchRequest;
use matcher_lib::utils::cancel::CancelSignal;
use matcher_lib::utils::db_connect::{connect, get_pool_status, PgPool};
use matcher_lib::utils::env::load_env;
use matcher_lib::utils::get_memory_usage;
use matcher_lib::utils::matching_config::MatchingConfig;
use matcher_lib::utils::progress_config::ProgressConfig;
use matcher_lib::utils::record_source::read_batch_csv;
use matcher_lib::ErrorPayload;

#[derive(Parser, Debug)]
#[command(name = "matcher", about = "Fuzzy customer record matching against the baseline population")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Derive the reference corpus from the baseline's most frequent streets
    Reference {
        /// Number of reference entities to keep
        #[arg(long, default_value_t = DEFAULT_REFERENCE_SIZE)]
        size: usize,
    },
    /// Rebuild keys, token weights and embeddings of the baseline (run 0)
    Baseline,
    /// Match every record of a CSV file against the baseline
    Batch {
        /// CSV with first_name,last_name,phone_number,street,city,state,zip_code
        csv: PathBuf,
    },
    /// Match one record against the baseline. Any failure, including
    /// startup, is printed as a JSON error payload
    Single {
        #[arg(long)]
        first_name: String,
        #[arg(long)]
        last_name: String,
        #[arg(long, default_value = "")]
        phone_number: String,
        #[arg(long)]
        street: String,
        #[arg(long, default_value = "")]
        city: String,
        #[arg(long, default_value = "")]
        state: String,
        #[arg(long, default_value = "")]
        zip_code: String,
    },
}

impl Command {
    /// Commands whose failures are reported on stdout as an `ErrorPayload`.
    fn reports_errors_as_json(&self) -> bool {
        matches!(self, Command::Single { .. })
    }
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    let body = serde_json::to_string_pretty(value).context("Failed to serialize output")?;
    println!("{}", body);
    Ok(())
}

async fn phase_message(pb: &ProgressBar, phase: &str, config: &ProgressConfig, pool: &PgPool) {
    let mut parts = Vec::new();
    if config.should_show_memory() {
        parts.push(format!("Memory: {} MB", get_memory_usage().await));
    }
    if config.should_show_db_connection_stats() {
        let (size, available, _in_use) = get_pool_status(pool);
        parts.push(format!("DB: {}/{} (used/total)", size - available, size));
    }
    if parts.is_empty() {
        pb.set_message(phase.to_string());
    } else {
        pb.set_message(format!("{} ({})", phase, parts.join(", ")));
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::init();
    load_env();
    let cli = Cli::parse();
    info!("Starting customer matcher: {:?}", cli.command);

    let json_errors = cli.command.reports_errors_as_json();
    if let Err(e) = run(cli).await {
        if json_errors {
            error!("Single record match failed: {:#}", e);
            print_json(&ErrorPayload::from(&e))?;
            std::process::exit(1);
        }
        return Err(e);
    }
    Ok(())
}

async fn run(cli: Cli) -> Result<()> {
    let config = MatchingConfig::from_env().context("Invalid matching configuration")?;
    config.log_config();
    let config = Arc::new(config);

    let progress_config = ProgressConfig::from_env();
    info!(
        "Progress tracking: enabled={}, detailed={}",
        progress_config.enabled, progress_config.detailed
    );
    let multi_progress = progress_config.create_multi_progress();
    let main_pb = match &multi_progress {
        Some(mp) => {
            let pb = mp.add(ProgressBar::new(2));
            pb.set_style(
                ProgressStyle::default_bar()
                    .template("{spinner:.green} [{elapsed_precise}] {bar:40.cyan/blue} {pos}/{len} {msg}")
                    .context("Failed to set main progress bar style")?
                    .progress_chars("#>-"),
            );
            pb
        }
        None => ProgressBar::hidden(),
    };

    let mut phase_times = HashMap::new();
    let total_start = Instant::now();

    // Phase 1: connection and reference corpus
    let phase_start = Instant::now();
    let pool = connect().await.context("Failed to connect to database")?;
    let store = Arc::new(PgMatchStore::new(pool.clone()));
    let corpus = match &cli.command {
        Command::Reference { size } => {
            phase_message(&main_pb, "Rebuilding reference corpus", &progress_config, &pool).await;
            ReferenceCorpus::rebuild(store.as_ref(), *size).await?
        }
        _ => {
            phase_message(&main_pb, "Loading reference corpus", &progress_config, &pool).await;
            ReferenceCorpus::load(store.as_ref()).await?
        }
    };
    phase_times.insert("startup".to_string(), phase_start.elapsed());
    main_pb.inc(1);

    let cancel = CancelSignal::new();
    let ctrl_c = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupt received, cancelling the current run");
            ctrl_c.cancel();
        }
    });

    let embedding_job: Option<Arc<dyn EmbeddingJob>> = if config.embedding.enabled {
        Some(Arc::new(ScriptEmbeddingJob::new(&config.embedding)))
    } else {
        None
    };
    let ctx = MatchContext::new(
        store,
        corpus,
        Arc::clone(&config),
        embedding_job,
        cancel,
        progress_config.stage_progress(&multi_progress),
    );

    // Phase 2: the requested command
    let phase_start = Instant::now();
    match cli.command {
        Command::Reference { .. } => {
            print_json(&SuccessPayload::new(
                format!("Stored {} reference entities", ctx.keys.corpus().len()),
                ctx.keys.corpus().entities(),
            ))?;
        }
        Command::Baseline => {
            phase_message(&main_pb, "Building baseline", &progress_config, &pool).await;
            let report = build_baseline(&ctx).await?;
            print_json(&SuccessPayload::new(
                format!("Baseline rebuilt for run {}", report.run_id),
                report,
            ))?;
        }
        Command::Batch { csv } => {
            phase_message(&main_pb, "Matching batch", &progress_config, &pool).await;
            let records = read_batch_csv(&csv)?;
            let outcome = match_batch(&ctx, records).await?;
            print_json(&SuccessPayload::new(
                format!(
                    "Matched {} records in run {}",
                    outcome.matches.len(),
                    outcome.run.run_id
                ),
                outcome,
            ))?;
        }
        Command::Single {
            first_name,
            last_name,
            phone_number,
            street,
            city,
            state,
            zip_code,
        } => {
            phase_message(&main_pb, "Matching record", &progress_config, &pool).await;
            let request = MatchRequest {
                first_name,
                last_name,
                phone_number,
                street,
                city,
                state,
                zip_code,
            };
            let outcome = match_single(&ctx, request).await?;
            print_json(&SuccessPayload::new(
                format!("Found {} candidates", outcome.candidates.len()),
                outcome,
            ))?;
        }
    }
    phase_times.insert("command".to_string(), phase_start.elapsed());
    main_pb.inc(1);
    main_pb.finish_with_message("Done");

    info!("Customer matcher finished in {:.2?}", total_start.elapsed());
    for (phase, duration) in &phase_times {
        info!("  {}: {:.2?}", phase, duration);
    }
    let (size, idle, in_use) = get_pool_status(&pool);
    info!("DB pool at exit: {} connections, {} idle, {} in use", size, idle, in_use);
    Ok(())
}
