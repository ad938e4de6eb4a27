// src/matching/manager.rs
use std::sync::Arc;
use std::time::Instant;

use anyhow::{Context, Result};
use futures::stream::{self, StreamExt};
use indicatif::MultiProgress;
use log::{error, info, warn};

use crate::candidate_generation::candidate_generation::retrieve_candidates;
use crate::embedding::job::{run_embedding_stage, EmbeddingJob};
use crate::error::MatchError;
use crate::matching::blocking::BlockingKeyGenerator;
use crate::matching::normalize::{normalize, normalize_name, NormalizedText};
use crate::matching::reference_corpus::ReferenceCorpus;
use crate::matching::scorer::rank_candidates;
use crate::matching::stage::drive_stage;
use crate::matching::store::MatchStore;
use crate::matching::tfidf::{
    count_document_frequency, weigh_record, IdfPopulation, IdfTable, TfIdfConfig, WeightMode,
};
use crate::models::core::{CustomerId, CustomerRecord, RunId, TokenWeight, BASELINE_RUN};
use crate::models::matching::{
    BatchOutcome, CandidateRecord, KeyedRecord, MatchRequest, RecordMatches, SingleOutcome,
};
use crate::models::stats_models::{BatchState, RunReport, StageStats};
use crate::utils::cancel::CancelSignal;
use crate::utils::instantiate_run::{
    create_new_run, BASELINE_RUN_DESCRIPTION, BATCH_RUN_DESCRIPTION, SINGLE_RUN_DESCRIPTION,
};
use crate::utils::logging::{log_run_completion, log_run_start, log_state_transition, StageKind, StageLogger};
use crate::utils::matching_config::MatchingConfig;
use crate::utils::progress_config::stage_bar;

/// Everything a run needs, built once per process.
pub struct MatchContext {
    pub store: Arc<dyn MatchStore>,
    pub keys: BlockingKeyGenerator,
    pub config: Arc<MatchingConfig>,
    pub embedding_job: Option<Arc<dyn EmbeddingJob>>,
    pub cancel: CancelSignal,
    pub progress: Option<MultiProgress>,
}

impl MatchContext {
    pub fn new(
        store: Arc<dyn MatchStore>,
        corpus: ReferenceCorpus,
        config: Arc<MatchingConfig>,
        embedding_job: Option<Arc<dyn EmbeddingJob>>,
        cancel: CancelSignal,
        progress: Option<MultiProgress>,
    ) -> Self {
        let keys = BlockingKeyGenerator::new(corpus, config.blocking);
        Self {
            store,
            keys,
            config,
            embedding_job,
            cancel,
            progress,
        }
    }
}

fn transition(report: &mut RunReport, to: BatchState) {
    log_state_transition(report.run_id, report.state, to);
    report.state = to;
}

/// Normalizes and keys every record, upserting keys in batches.
pub async fn run_keying_stage(
    ctx: &MatchContext,
    run_id: RunId,
    records: Vec<CustomerRecord>,
) -> Result<StageStats> {
    let logger = StageLogger::new(StageKind::Keying, run_id);
    let generator = ctx.keys.clone();
    let store = Arc::clone(&ctx.store);

    drive_stage(
        &logger,
        "keying",
        records,
        &ctx.config.pipeline,
        &ctx.cancel,
        ctx.progress.as_ref(),
        move |record: &CustomerRecord| {
            let key = generator.key_for(&record.street)?;
            Ok(vec![KeyedRecord {
                customer_id: record.customer_id,
                key,
            }])
        },
        move |batch: Vec<KeyedRecord>| {
            let store = Arc::clone(&store);
            async move { store.upsert_keys(run_id, &batch).await }
        },
    )
    .await
    .with_context(|| format!("Keying stage failed for run {}", run_id))
}

/// The idf table backing `run_id`'s weights and the population it was
/// counted over. `records` are the run's own records.
///
/// The baseline counts its own records and persists the table under run 0.
/// `Baseline` reuses run 0's stored table, recounting (without persisting)
/// when none was stored. `BaselinePlusRun` counts both populations together
/// and persists under the run; candidates are then reweighed under that
/// table at retrieval.
pub async fn idf_for_run(
    ctx: &MatchContext,
    run_id: RunId,
    records: &Arc<Vec<CustomerRecord>>,
) -> Result<(IdfTable, IdfPopulation)> {
    let tfidf = &ctx.config.tfidf;
    let population = if run_id == BASELINE_RUN {
        IdfPopulation::RunOnly
    } else {
        tfidf.idf_population
    };
    if tfidf.weight_mode == WeightMode::Frequency {
        return Ok((IdfTable::default(), population));
    }
    ctx.cancel.check("idf computation")?;

    let table = match population {
        IdfPopulation::RunOnly => {
            let df = count_document_frequency(Arc::clone(records), tfidf.granularity, tfidf.workers).await?;
            IdfTable::from_frequency(&df)
        }
        IdfPopulation::Baseline => {
            if let Some(stored) = ctx.store.load_idf(BASELINE_RUN).await? {
                return Ok((stored, population));
            }
            warn!("No stored idf for the baseline, recounting it for run {}", run_id);
            let baseline = Arc::new(ctx.store.fetch_run_records(BASELINE_RUN).await?);
            let df = count_document_frequency(baseline, tfidf.granularity, tfidf.workers).await?;
            return Ok((IdfTable::from_frequency(&df), population));
        }
        IdfPopulation::BaselinePlusRun => {
            let baseline = Arc::new(ctx.store.fetch_run_records(BASELINE_RUN).await?);
            let mut df = count_document_frequency(baseline, tfidf.granularity, tfidf.workers).await?;
            df.merge(count_document_frequency(Arc::clone(records), tfidf.granularity, tfidf.workers).await?);
            IdfTable::from_frequency(&df)
        }
    };

    let rows = ctx
        .store
        .replace_idf(run_id, &table)
        .await
        .with_context(|| format!("Failed to persist idf for run {}", run_id))?;
    info!(
        "Run {}: idf over {} documents ({}), {} tokens persisted",
        run_id,
        table.documents,
        population.as_str(),
        rows
    );
    Ok((table, population))
}

/// Weighs every record's tokens against `idf`, upserting in batches.
/// Records with neither a street nor a name are dropped.
pub async fn run_weighting_stage(
    ctx: &MatchContext,
    run_id: RunId,
    records: Vec<CustomerRecord>,
    idf: Arc<IdfTable>,
) -> Result<StageStats> {
    let logger = StageLogger::new(StageKind::Weighting, run_id);
    let tfidf = ctx.config.tfidf.clone();
    let mode = tfidf.weight_mode;
    let store = Arc::clone(&ctx.store);

    drive_stage(
        &logger,
        "weighting",
        records,
        &ctx.config.pipeline,
        &ctx.cancel,
        ctx.progress.as_ref(),
        move |record: &CustomerRecord| {
            if normalize(&record.street).is_empty() && normalize_name(&record.full_name()).is_empty() {
                return Err(MatchError::Input("record has no street and no name".to_string()));
            }
            Ok(weigh_record(record, &tfidf, &idf, run_id))
        },
        move |batch: Vec<TokenWeight>| {
            let store = Arc::clone(&store);
            async move { store.upsert_token_weights(run_id, mode, &batch).await }
        },
    )
    .await
    .with_context(|| format!("Weighting stage failed for run {}", run_id))
}

/// Takes the records stored under `run_id` through keying, weighting and
/// embedding. Derived rows of the run are replaced, so a failed run can be
/// processed again.
pub async fn process_run(ctx: &MatchContext, run_id: RunId, description: &str) -> Result<RunReport> {
    let start = Instant::now();
    let mut report = RunReport::new(run_id, description);
    let records = ctx
        .store
        .fetch_run_records(run_id)
        .await
        .with_context(|| format!("Failed to load records of run {}", run_id))?;
    log_run_start(run_id, description, records.len());

    let outcome: Result<()> = async {
        ctx.store.clear_run_outputs(run_id).await?;

        transition(&mut report, BatchState::Keying);
        let keying = run_keying_stage(ctx, run_id, records.clone()).await?;
        report.stages.push(keying);

        transition(&mut report, BatchState::Weighting);
        let shared = Arc::new(records);
        let (idf, population) = idf_for_run(ctx, run_id, &shared).await?;
        report.idf_population = population.as_str().to_string();
        report.idf_documents = idf.documents;
        let records = Arc::try_unwrap(shared).unwrap_or_else(|shared| shared.as_ref().clone());
        let weighting = run_weighting_stage(ctx, run_id, records, Arc::new(idf)).await?;
        report.stages.push(weighting);
        transition(&mut report, BatchState::Persisted);

        report.embeddings = run_embedding_stage(
            ctx.embedding_job.as_deref(),
            run_id,
            &ctx.config.embedding,
            &ctx.cancel,
        )
        .await?;
        Ok(())
    }
    .await;

    if let Err(e) = outcome {
        transition(&mut report, BatchState::Failed);
        error!("Run {} failed: {:#}", run_id, e);
        return Err(e);
    }

    report.total_elapsed_secs = start.elapsed().as_secs_f64();
    log_run_completion(run_id, start.elapsed(), &report.stages);
    Ok(report)
}

/// Rebuilds run 0: keys, idf, token weights and embeddings of the baseline.
pub async fn build_baseline(ctx: &MatchContext) -> Result<RunReport> {
    ctx.store
        .ensure_baseline_run()
        .await
        .context("Failed to register the baseline run")?;
    process_run(ctx, BASELINE_RUN, BASELINE_RUN_DESCRIPTION).await
}

/// The table a query run was weighed with, when it is not the one behind the
/// stored baseline weights.
async fn query_idf(ctx: &MatchContext, run_id: RunId) -> Result<Option<Arc<IdfTable>>> {
    let tfidf = &ctx.config.tfidf;
    if run_id == BASELINE_RUN
        || tfidf.weight_mode == WeightMode::Frequency
        || tfidf.idf_population != IdfPopulation::BaselinePlusRun
    {
        return Ok(None);
    }
    let table = ctx
        .store
        .load_idf(run_id)
        .await?
        .ok_or_else(|| MatchError::storage(format!("no idf stored for run {}", run_id)))?;
    Ok(Some(Arc::new(table)))
}

/// Recomputes candidate token weights from their records under `idf`, so the
/// overlap multiplies weights from a single table.
pub fn reweigh_candidates(candidates: &mut [CandidateRecord], tfidf: &TfIdfConfig, idf: &IdfTable) {
    for candidate in candidates.iter_mut() {
        candidate.tokens = weigh_record(&candidate.record, tfidf, idf, BASELINE_RUN)
            .into_iter()
            .map(|w| ((w.field, w.token), w.weight))
            .collect();
    }
}

/// Ranked baseline candidates for one record of a processed run.
pub async fn find_matches(
    ctx: &MatchContext,
    run_id: RunId,
    customer_id: CustomerId,
    use_vectors: bool,
) -> Result<RecordMatches> {
    let idf = query_idf(ctx, run_id).await?;
    match_record(ctx, run_id, customer_id, use_vectors, idf.as_deref()).await
}

async fn match_record(
    ctx: &MatchContext,
    run_id: RunId,
    customer_id: CustomerId,
    use_vectors: bool,
    idf: Option<&IdfTable>,
) -> Result<RecordMatches> {
    ctx.cancel.check("retrieval")?;
    let query = ctx.store.fetch_query_context(run_id, customer_id).await?;
    let retrieval = &ctx.config.retrieval;
    let mut candidates = retrieve_candidates(ctx.store.as_ref(), &query, retrieval, use_vectors).await?;
    if let Some(idf) = idf {
        reweigh_candidates(&mut candidates, &ctx.config.tfidf, idf);
    }
    let candidates = rank_candidates(&query, candidates, &ctx.config.scoring, retrieval.top_n);
    Ok(RecordMatches {
        customer_id,
        candidates,
    })
}

/// Matches every record of a processed run, `pipeline.workers` at a time.
///
/// Input errors skip the record; anything else fails the whole run.
pub async fn match_run(
    ctx: &MatchContext,
    run_id: RunId,
    use_vectors: bool,
) -> Result<(Vec<RecordMatches>, Vec<(CustomerId, String)>, StageStats)> {
    let start = Instant::now();
    let logger = StageLogger::new(StageKind::Retrieval, run_id);
    let mut stats = StageStats::new("retrieval");
    let ids = ctx.store.run_customer_ids(run_id).await?;
    let width = ctx.config.pipeline.workers.max(1);
    logger.log_start(ids.len(), width);
    let pb = stage_bar(ctx.progress.as_ref(), ids.len() as u64, "retrieval")?;
    let idf = query_idf(ctx, run_id).await?;

    let mut results = stream::iter(ids)
        .map(move |customer_id| {
            let idf = idf.clone();
            async move {
                let found = match_record(ctx, run_id, customer_id, use_vectors, idf.as_deref()).await;
                (customer_id, found)
            }
        })
        .buffer_unordered(width);

    let mut matches = Vec::new();
    let mut skipped = Vec::new();
    while let Some((customer_id, result)) = results.next().await {
        stats.received += 1;
        pb.inc(1);
        match result {
            Ok(found) => {
                stats.emitted += 1;
                matches.push(found);
            }
            Err(e) => {
                if let Some(MatchError::Input(reason)) = MatchError::classify(&e) {
                    stats.dropped += 1;
                    logger.log_dropped(customer_id, reason);
                    skipped.push((customer_id, reason.clone()));
                    continue;
                }
                pb.abandon_with_message("retrieval aborted");
                logger.log_error(&format!("{:#}", e));
                return Err(e.context(format!("Matching failed for customer {}", customer_id)));
            }
        }
    }
    pb.finish_with_message("retrieval complete");

    matches.sort_by_key(|m| m.customer_id);
    skipped.sort();
    stats.finish(start.elapsed());
    logger.log_completion(&stats);
    Ok((matches, skipped, stats))
}

/// Stores `records` under a new run, processes it and matches every record.
pub async fn match_batch(ctx: &MatchContext, records: Vec<CustomerRecord>) -> Result<BatchOutcome> {
    let start = Instant::now();
    let run_id = create_new_run(ctx.store.as_ref(), BATCH_RUN_DESCRIPTION).await?;
    let ids = ctx
        .store
        .insert_records(run_id, &records)
        .await
        .with_context(|| format!("Failed to store batch records for run {}", run_id))?;
    info!("Stored {} records under run {}", ids.len(), run_id);

    let mut run = process_run(ctx, run_id, BATCH_RUN_DESCRIPTION).await?;
    let (matches, skipped, retrieval) = match_run(ctx, run_id, run.uses_vectors()).await?;
    run.stages.push(retrieval);
    run.total_elapsed_secs = start.elapsed().as_secs_f64();
    Ok(BatchOutcome { run, skipped, matches })
}

/// Processes one record as a batch of one and returns its ranked candidates.
pub async fn match_single(ctx: &MatchContext, request: MatchRequest) -> Result<SingleOutcome> {
    NormalizedText::parse(&request.street)?;
    let run_id = create_new_run(ctx.store.as_ref(), SINGLE_RUN_DESCRIPTION).await?;
    let ids = ctx
        .store
        .insert_records(run_id, &[request.into_record()])
        .await
        .with_context(|| format!("Failed to store the record for run {}", run_id))?;
    let customer_id = *ids
        .first()
        .ok_or_else(|| MatchError::storage("insert returned no customer id"))?;

    let run = process_run(ctx, run_id, SINGLE_RUN_DESCRIPTION).await?;
    let found = find_matches(ctx, run_id, customer_id, run.uses_vectors()).await?;
    Ok(SingleOutcome {
        run_id,
        customer_id,
        uses_vectors: run.uses_vectors(),
        candidates: found.candidates,
    })
}
