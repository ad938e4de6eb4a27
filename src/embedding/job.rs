// src/embedding/job.rs
use std::path::Path;
use std::process::Stdio;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use log::{info, warn};
use tokio::process::{Child, Command};
use tokio::time::Instant;

use crate::error::MatchError;
use crate::models::core::RunId;
use crate::models::stats_models::EmbeddingOutcome;
use crate::utils::cancel::CancelSignal;
use crate::utils::logging::{StageKind, StageLogger};

#[derive(Debug, Clone, PartialEq)]
pub struct EmbeddingConfig {
    pub enabled: bool,
    pub script_path: String,
    pub interpreter: String,
    pub timeout: Duration,
    pub poll_interval: Duration,
    /// Keep matching on blocking keys alone when the job fails.
    pub allow_key_only_fallback: bool,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            script_path: "./python-ml/generate_embeddings.py".to_string(),
            interpreter: "python3".to_string(),
            timeout: Duration::from_secs(600),
            poll_interval: Duration::from_millis(500),
            allow_key_only_fallback: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobStatus {
    Running,
    Succeeded,
    Failed(String),
}

/// A submitted embedding job.
#[async_trait]
pub trait RunningJob: Send {
    async fn poll(&mut self) -> Result<JobStatus>;

    /// Best effort stop, used on timeout and cancellation.
    async fn abort(&mut self);
}

/// Out-of-process producer of `customer_vector_embedding` rows for a run.
#[async_trait]
pub trait EmbeddingJob: Send + Sync {
    async fn submit(&self, run_id: RunId) -> Result<Box<dyn RunningJob>>;
}

/// Runs `<interpreter> <script> <run_id>` and watches the child process.
#[derive(Debug, Clone)]
pub struct ScriptEmbeddingJob {
    interpreter: String,
    script_path: String,
}

impl ScriptEmbeddingJob {
    pub fn new(config: &EmbeddingConfig) -> Self {
        Self {
            interpreter: config.interpreter.clone(),
            script_path: config.script_path.clone(),
        }
    }
}

struct ScriptRun {
    run_id: RunId,
    child: Child,
}

#[async_trait]
impl RunningJob for ScriptRun {
    async fn poll(&mut self) -> Result<JobStatus> {
        let status = self
            .child
            .try_wait()
            .with_context(|| format!("Failed to poll embedding process for run {}", self.run_id))?;
        Ok(match status {
            None => JobStatus::Running,
            Some(exit) if exit.success() => JobStatus::Succeeded,
            Some(exit) => JobStatus::Failed(format!(
                "embedding script exited with code {}",
                exit.code().unwrap_or(-1)
            )),
        })
    }

    async fn abort(&mut self) {
        if let Err(e) = self.child.kill().await {
            warn!("Failed to stop embedding process for run {}: {}", self.run_id, e);
        }
    }
}

#[async_trait]
impl EmbeddingJob for ScriptEmbeddingJob {
    async fn submit(&self, run_id: RunId) -> Result<Box<dyn RunningJob>> {
        if !Path::new(&self.script_path).exists() {
            return Err(MatchError::Collaborator(format!(
                "embedding script {} not found",
                self.script_path
            ))
            .into());
        }
        let mut cmd = Command::new(&self.interpreter);
        cmd.arg(&self.script_path)
            .arg(run_id.to_string())
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .kill_on_drop(true);
        let child = cmd.spawn().context(MatchError::Collaborator(format!(
            "failed to launch {} {}",
            self.interpreter, self.script_path
        )))?;
        info!("Submitted embedding job for run {} ({})", run_id, self.script_path);
        Ok(Box::new(ScriptRun { run_id, child }))
    }
}

/// Submits the job and polls until it finishes, fails, times out or the
/// run is cancelled.
pub async fn await_embeddings(
    job: &dyn EmbeddingJob,
    run_id: RunId,
    config: &EmbeddingConfig,
    cancel: &CancelSignal,
) -> Result<()> {
    cancel.check("embedding submission")?;
    let mut running = job
        .submit(run_id)
        .await
        .context(MatchError::Collaborator(format!("embedding job for run {} was not started", run_id)))?;
    let deadline = Instant::now() + config.timeout;

    loop {
        let status = running
            .poll()
            .await
            .context(MatchError::Collaborator(format!("embedding job for run {} could not be polled", run_id)))?;
        match status {
            JobStatus::Succeeded => return Ok(()),
            JobStatus::Failed(reason) => return Err(MatchError::Collaborator(reason).into()),
            JobStatus::Running => {}
        }
        if Instant::now() >= deadline {
            running.abort().await;
            return Err(MatchError::Collaborator(format!(
                "embedding job for run {} timed out after {:?}",
                run_id, config.timeout
            ))
            .into());
        }
        tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                running.abort().await;
                return Err(MatchError::Cancelled("cancelled while waiting for embeddings".to_string()).into());
            }
            _ = tokio::time::sleep(config.poll_interval) => {}
        }
    }
}

/// Embedding step of a run. Failures degrade to key-only retrieval when the
/// configuration allows it; cancellation always propagates.
pub async fn run_embedding_stage(
    job: Option<&dyn EmbeddingJob>,
    run_id: RunId,
    config: &EmbeddingConfig,
    cancel: &CancelSignal,
) -> Result<EmbeddingOutcome> {
    let logger = StageLogger::new(StageKind::Embedding, run_id);
    let job = match job {
        Some(job) if config.enabled => job,
        _ => {
            logger.log_phase("Skipped", Some("embeddings disabled"));
            return Ok(EmbeddingOutcome::Disabled);
        }
    };

    logger.log_phase("Waiting for embedding job", None);
    match await_embeddings(job, run_id, config, cancel).await {
        Ok(()) => {
            logger.log_phase("Embeddings ready", None);
            Ok(EmbeddingOutcome::Completed)
        }
        Err(e) => {
            let cancelled = matches!(MatchError::classify(&e), Some(MatchError::Cancelled(_)));
            if cancelled || !config.allow_key_only_fallback {
                logger.log_error(&format!("{:#}", e));
                return Err(e);
            }
            let reason = format!("{:#}", e);
            logger.log_warning(&format!("Falling back to key-only retrieval: {}", reason));
            Ok(EmbeddingOutcome::KeyOnlyFallback { reason })
        }
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use std::io::Write;

    fn script(body: &str) -> tempfile::NamedTempFile {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "{}", body).unwrap();
        file.flush().unwrap();
        file
    }

    fn config_for(file: &tempfile::NamedTempFile) -> EmbeddingConfig {
        EmbeddingConfig {
            enabled: true,
            script_path: file.path().display().to_string(),
            interpreter: "sh".to_string(),
            timeout: Duration::from_secs(5),
            poll_interval: Duration::from_millis(20),
            allow_key_only_fallback: false,
        }
    }

    #[tokio::test]
    async fn test_successful_script() {
        let file = script("exit 0");
        let config = config_for(&file);
        let job = ScriptEmbeddingJob::new(&config);
        await_embeddings(&job, 7, &config, &CancelSignal::new()).await.unwrap();
    }

    #[tokio::test]
    async fn test_script_receives_run_id() {
        let file = script("[ \"$1\" = \"42\" ] || exit 9");
        let config = config_for(&file);
        let job = ScriptEmbeddingJob::new(&config);
        await_embeddings(&job, 42, &config, &CancelSignal::new()).await.unwrap();
        assert!(await_embeddings(&job, 41, &config, &CancelSignal::new()).await.is_err());
    }

    #[tokio::test]
    async fn test_failing_script_is_collaborator_error() {
        let file = script("exit 3");
        let config = config_for(&file);
        let job = ScriptEmbeddingJob::new(&config);
        let err = await_embeddings(&job, 1, &config, &CancelSignal::new()).await.unwrap_err();
        assert!(matches!(MatchError::classify(&err), Some(MatchError::Collaborator(_))));
    }

    #[tokio::test]
    async fn test_timeout_is_collaborator_error() {
        let file = script("sleep 5");
        let mut config = config_for(&file);
        config.timeout = Duration::from_millis(100);
        let job = ScriptEmbeddingJob::new(&config);
        let err = await_embeddings(&job, 1, &config, &CancelSignal::new()).await.unwrap_err();
        assert!(format!("{:#}", err).contains("timed out"));
    }

    #[tokio::test]
    async fn test_missing_script() {
        let config = EmbeddingConfig {
            script_path: "/nonexistent/generate_embeddings.py".to_string(),
            ..EmbeddingConfig::default()
        };
        let job = ScriptEmbeddingJob::new(&config);
        let err = await_embeddings(&job, 1, &config, &CancelSignal::new()).await.unwrap_err();
        assert!(matches!(MatchError::classify(&err), Some(MatchError::Collaborator(_))));
    }

    #[tokio::test]
    async fn test_fallback_and_disabled_outcomes() {
        let file = script("exit 1");
        let mut config = config_for(&file);
        let job = ScriptEmbeddingJob::new(&config);

        assert!(run_embedding_stage(Some(&job), 1, &config, &CancelSignal::new()).await.is_err());

        config.allow_key_only_fallback = true;
        let outcome = run_embedding_stage(Some(&job), 1, &config, &CancelSignal::new()).await.unwrap();
        assert!(matches!(outcome, EmbeddingOutcome::KeyOnlyFallback { .. }));

        let outcome = run_embedding_stage(None, 1, &config, &CancelSignal::new()).await.unwrap();
        assert_eq!(outcome, EmbeddingOutcome::Disabled);
    }

    #[tokio::test]
    async fn test_cancel_is_never_degraded() {
        let file = script("sleep 5");
        let mut config = config_for(&file);
        config.allow_key_only_fallback = true;
        let job = ScriptEmbeddingJob::new(&config);
        let cancel = CancelSignal::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            trigger.cancel();
        });
        let err = run_embedding_stage(Some(&job), 1, &config, &cancel).await.unwrap_err();
        assert!(matches!(MatchError::classify(&err), Some(MatchError::Cancelled(_))));
    }
}
