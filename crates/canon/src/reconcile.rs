//! `canon reconcile start|resume|status|list|cancel|pause`.
//!
//! Runs are checkpointed in `batch_jobs`, so an interrupted run can be
//! resumed. `Ctrl-C` during a foreground run requests cooperative
//! cancellation: the current item finishes, the checkpoint is saved, and
//! the job ends `cancelled`. `cancel` and `pause` work across processes
//! because the runner's progress writes only succeed while the job is
//! still `running`.

use std::sync::Arc;

use anyhow::Result;
use tracing::info;

use canon_core::batch::{BatchReconciliationJob, BatchResult};
use canon_core::job::{BatchJob, BatchOptions, JobFilter, JobState};

use crate::app;
use crate::config::Config;
use crate::progress::{format_number, short_id, ProgressMode};
use crate::sqlite_store::SqliteStore;
use crate::stats::format_ts_relative;

/// CLI overrides on top of `[batch]`.
#[derive(Debug, Clone, Default)]
pub struct StartArgs {
    pub dry_run: bool,
    pub batch_size: Option<usize>,
    pub delay_ms: Option<u64>,
    pub project: Option<String>,
    /// Only create the job; run it later with `resume`.
    pub detach: bool,
}

impl StartArgs {
    pub fn options(&self, config: &Config) -> BatchOptions {
        let mut options = config.batch.options();
        options.dry_run = self.dry_run;
        if let Some(size) = self.batch_size {
            options.batch_size = size;
        }
        if let Some(delay) = self.delay_ms {
            options.delay_ms = delay;
        }
        options.scope = self.project.clone();
        options
    }
}

pub async fn run_start(
    config: &Config,
    args: &StartArgs,
    progress: ProgressMode,
    json: bool,
) -> Result<()> {
    let service = app::open_service(config).await?;
    let caller = app::caller(config);
    let options = args.options(config);
    options.validate()?;

    let job = service.start_batch(&caller, options).await?;
    if args.detach {
        println!("Created job {} (pending).", job.id);
        println!("Run it with: canon reconcile resume {}", job.id);
        app::close(service).await;
        return Ok(());
    }

    let watcher = cancel_on_ctrl_c(service.batch().clone(), job.id.clone());
    let observer = progress.observer();
    let result = service
        .run_batch(&caller, &job.id, Some(observer.as_ref()))
        .await;
    watcher.abort();

    print_result(&result?, json)?;
    app::close(service).await;
    Ok(())
}

pub async fn run_resume(
    config: &Config,
    job_id: &str,
    progress: ProgressMode,
    json: bool,
) -> Result<()> {
    let service = app::open_service(config).await?;
    let caller = app::caller(config);

    let watcher = cancel_on_ctrl_c(service.batch().clone(), job_id.to_string());
    let observer = progress.observer();
    let result = service
        .resume_batch(&caller, job_id, Some(observer.as_ref()))
        .await;
    watcher.abort();

    print_result(&result?, json)?;
    app::close(service).await;
    Ok(())
}

pub async fn run_status(config: &Config, job_id: &str, json: bool) -> Result<()> {
    let service = app::open_service(config).await?;
    let caller = app::caller(config);
    let job = service.batch_status(&caller, job_id).await?;
    if json {
        println!("{}", serde_json::to_string_pretty(&job)?);
    } else {
        print_job(&job);
    }
    app::close(service).await;
    Ok(())
}

pub async fn run_list(
    config: &Config,
    state: Option<&str>,
    limit: Option<usize>,
) -> Result<()> {
    let state: Option<JobState> = state.map(str::parse).transpose()?;
    let service = app::open_service(config).await?;
    let caller = app::caller(config);
    let jobs = service
        .list_batches(&caller, &JobFilter { state, limit })
        .await?;

    if jobs.is_empty() {
        println!("No reconciliation jobs.");
    } else {
        println!(
            "  {:<38} {:<10} {:>12} {:>7}   {}",
            "JOB", "STATE", "PROCESSED", "DRY RUN", "CREATED"
        );
        for job in &jobs {
            println!(
                "  {:<38} {:<10} {:>12} {:>7}   {}",
                job.id,
                job.state.as_str(),
                format!(
                    "{}/{}",
                    format_number(job.processed),
                    format_number(job.total)
                ),
                if job.options.dry_run { "yes" } else { "no" },
                format_ts_relative(job.created_at)
            );
        }
    }

    app::close(service).await;
    Ok(())
}

pub async fn run_cancel(config: &Config, job_id: &str) -> Result<()> {
    let service = app::open_service(config).await?;
    let caller = app::caller(config);
    let job = service.cancel_batch(&caller, job_id).await?;
    println!("Job {} is {}.", job.id, job.state);
    app::close(service).await;
    Ok(())
}

pub async fn run_pause(config: &Config, job_id: &str) -> Result<()> {
    let service = app::open_service(config).await?;
    let caller = app::caller(config);
    let job = service.pause_batch(&caller, job_id).await?;
    println!("Job {} is {}.", job.id, job.state);
    app::close(service).await;
    Ok(())
}

fn cancel_on_ctrl_c(
    batch: Arc<BatchReconciliationJob<SqliteStore>>,
    job_id: String,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            eprintln!(
                "reconcile {}  cancelling after the current item...",
                short_id(&job_id)
            );
            info!(job_id = %job_id, "cancel requested from terminal");
            batch.request_cancel(&job_id);
        }
    })
}

fn print_result(result: &BatchResult, json: bool) -> Result<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(result)?);
        return Ok(());
    }

    let s = &result.stats;
    println!(
        "Job {} {}{} in {:.1}s",
        result.job_id,
        result.state,
        if result.dry_run { " (dry run)" } else { "" },
        result.duration_ms as f64 / 1000.0
    );
    println!(
        "  Processed:   {} / {}",
        format_number(result.processed),
        format_number(result.total)
    );
    println!("  Duplicates:  {}", format_number(s.duplicates_found));
    if result.dry_run {
        println!("  Would merge:     {}", format_number(s.would_merge));
        println!("  Would link:      {}", format_number(s.would_link));
        println!("  Would flag:      {}", format_number(s.would_flag));
        println!("  Would supersede: {}", format_number(s.would_supersede));
        println!("  Would queue:     {}", format_number(s.would_queue));
    } else {
        println!("  Merged:      {}", format_number(s.merged));
        println!("  Linked:      {}", format_number(s.linked));
        println!("  Flagged:     {}", format_number(s.flagged));
        println!("  Superseded:  {}", format_number(s.superseded));
        println!("  Queued:      {}", format_number(s.queued));
    }
    println!("  Skipped:     {}", format_number(s.skipped));
    println!("  Errors:      {}", format_number(s.errors));
    if let Some(err) = &result.error {
        println!("  Failure:     {}", err);
    }
    if let Some(checkpoint) = &result.checkpoint {
        if !result.state.is_terminal() || result.state == JobState::Failed {
            println!("  Checkpoint:  {}", checkpoint);
        }
    }
    Ok(())
}

fn print_job(job: &BatchJob) {
    println!("Job {}", job.id);
    println!("  State:       {}", job.state);
    println!(
        "  Processed:   {} / {}",
        format_number(job.processed),
        format_number(job.total)
    );
    println!(
        "  Options:     batch_size={} delay_ms={} dry_run={} project={}",
        job.options.batch_size,
        job.options.delay_ms,
        job.options.dry_run,
        job.options.scope.as_deref().unwrap_or("*")
    );
    println!("  Created:     {}", format_ts_relative(job.created_at));
    if let Some(ts) = job.started_at {
        println!("  Started:     {}", format_ts_relative(ts));
    }
    if let Some(ts) = job.finished_at {
        println!("  Finished:    {}", format_ts_relative(ts));
    }
    if let Some(checkpoint) = &job.checkpoint {
        println!("  Checkpoint:  {}", checkpoint);
    }
    if let Some(err) = &job.error {
        println!("  Error:       {}", err);
    }
    println!(
        "  Stats:       merged={} linked={} flagged={} superseded={} queued={} errors={}",
        job.stats.merged,
        job.stats.linked,
        job.stats.flagged,
        job.stats.superseded,
        job.stats.queued,
        job.stats.errors
    );
}
