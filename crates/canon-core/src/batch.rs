//! Resumable batch reconciliation over an existing corpus.
//!
//! The runner walks unarchived chunks in id order, `batch_size` at a time,
//! applying the orchestrator to every chunk that is not yet canonical or a
//! variant. Chunks archived after their page was listed are skipped; one
//! that this run supersedes before the cursor reaches it is counted as
//! processed when it is archived. After each batch it persists counters,
//! stats, and the checkpoint (the last handled chunk id) in one conditional
//! write that only applies while the job is still `Running`. A rejected write means another process
//! cancelled or paused the job; the runner adopts that state, saves its
//! progress under it, and stops.
//!
//! Stop requests from this process are cooperative: they are checked before
//! every item and every batch. Per-item errors are counted and logged. A
//! store failure while listing or saving, or `max_consecutive_errors` item
//! failures in a row, fails the job with its checkpoint intact.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use serde::Serialize;
use tracing::{debug, info, warn};

use crate::error::{DedupError, Result};
use crate::events::{DomainEvent, EventSink};
use crate::job::{BatchJob, BatchOptions, BatchStats, JobFilter, JobState};
use crate::models::Chunk;
use crate::orchestrator::{DedupOptions, DeduplicationOrchestrator, Plan};
use crate::store::DedupStore;

const SIGNAL_NONE: u8 = 0;
const SIGNAL_PAUSE: u8 = 1;
const SIGNAL_CANCEL: u8 = 2;

/// Snapshot handed to a [`ProgressObserver`] after every batch.
#[derive(Debug, Clone, Serialize)]
pub struct BatchProgress {
    pub job_id: String,
    pub batch: u64,
    pub processed: u64,
    pub total: u64,
    pub stats: BatchStats,
    pub dry_run: bool,
}

pub trait ProgressObserver: Send + Sync {
    fn on_progress(&self, progress: &BatchProgress);
}

/// Final state of a run.
#[derive(Debug, Clone, Serialize)]
pub struct BatchResult {
    pub job_id: String,
    pub state: JobState,
    pub processed: u64,
    pub total: u64,
    pub checkpoint: Option<String>,
    pub stats: BatchStats,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub dry_run: bool,
    pub duration_ms: u64,
}

impl BatchResult {
    fn from_job(job: &BatchJob, started: Instant) -> Self {
        Self {
            job_id: job.id.clone(),
            state: job.state,
            processed: job.processed,
            total: job.total,
            checkpoint: job.checkpoint.clone(),
            stats: job.stats.clone(),
            error: job.error.clone(),
            dry_run: job.options.dry_run,
            duration_ms: started.elapsed().as_millis() as u64,
        }
    }
}

/// Bookkeeping for one pass of [`BatchReconciliationJob::drive`].
#[derive(Default)]
struct Pass {
    /// Dry run: chunks a planned action already folds into a record.
    claimed: HashSet<String>,
    /// Chunks this pass archived before reaching them. They are counted as
    /// processed when archived and passed over when reached.
    archived_ahead: HashSet<String>,
}

enum Step {
    Continue,
    Stopped(u8),
    Failed(String),
}

pub struct BatchReconciliationJob<S> {
    store: Arc<S>,
    orchestrator: Arc<DeduplicationOrchestrator<S>>,
    dedup: DedupOptions,
    events: Arc<dyn EventSink>,
    signals: Mutex<HashMap<String, Arc<AtomicU8>>>,
}

impl<S: DedupStore> BatchReconciliationJob<S> {
    pub fn new(
        store: Arc<S>,
        orchestrator: Arc<DeduplicationOrchestrator<S>>,
        dedup: DedupOptions,
        events: Arc<dyn EventSink>,
    ) -> Self {
        Self {
            store,
            orchestrator,
            dedup,
            events,
            signals: Mutex::new(HashMap::new()),
        }
    }

    /// Create a `Pending` job.
    pub async fn start(&self, options: BatchOptions) -> Result<BatchJob> {
        options.validate()?;
        self.dedup.validate()?;
        let mut job = BatchJob::new(options);
        job.total = self.store.count_chunks(job.options.scope.as_deref()).await?;
        self.store.create_job(&job).await?;
        info!(job_id = %job.id, total = job.total, dry_run = job.options.dry_run, "batch job created");
        Ok(job)
    }

    /// Start and run to completion, cancellation, or failure.
    pub async fn execute(
        &self,
        options: BatchOptions,
        observer: Option<&dyn ProgressObserver>,
    ) -> Result<BatchResult> {
        let job = self.start(options).await?;
        self.run(&job.id, observer).await
    }

    /// Continue a pending, paused, cancelled, or failed job from its checkpoint.
    pub async fn resume(
        &self,
        job_id: &str,
        observer: Option<&dyn ProgressObserver>,
    ) -> Result<BatchResult> {
        let job = self.get_status(job_id).await?;
        // Detached jobs start here too.
        if job.state != JobState::Pending && !job.state.is_resumable() {
            return Err(DedupError::conflict(format!(
                "job {} is {} and cannot be resumed",
                job_id, job.state
            )));
        }
        self.run(job_id, observer).await
    }

    /// Run a `Pending` or resumable job.
    pub async fn run(
        &self,
        job_id: &str,
        observer: Option<&dyn ProgressObserver>,
    ) -> Result<BatchResult> {
        let started = Instant::now();
        let mut job = self.get_status(job_id).await?;
        let previous = job.state;
        job.transition(JobState::Running)?;
        job.error = None;
        if !self.store.save_job(&job, previous).await? {
            return Err(DedupError::conflict(format!(
                "job {} changed state concurrently",
                job_id
            )));
        }

        let signal = self.register(job_id);
        let outcome = self.drive(&mut job, &signal, observer).await;
        self.unregister(job_id);
        outcome?;

        info!(
            job_id,
            state = %job.state,
            processed = job.processed,
            total = job.total,
            errors = job.stats.errors,
            "batch job finished"
        );
        self.events.publish(DomainEvent::BatchCompleted {
            job_id: job.id.clone(),
            state: job.state.to_string(),
            processed: job.processed,
            total: job.total,
        });
        Ok(BatchResult::from_job(&job, started))
    }

    pub async fn get_status(&self, job_id: &str) -> Result<BatchJob> {
        self.store
            .get_job(job_id)
            .await?
            .ok_or_else(|| DedupError::not_found("job", job_id))
    }

    pub async fn list_jobs(&self, filter: &JobFilter) -> Result<Vec<BatchJob>> {
        self.store.list_jobs(filter).await
    }

    /// Ask a run in this process to stop after the current item.
    ///
    /// Returns whether a run was found. The runner persists `Cancelled`.
    pub fn request_cancel(&self, job_id: &str) -> bool {
        self.signal(job_id, SIGNAL_CANCEL)
    }

    pub fn request_pause(&self, job_id: &str) -> bool {
        self.signal(job_id, SIGNAL_PAUSE)
    }

    /// Cancel a job, whether it runs here, in another process, or not at all.
    pub async fn cancel(&self, job_id: &str) -> Result<BatchJob> {
        self.request_cancel(job_id);
        self.persist_stop(job_id, JobState::Cancelled).await
    }

    pub async fn pause(&self, job_id: &str) -> Result<BatchJob> {
        self.request_pause(job_id);
        self.persist_stop(job_id, JobState::Paused).await
    }

    async fn persist_stop(&self, job_id: &str, target: JobState) -> Result<BatchJob> {
        for _ in 0..3 {
            let mut job = self.get_status(job_id).await?;
            if job.state == target {
                return Ok(job);
            }
            let previous = job.state;
            job.transition(target)?;
            if self.store.save_job(&job, previous).await? {
                info!(job_id, state = %target, "batch job stop requested");
                return Ok(job);
            }
        }
        Err(DedupError::conflict(format!(
            "job {} keeps changing state; retry",
            job_id
        )))
    }

    async fn drive(
        &self,
        job: &mut BatchJob,
        signal: &AtomicU8,
        observer: Option<&dyn ProgressObserver>,
    ) -> Result<()> {
        let options = job.options.clone();
        let delay = Duration::from_millis(options.delay_ms);
        let mut pass = Pass::default();
        let mut consecutive_errors: u32 = 0;
        let mut batch_no: u64 = 0;

        loop {
            let requested = signal.load(Ordering::SeqCst);
            if requested != SIGNAL_NONE {
                return self.stop(job, requested).await;
            }

            let page = match self
                .store
                .list_chunks_after(job.checkpoint.as_deref(), options.batch_size, options.scope.as_deref())
                .await
            {
                Ok(page) => page,
                Err(err) => return self.fail(job, format!("listing chunks failed: {}", err)).await,
            };
            if page.is_empty() {
                job.transition(JobState::Completed)?;
                return self.save_final(job).await;
            }

            batch_no += 1;
            let mut step = Step::Continue;
            for chunk in &page {
                let requested = signal.load(Ordering::SeqCst);
                if requested != SIGNAL_NONE {
                    step = Step::Stopped(requested);
                    break;
                }
                if pass.archived_ahead.remove(&chunk.id) {
                    job.checkpoint = Some(chunk.id.clone());
                    continue;
                }

                match self.reconcile(job, chunk, &mut pass).await {
                    Ok(()) => consecutive_errors = 0,
                    Err(err) => {
                        job.stats.errors += 1;
                        consecutive_errors += 1;
                        warn!(job_id = %job.id, chunk_id = %chunk.id, kind = err.kind(), error = %err, "item failed");
                    }
                }
                job.processed += 1;
                job.checkpoint = Some(chunk.id.clone());

                if consecutive_errors >= options.max_consecutive_errors {
                    step = Step::Failed(format!(
                        "{} consecutive item failures",
                        consecutive_errors
                    ));
                    break;
                }
            }

            match step {
                Step::Stopped(requested) => return self.stop(job, requested).await,
                Step::Failed(reason) => return self.fail(job, reason).await,
                Step::Continue => {}
            }

            job.updated_at = chrono::Utc::now().timestamp();
            match self.store.save_job(job, JobState::Running).await {
                Ok(true) => {}
                Ok(false) => return self.adopt_external_stop(job).await,
                Err(err) => return self.fail(job, format!("saving checkpoint failed: {}", err)).await,
            }
            debug!(
                job_id = %job.id,
                batch = batch_no,
                processed = job.processed,
                total = job.total,
                "batch checkpointed"
            );
            if let Some(observer) = observer {
                observer.on_progress(&BatchProgress {
                    job_id: job.id.clone(),
                    batch: batch_no,
                    processed: job.processed,
                    total: job.total,
                    stats: job.stats.clone(),
                    dry_run: options.dry_run,
                });
            }

            if page.len() == options.batch_size && !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
        }
    }

    async fn reconcile(&self, job: &mut BatchJob, listed: &Chunk, pass: &mut Pass) -> Result<()> {
        if pass.claimed.contains(&listed.id) {
            job.stats.skipped += 1;
            return Ok(());
        }
        // The page was listed before earlier items ran.
        let chunk = match self.store.get_chunk(&listed.id).await? {
            Some(chunk) if !chunk.archived => chunk,
            _ => {
                job.stats.skipped += 1;
                return Ok(());
            }
        };
        let decision = self.orchestrator.decide(&chunk, &self.dedup).await?;
        if matches!(
            decision.plan,
            Plan::AlreadyReconciled { .. } | Plan::AlreadyQueued { .. }
        ) {
            job.stats.skipped += 1;
            return Ok(());
        }
        if !decision.candidates.is_empty() {
            job.stats.duplicates_found += 1;
        }

        if job.options.dry_run {
            job.stats.record_planned(decision.plan.action());
            for id in decision.plan.claimed_chunks() {
                pass.claimed.insert(id.to_string());
            }
            return Ok(());
        }

        let ahead = self.archived_ahead(job, &chunk, &decision.plan).await?;
        let outcome = self.orchestrator.execute(&chunk, &decision).await?;
        job.stats.record(outcome.action);
        if let Some(id) = ahead {
            job.processed += 1;
            pass.archived_ahead.insert(id);
        }
        Ok(())
    }

    /// The chunk `plan` archives when it is one this job has yet to reach.
    async fn archived_ahead(
        &self,
        job: &BatchJob,
        chunk: &Chunk,
        plan: &Plan,
    ) -> Result<Option<String>> {
        let Plan::Supersede {
            outdated_chunk_id, ..
        } = plan
        else {
            return Ok(None);
        };
        if outdated_chunk_id.as_str() <= chunk.id.as_str() {
            return Ok(None);
        }
        let in_scope = match self.store.get_chunk(outdated_chunk_id).await? {
            Some(outdated) if !outdated.archived => match job.options.scope.as_deref() {
                Some(project) => outdated.project.as_deref() == Some(project),
                None => true,
            },
            _ => false,
        };
        Ok(in_scope.then(|| outdated_chunk_id.clone()))
    }

    async fn stop(&self, job: &mut BatchJob, requested: u8) -> Result<()> {
        let target = if requested == SIGNAL_PAUSE {
            JobState::Paused
        } else {
            JobState::Cancelled
        };
        job.transition(target)?;
        if self.store.save_job(job, JobState::Running).await? {
            return Ok(());
        }
        self.adopt_external_stop(job).await
    }

    /// The persisted state moved away from `Running`; keep our progress under it.
    async fn adopt_external_stop(&self, job: &mut BatchJob) -> Result<()> {
        for _ in 0..3 {
            let persisted = self.get_status(&job.id).await?;
            job.state = persisted.state;
            job.finished_at = persisted.finished_at;
            job.updated_at = chrono::Utc::now().timestamp();
            if self.store.save_job(job, persisted.state).await? {
                info!(job_id = %job.id, state = %job.state, "batch job stopped externally");
                return Ok(());
            }
        }
        Err(DedupError::conflict(format!(
            "job {} keeps changing state; progress not saved",
            job.id
        )))
    }

    async fn fail(&self, job: &mut BatchJob, reason: String) -> Result<()> {
        warn!(job_id = %job.id, reason = %reason, "batch job failed");
        job.error = Some(reason);
        job.transition(JobState::Failed)?;
        self.save_final(job).await
    }

    async fn save_final(&self, job: &mut BatchJob) -> Result<()> {
        if self.store.save_job(job, JobState::Running).await? {
            return Ok(());
        }
        self.adopt_external_stop(job).await
    }

    fn register(&self, job_id: &str) -> Arc<AtomicU8> {
        let flag = Arc::new(AtomicU8::new(SIGNAL_NONE));
        self.signals
            .lock()
            .expect("batch signal lock poisoned")
            .insert(job_id.to_string(), flag.clone());
        flag
    }

    fn unregister(&self, job_id: &str) {
        self.signals
            .lock()
            .expect("batch signal lock poisoned")
            .remove(job_id);
    }

    fn signal(&self, job_id: &str, value: u8) -> bool {
        match self
            .signals
            .lock()
            .expect("batch signal lock poisoned")
            .get(job_id)
        {
            Some(flag) => {
                flag.store(value, Ordering::SeqCst);
                true
            }
            None => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::ClassificationCache;
    use crate::classifier::{ClassifierOptions, RelationshipClassifier};
    use crate::events::NoopEventSink;
    use crate::store::memory::InMemoryStore;
    use crate::store::{CanonicalStore, ChunkStore, JobStore};
    use std::sync::atomic::AtomicU64;

    /// Deterministic xorshift generator for reproducible corpora.
    struct Rng(u64);

    impl Rng {
        fn next_f32(&mut self) -> f32 {
            self.0 ^= self.0 << 13;
            self.0 ^= self.0 >> 7;
            self.0 ^= self.0 << 17;
            ((self.0 >> 40) as f32 / (1u64 << 24) as f32) * 2.0 - 1.0
        }

        fn vector(&mut self, dims: usize) -> Vec<f32> {
            (0..dims).map(|_| self.next_f32()).collect()
        }
    }

    fn runner(store: Arc<InMemoryStore>) -> Arc<BatchReconciliationJob<InMemoryStore>> {
        let cache = Arc::new(ClassificationCache::new(Duration::from_secs(60), 1000));
        let classifier = Arc::new(RelationshipClassifier::new(ClassifierOptions::default(), cache));
        let events: Arc<dyn EventSink> = Arc::new(NoopEventSink);
        let orchestrator = Arc::new(DeduplicationOrchestrator::new(
            store.clone(),
            classifier,
            events.clone(),
        ));
        let dedup = DedupOptions {
            similarity_threshold: 0.90,
            ..Default::default()
        };
        Arc::new(BatchReconciliationJob::new(store, orchestrator, dedup, events))
    }

    /// 750 originals plus 250 near-copies (25% duplicates). Random ids interleave them.
    async fn corpus(store: &InMemoryStore) {
        let mut rng = Rng(0x9E37_79B9_7F4A_7C15);
        let originals: Vec<Vec<f32>> = (0..750).map(|_| rng.vector(64)).collect();
        for (i, v) in originals.iter().enumerate() {
            let c = Chunk::new(format!("original fact {}", i), v.clone());
            store.insert_chunk(&c).await.unwrap();
        }
        for i in 0..250 {
            let noisy: Vec<f32> = originals[i * 3]
                .iter()
                .map(|x| x + rng.next_f32() * 0.05)
                .collect();
            let c = Chunk::new(format!("restated fact {}", i * 3), noisy);
            store.insert_chunk(&c).await.unwrap();
        }
    }

    fn fast(dry_run: bool) -> BatchOptions {
        BatchOptions {
            batch_size: 100,
            delay_ms: 0,
            dry_run,
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn dry_run_reports_without_mutating() {
        let store = Arc::new(InMemoryStore::new());
        corpus(&store).await;
        let result = runner(store.clone()).execute(fast(true), None).await.unwrap();

        assert_eq!(result.state, JobState::Completed);
        assert_eq!(result.processed, 1000);
        assert!((200..=300).contains(&result.stats.duplicates_found));
        assert!(result.stats.would_merge > 0);
        assert_eq!(result.stats.merged, 0);

        let page = store.list_chunks_after(None, 2000, None).await.unwrap();
        for chunk in &page {
            assert!(store.get_membership(&chunk.id).await.unwrap().is_none());
        }
    }

    #[tokio::test]
    async fn real_run_merges_duplicates() {
        let store = Arc::new(InMemoryStore::new());
        corpus(&store).await;
        let result = runner(store.clone()).execute(fast(false), None).await.unwrap();

        assert_eq!(result.state, JobState::Completed);
        assert_eq!(result.processed, result.total);
        assert!((200..=300).contains(&result.stats.duplicates_found));
        assert!(result.stats.merged > 0);
        assert_eq!(result.stats.errors, 0);
        assert_eq!(
            result.stats.stored_as_new + result.stats.merged + result.stats.skipped,
            1000
        );

        let again = runner(store.clone()).execute(fast(false), None).await.unwrap();
        assert_eq!(again.stats.skipped, 1000);
    }

    #[tokio::test]
    async fn superseding_ahead_of_the_cursor_counts_once() {
        for batch_size in [1, 100] {
            let store = Arc::new(InMemoryStore::new());
            let mut new = Chunk::new("Deploy with make release v2", vec![1.0, 0.0]);
            new.id = "a-new".into();
            store.insert_chunk(&new).await.unwrap();
            let mut old = Chunk::new("Deploy with make release v1", vec![0.96, 0.28]);
            old.id = "z-old".into();
            old.created_at -= 30 * 24 * 60 * 60;
            store.insert_chunk(&old).await.unwrap();

            let options = BatchOptions {
                batch_size,
                delay_ms: 0,
                ..Default::default()
            };
            let result = runner(store.clone()).execute(options, None).await.unwrap();

            assert_eq!(result.state, JobState::Completed, "batch_size {}", batch_size);
            assert_eq!(result.total, 2);
            assert_eq!(result.processed, 2, "batch_size {}", batch_size);
            assert_eq!(result.stats.superseded, 1);
            assert_eq!(result.stats.skipped, 0);
            assert_eq!(result.stats.errors, 0);
            assert!(store.get_chunk("z-old").await.unwrap().unwrap().archived);
        }
    }

    struct CancelAfterFirstBatch {
        runner: Arc<BatchReconciliationJob<InMemoryStore>>,
        seen: AtomicU64,
    }

    impl ProgressObserver for CancelAfterFirstBatch {
        fn on_progress(&self, progress: &BatchProgress) {
            if self.seen.fetch_add(1, Ordering::SeqCst) == 0 {
                self.runner.request_cancel(&progress.job_id);
            }
        }
    }

    #[tokio::test]
    async fn cancel_then_resume_processes_each_item_once() {
        let store = Arc::new(InMemoryStore::new());
        let mut rng = Rng(42);
        for i in 0..10 {
            let mut c = Chunk::new(format!("fact {}", i), rng.vector(64));
            c.id = format!("chunk-{:02}", i);
            store.insert_chunk(&c).await.unwrap();
        }
        let runner = runner(store.clone());
        let observer = CancelAfterFirstBatch {
            runner: runner.clone(),
            seen: AtomicU64::new(0),
        };
        let options = BatchOptions {
            batch_size: 3,
            delay_ms: 0,
            ..Default::default()
        };

        let first = runner.execute(options, Some(&observer)).await.unwrap();
        assert_eq!(first.state, JobState::Cancelled);
        assert_eq!(first.processed, 3);
        assert_eq!(first.checkpoint.as_deref(), Some("chunk-02"));

        let resumed = runner.resume(&first.job_id, None).await.unwrap();
        assert_eq!(resumed.state, JobState::Completed);
        assert_eq!(resumed.processed, 10);
        assert_eq!(resumed.stats.stored_as_new, 10);
        assert_eq!(resumed.stats.skipped, 0);
    }

    struct ExternalCancel(Arc<InMemoryStore>);

    impl ProgressObserver for ExternalCancel {
        fn on_progress(&self, progress: &BatchProgress) {
            // Another process flips the persisted state behind the runner's back.
            let store = self.0.clone();
            let id = progress.job_id.clone();
            tokio::task::block_in_place(|| {
                tokio::runtime::Handle::current().block_on(async move {
                    let mut job = store.get_job(&id).await.unwrap().unwrap();
                    job.transition(JobState::Cancelled).unwrap();
                    assert!(store.save_job(&job, JobState::Running).await.unwrap());
                })
            });
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn external_cancel_is_adopted_with_progress() {
        let store = Arc::new(InMemoryStore::new());
        let mut rng = Rng(7);
        for i in 0..6 {
            let mut c = Chunk::new(format!("fact {}", i), rng.vector(16));
            c.id = format!("c{}", i);
            store.insert_chunk(&c).await.unwrap();
        }
        let runner = runner(store.clone());
        let job = runner
            .start(BatchOptions {
                batch_size: 2,
                delay_ms: 0,
                ..Default::default()
            })
            .await
            .unwrap();

        let observer = ExternalCancel(store.clone());
        let result = runner.run(&job.id, Some(&observer)).await.unwrap();
        assert_eq!(result.state, JobState::Cancelled);
        let persisted = store.get_job(&job.id).await.unwrap().unwrap();
        assert_eq!(persisted.state, JobState::Cancelled);
        assert_eq!(persisted.processed, 4);
        assert_eq!(persisted.checkpoint.as_deref(), Some("c3"));
    }

    #[tokio::test]
    async fn pause_and_resume_from_stored_state() {
        let store = Arc::new(InMemoryStore::new());
        let runner = runner(store.clone());
        let job = runner.start(fast(false)).await.unwrap();
        let paused = runner.pause(&job.id).await;
        assert!(matches!(paused, Err(DedupError::Conflict(_))));

        let cancelled = runner.cancel(&job.id).await.unwrap();
        assert_eq!(cancelled.state, JobState::Cancelled);
        let resumed = runner.resume(&job.id, None).await.unwrap();
        assert_eq!(resumed.state, JobState::Completed);
        assert!(matches!(
            runner.resume(&job.id, None).await,
            Err(DedupError::Conflict(_))
        ));
    }

    #[tokio::test]
    async fn reconciled_chunks_are_skipped() {
        let store = Arc::new(InMemoryStore::new());
        for i in 0..5 {
            let mut c = Chunk::new(format!("fact {}", i), vec![1.0, i as f32]);
            c.id = format!("c{}", i);
            store.insert_chunk(&c).await.unwrap();
            store.create_canonical(&c.id).await.unwrap();
        }
        let result = runner(store).execute(fast(false), None).await.unwrap();
        assert_eq!(result.state, JobState::Completed);
        assert_eq!(result.processed, 5);
        assert_eq!(result.stats.skipped, 5);
        assert_eq!(result.stats.duplicates_found, 0);
    }
}
