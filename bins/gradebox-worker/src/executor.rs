/// Job Executor - glue between the Redis queue and the batch harness
///
/// For one `GradeJob`:
/// 1. Watches the run's cancel flag and cancels the harness token
/// 2. Streams every TestResult into the run's partial list as it arrives
/// 3. Aggregates, stores the final report, then folds the progress tuple
///
/// Every exit path stops the watcher and writes a terminal state, so a
/// failed store never leaves a run looking "running" forever.
///
/// It knows nothing about how code runs (sandbox) or how cases are judged
/// (harness).
use anyhow::Result;
use async_trait::async_trait;
use chrono::Utc;
use gradebox_common::redis;
use gradebox_common::types::{
    ExerciseProgress, GradeJob, GradeReport, JobStatus, RunState, StopReason, TestResult,
};
use gradebox_engine::{aggregate, BatchEvent, BatchHarness, BatchRun};
use ::redis::aio::ConnectionManager;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

const CANCEL_POLL_INTERVAL: Duration = Duration::from_millis(250);

/// Run storage used by the executor; Redis in production
#[async_trait]
pub trait RunStore: Clone + Send + Sync + 'static {
    async fn is_cancelled(&mut self, run_id: &Uuid) -> Result<bool>;
    async fn append_partial(&mut self, run_id: &Uuid, result: &TestResult, ttl_seconds: u64) -> Result<()>;
    async fn store_state(&mut self, run_id: &Uuid, state: &RunState, ttl_seconds: u64) -> Result<()>;
    async fn store_report(&mut self, report: &GradeReport, ttl_seconds: u64) -> Result<()>;
    async fn get_progress(&mut self, exercise_id: &str) -> Result<Option<ExerciseProgress>>;
    async fn store_progress(&mut self, exercise_id: &str, progress: &ExerciseProgress) -> Result<()>;
}

#[async_trait]
impl RunStore for ConnectionManager {
    async fn is_cancelled(&mut self, run_id: &Uuid) -> Result<bool> {
        Ok(redis::is_cancelled(self, run_id).await?)
    }

    async fn append_partial(&mut self, run_id: &Uuid, result: &TestResult, ttl_seconds: u64) -> Result<()> {
        Ok(redis::append_partial(self, run_id, result, ttl_seconds).await?)
    }

    async fn store_state(&mut self, run_id: &Uuid, state: &RunState, ttl_seconds: u64) -> Result<()> {
        Ok(redis::store_state(self, run_id, state, ttl_seconds).await?)
    }

    async fn store_report(&mut self, report: &GradeReport, ttl_seconds: u64) -> Result<()> {
        Ok(redis::store_report(self, report, ttl_seconds).await?)
    }

    async fn get_progress(&mut self, exercise_id: &str) -> Result<Option<ExerciseProgress>> {
        Ok(redis::get_progress(self, exercise_id).await?)
    }

    async fn store_progress(&mut self, exercise_id: &str, progress: &ExerciseProgress) -> Result<()> {
        Ok(redis::store_progress(self, exercise_id, progress).await?)
    }
}

/// Final status for a finished batch
pub fn final_status(run: &BatchRun) -> JobStatus {
    match run.stopped {
        Some(StopReason::Cancelled) => JobStatus::Cancelled,
        Some(StopReason::Infrastructure) => JobStatus::Failed,
        None => JobStatus::Completed,
    }
}

/// Assemble the stored report from a finished run
pub fn build_report(job: &GradeJob, run: &BatchRun, previous: Option<&ExerciseProgress>) -> GradeReport {
    let agg = aggregate(&run.results);
    let summary = agg.summary_of(run.total);
    let progress = ExerciseProgress::record(previous, &summary);

    GradeReport {
        run_id: job.id,
        exercise_id: job.exercise_id.clone(),
        status: final_status(run),
        summary,
        all_passed: agg.all_passed && run.results.len() == run.total,
        first_failure: agg.first_failure,
        results: run.results.clone(),
        stopped: run.stopped,
        progress,
        finished_at: Utc::now(),
    }
}

/// Poll the cancel flag until the token fires or the flag is seen
async fn watch_cancel<S: RunStore>(mut store: S, run_id: Uuid, token: CancellationToken) {
    loop {
        tokio::select! {
            _ = token.cancelled() => return,
            _ = tokio::time::sleep(CANCEL_POLL_INTERVAL) => {}
        }
        match store.is_cancelled(&run_id).await {
            Ok(true) => {
                info!(run_id = %run_id, "Cancel flag observed");
                token.cancel();
                return;
            }
            Ok(false) => {}
            Err(e) => warn!(run_id = %run_id, error = %e, "Cancel flag check failed"),
        }
    }
}

/// Persist harness events in arrival order
async fn stream_events<S: RunStore>(
    mut store: S,
    run_id: Uuid,
    mut events: mpsc::UnboundedReceiver<BatchEvent>,
    ttl_seconds: u64,
) {
    while let Some(event) = events.recv().await {
        let outcome = match event {
            BatchEvent::Result { index, result } => {
                debug!(run_id = %run_id, case = index + 1, passed = result.passed, "Streaming result");
                store.append_partial(&run_id, &result, ttl_seconds).await
            }
            BatchEvent::Progress { current, total } => {
                let state = RunState {
                    status: JobStatus::Running,
                    current,
                    total,
                };
                store.store_state(&run_id, &state, ttl_seconds).await
            }
        };
        if let Err(e) = outcome {
            // Partial views are best-effort; the final report is authoritative
            warn!(run_id = %run_id, error = %e, "Failed to stream batch event");
        }
    }
}

/// Run the batch with the watcher and streamer alive, and stop both on return
async fn run_batch<S: RunStore>(
    job: &GradeJob,
    harness: &BatchHarness,
    store: &mut S,
    ttl_seconds: u64,
) -> BatchRun {
    let token = CancellationToken::new();
    let watcher = tokio::spawn(watch_cancel(store.clone(), job.id, token.clone()));

    let (tx, rx) = mpsc::unbounded_channel();
    let streamer = tokio::spawn(stream_events(store.clone(), job.id, rx, ttl_seconds));

    // A cancel may already be waiting for a job that never started
    match store.is_cancelled(&job.id).await {
        Ok(true) => {
            info!("Run cancelled before start");
            token.cancel();
        }
        Ok(false) => {}
        Err(e) => warn!(error = %e, "Pre-start cancel check failed; the watcher keeps polling"),
    }

    let run = harness
        .run_scaffolded(
            &job.header,
            &job.source,
            &job.footer,
            &job.test_cases,
            job.timeout_ms,
            &tx,
            token.clone(),
        )
        .await;

    // Stop the watcher and let the streamer drain before the report lands
    token.cancel();
    drop(tx);
    if let Err(e) = watcher.await {
        error!(error = %e, "Cancel watcher panicked");
    }
    if let Err(e) = streamer.await {
        error!(error = %e, "Event streamer panicked");
    }
    run
}

#[tracing::instrument(skip_all, fields(run_id = %job.id, exercise_id = %job.exercise_id))]
pub async fn execute_job<S: RunStore>(
    job: &GradeJob,
    harness: &BatchHarness,
    store: &mut S,
    ttl_seconds: u64,
) -> Result<GradeReport> {
    let run = run_batch(job, harness, store, ttl_seconds).await;

    // Without the stored tuple the report counts this attempt alone, and the
    // stored tuple is left untouched rather than overwritten with it
    let previous = match store.get_progress(&job.exercise_id).await {
        Ok(previous) => Some(previous),
        Err(e) => {
            warn!(error = %e, "Failed to read exercise progress");
            None
        }
    };
    let report = build_report(job, &run, previous.as_ref().and_then(Option::as_ref));

    if let Err(e) = store.store_report(&report, ttl_seconds).await {
        error!(error = %e, "Failed to store report");
        let state = RunState {
            status: JobStatus::Failed,
            current: run.current,
            total: run.total,
        };
        if let Err(e) = store.store_state(&job.id, &state, ttl_seconds).await {
            error!(error = %e, "Failed to mark run as failed");
        }
        return Err(e);
    }

    if previous.is_some() {
        if let Err(e) = store.store_progress(&job.exercise_id, &report.progress).await {
            warn!(error = %e, "Failed to store exercise progress");
        }
    }

    info!(
        status = ?report.status,
        passed = report.summary.passed,
        total = report.summary.total,
        score = report.summary.score,
        "Report stored"
    );
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use gradebox_common::types::TestCase;
    use gradebox_engine::sandbox::SandboxStatus;
    use gradebox_engine::{Sandbox, SandboxError, SandboxRequest, SandboxResponse};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};

    fn job(cases: usize) -> GradeJob {
        GradeJob {
            id: Uuid::new_v4(),
            exercise_id: "squares".to_string(),
            language: "python".to_string(),
            header: String::new(),
            source: "print(int(input())**2)".to_string(),
            footer: String::new(),
            test_cases: (0..cases).map(|i| TestCase::new(i.to_string(), "x")).collect(),
            timeout_ms: 1000,
            submitted_at: Utc::now(),
        }
    }

    fn result(passed: bool) -> TestResult {
        TestResult {
            input: String::new(),
            expected_output: "x".to_string(),
            actual_output: Some(if passed { "x" } else { "y" }.to_string()),
            passed,
            error_kind: None,
            error_message: None,
            execution_time_ms: Some(3),
            hidden: false,
        }
    }

    fn run(results: Vec<TestResult>, total: usize, stopped: Option<StopReason>) -> BatchRun {
        BatchRun {
            current: results.len(),
            results,
            total,
            stopped,
            cancellation: CancellationToken::new(),
        }
    }

    #[test]
    fn test_report_for_partial_pass() {
        let job = job(3);
        let run = run(vec![result(true), result(false), result(true)], 3, None);

        let report = build_report(&job, &run, None);

        assert_eq!(report.status, JobStatus::Completed);
        assert_eq!(report.summary.passed, 2);
        assert_eq!(report.summary.score, 67);
        assert!(!report.all_passed);
        assert_eq!(report.first_failure, Some(1));
        assert_eq!(report.progress.attempts, 1);
        assert_eq!(report.progress.best_score, 67);
    }

    #[test]
    fn test_cancelled_run_is_never_all_passed() {
        let job = job(5);
        let run = run(vec![result(true), result(true)], 5, Some(StopReason::Cancelled));

        let report = build_report(&job, &run, None);

        assert_eq!(report.status, JobStatus::Cancelled);
        assert!(!report.all_passed);
        assert_eq!(report.summary.total, 5);
        assert_eq!(report.summary.score, 40);
        assert!(!report.progress.completed);
    }

    #[test]
    fn test_infrastructure_stop_is_failed() {
        let job = job(2);
        let run = run(vec![result(false)], 2, Some(StopReason::Infrastructure));
        assert_eq!(build_report(&job, &run, None).status, JobStatus::Failed);
    }

    #[test]
    fn test_progress_folds_previous_attempt() {
        let job = job(2);
        let previous = ExerciseProgress {
            attempts: 3,
            completed: true,
            best_score: 100,
        };
        let run = run(vec![result(false), result(false)], 2, None);

        let report = build_report(&job, &run, Some(&previous));

        assert_eq!(report.progress.attempts, 4);
        assert!(report.progress.completed);
        assert_eq!(report.progress.best_score, 100);
    }

    /// Echoes "x" for every case
    struct EchoSandbox;

    #[async_trait]
    impl Sandbox for EchoSandbox {
        async fn submit(&self, _request: SandboxRequest) -> Result<SandboxResponse, SandboxError> {
            Ok(SandboxResponse {
                status: SandboxStatus::Accepted,
                stdout: "x\n".to_string(),
                stderr: String::new(),
                time_ms: Some(1),
            })
        }

        fn program_file(&self) -> &str {
            "main.py"
        }
    }

    #[derive(Default)]
    struct Stored {
        reports: Vec<GradeReport>,
        states: Vec<RunState>,
        partials: usize,
        progress: Option<ExerciseProgress>,
        progress_writes: usize,
    }

    /// In-memory store whose reads can be made to fail
    #[derive(Clone, Default)]
    struct MemoryStore {
        stored: Arc<Mutex<Stored>>,
        cancel_checks: Arc<AtomicUsize>,
        fail_cancel_check: bool,
        fail_progress_read: bool,
        fail_report: bool,
    }

    #[async_trait]
    impl RunStore for MemoryStore {
        async fn is_cancelled(&mut self, _run_id: &Uuid) -> Result<bool> {
            self.cancel_checks.fetch_add(1, Ordering::SeqCst);
            if self.fail_cancel_check {
                anyhow::bail!("connection reset");
            }
            Ok(false)
        }

        async fn append_partial(&mut self, _run_id: &Uuid, _result: &TestResult, _ttl: u64) -> Result<()> {
            self.stored.lock().unwrap().partials += 1;
            Ok(())
        }

        async fn store_state(&mut self, _run_id: &Uuid, state: &RunState, _ttl: u64) -> Result<()> {
            self.stored.lock().unwrap().states.push(state.clone());
            Ok(())
        }

        async fn store_report(&mut self, report: &GradeReport, _ttl: u64) -> Result<()> {
            if self.fail_report {
                anyhow::bail!("connection reset");
            }
            self.stored.lock().unwrap().reports.push(report.clone());
            Ok(())
        }

        async fn get_progress(&mut self, _exercise_id: &str) -> Result<Option<ExerciseProgress>> {
            if self.fail_progress_read {
                anyhow::bail!("connection reset");
            }
            Ok(self.stored.lock().unwrap().progress)
        }

        async fn store_progress(&mut self, _exercise_id: &str, progress: &ExerciseProgress) -> Result<()> {
            let mut stored = self.stored.lock().unwrap();
            stored.progress = Some(*progress);
            stored.progress_writes += 1;
            Ok(())
        }
    }

    fn harness() -> BatchHarness {
        BatchHarness::new(Arc::new(EchoSandbox))
    }

    #[tokio::test]
    async fn test_job_stores_report_and_progress() {
        let mut store = MemoryStore::default();
        let report = execute_job(&job(2), &harness(), &mut store, 60).await.unwrap();

        assert!(report.all_passed);
        let stored = store.stored.lock().unwrap();
        assert_eq!(stored.reports.len(), 1);
        assert_eq!(stored.partials, 2);
        assert_eq!(stored.progress.as_ref().map(|p| p.attempts), Some(1));
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_cancel_check_still_finishes_and_stops_watcher() {
        let mut store = MemoryStore {
            fail_cancel_check: true,
            ..Default::default()
        };

        let report = execute_job(&job(3), &harness(), &mut store, 60).await.unwrap();
        assert_eq!(report.status, JobStatus::Completed);
        assert_eq!(store.stored.lock().unwrap().reports.len(), 1);

        let checks = store.cancel_checks.load(Ordering::SeqCst);
        tokio::time::sleep(CANCEL_POLL_INTERVAL * 10).await;
        assert_eq!(store.cancel_checks.load(Ordering::SeqCst), checks);
    }

    #[tokio::test]
    async fn test_progress_read_failure_keeps_report_and_stored_tuple() {
        let mut store = MemoryStore {
            fail_progress_read: true,
            ..Default::default()
        };
        store.stored.lock().unwrap().progress = Some(ExerciseProgress {
            attempts: 7,
            completed: true,
            best_score: 100,
        });

        let report = execute_job(&job(1), &harness(), &mut store, 60).await.unwrap();

        let stored = store.stored.lock().unwrap();
        assert_eq!(stored.reports.len(), 1);
        assert_eq!(report.progress.attempts, 1);
        assert_eq!(stored.progress_writes, 0);
        assert_eq!(stored.progress.as_ref().map(|p| p.attempts), Some(7));
    }

    #[tokio::test]
    async fn test_report_failure_marks_run_failed() {
        let mut store = MemoryStore {
            fail_report: true,
            ..Default::default()
        };

        assert!(execute_job(&job(2), &harness(), &mut store, 60).await.is_err());

        let stored = store.stored.lock().unwrap();
        let last = stored.states.last().unwrap();
        assert_eq!(last.status, JobStatus::Failed);
        assert_eq!(last.current, 2);
        assert_eq!(stored.progress_writes, 0);
    }
}
