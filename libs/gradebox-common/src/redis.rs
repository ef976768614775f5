use crate::types::{ExerciseProgress, GradeJob, GradeReport, RunState, TestResult};
use redis::{AsyncCommands, RedisResult};
use serde::{de::DeserializeOwned, Serialize};
use uuid::Uuid;

/// Redis key semantics shared by API and worker
/// Keys are deterministic so both sides never drift

pub const QUEUE_PREFIX: &str = "gradebox:queue";
pub const RESULT_PREFIX: &str = "gradebox:result";
pub const STATUS_PREFIX: &str = "gradebox:status";
pub const PARTIAL_PREFIX: &str = "gradebox:partial";
pub const CANCEL_PREFIX: &str = "gradebox:cancel";
pub const PROGRESS_PREFIX: &str = "gradebox:progress";

/// Queue for a language
pub fn queue_name(language: &str) -> String {
    format!("{}:{}", QUEUE_PREFIX, language.to_lowercase())
}

pub fn result_key(run_id: &Uuid) -> String {
    format!("{}:{}", RESULT_PREFIX, run_id)
}

pub fn status_key(run_id: &Uuid) -> String {
    format!("{}:{}", STATUS_PREFIX, run_id)
}

/// List of TestResults streamed while a run is in progress
pub fn partial_key(run_id: &Uuid) -> String {
    format!("{}:{}", PARTIAL_PREFIX, run_id)
}

pub fn cancel_key(run_id: &Uuid) -> String {
    format!("{}:{}", CANCEL_PREFIX, run_id)
}

pub fn progress_key(exercise_id: &str) -> String {
    format!("{}:{}", PROGRESS_PREFIX, exercise_id)
}

fn encode<T: Serialize>(value: &T) -> RedisResult<String> {
    serde_json::to_string(value).map_err(|e| {
        redis::RedisError::from((redis::ErrorKind::TypeError, "serialization error", e.to_string()))
    })
}

fn decode<T: DeserializeOwned>(payload: &str) -> RedisResult<T> {
    serde_json::from_str(payload).map_err(|e| {
        redis::RedisError::from((redis::ErrorKind::TypeError, "deserialization error", e.to_string()))
    })
}

/// Push a grading job to its language queue (RPUSH for FIFO)
pub async fn push_job(
    conn: &mut redis::aio::ConnectionManager,
    job: &GradeJob,
    ttl_seconds: u64,
) -> RedisResult<()> {
    let queue = queue_name(&job.language);
    let payload = encode(job)?;

    let state = RunState {
        status: crate::types::JobStatus::Queued,
        current: 0,
        total: job.test_cases.len(),
    };
    store_state(conn, &job.id, &state, ttl_seconds).await?;

    conn.rpush(&queue, payload).await
}

/// Pop a job, blocking for at most `timeout_seconds` so shutdown stays responsive
pub async fn pop_job(
    conn: &mut redis::aio::ConnectionManager,
    language: &str,
    timeout_seconds: f64,
) -> RedisResult<Option<GradeJob>> {
    let queue = queue_name(language);
    let result: Option<(String, String)> = conn.blpop(&queue, timeout_seconds).await?;

    match result {
        Some((_key, payload)) => Ok(Some(decode(&payload)?)),
        None => Ok(None),
    }
}

pub async fn store_state(
    conn: &mut redis::aio::ConnectionManager,
    run_id: &Uuid,
    state: &RunState,
    ttl_seconds: u64,
) -> RedisResult<()> {
    let payload = encode(state)?;
    let _: () = conn.set_ex(status_key(run_id), payload, ttl_seconds).await?;
    Ok(())
}

pub async fn get_state(
    conn: &mut redis::aio::ConnectionManager,
    run_id: &Uuid,
) -> RedisResult<Option<RunState>> {
    let payload: Option<String> = conn.get(status_key(run_id)).await?;
    payload.map(|data| decode(&data)).transpose()
}

/// Append one streamed TestResult to the run's partial list
pub async fn append_partial(
    conn: &mut redis::aio::ConnectionManager,
    run_id: &Uuid,
    result: &TestResult,
    ttl_seconds: u64,
) -> RedisResult<()> {
    let key = partial_key(run_id);
    let payload = encode(result)?;
    let _: () = conn.rpush(&key, payload).await?;
    let _: () = conn.expire(&key, ttl_seconds as i64).await?;
    Ok(())
}

pub async fn get_partial(
    conn: &mut redis::aio::ConnectionManager,
    run_id: &Uuid,
) -> RedisResult<Vec<TestResult>> {
    let payloads: Vec<String> = conn.lrange(partial_key(run_id), 0, -1).await?;
    payloads.iter().map(|p| decode(p)).collect()
}

/// Store the final report and mark the run finished
pub async fn store_report(
    conn: &mut redis::aio::ConnectionManager,
    report: &GradeReport,
    ttl_seconds: u64,
) -> RedisResult<()> {
    let payload = encode(report)?;
    let _: () = conn.set_ex(result_key(&report.run_id), payload, ttl_seconds).await?;

    let state = RunState {
        status: report.status,
        current: report.results.len(),
        total: report.summary.total,
    };
    store_state(conn, &report.run_id, &state, ttl_seconds).await
}

pub async fn get_report(
    conn: &mut redis::aio::ConnectionManager,
    run_id: &Uuid,
) -> RedisResult<Option<GradeReport>> {
    let payload: Option<String> = conn.get(result_key(run_id)).await?;
    payload.map(|data| decode(&data)).transpose()
}

/// Flag a run as cancelled; workers poll this between and during test cases
pub async fn request_cancel(
    conn: &mut redis::aio::ConnectionManager,
    run_id: &Uuid,
    ttl_seconds: u64,
) -> RedisResult<()> {
    let _: () = conn.set_ex(cancel_key(run_id), "1", ttl_seconds).await?;
    Ok(())
}

pub async fn is_cancelled(
    conn: &mut redis::aio::ConnectionManager,
    run_id: &Uuid,
) -> RedisResult<bool> {
    conn.exists(cancel_key(run_id)).await
}

pub async fn get_progress(
    conn: &mut redis::aio::ConnectionManager,
    exercise_id: &str,
) -> RedisResult<Option<ExerciseProgress>> {
    let payload: Option<String> = conn.get(progress_key(exercise_id)).await?;
    payload.map(|data| decode(&data)).transpose()
}

pub async fn store_progress(
    conn: &mut redis::aio::ConnectionManager,
    exercise_id: &str,
    progress: &ExerciseProgress,
) -> RedisResult<()> {
    let payload = encode(progress)?;
    conn.set(progress_key(exercise_id), payload).await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_queue_naming() {
        assert_eq!(queue_name("python"), "gradebox:queue:python");
        assert_eq!(queue_name("Python"), "gradebox:queue:python");
    }

    #[test]
    fn test_result_key_deterministic() {
        let id = Uuid::new_v4();
        let key1 = result_key(&id);
        let key2 = result_key(&id);
        assert_eq!(key1, key2);
        assert!(key1.starts_with("gradebox:result:"));
    }

    #[test]
    fn test_run_keys_are_distinct() {
        let id = Uuid::new_v4();
        let keys = [
            result_key(&id),
            status_key(&id),
            partial_key(&id),
            cancel_key(&id),
        ];
        for (i, a) in keys.iter().enumerate() {
            assert!(a.contains(&id.to_string()));
            for b in keys.iter().skip(i + 1) {
                assert_ne!(a, b);
            }
        }
    }

    #[test]
    fn test_progress_key_format() {
        assert_eq!(progress_key("lesson-3/ex-2"), "gradebox:progress:lesson-3/ex-2");
    }
}
