use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// One grading case supplied by lesson content. Immutable once loaded.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TestCase {
    pub input: String,
    pub expected_output: String,
    /// Hidden cases are graded but never shown to the learner
    #[serde(default)]
    pub hidden: bool,
}

impl TestCase {
    pub fn new(input: impl Into<String>, expected_output: impl Into<String>) -> Self {
        Self {
            input: input.into(),
            expected_output: expected_output.into(),
            hidden: false,
        }
    }

    pub fn hidden(mut self) -> Self {
        self.hidden = true;
        self
    }
}

/// Failure taxonomy shared by the interactive and batch paths
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    InterpreterNotReady,
    InterpreterRuntime,
    InterpreterInfrastructure,
    SandboxTimeout,
    SandboxRuntime,
    SandboxInfrastructure,
    Cancelled,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let s = match self {
            ErrorKind::InterpreterNotReady => "interpreter-not-ready",
            ErrorKind::InterpreterRuntime => "interpreter-runtime-error",
            ErrorKind::InterpreterInfrastructure => "interpreter-infrastructure-error",
            ErrorKind::SandboxTimeout => "sandbox-timeout",
            ErrorKind::SandboxRuntime => "sandbox-runtime-error",
            ErrorKind::SandboxInfrastructure => "sandbox-infrastructure-error",
            ErrorKind::Cancelled => "cancelled",
        };
        write!(f, "{}", s)
    }
}

/// Outcome of running one TestCase
///
/// `passed` is true iff the sandbox reported a successful run and the
/// trimmed actual output equals the trimmed expected output.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TestResult {
    pub input: String,
    pub expected_output: String,
    /// Absent on timeout and infrastructure failure
    pub actual_output: Option<String>,
    pub passed: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_kind: Option<ErrorKind>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub execution_time_ms: Option<u64>,
    #[serde(default)]
    pub hidden: bool,
}

impl TestResult {
    /// Copy safe to show a learner: hidden cases keep only the verdict
    pub fn redacted(&self) -> Self {
        if !self.hidden {
            return self.clone();
        }
        Self {
            input: String::new(),
            expected_output: String::new(),
            actual_output: None,
            passed: self.passed,
            error_kind: self.error_kind,
            error_message: (!self.passed).then(|| "Hidden test case failed".to_string()),
            execution_time_ms: self.execution_time_ms,
            hidden: true,
        }
    }
}

/// Why a batch ended before every case was processed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StopReason {
    Cancelled,
    Infrastructure,
}

/// Rounded percentage of passed cases, 0 for an empty batch
pub fn score_percent(passed: usize, total: usize) -> u8 {
    if total == 0 {
        return 0;
    }
    let pct = (passed.min(total) as f64 * 100.0 / total as f64).round();
    pct as u8
}

/// Counts reported once a batch finishes or is cancelled
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct GradeSummary {
    pub passed: usize,
    pub total: usize,
    pub score: u8,
}

impl GradeSummary {
    pub fn new(passed: usize, total: usize) -> Self {
        Self {
            passed,
            total,
            score: score_percent(passed, total),
        }
    }

    pub fn completed(&self) -> bool {
        self.total > 0 && self.passed == self.total
    }
}

/// Per-exercise progress tuple handed to the progress-tracking store
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExerciseProgress {
    pub attempts: u32,
    pub completed: bool,
    pub best_score: u8,
}

impl ExerciseProgress {
    /// Fold one more graded attempt into the previous record
    pub fn record(previous: Option<&ExerciseProgress>, summary: &GradeSummary) -> Self {
        let previous = previous.copied().unwrap_or_default();
        Self {
            attempts: previous.attempts.saturating_add(1),
            completed: previous.completed || summary.completed(),
            best_score: previous.best_score.max(summary.score),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Queued,
    Running,
    Completed,
    Cancelled,
    Failed,
}

/// Batch grading request queued by the API and consumed by a worker
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GradeJob {
    pub id: Uuid,
    pub exercise_id: String,
    #[serde(default = "default_language")]
    pub language: String,
    #[serde(default)]
    pub header: String,
    pub source: String,
    #[serde(default)]
    pub footer: String,
    pub test_cases: Vec<TestCase>,
    pub timeout_ms: u64,
    pub submitted_at: DateTime<Utc>,
}

pub fn default_language() -> String {
    "python".to_string()
}

/// Live view of a run while the worker is still processing it
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunState {
    pub status: JobStatus,
    pub current: usize,
    pub total: usize,
}

/// Final record of a batch grading run
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GradeReport {
    pub run_id: Uuid,
    pub exercise_id: String,
    pub status: JobStatus,
    pub summary: GradeSummary,
    pub all_passed: bool,
    /// Index into `results` of the first failing case
    pub first_failure: Option<usize>,
    pub results: Vec<TestResult>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stopped: Option<StopReason>,
    pub progress: ExerciseProgress,
    pub finished_at: DateTime<Utc>,
}

impl GradeReport {
    pub fn redacted(&self) -> Self {
        Self {
            results: self.results.iter().map(TestResult::redacted).collect(),
            ..self.clone()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_score_percent() {
        assert_eq!(score_percent(2, 3), 67);
        assert_eq!(score_percent(3, 3), 100);
        assert_eq!(score_percent(0, 5), 0);
        assert_eq!(score_percent(0, 0), 0);
        assert_eq!(score_percent(7, 3), 100);
    }

    #[test]
    fn test_progress_record_keeps_best() {
        let first = ExerciseProgress::record(None, &GradeSummary::new(2, 3));
        assert_eq!(first.attempts, 1);
        assert!(!first.completed);
        assert_eq!(first.best_score, 67);

        let second = ExerciseProgress::record(Some(&first), &GradeSummary::new(3, 3));
        assert_eq!(second.attempts, 2);
        assert!(second.completed);
        assert_eq!(second.best_score, 100);

        let third = ExerciseProgress::record(Some(&second), &GradeSummary::new(1, 3));
        assert_eq!(third.attempts, 3);
        assert!(third.completed);
        assert_eq!(third.best_score, 100);
    }

    #[test]
    fn test_redacted_hides_hidden_case() {
        let result = TestResult {
            input: "secret".to_string(),
            expected_output: "42".to_string(),
            actual_output: Some("41".to_string()),
            passed: false,
            error_kind: None,
            error_message: None,
            execution_time_ms: Some(3),
            hidden: true,
        };
        let shown = result.redacted();
        assert!(shown.input.is_empty());
        assert!(shown.expected_output.is_empty());
        assert_eq!(shown.actual_output, None);
        assert!(!shown.passed);
        assert_eq!(shown.error_message.as_deref(), Some("Hidden test case failed"));

        let passing = TestResult {
            passed: true,
            actual_output: Some("42".to_string()),
            ..result.clone()
        };
        assert_eq!(passing.redacted().error_message, None);

        let visible = TestResult { hidden: false, ..result };
        assert_eq!(visible.redacted(), visible);
    }

    #[test]
    fn test_error_kind_serialization() {
        let json = serde_json::to_string(&ErrorKind::SandboxTimeout).unwrap();
        assert_eq!(json, "\"sandbox_timeout\"");
        assert_eq!(ErrorKind::SandboxTimeout.to_string(), "sandbox-timeout");
    }
}
