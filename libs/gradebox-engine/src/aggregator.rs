/// Result Aggregator
///
/// Folds per-case results into a verdict. Pure: the same slice always yields
/// the same [`Aggregate`].
///
/// **Rules:**
/// - `all_passed` requires at least one result, all passing
/// - `first_failure` is the first failing result in original order, used to
///   drive a focused diagnostic instead of a full dump
/// - scores are computed against the number of results given; callers that
///   know the full case count (a cancelled batch) use [`Aggregate::summary_of`]
use gradebox_common::types::{ExerciseProgress, GradeSummary, TestResult};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Aggregate {
    pub all_passed: bool,
    pub passed_count: usize,
    pub total: usize,
    /// Index of the first failing result
    pub first_failure: Option<usize>,
}

impl Aggregate {
    pub fn summary(&self) -> GradeSummary {
        GradeSummary::new(self.passed_count, self.total)
    }

    /// Summary against a larger case list than was processed
    pub fn summary_of(&self, case_count: usize) -> GradeSummary {
        GradeSummary::new(self.passed_count, case_count.max(self.total))
    }

    pub fn first_failure_in<'a>(&self, results: &'a [TestResult]) -> Option<&'a TestResult> {
        self.first_failure.and_then(|i| results.get(i))
    }

    /// Progress tuple after this attempt, for the progress store to persist
    pub fn progress(&self, previous: Option<&ExerciseProgress>) -> ExerciseProgress {
        ExerciseProgress::record(previous, &self.summary())
    }
}

pub fn aggregate(results: &[TestResult]) -> Aggregate {
    let passed_count = results.iter().filter(|r| r.passed).count();
    let first_failure = results.iter().position(|r| !r.passed);

    Aggregate {
        all_passed: !results.is_empty() && first_failure.is_none(),
        passed_count,
        total: results.len(),
        first_failure,
    }
}

/// One-line human summary, e.g. `2/3 passed (67%)`
pub fn describe(aggregate: &Aggregate) -> String {
    let summary = aggregate.summary();
    format!("{}/{} passed ({}%)", summary.passed, summary.total, summary.score)
}
