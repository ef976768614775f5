/// Remote Sandbox Contract
///
/// **Core Responsibility:**
/// Run one submission against one stdin and report raw status, streams and
/// timing. Implementations know HOW code runs (HTTP service, Docker, ...);
/// they never judge correctness. The harness does that.
///
/// **Status Space:**
/// Raw service statuses collapse into four [`ExecutionOutcome`]s:
/// - Accepted / WrongAnswer → Success (the program ran; comparison is local)
/// - TimeLimitExceeded → Timeout
/// - CompilationError / RuntimeError → RuntimeError
/// - everything else → InfraError
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

/// Safety limits so pathological inputs never reach the service
pub const MAX_SOURCE_CODE_BYTES: usize = 1024 * 1024; // 1MB
pub const MAX_TEST_INPUT_BYTES: usize = 10 * 1024 * 1024; // 10MB

/// Wall-clock allowance on top of the program's limit for container
/// startup, service queueing and the HTTP round trip
pub const SANDBOX_SLACK: Duration = Duration::from_secs(5);

/// How long a sandbox may take to answer one submission. The program gets
/// `timeout_ms` of CPU and twice that of wall time; the rest is slack.
pub fn submission_budget(timeout_ms: u64) -> Duration {
    Duration::from_millis(timeout_ms.saturating_mul(2)) + SANDBOX_SLACK
}

/// How payload fields travel on the wire
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EchoMode {
    #[default]
    Plain,
    Base64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SandboxRequest {
    pub source: String,
    pub stdin: String,
    pub expected_output: Option<String>,
    pub timeout_ms: u64,
    pub echo_mode: EchoMode,
}

impl SandboxRequest {
    /// Reject oversized payloads before any network call
    pub fn validate(&self) -> Result<(), SandboxError> {
        if self.source.len() > MAX_SOURCE_CODE_BYTES {
            return Err(SandboxError::InputTooLarge(format!(
                "source code exceeds maximum size of {} bytes",
                MAX_SOURCE_CODE_BYTES
            )));
        }
        if self.stdin.len() > MAX_TEST_INPUT_BYTES {
            return Err(SandboxError::InputTooLarge(format!(
                "test input exceeds maximum size of {} bytes",
                MAX_TEST_INPUT_BYTES
            )));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RuntimeErrorKind {
    Segfault,
    FileSizeExceeded,
    FloatingPoint,
    Aborted,
    NonZeroExit,
    Other,
}

/// Status reported by the sandbox service
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SandboxStatus {
    Queued,
    Processing,
    Accepted,
    WrongAnswer,
    TimeLimitExceeded,
    CompilationError,
    RuntimeError(RuntimeErrorKind),
    InternalError,
    ExecFormatError,
    Unknown(u32),
}

impl SandboxStatus {
    /// Decode a Judge0-style numeric status id
    pub fn from_code(code: u32) -> Self {
        match code {
            1 => SandboxStatus::Queued,
            2 => SandboxStatus::Processing,
            3 => SandboxStatus::Accepted,
            4 => SandboxStatus::WrongAnswer,
            5 => SandboxStatus::TimeLimitExceeded,
            6 => SandboxStatus::CompilationError,
            7 => SandboxStatus::RuntimeError(RuntimeErrorKind::Segfault),
            8 => SandboxStatus::RuntimeError(RuntimeErrorKind::FileSizeExceeded),
            9 => SandboxStatus::RuntimeError(RuntimeErrorKind::FloatingPoint),
            10 => SandboxStatus::RuntimeError(RuntimeErrorKind::Aborted),
            11 => SandboxStatus::RuntimeError(RuntimeErrorKind::NonZeroExit),
            12 => SandboxStatus::RuntimeError(RuntimeErrorKind::Other),
            13 => SandboxStatus::InternalError,
            14 => SandboxStatus::ExecFormatError,
            other => SandboxStatus::Unknown(other),
        }
    }

    pub fn outcome(&self) -> ExecutionOutcome {
        match self {
            SandboxStatus::Accepted | SandboxStatus::WrongAnswer => ExecutionOutcome::Success,
            SandboxStatus::TimeLimitExceeded => ExecutionOutcome::Timeout,
            SandboxStatus::CompilationError | SandboxStatus::RuntimeError(_) => {
                ExecutionOutcome::RuntimeError
            }
            SandboxStatus::Queued
            | SandboxStatus::Processing
            | SandboxStatus::InternalError
            | SandboxStatus::ExecFormatError
            | SandboxStatus::Unknown(_) => ExecutionOutcome::InfraError,
        }
    }

    pub fn description(&self) -> String {
        match self {
            SandboxStatus::Queued => "In queue".to_string(),
            SandboxStatus::Processing => "Processing".to_string(),
            SandboxStatus::Accepted => "Accepted".to_string(),
            SandboxStatus::WrongAnswer => "Wrong answer".to_string(),
            SandboxStatus::TimeLimitExceeded => "Time limit exceeded".to_string(),
            SandboxStatus::CompilationError => "Compilation error".to_string(),
            SandboxStatus::RuntimeError(RuntimeErrorKind::Segfault) => "Runtime error (SIGSEGV)".to_string(),
            SandboxStatus::RuntimeError(RuntimeErrorKind::FileSizeExceeded) => {
                "Runtime error (SIGXFSZ)".to_string()
            }
            SandboxStatus::RuntimeError(RuntimeErrorKind::FloatingPoint) => "Runtime error (SIGFPE)".to_string(),
            SandboxStatus::RuntimeError(RuntimeErrorKind::Aborted) => "Runtime error (SIGABRT)".to_string(),
            SandboxStatus::RuntimeError(RuntimeErrorKind::NonZeroExit) => "Runtime error (NZEC)".to_string(),
            SandboxStatus::RuntimeError(RuntimeErrorKind::Other) => "Runtime error".to_string(),
            SandboxStatus::InternalError => "Internal error".to_string(),
            SandboxStatus::ExecFormatError => "Exec format error".to_string(),
            SandboxStatus::Unknown(code) => format!("Unknown status {}", code),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionOutcome {
    Success,
    RuntimeError,
    Timeout,
    InfraError,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SandboxResponse {
    pub status: SandboxStatus,
    pub stdout: String,
    pub stderr: String,
    pub time_ms: Option<u64>,
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum SandboxError {
    /// The service could not be reached or did not answer
    #[error("sandbox unreachable: {0}")]
    Transport(String),
    /// The service answered with something we cannot interpret
    #[error("sandbox protocol error: {0}")]
    Protocol(String),
    #[error("submission rejected: {0}")]
    InputTooLarge(String),
}

#[async_trait]
pub trait Sandbox: Send + Sync {
    async fn submit(&self, request: SandboxRequest) -> Result<SandboxResponse, SandboxError>;

    /// File name the program runs under, as it appears in tracebacks
    fn program_file(&self) -> &str;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_codes_map_to_outcomes() {
        assert_eq!(SandboxStatus::from_code(3).outcome(), ExecutionOutcome::Success);
        assert_eq!(SandboxStatus::from_code(4).outcome(), ExecutionOutcome::Success);
        assert_eq!(SandboxStatus::from_code(5).outcome(), ExecutionOutcome::Timeout);
        assert_eq!(SandboxStatus::from_code(6).outcome(), ExecutionOutcome::RuntimeError);
        for code in 7..=12 {
            assert_eq!(SandboxStatus::from_code(code).outcome(), ExecutionOutcome::RuntimeError);
        }
        assert_eq!(SandboxStatus::from_code(13).outcome(), ExecutionOutcome::InfraError);
        assert_eq!(SandboxStatus::from_code(1).outcome(), ExecutionOutcome::InfraError);
        assert_eq!(SandboxStatus::from_code(99), SandboxStatus::Unknown(99));
        assert_eq!(SandboxStatus::from_code(99).outcome(), ExecutionOutcome::InfraError);
    }

    #[test]
    fn test_validate_rejects_oversized_source() {
        let request = SandboxRequest {
            source: "x".repeat(MAX_SOURCE_CODE_BYTES + 1),
            stdin: String::new(),
            expected_output: None,
            timeout_ms: 1000,
            echo_mode: EchoMode::Plain,
        };
        assert!(matches!(request.validate(), Err(SandboxError::InputTooLarge(_))));
    }

    #[test]
    fn test_validate_accepts_normal_request() {
        let request = SandboxRequest {
            source: "print(1)".to_string(),
            stdin: "5\n".to_string(),
            expected_output: Some("1".to_string()),
            timeout_ms: 1000,
            echo_mode: EchoMode::Base64,
        };
        assert!(request.validate().is_ok());
    }
}
