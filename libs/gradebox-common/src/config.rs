// Environment configuration shared by the API, worker and CLI

use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

/// Per-test timeouts are clamped into this window
pub const MIN_TEST_TIMEOUT_MS: u64 = 100;
pub const MAX_TEST_TIMEOUT_MS: u64 = 15_000;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid value for {name}: {value:?} ({reason})")]
    Invalid {
        name: &'static str,
        value: String,
        reason: String,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SandboxBackend {
    Docker,
    Http,
}

impl FromStr for SandboxBackend {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "docker" => Ok(SandboxBackend::Docker),
            "http" | "judge0" => Ok(SandboxBackend::Http),
            other => Err(format!("unknown sandbox backend '{}'", other)),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Config {
    pub redis_url: String,
    pub api_addr: String,
    pub sandbox_backend: SandboxBackend,
    pub sandbox_url: String,
    pub sandbox_token: Option<String>,
    pub per_test_timeout_ms: u64,
    pub interpreter_command: String,
    pub interpreter_timeout_ms: u64,
    pub interpreter_retry_delay_ms: u64,
    pub result_ttl_seconds: u64,
    pub json_logs: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            redis_url: "redis://127.0.0.1:6379".to_string(),
            api_addr: "0.0.0.0:3000".to_string(),
            sandbox_backend: SandboxBackend::Docker,
            sandbox_url: "http://127.0.0.1:2358".to_string(),
            sandbox_token: None,
            per_test_timeout_ms: 5000,
            interpreter_command: "python3".to_string(),
            interpreter_timeout_ms: 10_000,
            interpreter_retry_delay_ms: 1500,
            result_ttl_seconds: 86_400,
            json_logs: false,
        }
    }
}

impl Config {
    /// Build from process environment variables
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Build from an arbitrary variable source; unset variables keep their defaults
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();

        Ok(Self {
            redis_url: lookup("REDIS_URL").unwrap_or(defaults.redis_url),
            api_addr: lookup("API_ADDR").unwrap_or(defaults.api_addr),
            sandbox_backend: parse_var(&lookup, "SANDBOX_BACKEND", defaults.sandbox_backend)?,
            sandbox_url: lookup("SANDBOX_URL").unwrap_or(defaults.sandbox_url),
            sandbox_token: lookup("SANDBOX_TOKEN").filter(|t| !t.is_empty()),
            per_test_timeout_ms: clamp_test_timeout(parse_var(
                &lookup,
                "PER_TEST_TIMEOUT_MS",
                defaults.per_test_timeout_ms,
            )?),
            interpreter_command: lookup("INTERPRETER_COMMAND")
                .unwrap_or(defaults.interpreter_command),
            interpreter_timeout_ms: parse_var(
                &lookup,
                "INTERPRETER_TIMEOUT_MS",
                defaults.interpreter_timeout_ms,
            )?,
            interpreter_retry_delay_ms: parse_var(
                &lookup,
                "INTERPRETER_RETRY_DELAY_MS",
                defaults.interpreter_retry_delay_ms,
            )?,
            result_ttl_seconds: parse_var(&lookup, "RESULT_TTL_SECONDS", defaults.result_ttl_seconds)?,
            json_logs: lookup("LOG_FORMAT")
                .map(|f| f.eq_ignore_ascii_case("json"))
                .unwrap_or(defaults.json_logs),
        })
    }

    pub fn per_test_timeout(&self) -> Duration {
        Duration::from_millis(self.per_test_timeout_ms)
    }

    pub fn interpreter_timeout(&self) -> Duration {
        Duration::from_millis(self.interpreter_timeout_ms)
    }

    pub fn interpreter_retry_delay(&self) -> Duration {
        Duration::from_millis(self.interpreter_retry_delay_ms)
    }
}

pub fn clamp_test_timeout(timeout_ms: u64) -> u64 {
    timeout_ms.clamp(MIN_TEST_TIMEOUT_MS, MAX_TEST_TIMEOUT_MS)
}

fn parse_var<F, T>(lookup: &F, name: &'static str, default: T) -> Result<T, ConfigError>
where
    F: Fn(&str) -> Option<String>,
    T: FromStr,
    T::Err: ToString,
{
    match lookup(name) {
        None => Ok(default),
        Some(value) => value.trim().parse().map_err(|e: T::Err| ConfigError::Invalid {
            name,
            reason: e.to_string(),
            value,
        }),
    }
}
