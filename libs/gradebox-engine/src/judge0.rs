// HTTP sandbox client for Judge0-compatible execution services

use crate::sandbox::{
    submission_budget, EchoMode, Sandbox, SandboxError, SandboxRequest, SandboxResponse, SandboxStatus,
};
use async_trait::async_trait;
use base64::{engine::general_purpose, Engine as _};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

/// Python 3 on a stock Judge0 CE install
pub const DEFAULT_LANGUAGE_ID: u32 = 71;

/// Judge0 writes interpreted-language submissions to this file inside its box
pub const PROGRAM_FILE: &str = "script.py";

#[derive(Debug, Serialize)]
struct SubmissionBody {
    source_code: String,
    language_id: u32,
    stdin: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    expected_output: Option<String>,
    cpu_time_limit: f64,
    wall_time_limit: f64,
}

#[derive(Debug, Deserialize)]
struct StatusReply {
    id: u32,
}

#[derive(Debug, Deserialize)]
struct SubmissionReply {
    stdout: Option<String>,
    stderr: Option<String>,
    compile_output: Option<String>,
    message: Option<String>,
    status: Option<StatusReply>,
    time: Option<String>,
}

pub struct HttpSandbox {
    client: reqwest::Client,
    base_url: String,
    token: Option<String>,
    language_id: u32,
    program_file: String,
}

impl HttpSandbox {
    pub fn new(base_url: impl Into<String>, language_id: u32) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
            token: None,
            language_id,
            program_file: PROGRAM_FILE.to_string(),
        }
    }

    /// Override the traceback file name for languages Judge0 stores elsewhere
    pub fn with_program_file(mut self, program_file: impl Into<String>) -> Self {
        self.program_file = program_file.into();
        self
    }

    pub fn with_token(mut self, token: Option<String>) -> Self {
        self.token = token;
        self
    }

    fn submission_url(&self, echo_mode: EchoMode) -> String {
        format!(
            "{}/submissions?base64_encoded={}&wait=true",
            self.base_url,
            echo_mode == EchoMode::Base64
        )
    }
}

fn encode_field(value: &str, echo_mode: EchoMode) -> String {
    match echo_mode {
        EchoMode::Plain => value.to_string(),
        EchoMode::Base64 => general_purpose::STANDARD.encode(value),
    }
}

fn decode_field(value: Option<String>, echo_mode: EchoMode) -> Result<String, SandboxError> {
    let value = match value {
        Some(v) => v,
        None => return Ok(String::new()),
    };
    match echo_mode {
        EchoMode::Plain => Ok(value),
        EchoMode::Base64 => {
            // Judge0 wraps base64 output every 60 columns
            let compact: String = value.chars().filter(|c| !c.is_whitespace()).collect();
            let bytes = general_purpose::STANDARD
                .decode(compact)
                .map_err(|e| SandboxError::Protocol(format!("invalid base64 in reply: {}", e)))?;
            Ok(String::from_utf8_lossy(&bytes).into_owned())
        }
    }
}

fn build_body(request: &SandboxRequest, language_id: u32) -> SubmissionBody {
    let seconds = request.timeout_ms as f64 / 1000.0;
    SubmissionBody {
        source_code: encode_field(&request.source, request.echo_mode),
        language_id,
        stdin: encode_field(&request.stdin, request.echo_mode),
        expected_output: request
            .expected_output
            .as_deref()
            .map(|e| encode_field(e, request.echo_mode)),
        cpu_time_limit: seconds,
        wall_time_limit: seconds * 2.0,
    }
}

fn parse_reply(reply: SubmissionReply, echo_mode: EchoMode) -> Result<SandboxResponse, SandboxError> {
    let status = reply
        .status
        .map(|s| SandboxStatus::from_code(s.id))
        .ok_or_else(|| SandboxError::Protocol("reply has no status".to_string()))?;

    let stdout = decode_field(reply.stdout, echo_mode)?;
    let mut stderr = decode_field(reply.stderr, echo_mode)?;
    let compile_output = decode_field(reply.compile_output, echo_mode)?;
    let message = decode_field(reply.message, echo_mode)?;

    if stderr.trim().is_empty() && !compile_output.trim().is_empty() {
        stderr = compile_output;
    }
    if !message.trim().is_empty() && status != SandboxStatus::Accepted {
        if !stderr.is_empty() && !stderr.ends_with('\n') {
            stderr.push('\n');
        }
        stderr.push_str(message.trim());
    }

    let time_ms = reply
        .time
        .and_then(|t| t.trim().parse::<f64>().ok())
        .map(|secs| (secs * 1000.0).round() as u64);

    Ok(SandboxResponse {
        status,
        stdout,
        stderr,
        time_ms,
    })
}

#[async_trait]
impl Sandbox for HttpSandbox {
    #[tracing::instrument(skip(self, request), fields(timeout_ms = request.timeout_ms))]
    async fn submit(&self, request: SandboxRequest) -> Result<SandboxResponse, SandboxError> {
        request.validate()?;

        let body = build_body(&request, self.language_id);
        let mut http = self
            .client
            .post(self.submission_url(request.echo_mode))
            .timeout(submission_budget(request.timeout_ms))
            .json(&body);
        if let Some(token) = &self.token {
            http = http.header("X-Auth-Token", token);
        }

        let response = http
            .send()
            .await
            .map_err(|e| SandboxError::Transport(e.to_string()))?;

        let status = response.status();
        if status.is_server_error() {
            warn!(http_status = %status, "Sandbox service error");
            return Err(SandboxError::Transport(format!("service returned {}", status)));
        }
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(SandboxError::Protocol(format!(
                "service returned {}: {}",
                status,
                text.chars().take(200).collect::<String>()
            )));
        }

        let reply: SubmissionReply = response
            .json()
            .await
            .map_err(|e| SandboxError::Protocol(format!("malformed reply: {}", e)))?;

        let parsed = parse_reply(reply, request.echo_mode)?;
        debug!(status = ?parsed.status, time_ms = ?parsed.time_ms, "Sandbox reply");
        Ok(parsed)
    }

    fn program_file(&self) -> &str {
        &self.program_file
    }
}
