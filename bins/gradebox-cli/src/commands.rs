// CLI commands: live session and batch grading
use anyhow::{bail, Context, Result};
use gradebox_common::config::{clamp_test_timeout, Config};
use gradebox_common::types::{TestCase, TestResult};
use gradebox_engine::{
    aggregate, BatchHarness, BatchObserver, HttpSandbox, OutputFragment, OutputKind, PythonInterpreter,
    SessionManager, SessionState, SharedInterpreter,
};
use std::fs;
use std::io::{self, Write};
use std::path::Path;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};

fn read_optional(path: Option<&Path>) -> Result<String> {
    match path {
        Some(p) => fs::read_to_string(p).with_context(|| format!("Failed to read {}", p.display())),
        None => Ok(String::new()),
    }
}

pub fn load_cases(content: &str) -> Result<Vec<TestCase>> {
    let cases: Vec<TestCase> = serde_json::from_str(content).context("Failed to parse test cases")?;
    if cases.is_empty() {
        bail!("No test cases found");
    }
    Ok(cases)
}

/// Terminal rendering of one transcript fragment
fn render(fragment: &OutputFragment) -> String {
    match fragment.kind {
        OutputKind::ProgramOutput => format!("{}\n", fragment.text),
        OutputKind::InputPrompt => fragment.display_text().to_string(),
        // The terminal already echoed what the user typed
        OutputKind::InputEcho => String::new(),
        OutputKind::SystemMessage => format!("── {}\n", fragment.text),
    }
}

pub async fn run_interactive(file: &Path, header: Option<&Path>, footer: Option<&Path>) -> Result<()> {
    let config = Config::from_env()?;
    let body = fs::read_to_string(file).with_context(|| format!("Failed to read {}", file.display()))?;
    let header = read_optional(header)?;
    let footer = read_optional(footer)?;

    let interpreter = SharedInterpreter::new(PythonInterpreter::new(
        config.interpreter_command.clone(),
        config.interpreter_timeout(),
    ));
    let session = SessionManager::new(interpreter).with_retry_delay(config.interpreter_retry_delay());

    session.on_output(|fragment| {
        let text = render(fragment);
        let mut stdout = io::stdout();
        let _ = stdout.write_all(text.as_bytes());
        let _ = stdout.flush();
    });

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut state = session.run(&header, &body, &footer).await;

    while state == SessionState::WaitingForInput {
        match lines.next_line().await? {
            Some(line) => {
                state = session.supply_input(&line).await?;
            }
            None => {
                session.reset();
                println!("\n── Session reset");
                return Ok(());
            }
        }
    }

    if state == SessionState::Failed {
        std::process::exit(1);
    }
    Ok(())
}

pub struct TestArgs<'a> {
    pub file: &'a Path,
    pub cases: &'a Path,
    pub sandbox_url: Option<&'a str>,
    pub language_id: u32,
    pub timeout_ms: Option<u64>,
    pub header: Option<&'a Path>,
    pub footer: Option<&'a Path>,
}

/// One `[i/n] PASS|FAIL` line per finished case
fn result_line(index: usize, total: usize, result: &TestResult) -> String {
    let verdict = if result.passed { "PASS" } else { "FAIL" };
    let time = result
        .execution_time_ms
        .map(|ms| format!(" ({} ms)", ms))
        .unwrap_or_default();
    format!("  [{}/{}] {}{}", index + 1, total, verdict, time)
}

struct TerminalObserver {
    total: usize,
}

impl BatchObserver for TerminalObserver {
    fn on_progress(&self, current: usize, total: usize) {
        if current == 0 {
            println!("→ Running {} test cases", total);
        }
    }

    fn on_result(&self, index: usize, result: &TestResult) {
        println!("{}", result_line(index, self.total, result));
    }
}

fn print_failure(index: usize, result: &TestResult) {
    println!("\nFirst failure: case {}", index + 1);
    if result.hidden {
        println!("  (hidden test case)");
        return;
    }
    println!("  Input:    {:?}", result.input);
    println!("  Expected: {:?}", result.expected_output.trim());
    match &result.actual_output {
        Some(actual) => println!("  Got:      {:?}", actual.trim()),
        None => println!("  Got:      (no output)"),
    }
    if let Some(message) = &result.error_message {
        println!("  Error:    {}", message);
    }
}

/// Returns whether every case passed
pub async fn run_tests(args: TestArgs<'_>) -> Result<bool> {
    let config = Config::from_env()?;
    let body = fs::read_to_string(args.file).with_context(|| format!("Failed to read {}", args.file.display()))?;
    let header = read_optional(args.header)?;
    let footer = read_optional(args.footer)?;
    let cases = load_cases(&fs::read_to_string(args.cases).context("Failed to read test cases file")?)?;

    let url = args.sandbox_url.unwrap_or(&config.sandbox_url).to_string();
    let timeout_ms = clamp_test_timeout(args.timeout_ms.unwrap_or(config.per_test_timeout_ms));

    let sandbox = HttpSandbox::new(url, args.language_id).with_token(config.sandbox_token.clone());
    let harness = Arc::new(BatchHarness::new(Arc::new(sandbox)));

    let canceller = {
        let harness = harness.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                println!("\n⚠ Cancelling...");
                harness.cancel();
            }
        })
    };

    let run = harness
        .run_scaffolded(
            &header,
            &body,
            &footer,
            &cases,
            timeout_ms,
            &TerminalObserver { total: cases.len() },
            tokio_util::sync::CancellationToken::new(),
        )
        .await;
    canceller.abort();

    let agg = aggregate(&run.results);
    let summary = agg.summary_of(run.total);
    println!();
    println!("{}/{} passed ({}%)", summary.passed, summary.total, summary.score);
    if let Some(reason) = run.stopped {
        println!("Stopped early: {:?}", reason);
    }
    if let (Some(index), Some(result)) = (agg.first_failure, agg.first_failure_in(&run.results)) {
        print_failure(index, result);
    }

    Ok(summary.completed())
}
