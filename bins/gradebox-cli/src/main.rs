mod commands;

use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "gradebox-cli")]
#[command(about = "Gradebox CLI - Run learner programs interactively or grade them against test cases", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a program in a live terminal session (Ctrl-D at a prompt resets it)
    Run {
        /// Learner source file
        file: PathBuf,

        /// Setup code executed before the learner's code
        #[arg(long)]
        header: Option<PathBuf>,

        /// Grading code executed after the learner's code
        #[arg(long)]
        footer: Option<PathBuf>,
    },

    /// Grade a program against test cases through a sandbox service
    Test {
        /// Learner source file
        file: PathBuf,

        /// JSON array of {"input", "expected_output", "hidden"?}
        #[arg(short, long)]
        cases: PathBuf,

        /// Judge0-compatible service URL (defaults to SANDBOX_URL)
        #[arg(long)]
        sandbox_url: Option<String>,

        /// Language id understood by the service
        #[arg(long, default_value = "71")]
        language_id: u32,

        /// Per-test timeout in milliseconds (defaults to PER_TEST_TIMEOUT_MS)
        #[arg(short, long)]
        timeout_ms: Option<u64>,

        #[arg(long)]
        header: Option<PathBuf>,

        #[arg(long)]
        footer: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Run { file, header, footer } => {
            commands::run_interactive(&file, header.as_deref(), footer.as_deref()).await?;
        }
        Commands::Test {
            file,
            cases,
            sandbox_url,
            language_id,
            timeout_ms,
            header,
            footer,
        } => {
            let all_passed = commands::run_tests(commands::TestArgs {
                file: &file,
                cases: &cases,
                sandbox_url: sandbox_url.as_deref(),
                language_id,
                timeout_ms,
                header: header.as_deref(),
                footer: footer.as_deref(),
            })
            .await?;
            if !all_passed {
                std::process::exit(1);
            }
        }
    }

    Ok(())
}
