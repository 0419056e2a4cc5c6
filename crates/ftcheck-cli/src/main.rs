use anyhow::Result;
use clap::{Parser, Subcommand, ValueEnum};
use ftcheck_core::{parse_log_file, LogKind};
use ftcheck_runner::CheckConfig;
use serde_json::json;
use std::io;
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "ftcheck", version, about = "Functional-test log regression checker")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum KindArg {
    #[value(name = "run")]
    Run,
    #[value(name = "reference")]
    Reference,
}

impl From<KindArg> for LogKind {
    fn from(value: KindArg) -> Self {
        match value {
            KindArg::Run => LogKind::Run,
            KindArg::Reference => LogKind::Reference,
        }
    }
}

#[derive(Subcommand)]
enum Commands {
    /// Compare every test's run logs against its reference logs and write
    /// per-test report files.
    Check {
        /// Logs root holding <experiment>/<test> directories.
        #[arg(default_value = "logs")]
        root: PathBuf,
        #[arg(long)]
        config: Option<PathBuf>,
        /// Worker pool size, defaults to half the available cores.
        #[arg(long)]
        jobs: Option<usize>,
        #[arg(long)]
        json: bool,
    },
    /// Parse a single solver log and print the extracted signals.
    Describe {
        log: PathBuf,
        #[arg(long, value_enum, default_value = "run")]
        kind: KindArg,
        #[arg(long)]
        json: bool,
    },
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_writer(io::stderr)
        .init();
    let cli = Cli::parse();
    match cli.command {
        Commands::Check {
            root,
            config,
            jobs,
            json,
        } => {
            let mut config = match config {
                Some(path) => CheckConfig::load(&path)?,
                None => CheckConfig::default(),
            };
            if let Some(jobs) = jobs {
                config.jobs = Some(jobs);
                config.validate()?;
            }
            let report = if json {
                ftcheck_runner::run_batch(&root, &config, &mut io::sink())?
            } else {
                let stdout = io::stdout();
                let mut out = stdout.lock();
                ftcheck_runner::run_batch(&root, &config, &mut out)?
            };
            if json {
                let payload = json!({
                    "ok": true,
                    "command": "check",
                    "root": root.display().to_string(),
                    "total": report.total,
                    "passed": report.passed,
                    "failed": report.failed,
                    "tests": report.tests,
                });
                println!("{}", serde_json::to_string(&payload)?);
            } else {
                println!(
                    "checked: {} passed: {} failed: {}",
                    report.total, report.passed, report.failed
                );
            }
            if report.failed > 0 {
                std::process::exit(1);
            }
        }
        Commands::Describe { log, kind, json } => {
            let parsed = parse_log_file(&log, kind.into())?;
            if json {
                let payload = json!({
                    "ok": true,
                    "command": "describe",
                    "log": log.display().to_string(),
                    "kind": kind_name(kind),
                    "completed": parsed.completed,
                    "error_lines": parsed.error_lines,
                    "peak_memory_mb": parsed.peak_memory_mb,
                    "total_bricks": parsed.total_bricks,
                });
                println!("{}", serde_json::to_string(&payload)?);
            } else {
                println!("log: {}", log.display());
                println!("kind: {}", kind_name(kind));
                println!("completed: {}", parsed.completed);
                println!("error_lines: {}", parsed.error_lines.len());
                for error_line in &parsed.error_lines {
                    println!("  {}: {}", error_line.line_number, error_line.text);
                }
                println!("peak_memory_mb: {}", parsed.peak_memory_mb);
                println!("total_bricks: {}", parsed.total_bricks);
            }
        }
    }
    Ok(())
}

fn kind_name(kind: KindArg) -> &'static str {
    match kind {
        KindArg::Run => "run",
        KindArg::Reference => "reference",
    }
}
