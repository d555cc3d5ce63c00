use anyhow::{Context, Result};
use clap::{ArgAction, Parser, Subcommand, ValueEnum};
use deployflow::config::DeployConfig;
use deployflow::errors::DeployError;
use deployflow::events::{EventSink, LoggingEventSink};
use deployflow::orchestrator::{Collaborators, Orchestrator, RunError, StatusReport};
use deployflow::pipeline::RunSummary;
use deployflow::platform::ProcessRunner;
use std::fmt::Write as _;
use std::io::{self, BufRead, Write};
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

mod progress;

use progress::ConsoleProgress;

#[derive(Parser)]
#[command(name = "deployflow")]
#[command(about = "Dependency-ordered provisioning and bring-up", long_about = None)]
#[command(version)]
struct Cli {
    /// JSON file supplying configuration defaults
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Directory holding run state
    #[arg(long, global = true)]
    state_dir: Option<PathBuf>,

    /// Log output format
    #[arg(long, global = true, value_enum, default_value_t = LogFormat::Text)]
    log_format: LogFormat,

    /// Increase log verbosity (-v, -vv, -vvv)
    #[arg(short, long, global = true, action = ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

#[derive(Debug, PartialEq, Eq, Subcommand)]
enum Commands {
    /// Provision the environment and install every service
    Deploy {
        /// Resume an earlier run instead of starting a new one
        #[arg(long)]
        run_id: Option<String>,

        /// Run the data-load job after the workload is installed
        #[arg(long)]
        load_data: bool,
    },

    /// Run only the data-load job against the latest run
    LoadData,

    /// Show stage results and service readiness
    Status {
        /// Probe service endpoints over HTTP
        #[arg(long)]
        probe: bool,

        /// Print JSON instead of a table
        #[arg(long)]
        json: bool,
    },

    /// Delete the whole resource group
    Destroy,
}

fn init_tracing(format: LogFormat, verbose: u8) {
    let default = match (format, verbose) {
        (LogFormat::Json, 0) | (_, 1) => "info",
        (LogFormat::Text, 0) => "warn",
        (_, 2) => "debug",
        _ => "trace",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .with_target(true);

    match format {
        LogFormat::Text => builder.init(),
        LogFormat::Json => builder.json().init(),
    }
}

/// Asks the operator to type `expected` back. Anything else aborts.
fn confirm<R: BufRead, W: Write>(expected: &str, mut input: R, mut output: W) -> io::Result<bool> {
    write!(
        output,
        "This deletes resource group '{expected}' and everything in it.\nType the resource group name to confirm: "
    )?;
    output.flush()?;

    let mut line = String::new();
    input.read_line(&mut line)?;
    Ok(line.trim_end_matches(['\r', '\n']) == expected)
}

/// Maps a failure to the process exit status.
fn exit_code(err: &anyhow::Error) -> u8 {
    let code = err
        .downcast_ref::<RunError>()
        .map(RunError::exit_code)
        .or_else(|| err.downcast_ref::<DeployError>().map(DeployError::exit_code))
        .unwrap_or(1);
    u8::try_from(code).ok().filter(|c| *c != 0).unwrap_or(1)
}

fn render_summary(summary: &RunSummary) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "run {}: {}", summary.run_id, summary.state);
    for result in &summary.results {
        let _ = writeln!(out, "  {:<22} {}", result.name, result.status);
    }
    if summary.has_tolerated_failures() {
        let _ = writeln!(out, "tolerated failures (follow up manually):");
        for record in &summary.tolerated {
            let _ = writeln!(out, "  {}: {}", record.subject(), record.error);
        }
    }
    out
}

fn render_status(report: &StatusReport) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "run: {}", report.run_id.as_deref().unwrap_or("none"));
    for (stage, status) in &report.stages {
        let _ = writeln!(out, "  {stage:<22} {status}");
    }
    if report.units.is_empty() {
        let _ = writeln!(out, "no services found");
        return out;
    }
    let _ = writeln!(out, "{:<36} {:<12} {:<6} ENDPOINT", "UNIT", "KIND", "READY");
    for (id, unit) in &report.units {
        let endpoint = match (&unit.endpoint, unit.reachable) {
            (Some(ep), Some(true)) => format!("{ep} (reachable)"),
            (Some(ep), Some(false)) => format!("{ep} (unreachable)"),
            (Some(ep), None) => ep.clone(),
            (None, _) => "-".to_string(),
        };
        let ready = if unit.ready { "yes" } else { "no" };
        let _ = writeln!(out, "{id:<36} {:<12} {ready:<6} {endpoint}", unit.kind);
    }
    out
}

async fn run(cli: Cli) -> Result<()> {
    let mut config = DeployConfig::from_env(cli.config.as_deref()).context("Failed to load configuration")?;
    if let Some(dir) = cli.state_dir {
        config.state_dir = dir;
    }
    if let Commands::Deploy { load_data: true, .. } = cli.command {
        config.load_data_on_deploy = true;
    }

    let runner = Arc::new(ProcessRunner::new());
    let collaborators = Collaborators::from_runner(runner, config.poll_interval());
    let events: Arc<dyn EventSink> = match cli.log_format {
        LogFormat::Text => Arc::new(ConsoleProgress::stderr()),
        LogFormat::Json => Arc::new(LoggingEventSink::default()),
    };
    let orchestrator = Orchestrator::new(config, collaborators).with_event_sink(events);

    let cancel = orchestrator.cancellation();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupted; stopping at the next stage boundary");
            cancel.cancel("interrupted by operator");
        }
    });

    match cli.command {
        Commands::Deploy { run_id, .. } => {
            let outcome = orchestrator.deploy(run_id).await;
            finish(outcome)
        }

        Commands::LoadData => {
            let outcome = orchestrator.load_data().await;
            finish(outcome)
        }

        Commands::Status { probe, json } => {
            let report = orchestrator.status(probe).await?;
            if json {
                println!("{}", serde_json::to_string_pretty(&report)?);
            } else {
                print!("{}", render_status(&report));
            }
            Ok(())
        }

        Commands::Destroy => {
            let group = orchestrator.config().resource_group();
            if !confirm(&group, io::stdin().lock(), io::stdout())? {
                println!("Aborted.");
                return Ok(());
            }
            let target = orchestrator.destroy().await?;
            println!(
                "Deletion of resource group '{}' started; it completes in the background.",
                target.resource_group
            );
            Ok(())
        }
    }
}

fn finish(outcome: Result<RunSummary, RunError>) -> Result<()> {
    match outcome {
        Ok(summary) => {
            print!("{}", render_summary(&summary));
            info!(run_id = %summary.run_id, "Run finished");
            Ok(())
        }
        Err(err) => {
            if !err.summary.results.is_empty() {
                print!("{}", render_summary(&err.summary));
            }
            Err(err.into())
        }
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    init_tracing(cli.log_format, cli.verbose);

    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("error: {err:#}");
            ExitCode::from(exit_code(&err))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use deployflow::core::{RunState, StageResult, StageStatus};
    use deployflow::pipeline::FailureRecord;
    use deployflow::platform::UnitStatus;
    use pretty_assertions::assert_eq;
    use std::collections::BTreeMap;

    #[test]
    fn test_parse_deploy() {
        let cli = Cli::try_parse_from(["deployflow", "deploy", "--run-id", "run-1", "--load-data", "-vv"]).unwrap();
        assert_eq!(
            cli.command,
            Commands::Deploy {
                run_id: Some("run-1".to_string()),
                load_data: true,
            }
        );
        assert_eq!(cli.verbose, 2);
        assert_eq!(cli.log_format, LogFormat::Text);
    }

    #[test]
    fn test_parse_global_flags_after_verb() {
        let cli = Cli::try_parse_from([
            "deployflow",
            "status",
            "--json",
            "--state-dir",
            "/tmp/state",
            "--log-format",
            "json",
        ])
        .unwrap();
        assert_eq!(cli.command, Commands::Status { probe: false, json: true });
        assert_eq!(cli.state_dir, Some(PathBuf::from("/tmp/state")));
        assert_eq!(cli.log_format, LogFormat::Json);
    }

    #[test]
    fn test_unknown_verb_rejected() {
        assert!(Cli::try_parse_from(["deployflow", "upgrade"]).is_err());
    }

    #[test]
    fn test_confirm_requires_exact_name() {
        let mut prompt = Vec::new();
        assert!(confirm("alpha-rg", "alpha-rg\n".as_bytes(), &mut prompt).unwrap());
        assert!(String::from_utf8(prompt).unwrap().contains("alpha-rg"));

        assert!(!confirm("alpha-rg", "y\n".as_bytes(), Vec::new()).unwrap());
        assert!(!confirm("alpha-rg", " alpha-rg\n".as_bytes(), Vec::new()).unwrap());
        assert!(!confirm("alpha-rg", "".as_bytes(), Vec::new()).unwrap());
    }

    #[test]
    fn test_exit_codes() {
        let timeout = anyhow::Error::new(DeployError::JobTimedOut {
            job: "alpha-ingest".to_string(),
            waited_secs: 300,
        });
        assert_eq!(exit_code(&timeout), 124);

        let install = anyhow::Error::new(DeployError::install("milvus/milvus", "timed out", Some(3)));
        assert_eq!(exit_code(&install), 3);

        assert_eq!(exit_code(&anyhow::anyhow!("bad flag")), 1);
        assert_eq!(exit_code(&anyhow::Error::new(DeployError::precondition("NGC_API_KEY"))), 1);
    }

    #[test]
    fn test_render_summary_lists_tolerated() {
        let mut summary = RunSummary::new("run-1");
        summary.state = RunState::Complete;
        summary
            .results
            .push(StageResult::skipped("attach-registry", "gate closed"));
        summary
            .tolerated
            .push(FailureRecord::new("ai-tier", "ImagePullBackOff").with_unit("nim/nim-llm"));

        let text = render_summary(&summary);
        assert!(text.starts_with("run run-1: complete\n"));
        assert!(text.contains("attach-registry"));
        assert!(text.contains("ai-tier (nim/nim-llm): ImagePullBackOff"));
    }

    #[test]
    fn test_render_status() {
        let mut stages = BTreeMap::new();
        stages.insert("infra".to_string(), StageStatus::Succeeded);
        let mut units = BTreeMap::new();
        units.insert(
            "alpha/alpha-agent".to_string(),
            UnitStatus {
                kind: "Deployment".to_string(),
                ready: true,
                endpoint: Some("20.1.2.3:80".to_string()),
                reachable: Some(true),
            },
        );
        let report = StatusReport {
            run_id: Some("run-1".to_string()),
            stages,
            units,
        };

        let text = render_status(&report);
        assert!(text.contains("run: run-1"));
        assert!(text.contains("infra"));
        assert!(text.contains("20.1.2.3:80 (reachable)"));

        let empty = StatusReport {
            run_id: None,
            stages: BTreeMap::new(),
            units: BTreeMap::new(),
        };
        assert_eq!(render_status(&empty), "run: none\nno services found\n");
    }
}
