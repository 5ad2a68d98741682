use anyhow::{anyhow, Context, Result};
use clap::Parser;
use std::process::Stdio;
use std::sync::Arc;
use tokio::process::Command;
use tracing::{info, warn};

use testlog_collection::{JsonLinesFileWriter, ReporterLogConfig, StdoutJsonWriter, UnitLogService};
use testlog_common::{StreamType, UnitStatus};

/// Runs a command as one test unit and emits its captured log record
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Configuration file path (YAML)
    #[arg(short, long, value_name = "FILE")]
    config: Option<String>,

    /// Unit id the command's output is recorded under
    #[arg(short, long, default_value = "unit")]
    unit_id: String,

    /// Append the unit record to a JSON Lines file
    #[arg(short, long, value_name = "FILE")]
    output: Option<String>,

    /// Print the truncated report instead of the raw unit record
    #[arg(long)]
    report: bool,

    /// Enable debug logging
    #[arg(short, long)]
    debug: bool,

    /// Command to run, after `--`
    #[arg(trailing_var_arg = true, required = true, value_name = "COMMAND")]
    command: Vec<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    initialize_logging(args.debug);

    let config = match &args.config {
        Some(path) => {
            info!("Config file: {}", path);
            ReporterLogConfig::load_from_file(path)?
        }
        None => ReporterLogConfig::default(),
    };

    let service = Arc::new(
        UnitLogService::new(config).map_err(|e| anyhow!("Failed to create log service: {}", e))?,
    );
    if let Some(path) = &args.output {
        let writer = JsonLinesFileWriter::new(path)
            .map_err(|e| anyhow!("Failed to open output {}: {}", path, e))?;
        service.add_output(Box::new(writer));
    }
    if !args.report {
        service.add_output(Box::new(StdoutJsonWriter));
    }

    let exit_code = run_unit(&service, &args).await?;

    if args.report {
        let report = service
            .finalize_report()
            .map_err(|e| anyhow!("Failed to build report: {}", e))?;
        println!(
            "{}",
            serde_json::to_string_pretty(&report).context("Failed to serialize report")?
        );
    }
    service
        .close()
        .map_err(|e| anyhow!("Failed to close log service: {}", e))?;

    if exit_code != 0 {
        std::process::exit(exit_code);
    }
    Ok(())
}

async fn run_unit(service: &Arc<UnitLogService>, args: &Args) -> Result<i32> {
    let (program, program_args) = args
        .command
        .split_first()
        .ok_or_else(|| anyhow!("No command given"))?;

    service.unit_started(&args.unit_id);
    info!(unit_id = %args.unit_id, command = %program, "Starting unit");

    let mut child = Command::new(program)
        .args(program_args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()
        .with_context(|| format!("Failed to spawn command: {}", program))?;

    if let Some(stdout) = child.stdout.take() {
        service
            .collect_from_stream(&args.unit_id, stdout, StreamType::Stdout)
            .map_err(|e| anyhow!("Failed to attach stdout: {}", e))?;
    }
    if let Some(stderr) = child.stderr.take() {
        service
            .collect_from_stream(&args.unit_id, stderr, StreamType::Stderr)
            .map_err(|e| anyhow!("Failed to attach stderr: {}", e))?;
    }

    let exit_code = tokio::select! {
        status = child.wait() => {
            let status = status.context("Failed to wait for command")?;
            status.code().unwrap_or(-1)
        }
        result = tokio::signal::ctrl_c() => {
            result.context("Failed to listen for Ctrl+C")?;
            warn!(unit_id = %args.unit_id, "Interrupted, killing command");
            if let Err(e) = child.kill().await {
                warn!(error = %e, "Failed to kill command");
            }
            130
        }
    };

    let status = if exit_code == 0 {
        UnitStatus::Passed
    } else {
        service.record_failure(&args.unit_id, format!("{} exited with code {}", program, exit_code));
        UnitStatus::Failed
    };

    let logs = service
        .unit_finished(&args.unit_id, status)
        .await
        .map_err(|e| anyhow!("Failed to finish unit: {}", e))?;
    info!(
        unit_id = %args.unit_id,
        status = %status,
        entries = logs.entries.len(),
        "Unit finished"
    );
    Ok(exit_code)
}

fn initialize_logging(debug: bool) {
    let level = if debug { "debug" } else { "info" };

    // Diagnostics go to stderr; stdout carries the JSON record.
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(level)),
        )
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();
}
