mod client;
mod worker;

use std::path::PathBuf;
use std::time::{Duration, Instant};

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use serde_json::Value;

use client::{is_settled, ControlPlane};
use worker::{Reporter, WorkerEnv};

#[derive(Parser)]
#[command(name = "pgddctl")]
#[command(version, about = "pg-dd command line tool", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Control plane URL
    #[arg(long, env = "PG_DD_SERVER_URL", default_value = "http://localhost:8082")]
    server_url: String,

    /// Print raw JSON responses
    #[arg(long, global = true)]
    json: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Start a dump run
    ///
    /// Everything after `--` is passed to the worker as its command.
    #[command(verbatim_doc_comment)]
    Dispatch {
        /// Worker contract (YAML); the server default is used when omitted
        #[arg(short, long)]
        contract: Option<PathBuf>,

        /// Wait for the run to settle
        #[arg(short, long)]
        wait: bool,

        #[arg(trailing_var_arg = true, required = true)]
        commands: Vec<String>,
    },

    /// Show one run
    Status { run_id: String },

    /// List recent runs
    List {
        #[arg(short, long)]
        state: Option<String>,

        #[arg(short, long)]
        limit: Option<usize>,
    },

    /// Wait for a run to settle
    Wait {
        run_id: String,

        /// Give up after this many seconds
        #[arg(short, long, default_value_t = 43200)]
        timeout_secs: u64,
    },

    /// Force a run to failed
    Cancel {
        run_id: String,

        #[arg(short, long)]
        reason: Option<String>,
    },

    /// Report a worker outcome (reads PG_DD_TASK_TOKEN and friends)
    Signal {
        #[arg(value_enum)]
        kind: SignalKind,

        /// Error message for a failure
        #[arg(short, long)]
        error: Option<String>,

        /// JSON output for a success; defaults to the bucket and prefix
        #[arg(short, long)]
        output: Option<String>,
    },

    /// Run a program and report its outcome
    ///
    /// Heartbeats are sent while the program runs. Exit status 0 reports
    /// success, anything else reports failure.
    #[command(verbatim_doc_comment)]
    Exec {
        #[arg(long, default_value_t = 60, value_parser = clap::value_parser!(u64).range(1..))]
        heartbeat_secs: u64,

        program: String,

        #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
        args: Vec<String>,
    },
}

#[derive(Clone, Copy, ValueEnum)]
enum SignalKind {
    Success,
    Failure,
    Heartbeat,
}

fn init_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,pgddctl=debug".into()),
        )
        .with_writer(std::io::stderr)
        .init();
}

fn print_value(value: &Value, json_only: bool) -> Result<()> {
    if json_only {
        println!("{}", serde_json::to_string(value)?);
    } else {
        println!("{}", serde_json::to_string_pretty(value)?);
    }
    Ok(())
}

fn print_run(run: &Value, json_only: bool) -> Result<()> {
    if json_only {
        return print_value(run, true);
    }

    let state = run.get("state").and_then(Value::as_str).unwrap_or("unknown");
    let color = match state {
        "succeeded" => "\x1b[32m",
        "failed" | "timed_out" => "\x1b[31m",
        _ => "\x1b[33m",
    };

    println!("\n{}{}\x1b[0m", color, "=".repeat(60));
    println!("Run:      {}", run["run_id"].as_str().unwrap_or("?"));
    println!("State:    {}{}\x1b[0m", color, state);
    if let Some(prefix) = run.get("output_prefix").and_then(Value::as_str) {
        println!("Output:   s3://{}/{}", run["bucket"].as_str().unwrap_or("?"), prefix);
    }
    if let Some(aborted) = run.get("aborted").and_then(Value::as_str) {
        println!("Aborted:  {}", aborted);
    }
    if let Some(error) = run.pointer("/failure/error").and_then(Value::as_str) {
        println!("Error:    {}", error);
    }
    println!("{}{}\x1b[0m", color, "=".repeat(60));
    Ok(())
}

fn load_contract(path: &PathBuf) -> Result<Value> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read contract file: {:?}", path))?;
    serde_yaml::from_str(&raw).context("Failed to parse contract YAML")
}

async fn wait_for(api: &ControlPlane, run_id: &str, timeout: Duration) -> Result<Value> {
    let started = Instant::now();
    loop {
        let remaining = timeout.saturating_sub(started.elapsed());
        let round = remaining.min(Duration::from_secs(300)).max(Duration::from_secs(1));
        let run = api.wait_once(run_id, round).await?;
        if is_settled(&run) || started.elapsed() >= timeout {
            return Ok(run);
        }
    }
}

fn exit_code(run: &Value) -> i32 {
    match run.get("state").and_then(Value::as_str) {
        Some("succeeded") => 0,
        _ => 1,
    }
}

async fn signal(kind: SignalKind, error: Option<String>, output: Option<String>) -> Result<()> {
    let Some(env) = WorkerEnv::from_env() else {
        tracing::debug!("No task token in the environment, nothing to report");
        return Ok(());
    };
    let reporter = Reporter::new(env);

    let answer = match kind {
        SignalKind::Success => {
            let output = output
                .map(|raw| serde_json::from_str::<Value>(&raw))
                .transpose()
                .context("--output is not valid JSON")?;
            reporter.success(output).await?
        }
        SignalKind::Failure => {
            let error = error.unwrap_or_else(|| "worker failed".to_string());
            reporter.failure(&error, None).await?
        }
        SignalKind::Heartbeat => reporter.heartbeat().await?,
    };
    tracing::info!(run_id = %reporter.env().run_id, status = %answer, "Callback sent");
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    init_tracing();

    let cli = Cli::parse();
    let api = ControlPlane::new(&cli.server_url);
    tracing::debug!(server = %api.base_url(), "Using control plane");

    match cli.command {
        Commands::Dispatch {
            contract,
            wait,
            commands,
        } => {
            let contract = contract.as_ref().map(load_contract).transpose()?;
            let run = api.dispatch(&commands, contract).await?;
            print_value(&run, cli.json)?;

            if wait {
                let Some(run_id) = run.get("run_id").and_then(Value::as_str) else {
                    bail!("dispatch response carries no run_id");
                };
                let settled = wait_for(&api, run_id, Duration::from_secs(43200)).await?;
                print_run(&settled, cli.json)?;
                std::process::exit(exit_code(&settled));
            } else if !cli.json {
                if let Some(run_id) = run.get("run_id").and_then(Value::as_str) {
                    println!("\nTo wait for it:");
                    println!("  pgddctl wait {}", run_id);
                }
            }
        }
        Commands::Status { run_id } => {
            let run = api.status(&run_id).await?;
            print_run(&run, cli.json)?;
        }
        Commands::List { state, limit } => {
            let runs = api.list(state.as_deref(), limit).await?;
            if cli.json {
                print_value(&runs, true)?;
            } else {
                for run in runs.as_array().into_iter().flatten() {
                    println!(
                        "{}  {:<10}  {}",
                        run["run_id"].as_str().unwrap_or("?"),
                        run["state"].as_str().unwrap_or("?"),
                        run["created_at"].as_str().unwrap_or("")
                    );
                }
            }
        }
        Commands::Wait {
            run_id,
            timeout_secs,
        } => {
            let run = wait_for(&api, &run_id, Duration::from_secs(timeout_secs)).await?;
            print_run(&run, cli.json)?;
            std::process::exit(exit_code(&run));
        }
        Commands::Cancel { run_id, reason } => {
            let run = api.cancel(&run_id, reason.as_deref()).await?;
            print_run(&run, cli.json)?;
        }
        Commands::Signal {
            kind,
            error,
            output,
        } => {
            signal(kind, error, output).await?;
        }
        Commands::Exec {
            heartbeat_secs,
            program,
            args,
        } => {
            let reporter = WorkerEnv::from_env().map(Reporter::new);
            let code = worker::exec(
                &program,
                &args,
                reporter,
                Duration::from_secs(heartbeat_secs),
            )
            .await?;
            std::process::exit(code);
        }
    }

    Ok(())
}
