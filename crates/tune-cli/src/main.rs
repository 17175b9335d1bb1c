use anyhow::Result;
use clap::{Parser, Subcommand};
use serde_json::{json, Value};
use std::io::{self, Write};
use std::path::PathBuf;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use tune_core::{EnvPropagation, TuneError};
use tune_runner::plan::MpiSettings;
use tune_runner::{LineDispatcher, QueueSettings, ShellSettings};

#[derive(Parser)]
#[command(name = "cicada-tune", version, about = "Iterative weight tuning driver for moses with the cicada toolkit")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run every iteration of a plan.
    Run {
        plan: PathBuf,
        #[arg(long)]
        json: bool,
    },
    /// Show artifact names and backend choice without dispatching anything.
    Describe {
        plan: PathBuf,
        #[arg(long)]
        json: bool,
    },
    /// Write a plan template.
    Init {
        #[arg(long, default_value = "tune.yaml")]
        output: PathBuf,
        #[arg(long)]
        force: bool,
    },
    /// Run command lines from stdin through PBS, MPI or a thread pool.
    Sh {
        #[arg(long, default_value_t = 1)]
        threads: u32,
        #[arg(long, default_value_t = 4.0)]
        max_malloc: f64,
        #[arg(long)]
        cicada_dir: Option<PathBuf>,
        #[arg(long)]
        mpi_dir: Option<PathBuf>,
        /// Number of MPI processes.
        #[arg(long, default_value_t = 0)]
        mpi: u32,
        #[arg(long)]
        mpi_host: Option<String>,
        #[arg(long)]
        mpi_host_file: Option<PathBuf>,
        #[arg(long, default_value = "")]
        mpi_options: String,
        #[arg(long)]
        pbs: bool,
        #[arg(long, default_value = "cicada-sh")]
        pbs_name: String,
        #[arg(long)]
        pbs_queue: Option<String>,
        #[arg(long)]
        pbs_after: Option<String>,
        #[arg(long)]
        pbs_before: Option<String>,
        #[arg(long)]
        pbs_non_block: bool,
        #[arg(long)]
        json: bool,
    },
}

fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(io::stderr))
        .init();

    let cli = Cli::parse();
    let json_mode = command_json_mode(&cli.command);
    match run_command(cli.command) {
        Ok(Some(payload)) => {
            emit_json(&payload);
            Ok(())
        }
        Ok(None) => Ok(()),
        Err(err) => {
            let tune = err.downcast_ref::<TuneError>();
            let exit = tune.map(TuneError::exit_code).unwrap_or(1);
            if json_mode {
                let code = tune.map(TuneError::code).unwrap_or("command_failed");
                let details = match tune {
                    Some(TuneError::JobFailure { name, code: status }) => {
                        json!({"job": name, "exit_code": status})
                    }
                    _ => json!({}),
                };
                emit_json(&json_error(code, err.to_string(), details));
                std::process::exit(exit);
            }
            if exit != 1 {
                eprintln!("Error: {:#}", err);
                std::process::exit(exit);
            }
            Err(err)
        }
    }
}

fn run_command(command: Commands) -> Result<Option<Value>> {
    match command {
        Commands::Run { plan, json } => {
            let mut pipeline = tune_runner::prepare_pipeline(&plan)?;
            let lineage = pipeline.run()?.clone();
            let manifest = tune_runner::pipeline::manifest_path(pipeline.plan());
            let jobs = pipeline.supervisor().dispatched();
            let weights = lineage.last().map(|a| a.weights.display().to_string());
            tracing::info!(jobs, manifest = %manifest.display(), "run finished");
            if json {
                return Ok(Some(json!({
                    "ok": true,
                    "command": "run",
                    "jobs": jobs,
                    "weights": weights,
                    "manifest": manifest.display().to_string(),
                    "lineage": serde_json::to_value(&lineage)?
                })));
            }
            println!("iterations: {}", lineage.iterations.iter().filter(|a| a.executed).count());
            println!("jobs: {}", jobs);
            if let Some(w) = weights {
                println!("weights: {}", w);
            }
            println!("manifest: {}", manifest.display());
        }
        Commands::Describe { plan, json } => {
            let summary = tune_runner::describe_plan(&plan)?;
            if json {
                return Ok(Some(json!({
                    "ok": true,
                    "command": "describe",
                    "summary": serde_json::to_value(&summary)?
                })));
            }
            print_summary(&summary);
        }
        Commands::Init { output, force } => {
            if !force && output.exists() {
                return Err(anyhow::anyhow!(
                    "init file already exists (use --force): {}",
                    output.display()
                ));
            }
            if let Some(parent) = output.parent().filter(|p| !p.as_os_str().is_empty()) {
                std::fs::create_dir_all(parent)?;
            }
            std::fs::write(&output, tune_runner::PLAN_TEMPLATE)?;
            println!("wrote: {}", output.display());
        }
        Commands::Sh {
            threads,
            max_malloc,
            cicada_dir,
            mpi_dir,
            mpi,
            mpi_host,
            mpi_host_file,
            mpi_options,
            pbs,
            pbs_name,
            pbs_queue,
            pbs_after,
            pbs_before,
            pbs_non_block,
            json,
        } => {
            let settings = ShellSettings {
                threads,
                max_malloc,
                cicada_dir,
                mpi: Some(MpiSettings {
                    processes: mpi,
                    host: mpi_host,
                    host_file: mpi_host_file,
                    options: mpi_options,
                    dir: mpi_dir,
                }),
                pbs: pbs.then(|| QueueSettings {
                    queue: pbs_queue,
                    non_blocking: pbs_non_block,
                    after: pbs_after,
                    before: pbs_before,
                }),
                pbs_name,
            };
            let backend = settings.backend().label();
            let mut dispatcher = LineDispatcher::start(&settings, EnvPropagation::from_env())?;
            let lines = dispatcher.run(io::stdin().lock())?;
            dispatcher.finish()?;
            if json {
                return Ok(Some(json!({
                    "ok": true,
                    "command": "sh",
                    "backend": backend,
                    "lines": lines,
                    "submissions": dispatcher.submissions()
                })));
            }
            let mut out = io::stdout().lock();
            for id in dispatcher.submissions() {
                writeln!(out, "{}", id)?;
            }
        }
    }
    Ok(None)
}

fn print_summary(summary: &tune_runner::PlanSummary) {
    println!("mode: {}", summary.mode.as_str());
    println!("prefix: {}", summary.prefix);
    println!("iterations: {}..{}", summary.first, summary.last);
    println!("backend: {}", summary.backend);
    if let Some(np) = summary.mpi_processes {
        println!("mpi_processes: {}", np);
    }
    println!("initial_weights: {}", summary.lineage.initial_weights.display());
    for a in &summary.lineage.iterations {
        let state = if a.executed { "run" } else { "resume" };
        println!(
            "{:>4} [{}] {} -> {}",
            a.iteration,
            state,
            a.weights_input.display(),
            a.weights.display()
        );
    }
    println!("manifest: {}", summary.manifest.display());
}

fn emit_json(value: &Value) {
    match serde_json::to_string(value) {
        Ok(s) => println!("{}", s),
        Err(_) => println!(
            "{{\"ok\":false,\"error\":{{\"code\":\"serialization_error\",\"message\":\"failed to serialize JSON payload\",\"details\":{{}}}}}}"
        ),
    }
}

fn json_error(code: &str, message: String, details: Value) -> Value {
    json!({
        "ok": false,
        "error": {
            "code": code,
            "message": message,
            "details": details
        }
    })
}

fn command_json_mode(command: &Commands) -> bool {
    match command {
        Commands::Run { json, .. } | Commands::Describe { json, .. } | Commands::Sh { json, .. } => {
            *json
        }
        Commands::Init { .. } => false,
    }
}
