use anyhow::{anyhow, Result};
use clap::{Parser, Subcommand};
use lst_analysis::{
    check_processed, collect_lesion_stats, longitudinal_volume_stats, LESION_STATS_REPORT,
    SAMSEG_PIPELINE_TAG, VOLUME_LESION_REPORT,
};
use lst_core::{DerivativeLayout, DEFAULT_PIPELINE_TAG};
use lst_runner::{
    plan_batch, run_batch, BatchPlan, BatchReport, Clipping, Device, ExternalTool, PipelineConfig,
    SessionOutcome,
};
use serde_json::{json, Value};
use std::path::{Path, PathBuf};
use tracing::info;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[derive(Parser)]
#[command(
    name = "lst-batch",
    version = "0.3.0",
    about = "Batch LST-AI lesion segmentation over a BIDS dataset"
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Segment every session whose lesion mask is missing.
    Run {
        #[arg(short = 'i', long = "input")]
        input: Option<PathBuf>,
        #[arg(short = 'n', long = "workers")]
        workers: Option<usize>,
        #[arg(long)]
        cpu: bool,
        #[arg(long)]
        remove_temp: bool,
        #[arg(long, num_args = 2, value_names = ["LOW", "HIGH"])]
        clipping: Option<Vec<f64>>,
        #[arg(long)]
        tool: Option<String>,
        #[arg(long)]
        tag: Option<String>,
        #[arg(long)]
        config: Option<PathBuf>,
        #[arg(long)]
        json: bool,
    },
    /// Show which subjects a run would process and how they would be sharded.
    Plan {
        #[arg(short = 'i', long = "input")]
        input: Option<PathBuf>,
        #[arg(short = 'n', long = "workers")]
        workers: Option<usize>,
        #[arg(long)]
        tag: Option<String>,
        #[arg(long)]
        config: Option<PathBuf>,
        #[arg(long)]
        json: bool,
    },
    /// Write the processed and missing session listings.
    Check {
        #[arg(short = 'i', long = "input")]
        input: PathBuf,
        #[arg(short = 'o', long = "output")]
        output: PathBuf,
        #[arg(long, default_value = DEFAULT_PIPELINE_TAG)]
        tag: String,
        #[arg(long)]
        json: bool,
    },
    /// Collect the per-session lesion statistics into one table.
    Collect {
        #[arg(short = 'i', long = "input")]
        input: PathBuf,
        #[arg(short = 'o', long = "output")]
        output: PathBuf,
        #[arg(long, default_value = DEFAULT_PIPELINE_TAG)]
        tag: String,
        #[arg(long)]
        json: bool,
    },
    /// Flatten SAMSEG longitudinal volumes and lesion counts per subject.
    Longitudinal {
        #[arg(short = 'i', long = "input")]
        input: PathBuf,
        #[arg(short = 'o', long = "output")]
        output: PathBuf,
        #[arg(long, default_value = SAMSEG_PIPELINE_TAG)]
        tag: String,
        #[arg(long)]
        json: bool,
    },
}

struct ConfigOverrides {
    input: Option<PathBuf>,
    workers: Option<usize>,
    cpu: bool,
    remove_temp: bool,
    clipping: Option<Vec<f64>>,
    tool: Option<String>,
    tag: Option<String>,
    config: Option<PathBuf>,
}

fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();
    let json_mode = command_json_mode(&cli.command);
    let result = run_command(cli.command);
    match result {
        Ok(Some(payload)) => {
            let failed = payload.get("ok") == Some(&Value::Bool(false));
            emit_json(&payload);
            if failed {
                std::process::exit(1);
            }
            Ok(())
        }
        Ok(None) => Ok(()),
        Err(err) => {
            if json_mode {
                emit_json(&json_error("command_failed", format!("{:#}", err), json!({})));
                std::process::exit(1);
            }
            Err(err)
        }
    }
}

fn run_command(command: Commands) -> Result<Option<Value>> {
    match command {
        Commands::Run {
            input,
            workers,
            cpu,
            remove_temp,
            clipping,
            tool,
            tag,
            config,
            json,
        } => {
            let config = build_config(ConfigOverrides {
                input,
                workers,
                cpu,
                remove_temp,
                clipping,
                tool,
                tag,
                config,
            })?;
            info!(
                dataset = %config.dataset_root.display(),
                tag = %config.pipeline_tag,
                workers = config.workers,
                device = config.device.as_arg(),
                "starting batch"
            );
            let tool = ExternalTool::from_config(&config);
            let report = run_batch(&config, &tool)?;
            if json {
                return Ok(Some(json!({
                    "ok": report.is_clean(),
                    "command": "run",
                    "report": batch_report_to_json(&report)?,
                })));
            }
            print_batch_report(&report);
            if !report.is_clean() {
                std::process::exit(1);
            }
        }
        Commands::Plan {
            input,
            workers,
            tag,
            config,
            json,
        } => {
            let config = build_config(ConfigOverrides {
                input,
                workers,
                cpu: false,
                remove_temp: false,
                clipping: None,
                tool: None,
                tag,
                config,
            })?;
            let plan = plan_batch(&config)?;
            if json {
                return Ok(Some(json!({
                    "ok": true,
                    "command": "plan",
                    "plan": plan_to_json(&plan),
                })));
            }
            print_plan(&plan);
        }
        Commands::Check {
            input,
            output,
            tag,
            json,
        } => {
            let derivatives = derivatives_dir(&input, &tag);
            let listing = check_processed(&input, &derivatives);
            let (missing_csv, processed_csv) = listing.write(&output)?;
            info!(
                processed = listing.processed.len(),
                missing = listing.missing.len(),
                "listings written to {}",
                output.display()
            );
            if json {
                return Ok(Some(json!({
                    "ok": true,
                    "command": "check",
                    "processed": listing.processed.len(),
                    "missing": listing.missing.len(),
                    "missing_csv": missing_csv.display().to_string(),
                    "processed_csv": processed_csv.display().to_string(),
                })));
            }
            println!("processed: {}", listing.processed.len());
            println!("missing: {}", listing.missing.len());
            println!("missing_csv: {}", missing_csv.display());
            println!("processed_csv: {}", processed_csv.display());
        }
        Commands::Collect {
            input,
            output,
            tag,
            json,
        } => {
            let table = collect_lesion_stats(&derivatives_dir(&input, &tag));
            std::fs::create_dir_all(&output)?;
            let out = output.join(LESION_STATS_REPORT);
            table.write_csv(&out)?;
            info!(rows = table.len(), "report written to {}", out.display());
            if json {
                return Ok(Some(json!({
                    "ok": true,
                    "command": "collect",
                    "rows": table.len(),
                    "csv": out.display().to_string(),
                })));
            }
            println!("rows: {}", table.len());
            println!("csv: {}", out.display());
        }
        Commands::Longitudinal {
            input,
            output,
            tag,
            json,
        } => {
            let table = longitudinal_volume_stats(&derivatives_dir(&input, &tag));
            std::fs::create_dir_all(&output)?;
            let out = output.join(VOLUME_LESION_REPORT);
            table.write_csv(&out)?;
            info!(rows = table.len(), "report written to {}", out.display());
            if json {
                return Ok(Some(json!({
                    "ok": true,
                    "command": "longitudinal",
                    "rows": table.len(),
                    "csv": out.display().to_string(),
                })));
            }
            println!("rows: {}", table.len());
            println!("csv: {}", out.display());
        }
    }
    Ok(None)
}

fn derivatives_dir(dataset_root: &Path, tag: &str) -> PathBuf {
    DerivativeLayout::new(dataset_root, tag).root().to_path_buf()
}

/// File values first, then command line flags on top.
fn build_config(overrides: ConfigOverrides) -> Result<PipelineConfig> {
    let mut config = match (&overrides.config, &overrides.input) {
        (Some(path), _) => PipelineConfig::load(path)?,
        (None, Some(input)) => PipelineConfig::new(input),
        (None, None) => return Err(anyhow!("either --input or --config is required")),
    };
    if let Some(input) = overrides.input {
        config.dataset_root = input;
    }
    if let Some(workers) = overrides.workers {
        config.workers = workers;
    }
    if overrides.cpu {
        config.device = Device::Cpu;
    }
    if overrides.remove_temp {
        config.remove_temp = true;
    }
    if let Some(bounds) = overrides.clipping {
        if let [low, high] = bounds[..] {
            config.clipping = Clipping { low, high };
        }
    }
    if let Some(tool) = overrides.tool {
        config.tool = tool;
        config.tool_args.clear();
    }
    if let Some(tag) = overrides.tag {
        config.pipeline_tag = tag;
    }
    config.validate()?;
    Ok(config)
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
        Commands::Run { json, .. }
        | Commands::Plan { json, .. }
        | Commands::Check { json, .. }
        | Commands::Collect { json, .. }
        | Commands::Longitudinal { json, .. } => *json,
    }
}

fn batch_report_to_json(report: &BatchReport) -> Result<Value> {
    let mut value = serde_json::to_value(report)?;
    if let Value::Object(map) = &mut value {
        map.insert("counts".to_string(), serde_json::to_value(report.counts())?);
        map.insert("panicked_shards".to_string(), json!(report.panicked_shards()));
    }
    Ok(value)
}

fn plan_to_json(plan: &BatchPlan) -> Value {
    json!({
        "derivatives_dir": plan.derivatives_dir.display().to_string(),
        "missing_subjects": plan.availability.missing.len(),
        "complete_subjects": plan.availability.complete.len(),
        "shard_sizes": plan.shard_sizes(),
    })
}

fn print_plan(plan: &BatchPlan) {
    println!("derivatives_dir: {}", plan.derivatives_dir.display());
    println!("missing_subjects: {}", plan.availability.missing.len());
    println!("complete_subjects: {}", plan.availability.complete.len());
    println!("shard_sizes: {:?}", plan.shard_sizes());
}

fn print_batch_report(report: &BatchReport) {
    let counts = report.counts();
    println!("derivatives_dir: {}", report.derivatives_dir.display());
    println!("workers: {}", report.workers);
    println!("missing_subjects: {}", report.missing_subjects);
    println!("complete_subjects: {}", report.complete_subjects);
    println!("segmented: {}", counts.segmented);
    println!("skipped_existing: {}", counts.skipped_existing);
    println!("recoverable: {}", counts.recoverable);
    println!("fatal: {}", counts.fatal);
    println!("panicked_shards: {}", report.panicked_shards());
    println!(
        "elapsed_seconds: {}",
        (report.finished_at - report.started_at).num_seconds()
    );
    for session in report.sessions() {
        if let SessionOutcome::Recoverable(reason) | SessionOutcome::Fatal(reason) =
            &session.outcome
        {
            println!("failed: sub-{} ses-{}: {}", session.subject, session.session, reason);
        }
    }
}
