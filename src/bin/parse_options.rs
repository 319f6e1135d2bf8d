/// Re-partition daily option trade files into one dataset per instrument.
///
/// Each instrument gets `<output_dir>/<instrument>/trades.{parquet,feather}`
/// plus `metadata.json`. Settings come from a JSON config (missing file means
/// defaults) with `OPTIONS_*` environment overrides, `.env` included.
///
/// Usage:
///   cargo run --release --bin parse_options [config.json]
///
/// Exit codes: 0 on completion, 1 on a precondition failure, 130 on Ctrl+C.
use std::env;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::Context;
use deribit_options_parser::{init_logging, pipeline, DataLoader, PartitionConfig, PipelineError};
use dotenv::dotenv;
use tracing::warn;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenv().ok();

    let args: Vec<String> = env::args().collect();
    let config_path = args
        .get(1)
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("config.json"));

    let mut config = match PartitionConfig::load_or_default(&config_path) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Error: {}", e);
            std::process::exit(1);
        }
    };
    if let Err(e) = config.apply_env_overrides() {
        eprintln!("Error: {}", e);
        std::process::exit(1);
    }
    init_logging(config.tracing_level());

    println!("=== DERIBIT OPTIONS PARSER ===");
    println!("Input:   {}", config.input_dir.display());
    println!("Output:  {}", config.output_dir.display());
    println!("Pattern: {}", config.file_pattern);
    println!("Format:  {}", config.output_format);
    println!("Threads: {}\n", config.worker_threads());

    let cancel = Arc::new(AtomicBool::new(false));
    let listener = {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                warn!("Interrupt received, finishing in-flight work...");
                cancel.store(true, Ordering::SeqCst);
            }
        })
    };

    let worker_cancel = cancel.clone();
    let result = tokio::task::spawn_blocking(move || {
        pipeline::run(&config, &DataLoader::new(), &worker_cancel)
    })
    .await
    .context("pipeline task failed")?;
    listener.abort();

    match result {
        Ok(report) => {
            println!("\n=== PARSING COMPLETE ===");
            println!("{}", report);
            Ok(())
        }
        Err(PipelineError::Interrupted) => {
            eprintln!("Interrupted. Instruments already written are complete; rerun to finish.");
            std::process::exit(130);
        }
        Err(e) => {
            eprintln!("Error: {}", e);
            std::process::exit(1);
        }
    }
}
