// src/bin/condor_submit_dag.rs

use gridflow::cli::{self, LogLevel};
use gridflow::{logging, run_submit_dag};

#[tokio::main]
async fn main() {
    match run_main().await {
        Ok(code) => std::process::exit(code),
        Err(err) => {
            eprintln!("error: {err:?}");
            std::process::exit(1);
        }
    }
}

async fn run_main() -> anyhow::Result<i32> {
    let args = cli::parse_submit_dag();
    logging::init_logging(args.debug.map(LogLevel::from_debug_level), None)?;
    run_submit_dag(args).await
}
