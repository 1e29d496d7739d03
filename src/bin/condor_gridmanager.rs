// src/bin/condor_gridmanager.rs

use gridflow::{cli, logging, run_gridmanager};

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
    let args = cli::parse_gridmanager();
    logging::init_logging(args.effective_log_level(), None)?;
    run_gridmanager(args).await
}
