// src/main.rs

use gridflow::{cli, logging, run_dagman};

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
    let args = cli::parse_dagman();
    let log_file = logging::log_file_from_env();
    logging::init_logging(args.effective_log_level(), log_file.as_deref())?;
    run_dagman(args).await
}
