//! Shared fixtures for gridflow tests: DAG and job-ad builders, a fake
//! `condor_submit` backend for DAG runs and a scripted grid backend.

pub mod builders;
pub mod fake_submitter;
pub mod scripted_backend;

use std::future::Future;
use std::sync::Once;
use std::time::Duration;

use tracing_subscriber::{fmt, EnvFilter};

pub use builders::{DagBuilder, JobAdBuilder};
pub use fake_submitter::FakeSubmitter;
pub use scripted_backend::ScriptedBackend;

/// Wall-clock limit for a whole DAG run under test.
pub const RUN_TIMEOUT: Duration = Duration::from_secs(5);

static INIT: Once = Once::new();

/// Install a test-captured subscriber once per test binary.
///
/// Output only shows for failing tests unless run with `--nocapture`;
/// `RUST_LOG=gridflow=debug` raises the level.
pub fn init_tracing() {
    INIT.call_once(|| {
        let filter = EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new("gridflow=info"));
        let _ = fmt()
            .with_env_filter(filter)
            .with_test_writer()
            .with_target(true)
            .try_init();
    });
}

/// Await `f`, panicking if it outlives [`RUN_TIMEOUT`].
pub async fn with_timeout<F, T>(f: F) -> T
where
    F: Future<Output = T>,
{
    match tokio::time::timeout(RUN_TIMEOUT, f).await {
        Ok(v) => v,
        Err(_) => panic!("run did not finish within {RUN_TIMEOUT:?}"),
    }
}
