//! Sample worker process.
//!
//! Registers a processor for the `thumbnails` queue, submits a few jobs and
//! runs until Ctrl-C, then shuts everything down.
//!
//! ```text
//! REDIS_URL=redis://localhost:6379 RUST_LOG=debug cargo run --bin taskline-worker
//! ```
//!
//! Set `TASKLINE_LOG_FORMAT=json` for JSON log lines.

use serde::{Deserialize, Serialize};
use std::process::ExitCode;
use std::time::Duration;
use taskline::queue::{JobOptions, JobPayload, JobQueues, QueueResult};
use tracing::{error, info};

#[derive(Debug, Serialize, Deserialize)]
struct Thumbnail {
    image: String,
    width: u32,
}

impl JobPayload for Thumbnail {
    const QUEUE: &'static str = "thumbnails";
}

fn init_tracing() {
    use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));

    if std::env::var("TASKLINE_LOG_FORMAT").is_ok_and(|f| f == "json") {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer())
            .init();
    }
}

async fn make_thumbnail(job: Thumbnail) -> Result<serde_json::Value, String> {
    if job.width == 0 {
        return Err(format!("{} has zero width", job.image));
    }
    tokio::time::sleep(Duration::from_millis(100)).await;
    Ok(serde_json::json!({ "thumbnail": format!("{}.thumb", job.image) }))
}

async fn run(queues: &JobQueues) -> QueueResult<()> {
    queues.health_check().await?;
    queues.process(make_thumbnail).await?;

    for (image, width) in [("cat.png", 320), ("dog.png", 640), ("broken.png", 0)] {
        let handle = queues
            .enqueue(&Thumbnail { image: image.into(), width }, None)
            .await?;
        info!(job_id = %handle.id, image, "Submitted thumbnail job");
    }

    let delayed = JobOptions::new().delay(Duration::from_secs(2)).attempts(3);
    queues
        .enqueue(&Thumbnail { image: "later.png".into(), width: 128 }, Some(delayed))
        .await?;

    info!("Worker running, press Ctrl-C to stop");
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!(error = %e, "Failed to listen for Ctrl-C");
    }
    Ok(())
}

#[tokio::main]
async fn main() -> ExitCode {
    init_tracing();

    let queues = JobQueues::from_env();
    let outcome = run(&queues).await;

    if let Err(e) = queues.shutdown().await {
        error!(error = %e, "Shutdown did not complete cleanly");
    }

    match outcome {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!(error = %e, "Worker failed");
            ExitCode::FAILURE
        }
    }
}
