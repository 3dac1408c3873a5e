//! A minimal worker entrypoint: initializes from the supervisor's environment handoff,
//! runs the channel handler, and idles until told to stop. Used by the integration
//! tests as the concrete stand-in for the spec's opaque "per-worker event loop", and
//! runnable standalone for manual exercising of the supervision core.

use dusa_collection_utils::core::logger::LogLevel;
use dusa_collection_utils::log;
use fleet_supervisor::worker::WorkerContext;
use std::time::Duration;

#[tokio::main]
async fn main() {
    let ctx = match WorkerContext::init_from_env().await {
        Ok(ctx) => ctx,
        Err(e) => {
            log!(LogLevel::Error, "demo-worker failed to initialize: {}", e);
            std::process::exit(1);
        }
    };

    if let Ok(dir) = std::env::var("FLEET_WORKER_PIDDIR") {
        let path = std::path::Path::new(&dir).join(format!("{}.pid", ctx.slot));
        let _ = std::fs::write(path, std::process::id().to_string());
    }

    let handler = ctx.spawn_channel_handler();

    // Test fixture only: simulates a worker that never cooperates with graceful
    // shutdown, so the master's escalation path can be exercised up to SIGKILL.
    if std::env::var("FLEET_IGNORE_TERMINATE").is_ok() {
        loop {
            tokio::time::sleep(Duration::from_secs(3600)).await;
        }
    }

    let result = ctx
        .run(|| async {
            tokio::time::sleep(Duration::from_millis(20)).await;
        })
        .await;

    handler.abort();

    if let Err(e) = result {
        log!(LogLevel::Error, "demo-worker run loop failed: {}", e);
        std::process::exit(1);
    }
}
