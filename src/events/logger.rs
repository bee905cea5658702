//! JSONL event logger
//!
//! Subscribes to the bus and appends each event as one JSON line. Runs as a
//! background task and exits when the bus is dropped.

use std::path::PathBuf;
use std::sync::Arc;

use tokio::io::AsyncWriteExt;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use super::EventBus;

/// Spawn a background task that writes every event to `path` as JSONL
pub fn spawn_event_logger(bus: &Arc<EventBus>, path: PathBuf) -> JoinHandle<()> {
    let mut stream = bus.subscribe();
    debug!(?path, "spawn_event_logger: called");

    tokio::spawn(async move {
        if let Some(parent) = path.parent()
            && let Err(e) = tokio::fs::create_dir_all(parent).await
        {
            warn!(?path, error = %e, "Event logger could not create log directory");
            return;
        }

        let file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await;

        let mut file = match file {
            Ok(f) => f,
            Err(e) => {
                warn!(?path, error = %e, "Event logger could not open log file");
                return;
            }
        };

        while let Some(event) = stream.recv().await {
            let Ok(mut line) = serde_json::to_string(&event) else {
                continue;
            };
            line.push('\n');
            if let Err(e) = file.write_all(line.as_bytes()).await {
                warn!(error = %e, "Event logger write failed, stopping");
                break;
            }
        }
        debug!("spawn_event_logger: bus closed, logger exiting");
    })
}
