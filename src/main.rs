use std::collections::HashSet;
use std::sync::Arc;
use anyhow::Context;
use tokio::sync::broadcast::error::RecvError;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use tunnel_chunked::utils::{format_bytes, format_speed};
use tunnel_chunked::{Config, FileStore, HttpUploadService, UploadEngine, UploadEvent, UploadId};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "tunnel_chunked=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config_path = std::env::args().nth(1).unwrap_or_else(|| "config.toml".to_string());
    let config = Config::load(&config_path)
        .await
        .with_context(|| format!("failed to load {}", config_path))?;

    let service = Arc::new(HttpUploadService::new(&config.remote).context("failed to build HTTP client")?);
    let store = Arc::new(FileStore::new(&config.store_dir));
    let engine = UploadEngine::start(config.engine.clone(), service, store)
        .await
        .context("failed to start upload engine")?;

    let mut events = engine.subscribe();
    let mut pending: HashSet<UploadId> = engine.restore_and_start_all_uploads().await?.into_iter().collect();

    for path in &config.files {
        let relative_path = path
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_default();
        match engine.submit(path, relative_path).await {
            Ok(upload_id) => {
                pending.insert(upload_id);
            }
            Err(err) => error!(file = %path.display(), error = %err, "Cannot submit file"),
        }
    }

    while !pending.is_empty() {
        let event = tokio::select! {
            event = events.recv() => event,
            _ = tokio::signal::ctrl_c() => {
                info!("Interrupted, progress is kept for the next run");
                break;
            }
        };

        match event {
            Ok(UploadEvent::Progress { progress, .. }) => info!(
                file = %progress.file_name,
                uploaded = %format_bytes(progress.uploaded_size),
                speed = %format_speed(progress.speed.unwrap_or(0.0)),
                eta = %progress.estimated_time_remaining,
                "{:.1}%",
                progress.progress
            ),
            Ok(UploadEvent::StatusChanged { upload_id, status, .. }) => {
                if status.is_terminal() {
                    pending.remove(&upload_id);
                }
            }
            Ok(UploadEvent::Error { upload_id, kind, message, .. }) => {
                error!(upload_id = %upload_id, kind = ?kind, "{}", message);
                pending.remove(&upload_id);
            }
            Ok(UploadEvent::AuthError { message, .. }) => {
                error!("{}", message);
                break;
            }
            Err(RecvError::Lagged(skipped)) => warn!(skipped, "Event receiver lagged"),
            Err(RecvError::Closed) => break,
        }
    }

    engine.shutdown().await;
    Ok(())
}
