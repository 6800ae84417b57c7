use std::sync::Arc;

mod functions;
mod schema;
mod services;

use functions::delivery::DeliveryWorker;
use services::store::OutboxStore;
use services::telegram::TelegramClient;

fn env_or(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let outbox_path = env_or("COURIER_OUTBOX_PATH", "courier-outbox.json");
    let store = Arc::new(OutboxStore::open(&outbox_path).await?);
    tracing::info!(
        outbox = %outbox_path,
        pending = store.pending_count().await,
        "courier: outbox opened"
    );

    let principals: Vec<String> = env_or("COURIER_PRINCIPALS", "")
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect();
    if principals.is_empty() {
        anyhow::bail!("COURIER_PRINCIPALS must list at least one principal id");
    }

    let poll_ms: u64 = env_or("COURIER_POLL_MS", "1000").parse()?;
    let transport = Arc::new(TelegramClient::from_env()?);
    let worker = Arc::new(DeliveryWorker::new(store.clone(), transport, principals));
    tracing::info!(worker_id = %worker.worker_id(), "courier: delivery worker configured");

    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
    let worker_task = tokio::spawn(worker.run(poll_ms, shutdown_rx));

    let addr = env_or("COURIER_HTTP_ADDR", "127.0.0.1:8490");
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    tracing::info!(%addr, "courier: listening");

    axum::serve(listener, functions::outbox_api::router(store))
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
        })
        .await?;

    let _ = shutdown_tx.send(true);
    worker_task.await?;
    Ok(())
}
