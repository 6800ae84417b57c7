use crate::schema::{ControlAction, DeliveryMode, DeliveryResult, OutboxItem};
use crate::services::store::OutboxStore;
use crate::services::telegram::{ChatTransport, SendOptions, TransportError};
use chrono::{DateTime, Duration, Utc};
use std::collections::hash_map::Entry;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::Mutex;
use uuid::Uuid;

const BATCH_LIMIT: usize = 10;
const PROGRESS_IDLE_TTL_SECS: i64 = 30 * 60;

/// Physical identity of one progressive message slot. Worker-local and
/// ephemeral; a restarted worker simply sends a fresh message for the slot.
struct ProgressEntry {
    message_id: i64,
    text: String,
    markup: Option<serde_json::Value>,
    updated_at: DateTime<Utc>,
}

/// Polling delivery loop.
///
/// Leases batches from the outbox per principal, delivers them sequentially
/// against the chat transport, and reports outcomes back. Replace-mode items
/// collapse onto one physical message per `(destination, progress_key)`.
pub struct DeliveryWorker {
    worker_id: String,
    store: Arc<OutboxStore>,
    transport: Arc<dyn ChatTransport>,
    principals: Vec<String>,
    progress: Mutex<HashMap<(String, String), ProgressEntry>>,
    indicators: Mutex<HashSet<String>>,
    tick_guard: Mutex<()>,
}

impl DeliveryWorker {
    pub fn new(
        store: Arc<OutboxStore>,
        transport: Arc<dyn ChatTransport>,
        principals: Vec<String>,
    ) -> Self {
        Self {
            worker_id: format!("worker-{}", Uuid::new_v4().as_simple()),
            store,
            transport,
            principals,
            progress: Mutex::new(HashMap::new()),
            indicators: Mutex::new(HashSet::new()),
            tick_guard: Mutex::new(()),
        }
    }

    pub fn worker_id(&self) -> &str {
        &self.worker_id
    }

    pub async fn run(self: Arc<Self>, poll_ms: u64, mut shutdown: tokio::sync::watch::Receiver<bool>) {
        tracing::info!(worker_id = %self.worker_id, poll_ms, "delivery: worker started");
        loop {
            tokio::select! {
                _ = shutdown.changed() => break,
                _ = tokio::time::sleep(std::time::Duration::from_millis(poll_ms)) => {
                    match self.delivery_tick().await {
                        Ok(n) if n > 0 => tracing::info!(processed = n, "delivery tick"),
                        Err(e) => tracing::error!(error = %e, "delivery tick failed"),
                        _ => {}
                    }
                }
            }
        }
        tracing::info!(worker_id = %self.worker_id, "delivery: worker stopped");
    }

    /// One poll pass over every configured principal. Returns the number of
    /// successfully delivered items.
    pub async fn delivery_tick(&self) -> anyhow::Result<u32> {
        // a tick still running when the next timer fires is skipped, not queued
        let Ok(_guard) = self.tick_guard.try_lock() else {
            tracing::debug!("delivery: previous tick still running, skipping");
            return Ok(0);
        };

        let mut processed = 0u32;
        for principal_id in &self.principals {
            let batch = self
                .store
                .pull(principal_id, BATCH_LIMIT, &self.worker_id, Utc::now())
                .await?;
            if batch.is_empty() {
                continue;
            }

            tracing::debug!(principal_id, count = batch.len(), "delivery: processing batch");

            let mut results = Vec::with_capacity(batch.len());
            for item in &batch {
                let result = self.deliver(item).await;
                if result.ok {
                    processed += 1;
                } else {
                    tracing::warn!(
                        outbox_id = %item.id,
                        destination = %item.destination,
                        attempt = item.attempts + 1,
                        error = result.error.as_deref().unwrap_or(""),
                        "delivery: item failed"
                    );
                }
                results.push(result);
            }

            self.store
                .report(principal_id, &self.worker_id, Utc::now(), &results)
                .await?;
        }

        self.evict_idle_progress(Utc::now()).await;
        Ok(processed)
    }

    /// Deliver one leased item. Infallible by design: every transport problem
    /// becomes an `ok = false` result for this item alone, so a bad item can
    /// never abort the rest of its batch.
    async fn deliver(&self, item: &OutboxItem) -> DeliveryResult {
        if let Some(action) = item.control {
            return self.apply_control(item, action).await;
        }

        let options = send_options(item);
        match item.delivery_mode {
            DeliveryMode::Send => self.send_fresh(item, &options).await,
            DeliveryMode::Replace => self.deliver_replace(item, &options).await,
        }
    }

    async fn send_fresh(&self, item: &OutboxItem, options: &SendOptions) -> DeliveryResult {
        match self
            .transport
            .send(&item.destination, &item.text, options)
            .await
        {
            Ok(message_id) => DeliveryResult::success(item.id, Some(message_id)),
            Err(e) => failure_from(item.id, e),
        }
    }

    async fn deliver_replace(&self, item: &OutboxItem, options: &SendOptions) -> DeliveryResult {
        let Some(progress_key) = item.progress_key.clone() else {
            tracing::warn!(outbox_id = %item.id, "delivery: replace item without progress key");
            return self.send_fresh(item, options).await;
        };

        let key = (item.destination.clone(), progress_key);
        let mut progress = self.progress.lock().await;

        match progress.entry(key) {
            Entry::Vacant(vacant) => {
                match self
                    .transport
                    .send(&item.destination, &item.text, options)
                    .await
                {
                    Ok(message_id) => {
                        vacant.insert(ProgressEntry {
                            message_id,
                            text: item.text.clone(),
                            markup: item.reply_markup.clone(),
                            updated_at: Utc::now(),
                        });
                        DeliveryResult::success(item.id, Some(message_id))
                    }
                    Err(e) => failure_from(item.id, e),
                }
            }
            Entry::Occupied(mut occupied) => {
                let entry = occupied.get_mut();

                // identical consecutive update: no network call at all
                if entry.text == item.text && entry.markup == item.reply_markup {
                    entry.updated_at = Utc::now();
                    return DeliveryResult::success(item.id, Some(entry.message_id));
                }

                match self
                    .transport
                    .edit(&item.destination, entry.message_id, &item.text, options)
                    .await
                {
                    Ok(()) => {
                        entry.text = item.text.clone();
                        entry.markup = item.reply_markup.clone();
                        entry.updated_at = Utc::now();
                        DeliveryResult::success(item.id, Some(entry.message_id))
                    }
                    // the chat already shows exactly this content; benign race
                    Err(TransportError::NotModified) => {
                        entry.text = item.text.clone();
                        entry.markup = item.reply_markup.clone();
                        entry.updated_at = Utc::now();
                        DeliveryResult::success(item.id, Some(entry.message_id))
                    }
                    // the backing message is gone; rebind the slot to a fresh send
                    Err(TransportError::CannotEdit(reason)) => {
                        tracing::info!(
                            outbox_id = %item.id,
                            destination = %item.destination,
                            reason,
                            "delivery: edit target lost, sending fresh message"
                        );
                        match self
                            .transport
                            .send(&item.destination, &item.text, options)
                            .await
                        {
                            Ok(message_id) => {
                                *entry = ProgressEntry {
                                    message_id,
                                    text: item.text.clone(),
                                    markup: item.reply_markup.clone(),
                                    updated_at: Utc::now(),
                                };
                                DeliveryResult::success(item.id, Some(message_id))
                            }
                            Err(e) => failure_from(item.id, e),
                        }
                    }
                    Err(e) => failure_from(item.id, e),
                }
            }
        }
    }

    async fn apply_control(&self, item: &OutboxItem, action: ControlAction) -> DeliveryResult {
        let mut indicators = self.indicators.lock().await;
        match action {
            ControlAction::IndicatorOn => {
                indicators.insert(item.destination.clone());
            }
            ControlAction::IndicatorOff => {
                indicators.remove(&item.destination);
            }
        }
        tracing::debug!(
            destination = %item.destination,
            ?action,
            "delivery: control action applied"
        );
        DeliveryResult::success(item.id, None)
    }

    pub async fn indicator_active(&self, destination: &str) -> bool {
        self.indicators.lock().await.contains(destination)
    }

    async fn evict_idle_progress(&self, now: DateTime<Utc>) {
        let mut progress = self.progress.lock().await;
        let before = progress.len();
        progress.retain(|_, entry| {
            now - entry.updated_at < Duration::seconds(PROGRESS_IDLE_TTL_SECS)
        });
        let evicted = before - progress.len();
        if evicted > 0 {
            tracing::debug!(evicted, "delivery: dropped idle progress entries");
        }
    }
}

fn send_options(item: &OutboxItem) -> SendOptions {
    SendOptions {
        parse_mode: item.parse_mode.clone(),
        silent: item.silent,
        reply_markup: item.reply_markup.clone(),
    }
}

fn failure_from(id: Uuid, error: TransportError) -> DeliveryResult {
    let retry_after = match &error {
        TransportError::RateLimited { retry_after } => Some(*retry_after),
        _ => None,
    };
    DeliveryResult::failure(id, error.to_string(), retry_after)
}
