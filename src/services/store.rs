use crate::schema::{DeliveryResult, EnqueueOptions, OutboxItem, OutboxStatus};
use crate::services::backoff::retry_delay;
use anyhow::Context;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use tokio::sync::Mutex;
use uuid::Uuid;

/// How long a pulled item stays exclusively leased to one worker. Long
/// enough to cover a delivery attempt including transport latency, short
/// enough that a crashed worker's items come back within one operator-visible
/// interval.
pub const LEASE_TTL_SECS: i64 = 30;

pub const MAX_DELIVERY_ATTEMPTS: i32 = 5;

#[derive(Debug, Default, Serialize, Deserialize)]
struct PersistedOutbox {
    items: Vec<OutboxItem>,
}

/// Durable outbound message queue.
///
/// The whole queue lives in one JSON document, rewritten with a
/// write-temp-then-rename on every mutation so a crash mid-write can never
/// corrupt the store. All mutations run under one mutex; the lock is held
/// across the save so read-modify-write cycles never interleave.
pub struct OutboxStore {
    path: PathBuf,
    items: Mutex<Vec<OutboxItem>>,
}

impl OutboxStore {
    pub async fn open(path: impl Into<PathBuf>) -> anyhow::Result<Self> {
        let path = path.into();
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            tokio::fs::create_dir_all(parent)
                .await
                .with_context(|| format!("failed to create {}", parent.display()))?;
        }

        let items = match tokio::fs::read(&path).await {
            Ok(bytes) => match serde_json::from_slice::<PersistedOutbox>(&bytes) {
                Ok(persisted) => persisted.items,
                Err(e) => {
                    tracing::warn!(
                        path = %path.display(),
                        error = %e,
                        "outbox: store file unreadable, starting empty"
                    );
                    Vec::new()
                }
            },
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Vec::new(),
            Err(e) => {
                return Err(e).with_context(|| format!("failed to read {}", path.display()));
            }
        };

        tracing::debug!(path = %path.display(), count = items.len(), "outbox: store opened");
        Ok(Self {
            path,
            items: Mutex::new(items),
        })
    }

    /// Create a new pending item. Never blocks on delivery.
    pub async fn enqueue(
        &self,
        principal_id: &str,
        destination: &str,
        text: &str,
        options: EnqueueOptions,
    ) -> anyhow::Result<OutboxItem> {
        let now = Utc::now();
        let item = OutboxItem {
            id: Uuid::new_v4(),
            principal_id: principal_id.to_string(),
            destination: destination.to_string(),
            text: text.to_string(),
            parse_mode: options.parse_mode,
            silent: options.silent,
            delivery_mode: options.delivery_mode,
            progress_key: options.progress_key,
            control: options.control,
            reply_markup: options.reply_markup,
            status: OutboxStatus::Pending,
            lease_owner: None,
            lease_expires_at: None,
            attempts: 0,
            next_attempt_at: None,
            telegram_message_id: None,
            last_error: None,
            created_at: now,
            updated_at: now,
        };

        let mut items = self.items.lock().await;
        items.push(item.clone());
        self.save(&items).await?;

        tracing::debug!(
            outbox_id = %item.id,
            principal_id,
            destination,
            "outbox: enqueued"
        );
        Ok(item)
    }

    /// Lease up to `limit` deliverable items for one principal, in enqueue
    /// order. Items whose previous lease has expired count as pending again;
    /// items leased to another live worker are skipped, which is what keeps
    /// a slow (but not crashed) worker from causing duplicate delivery.
    pub async fn pull(
        &self,
        principal_id: &str,
        limit: usize,
        worker_id: &str,
        now: DateTime<Utc>,
    ) -> anyhow::Result<Vec<OutboxItem>> {
        let mut items = self.items.lock().await;
        let mut leased = Vec::new();

        for item in items.iter_mut() {
            if leased.len() >= limit {
                break;
            }
            if item.principal_id != principal_id || !is_eligible(item, now) {
                continue;
            }

            item.status = OutboxStatus::Leased;
            item.lease_owner = Some(worker_id.to_string());
            item.lease_expires_at = Some(now + Duration::seconds(LEASE_TTL_SECS));
            item.updated_at = now;
            leased.push(item.clone());
        }

        if !leased.is_empty() {
            self.save(&items).await?;
            tracing::debug!(principal_id, worker_id, count = leased.len(), "outbox: leased batch");
        }
        Ok(leased)
    }

    /// Apply a batch of delivery outcomes.
    ///
    /// A report from a worker that no longer owns an item's lease still
    /// records outcome data (`last_error`, the platform message id) but never
    /// touches lease or status fields, so it cannot resurrect a lease some
    /// other worker already holds.
    pub async fn report(
        &self,
        principal_id: &str,
        worker_id: &str,
        now: DateTime<Utc>,
        results: &[DeliveryResult],
    ) -> anyhow::Result<()> {
        let mut items = self.items.lock().await;

        for result in results {
            let Some(item) = items
                .iter_mut()
                .find(|i| i.id == result.id && i.principal_id == principal_id)
            else {
                tracing::warn!(outbox_id = %result.id, principal_id, "outbox: report for unknown item");
                continue;
            };

            if let Some(error) = &result.error {
                item.last_error = Some(error.clone());
            }
            if let Some(message_id) = result.transport_message_id {
                item.telegram_message_id = Some(message_id);
            }

            let owned = item.status == OutboxStatus::Leased
                && item.lease_owner.as_deref() == Some(worker_id);
            if !owned {
                tracing::debug!(
                    outbox_id = %item.id,
                    worker_id,
                    "outbox: stale report, lease bookkeeping skipped"
                );
                continue;
            }

            item.lease_owner = None;
            item.lease_expires_at = None;
            item.updated_at = now;

            if result.ok {
                item.status = OutboxStatus::Delivered;
                item.next_attempt_at = None;
                continue;
            }

            item.attempts += 1;
            if item.attempts >= MAX_DELIVERY_ATTEMPTS {
                item.status = OutboxStatus::FailedPermanent;
                item.next_attempt_at = None;
                tracing::error!(
                    outbox_id = %item.id,
                    attempts = item.attempts,
                    error = item.last_error.as_deref().unwrap_or(""),
                    "outbox: giving up on item"
                );
            } else {
                item.status = OutboxStatus::Pending;
                item.next_attempt_at =
                    Some(now + retry_delay(item.attempts, result.retry_after_seconds));
            }
        }

        self.save(&items).await
    }

    /// Number of items still waiting for delivery (pending or leased).
    pub async fn pending_count(&self) -> usize {
        let items = self.items.lock().await;
        items
            .iter()
            .filter(|i| matches!(i.status, OutboxStatus::Pending | OutboxStatus::Leased))
            .count()
    }

    #[cfg(test)]
    pub async fn get(&self, id: Uuid) -> Option<OutboxItem> {
        let items = self.items.lock().await;
        items.iter().find(|i| i.id == id).cloned()
    }

    async fn save(&self, items: &[OutboxItem]) -> anyhow::Result<()> {
        #[derive(Serialize)]
        struct Record<'a> {
            items: &'a [OutboxItem],
        }
        let bytes = serde_json::to_vec_pretty(&Record { items })?;

        let tmp = self.path.with_extension("tmp");
        tokio::fs::write(&tmp, &bytes)
            .await
            .with_context(|| format!("failed to write {}", tmp.display()))?;
        tokio::fs::rename(&tmp, &self.path)
            .await
            .with_context(|| format!("failed to replace {}", self.path.display()))?;
        Ok(())
    }
}

fn is_eligible(item: &OutboxItem, now: DateTime<Utc>) -> bool {
    let claimable = match item.status {
        OutboxStatus::Pending => true,
        // a lease nobody reported on reverts silently once it expires
        OutboxStatus::Leased => item.lease_expires_at.is_some_and(|t| t <= now),
        OutboxStatus::Delivered | OutboxStatus::FailedPermanent => false,
    };
    claimable && item.next_attempt_at.is_none_or(|t| t <= now)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::DeliveryMode;

    async fn open_store(dir: &tempfile::TempDir) -> OutboxStore {
        OutboxStore::open(dir.path().join("outbox.json"))
            .await
            .unwrap()
    }

    async fn enqueue_text(store: &OutboxStore, principal: &str, text: &str) -> OutboxItem {
        store
            .enqueue(principal, "chat-1", text, EnqueueOptions::default())
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn pull_returns_items_in_enqueue_order_then_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_store(&dir).await;
        let now = Utc::now();

        enqueue_text(&store, "1", "hello").await;
        enqueue_text(&store, "1", "world").await;

        let batch = store.pull("1", 10, "w1", now).await.unwrap();
        assert_eq!(batch.len(), 2);
        assert_eq!(batch[0].text, "hello");
        assert_eq!(batch[1].text, "world");

        let again = store
            .pull("1", 10, "w1", now + Duration::seconds(1))
            .await
            .unwrap();
        assert!(again.is_empty());
    }

    #[tokio::test]
    async fn successful_report_marks_delivered_with_message_id() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_store(&dir).await;
        let now = Utc::now();

        let item = enqueue_text(&store, "2", "ok").await;
        store.pull("2", 10, "w1", now).await.unwrap();
        store
            .report("2", "w1", now, &[DeliveryResult::success(item.id, Some(123))])
            .await
            .unwrap();

        let stored = store.get(item.id).await.unwrap();
        assert_eq!(stored.status, OutboxStatus::Delivered);
        assert_eq!(stored.telegram_message_id, Some(123));
        assert!(stored.lease_owner.is_none());
        assert!(stored.lease_expires_at.is_none());
    }

    #[tokio::test]
    async fn failed_report_requeues_with_future_retry() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_store(&dir).await;
        let now = Utc::now();

        let item = enqueue_text(&store, "3", "fail").await;
        store.pull("3", 10, "w1", now).await.unwrap();
        store
            .report(
                "3",
                "w1",
                now,
                &[DeliveryResult::failure(item.id, "net".to_string(), None)],
            )
            .await
            .unwrap();

        let stored = store.get(item.id).await.unwrap();
        assert_eq!(stored.status, OutboxStatus::Pending);
        assert_eq!(stored.attempts, 1);
        assert_eq!(stored.last_error.as_deref(), Some("net"));
        assert!(stored.next_attempt_at.unwrap() > now);
    }

    #[tokio::test]
    async fn lease_blocks_other_workers_until_expiry() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_store(&dir).await;
        let now = Utc::now();

        let item = enqueue_text(&store, "1", "hello").await;
        let first = store.pull("1", 10, "w1", now).await.unwrap();
        assert_eq!(first.len(), 1);

        let contended = store
            .pull("1", 10, "w2", now + Duration::seconds(5))
            .await
            .unwrap();
        assert!(contended.is_empty());

        let reclaimed = store
            .pull("1", 10, "w2", now + Duration::seconds(LEASE_TTL_SECS + 1))
            .await
            .unwrap();
        assert_eq!(reclaimed.len(), 1);
        assert_eq!(reclaimed[0].id, item.id);
        assert_eq!(reclaimed[0].lease_owner.as_deref(), Some("w2"));
    }

    #[tokio::test]
    async fn retry_waits_for_next_attempt_at() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_store(&dir).await;
        let now = Utc::now();

        let item = enqueue_text(&store, "1", "rate limited").await;
        store.pull("1", 10, "w1", now).await.unwrap();
        store
            .report(
                "1",
                "w1",
                now,
                &[DeliveryResult::failure(
                    item.id,
                    "rate limited".to_string(),
                    Some(120),
                )],
            )
            .await
            .unwrap();

        let stored = store.get(item.id).await.unwrap();
        assert!(stored.next_attempt_at.unwrap() >= now + Duration::seconds(120));

        let early = store
            .pull("1", 10, "w1", now + Duration::seconds(60))
            .await
            .unwrap();
        assert!(early.is_empty());

        let later = store
            .pull("1", 10, "w1", now + Duration::seconds(600))
            .await
            .unwrap();
        assert_eq!(later.len(), 1);
    }

    #[tokio::test]
    async fn report_tolerates_extreme_rate_limit_hint() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_store(&dir).await;
        let now = Utc::now();

        let item = enqueue_text(&store, "1", "hostile hint").await;
        store.pull("1", 10, "w1", now).await.unwrap();

        // the report surface is open HTTP; a hint this size must clamp,
        // not blow up timestamp arithmetic mid-batch
        store
            .report(
                "1",
                "w1",
                now,
                &[DeliveryResult::failure(
                    item.id,
                    "rate limited".to_string(),
                    Some(u64::MAX),
                )],
            )
            .await
            .unwrap();

        let stored = store.get(item.id).await.unwrap();
        assert_eq!(stored.status, OutboxStatus::Pending);
        assert_eq!(stored.attempts, 1);
        let next = stored.next_attempt_at.unwrap();
        assert!(next > now);
        assert!(next <= now + Duration::days(2));
    }

    #[tokio::test]
    async fn exhausted_attempts_become_permanent_failure() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_store(&dir).await;
        let item = enqueue_text(&store, "1", "doomed").await;

        let mut now = Utc::now();
        for _ in 0..MAX_DELIVERY_ATTEMPTS {
            // jump past any backoff so the item is pullable again
            now += Duration::seconds(600);
            let batch = store.pull("1", 10, "w1", now).await.unwrap();
            assert_eq!(batch.len(), 1);
            store
                .report(
                    "1",
                    "w1",
                    now,
                    &[DeliveryResult::failure(item.id, "net".to_string(), None)],
                )
                .await
                .unwrap();
        }

        let stored = store.get(item.id).await.unwrap();
        assert_eq!(stored.status, OutboxStatus::FailedPermanent);
        assert_eq!(stored.attempts, MAX_DELIVERY_ATTEMPTS);

        let batch = store
            .pull("1", 10, "w1", now + Duration::seconds(600))
            .await
            .unwrap();
        assert!(batch.is_empty());
    }

    #[tokio::test]
    async fn stale_report_records_outcome_without_touching_lease() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_store(&dir).await;
        let now = Utc::now();

        let item = enqueue_text(&store, "1", "slow worker").await;
        store.pull("1", 10, "w1", now).await.unwrap();

        // w1's lease expires, w2 takes over
        let after_expiry = now + Duration::seconds(LEASE_TTL_SECS + 1);
        let reclaimed = store.pull("1", 10, "w2", after_expiry).await.unwrap();
        assert_eq!(reclaimed.len(), 1);

        // late report from w1 must not disturb w2's lease
        store
            .report(
                "1",
                "w1",
                after_expiry + Duration::seconds(1),
                &[DeliveryResult::failure(item.id, "late".to_string(), None)],
            )
            .await
            .unwrap();

        let stored = store.get(item.id).await.unwrap();
        assert_eq!(stored.status, OutboxStatus::Leased);
        assert_eq!(stored.lease_owner.as_deref(), Some("w2"));
        assert_eq!(stored.attempts, 0);
        assert_eq!(stored.last_error.as_deref(), Some("late"));
    }

    #[tokio::test]
    async fn principals_never_interleave() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_store(&dir).await;
        let now = Utc::now();

        enqueue_text(&store, "1", "for one").await;
        enqueue_text(&store, "2", "for two").await;

        let batch = store.pull("1", 10, "w1", now).await.unwrap();
        assert_eq!(batch.len(), 1);
        assert_eq!(batch[0].principal_id, "1");
    }

    #[tokio::test]
    async fn pull_respects_batch_limit() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_store(&dir).await;
        let now = Utc::now();

        for i in 0..5 {
            enqueue_text(&store, "1", &format!("msg {i}")).await;
        }

        let batch = store.pull("1", 3, "w1", now).await.unwrap();
        assert_eq!(batch.len(), 3);
        assert_eq!(batch[0].text, "msg 0");

        let rest = store.pull("1", 10, "w1", now).await.unwrap();
        assert_eq!(rest.len(), 2);
        assert_eq!(rest[0].text, "msg 3");
    }

    #[tokio::test]
    async fn queue_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("outbox.json");
        let item_id;
        {
            let store = OutboxStore::open(&path).await.unwrap();
            let item = enqueue_text(&store, "1", "durable").await;
            item_id = item.id;
        }

        let store = OutboxStore::open(&path).await.unwrap();
        assert_eq!(store.pending_count().await, 1);
        let stored = store.get(item_id).await.unwrap();
        assert_eq!(stored.text, "durable");
        assert_eq!(stored.status, OutboxStatus::Pending);
    }

    #[tokio::test]
    async fn corrupt_store_file_starts_empty() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("outbox.json");
        tokio::fs::write(&path, b"{ not json").await.unwrap();

        let store = OutboxStore::open(&path).await.unwrap();
        assert_eq!(store.pending_count().await, 0);

        // and the store is usable afterwards
        enqueue_text(&store, "1", "fresh start").await;
        assert_eq!(store.pending_count().await, 1);
    }

    #[tokio::test]
    async fn enqueue_preserves_replace_options() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_store(&dir).await;

        let options = EnqueueOptions {
            delivery_mode: DeliveryMode::Replace,
            progress_key: Some("bash:1".to_string()),
            parse_mode: Some("HTML".to_string()),
            silent: true,
            ..Default::default()
        };
        let item = store
            .enqueue("1", "chat-9", "running...", options)
            .await
            .unwrap();

        let stored = store.get(item.id).await.unwrap();
        assert_eq!(stored.delivery_mode, DeliveryMode::Replace);
        assert_eq!(stored.progress_key.as_deref(), Some("bash:1"));
        assert_eq!(stored.parse_mode.as_deref(), Some("HTML"));
        assert!(stored.silent);
        assert_eq!(stored.attempts, 0);
    }
}
