use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutboxStatus {
    Pending,
    Leased,
    Delivered,
    FailedPermanent,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryMode {
    #[default]
    Send,
    Replace,
}

/// Out-of-band instruction executed by the worker without touching the
/// chat transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ControlAction {
    IndicatorOn,
    IndicatorOff,
}

/// One queued outbound message.
///
/// `replace`-mode items never carry their own physical message identity;
/// that lives in the delivery worker's progress cache, keyed by
/// `(destination, progress_key)`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutboxItem {
    pub id: Uuid,
    pub principal_id: String,
    pub destination: String,
    pub text: String,
    pub parse_mode: Option<String>,
    #[serde(default)]
    pub silent: bool,
    #[serde(default)]
    pub delivery_mode: DeliveryMode,
    pub progress_key: Option<String>,
    pub control: Option<ControlAction>,
    pub reply_markup: Option<serde_json::Value>,
    pub status: OutboxStatus,
    pub lease_owner: Option<String>,
    pub lease_expires_at: Option<DateTime<Utc>>,
    pub attempts: i32,
    pub next_attempt_at: Option<DateTime<Utc>>,
    pub telegram_message_id: Option<i64>,
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EnqueueOptions {
    #[serde(default)]
    pub delivery_mode: DeliveryMode,
    pub progress_key: Option<String>,
    pub control: Option<ControlAction>,
    pub reply_markup: Option<serde_json::Value>,
    #[serde(default)]
    pub silent: bool,
    pub parse_mode: Option<String>,
}

/// Per-item delivery outcome reported back to the store.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeliveryResult {
    pub id: Uuid,
    pub ok: bool,
    pub transport_message_id: Option<i64>,
    pub error: Option<String>,
    pub retry_after_seconds: Option<u64>,
}

impl DeliveryResult {
    pub fn success(id: Uuid, transport_message_id: Option<i64>) -> Self {
        Self {
            id,
            ok: true,
            transport_message_id,
            error: None,
            retry_after_seconds: None,
        }
    }

    pub fn failure(id: Uuid, error: String, retry_after_seconds: Option<u64>) -> Self {
        Self {
            id,
            ok: false,
            transport_message_id: None,
            error: Some(error),
            retry_after_seconds,
        }
    }
}
