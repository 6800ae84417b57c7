use async_trait::async_trait;
use serde_json::Value;

const DEFAULT_API_BASE: &str = "https://api.telegram.org";
const REQUEST_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(15);

/// Transport failures, classified so the delivery worker can tell a benign
/// race from a retryable failure from an edit target that is gone.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("rate limited, retry after {retry_after}s")]
    RateLimited { retry_after: u64 },
    /// The content is byte-identical to what the chat already shows.
    #[error("message is not modified")]
    NotModified,
    /// The edit target is gone or was never editable (deleted message,
    /// wrong chat). Recoverable by sending a fresh message.
    #[error("cannot edit message: {0}")]
    CannotEdit(String),
    #[error("telegram api error ({code}): {description}")]
    Api { code: i64, description: String },
    #[error("transport request failed: {0}")]
    Network(#[from] reqwest::Error),
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct SendOptions {
    pub parse_mode: Option<String>,
    pub silent: bool,
    pub reply_markup: Option<Value>,
}

/// Send/edit boundary to the chat platform. The delivery worker only ever
/// talks to this trait; tests substitute a scripted mock.
#[async_trait]
pub trait ChatTransport: Send + Sync {
    /// Send a new message, returning its platform message id.
    async fn send(
        &self,
        destination: &str,
        text: &str,
        options: &SendOptions,
    ) -> Result<i64, TransportError>;

    /// Replace the text of an existing message in place.
    async fn edit(
        &self,
        destination: &str,
        message_id: i64,
        text: &str,
        options: &SendOptions,
    ) -> Result<(), TransportError>;
}

pub struct TelegramClient {
    client: reqwest::Client,
    token: String,
    api_base: String,
}

impl TelegramClient {
    pub fn new(token: String, api_base: Option<String>) -> Self {
        let client = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .expect("failed to build reqwest client");
        Self {
            client,
            token,
            api_base: api_base.unwrap_or_else(|| DEFAULT_API_BASE.to_string()),
        }
    }

    pub fn from_env() -> anyhow::Result<Self> {
        let token = std::env::var("TELEGRAM_BOT_TOKEN")
            .map_err(|_| anyhow::anyhow!("TELEGRAM_BOT_TOKEN required for delivery"))?;
        let api_base = std::env::var("COURIER_TELEGRAM_API_BASE").ok();
        Ok(Self::new(token, api_base))
    }

    async fn call(&self, method: &str, body: Value) -> Result<Value, TransportError> {
        let url = format!(
            "{}/bot{}/{}",
            self.api_base.trim_end_matches('/'),
            self.token,
            method
        );

        let resp = self.client.post(&url).json(&body).send().await?;
        let json: Value = resp.json().await?;

        if json["ok"].as_bool().unwrap_or(false) {
            Ok(json["result"].clone())
        } else {
            let code = json["error_code"].as_i64().unwrap_or(0);
            let description = json["description"].as_str().unwrap_or("unknown error");
            let retry_after = json["parameters"]["retry_after"].as_u64();
            Err(classify_api_error(code, description, retry_after))
        }
    }

    fn message_body(&self, destination: &str, text: &str, options: &SendOptions) -> Value {
        let mut body = serde_json::json!({
            "chat_id": destination,
            "text": text,
        });
        if let Some(parse_mode) = &options.parse_mode {
            body["parse_mode"] = Value::String(parse_mode.clone());
        }
        if options.silent {
            body["disable_notification"] = Value::Bool(true);
        }
        if let Some(markup) = &options.reply_markup {
            body["reply_markup"] = markup.clone();
        }
        body
    }
}

/// Map a Bot API error payload onto the transport error taxonomy.
fn classify_api_error(code: i64, description: &str, retry_after: Option<u64>) -> TransportError {
    if let Some(retry_after) = retry_after {
        return TransportError::RateLimited { retry_after };
    }
    if code == 429 {
        return TransportError::RateLimited { retry_after: 1 };
    }

    let lowered = description.to_ascii_lowercase();
    if lowered.contains("message is not modified") {
        return TransportError::NotModified;
    }
    if lowered.contains("message to edit not found")
        || lowered.contains("message can't be edited")
    {
        return TransportError::CannotEdit(description.to_string());
    }

    TransportError::Api {
        code,
        description: description.to_string(),
    }
}

#[async_trait]
impl ChatTransport for TelegramClient {
    async fn send(
        &self,
        destination: &str,
        text: &str,
        options: &SendOptions,
    ) -> Result<i64, TransportError> {
        let body = self.message_body(destination, text, options);
        let result = self.call("sendMessage", body).await?;
        result["message_id"].as_i64().ok_or(TransportError::Api {
            code: 0,
            description: "sendMessage result missing message_id".to_string(),
        })
    }

    async fn edit(
        &self,
        destination: &str,
        message_id: i64,
        text: &str,
        options: &SendOptions,
    ) -> Result<(), TransportError> {
        let mut body = self.message_body(destination, text, options);
        body["message_id"] = Value::Number(message_id.into());
        self.call("editMessageText", body).await?;
        Ok(())
    }
}
