use super::{Notification, Notifier};
use crate::store::UserId;
use anyhow::{anyhow, Result};
use reqwest::Client;
use serde::Serialize;
use std::time::Duration;

const DEFAULT_API_BASE: &str = "https://api.telegram.org";

/// Telegram Bot API `sendMessage`; the chat id is the user id.
#[derive(Clone)]
pub struct TelegramNotifier {
    api_base: String,
    token: String,
    client: Client,
    timeout: Duration,
    max_retries: u8,
}

impl TelegramNotifier {
    pub fn new(token: impl Into<String>) -> Self {
        Self {
            api_base: DEFAULT_API_BASE.to_string(),
            token: token.into(),
            client: Client::new(),
            timeout: Duration::from_secs(5),
            max_retries: 3,
        }
    }

    pub fn with_api_base(mut self, base: impl Into<String>) -> Self {
        self.api_base = base.into().trim_end_matches('/').to_string();
        self
    }

    pub fn with_timeout(mut self, secs: u64) -> Self {
        self.timeout = Duration::from_secs(secs);
        self
    }

    pub fn with_retries(mut self, retries: u8) -> Self {
        self.max_retries = retries.max(1);
        self
    }

    fn endpoint(&self) -> String {
        format!("{}/bot{}/sendMessage", self.api_base, self.token)
    }

    /// POST with a short doubling backoff on transport errors and 5xx.
    /// Returns the final status so the caller can decide on a fallback.
    async fn post(&self, payload: &SendMessage<'_>) -> Result<reqwest::StatusCode> {
        let mut attempt: u8 = 0;
        loop {
            attempt += 1;
            let res = self
                .client
                .post(self.endpoint())
                .timeout(self.timeout)
                .json(payload)
                .send()
                .await;

            match res {
                Ok(rsp) if rsp.status().is_server_error() && attempt < self.max_retries => {
                    tokio::time::sleep(Duration::from_millis(500u64 << (attempt - 1))).await;
                }
                Ok(rsp) => return Ok(rsp.status()),
                Err(e) => {
                    if attempt < self.max_retries {
                        tokio::time::sleep(Duration::from_millis(500u64 << (attempt - 1))).await;
                        continue;
                    }
                    return Err(anyhow!("telegram request failed: {e}"));
                }
            }
        }
    }
}

#[async_trait::async_trait]
impl Notifier for TelegramNotifier {
    async fn deliver(&self, user: UserId, msg: &Notification) -> Result<()> {
        let html = msg.html();
        let markup = msg.link().map(InlineKeyboard::open_button);
        let rich = SendMessage {
            chat_id: user,
            text: &html,
            parse_mode: Some("HTML"),
            disable_web_page_preview: true,
            reply_markup: markup.as_ref(),
        };
        let status = self.post(&rich).await?;
        if status.is_success() {
            return Ok(());
        }

        // Malformed markup is the usual cause of a 400; resend as plain text.
        tracing::debug!(target: "notify", user, %status, "html message rejected, retrying as plain text");
        let plain_text = msg.plain();
        let plain = SendMessage {
            chat_id: user,
            text: &plain_text,
            parse_mode: None,
            disable_web_page_preview: true,
            reply_markup: None,
        };
        let status = self.post(&plain).await?;
        if status.is_success() {
            Ok(())
        } else {
            Err(anyhow!("telegram sendMessage HTTP error: {status}"))
        }
    }

    fn name(&self) -> &'static str {
        "telegram"
    }
}

#[derive(Serialize)]
struct SendMessage<'a> {
    chat_id: UserId,
    text: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    parse_mode: Option<&'a str>,
    disable_web_page_preview: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    reply_markup: Option<&'a InlineKeyboard>,
}

#[derive(Serialize)]
struct InlineButton {
    text: String,
    url: String,
}

#[derive(Serialize)]
struct InlineKeyboard {
    inline_keyboard: Vec<Vec<InlineButton>>,
}

impl InlineKeyboard {
    fn open_button(url: &str) -> Self {
        Self {
            inline_keyboard: vec![vec![InlineButton {
                text: "Open".to_string(),
                url: url.to_string(),
            }]],
        }
    }
}
