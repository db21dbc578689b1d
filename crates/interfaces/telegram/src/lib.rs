//! Telegram Bot API transport and long-polling loop.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Result, bail};
use async_trait::async_trait;
use reqwest::Client;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tracing::{debug, info, warn};

use bumblebee_runtime::{
    ChatId, Engine, Incoming, IncomingKind, MessageId, Transport, UpdateQueue, UserRef, View,
};

const MAX_TEXT: usize = 4096;
const MAX_CAPTION: usize = 1024;

pub struct TelegramClient {
    client: Client,
    base_url: String,
}

impl TelegramClient {
    pub fn new(token: &str) -> Result<Self> {
        let token = token.trim();
        if token.is_empty() {
            bail!("telegram bot token is empty");
        }
        Ok(Self {
            client: Client::new(),
            base_url: format!("https://api.telegram.org/bot{token}"),
        })
    }

    async fn call<B: Serialize + ?Sized, T: DeserializeOwned>(&self, method: &str, body: &B) -> Result<T> {
        let url = format!("{}/{method}", self.base_url);
        let response = self.client.post(url).json(body).send().await?;
        let status = response.status();
        let payload: TelegramResponse<T> = response.json().await?;
        if !payload.ok {
            let code = payload.error_code.unwrap_or(status.as_u16() as i64);
            let description = payload
                .description
                .unwrap_or_else(|| format!("telegram {method} failed"));
            bail!("{method} failed ({code}): {description}");
        }
        match payload.result {
            Some(result) => Ok(result),
            None => bail!("{method} returned no result"),
        }
    }

    async fn fetch_updates(&self, offset: i64, timeout_secs: u64) -> Result<Vec<TelegramUpdate>> {
        let body = serde_json::json!({
            "offset": offset,
            "timeout": timeout_secs,
            "allowed_updates": ["message", "callback_query"],
        });
        self.call("getUpdates", &body).await
    }
}

#[async_trait]
impl Transport for TelegramClient {
    async fn send(&self, chat: ChatId, view: &View) -> Result<MessageId> {
        let reply_markup = keyboard(view);
        let sent: TelegramMessage = match &view.photo {
            Some(photo) => {
                let body = SendPhotoRequest {
                    chat_id: chat,
                    photo,
                    caption: clip(&view.text, MAX_CAPTION),
                    reply_markup,
                };
                self.call("sendPhoto", &body).await?
            }
            None => {
                let body = SendMessageRequest {
                    chat_id: chat,
                    text: clip(&view.text, MAX_TEXT),
                    disable_web_page_preview: true,
                    reply_markup,
                };
                self.call("sendMessage", &body).await?
            }
        };
        Ok(sent.message_id)
    }

    async fn edit(&self, chat: ChatId, message: MessageId, view: &View) -> Result<()> {
        let body = EditMessageTextRequest {
            chat_id: chat,
            message_id: message,
            text: clip(&view.text, MAX_TEXT),
            disable_web_page_preview: true,
            reply_markup: keyboard(view),
        };
        match self.call::<_, serde_json::Value>("editMessageText", &body).await {
            Ok(_) => Ok(()),
            // Re-rendering an identical view is not a failure.
            Err(err) if err.to_string().contains("message is not modified") => Ok(()),
            Err(err) => Err(err),
        }
    }

    async fn delete(&self, chat: ChatId, message: MessageId) -> Result<()> {
        let body = serde_json::json!({ "chat_id": chat, "message_id": message });
        let _: bool = self.call("deleteMessage", &body).await?;
        Ok(())
    }

    async fn answer_callback(&self, callback_id: &str) -> Result<()> {
        let body = serde_json::json!({ "callback_query_id": callback_id });
        let _: bool = self.call("answerCallbackQuery", &body).await?;
        Ok(())
    }
}

/// Poll `getUpdates` until `shutdown` flips, handing each update to the
/// engine on its own task.
pub async fn run_polling(
    client: Arc<TelegramClient>,
    engine: Arc<Engine>,
    poll_timeout_secs: u64,
    mut shutdown: watch::Receiver<bool>,
) -> Result<()> {
    let mut offset: i64 = 0;
    // One user's updates are handled in the order Telegram delivered them.
    let queue = UpdateQueue::new(engine);
    info!(poll_timeout_secs, "telegram polling started");

    loop {
        let updates = tokio::select! {
            result = client.fetch_updates(offset, poll_timeout_secs) => result,
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
                continue;
            }
        };

        let updates = match updates {
            Ok(updates) => updates,
            Err(err) => {
                let backoff = if err.to_string().contains("(409)") {
                    // Another instance is polling with the same token.
                    warn!("getUpdates conflict: another bot instance is running; waiting 15s");
                    Duration::from_secs(15)
                } else {
                    warn!(?err, "getUpdates failed, retrying in 5s");
                    Duration::from_secs(5)
                };
                tokio::time::sleep(backoff).await;
                continue;
            }
        };

        for update in updates {
            offset = offset.max(update.update_id + 1);
            let Some(incoming) = to_incoming(update) else {
                continue;
            };
            debug!(user_id = incoming.user.id, chat = incoming.chat, "update received");
            queue.push(incoming);
        }
    }

    info!("telegram polling stopped");
    Ok(())
}

fn to_incoming(update: TelegramUpdate) -> Option<Incoming> {
    if let Some(query) = update.callback_query {
        let message = query.message?;
        return Some(Incoming {
            user: query.from.into(),
            chat: message.chat.id,
            kind: IncomingKind::Button {
                callback_id: query.id,
                message_id: Some(message.message_id),
                data: query.data.unwrap_or_default(),
            },
        });
    }

    let message = update.message?;
    let user: UserRef = message.from?.into();
    let kind = if let Some(text) = message.text {
        match normalize_telegram_command(&text) {
            Some(command) => IncomingKind::Command(command),
            None => IncomingKind::Text(text.trim().to_string()),
        }
    } else if let Some(largest) = message.photo.and_then(|sizes| sizes.into_iter().last()) {
        IncomingKind::Photo {
            file_id: largest.file_id,
        }
    } else {
        return None;
    };

    Some(Incoming {
        user,
        chat: message.chat.id,
        kind,
    })
}

/// `"/menu@bumblebee_bot extra"` → `Some("menu")`; `None` for plain text.
fn normalize_telegram_command(text: &str) -> Option<String> {
    let trimmed = text.trim();
    let command = trimmed.strip_prefix('/')?.split_whitespace().next()?;
    let command = command
        .split_once('@')
        .map(|(base, _)| base)
        .unwrap_or(command);
    if command.is_empty() {
        return None;
    }
    Some(command.to_lowercase())
}

fn keyboard(view: &View) -> Option<InlineKeyboardMarkup<'_>> {
    if view.keyboard.is_empty() {
        return None;
    }
    Some(InlineKeyboardMarkup {
        inline_keyboard: view
            .keyboard
            .iter()
            .map(|row| {
                row.iter()
                    .map(|button| InlineKeyboardButton {
                        text: &button.label,
                        callback_data: &button.data,
                    })
                    .collect()
            })
            .collect(),
    })
}

fn clip(text: &str, max_chars: usize) -> &str {
    match text.char_indices().nth(max_chars) {
        Some((idx, _)) => &text[..idx],
        None => text,
    }
}

// ── Wire types ────────────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct TelegramResponse<T> {
    ok: bool,
    result: Option<T>,
    description: Option<String>,
    error_code: Option<i64>,
}

#[derive(Debug, Deserialize)]
struct TelegramUpdate {
    update_id: i64,
    message: Option<TelegramMessage>,
    callback_query: Option<TelegramCallbackQuery>,
}

#[derive(Debug, Deserialize)]
struct TelegramMessage {
    message_id: i64,
    from: Option<TelegramUser>,
    chat: TelegramChat,
    text: Option<String>,
    photo: Option<Vec<TelegramPhotoSize>>,
}

#[derive(Debug, Deserialize)]
struct TelegramCallbackQuery {
    id: String,
    from: TelegramUser,
    message: Option<TelegramMessage>,
    data: Option<String>,
}

#[derive(Debug, Deserialize)]
struct TelegramUser {
    id: i64,
    first_name: String,
    username: Option<String>,
}

impl From<TelegramUser> for UserRef {
    fn from(user: TelegramUser) -> Self {
        Self {
            id: user.id,
            display_name: user.username.unwrap_or(user.first_name),
        }
    }
}

#[derive(Debug, Deserialize)]
struct TelegramChat {
    id: i64,
}

#[derive(Debug, Deserialize)]
struct TelegramPhotoSize {
    file_id: String,
}

#[derive(Debug, Serialize)]
struct InlineKeyboardButton<'a> {
    text: &'a str,
    callback_data: &'a str,
}

#[derive(Debug, Serialize)]
struct InlineKeyboardMarkup<'a> {
    inline_keyboard: Vec<Vec<InlineKeyboardButton<'a>>>,
}

#[derive(Debug, Serialize)]
struct SendMessageRequest<'a> {
    chat_id: i64,
    text: &'a str,
    disable_web_page_preview: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    reply_markup: Option<InlineKeyboardMarkup<'a>>,
}

#[derive(Debug, Serialize)]
struct SendPhotoRequest<'a> {
    chat_id: i64,
    photo: &'a str,
    caption: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    reply_markup: Option<InlineKeyboardMarkup<'a>>,
}

#[derive(Debug, Serialize)]
struct EditMessageTextRequest<'a> {
    chat_id: i64,
    message_id: i64,
    text: &'a str,
    disable_web_page_preview: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    reply_markup: Option<InlineKeyboardMarkup<'a>>,
}
