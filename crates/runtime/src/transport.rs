//! Chat transport boundary.
//!
//! The engine only ever talks to a [`Transport`]; the Telegram client in
//! `bumblebee-telegram` is one implementation, the recording fake in the
//! tests is another.

use anyhow::Result;
use async_trait::async_trait;
use bumblebee_store::UserId;
use tracing::debug;

pub type ChatId = i64;
pub type MessageId = i64;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Button {
    pub label: String,
    /// Callback payload echoed back when the button is pressed.
    pub data: String,
}

impl Button {
    pub fn new(label: impl Into<String>, data: impl Into<String>) -> Self {
        Self {
            label: label.into(),
            data: data.into(),
        }
    }
}

/// A rendered bot message: text, an inline keyboard and an optional photo
/// (an opaque file reference understood by the transport).
#[derive(Debug, Clone, Default, PartialEq)]
pub struct View {
    pub text: String,
    pub keyboard: Vec<Vec<Button>>,
    pub photo: Option<String>,
}

impl View {
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            ..Self::default()
        }
    }

    /// Append `buttons` laid out two per row.
    pub fn buttons(mut self, buttons: Vec<Button>) -> Self {
        let mut buttons = buttons.into_iter().peekable();
        while buttons.peek().is_some() {
            self.keyboard.push(buttons.by_ref().take(2).collect());
        }
        self
    }

    /// Append a single full-width row.
    pub fn row(mut self, row: Vec<Button>) -> Self {
        self.keyboard.push(row);
        self
    }

    pub fn photo(mut self, file: Option<String>) -> Self {
        self.photo = file;
        self
    }

    /// Every callback payload in the keyboard, row-major.
    pub fn button_data(&self) -> Vec<&str> {
        self.keyboard
            .iter()
            .flatten()
            .map(|b| b.data.as_str())
            .collect()
    }
}

/// How [`Transport::replace`] treats the previous bot message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Placement {
    /// Edit the previous message where it is (button presses).
    InPlace,
    /// Remove the previous message and post at the bottom of the chat (after
    /// the user typed something).
    Bottom,
}

#[async_trait]
pub trait Transport: Send + Sync {
    async fn send(&self, chat: ChatId, view: &View) -> Result<MessageId>;
    async fn edit(&self, chat: ChatId, message: MessageId, view: &View) -> Result<()>;
    async fn delete(&self, chat: ChatId, message: MessageId) -> Result<()>;
    async fn answer_callback(&self, callback_id: &str) -> Result<()>;

    /// Show `view` in place of the previous bot message.
    ///
    /// Edit and delete failures are tolerated: an edit that fails falls back
    /// to delete-then-send, a delete that fails is ignored.  Only a failed
    /// send is an error.
    async fn replace(
        &self,
        chat: ChatId,
        previous: Option<MessageId>,
        view: &View,
        placement: Placement,
    ) -> Result<MessageId> {
        if let (Placement::InPlace, Some(message), None) = (placement, previous, &view.photo) {
            match self.edit(chat, message, view).await {
                Ok(()) => return Ok(message),
                Err(err) => debug!(chat, message, ?err, "edit failed, sending a fresh message"),
            }
        }
        if let Some(message) = previous {
            if let Err(err) = self.delete(chat, message).await {
                debug!(chat, message, ?err, "could not delete previous message");
            }
        }
        self.send(chat, view).await
    }
}

// ── Incoming updates ──────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq)]
pub struct UserRef {
    pub id: UserId,
    /// Username when the user has one, otherwise the first name.
    pub display_name: String,
}

#[derive(Debug, Clone, PartialEq)]
pub enum IncomingKind {
    /// A slash command, already normalised (`"start"`, `"menu"`).
    Command(String),
    Text(String),
    Photo { file_id: String },
    Button {
        callback_id: String,
        message_id: Option<MessageId>,
        data: String,
    },
}

#[derive(Debug, Clone, PartialEq)]
pub struct Incoming {
    pub user: UserRef,
    pub chat: ChatId,
    pub kind: IncomingKind,
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use super::*;

    #[test]
    fn buttons_are_laid_out_two_per_row() {
        let view = View::text("x").buttons(vec![
            Button::new("1", "a"),
            Button::new("2", "b"),
            Button::new("3", "c"),
        ]);
        assert_eq!(view.keyboard.len(), 2);
        assert_eq!(view.keyboard[0].len(), 2);
        assert_eq!(view.keyboard[1].len(), 1);
        assert_eq!(view.button_data(), vec!["a", "b", "c"]);
    }

    /// Edits always fail; deletes and sends are recorded.
    #[derive(Default)]
    struct Stubborn {
        log: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl Transport for Stubborn {
        async fn send(&self, _chat: ChatId, view: &View) -> Result<MessageId> {
            self.log.lock().unwrap().push(format!("send {}", view.text));
            Ok(99)
        }
        async fn edit(&self, _chat: ChatId, _message: MessageId, _view: &View) -> Result<()> {
            anyhow::bail!("message can't be edited")
        }
        async fn delete(&self, _chat: ChatId, message: MessageId) -> Result<()> {
            self.log.lock().unwrap().push(format!("delete {message}"));
            anyhow::bail!("message to delete not found")
        }
        async fn answer_callback(&self, _callback_id: &str) -> Result<()> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn replace_falls_back_from_edit_to_send() {
        let transport = Stubborn::default();
        let id = transport
            .replace(1, Some(5), &View::text("hello"), Placement::InPlace)
            .await
            .unwrap();
        assert_eq!(id, 99);
        assert_eq!(
            *transport.log.lock().unwrap(),
            vec!["delete 5".to_string(), "send hello".to_string()]
        );
    }

    #[tokio::test]
    async fn replace_without_previous_just_sends() {
        let transport = Stubborn::default();
        transport
            .replace(1, None, &View::text("hi"), Placement::Bottom)
            .await
            .unwrap();
        assert_eq!(*transport.log.lock().unwrap(), vec!["send hi".to_string()]);
    }
}
