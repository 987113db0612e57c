use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::stream::BoxStream;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::{
    domain::{ChatId, MessageId},
    Result,
};

/// What kind of peer a dialog points at.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ChatKind {
    User,
    BasicGroup,
    /// Supergroup: channel-backed but with normal group semantics.
    Megagroup,
    /// Broadcast channel.
    Channel,
}

impl ChatKind {
    pub fn is_group_like(self) -> bool {
        !matches!(self, ChatKind::User)
    }
}

/// One entry from the account's dialog list.
#[derive(Clone, Debug, PartialEq)]
pub struct Dialog {
    pub id: i64,
    pub title: String,
    pub username: Option<String>,
    pub kind: ChatKind,
    /// Count carried on the dialog itself, if the API returned one.
    pub participants_count: Option<i64>,
    pub access_hash: i64,
}

/// Attached media as seen by the transport, before classification.
#[derive(Clone, Debug, PartialEq)]
pub enum RawMedia {
    Photo {
        file_id: String,
    },
    Document {
        file_id: String,
        file_name: Option<String>,
        mime_type: Option<String>,
    },
    Video {
        file_id: String,
    },
    Audio {
        file_id: String,
    },
    Other,
}

/// Transport-level message. Every field may be missing.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct RawMessage {
    pub id: i64,
    pub date: Option<DateTime<Utc>>,
    pub chat_id: Option<i64>,
    pub chat_title: Option<String>,
    pub sender_id: Option<i64>,
    pub sender_username: Option<String>,
    pub text: Option<String>,
    pub media: Option<RawMedia>,
}

/// Port for the Telegram transport.
///
/// Errors must already be mapped into the core taxonomy
/// (`RateLimited`, `SessionExpired`, `PermissionDenied`, `Network`, ...)
/// so the retry layer can classify them.
#[async_trait]
pub trait TelegramClient: Send + Sync {
    async fn connect(&self) -> Result<()>;

    async fn is_authorized(&self) -> Result<bool>;

    fn iter_dialogs(&self) -> BoxStream<'_, Result<Dialog>>;

    /// Direct lookup by username or title; `Ok(None)` when unknown.
    async fn resolve_dialog(&self, name: &str) -> Result<Option<Dialog>>;

    /// Full member count for a group-like dialog.
    async fn participants_count(&self, dialog: &Dialog) -> Result<i64>;

    /// Newest-first history for a chat.
    fn iter_messages(&self, chat: ChatId, limit: usize) -> BoxStream<'_, Result<RawMessage>>;

    async fn download_media(&self, media: &RawMedia) -> Result<Vec<u8>>;

    async fn send_message(
        &self,
        chat: ChatId,
        text: &str,
        reply_to: Option<MessageId>,
    ) -> Result<MessageId>;

    /// Start delivering new messages; the stream ends when `cancel` fires.
    async fn subscribe(&self, cancel: CancellationToken) -> Result<mpsc::Receiver<RawMessage>>;
}

#[async_trait]
pub trait OcrEngine: Send + Sync {
    /// `Ok(None)` when the image holds no text.
    async fn extract_text(&self, image: &[u8]) -> Result<Option<String>>;
}

#[async_trait]
pub trait ResponseGenerator: Send + Sync {
    /// `Ok(None)` when the provider answered with nothing usable.
    async fn generate(&self, prompt: &str) -> Result<Option<String>>;
}
