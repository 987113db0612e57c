//! Telegram adapter (teloxide).
//!
//! Implements the `tgs-core` [`TelegramClient`] port over the Bot API.
//!
//! The Bot API has no dialog list and no history endpoint, so:
//! - dialogs are the chats the bot has seen (pending updates at connect time
//!   and every live update afterwards), plus direct `get_chat` lookups;
//! - `iter_messages` yields nothing; only live traffic is scanned.

use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, RwLock,
    },
};

use async_trait::async_trait;
use futures::stream::{self, BoxStream, StreamExt};
use teloxide::{
    dispatching::{Dispatcher, UpdateFilterExt},
    dptree,
    net::Download,
    prelude::*,
    types::{Chat, Recipient},
    ApiError, RequestError,
};
use tokio::{
    sync::{mpsc, Mutex},
    task::JoinHandle,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use tgs_core::{
    domain::{ChatId, MessageId},
    errors::Error,
    ports::{ChatKind, Dialog, RawMedia, RawMessage, TelegramClient},
    Result,
};

/// Buffer between the dispatcher and the scanner's router task.
const LIVE_BUFFER: usize = 256;

/// Chats the bot has seen, keyed by chat id.
#[derive(Clone, Default)]
struct ChatRegistry(Arc<RwLock<HashMap<i64, Dialog>>>);

impl ChatRegistry {
    fn remember(&self, chat: &Chat) {
        let dialog = dialog_from_chat(chat);
        self.0
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(dialog.id, dialog);
    }

    fn snapshot(&self) -> Vec<Dialog> {
        let mut all: Vec<Dialog> = self
            .0
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .values()
            .cloned()
            .collect();
        all.sort_by_key(|d| d.id);
        all
    }

    fn find_title(&self, title: &str) -> Option<Dialog> {
        let needle = title.to_lowercase();
        self.0
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .values()
            .find(|d| d.title.to_lowercase() == needle)
            .cloned()
    }
}

/// A running long-polling dispatcher.
struct Poller {
    stop: CancellationToken,
    done: JoinHandle<()>,
}

impl Poller {
    /// Stop polling and wait until the last `getUpdates` call has returned.
    async fn retire(self) {
        self.stop.cancel();
        if let Err(e) = self.done.await {
            warn!(error = %e, "telegram dispatcher task failed");
        }
    }
}

/// Only one poller may run per token; Telegram answers a second concurrent
/// `getUpdates` with 409 Conflict.
async fn replace_poller(slot: &Mutex<Option<Poller>>, start: impl FnOnce() -> Poller) {
    let mut slot = slot.lock().await;
    if let Some(prev) = slot.take() {
        debug!("waiting for previous dispatcher to shut down");
        prev.retire().await;
    }
    *slot = Some(start());
}

#[derive(Clone)]
pub struct TelegramBot {
    bot: Bot,
    chats: ChatRegistry,
    /// Set once `get_me` succeeded; an invalid token afterwards means the
    /// token was revoked mid-session.
    connected: Arc<AtomicBool>,
    poller: Arc<Mutex<Option<Poller>>>,
}

impl TelegramBot {
    pub fn new(token: impl Into<String>) -> Self {
        Self {
            bot: Bot::new(token),
            chats: ChatRegistry::default(),
            connected: Arc::new(AtomicBool::new(false)),
            poller: Arc::new(Mutex::new(None)),
        }
    }

    pub fn bot(&self) -> Bot {
        self.bot.clone()
    }

    fn tg_chat(chat: ChatId) -> teloxide::types::ChatId {
        teloxide::types::ChatId(chat.0)
    }

    fn map_err(&self, e: RequestError) -> Error {
        map_request_error(e, self.connected.load(Ordering::SeqCst))
    }

    /// Peek at pending updates without confirming them so the dispatcher
    /// still receives them later.
    async fn prime_registry(&self) {
        match self.bot.get_updates().limit(100).await {
            Ok(updates) => {
                for update in &updates {
                    if let Some(chat) = update.chat() {
                        self.chats.remember(chat);
                    }
                }
                debug!(
                    updates = updates.len(),
                    chats = self.chats.snapshot().len(),
                    "chat registry primed"
                );
            }
            Err(e) => warn!(error = %e, "could not read pending updates"),
        }
    }
}

/// Classify a teloxide error into the core taxonomy.
fn map_request_error(e: RequestError, connected: bool) -> Error {
    match e {
        RequestError::RetryAfter(d) => Error::RateLimited {
            seconds: d.as_secs(),
        },
        RequestError::Network(e) => Error::Network(e.to_string()),
        RequestError::Io(e) => Error::Network(e.to_string()),
        RequestError::Api(api) => map_api_error(api, connected),
        other => Error::External(format!("telegram error: {other}")),
    }
}

fn map_api_error(api: ApiError, connected: bool) -> Error {
    match api {
        ApiError::NotFound if connected => {
            Error::SessionExpired("bot token was revoked".to_string())
        }
        ApiError::NotFound => Error::InvalidCredentials("invalid bot token".to_string()),
        ApiError::BotBlocked
        | ApiError::BotKicked
        | ApiError::NotEnoughRightsToPostMessages
        | ApiError::ChatNotFound => Error::PermissionDenied(api.to_string()),
        other => Error::External(format!("telegram api error: {other}")),
    }
}

fn chat_kind(chat: &Chat) -> ChatKind {
    if chat.is_channel() {
        ChatKind::Channel
    } else if chat.is_supergroup() {
        ChatKind::Megagroup
    } else if chat.is_group() {
        ChatKind::BasicGroup
    } else {
        ChatKind::User
    }
}

fn chat_title(chat: &Chat) -> String {
    chat.title()
        .or_else(|| chat.username())
        .or_else(|| chat.first_name())
        .map(str::to_string)
        .unwrap_or_else(|| chat.id.0.to_string())
}

fn dialog_from_chat(chat: &Chat) -> Dialog {
    Dialog {
        id: chat.id.0,
        title: chat_title(chat),
        username: chat.username().map(str::to_string),
        kind: chat_kind(chat),
        participants_count: None,
        // The Bot API addresses chats by id alone.
        access_hash: 0,
    }
}

fn raw_media(msg: &Message) -> Option<RawMedia> {
    if let Some(sizes) = msg.photo() {
        return sizes.last().map(|p| RawMedia::Photo {
            file_id: p.file.id.clone(),
        });
    }
    if let Some(doc) = msg.document() {
        return Some(RawMedia::Document {
            file_id: doc.file.id.clone(),
            file_name: doc.file_name.clone(),
            mime_type: doc.mime_type.as_ref().map(|m| m.essence_str().to_string()),
        });
    }
    if let Some(v) = msg.video() {
        return Some(RawMedia::Video {
            file_id: v.file.id.clone(),
        });
    }
    if let Some(a) = msg.audio() {
        return Some(RawMedia::Audio {
            file_id: a.file.id.clone(),
        });
    }
    if let Some(v) = msg.voice() {
        return Some(RawMedia::Audio {
            file_id: v.file.id.clone(),
        });
    }
    if msg.sticker().is_some() || msg.animation().is_some() || msg.video_note().is_some() {
        return Some(RawMedia::Other);
    }
    None
}

fn raw_message(msg: &Message) -> RawMessage {
    let (sender_id, sender_username) = match msg.from() {
        Some(user) => (Some(user.id.0 as i64), user.username.clone()),
        None => match msg.sender_chat() {
            Some(chat) => (Some(chat.id.0), chat.username().map(str::to_string)),
            None => (None, None),
        },
    };

    RawMessage {
        id: i64::from(msg.id.0),
        date: Some(msg.date),
        chat_id: Some(msg.chat.id.0),
        chat_title: Some(chat_title(&msg.chat)),
        sender_id,
        sender_username,
        text: msg.text().or_else(|| msg.caption()).map(str::to_string),
        media: raw_media(msg),
    }
}

async fn forward_update(
    msg: Message,
    tx: mpsc::Sender<RawMessage>,
    chats: ChatRegistry,
) -> ResponseResult<()> {
    chats.remember(&msg.chat);
    if msg.chat.is_private() {
        return Ok(());
    }
    if tx.send(raw_message(&msg)).await.is_err() {
        debug!(message_id = msg.id.0, "live receiver closed, dropping update");
    }
    Ok(())
}

#[async_trait]
impl TelegramClient for TelegramBot {
    async fn connect(&self) -> Result<()> {
        let me = self.bot.get_me().await.map_err(|e| self.map_err(e))?;
        self.connected.store(true, Ordering::SeqCst);
        info!(bot = %me.username(), "connected to telegram");
        self.prime_registry().await;
        Ok(())
    }

    async fn is_authorized(&self) -> Result<bool> {
        match self.bot.get_me().await {
            Ok(_) => Ok(true),
            Err(RequestError::Api(ApiError::NotFound)) => Ok(false),
            Err(e) => Err(self.map_err(e)),
        }
    }

    fn iter_dialogs(&self) -> BoxStream<'_, Result<Dialog>> {
        stream::iter(self.chats.snapshot().into_iter().map(Ok)).boxed()
    }

    async fn resolve_dialog(&self, name: &str) -> Result<Option<Dialog>> {
        let name = name.trim();
        let recipient = if let Ok(id) = name.parse::<i64>() {
            Recipient::Id(teloxide::types::ChatId(id))
        } else if name.starts_with('@') || !name.contains(char::is_whitespace) {
            Recipient::ChannelUsername(format!("@{}", name.trim_start_matches('@')))
        } else {
            return Ok(self.chats.find_title(name));
        };

        match self.bot.get_chat(recipient).await {
            Ok(chat) => {
                self.chats.remember(&chat);
                Ok(Some(dialog_from_chat(&chat)))
            }
            Err(RequestError::Api(ApiError::ChatNotFound)) => Ok(self.chats.find_title(name)),
            Err(e) => Err(self.map_err(e)),
        }
    }

    async fn participants_count(&self, dialog: &Dialog) -> Result<i64> {
        let n = self
            .bot
            .get_chat_member_count(teloxide::types::ChatId(dialog.id))
            .await
            .map_err(|e| self.map_err(e))?;
        Ok(i64::from(n))
    }

    fn iter_messages(&self, chat: ChatId, _limit: usize) -> BoxStream<'_, Result<RawMessage>> {
        debug!(chat_id = chat.0, "history is not available over the bot api");
        stream::empty::<Result<RawMessage>>().boxed()
    }

    async fn download_media(&self, media: &RawMedia) -> Result<Vec<u8>> {
        let file_id = match media {
            RawMedia::Photo { file_id }
            | RawMedia::Document { file_id, .. }
            | RawMedia::Video { file_id }
            | RawMedia::Audio { file_id } => file_id.clone(),
            RawMedia::Other => {
                return Err(Error::UnsupportedFormat(
                    "media has no downloadable file".to_string(),
                ))
            }
        };

        let file = self
            .bot
            .get_file(file_id)
            .await
            .map_err(|e| self.map_err(e))?;
        let mut buf: Vec<u8> = Vec::new();
        self.bot
            .download_file(&file.path, &mut buf)
            .await
            .map_err(|e| Error::Network(format!("download failed: {e}")))?;
        Ok(buf)
    }

    async fn send_message(
        &self,
        chat: ChatId,
        text: &str,
        reply_to: Option<MessageId>,
    ) -> Result<MessageId> {
        let mut req = self.bot.send_message(Self::tg_chat(chat), text.to_string());
        if let Some(id) = reply_to.and_then(|m| i32::try_from(m.0).ok()) {
            req = req.reply_to_message_id(teloxide::types::MessageId(id));
        }
        let sent = req.await.map_err(|e| self.map_err(e))?;
        Ok(MessageId(i64::from(sent.id.0)))
    }

    async fn subscribe(&self, cancel: CancellationToken) -> Result<mpsc::Receiver<RawMessage>> {
        let (tx, rx) = mpsc::channel(LIVE_BUFFER);

        let handler = dptree::entry()
            .branch(Update::filter_message().endpoint(forward_update))
            .branch(Update::filter_channel_post().endpoint(forward_update));

        let dispatcher = Dispatcher::builder(self.bot.clone(), handler)
            .dependencies(dptree::deps![tx, self.chats.clone()])
            .default_handler(|_| async {})
            .build();

        replace_poller(&self.poller, move || {
            let stop = CancellationToken::new();
            let halt = stop.clone();
            let done = tokio::spawn(async move {
                let mut dispatcher = dispatcher;
                let shutdown = dispatcher.shutdown_token();
                let run = dispatcher.dispatch();
                tokio::pin!(run);
                tokio::select! {
                    biased;
                    _ = &mut run => {
                        debug!("telegram dispatcher exited");
                        return;
                    }
                    _ = cancel.cancelled() => {}
                    _ = halt.cancelled() => {}
                }
                match shutdown.shutdown() {
                    Ok(_) => run.await,
                    Err(e) => debug!(error = %e, "dispatcher was not running"),
                }
                debug!("telegram dispatcher stopped");
            });
            Poller { stop, done }
        })
        .await;

        info!("listening for new messages");
        Ok(rx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn message(v: serde_json::Value) -> Message {
        serde_json::from_value(v).unwrap()
    }

    fn supergroup() -> serde_json::Value {
        json!({"id": -1001, "type": "supergroup", "title": "Rust Jobs", "username": "rustjobs"})
    }

    #[test]
    fn text_message_maps_to_raw() {
        let msg = message(json!({
            "message_id": 42,
            "date": 1_700_000_000,
            "chat": supergroup(),
            "from": {"id": 7, "is_bot": false, "first_name": "Ann", "username": "ann"},
            "text": "urgent: hiring"
        }));

        let raw = raw_message(&msg);
        assert_eq!(raw.id, 42);
        assert_eq!(raw.chat_id, Some(-1001));
        assert_eq!(raw.chat_title.as_deref(), Some("Rust Jobs"));
        assert_eq!(raw.sender_id, Some(7));
        assert_eq!(raw.sender_username.as_deref(), Some("ann"));
        assert_eq!(raw.text.as_deref(), Some("urgent: hiring"));
        assert_eq!(raw.media, None);
        assert_eq!(raw.date.map(|d| d.timestamp()), Some(1_700_000_000));
    }

    #[test]
    fn photo_uses_largest_size_and_caption() {
        let msg = message(json!({
            "message_id": 3,
            "date": 1_700_000_000,
            "chat": supergroup(),
            "caption": "see attached",
            "photo": [
                {"file_id": "small", "file_unique_id": "s", "width": 90, "height": 90},
                {"file_id": "large", "file_unique_id": "l", "width": 1280, "height": 1280}
            ]
        }));

        let raw = raw_message(&msg);
        assert_eq!(
            raw.media,
            Some(RawMedia::Photo {
                file_id: "large".into()
            })
        );
        assert_eq!(raw.text.as_deref(), Some("see attached"));
        assert_eq!(raw.sender_id, None);
    }

    #[test]
    fn chat_kinds_are_classified() {
        let basic = message(json!({
            "message_id": 1, "date": 0, "text": "x",
            "chat": {"id": -5, "type": "group", "title": "Family"}
        }));
        let d = dialog_from_chat(&basic.chat);
        assert_eq!(d.kind, ChatKind::BasicGroup);
        assert_eq!(d.username, None);

        let sg = message(json!({"message_id": 1, "date": 0, "text": "x", "chat": supergroup()}));
        assert_eq!(dialog_from_chat(&sg.chat).kind, ChatKind::Megagroup);

        let ch = message(json!({
            "message_id": 1, "date": 0, "text": "x",
            "chat": {"id": -1002, "type": "channel", "title": "News"}
        }));
        assert_eq!(dialog_from_chat(&ch.chat).kind, ChatKind::Channel);
    }

    #[test]
    fn api_errors_are_classified() {
        assert!(matches!(
            map_api_error(ApiError::NotFound, false),
            Error::InvalidCredentials(_)
        ));
        assert!(map_api_error(ApiError::NotFound, true).is_session_expired());
        assert!(matches!(
            map_api_error(ApiError::BotKicked, true),
            Error::PermissionDenied(_)
        ));
        assert!(matches!(
            map_api_error(ApiError::MessageNotModified, true),
            Error::External(_)
        ));
    }

    #[test]
    fn registry_lookup_by_title_ignores_case() {
        let reg = ChatRegistry::default();
        let msg = message(json!({"message_id": 1, "date": 0, "text": "x", "chat": supergroup()}));
        reg.remember(&msg.chat);
        assert_eq!(reg.find_title("rust jobs").map(|d| d.id), Some(-1001));
        assert!(reg.find_title("other").is_none());
        assert_eq!(reg.snapshot().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn previous_poller_is_drained_before_the_next_starts() {
        let slot = Mutex::new(None);
        let drained = Arc::new(AtomicBool::new(false));

        replace_poller(&slot, || {
            let stop = CancellationToken::new();
            let halt = stop.clone();
            let drained = drained.clone();
            let done = tokio::spawn(async move {
                halt.cancelled().await;
                // An in-flight long poll still has to come back.
                tokio::time::sleep(std::time::Duration::from_secs(2)).await;
                drained.store(true, Ordering::SeqCst);
            });
            Poller { stop, done }
        })
        .await;
        assert!(!drained.load(Ordering::SeqCst));

        let drained_at_start = Arc::new(AtomicBool::new(false));
        replace_poller(&slot, || {
            drained_at_start.store(drained.load(Ordering::SeqCst), Ordering::SeqCst);
            Poller {
                stop: CancellationToken::new(),
                done: tokio::spawn(async {}),
            }
        })
        .await;

        assert!(drained_at_start.load(Ordering::SeqCst));
        assert!(slot.lock().await.is_some());
    }
}
