use std::{future::Future, sync::Arc};

use chrono::{DateTime, Utc};
use futures::StreamExt;
use tracing::{debug, warn};

use crate::{
    domain::{ChatId, MediaType, Message},
    errors::Error,
    ports::{OcrEngine, RawMedia, RawMessage, TelegramClient},
    resilience::{ErrorHandler, HealthMonitor, RateLimiter},
    utils::non_empty_trimmed,
    Result,
};

/// Messages fetched between two rate limiter acquisitions during history scans.
const HISTORY_ACQUIRE_EVERY: usize = 10;

/// Run `fut`, turning any error into `None`.
///
/// Outcomes are reported to `health`. Used wherever one failed item must not
/// stop the surrounding loop.
pub async fn guard_processing<T, Fut>(
    operation: &str,
    health: &HealthMonitor,
    fut: Fut,
) -> Option<T>
where
    Fut: Future<Output = Result<T>>,
{
    match fut.await {
        Ok(v) => {
            health.record_success(operation);
            Some(v)
        }
        Err(e) => {
            warn!(operation, error = %e, "processing failed, skipping item");
            health.record_failure(operation, &e);
            None
        }
    }
}

/// Turns transport messages into [`Message`] records.
pub struct MessageProcessor {
    ocr: Option<Arc<dyn OcrEngine>>,
    rate_limiter: Arc<RateLimiter>,
    health: Arc<HealthMonitor>,
    errors: Arc<ErrorHandler>,
}

impl MessageProcessor {
    pub fn new(
        ocr: Option<Arc<dyn OcrEngine>>,
        rate_limiter: Arc<RateLimiter>,
        health: Arc<HealthMonitor>,
        errors: Arc<ErrorHandler>,
    ) -> Self {
        Self {
            ocr,
            rate_limiter,
            health,
            errors,
        }
    }

    /// Never fails; errors are logged and yield `None`.
    pub async fn process_message(
        &self,
        raw: &RawMessage,
        client: &dyn TelegramClient,
    ) -> Option<Message> {
        guard_processing(
            "process_message",
            &self.health,
            self.try_process_message(raw, client),
        )
        .await
    }

    /// Like [`process_message`](Self::process_message) but surfaces errors.
    ///
    /// Media problems only cost the extracted text; `SessionExpired` is the
    /// one error that escapes.
    pub async fn try_process_message(
        &self,
        raw: &RawMessage,
        client: &dyn TelegramClient,
    ) -> Result<Message> {
        let mut msg = Message {
            id: raw.id,
            timestamp: raw.date.unwrap_or_else(Utc::now),
            group_id: raw.chat_id.unwrap_or(0),
            group_name: raw.chat_title.clone().unwrap_or_default(),
            sender_id: raw.sender_id.unwrap_or(0),
            sender_username: raw.sender_username.clone().unwrap_or_default(),
            content: non_empty_trimmed(raw.text.as_deref()).unwrap_or_default(),
            media_type: MediaType::None,
            extracted_text: None,
            relevance_score: 0.0,
            matched_criteria: Vec::new(),
        };

        if let Some(media) = &raw.media {
            msg.media_type = classify_media(media);

            if msg.media_type.is_image() {
                match self.ocr_media(media, client).await {
                    Ok(text) => msg.extracted_text = text,
                    Err(e) if e.is_session_expired() => return Err(e),
                    Err(e) => {
                        warn!(message_id = raw.id, error = %e, "media text extraction failed");
                    }
                }
            } else if let RawMedia::Document { file_name, .. } = media {
                let name = file_name.as_deref().unwrap_or("unknown");
                msg.extracted_text = Some(format!("Document: {name}"));
            }
        }

        debug!(
            message_id = msg.id,
            group_id = msg.group_id,
            media = msg.media_type.as_str(),
            "message processed"
        );
        Ok(msg)
    }

    async fn ocr_media(
        &self,
        media: &RawMedia,
        client: &dyn TelegramClient,
    ) -> Result<Option<String>> {
        let Some(ocr) = &self.ocr else {
            return Ok(None);
        };

        self.rate_limiter.acquire().await;
        let bytes = self
            .errors
            .with_retry("download_media", || client.download_media(media))
            .await?;
        if bytes.is_empty() {
            return Ok(None);
        }

        let text = ocr.extract_text(&bytes).await?;
        Ok(non_empty_trimmed(text.as_deref()))
    }

    /// Fetch up to `limit` past messages of `chat`, newest first, stopping at
    /// `since`. Messages that fail to process are left out.
    pub async fn process_message_history(
        &self,
        client: &dyn TelegramClient,
        chat: ChatId,
        limit: usize,
        since: Option<DateTime<Utc>>,
    ) -> Result<Vec<Message>> {
        let mut stream = client.iter_messages(chat, limit);
        let mut out = Vec::new();
        let mut seen = 0usize;

        while let Some(item) = stream.next().await {
            if seen % HISTORY_ACQUIRE_EVERY == 0 {
                self.rate_limiter.acquire().await;
            }
            seen += 1;

            let raw = match item {
                Ok(raw) => raw,
                Err(e) if e.is_session_expired() => return Err(e),
                Err(e) => {
                    warn!(chat_id = chat.0, error = %e, "history fetch interrupted");
                    self.health.record_failure("message_history", &e);
                    break;
                }
            };

            if let (Some(since), Some(date)) = (since, raw.date) {
                if date < since {
                    break;
                }
            }

            match self.try_process_message(&raw, client).await {
                Ok(m) => out.push(m),
                Err(e @ Error::SessionExpired(_)) => return Err(e),
                Err(e) => debug!(message_id = raw.id, error = %e, "history message dropped"),
            }
        }

        debug!(chat_id = chat.0, fetched = seen, processed = out.len(), "history processed");
        Ok(out)
    }
}

fn classify_media(media: &RawMedia) -> MediaType {
    match media {
        RawMedia::Photo { .. } => MediaType::Photo,
        RawMedia::Document { mime_type, .. } => {
            let mime = mime_type.as_deref().unwrap_or("").to_ascii_lowercase();
            if mime.starts_with("image/") {
                MediaType::Image
            } else if mime.starts_with("video/") {
                MediaType::Video
            } else if mime.starts_with("audio/") {
                MediaType::Audio
            } else {
                MediaType::Document
            }
        }
        RawMedia::Video { .. } => MediaType::Video,
        RawMedia::Audio { .. } => MediaType::Audio,
        RawMedia::Other => MediaType::None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ports::fakes::{FakeOcr, FakeTelegram};
    use crate::resilience::RetryPolicy;
    use chrono::{Duration as ChronoDuration, TimeZone};
    use std::sync::atomic::Ordering;

    fn processor(ocr: Option<Arc<dyn OcrEngine>>) -> MessageProcessor {
        MessageProcessor::new(
            ocr,
            Arc::new(RateLimiter::per_minute(600)),
            Arc::new(HealthMonitor::new()),
            Arc::new(ErrorHandler::new(RetryPolicy::default())),
        )
    }

    fn raw(id: i64, text: Option<&str>) -> RawMessage {
        RawMessage {
            id,
            date: Some(Utc.with_ymd_and_hms(2026, 5, 1, 10, 0, 0).unwrap()),
            chat_id: Some(-100),
            chat_title: Some("Rustaceans".into()),
            sender_id: Some(42),
            sender_username: Some("ferris".into()),
            text: text.map(str::to_string),
            media: None,
        }
    }

    #[tokio::test]
    async fn missing_fields_default_to_empty() {
        let client = FakeTelegram::authorized();
        let m = processor(None)
            .process_message(&RawMessage { id: 9, ..RawMessage::default() }, &client)
            .await
            .unwrap();
        assert_eq!(m.id, 9);
        assert_eq!(m.group_id, 0);
        assert_eq!(m.group_name, "");
        assert_eq!(m.sender_username, "");
        assert_eq!(m.content, "");
        assert_eq!(m.media_type, MediaType::None);
    }

    #[tokio::test]
    async fn text_is_trimmed() {
        let client = FakeTelegram::authorized();
        let m = processor(None)
            .process_message(&raw(1, Some("  hello  ")), &client)
            .await
            .unwrap();
        assert_eq!(m.content, "hello");
        assert_eq!(m.group_name, "Rustaceans");
    }

    #[tokio::test]
    async fn photos_go_through_ocr() {
        let client = FakeTelegram::authorized();
        client
            .media
            .lock()
            .unwrap()
            .insert("f1".into(), b"png-bytes".to_vec());
        let ocr = Arc::new(FakeOcr::with(b"png-bytes", "  INVOICE 42 \n"));

        let mut r = raw(1, None);
        r.media = Some(RawMedia::Photo {
            file_id: "f1".into(),
        });
        let m = processor(Some(ocr.clone()))
            .process_message(&r, &client)
            .await
            .unwrap();

        assert_eq!(m.media_type, MediaType::Photo);
        assert_eq!(m.extracted_text.as_deref(), Some("INVOICE 42"));
        assert_eq!(ocr.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn documents_get_placeholder_text() {
        let client = FakeTelegram::authorized();
        let mut r = raw(1, Some("see file"));
        r.media = Some(RawMedia::Document {
            file_id: "d".into(),
            file_name: Some("report.pdf".into()),
            mime_type: Some("application/pdf".into()),
        });
        let m = processor(None).process_message(&r, &client).await.unwrap();
        assert_eq!(m.media_type, MediaType::Document);
        assert_eq!(m.extracted_text.as_deref(), Some("Document: report.pdf"));
    }

    #[test]
    fn documents_are_classified_by_mime() {
        let doc = |mime: &str| RawMedia::Document {
            file_id: "x".into(),
            file_name: None,
            mime_type: Some(mime.into()),
        };
        assert_eq!(classify_media(&doc("image/png")), MediaType::Image);
        assert_eq!(classify_media(&doc("video/mp4")), MediaType::Video);
        assert_eq!(classify_media(&doc("audio/ogg")), MediaType::Audio);
        assert_eq!(classify_media(&doc("application/zip")), MediaType::Document);
        assert_eq!(classify_media(&RawMedia::Other), MediaType::None);
    }

    #[tokio::test(start_paused = true)]
    async fn failed_download_keeps_message() {
        let client = FakeTelegram::authorized();
        let ocr: Arc<dyn OcrEngine> = Arc::new(FakeOcr::default());
        let mut r = raw(1, Some("pic"));
        r.media = Some(RawMedia::Photo {
            file_id: "missing".into(),
        });
        let m = processor(Some(ocr)).process_message(&r, &client).await.unwrap();
        assert_eq!(m.content, "pic");
        assert!(m.extracted_text.is_none());
    }

    #[tokio::test]
    async fn history_stops_at_cutoff_and_on_session_expiry() {
        let client = FakeTelegram::authorized();
        let base = Utc.with_ymd_and_hms(2026, 5, 10, 0, 0, 0).unwrap();
        let msgs: Vec<Result<RawMessage>> = (0..5)
            .map(|i| {
                let mut r = raw(100 - i, Some("m"));
                r.date = Some(base - ChronoDuration::days(i));
                Ok(r)
            })
            .collect();
        client.set_history(-100, msgs);

        let p = processor(None);
        let out = p
            .process_message_history(&client, ChatId(-100), 50, Some(base - ChronoDuration::days(2)))
            .await
            .unwrap();
        assert_eq!(out.iter().map(|m| m.id).collect::<Vec<_>>(), vec![100, 99, 98]);

        let limited = p
            .process_message_history(&client, ChatId(-100), 2, None)
            .await
            .unwrap();
        assert_eq!(limited.len(), 2);

        client.set_history(
            -200,
            vec![Ok(raw(1, Some("a"))), Err(Error::SessionExpired("revoked".into()))],
        );
        let err = p
            .process_message_history(&client, ChatId(-200), 50, None)
            .await
            .unwrap_err();
        assert!(err.is_session_expired());
    }

    #[tokio::test]
    async fn guard_turns_errors_into_none() {
        let health = HealthMonitor::new();
        let out: Option<()> = guard_processing("x", &health, async {
            Err(Error::External("boom".into()))
        })
        .await;
        assert!(out.is_none());
        assert_eq!(health.get_health_status().consecutive_failures, 1);

        let ok = guard_processing("x", &health, async { Ok(5) }).await;
        assert_eq!(ok, Some(5));
        assert!(health.is_healthy());
    }
}
