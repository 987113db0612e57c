use std::{
    collections::{HashMap, HashSet},
    fmt::Write as _,
    sync::{Arc, Mutex},
};

use serde::Serialize;
use tracing::{debug, info, warn};

use crate::{
    config::AiConfig,
    domain::{ChatId, Message, MessageId},
    errors::Error,
    ports::{ResponseGenerator, TelegramClient},
    resilience::HealthMonitor,
    utils::{digest_parts, truncate_chars},
    Result,
};

/// Context messages included in the default prompt layout.
const CONTEXT_WINDOW: usize = 5;

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct ResponderStats {
    pub enabled: bool,
    pub auto_respond: bool,
    pub provider: String,
    pub model: String,
    pub cached_responses: usize,
    pub responses_sent: usize,
}

/// Generates replies for relevant messages and posts them back.
pub struct AiResponder {
    cfg: AiConfig,
    generator: Arc<dyn ResponseGenerator>,
    client: Arc<dyn TelegramClient>,
    health: Arc<HealthMonitor>,
    cache: Mutex<HashMap<String, String>>,
    /// (group_id, message_id) pairs already answered.
    sent: Mutex<HashSet<(i64, i64)>>,
}

impl AiResponder {
    pub fn new(
        cfg: AiConfig,
        generator: Arc<dyn ResponseGenerator>,
        client: Arc<dyn TelegramClient>,
        health: Arc<HealthMonitor>,
    ) -> Self {
        info!(
            enabled = cfg.enabled,
            provider = cfg.provider.as_str(),
            model = %cfg.model,
            "ai responder ready"
        );
        Self {
            cfg,
            generator,
            client,
            health,
            cache: Mutex::new(HashMap::new()),
            sent: Mutex::new(HashSet::new()),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.cfg.enabled
    }

    pub fn auto_respond(&self) -> bool {
        self.cfg.enabled && self.cfg.auto_respond
    }

    pub fn has_responded(&self, msg: &Message) -> bool {
        self.sent
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .contains(&(msg.group_id, msg.id))
    }

    pub fn build_prompt(&self, msg: &Message, context: &[Message]) -> String {
        let extracted = msg.extracted_text.as_deref().unwrap_or("");
        let recent = &context[context.len().saturating_sub(CONTEXT_WINDOW)..];

        let mut ctx = String::new();
        for m in recent {
            let _ = writeln!(
                ctx,
                "- {}: {}",
                display_sender(m),
                truncate_chars(&m.content, 200)
            );
        }

        if !self.cfg.prompt_template.trim().is_empty() {
            return self
                .cfg
                .prompt_template
                .replace("{message_content}", &msg.content)
                .replace("{sender_username}", &msg.sender_username)
                .replace("{group_name}", &msg.group_name)
                .replace("{extracted_text}", extracted)
                .replace("{timestamp}", &msg.timestamp.to_rfc3339())
                .replace("{context}", ctx.trim_end());
        }

        let mut p = String::new();
        let _ = writeln!(p, "Group: {}", msg.group_name);
        let _ = writeln!(p, "From: {}", display_sender(msg));
        let _ = writeln!(p, "Message: {}", msg.content);
        if !extracted.is_empty() {
            let _ = writeln!(p, "Text from attachment: {extracted}");
        }
        if !ctx.is_empty() {
            let _ = writeln!(p, "\nRecent conversation:\n{}", ctx.trim_end());
        }
        p.push_str("\nWrite a helpful, concise reply to this message.");
        p
    }

    /// `None` when disabled, when the provider fails, or when it returns nothing.
    pub async fn generate_response(&self, msg: &Message, context: &[Message]) -> Option<String> {
        if !self.cfg.enabled {
            return None;
        }

        let key = cache_key(msg);
        if self.cfg.cache_responses {
            let hit = self
                .cache
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .get(&key)
                .cloned();
            if let Some(hit) = hit {
                debug!(message_id = msg.id, "response cache hit");
                return Some(hit);
            }
        }

        let prompt = self.build_prompt(msg, context);
        let text = match self.generator.generate(&prompt).await {
            Ok(Some(t)) if !t.trim().is_empty() => t.trim().to_string(),
            Ok(_) => {
                warn!(message_id = msg.id, "empty ai response");
                return None;
            }
            Err(e) => {
                warn!(message_id = msg.id, error = %e, "ai response generation failed");
                self.health.record_failure("ai_generate", &e);
                return None;
            }
        };
        self.health.record_success("ai_generate");

        if self.cfg.cache_responses {
            self.cache
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .insert(key, text.clone());
        }
        Some(text)
    }

    /// Reply in the group, or privately to the sender when the group is
    /// read-only for us. `Ok(false)` if this message was already answered.
    pub async fn send_response(&self, msg: &Message, text: &str) -> Result<bool> {
        if self.has_responded(msg) {
            return Ok(false);
        }

        let sent = self
            .client
            .send_message(ChatId(msg.group_id), text, Some(MessageId(msg.id)))
            .await;

        match sent {
            Ok(_) => {}
            Err(Error::PermissionDenied(reason)) if msg.sender_id != 0 => {
                warn!(
                    group_id = msg.group_id,
                    %reason,
                    "cannot reply in group, sending privately"
                );
                let private = format!(
                    "Response to your message in {}:\n\n{}",
                    msg.group_name, text
                );
                self.client
                    .send_message(ChatId(msg.sender_id), &private, None)
                    .await?;
            }
            Err(e) => {
                self.health.record_failure("ai_send", &e);
                return Err(e);
            }
        }

        self.sent
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert((msg.group_id, msg.id));
        self.health.record_success("ai_send");
        info!(group_id = msg.group_id, message_id = msg.id, "ai response sent");
        Ok(true)
    }

    pub async fn generate_and_send_response(
        &self,
        msg: &Message,
        context: &[Message],
    ) -> Result<Option<String>> {
        if !self.cfg.enabled || self.has_responded(msg) {
            return Ok(None);
        }
        let Some(text) = self.generate_response(msg, context).await else {
            return Ok(None);
        };
        if self.send_response(msg, &text).await? {
            Ok(Some(text))
        } else {
            Ok(None)
        }
    }

    pub fn stats(&self) -> ResponderStats {
        ResponderStats {
            enabled: self.cfg.enabled,
            auto_respond: self.cfg.auto_respond,
            provider: self.cfg.provider.as_str().to_string(),
            model: self.cfg.model.clone(),
            cached_responses: self.cache.lock().unwrap_or_else(|e| e.into_inner()).len(),
            responses_sent: self.sent.lock().unwrap_or_else(|e| e.into_inner()).len(),
        }
    }

    pub fn clear_cache(&self) {
        self.cache.lock().unwrap_or_else(|e| e.into_inner()).clear();
        info!("ai response cache cleared");
    }
}

fn cache_key(msg: &Message) -> String {
    digest_parts(&[
        &msg.id.to_string(),
        &msg.content,
        msg.extracted_text.as_deref().unwrap_or(""),
    ])
}

fn display_sender(m: &Message) -> String {
    if m.sender_username.is_empty() {
        format!("user {}", m.sender_id)
    } else {
        format!("@{}", m.sender_username)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::MediaType;
    use crate::ports::fakes::{FakeGenerator, FakeTelegram};
    use chrono::Utc;

    fn msg(id: i64, content: &str) -> Message {
        Message {
            id,
            timestamp: Utc::now(),
            group_id: -100,
            group_name: "Jobs".into(),
            sender_id: 55,
            sender_username: "alice".into(),
            content: content.into(),
            media_type: MediaType::None,
            extracted_text: None,
            relevance_score: 1.0,
            matched_criteria: vec![],
        }
    }

    fn responder(
        cfg: AiConfig,
        gen: Arc<FakeGenerator>,
        tg: Arc<FakeTelegram>,
    ) -> AiResponder {
        AiResponder::new(cfg, gen, tg, Arc::new(HealthMonitor::new()))
    }

    fn enabled() -> AiConfig {
        AiConfig {
            enabled: true,
            api_key: "k".into(),
            ..AiConfig::default()
        }
    }

    #[tokio::test]
    async fn disabled_responder_does_nothing() {
        let gen = Arc::new(FakeGenerator::replying("hi"));
        let r = responder(AiConfig::default(), gen.clone(), Arc::new(FakeTelegram::authorized()));
        assert!(r.generate_response(&msg(1, "q"), &[]).await.is_none());
        assert_eq!(gen.calls(), 0);
    }

    #[tokio::test]
    async fn responses_are_cached_by_content() {
        let gen = Arc::new(FakeGenerator::replying("  answer "));
        let r = responder(enabled(), gen.clone(), Arc::new(FakeTelegram::authorized()));

        assert_eq!(r.generate_response(&msg(1, "q"), &[]).await.as_deref(), Some("answer"));
        assert_eq!(r.generate_response(&msg(1, "q"), &[]).await.as_deref(), Some("answer"));
        assert_eq!(gen.calls(), 1);
        assert_eq!(r.stats().cached_responses, 1);

        r.clear_cache();
        r.generate_response(&msg(1, "q"), &[]).await;
        assert_eq!(gen.calls(), 2);
    }

    #[test]
    fn template_placeholders_are_filled() {
        let cfg = AiConfig {
            prompt_template: "[{group_name}] {sender_username}: {message_content} | {extracted_text}\n{context}".into(),
            ..enabled()
        };
        let r = responder(
            cfg,
            Arc::new(FakeGenerator::replying("x")),
            Arc::new(FakeTelegram::authorized()),
        );
        let mut m = msg(1, "hello");
        m.extracted_text = Some("ocr".into());
        let prompt = r.build_prompt(&m, &[msg(0, "earlier")]);
        assert!(prompt.starts_with("[Jobs] alice: hello | ocr\n- @alice: earlier"));
    }

    #[test]
    fn default_prompt_keeps_last_five_context_messages() {
        let r = responder(
            enabled(),
            Arc::new(FakeGenerator::replying("x")),
            Arc::new(FakeTelegram::authorized()),
        );
        let ctx: Vec<Message> = (0..8).map(|i| msg(i, &format!("ctx{i}"))).collect();
        let prompt = r.build_prompt(&msg(9, "question"), &ctx);
        assert!(prompt.contains("Message: question"));
        assert!(!prompt.contains("ctx2"));
        assert!(prompt.contains("ctx3"));
        assert!(prompt.contains("ctx7"));
    }

    #[tokio::test]
    async fn replies_once_per_message() {
        let tg = Arc::new(FakeTelegram::authorized());
        let r = responder(enabled(), Arc::new(FakeGenerator::replying("sure")), tg.clone());

        let sent = r.generate_and_send_response(&msg(7, "help?"), &[]).await.unwrap();
        assert_eq!(sent.as_deref(), Some("sure"));
        assert!(r.generate_and_send_response(&msg(7, "help?"), &[]).await.unwrap().is_none());

        assert_eq!(tg.sent(), vec![(-100, "sure".to_string(), Some(7))]);
        assert_eq!(r.stats().responses_sent, 1);
    }

    #[tokio::test]
    async fn falls_back_to_private_message() {
        let tg = Arc::new(FakeTelegram::authorized());
        tg.forbidden.lock().unwrap().push(-100);
        let r = responder(enabled(), Arc::new(FakeGenerator::replying("sure")), tg.clone());

        assert!(r.send_response(&msg(7, "help?"), "sure").await.unwrap());
        let sent = tg.sent();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].0, 55);
        assert_eq!(sent[0].1, "Response to your message in Jobs:\n\nsure");
        assert_eq!(sent[0].2, None);
    }
}
