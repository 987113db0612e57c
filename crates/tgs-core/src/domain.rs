use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Telegram chat id (numeric).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct ChatId(pub i64);

/// Telegram message id (numeric).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct MessageId(pub i64);

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MediaType {
    #[default]
    None,
    Photo,
    Image,
    Video,
    Audio,
    Document,
}

impl MediaType {
    pub fn as_str(self) -> &'static str {
        match self {
            MediaType::None => "none",
            MediaType::Photo => "photo",
            MediaType::Image => "image",
            MediaType::Video => "video",
            MediaType::Audio => "audio",
            MediaType::Document => "document",
        }
    }

    /// Media that goes through OCR.
    pub fn is_image(self) -> bool {
        matches!(self, MediaType::Photo | MediaType::Image)
    }
}

/// Normalized message record.
///
/// Built by the processor, enriched by the relevance filter
/// (`matched_criteria`, `relevance_score`), immutable once stored.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub id: i64,
    pub timestamp: DateTime<Utc>,
    pub group_id: i64,
    pub group_name: String,
    pub sender_id: i64,
    pub sender_username: String,
    pub content: String,
    #[serde(default)]
    pub media_type: MediaType,
    #[serde(default)]
    pub extracted_text: Option<String>,
    #[serde(default)]
    pub relevance_score: f64,
    #[serde(default)]
    pub matched_criteria: Vec<String>,
}

impl Message {
    /// Text the relevance filter looks at: content plus OCR/placeholder text.
    pub fn searchable_text(&self) -> String {
        match self.extracted_text.as_deref() {
            Some(extra) if !extra.is_empty() => format!("{} {}", self.content, extra),
            _ => self.content.clone(),
        }
    }
}

/// A message as persisted on disk: the record plus the time it was stored.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct StoredMessage {
    #[serde(flatten)]
    pub message: Message,
    pub stored_at: DateTime<Utc>,
}

/// A group or channel the account can read.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Group {
    pub id: i64,
    pub title: String,
    pub username: Option<String>,
    pub member_count: i64,
    pub is_private: bool,
    pub access_hash: i64,
    pub is_channel: bool,
    pub is_megagroup: bool,
    #[serde(default)]
    pub last_scanned: Option<DateTime<Utc>>,
}

impl Group {
    /// Case-insensitive match against the title or the username.
    pub fn name_matches(&self, pattern: &str) -> bool {
        let pattern = pattern.to_lowercase();
        self.title.to_lowercase().contains(&pattern)
            || self
                .username
                .as_deref()
                .map(|u| u.to_lowercase().contains(&pattern))
                .unwrap_or(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn message(content: &str, extracted: Option<&str>) -> Message {
        Message {
            id: 1,
            timestamp: Utc::now(),
            group_id: 2,
            group_name: "g".to_string(),
            sender_id: 3,
            sender_username: "u".to_string(),
            content: content.to_string(),
            media_type: MediaType::None,
            extracted_text: extracted.map(str::to_string),
            relevance_score: 0.0,
            matched_criteria: vec![],
        }
    }

    #[test]
    fn searchable_text_appends_extracted_text() {
        assert_eq!(message("hi", None).searchable_text(), "hi");
        assert_eq!(message("hi", Some("ocr")).searchable_text(), "hi ocr");
    }

    #[test]
    fn stored_message_flattens_on_disk() {
        let stored = StoredMessage {
            message: message("hi", None),
            stored_at: Utc::now(),
        };
        let v = serde_json::to_value(&stored).unwrap();
        assert_eq!(v["content"], "hi");
        assert_eq!(v["media_type"], "none");
        assert!(v.get("stored_at").is_some());
    }

    #[test]
    fn group_name_match_checks_title_and_username() {
        let g = Group {
            id: 1,
            title: "Python Developers".to_string(),
            username: Some("pythondev".to_string()),
            member_count: 10,
            is_private: false,
            access_hash: 0,
            is_channel: false,
            is_megagroup: true,
            last_scanned: None,
        };
        assert!(g.name_matches("PYTHON"));
        assert!(g.name_matches("dev"));
        assert!(!g.name_matches("rust"));
    }
}
