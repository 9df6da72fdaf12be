//! Core data types shared across the pipeline
//!
//! Inbound types (`ContentEvent`, `InboundSignal`) match the JSON lines the
//! source adapter reads. Durable types (`ContentRecord`, `EngagementRecord`,
//! `Comment`) match the tables under `/sql/`.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Kind of attachment carried by a content event
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MediaKind {
    Photo,
    Video,
}

impl MediaKind {
    /// Sub-directory under the media root where fetched files of this kind land
    pub fn dir_name(&self) -> &'static str {
        match self {
            MediaKind::Photo => "photos",
            MediaKind::Video => "videos",
        }
    }
}

/// Pointer to an attachment that still has to be fetched
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MediaReference {
    pub kind: MediaKind,
    /// Remote URL (`http://`, `https://`) or local path (`file://` or bare)
    pub source_url: String,
}

impl MediaReference {
    pub fn photo(source_url: impl Into<String>) -> Self {
        Self {
            kind: MediaKind::Photo,
            source_url: source_url.into(),
        }
    }

    pub fn video(source_url: impl Into<String>) -> Self {
        Self {
            kind: MediaKind::Video,
            source_url: source_url.into(),
        }
    }
}

/// One raw message received from the broadcast source
///
/// Events sharing a `group_key` are parts of one album; events without one
/// are standalone posts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContentEvent {
    #[serde(default)]
    pub group_key: Option<String>,
    /// Per-channel message ordinal assigned by the source
    pub sequence_id: i64,
    pub author_channel: String,
    #[serde(default)]
    pub body_text: String,
    #[serde(default)]
    pub media: Vec<MediaReference>,
    #[serde(default = "Utc::now")]
    pub received_at: DateTime<Utc>,
}

impl ContentEvent {
    pub fn is_grouped(&self) -> bool {
        self.group_key.is_some()
    }

    /// Stable identity used to spot redelivered events
    pub fn identity(&self) -> EventIdentity {
        EventIdentity {
            author_channel: self.author_channel.clone(),
            sequence_id: self.sequence_id,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct EventIdentity {
    pub author_channel: String,
    pub sequence_id: i64,
}

/// One line of the inbound JSONL stream
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum InboundSignal {
    Content(ContentEvent),
    View { subject_id: i64, actor_id: i64 },
}

/// Content record ready to be inserted (id and timestamps assigned by the store)
#[derive(Debug, Clone, PartialEq)]
pub struct NewContentRecord {
    pub group_key: Option<String>,
    pub author_channel: String,
    pub source_message_id: i64,
    pub title: String,
    pub text: String,
    pub media_urls: Vec<String>,
}

/// Durable, user-visible post
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ContentRecord {
    pub id: i64,
    pub group_key: Option<String>,
    pub author_channel: String,
    pub source_message_id: i64,
    pub title: String,
    pub text: String,
    pub media_urls: Vec<String>,
    pub approved: bool,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EngagementRecord {
    pub id: i64,
    pub subject_id: i64,
    pub actor_id: i64,
    pub occurred_at: DateTime<Utc>,
}

/// Result of `EngagementDeduplicator::record_view`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ViewOutcome {
    pub recorded: bool,
    pub total_count: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Comment {
    pub id: i64,
    pub subject_id: i64,
    pub actor_id: i64,
    pub parent_id: Option<i64>,
    pub text: String,
    pub created_at: DateTime<Utc>,
}

/// Read-side counters for one subject, computed at query time
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct SubjectStats {
    pub likes_count: i64,
    pub comment_count: i64,
    pub viewers_count: i64,
    pub is_liked_by_viewer: bool,
}

/// First `max_chars` characters of `text` (character-based, never splits a code point)
pub fn derive_title(text: &str, max_chars: usize) -> String {
    text.chars().take(max_chars).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_derive_title_truncates_on_chars() {
        assert_eq!(derive_title("Hello", 50), "Hello");
        assert_eq!(derive_title("abcdef", 3), "abc");
        // Multi-byte text must not be cut mid code point
        assert_eq!(derive_title("Привет мир", 6), "Привет");
        assert_eq!(derive_title("", 50), "");
    }

    #[test]
    fn test_parse_content_signal() {
        let line = r#"{"type":"content","group_key":"g1","sequence_id":7,"author_channel":"fashion","body_text":"Hello","media":[{"kind":"photo","source_url":"https://cdn/p1.jpg"}]}"#;
        let signal: InboundSignal = serde_json::from_str(line).unwrap();

        match signal {
            InboundSignal::Content(event) => {
                assert_eq!(event.group_key.as_deref(), Some("g1"));
                assert_eq!(event.sequence_id, 7);
                assert_eq!(event.media, vec![MediaReference::photo("https://cdn/p1.jpg")]);
                assert!(event.is_grouped());
            }
            other => panic!("expected content signal, got {:?}", other),
        }
    }

    #[test]
    fn test_parse_standalone_defaults() {
        let line = r#"{"type":"content","sequence_id":1,"author_channel":"news"}"#;
        let signal: InboundSignal = serde_json::from_str(line).unwrap();

        let InboundSignal::Content(event) = signal else {
            panic!("expected content signal");
        };
        assert!(!event.is_grouped());
        assert!(event.body_text.is_empty());
        assert!(event.media.is_empty());
    }

    #[test]
    fn test_parse_view_signal() {
        let line = r#"{"type":"view","subject_id":42,"actor_id":7}"#;
        let signal: InboundSignal = serde_json::from_str(line).unwrap();
        assert_eq!(
            signal,
            InboundSignal::View {
                subject_id: 42,
                actor_id: 7
            }
        );
    }
}
