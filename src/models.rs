use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// A monitored public channel together with its collection watermark.
#[derive(Debug, Clone)]
pub struct Channel {
    pub id: i64,
    pub name: String,
    pub telegram_id: i64,
    pub username: Option<String>,
    pub invite_link: Option<String>,
    pub active: bool,
    pub created_at: DateTime<Utc>,
    /// Watermark: publication time of the newest message already collected.
    pub last_processed_at: Option<DateTime<Utc>>,
}

/// Operator input for registering a channel.
#[derive(Debug, Clone)]
pub struct NewChannel {
    pub name: String,
    pub telegram_id: i64,
    pub username: Option<String>,
    pub invite_link: Option<String>,
}

/// A message as yielded by the external source, before it is stored.
#[derive(Debug, Clone)]
pub struct RawMessage {
    pub message_id: i64,
    pub published_at: DateTime<Utc>,
    pub text: Option<String>,
    pub media: Option<MediaKind>,
}

impl RawMessage {
    /// Media-only and service messages carry no usable text.
    pub fn has_text(&self) -> bool {
        self.text.as_deref().is_some_and(|t| !t.trim().is_empty())
    }
}

/// A stored message with its analysis fields.
#[derive(Debug, Clone)]
pub struct Message {
    pub id: i64,
    pub channel_id: i64,
    pub message_id: i64,
    pub published_at: DateTime<Utc>,
    pub text: Option<String>,
    pub media: Option<MediaKind>,
    pub is_risk: bool,
    pub sentiment: Option<Sentiment>,
    pub keywords: Option<Vec<String>>,
}

/// The three analysis fields, always written together.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Analysis {
    pub is_risk: bool,
    pub sentiment: Sentiment,
    pub keywords: Option<Vec<String>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Sentiment {
    Positive,
    Neutral,
    Negative,
}

impl Sentiment {
    pub fn as_str(&self) -> &'static str {
        match self {
            Sentiment::Positive => "positive",
            Sentiment::Neutral => "neutral",
            Sentiment::Negative => "negative",
        }
    }
}

impl fmt::Display for Sentiment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Sentiment {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "positive" => Ok(Sentiment::Positive),
            "neutral" => Ok(Sentiment::Neutral),
            "negative" => Ok(Sentiment::Negative),
            other => Err(format!("unknown sentiment: {}", other)),
        }
    }
}

/// Kind of media attached to a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MediaKind {
    Photo,
    Video,
    Audio,
    Voice,
    Document,
    Sticker,
    Animation,
    Poll,
    Location,
    Contact,
    WebPage,
    Unknown,
}

impl MediaKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            MediaKind::Photo => "photo",
            MediaKind::Video => "video",
            MediaKind::Audio => "audio",
            MediaKind::Voice => "voice",
            MediaKind::Document => "document",
            MediaKind::Sticker => "sticker",
            MediaKind::Animation => "animation",
            MediaKind::Poll => "poll",
            MediaKind::Location => "location",
            MediaKind::Contact => "contact",
            MediaKind::WebPage => "web_page",
            MediaKind::Unknown => "unknown",
        }
    }

    /// Parse a stored tag. Anything unrecognized maps to `Unknown`.
    pub fn parse(tag: &str) -> Self {
        match tag {
            "photo" => MediaKind::Photo,
            "video" => MediaKind::Video,
            "audio" => MediaKind::Audio,
            "voice" => MediaKind::Voice,
            "document" => MediaKind::Document,
            "sticker" => MediaKind::Sticker,
            "animation" => MediaKind::Animation,
            "poll" => MediaKind::Poll,
            "location" => MediaKind::Location,
            "contact" => MediaKind::Contact,
            "web_page" => MediaKind::WebPage,
            _ => MediaKind::Unknown,
        }
    }

    /// Classify a document by its MIME type.
    pub fn from_mime(mime: Option<&str>) -> Self {
        match mime {
            Some("image/gif") => MediaKind::Animation,
            Some("audio/ogg") => MediaKind::Voice,
            Some(m) if m.starts_with("video/") => MediaKind::Video,
            Some(m) if m.starts_with("audio/") => MediaKind::Audio,
            Some(m) if m.starts_with("image/") => MediaKind::Photo,
            _ => MediaKind::Document,
        }
    }
}

impl fmt::Display for MediaKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
