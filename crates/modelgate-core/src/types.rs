//! Canonical, format-agnostic chat types
//!
//! Both client wire formats convert to and from these. Nothing here knows
//! about field names on the wire.

use serde::{Deserialize, Serialize};

/// Message role
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

/// Where an image part's bytes come from
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ImageSource {
    Url { url: String },
    Base64 { media_type: String, data: String },
}

/// A single typed part of message content
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ContentPart {
    Text { text: String },
    Image { source: ImageSource },
}

impl ContentPart {
    pub fn text(text: impl Into<String>) -> Self {
        Self::Text { text: text.into() }
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            Self::Text { text } => Some(text),
            Self::Image { .. } => None,
        }
    }
}

/// One message of a canonical conversation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CanonicalMessage {
    pub role: Role,
    pub content: Vec<ContentPart>,
}

impl CanonicalMessage {
    pub fn text(role: Role, text: impl Into<String>) -> Self {
        Self {
            role,
            content: vec![ContentPart::text(text)],
        }
    }

    /// Concatenated text of every text part
    pub fn joined_text(&self) -> String {
        self.content
            .iter()
            .filter_map(ContentPart::as_text)
            .collect::<Vec<_>>()
            .join("")
    }
}

/// The pivot request representation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CanonicalChatRequest {
    pub model: String,
    pub messages: Vec<CanonicalMessage>,
    pub max_tokens: Option<u32>,
    pub temperature: Option<f32>,
    pub top_p: Option<f32>,
    pub stop: Vec<String>,
    pub stream: bool,
}

impl CanonicalChatRequest {
    /// Rough prompt size used to reserve token-rate capacity before the
    /// provider reports real usage (about four characters per token).
    pub fn estimated_prompt_tokens(&self) -> u32 {
        let chars: usize = self
            .messages
            .iter()
            .flat_map(|m| m.content.iter())
            .map(|p| match p {
                ContentPart::Text { text } => text.len(),
                // Flat charge for images
                ContentPart::Image { .. } => 3_000,
            })
            .sum();
        u32::try_from(chars / 4).unwrap_or(u32::MAX)
    }
}

/// Why the model stopped generating
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StopReason {
    EndTurn,
    MaxTokens,
    StopSequence,
    ContentFilter,
}

/// Token usage from a single call
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Usage {
    pub input_tokens: u32,
    pub output_tokens: u32,
}

impl Usage {
    pub fn total(&self) -> u32 {
        self.input_tokens.saturating_add(self.output_tokens)
    }
}

/// A complete, non-streamed response
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CanonicalChatResponse {
    pub id: String,
    pub model: String,
    /// Unix seconds, carried so encoding stays deterministic
    pub created: i64,
    pub content: Vec<ContentPart>,
    pub stop_reason: StopReason,
    pub usage: Usage,
}

impl CanonicalChatResponse {
    pub fn text(&self) -> String {
        self.content
            .iter()
            .filter_map(ContentPart::as_text)
            .collect::<Vec<_>>()
            .join("")
    }
}

/// One incremental step of a streamed response
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum CanonicalStreamDelta {
    /// Role announcement; always the first delta of a stream
    Start {
        id: String,
        model: String,
        created: i64,
        role: Role,
        usage: Usage,
    },
    Text { text: String },
    /// Terminal delta; nothing follows it
    Stop { stop_reason: StopReason, usage: Usage },
}

impl CanonicalStreamDelta {
    pub fn is_stop(&self) -> bool {
        matches!(self, Self::Stop { .. })
    }
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::System => write!(f, "system"),
            Self::User => write!(f, "user"),
            Self::Assistant => write!(f, "assistant"),
        }
    }
}
