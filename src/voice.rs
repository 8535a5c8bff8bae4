//! Glue between a voice pipeline transcript and the gateway prompt.

use serde::{Deserialize, Serialize};

pub const VOICE_STT_TAG: &str = "[TALKY VOICE STT]";

/// Mark a prompt as transcribed speech so the agent answers for the ear.
pub fn format_voice_message(text: &str) -> String {
    format!("{VOICE_STT_TAG}: {text}")
}

/// One message of the pipeline's conversation context.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TranscriptTurn {
    pub role: String,
    pub content: TurnContent,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum TurnContent {
    Text(String),
    Parts(Vec<ContentPart>),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContentPart {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
}

impl TranscriptTurn {
    pub fn user(text: impl Into<String>) -> Self {
        Self {
            role: "user".into(),
            content: TurnContent::Text(text.into()),
        }
    }

    pub fn assistant(text: impl Into<String>) -> Self {
        Self {
            role: "assistant".into(),
            content: TurnContent::Text(text.into()),
        }
    }

    /// Plain content, or the first text part of structured content.
    pub fn text(&self) -> Option<&str> {
        match &self.content {
            TurnContent::Text(s) => Some(s.as_str()),
            TurnContent::Parts(parts) => parts
                .iter()
                .find(|p| p.kind == "text")
                .and_then(|p| p.text.as_deref()),
        }
    }
}

/// Text of the most recent user turn, if it has any.
///
/// Only the last user turn is considered; an empty one yields `None` rather
/// than reaching further back.
pub fn latest_user_utterance(transcript: &[TranscriptTurn]) -> Option<String> {
    transcript
        .iter()
        .rev()
        .find(|turn| turn.role == "user")
        .and_then(TranscriptTurn::text)
        .filter(|text| !text.trim().is_empty())
        .map(str::to_string)
}
