//! Transcript normalization.
//!
//! The `messages` column has been written in three shapes over time:
//! - a JSON array of `{author, content}` objects
//! - a text column holding that same array serialized as JSON
//! - a text column in the line format `user:-...` / `bot:-...`
//!
//! `normalize` tries each shape in that order and never fails. Anything it
//! cannot make sense of becomes an empty transcript.

use serde::{Deserialize, Serialize};
use serde_json::Value;

const USER_PREFIX: &str = "user:-";
const BOT_PREFIX: &str = "bot:-";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Author {
    User,
    Bot,
}

impl Author {
    fn from_label(label: &str) -> Option<Self> {
        match label {
            "user" => Some(Author::User),
            "bot" => Some(Author::Bot),
            _ => None,
        }
    }
}

/// One message in a transcript
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatTurn {
    pub author: Author,
    pub content: String,
}

impl ChatTurn {
    pub fn new(author: Author, content: impl Into<String>) -> Self {
        Self {
            author,
            content: content.into(),
        }
    }
}

/// Recover an ordered transcript from a persisted `messages` value.
pub fn normalize(raw: &Value) -> Vec<ChatTurn> {
    structured(raw)
        .or_else(|| embedded_json(raw))
        .or_else(|| legacy_text(raw))
        .unwrap_or_default()
}

/// Already-structured array where every element is a valid turn.
fn structured(raw: &Value) -> Option<Vec<ChatTurn>> {
    raw.as_array()?.iter().map(turn_from_object).collect()
}

fn turn_from_object(value: &Value) -> Option<ChatTurn> {
    let obj = value.as_object()?;
    let author = obj.get("author").and_then(|v| v.as_str()).and_then(Author::from_label)?;
    let content = match obj.get("content")? {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        other => other.to_string(),
    };
    Some(ChatTurn::new(author, content))
}

/// Text holding a JSON-encoded turn array. Parse errors fall through silently.
fn embedded_json(raw: &Value) -> Option<Vec<ChatTurn>> {
    let text = raw.as_str()?;
    let parsed: Value = serde_json::from_str(text).ok()?;
    structured(&parsed)
}

/// Line format: a turn starts on any line beginning with `user:-` or `bot:-`
/// and runs until the next such line, so multi-line content stays together.
fn legacy_text(raw: &Value) -> Option<Vec<ChatTurn>> {
    let text = raw.as_str()?.trim();

    let mut blocks: Vec<String> = Vec::new();
    for line in text.split_inclusive('\n') {
        let starts_turn = line.starts_with(USER_PREFIX) || line.starts_with(BOT_PREFIX);
        match blocks.last_mut() {
            Some(current) if !starts_turn => current.push_str(line),
            _ => blocks.push(line.to_string()),
        }
    }

    let turns = blocks
        .iter()
        .filter_map(|block| {
            let block = block.trim();
            if let Some(rest) = block.strip_prefix(USER_PREFIX) {
                Some(ChatTurn::new(Author::User, rest.trim()))
            } else {
                block
                    .strip_prefix(BOT_PREFIX)
                    .map(|rest| ChatTurn::new(Author::Bot, rest.trim()))
            }
        })
        .collect();

    Some(turns)
}
