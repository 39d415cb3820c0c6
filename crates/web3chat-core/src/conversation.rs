use serde::{Deserialize, Serialize};

use crate::identity::{canonicalize, Identity};

/// Joins the two escaped participants of a [`ConversationId`].
pub const SEPARATOR: char = '_';

/// Order-independent key for a pair of participants.
///
/// A partition/query key only. Stores still filter on the participant
/// fields, never on this id alone.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ConversationId(String);

impl ConversationId {
    pub fn new(a: &Identity, b: &Identity) -> Self {
        conversation_id(a.as_str(), b.as_str())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Whether `id` is one of the two participants.
    pub fn includes(&self, id: &Identity) -> bool {
        self.0
            .split(SEPARATOR)
            .any(|part| part == escape(id.as_str()))
    }
}

impl std::fmt::Display for ConversationId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Canonicalise both ids, sort them and join with [`SEPARATOR`].
///
/// `%` and the separator are percent-escaped inside each component, so
/// distinct pairs never collide on the joined form.
pub fn conversation_id(a: &str, b: &str) -> ConversationId {
    let a = canonicalize(a);
    let b = canonicalize(b);
    let (first, second) = if a <= b { (a, b) } else { (b, a) };
    ConversationId(format!(
        "{}{SEPARATOR}{}",
        escape(first.as_str()),
        escape(second.as_str())
    ))
}

fn escape(part: &str) -> String {
    let mut out = String::with_capacity(part.len());
    for c in part.chars() {
        match c {
            '%' => out.push_str("%25"),
            SEPARATOR => out.push_str("%5F"),
            other => out.push(other),
        }
    }
    out
}
