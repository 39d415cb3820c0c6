use serde::{Deserialize, Serialize};

use crate::conversation::ConversationId;
use crate::identity::Identity;

/// The backend-agnostic persisted shape of one encrypted message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EnvelopeRecord {
    pub sender_id: Identity,
    pub recipient_id: Identity,
    /// Base64 `nonce || sealed box`. The backend never sees plaintext.
    pub message: String,
    /// Store-assigned, epoch milliseconds.
    pub timestamp: u64,
    #[serde(default)]
    pub read: bool,
}

/// A stored [`EnvelopeRecord`] together with its backend-assigned id.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Envelope {
    pub id: String,
    pub sender_id: Identity,
    pub recipient_id: Identity,
    #[serde(rename = "message")]
    pub ciphertext: String,
    #[serde(rename = "timestamp")]
    pub created_at: u64,
    pub read: bool,
}

impl Envelope {
    pub fn from_record(id: String, record: EnvelopeRecord) -> Self {
        Self {
            id,
            sender_id: record.sender_id,
            recipient_id: record.recipient_id,
            ciphertext: record.message,
            created_at: record.timestamp,
            read: record.read,
        }
    }

    pub fn conversation_id(&self) -> ConversationId {
        ConversationId::new(&self.sender_id, &self.recipient_id)
    }

    /// Whether `participant` is the sender or the recipient.
    pub fn involves(&self, participant: &Identity) -> bool {
        &self.sender_id == participant || &self.recipient_id == participant
    }

    /// The other party from `me`'s point of view.
    pub fn counterparty(&self, me: &Identity) -> &Identity {
        if &self.sender_id == me {
            &self.recipient_id
        } else {
            &self.sender_id
        }
    }

    pub fn field(&self, field: EnvelopeField) -> &Identity {
        match field {
            EnvelopeField::SenderId => &self.sender_id,
            EnvelopeField::RecipientId => &self.recipient_id,
        }
    }
}

/// Participant columns a backend can filter on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EnvelopeField {
    SenderId,
    RecipientId,
}

impl EnvelopeField {
    /// Column / document key used by the persisted shape.
    pub fn column(self) -> &'static str {
        match self {
            Self::SenderId => "sender_id",
            Self::RecipientId => "recipient_id",
        }
    }
}
