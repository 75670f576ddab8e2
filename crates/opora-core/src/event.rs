use serde::{Deserialize, Serialize};

use crate::types::GroupId;

/// Inbound event as delivered by the transport adapter (POST /events).
///
/// The adapter sends raw sender identifiers; the ingest path hashes them
/// before anything is persisted.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum InboundEvent {
    Message(InboundMessage),
    Reaction(InboundReaction),
    ContactRemoved { sender: String },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InboundMessage {
    pub group_id: GroupId,
    pub message_id: String,
    /// Epoch milliseconds.
    pub ts: i64,
    pub sender: String,
    #[serde(default)]
    pub sender_name: Option<String>,
    #[serde(default)]
    pub text: String,
    /// Paths relative to the images root, already written by the adapter.
    #[serde(default)]
    pub image_paths: Vec<String>,
    #[serde(default)]
    pub reply_to_id: Option<String>,
    /// True for a 1:1 chat with the bot (admin DM flow) rather than a group.
    #[serde(default)]
    pub is_direct: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InboundReaction {
    pub group_id: GroupId,
    /// Timestamp (epoch ms) of the message the reaction targets.
    pub target_ts: i64,
    pub target_author: String,
    pub sender: String,
    pub emoji: String,
    #[serde(default)]
    pub is_remove: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn message_event_deserializes() {
        let json = r#"{
            "type": "message",
            "group_id": "g1",
            "message_id": "m1",
            "ts": 1000,
            "sender": "380501112233@c.us",
            "text": "How do I reset X?"
        }"#;
        let ev: InboundEvent = serde_json::from_str(json).unwrap();
        match ev {
            InboundEvent::Message(m) => {
                assert_eq!(m.group_id.as_str(), "g1");
                assert_eq!(m.ts, 1000);
                assert!(m.image_paths.is_empty());
                assert!(!m.is_direct);
            }
            other => panic!("expected message, got {:?}", other),
        }
    }

    #[test]
    fn reaction_event_deserializes() {
        let json = r#"{
            "type": "reaction",
            "group_id": "g1",
            "target_ts": 1000,
            "target_author": "abc",
            "sender": "def",
            "emoji": "👍"
        }"#;
        let ev: InboundEvent = serde_json::from_str(json).unwrap();
        match ev {
            InboundEvent::Reaction(r) => {
                assert_eq!(r.emoji, "👍");
                assert!(!r.is_remove);
            }
            other => panic!("expected reaction, got {:?}", other),
        }
    }
}
