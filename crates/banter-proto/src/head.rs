//! Message headers.
//!
//! Well-known header keys get typed fields; anything else rides along in
//! the pass-through bag so unknown keys survive a round trip unchanged.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Typed message header.
///
/// Attached to published messages and mutated in place by edits, unsends,
/// reactions, and hard deletes. A `None` field is absent on the wire.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MessageHead {
    /// Server timestamp of the most recent edit, ms since epoch.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub edited_at: Option<u64>,

    /// Number of edits applied so far.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub edit_count: Option<u32>,

    /// Set when the sender retracted the message; content is nulled.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub unsent: Option<bool>,

    /// Reaction token -> ids of users who toggled it on.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reactions: Option<BTreeMap<String, Vec<String>>>,

    /// Seq of the message this one replies to, as a string reference.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reply: Option<String>,

    /// Thread root reference.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub thread: Option<String>,

    /// Set on tombstones left behind by a hard delete.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub deleted: Option<bool>,

    /// Self-destruct timestamp, ms since epoch.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expires: Option<u64>,

    /// Unknown keys, preserved as-is.
    #[serde(flatten)]
    pub extra: BTreeMap<String, serde_json::Value>,
}

impl MessageHead {
    /// True when no field is set and the bag is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.edited_at.is_none()
            && self.edit_count.is_none()
            && self.unsent.is_none()
            && self.reactions.is_none()
            && self.reply.is_none()
            && self.thread.is_none()
            && self.deleted.is_none()
            && self.expires.is_none()
            && self.extra.is_empty()
    }

    /// Toggle `user` under `token` in the reactions map.
    ///
    /// Returns `true` if the reaction is now present for the user.
    pub fn toggle_reaction(&mut self, token: &str, user: &str) -> bool {
        let reactions = self.reactions.get_or_insert_with(BTreeMap::new);
        let users = reactions.entry(token.to_string()).or_default();
        if let Some(pos) = users.iter().position(|u| u == user) {
            users.remove(pos);
            if users.is_empty() {
                reactions.remove(token);
            }
            if reactions.is_empty() {
                self.reactions = None;
            }
            false
        } else {
            users.push(user.to_string());
            true
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_head_empty() {
        assert!(MessageHead::default().is_empty());

        let head = MessageHead {
            unsent: Some(true),
            ..Default::default()
        };
        assert!(!head.is_empty());
    }

    #[test]
    fn test_head_unknown_keys_roundtrip() {
        let raw = json!({"edited_at": 12345, "mime": "text/x-drafty"});
        let head: MessageHead = serde_json::from_value(raw.clone()).unwrap();

        assert_eq!(head.edited_at, Some(12345));
        assert_eq!(head.extra.get("mime"), Some(&json!("text/x-drafty")));
        assert_eq!(serde_json::to_value(&head).unwrap(), raw);
    }

    #[test]
    fn test_reaction_toggle() {
        let mut head = MessageHead::default();

        assert!(head.toggle_reaction("+1", "usrA"));
        assert!(head.toggle_reaction("+1", "usrB"));
        let users = &head.reactions.as_ref().unwrap()["+1"];
        assert_eq!(users, &vec!["usrA".to_string(), "usrB".to_string()]);

        // Second toggle removes.
        assert!(!head.toggle_reaction("+1", "usrA"));
        assert!(!head.toggle_reaction("+1", "usrB"));
        assert!(head.reactions.is_none());
    }
}
