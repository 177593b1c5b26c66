//! Persistence interface.
//!
//! The engine depends on these capability-level traits and nothing else;
//! any adapter that honors the tagged-error contract can back it. The
//! in-memory adapter in [`mem`] is the reference implementation and the
//! test double for the topic actor.

pub mod mem;

use crate::access::AccessMode;
use crate::error::StoreError;
use crate::types::{TopicCat, Uid};
use async_trait::async_trait;
use banter_proto::{MessageHead, SeqRange};
use serde_json::Value;
use std::sync::Arc;

/// Account lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum UserState {
    #[default]
    Ok,
    /// Tombstoned by admin action; the record remains for references.
    Suspended,
    Deleted,
}

/// A user account.
#[derive(Debug, Clone)]
pub struct User {
    pub id: Uid,
    pub created_at: u64,
    pub updated_at: u64,
    pub state: UserState,
    /// Default access handed to peers opening a p2p topic with this user.
    pub default_auth: AccessMode,
    /// Default access for anonymous strangers.
    pub default_anon: AccessMode,
    pub public: Option<Value>,
    pub tags: Vec<String>,
}

impl User {
    /// Fresh account with category defaults.
    #[must_use]
    pub fn new(id: Uid, now: u64) -> Self {
        Self {
            id,
            created_at: now,
            updated_at: now,
            state: UserState::Ok,
            default_auth: crate::access::default_auth_access(TopicCat::P2P),
            default_anon: AccessMode::empty(),
            public: None,
            tags: Vec::new(),
        }
    }
}

/// Durable per-topic state.
#[derive(Debug, Clone)]
pub struct TopicRec {
    /// Canonical routing name.
    pub name: String,
    pub cat: TopicCat,
    pub created_at: u64,
    pub updated_at: u64,
    /// Orders the topic in peer lists; bumped by publishes.
    pub touched_at: u64,
    /// Zero for topics without an owner (`me`, `fnd`, p2p).
    pub owner: Uid,
    pub access_auth: AccessMode,
    pub access_anon: AccessMode,
    pub public: Option<Value>,
    /// Highest seq assigned so far; zero when empty.
    pub last_seq: u64,
    /// Everything at or below this seq has been hard-deleted.
    pub clear_id: u64,
    pub tags: Vec<String>,
}

impl TopicRec {
    /// Fresh topic record with category defaults.
    #[must_use]
    pub fn new(name: impl Into<String>, cat: TopicCat, owner: Uid, now: u64) -> Self {
        Self {
            name: name.into(),
            cat,
            created_at: now,
            updated_at: now,
            touched_at: now,
            owner,
            access_auth: crate::access::default_auth_access(cat),
            access_anon: crate::access::default_anon_access(cat),
            public: None,
            last_seq: 0,
            clear_id: 0,
            tags: Vec::new(),
        }
    }
}

/// The join of one user to one topic.
#[derive(Debug, Clone)]
pub struct Subscription {
    pub user: Uid,
    /// Canonical topic routing name.
    pub topic: String,
    pub created_at: u64,
    pub updated_at: u64,
    pub mode_want: AccessMode,
    pub mode_given: AccessMode,
    /// Highest seq reported read by the user. `read <= recv <= last_seq`.
    pub read_seq: u64,
    /// Highest seq reported delivered to the user.
    pub recv_seq: u64,
    /// Everything at or below is soft-cleared for this user.
    pub clear_id: u64,
    /// Seq ranges soft-deleted for this user only.
    pub del_ranges: Vec<SeqRange>,
    /// Per-user annotation, owner-only.
    pub private: Option<Value>,
}

impl Subscription {
    #[must_use]
    pub fn new(user: Uid, topic: impl Into<String>, now: u64) -> Self {
        Self {
            user,
            topic: topic.into(),
            created_at: now,
            updated_at: now,
            mode_want: AccessMode::empty(),
            mode_given: AccessMode::empty(),
            read_seq: 0,
            recv_seq: 0,
            clear_id: 0,
            del_ranges: Vec::new(),
            private: None,
        }
    }

    /// Effective mode: `want ∧ given`.
    #[must_use]
    pub fn effective(&self) -> AccessMode {
        self.mode_want & self.mode_given
    }

    /// Whether `seq` is soft-deleted for this user.
    #[must_use]
    pub fn is_soft_deleted(&self, seq: u64) -> bool {
        seq <= self.clear_id || self.del_ranges.iter().any(|r| r.contains(seq))
    }
}

/// A persisted message.
#[derive(Debug, Clone)]
pub struct StoredMessage {
    /// Canonical topic routing name.
    pub topic: String,
    /// Contiguous within the topic, starting at 1.
    pub seq: u64,
    pub from: Uid,
    /// Server-assigned creation time, ms since epoch.
    pub at: u64,
    pub head: MessageHead,
    /// `None` once tombstoned.
    pub content: Option<Value>,
    /// Hard-delete transaction id; set on tombstones.
    pub del_id: Option<u64>,
}

impl StoredMessage {
    #[must_use]
    pub fn is_tombstone(&self) -> bool {
        self.del_id.is_some()
    }
}

/// Content change accompanying a header update.
#[derive(Debug, Clone)]
pub enum ContentUpdate {
    /// Leave the stored content untouched.
    Keep,
    /// Null the content (unsend, hard delete).
    Clear,
    /// Replace the content (edit).
    Replace(Value),
}

/// User records.
#[async_trait]
pub trait UserStore: Send + Sync {
    async fn create_user(&self, user: &User) -> Result<(), StoreError>;
    async fn get_user(&self, id: Uid) -> Result<User, StoreError>;
    async fn update_user(&self, user: &User) -> Result<(), StoreError>;
    /// Soft delete tombstones; hard delete removes the record.
    async fn delete_user(&self, id: Uid, hard: bool) -> Result<(), StoreError>;
    async fn find_users_by_tag(&self, tag: &str) -> Result<Vec<User>, StoreError>;
}

/// Topic records.
#[async_trait]
pub trait TopicStore: Send + Sync {
    async fn create_topic(&self, topic: &TopicRec) -> Result<(), StoreError>;
    async fn get_topic(&self, name: &str) -> Result<TopicRec, StoreError>;
    async fn update_topic(&self, topic: &TopicRec) -> Result<(), StoreError>;
    async fn delete_topic(&self, name: &str) -> Result<(), StoreError>;
    async fn topic_owner_change(&self, name: &str, new_owner: Uid) -> Result<(), StoreError>;
}

/// Subscription records.
#[async_trait]
pub trait SubStore: Send + Sync {
    /// Insert or replace the (topic, user) record.
    async fn upsert_sub(&self, sub: &Subscription) -> Result<(), StoreError>;
    async fn get_sub(&self, topic: &str, user: Uid) -> Result<Subscription, StoreError>;
    async fn subs_for_user(&self, user: Uid) -> Result<Vec<Subscription>, StoreError>;
    async fn subs_for_topic(&self, topic: &str) -> Result<Vec<Subscription>, StoreError>;
    async fn delete_sub(&self, topic: &str, user: Uid) -> Result<(), StoreError>;
}

/// Message log.
#[async_trait]
pub trait MessageStore: Send + Sync {
    /// Persist a message, returning the seq it was stored under.
    ///
    /// The caller pre-assigns `msg.seq`; the store rejects anything other
    /// than the next contiguous seq with `Duplicate`.
    async fn save_message(&self, msg: &StoredMessage) -> Result<u64, StoreError>;

    /// Messages with `lo <= seq < hi`, ascending, at most `limit`.
    async fn message_range(
        &self,
        topic: &str,
        lo: u64,
        hi: u64,
        limit: usize,
    ) -> Result<Vec<StoredMessage>, StoreError>;

    async fn get_message(&self, topic: &str, seq: u64) -> Result<StoredMessage, StoreError>;

    /// Delete ranges. Hard deletion tombstones for everyone under `del_id`;
    /// soft deletion records the ranges against `for_user` only.
    async fn delete_messages(
        &self,
        topic: &str,
        ranges: &[SeqRange],
        hard: bool,
        del_id: u64,
        for_user: Option<Uid>,
    ) -> Result<(), StoreError>;

    /// Replace a message's header and optionally its content in place.
    async fn update_message_header(
        &self,
        topic: &str,
        seq: u64,
        head: MessageHead,
        content: ContentUpdate,
    ) -> Result<(), StoreError>;
}

/// The full persistence surface the engine consumes.
pub trait Store: UserStore + TopicStore + SubStore + MessageStore {}

impl<T: UserStore + TopicStore + SubStore + MessageStore> Store for T {}

/// Shared handle to a store implementation.
pub type SharedStore = Arc<dyn Store>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_subscription_effective_mode() {
        let mut sub = Subscription::new(Uid::from_raw(1), "grpx", 0);
        sub.mode_want = "JRWPO".parse().unwrap();
        sub.mode_given = "JRW".parse().unwrap();
        assert_eq!(sub.effective(), "JRW".parse().unwrap());
    }

    #[test]
    fn test_subscription_soft_delete_check() {
        let mut sub = Subscription::new(Uid::from_raw(1), "grpx", 0);
        sub.clear_id = 2;
        sub.del_ranges = vec![SeqRange::span(5, 8), SeqRange::one(10)];

        assert!(sub.is_soft_deleted(1));
        assert!(sub.is_soft_deleted(2));
        assert!(!sub.is_soft_deleted(3));
        assert!(sub.is_soft_deleted(5) && sub.is_soft_deleted(7));
        assert!(!sub.is_soft_deleted(8));
        assert!(sub.is_soft_deleted(10));
    }

    #[test]
    fn test_topic_rec_defaults() {
        let rec = TopicRec::new("grpx", TopicCat::Grp, Uid::from_raw(1), 42);
        assert_eq!(rec.last_seq, 0);
        assert!(rec.access_auth.is_writer());
        assert_eq!(rec.access_anon, AccessMode::empty());
    }
}
