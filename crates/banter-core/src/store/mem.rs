//! In-memory store adapter.
//!
//! Backs unit and integration tests of the engine and serves as the
//! server default when no durable adapter is configured. Safe for
//! concurrent use; per-topic logs are guarded by their `DashMap` shard so
//! seq contiguity holds under concurrent writers.

use super::{
    ContentUpdate, StoredMessage, Subscription, TopicRec, User, UserState,
};
use crate::error::StoreError;
use crate::types::Uid;
use async_trait::async_trait;
use banter_proto::{MessageHead, SeqRange};
use dashmap::DashMap;
use std::sync::atomic::{AtomicBool, Ordering};

/// In-memory persistence.
#[derive(Debug, Default)]
pub struct MemStore {
    users: DashMap<Uid, User>,
    topics: DashMap<String, TopicRec>,
    subs: DashMap<(String, Uid), Subscription>,
    logs: DashMap<String, Vec<StoredMessage>>,
    fail_next_save: AtomicBool,
}

impl MemStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `save_message` fail with an internal error.
    ///
    /// Test hook for exercising the publish rollback path.
    pub fn inject_save_failure(&self) {
        self.fail_next_save.store(true, Ordering::SeqCst);
    }
}

#[async_trait]
impl super::UserStore for MemStore {
    async fn create_user(&self, user: &User) -> Result<(), StoreError> {
        match self.users.entry(user.id) {
            dashmap::mapref::entry::Entry::Occupied(_) => Err(StoreError::Duplicate),
            dashmap::mapref::entry::Entry::Vacant(e) => {
                e.insert(user.clone());
                Ok(())
            }
        }
    }

    async fn get_user(&self, id: Uid) -> Result<User, StoreError> {
        self.users
            .get(&id)
            .map(|u| u.clone())
            .ok_or(StoreError::NotFound)
    }

    async fn update_user(&self, user: &User) -> Result<(), StoreError> {
        let mut entry = self.users.get_mut(&user.id).ok_or(StoreError::NotFound)?;
        *entry = user.clone();
        Ok(())
    }

    async fn delete_user(&self, id: Uid, hard: bool) -> Result<(), StoreError> {
        if hard {
            self.users.remove(&id).ok_or(StoreError::NotFound)?;
        } else {
            let mut entry = self.users.get_mut(&id).ok_or(StoreError::NotFound)?;
            entry.state = UserState::Deleted;
        }
        Ok(())
    }

    async fn find_users_by_tag(&self, tag: &str) -> Result<Vec<User>, StoreError> {
        Ok(self
            .users
            .iter()
            .filter(|u| u.state == UserState::Ok && u.tags.iter().any(|t| t == tag))
            .map(|u| u.clone())
            .collect())
    }
}

#[async_trait]
impl super::TopicStore for MemStore {
    async fn create_topic(&self, topic: &TopicRec) -> Result<(), StoreError> {
        match self.topics.entry(topic.name.clone()) {
            dashmap::mapref::entry::Entry::Occupied(_) => Err(StoreError::Duplicate),
            dashmap::mapref::entry::Entry::Vacant(e) => {
                e.insert(topic.clone());
                Ok(())
            }
        }
    }

    async fn get_topic(&self, name: &str) -> Result<TopicRec, StoreError> {
        self.topics
            .get(name)
            .map(|t| t.clone())
            .ok_or(StoreError::NotFound)
    }

    async fn update_topic(&self, topic: &TopicRec) -> Result<(), StoreError> {
        let mut entry = self
            .topics
            .get_mut(&topic.name)
            .ok_or(StoreError::NotFound)?;
        *entry = topic.clone();
        Ok(())
    }

    async fn delete_topic(&self, name: &str) -> Result<(), StoreError> {
        self.topics.remove(name).ok_or(StoreError::NotFound)?;
        self.logs.remove(name);
        self.subs.retain(|(t, _), _| t != name);
        Ok(())
    }

    async fn topic_owner_change(&self, name: &str, new_owner: Uid) -> Result<(), StoreError> {
        let mut entry = self.topics.get_mut(name).ok_or(StoreError::NotFound)?;
        entry.owner = new_owner;
        Ok(())
    }
}

#[async_trait]
impl super::SubStore for MemStore {
    async fn upsert_sub(&self, sub: &Subscription) -> Result<(), StoreError> {
        self.subs
            .insert((sub.topic.clone(), sub.user), sub.clone());
        Ok(())
    }

    async fn get_sub(&self, topic: &str, user: Uid) -> Result<Subscription, StoreError> {
        self.subs
            .get(&(topic.to_string(), user))
            .map(|s| s.clone())
            .ok_or(StoreError::NotFound)
    }

    async fn subs_for_user(&self, user: Uid) -> Result<Vec<Subscription>, StoreError> {
        Ok(self
            .subs
            .iter()
            .filter(|s| s.user == user)
            .map(|s| s.clone())
            .collect())
    }

    async fn subs_for_topic(&self, topic: &str) -> Result<Vec<Subscription>, StoreError> {
        Ok(self
            .subs
            .iter()
            .filter(|s| s.topic == topic)
            .map(|s| s.clone())
            .collect())
    }

    async fn delete_sub(&self, topic: &str, user: Uid) -> Result<(), StoreError> {
        self.subs
            .remove(&(topic.to_string(), user))
            .ok_or(StoreError::NotFound)?;
        Ok(())
    }
}

#[async_trait]
impl super::MessageStore for MemStore {
    async fn save_message(&self, msg: &StoredMessage) -> Result<u64, StoreError> {
        if self.fail_next_save.swap(false, Ordering::SeqCst) {
            return Err(StoreError::Internal("injected failure".into()));
        }

        let mut log = self.logs.entry(msg.topic.clone()).or_default();
        let expected = log.len() as u64 + 1;
        if msg.seq != expected {
            return Err(StoreError::Duplicate);
        }
        log.push(msg.clone());
        Ok(msg.seq)
    }

    async fn message_range(
        &self,
        topic: &str,
        lo: u64,
        hi: u64,
        limit: usize,
    ) -> Result<Vec<StoredMessage>, StoreError> {
        let Some(log) = self.logs.get(topic) else {
            return Ok(Vec::new());
        };
        let lo = lo.max(1);
        if hi <= lo {
            return Ok(Vec::new());
        }
        let start = (lo - 1).min(log.len() as u64) as usize;
        let end = (hi - 1).min(log.len() as u64) as usize;
        Ok(log[start..end].iter().take(limit).cloned().collect())
    }

    async fn get_message(&self, topic: &str, seq: u64) -> Result<StoredMessage, StoreError> {
        if seq == 0 {
            return Err(StoreError::InvalidArg("seq must be positive".into()));
        }
        self.logs
            .get(topic)
            .and_then(|log| log.get(seq as usize - 1).cloned())
            .ok_or(StoreError::NotFound)
    }

    async fn delete_messages(
        &self,
        topic: &str,
        ranges: &[SeqRange],
        hard: bool,
        del_id: u64,
        for_user: Option<Uid>,
    ) -> Result<(), StoreError> {
        if hard {
            let mut log = self.logs.get_mut(topic).ok_or(StoreError::NotFound)?;
            for msg in log.iter_mut() {
                if ranges.iter().any(|r| r.contains(msg.seq)) && !msg.is_tombstone() {
                    msg.content = None;
                    msg.del_id = Some(del_id);
                    msg.head = MessageHead {
                        deleted: Some(true),
                        ..Default::default()
                    };
                }
            }
            Ok(())
        } else {
            let user = for_user
                .ok_or_else(|| StoreError::InvalidArg("soft delete needs a user".into()))?;
            let mut sub = self
                .subs
                .get_mut(&(topic.to_string(), user))
                .ok_or(StoreError::NotFound)?;
            sub.del_ranges.extend_from_slice(ranges);
            Ok(())
        }
    }

    async fn update_message_header(
        &self,
        topic: &str,
        seq: u64,
        head: MessageHead,
        content: ContentUpdate,
    ) -> Result<(), StoreError> {
        let mut log = self.logs.get_mut(topic).ok_or(StoreError::NotFound)?;
        let msg = log
            .get_mut(seq.wrapping_sub(1) as usize)
            .ok_or(StoreError::NotFound)?;
        msg.head = head;
        match content {
            ContentUpdate::Keep => {}
            ContentUpdate::Clear => msg.content = None,
            ContentUpdate::Replace(v) => msg.content = Some(v),
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::super::{MessageStore, SubStore, TopicStore, UserStore};
    use super::*;
    use crate::types::TopicCat;
    use proptest::prelude::*;
    use serde_json::json;

    fn msg(topic: &str, seq: u64) -> StoredMessage {
        StoredMessage {
            topic: topic.into(),
            seq,
            from: Uid::from_raw(1),
            at: seq,
            head: MessageHead::default(),
            content: Some(json!({"n": seq})),
            del_id: None,
        }
    }

    #[tokio::test]
    async fn test_user_crud() {
        let store = MemStore::new();
        let user = User::new(Uid::from_raw(7), 1);

        store.create_user(&user).await.unwrap();
        assert!(matches!(
            store.create_user(&user).await,
            Err(StoreError::Duplicate)
        ));
        assert_eq!(store.get_user(user.id).await.unwrap().id, user.id);

        store.delete_user(user.id, false).await.unwrap();
        assert_eq!(
            store.get_user(user.id).await.unwrap().state,
            UserState::Deleted
        );

        store.delete_user(user.id, true).await.unwrap();
        assert!(matches!(
            store.get_user(user.id).await,
            Err(StoreError::NotFound)
        ));
    }

    #[tokio::test]
    async fn test_find_by_tag_skips_deleted() {
        let store = MemStore::new();
        let mut alice = User::new(Uid::from_raw(1), 0);
        alice.tags = vec!["travel".into()];
        let mut bob = User::new(Uid::from_raw(2), 0);
        bob.tags = vec!["travel".into()];
        bob.state = UserState::Deleted;

        store.create_user(&alice).await.unwrap();
        store.create_user(&bob).await.unwrap();

        let found = store.find_users_by_tag("travel").await.unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].id, alice.id);
    }

    #[tokio::test]
    async fn test_save_requires_contiguous_seq() {
        let store = MemStore::new();
        assert_eq!(store.save_message(&msg("grpx", 1)).await.unwrap(), 1);
        assert_eq!(store.save_message(&msg("grpx", 2)).await.unwrap(), 2);
        assert!(matches!(
            store.save_message(&msg("grpx", 2)).await,
            Err(StoreError::Duplicate)
        ));
        assert!(matches!(
            store.save_message(&msg("grpx", 4)).await,
            Err(StoreError::Duplicate)
        ));
    }

    #[tokio::test]
    async fn test_injected_save_failure() {
        let store = MemStore::new();
        store.inject_save_failure();
        assert!(matches!(
            store.save_message(&msg("grpx", 1)).await,
            Err(StoreError::Internal(_))
        ));
        // Next save succeeds; the log never saw the failed seq.
        assert_eq!(store.save_message(&msg("grpx", 1)).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_message_range_bounds() {
        let store = MemStore::new();
        for seq in 1..=5 {
            store.save_message(&msg("grpx", seq)).await.unwrap();
        }

        let got = store.message_range("grpx", 2, 5, 100).await.unwrap();
        assert_eq!(got.iter().map(|m| m.seq).collect::<Vec<_>>(), vec![2, 3, 4]);

        let got = store.message_range("grpx", 0, 100, 2).await.unwrap();
        assert_eq!(got.iter().map(|m| m.seq).collect::<Vec<_>>(), vec![1, 2]);

        assert!(store.message_range("grpx", 4, 4, 10).await.unwrap().is_empty());
        assert!(store.message_range("nope", 1, 10, 10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_hard_delete_tombstones() {
        let store = MemStore::new();
        for seq in 1..=3 {
            store.save_message(&msg("grpx", seq)).await.unwrap();
        }

        store
            .delete_messages("grpx", &[SeqRange::span(1, 3)], true, 1, None)
            .await
            .unwrap();

        let m1 = store.get_message("grpx", 1).await.unwrap();
        assert!(m1.is_tombstone());
        assert!(m1.content.is_none());
        assert_eq!(m1.head.deleted, Some(true));

        let m3 = store.get_message("grpx", 3).await.unwrap();
        assert!(!m3.is_tombstone());
        assert!(m3.content.is_some());
    }

    #[tokio::test]
    async fn test_soft_delete_records_on_sub() {
        let store = MemStore::new();
        let uid = Uid::from_raw(9);
        store
            .upsert_sub(&Subscription::new(uid, "grpx", 0))
            .await
            .unwrap();

        store
            .delete_messages("grpx", &[SeqRange::one(4)], false, 0, Some(uid))
            .await
            .unwrap();

        let sub = store.get_sub("grpx", uid).await.unwrap();
        assert!(sub.is_soft_deleted(4));
        assert!(!sub.is_soft_deleted(5));
    }

    #[tokio::test]
    async fn test_topic_crud_and_owner_change() {
        let store = MemStore::new();
        let rec = TopicRec::new("grpx", TopicCat::Grp, Uid::from_raw(1), 0);

        store.create_topic(&rec).await.unwrap();
        assert!(matches!(
            store.create_topic(&rec).await,
            Err(StoreError::Duplicate)
        ));

        store
            .topic_owner_change("grpx", Uid::from_raw(2))
            .await
            .unwrap();
        assert_eq!(
            store.get_topic("grpx").await.unwrap().owner,
            Uid::from_raw(2)
        );

        store.delete_topic("grpx").await.unwrap();
        assert!(matches!(
            store.get_topic("grpx").await,
            Err(StoreError::NotFound)
        ));
    }

    proptest! {
        /// Sequential saves produce the contiguous run 1..=n regardless of
        /// how many competing out-of-order attempts are interleaved.
        #[test]
        fn prop_seq_contiguous(attempts in proptest::collection::vec(1u64..20, 1..40)) {
            let rt = tokio::runtime::Builder::new_current_thread().build().unwrap();
            rt.block_on(async {
                let store = MemStore::new();
                let mut next = 1u64;
                for seq in attempts {
                    let res = store.save_message(&msg("grpx", seq)).await;
                    if seq == next {
                        prop_assert_eq!(res.unwrap(), seq);
                        next += 1;
                    } else {
                        prop_assert!(res.is_err());
                    }
                }
                let log = store.message_range("grpx", 1, u64::MAX, usize::MAX).await.unwrap();
                let seqs: Vec<u64> = log.iter().map(|m| m.seq).collect();
                let expect: Vec<u64> = (1..next).collect();
                prop_assert_eq!(seqs, expect);
                Ok(())
            })?;
        }
    }
}
