//! Process-wide topic registry.
//!
//! The hub maps canonical topic names to live actor handles, spawns
//! actors on demand, and prunes them as they drain. It also runs the
//! presence dispatcher that carries [`PresenceEvent`]s from topic actors
//! to the live `me` topics of the addressed users.

use crate::error::EngineError;
use crate::message::EditPolicy;
use crate::presence::PresenceEvent;
use crate::store::SharedStore;
use crate::topic::{self, TopicCommand, TopicHandle, TopicInit, TopicState};
use crate::types::{TopicAddr, Uid};
use dashmap::DashMap;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// Engine-wide tunables, shared by the hub, topic actors, and sessions.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Maximum number of live topic actors.
    pub max_topics: usize,
    /// Maximum distinct users per topic.
    pub max_subscribers_per_topic: usize,
    /// Maximum topics one session may join.
    pub max_subscriptions_per_session: usize,
    /// Topic inbox depth.
    pub topic_inbox_depth: usize,
    /// Per-session outbound queue depth.
    pub session_queue_depth: usize,
    /// How long a topic waits on a session's outbound queue before
    /// declaring the session slow.
    pub send_deadline_ms: u64,
    /// How long a session waits on a full topic inbox before answering
    /// the client with "server too busy".
    pub forward_deadline_ms: u64,
    /// Unload a topic this long after its last session detaches.
    pub topic_idle_timeout_ms: u64,
    /// Minimum interval between accepted typing notifications per user.
    pub kp_min_interval_ms: u64,
    /// Deliver typing notifications to the sender's other sessions.
    pub kp_to_own_sessions: bool,
    /// Hard cap on one `get data` batch.
    pub history_batch_limit: usize,
    pub edit_policy: EditPolicy,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_topics: 10_000,
            max_subscribers_per_topic: 128,
            max_subscriptions_per_session: 100,
            topic_inbox_depth: 256,
            session_queue_depth: 64,
            send_deadline_ms: 100,
            forward_deadline_ms: 250,
            topic_idle_timeout_ms: 15_000,
            kp_min_interval_ms: 2_000,
            kp_to_own_sessions: false,
            history_batch_limit: 1_024,
            edit_policy: EditPolicy::default(),
        }
    }
}

/// The topic registry and spawner.
pub struct Hub {
    topics: DashMap<String, TopicHandle>,
    store: SharedStore,
    config: Arc<EngineConfig>,
    presence_tx: mpsc::UnboundedSender<PresenceEvent>,
}

impl Hub {
    /// Create the hub and start its presence dispatcher.
    #[must_use]
    pub fn new(store: SharedStore, config: EngineConfig) -> Arc<Self> {
        let (presence_tx, presence_rx) = mpsc::unbounded_channel();
        let hub = Arc::new(Self {
            topics: DashMap::new(),
            store,
            config: Arc::new(config),
            presence_tx,
        });
        tokio::spawn(presence_dispatch(Arc::downgrade(&hub), presence_rx));
        hub
    }

    #[must_use]
    pub fn config(&self) -> Arc<EngineConfig> {
        self.config.clone()
    }

    #[must_use]
    pub fn store(&self) -> SharedStore {
        self.store.clone()
    }

    /// Number of live topic actors.
    #[must_use]
    pub fn topic_count(&self) -> usize {
        self.topics.len()
    }

    /// Look up a live topic without spawning it.
    #[must_use]
    pub fn get_live(&self, routing: &str) -> Option<TopicHandle> {
        self.topics
            .get(routing)
            .map(|h| h.clone())
            .filter(|h| !h.is_gone())
    }

    /// Resolve a topic handle, spawning the actor when needed, and block
    /// until it reports `Running`.
    ///
    /// `create_owner` is set when the caller is creating a group topic.
    ///
    /// # Errors
    ///
    /// `NotFound` when the topic does not exist and cannot be created,
    /// `Overloaded` at the topic cap, `Unavailable` when a dying actor
    /// cannot be replaced yet.
    pub async fn get_or_spawn(
        self: &Arc<Self>,
        addr: &TopicAddr,
        create_owner: Option<Uid>,
    ) -> Result<TopicHandle, EngineError> {
        eprintln!("DEBUG: get_or_spawn entered");
        let handle = {
            match self.topics.entry(addr.routing.clone()) {
                dashmap::mapref::entry::Entry::Occupied(mut e) => {
                    if e.get().is_gone() {
                        let h = self.spawn_actor(addr, create_owner);
                        e.insert(h.clone());
                        h
                    } else {
                        e.get().clone()
                    }
                }
                dashmap::mapref::entry::Entry::Vacant(e) => {
                    if self.topics.len() >= self.config.max_topics {
                        warn!(topic = %addr.routing, "Topic cap reached");
                        return Err(EngineError::Overloaded);
                    }
                    let h = self.spawn_actor(addr, create_owner);
                    e.insert(h.clone());
                    h
                }
            }
        };

        eprintln!("DEBUG: about to wait_ready");
        handle.wait_ready().await?;
        eprintln!("DEBUG: wait_ready done");
        Ok(handle)
    }

    fn spawn_actor(self: &Arc<Self>, addr: &TopicAddr, create_owner: Option<Uid>) -> TopicHandle {
        debug!(topic = %addr.routing, "Spawning topic actor");
        let handle = topic::spawn(TopicInit {
            routing: addr.routing.clone(),
            cat: addr.cat,
            create_owner,
            store: self.store.clone(),
            presence_tx: self.presence_tx.clone(),
            config: self.config.clone(),
        });
        self.watch_for_gone(handle.clone());
        handle
    }

    /// Deregister the handle once its actor reports `Gone` (idle unload,
    /// delete, or panic).
    fn watch_for_gone(self: &Arc<Self>, handle: TopicHandle) {
        let hub = Arc::downgrade(self);
        tokio::spawn(async move {
            let mut state = handle.state_watch();
            loop {
                if matches!(*state.borrow(), TopicState::Gone) {
                    break;
                }
                if state.changed().await.is_err() {
                    break;
                }
            }
            if let Some(hub) = hub.upgrade() {
                hub.topics
                    .remove_if(&handle.name, |_, h| h.same_actor(&handle));
                debug!(topic = %handle.name, "Topic deregistered");
            }
        });
    }

    /// Drain every live topic in parallel and wait for them to go.
    pub async fn shutdown(&self) {
        let handles: Vec<TopicHandle> = self.topics.iter().map(|h| h.clone()).collect();
        info!(topics = handles.len(), "Hub shutting down");

        for handle in &handles {
            let _ = handle.try_send(TopicCommand::Drain);
        }

        for handle in handles {
            let mut state = handle.state_watch();
            let waited = tokio::time::timeout(Duration::from_secs(5), async {
                loop {
                    if matches!(*state.borrow(), TopicState::Gone) {
                        return;
                    }
                    if state.changed().await.is_err() {
                        return;
                    }
                }
            })
            .await;
            if waited.is_err() {
                warn!(topic = %handle.name, "Topic did not drain in time");
            }
            self.topics.remove(&handle.name);
        }
    }
}

/// Carry presence events to the live `me` topics of the addressed users.
/// Events for offline users are dropped; their `me` topic rebuilds its
/// view from the store when it next loads.
async fn presence_dispatch(
    hub: Weak<Hub>,
    mut rx: mpsc::UnboundedReceiver<PresenceEvent>,
) {
    while let Some(ev) = rx.recv().await {
        let Some(hub) = hub.upgrade() else { break };
        for uid in ev.to.clone() {
            let me_routing = format!("usr{}", uid.as_hex());
            // The event's source never hears about itself.
            if me_routing == ev.src {
                continue;
            }
            if let Some(handle) = hub.get_live(&me_routing) {
                let mut event = ev.clone();
                event.to = vec![uid];
                if !handle.try_send(TopicCommand::Presence(event)) {
                    debug!(user = %uid, "Presence event dropped, inbox full");
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::mem::MemStore;
    use crate::store::{User, UserStore};
    use crate::types::{now_ms, resolve_topic_name};

    async fn hub_with_user(uid: Uid) -> Arc<Hub> {
        let store = Arc::new(MemStore::new());
        store
            .create_user(&User::new(uid, now_ms()))
            .await
            .unwrap();
        Hub::new(store, EngineConfig::default())
    }

    #[tokio::test]
    async fn test_get_or_spawn_me_topic() {
        let uid = Uid::from_raw(0xA1);
        let hub = hub_with_user(uid).await;
        let addr = resolve_topic_name("me", uid).unwrap();

        let handle = hub.get_or_spawn(&addr, None).await.unwrap();
        assert_eq!(handle.name, "usra1");
        assert_eq!(hub.topic_count(), 1);

        // Second resolve reuses the live actor.
        let again = hub.get_or_spawn(&addr, None).await.unwrap();
        assert!(handle.same_actor(&again));
        assert_eq!(hub.topic_count(), 1);
    }

    #[tokio::test]
    async fn test_unknown_group_is_not_created() {
        let uid = Uid::from_raw(0xA1);
        let hub = hub_with_user(uid).await;
        let addr = resolve_topic_name("grpmissing", uid).unwrap();

        let err = hub.get_or_spawn(&addr, None).await.unwrap_err();
        assert_eq!(err, EngineError::NotFound);
    }

    #[tokio::test]
    async fn test_gone_topic_is_deregistered() {
        let uid = Uid::from_raw(0xA1);
        let hub = hub_with_user(uid).await;
        let addr = resolve_topic_name("me", uid).unwrap();

        let handle = hub.get_or_spawn(&addr, None).await.unwrap();
        let _ = handle.try_send(TopicCommand::Drain);

        let mut state = handle.state_watch();
        tokio::time::timeout(Duration::from_secs(1), async {
            loop {
                if matches!(*state.borrow(), TopicState::Gone) {
                    break;
                }
                state.changed().await.unwrap();
            }
        })
        .await
        .unwrap();

        // The monitor prunes the entry; a new resolve spawns afresh.
        tokio::time::sleep(Duration::from_millis(50)).await;
        let fresh = hub.get_or_spawn(&addr, None).await.unwrap();
        assert!(!fresh.same_actor(&handle));
    }

    #[tokio::test]
    async fn test_shutdown_drains_all() {
        let uid = Uid::from_raw(0xA1);
        let hub = hub_with_user(uid).await;
        let me = resolve_topic_name("me", uid).unwrap();
        let fnd = resolve_topic_name("fnd", uid).unwrap();
        hub.get_or_spawn(&me, None).await.unwrap();
        hub.get_or_spawn(&fnd, None).await.unwrap();
        assert_eq!(hub.topic_count(), 2);

        hub.shutdown().await;
        assert_eq!(hub.topic_count(), 0);
    }
}
