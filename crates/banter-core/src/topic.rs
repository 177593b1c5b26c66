//! The topic actor.
//!
//! One task per live topic, exclusive owner of the topic's subscription
//! table, seq counter, and presence set. All mutations arrive through a
//! bounded command channel and are handled one at a time; the only
//! suspension points are the inbox, per-session outbound queues, and
//! persistence calls.

use crate::access::{default_auth_access, AccessMode};
use crate::auth::AuthLevel;
use crate::error::{codes, EngineError};
use crate::hub::EngineConfig;
use crate::message::{
    advance_clear, apply_edit, apply_unsend, for_delivery, normalize_ranges,
};
use crate::presence::{presentable_name, PeerTable, PresenceEvent, PresenceWhat};
use crate::session::SessionHandle;
use crate::store::{SharedStore, StoredMessage, Subscription, TopicRec};
use crate::types::{now_ms, p2p_pair, TopicCat, Uid};
use banter_proto::{
    AcsDesc, ClientDel, ClientGet, ClientLeave, ClientMsg, ClientNote, ClientPub, ClientSet,
    ClientSub, DataQuery, DelMeta, DelWhat, GetQuery, MessageHead, ServerData, ServerInfo,
    ServerMeta, ServerMsg, ServerPres, SetDesc, TopicDesc, TopicSub,
};
use serde_json::{json, Value};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info, warn};

/// Messages returned by `get data` when the query does not set a limit.
const DEFAULT_HISTORY_LIMIT: usize = 128;

/// Topic lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TopicState {
    Loading,
    Running,
    Draining,
    Gone,
}

/// A client request forwarded by a session.
#[derive(Debug)]
pub struct ClientReq {
    pub msg: ClientMsg,
    pub sess: SessionHandle,
    pub uid: Uid,
    pub auth: AuthLevel,
    /// The topic name as the client wrote it, echoed in replies.
    pub client_name: String,
    /// Fired with the join outcome so the session can keep its
    /// subscription bookkeeping truthful. Only set on `sub`.
    pub joined: Option<tokio::sync::oneshot::Sender<bool>>,
}

/// Commands accepted by a topic actor.
#[derive(Debug)]
pub enum TopicCommand {
    Client(Box<ClientReq>),
    /// Presence notification routed to a `me` topic.
    Presence(PresenceEvent),
    /// A session disappeared without a `leave`.
    SessionGone { sid: String, uid: Uid },
    /// Hub-initiated drain.
    Drain,
}

/// Cloneable handle to a live topic actor.
#[derive(Debug, Clone)]
pub struct TopicHandle {
    pub name: String,
    pub cat: TopicCat,
    tx: mpsc::Sender<TopicCommand>,
    state: watch::Receiver<TopicState>,
}

impl TopicHandle {
    /// Forward a command, waiting up to `deadline` for inbox space.
    ///
    /// # Errors
    ///
    /// `Unavailable` when the topic is draining or gone, `Overloaded`
    /// when the inbox stayed full past the deadline.
    pub async fn send(&self, cmd: TopicCommand, deadline: Duration) -> Result<(), EngineError> {
        match *self.state.borrow() {
            TopicState::Draining | TopicState::Gone => return Err(EngineError::Unavailable),
            _ => {}
        }
        match tokio::time::timeout(deadline, self.tx.send(cmd)).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(_)) => Err(EngineError::Unavailable),
            Err(_) => Err(EngineError::Overloaded),
        }
    }

    /// Best-effort send for signals that may be dropped under pressure.
    pub fn try_send(&self, cmd: TopicCommand) -> bool {
        self.tx.try_send(cmd).is_ok()
    }

    /// Wait until the actor reports `Running`.
    ///
    /// # Errors
    ///
    /// `NotFound` when the load failed, `Unavailable` when the actor died.
    pub async fn wait_ready(&self) -> Result<(), EngineError> {
        let mut state = self.state.clone();
        loop {
            match *state.borrow() {
                TopicState::Running => return Ok(()),
                TopicState::Gone => return Err(EngineError::NotFound),
                TopicState::Draining => return Err(EngineError::Unavailable),
                TopicState::Loading => {}
            }
            if state.changed().await.is_err() {
                return Err(EngineError::Unavailable);
            }
        }
    }

    #[must_use]
    pub fn is_gone(&self) -> bool {
        matches!(*self.state.borrow(), TopicState::Gone)
    }

    /// Whether two handles refer to the same actor instance.
    #[must_use]
    pub fn same_actor(&self, other: &TopicHandle) -> bool {
        self.tx.same_channel(&other.tx)
    }

    /// Observe lifecycle transitions; used by the hub to deregister.
    #[must_use]
    pub fn state_watch(&self) -> watch::Receiver<TopicState> {
        self.state.clone()
    }
}

/// Everything needed to bring a topic actor up.
pub(crate) struct TopicInit {
    pub routing: String,
    pub cat: TopicCat,
    /// Owner for a group being created by this spawn.
    pub create_owner: Option<Uid>,
    pub store: SharedStore,
    pub presence_tx: mpsc::UnboundedSender<PresenceEvent>,
    pub config: Arc<EngineConfig>,
}

/// Spawn the actor task and return its handle immediately; the handle
/// reports `Loading` until the store round-trips complete.
pub(crate) fn spawn(init: TopicInit) -> TopicHandle {
    let (tx, rx) = mpsc::channel(init.config.topic_inbox_depth);
    let (state_tx, state_rx) = watch::channel(TopicState::Loading);
    let handle = TopicHandle {
        name: init.routing.clone(),
        cat: init.cat,
        tx,
        state: state_rx,
    };
    tokio::spawn(run(init, rx, state_tx));
    handle
}

async fn run(
    init: TopicInit,
    mut rx: mpsc::Receiver<TopicCommand>,
    state_tx: watch::Sender<TopicState>,
) {
    eprintln!("DEBUG: run started");
    let name = init.routing.clone();
    let mut topic = match Topic::load(init).await {
        Ok(t) => {
            eprintln!("DEBUG: load ok");
            t
        }
        Err(e) => {
            warn!(topic = %name, error = %e, "Topic load failed");
            let _ = state_tx.send(TopicState::Gone);
            // Anything already queued gets a definitive answer.
            while let Ok(cmd) = rx.try_recv() {
                if let TopicCommand::Client(req) = cmd {
                    let ctrl = ServerMsg::ctrl(
                        req.msg.id(),
                        req.client_name.clone(),
                        e.code(),
                        e.text(),
                        now_ms(),
                    );
                    let _ = req.sess.try_queue(ctrl);
                }
            }
            return;
        }
    };

    let _ = state_tx.send(TopicState::Running);
    info!(topic = %topic.name, cat = %topic.cat, "Topic running");

    let idle_check = Duration::from_millis(topic.config.topic_idle_timeout_ms.max(1000) / 4);
    let mut idle = tokio::time::interval(idle_check);
    idle.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    let mut idle_since = tokio::time::Instant::now();

    loop {
        tokio::select! {
            cmd = rx.recv() => {
                match cmd {
                    Some(TopicCommand::Drain) | None => break,
                    Some(cmd) => {
                        idle_since = tokio::time::Instant::now();
                        if topic.handle(cmd).await == Flow::Shutdown {
                            break;
                        }
                    }
                }
            }
            _ = idle.tick() => {
                if topic.sessions.is_empty()
                    && idle_since.elapsed()
                        >= Duration::from_millis(topic.config.topic_idle_timeout_ms)
                {
                    debug!(topic = %topic.name, "Idle timeout, unloading");
                    break;
                }
                topic.sweep(now_ms());
            }
        }
    }

    let _ = state_tx.send(TopicState::Draining);
    topic.drain(&mut rx).await;
    let _ = state_tx.send(TopicState::Gone);
    info!(topic = %topic.name, "Topic gone");
}

#[derive(Debug, PartialEq, Eq)]
enum Flow {
    Continue,
    Shutdown,
}

/// Request context split off the envelope.
struct ReqCtx {
    sess: SessionHandle,
    uid: Uid,
    auth: AuthLevel,
    id: String,
    client_name: String,
}

struct UserCtx {
    sub: Subscription,
    /// Cached public descriptor of the user.
    public: Option<Value>,
    /// Attached sessions of this user.
    online: usize,
    /// Cursor or range changes pending a store flush.
    dirty: bool,
}

struct SessionCtx {
    handle: SessionHandle,
    uid: Uid,
}

struct Topic {
    name: String,
    cat: TopicCat,
    rec: TopicRec,
    rec_dirty: bool,
    per_user: HashMap<Uid, UserCtx>,
    sessions: HashMap<String, SessionCtx>,
    /// Peer online states; populated for `me` topics only.
    peers: PeerTable,
    /// Last accepted typing note per user.
    kp_last: HashMap<Uid, u64>,
    store: SharedStore,
    presence_tx: mpsc::UnboundedSender<PresenceEvent>,
    config: Arc<EngineConfig>,
}

impl Topic {
    async fn load(init: TopicInit) -> Result<Topic, EngineError> {
        let TopicInit {
            routing,
            cat,
            create_owner,
            store,
            presence_tx,
            config,
        } = init;
        let now = now_ms();

        let rec = match store.get_topic(&routing).await {
            Ok(rec) => rec,
            Err(crate::error::StoreError::NotFound) => {
                Self::create_rec(&routing, cat, create_owner, &*store, now).await?
            }
            Err(e) => {
                error!(topic = %routing, error = %e, "Topic load failed");
                return Err(EngineError::Internal);
            }
        };

        let mut per_user = HashMap::new();
        for sub in store
            .subs_for_topic(&routing)
            .await
            .map_err(|_| EngineError::Internal)?
        {
            let public = store.get_user(sub.user).await.ok().and_then(|u| u.public);
            per_user.insert(
                sub.user,
                UserCtx {
                    sub,
                    public,
                    online: 0,
                    dirty: false,
                },
            );
        }

        let mut peers = PeerTable::new();
        if cat == TopicCat::Me {
            // Seed the peer table with everything the owner subscribes to;
            // online states fill in as events arrive.
            if let Ok(subs) = store.subs_for_user(rec.owner).await {
                for sub in subs {
                    if sub.topic != routing {
                        peers.set_online(presentable_name(&sub.topic, rec.owner), false, now);
                    }
                }
            }
        }

        Ok(Topic {
            name: routing,
            cat,
            rec,
            rec_dirty: false,
            per_user,
            sessions: HashMap::new(),
            peers,
            kp_last: HashMap::new(),
            store,
            presence_tx,
            config,
        })
    }

    /// Create the durable record for a topic being referenced into
    /// existence: `me`/`fnd` on first touch, p2p on first subscribe,
    /// groups only when spawned with a creating owner.
    async fn create_rec(
        routing: &str,
        cat: TopicCat,
        create_owner: Option<Uid>,
        store: &dyn crate::store::Store,
        now: u64,
    ) -> Result<TopicRec, EngineError> {
        let rec = match cat {
            TopicCat::Me | TopicCat::Fnd => {
                let hex = &routing[3..];
                let owner = Uid::from_hex(hex).ok_or(EngineError::NotFound)?;
                // The account must exist before its topics do.
                store
                    .get_user(owner)
                    .await
                    .map_err(|_| EngineError::NotFound)?;
                TopicRec::new(routing, cat, owner, now)
            }
            TopicCat::P2P => {
                let (a, b) = p2p_pair(routing).ok_or(EngineError::NotFound)?;
                let user_a = store.get_user(a).await.map_err(|_| EngineError::NotFound)?;
                let user_b = store.get_user(b).await.map_err(|_| EngineError::NotFound)?;
                let rec = TopicRec::new(routing, cat, Uid::ZERO, now);

                // Mirror subscriptions: each side's grant is set by the
                // other side's default access.
                let mut sub_a = Subscription::new(a, routing, now);
                sub_a.mode_want = default_auth_access(TopicCat::P2P);
                sub_a.mode_given = user_b.default_auth & default_auth_access(TopicCat::P2P);
                let mut sub_b = Subscription::new(b, routing, now);
                sub_b.mode_want = default_auth_access(TopicCat::P2P);
                sub_b.mode_given = user_a.default_auth & default_auth_access(TopicCat::P2P);

                store
                    .create_topic(&rec)
                    .await
                    .map_err(|_| EngineError::Internal)?;
                store
                    .upsert_sub(&sub_a)
                    .await
                    .map_err(|_| EngineError::Internal)?;
                store
                    .upsert_sub(&sub_b)
                    .await
                    .map_err(|_| EngineError::Internal)?;
                return Ok(rec);
            }
            TopicCat::Grp => {
                let owner = create_owner.ok_or(EngineError::NotFound)?;
                TopicRec::new(routing, cat, owner, now)
            }
        };
        store
            .create_topic(&rec)
            .await
            .map_err(|_| EngineError::Internal)?;
        Ok(rec)
    }

    async fn handle(&mut self, cmd: TopicCommand) -> Flow {
        match cmd {
            TopicCommand::Client(req) => self.handle_client(*req).await,
            TopicCommand::Presence(ev) => {
                self.handle_presence(ev).await;
                Flow::Continue
            }
            TopicCommand::SessionGone { sid, uid } => {
                self.detach(&sid, uid).await;
                Flow::Continue
            }
            TopicCommand::Drain => Flow::Shutdown,
        }
    }

    async fn handle_client(&mut self, req: ClientReq) -> Flow {
        let ctx = ReqCtx {
            sess: req.sess,
            uid: req.uid,
            auth: req.auth,
            id: req.msg.id().to_string(),
            client_name: req.client_name,
        };
        match req.msg {
            ClientMsg::Sub(m) => {
                let ok = self.join(ctx, m).await;
                if let Some(tx) = req.joined {
                    let _ = tx.send(ok);
                }
            }
            ClientMsg::Leave(m) => self.leave(ctx, m).await,
            ClientMsg::Pub(m) => self.publish(ctx, m).await,
            ClientMsg::Get(m) => self.get(ctx, m).await,
            ClientMsg::Set(m) => self.set(ctx, m).await,
            ClientMsg::Del(m) => return self.del(ctx, m).await,
            ClientMsg::Note(m) => self.note(ctx, m).await,
            // hi/acc/login never reach a topic.
            _ => self.ctrl(&ctx, codes::BAD_REQUEST, "malformed").await,
        }
        Flow::Continue
    }

    // ---- join / leave ----------------------------------------------------

    /// Returns whether the session ended up attached.
    async fn join(&mut self, ctx: ReqCtx, msg: ClientSub) -> bool {
        if self.sessions.contains_key(ctx.sess.sid()) {
            self.ctrl(&ctx, codes::NOT_MODIFIED, "already subscribed").await;
            return true;
        }

        let requested: Option<AccessMode> = match msg.mode.as_deref() {
            Some(s) => match s.parse() {
                Ok(m) => Some(m),
                Err(_) => {
                    self.ctrl(&ctx, codes::UNPROCESSABLE, "invalid mode").await;
                    return false;
                }
            },
            None => None,
        };

        let now = now_ms();
        let is_new_user = !self.per_user.contains_key(&ctx.uid);

        if is_new_user {
            // Not in memory; maybe on disk (p2p mirrors, dormant subs).
            match self.store.get_sub(&self.name, ctx.uid).await {
                Ok(sub) => {
                    let public = self
                        .store
                        .get_user(ctx.uid)
                        .await
                        .ok()
                        .and_then(|u| u.public);
                    self.per_user.insert(
                        ctx.uid,
                        UserCtx {
                            sub,
                            public,
                            online: 0,
                            dirty: false,
                        },
                    );
                }
                Err(crate::error::StoreError::NotFound) => {
                    if self.per_user.len() >= self.config.max_subscribers_per_topic {
                        self.ctrl(&ctx, codes::UNPROCESSABLE, "too many subscribers")
                            .await;
                        return false;
                    }
                    if let Err(e) = self.create_sub(&ctx, requested, now).await {
                        self.ctrl(&ctx, e.code(), e.text()).await;
                        return false;
                    }
                }
                Err(e) => {
                    error!(topic = %self.name, error = %e, "Subscription lookup failed");
                    self.ctrl(&ctx, codes::INTERNAL, "internal error").await;
                    return false;
                }
            }
        }

        // Re-negotiate `want` when the join asks for a different mode.
        if let Some(want) = requested {
            let uc = self.per_user.get_mut(&ctx.uid).expect("just inserted");
            if uc.sub.mode_want != want {
                uc.sub.mode_want = want;
                uc.sub.updated_at = now;
                uc.dirty = true;
                let given = uc.sub.mode_given;
                if !given.contains(want) {
                    self.request_approval(ctx.uid);
                }
            }
        }

        // Initial descriptors on a newly created topic.
        if let Some(desc) = msg.desc {
            if self.rec.owner == ctx.uid && self.rec.last_seq == 0 {
                if let Err(e) = self.apply_desc_as_owner(&desc, now) {
                    self.ctrl(&ctx, e.code(), e.text()).await;
                    return false;
                }
            }
        }

        let (effective, online) = {
            let uc = self.per_user.get(&ctx.uid).expect("resolved above");
            (uc.sub.effective(), uc.online)
        };
        if !effective.is_joiner() {
            // Undo bookkeeping for a user that never got in.
            if online == 0 && is_new_user {
                self.per_user.remove(&ctx.uid);
            }
            self.ctrl(&ctx, codes::FORBIDDEN, "permission denied").await;
            return false;
        }

        if let Err(e) = self.persist_sub(ctx.uid).await {
            self.ctrl(&ctx, e.code(), e.text()).await;
            return false;
        }

        let uc = self.per_user.get_mut(&ctx.uid).expect("resolved above");
        uc.online += 1;
        let first_session_of_user = uc.online == 1;
        let topic_was_offline = self.sessions.is_empty();
        self.sessions.insert(
            ctx.sess.sid().to_string(),
            SessionCtx {
                handle: ctx.sess.clone(),
                uid: ctx.uid,
            },
        );

        if self.cat == TopicCat::P2P {
            if first_session_of_user {
                self.emit_p2p_transition(ctx.uid, true);
            }
        } else if topic_was_offline {
            self.emit_online(true);
        }

        debug!(
            topic = %self.name,
            session = %ctx.sess.sid(),
            user = %ctx.uid,
            mode = %self.per_user[&ctx.uid].sub.effective(),
            "Session joined"
        );

        // Inline metadata query: frames first, final ctrl afterwards.
        if let Some(get) = msg.get {
            self.answer_get(&ctx, &get).await;
        }

        let uc = &self.per_user[&ctx.uid];
        let mut params = BTreeMap::new();
        params.insert("topic".to_string(), json!(ctx.client_name));
        params.insert(
            "acs".to_string(),
            json!({
                "want": uc.sub.mode_want.to_string(),
                "given": uc.sub.mode_given.to_string(),
                "mode": uc.sub.effective().to_string(),
            }),
        );
        let code = if is_new_user { codes::CREATED } else { codes::OK };
        let text = if is_new_user { "created" } else { "ok" };
        self.ctrl_params(&ctx, code, text, params).await;

        // Joining `me` delivers the current presence snapshot.
        if self.cat == TopicCat::Me {
            for (src, _) in self.peers.online_snapshot() {
                let pres = ServerMsg::Pres(ServerPres {
                    topic: "me".into(),
                    src,
                    what: "on".into(),
                    seq: None,
                });
                if !self.send_to_sid(ctx.sess.sid(), pres).await {
                    break;
                }
            }
        }
        true
    }

    /// First-contact subscription for this user on this topic.
    async fn create_sub(
        &mut self,
        ctx: &ReqCtx,
        requested: Option<AccessMode>,
        now: u64,
    ) -> Result<(), EngineError> {
        // P2P mirrors are created with the topic; reaching here means the
        // caller is not a party to the pair.
        if self.cat == TopicCat::P2P {
            return Err(EngineError::Permission);
        }
        if self.cat == TopicCat::Me || self.cat == TopicCat::Fnd {
            // Only the owner subscribes to their own topics.
            if ctx.uid != self.rec.owner {
                return Err(EngineError::Permission);
            }
        }

        let is_owner = ctx.uid == self.rec.owner;
        let default = match ctx.auth {
            AuthLevel::Anon => self.rec.access_anon,
            _ => self.rec.access_auth,
        };
        let given = if is_owner { AccessMode::full() } else { default };
        let want = requested.unwrap_or(given);

        let mut sub = Subscription::new(ctx.uid, &self.name, now);
        sub.mode_want = want;
        sub.mode_given = given;

        self.store
            .upsert_sub(&sub)
            .await
            .map_err(|_| EngineError::Internal)?;

        let public = self
            .store
            .get_user(ctx.uid)
            .await
            .ok()
            .and_then(|u| u.public);
        self.per_user.insert(
            ctx.uid,
            UserCtx {
                sub,
                public,
                online: 0,
                dirty: false,
            },
        );

        if !given.contains(want) {
            self.request_approval(ctx.uid);
        }
        Ok(())
    }

    /// Notify approvers that a user wants more than they were given.
    fn request_approval(&self, about: Uid) {
        let approvers: Vec<Uid> = self
            .per_user
            .iter()
            .filter(|(uid, uc)| **uid != about && uc.sub.effective().is_approver())
            .map(|(uid, _)| *uid)
            .collect();
        if approvers.is_empty() {
            return;
        }
        debug!(topic = %self.name, user = %about, "Queueing approval request");
        let _ = self.presence_tx.send(PresenceEvent {
            to: approvers,
            src: self.name.clone(),
            what: PresenceWhat::Acs,
            seq: None,
            reply: false,
        });
    }

    async fn leave(&mut self, ctx: ReqCtx, msg: ClientLeave) {
        if !self.sessions.contains_key(ctx.sess.sid()) {
            self.ctrl(&ctx, codes::BAD_REQUEST, "not attached").await;
            return;
        }

        if msg.unsub {
            if self.cat == TopicCat::Me || self.cat == TopicCat::Fnd {
                self.ctrl(&ctx, codes::NOT_ALLOWED, "operation not allowed")
                    .await;
                return;
            }
            if ctx.uid == self.rec.owner {
                // Owners delete, they do not abandon.
                self.ctrl(&ctx, codes::NOT_ALLOWED, "owner must delete the topic")
                    .await;
                return;
            }
            if let Err(e) = self.store.delete_sub(&self.name, ctx.uid).await {
                let e = EngineError::from(e);
                self.ctrl(&ctx, e.code(), e.text()).await;
                return;
            }
            // Drop every session of this user, not just the caller's.
            let sids: Vec<String> = self
                .sessions
                .iter()
                .filter(|(_, s)| s.uid == ctx.uid)
                .map(|(sid, _)| sid.clone())
                .collect();
            for sid in sids {
                self.sessions.remove(&sid);
            }
            self.per_user.remove(&ctx.uid);
            if self.cat == TopicCat::P2P {
                self.emit_p2p_transition(ctx.uid, false);
            } else if self.sessions.is_empty() {
                self.emit_online(false);
            }
            self.ctrl(&ctx, codes::OK, "unsubscribed").await;
        } else {
            self.detach(&ctx.sess.sid().to_string(), ctx.uid).await;
            self.ctrl(&ctx, codes::OK, "detached").await;
        }
    }

    /// Remove one session; emits `off` when its user goes dark.
    async fn detach(&mut self, sid: &str, uid: Uid) {
        if self.sessions.remove(sid).is_none() {
            return;
        }
        let mut user_offline = false;
        if let Some(uc) = self.per_user.get_mut(&uid) {
            uc.online = uc.online.saturating_sub(1);
            user_offline = uc.online == 0;
        }
        if self.cat == TopicCat::P2P {
            if user_offline {
                self.emit_p2p_transition(uid, false);
            }
        } else if self.sessions.is_empty() {
            self.emit_online(false);
        }
        debug!(topic = %self.name, session = %sid, "Session detached");
    }

    // ---- publish ---------------------------------------------------------

    async fn publish(&mut self, ctx: ReqCtx, msg: ClientPub) {
        let Some(uc) = self.per_user.get(&ctx.uid) else {
            self.ctrl(&ctx, codes::FORBIDDEN, "permission denied").await;
            return;
        };
        if !uc.sub.effective().is_writer() {
            self.ctrl(&ctx, codes::FORBIDDEN, "permission denied").await;
            return;
        }
        if self.cat == TopicCat::Me || self.cat == TopicCat::Fnd {
            self.ctrl(&ctx, codes::NOT_ALLOWED, "operation not allowed")
                .await;
            return;
        }

        let now = now_ms();
        let seq = self.rec.last_seq + 1;
        let stored = StoredMessage {
            topic: self.name.clone(),
            seq,
            from: ctx.uid,
            at: now,
            head: sanitize_head(msg.head),
            content: Some(msg.content),
            del_id: None,
        };

        if let Err(e) = self.store.save_message(&stored).await {
            // `last_seq` was never advanced, so the failed seq is simply
            // reallocated by the next publish; no hole becomes visible.
            error!(topic = %self.name, seq, error = %e, "Message save failed");
            let e = EngineError::from(e);
            self.ctrl(&ctx, e.code(), e.text()).await;
            return;
        }

        self.rec.last_seq = seq;
        self.rec.touched_at = now;
        self.rec_dirty = true;
        if let Err(e) = self.store.update_topic(&self.rec).await {
            warn!(topic = %self.name, error = %e, "Topic record update failed");
        } else {
            self.rec_dirty = false;
        }

        // The sender trivially has the message.
        if let Some(uc) = self.per_user.get_mut(&ctx.uid) {
            uc.sub.recv_seq = seq;
            uc.sub.read_seq = seq;
            uc.dirty = true;
        }

        let mut params = BTreeMap::new();
        params.insert("seq".to_string(), json!(seq));
        params.insert("ts".to_string(), json!(now));
        self.ctrl_with(&ctx, codes::ACCEPTED, "accepted", Some(params))
            .await;

        let from = ctx.uid.as_tag();
        let head = stored.head.clone();
        let content = stored.content.clone().unwrap_or(Value::Null);
        self.fanout(
            AccessMode::READ,
            Some(ctx.sess.sid().to_string()),
            move |topic, _| {
                ServerMsg::Data(ServerData {
                    topic: topic.to_string(),
                    from: from.clone(),
                    head: if head.is_empty() {
                        None
                    } else {
                        Some(head.clone())
                    },
                    seq,
                    ts: now,
                    content: content.clone(),
                })
            },
        )
        .await;
    }

    // ---- get -------------------------------------------------------------

    async fn get(&mut self, ctx: ReqCtx, msg: ClientGet) {
        if !self.sessions.contains_key(ctx.sess.sid()) {
            self.ctrl(&ctx, codes::BAD_REQUEST, "not attached").await;
            return;
        }
        let sent = self.answer_get(&ctx, &msg.query).await;
        if sent {
            self.ctrl(&ctx, codes::OK, "ok").await;
        } else {
            self.ctrl(&ctx, codes::NO_CONTENT, "no content").await;
        }
    }

    /// Stream `meta`/`data` frames for a query to the requesting session.
    /// Returns whether any frame was produced.
    async fn answer_get(&mut self, ctx: &ReqCtx, query: &GetQuery) -> bool {
        let mut sent = false;
        let kinds: Vec<String> = query.kinds().map(str::to_string).collect();
        for kind in kinds {
            match kind.as_str() {
                "desc" => sent |= self.get_desc(ctx, query.desc.as_ref()).await,
                "sub" => sent |= self.get_sub(ctx).await,
                "data" => sent |= self.get_data(ctx, query.data.as_ref()).await,
                "tags" => sent |= self.get_tags(ctx).await,
                "del" => sent |= self.get_del(ctx).await,
                // `cred` and extensions: nothing to report.
                _ => {}
            }
        }
        sent
    }

    async fn get_desc(&mut self, ctx: &ReqCtx, opts: Option<&banter_proto::DescQuery>) -> bool {
        if let Some(ims) = opts.and_then(|o| o.if_modified_since) {
            if self.rec.updated_at <= ims {
                return false;
            }
        }
        let Some(uc) = self.per_user.get(&ctx.uid) else {
            return false;
        };
        let desc = TopicDesc {
            created: Some(self.rec.created_at),
            updated: Some(self.rec.updated_at),
            touched: Some(self.rec.touched_at),
            defacs: Some(banter_proto::DefaultAcs {
                auth: Some(self.rec.access_auth.to_string()),
                anon: Some(self.rec.access_anon.to_string()),
            }),
            acs: Some(AcsDesc {
                want: Some(uc.sub.mode_want.to_string()),
                given: Some(uc.sub.mode_given.to_string()),
                mode: Some(uc.sub.effective().to_string()),
            }),
            seq: Some(self.rec.last_seq),
            clear: Some(self.rec.clear_id),
            read: Some(uc.sub.read_seq),
            recv: Some(uc.sub.recv_seq),
            public: self.rec.public.clone(),
            private: uc.sub.private.clone(),
        };
        let meta = ServerMsg::Meta(ServerMeta {
            id: ctx.id.clone(),
            topic: ctx.client_name.clone(),
            ts: now_ms(),
            desc: Some(desc),
            sub: None,
            tags: None,
            del: None,
        });
        self.send_to_sid(ctx.sess.sid(), meta).await
    }

    async fn get_sub(&mut self, ctx: &ReqCtx) -> bool {
        let rows = match self.cat {
            TopicCat::Me => self.me_sub_rows(ctx.uid).await,
            TopicCat::Fnd => self.fnd_sub_rows(ctx.uid).await,
            _ => self.topic_sub_rows(ctx.uid),
        };
        if rows.is_empty() {
            return false;
        }
        let meta = ServerMsg::Meta(ServerMeta {
            id: ctx.id.clone(),
            topic: ctx.client_name.clone(),
            ts: now_ms(),
            desc: None,
            sub: Some(rows),
            tags: None,
            del: None,
        });
        self.send_to_sid(ctx.sess.sid(), meta).await
    }

    /// `me`: every subscription the owner holds, newest activity first.
    async fn me_sub_rows(&self, owner: Uid) -> Vec<TopicSub> {
        let Ok(subs) = self.store.subs_for_user(owner).await else {
            return Vec::new();
        };
        let mut rows: Vec<(u64, TopicSub)> = Vec::with_capacity(subs.len());
        for sub in subs {
            if sub.topic == self.name {
                continue;
            }
            let rec = self.store.get_topic(&sub.topic).await.ok();
            let src = presentable_name(&sub.topic, owner);
            let touched = rec.as_ref().map_or(sub.updated_at, |r| r.touched_at);
            rows.push((
                touched,
                TopicSub {
                    topic: Some(src.clone()),
                    updated: Some(sub.updated_at),
                    acs: Some(AcsDesc {
                        want: Some(sub.mode_want.to_string()),
                        given: Some(sub.mode_given.to_string()),
                        mode: Some(sub.effective().to_string()),
                    }),
                    read: Some(sub.read_seq),
                    recv: Some(sub.recv_seq),
                    clear: Some(sub.clear_id),
                    public: rec.as_ref().and_then(|r| r.public.clone()),
                    private: sub.private.clone(),
                    online: self.peers.get(&src).map(|p| p.online),
                    seq: rec.as_ref().map(|r| r.last_seq),
                    touched: Some(touched),
                    user: None,
                },
            ));
        }
        rows.sort_by(|a, b| b.0.cmp(&a.0));
        rows.into_iter().map(|(_, row)| row).collect()
    }

    /// `fnd`: the stored query is a tag list; rows are matching users.
    async fn fnd_sub_rows(&self, owner: Uid) -> Vec<TopicSub> {
        let Some(uc) = self.per_user.get(&owner) else {
            return Vec::new();
        };
        let query: Vec<String> = match &uc.sub.private {
            Some(Value::String(s)) => s
                .split([',', ' '])
                .filter(|t| !t.is_empty())
                .map(str::to_string)
                .collect(),
            Some(Value::Array(items)) => items
                .iter()
                .filter_map(|v| v.as_str().map(str::to_string))
                .collect(),
            _ => Vec::new(),
        };
        let mut seen = std::collections::HashSet::new();
        let mut rows = Vec::new();
        for tag in query {
            let Ok(users) = self.store.find_users_by_tag(&tag).await else {
                continue;
            };
            for user in users {
                if user.id == owner || !seen.insert(user.id) {
                    continue;
                }
                rows.push(TopicSub {
                    user: Some(user.id.as_tag()),
                    public: user.public.clone(),
                    ..Default::default()
                });
            }
        }
        rows
    }

    /// Group/p2p: the topic's subscriber list.
    fn topic_sub_rows(&self, caller: Uid) -> Vec<TopicSub> {
        self.per_user
            .iter()
            .map(|(uid, uc)| TopicSub {
                user: Some(uid.as_tag()),
                updated: Some(uc.sub.updated_at),
                acs: Some(AcsDesc {
                    want: Some(uc.sub.mode_want.to_string()),
                    given: Some(uc.sub.mode_given.to_string()),
                    mode: Some(uc.sub.effective().to_string()),
                }),
                // Cursors are private to their owner.
                read: (*uid == caller).then_some(uc.sub.read_seq),
                recv: (*uid == caller).then_some(uc.sub.recv_seq),
                clear: (*uid == caller).then_some(uc.sub.clear_id),
                public: uc.public.clone(),
                private: (*uid == caller)
                    .then(|| uc.sub.private.clone())
                    .flatten(),
                online: Some(uc.online > 0),
                seq: None,
                touched: None,
                topic: None,
            })
            .collect()
    }

    async fn get_data(&mut self, ctx: &ReqCtx, query: Option<&DataQuery>) -> bool {
        let Some(uc) = self.per_user.get(&ctx.uid) else {
            return false;
        };
        if !uc.sub.effective().is_reader() {
            return false;
        }
        let q = query.copied().unwrap_or_default();
        let since = q.since.unwrap_or(1);
        let before = q.before.unwrap_or(self.rec.last_seq + 1);
        let limit = q
            .limit
            .unwrap_or(DEFAULT_HISTORY_LIMIT)
            .min(self.config.history_batch_limit);

        let msgs = match self.store.message_range(&self.name, since, before, limit).await {
            Ok(msgs) => msgs,
            Err(e) => {
                warn!(topic = %self.name, error = %e, "History read failed");
                return false;
            }
        };

        let sub = uc.sub.clone();
        let topic_name = ctx.client_name.clone();
        let mut sent = false;
        for msg in msgs {
            let Some(visible) = for_delivery(msg, &sub) else {
                continue;
            };
            let frame = ServerMsg::Data(ServerData {
                topic: topic_name.clone(),
                from: if visible.from.is_zero() {
                    String::new()
                } else {
                    visible.from.as_tag()
                },
                head: if visible.head.is_empty() {
                    None
                } else {
                    Some(visible.head)
                },
                seq: visible.seq,
                ts: visible.at,
                content: visible.content.unwrap_or(Value::Null),
            });
            if !self.send_to_sid(ctx.sess.sid(), frame).await {
                return sent;
            }
            sent = true;
        }
        sent
    }

    async fn get_tags(&mut self, ctx: &ReqCtx) -> bool {
        let allowed = match self.cat {
            TopicCat::Me | TopicCat::Fnd => ctx.uid == self.rec.owner,
            _ => self
                .per_user
                .get(&ctx.uid)
                .is_some_and(|uc| uc.sub.effective().is_owner() || uc.sub.effective().is_sharer()),
        };
        if !allowed || self.rec.tags.is_empty() {
            return false;
        }
        let meta = ServerMsg::Meta(ServerMeta {
            id: ctx.id.clone(),
            topic: ctx.client_name.clone(),
            ts: now_ms(),
            desc: None,
            sub: None,
            tags: Some(self.rec.tags.clone()),
            del: None,
        });
        self.send_to_sid(ctx.sess.sid(), meta).await
    }

    async fn get_del(&mut self, ctx: &ReqCtx) -> bool {
        let Some(uc) = self.per_user.get(&ctx.uid) else {
            return false;
        };
        let ranges = uc.sub.del_ranges.clone();
        let meta = ServerMsg::Meta(ServerMeta {
            id: ctx.id.clone(),
            topic: ctx.client_name.clone(),
            ts: now_ms(),
            desc: None,
            sub: None,
            tags: None,
            del: Some(DelMeta {
                clear: self.rec.clear_id.max(uc.sub.clear_id),
                del_seq: (!ranges.is_empty()).then_some(ranges),
            }),
        });
        self.send_to_sid(ctx.sess.sid(), meta).await
    }

    // ---- set -------------------------------------------------------------

    async fn set(&mut self, ctx: ReqCtx, msg: ClientSet) {
        if !self.sessions.contains_key(ctx.sess.sid()) {
            self.ctrl(&ctx, codes::BAD_REQUEST, "not attached").await;
            return;
        }
        if msg.desc.is_none() && msg.sub.is_none() && msg.tags.is_none() {
            self.ctrl(&ctx, codes::BAD_REQUEST, "nothing to set").await;
            return;
        }

        if let Some(desc) = msg.desc {
            if let Err(e) = self.set_desc(&ctx, desc).await {
                self.ctrl(&ctx, e.code(), e.text()).await;
                return;
            }
        }
        if let Some(sub) = msg.sub {
            if let Err(e) = self.set_sub(&ctx, sub).await {
                self.ctrl(&ctx, e.code(), e.text()).await;
                return;
            }
        }
        if let Some(tags) = msg.tags {
            if let Err(e) = self.set_tags(&ctx, tags).await {
                self.ctrl(&ctx, e.code(), e.text()).await;
                return;
            }
        }
        self.ctrl(&ctx, codes::OK, "ok").await;
    }

    async fn set_desc(&mut self, ctx: &ReqCtx, desc: SetDesc) -> Result<(), EngineError> {
        let now = now_ms();
        let is_owner = ctx.uid == self.rec.owner
            || self
                .per_user
                .get(&ctx.uid)
                .is_some_and(|uc| uc.sub.effective().is_owner());

        let mut topic_changed = false;

        if self.cat == TopicCat::Fnd {
            // The "descriptor" of fnd is the caller's search query.
            if let Some(query) = desc.public {
                let uc = self.per_user.get_mut(&ctx.uid).ok_or(EngineError::Permission)?;
                uc.sub.private = Some(query);
                uc.sub.updated_at = now;
                uc.dirty = true;
                return self.persist_sub(ctx.uid).await;
            }
        } else if let Some(public) = desc.public {
            if !is_owner {
                return Err(EngineError::Permission);
            }
            self.rec.public = Some(public);
            topic_changed = true;
        }

        if let Some(defacs) = desc.defacs {
            if !is_owner {
                return Err(EngineError::Permission);
            }
            if let Some(auth) = defacs.auth {
                self.rec.access_auth = auth.parse().map_err(|_| EngineError::Invalid)?;
            }
            if let Some(anon) = defacs.anon {
                self.rec.access_anon = anon.parse().map_err(|_| EngineError::Invalid)?;
            }
            topic_changed = true;
        }

        if let Some(private) = desc.private {
            let uc = self.per_user.get_mut(&ctx.uid).ok_or(EngineError::Permission)?;
            uc.sub.private = Some(private);
            uc.sub.updated_at = now;
            uc.dirty = true;
            self.persist_sub(ctx.uid).await?;
        }

        if topic_changed {
            self.rec.updated_at = now;
            self.store
                .update_topic(&self.rec)
                .await
                .map_err(|_| EngineError::Internal)?;
            self.emit_meta_updated();
        }
        Ok(())
    }

    async fn set_sub(&mut self, ctx: &ReqCtx, set: banter_proto::SetSub) -> Result<(), EngineError> {
        let now = now_ms();
        let mode: AccessMode = set
            .mode
            .as_deref()
            .ok_or(EngineError::Malformed)?
            .parse()
            .map_err(|_| EngineError::Invalid)?;

        let target = match set.user.as_deref() {
            None => ctx.uid,
            Some(tag) => Uid::from_tag(tag).ok_or(EngineError::Malformed)?,
        };

        if target == ctx.uid {
            // Own `want`.
            let uc = self.per_user.get_mut(&ctx.uid).ok_or(EngineError::Permission)?;
            uc.sub.mode_want = mode;
            uc.sub.updated_at = now;
            uc.dirty = true;
            let lacking = !uc.sub.mode_given.contains(mode);
            self.persist_sub(ctx.uid).await?;
            if lacking {
                self.request_approval(ctx.uid);
            }
            return Ok(());
        }

        // Changing someone else's grant requires Approve.
        let granter = self
            .per_user
            .get(&ctx.uid)
            .map(|uc| uc.sub.effective())
            .ok_or(EngineError::Permission)?;
        if !granter.is_approver() {
            return Err(EngineError::Permission);
        }

        let granted = mode.clip_grant(granter);
        if granted.is_owner() && target != self.rec.owner {
            return self.transfer_ownership(ctx, target, granted, now).await;
        }

        let uc = self.per_user.get_mut(&target).ok_or(EngineError::NotFound)?;
        uc.sub.mode_given = granted;
        uc.sub.updated_at = now;
        uc.dirty = true;
        self.persist_sub(target).await?;

        let _ = self.presence_tx.send(PresenceEvent {
            to: vec![target],
            src: self.name.clone(),
            what: PresenceWhat::Acs,
            seq: None,
            reply: false,
        });
        Ok(())
    }

    /// Granting Owner moves ownership; the old owner keeps everything
    /// but the Owner bit. Memory changes apply only after every store
    /// write succeeded.
    async fn transfer_ownership(
        &mut self,
        ctx: &ReqCtx,
        target: Uid,
        granted: AccessMode,
        now: u64,
    ) -> Result<(), EngineError> {
        if ctx.uid != self.rec.owner {
            return Err(EngineError::Permission);
        }
        if !self.per_user.contains_key(&target) {
            return Err(EngineError::NotFound);
        }

        let mut new_owner_sub = self.per_user[&target].sub.clone();
        new_owner_sub.mode_given = granted | AccessMode::OWNER;
        new_owner_sub.mode_want |= AccessMode::OWNER;
        new_owner_sub.updated_at = now;

        let mut old_owner_sub = self.per_user[&ctx.uid].sub.clone();
        old_owner_sub.mode_given.remove(AccessMode::OWNER);
        old_owner_sub.mode_want.remove(AccessMode::OWNER);
        old_owner_sub.updated_at = now;

        self.store
            .upsert_sub(&new_owner_sub)
            .await
            .map_err(|_| EngineError::Internal)?;
        self.store
            .upsert_sub(&old_owner_sub)
            .await
            .map_err(|_| EngineError::Internal)?;
        self.store
            .topic_owner_change(&self.name, target)
            .await
            .map_err(|_| EngineError::Internal)?;

        self.per_user.get_mut(&target).expect("checked").sub = new_owner_sub;
        self.per_user.get_mut(&ctx.uid).expect("caller resolved").sub = old_owner_sub;
        self.rec.owner = target;
        self.rec.updated_at = now;

        info!(topic = %self.name, new_owner = %target, "Ownership transferred");
        let _ = self.presence_tx.send(PresenceEvent {
            to: vec![target],
            src: self.name.clone(),
            what: PresenceWhat::Acs,
            seq: None,
            reply: false,
        });
        Ok(())
    }

    async fn set_tags(&mut self, ctx: &ReqCtx, tags: Vec<String>) -> Result<(), EngineError> {
        let allowed = match self.cat {
            TopicCat::Me | TopicCat::Fnd => ctx.uid == self.rec.owner,
            TopicCat::Grp => self
                .per_user
                .get(&ctx.uid)
                .is_some_and(|uc| uc.sub.effective().is_owner()),
            TopicCat::P2P => false,
        };
        if !allowed {
            return Err(EngineError::Permission);
        }
        if tags.iter().any(|t| {
            t.is_empty() || t.len() > 96 || !t.chars().all(|c| c.is_ascii_graphic())
        }) {
            return Err(EngineError::Invalid);
        }
        self.rec.tags = tags;
        self.rec.updated_at = now_ms();
        self.store
            .update_topic(&self.rec)
            .await
            .map_err(|_| EngineError::Internal)?;

        // Tags on `me` double as the user's discovery tags.
        if self.cat == TopicCat::Me {
            if let Ok(mut user) = self.store.get_user(self.rec.owner).await {
                user.tags = self.rec.tags.clone();
                user.updated_at = self.rec.updated_at;
                if let Err(e) = self.store.update_user(&user).await {
                    warn!(topic = %self.name, error = %e, "User tag update failed");
                }
            }
        }
        Ok(())
    }

    // ---- del -------------------------------------------------------------

    async fn del(&mut self, ctx: ReqCtx, msg: ClientDel) -> Flow {
        if !self.sessions.contains_key(ctx.sess.sid()) {
            self.ctrl(&ctx, codes::BAD_REQUEST, "not attached").await;
            return Flow::Continue;
        }
        match msg.what {
            DelWhat::Msg => {
                self.del_messages(&ctx, msg.del_seq.unwrap_or_default(), msg.hard)
                    .await;
                Flow::Continue
            }
            DelWhat::Sub => {
                let leave = ClientLeave {
                    id: ctx.id.clone(),
                    topic: ctx.client_name.clone(),
                    unsub: true,
                };
                self.leave(ctx, leave).await;
                Flow::Continue
            }
            DelWhat::Topic => self.del_topic(ctx).await,
        }
    }

    async fn del_messages(&mut self, ctx: &ReqCtx, ranges: Vec<banter_proto::SeqRange>, hard: bool) {
        let Some(uc) = self.per_user.get(&ctx.uid) else {
            self.ctrl(ctx, codes::FORBIDDEN, "permission denied").await;
            return;
        };
        let effective = uc.sub.effective();
        if hard && !effective.is_deleter() {
            self.ctrl(ctx, codes::FORBIDDEN, "permission denied").await;
            return;
        }
        if !hard && !effective.is_reader() {
            self.ctrl(ctx, codes::FORBIDDEN, "permission denied").await;
            return;
        }

        let ranges = match normalize_ranges(&ranges, self.rec.last_seq) {
            Ok(r) => r,
            Err(e) => {
                self.ctrl(ctx, e.code(), e.text()).await;
                return;
            }
        };

        if hard {
            let clear = advance_clear(self.rec.clear_id, &ranges);
            if let Err(e) = self
                .store
                .delete_messages(&self.name, &ranges, true, clear.max(self.rec.clear_id), None)
                .await
            {
                let e = EngineError::from(e);
                self.ctrl(ctx, e.code(), e.text()).await;
                return;
            }
            self.rec.clear_id = clear;
            self.rec.updated_at = now_ms();
            if let Err(e) = self.store.update_topic(&self.rec).await {
                warn!(topic = %self.name, error = %e, "Topic record update failed");
            }

            let mut params = BTreeMap::new();
            params.insert("clear".to_string(), json!(self.rec.clear_id));
            self.ctrl_with(ctx, codes::OK, "deleted", Some(params)).await;

            // Everyone observes the same tombstones.
            let ranges_json = json!(ranges);
            let from = ctx.uid.as_tag();
            self.fanout(AccessMode::READ, Some(ctx.sess.sid().to_string()), move |topic, _| {
                ServerMsg::Info(ServerInfo {
                    topic: topic.to_string(),
                    from: from.clone(),
                    what: "del".into(),
                    seq: None,
                    reaction: None,
                    content: Some(ranges_json.clone()),
                    edited_at: None,
                })
            })
            .await;
        } else {
            if let Err(e) = self
                .store
                .delete_messages(&self.name, &ranges, false, 0, Some(ctx.uid))
                .await
            {
                let e = EngineError::from(e);
                self.ctrl(ctx, e.code(), e.text()).await;
                return;
            }
            let uc = self.per_user.get_mut(&ctx.uid).expect("checked above");
            uc.sub.del_ranges.extend(ranges.iter().copied());
            uc.sub.clear_id = advance_clear(uc.sub.clear_id, &ranges);
            uc.sub.updated_at = now_ms();
            uc.dirty = true;
            self.ctrl(ctx, codes::OK, "deleted").await;
        }
    }

    async fn del_topic(&mut self, ctx: ReqCtx) -> Flow {
        let allowed = match self.cat {
            TopicCat::Grp => self
                .per_user
                .get(&ctx.uid)
                .is_some_and(|uc| uc.sub.effective().is_owner()),
            // A p2p party may erase the pair topic for both sides.
            TopicCat::P2P => self.per_user.contains_key(&ctx.uid),
            TopicCat::Me | TopicCat::Fnd => false,
        };
        if !allowed {
            self.ctrl(&ctx, codes::FORBIDDEN, "permission denied").await;
            return Flow::Continue;
        }

        if let Err(e) = self.store.delete_topic(&self.name).await {
            let e = EngineError::from(e);
            self.ctrl(&ctx, e.code(), e.text()).await;
            return Flow::Continue;
        }

        self.ctrl(&ctx, codes::OK, "deleted").await;

        // Tell everyone, peers included, that the topic is no more.
        self.fanout(AccessMode::empty(), Some(ctx.sess.sid().to_string()), |topic, _| {
            ServerMsg::Pres(ServerPres {
                topic: topic.to_string(),
                src: topic.to_string(),
                what: "gone".into(),
                seq: None,
            })
        })
        .await;
        let to: Vec<Uid> = self.per_user.keys().copied().collect();
        let _ = self.presence_tx.send(PresenceEvent {
            to,
            src: self.name.clone(),
            what: PresenceWhat::Gone,
            seq: None,
            reply: false,
        });

        self.per_user.clear();
        self.sessions.clear();
        Flow::Shutdown
    }

    // ---- note ------------------------------------------------------------

    /// Ephemeral signals: no ctrl on success, silent drop on failure.
    async fn note(&mut self, ctx: ReqCtx, msg: ClientNote) {
        if !self.sessions.contains_key(ctx.sess.sid()) {
            return;
        }
        let Some(uc) = self.per_user.get(&ctx.uid) else {
            return;
        };
        let effective = uc.sub.effective();

        match msg.what.as_str() {
            "kp" => self.note_kp(&ctx, effective).await,
            "recv" | "read" => {
                let Some(seq) = msg.seq else { return };
                self.note_receipt(&ctx, &msg.what, seq, effective).await;
            }
            "edit" => {
                let (Some(seq), Some(content)) = (msg.seq, msg.content) else {
                    return;
                };
                self.note_edit(&ctx, seq, content).await;
            }
            "unsend" => {
                let Some(seq) = msg.seq else { return };
                self.note_unsend(&ctx, seq).await;
            }
            "react" => {
                let (Some(seq), Some(token)) = (msg.seq, msg.reaction) else {
                    return;
                };
                self.note_react(&ctx, seq, token).await;
            }
            // Unknown verbs are dropped without error.
            other => debug!(topic = %self.name, what = %other, "Unknown note verb dropped"),
        }
    }

    async fn note_kp(&mut self, ctx: &ReqCtx, effective: AccessMode) {
        if !effective.is_presencer() {
            return;
        }
        let now = now_ms();
        let last = self.kp_last.get(&ctx.uid).copied().unwrap_or(0);
        if now.saturating_sub(last) < self.config.kp_min_interval_ms {
            return;
        }
        self.kp_last.insert(ctx.uid, now);

        let from = ctx.uid.as_tag();
        let skip_uid = (!self.config.kp_to_own_sessions).then_some(ctx.uid);
        let origin = ctx.sess.sid().to_string();
        let targets = self.fanout_targets(AccessMode::PRES, Some(&origin), skip_uid);
        self.deliver(targets, move |topic, _| {
            ServerMsg::Info(ServerInfo {
                topic: topic.to_string(),
                from: from.clone(),
                what: "kp".into(),
                seq: None,
                reaction: None,
                content: None,
                edited_at: None,
            })
        })
        .await;
    }

    async fn note_receipt(&mut self, ctx: &ReqCtx, what: &str, seq: u64, effective: AccessMode) {
        if !effective.is_reader() || seq == 0 || seq > self.rec.last_seq {
            return;
        }
        let uc = self.per_user.get_mut(&ctx.uid).expect("checked by caller");
        let advanced = match what {
            "read" => {
                if seq <= uc.sub.read_seq {
                    return;
                }
                uc.sub.read_seq = seq;
                if uc.sub.recv_seq < seq {
                    uc.sub.recv_seq = seq;
                }
                true
            }
            _ => {
                if seq <= uc.sub.recv_seq {
                    return;
                }
                uc.sub.recv_seq = seq;
                true
            }
        };
        if !advanced {
            return;
        }
        uc.dirty = true;

        let from = ctx.uid.as_tag();
        let what = what.to_string();
        self.fanout(AccessMode::READ, Some(ctx.sess.sid().to_string()), move |topic, _| {
            ServerMsg::Info(ServerInfo {
                topic: topic.to_string(),
                from: from.clone(),
                what: what.clone(),
                seq: Some(seq),
                reaction: None,
                content: None,
                edited_at: None,
            })
        })
        .await;
    }

    async fn note_edit(&mut self, ctx: &ReqCtx, seq: u64, content: Value) {
        let Ok(msg) = self.store.get_message(&self.name, seq).await else {
            return;
        };
        let now = now_ms();
        if !self.config.edit_policy.can_edit(&msg, ctx.uid, now) {
            return;
        }
        let mut head = msg.head;
        apply_edit(&mut head, now);
        if self
            .store
            .update_message_header(
                &self.name,
                seq,
                head,
                crate::store::ContentUpdate::Replace(content.clone()),
            )
            .await
            .is_err()
        {
            return;
        }

        let from = ctx.uid.as_tag();
        self.fanout(AccessMode::READ, Some(ctx.sess.sid().to_string()), move |topic, _| {
            ServerMsg::Info(ServerInfo {
                topic: topic.to_string(),
                from: from.clone(),
                what: "edit".into(),
                seq: Some(seq),
                reaction: None,
                content: Some(content.clone()),
                edited_at: Some(now),
            })
        })
        .await;
    }

    async fn note_unsend(&mut self, ctx: &ReqCtx, seq: u64) {
        let Ok(msg) = self.store.get_message(&self.name, seq).await else {
            return;
        };
        let now = now_ms();
        if !self.config.edit_policy.can_unsend(&msg, ctx.uid, now) {
            return;
        }
        let mut head = msg.head;
        apply_unsend(&mut head);
        if self
            .store
            .update_message_header(&self.name, seq, head, crate::store::ContentUpdate::Clear)
            .await
            .is_err()
        {
            return;
        }

        let from = ctx.uid.as_tag();
        self.fanout(AccessMode::READ, Some(ctx.sess.sid().to_string()), move |topic, _| {
            ServerMsg::Info(ServerInfo {
                topic: topic.to_string(),
                from: from.clone(),
                what: "unsend".into(),
                seq: Some(seq),
                reaction: None,
                content: None,
                edited_at: None,
            })
        })
        .await;
    }

    async fn note_react(&mut self, ctx: &ReqCtx, seq: u64, token: String) {
        if token.is_empty() || token.len() > 32 {
            return;
        }
        let Ok(msg) = self.store.get_message(&self.name, seq).await else {
            return;
        };
        if msg.is_tombstone() || msg.head.unsent == Some(true) {
            return;
        }
        let mut head = msg.head;
        head.toggle_reaction(&token, &ctx.uid.as_tag());
        if self
            .store
            .update_message_header(&self.name, seq, head, crate::store::ContentUpdate::Keep)
            .await
            .is_err()
        {
            return;
        }

        let from = ctx.uid.as_tag();
        // Reactions reach the reactor's other sessions too.
        self.fanout(AccessMode::READ, Some(ctx.sess.sid().to_string()), move |topic, _| {
            ServerMsg::Info(ServerInfo {
                topic: topic.to_string(),
                from: from.clone(),
                what: "react".into(),
                seq: Some(seq),
                reaction: Some(token.clone()),
                content: None,
                edited_at: None,
            })
        })
        .await;
    }

    // ---- presence --------------------------------------------------------

    /// Presence events land on `me` topics only; anything else ignores them.
    async fn handle_presence(&mut self, ev: PresenceEvent) {
        if self.cat != TopicCat::Me {
            return;
        }
        let owner = self.rec.owner;
        let src = presentable_name(&ev.src, owner);
        let now = now_ms();

        let forward = match ev.what {
            PresenceWhat::On => self.peers.set_online(src.clone(), true, now),
            PresenceWhat::Off => self.peers.set_online(src.clone(), false, now),
            PresenceWhat::Gone => {
                self.peers.remove(&src);
                true
            }
            PresenceWhat::Upd | PresenceWhat::Acs => {
                self.peers.touch(&src, now);
                true
            }
        };

        if forward {
            let what = ev.what.as_str().to_string();
            let seq = ev.seq;
            let src_cl = src.clone();
            self.fanout(AccessMode::empty(), None, move |_, _| {
                ServerMsg::Pres(ServerPres {
                    topic: "me".into(),
                    src: src_cl.clone(),
                    what: what.clone(),
                    seq,
                })
            })
            .await;
        }

        // Answer an online probe so both sides converge.
        if ev.reply && !self.sessions.is_empty() {
            if let Some(peer) = Uid::from_tag(&src) {
                let _ = self.presence_tx.send(PresenceEvent {
                    to: vec![peer],
                    src: self.name.clone(),
                    what: PresenceWhat::On,
                    seq: None,
                    reply: false,
                });
            }
        }
    }

    /// Announce an online-state flip of this topic to its peers' `me`.
    ///
    /// For `me` topics this means "the user went on/offline": probe every
    /// p2p partner so both sides converge. For groups it means "the topic
    /// went active/quiet" and fans to subscribers with the Presence bit.
    fn emit_online(&self, online: bool) {
        let to: Vec<Uid> = match self.cat {
            TopicCat::Me => self
                .peers
                .names()
                .iter()
                .filter_map(|src| Uid::from_tag(src))
                .collect(),
            TopicCat::Fnd => return,
            _ => self
                .per_user
                .iter()
                .filter(|(_, uc)| uc.sub.effective().is_presencer())
                .map(|(uid, _)| *uid)
                .collect(),
        };
        if to.is_empty() {
            return;
        }
        let _ = self.presence_tx.send(PresenceEvent {
            to,
            src: self.name.clone(),
            what: if online {
                PresenceWhat::On
            } else {
                PresenceWhat::Off
            },
            seq: None,
            reply: online && self.cat == TopicCat::Me,
        });
    }

    /// One side of a p2p pair changed online state; tell the other side.
    fn emit_p2p_transition(&self, user: Uid, online: bool) {
        let Some((a, b)) = p2p_pair(&self.name) else {
            return;
        };
        let peer = if a == user { b } else { a };
        let _ = self.presence_tx.send(PresenceEvent {
            to: vec![peer],
            // The peer's `me` renders this p2p topic as `usr<user>`.
            src: self.name.clone(),
            what: if online {
                PresenceWhat::On
            } else {
                PresenceWhat::Off
            },
            seq: None,
            reply: online,
        });
    }

    /// Metadata changed; let subscribers' `me` topics know.
    fn emit_meta_updated(&self) {
        let to: Vec<Uid> = self.per_user.keys().copied().collect();
        if to.is_empty() {
            return;
        }
        let _ = self.presence_tx.send(PresenceEvent {
            to,
            src: self.name.clone(),
            what: PresenceWhat::Upd,
            seq: None,
            reply: false,
        });
    }

    // ---- plumbing --------------------------------------------------------

    async fn persist_sub(&mut self, uid: Uid) -> Result<(), EngineError> {
        let Some(uc) = self.per_user.get_mut(&uid) else {
            return Ok(());
        };
        self.store
            .upsert_sub(&uc.sub)
            .await
            .map_err(|_| EngineError::Internal)?;
        uc.dirty = false;
        Ok(())
    }

    async fn ctrl(&mut self, ctx: &ReqCtx, code: u16, text: &str) {
        self.ctrl_with(ctx, code, text, None).await;
    }

    async fn ctrl_params(
        &mut self,
        ctx: &ReqCtx,
        code: u16,
        text: &str,
        params: BTreeMap<String, Value>,
    ) {
        self.ctrl_with(ctx, code, text, Some(params)).await;
    }

    async fn ctrl_with(
        &mut self,
        ctx: &ReqCtx,
        code: u16,
        text: &str,
        params: Option<BTreeMap<String, Value>>,
    ) {
        let msg = ServerMsg::Ctrl(banter_proto::ServerCtrl {
            id: ctx.id.clone(),
            topic: ctx.client_name.clone(),
            code,
            text: text.to_string(),
            params,
            ts: now_ms(),
        });
        // A reply failure is the session's problem, not the request's.
        let _ = self.queue_to(&ctx.sess, msg).await;
    }

    /// Queue a frame to a session by id, detaching it when slow.
    async fn send_to_sid(&mut self, sid: &str, msg: ServerMsg) -> bool {
        let Some(sctx) = self.sessions.get(sid) else {
            return false;
        };
        let handle = sctx.handle.clone();
        let uid = sctx.uid;
        if self.queue_to(&handle, msg).await {
            true
        } else {
            self.drop_slow(sid.to_string(), uid).await;
            false
        }
    }

    async fn queue_to(&self, sess: &SessionHandle, msg: ServerMsg) -> bool {
        sess.queue(msg, Duration::from_millis(self.config.send_deadline_ms))
            .await
            .is_ok()
    }

    fn fanout_targets(
        &self,
        required: AccessMode,
        skip_sid: Option<&str>,
        skip_uid: Option<Uid>,
    ) -> Vec<(String, Uid, SessionHandle)> {
        self.sessions
            .iter()
            .filter(|(sid, _)| skip_sid != Some(sid.as_str()))
            .filter(|(_, s)| skip_uid != Some(s.uid))
            .filter(|(_, s)| {
                required.is_empty()
                    || self
                        .per_user
                        .get(&s.uid)
                        .is_some_and(|uc| uc.sub.effective().contains(required))
            })
            .map(|(sid, s)| (sid.clone(), s.uid, s.handle.clone()))
            .collect()
    }

    /// Fan a frame out to every attached session whose user holds the
    /// required bits. Sessions that cannot absorb the frame within the
    /// send deadline are detached as slow.
    async fn fanout<F>(&mut self, required: AccessMode, skip_sid: Option<String>, make: F)
    where
        F: Fn(&str, Uid) -> ServerMsg,
    {
        let targets = self.fanout_targets(required, skip_sid.as_deref(), None);
        self.deliver(targets, make).await;
    }

    async fn deliver<F>(&mut self, targets: Vec<(String, Uid, SessionHandle)>, make: F)
    where
        F: Fn(&str, Uid) -> ServerMsg,
    {
        let mut slow = Vec::new();
        for (sid, uid, handle) in targets {
            let topic_name = presentable_name(&self.name, uid);
            let msg = make(&topic_name, uid);
            if !self.queue_to(&handle, msg).await {
                slow.push((sid, uid));
            }
        }
        for (sid, uid) in slow {
            self.drop_slow(sid, uid).await;
        }
    }

    /// A session that missed its send deadline is slow: detach it here
    /// and kick it so its own writer shuts the connection down.
    async fn drop_slow(&mut self, sid: String, uid: Uid) {
        warn!(topic = %self.name, session = %sid, "Slow session detached");
        if let Some(sctx) = self.sessions.get(&sid) {
            sctx.handle.kick();
        }
        self.detach(&sid, uid).await;
    }

    fn sweep(&mut self, now: u64) {
        let horizon = self.config.kp_min_interval_ms * 8;
        self.kp_last.retain(|_, last| now.saturating_sub(*last) < horizon);
    }

    /// Flush dirty state and answer stragglers while draining.
    async fn drain(&mut self, rx: &mut mpsc::Receiver<TopicCommand>) {
        if self.rec_dirty {
            if let Err(e) = self.store.update_topic(&self.rec).await {
                warn!(topic = %self.name, error = %e, "Drain flush of topic record failed");
            }
        }
        let dirty: Vec<Uid> = self
            .per_user
            .iter()
            .filter(|(_, uc)| uc.dirty)
            .map(|(uid, _)| *uid)
            .collect();
        for uid in dirty {
            if let Err(e) = self.persist_sub(uid).await {
                warn!(topic = %self.name, user = %uid, error = %e, "Drain flush of subscription failed");
            }
        }

        while let Ok(cmd) = rx.try_recv() {
            if let TopicCommand::Client(req) = cmd {
                let ctrl = ServerMsg::ctrl(
                    req.msg.id(),
                    req.client_name.clone(),
                    codes::UNAVAILABLE,
                    "topic reloading, retry shortly",
                    now_ms(),
                );
                let _ = req.sess.try_queue(ctrl);
            }
        }
    }

    fn apply_desc_as_owner(&mut self, desc: &SetDesc, now: u64) -> Result<(), EngineError> {
        if let Some(public) = &desc.public {
            self.rec.public = Some(public.clone());
        }
        if let Some(defacs) = &desc.defacs {
            if let Some(auth) = &defacs.auth {
                self.rec.access_auth = auth.parse().map_err(|_| EngineError::Invalid)?;
            }
            if let Some(anon) = &defacs.anon {
                self.rec.access_anon = anon.parse().map_err(|_| EngineError::Invalid)?;
            }
        }
        self.rec.updated_at = now;
        self.rec_dirty = true;
        Ok(())
    }
}

/// Strip server-managed header keys from a client-supplied head.
fn sanitize_head(head: Option<MessageHead>) -> MessageHead {
    let Some(mut head) = head else {
        return MessageHead::default();
    };
    head.edited_at = None;
    head.edit_count = None;
    head.unsent = None;
    head.deleted = None;
    head.reactions = None;
    head
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sanitize_head_strips_server_keys() {
        let head = MessageHead {
            edited_at: Some(1),
            edit_count: Some(2),
            unsent: Some(true),
            deleted: Some(true),
            reply: Some("4".into()),
            ..Default::default()
        };
        let clean = sanitize_head(Some(head));
        assert!(clean.edited_at.is_none());
        assert!(clean.unsent.is_none());
        assert!(clean.deleted.is_none());
        assert_eq!(clean.reply.as_deref(), Some("4"));

        assert!(sanitize_head(None).is_empty());
    }
}
