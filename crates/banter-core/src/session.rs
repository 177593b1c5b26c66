//! The session object: one per client connection.
//!
//! A session parses nothing and writes nothing itself; the transport
//! layer feeds it decoded envelopes through [`Session::dispatch`] and
//! drains the outbound queue returned at construction. `hi`, `acc`, and
//! `login` are answered locally; topic verbs are routed through the hub.

use crate::auth::{AuthLevel, Authenticator};
use crate::error::{codes, EngineError};
use crate::hub::Hub;
use crate::store::User;
use crate::topic::{ClientReq, TopicCommand};
use crate::types::{new_session_id, now_ms, resolve_topic_name, NameError, TopicAddr, Uid};
use banter_proto::{
    ClientAcc, ClientHi, ClientLogin, ClientMsg, ServerCtrl, ServerMsg, Version, PROTOCOL_VERSION,
};
use serde_json::json;
use std::collections::BTreeMap;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, Notify};
use tracing::{debug, warn};

/// Cloneable endpoint topics use to reach a session.
#[derive(Debug, Clone)]
pub struct SessionHandle {
    sid: Arc<str>,
    tx: mpsc::Sender<ServerMsg>,
    kicked: Arc<AtomicBool>,
    kick_notify: Arc<Notify>,
}

impl SessionHandle {
    #[must_use]
    pub fn sid(&self) -> &str {
        &self.sid
    }

    /// Queue a frame, waiting up to `deadline` for space.
    ///
    /// # Errors
    ///
    /// Fails when the session was kicked, closed, or stayed full past
    /// the deadline; the caller should treat it as gone.
    pub async fn queue(&self, msg: ServerMsg, deadline: Duration) -> Result<(), EngineError> {
        if self.kicked.load(Ordering::Relaxed) {
            return Err(EngineError::Unavailable);
        }
        match tokio::time::timeout(deadline, self.tx.send(msg)).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(_)) => Err(EngineError::Unavailable),
            Err(_) => Err(EngineError::Overloaded),
        }
    }

    /// Best-effort enqueue for droppable frames.
    pub fn try_queue(&self, msg: ServerMsg) -> bool {
        !self.kicked.load(Ordering::Relaxed) && self.tx.try_send(msg).is_ok()
    }

    /// Mark the session slow/dead; its writer loop shuts the connection.
    pub fn kick(&self) {
        self.kicked.store(true, Ordering::Relaxed);
        self.kick_notify.notify_waiters();
    }

    #[must_use]
    pub fn is_kicked(&self) -> bool {
        self.kicked.load(Ordering::Relaxed)
    }

    /// Resolve once the session has been kicked.
    pub async fn kicked(&self) {
        while !self.kicked.load(Ordering::Relaxed) {
            self.kick_notify.notified().await;
        }
    }
}

/// Per-connection state machine.
pub struct Session {
    hub: Arc<Hub>,
    authenticator: Arc<dyn Authenticator>,
    handle: SessionHandle,
    uid: Option<Uid>,
    auth_level: AuthLevel,
    ver: Option<Version>,
    ua: String,
    /// Joined topics: routing name -> name the client used.
    attached: HashMap<String, String>,
    /// Wall clock of the last inbound envelope.
    pub last_action: u64,
}

impl Session {
    /// Create a session and hand back the outbound queue its transport
    /// writer must drain.
    #[must_use]
    pub fn new(
        hub: Arc<Hub>,
        authenticator: Arc<dyn Authenticator>,
    ) -> (Self, mpsc::Receiver<ServerMsg>) {
        let depth = hub.config().session_queue_depth;
        let (tx, rx) = mpsc::channel(depth);
        let handle = SessionHandle {
            sid: Arc::from(new_session_id()),
            tx,
            kicked: Arc::new(AtomicBool::new(false)),
            kick_notify: Arc::new(Notify::new()),
        };
        let session = Self {
            hub,
            authenticator,
            handle,
            uid: None,
            auth_level: AuthLevel::Anon,
            ver: None,
            ua: String::new(),
            attached: HashMap::new(),
            last_action: now_ms(),
        };
        (session, rx)
    }

    #[must_use]
    pub fn sid(&self) -> &str {
        self.handle.sid()
    }

    #[must_use]
    pub fn handle(&self) -> SessionHandle {
        self.handle.clone()
    }

    #[must_use]
    pub fn uid(&self) -> Option<Uid> {
        self.uid
    }

    /// Process one inbound envelope. Every reply goes out the queue.
    pub async fn dispatch(&mut self, msg: ClientMsg) {
        self.last_action = now_ms();
        match msg {
            ClientMsg::Hi(m) => self.on_hi(m).await,
            ClientMsg::Acc(m) => self.on_acc(m).await,
            ClientMsg::Login(m) => self.on_login(m).await,
            other => self.route(other).await,
        }
    }

    /// Detach from every joined topic; used when the connection dies.
    pub async fn close(&mut self) {
        let Some(uid) = self.uid else {
            self.attached.clear();
            return;
        };
        for (routing, _) in self.attached.drain() {
            if let Some(handle) = self.hub.get_live(&routing) {
                // Non-blocking: a busy topic learns of the death late,
                // never blocks the close path.
                let _ = handle.try_send(TopicCommand::SessionGone {
                    sid: self.handle.sid().to_string(),
                    uid,
                });
            }
        }
        debug!(session = %self.handle.sid(), "Session closed");
    }

    // ---- local verbs -----------------------------------------------------

    async fn on_hi(&mut self, msg: ClientHi) {
        let ver: Version = match msg.ver.parse() {
            Ok(v) => v,
            Err(_) => {
                self.ctrl(&msg.id, "", codes::BAD_REQUEST, "malformed version")
                    .await;
                return;
            }
        };
        if !ver.is_compatible_with(&PROTOCOL_VERSION) {
            self.ctrl(&msg.id, "", codes::BAD_REQUEST, "incompatible version")
                .await;
            return;
        }
        self.ver = Some(ver);
        self.ua = msg.ua;

        let mut params = BTreeMap::new();
        params.insert("ver".to_string(), json!(PROTOCOL_VERSION.to_string()));
        params.insert("sid".to_string(), json!(self.handle.sid()));
        self.reply(ServerMsg::ctrl_params(
            msg.id,
            "",
            codes::OK,
            "ok",
            params,
            now_ms(),
        ))
        .await;
    }

    async fn on_acc(&mut self, msg: ClientAcc) {
        if msg.user == "new" {
            self.create_account(msg).await;
        } else {
            self.update_account(msg).await;
        }
    }

    async fn create_account(&mut self, msg: ClientAcc) {
        let now = now_ms();
        let uid = Uid::generate();
        let mut user = User::new(uid, now);
        if let Some(desc) = &msg.desc {
            user.public = desc.public.clone();
            if let Some(defacs) = &desc.defacs {
                if let Some(auth) = &defacs.auth {
                    match auth.parse() {
                        Ok(mode) => user.default_auth = mode,
                        Err(_) => {
                            self.ctrl(&msg.id, "", codes::UNPROCESSABLE, "invalid mode")
                                .await;
                            return;
                        }
                    }
                }
                if let Some(anon) = &defacs.anon {
                    match anon.parse() {
                        Ok(mode) => user.default_anon = mode,
                        Err(_) => {
                            self.ctrl(&msg.id, "", codes::UNPROCESSABLE, "invalid mode")
                                .await;
                            return;
                        }
                    }
                }
            }
        }
        if let Some(tags) = &msg.tags {
            user.tags = tags.clone();
        }

        let store = self.hub.store();
        if let Err(e) = store.create_user(&user).await {
            let e = EngineError::from(e);
            self.ctrl(&msg.id, "", e.code(), e.text()).await;
            return;
        }
        if let Err(e) = self
            .authenticator
            .add_record(uid, &msg.scheme, &msg.secret)
            .await
        {
            // No half-created accounts.
            if let Err(del) = store.delete_user(uid, true).await {
                warn!(user = %uid, error = %del, "Orphaned account cleanup failed");
            }
            self.ctrl(&msg.id, "", e.code(), e.text()).await;
            return;
        }

        if msg.login && self.uid.is_none() {
            self.uid = Some(uid);
            self.auth_level = AuthLevel::Auth;
        }

        let mut params = BTreeMap::new();
        params.insert("user".to_string(), json!(uid.as_tag()));
        if msg.login {
            params.insert("authlvl".to_string(), json!("auth"));
        }
        self.reply(ServerMsg::ctrl_params(
            msg.id,
            "",
            codes::CREATED,
            "created",
            params,
            now_ms(),
        ))
        .await;
    }

    async fn update_account(&mut self, msg: ClientAcc) {
        let Some(uid) = self.uid else {
            self.ctrl(&msg.id, "", codes::UNAUTHORIZED, "authentication required")
                .await;
            return;
        };
        if !msg.user.is_empty() && Uid::from_tag(&msg.user) != Some(uid) {
            self.ctrl(&msg.id, "", codes::FORBIDDEN, "permission denied")
                .await;
            return;
        }

        let store = self.hub.store();
        let mut user = match store.get_user(uid).await {
            Ok(u) => u,
            Err(e) => {
                let e = EngineError::from(e);
                self.ctrl(&msg.id, "", e.code(), e.text()).await;
                return;
            }
        };
        if let Some(desc) = &msg.desc {
            if let Some(public) = &desc.public {
                user.public = Some(public.clone());
            }
        }
        if let Some(tags) = &msg.tags {
            user.tags = tags.clone();
        }
        user.updated_at = now_ms();

        match store.update_user(&user).await {
            Ok(()) => self.ctrl(&msg.id, "", codes::OK, "ok").await,
            Err(e) => {
                let e = EngineError::from(e);
                self.ctrl(&msg.id, "", e.code(), e.text()).await;
            }
        }
    }

    async fn on_login(&mut self, msg: ClientLogin) {
        if let Some(current) = self.uid {
            // Rebinding a live session to another user is not a thing.
            let code = codes::NOT_MODIFIED;
            let mut params = BTreeMap::new();
            params.insert("user".to_string(), json!(current.as_tag()));
            self.reply(ServerMsg::ctrl_params(
                msg.id,
                "",
                code,
                "already authenticated",
                params,
                now_ms(),
            ))
            .await;
            return;
        }

        match self
            .authenticator
            .authenticate(&msg.scheme, &msg.secret)
            .await
        {
            Ok(ctx) => {
                self.uid = Some(ctx.uid);
                self.auth_level = ctx.level;
                debug!(
                    session = %self.handle.sid(),
                    user = %ctx.uid,
                    ver = ?self.ver,
                    ua = %self.ua,
                    "Authenticated"
                );

                let mut params = BTreeMap::new();
                params.insert("user".to_string(), json!(ctx.uid.as_tag()));
                self.reply(ServerMsg::ctrl_params(
                    msg.id,
                    "",
                    codes::OK,
                    "ok",
                    params,
                    now_ms(),
                ))
                .await;
            }
            Err(e) => self.ctrl(&msg.id, "", e.code(), e.text()).await,
        }
    }

    // ---- topic routing ---------------------------------------------------

    async fn route(&mut self, msg: ClientMsg) {
        let id = msg.id().to_string();
        let is_note = matches!(msg, ClientMsg::Note(_));

        let Some(uid) = self.uid else {
            if !is_note {
                self.ctrl(&id, "", codes::UNAUTHORIZED, "authentication required")
                    .await;
            }
            return;
        };

        let name = msg.topic().unwrap_or_default().to_string();
        let addr = match resolve_topic_name(&name, uid) {
            Ok(addr) => addr,
            Err(e) => {
                if !is_note {
                    let (code, text) = match e {
                        NameError::SelfP2P => (codes::UNPROCESSABLE, "cannot subscribe to self"),
                        _ => (codes::BAD_REQUEST, "malformed topic name"),
                    };
                    self.ctrl(&id, &name, code, text).await;
                }
                return;
            }
        };

        if let ClientMsg::Sub(_) = &msg {
            self.subscribe(msg, addr, uid).await;
            return;
        }

        // Everything else requires a prior join on this session.
        if !self.attached.contains_key(&addr.routing) {
            if !is_note {
                self.ctrl(&id, &name, codes::BAD_REQUEST, "not attached").await;
            }
            return;
        }
        if let ClientMsg::Leave(_) = &msg {
            // Optimistic: the record goes away even if the topic answers
            // with an error, matching the detach-on-close semantics.
            self.attached.remove(&addr.routing);
        }

        let Some(handle) = self.hub.get_live(&addr.routing) else {
            // The actor idled out from under us; it re-spawns on demand.
            match self.hub.get_or_spawn(&addr, None).await {
                Ok(_) if is_note => return, // notes are droppable, not worth a retry dance
                Ok(handle) => {
                    self.forward(handle, msg, addr, uid).await;
                    return;
                }
                Err(e) => {
                    if !is_note {
                        self.ctrl(&id, &name, e.code(), e.text()).await;
                    }
                    return;
                }
            }
        };
        self.forward(handle, msg, addr, uid).await;
    }

    async fn subscribe(&mut self, msg: ClientMsg, addr: TopicAddr, uid: Uid) {
        let id = msg.id().to_string();
        if self.attached.contains_key(&addr.routing) {
            self.ctrl(&id, &addr.client_name, codes::NOT_MODIFIED, "already subscribed")
                .await;
            return;
        }
        if self.attached.len() >= self.hub.config().max_subscriptions_per_session {
            self.ctrl(&id, &addr.client_name, codes::UNPROCESSABLE, "too many subscriptions")
                .await;
            return;
        }

        let create_owner = addr.is_new.then_some(uid);
        let handle = match self.hub.get_or_spawn(&addr, create_owner).await {
            Ok(h) => h,
            Err(e) => {
                self.ctrl(&id, &addr.client_name, e.code(), e.text()).await;
                return;
            }
        };

        let (joined_tx, joined_rx) = oneshot::channel();
        let req = ClientReq {
            msg,
            sess: self.handle.clone(),
            uid,
            auth: self.auth_level,
            client_name: addr.client_name.clone(),
            joined: Some(joined_tx),
        };
        let deadline = Duration::from_millis(self.hub.config().forward_deadline_ms);
        if let Err(e) = handle.send(TopicCommand::Client(Box::new(req)), deadline).await {
            self.ctrl(&id, &addr.client_name, e.code(), e.text()).await;
            return;
        }

        // The join receipt keeps duplicate-join answers truthful; the
        // ctrl itself arrives through the outbound queue as usual.
        match tokio::time::timeout(Duration::from_secs(5), joined_rx).await {
            Ok(Ok(true)) => {
                self.attached.insert(addr.routing, addr.client_name);
            }
            Ok(Ok(false)) | Ok(Err(_)) => {}
            Err(_) => {
                warn!(session = %self.handle.sid(), topic = %addr.routing, "Join receipt timed out");
            }
        }
    }

    async fn forward(&mut self, handle: crate::topic::TopicHandle, msg: ClientMsg, addr: TopicAddr, uid: Uid) {
        let id = msg.id().to_string();
        let is_note = matches!(msg, ClientMsg::Note(_));
        let req = ClientReq {
            msg,
            sess: self.handle.clone(),
            uid,
            auth: self.auth_level,
            client_name: addr.client_name.clone(),
            joined: None,
        };
        let deadline = Duration::from_millis(self.hub.config().forward_deadline_ms);
        if let Err(e) = handle.send(TopicCommand::Client(Box::new(req)), deadline).await {
            if !is_note {
                self.ctrl(&id, &addr.client_name, e.code(), e.text()).await;
            }
        }
    }

    // ---- replies ---------------------------------------------------------

    async fn ctrl(&self, id: &str, topic: &str, code: u16, text: &str) {
        self.reply(ServerMsg::Ctrl(ServerCtrl {
            id: id.to_string(),
            topic: topic.to_string(),
            code,
            text: text.to_string(),
            params: None,
            ts: now_ms(),
        }))
        .await;
    }

    async fn reply(&self, msg: ServerMsg) {
        let deadline = Duration::from_millis(self.hub.config().send_deadline_ms);
        if self.handle.queue(msg, deadline).await.is_err() {
            // Can't even answer: the connection is beyond saving.
            self.handle.kick();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::BasicAuthenticator;
    use crate::hub::EngineConfig;
    use crate::store::mem::MemStore;

    async fn test_rig() -> (Session, mpsc::Receiver<ServerMsg>, Arc<Hub>) {
        let store = Arc::new(MemStore::new());
        let hub = Hub::new(store, EngineConfig::default());
        let auth: Arc<dyn Authenticator> = Arc::new(BasicAuthenticator::new());
        let (session, rx) = Session::new(hub.clone(), auth);
        (session, rx, hub)
    }

    fn expect_ctrl(msg: ServerMsg) -> ServerCtrl {
        match msg {
            ServerMsg::Ctrl(c) => c,
            other => panic!("expected ctrl, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_hi_handshake() {
        let (mut session, mut rx, _hub) = test_rig().await;

        session
            .dispatch(ClientMsg::Hi(ClientHi {
                id: "1".into(),
                ver: PROTOCOL_VERSION.to_string(),
                ua: "test/1.0".into(),
            }))
            .await;

        let ctrl = expect_ctrl(rx.recv().await.unwrap());
        assert_eq!(ctrl.id, "1");
        assert_eq!(ctrl.code, codes::OK);
    }

    #[tokio::test]
    async fn test_hi_rejects_incompatible_major() {
        let (mut session, mut rx, _hub) = test_rig().await;

        session
            .dispatch(ClientMsg::Hi(ClientHi {
                id: "1".into(),
                ver: "99.0".into(),
                ua: String::new(),
            }))
            .await;

        let ctrl = expect_ctrl(rx.recv().await.unwrap());
        assert_eq!(ctrl.code, codes::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_acc_new_then_login() {
        let (mut session, mut rx, _hub) = test_rig().await;

        session
            .dispatch(ClientMsg::Acc(ClientAcc {
                id: "1".into(),
                user: "new".into(),
                scheme: "basic".into(),
                secret: "alice:secret".into(),
                ..Default::default()
            }))
            .await;
        let ctrl = expect_ctrl(rx.recv().await.unwrap());
        assert_eq!(ctrl.code, codes::CREATED);
        let user_tag = ctrl.params.unwrap()["user"].as_str().unwrap().to_string();

        session
            .dispatch(ClientMsg::Login(ClientLogin {
                id: "2".into(),
                scheme: "basic".into(),
                secret: "alice:secret".into(),
            }))
            .await;
        let ctrl = expect_ctrl(rx.recv().await.unwrap());
        assert_eq!(ctrl.code, codes::OK);
        assert_eq!(ctrl.params.unwrap()["user"].as_str().unwrap(), user_tag);
        assert!(session.uid().is_some());
    }

    #[tokio::test]
    async fn test_login_bad_secret() {
        let (mut session, mut rx, _hub) = test_rig().await;

        session
            .dispatch(ClientMsg::Login(ClientLogin {
                id: "1".into(),
                scheme: "basic".into(),
                secret: "ghost:nope".into(),
            }))
            .await;
        let ctrl = expect_ctrl(rx.recv().await.unwrap());
        assert_eq!(ctrl.code, codes::UNAUTHORIZED);
        assert!(session.uid().is_none());
    }

    #[tokio::test]
    async fn test_topic_verbs_require_login() {
        let (mut session, mut rx, _hub) = test_rig().await;

        session
            .dispatch(ClientMsg::Sub(banter_proto::ClientSub {
                id: "1".into(),
                topic: "me".into(),
                ..Default::default()
            }))
            .await;
        let ctrl = expect_ctrl(rx.recv().await.unwrap());
        assert_eq!(ctrl.code, codes::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn test_pub_requires_attach() {
        let (mut session, mut rx, _hub) = test_rig().await;

        // Authenticate.
        session
            .dispatch(ClientMsg::Acc(ClientAcc {
                id: "1".into(),
                user: "new".into(),
                scheme: "basic".into(),
                secret: "bob:pw".into(),
                login: true,
                ..Default::default()
            }))
            .await;
        let _ = rx.recv().await.unwrap();

        session
            .dispatch(ClientMsg::Pub(banter_proto::ClientPub {
                id: "2".into(),
                topic: "grpnowhere".into(),
                head: None,
                content: json!("x"),
            }))
            .await;
        let ctrl = expect_ctrl(rx.recv().await.unwrap());
        assert_eq!(ctrl.code, codes::BAD_REQUEST);
        assert_eq!(ctrl.text, "not attached");
    }
}
