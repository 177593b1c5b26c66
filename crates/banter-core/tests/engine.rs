//! End-to-end engine tests: real sessions, real topic actors, in-memory
//! persistence. No transport; envelopes are dispatched directly.

use banter_core::{
    codes, Authenticator, BasicAuthenticator, EngineConfig, Hub, MemStore, Session,
};
use banter_proto::{
    ClientAcc, ClientDel, ClientGet, ClientLeave, ClientMsg, ClientNote, ClientPub, ClientSub,
    DataQuery, DelWhat, GetQuery, SeqRange, ServerCtrl, ServerMsg,
};
use serde_json::json;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

struct Client {
    session: Session,
    rx: mpsc::Receiver<ServerMsg>,
    /// Frames set aside while waiting for a specific ctrl.
    pending: VecDeque<ServerMsg>,
    user: String,
}

impl Client {
    async fn send(&mut self, msg: ClientMsg) {
        self.session.dispatch(msg).await;
    }

    /// Next frame, failing the test after two seconds of silence.
    async fn recv(&mut self) -> ServerMsg {
        if let Some(frame) = self.pending.pop_front() {
            return frame;
        }
        tokio::time::timeout(Duration::from_secs(2), self.rx.recv())
            .await
            .expect("timed out waiting for a frame")
            .expect("session queue closed")
    }

    /// Expect silence for a little while.
    async fn recv_nothing(&mut self) {
        assert!(
            self.pending.is_empty(),
            "expected silence, had {:?}",
            self.pending
        );
        let got = tokio::time::timeout(Duration::from_millis(200), self.rx.recv()).await;
        assert!(got.is_err(), "expected silence, got {:?}", got.unwrap());
    }

    /// Read frames until the ctrl answering `id` arrives; returns the
    /// frames that came before it plus the ctrl itself.
    async fn until_ctrl(&mut self, id: &str) -> (Vec<ServerMsg>, ServerCtrl) {
        let mut before = Vec::new();
        loop {
            match self.recv().await {
                ServerMsg::Ctrl(c) if c.id == id => return (before, c),
                other => before.push(other),
            }
        }
    }

    async fn ctrl(&mut self, id: &str) -> ServerCtrl {
        let (before, ctrl) = self.until_ctrl(id).await;
        assert!(before.is_empty(), "unexpected frames before ctrl: {before:?}");
        ctrl
    }

    async fn subscribe(&mut self, topic: &str) -> ServerCtrl {
        self.send(ClientMsg::Sub(ClientSub {
            id: "sub".into(),
            topic: topic.into(),
            ..Default::default()
        }))
        .await;
        let (before, ctrl) = self.until_ctrl("sub").await;
        // Frames racing ahead of the join ctrl stay readable.
        self.pending.extend(before);
        ctrl
    }
}

struct Rig {
    hub: Arc<Hub>,
    auth: Arc<dyn Authenticator>,
    store: Arc<MemStore>,
}

impl Rig {
    fn new() -> Self {
        Self::with_config(EngineConfig::default())
    }

    fn with_config(config: EngineConfig) -> Self {
        let store = Arc::new(MemStore::new());
        let hub = Hub::new(store.clone(), config);
        let auth: Arc<dyn Authenticator> = Arc::new(BasicAuthenticator::new());
        Self { hub, auth, store }
    }

    /// Create an account and a logged-in session for it.
    async fn signup(&self, login: &str) -> Client {
        let (session, rx) = Session::new(self.hub.clone(), self.auth.clone());
        let mut client = Client {
            session,
            rx,
            pending: VecDeque::new(),
            user: String::new(),
        };
        client
            .send(ClientMsg::Acc(ClientAcc {
                id: "acc".into(),
                user: "new".into(),
                scheme: "basic".into(),
                secret: format!("{login}:pw"),
                login: true,
                ..Default::default()
            }))
            .await;
        let ctrl = client.ctrl("acc").await;
        assert_eq!(ctrl.code, codes::CREATED);
        client.user = ctrl.params.unwrap()["user"].as_str().unwrap().to_string();
        client
    }

    /// Another session for an existing account.
    async fn login(&self, login: &str) -> Client {
        let (session, rx) = Session::new(self.hub.clone(), self.auth.clone());
        let mut client = Client {
            session,
            rx,
            pending: VecDeque::new(),
            user: String::new(),
        };
        client
            .send(ClientMsg::Login(banter_proto::ClientLogin {
                id: "login".into(),
                scheme: "basic".into(),
                secret: format!("{login}:pw"),
            }))
            .await;
        let ctrl = client.ctrl("login").await;
        assert_eq!(ctrl.code, codes::OK);
        client.user = ctrl.params.unwrap()["user"].as_str().unwrap().to_string();
        client
    }
}

/// Create a group via `new` and return its real name.
async fn create_group(owner: &mut Client) -> String {
    let ctrl = owner.subscribe("new").await;
    assert_eq!(ctrl.code, codes::CREATED);
    ctrl.params.unwrap()["topic"].as_str().unwrap().to_string()
}

fn pub_msg(id: &str, topic: &str, content: serde_json::Value) -> ClientMsg {
    ClientMsg::Pub(ClientPub {
        id: id.into(),
        topic: topic.into(),
        head: None,
        content,
    })
}

fn get_data(id: &str, topic: &str, since: u64, before: u64) -> ClientMsg {
    ClientMsg::Get(ClientGet {
        id: id.into(),
        topic: topic.into(),
        query: GetQuery {
            what: "data".into(),
            data: Some(DataQuery {
                since: Some(since),
                before: Some(before),
                limit: None,
            }),
            ..Default::default()
        },
    })
}

#[tokio::test]
async fn publish_fans_out_to_readers() {
    let rig = Rig::new();
    let mut a = rig.signup("alice").await;
    let mut b = rig.signup("bob").await;

    let grp = create_group(&mut a).await;
    assert_eq!(b.subscribe(&grp).await.code, codes::CREATED);

    a.send(pub_msg("1", &grp, json!("hello"))).await;
    let (_, ctrl) = a.until_ctrl("1").await;
    assert_eq!(ctrl.code, codes::ACCEPTED);
    assert_eq!(ctrl.params.as_ref().unwrap()["seq"], json!(1));

    match b.recv().await {
        ServerMsg::Data(data) => {
            assert_eq!(data.topic, grp);
            assert_eq!(data.seq, 1);
            assert_eq!(data.from, a.user);
            assert_eq!(data.content, json!("hello"));
        }
        other => panic!("expected data, got {other:?}"),
    }

    // No echo back to the publishing session.
    a.recv_nothing().await;
}

#[tokio::test]
async fn duplicate_join_is_not_modified() {
    let rig = Rig::new();
    let mut a = rig.signup("alice").await;

    let grp = create_group(&mut a).await;
    let ctrl = a.subscribe(&grp).await;
    assert_eq!(ctrl.code, codes::NOT_MODIFIED);
}

#[tokio::test]
async fn read_receipts_are_monotone() {
    let rig = Rig::new();
    let mut a = rig.signup("alice").await;
    let mut b = rig.signup("bob").await;

    let grp = create_group(&mut a).await;
    b.subscribe(&grp).await;

    a.send(pub_msg("1", &grp, json!("hello"))).await;
    a.until_ctrl("1").await;
    let _ = b.recv().await; // the data frame

    b.send(ClientMsg::Note(ClientNote {
        topic: grp.clone(),
        what: "read".into(),
        seq: Some(1),
        ..Default::default()
    }))
    .await;

    match a.recv().await {
        ServerMsg::Info(info) => {
            assert_eq!(info.what, "read");
            assert_eq!(info.seq, Some(1));
            assert_eq!(info.from, b.user);
        }
        other => panic!("expected info, got {other:?}"),
    }

    // Zero and replayed seqs never decrease the cursor, never broadcast.
    for seq in [0, 1] {
        b.send(ClientMsg::Note(ClientNote {
            topic: grp.clone(),
            what: "read".into(),
            seq: Some(seq),
            ..Default::default()
        }))
        .await;
    }
    a.recv_nothing().await;
}

#[tokio::test]
async fn edits_inside_window_broadcast() {
    let rig = Rig::new();
    let mut a = rig.signup("alice").await;
    let mut b = rig.signup("bob").await;

    let grp = create_group(&mut a).await;
    b.subscribe(&grp).await;

    a.send(pub_msg("1", &grp, json!("hallo"))).await;
    a.until_ctrl("1").await;
    let _ = b.recv().await;

    a.send(ClientMsg::Note(ClientNote {
        topic: grp.clone(),
        what: "edit".into(),
        seq: Some(1),
        content: Some(json!("hello")),
        ..Default::default()
    }))
    .await;

    match b.recv().await {
        ServerMsg::Info(info) => {
            assert_eq!(info.what, "edit");
            assert_eq!(info.seq, Some(1));
            assert_eq!(info.content, Some(json!("hello")));
            assert!(info.edited_at.is_some());
        }
        other => panic!("expected info, got {other:?}"),
    }

    // Only the sender may edit; a peer's attempt is dropped silently.
    b.send(ClientMsg::Note(ClientNote {
        topic: grp.clone(),
        what: "edit".into(),
        seq: Some(1),
        content: Some(json!("hijacked")),
        ..Default::default()
    }))
    .await;
    a.recv_nothing().await;
}

#[tokio::test]
async fn hard_delete_leaves_tombstones_for_everyone() {
    let rig = Rig::new();
    let mut a = rig.signup("alice").await;
    let mut b = rig.signup("bob").await;

    let grp = create_group(&mut a).await;
    b.subscribe(&grp).await;

    a.send(pub_msg("1", &grp, json!("one"))).await;
    a.until_ctrl("1").await;
    a.send(pub_msg("2", &grp, json!("two"))).await;
    a.until_ctrl("2").await;
    let _ = b.recv().await;
    let _ = b.recv().await;

    a.send(ClientMsg::Del(ClientDel {
        id: "3".into(),
        topic: grp.clone(),
        what: DelWhat::Msg,
        del_seq: Some(vec![SeqRange::span(1, 2)]),
        hard: true,
    }))
    .await;
    let (_, ctrl) = a.until_ctrl("3").await;
    assert_eq!(ctrl.code, codes::OK);

    // Subscribers hear about the deletion.
    match b.recv().await {
        ServerMsg::Info(info) => assert_eq!(info.what, "del"),
        other => panic!("expected info, got {other:?}"),
    }

    // History returns a tombstone: nil content, deletion marker.
    b.send(get_data("4", &grp, 1, 2)).await;
    let (frames, ctrl) = b.until_ctrl("4").await;
    assert_eq!(ctrl.code, codes::OK);
    assert_eq!(frames.len(), 1);
    match &frames[0] {
        ServerMsg::Data(data) => {
            assert_eq!(data.seq, 1);
            assert_eq!(data.content, json!(null));
            assert_eq!(data.head.as_ref().unwrap().deleted, Some(true));
        }
        other => panic!("expected data, got {other:?}"),
    }
}

#[tokio::test]
async fn p2p_topics_are_canonicalized_with_presence() {
    let rig = Rig::new();
    let mut a = rig.signup("alice").await;
    let mut c = rig.signup("carol").await;

    // Both watch their own `me` feeds.
    assert_eq!(a.subscribe("me").await.code, codes::CREATED);
    assert_eq!(c.subscribe("me").await.code, codes::CREATED);

    // Carol opens a conversation by Alice's user tag.
    let a_tag = a.user.clone();
    let ctrl = c.subscribe(&a_tag).await;
    assert_eq!(ctrl.code, codes::OK);
    assert_eq!(ctrl.params.as_ref().unwrap()["topic"], json!(a_tag));

    // Alice learns Carol is online...
    match a.recv().await {
        ServerMsg::Pres(pres) => {
            assert_eq!(pres.topic, "me");
            assert_eq!(pres.src, c.user);
            assert_eq!(pres.what, "on");
        }
        other => panic!("expected pres, got {other:?}"),
    }
    // ...and Alice's online state is echoed back to Carol.
    match c.recv().await {
        ServerMsg::Pres(pres) => {
            assert_eq!(pres.topic, "me");
            assert_eq!(pres.src, a_tag);
            assert_eq!(pres.what, "on");
        }
        other => panic!("expected pres, got {other:?}"),
    }

    // Alice addresses the same conversation by Carol's tag; the canonical
    // pair topic already exists, so this is a plain join.
    let c_tag = c.user.clone();
    let ctrl = a.subscribe(&c_tag).await;
    assert_eq!(ctrl.code, codes::OK);

    // Messages flow between the two names.
    a.send(pub_msg("5", &c_tag, json!("hi carol"))).await;
    let (_, ctrl) = a.until_ctrl("5").await;
    assert_eq!(ctrl.code, codes::ACCEPTED);
    loop {
        match c.recv().await {
            ServerMsg::Data(data) => {
                assert_eq!(data.topic, a_tag, "p2p frames carry the peer's name");
                assert_eq!(data.content, json!("hi carol"));
                break;
            }
            // Presence may still trickle in ahead of the data frame.
            ServerMsg::Pres(_) => continue,
            other => panic!("expected data, got {other:?}"),
        }
    }
}

#[tokio::test]
async fn self_p2p_is_rejected() {
    let rig = Rig::new();
    let mut a = rig.signup("alice").await;
    let tag = a.user.clone();

    a.send(ClientMsg::Sub(ClientSub {
        id: "1".into(),
        topic: tag,
        ..Default::default()
    }))
    .await;
    let ctrl = a.ctrl("1").await;
    assert_eq!(ctrl.code, codes::UNPROCESSABLE);
}

#[tokio::test]
async fn delivery_order_matches_seq_order_for_all_receivers() {
    let rig = Rig::new();
    let mut a = rig.signup("alice").await;
    let mut b = rig.signup("bob").await;
    let mut c = rig.signup("carol").await;

    let grp = create_group(&mut a).await;
    b.subscribe(&grp).await;
    c.subscribe(&grp).await;

    for i in 1..=5u64 {
        a.send(pub_msg(&i.to_string(), &grp, json!(i))).await;
        let (_, ctrl) = a.until_ctrl(&i.to_string()).await;
        assert_eq!(ctrl.params.as_ref().unwrap()["seq"], json!(i));
    }

    for client in [&mut b, &mut c] {
        for expect in 1..=5u64 {
            match client.recv().await {
                ServerMsg::Data(data) => assert_eq!(data.seq, expect),
                other => panic!("expected data, got {other:?}"),
            }
        }
    }
}

#[tokio::test]
async fn soft_delete_is_invisible_to_others() {
    let rig = Rig::new();
    let mut a = rig.signup("alice").await;
    let mut b = rig.signup("bob").await;

    let grp = create_group(&mut a).await;
    b.subscribe(&grp).await;

    for i in 1..=3u64 {
        a.send(pub_msg(&i.to_string(), &grp, json!(i))).await;
        a.until_ctrl(&i.to_string()).await;
        let _ = b.recv().await;
    }

    // Bob hides seq 2 for himself.
    b.send(ClientMsg::Del(ClientDel {
        id: "del".into(),
        topic: grp.clone(),
        what: DelWhat::Msg,
        del_seq: Some(vec![SeqRange::one(2)]),
        hard: false,
    }))
    .await;
    assert_eq!(b.ctrl("del").await.code, codes::OK);

    b.send(get_data("g1", &grp, 1, 10)).await;
    let (frames, _) = b.until_ctrl("g1").await;
    let seqs: Vec<u64> = frames
        .iter()
        .map(|f| match f {
            ServerMsg::Data(d) => d.seq,
            other => panic!("expected data, got {other:?}"),
        })
        .collect();
    assert_eq!(seqs, vec![1, 3]);

    // Alice still sees everything.
    a.send(get_data("g2", &grp, 1, 10)).await;
    let (frames, _) = a.until_ctrl("g2").await;
    assert_eq!(frames.len(), 3);
}

#[tokio::test]
async fn failed_persistence_rolls_back_the_seq() {
    let rig = Rig::new();
    let mut a = rig.signup("alice").await;
    let mut b = rig.signup("bob").await;

    let grp = create_group(&mut a).await;
    b.subscribe(&grp).await;

    a.send(pub_msg("1", &grp, json!("first"))).await;
    a.until_ctrl("1").await;
    let _ = b.recv().await;

    rig.store.inject_save_failure();
    a.send(pub_msg("2", &grp, json!("lost"))).await;
    let (_, ctrl) = a.until_ctrl("2").await;
    assert_eq!(ctrl.code, codes::INTERNAL);
    b.recv_nothing().await;

    // The failed allocation leaves no hole.
    a.send(pub_msg("3", &grp, json!("second"))).await;
    let (_, ctrl) = a.until_ctrl("3").await;
    assert_eq!(ctrl.code, codes::ACCEPTED);
    assert_eq!(ctrl.params.as_ref().unwrap()["seq"], json!(2));

    match b.recv().await {
        ServerMsg::Data(data) => assert_eq!(data.seq, 2),
        other => panic!("expected data, got {other:?}"),
    }

    b.send(get_data("g", &grp, 1, 100)).await;
    let (frames, _) = b.until_ctrl("g").await;
    assert_eq!(frames.len(), 2);
}

#[tokio::test]
async fn unsubscribe_removes_the_subscription() {
    let rig = Rig::new();
    let mut a = rig.signup("alice").await;
    let mut b = rig.signup("bob").await;

    let grp = create_group(&mut a).await;
    b.subscribe(&grp).await;

    b.send(ClientMsg::Leave(ClientLeave {
        id: "1".into(),
        topic: grp.clone(),
        unsub: true,
    }))
    .await;
    assert_eq!(b.ctrl("1").await.code, codes::OK);

    // Re-joining starts from scratch: a fresh subscription record.
    let ctrl = b.subscribe(&grp).await;
    assert_eq!(ctrl.code, codes::CREATED);
}

#[tokio::test]
async fn slow_session_is_kicked_not_the_topic() {
    let mut config = EngineConfig::default();
    config.session_queue_depth = 8;
    config.send_deadline_ms = 50;
    let rig = Rig::with_config(config);

    let mut a = rig.signup("alice").await;
    let mut b = rig.signup("bob").await;

    let grp = create_group(&mut a).await;
    b.subscribe(&grp).await;
    let b_handle = b.session.handle();

    // Bob never drains his queue; eventually the topic declares him slow.
    for i in 1..=12u64 {
        a.send(pub_msg(&i.to_string(), &grp, json!(i))).await;
        let (_, ctrl) = a.until_ctrl(&i.to_string()).await;
        assert_eq!(ctrl.code, codes::ACCEPTED, "publisher must stay healthy");
    }

    assert!(b_handle.is_kicked(), "slow receiver should have been kicked");
}

#[tokio::test]
async fn multi_device_sessions_share_cursors() {
    let rig = Rig::new();
    let mut a = rig.signup("alice").await;
    let mut b1 = rig.signup("bob").await;
    let mut b2 = rig.login("bob").await;

    let grp = create_group(&mut a).await;
    b1.subscribe(&grp).await;
    b2.subscribe(&grp).await;

    a.send(pub_msg("1", &grp, json!("hello"))).await;
    a.until_ctrl("1").await;
    let _ = b1.recv().await;
    let _ = b2.recv().await;

    // A receipt from one device reaches the other (and Alice).
    b1.send(ClientMsg::Note(ClientNote {
        topic: grp.clone(),
        what: "read".into(),
        seq: Some(1),
        ..Default::default()
    }))
    .await;

    for client in [&mut a, &mut b2] {
        match client.recv().await {
            ServerMsg::Info(info) => {
                assert_eq!(info.what, "read");
                assert_eq!(info.seq, Some(1));
            }
            other => panic!("expected info, got {other:?}"),
        }
    }
}

#[tokio::test]
async fn reactions_toggle_and_broadcast() {
    let rig = Rig::new();
    let mut a = rig.signup("alice").await;
    let mut b = rig.signup("bob").await;

    let grp = create_group(&mut a).await;
    b.subscribe(&grp).await;

    a.send(pub_msg("1", &grp, json!("hello"))).await;
    a.until_ctrl("1").await;
    let _ = b.recv().await;

    b.send(ClientMsg::Note(ClientNote {
        topic: grp.clone(),
        what: "react".into(),
        seq: Some(1),
        reaction: Some("+1".into()),
        ..Default::default()
    }))
    .await;

    match a.recv().await {
        ServerMsg::Info(info) => {
            assert_eq!(info.what, "react");
            assert_eq!(info.reaction.as_deref(), Some("+1"));
            assert_eq!(info.from, b.user);
        }
        other => panic!("expected info, got {other:?}"),
    }

    // History now carries the reaction in the header.
    b.send(get_data("g", &grp, 1, 2)).await;
    let (frames, _) = b.until_ctrl("g").await;
    match &frames[0] {
        ServerMsg::Data(data) => {
            let reactions = data.head.as_ref().unwrap().reactions.as_ref().unwrap();
            assert_eq!(reactions["+1"], vec![b.user.clone()]);
        }
        other => panic!("expected data, got {other:?}"),
    }
}

#[tokio::test]
async fn typing_notifications_are_rate_limited() {
    let rig = Rig::new();
    let mut a = rig.signup("alice").await;
    let mut b = rig.signup("bob").await;

    let grp = create_group(&mut a).await;
    b.subscribe(&grp).await;

    for _ in 0..5 {
        a.send(ClientMsg::Note(ClientNote {
            topic: grp.clone(),
            what: "kp".into(),
            ..Default::default()
        }))
        .await;
    }

    // Only the first one inside the rate window gets through.
    match b.recv().await {
        ServerMsg::Info(info) => assert_eq!(info.what, "kp"),
        other => panic!("expected info, got {other:?}"),
    }
    b.recv_nothing().await;
}

#[tokio::test]
async fn session_close_flips_presence_off() {
    let rig = Rig::new();
    let mut a = rig.signup("alice").await;
    let mut c = rig.signup("carol").await;

    a.subscribe("me").await;
    c.subscribe("me").await;

    let a_tag = a.user.clone();
    c.subscribe(&a_tag).await;
    let _ = a.recv().await; // carol on
    let _ = c.recv().await; // alice on (echo)

    // Carol's only session goes away without a leave.
    c.session.close().await;

    match a.recv().await {
        ServerMsg::Pres(pres) => {
            assert_eq!(pres.src, c.user);
            assert_eq!(pres.what, "off");
        }
        other => panic!("expected pres, got {other:?}"),
    }
}

#[tokio::test]
async fn me_topic_rejects_publishes() {
    let rig = Rig::new();
    let mut a = rig.signup("alice").await;
    a.subscribe("me").await;

    a.send(pub_msg("1", "me", json!("nope"))).await;
    let (_, ctrl) = a.until_ctrl("1").await;
    assert_eq!(ctrl.code, codes::NOT_ALLOWED);
}

#[tokio::test]
async fn fnd_finds_users_by_tag() {
    let rig = Rig::new();
    let mut a = rig.signup("alice").await;
    let mut b = rig.signup("bob").await;

    // Bob advertises a tag on his `me` topic.
    b.subscribe("me").await;
    b.send(ClientMsg::Set(banter_proto::ClientSet {
        id: "1".into(),
        topic: "me".into(),
        tags: Some(vec!["rustaceans".into()]),
        ..Default::default()
    }))
    .await;
    assert_eq!(b.ctrl("1").await.code, codes::OK);

    // Alice stores a query and reads the matches.
    a.subscribe("fnd").await;
    a.send(ClientMsg::Set(banter_proto::ClientSet {
        id: "2".into(),
        topic: "fnd".into(),
        desc: Some(banter_proto::SetDesc {
            public: Some(json!("rustaceans")),
            ..Default::default()
        }),
        ..Default::default()
    }))
    .await;
    assert_eq!(a.ctrl("2").await.code, codes::OK);

    a.send(ClientMsg::Get(ClientGet {
        id: "3".into(),
        topic: "fnd".into(),
        query: GetQuery {
            what: "sub".into(),
            ..Default::default()
        },
    }))
    .await;
    let (frames, ctrl) = a.until_ctrl("3").await;
    assert_eq!(ctrl.code, codes::OK);
    match &frames[0] {
        ServerMsg::Meta(meta) => {
            let subs = meta.sub.as_ref().unwrap();
            assert_eq!(subs.len(), 1);
            assert_eq!(subs[0].user.as_deref(), Some(b.user.as_str()));
        }
        other => panic!("expected meta, got {other:?}"),
    }
}
