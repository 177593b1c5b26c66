//! Envelope types for the banter wire protocol.
//!
//! Every envelope is a JSON object with exactly one top-level field naming
//! the verb. Client requests carry a string `id` that the server echoes in
//! the answering `ctrl`; an empty `id` on a server message means
//! "unsolicited". Serde's externally-tagged enum representation produces
//! this shape directly.

use crate::head::MessageHead;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

fn str_is_empty(s: &String) -> bool {
    s.is_empty()
}

fn is_false(b: &bool) -> bool {
    !*b
}

/// A client-to-server envelope.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ClientMsg {
    /// Handshake: version and user-agent.
    Hi(ClientHi),
    /// Create or update an account.
    Acc(ClientAcc),
    /// Authenticate the session.
    Login(ClientLogin),
    /// Subscribe to (or create) a topic.
    Sub(ClientSub),
    /// Detach from a topic, optionally deleting the subscription.
    Leave(ClientLeave),
    /// Publish a message to a topic.
    #[serde(rename = "pub")]
    Pub(ClientPub),
    /// Query topic metadata or message history.
    Get(ClientGet),
    /// Update topic metadata, subscription modes, or tags.
    Set(ClientSet),
    /// Delete messages, a subscription, or the topic itself.
    Del(ClientDel),
    /// Ephemeral signal: typing, receipts, edits, reactions.
    Note(ClientNote),
}

impl ClientMsg {
    /// The request id, empty if the client did not set one.
    ///
    /// `note` envelopes never carry an id: they are not acknowledged.
    #[must_use]
    pub fn id(&self) -> &str {
        match self {
            ClientMsg::Hi(m) => &m.id,
            ClientMsg::Acc(m) => &m.id,
            ClientMsg::Login(m) => &m.id,
            ClientMsg::Sub(m) => &m.id,
            ClientMsg::Leave(m) => &m.id,
            ClientMsg::Pub(m) => &m.id,
            ClientMsg::Get(m) => &m.id,
            ClientMsg::Set(m) => &m.id,
            ClientMsg::Del(m) => &m.id,
            ClientMsg::Note(_) => "",
        }
    }

    /// The target topic, if the verb addresses one.
    #[must_use]
    pub fn topic(&self) -> Option<&str> {
        match self {
            ClientMsg::Hi(_) | ClientMsg::Acc(_) | ClientMsg::Login(_) => None,
            ClientMsg::Sub(m) => Some(&m.topic),
            ClientMsg::Leave(m) => Some(&m.topic),
            ClientMsg::Pub(m) => Some(&m.topic),
            ClientMsg::Get(m) => Some(&m.topic),
            ClientMsg::Set(m) => Some(&m.topic),
            ClientMsg::Del(m) => Some(&m.topic),
            ClientMsg::Note(m) => Some(&m.topic),
        }
    }
}

/// `{hi}` - handshake.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ClientHi {
    #[serde(default, skip_serializing_if = "str_is_empty")]
    pub id: String,
    /// Protocol version, `"major.minor"`.
    pub ver: String,
    /// Free-form user agent.
    #[serde(default, skip_serializing_if = "str_is_empty")]
    pub ua: String,
}

/// `{acc}` - account create or update.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ClientAcc {
    #[serde(default, skip_serializing_if = "str_is_empty")]
    pub id: String,
    /// `"new"` to create an account, or an existing user tag to update.
    #[serde(default, skip_serializing_if = "str_is_empty")]
    pub user: String,
    /// Authentication scheme the secret belongs to.
    pub scheme: String,
    /// Scheme-specific secret.
    pub secret: String,
    /// Authenticate this session as the new account on success.
    #[serde(default, skip_serializing_if = "is_false")]
    pub login: bool,
    /// Discovery tags.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tags: Option<Vec<String>>,
    /// Initial descriptors and default access.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub desc: Option<SetDesc>,
}

/// `{login}` - authenticate.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ClientLogin {
    #[serde(default, skip_serializing_if = "str_is_empty")]
    pub id: String,
    pub scheme: String,
    pub secret: String,
}

/// `{sub}` - subscribe to or create a topic.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ClientSub {
    #[serde(default, skip_serializing_if = "str_is_empty")]
    pub id: String,
    /// `me`, `fnd`, `usr<tag>`, `grp<tag>`, or `new`.
    pub topic: String,
    /// Requested access mode, e.g. `"JRWP"`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mode: Option<String>,
    /// Initial descriptors when creating a topic.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub desc: Option<SetDesc>,
    /// Metadata query answered inline with the join.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub get: Option<GetQuery>,
}

/// `{leave}` - detach from a topic.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ClientLeave {
    #[serde(default, skip_serializing_if = "str_is_empty")]
    pub id: String,
    pub topic: String,
    /// Also delete the subscription record.
    #[serde(default, skip_serializing_if = "is_false")]
    pub unsub: bool,
}

/// `{pub}` - publish a message.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ClientPub {
    #[serde(default, skip_serializing_if = "str_is_empty")]
    pub id: String,
    pub topic: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub head: Option<MessageHead>,
    /// Opaque payload; the engine never interprets it.
    #[serde(default)]
    pub content: Value,
}

/// `{get}` - query metadata or history.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ClientGet {
    #[serde(default, skip_serializing_if = "str_is_empty")]
    pub id: String,
    pub topic: String,
    #[serde(flatten)]
    pub query: GetQuery,
}

/// What a `get` wants, with per-kind options.
///
/// `what` is a space-separated list of `desc`, `sub`, `data`, `tags`, `del`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GetQuery {
    #[serde(default, skip_serializing_if = "str_is_empty")]
    pub what: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub desc: Option<DescQuery>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sub: Option<SubQuery>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<DataQuery>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub del: Option<DataQuery>,
}

impl GetQuery {
    /// Iterate the requested kinds in request order.
    pub fn kinds(&self) -> impl Iterator<Item = &str> {
        self.what.split_ascii_whitespace()
    }
}

/// Options for `get desc`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DescQuery {
    /// Skip the reply if the descriptor is older, ms since epoch.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub if_modified_since: Option<u64>,
}

/// Options for `get sub`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SubQuery {
    /// Restrict to a single user.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub limit: Option<usize>,
}

/// Seq range selector for `get data` / `get del`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct DataQuery {
    /// Lowest seq to return, inclusive.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub since: Option<u64>,
    /// Upper bound, exclusive.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub before: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub limit: Option<usize>,
}

/// `{set}` - mutate metadata.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ClientSet {
    #[serde(default, skip_serializing_if = "str_is_empty")]
    pub id: String,
    pub topic: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub desc: Option<SetDesc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sub: Option<SetSub>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tags: Option<Vec<String>>,
}

/// Descriptor mutation: default access and public/private payloads.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SetDesc {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub defacs: Option<DefaultAcs>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub public: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub private: Option<Value>,
}

/// Default access modes for authenticated and anonymous users.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DefaultAcs {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub auth: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub anon: Option<String>,
}

/// Subscription mutation: own `want`, or `given` for another user.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SetSub {
    /// Target user; absent means the caller's own subscription.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mode: Option<String>,
}

/// What a `del` removes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DelWhat {
    Msg,
    Topic,
    Sub,
}

/// `{del}` - delete messages, the subscription, or the topic.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClientDel {
    #[serde(default, skip_serializing_if = "str_is_empty")]
    pub id: String,
    pub topic: String,
    pub what: DelWhat,
    /// Ranges of seqs to delete; required for `what=msg`.
    #[serde(rename = "delseq", skip_serializing_if = "Option::is_none")]
    pub del_seq: Option<Vec<SeqRange>>,
    /// Tombstone for everyone instead of hiding for the caller.
    #[serde(default, skip_serializing_if = "is_false")]
    pub hard: bool,
}

/// A contiguous seq range, `low..hi` exclusive; `hi` absent selects `low` alone.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SeqRange {
    pub low: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hi: Option<u64>,
}

impl SeqRange {
    /// Single-seq range.
    #[must_use]
    pub fn one(seq: u64) -> Self {
        Self { low: seq, hi: None }
    }

    /// Range `low..hi` exclusive.
    #[must_use]
    pub fn span(low: u64, hi: u64) -> Self {
        Self { low, hi: Some(hi) }
    }

    /// Whether `seq` falls inside the range.
    #[must_use]
    pub fn contains(&self, seq: u64) -> bool {
        match self.hi {
            Some(hi) => self.low <= seq && seq < hi,
            None => seq == self.low,
        }
    }

    /// Upper bound, exclusive.
    #[must_use]
    pub fn upper(&self) -> u64 {
        self.hi.unwrap_or(self.low + 1)
    }
}

/// `{note}` - ephemeral signal. Never acknowledged, dropped on failure.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ClientNote {
    pub topic: String,
    /// `kp`, `recv`, `read`, `edit`, `unsend`, `react`, or an extension verb.
    pub what: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub seq: Option<u64>,
    /// Reaction token for `what=react`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reaction: Option<String>,
    /// Replacement content for `what=edit`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content: Option<Value>,
}

/// A server-to-client envelope.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ServerMsg {
    /// Answer to a client request.
    Ctrl(ServerCtrl),
    /// A published message, fanned out to readers.
    Data(ServerData),
    /// Metadata reply to a `get` or inline `sub` query.
    Meta(ServerMeta),
    /// Presence notification.
    Pres(ServerPres),
    /// Ephemeral signal relayed from a peer.
    Info(ServerInfo),
}

/// `{ctrl}` - request acknowledgment with an HTTP-like code.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ServerCtrl {
    /// Echo of the request id; empty means unsolicited.
    #[serde(default, skip_serializing_if = "str_is_empty")]
    pub id: String,
    #[serde(default, skip_serializing_if = "str_is_empty")]
    pub topic: String,
    pub code: u16,
    pub text: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<BTreeMap<String, Value>>,
    /// Server timestamp, ms since epoch.
    pub ts: u64,
}

/// `{data}` - a message delivered to a subscriber.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ServerData {
    pub topic: String,
    /// Sender's user tag; empty for server-originated data.
    #[serde(default, skip_serializing_if = "str_is_empty")]
    pub from: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub head: Option<MessageHead>,
    pub seq: u64,
    pub ts: u64,
    #[serde(default)]
    pub content: Value,
}

/// `{meta}` - topic metadata.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ServerMeta {
    #[serde(default, skip_serializing_if = "str_is_empty")]
    pub id: String,
    pub topic: String,
    pub ts: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub desc: Option<TopicDesc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sub: Option<Vec<TopicSub>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tags: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub del: Option<DelMeta>,
}

/// Topic descriptor as reported in `meta`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TopicDesc {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub created: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub updated: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub touched: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub defacs: Option<DefaultAcs>,
    /// Caller's access on the topic.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub acs: Option<AcsDesc>,
    /// Highest seq assigned so far.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub seq: Option<u64>,
    /// All seqs at or below are deleted.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub clear: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub read: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub recv: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub public: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub private: Option<Value>,
}

/// Want/given/effective access triplet, string-encoded.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AcsDesc {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub want: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub given: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mode: Option<String>,
}

/// One subscription row in `meta sub`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TopicSub {
    /// Subscriber's user tag (when listing a topic's subscribers).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user: Option<String>,
    /// Topic name (when listing a user's subscriptions from `me`).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub topic: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub updated: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub acs: Option<AcsDesc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub read: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub recv: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub clear: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub public: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub private: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub online: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub seq: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub touched: Option<u64>,
}

/// Deletion transcript in `meta del`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DelMeta {
    pub clear: u64,
    #[serde(rename = "delseq", skip_serializing_if = "Option::is_none")]
    pub del_seq: Option<Vec<SeqRange>>,
}

/// `{pres}` - presence notification.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ServerPres {
    /// Topic the notification is delivered on (usually `me`).
    pub topic: String,
    /// Topic or user the notification is about.
    pub src: String,
    /// `on`, `off`, `upd`, `gone`, or an extension.
    pub what: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub seq: Option<u64>,
}

/// `{info}` - relayed ephemeral signal.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ServerInfo {
    pub topic: String,
    /// Originating user's tag.
    pub from: String,
    pub what: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub seq: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reaction: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content: Option<Value>,
    /// Server edit timestamp for `what=edit`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub edited_at: Option<u64>,
}

impl ServerMsg {
    /// Create a `ctrl` response.
    #[must_use]
    pub fn ctrl(id: impl Into<String>, topic: impl Into<String>, code: u16, text: impl Into<String>, ts: u64) -> Self {
        ServerMsg::Ctrl(ServerCtrl {
            id: id.into(),
            topic: topic.into(),
            code,
            text: text.into(),
            params: None,
            ts,
        })
    }

    /// Create a `ctrl` response with parameters.
    #[must_use]
    pub fn ctrl_params(
        id: impl Into<String>,
        topic: impl Into<String>,
        code: u16,
        text: impl Into<String>,
        params: BTreeMap<String, Value>,
        ts: u64,
    ) -> Self {
        ServerMsg::Ctrl(ServerCtrl {
            id: id.into(),
            topic: topic.into(),
            code,
            text: text.into(),
            params: Some(params),
            ts,
        })
    }

    /// Create a `pres` notification.
    #[must_use]
    pub fn pres(topic: impl Into<String>, src: impl Into<String>, what: impl Into<String>) -> Self {
        ServerMsg::Pres(ServerPres {
            topic: topic.into(),
            src: src.into(),
            what: what.into(),
            seq: None,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_client_msg_single_verb_field() {
        let msg = ClientMsg::Pub(ClientPub {
            id: "1".into(),
            topic: "grpX".into(),
            head: None,
            content: json!("hello"),
        });

        let v = serde_json::to_value(&msg).unwrap();
        let obj = v.as_object().unwrap();
        assert_eq!(obj.len(), 1);
        assert_eq!(obj["pub"]["topic"], "grpX");
        assert_eq!(obj["pub"]["content"], "hello");
    }

    #[test]
    fn test_client_msg_decode() {
        let msg: ClientMsg =
            serde_json::from_str(r#"{"sub":{"id":"2","topic":"grpX","mode":"JRWP"}}"#).unwrap();

        match msg {
            ClientMsg::Sub(sub) => {
                assert_eq!(sub.id, "2");
                assert_eq!(sub.topic, "grpX");
                assert_eq!(sub.mode.as_deref(), Some("JRWP"));
            }
            other => panic!("expected sub, got {other:?}"),
        }
    }

    #[test]
    fn test_note_has_no_id() {
        let msg: ClientMsg =
            serde_json::from_str(r#"{"note":{"topic":"grpX","what":"read","seq":4}}"#).unwrap();
        assert_eq!(msg.id(), "");
        assert_eq!(msg.topic(), Some("grpX"));
    }

    #[test]
    fn test_del_seq_ranges() {
        let msg: ClientMsg = serde_json::from_str(
            r#"{"del":{"id":"5","topic":"grpX","what":"msg","delseq":[{"low":1,"hi":3},{"low":7}],"hard":true}}"#,
        )
        .unwrap();

        let ClientMsg::Del(del) = msg else {
            panic!("expected del");
        };
        assert_eq!(del.what, DelWhat::Msg);
        assert!(del.hard);
        let ranges = del.del_seq.unwrap();
        assert!(ranges[0].contains(1) && ranges[0].contains(2) && !ranges[0].contains(3));
        assert!(ranges[1].contains(7) && !ranges[1].contains(8));
    }

    #[test]
    fn test_ctrl_skips_empty_id() {
        let ctrl = ServerMsg::ctrl("", "grpX", 200, "ok", 1);
        let v = serde_json::to_value(&ctrl).unwrap();
        assert!(v["ctrl"].get("id").is_none());

        let ctrl = ServerMsg::ctrl("9", "grpX", 200, "ok", 1);
        let v = serde_json::to_value(&ctrl).unwrap();
        assert_eq!(v["ctrl"]["id"], "9");
    }

    #[test]
    fn test_get_query_flattens() {
        let msg: ClientMsg = serde_json::from_str(
            r#"{"get":{"id":"3","topic":"grpX","what":"desc data","data":{"since":1,"before":10,"limit":5}}}"#,
        )
        .unwrap();

        let ClientMsg::Get(get) = msg else {
            panic!("expected get");
        };
        let kinds: Vec<_> = get.query.kinds().collect();
        assert_eq!(kinds, vec!["desc", "data"]);
        assert_eq!(get.query.data.unwrap().limit, Some(5));
    }

    #[test]
    fn test_server_data_roundtrip() {
        let data = ServerMsg::Data(ServerData {
            topic: "grpX".into(),
            from: "usrA".into(),
            head: None,
            seq: 1,
            ts: 1000,
            content: json!({"txt": "hello"}),
        });

        let encoded = serde_json::to_string(&data).unwrap();
        let decoded: ServerMsg = serde_json::from_str(&encoded).unwrap();
        assert_eq!(data, decoded);
    }
}
