//! # banter-proto
//!
//! Wire protocol definitions for the banter messaging engine.
//!
//! This crate defines the JSON envelope format exchanged between banter
//! clients and servers: verb payloads, the codec, and versioning.
//!
//! ## Envelopes
//!
//! Client to server: `hi`, `acc`, `login`, `sub`, `leave`, `pub`, `get`,
//! `set`, `del`, `note`. Server to client: `ctrl`, `data`, `meta`, `pres`,
//! `info`. Every envelope is a JSON object with exactly one top-level
//! field naming the verb.
//!
//! ## Example
//!
//! ```rust
//! use banter_proto::{codec, ClientMsg, ClientPub};
//!
//! let msg = ClientMsg::Pub(ClientPub {
//!     id: "1".into(),
//!     topic: "grpBookClub".into(),
//!     head: None,
//!     content: serde_json::json!("hello"),
//! });
//!
//! let encoded = codec::encode_client(&msg).unwrap();
//! let decoded = codec::decode(&encoded).unwrap();
//! assert_eq!(msg, decoded);
//! ```

pub mod codec;
pub mod envelope;
pub mod head;
pub mod version;

pub use codec::{decode, decode_from, encode, ProtocolError, MAX_ENVELOPE_SIZE};
pub use envelope::{
    AcsDesc, ClientAcc, ClientDel, ClientGet, ClientHi, ClientLeave, ClientLogin, ClientMsg,
    ClientNote, ClientPub, ClientSet, ClientSub, DataQuery, DefaultAcs, DelMeta, DelWhat,
    DescQuery, GetQuery, SeqRange, ServerCtrl, ServerData, ServerInfo, ServerMeta, ServerMsg,
    ServerPres, SetDesc, SetSub, SubQuery, TopicDesc, TopicSub,
};
pub use head::MessageHead;
pub use version::{Version, PROTOCOL_VERSION};
