//! # banter-core
//!
//! The engine behind the banter messaging service: topic actors,
//! sessions, the hub, and the subsystems they lean on.
//!
//! - **Topic** - actor owning one topic's subscriptions, seq counter,
//!   and presence; serializes every mutation through its inbox
//! - **Session** - per-connection state machine bridging a transport to
//!   the hub
//! - **Hub** - process-wide registry that spawns and prunes topic actors
//! - **Store** - narrow persistence traits with an in-memory adapter
//! - **Access** - JRWPASDO capability masks and grant negotiation
//! - **Presence** - online-state propagation through `me` topics
//!
//! ## Architecture
//!
//! ```text
//! ┌───────────┐ envelopes ┌───────────┐  commands   ┌───────────┐
//! │ Transport │──────────▶│  Session  │────────────▶│   Topic   │
//! └───────────┘           └───────────┘   via Hub   └─────┬─────┘
//!       ▲                       ▲                         │
//!       │      outbound queue   │   data / pres / info    │
//!       └───────────────────────┴─────────────────────────┘
//! ```
//!
//! Each topic is a single task; there is no shared mutable state between
//! topics, and the hub map is the only process-wide structure.

pub mod access;
pub mod auth;
pub mod error;
pub mod hub;
pub mod message;
pub mod presence;
pub mod session;
pub mod store;
pub mod topic;
pub mod types;

pub use access::AccessMode;
pub use auth::{AuthCtx, AuthLevel, Authenticator, BasicAuthenticator};
pub use error::{codes, EngineError, StoreError};
pub use hub::{EngineConfig, Hub};
pub use message::EditPolicy;
pub use presence::{PresenceEvent, PresenceWhat};
pub use session::{Session, SessionHandle};
pub use store::{mem::MemStore, SharedStore, Store, StoredMessage, Subscription, TopicRec, User};
pub use topic::{TopicHandle, TopicState};
pub use types::{resolve_topic_name, TopicAddr, TopicCat, Uid};
