//! Core identifier types and the topic name grammar.
//!
//! Topics are addressed by clients as `me`, `fnd`, `usr<tag>`, `grp<tag>`,
//! or `new`; the engine routes on canonical names where `me`/`fnd` are
//! qualified by the owning user and `usr<tag>` collapses to a sorted
//! `p2p<a-b>` pair.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

/// Maximum length of a client-supplied topic name.
pub const MAX_TOPIC_NAME_LENGTH: usize = 128;

/// Current wall clock, milliseconds since the Unix epoch.
#[must_use]
pub fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap()
        .as_millis() as u64
}

/// Atomic counter for ensuring unique ids even within the same millisecond.
static UID_COUNTER: AtomicU64 = AtomicU64::new(0);

fn next_unique() -> u64 {
    let timestamp = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap()
        .as_millis() as u64;
    let counter = UID_COUNTER.fetch_add(1, Ordering::Relaxed);
    (timestamp << 16) | (counter & 0xFFFF)
}

/// An opaque 64-bit user id.
///
/// Rendered on the wire as a short `usr`-prefixed hex tag. Zero is the
/// "no user" sentinel and never names a real account.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct Uid(u64);

impl Uid {
    /// The "no user" sentinel.
    pub const ZERO: Uid = Uid(0);

    #[must_use]
    pub const fn from_raw(v: u64) -> Self {
        Self(v)
    }

    #[must_use]
    pub const fn raw(self) -> u64 {
        self.0
    }

    #[must_use]
    pub fn is_zero(self) -> bool {
        self.0 == 0
    }

    /// Generate a new unique id.
    ///
    /// Combines the millisecond clock with an atomic counter so ids stay
    /// unique within a process even under bursts.
    #[must_use]
    pub fn generate() -> Self {
        Self(next_unique())
    }

    /// Wire tag: `usr` followed by lowercase hex.
    #[must_use]
    pub fn as_tag(self) -> String {
        format!("usr{:x}", self.0)
    }

    /// Bare hex form without the `usr` prefix, used inside routing names.
    #[must_use]
    pub fn as_hex(self) -> String {
        format!("{:x}", self.0)
    }

    /// Parse a `usr<hex>` tag.
    #[must_use]
    pub fn from_tag(tag: &str) -> Option<Self> {
        let hex = tag.strip_prefix("usr")?;
        Self::from_hex(hex)
    }

    /// Parse a bare hex form.
    #[must_use]
    pub fn from_hex(hex: &str) -> Option<Self> {
        if hex.is_empty() || hex.len() > 16 {
            return None;
        }
        u64::from_str_radix(hex, 16)
            .ok()
            .map(Self)
            .filter(|u| !u.is_zero())
    }
}

impl fmt::Display for Uid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "usr{:x}", self.0)
    }
}

/// The four topic variants.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TopicCat {
    /// A user's own topic: presence and subscription feed.
    Me,
    /// Per-user search endpoint.
    Fnd,
    /// Implicit two-party topic named by the sorted pair of user ids.
    P2P,
    /// N-party named topic with an owner.
    Grp,
}

impl TopicCat {
    /// Category of a canonical routing name.
    #[must_use]
    pub fn of(routing: &str) -> Option<TopicCat> {
        if routing.starts_with("usr") {
            Some(TopicCat::Me)
        } else if routing.starts_with("fnd") {
            Some(TopicCat::Fnd)
        } else if routing.starts_with("p2p") {
            Some(TopicCat::P2P)
        } else if routing.starts_with("grp") {
            Some(TopicCat::Grp)
        } else {
            None
        }
    }
}

impl fmt::Display for TopicCat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            TopicCat::Me => "me",
            TopicCat::Fnd => "fnd",
            TopicCat::P2P => "p2p",
            TopicCat::Grp => "grp",
        };
        f.write_str(s)
    }
}

/// A resolved topic address.
///
/// `routing` is the canonical hub key; `client_name` is what the caller
/// used and what server frames addressed to this caller should echo.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TopicAddr {
    pub cat: TopicCat,
    pub routing: String,
    pub client_name: String,
    /// The other party for p2p topics.
    pub p2p_peer: Option<Uid>,
    /// Set when the name was `new`: the caller asks to create a group.
    pub is_new: bool,
}

/// Errors from topic name resolution.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NameError {
    /// Empty, oversized, or bad characters.
    Invalid,
    /// `usr<self>`: a p2p topic with oneself.
    SelfP2P,
    /// Unknown prefix.
    Unknown,
}

/// Validate a client-supplied topic name tag.
fn valid_tag(tag: &str) -> bool {
    !tag.is_empty()
        && tag.len() <= MAX_TOPIC_NAME_LENGTH
        && tag.chars().all(|c| c.is_ascii_alphanumeric() || c == '-')
}

/// Canonical p2p routing name for a pair of users, ids sorted.
#[must_use]
pub fn p2p_name(a: Uid, b: Uid) -> String {
    let (low, hi) = if a <= b { (a, b) } else { (b, a) };
    format!("p2p{}-{}", low.as_hex(), hi.as_hex())
}

/// Split a `p2p<a-b>` routing name back into the user pair.
#[must_use]
pub fn p2p_pair(routing: &str) -> Option<(Uid, Uid)> {
    let rest = routing.strip_prefix("p2p")?;
    let (a, b) = rest.split_once('-')?;
    Some((Uid::from_hex(a)?, Uid::from_hex(b)?))
}

/// Generate a fresh group topic routing name.
#[must_use]
pub fn new_grp_name() -> String {
    format!("grp{:x}", next_unique())
}

/// Generate a process-unique session id.
#[must_use]
pub fn new_session_id() -> String {
    format!("s{:x}", next_unique())
}

/// Resolve a client-facing topic name to a canonical address.
///
/// # Errors
///
/// Returns [`NameError`] for malformed names, unknown prefixes, and
/// attempts to open a p2p topic with oneself.
pub fn resolve_topic_name(name: &str, caller: Uid) -> Result<TopicAddr, NameError> {
    if name.is_empty() || name.len() > MAX_TOPIC_NAME_LENGTH {
        return Err(NameError::Invalid);
    }

    if name == "me" {
        return Ok(TopicAddr {
            cat: TopicCat::Me,
            routing: format!("usr{}", caller.as_hex()),
            client_name: "me".into(),
            p2p_peer: None,
            is_new: false,
        });
    }

    if name == "fnd" {
        return Ok(TopicAddr {
            cat: TopicCat::Fnd,
            routing: format!("fnd{}", caller.as_hex()),
            client_name: "fnd".into(),
            p2p_peer: None,
            is_new: false,
        });
    }

    // `new` or `new<seed>`: request to create a group on subscribe.
    if name == "new" || (name.starts_with("new") && valid_tag(&name[3..])) {
        let routing = new_grp_name();
        return Ok(TopicAddr {
            cat: TopicCat::Grp,
            routing: routing.clone(),
            client_name: routing,
            p2p_peer: None,
            is_new: true,
        });
    }

    if let Some(tag) = name.strip_prefix("usr") {
        let peer = Uid::from_hex(tag).ok_or(NameError::Invalid)?;
        if peer == caller {
            return Err(NameError::SelfP2P);
        }
        return Ok(TopicAddr {
            cat: TopicCat::P2P,
            routing: p2p_name(caller, peer),
            client_name: name.into(),
            p2p_peer: Some(peer),
            is_new: false,
        });
    }

    if let Some(rest) = name.strip_prefix("p2p") {
        let (a, b) = p2p_pair(name).ok_or(NameError::Invalid)?;
        if !valid_tag(rest) || b <= a {
            return Err(NameError::Invalid);
        }
        let peer = if a == caller {
            b
        } else if b == caller {
            a
        } else {
            // Not a party to this pair; access control rejects later,
            // the name itself is still well-formed.
            b
        };
        return Ok(TopicAddr {
            cat: TopicCat::P2P,
            routing: name.into(),
            client_name: name.into(),
            p2p_peer: Some(peer),
            is_new: false,
        });
    }

    if let Some(tag) = name.strip_prefix("grp") {
        if !valid_tag(tag) {
            return Err(NameError::Invalid);
        }
        return Ok(TopicAddr {
            cat: TopicCat::Grp,
            routing: name.into(),
            client_name: name.into(),
            p2p_peer: None,
            is_new: false,
        });
    }

    Err(NameError::Unknown)
}
