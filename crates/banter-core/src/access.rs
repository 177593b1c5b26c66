//! Access control: the JRWPASDO capability bitmask.
//!
//! Every subscription carries two masks: `want` (what the user asked for)
//! and `given` (what the topic granted). The effective mode is their
//! intersection, and every gated operation checks a predicate against the
//! effective mode.

use crate::types::TopicCat;
use bitflags::bitflags;
use std::fmt;
use std::str::FromStr;

bitflags! {
    /// Capability bitmask gating topic operations.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct AccessMode: u32 {
        /// Attach sessions to the topic.
        const JOIN = 0x01;
        /// Receive `data` frames.
        const READ = 0x02;
        /// Publish.
        const WRITE = 0x04;
        /// Receive and emit presence.
        const PRES = 0x08;
        /// Approve subscription requests and change other users' grants.
        const APPROVE = 0x10;
        /// Invite others.
        const SHARE = 0x20;
        /// Hard-delete messages.
        const DELETE = 0x40;
        /// Full control; exactly one owner per grp topic.
        const OWNER = 0x80;
    }
}

impl AccessMode {
    /// Every capability.
    #[must_use]
    pub fn full() -> Self {
        Self::all()
    }

    #[must_use]
    pub fn is_joiner(self) -> bool {
        self.contains(Self::JOIN)
    }

    #[must_use]
    pub fn is_reader(self) -> bool {
        self.contains(Self::READ)
    }

    #[must_use]
    pub fn is_writer(self) -> bool {
        self.contains(Self::WRITE)
    }

    #[must_use]
    pub fn is_presencer(self) -> bool {
        self.contains(Self::PRES)
    }

    #[must_use]
    pub fn is_approver(self) -> bool {
        self.contains(Self::APPROVE)
    }

    #[must_use]
    pub fn is_sharer(self) -> bool {
        self.contains(Self::SHARE)
    }

    #[must_use]
    pub fn is_deleter(self) -> bool {
        self.contains(Self::DELETE)
    }

    #[must_use]
    pub fn is_owner(self) -> bool {
        self.contains(Self::OWNER)
    }

    /// Clip a requested grant by the granter's own authority.
    ///
    /// Only an Owner may hand out the Owner bit; only an Approver may hand
    /// out Approve/Share/Delete.
    #[must_use]
    pub fn clip_grant(self, granter: AccessMode) -> AccessMode {
        let mut granted = self;
        if !granter.is_owner() {
            granted.remove(AccessMode::OWNER);
            if !granter.is_approver() {
                granted.remove(AccessMode::APPROVE | AccessMode::SHARE | AccessMode::DELETE);
            }
        }
        granted
    }
}

/// Default access granted to authenticated users on a topic category.
#[must_use]
pub fn default_auth_access(cat: TopicCat) -> AccessMode {
    match cat {
        // A user holds every right on their own topics.
        TopicCat::Me | TopicCat::Fnd => AccessMode::full(),
        TopicCat::P2P => {
            AccessMode::JOIN
                | AccessMode::READ
                | AccessMode::WRITE
                | AccessMode::PRES
                | AccessMode::APPROVE
        }
        TopicCat::Grp => {
            AccessMode::JOIN | AccessMode::READ | AccessMode::WRITE | AccessMode::PRES | AccessMode::SHARE
        }
    }
}

/// Default access granted to anonymous users on a topic category.
#[must_use]
pub fn default_anon_access(cat: TopicCat) -> AccessMode {
    match cat {
        TopicCat::Me | TopicCat::Fnd | TopicCat::P2P => AccessMode::empty(),
        TopicCat::Grp => AccessMode::empty(),
    }
}

/// Parse error for mode strings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ParseModeError(pub char);

impl fmt::Display for ParseModeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid mode character '{}'", self.0)
    }
}

impl std::error::Error for ParseModeError {}

impl FromStr for AccessMode {
    type Err = ParseModeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s == "N" || s == "n" {
            return Ok(AccessMode::empty());
        }
        let mut mode = AccessMode::empty();
        for c in s.chars() {
            mode |= match c.to_ascii_uppercase() {
                'J' => AccessMode::JOIN,
                'R' => AccessMode::READ,
                'W' => AccessMode::WRITE,
                'P' => AccessMode::PRES,
                'A' => AccessMode::APPROVE,
                'S' => AccessMode::SHARE,
                'D' => AccessMode::DELETE,
                'O' => AccessMode::OWNER,
                other => return Err(ParseModeError(other)),
            };
        }
        Ok(mode)
    }
}

impl fmt::Display for AccessMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_empty() {
            return f.write_str("N");
        }
        const LETTERS: [(AccessMode, char); 8] = [
            (AccessMode::JOIN, 'J'),
            (AccessMode::READ, 'R'),
            (AccessMode::WRITE, 'W'),
            (AccessMode::PRES, 'P'),
            (AccessMode::APPROVE, 'A'),
            (AccessMode::SHARE, 'S'),
            (AccessMode::DELETE, 'D'),
            (AccessMode::OWNER, 'O'),
        ];
        for (bit, letter) in LETTERS {
            if self.contains(bit) {
                write!(f, "{letter}")?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_mode_parse_display_roundtrip() {
        let mode: AccessMode = "JRWP".parse().unwrap();
        assert!(mode.is_joiner() && mode.is_reader() && mode.is_writer() && mode.is_presencer());
        assert!(!mode.is_owner());
        assert_eq!(mode.to_string(), "JRWP");

        assert_eq!("N".parse::<AccessMode>().unwrap(), AccessMode::empty());
        assert_eq!(AccessMode::empty().to_string(), "N");
        assert_eq!(AccessMode::full().to_string(), "JRWPASDO");
    }

    #[test]
    fn test_mode_parse_rejects_unknown() {
        assert_eq!("JX".parse::<AccessMode>(), Err(ParseModeError('X')));
    }

    #[test]
    fn test_mode_parse_order_insensitive() {
        let a: AccessMode = "WRJ".parse().unwrap();
        let b: AccessMode = "JRW".parse().unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn test_clip_grant() {
        let requested = AccessMode::full();

        let approver: AccessMode = "JRWPA".parse().unwrap();
        let clipped = requested.clip_grant(approver);
        assert!(!clipped.is_owner());
        assert!(clipped.is_approver());

        let plain: AccessMode = "JRW".parse().unwrap();
        let clipped = requested.clip_grant(plain);
        assert!(!clipped.is_owner() && !clipped.is_approver() && !clipped.is_deleter());

        let owner = AccessMode::full();
        assert_eq!(requested.clip_grant(owner), requested);
    }

    #[test]
    fn test_defaults() {
        assert_eq!(default_auth_access(TopicCat::Me), AccessMode::full());
        assert!(default_auth_access(TopicCat::Grp).is_writer());
        assert!(!default_auth_access(TopicCat::Grp).is_owner());
        assert_eq!(default_anon_access(TopicCat::Grp), AccessMode::empty());
    }

    proptest! {
        /// Effective mode never exceeds either side of the intersection.
        #[test]
        fn prop_effective_is_clipped(want in 0u32..=0xFF, given in 0u32..=0xFF) {
            let want = AccessMode::from_bits_truncate(want);
            let given = AccessMode::from_bits_truncate(given);
            let effective = want & given;
            prop_assert!(want.contains(effective));
            prop_assert!(given.contains(effective));
        }

        /// Display/parse round-trips for every mask.
        #[test]
        fn prop_mode_string_roundtrip(bits in 0u32..=0xFF) {
            let mode = AccessMode::from_bits_truncate(bits);
            let parsed: AccessMode = mode.to_string().parse().unwrap();
            prop_assert_eq!(mode, parsed);
        }

        /// Clipping never mints bits the granter cannot hand out.
        #[test]
        fn prop_clip_grant_sound(req in 0u32..=0xFF, granter in 0u32..=0xFF) {
            let req = AccessMode::from_bits_truncate(req);
            let granter = AccessMode::from_bits_truncate(granter);
            let clipped = req.clip_grant(granter);
            prop_assert!(req.contains(clipped));
            if clipped.is_owner() {
                prop_assert!(granter.is_owner());
            }
        }
    }
}
