//! Message engine: visibility filtering, deletion ranges, and the
//! edit/unsend/reaction policies.
//!
//! Everything here is pure over store records; the topic actor owns the
//! sequencing and calls in for the policy decisions.

use crate::error::EngineError;
use crate::store::{StoredMessage, Subscription};
use crate::types::Uid;
use banter_proto::{MessageHead, SeqRange};

/// Windows and limits for post-hoc message mutation.
#[derive(Debug, Clone, Copy)]
pub struct EditPolicy {
    /// How long after posting an edit is accepted.
    pub edit_window_ms: u64,
    /// Total edits allowed per message.
    pub max_edits: u32,
    /// How long after posting an unsend is accepted.
    pub unsend_window_ms: u64,
}

impl Default for EditPolicy {
    fn default() -> Self {
        Self {
            edit_window_ms: 15 * 60 * 1000,
            max_edits: 10,
            unsend_window_ms: 10 * 60 * 1000,
        }
    }
}

impl EditPolicy {
    /// Whether `caller` may still edit `msg` at time `now`.
    ///
    /// Sender-only; tombstoned and unsent messages are immutable.
    #[must_use]
    pub fn can_edit(&self, msg: &StoredMessage, caller: Uid, now: u64) -> bool {
        caller == msg.from
            && !msg.is_tombstone()
            && msg.head.unsent != Some(true)
            && now.saturating_sub(msg.at) <= self.edit_window_ms
            && msg.head.edit_count.unwrap_or(0) < self.max_edits
    }

    /// Whether `caller` may still unsend `msg` at time `now`.
    #[must_use]
    pub fn can_unsend(&self, msg: &StoredMessage, caller: Uid, now: u64) -> bool {
        caller == msg.from
            && !msg.is_tombstone()
            && msg.head.unsent != Some(true)
            && now.saturating_sub(msg.at) <= self.unsend_window_ms
    }
}

/// Record an edit in the header.
pub fn apply_edit(head: &mut MessageHead, now: u64) {
    head.edited_at = Some(now);
    head.edit_count = Some(head.edit_count.unwrap_or(0) + 1);
}

/// Record an unsend in the header.
pub fn apply_unsend(head: &mut MessageHead) {
    head.unsent = Some(true);
}

/// Prepare a stored message for delivery to one subscriber.
///
/// Returns `None` when the message is invisible to the subscriber
/// (soft-deleted by them, or a bare tombstone with nothing to render).
/// Placeholder-worthy tombstones and unsent messages come back with nil
/// content and their header markers intact.
#[must_use]
pub fn for_delivery(msg: StoredMessage, sub: &Subscription) -> Option<StoredMessage> {
    if sub.is_soft_deleted(msg.seq) {
        return None;
    }
    if msg.is_tombstone() && msg.head.is_empty() {
        return None;
    }
    Some(msg)
}

/// Validate client-supplied delete ranges against the topic's `last_seq`.
///
/// Returns the ranges sorted, merged, and clipped to `1..=last_seq`.
///
/// # Errors
///
/// `Invalid` when no range survives validation.
pub fn normalize_ranges(
    ranges: &[SeqRange],
    last_seq: u64,
) -> Result<Vec<SeqRange>, EngineError> {
    let mut valid: Vec<(u64, u64)> = ranges
        .iter()
        .filter_map(|r| {
            let hi = r.upper().min(last_seq + 1);
            (r.low >= 1 && r.low < hi).then_some((r.low, hi))
        })
        .collect();
    if valid.is_empty() {
        return Err(EngineError::Invalid);
    }

    valid.sort_unstable();
    let mut merged: Vec<(u64, u64)> = Vec::with_capacity(valid.len());
    for (low, hi) in valid {
        match merged.last_mut() {
            Some((_, prev_hi)) if low <= *prev_hi => *prev_hi = (*prev_hi).max(hi),
            _ => merged.push((low, hi)),
        }
    }

    Ok(merged
        .into_iter()
        .map(|(low, hi)| {
            if hi == low + 1 {
                SeqRange::one(low)
            } else {
                SeqRange::span(low, hi)
            }
        })
        .collect())
}

/// Advance a clear-up-to marker with newly deleted ranges.
///
/// The marker only moves while the deleted prefix stays contiguous:
/// deleting `[1,4)` then `[4,6)` clears through 5, but deleting `[7,9)`
/// alone leaves the marker where it was.
#[must_use]
pub fn advance_clear(mut clear_id: u64, ranges: &[SeqRange]) -> u64 {
    // Ranges arrive normalized (sorted, merged).
    for r in ranges {
        if r.low <= clear_id + 1 {
            clear_id = clear_id.max(r.upper() - 1);
        }
    }
    clear_id
}
