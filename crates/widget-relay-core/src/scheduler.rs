//! Per-state outgoing sync scheduling
//!
//! The scheduler throttles outgoing frames for one named state and decides
//! whether a send carries the full value or a delta against the snapshot of
//! what was last placed on the wire. The snapshot is owned here and nowhere
//! else.
//!
//! Until the first send the throttle window is measured from the time
//! source's epoch, so changes made right after start-up are coalesced.

use core::time::Duration;

use serde_json::Value;

use crate::diff;
use crate::types::Timestamp;

/// Default minimum spacing between frames for one state
pub const DEFAULT_THROTTLE_INTERVAL: Duration = Duration::from_millis(300);

// ----------------------------------------------------------------------------
// Scheduling Decisions
// ----------------------------------------------------------------------------

/// Outcome of a local change notification
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncDecision {
    /// The throttle window has passed; send right away
    SendNow,
    /// A timer was armed for the given deadline
    Deferred(Timestamp),
    /// A timer is already pending and will pick up the latest value
    AlreadyPending,
}

/// Payload chosen for a send
#[derive(Debug, Clone, PartialEq)]
pub enum Outgoing {
    /// Complete current value
    Full(Value),
    /// Structural delta against the previous snapshot
    Delta(Value),
}

// ----------------------------------------------------------------------------
// Sync Scheduler
// ----------------------------------------------------------------------------

/// Throttle and snapshot state for one named state
#[derive(Debug, Clone)]
pub struct SyncScheduler {
    throttle: Duration,
    last_send: Timestamp,
    pending: Option<Timestamp>,
    snapshot: Option<Value>,
}

impl SyncScheduler {
    pub fn new(throttle: Duration) -> Self {
        Self {
            throttle,
            last_send: Timestamp::default(),
            pending: None,
            snapshot: None,
        }
    }

    pub fn throttle(&self) -> Duration {
        self.throttle
    }

    /// Deadline of the armed throttle timer, if any
    pub fn pending_deadline(&self) -> Option<Timestamp> {
        self.pending
    }

    pub fn last_send(&self) -> Timestamp {
        self.last_send
    }

    /// Last value placed on the wire
    pub fn snapshot(&self) -> Option<&Value> {
        self.snapshot.as_ref()
    }

    /// React to a local value change
    pub fn on_local_change(&mut self, now: Timestamp) -> SyncDecision {
        if self.pending.is_some() {
            return SyncDecision::AlreadyPending;
        }

        if now.duration_since(self.last_send) < self.throttle {
            let deadline = self.last_send + self.throttle;
            self.pending = Some(deadline);
            return SyncDecision::Deferred(deadline);
        }

        self.last_send = now;
        SyncDecision::SendNow
    }

    /// Consume the throttle timer if it is due
    pub fn fire_if_due(&mut self, now: Timestamp) -> bool {
        match self.pending {
            Some(deadline) if deadline <= now => {
                self.pending = None;
                self.last_send = now;
                true
            }
            _ => false,
        }
    }

    /// Choose what to transmit for `current` and advance the snapshot
    ///
    /// Returns `None` when nothing changed since the snapshot; the snapshot is
    /// left untouched in that case. Call only when the frame will actually be
    /// handed to an open transport.
    pub fn prepare(&mut self, current: &Value, force_full: bool) -> Option<Outgoing> {
        let outgoing = match (&self.snapshot, force_full) {
            (Some(snapshot), false) => Outgoing::Delta(diff::diff(snapshot, current)?),
            _ => Outgoing::Full(current.clone()),
        };
        self.snapshot = Some(current.clone());
        Some(outgoing)
    }

    /// Disarm the throttle timer
    pub fn cancel(&mut self) {
        self.pending = None;
    }
}

impl Default for SyncScheduler {
    fn default() -> Self {
        Self::new(DEFAULT_THROTTLE_INTERVAL)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn at(millis: u64) -> Timestamp {
        Timestamp::new(millis)
    }

    #[test]
    fn test_first_change_sends_immediately() {
        let mut scheduler = SyncScheduler::default();
        assert_eq!(scheduler.on_local_change(at(1_000)), SyncDecision::SendNow);
        assert_eq!(scheduler.last_send(), at(1_000));
    }

    #[test]
    fn test_change_near_epoch_waits_for_first_window() {
        let mut scheduler = SyncScheduler::default();
        assert_eq!(
            scheduler.on_local_change(at(0)),
            SyncDecision::Deferred(at(300))
        );
        assert_eq!(scheduler.on_local_change(at(50)), SyncDecision::AlreadyPending);
        assert!(scheduler.fire_if_due(at(300)));
    }

    #[test]
    fn test_change_inside_window_is_deferred_once() {
        let mut scheduler = SyncScheduler::default();
        scheduler.on_local_change(at(1_000));

        assert_eq!(
            scheduler.on_local_change(at(1_100)),
            SyncDecision::Deferred(at(1_300))
        );
        assert_eq!(
            scheduler.on_local_change(at(1_150)),
            SyncDecision::AlreadyPending
        );

        assert!(!scheduler.fire_if_due(at(1_299)));
        assert!(scheduler.fire_if_due(at(1_300)));
        assert_eq!(scheduler.pending_deadline(), None);
        assert_eq!(scheduler.last_send(), at(1_300));
    }

    #[test]
    fn test_change_after_window_sends_immediately() {
        let mut scheduler = SyncScheduler::default();
        scheduler.on_local_change(at(1_000));
        assert_eq!(scheduler.on_local_change(at(1_300)), SyncDecision::SendNow);
    }

    #[test]
    fn test_first_prepare_is_full_then_delta() {
        let mut scheduler = SyncScheduler::default();
        assert_eq!(
            scheduler.prepare(&json!({"x": 1}), false),
            Some(Outgoing::Full(json!({"x": 1})))
        );
        assert_eq!(
            scheduler.prepare(&json!({"x": 2}), false),
            Some(Outgoing::Delta(json!({"x": [1, 2]})))
        );
        assert_eq!(scheduler.snapshot(), Some(&json!({"x": 2})));
    }

    #[test]
    fn test_unchanged_value_skips_without_touching_snapshot() {
        let mut scheduler = SyncScheduler::default();
        scheduler.prepare(&json!([1]), false);
        assert_eq!(scheduler.prepare(&json!([1]), false), None);
        assert_eq!(scheduler.snapshot(), Some(&json!([1])));
    }

    #[test]
    fn test_forced_send_is_always_full() {
        let mut scheduler = SyncScheduler::default();
        scheduler.prepare(&json!(1), false);
        assert_eq!(scheduler.prepare(&json!(1), true), Some(Outgoing::Full(json!(1))));
    }
}
