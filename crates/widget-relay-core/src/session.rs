//! Relay session state machine
//!
//! [`RelaySession`] is the sans-IO composition root of the protocol. It owns
//! the table of named states, their sync schedulers and the periodic full
//! resync deadline. The runtime feeds it connection status transitions,
//! inbound frames and timer expiries, and executes the [`Effect`]s it queues.
//!
//! All methods run to completion on the caller's thread; nothing inside the
//! session blocks or performs I/O. Local `set` updates the store and fires
//! watchers before any frame is queued, and queued frames only leave the
//! process once the runtime drains the effect queue.

use std::collections::{BTreeMap, VecDeque};
use std::marker::PhantomData;

use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use tracing::{debug, info, trace};

use crate::config::SessionConfig;
use crate::diff;
use crate::errors::{RelayError, RelayResult};
use crate::scheduler::{Outgoing, SyncDecision, SyncScheduler};
use crate::store::{PeerStateStore, WatchCallback, WatchId, WatchOptions};
use crate::types::{ConnectionStatus, PeerId, TimeSource, Timestamp};
use crate::wire::WireMessage;

// ----------------------------------------------------------------------------
// Effects
// ----------------------------------------------------------------------------

/// Work the session hands to the runtime
#[derive(Debug, Clone, PartialEq)]
pub enum Effect {
    /// Send a frame on the relay link (best-effort)
    Transmit(WireMessage),
    /// The session's view of the link changed
    StatusChanged(ConnectionStatus),
}

/// Counters for frames handled by the session
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SessionStats {
    /// `change` frames queued for transmission
    pub full_frames_sent: u64,
    /// `delta` frames queued for transmission
    pub delta_frames_sent: u64,
    /// Sends skipped because the value matched the snapshot
    pub unchanged_skips: u64,
    /// Sends skipped because the link was not open
    pub offline_skips: u64,
    /// Inbound frames applied
    pub frames_applied: u64,
    /// Inbound frames dropped (malformed, unknown state, broken delta, self)
    pub frames_discarded: u64,
}

// ----------------------------------------------------------------------------
// Typed State Keys
// ----------------------------------------------------------------------------

/// Typed handle to a named state
pub struct StateKey<V> {
    name: String,
    _marker: PhantomData<fn() -> V>,
}

impl<V> StateKey<V> {
    fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            _marker: PhantomData,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

impl<V> Clone for StateKey<V> {
    fn clone(&self) -> Self {
        Self::new(&self.name)
    }
}

impl<V> core::fmt::Debug for StateKey<V> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_tuple("StateKey").field(&self.name).finish()
    }
}

// ----------------------------------------------------------------------------
// Relay Session
// ----------------------------------------------------------------------------

#[derive(Debug)]
struct NamedState {
    store: PeerStateStore,
    scheduler: SyncScheduler,
}

/// Peer state relay protocol engine
pub struct RelaySession<T: TimeSource> {
    config: SessionConfig,
    time_source: T,
    states: BTreeMap<String, NamedState>,
    status: ConnectionStatus,
    next_full_sync: Timestamp,
    effects: VecDeque<Effect>,
    stats: SessionStats,
    disposed: bool,
}

impl<T: TimeSource> RelaySession<T> {
    /// Create a session; the status starts as `connecting`
    pub fn new(config: SessionConfig, time_source: T) -> Self {
        let next_full_sync = time_source.now() + config.full_sync_interval;
        Self {
            config,
            time_source,
            states: BTreeMap::new(),
            status: ConnectionStatus::Connecting,
            next_full_sync,
            effects: VecDeque::new(),
            stats: SessionStats::default(),
            disposed: false,
        }
    }

    pub fn local_peer(&self) -> &PeerId {
        &self.config.peer_id
    }

    pub fn channel(&self) -> &str {
        &self.config.channel
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    pub fn status(&self) -> ConnectionStatus {
        self.status
    }

    pub fn stats(&self) -> SessionStats {
        self.stats
    }

    pub fn is_disposed(&self) -> bool {
        self.disposed
    }

    // ------------------------------------------------------------------------
    // Local API
    // ------------------------------------------------------------------------

    /// Declare a typed state; an existing state of that name is reused as-is
    pub fn create_state<V: Serialize>(&mut self, name: &str, default: &V) -> RelayResult<StateKey<V>> {
        let default = serde_json::to_value(default).map_err(|e| RelayError::conversion(name, e))?;
        self.create_state_value(name, default)?;
        Ok(StateKey::new(name))
    }

    /// Declare a state with a raw JSON default; returns whether it was new
    pub fn create_state_value(&mut self, name: &str, default: Value) -> RelayResult<bool> {
        self.ensure_running()?;
        if self.states.contains_key(name) {
            return Ok(false);
        }

        debug!("Creating relay state '{}'", name);
        self.states.insert(
            name.to_string(),
            NamedState {
                store: PeerStateStore::new(name, self.config.peer_id.clone(), default),
                scheduler: SyncScheduler::new(self.config.throttle_interval),
            },
        );
        Ok(true)
    }

    /// Set the local value of a typed state
    pub fn set<V: Serialize>(&mut self, key: &StateKey<V>, value: &V) -> RelayResult<()> {
        let value = serde_json::to_value(value).map_err(|e| RelayError::conversion(&key.name, e))?;
        self.set_value(&key.name, value)
    }

    /// Set the local value of a state and schedule its transmission
    pub fn set_value(&mut self, name: &str, value: Value) -> RelayResult<()> {
        self.ensure_running()?;
        let state = self.state_mut(name)?;
        state.store.set_local(value);
        self.local_changed(name);
        Ok(())
    }

    /// Re-run the sync hook with the current local value
    pub fn trigger(&mut self, name: &str) -> RelayResult<()> {
        self.ensure_running()?;
        self.state_mut(name)?;
        self.local_changed(name);
        Ok(())
    }

    /// Read a typed value; `peer = None` reads the local value
    pub fn get<V: DeserializeOwned>(
        &self,
        key: &StateKey<V>,
        peer: Option<&PeerId>,
    ) -> RelayResult<Option<V>> {
        match self.get_value(&key.name, peer) {
            Some(value) => serde_json::from_value(value.clone())
                .map(Some)
                .map_err(|e| RelayError::conversion(&key.name, e)),
            None => Ok(None),
        }
    }

    /// Read a raw value; `None` if the state or the peer entry is absent
    pub fn get_value(&self, name: &str, peer: Option<&PeerId>) -> Option<&Value> {
        self.states.get(name)?.store.get(peer)
    }

    /// Borrow the store of a state
    pub fn store(&self, name: &str) -> Option<&PeerStateStore> {
        self.states.get(name).map(|state| &state.store)
    }

    /// Borrow the scheduler of a state
    pub fn scheduler(&self, name: &str) -> Option<&SyncScheduler> {
        self.states.get(name).map(|state| &state.scheduler)
    }

    pub fn state_names(&self) -> Vec<&str> {
        self.states.keys().map(String::as_str).collect()
    }

    /// Register a watcher on a state
    pub fn watch(
        &mut self,
        name: &str,
        callback: WatchCallback,
        options: WatchOptions,
    ) -> RelayResult<WatchId> {
        self.ensure_running()?;
        Ok(self.state_mut(name)?.store.watch(callback, options))
    }

    /// Remove a watcher; returns whether it was registered
    pub fn unwatch(&mut self, name: &str, id: WatchId) -> bool {
        self.states
            .get_mut(name)
            .map(|state| state.store.unwatch(id))
            .unwrap_or(false)
    }

    // ------------------------------------------------------------------------
    // Connection Events
    // ------------------------------------------------------------------------

    /// Apply a link status transition
    ///
    /// Entering `connected` forces a full resync of every state; entering
    /// `disconnected` clears every remote entry. This is also the hook a
    /// debug bridge uses to pretend the link is up.
    pub fn set_status(&mut self, status: ConnectionStatus) {
        if self.disposed || status == self.status {
            return;
        }

        info!("Relay status {} -> {}", self.status, status);
        self.status = status;
        self.effects.push_back(Effect::StatusChanged(status));

        match status {
            ConnectionStatus::Connected => self.full_resync(),
            ConnectionStatus::Disconnected => {
                for state in self.states.values_mut() {
                    let removed = state.store.clear_remote();
                    if !removed.is_empty() {
                        debug!(
                            "Cleared {} remote entries from '{}'",
                            removed.len(),
                            state.store.name()
                        );
                    }
                }
            }
            ConnectionStatus::Connecting => {}
        }
    }

    /// Handle one inbound text frame; malformed frames are dropped
    pub fn handle_frame(&mut self, frame: &str) {
        match WireMessage::decode(frame) {
            Ok(message) => self.handle_message(message),
            Err(e) => {
                self.stats.frames_discarded += 1;
                debug!("Dropping malformed relay frame: {}", e);
            }
        }
    }

    /// Dispatch one parsed message
    pub fn handle_message(&mut self, message: WireMessage) {
        if self.disposed {
            return;
        }
        if *message.peer() == self.config.peer_id {
            self.stats.frames_discarded += 1;
            trace!("Ignoring {} frame from self", message.kind());
            return;
        }

        match message {
            WireMessage::Change { uuid, name, value } => {
                let Some(state) = self.states.get_mut(&name) else {
                    self.stats.frames_discarded += 1;
                    debug!("Dropping change for unknown state '{}'", name);
                    return;
                };
                state.store.apply_remote_change(&uuid, value);
                self.stats.frames_applied += 1;
            }
            WireMessage::Delta { uuid, name, delta } => {
                let Some(state) = self.states.get_mut(&name) else {
                    self.stats.frames_discarded += 1;
                    debug!("Dropping delta for unknown state '{}'", name);
                    return;
                };
                let baseline = state
                    .store
                    .get(Some(&uuid))
                    .cloned()
                    .unwrap_or_else(|| Value::Object(Default::default()));
                match diff::patch(baseline, &delta) {
                    Ok(value) => {
                        state.store.apply_remote_change(&uuid, value);
                        self.stats.frames_applied += 1;
                    }
                    Err(e) => {
                        self.stats.frames_discarded += 1;
                        debug!("Dropping delta for '{}' from {}: {}", name, uuid, e);
                    }
                }
            }
            WireMessage::Disconnect { uuid } => {
                debug!("Peer {} disconnected", uuid);
                for state in self.states.values_mut() {
                    state.store.apply_remote_disconnect(&uuid);
                }
                self.stats.frames_applied += 1;
            }
            WireMessage::Connect { uuid } => {
                debug!("Peer {} connected, resending all states", uuid);
                self.full_resync();
                self.stats.frames_applied += 1;
            }
        }
    }

    /// Simulate an inbound `change` (debug bridge)
    pub fn inject_change(&mut self, peer: PeerId, name: &str, value: Value) {
        self.handle_message(WireMessage::Change {
            uuid: peer,
            name: name.to_string(),
            value,
        });
    }

    /// Simulate a peer leaving (debug bridge)
    pub fn inject_disconnect(&mut self, peer: PeerId) {
        self.handle_message(WireMessage::Disconnect { uuid: peer });
    }

    // ------------------------------------------------------------------------
    // Timers
    // ------------------------------------------------------------------------

    /// Earliest instant at which [`handle_timeout`](Self::handle_timeout) has work
    pub fn next_deadline(&self) -> Option<Timestamp> {
        if self.disposed {
            return None;
        }
        self.states
            .values()
            .filter_map(|state| state.scheduler.pending_deadline())
            .chain(std::iter::once(self.next_full_sync))
            .min()
    }

    /// Run every timer that is due
    pub fn handle_timeout(&mut self) {
        if self.disposed {
            return;
        }
        let now = self.time_source.now();

        for state in self.states.values_mut() {
            if state.scheduler.fire_if_due(now) {
                transmit_state(
                    state,
                    &self.config.peer_id,
                    self.status,
                    false,
                    &mut self.effects,
                    &mut self.stats,
                );
            }
        }

        if now >= self.next_full_sync {
            trace!("Periodic full resync");
            self.full_resync();
            self.next_full_sync = self.next_full_sync + self.config.full_sync_interval;
            if self.next_full_sync <= now {
                self.next_full_sync = now + self.config.full_sync_interval;
            }
        }
    }

    // ------------------------------------------------------------------------
    // Effects and Lifecycle
    // ------------------------------------------------------------------------

    /// Take the next queued effect
    pub fn poll_effect(&mut self) -> Option<Effect> {
        self.effects.pop_front()
    }

    /// Take every queued effect
    pub fn drain_effects(&mut self) -> Vec<Effect> {
        self.effects.drain(..).collect()
    }

    /// Tear the session down: timers cancelled, watchers cleared
    pub fn dispose(&mut self) {
        if self.disposed {
            return;
        }
        for state in self.states.values_mut() {
            state.scheduler.cancel();
            state.store.clear_watchers();
        }
        self.set_status(ConnectionStatus::Disconnected);
        self.disposed = true;
        info!("Relay session for {} disposed", self.config.peer_id);
    }

    /// Forced full `change` for every state, bypassing throttle and diff
    pub fn full_resync(&mut self) {
        for state in self.states.values_mut() {
            transmit_state(
                state,
                &self.config.peer_id,
                self.status,
                true,
                &mut self.effects,
                &mut self.stats,
            );
        }
    }

    fn local_changed(&mut self, name: &str) {
        let now = self.time_source.now();
        let Some(state) = self.states.get_mut(name) else {
            return;
        };
        match state.scheduler.on_local_change(now) {
            SyncDecision::SendNow => transmit_state(
                state,
                &self.config.peer_id,
                self.status,
                false,
                &mut self.effects,
                &mut self.stats,
            ),
            SyncDecision::Deferred(deadline) => {
                trace!("Deferring '{}' until {:?}", name, deadline);
            }
            SyncDecision::AlreadyPending => {}
        }
    }

    fn state_mut(&mut self, name: &str) -> RelayResult<&mut NamedState> {
        self.states.get_mut(name).ok_or_else(|| RelayError::UnknownState {
            name: name.to_string(),
        })
    }

    fn ensure_running(&self) -> RelayResult<()> {
        if self.disposed {
            Err(RelayError::SessionClosed)
        } else {
            Ok(())
        }
    }
}

impl<T: TimeSource> core::fmt::Debug for RelaySession<T> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("RelaySession")
            .field("peer_id", &self.config.peer_id)
            .field("channel", &self.config.channel)
            .field("status", &self.status)
            .field("states", &self.states.keys().collect::<Vec<_>>())
            .field("disposed", &self.disposed)
            .finish()
    }
}

/// Queue the frame for one state if the link is open
fn transmit_state(
    state: &mut NamedState,
    local_peer: &PeerId,
    status: ConnectionStatus,
    force_full: bool,
    effects: &mut VecDeque<Effect>,
    stats: &mut SessionStats,
) {
    if !status.is_open() {
        stats.offline_skips += 1;
        return;
    }

    let name = state.store.name().to_string();
    let message = match state.scheduler.prepare(state.store.local_value(), force_full) {
        Some(Outgoing::Full(value)) => {
            stats.full_frames_sent += 1;
            WireMessage::Change {
                uuid: local_peer.clone(),
                name,
                value,
            }
        }
        Some(Outgoing::Delta(delta)) => {
            stats.delta_frames_sent += 1;
            WireMessage::Delta {
                uuid: local_peer.clone(),
                name,
                delta,
            }
        }
        None => {
            stats.unchanged_skips += 1;
            return;
        }
    };
    effects.push_back(Effect::Transmit(message));
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::ManualTimeSource;
    use serde_json::json;

    fn session() -> RelaySession<ManualTimeSource> {
        let config = SessionConfig::for_peer(PeerId::new("L")).unwrap();
        RelaySession::new(config, ManualTimeSource::new())
    }

    #[test]
    fn test_create_state_is_idempotent() {
        let mut session = session();
        let key = session.create_state("score", &0).unwrap();
        session.set(&key, &5).unwrap();

        let again = session.create_state("score", &0).unwrap();
        assert_eq!(session.get(&again, None).unwrap(), Some(5));
        assert_eq!(session.state_names(), vec!["score"]);
    }

    #[test]
    fn test_unknown_state_errors_for_local_calls() {
        let mut session = session();
        assert!(matches!(
            session.set_value("nope", json!(1)),
            Err(RelayError::UnknownState { .. })
        ));
        assert!(session.trigger("nope").is_err());
    }

    #[test]
    fn test_frames_from_self_are_ignored() {
        let mut session = session();
        session.create_state_value("pos", json!({"x": 0})).unwrap();
        session.set_status(ConnectionStatus::Connected);
        session.drain_effects();

        session.handle_frame(r#"{"type":"change","uuid":"L","name":"pos","value":{"x":9}}"#);
        session.handle_frame(r#"{"type":"connect","uuid":"L"}"#);

        assert_eq!(session.get_value("pos", None), Some(&json!({"x": 0})));
        assert!(session.drain_effects().is_empty());
        assert_eq!(session.stats().frames_discarded, 2);
    }

    #[test]
    fn test_typed_get_reports_conversion_failures() {
        let mut session = session();
        let key = session.create_state("score", &0u32).unwrap();
        session.inject_change(PeerId::new("R"), "score", json!("many"));
        assert!(matches!(
            session.get(&key, Some(&PeerId::new("R"))),
            Err(RelayError::ValueConversion { .. })
        ));
    }

    #[test]
    fn test_disposed_session_rejects_calls_and_has_no_deadline() {
        let mut session = session();
        session.create_state_value("pos", json!(1)).unwrap();
        session.dispose();

        assert!(matches!(session.set_value("pos", json!(2)), Err(RelayError::SessionClosed)));
        assert_eq!(session.next_deadline(), None);
        assert_eq!(session.status(), ConnectionStatus::Disconnected);
    }
}
