//! Peer state store
//!
//! One store per named state. It holds the local peer's value (always
//! present) and the last value heard from every remote peer, and notifies
//! watchers when any of them change. Only the session mutates remote entries.

use core::fmt;

use hashbrown::HashMap;
use serde_json::Value;

use crate::types::PeerId;

// ----------------------------------------------------------------------------
// Watchers
// ----------------------------------------------------------------------------

/// Callback invoked with `(peer, value)`; `None` means the peer's entry is gone
pub type WatchCallback = Box<dyn FnMut(&PeerId, Option<&Value>) + Send>;

/// Options for [`PeerStateStore::watch`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WatchOptions {
    /// Also report changes of the local peer's own value
    pub include_self: bool,
    /// Report current entries right away at registration
    pub immediate: bool,
}

impl WatchOptions {
    pub fn include_self() -> Self {
        Self {
            include_self: true,
            immediate: false,
        }
    }

    pub fn immediate(mut self) -> Self {
        self.immediate = true;
        self
    }
}

/// Handle returned by `watch`, used to unsubscribe
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct WatchId(u64);

struct Watcher {
    id: WatchId,
    include_self: bool,
    callback: WatchCallback,
}

fn notify(watchers: &mut [Watcher], peer: &PeerId, value: Option<&Value>, is_local: bool) {
    for watcher in watchers.iter_mut() {
        if is_local && !watcher.include_self {
            continue;
        }
        (watcher.callback)(peer, value);
    }
}

// ----------------------------------------------------------------------------
// Peer State Store
// ----------------------------------------------------------------------------

/// Values of one named state, keyed by peer
pub struct PeerStateStore {
    name: String,
    local_peer: PeerId,
    local_value: Value,
    remote: HashMap<PeerId, Value>,
    watchers: Vec<Watcher>,
    next_watch_id: u64,
}

impl PeerStateStore {
    /// Create a store whose local entry starts at `default`
    pub fn new(name: impl Into<String>, local_peer: PeerId, default: Value) -> Self {
        Self {
            name: name.into(),
            local_peer,
            local_value: default,
            remote: HashMap::new(),
            watchers: Vec::new(),
            next_watch_id: 0,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn local_peer(&self) -> &PeerId {
        &self.local_peer
    }

    /// The local peer's current value
    pub fn local_value(&self) -> &Value {
        &self.local_value
    }

    /// Value for `peer`, or the local value when `peer` is `None`
    pub fn get(&self, peer: Option<&PeerId>) -> Option<&Value> {
        match peer {
            None => Some(&self.local_value),
            Some(peer) if *peer == self.local_peer => Some(&self.local_value),
            Some(peer) => self.remote.get(peer),
        }
    }

    /// Every entry, local peer first
    pub fn all(&self) -> Vec<(&PeerId, &Value)> {
        let mut entries = Vec::with_capacity(self.remote.len() + 1);
        entries.push((&self.local_peer, &self.local_value));
        entries.extend(self.remote());
        entries
    }

    /// Remote entries only, ordered by peer id
    pub fn remote(&self) -> Vec<(&PeerId, &Value)> {
        let mut entries: Vec<_> = self.remote.iter().collect();
        entries.sort_by(|a, b| a.0.cmp(b.0));
        entries
    }

    /// Every peer with an entry, local peer first
    pub fn peers(&self) -> Vec<PeerId> {
        self.all().into_iter().map(|(peer, _)| peer.clone()).collect()
    }

    pub fn remote_count(&self) -> usize {
        self.remote.len()
    }

    /// Replace the local value and notify `include_self` watchers
    pub fn set_local(&mut self, value: Value) {
        self.local_value = value;
        notify(
            &mut self.watchers,
            &self.local_peer,
            Some(&self.local_value),
            true,
        );
    }

    /// Register a watcher
    pub fn watch(&mut self, mut callback: WatchCallback, options: WatchOptions) -> WatchId {
        if options.immediate {
            if options.include_self {
                callback(&self.local_peer, Some(&self.local_value));
            }
            for (peer, value) in self.remote() {
                callback(peer, Some(value));
            }
        }

        let id = WatchId(self.next_watch_id);
        self.next_watch_id += 1;
        self.watchers.push(Watcher {
            id,
            include_self: options.include_self,
            callback,
        });
        id
    }

    /// Remove a watcher; returns whether it was registered
    pub fn unwatch(&mut self, id: WatchId) -> bool {
        let before = self.watchers.len();
        self.watchers.retain(|watcher| watcher.id != id);
        self.watchers.len() != before
    }

    pub fn watcher_count(&self) -> usize {
        self.watchers.len()
    }

    /// Record a remote peer's value; frames about the local peer are ignored
    pub fn apply_remote_change(&mut self, peer: &PeerId, value: Value) -> bool {
        if *peer == self.local_peer {
            return false;
        }
        self.remote.insert(peer.clone(), value);
        let current = self.remote.get(peer);
        notify(&mut self.watchers, peer, current, false);
        true
    }

    /// Drop a remote peer's entry, notifying watchers if it existed
    pub fn apply_remote_disconnect(&mut self, peer: &PeerId) -> bool {
        if *peer == self.local_peer {
            return false;
        }
        if self.remote.remove(peer).is_none() {
            return false;
        }
        notify(&mut self.watchers, peer, None, false);
        true
    }

    /// Drop every remote entry; returns the peers removed
    pub fn clear_remote(&mut self) -> Vec<PeerId> {
        let mut peers: Vec<PeerId> = self.remote.drain().map(|(peer, _)| peer).collect();
        peers.sort();
        for peer in &peers {
            notify(&mut self.watchers, peer, None, false);
        }
        peers
    }

    /// Remove all watchers (session disposal)
    pub fn clear_watchers(&mut self) {
        self.watchers.clear();
    }
}

impl fmt::Debug for PeerStateStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PeerStateStore")
            .field("name", &self.name)
            .field("local_peer", &self.local_peer)
            .field("local_value", &self.local_value)
            .field("remote", &self.remote)
            .field("watchers", &self.watchers.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::{Arc, Mutex};

    type Seen = Arc<Mutex<Vec<(String, Option<Value>)>>>;

    fn recorder() -> (Seen, WatchCallback) {
        let seen: Seen = Arc::default();
        let sink = seen.clone();
        let callback: WatchCallback = Box::new(move |peer, value| {
            sink.lock()
                .unwrap()
                .push((peer.to_string(), value.cloned()));
        });
        (seen, callback)
    }

    fn store() -> PeerStateStore {
        PeerStateStore::new("score", PeerId::new("L"), json!(0))
    }

    #[test]
    fn test_new_store_has_only_local_entry() {
        let store = store();
        assert_eq!(store.get(None), Some(&json!(0)));
        assert_eq!(store.all().len(), 1);
        assert_eq!(store.peers(), vec![PeerId::new("L")]);
    }

    #[test]
    fn test_default_watch_skips_local_changes() {
        let mut store = store();
        let (seen, callback) = recorder();
        store.watch(callback, WatchOptions::default());

        store.set_local(json!(5));
        assert!(seen.lock().unwrap().is_empty());

        store.apply_remote_change(&PeerId::new("R"), json!(7));
        assert_eq!(
            *seen.lock().unwrap(),
            vec![("R".to_string(), Some(json!(7)))]
        );
    }

    #[test]
    fn test_include_self_watch_sees_local_set() {
        let mut store = store();
        let (seen, callback) = recorder();
        store.watch(callback, WatchOptions::include_self());
        store.set_local(json!(5));
        assert_eq!(
            *seen.lock().unwrap(),
            vec![("L".to_string(), Some(json!(5)))]
        );
    }

    #[test]
    fn test_immediate_watch_replays_current_entries() {
        let mut store = store();
        store.apply_remote_change(&PeerId::new("B"), json!(2));
        store.apply_remote_change(&PeerId::new("A"), json!(1));

        let (seen, callback) = recorder();
        store.watch(callback, WatchOptions::include_self().immediate());
        assert_eq!(
            *seen.lock().unwrap(),
            vec![
                ("L".to_string(), Some(json!(0))),
                ("A".to_string(), Some(json!(1))),
                ("B".to_string(), Some(json!(2))),
            ]
        );
    }

    #[test]
    fn test_frames_about_local_peer_are_ignored() {
        let mut store = store();
        assert!(!store.apply_remote_change(&PeerId::new("L"), json!(99)));
        assert!(!store.apply_remote_disconnect(&PeerId::new("L")));
        assert_eq!(store.get(None), Some(&json!(0)));
    }

    #[test]
    fn test_disconnect_removes_entry_and_notifies_absent() {
        let mut store = store();
        store.apply_remote_change(&PeerId::new("p1"), json!(1));
        store.apply_remote_change(&PeerId::new("p2"), json!(2));
        let (seen, callback) = recorder();
        store.watch(callback, WatchOptions::default());

        assert!(store.apply_remote_disconnect(&PeerId::new("p1")));
        assert!(!store.apply_remote_disconnect(&PeerId::new("p1")));

        assert_eq!(*seen.lock().unwrap(), vec![("p1".to_string(), None)]);
        assert_eq!(store.get(Some(&PeerId::new("p1"))), None);
        assert_eq!(store.get(Some(&PeerId::new("p2"))), Some(&json!(2)));
    }

    #[test]
    fn test_clear_remote_keeps_local_entry() {
        let mut store = store();
        store.apply_remote_change(&PeerId::new("p2"), json!(2));
        store.apply_remote_change(&PeerId::new("p1"), json!(1));
        store.set_local(json!(3));

        let (seen, callback) = recorder();
        store.watch(callback, WatchOptions::default());
        let removed = store.clear_remote();

        assert_eq!(removed, vec![PeerId::new("p1"), PeerId::new("p2")]);
        assert_eq!(seen.lock().unwrap().len(), 2);
        assert_eq!(store.remote_count(), 0);
        assert_eq!(store.get(None), Some(&json!(3)));
    }

    #[test]
    fn test_unwatch_stops_notifications() {
        let mut store = store();
        let (seen, callback) = recorder();
        let id = store.watch(callback, WatchOptions::default());
        assert!(store.unwatch(id));
        assert!(!store.unwatch(id));
        store.apply_remote_change(&PeerId::new("R"), json!(1));
        assert!(seen.lock().unwrap().is_empty());
    }
}
