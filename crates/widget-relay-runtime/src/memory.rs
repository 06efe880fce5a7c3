//! In-process relay
//!
//! [`MemoryRelay`] behaves like the public relay server: clients join a
//! channel through the `uuid`/`channel` query of the connection URL, every
//! frame a client sends is forwarded verbatim to the other clients of its
//! channel, and joins and leaves are announced with `connect`/`disconnect`
//! frames. Used by tests and by the CLI's local mode.

use std::sync::Arc;

use async_trait::async_trait;
use hashbrown::HashMap;
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, info};
use url::Url;
use widget_relay_core::{PeerId, RelayError, RelayResult, WireMessage};

use crate::transport::{Link, Transport};

type ClientId = u64;

struct Client {
    peer: PeerId,
    channel: String,
    to_client: mpsc::UnboundedSender<String>,
}

#[derive(Default)]
struct RelayState {
    next_client: ClientId,
    clients: HashMap<ClientId, Client>,
    offline: bool,
}

impl RelayState {
    fn broadcast(&self, channel: &str, from: ClientId, frame: &str) {
        for (id, client) in &self.clients {
            if *id != from && client.channel == channel {
                let _ = client.to_client.send(frame.to_string());
            }
        }
    }

    fn announce(&self, channel: &str, from: ClientId, message: &WireMessage) {
        match message.encode() {
            Ok(frame) => self.broadcast(channel, from, &frame),
            Err(e) => debug!("Failed to encode {} announcement: {}", message.kind(), e),
        }
    }

    /// Drop a client and tell its channel; false if it was already gone
    fn remove(&mut self, id: ClientId) -> bool {
        match self.clients.remove(&id) {
            Some(client) => {
                self.announce(
                    &client.channel,
                    id,
                    &WireMessage::Disconnect { uuid: client.peer },
                );
                true
            }
            None => false,
        }
    }
}

// ----------------------------------------------------------------------------
// Memory Relay
// ----------------------------------------------------------------------------

/// Channel-scoped fan-out hub; clones share the same relay
#[derive(Clone, Default)]
pub struct MemoryRelay {
    state: Arc<Mutex<RelayState>>,
}

impl MemoryRelay {
    pub fn new() -> Self {
        Self::default()
    }

    /// Refuse new connections while offline
    pub async fn set_online(&self, online: bool) {
        self.state.lock().await.offline = !online;
    }

    /// Close every client link from the relay side
    pub async fn disconnect_all(&self) -> usize {
        let mut state = self.state.lock().await;
        let ids: Vec<ClientId> = state.clients.keys().copied().collect();
        for id in &ids {
            state.remove(*id);
        }
        info!("Memory relay dropped {} clients", ids.len());
        ids.len()
    }

    /// Close the links of one peer from the relay side
    pub async fn disconnect_peer(&self, peer: &PeerId) -> bool {
        let mut state = self.state.lock().await;
        let ids: Vec<ClientId> = state
            .clients
            .iter()
            .filter(|(_, client)| client.peer == *peer)
            .map(|(id, _)| *id)
            .collect();
        for id in &ids {
            state.remove(*id);
        }
        !ids.is_empty()
    }

    /// Peers currently joined to `channel`, sorted
    pub async fn peers(&self, channel: &str) -> Vec<PeerId> {
        let state = self.state.lock().await;
        let mut peers: Vec<PeerId> = state
            .clients
            .values()
            .filter(|client| client.channel == channel)
            .map(|client| client.peer.clone())
            .collect();
        peers.sort();
        peers
    }

    pub async fn client_count(&self) -> usize {
        self.state.lock().await.clients.len()
    }
}

fn query_value(url: &Url, key: &str) -> Option<String> {
    url.query_pairs()
        .find(|(k, _)| k == key)
        .map(|(_, v)| v.into_owned())
        .filter(|v| !v.is_empty())
}

#[async_trait]
impl Transport for MemoryRelay {
    async fn connect(&self, url: &Url) -> RelayResult<Link> {
        let peer = query_value(url, "uuid")
            .map(PeerId::new)
            .ok_or_else(|| RelayError::transport("Connection URL has no uuid"))?;
        let channel = query_value(url, "channel")
            .ok_or_else(|| RelayError::transport("Connection URL has no channel"))?;

        let (link, mut from_client, to_client) = Link::pair();
        let id = {
            let mut state = self.state.lock().await;
            if state.offline {
                return Err(RelayError::transport("Memory relay is offline"));
            }
            let id = state.next_client;
            state.next_client += 1;
            state.announce(&channel, id, &WireMessage::Connect { uuid: peer.clone() });
            state.clients.insert(
                id,
                Client {
                    peer: peer.clone(),
                    channel: channel.clone(),
                    to_client,
                },
            );
            id
        };
        debug!("Memory relay: {} joined channel '{}'", peer, channel);

        let relay = self.state.clone();
        tokio::spawn(async move {
            while let Some(frame) = from_client.recv().await {
                let state = relay.lock().await;
                if !state.clients.contains_key(&id) {
                    break;
                }
                state.broadcast(&channel, id, &frame);
            }
            if relay.lock().await.remove(id) {
                debug!("Memory relay: {} left channel '{}'", peer, channel);
            }
        });

        Ok(link)
    }

    fn name(&self) -> &'static str {
        "memory"
    }
}
