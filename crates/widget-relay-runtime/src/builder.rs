//! Relay Builder API
//!
//! Provides a builder-style API for consumers (CLI/tests) to pick a
//! transport, start the relay session and get handles to its states.

use std::marker::PhantomData;
use std::sync::Arc;
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{info, warn};
use url::Url;
use widget_relay_core::{
    ConnectionStatus, PeerId, RelayConfig, RelayError, RelayResult, RelaySession, SessionStats,
    WatchCallback, WatchId, WatchOptions, WireMessage,
};

use crate::connection::ConnectionTask;
use crate::driver::{Command, CommandSender, DriverTask, Outlet};
use crate::memory::MemoryRelay;
use crate::time::TokioTimeSource;
use crate::transport::{Transport, WebSocketTransport};

// ----------------------------------------------------------------------------
// Relay Builder
// ----------------------------------------------------------------------------

/// Builder for a running relay session
pub struct RelayBuilder {
    config: RelayConfig,
    page_query: Option<String>,
    transport: Option<Arc<dyn Transport>>,
    debug_bridge: bool,
    enable_logging: bool,
}

impl RelayBuilder {
    /// Create a builder with default configuration
    pub fn new() -> Self {
        Self {
            config: RelayConfig::default(),
            page_query: None,
            transport: None,
            debug_bridge: false,
            enable_logging: false,
        }
    }

    /// Replace the whole configuration
    pub fn with_config(mut self, config: RelayConfig) -> Self {
        self.config = config;
        self
    }

    /// Relay endpoint URL
    pub fn url(mut self, url: impl Into<String>) -> Self {
        self.config.url = url.into();
        self
    }

    /// Explicit local peer id
    pub fn peer_id(mut self, peer_id: impl Into<PeerId>) -> Self {
        self.config.peer_id = Some(peer_id.into());
        self
    }

    /// Explicit channel
    pub fn channel(mut self, channel: impl Into<String>) -> Self {
        self.config.channel = Some(channel.into());
        self
    }

    /// Page query string to take `channel-key` from when no channel is set
    pub fn page_query(mut self, query: impl Into<String>) -> Self {
        self.page_query = Some(query.into());
        self
    }

    /// Enable/disable reconnecting after the link closes
    pub fn reconnect(mut self, enabled: bool) -> Self {
        self.config.reconnect = enabled;
        self
    }

    /// Set the period of the forced full resync
    pub fn full_sync_interval(mut self, interval: Duration) -> Self {
        self.config.full_sync_interval_ms = interval.as_millis() as u64;
        self
    }

    /// Set the per-state throttle window
    pub fn throttle_interval(mut self, interval: Duration) -> Self {
        self.config.throttle_interval_ms = interval.as_millis() as u64;
        self
    }

    /// Use a custom transport instead of WebSocket
    pub fn with_transport(mut self, transport: Arc<dyn Transport>) -> Self {
        self.transport = Some(transport);
        self
    }

    /// Connect through an in-process relay
    pub fn with_memory_relay(self, relay: &MemoryRelay) -> Self {
        self.with_transport(Arc::new(relay.clone()))
    }

    /// Run without a transport; status and inbound frames come from the
    /// [`DebugBridge`]
    pub fn with_debug_bridge(mut self) -> Self {
        self.debug_bridge = true;
        self
    }

    /// Enable lifecycle logging
    pub fn with_logging(mut self) -> Self {
        self.enable_logging = true;
        self
    }

    /// Disable lifecycle logging
    pub fn with_no_logging(mut self) -> Self {
        self.enable_logging = false;
        self
    }

    /// Build and start the relay
    pub async fn build_and_start(self) -> RelayResult<RelayHandle> {
        let config = match &self.page_query {
            Some(query) => self.config.clone().with_query(query),
            None => self.config.clone(),
        };
        let session_config = config.resolve()?;
        if self.enable_logging {
            info!(
                "Starting relay session {} on channel '{}'",
                session_config.peer_id, session_config.channel
            );
        }

        let peer_id = session_config.peer_id.clone();
        let channel = session_config.channel.clone();
        let connect_url = session_config.connect_url.clone();
        let reconnect = session_config.reconnect;

        let time = TokioTimeSource::new();
        let session = RelaySession::new(session_config, time);
        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let (status_tx, status_rx) = watch::channel(session.status());

        let (outlet, link_events, debug) = if self.debug_bridge {
            let (outgoing_tx, outgoing_rx) = mpsc::unbounded_channel();
            let bridge = DebugBridge {
                commands: command_tx.clone(),
                outgoing: outgoing_rx,
            };
            (Outlet::Bridge(outgoing_tx), None, Some(bridge))
        } else {
            let transport: Arc<dyn Transport> = match self.transport {
                Some(transport) => transport,
                None => Arc::new(WebSocketTransport::new()),
            };
            let (connection, events) =
                ConnectionTask::spawn(transport, connect_url.clone(), reconnect);
            (Outlet::Link(connection), Some(events), None)
        };

        let driver = DriverTask::new(session, time, command_rx, link_events, outlet, status_tx);
        let driver_handle = tokio::spawn(driver.run());

        Ok(RelayHandle {
            peer_id,
            channel,
            connect_url,
            commands: command_tx,
            status: status_rx,
            driver: Some(driver_handle),
            debug,
            enable_logging: self.enable_logging,
        })
    }
}

impl Default for RelayBuilder {
    fn default() -> Self {
        Self::new()
    }
}

// ----------------------------------------------------------------------------
// Relay Handle
// ----------------------------------------------------------------------------

async fn request<T>(
    commands: &CommandSender,
    make: impl FnOnce(oneshot::Sender<T>) -> Command,
) -> RelayResult<T> {
    let (reply, response) = oneshot::channel();
    commands
        .send(make(reply))
        .map_err(|_| RelayError::SessionClosed)?;
    response.await.map_err(|_| RelayError::SessionClosed)
}

/// Handle to a running relay session
pub struct RelayHandle {
    peer_id: PeerId,
    channel: String,
    connect_url: Url,
    commands: CommandSender,
    status: watch::Receiver<ConnectionStatus>,
    driver: Option<JoinHandle<()>>,
    debug: Option<DebugBridge>,
    enable_logging: bool,
}

impl RelayHandle {
    pub fn peer_id(&self) -> &PeerId {
        &self.peer_id
    }

    pub fn channel(&self) -> &str {
        &self.channel
    }

    /// URL used to reach the relay, including `uuid` and `channel`
    pub fn connect_url(&self) -> &Url {
        &self.connect_url
    }

    /// Current connection status
    pub fn status(&self) -> ConnectionStatus {
        *self.status.borrow()
    }

    /// Receiver notified on every status change
    pub fn status_receiver(&self) -> watch::Receiver<ConnectionStatus> {
        self.status.clone()
    }

    /// Wait until the status equals `status`
    pub async fn wait_for_status(&self, status: ConnectionStatus) -> RelayResult<()> {
        let mut receiver = self.status.clone();
        loop {
            if *receiver.borrow_and_update() == status {
                return Ok(());
            }
            receiver
                .changed()
                .await
                .map_err(|_| RelayError::SessionClosed)?;
        }
    }

    /// Declare a typed state; an existing state of that name is reused
    pub async fn create_state<V: Serialize>(
        &self,
        name: &str,
        default: &V,
    ) -> RelayResult<StateHandle<V>> {
        let default = serde_json::to_value(default).map_err(|e| RelayError::ValueConversion {
            name: name.to_string(),
            reason: e.to_string(),
        })?;
        let name = name.to_string();
        let state_name = name.clone();
        request(&self.commands, |reply| Command::CreateState {
            name: state_name,
            default,
            reply,
        })
        .await??;
        Ok(StateHandle {
            name,
            commands: self.commands.clone(),
            _marker: PhantomData,
        })
    }

    /// Take the debug bridge (only with `with_debug_bridge`, once)
    pub fn take_debug_bridge(&mut self) -> Option<DebugBridge> {
        self.debug.take()
    }

    /// Frame counters of the session
    pub async fn stats(&self) -> RelayResult<SessionStats> {
        request(&self.commands, |reply| Command::Stats { reply }).await
    }

    /// Check if the driver is still running
    pub fn is_running(&self) -> bool {
        self.driver.as_ref().is_some_and(|h| !h.is_finished())
    }

    /// Dispose the session: timers cancelled, watchers cleared, link closed
    pub async fn shutdown(&mut self) -> RelayResult<()> {
        if self.enable_logging {
            info!("Shutting down relay session {}", self.peer_id);
        }
        let _ = request(&self.commands, |reply| Command::Shutdown { reply }).await;

        if let Some(handle) = self.driver.take() {
            if let Err(e) = handle.await {
                warn!("Relay driver ended abnormally: {}", e);
            }
        }
        Ok(())
    }
}

// ----------------------------------------------------------------------------
// State Handle
// ----------------------------------------------------------------------------

/// A change reported to a subscription
#[derive(Debug, Clone, PartialEq)]
pub struct StateChange {
    pub peer: PeerId,
    /// `None` when the peer's entry was removed
    pub value: Option<Value>,
}

impl StateChange {
    /// Decode the value as `V`
    pub fn value_as<V: DeserializeOwned>(&self) -> RelayResult<Option<V>> {
        self.value
            .clone()
            .map(serde_json::from_value)
            .transpose()
            .map_err(|e| RelayError::ValueConversion {
                name: self.peer.to_string(),
                reason: e.to_string(),
            })
    }
}

/// Typed handle to one named state
pub struct StateHandle<V> {
    name: String,
    commands: CommandSender,
    _marker: PhantomData<fn() -> V>,
}

impl<V> Clone for StateHandle<V> {
    fn clone(&self) -> Self {
        Self {
            name: self.name.clone(),
            commands: self.commands.clone(),
            _marker: PhantomData,
        }
    }
}

impl<V> std::fmt::Debug for StateHandle<V> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("StateHandle").field(&self.name).finish()
    }
}

impl<V: Serialize + DeserializeOwned> StateHandle<V> {
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Set the local value; watchers run before this returns
    pub async fn set(&self, value: &V) -> RelayResult<()> {
        let value = self.encode(value)?;
        let name = self.name.clone();
        request(&self.commands, |reply| Command::Set { name, value, reply }).await?
    }

    /// Local value
    pub async fn get(&self) -> RelayResult<V> {
        let name = self.name.clone();
        let value = request(&self.commands, |reply| Command::Get {
            name,
            peer: None,
            reply,
        })
        .await?
        .ok_or_else(|| RelayError::UnknownState {
            name: self.name.clone(),
        })?;
        self.decode(value)
    }

    /// Last value heard from `peer`
    pub async fn get_peer(&self, peer: &PeerId) -> RelayResult<Option<V>> {
        let name = self.name.clone();
        let peer = Some(peer.clone());
        request(&self.commands, |reply| Command::Get { name, peer, reply })
            .await?
            .map(|value| self.decode(value))
            .transpose()
    }

    /// Every entry, local peer first
    pub async fn all(&self) -> RelayResult<Vec<(PeerId, V)>> {
        self.entries(true).await
    }

    /// Remote entries, ordered by peer id
    pub async fn remote(&self) -> RelayResult<Vec<(PeerId, V)>> {
        self.entries(false).await
    }

    /// Re-run the sync hook with the current value
    pub async fn trigger(&self) -> RelayResult<()> {
        let name = self.name.clone();
        request(&self.commands, |reply| Command::Trigger { name, reply }).await?
    }

    /// Register a raw callback; it runs on the driver task
    pub async fn watch(&self, callback: WatchCallback, options: WatchOptions) -> RelayResult<WatchId> {
        let name = self.name.clone();
        request(&self.commands, |reply| Command::Watch {
            name,
            callback,
            options,
            reply,
        })
        .await?
    }

    pub fn unwatch(&self, id: WatchId) {
        let _ = self.commands.send(Command::Unwatch {
            name: self.name.clone(),
            id,
        });
    }

    /// Stream changes through a channel; unsubscribes on drop
    pub async fn subscribe(&self, options: WatchOptions) -> RelayResult<Subscription> {
        let (tx, rx) = mpsc::unbounded_channel();
        let callback: WatchCallback = Box::new(move |peer, value| {
            let _ = tx.send(StateChange {
                peer: peer.clone(),
                value: value.cloned(),
            });
        });
        let id = self.watch(callback, options).await?;
        Ok(Subscription {
            name: self.name.clone(),
            id,
            changes: rx,
            commands: self.commands.clone(),
        })
    }

    async fn entries(&self, include_local: bool) -> RelayResult<Vec<(PeerId, V)>> {
        let name = self.name.clone();
        let entries = request(&self.commands, |reply| Command::Entries {
            name,
            include_local,
            reply,
        })
        .await?
        .ok_or_else(|| RelayError::UnknownState {
            name: self.name.clone(),
        })?;
        entries
            .into_iter()
            .map(|(peer, value)| Ok((peer, self.decode(value)?)))
            .collect()
    }

    fn encode(&self, value: &V) -> RelayResult<Value> {
        serde_json::to_value(value).map_err(|e| RelayError::ValueConversion {
            name: self.name.clone(),
            reason: e.to_string(),
        })
    }

    fn decode(&self, value: Value) -> RelayResult<V> {
        serde_json::from_value(value).map_err(|e| RelayError::ValueConversion {
            name: self.name.clone(),
            reason: e.to_string(),
        })
    }
}

/// Changes of one state delivered through a channel
pub struct Subscription {
    name: String,
    id: WatchId,
    changes: mpsc::UnboundedReceiver<StateChange>,
    commands: CommandSender,
}

impl Subscription {
    /// Next change; `None` once the session is gone
    pub async fn recv(&mut self) -> Option<StateChange> {
        self.changes.recv().await
    }

    /// Next change if one is already queued
    pub fn try_recv(&mut self) -> Option<StateChange> {
        self.changes.try_recv().ok()
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        let _ = self.commands.send(Command::Unwatch {
            name: std::mem::take(&mut self.name),
            id: self.id,
        });
    }
}

// ----------------------------------------------------------------------------
// Debug Bridge
// ----------------------------------------------------------------------------

/// Local stand-in for the network link
///
/// Overrides the session's connection status and injects inbound traffic.
/// Frames the session would have transmitted are delivered to
/// [`next_outgoing`](Self::next_outgoing).
pub struct DebugBridge {
    commands: CommandSender,
    outgoing: mpsc::UnboundedReceiver<WireMessage>,
}

impl DebugBridge {
    /// Override the connection status
    pub fn set_status(&self, status: ConnectionStatus) -> RelayResult<()> {
        self.send(Command::ForceStatus(status))
    }

    /// Simulate a `change` from `peer`
    pub fn set_state(&self, peer: impl Into<PeerId>, name: &str, value: Value) -> RelayResult<()> {
        self.send(Command::Inject(WireMessage::Change {
            uuid: peer.into(),
            name: name.to_string(),
            value,
        }))
    }

    /// Simulate `peer` leaving the channel
    pub fn disconnect_client(&self, peer: impl Into<PeerId>) -> RelayResult<()> {
        self.send(Command::Inject(WireMessage::Disconnect { uuid: peer.into() }))
    }

    /// Next frame the session transmitted
    pub async fn next_outgoing(&mut self) -> Option<WireMessage> {
        self.outgoing.recv().await
    }

    /// Next transmitted frame if one is already queued
    pub fn try_outgoing(&mut self) -> Option<WireMessage> {
        self.outgoing.try_recv().ok()
    }

    fn send(&self, command: Command) -> RelayResult<()> {
        self.commands
            .send(command)
            .map_err(|_| RelayError::SessionClosed)
    }
}
