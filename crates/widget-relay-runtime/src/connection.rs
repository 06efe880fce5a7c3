//! Connection manager task
//!
//! Owns the link to the relay endpoint. Reports status transitions and
//! received frames to the session driver, sends frames only while a link is
//! open, and reconnects with escalating backoff after the link closes.
//! Frames handed over while no link is open are dropped, never buffered.

use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};
use url::Url;
use widget_relay_core::{reconnect_delay, ConnectionStatus};

use crate::transport::{Link, Transport};

// ----------------------------------------------------------------------------
// Channels
// ----------------------------------------------------------------------------

/// Events reported to the session driver, in order
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkEvent {
    Status(ConnectionStatus),
    Frame(String),
}

/// Requests from the session driver
#[derive(Debug)]
pub enum ConnectionCommand {
    /// Best-effort send of one text frame
    Send(String),
    /// Close the link and stop reconnecting
    Close,
}

/// Driver-side handle to a running connection task
#[derive(Debug)]
pub struct ConnectionHandle {
    commands: mpsc::UnboundedSender<ConnectionCommand>,
    task: JoinHandle<()>,
}

impl ConnectionHandle {
    /// Queue a frame for the open link; dropped if there is none
    pub fn send(&self, frame: String) {
        if self.commands.send(ConnectionCommand::Send(frame)).is_err() {
            trace!("Connection task stopped, dropping frame");
        }
    }

    /// Close the link and wait for the task to finish
    pub async fn close(self) {
        let _ = self.commands.send(ConnectionCommand::Close);
        if let Err(e) = self.task.await {
            warn!("Connection task ended abnormally: {}", e);
        }
    }
}

// ----------------------------------------------------------------------------
// Connection Task
// ----------------------------------------------------------------------------

enum LinkEnd {
    Closed,
    Shutdown,
}

/// Reconnecting connection manager
pub struct ConnectionTask {
    transport: Arc<dyn Transport>,
    url: Url,
    reconnect: bool,
    attempts: u32,
    commands: mpsc::UnboundedReceiver<ConnectionCommand>,
    events: mpsc::UnboundedSender<LinkEvent>,
}

impl ConnectionTask {
    /// Spawn the task; events arrive on the returned receiver
    pub fn spawn(
        transport: Arc<dyn Transport>,
        url: Url,
        reconnect: bool,
    ) -> (ConnectionHandle, mpsc::UnboundedReceiver<LinkEvent>) {
        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let task = Self {
            transport,
            url,
            reconnect,
            attempts: 0,
            commands: command_rx,
            events: event_tx,
        };
        let handle = tokio::spawn(task.run());
        (
            ConnectionHandle {
                commands: command_tx,
                task: handle,
            },
            event_rx,
        )
    }

    async fn run(mut self) {
        info!("Connection task starting ({})", self.transport.name());

        loop {
            self.attempts = self.attempts.saturating_add(1);
            self.report(LinkEvent::Status(ConnectionStatus::Connecting));
            debug!("Connecting to {} (attempt {})", self.url, self.attempts);

            let end = match self.open().await {
                Some(Ok(link)) => {
                    self.attempts = 0;
                    info!("Connected to relay");
                    self.report(LinkEvent::Status(ConnectionStatus::Connected));
                    self.pump(link).await
                }
                Some(Err(e)) => {
                    warn!("Relay connection failed: {}", e);
                    LinkEnd::Closed
                }
                None => LinkEnd::Shutdown,
            };

            self.report(LinkEvent::Status(ConnectionStatus::Disconnected));
            if matches!(end, LinkEnd::Shutdown) || !self.reconnect {
                break;
            }

            let delay = reconnect_delay(self.attempts);
            debug!("Reconnecting in {:?}", delay);
            if !self.idle(tokio::time::sleep(delay)).await {
                break;
            }
        }

        info!("Connection task stopped");
    }

    /// Attempt to open a link; `None` if closed while connecting
    async fn open(&mut self) -> Option<widget_relay_core::RelayResult<Link>> {
        let transport = self.transport.clone();
        let url = self.url.clone();
        let connect = async move { transport.connect(&url).await };
        tokio::pin!(connect);

        loop {
            tokio::select! {
                result = &mut connect => return Some(result),
                command = self.commands.recv() => match command {
                    Some(ConnectionCommand::Send(_)) => trace!("Not connected, dropping frame"),
                    Some(ConnectionCommand::Close) | None => return None,
                },
            }
        }
    }

    /// Shuttle frames until either side closes
    async fn pump(&mut self, mut link: Link) -> LinkEnd {
        loop {
            tokio::select! {
                frame = link.incoming.recv() => match frame {
                    Some(frame) => self.report(LinkEvent::Frame(frame)),
                    None => {
                        info!("Relay link closed");
                        return LinkEnd::Closed;
                    }
                },
                command = self.commands.recv() => match command {
                    Some(ConnectionCommand::Send(frame)) => {
                        if link.outgoing.send(frame).is_err() {
                            trace!("Link closing, dropping frame");
                        }
                    }
                    Some(ConnectionCommand::Close) | None => {
                        debug!("Closing relay link");
                        return LinkEnd::Shutdown;
                    }
                },
            }
        }
    }

    /// Wait out a backoff delay, dropping sends; false if closed meanwhile
    async fn idle(&mut self, delay: tokio::time::Sleep) -> bool {
        tokio::pin!(delay);
        loop {
            tokio::select! {
                _ = &mut delay => return true,
                command = self.commands.recv() => match command {
                    Some(ConnectionCommand::Send(_)) => trace!("Not connected, dropping frame"),
                    Some(ConnectionCommand::Close) | None => return false,
                },
            }
        }
    }

    fn report(&self, event: LinkEvent) {
        if self.events.send(event).is_err() {
            trace!("Session driver gone, dropping link event");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryRelay;
    use widget_relay_core::{connection_url, PeerId};

    fn url(peer: &str) -> Url {
        connection_url("ws://relay.local/", &PeerId::new(peer), "room").unwrap()
    }

    async fn next_status(events: &mut mpsc::UnboundedReceiver<LinkEvent>) -> ConnectionStatus {
        loop {
            match events.recv().await {
                Some(LinkEvent::Status(status)) => return status,
                Some(LinkEvent::Frame(_)) => continue,
                None => panic!("connection task ended"),
            }
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_reconnects_after_relay_drops_link() {
        let relay = MemoryRelay::new();
        let (handle, mut events) = ConnectionTask::spawn(Arc::new(relay.clone()), url("A"), true);

        assert_eq!(next_status(&mut events).await, ConnectionStatus::Connecting);
        assert_eq!(next_status(&mut events).await, ConnectionStatus::Connected);

        relay.disconnect_all().await;
        assert_eq!(next_status(&mut events).await, ConnectionStatus::Disconnected);
        assert_eq!(next_status(&mut events).await, ConnectionStatus::Connecting);
        assert_eq!(next_status(&mut events).await, ConnectionStatus::Connected);

        handle.close().await;
        assert_eq!(next_status(&mut events).await, ConnectionStatus::Disconnected);
    }

    #[tokio::test(start_paused = true)]
    async fn test_no_reconnect_when_disabled() {
        let relay = MemoryRelay::new();
        let (handle, mut events) = ConnectionTask::spawn(Arc::new(relay.clone()), url("A"), false);
        next_status(&mut events).await;
        next_status(&mut events).await;

        relay.disconnect_all().await;
        assert_eq!(next_status(&mut events).await, ConnectionStatus::Disconnected);
        assert_eq!(events.recv().await, None);
        handle.close().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_frames_while_offline_are_dropped() {
        let relay = MemoryRelay::new();
        relay.set_online(false).await;
        let (a, mut a_events) = ConnectionTask::spawn(Arc::new(relay.clone()), url("A"), true);
        assert_eq!(next_status(&mut a_events).await, ConnectionStatus::Connecting);
        assert_eq!(next_status(&mut a_events).await, ConnectionStatus::Disconnected);
        a.send("lost".to_string());

        relay.set_online(true).await;
        let (_b, mut b_events) = ConnectionTask::spawn(Arc::new(relay.clone()), url("B"), true);
        assert_eq!(next_status(&mut b_events).await, ConnectionStatus::Connecting);
        assert_eq!(next_status(&mut b_events).await, ConnectionStatus::Connected);

        loop {
            if next_status(&mut a_events).await == ConnectionStatus::Connected {
                break;
            }
        }
        a.send("kept".to_string());

        let mut frames = Vec::new();
        while frames.len() < 2 {
            if let Some(LinkEvent::Frame(frame)) = b_events.recv().await {
                frames.push(frame);
            }
        }
        assert!(frames[0].contains("\"connect\""));
        assert_eq!(frames[1], "kept");
    }
}
