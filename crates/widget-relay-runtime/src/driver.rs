//! Session driver task
//!
//! Single owner of the [`RelaySession`]. Handle commands, link events and
//! timer expiries are processed one at a time, and the effects each step
//! queues are executed before the next one starts.

use serde_json::Value;
use tokio::sync::{mpsc, oneshot, watch};
use tracing::{debug, info, trace, warn};
use widget_relay_core::{
    ConnectionStatus, Effect, PeerId, RelayResult, RelaySession, SessionStats, WatchCallback,
    WatchId, WatchOptions, WireMessage,
};

use crate::connection::{ConnectionHandle, LinkEvent};
use crate::time::TokioTimeSource;

// ----------------------------------------------------------------------------
// Commands
// ----------------------------------------------------------------------------

/// Requests from handles to the driver
pub(crate) enum Command {
    CreateState {
        name: String,
        default: Value,
        reply: oneshot::Sender<RelayResult<bool>>,
    },
    Set {
        name: String,
        value: Value,
        reply: oneshot::Sender<RelayResult<()>>,
    },
    Trigger {
        name: String,
        reply: oneshot::Sender<RelayResult<()>>,
    },
    Get {
        name: String,
        peer: Option<PeerId>,
        reply: oneshot::Sender<Option<Value>>,
    },
    Entries {
        name: String,
        include_local: bool,
        reply: oneshot::Sender<Option<Vec<(PeerId, Value)>>>,
    },
    Watch {
        name: String,
        callback: WatchCallback,
        options: WatchOptions,
        reply: oneshot::Sender<RelayResult<WatchId>>,
    },
    Unwatch {
        name: String,
        id: WatchId,
    },
    Stats {
        reply: oneshot::Sender<SessionStats>,
    },
    ForceStatus(ConnectionStatus),
    Inject(WireMessage),
    Shutdown {
        reply: oneshot::Sender<()>,
    },
}

pub(crate) type CommandSender = mpsc::UnboundedSender<Command>;

/// Where transmitted frames go
pub(crate) enum Outlet {
    /// A live connection manager
    Link(ConnectionHandle),
    /// Debug bridge: frames are handed to the bridge instead of a network
    Bridge(mpsc::UnboundedSender<WireMessage>),
}

// ----------------------------------------------------------------------------
// Driver Task
// ----------------------------------------------------------------------------

pub(crate) struct DriverTask {
    session: RelaySession<TokioTimeSource>,
    time: TokioTimeSource,
    commands: mpsc::UnboundedReceiver<Command>,
    link_events: Option<mpsc::UnboundedReceiver<LinkEvent>>,
    outlet: Outlet,
    status: watch::Sender<ConnectionStatus>,
}

impl DriverTask {
    pub(crate) fn new(
        session: RelaySession<TokioTimeSource>,
        time: TokioTimeSource,
        commands: mpsc::UnboundedReceiver<Command>,
        link_events: Option<mpsc::UnboundedReceiver<LinkEvent>>,
        outlet: Outlet,
        status: watch::Sender<ConnectionStatus>,
    ) -> Self {
        Self {
            session,
            time,
            commands,
            link_events,
            outlet,
            status,
        }
    }

    pub(crate) async fn run(mut self) {
        info!(
            "Relay driver starting for {} on channel '{}'",
            self.session.local_peer(),
            self.session.channel()
        );

        let shutdown_reply = loop {
            let wake_at = self
                .session
                .next_deadline()
                .map(|deadline| self.time.instant_at(deadline))
                .unwrap_or_else(|| tokio::time::Instant::now() + tokio::time::Duration::from_secs(3600));
            let link_open = self.link_events.is_some();

            tokio::select! {
                command = self.commands.recv() => match command {
                    Some(Command::Shutdown { reply }) => break Some(reply),
                    Some(command) => self.handle_command(command),
                    None => {
                        debug!("All relay handles dropped");
                        break None;
                    }
                },
                event = recv_link(&mut self.link_events), if link_open => match event {
                    Some(LinkEvent::Status(status)) => self.session.set_status(status),
                    Some(LinkEvent::Frame(frame)) => {
                        trace!("Received frame: {}", frame);
                        self.session.handle_frame(&frame);
                    }
                    None => {
                        debug!("Connection task finished");
                        self.link_events = None;
                    }
                },
                _ = tokio::time::sleep_until(wake_at) => self.session.handle_timeout(),
            }

            self.flush();
        };

        self.session.dispose();
        self.flush();
        if let Outlet::Link(connection) = self.outlet {
            connection.close().await;
        }
        info!("Relay driver stopped");

        if let Some(reply) = shutdown_reply {
            let _ = reply.send(());
        }
    }

    fn handle_command(&mut self, command: Command) {
        match command {
            Command::CreateState {
                name,
                default,
                reply,
            } => {
                let _ = reply.send(self.session.create_state_value(&name, default));
            }
            Command::Set { name, value, reply } => {
                let _ = reply.send(self.session.set_value(&name, value));
            }
            Command::Trigger { name, reply } => {
                let _ = reply.send(self.session.trigger(&name));
            }
            Command::Get { name, peer, reply } => {
                let value = self.session.get_value(&name, peer.as_ref()).cloned();
                let _ = reply.send(value);
            }
            Command::Entries {
                name,
                include_local,
                reply,
            } => {
                let entries = self.session.store(&name).map(|store| {
                    let entries = if include_local {
                        store.all()
                    } else {
                        store.remote()
                    };
                    entries
                        .into_iter()
                        .map(|(peer, value)| (peer.clone(), value.clone()))
                        .collect()
                });
                let _ = reply.send(entries);
            }
            Command::Watch {
                name,
                callback,
                options,
                reply,
            } => {
                let _ = reply.send(self.session.watch(&name, callback, options));
            }
            Command::Unwatch { name, id } => {
                self.session.unwatch(&name, id);
            }
            Command::Stats { reply } => {
                let _ = reply.send(self.session.stats());
            }
            Command::ForceStatus(status) => self.session.set_status(status),
            Command::Inject(message) => self.session.handle_message(message),
            Command::Shutdown { .. } => {}
        }
    }

    /// Execute queued effects
    fn flush(&mut self) {
        while let Some(effect) = self.session.poll_effect() {
            match effect {
                Effect::Transmit(message) => match &self.outlet {
                    Outlet::Link(connection) => match message.encode() {
                        Ok(frame) => {
                            trace!("Sending {} frame", message.kind());
                            connection.send(frame);
                        }
                        Err(e) => warn!("Failed to encode {} frame: {}", message.kind(), e),
                    },
                    Outlet::Bridge(outgoing) => {
                        let _ = outgoing.send(message);
                    }
                },
                Effect::StatusChanged(status) => {
                    self.status.send_replace(status);
                }
            }
        }
    }
}

async fn recv_link(events: &mut Option<mpsc::UnboundedReceiver<LinkEvent>>) -> Option<LinkEvent> {
    match events {
        Some(events) => events.recv().await,
        None => None,
    }
}
