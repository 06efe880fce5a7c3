//! Command dispatch for the relay CLI

use std::time::Duration;

use serde_json::{json, Value};
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{debug, info, warn};
use widget_relay_core::{PeerId, RelayConfig, WatchOptions};
use widget_relay_runtime::{MemoryRelay, RelayBuilder, RelayHandle, StateChange};

use crate::cli::{Cli, Commands};
use crate::config::load_configuration;
use crate::error::{CliError, Result};

/// Name of the state shared by demo peers
const DEMO_STATE: &str = "counter";

pub struct CommandDispatcher;

impl CommandDispatcher {
    /// Execute the parsed command line
    pub async fn execute(cli: Cli) -> Result<()> {
        let config = load_configuration(&cli)?;
        let relay = cli.local.then(MemoryRelay::new);

        match cli.command {
            Commands::Join {
                state,
                default,
                include_self,
            } => {
                let default: Value = serde_json::from_str(&default)?;
                let handle = start(config, relay.as_ref()).await?;
                join(handle, &state, default, include_self).await
            }
            Commands::Demo {
                peers,
                rounds,
                interval_ms,
            } => {
                demo(
                    config,
                    relay.as_ref(),
                    peers,
                    rounds,
                    Duration::from_millis(interval_ms),
                )
                .await
            }
            Commands::Config => {
                println!("{}", toml::to_string_pretty(&config)?);
                Ok(())
            }
            Commands::Url => {
                let session = config.resolve()?;
                println!("{}", session.connect_url);
                Ok(())
            }
        }
    }
}

async fn start(config: RelayConfig, relay: Option<&MemoryRelay>) -> Result<RelayHandle> {
    let mut builder = RelayBuilder::new().with_config(config).with_logging();
    if let Some(relay) = relay {
        builder = builder.with_memory_relay(relay);
    }
    Ok(builder.build_and_start().await?)
}

fn print_change(change: &StateChange) -> Result<()> {
    let line = json!({
        "peer": change.peer,
        "value": change.value,
        "removed": change.value.is_none(),
    });
    println!("{}", serde_json::to_string(&line)?);
    Ok(())
}

// ----------------------------------------------------------------------------
// Join
// ----------------------------------------------------------------------------

async fn join(mut relay: RelayHandle, state: &str, default: Value, include_self: bool) -> Result<()> {
    info!(
        "Joined channel '{}' as {} ({})",
        relay.channel(),
        relay.peer_id(),
        relay.connect_url()
    );

    let handle = relay.create_state::<Value>(state, &default).await?;
    let mut changes = handle
        .subscribe(WatchOptions {
            include_self,
            immediate: true,
        })
        .await?;
    let mut status = relay.status_receiver();
    let mut lines = BufReader::new(tokio::io::stdin()).lines();

    loop {
        tokio::select! {
            line = lines.next_line() => match line? {
                Some(line) if line.trim().is_empty() => {}
                Some(line) => match serde_json::from_str::<Value>(&line) {
                    Ok(value) => handle.set(&value).await?,
                    Err(e) => warn!("Ignoring invalid JSON input: {}", e),
                },
                None => {
                    debug!("Stdin closed");
                    break;
                }
            },
            change = changes.recv() => match change {
                Some(change) => print_change(&change)?,
                None => break,
            },
            changed = status.changed() => {
                if changed.is_err() {
                    break;
                }
                info!("Relay status: {}", *status.borrow_and_update());
            }
            _ = tokio::signal::ctrl_c() => {
                info!("Interrupted");
                break;
            }
        }
    }

    drop(changes);
    relay.shutdown().await?;
    Ok(())
}

// ----------------------------------------------------------------------------
// Demo
// ----------------------------------------------------------------------------

async fn demo(
    config: RelayConfig,
    relay: Option<&MemoryRelay>,
    peers: usize,
    rounds: u64,
    interval: Duration,
) -> Result<()> {
    if peers == 0 {
        return Err(CliError::Config("Demo needs at least one peer".to_string()));
    }

    let mut observer = start(config.clone(), relay).await?;
    let counter = observer.create_state(DEMO_STATE, &0u64).await?;
    let mut changes = counter.subscribe(WatchOptions::default()).await?;
    info!(
        "Observing channel '{}' with {} simulated peers",
        observer.channel(),
        peers
    );

    let mut simulated = Vec::with_capacity(peers);
    for index in 0..peers {
        let peer_config = RelayConfig {
            peer_id: Some(PeerId::new(format!("demo-{}", index))),
            channel: Some(observer.channel().to_string()),
            ..config.clone()
        };
        let handle = start(peer_config, relay).await?;
        simulated.push(tokio::spawn(run_demo_peer(handle, rounds, interval)));
    }

    // Let the final values and resyncs arrive after the last update.
    let settle = tokio::time::sleep(interval * rounds as u32 + Duration::from_secs(1));
    tokio::pin!(settle);
    loop {
        tokio::select! {
            change = changes.recv() => match change {
                Some(change) => print_change(&change)?,
                None => break,
            },
            _ = &mut settle => break,
        }
    }

    for task in simulated {
        match task.await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!("Demo peer failed: {}", e),
            Err(e) => warn!("Demo peer task ended abnormally: {}", e),
        }
    }

    let totals = counter.remote().await?;
    for (peer, value) in &totals {
        info!("{} finished at {}", peer, value);
    }
    drop(changes);
    observer.shutdown().await?;
    Ok(())
}

async fn run_demo_peer(mut handle: RelayHandle, rounds: u64, interval: Duration) -> Result<()> {
    let counter = handle.create_state(DEMO_STATE, &0u64).await?;
    for round in 1..=rounds {
        counter.set(&round).await?;
        tokio::time::sleep(interval).await;
    }
    // Stay on the channel until the final value has been flushed.
    tokio::time::sleep(Duration::from_millis(500)).await;
    handle.shutdown().await?;
    Ok(())
}
