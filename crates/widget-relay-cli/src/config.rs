//! Configuration loading for the relay CLI
//!
//! A TOML file (if given) provides the base [`RelayConfig`]; command-line
//! flags override individual fields.

use tracing::info;
use widget_relay_core::{PeerId, RelayConfig};

use crate::cli::Cli;
use crate::error::{CliError, Result};

/// Load configuration from file or use defaults, then apply overrides
pub fn load_configuration(cli: &Cli) -> Result<RelayConfig> {
    let config = if let Some(config_path) = &cli.config {
        info!("Loading configuration from: {}", config_path);
        RelayConfig::load_from_file(config_path)?
    } else {
        RelayConfig::default()
    };
    apply_overrides(config, cli)
}

/// Apply command-line flags on top of `config`
pub fn apply_overrides(mut config: RelayConfig, cli: &Cli) -> Result<RelayConfig> {
    if let Some(url) = &cli.url {
        config.url = url.clone();
    }
    if let Some(peer) = &cli.peer {
        if peer.is_empty() {
            return Err(CliError::Config("Peer id must not be empty".to_string()));
        }
        config.peer_id = Some(PeerId::new(peer.as_str()));
    }
    if let Some(channel) = &cli.channel {
        config.channel = Some(channel.clone());
    }
    if let Some(query) = &cli.page_query {
        config = config.with_query(query);
    }
    if cli.no_reconnect {
        config.reconnect = false;
    }
    if let Some(throttle) = cli.throttle_ms {
        config.throttle_interval_ms = throttle;
    }
    if let Some(full_sync) = cli.full_sync_ms {
        config.full_sync_interval_ms = full_sync;
    }

    config.validate()?;
    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;

    fn parse(args: &[&str]) -> Cli {
        Cli::try_parse_from(args).unwrap()
    }

    #[test]
    fn test_flags_override_defaults() {
        let cli = parse(&[
            "widget-relay",
            "--peer",
            "me",
            "--channel",
            "room",
            "--no-reconnect",
            "--throttle-ms",
            "50",
            "url",
        ]);
        let config = apply_overrides(RelayConfig::default(), &cli).unwrap();
        assert_eq!(config.peer_id, Some(PeerId::new("me")));
        assert_eq!(config.channel.as_deref(), Some("room"));
        assert!(!config.reconnect);
        assert_eq!(config.throttle_interval_ms, 50);
        assert_eq!(config.full_sync_interval_ms, 10_000);
    }

    #[test]
    fn test_page_query_supplies_channel() {
        let cli = parse(&["widget-relay", "--page-query", "?channel-key=abc", "url"]);
        let config = apply_overrides(RelayConfig::default(), &cli).unwrap();
        assert_eq!(config.channel.as_deref(), Some("abc"));
    }

    #[test]
    fn test_invalid_overrides_are_rejected() {
        let cli = parse(&["widget-relay", "--full-sync-ms", "0", "url"]);
        assert!(apply_overrides(RelayConfig::default(), &cli).is_err());

        let cli = parse(&["widget-relay", "--url", "nope", "url"]);
        assert!(apply_overrides(RelayConfig::default(), &cli).is_err());
    }

    #[test]
    fn test_global_flags_after_subcommand() {
        let cli = parse(&["widget-relay", "join", "--state", "pos", "--local"]);
        assert!(cli.local);
        assert_eq!(
            cli.command,
            crate::cli::Commands::Join {
                state: "pos".to_string(),
                default: "null".to_string(),
                include_self: false,
            }
        );
    }
}
