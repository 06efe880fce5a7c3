//! Widget Relay CLI
//!
//! Command-line peer for the widget state relay: join a channel, publish
//! JSON values read from stdin and print what other peers share.

pub mod cli;
pub mod commands;
pub mod config;
pub mod error;
