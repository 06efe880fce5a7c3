//! Widget Relay Runtime
//!
//! Tokio runtime for the peer state relay. A driver task owns the sans-IO
//! [`RelaySession`](widget_relay_core::RelaySession), a connection manager
//! task owns the relay link, and applications talk to both through the
//! handles returned by [`RelayBuilder`].
//!
//! ```no_run
//! # async fn demo() -> widget_relay_core::RelayResult<()> {
//! use widget_relay_runtime::RelayBuilder;
//!
//! let mut relay = RelayBuilder::new().channel("overlay").build_and_start().await?;
//! let score = relay.create_state("score", &0u32).await?;
//! score.set(&5).await?;
//! relay.shutdown().await?;
//! # Ok(())
//! # }
//! ```

// ----------------------------------------------------------------------------
// Module Declarations
// ----------------------------------------------------------------------------

pub mod builder;
pub mod connection;
mod driver;
pub mod memory;
pub mod time;
pub mod transport;

// ----------------------------------------------------------------------------
// Public API
// ----------------------------------------------------------------------------

pub use builder::{DebugBridge, RelayBuilder, RelayHandle, StateChange, StateHandle, Subscription};
pub use connection::{ConnectionCommand, ConnectionHandle, ConnectionTask, LinkEvent};
pub use memory::MemoryRelay;
pub use time::TokioTimeSource;
pub use transport::{Link, Transport, WebSocketTransport};
