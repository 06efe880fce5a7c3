//! Widget Relay Core
//!
//! Sans-IO implementation of the peer state relay protocol: named states
//! replicated across every peer on a relay channel, with throttled delta
//! sync, periodic full resync and peer presence handling.
//!
//! Nothing in this crate performs I/O. A runtime drives [`RelaySession`]
//! with connection status changes, inbound frames and timer expiries, and
//! executes the [`Effect`]s it produces.

// ----------------------------------------------------------------------------
// Module Declarations
// ----------------------------------------------------------------------------

pub mod config;
pub mod diff;
pub mod errors;
pub mod scheduler;
pub mod session;
pub mod store;
pub mod types;
pub mod wire;

// ----------------------------------------------------------------------------
// Public API
// ----------------------------------------------------------------------------

pub use config::{
    channel_from_query, connection_url, reconnect_delay, RelayConfig, SessionConfig,
    DEFAULT_FULL_SYNC_INTERVAL, DEFAULT_RELAY_URL,
};
pub use errors::{PatchError, RelayError, RelayResult};
pub use scheduler::{Outgoing, SyncDecision, SyncScheduler, DEFAULT_THROTTLE_INTERVAL};
pub use session::{Effect, RelaySession, SessionStats, StateKey};
pub use store::{PeerStateStore, WatchCallback, WatchId, WatchOptions};
pub use types::{
    ConnectionStatus, ManualTimeSource, MonotonicTimeSource, PeerId, TimeSource, Timestamp,
};
pub use wire::WireMessage;
