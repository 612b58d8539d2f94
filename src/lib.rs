//! splicer - two-sided TCP rendezvous broker.
//!
//! Listens on a *supply* port and a *demand* port, pairs each new connection
//! on one side with the oldest waiting connection on the other, then splices
//! the two byte streams together until either peer disconnects. An optional
//! *driver* port publishes the running count of unmatched demand so external
//! provisioners know when to spawn more supply.
//!
//! # Architecture
//!
//! A single-threaded cooperative event loop. The only asynchrony is signal
//! delivery, latched into atomic flags and consumed at one point per
//! iteration:
//!
//! - **SocketMux** - owns every socket, polls for readiness, queues events
//! - **Broker** - the pairing state machine driving the multiplexer
//! - **SignalBridge** - flag-latching handlers plus mask fencing
//! - **logger** - signal-safe stderr sink behind the `log` facade
//!
//! # Modules
//!
//! - [`broker`] - pairing tables and the event loop
//! - [`sockets`] - poll-based multiplexer with freeze/unfreeze flow control
//! - [`signals`] - signal latching and blocking
//! - [`config`] - validated runtime settings
//! - [`clock`] - alarm timer and wall-clock seconds
//! - [`logger`] - stderr log sink

pub mod broker;
pub mod clock;
pub mod config;
pub mod logger;
pub mod signals;
pub mod sockets;

// Re-export the types an embedder needs.
pub use broker::Broker;
pub use config::Config;
pub use sockets::{Descriptor, SocketMux};
