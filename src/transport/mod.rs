//! Framed transport: handshake exchange, command channel, binary data
//! frames, keepalive and reconnect.
//!
//! Frames travel length-delimited over TCP. Per connection the state machine
//! is `Connecting → Handshaking → Streaming → Closing → Closed`; an
//! unexpected closure can be followed by an explicit, caller-driven
//! `Reconnecting → Connecting`; there is no automatic background retry, and
//! a clean "not connected" state is observable in between.
//!
//! Wire frame kinds: **Handshake** (the schema blob, once per connection),
//! **Command** (UTF-8 text, enumerated vocabulary with one integer argument),
//! **Data** (one segment payload), **Ping/Pong** (liveness), **Close**
//! (optional reason code) and **VarChange** (binary variable change request).
//!
//! Keepalive: when nothing readable arrives within the idle timeout a Ping is
//! sent; a second silent idle period closes the connection as dead.

mod client;
mod command;
mod server;
mod wire;

pub use client::{ClientConfig, ClientListener, StreamClient};
pub use command::Command;
pub use server::{ServerConfig, StreamServer};

use std::time::Duration;

/// Connection lifecycle, observable on the client.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// Underlying transport is being established.
    Connecting,
    /// Connected, waiting for the peer's handshake blob.
    Handshaking,
    /// Schema negotiated; command and data frames flow.
    Streaming,
    /// Close initiated, in-flight frames are flushing.
    Closing,
    /// Fully closed; reconnecting is an explicit caller action.
    Closed,
    /// Caller requested a reconnect; connection state is being discarded
    /// before re-entering `Connecting`.
    Reconnecting,
}

/// Why a connection ended. Passed to
/// [`ClientListener::on_disconnected`]; an application-initiated close is
/// distinguished from everything the peer or the network did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DisconnectReason {
    /// This side called `close()`.
    LocalClose,
    /// The peer sent a Close frame, with its optional reason code.
    ClosedByPeer { reason: Option<u32> },
    /// No Pong arrived within the keepalive deadline.
    IdleTimeout,
    /// The underlying transport failed or reached end of stream.
    TransportError(String),
}

/// Default transport payload limit: a safe UDP-datagram-sized bound that also
/// keeps TCP frames small enough for real-time fan-out.
pub const DEFAULT_TRANSPORT_LIMIT: usize = 65_000;

/// Default read-idle period before a Ping is sent.
pub const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_secs(2);
