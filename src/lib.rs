//! Registry-variable streaming and disk logging for robot control loops.
//!
//! Varstream streams a large, dynamically described set of numeric state
//! variables (tens of thousands of registry variables plus joint states)
//! from a producing real-time loop to any number of remote consumers, and
//! logs the same stream to disk with an index usable for synchronized
//! playback against externally timestamped artifacts such as video.
//!
//! # Architecture
//!
//! - A [`RegistryTree`] names and orders every variable and joint; its
//!   deterministic pre-order flattening is the [`Schema`], exchanged once per
//!   connection as a [`HandshakeBlob`]. All frame data afterwards is
//!   positional.
//! - A [`SegmentPlan`] splits oversized frames into transport-sized,
//!   independently compressed segments using a [`CompressionCodec`]'s sizing
//!   bounds; [`FrameEncoder`] and [`FrameDecoder`]/[`FrameAssembler`]
//!   round-trip frames bit-exactly through them.
//! - [`StreamServer`] and [`StreamClient`] speak the framed transport:
//!   handshake, text commands, binary data frames, keepalive ping/pong and
//!   explicit reconnect.
//! - [`LogWriter`]/[`LogReader`] persist the stream per session directory;
//!   [`TimestampCorrelator`] aligns the control loop's clock with an external
//!   one.
//!
//! # Producer example
//!
//! ```rust,no_run
//! use varstream::{
//!     NodeId, RegistryTree, Schema, ServerConfig, StreamServer, Value, VariableDescriptor,
//!     VariableKind,
//! };
//!
//! #[tokio::main]
//! async fn main() -> varstream::Result<()> {
//!     let mut tree = RegistryTree::new("controller");
//!     tree.add_variable(NodeId::ROOT, VariableDescriptor::new("q_d", VariableKind::Double))?;
//!     let schema = Schema::from_tree(&tree, &[], 0.001)?;
//!
//!     let mut store = schema.new_store();
//!     let joints = schema.new_joint_states();
//!     let mut server = StreamServer::start(ServerConfig::default(), schema).await?;
//!
//!     // In the control loop, once per sample period:
//!     store.set(0, Value::Double(0.5))?;
//!     server.update(1_000_000, &mut store, &joints)?;
//!     Ok(())
//! }
//! ```
//!
//! # Consumer example
//!
//! ```rust,no_run
//! use futures::StreamExt;
//! use std::sync::Arc;
//! use varstream::{ClientConfig, ClientListener, StreamClient};
//!
//! struct Quiet;
//! #[async_trait::async_trait]
//! impl ClientListener for Quiet {}
//!
//! #[tokio::main]
//! async fn main() -> varstream::Result<()> {
//!     let client =
//!         StreamClient::connect(ClientConfig::new("robot1.local", 8008), Arc::new(Quiet)).await?;
//!     let mut frames = Box::pin(client.frames());
//!     while let Some(frame) = frames.next().await {
//!         println!("uid {} at {}", frame.uid, frame.timestamp);
//!     }
//!     Ok(())
//! }
//! ```

// Core data model and error handling
mod error;
pub mod registry;
pub mod types;

// Schema negotiation and the segment pipeline
pub mod codec;
pub mod schema;
pub mod segment;

// Transport, logging, correlation, discovery
pub mod discovery;
pub mod log;
pub mod timesync;
pub mod transport;

// Core exports
pub use error::{Result, StreamError};
pub use registry::{JointStateSet, NodeId, RegistryTree, VariableStore};
pub use types::*;

// Schema exports
pub use schema::{HandshakeBlob, PROTOCOL_VERSION, Schema};

// Codec and segmentation exports
pub use codec::{CompressionCodec, IdentityCodec, Lz4Codec};
pub use segment::{
    DecodedSegment, FrameAssembler, FrameDecoder, FrameEncoder, ReassemblyPolicy,
    SEGMENT_HEADER_LEN, SegmentPlan, SegmentSpec,
};

// Transport exports
pub use transport::{
    ClientConfig, ClientListener, Command, ConnectionState, DisconnectReason, ServerConfig,
    StreamClient, StreamServer,
};

// Logging and correlation exports
pub use log::{LogIndexEntry, LogManifest, LogReader, LogWriter, compress_log};
pub use timesync::{TimestampCorrelator, TimestampSample};

// Discovery exports
pub use discovery::{DiscoveryRecord, load_host_list, save_host_list};
