//! Producer-side stream server.
//!
//! The server owns the listening socket and one task per accepted consumer.
//! The producer's control loop calls [`StreamServer::update`] once per sample
//! period: that call packs the frame on the caller thread (cheap, no I/O) and
//! hands it to the transmit worker through a single-slot overwrite channel.
//! If the worker cannot keep up, older undelivered frames are overwritten:
//! backpressure is absorbed by staleness, never by blocking the control loop.
//!
//! Per connection, command and data writes are serialized through the one
//! connection task that owns the socket, so partial frames can never
//! interleave on the wire.

use std::collections::HashSet;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream, UdpSocket};
use tokio::sync::{broadcast, mpsc, watch};
use tokio_util::codec::{Framed, LengthDelimitedCodec};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use super::command::Command;
use super::wire::{DATA_FRAME_OVERHEAD, WireFrame, encode_timestamp_datagram};
use super::{DEFAULT_IDLE_TIMEOUT, DEFAULT_TRANSPORT_LIMIT};
use crate::codec::Lz4Codec;
use crate::registry::{JointStateSet, VariableStore};
use crate::schema::{HandshakeBlob, Schema};
use crate::segment::{FrameEncoder, SegmentPlan};
use crate::types::Frame;
use crate::{Result, StreamError};

/// Queued variable change requests the producer applies between ticks.
const VARIABLE_CHANGE_CAPACITY: usize = 128;

/// Encoded wire frames awaiting fan-out. Kept per frame so late joiners can
/// be served the most recent snapshot.
struct EncodedFrame {
    uid: u64,
    timestamp: i64,
    frames: Vec<Bytes>,
}

/// Server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Listen address. Port 0 picks an ephemeral port, observable through
    /// [`StreamServer::local_addr`].
    pub bind: SocketAddr,
    /// Maximum encoded data frame size; drives the segmentation plan.
    pub transport_limit: usize,
    /// Read-idle period before the keepalive ping.
    pub idle_timeout: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: SocketAddr::from(([0, 0, 0, 0], 8008)),
            transport_limit: DEFAULT_TRANSPORT_LIMIT,
            idle_timeout: DEFAULT_IDLE_TIMEOUT,
        }
    }
}

struct ServerShared {
    handshake: Bytes,
    broadcast_tx: broadcast::Sender<Arc<EncodedFrame>>,
    snapshot_rx: watch::Receiver<Option<Arc<EncodedFrame>>>,
    changes_tx: mpsc::Sender<(u32, f64)>,
    timestamp_targets: Mutex<HashSet<SocketAddr>>,
    idle_timeout: Duration,
}

/// The producer-side data server.
pub struct StreamServer {
    schema: Arc<Schema>,
    encoder: Arc<FrameEncoder<Lz4Codec>>,
    frame_tx: watch::Sender<Option<Arc<Frame>>>,
    timestamp_tx: watch::Sender<i64>,
    changes_rx: mpsc::Receiver<(u32, f64)>,
    next_uid: u64,
    local_addr: SocketAddr,
    cancel: CancellationToken,
}

impl StreamServer {
    /// Plan segmentation, bind the sockets and start accepting consumers.
    ///
    /// A schema that cannot be segmented under `config.transport_limit` is a
    /// [`StreamError::Configuration`] here, before any client can connect.
    pub async fn start(config: ServerConfig, schema: Arc<Schema>) -> Result<StreamServer> {
        let plan = SegmentPlan::for_schema(
            &schema,
            DATA_FRAME_OVERHEAD,
            config.transport_limit,
            &Lz4Codec,
        )?;
        info!(
            variables = schema.variable_count(),
            joint_scalars = schema.joint_scalar_count(),
            segments = plan.segment_count(),
            "segmentation planned"
        );
        let encoder = Arc::new(FrameEncoder::new(schema.clone(), plan, Lz4Codec));
        let handshake = HandshakeBlob::from_schema(&schema).into_bytes();

        let listener = TcpListener::bind(config.bind)
            .await
            .map_err(|e| StreamError::connection_with_source("bind failed", Box::new(e)))?;
        let local_addr = listener
            .local_addr()
            .map_err(|e| StreamError::connection_with_source("local address", Box::new(e)))?;
        let udp = Arc::new(
            UdpSocket::bind((local_addr.ip(), 0))
                .await
                .map_err(|e| StreamError::connection_with_source("udp bind", Box::new(e)))?,
        );

        let (frame_tx, frame_rx) = watch::channel(None);
        let (timestamp_tx, timestamp_rx) = watch::channel(0i64);
        let (snapshot_tx, snapshot_rx) = watch::channel(None);
        let (changes_tx, changes_rx) = mpsc::channel(VARIABLE_CHANGE_CAPACITY);
        let (broadcast_tx, _) = broadcast::channel(32);

        let shared = Arc::new(ServerShared {
            handshake,
            broadcast_tx: broadcast_tx.clone(),
            snapshot_rx,
            changes_tx,
            timestamp_targets: Mutex::new(HashSet::new()),
            idle_timeout: config.idle_timeout,
        });
        let cancel = CancellationToken::new();

        tokio::spawn(transmit_worker(
            frame_rx,
            encoder.clone(),
            broadcast_tx,
            snapshot_tx,
            cancel.clone(),
        ));
        tokio::spawn(timestamp_worker(timestamp_rx, udp, shared.clone(), cancel.clone()));
        tokio::spawn(accept_loop(listener, shared, cancel.clone()));

        info!(%local_addr, "stream server listening");
        Ok(StreamServer {
            schema,
            encoder,
            frame_tx,
            timestamp_tx,
            changes_rx,
            next_uid: 0,
            local_addr,
            cancel,
        })
    }

    /// Publish one sample tick.
    ///
    /// Runs on the caller's (control loop) thread: applies queued variable
    /// change requests, packs the frame, and hands it off. Never blocks on
    /// the network and never compresses; the transmit worker does that.
    /// Returns the frame uid.
    pub fn update(
        &mut self,
        timestamp: i64,
        store: &mut VariableStore,
        joints: &JointStateSet,
    ) -> Result<u64> {
        if self.cancel.is_cancelled() {
            return Err(StreamError::connection("server is closed"));
        }

        while let Ok((slot, value)) = self.changes_rx.try_recv() {
            match store.set_from_double(slot as usize, value) {
                Ok(()) => debug!(slot, value, "applied variable change request"),
                Err(e) => warn!(slot, error = %e, "rejected variable change request"),
            }
        }

        let uid = self.next_uid;
        let frame = self.encoder.pack(uid, timestamp, store, joints)?;
        self.next_uid += 1;
        self.frame_tx.send_replace(Some(Arc::new(frame)));
        self.timestamp_tx.send_replace(timestamp);
        Ok(uid)
    }

    pub fn schema(&self) -> &Arc<Schema> {
        &self.schema
    }

    /// The bound listen address.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Shut the server down. Idempotent and safe from any thread; in-flight
    /// writes are allowed to flush while each connection sends its Close
    /// frame.
    pub fn close(&self) {
        if !self.cancel.is_cancelled() {
            info!("stream server closing");
            self.cancel.cancel();
        }
    }

    pub fn is_closed(&self) -> bool {
        self.cancel.is_cancelled()
    }
}

impl Drop for StreamServer {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

/// Encodes the newest packed frame and fans it out. Reads through the watch
/// channel's overwrite semantics: a slow encode simply skips to the latest
/// frame afterwards.
async fn transmit_worker(
    mut frame_rx: watch::Receiver<Option<Arc<Frame>>>,
    encoder: Arc<FrameEncoder<Lz4Codec>>,
    broadcast_tx: broadcast::Sender<Arc<EncodedFrame>>,
    snapshot_tx: watch::Sender<Option<Arc<EncodedFrame>>>,
    cancel: CancellationToken,
) {
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            changed = frame_rx.changed() => {
                if changed.is_err() {
                    break;
                }
            }
        }
        let Some(frame) = frame_rx.borrow_and_update().clone() else { continue };

        match encoder.encode(&frame) {
            Ok(payloads) => {
                trace!(uid = frame.uid, segments = payloads.len(), "frame encoded");
                let frames =
                    payloads.into_iter().map(|p| WireFrame::Data(p).encode()).collect();
                let encoded =
                    Arc::new(EncodedFrame { uid: frame.uid, timestamp: frame.timestamp, frames });
                snapshot_tx.send_replace(Some(encoded.clone()));
                // No receivers just means no consumers are connected yet.
                let _ = broadcast_tx.send(encoded);
            }
            Err(e) => {
                // The plan guaranteed the limit; an oversized payload here is
                // a configuration fault, so the whole server comes down
                // rather than streaming partial frames.
                warn!(error = %e, "frame encoding failed, closing server");
                cancel.cancel();
                break;
            }
        }
    }
    debug!("transmit worker stopped");
}

/// Pushes each published timestamp to every registered UDP target.
async fn timestamp_worker(
    mut timestamp_rx: watch::Receiver<i64>,
    udp: Arc<UdpSocket>,
    shared: Arc<ServerShared>,
    cancel: CancellationToken,
) {
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            changed = timestamp_rx.changed() => {
                if changed.is_err() {
                    break;
                }
            }
        }
        let timestamp = *timestamp_rx.borrow_and_update();
        let targets: Vec<SocketAddr> = match shared.timestamp_targets.lock() {
            Ok(guard) => guard.iter().copied().collect(),
            Err(_) => break,
        };
        if targets.is_empty() {
            continue;
        }
        let datagram = encode_timestamp_datagram(timestamp);
        for target in targets {
            if let Err(e) = udp.send_to(&datagram, target).await {
                debug!(%target, error = %e, "timestamp push failed");
            }
        }
    }
}

async fn accept_loop(listener: TcpListener, shared: Arc<ServerShared>, cancel: CancellationToken) {
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    info!(%peer, "consumer connected");
                    tokio::spawn(handle_connection(stream, peer, shared.clone(), cancel.clone()));
                }
                Err(e) => {
                    warn!(error = %e, "accept failed");
                    tokio::time::sleep(Duration::from_millis(100)).await;
                }
            }
        }
    }
    debug!("accept loop stopped");
}

/// One task per consumer: owns the socket, serializes all writes, answers the
/// command channel and keeps the connection alive.
async fn handle_connection(
    stream: TcpStream,
    peer: SocketAddr,
    shared: Arc<ServerShared>,
    cancel: CancellationToken,
) {
    let mut codec = LengthDelimitedCodec::new();
    // Handshake blobs for large registries dwarf data frames; the frame
    // length cap only guards against garbage, not real traffic.
    codec.set_max_frame_length(64 * 1024 * 1024);
    let mut framed = Framed::new(stream, codec);

    if let Err(e) = framed.send(WireFrame::Handshake(shared.handshake.clone()).encode()).await {
        warn!(%peer, error = %e, "handshake send failed");
        return;
    }

    let mut data_rx = shared.broadcast_tx.subscribe();

    // Serve the late joiner the newest frame right away. The uid guard below
    // also keeps the broadcast backlog from re-sending this same frame.
    let snapshot = shared.snapshot_rx.borrow().clone();
    let mut last_sent_timestamp = i64::MIN;
    let mut last_sent_uid: Option<u64> = None;
    if let Some(encoded) = snapshot {
        if send_encoded(&mut framed, &encoded).await.is_err() {
            return;
        }
        last_sent_timestamp = encoded.timestamp;
        last_sent_uid = Some(encoded.uid);
    }

    let mut rate_limit_millis: u32 = 0;
    let mut waiting_for_pong = false;
    let idle = tokio::time::sleep(shared.idle_timeout);
    tokio::pin!(idle);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                let _ = framed.send(WireFrame::Close(Some(0)).encode()).await;
                break;
            }

            () = &mut idle => {
                if waiting_for_pong {
                    warn!(%peer, "no pong before the idle deadline, closing dead connection");
                    break;
                }
                waiting_for_pong = true;
                if framed.send(WireFrame::Ping.encode()).await.is_err() {
                    break;
                }
                idle.as_mut().set(tokio::time::sleep(shared.idle_timeout));
            }

            received = framed.next() => {
                let Some(received) = received else {
                    info!(%peer, "consumer disconnected");
                    break;
                };
                let bytes = match received {
                    Ok(bytes) => bytes.freeze(),
                    Err(e) => {
                        warn!(%peer, error = %e, "read failed");
                        break;
                    }
                };
                idle.as_mut().set(tokio::time::sleep(shared.idle_timeout));
                waiting_for_pong = false;

                match WireFrame::decode(bytes) {
                    Ok(WireFrame::Command(text)) => match Command::parse(&text) {
                        Some(Command::SendTimestamps { port }) => {
                            let target = SocketAddr::new(peer.ip(), port);
                            info!(%peer, %target, "timestamp push requested");
                            if let Ok(mut targets) = shared.timestamp_targets.lock() {
                                targets.insert(target);
                            }
                        }
                        Some(Command::LimitRate { millis }) => {
                            debug!(%peer, millis, "rate limit requested");
                            rate_limit_millis = millis;
                        }
                        None => {}
                    },
                    Ok(WireFrame::VarChange { slot, value }) => {
                        if shared.changes_tx.try_send((slot, value)).is_err() {
                            warn!(%peer, slot, "variable change queue full, dropping request");
                        }
                    }
                    Ok(WireFrame::Ping) => {
                        if framed.send(WireFrame::Pong.encode()).await.is_err() {
                            break;
                        }
                    }
                    Ok(WireFrame::Pong) => {}
                    Ok(WireFrame::Close(reason)) => {
                        info!(%peer, ?reason, "consumer sent close");
                        break;
                    }
                    Ok(WireFrame::Handshake(_)) | Ok(WireFrame::Data(_)) => {
                        debug!(%peer, "ignoring frame kind only the server sends");
                    }
                    Err(e) => {
                        // Per-frame recoverable: drop and keep the connection.
                        warn!(%peer, error = %e, "undecodable frame dropped");
                    }
                }
            }

            encoded = data_rx.recv() => match encoded {
                Ok(encoded) => {
                    if last_sent_uid.is_some_and(|last| encoded.uid <= last) {
                        continue;
                    }
                    if rate_limit_millis > 0
                        && encoded.timestamp - last_sent_timestamp
                            < rate_limit_millis as i64 * 1_000_000
                    {
                        continue;
                    }
                    if send_encoded(&mut framed, &encoded).await.is_err() {
                        break;
                    }
                    last_sent_timestamp = encoded.timestamp;
                    last_sent_uid = Some(encoded.uid);
                }
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    // Slow consumer: stale frames are overwritten, the stream
                    // continues from the newest.
                    debug!(%peer, skipped, "consumer lagged, dropping stale frames");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    }

    let _ = framed.close().await;
    debug!(%peer, "connection task ended");
}

async fn send_encoded(
    framed: &mut Framed<TcpStream, LengthDelimitedCodec>,
    encoded: &EncodedFrame,
) -> std::io::Result<()> {
    for frame in &encoded.frames {
        framed.feed(frame.clone()).await?;
    }
    framed.flush().await
}
