//! Consumer-side stream client.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::{SinkExt, Stream, StreamExt};
use tokio::net::{TcpStream, UdpSocket};
use tokio::sync::{mpsc, watch};
use tokio_stream::wrappers::WatchStream;
use tokio_util::codec::{Framed, LengthDelimitedCodec};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use super::command::Command;
use super::wire::{WireFrame, decode_timestamp_datagram};
use super::{ConnectionState, DEFAULT_IDLE_TIMEOUT, DisconnectReason};
use crate::codec::Lz4Codec;
use crate::schema::{HandshakeBlob, Schema};
use crate::segment::{FrameAssembler, FrameDecoder, ReassemblyPolicy};
use crate::types::Frame;
use crate::{Result, StreamError};

/// Client configuration.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub host: String,
    pub port: u16,
    /// Deadline for the TCP connect and for the handshake blob to arrive.
    pub connect_timeout: Duration,
    /// Read-idle period before the keepalive ping.
    pub idle_timeout: Duration,
    /// Partial-frame buffering policy for multi-segment frames.
    pub reassembly: ReassemblyPolicy,
}

impl ClientConfig {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            connect_timeout: Duration::from_secs(5),
            idle_timeout: DEFAULT_IDLE_TIMEOUT,
            reassembly: ReassemblyPolicy::default(),
        }
    }
}

/// Consumer callbacks, dispatched from the connection's receive task.
///
/// All methods default to no-ops so implementors pick only what they need.
#[async_trait]
pub trait ClientListener: Send + Sync + 'static {
    /// The handshake completed and the schema is fixed for this connection.
    async fn on_connected(&self, _schema: Arc<Schema>) {}
    /// The connection ended; [`DisconnectReason::LocalClose`] distinguishes
    /// an application-initiated close from everything else.
    async fn on_disconnected(&self, _reason: DisconnectReason) {}
    /// A recognized command arrived on the text channel.
    async fn on_command(&self, _command: Command) {}
    /// A frame completed reassembly.
    async fn on_data(&self, _frame: Arc<Frame>) {}
    /// A timestamp arrived on the UDP side channel.
    async fn on_timestamp(&self, _timestamp: i64) {}
}

/// Connection to one stream server.
pub struct StreamClient {
    config: ClientConfig,
    listener: Arc<dyn ClientListener>,
    schema: Arc<Schema>,
    state_tx: Arc<watch::Sender<ConnectionState>>,
    frames_rx: watch::Receiver<Option<Arc<Frame>>>,
    to_server: mpsc::Sender<WireFrame>,
    cancel: CancellationToken,
}

impl StreamClient {
    /// Dial the server, complete the handshake and start streaming.
    ///
    /// `on_connected` fires with the negotiated schema before this returns.
    pub async fn connect(
        config: ClientConfig,
        listener: Arc<dyn ClientListener>,
    ) -> Result<StreamClient> {
        let state_tx = Arc::new(watch::channel(ConnectionState::Connecting).0);
        Self::establish(config, listener, state_tx).await
    }

    async fn establish(
        config: ClientConfig,
        listener: Arc<dyn ClientListener>,
        state_tx: Arc<watch::Sender<ConnectionState>>,
    ) -> Result<StreamClient> {
        state_tx.send_replace(ConnectionState::Connecting);
        info!(host = %config.host, port = config.port, "connecting");

        let stream = tokio::time::timeout(
            config.connect_timeout,
            TcpStream::connect((config.host.as_str(), config.port)),
        )
        .await
        .map_err(|_| StreamError::Timeout { duration: config.connect_timeout })?
        .map_err(|e| StreamError::connection_with_source("tcp connect", Box::new(e)))?;
        if let Err(e) = stream.set_nodelay(true) {
            debug!(error = %e, "set_nodelay failed");
        }

        let mut codec = LengthDelimitedCodec::new();
        codec.set_max_frame_length(64 * 1024 * 1024);
        let mut framed = Framed::new(stream, codec);

        state_tx.send_replace(ConnectionState::Handshaking);
        let first = tokio::time::timeout(config.connect_timeout, framed.next())
            .await
            .map_err(|_| StreamError::Timeout { duration: config.connect_timeout })?
            .ok_or_else(|| StreamError::connection("server closed before the handshake"))?
            .map_err(|e| StreamError::connection_with_source("handshake read", Box::new(e)))?;
        let first = WireFrame::decode(first.freeze())
            .map_err(|e| StreamError::corrupt_handshake(e.to_string()))?;
        let schema = match first {
            WireFrame::Handshake(blob) => HandshakeBlob::from_bytes(blob).parse()?,
            other => {
                return Err(StreamError::corrupt_handshake(format!(
                    "expected a handshake frame, got {other:?}"
                )));
            }
        };
        info!(
            variables = schema.variable_count(),
            joint_scalars = schema.joint_scalar_count(),
            "handshake complete"
        );

        // The UDP side channel for timestamps; its local port travels in the
        // one-time configuration command.
        let udp = UdpSocket::bind(("0.0.0.0", 0))
            .await
            .map_err(|e| StreamError::connection_with_source("udp bind", Box::new(e)))?;
        let timestamp_port = udp
            .local_addr()
            .map_err(|e| StreamError::connection_with_source("udp local address", Box::new(e)))?
            .port();

        listener.on_connected(schema.clone()).await;
        state_tx.send_replace(ConnectionState::Streaming);

        let (to_server, from_client) = mpsc::channel(64);
        let (frames_tx, frames_rx) = watch::channel(None);
        let cancel = CancellationToken::new();

        tokio::spawn(receive_loop(ReceiveLoop {
            framed,
            decoder: FrameDecoder::new(schema.clone(), Lz4Codec),
            assembler: FrameAssembler::new(schema.clone(), config.reassembly),
            state_tx: state_tx.clone(),
            frames_tx,
            from_client,
            listener: listener.clone(),
            timestamp_port,
            idle_timeout: config.idle_timeout,
            cancel: cancel.clone(),
        }));
        tokio::spawn(timestamp_loop(udp, listener.clone(), cancel.clone()));

        Ok(StreamClient { config, listener, schema, state_tx, frames_rx, to_server, cancel })
    }

    /// Current connection state.
    pub fn state(&self) -> ConnectionState {
        *self.state_tx.borrow()
    }

    /// Watch connection state transitions, e.g. to await `Closed`.
    pub fn subscribe_state(&self) -> watch::Receiver<ConnectionState> {
        self.state_tx.subscribe()
    }

    /// The schema negotiated for this connection.
    pub fn schema(&self) -> &Arc<Schema> {
        &self.schema
    }

    /// The most recently completed frame, if any.
    pub fn latest_frame(&self) -> Option<Arc<Frame>> {
        self.frames_rx.borrow().clone()
    }

    /// Completed frames as a stream.
    ///
    /// Yields the latest frame at subscription time (late joiners see the
    /// current state immediately) and every completed frame afterwards; a
    /// subscriber that falls behind observes only the newest frame, never a
    /// growing queue. The stream ends when the connection closes.
    pub fn frames(&self) -> impl Stream<Item = Arc<Frame>> + 'static {
        WatchStream::new(self.frames_rx.clone())
            .skip_while(|opt| {
                // Skip leading None (connected, nothing received yet).
                let is_none = opt.is_none();
                async move { is_none }
            })
            .take_while(|opt| {
                // After data flowed, None means the connection ended.
                let is_some = opt.is_some();
                async move { is_some }
            })
            .filter_map(|opt| async move { opt })
    }

    /// Send a command to the server.
    pub async fn send_command(&self, command: Command) -> Result<()> {
        self.to_server
            .send(WireFrame::Command(command.format()))
            .await
            .map_err(|_| StreamError::connection("connection is closed"))
    }

    /// Ask the producer to set a variable, by slot, to the given value
    /// (coerced to the variable's kind). Applied at the producer's next tick.
    pub async fn request_variable_change(&self, slot: u32, value: f64) -> Result<()> {
        self.to_server
            .send(WireFrame::VarChange { slot, value })
            .await
            .map_err(|_| StreamError::connection("connection is closed"))
    }

    /// Close the connection. Idempotent and safe from any task; the receive
    /// loop flushes a Close frame and fires `on_disconnected(LocalClose)`.
    pub fn close(&self) {
        if !self.cancel.is_cancelled() {
            self.cancel.cancel();
        }
    }

    /// True once the connection has fully closed.
    pub fn is_closed(&self) -> bool {
        *self.state_tx.borrow() == ConnectionState::Closed
    }

    /// Discard this connection's state entirely and redial from scratch.
    ///
    /// Reconnection is deliberate, never automatic: the current schema and
    /// any partial frames are dropped, the state machine re-enters
    /// `Connecting`, and a fresh handshake fixes a fresh schema (the server
    /// may have restarted with a different registry).
    pub async fn reconnect(&mut self) -> Result<()> {
        let mut state_rx = self.state_tx.subscribe();
        self.cancel.cancel();
        // Let the old receive loop finish tearing down, so the observable
        // state passes cleanly through Closed before Reconnecting.
        while *state_rx.borrow_and_update() != ConnectionState::Closed {
            if state_rx.changed().await.is_err() {
                break;
            }
        }
        self.state_tx.send_replace(ConnectionState::Reconnecting);

        let fresh =
            Self::establish(self.config.clone(), self.listener.clone(), self.state_tx.clone())
                .await?;
        *self = fresh;
        Ok(())
    }
}

impl Drop for StreamClient {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

struct ReceiveLoop {
    framed: Framed<TcpStream, LengthDelimitedCodec>,
    decoder: FrameDecoder<Lz4Codec>,
    assembler: FrameAssembler,
    state_tx: Arc<watch::Sender<ConnectionState>>,
    frames_tx: watch::Sender<Option<Arc<Frame>>>,
    from_client: mpsc::Receiver<WireFrame>,
    listener: Arc<dyn ClientListener>,
    timestamp_port: u16,
    idle_timeout: Duration,
    cancel: CancellationToken,
}

/// Owns the socket: all reads, and all writes (commands, pings, close) so
/// nothing can interleave on the wire.
async fn receive_loop(mut ctx: ReceiveLoop) {
    let mut sent_configuration = false;
    let mut waiting_for_pong = false;
    let idle = tokio::time::sleep(ctx.idle_timeout);
    tokio::pin!(idle);

    let reason = loop {
        tokio::select! {
            _ = ctx.cancel.cancelled() => {
                ctx.state_tx.send_replace(ConnectionState::Closing);
                let _ = ctx.framed.send(WireFrame::Close(Some(0)).encode()).await;
                break DisconnectReason::LocalClose;
            }

            outgoing = ctx.from_client.recv() => {
                let Some(frame) = outgoing else {
                    // Client handle dropped without close(); same thing.
                    ctx.state_tx.send_replace(ConnectionState::Closing);
                    let _ = ctx.framed.send(WireFrame::Close(Some(0)).encode()).await;
                    break DisconnectReason::LocalClose;
                };
                if let Err(e) = ctx.framed.send(frame.encode()).await {
                    break DisconnectReason::TransportError(e.to_string());
                }
            }

            () = &mut idle => {
                if waiting_for_pong {
                    warn!("no pong before the idle deadline, closing dead connection");
                    break DisconnectReason::IdleTimeout;
                }
                waiting_for_pong = true;
                if ctx.framed.send(WireFrame::Ping.encode()).await.is_err() {
                    break DisconnectReason::TransportError("ping write failed".to_string());
                }
                idle.as_mut().set(tokio::time::sleep(ctx.idle_timeout));
            }

            received = ctx.framed.next() => {
                let Some(received) = received else {
                    break DisconnectReason::TransportError("server closed the stream".to_string());
                };
                let bytes = match received {
                    Ok(bytes) => bytes.freeze(),
                    Err(e) => break DisconnectReason::TransportError(e.to_string()),
                };
                idle.as_mut().set(tokio::time::sleep(ctx.idle_timeout));
                waiting_for_pong = false;

                match WireFrame::decode(bytes) {
                    Ok(WireFrame::Data(payload)) => {
                        if !sent_configuration {
                            // Exactly once per connection, triggered by the
                            // first data frame: ask for the side channel.
                            sent_configuration = true;
                            let command =
                                Command::SendTimestamps { port: ctx.timestamp_port };
                            if ctx
                                .framed
                                .send(WireFrame::Command(command.format()).encode())
                                .await
                                .is_err()
                            {
                                break DisconnectReason::TransportError(
                                    "configuration write failed".to_string(),
                                );
                            }
                        }
                        match ctx.decoder.decode(&payload) {
                            Ok(segment) => {
                                trace!(
                                    uid = segment.uid,
                                    index = segment.segment_index,
                                    "segment received"
                                );
                                if let Some(frame) = ctx.assembler.offer(segment) {
                                    let frame = Arc::new(frame);
                                    ctx.frames_tx.send_replace(Some(frame.clone()));
                                    ctx.listener.on_data(frame).await;
                                }
                            }
                            Err(e) => {
                                // Drop the segment, mark nothing fatal; the
                                // frame stays incomplete and streaming goes on.
                                warn!(error = %e, "segment dropped");
                            }
                        }
                    }
                    Ok(WireFrame::Command(text)) => {
                        if let Some(command) = Command::parse(&text) {
                            ctx.listener.on_command(command).await;
                        }
                    }
                    Ok(WireFrame::Ping) => {
                        if ctx.framed.send(WireFrame::Pong.encode()).await.is_err() {
                            break DisconnectReason::TransportError(
                                "pong write failed".to_string(),
                            );
                        }
                    }
                    Ok(WireFrame::Pong) => {}
                    Ok(WireFrame::Close(code)) => {
                        info!(?code, "server closed the connection");
                        ctx.state_tx.send_replace(ConnectionState::Closing);
                        break DisconnectReason::ClosedByPeer { reason: code };
                    }
                    Ok(WireFrame::Handshake(_)) => {
                        // The schema is immutable after the handshake; a
                        // second blob would mean a protocol violation.
                        warn!("unexpected mid-stream handshake ignored");
                    }
                    Ok(WireFrame::VarChange { .. }) => {
                        debug!("ignoring frame kind only the client sends");
                    }
                    Err(e) => {
                        warn!(error = %e, "undecodable frame dropped");
                    }
                }
            }
        }
    };

    let _ = ctx.framed.close().await;
    ctx.cancel.cancel();
    ctx.state_tx.send_replace(ConnectionState::Closed);
    ctx.listener.on_disconnected(reason).await;
    debug!("receive loop ended");
}

/// Reads timestamp datagrams off the UDP side channel.
async fn timestamp_loop(udp: UdpSocket, listener: Arc<dyn ClientListener>, cancel: CancellationToken) {
    let mut buf = [0u8; 64];
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            received = udp.recv_from(&mut buf) => match received {
                Ok((len, _)) => {
                    if let Some(timestamp) = decode_timestamp_datagram(&buf[..len]) {
                        listener.on_timestamp(timestamp).await;
                    }
                }
                Err(e) => {
                    debug!(error = %e, "timestamp channel read failed");
                    break;
                }
            }
        }
    }
}
