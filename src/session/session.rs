//! One connection's protocol state and I/O pumps.
//!
//! Each [`Session`] runs two tasks over its transport:
//! - the receive pump reads frames and pushes binary payloads into a
//!   bounded inbound queue
//! - the transmit pump pops a bounded outbound queue and writes frames
//!
//! Inbound payloads are decoded and dispatched on the manager's tick by
//! [`Session::update`], never on the pump itself, so handlers for one session
//! always run sequentially and in arrival order. A peer hanging up is queued
//! behind the packets it sent before, so those are still dispatched.

use std::net::SocketAddr;
use std::sync::{Arc, Mutex, MutexGuard, OnceLock};
use std::time::Duration;

use bytes::Bytes;
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::codec::Framed;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};
use uuid::Uuid;

use crate::config::SessionConfig;
use crate::core::codec::{Frame, FrameCodec, Opcode};
use crate::core::packet::Packet;
use crate::error::{constants, Error, Result};
use crate::protocol::handler::PacketHandler;
use crate::protocol::state::{ConnectionState, StateCell};
use crate::utils::metrics::global_metrics;

/// What the receive pump hands to the tick.
#[derive(Debug)]
enum Inbound {
    Payload(Bytes),
    /// Close frame or end of stream
    Hangup,
}

/// A single logical connection.
#[derive(Debug)]
pub struct Session {
    id: Uuid,
    peer_id: OnceLock<Uuid>,
    addr: Option<SocketAddr>,
    state: StateCell,
    opened_at: Instant,
    inbound: Mutex<mpsc::Receiver<Inbound>>,
    outbound: mpsc::Sender<Bytes>,
    cancel: CancellationToken,
}

impl Session {
    /// Wrap `transport` and start both pumps.
    pub fn start<T>(
        id: Uuid,
        transport: T,
        addr: Option<SocketAddr>,
        config: &SessionConfig,
        max_frame_size: usize,
    ) -> Arc<Self>
    where
        T: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        let (inbound_tx, inbound_rx) = mpsc::channel(config.inbound_capacity.max(1));
        let (outbound_tx, outbound_rx) = mpsc::channel(config.outbound_capacity.max(1));

        let session = Arc::new(Self {
            id,
            peer_id: OnceLock::new(),
            addr,
            state: StateCell::new(),
            opened_at: Instant::now(),
            inbound: Mutex::new(inbound_rx),
            outbound: outbound_tx,
            cancel: CancellationToken::new(),
        });

        let framed = Framed::new(transport, FrameCodec::new(max_frame_size));
        let (sink, stream) = framed.split();

        tokio::spawn(receive_pump(Arc::clone(&session), stream, inbound_tx));
        tokio::spawn(transmit_pump(
            session.id,
            sink,
            outbound_rx,
            session.cancel.clone(),
        ));

        session
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Identity the peer announced during the handshake.
    pub fn peer_id(&self) -> Option<Uuid> {
        self.peer_id.get().copied()
    }

    /// Record the peer's identity. Only the first call has an effect.
    pub fn set_peer_id(&self, peer: Uuid) {
        if self.peer_id.set(peer).is_err() {
            debug!(session = %self.id, %peer, "Peer identity already recorded");
        }
    }

    pub fn addr(&self) -> Option<SocketAddr> {
        self.addr
    }

    pub fn state(&self) -> ConnectionState {
        self.state.get()
    }

    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    pub fn is_closed(&self) -> bool {
        self.state() == ConnectionState::Disconnected
    }

    /// Still in the handshake more than `timeout` after the session opened.
    pub fn handshake_expired(&self, timeout: Duration) -> bool {
        self.state() == ConnectionState::Connecting && self.opened_at.elapsed() >= timeout
    }

    /// Move from Connecting to Connected.
    pub fn mark_connected(&self) -> bool {
        self.state.connect()
    }

    /// Token cancelled once the session closes.
    pub fn closed(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Queue a packet for the peer, waiting while the outbound queue is full.
    pub async fn send_packet(&self, packet: &Packet) -> Result<()> {
        if self.is_closed() {
            return Err(Error::SessionClosed);
        }

        let bytes = packet.encode()?;
        trace!(session = %self.id, kind = %packet.kind(), "Queue packet");

        tokio::select! {
            sent = self.outbound.send(bytes) => sent.map_err(|_| Error::SessionClosed),
            _ = self.cancel.cancelled() => Err(Error::SessionClosed),
        }
    }

    /// Close the session, telling the peer with a `DisconnectionNotification`.
    ///
    /// Idempotent; returns whether this call closed the session.
    pub fn close(&self) -> bool {
        self.shutdown(Packet::DisconnectionNotification)
    }

    /// Close the session after a terminal packet such as `BadRequest`.
    pub fn reject(&self, packet: Packet) -> bool {
        self.shutdown(packet)
    }

    fn shutdown(&self, last: Packet) -> bool {
        if !self.state.disconnect() {
            return false;
        }

        debug!(session = %self.id, kind = %last.kind(), "Closing session");
        match last.encode() {
            Ok(bytes) => {
                if self.outbound.try_send(bytes).is_err() {
                    debug!(session = %self.id, "Outbound queue full, final packet dropped");
                }
            }
            Err(e) => warn!(session = %self.id, error = %e, "Failed to encode final packet"),
        }

        self.cancel.cancel();
        true
    }

    /// Decode and dispatch up to `batch` queued payloads, then run every
    /// handler's per-tick hook.
    ///
    /// A payload that fails to decode rejects the session with `BadRequest`.
    pub async fn update(self: &Arc<Self>, handlers: &[Arc<dyn PacketHandler>], batch: usize) {
        for _ in 0..batch {
            if self.is_closed() {
                return;
            }

            let next = self.lock_inbound().try_recv();
            let payload = match next {
                Ok(Inbound::Payload(payload)) => payload,
                Ok(Inbound::Hangup) => {
                    debug!(session = %self.id, "Peer hung up");
                    self.close();
                    return;
                }
                Err(_) => break,
            };

            let packet = match Packet::decode(&payload) {
                Ok(packet) => packet,
                Err(e) => {
                    global_metrics().protocol_error();
                    warn!(session = %self.id, error = %e, "Malformed packet");
                    self.reject(Packet::BadRequest {
                        message: e.to_string(),
                    });
                    return;
                }
            };

            trace!(session = %self.id, kind = %packet.kind(), "Dispatch packet");
            for handler in handlers {
                if let Err(e) = handler.handle_packet(self, &packet).await {
                    self.handle_error(e).await;
                }
            }
        }

        if self.is_closed() {
            return;
        }

        for handler in handlers {
            if let Err(e) = handler.on_update(self).await {
                self.handle_error(e).await;
            }
        }
    }

    /// Fatal errors close the session; domain errors are reported to the peer.
    async fn handle_error(&self, error: Error) {
        if error.is_connection_fatal() {
            debug!(session = %self.id, error = %error, "Fatal session error");
            self.close();
            return;
        }

        debug!(session = %self.id, error = %error, "Request failed");
        let reply = Packet::ErrorMessage { code: error.code() };
        if let Err(e) = self.send_packet(&reply).await {
            debug!(session = %self.id, error = %e, "Failed to report error");
        }
    }

    fn lock_inbound(&self) -> MutexGuard<'_, mpsc::Receiver<Inbound>> {
        self.inbound
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

type FrameStream<T> = SplitStream<Framed<T, FrameCodec>>;
type FrameSink<T> = SplitSink<Framed<T, FrameCodec>, Frame>;

async fn receive_pump<T>(
    session: Arc<Session>,
    mut stream: FrameStream<T>,
    inbound: mpsc::Sender<Inbound>,
) where
    T: AsyncRead + AsyncWrite + Send + Unpin + 'static,
{
    let cancel = session.closed();

    loop {
        let frame = tokio::select! {
            _ = cancel.cancelled() => break,
            frame = stream.next() => frame,
        };

        match frame {
            Some(Ok(frame)) => match frame.opcode {
                Opcode::Binary => {
                    global_metrics().packet_received(frame.payload.len() as u64);
                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        pushed = inbound.send(Inbound::Payload(frame.payload)) => {
                            if pushed.is_err() {
                                break;
                            }
                        }
                    }
                }
                Opcode::Close => {
                    debug!(session = %session.id, "Peer sent close frame");
                    hang_up(&session, &inbound).await;
                    break;
                }
                Opcode::Text => {
                    global_metrics().protocol_error();
                    warn!(session = %session.id, "Unexpected text frame");
                    session.reject(Packet::BadRequest {
                        message: constants::ERR_UNEXPECTED_FRAME.to_string(),
                    });
                    break;
                }
            },
            Some(Err(e)) => {
                if matches!(e, Error::Codec(_)) {
                    global_metrics().protocol_error();
                }
                warn!(session = %session.id, error = %e, "Transport read failed");
                session.close();
                break;
            }
            None => {
                debug!(session = %session.id, "Transport closed by peer");
                hang_up(&session, &inbound).await;
                break;
            }
        }
    }
}

/// Queue the hangup behind pending payloads, or close at once if the tick
/// can no longer see it.
async fn hang_up(session: &Session, inbound: &mpsc::Sender<Inbound>) {
    let cancel = session.closed();
    tokio::select! {
        _ = cancel.cancelled() => {}
        pushed = inbound.send(Inbound::Hangup) => {
            if pushed.is_err() {
                session.close();
            }
        }
    }
}

async fn transmit_pump<T>(
    id: Uuid,
    mut sink: FrameSink<T>,
    mut outbound: mpsc::Receiver<Bytes>,
    cancel: CancellationToken,
) where
    T: AsyncRead + AsyncWrite + Send + Unpin + 'static,
{
    loop {
        let bytes = tokio::select! {
            biased;
            bytes = outbound.recv() => match bytes {
                Some(bytes) => bytes,
                None => break,
            },
            _ = cancel.cancelled() => break,
        };

        if let Err(e) = write_frame(&mut sink, bytes).await {
            debug!(session = %id, error = %e, "Transport write failed");
            cancel.cancel();
            return;
        }
    }

    // Flush whatever was queued before the close, then say goodbye
    while let Ok(bytes) = outbound.try_recv() {
        if write_frame(&mut sink, bytes).await.is_err() {
            return;
        }
    }
    let _ = sink.send(Frame::close()).await;
    let _ = sink.close().await;
    debug!(session = %id, "Transmit pump stopped");
}

async fn write_frame<T>(sink: &mut FrameSink<T>, bytes: Bytes) -> Result<()>
where
    T: AsyncRead + AsyncWrite + Send + Unpin + 'static,
{
    let len = bytes.len() as u64;
    sink.send(Frame::binary(bytes)).await?;
    global_metrics().packet_sent(len);
    Ok(())
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::panic)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::time::Duration;
    use tokio::io::{duplex, DuplexStream};

    struct Recorder(tokio::sync::Mutex<Vec<Packet>>);

    #[async_trait]
    impl PacketHandler for Recorder {
        async fn handle_packet(&self, _session: &Arc<Session>, packet: &Packet) -> Result<()> {
            self.0.lock().await.push(packet.clone());
            Ok(())
        }
    }

    struct Failing;

    #[async_trait]
    impl PacketHandler for Failing {
        async fn handle_packet(&self, _session: &Arc<Session>, _packet: &Packet) -> Result<()> {
            Err(Error::ProgramNotFound("lobby".into()))
        }
    }

    fn pair() -> (Arc<Session>, Framed<DuplexStream, FrameCodec>) {
        let (local, remote) = duplex(64 * 1024);
        let session = Session::start(
            Uuid::new_v4(),
            local,
            None,
            &SessionConfig::default(),
            1024 * 1024,
        );
        (session, Framed::new(remote, FrameCodec::default()))
    }

    async fn next_packet(peer: &mut Framed<DuplexStream, FrameCodec>) -> Option<Packet> {
        let frame = tokio::time::timeout(Duration::from_secs(2), peer.next())
            .await
            .unwrap()?
            .unwrap();
        match frame.opcode {
            Opcode::Binary => Some(Packet::decode(&frame.payload).unwrap()),
            _ => None,
        }
    }

    /// Give the receive pump time to queue what the peer sent.
    async fn settle() {
        tokio::time::sleep(Duration::from_millis(50)).await;
    }

    #[tokio::test]
    async fn packets_are_dispatched_in_arrival_order() {
        let (session, mut peer) = pair();
        for program in ["a", "b", "c"] {
            let packet = Packet::StartProgram {
                program: program.into(),
            };
            peer.send(Frame::binary(packet.encode().unwrap())).await.unwrap();
        }
        settle().await;

        let recorder = Arc::new(Recorder(tokio::sync::Mutex::new(Vec::new())));
        let handlers: Vec<Arc<dyn PacketHandler>> = vec![recorder.clone() as Arc<dyn PacketHandler>];
        session.update(&handlers, 2).await;
        assert_eq!(recorder.0.lock().await.len(), 2);

        session.update(&handlers, 20).await;
        let seen = recorder.0.lock().await;
        let names: Vec<_> = seen
            .iter()
            .map(|p| match p {
                Packet::StartProgram { program } => program.clone(),
                other => panic!("unexpected {other:?}"),
            })
            .collect();
        assert_eq!(names, vec!["a", "b", "c"]);
    }

    #[tokio::test]
    async fn malformed_payload_rejects_with_bad_request() {
        let (session, mut peer) = pair();
        peer.send(Frame::binary(Bytes::from_static(&[200])))
            .await
            .unwrap();
        settle().await;

        session.update(&[], 20).await;
        assert!(session.is_closed());
        assert!(matches!(
            next_packet(&mut peer).await,
            Some(Packet::BadRequest { .. })
        ));
    }

    #[tokio::test]
    async fn domain_errors_are_reported_without_closing() {
        let (session, mut peer) = pair();
        peer.send(Frame::binary(Packet::RequestProgramList.encode().unwrap()))
            .await
            .unwrap();
        settle().await;

        let handlers: Vec<Arc<dyn PacketHandler>> = vec![Arc::new(Failing)];
        session.update(&handlers, 20).await;

        assert!(!session.is_closed());
        assert_eq!(
            next_packet(&mut peer).await,
            Some(Packet::ErrorMessage {
                code: crate::error::ErrorCode::ProgramNotFound
            })
        );
    }

    #[tokio::test]
    async fn close_is_idempotent_and_notifies_peer() {
        let (session, mut peer) = pair();
        assert!(session.close());
        assert!(!session.close());
        assert!(matches!(
            session.send_packet(&Packet::RequestProgramList).await,
            Err(Error::SessionClosed)
        ));

        assert_eq!(
            next_packet(&mut peer).await,
            Some(Packet::DisconnectionNotification)
        );
        // Close frame follows the notification
        assert_eq!(next_packet(&mut peer).await, None);
    }

    #[tokio::test]
    async fn text_frame_is_a_protocol_error() {
        let (session, mut peer) = pair();
        peer.send(Frame::text("hello")).await.unwrap();

        assert!(matches!(
            next_packet(&mut peer).await,
            Some(Packet::BadRequest { .. })
        ));
        assert!(session.is_closed());
    }

    #[tokio::test]
    async fn hangup_is_processed_after_earlier_packets() {
        let (session, mut peer) = pair();
        peer.send(Frame::binary(Packet::RequestProgramList.encode().unwrap()))
            .await
            .unwrap();
        drop(peer);
        settle().await;
        assert!(!session.is_closed());

        let recorder = Arc::new(Recorder(tokio::sync::Mutex::new(Vec::new())));
        let handlers: Vec<Arc<dyn PacketHandler>> = vec![recorder.clone() as Arc<dyn PacketHandler>];
        session.update(&handlers, 20).await;

        assert_eq!(
            recorder.0.lock().await.as_slice(),
            &[Packet::RequestProgramList]
        );
        assert!(session.is_closed());
    }
}
