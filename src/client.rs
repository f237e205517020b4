use std::{net::SocketAddr, sync::Arc, time::Duration};

use futures::{SinkExt, StreamExt};
use log::{debug, info, trace, warn};
use tokio::{
    io::{AsyncRead, AsyncWrite},
    net::TcpStream,
    select,
    sync::mpsc,
    time::{self, Instant},
};

use crate::{
    error::ProtocolError,
    game::GameEvent,
    net::{framed, handshake, Connection, Packet},
    server::ServerHandler,
};

enum Flow {
    Continue,
    Close,
}

/// Tells the world thread the viewer is gone however the task ends,
/// including when it is aborted.
struct LeaveGuard {
    server: Arc<ServerHandler>,
    id: u32,
}

impl Drop for LeaveGuard {
    fn drop(&mut self) {
        self.server.remove_client(self.id);
        self.server.submit(GameEvent::Leave { id: self.id });
    }
}

/// Loopback peers, including IPv4-mapped ones on a dual-stack socket.
pub fn is_loopback(addr: &SocketAddr) -> bool {
    addr.ip().to_canonical().is_loopback()
}

/// Loopback peers skip stream encryption.
pub async fn handle_tcp(server: Arc<ServerHandler>, stream: TcpStream, addr: SocketAddr) {
    let encrypt = !is_loopback(&addr);
    handle_connection(server, stream, addr, encrypt).await
}

pub async fn handle_connection<S>(
    server: Arc<ServerHandler>,
    stream: S,
    addr: SocketAddr,
    encrypt: bool,
) where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let config = server.config.clone();
    let handshake_timeout = Duration::from_secs(config.handshake_timeout_secs);
    let accepted = time::timeout(
        handshake_timeout,
        handshake::accept(framed(stream), config.offline, encrypt),
    )
    .await;
    let (conn, identity) = match accepted {
        Ok(Ok(accepted)) => accepted,
        Ok(Err(e)) => {
            warn!("Handshake with {} failed: {}", addr, e);
            return;
        }
        Err(_) => {
            warn!("Handshake with {} timed out", addr);
            return;
        }
    };

    let id = server.new_id();
    let (tx, rx) = mpsc::unbounded_channel();
    server.add_client(id, addr);
    let _guard = LeaveGuard {
        server: server.clone(),
        id,
    };
    info!(
        "{} ({}) authenticated from {}, encrypted: {}",
        identity.name, identity.uuid, addr, identity.encrypted
    );

    let name = identity.name.clone();
    if !server.submit(GameEvent::Join { id, identity, tx }) {
        warn!("World is not running, dropping {}", name);
        return;
    }

    let mut handler = ClientHandler::new(id, name, conn, rx, server);
    match handler.loop_until_disconnect().await {
        Ok(()) => debug!("{} disconnected", handler.name),
        Err(e) => info!("Closed connection to {}: {}", handler.name, e),
    }
}

pub struct ClientHandler<S> {
    id: u32,
    name: String,
    msg_stream: Connection<S>,
    unicast_rx: mpsc::UnboundedReceiver<Packet>,
    server: Arc<ServerHandler>,
}

impl<S> ClientHandler<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    pub fn new(
        id: u32,
        name: String,
        msg_stream: Connection<S>,
        unicast_rx: mpsc::UnboundedReceiver<Packet>,
        server: Arc<ServerHandler>,
    ) -> ClientHandler<S> {
        ClientHandler {
            id,
            name,
            msg_stream,
            unicast_rx,
            server,
        }
    }

    pub async fn loop_until_disconnect(&mut self) -> Result<(), ProtocolError> {
        let keep_alive = Duration::from_secs(self.server.config.keep_alive_secs.max(1));
        let timeout = Duration::from_secs(self.server.config.timeout_secs.max(1));
        let mut keep_alive_interval = time::interval_at(Instant::now() + keep_alive, keep_alive);
        let liveness = time::sleep(timeout);
        tokio::pin!(liveness);

        let result = loop {
            select! {
                packet_in = self.msg_stream.next() => match packet_in {
                    None => break Ok(()),
                    Some(Ok(packet)) => {
                        liveness.as_mut().reset(Instant::now() + timeout);
                        match self.handle_packet(packet) {
                            Ok(Flow::Continue) => {}
                            Ok(Flow::Close) => break Ok(()),
                            Err(e) => break Err(e),
                        }
                    }
                    Some(Err(e)) => break Err(e),
                },
                packet_out = self.unicast_rx.recv() => match packet_out {
                    Some(packet) => {
                        let closing = matches!(packet, Packet::Disconnect { .. });
                        if let Err(e) = self.msg_stream.send(packet).await {
                            break Err(e);
                        }
                        if closing {
                            break Ok(());
                        }
                    }
                    None => break Ok(()),
                },
                _ = keep_alive_interval.tick() => {
                    if let Err(e) = self.msg_stream.send(Packet::Ping).await {
                        break Err(e);
                    }
                }
                _ = &mut liveness => break Err(ProtocolError::Timeout),
            }
        };

        if let Err(e) = &result {
            self.send_disconnect(e).await;
        }
        self.unicast_rx.close();
        let _ = self.msg_stream.close().await;
        result
    }

    /// Best effort. The peer may already be gone or not reading.
    async fn send_disconnect(&mut self, err: &ProtocolError) {
        if matches!(err, ProtocolError::Io(_) | ProtocolError::Disconnected(_)) {
            return;
        }
        let packet = Packet::disconnect(err.to_string());
        let _ = time::timeout(Duration::from_secs(1), self.msg_stream.send(packet)).await;
    }

    fn handle_packet(&mut self, packet: Packet) -> Result<Flow, ProtocolError> {
        trace!("Viewer {} sent {}", self.id, packet.name());

        match packet {
            Packet::Ping => Ok(Flow::Continue),
            Packet::Disconnect { reason } => {
                info!("{} disconnected: {}", self.name, reason);
                Ok(Flow::Close)
            }
            Packet::ClientRequest { .. }
            | Packet::ServerInfo { .. }
            | Packet::BasicAuth { .. }
            | Packet::PlayerInfo { .. }
            | Packet::Chunk { .. }
            | Packet::ChunkUnload { .. } => Err(ProtocolError::UnexpectedPacket(packet.name())),
            packet => {
                if !self.server.submit(GameEvent::Packet {
                    id: self.id,
                    packet,
                }) {
                    return Err(ProtocolError::Disconnected("server closed".to_string()));
                }
                Ok(Flow::Continue)
            }
        }
    }
}
