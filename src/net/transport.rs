//! TCP server: accept loop and per-connection tasks
//!
//! Each connection gets a read task running the sequential
//! read/decode/dispatch loop and a writer task draining its outbound queue.
//! Every way out of the read loop (client EOF, protocol error, kick, socket
//! error) funnels into the same session teardown.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::game::constants::net::{OUTBOUND_QUEUE_CAPACITY, WRITER_DRAIN_TIMEOUT_MS};
use crate::metrics::Metrics;
use crate::net::connection::Connection;
use crate::net::dispatcher::{next_packet, Flow};
use crate::net::dos_protection::Admission;
use crate::net::framing::{read_into, write_packet, FramingError};
use crate::net::game_session::{GameSession, ServerContext};
use crate::net::protocol::ServerPacket;
use crate::net::session::KickSignal;

/// Game server bound to a TCP listener
pub struct GameServer {
    listener: TcpListener,
    ctx: Arc<ServerContext>,
    admission: Arc<Mutex<Admission>>,
}

impl GameServer {
    pub async fn bind(
        addr: SocketAddr,
        ctx: Arc<ServerContext>,
        admission: Admission,
    ) -> anyhow::Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        Ok(Self {
            listener,
            ctx,
            admission: Arc::new(Mutex::new(admission)),
        })
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Accept connections until the task is dropped
    pub async fn run(self) -> anyhow::Result<()> {
        info!("Game server listening on {}", self.listener.local_addr()?);
        loop {
            let (socket, addr) = match self.listener.accept().await {
                Ok(accepted) => accepted,
                Err(e) => {
                    warn!("Accept failed: {}", e);
                    continue;
                }
            };
            let metrics = &self.ctx.metrics;

            let admitted = self.admission.lock().admit(addr.ip());
            let id = match admitted {
                Ok(id) => id,
                Err(e) => {
                    Metrics::incr(&metrics.connections_rejected);
                    debug!("Refused {}: {}", addr, e);
                    tokio::spawn(refuse(socket, e.to_string()));
                    continue;
                }
            };
            if let Err(e) = socket.set_nodelay(true) {
                debug!("set_nodelay failed for {}: {}", addr, e);
            }
            Metrics::incr(&metrics.connections_total);
            Metrics::incr(&metrics.connections_active);

            let ctx = self.ctx.clone();
            let admission = self.admission.clone();
            tokio::spawn(async move {
                serve_connection(socket, addr, id, ctx, admission.clone()).await;
                admission.lock().release(id, addr.ip());
            });
        }
    }
}

/// Tell a refused client why, then hang up
async fn refuse<S: AsyncWrite + Unpin>(mut stream: S, reason: String) {
    let packet = ServerPacket::ErrorMessage { text: reason }.encode();
    let _ = write_packet(&mut stream, &packet).await;
}

/// Drain `queue` onto the socket until every sender is gone
async fn write_loop<W: AsyncWrite + Unpin>(
    mut writer: W,
    mut queue: mpsc::Receiver<ServerPacket>,
    metrics: Arc<Metrics>,
) {
    while let Some(packet) = queue.recv().await {
        let bytes = packet.encode();
        if let Err(e) = write_packet(&mut writer, &bytes).await {
            debug!("Write failed: {}", e);
            break;
        }
        Metrics::incr(&metrics.packets_out);
        Metrics::add(&metrics.bytes_out, bytes.len());
        if matches!(packet, ServerPacket::Disconnect { .. }) {
            break;
        }
    }
}

/// Run one connection to completion, including teardown
pub async fn serve_connection<S>(
    stream: S,
    addr: SocketAddr,
    id: u64,
    ctx: Arc<ServerContext>,
    admission: Arc<Mutex<Admission>>,
) where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    debug!("Connection {} accepted from {}", id, addr);
    let metrics = ctx.metrics.clone();
    let (mut reader, writer) = tokio::io::split(stream);
    let (tx, rx) = mpsc::channel(OUTBOUND_QUEUE_CAPACITY);
    let writer_task = tokio::spawn(write_loop(writer, rx, metrics.clone()));

    let kick = KickSignal::new();
    let mut session = GameSession::new(ctx, Connection::new(id, addr), tx, kick.clone());

    'conn: loop {
        let read = tokio::select! {
            read = read_into(&mut reader, &mut session.conn.input) => read,
            _ = kick.wait() => {
                debug!(
                    "Connection {} kicked: {}",
                    id,
                    kick.reason().unwrap_or_default()
                );
                break 'conn;
            }
        };
        match read {
            Ok(n) => {
                session.conn.record_read(n, Instant::now());
                Metrics::add(&metrics.bytes_in, n);
            }
            Err(FramingError::ConnectionClosed) => break,
            Err(e) => {
                warn!("Read error on {}: {}", session.conn.label(), e);
                break;
            }
        }

        loop {
            let packet = match next_packet(&mut session.conn.input) {
                Ok(Some((packet, _))) => packet,
                Ok(None) => break,
                Err(e) => {
                    warn!("Protocol error from {}: {}", session.conn.label(), e);
                    Metrics::incr(&metrics.protocol_errors);
                    break 'conn;
                }
            };
            session.conn.record_packet();
            Metrics::incr(&metrics.packets_in);

            let now = Instant::now();
            let admitted = admission.lock().check_packet(id, now);
            match admitted {
                Ok(()) => {}
                Err(e) if e.is_fatal() => {
                    warn!("Dropping {}: {}", session.conn.label(), e);
                    session.reply(ServerPacket::Disconnect {
                        reason: e.to_string(),
                    });
                    Metrics::incr(&metrics.kicks);
                    break 'conn;
                }
                Err(_) => {
                    Metrics::incr(&metrics.packets_rate_limited);
                    continue;
                }
            }

            match session.dispatch(packet, now).await {
                Ok(Flow::Continue) => {}
                Ok(Flow::Close) => break 'conn,
                Err(e) if e.is_fatal() => {
                    warn!("Closing {}: {}", session.conn.label(), e);
                    Metrics::incr(&metrics.protocol_errors);
                    break 'conn;
                }
                Err(e) => debug!("Handler error for {}: {}", session.conn.label(), e),
            }
            if kick.is_kicked() {
                break 'conn;
            }
        }
    }

    session.teardown().await;
    let label = session.conn.label();
    drop(session);
    Metrics::decr(&metrics.connections_active);

    // The writer ends once the session's senders are gone
    if tokio::time::timeout(Duration::from_millis(WRITER_DRAIN_TIMEOUT_MS), writer_task)
        .await
        .is_err()
    {
        debug!("Writer for {} did not drain in time", label);
    }
    debug!("Connection {} closed ({})", id, label);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::game::constants::net::PROTOCOL_VERSION;
    use crate::game::persistence::CharacterStore;
    use crate::net::game_session::test_support::*;
    use crate::net::protocol::ClientPacket;
    use crate::util::position::{Heading, Position};
    use std::sync::atomic::Ordering;
    use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream};

    fn spawn_connection(h: &Harness, id: u64) -> (DuplexStream, tokio::task::JoinHandle<()>) {
        let (client, server) = tokio::io::duplex(64 * 1024);
        let ctx = h.ctx.clone();
        let admission = Arc::new(Mutex::new(Admission::default()));
        let addr: SocketAddr = format!("127.0.0.1:{}", 5000 + id).parse().unwrap();
        let task = tokio::spawn(serve_connection(server, addr, id, ctx, admission));
        (client, task)
    }

    /// Read server packets until `pred` matches one
    async fn read_until(
        client: &mut DuplexStream,
        pending: &mut Vec<u8>,
        pred: impl Fn(&ServerPacket) -> bool,
    ) -> ServerPacket {
        loop {
            while !pending.is_empty() {
                match ServerPacket::decode(pending) {
                    Ok((packet, used)) => {
                        pending.drain(..used);
                        if pred(&packet) {
                            return packet;
                        }
                    }
                    Err(_) => break,
                }
            }
            let mut chunk = [0u8; 4096];
            let n = client.read(&mut chunk).await.unwrap();
            assert!(n > 0, "server closed before the expected packet");
            pending.extend_from_slice(&chunk[..n]);
        }
    }

    #[tokio::test]
    async fn test_login_walk_and_quit_over_stream() {
        let h = harness();
        h.saved("Aldric", Position::new(2, 20, 20));
        let (mut client, task) = spawn_connection(&h, 1);
        let mut pending = Vec::new();

        let mut bytes = ClientPacket::Login {
            name: "Aldric".to_string(),
            version: PROTOCOL_VERSION,
        }
        .encode();
        // Split a packet across writes
        let tail = bytes.split_off(3);
        client.write_all(&bytes).await.unwrap();
        tokio::task::yield_now().await;
        client.write_all(&tail).await.unwrap();

        let logged = read_until(&mut client, &mut pending, |p| {
            matches!(p, ServerPacket::LoggedIn { .. })
        })
        .await;
        let ServerPacket::LoggedIn { index } = logged else {
            unreachable!()
        };

        client
            .write_all(&ClientPacket::Walk { heading: Heading::East }.encode())
            .await
            .unwrap();
        client
            .write_all(&ClientPacket::Ping { timestamp: 7 }.encode())
            .await
            .unwrap();
        read_until(&mut client, &mut pending, |p| {
            matches!(p, ServerPacket::Pong { timestamp: 7 })
        })
        .await;
        assert_eq!(
            h.ctx.world.character_position(index),
            Some(Position::new(2, 21, 20))
        );

        client.write_all(&ClientPacket::Quit.encode()).await.unwrap();
        task.await.unwrap();
        assert!(h.ctx.world.characters.is_empty());
        assert_eq!(h.store.load("Aldric").unwrap().unwrap().position, Position::new(2, 21, 20));
    }

    #[tokio::test]
    async fn test_garbage_tears_down() {
        let h = harness();
        h.saved("Aldric", Position::new(2, 20, 20));
        let (mut client, task) = spawn_connection(&h, 2);

        client
            .write_all(
                &ClientPacket::Login {
                    name: "Aldric".to_string(),
                    version: PROTOCOL_VERSION,
                }
                .encode(),
            )
            .await
            .unwrap();
        let mut pending = Vec::new();
        read_until(&mut client, &mut pending, |p| {
            matches!(p, ServerPacket::LoggedIn { .. })
        })
        .await;

        client.write_all(&[0xEE]).await.unwrap();
        task.await.unwrap();
        assert!(h.ctx.world.characters.is_empty());
        assert!(h.ctx.sessions.is_empty());
        assert_eq!(h.ctx.metrics.protocol_errors.load(Ordering::Relaxed), 1);
    }

    #[tokio::test]
    async fn test_client_eof_tears_down() {
        let h = harness();
        h.saved("Aldric", Position::new(2, 20, 20));
        let (mut client, task) = spawn_connection(&h, 3);
        client
            .write_all(
                &ClientPacket::Login {
                    name: "Aldric".to_string(),
                    version: PROTOCOL_VERSION,
                }
                .encode(),
            )
            .await
            .unwrap();
        let mut pending = Vec::new();
        read_until(&mut client, &mut pending, |p| {
            matches!(p, ServerPacket::LoggedIn { .. })
        })
        .await;

        drop(client);
        task.await.unwrap();
        assert!(h.ctx.world.characters.is_empty());
    }
}
