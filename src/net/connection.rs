use std::net::SocketAddr;
use std::time::Instant;

use crate::game::index_allocator::CharIndex;
use crate::net::framing::PacketBuffer;

/// Connection state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// Accepted, no character yet
    Connected,
    /// Owns a character in the world
    Playing,
    /// Teardown started or finished
    Closed,
}

/// Per-socket bookkeeping owned by the connection task
#[derive(Debug)]
pub struct Connection {
    pub id: u64,
    pub remote_addr: SocketAddr,
    pub state: ConnectionState,
    pub character: Option<CharIndex>,
    pub name: Option<String>,
    pub input: PacketBuffer,
    pub created_at: Instant,
    pub last_activity: Instant,
    pub packets_received: u64,
    pub bytes_received: u64,
}

impl Connection {
    pub fn new(id: u64, remote_addr: SocketAddr) -> Self {
        let now = Instant::now();
        Self {
            id,
            remote_addr,
            state: ConnectionState::Connected,
            character: None,
            name: None,
            input: PacketBuffer::new(),
            created_at: now,
            last_activity: now,
            packets_received: 0,
            bytes_received: 0,
        }
    }

    /// Bind the character this connection now plays
    pub fn attach(&mut self, ci: CharIndex, name: &str) {
        self.character = Some(ci);
        self.name = Some(name.to_string());
        self.state = ConnectionState::Playing;
    }

    /// Unbind the character, returning it the first time only
    pub fn detach(&mut self) -> Option<CharIndex> {
        self.state = ConnectionState::Closed;
        self.character.take()
    }

    #[inline]
    pub fn is_playing(&self) -> bool {
        self.state == ConnectionState::Playing
    }

    pub fn record_read(&mut self, bytes: usize, now: Instant) {
        self.bytes_received += bytes as u64;
        self.last_activity = now;
    }

    pub fn record_packet(&mut self) {
        self.packets_received += 1;
    }

    /// Name for log lines: the character if there is one, else the address
    pub fn label(&self) -> String {
        match &self.name {
            Some(name) => format!("{} ({})", name, self.remote_addr),
            None => self.remote_addr.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr() -> SocketAddr {
        "127.0.0.1:7666".parse().unwrap()
    }

    #[test]
    fn test_attach_detach_once() {
        let mut conn = Connection::new(1, addr());
        assert_eq!(conn.state, ConnectionState::Connected);
        assert_eq!(conn.label(), "127.0.0.1:7666");

        conn.attach(4, "Aldric");
        assert!(conn.is_playing());
        assert_eq!(conn.label(), "Aldric (127.0.0.1:7666)");

        assert_eq!(conn.detach(), Some(4));
        assert_eq!(conn.detach(), None);
        assert_eq!(conn.state, ConnectionState::Closed);
    }

    #[test]
    fn test_counters() {
        let mut conn = Connection::new(1, addr());
        let later = conn.created_at + std::time::Duration::from_secs(1);
        conn.record_read(100, later);
        conn.record_packet();
        assert_eq!(conn.bytes_received, 100);
        assert_eq!(conn.packets_received, 1);
        assert_eq!(conn.last_activity, later);
    }
}
