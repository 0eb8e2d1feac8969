//! Session directory: which connection owns which character
//!
//! The directory is the world's [`Outbox`]. Sends are non-blocking pushes
//! onto the owning connection's bounded queue; a connection whose queue is
//! full is kicked rather than allowed to stall the sender.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use hashbrown::HashMap;
use parking_lot::{Mutex, RwLock};
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, Notify};
use tracing::{debug, warn};

use crate::game::index_allocator::CharIndex;
use crate::metrics::Metrics;
use crate::net::aoi::Outbox;
use crate::net::protocol::ServerPacket;

/// Shared kick signal for one connection
#[derive(Debug, Default)]
pub struct KickSignal {
    notify: Notify,
    kicked: AtomicBool,
    reason: RwLock<Option<String>>,
}

impl KickSignal {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Ask the connection to close. Only the first reason is kept.
    pub fn kick(&self, reason: impl Into<String>) -> bool {
        if self.kicked.swap(true, Ordering::AcqRel) {
            return false;
        }
        *self.reason.write() = Some(reason.into());
        self.notify.notify_one();
        true
    }

    pub fn is_kicked(&self) -> bool {
        self.kicked.load(Ordering::Acquire)
    }

    pub fn reason(&self) -> Option<String> {
        self.reason.read().clone()
    }

    /// Resolves once `kick` has been called
    pub async fn wait(&self) {
        if self.is_kicked() {
            return;
        }
        self.notify.notified().await;
    }
}

/// Outbound side of one logged-in connection
#[derive(Debug, Clone)]
pub struct SessionHandle {
    pub connection_id: u64,
    pub name: String,
    pub addr: SocketAddr,
    pub sender: mpsc::Sender<ServerPacket>,
    pub kick: Arc<KickSignal>,
}

/// Online session listing for admin tooling
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionInfo {
    pub index: CharIndex,
    pub connection_id: u64,
    pub name: String,
    pub addr: SocketAddr,
}

pub struct SessionDirectory {
    sessions: RwLock<HashMap<CharIndex, SessionHandle>>,
    /// Case-folded character name -> connection holding it, from login
    /// until the logout save has finished
    claims: Mutex<HashMap<String, u64>>,
    metrics: Arc<Metrics>,
}

impl SessionDirectory {
    pub fn new(metrics: Arc<Metrics>) -> Self {
        Self {
            sessions: RwLock::new(HashMap::new()),
            claims: Mutex::new(HashMap::new()),
            metrics,
        }
    }

    /// Attach a character to its connection
    pub fn register(&self, ci: CharIndex, handle: SessionHandle) {
        if let Some(old) = self.sessions.write().insert(ci, handle) {
            warn!(
                "Character index {} was still bound to connection {}; replaced",
                ci, old.connection_id
            );
        }
    }

    /// Detach a character. Only removes the entry if it belongs to `connection_id`.
    pub fn unregister(&self, ci: CharIndex, connection_id: u64) -> bool {
        let mut sessions = self.sessions.write();
        match sessions.get(&ci) {
            Some(h) if h.connection_id == connection_id => {
                sessions.remove(&ci);
                true
            }
            _ => false,
        }
    }

    /// Reserve `name` for `connection_id`. Fails while another connection holds it.
    pub fn claim_name(&self, name: &str, connection_id: u64) -> bool {
        let mut claims = self.claims.lock();
        match claims.entry(name.to_ascii_lowercase()) {
            hashbrown::hash_map::Entry::Occupied(held) => *held.get() == connection_id,
            hashbrown::hash_map::Entry::Vacant(free) => {
                free.insert(connection_id);
                true
            }
        }
    }

    /// Give `name` back. Only the connection holding it can release it.
    pub fn release_name(&self, name: &str, connection_id: u64) -> bool {
        let mut claims = self.claims.lock();
        let key = name.to_ascii_lowercase();
        if claims.get(&key) == Some(&connection_id) {
            claims.remove(&key);
            true
        } else {
            false
        }
    }

    pub fn is_claimed(&self, name: &str) -> bool {
        self.claims.lock().contains_key(&name.to_ascii_lowercase())
    }

    pub fn len(&self) -> usize {
        self.sessions.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_online(&self, name: &str) -> bool {
        self.find_by_name(name).is_some()
    }

    pub fn find_by_name(&self, name: &str) -> Option<CharIndex> {
        self.sessions
            .read()
            .iter()
            .find(|(_, h)| h.name.eq_ignore_ascii_case(name))
            .map(|(ci, _)| *ci)
    }

    /// Close the connection owning `ci`
    pub fn kick(&self, ci: CharIndex, reason: &str) -> bool {
        let Some(handle) = self.sessions.read().get(&ci).cloned() else {
            return false;
        };
        // Best effort: the client may never see it if its queue is full
        let _ = handle.sender.try_send(ServerPacket::Disconnect {
            reason: reason.to_string(),
        });
        let first = handle.kick.kick(reason);
        if first {
            Metrics::incr(&self.metrics.kicks);
            debug!("Kicking {} ({}): {}", handle.name, ci, reason);
        }
        first
    }

    pub fn sessions(&self) -> Vec<SessionInfo> {
        let mut out: Vec<SessionInfo> = self
            .sessions
            .read()
            .iter()
            .map(|(ci, h)| SessionInfo {
                index: *ci,
                connection_id: h.connection_id,
                name: h.name.clone(),
                addr: h.addr,
            })
            .collect();
        out.sort_by_key(|s| s.index);
        out
    }
}

impl Outbox for SessionDirectory {
    fn send(&self, to: CharIndex, packet: ServerPacket) {
        let result = match self.sessions.read().get(&to) {
            Some(handle) => handle.sender.try_send(packet),
            None => return,
        };
        match result {
            Ok(()) => {}
            Err(TrySendError::Full(_)) => {
                warn!("Outbound queue full for character {}; disconnecting", to);
                self.kick(to, "Too slow");
            }
            // Writer already gone; teardown will unregister
            Err(TrySendError::Closed(_)) => {}
        }
    }
}
