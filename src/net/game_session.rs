//! One player's session: login, character creation and teardown
//!
//! A [`GameSession`] is owned by its connection task and is the only code
//! that adds or removes that connection's character. Packet routing lives in
//! [`crate::net::dispatcher`].

use std::sync::Arc;

use rand::rngs::StdRng;
use rand::SeedableRng;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tracing::{debug, info, warn};

use crate::game::character::{is_valid_name, Archetype, Character};
use crate::game::index_allocator::CharIndex;
use crate::game::persistence::{CharacterStore, PersistError};
use crate::game::world::World;
use crate::metrics::Metrics;
use crate::net::connection::Connection;
use crate::net::dispatcher::{Flow, HandlerError};
use crate::net::protocol::{Font, ServerPacket};
use crate::net::session::{KickSignal, SessionDirectory, SessionHandle};
use crate::util::position::Position;

/// Services shared by every connection
pub struct ServerContext {
    pub world: Arc<World>,
    pub store: Arc<dyn CharacterStore>,
    pub sessions: Arc<SessionDirectory>,
    pub metrics: Arc<Metrics>,
    pub protocol_version: u16,
}

pub struct GameSession {
    pub(crate) ctx: Arc<ServerContext>,
    pub(crate) conn: Connection,
    pub(crate) outbound: mpsc::Sender<ServerPacket>,
    pub(crate) kick: Arc<KickSignal>,
    pub(crate) rng: StdRng,
    /// Name reserved in the session directory by this connection
    claimed: Option<String>,
}

impl GameSession {
    pub fn new(
        ctx: Arc<ServerContext>,
        conn: Connection,
        outbound: mpsc::Sender<ServerPacket>,
        kick: Arc<KickSignal>,
    ) -> Self {
        Self {
            ctx,
            conn,
            outbound,
            kick,
            rng: StdRng::from_entropy(),
            claimed: None,
        }
    }

    /// Replace the session RNG, for reproducible combat in tests
    pub fn with_seed(mut self, seed: u64) -> Self {
        self.rng = StdRng::seed_from_u64(seed);
        self
    }

    pub fn character(&self) -> Option<CharIndex> {
        self.conn.character
    }

    pub fn connection(&self) -> &Connection {
        &self.conn
    }

    pub fn connection_mut(&mut self) -> &mut Connection {
        &mut self.conn
    }

    pub fn world(&self) -> &World {
        &self.ctx.world
    }

    /// Queue a packet on this connection directly, logged in or not
    pub(crate) fn reply(&self, packet: ServerPacket) {
        match self.outbound.try_send(packet) {
            Ok(()) => {}
            Err(TrySendError::Full(_)) => {
                warn!("Outbound queue full for {}; disconnecting", self.conn.label());
                if self.kick.kick("Too slow") {
                    Metrics::incr(&self.ctx.metrics.kicks);
                }
            }
            Err(TrySendError::Closed(_)) => {}
        }
    }

    /// Send an error dialog and ask the transport to close
    fn refuse(&self, text: &str) -> Flow {
        self.reply(ServerPacket::ErrorMessage {
            text: text.to_string(),
        });
        Flow::Close
    }

    async fn blocking_store<T, F>(&self, op: F) -> Result<T, HandlerError>
    where
        T: Send + 'static,
        F: FnOnce(&dyn CharacterStore) -> Result<T, PersistError> + Send + 'static,
    {
        let store = self.ctx.store.clone();
        let result = tokio::task::spawn_blocking(move || op(store.as_ref()))
            .await
            .map_err(|e| HandlerError::Blocking(e.to_string()))?;
        Ok(result?)
    }

    /// Log an existing character in
    pub async fn login(&mut self, name: &str, version: u16) -> Result<Flow, HandlerError> {
        if self.conn.is_playing() {
            self.ctx.world.console(
                self.conn.character.unwrap_or_default(),
                "You are already logged in.",
                Font::Info,
            );
            return Ok(Flow::Continue);
        }
        if version != self.ctx.protocol_version {
            return Ok(self.refuse("Your client is out of date. Please update it."));
        }
        if !is_valid_name(name) {
            return Ok(self.refuse("Invalid character name."));
        }
        if !self.claim(name) {
            return Ok(self.refuse("That character is already online."));
        }

        let key = name.to_string();
        let result = match self.blocking_store(move |store| store.load(&key)).await {
            Ok(Some(character)) => self.enter_world(character),
            Ok(None) => Ok(self.refuse("That character does not exist.")),
            Err(e) => Err(e),
        };
        self.settle_claim();
        result
    }

    /// Reserve `name` for this connection until its logout save is done
    fn claim(&mut self, name: &str) -> bool {
        if self.ctx.world.find_character(name).is_some()
            || !self.ctx.sessions.claim_name(name, self.conn.id)
        {
            return false;
        }
        self.claimed = Some(name.to_string());
        true
    }

    /// Drop the reservation if the attempt did not end in the world
    fn settle_claim(&mut self) {
        if self.conn.is_playing() {
            return;
        }
        if let Some(name) = self.claimed.take() {
            self.ctx.sessions.release_name(&name, self.conn.id);
        }
    }

    /// Create, save and log in a new character
    pub async fn create_character(
        &mut self,
        name: &str,
        archetype: u8,
        body: u16,
        head: u16,
        home_city: u16,
    ) -> Result<Flow, HandlerError> {
        if self.conn.is_playing() {
            return Ok(Flow::Continue);
        }
        if !is_valid_name(name) {
            return Ok(self.refuse("Invalid character name."));
        }
        let Some(archetype) = Archetype::from_wire(archetype) else {
            return Ok(self.refuse("Invalid class."));
        };
        let Some(city_position) = self.ctx.world.definitions().city(home_city).map(|c| c.position) else {
            return Ok(self.refuse("Invalid home city."));
        };

        if !self.claim(name) {
            return Ok(self.refuse("That name is already taken."));
        }

        let character = Character::new(name, archetype, body, head, home_city, city_position);
        let record = character.clone();
        let result = match self.blocking_store(move |store| store.create(&record)).await {
            Ok(()) => {
                info!("Created character {} ({:?})", name, archetype);
                self.enter_world(character)
            }
            Err(HandlerError::Persist(PersistError::AlreadyExists(_))) => {
                Ok(self.refuse("That name is already taken."))
            }
            Err(e) => Err(e),
        };
        self.settle_claim();
        result
    }

    fn enter_world(&mut self, character: Character) -> Result<Flow, HandlerError> {
        let world = self.ctx.world.clone();
        let name = character.name.clone();
        let saved = character.position;
        let home_city = character.home_city;

        let ci = match world.add_character(character) {
            Ok((ci, _)) => ci,
            Err(e) => {
                warn!("No index for {}: {}", name, e);
                return Ok(self.refuse("The server is full."));
            }
        };
        self.reply(ServerPacket::LoggedIn { index: ci });
        self.ctx.sessions.register(
            ci,
            SessionHandle {
                connection_id: self.conn.id,
                name: name.clone(),
                addr: self.conn.remote_addr,
                sender: self.outbound.clone(),
                kick: self.kick.clone(),
            },
        );
        self.conn.attach(ci, &name);

        let placed = match place_on_login(&world, ci, saved, home_city) {
            Some(pos) => pos,
            None => {
                warn!("Nowhere to place {} (saved at {:?})", name, saved);
                self.conn.detach();
                self.ctx.sessions.unregister(ci, self.conn.id);
                world.release_character(ci);
                return Ok(self.refuse("There is no room for you in the world."));
            }
        };

        send_character_state(&world, ci);
        info!("{} logged in as character {} at {:?}", self.conn.label(), ci, placed);
        Ok(Flow::Continue)
    }

    /// Leave the world and save. Safe to call more than once.
    pub async fn teardown(&mut self) {
        let Some(ci) = self.conn.detach() else {
            self.settle_claim();
            return;
        };
        self.save_and_release(ci).await;
        // A new login may load the record only once it is saved
        self.settle_claim();
    }

    async fn save_and_release(&mut self, ci: CharIndex) {
        let world = self.ctx.world.clone();

        let pets = world
            .characters
            .get(ci)
            .map(|h| h.lock().pets.clone())
            .unwrap_or_default();
        for ni in pets {
            if let Err(e) = world.despawn_npc(ni) {
                debug!("Pet {} of character {} already gone: {}", ni, ci, e);
            }
        }
        if let Err(e) = world.remove_character(ci) {
            warn!("Removing character {} failed: {}", ci, e);
        }
        self.ctx.sessions.unregister(ci, self.conn.id);

        let Some(handle) = world.release_character(ci) else {
            return;
        };
        let record = handle.lock().clone();
        let name = record.name.clone();
        match self.blocking_store(move |store| store.save(&record)).await {
            Ok(()) => info!("{} logged out", name),
            Err(e) => warn!("Could not save {} on logout: {}", name, e),
        }
    }
}

/// Saved position, else its nearest free tile, else the home city
fn place_on_login(world: &World, ci: CharIndex, saved: Position, home_city: u16) -> Option<Position> {
    if saved.in_grid() && world.region(saved.region).is_ok() {
        match world.teleport_character(ci, saved) {
            Ok(pos) => return Some(pos),
            Err(e) => debug!("Saved position {:?} unusable: {}", saved, e),
        }
    }
    let city = world.definitions().city(home_city)?.position;
    match world.teleport_character(ci, city) {
        Ok(pos) => Some(pos),
        Err(e) => {
            warn!("Home city {} unusable: {}", home_city, e);
            None
        }
    }
}

/// Stats, needs, inventory and spell book for a freshly placed character
fn send_character_state(world: &World, ci: CharIndex) {
    let Some(handle) = world.characters.get(ci) else {
        return;
    };
    let mut packets = Vec::with_capacity(32);
    {
        let c = handle.lock();
        packets.push(world.stats_packet(&c));
        packets.push(ServerPacket::UpdateHungerThirst {
            hunger: c.hunger,
            thirst: c.thirst,
        });
        for (slot, _) in c.inventory.iter() {
            packets.push(world.inventory_slot_packet(&c, slot));
        }
        for (slot, spell) in c.spells.iter().enumerate() {
            let name = world
                .definitions()
                .spell(*spell)
                .map(|d| d.name.clone())
                .unwrap_or_default();
            packets.push(ServerPacket::SpellSlot {
                slot: slot as u8,
                spell: *spell,
                name,
            });
        }
        if c.flags.sailing {
            packets.push(ServerPacket::Sailing { sailing: true });
        }
    }
    for packet in packets {
        world.send(ci, packet);
    }
}
