//! Packet framing and routing
//!
//! [`next_packet`] cuts one packet off the head of a connection's input
//! buffer; [`GameSession::dispatch`] runs its handler. Rule violations are
//! answered in-game and never surface here as errors. Only malformed input
//! and session misuse end the connection.

use std::time::Instant;

use tracing::{debug, trace};

use crate::game::constants::net::{CHAT_COLOR, GM_CHAT_COLOR, MAX_CHAT_LEN};
use crate::game::index_allocator::CharIndex;
use crate::game::persistence::PersistError;
use crate::game::world::{MoveOutcome, World, WorldError};
use crate::net::framing::PacketBuffer;
use crate::net::game_session::GameSession;
use crate::net::gm;
use crate::net::protocol::{ClientPacket, Font, ProtocolError, ServerPacket};
use crate::util::position::Heading;

/// What the connection loop does after a packet
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flow {
    Continue,
    Close,
}

#[derive(Debug, thiserror::Error)]
pub enum HandlerError {
    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),
    #[error("Opcode 0x{0:02x} sent before login")]
    NotLoggedIn(u8),
    #[error("World error: {0}")]
    World(#[from] WorldError),
    #[error("Character store error: {0}")]
    Persist(#[from] PersistError),
    #[error("Blocking task failed: {0}")]
    Blocking(String),
}

impl HandlerError {
    /// Whether the connection has to be torn down
    pub fn is_fatal(&self) -> bool {
        !matches!(self, HandlerError::World(_))
    }
}

/// Decode the packet at the head of `buffer`
///
/// `Ok(None)` means the buffer holds only part of a packet; nothing is
/// consumed and the caller should read more.
pub fn next_packet(buffer: &mut PacketBuffer) -> Result<Option<(ClientPacket, usize)>, ProtocolError> {
    if buffer.is_empty() {
        return Ok(None);
    }
    match ClientPacket::decode(buffer.pending()) {
        Ok((packet, used)) => {
            buffer.consume(used);
            Ok(Some((packet, used)))
        }
        Err(ProtocolError::Incomplete) => Ok(None),
        Err(e) => Err(e),
    }
}

impl GameSession {
    /// Run the handler for one packet
    pub async fn dispatch(&mut self, packet: ClientPacket, now: Instant) -> Result<Flow, HandlerError> {
        match packet {
            ClientPacket::Login { name, version } => self.login(&name, version).await,
            ClientPacket::CreateCharacter {
                name,
                archetype,
                body,
                head,
                home_city,
            } => {
                self.create_character(&name, archetype, body, head, home_city)
                    .await
            }
            ClientPacket::Ping { timestamp } => {
                self.reply(ServerPacket::Pong { timestamp });
                Ok(Flow::Continue)
            }
            ClientPacket::Quit => Ok(Flow::Close),
            other => {
                let ci = self
                    .conn
                    .character
                    .ok_or(HandlerError::NotLoggedIn(other.opcode()))?;
                self.play(ci, other, now)?;
                Ok(Flow::Continue)
            }
        }
    }

    /// In-world packets
    fn play(&mut self, ci: CharIndex, packet: ClientPacket, now: Instant) -> Result<(), HandlerError> {
        let world = self.ctx.world.clone();
        let rng = &mut self.rng;
        match packet {
            ClientPacket::Walk { heading } => walk(&world, ci, heading, now)?,
            ClientPacket::Attack => {
                let outcome = world.melee_attack(ci, now, rng)?;
                trace!("Character {} melee: {:?}", ci, outcome);
            }
            ClientPacket::RangedAttack { target } => {
                let at = target.in_region(world.character_region(ci)?);
                let outcome = world.ranged_attack(ci, at, now, rng)?;
                trace!("Character {} ranged at {:?}: {:?}", ci, at, outcome);
            }
            ClientPacket::PickUp => {
                world.pick_up(ci)?;
            }
            ClientPacket::Drop { slot, amount } => {
                world.drop_item(ci, slot as usize, amount)?;
            }
            ClientPacket::CastSpell { spell, target } => {
                let at = target.in_region(world.character_region(ci)?);
                let outcome = world.cast_spell(ci, spell as usize, at, now, rng)?;
                trace!("Character {} cast {} at {:?}: {:?}", ci, spell, at, outcome);
            }
            ClientPacket::UseItem { slot } => {
                world.use_item(ci, slot as usize, now, rng)?;
            }
            ClientPacket::EquipItem { slot } => {
                world.equip_item(ci, slot as usize)?;
            }
            ClientPacket::Work { target } => {
                let at = target.in_region(world.character_region(ci)?);
                world.work_tile(ci, at, now, rng)?;
            }
            ClientPacket::Tame { target } => {
                let at = target.in_region(world.character_region(ci)?);
                world.tame(ci, at)?;
            }
            ClientPacket::Talk { text } => talk(&world, ci, &text)?,
            ClientPacket::ChangeHeading { heading } => world.turn_character(ci, heading)?,
            ClientPacket::RequestPositionUpdate => {
                if let Some(pos) = world.character_position(ci) {
                    world.send(ci, ServerPacket::PositionUpdate { at: pos.into() });
                }
            }
            ClientPacket::Resurrect => {
                world.resurrect(ci)?;
            }
            ClientPacket::GmCommand { command } => gm::execute(&self.ctx, ci, &command)?,
            ClientPacket::CommerceBuy { .. } | ClientPacket::CommerceSell { .. } => {
                world.console(ci, "There is nobody here to trade with.", Font::Info);
            }
            ClientPacket::BankDeposit { .. } | ClientPacket::BankWithdraw { .. } => {
                world.console(ci, "There is no banker here.", Font::Info);
            }
            ClientPacket::Login { .. }
            | ClientPacket::CreateCharacter { .. }
            | ClientPacket::Ping { .. }
            | ClientPacket::Quit => {}
        }
        Ok(())
    }
}

/// One step, with a position resync when the server disagrees with the client
fn walk(world: &World, ci: CharIndex, heading: Heading, now: Instant) -> Result<(), WorldError> {
    let rooted = world
        .characters
        .get(ci)
        .ok_or(WorldError::UnknownCharacter(ci))?
        .lock()
        .is_rooted(now);
    if rooted {
        world.console(ci, "You can't move.", Font::Info);
        if let Some(pos) = world.character_position(ci) {
            world.send(ci, ServerPacket::PositionUpdate { at: pos.into() });
        }
        return Ok(());
    }

    match world.move_character(ci, heading)? {
        MoveOutcome::Moved { .. } => {}
        MoveOutcome::Rejected { at, reason } => {
            debug!("Character {} step {:?} refused: {:?}", ci, heading, reason);
            world.send(ci, ServerPacket::PositionUpdate { at: at.into() });
        }
    }
    Ok(())
}

/// Overhead chat for everyone in view
fn talk(world: &World, ci: CharIndex, text: &str) -> Result<(), WorldError> {
    let text = text.trim();
    if text.is_empty() {
        return Ok(());
    }
    let text: String = text.chars().take(MAX_CHAT_LEN).collect();
    let (pos, dead, gm) = {
        let handle = world.characters.get(ci).ok_or(WorldError::UnknownCharacter(ci))?;
        let c = handle.lock();
        (c.position, c.is_dead(), c.flags.gm)
    };
    if dead {
        world.console(ci, "The living can't hear you.", Font::Info);
        return Ok(());
    }
    let color = if gm { GM_CHAT_COLOR } else { CHAT_COLOR };
    world.broadcast_area(&pos, &ServerPacket::ChatOverHead { index: ci, text, color }, None);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::game::constants::net::PROTOCOL_VERSION;
    use crate::net::game_session::test_support::*;
    use crate::net::protocol::TileCoord;
    use crate::util::position::Position;

    #[test]
    fn test_next_packet_waits_for_whole_packet() {
        let bytes = ClientPacket::Walk {
            heading: Heading::North,
        }
        .encode();
        let mut buffer = PacketBuffer::new();
        buffer.extend(&bytes[..1]).unwrap();
        assert_eq!(next_packet(&mut buffer).unwrap(), None);
        assert_eq!(buffer.pending().len(), 1);

        buffer.extend(&bytes[1..]).unwrap();
        buffer.extend(&ClientPacket::Attack.encode()).unwrap();
        assert_eq!(
            next_packet(&mut buffer).unwrap(),
            Some((ClientPacket::Walk { heading: Heading::North }, bytes.len()))
        );
        assert_eq!(next_packet(&mut buffer).unwrap().map(|(p, _)| p), Some(ClientPacket::Attack));
        assert!(buffer.is_empty());
    }

    #[test]
    fn test_unknown_opcode_is_fatal() {
        let mut buffer = PacketBuffer::new();
        buffer.extend(&[0xEE, 1, 2]).unwrap();
        let err = next_packet(&mut buffer).unwrap_err();
        assert_eq!(err, ProtocolError::UnknownOpcode(0xEE));
        assert!(HandlerError::from(err).is_fatal());
        assert!(!HandlerError::World(WorldError::UnknownCharacter(1)).is_fatal());
    }

    #[tokio::test]
    async fn test_game_packet_before_login() {
        let h = harness();
        let (mut session, mut rx) = h.session(1);
        let err = session
            .dispatch(ClientPacket::Walk { heading: Heading::East }, Instant::now())
            .await
            .unwrap_err();
        assert!(matches!(err, HandlerError::NotLoggedIn(_)));
        assert!(err.is_fatal());

        let flow = session
            .dispatch(ClientPacket::Ping { timestamp: 42 }, Instant::now())
            .await
            .unwrap();
        assert_eq!(flow, Flow::Continue);
        assert_eq!(drain(&mut rx), vec![ServerPacket::Pong { timestamp: 42 }]);
    }

    #[tokio::test]
    async fn test_walk_moves_and_observer_sees_it() {
        let h = harness();
        h.saved("Walker", Position::new(2, 10, 10));
        h.saved("Watcher", Position::new(2, 12, 12));
        let (mut walker, _wrx) = h.session(1);
        let (mut watcher, mut orx) = h.session(2);
        walker.login("Walker", PROTOCOL_VERSION).await.unwrap();
        watcher.login("Watcher", PROTOCOL_VERSION).await.unwrap();
        drain(&mut orx);

        let ci = walker.character().unwrap();
        walker
            .dispatch(ClientPacket::Walk { heading: Heading::North }, Instant::now())
            .await
            .unwrap();
        assert_eq!(h.ctx.world.character_position(ci), Some(Position::new(2, 10, 9)));
        assert!(drain(&mut orx).contains(&ServerPacket::CharacterMove {
            index: ci,
            at: TileCoord::new(10, 9),
            heading: Heading::North,
        }));
    }

    #[tokio::test]
    async fn test_blocked_walk_resyncs_position() {
        let h = harness();
        h.saved("Walker", Position::new(2, 10, 10));
        h.saved("Blocker", Position::new(2, 10, 9));
        let (mut walker, mut wrx) = h.session(1);
        let (mut blocker, _brx) = h.session(2);
        walker.login("Walker", PROTOCOL_VERSION).await.unwrap();
        blocker.login("Blocker", PROTOCOL_VERSION).await.unwrap();
        drain(&mut wrx);

        walker
            .dispatch(ClientPacket::Walk { heading: Heading::North }, Instant::now())
            .await
            .unwrap();
        let ci = walker.character().unwrap();
        assert_eq!(h.ctx.world.character_position(ci), Some(Position::new(2, 10, 10)));
        assert!(drain(&mut wrx).contains(&ServerPacket::PositionUpdate {
            at: TileCoord::new(10, 10)
        }));
    }

    #[tokio::test]
    async fn test_talk_reaches_area() {
        let h = harness();
        h.saved("Speaker", Position::new(1, 20, 20));
        h.saved("Listener", Position::new(1, 21, 20));
        let (mut speaker, _srx) = h.session(1);
        let (mut listener, mut lrx) = h.session(2);
        speaker.login("Speaker", PROTOCOL_VERSION).await.unwrap();
        listener.login("Listener", PROTOCOL_VERSION).await.unwrap();
        drain(&mut lrx);

        speaker
            .dispatch(
                ClientPacket::Talk {
                    text: "  hello  ".to_string(),
                },
                Instant::now(),
            )
            .await
            .unwrap();
        assert!(drain(&mut lrx).contains(&ServerPacket::ChatOverHead {
            index: speaker.character().unwrap(),
            text: "hello".to_string(),
            color: CHAT_COLOR,
        }));
    }

    #[tokio::test]
    async fn test_commerce_is_answered_in_console() {
        let h = harness();
        h.saved("Buyer", Position::new(1, 20, 20));
        let (mut session, mut rx) = h.session(1);
        session.login("Buyer", PROTOCOL_VERSION).await.unwrap();
        drain(&mut rx);

        let flow = session
            .dispatch(ClientPacket::CommerceBuy { slot: 0, amount: 1 }, Instant::now())
            .await
            .unwrap();
        assert_eq!(flow, Flow::Continue);
        assert!(matches!(drain(&mut rx)[0], ServerPacket::ConsoleMessage { .. }));
    }

    #[tokio::test]
    async fn test_quit_closes() {
        let h = harness();
        let (mut session, _rx) = h.session(1);
        let flow = session.dispatch(ClientPacket::Quit, Instant::now()).await.unwrap();
        assert_eq!(flow, Flow::Close);
    }
}
