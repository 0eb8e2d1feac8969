//! Game master commands
//!
//! Typed in the client as `/kick NAME`, `/tp REGION X Y` (client
//! coordinates, 1-based), `/spawn NPC_ID` and `/online`.

use tracing::{info, warn};

use crate::game::index_allocator::CharIndex;
use crate::game::world::WorldError;
use crate::net::game_session::ServerContext;
use crate::net::protocol::Font;
use crate::util::position::{Position, RegionId};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GmCommand {
    Kick { name: String },
    Teleport { to: Position },
    Spawn { npc: u16 },
    Online,
}

pub fn parse(input: &str) -> Result<GmCommand, &'static str> {
    let mut words = input.trim().trim_start_matches('/').split_whitespace();
    let verb = words.next().unwrap_or_default().to_ascii_lowercase();
    match verb.as_str() {
        "kick" => {
            let name = words.collect::<Vec<_>>().join(" ");
            if name.is_empty() {
                return Err("Usage: /kick NAME");
            }
            Ok(GmCommand::Kick { name })
        }
        "tp" => {
            const USAGE: &str = "Usage: /tp REGION X Y";
            let region: RegionId = words.next().and_then(|w| w.parse().ok()).ok_or(USAGE)?;
            let x: u8 = words.next().and_then(|w| w.parse().ok()).ok_or(USAGE)?;
            let y: u8 = words.next().and_then(|w| w.parse().ok()).ok_or(USAGE)?;
            if x == 0 || y == 0 {
                return Err(USAGE);
            }
            let to = Position::new(region, x - 1, y - 1);
            if !to.in_grid() {
                return Err("Coordinates are outside the map.");
            }
            Ok(GmCommand::Teleport { to })
        }
        "spawn" => {
            let npc = words
                .next()
                .and_then(|w| w.parse().ok())
                .ok_or("Usage: /spawn NPC_ID")?;
            Ok(GmCommand::Spawn { npc })
        }
        "online" => Ok(GmCommand::Online),
        _ => Err("Unknown command."),
    }
}

/// Run a command typed by character `ci`
pub fn execute(ctx: &ServerContext, ci: CharIndex, input: &str) -> Result<(), WorldError> {
    let world = &ctx.world;
    let (is_gm, name, pos) = {
        let handle = world.characters.get(ci).ok_or(WorldError::UnknownCharacter(ci))?;
        let c = handle.lock();
        (c.flags.gm, c.name.clone(), c.position)
    };
    if !is_gm {
        warn!("{} tried a GM command: {:?}", name, input);
        world.console(ci, "You are not a game master.", Font::Warning);
        return Ok(());
    }

    let command = match parse(input) {
        Ok(command) => command,
        Err(usage) => {
            world.console(ci, usage, Font::Gm);
            return Ok(());
        }
    };
    info!("GM {} runs {:?}", name, command);

    match command {
        GmCommand::Kick { name: target } => match ctx.sessions.find_by_name(&target) {
            Some(victim) if ctx.sessions.kick(victim, "You have been kicked by a game master.") => {
                world.console(ci, format!("{} was kicked.", target), Font::Gm);
            }
            Some(_) => world.console(ci, format!("{} is already leaving.", target), Font::Gm),
            None => world.console(ci, format!("{} is not online.", target), Font::Gm),
        },
        GmCommand::Teleport { to } => match world.teleport_character(ci, to) {
            Ok(landed) => world.console(
                ci,
                format!("Teleported to {} {} {}.", landed.region, landed.x + 1, landed.y + 1),
                Font::Gm,
            ),
            Err(e) => world.console(ci, format!("Teleport failed: {}", e), Font::Gm),
        },
        GmCommand::Spawn { npc } => match world.spawn_npc_near(npc, pos) {
            Ok(ni) => world.console(ci, format!("Spawned NPC {} as {}.", npc, ni), Font::Gm),
            Err(e) => world.console(ci, format!("Spawn failed: {}", e), Font::Gm),
        },
        GmCommand::Online => {
            let names: Vec<String> = ctx.sessions.sessions().into_iter().map(|s| s.name).collect();
            world.console(
                ci,
                format!("{} online: {}", names.len(), names.join(", ")),
                Font::Gm,
            );
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::game::constants::net::PROTOCOL_VERSION;
    use crate::net::game_session::test_support::*;
    use crate::net::protocol::ServerPacket;

    #[test]
    fn test_parse() {
        assert_eq!(
            parse("/kick Old Tom"),
            Ok(GmCommand::Kick {
                name: "Old Tom".to_string()
            })
        );
        assert_eq!(
            parse("/tp 2 11 21"),
            Ok(GmCommand::Teleport {
                to: Position::new(2, 10, 20)
            })
        );
        assert_eq!(parse("/SPAWN 4"), Ok(GmCommand::Spawn { npc: 4 }));
        assert!(parse("/tp 2 0 5").is_err());
        assert!(parse("/kick").is_err());
        assert!(parse("/fly").is_err());
    }

    #[tokio::test]
    async fn test_requires_gm_flag() {
        let h = harness();
        h.saved("Player", Position::new(1, 20, 20));
        let (mut session, mut rx) = h.session(1);
        session.login("Player", PROTOCOL_VERSION).await.unwrap();
        let ci = session.character().unwrap();
        drain(&mut rx);

        execute(&h.ctx, ci, "/tp 2 31 31").unwrap();
        assert_eq!(h.ctx.world.character_position(ci), Some(Position::new(1, 20, 20)));
        assert!(matches!(
            drain(&mut rx)[0],
            ServerPacket::ConsoleMessage { font: Font::Warning, .. }
        ));
    }

    #[tokio::test]
    async fn test_gm_teleport_and_kick() {
        let h = harness();
        h.saved("Keeper", Position::new(1, 20, 20));
        h.saved("Rowdy", Position::new(1, 30, 30));
        let (mut gm, _grx) = h.session(1);
        let (mut rowdy, _rrx) = h.session(2);
        gm.login("Keeper", PROTOCOL_VERSION).await.unwrap();
        rowdy.login("Rowdy", PROTOCOL_VERSION).await.unwrap();
        let ci = gm.character().unwrap();
        h.ctx.world.characters.get(ci).unwrap().lock().flags.gm = true;

        execute(&h.ctx, ci, "/tp 2 31 31").unwrap();
        assert_eq!(h.ctx.world.character_position(ci), Some(Position::new(2, 30, 30)));

        execute(&h.ctx, ci, "/kick rowdy").unwrap();
        assert!(rowdy.kick.is_kicked());
    }
}
