//! Wire protocol
//!
//! Every packet is a one-byte opcode followed by an opcode-specific
//! little-endian body. Strings carry a u16 length prefix. Coordinates are
//! 1-based on the wire and 0-based everywhere else; [`TileCoord`] does the
//! conversion at the codec boundary. Encoding and decoding are pure.

use crate::game::constants::net::MAX_STRING_LEN;
use crate::net::framing::{FrameBuilder, FrameReader};
use crate::util::position::{Heading, Position};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ProtocolError {
    /// Not an error for stream input: wait for more bytes
    #[error("Incomplete packet")]
    Incomplete,
    #[error("Unknown opcode 0x{0:02x}")]
    UnknownOpcode(u8),
    #[error("String of {0} bytes exceeds limit")]
    StringTooLong(usize),
    #[error("Invalid UTF-8 in string field")]
    InvalidUtf8,
    #[error("Invalid heading {0}")]
    InvalidHeading(u8),
    #[error("Coordinate 0 is not valid on the wire")]
    InvalidCoordinate,
    #[error("Invalid value {value} for {field}")]
    InvalidValue { field: &'static str, value: u32 },
}

pub type DecodeResult<T> = Result<T, ProtocolError>;

/// 0-based grid coordinate without a region
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TileCoord {
    pub x: u8,
    pub y: u8,
}

impl TileCoord {
    pub fn new(x: u8, y: u8) -> Self {
        Self { x, y }
    }

    pub fn in_region(self, region: crate::util::position::RegionId) -> Position {
        Position::new(region, self.x, self.y)
    }
}

impl From<Position> for TileCoord {
    fn from(pos: Position) -> Self {
        Self { x: pos.x, y: pos.y }
    }
}

/// Console font / message category
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Font {
    Info,
    Combat,
    Warning,
    Gm,
    Talk,
}

impl Font {
    fn to_wire(self) -> u8 {
        match self {
            Font::Info => 0,
            Font::Combat => 1,
            Font::Warning => 2,
            Font::Gm => 3,
            Font::Talk => 4,
        }
    }

    fn from_wire(value: u8) -> DecodeResult<Self> {
        Ok(match value {
            0 => Font::Info,
            1 => Font::Combat,
            2 => Font::Warning,
            3 => Font::Gm,
            4 => Font::Talk,
            _ => return Err(invalid("font", value)),
        })
    }
}

/// Kind of entity an effect is attached to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntityKind {
    Character,
    Npc,
}

impl EntityKind {
    fn to_wire(self) -> u8 {
        match self {
            EntityKind::Character => 1,
            EntityKind::Npc => 2,
        }
    }

    fn from_wire(value: u8) -> DecodeResult<Self> {
        match value {
            1 => Ok(EntityKind::Character),
            2 => Ok(EntityKind::Npc),
            _ => Err(invalid("entity kind", value)),
        }
    }
}

// ============================================================================
// Client -> server
// ============================================================================

pub mod client_op {
    pub const LOGIN: u8 = 0x01;
    pub const CREATE_CHARACTER: u8 = 0x02;
    pub const WALK: u8 = 0x03;
    pub const ATTACK: u8 = 0x04;
    pub const RANGED_ATTACK: u8 = 0x05;
    pub const PICK_UP: u8 = 0x06;
    pub const DROP: u8 = 0x07;
    pub const CAST_SPELL: u8 = 0x08;
    pub const USE_ITEM: u8 = 0x09;
    pub const EQUIP_ITEM: u8 = 0x0A;
    pub const WORK: u8 = 0x0B;
    pub const TALK: u8 = 0x0C;
    pub const CHANGE_HEADING: u8 = 0x0D;
    pub const REQUEST_POSITION: u8 = 0x0E;
    pub const PING: u8 = 0x0F;
    pub const QUIT: u8 = 0x10;
    pub const RESURRECT: u8 = 0x11;
    pub const GM_COMMAND: u8 = 0x12;
    pub const COMMERCE_BUY: u8 = 0x13;
    pub const COMMERCE_SELL: u8 = 0x14;
    pub const BANK_DEPOSIT: u8 = 0x15;
    pub const BANK_WITHDRAW: u8 = 0x16;
    pub const TAME: u8 = 0x17;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientPacket {
    Login { name: String, version: u16 },
    CreateCharacter {
        name: String,
        archetype: u8,
        body: u16,
        head: u16,
        home_city: u16,
    },
    Walk { heading: Heading },
    /// Melee attack on the faced tile
    Attack,
    RangedAttack { target: TileCoord },
    PickUp,
    /// Inventory slots are 1-based on the wire and 0-based here
    Drop { slot: u8, amount: u16 },
    /// `spell` is the 0-based index into the known-spell list
    CastSpell { spell: u8, target: TileCoord },
    UseItem { slot: u8 },
    EquipItem { slot: u8 },
    Work { target: TileCoord },
    Talk { text: String },
    ChangeHeading { heading: Heading },
    RequestPositionUpdate,
    Ping { timestamp: u32 },
    Quit,
    Resurrect,
    GmCommand { command: String },
    CommerceBuy { slot: u8, amount: u16 },
    CommerceSell { slot: u8, amount: u16 },
    BankDeposit { slot: u8, amount: u16 },
    BankWithdraw { slot: u8, amount: u16 },
    Tame { target: TileCoord },
}

impl ClientPacket {
    pub fn opcode(&self) -> u8 {
        use client_op::*;
        match self {
            ClientPacket::Login { .. } => LOGIN,
            ClientPacket::CreateCharacter { .. } => CREATE_CHARACTER,
            ClientPacket::Walk { .. } => WALK,
            ClientPacket::Attack => ATTACK,
            ClientPacket::RangedAttack { .. } => RANGED_ATTACK,
            ClientPacket::PickUp => PICK_UP,
            ClientPacket::Drop { .. } => DROP,
            ClientPacket::CastSpell { .. } => CAST_SPELL,
            ClientPacket::UseItem { .. } => USE_ITEM,
            ClientPacket::EquipItem { .. } => EQUIP_ITEM,
            ClientPacket::Work { .. } => WORK,
            ClientPacket::Talk { .. } => TALK,
            ClientPacket::ChangeHeading { .. } => CHANGE_HEADING,
            ClientPacket::RequestPositionUpdate => REQUEST_POSITION,
            ClientPacket::Ping { .. } => PING,
            ClientPacket::Quit => QUIT,
            ClientPacket::Resurrect => RESURRECT,
            ClientPacket::GmCommand { .. } => GM_COMMAND,
            ClientPacket::CommerceBuy { .. } => COMMERCE_BUY,
            ClientPacket::CommerceSell { .. } => COMMERCE_SELL,
            ClientPacket::BankDeposit { .. } => BANK_DEPOSIT,
            ClientPacket::BankWithdraw { .. } => BANK_WITHDRAW,
            ClientPacket::Tame { .. } => TAME,
        }
    }

    pub fn encode(&self) -> Vec<u8> {
        let f = FrameBuilder::new().write_u8(self.opcode());
        let f = match self {
            ClientPacket::Login { name, version } => f.write_string(name).write_u16(*version),
            ClientPacket::CreateCharacter {
                name,
                archetype,
                body,
                head,
                home_city,
            } => f
                .write_string(name)
                .write_u8(*archetype)
                .write_u16(*body)
                .write_u16(*head)
                .write_u16(*home_city),
            ClientPacket::Walk { heading } | ClientPacket::ChangeHeading { heading } => {
                f.write_u8(heading.to_wire())
            }
            ClientPacket::Attack
            | ClientPacket::PickUp
            | ClientPacket::RequestPositionUpdate
            | ClientPacket::Quit
            | ClientPacket::Resurrect => f,
            ClientPacket::RangedAttack { target }
            | ClientPacket::Work { target }
            | ClientPacket::Tame { target } => write_coord(f, *target),
            ClientPacket::Drop { slot, amount }
            | ClientPacket::CommerceBuy { slot, amount }
            | ClientPacket::CommerceSell { slot, amount }
            | ClientPacket::BankDeposit { slot, amount }
            | ClientPacket::BankWithdraw { slot, amount } => {
                f.write_u8(slot.saturating_add(1)).write_u16(*amount)
            }
            ClientPacket::CastSpell { spell, target } => {
                write_coord(f.write_u8(spell.saturating_add(1)), *target)
            }
            ClientPacket::UseItem { slot } | ClientPacket::EquipItem { slot } => {
                f.write_u8(slot.saturating_add(1))
            }
            ClientPacket::Talk { text } => f.write_string(text),
            ClientPacket::Ping { timestamp } => f.write_u32(*timestamp),
            ClientPacket::GmCommand { command } => f.write_string(command),
        };
        f.build()
    }

    /// Decode one packet from the head of `data`
    ///
    /// Returns the packet and the number of bytes it occupied, or
    /// `ProtocolError::Incomplete` when more bytes are needed.
    pub fn decode(data: &[u8]) -> DecodeResult<(ClientPacket, usize)> {
        use client_op::*;
        let mut r = FrameReader::new(data);
        let opcode = need(r.read_u8())?;
        let packet = match opcode {
            LOGIN => ClientPacket::Login {
                name: read_string(&mut r)?,
                version: read_u16(&mut r)?,
            },
            CREATE_CHARACTER => ClientPacket::CreateCharacter {
                name: read_string(&mut r)?,
                archetype: read_u8(&mut r)?,
                body: read_u16(&mut r)?,
                head: read_u16(&mut r)?,
                home_city: read_u16(&mut r)?,
            },
            WALK => ClientPacket::Walk {
                heading: read_heading(&mut r)?,
            },
            ATTACK => ClientPacket::Attack,
            RANGED_ATTACK => ClientPacket::RangedAttack {
                target: read_coord(&mut r)?,
            },
            PICK_UP => ClientPacket::PickUp,
            DROP => {
                let (slot, amount) = read_slot_amount(&mut r)?;
                ClientPacket::Drop { slot, amount }
            }
            CAST_SPELL => ClientPacket::CastSpell {
                spell: read_slot(&mut r)?,
                target: read_coord(&mut r)?,
            },
            USE_ITEM => ClientPacket::UseItem {
                slot: read_slot(&mut r)?,
            },
            EQUIP_ITEM => ClientPacket::EquipItem {
                slot: read_slot(&mut r)?,
            },
            WORK => ClientPacket::Work {
                target: read_coord(&mut r)?,
            },
            TALK => ClientPacket::Talk {
                text: read_string(&mut r)?,
            },
            CHANGE_HEADING => ClientPacket::ChangeHeading {
                heading: read_heading(&mut r)?,
            },
            REQUEST_POSITION => ClientPacket::RequestPositionUpdate,
            PING => ClientPacket::Ping {
                timestamp: read_u32(&mut r)?,
            },
            QUIT => ClientPacket::Quit,
            RESURRECT => ClientPacket::Resurrect,
            GM_COMMAND => ClientPacket::GmCommand {
                command: read_string(&mut r)?,
            },
            COMMERCE_BUY | COMMERCE_SELL | BANK_DEPOSIT | BANK_WITHDRAW => {
                let (slot, amount) = read_slot_amount(&mut r)?;
                match opcode {
                    COMMERCE_BUY => ClientPacket::CommerceBuy { slot, amount },
                    COMMERCE_SELL => ClientPacket::CommerceSell { slot, amount },
                    BANK_DEPOSIT => ClientPacket::BankDeposit { slot, amount },
                    _ => ClientPacket::BankWithdraw { slot, amount },
                }
            }
            TAME => ClientPacket::Tame {
                target: read_coord(&mut r)?,
            },
            other => return Err(ProtocolError::UnknownOpcode(other)),
        };
        Ok((packet, r.position()))
    }
}

// ============================================================================
// Server -> client
// ============================================================================

pub mod server_op {
    pub const LOGGED_IN: u8 = 0x01;
    pub const CHANGE_REGION: u8 = 0x02;
    pub const POSITION_UPDATE: u8 = 0x03;
    pub const CHARACTER_CREATE: u8 = 0x04;
    pub const CHARACTER_REMOVE: u8 = 0x05;
    pub const CHARACTER_MOVE: u8 = 0x06;
    pub const CHARACTER_CHANGE: u8 = 0x07;
    pub const NPC_CREATE: u8 = 0x08;
    pub const NPC_REMOVE: u8 = 0x09;
    pub const NPC_MOVE: u8 = 0x0A;
    pub const NPC_HEADING: u8 = 0x0B;
    pub const OBJECT_CREATE: u8 = 0x0C;
    pub const OBJECT_REMOVE: u8 = 0x0D;
    pub const UPDATE_STATS: u8 = 0x0E;
    pub const UPDATE_HP: u8 = 0x0F;
    pub const UPDATE_HUNGER_THIRST: u8 = 0x10;
    pub const INVENTORY_SLOT: u8 = 0x11;
    pub const CONSOLE_MESSAGE: u8 = 0x12;
    pub const CHAT_OVER_HEAD: u8 = 0x13;
    pub const PLAY_SOUND: u8 = 0x14;
    pub const CREATE_FX: u8 = 0x15;
    pub const SAILING: u8 = 0x16;
    pub const PARALYZED: u8 = 0x17;
    pub const SPELL_SLOT: u8 = 0x18;
    pub const PONG: u8 = 0x19;
    pub const DISCONNECT: u8 = 0x1A;
    pub const ERROR_MESSAGE: u8 = 0x1B;
}

/// Everything a client needs to draw a character
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CharacterView {
    pub index: u16,
    pub name: String,
    pub body: u16,
    pub head: u16,
    pub heading: Heading,
    pub at: TileCoord,
    pub weapon: u16,
    pub shield: u16,
    pub helmet: u16,
    pub criminal: bool,
    pub dead: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NpcView {
    pub index: u16,
    pub name: String,
    pub body: u16,
    pub head: u16,
    pub heading: Heading,
    pub at: TileCoord,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatsView {
    pub max_hp: u16,
    pub hp: u16,
    pub max_mana: u16,
    pub mana: u16,
    pub max_stamina: u16,
    pub stamina: u16,
    pub gold: u32,
    pub level: u8,
    pub experience: u32,
    /// 0 at the level cap
    pub next_level: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServerPacket {
    LoggedIn { index: u16 },
    ChangeRegion { region: u16, name: String },
    PositionUpdate { at: TileCoord },
    CharacterCreate(CharacterView),
    CharacterRemove { index: u16 },
    CharacterMove { index: u16, at: TileCoord, heading: Heading },
    CharacterChange {
        index: u16,
        body: u16,
        head: u16,
        heading: Heading,
        weapon: u16,
        shield: u16,
        helmet: u16,
    },
    NpcCreate(NpcView),
    NpcRemove { index: u16 },
    NpcMove { index: u16, at: TileCoord, heading: Heading },
    NpcHeading { index: u16, heading: Heading },
    ObjectCreate { graphic: u16, at: TileCoord },
    ObjectRemove { at: TileCoord },
    UpdateStats(StatsView),
    UpdateHp { hp: u16 },
    UpdateHungerThirst { hunger: u8, thirst: u8 },
    /// `object` 0 clears the slot; slots are 0-based here
    InventorySlot {
        slot: u8,
        object: u16,
        name: String,
        amount: u16,
        equipped: bool,
    },
    ConsoleMessage { text: String, font: Font },
    ChatOverHead { index: u16, text: String, color: u32 },
    PlaySound { sound: u16, at: TileCoord },
    CreateFx { kind: EntityKind, index: u16, fx: u16, loops: u16 },
    Sailing { sailing: bool },
    Paralyzed { paralyzed: bool },
    SpellSlot { slot: u8, spell: u16, name: String },
    Pong { timestamp: u32 },
    Disconnect { reason: String },
    ErrorMessage { text: String },
}

impl ServerPacket {
    pub fn console(text: impl Into<String>, font: Font) -> Self {
        ServerPacket::ConsoleMessage {
            text: text.into(),
            font,
        }
    }

    pub fn opcode(&self) -> u8 {
        use server_op::*;
        match self {
            ServerPacket::LoggedIn { .. } => LOGGED_IN,
            ServerPacket::ChangeRegion { .. } => CHANGE_REGION,
            ServerPacket::PositionUpdate { .. } => POSITION_UPDATE,
            ServerPacket::CharacterCreate(_) => CHARACTER_CREATE,
            ServerPacket::CharacterRemove { .. } => CHARACTER_REMOVE,
            ServerPacket::CharacterMove { .. } => CHARACTER_MOVE,
            ServerPacket::CharacterChange { .. } => CHARACTER_CHANGE,
            ServerPacket::NpcCreate(_) => NPC_CREATE,
            ServerPacket::NpcRemove { .. } => NPC_REMOVE,
            ServerPacket::NpcMove { .. } => NPC_MOVE,
            ServerPacket::NpcHeading { .. } => NPC_HEADING,
            ServerPacket::ObjectCreate { .. } => OBJECT_CREATE,
            ServerPacket::ObjectRemove { .. } => OBJECT_REMOVE,
            ServerPacket::UpdateStats(_) => UPDATE_STATS,
            ServerPacket::UpdateHp { .. } => UPDATE_HP,
            ServerPacket::UpdateHungerThirst { .. } => UPDATE_HUNGER_THIRST,
            ServerPacket::InventorySlot { .. } => INVENTORY_SLOT,
            ServerPacket::ConsoleMessage { .. } => CONSOLE_MESSAGE,
            ServerPacket::ChatOverHead { .. } => CHAT_OVER_HEAD,
            ServerPacket::PlaySound { .. } => PLAY_SOUND,
            ServerPacket::CreateFx { .. } => CREATE_FX,
            ServerPacket::Sailing { .. } => SAILING,
            ServerPacket::Paralyzed { .. } => PARALYZED,
            ServerPacket::SpellSlot { .. } => SPELL_SLOT,
            ServerPacket::Pong { .. } => PONG,
            ServerPacket::Disconnect { .. } => DISCONNECT,
            ServerPacket::ErrorMessage { .. } => ERROR_MESSAGE,
        }
    }

    pub fn encode(&self) -> Vec<u8> {
        let f = FrameBuilder::new().write_u8(self.opcode());
        let f = match self {
            ServerPacket::LoggedIn { index }
            | ServerPacket::CharacterRemove { index }
            | ServerPacket::NpcRemove { index } => f.write_u16(*index),
            ServerPacket::ChangeRegion { region, name } => f.write_u16(*region).write_string(name),
            ServerPacket::PositionUpdate { at } | ServerPacket::ObjectRemove { at } => {
                write_coord(f, *at)
            }
            ServerPacket::CharacterCreate(v) => {
                let f = f
                    .write_u16(v.index)
                    .write_u16(v.body)
                    .write_u16(v.head)
                    .write_u8(v.heading.to_wire());
                write_coord(f, v.at)
                    .write_u16(v.weapon)
                    .write_u16(v.shield)
                    .write_u16(v.helmet)
                    .write_string(&v.name)
                    .write_u8(u8::from(v.criminal) | (u8::from(v.dead) << 1))
            }
            ServerPacket::CharacterMove { index, at, heading }
            | ServerPacket::NpcMove { index, at, heading } => {
                write_coord(f.write_u16(*index), *at).write_u8(heading.to_wire())
            }
            ServerPacket::CharacterChange {
                index,
                body,
                head,
                heading,
                weapon,
                shield,
                helmet,
            } => f
                .write_u16(*index)
                .write_u16(*body)
                .write_u16(*head)
                .write_u8(heading.to_wire())
                .write_u16(*weapon)
                .write_u16(*shield)
                .write_u16(*helmet),
            ServerPacket::NpcCreate(v) => {
                let f = f
                    .write_u16(v.index)
                    .write_u16(v.body)
                    .write_u16(v.head)
                    .write_u8(v.heading.to_wire());
                write_coord(f, v.at).write_string(&v.name)
            }
            ServerPacket::NpcHeading { index, heading } => {
                f.write_u16(*index).write_u8(heading.to_wire())
            }
            ServerPacket::ObjectCreate { graphic, at } => write_coord(f.write_u16(*graphic), *at),
            ServerPacket::UpdateStats(s) => f
                .write_u16(s.max_hp)
                .write_u16(s.hp)
                .write_u16(s.max_mana)
                .write_u16(s.mana)
                .write_u16(s.max_stamina)
                .write_u16(s.stamina)
                .write_u32(s.gold)
                .write_u8(s.level)
                .write_u32(s.experience)
                .write_u32(s.next_level),
            ServerPacket::UpdateHp { hp } => f.write_u16(*hp),
            ServerPacket::UpdateHungerThirst { hunger, thirst } => {
                f.write_u8(*hunger).write_u8(*thirst)
            }
            ServerPacket::InventorySlot {
                slot,
                object,
                name,
                amount,
                equipped,
            } => f
                .write_u8(slot.saturating_add(1))
                .write_u16(*object)
                .write_string(name)
                .write_u16(*amount)
                .write_bool(*equipped),
            ServerPacket::ConsoleMessage { text, font } => {
                f.write_string(text).write_u8(font.to_wire())
            }
            ServerPacket::ChatOverHead { index, text, color } => {
                f.write_u16(*index).write_string(text).write_u32(*color)
            }
            ServerPacket::PlaySound { sound, at } => write_coord(f.write_u16(*sound), *at),
            ServerPacket::CreateFx {
                kind,
                index,
                fx,
                loops,
            } => f
                .write_u8(kind.to_wire())
                .write_u16(*index)
                .write_u16(*fx)
                .write_u16(*loops),
            ServerPacket::Sailing { sailing } => f.write_bool(*sailing),
            ServerPacket::Paralyzed { paralyzed } => f.write_bool(*paralyzed),
            ServerPacket::SpellSlot { slot, spell, name } => {
                f.write_u8(slot.saturating_add(1)).write_u16(*spell).write_string(name)
            }
            ServerPacket::Pong { timestamp } => f.write_u32(*timestamp),
            ServerPacket::Disconnect { reason } => f.write_string(reason),
            ServerPacket::ErrorMessage { text } => f.write_string(text),
        };
        f.build()
    }

    /// Client-side decoder, the mirror of [`ServerPacket::encode`]
    pub fn decode(data: &[u8]) -> DecodeResult<(ServerPacket, usize)> {
        use server_op::*;
        let mut r = FrameReader::new(data);
        let opcode = need(r.read_u8())?;
        let r = &mut r;
        let packet = match opcode {
            LOGGED_IN => ServerPacket::LoggedIn { index: read_u16(r)? },
            CHANGE_REGION => ServerPacket::ChangeRegion {
                region: read_u16(r)?,
                name: read_string(r)?,
            },
            POSITION_UPDATE => ServerPacket::PositionUpdate { at: read_coord(r)? },
            CHARACTER_CREATE => {
                let index = read_u16(r)?;
                let body = read_u16(r)?;
                let head = read_u16(r)?;
                let heading = read_heading(r)?;
                let at = read_coord(r)?;
                let weapon = read_u16(r)?;
                let shield = read_u16(r)?;
                let helmet = read_u16(r)?;
                let name = read_string(r)?;
                let flags = read_u8(r)?;
                ServerPacket::CharacterCreate(CharacterView {
                    index,
                    name,
                    body,
                    head,
                    heading,
                    at,
                    weapon,
                    shield,
                    helmet,
                    criminal: flags & 1 != 0,
                    dead: flags & 2 != 0,
                })
            }
            CHARACTER_REMOVE => ServerPacket::CharacterRemove { index: read_u16(r)? },
            CHARACTER_MOVE => ServerPacket::CharacterMove {
                index: read_u16(r)?,
                at: read_coord(r)?,
                heading: read_heading(r)?,
            },
            CHARACTER_CHANGE => ServerPacket::CharacterChange {
                index: read_u16(r)?,
                body: read_u16(r)?,
                head: read_u16(r)?,
                heading: read_heading(r)?,
                weapon: read_u16(r)?,
                shield: read_u16(r)?,
                helmet: read_u16(r)?,
            },
            NPC_CREATE => {
                let index = read_u16(r)?;
                let body = read_u16(r)?;
                let head = read_u16(r)?;
                let heading = read_heading(r)?;
                let at = read_coord(r)?;
                let name = read_string(r)?;
                ServerPacket::NpcCreate(NpcView {
                    index,
                    name,
                    body,
                    head,
                    heading,
                    at,
                })
            }
            NPC_REMOVE => ServerPacket::NpcRemove { index: read_u16(r)? },
            NPC_MOVE => ServerPacket::NpcMove {
                index: read_u16(r)?,
                at: read_coord(r)?,
                heading: read_heading(r)?,
            },
            NPC_HEADING => ServerPacket::NpcHeading {
                index: read_u16(r)?,
                heading: read_heading(r)?,
            },
            OBJECT_CREATE => ServerPacket::ObjectCreate {
                graphic: read_u16(r)?,
                at: read_coord(r)?,
            },
            OBJECT_REMOVE => ServerPacket::ObjectRemove { at: read_coord(r)? },
            UPDATE_STATS => ServerPacket::UpdateStats(StatsView {
                max_hp: read_u16(r)?,
                hp: read_u16(r)?,
                max_mana: read_u16(r)?,
                mana: read_u16(r)?,
                max_stamina: read_u16(r)?,
                stamina: read_u16(r)?,
                gold: read_u32(r)?,
                level: read_u8(r)?,
                experience: read_u32(r)?,
                next_level: read_u32(r)?,
            }),
            UPDATE_HP => ServerPacket::UpdateHp { hp: read_u16(r)? },
            UPDATE_HUNGER_THIRST => ServerPacket::UpdateHungerThirst {
                hunger: read_u8(r)?,
                thirst: read_u8(r)?,
            },
            INVENTORY_SLOT => ServerPacket::InventorySlot {
                slot: read_slot(r)?,
                object: read_u16(r)?,
                name: read_string(r)?,
                amount: read_u16(r)?,
                equipped: read_bool(r, "equipped")?,
            },
            CONSOLE_MESSAGE => ServerPacket::ConsoleMessage {
                text: read_string(r)?,
                font: Font::from_wire(read_u8(r)?)?,
            },
            CHAT_OVER_HEAD => ServerPacket::ChatOverHead {
                index: read_u16(r)?,
                text: read_string(r)?,
                color: read_u32(r)?,
            },
            PLAY_SOUND => ServerPacket::PlaySound {
                sound: read_u16(r)?,
                at: read_coord(r)?,
            },
            CREATE_FX => ServerPacket::CreateFx {
                kind: EntityKind::from_wire(read_u8(r)?)?,
                index: read_u16(r)?,
                fx: read_u16(r)?,
                loops: read_u16(r)?,
            },
            SAILING => ServerPacket::Sailing {
                sailing: read_bool(r, "sailing")?,
            },
            PARALYZED => ServerPacket::Paralyzed {
                paralyzed: read_bool(r, "paralyzed")?,
            },
            SPELL_SLOT => ServerPacket::SpellSlot {
                slot: read_slot(r)?,
                spell: read_u16(r)?,
                name: read_string(r)?,
            },
            PONG => ServerPacket::Pong { timestamp: read_u32(r)? },
            DISCONNECT => ServerPacket::Disconnect { reason: read_string(r)? },
            ERROR_MESSAGE => ServerPacket::ErrorMessage { text: read_string(r)? },
            other => return Err(ProtocolError::UnknownOpcode(other)),
        };
        Ok((packet, r.position()))
    }
}

// ============================================================================
// Field codecs
// ============================================================================

#[inline]
fn need<T>(value: Option<T>) -> DecodeResult<T> {
    value.ok_or(ProtocolError::Incomplete)
}

fn invalid(field: &'static str, value: impl Into<u32>) -> ProtocolError {
    ProtocolError::InvalidValue {
        field,
        value: value.into(),
    }
}

fn read_u8(r: &mut FrameReader) -> DecodeResult<u8> {
    need(r.read_u8())
}

fn read_u16(r: &mut FrameReader) -> DecodeResult<u16> {
    need(r.read_u16())
}

fn read_u32(r: &mut FrameReader) -> DecodeResult<u32> {
    need(r.read_u32())
}

fn read_bool(r: &mut FrameReader, field: &'static str) -> DecodeResult<bool> {
    match read_u8(r)? {
        0 => Ok(false),
        1 => Ok(true),
        other => Err(invalid(field, other)),
    }
}

/// Oversized length prefixes are rejected before waiting for the body
fn read_string(r: &mut FrameReader) -> DecodeResult<String> {
    let len = usize::from(need(r.peek_u16())?);
    if len > MAX_STRING_LEN {
        return Err(ProtocolError::StringTooLong(len));
    }
    let bytes = need(r.read_prefixed())?;
    String::from_utf8(bytes.to_vec()).map_err(|_| ProtocolError::InvalidUtf8)
}

fn read_heading(r: &mut FrameReader) -> DecodeResult<Heading> {
    let value = read_u8(r)?;
    Heading::from_wire(value).ok_or(ProtocolError::InvalidHeading(value))
}

fn read_coord(r: &mut FrameReader) -> DecodeResult<TileCoord> {
    let x = read_u8(r)?;
    let y = read_u8(r)?;
    if x == 0 || y == 0 {
        return Err(ProtocolError::InvalidCoordinate);
    }
    Ok(TileCoord::new(x - 1, y - 1))
}

fn write_coord(f: FrameBuilder, at: TileCoord) -> FrameBuilder {
    f.write_u8(at.x.saturating_add(1)).write_u8(at.y.saturating_add(1))
}

/// 1-based slot on the wire, 0-based in memory
fn read_slot(r: &mut FrameReader) -> DecodeResult<u8> {
    match read_u8(r)? {
        0 => Err(invalid("slot", 0u8)),
        slot => Ok(slot - 1),
    }
}

fn read_slot_amount(r: &mut FrameReader) -> DecodeResult<(u8, u16)> {
    Ok((read_slot(r)?, read_u16(r)?))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn client_round_trip(packet: ClientPacket) {
        let bytes = packet.encode();
        let (decoded, used) = ClientPacket::decode(&bytes).unwrap();
        assert_eq!(decoded, packet);
        assert_eq!(used, bytes.len());
    }

    #[test]
    fn test_login_layout() {
        let bytes = ClientPacket::Login {
            name: "Ana".into(),
            version: 1,
        }
        .encode();
        assert_eq!(bytes, vec![0x01, 3, 0, b'A', b'n', b'a', 1, 0]);
    }

    #[test]
    fn test_coordinates_are_one_based_on_wire() {
        let bytes = ClientPacket::Work {
            target: TileCoord::new(9, 0),
        }
        .encode();
        assert_eq!(bytes, vec![client_op::WORK, 10, 1]);

        let bytes = ServerPacket::PositionUpdate {
            at: TileCoord::new(10, 9),
        }
        .encode();
        assert_eq!(bytes, vec![server_op::POSITION_UPDATE, 11, 10]);
    }

    #[test]
    fn test_client_packets_decode_what_they_encode() {
        client_round_trip(ClientPacket::Walk {
            heading: Heading::West,
        });
        client_round_trip(ClientPacket::CastSpell {
            spell: 2,
            target: TileCoord::new(40, 41),
        });
        client_round_trip(ClientPacket::BankWithdraw { slot: 0, amount: 500 });
        client_round_trip(ClientPacket::GmCommand {
            command: "/tp 1 50 50".into(),
        });
    }

    #[test]
    fn test_incomplete_packet() {
        let bytes = ClientPacket::Talk {
            text: "hello there".into(),
        }
        .encode();
        for cut in 0..bytes.len() {
            assert_eq!(
                ClientPacket::decode(&bytes[..cut]),
                Err(ProtocolError::Incomplete),
                "cut at {}",
                cut
            );
        }
    }

    #[test]
    fn test_decode_reports_consumed_bytes_with_trailing_data() {
        let mut bytes = ClientPacket::Attack.encode();
        bytes.extend(ClientPacket::PickUp.encode());
        let (packet, used) = ClientPacket::decode(&bytes).unwrap();
        assert_eq!(packet, ClientPacket::Attack);
        assert_eq!(used, 1);
    }

    #[test]
    fn test_unknown_opcode_is_fatal() {
        assert_eq!(
            ClientPacket::decode(&[0xEE, 1, 2]),
            Err(ProtocolError::UnknownOpcode(0xEE))
        );
    }

    #[test]
    fn test_malformed_fields() {
        assert_eq!(
            ClientPacket::decode(&[client_op::WALK, 9]),
            Err(ProtocolError::InvalidHeading(9))
        );
        assert_eq!(
            ClientPacket::decode(&[client_op::WORK, 0, 5]),
            Err(ProtocolError::InvalidCoordinate)
        );
        assert_eq!(
            ClientPacket::decode(&[client_op::TALK, 2, 0, 0xFF, 0xFE]),
            Err(ProtocolError::InvalidUtf8)
        );
        let huge = (MAX_STRING_LEN as u16 + 1).to_le_bytes();
        assert_eq!(
            ClientPacket::decode(&[client_op::TALK, huge[0], huge[1]]),
            Err(ProtocolError::StringTooLong(MAX_STRING_LEN + 1))
        );
    }

    #[test]
    fn test_server_character_create() {
        let packet = ServerPacket::CharacterCreate(CharacterView {
            index: 7,
            name: "Brin".into(),
            body: 21,
            head: 4,
            heading: Heading::North,
            at: TileCoord::new(10, 9),
            weapon: 2,
            shield: 0,
            helmet: 0,
            criminal: true,
            dead: false,
        });
        let bytes = packet.encode();
        assert_eq!(bytes[0], server_op::CHARACTER_CREATE);
        let (decoded, used) = ServerPacket::decode(&bytes).unwrap();
        assert_eq!(decoded, packet);
        assert_eq!(used, bytes.len());
    }

    #[test]
    fn test_server_move_layout() {
        let bytes = ServerPacket::CharacterMove {
            index: 3,
            at: TileCoord::new(10, 9),
            heading: Heading::North,
        }
        .encode();
        assert_eq!(bytes, vec![server_op::CHARACTER_MOVE, 3, 0, 11, 10, 1]);
    }
}
