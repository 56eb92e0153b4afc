//! Text wire protocol
//!
//! A frame is UTF-8 text holding one or more sub-messages separated by
//! [`MESSAGE_DELIM`]. Each sub-message is `command` followed by arguments,
//! separated by [`DELIM`].

use std::fmt::Write as _;

/// Field separator inside a sub-message
pub const DELIM: char = '\u{FFFF}';
/// Sub-message separator inside a frame
pub const MESSAGE_DELIM: char = '\u{FFFE}';
/// Largest session frame accepted for dispatch
pub const MAX_FRAME_SIZE: usize = 4096;
/// Hard cap for any frame on the stream
pub const MAX_BULK_FRAME_SIZE: usize = 8 * 1024 * 1024;

pub const MAX_NAME_CHARS: usize = 12;
pub const MAX_CHAT_CHARS: usize = 150;
pub const SPRITE_INDEX_RANGE: std::ops::RangeInclusive<i32> = -1..=7;

/// Frame and sub-message decode errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ProtocolError {
    #[error("frame too large: {0} bytes (max {1})")]
    FrameTooLarge(usize, usize),
    #[error("control byte 0x{0:02x} in frame")]
    ControlByte(u8),
    #[error("frame is not valid UTF-8")]
    InvalidUtf8,
    #[error("unknown command '{0}'")]
    UnknownCommand(String),
    #[error("'{0}' missing argument")]
    MissingArgument(&'static str),
    #[error("'{0}' invalid argument: {1}")]
    InvalidArgument(&'static str, &'static str),
}

/// Messages from client to server
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientMessage<'a> {
    /// Request own player info
    Info,
    /// Set display name
    Name(&'a str),
    /// Previous location update
    PrevLocation { map_id: &'a str, locations: &'a str },
    /// Global chat
    GlobalSay {
        map_id: &'a str,
        x: i32,
        y: i32,
        msg: &'a str,
    },
    /// Party chat
    PartySay(&'a str),
    /// Party status query
    PartyStatus,
    /// Equip a badge
    Badge(&'a str),
    Sprite { name: &'a str, index: i32 },
    System(&'a str),
    /// Anything else; may belong to an external command hook
    Other { command: &'a str, args: Vec<&'a str> },
}

impl<'a> ClientMessage<'a> {
    pub fn command(&self) -> &'a str {
        match *self {
            ClientMessage::Info => "i",
            ClientMessage::Name(_) => "name",
            ClientMessage::PrevLocation { .. } => "ploc",
            ClientMessage::GlobalSay { .. } => "gsay",
            ClientMessage::PartySay(_) => "psay",
            ClientMessage::PartyStatus => "pt",
            ClientMessage::Badge(_) => "badge",
            ClientMessage::Sprite { .. } => "spr",
            ClientMessage::System(_) => "sys",
            ClientMessage::Other { command, .. } => command,
        }
    }
}

/// Messages from server to client
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServerMessage<'a> {
    /// Sent once after admission
    Greeting {
        session_id: u32,
        uuid: &'a str,
        rank: u8,
        account: bool,
        badge: &'a str,
    },
    /// Online player count
    Population(usize),
    Info {
        uuid: &'a str,
        rank: u8,
        account: bool,
        badge: &'a str,
        name: &'a str,
    },
    NameAck(&'a str),
    PrevLocation {
        uuid: &'a str,
        map_id: &'a str,
        locations: &'a str,
    },
    GlobalSay {
        uuid: &'a str,
        map_id: &'a str,
        x: i32,
        y: i32,
        msg: &'a str,
    },
    PartySay { uuid: &'a str, msg: &'a str },
    /// Party JSON
    Party(&'a str),
    /// Requester has no party or the lookup failed
    PartyNull,
    BadgeAck(&'a str),
    SpriteAck { name: &'a str, index: i32 },
    SystemAck(&'a str),
}

impl ServerMessage<'_> {
    pub fn encode(&self) -> String {
        let mut out = String::with_capacity(64);
        match *self {
            ServerMessage::Greeting {
                session_id,
                uuid,
                rank,
                account,
                badge,
            } => push_fields(
                &mut out,
                "s",
                &[
                    &session_id.to_string(),
                    uuid,
                    &rank.to_string(),
                    flag(account),
                    badge,
                ],
            ),
            ServerMessage::Population(count) => push_fields(&mut out, "pc", &[&count.to_string()]),
            ServerMessage::Info {
                uuid,
                rank,
                account,
                badge,
                name,
            } => push_fields(
                &mut out,
                "i",
                &[uuid, &rank.to_string(), flag(account), badge, name],
            ),
            ServerMessage::NameAck(name) => push_fields(&mut out, "name", &[name]),
            ServerMessage::PrevLocation {
                uuid,
                map_id,
                locations,
            } => push_fields(&mut out, "ploc", &[uuid, map_id, locations]),
            ServerMessage::GlobalSay {
                uuid,
                map_id,
                x,
                y,
                msg,
            } => push_fields(
                &mut out,
                "gsay",
                &[uuid, map_id, &x.to_string(), &y.to_string(), msg],
            ),
            ServerMessage::PartySay { uuid, msg } => push_fields(&mut out, "psay", &[uuid, msg]),
            ServerMessage::Party(json) => push_fields(&mut out, "pt", &[json]),
            ServerMessage::PartyNull => push_fields(&mut out, "pt", &["null"]),
            ServerMessage::BadgeAck(badge) => push_fields(&mut out, "badge", &[badge]),
            ServerMessage::SpriteAck { name, index } => {
                push_fields(&mut out, "spr", &[name, &index.to_string()])
            }
            ServerMessage::SystemAck(name) => push_fields(&mut out, "sys", &[name]),
        }
        out
    }
}

fn flag(value: bool) -> &'static str {
    if value {
        "1"
    } else {
        "0"
    }
}

fn push_fields(out: &mut String, command: &str, fields: &[&str]) {
    out.push_str(command);
    for field in fields {
        // Writing to a String cannot fail
        let _ = write!(out, "{}{}", DELIM, field);
    }
}

/// Check size, byte range and encoding of an inbound frame
pub fn validate_frame(bytes: &[u8]) -> Result<&str, ProtocolError> {
    if bytes.len() > MAX_FRAME_SIZE {
        return Err(ProtocolError::FrameTooLarge(bytes.len(), MAX_FRAME_SIZE));
    }
    if let Some(&b) = bytes.iter().find(|&&b| b < 0x20) {
        return Err(ProtocolError::ControlByte(b));
    }
    std::str::from_utf8(bytes).map_err(|_| ProtocolError::InvalidUtf8)
}

/// Non-empty sub-messages of a validated frame
pub fn split_messages(frame: &str) -> impl Iterator<Item = &str> {
    frame.split(MESSAGE_DELIM).filter(|m| !m.is_empty())
}

/// Parse one sub-message
pub fn decode(message: &str) -> Result<ClientMessage<'_>, ProtocolError> {
    let mut fields = message.split(DELIM);
    let command = fields.next().unwrap_or_default();
    let args: Vec<&str> = fields.collect();

    let arg = |i: usize, cmd: &'static str| {
        args.get(i)
            .copied()
            .ok_or(ProtocolError::MissingArgument(cmd))
    };

    let msg = match command {
        "i" => ClientMessage::Info,
        "name" => {
            let name = arg(0, "name")?;
            if name.is_empty()
                || name.chars().count() > MAX_NAME_CHARS
                || !name.chars().all(|c| c.is_ascii_alphanumeric())
            {
                return Err(ProtocolError::InvalidArgument(
                    "name",
                    "must be 1-12 letters or digits",
                ));
            }
            ClientMessage::Name(name)
        }
        "ploc" => ClientMessage::PrevLocation {
            map_id: arg(0, "ploc")?,
            locations: arg(1, "ploc")?,
        },
        "gsay" => {
            let map_id = arg(0, "gsay")?;
            let x = arg(1, "gsay")?
                .parse::<i32>()
                .map_err(|_| ProtocolError::InvalidArgument("gsay", "x is not a number"))?;
            let y = arg(2, "gsay")?
                .parse::<i32>()
                .map_err(|_| ProtocolError::InvalidArgument("gsay", "y is not a number"))?;
            let msg = chat_text(arg(3, "gsay")?, "gsay")?;
            ClientMessage::GlobalSay { map_id, x, y, msg }
        }
        "psay" => ClientMessage::PartySay(chat_text(arg(0, "psay")?, "psay")?),
        "pt" => ClientMessage::PartyStatus,
        "badge" => {
            let badge = arg(0, "badge")?;
            if badge.is_empty() {
                return Err(ProtocolError::InvalidArgument("badge", "empty badge id"));
            }
            ClientMessage::Badge(badge)
        }
        "spr" => {
            let name = arg(0, "spr")?;
            let index = arg(1, "spr")?
                .parse::<i32>()
                .ok()
                .filter(|i| SPRITE_INDEX_RANGE.contains(i))
                .ok_or(ProtocolError::InvalidArgument("spr", "index out of range"))?;
            ClientMessage::Sprite { name, index }
        }
        "sys" => ClientMessage::System(arg(0, "sys")?),
        _ => ClientMessage::Other { command, args },
    };
    Ok(msg)
}

fn chat_text<'a>(msg: &'a str, cmd: &'static str) -> Result<&'a str, ProtocolError> {
    let msg = msg.trim();
    if msg.is_empty() {
        return Err(ProtocolError::InvalidArgument(cmd, "empty message"));
    }
    if msg.chars().count() > MAX_CHAT_CHARS {
        return Err(ProtocolError::InvalidArgument(cmd, "message too long"));
    }
    Ok(msg)
}
