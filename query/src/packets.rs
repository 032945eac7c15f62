//! A2S wire codec.
//!
//! Integers are little-endian and strings are NUL-terminated. Every datagram
//! starts with a 4-byte header: `FF FF FF FF` for a complete packet, or
//! `FE FF FF FF` for one fragment of a split response.

use shared::{ServerInfo, SnapshotPlayer};

use crate::error::QueryError;

pub const SIMPLE_HEADER: [u8; 4] = [0xFF, 0xFF, 0xFF, 0xFF];
pub const SPLIT_HEADER: [u8; 4] = [0xFE, 0xFF, 0xFF, 0xFF];

pub const A2S_INFO: u8 = 0x54;
pub const A2S_PLAYER: u8 = 0x55;
pub const S2C_CHALLENGE: u8 = 0x41;
pub const S2A_INFO: u8 = 0x49;
pub const S2A_PLAYER: u8 = 0x44;

pub const INFO_PAYLOAD: &[u8] = b"Source Engine Query\0";

/// Challenge value sent before the server has handed one out.
pub const NO_CHALLENGE: [u8; 4] = [0xFF, 0xFF, 0xFF, 0xFF];

/// Length of the Source split header: marker, id, total, number, size.
pub const SPLIT_HEADER_LEN: usize = 4 + 4 + 1 + 1 + 2;

/// Requests a query client can send.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Request {
    Info { challenge: Option<[u8; 4]> },
    Players { challenge: Option<[u8; 4]> },
}

impl Request {
    pub fn info() -> Self {
        Request::Info { challenge: None }
    }

    pub fn players() -> Self {
        Request::Players { challenge: None }
    }

    /// The same request carrying a challenge echoed from the server.
    pub fn with_challenge(self, challenge: [u8; 4]) -> Self {
        match self {
            Request::Info { .. } => Request::Info {
                challenge: Some(challenge),
            },
            Request::Players { .. } => Request::Players {
                challenge: Some(challenge),
            },
        }
    }

    pub fn has_challenge(&self) -> bool {
        match self {
            Request::Info { challenge } | Request::Players { challenge } => challenge.is_some(),
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Request::Info { .. } => "A2S_INFO",
            Request::Players { .. } => "A2S_PLAYER",
        }
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(32);
        out.extend_from_slice(&SIMPLE_HEADER);
        match self {
            Request::Info { challenge } => {
                out.push(A2S_INFO);
                out.extend_from_slice(INFO_PAYLOAD);
                if let Some(challenge) = challenge {
                    out.extend_from_slice(challenge);
                }
            }
            Request::Players { challenge } => {
                out.push(A2S_PLAYER);
                out.extend_from_slice(&challenge.unwrap_or(NO_CHALLENGE));
            }
        }
        out
    }
}

/// A fully decoded response.
#[derive(Debug, Clone, PartialEq)]
pub enum Response {
    Challenge([u8; 4]),
    Info(ServerInfo),
    Players(Vec<SnapshotPlayer>),
}

/// One fragment of a split response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Fragment {
    pub request_id: i32,
    pub total: u8,
    pub index: u8,
    pub payload: Vec<u8>,
}

/// First-level classification of a received datagram.
#[derive(Debug, Clone, PartialEq)]
pub enum Datagram<'a> {
    /// A complete response, header included.
    Single(&'a [u8]),
    Fragment(Fragment),
}

/// Splits a raw datagram into a complete packet or a fragment.
pub fn classify(datagram: &[u8]) -> Result<Datagram<'_>, QueryError> {
    if datagram.len() < 5 {
        return Err(QueryError::malformed(format!(
            "datagram too short: {} bytes",
            datagram.len()
        )));
    }

    match &datagram[0..4] {
        header if header == SIMPLE_HEADER => Ok(Datagram::Single(datagram)),
        header if header == SPLIT_HEADER => {
            let mut reader = PacketReader::new(&datagram[4..]);
            let request_id = reader.read_i32("request id")?;
            let total = reader.read_u8("fragment total")?;
            let index = reader.read_u8("fragment number")?;
            let _max_size = reader.read_u16("fragment size")?;

            if request_id < 0 {
                return Err(QueryError::Unsupported(format!(
                    "compressed split response (id {:#010x})",
                    request_id
                )));
            }
            if total == 0 || index >= total {
                return Err(QueryError::malformed(format!(
                    "fragment {} of {} out of range",
                    index, total
                )));
            }

            Ok(Datagram::Fragment(Fragment {
                request_id,
                total,
                index,
                payload: reader.remaining().to_vec(),
            }))
        }
        other => Err(QueryError::malformed(format!(
            "unknown packet header {:02X?}",
            other
        ))),
    }
}

/// Decodes a complete response, starting at its `FF FF FF FF` header.
pub fn decode_response(packet: &[u8]) -> Result<Response, QueryError> {
    let mut reader = PacketReader::new(packet);
    let header = reader.read_bytes::<4>("header")?;
    if header != SIMPLE_HEADER {
        return Err(QueryError::malformed(format!(
            "unexpected header {:02X?}",
            header
        )));
    }

    match reader.read_u8("response type")? {
        S2C_CHALLENGE => Ok(Response::Challenge(reader.read_bytes::<4>("challenge")?)),
        S2A_INFO => decode_info(&mut reader).map(Response::Info),
        S2A_PLAYER => decode_players(&mut reader).map(Response::Players),
        other => Err(QueryError::Unsupported(format!(
            "response type {:#04x}",
            other
        ))),
    }
}

fn decode_info(reader: &mut PacketReader<'_>) -> Result<ServerInfo, QueryError> {
    let _protocol = reader.read_u8("protocol")?;
    let name = reader.read_cstring("name")?;
    let map = reader.read_cstring("map")?;
    let folder = reader.read_cstring("folder")?;
    let game = reader.read_cstring("game")?;
    let app_id = reader.read_i16("app id")?;
    let players = reader.read_u8("players")?;
    let max_players = reader.read_u8("max players")?;
    let bots = reader.read_u8("bots")?;
    let _server_type = reader.read_u8("server type")?;
    let _environment = reader.read_u8("environment")?;
    let _visibility = reader.read_u8("visibility")?;
    let _vac = reader.read_u8("vac")?;
    let version = reader.read_cstring("version")?;
    // Extra data flags may follow; nothing downstream needs them.

    Ok(ServerInfo {
        name,
        map,
        folder,
        game,
        app_id,
        players,
        max_players,
        bots,
        version,
    })
}

fn decode_players(reader: &mut PacketReader<'_>) -> Result<Vec<SnapshotPlayer>, QueryError> {
    let count = reader.read_u8("player count")?;
    let mut players = Vec::with_capacity(count as usize);

    for _ in 0..count {
        let _index = reader.read_u8("player index")?;
        let name = reader.read_cstring("player name")?;
        let score = reader.read_i32("player score")?;
        let duration = reader.read_f32("player duration")?;
        players.push(SnapshotPlayer {
            name,
            score,
            duration,
        });
    }

    Ok(players)
}

/// Bounds-checked little-endian reader over one packet.
pub struct PacketReader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> PacketReader<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    pub fn remaining(&self) -> &'a [u8] {
        &self.data[self.pos..]
    }

    fn take(&mut self, len: usize, field: &str) -> Result<&'a [u8], QueryError> {
        let end = self
            .pos
            .checked_add(len)
            .ok_or_else(|| QueryError::malformed(format!("overflow reading {}", field)))?;
        let slice = self.data.get(self.pos..end).ok_or_else(|| {
            QueryError::malformed(format!(
                "field {} out of bounds: start={}, end={}, len={}",
                field,
                self.pos,
                end,
                self.data.len()
            ))
        })?;
        self.pos = end;
        Ok(slice)
    }

    pub fn read_bytes<const N: usize>(&mut self, field: &str) -> Result<[u8; N], QueryError> {
        let slice = self.take(N, field)?;
        let mut out = [0u8; N];
        out.copy_from_slice(slice);
        Ok(out)
    }

    pub fn read_u8(&mut self, field: &str) -> Result<u8, QueryError> {
        Ok(self.take(1, field)?[0])
    }

    pub fn read_u16(&mut self, field: &str) -> Result<u16, QueryError> {
        Ok(u16::from_le_bytes(self.read_bytes::<2>(field)?))
    }

    pub fn read_i16(&mut self, field: &str) -> Result<i16, QueryError> {
        Ok(i16::from_le_bytes(self.read_bytes::<2>(field)?))
    }

    pub fn read_i32(&mut self, field: &str) -> Result<i32, QueryError> {
        Ok(i32::from_le_bytes(self.read_bytes::<4>(field)?))
    }

    pub fn read_f32(&mut self, field: &str) -> Result<f32, QueryError> {
        Ok(f32::from_le_bytes(self.read_bytes::<4>(field)?))
    }

    pub fn read_cstring(&mut self, field: &str) -> Result<String, QueryError> {
        let rest = &self.data[self.pos..];
        let len = rest.iter().position(|b| *b == 0).ok_or_else(|| {
            QueryError::malformed(format!("unterminated string in field {}", field))
        })?;
        let value = String::from_utf8_lossy(&rest[..len]).into_owned();
        self.pos += len + 1;
        Ok(value)
    }
}
