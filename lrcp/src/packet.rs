//! LRCP packet grammar.
//!
//! Every packet is a single UDP datagram of at most 999 bytes whose
//! payload starts and ends with `/`, with `/`-separated fields in
//! between:
//!
//! ```raw
//! /connect/SESSION/
//! /data/SESSION/POS/DATA/
//! /ack/SESSION/LENGTH/
//! /close/SESSION/
//! ```
//!
//! Numeric fields are non-negative decimal integers smaller than
//! 2^31. Inside a `data` payload, `\` and `/` travel escaped as `\\`
//! and `\/`; a bare `/` in the payload makes the packet invalid.
//! Invalid packets are dropped without a reply.

/// Datagrams must stay strictly below this size, in both directions.
pub const MAX_PACKET: usize = 1000;

/// Escaped-payload budget for a single `data` packet. Leaves room for
/// the framing, the session token, and a ten-digit position inside
/// [`MAX_PACKET`].
pub const MAX_DATA: usize = 900;

const MAX_NUMERIC: u64 = (1 << 31) - 1;

#[derive(Debug, PartialEq, Eq, Clone)]
pub enum Packet {
    Connect { session: u32 },
    Data { session: u32, pos: u32, data: Vec<u8> },
    Ack { session: u32, length: u32 },
    Close { session: u32 },
}

#[derive(Debug, PartialEq, Eq, thiserror::Error)]
pub enum ParseError {
    #[error("packet too long")]
    TooLong,

    #[error("missing framing slashes")]
    BadFraming,

    #[error("unknown packet type")]
    UnknownType,

    #[error("wrong field count")]
    BadFieldCount,

    #[error("bad numeric field")]
    BadNumber,

    #[error("unescaped slash in data")]
    UnescapedSlash,

    #[error("dangling escape in data")]
    BadEscape,
}

impl TryFrom<&[u8]> for Packet {
    type Error = ParseError;

    fn try_from(raw: &[u8]) -> Result<Self, Self::Error> {
        if raw.len() >= MAX_PACKET {
            return Err(ParseError::TooLong);
        }

        if raw.len() < 2 || raw[0] != b'/' || raw[raw.len() - 1] != b'/' {
            return Err(ParseError::BadFraming);
        }

        let body = &raw[1..raw.len() - 1];
        let mut fields = body.splitn(2, |&b| b == b'/');
        let kind = fields.next().ok_or(ParseError::BadFraming)?;
        let rest = fields.next().ok_or(ParseError::BadFieldCount)?;

        match kind {
            b"connect" => Ok(Packet::Connect {
                session: single_number(rest)?,
            }),
            b"close" => Ok(Packet::Close {
                session: single_number(rest)?,
            }),
            b"ack" => {
                let (session, length) = number_pair(rest)?;
                Ok(Packet::Ack { session, length })
            }
            b"data" => {
                let mut fields = rest.splitn(3, |&b| b == b'/');
                let session = number(fields.next().ok_or(ParseError::BadFieldCount)?)?;
                let pos = number(fields.next().ok_or(ParseError::BadFieldCount)?)?;
                let data = unescape(fields.next().ok_or(ParseError::BadFieldCount)?)?;
                Ok(Packet::Data { session, pos, data })
            }
            _ => Err(ParseError::UnknownType),
        }
    }
}

impl Packet {
    /// Wire encoding of the packet. `Data` payloads are escaped.
    #[must_use]
    pub fn encode(&self) -> Vec<u8> {
        match self {
            Packet::Connect { session } => format!("/connect/{session}/").into_bytes(),
            Packet::Ack { session, length } => format!("/ack/{session}/{length}/").into_bytes(),
            Packet::Close { session } => format!("/close/{session}/").into_bytes(),
            Packet::Data { session, pos, data } => {
                let mut raw = format!("/data/{session}/{pos}/").into_bytes();
                raw.extend_from_slice(&escape(data));
                raw.push(b'/');
                raw
            }
        }
    }
}

fn single_number(rest: &[u8]) -> Result<u32, ParseError> {
    let mut fields = rest.split(|&b| b == b'/');
    let value = number(fields.next().ok_or(ParseError::BadFieldCount)?)?;
    if fields.next().is_some() {
        return Err(ParseError::BadFieldCount);
    }

    Ok(value)
}

fn number_pair(rest: &[u8]) -> Result<(u32, u32), ParseError> {
    let mut fields = rest.split(|&b| b == b'/');
    let first = number(fields.next().ok_or(ParseError::BadFieldCount)?)?;
    let second = number(fields.next().ok_or(ParseError::BadFieldCount)?)?;
    if fields.next().is_some() {
        return Err(ParseError::BadFieldCount);
    }

    Ok((first, second))
}

fn number(field: &[u8]) -> Result<u32, ParseError> {
    if field.is_empty() || !field.iter().all(u8::is_ascii_digit) {
        return Err(ParseError::BadNumber);
    }

    let mut value: u64 = 0;
    for digit in field {
        value = value * 10 + u64::from(digit - b'0');
        if value > MAX_NUMERIC {
            return Err(ParseError::BadNumber);
        }
    }

    #[allow(clippy::cast_possible_truncation)]
    let value = value as u32;

    Ok(value)
}

fn unescape(data: &[u8]) -> Result<Vec<u8>, ParseError> {
    let mut unescaped = Vec::with_capacity(data.len());
    let mut bytes = data.iter();

    while let Some(&byte) = bytes.next() {
        match byte {
            b'\\' => match bytes.next() {
                Some(&escaped @ (b'/' | b'\\')) => unescaped.push(escaped),
                _ => return Err(ParseError::BadEscape),
            },
            b'/' => return Err(ParseError::UnescapedSlash),
            byte => unescaped.push(byte),
        }
    }

    Ok(unescaped)
}

#[must_use]
pub fn escape(data: &[u8]) -> Vec<u8> {
    let mut escaped = Vec::with_capacity(data.len());
    for &byte in data {
        if byte == b'\\' || byte == b'/' {
            escaped.push(b'\\');
        }
        escaped.push(byte);
    }

    escaped
}

/// Splits `payload` into `data` packets whose escaped payloads stay
/// within [`MAX_DATA`], starting at stream position `start`. Positions
/// count unescaped bytes.
#[must_use]
pub fn data_packets(session: u32, start: usize, payload: &[u8]) -> Vec<Vec<u8>> {
    let mut packets = vec![];

    let mut pos = start;
    let mut chunk_start = 0;
    let mut escaped_len = 0;
    for (i, &byte) in payload.iter().enumerate() {
        let byte_len = if byte == b'\\' || byte == b'/' { 2 } else { 1 };

        if escaped_len + byte_len > MAX_DATA {
            let chunk = &payload[chunk_start..i];
            packets.push(encode_data(session, pos, chunk));
            pos += chunk.len();
            chunk_start = i;
            escaped_len = 0;
        }

        escaped_len += byte_len;
    }

    if chunk_start < payload.len() {
        packets.push(encode_data(session, pos, &payload[chunk_start..]));
    }

    packets
}

fn encode_data(session: u32, pos: usize, chunk: &[u8]) -> Vec<u8> {
    let mut raw = format!("/data/{session}/{pos}/").into_bytes();
    raw.extend_from_slice(&escape(chunk));
    raw.push(b'/');
    raw
}
