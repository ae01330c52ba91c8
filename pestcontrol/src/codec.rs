//! The pest control packet layer.
//!
//! Every message is `{type: u8, length: u32-BE, payload, checksum:
//! u8}` where `length` covers the whole message including the header
//! and checksum, and the checksum byte makes the sum of all message
//! bytes come out to 0 modulo 256. Strings inside payloads are
//! `u32`-length-prefixed.

use bytes::{Buf, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use tracing::instrument;

use netframe::wire::{Parser, Writer};

/// Header (type + length) plus checksum.
const ENVELOPE: usize = 6;

/// Anything claiming to be bigger than this is garbage.
const MAX_MESSAGE: usize = 1_000_000;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("unknown packet type 0x{0:02x}")]
    UnknownPacket(u8),

    #[error("bad checksum")]
    BadChecksum,

    #[error("implausible message length {0}")]
    BadLength(u32),

    #[error("message has {0} unused bytes")]
    TrailingBytes(usize),

    #[error("malformed payload")]
    Malformed(#[from] netframe::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    Cull,
    Conserve,
}

impl Action {
    const CULL: u8 = 0x90;
    const CONSERVE: u8 = 0xa0;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Target {
    pub species: String,
    pub min: u32,
    pub max: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Observation {
    pub species: String,
    pub count: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Packet {
    Hello {
        protocol: String,
        version: u32,
    },
    Error {
        message: String,
    },
    Ok,
    DialAuthority {
        site: u32,
    },
    TargetPopulations {
        site: u32,
        populations: Vec<Target>,
    },
    CreatePolicy {
        species: String,
        action: Action,
    },
    DeletePolicy {
        policy: u32,
    },
    PolicyResult {
        policy: u32,
    },
    SiteVisit {
        site: u32,
        populations: Vec<Observation>,
    },
}

impl Packet {
    #[must_use]
    pub fn hello() -> Self {
        Packet::Hello {
            protocol: "pestcontrol".to_string(),
            version: 1,
        }
    }

    fn tag(&self) -> u8 {
        match self {
            Packet::Hello { .. } => 0x50,
            Packet::Error { .. } => 0x51,
            Packet::Ok => 0x52,
            Packet::DialAuthority { .. } => 0x53,
            Packet::TargetPopulations { .. } => 0x54,
            Packet::CreatePolicy { .. } => 0x55,
            Packet::DeletePolicy { .. } => 0x56,
            Packet::PolicyResult { .. } => 0x57,
            Packet::SiteVisit { .. } => 0x58,
        }
    }
}

#[derive(Debug, Default)]
pub struct PacketCodec;

impl PacketCodec {
    #[must_use]
    pub fn new() -> Self {
        Self
    }
}

impl Decoder for PacketCodec {
    type Item = Packet;
    type Error = Error;

    #[instrument(skip_all)]
    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if src.len() < 5 {
            return Ok(None);
        }

        let tag = src[0];
        let length = u32::from_be_bytes([src[1], src[2], src[3], src[4]]);
        let total = usize::try_from(length).unwrap_or(usize::MAX);
        if total < ENVELOPE || total > MAX_MESSAGE {
            return Err(Error::BadLength(length));
        }

        if src.len() < total {
            src.reserve(total - src.len());
            return Ok(None);
        }

        let message = src.copy_to_bytes(total);
        if message.iter().fold(0_u8, |sum, &b| sum.wrapping_add(b)) != 0 {
            return Err(Error::BadChecksum);
        }

        let payload = &message[5..total - 1];
        let mut parser = Parser::new(payload);

        let packet = match tag {
            0x50 => Packet::Hello {
                protocol: read_string(&mut parser)?,
                version: parser.read_u32()?,
            },
            0x51 => Packet::Error {
                message: read_string(&mut parser)?,
            },
            0x52 => Packet::Ok,
            0x53 => Packet::DialAuthority {
                site: parser.read_u32()?,
            },
            0x54 => {
                let site = parser.read_u32()?;
                let count = parser.read_u32()?;
                let mut populations = vec![];
                for _ in 0..count {
                    populations.push(Target {
                        species: read_string(&mut parser)?,
                        min: parser.read_u32()?,
                        max: parser.read_u32()?,
                    });
                }
                Packet::TargetPopulations { site, populations }
            }
            0x55 => Packet::CreatePolicy {
                species: read_string(&mut parser)?,
                action: match parser.read_u8()? {
                    Action::CULL => Action::Cull,
                    Action::CONSERVE => Action::Conserve,
                    action => return Err(Error::UnknownPacket(action)),
                },
            },
            0x56 => Packet::DeletePolicy {
                policy: parser.read_u32()?,
            },
            0x57 => Packet::PolicyResult {
                policy: parser.read_u32()?,
            },
            0x58 => {
                let site = parser.read_u32()?;
                let count = parser.read_u32()?;
                let mut populations = vec![];
                for _ in 0..count {
                    populations.push(Observation {
                        species: read_string(&mut parser)?,
                        count: parser.read_u32()?,
                    });
                }
                Packet::SiteVisit { site, populations }
            }
            tag => return Err(Error::UnknownPacket(tag)),
        };

        if parser.remaining() > 0 {
            return Err(Error::TrailingBytes(parser.remaining()));
        }

        Ok(Some(packet))
    }
}

impl Encoder<Packet> for PacketCodec {
    type Error = Error;

    fn encode(&mut self, packet: Packet, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let mut writer = Writer::new();

        match &packet {
            Packet::Hello { protocol, version } => {
                writer.write_str32(protocol.as_bytes())?;
                writer.write_u32(*version);
            }
            Packet::Error { message } => {
                writer.write_str32(message.as_bytes())?;
            }
            Packet::Ok => {}
            Packet::DialAuthority { site } => {
                writer.write_u32(*site);
            }
            Packet::TargetPopulations { site, populations } => {
                writer.write_u32(*site);
                writer.write_u32(list_len(populations)?);
                for target in populations {
                    writer.write_str32(target.species.as_bytes())?;
                    writer.write_u32(target.min);
                    writer.write_u32(target.max);
                }
            }
            Packet::CreatePolicy { species, action } => {
                writer.write_str32(species.as_bytes())?;
                writer.write_u8(match action {
                    Action::Cull => Action::CULL,
                    Action::Conserve => Action::CONSERVE,
                });
            }
            Packet::DeletePolicy { policy } | Packet::PolicyResult { policy } => {
                writer.write_u32(*policy);
            }
            Packet::SiteVisit { site, populations } => {
                writer.write_u32(*site);
                writer.write_u32(list_len(populations)?);
                for observation in populations {
                    writer.write_str32(observation.species.as_bytes())?;
                    writer.write_u32(observation.count);
                }
            }
        }

        let payload = writer.into_inner();
        let length = u32::try_from(payload.len() + ENVELOPE)
            .map_err(|_| Error::BadLength(u32::MAX))?;

        dst.reserve(payload.len() + ENVELOPE);
        dst.extend_from_slice(&[packet.tag()]);
        dst.extend_from_slice(&length.to_be_bytes());
        dst.extend_from_slice(&payload);

        let sum = dst[dst.len() - payload.len() - 5..]
            .iter()
            .fold(0_u8, |sum, &b| sum.wrapping_add(b));
        dst.extend_from_slice(&[sum.wrapping_neg()]);

        Ok(())
    }
}

fn read_string(parser: &mut Parser<'_>) -> Result<String, Error> {
    Ok(String::from_utf8_lossy(parser.read_str32()?).into_owned())
}

fn list_len<T>(list: &[T]) -> Result<u32, Error> {
    u32::try_from(list.len()).map_err(|_| Error::BadLength(u32::MAX))
}

#[cfg(test)]
mod tests {
    use futures::{SinkExt, TryStreamExt};
    use tokio_util::codec::{FramedRead, FramedWrite};

    use super::*;

    const HELLO: &[u8] = &[
        0x50, 0x00, 0x00, 0x00, 0x19, 0x00, 0x00, 0x00, 0x0b, 0x70, 0x65, 0x73, 0x74, 0x63,
        0x6f, 0x6e, 0x74, 0x72, 0x6f, 0x6c, 0x00, 0x00, 0x00, 0x01, 0xce,
    ];

    #[tokio::test]
    async fn test_read_hello() {
        let mut reader = FramedRead::new(HELLO, PacketCodec::new());

        assert_eq!(
            Packet::hello(),
            reader.try_next().await.unwrap().unwrap()
        );
    }

    #[tokio::test]
    async fn test_write_hello() {
        let mut buffer = vec![];
        {
            let mut writer = FramedWrite::new(&mut buffer, PacketCodec::new());
            writer.send(Packet::hello()).await.unwrap();
        }

        assert_eq!(HELLO, buffer);
    }

    #[tokio::test]
    async fn test_delete_policy_roundtrip() {
        let data = [0x56, 0x00, 0x00, 0x00, 0x0a, 0x00, 0x00, 0x00, 0x7b, 0x25];

        let mut reader = FramedRead::new(data.as_slice(), PacketCodec::new());
        assert_eq!(
            Packet::DeletePolicy { policy: 123 },
            reader.try_next().await.unwrap().unwrap()
        );

        let mut buffer = vec![];
        {
            let mut writer = FramedWrite::new(&mut buffer, PacketCodec::new());
            writer.send(Packet::DeletePolicy { policy: 123 }).await.unwrap();
        }
        assert_eq!(data.as_slice(), buffer);
    }

    #[tokio::test]
    async fn test_bad_checksum() {
        let mut data = HELLO.to_vec();
        *data.last_mut().unwrap() ^= 0xff;

        let mut reader = FramedRead::new(data.as_slice(), PacketCodec::new());
        assert!(matches!(
            reader.try_next().await,
            Err(Error::BadChecksum)
        ));
    }

    #[tokio::test]
    async fn test_trailing_bytes_rejected() {
        // A DeletePolicy padded with one extra payload byte; checksum
        // adjusted to stay valid.
        let mut data = vec![0x56, 0x00, 0x00, 0x00, 0x0b, 0x00, 0x00, 0x00, 0x7b, 0x00];
        let sum: u8 = data.iter().fold(0, |sum, &b| sum.wrapping_add(b));
        data.push(sum.wrapping_neg());

        let mut reader = FramedRead::new(data.as_slice(), PacketCodec::new());
        assert!(matches!(
            reader.try_next().await,
            Err(Error::TrailingBytes(1))
        ));
    }

    #[tokio::test]
    async fn test_site_visit_roundtrip() {
        let packet = Packet::SiteVisit {
            site: 12345,
            populations: vec![
                Observation {
                    species: "long-tailed rat".to_string(),
                    count: 20,
                },
                Observation {
                    species: "dodo".to_string(),
                    count: 0,
                },
            ],
        };

        let mut buffer = vec![];
        {
            let mut writer = FramedWrite::new(&mut buffer, PacketCodec::new());
            writer.send(packet.clone()).await.unwrap();
        }

        let mut reader = FramedRead::new(buffer.as_slice(), PacketCodec::new());
        assert_eq!(packet, reader.try_next().await.unwrap().unwrap());
    }

    #[tokio::test]
    async fn test_unknown_packet() {
        let data = [0x42, 0x00, 0x00, 0x00, 0x06, 0xb8];

        let mut reader = FramedRead::new(data.as_slice(), PacketCodec::new());
        assert!(matches!(
            reader.try_next().await,
            Err(Error::UnknownPacket(0x42))
        ));
    }
}
