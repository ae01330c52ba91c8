//! Wire format of the speed daemon protocol.
//!
//! Every message starts with a single type byte. Multi-byte integers
//! are big-endian; strings are a `u8` length followed by that many
//! ASCII bytes. There is no message delimiter: messages are simply
//! concatenated.

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use netframe::wire::{read_str8, write_str8};

/// Server -> client: the client broke the protocol; the connection is
/// closed right after this message.
#[derive(Debug, PartialEq, Eq)]
pub struct Error {
    pub msg: String,
}

/// Client -> server (cameras only): a plate observation.
#[derive(Debug, PartialEq, Eq)]
pub struct Plate {
    pub plate: String,
    pub timestamp: u32,
}

/// Server -> client (dispatchers only).
#[derive(Debug, PartialEq, Eq, Clone)]
pub struct Ticket {
    pub plate: String,
    pub road: u16,
    pub mile1: u16,
    pub timestamp1: u32,
    pub mile2: u16,
    pub timestamp2: u32,
    /// Average speed in hundredths of a mile per hour.
    pub speed: u16,
}

/// Client -> server: request a heartbeat every `interval` deciseconds;
/// zero means no heartbeat.
#[derive(Debug, PartialEq, Eq)]
pub struct WantHeartbeat {
    pub interval: u32,
}

/// Server -> client, at the requested interval.
#[derive(Debug, PartialEq, Eq)]
pub struct Heartbeat;

/// Client -> server: this connection is a camera.
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub struct IAmCamera {
    pub road: u16,
    pub mile: u16,
    pub limit: u16,
}

/// Client -> server: this connection dispatches tickets for `roads`.
#[derive(Debug, PartialEq, Eq)]
pub struct IAmDispatcher {
    pub roads: Vec<u16>,
}

impl Error {
    pub const TAG: u8 = 0x10;

    /// # Errors
    /// * Error when the stream fails.
    pub async fn write_to<W>(&self, write: &mut W) -> Result<(), netframe::Error>
    where
        W: AsyncWrite + Unpin,
    {
        write.write_u8(Self::TAG).await?;
        write_str8(write, &self.msg).await
    }
}

impl Plate {
    pub const TAG: u8 = 0x20;

    /// # Errors
    /// * Error when the stream fails or ends early.
    pub async fn read_payload_from<R>(read: &mut R) -> Result<Self, netframe::Error>
    where
        R: AsyncRead + Unpin,
    {
        Ok(Self {
            plate: read_str8(read).await?,
            timestamp: read.read_u32().await?,
        })
    }
}

impl Ticket {
    pub const TAG: u8 = 0x21;

    /// # Errors
    /// * Error when the stream fails.
    pub async fn write_to<W>(&self, write: &mut W) -> Result<(), netframe::Error>
    where
        W: AsyncWrite + Unpin,
    {
        write.write_u8(Self::TAG).await?;
        write_str8(write, &self.plate).await?;
        write.write_u16(self.road).await?;
        write.write_u16(self.mile1).await?;
        write.write_u32(self.timestamp1).await?;
        write.write_u16(self.mile2).await?;
        write.write_u32(self.timestamp2).await?;
        write.write_u16(self.speed).await?;

        Ok(())
    }
}

impl WantHeartbeat {
    pub const TAG: u8 = 0x40;

    /// # Errors
    /// * Error when the stream fails or ends early.
    pub async fn read_payload_from<R>(read: &mut R) -> Result<Self, netframe::Error>
    where
        R: AsyncRead + Unpin,
    {
        Ok(Self {
            interval: read.read_u32().await?,
        })
    }
}

impl Heartbeat {
    pub const TAG: u8 = 0x41;

    /// # Errors
    /// * Error when the stream fails.
    pub async fn write_to<W>(&self, write: &mut W) -> Result<(), netframe::Error>
    where
        W: AsyncWrite + Unpin,
    {
        write.write_u8(Self::TAG).await?;

        Ok(())
    }
}

impl IAmCamera {
    pub const TAG: u8 = 0x80;

    /// # Errors
    /// * Error when the stream fails or ends early.
    pub async fn read_payload_from<R>(read: &mut R) -> Result<Self, netframe::Error>
    where
        R: AsyncRead + Unpin,
    {
        Ok(Self {
            road: read.read_u16().await?,
            mile: read.read_u16().await?,
            limit: read.read_u16().await?,
        })
    }
}

impl IAmDispatcher {
    pub const TAG: u8 = 0x81;

    /// # Errors
    /// * Error when the stream fails or ends early.
    pub async fn read_payload_from<R>(read: &mut R) -> Result<Self, netframe::Error>
    where
        R: AsyncRead + Unpin,
    {
        let numroads = read.read_u8().await?;
        let mut roads = Vec::with_capacity(usize::from(numroads));
        for _ in 0..numroads {
            roads.push(read.read_u16().await?);
        }

        Ok(Self { roads })
    }
}
