//! The obfuscation cipher negotiated on the wire.
//!
//! A cipher spec is a byte sequence terminated by `0x00`: `0x01`
//! reversebits, `0x02 N` xor N, `0x03` xor with the stream position,
//! `0x04 N` add N mod 256, `0x05` add the stream position mod 256.
//! The operand after `0x02`/`0x04` is a literal, so a zero there does
//! not end the spec.
//!
//! Positions are absolute byte indices within one direction of the
//! stream, starting at 0 and never resetting.

use tokio::io::{AsyncRead, AsyncReadExt};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Op {
    ReverseBits,
    Xor(u8),
    XorPos,
    Add(u8),
    AddPos,
}

#[derive(Debug, thiserror::Error)]
pub enum SpecError {
    #[error("unknown cipher op 0x{0:02x}")]
    UnknownOp(u8),

    #[error("missing operand at end of spec")]
    MissingOperand,

    #[error("cipher spec is a no-op")]
    Identity,

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl PartialEq for SpecError {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Self::UnknownOp(a), Self::UnknownOp(b)) => a == b,
            (Self::MissingOperand, Self::MissingOperand) => true,
            (Self::Identity, Self::Identity) => true,
            (Self::Io(a), Self::Io(b)) => a.kind() == b.kind(),
            _ => false,
        }
    }
}

impl Eq for SpecError {}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Spec(Vec<Op>);

impl Spec {
    /// Parses a complete spec (without the trailing `0x00`).
    ///
    /// # Errors
    /// * [`SpecError::UnknownOp`] / [`SpecError::MissingOperand`] on a
    ///   malformed spec.
    pub fn parse(raw: &[u8]) -> Result<Self, SpecError> {
        let mut ops = vec![];
        let mut bytes = raw.iter();

        while let Some(&op) = bytes.next() {
            ops.push(match op {
                0x01 => Op::ReverseBits,
                0x02 => Op::Xor(*bytes.next().ok_or(SpecError::MissingOperand)?),
                0x03 => Op::XorPos,
                0x04 => Op::Add(*bytes.next().ok_or(SpecError::MissingOperand)?),
                0x05 => Op::AddPos,
                op => return Err(SpecError::UnknownOp(op)),
            });
        }

        Ok(Self(ops))
    }

    /// Reads a `0x00`-terminated spec off a stream. The byte after
    /// `0x02`/`0x04` is consumed as an operand even when it is zero.
    ///
    /// # Errors
    /// * [`SpecError::UnknownOp`] on a malformed spec.
    /// * [`SpecError::Io`] when the stream fails or ends early.
    pub async fn read_from<R>(read: &mut R) -> Result<Self, SpecError>
    where
        R: AsyncRead + Unpin,
    {
        let mut ops = vec![];

        loop {
            let op = match read.read_u8().await? {
                0x00 => return Ok(Self(ops)),
                0x01 => Op::ReverseBits,
                0x02 => Op::Xor(read.read_u8().await?),
                0x03 => Op::XorPos,
                0x04 => Op::Add(read.read_u8().await?),
                0x05 => Op::AddPos,
                op => return Err(SpecError::UnknownOp(op)),
            };

            ops.push(op);
        }
    }

    #[must_use]
    pub fn encode_byte(&self, byte: u8, pos: u64) -> u8 {
        let mut byte = byte;
        for op in &self.0 {
            byte = op.apply(byte, pos);
        }

        byte
    }

    #[must_use]
    pub fn decode_byte(&self, byte: u8, pos: u64) -> u8 {
        let mut byte = byte;
        for op in self.0.iter().rev() {
            byte = op.invert(byte, pos);
        }

        byte
    }

    /// Rejects specs whose net effect leaves the test string
    /// unchanged (`xor 0`, paired self-inverses, and friends).
    ///
    /// # Errors
    /// * [`SpecError::Identity`] when the spec obfuscates nothing.
    pub fn reject_identity(&self) -> Result<(), SpecError> {
        const TEST: &[u8] = b"abcdefghijklmnopqrstuvwxyzABCDEFGHIJKLMNOPQRSTUVWXYZ0123456789";

        let changed = TEST
            .iter()
            .enumerate()
            .any(|(pos, &byte)| self.encode_byte(byte, pos as u64) != byte);

        if changed {
            Ok(())
        } else {
            Err(SpecError::Identity)
        }
    }
}

impl Op {
    fn apply(self, byte: u8, pos: u64) -> u8 {
        #[allow(clippy::cast_possible_truncation)]
        let pos = (pos % 256) as u8;

        match self {
            Op::ReverseBits => byte.reverse_bits(),
            Op::Xor(n) => byte ^ n,
            Op::XorPos => byte ^ pos,
            Op::Add(n) => byte.wrapping_add(n),
            Op::AddPos => byte.wrapping_add(pos),
        }
    }

    fn invert(self, byte: u8, pos: u64) -> u8 {
        #[allow(clippy::cast_possible_truncation)]
        let pos = (pos % 256) as u8;

        match self {
            // Bit reversal and xor are their own inverses.
            Op::ReverseBits => byte.reverse_bits(),
            Op::Xor(n) => byte ^ n,
            Op::XorPos => byte ^ pos,
            Op::Add(n) => byte.wrapping_sub(n),
            Op::AddPos => byte.wrapping_sub(pos),
        }
    }
}
