//! Big-endian wire primitives.
//!
//! [`Parser`] and [`Writer`] work over byte slices for protocols that
//! assemble whole packets before decoding (pest control). The free
//! async functions read and write the `u8`-length-prefixed ASCII
//! strings used by the speed daemon directly on a stream.

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::Error;

pub struct Parser<'a> {
    data: &'a [u8],
}

impl<'a> Parser<'a> {
    #[must_use]
    pub fn new(data: &'a [u8]) -> Self {
        Self { data }
    }

    /// # Errors
    /// * [`Error::UnexpectedEof`] when the buffer is short.
    pub fn read_u8(&mut self) -> Result<u8, Error> {
        let (value, rest) = self.data.split_first().ok_or(Error::UnexpectedEof)?;
        self.data = rest;
        Ok(*value)
    }

    /// # Errors
    /// * [`Error::UnexpectedEof`] when the buffer is short.
    pub fn read_u16(&mut self) -> Result<u16, Error> {
        Ok(u16::from_be_bytes(self.read_array()?))
    }

    /// # Errors
    /// * [`Error::UnexpectedEof`] when the buffer is short.
    pub fn read_u32(&mut self) -> Result<u32, Error> {
        Ok(u32::from_be_bytes(self.read_array()?))
    }

    /// String encoded as `u32` length followed by that many bytes.
    ///
    /// # Errors
    /// * [`Error::UnexpectedEof`] when the buffer is short.
    pub fn read_str32(&mut self) -> Result<&'a [u8], Error> {
        let length = usize::try_from(self.read_u32()?).unwrap_or(usize::MAX);
        self.read_slice(length)
    }

    /// String encoded as `u8` length followed by that many bytes.
    ///
    /// # Errors
    /// * [`Error::UnexpectedEof`] when the buffer is short.
    pub fn read_str8(&mut self) -> Result<&'a [u8], Error> {
        let length = usize::from(self.read_u8()?);
        self.read_slice(length)
    }

    #[must_use]
    pub fn remaining(&self) -> usize {
        self.data.len()
    }

    fn read_slice(&mut self, length: usize) -> Result<&'a [u8], Error> {
        if self.data.len() < length {
            return Err(Error::UnexpectedEof);
        }

        let (value, rest) = self.data.split_at(length);
        self.data = rest;
        Ok(value)
    }

    fn read_array<const N: usize>(&mut self) -> Result<[u8; N], Error> {
        let mut array = [0; N];
        array.copy_from_slice(self.read_slice(N)?);
        Ok(array)
    }
}

#[derive(Default)]
pub struct Writer {
    buffer: Vec<u8>,
}

impl Writer {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn write_u8(&mut self, value: u8) {
        self.buffer.push(value);
    }

    pub fn write_u16(&mut self, value: u16) {
        self.buffer.extend_from_slice(&value.to_be_bytes());
    }

    pub fn write_u32(&mut self, value: u32) {
        self.buffer.extend_from_slice(&value.to_be_bytes());
    }

    /// # Errors
    /// * [`Error::StringTooLong`] when the string exceeds `u32::MAX` bytes.
    pub fn write_str32(&mut self, value: &[u8]) -> Result<(), Error> {
        let length = u32::try_from(value.len()).map_err(|_| Error::StringTooLong)?;
        self.write_u32(length);
        self.buffer.extend_from_slice(value);
        Ok(())
    }

    /// # Errors
    /// * [`Error::StringTooLong`] when the string exceeds 255 bytes.
    pub fn write_str8(&mut self, value: &[u8]) -> Result<(), Error> {
        let length = u8::try_from(value.len()).map_err(|_| Error::StringTooLong)?;
        self.write_u8(length);
        self.buffer.extend_from_slice(value);
        Ok(())
    }

    #[must_use]
    pub fn into_inner(self) -> Vec<u8> {
        self.buffer
    }
}

/// Reads a `u8`-length-prefixed ASCII string off a stream.
///
/// # Errors
/// * [`Error::Io`] when the stream fails or ends early.
pub async fn read_str8<R>(read: &mut R) -> Result<String, Error>
where
    R: AsyncRead + Unpin,
{
    let length = read.read_u8().await?;
    let mut buffer = vec![0; usize::from(length)];
    read.read_exact(&mut buffer).await?;

    Ok(String::from_utf8_lossy(&buffer).into_owned())
}

/// Writes a `u8`-length-prefixed ASCII string to a stream.
///
/// # Errors
/// * [`Error::StringTooLong`] when the string exceeds 255 bytes.
/// * [`Error::Io`] when the stream fails.
pub async fn write_str8<W>(write: &mut W, value: &str) -> Result<(), Error>
where
    W: AsyncWrite + Unpin,
{
    let length = u8::try_from(value.len()).map_err(|_| Error::StringTooLong)?;
    write.write_u8(length).await?;
    write.write_all(value.as_bytes()).await?;

    Ok(())
}
