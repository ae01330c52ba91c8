//! Buffered token reader over an [`AsyncRead`] source.
//!
//! Unlike a plain buffered line reader, the lookahead buffer is shared
//! between [`Scanner::line`] and [`Scanner::exact`]: a protocol can read
//! an ASCII command line and then pull a raw binary payload off the same
//! stream, even when the payload's first bytes were already buffered
//! while hunting for the newline.

use bytes::{Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt};

use crate::Error;

/// Largest line accepted before the stream fails with
/// [`Error::TokenTooLong`].
pub const MAX_TOKEN_SIZE: usize = 64 * 1024;

const READ_CHUNK: usize = 4096;

pub struct Scanner<R> {
    source: R,
    buffer: BytesMut,
    scanned: usize,
    eof: bool,
}

impl<R> Scanner<R>
where
    R: AsyncRead + Unpin,
{
    pub fn new(source: R) -> Self {
        Self {
            source,
            buffer: BytesMut::with_capacity(READ_CHUNK),
            scanned: 0,
            eof: false,
        }
    }

    /// Next `\n`-delimited token, with the delimiter and at most one
    /// trailing `\r` stripped. At EOF a final non-terminated token is
    /// returned as-is; after that, `None`.
    ///
    /// # Errors
    /// * [`Error::TokenTooLong`] when a line exceeds [`MAX_TOKEN_SIZE`].
    /// * [`Error::Io`] when the source fails.
    pub async fn line(&mut self) -> Result<Option<Bytes>, Error> {
        loop {
            if let Some(i) = self.buffer[self.scanned..]
                .iter()
                .position(|&b| b == b'\n')
            {
                let mut token = self.buffer.split_to(self.scanned + i + 1);
                self.scanned = 0;
                token.truncate(token.len() - 1);
                return Ok(Some(drop_cr(token)));
            }

            self.scanned = self.buffer.len();

            if self.scanned > MAX_TOKEN_SIZE {
                return Err(Error::TokenTooLong);
            }

            if self.eof {
                if self.buffer.is_empty() {
                    return Ok(None);
                }

                let token = self.buffer.split_to(self.buffer.len());
                self.scanned = 0;
                return Ok(Some(drop_cr(token)));
            }

            self.fill().await?;
        }
    }

    /// Exactly `n` bytes, consuming the line lookahead first and then
    /// the source.
    ///
    /// # Errors
    /// * [`Error::UnexpectedEof`] when the source ends early.
    /// * [`Error::Io`] when the source fails.
    pub async fn exact(&mut self, n: usize) -> Result<Bytes, Error> {
        while self.buffer.len() < n {
            if self.eof {
                return Err(Error::UnexpectedEof);
            }

            self.fill().await?;
        }

        self.scanned = 0;
        Ok(self.buffer.split_to(n).freeze())
    }

    async fn fill(&mut self) -> Result<(), Error> {
        self.buffer.reserve(READ_CHUNK);
        if self.source.read_buf(&mut self.buffer).await? == 0 {
            self.eof = true;
        }

        Ok(())
    }
}

fn drop_cr(mut token: BytesMut) -> Bytes {
    if token.last() == Some(&b'\r') {
        token.truncate(token.len() - 1);
    }

    token.freeze()
}
