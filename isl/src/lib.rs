//! Insecure sockets layer: a TCP service behind a client-chosen
//! stream cipher.
//!
//! The first bytes of a connection, up to and including the first
//! bare `0x00`, are the cipher spec (see [`cipher`]). Everything after
//! travels obfuscated: the client encodes with its spec, the server
//! decodes inbound bytes and encodes outbound bytes, each direction
//! keeping its own absolute position counter.
//!
//! Specs whose net effect leaves data unchanged defeat the purpose
//! and get the connection dropped before any application byte flows.
//!
//! The application underneath is Santa's toy prioritisation: each
//! decrypted line is a comma-separated list of `Nx toy name` requests,
//! and the reply is the single entry with the largest `N`, newline
//! terminated.

use bytes::{BufMut, BytesMut};
use futures::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio_util::codec::{Decoder, Encoder, Framed};

use tracing::{debug, warn};

pub mod cipher;

use cipher::Spec;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("malformed toy request")]
    MalformedRequest,

    #[error(transparent)]
    Spec(#[from] cipher::SpecError),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Decodes decrypted lines off the wire and encrypts replies, keeping
/// the two position counters.
pub struct CipherCodec {
    spec: Spec,
    in_pos: u64,
    out_pos: u64,
    /// How much of the read buffer is already decrypted.
    decrypted: usize,
}

impl CipherCodec {
    #[must_use]
    pub fn new(spec: Spec) -> Self {
        Self {
            spec,
            in_pos: 0,
            out_pos: 0,
            decrypted: 0,
        }
    }
}

impl Decoder for CipherCodec {
    type Item = String;
    type Error = Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        for byte in &mut src[self.decrypted..] {
            *byte = self.spec.decode_byte(*byte, self.in_pos);
            self.in_pos += 1;
        }
        self.decrypted = src.len();

        let Some(i) = src.iter().position(|&b| b == b'\n') else {
            return Ok(None);
        };

        let line = src.split_to(i + 1);
        self.decrypted -= i + 1;

        Ok(Some(
            String::from_utf8_lossy(&line[..line.len() - 1]).into_owned(),
        ))
    }
}

impl Encoder<String> for CipherCodec {
    type Error = Error;

    fn encode(&mut self, line: String, dst: &mut BytesMut) -> Result<(), Self::Error> {
        dst.reserve(line.len() + 1);
        for &byte in line.as_bytes().iter().chain(std::iter::once(&b'\n')) {
            dst.put_u8(self.spec.encode_byte(byte, self.out_pos));
            self.out_pos += 1;
        }

        Ok(())
    }
}

/// The entry with the largest count wins; the first occurrence wins
/// ties. A count that does not parse makes the whole line invalid.
fn max_toy(line: &str) -> Result<&str, Error> {
    let mut best: Option<(u64, &str)> = None;

    for entry in line.split(',') {
        let (count, _) = entry.split_once("x ").ok_or(Error::MalformedRequest)?;
        let count: u64 = count.parse().map_err(|_| Error::MalformedRequest)?;

        if best.map_or(true, |(max, _)| count > max) {
            best = Some((count, entry));
        }
    }

    best.map(|(_, entry)| entry).ok_or(Error::MalformedRequest)
}

#[tracing::instrument(skip(socket))]
pub async fn handle_client(mut socket: TcpStream) {
    let session = async {
        let spec = Spec::read_from(&mut socket).await?;
        spec.reject_identity()?;
        debug!("negotiated cipher spec {spec:?}");

        let mut framed = Framed::new(socket, CipherCodec::new(spec));
        while let Some(line) = framed.next().await {
            let line = line?;
            let reply = max_toy(&line)?.to_string();
            debug!("{line} -> {reply}");
            framed.send(reply).await?;
        }

        Ok::<_, Error>(())
    };

    if let Err(err) = session.await {
        warn!("session ended: {err}");
    }
}

#[cfg(test)]
mod tests {
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::{TcpListener, TcpStream};

    use super::*;

    #[test]
    fn test_max_toy() {
        assert_eq!(
            "15x dog on a string",
            max_toy("10x toy car,15x dog on a string,4x inflatable motorcycle").unwrap()
        );
        // First occurrence wins the tie.
        assert_eq!("5x car", max_toy("5x car,5x van").unwrap());
        assert!(max_toy("no count here").is_err());
        assert!(max_toy("").is_err());
    }

    async fn spawn_app() -> std::net::SocketAddr {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        tokio::spawn(async move {
            loop {
                let (socket, _) = listener.accept().await.unwrap();
                tokio::spawn(handle_client(socket));
            }
        });

        addr
    }

    #[tokio::test]
    async fn test_encrypted_session() {
        let addr = spawn_app().await;
        let mut client = TcpStream::connect(addr).await.unwrap();

        // xor(123), addpos, reversebits.
        client.write_all(&[0x02, 0x7b, 0x05, 0x01, 0x00]).await.unwrap();

        // "4x dog,5x car\n" encrypted at position 0.
        client
            .write_all(&[
                0xf2, 0x20, 0xba, 0x44, 0x18, 0x84, 0xba, 0xaa, 0xd0, 0x26, 0x44, 0xa4, 0xa8,
                0x7e,
            ])
            .await
            .unwrap();

        // "5x car\n" encrypted at position 0 of the server's stream.
        let spec = Spec::parse(&[0x02, 0x7b, 0x05, 0x01]).unwrap();
        let expected: Vec<u8> = b"5x car\n"
            .iter()
            .enumerate()
            .map(|(i, &b)| spec.encode_byte(b, i as u64))
            .collect();

        let mut response = vec![0; expected.len()];
        client.read_exact(&mut response).await.unwrap();
        assert_eq!(expected, response);
    }

    #[tokio::test]
    async fn test_identity_spec_is_disconnected() {
        let addr = spawn_app().await;
        let mut client = TcpStream::connect(addr).await.unwrap();

        // xor(1) twice: a no-op in disguise.
        client
            .write_all(&[0x02, 0x01, 0x02, 0x01, 0x00])
            .await
            .unwrap();

        let mut buffer = vec![];
        client.read_to_end(&mut buffer).await.unwrap();
        assert!(buffer.is_empty());
    }
}
