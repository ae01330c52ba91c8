//! PROXY protocol v1/v2 header stripping.
//!
//! Accepted sockets may arrive through a load balancer that prepends a
//! PROXY protocol header carrying the original client address. The
//! header is detected with [`TcpStream::peek`] and consumed exactly, so
//! the protocol engine sees the stream from its first real byte.

use std::net::{IpAddr, SocketAddr};

use tokio::io::AsyncReadExt;
use tokio::net::TcpStream;
use tokio::time::{timeout, Duration};

use crate::Error;

const V2_SIGNATURE: [u8; 12] = [
    0x0d, 0x0a, 0x0d, 0x0a, 0x00, 0x0d, 0x0a, 0x51, 0x55, 0x49, 0x54, 0x0a,
];

/// Longest permitted v1 header line, per the haproxy specification.
const V1_MAX: usize = 107;

/// A proxy sends its header immediately on connect; a plain client of
/// a server-talks-first protocol may legitimately send nothing at all,
/// so detection cannot wait forever.
const DETECT_WINDOW: Duration = Duration::from_millis(100);

/// Returns the client address for an accepted socket, honoring a PROXY
/// protocol header when one is present. Detection peeks at the first
/// bytes for at most [`DETECT_WINDOW`]; a silent client is treated as
/// unproxied.
///
/// # Errors
/// * [`Error::MalformedProxyHeader`] when a detected header does not parse.
/// * [`Error::Io`] when the socket fails.
pub async fn client_addr(socket: &mut TcpStream) -> Result<SocketAddr, Error> {
    let peer = socket.peer_addr()?;

    let mut head = [0_u8; 12];
    let n = match timeout(DETECT_WINDOW, socket.peek(&mut head)).await {
        Ok(peeked) => peeked?,
        Err(_silent) => return Ok(peer),
    };

    if n >= 6 && &head[..6] == b"PROXY " {
        return read_v1(socket, peer).await;
    }

    if n >= 12 && head == V2_SIGNATURE {
        return read_v2(socket, peer).await;
    }

    Ok(peer)
}

async fn read_v1(socket: &mut TcpStream, peer: SocketAddr) -> Result<SocketAddr, Error> {
    let mut line = Vec::with_capacity(V1_MAX);
    loop {
        let byte = socket.read_u8().await?;
        if byte == b'\n' {
            break;
        }

        line.push(byte);
        if line.len() > V1_MAX {
            return Err(Error::MalformedProxyHeader);
        }
    }

    if line.last() == Some(&b'\r') {
        line.pop();
    }

    let line = String::from_utf8(line).map_err(|_| Error::MalformedProxyHeader)?;
    let mut fields = line.split_ascii_whitespace();

    // "PROXY" was matched by the caller; the transport follows.
    fields.next();
    match fields.next() {
        Some("TCP4" | "TCP6") => {}
        Some("UNKNOWN") => return Ok(peer),
        _ => return Err(Error::MalformedProxyHeader),
    }

    let source_ip: IpAddr = fields
        .next()
        .and_then(|f| f.parse().ok())
        .ok_or(Error::MalformedProxyHeader)?;
    // Destination address is not interesting, but must be present.
    fields.next().ok_or(Error::MalformedProxyHeader)?;
    let source_port: u16 = fields
        .next()
        .and_then(|f| f.parse().ok())
        .ok_or(Error::MalformedProxyHeader)?;

    Ok(SocketAddr::new(source_ip, source_port))
}

async fn read_v2(socket: &mut TcpStream, peer: SocketAddr) -> Result<SocketAddr, Error> {
    let mut header = [0_u8; 16];
    socket.read_exact(&mut header).await?;

    let command = header[12] & 0x0f;
    let family = header[13] >> 4;
    let length = usize::from(u16::from_be_bytes([header[14], header[15]]));

    let mut payload = vec![0; length];
    socket.read_exact(&mut payload).await?;

    // LOCAL command, or an address family we do not carry: keep the
    // socket peer.
    if command != 0x01 {
        return Ok(peer);
    }

    match family {
        0x01 if length >= 12 => {
            let source_ip: [u8; 4] = payload[0..4]
                .try_into()
                .map_err(|_| Error::MalformedProxyHeader)?;
            let source_port = u16::from_be_bytes([payload[8], payload[9]]);
            Ok(SocketAddr::new(IpAddr::from(source_ip), source_port))
        }
        0x02 if length >= 36 => {
            let source_ip: [u8; 16] = payload[0..16]
                .try_into()
                .map_err(|_| Error::MalformedProxyHeader)?;
            let source_port = u16::from_be_bytes([payload[32], payload[33]]);
            Ok(SocketAddr::new(IpAddr::from(source_ip), source_port))
        }
        _ => Ok(peer),
    }
}
