//! Unusual database program: a key-value store over UDP datagrams.
//!
//! A datagram containing `=` is an insert: everything before the first
//! `=` is the key, everything after is the value, and inserts get no
//! reply. Any other datagram is a retrieve and is answered with
//! `key=value` (empty value for unknown keys). The `version` key is
//! pre-populated and immutable.

use std::collections::HashMap;

use tokio::net::UdpSocket;

use tracing::{debug, warn};

const VERSION: &str = "protoserve udpdb 1.0";

/// Largest reply datagram; anything longer is dropped.
const MAX_DATAGRAM: usize = 1000;

/// Run the datagram loop.
///
/// # Errors
/// * Error when the socket fails.
pub async fn run(socket: UdpSocket) -> Result<(), std::io::Error> {
    let mut store: HashMap<Vec<u8>, Vec<u8>> =
        HashMap::from([(b"version".to_vec(), VERSION.as_bytes().to_vec())]);

    let mut packet = [0; MAX_DATAGRAM];
    loop {
        let (len, addr) = socket.recv_from(&mut packet).await?;
        let packet = &packet[..len];

        if let Some(i) = packet.iter().position(|&b| b == b'=') {
            let (key, value) = (&packet[..i], &packet[i + 1..]);

            if key == b"version" {
                debug!("write to version blocked");
                continue;
            }

            store.insert(key.to_vec(), value.to_vec());
            debug!("insert {}", String::from_utf8_lossy(key));
        } else {
            let value = store.get(packet).map_or(&[] as &[u8], Vec::as_slice);

            let mut response = Vec::with_capacity(packet.len() + 1 + value.len());
            response.extend_from_slice(packet);
            response.push(b'=');
            response.extend_from_slice(value);

            if response.len() >= MAX_DATAGRAM {
                warn!("reply too long, dropped");
                continue;
            }

            socket.send_to(&response, addr).await?;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn spawn_app() -> std::net::SocketAddr {
        let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let addr = socket.local_addr().unwrap();

        tokio::spawn(async move {
            run(socket).await.unwrap();
        });

        addr
    }

    #[tokio::test]
    async fn test_insert_and_retrieve() {
        let addr = spawn_app().await;
        let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();

        client.send_to(b"foo=bar", addr).await.unwrap();
        client.send_to(b"foo", addr).await.unwrap();

        let mut buffer = [0; 1000];
        let (len, _) = client.recv_from(&mut buffer).await.unwrap();
        assert_eq!(b"foo=bar", &buffer[..len]);

        // The value may itself contain '='.
        client.send_to(b"foo=bar=baz", addr).await.unwrap();
        client.send_to(b"foo", addr).await.unwrap();

        let (len, _) = client.recv_from(&mut buffer).await.unwrap();
        assert_eq!(b"foo=bar=baz", &buffer[..len]);
    }

    #[tokio::test]
    async fn test_version_immutable() {
        let addr = spawn_app().await;
        let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();

        client.send_to(b"version=hacked", addr).await.unwrap();
        client.send_to(b"version", addr).await.unwrap();

        let mut buffer = [0; 1000];
        let (len, _) = client.recv_from(&mut buffer).await.unwrap();
        assert_eq!(format!("version={VERSION}").as_bytes(), &buffer[..len]);
    }
}
