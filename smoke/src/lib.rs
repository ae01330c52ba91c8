//! Smoke test: a TCP echo service.
//!
//! Every byte received is written back unchanged, any number of
//! connections at a time, until the client closes its half of the
//! stream.

use tokio::net::TcpStream;

use tracing::debug;

#[tracing::instrument(skip(socket))]
pub async fn echo(mut socket: TcpStream) {
    let (mut read, mut write) = socket.split();

    match tokio::io::copy(&mut read, &mut write).await {
        Ok(bytes) => debug!("echoed {bytes} bytes"),
        Err(err) => debug!("echo ended: {err}"),
    }
}
