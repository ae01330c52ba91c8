//! Graceful accept loop.
//!
//! [`serve`] accepts connections and runs one handler task per socket
//! until the shutdown signal fires; it then stops accepting, drops the
//! listener, and waits for in-flight connections to finish naturally,
//! so a systemd stop can complete before the SIGKILL arrives.

use std::future::Future;
use std::net::SocketAddr;

use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio::task::JoinSet;

use tracing::{debug, warn};

use crate::proxy;

pub struct Shutdown(watch::Sender<bool>);

#[derive(Clone)]
pub struct Signal(watch::Receiver<bool>);

/// Creates a shutdown handle and the signal its accept loops watch.
#[must_use]
pub fn shutdown() -> (Shutdown, Signal) {
    let (sender, receiver) = watch::channel(false);
    (Shutdown(sender), Signal(receiver))
}

impl Shutdown {
    pub fn trigger(&self) {
        self.0.send(true).ok();
    }
}

impl Signal {
    pub async fn triggered(&mut self) {
        while !*self.0.borrow() {
            if self.0.changed().await.is_err() {
                // The shutdown handle is gone; run until killed.
                std::future::pending::<()>().await;
            }
        }
    }
}

/// Accepts connections until `signal` fires, handing each handler the
/// socket and the client address (original address when the connection
/// carries a PROXY protocol header), then drains in-flight handlers.
///
/// # Errors
/// * Error when the listener fails.
pub async fn serve<H, F>(
    listener: TcpListener,
    mut signal: Signal,
    handler: H,
) -> Result<(), std::io::Error>
where
    H: Fn(TcpStream, SocketAddr) -> F + Clone + Send + 'static,
    F: Future<Output = ()> + Send + 'static,
{
    let mut connections = JoinSet::new();

    loop {
        tokio::select! {
            accepted = listener.accept() => {
                let (socket, peer) = accepted?;
                let handler = handler.clone();

                connections.spawn(async move {
                    let mut socket = socket;
                    let addr = match proxy::client_addr(&mut socket).await {
                        Ok(addr) => addr,
                        Err(err) => {
                            warn!("dropping connection from {peer}: {err}");
                            return;
                        }
                    };

                    debug!("connection from {addr}");
                    handler(socket, addr).await;
                    debug!("connection from {addr} finished");
                });
            }

            Some(_) = connections.join_next(), if !connections.is_empty() => {}

            () = signal.triggered() => break,
        }
    }

    drop(listener);
    while connections.join_next().await.is_some() {}

    Ok(())
}

#[cfg(test)]
mod tests {
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpStream;

    use super::*;

    #[tokio::test]
    async fn test_drains_connections_on_shutdown() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let (shutdown, signal) = shutdown();

        let (started_sender, mut started_receiver) = tokio::sync::mpsc::unbounded_channel();
        let server = tokio::spawn(serve(listener, signal, move |mut socket, _addr| {
            let started_sender = started_sender.clone();
            async move {
                started_sender.send(()).ok();

                let mut buffer = [0; 4];
                socket.read_exact(&mut buffer).await.unwrap();
                socket.write_all(&buffer).await.unwrap();
            }
        }));

        let mut client = TcpStream::connect(addr).await.unwrap();
        started_receiver.recv().await.unwrap();

        // Shut down while the connection is still being served; the
        // exchange must complete anyway.
        shutdown.trigger();

        client.write_all(b"ping").await.unwrap();
        let mut buffer = [0; 4];
        client.read_exact(&mut buffer).await.unwrap();
        assert_eq!(b"ping", &buffer);

        server.await.unwrap().unwrap();
    }
}
