//! Per-session state: the reliability buffers on the transport side
//! and the line-reversing application worker attached to them.

use std::net::SocketAddr;
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tokio::time::Instant;

use tracing::{debug, warn};

use crate::packet::{self, Packet, MAX_PACKET};

pub struct Session {
    pub token: u32,
    pub peer: SocketAddr,
    state: Mutex<State>,
    app_sender: mpsc::UnboundedSender<Vec<u8>>,
}

struct State {
    /// Length of the contiguous inbound prefix received so far.
    inbound_length: usize,
    /// Every byte the application has produced, in stream order.
    outbound: Vec<u8>,
    /// Largest outbound length the peer has acknowledged.
    largest_ack: usize,
    last_activity: Instant,
}

impl Session {
    /// Creates the session and spawns its application worker.
    pub fn spawn(token: u32, peer: SocketAddr, socket: Arc<UdpSocket>) -> Arc<Self> {
        let (app_sender, app_receiver) = mpsc::unbounded_channel();

        let session = Arc::new(Self {
            token,
            peer,
            state: Mutex::new(State {
                inbound_length: 0,
                outbound: vec![],
                largest_ack: 0,
                last_activity: Instant::now(),
            }),
            app_sender,
        });

        tokio::spawn(reverse_lines(
            app_receiver,
            Arc::downgrade(&session),
            socket,
        ));

        session
    }

    pub fn touch(&self) {
        self.state.lock().last_activity = Instant::now();
    }

    #[must_use]
    pub fn idle_for(&self) -> tokio::time::Duration {
        self.state.lock().last_activity.elapsed()
    }

    #[must_use]
    pub fn inbound_length(&self) -> usize {
        self.state.lock().inbound_length
    }

    /// Applies an inbound `data` payload at stream position `pos` and
    /// returns the new contiguous length. Bytes the session already
    /// holds are discarded; bytes beyond the contiguous prefix leave
    /// the state untouched (the caller duplicate-acks the old length).
    pub fn receive(&self, pos: usize, data: &[u8]) -> usize {
        let new_bytes = {
            let mut state = self.state.lock();
            state.last_activity = Instant::now();

            let length = state.inbound_length;
            if pos > length {
                return length;
            }

            let overlap = length - pos;
            if overlap >= data.len() {
                return length;
            }

            state.inbound_length += data.len() - overlap;
            data[overlap..].to_vec()
        };

        // Outside the lock: hand the fresh bytes to the application.
        self.app_sender.send(new_bytes).ok();

        self.state.lock().inbound_length
    }

    /// Outcome of an inbound `ack`.
    pub fn acknowledge(&self, length: usize) -> Ack {
        let chunks = {
            let mut state = self.state.lock();
            state.last_activity = Instant::now();

            if length > state.outbound.len() {
                return Ack::Misbehaving;
            }

            if length <= state.largest_ack {
                return Ack::Duplicate;
            }

            state.largest_ack = length;
            if length == state.outbound.len() {
                return Ack::Complete;
            }

            packet::data_packets(self.token, length, &state.outbound[length..])
        };

        Ack::Retransmit(chunks)
    }

    /// Appends application bytes to the outbound stream and transmits
    /// them in chunks.
    pub async fn send_data(&self, socket: &UdpSocket, payload: &[u8]) {
        let chunks = {
            let mut state = self.state.lock();
            let start = state.outbound.len();
            state.outbound.extend_from_slice(payload);
            packet::data_packets(self.token, start, payload)
        };

        for chunk in chunks {
            send(socket, self.peer, &chunk).await;
        }
    }

    /// Everything past the largest acked offset, re-chunked for the
    /// retransmission ticker.
    #[must_use]
    pub fn unacked_chunks(&self) -> Vec<Vec<u8>> {
        let state = self.state.lock();
        packet::data_packets(
            self.token,
            state.largest_ack,
            &state.outbound[state.largest_ack..],
        )
    }
}

pub enum Ack {
    /// Acked more than we ever sent; the peer is misbehaving.
    Misbehaving,
    /// Stale cumulative ack, nothing to do.
    Duplicate,
    /// Everything sent so far is acknowledged.
    Complete,
    /// Partial ack: retransmit these chunks now.
    Retransmit(Vec<Vec<u8>>),
}

/// Sends one datagram, enforcing the reply size cap.
pub async fn send(socket: &UdpSocket, peer: SocketAddr, datagram: &[u8]) {
    if datagram.len() >= MAX_PACKET {
        warn!("dropping oversized datagram ({} bytes)", datagram.len());
        return;
    }

    if let Err(err) = socket.send_to(datagram, peer).await {
        warn!("cannot send to {peer}: {err}");
    }
}

/// Sends a control packet (`ack` / `close`).
pub async fn reply(socket: &UdpSocket, peer: SocketAddr, packet: &Packet) {
    send(socket, peer, &packet.encode()).await;
}

/// The application worker: reads inbound bytes, reverses each
/// `\n`-terminated line, and writes the reversed line (newline
/// preserved) back through the session's outbound path. An incomplete
/// final line waits for more data.
async fn reverse_lines(
    mut inbound: mpsc::UnboundedReceiver<Vec<u8>>,
    session: Weak<Session>,
    socket: Arc<UdpSocket>,
) {
    let mut pending: Vec<u8> = vec![];

    while let Some(bytes) = inbound.recv().await {
        pending.extend_from_slice(&bytes);

        while let Some(i) = pending.iter().position(|&b| b == b'\n') {
            let mut reversed: Vec<u8> = pending[..i].iter().rev().copied().collect();
            reversed.push(b'\n');
            pending.drain(..=i);

            let Some(session) = session.upgrade() else {
                return;
            };

            debug!(
                session = session.token,
                "reversing {} byte line", reversed.len()
            );
            session.send_data(&socket, &reversed).await;
        }
    }
}
