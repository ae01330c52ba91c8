//! Line reversal over LRCP, the Line Reversal Control Protocol.
//!
//! LRCP is a reliable, in-order, session-oriented byte stream layered
//! on UDP. Clients open a session with a token of their choosing,
//! stream bytes to the server in `data` packets carrying absolute
//! stream positions, and acknowledge the server's own `data` packets
//! cumulatively. The application on top reads `\n`-terminated lines
//! and answers each one with the line reversed.
//!
//! # Packets
//!
//! Four packet types, each a single datagram (see [`packet`] for the
//! exact grammar):
//!
//! * `/connect/SESSION/` opens a session. The server always answers
//!   `/ack/SESSION/L/` with the current inbound length, so a
//!   retransmitted connect gets the same answer as the original.
//! * `/data/SESSION/POS/DATA/` carries bytes at stream position `POS`.
//!   The server acks the length of the contiguous prefix it now holds.
//!   Data beyond the prefix is not stored; the duplicate ack tells the
//!   peer where to resume. Data before the prefix is discarded as
//!   overlap.
//! * `/ack/SESSION/LENGTH/` acknowledges our outbound stream up to
//!   `LENGTH`. Stale acks are ignored; an ack beyond what was ever
//!   sent closes the session; a partial ack triggers an immediate
//!   retransmission of the tail.
//! * `/close/SESSION/` tears the session down and is echoed back.
//!   Packets for sessions the server does not know always get a
//!   `/close/SESSION/` reply.
//!
//! # Timers
//!
//! A 3-second ticker retransmits everything past the largest acked
//! offset. A session that has been silent for 60 seconds is discarded
//! without a goodbye; LRCP has no other liveness tracking.
//!
//! Invalid packets (bad framing, bad numbers, unescaped slashes,
//! oversized datagrams) are dropped without a reply.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::net::UdpSocket;
use tokio::time::{self, Duration};

use tracing::{debug, info, warn};

pub mod packet;
pub mod session;

use packet::{Packet, MAX_PACKET};
use session::{Ack, Session};

/// Retransmission sweep period.
const RETRANSMIT_PERIOD: Duration = Duration::from_secs(3);

/// Sessions idle longer than this are silently discarded.
const SESSION_TIMEOUT: Duration = Duration::from_secs(60);

type Sessions = Arc<Mutex<HashMap<u32, Arc<Session>>>>;

/// Run the main loop.
///
/// Receives datagrams, maintains the session table, and keeps one
/// application worker and the shared retransmission ticker running.
///
/// # Errors
/// * Error when the socket fails.
pub async fn run(socket: UdpSocket) -> Result<(), std::io::Error> {
    let socket = Arc::new(socket);
    let sessions: Sessions = Arc::new(Mutex::new(HashMap::new()));

    tokio::spawn(retransmit_loop(sessions.clone(), socket.clone()));

    let mut buffer = [0; MAX_PACKET + 1];
    loop {
        let (len, peer) = socket.recv_from(&mut buffer).await?;

        let packet = match Packet::try_from(&buffer[..len]) {
            Ok(packet) => packet,
            Err(err) => {
                debug!("dropping invalid packet from {peer}: {err}");
                continue;
            }
        };

        handle_packet(&sessions, &socket, peer, packet).await;
    }
}

#[tracing::instrument(skip(sessions, socket, packet))]
async fn handle_packet(
    sessions: &Sessions,
    socket: &Arc<UdpSocket>,
    peer: SocketAddr,
    packet: Packet,
) {
    match packet {
        Packet::Connect { session: token } => {
            let session = sessions
                .lock()
                .entry(token)
                .or_insert_with(|| {
                    info!("new session {token} from {peer}");
                    Session::spawn(token, peer, socket.clone())
                })
                .clone();

            session.touch();
            let length = ack_length(session.inbound_length());
            session::reply(socket, peer, &Packet::Ack {
                session: token,
                length,
            })
            .await;
        }

        Packet::Data {
            session: token,
            pos,
            data,
        } => {
            let Some(session) = lookup(sessions, token, peer) else {
                session::reply(socket, peer, &Packet::Close { session: token }).await;
                return;
            };

            let length = session.receive(pos as usize, &data);
            session::reply(socket, peer, &Packet::Ack {
                session: token,
                length: ack_length(length),
            })
            .await;
        }

        Packet::Ack {
            session: token,
            length,
        } => {
            let Some(session) = lookup(sessions, token, peer) else {
                session::reply(socket, peer, &Packet::Close { session: token }).await;
                return;
            };

            match session.acknowledge(length as usize) {
                Ack::Duplicate | Ack::Complete => {}
                Ack::Misbehaving => {
                    warn!("session {token} acked more than was sent");
                    sessions.lock().remove(&token);
                    session::reply(socket, peer, &Packet::Close { session: token }).await;
                }
                Ack::Retransmit(chunks) => {
                    for chunk in chunks {
                        session::send(socket, peer, &chunk).await;
                    }
                }
            }
        }

        Packet::Close { session: token } => {
            if sessions.lock().remove(&token).is_some() {
                info!("session {token} closed by peer");
            }
            session::reply(socket, peer, &Packet::Close { session: token }).await;
        }
    }
}

/// Sessions are bound to the address seen on the first connect;
/// packets for a known token from elsewhere are treated as referring
/// to an unknown session.
fn lookup(sessions: &Sessions, token: u32, peer: SocketAddr) -> Option<Arc<Session>> {
    sessions
        .lock()
        .get(&token)
        .filter(|session| session.peer == peer)
        .cloned()
}

async fn retransmit_loop(sessions: Sessions, socket: Arc<UdpSocket>) {
    let mut ticker = time::interval(RETRANSMIT_PERIOD);
    ticker.tick().await;

    loop {
        ticker.tick().await;

        let snapshot: Vec<Arc<Session>> = sessions.lock().values().cloned().collect();
        for session in snapshot {
            if session.idle_for() > SESSION_TIMEOUT {
                info!("session {} expired", session.token);
                sessions.lock().remove(&session.token);
                continue;
            }

            for chunk in session.unacked_chunks() {
                session::send(&socket, session.peer, &chunk).await;
            }
        }
    }
}

fn ack_length(length: usize) -> u32 {
    u32::try_from(length).unwrap_or(u32::MAX)
}
