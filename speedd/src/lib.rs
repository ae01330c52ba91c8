//! Speed daemon: average speed enforcement for the Freedom Island
//! road network.
//!
//! Two kinds of client connect over TCP and speak the binary protocol
//! in [`wire`]:
//!
//! * **Cameras** identify themselves with `IAmCamera{road, mile,
//!   limit}` and then report `Plate{plate, timestamp}` observations.
//!   Observations may arrive in any order and after any delay; only
//!   the message timestamps matter.
//! * **Dispatchers** identify themselves with `IAmDispatcher{roads}`
//!   and then receive `Ticket` messages for cars whose average speed
//!   between any two observations on one of their roads exceeded that
//!   road's limit by at least half a mile per hour.
//!
//! Tickets for roads with no connected dispatcher are held and
//! delivered when one arrives. No car is ticketed twice for the same
//! calendar day (`floor(timestamp / 86400)`), no matter how many
//! roads it speeds on.
//!
//! Any client may request heartbeats with `WantHeartbeat{interval}`
//! (deciseconds; zero means none, and only one request is allowed).
//! Protocol violations - a second identity, a plate from a
//! non-camera, an unknown message type - get an `Error` message and
//! the connection is closed.

use std::future;
use std::sync::atomic;

use tokio::io::{AsyncReadExt, AsyncWriteExt, BufReader, BufWriter};
use tokio::net::{
    tcp::{ReadHalf, WriteHalf},
    TcpListener, TcpStream,
};
use tokio::sync::{mpsc, oneshot};
use tokio::time::{self, Duration, Instant};

use tracing::{debug, info, warn};

use netframe::supervisor;

pub mod registry;
pub mod wire;

use registry::Command;

type RegistrySender = mpsc::UnboundedSender<Command>;

/// Run the main loop.
///
/// Listens for clients and routes their messages through the shared
/// road registry.
///
/// # Errors
/// * Error when the socket returns an error.
#[tracing::instrument(skip(listener))]
pub async fn run(listener: TcpListener) -> Result<(), anyhow::Error> {
    let registry = registry::spawn();

    let (_shutdown, signal) = supervisor::shutdown();
    supervisor::serve(listener, signal, move |socket, _addr| {
        handle_client(socket, registry.clone())
    })
    .await?;

    Ok(())
}

#[tracing::instrument(skip(socket, registry))]
async fn handle_client(mut socket: TcpStream, registry: RegistrySender) {
    let (read, write) = socket.split();
    let mut read = BufReader::new(read);
    let mut write = BufWriter::new(write);

    let handler = async {
        let mut heartbeat = Heartbeat::new();
        loop {
            tokio::select! {
                tag = read.read_u8() => {
                    match tag? {
                        wire::IAmCamera::TAG => {
                            return handle_camera(
                                registry,
                                wire::IAmCamera::read_payload_from(&mut read).await?,
                                heartbeat,
                                &mut read,
                                &mut write,
                            )
                            .await;
                        }
                        wire::IAmDispatcher::TAG => {
                            return handle_dispatcher(
                                registry,
                                wire::IAmDispatcher::read_payload_from(&mut read).await?,
                                heartbeat,
                                &mut read,
                                &mut write,
                            )
                            .await;
                        }
                        wire::WantHeartbeat::TAG => {
                            let wire::WantHeartbeat { interval } =
                                wire::WantHeartbeat::read_payload_from(&mut read).await?;
                            heartbeat.request(interval)?;
                        }
                        tag => {
                            return Err(anyhow::anyhow!("illegal msg: 0x{tag:02x}"));
                        }
                    }
                }

                () = heartbeat.tick() => {
                    wire::Heartbeat.write_to(&mut write).await?;
                    write.flush().await?;
                }
            }
        }
    };

    if let Err(err) = handler.await {
        warn!("client failed: {err}");
        wire::Error {
            msg: err.to_string(),
        }
        .write_to(&mut write)
        .await
        .ok();
        write.flush().await.ok();
        write.shutdown().await.ok();
    }
}

#[tracing::instrument(skip(registry, heartbeat, read, write))]
async fn handle_camera<'a>(
    registry: RegistrySender,
    camera: wire::IAmCamera,
    mut heartbeat: Heartbeat,
    read: &mut BufReader<ReadHalf<'a>>,
    write: &mut BufWriter<WriteHalf<'a>>,
) -> Result<(), anyhow::Error> {
    debug!("start {camera:?}");

    let (reply, confirmation) = oneshot::channel();
    registry.send(Command::RegisterCamera {
        road: camera.road,
        limit: camera.limit,
        reply,
    })?;
    confirmation.await??;

    loop {
        tokio::select! {
            tag = read.read_u8() => {
                match tag? {
                    wire::Plate::TAG => {
                        let wire::Plate { plate, timestamp } =
                            wire::Plate::read_payload_from(read).await?;
                        info!("plate {plate} at mile {} ts {timestamp}", camera.mile);

                        registry.send(Command::Plate {
                            road: camera.road,
                            mile: camera.mile,
                            plate,
                            timestamp,
                        })?;
                    }
                    wire::WantHeartbeat::TAG => {
                        let wire::WantHeartbeat { interval } =
                            wire::WantHeartbeat::read_payload_from(read).await?;
                        heartbeat.request(interval)?;
                    }
                    tag => {
                        return Err(anyhow::anyhow!("illegal msg: 0x{tag:02x}"));
                    }
                }
            }

            () = heartbeat.tick() => {
                wire::Heartbeat.write_to(write).await?;
                write.flush().await?;
            }
        }
    }
}

#[tracing::instrument(skip(registry, dispatcher, heartbeat, read, write))]
async fn handle_dispatcher<'a>(
    registry: RegistrySender,
    dispatcher: wire::IAmDispatcher,
    mut heartbeat: Heartbeat,
    read: &mut BufReader<ReadHalf<'a>>,
    write: &mut BufWriter<WriteHalf<'a>>,
) -> Result<(), anyhow::Error> {
    debug!("start {dispatcher:?}");

    let (ticket_sender, mut tickets) = mpsc::unbounded_channel();
    let _guard = DispatcherGuard::new(registry, dispatcher.roads, ticket_sender)?;

    loop {
        tokio::select! {
            tag = read.read_u8() => {
                match tag? {
                    wire::WantHeartbeat::TAG => {
                        let wire::WantHeartbeat { interval } =
                            wire::WantHeartbeat::read_payload_from(read).await?;
                        heartbeat.request(interval)?;
                    }
                    tag => {
                        return Err(anyhow::anyhow!("illegal msg: 0x{tag:02x}"));
                    }
                }
            }

            () = heartbeat.tick() => {
                wire::Heartbeat.write_to(write).await?;
                write.flush().await?;
            }

            ticket = tickets.recv() => {
                let Some(ticket) = ticket else {
                    warn!("registry dropped the ticket channel");
                    return Ok(());
                };

                info!("delivering {ticket:?}");
                ticket.write_to(write).await?;
                write.flush().await?;
            }
        }
    }
}

/// Registers a dispatcher with the registry and deregisters it on any
/// exit path, so tickets stop being routed to a dead connection.
struct DispatcherGuard(RegistrySender, usize);

impl DispatcherGuard {
    fn new(
        registry: RegistrySender,
        roads: Vec<u16>,
        sender: mpsc::UnboundedSender<wire::Ticket>,
    ) -> Result<Self, anyhow::Error> {
        static IDS: atomic::AtomicUsize = atomic::AtomicUsize::new(0);

        let id = IDS.fetch_add(1, atomic::Ordering::Relaxed);
        registry.send(Command::AddDispatcher { id, roads, sender })?;

        Ok(Self(registry, id))
    }
}

impl Drop for DispatcherGuard {
    fn drop(&mut self) {
        if self
            .0
            .send(Command::RemoveDispatcher { id: self.1 })
            .is_err()
        {
            warn!("cannot remove dispatcher {}", self.1);
        }
    }
}

/// Per-connection heartbeat: silent until requested, then ticking at
/// the requested decisecond interval. A second request is a protocol
/// error; an interval of zero keeps the heartbeat silent.
struct Heartbeat {
    ticker: Option<time::Interval>,
    requested: bool,
}

impl Heartbeat {
    fn new() -> Self {
        Self {
            ticker: None,
            requested: false,
        }
    }

    fn request(&mut self, deciseconds: u32) -> Result<(), anyhow::Error> {
        if self.requested {
            return Err(anyhow::anyhow!("heartbeat already requested"));
        }

        self.requested = true;
        if deciseconds > 0 {
            let period = Duration::from_millis(u64::from(deciseconds) * 100);
            self.ticker = Some(time::interval_at(Instant::now() + period, period));
        }

        Ok(())
    }

    async fn tick(&mut self) {
        match self.ticker.as_mut() {
            Some(ticker) => {
                ticker.tick().await;
            }
            None => future::pending().await,
        }
    }
}
