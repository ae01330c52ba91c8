//! Job centre: a priority job broker over JSON lines.
//!
//! Each request is one `\n`-terminated JSON object with a `request`
//! field in `put` / `get` / `delete` / `abort`; each response carries
//! a `status` of `ok`, `no-job`, or `error` (with a human-readable
//! `error` message). Unknown top-level request fields are ignored.
//!
//! * `put {queue, job, pri}` inserts a job and answers its fresh id.
//! * `get {queues, wait?}` hands out the highest-priority queued job
//!   across the named queues, or `no-job`; with `wait: true` it blocks
//!   until a job shows up or the client goes away.
//! * `abort {id}` returns a job the caller holds to its queue. Another
//!   client's job is an error, not a silent success.
//! * `delete {id}` removes a job outright, queued or allocated.
//!
//! A disconnecting client implicitly aborts everything it holds; the
//! jobs become visible to waiting `get`s immediately.

use std::collections::VecDeque;
use std::sync::atomic;
use std::sync::Arc;

use futures::StreamExt;
use tokio::io::{AsyncWriteExt, BufWriter};
use tokio::net::{TcpListener, TcpStream};
use tokio_util::codec::{FramedRead, LinesCodec};

use serde::{Deserialize, Serialize};

use tracing::{info, warn};

use netframe::supervisor;

pub mod broker;

use broker::{AbortError, Broker, ClientId, Job};

#[derive(Debug, Deserialize)]
#[serde(tag = "request", rename_all = "lowercase")]
enum Request {
    Put {
        queue: String,
        job: serde_json::Value,
        pri: u64,
    },
    Get {
        queues: Vec<String>,
        #[serde(default)]
        wait: bool,
    },
    Delete {
        id: u64,
    },
    Abort {
        id: u64,
    },
}

#[derive(Debug, Default, Serialize)]
struct Response {
    status: &'static str,

    #[serde(skip_serializing_if = "Option::is_none")]
    id: Option<u64>,

    #[serde(skip_serializing_if = "Option::is_none")]
    job: Option<serde_json::Value>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pri: Option<u64>,

    #[serde(skip_serializing_if = "Option::is_none")]
    queue: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

impl Response {
    fn ok() -> Self {
        Self {
            status: "ok",
            ..Self::default()
        }
    }

    fn ok_id(id: u64) -> Self {
        Self {
            id: Some(id),
            ..Self::ok()
        }
    }

    fn ok_job(job: Job) -> Self {
        Self {
            id: Some(job.id),
            job: Some(job.payload),
            pri: Some(job.pri),
            queue: Some(job.queue),
            ..Self::ok()
        }
    }

    fn no_job() -> Self {
        Self {
            status: "no-job",
            ..Self::default()
        }
    }

    fn error(message: String) -> Self {
        Self {
            status: "error",
            error: Some(message),
            ..Self::default()
        }
    }
}

/// Run the main loop.
///
/// # Errors
/// * Error when the socket returns an error.
#[tracing::instrument(skip(listener))]
pub async fn run(listener: TcpListener) -> Result<(), anyhow::Error> {
    let broker = Arc::new(Broker::new());

    let (_shutdown, signal) = supervisor::shutdown();
    supervisor::serve(listener, signal, move |socket, _addr| {
        handle_client(socket, broker.clone())
    })
    .await?;

    Ok(())
}

/// Requeues the client's allocations on every exit path.
struct ClientGuard {
    broker: Arc<Broker>,
    client: ClientId,
}

impl Drop for ClientGuard {
    fn drop(&mut self) {
        self.broker.disconnect(self.client);
    }
}

#[tracing::instrument(skip(socket, broker))]
pub async fn handle_client(socket: TcpStream, broker: Arc<Broker>) {
    static IDS: atomic::AtomicU64 = atomic::AtomicU64::new(0);
    let client = IDS.fetch_add(1, atomic::Ordering::Relaxed);

    let _guard = ClientGuard {
        broker: broker.clone(),
        client,
    };

    let (read, write) = socket.into_split();
    let mut lines = FramedRead::new(read, LinesCodec::new());
    let mut write = BufWriter::new(write);

    // Lines that arrive while a `get` is blocked are answered in
    // order once the wait resolves.
    let mut backlog: VecDeque<String> = VecDeque::new();

    let session = async {
        loop {
            let line = match backlog.pop_front() {
                Some(line) => line,
                None => match lines.next().await {
                    Some(Ok(line)) => line,
                    Some(Err(err)) => {
                        warn!("client {client} framing error: {err}");
                        break;
                    }
                    None => break,
                },
            };

            let response = match serde_json::from_str::<Request>(&line) {
                Err(err) => Response::error(err.to_string()),

                Ok(Request::Put { queue, job, pri }) => {
                    Response::ok_id(broker.put(&queue, job, pri))
                }

                Ok(Request::Get { queues, wait }) => {
                    match broker.try_take(client, &queues) {
                        Some(job) => Response::ok_job(job),
                        None if !wait => Response::no_job(),
                        None => {
                            let Some(job) =
                                blocked_take(&broker, client, &queues, &mut lines, &mut backlog)
                                    .await
                            else {
                                // Disconnected mid-wait; the guard
                                // requeues whatever we hold.
                                break;
                            };

                            Response::ok_job(job)
                        }
                    }
                }

                Ok(Request::Delete { id }) => {
                    if broker.delete(id) {
                        Response::ok()
                    } else {
                        Response::no_job()
                    }
                }

                Ok(Request::Abort { id }) => match broker.abort(client, id) {
                    Ok(()) => Response::ok(),
                    Err(AbortError::NoJob) => Response::no_job(),
                    Err(err @ AbortError::NotOwner(_)) => Response::error(err.to_string()),
                },
            };

            let mut line = serde_json::to_vec(&response)?;
            line.push(b'\n');
            write.write_all(&line).await?;
            write.flush().await?;
        }

        Ok::<_, anyhow::Error>(())
    };

    if let Err(err) = session.await {
        info!("client {client} ended: {err}");
    }
}

/// Waits for a job while watching the connection: further request
/// lines are buffered for later, EOF gives up the wait.
async fn blocked_take(
    broker: &Broker,
    client: ClientId,
    queues: &[String],
    lines: &mut FramedRead<tokio::net::tcp::OwnedReadHalf, LinesCodec>,
    backlog: &mut VecDeque<String>,
) -> Option<Job> {
    loop {
        tokio::select! {
            job = broker.take_wait(client, queues) => return Some(job),

            next = lines.next() => match next {
                Some(Ok(line)) => backlog.push_back(line),
                _ => return None,
            },
        }
    }
}
