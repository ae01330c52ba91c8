//! Budget chat: a single-room line-oriented chat server.
//!
//! The first line a client sends is its username: one or more
//! alphanumeric characters. Valid users join the room, see who is
//! already there, and from then on every line they send is broadcast
//! to everyone else as `[name] msg`. Joins and leaves are announced
//! with `* name has entered/left the room` notices.
//!
//! The room is an actor owning a sender per member; sessions talk to
//! it exclusively through [`Room`] messages, so there is no shared
//! mutable membership list and no session-to-room back-pointer.

use std::collections::HashMap;

use tokio::io::{AsyncWriteExt, BufWriter};
use tokio::net::TcpStream;
use tokio::sync::mpsc;

use tracing::{debug, info};

use netframe::Scanner;

#[derive(Debug, thiserror::Error)]
pub enum NameError {
    #[error("Username must contain at least 1 character")]
    Empty,

    #[error("Username must consist entirely of alphanumeric characters")]
    NotAlphanumeric,
}

enum Command {
    Join {
        id: u64,
        name: String,
        sender: mpsc::UnboundedSender<String>,
    },
    Leave {
        id: u64,
    },
    Message {
        id: u64,
        text: String,
    },
}

/// Handle to the room actor. Cloning shares the same room.
#[derive(Clone)]
pub struct Room(mpsc::UnboundedSender<Command>);

impl Room {
    /// Spawns the room actor and returns its handle.
    #[must_use]
    pub fn spawn() -> Self {
        let (sender, mut receiver) = mpsc::unbounded_channel();

        tokio::spawn(async move {
            let mut members: HashMap<u64, (String, mpsc::UnboundedSender<String>)> =
                HashMap::new();

            while let Some(command) = receiver.recv().await {
                match command {
                    Command::Join { id, name, sender } => {
                        let roster = if members.is_empty() {
                            "* The room is empty".to_string()
                        } else {
                            format!(
                                "* The room contains: {}",
                                members
                                    .values()
                                    .map(|(name, _)| name.as_str())
                                    .collect::<Vec<_>>()
                                    .join(", ")
                            )
                        };
                        sender.send(roster).ok();

                        broadcast(&members, None, &format!("* {name} has entered the room"));
                        info!("{name} joined");
                        members.insert(id, (name, sender));
                    }
                    Command::Leave { id } => {
                        if let Some((name, _)) = members.remove(&id) {
                            broadcast(&members, None, &format!("* {name} has left the room"));
                            info!("{name} left");
                        }
                    }
                    Command::Message { id, text } => {
                        if let Some((name, _)) = members.get(&id) {
                            broadcast(&members, Some(id), &format!("[{name}] {text}"));
                        }
                    }
                }
            }
        });

        Self(sender)
    }
}

fn broadcast(
    members: &HashMap<u64, (String, mpsc::UnboundedSender<String>)>,
    source: Option<u64>,
    message: &str,
) {
    for (id, (_, sender)) in members {
        if source == Some(*id) {
            continue;
        }

        sender.send(message.to_string()).ok();
    }
}

struct Membership {
    room: Room,
    id: u64,
}

impl Drop for Membership {
    fn drop(&mut self) {
        self.room.0.send(Command::Leave { id: self.id }).ok();
    }
}

#[tracing::instrument(skip(socket, room))]
pub async fn handler(mut socket: TcpStream, room: Room) {
    static IDS: std::sync::atomic::AtomicU64 = std::sync::atomic::AtomicU64::new(0);
    let id = IDS.fetch_add(1, std::sync::atomic::Ordering::Relaxed);

    let (read, write) = socket.split();
    let mut scanner = Scanner::new(read);
    let mut write = BufWriter::new(write);

    let session = async {
        write
            .write_all(b"Welcome to budgetchat! What shall I call you?\n")
            .await?;
        write.flush().await?;

        let Some(line) = scanner.line().await? else {
            return Ok(());
        };

        let name = match validate_name(&line) {
            Ok(name) => name,
            Err(err) => {
                write.write_all(err.to_string().as_bytes()).await?;
                write.write_all(b"\n").await?;
                write.flush().await?;
                return Ok(());
            }
        };

        let (sender, mut outbound) = mpsc::unbounded_channel();
        room.0
            .send(Command::Join {
                id,
                name,
                sender,
            })
            .ok();
        let _membership = Membership {
            room: room.clone(),
            id,
        };

        loop {
            tokio::select! {
                line = scanner.line() => {
                    let Some(line) = line? else {
                        break;
                    };

                    room.0
                        .send(Command::Message {
                            id,
                            text: String::from_utf8_lossy(&line).into_owned(),
                        })
                        .ok();
                }

                message = outbound.recv() => {
                    let Some(message) = message else {
                        break;
                    };

                    write.write_all(message.as_bytes()).await?;
                    write.write_all(b"\n").await?;
                    write.flush().await?;
                }
            }
        }

        Ok::<_, anyhow::Error>(())
    };

    if let Err(err) = session.await {
        debug!("session ended: {err}");
    }
}

fn validate_name(line: &[u8]) -> Result<String, NameError> {
    if line.is_empty() {
        return Err(NameError::Empty);
    }

    if !line.iter().all(u8::is_ascii_alphanumeric) {
        return Err(NameError::NotAlphanumeric);
    }

    Ok(String::from_utf8_lossy(line).into_owned())
}
