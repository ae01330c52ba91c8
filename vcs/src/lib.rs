//! Voracious code storage: a versioned text-file store over a line
//! command protocol.
//!
//! The server prompts `READY` and accepts:
//!
//! * `HELP` - usage summary.
//! * `PUT file length` followed by exactly `length` raw bytes of file
//!   content on the same stream. Content must be text. Storing the
//!   same content twice in a row answers the existing revision;
//!   anything new gets `OK rN` with a fresh revision number.
//! * `GET file [revision]` - `OK length`, the content, `READY`. The
//!   revision may be spelled `3` or `r3`; omitted means latest.
//! * `LIST dir` - `OK count`, then one line per immediate child:
//!   `name/ DIR` for subdirectories, `name rN` for files with their
//!   latest revision, sorted by name.
//!
//! Recoverable mistakes (bad names, missing files) answer `ERR ...`
//! and keep the session; an unknown method is fatal.
//!
//! The `PUT` payload may begin with bytes already swallowed by the
//! line reader's lookahead, which is exactly what
//! [`netframe::Scanner::exact`] is for.

use std::sync::Arc;

use tokio::io::{AsyncWriteExt, BufWriter};
use tokio::net::TcpStream;

use tracing::{debug, warn};

use netframe::Scanner;

pub mod storage;

use storage::{Entry, Storage};

#[tracing::instrument(skip(socket, storage))]
pub async fn handle_client(mut socket: TcpStream, storage: Arc<Storage>) {
    let (read, write) = socket.split();
    let mut scanner = Scanner::new(read);
    let mut write = BufWriter::new(write);

    let session = async {
        loop {
            write.write_all(b"READY\n").await?;
            write.flush().await?;

            let Some(line) = scanner.line().await? else {
                return Ok(());
            };
            let line = String::from_utf8_lossy(&line).into_owned();
            debug!("command: {line}");

            let fields: Vec<&str> = line.split_ascii_whitespace().collect();
            let Some(method) = fields.first() else {
                write.write_all(b"ERR illegal method:\n").await?;
                write.flush().await?;
                return Ok(());
            };

            match method.to_ascii_uppercase().as_str() {
                "HELP" => {
                    write.write_all(b"OK usage: HELP|GET|PUT|LIST\n").await?;
                }
                "PUT" => {
                    if let Err(message) = put(&storage, &fields, &mut scanner, &mut write).await? {
                        write.write_all(message.as_bytes()).await?;
                    }
                }
                "GET" => {
                    if let Err(message) = get(&storage, &fields, &mut write).await? {
                        write.write_all(message.as_bytes()).await?;
                    }
                }
                "LIST" => {
                    if let Err(message) = list(&storage, &fields, &mut write).await? {
                        write.write_all(message.as_bytes()).await?;
                    }
                }
                _ => {
                    write
                        .write_all(format!("ERR illegal method: {method}\n").as_bytes())
                        .await?;
                    write.flush().await?;
                    return Ok(());
                }
            }
        }
    };

    let session: Result<(), netframe::Error> = session.await;
    if let Err(err) = session {
        warn!("session ended: {err}");
    }
}

type CommandResult = Result<Result<(), String>, netframe::Error>;

async fn put<R, W>(
    storage: &Storage,
    fields: &[&str],
    scanner: &mut Scanner<R>,
    write: &mut W,
) -> CommandResult
where
    R: tokio::io::AsyncRead + Unpin,
    W: tokio::io::AsyncWrite + Unpin,
{
    let [_, path, length] = fields else {
        return Ok(Err("ERR usage: PUT file length newline data\n".to_string()));
    };

    let Ok(length) = length.parse::<usize>() else {
        return Ok(Err("ERR illegal file length\n".to_string()));
    };

    // The payload is on the wire either way; consume it before
    // complaining so the stream stays in sync.
    let content = scanner.exact(length).await?;

    if !is_file_path(path) {
        return Ok(Err("ERR illegal file name\n".to_string()));
    }

    if !is_text(&content) {
        return Ok(Err("ERR text files only\n".to_string()));
    }

    let revision = storage.put(path, content);
    write
        .write_all(format!("OK r{revision}\n").as_bytes())
        .await?;

    Ok(Ok(()))
}

async fn get<W>(storage: &Storage, fields: &[&str], write: &mut W) -> CommandResult
where
    W: tokio::io::AsyncWrite + Unpin,
{
    let (path, revision) = match fields {
        [_, path] => (path, None),
        [_, path, revision] => {
            let revision = revision.strip_prefix('r').unwrap_or(revision);
            let Ok(revision) = revision.parse::<usize>() else {
                return Ok(Err("ERR illegal revision\n".to_string()));
            };
            (path, Some(revision))
        }
        _ => return Ok(Err("ERR usage: GET file [revision]\n".to_string())),
    };

    if !is_file_path(path) {
        return Ok(Err("ERR illegal file name\n".to_string()));
    }

    let content = match storage.get(path, revision) {
        Ok(content) => content,
        Err(storage::GetError::NoSuchFile) => {
            return Ok(Err("ERR file does not exist\n".to_string()));
        }
        Err(storage::GetError::NoSuchRevision) => {
            return Ok(Err("ERR revision does not exist\n".to_string()));
        }
    };

    write
        .write_all(format!("OK {}\n", content.len()).as_bytes())
        .await?;
    write.write_all(&content).await?;

    Ok(Ok(()))
}

async fn list<W>(storage: &Storage, fields: &[&str], write: &mut W) -> CommandResult
where
    W: tokio::io::AsyncWrite + Unpin,
{
    let [_, dir] = fields else {
        return Ok(Err("ERR usage: LIST dir\n".to_string()));
    };

    if !is_dir_path(dir) {
        return Ok(Err("ERR illegal dir name\n".to_string()));
    }

    let entries = storage.list(dir);
    write
        .write_all(format!("OK {}\n", entries.len()).as_bytes())
        .await?;
    for entry in entries {
        let line = match entry {
            Entry::Dir(name) => format!("{name} DIR\n"),
            Entry::File(name, revision) => format!("{name} r{revision}\n"),
        };
        write.write_all(line.as_bytes()).await?;
    }

    Ok(Ok(()))
}

fn is_file_path(path: &str) -> bool {
    path.len() > 1
        && path.starts_with('/')
        && !path.ends_with('/')
        && !path.contains("//")
        && path
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || matches!(b, b'/' | b'.' | b'-' | b'_'))
}

fn is_dir_path(path: &str) -> bool {
    path == "/"
        || (path.starts_with('/')
            && !path.contains("//")
            && path
                .trim_end_matches('/')
                .bytes()
                .skip(1)
                .all(|b| b.is_ascii_alphanumeric() || matches!(b, b'/' | b'.' | b'-' | b'_')))
}

fn is_text(content: &[u8]) -> bool {
    content
        .iter()
        .all(|&b| matches!(b, b' '..=b'~' | b'\n' | b'\r' | b'\t'))
}
