//! Mob in the middle: a malicious chat proxy.
//!
//! Sits between chat clients and an upstream chat server, forwarding
//! complete lines in both directions. Any whitespace-delimited token
//! that looks like a Boguscoin address (`7` followed by 25 to 34
//! alphanumerics) is rewritten to Tony's address on the way through.
//! Partial lines without a terminating newline are never forwarded.

use tokio::io::{AsyncWriteExt, WriteHalf};
use tokio::net::TcpStream;

use tracing::debug;

use netframe::Scanner;

const TONY: &str = "7YWHMfk9JZe0LM0g1ZauHuiSxhI";

#[tracing::instrument(skip(socket))]
pub async fn handler(socket: TcpStream, upstream_addr: String) {
    let upstream = match TcpStream::connect(&upstream_addr).await {
        Ok(upstream) => upstream,
        Err(err) => {
            debug!("cannot reach upstream {upstream_addr}: {err}");
            return;
        }
    };

    let (client_read, client_write) = tokio::io::split(socket);
    let (upstream_read, upstream_write) = tokio::io::split(upstream);

    // Either direction closing tears down both.
    tokio::select! {
        () = pump(Scanner::new(client_read), upstream_write) => {}
        () = pump(Scanner::new(upstream_read), client_write) => {}
    }
}

async fn pump<R>(mut scanner: Scanner<R>, mut write: WriteHalf<TcpStream>)
where
    R: tokio::io::AsyncRead + Unpin,
{
    let copy = async {
        while let Some(line) = scanner.line().await? {
            let line = String::from_utf8_lossy(&line).into_owned();
            let rewritten = rewrite(&line);

            write.write_all(rewritten.as_bytes()).await?;
            write.write_all(b"\n").await?;
        }

        Ok::<_, anyhow::Error>(())
    };

    if let Err(err) = copy.await {
        debug!("pump ended: {err}");
    }
}

fn rewrite(line: &str) -> String {
    line.split(' ')
        .map(|token| if is_boguscoin(token) { TONY } else { token })
        .collect::<Vec<_>>()
        .join(" ")
}

fn is_boguscoin(token: &str) -> bool {
    (26..=35).contains(&token.len())
        && token.starts_with('7')
        && token.bytes().all(|b| b.is_ascii_alphanumeric())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rewrite() {
        assert_eq!(
            format!("Please pay the ticket price of 15 Boguscoins to {TONY}"),
            rewrite("Please pay the ticket price of 15 Boguscoins to 7iKDZEwPZSqIvDnHvVN2r0hUWXD5rHX")
        );

        // Product names that merely contain an address-like substring
        // are left alone.
        assert_eq!(
            "my address is 7iKDZEwPZSqIvDnHvVN2r0hUWXD5rHX-1234 thanks",
            rewrite("my address is 7iKDZEwPZSqIvDnHvVN2r0hUWXD5rHX-1234 thanks")
        );

        assert_eq!(
            format!("{TONY} and {TONY}"),
            rewrite("7F1u3wSD5RbOHQmupo9nx4TnhQ and 7iKDZEwPZSqIvDnHvVN2r0hUWXD5rHX")
        );

        // Too short, too long, wrong first character.
        assert_eq!("7abc", rewrite("7abc"));
        assert_eq!(
            "7iKDZEwPZSqIvDnHvVN2r0hUWXD5rHX7iKDZEwPZSqIvDnHvVN2r0hUWXD5rHX",
            rewrite("7iKDZEwPZSqIvDnHvVN2r0hUWXD5rHX7iKDZEwPZSqIvDnHvVN2r0hUWXD5rHX")
        );
        assert_eq!(
            "8iKDZEwPZSqIvDnHvVN2r0hUWXD5rHX",
            rewrite("8iKDZEwPZSqIvDnHvVN2r0hUWXD5rHX")
        );
    }
}
