//! Prime time: an is-it-prime service over JSON lines.
//!
//! Each request is a single line `{"method":"isPrime","number":N}` and
//! gets the response `{"method":"isPrime","prime":bool}`. A request
//! that is not well-formed (broken JSON, wrong method, missing or
//! non-numeric number) gets a single malformed response line, after
//! which the connection is closed.

use tokio::io::{AsyncWriteExt, BufWriter};
use tokio::net::TcpStream;

use serde::{Deserialize, Serialize};

use tracing::{debug, warn};

use netframe::Scanner;

#[derive(Debug, Deserialize)]
struct Request {
    method: String,
    number: f64,
}

#[derive(Debug, Serialize)]
struct Response {
    method: &'static str,
    prime: bool,
}

#[tracing::instrument(skip(socket))]
pub async fn handler(mut socket: TcpStream) {
    let (read, write) = socket.split();
    let mut scanner = Scanner::new(read);
    let mut write = BufWriter::new(write);

    let exchange = async {
        while let Some(line) = scanner.line().await? {
            match parse(&line) {
                Ok(number) => {
                    let response = Response {
                        method: "isPrime",
                        prime: is_prime(number),
                    };

                    debug!("{number} -> {}", response.prime);

                    let mut line = serde_json::to_vec(&response)?;
                    line.push(b'\n');
                    write.write_all(&line).await?;
                    write.flush().await?;
                }
                Err(err) => {
                    warn!("malformed request: {err}");
                    write.write_all(b"{\"error\":\"malformed request\"}\n").await?;
                    write.flush().await?;
                    break;
                }
            }
        }

        Ok::<_, anyhow::Error>(())
    };

    if let Err(err) = exchange.await {
        debug!("connection ended: {err}");
    }
}

fn parse(line: &[u8]) -> Result<f64, anyhow::Error> {
    let request: Request = serde_json::from_slice(line)?;
    if request.method != "isPrime" {
        return Err(anyhow::anyhow!("unknown method: {}", request.method));
    }

    Ok(request.number)
}

fn is_prime(number: f64) -> bool {
    // Only whole numbers at least 2 can be prime.
    if number.fract() != 0.0 || number < 2.0 || number > 9_007_199_254_740_992.0 {
        return false;
    }

    #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
    let number = number as u64;

    primes::is_prime(number)
}
