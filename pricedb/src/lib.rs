//! Means to an end: a per-connection asset price store.
//!
//! Clients send 9-byte binary frames: a `u8` operation (`I` or `Q`)
//! followed by two big-endian `i32`s. `I` inserts a price at a
//! timestamp; `Q` asks for the mean price over an inclusive timestamp
//! range and gets a single big-endian `i32` back (0 when the range is
//! empty or inverted). Each connection has its own store. Anything
//! else on the wire ends the session.

use std::collections::BTreeMap;

use tokio::io::{AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;

use tracing::debug;

#[tracing::instrument(skip(socket))]
pub async fn handler(mut socket: TcpStream) {
    let (read, mut write) = socket.split();
    let mut read = BufReader::new(read);

    let mut prices = BTreeMap::new();

    let exchange = async {
        loop {
            let op = read.read_u8().await?;
            let a = read.read_i32().await?;
            let b = read.read_i32().await?;

            match op {
                b'I' => {
                    prices.insert(a, b);
                }
                b'Q' => {
                    let mean = mean(&prices, a, b);
                    debug!("query [{a}, {b}] -> {mean}");
                    write.write_i32(mean).await?;
                }
                op => {
                    debug!("unknown op 0x{op:02x}");
                    break;
                }
            }
        }

        Ok::<_, std::io::Error>(())
    };

    if let Err(err) = exchange.await {
        debug!("connection ended: {err}");
    }
}

fn mean(prices: &BTreeMap<i32, i32>, mintime: i32, maxtime: i32) -> i32 {
    if mintime > maxtime {
        return 0;
    }

    let mut count: i64 = 0;
    let mut sum: i64 = 0;
    for price in prices.range(mintime..=maxtime).map(|(_, price)| *price) {
        count += 1;
        sum += i64::from(price);
    }

    if count == 0 {
        return 0;
    }

    i32::try_from(sum / count).unwrap_or(0)
}
