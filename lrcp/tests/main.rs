use std::time::Duration;

use tokio::net::UdpSocket;
use tokio::time::timeout;

use tracing::info;

const TIMEOUT: Duration = Duration::from_millis(1000);

fn init_tracing_subscriber() {
    static TRACING_SUBSCRIBER_INIT: parking_lot::Once = parking_lot::Once::new();
    TRACING_SUBSCRIBER_INIT.call_once(tracing_subscriber::fmt::init);
}

struct Client {
    socket: UdpSocket,
}

impl Client {
    async fn connect() -> Self {
        init_tracing_subscriber();

        let server = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let addr = server.local_addr().unwrap();

        tokio::spawn(async move {
            lrcp::run(server).await.unwrap();
        });

        info!("spawned app {addr}");

        let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        socket.connect(addr).await.unwrap();

        Self { socket }
    }

    async fn send(&self, datagram: &[u8]) {
        self.socket.send(datagram).await.unwrap();
    }

    async fn recv(&self) -> Vec<u8> {
        let mut buffer = [0; 1024];
        let len = timeout(TIMEOUT, self.socket.recv(&mut buffer))
            .await
            .unwrap()
            .unwrap();

        buffer[..len].to_vec()
    }

    async fn expect(&self, datagram: &[u8]) {
        let received = self.recv().await;
        assert_eq!(
            String::from_utf8_lossy(datagram),
            String::from_utf8_lossy(&received)
        );
    }
}

#[tokio::test]
async fn test_session() {
    let client = Client::connect().await;

    client.send(b"/connect/12345/").await;
    client.expect(b"/ack/12345/0/").await;

    client.send(b"/data/12345/0/hello\n/").await;
    client.expect(b"/ack/12345/6/").await;
    client.expect(b"/data/12345/0/olleh\n/").await;
    client.send(b"/ack/12345/6/").await;

    client.send(b"/close/12345/").await;
    client.expect(b"/close/12345/").await;
}

#[tokio::test]
async fn test_duplicate_data_is_acked_but_not_reapplied() {
    let client = Client::connect().await;

    client.send(b"/connect/12345/").await;
    client.expect(b"/ack/12345/0/").await;

    client.send(b"/data/12345/0/hello\n/").await;
    client.expect(b"/ack/12345/6/").await;
    client.expect(b"/data/12345/0/olleh\n/").await;
    client.send(b"/ack/12345/6/").await;

    // Same prefix again: same cumulative ack, no second reversal.
    client.send(b"/data/12345/0/hello\n/").await;
    client.expect(b"/ack/12345/6/").await;

    client.send(b"/data/12345/6/world\n/").await;
    client.expect(b"/ack/12345/12/").await;
    client.expect(b"/data/12345/6/dlrow\n/").await;
}

#[tokio::test]
async fn test_escaped_slash() {
    let client = Client::connect().await;

    client.send(b"/connect/1234568/").await;
    client.expect(b"/ack/1234568/0/").await;

    client.send(b"/data/1234568/0/\\//").await;
    client.expect(b"/ack/1234568/1/").await;
}

#[tokio::test]
async fn test_unescaped_slash_is_dropped_silently() {
    let client = Client::connect().await;

    client.send(b"/connect/5/").await;
    client.expect(b"/ack/5/0/").await;

    client.send(b"/data/5/0/foo/bar/").await;

    // No ack for the invalid packet; the next valid one is handled.
    client.send(b"/data/5/0/hi\n/").await;
    client.expect(b"/ack/5/3/").await;
}

#[tokio::test]
async fn test_duplicate_connect_reports_progress() {
    let client = Client::connect().await;

    client.send(b"/connect/99/").await;
    client.expect(b"/ack/99/0/").await;

    client.send(b"/data/99/0/abc/").await;
    client.expect(b"/ack/99/3/").await;

    client.send(b"/connect/99/").await;
    client.expect(b"/ack/99/3/").await;
}

#[tokio::test]
async fn test_unknown_session_gets_close() {
    let client = Client::connect().await;

    client.send(b"/data/404/0/hello\n/").await;
    client.expect(b"/close/404/").await;

    client.send(b"/ack/404/0/").await;
    client.expect(b"/close/404/").await;

    client.send(b"/close/404/").await;
    client.expect(b"/close/404/").await;
}

#[tokio::test]
async fn test_partial_ack_triggers_retransmit() {
    let client = Client::connect().await;

    client.send(b"/connect/31337/").await;
    client.expect(b"/ack/31337/0/").await;

    client.send(b"/data/31337/0/hello\n/").await;
    client.expect(b"/ack/31337/6/").await;
    client.expect(b"/data/31337/0/olleh\n/").await;

    // Pretend only two bytes arrived; the tail comes back immediately.
    client.send(b"/ack/31337/2/").await;
    client.expect(b"/data/31337/2/leh\n/").await;
}

#[tokio::test]
async fn test_lying_ack_closes_session() {
    let client = Client::connect().await;

    client.send(b"/connect/8/").await;
    client.expect(b"/ack/8/0/").await;

    client.send(b"/ack/8/10000/").await;
    client.expect(b"/close/8/").await;

    // The session is really gone.
    client.send(b"/data/8/0/x/").await;
    client.expect(b"/close/8/").await;
}

#[tokio::test]
async fn test_long_line_spans_many_packets() {
    let client = Client::connect().await;

    client.send(b"/connect/2/").await;
    client.expect(b"/ack/2/0/").await;

    // Feed a 2700-byte line in three 900-byte data packets, then the
    // newline; expect the reversal to come back chunked.
    let line: Vec<u8> = {
        use rand::Rng;
        let mut rng = rand::thread_rng();
        (0..2700)
            .map(|_| rng.gen_range(b'a'..=b'z'))
            .collect()
    };

    for (i, chunk) in line.chunks(900).enumerate() {
        let mut datagram = format!("/data/2/{}/", i * 900).into_bytes();
        datagram.extend_from_slice(chunk);
        datagram.push(b'/');
        client.send(&datagram).await;
        client
            .expect(format!("/ack/2/{}/", (i + 1) * 900).as_bytes())
            .await;
    }

    client.send(b"/data/2/2700/\n/").await;
    client.expect(b"/ack/2/2701/").await;

    let mut received: Vec<u8> = vec![];
    while received.len() < 2701 {
        let datagram = client.recv().await;
        let Ok(lrcp::packet::Packet::Data { pos, data, .. }) =
            lrcp::packet::Packet::try_from(datagram.as_slice())
        else {
            panic!("expected a data packet");
        };

        if pos as usize != received.len() {
            // Stale retransmission; the cumulative ack below resyncs.
            continue;
        }
        received.extend_from_slice(&data);
        client
            .send(format!("/ack/2/{}/", received.len()).as_bytes())
            .await;
    }

    let mut expected: Vec<u8> = line.iter().rev().copied().collect();
    expected.push(b'\n');
    assert_eq!(expected, received);
}
