use std::sync::Arc;

use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};

fn init_tracing_subscriber() {
    static TRACING_SUBSCRIBER_INIT: std::sync::Once = std::sync::Once::new();
    TRACING_SUBSCRIBER_INIT.call_once(tracing_subscriber::fmt::init);
}

async fn spawn_app() -> std::net::SocketAddr {
    init_tracing_subscriber();

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    let storage = Arc::new(vcs::storage::Storage::new());
    tokio::spawn(async move {
        loop {
            let (socket, _) = listener.accept().await.unwrap();
            tokio::spawn(vcs::handle_client(socket, storage.clone()));
        }
    });

    addr
}

struct Client {
    stream: BufReader<TcpStream>,
}

impl Client {
    async fn connect(addr: std::net::SocketAddr) -> Self {
        let mut client = Self {
            stream: BufReader::new(TcpStream::connect(addr).await.unwrap()),
        };
        assert_eq!("READY\n", client.line().await);

        client
    }

    async fn send(&mut self, data: &[u8]) {
        self.stream.get_mut().write_all(data).await.unwrap();
    }

    async fn line(&mut self) -> String {
        let mut line = String::new();
        self.stream.read_line(&mut line).await.unwrap();
        line
    }

    async fn exact(&mut self, n: usize) -> Vec<u8> {
        let mut data = vec![0; n];
        self.stream.read_exact(&mut data).await.unwrap();
        data
    }
}

#[tokio::test]
async fn test_put_get_list_session() {
    let addr = spawn_app().await;
    let mut client = Client::connect(addr).await;

    // The payload rides the same stream as the command line.
    client.send(b"PUT /src/main.rs 12\nfn main() {}").await;
    assert_eq!("OK r1\n", client.line().await);
    assert_eq!("READY\n", client.line().await);

    client.send(b"GET /src/main.rs\n").await;
    assert_eq!("OK 12\n", client.line().await);
    assert_eq!(b"fn main() {}".to_vec(), client.exact(12).await);
    assert_eq!("READY\n", client.line().await);

    client.send(b"PUT /src/main.rs 3\nhi\n").await;
    assert_eq!("OK r2\n", client.line().await);
    assert_eq!("READY\n", client.line().await);

    // Old revisions stay addressable, with or without the r prefix.
    client.send(b"GET /src/main.rs r1\n").await;
    assert_eq!("OK 12\n", client.line().await);
    client.exact(12).await;
    assert_eq!("READY\n", client.line().await);

    client.send(b"PUT /src/lib.rs 5\nlibs\n").await;
    assert_eq!("OK r1\n", client.line().await);
    assert_eq!("READY\n", client.line().await);

    client.send(b"LIST /src\n").await;
    assert_eq!("OK 2\n", client.line().await);
    assert_eq!("lib.rs r1\n", client.line().await);
    assert_eq!("main.rs r2\n", client.line().await);
    assert_eq!("READY\n", client.line().await);

    client.send(b"LIST /\n").await;
    assert_eq!("OK 1\n", client.line().await);
    assert_eq!("src/ DIR\n", client.line().await);
    assert_eq!("READY\n", client.line().await);
}

#[tokio::test]
async fn test_identical_put_keeps_revision() {
    let addr = spawn_app().await;
    let mut client = Client::connect(addr).await;

    client.send(b"PUT /a 4\nsame").await;
    assert_eq!("OK r1\n", client.line().await);
    assert_eq!("READY\n", client.line().await);

    client.send(b"PUT /a 4\nsame").await;
    assert_eq!("OK r1\n", client.line().await);
    assert_eq!("READY\n", client.line().await);
}

#[tokio::test]
async fn test_errors_keep_session_alive() {
    let addr = spawn_app().await;
    let mut client = Client::connect(addr).await;

    client.send(b"GET /nope\n").await;
    assert_eq!("ERR file does not exist\n", client.line().await);
    assert_eq!("READY\n", client.line().await);

    client.send(b"PUT nope 2\nxx").await;
    assert_eq!("ERR illegal file name\n", client.line().await);
    assert_eq!("READY\n", client.line().await);

    // Binary content is refused, but the payload was consumed: the
    // session keeps going.
    client.send(b"PUT /bin 2\n\x00\x01").await;
    assert_eq!("ERR text files only\n", client.line().await);
    assert_eq!("READY\n", client.line().await);

    client.send(b"HELP\n").await;
    assert_eq!("OK usage: HELP|GET|PUT|LIST\n", client.line().await);
    assert_eq!("READY\n", client.line().await);
}

#[tokio::test]
async fn test_unknown_method_is_fatal() {
    let addr = spawn_app().await;
    let mut client = Client::connect(addr).await;

    client.send(b"FROBNICATE /x\n").await;
    assert_eq!("ERR illegal method: FROBNICATE\n", client.line().await);

    let mut rest = vec![];
    client.stream.read_to_end(&mut rest).await.unwrap();
    assert!(rest.is_empty());
}
