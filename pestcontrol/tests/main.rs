use std::time::Duration;

use futures::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::time::timeout;
use tokio_util::codec::Framed;

use pestcontrol::codec::{Action, Observation, Packet, PacketCodec, Target};

const TIMEOUT: Duration = Duration::from_millis(2000);

fn init_tracing_subscriber() {
    static TRACING_SUBSCRIBER_INIT: parking_lot::Once = parking_lot::Once::new();
    TRACING_SUBSCRIBER_INIT.call_once(tracing_subscriber::fmt::init);
}

async fn recv(framed: &mut Framed<TcpStream, PacketCodec>) -> Packet {
    timeout(TIMEOUT, framed.next())
        .await
        .unwrap()
        .unwrap()
        .unwrap()
}

/// A scripted authority for site 42: one targeted species, rats,
/// wanted between 10 and 20.
async fn spawn_authority() -> (std::net::SocketAddr, tokio::task::JoinHandle<Vec<Packet>>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    let script = tokio::spawn(async move {
        let (socket, _) = listener.accept().await.unwrap();
        let mut framed = Framed::new(socket, PacketCodec::new());
        let mut seen = vec![];

        framed.send(Packet::hello()).await.unwrap();
        assert_eq!(Packet::hello(), recv(&mut framed).await);

        assert_eq!(Packet::DialAuthority { site: 42 }, recv(&mut framed).await);
        framed
            .send(Packet::TargetPopulations {
                site: 42,
                populations: vec![Target {
                    species: "long-tailed rat".to_string(),
                    min: 10,
                    max: 20,
                }],
            })
            .await
            .unwrap();

        loop {
            let packet = recv(&mut framed).await;
            seen.push(packet.clone());

            match packet {
                Packet::CreatePolicy { .. } => {
                    framed
                        .send(Packet::PolicyResult {
                            policy: u32::try_from(seen.len()).unwrap(),
                        })
                        .await
                        .unwrap();
                }
                Packet::DeletePolicy { .. } => {
                    framed.send(Packet::Ok).await.unwrap();
                }
                _ => panic!("authority got unexpected {packet:?}"),
            }

            if seen.len() == 3 {
                return seen;
            }
        }
    });

    (addr, script)
}

async fn spawn_app(authority: std::net::SocketAddr) -> std::net::SocketAddr {
    init_tracing_subscriber();

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    tokio::spawn(async move {
        pestcontrol::run(listener, authority.to_string()).await.unwrap();
    });

    addr
}

fn visit(site: u32, count: u32) -> Packet {
    Packet::SiteVisit {
        site,
        populations: vec![Observation {
            species: "long-tailed rat".to_string(),
            count,
        }],
    }
}

#[tokio::test]
async fn test_policies_follow_observations() {
    let (authority_addr, script) = spawn_authority().await;
    let addr = spawn_app(authority_addr).await;

    let socket = TcpStream::connect(addr).await.unwrap();
    let mut client = Framed::new(socket, PacketCodec::new());

    assert_eq!(Packet::hello(), recv(&mut client).await);
    client.send(Packet::hello()).await.unwrap();

    // Too few rats: conserve. Back in range: delete. Too many: cull.
    client.send(visit(42, 5)).await.unwrap();
    client.send(visit(42, 15)).await.unwrap();
    client.send(visit(42, 25)).await.unwrap();

    let seen = script.await.unwrap();
    assert_eq!(
        vec![
            Packet::CreatePolicy {
                species: "long-tailed rat".to_string(),
                action: Action::Conserve,
            },
            Packet::DeletePolicy { policy: 1 },
            Packet::CreatePolicy {
                species: "long-tailed rat".to_string(),
                action: Action::Cull,
            },
        ],
        seen
    );
}

#[tokio::test]
async fn test_conflicting_counts_get_an_error() {
    let (authority_addr, _script) = spawn_authority().await;
    let addr = spawn_app(authority_addr).await;

    let socket = TcpStream::connect(addr).await.unwrap();
    let mut client = Framed::new(socket, PacketCodec::new());

    assert_eq!(Packet::hello(), recv(&mut client).await);
    client.send(Packet::hello()).await.unwrap();

    client
        .send(Packet::SiteVisit {
            site: 7,
            populations: vec![
                Observation {
                    species: "dodo".to_string(),
                    count: 1,
                },
                Observation {
                    species: "dodo".to_string(),
                    count: 2,
                },
            ],
        })
        .await
        .unwrap();

    let Packet::Error { message } = recv(&mut client).await else {
        panic!("expected an error packet");
    };
    assert!(message.contains("dodo"));
}
