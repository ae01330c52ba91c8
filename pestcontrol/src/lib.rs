//! Pest control: population observations in, cull/conserve policies
//! out.
//!
//! Field clients connect, exchange `Hello`s, and stream `SiteVisit`
//! packets (see [`codec`] for the checksummed binary framing). For
//! every site the server keeps one worker with a persistent
//! connection to that site's authority: the worker dials the
//! authority, learns the site's target population ranges, and then
//! reconciles each visit against them - creating a conserve policy
//! when a species is under target, a cull policy when it is over, and
//! deleting a stale policy before replacing it. The worker caches
//! policy ids so the authority never holds two policies for one
//! species.
//!
//! A visit reporting two different counts for the same species is
//! answered with an `Error` packet; the connection survives.

use std::collections::HashMap;
use std::sync::Arc;

use futures::{SinkExt, StreamExt};
use parking_lot::Mutex;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_util::codec::Framed;

use tracing::{debug, info, warn};

use netframe::supervisor;

pub mod codec;
pub mod policy;

use codec::{Observation, Packet, PacketCodec};
use policy::{Policy, Reconciliation};

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("expected {expected}, got {got:?}")]
    UnexpectedPacket {
        expected: &'static str,
        got: Packet,
    },

    #[error("unsupported protocol {protocol:?} version {version}")]
    BadHello { protocol: String, version: u32 },

    #[error("conflicting counts for species {0:?}")]
    ConflictingCounts(String),

    #[error("authority is for site {got}, dialled {wanted}")]
    WrongSite { wanted: u32, got: u32 },

    #[error("connection closed mid-handshake")]
    Disconnected,

    #[error(transparent)]
    Codec(#[from] codec::Error),
}

/// One observation channel per site, each owning an authority
/// connection.
struct Sites {
    authority_addr: String,
    workers: Mutex<HashMap<u32, mpsc::UnboundedSender<Vec<Observation>>>>,
}

impl Sites {
    fn observe(self: &Arc<Self>, site: u32, populations: Vec<Observation>) {
        let mut workers = self.workers.lock();
        let sender = workers.entry(site).or_insert_with(|| {
            let (sender, receiver) = mpsc::unbounded_channel();
            let authority_addr = self.authority_addr.clone();

            tokio::spawn(async move {
                if let Err(err) = site_worker(site, authority_addr, receiver).await {
                    warn!("site {site} worker failed: {err}");
                }
            });

            sender
        });

        sender.send(populations).ok();
    }
}

/// Run the main loop.
///
/// `authority_addr` is the host:port of the authority server every
/// site worker dials.
///
/// # Errors
/// * Error when the socket returns an error.
#[tracing::instrument(skip(listener))]
pub async fn run(listener: TcpListener, authority_addr: String) -> Result<(), anyhow::Error> {
    let sites = Arc::new(Sites {
        authority_addr,
        workers: Mutex::new(HashMap::new()),
    });

    let (_shutdown, signal) = supervisor::shutdown();
    supervisor::serve(listener, signal, move |socket, _addr| {
        handle_client(socket, sites.clone())
    })
    .await?;

    Ok(())
}

#[tracing::instrument(skip(socket, sites))]
async fn handle_client(socket: TcpStream, sites: Arc<Sites>) {
    let mut framed = Framed::new(socket, PacketCodec::new());

    let session = async {
        framed.send(Packet::hello()).await?;
        expect_hello(&mut framed).await?;

        loop {
            let Some(packet) = framed.next().await else {
                return Ok(());
            };

            match packet? {
                Packet::SiteVisit { site, populations } => {
                    match dedupe(populations) {
                        Ok(populations) => {
                            info!("site {site} visit: {} species", populations.len());
                            sites.observe(site, populations);
                        }
                        Err(err) => {
                            warn!("bad visit for site {site}: {err}");
                            framed
                                .send(Packet::Error {
                                    message: err.to_string(),
                                })
                                .await?;
                        }
                    }
                }
                packet => {
                    return Err(Error::UnexpectedPacket {
                        expected: "SiteVisit",
                        got: packet,
                    });
                }
            }
        }
    };

    let session: Result<(), Error> = session.await;
    if let Err(err) = session {
        warn!("session ended: {err}");
        framed
            .send(Packet::Error {
                message: err.to_string(),
            })
            .await
            .ok();
    }
}

/// A visit may legally repeat a species with the same count; two
/// different counts are an error.
fn dedupe(populations: Vec<Observation>) -> Result<Vec<Observation>, Error> {
    let mut seen: HashMap<String, u32> = HashMap::new();
    let mut deduped = vec![];

    for observation in populations {
        match seen.get(&observation.species) {
            Some(&count) if count != observation.count => {
                return Err(Error::ConflictingCounts(observation.species));
            }
            Some(_) => {}
            None => {
                seen.insert(observation.species.clone(), observation.count);
                deduped.push(observation);
            }
        }
    }

    Ok(deduped)
}

async fn expect_hello(framed: &mut Framed<TcpStream, PacketCodec>) -> Result<(), Error> {
    match framed.next().await.ok_or(Error::Disconnected)?? {
        Packet::Hello { protocol, version } => {
            if protocol != "pestcontrol" || version != 1 {
                return Err(Error::BadHello { protocol, version });
            }
            Ok(())
        }
        packet => Err(Error::UnexpectedPacket {
            expected: "Hello",
            got: packet,
        }),
    }
}

/// The per-site worker: owns the authority connection and the policy
/// cache, and applies visits in arrival order.
#[tracing::instrument(skip(authority_addr, observations))]
async fn site_worker(
    site: u32,
    authority_addr: String,
    mut observations: mpsc::UnboundedReceiver<Vec<Observation>>,
) -> Result<(), Error> {
    let socket = TcpStream::connect(&authority_addr)
        .await
        .map_err(codec::Error::from)?;
    let mut authority = Framed::new(socket, PacketCodec::new());

    authority.send(Packet::hello()).await?;
    expect_hello(&mut authority).await?;

    authority.send(Packet::DialAuthority { site }).await?;
    let targets = match authority.next().await.ok_or(Error::Disconnected)?? {
        Packet::TargetPopulations {
            site: target_site,
            populations,
        } => {
            if target_site != site {
                return Err(Error::WrongSite {
                    wanted: site,
                    got: target_site,
                });
            }
            populations
        }
        packet => {
            return Err(Error::UnexpectedPacket {
                expected: "TargetPopulations",
                got: packet,
            });
        }
    };

    info!("site {site}: {} targeted species", targets.len());

    let mut policies: HashMap<String, Policy> = HashMap::new();

    while let Some(populations) = observations.recv().await {
        let counts: HashMap<&str, u32> = populations
            .iter()
            .map(|observation| (observation.species.as_str(), observation.count))
            .collect();

        for target in &targets {
            // Species the visit did not mention count as zero.
            let count = counts.get(target.species.as_str()).copied().unwrap_or(0);

            let Reconciliation { delete, create } =
                policy::reconcile(policies.get(&target.species).copied(), count, target);

            if let Some(policy) = delete {
                authority.send(Packet::DeletePolicy { policy }).await?;
                match authority.next().await.ok_or(Error::Disconnected)?? {
                    Packet::Ok => {}
                    packet => {
                        return Err(Error::UnexpectedPacket {
                            expected: "Ok",
                            got: packet,
                        });
                    }
                }

                policies.remove(&target.species);
                debug!("site {site}: deleted policy {policy} for {}", target.species);
            }

            if let Some(action) = create {
                authority
                    .send(Packet::CreatePolicy {
                        species: target.species.clone(),
                        action,
                    })
                    .await?;
                let policy = match authority.next().await.ok_or(Error::Disconnected)?? {
                    Packet::PolicyResult { policy } => policy,
                    packet => {
                        return Err(Error::UnexpectedPacket {
                            expected: "PolicyResult",
                            got: packet,
                        });
                    }
                };

                policies.insert(target.species.clone(), Policy { action, id: policy });
                info!(
                    "site {site}: {:?} policy {policy} for {}",
                    action, target.species
                );
            }
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dedupe() {
        let visit = vec![
            Observation {
                species: "rat".to_string(),
                count: 10,
            },
            Observation {
                species: "rat".to_string(),
                count: 10,
            },
        ];
        assert_eq!(1, dedupe(visit).unwrap().len());

        let visit = vec![
            Observation {
                species: "rat".to_string(),
                count: 10,
            },
            Observation {
                species: "rat".to_string(),
                count: 11,
            },
        ];
        assert!(matches!(dedupe(visit), Err(Error::ConflictingCounts(_))));
    }
}
