//! The road registry: cameras, observations, pending tickets, and the
//! one-ticket-per-day bookkeeping.
//!
//! The registry runs as a single actor task fed by [`Command`]s, so
//! the whole observe-check-dispatch sequence for a plate is serialized:
//! two cameras reporting the same car concurrently cannot both win the
//! race to ticket it for the same day.

use std::collections::{HashMap, HashSet, VecDeque};

use tokio::sync::{mpsc, oneshot};

use tracing::{debug, info, warn};

use crate::wire::Ticket;

const SECONDS_PER_DAY: u32 = 86_400;

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum RegistryError {
    #[error("camera limit conflicts with road limit")]
    LimitConflict,
}

pub enum Command {
    RegisterCamera {
        road: u16,
        limit: u16,
        reply: oneshot::Sender<Result<(), RegistryError>>,
    },
    Plate {
        road: u16,
        mile: u16,
        plate: String,
        timestamp: u32,
    },
    AddDispatcher {
        id: usize,
        roads: Vec<u16>,
        sender: mpsc::UnboundedSender<Ticket>,
    },
    RemoveDispatcher {
        id: usize,
    },
}

#[derive(Default)]
struct Road {
    limit: u16,
    /// Latest observation timestamp per plate, per camera location.
    cameras: HashMap<u16, HashMap<String, u32>>,
    /// Tickets awaiting a dispatcher for this road, oldest first.
    pending: VecDeque<Ticket>,
}

struct Dispatcher {
    id: usize,
    roads: HashSet<u16>,
    sender: mpsc::UnboundedSender<Ticket>,
}

#[derive(Default)]
pub struct Registry {
    roads: HashMap<u16, Road>,
    dispatchers: Vec<Dispatcher>,
    /// Calendar days (floor(ts / 86400)) already ticketed, per plate,
    /// across all roads.
    ticketed_days: HashMap<String, HashSet<u32>>,
}

/// Spawns the registry actor and returns its command channel.
#[must_use]
pub fn spawn() -> mpsc::UnboundedSender<Command> {
    let (sender, mut receiver) = mpsc::unbounded_channel();

    tokio::spawn(async move {
        let mut registry = Registry::default();
        while let Some(command) = receiver.recv().await {
            registry.handle(command);
        }
    });

    sender
}

impl Registry {
    pub fn handle(&mut self, command: Command) {
        match command {
            Command::RegisterCamera { road, limit, reply } => {
                reply.send(self.register_camera(road, limit)).ok();
            }
            Command::Plate {
                road,
                mile,
                plate,
                timestamp,
            } => {
                self.observe(road, mile, plate, timestamp);
            }
            Command::AddDispatcher { id, roads, sender } => {
                debug!("adding dispatcher {id} for roads {roads:?}");
                self.dispatchers.push(Dispatcher {
                    id,
                    roads: roads.into_iter().collect(),
                    sender,
                });
                self.drain_pending();
            }
            Command::RemoveDispatcher { id } => {
                debug!("removing dispatcher {id}");
                self.dispatchers.retain(|dispatcher| dispatcher.id != id);
            }
        }
    }

    fn register_camera(&mut self, road: u16, limit: u16) -> Result<(), RegistryError> {
        let road = self.roads.entry(road).or_insert_with(|| Road {
            limit,
            ..Road::default()
        });

        if road.limit != limit {
            return Err(RegistryError::LimitConflict);
        }

        Ok(())
    }

    fn observe(&mut self, road_id: u16, mile: u16, plate: String, timestamp: u32) {
        let Some(road) = self.roads.get_mut(&road_id) else {
            warn!("plate report for unregistered road {road_id}");
            return;
        };

        road.cameras
            .entry(mile)
            .or_default()
            .insert(plate.clone(), timestamp);

        // All current observations of this plate on this road.
        let observations: Vec<(u16, u32)> = road
            .cameras
            .iter()
            .filter_map(|(mile, seen)| seen.get(&plate).map(|ts| (*mile, *ts)))
            .collect();

        let limit = road.limit;
        let mut tickets = vec![];
        for &(mile1, ts1) in &observations {
            for &(mile2, ts2) in &observations {
                if ts1 >= ts2 {
                    continue;
                }

                let Some(speed) = average_speed(mile1, mile2, ts1, ts2) else {
                    continue;
                };

                if whole_mph(speed) <= u32::from(limit) {
                    continue;
                }

                if self.already_ticketed(&plate, ts1, ts2) {
                    info!("{plate} already ticketed in [{ts1}, {ts2}], suppressing");
                    continue;
                }

                self.mark_ticketed(&plate, ts1, ts2);
                tickets.push(Ticket {
                    plate: plate.clone(),
                    road: road_id,
                    mile1,
                    timestamp1: ts1,
                    mile2,
                    timestamp2: ts2,
                    speed,
                });
            }
        }

        for ticket in tickets {
            self.dispatch(ticket);
        }
    }

    fn dispatch(&mut self, ticket: Ticket) {
        let covering = self
            .dispatchers
            .iter()
            .find(|dispatcher| dispatcher.roads.contains(&ticket.road));

        if let Some(dispatcher) = covering {
            info!("dispatching ticket for {} to {}", ticket.plate, dispatcher.id);
            dispatcher.sender.send(ticket).ok();
        } else {
            info!("no dispatcher for road {}, holding ticket", ticket.road);
            self.roads
                .entry(ticket.road)
                .or_default()
                .pending
                .push_back(ticket);
        }
    }

    fn drain_pending(&mut self) {
        let covered: HashSet<u16> = self
            .dispatchers
            .iter()
            .flat_map(|dispatcher| dispatcher.roads.iter().copied())
            .collect();

        for (&road_id, road) in &mut self.roads {
            if !covered.contains(&road_id) {
                continue;
            }

            while let Some(ticket) = road.pending.pop_front() {
                if let Some(dispatcher) = self
                    .dispatchers
                    .iter()
                    .find(|dispatcher| dispatcher.roads.contains(&road_id))
                {
                    dispatcher.sender.send(ticket).ok();
                }
            }
        }
    }

    fn already_ticketed(&self, plate: &str, ts1: u32, ts2: u32) -> bool {
        self.ticketed_days.get(plate).is_some_and(|days| {
            (ts1 / SECONDS_PER_DAY..=ts2 / SECONDS_PER_DAY).any(|day| days.contains(&day))
        })
    }

    fn mark_ticketed(&mut self, plate: &str, ts1: u32, ts2: u32) {
        let days = self.ticketed_days.entry(plate.to_string()).or_default();
        for day in ts1 / SECONDS_PER_DAY..=ts2 / SECONDS_PER_DAY {
            days.insert(day);
        }
    }
}

/// Average speed in hundredths of a mile per hour, or `None` when the
/// value does not fit the wire encoding.
fn average_speed(mile1: u16, mile2: u16, ts1: u32, ts2: u32) -> Option<u16> {
    let distance = f64::from(mile1.abs_diff(mile2));
    let hours = f64::from(ts2 - ts1) / 3600.0;

    let speed = (distance / hours * 100.0).round();
    if speed > f64::from(u16::MAX) {
        return None;
    }

    #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
    let speed = speed as u16;

    Some(speed)
}

fn whole_mph(speed: u16) -> u32 {
    // Round half up, matching the wire encoding's rounding.
    (u32::from(speed) + 50) / 100
}
