//! Pairing and forwarding engine.
//!
//! Consumes events from the [`SocketMux`], keeps the pairing tables, and
//! pushes forwarded bytes back down. Single-threaded: one iteration handles
//! signals, readiness, disconnections, new connections, driver publication,
//! data forwarding, and idle reaping, in that fixed order.
//!
//! # Pairing
//!
//! A peer arriving on one side either matches the oldest waiting peer of the
//! other side (FIFO) or joins its own side's waiting queue, *frozen* so the
//! multiplexer reads nothing from a peer whose bytes have nowhere to go.
//! Matching unfreezes the waiting peer; from then on the two sockets are a
//! transparent bidirectional splice until either end disconnects, which
//! tears down both.
//!
//! # Drivers
//!
//! Observers on the optional driver port receive the unmet-demand count as
//! ASCII decimal lines: the current total on connect, the per-iteration delta
//! whenever new demand queues up, and (when a period is configured) the
//! total again every period while nothing else fires. Whatever a driver
//! sends is discarded.

use std::collections::{HashMap, VecDeque};

use anyhow::{bail, Context, Result};
use signal_hook::consts::signal::{SIGALRM, SIGINT, SIGQUIT, SIGTERM};

use crate::clock;
use crate::config::Config;
use crate::logger;
use crate::signals::{self, SignalBridge};
use crate::sockets::{Descriptor, SocketMux};

/// Which service port a peer arrived on.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum Side {
    Supply,
    Demand,
}

impl Side {
    fn other(self) -> Self {
        match self {
            Side::Supply => Side::Demand,
            Side::Demand => Side::Supply,
        }
    }
}

/// Engine-side state of one tracked descriptor.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
enum Session {
    /// In a waiting queue, frozen, no partner yet.
    Waiting(Side),
    /// Spliced to `peer`.
    Paired { side: Side, peer: Descriptor },
    /// Partner is being torn down; this descriptor's own disconnect is
    /// already in flight.
    Widowed(Side),
    /// Subscriber on the driver port.
    Driver,
}

/// The broker: listeners, pairing tables, and the event loop.
pub struct Broker {
    config: Config,
    mux: SocketMux,
    signals: SignalBridge,

    sessions: HashMap<Descriptor, Session>,
    waiting_supply: VecDeque<Descriptor>,
    waiting_demand: VecDeque<Descriptor>,
    last_activity: HashMap<Descriptor, i64>,

    supply_listener: Option<Descriptor>,
    demand_listener: Option<Descriptor>,
    driver_listener: Option<Descriptor>,

    terminated: bool,
    shutdown_started: bool,
    buffer: Vec<u8>,
}

impl Broker {
    /// Create an engine for `config` and install the signal handlers.
    ///
    /// # Errors
    ///
    /// Returns an error if a signal handler cannot be installed.
    pub fn new(config: Config) -> Result<Self> {
        Ok(Self {
            config,
            mux: SocketMux::new(),
            signals: SignalBridge::install().context("install signal handlers")?,
            sessions: HashMap::new(),
            waiting_supply: VecDeque::new(),
            waiting_demand: VecDeque::new(),
            last_activity: HashMap::new(),
            supply_listener: None,
            demand_listener: None,
            driver_listener: None,
            terminated: false,
            shutdown_started: false,
            buffer: Vec::new(),
        })
    }

    /// Bind the listening sockets and announce them.
    ///
    /// The driver listener is optional twice over: a zero port disables it,
    /// and a bind failure (already logged) leaves the broker running without
    /// one rather than aborting.
    ///
    /// # Errors
    ///
    /// Returns an error when the supply or demand port cannot be bound.
    pub fn bind(&mut self) -> Result<()> {
        self.supply_listener = self.mux.listen(self.config.supply_port);
        self.demand_listener = self.mux.listen(self.config.demand_port);
        self.driver_listener = match self.config.driver_port {
            0 => None,
            port => self.mux.listen(port),
        };

        let (Some(supply), Some(demand)) = (self.supply_listener, self.demand_listener) else {
            bail!("could not bind the service ports");
        };

        logger::enable_timestamps();

        let supply_port = self.mux.local_port(supply).unwrap_or(self.config.supply_port);
        let demand_port = self.mux.local_port(demand).unwrap_or(self.config.demand_port);
        match self.driver_listener.and_then(|d| self.mux.local_port(d)) {
            Some(driver_port) => {
                log::info!("Listening on ports {supply_port}, {demand_port} and {driver_port}...");
            }
            None => log::info!("Listening on ports {supply_port} and {demand_port}..."),
        }
        Ok(())
    }

    /// The resolved (supply, demand, driver) ports after [`bind`].
    ///
    /// [`bind`]: Broker::bind
    pub fn ports(&self) -> (u16, u16, Option<u16>) {
        let port = |d: Option<Descriptor>| d.and_then(|d| self.mux.local_port(d));
        (
            port(self.supply_listener).unwrap_or(0),
            port(self.demand_listener).unwrap_or(0),
            port(self.driver_listener),
        )
    }

    /// Run the event loop until a terminating signal has been served.
    ///
    /// Binds first if [`bind`] has not been called. Returns `Ok` on clean
    /// shutdown; an error on bind failure or unrecoverable polling failure.
    ///
    /// [`bind`]: Broker::bind
    pub fn run(&mut self) -> Result<()> {
        if self.config.exit_flag {
            return Ok(());
        }
        if self.supply_listener.is_none() {
            self.bind()?;
        }

        clock::arm_alarm();
        let mut failed = false;
        loop {
            if !self.run_iteration() {
                failed = true;
                break;
            }
            if self.terminated && self.mux.is_drained() {
                break;
            }
        }
        clock::cancel_alarm();

        if failed {
            bail!("error while serving the listening descriptors");
        }
        Ok(())
    }

    /// One full pass of the iteration protocol. Returns `false` when the
    /// polling subsystem failed and the loop must abort.
    fn run_iteration(&mut self) -> bool {
        // Signal intake: drain the latched flags with every signal blocked so
        // no handler interleaves, then rearm the timer if a tick was seen.
        let mut alarmed = false;
        self.signals.block();
        loop {
            let sig = self.signals.next();
            if sig == 0 {
                break;
            }
            if sig == SIGALRM {
                alarmed = true;
                continue;
            }
            if matches!(sig, SIGINT | SIGTERM | SIGQUIT) {
                self.terminated = true;
            }
            logger::newline();
            log::info!("Caught signal {} ({}).", sig, signals::name(sig));
        }
        if alarmed {
            clock::arm_alarm();
        }
        self.signals.unblock();

        // Shutdown: close the listeners once; the multiplexer cascades the
        // close to every accepted descriptor and the following iterations
        // drain the resulting disconnections through the normal path.
        if self.terminated && !self.shutdown_started {
            self.shutdown_started = true;
            self.mux.disconnect_opt(self.supply_listener);
            self.mux.disconnect_opt(self.demand_listener);
            self.mux.disconnect_opt(self.driver_listener);
            return true;
        }

        if !alarmed && !self.mux.serve() {
            log::error!("Error while serving the listening descriptors.");
            self.terminated = true;
            return false;
        }

        let timestamp = clock::unix_now();

        self.drain_disconnections();
        let (new_demand, published) = self.drain_connections(timestamp);
        self.publish_to_drivers(alarmed, timestamp, new_demand, &published);
        self.drain_incoming(timestamp);
        if alarmed {
            self.reap_idle(timestamp);
        }

        true
    }

    /// Remove disconnected descriptors from the tables and cascade the
    /// teardown to a paired partner.
    fn drain_disconnections(&mut self) {
        while let Some(d) = self.mux.next_disconnection() {
            log::info!(
                "Disconnected {}:{} (descriptor {}).",
                self.mux.get_host(d).unwrap_or("?"),
                self.mux.get_port(d).unwrap_or("?"),
                d
            );

            self.last_activity.remove(&d);

            match self.sessions.remove(&d) {
                Some(Session::Paired { peer, .. }) => {
                    // Flag the partner so its own disconnection, arriving
                    // next, does not chase a stale peer.
                    if let Some(session) = self.sessions.get_mut(&peer) {
                        if let Session::Paired { side, .. } = *session {
                            *session = Session::Widowed(side);
                        }
                    }
                    self.mux.disconnect(peer);
                }
                Some(Session::Waiting(Side::Supply)) => {
                    self.waiting_supply.retain(|&q| q != d);
                }
                Some(Session::Waiting(Side::Demand)) => {
                    self.waiting_demand.retain(|&q| q != d);
                }
                Some(Session::Widowed(_)) | Some(Session::Driver) | None => {}
            }
        }
    }

    /// Classify and place newly accepted descriptors.
    ///
    /// Returns the count of demand peers that had to queue (the delta
    /// published to drivers) and the drivers that already received their
    /// initial count this iteration.
    fn drain_connections(&mut self, timestamp: i64) -> (usize, Vec<Descriptor>) {
        let mut new_demand = 0usize;
        let mut published = Vec::new();

        while let Some(d) = self.mux.next_connection() {
            log::info!(
                "New connection from {}:{} (descriptor {}).",
                self.mux.get_host(d).unwrap_or("?"),
                self.mux.get_port(d).unwrap_or("?"),
                d
            );

            self.last_activity.insert(d, timestamp);

            let listener = self.mux.get_listener(d);
            if listener == self.supply_listener {
                match self.waiting_demand.pop_front() {
                    Some(peer) => self.pair(d, Side::Supply, peer, timestamp),
                    None => self.enqueue(d, Side::Supply),
                }
            } else if listener == self.demand_listener {
                match self.waiting_supply.pop_front() {
                    Some(peer) => self.pair(d, Side::Demand, peer, timestamp),
                    None => {
                        self.enqueue(d, Side::Demand);
                        new_demand += 1;
                    }
                }
            } else if self.driver_listener.is_some() && listener == self.driver_listener {
                self.sessions.insert(d, Session::Driver);
                let unmet = self.waiting_demand.len();
                self.mux.writef(d, format_args!("{unmet}\n"));
                published.push(d);
            } else {
                log::error!("Forbidden condition met ({}:{}).", file!(), line!());
            }
        }

        (new_demand, published)
    }

    /// Splice `d` to the waiting `peer` popped from the other side's queue.
    fn pair(&mut self, d: Descriptor, side: Side, peer: Descriptor, timestamp: i64) {
        self.sessions.insert(d, Session::Paired { side, peer });
        self.sessions.insert(
            peer,
            Session::Paired {
                side: side.other(),
                peer: d,
            },
        );
        self.mux.unfreeze(peer);
        self.last_activity.insert(peer, timestamp);
    }

    /// Queue `d` on its own side and freeze it until a partner shows up.
    fn enqueue(&mut self, d: Descriptor, side: Side) {
        self.sessions.insert(d, Session::Waiting(side));
        match side {
            Side::Supply => self.waiting_supply.push_back(d),
            Side::Demand => self.waiting_demand.push_back(d),
        }
        self.mux.freeze(d);
    }

    /// Publish unmet-demand counts to the driver subscribers.
    fn publish_to_drivers(
        &mut self,
        alarmed: bool,
        timestamp: i64,
        new_demand: usize,
        published: &[Descriptor],
    ) {
        if new_demand == 0 && !alarmed {
            return;
        }

        let unmet = self.waiting_demand.len();
        let drivers: Vec<Descriptor> = self
            .sessions
            .iter()
            .filter_map(|(&d, s)| matches!(s, Session::Driver).then_some(d))
            .collect();

        for d in drivers {
            if published.contains(&d) {
                // Connected this iteration; it already has the current count.
                continue;
            }
            if new_demand > 0 {
                self.mux.writef(d, format_args!("{new_demand}\n"));
            } else {
                let period = i64::from(self.config.driver_period);
                if period == 0 {
                    continue;
                }
                let last = self.last_activity.get(&d).copied().unwrap_or(timestamp);
                if clock::elapsed(timestamp, last) < period {
                    continue;
                }
                self.mux.writef(d, format_args!("{unmet}\n"));
            }
            self.last_activity.insert(d, timestamp);
        }
    }

    /// Forward buffered input to each descriptor's partner.
    fn drain_incoming(&mut self, timestamp: i64) {
        let mut buffer = std::mem::take(&mut self.buffer);
        while let Some(d) = self.mux.next_incoming() {
            self.mux.swap_incoming(d, &mut buffer);

            match self.sessions.get(&d).copied() {
                Some(Session::Driver) => {} // drivers are write-only; discard
                Some(Session::Paired { peer, .. }) => {
                    let n = buffer.len();
                    log::debug!(
                        "{} byte{} from {}:{} {} sent to {}:{}.",
                        n,
                        if n == 1 { "" } else { "s" },
                        self.mux.get_host(d).unwrap_or("?"),
                        self.mux.get_port(d).unwrap_or("?"),
                        if n == 1 { "is" } else { "are" },
                        self.mux.get_host(peer).unwrap_or("?"),
                        self.mux.get_port(peer).unwrap_or("?"),
                    );
                    self.mux.append_outgoing(peer, &buffer);
                    self.last_activity.insert(peer, timestamp);
                }
                _ => log::error!("Forbidden condition met ({}:{}).", file!(), line!()),
            }

            self.last_activity.insert(d, timestamp);
            buffer.clear();
        }
        self.buffer = buffer;
    }

    /// Disconnect every descriptor that has been idle for the configured
    /// timeout. The resulting disconnections surface next iteration.
    fn reap_idle(&mut self, timestamp: i64) {
        if self.config.idle_timeout == 0 {
            return;
        }
        let timeout = i64::from(self.config.idle_timeout);
        let expired: Vec<Descriptor> = self
            .last_activity
            .iter()
            .filter_map(|(&d, &ts)| (clock::elapsed(timestamp, ts) >= timeout).then_some(d))
            .collect();
        for d in expired {
            log::debug!(
                "Connection {}:{} has timed out (descriptor {}).",
                self.mux.get_host(d).unwrap_or("?"),
                self.mux.get_port(d).unwrap_or("?"),
                d
            );
            self.mux.disconnect(d);
        }
    }
}
