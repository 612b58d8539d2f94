//! Poll-based socket multiplexer.
//!
//! Owns every file descriptor in the process, listeners and accepted
//! connections alike, and turns kernel readiness into three pull-style event
//! queues: new connections, disconnections, and incoming bytes. The engine
//! never touches a socket directly; it holds opaque [`Descriptor`] handles
//! and calls back in with buffers to forward.
//!
//! # Readiness model
//!
//! One level-triggered `poll(2)` per [`SocketMux::serve`] call over all live
//! descriptors. Listeners are always read-armed. Accepted connections are
//! read-armed unless *frozen*; a frozen descriptor is still polled with no
//! read interest so `POLLHUP`/`POLLERR` keep disconnect detection working
//! while its bytes back up in the kernel. Write interest exists only while a
//! descriptor has outgoing bytes queued.
//!
//! # Teardown
//!
//! `disconnect` marks a descriptor closing; the socket is closed on the next
//! pass with one final non-blocking flush of its outgoing buffer. A peer that
//! sends bytes and immediately closes gets its disconnection event *after*
//! the incoming event: teardown is deferred until the read buffer has been
//! swapped out, so no delivered bytes are ever dropped. Host/port metadata
//! outlives the socket until the serve() call after the disconnection event
//! has been consumed.

use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::io::{ErrorKind, Read, Write};
use std::net::{Ipv4Addr, SocketAddr, TcpListener, TcpStream};
use std::os::fd::AsRawFd;

/// Upper bound on one readiness wait, in milliseconds.
///
/// The engine drains its signal flags before calling [`SocketMux::serve`]; a
/// signal latched between the drain and the wait would otherwise sleep until
/// the next I/O event. Bounding the wait turns that race into at most one
/// second of delay.
const WAIT_MS: libc::c_int = 1000;

/// Read chunk size per syscall.
const CHUNK: usize = 4096;

/// Opaque handle to a socket owned by the multiplexer.
///
/// Integer-valued, stable for the lifetime of the connection, and never
/// reused for a later one. The underlying file descriptor is private.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Debug)]
pub struct Descriptor(u32);

impl fmt::Display for Descriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

struct ListenerEntry {
    socket: TcpListener,
    host: String,
    port: String,
    closing: bool,
}

struct ClientEntry {
    socket: TcpStream,
    host: String,
    port: String,
    listener: Descriptor,
    incoming: Vec<u8>,
    outgoing: Vec<u8>,
    frozen: bool,
    closing: bool,
}

/// Socket already closed; metadata retained until the disconnection event
/// has been consumed.
struct ClosedEntry {
    host: String,
    port: String,
    listener: Option<Descriptor>,
}

enum Entry {
    Listener(ListenerEntry),
    Client(ClientEntry),
    Closed(ClosedEntry),
}

/// The multiplexer. See the module docs for the readiness model.
pub struct SocketMux {
    entries: HashMap<Descriptor, Entry>,
    next_id: u32,
    connections: VecDeque<Descriptor>,
    disconnections: VecDeque<Descriptor>,
    incoming: VecDeque<Descriptor>,
    /// Disconnection events already handed out; their entries are purged at
    /// the start of the next serve().
    reaped: Vec<Descriptor>,
}

impl SocketMux {
    pub fn new() -> Self {
        Self {
            entries: HashMap::new(),
            next_id: 0,
            connections: VecDeque::new(),
            disconnections: VecDeque::new(),
            incoming: VecDeque::new(),
            reaped: Vec::new(),
        }
    }

    fn alloc(&mut self) -> Descriptor {
        self.next_id = self.next_id.wrapping_add(1).max(1);
        Descriptor(self.next_id)
    }

    /// Create a non-blocking TCP listener on all interfaces.
    ///
    /// Returns `None` on any failure, after logging it. Port 0 binds an
    /// ephemeral port; see [`local_port`].
    ///
    /// [`local_port`]: SocketMux::local_port
    pub fn listen(&mut self, port: u16) -> Option<Descriptor> {
        let addr = SocketAddr::from((Ipv4Addr::UNSPECIFIED, port));
        let socket = match TcpListener::bind(addr).and_then(|socket| {
            socket.set_nonblocking(true)?;
            Ok(socket)
        }) {
            Ok(socket) => socket,
            Err(e) => {
                log::error!("Failed to listen on port {port}: {e}");
                return None;
            }
        };

        let bound = socket.local_addr().map(|a| a.port()).unwrap_or(port);
        let d = self.alloc();
        self.entries.insert(
            d,
            Entry::Listener(ListenerEntry {
                socket,
                host: Ipv4Addr::UNSPECIFIED.to_string(),
                port: bound.to_string(),
                closing: false,
            }),
        );
        Some(d)
    }

    /// The port a listener actually bound (differs from the requested port
    /// only when 0 was requested).
    pub fn local_port(&self, d: Descriptor) -> Option<u16> {
        match self.entries.get(&d) {
            Some(Entry::Listener(listener)) => listener.socket.local_addr().ok().map(|a| a.port()),
            _ => None,
        }
    }

    /// One polling step: accept, read, flush, and collect events.
    ///
    /// Waits at most one second for readiness; returns immediately when a
    /// signal interrupts the wait or events are already queued. Returns
    /// `false` only on an unrecoverable polling error.
    pub fn serve(&mut self) -> bool {
        for d in self.reaped.drain(..) {
            self.entries.remove(&d);
        }
        self.reap_closing();

        let mut order = Vec::with_capacity(self.entries.len());
        let mut fds: Vec<libc::pollfd> = Vec::with_capacity(self.entries.len());
        for (&d, entry) in &self.entries {
            let (fd, events) = match entry {
                Entry::Listener(listener) if !listener.closing => {
                    (listener.socket.as_raw_fd(), libc::POLLIN)
                }
                Entry::Client(client) if !client.closing => {
                    let mut events = if client.frozen { 0 } else { libc::POLLIN };
                    if !client.outgoing.is_empty() {
                        events |= libc::POLLOUT;
                    }
                    (client.socket.as_raw_fd(), events)
                }
                _ => continue,
            };
            order.push(d);
            fds.push(libc::pollfd {
                fd,
                events,
                revents: 0,
            });
        }

        if fds.is_empty() {
            return true;
        }

        let timeout = if self.events_pending() { 0 } else { WAIT_MS };
        let ready = unsafe { libc::poll(fds.as_mut_ptr(), fds.len() as libc::nfds_t, timeout) };
        if ready < 0 {
            let err = std::io::Error::last_os_error();
            if err.kind() == ErrorKind::Interrupted {
                // A signal arrived; the caller re-examines its flags.
                return true;
            }
            log::error!("Polling failed: {err}");
            return false;
        }
        if ready == 0 {
            return true;
        }

        for (i, d) in order.into_iter().enumerate() {
            let revents = fds[i].revents;
            if revents == 0 {
                continue;
            }
            self.dispatch(d, revents);
        }

        self.reap_closing();
        true
    }

    fn events_pending(&self) -> bool {
        !self.connections.is_empty()
            || !self.disconnections.is_empty()
            || !self.incoming.is_empty()
    }

    fn dispatch(&mut self, d: Descriptor, revents: libc::c_short) {
        match self.entries.get(&d) {
            Some(Entry::Listener(_)) => {
                if revents & (libc::POLLERR | libc::POLLNVAL) != 0 {
                    self.mark_closing(d);
                } else if revents & libc::POLLIN != 0 {
                    self.accept_ready(d);
                }
            }
            Some(Entry::Client(_)) => {
                if revents & (libc::POLLERR | libc::POLLNVAL) != 0 {
                    self.mark_closing(d);
                    return;
                }
                if revents & libc::POLLIN != 0 {
                    self.read_ready(d);
                }
                if revents & libc::POLLOUT != 0 {
                    self.write_ready(d);
                }
                if revents & libc::POLLHUP != 0 && revents & libc::POLLIN == 0 {
                    // Frozen peer went away; no read interest was armed, so
                    // only the hangup tells us.
                    self.mark_closing(d);
                }
            }
            _ => {}
        }
    }

    fn accept_ready(&mut self, d: Descriptor) {
        loop {
            let accepted = match self.entries.get_mut(&d) {
                Some(Entry::Listener(listener)) if !listener.closing => listener.socket.accept(),
                _ => return,
            };
            match accepted {
                Ok((socket, addr)) => {
                    if let Err(e) = socket.set_nonblocking(true) {
                        log::warn!("Dropping connection from {addr}: {e}");
                        continue;
                    }
                    let id = self.alloc();
                    self.entries.insert(
                        id,
                        Entry::Client(ClientEntry {
                            socket,
                            host: addr.ip().to_string(),
                            port: addr.port().to_string(),
                            listener: d,
                            incoming: Vec::new(),
                            outgoing: Vec::new(),
                            frozen: false,
                            closing: false,
                        }),
                    );
                    self.connections.push_back(id);
                }
                Err(e) if e.kind() == ErrorKind::WouldBlock => return,
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => {
                    log::warn!("Accept failed on descriptor {d}: {e}");
                    return;
                }
            }
        }
    }

    fn read_ready(&mut self, d: Descriptor) {
        let mut became_ready = false;
        if let Some(Entry::Client(client)) = self.entries.get_mut(&d) {
            if client.closing || client.frozen {
                return;
            }
            let was_empty = client.incoming.is_empty();
            let mut chunk = [0u8; CHUNK];
            loop {
                match client.socket.read(&mut chunk) {
                    Ok(0) => {
                        client.closing = true;
                        break;
                    }
                    Ok(n) => client.incoming.extend_from_slice(&chunk[..n]),
                    Err(e) if e.kind() == ErrorKind::WouldBlock => break,
                    Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                    Err(_) => {
                        client.closing = true;
                        break;
                    }
                }
            }
            became_ready = was_empty && !client.incoming.is_empty();
        }
        if became_ready {
            self.incoming.push_back(d);
        }
    }

    fn write_ready(&mut self, d: Descriptor) {
        if let Some(Entry::Client(client)) = self.entries.get_mut(&d) {
            if client.closing {
                return;
            }
            while !client.outgoing.is_empty() {
                match client.socket.write(&client.outgoing) {
                    Ok(0) => break,
                    Ok(n) => {
                        client.outgoing.drain(..n);
                    }
                    Err(e) if e.kind() == ErrorKind::WouldBlock => break,
                    Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                    Err(_) => {
                        client.closing = true;
                        break;
                    }
                }
            }
        }
    }

    /// Mark `d` closing so the next pass tears it down.
    fn mark_closing(&mut self, d: Descriptor) {
        match self.entries.get_mut(&d) {
            Some(Entry::Listener(listener)) => listener.closing = true,
            Some(Entry::Client(client)) => client.closing = true,
            _ => {}
        }
    }

    /// Tear down closing entries: cascade listener closes to their accepted
    /// connections, flush and close sockets, queue disconnection events.
    ///
    /// A client whose read buffer still holds undelivered bytes is left
    /// standing until [`swap_incoming`] has emptied it.
    ///
    /// [`swap_incoming`]: SocketMux::swap_incoming
    fn reap_closing(&mut self) {
        let closing_listeners: Vec<Descriptor> = self
            .entries
            .iter()
            .filter_map(|(&d, entry)| match entry {
                Entry::Listener(listener) if listener.closing => Some(d),
                _ => None,
            })
            .collect();

        if !closing_listeners.is_empty() {
            let orphans: Vec<Descriptor> = self
                .entries
                .iter()
                .filter_map(|(&d, entry)| match entry {
                    Entry::Client(client) if closing_listeners.contains(&client.listener) => {
                        Some(d)
                    }
                    _ => None,
                })
                .collect();
            for d in orphans {
                self.force_close(d);
            }
        }

        let ready: Vec<Descriptor> = self
            .entries
            .iter()
            .filter_map(|(&d, entry)| match entry {
                Entry::Listener(listener) if listener.closing => Some(d),
                Entry::Client(client) if client.closing && client.incoming.is_empty() => Some(d),
                _ => None,
            })
            .collect();

        for d in ready {
            let Some(entry) = self.entries.remove(&d) else {
                continue;
            };
            let closed = match entry {
                Entry::Listener(listener) => ClosedEntry {
                    host: listener.host,
                    port: listener.port,
                    listener: None,
                },
                Entry::Client(mut client) => {
                    final_flush(&mut client.socket, &mut client.outgoing);
                    ClosedEntry {
                        host: client.host,
                        port: client.port,
                        listener: Some(client.listener),
                    }
                }
                Entry::Closed(closed) => closed,
            };
            self.entries.insert(d, Entry::Closed(closed));
            self.connections.retain(|&q| q != d);
            self.incoming.retain(|&q| q != d);
            self.disconnections.push_back(d);
        }
    }

    /// Close a client on behalf of the broker or a dying listener: whatever
    /// its read buffer still holds has nowhere to go, so it is dropped and
    /// teardown is immediate on the next pass.
    fn force_close(&mut self, d: Descriptor) {
        if let Some(Entry::Client(client)) = self.entries.get_mut(&d) {
            client.closing = true;
            client.incoming.clear();
            self.incoming.retain(|&q| q != d);
            self.connections.retain(|&q| q != d);
        }
    }

    // ── Event queues ─────────────────────────────────────────────────────────

    /// Pop one newly accepted connection.
    pub fn next_connection(&mut self) -> Option<Descriptor> {
        self.connections.pop_front()
    }

    /// Pop one disconnection. Metadata for the popped descriptor stays
    /// queryable until the next [`serve`] call.
    ///
    /// [`serve`]: SocketMux::serve
    pub fn next_disconnection(&mut self) -> Option<Descriptor> {
        let d = self.disconnections.pop_front()?;
        self.reaped.push(d);
        Some(d)
    }

    /// Pop one descriptor with buffered incoming bytes.
    pub fn next_incoming(&mut self) -> Option<Descriptor> {
        self.incoming.pop_front()
    }

    // ── Buffers ──────────────────────────────────────────────────────────────

    /// Hand the accumulated read buffer for `d` to the caller, leaving an
    /// empty one behind. `buf`'s previous contents are discarded.
    pub fn swap_incoming(&mut self, d: Descriptor, buf: &mut Vec<u8>) {
        buf.clear();
        if let Some(Entry::Client(client)) = self.entries.get_mut(&d) {
            std::mem::swap(&mut client.incoming, buf);
        }
    }

    /// Enqueue bytes for transmission on `d`; later [`serve`] calls drain
    /// them. Unknown or closed descriptors swallow the bytes.
    ///
    /// [`serve`]: SocketMux::serve
    pub fn append_outgoing(&mut self, d: Descriptor, bytes: &[u8]) {
        if let Some(Entry::Client(client)) = self.entries.get_mut(&d) {
            client.outgoing.extend_from_slice(bytes);
        }
    }

    /// Formatted [`append_outgoing`].
    ///
    /// [`append_outgoing`]: SocketMux::append_outgoing
    pub fn writef(&mut self, d: Descriptor, args: fmt::Arguments<'_>) {
        self.append_outgoing(d, args.to_string().as_bytes());
    }

    // ── Flow control ─────────────────────────────────────────────────────────

    /// Drop read interest for `d`; its bytes stay in the kernel until
    /// [`unfreeze`]. Disconnects are still detected.
    ///
    /// [`unfreeze`]: SocketMux::unfreeze
    pub fn freeze(&mut self, d: Descriptor) {
        if let Some(Entry::Client(client)) = self.entries.get_mut(&d) {
            client.frozen = true;
        }
    }

    /// Restore read interest for `d`.
    pub fn unfreeze(&mut self, d: Descriptor) {
        if let Some(Entry::Client(client)) = self.entries.get_mut(&d) {
            client.frozen = false;
        }
    }

    /// Whether `d` is currently frozen.
    pub fn is_frozen(&self, d: Descriptor) -> bool {
        matches!(self.entries.get(&d), Some(Entry::Client(client)) if client.frozen)
    }

    // ── Teardown ─────────────────────────────────────────────────────────────

    /// Initiate an orderly close of `d`. A disconnection event will surface
    /// unless the descriptor was never known. Disconnecting a listener also
    /// disconnects every connection accepted from it. No-op on unknown
    /// descriptors.
    pub fn disconnect(&mut self, d: Descriptor) {
        match self.entries.get_mut(&d) {
            Some(Entry::Listener(listener)) => listener.closing = true,
            Some(Entry::Client(_)) => self.force_close(d),
            _ => {}
        }
    }

    /// [`disconnect`] through an optional handle; `None` is a no-op.
    ///
    /// [`disconnect`]: SocketMux::disconnect
    pub fn disconnect_opt(&mut self, d: Option<Descriptor>) {
        if let Some(d) = d {
            self.disconnect(d);
        }
    }

    // ── Metadata ─────────────────────────────────────────────────────────────

    /// Remote host of `d`, if known.
    pub fn get_host(&self, d: Descriptor) -> Option<&str> {
        match self.entries.get(&d)? {
            Entry::Listener(listener) => Some(&listener.host),
            Entry::Client(client) => Some(&client.host),
            Entry::Closed(closed) => Some(&closed.host),
        }
    }

    /// Remote port of `d`, if known.
    pub fn get_port(&self, d: Descriptor) -> Option<&str> {
        match self.entries.get(&d)? {
            Entry::Listener(listener) => Some(&listener.port),
            Entry::Client(client) => Some(&client.port),
            Entry::Closed(closed) => Some(&closed.port),
        }
    }

    /// The listener that accepted `d`. `None` for listeners themselves.
    pub fn get_listener(&self, d: Descriptor) -> Option<Descriptor> {
        match self.entries.get(&d)? {
            Entry::Listener(_) => None,
            Entry::Client(client) => Some(client.listener),
            Entry::Closed(closed) => closed.listener,
        }
    }

    /// True when no descriptors remain and every event queue is empty.
    pub fn is_drained(&self) -> bool {
        self.entries.is_empty()
            && self.reaped.is_empty()
            && !self.events_pending()
    }
}

impl Default for SocketMux {
    fn default() -> Self {
        Self::new()
    }
}

fn final_flush(socket: &mut TcpStream, outgoing: &mut Vec<u8>) {
    while !outgoing.is_empty() {
        match socket.write(outgoing) {
            Ok(0) => break,
            Ok(n) => {
                outgoing.drain(..n);
            }
            Err(e) if e.kind() == ErrorKind::Interrupted => continue,
            Err(_) => break,
        }
    }
}
