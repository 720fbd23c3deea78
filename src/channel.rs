//! The resolver channel.
//!
//! A [`Channel`] is the top-level context of the engine. It owns the
//! configuration, the server list, the socket provider, and the indexes
//! over all in-flight queries. Callers submit pre-serialized queries with
//! [`send`], feed socket readiness and time through [`process`], and get
//! each query's outcome delivered to its callback exactly once.
//!
//! Everything runs on the caller's thread. There is no locking and no
//! internal blocking; a socket operation that cannot make progress is
//! abandoned and retried on the next readiness notification.
//!
//! [`send`]: Channel::send
//! [`process`]: Channel::process

use crate::base::header::HEADER_LEN;
use crate::clock::{Clock, SystemClock};
use crate::config::{check_config, Config};
use crate::config::Flags;
use crate::error::Error;
use crate::io::{
    Family, SocketHandle, SocketInterest, SocketProvider, SysProvider,
    Transport,
};
use crate::query::{Answer, Callback, DeadlineKey, Query, QueryKey};
use crate::server::{ConnKey, Connection, Server};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use slab::Slab;
use std::collections::{BTreeMap, HashMap};
use std::io;
use std::time::Duration;
use tracing::debug;

//------------ Callback types ------------------------------------------------

/// Callback invoked whenever the channel's interest in a socket changes.
///
/// The arguments are the socket and whether the channel now wants to be
/// told about read and write readiness. Both false means the socket is
/// about to be closed.
pub type SocketStateCallback = Box<dyn FnMut(SocketHandle, bool, bool)>;

/// Callback invoked right after a socket has been opened.
///
/// An error aborts the connection attempt; the affected query moves on to
/// the next server.
pub type SocketCreateCallback =
    Box<dyn FnMut(SocketHandle, Transport) -> io::Result<()>>;

/// Callback invoked after a socket is opened and before it is connected.
///
/// An error aborts the connection attempt; the affected query moves on to
/// the next server.
pub type SocketConfigCallback =
    Box<dyn FnMut(SocketHandle) -> io::Result<()>>;

//------------ Channel -------------------------------------------------------

/// A stub resolver channel.
pub struct Channel {
    /// User configuration variables.
    ///
    /// Mutable because a FORMERR fallback clears the EDNS flag for the
    /// rest of the channel's life.
    pub(crate) config: Config,

    /// The upstream servers.
    pub(crate) servers: Vec<Server>,

    /// All live queries. The arena is the owner; every index below holds
    /// arena keys only.
    pub(crate) queries: Slab<Query>,

    /// All open connections, likewise owned here and indexed by key.
    pub(crate) conns: Slab<Connection>,

    /// Queries bucketed by transaction id, for dispatching responses.
    pub(crate) queries_by_qid: HashMap<u16, QueryKey>,

    /// Queries ordered by deadline, for handling timeouts.
    pub(crate) queries_by_timeout: BTreeMap<DeadlineKey, QueryKey>,

    /// Tie breaker for queries sharing a deadline.
    pub(crate) deadline_seq: u64,

    /// Connection lookup by socket handle.
    ///
    /// A handle is removed from here before the socket is closed at the
    /// provider, so a present entry always names a live connection.
    pub(crate) conn_by_socket: HashMap<SocketHandle, ConnKey>,

    /// Generation number for the next TCP connection open or close.
    pub(crate) tcp_connection_generation: u64,

    /// The server the last submission started at, for rotation.
    pub(crate) last_server: usize,

    /// Random state for drawing transaction ids.
    rng: StdRng,

    /// The time source.
    pub(crate) clock: Box<dyn Clock>,

    /// The socket provider.
    pub(crate) provider: Box<dyn SocketProvider>,

    /// Socket interest-change callback.
    socket_state_cb: Option<SocketStateCallback>,

    /// Socket created callback.
    socket_create_cb: Option<SocketCreateCallback>,

    /// Socket configuration callback.
    socket_config_cb: Option<SocketConfigCallback>,
}

impl Channel {
    /// Creates a channel using real sockets and the system clock.
    pub fn new(config: Config) -> Result<Self, Error> {
        Self::with_io(config, SysProvider::new(), SystemClock::new())
    }

    /// Creates a channel with an injected socket provider and clock.
    pub fn with_io(
        config: Config,
        provider: impl SocketProvider + 'static,
        clock: impl Clock + 'static,
    ) -> Result<Self, Error> {
        check_config(&config)?;
        let servers = config
            .effective_servers()
            .iter()
            .enumerate()
            .map(|(idx, spec)| {
                let udp_port = if spec.udp_port == 0 {
                    config.udp_port
                } else {
                    spec.udp_port
                };
                let tcp_port = if spec.tcp_port == 0 {
                    config.tcp_port
                } else {
                    spec.tcp_port
                };
                Server::new(idx, spec.addr, udp_port, tcp_port)
            })
            .collect::<Vec<_>>();
        let mut channel = Channel {
            config,
            servers,
            queries: Slab::new(),
            conns: Slab::new(),
            queries_by_qid: HashMap::new(),
            queries_by_timeout: BTreeMap::new(),
            deadline_seq: 0,
            conn_by_socket: HashMap::new(),
            tcp_connection_generation: 0,
            last_server: 0,
            rng: StdRng::from_entropy(),
            clock: Box::new(clock),
            provider: Box::new(provider),
            socket_state_cb: None,
            socket_create_cb: None,
            socket_config_cb: None,
        };
        for idx in 0..channel.servers.len() {
            channel.tcp_connection_generation += 1;
            channel.servers[idx].tcp_connection_generation =
                channel.tcp_connection_generation;
        }
        Ok(channel)
    }

    /// Sets the socket interest-change callback.
    pub fn set_socket_state_callback(&mut self, cb: SocketStateCallback) {
        self.socket_state_cb = Some(cb);
    }

    /// Sets the socket created callback.
    pub fn set_socket_create_callback(&mut self, cb: SocketCreateCallback) {
        self.socket_create_cb = Some(cb);
    }

    /// Sets the socket configuration callback.
    pub fn set_socket_config_callback(&mut self, cb: SocketConfigCallback) {
        self.socket_config_cb = Some(cb);
    }

    /// Returns the channel configuration.
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Returns the number of queries still in flight.
    pub fn pending_queries(&self) -> usize {
        self.queries.len()
    }

    /// Submits a pre-serialized query.
    ///
    /// The message must be complete except for its transaction id: the
    /// channel draws a fresh id that is unique among the live queries,
    /// patches it into the first two octets, and returns it. Submitting
    /// the same bytes twice therefore creates two independent queries.
    ///
    /// `callback` is invoked exactly once, either with the validated
    /// response or with the terminal error, possibly from within this very
    /// call if the first attempt already fails terminally. On `Err` no
    /// query was created and the callback will never run.
    pub fn send<F>(&mut self, msg: &[u8], callback: F) -> Result<u16, Error>
    where
        F: FnOnce(Result<Answer, Error>, usize) + 'static,
    {
        if msg.len() < HEADER_LEN || msg.len() > usize::from(u16::MAX) {
            return Err(Error::BadQuery);
        }

        let qid = self.generate_unique_qid();
        let mut tcpbuf = Vec::with_capacity(msg.len() + 2);
        tcpbuf.extend_from_slice(&(msg.len() as u16).to_be_bytes());
        tcpbuf.extend_from_slice(msg);
        tcpbuf[2..4].copy_from_slice(&qid.to_be_bytes());

        let mut query = Query::new(qid, tcpbuf, self.servers.len());
        query.callback = Some(Box::new(callback) as Callback);
        query.using_tcp = self.config.flags.contains(Flags::USEVC);
        query.server = if self.config.rotate {
            let server = self.last_server;
            self.last_server = (self.last_server + 1) % self.servers.len();
            server
        } else {
            0
        };

        let key = self.queries.insert(query);
        self.queries_by_qid.insert(qid, key);

        let now = self.clock.now();
        // A terminal failure here has already run the callback; the
        // submission itself still succeeded.
        let _ = self.send_query(key, now);
        Ok(qid)
    }

    /// Cancels one pending query.
    ///
    /// The query is not torn down right away. Its deadline is pulled to
    /// the present and retries are forbidden, so the next [`process`] call
    /// ends it with [`Error::Cancelled`]. Returns whether the id named a
    /// live query.
    ///
    /// [`process`]: Channel::process
    pub fn cancel(&mut self, qid: u16) -> bool {
        let key = match self.queries_by_qid.get(&qid) {
            Some(&key) => key,
            None => return false,
        };
        let seq = self.next_deadline_seq();
        let query = &mut self.queries[key];
        query.no_retries = true;
        query.error_status = Error::Cancelled;
        if let Some(old) = query.deadline.take() {
            self.queries_by_timeout.remove(&old);
        }
        let deadline = (Duration::ZERO, seq);
        self.queries[key].deadline = Some(deadline);
        self.queries_by_timeout.insert(deadline, key);
        true
    }

    /// Cancels every pending query immediately.
    ///
    /// Each callback is invoked with [`Error::Cancelled`] before this
    /// method returns.
    pub fn cancel_all(&mut self) {
        let keys: Vec<QueryKey> =
            self.queries.iter().map(|(key, _)| key).collect();
        for key in keys {
            self.end_query(key, Err(Error::Cancelled));
        }
    }

    /// Returns every open socket with the channel's current interest.
    ///
    /// Callers multiplexing externally register exactly these sockets and
    /// feed readiness back through [`process`].
    ///
    /// [`process`]: Channel::process
    pub fn sockets(&self) -> Vec<SocketInterest> {
        self.conns
            .iter()
            .map(|(key, conn)| {
                let server = &self.servers[conn.server];
                let writable = conn.is_tcp
                    && server.tcp_conn == Some(key)
                    && !server.tcp_send.is_empty();
                SocketInterest {
                    handle: conn.handle,
                    readable: true,
                    writable,
                }
            })
            .collect()
    }

    /// Returns how long the caller may sleep before the next deadline.
    ///
    /// `None` means no query is waiting on a deadline.
    pub fn timeout(&self) -> Option<Duration> {
        let (&(deadline, _), _) = self.queries_by_timeout.iter().next()?;
        Some(deadline.saturating_sub(self.clock.now()))
    }

    /// Handles readiness for a set of sockets plus the passage of time.
    ///
    /// Queued TCP data is written first, then all readable sockets are
    /// drained, then expired deadlines fire. Callbacks of completing
    /// queries run synchronously from within this call.
    pub fn process(&mut self, read: &[SocketHandle], write: &[SocketHandle]) {
        let now = self.clock.now();
        self.write_tcp_data(write, now);
        self.read_packets(read, now);
        self.process_timeouts(now);
    }

    /// Like [`process`] but for a single readable and writable socket.
    ///
    /// [`process`]: Channel::process
    pub fn process_socket(
        &mut self,
        read: Option<SocketHandle>,
        write: Option<SocketHandle>,
    ) {
        let read: Vec<SocketHandle> = read.into_iter().collect();
        let write: Vec<SocketHandle> = write.into_iter().collect();
        self.process(&read, &write);
    }
}

//--- Internal machinery shared by the engine paths

impl Channel {
    /// Draws a transaction id not used by any live query.
    fn generate_unique_qid(&mut self) -> u16 {
        loop {
            let qid = self.rng.gen::<u16>();
            if !self.queries_by_qid.contains_key(&qid) {
                return qid;
            }
        }
    }

    /// Returns the next deadline tie breaker.
    pub(crate) fn next_deadline_seq(&mut self) -> u64 {
        let seq = self.deadline_seq;
        self.deadline_seq += 1;
        seq
    }

    /// Invokes the socket state callback, if one is installed.
    pub(crate) fn notify_socket_state(
        &mut self,
        handle: SocketHandle,
        readable: bool,
        writable: bool,
    ) {
        if let Some(cb) = self.socket_state_cb.as_mut() {
            cb(handle, readable, writable);
        }
    }

    /// Opens a new connection to a server.
    ///
    /// The new connection becomes the preferred one of the server. For
    /// TCP it also becomes the server's current TCP connection and bumps
    /// the generation counter.
    pub(crate) fn open_connection(
        &mut self,
        server_idx: usize,
        is_tcp: bool,
    ) -> Result<ConnKey, Error> {
        let server = &self.servers[server_idx];
        let addr = if is_tcp {
            server.tcp_addr()
        } else {
            server.udp_addr()
        };
        let transport = if is_tcp { Transport::Tcp } else { Transport::Udp };

        let handle = self
            .provider
            .open(Family::of(&addr), transport)
            .map_err(|err| map_socket_error(&err))?;

        if let Some(cb) = self.socket_create_cb.as_mut() {
            if let Err(err) = cb(handle, transport) {
                debug!(%handle, %err, "socket rejected by create callback");
                self.provider.close(handle);
                return Err(Error::ConnRefused);
            }
        }
        if let Some(cb) = self.socket_config_cb.as_mut() {
            if let Err(err) = cb(handle) {
                debug!(%handle, %err, "socket rejected by config callback");
                self.provider.close(handle);
                return Err(Error::ConnRefused);
            }
        }

        if let Err(err) = self.provider.connect(handle, addr) {
            if err.kind() != io::ErrorKind::WouldBlock {
                debug!(%handle, %addr, %err, "connect failed");
                self.provider.close(handle);
                return Err(map_socket_error(&err));
            }
            // Connection establishment still in progress is fine.
        }

        let key =
            self.conns
                .insert(Connection::new(server_idx, handle, is_tcp));
        self.conn_by_socket.insert(handle, key);
        let server = &mut self.servers[server_idx];
        server.connections.push_front(key);
        if is_tcp {
            self.tcp_connection_generation += 1;
            server.tcp_connection_generation = self.tcp_connection_generation;
            server.tcp_conn = Some(key);
        }
        self.notify_socket_state(handle, true, false);
        Ok(key)
    }

    /// Closes a connection and removes it from all lookup structures.
    ///
    /// Any queries still attached must have been detached by the caller.
    /// Closing the current TCP connection bumps the generation counter and
    /// discards both TCP buffers; a partial inbound frame died with the
    /// peer, and unsent outbound bytes belong to queries that are being
    /// requeued anyway.
    pub(crate) fn close_connection(&mut self, key: ConnKey) {
        let conn = self.conns.remove(key);
        debug_assert!(conn.queries.is_empty());
        self.conn_by_socket.remove(&conn.handle);
        self.notify_socket_state(conn.handle, false, false);
        self.provider.close(conn.handle);

        let server = &mut self.servers[conn.server];
        server.connections.retain(|&other| other != key);
        if conn.is_tcp && server.tcp_conn == Some(key) {
            server.tcp_conn = None;
            server.tcp_parser.clear();
            server.tcp_send.clear();
            self.tcp_connection_generation += 1;
            self.servers[conn.server].tcp_connection_generation =
                self.tcp_connection_generation;
        }
    }

    /// Closes a UDP connection that is idle and past its reuse cap.
    pub(crate) fn check_cleanup_conn(&mut self, handle: SocketHandle) {
        let key = match self.conn_by_socket.get(&handle) {
            Some(&key) => key,
            None => return,
        };
        let conn = &self.conns[key];
        if conn.is_tcp || !conn.queries.is_empty() {
            return;
        }
        if self.config.udp_max_queries > 0
            && conn.total_queries >= self.config.udp_max_queries
        {
            debug!(%handle, "closing used-up UDP connection");
            self.close_connection(key);
        }
    }

    /// Removes a query from every index, runs its callback, destroys it.
    pub(crate) fn end_query(
        &mut self,
        key: QueryKey,
        result: Result<Answer, Error>,
    ) {
        let mut query = self.queries.remove(key);
        self.queries_by_qid.remove(&query.qid);
        if let Some(deadline) = query.deadline.take() {
            self.queries_by_timeout.remove(&deadline);
        }
        if let Some(conn) = query.conn.take() {
            if let Some(conn) = self.conns.get_mut(conn) {
                conn.queries.remove(&key);
            }
        }
        if let Some(callback) = query.callback.take() {
            callback(result, query.timeouts);
        }
    }
}

//--- Drop

impl Drop for Channel {
    fn drop(&mut self) {
        let keys: Vec<QueryKey> =
            self.queries.iter().map(|(key, _)| key).collect();
        for key in keys {
            self.end_query(key, Err(Error::Shutdown));
        }
        let conns: Vec<ConnKey> =
            self.conns.iter().map(|(key, _)| key).collect();
        for key in conns {
            self.close_connection(key);
        }
    }
}

//------------ Helpers -------------------------------------------------------

/// Maps a socket error onto the per-server error taxonomy.
fn map_socket_error(err: &io::Error) -> Error {
    match err.kind() {
        io::ErrorKind::Unsupported
        | io::ErrorKind::InvalidInput
        | io::ErrorKind::AddrNotAvailable => Error::BadFamily,
        _ => Error::ConnRefused,
    }
}
