//! Per-server and per-connection state.

use crate::buf::OctetBuf;
use crate::io::SocketHandle;
use crate::query::QueryKey;
use std::collections::{HashSet, VecDeque};
use std::net::{IpAddr, SocketAddr};

/// The key of a connection in the channel's arena.
pub(crate) type ConnKey = usize;

//------------ Server --------------------------------------------------------

/// One configured upstream server.
pub(crate) struct Server {
    /// The index of this server in the channel's server list.
    pub idx: usize,

    /// The server's address.
    pub addr: IpAddr,

    /// The UDP port, in host byte order.
    pub udp_port: u16,

    /// The TCP port, in host byte order.
    pub tcp_port: u16,

    /// Open connections to this server, most recently opened first.
    ///
    /// New queries reuse the connection at the front, so a freshly opened
    /// connection is the preferred one.
    pub connections: VecDeque<ConnKey>,

    /// The current TCP connection, if one is open.
    ///
    /// The same connection also sits in `connections`.
    pub tcp_conn: Option<ConnKey>,

    /// Unparsed TCP receive bytes.
    ///
    /// Multiple responses can come back in one read, or one response over
    /// several reads.
    pub tcp_parser: OctetBuf,

    /// Queued TCP bytes not yet accepted by the socket.
    pub tcp_send: OctetBuf,

    /// Which incarnation of the TCP connection is the current one.
    ///
    /// Retransmitting a query into the very same socket it already went
    /// into is pointless, but if the server closed on us and we opened a
    /// new connection, sending again is exactly right. The generation
    /// tells these cases apart.
    pub tcp_connection_generation: u64,
}

impl Server {
    /// Creates the state for one server.
    pub fn new(idx: usize, addr: IpAddr, udp_port: u16, tcp_port: u16) -> Self {
        Server {
            idx,
            addr,
            udp_port,
            tcp_port,
            connections: VecDeque::new(),
            tcp_conn: None,
            tcp_parser: OctetBuf::new(),
            tcp_send: OctetBuf::new(),
            tcp_connection_generation: 0,
        }
    }

    /// Returns the UDP socket address of the server.
    pub fn udp_addr(&self) -> SocketAddr {
        SocketAddr::new(self.addr, self.udp_port)
    }

    /// Returns the TCP socket address of the server.
    pub fn tcp_addr(&self) -> SocketAddr {
        SocketAddr::new(self.addr, self.tcp_port)
    }
}

//------------ Connection ----------------------------------------------------

/// One open socket towards a server.
pub(crate) struct Connection {
    /// The index of the owning server.
    pub server: usize,

    /// The socket handle at the provider.
    pub handle: SocketHandle,

    /// Whether this is a stream connection.
    pub is_tcp: bool,

    /// Total number of queries ever assigned to this connection.
    ///
    /// Used to cap how often a UDP connection is reused.
    pub total_queries: usize,

    /// Queries with an unanswered attempt on this connection.
    pub queries: HashSet<QueryKey>,
}

impl Connection {
    /// Creates the state for a freshly opened connection.
    pub fn new(server: usize, handle: SocketHandle, is_tcp: bool) -> Self {
        Connection {
            server,
            handle,
            is_tcp,
            total_queries: 0,
            queries: HashSet::new(),
        }
    }
}
