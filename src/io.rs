//! The socket provider contract and its implementations.
//!
//! The channel never talks to the operating system directly. All socket
//! work goes through a [`SocketProvider`], so the engine can be driven
//! from any event loop and, in tests, without any sockets at all.
//!
//! Every operation must be non-blocking. An operation that cannot make
//! progress right now must fail with [`std::io::ErrorKind::WouldBlock`];
//! the channel will retry it on the next readiness notification.

use socket2::{Domain, Protocol, Socket, Type};
use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::io;
use std::net::{SocketAddr, TcpStream, UdpSocket};
use std::sync::{Arc, Mutex};

//------------ SocketHandle --------------------------------------------------

/// An opaque handle naming one socket of a provider.
#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct SocketHandle(pub u64);

impl fmt::Display for SocketHandle {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "sock:{}", self.0)
    }
}

//------------ Family, Transport ---------------------------------------------

/// The address family of a socket.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Family {
    /// IPv4.
    V4,

    /// IPv6.
    V6,
}

impl Family {
    /// Returns the family of the given address.
    pub fn of(addr: &SocketAddr) -> Self {
        match addr {
            SocketAddr::V4(_) => Family::V4,
            SocketAddr::V6(_) => Family::V6,
        }
    }
}

/// The transport protocol of a socket.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Transport {
    /// Datagram transport.
    Udp,

    /// Stream transport.
    Tcp,
}

//------------ SocketInterest ------------------------------------------------

/// A socket together with the channel's current readiness interest.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct SocketInterest {
    /// The socket.
    pub handle: SocketHandle,

    /// The channel wants to know when the socket is readable.
    pub readable: bool,

    /// The channel wants to know when the socket is writable.
    pub writable: bool,
}

//------------ SocketProvider ------------------------------------------------

/// Non-blocking socket operations driven by a channel.
pub trait SocketProvider {
    /// Creates a new, unconnected socket.
    fn open(
        &mut self,
        family: Family,
        transport: Transport,
    ) -> io::Result<SocketHandle>;

    /// Connects a socket to the given address.
    ///
    /// A connection attempt still in progress reports success; a later
    /// write or read surfaces the outcome.
    fn connect(
        &mut self,
        handle: SocketHandle,
        addr: SocketAddr,
    ) -> io::Result<()>;

    /// Writes bytes to a connected socket.
    fn write(&mut self, handle: SocketHandle, data: &[u8])
        -> io::Result<usize>;

    /// Reads bytes from a connected stream socket.
    fn recv(
        &mut self,
        handle: SocketHandle,
        buf: &mut [u8],
    ) -> io::Result<usize>;

    /// Receives one datagram, reporting the sender address.
    fn recv_from(
        &mut self,
        handle: SocketHandle,
        buf: &mut [u8],
    ) -> io::Result<(usize, SocketAddr)>;

    /// Closes a socket. The handle is dead afterwards.
    fn close(&mut self, handle: SocketHandle);
}

//------------ SysProvider ---------------------------------------------------

/// Socket provider backed by the standard library's sockets.
///
/// UDP sockets are bound to an unspecified local address and connected to
/// the server, then switched to non-blocking mode. TCP sockets are
/// created non-blocking before `connect`, so the connect only initiates
/// the attempt: completion shows up as write readiness, and a failed
/// attempt surfaces on the first read or write afterwards.
#[derive(Debug, Default)]
pub struct SysProvider {
    /// The next handle to give out.
    next: u64,

    /// All open sockets by handle.
    sockets: HashMap<SocketHandle, SysSocket>,
}

/// One socket of [`SysProvider`].
#[derive(Debug)]
enum SysSocket {
    /// A socket that was opened but not yet connected.
    Pending(Family, Transport),

    /// A connected datagram socket.
    Udp(UdpSocket),

    /// A connected stream socket.
    Tcp(TcpStream),
}

impl SysProvider {
    /// Creates a new provider without any sockets.
    pub fn new() -> Self {
        Default::default()
    }

    /// Returns the socket for a handle, or the bad-handle error.
    fn get(&mut self, handle: SocketHandle) -> io::Result<&mut SysSocket> {
        self.sockets
            .get_mut(&handle)
            .ok_or_else(|| io::Error::from(io::ErrorKind::NotFound))
    }
}

impl SocketProvider for SysProvider {
    fn open(
        &mut self,
        family: Family,
        transport: Transport,
    ) -> io::Result<SocketHandle> {
        let handle = SocketHandle(self.next);
        self.next += 1;
        self.sockets
            .insert(handle, SysSocket::Pending(family, transport));
        Ok(handle)
    }

    fn connect(
        &mut self,
        handle: SocketHandle,
        addr: SocketAddr,
    ) -> io::Result<()> {
        let (family, transport) = match self.get(handle)? {
            SysSocket::Pending(family, transport) => (*family, *transport),
            _ => return Err(io::ErrorKind::AlreadyExists.into()),
        };
        if family != Family::of(&addr) {
            return Err(io::ErrorKind::Unsupported.into());
        }
        let socket = match transport {
            Transport::Udp => {
                let local: SocketAddr = match family {
                    Family::V4 => "0.0.0.0:0".parse().expect("fixed address"),
                    Family::V6 => "[::]:0".parse().expect("fixed address"),
                };
                let socket = UdpSocket::bind(local)?;
                socket.connect(addr)?;
                socket.set_nonblocking(true)?;
                SysSocket::Udp(socket)
            }
            Transport::Tcp => {
                let domain = match family {
                    Family::V4 => Domain::IPV4,
                    Family::V6 => Domain::IPV6,
                };
                let socket =
                    Socket::new(domain, Type::STREAM, Some(Protocol::TCP))?;
                socket.set_nonblocking(true)?;
                // Initiate a non-blocking connect. An in-progress report
                // is expected here; completion shows up as write
                // readiness.
                match socket.connect(&addr.into()) {
                    Ok(()) => {}
                    Err(ref err) if connect_in_progress(err) => {}
                    Err(err) => return Err(err),
                }
                let stream: TcpStream = socket.into();
                stream.set_nodelay(true)?;
                SysSocket::Tcp(stream)
            }
        };
        self.sockets.insert(handle, socket);
        Ok(())
    }

    fn write(
        &mut self,
        handle: SocketHandle,
        data: &[u8],
    ) -> io::Result<usize> {
        match self.get(handle)? {
            SysSocket::Udp(socket) => socket.send(data),
            SysSocket::Tcp(stream) => io::Write::write(stream, data),
            SysSocket::Pending(..) => Err(io::ErrorKind::NotConnected.into()),
        }
    }

    fn recv(
        &mut self,
        handle: SocketHandle,
        buf: &mut [u8],
    ) -> io::Result<usize> {
        match self.get(handle)? {
            SysSocket::Tcp(stream) => io::Read::read(stream, buf),
            SysSocket::Udp(socket) => socket.recv(buf),
            SysSocket::Pending(..) => Err(io::ErrorKind::NotConnected.into()),
        }
    }

    fn recv_from(
        &mut self,
        handle: SocketHandle,
        buf: &mut [u8],
    ) -> io::Result<(usize, SocketAddr)> {
        match self.get(handle)? {
            SysSocket::Udp(socket) => socket.recv_from(buf),
            _ => Err(io::ErrorKind::InvalidInput.into()),
        }
    }

    fn close(&mut self, handle: SocketHandle) {
        self.sockets.remove(&handle);
    }
}

/// Returns whether a connect error just reports an attempt in progress.
fn connect_in_progress(err: &io::Error) -> bool {
    if err.kind() == io::ErrorKind::WouldBlock {
        return true;
    }
    #[cfg(unix)]
    if err.raw_os_error() == Some(libc::EINPROGRESS) {
        return true;
    }
    false
}

//------------ MockProvider --------------------------------------------------

/// A scripted socket provider for driving the engine in tests.
///
/// Clones share the same state, so a test can keep one handle while the
/// channel owns another. Outbound writes are recorded, inbound traffic is
/// queued by the test and handed out on the next read.
#[derive(Clone, Debug, Default)]
pub struct MockProvider {
    /// The shared provider state.
    inner: Arc<Mutex<MockInner>>,
}

/// The state shared between clones of a [`MockProvider`].
#[derive(Debug, Default)]
struct MockInner {
    /// The next handle to give out.
    next: u64,

    /// All sockets ever opened, including closed ones.
    sockets: HashMap<SocketHandle, MockSocket>,

    /// Peer addresses whose connect attempts are refused.
    refused: Vec<SocketAddr>,

    /// Handles whose next write fails hard.
    fail_write: Vec<SocketHandle>,
}

/// One socket of a [`MockProvider`].
#[derive(Debug)]
struct MockSocket {
    /// The address family.
    family: Family,

    /// The transport protocol.
    transport: Transport,

    /// The peer address, once connected.
    peer: Option<SocketAddr>,

    /// Whether the socket is still open.
    open: bool,

    /// Everything the channel wrote, in write order.
    sent: Vec<Vec<u8>>,

    /// Scripted inbound traffic.
    rx: VecDeque<MockRx>,
}

/// One scripted inbound event.
#[derive(Debug)]
enum MockRx {
    /// A datagram from the given sender.
    Datagram(SocketAddr, Vec<u8>),

    /// A chunk of stream bytes.
    Stream(Vec<u8>),

    /// Stream end, the peer closed the connection.
    Eof,

    /// A hard error.
    Err(io::ErrorKind),
}

impl MockProvider {
    /// Creates a new provider without any sockets.
    pub fn new() -> Self {
        Default::default()
    }

    /// Refuses future connection attempts to `addr`.
    pub fn refuse(&self, addr: SocketAddr) {
        self.inner.lock().unwrap().refused.push(addr);
    }

    /// Makes the next write on `handle` fail hard.
    pub fn fail_next_write(&self, handle: SocketHandle) {
        self.inner.lock().unwrap().fail_write.push(handle);
    }

    /// Returns the open socket connected to `peer` over `transport`.
    pub fn lookup(
        &self,
        transport: Transport,
        peer: SocketAddr,
    ) -> Option<SocketHandle> {
        let inner = self.inner.lock().unwrap();
        let mut found: Option<SocketHandle> = None;
        for (handle, socket) in &inner.sockets {
            if socket.open
                && socket.transport == transport
                && socket.peer == Some(peer)
            {
                // Prefer the most recently opened socket.
                if found.map_or(true, |prev| prev < *handle) {
                    found = Some(*handle);
                }
            }
        }
        found
    }

    /// Returns whether the socket is still open.
    pub fn is_open(&self, handle: SocketHandle) -> bool {
        self.inner
            .lock()
            .unwrap()
            .sockets
            .get(&handle)
            .map(|socket| socket.open)
            .unwrap_or(false)
    }

    /// Returns the datagrams or stream chunks written to `handle`.
    pub fn sent(&self, handle: SocketHandle) -> Vec<Vec<u8>> {
        self.inner
            .lock()
            .unwrap()
            .sockets
            .get(&handle)
            .map(|socket| socket.sent.clone())
            .unwrap_or_default()
    }

    /// Returns all bytes written to `handle` as one stream.
    pub fn sent_stream(&self, handle: SocketHandle) -> Vec<u8> {
        self.sent(handle).concat()
    }

    /// Returns the number of writes across every socket ever opened.
    pub fn total_writes(&self) -> usize {
        let inner = self.inner.lock().unwrap();
        inner
            .sockets
            .values()
            .map(|socket| socket.sent.len())
            .sum()
    }

    /// Queues a datagram from `from` for delivery on `handle`.
    pub fn push_datagram(
        &self,
        handle: SocketHandle,
        from: SocketAddr,
        bytes: &[u8],
    ) {
        self.push(handle, MockRx::Datagram(from, bytes.to_vec()));
    }

    /// Queues stream bytes for delivery on `handle`.
    pub fn push_stream(&self, handle: SocketHandle, bytes: &[u8]) {
        self.push(handle, MockRx::Stream(bytes.to_vec()));
    }

    /// Queues a stream end for delivery on `handle`.
    pub fn push_eof(&self, handle: SocketHandle) {
        self.push(handle, MockRx::Eof);
    }

    /// Queues a hard read error for delivery on `handle`.
    pub fn push_error(&self, handle: SocketHandle, kind: io::ErrorKind) {
        self.push(handle, MockRx::Err(kind));
    }

    /// Queues one inbound event.
    fn push(&self, handle: SocketHandle, event: MockRx) {
        let mut inner = self.inner.lock().unwrap();
        let socket = inner
            .sockets
            .get_mut(&handle)
            .expect("pushing to unknown mock socket");
        socket.rx.push_back(event);
    }
}

impl SocketProvider for MockProvider {
    fn open(
        &mut self,
        family: Family,
        transport: Transport,
    ) -> io::Result<SocketHandle> {
        let mut inner = self.inner.lock().unwrap();
        let handle = SocketHandle(inner.next);
        inner.next += 1;
        inner.sockets.insert(
            handle,
            MockSocket {
                family,
                transport,
                peer: None,
                open: true,
                sent: Vec::new(),
                rx: VecDeque::new(),
            },
        );
        Ok(handle)
    }

    fn connect(
        &mut self,
        handle: SocketHandle,
        addr: SocketAddr,
    ) -> io::Result<()> {
        let mut inner = self.inner.lock().unwrap();
        if inner.refused.contains(&addr) {
            return Err(io::ErrorKind::ConnectionRefused.into());
        }
        let socket = inner
            .sockets
            .get_mut(&handle)
            .ok_or(io::ErrorKind::NotFound)?;
        if socket.family != Family::of(&addr) {
            return Err(io::ErrorKind::Unsupported.into());
        }
        socket.peer = Some(addr);
        Ok(())
    }

    fn write(
        &mut self,
        handle: SocketHandle,
        data: &[u8],
    ) -> io::Result<usize> {
        let mut inner = self.inner.lock().unwrap();
        if let Some(pos) =
            inner.fail_write.iter().position(|&failed| failed == handle)
        {
            inner.fail_write.remove(pos);
            return Err(io::ErrorKind::ConnectionReset.into());
        }
        let socket = inner
            .sockets
            .get_mut(&handle)
            .ok_or(io::ErrorKind::NotFound)?;
        socket.sent.push(data.to_vec());
        Ok(data.len())
    }

    fn recv(
        &mut self,
        handle: SocketHandle,
        buf: &mut [u8],
    ) -> io::Result<usize> {
        let mut inner = self.inner.lock().unwrap();
        let socket = inner
            .sockets
            .get_mut(&handle)
            .ok_or(io::ErrorKind::NotFound)?;
        match socket.rx.pop_front() {
            Some(MockRx::Stream(mut bytes)) => {
                let n = bytes.len().min(buf.len());
                buf[..n].copy_from_slice(&bytes[..n]);
                if n < bytes.len() {
                    bytes.drain(..n);
                    socket.rx.push_front(MockRx::Stream(bytes));
                }
                Ok(n)
            }
            Some(MockRx::Eof) => Ok(0),
            Some(MockRx::Err(kind)) => Err(kind.into()),
            Some(other @ MockRx::Datagram(..)) => {
                socket.rx.push_front(other);
                Err(io::ErrorKind::InvalidInput.into())
            }
            None => Err(io::ErrorKind::WouldBlock.into()),
        }
    }

    fn recv_from(
        &mut self,
        handle: SocketHandle,
        buf: &mut [u8],
    ) -> io::Result<(usize, SocketAddr)> {
        let mut inner = self.inner.lock().unwrap();
        let socket = inner
            .sockets
            .get_mut(&handle)
            .ok_or(io::ErrorKind::NotFound)?;
        match socket.rx.pop_front() {
            Some(MockRx::Datagram(from, bytes)) => {
                let n = bytes.len().min(buf.len());
                buf[..n].copy_from_slice(&bytes[..n]);
                Ok((n, from))
            }
            Some(MockRx::Err(kind)) => Err(kind.into()),
            Some(other) => {
                socket.rx.push_front(other);
                Err(io::ErrorKind::InvalidInput.into())
            }
            None => Err(io::ErrorKind::WouldBlock.into()),
        }
    }

    fn close(&mut self, handle: SocketHandle) {
        let mut inner = self.inner.lock().unwrap();
        if let Some(socket) = inner.sockets.get_mut(&handle) {
            socket.open = false;
        }
    }
}

//============ Test ==========================================================

#[cfg(test)]
mod test {
    use super::*;

    fn addr() -> SocketAddr {
        "192.0.2.1:53".parse().unwrap()
    }

    #[test]
    fn mock_round_trip() {
        let mock = MockProvider::new();
        let mut provider = mock.clone();
        let handle =
            provider.open(Family::V4, Transport::Udp).unwrap();
        provider.connect(handle, addr()).unwrap();
        provider.write(handle, b"query").unwrap();
        assert_eq!(mock.sent(handle), vec![b"query".to_vec()]);
        assert_eq!(mock.lookup(Transport::Udp, addr()), Some(handle));

        let mut buf = [0u8; 16];
        assert_eq!(
            provider.recv_from(handle, &mut buf).unwrap_err().kind(),
            io::ErrorKind::WouldBlock
        );
        mock.push_datagram(handle, addr(), b"reply");
        let (n, from) = provider.recv_from(handle, &mut buf).unwrap();
        assert_eq!(&buf[..n], b"reply");
        assert_eq!(from, addr());
    }

    #[test]
    fn mock_stream_chunks_and_eof() {
        let mock = MockProvider::new();
        let mut provider = mock.clone();
        let handle =
            provider.open(Family::V4, Transport::Tcp).unwrap();
        provider.connect(handle, addr()).unwrap();
        mock.push_stream(handle, b"abcdef");
        mock.push_eof(handle);

        let mut buf = [0u8; 4];
        assert_eq!(provider.recv(handle, &mut buf).unwrap(), 4);
        assert_eq!(&buf, b"abcd");
        assert_eq!(provider.recv(handle, &mut buf).unwrap(), 2);
        assert_eq!(&buf[..2], b"ef");
        assert_eq!(provider.recv(handle, &mut buf).unwrap(), 0);
    }

    #[test]
    fn mock_refuses_connections() {
        let mock = MockProvider::new();
        mock.refuse(addr());
        let mut provider = mock.clone();
        let handle =
            provider.open(Family::V4, Transport::Udp).unwrap();
        assert_eq!(
            provider.connect(handle, addr()).unwrap_err().kind(),
            io::ErrorKind::ConnectionRefused
        );
    }
}
