use std::fmt;
use std::io::{self, Read, Write};
use std::net::{Ipv4Addr, SocketAddr, TcpListener, TcpStream, ToSocketAddrs, UdpSocket};
use std::os::fd::{AsFd, BorrowedFd};
use std::time::Duration;

use nix::errno::Errno;
use nix::poll::{poll, PollFd, PollFlags, PollTimeout};
use socket2::{Domain, Protocol, Socket, Type};
use tracing::debug;

use super::addr::PeerAddr;
use super::error::TransportError;
use super::secure::{HandshakeStatus, SecureChannel, SecureStream};
use super::tls::TlsChannel;

const LISTEN_BACKLOG: i32 = 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SocketKind {
    Stream,
    Datagram,
}

impl SocketKind {
    fn socket_type(self) -> Type {
        match self {
            SocketKind::Stream => Type::STREAM,
            SocketKind::Datagram => Type::DGRAM,
        }
    }
}

enum Endpoint {
    /// Bound stream socket that is not listening yet.
    Bound(Socket),
    Listener(TcpListener),
    Stream(TcpStream),
    Datagram(UdpSocket),
}

impl Endpoint {
    fn as_fd(&self) -> BorrowedFd<'_> {
        match self {
            Endpoint::Bound(s) => s.as_fd(),
            Endpoint::Listener(s) => s.as_fd(),
            Endpoint::Stream(s) => s.as_fd(),
            Endpoint::Datagram(s) => s.as_fd(),
        }
    }

    fn set_nonblocking(&self, nonblocking: bool) -> io::Result<()> {
        match self {
            Endpoint::Bound(s) => s.set_nonblocking(nonblocking),
            Endpoint::Listener(s) => s.set_nonblocking(nonblocking),
            Endpoint::Stream(s) => s.set_nonblocking(nonblocking),
            Endpoint::Datagram(s) => s.set_nonblocking(nonblocking),
        }
    }

    fn local_addr(&self) -> io::Result<SocketAddr> {
        match self {
            Endpoint::Bound(s) => s.local_addr()?.as_socket().ok_or_else(|| {
                io::Error::new(io::ErrorKind::Unsupported, "not an inet socket")
            }),
            Endpoint::Listener(s) => s.local_addr(),
            Endpoint::Stream(s) => s.local_addr(),
            Endpoint::Datagram(s) => s.local_addr(),
        }
    }
}

/// One stream or datagram connection.
///
/// Stream sockets are set up either with [`bind`](Self::bind) +
/// [`begin_listen`](Self::begin_listen) + [`accept_connection`](Self::accept_connection)
/// or with [`establish_connection`](Self::establish_connection), which always
/// connects in non-blocking mode. Datagram sockets are usable right after
/// `bind`.
///
/// # Examples
///
/// ```no_run
/// use rdht::socket::TransportSocket;
/// use std::time::Duration;
///
/// # fn main() -> Result<(), rdht::socket::TransportError> {
/// let mut socket = TransportSocket::stream();
/// socket.establish_connection("example.com", 443)?;
/// while !socket.is_writable(Duration::from_secs(1))? {}
/// socket.set_blocking_mode()?;
/// socket.initiate_secure_connection()?;
/// socket.write_data(b"GET / HTTP/1.0\r\n\r\n")?;
/// # Ok(())
/// # }
/// ```
pub struct TransportSocket {
    kind: SocketKind,
    endpoint: Option<Endpoint>,
    blocking: bool,
    secure: Option<SecureStream>,
    peer_host: Option<String>,
}

impl TransportSocket {
    pub fn new(kind: SocketKind) -> Self {
        Self {
            kind,
            endpoint: None,
            blocking: true,
            secure: None,
            peer_host: None,
        }
    }

    pub fn stream() -> Self {
        Self::new(SocketKind::Stream)
    }

    pub fn datagram() -> Self {
        Self::new(SocketKind::Datagram)
    }

    pub fn kind(&self) -> SocketKind {
        self.kind
    }

    pub fn is_open(&self) -> bool {
        self.endpoint.is_some()
    }

    pub fn is_blocking(&self) -> bool {
        self.blocking
    }

    pub fn is_secure(&self) -> bool {
        self.secure.is_some()
    }

    /// Bytes held in the secure read-ahead buffer.
    pub fn buffered_len(&self) -> usize {
        self.secure.as_ref().map_or(0, SecureStream::buffered)
    }

    /// Opens an IPv4 socket of this socket's kind bound to `0.0.0.0:port`.
    pub fn bind(&mut self, port: u16) -> Result<(), TransportError> {
        self.close_connection();

        let socket = Socket::new(Domain::IPV4, self.kind.socket_type(), None)
            .map_err(TransportError::io("socket"))?;
        socket
            .set_reuse_address(true)
            .map_err(TransportError::io("setsockopt"))?;

        let addr = SocketAddr::from((Ipv4Addr::UNSPECIFIED, port));
        socket
            .bind(&addr.into())
            .map_err(TransportError::io("bind"))?;

        self.endpoint = Some(match self.kind {
            SocketKind::Stream => Endpoint::Bound(socket),
            SocketKind::Datagram => Endpoint::Datagram(socket.into()),
        });
        self.blocking = true;
        Ok(())
    }

    pub fn begin_listen(&mut self) -> Result<(), TransportError> {
        let socket = match self.endpoint.take() {
            Some(Endpoint::Bound(socket)) => socket,
            other => {
                self.endpoint = other;
                return Err(TransportError::NotBound);
            }
        };

        socket
            .listen(LISTEN_BACKLOG)
            .map_err(TransportError::io("listen"))?;
        self.endpoint = Some(Endpoint::Listener(socket.into()));
        Ok(())
    }

    /// Accepts one pending connection as a new, blocking socket.
    pub fn accept_connection(&self) -> Result<TransportSocket, TransportError> {
        let Some(Endpoint::Listener(listener)) = &self.endpoint else {
            return Err(TransportError::NotBound);
        };

        let (stream, _) = retry_interrupted(|| listener.accept())
            .map_err(TransportError::io("accept"))?;
        stream
            .set_nonblocking(false)
            .map_err(TransportError::io("fcntl"))?;

        Ok(TransportSocket {
            kind: SocketKind::Stream,
            endpoint: Some(Endpoint::Stream(stream)),
            blocking: true,
            secure: None,
            peer_host: None,
        })
    }

    /// Starts a non-blocking connect to `host:port`.
    ///
    /// Returns as soon as the connect is in progress; poll
    /// [`is_writable`](Self::is_writable) to learn when it completed.
    pub fn establish_connection(&mut self, host: &str, port: u16) -> Result<(), TransportError> {
        if self.kind != SocketKind::Stream {
            return Err(TransportError::WrongKind("stream"));
        }
        self.close_connection();

        let addr = resolve(host, port)?;
        let socket = Socket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))
            .map_err(TransportError::io("socket"))?;
        socket
            .set_reuse_address(true)
            .map_err(TransportError::io("setsockopt"))?;
        socket
            .set_nonblocking(true)
            .map_err(TransportError::io("fcntl"))?;
        self.blocking = false;

        match socket.connect(&addr.into()) {
            Ok(()) => {}
            Err(e) if is_in_progress(&e) => {}
            Err(source) => {
                return Err(TransportError::Connect {
                    addr: format!("{}:{}", host, port),
                    source,
                })
            }
        }

        debug!("connecting to {} ({})", host, addr);
        self.endpoint = Some(Endpoint::Stream(socket.into()));
        self.peer_host = Some(host.to_string());
        Ok(())
    }

    pub fn set_blocking_mode(&mut self) -> Result<(), TransportError> {
        self.set_mode(true)
    }

    pub fn set_non_blocking_mode(&mut self) -> Result<(), TransportError> {
        self.set_mode(false)
    }

    fn set_mode(&mut self, blocking: bool) -> Result<(), TransportError> {
        let endpoint = self.endpoint.as_ref().ok_or(TransportError::NotConnected)?;
        endpoint
            .set_nonblocking(!blocking)
            .map_err(TransportError::io("fcntl"))?;
        self.blocking = blocking;
        Ok(())
    }

    /// Waits up to `timeout` for readable data.
    ///
    /// Buffered secure plaintext counts as readable without polling the OS.
    pub fn is_readable(&self, timeout: Duration) -> Result<bool, TransportError> {
        if self.buffered_len() > 0 {
            return Ok(true);
        }
        self.poll_ready(PollFlags::POLLIN, timeout)
    }

    pub fn is_writable(&self, timeout: Duration) -> Result<bool, TransportError> {
        self.poll_ready(PollFlags::POLLOUT, timeout)
    }

    fn poll_ready(&self, events: PollFlags, timeout: Duration) -> Result<bool, TransportError> {
        let endpoint = self.endpoint.as_ref().ok_or(TransportError::NotConnected)?;

        let millis = i32::try_from(timeout.as_millis()).unwrap_or(i32::MAX);
        let timeout = PollTimeout::try_from(millis).unwrap_or(PollTimeout::MAX);
        let mut fds = [PollFd::new(endpoint.as_fd(), events)];

        match poll(&mut fds, timeout) {
            Ok(0) => Ok(false),
            Ok(_) => Ok(fds[0].revents().is_some_and(|r| !r.is_empty())),
            Err(Errno::EINTR | Errno::EINPROGRESS) => Ok(false),
            Err(e) => Err(TransportError::Poll(e.into())),
        }
    }

    /// Writes all of `data` or fails; a short send is an error.
    pub fn write_data(&mut self, data: &[u8]) -> Result<(), TransportError> {
        let sent = self.send(data).map_err(TransportError::io("send"))?;
        if sent != data.len() {
            return Err(TransportError::ShortWrite {
                sent,
                expected: data.len(),
            });
        }
        Ok(())
    }

    /// Writes as much of `data` as the socket accepts right now.
    ///
    /// Returns 0 instead of failing when a non-blocking socket would block.
    pub fn write_data_partial(&mut self, data: &[u8]) -> Result<usize, TransportError> {
        match self.send(data) {
            Ok(n) => Ok(n),
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => Ok(0),
            Err(e) => Err(TransportError::io("send")(e)),
        }
    }

    fn send(&mut self, data: &[u8]) -> io::Result<usize> {
        let stream = connected_stream(&self.endpoint)?;
        let mut io = stream;
        match self.secure.as_mut() {
            Some(secure) => secure.write(&mut io, data),
            None => retry_interrupted(|| io.write(data)),
        }
    }

    /// Reads into `buf`; 0 means the peer closed the stream.
    pub fn read_data(&mut self, buf: &mut [u8]) -> Result<usize, TransportError> {
        let stream = connected_stream(&self.endpoint).map_err(TransportError::io("recv"))?;
        let mut io = stream;
        let result = match self.secure.as_mut() {
            Some(secure) => secure.read(&mut io, buf),
            None => retry_interrupted(|| io.read(buf)),
        };
        result.map_err(TransportError::io("recv"))
    }

    /// Returns upcoming bytes without consuming them.
    pub fn peek_data(&mut self, buf: &mut [u8]) -> Result<usize, TransportError> {
        let stream = connected_stream(&self.endpoint).map_err(TransportError::io("peek"))?;
        let result = match self.secure.as_mut() {
            Some(secure) => {
                let mut io = stream;
                secure.peek(&mut io, buf)
            }
            None => retry_interrupted(|| stream.peek(buf)),
        };
        result.map_err(TransportError::io("peek"))
    }

    /// Negotiates TLS with the host given to `establish_connection`.
    pub fn initiate_secure_connection(&mut self) -> Result<(), TransportError> {
        if self.secure.is_some() {
            return Ok(());
        }
        let host = self.peer_host.clone().ok_or(TransportError::NotConnected)?;
        let channel = TlsChannel::client(&host)?;
        self.initiate_secure_connection_with(Box::new(channel))
    }

    /// Negotiates a secure channel using the given backend.
    ///
    /// A handshake that needs more I/O is accepted on a non-blocking socket
    /// (drive it with [`continue_secure_handshake`](Self::continue_secure_handshake))
    /// and is fatal on a blocking one.
    pub fn initiate_secure_connection_with(
        &mut self,
        channel: Box<dyn SecureChannel>,
    ) -> Result<(), TransportError> {
        if self.secure.is_some() {
            return Ok(());
        }
        let Some(Endpoint::Stream(stream)) = &self.endpoint else {
            return Err(TransportError::NotConnected);
        };

        let mut secure = SecureStream::new(channel);
        let mut io = stream;
        match secure.handshake(&mut io) {
            Ok(HandshakeStatus::Complete) => {}
            Ok(HandshakeStatus::WantIo) if !self.blocking => {
                debug!("secure handshake in progress");
            }
            Ok(HandshakeStatus::WantIo) => {
                return Err(TransportError::Handshake(
                    "handshake needs more I/O on a blocking socket".into(),
                ));
            }
            Err(e) => return Err(TransportError::Handshake(e.to_string())),
        }

        self.secure = Some(secure);
        Ok(())
    }

    /// Re-drives a pending handshake. Returns true once it completed.
    pub fn continue_secure_handshake(&mut self) -> Result<bool, TransportError> {
        let (Some(secure), Some(Endpoint::Stream(stream))) = (self.secure.as_mut(), &self.endpoint)
        else {
            return Err(TransportError::NotConnected);
        };
        if !secure.is_handshake_pending() {
            return Ok(true);
        }

        let mut io = stream;
        match secure.handshake(&mut io) {
            Ok(status) => Ok(status == HandshakeStatus::Complete),
            Err(e) => Err(TransportError::Handshake(e.to_string())),
        }
    }

    /// Sends one datagram, resolving `host` for this call only.
    pub fn write_data_to(&self, data: &[u8], host: &str, port: u16) -> Result<usize, TransportError> {
        let addr = resolve(host, port)?;
        self.send_datagram_to(data, addr)
    }

    pub(crate) fn send_datagram_to(&self, data: &[u8], addr: SocketAddr) -> Result<usize, TransportError> {
        let socket = self.datagram_socket()?;
        retry_interrupted(|| socket.send_to(data, addr)).map_err(TransportError::io("sendto"))
    }

    /// Receives one datagram and reports its numeric sender.
    pub fn read_data_from(&self, buf: &mut [u8]) -> Result<(usize, PeerAddr), TransportError> {
        let socket = self.datagram_socket()?;
        let (len, sender) =
            retry_interrupted(|| socket.recv_from(buf)).map_err(TransportError::io("recvfrom"))?;
        Ok((len, PeerAddr::from(sender)))
    }

    fn datagram_socket(&self) -> Result<&UdpSocket, TransportError> {
        match &self.endpoint {
            Some(Endpoint::Datagram(socket)) => Ok(socket),
            Some(_) => Err(TransportError::WrongKind("datagram")),
            None => Err(TransportError::NotBound),
        }
    }

    pub fn local_addr(&self) -> Result<PeerAddr, TransportError> {
        let endpoint = self.endpoint.as_ref().ok_or(TransportError::NotBound)?;
        endpoint
            .local_addr()
            .map(PeerAddr::from)
            .map_err(TransportError::io("getsockname"))
    }

    pub fn peer_addr(&self) -> Result<PeerAddr, TransportError> {
        match &self.endpoint {
            Some(Endpoint::Stream(stream)) => stream
                .peer_addr()
                .map(PeerAddr::from)
                .map_err(TransportError::io("getpeername")),
            _ => Err(TransportError::NotConnected),
        }
    }

    /// Shuts the secure channel down and releases the OS socket. Idempotent.
    pub fn close_connection(&mut self) {
        if let Some(mut secure) = self.secure.take() {
            if let Some(Endpoint::Stream(stream)) = &self.endpoint {
                let mut io = stream;
                if let Err(e) = secure.shutdown(&mut io) {
                    debug!("secure shutdown failed: {}", e);
                }
            }
        }
        self.endpoint = None;
        self.peer_host = None;
    }
}

impl Drop for TransportSocket {
    fn drop(&mut self) {
        self.close_connection();
    }
}

impl fmt::Debug for TransportSocket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TransportSocket")
            .field("kind", &self.kind)
            .field("open", &self.is_open())
            .field("blocking", &self.blocking)
            .field("secure", &self.is_secure())
            .field("buffered", &self.buffered_len())
            .finish()
    }
}

fn resolve(host: &str, port: u16) -> Result<SocketAddr, TransportError> {
    let resolve_err = |source| TransportError::Resolve {
        host: host.to_string(),
        source,
    };

    let addrs: Vec<SocketAddr> = (host, port).to_socket_addrs().map_err(resolve_err)?.collect();
    addrs
        .iter()
        .find(|a| a.is_ipv4())
        .or_else(|| addrs.first())
        .copied()
        .ok_or_else(|| resolve_err(io::Error::new(io::ErrorKind::NotFound, "no addresses")))
}

fn connected_stream(endpoint: &Option<Endpoint>) -> io::Result<&TcpStream> {
    match endpoint {
        Some(Endpoint::Stream(stream)) => Ok(stream),
        _ => Err(io::Error::new(
            io::ErrorKind::NotConnected,
            "socket is not a connected stream",
        )),
    }
}

fn is_in_progress(e: &io::Error) -> bool {
    e.kind() == io::ErrorKind::WouldBlock || e.raw_os_error() == Some(Errno::EINPROGRESS as i32)
}

fn retry_interrupted<T>(mut op: impl FnMut() -> io::Result<T>) -> io::Result<T> {
    loop {
        match op() {
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            result => return result,
        }
    }
}
