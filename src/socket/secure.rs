use bytes::{Buf, BytesMut};
use std::io::{self, Read, Write};

const READ_AHEAD_CAPACITY: usize = 4096;

/// Byte transport a secure channel runs over.
pub trait ReadWrite: Read + Write {}

impl<T: Read + Write + ?Sized> ReadWrite for T {}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandshakeStatus {
    Complete,
    /// The handshake needs more socket I/O before it can finish.
    WantIo,
}

/// Record layer of a secure channel.
///
/// Implementations do not own the socket; every call receives the transport
/// to use. `read` returns `Ok(0)` once the peer closed the channel and fails
/// with [`io::ErrorKind::WouldBlock`] when no application data is available
/// on a non-blocking transport.
pub trait SecureChannel: Send {
    fn handshake(&mut self, io: &mut dyn ReadWrite) -> io::Result<HandshakeStatus>;

    fn read(&mut self, io: &mut dyn ReadWrite, buf: &mut [u8]) -> io::Result<usize>;

    fn write(&mut self, io: &mut dyn ReadWrite, buf: &[u8]) -> io::Result<usize>;

    fn shutdown(&mut self, io: &mut dyn ReadWrite) -> io::Result<()>;
}

/// A [`SecureChannel`] plus the read-ahead buffer backing `peek`.
///
/// Peeked bytes are appended to the buffer and handed out again, oldest
/// first, by the next reads. The buffered region never shrinks or reorders
/// except through `read`.
pub struct SecureStream {
    channel: Box<dyn SecureChannel>,
    read_ahead: BytesMut,
    handshake_pending: bool,
}

impl SecureStream {
    pub fn new(channel: Box<dyn SecureChannel>) -> Self {
        Self {
            channel,
            read_ahead: BytesMut::with_capacity(READ_AHEAD_CAPACITY),
            handshake_pending: true,
        }
    }

    pub fn handshake(&mut self, io: &mut dyn ReadWrite) -> io::Result<HandshakeStatus> {
        let status = self.channel.handshake(io)?;
        self.handshake_pending = status == HandshakeStatus::WantIo;
        Ok(status)
    }

    pub fn is_handshake_pending(&self) -> bool {
        self.handshake_pending
    }

    /// Bytes pulled from the channel but not consumed yet.
    pub fn buffered(&self) -> usize {
        self.read_ahead.len()
    }

    pub fn read(&mut self, io: &mut dyn ReadWrite, buf: &mut [u8]) -> io::Result<usize> {
        let taken = self.read_ahead.len().min(buf.len());
        buf[..taken].copy_from_slice(&self.read_ahead[..taken]);
        self.read_ahead.advance(taken);

        if taken == buf.len() {
            return Ok(taken);
        }

        match self.channel.read(io, &mut buf[taken..]) {
            Ok(n) => Ok(taken + n),
            Err(e) if taken > 0 && is_transient(&e) => Ok(taken),
            Err(e) => Err(e),
        }
    }

    pub fn peek(&mut self, io: &mut dyn ReadWrite, buf: &mut [u8]) -> io::Result<usize> {
        let buffered = self.read_ahead.len();
        if buffered >= buf.len() {
            buf.copy_from_slice(&self.read_ahead[..buf.len()]);
            return Ok(buf.len());
        }

        buf[..buffered].copy_from_slice(&self.read_ahead);
        match self.channel.read(io, &mut buf[buffered..]) {
            Ok(n) => {
                self.read_ahead
                    .extend_from_slice(&buf[buffered..buffered + n]);
                Ok(buffered + n)
            }
            Err(e) if buffered > 0 && is_transient(&e) => Ok(buffered),
            Err(e) => Err(e),
        }
    }

    pub fn write(&mut self, io: &mut dyn ReadWrite, buf: &[u8]) -> io::Result<usize> {
        self.channel.write(io, buf)
    }

    pub fn shutdown(&mut self, io: &mut dyn ReadWrite) -> io::Result<()> {
        self.read_ahead.clear();
        self.channel.shutdown(io)
    }
}

fn is_transient(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted
    )
}
