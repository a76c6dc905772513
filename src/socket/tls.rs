use std::io::{self, Read, Write};
use std::sync::{Arc, LazyLock};

use rustls::crypto::CryptoProvider;
use rustls::pki_types::ServerName;
use rustls::{ClientConfig, ClientConnection, RootCertStore};
use tracing::debug;

use super::error::TransportError;
use super::secure::{HandshakeStatus, ReadWrite, SecureChannel};

static CRYPTO_PROVIDER: LazyLock<Arc<CryptoProvider>> =
    LazyLock::new(|| Arc::new(rustls::crypto::ring::default_provider()));

/// rustls client session used as the secure channel backend.
pub struct TlsChannel {
    conn: ClientConnection,
}

impl TlsChannel {
    /// Client session for `server_name`, trusting the webpki root set.
    pub fn client(server_name: &str) -> Result<Self, TransportError> {
        let roots = RootCertStore {
            roots: webpki_roots::TLS_SERVER_ROOTS.to_vec(),
        };

        let config = ClientConfig::builder_with_provider(CRYPTO_PROVIDER.clone())
            .with_safe_default_protocol_versions()
            .map_err(|e| TransportError::Handshake(e.to_string()))?
            .with_root_certificates(roots)
            .with_no_client_auth();

        let name = ServerName::try_from(server_name.to_string()).map_err(|e| {
            TransportError::Handshake(format!("invalid server name {:?}: {}", server_name, e))
        })?;

        let conn = ClientConnection::new(Arc::new(config), name)
            .map_err(|e| TransportError::Handshake(e.to_string()))?;

        Ok(Self { conn })
    }

    /// Writes queued ciphertext. Returns false when the transport would
    /// block with records still queued; they go out on the next call.
    fn flush_tls(&mut self, io: &mut dyn ReadWrite) -> io::Result<bool> {
        let mut io = io;
        while self.conn.wants_write() {
            match self.conn.write_tls(&mut io) {
                Ok(_) => {}
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(false),
                Err(e) => return Err(e),
            }
        }
        Ok(true)
    }
}

impl SecureChannel for TlsChannel {
    fn handshake(&mut self, mut io: &mut dyn ReadWrite) -> io::Result<HandshakeStatus> {
        while self.conn.is_handshaking() {
            match self.conn.complete_io(&mut io) {
                Ok(_) => {}
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                    return Ok(HandshakeStatus::WantIo);
                }
                Err(e) => return Err(e),
            }
        }
        Ok(HandshakeStatus::Complete)
    }

    fn read(&mut self, mut io: &mut dyn ReadWrite, buf: &mut [u8]) -> io::Result<usize> {
        loop {
            match self.conn.reader().read(buf) {
                Ok(n) => return Ok(n),
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {}
                Err(e) => return Err(e),
            }

            self.flush_tls(io)?;
            if self.conn.read_tls(&mut io)? == 0 {
                return Ok(0);
            }
            self.conn
                .process_new_packets()
                .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
        }
    }

    /// Reports every plaintext byte rustls took, even if the resulting
    /// records are still queued behind a blocked transport.
    fn write(&mut self, io: &mut dyn ReadWrite, buf: &[u8]) -> io::Result<usize> {
        if !self.flush_tls(io)? {
            return Err(io::ErrorKind::WouldBlock.into());
        }

        let mut accepted = 0;
        while accepted < buf.len() {
            let n = self.conn.writer().write(&buf[accepted..])?;
            accepted += n;
            if n == 0 || !self.flush_tls(io)? {
                break;
            }
        }
        Ok(accepted)
    }

    fn shutdown(&mut self, io: &mut dyn ReadWrite) -> io::Result<()> {
        self.conn.send_close_notify();
        if !self.flush_tls(io)? {
            debug!("close_notify still queued at shutdown");
        }
        Ok(())
    }
}
