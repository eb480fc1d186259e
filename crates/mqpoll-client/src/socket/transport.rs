//! Plain TCP or TLS-wrapped byte stream.

use std::io::{self, IoSlice, Read, Write};

use mio::net::TcpStream;
#[cfg(feature = "tls")]
use rustls::ClientConnection;

/// Transport layer abstraction for plain TCP and TLS connections.
pub enum Transport {
    /// Plain TCP connection.
    Plain(TcpStream),
    /// TLS-wrapped TCP connection.
    #[cfg(feature = "tls")]
    Tls(Box<rustls::StreamOwned<ClientConnection, TcpStream>>),
}

impl Transport {
    /// Wrap the TCP stream in a TLS session. The handshake is driven later
    /// by [`Transport::continue_handshake`].
    #[cfg(feature = "tls")]
    pub fn into_tls(self, conn: ClientConnection) -> Self {
        match self {
            Transport::Plain(stream) => {
                Transport::Tls(Box::new(rustls::StreamOwned::new(conn, stream)))
            }
            tls @ Transport::Tls(_) => tls,
        }
    }

    /// Underlying TCP stream.
    pub fn tcp_stream(&self) -> &TcpStream {
        match self {
            Transport::Plain(s) => s,
            #[cfg(feature = "tls")]
            Transport::Tls(s) => s.get_ref(),
        }
    }

    /// Mutable TCP stream for mio registration.
    pub fn tcp_stream_mut(&mut self) -> &mut TcpStream {
        match self {
            Transport::Plain(s) => s,
            #[cfg(feature = "tls")]
            Transport::Tls(s) => s.get_mut(),
        }
    }

    /// Push the TLS handshake forward as far as the socket allows.
    ///
    /// `Ok(true)` once the handshake is complete (always for plain TCP).
    pub fn continue_handshake(&mut self) -> io::Result<bool> {
        match self {
            Transport::Plain(_) => Ok(true),
            #[cfg(feature = "tls")]
            Transport::Tls(s) => {
                let s = &mut **s;
                while s.conn.is_handshaking() {
                    match s.conn.complete_io(&mut s.sock) {
                        Ok((0, 0)) => return Ok(false),
                        Ok(_) => {}
                        Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(false),
                        Err(e) => return Err(e),
                    }
                }
                Ok(true)
            }
        }
    }

    /// Write out TLS records rustls is still holding.
    ///
    /// `Ok(true)` when nothing is left buffered.
    pub fn flush_tls(&mut self) -> io::Result<bool> {
        match self {
            Transport::Plain(_) => Ok(true),
            #[cfg(feature = "tls")]
            Transport::Tls(s) => {
                let s = &mut **s;
                while s.conn.wants_write() {
                    match s.conn.write_tls(&mut s.sock) {
                        Ok(_) => {}
                        Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(false),
                        Err(e) => return Err(e),
                    }
                }
                Ok(true)
            }
        }
    }

    /// Best-effort close_notify before the socket is dropped.
    pub fn shutdown(&mut self) {
        match self {
            Transport::Plain(s) => {
                let _ = s.shutdown(std::net::Shutdown::Both);
            }
            #[cfg(feature = "tls")]
            Transport::Tls(s) => {
                s.conn.send_close_notify();
                let _ = self.flush_tls();
                let _ = self.tcp_stream().shutdown(std::net::Shutdown::Both);
            }
        }
    }
}

impl Read for Transport {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self {
            Transport::Plain(s) => s.read(buf),
            #[cfg(feature = "tls")]
            Transport::Tls(s) => s.read(buf),
        }
    }
}

impl Write for Transport {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self {
            Transport::Plain(s) => s.write(buf),
            #[cfg(feature = "tls")]
            Transport::Tls(s) => s.write(buf),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match self {
            Transport::Plain(s) => s.flush(),
            #[cfg(feature = "tls")]
            Transport::Tls(s) => s.flush(),
        }
    }

    fn write_vectored(&mut self, bufs: &[IoSlice<'_>]) -> io::Result<usize> {
        match self {
            Transport::Plain(s) => s.write_vectored(bufs),
            #[cfg(feature = "tls")]
            Transport::Tls(s) => s.write_vectored(bufs),
        }
    }
}
