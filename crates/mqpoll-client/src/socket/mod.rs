//! Non-blocking socket layer shared by every client of a context.
//!
//! Sockets are registered with one mio poller. Readiness is edge-triggered,
//! so each socket keeps a readable/writable flag that is set by poll events
//! and cleared only when an operation hits `WouldBlock`. The dispatch loop
//! asks for one ready socket at a time; a round-robin cursor keeps a busy
//! socket from starving the others.

mod pending;
mod receive;
mod transport;

use std::io::{self, Read, Write};
use std::net::SocketAddr;

use ahash::AHashMap;
use bytes::{Bytes, BytesMut};
use mio::event::Event;
use mio::net::TcpStream;
use mio::{Interest, Registry, Token};
use mqpoll_core::ProtocolError;
use thiserror::Error;

use crate::error::ClientError;
use crate::registry::Publication;

pub use pending::PendingWrite;
pub use receive::{ByteSource, Frame, FrameAssembler};
pub use transport::Transport;

/// Token reserved for the poller's waker.
pub const WAKER_TOKEN: Token = Token(0);

const READ_CHUNK: usize = 4096;
/// Stop filling the inbox past this so one socket cannot monopolize a cycle.
const MAX_INBOX: usize = 64 * 1024;

/// Error reading from a socket.
#[derive(Error, Debug)]
pub enum SocketError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("Connection closed by peer")]
    PeerClosed,

    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),
}

impl From<SocketError> for ClientError {
    fn from(e: SocketError) -> Self {
        match e {
            SocketError::Io(e) => ClientError::Io(e),
            SocketError::PeerClosed => ClientError::Disconnected,
            SocketError::Protocol(e) => ClientError::Protocol(e),
        }
    }
}

/// Outcome of starting a connect.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectStatus {
    Connected,
    InProgress,
}

/// Outcome of a write request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteStatus {
    /// Every byte was handed to the kernel.
    Complete,
    /// The remainder is held as the socket's pending write.
    Interrupted,
}

/// Readiness reported by one poll event, detached from the poller so it can
/// be applied under a different lock.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Readiness {
    pub token: Token,
    pub readable: bool,
    pub writable: bool,
    pub error: bool,
}

impl From<&Event> for Readiness {
    fn from(event: &Event) -> Self {
        Self {
            token: event.token(),
            readable: event.is_readable() || event.is_read_closed(),
            writable: event.is_writable() || event.is_write_closed(),
            error: event.is_error(),
        }
    }
}

/// Stream plus the read-side buffers.
struct SocketIo {
    transport: Transport,
    readable: bool,
    writable: bool,
    eof: bool,
    /// Write failure found while flushing in the background, reported on the
    /// next read.
    failed: Option<io::Error>,
    inbox: BytesMut,
    /// Body bytes collected by an unfinished `read_exact`.
    partial: BytesMut,
}

impl SocketIo {
    /// Read whatever the socket has into the inbox. Returns whether any
    /// bytes were added.
    fn fill(&mut self) -> Result<bool, SocketError> {
        if let Some(e) = self.failed.take() {
            return Err(SocketError::Io(e));
        }
        if self.eof {
            return Err(SocketError::PeerClosed);
        }
        if !self.readable {
            return Ok(false);
        }

        let mut added = false;
        let mut chunk = [0u8; READ_CHUNK];
        while self.inbox.len() < MAX_INBOX {
            match self.transport.read(&mut chunk) {
                Ok(0) => {
                    self.eof = true;
                    break;
                }
                Ok(n) => {
                    self.inbox.extend_from_slice(&chunk[..n]);
                    added = true;
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                    self.readable = false;
                    break;
                }
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => return Err(SocketError::Io(e)),
            }
        }

        if !added && self.eof {
            return Err(SocketError::PeerClosed);
        }
        Ok(added)
    }
}

impl ByteSource for SocketIo {
    fn read_byte(&mut self) -> Result<Option<u8>, SocketError> {
        if self.inbox.is_empty() && !self.fill()? {
            return Ok(None);
        }
        let byte = self.inbox[0];
        let _ = self.inbox.split_to(1);
        Ok(Some(byte))
    }

    fn read_exact(&mut self, n: usize) -> Result<Option<Bytes>, SocketError> {
        if self.partial.is_empty() && self.inbox.len() >= n {
            return Ok(Some(self.inbox.split_to(n).freeze()));
        }
        while self.partial.len() < n {
            if self.inbox.is_empty() && !self.fill()? {
                return Ok(None);
            }
            let take = (n - self.partial.len()).min(self.inbox.len());
            self.partial.extend_from_slice(&self.inbox.split_to(take));
        }
        Ok(Some(self.partial.split_to(n).freeze()))
    }
}

struct SocketEntry {
    io: SocketIo,
    connecting: bool,
    handshaking: bool,
    assembler: FrameAssembler,
    pending: Option<PendingWrite>,
    /// Bytes per write system call, for tests that need partial writes.
    write_limit: Option<usize>,
}

impl SocketEntry {
    fn is_ready(&self) -> bool {
        if self.connecting || self.handshaking {
            self.io.readable || self.io.writable
        } else {
            self.io.readable || !self.io.inbox.is_empty() || self.io.failed.is_some()
        }
    }

    /// Write as much of the pending record as the socket takes.
    ///
    /// `Ok(true)` once it is empty. With a write limit set, at most one
    /// system call is made per attempt.
    fn flush(&mut self) -> io::Result<bool> {
        let Some(pending) = self.pending.as_mut() else {
            return Ok(true);
        };
        loop {
            if pending.is_empty() {
                return Ok(true);
            }
            let result = {
                let slices = pending.io_slices(self.write_limit);
                self.io.transport.write_vectored(&slices)
            };
            match result {
                Ok(0) => {
                    return Err(io::Error::new(
                        io::ErrorKind::WriteZero,
                        "socket accepted no bytes",
                    ))
                }
                Ok(n) => {
                    pending.advance(n);
                    log::trace!("Wrote {} bytes, {} pending", n, pending.remaining());
                    if self.write_limit.is_some() {
                        return Ok(pending.is_empty());
                    }
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                    self.io.writable = false;
                    return Ok(false);
                }
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => return Err(e),
            }
        }
    }
}

/// Every socket of one context.
pub struct SocketSet {
    registry: Registry,
    entries: AHashMap<Token, SocketEntry>,
    order: Vec<Token>,
    cursor: usize,
    next_token: usize,
    completed_writes: Vec<Token>,
}

impl SocketSet {
    pub fn new(registry: &Registry) -> io::Result<Self> {
        Ok(Self {
            registry: registry.try_clone()?,
            entries: AHashMap::new(),
            order: Vec::new(),
            cursor: 0,
            next_token: WAKER_TOKEN.0 + 1,
            completed_writes: Vec::new(),
        })
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn contains(&self, token: Token) -> bool {
        self.entries.contains_key(&token)
    }

    /// Start a non-blocking connect and add the socket to the set.
    pub fn open(&mut self, addr: SocketAddr) -> io::Result<(Token, ConnectStatus)> {
        let mut stream = TcpStream::connect(addr)?;
        let token = Token(self.next_token);
        self.next_token += 1;
        self.registry
            .register(&mut stream, token, Interest::READABLE | Interest::WRITABLE)?;

        let status = match stream.peer_addr() {
            Ok(_) => ConnectStatus::Connected,
            Err(_) => ConnectStatus::InProgress,
        };
        if let Err(e) = stream.set_nodelay(true) {
            log::debug!("Could not set TCP_NODELAY on {:?}: {}", token, e);
        }
        log::debug!("Opened socket {:?} to {} ({:?})", token, addr, status);

        self.entries.insert(
            token,
            SocketEntry {
                io: SocketIo {
                    transport: Transport::Plain(stream),
                    readable: false,
                    writable: false,
                    eof: false,
                    failed: None,
                    inbox: BytesMut::with_capacity(READ_CHUNK),
                    partial: BytesMut::new(),
                },
                connecting: status == ConnectStatus::InProgress,
                handshaking: false,
                assembler: FrameAssembler::new(),
                pending: None,
                write_limit: None,
            },
        );
        self.order.push(token);
        Ok((token, status))
    }

    /// Record poll events. Events for unknown tokens are ignored.
    pub fn apply(&mut self, events: &[Readiness]) {
        for event in events {
            let Some(entry) = self.entries.get_mut(&event.token) else {
                continue;
            };
            // Errors surface through the next read or connect check.
            entry.io.readable |= event.readable || event.error;
            entry.io.writable |= event.writable;
        }
    }

    /// Push pending writes forward on every writable socket.
    ///
    /// Finished writes are collected for [`SocketSet::take_completed_writes`].
    /// A write error is parked on the socket and reported by its next read.
    pub fn flush_pending(&mut self) {
        for (token, entry) in self.entries.iter_mut() {
            if !entry.io.writable || entry.connecting || entry.handshaking {
                continue;
            }
            if let Err(e) = entry.io.transport.flush_tls() {
                entry.io.failed = Some(e);
                continue;
            }
            if entry.pending.is_none() {
                continue;
            }
            match entry.flush() {
                Ok(true) => {
                    entry.pending = None;
                    self.completed_writes.push(*token);
                    log::trace!("Pending write on {:?} complete", token);
                }
                Ok(false) => {}
                Err(e) => {
                    log::debug!("Pending write on {:?} failed: {}", token, e);
                    entry.pending = None;
                    entry.io.failed = Some(e);
                }
            }
        }
    }

    /// True when a pending write could make progress without waiting for
    /// another poll event.
    pub fn wants_immediate_poll(&self) -> bool {
        self.entries
            .values()
            .any(|e| e.pending.is_some() && e.io.writable)
    }

    /// Next socket with something to do, round-robin.
    pub fn next_ready(&mut self) -> Option<Token> {
        let n = self.order.len();
        for i in 0..n {
            let idx = (self.cursor + i) % n;
            let token = self.order[idx];
            if self.entries.get(&token).is_some_and(SocketEntry::is_ready) {
                self.cursor = (idx + 1) % n;
                return Some(token);
            }
        }
        None
    }

    /// Resolve an in-progress connect.
    ///
    /// `Ok(true)` once connected, `Ok(false)` while still in progress.
    pub fn finish_connect(&mut self, token: Token) -> io::Result<bool> {
        let entry = self.entry_mut(token)?;
        if !entry.connecting {
            return Ok(true);
        }
        let stream = entry.io.transport.tcp_stream();
        if let Some(e) = stream.take_error()? {
            return Err(e);
        }
        match stream.peer_addr() {
            Ok(_) => {
                entry.connecting = false;
                log::debug!("Socket {:?} connected", token);
                Ok(true)
            }
            Err(e)
                if e.kind() == io::ErrorKind::NotConnected
                    || e.kind() == io::ErrorKind::WouldBlock =>
            {
                entry.io.readable = false;
                entry.io.writable = false;
                Ok(false)
            }
            Err(e) => Err(e),
        }
    }

    /// Wrap a connected socket in a TLS session.
    #[cfg(feature = "tls")]
    pub fn start_tls(&mut self, token: Token, conn: rustls::ClientConnection) -> io::Result<()> {
        let mut entry = self
            .entries
            .remove(&token)
            .ok_or_else(|| unknown_socket(token))?;
        entry.io.transport = entry.io.transport.into_tls(conn);
        entry.handshaking = true;
        self.entries.insert(token, entry);
        Ok(())
    }

    /// Drive a TLS handshake. `Ok(true)` once it is complete.
    pub fn continue_handshake(&mut self, token: Token) -> io::Result<bool> {
        let entry = self.entry_mut(token)?;
        if !entry.handshaking {
            return Ok(true);
        }
        if entry.io.transport.continue_handshake()? {
            entry.handshaking = false;
            log::debug!("TLS handshake on {:?} complete", token);
            Ok(true)
        } else {
            entry.io.readable = false;
            entry.io.writable = false;
            Ok(false)
        }
    }

    pub fn is_connecting(&self, token: Token) -> bool {
        self.entries
            .get(&token)
            .is_some_and(|e| e.connecting || e.handshaking)
    }

    /// Assemble the next packet from whatever has arrived.
    ///
    /// `Ok(None)` means a partial frame is held for the next attempt.
    pub fn read_frame(&mut self, token: Token) -> Result<Option<Frame>, SocketError> {
        let entry = self.entry_mut(token)?;
        let frame = entry.assembler.poll(&mut entry.io)?;
        if let Some(frame) = &frame {
            log::trace!(
                "Read frame 0x{:02X} ({} bytes) on {:?}",
                frame.header,
                frame.body.len(),
                token
            );
        }
        Ok(frame)
    }

    /// Send `bufs` in order.
    ///
    /// If the socket already has a pending write the buffers are queued
    /// behind it. `hold` keeps a QoS 0 publication alive until its bytes
    /// have left.
    pub fn write_all(
        &mut self,
        token: Token,
        bufs: Vec<Bytes>,
        hold: Option<Publication>,
    ) -> io::Result<WriteStatus> {
        let entry = self.entry_mut(token)?;
        if let Some(pending) = entry.pending.as_mut() {
            pending.append(bufs, hold);
            return Ok(WriteStatus::Interrupted);
        }

        entry.pending = Some(PendingWrite::new(bufs, hold));
        match entry.flush() {
            Ok(true) => {
                entry.pending = None;
                Ok(WriteStatus::Complete)
            }
            Ok(false) => {
                log::trace!("Write on {:?} interrupted", token);
                Ok(WriteStatus::Interrupted)
            }
            Err(e) => {
                entry.pending = None;
                Err(e)
            }
        }
    }

    pub fn has_pending_write(&self, token: Token) -> bool {
        self.entries
            .get(&token)
            .is_some_and(|e| e.pending.is_some())
    }

    /// Tokens whose pending write finished since the last call.
    pub fn take_completed_writes(&mut self) -> Vec<Token> {
        std::mem::take(&mut self.completed_writes)
    }

    pub fn set_write_limit(&mut self, token: Token, limit: Option<usize>) -> io::Result<()> {
        self.entry_mut(token)?.write_limit = limit.filter(|n| *n > 0);
        Ok(())
    }

    /// Deregister and drop a socket along with its pending write and any
    /// partial frame.
    pub fn close(&mut self, token: Token) {
        let Some(mut entry) = self.entries.remove(&token) else {
            return;
        };
        entry.io.transport.shutdown();
        if let Err(e) = self.registry.deregister(entry.io.transport.tcp_stream_mut()) {
            log::debug!("Deregister {:?} failed: {}", token, e);
        }
        if let Some(pos) = self.order.iter().position(|t| *t == token) {
            self.order.remove(pos);
            if pos < self.cursor {
                self.cursor -= 1;
            }
        }
        if self.cursor >= self.order.len() {
            self.cursor = 0;
        }
        self.completed_writes.retain(|t| *t != token);
        log::debug!("Closed socket {:?}", token);
    }

    fn entry_mut(&mut self, token: Token) -> io::Result<&mut SocketEntry> {
        self.entries
            .get_mut(&token)
            .ok_or_else(|| unknown_socket(token))
    }
}

fn unknown_socket(token: Token) -> io::Error {
    io::Error::new(
        io::ErrorKind::NotConnected,
        format!("unknown socket {:?}", token),
    )
}

#[cfg(test)]
mod tests {
    use std::io::{Read as _, Write as _};
    use std::net::TcpListener;
    use std::thread;
    use std::time::Duration;

    use mio::{Events, Poll};

    use super::*;

    fn drive(poll: &mut Poll, set: &mut SocketSet, timeout: Duration) {
        let mut events = Events::with_capacity(16);
        poll.poll(&mut events, Some(timeout)).unwrap();
        let ready: Vec<Readiness> = events.iter().map(Readiness::from).collect();
        set.apply(&ready);
    }

    fn connect(poll: &mut Poll, set: &mut SocketSet, addr: SocketAddr) -> Token {
        let (token, _) = set.open(addr).unwrap();
        for _ in 0..200 {
            drive(poll, set, Duration::from_millis(10));
            if set.next_ready() == Some(token) && set.finish_connect(token).unwrap() {
                return token;
            }
            if !set.is_connecting(token) {
                return token;
            }
        }
        panic!("connect did not complete");
    }

    #[test]
    fn test_tokens_not_reused() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let poll = Poll::new().unwrap();
        let mut set = SocketSet::new(poll.registry()).unwrap();

        let (first, _) = set.open(addr).unwrap();
        set.close(first);
        let (second, _) = set.open(addr).unwrap();
        assert_ne!(first, second);
        assert_ne!(second, WAKER_TOKEN);
        assert_eq!(set.len(), 1);
    }

    #[test]
    fn test_write_limit_forces_partial_writes() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let server = thread::spawn(move || {
            let (mut stream, _) = listener.accept().unwrap();
            let mut buf = [0u8; 11];
            stream.read_exact(&mut buf).unwrap();
            buf
        });

        let mut poll = Poll::new().unwrap();
        let mut set = SocketSet::new(poll.registry()).unwrap();
        let token = connect(&mut poll, &mut set, addr);
        set.set_write_limit(token, Some(1)).unwrap();

        let status = set
            .write_all(token, vec![Bytes::from_static(b"hello")], None)
            .unwrap();
        assert_eq!(status, WriteStatus::Interrupted);
        assert!(set.has_pending_write(token));

        // Queued behind the unfinished write, never interleaved with it.
        let status = set
            .write_all(token, vec![Bytes::from_static(b" world")], None)
            .unwrap();
        assert_eq!(status, WriteStatus::Interrupted);

        let mut completed = Vec::new();
        for _ in 0..500 {
            set.flush_pending();
            completed.extend(set.take_completed_writes());
            if !set.has_pending_write(token) {
                break;
            }
            if !set.wants_immediate_poll() {
                drive(&mut poll, &mut set, Duration::from_millis(10));
            }
        }
        assert_eq!(completed, vec![token]);
        assert_eq!(&server.join().unwrap(), b"hello world");
    }

    #[test]
    fn test_read_frame_across_segments() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let server = thread::spawn(move || {
            let (mut stream, _) = listener.accept().unwrap();
            stream.write_all(&[0x40]).unwrap();
            thread::sleep(Duration::from_millis(30));
            stream.write_all(&[0x02, 0x00]).unwrap();
            thread::sleep(Duration::from_millis(30));
            stream.write_all(&[0x05, 0xD0, 0x00]).unwrap();
            thread::sleep(Duration::from_millis(200));
        });

        let mut poll = Poll::new().unwrap();
        let mut set = SocketSet::new(poll.registry()).unwrap();
        let token = connect(&mut poll, &mut set, addr);

        let mut frames = Vec::new();
        for _ in 0..200 {
            drive(&mut poll, &mut set, Duration::from_millis(10));
            while set.next_ready() == Some(token) {
                match set.read_frame(token).unwrap() {
                    Some(frame) => frames.push(frame),
                    None => break,
                }
            }
            if frames.len() == 2 {
                break;
            }
        }
        assert_eq!(
            frames,
            vec![
                Frame {
                    header: 0x40,
                    body: Bytes::from_static(&[0x00, 0x05])
                },
                Frame {
                    header: 0xD0,
                    body: Bytes::new()
                },
            ]
        );
        server.join().unwrap();
    }

    #[test]
    fn test_peer_close_reported() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let server = thread::spawn(move || {
            let (stream, _) = listener.accept().unwrap();
            drop(stream);
        });

        let mut poll = Poll::new().unwrap();
        let mut set = SocketSet::new(poll.registry()).unwrap();
        let token = connect(&mut poll, &mut set, addr);
        server.join().unwrap();

        let mut closed = false;
        for _ in 0..200 {
            drive(&mut poll, &mut set, Duration::from_millis(10));
            if set.next_ready() == Some(token) {
                match set.read_frame(token) {
                    Err(SocketError::PeerClosed) => {
                        closed = true;
                        break;
                    }
                    Ok(None) => {}
                    other => panic!("unexpected {:?}", other),
                }
            }
        }
        assert!(closed);
        set.close(token);
        assert!(set.is_empty());
    }
}
