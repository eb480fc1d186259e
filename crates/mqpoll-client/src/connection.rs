//! Connection state machine.
//!
//! A connect attempt walks `Idle → TcpConnecting → (TlsConnecting) →
//! MqttConnectSent → Connected`. The dispatch loop drives each step when the
//! socket becomes ready; the caller of `connect` only waits for the CONNACK
//! outcome. Any failure, and any disconnect, returns the client to `Idle`.

use std::net::SocketAddr;
use std::time::Instant;

use mio::Token;
use mqpoll_core::{Connack, ConnackCode, Connect, LastWill, Packet, ProtocolVersion};

use crate::address::ServerAddress;
use crate::config::{ConnectOptions, MqttVersion, TlsOptions};
use crate::engine::{Effects, EngineState, SocketWire};
use crate::error::{ClientError, Result};
use crate::protocol;
use crate::socket::ConnectStatus;

/// Where a client is in its connection lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConnectionState {
    #[default]
    Idle,
    TcpConnecting,
    TlsConnecting,
    MqttConnectSent,
    Connected,
    Disconnecting,
}

impl ConnectionState {
    fn rank(self) -> u8 {
        match self {
            ConnectionState::Idle => 0,
            ConnectionState::TcpConnecting => 1,
            ConnectionState::TlsConnecting => 2,
            ConnectionState::MqttConnectSent => 3,
            ConnectionState::Connected => 4,
            ConnectionState::Disconnecting => 5,
        }
    }

    /// Move forward to `next`. The only backward move allowed is to `Idle`.
    pub fn advance(&mut self, next: ConnectionState) -> Result<()> {
        if next != ConnectionState::Idle && next.rank() <= self.rank() {
            return Err(ClientError::InvalidState(format!(
                "cannot move from {:?} to {:?}",
                self, next
            )));
        }
        log::trace!("Connection state {:?} -> {:?}", self, next);
        *self = next;
        Ok(())
    }

    /// A connect attempt is under way.
    pub fn is_connecting(self) -> bool {
        matches!(
            self,
            ConnectionState::TcpConnecting
                | ConnectionState::TlsConnecting
                | ConnectionState::MqttConnectSent
        )
    }

    /// CONNACK has been accepted and the session has not been closed.
    pub fn is_established(self) -> bool {
        matches!(
            self,
            ConnectionState::Connected | ConnectionState::Disconnecting
        )
    }
}

/// One connect attempt: one server, one protocol version.
#[derive(Debug, Clone)]
pub struct ConnectAttempt {
    pub address: ServerAddress,
    pub socket_addr: SocketAddr,
    pub connect: Connect,
    pub tls: Option<TlsOptions>,
    pub deadline: Instant,
}

/// Servers to try, in order.
pub fn server_list(server_uri: &str, options: &ConnectOptions) -> Result<Vec<ServerAddress>> {
    if options.server_uris.is_empty() {
        return Ok(vec![server_uri.parse()?]);
    }
    options.server_uris.iter().map(|uri| uri.parse()).collect()
}

/// Protocol versions to try against each server, in order.
pub fn versions(version: MqttVersion) -> &'static [ProtocolVersion] {
    match version {
        MqttVersion::Default => &[ProtocolVersion::V311, ProtocolVersion::V31],
        MqttVersion::V311 => &[ProtocolVersion::V311],
        MqttVersion::V31 => &[ProtocolVersion::V31],
    }
}

/// Whether a failed attempt at `version` is worth repeating at the next
/// version on the same server. Brokers that only speak 3.1 either refuse
/// the protocol level or drop the connection.
pub fn should_fall_back(outcome: &Result<Connack>) -> bool {
    match outcome {
        Ok(connack) => connack.code == ConnackCode::UnacceptableProtocolVersion,
        Err(ClientError::Disconnected) => true,
        Err(_) => false,
    }
}

pub fn build_connect(client_id: &str, options: &ConnectOptions, version: ProtocolVersion) -> Connect {
    Connect {
        version,
        clean_session: options.clean_session,
        keep_alive: options.keep_alive,
        client_id: client_id.to_string(),
        will: options.will.as_ref().map(LastWill::from),
        username: options.username.clone(),
        password: options.password.clone(),
    }
}

impl EngineState {
    /// Open the socket for `attempt` and start driving it.
    pub(crate) fn begin_connect(&mut self, key: u64, attempt: ConnectAttempt, now: Instant) -> Result<()> {
        let stale = self
            .clients
            .get_mut(&key)
            .ok_or_else(unknown_client)?
            .token
            .take();
        if let Some(token) = stale {
            self.forget_socket(token);
        }

        let (token, status) = self.sockets.open(attempt.socket_addr)?;
        self.by_socket.insert(token, key);
        let client = self.clients.get_mut(&key).ok_or_else(unknown_client)?;
        if client.write_limit.is_some() {
            self.sockets.set_write_limit(token, client.write_limit)?;
        }

        log::debug!(
            "{} connecting to {} with protocol level {}",
            client.session.client_id,
            attempt.address,
            attempt.connect.version.level()
        );
        client.token = Some(token);
        client.state = ConnectionState::Idle;
        client.state.advance(ConnectionState::TcpConnecting)?;
        client.session.reset_timers(now);
        client.signals.connack.clear();
        client.attempt = Some(attempt);

        if status == ConnectStatus::Connected {
            self.drive_connect(key, token, now)?;
        }
        Ok(())
    }

    /// Push the TCP and TLS steps forward; send CONNECT once both are done.
    pub(crate) fn drive_connect(&mut self, key: u64, token: Token, now: Instant) -> Result<()> {
        let state = self.clients.get(&key).ok_or_else(unknown_client)?.state;

        if state == ConnectionState::TcpConnecting {
            if !self.sockets.finish_connect(token)? {
                return Ok(());
            }
            let client = self.clients.get_mut(&key).ok_or_else(unknown_client)?;
            let Some(attempt) = client.attempt.as_ref() else {
                return Err(ClientError::InvalidState("no connect in progress".into()));
            };
            if !attempt.address.tls {
                return self.send_connect(key, token, now);
            }
            self.start_tls(key, token)?;
        }

        let state = self.clients.get(&key).ok_or_else(unknown_client)?.state;
        if state == ConnectionState::TlsConnecting && self.sockets.continue_handshake(token)? {
            return self.send_connect(key, token, now);
        }
        Ok(())
    }

    #[cfg(feature = "tls")]
    fn start_tls(&mut self, key: u64, token: Token) -> Result<()> {
        let client = self.clients.get_mut(&key).ok_or_else(unknown_client)?;
        let Some(attempt) = client.attempt.as_ref() else {
            return Err(ClientError::InvalidState("no connect in progress".into()));
        };
        let options = attempt.tls.clone().unwrap_or_default();
        let conn = crate::tls::client_connection(&options, &attempt.address.host)?;
        self.sockets.start_tls(token, conn)?;
        client.state.advance(ConnectionState::TlsConnecting)
    }

    #[cfg(not(feature = "tls"))]
    fn start_tls(&mut self, _key: u64, _token: Token) -> Result<()> {
        Err(ClientError::Tls(
            "ssl:// requires the `tls` feature".to_string(),
        ))
    }

    fn send_connect(&mut self, key: u64, token: Token, now: Instant) -> Result<()> {
        let (client, sockets) = self.split(key).ok_or_else(unknown_client)?;
        let Some(attempt) = client.attempt.as_ref() else {
            return Err(ClientError::InvalidState("no connect in progress".into()));
        };
        let packet = Packet::Connect(attempt.connect.clone());
        let mut wire = SocketWire::new(sockets, token);
        protocol::send_packet(&mut client.session, &mut wire, &packet, now)?;
        client.state.advance(ConnectionState::MqttConnectSent)
    }

    /// CONNACK ends the attempt either way. The outcome is posted for the
    /// caller blocked in `connect`.
    pub(crate) fn handle_connack(&mut self, key: u64, token: Token, connack: Connack, now: Instant) -> Result<()> {
        let (client, sockets) = self.split(key).ok_or_else(unknown_client)?;
        if client.state != ConnectionState::MqttConnectSent {
            log::warn!("{} ignoring unexpected CONNACK", client.session.client_id);
            return Ok(());
        }

        if connack.code != ConnackCode::Accepted {
            log::warn!(
                "{} connection refused: {}",
                client.session.client_id,
                connack.code
            );
            client.signals.connack.post(Ok(connack));
            self.close_session(key, false);
            return Ok(());
        }

        client.state.advance(ConnectionState::Connected)?;
        client.attempt = None;
        log::info!(
            "{} connected (session present: {})",
            client.session.client_id,
            connack.session_present
        );
        if client.session.clean_session {
            client.session.clean();
        } else {
            let mut wire = SocketWire::new(sockets, token);
            protocol::retry(&mut client.session, &mut wire, now, true)?;
        }
        client.signals.connack.post(Ok(connack));
        Ok(())
    }

    /// Close the connection and return to `Idle`.
    ///
    /// DISCONNECT is sent first when `send_disconnect` is set and the
    /// session is established. Session state is dropped if the session was
    /// clean.
    pub(crate) fn close_session(&mut self, key: u64, send_disconnect: bool) {
        let Some((client, sockets)) = self.split(key) else {
            return;
        };
        let token = client.token.take();
        if let Some(token) = token {
            if send_disconnect && client.state.is_established() {
                let mut wire = SocketWire::new(sockets, token);
                if let Err(e) =
                    protocol::send_packet(&mut client.session, &mut wire, &Packet::Disconnect, Instant::now())
                {
                    log::debug!("{} DISCONNECT not sent: {}", client.session.client_id, e);
                }
            }
        }
        client.state = ConnectionState::Idle;
        client.attempt = None;
        client.session.ping_outstanding = false;
        if client.session.clean_session {
            client.session.clean();
        }
        client.signals.suback.post(Err(ClientError::Disconnected));
        client.signals.unsuback.post(Err(ClientError::Disconnected));
        log::debug!("{} session closed", client.session.client_id);

        if let Some(token) = token {
            self.forget_socket(token);
        }
    }

    /// Tear down after a transport or protocol failure.
    ///
    /// A connect attempt in progress gets the error as its outcome; an
    /// established connection reports it to the connection-lost handler.
    pub(crate) fn fail_connection(&mut self, key: u64, cause: ClientError, fx: &mut Effects) {
        let Some(client) = self.clients.get_mut(&key) else {
            return;
        };
        let state = client.state;
        let handler = client.handler.clone();
        match state {
            ConnectionState::Idle => return,
            s if s.is_connecting() => {
                log::debug!("{} connect attempt failed: {}", client.session.client_id, cause);
                client.signals.connack.post(Err(cause));
                self.close_session(key, false);
            }
            ConnectionState::Connected => {
                log::warn!("{} connection lost: {}", client.session.client_id, cause);
                self.close_session(key, false);
                if let Some(handler) = handler {
                    fx.lost.push((handler, cause));
                }
            }
            _ => {
                log::debug!("{} closed while disconnecting: {}", client.session.client_id, cause);
                self.close_session(key, false);
            }
        }
        fx.changed = true;
    }

    fn forget_socket(&mut self, token: Token) {
        self.sockets.close(token);
        self.by_socket.remove(&token);
    }
}

fn unknown_client() -> ClientError {
    ClientError::InvalidState("client has been destroyed".to_string())
}
