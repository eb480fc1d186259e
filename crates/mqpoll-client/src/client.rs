//! Public client handle.

use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use mqpoll_core::{ConnackCode, Packet, QoS, SubscribeReturnCode, Subscribe, Unsubscribe};
use parking_lot::Mutex;

use crate::address::ServerAddress;
use crate::callback::{DeliveryToken, MqttHandler};
use crate::config::ConnectOptions;
use crate::connection::{self, ConnectAttempt, ConnectionState};
use crate::engine::{ClientSignals, ClientState, Context, SocketWire, WAIT_SLICE};
use crate::error::{ClientError, Result};
use crate::persistence::Persistence;
use crate::protocol;
use crate::registry::DeliveredMessage;
use crate::session::Session;

/// How long SUBSCRIBE and UNSUBSCRIBE wait for their acknowledgement.
pub const ACK_TIMEOUT: Duration = Duration::from_secs(10);

const MAX_STRING_LEN: usize = 65535;

/// Payload and delivery options for [`Client::publish_message`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PublishMessage {
    pub payload: Bytes,
    pub qos: QoS,
    pub retained: bool,
}

impl PublishMessage {
    pub fn new(payload: impl Into<Bytes>) -> Self {
        Self {
            payload: payload.into(),
            ..Default::default()
        }
    }

    pub fn qos(mut self, qos: QoS) -> Self {
        self.qos = qos;
        self
    }

    pub fn retained(mut self, retained: bool) -> Self {
        self.retained = retained;
        self
    }
}

/// MQTT client.
///
/// Without a handler every blocking call drives the network itself. With a
/// handler set (see [`Client::set_handler`]) a background thread does, and
/// blocking calls only wait.
pub struct Client {
    ctx: Context,
    key: u64,
    signals: Arc<ClientSignals>,
    server_uri: String,
    client_id: String,
}

impl std::fmt::Debug for Client {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Client")
            .field("server_uri", &self.server_uri)
            .field("client_id", &self.client_id)
            .finish()
    }
}

impl Client {
    /// Create a client with its own context.
    pub fn new(server_uri: &str, client_id: &str) -> Result<Self> {
        Self::create(&Context::new()?, server_uri, client_id, None)
    }

    /// Create a client sharing `ctx` with other clients.
    pub fn with_context(ctx: &Context, server_uri: &str, client_id: &str) -> Result<Self> {
        Self::create(ctx, server_uri, client_id, None)
    }

    /// Create a client whose in-flight messages are kept in `store`.
    ///
    /// The store is opened immediately and anything left in it from an
    /// earlier run is restored.
    pub fn with_persistence(
        ctx: &Context,
        server_uri: &str,
        client_id: &str,
        store: impl Persistence + 'static,
    ) -> Result<Self> {
        Self::create(ctx, server_uri, client_id, Some(Box::new(store)))
    }

    fn create(
        ctx: &Context,
        server_uri: &str,
        client_id: &str,
        store: Option<Box<dyn Persistence>>,
    ) -> Result<Self> {
        server_uri.parse::<ServerAddress>()?;
        check_string(client_id)?;

        let mut session = Session::new(client_id, store);
        session.open_store(server_uri)?;
        session.restore(Instant::now())?;

        let client = ClientState::new(server_uri.to_string(), session);
        let signals = Arc::clone(&client.signals);
        let key = ctx.lock().insert_client(client);
        log::debug!("Created client {} for {}", client_id, server_uri);

        Ok(Self {
            ctx: ctx.clone(),
            key,
            signals,
            server_uri: server_uri.to_string(),
            client_id: client_id.to_string(),
        })
    }

    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    pub fn server_uri(&self) -> &str {
        &self.server_uri
    }

    pub fn context(&self) -> &Context {
        &self.ctx
    }

    /// Install the application callbacks. Only allowed while disconnected.
    pub fn set_handler(&self, handler: impl MqttHandler + 'static) -> Result<()> {
        let mut state = self.ctx.lock();
        let client = state.clients.get_mut(&self.key).ok_or_else(destroyed)?;
        if client.state != ConnectionState::Idle {
            return Err(ClientError::InvalidState(
                "handler can only be set while disconnected".to_string(),
            ));
        }
        client.handler = Some(Arc::new(Mutex::new(Box::new(handler))));
        Ok(())
    }

    /// Connect to the broker.
    ///
    /// Each server in `options.server_uris` (or the URI the client was
    /// created with) is tried in turn. With
    /// [`MqttVersion::Default`](crate::MqttVersion::Default) each server is
    /// tried at 3.1.1 first and again at 3.1 if it refuses the protocol
    /// level.
    pub fn connect(&self, options: &ConnectOptions) -> Result<()> {
        options.validate()?;
        let servers = connection::server_list(&self.server_uri, options)?;
        {
            let mut state = self.ctx.lock();
            let client = state.clients.get_mut(&self.key).ok_or_else(destroyed)?;
            if client.state != ConnectionState::Idle {
                return Err(ClientError::InvalidState(
                    "already connected or connecting".to_string(),
                ));
            }
            client.session.configure(options);
        }

        let mut last_error = ClientError::NotConnected;
        for address in servers {
            let socket_addr = match address.resolve() {
                Ok(addr) => addr,
                Err(e) => {
                    log::warn!("{}: cannot resolve {}: {}", self.client_id, address, e);
                    last_error = e.into();
                    continue;
                }
            };

            for &version in connection::versions(options.mqtt_version) {
                let deadline = Instant::now() + options.connect_timeout;
                let attempt = ConnectAttempt {
                    address: address.clone(),
                    socket_addr,
                    connect: connection::build_connect(&self.client_id, options, version),
                    tls: options.tls.clone(),
                    deadline,
                };
                let outcome = self.attempt(attempt, deadline);

                if let Ok(connack) = &outcome {
                    if connack.code == ConnackCode::Accepted {
                        return self.on_connected();
                    }
                }
                let fall_back = connection::should_fall_back(&outcome);
                last_error = match outcome {
                    Ok(connack) => ClientError::ConnectionRefused(connack.code),
                    Err(e) => e,
                };
                self.ctx.lock().close_session(self.key, false);
                if !fall_back {
                    break;
                }
                log::debug!("{}: retrying {} with MQTT 3.1", self.client_id, address);
            }
        }
        Err(last_error)
    }

    fn attempt(&self, attempt: ConnectAttempt, deadline: Instant) -> Result<mqpoll_core::Connack> {
        self.ctx
            .lock()
            .begin_connect(self.key, attempt, Instant::now())?;
        self.ctx.wake();
        self.ctx
            .wait_signal(&self.signals.connack, deadline)
            .unwrap_or(Err(ClientError::Timeout))
    }

    fn on_connected(&self) -> Result<()> {
        let has_handler = self
            .ctx
            .lock()
            .clients
            .get(&self.key)
            .is_some_and(|c| c.handler.is_some());
        if has_handler {
            self.ctx.start_background()?;
        }
        Ok(())
    }

    pub fn is_connected(&self) -> bool {
        self.ctx
            .lock()
            .clients
            .get(&self.key)
            .is_some_and(|c| c.state == ConnectionState::Connected)
    }

    /// Publish a message.
    ///
    /// Returns the delivery token for QoS 1/2 and `None` for QoS 0. Blocks
    /// while the in-flight window is full or an earlier write is still
    /// going out.
    pub fn publish(
        &self,
        topic: &str,
        payload: impl Into<Bytes>,
        qos: QoS,
        retained: bool,
    ) -> Result<Option<DeliveryToken>> {
        check_topic_name(topic)?;
        let payload = payload.into();
        let mut blocked = false;

        loop {
            let outcome = {
                let mut state = self.ctx.lock();
                let (client, sockets) = state.split(self.key).ok_or_else(destroyed)?;
                let token = match (client.state, client.token) {
                    (ConnectionState::Connected, Some(token)) => token,
                    _ => return Err(ClientError::NotConnected),
                };
                let full = qos != QoS::AtMostOnce
                    && client.session.outbound.len() >= client.session.max_inflight;
                if full || sockets.has_pending_write(token) {
                    None
                } else {
                    let mut wire = SocketWire::new(sockets, token);
                    let result = protocol::start_publish(
                        &mut client.session,
                        &mut wire,
                        topic,
                        payload.clone(),
                        qos,
                        retained,
                        Instant::now(),
                    );
                    Some((result, wire.interrupted()))
                }
            };

            match outcome {
                Some((result, interrupted)) => {
                    if interrupted {
                        self.ctx.wake();
                    }
                    return result;
                }
                None => {
                    if !blocked {
                        log::trace!("{}: publish blocked on full queue", self.client_id);
                        blocked = true;
                    }
                    self.ctx.yield_for(WAIT_SLICE);
                }
            }
        }
    }

    pub fn publish_message(&self, topic: &str, message: &PublishMessage) -> Result<Option<DeliveryToken>> {
        self.publish(topic, message.payload.clone(), message.qos, message.retained)
    }

    /// Subscribe to one topic filter. Returns the code the broker granted.
    pub fn subscribe(&self, topic: &str, qos: QoS) -> Result<SubscribeReturnCode> {
        let codes = self.subscribe_many(&[(topic, qos)])?;
        codes.into_iter().next().ok_or_else(|| {
            ClientError::Protocol(mqpoll_core::ProtocolError::MalformedPacket(
                "SUBACK without return codes".into(),
            ))
        })
    }

    /// Subscribe to several filters in one SUBSCRIBE.
    pub fn subscribe_many(&self, topics: &[(&str, QoS)]) -> Result<Vec<SubscribeReturnCode>> {
        if topics.is_empty() {
            return Err(ClientError::InvalidArgument("no topics given".to_string()));
        }
        for (topic, _) in topics {
            check_topic_filter(topic)?;
        }

        let msg_id = self.send_request(|packet_id| {
            Packet::Subscribe(Subscribe {
                packet_id,
                topics: topics.iter().map(|(t, q)| (t.to_string(), *q)).collect(),
            })
        })?;

        let deadline = Instant::now() + ACK_TIMEOUT;
        loop {
            match self.ctx.wait_signal(&self.signals.suback, deadline) {
                None => return Err(ClientError::Timeout),
                Some(Err(e)) => return Err(e),
                Some(Ok(suback)) if suback.packet_id == msg_id => {
                    if suback.return_codes.len() != topics.len() {
                        return Err(ClientError::Protocol(
                            mqpoll_core::ProtocolError::MalformedPacket(format!(
                                "SUBACK has {} codes for {} topics",
                                suback.return_codes.len(),
                                topics.len()
                            )),
                        ));
                    }
                    return Ok(suback.return_codes);
                }
                Some(Ok(stale)) => {
                    log::debug!("{}: ignoring SUBACK {}", self.client_id, stale.packet_id);
                }
            }
        }
    }

    pub fn unsubscribe(&self, topic: &str) -> Result<()> {
        self.unsubscribe_many(&[topic])
    }

    pub fn unsubscribe_many(&self, topics: &[&str]) -> Result<()> {
        if topics.is_empty() {
            return Err(ClientError::InvalidArgument("no topics given".to_string()));
        }
        for topic in topics {
            check_topic_filter(topic)?;
        }

        let msg_id = self.send_request(|packet_id| {
            Packet::Unsubscribe(Unsubscribe {
                packet_id,
                topics: topics.iter().map(|t| t.to_string()).collect(),
            })
        })?;

        let deadline = Instant::now() + ACK_TIMEOUT;
        loop {
            match self.ctx.wait_signal(&self.signals.unsuback, deadline) {
                None => return Err(ClientError::Timeout),
                Some(Err(e)) => return Err(e),
                Some(Ok(id)) if id == msg_id => return Ok(()),
                Some(Ok(stale)) => {
                    log::debug!("{}: ignoring UNSUBACK {}", self.client_id, stale);
                }
            }
        }
    }

    /// Send SUBSCRIBE or UNSUBSCRIBE under a fresh message id.
    fn send_request(&self, build: impl FnOnce(u16) -> Packet) -> Result<u16> {
        let (msg_id, interrupted) = {
            let mut state = self.ctx.lock();
            let (client, sockets) = state.split(self.key).ok_or_else(destroyed)?;
            let token = match (client.state, client.token) {
                (ConnectionState::Connected, Some(token)) => token,
                _ => return Err(ClientError::NotConnected),
            };
            let msg_id = client.session.next_msg_id().ok_or(ClientError::NoMessageId)?;
            client.signals.suback.clear();
            client.signals.unsuback.clear();

            let mut wire = SocketWire::new(sockets, token);
            protocol::send_packet(&mut client.session, &mut wire, &build(msg_id), Instant::now())?;
            (msg_id, wire.interrupted())
        };
        if interrupted {
            self.ctx.wake();
        }
        Ok(msg_id)
    }

    /// Take the next received message, waiting up to `timeout`.
    ///
    /// Not available once a handler is set; messages go to the handler.
    pub fn receive(&self, timeout: Duration) -> Result<Option<DeliveredMessage>> {
        let has_handler = self
            .ctx
            .lock()
            .clients
            .get(&self.key)
            .ok_or_else(destroyed)?
            .handler
            .is_some();
        if has_handler {
            return Err(ClientError::InvalidState(
                "receive is not available while a handler is set".to_string(),
            ));
        }
        if timeout.is_zero() && !self.ctx.background_running() {
            self.ctx.cycle(Duration::ZERO);
        }

        let key = self.key;
        let deadline = Instant::now() + timeout;
        self.ctx
            .wait_until(Some(deadline), |state| match state.clients.get_mut(&key) {
                None => Some(Err(destroyed())),
                Some(client) => match client.session.queue.pop_front() {
                    Some(message) => Some(Ok(Some(message))),
                    None if client.state == ConnectionState::Idle => {
                        Some(Err(ClientError::NotConnected))
                    }
                    None => None,
                },
            })
            .unwrap_or(Ok(None))
    }

    /// Wait until the publish identified by `token` has been acknowledged.
    pub fn wait_for_completion(&self, token: DeliveryToken, timeout: Duration) -> Result<()> {
        let key = self.key;
        let deadline = Instant::now() + timeout;
        self.ctx
            .wait_until(Some(deadline), |state| match state.clients.get(&key) {
                None => Some(Err(destroyed())),
                Some(client) if !client.session.outbound.contains(token) => Some(Ok(())),
                Some(client) if client.state == ConnectionState::Idle => {
                    Some(Err(ClientError::Disconnected))
                }
                Some(_) => None,
            })
            .unwrap_or(Err(ClientError::Timeout))
    }

    /// Tokens of publishes still waiting for acknowledgement.
    pub fn pending_delivery_tokens(&self) -> Vec<DeliveryToken> {
        self.ctx
            .lock()
            .clients
            .get(&self.key)
            .map(|c| c.session.outbound.ids())
            .unwrap_or_default()
    }

    /// Let the engine run for a short while. Clients without a handler must
    /// call this (or another blocking method) regularly to keep the
    /// connection alive.
    pub fn yield_now(&self) {
        self.ctx.yield_for(WAIT_SLICE);
    }

    /// Disconnect from the broker.
    ///
    /// Waits up to `timeout` for in-flight exchanges to finish, then sends
    /// DISCONNECT and closes the socket. Always completes; an unreachable
    /// peer is not an error.
    pub fn disconnect(&self, timeout: Duration) -> Result<()> {
        {
            let mut state = self.ctx.lock();
            let client = state.clients.get_mut(&self.key).ok_or_else(destroyed)?;
            let current = client.state;
            match current {
                ConnectionState::Idle => return Ok(()),
                ConnectionState::Connected => {
                    client.state.advance(ConnectionState::Disconnecting)?;
                }
                ConnectionState::Disconnecting => {}
                _ => {
                    state.close_session(self.key, false);
                    drop(state);
                    self.ctx.stop_background_if_idle();
                    return Ok(());
                }
            }
        }

        let key = self.key;
        let deadline = Instant::now() + timeout;
        let drained = self.ctx.wait_until(Some(deadline), |state| {
            let client = state.clients.get(&key)?;
            let done = client.state != ConnectionState::Disconnecting
                || (client.session.outbound.is_empty() && client.session.inbound.is_empty());
            done.then_some(())
        });
        if drained.is_none() {
            log::debug!("{}: disconnecting with messages in flight", self.client_id);
        }

        self.ctx.lock().close_session(self.key, true);
        self.ctx.notify();
        self.ctx.stop_background_if_idle();
        log::info!("{} disconnected", self.client_id);
        Ok(())
    }

    /// Cap the bytes written per system call on this client's socket.
    ///
    /// Forces partial writes; only useful for exercising the resume path.
    #[doc(hidden)]
    pub fn set_write_limit(&self, limit: Option<usize>) -> Result<()> {
        let mut state = self.ctx.lock();
        let (client, sockets) = state.split(self.key).ok_or_else(destroyed)?;
        client.write_limit = limit;
        if let Some(token) = client.token {
            sockets.set_write_limit(token, limit)?;
        }
        Ok(())
    }
}

impl Drop for Client {
    fn drop(&mut self) {
        if let Err(e) = self.disconnect(Duration::ZERO) {
            log::debug!("{}: disconnect on drop failed: {}", self.client_id, e);
        }
        self.ctx.lock().remove_client(self.key);
        self.ctx.stop_background_if_idle();
    }
}

fn destroyed() -> ClientError {
    ClientError::InvalidState("client has been destroyed".to_string())
}

/// MQTT strings are UTF-8 without U+0000, at most 65535 bytes.
fn check_string(s: &str) -> Result<()> {
    if s.contains('\0') || s.len() > MAX_STRING_LEN {
        return Err(ClientError::BadUtf8String(s.to_string()));
    }
    Ok(())
}

fn check_topic_filter(topic: &str) -> Result<()> {
    if topic.is_empty() {
        return Err(ClientError::InvalidArgument("empty topic".to_string()));
    }
    check_string(topic)
}

fn check_topic_name(topic: &str) -> Result<()> {
    check_topic_filter(topic)?;
    if topic.contains(['+', '#']) {
        return Err(ClientError::InvalidArgument(format!(
            "wildcards are not allowed in a publish topic: {:?}",
            topic
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::io::{Read, Write};
    use std::net::{TcpListener, TcpStream};
    use std::thread::{self, JoinHandle};

    use crossbeam_channel::{unbounded, Sender};
    use mqpoll_core::{decode_body, to_bytes, varint, Connack, Connect, ProtocolVersion, Publish, Suback};

    use super::*;

    fn read_packet(stream: &mut TcpStream) -> Option<Packet> {
        let mut header = [0u8; 1];
        stream.read_exact(&mut header).ok()?;
        let mut len_bytes = Vec::new();
        loop {
            let mut byte = [0u8; 1];
            stream.read_exact(&mut byte).ok()?;
            len_bytes.push(byte[0]);
            if let Some((len, _)) = varint::decode(&len_bytes).unwrap() {
                let mut body = vec![0u8; len];
                stream.read_exact(&mut body).ok()?;
                return Some(decode_body(header[0], &body).unwrap());
            }
        }
    }

    fn send(stream: &mut TcpStream, packet: Packet) {
        stream.write_all(&to_bytes(&packet).unwrap()).unwrap();
    }

    fn connack(code: ConnackCode) -> Packet {
        Packet::Connack(Connack {
            session_present: false,
            code,
        })
    }

    /// Accept one client and read its CONNECT.
    fn accept(listener: &TcpListener) -> (TcpStream, Connect) {
        let (mut stream, _) = listener.accept().unwrap();
        stream
            .set_read_timeout(Some(Duration::from_secs(10)))
            .unwrap();
        match read_packet(&mut stream) {
            Some(Packet::Connect(connect)) => (stream, connect),
            other => panic!("expected CONNECT, got {:?}", other),
        }
    }

    /// Read packets until DISCONNECT or EOF.
    fn drain(stream: &mut TcpStream) -> Vec<Packet> {
        let mut packets = Vec::new();
        while let Some(packet) = read_packet(stream) {
            let done = packet == Packet::Disconnect;
            packets.push(packet);
            if done {
                break;
            }
        }
        packets
    }

    fn broker<T: Send + 'static>(
        script: impl FnOnce(TcpListener) -> T + Send + 'static,
    ) -> (String, JoinHandle<T>) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let uri = format!("tcp://{}", listener.local_addr().unwrap());
        (uri, thread::spawn(move || script(listener)))
    }

    #[test]
    fn test_disconnect_zero_is_bounded() {
        let (uri, broker) = broker(|listener| {
            let (mut stream, _) = accept(&listener);
            send(&mut stream, connack(ConnackCode::Accepted));
            drain(&mut stream)
        });

        let client = Client::new(&uri, "bounded").unwrap();
        client.connect(&ConnectOptions::new()).unwrap();
        assert!(client.is_connected());

        let start = Instant::now();
        client.disconnect(Duration::ZERO).unwrap();
        assert!(start.elapsed() < Duration::from_secs(1));
        assert!(!client.is_connected());

        assert_eq!(broker.join().unwrap().last(), Some(&Packet::Disconnect));
    }

    #[test]
    fn test_qos1_with_one_byte_writes() {
        let (uri, broker) = broker(|listener| {
            let (mut stream, _) = accept(&listener);
            send(&mut stream, connack(ConnackCode::Accepted));
            let mut publishes = Vec::new();
            while let Some(packet) = read_packet(&mut stream) {
                match packet {
                    Packet::Publish(publish) => {
                        let packet_id = publish.packet_id.unwrap();
                        send(&mut stream, Packet::Puback { packet_id });
                        publishes.push(publish);
                    }
                    Packet::Disconnect => break,
                    other => panic!("unexpected {:?}", other),
                }
            }
            publishes
        });

        let client = Client::new(&uri, "trickle").unwrap();
        client.set_write_limit(Some(1)).unwrap();
        client
            .connect(&ConnectOptions::new().clean_session(false).reliable(false))
            .unwrap();

        let mut tokens = Vec::new();
        for i in 0..3 {
            let payload = format!("message {}", i);
            let token = client
                .publish("a/b", payload, QoS::AtLeastOnce, false)
                .unwrap()
                .unwrap();
            tokens.push(token);
        }
        client.disconnect(Duration::from_secs(5)).unwrap();
        assert!(client.pending_delivery_tokens().is_empty());

        let publishes = broker.join().unwrap();
        assert_eq!(publishes.len(), 3);
        for (i, publish) in publishes.iter().enumerate() {
            assert_eq!(publish.payload, Bytes::from(format!("message {}", i)));
            assert_eq!(publish.packet_id, Some(tokens[i]));
            assert!(!publish.dup);
        }
    }

    #[test]
    fn test_qos2_duplicate_delivered_once() {
        let (uri, broker) = broker(|listener| {
            let (mut stream, _) = accept(&listener);
            send(&mut stream, connack(ConnackCode::Accepted));

            let packet_id = match read_packet(&mut stream) {
                Some(Packet::Subscribe(subscribe)) => subscribe.packet_id,
                other => panic!("expected SUBSCRIBE, got {:?}", other),
            };
            send(
                &mut stream,
                Packet::Suback(Suback {
                    packet_id,
                    return_codes: vec![SubscribeReturnCode::Success(QoS::ExactlyOnce)],
                }),
            );

            let publish = Publish {
                dup: false,
                qos: QoS::ExactlyOnce,
                retain: false,
                topic: "a/b".into(),
                packet_id: Some(7),
                payload: Bytes::from_static(b"once"),
            };
            send(&mut stream, Packet::Publish(publish.clone()));
            send(&mut stream, Packet::Publish(Publish { dup: true, ..publish }));
            let mut replies = vec![read_packet(&mut stream), read_packet(&mut stream)];
            send(&mut stream, Packet::Pubrel { packet_id: 7 });
            replies.push(read_packet(&mut stream));
            drain(&mut stream);
            replies
        });

        let client = Client::new(&uri, "exactly-once").unwrap();
        client.connect(&ConnectOptions::new()).unwrap();
        assert_eq!(
            client.subscribe("a/b", QoS::ExactlyOnce).unwrap(),
            SubscribeReturnCode::Success(QoS::ExactlyOnce)
        );

        let message = client.receive(Duration::from_secs(5)).unwrap().unwrap();
        assert_eq!(message.topic, "a/b");
        assert_eq!(message.payload_str(), Some("once"));
        assert_eq!(message.qos, QoS::ExactlyOnce);
        assert_eq!(client.receive(Duration::from_millis(300)).unwrap(), None);

        client.disconnect(Duration::from_secs(1)).unwrap();
        assert_eq!(
            broker.join().unwrap(),
            vec![
                Some(Packet::Pubrec { packet_id: 7 }),
                Some(Packet::Pubrec { packet_id: 7 }),
                Some(Packet::Pubcomp { packet_id: 7 }),
            ]
        );
    }

    #[test]
    fn test_connection_refused() {
        let (uri, broker) = broker(|listener| {
            let (mut stream, _) = accept(&listener);
            send(&mut stream, connack(ConnackCode::NotAuthorized));
        });

        let client = Client::new(&uri, "refused").unwrap();
        let err = client.connect(&ConnectOptions::new()).unwrap_err();
        assert!(matches!(
            err,
            ClientError::ConnectionRefused(ConnackCode::NotAuthorized)
        ));
        assert!(!client.is_connected());
        broker.join().unwrap();
    }

    #[test]
    fn test_falls_back_to_v31() {
        let (uri, broker) = broker(|listener| {
            let (mut stream, first) = accept(&listener);
            send(&mut stream, connack(ConnackCode::UnacceptableProtocolVersion));
            drop(stream);

            let (mut stream, second) = accept(&listener);
            send(&mut stream, connack(ConnackCode::Accepted));
            drain(&mut stream);
            (first.version, second.version)
        });

        let client = Client::new(&uri, "legacy").unwrap();
        client.connect(&ConnectOptions::new()).unwrap();
        client.disconnect(Duration::ZERO).unwrap();
        assert_eq!(
            broker.join().unwrap(),
            (ProtocolVersion::V311, ProtocolVersion::V31)
        );
    }

    #[test]
    fn test_connect_timeout() {
        let (uri, broker) = broker(|listener| {
            // Never answer the CONNECT.
            let (stream, _) = accept(&listener);
            thread::sleep(Duration::from_millis(500));
            drop(stream);
        });

        let client = Client::new(&uri, "silent").unwrap();
        let options = ConnectOptions::new()
            .mqtt_version(crate::MqttVersion::V311)
            .connect_timeout(Duration::from_millis(200));
        let start = Instant::now();
        let err = client.connect(&options).unwrap_err();
        assert!(matches!(err, ClientError::Timeout));
        assert!(start.elapsed() < Duration::from_secs(2));
        broker.join().unwrap();
    }

    struct Events(Sender<String>);

    impl MqttHandler for Events {
        fn message_arrived(&mut self, message: &DeliveredMessage) -> bool {
            let _ = self.0.send(format!("message {}", message.topic));
            true
        }

        fn connection_lost(&mut self, _cause: &ClientError) {
            let _ = self.0.send("lost".to_string());
        }
    }

    #[test]
    fn test_handler_in_background() {
        let (uri, broker) = broker(|listener| {
            let (mut stream, _) = accept(&listener);
            send(&mut stream, connack(ConnackCode::Accepted));
            send(
                &mut stream,
                Packet::Publish(Publish {
                    dup: false,
                    qos: QoS::AtMostOnce,
                    retain: false,
                    topic: "news".into(),
                    packet_id: None,
                    payload: Bytes::from_static(b"hello"),
                }),
            );
            thread::sleep(Duration::from_millis(200));
            // Dropping the stream looks like a broken connection.
        });

        let (tx, rx) = unbounded();
        let client = Client::new(&uri, "background").unwrap();
        client.set_handler(Events(tx)).unwrap();
        client.connect(&ConnectOptions::new()).unwrap();
        assert!(client.context().background_running());

        assert_eq!(
            rx.recv_timeout(Duration::from_secs(5)).unwrap(),
            "message news"
        );
        assert_eq!(rx.recv_timeout(Duration::from_secs(5)).unwrap(), "lost");
        assert!(!client.is_connected());
        assert!(matches!(
            client.receive(Duration::ZERO),
            Err(ClientError::InvalidState(_))
        ));
        broker.join().unwrap();
    }

    #[test]
    fn test_parameter_checks() {
        let client = Client::new("tcp://127.0.0.1:1", "checks").unwrap();
        assert!(matches!(
            client.publish("a/+", "x", QoS::AtMostOnce, false),
            Err(ClientError::InvalidArgument(_))
        ));
        assert!(matches!(
            client.publish("", "x", QoS::AtMostOnce, false),
            Err(ClientError::InvalidArgument(_))
        ));
        assert!(matches!(
            client.publish("a/b", "x", QoS::AtMostOnce, false),
            Err(ClientError::NotConnected)
        ));
        assert!(matches!(
            client.subscribe_many(&[]),
            Err(ClientError::InvalidArgument(_))
        ));
        assert!(matches!(
            Client::new("tcp://127.0.0.1:1", "bad\0id"),
            Err(ClientError::BadUtf8String(_))
        ));
        assert!(Client::new("ws://host", "x").is_err());
        assert!(client.disconnect(Duration::ZERO).is_ok());
    }
}
