//! Inbound bridge with statum state machine for the broker session
//!
//! One tokio task owns the `rumqttc` client and event loop for the whole life
//! of the bridge. It is the only place where [`ConnectionState`] changes.
//!
//! # State Machine
//!
//! ```text
//! Disconnected ──► Connecting ──► Subscribed
//!      ▲               │              │
//!      └───────────────┴──────────────┘
//!        (I/O failure, delivery timeout → backoff → retry)
//!
//! any state ──stop()──► Stopped
//! ```
//!
//! # Delivery
//!
//! ```text
//! EventLoop::poll ──► PayloadConverter ──► DispatchChannel::publish ──► ack
//!                     └─── bounded by the completion timeout ───────────┘
//! ```
//!
//! Acknowledgements are manual. A QoS 1/2 message is acknowledged only after
//! the channel accepted it, so a crash in between leads to a redelivery.

use std::collections::VecDeque;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use rumqttc::{
    AsyncClient, ConnectReturnCode, ConnectionError, Event, EventLoop, MqttOptions, Outgoing,
    Packet, Publish, QoS, SubscribeReasonCode,
};
use statum::{machine, state};
use tokio::net::lookup_host;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};
use uuid::Uuid;

use super::backoff::Backoff;
use super::config::{validate_topic_filter, BridgeOptions, BrokerSettings};
use super::error::{
    BridgeError, ConnectError, DeliveryTimeoutError, ReceiveError, SubscriptionError,
};
use super::message_manager::PayloadConverter;
use crate::dispatch::DispatchChannel;

/// Observable connection state of a running bridge.
#[derive(Clone, Copy, Default, Debug, PartialEq, Eq)]
pub enum ConnectionState {
    #[default]
    Disconnected,
    Connecting,
    Subscribed,
    Stopped,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let name = match self {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Subscribed => "subscribed",
            ConnectionState::Stopped => "stopped",
        };
        f.write_str(name)
    }
}

/// Counters of one bridge run, logged when the bridge stops.
#[derive(Clone, Copy, Default, Debug, PartialEq, Eq)]
pub struct BridgeStats {
    pub received: u64,
    pub dispatched: u64,
    pub rejected: u64,
    pub dropped: u64,
    pub reconnects: u64,
}

/// States of the broker session using statum
#[state]
#[derive(Debug, Clone)]
pub enum SessionState {
    Disconnected, // No network connection, waiting for the next attempt
    Connecting,   // Handshake and subscription in progress
    Subscribed,   // Receiving and dispatching
    Stopped,      // Terminal, only shutdown remains
}

/// Broker session with compile-time state safety via statum
#[machine]
pub struct BridgeSession<S: SessionState> {
    settings: Arc<BrokerSettings>,
    options: BridgeOptions,
    topic: String,
    qos: QoS,
    client: AsyncClient,
    eventloop: EventLoop,
    channel: DispatchChannel,
    converter: PayloadConverter,
    backoff: Backoff,
    // publishes that arrived before the SUBACK
    backlog: VecDeque<Publish>,
    status: watch::Sender<ConnectionState>,
    stats: BridgeStats,
    connected: bool,
    subscribed_once: bool,
}

impl<S: SessionState> BridgeSession<S> {
    fn set_status(&self, state: ConnectionState) {
        debug!("Bridge on '{}' is now {}", self.topic, state);
        self.status.send_replace(state);
    }

    /// Closes the network connection, which may still be open after a stalled
    /// delivery. Buffered publishes carry packet ids of that connection, the
    /// broker redelivers them on the next one.
    fn drop_connection(&mut self) {
        self.eventloop.clean();
        if !self.backlog.is_empty() {
            debug!("Discarding {} buffered message(s) of the lost connection", self.backlog.len());
            self.backlog.clear();
        }
        self.connected = false;
        self.set_status(ConnectionState::Disconnected);
    }
}

impl BridgeSession<Disconnected> {
    pub fn create(
        settings: Arc<BrokerSettings>,
        options: BridgeOptions,
        topic: String,
        client_id: &str,
        channel: DispatchChannel,
        status: watch::Sender<ConnectionState>,
    ) -> Self {
        let qos = settings.qos_level();

        let mut mqtt_options = MqttOptions::new(client_id, settings.host.clone(), settings.port);
        // persistent session for QoS 1/2 so unacknowledged messages survive a reconnect
        mqtt_options
            .set_keep_alive(options.keep_alive())
            .set_clean_session(qos == QoS::AtMostOnce)
            .set_manual_acks(true);
        if let Some(username) = &settings.username {
            debug!("Using credentials for user {}", username);
            mqtt_options.set_credentials(
                username.clone(),
                settings.password.clone().unwrap_or_default(),
            );
        }

        let (client, eventloop) = AsyncClient::new(mqtt_options, options.request_capacity);
        let converter = PayloadConverter::new(options.payload_format);
        let backoff = Backoff::new(options.reconnect_min(), options.reconnect_max());

        Self::new(
            settings,
            options,
            topic,
            qos,
            client,
            eventloop,
            channel,
            converter,
            backoff,
            VecDeque::new(),
            status,
            BridgeStats::default(),
            false, // connected
            false, // subscribed_once
        )
    }

    pub fn into_connecting(self) -> BridgeSession<Connecting> {
        self.set_status(ConnectionState::Connecting);
        self.transition()
    }

    pub fn into_stopped(self) -> BridgeSession<Stopped> {
        self.transition()
    }

    /// Waits out the backoff and retries until subscribed again or cancelled.
    pub async fn reconnect(
        self,
        cancel: &CancellationToken,
    ) -> Result<BridgeSession<Subscribed>, BridgeSession<Stopped>> {
        let mut session = self;

        loop {
            let delay = session.backoff.next_delay();
            info!(
                "Reconnecting to {} in {}ms",
                session.settings.endpoint(),
                delay.as_millis()
            );

            let cancelled = tokio::select! {
                _ = cancel.cancelled() => true,
                _ = sleep(delay) => false,
            };
            if cancelled {
                return Err(session.into_stopped());
            }

            session.stats.reconnects += 1;
            let mut connecting = session.into_connecting();
            let attempt = tokio::select! {
                _ = cancel.cancelled() => None,
                result = connecting.establish() => Some(result),
            };

            match attempt {
                None => return Err(connecting.into_stopped()),
                Some(Ok(())) => {
                    info!("Reconnected to {}", connecting.settings.endpoint());
                    return Ok(connecting.into_subscribed());
                }
                Some(Err(e)) => {
                    warn!("Reconnect attempt failed: {}", e);
                    session = connecting.into_disconnected();
                }
            }
        }
    }
}

impl BridgeSession<Connecting> {
    /// Connects (or reconnects) and makes sure the subscription is in place.
    pub async fn establish(&mut self) -> Result<(), BridgeError> {
        let session_present = self.handshake().await?;

        if session_present && self.subscribed_once {
            info!("Broker resumed the session, subscription to '{}' is still active", self.topic);
            return Ok(());
        }

        self.subscribe().await?;
        Ok(())
    }

    /// Polls the event loop until CONNACK. Returns the session-present flag.
    async fn handshake(&mut self) -> Result<bool, ConnectError> {
        let endpoint = self.settings.endpoint();
        let limit = self.options.completion_timeout();
        debug!("Waiting for CONNACK from {}", endpoint);

        let outcome = timeout(limit, async {
            loop {
                match self.eventloop.poll().await {
                    Ok(Event::Incoming(Packet::ConnAck(ack))) => {
                        if ack.code != ConnectReturnCode::Success {
                            return Err(ConnectError::Rejected {
                                endpoint: endpoint.clone(),
                                code: format!("{:?}", ack.code),
                            });
                        }
                        return Ok(ack.session_present);
                    }
                    Ok(Event::Incoming(Packet::Publish(publish))) => {
                        self.backlog.push_back(publish);
                    }
                    Ok(event) => trace!("Ignoring {:?} during handshake", event),
                    Err(ConnectionError::ConnectionRefused(code)) => {
                        return Err(ConnectError::Rejected {
                            endpoint: endpoint.clone(),
                            code: format!("{:?}", code),
                        });
                    }
                    Err(source) => {
                        return Err(ConnectError::Unreachable {
                            endpoint: endpoint.clone(),
                            source,
                        });
                    }
                }
            }
        })
        .await;

        match outcome {
            Ok(Ok(session_present)) => {
                self.connected = true;
                info!("Connected to {} (session present: {})", endpoint, session_present);
                Ok(session_present)
            }
            Ok(Err(e)) => Err(e),
            Err(_) => Err(ConnectError::Timeout {
                endpoint,
                timeout: limit,
            }),
        }
    }

    async fn subscribe(&mut self) -> Result<(), SubscriptionError> {
        let topic = self.topic.clone();
        let limit = self.options.completion_timeout();
        debug!("Subscribing to '{}' with {:?}", topic, self.qos);

        let outcome = timeout(limit, async {
            self.client
                .subscribe(topic.clone(), self.qos)
                .await
                .map_err(|source| SubscriptionError::Request {
                    topic: topic.clone(),
                    source,
                })?;

            loop {
                match self.eventloop.poll().await {
                    Ok(Event::Incoming(Packet::SubAck(ack))) => {
                        return match ack.return_codes.first() {
                            Some(SubscribeReasonCode::Success(granted)) => {
                                info!("Subscribed to '{}', broker granted {:?}", topic, granted);
                                Ok(())
                            }
                            _ => Err(SubscriptionError::Refused {
                                topic: topic.clone(),
                            }),
                        };
                    }
                    Ok(Event::Incoming(Packet::Publish(publish))) => {
                        self.backlog.push_back(publish);
                    }
                    Ok(event) => trace!("Ignoring {:?} while subscribing", event),
                    Err(source) => {
                        return Err(SubscriptionError::Connection {
                            topic: topic.clone(),
                            source,
                        });
                    }
                }
            }
        })
        .await;

        match outcome {
            Ok(result) => result,
            Err(_) => Err(SubscriptionError::Timeout {
                topic,
                timeout: limit,
            }),
        }
    }

    pub fn into_subscribed(mut self) -> BridgeSession<Subscribed> {
        self.subscribed_once = true;
        self.backoff.reset();
        self.set_status(ConnectionState::Subscribed);
        self.transition()
    }

    pub fn into_disconnected(mut self) -> BridgeSession<Disconnected> {
        self.drop_connection();
        self.transition()
    }

    pub fn into_stopped(self) -> BridgeSession<Stopped> {
        self.transition()
    }
}

/// Why [`BridgeSession::receive`] returned
pub enum ReceiveExit {
    Stopped(BridgeSession<Stopped>),
    Lost(BridgeSession<Disconnected>),
}

impl BridgeSession<Subscribed> {
    /// Receives and dispatches until cancelled or the connection fails.
    pub async fn receive(mut self, cancel: &CancellationToken) -> ReceiveExit {
        let limit = self.options.completion_timeout();
        info!("Receiving messages on '{}'", self.topic);

        loop {
            let next = match self.backlog.pop_front() {
                Some(publish) => Ok(Event::Incoming(Packet::Publish(publish))),
                None => {
                    let polled = tokio::select! {
                        _ = cancel.cancelled() => None,
                        event = self.eventloop.poll() => Some(event),
                    };
                    match polled {
                        Some(event) => event,
                        None => return ReceiveExit::Stopped(self.into_stopped()),
                    }
                }
            };

            let failure = match next {
                Ok(Event::Incoming(Packet::Publish(publish))) => {
                    let topic = publish.topic.clone();
                    let cycle = tokio::select! {
                        _ = cancel.cancelled() => None,
                        result = timeout(limit, self.deliver(publish)) => Some(result),
                    };
                    match cycle {
                        None => return ReceiveExit::Stopped(self.into_stopped()),
                        Some(Ok(Ok(()))) => continue,
                        Some(Ok(Err(e))) => e,
                        Some(Err(_)) => ReceiveError::from(DeliveryTimeoutError {
                            topic,
                            timeout: limit,
                        }),
                    }
                }
                Ok(Event::Incoming(Packet::Disconnect)) => ReceiveError::BrokerDisconnect,
                Ok(event) => {
                    trace!("Event: {:?}", event);
                    continue;
                }
                Err(e) => ReceiveError::Connection(e),
            };

            warn!("Lost subscription to '{}': {}", self.topic, failure);
            return ReceiveExit::Lost(self.into_disconnected());
        }
    }

    /// One convert, dispatch and acknowledge cycle.
    async fn deliver(&mut self, publish: Publish) -> Result<(), ReceiveError> {
        self.stats.received += 1;
        debug!(
            "Received {} bytes on {} (pkid {}, {:?})",
            publish.payload.len(),
            publish.topic,
            publish.pkid,
            publish.qos
        );

        match self.converter.convert(&publish) {
            Ok(message) => {
                let report = self.channel.publish(message).await;
                self.stats.dispatched += 1;
                self.stats.dropped += report.dropped as u64;
            }
            Err(e) => {
                self.stats.rejected += 1;
                warn!("Dropping message: {}", e);
            }
        }

        // no-op for QoS 0
        self.client.ack(&publish).await?;
        Ok(())
    }

    pub fn into_disconnected(mut self) -> BridgeSession<Disconnected> {
        self.drop_connection();
        self.transition()
    }

    pub fn into_stopped(self) -> BridgeSession<Stopped> {
        self.transition()
    }
}

impl BridgeSession<Stopped> {
    /// Unsubscribes and disconnects if a connection is up, then reports `Stopped`.
    pub async fn shutdown(mut self) {
        if self.connected {
            info!("Unsubscribing from '{}' and disconnecting", self.topic);
            if let Err(e) = self.client.unsubscribe(self.topic.clone()).await {
                warn!("Failed to request unsubscribe: {}", e);
            }
            if let Err(e) = self.client.disconnect().await {
                warn!("Failed to request disconnect: {}", e);
            }

            let limit = self.options.completion_timeout();
            let flushed = timeout(limit, async {
                loop {
                    match self.eventloop.poll().await {
                        Ok(Event::Outgoing(Outgoing::Disconnect)) => break,
                        Ok(Event::Incoming(Packet::Publish(publish))) => {
                            debug!("Discarding message on {} received during shutdown", publish.topic);
                        }
                        Ok(_) => {}
                        Err(e) => {
                            debug!("Connection closed during shutdown: {}", e);
                            break;
                        }
                    }
                }
            })
            .await;
            if flushed.is_err() {
                warn!("Disconnect not flushed within {}ms", limit.as_millis());
            }
            self.connected = false;
        }

        let stats = self.stats;
        info!(
            "Bridge on '{}' stopped: {} received, {} dispatched, {} rejected, {} dropped, {} reconnects",
            self.topic,
            stats.received,
            stats.dispatched,
            stats.rejected,
            stats.dropped,
            stats.reconnects
        );
        self.set_status(ConnectionState::Stopped);
    }
}

/// Bridge task: receive, reconnect on failure, shut down on cancellation.
async fn supervise(session: BridgeSession<Subscribed>, cancel: CancellationToken) {
    let mut session = session;

    loop {
        let lost = match session.receive(&cancel).await {
            ReceiveExit::Stopped(stopped) => return stopped.shutdown().await,
            ReceiveExit::Lost(lost) => lost,
        };

        session = match lost.reconnect(&cancel).await {
            Ok(subscribed) => subscribed,
            Err(stopped) => return stopped.shutdown().await,
        };
    }
}

fn generate_client_id(prefix: Option<&str>) -> String {
    let id = Uuid::new_v4();
    match prefix {
        Some(prefix) if !prefix.is_empty() => format!("{}-{}", prefix, id),
        _ => id.to_string(),
    }
}

async fn resolve(settings: &BrokerSettings, limit: Duration) -> Result<(), ConnectError> {
    let endpoint = settings.endpoint();

    let lookup = timeout(limit, lookup_host((settings.host.as_str(), settings.port)))
        .await
        .map_err(|_| ConnectError::Timeout {
            endpoint: endpoint.clone(),
            timeout: limit,
        })?;
    let mut addrs = lookup.map_err(|source| ConnectError::Unresolvable {
        endpoint: endpoint.clone(),
        source,
    })?;

    match addrs.next() {
        Some(addr) => {
            debug!("{} resolved to {}", endpoint, addr);
            Ok(())
        }
        None => Err(ConnectError::Unresolvable {
            endpoint,
            source: std::io::Error::new(std::io::ErrorKind::NotFound, "no addresses found"),
        }),
    }
}

/// Connects a broker topic to a [`DispatchChannel`].
///
/// # Examples
///
/// ```rust,no_run
/// use inbound_bridge::dispatch::{DispatchChannel, LoggingConsumer};
/// use inbound_bridge::mqtt::{BrokerSettings, InboundBridge};
///
/// # #[tokio::main]
/// # async fn main() -> Result<(), Box<dyn std::error::Error>> {
/// let channel = DispatchChannel::new(100);
/// channel.register(LoggingConsumer::default()).await;
///
/// let bridge = InboundBridge::new(BrokerSettings::new("localhost", 1883), channel);
/// let mut handle = bridge.start("test").await?;
/// // ...
/// handle.stop().await;
/// # Ok(())
/// # }
/// ```
#[derive(Debug, Clone)]
pub struct InboundBridge {
    settings: Arc<BrokerSettings>,
    options: BridgeOptions,
    channel: DispatchChannel,
}

impl InboundBridge {
    pub fn new(settings: BrokerSettings, channel: DispatchChannel) -> Self {
        Self {
            settings: Arc::new(settings),
            options: BridgeOptions::default(),
            channel,
        }
    }

    pub fn with_options(mut self, options: BridgeOptions) -> Self {
        self.options = options;
        self
    }

    /// Connects, subscribes to `topic` and spawns the bridge task.
    ///
    /// Every call uses a fresh random client id. The first connection attempt
    /// is not retried: an unreachable broker or a refused handshake is
    /// returned as [`ConnectError`], a refused subscription as
    /// [`SubscriptionError`]. Once running, connection losses are recovered
    /// inside the bridge task.
    pub async fn start(&self, topic: &str) -> Result<BridgeHandle, BridgeError> {
        self.settings.validate().map_err(ConnectError::from)?;
        self.options.validate().map_err(ConnectError::from)?;
        validate_topic_filter(topic).map_err(|reason| SubscriptionError::InvalidFilter {
            topic: topic.to_string(),
            reason,
        })?;

        resolve(&self.settings, self.options.completion_timeout()).await?;

        let client_id = generate_client_id(self.options.client_id_prefix.as_deref());
        info!("Starting bridge to {} as {} on '{}'", self.settings, client_id, topic);

        let (status_tx, status_rx) = watch::channel(ConnectionState::Disconnected);
        let session = BridgeSession::create(
            Arc::clone(&self.settings),
            self.options.clone(),
            topic.to_string(),
            &client_id,
            self.channel.clone(),
            status_tx,
        );

        let mut connecting = session.into_connecting();
        if let Err(e) = connecting.establish().await {
            error!("Failed to start bridge on '{}': {}", topic, e);
            return Err(e);
        }
        let subscribed = connecting.into_subscribed();

        let cancel = CancellationToken::new();
        let task = tokio::spawn(supervise(subscribed, cancel.clone()));

        Ok(BridgeHandle {
            client_id,
            topic: topic.to_string(),
            cancel,
            task: Some(task),
            status: status_rx,
        })
    }
}

/// Handle of a running bridge, used to observe and stop it.
///
/// Dropping the handle cancels the bridge task without waiting for it.
#[derive(Debug)]
pub struct BridgeHandle {
    client_id: String,
    topic: String,
    cancel: CancellationToken,
    task: Option<JoinHandle<()>>,
    status: watch::Receiver<ConnectionState>,
}

impl BridgeHandle {
    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub fn state(&self) -> ConnectionState {
        *self.status.borrow()
    }

    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.status.clone()
    }

    /// Stops the bridge and waits for the task to finish.
    ///
    /// No message is pushed to the dispatch channel after this returns.
    /// Calling it again has no further effect.
    pub async fn stop(&mut self) {
        self.cancel.cancel();

        match self.task.take() {
            Some(task) => {
                debug!("Waiting for bridge task on '{}'", self.topic);
                if let Err(e) = task.await {
                    error!("Bridge task on '{}' terminated abnormally: {}", self.topic, e);
                }
                info!("Bridge on '{}' stopped", self.topic);
            }
            None => debug!("Bridge on '{}' already stopped", self.topic),
        }
    }
}

impl Drop for BridgeHandle {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}
