//! Scriptable in-process MQTT 3.1.1 broker for the bridge tests.
//!
//! Each accepted connection plays the next [`SessionScript`]; connections
//! beyond the list behave like a plain accepting broker. Packets are encoded
//! and decoded with the `mqttbytes` codec of rumqttc, everything the bridge
//! sends is reported as a [`BrokerEvent`].

use std::io;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::BytesMut;
use rumqttc::mqttbytes::{self, v4};
use rumqttc::{
    ConnAck, ConnectReturnCode, Packet, PingResp, PubRel, Publish, QoS, SubAck,
    SubscribeReasonCode, UnsubAck,
};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::time::{timeout, Instant};

const MAX_PACKET_SIZE: usize = 64 * 1024;

#[derive(Debug, Clone)]
pub struct SessionScript {
    pub connack: ConnectReturnCode,
    /// Reports a present session for this topic and publishes right after the
    /// CONNACK instead of waiting for a SUBSCRIBE
    pub resumed_topic: Option<String>,
    pub refuse_subscribe: bool,
    /// Sent on the subscribed (or resumed) topic, packet ids start at 1
    pub publishes: Vec<(QoS, Vec<u8>)>,
    /// Close the socket right after the scripted publishes
    pub hang_up_after_publish: bool,
    /// Close the socket without reading the CONNECT
    pub drop_on_accept: bool,
}

impl Default for SessionScript {
    fn default() -> Self {
        Self {
            connack: ConnectReturnCode::Success,
            resumed_topic: None,
            refuse_subscribe: false,
            publishes: Vec::new(),
            hang_up_after_publish: false,
            drop_on_accept: false,
        }
    }
}

impl SessionScript {
    pub fn publishing(qos: QoS, payloads: &[&[u8]]) -> Self {
        Self {
            publishes: payloads.iter().map(|p| (qos, p.to_vec())).collect(),
            ..Self::default()
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BrokerEvent {
    Connected {
        client_id: String,
        clean_session: bool,
        username: Option<String>,
        password: Option<String>,
    },
    Subscribed {
        filter: String,
        qos: QoS,
    },
    PubAck {
        pkid: u16,
    },
    PubRec {
        pkid: u16,
    },
    PubComp {
        pkid: u16,
    },
    Unsubscribed {
        filter: String,
    },
    Disconnected,
    Closed,
}

pub struct FakeBroker {
    pub port: u16,
    events: mpsc::UnboundedReceiver<BrokerEvent>,
    accepted: Arc<Mutex<Vec<Instant>>>,
}

impl FakeBroker {
    pub async fn start(scripts: Vec<SessionScript>) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let (tx, events) = mpsc::unbounded_channel();
        let accepted = Arc::new(Mutex::new(Vec::new()));

        let accept_log = Arc::clone(&accepted);
        tokio::spawn(async move {
            let mut scripts = scripts.into_iter();
            while let Ok((stream, _)) = listener.accept().await {
                accept_log.lock().unwrap().push(Instant::now());
                let script = scripts.next().unwrap_or_default();
                tokio::spawn(serve(Connection::new(stream), script, tx.clone()));
            }
        });

        Self {
            port,
            events,
            accepted,
        }
    }

    /// When each TCP connection was accepted, in order.
    pub fn accept_times(&self) -> Vec<Instant> {
        self.accepted.lock().unwrap().clone()
    }

    pub async fn next_event(&mut self) -> BrokerEvent {
        timeout(Duration::from_secs(10), self.events.recv())
            .await
            .expect("timed out waiting for broker event")
            .expect("broker event channel closed")
    }

    /// Skips events until one matches.
    pub async fn expect<F>(&mut self, mut matches: F) -> BrokerEvent
    where
        F: FnMut(&BrokerEvent) -> bool,
    {
        loop {
            let event = self.next_event().await;
            if matches(&event) {
                return event;
            }
        }
    }

    /// Everything reported until the broker stays quiet for `quiet`.
    pub async fn drain(&mut self, quiet: Duration) -> Vec<BrokerEvent> {
        let mut events = Vec::new();
        while let Ok(Some(event)) = timeout(quiet, self.events.recv()).await {
            events.push(event);
        }
        events
    }
}

struct Connection {
    stream: TcpStream,
    read: BytesMut,
}

impl Connection {
    fn new(stream: TcpStream) -> Self {
        Self {
            stream,
            read: BytesMut::with_capacity(4096),
        }
    }

    /// Next packet, `None` once the peer closed the socket.
    async fn read(&mut self) -> io::Result<Option<Packet>> {
        loop {
            match v4::read(&mut self.read, MAX_PACKET_SIZE) {
                Ok(packet) => return Ok(Some(packet)),
                Err(mqttbytes::Error::InsufficientBytes(_)) => {}
                Err(e) => return Err(io::Error::new(io::ErrorKind::InvalidData, e)),
            }
            if self.stream.read_buf(&mut self.read).await? == 0 {
                return Ok(None);
            }
        }
    }

    async fn send(&mut self, buffer: BytesMut) -> io::Result<()> {
        self.stream.write_all(&buffer).await
    }

    async fn publish_all(&mut self, topic: &str, publishes: &[(QoS, Vec<u8>)]) -> io::Result<()> {
        let mut buffer = BytesMut::new();
        for (idx, (qos, payload)) in publishes.iter().enumerate() {
            let mut publish = Publish::new(topic, *qos, payload.clone());
            if *qos != QoS::AtMostOnce {
                publish.pkid = idx as u16 + 1;
            }
            publish.write(&mut buffer).map_err(invalid)?;
        }
        self.send(buffer).await
    }
}

fn invalid(e: mqttbytes::Error) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, e)
}

async fn serve(mut conn: Connection, script: SessionScript, events: mpsc::UnboundedSender<BrokerEvent>) {
    if script.drop_on_accept {
        return;
    }

    loop {
        let packet = match conn.read().await {
            Ok(Some(packet)) => packet,
            _ => {
                let _ = events.send(BrokerEvent::Closed);
                return;
            }
        };

        let outcome = match packet {
            Packet::Connect(connect) => {
                let (username, password) = match connect.login {
                    Some(login) => (Some(login.username), Some(login.password)),
                    None => (None, None),
                };
                let _ = events.send(BrokerEvent::Connected {
                    client_id: connect.client_id,
                    clean_session: connect.clean_session,
                    username,
                    password,
                });

                let mut buffer = BytesMut::new();
                let session_present = script.resumed_topic.is_some();
                let written = ConnAck::new(script.connack, session_present).write(&mut buffer);
                if written.is_err() || conn.send(buffer).await.is_err() {
                    return;
                }
                if script.connack != ConnectReturnCode::Success {
                    return;
                }
                match &script.resumed_topic {
                    Some(topic) => conn.publish_all(topic, &script.publishes).await,
                    None => continue,
                }
            }
            Packet::Subscribe(subscribe) => {
                let Some(filter) = subscribe.filters.first() else {
                    continue;
                };
                let _ = events.send(BrokerEvent::Subscribed {
                    filter: filter.path.clone(),
                    qos: filter.qos,
                });

                let code = if script.refuse_subscribe {
                    SubscribeReasonCode::Failure
                } else {
                    SubscribeReasonCode::Success(filter.qos)
                };
                let mut buffer = BytesMut::new();
                if SubAck::new(subscribe.pkid, vec![code]).write(&mut buffer).is_err()
                    || conn.send(buffer).await.is_err()
                {
                    return;
                }
                if script.refuse_subscribe {
                    continue;
                }
                conn.publish_all(&filter.path, &script.publishes).await
            }
            Packet::PubAck(ack) => {
                let _ = events.send(BrokerEvent::PubAck { pkid: ack.pkid });
                continue;
            }
            Packet::PubRec(rec) => {
                let _ = events.send(BrokerEvent::PubRec { pkid: rec.pkid });
                let mut buffer = BytesMut::new();
                if PubRel::new(rec.pkid).write(&mut buffer).is_err()
                    || conn.send(buffer).await.is_err()
                {
                    return;
                }
                continue;
            }
            Packet::PubComp(comp) => {
                let _ = events.send(BrokerEvent::PubComp { pkid: comp.pkid });
                continue;
            }
            Packet::Unsubscribe(unsubscribe) => {
                for filter in unsubscribe.topics {
                    let _ = events.send(BrokerEvent::Unsubscribed { filter });
                }
                let mut buffer = BytesMut::new();
                if UnsubAck::new(unsubscribe.pkid).write(&mut buffer).is_err()
                    || conn.send(buffer).await.is_err()
                {
                    return;
                }
                continue;
            }
            Packet::PingReq => {
                let mut buffer = BytesMut::new();
                if PingResp.write(&mut buffer).is_err() || conn.send(buffer).await.is_err() {
                    return;
                }
                continue;
            }
            Packet::Disconnect => {
                let _ = events.send(BrokerEvent::Disconnected);
                return;
            }
            _ => continue,
        };

        // only reached after the scripted publishes went out
        if outcome.is_err() {
            return;
        }
        if script.hang_up_after_publish {
            let _ = conn.stream.shutdown().await;
            let _ = events.send(BrokerEvent::Closed);
            return;
        }
    }
}
