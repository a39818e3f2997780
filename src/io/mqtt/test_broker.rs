// src/io/mqtt/test_broker.rs
//
// Minimal MQTT 3.1.1 broker on a loopback port for exercising the client over
// real TCP. Understands CONNECT, SUBSCRIBE, PUBLISH (QoS 0), PINGREQ and
// DISCONNECT, records what it receives, and can push publishes to or drop the
// current session.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::OwnedReadHalf;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::settings::BrokerConfig;

/// A packet the broker received from the client.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum TestPacket {
    Connect,
    Subscribe(String),
    Publish { topic: String, payload: Vec<u8> },
    Disconnect,
}

enum Command {
    Publish(String, Vec<u8>),
    Close,
}

#[derive(Default)]
struct Shared {
    received: Mutex<Vec<TestPacket>>,
    connections: AtomicUsize,
    session: Mutex<Option<mpsc::UnboundedSender<Command>>>,
    /// Applied to every CONNACK except the first session's
    connack_delay: Duration,
}

pub struct TestBroker {
    port: u16,
    shared: Arc<Shared>,
    accept_task: JoinHandle<()>,
}

impl TestBroker {
    pub async fn start() -> Self {
        Self::with_connack_delay(Duration::ZERO).await
    }

    pub async fn with_connack_delay(connack_delay: Duration) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let shared = Arc::new(Shared {
            connack_delay,
            ..Default::default()
        });

        let accept_shared = shared.clone();
        let accept_task = tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                let index = accept_shared.connections.fetch_add(1, Ordering::SeqCst);
                let (tx, rx) = mpsc::unbounded_channel();
                *accept_shared.session.lock().unwrap() = Some(tx);
                tokio::spawn(serve_session(stream, index, accept_shared.clone(), rx));
            }
        });

        Self {
            port,
            shared,
            accept_task,
        }
    }

    /// Plain-TCP client settings pointing at this broker.
    pub fn config(&self) -> BrokerConfig {
        BrokerConfig {
            host: "127.0.0.1".to_string(),
            port: self.port,
            tls: Some(false),
            client_id: Some("can2mqtt-test".to_string()),
            connect_timeout_ms: 2000,
            reconnect_delay_ms: 50,
            ..BrokerConfig::default()
        }
    }

    pub fn connections(&self) -> usize {
        self.shared.connections.load(Ordering::SeqCst)
    }

    pub fn received(&self) -> Vec<TestPacket> {
        self.shared.received.lock().unwrap().clone()
    }

    pub fn publish_count(&self) -> usize {
        self.received()
            .iter()
            .filter(|p| matches!(p, TestPacket::Publish { .. }))
            .count()
    }

    /// Send a QoS 0 publish to the connected client.
    pub fn send_publish(&self, topic: &str, payload: Vec<u8>) -> bool {
        self.command(Command::Publish(topic.to_string(), payload))
    }

    /// Drop the current session's connection.
    pub fn close_session(&self) {
        self.command(Command::Close);
    }

    fn command(&self, command: Command) -> bool {
        match self.shared.session.lock().unwrap().as_ref() {
            Some(tx) => tx.send(command).is_ok(),
            None => false,
        }
    }

    /// Wait up to 5 s for the received packets to satisfy `condition`.
    pub async fn wait_for(&self, condition: impl Fn(&[TestPacket]) -> bool) -> bool {
        for _ in 0..500 {
            if condition(&self.received()) {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        false
    }
}

impl Drop for TestBroker {
    fn drop(&mut self) {
        self.accept_task.abort();
    }
}

async fn serve_session(
    stream: TcpStream,
    index: usize,
    shared: Arc<Shared>,
    mut commands: mpsc::UnboundedReceiver<Command>,
) {
    let (mut reader, mut writer) = stream.into_split();

    // Reads run in their own task so a command never interrupts a packet
    let (packet_tx, mut packets) = mpsc::unbounded_channel();
    let read_task = tokio::spawn(async move {
        while let Some(packet) = read_packet(&mut reader).await {
            if packet_tx.send(packet).is_err() {
                break;
            }
        }
    });

    loop {
        tokio::select! {
            packet = packets.recv() => {
                let Some((header, body)) = packet else { break };
                let reply = match header >> 4 {
                    1 => {
                        if index > 0 && !shared.connack_delay.is_zero() {
                            tokio::time::sleep(shared.connack_delay).await;
                        }
                        record(&shared, TestPacket::Connect);
                        vec![0x20, 0x02, 0x00, 0x00]
                    }
                    3 => {
                        let (topic, rest) = split_string(&body);
                        // QoS 1/2 would carry a packet id before the payload
                        let offset = if (header >> 1) & 0x03 == 0 { 0 } else { 2 };
                        record(&shared, TestPacket::Publish {
                            topic,
                            payload: rest[offset..].to_vec(),
                        });
                        Vec::new()
                    }
                    8 => {
                        let (topic, _) = split_string(&body[2..]);
                        record(&shared, TestPacket::Subscribe(topic));
                        vec![0x90, 0x03, body[0], body[1], 0x00]
                    }
                    12 => vec![0xD0, 0x00],
                    14 => {
                        record(&shared, TestPacket::Disconnect);
                        break;
                    }
                    _ => Vec::new(),
                };
                if !reply.is_empty() && writer.write_all(&reply).await.is_err() {
                    break;
                }
            }
            command = commands.recv() => match command {
                Some(Command::Publish(topic, payload)) => {
                    if writer.write_all(&encode_publish(&topic, &payload)).await.is_err() {
                        break;
                    }
                }
                Some(Command::Close) | None => break,
            }
        }
    }

    read_task.abort();
}

fn record(shared: &Shared, packet: TestPacket) {
    shared.received.lock().unwrap().push(packet);
}

async fn read_packet(reader: &mut OwnedReadHalf) -> Option<(u8, Vec<u8>)> {
    let header = reader.read_u8().await.ok()?;

    let mut len = 0usize;
    for shift in [0, 7, 14, 21] {
        let byte = reader.read_u8().await.ok()?;
        len |= ((byte & 0x7F) as usize) << shift;
        if byte & 0x80 == 0 {
            let mut body = vec![0; len];
            reader.read_exact(&mut body).await.ok()?;
            return Some((header, body));
        }
    }
    None
}

/// Length-prefixed UTF-8 string at the start of `data`, and what follows it.
fn split_string(data: &[u8]) -> (String, &[u8]) {
    let len = u16::from_be_bytes([data[0], data[1]]) as usize;
    let text = String::from_utf8_lossy(&data[2..2 + len]).into_owned();
    (text, &data[2 + len..])
}

fn encode_publish(topic: &str, payload: &[u8]) -> Vec<u8> {
    let mut body = Vec::with_capacity(2 + topic.len() + payload.len());
    body.extend_from_slice(&(topic.len() as u16).to_be_bytes());
    body.extend_from_slice(topic.as_bytes());
    body.extend_from_slice(payload);

    let mut packet = vec![0x30];
    let mut len = body.len();
    loop {
        let mut byte = (len % 128) as u8;
        len /= 128;
        if len > 0 {
            byte |= 0x80;
        }
        packet.push(byte);
        if len == 0 {
            break;
        }
    }
    packet.extend(body);
    packet
}
