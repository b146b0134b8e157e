// STOMP over WebSocket transport
// Opens the socket, performs the CONNECT/CONNECTED handshake, then hands the
// socket halves to two tasks: a writer fed by an unbounded queue that also
// emits heart-beats, and a reader that forwards MESSAGE frames to the engine.

use async_trait::async_trait;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, Stream, StreamExt};
use log::{debug, info, warn};
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, timeout, Instant, Interval};
use tokio_tungstenite::tungstenite::http::Uri;
use tokio_tungstenite::tungstenite::{Error as WsError, Message as WsMessage};
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use uuid::Uuid;

use crate::config::SyncConfig;
use crate::error::TransportError;
use crate::models::UserId;
use crate::sync::{SessionSink, Transport, TransportSession};
use super::frame::{Command, Frame};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Production `Transport`: one STOMP 1.2 session per open.
#[derive(Debug, Clone)]
pub struct StompTransport {
    url: String,
    heartbeat: Duration,
    connect_timeout: Duration,
}

impl StompTransport {
    pub fn new(url: impl Into<String>, heartbeat: Duration, connect_timeout: Duration) -> Self {
        StompTransport {
            url: url.into(),
            heartbeat,
            connect_timeout,
        }
    }

    pub fn from_config(config: &SyncConfig) -> Self {
        Self::new(config.broker_url.clone(), config.heartbeat(), config.connect_timeout())
    }

    /// Broker URL with the identity query parameter the server keys sessions by.
    pub fn endpoint(&self, identity: UserId) -> String {
        let separator = if self.url.contains('?') { '&' } else { '?' };
        format!("{}{}userId={}", self.url, separator, identity)
    }

    fn host(&self) -> String {
        self.url
            .parse::<Uri>()
            .ok()
            .and_then(|uri| uri.host().map(str::to_string))
            .unwrap_or_else(|| "localhost".to_string())
    }

    async fn handshake(&self, identity: UserId) -> Result<(WsStream, Frame), TransportError> {
        let endpoint = self.endpoint(identity);
        debug!("Opening WebSocket to {}", endpoint);
        let (mut socket, _) = connect_async(endpoint.as_str())
            .await
            .map_err(|e| TransportError::Connect(e.to_string()))?;

        let beat = self.heartbeat.as_millis();
        let connect = Frame::new(Command::Connect)
            .with_header("accept-version", "1.2")
            .with_header("host", self.host())
            .with_header("heart-beat", format!("{},{}", beat, beat));
        socket
            .send(WsMessage::Text(connect.encode()))
            .await
            .map_err(|e| TransportError::Connect(e.to_string()))?;

        let connected = await_connected(&mut socket).await?;
        Ok((socket, connected))
    }
}

#[async_trait]
impl Transport for StompTransport {
    async fn open(
        &self,
        identity: UserId,
        sink: SessionSink,
    ) -> Result<Box<dyn TransportSession>, TransportError> {
        let (socket, connected) = timeout(self.connect_timeout, self.handshake(identity))
            .await
            .map_err(|_| {
                TransportError::Connect(format!(
                    "no CONNECTED frame within {}ms",
                    self.connect_timeout.as_millis()
                ))
            })??;

        let (send_every, expect_every) =
            negotiate_heartbeat(self.heartbeat, connected.header("heart-beat"));
        info!(
            "STOMP session established (version {}, heart-beat out {:?} in {:?})",
            connected.header("version").unwrap_or("?"),
            send_every,
            expect_every
        );

        let (write, read) = socket.split();
        let (outgoing, outgoing_rx) = mpsc::unbounded_channel();
        let writer = tokio::spawn(write_loop(write, outgoing_rx, send_every));
        let reader = tokio::spawn(read_loop(read, sink, expect_every));

        Ok(Box::new(StompSession {
            outgoing: Some(outgoing),
            reader,
            writer,
        }))
    }
}

async fn await_connected<S>(socket: &mut S) -> Result<Frame, TransportError>
where
    S: Stream<Item = Result<WsMessage, WsError>> + Unpin,
{
    while let Some(message) = socket.next().await {
        let text = match message.map_err(|e| TransportError::Connect(e.to_string()))? {
            WsMessage::Text(text) => text,
            WsMessage::Close(_) => break,
            _ => continue,
        };
        let frame = match Frame::decode(&text)? {
            Some(frame) => frame,
            None => continue,
        };
        return match frame.command {
            Command::Connected => Ok(frame),
            Command::Error => Err(TransportError::Rejected(
                frame.header("message").unwrap_or(&frame.body).to_string(),
            )),
            other => Err(TransportError::Protocol(format!(
                "expected CONNECTED, got {}",
                other
            ))),
        };
    }
    Err(TransportError::Connect("socket closed during handshake".into()))
}

/// Heart-beat periods (outgoing, expected incoming) from our setting and the
/// server's `heart-beat` header. `None` disables that direction.
pub fn negotiate_heartbeat(
    ours: Duration,
    server: Option<&str>,
) -> (Option<Duration>, Option<Duration>) {
    let (server_send, server_want) = server
        .and_then(|h| h.split_once(','))
        .map(|(sx, sy)| {
            (
                sx.trim().parse::<u64>().unwrap_or(0),
                sy.trim().parse::<u64>().unwrap_or(0),
            )
        })
        .unwrap_or((0, 0));
    let ours = ours.as_millis() as u64;

    let pick = |mine: u64, theirs: u64| {
        (mine != 0 && theirs != 0).then(|| Duration::from_millis(mine.max(theirs)))
    };
    (pick(ours, server_want), pick(ours, server_send))
}

async fn write_loop(
    mut write: SplitSink<WsStream, WsMessage>,
    mut outgoing: mpsc::UnboundedReceiver<String>,
    heartbeat: Option<Duration>,
) {
    let mut ticker = heartbeat.map(|period| interval_at(Instant::now() + period, period));

    loop {
        let text = tokio::select! {
            frame = outgoing.recv() => match frame {
                Some(frame) => frame,
                None => break,
            },
            _ = tick(&mut ticker) => "\n".to_string(),
        };
        if let Err(e) = write.send(WsMessage::Text(text)).await {
            warn!("WebSocket write failed: {}", e);
            break;
        }
    }
    let _ = write.close().await;
}

async fn tick(ticker: &mut Option<Interval>) {
    match ticker {
        Some(ticker) => {
            ticker.tick().await;
        }
        None => std::future::pending::<()>().await,
    }
}

async fn read_loop(mut read: SplitStream<WsStream>, sink: SessionSink, expect_every: Option<Duration>) {
    // Tolerate one missed beat before declaring the server gone
    let silence_limit = expect_every.map(|period| period * 2);

    let reason = loop {
        let next = match silence_limit {
            Some(limit) => match timeout(limit, read.next()).await {
                Ok(next) => next,
                Err(_) => break format!("no data from broker for {}ms", limit.as_millis()),
            },
            None => read.next().await,
        };

        match next {
            Some(Ok(WsMessage::Text(text))) => match Frame::decode(&text) {
                Ok(Some(frame)) => match frame.command {
                    Command::Message => {
                        let destination = frame.header("destination").unwrap_or_default().to_string();
                        let delivered = match frame.header("subscription") {
                            Some(id) => {
                                let id = id.to_string();
                                sink.deliver_subscribed(id, destination, frame.body)
                            }
                            None => sink.deliver(destination, frame.body),
                        };
                        if !delivered {
                            debug!("Engine gone, stopping STOMP reader");
                            return;
                        }
                    }
                    Command::Error => {
                        break format!(
                            "broker error: {}",
                            frame.header("message").unwrap_or(&frame.body)
                        )
                    }
                    other => debug!("Ignoring {} frame", other),
                },
                Ok(None) => {}
                Err(e) => warn!("Dropping malformed STOMP frame: {}", e),
            },
            Some(Ok(WsMessage::Close(close))) => {
                break match close {
                    Some(close) => format!("socket closed ({}: {})", close.code, close.reason),
                    None => "socket closed".to_string(),
                }
            }
            Some(Ok(_)) => {}
            Some(Err(e)) => break format!("socket error: {}", e),
            None => break "socket closed".to_string(),
        }
    };
    sink.closed(reason);
}

/// A live STOMP session. Frames are queued to the writer task, so every
/// method returns immediately.
pub struct StompSession {
    outgoing: Option<mpsc::UnboundedSender<String>>,
    reader: JoinHandle<()>,
    writer: JoinHandle<()>,
}

impl StompSession {
    fn push(&self, frame: Frame) -> Result<(), TransportError> {
        let outgoing = self.outgoing.as_ref().ok_or(TransportError::Closed)?;
        if self.writer.is_finished() {
            return Err(TransportError::Send("writer task stopped".into()));
        }
        outgoing
            .send(frame.encode())
            .map_err(|_| TransportError::Send("writer task stopped".into()))
    }
}

impl TransportSession for StompSession {
    fn subscribe(&mut self, destination: &str) -> Result<String, TransportError> {
        let id = format!("sub-{}", Uuid::new_v4());
        self.push(
            Frame::new(Command::Subscribe)
                .with_header("id", id.as_str())
                .with_header("destination", destination)
                .with_header("ack", "auto"),
        )?;
        debug!("Subscribed to {} as {}", destination, id);
        Ok(id)
    }

    fn unsubscribe(&mut self, subscription_id: &str) -> Result<(), TransportError> {
        self.push(Frame::new(Command::Unsubscribe).with_header("id", subscription_id))
    }

    fn publish(&mut self, destination: &str, body: &str) -> Result<(), TransportError> {
        self.push(
            Frame::new(Command::Send)
                .with_header("destination", destination)
                .with_header("content-type", "application/json")
                .with_body(body),
        )
    }

    fn close(&mut self) {
        self.reader.abort();
        // Dropping the queue lets the writer flush DISCONNECT and close the socket
        if let Some(outgoing) = self.outgoing.take() {
            let _ = outgoing.send(Frame::new(Command::Disconnect).encode());
        }
    }
}

impl Drop for StompSession {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_endpoint_appends_identity() {
        let transport = StompTransport::new(
            "ws://localhost:8080/ws/websocket",
            Duration::from_millis(4000),
            Duration::from_secs(10),
        );
        assert_eq!(
            transport.endpoint(UserId(7)),
            "ws://localhost:8080/ws/websocket?userId=7"
        );
        assert_eq!(transport.host(), "localhost");

        let with_query = StompTransport::new("wss://chat.example.com/ws?v=2", Duration::ZERO, Duration::ZERO);
        assert_eq!(with_query.endpoint(UserId(7)), "wss://chat.example.com/ws?v=2&userId=7");
    }

    #[test]
    fn test_heartbeat_negotiation() {
        let ours = Duration::from_millis(4000);
        assert_eq!(
            negotiate_heartbeat(ours, Some("10000,10000")),
            (Some(Duration::from_millis(10000)), Some(Duration::from_millis(10000)))
        );
        assert_eq!(
            negotiate_heartbeat(ours, Some("0,1000")),
            (Some(Duration::from_millis(4000)), None)
        );
        assert_eq!(negotiate_heartbeat(ours, None), (None, None));
        assert_eq!(negotiate_heartbeat(Duration::ZERO, Some("5000,5000")), (None, None));
    }

    #[tokio::test]
    async fn test_handshake_rejection_is_reported() {
        let messages = vec![
            Ok(WsMessage::Text("\n".to_string())),
            Ok(WsMessage::Text("ERROR\nmessage:bad credentials\n\n\0".to_string())),
        ];
        let mut stream = futures_util::stream::iter(messages);
        assert_eq!(
            await_connected(&mut stream).await,
            Err(TransportError::Rejected("bad credentials".into()))
        );
    }

    #[tokio::test]
    async fn test_handshake_accepts_connected() {
        let messages = vec![Ok(WsMessage::Text(
            "CONNECTED\nversion:1.2\nheart-beat:4000,4000\n\n\0".to_string(),
        ))];
        let mut stream = futures_util::stream::iter(messages);
        let frame = await_connected(&mut stream).await.unwrap();
        assert_eq!(frame.header("heart-beat"), Some("4000,4000"));
    }

    #[tokio::test]
    async fn test_handshake_fails_when_socket_ends() {
        let mut stream = futures_util::stream::iter(Vec::<Result<WsMessage, WsError>>::new());
        assert!(matches!(
            await_connected(&mut stream).await,
            Err(TransportError::Connect(_))
        ));
    }
}
