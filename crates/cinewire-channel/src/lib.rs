//! Session channel manager.
//!
//! Owns the one logical WebSocket connection to the remote director service
//! and keeps it alive across transient disconnects: every close schedules
//! exactly one reconnect attempt after a fixed delay, indefinitely, until an
//! explicit `disconnect()`. Inbound frames are parsed into typed
//! [`SessionEvent`]s; parse failures are dropped with a warning and are never
//! fatal. Outbound messages transmit only while connected and are otherwise
//! dropped without queueing.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch, Mutex};
use tokio::time::sleep;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tokio_util::sync::CancellationToken;
use url::Url;

use cinewire_schema::{ClientMessage, SessionEvent};

pub const WS_PATH: &str = "/ws/session";
pub const RECONNECT_DELAY: Duration = Duration::from_millis(2500);
const DEFAULT_ENDPOINT: &str = "ws://127.0.0.1:8000/ws/session";
const OUTBOUND_BUFFER: usize = 64;

#[derive(Debug, thiserror::Error)]
pub enum ChannelError {
    #[error("invalid session base url `{0}`")]
    InvalidBaseUrl(String),
    #[error("unsupported session url scheme `{0}`")]
    UnsupportedScheme(String),
}

/// Derive the session endpoint. An explicit base URL takes precedence, with
/// its scheme mapped onto the WebSocket equivalent (https becomes wss);
/// otherwise the same-origin default is used.
pub fn session_endpoint(base_url: Option<&str>) -> Result<Url, ChannelError> {
    let Some(base) = base_url else {
        return Url::parse(DEFAULT_ENDPOINT)
            .map_err(|_| ChannelError::InvalidBaseUrl(DEFAULT_ENDPOINT.into()));
    };

    let mut url = Url::parse(base).map_err(|_| ChannelError::InvalidBaseUrl(base.into()))?;
    let scheme = match url.scheme() {
        "http" | "ws" => "ws",
        "https" | "wss" => "wss",
        other => return Err(ChannelError::UnsupportedScheme(other.into())),
    };
    url.set_scheme(scheme)
        .map_err(|_| ChannelError::InvalidBaseUrl(base.into()))?;
    url.set_path(WS_PATH);
    url.set_query(None);
    url.set_fragment(None);
    Ok(url)
}

/// Handle to the persistent session channel. Cheap to clone.
#[derive(Clone)]
pub struct SessionChannel {
    inner: Arc<ChannelInner>,
}

struct ChannelInner {
    endpoint: Url,
    reconnect_delay: Duration,
    events_tx: mpsc::Sender<SessionEvent>,
    outbound_tx: mpsc::Sender<ClientMessage>,
    outbound_rx: Mutex<Option<mpsc::Receiver<ClientMessage>>>,
    connected_tx: watch::Sender<bool>,
    connecting: AtomicBool,
    shutdown: CancellationToken,
}

impl SessionChannel {
    /// Build a channel that will deliver parsed events on `events_tx`. The
    /// channel is not opened until [`connect`](Self::connect) is called.
    pub fn new(endpoint: Url, events_tx: mpsc::Sender<SessionEvent>) -> Self {
        Self::with_reconnect_delay(endpoint, events_tx, RECONNECT_DELAY)
    }

    pub fn with_reconnect_delay(
        endpoint: Url,
        events_tx: mpsc::Sender<SessionEvent>,
        reconnect_delay: Duration,
    ) -> Self {
        let (outbound_tx, outbound_rx) = mpsc::channel(OUTBOUND_BUFFER);
        let (connected_tx, _) = watch::channel(false);
        Self {
            inner: Arc::new(ChannelInner {
                endpoint,
                reconnect_delay,
                events_tx,
                outbound_tx,
                outbound_rx: Mutex::new(Some(outbound_rx)),
                connected_tx,
                connecting: AtomicBool::new(false),
                shutdown: CancellationToken::new(),
            }),
        }
    }

    /// Open the channel. Idempotent: a second call while an attempt is in
    /// flight is a no-op.
    pub async fn connect(&self) {
        if self.inner.connecting.swap(true, Ordering::SeqCst) {
            tracing::debug!("session channel connect already in flight");
            return;
        }
        let Some(outbound_rx) = self.inner.outbound_rx.lock().await.take() else {
            // Receiver already claimed by a previous lifecycle; nothing to do.
            return;
        };
        let inner = self.inner.clone();
        tokio::spawn(async move {
            run_channel(inner, outbound_rx).await;
        });
    }

    /// Tear down the active connection and cancel any pending reconnect.
    pub fn disconnect(&self) {
        self.inner.shutdown.cancel();
        let _ = self.inner.connected_tx.send(false);
    }

    /// Transmit only while connected; otherwise the message is dropped
    /// (outbound messages are not queued or retried).
    pub fn send(&self, msg: ClientMessage) {
        if !self.is_connected() {
            tracing::debug!("session channel not connected, dropping outbound message");
            return;
        }
        if self.inner.outbound_tx.try_send(msg).is_err() {
            tracing::warn!("session channel outbound buffer full, dropping message");
        }
    }

    pub fn is_connected(&self) -> bool {
        *self.inner.connected_tx.borrow()
    }

    pub fn connected_watch(&self) -> watch::Receiver<bool> {
        self.inner.connected_tx.subscribe()
    }
}

async fn run_channel(inner: Arc<ChannelInner>, mut outbound_rx: mpsc::Receiver<ClientMessage>) {
    loop {
        if inner.shutdown.is_cancelled() {
            break;
        }
        let attempt = tokio::select! {
            _ = inner.shutdown.cancelled() => break,
            result = connect_async(inner.endpoint.as_str()) => result,
        };
        match attempt {
            Ok((socket, _)) => {
                tracing::info!(endpoint = %inner.endpoint, "session channel connected");
                let _ = inner.connected_tx.send(true);
                drive_socket(&inner, socket, &mut outbound_rx).await;
                let _ = inner.connected_tx.send(false);
                tracing::info!("session channel closed");
            }
            Err(err) => {
                tracing::warn!(error = %err, "session channel connect failed");
            }
        }
        // One reconnect attempt after a fixed delay, repeated indefinitely
        // until disconnect() cancels it.
        tokio::select! {
            _ = inner.shutdown.cancelled() => break,
            _ = sleep(inner.reconnect_delay) => {}
        }
    }
    tracing::debug!("session channel task exiting");
}

async fn drive_socket(
    inner: &ChannelInner,
    socket: WebSocketStream<MaybeTlsStream<TcpStream>>,
    outbound_rx: &mut mpsc::Receiver<ClientMessage>,
) {
    let (mut sink, mut stream) = socket.split();
    loop {
        tokio::select! {
            _ = inner.shutdown.cancelled() => {
                let _ = sink.close().await;
                return;
            }
            maybe_out = outbound_rx.recv() => {
                let Some(msg) = maybe_out else { return };
                let json = match serde_json::to_string(&msg) {
                    Ok(json) => json,
                    Err(err) => {
                        tracing::warn!(error = %err, "failed to encode outbound message");
                        continue;
                    }
                };
                if sink.send(Message::text(json)).await.is_err() {
                    return;
                }
            }
            maybe_in = stream.next() => {
                match maybe_in {
                    Some(Ok(Message::Text(text))) => dispatch(inner, text.as_str()).await,
                    Some(Ok(Message::Close(_))) | None => return,
                    Some(Ok(_)) => {} // ping/pong/binary: nothing to do
                    Some(Err(err)) => {
                        tracing::warn!(error = %err, "session channel read error");
                        return;
                    }
                }
            }
        }
    }
}

async fn dispatch(inner: &ChannelInner, text: &str) {
    match serde_json::from_str::<SessionEvent>(text) {
        Ok(event) => {
            if inner.events_tx.send(event).await.is_err() {
                tracing::debug!("session event receiver dropped");
            }
        }
        Err(err) => {
            tracing::warn!(error = %err, "unparseable session message dropped");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cinewire_schema::{Emotion, EmotionReading};
    use tokio::net::TcpListener;
    use tokio::time::{timeout, Duration};

    #[test]
    fn endpoint_defaults_to_same_origin() {
        let url = session_endpoint(None).unwrap();
        assert_eq!(url.as_str(), "ws://127.0.0.1:8000/ws/session");
    }

    #[test]
    fn endpoint_upgrades_https_to_wss() {
        let url = session_endpoint(Some("https://director.example.com")).unwrap();
        assert_eq!(url.as_str(), "wss://director.example.com/ws/session");
    }

    #[test]
    fn endpoint_maps_http_to_ws_and_keeps_port() {
        let url = session_endpoint(Some("http://localhost:9000")).unwrap();
        assert_eq!(url.as_str(), "ws://localhost:9000/ws/session");
    }

    #[test]
    fn endpoint_rejects_unknown_scheme() {
        let err = session_endpoint(Some("ftp://example.com")).unwrap_err();
        assert!(matches!(err, ChannelError::UnsupportedScheme(_)));
    }

    #[test]
    fn send_while_disconnected_drops_silently() {
        let (events_tx, _events_rx) = mpsc::channel(8);
        let channel = SessionChannel::new(session_endpoint(None).unwrap(), events_tx);
        assert!(!channel.is_connected());
        channel.send(ClientMessage::Reset);
    }

    /// Minimal director stand-in: accepts connections, records client
    /// messages, and can push raw frames.
    async fn spawn_server(listener: TcpListener, scripts: Vec<Vec<&'static str>>) {
        tokio::spawn(async move {
            for script in scripts {
                let Ok((stream, _)) = listener.accept().await else {
                    return;
                };
                let Ok(mut ws) = tokio_tungstenite::accept_async(stream).await else {
                    return;
                };
                for raw in script {
                    if ws.send(Message::text(raw.to_string())).await.is_err() {
                        return;
                    }
                }
                let _ = ws.close(None).await;
            }
        });
    }

    fn local_endpoint(addr: std::net::SocketAddr) -> Url {
        session_endpoint(Some(&format!("http://{addr}"))).unwrap()
    }

    #[tokio::test]
    async fn delivers_typed_events_and_drops_malformed() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        spawn_server(
            listener,
            vec![vec![
                "{not json",
                r#"{"type":"unknown_event"}"#,
                r#"{"type":"deciding"}"#,
            ]],
        )
        .await;

        let (events_tx, mut events_rx) = mpsc::channel(8);
        let channel = SessionChannel::with_reconnect_delay(
            local_endpoint(addr),
            events_tx,
            Duration::from_millis(50),
        );
        channel.connect().await;

        let event = timeout(Duration::from_secs(2), events_rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(event, SessionEvent::Deciding);
        channel.disconnect();
    }

    #[tokio::test]
    async fn reconnects_after_close_until_disconnect() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        spawn_server(
            listener,
            vec![
                vec![r#"{"type":"deciding"}"#],
                vec![r#"{"type":"error","message":"second life"}"#],
            ],
        )
        .await;

        let (events_tx, mut events_rx) = mpsc::channel(8);
        let channel = SessionChannel::with_reconnect_delay(
            local_endpoint(addr),
            events_tx,
            Duration::from_millis(50),
        );
        let mut connected = channel.connected_watch();
        channel.connect().await;

        let first = timeout(Duration::from_secs(2), events_rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(first, SessionEvent::Deciding);

        // The peer closes; the channel must come back on its own.
        let second = timeout(Duration::from_secs(2), events_rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(
            second,
            SessionEvent::Error {
                message: "second life".into()
            }
        );

        channel.disconnect();
        timeout(Duration::from_secs(2), async {
            while *connected.borrow_and_update() {
                connected.changed().await.unwrap();
            }
        })
        .await
        .unwrap();
        assert!(!channel.is_connected());
    }

    #[tokio::test]
    async fn connect_is_idempotent() {
        let (events_tx, _events_rx) = mpsc::channel(8);
        let channel = SessionChannel::with_reconnect_delay(
            session_endpoint(Some("http://127.0.0.1:1")).unwrap(),
            events_tx,
            Duration::from_millis(20),
        );
        channel.connect().await;
        channel.connect().await;
        channel.disconnect();
    }

    #[tokio::test]
    async fn outbound_reaches_the_peer() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (seen_tx, mut seen_rx) = mpsc::channel::<String>(8);
        tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let mut ws = tokio_tungstenite::accept_async(stream).await.unwrap();
            while let Some(Ok(Message::Text(text))) = ws.next().await {
                let _ = seen_tx.send(text.to_string()).await;
            }
        });

        let (events_tx, _events_rx) = mpsc::channel(8);
        let channel = SessionChannel::with_reconnect_delay(
            local_endpoint(addr),
            events_tx,
            Duration::from_millis(50),
        );
        let mut connected = channel.connected_watch();
        channel.connect().await;
        timeout(Duration::from_secs(2), async {
            while !*connected.borrow_and_update() {
                connected.changed().await.unwrap();
            }
        })
        .await
        .unwrap();

        channel.send(ClientMessage::Emotion {
            data: EmotionReading {
                primary_emotion: Emotion::Engaged,
                intensity: 9,
                attention: cinewire_schema::Attention::Screen,
                confidence: 0.9,
                timestamp: None,
            },
        });

        let raw = timeout(Duration::from_secs(2), seen_rx.recv())
            .await
            .unwrap()
            .unwrap();
        let parsed: ClientMessage = serde_json::from_str(&raw).unwrap();
        assert!(matches!(parsed, ClientMessage::Emotion { .. }));
        channel.disconnect();
    }
}
