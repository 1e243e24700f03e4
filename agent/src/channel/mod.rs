//! The control channel: one authenticated WebSocket connection to the
//! fleet server, kept alive across arbitrary network disruption.
//!
//! The manager owns the socket exclusively. Inbound frames are delivered
//! as [`ChannelEvent`]s; every other component sends by enqueueing onto
//! the bounded outbound queue behind [`ChannelHandle::send`], which the
//! manager's writer drains. Nothing is buffered across reconnects: on
//! loss the queue is drained and dropped, a fresh generation begins, and
//! consumers see a new `Connected` marker telling them to reset
//! per-session state.

use std::time::Duration;

use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use sentinel_core::backoff::Backoff;
use sentinel_core::frames::{kind, AuthPayload, AuthResponsePayload, Frame};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tokio::time::Instant;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

type WsSink = SplitSink<WebSocketStream<MaybeTlsStream<TcpStream>>, Message>;
type WsStream = SplitStream<WebSocketStream<MaybeTlsStream<TcpStream>>>;

/// Depth of the shared outbound queue. Overflow blocks the sender
/// (the dispatcher), never the manager's reader.
const OUTBOUND_QUEUE_DEPTH: usize = 256;

/// Depth of the inbound event queue toward the dispatcher.
const EVENT_QUEUE_DEPTH: usize = 256;

/// How long to wait for `auth_response` before treating the attempt as lost.
const AUTH_TIMEOUT: Duration = Duration::from_secs(10);

/// Connection lifecycle as observed by the rest of the agent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelState {
    Disconnected,
    Connecting,
    Authenticating,
    Connected,
    Reconnecting { attempt: u32, next_delay_ms: u64 },
    Stopped,
}

impl ChannelState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Disconnected => "disconnected",
            Self::Connecting => "connecting",
            Self::Authenticating => "authenticating",
            Self::Connected => "connected",
            Self::Reconnecting { .. } => "reconnecting",
            Self::Stopped => "stopped",
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ChannelError {
    /// Only the `Connected` state may send non-auth frames.
    #[error("control channel is not connected")]
    NotConnected,
}

/// What the manager delivers to its consumer.
#[derive(Debug)]
pub enum ChannelEvent {
    /// A connection reached `Connected`. A generation bump relative to the
    /// previous `Connected` is the reconnect marker: sessions and pending
    /// commands keyed to the old generation are gone.
    Connected {
        generation: u64,
        device_id: Option<String>,
    },
    /// One inbound frame, in wire order.
    Frame(Frame),
    /// The connection was lost; a reconnect attempt is scheduled.
    Reconnecting,
    /// The channel will not reconnect (fatal auth failure or `stop`).
    Stopped { reason: String },
}

/// Static parameters for the connect loop.
#[derive(Debug, Clone)]
pub struct ChannelConfig {
    pub server_url: String,
    pub auth: AuthPayload,
    pub heartbeat_interval: Duration,
}

struct Shared {
    state: watch::Sender<ChannelState>,
    outbound_tx: mpsc::Sender<Frame>,
    stop: CancellationToken,
}

/// Cloneable handle other components use to observe and send.
#[derive(Clone)]
pub struct ChannelHandle {
    shared: std::sync::Arc<Shared>,
}

impl ChannelHandle {
    pub fn state(&self) -> ChannelState {
        self.shared.state.borrow().clone()
    }

    /// Enqueue a frame for the wire. Fails unless the channel is
    /// `Connected`; blocks (async) when the bounded queue is full.
    pub async fn send(&self, frame: Frame) -> Result<(), ChannelError> {
        if self.state() != ChannelState::Connected {
            return Err(ChannelError::NotConnected);
        }
        self.shared
            .outbound_tx
            .send(frame)
            .await
            .map_err(|_| ChannelError::NotConnected)
    }

    /// Stop the channel permanently. Idempotent.
    pub fn stop(&self) {
        self.shared.stop.cancel();
    }
}

/// Start the connect loop. Idempotent in effect: one manager per agent,
/// constructed once at startup.
pub fn start(
    config: ChannelConfig,
    shutdown: CancellationToken,
) -> (ChannelHandle, mpsc::Receiver<ChannelEvent>) {
    let (state_tx, _state_rx) = watch::channel(ChannelState::Disconnected);
    let (outbound_tx, outbound_rx) = mpsc::channel(OUTBOUND_QUEUE_DEPTH);
    let (events_tx, events_rx) = mpsc::channel(EVENT_QUEUE_DEPTH);

    let shared = std::sync::Arc::new(Shared {
        state: state_tx,
        outbound_tx,
        stop: shutdown,
    });

    let handle = ChannelHandle {
        shared: shared.clone(),
    };

    tokio::spawn(run_channel(config, shared, events_tx, outbound_rx));

    (handle, events_rx)
}

/// Why one connection attempt ended.
enum ConnExit {
    /// Recoverable: schedule a reconnect.
    Lost(String),
    /// Unrecoverable: enrollment denied or version rejected.
    Fatal(String),
    /// The agent is shutting down.
    Shutdown,
}

async fn run_channel(
    config: ChannelConfig,
    shared: std::sync::Arc<Shared>,
    events_tx: mpsc::Sender<ChannelEvent>,
    mut outbound_rx: mpsc::Receiver<Frame>,
) {
    let mut backoff = Backoff::for_reconnect();
    let mut generation: u64 = 0;

    loop {
        if shared.stop.is_cancelled() {
            break;
        }

        shared.state.send_replace(ChannelState::Connecting);
        generation += 1;

        let exit = run_connection(
            &config,
            &shared,
            &events_tx,
            &mut outbound_rx,
            &mut backoff,
            generation,
        )
        .await;

        // No frame survives a connection; reject whatever queued meanwhile.
        while outbound_rx.try_recv().is_ok() {}

        match exit {
            ConnExit::Fatal(reason) => {
                warn!("Control channel stopped: {reason}");
                shared.state.send_replace(ChannelState::Stopped);
                let _ = events_tx.send(ChannelEvent::Stopped { reason }).await;
                return;
            }
            ConnExit::Shutdown => break,
            ConnExit::Lost(reason) => {
                let attempt = backoff.attempt();
                let delay = backoff.next_delay();
                info!(
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    "Connection lost ({reason}), reconnecting"
                );
                shared.state.send_replace(ChannelState::Reconnecting {
                    attempt,
                    next_delay_ms: delay.as_millis() as u64,
                });
                let _ = events_tx.send(ChannelEvent::Reconnecting).await;

                tokio::select! {
                    _ = shared.stop.cancelled() => break,
                    _ = tokio::time::sleep(delay) => {}
                }
            }
        }
    }

    shared.state.send_replace(ChannelState::Stopped);
    let _ = events_tx
        .send(ChannelEvent::Stopped {
            reason: "shutdown".into(),
        })
        .await;
}

async fn run_connection(
    config: &ChannelConfig,
    shared: &Shared,
    events_tx: &mpsc::Sender<ChannelEvent>,
    outbound_rx: &mut mpsc::Receiver<Frame>,
    backoff: &mut Backoff,
    generation: u64,
) -> ConnExit {
    let connect = tokio::select! {
        _ = shared.stop.cancelled() => return ConnExit::Shutdown,
        result = connect_async(config.server_url.as_str()) => result,
    };
    let (ws, _response) = match connect {
        Ok(ok) => ok,
        Err(e) => return ConnExit::Lost(format!("connect failed: {e}")),
    };
    let (mut sink, mut stream) = ws.split();

    shared.state.send_replace(ChannelState::Authenticating);

    let auth_payload = match serde_json::to_value(&config.auth) {
        Ok(value) => value,
        Err(e) => return ConnExit::Fatal(format!("auth payload unserializable: {e}")),
    };
    if let Err(e) = send_frame(&mut sink, &Frame::new(kind::AUTH, auth_payload)).await {
        return ConnExit::Lost(format!("auth send failed: {e}"));
    }

    let device_id = match authenticate(shared, &mut stream).await {
        Ok(device_id) => device_id,
        Err(exit) => return exit,
    };

    shared.state.send_replace(ChannelState::Connected);
    backoff.reset();
    info!(generation, "Control channel connected");
    if events_tx
        .send(ChannelEvent::Connected {
            generation,
            device_id,
        })
        .await
        .is_err()
    {
        return ConnExit::Shutdown;
    }

    serve_connection(config, shared, events_tx, outbound_rx, sink, stream).await
}

/// Wait for the server's `auth_response`; anything else is a lost
/// connection, an explicit denial is fatal.
async fn authenticate(shared: &Shared, stream: &mut WsStream) -> Result<Option<String>, ConnExit> {
    let first = tokio::select! {
        _ = shared.stop.cancelled() => return Err(ConnExit::Shutdown),
        result = tokio::time::timeout(AUTH_TIMEOUT, next_frame(stream)) => result,
    };

    let frame = match first {
        Err(_) => return Err(ConnExit::Lost("auth_response timeout".into())),
        Ok(Err(reason)) => return Err(ConnExit::Lost(reason)),
        Ok(Ok(frame)) => frame,
    };

    if frame.kind != kind::AUTH_RESPONSE {
        return Err(ConnExit::Lost(format!(
            "expected auth_response, got {}",
            frame.kind
        )));
    }

    let response: AuthResponsePayload = match frame.decode() {
        Ok(response) => response,
        Err(e) => return Err(ConnExit::Lost(e.to_string())),
    };

    if !response.accepted {
        let reason = response
            .error
            .unwrap_or_else(|| "enrollment rejected".to_string());
        return Err(ConnExit::Fatal(format!("enrollment failed: {reason}")));
    }

    Ok(response.device_id)
}

/// The connected steady state: forward inbound frames, drain the outbound
/// queue, heartbeat on schedule, and declare the link dead after `3·H`
/// without any inbound frame.
async fn serve_connection(
    config: &ChannelConfig,
    shared: &Shared,
    events_tx: &mpsc::Sender<ChannelEvent>,
    outbound_rx: &mut mpsc::Receiver<Frame>,
    mut sink: WsSink,
    mut stream: WsStream,
) -> ConnExit {
    let heartbeat_interval = config.heartbeat_interval;
    let idle_limit = heartbeat_interval * 3;

    let mut heartbeat = tokio::time::interval_at(
        Instant::now() + heartbeat_interval,
        heartbeat_interval,
    );
    heartbeat.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    let idle = tokio::time::sleep(idle_limit);
    tokio::pin!(idle);

    loop {
        tokio::select! {
            _ = shared.stop.cancelled() => {
                let _ = sink.send(Message::Close(None)).await;
                return ConnExit::Shutdown;
            }

            () = &mut idle => {
                return ConnExit::Lost(format!(
                    "no inbound frame within {}s",
                    idle_limit.as_secs()
                ));
            }

            _ = heartbeat.tick() => {
                let frame = Frame::new(kind::HEARTBEAT, serde_json::json!({}));
                if let Err(e) = send_frame(&mut sink, &frame).await {
                    return ConnExit::Lost(format!("heartbeat send failed: {e}"));
                }
            }

            outbound = outbound_rx.recv() => {
                let Some(frame) = outbound else {
                    return ConnExit::Shutdown;
                };
                if let Err(e) = send_frame(&mut sink, &frame).await {
                    return ConnExit::Lost(format!("send failed: {e}"));
                }
            }

            inbound = stream.next() => {
                let message = match inbound {
                    None => return ConnExit::Lost("connection closed by server".into()),
                    Some(Err(e)) => return ConnExit::Lost(format!("read error: {e}")),
                    Some(Ok(message)) => message,
                };

                idle.as_mut().reset(Instant::now() + idle_limit);

                match message {
                    Message::Text(text) => match serde_json::from_str::<Frame>(text.as_str()) {
                        Ok(frame) if frame.kind == kind::HEARTBEAT_ACK => {}
                        Ok(frame) => {
                            if events_tx.send(ChannelEvent::Frame(frame)).await.is_err() {
                                return ConnExit::Shutdown;
                            }
                        }
                        // Malformed frame: discard, keep the connection.
                        Err(e) => warn!("Discarding malformed frame: {e}"),
                    },
                    Message::Close(_) => {
                        return ConnExit::Lost("server closed the connection".into());
                    }
                    Message::Ping(_) | Message::Pong(_) => {}
                    other => debug!("Ignoring non-text frame: {other:?}"),
                }
            }
        }
    }
}

async fn next_frame(stream: &mut WsStream) -> Result<Frame, String> {
    loop {
        match stream.next().await {
            None => return Err("connection closed during auth".into()),
            Some(Err(e)) => return Err(format!("read error during auth: {e}")),
            Some(Ok(Message::Text(text))) => {
                match serde_json::from_str::<Frame>(text.as_str()) {
                    Ok(frame) => return Ok(frame),
                    Err(e) => return Err(format!("malformed auth_response: {e}")),
                }
            }
            Some(Ok(Message::Close(_))) => return Err("closed during auth".into()),
            Some(Ok(_)) => continue,
        }
    }
}

async fn send_frame(sink: &mut WsSink, frame: &Frame) -> Result<(), String> {
    let text = serde_json::to_string(frame).map_err(|e| e.to_string())?;
    sink.send(Message::text(text)).await.map_err(|e| e.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tokio::net::TcpListener;
    use tokio_tungstenite::accept_async;

    fn test_config(url: String) -> ChannelConfig {
        ChannelConfig {
            server_url: url,
            auth: AuthPayload {
                agent_id: "00000000-0000-0000-0000-000000000001".into(),
                enrollment_token: "TK".into(),
                version: "1.0.0".into(),
                hostname: "test-host".into(),
                os_type: "linux".into(),
            },
            heartbeat_interval: Duration::from_millis(200),
        }
    }

    /// A single-connection fake server that answers auth and hands the
    /// socket to the test body.
    async fn fake_server<F, Fut>(accepted: bool, body: F) -> String
    where
        F: FnOnce(WebSocketStream<TcpStream>) -> Fut + Send + 'static,
        Fut: std::future::Future<Output = ()> + Send,
    {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (tcp, _) = listener.accept().await.unwrap();
            let mut ws = accept_async(tcp).await.unwrap();

            // Expect the auth frame first.
            let auth = ws.next().await.unwrap().unwrap();
            let frame: Frame = serde_json::from_str(auth.to_text().unwrap()).unwrap();
            assert_eq!(frame.kind, kind::AUTH);
            let payload: AuthPayload = frame.decode().unwrap();
            assert_eq!(payload.enrollment_token, "TK");

            let body_json = if accepted {
                json!({"accepted": true, "device_id": "D1"})
            } else {
                json!({"accepted": false, "error": "enrollment token denied"})
            };
            let response = Frame::new(kind::AUTH_RESPONSE, body_json);
            ws.send(Message::text(serde_json::to_string(&response).unwrap()))
                .await
                .unwrap();

            body(ws).await;
        });
        format!("ws://{addr}")
    }

    #[tokio::test]
    async fn happy_connect_reaches_connected() {
        let url = fake_server(true, |mut ws| async move {
            // Keep the connection open until the client hangs up.
            while ws.next().await.is_some() {}
        })
        .await;

        let shutdown = CancellationToken::new();
        let (handle, mut events) = start(test_config(url), shutdown.clone());

        match tokio::time::timeout(Duration::from_secs(5), events.recv())
            .await
            .unwrap()
            .unwrap()
        {
            ChannelEvent::Connected {
                generation,
                device_id,
            } => {
                assert_eq!(generation, 1);
                assert_eq!(device_id.as_deref(), Some("D1"));
            }
            other => panic!("expected Connected, got {other:?}"),
        }
        assert_eq!(handle.state(), ChannelState::Connected);
        shutdown.cancel();
    }

    #[tokio::test]
    async fn denial_is_fatal() {
        let url = fake_server(false, |_ws| async move {}).await;

        let shutdown = CancellationToken::new();
        let (handle, mut events) = start(test_config(url), shutdown.clone());

        match tokio::time::timeout(Duration::from_secs(5), events.recv())
            .await
            .unwrap()
            .unwrap()
        {
            ChannelEvent::Stopped { reason } => assert!(reason.contains("denied")),
            other => panic!("expected Stopped, got {other:?}"),
        }
        assert_eq!(handle.state(), ChannelState::Stopped);
    }

    #[tokio::test]
    async fn inbound_frames_are_delivered() {
        let url = fake_server(true, |mut ws| async move {
            let frame = Frame::new(
                kind::EXECUTE_COMMAND,
                json!({"command_id": "c-1", "command": "uptime"}),
            );
            ws.send(Message::text(serde_json::to_string(&frame).unwrap()))
                .await
                .unwrap();
            while ws.next().await.is_some() {}
        })
        .await;

        let shutdown = CancellationToken::new();
        let (_handle, mut events) = start(test_config(url), shutdown.clone());

        let mut saw_command = false;
        for _ in 0..2 {
            match tokio::time::timeout(Duration::from_secs(5), events.recv())
                .await
                .unwrap()
                .unwrap()
            {
                ChannelEvent::Connected { .. } => {}
                ChannelEvent::Frame(frame) => {
                    assert_eq!(frame.kind, kind::EXECUTE_COMMAND);
                    saw_command = true;
                    break;
                }
                other => panic!("unexpected event {other:?}"),
            }
        }
        assert!(saw_command);
        shutdown.cancel();
    }

    #[tokio::test]
    async fn send_fails_when_not_connected() {
        let shutdown = CancellationToken::new();
        // Nothing listens on this port; the channel stays in backoff.
        let (handle, _events) = start(
            test_config("ws://127.0.0.1:9".into()),
            shutdown.clone(),
        );
        tokio::time::sleep(Duration::from_millis(50)).await;
        let result = handle
            .send(Frame::new(kind::HEARTBEAT, json!({})))
            .await;
        assert!(matches!(result, Err(ChannelError::NotConnected)));
        shutdown.cancel();
    }

    #[tokio::test]
    async fn outbound_frames_reach_the_server() {
        let (seen_tx, seen_rx) = tokio::sync::oneshot::channel();
        let url = fake_server(true, |mut ws| async move {
            let mut seen_tx = Some(seen_tx);
            while let Some(Ok(message)) = ws.next().await {
                if let Message::Text(text) = message {
                    let frame: Frame = serde_json::from_str(text.as_str()).unwrap();
                    if frame.kind == kind::METRICS {
                        if let Some(tx) = seen_tx.take() {
                            let _ = tx.send(frame);
                        }
                    }
                }
            }
        })
        .await;

        let shutdown = CancellationToken::new();
        let (handle, mut events) = start(test_config(url), shutdown.clone());

        // Wait for Connected before sending.
        match tokio::time::timeout(Duration::from_secs(5), events.recv())
            .await
            .unwrap()
            .unwrap()
        {
            ChannelEvent::Connected { .. } => {}
            other => panic!("unexpected event {other:?}"),
        }

        handle
            .send(Frame::new(kind::METRICS, json!({"cpu_percent": 1.0})))
            .await
            .unwrap();

        let frame = tokio::time::timeout(Duration::from_secs(5), seen_rx)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(frame.kind, kind::METRICS);
        shutdown.cancel();
    }
}
