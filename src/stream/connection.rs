// One websocket per endpoint URL: read/write/heartbeat loop plus reconnects
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use rand::Rng;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tokio::time::Instant;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::{HeaderName, HeaderValue};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, instrument, trace, warn};

use crate::error::StreamError;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Closed,
    Connecting,
    Open,
    Reconnecting,
    Closing,
}

/// Receives everything the connection task observes. Calls are made from the
/// connection task, one at a time, in wire order.
pub trait FrameHandler: Send + Sync + 'static {
    /// Frames to write before anything queued by callers. `reconnected` is
    /// false on the first open.
    fn on_open(&self, reconnected: bool) -> Vec<String>;

    fn on_frame(&self, text: &str);

    /// The socket went away. `will_retry` tells whether a reconnect follows.
    fn on_drop(&self, error: &StreamError, will_retry: bool);

    /// Terminal. `None` for a requested close.
    fn on_closed(&self, error: Option<&StreamError>);
}

#[derive(Debug)]
pub enum Outbound {
    Frame(String),
    Close,
}

#[derive(Debug, Clone)]
pub struct ReconnectPolicy {
    pub max_attempts: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
    /// Upper bound on the whole reconnect cycle.
    pub reconnect_timeout: Duration,
}

impl ReconnectPolicy {
    /// Exponential backoff for the n-th failed attempt (1-based) plus up to 25% jitter.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let exp = self.initial_backoff.saturating_mul(1u32 << attempt.saturating_sub(1).min(16));
        let base = exp.min(self.max_backoff);
        let jitter_ms = (base.as_millis() as u64) / 4;
        let jitter = if jitter_ms == 0 { 0 } else { rand::thread_rng().gen_range(0..=jitter_ms) };
        base + Duration::from_millis(jitter)
    }
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 10,
            initial_backoff: Duration::from_millis(250),
            max_backoff: Duration::from_secs(10),
            reconnect_timeout: Duration::from_secs(60),
        }
    }
}

#[derive(Debug, Clone)]
pub struct HeartbeatPolicy {
    pub ping_interval: Duration,
    pub pong_timeout: Duration,
}

#[derive(Debug, Clone)]
pub struct ConnectionSettings {
    pub connect_timeout: Duration,
    /// `None` rejects every pending request on the first drop.
    pub reconnect: Option<ReconnectPolicy>,
    pub heartbeat: Option<HeartbeatPolicy>,
}

impl Default for ConnectionSettings {
    fn default() -> Self {
        Self { connect_timeout: Duration::from_secs(10), reconnect: None, heartbeat: None }
    }
}

impl ConnectionSettings {
    /// Zero durations would spin or panic inside the connection task.
    pub fn validate(&self) -> Result<(), StreamError> {
        if self.connect_timeout.is_zero() {
            return Err(StreamError::Config("connect timeout must be positive".into()));
        }
        if let Some(policy) = &self.reconnect {
            if policy.max_attempts == 0 {
                return Err(StreamError::Config("reconnect max_attempts must be at least 1".into()));
            }
        }
        if let Some(heartbeat) = &self.heartbeat {
            if heartbeat.ping_interval.is_zero() || heartbeat.pong_timeout.is_zero() {
                return Err(StreamError::Config("heartbeat ping interval and pong timeout must be positive".into()));
            }
        }
        Ok(())
    }
}

/// Caller side of a connection. Cheap to clone; sending never blocks.
#[derive(Debug, Clone)]
pub struct ConnectionHandle {
    url: String,
    tx: mpsc::UnboundedSender<Outbound>,
    state: watch::Receiver<ConnectionState>,
}

impl ConnectionHandle {
    pub fn url(&self) -> &str {
        &self.url
    }

    /// Queue a frame. Written immediately when open, after replay when reconnecting.
    pub fn send(&self, frame: String) -> Result<(), StreamError> {
        self.tx.send(Outbound::Frame(frame)).map_err(|_| StreamError::Closed)
    }

    pub fn close(&self) {
        let _ = self.tx.send(Outbound::Close);
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    pub fn is_closed(&self) -> bool {
        self.state() == ConnectionState::Closed || self.tx.is_closed()
    }

    /// Resolves once the connection reaches `target` (or closes for good).
    pub async fn wait_for(&self, target: ConnectionState) -> ConnectionState {
        let mut rx = self.state.clone();
        let reached = match rx.wait_for(|s| *s == target || *s == ConnectionState::Closed).await {
            Ok(state) => *state,
            Err(_) => ConnectionState::Closed,
        };
        reached
    }

    /// Handle with no task behind it; outbound frames land on the returned receiver.
    pub fn detached(url: &str) -> (Self, mpsc::UnboundedReceiver<Outbound>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let (_state_tx, state) = watch::channel(ConnectionState::Open);
        (Self { url: url.to_string(), tx, state }, rx)
    }
}

pub struct StreamConnection {
    url: String,
    headers: Vec<(String, String)>,
    settings: ConnectionSettings,
    handler: Arc<dyn FrameHandler>,
    rx: mpsc::UnboundedReceiver<Outbound>,
    state: watch::Sender<ConnectionState>,
    backlog: VecDeque<String>,
}

enum PumpExit {
    Requested,
    Dropped(StreamError),
}

impl StreamConnection {
    /// Spawn the connection task on the current runtime.
    pub fn spawn(
        url: &str,
        headers: Vec<(String, String)>,
        settings: ConnectionSettings,
        handler: Arc<dyn FrameHandler>,
    ) -> ConnectionHandle {
        let (tx, rx) = mpsc::unbounded_channel();
        let (state_tx, state_rx) = watch::channel(ConnectionState::Connecting);
        let conn = StreamConnection {
            url: url.to_string(),
            headers,
            settings,
            handler,
            rx,
            state: state_tx,
            backlog: VecDeque::new(),
        };
        tokio::spawn(conn.run());
        ConnectionHandle { url: url.to_string(), tx, state: state_rx }
    }

    #[instrument(name = "stream_connection", skip_all, fields(url = %self.url))]
    async fn run(mut self) {
        if let Err(e) = self.settings.validate() {
            return self.finish(Some(e));
        }
        let mut reconnected = false;
        loop {
            let ws = match self.establish(reconnected).await {
                Ok(Some(ws)) => ws,
                Ok(None) => return self.finish(None),
                Err(e) => return self.finish(Some(e)),
            };
            self.state.send_replace(ConnectionState::Open);
            metrics::gauge!("mdsync_up").set(1.0);
            info!(reconnected, "Connected");

            let replay = self.handler.on_open(reconnected);
            match self.pump(ws, replay).await {
                PumpExit::Requested => return self.finish(None),
                PumpExit::Dropped(err) => {
                    metrics::gauge!("mdsync_up").set(0.0);
                    let will_retry = self.settings.reconnect.is_some();
                    warn!(error = %err, will_retry, "Connection dropped");
                    self.handler.on_drop(&err, will_retry);
                    if !will_retry {
                        return self.finish(Some(err));
                    }
                    metrics::counter!("mdsync_reconnects_total").increment(1);
                    reconnected = true;
                }
            }
        }
    }

    fn finish(&mut self, error: Option<StreamError>) {
        metrics::gauge!("mdsync_up").set(0.0);
        match &error {
            Some(e) => warn!(error = %e, "Connection closed"),
            None => info!("Connection closed"),
        }
        // handler runs first so observers of `Closed` see its effects
        self.handler.on_closed(error.as_ref());
        self.state.send_replace(ConnectionState::Closed);
    }

    /// One attempt without a policy; bounded retries with one. `Ok(None)` means
    /// a close was requested while waiting.
    async fn establish(&mut self, reconnected: bool) -> Result<Option<WsStream>, StreamError> {
        let phase = if reconnected { ConnectionState::Reconnecting } else { ConnectionState::Connecting };
        self.state.send_replace(phase);

        let Some(policy) = self.settings.reconnect.clone() else {
            return connect(&self.url, &self.headers, self.settings.connect_timeout).await.map(Some);
        };

        let started = Instant::now();
        let mut attempt = 0u32;
        loop {
            attempt += 1;
            match connect(&self.url, &self.headers, self.settings.connect_timeout).await {
                Ok(ws) => return Ok(Some(ws)),
                Err(e) => {
                    let elapsed = started.elapsed();
                    if attempt >= policy.max_attempts || elapsed >= policy.reconnect_timeout {
                        return Err(StreamError::RetryExhausted { url: self.url.clone(), attempts: attempt });
                    }
                    let delay = policy.backoff(attempt).min(policy.reconnect_timeout - elapsed);
                    debug!(attempt, error = %e, delay_ms = delay.as_millis() as u64, "Connect failed, backing off");
                    if !self.hold(delay).await {
                        return Ok(None);
                    }
                }
            }
        }
    }

    /// Sleep while buffering caller frames. Returns false if a close arrived.
    async fn hold(&mut self, delay: Duration) -> bool {
        let sleep = tokio::time::sleep(delay);
        tokio::pin!(sleep);
        loop {
            tokio::select! {
                _ = &mut sleep => return true,
                out = self.rx.recv() => match out {
                    Some(Outbound::Frame(frame)) => self.backlog.push_back(frame),
                    Some(Outbound::Close) | None => return false,
                },
            }
        }
    }

    async fn pump(&mut self, ws: WsStream, replay: Vec<String>) -> PumpExit {
        let (mut write, mut read) = ws.split();

        let queued: Vec<String> = replay.into_iter().chain(self.backlog.drain(..)).collect();
        for frame in queued {
            if let Err(e) = write.send(Message::Text(frame)).await {
                return PumpExit::Dropped(StreamError::network(self.url.as_str(), e));
            }
        }

        let heartbeat = self.settings.heartbeat.clone();
        let period = heartbeat.as_ref().map_or(Duration::from_secs(3600), |h| h.ping_interval);
        let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
        let mut pong_deadline: Option<Instant> = None;

        loop {
            tokio::select! {
                msg = read.next() => match msg {
                    Some(Ok(Message::Text(text))) => self.deliver(&text),
                    Some(Ok(Message::Binary(bytes))) => match std::str::from_utf8(&bytes) {
                        Ok(text) => self.deliver(text),
                        Err(_) => {
                            debug!(len = bytes.len(), "Dropping non-utf8 binary frame");
                            metrics::counter!("mdsync_frames_dropped_total").increment(1);
                        }
                    },
                    Some(Ok(Message::Pong(_))) => {
                        trace!("pong");
                        pong_deadline = None;
                    }
                    // tungstenite answers pings on its own
                    Some(Ok(Message::Ping(_))) | Some(Ok(Message::Frame(_))) => {}
                    Some(Ok(Message::Close(frame))) => {
                        let reason = frame.map_or_else(|| "closed by peer".to_string(), |f| f.reason.to_string());
                        return PumpExit::Dropped(StreamError::network(self.url.as_str(), reason));
                    }
                    Some(Err(e)) => return PumpExit::Dropped(StreamError::network(self.url.as_str(), e)),
                    None => return PumpExit::Dropped(StreamError::network(self.url.as_str(), "stream ended")),
                },
                out = self.rx.recv() => match out {
                    Some(Outbound::Frame(frame)) => {
                        trace!(frame = %frame, "send");
                        if let Err(e) = write.send(Message::Text(frame)).await {
                            return PumpExit::Dropped(StreamError::network(self.url.as_str(), e));
                        }
                    }
                    Some(Outbound::Close) | None => {
                        self.state.send_replace(ConnectionState::Closing);
                        let _ = write.send(Message::Close(None)).await;
                        return PumpExit::Requested;
                    }
                },
                _ = tokio::time::sleep_until(pong_deadline.unwrap_or_else(Instant::now)), if pong_deadline.is_some() => {
                    return PumpExit::Dropped(StreamError::network(self.url.as_str(), "pong timeout"));
                }
                _ = ticker.tick(), if heartbeat.is_some() => {
                    // one ping in flight at a time
                    if pong_deadline.is_none() {
                        if let Err(e) = write.send(Message::Ping(Vec::new())).await {
                            return PumpExit::Dropped(StreamError::network(self.url.as_str(), e));
                        }
                        let pong_timeout = heartbeat.as_ref().map_or(period, |h| h.pong_timeout);
                        pong_deadline = Some(Instant::now() + pong_timeout);
                    }
                }
            }
        }
    }

    fn deliver(&self, text: &str) {
        metrics::counter!("mdsync_frames_total").increment(1);
        self.handler.on_frame(text);
    }
}

async fn connect(url: &str, headers: &[(String, String)], timeout: Duration) -> Result<WsStream, StreamError> {
    let mut request = url.into_client_request().map_err(|e| StreamError::network(url, e))?;
    for (name, value) in headers {
        let name = HeaderName::from_bytes(name.as_bytes()).map_err(|e| StreamError::Config(e.to_string()))?;
        let value = HeaderValue::from_str(value).map_err(|e| StreamError::Config(e.to_string()))?;
        request.headers_mut().insert(name, value);
    }
    match tokio::time::timeout(timeout, tokio_tungstenite::connect_async(request)).await {
        Ok(Ok((ws, _response))) => Ok(ws),
        Ok(Err(e)) => Err(StreamError::network(url, e)),
        Err(_) => Err(StreamError::network(url, format!("connect timed out after {}ms", timeout.as_millis()))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;

    #[test]
    fn test_backoff_grows_and_caps() {
        let policy = ReconnectPolicy {
            max_attempts: 5,
            initial_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_millis(500),
            reconnect_timeout: Duration::from_secs(5),
        };
        let first = policy.backoff(1);
        assert!(first >= Duration::from_millis(100) && first <= Duration::from_millis(125));
        let third = policy.backoff(3);
        assert!(third >= Duration::from_millis(400) && third <= Duration::from_millis(500));
        let tenth = policy.backoff(10);
        assert!(tenth >= Duration::from_millis(500) && tenth <= Duration::from_millis(625));
    }

    #[tokio::test]
    async fn test_detached_handle_queues_frames() {
        let (handle, mut rx) = ConnectionHandle::detached("ws://test");
        handle.send("hello".into()).unwrap();
        handle.close();
        assert!(matches!(rx.recv().await, Some(Outbound::Frame(f)) if f == "hello"));
        assert!(matches!(rx.recv().await, Some(Outbound::Close)));
        drop(rx);
        assert_eq!(handle.send("late".into()), Err(StreamError::Closed));
    }

    #[derive(Default)]
    struct Recorder {
        closed: Mutex<Vec<Option<StreamError>>>,
    }

    impl FrameHandler for Recorder {
        fn on_open(&self, _reconnected: bool) -> Vec<String> {
            Vec::new()
        }
        fn on_frame(&self, _text: &str) {}
        fn on_drop(&self, _error: &StreamError, _will_retry: bool) {}
        fn on_closed(&self, error: Option<&StreamError>) {
            self.closed.lock().push(error.cloned());
        }
    }

    #[tokio::test]
    async fn test_unreachable_without_policy_closes_with_network_error() {
        let recorder = Arc::new(Recorder::default());
        let settings = ConnectionSettings { connect_timeout: Duration::from_millis(500), ..Default::default() };
        let handle = StreamConnection::spawn("ws://127.0.0.1:9", Vec::new(), settings, recorder.clone());
        assert_eq!(handle.wait_for(ConnectionState::Open).await, ConnectionState::Closed);
        let closed = recorder.closed.lock();
        assert!(matches!(closed.as_slice(), [Some(StreamError::Network { .. })]));
    }

    #[tokio::test]
    async fn test_unreachable_with_policy_exhausts_retries() {
        let recorder = Arc::new(Recorder::default());
        let settings = ConnectionSettings {
            connect_timeout: Duration::from_millis(200),
            reconnect: Some(ReconnectPolicy {
                max_attempts: 3,
                initial_backoff: Duration::from_millis(5),
                max_backoff: Duration::from_millis(10),
                reconnect_timeout: Duration::from_secs(5),
            }),
            heartbeat: None,
        };
        let handle = StreamConnection::spawn("ws://127.0.0.1:9", Vec::new(), settings, recorder.clone());
        assert_eq!(handle.wait_for(ConnectionState::Open).await, ConnectionState::Closed);
        let closed = recorder.closed.lock();
        assert!(matches!(closed.as_slice(), [Some(StreamError::RetryExhausted { attempts: 3, .. })]));
    }

    #[test]
    fn test_settings_reject_zero_durations() {
        assert!(ConnectionSettings::default().validate().is_ok());
        let zero_ping = ConnectionSettings {
            heartbeat: Some(HeartbeatPolicy { ping_interval: Duration::ZERO, pong_timeout: Duration::from_secs(1) }),
            ..Default::default()
        };
        assert!(matches!(zero_ping.validate(), Err(StreamError::Config(_))));
        let zero_attempts = ConnectionSettings {
            reconnect: Some(ReconnectPolicy { max_attempts: 0, ..Default::default() }),
            ..Default::default()
        };
        assert!(matches!(zero_attempts.validate(), Err(StreamError::Config(_))));
    }

    #[tokio::test]
    async fn test_invalid_settings_close_before_connecting() {
        let recorder = Arc::new(Recorder::default());
        let settings = ConnectionSettings {
            heartbeat: Some(HeartbeatPolicy { ping_interval: Duration::ZERO, pong_timeout: Duration::ZERO }),
            ..Default::default()
        };
        let handle = StreamConnection::spawn("ws://127.0.0.1:9", Vec::new(), settings, recorder.clone());
        assert_eq!(handle.wait_for(ConnectionState::Open).await, ConnectionState::Closed);
        let closed = recorder.closed.lock();
        assert!(matches!(closed.as_slice(), [Some(StreamError::Config(_))]));
    }

    #[tokio::test]
    async fn test_pong_deadline_shorter_than_ping_interval() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("ws://{}", listener.local_addr().unwrap());
        // accepts and never reads, so pings go unanswered
        let server = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let ws = tokio_tungstenite::accept_async(stream).await.unwrap();
            tokio::time::sleep(Duration::from_secs(5)).await;
            drop(ws);
        });

        let recorder = Arc::new(Recorder::default());
        let settings = ConnectionSettings {
            heartbeat: Some(HeartbeatPolicy {
                ping_interval: Duration::from_millis(300),
                pong_timeout: Duration::from_millis(50),
            }),
            ..Default::default()
        };
        let handle = StreamConnection::spawn(&url, Vec::new(), settings, recorder.clone());
        assert_eq!(handle.wait_for(ConnectionState::Open).await, ConnectionState::Open);
        let opened = Instant::now();

        assert_eq!(handle.wait_for(ConnectionState::Closed).await, ConnectionState::Closed);
        // first ping at 300ms, deadline 50ms later; the next tick would be 600ms
        assert!(opened.elapsed() < Duration::from_millis(550), "took {:?}", opened.elapsed());
        let closed = recorder.closed.lock();
        assert!(matches!(closed.as_slice(), [Some(StreamError::Network { reason, .. })] if reason == "pong timeout"));
        server.abort();
    }
}
