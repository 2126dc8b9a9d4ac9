use std::sync::Arc;
use std::time::Instant;

use futures::stream::SplitSink;
use futures::{SinkExt, StreamExt};
use parking_lot::Mutex;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};
use tracing::{debug, error, info, warn};

use super::protocol::{InboundFrame, StreamRequest, parse_frame};
use super::{FeedCommand, FeedState, Registry};
use crate::config::FeedConfig;
use crate::error::MonitorError;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;
type WsSink = SplitSink<WsStream, Message>;

/// Why a live session ended.
enum SessionEnd {
    /// Operator asked for teardown. The driver exits cleanly.
    Shutdown,
    /// The transport dropped or went silent. The driver reconnects.
    ConnectionLost(String),
}

/// Owns one feed connection end to end.
///
/// Runs as a spawned task: dials, replays registered streams, pumps
/// frames into the subscriber registry and reconnects with exponential
/// backoff until the attempt cap is exhausted.
pub(super) struct Driver {
    config: FeedConfig,
    registry: Arc<Mutex<Registry>>,
    state: Arc<watch::Sender<FeedState>>,
    commands: mpsc::Receiver<FeedCommand>,
    request_id: u64,
}

impl Driver {
    pub(super) fn new(
        config: FeedConfig,
        registry: Arc<Mutex<Registry>>,
        state: Arc<watch::Sender<FeedState>>,
        commands: mpsc::Receiver<FeedCommand>,
    ) -> Self {
        Self {
            config,
            registry,
            state,
            commands,
            request_id: 0,
        }
    }

    pub(super) async fn run(mut self) {
        info!(url = %self.config.url, "starting feed driver");
        let mut attempt: u32 = 0;

        loop {
            if attempt > 0 {
                if attempt > self.config.max_reconnect_attempts {
                    error!(
                        attempts = self.config.max_reconnect_attempts,
                        "reconnect limit exceeded, feed entering failed state"
                    );
                    self.set_state(FeedState::Failed);
                    return;
                }
                let delay = self.config.backoff_delay(attempt - 1);
                warn!(attempt, delay_ms = delay.as_millis() as u64, "feed reconnecting after backoff");
                self.set_state(FeedState::Reconnecting);
                if !self.wait_backoff(delay).await {
                    self.set_state(FeedState::Disconnected);
                    return;
                }
            }

            self.set_state(FeedState::Connecting);
            match connect_async(&self.config.url).await {
                Ok((stream, _)) => {
                    info!(url = %self.config.url, "feed connected");
                    attempt = 0;
                    self.set_state(FeedState::Connected);
                    match self.session(stream).await {
                        SessionEnd::Shutdown => {
                            self.set_state(FeedState::Disconnected);
                            info!("feed driver stopped");
                            return;
                        }
                        SessionEnd::ConnectionLost(reason) => {
                            warn!(%reason, "feed connection lost");
                            attempt = 1;
                        }
                    }
                }
                Err(error) => {
                    let error = MonitorError::from(error);
                    if error.is_terminal() {
                        error!(%error, "feed connection failed terminally");
                        self.set_state(FeedState::Failed);
                        return;
                    }
                    warn!(%error, "feed connection attempt failed");
                    attempt += 1;
                }
            }
        }
    }

    /// Pump one established connection until it ends.
    async fn session(&mut self, stream: WsStream) -> SessionEnd {
        let (mut write, mut read) = stream.split();

        let streams = self.registry.lock().streams();
        if !streams.is_empty() {
            debug!(count = streams.len(), "replaying stream subscriptions");
            let request = StreamRequest::subscribe(streams, self.next_request_id());
            if let Some(end) = self.send_request(&mut write, request).await {
                return end;
            }
        }

        let mut heartbeat = tokio::time::interval(self.config.heartbeat_interval);
        let mut last_activity = Instant::now();

        loop {
            tokio::select! {
                frame = read.next() => {
                    match frame {
                        Some(Ok(message)) => {
                            last_activity = Instant::now();
                            if let Some(end) = self.handle_message(message, &mut write).await {
                                return end;
                            }
                        }
                        Some(Err(error)) => {
                            return SessionEnd::ConnectionLost(error.to_string());
                        }
                        None => {
                            return SessionEnd::ConnectionLost("stream ended".to_string());
                        }
                    }
                }
                _ = heartbeat.tick() => {
                    if last_activity.elapsed() > self.config.heartbeat_deadline {
                        return SessionEnd::ConnectionLost(format!(
                            "no frames within heartbeat deadline {:?}",
                            self.config.heartbeat_deadline
                        ));
                    }
                    if let Err(error) = write.send(Message::Ping(vec![].into())).await {
                        return SessionEnd::ConnectionLost(error.to_string());
                    }
                }
                command = self.commands.recv() => {
                    match command {
                        Some(FeedCommand::Subscribe(stream)) => {
                            let request = StreamRequest::subscribe(
                                vec![stream.to_string()],
                                self.next_request_id(),
                            );
                            if let Some(end) = self.send_request(&mut write, request).await {
                                return end;
                            }
                        }
                        Some(FeedCommand::Unsubscribe(stream)) => {
                            let request = StreamRequest::unsubscribe(
                                vec![stream.to_string()],
                                self.next_request_id(),
                            );
                            if let Some(end) = self.send_request(&mut write, request).await {
                                return end;
                            }
                        }
                        Some(FeedCommand::Shutdown) | None => {
                            let _ = write.send(Message::Close(None)).await;
                            return SessionEnd::Shutdown;
                        }
                    }
                }
            }
        }
    }

    /// Returns `Some` when the frame ends the session.
    async fn handle_message(&mut self, message: Message, write: &mut WsSink) -> Option<SessionEnd> {
        match message {
            Message::Text(text) => {
                match parse_frame(&text) {
                    Ok(InboundFrame::Event { stream, data }) => {
                        let delivered = self.registry.lock().dispatch(&stream, &data);
                        if delivered == 0 {
                            debug!(stream = %stream, "event for stream with no subscribers");
                        }
                    }
                    Ok(InboundFrame::Ack { id, error: Some(error) }) => {
                        warn!(id, %error, "stream request rejected");
                    }
                    Ok(InboundFrame::Ack { id, error: None }) => {
                        debug!(id, "stream request acknowledged");
                    }
                    Ok(InboundFrame::Unknown) => {
                        debug!("ignoring unrecognized frame");
                    }
                    Err(error) => {
                        warn!(%error, "dropping malformed frame");
                    }
                }
                None
            }
            Message::Ping(payload) => {
                if let Err(error) = write.send(Message::Pong(payload)).await {
                    return Some(SessionEnd::ConnectionLost(error.to_string()));
                }
                None
            }
            Message::Pong(_) => None,
            Message::Close(_) => Some(SessionEnd::ConnectionLost("closed by server".to_string())),
            _ => None,
        }
    }

    async fn send_request(&self, write: &mut WsSink, request: StreamRequest) -> Option<SessionEnd> {
        let message = match request.to_message() {
            Ok(message) => message,
            Err(error) => {
                warn!(%error, "failed to encode stream request");
                return None;
            }
        };
        if let Err(error) = write.send(message).await {
            return Some(SessionEnd::ConnectionLost(error.to_string()));
        }
        None
    }

    /// Sleep out the backoff window while staying responsive to shutdown.
    ///
    /// Subscription commands received here are dropped: the registry is
    /// already up to date and the next session replays it in full.
    async fn wait_backoff(&mut self, delay: std::time::Duration) -> bool {
        let sleep = tokio::time::sleep(delay);
        tokio::pin!(sleep);
        loop {
            tokio::select! {
                _ = &mut sleep => return true,
                command = self.commands.recv() => {
                    match command {
                        Some(FeedCommand::Shutdown) | None => return false,
                        Some(_) => {}
                    }
                }
            }
        }
    }

    fn next_request_id(&mut self) -> u64 {
        self.request_id += 1;
        self.request_id
    }

    fn set_state(&self, state: FeedState) {
        self.state.send_replace(state);
    }
}
