//! STOMP over websocket, with auto-reconnect.
//!
//! The broker link runs in a background task. Publishing only queues the
//! frame; the task writes it while the link is up. Every (re)connect
//! performs the STOMP handshake and re-subscribes to the configured
//! destinations, and inbound `MESSAGE` frames are fanned out through a
//! [`tokio::sync::broadcast`] channel.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use futures_util::{SinkExt, Stream, StreamExt};
use secrecy::ExposeSecret;
use tokio::sync::{broadcast, mpsc};
use tokio_tungstenite::tungstenite;
use tokio_util::sync::CancellationToken;

use super::stomp::{self, Command, Frame};
use super::{Broker, BrokerConfig, InboundMessage, calculate_backoff};
use crate::error::Error;

const INBOUND_CHANNEL_CAPACITY: usize = 256;
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);
/// Heart-beat interval we offer to send and ask to receive.
const HEARTBEAT_MS: u64 = 10_000;

/// Handle to a running STOMP broker link.
pub struct StompBroker {
    outbound: mpsc::UnboundedSender<Frame>,
    inbound: broadcast::Sender<InboundMessage>,
    connected: Arc<AtomicBool>,
    cancel: CancellationToken,
}

impl StompBroker {
    /// Spawn the connection loop and return immediately.
    ///
    /// The first connection attempt happens asynchronously; until it
    /// completes, [`publish`](Broker::publish) reports
    /// [`Error::BrokerUnavailable`].
    pub fn connect(config: BrokerConfig, cancel: CancellationToken) -> Self {
        let (outbound, outbound_rx) = mpsc::unbounded_channel();
        let (inbound, _) = broadcast::channel(INBOUND_CHANNEL_CAPACITY);
        let connected = Arc::new(AtomicBool::new(false));

        let link = Link {
            config,
            inbound: inbound.clone(),
            connected: Arc::clone(&connected),
            cancel: cancel.clone(),
        };
        tokio::spawn(link.run(outbound_rx));

        Self {
            outbound,
            inbound,
            connected,
            cancel,
        }
    }
}

#[async_trait]
impl Broker for StompBroker {
    fn publish(&self, destination: &str, body: String) -> Result<(), Error> {
        if !self.is_connected() {
            return Err(Error::BrokerUnavailable);
        }
        self.outbound
            .send(Frame::send(destination, body))
            .map_err(|_| Error::BrokerUnavailable)
    }

    fn subscribe(&self) -> broadcast::Receiver<InboundMessage> {
        self.inbound.subscribe()
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    async fn shutdown(&self) {
        self.cancel.cancel();
        self.connected.store(false, Ordering::SeqCst);
    }
}

// ── Background reconnection loop ─────────────────────────────────────

struct Link {
    config: BrokerConfig,
    inbound: broadcast::Sender<InboundMessage>,
    connected: Arc<AtomicBool>,
    cancel: CancellationToken,
}

impl Link {
    /// Main loop: connect → handshake → pump frames → on error, backoff → reconnect.
    async fn run(self, mut outbound: mpsc::UnboundedReceiver<Frame>) {
        let mut attempt: u32 = 0;

        loop {
            let result = self.connect_and_pump(&mut outbound, &mut attempt).await;
            self.connected.store(false, Ordering::SeqCst);

            if self.cancel.is_cancelled() {
                break;
            }

            match result {
                Ok(()) => {
                    tracing::info!("broker link closed cleanly, reconnecting");
                    attempt = 0;
                }
                Err(e) => {
                    tracing::warn!(error = %e, attempt, "broker link error");

                    if let Some(max) = self.config.reconnect.max_retries {
                        if attempt >= max {
                            tracing::error!(max_retries = max, "broker reconnection limit reached, giving up");
                            break;
                        }
                    }

                    let delay = calculate_backoff(attempt, &self.config.reconnect);
                    tracing::info!(
                        delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                        attempt,
                        "waiting before broker reconnect"
                    );

                    tokio::select! {
                        biased;
                        () = self.cancel.cancelled() => break,
                        () = tokio::time::sleep(delay) => {}
                    }

                    attempt = attempt.saturating_add(1);
                }
            }
        }

        tracing::debug!("broker loop exiting");
    }

    /// One connection lifecycle. `attempt` is reset once the handshake succeeds.
    async fn connect_and_pump(
        &self,
        outbound: &mut mpsc::UnboundedReceiver<Frame>,
        attempt: &mut u32,
    ) -> Result<(), Error> {
        let url = &self.config.url;
        tracing::info!(url = %url, "connecting to broker");

        let (ws_stream, _response) = tokio::select! {
            biased;
            () = self.cancel.cancelled() => return Ok(()),
            result = tokio_tungstenite::connect_async(url.as_str()) => {
                result.map_err(|e| Error::WebSocketConnect(e.to_string()))?
            }
        };
        let (mut write, mut read) = ws_stream.split();

        write.send(to_ws_message(&self.connect_frame())?).await.map_err(ws_error)?;

        let connected = tokio::time::timeout(HANDSHAKE_TIMEOUT, await_connected(&mut read))
            .await
            .map_err(|_| Error::Timeout {
                timeout_secs: HANDSHAKE_TIMEOUT.as_secs(),
            })??;

        let send_every = negotiated_heartbeat(connected.get("heart-beat"));
        tracing::info!(
            version = connected.get("version").unwrap_or("1.2"),
            heartbeat_ms = send_every.map(|d| u64::try_from(d.as_millis()).unwrap_or(u64::MAX)),
            "broker connected"
        );

        for (index, destination) in self.config.subscriptions.iter().enumerate() {
            let subscribe = Frame::new(Command::Subscribe)
                .header("id", format!("sub-{index}"))
                .header("destination", destination.as_str())
                .header("ack", "auto");
            write.send(to_ws_message(&subscribe)?).await.map_err(ws_error)?;
            tracing::debug!(destination = %destination, "subscribed");
        }

        *attempt = 0;
        self.connected.store(true, Ordering::SeqCst);

        let mut heartbeat = tokio::time::interval(send_every.unwrap_or(Duration::from_secs(3600)));
        heartbeat.tick().await;

        loop {
            tokio::select! {
                biased;
                () = self.cancel.cancelled() => {
                    let _ = write.send(to_ws_message(&Frame::new(Command::Disconnect))?).await;
                    let _ = write.close().await;
                    return Ok(());
                }
                frame = outbound.recv() => {
                    let Some(frame) = frame else {
                        return Ok(());
                    };
                    write.send(to_ws_message(&frame)?).await.map_err(ws_error)?;
                }
                _ = heartbeat.tick(), if send_every.is_some() => {
                    write.send(tungstenite::Message::text("\n")).await.map_err(ws_error)?;
                }
                message = read.next() => {
                    match message {
                        Some(Ok(tungstenite::Message::Close(frame))) => {
                            if let Some(ref cf) = frame {
                                tracing::info!(code = %cf.code, reason = %cf.reason, "broker closed websocket");
                            }
                            return Ok(());
                        }
                        Some(Ok(message)) => self.handle_inbound(&message)?,
                        Some(Err(e)) => return Err(ws_error(e)),
                        None => {
                            tracing::info!("broker stream ended");
                            return Ok(());
                        }
                    }
                }
            }
        }
    }

    fn handle_inbound(&self, message: &tungstenite::Message) -> Result<(), Error> {
        let frame = match from_ws_message(message) {
            Ok(Some(frame)) => frame,
            Ok(None) => return Ok(()),
            Err(e) => {
                tracing::debug!(error = %e, "dropping undecodable frame");
                return Ok(());
            }
        };

        match frame.command {
            Command::Message => {
                let destination = frame.get("destination").unwrap_or_default().to_owned();
                match frame.body_text() {
                    Ok(body) => {
                        // No subscribers just means nobody is listening right now.
                        let _ = self.inbound.send(InboundMessage {
                            destination,
                            body: body.to_owned(),
                        });
                    }
                    Err(e) => tracing::warn!(error = %e, destination = %destination, "dropping message"),
                }
                Ok(())
            }
            Command::Error => Err(broker_error(&frame)),
            other => {
                tracing::trace!(command = %other, "ignoring frame");
                Ok(())
            }
        }
    }

    fn connect_frame(&self) -> Frame {
        let host = self
            .config
            .host
            .clone()
            .or_else(|| self.config.url.host_str().map(str::to_owned))
            .unwrap_or_else(|| "localhost".into());

        let mut frame = Frame::new(Command::Connect)
            .header("accept-version", "1.2")
            .header("host", host)
            .header("heart-beat", format!("{HEARTBEAT_MS},{HEARTBEAT_MS}"));
        if let Some(login) = &self.config.login {
            frame = frame.header("login", login.as_str());
        }
        if let Some(passcode) = &self.config.passcode {
            frame = frame.header("passcode", passcode.expose_secret());
        }
        frame
    }
}

/// Read frames until the broker answers the CONNECT.
async fn await_connected<S>(read: &mut S) -> Result<Frame, Error>
where
    S: Stream<Item = Result<tungstenite::Message, tungstenite::Error>> + Unpin,
{
    loop {
        match read.next().await {
            Some(Ok(message)) => {
                let Some(frame) = from_ws_message(&message)? else {
                    continue;
                };
                match frame.command {
                    Command::Connected => return Ok(frame),
                    Command::Error => return Err(broker_error(&frame)),
                    other => tracing::debug!(command = %other, "ignoring frame before CONNECTED"),
                }
            }
            Some(Err(e)) => return Err(ws_error(e)),
            None => return Err(Error::Disconnected),
        }
    }
}

/// How often we must send heart-beats given the server's `heart-beat` header.
fn negotiated_heartbeat(server: Option<&str>) -> Option<Duration> {
    let (_, server_wants) = server.and_then(stomp::parse_heartbeat)?;
    if server_wants == 0 {
        return None;
    }
    Some(Duration::from_millis(server_wants.max(HEARTBEAT_MS)))
}

fn to_ws_message(frame: &Frame) -> Result<tungstenite::Message, Error> {
    let text = String::from_utf8(frame.encode().to_vec())
        .map_err(|e| Error::Frame(format!("frame is not UTF-8: {e}")))?;
    Ok(tungstenite::Message::text(text))
}

fn from_ws_message(message: &tungstenite::Message) -> Result<Option<Frame>, Error> {
    match message {
        tungstenite::Message::Text(text) => Frame::decode(text.as_bytes()),
        tungstenite::Message::Binary(bytes) => Frame::decode(bytes),
        _ => Ok(None),
    }
}

fn ws_error(e: tungstenite::Error) -> Error {
    match e {
        tungstenite::Error::ConnectionClosed | tungstenite::Error::AlreadyClosed => Error::WebSocketClosed {
            code: 1000,
            reason: e.to_string(),
        },
        other => Error::WebSocketConnect(other.to_string()),
    }
}

fn broker_error(frame: &Frame) -> Error {
    let message = frame
        .get("message")
        .map(str::to_owned)
        .or_else(|| frame.body_text().ok().map(str::to_owned))
        .unwrap_or_else(|| "unspecified broker error".into());
    Error::Broker { message }
}
