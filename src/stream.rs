use std::cmp;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::error::ConnectionError;

// ---------------------------------------------------------------------------
// Transport seam
// ---------------------------------------------------------------------------

/// One event delivered by the push hub.
///
/// The payload stays raw JSON here; decoding into an [`Item`](crate::Item)
/// is the sync layer's job, so a bad payload never kills the connection.
#[derive(Debug, Clone)]
pub struct PushEvent {
    pub event_type: String,
    pub payload: serde_json::Value,
}

/// Connection factory for the push hub. The concrete transport (a persistent
/// socket, a long-poll loop) lives behind this seam.
#[async_trait]
pub trait PushTransport: Send + Sync {
    async fn connect(&self) -> Result<Box<dyn PushSession>, ConnectionError>;
}

/// One established hub connection.
///
/// `Ok(None)` means the server closed the session in an orderly way; both
/// that and `Err` send the client back into its reconnect loop.
#[async_trait]
pub trait PushSession: Send {
    async fn next_event(&mut self) -> Result<Option<PushEvent>, ConnectionError>;
}

// ---------------------------------------------------------------------------
// Connection state machine
// ---------------------------------------------------------------------------

/// `Disconnected → Connecting → Connected → Reconnecting → Connected | Failed`
///
/// `Failed` is terminal and only reached when `max_attempts` is exhausted;
/// an explicit disconnect ends in `Disconnected` and never resurrects.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
    Failed,
}

/// Reconnect policy and event-type subscription for one client.
#[derive(Debug, Clone)]
pub struct StreamConfig {
    /// First reconnect delay; doubles per consecutive failure.
    pub reconnect_base: Duration,
    /// Upper bound on the reconnect delay.
    pub reconnect_cap: Duration,
    /// Consecutive failed connection attempts before giving up. 0 = never.
    pub max_attempts: u32,
    /// Event types to deliver (e.g. `"ItemCreated"`). Empty = all.
    pub event_types: Vec<String>,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            reconnect_base: Duration::from_secs(1),
            reconnect_cap: Duration::from_secs(30),
            max_attempts: 0,
            event_types: vec!["ItemCreated".to_string()],
        }
    }
}

/// Capped exponential backoff delay for the given zero-based attempt.
pub(crate) fn backoff_delay(base: Duration, cap: Duration, attempt: u32) -> Duration {
    cmp::min(cap, base.saturating_mul(2u32.saturating_pow(attempt.min(16))))
}

// ---------------------------------------------------------------------------
// EventStreamClient
// ---------------------------------------------------------------------------

/// Push-hub subscription with automatic reconnect.
///
/// Delivery is at-least-once: after a reconnect the hub may redeliver, and
/// the store deduplicates by id. No cross-conversation ordering is assumed.
pub struct EventStreamClient;

impl EventStreamClient {
    /// Spawn the connection loop and hand back its [`StreamHandle`].
    pub fn connect(transport: Arc<dyn PushTransport>, config: StreamConfig) -> StreamHandle {
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let (state_tx, state_rx) = watch::channel(ConnectionState::Disconnected);
        let cancel = CancellationToken::new();
        let task_cancel = cancel.clone();
        let join =
            tokio::spawn(async move { run(transport, config, event_tx, state_tx, task_cancel).await });
        StreamHandle { events: event_rx, state: state_rx, cancel, join }
    }
}

/// Live handle to a spawned connection loop.
///
/// Dropping the handle without calling [`disconnect`](Self::disconnect)
/// closes the event channel, which also stops the loop.
pub struct StreamHandle {
    events: mpsc::UnboundedReceiver<PushEvent>,
    state: watch::Receiver<ConnectionState>,
    cancel: CancellationToken,
    join: JoinHandle<()>,
}

impl StreamHandle {
    /// Next delivered event, or `None` once the loop has ended.
    pub async fn next_event(&mut self) -> Option<PushEvent> {
        self.events.recv().await
    }

    /// Watch the connection state machine.
    pub fn state(&self) -> watch::Receiver<ConnectionState> {
        self.state.clone()
    }

    /// Stop the loop and wait for it to finish. The loop never restarts
    /// after an explicit disconnect.
    pub async fn disconnect(self) {
        self.cancel.cancel();
        let _ = self.join.await;
    }
}

async fn run(
    transport: Arc<dyn PushTransport>,
    config: StreamConfig,
    events: mpsc::UnboundedSender<PushEvent>,
    state: watch::Sender<ConnectionState>,
    cancel: CancellationToken,
) {
    // Consecutive failed connect() calls. A session that established and was
    // later closed or dropped does not count toward the cap.
    let mut failures: u32 = 0;
    let _ = state.send(ConnectionState::Connecting);
    loop {
        let connected = tokio::select! {
            _ = cancel.cancelled() => break,
            res = transport.connect() => res,
        };

        match connected {
            Ok(mut session) => {
                failures = 0;
                let _ = state.send(ConnectionState::Connected);
                info!("push stream connected");

                loop {
                    let event = tokio::select! {
                        _ = cancel.cancelled() => {
                            let _ = state.send(ConnectionState::Disconnected);
                            return;
                        }
                        event = session.next_event() => event,
                    };
                    match event {
                        Ok(Some(event)) => {
                            if !config.event_types.is_empty()
                                && !config.event_types.contains(&event.event_type)
                            {
                                debug!(event_type = %event.event_type, "skipping event type");
                                continue;
                            }
                            if events.send(event).is_err() {
                                // Receiver gone: nobody is listening anymore.
                                let _ = state.send(ConnectionState::Disconnected);
                                return;
                            }
                        }
                        Ok(None) => {
                            warn!("push session closed by server");
                            break;
                        }
                        Err(err) => {
                            warn!("push session error: {err}");
                            break;
                        }
                    }
                }
            }
            Err(err) => {
                warn!(failures, "push connect failed: {err}");
                failures += 1;
                if config.max_attempts != 0 && failures >= config.max_attempts {
                    error!(attempts = failures, "push stream giving up");
                    let _ = state.send(ConnectionState::Failed);
                    return;
                }
            }
        }

        let _ = state.send(ConnectionState::Reconnecting);
        let delay = backoff_delay(
            config.reconnect_base,
            config.reconnect_cap,
            failures.saturating_sub(1),
        );
        debug!(?delay, "push reconnect backoff");
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = tokio::time::sleep(delay) => {}
        }
    }
    let _ = state.send(ConnectionState::Disconnected);
}
