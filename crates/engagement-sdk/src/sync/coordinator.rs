use std::sync::{Arc, Weak};
use std::time::Duration;

use bytes::Bytes;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use pubsub_bus::{BusError, BusMessage, PubSubClient};
use tokio::sync::{broadcast, mpsc};
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::{self, MissedTickBehavior};
use tracing::{debug, info, warn};

use super::messages::{SyncMessage, SyncSessionStatus};
use super::session::{SessionSetup, SyncSession};
use super::{SyncError, SyncNotification, SyncPhase};
use crate::config::EngagementConfig;
use crate::time::{format_pdt, PlayerTimeSource};

const MIN_INTERVAL: Duration = Duration::from_millis(1);
const MAX_UPDATES_IN_FLIGHT: usize = 8;

struct CoordinatorState {
    phase: SyncPhase,
    channel: Option<String>,
    time_source: Option<Arc<dyn PlayerTimeSource>>,
    listener: Option<JoinHandle<()>>,
    timer: Option<JoinHandle<()>>,
    updates: JoinSet<()>,
}

struct Inner {
    session_id: String,
    interval: Duration,
    setup: Arc<dyn SessionSetup>,
    transport: Arc<dyn PubSubClient>,
    notifications: mpsc::UnboundedSender<SyncNotification>,
    state: Mutex<CoordinatorState>,
}

/// Runs one viewer-side PDT sync session:
/// `Idle → Connecting → Handshaking → Connected → TornDown`.
///
/// Background tasks only hold a weak reference; dropping the coordinator
/// tears the session down.
pub struct SyncCoordinator {
    inner: Arc<Inner>,
}

impl SyncCoordinator {
    /// Returns the coordinator and the receiving end of its notification
    /// channel. Feed the receiver to [`super::spawn_delegate_dispatch`] or
    /// read it directly.
    pub fn new(
        session_id: impl Into<String>,
        interval: Duration,
        setup: Arc<dyn SessionSetup>,
        transport: Arc<dyn PubSubClient>,
    ) -> (Self, mpsc::UnboundedReceiver<SyncNotification>) {
        let (notifications, rx) = mpsc::unbounded_channel();
        let inner = Arc::new(Inner {
            session_id: session_id.into(),
            interval: interval.max(MIN_INTERVAL),
            setup,
            transport,
            notifications,
            state: Mutex::new(CoordinatorState {
                phase: SyncPhase::Idle,
                channel: None,
                time_source: None,
                listener: None,
                timer: None,
                updates: JoinSet::new(),
            }),
        });
        (Self { inner }, rx)
    }

    pub fn from_config(
        config: &EngagementConfig,
        setup: Arc<dyn SessionSetup>,
        transport: Arc<dyn PubSubClient>,
    ) -> (Self, mpsc::UnboundedReceiver<SyncNotification>) {
        Self::new(config.session_id.clone(), config.sync_interval, setup, transport)
    }

    pub fn phase(&self) -> SyncPhase {
        self.inner.state.lock().phase.clone()
    }

    pub fn sync_channel(&self) -> Option<String> {
        self.inner.state.lock().channel.clone()
    }

    pub fn is_timer_running(&self) -> bool {
        self.inner
            .state
            .lock()
            .timer
            .as_ref()
            .is_some_and(|timer| !timer.is_finished())
    }

    /// Creates a sync session and starts listening on its channel.
    ///
    /// The pin is surfaced as [`SyncNotification::PinReceived`] and returned.
    /// Failures are surfaced as [`SyncNotification::Failed`] and leave the
    /// coordinator idle so the caller may retry.
    pub async fn start_syncing_session(
        &self,
        time_source: Option<Arc<dyn PlayerTimeSource>>,
    ) -> Result<SyncSession, SyncError> {
        {
            let mut state = self.inner.state.lock();
            match state.phase {
                SyncPhase::Idle => {}
                SyncPhase::TornDown => return Err(SyncError::TornDown),
                _ => return Err(SyncError::AlreadyStarted),
            }
            state.phase = SyncPhase::Connecting;
            state.time_source = time_source;
        }
        let _pending = PendingSetup(&self.inner);

        info!(target: "pdt.sync", session_id = %self.inner.session_id, "starting sync session");
        let session = match self.inner.setup.create_session(&self.inner.session_id).await {
            Ok(session) if session.sync_channel.trim().is_empty() => Err(SyncError::InvalidChannel),
            other => other,
        };
        let session = match session {
            Ok(session) => session,
            Err(err) => {
                {
                    let mut state = self.inner.state.lock();
                    if state.phase == SyncPhase::Connecting {
                        state.phase = SyncPhase::Idle;
                        state.time_source = None;
                    }
                }
                warn!(target: "pdt.sync", error = %err, "sync session setup failed");
                self.inner.notify(SyncNotification::Failed(err.clone()));
                return Err(err);
            }
        };

        {
            let mut state = self.inner.state.lock();
            if state.phase != SyncPhase::Connecting {
                debug!(target: "pdt.sync", "torn down during session setup; not subscribing");
                return Err(SyncError::TornDown);
            }
            info!(
                target: "pdt.sync",
                channel = %session.sync_channel,
                connect_timeout_secs = session.connect_timeout.as_secs_f64(),
                "sync session created"
            );
            // Subscribed first so nothing is missed, but the pin is queued
            // before the listener can surface any status from the channel.
            let receiver = self.inner.transport.subscribe(&session.sync_channel);
            state.channel = Some(session.sync_channel.clone());
            self.inner.notify(SyncNotification::PinReceived {
                pin: session.pin.clone(),
                connect_timeout: session.connect_timeout,
            });
            state.listener = Some(tokio::spawn(listen(
                Arc::downgrade(&self.inner),
                session.sync_channel.clone(),
                receiver,
            )));
        }
        Ok(session)
    }

    /// Unsubscribes and stops the timer. Terminal; repeated calls are no-ops.
    pub fn teardown(&self) {
        self.inner.teardown();
    }
}

impl Drop for SyncCoordinator {
    fn drop(&mut self) {
        self.inner.teardown();
    }
}

/// Returns the coordinator to idle if session setup never reached the point of
/// subscribing, including when the setup future is dropped mid-flight.
struct PendingSetup<'a>(&'a Inner);

impl Drop for PendingSetup<'_> {
    fn drop(&mut self) {
        let mut state = self.0.state.lock();
        if state.phase == SyncPhase::Connecting && state.channel.is_none() {
            state.phase = SyncPhase::Idle;
            state.time_source = None;
        }
    }
}

impl Inner {
    fn notify(&self, notification: SyncNotification) {
        if self.notifications.send(notification).is_err() {
            debug!(target: "pdt.sync", "notification receiver dropped");
        }
    }

    async fn publish_message(&self, channel: &str, message: &SyncMessage) -> Result<(), SyncError> {
        let payload = message
            .encode()
            .map_err(|err| SyncError::Transport(format!("encode sync message: {err}")))?;
        self.transport.publish(channel, payload).await?;
        Ok(())
    }

    async fn handle_inbound(self: &Arc<Self>, channel: &str, payload: &[u8]) {
        let message = match SyncMessage::decode(payload) {
            Ok(message) => message,
            Err(err) => {
                warn!(target: "pdt.sync", channel, error = %err, "ignoring undecodable sync message");
                return;
            }
        };
        match message {
            SyncMessage::SyncSessionStatus(SyncSessionStatus::Ping { publish_key }) => {
                self.handle_ping(channel, publish_key).await
            }
            SyncMessage::SyncSessionStatus(SyncSessionStatus::Connected) => self.handle_connected(channel),
            SyncMessage::SyncSessionStatus(SyncSessionStatus::Pong) => {
                debug!(target: "pdt.sync", channel, "pong observed")
            }
            // Our own updates echoed back by the channel.
            SyncMessage::SyncSessionUpdate(_) => {}
        }
    }

    async fn handle_ping(&self, channel: &str, publish_key: Option<String>) {
        let Some(publish_key) = publish_key.filter(|key| !key.trim().is_empty()) else {
            warn!(target: "pdt.sync", channel, "ping without publish key");
            self.notify(SyncNotification::Failed(SyncError::InvalidPublishKey));
            return;
        };

        if let Err(err) = self.transport.set_publish_key(&publish_key).await {
            let error = match err {
                BusError::Rejected(_) => SyncError::InvalidPublishKey,
                other => SyncError::from(other),
            };
            warn!(target: "pdt.sync", channel, error = %error, "publish key not accepted");
            self.notify(SyncNotification::Failed(error));
            return;
        }

        {
            let mut state = self.state.lock();
            match state.phase {
                SyncPhase::Connecting | SyncPhase::Handshaking { .. } => {
                    state.phase = SyncPhase::Handshaking {
                        publish_key: publish_key.clone(),
                    };
                }
                // Key rotation while updates are flowing.
                SyncPhase::Connected => {}
                SyncPhase::Idle | SyncPhase::TornDown => return,
            }
        }

        match self.publish_message(channel, &SyncMessage::pong()).await {
            Ok(()) => debug!(target: "pdt.sync", channel, "pong sent"),
            Err(err) => {
                warn!(target: "pdt.sync", channel, error = %err, "pong publish failed");
                self.notify(SyncNotification::Failed(err));
            }
        }
    }

    fn handle_connected(self: &Arc<Self>, channel: &str) {
        {
            let mut state = self.state.lock();
            match state.phase {
                SyncPhase::Handshaking { .. } => {}
                SyncPhase::Connecting => {
                    warn!(target: "pdt.sync", channel, "connected status before any ping; ignored");
                    return;
                }
                SyncPhase::Connected => {
                    debug!(target: "pdt.sync", channel, "already connected; timer left as is");
                    return;
                }
                SyncPhase::Idle | SyncPhase::TornDown => return,
            }
            state.phase = SyncPhase::Connected;
            let timer = tokio::spawn(run_timer(
                Arc::downgrade(self),
                channel.to_string(),
                self.interval,
                state.time_source.clone(),
            ));
            if let Some(previous) = state.timer.replace(timer) {
                previous.abort();
            }
        }
        info!(target: "pdt.sync", channel, interval_secs = self.interval.as_secs_f64(), "sync session connected");
        self.notify(SyncNotification::Connected);
    }

    fn teardown(&self) {
        let (channel, listener, timer, mut updates) = {
            let mut state = self.state.lock();
            if state.phase == SyncPhase::TornDown {
                return;
            }
            state.phase = SyncPhase::TornDown;
            state.time_source = None;
            (
                state.channel.take(),
                state.listener.take(),
                state.timer.take(),
                std::mem::take(&mut state.updates),
            )
        };
        for task in [listener, timer].into_iter().flatten() {
            task.abort();
        }
        updates.abort_all();
        if let Some(channel) = &channel {
            self.transport.unsubscribe(channel);
        }
        info!(target: "pdt.sync", channel = ?channel, "sync coordinator torn down");
    }
}

async fn listen(inner: Weak<Inner>, channel: String, mut receiver: broadcast::Receiver<BusMessage>) {
    loop {
        match receiver.recv().await {
            Ok(message) => {
                let Some(inner) = inner.upgrade() else {
                    break;
                };
                inner.handle_inbound(&channel, &message.payload).await;
            }
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                warn!(target: "pdt.sync", channel = %channel, skipped, "sync listener lagged");
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
    debug!(target: "pdt.sync", channel = %channel, "sync listener stopped");
}

/// Ticks at `period` and hands each update to its own task, so a publish that
/// outlives the period neither delays the next tick nor gets cut short.
async fn run_timer(
    inner: Weak<Inner>,
    channel: String,
    period: Duration,
    time_source: Option<Arc<dyn PlayerTimeSource>>,
) {
    let mut ticker = time::interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    loop {
        ticker.tick().await;
        let Some(inner) = inner.upgrade() else {
            break;
        };
        let program_date_time = time_source
            .as_ref()
            .and_then(|source| source.playhead())
            .unwrap_or_else(Utc::now);
        let payload = match SyncMessage::update(program_date_time).encode() {
            Ok(payload) => payload,
            Err(err) => {
                warn!(target: "pdt.sync", channel = %channel, error = %err, "sync update not encodable");
                continue;
            }
        };

        let mut state = inner.state.lock();
        if state.phase != SyncPhase::Connected {
            break;
        }
        reap_updates(&mut state.updates);
        if state.updates.len() >= MAX_UPDATES_IN_FLIGHT {
            warn!(
                target: "pdt.sync",
                channel = %channel,
                in_flight = state.updates.len(),
                "sync updates backed up; skipping tick"
            );
            continue;
        }
        state.updates.spawn(publish_update(
            inner.transport.clone(),
            channel.clone(),
            payload,
            program_date_time,
        ));
    }
}

async fn publish_update(
    transport: Arc<dyn PubSubClient>,
    channel: String,
    payload: Bytes,
    program_date_time: DateTime<Utc>,
) {
    match transport.publish(&channel, payload).await {
        Ok(()) => debug!(
            target: "pdt.sync",
            channel = %channel,
            program_date_time = %format_pdt(&program_date_time),
            "sync update published"
        ),
        Err(err) => {
            let err = SyncError::from(err);
            warn!(target: "pdt.sync", channel = %channel, error = %err, "sync update publish failed");
        }
    }
}

fn reap_updates(updates: &mut JoinSet<()>) {
    while let Some(result) = updates.try_join_next() {
        if let Err(err) = result {
            if err.is_panic() {
                warn!(target: "pdt.sync", error = %err, "sync update task panicked");
            }
        }
    }
}
