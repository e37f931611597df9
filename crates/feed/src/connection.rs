//! Lifecycle of the streaming connection.
//!
//! [`ConnectionManager`] is a cheap handle over an actor task that owns the physical
//! session. The actor connects, performs the subscribe handshake, arms the
//! [`HeartbeatWatchdog`] and then reads frames serially: each frame resets the
//! watchdog at receipt, candle frames are classified by the [`SequenceGapDetector`]
//! and handed to a spawned handler that writes them through the versioned store.
//! Any transport failure, remote close or watchdog expiry re-enters the
//! backoff-reconnect cycle until [`ConnectionManager::disconnect`] is called.
//!
//! ```text
//! idle -> connecting -> connected -> reconnecting -> connecting -> ...
//!   any non-idle state -> closing -> idle      (disconnect)
//! ```

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc, oneshot, watch, OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, trace, warn};

use candle_sync_core::{
    validate_symbols, Candle, ClosedCandle, Clock, FeedConfig, SeriesId, Timeframe,
    VersionedCandle, WriteRequest,
};
use candle_sync_data::VersionedCandleStore;

use crate::backoff::Backoff;
use crate::error::{FeedError, TransportError};
use crate::gap::{SequenceGapDetector, SequenceObservation};
use crate::protocol::{CandleMessage, ChannelKind, ControlMessage, InboundMessage, Normalizer};
use crate::reconcile::ReconciliationService;
use crate::transport::{Connector, Session, TransportEvent};
use crate::watchdog::HeartbeatWatchdog;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionPhase {
    Idle,
    Connecting,
    Connected,
    Reconnecting,
    Closing,
}

impl ConnectionPhase {
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Connecting => "connecting",
            Self::Connected => "connected",
            Self::Reconnecting => "reconnecting",
            Self::Closing => "closing",
        }
    }
}

impl std::fmt::Display for ConnectionPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Snapshot of the connection, published on a `watch` channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionState {
    pub phase: ConnectionPhase,
    /// Id of the current (or last) physical connection, `0` before the first one.
    pub connection_id: u64,
    pub last_message_at: Option<DateTime<Utc>>,
    /// Resets to 0 on every successful connect.
    pub reconnect_attempt: u32,
    /// Resets to 0 on every new physical connection.
    pub last_sequence: u64,
}

impl Default for ConnectionState {
    fn default() -> Self {
        Self {
            phase: ConnectionPhase::Idle,
            connection_id: 0,
            last_message_at: None,
            reconnect_attempt: 0,
            last_sequence: 0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DisconnectReason {
    /// The peer closed the stream.
    Remote(Option<String>),
    /// Send or receive failed.
    Transport(String),
    /// No frame arrived within the watchdog interval.
    WatchdogExpired,
    /// `disconnect()` was called.
    Requested,
}

/// Connection lifecycle notifications, fanned out on a `broadcast` channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionEvent {
    PhaseChanged(ConnectionPhase),
    Connected {
        connection_id: u64,
        /// Reconnect attempts it took to get here; `0` for a first connect.
        attempt: u32,
    },
    Disconnected {
        connection_id: u64,
        reason: DisconnectReason,
    },
    GapDetected {
        connection_id: u64,
        missed: u64,
    },
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FeedStats {
    pub messages_received: u64,
    pub frames_dropped: u64,
    pub candles_written: u64,
    pub gaps_detected: u64,
    pub duplicates: u64,
    pub reconnect_attempts: u64,
}

#[derive(Debug)]
enum Command {
    Subscribe {
        symbols: Vec<String>,
        timeframe: Timeframe,
    },
    Unsubscribe {
        symbols: Vec<String>,
    },
}

#[derive(Debug)]
struct Shared {
    config: FeedConfig,
    connector: Arc<dyn Connector>,
    normalizer: Normalizer,
    store: VersionedCandleStore,
    reconciler: ReconciliationService,
    closed_tx: Option<mpsc::Sender<ClosedCandle>>,
    subscriptions: Mutex<BTreeMap<String, BTreeSet<Timeframe>>>,
    state_tx: watch::Sender<ConnectionState>,
    events_tx: broadcast::Sender<ConnectionEvent>,
    stats: Mutex<FeedStats>,
    handler_permits: Arc<Semaphore>,
    next_connection_id: AtomicU64,
}

#[derive(Debug)]
struct Running {
    shutdown_tx: watch::Sender<bool>,
    command_tx: mpsc::UnboundedSender<Command>,
    task: JoinHandle<()>,
}

/// Handle to the streaming connection of one exchange.
#[derive(Debug)]
pub struct ConnectionManager {
    shared: Arc<Shared>,
    running: Mutex<Option<Running>>,
}

impl ConnectionManager {
    /// `closed_tx` receives a [`ClosedCandle`] for every closed live bar that is written.
    pub fn new(
        config: FeedConfig,
        connector: Arc<dyn Connector>,
        store: VersionedCandleStore,
        reconciler: ReconciliationService,
        closed_tx: Option<mpsc::Sender<ClosedCandle>>,
    ) -> Self {
        let normalizer = Normalizer::new(config.exchange.clone(), config.timestamp_unit);
        let (state_tx, _) = watch::channel(ConnectionState::default());
        let (events_tx, _) = broadcast::channel(config.event_buffer.max(1));
        let handler_permits = Arc::new(Semaphore::new(config.handler_concurrency.max(1)));

        Self {
            shared: Arc::new(Shared {
                config,
                connector,
                normalizer,
                store,
                reconciler,
                closed_tx,
                subscriptions: Mutex::new(BTreeMap::new()),
                state_tx,
                events_tx,
                stats: Mutex::new(FeedStats::default()),
                handler_permits,
                next_connection_id: AtomicU64::new(0),
            }),
            running: Mutex::new(None),
        }
    }

    /// Starts the connection and waits for the first attempt to resolve.
    ///
    /// Returns immediately when the manager is already running. If the first attempt
    /// fails the error is returned, but the manager keeps retrying in the background
    /// until [`disconnect`](Self::disconnect) is called.
    ///
    /// # Errors
    /// Returns [`FeedError::Connection`] or [`FeedError::Handshake`] for a failed first
    /// attempt, and [`FeedError::Cancelled`] if `disconnect` won the race.
    pub async fn connect(&self) -> Result<(), FeedError> {
        let (outcome_tx, outcome_rx) = oneshot::channel();
        {
            let mut running = self.running.lock();
            if running.as_ref().is_some_and(|r| !r.task.is_finished()) {
                debug!("Connect called while already running");
                return Ok(());
            }

            let (shutdown_tx, shutdown_rx) = watch::channel(false);
            let (command_tx, command_rx) = mpsc::unbounded_channel();
            let actor = ConnectionActor {
                backoff: Backoff::from_config(&self.shared.config),
                watchdog: HeartbeatWatchdog::new(self.shared.config.watchdog_interval()),
                detector: SequenceGapDetector::new(),
                shared: Arc::clone(&self.shared),
                shutdown_rx,
                command_rx,
                first_outcome: Some(outcome_tx),
                attempt: 0,
            };
            *running = Some(Running {
                shutdown_tx,
                command_tx,
                task: tokio::spawn(actor.run()),
            });
        }

        outcome_rx.await.unwrap_or(Err(FeedError::Cancelled))
    }

    /// Stops the connection and waits for the actor to release the transport.
    ///
    /// Idempotent. Cancels an in-flight handshake or backoff sleep; in-flight
    /// reconciliation passes are left to finish.
    pub async fn disconnect(&self) {
        let Some(running) = self.running.lock().take() else {
            return;
        };
        info!(exchange = %self.shared.config.exchange, "Disconnect requested");
        running.shutdown_tx.send_replace(true);
        if let Err(e) = running.task.await {
            error!(error = %e, "Connection task ended abnormally");
            self.shared.set_phase(ConnectionPhase::Idle);
        }
    }

    /// Adds `symbols` at `timeframe` to the subscription set.
    ///
    /// Sent immediately when connected, otherwise applied on the next connect.
    ///
    /// # Errors
    /// Returns an error if the symbol list is empty or contains an invalid symbol.
    pub fn subscribe(&self, symbols: &[String], timeframe: Timeframe) -> Result<(), FeedError> {
        validate_symbols(symbols)?;
        {
            let mut subscriptions = self.shared.subscriptions.lock();
            for symbol in symbols {
                subscriptions
                    .entry(symbol.clone())
                    .or_default()
                    .insert(timeframe);
            }
        }
        self.send_command(Command::Subscribe {
            symbols: symbols.to_vec(),
            timeframe,
        });
        Ok(())
    }

    /// Removes `symbols`, at every timeframe, from the subscription set.
    ///
    /// # Errors
    /// Returns an error if the symbol list is empty or contains an invalid symbol.
    pub fn unsubscribe(&self, symbols: &[String]) -> Result<(), FeedError> {
        validate_symbols(symbols)?;
        {
            let mut subscriptions = self.shared.subscriptions.lock();
            for symbol in symbols {
                subscriptions.remove(symbol);
            }
        }
        self.send_command(Command::Unsubscribe {
            symbols: symbols.to_vec(),
        });
        Ok(())
    }

    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.shared.state_tx.borrow().phase == ConnectionPhase::Connected
    }

    #[must_use]
    pub fn state(&self) -> ConnectionState {
        self.shared.state_tx.borrow().clone()
    }

    #[must_use]
    pub fn state_receiver(&self) -> watch::Receiver<ConnectionState> {
        self.shared.state_tx.subscribe()
    }

    #[must_use]
    pub fn events(&self) -> broadcast::Receiver<ConnectionEvent> {
        self.shared.events_tx.subscribe()
    }

    #[must_use]
    pub fn stats(&self) -> FeedStats {
        *self.shared.stats.lock()
    }

    /// Every subscribed (symbol, timeframe) pair as a series id.
    #[must_use]
    pub fn subscribed_series(&self) -> Vec<SeriesId> {
        self.shared.subscribed_series()
    }

    fn send_command(&self, command: Command) {
        if let Some(running) = self.running.lock().as_ref() {
            let _ = running.command_tx.send(command);
        }
    }
}

impl Drop for ConnectionManager {
    fn drop(&mut self) {
        if let Some(running) = self.running.get_mut().take() {
            running.shutdown_tx.send_replace(true);
        }
    }
}

impl Shared {
    fn set_phase(&self, phase: ConnectionPhase) {
        let mut previous = phase;
        self.state_tx.send_modify(|state| {
            previous = state.phase;
            state.phase = phase;
            if phase == ConnectionPhase::Connected {
                state.reconnect_attempt = 0;
            }
        });
        if previous != phase {
            info!(
                exchange = %self.config.exchange,
                from = %previous,
                to = %phase,
                "Connection phase changed"
            );
            self.emit(ConnectionEvent::PhaseChanged(phase));
        }
    }

    fn emit(&self, event: ConnectionEvent) {
        // No receivers is fine.
        let _ = self.events_tx.send(event);
    }

    fn subscribed_series(&self) -> Vec<SeriesId> {
        let exchange = self.normalizer.exchange();
        self.subscriptions
            .lock()
            .iter()
            .flat_map(|(symbol, timeframes)| {
                timeframes
                    .iter()
                    .map(move |tf| SeriesId::new(exchange, symbol, *tf))
            })
            .collect()
    }

    fn is_subscribed(&self, series: &SeriesId) -> bool {
        self.subscriptions
            .lock()
            .get(&series.symbol)
            .is_some_and(|tfs| tfs.contains(&series.timeframe))
    }

    /// Subscribe messages for the whole current subscription set.
    fn handshake_messages(&self) -> Vec<ControlMessage> {
        let subscriptions = self.subscriptions.lock();
        if subscriptions.is_empty() {
            return Vec::new();
        }

        let mut by_timeframe: BTreeMap<Timeframe, Vec<String>> = BTreeMap::new();
        for (symbol, timeframes) in subscriptions.iter() {
            for tf in timeframes {
                by_timeframe.entry(*tf).or_default().push(symbol.clone());
            }
        }

        let mut messages = vec![ControlMessage::subscribe_liveness(
            subscriptions.keys().cloned().collect(),
        )];
        messages.extend(
            by_timeframe
                .into_iter()
                .map(|(tf, symbols)| ControlMessage::subscribe_data(symbols, tf)),
        );
        messages
    }

    /// Write and notify one live candle. Runs off the receive loop, holding a handler permit.
    async fn handle_live(
        self: Arc<Self>,
        _permit: OwnedSemaphorePermit,
        candle: Candle,
        sequence: u64,
        closed: bool,
    ) {
        let series = candle.series_id();
        let timestamp = candle.timestamp;
        let close_time = candle.close_time();
        let threshold = self.reconciler.threshold(series.timeframe);

        let previous = match self.store.latest(&series).await {
            Ok(previous) => previous,
            Err(e) => {
                warn!(series = %series, error = %e, "Failed to read latest candle");
                None
            }
        };

        let request = WriteRequest::live(candle, sequence);
        let notify = closed.then(|| request.clone().into_versioned());
        match self.store.write_if_newer(request).await {
            Ok(true) => {
                self.stats.lock().candles_written += 1;
                if let Some(candle) = notify {
                    self.notify_closed(candle).await;
                }
            }
            Ok(false) => {
                trace!(series = %series, sequence, %timestamp, "Live candle superseded");
            }
            Err(e) => {
                error!(series = %series, error = %e, "Live write failed, flagging for backfill");
                let since = previous.map_or(timestamp, |p| p.timestamp().min(timestamp));
                self.reconciler.gap_flags().raise_since(&series, since);
                self.reconciler.spawn_check(series);
                return;
            }
        }

        let discontinuity = previous
            .map(|p| p.timestamp())
            .filter(|previous| timestamp - *previous > threshold);
        if let Some(previous) = discontinuity {
            info!(
                series = %series,
                %previous,
                %timestamp,
                "Timestamp discontinuity on live stream"
            );
            self.reconciler.gap_flags().raise_since(&series, previous);
            self.reconciler.spawn_check(series);
        } else if closed && self.reconciler.clock().now() - close_time > threshold {
            info!(series = %series, %close_time, "Closed candle lags behind now");
            self.reconciler.spawn_check(series);
        }
    }

    async fn notify_closed(&self, candle: VersionedCandle) {
        let Some(tx) = &self.closed_tx else {
            return;
        };
        let channel = self.store.router().closed_channel(&candle.candle.series_id());
        let _ = tx.send(ClosedCandle { channel, candle }).await;
    }
}

async fn shutdown_requested(rx: &mut watch::Receiver<bool>) {
    // A dropped sender counts as shutdown too.
    let _ = rx.wait_for(|stop| *stop).await;
}

struct ConnectionActor {
    shared: Arc<Shared>,
    shutdown_rx: watch::Receiver<bool>,
    command_rx: mpsc::UnboundedReceiver<Command>,
    first_outcome: Option<oneshot::Sender<Result<(), FeedError>>>,
    watchdog: HeartbeatWatchdog,
    detector: SequenceGapDetector,
    backoff: Backoff,
    attempt: u32,
}

impl ConnectionActor {
    async fn run(mut self) {
        let mut shutdown = self.shutdown_rx.clone();
        info!(exchange = %self.shared.config.exchange, "Connection task started");

        loop {
            self.shared.set_phase(ConnectionPhase::Connecting);
            let established = tokio::select! {
                biased;
                () = shutdown_requested(&mut shutdown) => break,
                result = self.establish() => result,
            };

            match established {
                Ok(session) => {
                    let connection_id = self.on_connected();
                    let reason = self.run_session(session, connection_id, &mut shutdown).await;
                    self.on_disconnected(connection_id, &reason);
                    if reason == DisconnectReason::Requested {
                        break;
                    }
                }
                Err(e) => {
                    warn!(
                        exchange = %self.shared.config.exchange,
                        attempt = self.attempt + 1,
                        error = %e,
                        "Connect attempt failed"
                    );
                    self.resolve_first(Err(e));
                }
            }

            self.attempt = self.attempt.saturating_add(1);
            self.shared.stats.lock().reconnect_attempts += 1;
            let attempt = self.attempt;
            self.shared
                .state_tx
                .send_modify(|state| state.reconnect_attempt = attempt);
            self.shared.set_phase(ConnectionPhase::Reconnecting);

            let delay = self.backoff.delay(attempt);
            info!(attempt, ?delay, "Reconnecting after backoff");
            tokio::select! {
                biased;
                () = shutdown_requested(&mut shutdown) => break,
                () = tokio::time::sleep(delay) => {}
            }
        }

        self.shared.set_phase(ConnectionPhase::Closing);
        self.watchdog.stop();
        self.resolve_first(Err(FeedError::Cancelled));
        self.shared.set_phase(ConnectionPhase::Idle);
        info!(exchange = %self.shared.config.exchange, "Connection task stopped");
    }

    /// Opens the transport and sends the subscribe handshake.
    async fn establish(&mut self) -> Result<Box<dyn Session>, FeedError> {
        let timeout = self.shared.config.handshake_timeout();
        let mut session = match tokio::time::timeout(timeout, self.shared.connector.connect()).await
        {
            Ok(Ok(session)) => session,
            Ok(Err(e)) => return Err(e.into()),
            Err(_) => return Err(TransportError::Timeout(timeout).into()),
        };

        // The handshake sends the whole subscription set, which already includes
        // everything queued so far.
        while self.command_rx.try_recv().is_ok() {}

        let messages = self.shared.handshake_messages();
        let retries = self.shared.config.subscribe_retries.max(1);
        let mut last_error = None;
        for attempt in 1..=retries {
            match send_all(session.as_mut(), &messages).await {
                Ok(()) => return Ok(session),
                Err(e) => {
                    warn!(attempt, error = %e, "Subscribe handshake failed");
                    last_error = Some(e);
                }
            }
        }

        session.close().await;
        let reason = last_error.map_or_else(|| "unknown".to_string(), |e| e.to_string());
        error!(attempts = retries, %reason, "Subscribe handshake exhausted its retry budget");
        Err(FeedError::Handshake {
            attempts: retries,
            reason,
        })
    }

    fn on_connected(&mut self) -> u64 {
        let shared = &self.shared;
        let connection_id = shared.next_connection_id.fetch_add(1, Ordering::Relaxed) + 1;
        let attempt = self.attempt;
        self.attempt = 0;

        self.detector.reset();
        shared.state_tx.send_modify(|state| {
            state.connection_id = connection_id;
            state.last_sequence = 0;
        });
        shared.set_phase(ConnectionPhase::Connected);
        shared.emit(ConnectionEvent::Connected {
            connection_id,
            attempt,
        });
        info!(connection_id, attempt, "Connected");

        // Gaps may have accumulated while disconnected; a first connect has no prior
        // session to reconcile.
        if attempt > 0 {
            for series in shared.subscribed_series() {
                debug!(series = %series, "Checking for staleness after reconnect");
                shared.reconciler.spawn_check(series);
            }
        }

        self.resolve_first(Ok(()));
        connection_id
    }

    fn on_disconnected(&mut self, connection_id: u64, reason: &DisconnectReason) {
        match reason {
            DisconnectReason::Requested => {
                info!(connection_id, "Connection closed on request");
            }
            other => {
                warn!(connection_id, reason = ?other, "Connection lost");
            }
        }
        self.shared.emit(ConnectionEvent::Disconnected {
            connection_id,
            reason: reason.clone(),
        });
    }

    async fn run_session(
        &mut self,
        mut session: Box<dyn Session>,
        connection_id: u64,
        shutdown: &mut watch::Receiver<bool>,
    ) -> DisconnectReason {
        let (force_tx, mut force_rx) = mpsc::channel(1);
        self.watchdog.start(connection_id, force_tx);

        let reason = loop {
            tokio::select! {
                biased;
                () = shutdown_requested(shutdown) => break DisconnectReason::Requested,
                Some(force) = force_rx.recv() => {
                    if force.connection_id == connection_id {
                        break DisconnectReason::WatchdogExpired;
                    }
                }
                Some(command) = self.command_rx.recv() => {
                    if let Err(e) = send_command(session.as_mut(), command).await {
                        break DisconnectReason::Transport(e.to_string());
                    }
                }
                event = session.recv() => match event {
                    Ok(TransportEvent::Text(text)) => {
                        self.watchdog.reset();
                        self.route(connection_id, &text).await;
                    }
                    Ok(TransportEvent::Liveness) => {
                        self.watchdog.reset();
                        self.record_receipt();
                    }
                    Ok(TransportEvent::Closed(reason)) => break DisconnectReason::Remote(reason),
                    Err(e) => break DisconnectReason::Transport(e.to_string()),
                },
            }
        };

        self.watchdog.stop();
        session.close().await;
        reason
    }

    fn record_receipt(&self) {
        self.shared.stats.lock().messages_received += 1;
        let now = self.shared.reconciler.clock().now();
        self.shared
            .state_tx
            .send_modify(|state| state.last_message_at = Some(now));
    }

    async fn route(&mut self, connection_id: u64, text: &str) {
        self.record_receipt();
        match InboundMessage::parse(text) {
            Ok(InboundMessage::Candle(message)) => self.on_candle(connection_id, message).await,
            Ok(InboundMessage::Heartbeat { .. }) => trace!(connection_id, "Heartbeat"),
            Ok(InboundMessage::Subscribed { channel, symbols }) => {
                debug!(connection_id, ?channel, ?symbols, "Subscription confirmed");
            }
            Ok(InboundMessage::Error { code, message }) => {
                warn!(connection_id, ?code, %message, "Feed reported an error");
            }
            Err(e) => {
                self.shared.stats.lock().frames_dropped += 1;
                warn!(connection_id, error = %e, "Dropping malformed frame");
            }
        }
    }

    async fn on_candle(&mut self, connection_id: u64, message: CandleMessage) {
        let shared = &self.shared;
        match self.detector.observe(message.seq) {
            SequenceObservation::Contiguous => {}
            SequenceObservation::Gap(missed) => {
                shared.stats.lock().gaps_detected += 1;
                warn!(connection_id, missed, sequence = message.seq, "Sequence gap detected");
                shared.emit(ConnectionEvent::GapDetected {
                    connection_id,
                    missed,
                });
                for series in shared.subscribed_series() {
                    shared.reconciler.gap_flags().raise(&series);
                    shared.reconciler.spawn_check(series);
                }
            }
            SequenceObservation::Duplicate => {
                shared.stats.lock().duplicates += 1;
                debug!(
                    connection_id,
                    sequence = message.seq,
                    last = self.detector.last_sequence(),
                    "Late duplicate sequence number"
                );
            }
        }
        let last_sequence = self.detector.last_sequence();
        shared
            .state_tx
            .send_modify(|state| state.last_sequence = last_sequence);

        let candle = match shared.normalizer.live(&message) {
            Ok(candle) => candle,
            Err(e) => {
                shared.stats.lock().frames_dropped += 1;
                warn!(connection_id, error = %e, "Dropping candle that failed to normalize");
                return;
            }
        };
        if !shared.is_subscribed(&candle.series_id()) {
            debug!(
                symbol = %candle.symbol,
                timeframe = %candle.timeframe,
                "Ignoring candle for unsubscribed series"
            );
            return;
        }

        // Reading stops while every handler is busy, so a stalled store cannot pile up tasks.
        let Ok(permit) = Arc::clone(&shared.handler_permits).acquire_owned().await else {
            return;
        };
        tokio::spawn(Arc::clone(shared).handle_live(permit, candle, message.seq, message.closed));
    }

    fn resolve_first(&mut self, outcome: Result<(), FeedError>) {
        if let Some(tx) = self.first_outcome.take() {
            let _ = tx.send(outcome);
        }
    }
}

async fn send_all(
    session: &mut dyn Session,
    messages: &[ControlMessage],
) -> Result<(), TransportError> {
    for message in messages {
        let text = message
            .to_json()
            .map_err(|e| TransportError::ConnectFailed(e.to_string()))?;
        session.send(text).await?;
    }
    Ok(())
}

async fn send_command(session: &mut dyn Session, command: Command) -> Result<(), TransportError> {
    let messages = match command {
        Command::Subscribe { symbols, timeframe } => {
            info!(?symbols, %timeframe, "Subscribing");
            vec![
                ControlMessage::subscribe_liveness(symbols.clone()),
                ControlMessage::subscribe_data(symbols, timeframe),
            ]
        }
        Command::Unsubscribe { symbols } => {
            info!(?symbols, "Unsubscribing");
            vec![
                ControlMessage::unsubscribe(ChannelKind::Data, symbols.clone()),
                ControlMessage::unsubscribe(ChannelKind::Liveness, symbols),
            ]
        }
    };
    send_all(session, &messages).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::RestError;
    use crate::rest::HistoricalCandleSource;
    use async_trait::async_trait;
    use candle_sync_core::{ManualClock, ReconciliationConfig};
    use candle_sync_data::{KeyRouter, MemoryBackend, ReadQuery};
    use chrono::TimeZone;
    use std::collections::VecDeque;
    use std::sync::atomic::AtomicU32;
    use std::time::Duration;

    // ============================================
    // Scripted transport
    // ============================================

    /// Test side of one scripted session.
    struct Remote {
        inbound: mpsc::UnboundedSender<Result<TransportEvent, TransportError>>,
        sent: Arc<Mutex<Vec<String>>>,
    }

    impl Remote {
        fn push(&self, text: impl Into<String>) {
            let _ = self.inbound.send(Ok(TransportEvent::Text(text.into())));
        }

        fn close(&self) {
            let _ = self.inbound.send(Ok(TransportEvent::Closed(None)));
        }

        fn sent(&self) -> Vec<String> {
            self.sent.lock().clone()
        }
    }

    struct ScriptedSession {
        inbound: mpsc::UnboundedReceiver<Result<TransportEvent, TransportError>>,
        sent: Arc<Mutex<Vec<String>>>,
        fail_sends: bool,
    }

    #[async_trait]
    impl Session for ScriptedSession {
        async fn send(&mut self, text: String) -> Result<(), TransportError> {
            if self.fail_sends {
                return Err(TransportError::Closed);
            }
            self.sent.lock().push(text);
            Ok(())
        }

        async fn recv(&mut self) -> Result<TransportEvent, TransportError> {
            match self.inbound.recv().await {
                Some(event) => event,
                None => std::future::pending().await,
            }
        }

        async fn close(&mut self) {}
    }

    #[derive(Debug, Default)]
    struct ScriptedConnector {
        sessions: Mutex<VecDeque<Option<ScriptedSessionSlot>>>,
        attempts: AtomicU32,
    }

    #[derive(Debug)]
    struct ScriptedSessionSlot {
        inbound: Mutex<Option<mpsc::UnboundedReceiver<Result<TransportEvent, TransportError>>>>,
        sent: Arc<Mutex<Vec<String>>>,
        fail_sends: bool,
    }

    impl ScriptedConnector {
        /// Queues a session that accepts the next connect.
        fn session(&self) -> Remote {
            self.session_with(false)
        }

        fn session_with(&self, fail_sends: bool) -> Remote {
            let (tx, rx) = mpsc::unbounded_channel();
            let sent = Arc::new(Mutex::new(Vec::new()));
            self.sessions.lock().push_back(Some(ScriptedSessionSlot {
                inbound: Mutex::new(Some(rx)),
                sent: Arc::clone(&sent),
                fail_sends,
            }));
            Remote { inbound: tx, sent }
        }

        /// Queues a refused connect.
        fn refuse(&self) {
            self.sessions.lock().push_back(None);
        }

        fn attempts(&self) -> u32 {
            self.attempts.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl Connector for ScriptedConnector {
        async fn connect(&self) -> Result<Box<dyn Session>, TransportError> {
            self.attempts.fetch_add(1, Ordering::SeqCst);
            let slot = self.sessions.lock().pop_front().flatten();
            let Some(slot) = slot else {
                return Err(TransportError::ConnectFailed("connection refused".into()));
            };
            let inbound = slot
                .inbound
                .lock()
                .take()
                .ok_or_else(|| TransportError::ConnectFailed("session reused".into()))?;
            Ok(Box::new(ScriptedSession {
                inbound,
                sent: slot.sent,
                fail_sends: slot.fail_sends,
            }))
        }
    }

    #[derive(Debug, Default)]
    struct EmptySource;

    #[async_trait]
    impl HistoricalCandleSource for EmptySource {
        async fn fetch_candles(
            &self,
            _series: &SeriesId,
            _start: DateTime<Utc>,
            _end: DateTime<Utc>,
            _limit: usize,
        ) -> Result<Vec<Candle>, RestError> {
            Ok(Vec::new())
        }
    }

    /// Empty history that records which series were asked for.
    #[derive(Debug, Default)]
    struct RecordingSource {
        requested: Mutex<Vec<String>>,
    }

    impl RecordingSource {
        fn requested(&self) -> Vec<String> {
            let mut requested = self.requested.lock().clone();
            requested.sort();
            requested
        }
    }

    #[async_trait]
    impl HistoricalCandleSource for RecordingSource {
        async fn fetch_candles(
            &self,
            series: &SeriesId,
            _start: DateTime<Utc>,
            _end: DateTime<Utc>,
            _limit: usize,
        ) -> Result<Vec<Candle>, RestError> {
            self.requested.lock().push(series.symbol.clone());
            Ok(Vec::new())
        }
    }

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 1, 30, 12, 0, 0).unwrap()
    }

    fn feed_config() -> FeedConfig {
        FeedConfig {
            reconnect_base_delay_ms: 10,
            reconnect_max_delay_ms: 40,
            reconnect_jitter: 0.0,
            handshake_timeout_ms: 1_000,
            ..FeedConfig::default()
        }
    }

    fn manager(connector: &Arc<ScriptedConnector>) -> (ConnectionManager, VersionedCandleStore) {
        let clock = Arc::new(ManualClock::new(t0()));
        let store = VersionedCandleStore::new(
            Arc::new(MemoryBackend::with_clock(clock.clone())),
            KeyRouter::shared(),
            5_000,
            chrono::Duration::days(7),
        );
        let reconciler = ReconciliationService::new(
            ReconciliationConfig::default(),
            Arc::new(EmptySource),
            store.clone(),
            clock,
            None,
        );
        let manager = ConnectionManager::new(
            feed_config(),
            connector.clone(),
            store.clone(),
            reconciler,
            None,
        );
        (manager, store)
    }

    /// Manager whose store already holds one candle per series at `t0`, an hour before now.
    async fn stale_manager(
        connector: &Arc<ScriptedConnector>,
        source: &Arc<RecordingSource>,
        tracked: &[&str],
    ) -> ConnectionManager {
        let clock = Arc::new(ManualClock::new(t0() + chrono::Duration::hours(1)));
        let store = VersionedCandleStore::new(
            Arc::new(MemoryBackend::with_clock(clock.clone())),
            KeyRouter::shared(),
            5_000,
            chrono::Duration::days(7),
        );
        for (seq, symbol) in (1..).zip(tracked) {
            let candle = Candle {
                exchange: "binance".to_string(),
                symbol: (*symbol).to_string(),
                timeframe: Timeframe::FiveMinutes,
                timestamp: t0(),
                open: rust_decimal::Decimal::ONE,
                high: rust_decimal::Decimal::ONE,
                low: rust_decimal::Decimal::ONE,
                close: rust_decimal::Decimal::ONE,
                volume: rust_decimal::Decimal::ONE,
                is_synthetic: false,
            };
            store.write_if_newer(WriteRequest::live(candle, seq)).await.unwrap();
        }
        let reconciler = ReconciliationService::new(
            ReconciliationConfig::default(),
            source.clone(),
            store.clone(),
            clock,
            None,
        );
        let manager =
            ConnectionManager::new(feed_config(), connector.clone(), store, reconciler, None);
        manager.subscribe(&symbols(tracked), Timeframe::FiveMinutes).unwrap();
        manager
    }

    fn symbols(list: &[&str]) -> Vec<String> {
        list.iter().map(ToString::to_string).collect()
    }

    fn candle_frame(seq: u64, symbol: &str, minutes: i64) -> String {
        let t = (t0() + chrono::Duration::minutes(minutes)).timestamp_millis();
        format!(
            r#"{{"type":"candle","seq":{seq},"symbol":"{symbol}","timeframe":"5m","t":{t},"o":"1","h":"2","l":"0.5","c":"1.5","v":"3","closed":true}}"#
        )
    }

    async fn wait_for_phase(manager: &ConnectionManager, phase: ConnectionPhase) {
        let mut rx = manager.state_receiver();
        tokio::time::timeout(Duration::from_secs(5), rx.wait_for(|s| s.phase == phase))
            .await
            .expect("phase not reached")
            .unwrap();
    }

    async fn wait_until(mut condition: impl FnMut() -> bool) {
        for _ in 0..500 {
            if condition() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("condition not met in time");
    }

    // ============================================
    // Lifecycle Tests
    // ============================================

    #[tokio::test]
    async fn test_connect_sends_handshake() {
        let connector = Arc::new(ScriptedConnector::default());
        let remote = connector.session();
        let (manager, _) = manager(&connector);
        manager
            .subscribe(&symbols(&["BTCUSDT", "ETHUSDT"]), Timeframe::FiveMinutes)
            .unwrap();

        manager.connect().await.unwrap();
        assert!(manager.is_connected());
        assert_eq!(manager.state().connection_id, 1);

        let sent = remote.sent();
        assert_eq!(sent.len(), 2);
        assert!(sent[0].contains(r#""channel":"liveness""#));
        assert!(sent[1].contains(r#""channel":"data""#));
        assert!(sent[1].contains(r#""timeframe":"5m""#));
        assert!(sent[1].contains("ETHUSDT"));

        manager.disconnect().await;
        assert!(!manager.is_connected());
        assert_eq!(manager.state().phase, ConnectionPhase::Idle);
    }

    #[tokio::test]
    async fn test_disconnect_is_idempotent() {
        let connector = Arc::new(ScriptedConnector::default());
        let _remote = connector.session();
        let (manager, _) = manager(&connector);

        manager.disconnect().await;
        manager.connect().await.unwrap();
        manager.disconnect().await;
        manager.disconnect().await;
        assert_eq!(manager.state().phase, ConnectionPhase::Idle);
        assert_eq!(connector.attempts(), 1);
    }

    #[tokio::test]
    async fn test_connect_while_running_is_noop() {
        let connector = Arc::new(ScriptedConnector::default());
        let _remote = connector.session();
        let (manager, _) = manager(&connector);

        manager.connect().await.unwrap();
        manager.connect().await.unwrap();
        assert_eq!(connector.attempts(), 1);
        manager.disconnect().await;
    }

    #[tokio::test]
    async fn test_subscribe_validation() {
        let connector = Arc::new(ScriptedConnector::default());
        let (manager, _) = manager(&connector);
        assert!(matches!(
            manager.subscribe(&[], Timeframe::OneMinute),
            Err(FeedError::Validation(_))
        ));
        assert!(manager.unsubscribe(&symbols(&["a:b"])).is_err());
        assert!(manager.subscribed_series().is_empty());
    }

    #[tokio::test]
    async fn test_incremental_subscribe_while_connected() {
        let connector = Arc::new(ScriptedConnector::default());
        let remote = connector.session();
        let (manager, _) = manager(&connector);
        manager.connect().await.unwrap();
        assert!(remote.sent().is_empty());

        manager
            .subscribe(&symbols(&["SOLUSDT"]), Timeframe::OneMinute)
            .unwrap();
        wait_until(|| remote.sent().len() == 2).await;
        assert!(remote.sent()[1].contains(r#""timeframe":"1m""#));

        manager.unsubscribe(&symbols(&["SOLUSDT"])).unwrap();
        wait_until(|| remote.sent().len() == 4).await;
        assert!(remote.sent()[2].contains(r#""op":"unsubscribe""#));
        assert!(manager.subscribed_series().is_empty());

        manager.disconnect().await;
    }

    #[tokio::test]
    async fn test_first_connect_failure_keeps_retrying() {
        let connector = Arc::new(ScriptedConnector::default());
        connector.refuse();
        let _remote = connector.session();
        let (manager, _) = manager(&connector);

        let err = manager.connect().await.unwrap_err();
        assert!(matches!(err, FeedError::Connection(_)));

        wait_for_phase(&manager, ConnectionPhase::Connected).await;
        assert_eq!(manager.state().reconnect_attempt, 0);
        assert_eq!(connector.attempts(), 2);
        manager.disconnect().await;
    }

    #[tokio::test]
    async fn test_handshake_failure_surfaces_once() {
        let connector = Arc::new(ScriptedConnector::default());
        let _broken = connector.session_with(true);
        let (manager, _) = manager(&connector);
        manager
            .subscribe(&symbols(&["BTCUSDT"]), Timeframe::FiveMinutes)
            .unwrap();

        let err = manager.connect().await.unwrap_err();
        assert!(matches!(err, FeedError::Handshake { attempts: 3, .. }));

        // Folded into the reconnect cycle.
        let _remote = connector.session();
        wait_for_phase(&manager, ConnectionPhase::Connected).await;
        manager.disconnect().await;
    }

    #[tokio::test]
    async fn test_disconnect_during_backoff_stops_retrying() {
        let connector = Arc::new(ScriptedConnector::default());
        let (manager, _) = manager(&connector);

        assert!(manager.connect().await.is_err());
        wait_until(|| connector.attempts() >= 2).await;
        manager.disconnect().await;
        assert_eq!(manager.state().phase, ConnectionPhase::Idle);

        let attempts = connector.attempts();
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(connector.attempts(), attempts);
    }

    // ============================================
    // Reconnect Reconciliation Tests
    // ============================================

    #[tokio::test]
    async fn test_first_connect_does_not_reconcile() {
        let connector = Arc::new(ScriptedConnector::default());
        let _remote = connector.session();
        let source = Arc::new(RecordingSource::default());
        let manager = stale_manager(&connector, &source, &["BTCUSDT", "ETHUSDT"]).await;

        manager.connect().await.unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;

        assert!(source.requested().is_empty());
        manager.disconnect().await;
    }

    #[tokio::test]
    async fn test_reconnect_reconciles_every_subscribed_series() {
        let connector = Arc::new(ScriptedConnector::default());
        let first = connector.session();
        let _second = connector.session();
        let source = Arc::new(RecordingSource::default());
        let manager = stale_manager(&connector, &source, &["BTCUSDT", "ETHUSDT"]).await;

        manager.connect().await.unwrap();
        first.close();
        wait_until(|| manager.state().connection_id == 2 && manager.is_connected()).await;

        // No live candle arrives on the new connection; staleness alone drives it.
        wait_until(|| source.requested().len() == 2).await;
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(source.requested(), symbols(&["BTCUSDT", "ETHUSDT"]));
        assert_eq!(manager.stats().candles_written, 0);
        manager.disconnect().await;
    }

    // ============================================
    // Message Routing Tests
    // ============================================

    #[tokio::test]
    async fn test_reading_pauses_while_handlers_are_busy() {
        let connector = Arc::new(ScriptedConnector::default());
        let remote = connector.session();
        let (manager, _) = manager(&connector);
        manager
            .subscribe(&symbols(&["BTCUSDT"]), Timeframe::FiveMinutes)
            .unwrap();
        manager.connect().await.unwrap();

        let permits = Arc::clone(&manager.shared.handler_permits);
        let all = u32::try_from(permits.available_permits()).unwrap();
        let held = permits.acquire_many_owned(all).await.unwrap();

        for seq in 1..=3 {
            remote.push(candle_frame(seq, "BTCUSDT", 5 * i64::try_from(seq).unwrap()));
        }
        wait_until(|| manager.stats().messages_received == 1).await;
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(manager.stats().messages_received, 1);
        assert_eq!(manager.stats().candles_written, 0);

        drop(held);
        wait_until(|| manager.stats().candles_written == 3).await;
        assert_eq!(manager.stats().messages_received, 3);
        manager.disconnect().await;
    }

    #[tokio::test]
    async fn test_live_candles_written() {
        let connector = Arc::new(ScriptedConnector::default());
        let remote = connector.session();
        let (manager, store) = manager(&connector);
        manager
            .subscribe(&symbols(&["BTCUSDT"]), Timeframe::FiveMinutes)
            .unwrap();
        manager.connect().await.unwrap();

        remote.push(candle_frame(1, "BTCUSDT", 0));
        remote.push(candle_frame(2, "BTCUSDT", 5));
        remote.push(candle_frame(3, "DOGEUSDT", 5));
        wait_until(|| manager.stats().candles_written == 2).await;

        let series = SeriesId::new("binance", "BTCUSDT", Timeframe::FiveMinutes);
        let candles = store.read(&series, ReadQuery::Latest(10)).await.unwrap();
        assert_eq!(candles.len(), 2);
        assert_eq!(candles[1].sequence(), Some(2));
        assert_eq!(manager.state().last_sequence, 3);
        assert_eq!(manager.stats().messages_received, 3);

        manager.disconnect().await;
    }

    #[tokio::test]
    async fn test_malformed_frame_dropped_without_reconnect() {
        let connector = Arc::new(ScriptedConnector::default());
        let remote = connector.session();
        let (manager, _) = manager(&connector);
        manager
            .subscribe(&symbols(&["BTCUSDT"]), Timeframe::FiveMinutes)
            .unwrap();
        manager.connect().await.unwrap();

        remote.push("{not json");
        remote.push(r#"{"type":"candle","seq":1,"symbol":"BTCUSDT","timeframe":"7m","t":0,"o":"1","h":"1","l":"1","c":"1","v":"1"}"#);
        remote.push(candle_frame(2, "BTCUSDT", 0));
        wait_until(|| manager.stats().candles_written == 1).await;

        assert_eq!(manager.stats().frames_dropped, 2);
        assert!(manager.is_connected());
        assert_eq!(connector.attempts(), 1);
        manager.disconnect().await;
    }

    #[tokio::test]
    async fn test_gap_detected_and_reset_per_connection() {
        let connector = Arc::new(ScriptedConnector::default());
        let first = connector.session();
        let second = connector.session();
        let (manager, _) = manager(&connector);
        let mut events = manager.events();
        manager
            .subscribe(&symbols(&["BTCUSDT"]), Timeframe::FiveMinutes)
            .unwrap();
        manager.connect().await.unwrap();

        first.push(candle_frame(1, "BTCUSDT", 0));
        first.push(candle_frame(2, "BTCUSDT", 5));
        first.push(candle_frame(5, "BTCUSDT", 10));
        wait_until(|| manager.stats().gaps_detected == 1).await;

        first.close();
        wait_until(|| manager.state().connection_id == 2 && manager.is_connected()).await;
        second.push(candle_frame(1, "BTCUSDT", 15));
        wait_until(|| manager.state().last_sequence == 1).await;

        assert_eq!(manager.stats().gaps_detected, 1);
        assert_eq!(manager.stats().reconnect_attempts, 1);

        let mut saw_gap = false;
        let mut saw_remote_close = false;
        while let Ok(event) = events.try_recv() {
            match event {
                ConnectionEvent::GapDetected { missed, .. } => {
                    assert_eq!(missed, 2);
                    saw_gap = true;
                }
                ConnectionEvent::Disconnected {
                    connection_id: 1,
                    reason: DisconnectReason::Remote(None),
                } => saw_remote_close = true,
                _ => {}
            }
        }
        assert!(saw_gap);
        assert!(saw_remote_close);
        manager.disconnect().await;
    }

    #[tokio::test]
    async fn test_closed_candle_notification() {
        let connector = Arc::new(ScriptedConnector::default());
        let remote = connector.session();
        let clock = Arc::new(ManualClock::new(t0() + chrono::Duration::minutes(5)));
        let store = VersionedCandleStore::new(
            Arc::new(MemoryBackend::new()),
            KeyRouter::shared(),
            100,
            chrono::Duration::days(7),
        );
        let reconciler = ReconciliationService::new(
            ReconciliationConfig::default(),
            Arc::new(EmptySource),
            store.clone(),
            clock,
            None,
        );
        let (closed_tx, mut closed_rx) = mpsc::channel(8);
        let manager = ConnectionManager::new(
            feed_config(),
            connector.clone(),
            store,
            reconciler,
            Some(closed_tx),
        );
        manager
            .subscribe(&symbols(&["BTCUSDT"]), Timeframe::FiveMinutes)
            .unwrap();
        manager.connect().await.unwrap();

        remote.push(candle_frame(1, "BTCUSDT", 0));
        let closed = tokio::time::timeout(Duration::from_secs(5), closed_rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(closed.channel, "shared:binance:BTCUSDT:5m:closed");
        assert_eq!(closed.candle.timestamp(), t0());
        manager.disconnect().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_watchdog_expiry_forces_reconnect() {
        let connector = Arc::new(ScriptedConnector::default());
        let _stalled = connector.session();
        let _fresh = connector.session();
        let (manager, _) = manager(&connector);
        let mut events = manager.events();
        manager.connect().await.unwrap();

        // Silent for longer than the 30s interval.
        tokio::time::sleep(Duration::from_secs(31)).await;
        wait_until(|| manager.state().connection_id == 2).await;

        let mut reason = None;
        while let Ok(event) = events.try_recv() {
            if let ConnectionEvent::Disconnected { reason: r, .. } = event {
                reason = Some(r);
                break;
            }
        }
        assert_eq!(reason, Some(DisconnectReason::WatchdogExpired));
        manager.disconnect().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_heartbeats_keep_connection_alive() {
        let connector = Arc::new(ScriptedConnector::default());
        let remote = connector.session();
        let (manager, _) = manager(&connector);
        manager.connect().await.unwrap();

        for _ in 0..5 {
            tokio::time::sleep(Duration::from_secs(20)).await;
            remote.push(r#"{"type":"heartbeat"}"#);
        }
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(manager.state().connection_id, 1);
        assert!(manager.is_connected());
        manager.disconnect().await;
    }
}
