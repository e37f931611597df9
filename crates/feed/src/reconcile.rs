//! REST backfill through the same versioned write path as live candles.
//!
//! A series is reconciled when its most recent stored candle is older than the
//! backfill threshold (`max(bar width, min_gap)`), or when its sticky gap flag is set.
//! A trigger that arrives while a pass for the same series is running is folded into
//! it: the running pass goes round once more before it releases the series.

use chrono::{DateTime, Duration, Utc};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use candle_sync_core::{
    Candle, ClosedCandle, Clock, ReconciliationConfig, SeriesId, Timeframe, VersionedCandle,
    WriteRequest,
};
use candle_sync_data::VersionedCandleStore;

use crate::backoff::Backoff;
use crate::error::{FeedError, RestError};
use crate::gap::GapFlags;
use crate::rest::HistoricalCandleSource;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackfillOutcome {
    /// The requested range was fetched in full.
    Complete,
    /// The range reached past the maximum lookback; only the recent part was fetched.
    LookbackExceeded,
}

/// Summary of one backfill pass.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackfillReport {
    pub series: SeriesId,
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    pub pages: u32,
    pub fetched: usize,
    pub written: usize,
    /// Candles rejected by the store because a more authoritative value was present.
    pub discarded: usize,
    pub rate_limit_retries: u32,
    pub outcome: BackfillOutcome,
}

impl BackfillReport {
    fn new(series: SeriesId, start: DateTime<Utc>, end: DateTime<Utc>) -> Self {
        Self {
            series,
            start,
            end,
            pages: 0,
            fetched: 0,
            written: 0,
            discarded: 0,
            rate_limit_retries: 0,
            outcome: BackfillOutcome::Complete,
        }
    }
}

struct Inner {
    config: ReconciliationConfig,
    source: Arc<dyn HistoricalCandleSource>,
    store: VersionedCandleStore,
    clock: Arc<dyn Clock>,
    gap_flags: Arc<GapFlags>,
    /// Series with a pass running, mapped to whether another trigger arrived meanwhile.
    in_flight: Mutex<HashMap<SeriesId, bool>>,
    closed_tx: Option<mpsc::Sender<ClosedCandle>>,
}

/// Cheap to clone; clones share in-flight tracking and gap flags.
#[derive(Clone)]
pub struct ReconciliationService {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for ReconciliationService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReconciliationService")
            .field("source", &self.inner.source)
            .field("in_flight", &self.inner.in_flight.lock().len())
            .finish_non_exhaustive()
    }
}

/// Exclusive right to reconcile one series. Released on drop, however the pass ends.
struct InFlightClaim<'a> {
    in_flight: &'a Mutex<HashMap<SeriesId, bool>>,
    series: SeriesId,
    held: bool,
}

impl InFlightClaim<'_> {
    /// Returns `true` and keeps the claim when another pass is needed, either because a
    /// trigger was folded in or `pending` is set. Otherwise releases the claim.
    ///
    /// Both happen under the in-flight lock, so a trigger is either seen here or
    /// claims the series itself.
    fn rerun_or_release(&mut self, pending: bool) -> bool {
        let mut in_flight = self.in_flight.lock();
        let requested = in_flight
            .get_mut(&self.series)
            .is_some_and(std::mem::take);
        if requested || pending {
            return true;
        }
        in_flight.remove(&self.series);
        self.held = false;
        false
    }
}

impl Drop for InFlightClaim<'_> {
    fn drop(&mut self) {
        if self.held {
            self.in_flight.lock().remove(&self.series);
        }
    }
}

impl ReconciliationService {
    /// `closed_tx` receives a [`ClosedCandle`] for every closed bar backfill writes.
    pub fn new(
        config: ReconciliationConfig,
        source: Arc<dyn HistoricalCandleSource>,
        store: VersionedCandleStore,
        clock: Arc<dyn Clock>,
        closed_tx: Option<mpsc::Sender<ClosedCandle>>,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                config,
                source,
                store,
                clock,
                gap_flags: Arc::new(GapFlags::new()),
                in_flight: Mutex::new(HashMap::new()),
                closed_tx,
            }),
        }
    }

    #[must_use]
    pub fn gap_flags(&self) -> &Arc<GapFlags> {
        &self.inner.gap_flags
    }

    #[must_use]
    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.inner.clock
    }

    /// Staleness strictly above this triggers a backfill.
    ///
    /// Never below `min_gap`, so with the default 300 s a 1m or 3m series needs more
    /// than five minutes of staleness. Set `min_gap_secs = 0` for a strict one-bar rule.
    #[must_use]
    pub fn threshold(&self, timeframe: Timeframe) -> Duration {
        timeframe.duration().max(self.inner.config.min_gap())
    }

    #[must_use]
    pub fn is_in_flight(&self, series: &SeriesId) -> bool {
        self.inner.in_flight.lock().contains_key(series)
    }

    /// Runs [`check_and_backfill`](Self::check_and_backfill) on a separate task so the
    /// caller never waits on REST I/O.
    ///
    /// A failed pass is retried with capped exponential backoff until one succeeds; a
    /// rate-limited range is never given up on.
    pub fn spawn_check(&self, series: SeriesId) {
        let service = self.clone();
        tokio::spawn(async move {
            let config = &service.inner.config;
            let backoff = Backoff::new(config.rate_limit_backoff(), config.retry_max_delay(), 0.0);
            let mut attempt = 0u32;
            while let Err(e) = service.check_and_backfill(&series).await {
                attempt = attempt.saturating_add(1);
                let delay = backoff.delay(attempt);
                warn!(
                    series = %series,
                    error = %e,
                    attempt,
                    ?delay,
                    "Reconciliation failed, retrying"
                );
                tokio::time::sleep(delay).await;
            }
        });
    }

    /// Backfills `series` if it is stale or flagged.
    ///
    /// Returns `None` when nothing was needed or a pass for the series is already
    /// running. In the latter case the running pass repeats once it finishes, so the
    /// trigger is not lost.
    ///
    /// # Errors
    /// Returns an error if the store or REST source fails; the gap flag stays set.
    pub async fn check_and_backfill(
        &self,
        series: &SeriesId,
    ) -> Result<Option<BackfillReport>, FeedError> {
        let Some(mut claim) = self.try_claim(series) else {
            debug!(series = %series, "Reconciliation in flight, marked for rerun");
            return Ok(None);
        };

        let mut last = None;
        loop {
            if let Some(report) = self.reconcile_once(series).await? {
                last = Some(report);
            }
            let pending = self.inner.gap_flags.is_raised(series);
            if !claim.rerun_or_release(pending) {
                return Ok(last);
            }
            debug!(series = %series, "Triggered again during pass, rerunning");
        }
    }

    async fn reconcile_once(
        &self,
        series: &SeriesId,
    ) -> Result<Option<BackfillReport>, FeedError> {
        let flags = &self.inner.gap_flags;
        let generation = flags.generation(series);
        let flagged = flags.is_raised(series);

        let now = self.inner.clock.now();
        let bar = series.timeframe.duration();
        let threshold = self.threshold(series.timeframe);
        let latest = self.inner.store.latest(series).await?;

        let start = match (&latest, flagged) {
            (Some(latest), _) if now - latest.timestamp() > threshold => {
                info!(
                    series = %series,
                    latest = %latest.timestamp(),
                    staleness_secs = (now - latest.timestamp()).num_seconds(),
                    "Series stale, backfilling"
                );
                latest.timestamp()
            }
            (Some(latest), true) => {
                let start = flags
                    .since(series)
                    .map_or(latest.timestamp() - bar, |since| {
                        since.min(latest.timestamp() - bar)
                    });
                info!(series = %series, %start, "Gap flag set, backfilling");
                start
            }
            (None, true) => {
                info!(series = %series, "Gap flag set on empty series, backfilling lookback");
                now - self.inner.config.max_lookback()
            }
            _ => {
                debug!(series = %series, "Series fresh, no backfill needed");
                return Ok(None);
            }
        };

        let report = self.backfill_range(series, start, now).await?;
        flags.clear_through(series, generation);
        Ok(Some(report))
    }

    /// Fetches and writes `[start, end]` for `series`, paging until covered.
    ///
    /// # Errors
    /// Returns an error if the store or REST source fails.
    pub async fn backfill(
        &self,
        series: &SeriesId,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<BackfillReport, FeedError> {
        self.backfill_range(series, start, end).await
    }

    /// Claims `series`, or marks the running pass for a rerun and returns `None`.
    fn try_claim(&self, series: &SeriesId) -> Option<InFlightClaim<'_>> {
        let mut in_flight = self.inner.in_flight.lock();
        if let Some(rerun) = in_flight.get_mut(series) {
            *rerun = true;
            return None;
        }
        in_flight.insert(series.clone(), false);
        Some(InFlightClaim {
            in_flight: &self.inner.in_flight,
            series: series.clone(),
            held: true,
        })
    }

    async fn backfill_range(
        &self,
        series: &SeriesId,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<BackfillReport, FeedError> {
        let config = &self.inner.config;
        let now = self.inner.clock.now();
        let floor = series.timeframe.align(now - config.max_lookback());
        let bar = series.timeframe.duration();

        let mut report = BackfillReport::new(series.clone(), start, end);
        let mut cursor = series.timeframe.align(start);
        if cursor < floor {
            report.outcome = BackfillOutcome::LookbackExceeded;
            cursor = floor;
        }

        while cursor <= end {
            let page = self.fetch_page(series, cursor, end, &mut report).await?;
            report.pages += 1;
            report.fetched += page.len();

            let mut last_seen = None;
            for candle in page {
                if candle.series_id() != *series
                    || candle.timestamp < cursor
                    || candle.timestamp > end
                {
                    continue;
                }
                last_seen = last_seen.max(Some(candle.timestamp));
                let closed = candle.close_time() <= now;
                let request = WriteRequest::backfill(candle);
                let notify = closed.then(|| request.clone().into_versioned());
                if self.inner.store.write_if_newer(request).await? {
                    report.written += 1;
                    if let Some(candle) = notify {
                        self.notify_closed(candle).await;
                    }
                } else {
                    report.discarded += 1;
                }
            }

            let Some(last) = last_seen else {
                break;
            };
            let next = last + bar;
            if next <= cursor {
                break;
            }
            cursor = next;
        }

        match report.outcome {
            BackfillOutcome::LookbackExceeded => error!(
                series = %series,
                requested_start = %start,
                lookback_floor = %floor,
                written = report.written,
                "Gap beyond maximum lookback, history before floor not recovered"
            ),
            BackfillOutcome::Complete => info!(
                series = %series,
                pages = report.pages,
                written = report.written,
                discarded = report.discarded,
                "Backfill complete"
            ),
        }
        Ok(report)
    }

    async fn fetch_page(
        &self,
        series: &SeriesId,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        report: &mut BackfillReport,
    ) -> Result<Vec<Candle>, FeedError> {
        let config = &self.inner.config;
        let mut retries = 0u32;
        loop {
            match self
                .inner
                .source
                .fetch_candles(series, start, end, config.page_size)
                .await
            {
                Ok(page) => return Ok(page),
                Err(RestError::RateLimited { retry_after })
                    if retries < config.rate_limit_retries =>
                {
                    retries += 1;
                    report.rate_limit_retries += 1;
                    let delay = retry_after.max(config.rate_limit_backoff() * retries);
                    warn!(
                        series = %series,
                        attempt = retries,
                        ?delay,
                        "Rate limited, retrying same range"
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    async fn notify_closed(&self, candle: VersionedCandle) {
        let Some(tx) = &self.inner.closed_tx else {
            return;
        };
        let channel = self
            .inner
            .store
            .router()
            .closed_channel(&candle.candle.series_id());
        let _ = tx.send(ClosedCandle { channel, candle }).await;
    }
}
