//! Position tracking.
//!
//! Turns a noisy, possibly frequent stream of raw device samples into a
//! de-duplicated stream of accepted positions:
//!
//! 1. Samples whose accuracy radius exceeds the threshold are dropped.
//! 2. A sample is accepted only if it is the first one or lies at least the
//!    significant-move distance from the last **accepted** position.
//! 3. Every accepted sample becomes `current`, the old `current` becomes
//!    `previous`, and a [`PositionUpdate`] is published.
//!
//! The tracker also owns the singleton watch on the device location service
//! and the cadence (normal vs reduced power) it requests.

use std::sync::Arc;

use chrono::{Duration, NaiveDateTime};
use log::{debug, info, warn};
use serde::Serialize;

use crate::collaborators::{AcquisitionOptions, ActionExecutor, LocationSource, SampleReceiver, WatchId};
use crate::decision::SuggestionAction;
use crate::events::{Event, EventBus, PositionUpdate};
use crate::geo_utils::distance_m;
use crate::schedule::Ticker;
use crate::{EngineError, LocationError, Position, TrackerConfig};

/// Coarse signal quality derived from the current position's accuracy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SignalQuality {
    /// ≤ 10 m
    Excellent,
    /// ≤ 20 m
    Good,
    /// ≤ 50 m
    Fair,
    Poor,
    /// No accepted position yet
    Unknown,
}

impl SignalQuality {
    pub fn from_accuracy(accuracy_m: f64) -> Self {
        if accuracy_m <= 10.0 {
            SignalQuality::Excellent
        } else if accuracy_m <= 20.0 {
            SignalQuality::Good
        } else if accuracy_m <= 50.0 {
            SignalQuality::Fair
        } else {
            SignalQuality::Poor
        }
    }
}

/// Acquisition cadence / accuracy trade-off requested from the device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PowerMode {
    Normal,
    ReducedPower,
}

/// Summary over the rolling accuracy history.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AccuracyStats {
    pub average: f64,
    pub min: f64,
    pub max: f64,
    pub count: usize,
    pub latest: f64,
    /// Capture time of the latest sample
    pub latest_at: NaiveDateTime,
}

/// By-value view of the tracker for other components.
#[derive(Debug, Clone, PartialEq)]
pub struct TrackerSnapshot {
    pub current: Option<Position>,
    pub previous: Option<Position>,
    pub signal_quality: SignalQuality,
    pub mode: PowerMode,
    pub tracking: bool,
    pub stale: bool,
}

#[derive(Debug, Clone, Copy)]
struct AccuracyEntry {
    accuracy_m: f64,
    at: NaiveDateTime,
}

struct ActiveWatch {
    id: WatchId,
    samples: SampleReceiver,
}

pub struct PositionTracker {
    config: TrackerConfig,
    source: Arc<dyn LocationSource>,
    bus: EventBus,
    current: Option<Position>,
    previous: Option<Position>,
    accuracy_history: Vec<AccuracyEntry>,
    mode: PowerMode,
    watch: Option<ActiveWatch>,
    /// Fallback one-shot refresh at the requested cadence
    refresh: Ticker,
    stale: bool,
    last_error: Option<LocationError>,
    /// A mode switch lost the watch and could not restore it
    resubscribe_pending: bool,
}

impl PositionTracker {
    pub fn new(config: TrackerConfig, source: Arc<dyn LocationSource>, bus: EventBus) -> Self {
        let refresh = Ticker::from_secs(config.normal_interval_secs);
        Self {
            config,
            source,
            bus,
            current: None,
            previous: None,
            accuracy_history: Vec::new(),
            mode: PowerMode::Normal,
            watch: None,
            refresh,
            stale: false,
            last_error: None,
            resubscribe_pending: false,
        }
    }

    // ------------------------------------------------------------------------
    // Subscription management
    // ------------------------------------------------------------------------

    /// Options matching the current power mode.
    pub fn acquisition_options(&self) -> AcquisitionOptions {
        let (high_accuracy, interval_secs) = match self.mode {
            PowerMode::Normal => (true, self.config.normal_interval_secs),
            PowerMode::ReducedPower => (false, self.config.reduced_interval_secs),
        };
        AcquisitionOptions {
            high_accuracy,
            timeout_ms: self.config.timeout_ms,
            max_age_ms: self.config.max_age_ms,
            interval_secs,
        }
    }

    /// Establish the watch. Calling while already tracking is a no-op.
    pub fn start_tracking(&mut self, now: NaiveDateTime) -> Result<(), EngineError> {
        if self.watch.is_some() {
            debug!("[PositionTracker] Already tracking");
            return Ok(());
        }

        let options = self.acquisition_options();
        match self.source.watch_position(&options) {
            Ok((id, samples)) => {
                self.watch = Some(ActiveWatch { id, samples });
                self.resubscribe_pending = false;
                self.refresh = Ticker::from_secs(options.interval_secs);
                self.refresh.start_delayed(now);
                info!(
                    "[PositionTracker] Tracking started ({:?}, every {}s, high accuracy: {})",
                    self.mode, options.interval_secs, options.high_accuracy
                );
                Ok(())
            }
            Err(err) => {
                self.report_error(&err);
                Err(err.into())
            }
        }
    }

    /// Tear down the watch and the refresh timer. Idempotent.
    pub fn stop_tracking(&mut self) {
        if let Some(watch) = self.watch.take() {
            self.source.clear_watch(watch.id);
            info!("[PositionTracker] Tracking stopped");
        }
        self.resubscribe_pending = false;
        self.refresh.stop();
    }

    pub fn is_tracking(&self) -> bool {
        self.watch.is_some()
    }

    pub fn mode(&self) -> PowerMode {
        self.mode
    }

    pub fn enable_reduced_power_mode(&mut self, now: NaiveDateTime) -> Result<(), EngineError> {
        self.set_mode(PowerMode::ReducedPower, now)
    }

    pub fn enable_normal_mode(&mut self, now: NaiveDateTime) -> Result<(), EngineError> {
        self.set_mode(PowerMode::Normal, now)
    }

    /// Switching mode re-subscribes: the old watch is cleared before the new
    /// one is established, so no samples arrive in between.
    ///
    /// If the new watch cannot be established the previous mode is restored
    /// and re-subscribed. Should that fail too, the tracker keeps the previous
    /// mode and the next switch attempt subscribes again.
    fn set_mode(&mut self, mode: PowerMode, now: NaiveDateTime) -> Result<(), EngineError> {
        if self.mode == mode && !self.resubscribe_pending {
            return Ok(());
        }

        if self.watch.is_none() && !self.resubscribe_pending {
            self.mode = mode;
            info!("[PositionTracker] Switching to {:?}", mode);
            let interval = Duration::seconds(self.acquisition_options().interval_secs as i64);
            self.refresh.reschedule(interval, now);
            return Ok(());
        }

        let previous = self.mode;
        info!("[PositionTracker] Switching to {:?}, re-subscribing", mode);
        self.stop_tracking();
        self.mode = mode;
        if let Err(err) = self.start_tracking(now) {
            warn!("[PositionTracker] Could not switch to {:?}, restoring {:?}", mode, previous);
            self.mode = previous;
            if let Err(restore) = self.start_tracking(now) {
                warn!("[PositionTracker] Watch not restored: {}", restore);
                self.resubscribe_pending = true;
            }
            return Err(err);
        }
        Ok(())
    }

    /// Wait for the next item from the active watch.
    ///
    /// Pends forever while not tracking. If the source closes the watch, the
    /// watch is dropped and `SubscriptionClosed` is returned once.
    pub async fn next_watch_item(&mut self) -> Result<Position, LocationError> {
        let received = match self.watch.as_mut() {
            Some(watch) => watch.samples.recv().await,
            None => std::future::pending().await,
        };
        match received {
            Some(item) => item,
            None => {
                warn!("[PositionTracker] Watch closed by location source");
                self.watch = None;
                self.refresh.stop();
                Err(LocationError::SubscriptionClosed)
            }
        }
    }

    /// Whether the fallback one-shot refresh is due.
    pub fn refresh_due(&mut self, now: NaiveDateTime) -> bool {
        self.watch.is_some() && self.refresh.poll(now)
    }

    /// One-shot acquisition, fed through the same filter as watch samples.
    pub async fn acquire_current(&mut self) -> Result<Option<PositionUpdate>, EngineError> {
        let options = self.acquisition_options();
        let source = Arc::clone(&self.source);
        match source.current_position(&options).await {
            Ok(sample) => self.on_raw_sample(sample),
            Err(err) => {
                self.report_error(&err);
                Err(err.into())
            }
        }
    }

    /// Route a watch item to the filter or the error path.
    pub fn handle_watch_item(
        &mut self,
        item: Result<Position, LocationError>,
    ) -> Result<Option<PositionUpdate>, EngineError> {
        match item {
            Ok(sample) => self.on_raw_sample(sample),
            Err(err) => {
                self.report_error(&err);
                Err(err.into())
            }
        }
    }

    /// Record an acquisition failure. The watch stays subscribed.
    pub fn report_error(&mut self, err: &LocationError) {
        warn!("[PositionTracker] Acquisition failed: {}", err);
        self.stale = true;
        self.last_error = Some(err.clone());
    }

    // ------------------------------------------------------------------------
    // Filtering
    // ------------------------------------------------------------------------

    /// Filter one raw sample. Returns the published update if accepted.
    pub fn on_raw_sample(&mut self, sample: Position) -> Result<Option<PositionUpdate>, EngineError> {
        if !sample.point.is_valid() {
            return Err(EngineError::InvalidCoordinate {
                latitude: sample.point.latitude,
                longitude: sample.point.longitude,
            });
        }
        if !sample.accuracy_meters.is_finite() || sample.accuracy_meters < 0.0 {
            return Err(EngineError::InvalidSample(format!(
                "accuracy {} is not a finite non-negative radius",
                sample.accuracy_meters
            )));
        }

        if sample.accuracy_meters > self.config.accuracy_threshold_m {
            debug!(
                "[PositionTracker] Discarding sample, accuracy {:.0}m > {:.0}m",
                sample.accuracy_meters, self.config.accuracy_threshold_m
            );
            return Ok(None);
        }

        self.record_accuracy(sample.accuracy_meters, sample.captured_at);

        let significant = match &self.current {
            None => true,
            Some(last) => distance_m(&last.point, &sample.point) >= self.config.significant_move_m,
        };
        if !significant {
            return Ok(None);
        }

        self.previous = self.current.replace(sample);
        self.stale = false;
        self.last_error = None;

        let update = PositionUpdate {
            current: sample,
            previous: self.previous,
        };
        self.bus.publish(Event::PositionUpdate(update.clone()));
        Ok(Some(update))
    }

    fn record_accuracy(&mut self, accuracy_m: f64, at: NaiveDateTime) {
        self.accuracy_history.push(AccuracyEntry { accuracy_m, at });
        if self.accuracy_history.len() > self.config.accuracy_history_cap {
            let excess = self.accuracy_history.len() - self.config.accuracy_history_keep;
            self.accuracy_history.drain(..excess);
        }
    }

    // ------------------------------------------------------------------------
    // Accessors
    // ------------------------------------------------------------------------

    pub fn current(&self) -> Option<Position> {
        self.current
    }

    pub fn previous(&self) -> Option<Position> {
        self.previous
    }

    pub fn signal_quality(&self) -> SignalQuality {
        self.current
            .map(|p| SignalQuality::from_accuracy(p.accuracy_meters))
            .unwrap_or(SignalQuality::Unknown)
    }

    pub fn is_stale(&self) -> bool {
        self.stale
    }

    pub fn last_error(&self) -> Option<&LocationError> {
        self.last_error.as_ref()
    }

    pub fn accuracy_history_len(&self) -> usize {
        self.accuracy_history.len()
    }

    pub fn accuracy_stats(&self) -> Option<AccuracyStats> {
        let last = self.accuracy_history.last()?;
        let count = self.accuracy_history.len();
        let (sum, min, max) = self.accuracy_history.iter().fold(
            (0.0, f64::INFINITY, f64::NEG_INFINITY),
            |(sum, min, max), e| (sum + e.accuracy_m, min.min(e.accuracy_m), max.max(e.accuracy_m)),
        );
        Some(AccuracyStats {
            average: sum / count as f64,
            min,
            max,
            count,
            latest: last.accuracy_m,
            latest_at: last.at,
        })
    }

    pub fn snapshot(&self) -> TrackerSnapshot {
        TrackerSnapshot {
            current: self.current,
            previous: self.previous,
            signal_quality: self.signal_quality(),
            mode: self.mode,
            tracking: self.is_tracking(),
            stale: self.stale,
        }
    }
}

impl ActionExecutor for PositionTracker {
    fn execute(&mut self, action: SuggestionAction, now: NaiveDateTime) -> Result<(), EngineError> {
        match action {
            SuggestionAction::EnableReducedPowerMode => self.enable_reduced_power_mode(now),
        }
    }
}

// ============================================================================
// Tests
// ============================================================================
