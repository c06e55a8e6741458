//! Interfaces to everything outside the engine.
//!
//! The device location service, traffic feed, weather, battery, network and
//! trip store are all external and may fail or stall. Components take them as
//! trait objects so the composition root decides what is real and tests can
//! substitute fakes.

use async_trait::async_trait;
use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::decision::{Suggestion, SuggestionAction};
use crate::route::Route;
use crate::traffic::MonitoringZone;
use crate::{EngineError, GpsPoint, LocationError, Position};

// ============================================================================
// Device location
// ============================================================================

/// What the tracker asks of the device location service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AcquisitionOptions {
    pub high_accuracy: bool,
    pub timeout_ms: u64,
    pub max_age_ms: u64,
    /// Requested delivery cadence
    pub interval_secs: u64,
}

/// Identifies one continuous watch on the device location service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct WatchId(pub u64);

/// Samples and acquisition errors delivered by a watch, in device order.
pub type SampleReceiver = mpsc::UnboundedReceiver<Result<Position, LocationError>>;

/// The device location service.
#[async_trait]
pub trait LocationSource: Send + Sync {
    /// Single-shot acquisition.
    async fn current_position(&self, options: &AcquisitionOptions) -> Result<Position, LocationError>;

    /// Start a continuous watch. The returned receiver yields samples until
    /// the watch is cleared.
    fn watch_position(&self, options: &AcquisitionOptions) -> Result<(WatchId, SampleReceiver), LocationError>;

    /// Cancel a watch. Clearing an unknown watch is a no-op.
    fn clear_watch(&self, id: WatchId);
}

// ============================================================================
// Traffic
// ============================================================================

/// Optional external traffic feed.
#[async_trait]
pub trait TrafficSignalSource: Send + Sync {
    /// Current level 1..=4 for the zone, or `None` when the feed has no data.
    async fn risk_level(&self, zone: &MonitoringZone) -> Result<Option<u8>, String>;
}

// ============================================================================
// Decision cycle inputs
// ============================================================================

/// Summary of current weather as judged by the weather collaborator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WeatherSummary {
    pub description: String,
    pub temperature_c: f64,
    pub wind_speed_mps: f64,
    pub suitable_for_riding: bool,
}

#[async_trait]
pub trait WeatherSource: Send + Sync {
    async fn current_weather(&self, near: Option<GpsPoint>) -> Result<WeatherSummary, String>;
}

#[async_trait]
pub trait BatteryMonitor: Send + Sync {
    /// Charge level as a fraction in `0.0..=1.0`.
    async fn battery_level(&self) -> Result<f64, String>;
}

#[async_trait]
pub trait NetworkMonitor: Send + Sync {
    async fn is_reachable(&self) -> Result<bool, String>;
}

/// Today's riding progress as recorded by the trip store.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct TripProgress {
    pub today_distance_km: f64,
    pub average_speed_kmh: f64,
    pub rest_stop_count: u32,
}

/// Persistent trip state owned outside the engine.
#[async_trait]
pub trait TripStore: Send + Sync {
    async fn trip_progress(&self) -> Result<TripProgress, String>;

    /// Append a published suggestion to the trip log.
    async fn record_suggestion(&self, suggestion: &Suggestion) -> Result<(), String>;
}

// ============================================================================
// Route planning / auto actions
// ============================================================================

/// Produces a route from the rider's position, e.g. from a predefined trip
/// plan or an online planner.
#[async_trait]
pub trait RoutePlanner: Send + Sync {
    async fn plan_route(&self, origin: GpsPoint) -> Result<Route, String>;
}

/// Applies auto-executable suggestion actions.
pub trait ActionExecutor {
    fn execute(&mut self, action: SuggestionAction, now: NaiveDateTime) -> Result<(), EngineError>;
}
