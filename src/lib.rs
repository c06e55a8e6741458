//! # Ride Assist
//!
//! Real-time tracking and decision engine for a long-distance cycling trip.
//!
//! This library provides:
//! - Accuracy/significance filtering of raw device location samples
//! - Turn-by-turn progress through a multi-waypoint route with voice cadence
//! - Zone-based traffic risk aggregation with change detection
//! - A periodic decision cycle that ranks and surfaces suggestions
//!
//! ## Components
//!
//! | Component | Module | Drives |
//! |-----------|--------|--------|
//! | [`PositionTracker`] | [`tracker`] | device samples → position updates |
//! | [`RouteProgressEngine`] | [`navigation`] | position updates → step/ETA/turn prompts |
//! | [`TrafficRiskAggregator`] | [`traffic`] | own timer → zone risk + notifications |
//! | [`DecisionCycleScheduler`] | [`decision`] | own timer → ranked suggestions |
//! | [`RideEngine`] | [`engine`] | composes all of the above |
//!
//! Every component publishes onto a shared [`EventBus`]; consumers subscribe
//! by [`EventKind`].
//!
//! ## Quick Start
//!
//! ```rust
//! use ride_assist::{GpsPoint, Route, RouteProgressEngine, NavigationConfig, EventBus};
//!
//! let bus = EventBus::new(64);
//! let route = Route::from_named_points(
//!     GpsPoint::new(29.8683, 121.5440),
//!     &[
//!         ("Hangzhou Bay Bridge", GpsPoint::new(30.3695, 121.1226)),
//!         ("Jiaxing", GpsPoint::new(30.7627, 120.7505)),
//!     ],
//! ).unwrap();
//!
//! let mut nav = RouteProgressEngine::new(NavigationConfig::default(), bus.clone());
//! nav.start(route, chrono::NaiveDateTime::default()).unwrap();
//! assert!(nav.is_navigating());
//! ```

use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};

pub mod geo_utils;

pub mod error;
pub use error::{EngineError, LocationError};

pub mod config;
pub use config::{
    DecisionConfig, EngineConfig, NavigationConfig, RuntimeConfig, TrackerConfig, TrafficConfig,
};

pub mod schedule;
pub use schedule::{Clock, ManualClock, SystemClock, Ticker};

pub mod events;
pub use events::{
    DestinationReached, Event, EventBus, EventKind, EventSubscriber, NavigationStarted,
    NavigationStopped, PositionUpdate, TrafficNotification, TrafficNotificationKind, TurnInstruction,
};

pub mod collaborators;
pub use collaborators::{
    AcquisitionOptions, ActionExecutor, BatteryMonitor, LocationSource, NetworkMonitor,
    RoutePlanner, SampleReceiver, TrafficSignalSource, TripProgress, TripStore, WatchId,
    WeatherSource, WeatherSummary,
};

pub mod tracker;
pub use tracker::{AccuracyStats, PositionTracker, PowerMode, SignalQuality, TrackerSnapshot};

pub mod route;
pub use route::{Route, Waypoint};

pub mod navigation;
pub use navigation::{NavigationState, RouteProgressEngine, VoiceBand};

pub mod traffic;
pub use traffic::{
    ConstructionOverlay, CongestionOverlay, MonitoringStatus, MonitoringZone, PeakWindow, Recommendation,
    RouteTrafficAnalysis, TrafficLevel, TrafficRiskAggregator, ZoneSample,
};

pub mod decision;
pub use decision::{
    Analysis, CycleReport, CycleSnapshot, DecisionCycleScheduler, Opportunity, OpportunityKind,
    Priority, ProgressAnalysis, Risk, RiskKind, Suggestion, SuggestionAction, SuggestionType,
};

pub mod engine;
pub use engine::{RideEngine, SignalSources};

// ============================================================================
// Core Types
// ============================================================================

/// A GPS coordinate with latitude and longitude in degrees.
///
/// # Example
/// ```
/// use ride_assist::GpsPoint;
/// let point = GpsPoint::new(29.8683, 121.5440); // Ningbo
/// assert!(point.is_valid());
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GpsPoint {
    pub latitude: f64,
    pub longitude: f64,
}

impl GpsPoint {
    /// Create a new GPS point without validation.
    pub fn new(latitude: f64, longitude: f64) -> Self {
        Self { latitude, longitude }
    }

    /// Create a point, rejecting non-finite or out-of-range coordinates.
    pub fn try_new(latitude: f64, longitude: f64) -> Result<Self, EngineError> {
        let point = Self::new(latitude, longitude);
        if point.is_valid() {
            Ok(point)
        } else {
            Err(EngineError::InvalidCoordinate { latitude, longitude })
        }
    }

    /// Check if the point has valid coordinates.
    pub fn is_valid(&self) -> bool {
        self.latitude.is_finite()
            && self.longitude.is_finite()
            && self.latitude >= -90.0
            && self.latitude <= 90.0
            && self.longitude >= -180.0
            && self.longitude <= 180.0
    }
}

/// A location sample as delivered by the device location service.
///
/// Immutable once created. Timestamps are local wall-clock time.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Position {
    pub point: GpsPoint,
    /// Horizontal accuracy radius in meters
    pub accuracy_meters: f64,
    pub heading_degrees: Option<f64>,
    pub speed_mps: Option<f64>,
    pub captured_at: NaiveDateTime,
}

impl Position {
    pub fn new(point: GpsPoint, accuracy_meters: f64, captured_at: NaiveDateTime) -> Self {
        Self {
            point,
            accuracy_meters,
            heading_degrees: None,
            speed_mps: None,
            captured_at,
        }
    }

    pub fn with_speed(mut self, speed_mps: f64) -> Self {
        self.speed_mps = Some(speed_mps);
        self
    }

    pub fn with_heading(mut self, heading_degrees: f64) -> Self {
        self.heading_degrees = Some(heading_degrees);
        self
    }
}

// ============================================================================
// Tests
// ============================================================================
