//! Engine configuration.
//!
//! Every threshold the engine uses lives here with its default. All structs
//! deserialize with `#[serde(default)]`, so a JSON override only needs the
//! fields it changes:
//!
//! ```rust
//! use ride_assist::EngineConfig;
//!
//! let config = EngineConfig::from_json_str(r#"{ "decision": { "daily_target_km": 90.0 } }"#).unwrap();
//! assert_eq!(config.decision.daily_target_km, 90.0);
//! assert_eq!(config.tracker.accuracy_threshold_m, 50.0);
//! ```

use serde::{Deserialize, Serialize};

use crate::navigation::VoiceBand;
use crate::schedule::MAX_PERIOD_SECS;
use crate::traffic::{seed_congestion_overlays, seed_construction_overlays, ConstructionOverlay, CongestionOverlay};
use crate::EngineError;

/// Configuration for [`PositionTracker`](crate::PositionTracker).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TrackerConfig {
    /// Samples with a worse accuracy radius are discarded.
    /// Default: 50.0 meters
    pub accuracy_threshold_m: f64,

    /// Minimum move from the last accepted position to accept a new one.
    /// Default: 20.0 meters
    pub significant_move_m: f64,

    /// Rolling accuracy history is trimmed once it exceeds this many entries.
    /// Default: 100
    pub accuracy_history_cap: usize,

    /// Number of most recent entries kept after trimming.
    /// Default: 50
    pub accuracy_history_keep: usize,

    /// Acquisition cadence in normal mode. Default: 300 s (5 minutes)
    pub normal_interval_secs: u64,

    /// Acquisition cadence in reduced power mode. Default: 600 s (10 minutes)
    pub reduced_interval_secs: u64,

    /// Per-request acquisition timeout. Default: 10_000 ms
    pub timeout_ms: u64,

    /// Maximum age of a cached device fix. Default: 60_000 ms
    pub max_age_ms: u64,
}

impl Default for TrackerConfig {
    fn default() -> Self {
        Self {
            accuracy_threshold_m: 50.0,
            significant_move_m: 20.0,
            accuracy_history_cap: 100,
            accuracy_history_keep: 50,
            normal_interval_secs: 5 * 60,
            reduced_interval_secs: 10 * 60,
            timeout_ms: 10_000,
            max_age_ms: 60_000,
        }
    }
}

/// Configuration for [`RouteProgressEngine`](crate::RouteProgressEngine).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NavigationConfig {
    /// Distance below which an intermediate waypoint counts as reached.
    /// Default: 20.0 meters
    pub waypoint_arrival_m: f64,

    /// Distance below which the final destination counts as reached.
    /// Default: 30.0 meters
    pub destination_arrival_m: f64,

    /// Nominal average speed used for the initial ETA and when the device
    /// reports no speed. Default: 15.0 km/h
    pub average_speed_kmh: f64,

    /// Floor applied to observed speed before dividing. Default: 0.1 m/s
    pub min_speed_mps: f64,

    /// Announcement bands, nearest first.
    /// Default: 50 m / 30 s, 200 m / 30 s, 500 m / 60 s
    pub voice_bands: Vec<VoiceBand>,

    /// Whether turn prompts are announced. Default: true
    pub voice_enabled: bool,
}

impl Default for NavigationConfig {
    fn default() -> Self {
        Self {
            waypoint_arrival_m: 20.0,
            destination_arrival_m: 30.0,
            average_speed_kmh: 15.0,
            min_speed_mps: 0.1,
            voice_bands: vec![
                VoiceBand { outer_m: 50.0, inner_m: 45.0, cooldown_secs: 30 },
                VoiceBand { outer_m: 200.0, inner_m: 190.0, cooldown_secs: 30 },
                VoiceBand { outer_m: 500.0, inner_m: 490.0, cooldown_secs: 60 },
            ],
            voice_enabled: true,
        }
    }
}

/// Configuration for [`TrafficRiskAggregator`](crate::TrafficRiskAggregator).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TrafficConfig {
    /// Sampling period. Default: 300 s (5 minutes)
    pub sample_interval_secs: u64,

    /// Monitoring radius of zones derived from route waypoints.
    /// Default: 10_000 meters
    pub zone_radius_m: f64,

    /// A construction overlay affects zones whose centre is this close to
    /// its reference point. Default: 5_000 meters
    pub construction_radius_m: f64,

    /// Minimum absolute level delta between consecutive samples that counts
    /// as a significant change. Default: 2
    pub significant_change_levels: u8,

    /// Static congestion overlays. Default: seeded Ningbo–Jiujiang corridor list
    pub congestion_overlays: Vec<CongestionOverlay>,

    /// Static construction overlays. Default: seeded G15 works
    pub construction_overlays: Vec<ConstructionOverlay>,
}

impl Default for TrafficConfig {
    fn default() -> Self {
        Self {
            sample_interval_secs: 5 * 60,
            zone_radius_m: 10_000.0,
            construction_radius_m: 5_000.0,
            significant_change_levels: 2,
            congestion_overlays: seed_congestion_overlays(),
            construction_overlays: seed_construction_overlays(),
        }
    }
}

/// Configuration for [`DecisionCycleScheduler`](crate::DecisionCycleScheduler).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DecisionConfig {
    /// Cycle period. Default: 3600 s (hourly)
    pub cycle_interval_secs: u64,

    /// Daily riding distance target, user-overridable. Default: 120.0 km
    pub daily_target_km: f64,

    /// Completion percentage above which the rider is ahead. Default: 80.0
    pub ahead_threshold_pct: f64,

    /// Completion percentage below which the rider is behind. Default: 50.0
    pub behind_threshold_pct: f64,

    /// Battery fraction (0..1) below which battery is a risk. Default: 0.2
    pub low_battery_fraction: f64,

    /// Rest stop count above which fatigue is a risk. Default: 10
    pub fatigue_rest_stops: u32,

    /// Distance ridden today above which progress is an opportunity.
    /// Default: 100.0 km
    pub strong_progress_km: f64,

    /// Lunch window, inclusive hours. Default: 12..=14
    pub lunch_start_hour: u32,
    pub lunch_end_hour: u32,

    /// Route traffic level at which a route adjustment is suggested.
    /// Default: 3 (congested)
    pub route_adjustment_level: u8,
}

impl Default for DecisionConfig {
    fn default() -> Self {
        Self {
            cycle_interval_secs: 60 * 60,
            daily_target_km: 120.0,
            ahead_threshold_pct: 80.0,
            behind_threshold_pct: 50.0,
            low_battery_fraction: 0.2,
            fatigue_rest_stops: 10,
            strong_progress_km: 100.0,
            lunch_start_hour: 12,
            lunch_end_hour: 14,
            route_adjustment_level: 3,
        }
    }
}

/// Top-level configuration for [`RideEngine`](crate::RideEngine).
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub tracker: TrackerConfig,
    pub navigation: NavigationConfig,
    pub traffic: TrafficConfig,
    pub decision: DecisionConfig,
    pub runtime: RuntimeConfig,
}

/// Settings for the async run loop.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    /// Event channel capacity per subscriber. Default: 256
    pub event_capacity: usize,

    /// How often the run loop polls its tickers. Default: 1000 ms
    pub heartbeat_ms: u64,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            event_capacity: 256,
            heartbeat_ms: 1000,
        }
    }
}

impl EngineConfig {
    /// Parse a (partial) JSON override on top of the defaults and validate it.
    pub fn from_json_str(json: &str) -> Result<Self, EngineError> {
        let config: EngineConfig = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Reject thresholds and periods that would stall or disable the engine.
    pub fn validate(&self) -> Result<(), EngineError> {
        fn positive(name: &str, value: f64) -> Result<(), EngineError> {
            if value.is_finite() && value > 0.0 {
                Ok(())
            } else {
                Err(EngineError::InvalidConfig(format!("{name} must be positive, got {value}")))
            }
        }
        fn nonzero(name: &str, value: u64) -> Result<(), EngineError> {
            if value > 0 {
                Ok(())
            } else {
                Err(EngineError::InvalidConfig(format!("{name} must be non-zero")))
            }
        }
        fn period(name: &str, secs: u64) -> Result<(), EngineError> {
            nonzero(name, secs)?;
            if secs > MAX_PERIOD_SECS {
                return Err(EngineError::InvalidConfig(format!(
                    "{name} must be at most {MAX_PERIOD_SECS} s, got {secs}"
                )));
            }
            Ok(())
        }

        positive("tracker.accuracy_threshold_m", self.tracker.accuracy_threshold_m)?;
        positive("tracker.significant_move_m", self.tracker.significant_move_m)?;
        period("tracker.normal_interval_secs", self.tracker.normal_interval_secs)?;
        period("tracker.reduced_interval_secs", self.tracker.reduced_interval_secs)?;
        if self.tracker.accuracy_history_keep > self.tracker.accuracy_history_cap {
            return Err(EngineError::InvalidConfig(
                "tracker.accuracy_history_keep exceeds accuracy_history_cap".to_string(),
            ));
        }

        positive("navigation.waypoint_arrival_m", self.navigation.waypoint_arrival_m)?;
        positive("navigation.destination_arrival_m", self.navigation.destination_arrival_m)?;
        positive("navigation.average_speed_kmh", self.navigation.average_speed_kmh)?;
        positive("navigation.min_speed_mps", self.navigation.min_speed_mps)?;
        for band in &self.navigation.voice_bands {
            if !(band.inner_m >= 0.0 && band.inner_m < band.outer_m) {
                return Err(EngineError::InvalidConfig(format!(
                    "voice band ({}, {}] is empty",
                    band.inner_m, band.outer_m
                )));
            }
            if band.cooldown_secs > MAX_PERIOD_SECS {
                return Err(EngineError::InvalidConfig(format!(
                    "voice band cooldown must be at most {MAX_PERIOD_SECS} s, got {}",
                    band.cooldown_secs
                )));
            }
        }

        period("traffic.sample_interval_secs", self.traffic.sample_interval_secs)?;
        positive("traffic.zone_radius_m", self.traffic.zone_radius_m)?;
        positive("traffic.construction_radius_m", self.traffic.construction_radius_m)?;

        period("decision.cycle_interval_secs", self.decision.cycle_interval_secs)?;
        positive("decision.daily_target_km", self.decision.daily_target_km)?;

        if self.runtime.event_capacity == 0 {
            return Err(EngineError::InvalidConfig("runtime.event_capacity must be non-zero".to_string()));
        }
        nonzero("runtime.heartbeat_ms", self.runtime.heartbeat_ms)?;

        Ok(())
    }
}
