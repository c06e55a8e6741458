//! Zone-based traffic risk aggregation.
//!
//! Monitoring zones are derived from the route's waypoints and enriched with
//! the static congestion overlay that contains them. Every sampling tick
//! computes a level per zone as the maximum of:
//!
//! - the zone's baseline level (from its overlay, else smooth)
//! - time of day: slow inside a peak window, congested on weekends for
//!   tourist zones
//! - construction: slow if a construction reference point is nearby
//! - the optional external traffic feed
//!
//! Consecutive samples for the same zone are compared, and jumps of two or
//! more levels raise a notification (once per zone per monitoring session).

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use chrono::{Datelike, NaiveDateTime, NaiveTime, Timelike, Weekday};
use futures::future::join_all;
use log::{debug, info, warn};
use rstar::{RTree, RTreeObject, AABB};
use serde::{Deserialize, Serialize};

use crate::collaborators::TrafficSignalSource;
use crate::decision::Priority;
use crate::events::{Event, EventBus, PositionUpdate, TrafficNotification, TrafficNotificationKind};
use crate::geo_utils::{distance_m, meters_to_degrees};
use crate::route::Route;
use crate::schedule::Ticker;
use crate::{EngineError, GpsPoint, TrafficConfig};

// ============================================================================
// Levels and windows
// ============================================================================

/// Traffic risk level, always in `1..=4`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub enum TrafficLevel {
    Smooth = 1,
    Slow = 2,
    Congested = 3,
    Heavy = 4,
}

impl TrafficLevel {
    pub fn value(self) -> u8 {
        self as u8
    }

    pub fn name(self) -> &'static str {
        match self {
            TrafficLevel::Smooth => "smooth",
            TrafficLevel::Slow => "slow",
            TrafficLevel::Congested => "congested",
            TrafficLevel::Heavy => "heavy",
        }
    }

    /// Expected delay through a zone at this level.
    pub fn estimated_delay_minutes(self) -> u32 {
        match self {
            TrafficLevel::Smooth => 0,
            TrafficLevel::Slow => 5,
            TrafficLevel::Congested => 15,
            TrafficLevel::Heavy => 30,
        }
    }
}

impl TryFrom<u8> for TrafficLevel {
    type Error = String;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            1 => Ok(TrafficLevel::Smooth),
            2 => Ok(TrafficLevel::Slow),
            3 => Ok(TrafficLevel::Congested),
            4 => Ok(TrafficLevel::Heavy),
            other => Err(format!("traffic level {other} outside 1..=4")),
        }
    }
}

impl From<TrafficLevel> for u8 {
    fn from(level: TrafficLevel) -> Self {
        level.value()
    }
}

impl fmt::Display for TrafficLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// A daily time window written as `"HH:MM-HH:MM"`.
///
/// Both bounds are inclusive and compared at minute resolution. A window
/// whose end precedes its start wraps past midnight.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct PeakWindow {
    pub start: NaiveTime,
    pub end: NaiveTime,
}

impl PeakWindow {
    pub fn parse(range: &str) -> Result<Self, EngineError> {
        let invalid = || EngineError::InvalidPeakWindow(range.to_string());
        let (start, end) = range.split_once('-').ok_or_else(invalid)?;
        let start = NaiveTime::parse_from_str(start.trim(), "%H:%M").map_err(|_| invalid())?;
        let end = NaiveTime::parse_from_str(end.trim(), "%H:%M").map_err(|_| invalid())?;
        Ok(Self { start, end })
    }

    pub fn contains(&self, time: NaiveTime) -> bool {
        let minute = |t: NaiveTime| t.hour() * 60 + t.minute();
        let (now, start, end) = (minute(time), minute(self.start), minute(self.end));
        if start <= end {
            now >= start && now <= end
        } else {
            now >= start || now <= end
        }
    }
}

impl FromStr for PeakWindow {
    type Err = EngineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl TryFrom<String> for PeakWindow {
    type Error = EngineError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<PeakWindow> for String {
    fn from(window: PeakWindow) -> Self {
        window.to_string()
    }
}

impl fmt::Display for PeakWindow {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.start.format("%H:%M"), self.end.format("%H:%M"))
    }
}

// ============================================================================
// Static overlays
// ============================================================================

/// A named area with known congestion.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CongestionOverlay {
    pub id: String,
    pub name: String,
    pub center: GpsPoint,
    pub radius_m: f64,
    pub level: TrafficLevel,
    #[serde(default)]
    pub peak_windows: Vec<PeakWindow>,
    /// Escalates to congested on weekends
    #[serde(default)]
    pub tourist_peak: bool,
    /// Declared for sensitivity to weather; not used by the aggregation
    #[serde(default)]
    pub weather_sensitive: bool,
    #[serde(default)]
    pub alternative_routes: Vec<String>,
}

/// Road works near the route.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConstructionOverlay {
    pub id: String,
    pub name: String,
    /// Zones within the construction radius of this point are slowed
    pub reference_point: GpsPoint,
    #[serde(default)]
    pub end_point: Option<GpsPoint>,
    #[serde(default)]
    pub alternative_route: Option<String>,
}

fn windows(ranges: &[&str]) -> Vec<PeakWindow> {
    ranges.iter().filter_map(|r| PeakWindow::parse(r).ok()).collect()
}

/// Known congestion areas along the Ningbo–Jiujiang corridor.
pub fn seed_congestion_overlays() -> Vec<CongestionOverlay> {
    vec![
        CongestionOverlay {
            id: "ningbo_city_center".to_string(),
            name: "Ningbo city centre".to_string(),
            center: GpsPoint::new(29.8683, 121.5440),
            radius_m: 5_000.0,
            level: TrafficLevel::Slow,
            peak_windows: windows(&["07:30-09:00", "17:00-18:30"]),
            tourist_peak: false,
            weather_sensitive: false,
            alternative_routes: vec!["Outer Ring Road".to_string(), "Jiangdong Road".to_string()],
        },
        CongestionOverlay {
            id: "hangzhou_bay_bridge".to_string(),
            name: "Hangzhou Bay Bridge".to_string(),
            center: GpsPoint::new(30.3695, 121.1226),
            radius_m: 10_000.0,
            level: TrafficLevel::Smooth,
            peak_windows: Vec::new(),
            tourist_peak: false,
            weather_sensitive: true,
            alternative_routes: Vec::new(),
        },
        CongestionOverlay {
            id: "hangzhou_west_lake".to_string(),
            name: "West Lake scenic area".to_string(),
            center: GpsPoint::new(30.2741, 120.1551),
            radius_m: 3_000.0,
            level: TrafficLevel::Congested,
            peak_windows: windows(&["09:00-11:00", "14:00-16:00", "18:00-20:00"]),
            tourist_peak: true,
            weather_sensitive: false,
            alternative_routes: Vec::new(),
        },
    ]
}

/// Known road works along the corridor.
pub fn seed_construction_overlays() -> Vec<ConstructionOverlay> {
    vec![ConstructionOverlay {
        id: "g15_construction".to_string(),
        name: "G15 expressway works".to_string(),
        reference_point: GpsPoint::new(30.2, 120.8),
        end_point: Some(GpsPoint::new(30.4, 121.0)),
        alternative_route: Some("S4 provincial road".to_string()),
    }]
}

/// Envelope of a congestion overlay in the spatial index.
#[derive(Debug, Clone)]
struct OverlayBounds {
    index: usize,
    min_lat: f64,
    max_lat: f64,
    min_lng: f64,
    max_lng: f64,
}

impl OverlayBounds {
    fn new(index: usize, overlay: &CongestionOverlay) -> Self {
        let lat_pad = overlay.radius_m / 111_320.0;
        let lng_pad = meters_to_degrees(overlay.radius_m, overlay.center.latitude);
        Self {
            index,
            min_lat: overlay.center.latitude - lat_pad,
            max_lat: overlay.center.latitude + lat_pad,
            min_lng: overlay.center.longitude - lng_pad,
            max_lng: overlay.center.longitude + lng_pad,
        }
    }
}

impl RTreeObject for OverlayBounds {
    type Envelope = AABB<[f64; 2]>;

    fn envelope(&self) -> Self::Envelope {
        AABB::from_corners([self.min_lng, self.min_lat], [self.max_lng, self.max_lat])
    }
}

// ============================================================================
// Zones and samples
// ============================================================================

/// A circular area sampled for traffic risk.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MonitoringZone {
    pub id: String,
    pub name: String,
    pub center: GpsPoint,
    pub radius_m: f64,
    pub baseline: TrafficLevel,
    pub peak_windows: Vec<PeakWindow>,
    pub tourist_peak: bool,
    pub weather_sensitive: bool,
    /// Congestion overlay folded into this zone, if any
    pub overlay_id: Option<String>,
    pub overlay_name: Option<String>,
    pub alternative_routes: Vec<String>,
    pub last_observed_risk: Option<TrafficLevel>,
    pub last_sample_at: Option<NaiveDateTime>,
}

impl MonitoringZone {
    /// A plain zone with no overlay.
    pub fn new(id: impl Into<String>, name: impl Into<String>, center: GpsPoint, radius_m: f64) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            center,
            radius_m,
            baseline: TrafficLevel::Smooth,
            peak_windows: Vec::new(),
            tourist_peak: false,
            weather_sensitive: false,
            overlay_id: None,
            overlay_name: None,
            alternative_routes: Vec::new(),
            last_observed_risk: None,
            last_sample_at: None,
        }
    }

    fn with_overlay(mut self, overlay: &CongestionOverlay) -> Self {
        self.baseline = overlay.level;
        self.peak_windows = overlay.peak_windows.clone();
        self.tourist_peak = overlay.tourist_peak;
        self.weather_sensitive = overlay.weather_sensitive;
        self.overlay_id = Some(overlay.id.clone());
        self.overlay_name = Some(overlay.name.clone());
        self.alternative_routes = overlay.alternative_routes.clone();
        self
    }

    pub fn contains(&self, point: &GpsPoint) -> bool {
        distance_m(&self.center, point) < self.radius_m
    }
}

/// One zone's result from one sampling tick.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ZoneSample {
    pub zone_id: String,
    pub zone_name: String,
    pub level: TrafficLevel,
    pub previous: Option<TrafficLevel>,
    pub significant_change: bool,
    pub factors: Vec<String>,
    pub advice: Vec<String>,
    pub estimated_delay_minutes: u32,
    pub sampled_at: NaiveDateTime,
}

/// Qualitative advice for a whole route.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Recommendation {
    AvoidOrDelay,
    ConsiderAlternative,
    AllowExtraTime,
    ProceedAsPlanned,
}

impl Recommendation {
    pub fn select(overall: TrafficLevel, total_delay_minutes: u32) -> Self {
        if overall >= TrafficLevel::Heavy {
            Recommendation::AvoidOrDelay
        } else if overall >= TrafficLevel::Congested {
            Recommendation::ConsiderAlternative
        } else if total_delay_minutes > 30 {
            Recommendation::AllowExtraTime
        } else {
            Recommendation::ProceedAsPlanned
        }
    }

    pub fn message(self) -> &'static str {
        match self {
            Recommendation::AvoidOrDelay => "Heavy congestion on the route, avoid or delay the trip",
            Recommendation::ConsiderAlternative => "Congestion on the route, consider an alternative",
            Recommendation::AllowExtraTime => "Expect delays, allow extra time",
            Recommendation::ProceedAsPlanned => "Traffic is fine, proceed as planned",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RouteTrafficAnalysis {
    pub overall_level: TrafficLevel,
    pub zones: Vec<ZoneSample>,
    pub total_delay_minutes: u32,
    pub advice: Vec<String>,
    pub recommendation: Recommendation,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MonitoringStatus {
    pub monitoring: bool,
    pub zone_count: usize,
    pub sampled_zones: usize,
    pub congestion_overlays: usize,
    pub construction_overlays: usize,
    pub last_sample_at: Option<NaiveDateTime>,
}

// ============================================================================
// Aggregator
// ============================================================================

pub struct TrafficRiskAggregator {
    config: TrafficConfig,
    bus: EventBus,
    signal: Option<Arc<dyn TrafficSignalSource>>,
    overlay_index: RTree<OverlayBounds>,
    zones: Vec<MonitoringZone>,
    samples: HashMap<String, ZoneSample>,
    /// (zone or overlay id, kind) pairs already notified this session
    notified: HashSet<(String, TrafficNotificationKind)>,
    ticker: Ticker,
    monitoring: bool,
    last_sample_at: Option<NaiveDateTime>,
}

impl TrafficRiskAggregator {
    pub fn new(config: TrafficConfig, bus: EventBus, signal: Option<Arc<dyn TrafficSignalSource>>) -> Self {
        let bounds: Vec<OverlayBounds> = config
            .congestion_overlays
            .iter()
            .enumerate()
            .map(|(i, overlay)| OverlayBounds::new(i, overlay))
            .collect();
        let ticker = Ticker::from_secs(config.sample_interval_secs);
        Self {
            config,
            bus,
            signal,
            overlay_index: RTree::bulk_load(bounds),
            zones: Vec::new(),
            samples: HashMap::new(),
            notified: HashSet::new(),
            ticker,
            monitoring: false,
            last_sample_at: None,
        }
    }

    /// First congestion overlay (in configured order) whose radius contains `point`.
    fn overlay_at(&self, point: &GpsPoint) -> Option<&CongestionOverlay> {
        let probe = AABB::from_point([point.longitude, point.latitude]);
        let mut candidates: Vec<usize> = self
            .overlay_index
            .locate_in_envelope_intersecting(&probe)
            .map(|b| b.index)
            .collect();
        candidates.sort_unstable();

        candidates
            .into_iter()
            .map(|i| &self.config.congestion_overlays[i])
            .find(|overlay| distance_m(&overlay.center, point) <= overlay.radius_m)
    }

    /// One zone per route waypoint, enriched with the overlay containing it.
    pub fn zones_from_route(&self, route: &Route) -> Vec<MonitoringZone> {
        route
            .waypoints()
            .iter()
            .enumerate()
            .map(|(i, wp)| {
                let zone = MonitoringZone::new(format!("zone_{i}"), wp.name.clone(), wp.point, self.config.zone_radius_m);
                match self.overlay_at(&wp.point) {
                    Some(overlay) => zone.with_overlay(overlay),
                    None => zone,
                }
            })
            .collect()
    }

    // ------------------------------------------------------------------------
    // Monitoring lifecycle
    // ------------------------------------------------------------------------

    /// Start monitoring `zones`. The first sample is taken on the next poll.
    /// Starting while already monitoring is a no-op.
    pub fn start_monitoring(&mut self, zones: Vec<MonitoringZone>, now: NaiveDateTime) {
        if self.monitoring {
            debug!("[TrafficRisk] Already monitoring");
            return;
        }
        info!("[TrafficRisk] Monitoring {} zones every {}s", zones.len(), self.config.sample_interval_secs);
        self.zones = zones;
        self.samples.clear();
        self.notified.clear();
        self.last_sample_at = None;
        self.monitoring = true;
        self.ticker.start_immediate(now);
    }

    /// Stop sampling. Idempotent; the last samples stay available.
    pub fn stop_monitoring(&mut self) {
        if !self.monitoring {
            return;
        }
        self.monitoring = false;
        self.ticker.stop();
        info!("[TrafficRisk] Monitoring stopped");
    }

    pub fn is_monitoring(&self) -> bool {
        self.monitoring
    }

    /// Run a sampling tick if one is due.
    pub async fn poll(&mut self, now: NaiveDateTime) -> Option<Vec<ZoneSample>> {
        if !self.ticker.poll(now) {
            return None;
        }
        Some(self.sample_tick(now).await)
    }

    // ------------------------------------------------------------------------
    // Sampling
    // ------------------------------------------------------------------------

    /// Sample every zone once, update the zone cache and raise notifications
    /// for significant changes.
    pub async fn sample_tick(&mut self, now: NaiveDateTime) -> Vec<ZoneSample> {
        let external = self.query_external().await;

        let mut results = Vec::with_capacity(self.zones.len());
        for (i, external_level) in external.into_iter().enumerate() {
            let (level, factors, advice) = self.local_risk(&self.zones[i], now);
            let level = match external_level {
                Some(ext) if ext > level => ext,
                _ => level,
            };

            let zone = &mut self.zones[i];
            let previous = zone.last_observed_risk;
            zone.last_observed_risk = Some(level);
            zone.last_sample_at = Some(now);

            let delta = previous.map(|p| (level.value() as i16 - p.value() as i16).abs());
            let significant_change = delta.is_some_and(|d| d >= self.config.significant_change_levels as i16);

            let sample = ZoneSample {
                zone_id: zone.id.clone(),
                zone_name: zone.name.clone(),
                level,
                previous,
                significant_change,
                factors,
                advice,
                estimated_delay_minutes: level.estimated_delay_minutes(),
                sampled_at: now,
            };
            self.samples.insert(sample.zone_id.clone(), sample.clone());
            results.push(sample);
        }

        for sample in results.iter().filter(|s| s.significant_change) {
            self.notify_change(sample, now);
        }

        self.last_sample_at = Some(now);
        debug!(
            "[TrafficRisk] Sampled {} zones, {} significant changes",
            results.len(),
            results.iter().filter(|s| s.significant_change).count()
        );
        results
    }

    /// Query the external feed for every zone concurrently. Missing feed,
    /// missing data, failures and out-of-range values all yield `None`.
    async fn query_external(&self) -> Vec<Option<TrafficLevel>> {
        let Some(signal) = self.signal.as_ref() else {
            return vec![None; self.zones.len()];
        };

        let responses = join_all(self.zones.iter().map(|zone| signal.risk_level(zone))).await;
        responses
            .into_iter()
            .zip(&self.zones)
            .map(|(response, zone)| match response {
                Ok(Some(raw)) => match TrafficLevel::try_from(raw) {
                    Ok(level) => Some(level),
                    Err(e) => {
                        warn!("[TrafficRisk] Ignoring feed value for {}: {}", zone.name, e);
                        None
                    }
                },
                Ok(None) => None,
                Err(e) => {
                    warn!("[TrafficRisk] Feed unavailable for {}: {}", zone.name, e);
                    None
                }
            })
            .collect()
    }

    /// Level from overlays and time of day, with the factors that raised it.
    fn local_risk(&self, zone: &MonitoringZone, now: NaiveDateTime) -> (TrafficLevel, Vec<String>, Vec<String>) {
        let mut level = zone.baseline;
        let mut factors = Vec::new();
        let mut advice = Vec::new();

        if let Some(name) = &zone.overlay_name {
            factors.push(format!("{name} is prone to congestion"));
            if !zone.alternative_routes.is_empty() {
                advice.push(format!("Consider {}", zone.alternative_routes.join(" or ")));
            }
        }

        if zone.peak_windows.iter().any(|w| w.contains(now.time())) {
            level = level.max(TrafficLevel::Slow);
            factors.push(format!("{} peak hours", zone.name));
        }

        if zone.tourist_peak && matches!(now.weekday(), Weekday::Sat | Weekday::Sun) {
            level = level.max(TrafficLevel::Congested);
            factors.push(format!("{} weekend tourist peak", zone.name));
        }

        let works = self
            .config
            .construction_overlays
            .iter()
            .find(|c| distance_m(&c.reference_point, &zone.center) <= self.config.construction_radius_m);
        if let Some(works) = works {
            level = level.max(TrafficLevel::Slow);
            factors.push(format!("{} under construction", works.name));
            if let Some(alt) = &works.alternative_route {
                advice.push(format!("Detour via {alt}"));
            }
        }

        (level, factors, advice)
    }

    fn notify_change(&mut self, sample: &ZoneSample, now: NaiveDateTime) {
        let Some(from) = sample.previous else {
            return;
        };
        let key = (sample.zone_id.clone(), TrafficNotificationKind::SignificantChange);
        if !self.notified.insert(key) {
            debug!("[TrafficRisk] {} already notified this session", sample.zone_name);
            return;
        }

        let delta = sample.level.value() as i16 - from.value() as i16;
        let direction = if delta > 0 { "worsening" } else { "improving" };
        let priority = if delta.abs() >= 3 { Priority::High } else { Priority::Medium };
        info!(
            "[TrafficRisk] {} traffic {} ({} -> {})",
            sample.zone_name, direction, from, sample.level
        );

        self.bus.publish(Event::TrafficNotification(TrafficNotification {
            kind: TrafficNotificationKind::SignificantChange,
            zone_id: sample.zone_id.clone(),
            zone_name: sample.zone_name.clone(),
            title: format!("{} traffic {}", sample.zone_name, direction),
            message: format!("Current traffic level: {}", sample.level),
            from: Some(from),
            to: sample.level,
            priority,
            at: now,
        }));
    }

    /// Notify once per session when the rider enters a congestion overlay.
    pub fn on_position_update(&mut self, update: &PositionUpdate) {
        if !self.monitoring {
            return;
        }
        let Some(overlay) = self.overlay_at(&update.current.point) else {
            return;
        };
        let key = (overlay.id.clone(), TrafficNotificationKind::EnteringCongestionZone);
        if self.notified.contains(&key) {
            return;
        }

        let notification = TrafficNotification {
            kind: TrafficNotificationKind::EnteringCongestionZone,
            zone_id: overlay.id.clone(),
            zone_name: overlay.name.clone(),
            title: format!("Entering {} congestion area", overlay.name),
            message: "Heavy traffic ahead, slow down".to_string(),
            from: None,
            to: overlay.level,
            priority: Priority::Medium,
            at: update.current.captured_at,
        };
        info!("[TrafficRisk] {}", notification.title);
        self.notified.insert(key);
        self.bus.publish(Event::TrafficNotification(notification));
    }

    // ------------------------------------------------------------------------
    // Queries
    // ------------------------------------------------------------------------

    pub fn estimated_delay_minutes(&self, level: TrafficLevel) -> u32 {
        level.estimated_delay_minutes()
    }

    pub fn zones(&self) -> &[MonitoringZone] {
        &self.zones
    }

    pub fn latest_sample(&self, zone_id: &str) -> Option<&ZoneSample> {
        self.samples.get(zone_id)
    }

    /// Overlay a route onto the latest zone samples.
    ///
    /// Each waypoint maps to the first monitored zone containing it; zones
    /// without a sample yet are skipped.
    pub fn analyze_route(&self, route: &Route) -> RouteTrafficAnalysis {
        let mut overall_level = TrafficLevel::Smooth;
        let mut total_delay_minutes = 0;
        let mut zones = Vec::new();
        let mut advice: Vec<String> = Vec::new();

        for wp in route.waypoints() {
            let sample = self
                .zones
                .iter()
                .find(|z| z.contains(&wp.point))
                .and_then(|z| self.samples.get(&z.id));
            if let Some(sample) = sample {
                overall_level = overall_level.max(sample.level);
                total_delay_minutes += sample.estimated_delay_minutes;
                for line in &sample.advice {
                    if !advice.contains(line) {
                        advice.push(line.clone());
                    }
                }
                zones.push(sample.clone());
            }
        }

        RouteTrafficAnalysis {
            overall_level,
            zones,
            total_delay_minutes,
            advice,
            recommendation: Recommendation::select(overall_level, total_delay_minutes),
        }
    }

    pub fn status(&self) -> MonitoringStatus {
        MonitoringStatus {
            monitoring: self.monitoring,
            zone_count: self.zones.len(),
            sampled_zones: self.zones.iter().filter(|z| z.last_observed_risk.is_some()).count(),
            congestion_overlays: self.config.congestion_overlays.len(),
            construction_overlays: self.config.construction_overlays.len(),
            last_sample_at: self.last_sample_at,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::EventKind;
    use crate::{EventSubscriber, Position};
    use async_trait::async_trait;
    use chrono::{Duration, NaiveDate};
    use std::sync::Mutex;

    fn at(day: u32, hour: u32, minute: u32) -> NaiveDateTime {
        // May 2024: the 6th is a Monday, the 11th a Saturday
        NaiveDate::from_ymd_opt(2024, 5, day)
            .and_then(|d| d.and_hms_opt(hour, minute, 0))
            .unwrap()
    }

    fn time(hour: u32, minute: u32) -> NaiveTime {
        NaiveTime::from_hms_opt(hour, minute, 0).unwrap()
    }

    /// Feed returning whatever level is currently set.
    struct ScriptedFeed {
        level: Mutex<Result<Option<u8>, String>>,
    }

    impl ScriptedFeed {
        fn new() -> Self {
            Self { level: Mutex::new(Ok(None)) }
        }

        fn set(&self, value: Result<Option<u8>, String>) {
            *self.level.lock().unwrap() = value;
        }
    }

    #[async_trait]
    impl TrafficSignalSource for ScriptedFeed {
        async fn risk_level(&self, _zone: &MonitoringZone) -> Result<Option<u8>, String> {
            self.level.lock().unwrap().clone()
        }
    }

    fn jiujiang() -> GpsPoint {
        GpsPoint::new(29.7047, 115.9920)
    }

    fn aggregator_with_feed() -> (TrafficRiskAggregator, Arc<ScriptedFeed>, EventSubscriber) {
        let bus = EventBus::new(64);
        let feed = Arc::new(ScriptedFeed::new());
        let events = bus.subscribe_to(&[EventKind::TrafficNotification]);
        let aggregator = TrafficRiskAggregator::new(TrafficConfig::default(), bus, Some(feed.clone()));
        (aggregator, feed, events)
    }

    fn plain_zone() -> MonitoringZone {
        MonitoringZone::new("zone_0", "Jiujiang", jiujiang(), 10_000.0)
    }

    #[test]
    fn test_level_conversion_and_delay() {
        assert_eq!(TrafficLevel::try_from(3), Ok(TrafficLevel::Congested));
        assert!(TrafficLevel::try_from(0).is_err());
        assert!(TrafficLevel::try_from(5).is_err());
        let delays: Vec<u32> = [TrafficLevel::Smooth, TrafficLevel::Slow, TrafficLevel::Congested, TrafficLevel::Heavy]
            .iter()
            .map(|l| l.estimated_delay_minutes())
            .collect();
        assert_eq!(delays, vec![0, 5, 15, 30]);
    }

    #[test]
    fn test_peak_window_bounds_inclusive() {
        let window = PeakWindow::parse("07:30-09:00").unwrap();
        assert!(window.contains(time(7, 30)));
        assert!(window.contains(time(9, 0)));
        assert!(window.contains(NaiveTime::from_hms_opt(9, 0, 45).unwrap()));
        assert!(!window.contains(time(9, 1)));
        assert!(!window.contains(time(7, 29)));
        assert_eq!(window.to_string(), "07:30-09:00");
    }

    #[test]
    fn test_peak_window_wraps_midnight() {
        let window: PeakWindow = "22:00-02:00".parse().unwrap();
        assert!(window.contains(time(23, 15)));
        assert!(window.contains(time(1, 0)));
        assert!(!window.contains(time(12, 0)));
    }

    #[test]
    fn test_malformed_peak_window() {
        assert!(matches!(PeakWindow::parse("25:00-26:00"), Err(EngineError::InvalidPeakWindow(_))));
        assert!(PeakWindow::parse("0800").is_err());
    }

    #[test]
    fn test_zones_fold_in_containing_overlay() {
        let (aggregator, _, _) = aggregator_with_feed();
        let route = Route::from_named_points(
            GpsPoint::new(29.80, 121.60),
            &[
                ("Ningbo", GpsPoint::new(29.87, 121.55)),
                ("West Lake", GpsPoint::new(30.2741, 120.1551)),
                ("Jiujiang", jiujiang()),
            ],
        )
        .unwrap();

        let zones = aggregator.zones_from_route(&route);
        assert_eq!(zones.len(), 3);
        assert_eq!(zones[0].id, "zone_0");
        assert_eq!(zones[0].radius_m, 10_000.0);
        assert_eq!(zones[0].overlay_id.as_deref(), Some("ningbo_city_center"));
        assert_eq!(zones[0].baseline, TrafficLevel::Slow);
        assert_eq!(zones[0].peak_windows.len(), 2);
        assert_eq!(zones[1].baseline, TrafficLevel::Congested);
        assert!(zones[1].tourist_peak);
        assert_eq!(zones[2].overlay_id, None);
        assert_eq!(zones[2].baseline, TrafficLevel::Smooth);
    }

    #[tokio::test]
    async fn test_rise_of_two_levels_is_significant() {
        let (mut aggregator, feed, mut events) = aggregator_with_feed();
        aggregator.start_monitoring(vec![plain_zone()], at(6, 12, 0));

        let first = aggregator.sample_tick(at(6, 12, 0)).await;
        assert_eq!(first[0].level, TrafficLevel::Smooth);
        assert!(!first[0].significant_change);

        feed.set(Ok(Some(3)));
        let second = aggregator.sample_tick(at(6, 12, 5)).await;
        assert_eq!(second[0].level, TrafficLevel::Congested);
        assert!(second[0].significant_change);

        match events.try_next() {
            Some(Event::TrafficNotification(n)) => {
                assert_eq!(n.kind, TrafficNotificationKind::SignificantChange);
                assert_eq!(n.from, Some(TrafficLevel::Smooth));
                assert_eq!(n.to, TrafficLevel::Congested);
                assert_eq!(n.priority, Priority::Medium);
            }
            other => panic!("unexpected event {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_rise_of_one_level_is_not_significant() {
        let (mut aggregator, feed, mut events) = aggregator_with_feed();
        aggregator.start_monitoring(vec![plain_zone()], at(6, 12, 0));

        aggregator.sample_tick(at(6, 12, 0)).await;
        feed.set(Ok(Some(2)));
        let second = aggregator.sample_tick(at(6, 12, 5)).await;
        assert_eq!(second[0].level, TrafficLevel::Slow);
        assert!(!second[0].significant_change);
        assert!(events.drain().is_empty());
    }

    #[tokio::test]
    async fn test_three_level_jump_is_high_priority() {
        let (mut aggregator, feed, mut events) = aggregator_with_feed();
        aggregator.start_monitoring(vec![plain_zone()], at(6, 12, 0));
        aggregator.sample_tick(at(6, 12, 0)).await;
        feed.set(Ok(Some(4)));
        aggregator.sample_tick(at(6, 12, 5)).await;

        match events.try_next() {
            Some(Event::TrafficNotification(n)) => assert_eq!(n.priority, Priority::High),
            other => panic!("unexpected event {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_notification_once_per_session() {
        let (mut aggregator, feed, mut events) = aggregator_with_feed();
        aggregator.start_monitoring(vec![plain_zone()], at(6, 12, 0));

        for (minute, level) in [(0, 1), (5, 3), (10, 1), (15, 3)] {
            feed.set(Ok(Some(level)));
            aggregator.sample_tick(at(6, 12, minute)).await;
        }
        assert_eq!(events.drain().len(), 1);

        // Restart clears the notified set
        aggregator.stop_monitoring();
        aggregator.start_monitoring(vec![plain_zone()], at(6, 13, 0));
        feed.set(Ok(Some(1)));
        aggregator.sample_tick(at(6, 13, 0)).await;
        feed.set(Ok(Some(3)));
        aggregator.sample_tick(at(6, 13, 5)).await;
        assert_eq!(events.drain().len(), 1);
    }

    #[tokio::test]
    async fn test_feed_failures_fall_back_to_local_level() {
        let (mut aggregator, feed, _) = aggregator_with_feed();
        aggregator.start_monitoring(vec![plain_zone()], at(6, 12, 0));

        feed.set(Err("timeout".to_string()));
        assert_eq!(aggregator.sample_tick(at(6, 12, 0)).await[0].level, TrafficLevel::Smooth);

        feed.set(Ok(Some(9)));
        assert_eq!(aggregator.sample_tick(at(6, 12, 5)).await[0].level, TrafficLevel::Smooth);

        let bus = EventBus::new(8);
        let mut no_feed = TrafficRiskAggregator::new(TrafficConfig::default(), bus, None);
        no_feed.start_monitoring(vec![plain_zone()], at(6, 12, 0));
        assert_eq!(no_feed.sample_tick(at(6, 12, 0)).await[0].level, TrafficLevel::Smooth);
    }

    #[tokio::test]
    async fn test_time_of_day_factors() {
        let overlay = CongestionOverlay {
            id: "market".to_string(),
            name: "Market street".to_string(),
            center: jiujiang(),
            radius_m: 2_000.0,
            level: TrafficLevel::Smooth,
            peak_windows: vec![PeakWindow::parse("07:30-09:00").unwrap()],
            tourist_peak: true,
            weather_sensitive: false,
            alternative_routes: Vec::new(),
        };
        let config = TrafficConfig {
            congestion_overlays: vec![overlay.clone()],
            ..TrafficConfig::default()
        };
        let mut aggregator = TrafficRiskAggregator::new(config, EventBus::new(8), None);
        let zone = plain_zone().with_overlay(&overlay);
        aggregator.start_monitoring(vec![zone], at(6, 8, 0));

        // Monday inside the peak window
        assert_eq!(aggregator.sample_tick(at(6, 8, 0)).await[0].level, TrafficLevel::Slow);
        // Monday outside it
        assert_eq!(aggregator.sample_tick(at(6, 12, 0)).await[0].level, TrafficLevel::Smooth);
        // Saturday tourist peak
        let weekend = aggregator.sample_tick(at(11, 12, 0)).await;
        assert_eq!(weekend[0].level, TrafficLevel::Congested);
        assert!(weekend[0].factors.iter().any(|f| f.contains("weekend")));
    }

    #[tokio::test]
    async fn test_construction_slows_nearby_zone() {
        let bus = EventBus::new(8);
        let mut aggregator = TrafficRiskAggregator::new(TrafficConfig::default(), bus, None);
        let near_works = MonitoringZone::new("zone_0", "Shaoxing north", GpsPoint::new(30.21, 120.81), 10_000.0);
        aggregator.start_monitoring(vec![near_works, plain_zone()], at(6, 12, 0));

        let samples = aggregator.sample_tick(at(6, 12, 0)).await;
        assert_eq!(samples[0].level, TrafficLevel::Slow);
        assert!(samples[0].advice.iter().any(|a| a.contains("S4")));
        assert_eq!(samples[1].level, TrafficLevel::Smooth);
    }

    #[tokio::test]
    async fn test_poll_follows_ticker_and_stop_is_idempotent() {
        let bus = EventBus::new(8);
        let mut aggregator = TrafficRiskAggregator::new(TrafficConfig::default(), bus, None);
        assert!(aggregator.poll(at(6, 12, 0)).await.is_none());

        aggregator.start_monitoring(vec![plain_zone()], at(6, 12, 0));
        assert!(aggregator.poll(at(6, 12, 0)).await.is_some());
        assert!(aggregator.poll(at(6, 12, 4)).await.is_none());
        assert!(aggregator.poll(at(6, 12, 5)).await.is_some());

        aggregator.stop_monitoring();
        aggregator.stop_monitoring();
        assert!(!aggregator.is_monitoring());
        assert!(aggregator.poll(at(6, 12, 0) + Duration::hours(1)).await.is_none());

        let status = aggregator.status();
        assert_eq!(status.zone_count, 1);
        assert_eq!(status.sampled_zones, 1);
        assert_eq!(status.last_sample_at, Some(at(6, 12, 5)));
    }

    #[tokio::test]
    async fn test_analyze_route() {
        let (mut aggregator, feed, _) = aggregator_with_feed();
        let route = Route::from_named_points(
            GpsPoint::new(29.70, 116.10),
            &[("Jiujiang", jiujiang())],
        )
        .unwrap();
        let zones = aggregator.zones_from_route(&route);
        aggregator.start_monitoring(zones, at(6, 12, 0));

        assert_eq!(aggregator.analyze_route(&route).zones.len(), 0);

        feed.set(Ok(Some(3)));
        aggregator.sample_tick(at(6, 12, 0)).await;
        let analysis = aggregator.analyze_route(&route);
        assert_eq!(analysis.overall_level, TrafficLevel::Congested);
        assert_eq!(analysis.total_delay_minutes, 15);
        assert_eq!(analysis.recommendation, Recommendation::ConsiderAlternative);
    }

    #[test]
    fn test_recommendation_thresholds() {
        assert_eq!(Recommendation::select(TrafficLevel::Heavy, 0), Recommendation::AvoidOrDelay);
        assert_eq!(Recommendation::select(TrafficLevel::Congested, 0), Recommendation::ConsiderAlternative);
        assert_eq!(Recommendation::select(TrafficLevel::Slow, 35), Recommendation::AllowExtraTime);
        assert_eq!(Recommendation::select(TrafficLevel::Slow, 30), Recommendation::ProceedAsPlanned);
    }

    #[test]
    fn test_entering_congestion_zone_once() {
        let (mut aggregator, _, mut events) = aggregator_with_feed();
        let update = PositionUpdate {
            current: Position::new(GpsPoint::new(29.87, 121.55), 5.0, at(6, 8, 0)),
            previous: None,
        };

        // Not monitoring yet
        aggregator.on_position_update(&update);
        assert!(events.drain().is_empty());

        aggregator.start_monitoring(Vec::new(), at(6, 8, 0));
        aggregator.on_position_update(&update);
        aggregator.on_position_update(&update);
        let raised = events.drain();
        assert_eq!(raised.len(), 1);
        match &raised[0] {
            Event::TrafficNotification(n) => {
                assert_eq!(n.kind, TrafficNotificationKind::EnteringCongestionZone);
                assert_eq!(n.zone_id, "ningbo_city_center");
            }
            other => panic!("unexpected event {:?}", other),
        }
    }

    #[test]
    fn test_overlays_round_trip_through_json() {
        let json = serde_json::to_string(&seed_congestion_overlays()).unwrap();
        let parsed: Vec<CongestionOverlay> = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, seed_congestion_overlays());
        assert!(json.contains("\"07:30-09:00\""));
    }
}
