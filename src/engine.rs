//! Composition root.
//!
//! [`RideEngine`] owns one instance of every component, wires them to a
//! shared [`EventBus`] and drives them from a single task: watch samples are
//! filtered by the tracker and forwarded to navigation and traffic, and a
//! heartbeat polls the traffic, decision and refresh timers.

use std::sync::Arc;

use chrono::NaiveDateTime;
use log::{debug, info, warn};
use tokio::sync::watch;
use tokio::time::{interval, MissedTickBehavior};

use crate::collaborators::{
    BatteryMonitor, LocationSource, NetworkMonitor, RoutePlanner, TrafficSignalSource, TripStore, WeatherSource,
};
use crate::decision::{CycleReport, CycleSnapshot, DecisionCycleScheduler};
use crate::events::{EventBus, EventKind, EventSubscriber, PositionUpdate};
use crate::navigation::RouteProgressEngine;
use crate::route::Route;
use crate::schedule::Clock;
use crate::tracker::PositionTracker;
use crate::traffic::TrafficRiskAggregator;
use crate::{EngineConfig, EngineError, LocationError, Position};

/// Optional external signals. Any of them may be absent.
#[derive(Clone, Default)]
pub struct SignalSources {
    pub weather: Option<Arc<dyn WeatherSource>>,
    pub battery: Option<Arc<dyn BatteryMonitor>>,
    pub network: Option<Arc<dyn NetworkMonitor>>,
    pub trip_store: Option<Arc<dyn TripStore>>,
    pub traffic: Option<Arc<dyn TrafficSignalSource>>,
}

pub struct RideEngine {
    config: EngineConfig,
    clock: Arc<dyn Clock>,
    bus: EventBus,
    tracker: PositionTracker,
    navigation: RouteProgressEngine,
    traffic: TrafficRiskAggregator,
    decision: DecisionCycleScheduler,
    sources: SignalSources,
}

impl RideEngine {
    pub fn new(
        config: EngineConfig,
        clock: Arc<dyn Clock>,
        location: Arc<dyn LocationSource>,
        sources: SignalSources,
    ) -> Result<Self, EngineError> {
        config.validate()?;
        let bus = EventBus::new(config.runtime.event_capacity);
        Ok(Self {
            tracker: PositionTracker::new(config.tracker.clone(), location, bus.clone()),
            navigation: RouteProgressEngine::new(config.navigation.clone(), bus.clone()),
            traffic: TrafficRiskAggregator::new(config.traffic.clone(), bus.clone(), sources.traffic.clone()),
            decision: DecisionCycleScheduler::new(config.decision.clone(), bus.clone()),
            config,
            clock,
            bus,
            sources,
        })
    }

    pub fn bus(&self) -> &EventBus {
        &self.bus
    }

    pub fn subscribe(&self, kinds: &[EventKind]) -> EventSubscriber {
        self.bus.subscribe_to(kinds)
    }

    pub fn tracker(&self) -> &PositionTracker {
        &self.tracker
    }

    pub fn tracker_mut(&mut self) -> &mut PositionTracker {
        &mut self.tracker
    }

    pub fn navigation(&self) -> &RouteProgressEngine {
        &self.navigation
    }

    pub fn navigation_mut(&mut self) -> &mut RouteProgressEngine {
        &mut self.navigation
    }

    pub fn traffic(&self) -> &TrafficRiskAggregator {
        &self.traffic
    }

    pub fn decision(&self) -> &DecisionCycleScheduler {
        &self.decision
    }

    /// Subscribe to the device and arm the decision cycle.
    pub fn start(&mut self) -> Result<(), EngineError> {
        let now = self.clock.now();
        self.tracker.start_tracking(now)?;
        self.decision.activate(now);
        info!("[RideEngine] Started");
        Ok(())
    }

    /// Stop every component. Idempotent.
    pub fn shutdown(&mut self) {
        self.stop_navigation();
        self.decision.deactivate();
        self.tracker.stop_tracking();
        info!("[RideEngine] Shut down");
    }

    // ------------------------------------------------------------------------
    // Navigation sessions
    // ------------------------------------------------------------------------

    /// Start navigating `route` and monitor traffic along it.
    pub fn start_navigation(&mut self, route: Route) -> Result<(), EngineError> {
        let now = self.clock.now();
        let zones = self.traffic.zones_from_route(&route);
        self.navigation.start(route, now)?;
        self.traffic.start_monitoring(zones, now);
        Ok(())
    }

    /// Plan a route from the current accepted position and start on it.
    pub async fn plan_and_start_navigation(&mut self, planner: &dyn RoutePlanner) -> Result<(), EngineError> {
        let origin = self
            .tracker
            .current()
            .ok_or_else(|| EngineError::RouteUnavailable("no position fix yet".to_string()))?;
        let now = self.clock.now();
        self.navigation.plan_and_start(planner, origin.point, now).await?;
        if let Some(route) = self.navigation.route() {
            let zones = self.traffic.zones_from_route(route);
            self.traffic.start_monitoring(zones, now);
        }
        Ok(())
    }

    pub fn stop_navigation(&mut self) {
        self.navigation.stop();
        self.traffic.stop_monitoring();
    }

    // ------------------------------------------------------------------------
    // Position flow
    // ------------------------------------------------------------------------

    /// Feed one watch item through the tracker and forward an accepted position.
    pub fn ingest(&mut self, item: Result<Position, LocationError>) -> Option<PositionUpdate> {
        match self.tracker.handle_watch_item(item) {
            Ok(Some(update)) => {
                self.handle_position_update(&update);
                Some(update)
            }
            Ok(None) => None,
            Err(EngineError::Location(_)) => None,
            Err(e) => {
                warn!("[RideEngine] Rejected sample: {}", e);
                None
            }
        }
    }

    pub fn handle_position_update(&mut self, update: &PositionUpdate) {
        let was_navigating = self.navigation.is_navigating();
        self.navigation.on_position_update(update);
        self.traffic.on_position_update(update);
        if was_navigating && !self.navigation.is_navigating() {
            debug!("[RideEngine] Session finished, stopping traffic monitoring");
            self.traffic.stop_monitoring();
        }
    }

    // ------------------------------------------------------------------------
    // Timers
    // ------------------------------------------------------------------------

    /// Gather the decision cycle's inputs. Failing collaborators become unknown.
    pub async fn collect_snapshot(&self, now: NaiveDateTime) -> CycleSnapshot {
        let position = self.tracker.current();
        let near = position.map(|p| p.point);

        let weather = async {
            match &self.sources.weather {
                Some(src) => src
                    .current_weather(near)
                    .await
                    .map_err(|e| warn!("[RideEngine] Weather unavailable: {}", e))
                    .ok(),
                None => None,
            }
        };
        let battery = async {
            match &self.sources.battery {
                Some(src) => src
                    .battery_level()
                    .await
                    .map_err(|e| warn!("[RideEngine] Battery level unavailable: {}", e))
                    .ok(),
                None => None,
            }
        };
        let network = async {
            match &self.sources.network {
                Some(src) => src
                    .is_reachable()
                    .await
                    .map_err(|e| warn!("[RideEngine] Network state unavailable: {}", e))
                    .ok(),
                None => None,
            }
        };
        let trip = async {
            match &self.sources.trip_store {
                Some(src) => src
                    .trip_progress()
                    .await
                    .map_err(|e| warn!("[RideEngine] Trip progress unavailable: {}", e))
                    .ok(),
                None => None,
            }
        };
        let (weather, battery, network_reachable, trip) = futures::join!(weather, battery, network, trip);

        CycleSnapshot {
            now,
            position,
            navigation: self.navigation.state(),
            route_traffic: self
                .navigation
                .route()
                .map(|route| self.traffic.analyze_route(route).overall_level),
            weather,
            battery,
            network_reachable,
            trip,
        }
    }

    /// Run whatever periodic work is due at `now`. Returns the decision
    /// cycle's report if one ran.
    pub async fn poll_timers(&mut self, now: NaiveDateTime) -> Option<CycleReport> {
        self.traffic.poll(now).await;

        if self.tracker.refresh_due(now) {
            if let Ok(Some(update)) = self.tracker.acquire_current().await {
                self.handle_position_update(&update);
            }
        }

        if !self.decision.is_due(now) {
            return None;
        }
        let snapshot = self.collect_snapshot(now).await;
        let store = self.sources.trip_store.clone();
        Some(
            self.decision
                .run_cycle(snapshot, &mut self.tracker, store.as_deref())
                .await,
        )
    }

    /// Drive the engine until `shutdown` turns true or its sender is dropped.
    ///
    /// Call [`start`](Self::start) first.
    pub async fn run(&mut self, mut shutdown: watch::Receiver<bool>) {
        let mut heartbeat = interval(std::time::Duration::from_millis(self.config.runtime.heartbeat_ms));
        heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);

        while !*shutdown.borrow() {
            tokio::select! {
                item = self.tracker.next_watch_item() => {
                    self.ingest(item);
                }
                _ = heartbeat.tick() => {
                    let now = self.clock.now();
                    self.poll_timers(now).await;
                }
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
            }
        }

        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collaborators::{TripProgress, WeatherSummary};
    use crate::decision::{Suggestion, SuggestionType};
    use crate::events::Event;
    use crate::geo_utils::destination_point;
    use crate::schedule::ManualClock;
    use crate::tracker::tests::{t0, FakeLocationSource};
    use crate::tracker::PowerMode;
    use crate::{GpsPoint, Position};
    use async_trait::async_trait;
    use chrono::Duration;
    use std::sync::Mutex;

    struct FixedBattery(Result<f64, String>);

    #[async_trait]
    impl BatteryMonitor for FixedBattery {
        async fn battery_level(&self) -> Result<f64, String> {
            self.0.clone()
        }
    }

    struct ClearSkies;

    #[async_trait]
    impl WeatherSource for ClearSkies {
        async fn current_weather(&self, _near: Option<GpsPoint>) -> Result<WeatherSummary, String> {
            Ok(WeatherSummary {
                description: "clear".to_string(),
                temperature_c: 22.0,
                wind_speed_mps: 2.0,
                suitable_for_riding: true,
            })
        }
    }

    #[derive(Default)]
    struct MemoryTripStore {
        log: Mutex<Vec<Suggestion>>,
    }

    #[async_trait]
    impl TripStore for MemoryTripStore {
        async fn trip_progress(&self) -> Result<TripProgress, String> {
            Ok(TripProgress {
                today_distance_km: 75.0,
                average_speed_kmh: 17.0,
                rest_stop_count: 3,
            })
        }

        async fn record_suggestion(&self, suggestion: &Suggestion) -> Result<(), String> {
            self.log.lock().unwrap().push(suggestion.clone());
            Ok(())
        }
    }

    fn ningbo() -> GpsPoint {
        GpsPoint::new(29.8683, 121.5440)
    }

    fn engine_with(sources: SignalSources) -> (RideEngine, Arc<FakeLocationSource>, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::new(t0()));
        let location = Arc::new(FakeLocationSource::default());
        let engine = RideEngine::new(EngineConfig::default(), clock.clone(), location.clone(), sources).unwrap();
        (engine, location, clock)
    }

    fn sample(point: GpsPoint, at: NaiveDateTime) -> Result<Position, LocationError> {
        Ok(Position::new(point, 6.0, at))
    }

    #[test]
    fn test_invalid_config_rejected() {
        let mut config = EngineConfig::default();
        config.tracker.accuracy_threshold_m = 0.0;
        let result = RideEngine::new(
            config,
            Arc::new(ManualClock::new(t0())),
            Arc::new(FakeLocationSource::default()),
            SignalSources::default(),
        );
        assert!(matches!(result, Err(EngineError::InvalidConfig(_))));
    }

    #[tokio::test]
    async fn test_ride_end_to_end() {
        let store = Arc::new(MemoryTripStore::default());
        let sources = SignalSources {
            weather: Some(Arc::new(ClearSkies)),
            battery: Some(Arc::new(FixedBattery(Ok(0.12)))),
            trip_store: Some(store.clone()),
            ..Default::default()
        };
        let (mut engine, _, clock) = engine_with(sources);
        let mut events = engine.bus().subscribe();

        let wp1 = destination_point(&ningbo(), 1.0, 0.0);
        let wp2 = destination_point(&wp1, 1.0, 90.0);
        let route = Route::from_named_points(ningbo(), &[("Gate", wp1), ("Harbour", wp2)]).unwrap();

        engine.start().unwrap();
        engine.start_navigation(route).unwrap();
        assert!(engine.traffic().is_monitoring());

        // Rider at the start: inside the Ningbo city centre overlay
        assert!(engine.ingest(sample(ningbo(), clock.now())).is_some());
        clock.advance(Duration::minutes(4));
        engine.ingest(sample(wp1, clock.now()));
        assert_eq!(engine.navigation().state().current_step_index, 1);

        // Traffic sample and the first decision cycle are both due
        let report = engine.poll_timers(clock.now()).await.unwrap();
        assert!(report.executed.contains(&crate::SuggestionAction::EnableReducedPowerMode));
        assert_eq!(engine.tracker().mode(), PowerMode::ReducedPower);
        assert_eq!(
            report.published.as_ref().map(|s| s.suggestion_type),
            Some(SuggestionType::BatterySaving)
        );
        assert_eq!(store.log.lock().unwrap().len(), 1);
        assert_eq!(engine.traffic().status().sampled_zones, 2);

        clock.advance(Duration::minutes(4));
        engine.ingest(sample(wp2, clock.now()));
        assert!(!engine.navigation().is_navigating());
        assert!(!engine.traffic().is_monitoring());

        let kinds: Vec<EventKind> = events.drain().iter().map(Event::kind).collect();
        for expected in [
            EventKind::NavigationStarted,
            EventKind::PositionUpdate,
            EventKind::TrafficNotification,
            EventKind::SuggestionPublished,
            EventKind::DestinationReached,
        ] {
            assert!(kinds.contains(&expected), "missing {:?} in {:?}", expected, kinds);
        }
    }

    #[tokio::test]
    async fn test_failing_collaborators_degrade_to_unknown() {
        let sources = SignalSources {
            battery: Some(Arc::new(FixedBattery(Err("no battery api".to_string())))),
            ..Default::default()
        };
        let (engine, _, clock) = engine_with(sources);
        let snapshot = engine.collect_snapshot(clock.now()).await;
        assert_eq!(snapshot.battery, None);
        assert_eq!(snapshot.weather, None);
        assert_eq!(snapshot.trip, None);
        assert_eq!(snapshot.route_traffic, None);
    }

    #[tokio::test]
    async fn test_planning_needs_a_fix() {
        struct OneLeg;

        #[async_trait]
        impl RoutePlanner for OneLeg {
            async fn plan_route(&self, origin: GpsPoint) -> Result<Route, String> {
                Route::from_named_points(origin, &[("Cafe", destination_point(&origin, 2.0, 45.0))])
                    .map_err(|e| e.to_string())
            }
        }

        let (mut engine, _, clock) = engine_with(SignalSources::default());
        engine.start().unwrap();
        let err = engine.plan_and_start_navigation(&OneLeg).await.unwrap_err();
        assert!(matches!(err, EngineError::RouteUnavailable(_)));

        engine.ingest(sample(GpsPoint::new(29.0, 118.0), clock.now()));
        engine.plan_and_start_navigation(&OneLeg).await.unwrap();
        assert!(engine.navigation().is_navigating());
        assert_eq!(engine.traffic().zones().len(), 1);

        engine.stop_navigation();
        engine.stop_navigation();
        assert!(!engine.traffic().is_monitoring());
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_loop_processes_samples_until_shutdown() {
        let (mut engine, location, clock) = engine_with(SignalSources::default());
        let mut published = engine.subscribe(&[EventKind::SuggestionPublished]);
        engine.start().unwrap();
        location.emit(sample(ningbo(), clock.now()));

        let (tx, rx) = watch::channel(false);
        tokio::spawn(async move {
            tokio::time::sleep(std::time::Duration::from_secs(5)).await;
            let _ = tx.send(true);
        });
        engine.run(rx).await;

        assert_eq!(engine.tracker().current().map(|p| p.point), Some(ningbo()));
        assert!(!engine.tracker().is_tracking());
        // First heartbeat ran the immediate decision cycle
        let first = published.try_next();
        assert_eq!(first, Some(Event::SuggestionPublished(Suggestion::all_good())));
    }
}
