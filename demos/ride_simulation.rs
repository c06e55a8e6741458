//! Simulated ride from Ningbo city centre across the first two waypoints.
//!
//! Drives the engine with a manual clock and synthetic samples, printing
//! every published event as JSON.
//!
//! Run with: cargo run --example ride_simulation

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{Duration, NaiveDate};
use ride_assist::geo_utils::{bearing_degrees, destination_point, distance_km};
use ride_assist::{
    AcquisitionOptions, BatteryMonitor, Clock, EngineConfig, GpsPoint, LocationError, LocationSource, ManualClock,
    Position, RideEngine, Route, SampleReceiver, SignalSources, TripProgress, TripStore, WatchId, Suggestion,
};
use tokio::sync::mpsc;

/// Location source whose watch never delivers; samples are injected directly.
#[derive(Default)]
struct SilentGps {
    open: Mutex<Vec<mpsc::UnboundedSender<Result<Position, LocationError>>>>,
}

#[async_trait]
impl LocationSource for SilentGps {
    async fn current_position(&self, _options: &AcquisitionOptions) -> Result<Position, LocationError> {
        Err(LocationError::Unavailable("simulation".to_string()))
    }

    fn watch_position(&self, options: &AcquisitionOptions) -> Result<(WatchId, SampleReceiver), LocationError> {
        println!("   [gps] watch every {}s, high accuracy: {}", options.interval_secs, options.high_accuracy);
        let (tx, rx) = mpsc::unbounded_channel();
        let mut open = self.open.lock().map_err(|_| LocationError::Unavailable("poisoned".to_string()))?;
        open.push(tx);
        Ok((WatchId(open.len() as u64), rx))
    }

    fn clear_watch(&self, _id: WatchId) {}
}

struct DrainingBattery;

#[async_trait]
impl BatteryMonitor for DrainingBattery {
    async fn battery_level(&self) -> Result<f64, String> {
        Ok(0.18)
    }
}

struct PrintingTripStore;

#[async_trait]
impl TripStore for PrintingTripStore {
    async fn trip_progress(&self) -> Result<TripProgress, String> {
        Ok(TripProgress {
            today_distance_km: 48.0,
            average_speed_kmh: 16.5,
            rest_stop_count: 4,
        })
    }

    async fn record_suggestion(&self, suggestion: &Suggestion) -> Result<(), String> {
        println!("   [trip log] {}", suggestion.title);
        Ok(())
    }
}

#[tokio::main(flavor = "current_thread")]
async fn main() {
    let start_time = NaiveDate::from_ymd_opt(2024, 5, 6)
        .and_then(|d| d.and_hms_opt(8, 15, 0))
        .unwrap();
    let clock = Arc::new(ManualClock::new(start_time));

    let sources = SignalSources {
        battery: Some(Arc::new(DrainingBattery)),
        trip_store: Some(Arc::new(PrintingTripStore)),
        ..Default::default()
    };
    let mut engine = RideEngine::new(EngineConfig::default(), clock.clone(), Arc::new(SilentGps::default()), sources)
        .expect("default config is valid");
    let mut events = engine.bus().subscribe();

    let start = GpsPoint::new(29.8683, 121.5440);
    let gate = destination_point(&start, 1.2, 330.0);
    let bridge_road = destination_point(&gate, 2.0, 300.0);
    let route = Route::from_named_points(start, &[("North gate", gate), ("Bridge road", bridge_road)]).unwrap();

    println!("Ride simulation\n");
    engine.start().unwrap();
    engine.start_navigation(route).unwrap();

    // Ride each leg in 100 m steps, one sample every 20 s
    let mut here = start;
    for target in [gate, bridge_road] {
        while distance_km(&here, &target) > 0.1 {
            let bearing = bearing_degrees(&here, &target);
            here = destination_point(&here, 0.1, bearing);
            clock.advance(Duration::seconds(20));
            engine.ingest(Ok(Position::new(here, 8.0, clock.now()).with_speed(5.0)));
            engine.poll_timers(clock.now()).await;
        }
        clock.advance(Duration::seconds(20));
        engine.ingest(Ok(Position::new(target, 6.0, clock.now()).with_speed(5.0)));
        here = target;
    }

    for event in events.drain() {
        match serde_json::to_string(&event) {
            Ok(json) => println!("{json}"),
            Err(e) => println!("unserializable event: {e}"),
        }
    }

    let snapshot = engine.tracker().snapshot();
    println!("\nTracker: {:?}, quality {:?}, mode {:?}", snapshot.current.map(|p| p.point), snapshot.signal_quality, snapshot.mode);
    engine.shutdown();
}
