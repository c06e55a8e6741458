//! Turn-by-turn progress through a route.
//!
//! [`RouteProgressEngine`] is a two-state machine (`Idle` ⇄ `Navigating`)
//! driven by accepted position updates. While navigating it tracks the
//! current waypoint, distance and ETA to it, the remaining route distance,
//! and throttles voice prompts into a small set of distance bands.

use chrono::{Duration, NaiveDateTime};
use log::{debug, info};
use serde::{Deserialize, Serialize};

use crate::collaborators::RoutePlanner;
use crate::events::{DestinationReached, Event, EventBus, NavigationStarted, NavigationStopped, PositionUpdate, TurnInstruction};
use crate::geo_utils::distance_m;
use crate::route::Route;
use crate::{EngineError, GpsPoint, NavigationConfig};

/// One voice announcement band: fires when the distance to the next turn is
/// within `(inner_m, outer_m]` and no prompt has played for `cooldown_secs`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct VoiceBand {
    pub outer_m: f64,
    pub inner_m: f64,
    pub cooldown_secs: u64,
}

impl VoiceBand {
    pub fn contains(&self, distance_m: f64) -> bool {
        distance_m > self.inner_m && distance_m <= self.outer_m
    }
}

/// By-value view of the navigation session.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct NavigationState {
    pub is_active: bool,
    pub current_step_index: usize,
    pub next_instruction_text: String,
    pub distance_to_next_turn_km: f64,
    pub eta_seconds: f64,
    pub remaining_distance_km: f64,
    pub last_voice_announcement_at: Option<NaiveDateTime>,
}

impl Default for NavigationState {
    fn default() -> Self {
        Self {
            is_active: false,
            current_step_index: 0,
            next_instruction_text: String::new(),
            distance_to_next_turn_km: 0.0,
            eta_seconds: 0.0,
            remaining_distance_km: 0.0,
            last_voice_announcement_at: None,
        }
    }
}

struct Session {
    route: Route,
    total_distance_km: f64,
    started_at: NaiveDateTime,
}

pub struct RouteProgressEngine {
    config: NavigationConfig,
    bus: EventBus,
    session: Option<Session>,
    state: NavigationState,
}

impl RouteProgressEngine {
    pub fn new(mut config: NavigationConfig, bus: EventBus) -> Self {
        // Nearest band first so the first match wins
        config.voice_bands.sort_by(|a, b| a.outer_m.total_cmp(&b.outer_m));
        Self {
            config,
            bus,
            session: None,
            state: NavigationState::default(),
        }
    }

    pub fn is_navigating(&self) -> bool {
        self.session.is_some()
    }

    pub fn state(&self) -> NavigationState {
        self.state.clone()
    }

    pub fn route(&self) -> Option<&Route> {
        self.session.as_ref().map(|s| &s.route)
    }

    pub fn voice_enabled(&self) -> bool {
        self.config.voice_enabled
    }

    pub fn set_voice_enabled(&mut self, enabled: bool) {
        self.config.voice_enabled = enabled;
        info!("[Navigation] Voice prompts {}", if enabled { "enabled" } else { "disabled" });
    }

    /// Begin a session on `route`.
    ///
    /// Fails with [`EngineError::AlreadyNavigating`] if a session is active;
    /// the active session is left untouched.
    pub fn start(&mut self, route: Route, now: NaiveDateTime) -> Result<(), EngineError> {
        if self.session.is_some() {
            return Err(EngineError::AlreadyNavigating);
        }

        let total_distance_km = route.total_distance_km();
        let initial_eta_seconds = route
            .supplied_duration_seconds()
            .unwrap_or_else(|| total_distance_km / self.config.average_speed_kmh * 3600.0);
        let first = &route.waypoints()[0];

        self.state = NavigationState {
            is_active: true,
            current_step_index: 0,
            next_instruction_text: first.name.clone(),
            distance_to_next_turn_km: distance_m(&route.start_point(), &first.point) / 1000.0,
            eta_seconds: initial_eta_seconds,
            remaining_distance_km: total_distance_km,
            last_voice_announcement_at: None,
        };

        let destination = route.destination().name.clone();
        info!(
            "[Navigation] Started to {} ({:.1} km, {} waypoints, ETA {:.0} min)",
            destination,
            total_distance_km,
            route.len(),
            initial_eta_seconds / 60.0
        );

        self.session = Some(Session {
            route,
            total_distance_km,
            started_at: now,
        });

        self.bus.publish(Event::NavigationStarted(NavigationStarted {
            destination,
            total_distance_km,
            initial_eta_seconds,
            started_at: now,
        }));
        Ok(())
    }

    /// Ask the planner for a route from `origin` and start on it.
    ///
    /// Planner failures become [`EngineError::RouteUnavailable`] and leave the
    /// engine idle.
    pub async fn plan_and_start(
        &mut self,
        planner: &dyn RoutePlanner,
        origin: GpsPoint,
        now: NaiveDateTime,
    ) -> Result<(), EngineError> {
        if self.session.is_some() {
            return Err(EngineError::AlreadyNavigating);
        }
        let route = planner
            .plan_route(origin)
            .await
            .map_err(EngineError::RouteUnavailable)?;
        self.start(route, now)
    }

    /// End the session. A no-op while idle.
    pub fn stop(&mut self) {
        if self.session.take().is_none() {
            return;
        }
        let remaining_distance_km = self.state.remaining_distance_km;
        self.state = NavigationState::default();
        info!("[Navigation] Stopped with {:.1} km remaining", remaining_distance_km);
        self.bus
            .publish(Event::NavigationStopped(NavigationStopped { remaining_distance_km }));
    }

    /// Advance the session with an accepted position. Ignored while idle.
    pub fn on_position_update(&mut self, update: &PositionUpdate) {
        let Some(session) = self.session.as_ref() else {
            return;
        };
        let current = &update.current;
        let waypoints = session.route.waypoints();
        let last_index = waypoints.len() - 1;
        let index = self.state.current_step_index;

        let mut to_target_m = distance_m(&current.point, &waypoints[index].point);
        let arrival_m = if index == last_index {
            self.config.destination_arrival_m
        } else {
            self.config.waypoint_arrival_m
        };

        if to_target_m < arrival_m {
            if index == last_index {
                self.arrive(current.captured_at);
                return;
            }
            let next = &waypoints[index + 1];
            debug!("[Navigation] Reached '{}', next '{}'", waypoints[index].name, next.name);
            self.state.current_step_index = index + 1;
            self.state.next_instruction_text = next.name.clone();
            to_target_m = distance_m(&current.point, &next.point);
        }

        let step = self.state.current_step_index;
        self.state.distance_to_next_turn_km = to_target_m / 1000.0;
        self.state.remaining_distance_km = to_target_m / 1000.0 + session.route.distance_after_km(step);

        let speed_mps = match current.speed_mps {
            Some(observed) => observed.max(self.config.min_speed_mps),
            None => self.config.average_speed_kmh / 3.6,
        };
        self.state.eta_seconds = to_target_m / speed_mps;

        self.maybe_announce(to_target_m, step == last_index, current.captured_at);
    }

    fn maybe_announce(&mut self, to_target_m: f64, final_leg: bool, at: NaiveDateTime) {
        if !self.config.voice_enabled {
            return;
        }
        if self.session.is_none() {
            return;
        }
        let Some(band) = self.config.voice_bands.iter().find(|b| b.contains(to_target_m)).copied() else {
            return;
        };

        // Every band's cooldown runs from the last prompt of any band
        let cooled_down = match self.state.last_voice_announcement_at {
            Some(last) => at - last >= Duration::seconds(band.cooldown_secs as i64),
            None => true,
        };
        if !cooled_down {
            return;
        }

        let label = &self.state.next_instruction_text;
        let instruction = if final_leg {
            format!("arrive at {label}")
        } else {
            format!("head to {label}")
        };
        let text = format!("In {:.0} m, {}", band.outer_m, instruction);

        self.state.last_voice_announcement_at = Some(at);
        debug!("[Navigation] Announcing: {}", text);

        self.bus.publish(Event::TurnInstruction(TurnInstruction {
            band_m: band.outer_m,
            distance_m: to_target_m,
            instruction,
            text,
        }));
    }

    fn arrive(&mut self, at: NaiveDateTime) {
        let Some(session) = self.session.take() else {
            return;
        };
        let destination = session.route.destination().name.clone();
        let elapsed_seconds = (at - session.started_at).num_seconds();
        info!("[Navigation] Arrived at {} after {} s", destination, elapsed_seconds);

        self.state = NavigationState::default();
        self.bus.publish(Event::DestinationReached(DestinationReached {
            destination,
            total_distance_km: session.total_distance_km,
            elapsed_seconds,
        }));
    }
}
