//! Periodic decision cycle.
//!
//! Once per period (and once immediately on activation) the scheduler takes a
//! read-only [`CycleSnapshot`] of the ride, derives progress, risks and
//! opportunities, turns them into suggestions with fixed rules, applies the
//! auto-executable ones and publishes the single highest-priority suggestion.

use chrono::{NaiveDateTime, Timelike};
use log::{debug, error, info, warn};
use serde::Serialize;

use crate::collaborators::{ActionExecutor, TripProgress, TripStore, WeatherSummary};
use crate::events::{Event, EventBus};
use crate::navigation::NavigationState;
use crate::schedule::Ticker;
use crate::traffic::TrafficLevel;
use crate::{DecisionConfig, EngineError, Position};

/// Ranking order is `High > Medium > Low`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    Low,
    Medium,
    High,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SuggestionType {
    RouteAdjustment,
    AccommodationChange,
    RestRecommendation,
    WeatherWarning,
    SpeedAdjustment,
    BatterySaving,
    Status,
}

/// Low-risk, reversible actions the engine may apply on its own.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SuggestionAction {
    EnableReducedPowerMode,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Suggestion {
    pub suggestion_type: SuggestionType,
    pub title: String,
    pub text: String,
    pub priority: Priority,
    pub auto_executable: bool,
    pub action: Option<SuggestionAction>,
}

impl Suggestion {
    fn manual(suggestion_type: SuggestionType, title: &str, text: &str, priority: Priority) -> Self {
        Self {
            suggestion_type,
            title: title.to_string(),
            text: text.to_string(),
            priority,
            auto_executable: false,
            action: None,
        }
    }

    fn automatic(suggestion_type: SuggestionType, title: &str, text: &str, priority: Priority, action: SuggestionAction) -> Self {
        Self {
            auto_executable: true,
            action: Some(action),
            ..Self::manual(suggestion_type, title, text, priority)
        }
    }

    /// Shown when no rule fires.
    pub fn all_good() -> Self {
        Self::manual(
            SuggestionType::Status,
            "All good",
            "Everything looks fine, keep up the current pace",
            Priority::Low,
        )
    }
}

/// Everything a cycle reads, gathered before it runs. Unknown inputs are `None`.
#[derive(Debug, Clone, PartialEq)]
pub struct CycleSnapshot {
    pub now: NaiveDateTime,
    pub position: Option<Position>,
    pub navigation: NavigationState,
    /// Overall traffic level along the active route
    pub route_traffic: Option<TrafficLevel>,
    pub weather: Option<WeatherSummary>,
    /// Fraction in `0.0..=1.0`
    pub battery: Option<f64>,
    pub network_reachable: Option<bool>,
    pub trip: Option<TripProgress>,
}

impl CycleSnapshot {
    /// A snapshot with every external input unknown.
    pub fn empty(now: NaiveDateTime) -> Self {
        Self {
            now,
            position: None,
            navigation: NavigationState::default(),
            route_traffic: None,
            weather: None,
            battery: None,
            network_reachable: None,
            trip: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProgressAnalysis {
    pub completion_pct: f64,
    pub is_ahead: bool,
    pub is_behind: bool,
    pub today_distance_km: f64,
    pub target_km: f64,
    pub average_speed_kmh: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RiskKind {
    Weather,
    Battery,
    Network,
    Fatigue,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Risk {
    pub kind: RiskKind,
    pub severity: Priority,
    pub description: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum OpportunityKind {
    Weather,
    Progress,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Opportunity {
    pub kind: OpportunityKind,
    pub description: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Analysis {
    pub progress: Option<ProgressAnalysis>,
    pub risks: Vec<Risk>,
    pub opportunities: Vec<Opportunity>,
    pub route_traffic: Option<TrafficLevel>,
}

impl Analysis {
    pub fn has_risk(&self, kind: RiskKind) -> bool {
        self.risks.iter().any(|r| r.kind == kind)
    }
}

/// Outcome of one cycle.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CycleReport {
    pub at: NaiveDateTime,
    /// `None` when the cycle failed
    pub analysis: Option<Analysis>,
    pub suggestions: Vec<Suggestion>,
    pub executed: Vec<SuggestionAction>,
    pub published: Option<Suggestion>,
}

pub struct DecisionCycleScheduler {
    config: DecisionConfig,
    bus: EventBus,
    ticker: Ticker,
    last_report: Option<CycleReport>,
}

impl DecisionCycleScheduler {
    pub fn new(config: DecisionConfig, bus: EventBus) -> Self {
        let ticker = Ticker::from_secs(config.cycle_interval_secs);
        Self {
            config,
            bus,
            ticker,
            last_report: None,
        }
    }

    /// Start cycling; the first cycle is due immediately.
    pub fn activate(&mut self, now: NaiveDateTime) {
        if self.ticker.is_running() {
            return;
        }
        info!("[Decision] Activated, cycle every {}s", self.config.cycle_interval_secs);
        self.ticker.start_immediate(now);
    }

    /// Idempotent.
    pub fn deactivate(&mut self) {
        if self.ticker.is_running() {
            info!("[Decision] Deactivated");
        }
        self.ticker.stop();
    }

    pub fn is_active(&self) -> bool {
        self.ticker.is_running()
    }

    /// Whether a cycle is due at `now`. Re-arms the timer when it is.
    pub fn is_due(&mut self, now: NaiveDateTime) -> bool {
        self.ticker.poll(now)
    }

    pub fn last_report(&self) -> Option<&CycleReport> {
        self.last_report.as_ref()
    }

    pub fn set_daily_target_km(&mut self, target_km: f64) -> Result<(), EngineError> {
        if !(target_km.is_finite() && target_km > 0.0) {
            return Err(EngineError::InvalidConfig(format!("daily target {target_km} must be positive")));
        }
        self.config.daily_target_km = target_km;
        Ok(())
    }

    // ------------------------------------------------------------------------
    // Analysis
    // ------------------------------------------------------------------------

    pub fn analyze_progress(&self, trip: &TripProgress) -> ProgressAnalysis {
        let target_km = self.config.daily_target_km;
        let completion_pct = trip.today_distance_km / target_km * 100.0;
        ProgressAnalysis {
            completion_pct,
            is_ahead: completion_pct > self.config.ahead_threshold_pct,
            is_behind: completion_pct < self.config.behind_threshold_pct,
            today_distance_km: trip.today_distance_km,
            target_km,
            average_speed_kmh: trip.average_speed_kmh,
        }
    }

    /// Derive progress, risks and opportunities. Fails on inputs that cannot
    /// be reasoned about, such as non-finite trip distances.
    pub fn analyze(&self, snapshot: &CycleSnapshot) -> Result<Analysis, EngineError> {
        if let Some(trip) = &snapshot.trip {
            if !trip.today_distance_km.is_finite() || trip.today_distance_km < 0.0 {
                return Err(EngineError::InvalidSample(format!(
                    "trip distance {} is not a finite non-negative value",
                    trip.today_distance_km
                )));
            }
        }

        let progress = snapshot.trip.as_ref().map(|trip| self.analyze_progress(trip));
        let mut risks = Vec::new();
        let mut opportunities = Vec::new();

        if let Some(weather) = &snapshot.weather {
            if weather.suitable_for_riding {
                opportunities.push(Opportunity {
                    kind: OpportunityKind::Weather,
                    description: "Good riding weather, a chance to make up distance".to_string(),
                });
            } else {
                risks.push(Risk {
                    kind: RiskKind::Weather,
                    severity: Priority::High,
                    description: format!("Weather is not suitable for riding ({})", weather.description),
                });
            }
        }

        match snapshot.battery {
            Some(level) if !(0.0..=1.0).contains(&level) => {
                warn!("[Decision] Ignoring battery level {} outside 0..1", level);
            }
            Some(level) if level < self.config.low_battery_fraction => risks.push(Risk {
                kind: RiskKind::Battery,
                severity: Priority::Medium,
                description: format!("Device battery low ({:.0}%)", level * 100.0),
            }),
            _ => {}
        }

        if snapshot.network_reachable == Some(false) {
            risks.push(Risk {
                kind: RiskKind::Network,
                severity: Priority::Low,
                description: "Network connection lost".to_string(),
            });
        }

        if let Some(trip) = &snapshot.trip {
            if trip.rest_stop_count > self.config.fatigue_rest_stops {
                risks.push(Risk {
                    kind: RiskKind::Fatigue,
                    severity: Priority::Medium,
                    description: format!("{} rest stops today, possible fatigue", trip.rest_stop_count),
                });
            }
            if trip.today_distance_km > self.config.strong_progress_km {
                opportunities.push(Opportunity {
                    kind: OpportunityKind::Progress,
                    description: "Strong progress, consider upgrading accommodation or extending the stage".to_string(),
                });
            }
        }

        Ok(Analysis {
            progress,
            risks,
            opportunities,
            route_traffic: snapshot.route_traffic,
        })
    }

    /// One suggestion per triggering condition, in rule order.
    pub fn generate_suggestions(&self, analysis: &Analysis, now: NaiveDateTime) -> Vec<Suggestion> {
        let mut suggestions = Vec::new();

        if let Some(progress) = &analysis.progress {
            if progress.is_behind {
                suggestions.push(Suggestion::manual(
                    SuggestionType::SpeedAdjustment,
                    "Behind schedule",
                    "Progress is slow today, consider riding a little faster or longer",
                    Priority::Medium,
                ));
            } else if progress.is_ahead {
                suggestions.push(Suggestion::manual(
                    SuggestionType::AccommodationChange,
                    "Ahead of schedule",
                    "Great progress today, consider upgrading tonight's accommodation",
                    Priority::Low,
                ));
            }
        }

        for risk in &analysis.risks {
            match risk.kind {
                RiskKind::Weather => suggestions.push(Suggestion::manual(
                    SuggestionType::WeatherWarning,
                    "Weather warning",
                    &risk.description,
                    Priority::High,
                )),
                RiskKind::Battery => suggestions.push(Suggestion::automatic(
                    SuggestionType::BatterySaving,
                    "Battery saving",
                    "Battery is low, reduced power location mode enabled",
                    Priority::Medium,
                    SuggestionAction::EnableReducedPowerMode,
                )),
                RiskKind::Fatigue => suggestions.push(Suggestion::manual(
                    SuggestionType::RestRecommendation,
                    "Take a longer break",
                    "Many rest stops today, consider a longer recovery break",
                    Priority::Medium,
                )),
                RiskKind::Network => {}
            }
        }

        let hour = now.hour();
        if hour >= self.config.lunch_start_hour && hour <= self.config.lunch_end_hour {
            suggestions.push(Suggestion::manual(
                SuggestionType::RestRecommendation,
                "Lunch time",
                "Stop nearby for lunch and refuel",
                Priority::Low,
            ));
        }

        if let Some(level) = analysis.route_traffic {
            if level.value() >= self.config.route_adjustment_level {
                suggestions.push(Suggestion::manual(
                    SuggestionType::RouteAdjustment,
                    "Congestion on route",
                    &format!("Traffic along the route is {level}, consider an alternative"),
                    Priority::Medium,
                ));
            }
        }

        suggestions
    }

    /// Highest priority wins; ties go to the first generated.
    pub fn select_top(suggestions: &[Suggestion]) -> Option<&Suggestion> {
        suggestions.iter().fold(None, |best: Option<&Suggestion>, s| match best {
            Some(b) if b.priority >= s.priority => Some(b),
            _ => Some(s),
        })
    }

    // ------------------------------------------------------------------------
    // Cycle
    // ------------------------------------------------------------------------

    /// Run one cycle. Never fails: a cycle that cannot evaluate its snapshot
    /// is logged and publishes nothing.
    pub async fn run_cycle(
        &mut self,
        snapshot: CycleSnapshot,
        executor: &mut dyn ActionExecutor,
        trip_store: Option<&dyn TripStore>,
    ) -> CycleReport {
        let now = snapshot.now;
        let analysis = match self.analyze(&snapshot) {
            Ok(analysis) => analysis,
            Err(e) => {
                error!("[Decision] Cycle failed: {}", e);
                let report = CycleReport {
                    at: now,
                    analysis: None,
                    suggestions: Vec::new(),
                    executed: Vec::new(),
                    published: None,
                };
                self.last_report = Some(report.clone());
                return report;
            }
        };

        let suggestions = self.generate_suggestions(&analysis, now);

        let mut executed = Vec::new();
        for action in suggestions.iter().filter(|s| s.auto_executable).filter_map(|s| s.action) {
            match executor.execute(action, now) {
                Ok(()) => {
                    debug!("[Decision] Auto-executed {:?}", action);
                    executed.push(action);
                }
                Err(e) => warn!("[Decision] Auto action {:?} failed: {}", action, e),
            }
        }

        let published = Self::select_top(&suggestions)
            .cloned()
            .unwrap_or_else(Suggestion::all_good);
        info!("[Decision] {} suggestions, showing '{}'", suggestions.len(), published.title);

        self.bus.publish(Event::SuggestionPublished(published.clone()));
        if let Some(store) = trip_store {
            if let Err(e) = store.record_suggestion(&published).await {
                warn!("[Decision] Could not record suggestion: {}", e);
            }
        }

        let report = CycleReport {
            at: now,
            analysis: Some(analysis),
            suggestions,
            executed,
            published: Some(published),
        };
        self.last_report = Some(report.clone());
        report
    }
}
