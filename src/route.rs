//! Route model.
//!
//! A [`Route`] is a start point plus an ordered list of named waypoints; the
//! last waypoint is the destination. Routes are validated on construction and
//! never mutated afterwards.

use serde::{Deserialize, Serialize};

use crate::geo_utils::{distance_km, distance_m, polyline_length_km};
use crate::{EngineError, GpsPoint};

/// A named checkpoint along the route.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Waypoint {
    pub name: String,
    pub point: GpsPoint,
    /// Route distance from the start to this waypoint
    pub cumulative_distance_km: f64,
    /// Riding time for the segment ending here, when the route source knows it
    #[serde(default)]
    pub segment_seconds: Option<f64>,
}

impl Waypoint {
    pub fn new(name: impl Into<String>, point: GpsPoint, cumulative_distance_km: f64) -> Self {
        Self {
            name: name.into(),
            point,
            cumulative_distance_km,
            segment_seconds: None,
        }
    }

    pub fn with_segment_seconds(mut self, seconds: f64) -> Self {
        self.segment_seconds = Some(seconds);
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Route {
    start: GpsPoint,
    waypoints: Vec<Waypoint>,
}

impl Route {
    /// Build a route, rejecting empty waypoint lists, invalid coordinates and
    /// cumulative distances that are negative, non-finite or decreasing.
    pub fn new(start: GpsPoint, waypoints: Vec<Waypoint>) -> Result<Self, EngineError> {
        if !start.is_valid() {
            return Err(EngineError::InvalidCoordinate {
                latitude: start.latitude,
                longitude: start.longitude,
            });
        }
        if waypoints.is_empty() {
            return Err(EngineError::MalformedRoute("route has no waypoints".to_string()));
        }

        let mut last_cumulative = 0.0;
        for wp in &waypoints {
            if !wp.point.is_valid() {
                return Err(EngineError::InvalidCoordinate {
                    latitude: wp.point.latitude,
                    longitude: wp.point.longitude,
                });
            }
            if !wp.cumulative_distance_km.is_finite() || wp.cumulative_distance_km < last_cumulative {
                return Err(EngineError::MalformedRoute(format!(
                    "cumulative distance of '{}' ({}) is not monotonic",
                    wp.name, wp.cumulative_distance_km
                )));
            }
            if let Some(secs) = wp.segment_seconds {
                if !secs.is_finite() || secs < 0.0 {
                    return Err(EngineError::MalformedRoute(format!(
                        "segment time of '{}' ({}) is invalid",
                        wp.name, secs
                    )));
                }
            }
            last_cumulative = wp.cumulative_distance_km;
        }

        Ok(Self { start, waypoints })
    }

    /// Build a route from named points, computing cumulative distances.
    pub fn from_named_points(start: GpsPoint, points: &[(&str, GpsPoint)]) -> Result<Self, EngineError> {
        let mut cumulative = 0.0;
        let mut prev = start;
        let waypoints = points
            .iter()
            .map(|(name, point)| {
                cumulative += distance_km(&prev, point);
                prev = *point;
                Waypoint::new(*name, *point, cumulative)
            })
            .collect();
        Self::new(start, waypoints)
    }

    /// Resume this route from the rider's position: starts at `position` and
    /// keeps the waypoints from the nearest one onwards.
    pub fn continue_from(&self, position: GpsPoint) -> Result<Self, EngineError> {
        let nearest = self
            .waypoints
            .iter()
            .enumerate()
            .min_by(|(_, a), (_, b)| {
                distance_m(&position, &a.point).total_cmp(&distance_m(&position, &b.point))
            })
            .map(|(i, _)| i)
            .unwrap_or(0);

        let points: Vec<(&str, GpsPoint)> = self.waypoints[nearest..]
            .iter()
            .map(|wp| (wp.name.as_str(), wp.point))
            .collect();
        Self::from_named_points(position, &points)
    }

    pub fn start_point(&self) -> GpsPoint {
        self.start
    }

    /// The destination, i.e. the last waypoint's point.
    pub fn end_point(&self) -> GpsPoint {
        self.destination().point
    }

    pub fn destination(&self) -> &Waypoint {
        // Non-empty by construction
        &self.waypoints[self.waypoints.len() - 1]
    }

    pub fn waypoints(&self) -> &[Waypoint] {
        &self.waypoints
    }

    pub fn len(&self) -> usize {
        self.waypoints.len()
    }

    pub fn is_empty(&self) -> bool {
        self.waypoints.is_empty()
    }

    /// Sum of great-circle segment distances from the start through every waypoint.
    pub fn total_distance_km(&self) -> f64 {
        let mut points = Vec::with_capacity(self.waypoints.len() + 1);
        points.push(self.start);
        points.extend(self.waypoints.iter().map(|wp| wp.point));
        polyline_length_km(&points)
    }

    /// Great-circle distance along the route from waypoint `index` to the end.
    pub fn distance_after_km(&self, index: usize) -> f64 {
        if index >= self.waypoints.len() {
            return 0.0;
        }
        let points: Vec<GpsPoint> = self.waypoints[index..].iter().map(|wp| wp.point).collect();
        polyline_length_km(&points)
    }

    /// Total riding time if every segment carries one.
    pub fn supplied_duration_seconds(&self) -> Option<f64> {
        self.waypoints.iter().map(|wp| wp.segment_seconds).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn approx_eq(a: f64, b: f64, epsilon: f64) -> bool {
        (a - b).abs() < epsilon
    }

    fn ningbo() -> GpsPoint {
        GpsPoint::new(29.8683, 121.5440)
    }

    fn corridor() -> Route {
        Route::from_named_points(
            ningbo(),
            &[
                ("Hangzhou Bay Bridge", GpsPoint::new(30.3695, 121.1226)),
                ("Hangzhou", GpsPoint::new(30.2741, 120.1551)),
                ("Jiujiang", GpsPoint::new(29.7047, 115.9920)),
            ],
        )
        .unwrap()
    }

    #[test]
    fn test_cumulative_distances_match_total() {
        let route = corridor();
        let last = route.destination().cumulative_distance_km;
        assert!(approx_eq(last, route.total_distance_km(), 1e-6));
        assert!(route.waypoints()[0].cumulative_distance_km > 0.0);
        assert_eq!(route.destination().name, "Jiujiang");
        assert_eq!(route.end_point(), GpsPoint::new(29.7047, 115.9920));
    }

    #[test]
    fn test_empty_route_rejected() {
        let err = Route::new(ningbo(), vec![]).unwrap_err();
        assert!(matches!(err, EngineError::MalformedRoute(_)));
    }

    #[test]
    fn test_invalid_waypoint_rejected() {
        let err = Route::new(ningbo(), vec![Waypoint::new("bad", GpsPoint::new(0.0, 200.0), 1.0)]).unwrap_err();
        assert!(matches!(err, EngineError::InvalidCoordinate { .. }));
    }

    #[test]
    fn test_decreasing_cumulative_rejected() {
        let waypoints = vec![
            Waypoint::new("a", GpsPoint::new(30.0, 121.0), 10.0),
            Waypoint::new("b", GpsPoint::new(30.1, 121.0), 5.0),
        ];
        let err = Route::new(ningbo(), waypoints).unwrap_err();
        assert!(matches!(err, EngineError::MalformedRoute(_)));
    }

    #[test]
    fn test_distance_after() {
        let route = corridor();
        let tail = route.distance_after_km(1);
        let expected = distance_km(&route.waypoints()[1].point, &route.waypoints()[2].point);
        assert!(approx_eq(tail, expected, 1e-9));
        assert_eq!(route.distance_after_km(2), 0.0);
        assert_eq!(route.distance_after_km(9), 0.0);
    }

    #[test]
    fn test_supplied_duration_requires_every_segment() {
        let partial = Route::new(
            ningbo(),
            vec![
                Waypoint::new("a", GpsPoint::new(30.0, 121.5), 15.0).with_segment_seconds(3600.0),
                Waypoint::new("b", GpsPoint::new(30.1, 121.5), 26.0),
            ],
        )
        .unwrap();
        assert_eq!(partial.supplied_duration_seconds(), None);

        let full = Route::new(
            ningbo(),
            vec![
                Waypoint::new("a", GpsPoint::new(30.0, 121.5), 15.0).with_segment_seconds(3600.0),
                Waypoint::new("b", GpsPoint::new(30.1, 121.5), 26.0).with_segment_seconds(2400.0),
            ],
        )
        .unwrap();
        assert_eq!(full.supplied_duration_seconds(), Some(6000.0));
    }

    #[test]
    fn test_continue_from_nearest_waypoint() {
        let route = corridor();
        // Just outside Hangzhou
        let rider = GpsPoint::new(30.28, 120.17);
        let resumed = route.continue_from(rider).unwrap();

        assert_eq!(resumed.start_point(), rider);
        assert_eq!(resumed.len(), 2);
        assert_eq!(resumed.waypoints()[0].name, "Hangzhou");
        assert!(resumed.total_distance_km() < route.total_distance_km());
    }
}
