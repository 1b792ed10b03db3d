//! Route geometry and route-session progression.
//!
//! A [`Route`] is the persistent, editable path for a device. A
//! [`RouteSession`] tracks how far a route cruise has progressed through it.
//! [`RouteSession::next_leg`] is the point-pair planner: a pure state advance
//! that never touches the scheduler, so the orchestration in
//! [`crate::sequencer`] only has to act on the [`Feed`] it returns.

use serde::{Deserialize, Serialize};
use tokio::time::Instant;

use crate::collaborators::RoutedPath;
use crate::cruise::CruiseState;
use crate::error::{Result, SimError};
use crate::events::SimEvent;
use crate::geo_utils::{arrival_threshold_km, haversine_distance};
use crate::Position;

/// Name of the implicit first waypoint.
pub const START_WAYPOINT: &str = "START";

// ============================================================================
// Route Geometry
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Waypoint {
    pub lat: f64,
    pub lng: f64,
    /// "START", then "1", "2", ...
    pub name: String,
}

impl Waypoint {
    pub fn position(&self) -> Position {
        Position::new(self.lat, self.lng)
    }
}

/// Routed path between two waypoints.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RouteSegment {
    pub from_waypoint: usize,
    pub to_waypoint: usize,
    pub polyline: Vec<Position>,
    pub distance_km: f64,
    /// Closing segment from the last waypoint back to START
    pub is_closure: bool,
    pub is_fallback: bool,
}

impl RouteSegment {
    pub fn new(from_waypoint: usize, to_waypoint: usize, path: RoutedPath, is_closure: bool) -> Self {
        Self {
            from_waypoint,
            to_waypoint,
            polyline: path.polyline,
            distance_km: path.distance_km,
            is_closure,
            is_fallback: path.is_fallback,
        }
    }
}

/// Waypoints joined by routed segments, optionally closed into a loop.
///
/// Without loop mode there is one segment per waypoint after START. With loop
/// mode the last segment is a closure back to START.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Route {
    pub waypoints: Vec<Waypoint>,
    pub segments: Vec<RouteSegment>,
    pub loop_mode: bool,
    pub total_distance_km: f64,
    /// Bumped by the sequencer on every committed edit
    #[serde(skip)]
    pub(crate) revision: u64,
}

impl Route {
    pub fn is_empty(&self) -> bool {
        self.waypoints.is_empty()
    }

    pub fn recalculate_distance(&mut self) {
        self.total_distance_km = self.segments.iter().map(|s| s.distance_km).sum();
    }

    /// Index of the trailing closure segment, if there is one.
    pub fn closure_index(&self) -> Option<usize> {
        match self.segments.last() {
            Some(segment) if segment.is_closure => Some(self.segments.len() - 1),
            _ => None,
        }
    }

    pub fn has_closure(&self) -> bool {
        self.closure_index().is_some()
    }

    pub fn pop_closure(&mut self) -> Option<RouteSegment> {
        self.closure_index()?;
        self.segments.pop()
    }

    /// Append a waypoint named after its index.
    pub fn push_waypoint(&mut self, position: Position) -> Waypoint {
        let name = if self.waypoints.is_empty() {
            START_WAYPOINT.to_string()
        } else {
            self.waypoints.len().to_string()
        };
        let waypoint = Waypoint {
            lat: position.latitude,
            lng: position.longitude,
            name,
        };
        self.waypoints.push(waypoint.clone());
        waypoint
    }

    /// Append the closure from the last waypoint back to START.
    pub fn push_closure(&mut self, path: RoutedPath) {
        let last = self.waypoints.len().saturating_sub(1);
        self.segments.push(RouteSegment::new(last, 0, path, true));
    }

    /// Endpoints the closure should connect: (last waypoint, START).
    pub fn closure_endpoints(&self) -> Option<(Position, Position)> {
        if self.waypoints.len() < 2 {
            return None;
        }
        let last = self.waypoints.last()?.position();
        let start = self.waypoints.first()?.position();
        Some((last, start))
    }
}

// ============================================================================
// Route Session
// ============================================================================

/// Progress of one route cruise.
#[derive(Debug, Clone)]
pub struct RouteSession {
    pub device_id: String,
    pub speed_kmh: f64,
    pub state: CruiseState,
    pub current_segment_index: usize,
    pub current_step_in_segment: usize,
    pub segments_completed: u32,
    pub loops_completed: u32,
    pub distance_traveled_km: f64,
    /// Last point of the previous segment, pending a bridge check
    pub(crate) bridge_from: Option<Position>,
    /// The live leg is a bridge and advances no step counter
    pub(crate) is_bridging: bool,
    pub(crate) reroute_path: Option<Vec<Position>>,
    pub(crate) reroute_step: usize,
    /// Leg distance of an arrival that landed while paused
    pub(crate) pending_arrival_km: Option<f64>,
    started_at: Instant,
}

/// What the planner wants done next.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Feed {
    /// Drive the scheduler from `from` to `to`.
    Leg { from: Position, to: Position },
    /// Every segment is done and loop mode is off.
    Finished,
}

impl RouteSession {
    pub fn new(device_id: &str, speed_kmh: f64) -> Self {
        Self {
            device_id: device_id.to_string(),
            speed_kmh,
            state: CruiseState::Running,
            current_segment_index: 0,
            current_step_in_segment: 0,
            segments_completed: 0,
            loops_completed: 0,
            distance_traveled_km: 0.0,
            bridge_from: None,
            is_bridging: false,
            reroute_path: None,
            reroute_step: 0,
            pending_arrival_km: None,
            started_at: Instant::now(),
        }
    }

    /// Unfinished polyline length of the current segment plus every later
    /// segment. Progress reporting only.
    pub fn remaining_distance_km(&self, route: &Route) -> f64 {
        let Some(segment) = route.segments.get(self.current_segment_index) else {
            return 0.0;
        };

        let in_segment: f64 = segment
            .polyline
            .windows(2)
            .skip(self.current_step_in_segment)
            .map(|w| haversine_distance(&w[0], &w[1]))
            .sum();

        let later: f64 = route.segments[self.current_segment_index + 1..]
            .iter()
            .map(|s| s.distance_km)
            .sum();

        in_segment + later
    }

    pub fn snapshot(&self, route: &Route) -> RouteSnapshot {
        RouteSnapshot {
            device_id: self.device_id.clone(),
            state: self.state,
            speed_kmh: self.speed_kmh,
            current_segment_index: self.current_segment_index,
            current_step_in_segment: self.current_step_in_segment,
            segments_completed: self.segments_completed,
            loops_completed: self.loops_completed,
            distance_traveled_km: self.distance_traveled_km,
            remaining_distance_km: self.remaining_distance_km(route),
            total_segments: route.segments.len(),
            duration_seconds: self.started_at.elapsed().as_secs_f64(),
            route: route.clone(),
        }
    }

    /// Account for a finished leg and step past it.
    ///
    /// Bridge legs only clear the bridging flag; the segment's own point pairs
    /// start from step 0 afterwards.
    pub fn record_arrival(&mut self, leg_distance_km: f64) {
        self.distance_traveled_km += leg_distance_km;

        if self.is_bridging {
            self.is_bridging = false;
        } else if self.reroute_path.is_some() {
            self.reroute_step += 1;
        } else {
            self.current_step_in_segment += 1;
        }
    }

    /// Install a detour from the current position to the current segment's
    /// target waypoint. The detour replaces the rest of that segment.
    pub fn install_reroute(&mut self, polyline: Vec<Position>) {
        if let Some(leg_km) = self.pending_arrival_km.take() {
            self.distance_traveled_km += leg_km;
        }
        self.reroute_path = Some(polyline);
        self.reroute_step = 0;
        self.bridge_from = None;
        self.is_bridging = false;
    }

    /// Advance to the next leg worth driving.
    ///
    /// Segment and loop completions passed on the way are appended to
    /// `events` in order. Pairs shorter than the arrival threshold are skipped
    /// without issuing a leg. Fails only when a looping route has no
    /// traversable geometry at all.
    pub fn next_leg(&mut self, route: &Route, events: &mut Vec<SimEvent>) -> Result<Feed> {
        let threshold = arrival_threshold_km(self.speed_kmh);
        let mut loop_restarts = 0;

        loop {
            // Detour first
            if let Some(path) = &self.reroute_path {
                let step = self.reroute_step;
                if step + 1 >= path.len() {
                    self.bridge_from = path.last().copied();
                    self.reroute_path = None;
                    self.reroute_step = 0;
                    self.complete_segment(route, events);
                    continue;
                }

                let (from, to) = (path[step], path[step + 1]);
                if haversine_distance(&from, &to) < threshold {
                    self.reroute_step += 1;
                    continue;
                }
                return Ok(Feed::Leg { from, to });
            }

            if self.current_segment_index >= route.segments.len() {
                if !route.loop_mode || route.segments.is_empty() {
                    return Ok(Feed::Finished);
                }

                loop_restarts += 1;
                if loop_restarts > 1 {
                    return Err(SimError::Internal {
                        message: format!(
                            "route for {} has no traversable segment",
                            self.device_id
                        ),
                    });
                }

                self.bridge_from = route.segments.last().and_then(|s| s.polyline.last()).copied();
                self.current_segment_index = 0;
                self.current_step_in_segment = 0;
                self.loops_completed += 1;
                events.push(SimEvent::RouteLoopComplete(self.snapshot(route)));
                continue;
            }

            let segment = &route.segments[self.current_segment_index];

            if let Some(from) = self.bridge_from.take() {
                if let Some(&to) = segment.polyline.first() {
                    if haversine_distance(&from, &to) >= threshold {
                        self.is_bridging = true;
                        return Ok(Feed::Leg { from, to });
                    }
                }
            }

            let step = self.current_step_in_segment;
            if step + 1 >= segment.polyline.len() {
                self.bridge_from = segment.polyline.last().copied();
                self.complete_segment(route, events);
                continue;
            }

            let (from, to) = (segment.polyline[step], segment.polyline[step + 1]);
            if haversine_distance(&from, &to) < threshold {
                self.current_step_in_segment += 1;
                continue;
            }
            return Ok(Feed::Leg { from, to });
        }
    }

    fn complete_segment(&mut self, route: &Route, events: &mut Vec<SimEvent>) {
        self.current_segment_index += 1;
        self.current_step_in_segment = 0;
        self.segments_completed += 1;
        events.push(SimEvent::RouteSegmentComplete(self.snapshot(route)));
    }
}

/// Serializable view of a route session, including its route.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RouteSnapshot {
    pub device_id: String,
    pub state: CruiseState,
    pub speed_kmh: f64,
    pub current_segment_index: usize,
    pub current_step_in_segment: usize,
    pub segments_completed: u32,
    pub loops_completed: u32,
    pub distance_traveled_km: f64,
    pub remaining_distance_km: f64,
    pub total_segments: usize,
    pub duration_seconds: f64,
    pub route: Route,
}

/// Route plus its session, if one is live.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RouteStatus {
    pub device_id: String,
    pub route: Route,
    pub session: Option<RouteSnapshot>,
}

impl RouteStatus {
    pub fn state(&self) -> CruiseState {
        self.session
            .as_ref()
            .map_or(CruiseState::Idle, |session| session.state)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Three points due north, 0.75 km apart.
    fn north_polyline(lat0: f64) -> Vec<Position> {
        (0..3)
            .map(|i| Position::new(lat0 + i as f64 * 0.006745, 121.5))
            .collect()
    }

    fn two_segment_route() -> Route {
        let mut route = Route::default();
        let first = north_polyline(25.0);
        let second = north_polyline(first[2].latitude);

        route.push_waypoint(first[0]);
        route.push_waypoint(first[2]);
        route.push_waypoint(second[2]);
        route
            .segments
            .push(RouteSegment::new(0, 1, RoutedPath::from_polyline(first), false));
        route
            .segments
            .push(RouteSegment::new(1, 2, RoutedPath::from_polyline(second), false));
        route.recalculate_distance();
        route
    }

    fn names(events: &[SimEvent]) -> Vec<&'static str> {
        events.iter().map(|e| e.name()).collect()
    }

    #[test]
    fn test_waypoint_naming() {
        let mut route = Route::default();
        assert_eq!(route.push_waypoint(Position::new(25.0, 121.5)).name, "START");
        assert_eq!(route.push_waypoint(Position::new(25.1, 121.5)).name, "1");
        assert_eq!(route.push_waypoint(Position::new(25.2, 121.5)).name, "2");
    }

    #[test]
    fn test_closure_helpers() {
        let mut route = two_segment_route();
        assert!(!route.has_closure());
        assert!(route.pop_closure().is_none());
        assert_eq!(route.segments.len(), 2);

        let (last, start) = route.closure_endpoints().unwrap();
        route.push_closure(RoutedPath::straight_line(last, start));
        assert_eq!(route.closure_index(), Some(2));
        assert_eq!(route.segments[2].from_waypoint, 2);
        assert_eq!(route.segments[2].to_waypoint, 0);

        assert!(route.pop_closure().is_some());
        assert_eq!(route.segments.len(), 2);
    }

    #[test]
    fn test_remaining_distance() {
        let route = two_segment_route();
        let mut session = RouteSession::new("d1", 10.0);
        assert!((session.remaining_distance_km(&route) - route.total_distance_km).abs() < 1e-9);

        session.current_step_in_segment = 1;
        let expected = route.total_distance_km - haversine_distance(
            &route.segments[0].polyline[0],
            &route.segments[0].polyline[1],
        );
        assert!((session.remaining_distance_km(&route) - expected).abs() < 1e-9);

        session.current_segment_index = 2;
        assert_eq!(session.remaining_distance_km(&route), 0.0);
    }

    #[test]
    fn test_next_leg_walks_segments_in_order() {
        let route = two_segment_route();
        let mut session = RouteSession::new("d1", 10.0);
        let mut events = Vec::new();

        let mut legs = Vec::new();
        loop {
            match session.next_leg(&route, &mut events).unwrap() {
                Feed::Leg { from, to } => {
                    legs.push((from, to));
                    session.record_arrival(haversine_distance(&from, &to));
                }
                Feed::Finished => break,
            }
        }

        // Segments share their joint exactly, so no bridge legs
        assert_eq!(legs.len(), 4);
        assert_eq!(names(&events), vec!["routeSegmentComplete", "routeSegmentComplete"]);
        assert_eq!(session.segments_completed, 2);
        assert!((session.distance_traveled_km - route.total_distance_km).abs() < 1e-9);
    }

    #[test]
    fn test_next_leg_bridges_gap_between_segments() {
        let mut route = two_segment_route();
        // Shift the second segment 100 m east so its start misses the first's end
        for p in &mut route.segments[1].polyline {
            p.longitude += 0.001;
        }

        let mut session = RouteSession::new("d1", 10.0);
        let mut events = Vec::new();
        session.current_step_in_segment = 2;

        let Feed::Leg { from, to } = session.next_leg(&route, &mut events).unwrap() else {
            panic!("expected bridge leg");
        };
        assert!(session.is_bridging);
        assert_eq!(from, route.segments[0].polyline[2]);
        assert_eq!(to, route.segments[1].polyline[0]);
        assert_eq!(names(&events), vec!["routeSegmentComplete"]);

        // Bridge arrival does not consume a step
        session.record_arrival(0.1);
        assert!(!session.is_bridging);
        assert_eq!(session.current_step_in_segment, 0);

        let Feed::Leg { from, .. } = session.next_leg(&route, &mut events).unwrap() else {
            panic!("expected segment leg");
        };
        assert_eq!(from, route.segments[1].polyline[0]);
    }

    #[test]
    fn test_next_leg_skips_degenerate_pairs() {
        let mut route = Route::default();
        let a = Position::new(25.0, 121.5);
        let b = Position::new(25.01, 121.5);
        route.push_waypoint(a);
        route.push_waypoint(b);
        route.segments.push(RouteSegment::new(
            0,
            1,
            RoutedPath::from_polyline(vec![a, a, a, b]),
            false,
        ));

        let mut session = RouteSession::new("d1", 10.0);
        let mut events = Vec::new();
        let feed = session.next_leg(&route, &mut events).unwrap();
        assert_eq!(feed, Feed::Leg { from: a, to: b });
        assert_eq!(session.current_step_in_segment, 2);
    }

    #[test]
    fn test_next_leg_loop_restart() {
        let mut route = two_segment_route();
        route.loop_mode = true;
        let (last, start) = route.closure_endpoints().unwrap();
        route.push_closure(RoutedPath::straight_line(last, start));

        let mut session = RouteSession::new("d1", 10.0);
        session.current_segment_index = 2;
        session.current_step_in_segment = 1;
        let mut events = Vec::new();

        let Feed::Leg { from, .. } = session.next_leg(&route, &mut events).unwrap() else {
            panic!("expected restart leg");
        };
        assert_eq!(names(&events), vec!["routeSegmentComplete", "routeLoopComplete"]);
        assert_eq!(session.loops_completed, 1);
        assert_eq!(session.current_segment_index, 0);
        assert_eq!(from, route.segments[0].polyline[0]);
    }

    #[test]
    fn test_next_leg_degenerate_loop_is_an_error() {
        let mut route = Route::default();
        let a = Position::new(25.0, 121.5);
        route.push_waypoint(a);
        route.push_waypoint(a);
        route.loop_mode = true;
        route
            .segments
            .push(RouteSegment::new(0, 1, RoutedPath::from_polyline(vec![a, a]), false));
        route.push_closure(RoutedPath::from_polyline(vec![a, a]));

        let mut session = RouteSession::new("d1", 10.0);
        let mut events = Vec::new();
        assert!(matches!(
            session.next_leg(&route, &mut events),
            Err(SimError::Internal { .. })
        ));
    }

    #[test]
    fn test_reroute_consumed_before_segment() {
        let route = two_segment_route();
        let mut session = RouteSession::new("d1", 10.0);
        let here = Position::new(25.003, 121.501);
        let target = route.segments[0].polyline[2];
        session.install_reroute(vec![here, target]);

        let mut events = Vec::new();
        let feed = session.next_leg(&route, &mut events).unwrap();
        assert_eq!(feed, Feed::Leg { from: here, to: target });

        session.record_arrival(0.3);
        assert_eq!(session.reroute_step, 1);

        // Detour done: segment 0 counts as complete, segment 1 starts where it ended
        let Feed::Leg { from, .. } = session.next_leg(&route, &mut events).unwrap() else {
            panic!("expected segment leg");
        };
        assert_eq!(session.current_segment_index, 1);
        assert!(session.reroute_path.is_none());
        assert_eq!(from, route.segments[1].polyline[0]);
        assert_eq!(names(&events), vec!["routeSegmentComplete"]);
    }

    #[test]
    fn test_route_status_state() {
        let status = RouteStatus {
            device_id: "d1".to_string(),
            route: Route::default(),
            session: None,
        };
        assert_eq!(status.state(), CruiseState::Idle);
    }
}
