//! # Route Sequencer
//!
//! Drives a multi-waypoint [`Route`] through the [`CruiseScheduler`] one point
//! pair at a time. The sequencer owns no loop: it registers an arrival
//! callback for the device, and every leg arrival re-enters the point-pair
//! feed from inside the scheduler's tick loop. A route cruise therefore costs
//! exactly one task however many points it has.
//!
//! Route edits that need a path (add, undo, loop toggle, reroute) await the
//! [`RoutingProvider`] without holding the table lock, then commit only if the
//! route has not changed in the meantime.
//!
//! Lock order is route table, then scheduler registry. The scheduler never
//! calls back into the sequencer while holding its own lock.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, Weak};

use log::{debug, error, info, warn};

use crate::collaborators::{sanitize_path, RoutedPath, RoutingProvider};
use crate::cruise::{ArrivalCallback, CruiseScheduler, CruiseSnapshot, CruiseState};
use crate::error::{OptionExt, Result, SimError};
use crate::event_bus::EventBus;
use crate::events::{CruiseErrorEvent, SimEvent, WaypointEvent};
use crate::route::{Feed, Route, RouteSegment, RouteSession, RouteSnapshot, RouteStatus, Waypoint};
use crate::{device_tag, Position};

#[derive(Default)]
struct RouteTable {
    routes: HashMap<String, Route>,
    sessions: HashMap<String, RouteSession>,
    last_revision: u64,
}

impl RouteTable {
    fn revision_of(&self, device_id: &str) -> u64 {
        self.routes.get(device_id).map_or(0, |route| route.revision)
    }

    fn is_running(&self, device_id: &str) -> bool {
        self.sessions
            .get(device_id)
            .is_some_and(|session| session.state == CruiseState::Running)
    }

    /// Store an edited route under a fresh revision.
    fn commit(&mut self, device_id: &str, mut route: Route) -> Route {
        self.last_revision += 1;
        route.revision = self.last_revision;
        route.recalculate_distance();
        self.routes.insert(device_id.to_string(), route.clone());
        route
    }

    fn snapshot(&self, device_id: &str, session: &RouteSession) -> RouteSnapshot {
        session_snapshot(&self.routes, device_id, session)
    }
}

fn session_snapshot(
    routes: &HashMap<String, Route>,
    device_id: &str,
    session: &RouteSession,
) -> RouteSnapshot {
    match routes.get(device_id) {
        Some(route) => session.snapshot(route),
        None => session.snapshot(&Route::default()),
    }
}

struct SequencerInner {
    table: Mutex<RouteTable>,
    cruise: CruiseScheduler,
    provider: Arc<dyn RoutingProvider>,
    bus: EventBus,
}

/// Per-device route editing and route cruising.
///
/// Cheap to clone; clones share state.
#[derive(Clone)]
pub struct RouteSequencer {
    inner: Arc<SequencerInner>,
}

impl RouteSequencer {
    pub fn new(cruise: CruiseScheduler, provider: Arc<dyn RoutingProvider>, bus: EventBus) -> Self {
        Self {
            inner: Arc::new(SequencerInner {
                table: Mutex::new(RouteTable::default()),
                cruise,
                provider,
                bus,
            }),
        }
    }

    fn table(&self) -> MutexGuard<'_, RouteTable> {
        self.inner.table.lock().unwrap_or_else(|e| e.into_inner())
    }

    async fn fetch_path(&self, start: Position, end: Position) -> RoutedPath {
        let path = self.inner.provider.get_route(start, end).await;
        if path.is_fallback {
            debug!(
                "[RouteSequencer] Straight-line fallback for ({:.5},{:.5}) -> ({:.5},{:.5})",
                start.latitude, start.longitude, end.latitude, end.longitude
            );
        }
        sanitize_path(path, start, end)
    }

    // ========================================================================
    // Route Building
    // ========================================================================

    /// Append a waypoint. The first waypoint of a route is START and has no
    /// segment; every later one is joined to its predecessor by a routed path.
    pub async fn add_waypoint(&self, device_id: &str, latitude: f64, longitude: f64) -> Result<Route> {
        let position = Position::new(latitude, longitude);
        if !position.is_valid() {
            return Err(SimError::InvalidCoordinates { latitude, longitude });
        }

        let (mut draft, revision) = {
            let mut table = self.table();
            if table.is_running(device_id) {
                return Err(SimError::RouteBusy {
                    device_id: device_id.to_string(),
                });
            }

            let draft = table.routes.get(device_id).cloned().unwrap_or_default();
            if draft.is_empty() {
                let mut route = draft;
                let waypoint = route.push_waypoint(position);
                let route = table.commit(device_id, route);
                info!(
                    "[RouteSequencer] [{}] START set at ({:.5},{:.5})",
                    device_tag(device_id),
                    latitude,
                    longitude
                );
                self.publish_waypoint(device_id, Some(waypoint), &route);
                return Ok(route);
            }
            let revision = table.revision_of(device_id);
            (draft, revision)
        };

        let previous = draft
            .waypoints
            .last()
            .map(|w| w.position())
            .ok_or_internal("route without waypoints")?;
        let path = self.fetch_path(previous, position).await;
        let closure = if draft.loop_mode {
            let start = draft.waypoints[0].position();
            Some(self.fetch_path(position, start).await)
        } else {
            None
        };

        draft.pop_closure();
        let from = draft.waypoints.len() - 1;
        let waypoint = draft.push_waypoint(position);
        draft
            .segments
            .push(RouteSegment::new(from, from + 1, path, false));
        if let Some(closure) = closure {
            draft.push_closure(closure);
        }

        let route = {
            let mut table = self.table();
            self.check_unchanged(&table, device_id, revision)?;
            table.commit(device_id, draft)
        };

        info!(
            "[RouteSequencer] [{}] Waypoint {} added, {} segments, {:.2}km",
            device_tag(device_id),
            waypoint.name,
            route.segments.len(),
            route.total_distance_km
        );
        self.publish_waypoint(device_id, Some(waypoint), &route);
        Ok(route)
    }

    /// Remove the last waypoint and its incoming segment. Undoing START clears
    /// the route.
    pub async fn undo_waypoint(&self, device_id: &str) -> Result<Route> {
        let (mut draft, revision) = {
            let mut table = self.table();
            let Some(route) = table.routes.get(device_id).filter(|r| !r.is_empty()) else {
                return Err(SimError::NothingToUndo);
            };
            if table.is_running(device_id) {
                return Err(SimError::RouteBusy {
                    device_id: device_id.to_string(),
                });
            }

            if route.waypoints.len() == 1 {
                table.routes.remove(device_id);
                info!("[RouteSequencer] [{}] Undo START, route cleared", device_tag(device_id));
                let route = Route::default();
                self.publish_waypoint(device_id, None, &route);
                return Ok(route);
            }
            (route.clone(), route.revision)
        };

        draft.pop_closure();
        draft.waypoints.pop();
        draft.segments.pop();

        if draft.loop_mode {
            if let Some((last, start)) = draft.closure_endpoints() {
                let closure = self.fetch_path(last, start).await;
                draft.push_closure(closure);
            }
        }

        let route = {
            let mut table = self.table();
            self.check_unchanged(&table, device_id, revision)?;
            table.commit(device_id, draft)
        };

        info!(
            "[RouteSequencer] [{}] Undo, now {} waypoints",
            device_tag(device_id),
            route.waypoints.len()
        );
        self.publish_waypoint(device_id, None, &route);
        Ok(route)
    }

    /// Toggle loop mode. Allowed during a route cruise.
    ///
    /// Turning loop mode off while the session is on the closure keeps the
    /// closure so the segment finishes; the route then arrives instead of
    /// looping.
    pub async fn set_loop_mode(&self, device_id: &str, enabled: bool) -> Result<Route> {
        let (draft, revision, closure_ends) = {
            let mut table = self.table();
            let mut draft = table.routes.get(device_id).cloned().unwrap_or_default();
            let revision = table.revision_of(device_id);

            if enabled {
                let ends = if draft.has_closure() {
                    None
                } else {
                    draft.closure_endpoints()
                };
                (draft, revision, ends)
            } else {
                if let Some(closure_index) = draft.closure_index() {
                    let on_closure = table.sessions.get(device_id).is_some_and(|s| {
                        matches!(s.state, CruiseState::Running | CruiseState::Paused)
                            && s.current_segment_index >= closure_index
                    });
                    if on_closure {
                        debug!(
                            "[RouteSequencer] [{}] Keeping in-flight closure segment",
                            device_tag(device_id)
                        );
                    } else {
                        draft.pop_closure();
                    }
                }
                draft.loop_mode = false;
                let route = table.commit(device_id, draft);
                info!("[RouteSequencer] [{}] Loop mode OFF", device_tag(device_id));
                return Ok(route);
            }
        };

        let mut draft = draft;
        if let Some((last, start)) = closure_ends {
            let closure = self.fetch_path(last, start).await;
            draft.push_closure(closure);
        }
        draft.loop_mode = true;

        // A running session keeps going; the closure is picked up when the
        // forward segments run out
        let route = {
            let mut table = self.table();
            self.check_revision(&table, device_id, revision)?;
            table.commit(device_id, draft)
        };

        info!("[RouteSequencer] [{}] Loop mode ON", device_tag(device_id));
        Ok(route)
    }

    /// Drop the device's route. Rejected while a route session exists.
    pub fn clear_route(&self, device_id: &str) -> Result<Route> {
        let mut table = self.table();
        if table.sessions.contains_key(device_id) {
            return Err(SimError::RouteBusy {
                device_id: device_id.to_string(),
            });
        }
        table.routes.remove(device_id);
        info!("[RouteSequencer] [{}] Route cleared", device_tag(device_id));
        Ok(Route::default())
    }

    /// Geometry edits also give way to a session that started meanwhile.
    fn check_unchanged(&self, table: &RouteTable, device_id: &str, revision: u64) -> Result<()> {
        if table.is_running(device_id) {
            return Err(SimError::RouteBusy {
                device_id: device_id.to_string(),
            });
        }
        self.check_revision(table, device_id, revision)
    }

    fn check_revision(&self, table: &RouteTable, device_id: &str, revision: u64) -> Result<()> {
        if table.revision_of(device_id) != revision {
            warn!(
                "[RouteSequencer] [{}] Route changed while routing, edit discarded",
                device_tag(device_id)
            );
            return Err(SimError::RouteChanged {
                device_id: device_id.to_string(),
            });
        }
        Ok(())
    }

    fn publish_waypoint(&self, device_id: &str, waypoint: Option<Waypoint>, route: &Route) {
        self.inner
            .bus
            .publish(SimEvent::RouteWaypointAdded(WaypointEvent {
                device_id: device_id.to_string(),
                waypoint,
                route: route.clone(),
            }));
    }

    // ========================================================================
    // Queries
    // ========================================================================

    pub fn route(&self, device_id: &str) -> Option<Route> {
        self.table().routes.get(device_id).cloned()
    }

    pub fn route_session(&self, device_id: &str) -> Option<RouteSnapshot> {
        let table = self.table();
        let session = table.sessions.get(device_id)?;
        Some(table.snapshot(device_id, session))
    }

    /// Devices with a live route session.
    pub fn active_devices(&self) -> Vec<String> {
        self.table().sessions.keys().cloned().collect()
    }

    pub fn route_status(&self, device_id: &str) -> RouteStatus {
        let table = self.table();
        RouteStatus {
            device_id: device_id.to_string(),
            route: table.routes.get(device_id).cloned().unwrap_or_default(),
            session: table
                .sessions
                .get(device_id)
                .map(|session| table.snapshot(device_id, session)),
        }
    }

    // ========================================================================
    // Route Cruise
    // ========================================================================

    /// Start cruising the device's route from segment 0.
    ///
    /// Any existing route session and any plain cruise for the device are
    /// stopped first.
    pub async fn start_route_cruise(&self, device_id: &str, speed_kmh: f64) -> Result<RouteSnapshot> {
        let speed_kmh = self.inner.cruise.config().clamp_speed(speed_kmh);
        self.check_startable(&self.table(), device_id)?;

        self.stop_route_cruise(device_id).await?;
        self.inner.cruise.stop(device_id).await?;

        let mut table = self.table();
        self.check_startable(&table, device_id)?;
        if table.sessions.contains_key(device_id) {
            return Err(SimError::RouteBusy {
                device_id: device_id.to_string(),
            });
        }

        let session = RouteSession::new(device_id, speed_kmh);
        let snapshot = table.snapshot(device_id, &session);
        table.sessions.insert(device_id.to_string(), session);
        self.inner.cruise.on_arrival(device_id, self.arrival_callback());

        info!(
            "[RouteSequencer] [{}] Route cruise started: {} segments, {:.2}km at {}km/h",
            device_tag(device_id),
            snapshot.total_segments,
            snapshot.route.total_distance_km,
            speed_kmh
        );
        self.inner.bus.publish(SimEvent::RouteStarted(snapshot.clone()));

        self.feed(&mut table, device_id)?;
        Ok(snapshot)
    }

    fn check_startable(&self, table: &RouteTable, device_id: &str) -> Result<()> {
        let Some(route) = table.routes.get(device_id) else {
            return Err(SimError::InsufficientWaypoints { waypoint_count: 0 });
        };
        if route.waypoints.len() < 2 {
            return Err(SimError::InsufficientWaypoints {
                waypoint_count: route.waypoints.len(),
            });
        }
        if route.segments.is_empty() {
            return Err(SimError::NoSegments);
        }
        Ok(())
    }

    pub fn pause_route_cruise(&self, device_id: &str) -> Result<RouteSnapshot> {
        let mut table = self.table();
        let session = self.session_mut(&mut table, device_id)?;
        if session.state != CruiseState::Running {
            return Err(SimError::invalid_state("pause", session.state));
        }
        session.state = CruiseState::Paused;

        // The leg may have just arrived; its callback then parks the arrival
        if let Err(e) = self.inner.cruise.pause(device_id) {
            debug!("[RouteSequencer] [{}] Leg not paused: {}", device_tag(device_id), e);
        }

        let snapshot = self.current_snapshot(&table, device_id)?;
        info!("[RouteSequencer] [{}] Route cruise paused", device_tag(device_id));
        self.inner.bus.publish(SimEvent::RouteUpdate(snapshot.clone()));
        Ok(snapshot)
    }

    pub fn resume_route_cruise(&self, device_id: &str) -> Result<RouteSnapshot> {
        let mut table = self.table();
        let session = self.session_mut(&mut table, device_id)?;
        if session.state != CruiseState::Paused {
            return Err(SimError::invalid_state("resume", session.state));
        }
        session.state = CruiseState::Running;

        match session.pending_arrival_km.take() {
            Some(leg_km) => {
                session.record_arrival(leg_km);
                let snapshot = self.current_snapshot(&table, device_id)?;
                info!("[RouteSequencer] [{}] Route cruise resumed", device_tag(device_id));
                self.inner.bus.publish(SimEvent::RouteUpdate(snapshot.clone()));
                self.feed(&mut table, device_id)?;
                Ok(snapshot)
            }
            None => {
                if let Err(e) = self.inner.cruise.resume(device_id) {
                    debug!("[RouteSequencer] [{}] Leg not resumed: {}", device_tag(device_id), e);
                }
                let snapshot = self.current_snapshot(&table, device_id)?;
                info!("[RouteSequencer] [{}] Route cruise resumed", device_tag(device_id));
                self.inner.bus.publish(SimEvent::RouteUpdate(snapshot.clone()));
                Ok(snapshot)
            }
        }
    }

    /// Stop the route cruise and its current leg. Returns `false` when the
    /// device had no route session.
    pub async fn stop_route_cruise(&self, device_id: &str) -> Result<bool> {
        let snapshot = {
            let mut table = self.table();
            let Some(mut session) = table.sessions.remove(device_id) else {
                return Ok(false);
            };
            session.state = CruiseState::Stopped;
            table.snapshot(device_id, &session)
        };

        self.inner.cruise.remove_arrival_callback(device_id);
        self.inner.cruise.stop(device_id).await?;

        info!("[RouteSequencer] [{}] Route cruise stopped", device_tag(device_id));
        self.inner.bus.publish(SimEvent::RouteUpdate(snapshot));
        Ok(true)
    }

    /// Resume a paused route from an arbitrary current position, routing back
    /// to the current segment's target waypoint first.
    pub async fn reroute_and_resume(
        &self,
        device_id: &str,
        latitude: f64,
        longitude: f64,
    ) -> Result<RouteSnapshot> {
        let current = Position::new(latitude, longitude);
        if !current.is_valid() {
            return Err(SimError::InvalidCoordinates { latitude, longitude });
        }

        let target = {
            let mut table = self.table();
            let session = self.session_mut(&mut table, device_id)?;
            if session.state != CruiseState::Paused {
                return Err(SimError::invalid_state("reroute", session.state));
            }
            let index = session.current_segment_index;
            let route = table.routes.get(device_id).ok_or_internal("route session without route")?;
            let segment = route.segments.get(index).ok_or(SimError::NoRemainingSegments)?;
            route
                .waypoints
                .get(segment.to_waypoint)
                .map(|w| w.position())
                .ok_or_internal("segment points past the waypoint list")?
        };

        info!(
            "[RouteSequencer] [{}] Rerouting from ({:.5},{:.5}) to ({:.5},{:.5})",
            device_tag(device_id),
            latitude,
            longitude,
            target.latitude,
            target.longitude
        );
        let path = self.fetch_path(current, target).await;
        self.inner.cruise.stop_with_reason(device_id, "rerouted").await?;

        let mut table = self.table();
        let session = match table.sessions.get_mut(device_id) {
            Some(session) if session.state == CruiseState::Paused => session,
            _ => {
                return Err(SimError::RouteChanged {
                    device_id: device_id.to_string(),
                })
            }
        };
        session.install_reroute(path.polyline);
        session.state = CruiseState::Running;
        self.inner.cruise.on_arrival(device_id, self.arrival_callback());

        let snapshot = self.current_snapshot(&table, device_id)?;
        self.inner.bus.publish(SimEvent::RouteUpdate(snapshot.clone()));
        self.feed(&mut table, device_id)?;

        info!("[RouteSequencer] [{}] Route cruise rerouted and resumed", device_tag(device_id));
        Ok(snapshot)
    }

    /// Change the route speed. The running leg picks it up immediately.
    pub fn set_route_speed(&self, device_id: &str, speed_kmh: f64) -> Result<f64> {
        let speed_kmh = self.inner.cruise.config().clamp_speed(speed_kmh);
        let mut table = self.table();
        let session = self.session_mut(&mut table, device_id)?;
        session.speed_kmh = speed_kmh;

        if let Err(e) = self.inner.cruise.set_speed(device_id, speed_kmh) {
            debug!("[RouteSequencer] [{}] No leg to update: {}", device_tag(device_id), e);
        }
        debug!(
            "[RouteSequencer] [{}] Route speed set to {}km/h",
            device_tag(device_id),
            speed_kmh
        );
        Ok(speed_kmh)
    }

    /// Stop every route session. Called on shutdown.
    pub async fn stop_all(&self) {
        let devices: Vec<String> = self.table().sessions.keys().cloned().collect();
        for device_id in devices {
            if let Err(e) = self.stop_route_cruise(&device_id).await {
                warn!("[RouteSequencer] [{}] Stop failed: {}", device_tag(&device_id), e);
            }
        }
    }

    fn session_mut<'a>(&self, table: &'a mut RouteTable, device_id: &str) -> Result<&'a mut RouteSession> {
        table
            .sessions
            .get_mut(device_id)
            .ok_or_else(|| SimError::NoActiveRouteCruise {
                device_id: device_id.to_string(),
            })
    }

    fn current_snapshot(&self, table: &RouteTable, device_id: &str) -> Result<RouteSnapshot> {
        let session = table
            .sessions
            .get(device_id)
            .ok_or_else(|| SimError::NoActiveRouteCruise {
                device_id: device_id.to_string(),
            })?;
        Ok(table.snapshot(device_id, session))
    }

    // ========================================================================
    // Point-Pair Feed
    // ========================================================================

    fn arrival_callback(&self) -> ArrivalCallback {
        let inner: Weak<SequencerInner> = Arc::downgrade(&self.inner);
        Arc::new(move |snapshot: CruiseSnapshot| {
            if let Some(inner) = inner.upgrade() {
                RouteSequencer { inner }.on_point_arrival(snapshot);
            }
        })
    }

    /// Runs on the scheduler's tick loop each time a leg arrives.
    fn on_point_arrival(&self, leg: CruiseSnapshot) {
        let device_id = leg.device_id.as_str();
        let mut guard = self.table();
        let table = &mut *guard;
        let Some(session) = table.sessions.get_mut(device_id) else {
            debug!("[RouteSequencer] [{}] Arrival for stopped route", device_tag(device_id));
            return;
        };

        match session.state {
            CruiseState::Running => {}
            CruiseState::Paused => {
                session.pending_arrival_km = Some(leg.distance_traveled_km);
                debug!("[RouteSequencer] [{}] Leg arrived while paused", device_tag(device_id));
                return;
            }
            _ => return,
        }

        session.record_arrival(leg.distance_traveled_km);
        let snapshot = session_snapshot(&table.routes, device_id, session);
        self.inner.bus.publish(SimEvent::RouteUpdate(snapshot));

        if let Err(e) = self.feed(table, device_id) {
            debug!("[RouteSequencer] [{}] Feed ended: {}", device_tag(device_id), e);
        }
    }

    /// Hand the next point pair to the scheduler, or finish the route.
    ///
    /// Runs with the table locked so a concurrent stop cannot interleave
    /// between planning a leg and starting it.
    fn feed(&self, table: &mut RouteTable, device_id: &str) -> Result<()> {
        let RouteTable { routes, sessions, .. } = &mut *table;
        let session = sessions
            .get_mut(device_id)
            .ok_or_else(|| SimError::NoActiveRouteCruise {
                device_id: device_id.to_string(),
            })?;

        let mut events = Vec::new();
        let planned = match routes.get(device_id) {
            Some(route) => session.next_leg(route, &mut events),
            None => Err(SimError::Internal {
                message: "route session without route".to_string(),
            }),
        };
        for event in events {
            self.inner.bus.publish(event);
        }

        let result = match planned {
            Ok(Feed::Leg { from, to }) => self
                .inner
                .cruise
                .start_leg(device_id, from, to, session.speed_kmh)
                .map(|_| ()),
            Ok(Feed::Finished) => {
                self.finish_route(table, device_id);
                return Ok(());
            }
            Err(e) => Err(e),
        };

        if let Err(e) = &result {
            self.abort_route(table, device_id, e);
        }
        result
    }

    fn finish_route(&self, table: &mut RouteTable, device_id: &str) {
        let Some(mut session) = table.sessions.remove(device_id) else {
            return;
        };
        session.state = CruiseState::Arrived;

        // A closure kept alive by a mid-traversal loop-off is stale now
        if let Some(route) = table.routes.get_mut(device_id) {
            if !route.loop_mode && route.pop_closure().is_some() {
                route.recalculate_distance();
                table.last_revision += 1;
                route.revision = table.last_revision;
            }
        }

        self.inner.cruise.remove_arrival_callback(device_id);
        self.inner.cruise.cleanup_session(device_id);

        let snapshot = table.snapshot(device_id, &session);
        info!(
            "[RouteSequencer] [{}] Route arrived after {:.2}km",
            device_tag(device_id),
            snapshot.distance_traveled_km
        );
        self.inner.bus.publish(SimEvent::RouteArrived(snapshot));
    }

    /// Force-stop a route whose feed hit an invariant violation.
    fn abort_route(&self, table: &mut RouteTable, device_id: &str, cause: &SimError) {
        error!(
            "[RouteSequencer] [{}] Route feed failed, stopping route: {}",
            device_tag(device_id),
            cause
        );
        table.sessions.remove(device_id);
        self.inner.cruise.remove_arrival_callback(device_id);
        self.inner.cruise.cleanup_session(device_id);

        self.inner.bus.publish(SimEvent::CruiseError(CruiseErrorEvent {
            device_id: device_id.to_string(),
            error: cause.to_string(),
        }));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collaborators::{PositionSink, StraightLineProvider};
    use crate::config::SimulationConfig;
    use crate::event_bus::Subscription;
    use async_trait::async_trait;

    struct NullSink;

    #[async_trait]
    impl PositionSink for NullSink {
        async fn set_position(&self, _device_id: &str, _lat: f64, _lon: f64) -> Result<()> {
            Ok(())
        }
    }

    fn setup() -> (RouteSequencer, CruiseScheduler, Subscription) {
        let config = SimulationConfig::default();
        let bus = EventBus::new(&config).unwrap();
        let sub = bus.subscribe();
        let cruise = CruiseScheduler::new(Arc::new(NullSink), bus.clone(), config);
        let sequencer = RouteSequencer::new(cruise.clone(), Arc::new(StraightLineProvider), bus);
        (sequencer, cruise, sub)
    }

    /// Let the bus dispatcher drain.
    async fn settle() {
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
    }

    async fn build_abc(sequencer: &RouteSequencer) -> Route {
        sequencer.add_waypoint("d1", 25.0, 121.5).await.unwrap();
        sequencer.add_waypoint("d1", 25.001, 121.5).await.unwrap();
        sequencer.add_waypoint("d1", 25.001, 121.501).await.unwrap()
    }

    #[tokio::test]
    async fn test_first_waypoint_is_start() {
        let (sequencer, _cruise, _sub) = setup();
        let route = sequencer.add_waypoint("d1", 25.0, 121.5).await.unwrap();
        assert_eq!(route.waypoints.len(), 1);
        assert_eq!(route.waypoints[0].name, "START");
        assert!(route.segments.is_empty());
    }

    #[tokio::test]
    async fn test_add_waypoint_rejects_invalid_coordinates() {
        let (sequencer, _cruise, _sub) = setup();
        assert!(matches!(
            sequencer.add_waypoint("d1", f64::NAN, 0.0).await,
            Err(SimError::InvalidCoordinates { .. })
        ));
    }

    #[tokio::test]
    async fn test_loop_mode_toggle_segment_counts() {
        let (sequencer, _cruise, _sub) = setup();
        let route = build_abc(&sequencer).await;
        assert_eq!(route.segments.len(), 2);

        let looped = sequencer.set_loop_mode("d1", true).await.unwrap();
        assert_eq!(looped.segments.len(), 3);
        assert_eq!(looped.closure_index(), Some(2));
        assert_eq!(looped.segments[2].to_waypoint, 0);

        // Enabling again does not add a second closure
        let again = sequencer.set_loop_mode("d1", true).await.unwrap();
        assert_eq!(again.segments.len(), 3);

        let unlooped = sequencer.set_loop_mode("d1", false).await.unwrap();
        assert_eq!(unlooped.segments.len(), 2);
        assert!(!unlooped.has_closure());
    }

    #[tokio::test]
    async fn test_add_waypoint_under_loop_mode_recomputes_closure() {
        let (sequencer, _cruise, _sub) = setup();
        build_abc(&sequencer).await;
        sequencer.set_loop_mode("d1", true).await.unwrap();

        let route = sequencer.add_waypoint("d1", 25.0, 121.501).await.unwrap();
        assert_eq!(route.waypoints.len(), 4);
        assert_eq!(route.segments.len(), 4);
        let closure = &route.segments[3];
        assert!(closure.is_closure);
        assert_eq!(closure.from_waypoint, 3);
        assert_eq!(closure.polyline[0], route.waypoints[3].position());
        assert_eq!(closure.polyline[1], route.waypoints[0].position());
    }

    #[tokio::test]
    async fn test_undo_waypoints_down_to_empty() {
        let (sequencer, _cruise, mut sub) = setup();
        build_abc(&sequencer).await;
        sequencer.set_loop_mode("d1", true).await.unwrap();

        let route = sequencer.undo_waypoint("d1").await.unwrap();
        assert_eq!(route.waypoints.len(), 2);
        // One forward segment plus the recomputed closure
        assert_eq!(route.segments.len(), 2);
        assert!(route.has_closure());

        let route = sequencer.undo_waypoint("d1").await.unwrap();
        assert_eq!(route.waypoints.len(), 1);
        assert!(route.segments.is_empty());

        let route = sequencer.undo_waypoint("d1").await.unwrap();
        assert!(route.waypoints.is_empty());
        assert!(sequencer.route("d1").is_none());
        assert!(matches!(
            sequencer.undo_waypoint("d1").await,
            Err(SimError::NothingToUndo)
        ));

        settle().await;
        let mut undo_events = 0;
        while let Some(event) = sub.try_recv() {
            if let SimEvent::RouteWaypointAdded(e) = event {
                if e.waypoint.is_none() {
                    undo_events += 1;
                }
            }
        }
        assert_eq!(undo_events, 3);
    }

    #[tokio::test]
    async fn test_start_requires_geometry() {
        let (sequencer, _cruise, _sub) = setup();
        assert!(matches!(
            sequencer.start_route_cruise("d1", 10.0).await,
            Err(SimError::InsufficientWaypoints { waypoint_count: 0 })
        ));

        sequencer.add_waypoint("d1", 25.0, 121.5).await.unwrap();
        assert!(matches!(
            sequencer.start_route_cruise("d1", 10.0).await,
            Err(SimError::InsufficientWaypoints { waypoint_count: 1 })
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_route_edits_rejected_while_running() {
        let (sequencer, cruise, _sub) = setup();
        build_abc(&sequencer).await;
        sequencer.start_route_cruise("d1", 10.0).await.unwrap();

        assert!(matches!(
            sequencer.add_waypoint("d1", 25.002, 121.5).await,
            Err(SimError::RouteBusy { .. })
        ));
        assert!(matches!(
            sequencer.undo_waypoint("d1").await,
            Err(SimError::RouteBusy { .. })
        ));
        assert!(matches!(sequencer.clear_route("d1"), Err(SimError::RouteBusy { .. })));
        assert!(cruise.has_arrival_callback("d1"));

        // Paused routes may be edited
        sequencer.pause_route_cruise("d1").unwrap();
        assert_eq!(cruise.status("d1").state(), CruiseState::Paused);
        sequencer.undo_waypoint("d1").await.unwrap();

        assert!(sequencer.stop_route_cruise("d1").await.unwrap());
        assert!(!cruise.has_arrival_callback("d1"));
        assert_eq!(cruise.status("d1").state(), CruiseState::Idle);
        assert_eq!(sequencer.route_status("d1").state(), CruiseState::Idle);
        sequencer.clear_route("d1").unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_pause_resume_state_checks() {
        let (sequencer, _cruise, _sub) = setup();
        assert!(matches!(
            sequencer.pause_route_cruise("d1"),
            Err(SimError::NoActiveRouteCruise { .. })
        ));

        build_abc(&sequencer).await;
        sequencer.start_route_cruise("d1", 10.0).await.unwrap();
        assert!(matches!(
            sequencer.resume_route_cruise("d1"),
            Err(SimError::InvalidState { .. })
        ));
        assert!(matches!(
            sequencer.reroute_and_resume("d1", 25.0, 121.5).await,
            Err(SimError::InvalidState { .. })
        ));

        let paused = sequencer.pause_route_cruise("d1").unwrap();
        assert_eq!(paused.state, CruiseState::Paused);
        let resumed = sequencer.resume_route_cruise("d1").unwrap();
        assert_eq!(resumed.state, CruiseState::Running);

        assert_eq!(sequencer.set_route_speed("d1", 0.0).unwrap(), 0.1);
        sequencer.stop_all().await;
        assert!(sequencer.route_session("d1").is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_start_replaces_plain_cruise() {
        let (sequencer, cruise, mut sub) = setup();
        build_abc(&sequencer).await;
        cruise
            .start(
                "d1",
                Position::new(30.0, 120.0),
                Position::new(30.01, 120.0),
                10.0,
            )
            .await
            .unwrap();

        let snapshot = sequencer.start_route_cruise("d1", 10.0).await.unwrap();
        assert_eq!(snapshot.state, CruiseState::Running);

        let crate::cruise::CruiseStatus::Active(leg) = cruise.status("d1") else {
            panic!("expected route leg");
        };
        assert_eq!(leg.target, Position::new(25.001, 121.5));

        settle().await;
        let mut saw_stopped = false;
        while let Some(event) = sub.try_recv() {
            if event.name() == "cruiseStopped" {
                saw_stopped = true;
            }
        }
        assert!(saw_stopped);
        sequencer.stop_all().await;
    }

    async fn next_named(sub: &mut Subscription, names: &[&str]) -> SimEvent {
        loop {
            let event = sub.recv().await.expect("bus closed");
            if names.contains(&event.name()) {
                return event;
            }
        }
    }

    fn leg_arrival(target: Position, distance_km: f64) -> CruiseSnapshot {
        CruiseSnapshot {
            device_id: "d1".to_string(),
            state: CruiseState::Arrived,
            location: target,
            target,
            speed_kmh: 10.0,
            remaining_km: 0.0,
            distance_traveled_km: distance_km,
            duration_seconds: 40.0,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_enable_loop_mode_while_running() {
        let (sequencer, _cruise, mut sub) = setup();
        build_abc(&sequencer).await;
        sequencer.start_route_cruise("d1", 36.0).await.unwrap();

        let route = sequencer.set_loop_mode("d1", true).await.unwrap();
        assert!(route.loop_mode);
        assert_eq!(route.segments.len(), 3);
        assert!(sequencer.route("d1").unwrap().has_closure());

        let event = next_named(&mut sub, &["routeLoopComplete", "routeArrived"]).await;
        let SimEvent::RouteLoopComplete(snapshot) = event else {
            panic!("route arrived instead of looping");
        };
        assert_eq!(snapshot.loops_completed, 1);
        assert_eq!(snapshot.current_segment_index, 0);
        assert_eq!(sequencer.route_status("d1").state(), CruiseState::Running);

        sequencer.stop_route_cruise("d1").await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_loop_mode_back_on_while_on_closure() {
        let (sequencer, _cruise, _sub) = setup();
        build_abc(&sequencer).await;
        sequencer.set_loop_mode("d1", true).await.unwrap();
        sequencer.start_route_cruise("d1", 10.0).await.unwrap();
        sequencer.pause_route_cruise("d1").unwrap();

        sequencer.table().sessions.get_mut("d1").unwrap().current_segment_index = 2;
        let kept = sequencer.set_loop_mode("d1", false).await.unwrap();
        assert!(kept.has_closure());

        let route = sequencer.set_loop_mode("d1", true).await.unwrap();
        assert!(route.loop_mode);
        assert_eq!(route.segments.len(), 3);

        sequencer.stop_route_cruise("d1").await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_arrival_while_paused_is_applied_on_resume() {
        let (sequencer, cruise, _sub) = setup();
        build_abc(&sequencer).await;
        sequencer.start_route_cruise("d1", 10.0).await.unwrap();
        sequencer.pause_route_cruise("d1").unwrap();

        sequencer.on_point_arrival(leg_arrival(Position::new(25.001, 121.5), 0.111));
        {
            let table = sequencer.table();
            let session = &table.sessions["d1"];
            assert_eq!(session.pending_arrival_km, Some(0.111));
            assert_eq!(session.distance_traveled_km, 0.0);
            assert_eq!(session.current_step_in_segment, 0);
        }

        let resumed = sequencer.resume_route_cruise("d1").unwrap();
        assert_eq!(resumed.state, CruiseState::Running);
        assert_eq!(resumed.distance_traveled_km, 0.111);
        assert_eq!(resumed.current_step_in_segment, 1);

        // The feed moved on to the second segment
        let session = sequencer.route_session("d1").unwrap();
        assert_eq!(session.current_segment_index, 1);
        assert_eq!(session.segments_completed, 1);
        let crate::cruise::CruiseStatus::Active(leg) = cruise.status("d1") else {
            panic!("expected route leg");
        };
        assert_eq!(leg.target, Position::new(25.001, 121.501));
        assert!(sequencer.table().sessions["d1"].pending_arrival_km.is_none());

        sequencer.stop_route_cruise("d1").await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_arrival_while_paused_is_kept_by_reroute() {
        let (sequencer, cruise, _sub) = setup();
        build_abc(&sequencer).await;
        sequencer.start_route_cruise("d1", 10.0).await.unwrap();
        sequencer.pause_route_cruise("d1").unwrap();

        sequencer.on_point_arrival(leg_arrival(Position::new(25.001, 121.5), 0.111));
        let rerouted = sequencer
            .reroute_and_resume("d1", 25.0005, 121.5005)
            .await
            .unwrap();
        assert_eq!(rerouted.state, CruiseState::Running);
        assert_eq!(rerouted.distance_traveled_km, 0.111);
        assert_eq!(rerouted.current_segment_index, 0);

        let crate::cruise::CruiseStatus::Active(leg) = cruise.status("d1") else {
            panic!("expected reroute leg");
        };
        assert_eq!(leg.location, Position::new(25.0005, 121.5005));
        assert_eq!(leg.target, Position::new(25.001, 121.5));
        assert!(sequencer.table().sessions["d1"].pending_arrival_km.is_none());

        sequencer.stop_route_cruise("d1").await.unwrap();
    }
}
