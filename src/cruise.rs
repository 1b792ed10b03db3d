//! # Cruise Scheduler
//!
//! Moves a simulated device from a start position toward a target at a fixed
//! speed. Every device with an active cruise gets one tokio task (its tick
//! loop); sessions for different devices never share a loop.
//!
//! ## Tick loop
//!
//! Each tick sleeps a jittered interval, measures the wall time since the last
//! processed tick, and moves the position that far along the bearing to the
//! target. Once the remaining distance drops below
//! [`arrival_threshold_km`] the position snaps to the target and the session
//! arrives.
//!
//! ## Arrival ownership
//!
//! A device can carry an arrival callback. When it does, the loop hands the
//! arrived session to the callback instead of tearing it down
//! ([`ArrivalOutcome::OwnedByCaller`]); the callback usually starts the next
//! leg right away, replacing the session from inside its own loop. Loops are
//! identified by a generation number so that replace/stop can tell when they
//! are being called from the very loop they would otherwise wait for.
//!
//! The registry mutex is never held across the position sink, an arrival
//! callback or a publish.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use log::{debug, error, info, warn};
use rand::Rng;
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::collaborators::PositionSink;
use crate::config::SimulationConfig;
use crate::error::{Result, SimError};
use crate::event_bus::EventBus;
use crate::events::{CruiseErrorEvent, CruiseStoppedEvent, SimEvent};
use crate::geo_utils::{arrival_threshold_km, bearing_to, haversine_distance, project};
use crate::{device_tag, Position};

tokio::task_local! {
    /// Generation of the tick loop running on the current task.
    static LOOP_GENERATION: u64;
}

fn current_loop_generation() -> Option<u64> {
    LOOP_GENERATION.try_with(|generation| *generation).ok()
}

// ============================================================================
// Session Types
// ============================================================================

/// Lifecycle state shared by cruise and route sessions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CruiseState {
    Idle,
    Running,
    Paused,
    Arrived,
    Stopped,
}

impl CruiseState {
    pub fn as_str(&self) -> &'static str {
        match self {
            CruiseState::Idle => "idle",
            CruiseState::Running => "running",
            CruiseState::Paused => "paused",
            CruiseState::Arrived => "arrived",
            CruiseState::Stopped => "stopped",
        }
    }

    /// Arrived and Stopped never transition again.
    pub fn is_terminal(&self) -> bool {
        matches!(self, CruiseState::Arrived | CruiseState::Stopped)
    }
}

impl fmt::Display for CruiseState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Live state of one point-to-point cruise.
#[derive(Debug, Clone)]
pub struct CruiseSession {
    pub device_id: String,
    pub start: Position,
    pub target: Position,
    pub speed_kmh: f64,
    pub state: CruiseState,
    pub current: Position,
    pub distance_traveled_km: f64,
    started_at: Instant,
    last_tick: Instant,
}

impl CruiseSession {
    fn new(device_id: &str, start: Position, target: Position, speed_kmh: f64) -> Self {
        let now = Instant::now();
        Self {
            device_id: device_id.to_string(),
            start,
            target,
            speed_kmh,
            state: CruiseState::Running,
            current: start,
            distance_traveled_km: 0.0,
            started_at: now,
            last_tick: now,
        }
    }

    pub fn remaining_km(&self) -> f64 {
        haversine_distance(&self.current, &self.target)
    }

    pub fn snapshot(&self) -> CruiseSnapshot {
        CruiseSnapshot {
            device_id: self.device_id.clone(),
            state: self.state,
            location: self.current,
            target: self.target,
            speed_kmh: self.speed_kmh,
            remaining_km: self.remaining_km(),
            distance_traveled_km: self.distance_traveled_km,
            duration_seconds: self.started_at.elapsed().as_secs_f64(),
        }
    }

    /// Advance one tick at `now`.
    fn advance(&mut self, now: Instant) -> Result<Tick> {
        match self.state {
            CruiseState::Paused => return Ok(Tick::Skip),
            CruiseState::Running => {}
            _ => return Ok(Tick::Halt),
        }

        // Measured, not nominal, so jitter does not skew the speed
        let elapsed = now.saturating_duration_since(self.last_tick).as_secs_f64();
        self.last_tick = now;

        let remaining = self.remaining_km();
        if remaining < arrival_threshold_km(self.speed_kmh) {
            self.current = self.target;
            self.state = CruiseState::Arrived;
            return Ok(Tick::Arrived(self.snapshot()));
        }

        let step_km = self.speed_kmh * elapsed / 3600.0;
        let next = if step_km >= remaining {
            self.target
        } else {
            let bearing = bearing_to(&self.current, &self.target);
            project(&self.current, bearing, self.speed_kmh, elapsed)
        };

        if !next.is_valid() {
            return Err(SimError::Internal {
                message: format!(
                    "projected invalid position ({}, {}) from ({}, {})",
                    next.latitude, next.longitude, self.current.latitude, self.current.longitude
                ),
            });
        }

        self.distance_traveled_km += haversine_distance(&self.current, &next);
        self.current = next;
        Ok(Tick::Moved(self.snapshot()))
    }
}

/// Serializable view of a cruise session.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CruiseSnapshot {
    pub device_id: String,
    pub state: CruiseState,
    pub location: Position,
    pub target: Position,
    pub speed_kmh: f64,
    pub remaining_km: f64,
    pub distance_traveled_km: f64,
    pub duration_seconds: f64,
}

/// Cruise status of a device: idle, or the live session.
#[derive(Debug, Clone, PartialEq)]
pub enum CruiseStatus {
    Idle { device_id: String },
    Active(CruiseSnapshot),
}

impl CruiseStatus {
    pub fn state(&self) -> CruiseState {
        match self {
            CruiseStatus::Idle { .. } => CruiseState::Idle,
            CruiseStatus::Active(snapshot) => snapshot.state,
        }
    }
}

/// Who tears down a session that reached its target.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArrivalOutcome {
    /// An arrival callback took the session; the caller replaces or cleans it up.
    OwnedByCaller,
    /// No callback; the loop removed the session and published `cruiseArrived`.
    SelfManaged,
}

/// Invoked from the tick loop when a session with a registered callback
/// arrives. Runs outside the registry lock and may start a new session for
/// the same device.
pub type ArrivalCallback = Arc<dyn Fn(CruiseSnapshot) + Send + Sync>;

enum Tick {
    Skip,
    Halt,
    Moved(CruiseSnapshot),
    Arrived(CruiseSnapshot),
}

// ============================================================================
// Registry
// ============================================================================

struct Slot {
    session: CruiseSession,
    generation: u64,
    cancel: CancellationToken,
    handle: Option<JoinHandle<()>>,
}

#[derive(Default)]
struct Registry {
    sessions: HashMap<String, Slot>,
    arrival_callbacks: HashMap<String, ArrivalCallback>,
}

impl Registry {
    fn current(&mut self, device_id: &str, generation: u64) -> Option<&mut Slot> {
        self.sessions
            .get_mut(device_id)
            .filter(|slot| slot.generation == generation)
    }
}

struct SchedulerInner {
    registry: Mutex<Registry>,
    sink: Arc<dyn PositionSink>,
    bus: EventBus,
    config: SimulationConfig,
    next_generation: AtomicU64,
}

impl SchedulerInner {
    fn registry(&self) -> MutexGuard<'_, Registry> {
        self.registry.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn is_current(&self, device_id: &str, generation: u64) -> bool {
        self.registry().current(device_id, generation).is_some()
    }

    fn next_interval(&self) -> Duration {
        let jitter = if self.config.tick_jitter_ms > 0 {
            rand::thread_rng().gen_range(0..=self.config.tick_jitter_ms)
        } else {
            0
        };
        Duration::from_millis(self.config.tick_base_ms + jitter)
    }
}

// ============================================================================
// Cruise Scheduler
// ============================================================================

/// Owns every device's cruise session and tick loop.
///
/// Cheap to clone; clones share the registry. Starting a session spawns onto
/// the ambient tokio runtime, so calls must come from inside one.
#[derive(Clone)]
pub struct CruiseScheduler {
    inner: Arc<SchedulerInner>,
}

impl CruiseScheduler {
    pub fn new(sink: Arc<dyn PositionSink>, bus: EventBus, config: SimulationConfig) -> Self {
        Self {
            inner: Arc::new(SchedulerInner {
                registry: Mutex::new(Registry::default()),
                sink,
                bus,
                config,
                next_generation: AtomicU64::new(1),
            }),
        }
    }

    pub fn config(&self) -> &SimulationConfig {
        &self.inner.config
    }

    /// Start cruising `device_id` from `start` to `target`.
    ///
    /// An existing session for the device is cancelled and awaited (bounded
    /// by the stop timeout) before the new one is installed.
    pub async fn start(
        &self,
        device_id: &str,
        start: Position,
        target: Position,
        speed_kmh: f64,
    ) -> Result<CruiseSnapshot> {
        let speed_kmh = self.validate(start, target, speed_kmh)?;

        let previous = self.inner.registry().sessions.remove(device_id);
        if let Some(previous) = previous {
            debug!("[CruiseScheduler] [{}] Replacing existing cruise", device_tag(device_id));
            previous.cancel.cancel();
            self.join(device_id, previous.generation, previous.handle).await;
        }

        Ok(self.launch(device_id, start, target, speed_kmh))
    }

    /// Start a leg without waiting for a replaced session to exit.
    ///
    /// Used by the route sequencer, which calls this from inside the arrival
    /// callback of the very loop being replaced. A replaced loop notices its
    /// generation is gone and exits without publishing anything.
    pub(crate) fn start_leg(
        &self,
        device_id: &str,
        start: Position,
        target: Position,
        speed_kmh: f64,
    ) -> Result<CruiseSnapshot> {
        let speed_kmh = self.validate(start, target, speed_kmh)?;
        Ok(self.launch(device_id, start, target, speed_kmh))
    }

    fn validate(&self, start: Position, target: Position, speed_kmh: f64) -> Result<f64> {
        for p in [start, target] {
            if !p.is_valid() {
                return Err(SimError::InvalidCoordinates {
                    latitude: p.latitude,
                    longitude: p.longitude,
                });
            }
        }

        let speed_kmh = self.inner.config.clamp_speed(speed_kmh);
        let distance_km = haversine_distance(&start, &target);
        if distance_km < arrival_threshold_km(speed_kmh) {
            return Err(SimError::AlreadyAtTarget { distance_km });
        }
        Ok(speed_kmh)
    }

    fn launch(
        &self,
        device_id: &str,
        start: Position,
        target: Position,
        speed_kmh: f64,
    ) -> CruiseSnapshot {
        let generation = self.inner.next_generation.fetch_add(1, Ordering::Relaxed);
        let cancel = CancellationToken::new();
        let session = CruiseSession::new(device_id, start, target, speed_kmh);
        let snapshot = session.snapshot();

        let replaced = {
            let mut registry = self.inner.registry();
            let handle = tokio::spawn(LOOP_GENERATION.scope(
                generation,
                run_loop(
                    Arc::clone(&self.inner),
                    device_id.to_string(),
                    generation,
                    cancel.clone(),
                ),
            ));
            registry.sessions.insert(
                device_id.to_string(),
                Slot {
                    session,
                    generation,
                    cancel,
                    handle: Some(handle),
                },
            )
        };

        if let Some(replaced) = replaced {
            replaced.cancel.cancel();
        }

        info!(
            "[CruiseScheduler] [{}] Cruise started: {:.3}km to target at {}km/h",
            device_tag(device_id),
            snapshot.remaining_km,
            speed_kmh
        );
        self.inner.bus.publish(SimEvent::CruiseStarted(snapshot.clone()));
        snapshot
    }

    /// Wait for a cancelled loop to exit, unless we are that loop.
    async fn join(&self, device_id: &str, generation: u64, handle: Option<JoinHandle<()>>) {
        if current_loop_generation() == Some(generation) {
            debug!(
                "[CruiseScheduler] [{}] Stop requested from own loop, not joining",
                device_tag(device_id)
            );
            return;
        }
        let Some(mut handle) = handle else { return };

        let timeout = self.inner.config.stop_join_timeout();
        if tokio::time::timeout(timeout, &mut handle).await.is_err() {
            warn!(
                "[CruiseScheduler] [{}] Loop did not exit within {:?}, aborting",
                device_tag(device_id),
                timeout
            );
            handle.abort();
        }
    }

    /// Stop the device's cruise and publish `cruiseStopped`.
    ///
    /// Returns `false` when there was nothing to stop.
    pub async fn stop(&self, device_id: &str) -> Result<bool> {
        self.stop_with_reason(device_id, "stopped").await
    }

    pub(crate) async fn stop_with_reason(&self, device_id: &str, reason: &str) -> Result<bool> {
        let slot = self.inner.registry().sessions.remove(device_id);
        let Some(slot) = slot else {
            return Ok(false);
        };

        slot.cancel.cancel();
        self.join(device_id, slot.generation, slot.handle).await;

        info!("[CruiseScheduler] [{}] Cruise stopped ({})", device_tag(device_id), reason);
        self.inner
            .bus
            .publish(SimEvent::CruiseStopped(CruiseStoppedEvent {
                device_id: device_id.to_string(),
                reason: reason.to_string(),
            }));
        Ok(true)
    }

    /// Stop every session. Called on shutdown.
    pub async fn stop_all(&self) {
        let devices = self.active_devices();
        for device_id in devices {
            if let Err(e) = self.stop(&device_id).await {
                warn!("[CruiseScheduler] [{}] Stop failed: {}", device_tag(&device_id), e);
            }
        }
    }

    /// Drop a session without publishing anything.
    ///
    /// This is the explicit teardown for [`ArrivalOutcome::OwnedByCaller`];
    /// safe to call from inside an arrival callback.
    pub fn cleanup_session(&self, device_id: &str) -> bool {
        let slot = self.inner.registry().sessions.remove(device_id);
        match slot {
            Some(slot) => {
                slot.cancel.cancel();
                debug!("[CruiseScheduler] [{}] Session cleaned up", device_tag(device_id));
                true
            }
            None => false,
        }
    }

    pub fn pause(&self, device_id: &str) -> Result<CruiseSnapshot> {
        let snapshot = {
            let mut registry = self.inner.registry();
            let slot = registry
                .sessions
                .get_mut(device_id)
                .ok_or_else(|| SimError::NoActiveCruise {
                    device_id: device_id.to_string(),
                })?;
            if slot.session.state != CruiseState::Running {
                return Err(SimError::invalid_state("pause", slot.session.state));
            }
            slot.session.state = CruiseState::Paused;
            slot.session.snapshot()
        };

        info!("[CruiseScheduler] [{}] Cruise paused", device_tag(device_id));
        self.inner.bus.publish(SimEvent::CruisePaused(snapshot.clone()));
        Ok(snapshot)
    }

    pub fn resume(&self, device_id: &str) -> Result<CruiseSnapshot> {
        let snapshot = {
            let mut registry = self.inner.registry();
            let slot = registry
                .sessions
                .get_mut(device_id)
                .ok_or_else(|| SimError::NoActiveCruise {
                    device_id: device_id.to_string(),
                })?;
            if slot.session.state != CruiseState::Paused {
                return Err(SimError::invalid_state("resume", slot.session.state));
            }
            slot.session.state = CruiseState::Running;
            // Elapsed time restarts here so the paused interval is not travelled
            slot.session.last_tick = Instant::now();
            slot.session.snapshot()
        };

        info!("[CruiseScheduler] [{}] Cruise resumed", device_tag(device_id));
        self.inner.bus.publish(SimEvent::CruiseResumed(snapshot.clone()));
        Ok(snapshot)
    }

    /// Change the speed of a running or paused session. Returns the applied
    /// speed after clamping to the configured minimum.
    pub fn set_speed(&self, device_id: &str, speed_kmh: f64) -> Result<f64> {
        let speed_kmh = self.inner.config.clamp_speed(speed_kmh);
        let mut registry = self.inner.registry();
        let slot = registry
            .sessions
            .get_mut(device_id)
            .ok_or_else(|| SimError::NoActiveCruise {
                device_id: device_id.to_string(),
            })?;
        slot.session.speed_kmh = speed_kmh;
        debug!(
            "[CruiseScheduler] [{}] Cruise speed set to {}km/h",
            device_tag(device_id),
            speed_kmh
        );
        Ok(speed_kmh)
    }

    pub fn status(&self, device_id: &str) -> CruiseStatus {
        match self.inner.registry().sessions.get(device_id) {
            Some(slot) => CruiseStatus::Active(slot.session.snapshot()),
            None => CruiseStatus::Idle {
                device_id: device_id.to_string(),
            },
        }
    }

    pub fn active_devices(&self) -> Vec<String> {
        self.inner.registry().sessions.keys().cloned().collect()
    }

    /// Hand future arrivals for `device_id` to `callback`.
    pub fn on_arrival(&self, device_id: &str, callback: ArrivalCallback) {
        self.inner
            .registry()
            .arrival_callbacks
            .insert(device_id.to_string(), callback);
    }

    pub fn remove_arrival_callback(&self, device_id: &str) -> bool {
        self.inner
            .registry()
            .arrival_callbacks
            .remove(device_id)
            .is_some()
    }

    pub fn has_arrival_callback(&self, device_id: &str) -> bool {
        self.inner
            .registry()
            .arrival_callbacks
            .contains_key(device_id)
    }
}

// ============================================================================
// Tick Loop
// ============================================================================

async fn run_loop(
    inner: Arc<SchedulerInner>,
    device_id: String,
    generation: u64,
    cancel: CancellationToken,
) {
    match tick_loop(&inner, &device_id, generation, &cancel).await {
        Ok(Some(outcome)) => {
            debug!(
                "[CruiseScheduler] [{}] Loop finished: {:?}",
                device_tag(&device_id),
                outcome
            );
        }
        Ok(None) => {
            debug!("[CruiseScheduler] [{}] Loop cancelled", device_tag(&device_id));
        }
        Err(e) => {
            error!("[CruiseScheduler] [{}] Cruise loop error: {}", device_tag(&device_id), e);
            let removed = {
                let mut registry = inner.registry();
                if registry.current(&device_id, generation).is_some() {
                    registry.sessions.remove(&device_id)
                } else {
                    None
                }
            };
            if let Some(mut slot) = removed {
                slot.session.state = CruiseState::Stopped;
                inner.bus.publish(SimEvent::CruiseError(CruiseErrorEvent {
                    device_id: device_id.clone(),
                    error: e.to_string(),
                }));
            }
        }
    }
}

/// Returns `None` when cancelled or replaced.
async fn tick_loop(
    inner: &Arc<SchedulerInner>,
    device_id: &str,
    generation: u64,
    cancel: &CancellationToken,
) -> Result<Option<ArrivalOutcome>> {
    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => return Ok(None),
            _ = tokio::time::sleep(inner.next_interval()) => {}
        }

        let tick = {
            let mut registry = inner.registry();
            let Some(slot) = registry.current(device_id, generation) else {
                return Ok(None);
            };
            slot.session.advance(Instant::now())?
        };

        match tick {
            Tick::Skip => continue,
            Tick::Halt => return Ok(None),
            Tick::Moved(snapshot) => {
                if !write_position(inner, device_id, snapshot.location, cancel).await {
                    return Ok(None);
                }
                if !inner.is_current(device_id, generation) {
                    return Ok(None);
                }
                inner.bus.publish(SimEvent::CruiseUpdate(snapshot));
            }
            Tick::Arrived(snapshot) => {
                return Ok(finish_arrival(inner, device_id, generation, snapshot, cancel).await);
            }
        }
    }
}

async fn finish_arrival(
    inner: &Arc<SchedulerInner>,
    device_id: &str,
    generation: u64,
    snapshot: CruiseSnapshot,
    cancel: &CancellationToken,
) -> Option<ArrivalOutcome> {
    if !write_position(inner, device_id, snapshot.target, cancel).await {
        return None;
    }

    let callback = {
        let mut registry = inner.registry();
        registry.current(device_id, generation)?;
        registry.arrival_callbacks.get(device_id).cloned()
    };

    if let Some(callback) = callback {
        debug!(
            "[CruiseScheduler] [{}] Leg arrived after {:.3}km, handing off",
            device_tag(device_id),
            snapshot.distance_traveled_km
        );
        callback(snapshot);
        return Some(ArrivalOutcome::OwnedByCaller);
    }

    let removed = {
        let mut registry = inner.registry();
        registry.current(device_id, generation)?;
        registry.sessions.remove(device_id)
    };
    drop(removed);

    info!(
        "[CruiseScheduler] [{}] Cruise arrived after {:.3}km",
        device_tag(device_id),
        snapshot.distance_traveled_km
    );
    inner.bus.publish(SimEvent::CruiseArrived(snapshot));
    Some(ArrivalOutcome::SelfManaged)
}

/// Push a position to the sink. Sink errors are logged and swallowed; returns
/// `false` only when cancelled mid-write.
async fn write_position(
    inner: &SchedulerInner,
    device_id: &str,
    position: Position,
    cancel: &CancellationToken,
) -> bool {
    let result = tokio::select! {
        biased;
        _ = cancel.cancelled() => return false,
        result = inner.sink.set_position(device_id, position.latitude, position.longitude) => result,
    };

    if let Err(e) = result {
        warn!(
            "[CruiseScheduler] [{}] Failed to set position: {}",
            device_tag(device_id),
            e
        );
    }
    true
}
