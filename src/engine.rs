//! # Simulation Engine
//!
//! Top-level context that owns one event bus, one cruise scheduler and one
//! route sequencer wired together. A host process creates it at startup,
//! hands [`SimulationEngine::subscribe`] streams to its transport, and calls
//! [`SimulationEngine::shutdown`] on exit.
//!
//! There is no global instance; the host passes the engine (or clones of its
//! parts) wherever they are needed.

use std::sync::Arc;

use log::info;
use tokio::runtime::Handle;

use crate::collaborators::{PositionSink, RoutingProvider};
use crate::config::SimulationConfig;
use crate::cruise::CruiseScheduler;
use crate::error::{Result, SimError};
use crate::event_bus::{EventBus, Subscription};
use crate::sequencer::RouteSequencer;

/// Bus, scheduler and sequencer for one process.
#[derive(Clone)]
pub struct SimulationEngine {
    bus: EventBus,
    cruise: CruiseScheduler,
    routes: RouteSequencer,
    config: SimulationConfig,
}

impl SimulationEngine {
    /// Build an engine on the current tokio runtime.
    pub fn new(
        sink: Arc<dyn PositionSink>,
        provider: Arc<dyn RoutingProvider>,
        config: SimulationConfig,
    ) -> Result<Self> {
        let handle = Handle::try_current().map_err(|e| SimError::Internal {
            message: format!("SimulationEngine needs a tokio runtime: {}", e),
        })?;
        Ok(Self::with_handle(&handle, sink, provider, config))
    }

    /// Build an engine whose event dispatcher runs on `handle`.
    pub fn with_handle(
        handle: &Handle,
        sink: Arc<dyn PositionSink>,
        provider: Arc<dyn RoutingProvider>,
        config: SimulationConfig,
    ) -> Self {
        let bus = EventBus::with_handle(handle, &config);
        let cruise = CruiseScheduler::new(sink, bus.clone(), config.clone());
        let routes = RouteSequencer::new(cruise.clone(), provider, bus.clone());

        info!(
            "[SimulationEngine] Initialized (tick {}+{}ms)",
            config.tick_base_ms, config.tick_jitter_ms
        );

        Self {
            bus,
            cruise,
            routes,
            config,
        }
    }

    pub fn cruise(&self) -> &CruiseScheduler {
        &self.cruise
    }

    pub fn routes(&self) -> &RouteSequencer {
        &self.routes
    }

    pub fn bus(&self) -> &EventBus {
        &self.bus
    }

    pub fn config(&self) -> &SimulationConfig {
        &self.config
    }

    /// New event stream covering every device.
    pub fn subscribe(&self) -> Subscription {
        self.bus.subscribe()
    }

    pub fn stats(&self) -> EngineStats {
        EngineStats {
            cruise_count: self.cruise.active_devices().len() as u32,
            route_cruise_count: self.routes.active_devices().len() as u32,
            subscriber_count: self.bus.subscriber_count() as u32,
        }
    }

    /// Stop every route and cruise, then end all event streams.
    pub async fn shutdown(&self) {
        let stats = self.stats();
        info!(
            "[SimulationEngine] Shutting down ({} cruises, {} routes)",
            stats.cruise_count, stats.route_cruise_count
        );

        self.routes.stop_all().await;
        self.cruise.stop_all().await;
        self.bus.close();
    }
}

/// Engine statistics for monitoring.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineStats {
    pub cruise_count: u32,
    pub route_cruise_count: u32,
    pub subscriber_count: u32,
}
