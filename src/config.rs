//! Configuration for the simulation engine and the routing backend.

use std::time::Duration;

/// Default BRouter endpoint.
pub const DEFAULT_BROUTER_URL: &str = "https://brouter.de/brouter";

/// Configuration for cruise tick loops and event distribution.
#[derive(Debug, Clone)]
pub struct SimulationConfig {
    /// Base interval between ticks in milliseconds.
    /// Default: 100
    pub tick_base_ms: u64,

    /// Upper bound of the uniform random jitter added to every tick, in
    /// milliseconds. Keeps many simulated devices from updating in lockstep.
    /// Default: 100
    pub tick_jitter_ms: u64,

    /// How long stop/replace waits for a tick loop to exit.
    /// Default: 2000
    pub stop_join_timeout_ms: u64,

    /// Lowest accepted speed. Anything slower is clamped up so a session can
    /// never stall permanently.
    /// Default: 0.1 km/h
    pub min_speed_kmh: f64,

    /// Per-subscriber event queue size. Events for a full queue are dropped.
    /// Default: 100
    pub subscriber_queue_capacity: usize,

    /// Queue between publishers and the bus dispatcher.
    /// Default: 1024
    pub publish_queue_capacity: usize,
}

impl Default for SimulationConfig {
    fn default() -> Self {
        Self {
            tick_base_ms: 100,
            tick_jitter_ms: 100,
            stop_join_timeout_ms: 2000,
            min_speed_kmh: 0.1,
            subscriber_queue_capacity: 100,
            publish_queue_capacity: 1024,
        }
    }
}

impl SimulationConfig {
    pub fn stop_join_timeout(&self) -> Duration {
        Duration::from_millis(self.stop_join_timeout_ms)
    }

    /// Clamp a requested speed to the configured minimum. NaN maps to the
    /// minimum as well.
    pub fn clamp_speed(&self, speed_kmh: f64) -> f64 {
        if speed_kmh.is_nan() {
            self.min_speed_kmh
        } else {
            speed_kmh.max(self.min_speed_kmh)
        }
    }
}

/// Configuration for the BRouter routing provider.
#[derive(Debug, Clone)]
pub struct BrouterConfig {
    /// Base URL of the BRouter HTTP endpoint.
    pub api_url: String,
    /// Routing profile passed to BRouter.
    /// Default: "trekking"
    pub profile: String,
    /// Per-request timeout in seconds.
    /// Default: 10
    pub timeout_secs: u64,
    /// Attempts before falling back to a straight line.
    /// Default: 3
    pub max_retries: u32,
}

impl Default for BrouterConfig {
    fn default() -> Self {
        Self {
            api_url: DEFAULT_BROUTER_URL.to_string(),
            profile: "trekking".to_string(),
            timeout_secs: 10,
            max_retries: 3,
        }
    }
}

impl BrouterConfig {
    /// Defaults, with the endpoint taken from `BROUTER_API_URL` when set.
    pub fn from_env() -> Self {
        let mut config = Self::default();
        if let Ok(url) = std::env::var("BROUTER_API_URL") {
            if !url.trim().is_empty() {
                config.api_url = url;
            }
        }
        config
    }
}
