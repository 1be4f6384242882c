use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Tunables of one simulation run.
///
/// Shared read-only (behind an `Arc`) by the orchestrator and every node
/// after initialization.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SimConfig {
    /// Maximum distance over which two nodes hear each other.
    pub radio_radius: f64,
    /// Energy billed per meter for one tree hop of a data broadcast.
    pub broadcast_cost_factor: f64,
    /// Consecutive idle observations the quiescence detector requires before
    /// injecting beacons. Larger fleets want a larger window.
    pub quiescence_window: u32,
    /// Delay between two detector observations.
    pub poll_interval: Duration,
    /// Energy floor; a node crossing below it is marked dead.
    pub minimum_budget: f64,
}

impl Default for SimConfig {
    fn default() -> Self {
        Self {
            radio_radius: 10.0,
            broadcast_cost_factor: 1.2,
            quiescence_window: 10,
            poll_interval: Duration::from_millis(1),
            minimum_budget: 0.0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_reference_configuration() {
        let config = SimConfig::default();
        assert_eq!(config.radio_radius, 10.0);
        assert_eq!(config.broadcast_cost_factor, 1.2);
        assert_eq!(config.quiescence_window, 10);
        assert_eq!(config.minimum_budget, 0.0);
    }
}
