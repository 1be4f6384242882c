//! External quiescence detection.
//!
//! A node in a GHS round cannot know locally whether it has received
//! everything it is going to: the set of correspondents depends on fragment
//! structure only the leader sees. The orchestrator can see every mailbox,
//! so it breaks the symmetry from outside: once the whole fabric has stayed
//! idle for a sustained window, nobody is going to send anything new, and a
//! beacon is injected into every mailbox to unblock the receive loops.

use radiomesh_fabric::Fabric;
use radiomesh_types::SimConfig;
use tokio::time::sleep;
use tracing::debug;

/// Poll the fabric until it stays quiet for `quiescence_window` consecutive
/// observations, then beacon every mailbox exactly once.
///
/// Any non-quiet observation resets the countdown; a single quiet snapshot
/// afterwards starts it again. Larger fleets want a larger window, trading
/// phase latency for robustness.
pub(crate) async fn watch(fabric: &Fabric, config: &SimConfig) {
    let window = config.quiescence_window;
    let mut remaining = window;
    while remaining > 0 {
        remaining = if fabric.is_quiet() { remaining - 1 } else { window };
        sleep(config.poll_interval).await;
    }
    debug!("fabric quiet, beaconing phase to an end");
    fabric.broadcast_beacon();
}
