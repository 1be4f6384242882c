//! Roster lifecycle after broadcasts: sweeping out nodes that ran out of
//! energy and recomputing the tree for whoever is left.

use std::sync::Arc;

use anyhow::Result;
use radiomesh_fabric::Fabric;
use radiomesh_journal::{Journal, Record};
use radiomesh_node::Node;
use radiomesh_types::SimConfig;
use tracing::info;

use crate::orchestrator::find_mst;

/// Remove dead nodes from the roster. When anyone died, the survivors are
/// wiped back to their just-constructed protocol state, attached to a
/// brand-new fabric, and the tree is recomputed from scratch. The
/// recomputation does not journal level records, matching a fresh internal
/// rebuild rather than an operator-requested run.
pub async fn handle_dead_nodes(
    nodes: Vec<Node>,
    config: &Arc<SimConfig>,
    journal: &Arc<Journal>,
) -> Result<Vec<Node>> {
    let (dead, mut survivors): (Vec<Node>, Vec<Node>) =
        nodes.into_iter().partition(|node| !node.is_alive());

    if dead.is_empty() {
        return Ok(survivors);
    }

    for node in &dead {
        info!(node = node.id(), "node ran out of energy");
        journal.record(Record::NodeDown(node.id()));
    }

    rebuild(&mut survivors);
    find_mst(survivors, config, journal, false).await
}

/// Attach every survivor to a fresh fabric, dropping all references to the
/// previous mailboxes, and reset their protocol state.
pub fn rebuild(nodes: &mut Vec<Node>) {
    let (fabric, mut inboxes) = Fabric::create(nodes.iter().map(Node::id));
    for node in nodes.iter_mut() {
        if let Some(inbox) = inboxes.remove(&node.id()) {
            node.clean(fabric.clone(), inbox);
        }
    }
}
