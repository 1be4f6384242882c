//! The round orchestrator.
//!
//! Nodes are only ever driven in lockstep: the orchestrator spawns one worker
//! per node for the current phase, supervises it with the quiescence detector
//! where the phase blocks on mailbox traffic, joins everything back, and only
//! then looks at the side-channel events the workers produced. The event
//! queue is never drained while a phase is in flight.

use std::sync::Arc;

use anyhow::{Context, Result};
use radiomesh_fabric::Fabric;
use radiomesh_journal::{Journal, Record};
use radiomesh_node::{Node, PhaseAction};
use radiomesh_types::{
    Edge,
    Envelope,
    NodeId,
    NodeSpec,
    Position,
    SideEvent,
    SimConfig,
};
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tracing::{debug, info, warn};

use crate::quiescence;

/// Bring a parsed roster to life: one mailbox per node, one shared fabric.
/// The roster is kept sorted by id so runs are reproducible.
pub fn assemble(
    mut specs: Vec<NodeSpec>,
    config: &Arc<SimConfig>,
    journal: &Arc<Journal>,
) -> Vec<Node> {
    specs.sort_unstable_by_key(|spec| spec.id);
    let (fabric, mut inboxes) = Fabric::create(specs.iter().map(|spec| spec.id));
    specs
        .into_iter()
        .filter_map(|spec| {
            inboxes.remove(&spec.id).map(|inbox| {
                Node::new(spec, inbox, fabric.clone(), config.clone(), journal.clone())
            })
        })
        .collect()
}

/// Run the full protocol: neighbor discovery, then level-synchronous
/// cheapest-link and merge rounds until a level adds no links, at which
/// point every living radio-connected node shares one fragment and the
/// union of the local tree views is the minimum spanning tree.
pub async fn find_mst(
    mut nodes: Vec<Node>,
    config: &Arc<SimConfig>,
    journal: &Arc<Journal>,
    log_levels: bool,
) -> Result<Vec<Node>> {
    if nodes.is_empty() {
        return Ok(nodes);
    }

    let (events_tx, mut events_rx) = mpsc::unbounded_channel();

    // Every node announces itself on the side channel, and the orchestrator
    // routes the announcement to everything within radio range. Only after
    // that do nodes start answering each other directly.
    nodes = alert_all(nodes, PhaseAction::Discover, &events_tx, false, config).await?;
    route_discoveries(&nodes, &mut events_rx, config)?;
    nodes = alert_all(nodes, PhaseAction::DiscoverResponse, &events_tx, true, config).await?;

    let mut level = 0;
    loop {
        if log_levels {
            let leaders: Vec<NodeId> =
                nodes.iter().filter(|node| node.is_leader()).map(Node::id).collect();
            journal.record(Record::Leaders(&leaders));
        }

        nodes =
            alert_all(nodes, PhaseAction::ChooseBestLink { level }, &events_tx, true, config)
                .await?;

        let added = drain_added_links(&mut events_rx);
        if added.is_empty() {
            // No fragment found an outgoing link, so there is nothing left
            // to merge: the tree (or forest, when the radio graph is
            // disconnected) is complete.
            info!(level, "no new links, tree complete");
            break;
        }

        if log_levels {
            let mut seen: Vec<Edge> = Vec::new();
            for edge in &added {
                let canonical = edge.canonical();
                if !seen.contains(&canonical) {
                    seen.push(canonical);
                    journal.record(Record::LinkAdded(canonical));
                }
            }
        }

        nodes = alert_all(nodes, PhaseAction::Merge { level }, &events_tx, true, config).await?;

        if log_levels {
            for node in nodes.iter().filter(|node| node.is_elected()) {
                journal.record(Record::Elected(node.id()));
            }
        }

        level += 1;
    }

    Ok(nodes)
}

/// Run one data broadcast from `origin` over the finished tree, then sweep
/// out anyone who ran out of energy and recompute the tree for the
/// survivors. Origins that are dead or were never part of the roster are
/// skipped.
pub async fn run_broadcast(
    nodes: Vec<Node>,
    origin: NodeId,
    config: &Arc<SimConfig>,
    journal: &Arc<Journal>,
) -> Result<Vec<Node>> {
    if !nodes.iter().any(|node| node.id() == origin) {
        warn!(origin, "skipping broadcast from unknown node");
        return Ok(nodes);
    }

    info!(origin, "starting data broadcast");
    let (events_tx, _events_rx) = mpsc::unbounded_channel();
    let nodes =
        alert_all(nodes, PhaseAction::StartBroadcast { origin }, &events_tx, true, config).await?;

    crate::lifecycle::handle_dead_nodes(nodes, config, journal).await
}

/// Union of every node's tree view, deduplicated by unordered pair and
/// sorted.
pub fn mst_edges(nodes: &[Node]) -> Vec<Edge> {
    let mut edges: Vec<Edge> = nodes
        .iter()
        .flat_map(|node| node.mst().iter().map(Edge::canonical))
        .collect();
    edges.sort_unstable();
    edges.dedup();
    edges
}

/// The phase driver: one worker per node, all running `action` in parallel,
/// optionally supervised by the quiescence detector, joined before we return.
/// Workers never abort the phase; a failed one reports and hands its node
/// back like everyone else.
pub(crate) async fn alert_all(
    nodes: Vec<Node>,
    action: PhaseAction,
    events: &UnboundedSender<SideEvent>,
    supervise: bool,
    config: &Arc<SimConfig>,
) -> Result<Vec<Node>> {
    if nodes.is_empty() {
        return Ok(nodes);
    }

    let fabric = nodes[0].fabric().clone();
    if supervise {
        // Until a worker has parked on its mailbox at least once, its node
        // must read as busy, or the detector could call the fabric quiet
        // before slowly scheduled workers have done anything.
        fabric.mark_all_busy();
    }

    debug!(?action, nodes = nodes.len(), "starting phase");
    let mut workers = Vec::with_capacity(nodes.len());
    for mut node in nodes {
        let action = action.clone();
        let events = events.clone();
        workers.push(tokio::spawn(async move {
            if let Err(error) = node.run(action, &events).await {
                warn!(node = node.id(), %error, "phase worker failed");
            }
            node
        }));
    }

    if supervise {
        quiescence::watch(&fabric, config).await;
    }

    let mut nodes = futures::future::join_all(workers)
        .await
        .into_iter()
        .collect::<Result<Vec<Node>, _>>()
        .context("phase worker panicked")?;
    nodes.sort_unstable_by_key(Node::id);
    Ok(nodes)
}

/// Deliver every queued discovery announcement to all nodes within radio
/// range of the announcer.
fn route_discoveries(
    nodes: &[Node],
    events: &mut UnboundedReceiver<SideEvent>,
    config: &SimConfig,
) -> Result<()> {
    let mut announcements: Vec<(NodeId, Position)> = Vec::with_capacity(nodes.len());
    while let Ok(event) = events.try_recv() {
        match event {
            SideEvent::Discover { id, position } => announcements.push((id, position)),
            other => warn!(?other, "unexpected event during discovery routing"),
        }
    }

    let fabric = match nodes.first() {
        Some(node) => node.fabric(),
        None => return Ok(()),
    };

    for (id, position) in announcements {
        for node in nodes {
            if node.id() == id {
                continue;
            }
            if node.position().distance_to(&position) <= config.radio_radius {
                fabric.deliver(node.id(), Envelope::Discover { sender: id, position })?;
            }
        }
    }
    Ok(())
}

fn drain_added_links(events: &mut UnboundedReceiver<SideEvent>) -> Vec<Edge> {
    let mut added = Vec::new();
    while let Ok(event) = events.try_recv() {
        match event {
            SideEvent::LinkAdded(edge) => added.push(edge),
            other => warn!(?other, "unexpected event after link selection"),
        }
    }
    added
}
