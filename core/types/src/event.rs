use crate::{Edge, NodeId, Position};

/// Out-of-band record a node pushes onto the orchestrator's event queue.
///
/// Nodes cannot reach each other before discovery (they do not know who is in
/// radio range), and the orchestrator wants to know when a level stopped
/// producing links; both travel on this side channel instead of the fabric.
#[derive(Debug, Clone, PartialEq)]
pub enum SideEvent {
    /// A node announced itself; the orchestrator routes the probe to
    /// everything within radio range of `position`.
    Discover { id: NodeId, position: Position },
    /// A fragment leader committed a new tree link this level.
    LinkAdded(Edge),
}
