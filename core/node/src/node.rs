//! Per-node handlers of the synchronous GHS rounds.
//!
//! Every handler here runs inside the node's own worker task and owns the
//! node exclusively for the duration of a phase, so the node can mutate its
//! state freely without locks. All coordination with the rest of the mesh
//! goes through the fabric: messages in via the inbox, messages out via the
//! recipient's mailbox.

use std::sync::Arc;

use anyhow::Result;
use radiomesh_fabric::{Fabric, Inbox};
use radiomesh_journal::{Journal, Record};
use radiomesh_types::{
    CandidateLink,
    Edge,
    Envelope,
    Level,
    NodeId,
    NodeSpec,
    Position,
    SideEvent,
    SimConfig,
    TreePayload,
};
use tokio::sync::mpsc::UnboundedSender;
use tracing::{debug, warn};

/// What a node worker runs during one orchestrated phase.
#[derive(Debug, Clone)]
pub enum PhaseAction {
    /// Announce ourselves on the orchestrator's side channel.
    Discover,
    /// Answer discovery probes and collect the replies into the neighbor
    /// list, until beaconed.
    DiscoverResponse,
    /// One cheapest-link round of the given level.
    ChooseBestLink { level: Level },
    /// One leader-election round of the given level.
    Merge { level: Level },
    /// Push data down the tree, starting from `origin`.
    StartBroadcast { origin: NodeId },
}

/// Outcome of one cheapest-link convergecast.
enum Selection {
    /// Every expected answer arrived.
    Settled(Option<CandidateLink>),
    /// The phase sentinel cut the convergecast short; the candidate as
    /// merged so far is carried along for diagnostics.
    Beaconed(Option<CandidateLink>),
}

/// One simulated wireless node.
pub struct Node {
    id: NodeId,
    position: Position,
    energy: f64,
    leader: bool,
    elected: bool,
    alive: bool,
    neighbors: Vec<(NodeId, Position)>,
    mst: Vec<Edge>,
    inbox: Inbox,
    fabric: Arc<Fabric>,
    config: Arc<SimConfig>,
    journal: Arc<Journal>,
}

impl Node {
    pub fn new(
        spec: NodeSpec,
        inbox: Inbox,
        fabric: Arc<Fabric>,
        config: Arc<SimConfig>,
        journal: Arc<Journal>,
    ) -> Self {
        Self {
            id: spec.id,
            position: spec.position,
            energy: spec.energy,
            leader: true,
            elected: false,
            alive: true,
            neighbors: Vec::new(),
            mst: Vec::new(),
            inbox,
            fabric,
            config,
            journal,
        }
    }

    pub fn id(&self) -> NodeId {
        self.id
    }

    pub fn position(&self) -> Position {
        self.position
    }

    pub fn energy(&self) -> f64 {
        self.energy
    }

    pub fn is_leader(&self) -> bool {
        self.leader
    }

    pub fn is_elected(&self) -> bool {
        self.elected
    }

    pub fn is_alive(&self) -> bool {
        self.alive
    }

    pub fn neighbors(&self) -> &[(NodeId, Position)] {
        &self.neighbors
    }

    pub fn mst(&self) -> &[Edge] {
        &self.mst
    }

    pub fn fabric(&self) -> &Arc<Fabric> {
        &self.fabric
    }

    /// Forget everything learned by previous rounds and attach to a freshly
    /// built fabric. Identity, position, energy, and liveness survive.
    pub fn clean(&mut self, fabric: Arc<Fabric>, inbox: Inbox) {
        self.leader = true;
        self.elected = false;
        self.neighbors.clear();
        self.mst.clear();
        self.fabric = fabric;
        self.inbox = inbox;
    }

    /// Dispatch one phase worker.
    pub async fn run(
        &mut self,
        action: PhaseAction,
        events: &UnboundedSender<SideEvent>,
    ) -> Result<()> {
        match action {
            PhaseAction::Discover => self.discover(events),
            PhaseAction::DiscoverResponse => self.discover_response().await,
            PhaseAction::ChooseBestLink { level } => self.choose_best_link(level, events).await,
            PhaseAction::Merge { level } => self.merge(level).await,
            PhaseAction::StartBroadcast { origin } => self.start_broadcast(origin).await,
        }
    }

    /// Broadcast our existence. The node does not know who is in range, so
    /// the announcement goes to the orchestrator, which routes it.
    fn discover(&mut self, events: &UnboundedSender<SideEvent>) -> Result<()> {
        events
            .send(SideEvent::Discover { id: self.id, position: self.position })
            .map_err(|_| anyhow::anyhow!("event queue closed during discovery"))
    }

    /// Answer probes with our own coordinates and remember everyone who
    /// answered ours.
    async fn discover_response(&mut self) -> Result<()> {
        loop {
            let received = self.inbox.recv().await;
            match received.envelope() {
                Envelope::Beacon => break,
                Envelope::Discover { sender, .. } => {
                    self.fabric.deliver(
                        *sender,
                        Envelope::DiscoverResponse {
                            sender: self.id,
                            position: self.position,
                        },
                    )?;
                },
                Envelope::DiscoverResponse { sender, position } => {
                    self.neighbors.push((*sender, *position));
                },
                other => {
                    warn!(node = self.id, ?other, "unexpected message during discovery, dropping");
                },
            }
        }
        Ok(())
    }

    /// One cheapest-link round. Leaders kick off the search, everyone takes
    /// part in the in-tree convergecast, leaders commit the result.
    async fn choose_best_link(
        &mut self,
        level: Level,
        events: &UnboundedSender<SideEvent>,
    ) -> Result<()> {
        if self.leader {
            self.flood_tree(level, &TreePayload::FindCheapestLink, &[])?;
        }

        let cheapest = match self.receive_cheapest_link(level).await? {
            Selection::Settled(cheapest) => cheapest,
            Selection::Beaconed(abandoned) => {
                // The phase sentinel already arrived; there is no round left
                // to take part in.
                debug!(node = self.id, level, ?abandoned, "abandoning round mid-selection");
                return Ok(());
            },
        };

        if self.leader {
            if let Some(best) = cheapest {
                debug!(node = self.id, level, edge = %best.edge, "committing cheapest link");
                if events.send(SideEvent::LinkAdded(best.edge)).is_err() {
                    warn!(node = self.id, "event queue closed, link will go unlogged");
                }
                self.add_link_to_mst(best.edge, level, None)?;
                self.flood_tree(level, &TreePayload::LinkDecision(best.edge), &[])?;
            }
        }

        self.receive_neighbor(level).await
    }

    /// One merge round: drop the election mark, leaders flood their id, and
    /// everyone applies the proposals until beaconed.
    async fn merge(&mut self, level: Level) -> Result<()> {
        self.elected = false;
        if self.leader {
            self.flood_tree(level, &TreePayload::IdProposal(self.id), &[])?;
        }
        self.receive_neighbor(level).await
    }

    /// Flood data down the finished tree if we are the origin, then forward
    /// whatever arrives until beaconed.
    async fn start_broadcast(&mut self, origin: NodeId) -> Result<()> {
        if self.id == origin {
            self.flood_tree(0, &TreePayload::DataBroadcast, &[])?;
        }
        self.receive_neighbor(0).await
    }

    /// Cheapest link from this node to a neighbor that is not part of the
    /// tree yet, by `(distance, edge)` order. `None` once every neighbor is
    /// connected.
    fn find_cheapest_link(&self) -> Option<CandidateLink> {
        self.neighbors
            .iter()
            .filter(|(id, _)| !self.mst.iter().any(|edge| edge.contains(*id)))
            .map(|(id, position)| {
                CandidateLink::new(
                    self.position.distance_to(position),
                    Edge::new(self.id, *id),
                )
            })
            .min()
    }

    /// Number of tree links rooted at this node. Each of them is a
    /// correspondent that owes us exactly one message during link selection:
    /// the one towards the leader sends the search request, every other one
    /// eventually answers for its subtree.
    fn in_tree_degree(&self) -> usize {
        self.mst.iter().filter(|edge| edge.a == self.id).count()
    }

    /// The convergecast half of the cheapest-link round: merge our local
    /// candidate with every subtree answer, then report upward.
    async fn receive_cheapest_link(&mut self, level: Level) -> Result<Selection> {
        let mut expected = self.in_tree_degree();
        let mut cheapest = self.find_cheapest_link();
        let mut towards_leader = None;

        while expected > 0 {
            let received = self.inbox.recv().await;
            let (payload, sender) = match received.envelope() {
                Envelope::Beacon => {
                    // The detector only fires mid-selection when the round
                    // has already gone wrong; bail out of the whole phase.
                    warn!(node = self.id, level, "beacon before link selection settled");
                    return Ok(Selection::Beaconed(cheapest));
                },
                Envelope::Tree { payload, sender, .. }
                | Envelope::Deferred { payload, sender, .. } => (payload.clone(), *sender),
                other => {
                    warn!(node = self.id, ?other, "unexpected message during link selection");
                    continue;
                },
            };

            match payload {
                TreePayload::FindCheapestLink => {
                    self.flood_tree(level, &TreePayload::FindCheapestLink, &[sender])?;
                    towards_leader = Some(sender);
                    expected -= 1;
                },
                TreePayload::MyCheapestLink(candidate) => {
                    cheapest = match (cheapest, candidate) {
                        (Some(ours), Some(theirs)) => Some(ours.min(theirs)),
                        (ours, theirs) => ours.or(theirs),
                    };
                    expected -= 1;
                },
                payload @ (TreePayload::LinkDecision(_) | TreePayload::MyCurrentMst(_)) => {
                    // Another fragment decided faster than ours; push the
                    // message to the back of the queue so our own selection
                    // completes first.
                    self.fabric
                        .deliver(self.id, Envelope::Deferred { level, payload, sender })?;
                },
                other => {
                    warn!(node = self.id, ?other, "message out of place during link selection");
                },
            }
        }

        if !self.leader {
            match towards_leader {
                Some(parent) => {
                    self.send_tree(parent, level, TreePayload::MyCheapestLink(cheapest))?;
                },
                None => {
                    // A non-leader always has a path to its leader; ending up
                    // here means the search request never arrived.
                    warn!(node = self.id, level, "no route towards leader after selection");
                },
            }
        }

        Ok(Selection::Settled(cheapest))
    }

    /// The general post-decision loop: absorb link decisions and merged tree
    /// views, apply election proposals, forward broadcast data. Runs until
    /// the quiescence detector beacons the phase to an end.
    async fn receive_neighbor(&mut self, level: Level) -> Result<()> {
        loop {
            let received = self.inbox.recv().await;
            let (payload, sender) = match received.envelope() {
                Envelope::Beacon => break,
                Envelope::Tree { payload, sender, .. }
                | Envelope::Deferred { payload, sender, .. } => (payload.clone(), *sender),
                other => {
                    warn!(node = self.id, ?other, "unexpected message, dropping");
                    continue;
                },
            };

            match payload {
                TreePayload::LinkDecision(edge) => {
                    self.add_link_to_mst(edge, level, Some(sender))?;
                    self.flood_tree(level, &TreePayload::LinkDecision(edge), &[sender])?;
                },
                TreePayload::MyCurrentMst(edges) => {
                    for edge in edges {
                        if self.add_link_to_mst(edge, level, Some(sender))? {
                            self.flood_tree(level, &TreePayload::LinkDecision(edge), &[sender])?;
                        }
                    }
                },
                TreePayload::IdProposal(proposed) => {
                    if proposed > self.id {
                        self.leader = false;
                        self.elected = false;
                    } else if self.leader {
                        // Still unbeaten: we stay the fragment's leader.
                        self.elected = true;
                    }
                    self.flood_tree(level, &TreePayload::IdProposal(proposed), &[sender])?;
                },
                TreePayload::DataBroadcast => {
                    self.flood_tree(level, &TreePayload::DataBroadcast, &[sender])?;
                },
                other => {
                    warn!(node = self.id, ?other, "message out of place, dropping");
                },
            }
        }
        Ok(())
    }

    /// Try to absorb `edge` into the local tree view. Returns whether the
    /// edge was new.
    ///
    /// A link between two of our direct neighbors is kept as observed. A link
    /// we are an endpoint of is rewritten so that we come first; if it came
    /// from a peer, we hand that peer our tree as it stood before the link,
    /// so the other side of the merge learns our fragment's interior.
    fn add_link_to_mst(
        &mut self,
        edge: Edge,
        level: Level,
        sender: Option<NodeId>,
    ) -> Result<bool> {
        if self.mst.iter().any(|known| known.same_link(&edge)) {
            return Ok(false);
        }

        if self.is_neighbor(edge.a) && self.is_neighbor(edge.b) && !edge.contains(self.id) {
            self.mst.push(edge);
            return Ok(true);
        }

        let rooted = if edge.a == self.id {
            edge
        } else if edge.b == self.id {
            edge.reversed()
        } else {
            return Ok(false);
        };

        if let Some(sender) = sender {
            self.send_tree(sender, level, TreePayload::MyCurrentMst(self.mst.clone()))?;
        }
        self.mst.push(rooted);
        Ok(true)
    }

    /// Push `payload` over every tree link rooted at this node, skipping the
    /// ids in `except`.
    ///
    /// A link decision whose endpoints are exactly this node and the
    /// recipient is the merging link itself: the two sides swap their full
    /// trees instead, which is how fragments learn each other's interior.
    /// Data broadcasts bill energy per hop; a node that crosses below the
    /// minimum budget after the flood is dead.
    fn flood_tree(
        &mut self,
        level: Level,
        payload: &TreePayload,
        except: &[NodeId],
    ) -> Result<()> {
        let targets: Vec<NodeId> = self
            .mst
            .iter()
            .filter(|edge| edge.a == self.id && !except.contains(&edge.b))
            .map(|edge| edge.b)
            .collect();

        for target in targets {
            if let TreePayload::LinkDecision(edge) = payload {
                if edge.contains(self.id) && edge.contains(target) {
                    self.send_tree(target, level, TreePayload::MyCurrentMst(self.mst.clone()))?;
                    continue;
                }
            }

            if matches!(payload, TreePayload::DataBroadcast) {
                let Some(position) = self.neighbor_position(target) else {
                    warn!(node = self.id, target, "tree link to a stranger, skipping hop");
                    continue;
                };
                self.energy -=
                    self.position.distance_to(&position) * self.config.broadcast_cost_factor;
                self.journal.record(Record::DataTransfer {
                    from: self.id,
                    to: target,
                    energy: self.energy,
                });
            }

            self.send_tree(target, level, payload.clone())?;
        }

        if self.energy < self.config.minimum_budget {
            self.alive = false;
        }
        Ok(())
    }

    fn send_tree(&self, to: NodeId, level: Level, payload: TreePayload) -> Result<()> {
        self.fabric
            .deliver(to, Envelope::Tree { level, payload, sender: self.id })?;
        Ok(())
    }

    fn is_neighbor(&self, id: NodeId) -> bool {
        self.neighbors.iter().any(|(neighbor, _)| *neighbor == id)
    }

    fn neighbor_position(&self, id: NodeId) -> Option<Position> {
        self.neighbors
            .iter()
            .find(|(neighbor, _)| *neighbor == id)
            .map(|(_, position)| *position)
    }
}

#[cfg(test)]
mod tests {
    use radiomesh_fabric::Fabric;

    use super::*;

    fn make_node(id: NodeId, neighbors: &[(NodeId, Position)]) -> Node {
        let (fabric, mut inboxes) = Fabric::create([id]);
        let mut node = Node::new(
            NodeSpec {
                id,
                position: Position::new(0.0, 0.0),
                energy: 100.0,
            },
            inboxes.remove(&id).unwrap(),
            fabric,
            Arc::new(SimConfig::default()),
            Arc::new(Journal::disabled()),
        );
        node.neighbors = neighbors.to_vec();
        node
    }

    #[test]
    fn cheapest_link_prefers_distance_then_edge() {
        let mut node = make_node(
            2,
            &[
                (1, Position::new(5.0, 0.0)),
                (3, Position::new(-5.0, 0.0)),
                (4, Position::new(8.0, 0.0)),
            ],
        );

        // Equidistant neighbors 1 and 3: the smaller edge wins.
        let best = node.find_cheapest_link().unwrap();
        assert_eq!(best.edge, Edge::new(2, 1));
        assert_eq!(best.cost, 5.0);

        // Once a neighbor appears in the tree it stops being a candidate.
        node.mst.push(Edge::new(2, 1));
        let best = node.find_cheapest_link().unwrap();
        assert_eq!(best.edge, Edge::new(2, 3));

        node.mst.push(Edge::new(2, 3));
        node.mst.push(Edge::new(2, 4));
        assert_eq!(node.find_cheapest_link(), None);
    }

    #[test]
    fn add_link_is_idempotent_across_orientations() {
        let mut node = make_node(1, &[(2, Position::new(1.0, 0.0))]);

        assert!(node.add_link_to_mst(Edge::new(1, 2), 0, None).unwrap());
        assert!(!node.add_link_to_mst(Edge::new(1, 2), 0, None).unwrap());
        assert!(!node.add_link_to_mst(Edge::new(2, 1), 0, None).unwrap());
        assert_eq!(node.mst(), &[Edge::new(1, 2)]);
    }

    #[test]
    fn add_link_rewrites_own_endpoint_first() {
        let mut node = make_node(5, &[(9, Position::new(1.0, 0.0))]);

        assert!(node.add_link_to_mst(Edge::new(9, 5), 0, None).unwrap());
        assert_eq!(node.mst(), &[Edge::new(5, 9)]);
    }

    #[test]
    fn add_link_keeps_observed_relay_edges_as_received() {
        let mut node = make_node(
            7,
            &[(2, Position::new(1.0, 0.0)), (3, Position::new(0.0, 1.0))],
        );

        assert!(node.add_link_to_mst(Edge::new(3, 2), 0, None).unwrap());
        assert_eq!(node.mst(), &[Edge::new(3, 2)]);

        // A link between strangers is not ours to keep.
        assert!(!node.add_link_to_mst(Edge::new(8, 9), 0, None).unwrap());
    }

    #[test]
    fn in_tree_degree_counts_rooted_links_only() {
        let mut node = make_node(
            1,
            &[(2, Position::new(1.0, 0.0)), (3, Position::new(0.0, 1.0))],
        );
        node.mst.push(Edge::new(1, 2));
        node.mst.push(Edge::new(1, 3));
        node.mst.push(Edge::new(3, 2));
        assert_eq!(node.in_tree_degree(), 2);
    }

    #[test]
    fn clean_resets_protocol_state_only() {
        let mut node = make_node(4, &[(2, Position::new(1.0, 0.0))]);
        node.leader = false;
        node.elected = true;
        node.mst.push(Edge::new(4, 2));

        let (fabric, mut inboxes) = Fabric::create([4]);
        node.clean(fabric, inboxes.remove(&4).unwrap());

        assert!(node.is_leader());
        assert!(!node.is_elected());
        assert!(node.is_alive());
        assert!(node.neighbors().is_empty());
        assert!(node.mst().is_empty());
        assert_eq!(node.id(), 4);
        assert_eq!(node.energy(), 100.0);
    }
}
