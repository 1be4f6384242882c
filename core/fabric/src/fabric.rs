use std::collections::HashMap;
use std::sync::Arc;

use radiomesh_types::{Envelope, NodeId};
use thiserror::Error;

use crate::mailbox::{Inbox, Mailbox};

#[derive(Debug, Error)]
pub enum FabricError {
    #[error("no mailbox registered for node {0}")]
    UnknownNode(NodeId),
    #[error("mailbox of node {0} is closed")]
    Closed(NodeId),
}

/// The id → mailbox map shared by every worker of one roster.
#[derive(Debug)]
pub struct Fabric {
    mailboxes: HashMap<NodeId, Mailbox>,
}

impl Fabric {
    /// Create one mailbox per id. Returns the shared fabric together with
    /// each node's receiving half, keyed by id.
    pub fn create(ids: impl IntoIterator<Item = NodeId>) -> (Arc<Fabric>, HashMap<NodeId, Inbox>) {
        let mut mailboxes = HashMap::new();
        let mut inboxes = HashMap::new();
        for id in ids {
            let (mailbox, inbox) = Mailbox::channel();
            mailboxes.insert(id, mailbox);
            inboxes.insert(id, inbox);
        }
        (Arc::new(Fabric { mailboxes }), inboxes)
    }

    /// Deliver a message into the mailbox of `to`.
    pub fn deliver(&self, to: NodeId, envelope: Envelope) -> Result<(), FabricError> {
        self.mailboxes
            .get(&to)
            .ok_or(FabricError::UnknownNode(to))?
            .deliver(envelope)
            .map_err(|_| FabricError::Closed(to))
    }

    /// Inject the phase-termination sentinel into every mailbox.
    pub fn broadcast_beacon(&self) {
        for mailbox in self.mailboxes.values() {
            // A mailbox can only be closed if its node is being torn down;
            // it no longer needs the sentinel then.
            let _ = mailbox.deliver(Envelope::Beacon);
        }
    }

    /// Whether every mailbox is drained, handled, and parked on.
    pub fn is_quiet(&self) -> bool {
        self.mailboxes.values().all(Mailbox::is_idle)
    }

    /// Force every mailbox to read as busy until its owner parks again. Done
    /// right before a phase spawns its workers, so the detector cannot start
    /// its countdown ahead of a slowly scheduled worker.
    pub fn mark_all_busy(&self) {
        for mailbox in self.mailboxes.values() {
            mailbox.mark_busy();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn routes_by_id_and_rejects_strangers() {
        let (fabric, mut inboxes) = Fabric::create([1, 2]);

        fabric.deliver(2, Envelope::Beacon).unwrap();
        let mut inbox = inboxes.remove(&2).unwrap();
        assert_eq!(inbox.recv().await.envelope(), &Envelope::Beacon);

        assert!(matches!(
            fabric.deliver(9, Envelope::Beacon),
            Err(FabricError::UnknownNode(9))
        ));
    }

    #[tokio::test]
    async fn beacon_broadcast_reaches_everyone() {
        let (fabric, mut inboxes) = Fabric::create([1, 2, 3]);
        fabric.broadcast_beacon();
        for id in [1, 2, 3] {
            let inbox = inboxes.get_mut(&id).unwrap();
            assert_eq!(inbox.recv().await.envelope(), &Envelope::Beacon);
        }
    }

    #[tokio::test]
    async fn quiet_only_when_drained_and_parked() {
        let (fabric, mut inboxes) = Fabric::create([1]);
        fabric.mark_all_busy();
        assert!(!fabric.is_quiet());

        fabric.deliver(1, Envelope::Beacon).unwrap();
        let inbox = inboxes.get_mut(&1).unwrap();
        {
            let received = inbox.recv().await;
            assert_eq!(received.envelope(), &Envelope::Beacon);
            assert!(!fabric.is_quiet());
        }
        // Guard dropped, but the owner is not parked on the queue.
        assert!(!fabric.is_quiet());
    }
}
