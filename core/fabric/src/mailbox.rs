use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use radiomesh_types::Envelope;
use tokio::sync::mpsc;

/// Occupancy bookkeeping for one mailbox, shared between its [`Mailbox`]
/// senders and the owning [`Inbox`].
///
/// `depth` counts messages that are enqueued *or still being handled*: a
/// delivery increments it and the [`Received`] guard decrements it only when
/// the handler is done with the message. `parked` is set while the owner is
/// blocked waiting on an empty queue. The quiescence detector calls a mailbox
/// idle only when both say so, which is what keeps it from injecting beacons
/// while a node is mid-handler or has not started its phase yet.
#[derive(Debug, Default)]
pub(crate) struct MailboxState {
    depth: AtomicUsize,
    parked: AtomicBool,
}

impl MailboxState {
    fn is_idle(&self) -> bool {
        self.parked.load(Ordering::Acquire) && self.depth.load(Ordering::Acquire) == 0
    }
}

/// Sending half of a node's mailbox, shared through the fabric.
#[derive(Debug, Clone)]
pub struct Mailbox {
    tx: mpsc::UnboundedSender<Envelope>,
    state: Arc<MailboxState>,
}

impl Mailbox {
    /// Create a mailbox pair.
    pub fn channel() -> (Mailbox, Inbox) {
        let (tx, rx) = mpsc::unbounded_channel();
        let state = Arc::new(MailboxState::default());
        (
            Mailbox { tx, state: state.clone() },
            Inbox { rx, state },
        )
    }

    /// Non-blocking FIFO enqueue. Fails only when the receiving node dropped
    /// its inbox, which cannot happen while the roster is intact.
    pub(crate) fn deliver(&self, envelope: Envelope) -> Result<(), Envelope> {
        self.state.depth.fetch_add(1, Ordering::AcqRel);
        self.tx.send(envelope).map_err(|failed| {
            self.state.depth.fetch_sub(1, Ordering::AcqRel);
            failed.0
        })
    }

    /// Whether the owner has nothing queued, nothing in flight, and is parked
    /// waiting for more.
    pub fn is_idle(&self) -> bool {
        self.state.is_idle()
    }

    /// Clear the parked flag, forcing the detector to treat the owner as busy
    /// until it has actually parked on its queue at least once.
    pub fn mark_busy(&self) {
        self.state.parked.store(false, Ordering::Release);
    }
}

/// Receiving half of a mailbox, owned by the node it belongs to.
#[derive(Debug)]
pub struct Inbox {
    rx: mpsc::UnboundedReceiver<Envelope>,
    state: Arc<MailboxState>,
}

impl Inbox {
    /// Wait for the next message.
    ///
    /// The returned guard keeps the mailbox counted as occupied until it is
    /// dropped, so the quiescence detector never sees a globally empty fabric
    /// while some handler is still running.
    pub async fn recv(&mut self) -> Received {
        self.state.parked.store(true, Ordering::Release);
        let envelope = self.rx.recv().await;
        self.state.parked.store(false, Ordering::Release);
        match envelope {
            Some(envelope) => Received {
                envelope,
                state: Some(self.state.clone()),
            },
            // A closed channel means the fabric itself went away mid-phase;
            // unblock the owner as if it had been beaconed.
            None => Received { envelope: Envelope::Beacon, state: None },
        }
    }
}

/// A dequeued message plus the occupancy guard for it.
#[derive(Debug)]
pub struct Received {
    envelope: Envelope,
    state: Option<Arc<MailboxState>>,
}

impl Received {
    pub fn envelope(&self) -> &Envelope {
        &self.envelope
    }
}

impl Drop for Received {
    fn drop(&mut self) {
        if let Some(state) = &self.state {
            state.depth.fetch_sub(1, Ordering::AcqRel);
        }
    }
}

#[cfg(test)]
mod tests {
    use radiomesh_types::NodeId;

    use super::*;

    fn probe(sender: NodeId) -> Envelope {
        Envelope::Discover {
            sender,
            position: radiomesh_types::Position::new(0.0, 0.0),
        }
    }

    #[tokio::test]
    async fn delivery_is_fifo() {
        let (mailbox, mut inbox) = Mailbox::channel();
        mailbox.deliver(probe(1)).unwrap();
        mailbox.deliver(probe(2)).unwrap();

        assert_eq!(inbox.recv().await.envelope(), &probe(1));
        assert_eq!(inbox.recv().await.envelope(), &probe(2));
    }

    #[tokio::test]
    async fn occupancy_tracks_handling_not_just_queueing() {
        let (mailbox, mut inbox) = Mailbox::channel();
        mailbox.mark_busy();
        assert!(!mailbox.is_idle());

        mailbox.deliver(probe(1)).unwrap();
        let received = inbox.recv().await;
        // Dequeued but still being handled: not idle yet.
        assert!(!mailbox.is_idle());
        drop(received);
        // Handler finished, but the owner has not parked again.
        assert!(!mailbox.is_idle());

        mailbox.deliver(Envelope::Beacon).unwrap();
        let beacon = inbox.recv().await;
        assert_eq!(beacon.envelope(), &Envelope::Beacon);
    }

    #[tokio::test]
    async fn closed_fabric_reads_as_beacon() {
        let (mailbox, mut inbox) = Mailbox::channel();
        drop(mailbox);
        assert_eq!(inbox.recv().await.envelope(), &Envelope::Beacon);
    }
}
