//! The node agent: an independently scheduled worker with an identity, a
//! position, residual energy, and a mailbox, implementing the per-node side
//! of the synchronous GHS protocol.

mod node;

pub use node::{Node, PhaseAction};
