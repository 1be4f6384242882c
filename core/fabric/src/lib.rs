//! The in-process radio fabric: a map from node identity to mailbox that
//! lets any worker deliver a message to any other by id.
//!
//! The fabric is established before any worker starts and is never mutated
//! while a phase is in flight. Rebuilding the roster after node deaths
//! replaces the whole fabric so that no handle to a dead node's mailbox
//! survives.

mod fabric;
mod mailbox;

pub use fabric::{Fabric, FabricError};
pub use mailbox::{Inbox, Mailbox, Received};
