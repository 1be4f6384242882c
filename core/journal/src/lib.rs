//! Append-only text journal of simulation events.
//!
//! One record per line, in the shape downstream tooling greps for:
//!
//! ```text
//! bs 1,2,3
//! added 1-2
//! elected 3
//! node down 2
//! data from 1 to 2, energy:96.4
//! ```
//!
//! Writes from concurrently running node workers are serialized through the
//! journal; a failed write is reported and dropped rather than propagated
//! into the protocol.

use std::fmt;
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::Path;
use std::sync::Mutex;

use radiomesh_types::{Edge, NodeId};
use tracing::warn;

/// A single journal line.
#[derive(Debug, Clone, PartialEq)]
pub enum Record<'a> {
    /// Ids of the fragment leaders alive at the start of a level.
    Leaders(&'a [NodeId]),
    /// A link committed to the tree, written smaller endpoint first.
    LinkAdded(Edge),
    /// A node that won its fragment's election this round.
    Elected(NodeId),
    /// A node that ran out of energy.
    NodeDown(NodeId),
    /// One broadcast hop, with the sender's energy after paying for it.
    DataTransfer { from: NodeId, to: NodeId, energy: f64 },
}

impl fmt::Display for Record<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Record::Leaders(ids) => {
                write!(f, "bs ")?;
                for (i, id) in ids.iter().enumerate() {
                    if i > 0 {
                        write!(f, ",")?;
                    }
                    write!(f, "{id}")?;
                }
                Ok(())
            },
            Record::LinkAdded(edge) => write!(f, "added {}", edge.canonical()),
            Record::Elected(id) => write!(f, "elected {id}"),
            Record::NodeDown(id) => write!(f, "node down {id}"),
            Record::DataTransfer { from, to, energy } => {
                write!(f, "data from {from} to {to}, energy:{energy}")
            },
        }
    }
}

/// Sink for [`Record`]s. Opened once and shared by the orchestrator and all
/// node workers for the whole run.
pub struct Journal {
    sink: Option<Mutex<File>>,
}

impl Journal {
    /// Open (or create) the journal file in append mode.
    pub fn open(path: &Path) -> std::io::Result<Self> {
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        Ok(Self {
            sink: Some(Mutex::new(file)),
        })
    }

    /// A journal that drops every record.
    pub fn disabled() -> Self {
        Self { sink: None }
    }

    /// Append one record. Failures are reported and swallowed so a full disk
    /// cannot take the protocol down with it.
    pub fn record(&self, record: Record<'_>) {
        let Some(sink) = &self.sink else { return };
        let mut file = match sink.lock() {
            Ok(file) => file,
            Err(poisoned) => poisoned.into_inner(),
        };
        if let Err(error) = writeln!(file, "{record}") {
            warn!(%error, "failed to append journal record");
        }
    }
}

#[cfg(test)]
mod tests {
    use tempdir::TempDir;

    use super::*;

    #[test]
    fn record_formats() {
        assert_eq!(Record::Leaders(&[1, 2, 3]).to_string(), "bs 1,2,3");
        assert_eq!(Record::Leaders(&[]).to_string(), "bs ");
        assert_eq!(Record::LinkAdded(Edge::new(7, 2)).to_string(), "added 2-7");
        assert_eq!(Record::Elected(5).to_string(), "elected 5");
        assert_eq!(Record::NodeDown(9).to_string(), "node down 9");
        assert_eq!(
            Record::DataTransfer { from: 1, to: 2, energy: 96.4 }.to_string(),
            "data from 1 to 2, energy:96.4"
        );
    }

    #[test]
    fn appends_one_line_per_record() {
        let dir = TempDir::new("journal").unwrap();
        let path = dir.path().join("log.txt");

        let journal = Journal::open(&path).unwrap();
        journal.record(Record::LinkAdded(Edge::new(2, 1)));
        journal.record(Record::NodeDown(4));
        drop(journal);

        // Re-opening appends instead of truncating.
        let journal = Journal::open(&path).unwrap();
        journal.record(Record::Elected(4));
        drop(journal);

        let contents = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<&str> = contents.lines().collect();
        assert_eq!(lines, vec!["added 1-2", "node down 4", "elected 4"]);
    }

    #[test]
    fn disabled_journal_drops_records() {
        let journal = Journal::disabled();
        journal.record(Record::Elected(1));
    }
}
