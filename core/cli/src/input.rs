//! Plain-text scenario parser.
//!
//! The format is whitespace-separated tokens, one record per line:
//!
//! ```text
//! 5.0
//! node 1, 0, 0 100
//! node 2, 5, 0 100
//! bcst from 1
//! ```
//!
//! The first line is the minimum energy budget. `node` records carry an id
//! and coordinates whose tokens end in a decorative comma, then the starting
//! energy. `bcst` records name a broadcast originator in their third token.

use std::path::Path;

use radiomesh_types::{NodeId, NodeSpec, Position};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ParseError {
    #[error("failed to read scenario file: {0}")]
    Io(#[from] std::io::Error),
    #[error("scenario file is empty, expected a minimum budget on line 1")]
    MissingBudget,
    #[error("line {line}: {reason}")]
    BadRecord { line: usize, reason: String },
    #[error("line {line}: node {id} declared twice")]
    DuplicateNode { line: usize, id: NodeId },
}

/// Everything a scenario file describes.
#[derive(Debug, Clone, PartialEq)]
pub struct Scenario {
    pub minimum_budget: f64,
    pub nodes: Vec<NodeSpec>,
    pub broadcasts: Vec<NodeId>,
}

pub fn parse_file(path: &Path) -> Result<Scenario, ParseError> {
    parse_str(&std::fs::read_to_string(path)?)
}

pub fn parse_str(contents: &str) -> Result<Scenario, ParseError> {
    let mut lines = contents.lines().enumerate();

    let minimum_budget = loop {
        let Some((index, line)) = lines.next() else {
            return Err(ParseError::MissingBudget);
        };
        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }
        break trimmed.parse::<f64>().map_err(|_| ParseError::BadRecord {
            line: index + 1,
            reason: format!("expected the minimum budget, got {trimmed:?}"),
        })?;
    };

    let mut nodes: Vec<NodeSpec> = Vec::new();
    let mut broadcasts = Vec::new();

    for (index, raw) in lines {
        let line = index + 1;
        let tokens: Vec<&str> = raw.split_whitespace().collect();
        match tokens.as_slice() {
            [] => continue,
            ["node", id, x, y, energy] => {
                let id = number::<NodeId>(id, line, "node id")?;
                let x = number::<f64>(x, line, "x coordinate")?;
                let y = number::<f64>(y, line, "y coordinate")?;
                let energy = number::<f64>(energy, line, "energy")?;
                if nodes.iter().any(|node| node.id == id) {
                    return Err(ParseError::DuplicateNode { line, id });
                }
                nodes.push(NodeSpec {
                    id,
                    position: Position::new(x, y),
                    energy,
                });
            },
            ["bcst", _, id] => {
                broadcasts.push(number::<NodeId>(id, line, "broadcast origin")?);
            },
            [kind @ ("node" | "bcst"), ..] => {
                return Err(ParseError::BadRecord {
                    line,
                    reason: format!("malformed {kind} record"),
                });
            },
            [kind, ..] => {
                return Err(ParseError::BadRecord {
                    line,
                    reason: format!("unknown record {kind:?}"),
                });
            },
        }
    }

    Ok(Scenario { minimum_budget, nodes, broadcasts })
}

/// Parse a token, tolerating the decorative trailing comma the node records
/// carry on their id and coordinate fields.
fn number<T: std::str::FromStr>(
    token: &str,
    line: usize,
    what: &str,
) -> Result<T, ParseError> {
    token
        .trim_end_matches(',')
        .parse::<T>()
        .map_err(|_| ParseError::BadRecord {
            line,
            reason: format!("expected {what}, got {token:?}"),
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_the_reference_shape() {
        let scenario = parse_str(
            "5.0\n\
             node 1, 0, 0, 100\n\
             node 2, 5.5, -1, 42.5\n\
             bcst from 1\n\
             bcst from 2\n",
        )
        .unwrap();

        assert_eq!(scenario.minimum_budget, 5.0);
        assert_eq!(
            scenario.nodes,
            vec![
                NodeSpec { id: 1, position: Position::new(0.0, 0.0), energy: 100.0 },
                NodeSpec { id: 2, position: Position::new(5.5, -1.0), energy: 42.5 },
            ]
        );
        assert_eq!(scenario.broadcasts, vec![1, 2]);
    }

    #[test]
    fn skips_blank_lines() {
        let scenario = parse_str("\n0.5\n\nnode 3, 1, 2 9\n\n").unwrap();
        assert_eq!(scenario.minimum_budget, 0.5);
        assert_eq!(scenario.nodes.len(), 1);
        assert!(scenario.broadcasts.is_empty());
    }

    #[test]
    fn rejects_garbage() {
        assert!(matches!(parse_str(""), Err(ParseError::MissingBudget)));
        assert!(matches!(
            parse_str("oops"),
            Err(ParseError::BadRecord { line: 1, .. })
        ));
        assert!(matches!(
            parse_str("1.0\nnode x, 0, 0 1"),
            Err(ParseError::BadRecord { line: 2, .. })
        ));
        assert!(matches!(
            parse_str("1.0\nwobble 1 2 3"),
            Err(ParseError::BadRecord { line: 2, .. })
        ));
        assert!(matches!(
            parse_str("1.0\nnode 1, 0, 0 1\nnode 1, 2, 2 1"),
            Err(ParseError::DuplicateNode { line: 3, id: 1 })
        ));
    }
}
