mod input;

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use radiomesh_journal::Journal;
use radiomesh_sim::{assemble, find_mst, handle_dead_nodes, run_broadcast};
use radiomesh_types::SimConfig;
use tracing::info;

/// Simulate the synchronous GHS minimum-spanning-tree protocol over a mesh
/// of radio nodes, then run the scenario's data broadcasts over the tree.
#[derive(Debug, Parser)]
struct Opts {
    /// Scenario file: minimum budget, node placements, broadcasts.
    input: PathBuf,
    /// Where the run journal is appended.
    #[clap(long, default_value = "log.txt")]
    log_file: PathBuf,
    /// Skip writing the journal.
    #[clap(long)]
    no_journal: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_max_level(tracing::Level::INFO)
        .init();

    let opts = Opts::parse();
    let scenario = input::parse_file(&opts.input)
        .with_context(|| format!("cannot load scenario {}", opts.input.display()))?;

    let config = Arc::new(SimConfig {
        minimum_budget: scenario.minimum_budget,
        ..SimConfig::default()
    });
    let journal = Arc::new(if opts.no_journal {
        Journal::disabled()
    } else {
        Journal::open(&opts.log_file)
            .with_context(|| format!("cannot open journal {}", opts.log_file.display()))?
    });

    info!(nodes = scenario.nodes.len(), broadcasts = scenario.broadcasts.len(), "scenario loaded");

    let nodes = assemble(scenario.nodes, &config, &journal);
    let mut nodes = find_mst(nodes, &config, &journal, true).await?;

    // Someone may not have had the energy for tree construction already.
    if !scenario.broadcasts.is_empty() {
        nodes = handle_dead_nodes(nodes, &config, &journal).await?;
    }

    for origin in scenario.broadcasts {
        nodes = run_broadcast(nodes, origin, &config, &journal).await?;
    }

    info!(survivors = nodes.len(), "scenario finished");
    Ok(())
}
