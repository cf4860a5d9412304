//! fishdb-admin: maintenance commands for FishDB stores.
//!
//! Usage:
//!   fishdb-admin schema --path ./store
//!   fishdb-admin load --path ./store --nodes 10000 --batch 500
//!   fishdb-admin cluster-demo --members 3 --nodes 200

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing::info;
use tracing_subscriber::EnvFilter;

use fishdb::graph::ops::nodes_collection;
use fishdb::{
    Cluster, ClusterConfig, DiskStorage, Edge, EdgeEnd, GraphConfig, GraphManager, MemoryStorage, Node,
    RollingTrans, Trans,
};

#[derive(Parser, Debug)]
#[command(author, version, about = "FishDB administration tool")]
struct Args {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Print partitions, kinds, attributes and counts of a disk store
    Schema {
        #[arg(long)]
        path: PathBuf,
    },
    /// Bulk load a chain of generated nodes into a disk store
    Load {
        #[arg(long)]
        path: PathBuf,
        #[arg(long, default_value_t = 1000)]
        nodes: usize,
        /// Operations per rolling-transaction batch
        #[arg(long, default_value_t = 500)]
        batch: i64,
        /// Optional graph config (JSON)
        #[arg(long)]
        config: Option<PathBuf>,
    },
    /// Build an in-memory cluster, load nodes and print the entry layout
    ClusterDemo {
        #[arg(long, default_value_t = 3)]
        members: usize,
        #[arg(long, default_value_t = 100)]
        nodes: usize,
        /// Optional cluster config (JSON)
        #[arg(long)]
        config: Option<PathBuf>,
    },
}

fn main() -> Result<()> {
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    match args.command {
        Command::Schema { path } => schema(path),
        Command::Load {
            path,
            nodes,
            batch,
            config,
        } => load(path, nodes, batch, config),
        Command::ClusterDemo {
            members,
            nodes,
            config,
        } => cluster_demo(members, nodes, config),
    }
}

fn schema(path: PathBuf) -> Result<()> {
    let storage = DiskStorage::open(&path).with_context(|| format!("open store {}", path.display()))?;
    let gm = GraphManager::open(Box::new(storage))?;

    println!("{} (version {})", gm.name(), gm.version()?);
    println!("partitions: {}", gm.partitions()?.join(", "));
    println!("rules: {}", gm.graph_rules()?.join(", "));
    for kind in gm.node_kinds()? {
        println!("node {} ({} stored)", kind, gm.node_count(&kind)?);
        println!("  attrs: {}", gm.node_attrs(&kind)?.join(", "));
        for spec in gm.node_edges(&kind)? {
            println!("  edge {}", spec);
        }
    }
    for kind in gm.edge_kinds()? {
        println!("edge {} ({} stored)", kind, gm.edge_count(&kind)?);
        println!("  attrs: {}", gm.edge_attrs(&kind)?.join(", "));
    }
    Ok(())
}

fn load(path: PathBuf, nodes: usize, batch: i64, config: Option<PathBuf>) -> Result<()> {
    let config = match config {
        Some(p) => GraphConfig::read_from(&p)?.with_context(|| format!("config {} not found", p.display()))?,
        None => GraphConfig::default(),
    };
    let storage = DiskStorage::open_or_create(&path)?;
    let gm = GraphManager::open_with_config(Box::new(storage), config)?;

    let start = Instant::now();
    let mut trans = RollingTrans::with_concurrent(Arc::clone(&gm), batch)?;
    for i in 0..nodes {
        trans.store_node("main", Node::new(format!("n{}", i), "Item").with_attr("name", format!("item {}", i)))?;
        if i > 0 {
            let edge = Edge::new(
                format!("e{}", i),
                "Next",
                EdgeEnd::new(format!("n{}", i - 1), "Item", "prev"),
                EdgeEnd::new(format!("n{}", i), "Item", "next"),
            );
            trans.store_edge("main", edge)?;
        }
    }
    trans.commit()?;

    info!(
        nodes,
        batches = trans.batches_committed(),
        elapsed_ms = start.elapsed().as_millis() as u64,
        "Load finished"
    );
    println!("stored {} Item nodes in {} batches", gm.node_count("Item")?, trans.batches_committed());
    Ok(())
}

fn cluster_demo(members: usize, nodes: usize, config: Option<PathBuf>) -> Result<()> {
    let config = match config {
        Some(p) => ClusterConfig::read_from(&p)?.with_context(|| format!("config {} not found", p.display()))?,
        None => ClusterConfig::default(),
    };
    let cluster = Cluster::new(config);

    let first = cluster.join("member1", Box::new(MemoryStorage::new("member1")))?;
    let gm = GraphManager::open(Box::new(first))?;

    let mut trans = RollingTrans::with_concurrent(Arc::clone(&gm), 50)?;
    for i in 0..nodes {
        trans.store_node("main", Node::new(format!("n{}", i), "Item"))?;
    }
    trans.commit()?;

    for i in 2..=members.max(1) {
        let name = format!("member{}", i);
        cluster.join(&name, Box::new(MemoryStorage::new(name.as_str())))?;
    }

    for report in cluster.wait_for_transfer()? {
        println!("{}: moved {} skipped {}", report.member, report.moved, report.skipped);
    }
    print!("{}", cluster.dump_layout(&nodes_collection("main", "Item"))?);
    println!("Item nodes visible: {}", gm.node_keys("main", "Item")?.len());
    Ok(())
}
