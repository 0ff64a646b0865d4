//! Operational entry point: opens a catalog and its shards, runs recovery,
//! and drives the balancer.

use std::fs;
use std::io::IsTerminal;
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};
use serde_json::json;

use shard_catalog::catalog::CatalogStore;
use shard_catalog::config::CatalogArgs;
use shard_catalog::storage::{DocumentStore, FjallDocumentStore, MemDocumentStore};
use shard_catalog::{KeyValue, Namespace, ShardId, ShardingService};

#[derive(Parser, Debug)]
#[command(name = "shard-catalog")]
#[command(about = "Chunk catalog, migration and balancer runtime", long_about = None)]
struct Args {
    #[command(subcommand)]
    cmd: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Recover interrupted work, then balance in the background until Ctrl-C.
    Run(CatalogArgs),
    /// Print the catalog state JSON.
    State(CatalogArgs),
    /// Finish or roll back interrupted migrations and pending history rewrites.
    Recover(CatalogArgs),
    /// Load a sample collection, split it and balance it across the shards.
    Simulate {
        #[command(flatten)]
        catalog: CatalogArgs,
        /// Namespace of the sample collection.
        #[arg(long, default_value = "sim.docs")]
        ns: String,
        #[arg(long, default_value_t = 1_000)]
        documents: i64,
        /// Number of equal-width chunks the key space is split into.
        #[arg(long, default_value_t = 8)]
        chunks: i64,
        #[arg(long, default_value_t = 32)]
        max_rounds: usize,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Enable ANSI colors only when stdout is a terminal and NO_COLOR is unset.
    let ansi = std::io::stdout().is_terminal() && std::env::var_os("NO_COLOR").is_none();
    tracing_subscriber::fmt()
        .with_ansi(ansi)
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,fjall=warn,lsm_tree=warn".into()),
        )
        .init();

    let args = Args::parse();
    match args.cmd {
        Command::Run(args) => run(args).await,
        Command::State(args) => {
            let service = open_service(&args).await?;
            let state = serde_json::to_string_pretty(&service.catalog().state())
                .context("serialize catalog state")?;
            println!("{state}");
            Ok(())
        }
        Command::Recover(args) => {
            let service = open_service(&args).await?;
            let report = service.recover_migrations().await?;
            println!(
                "{}",
                json!({"finished": report.finished, "aborted": report.aborted})
            );
            Ok(())
        }
        Command::Simulate {
            catalog,
            ns,
            documents,
            chunks,
            max_rounds,
        } => simulate(catalog, &ns, documents, chunks, max_rounds).await,
    }
}

/// Open the catalog and register `args.shards` shards, durable when a data
/// directory is configured.
async fn open_service(args: &CatalogArgs) -> anyhow::Result<ShardingService> {
    let catalog = match &args.data_dir {
        Some(dir) => {
            fs::create_dir_all(dir).context("create data dir")?;
            CatalogStore::load_or_init(dir.join("catalog.json"))?
        }
        None => CatalogStore::in_memory(),
    };
    let service = ShardingService::new(catalog, args.service_config());
    for idx in 0..args.shards {
        let id = ShardId::new(format!("shard{idx}"));
        let store: Arc<dyn DocumentStore> = match &args.data_dir {
            Some(dir) => Arc::new(
                FjallDocumentStore::open(dir.join("shards").join(id.as_str()))
                    .with_context(|| format!("open store for {id}"))?,
            ),
            None => Arc::new(MemDocumentStore::new()),
        };
        service.add_shard(id, store)?;
    }
    let rewrite = service.set_feature_level(args.feature_level).await?;
    if !rewrite.rewritten.is_empty() {
        tracing::info!(rewritten = rewrite.rewritten.len(), "applied feature level history rewrite");
    }
    Ok(service)
}

async fn run(args: CatalogArgs) -> anyhow::Result<()> {
    let service = open_service(&args).await?;
    let report = service.recover_migrations().await?;
    tracing::info!(
        finished = report.finished.len(),
        aborted = report.aborted.len(),
        shards = args.shards,
        "catalog ready"
    );
    service.start_balancer();
    tokio::signal::ctrl_c().await.context("wait for ctrl-c")?;
    service.stop_balancer();
    tracing::info!("shutting down");
    Ok(())
}

async fn simulate(
    args: CatalogArgs,
    ns: &str,
    documents: i64,
    chunks: i64,
    max_rounds: usize,
) -> anyhow::Result<()> {
    let service = open_service(&args).await?;
    service.recover_migrations().await?;
    let ns = Namespace::parse(ns)?;
    let primary = ShardId::new("shard0");
    if service.catalog().collection(&ns).is_err() {
        service.shard_collection(&ns, "x", &primary).await?;
    }
    for x in 0..documents {
        service
            .insert(&ns, json!({"_id": x, "x": x, "payload": format!("doc-{x}")}))
            .await
            .with_context(|| format!("insert document {x}"))?;
    }
    let width = (documents / chunks.max(1)).max(1);
    for boundary in (1..chunks).map(|i| i * width) {
        service.split_chunk(&ns, KeyValue::Int(boundary)).await?;
    }
    let rounds = service.balance_until_converged(max_rounds).await?;
    let counts = service.catalog().read(|state| state.chunk_counts(&ns));
    for (shard, count) in &counts {
        tracing::info!(shard = %shard, chunks = count, "chunk distribution");
    }
    let status = service.balancer_collection_status(&ns)?;
    println!(
        "{}",
        json!({
            "ns": ns.as_str(),
            "rounds": rounds,
            "chunks": counts.iter().map(|(s, c)| (s.as_str().to_string(), *c)).collect::<std::collections::BTreeMap<_, _>>(),
            "status": status,
        })
    );
    Ok(())
}
