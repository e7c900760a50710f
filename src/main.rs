// SPDX-License-Identifier: MIT

use anyhow::Context;
use clap::{Parser, Subcommand};
use dotenv::dotenv;
use futures::StreamExt;
use serde_json::json;
use storm_rs::core::{AllowAll, DataModel, GraphFixture, MemorySnapshot, PermGate, PermRules, Snapshot};
use storm_rs::storm::opts::GraphOpt;
use storm_rs::storm::{execute, Item, Message, QueryLoader, QueryOptions, Runtime};

use std::sync::Arc;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run a query document against a fixture graph
    Run {
        /// Path to the query document (YAML or JSON)
        #[arg(short, long)]
        query: String,

        /// Path to the data model definition
        #[arg(short, long, env = "STORM_MODEL")]
        model: Option<String>,

        /// Path to the graph fixture to load
        #[arg(short, long, env = "STORM_GRAPH")]
        graph: Option<String>,

        /// Path to the query options
        #[arg(short, long)]
        opts: Option<String>,

        /// Stop after this many results
        #[arg(short, long)]
        limit: Option<usize>,

        /// Path to permission rules, everything is allowed without them
        #[arg(short, long, env = "STORM_PERMS")]
        perms: Option<String>,

        /// Project the results into a subgraph with the default rules
        #[arg(short, long)]
        subgraph: bool,
    },
    /// Compile a query document against a model without running it
    Check {
        #[arg(short, long)]
        query: String,

        #[arg(short, long, env = "STORM_MODEL")]
        model: Option<String>,
    },
}

fn load_model(path: Option<&str>) -> anyhow::Result<Arc<DataModel>> {
    let model = match path {
        Some(path) => DataModel::load(path).with_context(|| format!("loading model {}", path))?,
        None => DataModel::builtin()?,
    };
    Ok(Arc::new(model))
}

fn render(item: &Item) -> serde_json::Value {
    let (node, path) = item;
    let props: serde_json::Map<_, _> = node
        .props()
        .iter()
        .map(|(name, valu)| (name.clone(), valu.to_json()))
        .collect();
    let tags: serde_json::Map<_, _> = node
        .tags()
        .into_iter()
        .map(|(tag, ival)| (tag, storm_rs::core::node::ival_to_value(ival).to_json()))
        .collect();
    let metas: serde_json::Map<_, _> = path
        .metas()
        .iter()
        .map(|(name, valu)| (name.clone(), valu.to_json()))
        .collect();
    json!({
        "iden": node.iden(),
        "form": node.form(),
        "valu": node.valu().to_json(),
        "props": props,
        "tags": tags,
        "path": metas,
    })
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenv().ok();
    env_logger::init();

    let args = Args::parse();

    match args.command {
        Commands::Run {
            query,
            model,
            graph,
            opts,
            limit,
            perms,
            subgraph,
        } => {
            let model = load_model(model.as_deref())?;
            let snap = Arc::new(MemorySnapshot::new(Arc::clone(&model)));
            if let Some(graph) = graph {
                let fixture = GraphFixture::load(&graph).with_context(|| format!("loading graph {}", graph))?;
                snap.load_fixture(&fixture).await?;
            }

            let mut opts = match opts {
                Some(path) => QueryOptions::load(&path).with_context(|| format!("loading options {}", path))?,
                None => QueryOptions::default(),
            };
            if limit.is_some() {
                opts.limit = limit;
            }
            if subgraph && opts.graph.is_none() {
                opts.graph = Some(GraphOpt::Flag(true));
            }

            let perms: Arc<dyn PermGate> = match perms {
                Some(path) => Arc::new(PermRules::load(&path).with_context(|| format!("loading perms {}", path))?),
                None => Arc::new(AllowAll),
            };

            let doc = QueryLoader::new().load(&query)?;
            let ast = QueryLoader::compile(&doc, snap.model())?;
            let snap: Arc<dyn Snapshot> = snap;
            let runt = Runtime::new(snap, perms, Arc::new(ast), opts)?;
            log::info!("Running query {} from {}", runt.iden(), query);

            let mut results = execute(Arc::clone(&runt));
            while let Some(item) = results.next().await {
                let item = item?;
                println!("{}", serde_json::to_string(&render(&item))?);
            }
            for Message::Warn(mesg) in runt.messages() {
                eprintln!("warning: {}", mesg);
            }
        }
        Commands::Check { query, model } => {
            let model = load_model(model.as_deref())?;
            let doc = QueryLoader::new().load(&query)?;
            QueryLoader::compile(&doc, &model)?;
            println!("Query {} is valid", query);
        }
    }

    Ok(())
}
