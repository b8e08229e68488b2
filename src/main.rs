//! CLI for building and querying image collections

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use image_retrieval::embedding::{extract_all, scan_images, ByteHistogramEmbedder, Embedder};
use image_retrieval::{
    screen, CollectionManager, EngineConfig, LookupEntry, Metric, Norm, RetrievalPipeline, Vector,
};

/// Used when neither the config file nor `--data-dir` names a directory.
const DEFAULT_DATA_DIR: &str = "retrieval-data";

#[derive(Parser)]
#[command(name = "image-retrieval")]
#[command(about = "Content-based image retrieval over an IVF index", long_about = None)]
struct Cli {
    /// JSON engine configuration. Flags override its values.
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Directory holding the collections.
    #[arg(long, global = true)]
    data_dir: Option<PathBuf>,

    /// Log at debug level (RUST_LOG takes precedence).
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(ValueEnum, Clone, Copy)]
enum MetricArg {
    Ip,
    L2,
}

impl From<MetricArg> for Metric {
    fn from(arg: MetricArg) -> Self {
        match arg {
            MetricArg::Ip => Metric::InnerProduct,
            MetricArg::L2 => Metric::L2,
        }
    }
}

#[derive(ValueEnum, Clone, Copy)]
enum NormArg {
    L1,
    L2,
}

impl From<NormArg> for Norm {
    fn from(arg: NormArg) -> Self {
        match arg {
            NormArg::L1 => Norm::L1,
            NormArg::L2 => Norm::L2,
        }
    }
}

#[derive(Subcommand)]
enum Commands {
    /// Build a collection from a directory of images
    Create {
        name: String,
        images_dir: PathBuf,
        /// Number of clusters (clamped to the usable image count)
        #[arg(long)]
        nlist: Option<usize>,
        #[arg(long, value_enum)]
        metric: Option<MetricArg>,
        #[arg(long, value_enum)]
        norm: Option<NormArg>,
        /// k-means seed
        #[arg(long)]
        seed: Option<u64>,
        /// Drop and rebuild the collection if it already exists
        #[arg(long)]
        replace: bool,
    },
    /// Find the most similar images for each image in a directory
    Query {
        name: String,
        images_dir: PathBuf,
        #[arg(short = 'k', long, default_value = "5")]
        top_k: usize,
        /// Clusters to probe (defaults to the configured fraction of nlist)
        #[arg(long)]
        nprobe: Option<usize>,
    },
    /// Delete a collection and its name records
    Drop { name: String },
    /// List collections
    List,
    /// Show a collection's schema and contents
    Info { name: String },
}

fn init_tracing(verbose: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        if verbose {
            EnvFilter::new("image_retrieval=debug")
        } else {
            EnvFilter::new("image_retrieval=info")
        }
    });
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();
}

fn load_config(cli: &Cli) -> Result<EngineConfig> {
    let mut config = match &cli.config {
        Some(path) => EngineConfig::from_file(path)
            .with_context(|| format!("failed to read config {}", path.display()))?,
        None => EngineConfig::default(),
    };
    if let Some(dir) = &cli.data_dir {
        config.data_dir = Some(dir.clone());
    }
    if config.data_dir.is_none() {
        config.data_dir = Some(PathBuf::from(DEFAULT_DATA_DIR));
    }
    Ok(config)
}

/// Embed every image in `dir`, failing if there is nothing usable.
fn embed_directory(embedder: &dyn Embedder, dir: &Path) -> Result<Vec<(String, Vector)>> {
    let images = scan_images(dir).with_context(|| format!("cannot scan {}", dir.display()))?;
    if images.is_empty() {
        bail!("no .jpg, .jpeg or .png files in {}", dir.display());
    }
    let extracted = extract_all(embedder, &images);
    for (path, error) in &extracted.failures {
        eprintln!("skipped {}: {}", path.display(), error);
    }
    if extracted.items.is_empty() {
        bail!("none of the images in {} could be read", dir.display());
    }
    Ok(extracted.items)
}

#[allow(clippy::too_many_arguments)]
fn create(
    mut config: EngineConfig,
    name: &str,
    images_dir: &Path,
    nlist: Option<usize>,
    metric: Option<MetricArg>,
    norm: Option<NormArg>,
    seed: Option<u64>,
    replace: bool,
) -> Result<()> {
    if seed.is_some() {
        config.seed = seed;
    }
    let embedder = ByteHistogramEmbedder::default();
    let items = embed_directory(&embedder, images_dir)?;

    let mut schema = config.schema(embedder.dimension());
    if let Some(metric) = metric {
        schema = schema.with_metric(metric.into());
    }
    if let Some(norm) = norm {
        schema = schema.with_norm(norm.into());
    }
    let (items, rejected) = screen(&schema, items);
    for failure in &rejected {
        eprintln!("skipped {}: {}", failure.name, failure.error);
    }
    if items.is_empty() {
        bail!("none of the images in {} produced a usable vector", images_dir.display());
    }
    let requested = nlist.unwrap_or(schema.nlist);
    if requested > items.len() {
        warn!(requested, images = items.len(), "nlist exceeds usable image count; clamping");
    }
    schema = schema.with_nlist(requested.min(items.len()));

    let manager = Arc::new(CollectionManager::open(config)?);
    if manager.get(name).is_ok() {
        if !replace {
            bail!("collection '{name}' already exists; pass --replace to rebuild it");
        }
        info!(collection = name, "replacing existing collection");
        manager.drop_collection(name)?;
    }
    manager.create(name, schema)?;

    let pipeline = RetrievalPipeline::new(Arc::clone(&manager));
    let report = pipeline.ingest(name, items)?;
    for failure in &report.failures {
        eprintln!("failed to add {}: {}", failure.name, failure.error);
    }
    if report.inserted.is_empty() {
        bail!("no images were added to '{name}'");
    }

    let stats = pipeline.build_and_load(name)?;
    println!(
        "Created '{}': {} images in {} clusters ({} k-means iterations)",
        name,
        report.inserted.len(),
        stats.nlist,
        stats.iterations
    );
    Ok(())
}

fn query(
    config: EngineConfig,
    name: &str,
    images_dir: &Path,
    top_k: usize,
    nprobe: Option<usize>,
) -> Result<()> {
    let manager = Arc::new(CollectionManager::open(config)?);
    let collection = manager.get(name)?;
    let embedder = ByteHistogramEmbedder::default();
    let dimension = collection.schema().dimension;
    if embedder.dimension() != dimension {
        bail!(
            "collection '{name}' holds {dimension}-dimensional vectors but the embedder produces {}",
            embedder.dimension()
        );
    }
    collection.load()?;

    let items = embed_directory(&embedder, images_dir)?;
    let (names, queries): (Vec<String>, Vec<Vector>) = items.into_iter().unzip();

    let pipeline = RetrievalPipeline::new(Arc::clone(&manager));
    let outcomes = pipeline.query(name, &queries, top_k, nprobe)?;

    let mut failed = 0;
    for outcome in &outcomes {
        println!("{}:", names[outcome.position]);
        match &outcome.result {
            Ok(matches) if matches.is_empty() => println!("  (no matches)"),
            Ok(matches) => {
                for (rank, m) in matches.iter().enumerate() {
                    match &m.entry {
                        LookupEntry::Found(found) => {
                            println!("  {}. {} (score: {:.4})", rank + 1, found, m.score)
                        }
                        LookupEntry::Dangling(id) => {
                            println!("  {}. <unknown id {}> (score: {:.4})", rank + 1, id, m.score)
                        }
                    }
                }
            }
            Err(e) => {
                failed += 1;
                println!("  error: {e}");
            }
        }
    }

    let metrics = pipeline.metrics();
    println!(
        "{} queries, avg {:.0}us, p95 {:.0}us",
        metrics.total_queries(),
        metrics.avg_query_latency_us(),
        metrics.percentile_query_latency_us(95.0)
    );
    if failed == outcomes.len() {
        bail!("every query failed");
    }
    Ok(())
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);
    let config = load_config(&cli)?;

    match cli.command {
        Commands::Create {
            name,
            images_dir,
            nlist,
            metric,
            norm,
            seed,
            replace,
        } => create(config, &name, &images_dir, nlist, metric, norm, seed, replace),
        Commands::Query {
            name,
            images_dir,
            top_k,
            nprobe,
        } => query(config, &name, &images_dir, top_k, nprobe),
        Commands::Drop { name } => {
            let manager = CollectionManager::open(config)?;
            manager.drop_collection(&name)?;
            println!("Dropped collection '{name}'");
            Ok(())
        }
        Commands::List => {
            let manager = CollectionManager::open(config)?;
            let names = manager.list();
            if names.is_empty() {
                println!("No collections");
            }
            for name in names {
                let info = manager.get(&name)?.info();
                println!(
                    "  - {} ({} vectors, {}, {} clusters)",
                    info.name,
                    info.live_count,
                    info.schema.metric,
                    info.cluster_sizes.len()
                );
            }
            Ok(())
        }
        Commands::Info { name } => {
            let manager = CollectionManager::open(config)?;
            let info = manager.get(&name)?.info();
            println!("{}", serde_json::to_string_pretty(&info)?);
            Ok(())
        }
    }
}
