//! Tilegraph CLI.
//!
//! Builds an operator chain over an image file or a synthetic pattern and
//! renders it or reports statistics about it.

use anyhow::{bail, Context as _};
use clap::{Args, Parser, Subcommand};
use indexmap::IndexMap;
use log::info;
use rayon::prelude::*;
use serde_json::Value;
use std::path::PathBuf;
use std::sync::Arc;
use tilegraph::filters::registry::Category;
use tilegraph::prelude::*;

#[derive(Parser, Debug)]
#[command(name = "tilegraph", version, about = "Deferred tiled image processing")]
struct Cli {
    /// Environment configuration file (.toml or .json).
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Log at debug level unless RUST_LOG says otherwise.
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// List the registered operators.
    List,
    /// Describe one operator.
    Info { id: String },
    /// Render an operator chain to an image file.
    Render(RenderArgs),
    /// Print statistics of an operator chain as JSON.
    Stats(StatsArgs),
}

#[derive(Args, Debug)]
struct ChainArgs {
    /// Input image file.
    #[arg(long, conflicts_with = "synthetic", required_unless_present = "synthetic")]
    input: Option<PathBuf>,

    /// Generate a WxH test pattern instead of reading a file.
    #[arg(long)]
    synthetic: Option<String>,

    /// Operator to apply, as `name[:key=value,...]`. Repeatable; applied in order.
    #[arg(long = "op")]
    ops: Vec<String>,
}

#[derive(Args, Debug)]
struct RenderArgs {
    #[command(flatten)]
    chain: ChainArgs,

    /// Output image path; the format follows the extension.
    #[arg(short, long)]
    output: PathBuf,

    /// Compute tiles through an asynchronous request with progress reports.
    #[arg(long = "async")]
    asynchronous: bool,
}

#[derive(Args, Debug)]
struct StatsArgs {
    #[command(flatten)]
    chain: ChainArgs,

    /// Region of interest as x,y,w,h.
    #[arg(long)]
    roi: Option<String>,

    /// Sampling period as px,py (or one value for both).
    #[arg(long)]
    period: Option<String>,

    /// Histogram bins.
    #[arg(long, default_value_t = 256)]
    bins: i64,
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let default_filter = if cli.verbose { "debug" } else { "info" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(default_filter)).init();

    let registry = OperatorRegistry::with_builtins();
    match cli.command {
        Command::List => list_operators(&registry),
        Command::Info { id } => operator_info(&registry, &id)?,
        Command::Render(args) => {
            let env = environment(cli.config.as_ref())?;
            render(&env, &registry, &args)?;
            report(&env);
        }
        Command::Stats(args) => {
            let env = environment(cli.config.as_ref())?;
            stats(&env, &registry, &args)?;
            report(&env);
        }
    }
    Ok(())
}

fn environment(config: Option<&PathBuf>) -> anyhow::Result<Environment> {
    let config = match config {
        Some(path) => EnvironmentConfig::load(path).with_context(|| format!("loading {}", path.display()))?,
        None => EnvironmentConfig::default(),
    };
    Ok(Environment::new(config)?)
}

fn list_operators(registry: &OperatorRegistry) {
    println!("Available operators ({} total):", registry.len());
    for category in [Category::Area, Category::Untiled, Category::Statistics] {
        let ids = registry.operators_by_category(category);
        if ids.is_empty() {
            continue;
        }
        println!();
        println!("  {category}");
        for id in ids {
            if let Some(info) = registry.info(id) {
                println!("    {} - {}", info.id, info.description);
            }
        }
    }
}

fn operator_info(registry: &OperatorRegistry, id: &str) -> anyhow::Result<()> {
    let Some(info) = registry.info(id) else {
        bail!("unknown operator '{id}', use 'list' to see what is available");
    };
    println!("Operator: {} ({})", info.name, info.id);
    println!("Category: {}", info.category);
    println!("{}", info.description);
    if !info.parameters.is_empty() {
        println!();
        println!("Parameters:");
        for (name, description) in &info.parameters {
            println!("  {name}: {description}");
        }
    }
    Ok(())
}

/// A three-band pattern: horizontal ramp, vertical ramp, checkerboard.
fn synthetic_raster(size: &str) -> anyhow::Result<Raster> {
    let (w, h) = size
        .split_once(['x', 'X'])
        .with_context(|| format!("expected WxH, got '{size}'"))?;
    let width: i32 = w.trim().parse().with_context(|| format!("bad width in '{size}'"))?;
    let height: i32 = h.trim().parse().with_context(|| format!("bad height in '{size}'"))?;
    if width <= 0 || height <= 0 {
        bail!("synthetic image must have a positive size, got {width}x{height}");
    }
    let (span_x, span_y) = ((width - 1).max(1), (height - 1).max(1));
    Ok(Raster::from_fn(Rectangle::new(0, 0, width, height), 3, SampleType::U8, |x, y, band| {
        match band {
            0 => (x * 255 / span_x) as f64,
            1 => (y * 255 / span_y) as f64,
            _ => {
                if (x / 16 + y / 16) % 2 == 0 {
                    255.0
                } else {
                    0.0
                }
            }
        }
    }))
}

fn build_chain(env: &Environment, registry: &OperatorRegistry, args: &ChainArgs) -> anyhow::Result<Arc<ImageNode>> {
    let raster = match (&args.input, &args.synthetic) {
        (Some(path), _) => load_raster(path)?,
        (None, Some(size)) => synthetic_raster(size)?,
        (None, None) => bail!("either --input or --synthetic is required"),
    };
    let config = env.config();
    let provider = StaticImage::new(&raster, config.tile_width, config.tile_height)?;
    let mut node = ImageNode::source(env, "input", Arc::new(provider))?;

    for op in &args.ops {
        let (id, params) = match op.split_once(':') {
            Some((id, params)) => (id, OperatorParams::parse(params)?),
            None => (op.as_str(), OperatorParams::new()),
        };
        node = registry
            .create(id, env, &[node], &params)
            .with_context(|| format!("creating operator '{op}'"))?;
        info!("Added '{}' ({} tiles)", id, node.layout().all_tiles().len());
    }
    Ok(node)
}

fn render(env: &Environment, registry: &OperatorRegistry, args: &RenderArgs) -> anyhow::Result<()> {
    let node = build_chain(env, registry, &args.chain)?;
    let tiles = node.layout().all_tiles();

    if args.asynchronous {
        let tracker = ProgressTracker::new(tiles.len()).with_callback(Box::new(|update: ProgressUpdate| match update {
            ProgressUpdate::Progress { percent, estimated_remaining_ms, .. } => {
                info!("{percent:.0}% done, about {}ms left", estimated_remaining_ms.unwrap_or(0));
            }
            ProgressUpdate::TileFailed { tile_x, tile_y, message, .. } => {
                log::error!("Tile ({tile_x}, {tile_y}) failed: {message}");
            }
            ProgressUpdate::Completed { total_duration_ms, tiles_computed, tiles_failed, .. } => {
                info!("Request finished in {total_duration_ms}ms: {tiles_computed} computed, {tiles_failed} failed");
            }
            _ => {}
        }));
        let listener: Arc<dyn TileComputationListener> = Arc::new(tracker);
        let request = env.scheduler().schedule_tiles_async(Arc::clone(&node), &tiles, vec![listener])?;
        request.wait();
    } else {
        // Tiles are independent; each is computed on the rayon thread asking for it.
        let failures: Vec<TileError> = tiles
            .par_iter()
            .filter_map(|&(tile_x, tile_y)| node.get_tile(tile_x, tile_y).err())
            .collect();
        if let Some(first) = failures.first() {
            bail!("{} tile(s) failed, first: {first}", failures.len());
        }
    }

    let output = node.render()?;
    save_raster(&output, &args.output)?;
    info!("Wrote {} to {}", output.rect(), args.output.display());
    Ok(())
}

fn stats(env: &Environment, registry: &OperatorRegistry, args: &StatsArgs) -> anyhow::Result<()> {
    let node = build_chain(env, registry, &args.chain)?;

    let mut params = OperatorParams::new().with("bins", args.bins);
    if let Some(roi) = &args.roi {
        params.insert("roi", roi.as_str());
    }
    if let Some(period) = &args.period {
        let parts: Vec<&str> = period.split(',').map(str::trim).collect();
        let (px, py) = match parts.as_slice() {
            [p] => (*p, *p),
            [px, py] => (*px, *py),
            _ => bail!("expected a period as px,py, got '{period}'"),
        };
        params.insert("period_x", px.parse::<i64>().with_context(|| format!("bad period '{px}'"))?);
        params.insert("period_y", py.parse::<i64>().with_context(|| format!("bad period '{py}'"))?);
    }

    let statistics = registry.create("statistics", env, &[node], &params)?;
    let mut values: IndexMap<String, Value> = IndexMap::new();
    for name in statistics.statistics_names() {
        if let Some(value) = statistics.statistic(&name)? {
            values.insert(name, serde_json::to_value(value)?);
        }
    }
    println!("{}", serde_json::to_string_pretty(&values)?);
    Ok(())
}

fn report(env: &Environment) {
    let cache = env.cache().stats();
    let scheduler = env.scheduler().stats();
    info!(
        "Cache: {} tiles, {} bytes, {:.1}% hits, {} evictions",
        cache.tile_count,
        cache.memory_used,
        cache.hit_ratio() * 100.0,
        cache.evictions
    );
    info!(
        "Scheduler: {} computed, {} from cache, {} coalesced, {} failed",
        scheduler.computed, scheduler.cache_hits, scheduler.coalesced, scheduler.failed
    );
}
