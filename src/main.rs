use anyhow::{Context, Result};
use clap::Parser;
use colored::Colorize;
use env_logger::Builder;
use log::{info, LevelFilter};
use rayon::ThreadPoolBuilder;
use std::path::{Path, PathBuf};

use oxyniche::density::{Bandwidth, DensityParams};
use oxyniche::parse::{load_env_stack, parse_group_order, parse_mask_file, parse_occurrence_file};
use oxyniche::pca::RowWeights;
use oxyniche::process::{display_results, run_pipeline, write_results, NicheConfig, PipelineInputs};
use oxyniche::progress::{set_stage, ProcessingStage};
use oxyniche::stats::Alternative;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Occurrence table with group, longitude and latitude columns (.csv, .tsv, optionally .gz)
    #[arg(long = "occurrences")]
    occurrences: PathBuf,

    /// Directory or glob of ESRI ASCII grid bands (one per environmental variable)
    #[arg(long = "env")]
    env: String,

    /// GeoJSON land mask used for domain filtering and background clipping
    #[arg(long = "mask")]
    mask: PathBuf,

    /// Output directory
    #[arg(short, long = "output_dir", default_value = "niche_results")]
    output_dir: PathBuf,

    /// Comma-separated group order (default: order of first appearance)
    #[arg(long = "groups")]
    groups: Option<String>,

    /// Background buffer around each convex hull, in map units
    #[arg(long = "buffer", default_value_t = 1.0)]
    buffer: f64,

    /// Grid resolution in the ordination plane
    #[arg(long = "resolution", default_value_t = 100)]
    resolution: usize,

    /// Randomizations per similarity-test direction
    #[arg(long = "rep", default_value_t = 100)]
    rep: usize,

    #[arg(long = "seed", default_value_t = 42)]
    seed: u64,

    /// Kernel bandwidth rule: href, scott, silverman, or a fixed value
    #[arg(long = "bandwidth", default_value = "href")]
    bandwidth: Bandwidth,

    /// Similarity test side: greater or lower
    #[arg(long = "alternative", default_value = "greater")]
    alternative: Alternative,

    /// Ordination weight of occurrence rows (background rows weigh 1)
    #[arg(long = "occurrence_weight", default_value_t = 0.0)]
    occurrence_weight: f64,

    #[arg(short, long = "threads", default_value_t = num_cpus::get())]
    threads: usize,

    #[arg(short, long = "verbose")]
    verbose: bool,
}

fn main() -> Result<()> {
    let args = Args::parse();
    Builder::new()
        .filter_level(if args.verbose { LevelFilter::Debug } else { LevelFilter::Info })
        .init();

    ThreadPoolBuilder::new()
        .num_threads(args.threads.max(1))
        .build_global()
        .context("failed to configure thread pool")?;

    println!("{}", "Starting niche comparison...".green());

    let config = NicheConfig {
        buffer_size: args.buffer,
        resolution: args.resolution,
        rep: args.rep,
        seed: args.seed,
        weights: RowWeights {
            occurrence: args.occurrence_weight,
            background: 1.0,
        },
        density: DensityParams {
            bandwidth: args.bandwidth,
            ..DensityParams::default()
        },
        alternative: args.alternative,
    };

    let inputs = load_inputs(&args)?;

    let results = run_pipeline(inputs, &config).context("niche comparison failed")?;
    write_results(&results, &args.output_dir)
        .with_context(|| format!("failed to write results to {}", args.output_dir.display()))?;
    display_results(&results);

    if results.diagnostics.is_empty() {
        println!("\n{}", "All pairs computed.".green());
    } else {
        println!(
            "\n{}",
            format!("{} item(s) not computed; see diagnostics.tsv", results.diagnostics.len()).yellow()
        );
    }
    info!("Done. Results in {}", args.output_dir.display());
    Ok(())
}

fn load_inputs(args: &Args) -> Result<PipelineInputs> {
    set_stage(ProcessingStage::Loading);
    let (occurrences, available) = parse_occurrence_file(&args.occurrences)
        .with_context(|| format!("reading occurrences from {}", args.occurrences.display()))?;
    let group_order = match &args.groups {
        Some(list) => parse_group_order(list, &available)?,
        None => available,
    };
    info!("Groups: {}", group_order.join(", "));

    let land_mask = parse_mask_file(Path::new(&args.mask))
        .with_context(|| format!("reading land mask from {}", args.mask.display()))?;
    let env = load_env_stack(&args.env).with_context(|| format!("loading rasters from {}", args.env))?;

    Ok(PipelineInputs {
        occurrences,
        group_order,
        land_mask,
        env,
    })
}
