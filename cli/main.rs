#![deny(unused_variables)]
#![deny(dead_code)]
#![deny(unused_imports)]
#![deny(clippy::no_effect_underscore_binding)]

use clap::{Args, CommandFactory, Parser, Subcommand};
use std::io;
use std::path::PathBuf;
use std::process;

use subtyper::adapters::bridge::{BridgeArtifacts, run_bridge};
use subtyper::adapters::flat::run_allsorts;
use subtyper::adapters::hierarchical::run_tallsorts;
use subtyper::config::RunnerConfig;
use subtyper::convert::parquet_to_counts_csv;
use subtyper::normalize::{normalize, write_json};
use subtyper::runner::{
    ProcessBridgeConnector, ProcessFlatClassifier, ProcessHierarchicalClassifier,
};
use subtyper::types::{AdaptedPrediction, ModelFamily};

#[derive(Args)]
pub struct CommonArgs {
    /// Sample matrix CSV (samples as rows for ALLSorts/TALLSorts, gene/count rows for Bridge)
    #[arg(long)]
    pub input_csv: PathBuf,

    /// Sample id reported in the output
    #[arg(long)]
    pub sample_name: String,

    /// Number of top probabilities to return (values below 1 return one)
    #[arg(long, default_value = "10", allow_negative_numbers = true)]
    pub top_n: i64,

    /// Runner configuration naming the host command for each classifier
    #[arg(long, default_value = "subtyper.toml")]
    pub config: PathBuf,
}

#[derive(Args)]
pub struct AllsortsArgs {
    #[command(flatten)]
    pub common: CommonArgs,

    /// Path to the ALLSorts model artifact document
    #[arg(long)]
    pub model: PathBuf,

    /// ALLSorts model directory
    #[arg(long)]
    pub model_dir: PathBuf,

    /// Include parent/meta-subtypes
    #[arg(long)]
    pub parents: bool,
}

#[derive(Args)]
pub struct TallsortsArgs {
    #[command(flatten)]
    pub common: CommonArgs,

    /// Path to the TALLSorts model
    #[arg(long)]
    pub model: PathBuf,
}

#[derive(Args)]
pub struct BridgeArgs {
    #[command(flatten)]
    pub common: CommonArgs,

    /// Path to a Bridge .bundle
    #[arg(long)]
    pub bundle: Option<PathBuf>,

    /// Path to the metadata file (used when no bundle is given)
    #[arg(long)]
    pub meta: Option<PathBuf>,

    /// Path to the checkpoint (used when no bundle is given)
    #[arg(long)]
    pub ckpt: Option<PathBuf>,

    /// Path to the classifier head (used when no bundle is given)
    #[arg(long)]
    pub lr: Option<PathBuf>,

    /// Bridge device (auto/cpu/cuda/mps)
    #[arg(long, default_value = "cpu")]
    pub device: String,
}

#[derive(Args)]
pub struct ConvertArgs {
    #[arg(long)]
    pub input_parquet: PathBuf,

    #[arg(long)]
    pub output_csv: PathBuf,
}

#[derive(Parser)]
#[command(
    name = "subtyper",
    about = "Unified leukemia subtype prediction across ALLSorts, TALLSorts and Bridge",
    long_about = "Runs one of several independently developed subtype classifiers on an \
                 expression profile and reports the result in a single JSON schema."
)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Predict B-ALL subtypes with ALLSorts
    Allsorts(AllsortsArgs),
    /// Predict T-ALL subtypes with TALLSorts
    Tallsorts(TallsortsArgs),
    /// Predict with the Bridge multi-omic model
    Bridge(BridgeArgs),
    /// Convert a reference RNA parquet matrix to a gene_id-first CSV
    Convert(ConvertArgs),
}

fn emit(adapted: AdaptedPrediction, top_n: i64) -> Result<(), Box<dyn std::error::Error>> {
    let unified = normalize(adapted, top_n);
    write_json(&unified, io::stdout().lock())?;
    Ok(())
}

fn run_allsorts_command(args: AllsortsArgs) -> Result<(), Box<dyn std::error::Error>> {
    let config = RunnerConfig::load(&args.common.config)?;
    let host = config.command_for(ModelFamily::AllSorts)?.clone();
    let classifier = ProcessFlatClassifier::open(host, &args.model, &args.model_dir)?;
    let adapted = run_allsorts(
        classifier,
        &args.common.input_csv,
        &args.common.sample_name,
        args.parents,
    )?;
    emit(adapted, args.common.top_n)
}

fn run_tallsorts_command(args: TallsortsArgs) -> Result<(), Box<dyn std::error::Error>> {
    let config = RunnerConfig::load(&args.common.config)?;
    let host = config.command_for(ModelFamily::TallSorts)?.clone();
    let classifier = ProcessHierarchicalClassifier::new(host, &args.model)?;
    let adapted = run_tallsorts(classifier, &args.common.input_csv, &args.common.sample_name)?;
    emit(adapted, args.common.top_n)
}

fn run_bridge_command(args: BridgeArgs) -> Result<(), Box<dyn std::error::Error>> {
    let artifacts = BridgeArtifacts {
        bundle: args.bundle,
        checkpoint: args.ckpt,
        metadata: args.meta,
        classifier: args.lr,
    };
    // Missing artifacts are reported before the configuration is consulted.
    artifacts.validate()?;

    let config = RunnerConfig::load(&args.common.config)?;
    let connector = ProcessBridgeConnector::new(config.command_for(ModelFamily::Bridge)?.clone());
    let adapted = run_bridge(
        &connector,
        &artifacts,
        &args.device,
        &args.common.input_csv,
        &args.common.sample_name,
    )?;
    emit(adapted, args.common.top_n)
}

fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("warn")).init();

    let cli = Cli::parse();
    let Cli { command } = cli;

    let result = match command {
        Some(Commands::Allsorts(args)) => run_allsorts_command(args),
        Some(Commands::Tallsorts(args)) => run_tallsorts_command(args),
        Some(Commands::Bridge(args)) => run_bridge_command(args),
        Some(Commands::Convert(args)) => {
            if let Err(e) = parquet_to_counts_csv(&args.input_parquet, &args.output_csv) {
                eprintln!("ERROR: {e}");
                process::exit(1);
            }
            Ok(())
        }
        None => {
            if let Err(e) = Cli::command().print_help() {
                eprintln!("Error: {e}");
                process::exit(1);
            }
            println!();
            Ok(())
        }
    };

    if let Err(e) = result {
        eprintln!("Error: {e}");
        process::exit(1);
    }
}
