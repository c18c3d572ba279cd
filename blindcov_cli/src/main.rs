use blindcov_core::config::{FileConfigSource, TargetDescriptor};
use blindcov_core::coverage::{Arch, BinInstOracle};
use blindcov_core::fuzzer::{BlindCoverageFuzzer, FuzzerOptions, worker_pool_size};
use blindcov_core::persist::ArtifactWriter;
use blindcov_core::CancelToken;

use anyhow::Context;
use clap::Parser;
use env_logger::{Env, TimestampPrecision};
use std::path::PathBuf;
use std::time::Instant;

/// Blind coverage fuzzer: maximizes the basic blocks a binary covers for one
/// input file, keeping any crash found on the way.
#[derive(Parser, Debug)]
#[clap(author, version, about, long_about = None)]
struct Cli {
    /// Target architecture of the instrumented binary, 32 or 64.
    #[clap(value_parser = parse_arch)]
    arch: Arch,
    /// TOML configuration file.
    config: PathBuf,
    /// Target section within the configuration file.
    section: String,
    /// Seed input to maximize.
    input: PathBuf,
    /// Directory for crashes, snapshots and the maximized file.
    output_dir: PathBuf,
    /// Stop after this many iterations; runs until interrupted when omitted.
    max_iterations: Option<u64>,
}

fn parse_arch(value: &str) -> Result<Arch, String> {
    value
        .parse::<u32>()
        .ok()
        .and_then(Arch::from_bits)
        .ok_or_else(|| format!("unsupported architecture {value:?}, expected 32 or 64"))
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let log_env = Env::new()
        .filter_or("BCF_LOG", "info")
        .default_write_style_or("auto");
    env_logger::Builder::from_env(log_env)
        .format_timestamp(Some(TimestampPrecision::Seconds))
        .init();

    let descriptor = TargetDescriptor::load_from_file(&cli.config, &cli.section)
        .with_context(|| format!("loading section [{}] of {}", cli.section, cli.config.display()))?;
    log::info!(
        "Using {} at {} ({}-bit)",
        descriptor.tool.kind.name(),
        descriptor.tool.path.display(),
        cli.arch.bits()
    );

    let cancel = CancelToken::new();
    let handler_token = cancel.clone();
    ctrlc::set_handler(move || {
        log::warn!("Interrupted, stopping after the current run");
        handler_token.cancel();
    })
    .context("installing the interrupt handler")?;

    let oracle = BinInstOracle::new(descriptor.tool.clone(), cli.arch, cancel.clone());
    let options = FuzzerOptions {
        seed_path: cli.input.clone(),
        out_dir: cli.output_dir.clone(),
        pool_size: Some(worker_pool_size()),
    };
    let mut fuzzer = BlindCoverageFuzzer::new(
        oracle,
        Box::new(FileConfigSource::new(&cli.config, &cli.section)),
        options,
        cancel,
    )?;

    let start_time = Instant::now();
    let outcome = fuzzer.run(cli.max_iterations.unwrap_or(0))?;
    if outcome.cancelled {
        println!("Aborted.");
        return Ok(());
    }

    log::info!(
        "Finished {} iteration(s) in {:.2?}, {} bug(s) found",
        outcome.iterations,
        start_time.elapsed(),
        outcome.bugs
    );
    if outcome.maximized() {
        let path = ArtifactWriter::new(&cli.output_dir).write_max(&outcome.template)?;
        log::info!(
            "File successfully maximized from min {}, max {} to min {}, max {}",
            outcome.original_stats.min,
            outcome.original_stats.max,
            outcome.stats.min,
            outcome.stats.max
        );
        log::info!("File {} written to disk", path.display());
    } else {
        log::info!("Failed to maximize input file");
    }
    Ok(())
}
