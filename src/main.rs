mod cli;

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::Parser;
use indicatif::{ProgressBar, ProgressStyle};
use tokio::fs::File;
use tokio::io::{self, AsyncBufRead, AsyncWrite, BufReader, BufWriter};
use tracing::info;
use tracing_subscriber::EnvFilter;

use dnsprint::config::{self, ProbeConfig, TrainConfig};
use dnsprint::model::{self, ArtifactPaths, Corpus, Granularity};
use dnsprint::network::load_targets;
use dnsprint::output;
use dnsprint::pipeline::ScanPipeline;
use dnsprint::scanner::{self, ProbeExecutor, QueryAxes, Transport, UdpTransport};

use crate::cli::{Cli, Command};

fn init_logging(verbose: bool) {
    let default = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    let probe = ProbeConfig::from(&cli.probe);
    let axes = config::load_axes(cli.axes.as_deref()).context("failed to load query axes")?;
    let artifacts = cli.artifacts.clone().unwrap_or_else(config::default_artifacts_dir);

    match cli.command {
        Command::Fingerprint {
            targets,
            corpus,
            rounds,
            granularity,
        } => fingerprint(&probe, &axes, &artifacts, &targets, &corpus, rounds, granularity).await,
        Command::Train {
            corpus,
            granularity,
            holdout,
            seed,
        } => train(
            &artifacts,
            &corpus,
            granularity,
            &TrainConfig {
                holdout_fraction: holdout,
                seed,
            },
        ),
        Command::Scan {
            granularity,
            input,
            output,
            chunk_size,
        } => scan(&probe, &axes, &artifacts, granularity, input, output, chunk_size).await,
    }
}

async fn fingerprint(
    probe: &ProbeConfig,
    axes: &QueryAxes,
    artifacts: &Path,
    targets_path: &Path,
    corpus_path: &Path,
    rounds: usize,
    granularity: Option<Granularity>,
) -> Result<()> {
    let targets = load_targets(targets_path, probe.port)
        .with_context(|| format!("failed to read targets from {}", targets_path.display()))?;
    if targets.is_empty() {
        bail!("no targets in {}", targets_path.display());
    }

    let cases = match granularity {
        Some(granularity) => {
            let important: HashSet<String> = ArtifactPaths::new(artifacts, Some(granularity))
                .load_important()
                .context("failed to read important test cases")?
                .into_iter()
                .collect();
            scanner::generate_filtered(axes, &important)?
        }
        None => scanner::generate(axes)?,
    };
    info!(
        "fingerprinting {} targets with {} test cases for {} rounds",
        targets.len(),
        cases.len(),
        rounds
    );

    let progress = ProgressBar::new((targets.len() * cases.len() * rounds) as u64);
    progress.set_style(
        ProgressStyle::default_bar()
            .template("{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} probes ({eta})")
            .context("invalid progress template")?
            .progress_chars("█▓░"),
    );

    let transport: Arc<dyn Transport> = Arc::new(UdpTransport::new(probe.workers));
    let executor = ProbeExecutor::new(transport, probe.timeout, probe.workers).with_progress(progress.clone());
    let mut corpus = Corpus::new();
    executor
        .run_rounds(&targets, &cases, rounds, |entries| {
            corpus.absorb(entries);
            corpus.save(corpus_path)
        })
        .await
        .with_context(|| format!("failed to write corpus {}", corpus_path.display()))?;
    progress.finish_and_clear();

    print!(
        "{}",
        output::format_collection_summary(rounds, corpus.labels(), cases.len(), corpus_path)
    );
    Ok(())
}

fn train(artifacts: &Path, corpus_path: &Path, granularity: Granularity, config: &TrainConfig) -> Result<()> {
    let entries = model::read_corpus(corpus_path, granularity)
        .with_context(|| format!("failed to read corpus {}", corpus_path.display()))?;
    info!("read {} entries at {} granularity", entries.len(), granularity);

    let outcome = model::train(entries, Some(granularity), config)?;
    let paths = ArtifactPaths::new(artifacts, Some(granularity));
    paths.save_model(&outcome.model).context("failed to save model")?;
    paths
        .save_important(&outcome.important)
        .context("failed to save important test cases")?;
    paths
        .save_report(&outcome.report.to_string())
        .context("failed to save performance report")?;
    paths
        .save_tree(&outcome.model.render_tree()?)
        .context("failed to save tree dump")?;

    print!(
        "{}",
        output::format_training_summary(&outcome.report, &outcome.groups, &paths)
    );
    Ok(())
}

async fn scan(
    probe: &ProbeConfig,
    axes: &QueryAxes,
    artifacts: &Path,
    granularity: Granularity,
    input: Option<PathBuf>,
    output_path: Option<PathBuf>,
    chunk_size: Option<usize>,
) -> Result<()> {
    let paths = ArtifactPaths::new(artifacts, Some(granularity));
    let model = paths
        .load_model()
        .with_context(|| format!("failed to load {}", paths.model().display()))?;
    let important = paths
        .load_important()
        .with_context(|| format!("failed to load {}", paths.queries().display()))?;

    let mut pipeline = ScanPipeline::new(model, axes, &important, probe)?;
    if let Some(chunk_size) = chunk_size {
        pipeline = pipeline.with_chunk_size(chunk_size);
    }
    info!("scanning with {} test cases", pipeline.test_cases().len());

    let reader: Box<dyn AsyncBufRead + Unpin> = match &input {
        Some(path) => Box::new(BufReader::new(
            File::open(path)
                .await
                .with_context(|| format!("failed to open {}", path.display()))?,
        )),
        None => Box::new(BufReader::new(io::stdin())),
    };
    let writer: Box<dyn AsyncWrite + Unpin> = match &output_path {
        Some(path) => Box::new(BufWriter::new(
            File::create(path)
                .await
                .with_context(|| format!("failed to create {}", path.display()))?,
        )),
        None => Box::new(io::stdout()),
    };

    let summary = pipeline
        .run(reader, writer, |workers| {
            Arc::new(UdpTransport::new(workers)) as Arc<dyn Transport>
        })
        .await?;
    eprint!("{}", output::format_scan_summary(&summary));
    Ok(())
}
