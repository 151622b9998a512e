use magpie_core::checkpoint::Checkpoint;
use magpie_core::config::MagpieConfig;
use magpie_core::fetch::{HttpFetchClient, RetryPolicy};
use magpie_core::harness::{SancovHarness, SancovHarnessConfig};
use magpie_core::index::{CsvIndexSource, IndexCursor, IndexSource};
use magpie_core::session::{Session, SessionConfig};
use magpie_core::store::CorpusStore;
use magpie_core::universe::CoverageUniverse;
use magpie_core::CancelToken;

use clap::Parser;
use std::path::PathBuf;
use std::time::Duration;
use tracing::info;

#[derive(Parser, Debug)]
#[clap(author, version, about, long_about = None)]
struct Cli {
    #[clap(short, long, value_parser)]
    config_file: Option<PathBuf>,
    /// Override the index CSV path from the config.
    #[clap(long)]
    index_csv: Option<PathBuf>,
    /// Override the number of worker threads.
    #[clap(short, long)]
    threads: Option<usize>,
    /// Override the corpus output directory.
    #[clap(long)]
    output_dir: Option<PathBuf>,
    /// Resume from this checkpoint file.
    #[clap(long)]
    resume: Option<PathBuf>,
    /// Validate configuration and print the plan without running anything.
    #[clap(long)]
    dry_run: bool,
    #[clap(short, long)]
    verbose: bool,
}

fn main() -> Result<(), anyhow::Error> {
    let cli = Cli::parse();

    let default_level = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_level)),
        )
        .init();

    let mut config = match cli.config_file {
        Some(config_path) => {
            info!("loading configuration from {config_path:?}");
            MagpieConfig::load_from_file(&config_path)?
        }
        None => {
            let default_config_path = PathBuf::from("config.toml");
            if !default_config_path.exists() {
                anyhow::bail!(
                    "no config file specified and default 'config.toml' not found; \
                     pass one with --config-file"
                );
            }
            info!("loading default configuration {default_config_path:?}");
            MagpieConfig::load_from_file(&default_config_path)?
        }
    };

    if let Some(index_csv) = cli.index_csv {
        config.index.csv_path = index_csv;
    }
    if let Some(threads) = cli.threads {
        config.run.threads = threads;
    }
    if let Some(output_dir) = cli.output_dir {
        config.corpus.output_dir = output_dir;
    }
    let resume_path = cli.resume.or(config.checkpoint.resume.clone());

    if config.run.threads == 0 {
        anyhow::bail!("run.threads must be at least 1");
    }
    if config.target.command.is_empty() {
        anyhow::bail!("target.command must name the target binary");
    }
    if !config.target.command.iter().any(|arg| arg.contains("{}")) {
        anyhow::bail!("target.command has no '{{}}' placeholder for the testcase path");
    }
    if !config.index.csv_path.exists() {
        anyhow::bail!("index CSV {:?} does not exist", config.index.csv_path);
    }

    let checkpoint = match &resume_path {
        Some(path) => {
            let checkpoint = Checkpoint::load(path)?;
            info!(
                path = ?path,
                tested = checkpoint.tested_count,
                edges = checkpoint.coverage.len(),
                next_id = checkpoint.next_corpus_id,
                "resuming from checkpoint"
            );
            Some(checkpoint)
        }
        None => None,
    };

    if cli.dry_run {
        info!("effective configuration: {config:#?}");
        info!(
            resume = resume_path.is_some(),
            threads = config.run.threads,
            "dry run: configuration valid, exiting"
        );
        return Ok(());
    }

    let mut source = CsvIndexSource::open(&config.index.csv_path)?;
    if let Some(checkpoint) = &checkpoint {
        source.seek(&checkpoint.stream_position)?;
    }
    let cursor = IndexCursor::new(source, config.run.batch_size);

    let fetch = HttpFetchClient::new(
        &config.fetch.base_url,
        Duration::from_secs(config.fetch.request_timeout_secs),
        RetryPolicy {
            initial: Duration::from_secs(config.fetch.retry_initial_secs),
            factor: 2,
            max: Duration::from_secs(config.fetch.retry_max_secs),
        },
    );

    let coverage_env = config
        .target
        .coverage_env
        .split_once('=')
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .ok_or_else(|| {
            anyhow::anyhow!(
                "target.coverage-env {:?} is not a KEY=VALUE assignment",
                config.target.coverage_env
            )
        })?;
    let harness = SancovHarness::new(SancovHarnessConfig {
        command: config.target.command.clone(),
        target_binary: config.target.binary_name.clone(),
        file_format: config.corpus.file_format.clone(),
        scratch_dir: config.corpus.scratch_dir.clone(),
        timeout: Duration::from_millis(config.target.timeout_ms),
        coverage_env,
    });

    let universe = match &checkpoint {
        Some(c) => CoverageUniverse::resume(c.coverage.iter().copied(), c.next_corpus_id),
        None => CoverageUniverse::new(),
    };
    let store = CorpusStore::open(config.corpus.output_dir.clone(), &config.corpus.file_format)?;

    let session = Session::new(
        cursor,
        fetch,
        harness,
        universe,
        store,
        CancelToken::new(),
        SessionConfig {
            threads: config.run.threads,
            stats_interval: Duration::from_secs(config.run.stats_interval_secs),
            state_file: config.checkpoint.state_file.clone(),
            initial_tested: checkpoint.as_ref().map_or(0, |c| c.tested_count),
        },
    );

    let interrupt = session.cancel_token();
    ctrlc::set_handler(move || {
        info!("interrupt received, finishing in-flight work");
        interrupt.cancel();
    })?;

    info!(
        threads = config.run.threads,
        index = ?config.index.csv_path,
        output = ?config.corpus.output_dir,
        "starting acquisition run"
    );
    let summary = session.run()?;

    info!(
        tested = summary.tested,
        skipped = summary.skipped,
        admitted = summary.admitted,
        edges = summary.edges,
        elapsed = ?summary.elapsed,
        interrupted = summary.interrupted,
        "run finished"
    );
    Ok(())
}
