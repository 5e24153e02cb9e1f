use magpie_core::artifacts::ArtifactSink;
use magpie_core::config::{
    ConfigInputDelivery, CorpusType, ExecutorType, MagpieConfig, SchedulerType,
};
use magpie_core::corpus::{Corpus, InMemoryCorpus, OnDiskCorpus};
use magpie_core::coverage::CoverageSignature;
use magpie_core::executor::{
    CommandExecutor, CommandExecutorConfig, Executor, InProcessExecutor, InputDelivery,
};
use magpie_core::fuzzer::{Campaign, CampaignOptions, ExecutorFactory, MutatorFactory};
use magpie_core::minimizer::Minimizer;
use magpie_core::mutator::HavocMutator;
use magpie_core::oracle::CrashOracle;
use magpie_core::scheduler::{RandomScheduler, Scheduler, WeightedEnergyScheduler};

use clap::Parser;
use std::path::PathBuf;
use std::time::Duration;

#[derive(Parser, Debug)]
#[clap(author, version, about, long_about = None)]
struct Cli {
    #[clap(short, long, value_parser)]
    config_file: Option<PathBuf>,
    /// Target program to fuzz; overrides the configured command.
    #[clap(long)]
    target_command: Option<String>,
    #[clap(short, long)]
    iterations: Option<u64>,
    #[clap(short, long)]
    workers: Option<usize>,
    #[clap(long)]
    corpus_dir: Option<PathBuf>,
    #[clap(long)]
    artifacts_dir: Option<PathBuf>,
    /// Master RNG seed; with a single worker this replays a session.
    #[clap(long)]
    seed: Option<u64>,
}

/// Demo harness used when no target command is configured: coverage units
/// are byte bigrams, and two magic prefixes crash, so the binary exercises
/// the whole discover/minimize/archive pipeline out of the box.
fn demo_harness(data: &[u8]) -> CoverageSignature {
    if data.len() > 2 && data[0] == b'B' && data[1] == b'A' && data[2] == b'D' {
        panic!("BAD input detected by harness!");
    }
    if data.len() > 3 && data[0] == b'C' && data[1] == b'R' && data[2] == b'A' && data[3] == b'S' {
        panic!("CRASH input detected by harness!");
    }
    data.windows(2)
        .map(|pair| ((pair[0] as u64) << 8) | pair[1] as u64)
        .collect()
}

fn load_config(cli: &Cli) -> Result<MagpieConfig, anyhow::Error> {
    match &cli.config_file {
        Some(config_path) => {
            log::info!("loading configuration from {config_path:?}");
            MagpieConfig::load_from_file(config_path)
        }
        None => {
            let default_config_path = PathBuf::from("config.toml");
            if default_config_path.exists() {
                log::info!("loading default configuration file {default_config_path:?}");
                MagpieConfig::load_from_file(&default_config_path)
            } else {
                log::info!("no configuration file found, using built-in defaults");
                Ok(MagpieConfig::default())
            }
        }
    }
}

fn apply_cli_overrides(config: &mut MagpieConfig, cli: &Cli) {
    if let Some(iterations) = cli.iterations {
        config.fuzzer.max_iterations = iterations;
    }
    if let Some(workers) = cli.workers {
        config.fuzzer.workers = workers;
    }
    if let Some(seed) = cli.seed {
        config.fuzzer.master_seed = seed;
    }
    if let Some(dir) = &cli.corpus_dir {
        config.corpus.corpus_type = CorpusType::OnDisk;
        config.corpus.dir = dir.clone();
    }
    if let Some(dir) = &cli.artifacts_dir {
        config.artifacts.dir = dir.clone();
    }
    if let Some(target) = &cli.target_command {
        config.executor.executor_type = ExecutorType::Command;
        let settings = config.executor.command_settings.get_or_insert_with(Default::default);
        if settings.command.is_empty() {
            settings.command.push(target.clone());
        } else {
            settings.command[0] = target.clone();
        }
    }
}

fn main() -> Result<(), anyhow::Error> {
    env_logger::init();
    let cli = Cli::parse();

    let mut config = load_config(&cli)?;
    apply_cli_overrides(&mut config, &cli);
    log::debug!("effective configuration: {config:#?}");

    let (executor_factory, timeout): (ExecutorFactory<Vec<u8>>, Duration) =
        match config.executor.executor_type {
            ExecutorType::InProcess => (
                Box::new(|_| Box::new(InProcessExecutor::new(demo_harness))),
                Duration::from_secs(2),
            ),
            ExecutorType::Command => {
                let settings = config.executor.command_settings.ok_or_else(|| {
                    anyhow::anyhow!(
                        "executor-type is 'command' but no command settings were provided \
                         (set [executor.command-settings] or pass --target-command)"
                    )
                })?;
                let timeout = Duration::from_millis(settings.timeout_ms);
                let delivery_template = match settings.input_delivery {
                    ConfigInputDelivery::StdIn => None,
                    ConfigInputDelivery::File { template } => Some(template),
                };
                let command = settings.command;
                let working_dir = settings.working_dir;
                let coverage_env = settings.coverage_env;
                let factory: ExecutorFactory<Vec<u8>> = Box::new(move |_| {
                    let input_delivery = match &delivery_template {
                        None => InputDelivery::StdIn,
                        Some(template) => InputDelivery::File(template.clone()),
                    };
                    Box::new(CommandExecutor::new(CommandExecutorConfig {
                        command: command.clone(),
                        input_delivery,
                        working_dir: working_dir.clone(),
                        coverage_env: coverage_env.clone(),
                    })) as Box<dyn Executor<Vec<u8>>>
                });
                (factory, timeout)
            }
        };

    let corpus: Box<dyn Corpus<Vec<u8>>> = match config.corpus.corpus_type {
        CorpusType::OnDisk => Box::new(OnDiskCorpus::new(config.corpus.dir.clone())?),
        CorpusType::InMemory => Box::new(InMemoryCorpus::new()),
    };

    let scheduler: Box<dyn Scheduler<Vec<u8>>> = match config.scheduler.scheduler_type {
        SchedulerType::WeightedEnergy => Box::new(WeightedEnergyScheduler::new(
            config.scheduler.reward_factor,
            config.scheduler.decay_factor,
        )),
        SchedulerType::Random => Box::new(RandomScheduler::new()),
    };

    let max_input_len = config.mutator.max_input_len;
    let mutator_factory: MutatorFactory<Vec<u8>> =
        Box::new(move |_| Box::new(HavocMutator::new(max_input_len)));

    let options = CampaignOptions {
        workers: config.fuzzer.workers,
        max_iterations: config.fuzzer.max_iterations,
        timeout,
        master_seed: config.fuzzer.master_seed,
        stats_interval: Duration::from_secs(config.fuzzer.stats_interval_secs.max(1)),
        external_scan_interval: config.fuzzer.external_scan_interval,
        minimize_additions: config.minimizer.minimize_additions,
        seed_paths: config.corpus.initial_seed_paths.unwrap_or_default(),
    };

    let campaign = Campaign::new(
        options,
        corpus,
        scheduler,
        executor_factory,
        mutator_factory,
        Minimizer::new(config.minimizer.max_rounds),
        Box::new(CrashOracle::new()),
        ArtifactSink::new(config.artifacts.dir.clone())?,
    );

    let summary = campaign.run()?;
    println!(
        "done: {} executions in {:.2?} ({} crashes, {} timeouts, {} discoveries)",
        summary.executions, summary.elapsed, summary.crashes, summary.timeouts,
        summary.discoveries
    );
    println!(
        "corpus: {} entries covering {} units; crash artifacts in {:?}",
        summary.corpus_len, summary.coverage_units, config.artifacts.dir
    );
    Ok(())
}
