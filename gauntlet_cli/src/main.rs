use gauntlet_core::config::{
    CommandExecutorSettings, ExecutorType as ConfigExecutorType, GauntletConfig, SchedulerKind,
};
use gauntlet_core::context::RunContext;
use gauntlet_core::corpus::{Corpus, CorpusEntry, CorpusPruner};
use gauntlet_core::coverage::CoverageMap;
use gauntlet_core::executor::{CommandExecutor, Executor, InProcessExecutor};
use gauntlet_core::feedback::FeedbackLoop;
use gauntlet_core::mutator::{ChainingMutator, InputMutator};
use gauntlet_core::random::random_source;
use gauntlet_core::scheduler::{InputScheduler, RandomScheduler, Scheduler};

use clap::Parser;
use log::{info, warn};
use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

const COVERAGE_FILE: &str = "coverage.bin";

#[derive(Parser, Debug)]
#[clap(author, version, about, long_about = None)]
struct Cli {
    #[clap(short, long, value_parser)]
    config_file: Option<PathBuf>,
    #[clap(long)]
    target_command: Option<String>,
    #[clap(short, long)]
    iterations: Option<u64>,
    #[clap(long, value_parser)]
    corpus_dir: Option<PathBuf>,
}

/// Demo target: every matching byte of the magic prefix is a new edge, so the
/// fuzzer climbs towards the crashing inputs one byte at a time.
fn demo_harness(data: &[u8], coverage: &mut CoverageMap) {
    const MAGIC: &[&[u8]] = &[b"BAD", b"CRASH"];
    let mut prev = 0u32;
    for (branch, magic) in MAGIC.iter().enumerate() {
        for (i, expected) in magic.iter().enumerate() {
            let block = ((branch as u32 + 1) << 8) | i as u32;
            coverage.record_edge(prev, block);
            prev = block;
            if data.get(i) != Some(expected) {
                break;
            }
            if i + 1 == magic.len() {
                panic!("{} input detected by harness!", String::from_utf8_lossy(magic));
            }
        }
        prev = 0;
    }
}

fn load_config(cli: &Cli) -> Result<GauntletConfig, anyhow::Error> {
    match &cli.config_file {
        Some(config_path) => {
            info!("Loading configuration from specified path: {config_path:?}");
            GauntletConfig::load_from_file(config_path)
        }
        None => {
            let default_config_path = PathBuf::from("gauntlet.toml");
            if default_config_path.exists() {
                info!("No config file specified via CLI, loading default: {default_config_path:?}");
                GauntletConfig::load_from_file(&default_config_path)
            } else {
                info!(
                    "No config file given and 'gauntlet.toml' not found, using built-in defaults."
                );
                Ok(GauntletConfig::default())
            }
        }
    }
}

fn apply_overrides(config: &mut GauntletConfig, cli: Cli) {
    if let Some(iterations) = cli.iterations {
        config.fuzzer.max_executions = iterations;
    }
    if let Some(dir) = cli.corpus_dir {
        config.corpus.dir = Some(dir);
    }
    if let Some(target_cmd_str) = cli.target_command {
        if config.executor.executor_type == ConfigExecutorType::Command {
            let cmd_settings = config
                .executor
                .command_settings
                .get_or_insert_with(CommandExecutorSettings::default);
            if cmd_settings.command.is_empty() {
                cmd_settings.command.push(target_cmd_str);
            } else {
                cmd_settings.command[0] = target_cmd_str;
            }
        } else {
            warn!(
                "--target-command specified but executor type is not 'command'. Override ignored."
            );
        }
    }
}

fn build_executor(config: &GauntletConfig) -> Result<Arc<dyn Executor>, anyhow::Error> {
    let executor: Arc<dyn Executor> = match config.executor.executor_type {
        ConfigExecutorType::InProcess => Arc::new(InProcessExecutor::new(
            demo_harness,
            config.fuzzer.bitmap_size,
        )),
        ConfigExecutorType::Command => {
            let cmd_settings = config.executor.command_settings.as_ref().ok_or_else(|| {
                anyhow::anyhow!("Command settings missing for command executor type in config")
            })?;
            Arc::new(CommandExecutor::new(cmd_settings.to_command_config())?)
        }
    };
    Ok(executor)
}

fn build_corpus(config: &GauntletConfig) -> Result<Arc<Corpus>, anyhow::Error> {
    let corpus = match &config.corpus.dir {
        Some(dir) => {
            let corpus = Corpus::new(dir)?;
            let loaded = corpus.load()?;
            info!("Loaded {loaded} entries from {dir:?}");
            corpus
        }
        None => Corpus::in_memory(),
    };
    if !config.corpus.seed_paths.is_empty() {
        let seeded = corpus.load_seeds(&config.corpus.seed_paths)?;
        info!("Imported {seeded} seeds");
    }
    if corpus.is_empty() {
        corpus.add(CorpusEntry::seed(b"INIT".to_vec()));
    }
    Ok(Arc::new(corpus))
}

fn main() -> Result<(), anyhow::Error> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let cli = Cli::parse();
    let mut config = load_config(&cli)?;
    apply_overrides(&mut config, cli);
    info!("Effective configuration: {config:#?}");

    let rng = random_source(config.fuzzer.seed);

    let engine = Arc::new(config.mutation.build_engine(&rng)?);
    let mutator: Arc<dyn InputMutator> = if config.mutation.chain {
        Arc::new(ChainingMutator::new(engine))
    } else {
        engine
    };

    let scheduler: Arc<dyn Scheduler> = match config.scheduler.kind {
        SchedulerKind::Weighted => Arc::new(InputScheduler::new(rng.clone())),
        SchedulerKind::Random => Arc::new(RandomScheduler::new(rng.clone())),
    };

    let executor = build_executor(&config)?;
    let corpus = build_corpus(&config)?;

    let feedback = Arc::new(FeedbackLoop::new(
        config.to_feedback_config(),
        Arc::clone(&corpus),
        scheduler,
        mutator,
        executor,
    ));

    let coverage_path = config.corpus.dir.as_ref().map(|dir| dir.join(COVERAGE_FILE));
    if let Some(path) = coverage_path.as_ref().filter(|p| p.exists()) {
        match feedback.tracker().load_bitmap(path) {
            Ok(stats) => info!("Resumed coverage: {} edges", stats.edges_covered),
            Err(e) => warn!("Ignoring unreadable coverage bitmap {path:?}: {e}"),
        }
    }

    let mut pruner = (config.corpus.minimize_interval_secs > 0).then(|| {
        CorpusPruner::spawn(
            Arc::clone(&corpus),
            Duration::from_secs(config.corpus.minimize_interval_secs),
        )
    });

    info!(
        "Starting fuzz loop for {} executions with {} initial corpus items...",
        config.fuzzer.max_executions,
        corpus.size()
    );
    let start_time = Instant::now();
    let ctx = RunContext::new();
    feedback.start(&ctx)?;

    while feedback.is_running() {
        std::thread::sleep(Duration::from_millis(500));
        let stats = feedback.stats();
        print!(
            "\rExecs: {}, Corpus: {}, Edges: {}, Crashes: {} ({} unique), Execs/sec: {:.2}   ",
            stats.executions,
            stats.corpus_size,
            stats.coverage.edges_covered,
            stats.crashes,
            stats.unique_crashes,
            stats.execs_per_sec
        );
        std::io::stdout().flush()?;
    }
    feedback.wait()?;

    if let Some(pruner) = pruner.as_mut() {
        pruner.stop();
    }
    if let Some(path) = &coverage_path {
        feedback.tracker().save_bitmap(path)?;
    }

    let stats = feedback.stats();
    let corpus_stats = corpus.stats();
    println!("\nFuzz loop finished in {:.2?}.", start_time.elapsed());
    println!(
        "Total Executions: {}, Interesting: {}, Timeouts: {}, Avg Exec: {:?}",
        stats.executions, stats.interesting, stats.timeouts, stats.avg_exec_time
    );
    println!(
        "Coverage: {} edges ({:.3}%), Corpus Size: {}, Crashes: {}",
        stats.coverage.edges_covered,
        stats.coverage.coverage_percent,
        corpus_stats.entries,
        corpus_stats.crashes
    );
    if corpus_stats.persist_failures > 0 {
        warn!("{} corpus writes failed", corpus_stats.persist_failures);
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn demo_harness_rewards_matching_prefix() {
        let mut shallow = CoverageMap::new(1024);
        demo_harness(b"xyz", &mut shallow);
        let mut deeper = CoverageMap::new(1024);
        demo_harness(b"BAx", &mut deeper);
        assert!(deeper.edges_covered() > shallow.edges_covered());
    }

    #[test]
    fn demo_harness_panics_on_magic() {
        let result = std::panic::catch_unwind(|| {
            let mut map = CoverageMap::new(1024);
            demo_harness(b"CRASH!", &mut map);
        });
        assert!(result.is_err());
    }

    #[test]
    fn overrides_replace_command_and_limits() {
        let mut config = GauntletConfig::default();
        config.executor.executor_type = ConfigExecutorType::Command;
        let cli = Cli::parse_from([
            "gauntlet",
            "--iterations",
            "10",
            "--target-command",
            "/bin/cat",
            "--corpus-dir",
            "/tmp/c",
        ]);
        apply_overrides(&mut config, cli);
        assert_eq!(config.fuzzer.max_executions, 10);
        assert_eq!(config.corpus.dir, Some(PathBuf::from("/tmp/c")));
        assert_eq!(
            config.executor.command_settings.unwrap().command,
            vec!["/bin/cat".to_string()]
        );
    }
}
