pub mod config;
pub mod context;
pub mod corpus;
pub mod coverage;
pub mod executor;
pub mod feedback;
pub mod mutator;
pub mod random;
pub mod scheduler;

pub use config::GauntletConfig;
pub use context::RunContext;
pub use corpus::{Corpus, CorpusEntry, CorpusError, CorpusPruner, CrashEntry};
pub use coverage::{CoverageMap, CoverageStats, CoverageTracker};
pub use executor::{CommandExecutor, ExecutionResult, Executor, InProcessExecutor};
pub use feedback::{FeedbackConfig, FeedbackError, FeedbackLoop, FeedbackStats};
pub use mutator::{InputMutator, MutationError, Mutator, MutatorEngine, Registry};
pub use random::{RandomSource, SeededRandom, SharedRandom, SystemRandom};
pub use scheduler::{InputScheduler, RandomScheduler, Scheduler};

use std::time::{SystemTime, UNIX_EPOCH};

/// Milliseconds since the Unix epoch; `0` if the clock is before it.
pub(crate) fn unix_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or_default()
}
