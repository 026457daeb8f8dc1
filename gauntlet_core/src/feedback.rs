use crate::context::RunContext;
use crate::corpus::{Corpus, CorpusEntry, content_hash};
use crate::coverage::{CoverageStats, CoverageTracker, DEFAULT_MAP_SIZE};
use crate::executor::Executor;
use crate::mutator::InputMutator;
use crate::scheduler::Scheduler;
use crate::unix_millis;
use log::{debug, info};
use parking_lot::Mutex;
use serde::Serialize;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum FeedbackError {
    #[error("Feedback loop was already started")]
    AlreadyStarted,
    #[error("Failed to spawn feedback loop thread: {0}")]
    Spawn(String),
    #[error("Feedback loop thread panicked")]
    ThreadPanicked,
}

#[derive(Debug, Clone)]
pub struct FeedbackConfig {
    /// Stop after this many executions. `0` means unlimited.
    pub max_executions: u64,
    /// Campaign time budget. `None` means unlimited.
    pub timeout: Option<Duration>,
    pub bitmap_size: usize,
    /// Inner iterations per scheduled seed. Each one mutates the seed afresh.
    pub mutations_per_seed: usize,
    /// Mutated inputs are truncated to this length. `0` disables the cap.
    pub max_input_size: usize,
    /// Shorter inputs are zero-padded up to this length.
    pub min_input_size: usize,
}

impl Default for FeedbackConfig {
    fn default() -> Self {
        Self {
            max_executions: 100_000,
            timeout: None,
            bitmap_size: DEFAULT_MAP_SIZE,
            mutations_per_seed: 16,
            max_input_size: 1 << 20,
            min_input_size: 0,
        }
    }
}

/// Point-in-time copy of the loop's counters.
#[derive(Debug, Clone, Default, Serialize)]
pub struct FeedbackStats {
    pub executions: u64,
    /// Executions whose coverage reached new edges.
    pub interesting: u64,
    pub crashes: u64,
    pub unique_crashes: u64,
    pub timeouts: u64,
    pub avg_exec_time: Duration,
    pub execs_per_sec: f64,
    pub coverage: CoverageStats,
    pub corpus_size: usize,
    /// Unix millis when the loop started.
    pub start_time_ms: Option<u64>,
    /// Unix millis of the last new-coverage discovery.
    pub last_new_coverage_ms: Option<u64>,
}

#[derive(Debug, Default)]
struct Counters {
    executions: AtomicU64,
    measured: AtomicU64,
    avg_exec_nanos: AtomicU64,
    interesting: AtomicU64,
    crashes: AtomicU64,
    unique_crashes: AtomicU64,
    timeouts: AtomicU64,
    start_time_ms: AtomicU64,
    last_new_coverage_ms: AtomicU64,
}

fn nonzero(value: u64) -> Option<u64> {
    (value != 0).then_some(value)
}

/// Drives scheduler -> mutator -> executor -> coverage tracker -> corpus on a
/// single background thread.
///
/// Executions never overlap. Each execution gets a child of the run context, so
/// it is bounded by the remaining campaign budget and aborted by [`FeedbackLoop::stop`].
pub struct FeedbackLoop {
    config: FeedbackConfig,
    corpus: Arc<Corpus>,
    scheduler: Arc<dyn Scheduler>,
    mutator: Arc<dyn InputMutator>,
    executor: Arc<dyn Executor>,
    tracker: Arc<CoverageTracker>,
    counters: Counters,
    started: AtomicBool,
    stopped: AtomicBool,
    running: AtomicBool,
    started_at: Mutex<Option<Instant>>,
    run_ctx: Mutex<Option<RunContext>>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl FeedbackLoop {
    pub fn new(
        config: FeedbackConfig,
        corpus: Arc<Corpus>,
        scheduler: Arc<dyn Scheduler>,
        mutator: Arc<dyn InputMutator>,
        executor: Arc<dyn Executor>,
    ) -> Self {
        let tracker = Arc::new(CoverageTracker::new(config.bitmap_size));
        Self {
            config,
            corpus,
            scheduler,
            mutator,
            executor,
            tracker,
            counters: Counters::default(),
            started: AtomicBool::new(false),
            stopped: AtomicBool::new(false),
            running: AtomicBool::new(false),
            started_at: Mutex::new(None),
            run_ctx: Mutex::new(None),
            handle: Mutex::new(None),
        }
    }

    pub fn config(&self) -> &FeedbackConfig {
        &self.config
    }

    pub fn corpus(&self) -> &Arc<Corpus> {
        &self.corpus
    }

    /// Global coverage. Load a saved bitmap into it before [`FeedbackLoop::start`]
    /// to resume a campaign.
    pub fn tracker(&self) -> &Arc<CoverageTracker> {
        &self.tracker
    }

    /// Launches the loop thread. Only the first call does anything; later calls
    /// return [`FeedbackError::AlreadyStarted`].
    pub fn start(self: &Arc<Self>, ctx: &RunContext) -> Result<(), FeedbackError> {
        if self.started.swap(true, Ordering::SeqCst) {
            return Err(FeedbackError::AlreadyStarted);
        }

        let run_ctx = match self.config.timeout {
            Some(budget) => ctx.child_with_timeout(budget),
            None => ctx.child(),
        };
        *self.run_ctx.lock() = Some(run_ctx.clone());
        if self.stopped.load(Ordering::SeqCst) {
            run_ctx.cancel();
        }

        self.running.store(true, Ordering::SeqCst);
        let this = Arc::clone(self);
        let spawned = thread::Builder::new()
            .name("gauntlet-feedback".to_string())
            .spawn(move || this.run(run_ctx));
        match spawned {
            Ok(handle) => {
                *self.handle.lock() = Some(handle);
                Ok(())
            }
            Err(e) => {
                self.running.store(false, Ordering::SeqCst);
                Err(FeedbackError::Spawn(e.to_string()))
            }
        }
    }

    /// Asks the loop to stop. Safe to call any number of times, before or after
    /// [`FeedbackLoop::start`].
    pub fn stop(&self) {
        if self
            .stopped
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return;
        }
        if let Some(ctx) = self.run_ctx.lock().as_ref() {
            ctx.cancel();
        }
    }

    /// Blocks until the loop thread exits. Returns immediately if it never started.
    pub fn wait(&self) -> Result<(), FeedbackError> {
        let handle = self.handle.lock().take();
        match handle {
            Some(handle) => handle.join().map_err(|_| FeedbackError::ThreadPanicked),
            None => Ok(()),
        }
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub fn stats(&self) -> FeedbackStats {
        let c = &self.counters;
        let executions = c.executions.load(Ordering::Relaxed);
        let elapsed = self
            .started_at
            .lock()
            .map(|started| started.elapsed().as_secs_f64())
            .unwrap_or(0.0);
        FeedbackStats {
            executions,
            interesting: c.interesting.load(Ordering::Relaxed),
            crashes: c.crashes.load(Ordering::Relaxed),
            unique_crashes: c.unique_crashes.load(Ordering::Relaxed),
            timeouts: c.timeouts.load(Ordering::Relaxed),
            avg_exec_time: Duration::from_nanos(c.avg_exec_nanos.load(Ordering::Relaxed)),
            execs_per_sec: if elapsed > 0.0 {
                executions as f64 / elapsed
            } else {
                0.0
            },
            coverage: self.tracker.stats(),
            corpus_size: self.corpus.size(),
            start_time_ms: nonzero(c.start_time_ms.load(Ordering::Relaxed)),
            last_new_coverage_ms: nonzero(c.last_new_coverage_ms.load(Ordering::Relaxed)),
        }
    }

    fn should_stop(&self, ctx: &RunContext) -> bool {
        if ctx.is_done() || self.stopped.load(Ordering::SeqCst) {
            return true;
        }
        self.config.max_executions > 0
            && self.counters.executions.load(Ordering::Relaxed) >= self.config.max_executions
    }

    fn run(&self, ctx: RunContext) {
        *self.started_at.lock() = Some(Instant::now());
        self.counters
            .start_time_ms
            .store(unix_millis(), Ordering::Relaxed);
        info!(
            "Feedback loop started: {} corpus entries, {} max executions",
            self.corpus.size(),
            self.config.max_executions
        );

        'campaign: while !self.should_stop(&ctx) {
            let seed = self.scheduler.next(&self.corpus);
            let seed_data = seed.as_ref().map(|e| e.data.as_slice()).unwrap_or(&[]);

            let mut ran = 0u64;
            for _ in 0..self.config.mutations_per_seed.max(1) {
                if self.should_stop(&ctx) {
                    break;
                }
                let input = self.shape(self.mutator.mutate(seed_data));
                self.execute_and_record(&ctx, &input);
                ran += 1;
            }
            if let Some(entry) = &seed {
                self.corpus.record_execution(&entry.hash, ran);
            }
            if ran == 0 {
                break 'campaign;
            }
        }

        self.running.store(false, Ordering::SeqCst);
        let stats = self.stats();
        info!(
            "Feedback loop finished: {} executions, {} interesting, {} crashes ({} unique)",
            stats.executions, stats.interesting, stats.crashes, stats.unique_crashes
        );
    }

    /// Applies the size limits to a mutated input.
    fn shape(&self, mut input: Vec<u8>) -> Vec<u8> {
        if self.config.max_input_size > 0 && input.len() > self.config.max_input_size {
            input.truncate(self.config.max_input_size);
        }
        if input.len() < self.config.min_input_size {
            input.resize(self.config.min_input_size, 0);
        }
        input
    }

    fn execute_and_record(&self, ctx: &RunContext, input: &[u8]) {
        let call_ctx = ctx.child();
        let result = match self.executor.execute(&call_ctx, input) {
            Ok(result) => result,
            Err(e) => {
                self.counters.executions.fetch_add(1, Ordering::Relaxed);
                debug!("Executor error ignored: {e:#}");
                return;
            }
        };
        self.counters.executions.fetch_add(1, Ordering::Relaxed);
        self.record_exec_time(result.duration);

        if result.crashed {
            self.counters.crashes.fetch_add(1, Ordering::Relaxed);
            if self.corpus.add_crash(input, &result) {
                self.counters.unique_crashes.fetch_add(1, Ordering::Relaxed);
            }
        }
        if result.timed_out {
            self.counters.timeouts.fetch_add(1, Ordering::Relaxed);
        }

        let Some(coverage) = &result.coverage else {
            return;
        };
        let hash = content_hash(input);
        if !self.tracker.record_execution(coverage, &hash) {
            return;
        }
        self.counters.interesting.fetch_add(1, Ordering::Relaxed);
        self.counters
            .last_new_coverage_ms
            .store(unix_millis(), Ordering::Relaxed);

        let entry = CorpusEntry::new(input.to_vec(), coverage.stats(), false);
        if self.corpus.add(entry.clone()) {
            self.scheduler.update_priority(&entry);
        }
        info!(
            "New coverage: {} edges in input {}, global {:.2}%",
            entry.coverage.edges_covered,
            &hash[..12],
            self.tracker.stats().coverage_percent
        );
    }

    /// Incremental mean over executions that returned a result.
    fn record_exec_time(&self, duration: Duration) {
        let n = self.counters.measured.fetch_add(1, Ordering::Relaxed) + 1;
        let avg = self.counters.avg_exec_nanos.load(Ordering::Relaxed) as f64;
        let sample = duration.as_nanos() as f64;
        let updated = avg + (sample - avg) / n as f64;
        self.counters
            .avg_exec_nanos
            .store(updated.max(0.0) as u64, Ordering::Relaxed);
    }
}

impl Drop for FeedbackLoop {
    fn drop(&mut self) {
        if let Some(ctx) = self.run_ctx.get_mut().as_ref() {
            ctx.cancel();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coverage::CoverageMap;
    use crate::executor::ExecutionResult;
    use crate::mutator::{ChainingMutator, MutatorEngine, default_registry};
    use crate::random::SeededRandom;
    use crate::scheduler::InputScheduler;
    use anyhow::anyhow;
    use std::sync::atomic::AtomicUsize;

    /// Reports one edge when the first byte is 0xAA.
    struct FirstByteExecutor {
        map_size: usize,
        seen: Mutex<Vec<Vec<u8>>>,
    }

    impl FirstByteExecutor {
        fn new() -> Self {
            Self {
                map_size: 1024,
                seen: Mutex::new(Vec::new()),
            }
        }
    }

    impl Executor for FirstByteExecutor {
        fn execute(&self, _ctx: &RunContext, input: &[u8]) -> anyhow::Result<ExecutionResult> {
            self.seen.lock().push(input.to_vec());
            let mut map = CoverageMap::new(self.map_size);
            if input.first() == Some(&0xAA) {
                map.record_edge(1, 2);
            }
            Ok(ExecutionResult {
                coverage: Some(map),
                duration: Duration::from_micros(10),
                ..ExecutionResult::default()
            })
        }
    }

    struct FailingExecutor;

    impl Executor for FailingExecutor {
        fn execute(&self, _ctx: &RunContext, _input: &[u8]) -> anyhow::Result<ExecutionResult> {
            Err(anyhow!("target unavailable"))
        }
    }

    /// Crashes on inputs starting with `C`, times out on `T`.
    struct VerdictExecutor;

    impl Executor for VerdictExecutor {
        fn execute(&self, _ctx: &RunContext, input: &[u8]) -> anyhow::Result<ExecutionResult> {
            Ok(ExecutionResult {
                crashed: input.first() == Some(&b'C'),
                timed_out: input.first() == Some(&b'T'),
                exit_code: if input.first() == Some(&b'C') { 139 } else { 0 },
                output: b"boom".to_vec(),
                ..ExecutionResult::default()
            })
        }
    }

    struct Identity;

    impl InputMutator for Identity {
        fn mutate(&self, input: &[u8]) -> Vec<u8> {
            input.to_vec()
        }
    }

    /// Sets the first byte to 0xAA on every other call.
    struct AlternatingMutator(AtomicUsize);

    impl InputMutator for AlternatingMutator {
        fn mutate(&self, input: &[u8]) -> Vec<u8> {
            let mut out = input.to_vec();
            if self.0.fetch_add(1, Ordering::SeqCst) % 2 == 1 {
                match out.first_mut() {
                    Some(first) => *first = 0xAA,
                    None => out.push(0xAA),
                }
            }
            out
        }
    }

    fn build(
        config: FeedbackConfig,
        corpus: Arc<Corpus>,
        mutator: Arc<dyn InputMutator>,
        executor: Arc<dyn Executor>,
    ) -> Arc<FeedbackLoop> {
        let scheduler = Arc::new(InputScheduler::new(SeededRandom::shared(42)));
        Arc::new(FeedbackLoop::new(config, corpus, scheduler, mutator, executor))
    }

    fn limited(max_executions: u64) -> FeedbackConfig {
        FeedbackConfig {
            max_executions,
            bitmap_size: 1024,
            mutations_per_seed: 1,
            ..FeedbackConfig::default()
        }
    }

    fn run_to_end(fl: &Arc<FeedbackLoop>) {
        fl.start(&RunContext::new()).unwrap();
        fl.wait().unwrap();
        fl.stop();
    }

    #[test]
    fn runs_exactly_max_executions_and_keeps_new_coverage() {
        let corpus = Arc::new(Corpus::in_memory());
        corpus.add(CorpusEntry::seed(b"seed".to_vec()));
        let executor = Arc::new(FirstByteExecutor::new());
        let fl = build(
            limited(100),
            corpus.clone(),
            Arc::new(AlternatingMutator(AtomicUsize::new(0))),
            executor.clone(),
        );

        run_to_end(&fl);

        let stats = fl.stats();
        assert_eq!(stats.executions, 100);
        assert_eq!(executor.seen.lock().len(), 100);
        assert!(corpus.size() >= 1);
        assert_eq!(stats.interesting, 1);
        assert_eq!(corpus.size(), 2);
        assert!(corpus.entries().iter().any(|e| e.data.first() == Some(&0xAA)));
        assert_eq!(stats.coverage.edges_covered, 1);
        assert!(stats.start_time_ms.is_some());
        assert!(stats.last_new_coverage_ms.is_some());
        assert_eq!(stats.avg_exec_time, Duration::from_micros(10));
        assert!(!fl.is_running());

        let seed_hash = content_hash(b"seed");
        assert!(corpus.get(&seed_hash).unwrap().execution_count > 0);
    }

    #[test]
    fn real_engine_drives_the_loop() {
        let rng = SeededRandom::shared(9);
        let engine = Arc::new(MutatorEngine::new(default_registry(&rng), rng));
        let mutators: [Arc<dyn InputMutator>; 2] = [
            Arc::clone(&engine) as Arc<dyn InputMutator>,
            Arc::new(ChainingMutator::new(Arc::clone(&engine))),
        ];
        for mutator in mutators {
            let corpus = Arc::new(Corpus::in_memory());
            corpus.add(CorpusEntry::seed(b"{\"id\": 7}".to_vec()));
            let executor = Arc::new(FirstByteExecutor::new());
            let mut config = limited(200);
            config.mutations_per_seed = 8;
            config.max_input_size = 4096;
            let fl = build(config, corpus.clone(), mutator, executor.clone());

            run_to_end(&fl);

            assert_eq!(fl.stats().executions, 200);
            let seen = executor.seen.lock();
            assert_eq!(seen.len(), 200);
            assert!(seen.iter().any(|input| input.as_slice() != b"{\"id\": 7}"));
            assert!(seen.iter().all(|input| input.len() <= 4096));
            assert!(corpus.size() >= 1);
        }
    }

    #[test]
    fn executor_errors_only_count_executions() {
        let corpus = Arc::new(Corpus::in_memory());
        corpus.add(CorpusEntry::seed(b"x".to_vec()));
        let fl = build(limited(10), corpus.clone(), Arc::new(Identity), Arc::new(FailingExecutor));

        run_to_end(&fl);

        let stats = fl.stats();
        assert_eq!(stats.executions, 10);
        assert_eq!(stats.crashes, 0);
        assert_eq!(stats.interesting, 0);
        assert_eq!(stats.avg_exec_time, Duration::ZERO);
        assert_eq!(corpus.size(), 1);
    }

    #[test]
    fn crashes_and_timeouts_are_counted() {
        let corpus = Arc::new(Corpus::in_memory());
        corpus.add(CorpusEntry::seed(b"CRASH".to_vec()));
        corpus.add(CorpusEntry::seed(b"TIMEOUT".to_vec()));
        let fl = build(limited(40), corpus.clone(), Arc::new(Identity), Arc::new(VerdictExecutor));

        run_to_end(&fl);

        let stats = fl.stats();
        assert_eq!(stats.executions, 40);
        assert_eq!(stats.crashes + stats.timeouts, 40);
        assert!(stats.crashes > 0 && stats.timeouts > 0);
        assert_eq!(stats.unique_crashes, 1);
        assert_eq!(corpus.crash_count(), 1);
        assert_eq!(corpus.crashes()[0].exit_code, 139);
    }

    #[test]
    fn inputs_are_truncated_and_padded() {
        let corpus = Arc::new(Corpus::in_memory());
        corpus.add(CorpusEntry::seed(b"0123456789".to_vec()));
        let executor = Arc::new(FirstByteExecutor::new());
        let mut config = limited(5);
        config.max_input_size = 4;
        let fl = build(config, corpus, Arc::new(Identity), executor.clone());
        run_to_end(&fl);
        assert!(executor.seen.lock().iter().all(|i| i == b"0123"));

        let corpus = Arc::new(Corpus::in_memory());
        corpus.add(CorpusEntry::seed(b"ab".to_vec()));
        let executor = Arc::new(FirstByteExecutor::new());
        let mut config = limited(5);
        config.min_input_size = 5;
        let fl = build(config, corpus, Arc::new(Identity), executor.clone());
        run_to_end(&fl);
        assert!(executor.seen.lock().iter().all(|i| i == b"ab\0\0\0"));
    }

    #[test]
    fn empty_corpus_runs_empty_input() {
        let corpus = Arc::new(Corpus::in_memory());
        let executor = Arc::new(FirstByteExecutor::new());
        let fl = build(limited(3), corpus, Arc::new(Identity), executor.clone());
        run_to_end(&fl);
        assert_eq!(fl.stats().executions, 3);
        assert!(executor.seen.lock().iter().all(Vec::is_empty));
    }

    #[test]
    fn start_runs_once() {
        let corpus = Arc::new(Corpus::in_memory());
        let fl = build(limited(1), corpus, Arc::new(Identity), Arc::new(FailingExecutor));
        fl.start(&RunContext::new()).unwrap();
        assert!(matches!(
            fl.start(&RunContext::new()),
            Err(FeedbackError::AlreadyStarted)
        ));
        fl.wait().unwrap();
    }

    #[test]
    fn stop_ends_unlimited_campaign() {
        let corpus = Arc::new(Corpus::in_memory());
        corpus.add(CorpusEntry::seed(b"loop".to_vec()));
        let fl = build(limited(0), corpus, Arc::new(Identity), Arc::new(FirstByteExecutor::new()));
        fl.start(&RunContext::new()).unwrap();
        thread::sleep(Duration::from_millis(20));
        fl.stop();
        fl.stop();
        fl.wait().unwrap();
        assert!(!fl.is_running());
        assert!(fl.stats().executions > 0);
    }

    #[test]
    fn stop_before_start_runs_nothing() {
        let corpus = Arc::new(Corpus::in_memory());
        let fl = build(limited(0), corpus, Arc::new(Identity), Arc::new(FirstByteExecutor::new()));
        fl.stop();
        run_to_end(&fl);
        assert_eq!(fl.stats().executions, 0);
    }

    #[test]
    fn parent_cancellation_and_budget_end_campaign() {
        let corpus = Arc::new(Corpus::in_memory());
        let executor = Arc::new(FirstByteExecutor::new());
        let fl = build(limited(0), corpus.clone(), Arc::new(Identity), executor);
        let ctx = RunContext::new();
        fl.start(&ctx).unwrap();
        thread::sleep(Duration::from_millis(10));
        ctx.cancel();
        fl.wait().unwrap();
        assert!(!fl.is_running());

        let mut config = limited(0);
        config.timeout = Some(Duration::from_millis(30));
        let fl = build(config, corpus, Arc::new(Identity), Arc::new(FirstByteExecutor::new()));
        fl.start(&RunContext::new()).unwrap();
        fl.wait().unwrap();
        assert!(fl.stats().executions > 0);
    }
}
