use crate::artifacts::{ArtifactRecord, ArtifactSink};
use crate::corpus::{Corpus, Provenance, collect_seed_files, unix_time_ms};
use crate::coverage::{CoverageTracker, EntryId, Novelty};
use crate::executor::{ExecutionResult, Executor, Outcome};
use crate::input::Input;
use crate::minimizer::Minimizer;
use crate::mutator::Mutator;
use crate::oracle::Oracle;
use crate::scheduler::Scheduler;
use anyhow::Context;
use rand_chacha::ChaCha8Rng;
use rand_core::SeedableRng;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

/// Builds one executor per worker. Executors hold per-run state (temp
/// files, child handles), so they are never shared across threads.
pub type ExecutorFactory<I> = Box<dyn Fn(usize) -> Box<dyn Executor<I>> + Send + Sync>;
/// Builds one mutator per worker.
pub type MutatorFactory<I> = Box<dyn Fn(usize) -> Box<dyn Mutator<I>> + Send + Sync>;

/// Knobs of one fuzzing campaign.
#[derive(Debug, Clone)]
pub struct CampaignOptions {
    pub workers: usize,
    /// Total mutation iterations across all workers.
    pub max_iterations: u64,
    /// Wall-clock budget per target execution.
    pub timeout: Duration,
    /// Worker RNGs are derived from this, so a fixed seed plus a single
    /// worker replays a session.
    pub master_seed: u64,
    pub stats_interval: Duration,
    /// Each worker rescans the corpus directory for externally dropped
    /// files every this many of its own iterations; 0 disables rescans
    /// (the startup scan still runs).
    pub external_scan_interval: u64,
    /// Minimize coverage-novel non-crash inputs before storing them.
    pub minimize_additions: bool,
    /// Files and/or directories of initial seed payloads.
    pub seed_paths: Vec<PathBuf>,
}

impl Default for CampaignOptions {
    fn default() -> Self {
        CampaignOptions {
            workers: 1,
            max_iterations: 1_000_000,
            timeout: Duration::from_secs(2),
            master_seed: 0,
            stats_interval: Duration::from_secs(10),
            external_scan_interval: 128,
            minimize_additions: true,
            seed_paths: Vec::new(),
        }
    }
}

/// Aggregate counters shared by all workers.
#[derive(Debug, Default)]
struct CampaignStats {
    executions: AtomicU64,
    crashes: AtomicU64,
    timeouts: AtomicU64,
    discoveries: AtomicU64,
}

/// End-of-run accounting returned by [`Campaign::run`].
#[derive(Debug, Clone)]
pub struct CampaignSummary {
    pub executions: u64,
    pub crashes: u64,
    pub timeouts: u64,
    /// Corpus entries added during this run (seeds included).
    pub discoveries: u64,
    pub corpus_len: usize,
    pub coverage_units: usize,
    pub elapsed: Duration,
}

/// Terminal state of one worker iteration.
#[derive(Debug)]
enum IterationOutcome {
    /// No novelty, no crash; the candidate is dropped.
    Discarded,
    /// The candidate (possibly minimized) was persisted.
    Stored(EntryId),
}

/// The corpus and scheduler change together (selection reads energies the
/// scheduler writes), so they live under one lock.
struct Selection<I: Input> {
    corpus: Box<dyn Corpus<I>>,
    scheduler: Box<dyn Scheduler<I>>,
}

fn lock_ignoring_poison<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// A complete fuzzing campaign: shared corpus, coverage tracker, and a
/// fixed pool of workers each looping select → mutate → execute → evaluate
/// → store.
///
/// The coverage tracker's evaluate-and-union is the only cross-worker
/// serialization point besides the corpus/scheduler lock; corpus writes
/// happen outside the tracker's critical section.
pub struct Campaign<I: Input + From<Vec<u8>>> {
    options: CampaignOptions,
    selection: Mutex<Selection<I>>,
    tracker: CoverageTracker,
    stats: CampaignStats,
    stop: Arc<AtomicBool>,
    tickets: AtomicU64,
    executor_factory: ExecutorFactory<I>,
    mutator_factory: MutatorFactory<I>,
    minimizer: Minimizer,
    oracle: Box<dyn Oracle<I>>,
    artifacts: ArtifactSink,
    started: Instant,
}

impl<I: Input + From<Vec<u8>>> Campaign<I> {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        options: CampaignOptions,
        corpus: Box<dyn Corpus<I>>,
        scheduler: Box<dyn Scheduler<I>>,
        executor_factory: ExecutorFactory<I>,
        mutator_factory: MutatorFactory<I>,
        minimizer: Minimizer,
        oracle: Box<dyn Oracle<I>>,
        artifacts: ArtifactSink,
    ) -> Self {
        Campaign {
            options,
            selection: Mutex::new(Selection { corpus, scheduler }),
            tracker: CoverageTracker::new(),
            stats: CampaignStats::default(),
            stop: Arc::new(AtomicBool::new(false)),
            tickets: AtomicU64::new(0),
            executor_factory,
            mutator_factory,
            minimizer,
            oracle,
            artifacts,
            started: Instant::now(),
        }
    }

    /// Flag that asks all workers to finish their in-flight execution and
    /// exit. Safe to set from another thread or a signal handler.
    pub fn stop_handle(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.stop)
    }

    /// Runs the campaign to completion: seeds the corpus, spawns the worker
    /// pool, and returns aggregate statistics.
    ///
    /// Fatal conditions (executor setup failure, exhausted store retries,
    /// invariant violations) stop all workers and surface the first error.
    pub fn run(self) -> anyhow::Result<CampaignSummary> {
        self.replay_stored_signatures();

        let worker_count = self.options.workers.max(1);
        let campaign = &self;
        let mut contexts: Vec<WorkerContext<'_, I>> = (0..worker_count)
            .map(|index| WorkerContext::new(index, campaign))
            .collect();

        contexts[0].bootstrap()?;

        let fatal: Mutex<Option<anyhow::Error>> = Mutex::new(None);
        std::thread::scope(|scope| {
            for mut ctx in contexts {
                let fatal = &fatal;
                scope.spawn(move || {
                    let index = ctx.index;
                    if let Err(e) = ctx.run_loop() {
                        log::error!("worker {index}: fatal error: {e:#}");
                        campaign.stop.store(true, Ordering::SeqCst);
                        let mut slot = lock_ignoring_poison(fatal);
                        if slot.is_none() {
                            *slot = Some(e);
                        }
                    }
                });
            }
        });

        if let Some(e) = lock_ignoring_poison(&fatal).take() {
            return Err(e);
        }
        let summary = self.summary();
        log::info!(
            "campaign finished: {} execs in {:.1?}, {} crashes, {} timeouts, corpus {}, coverage {}",
            summary.executions,
            summary.elapsed,
            summary.crashes,
            summary.timeouts,
            summary.corpus_len,
            summary.coverage_units
        );
        Ok(summary)
    }

    /// Re-seeds the coverage map from the signatures of already stored
    /// entries. Without this, every reloaded entry would register as novel
    /// again on its first mutation pass and the corpus would duplicate
    /// itself session over session.
    fn replay_stored_signatures(&self) {
        let sel = lock_ignoring_poison(&self.selection);
        let ids: Vec<EntryId> = sel.corpus.list().to_vec();
        for id in &ids {
            if let Ok(meta) = sel.corpus.metadata(id) {
                self.tracker.evaluate(&meta.signature);
            }
        }
        if !ids.is_empty() {
            log::info!(
                "warm start: {} stored entries re-seeded {} coverage units",
                ids.len(),
                self.tracker.unit_count()
            );
        }
    }

    fn summary(&self) -> CampaignSummary {
        let sel = lock_ignoring_poison(&self.selection);
        CampaignSummary {
            executions: self.stats.executions.load(Ordering::Relaxed),
            crashes: self.stats.crashes.load(Ordering::Relaxed),
            timeouts: self.stats.timeouts.load(Ordering::Relaxed),
            discoveries: self.stats.discoveries.load(Ordering::Relaxed),
            corpus_len: sel.corpus.len(),
            coverage_units: self.tracker.unit_count(),
            elapsed: self.started.elapsed(),
        }
    }

    fn log_stats(&self) {
        let executions = self.stats.executions.load(Ordering::Relaxed);
        let elapsed = self.started.elapsed().as_secs_f64();
        let rate = if elapsed > 0.0 {
            executions as f64 / elapsed
        } else {
            0.0
        };
        let corpus_len = lock_ignoring_poison(&self.selection).corpus.len();
        log::info!(
            "stats: {} execs ({:.0}/s), corpus {}, coverage {}, crashes {}, timeouts {}",
            executions,
            rate,
            corpus_len,
            self.tracker.unit_count(),
            self.stats.crashes.load(Ordering::Relaxed),
            self.stats.timeouts.load(Ordering::Relaxed),
        );
    }
}

/// Per-worker state: its own executor, mutator, and derived RNG. Everything
/// else is reached through the shared campaign reference.
struct WorkerContext<'c, I: Input + From<Vec<u8>>> {
    index: usize,
    campaign: &'c Campaign<I>,
    executor: Box<dyn Executor<I>>,
    mutator: Box<dyn Mutator<I>>,
    rng: ChaCha8Rng,
    iterations: u64,
}

impl<'c, I: Input + From<Vec<u8>>> WorkerContext<'c, I> {
    fn new(index: usize, campaign: &'c Campaign<I>) -> Self {
        WorkerContext {
            index,
            campaign,
            executor: (campaign.executor_factory)(index),
            mutator: (campaign.mutator_factory)(index),
            rng: ChaCha8Rng::seed_from_u64(
                campaign.options.master_seed.wrapping_add(index as u64),
            ),
            iterations: 0,
        }
    }

    /// Start-of-campaign work, done once before the pool spins up: dry-run
    /// configured seeds, adopt externally dropped files, and guarantee the
    /// scheduler has at least one entry to select.
    fn bootstrap(&mut self) -> anyhow::Result<()> {
        self.load_seeds()?;
        self.pickup_external()?;
        self.ensure_nonempty()
    }

    fn run_loop(&mut self) -> anyhow::Result<()> {
        let campaign = self.campaign;
        let mut last_stats = Instant::now();
        loop {
            if campaign.stop.load(Ordering::SeqCst) {
                break;
            }
            let ticket = campaign.tickets.fetch_add(1, Ordering::SeqCst);
            if ticket >= campaign.options.max_iterations {
                break;
            }
            self.iterations += 1;
            if campaign.options.external_scan_interval > 0
                && self.iterations % campaign.options.external_scan_interval == 0
            {
                self.pickup_external()?;
            }
            self.iterate()?;

            if self.index == 0 && last_stats.elapsed() >= campaign.options.stats_interval {
                campaign.log_stats();
                last_stats = Instant::now();
            }
        }
        Ok(())
    }

    /// One Scheduler → Mutator → Executor → Tracker → Store cycle.
    fn iterate(&mut self) -> anyhow::Result<()> {
        let campaign = self.campaign;

        let (base_id, base, partner) = {
            let mut sel = lock_ignoring_poison(&campaign.selection);
            let Selection { corpus, scheduler } = &mut *sel;
            let id = scheduler.next(corpus.as_mut(), &mut self.rng)?;
            let base = corpus
                .get(&id)
                .context("scheduler returned an id the store cannot resolve")?;
            let partner = corpus.random_payload(&mut self.rng).map(|(_, p)| p);
            (id, base, partner)
        };

        let candidate = self
            .mutator
            .mutate(Some(&base), &mut self.rng, partner.as_ref())?;
        let result = self.execute(&candidate)?;
        let novelty = campaign.tracker.evaluate(&result.signature);
        let crashed = matches!(result.outcome, Outcome::Crash(_));

        if crashed {
            self.record_crash(&candidate, &result, Some(base_id))?;
        }

        let outcome = if novelty.is_novel {
            let id = self.store_discovery(candidate, &result, &novelty, base_id, crashed)?;
            IterationOutcome::Stored(id)
        } else {
            IterationOutcome::Discarded
        };
        log::trace!("worker {}: {:?}", self.index, outcome);

        {
            let mut sel = lock_ignoring_poison(&campaign.selection);
            let Selection { corpus, scheduler } = &mut *sel;
            scheduler.report(corpus.as_mut(), &base_id, novelty.is_novel || crashed)?;
        }
        Ok(())
    }

    /// Runs the target and keeps the aggregate counters current.
    fn execute(&mut self, input: &I) -> anyhow::Result<ExecutionResult> {
        let campaign = self.campaign;
        let result = self
            .executor
            .run(input, campaign.options.timeout)
            .context("target execution failed")?;
        campaign.stats.executions.fetch_add(1, Ordering::Relaxed);
        match result.outcome {
            Outcome::Timeout => {
                campaign.stats.timeouts.fetch_add(1, Ordering::Relaxed);
                log::debug!("worker {}: target timed out", self.index);
            }
            Outcome::Crash(_) => {
                campaign.stats.crashes.fetch_add(1, Ordering::Relaxed);
            }
            Outcome::Ok => {}
        }
        Ok(result)
    }

    /// Minimizes a crashing candidate and writes it to the artifact
    /// directory. A crash that fails re-verification (flaky target) is
    /// archived unminimized rather than lost.
    fn record_crash(
        &mut self,
        candidate: &I,
        result: &ExecutionResult,
        parent: Option<EntryId>,
    ) -> anyhow::Result<()> {
        let campaign = self.campaign;
        let Some(report) = campaign.oracle.examine(candidate, result) else {
            return Ok(());
        };
        let original_size = candidate.len();

        let executor = &mut self.executor;
        let minimized = campaign
            .minimizer
            .minimize(candidate.as_bytes(), |bytes| {
                let trial = I::from(bytes.to_vec());
                let r = executor.run(&trial, campaign.options.timeout)?;
                campaign.stats.executions.fetch_add(1, Ordering::Relaxed);
                Ok(matches!(r.outcome, Outcome::Crash(_)))
            })
            .unwrap_or_else(|e| {
                log::warn!(
                    "worker {}: crash minimization failed ({e:#}), archiving original",
                    self.index
                );
                candidate.as_bytes().to_vec()
            });

        let record = ArtifactRecord {
            description: report.description,
            exit_signal: report.exit_signal,
            severity: report.severity,
            payload_hash: EntryId::of(&minimized),
            discovered_from: parent,
            original_size,
            minimized_size: minimized.len(),
            discovered_at_ms: unix_time_ms(),
        };
        campaign
            .artifacts
            .write(&minimized, &record)
            .context("failed to record crash artifact")?;
        Ok(())
    }

    /// Persists a coverage-novel candidate, optionally shrinking it first
    /// while preserving every unit that made it novel.
    fn store_discovery(
        &mut self,
        candidate: I,
        result: &ExecutionResult,
        novelty: &Novelty,
        parent: EntryId,
        crashed: bool,
    ) -> anyhow::Result<EntryId> {
        let campaign = self.campaign;
        let mut payload = candidate;
        let mut signature = result.signature.clone();

        if campaign.options.minimize_additions && !crashed && payload.len() > 1 {
            let required = novelty.new_units.clone();
            let executor = &mut self.executor;
            let shrunk = campaign.minimizer.minimize(payload.as_bytes(), |bytes| {
                let trial = I::from(bytes.to_vec());
                let r = executor.run(&trial, campaign.options.timeout)?;
                campaign.stats.executions.fetch_add(1, Ordering::Relaxed);
                Ok(matches!(r.outcome, Outcome::Ok) && required.is_subset(&r.signature))
            });
            match shrunk {
                Ok(bytes) if bytes.len() < payload.len() => {
                    // One more run so the stored signature describes the
                    // bytes actually stored.
                    let trial = I::from(bytes);
                    if let Ok(r) = self.executor.run(&trial, campaign.options.timeout) {
                        campaign.stats.executions.fetch_add(1, Ordering::Relaxed);
                        if required.is_subset(&r.signature) {
                            payload = trial;
                            signature = r.signature;
                        }
                    }
                }
                Ok(_) => {}
                Err(e) => log::debug!(
                    "worker {}: addition minimization skipped ({e:#})",
                    self.index
                ),
            }
        }

        let id = {
            let mut sel = lock_ignoring_poison(&campaign.selection);
            sel.corpus
                .put(payload, signature, Provenance::Mutated { parent })?
        };
        campaign.stats.discoveries.fetch_add(1, Ordering::Relaxed);
        log::info!(
            "worker {}: stored entry {} (+{} coverage units)",
            self.index,
            id,
            novelty.new_units.len()
        );
        Ok(id)
    }

    /// Dry-runs configured seed files so each enters the store with a real
    /// coverage signature. Redundant seeds are skipped, crashing seeds are
    /// archived.
    fn load_seeds(&mut self) -> anyhow::Result<()> {
        let campaign = self.campaign;
        let seeds = collect_seed_files(&campaign.options.seed_paths)?;
        for (path, bytes) in seeds {
            let payload = I::from(bytes);
            let result = self.execute(&payload)?;
            if matches!(result.outcome, Outcome::Crash(_)) {
                log::warn!("seed {:?} crashes the target", path);
                self.record_crash(&payload, &result, None)?;
            }
            let novelty = campaign.tracker.evaluate(&result.signature);
            if novelty.is_novel {
                let id = {
                    let mut sel = lock_ignoring_poison(&campaign.selection);
                    sel.corpus.put(
                        payload,
                        result.signature.clone(),
                        Provenance::Seed {
                            path: path.display().to_string(),
                        },
                    )?
                };
                campaign.stats.discoveries.fetch_add(1, Ordering::Relaxed);
                log::info!("seed {:?} stored as {}", path, id);
            } else {
                log::info!("seed {:?} adds no coverage, skipped", path);
            }
        }
        Ok(())
    }

    /// Adopts files dropped into the corpus directory by external tools.
    /// Each is dry-run like a seed; files that add no coverage are left in
    /// place for the operator.
    fn pickup_external(&mut self) -> anyhow::Result<()> {
        let campaign = self.campaign;
        let found = {
            let mut sel = lock_ignoring_poison(&campaign.selection);
            sel.corpus.take_external()?
        };
        for (path, payload) in found {
            let result = self.execute(&payload)?;
            if matches!(result.outcome, Outcome::Crash(_)) {
                log::warn!("external file {:?} crashes the target", path);
                self.record_crash(&payload, &result, None)?;
            }
            let novelty = campaign.tracker.evaluate(&result.signature);
            if novelty.is_novel {
                let id = {
                    let mut sel = lock_ignoring_poison(&campaign.selection);
                    sel.corpus.put(
                        payload,
                        result.signature.clone(),
                        Provenance::External {
                            path: path.display().to_string(),
                        },
                    )?
                };
                campaign.stats.discoveries.fetch_add(1, Ordering::Relaxed);
                log::info!("external file {:?} adopted as {}", path, id);
            } else {
                log::info!("external file {:?} adds no coverage, left in place", path);
            }
        }
        Ok(())
    }

    /// An uninstrumented target (or an all-redundant seed set) can leave
    /// the corpus empty, which would starve the scheduler forever. Store a
    /// canned payload so the mutation loop has somewhere to start.
    fn ensure_nonempty(&mut self) -> anyhow::Result<()> {
        let campaign = self.campaign;
        if !lock_ignoring_poison(&campaign.selection).corpus.is_empty() {
            return Ok(());
        }
        let payload = I::from(b"MAGPIE".to_vec());
        let result = self.execute(&payload)?;
        campaign.tracker.evaluate(&result.signature);
        {
            let mut sel = lock_ignoring_poison(&campaign.selection);
            sel.corpus.put(
                payload,
                result.signature,
                Provenance::Seed {
                    path: "<builtin>".to_string(),
                },
            )?;
        }
        campaign.stats.discoveries.fetch_add(1, Ordering::Relaxed);
        log::warn!("corpus was empty after seeding; stored built-in bootstrap entry");
        Ok(())
    }
}
