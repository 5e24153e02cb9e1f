pub mod artifacts;
pub mod config;
pub mod corpus;
pub mod coverage;
pub mod executor;
pub mod fuzzer;
pub mod input;
pub mod minimizer;
pub mod mutator;
pub mod oracle;
pub mod scheduler;

pub use artifacts::{ArtifactRecord, ArtifactSink};
pub use config::MagpieConfig;
pub use corpus::{Corpus, CorpusError, InMemoryCorpus, OnDiskCorpus, Provenance};
pub use coverage::{CoverageSignature, CoverageTracker, EntryId, Novelty};
pub use executor::{
    CommandExecutor, CommandExecutorConfig, ExecError, ExecutionResult, Executor,
    InProcessExecutor, InputDelivery, Outcome,
};
pub use fuzzer::{Campaign, CampaignOptions, CampaignSummary};
pub use input::Input;
pub use minimizer::Minimizer;
pub use mutator::{HavocMutator, Mutator};
pub use oracle::{BugReport, CrashOracle, Oracle};
pub use scheduler::{RandomScheduler, Scheduler, SchedulerError, WeightedEnergyScheduler};
