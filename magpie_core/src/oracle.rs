use crate::coverage::EntryId;
use crate::executor::{ExecutionResult, Outcome};
use crate::input::Input;

/// Default severity level for crashes detected by `CrashOracle`.
/// Higher values might indicate more severe issues.
const DEFAULT_CRASH_SEVERITY: u8 = 10;

/// Represents a potential bug identified by an `Oracle`.
#[derive(Debug)]
pub struct BugReport<I: Input> {
    /// The specific input that triggered this bug report.
    pub input: I,
    /// A human-readable description of the bug or finding.
    pub description: String,
    /// Content hash of the input, useful for deduplication and for naming
    /// the artifact files.
    pub input_hash: EntryId,
    /// A numerical representation of the bug's severity.
    pub severity: u8,
    /// Signal that terminated the target, if any (Unix).
    pub exit_signal: Option<i32>,
}

/// An `Oracle` examines the outcome of a target's execution to determine if
/// a bug has occurred.
///
/// Oracles are the policy seam between "the run ended abnormally" and "this
/// is a finding worth keeping": crash detection, hang detection, or custom
/// target-specific checks all live behind this trait.
pub trait Oracle<I: Input>: Send + Sync {
    /// Examines one execution result.
    ///
    /// # Returns
    /// `Some(BugReport)` if a bug is detected, otherwise `None`.
    fn examine(&self, input: &I, result: &ExecutionResult) -> Option<BugReport<I>>;
}

/// A simple `Oracle` that reports a bug whenever the outcome is a crash.
#[derive(Debug, Default)]
pub struct CrashOracle;

impl CrashOracle {
    /// Creates a new `CrashOracle`.
    pub fn new() -> Self {
        CrashOracle
    }
}

impl<I: Input> Oracle<I> for CrashOracle {
    fn examine(&self, input: &I, result: &ExecutionResult) -> Option<BugReport<I>> {
        match &result.outcome {
            Outcome::Crash(description) => Some(BugReport {
                input: input.clone(),
                description: description.clone(),
                input_hash: EntryId::of(input.as_bytes()),
                severity: DEFAULT_CRASH_SEVERITY,
                exit_signal: result.exit_signal,
            }),
            _ => None,
        }
    }
}
