//! Value records exchanged with the persistence collaborator.
//!
//! The judging core treats [`Problem`] and [`Submission`] as read-only inputs
//! and produces [`Verdict`], [`PlagiarismFlag`] and [`LeaderboardEntry`]
//! records it does not persist itself. Everything here is a plain
//! serializable value; mutation happens in the pipeline, never on these
//! records.

use chrono::{DateTime, Utc};
use err_derive::Error;
use serde::{Deserialize, Serialize};
use std::{fmt, str::FromStr, sync::Arc};

macro_rules! id_newtype {
    ($(#[$doc:meta])* $name:ident) => {
        $(#[$doc])*
        #[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(pub Arc<str>);

        impl $name {
            pub fn new(id: impl AsRef<str>) -> Self {
                Self(id.as_ref().into())
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl From<&str> for $name {
            fn from(s: &str) -> Self {
                Self::new(s)
            }
        }
    };
}

id_newtype! {
    /// Identifier of a problem, minted by the collaborator.
    ProblemId
}
id_newtype! {
    /// Identifier of a submission. Exactly one judging attempt maps to one
    /// submission id; resubmission creates a new id.
    SubmissionId
}
id_newtype! {
    /// Identifier of a contestant.
    UserId
}

/// Languages the sandbox knows how to build and run.
///
/// The collaborator sends free-form language tags; unknown tags are rejected
/// as a structural error before anything executes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Language {
    Python,
    C,
    Cpp,
}

impl Language {
    /// Whether a separate compile step is required before running.
    pub fn requires_compilation(self) -> bool {
        !matches!(self, Language::Python)
    }

    /// File name the submitted source is materialized under.
    pub fn source_file_name(self) -> &'static str {
        match self {
            Language::Python => "main.py",
            Language::C => "main.c",
            Language::Cpp => "main.cpp",
        }
    }
}

impl FromStr for Language {
    type Err = ProblemConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "python" | "python3" | "py" => Ok(Language::Python),
            "c" => Ok(Language::C),
            "cpp" | "c++" | "cxx" => Ok(Language::Cpp),
            _ => Err(ProblemConfigError::UnknownLanguage { tag: s.to_owned() }),
        }
    }
}

impl fmt::Display for Language {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Language::Python => f.write_str("python"),
            Language::C => f.write_str("c"),
            Language::Cpp => f.write_str("cpp"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Difficulty {
    Easy,
    Medium,
    Hard,
}

/// How a problem wants program output compared against the expected output.
///
/// A declared property of the [`Problem`], never hardcoded in the runner.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind")]
#[serde(rename_all = "camelCase")]
pub enum ComparatorPolicy {
    /// Exact byte match after trailing-whitespace normalization.
    Exact,
    /// Token-wise numeric comparison within `epsilon`; non-numeric tokens
    /// still compare exactly.
    FloatTolerance { epsilon: f64 },
}

impl Default for ComparatorPolicy {
    fn default() -> Self {
        ComparatorPolicy::Exact
    }
}

fn default_output_limit() -> u64 {
    // 16 MiB of captured stdout before the run is cut off.
    16 * 1024 * 1024
}

/// One (input, expected output) pair with its own resource limits.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TestCase {
    pub input: String,
    pub expected_output: String,
    pub time_limit_ms: u64,
    pub memory_limit_kb: u64,
    /// Cap on captured stdout, to stop output flooding.
    #[serde(default = "default_output_limit")]
    pub output_limit_bytes: u64,
}

/// An immutable problem statement as far as judging is concerned: the hidden
/// test cases and how to compare against them.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Problem {
    pub id: ProblemId,
    pub test_cases: Vec<TestCase>,
    #[serde(default)]
    pub comparator: ComparatorPolicy,
    pub difficulty: Difficulty,
    /// Points awarded for the first accepted submission, consumed by the
    /// scoring policy.
    pub score_value: u32,
}

impl Problem {
    /// Structural validation, run before any execution. A malformed problem
    /// is a configuration error, not a verdict.
    pub fn validate(&self) -> Result<(), ProblemConfigError> {
        if self.test_cases.is_empty() {
            return Err(ProblemConfigError::NoTestCases {
                problem: self.id.clone(),
            });
        }
        for (index, case) in self.test_cases.iter().enumerate() {
            if case.time_limit_ms == 0 {
                return Err(ProblemConfigError::ZeroTimeLimit { case_index: index });
            }
            if case.memory_limit_kb == 0 {
                return Err(ProblemConfigError::ZeroMemoryLimit { case_index: index });
            }
        }
        Ok(())
    }
}

/// A single judging attempt's input. The source code is an immutable blob;
/// status lives in the pipeline and its resulting [`Verdict`], not here.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Submission {
    pub id: SubmissionId,
    pub user_id: UserId,
    pub problem_id: ProblemId,
    pub code: String,
    pub language: Language,
    pub submitted_at: DateTime<Utc>,
}

/// Outcome kind of one executed test case.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum CaseOutcome {
    Passed,
    WrongAnswer,
    TimeLimitExceeded,
    MemoryLimitExceeded,
    RuntimeError,
    OutputLimitExceeded,
    /// Infrastructure failure, surfaced only after retries exhaust. Never
    /// the submitter's fault.
    SandboxError,
}

/// Write-once record of one (submission, test case) execution.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TestCaseResult {
    pub submission_id: SubmissionId,
    pub case_index: u32,
    pub outcome: CaseOutcome,
    pub time_ms: u64,
    pub memory_kb: u64,
    /// Sanitized excerpt shown to the submitter: an output diff or the tail
    /// of stderr. Never raw sandbox internals.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub diagnostic: Option<String>,
}

/// Terminal status of a judging attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum VerdictStatus {
    Accepted,
    WrongAnswer,
    TimeLimitExceeded,
    MemoryLimitExceeded,
    RuntimeError,
    CompileError,
    OutputLimitExceeded,
    /// The judge broke, not the submitter's code. Operators care about the
    /// difference.
    SandboxError,
    Cancelled,
}

impl VerdictStatus {
    /// Statuses caused by the submitted program itself. These count as
    /// attempts for scoring; infrastructure failures and cancellations do
    /// not.
    pub fn is_submitter_outcome(self) -> bool {
        !matches!(self, VerdictStatus::SandboxError | VerdictStatus::Cancelled)
    }
}

impl From<CaseOutcome> for VerdictStatus {
    fn from(outcome: CaseOutcome) -> Self {
        match outcome {
            CaseOutcome::Passed => VerdictStatus::Accepted,
            CaseOutcome::WrongAnswer => VerdictStatus::WrongAnswer,
            CaseOutcome::TimeLimitExceeded => VerdictStatus::TimeLimitExceeded,
            CaseOutcome::MemoryLimitExceeded => VerdictStatus::MemoryLimitExceeded,
            CaseOutcome::RuntimeError => VerdictStatus::RuntimeError,
            CaseOutcome::OutputLimitExceeded => VerdictStatus::OutputLimitExceeded,
            CaseOutcome::SandboxError => VerdictStatus::SandboxError,
        }
    }
}

/// Final judgment for a submission, derived entirely from its case results.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Verdict {
    pub submission_id: SubmissionId,
    pub status: VerdictStatus,
    /// Max across executed cases. Cases skipped by fail-fast never ran and
    /// do not contribute.
    pub execution_time_ms: u64,
    pub memory_used_kb: u64,
    pub per_case_results: Vec<TestCaseResult>,
    /// Sanitized top-level diagnostic, e.g. a compile error excerpt.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub diagnostic: Option<String>,
}

impl Verdict {
    /// Build a verdict from the recorded case results, aggregating resource
    /// usage as the max across executed cases.
    pub fn from_case_results(
        submission_id: SubmissionId,
        status: VerdictStatus,
        per_case_results: Vec<TestCaseResult>,
    ) -> Verdict {
        let execution_time_ms = per_case_results.iter().map(|c| c.time_ms).max().unwrap_or(0);
        let memory_used_kb = per_case_results
            .iter()
            .map(|c| c.memory_kb)
            .max()
            .unwrap_or(0);
        Verdict {
            submission_id,
            status,
            execution_time_ms,
            memory_used_kb,
            per_case_results,
            diagnostic: None,
        }
    }

    pub fn with_diagnostic(mut self, diagnostic: impl Into<String>) -> Verdict {
        self.diagnostic = Some(diagnostic.into());
        self
    }
}

/// Advisory similarity decision for one ordered submission pair.
///
/// The similarity metric is asymmetric: `similarity` is measured against
/// `submission_a`'s token set, so (a, b) and (b, a) are distinct pairs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlagiarismFlag {
    pub submission_a: SubmissionId,
    pub submission_b: SubmissionId,
    /// Percentage in 0..=100.
    pub similarity: u8,
    pub flagged: bool,
}

/// One row of the derived leaderboard view.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LeaderboardEntry {
    pub user_id: UserId,
    pub score: i64,
    /// Competition rank: tied scores share a rank, the next distinct score
    /// skips the tied count.
    pub rank: u32,
}

/// Progress stages of a judging attempt, reported through the event sink.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum JudgeStage {
    Queued,
    Compiling,
    Running { case: u32 },
    Finished,
    Cancelled,
}

/// Events emitted by the judging core towards the collaborator.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "_t")]
#[serde(rename_all = "camelCase")]
pub enum JudgeEvent {
    #[serde(rename = "progress")]
    Progress {
        submission_id: SubmissionId,
        stage: JudgeStage,
    },

    #[serde(rename = "case_result")]
    Case(TestCaseResult),

    #[serde(rename = "verdict")]
    Verdict(Verdict),

    #[serde(rename = "plagiarism")]
    Plagiarism(PlagiarismFlag),

    #[serde(rename = "leaderboard")]
    Leaderboard(LeaderboardEntry),
}

/// Structural errors: the submission is rejected before anything executes.
/// Distinct from verdicts (submitter outcomes) and sandbox faults
/// (infrastructure).
#[derive(Debug, Clone, Error)]
pub enum ProblemConfigError {
    #[error(display = "problem {} declares no test cases", problem)]
    NoTestCases { problem: ProblemId },

    #[error(display = "test case {} declares a zero time limit", case_index)]
    ZeroTimeLimit { case_index: usize },

    #[error(display = "test case {} declares a zero memory limit", case_index)]
    ZeroMemoryLimit { case_index: usize },

    #[error(display = "unknown language tag `{}`", tag)]
    UnknownLanguage { tag: String },

    #[error(
        display = "submission references problem {} but was judged against {}",
        referenced,
        judged
    )]
    ProblemMismatch {
        referenced: ProblemId,
        judged: ProblemId,
    },
}
