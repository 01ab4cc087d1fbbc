//! Isolated, disposable execution environments for untrusted programs.
//!
//! The rest of the pipeline only ever sees the [`Sandbox`] trait and its
//! typed outcomes. Submitter-caused results ([`ExecutionOutcome`],
//! [`CompileOutcome::Error`]) and infrastructure failures ([`SandboxFault`])
//! travel on separate channels so that retry logic upstream never confuses
//! the two.

pub mod docker;
pub(crate) mod util;

use async_trait::async_trait;
use bytes::Bytes;
use err_derive::Error;
use serde::{Deserialize, Serialize};

use crate::model::{Language, TestCase};

pub use docker::{DockerSandbox, DockerSandboxConfig, DockerSandboxConfigBuilder};

/// Numeric limits enforced on a single program run.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourceLimits {
    pub time_limit_ms: u64,
    pub memory_limit_kb: u64,
    pub output_limit_bytes: u64,
}

impl ResourceLimits {
    /// Fixed generous limits for the compile step. Compilation is trusted
    /// tooling running over untrusted input, so it still runs inside the
    /// sandbox, just with more headroom than a test case.
    pub fn for_compile() -> ResourceLimits {
        ResourceLimits {
            time_limit_ms: 30_000,
            memory_limit_kb: 512 * 1024,
            output_limit_bytes: 256 * 1024,
        }
    }
}

impl From<&TestCase> for ResourceLimits {
    fn from(case: &TestCase) -> Self {
        ResourceLimits {
            time_limit_ms: case.time_limit_ms,
            memory_limit_kb: case.memory_limit_kb,
            output_limit_bytes: case.output_limit_bytes,
        }
    }
}

/// A compiled (or pass-through) program ready to be executed, produced once
/// per submission and shipped into a fresh environment for every test case.
#[derive(Debug, Clone)]
pub enum Artifact {
    /// Interpreted languages run straight from source.
    Source { language: Language, code: String },
    /// Compiled languages carry the build output as an archive produced by
    /// the sandbox that built it.
    Binary { language: Language, archive: Bytes },
}

impl Artifact {
    pub fn language(&self) -> Language {
        match self {
            Artifact::Source { language, .. } => *language,
            Artifact::Binary { language, .. } => *language,
        }
    }
}

/// Result of the compile step.
#[derive(Debug, Clone)]
pub enum CompileOutcome {
    Success(Artifact),
    /// The submitter's code failed to build. `message` is a sanitized
    /// compiler output excerpt.
    Error { message: String },
}

/// Result of running one program against one test case input.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExecutionOutcome {
    Completed {
        stdout: String,
        exit_code: i64,
        time_ms: u64,
        memory_kb: u64,
    },
    TimeLimitExceeded {
        time_ms: u64,
    },
    MemoryLimitExceeded {
        memory_kb: u64,
    },
    RuntimeError {
        exit_code: i64,
        stderr_excerpt: String,
    },
    OutputLimitExceeded,
}

/// Infrastructure failure: the judge broke, not the submission. Always
/// retryable, never surfaced as a submitter outcome.
#[derive(Debug, Error)]
pub enum SandboxFault {
    #[error(display = "docker error: {}", _0)]
    Docker(#[error(source)] bollard::errors::Error),

    #[error(display = "IO error: {}", _0)]
    Io(#[error(source)] std::io::Error),

    #[error(display = "sandbox internal error: {}", _0)]
    Internal(String),
}

/// An isolated executor for untrusted code.
///
/// Implementations must guarantee that every invocation runs in a fresh
/// environment with no filesystem, network or process visibility beyond what
/// the language runtime strictly needs, and that no state leaks between
/// invocations.
#[async_trait]
pub trait Sandbox: Send + Sync {
    /// Compile the submission once. Languages without a compile step pass
    /// the source through untouched.
    async fn compile(
        &self,
        code: &str,
        language: Language,
        limits: &ResourceLimits,
    ) -> Result<CompileOutcome, SandboxFault>;

    /// Run the compiled artifact against one test case input in a fresh
    /// environment, enforcing `limits`.
    async fn execute(
        &self,
        artifact: &Artifact,
        input: &str,
        limits: &ResourceLimits,
    ) -> Result<ExecutionOutcome, SandboxFault>;
}
