//! The verdict state machine: drives one submission through compilation and
//! its problem's test cases, in order, and derives the final [`Verdict`].
//!
//! Policy decisions live elsewhere: resource limits come from the test case,
//! output comparison from the problem, retry tuning from [`RetryConfig`].
//! This module only sequences them.

pub mod compare;

use std::{sync::Arc, time::Duration};

use err_derive::Error;
use rand::Rng;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc::Sender;

use crate::{
    model::{
        CaseOutcome, JudgeEvent, JudgeStage, Problem, ProblemConfigError, Submission,
        SubmissionId, TestCase, TestCaseResult, Verdict, VerdictStatus,
    },
    prelude::{CancellationTokenHandle, WithCancelExt},
    sandbox::{Artifact, CompileOutcome, ExecutionOutcome, ResourceLimits, Sandbox, SandboxFault},
};

/// Cap on the diff excerpt recorded for a wrong answer.
const DIFF_EXCERPT_BYTES: usize = 2048;

/// Retry policy for sandbox faults. Only infrastructure failures are ever
/// retried; submitter-caused outcomes are final on first sight.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
#[serde(rename_all = "camelCase")]
pub struct RetryConfig {
    /// Total attempts per sandbox call, including the first.
    pub max_attempts: u32,
    /// Base delay for exponential backoff between attempts.
    pub base_delay_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        RetryConfig {
            max_attempts: 3,
            base_delay_ms: 250,
        }
    }
}

impl RetryConfig {
    /// Exponential backoff with jitter. `attempt` counts the failures so
    /// far, starting at 1.
    fn delay_for(&self, attempt: u32) -> Duration {
        let base = self.base_delay_ms << (attempt - 1).min(8);
        let jitter = rand::thread_rng().gen_range(0..=self.base_delay_ms / 2);
        Duration::from_millis(base + jitter)
    }
}

/// Errors that abort judging without producing a verdict. Submitter-caused
/// failures never end up here; they are verdict statuses.
#[derive(Debug, Error)]
pub enum JudgeError {
    #[error(display = "invalid problem configuration: {}", _0)]
    InvalidProblem(#[error(source)] ProblemConfigError),

    #[error(display = "event sink closed while judging")]
    SinkClosed,
}

/// Result of a retried sandbox call.
enum Attempted<T> {
    Done(T),
    /// All retries exhausted on infrastructure faults.
    Exhausted,
    Cancelled,
}

pub struct TestRunner {
    sandbox: Arc<dyn Sandbox>,
    retry: RetryConfig,
}

impl TestRunner {
    pub fn new(sandbox: Arc<dyn Sandbox>, retry: RetryConfig) -> TestRunner {
        TestRunner { sandbox, retry }
    }

    /// Judge one submission: compile once, then run test cases in order,
    /// stopping at the first failure.
    ///
    /// Always returns a [`Verdict`] unless the problem is structurally
    /// invalid or the event sink has gone away.
    pub async fn judge(
        &self,
        problem: &Problem,
        submission: &Submission,
        cancel: &CancellationTokenHandle,
        events: &Sender<JudgeEvent>,
    ) -> Result<Verdict, JudgeError> {
        problem.validate()?;
        let submission_id = submission.id.clone();

        self.send_progress(events, &submission_id, JudgeStage::Compiling)
            .await?;

        let artifact = match self.compile_with_retry(submission, cancel).await {
            Attempted::Done(CompileOutcome::Success(artifact)) => artifact,
            Attempted::Done(CompileOutcome::Error { message }) => {
                tracing::info!(%submission_id, "Compilation failed");
                return Ok(Verdict::from_case_results(
                    submission_id,
                    VerdictStatus::CompileError,
                    vec![],
                )
                .with_diagnostic(message));
            }
            Attempted::Exhausted => {
                return Ok(Verdict::from_case_results(
                    submission_id,
                    VerdictStatus::SandboxError,
                    vec![],
                )
                .with_diagnostic("judge infrastructure failure, not caused by the submission"));
            }
            Attempted::Cancelled => {
                return Ok(Verdict::from_case_results(
                    submission_id,
                    VerdictStatus::Cancelled,
                    vec![],
                ));
            }
        };

        let mut case_results: Vec<TestCaseResult> = vec![];

        for (index, case) in problem.test_cases.iter().enumerate() {
            if cancel.is_cancelled() {
                return Ok(Verdict::from_case_results(
                    submission_id,
                    VerdictStatus::Cancelled,
                    case_results,
                ));
            }

            let case_index = index as u32;
            self.send_progress(
                events,
                &submission_id,
                JudgeStage::Running { case: case_index },
            )
            .await?;

            let limits = ResourceLimits::from(case);
            let outcome = match self
                .execute_with_retry(&artifact, &case.input, &limits, cancel)
                .await
            {
                Attempted::Done(outcome) => outcome,
                Attempted::Exhausted => {
                    let result = TestCaseResult {
                        submission_id: submission_id.clone(),
                        case_index,
                        outcome: CaseOutcome::SandboxError,
                        time_ms: 0,
                        memory_kb: 0,
                        diagnostic: None,
                    };
                    events
                        .send(JudgeEvent::Case(result.clone()))
                        .await
                        .map_err(|_| JudgeError::SinkClosed)?;
                    case_results.push(result);
                    return Ok(Verdict::from_case_results(
                        submission_id,
                        VerdictStatus::SandboxError,
                        case_results,
                    )
                    .with_diagnostic(
                        "judge infrastructure failure, not caused by the submission",
                    ));
                }
                Attempted::Cancelled => {
                    return Ok(Verdict::from_case_results(
                        submission_id,
                        VerdictStatus::Cancelled,
                        case_results,
                    ));
                }
            };

            let result = self.case_result(&submission_id, case_index, outcome, problem, case);
            events
                .send(JudgeEvent::Case(result.clone()))
                .await
                .map_err(|_| JudgeError::SinkClosed)?;
            let outcome = result.outcome;
            case_results.push(result);

            // Fail fast: the first non-passing case decides the verdict and
            // no later case runs.
            if outcome != CaseOutcome::Passed {
                tracing::info!(%submission_id, case = case_index, ?outcome, "Case failed, stopping");
                return Ok(Verdict::from_case_results(
                    submission_id,
                    outcome.into(),
                    case_results,
                ));
            }
        }

        tracing::info!(%submission_id, cases = case_results.len(), "All cases passed");
        Ok(Verdict::from_case_results(
            submission_id,
            VerdictStatus::Accepted,
            case_results,
        ))
    }

    fn case_result(
        &self,
        submission_id: &SubmissionId,
        case_index: u32,
        outcome: ExecutionOutcome,
        problem: &Problem,
        case: &TestCase,
    ) -> TestCaseResult {
        let (outcome, time_ms, memory_kb, diagnostic) = match outcome {
            ExecutionOutcome::Completed {
                stdout,
                exit_code: _,
                time_ms,
                memory_kb,
            } => {
                if compare::outputs_match(&problem.comparator, &stdout, &case.expected_output) {
                    (CaseOutcome::Passed, time_ms, memory_kb, None)
                } else {
                    let diff =
                        compare::diff_excerpt(&stdout, &case.expected_output, DIFF_EXCERPT_BYTES);
                    (CaseOutcome::WrongAnswer, time_ms, memory_kb, Some(diff))
                }
            }
            ExecutionOutcome::TimeLimitExceeded { time_ms } => {
                (CaseOutcome::TimeLimitExceeded, time_ms, 0, None)
            }
            ExecutionOutcome::MemoryLimitExceeded { memory_kb } => {
                (CaseOutcome::MemoryLimitExceeded, 0, memory_kb, None)
            }
            ExecutionOutcome::RuntimeError {
                exit_code,
                stderr_excerpt,
            } => (
                CaseOutcome::RuntimeError,
                0,
                0,
                Some(format!("exit code {}: {}", exit_code, stderr_excerpt)),
            ),
            ExecutionOutcome::OutputLimitExceeded => (CaseOutcome::OutputLimitExceeded, 0, 0, None),
        };
        TestCaseResult {
            submission_id: submission_id.clone(),
            case_index,
            outcome,
            time_ms,
            memory_kb,
            diagnostic,
        }
    }

    async fn compile_with_retry(
        &self,
        submission: &Submission,
        cancel: &CancellationTokenHandle,
    ) -> Attempted<CompileOutcome> {
        let limits = ResourceLimits::for_compile();
        let mut failures = 0;
        loop {
            let res = self
                .sandbox
                .compile(&submission.code, submission.language, &limits)
                .with_cancel(cancel.cancelled())
                .await;
            match res {
                None => return Attempted::Cancelled,
                Some(Ok(outcome)) => return Attempted::Done(outcome),
                Some(Err(fault)) => {
                    failures += 1;
                    if self.retries_exhausted("compile", failures, &fault) {
                        return Attempted::Exhausted;
                    }
                    if self.backoff(failures, cancel).await.is_none() {
                        return Attempted::Cancelled;
                    }
                }
            }
        }
    }

    async fn execute_with_retry(
        &self,
        artifact: &Artifact,
        input: &str,
        limits: &ResourceLimits,
        cancel: &CancellationTokenHandle,
    ) -> Attempted<ExecutionOutcome> {
        let mut failures = 0;
        loop {
            let res = self
                .sandbox
                .execute(artifact, input, limits)
                .with_cancel(cancel.cancelled())
                .await;
            match res {
                None => return Attempted::Cancelled,
                Some(Ok(outcome)) => return Attempted::Done(outcome),
                Some(Err(fault)) => {
                    failures += 1;
                    if self.retries_exhausted("execute", failures, &fault) {
                        return Attempted::Exhausted;
                    }
                    if self.backoff(failures, cancel).await.is_none() {
                        return Attempted::Cancelled;
                    }
                }
            }
        }
    }

    fn retries_exhausted(&self, stage: &str, failures: u32, fault: &SandboxFault) -> bool {
        if failures >= self.retry.max_attempts {
            tracing::error!(stage, failures, "Sandbox fault, retries exhausted: {}", fault);
            true
        } else {
            tracing::warn!(stage, failures, "Sandbox fault, will retry: {}", fault);
            false
        }
    }

    async fn backoff(&self, failures: u32, cancel: &CancellationTokenHandle) -> Option<()> {
        tokio::time::sleep(self.retry.delay_for(failures))
            .with_cancel(cancel.cancelled())
            .await
    }

    async fn send_progress(
        &self,
        events: &Sender<JudgeEvent>,
        submission_id: &SubmissionId,
        stage: JudgeStage,
    ) -> Result<(), JudgeError> {
        events
            .send(JudgeEvent::Progress {
                submission_id: submission_id.clone(),
                stage,
            })
            .await
            .map_err(|_| JudgeError::SinkClosed)
    }
}
