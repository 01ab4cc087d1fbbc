//! Tests for the verdict state machine in [`crate::runner`].

use std::sync::Arc;

use pretty_assertions::assert_eq;
use test_env_log::test;

use super::util::{collect_events, make_problem, make_submission, MockSandbox};
use crate::{
    model::{CaseOutcome, ComparatorPolicy, JudgeEvent, JudgeStage, Verdict, VerdictStatus},
    prelude::CancellationTokenHandle,
    runner::{JudgeError, RetryConfig, TestRunner},
};

/// Retry quickly in tests; the backoff delays are irrelevant here.
fn fast_retry() -> RetryConfig {
    RetryConfig {
        max_attempts: 3,
        base_delay_ms: 1,
    }
}

async fn judge_with(
    sandbox: &Arc<MockSandbox>,
    problem: &crate::model::Problem,
    submission: &crate::model::Submission,
) -> (Result<Verdict, JudgeError>, Vec<JudgeEvent>) {
    let runner = TestRunner::new(sandbox.clone(), fast_retry());
    let (events_tx, events_rx) = tokio::sync::mpsc::channel(256);
    let cancel = CancellationTokenHandle::new();
    let verdict = runner
        .judge(problem, submission, &cancel, &events_tx)
        .await;
    drop(events_tx);
    let events = collect_events(events_rx).await;
    (verdict, events)
}

#[test(tokio::test)]
async fn test_all_cases_pass() {
    let sandbox = Arc::new(MockSandbox::new());
    sandbox.when("1 2").completes_in("3", 20, 900).finish();
    sandbox.when("5 5").completes_in("10", 35, 1200).finish();

    let problem = make_problem("p1", &[("1 2", "3"), ("5 5", "10")]);
    let submission = make_submission("s1", "alice", "p1", "print(sum(map(int, input().split())))");

    let (verdict, _events) = judge_with(&sandbox, &problem, &submission).await;
    let verdict = verdict.unwrap();

    assert_eq!(verdict.status, VerdictStatus::Accepted);
    assert_eq!(verdict.per_case_results.len(), 2);
    // Aggregates are the max across executed cases.
    assert_eq!(verdict.execution_time_ms, 35);
    assert_eq!(verdict.memory_used_kb, 1200);
}

/// The end-to-end example: a program that always prints "4" passes the first
/// case and mismatches the second.
#[test(tokio::test)]
async fn test_wrong_answer_on_second_case() {
    let sandbox = Arc::new(MockSandbox::new());
    sandbox.when("2 2").completes_with("4").finish();
    sandbox.when("3 3").completes_with("4").finish();

    let problem = make_problem("p1", &[("2 2", "4"), ("3 3", "6")]);
    let submission = make_submission("s1", "alice", "p1", "print(4)");

    let (verdict, events) = judge_with(&sandbox, &problem, &submission).await;
    let verdict = verdict.unwrap();

    assert_eq!(verdict.status, VerdictStatus::WrongAnswer);
    assert_eq!(verdict.per_case_results.len(), 2);
    assert_eq!(verdict.per_case_results[0].outcome, CaseOutcome::Passed);
    assert_eq!(verdict.per_case_results[1].outcome, CaseOutcome::WrongAnswer);
    // The mismatch diagnostic is a diff excerpt.
    let diff = verdict.per_case_results[1].diagnostic.as_ref().unwrap();
    assert!(diff.contains("- 4"));
    assert!(diff.contains("+ 6"));

    let stages: Vec<JudgeStage> = events
        .iter()
        .filter_map(|e| match e {
            JudgeEvent::Progress { stage, .. } => Some(*stage),
            _ => None,
        })
        .collect();
    assert_eq!(
        stages,
        vec![
            JudgeStage::Compiling,
            JudgeStage::Running { case: 0 },
            JudgeStage::Running { case: 1 },
        ]
    );
}

/// Fail-fast: no case after the first failing one runs or records a result.
#[test(tokio::test)]
async fn test_fail_fast_skips_later_cases() {
    let sandbox = Arc::new(MockSandbox::new());
    sandbox.when("a").completes_with("ok").finish();
    sandbox.when("b").runtime_error(139, "segfault").finish();
    sandbox.when("c").completes_with("never reached").finish();

    let problem = make_problem("p1", &[("a", "ok"), ("b", "ok"), ("c", "ok")]);
    let submission = make_submission("s1", "alice", "p1", "boom()");

    let (verdict, events) = judge_with(&sandbox, &problem, &submission).await;
    let verdict = verdict.unwrap();

    assert_eq!(verdict.status, VerdictStatus::RuntimeError);
    assert_eq!(sandbox.executed_inputs(), vec!["a", "b"]);
    assert_eq!(verdict.per_case_results.len(), 2);
    assert_eq!(
        verdict.per_case_results[1].diagnostic.as_deref(),
        Some("exit code 139: segfault")
    );
    // No case event for the skipped third case either.
    let case_indices: Vec<u32> = events
        .iter()
        .filter_map(|e| match e {
            JudgeEvent::Case(result) => Some(result.case_index),
            _ => None,
        })
        .collect();
    assert_eq!(case_indices, vec![0, 1]);
}

#[test(tokio::test)]
async fn test_compile_error_short_circuits() {
    let sandbox = Arc::new(MockSandbox::new());
    sandbox.fail_compile("main.c:1:1: error: expected expression");

    let problem = make_problem("p1", &[("2 2", "4")]);
    let submission = make_submission("s1", "alice", "p1", "int main( {");

    let (verdict, _events) = judge_with(&sandbox, &problem, &submission).await;
    let verdict = verdict.unwrap();

    assert_eq!(verdict.status, VerdictStatus::CompileError);
    assert!(verdict.per_case_results.is_empty());
    assert_eq!(sandbox.execution_count(), 0);
    assert!(verdict.diagnostic.unwrap().contains("expected expression"));
}

#[test(tokio::test)]
async fn test_time_limit_exceeded_stays_near_limit() {
    let sandbox = Arc::new(MockSandbox::new());
    // The sandbox cuts the run off just past the 1000 ms limit.
    sandbox.when("2 2").times_out(1042).finish();

    let problem = make_problem("p1", &[("2 2", "4")]);
    let submission = make_submission("s1", "alice", "p1", "while True: pass");

    let (verdict, _events) = judge_with(&sandbox, &problem, &submission).await;
    let verdict = verdict.unwrap();

    assert_eq!(verdict.status, VerdictStatus::TimeLimitExceeded);
    assert!(verdict.execution_time_ms >= 1000);
    assert!(verdict.execution_time_ms <= 1000 + 50);
}

#[test(tokio::test)]
async fn test_memory_and_output_limits() {
    let sandbox = Arc::new(MockSandbox::new());
    sandbox.when("m").exceeds_memory(70000).finish();
    sandbox.when("o").floods_output().finish();

    let problem = make_problem("p1", &[("m", "x")]);
    let submission = make_submission("s1", "alice", "p1", "a = [0] * 10**9");
    let (verdict, _) = judge_with(&sandbox, &problem, &submission).await;
    let verdict = verdict.unwrap();
    assert_eq!(verdict.status, VerdictStatus::MemoryLimitExceeded);
    assert_eq!(verdict.memory_used_kb, 70000);

    let problem = make_problem("p1", &[("o", "x")]);
    let submission = make_submission("s2", "alice", "p1", "while True: print(1)");
    let (verdict, _) = judge_with(&sandbox, &problem, &submission).await;
    assert_eq!(verdict.unwrap().status, VerdictStatus::OutputLimitExceeded);
}

/// Infrastructure faults are retried without advancing the case index.
#[test(tokio::test)]
async fn test_sandbox_fault_retried_then_succeeds() {
    let sandbox = Arc::new(MockSandbox::new());
    sandbox.when("2 2").faults().completes_with("4").finish();

    let problem = make_problem("p1", &[("2 2", "4")]);
    let submission = make_submission("s1", "alice", "p1", "print(4)");

    let (verdict, _events) = judge_with(&sandbox, &problem, &submission).await;
    assert_eq!(verdict.unwrap().status, VerdictStatus::Accepted);
    // First attempt faulted, the retry ran the same input again.
    assert_eq!(sandbox.executed_inputs(), vec!["2 2", "2 2"]);
}

#[test(tokio::test)]
async fn test_sandbox_fault_exhausts_to_sandbox_error() {
    let sandbox = Arc::new(MockSandbox::new());
    sandbox.when("2 2").faults().finish();

    let problem = make_problem("p1", &[("2 2", "4"), ("3 3", "6")]);
    let submission = make_submission("s1", "alice", "p1", "print(4)");

    let (verdict, _events) = judge_with(&sandbox, &problem, &submission).await;
    let verdict = verdict.unwrap();

    assert_eq!(verdict.status, VerdictStatus::SandboxError);
    // All three attempts hit case 0; case 1 never ran.
    assert_eq!(sandbox.executed_inputs(), vec!["2 2", "2 2", "2 2"]);
    assert_eq!(verdict.per_case_results.len(), 1);
    assert_eq!(
        verdict.per_case_results[0].outcome,
        CaseOutcome::SandboxError
    );
}

#[test(tokio::test)]
async fn test_compile_fault_retried() {
    let sandbox = Arc::new(MockSandbox::new());
    sandbox.compile_faults();
    sandbox.when("2 2").completes_with("4").finish();

    let problem = make_problem("p1", &[("2 2", "4")]);
    let submission = make_submission("s1", "alice", "p1", "print(4)");

    let (verdict, _events) = judge_with(&sandbox, &problem, &submission).await;
    assert_eq!(verdict.unwrap().status, VerdictStatus::Accepted);
}

#[test(tokio::test)]
async fn test_cancelled_before_start() {
    let sandbox = Arc::new(MockSandbox::new());
    sandbox.when("2 2").completes_with("4").finish();

    let problem = make_problem("p1", &[("2 2", "4")]);
    let submission = make_submission("s1", "alice", "p1", "print(4)");

    let runner = TestRunner::new(sandbox.clone(), fast_retry());
    let (events_tx, _events_rx) = tokio::sync::mpsc::channel(256);
    let cancel = CancellationTokenHandle::new();
    cancel.cancel();

    let verdict = runner
        .judge(&problem, &submission, &cancel, &events_tx)
        .await
        .unwrap();
    assert_eq!(verdict.status, VerdictStatus::Cancelled);
    assert!(verdict.per_case_results.is_empty());
}

#[test(tokio::test)]
async fn test_float_comparator_is_used() {
    let sandbox = Arc::new(MockSandbox::new());
    sandbox.when("in").completes_with("3.1415926").finish();

    let mut problem = make_problem("p1", &[("in", "3.1415927")]);
    problem.comparator = ComparatorPolicy::FloatTolerance { epsilon: 1e-6 };
    let submission = make_submission("s1", "alice", "p1", "print(pi())");

    let (verdict, _events) = judge_with(&sandbox, &problem, &submission).await;
    assert_eq!(verdict.unwrap().status, VerdictStatus::Accepted);
}

#[test(tokio::test)]
async fn test_structurally_invalid_problem_is_rejected() {
    let sandbox = Arc::new(MockSandbox::new());
    let mut problem = make_problem("p1", &[("2 2", "4")]);
    problem.test_cases[0].time_limit_ms = 0;
    let submission = make_submission("s1", "alice", "p1", "print(4)");

    let (verdict, _events) = judge_with(&sandbox, &problem, &submission).await;
    assert!(matches!(verdict, Err(JudgeError::InvalidProblem(_))));
    assert_eq!(sandbox.execution_count(), 0);
}
