//! Test doubles and fixtures shared by the pipeline tests.

use std::{
    collections::{HashMap, VecDeque},
    sync::Mutex,
    time::Duration,
};

use async_trait::async_trait;
use chrono::{TimeZone, Utc};
use tokio::sync::mpsc::Receiver;

use crate::{
    model::{
        ComparatorPolicy, Difficulty, JudgeEvent, Language, Problem, ProblemId, Submission,
        SubmissionId, TestCase, UserId,
    },
    sandbox::{
        Artifact, CompileOutcome, ExecutionOutcome, ResourceLimits, Sandbox, SandboxFault,
    },
};

enum Scripted {
    Outcome(ExecutionOutcome),
    Fault,
}

enum ScriptedCompile {
    Error(String),
    Fault,
}

/// A sandbox that replays scripted outcomes keyed by test case input, in the
/// style of a mock command runner: script first, then hand it to the code
/// under test.
///
/// ```ignore
/// let sandbox = MockSandbox::new();
/// sandbox.when("2 2").completes_with("4").finish();
/// sandbox.when("3 3").faults().completes_with("6").finish();
/// ```
///
/// Each scripted response is consumed in order; the last one for an input is
/// repeated if the input is executed again afterwards.
pub struct MockSandbox {
    compile_script: Mutex<VecDeque<ScriptedCompile>>,
    executions: Mutex<HashMap<String, VecDeque<Scripted>>>,
    executed: Mutex<Vec<String>>,
    delay: Mutex<Option<Duration>>,
}

impl MockSandbox {
    pub fn new() -> MockSandbox {
        MockSandbox {
            compile_script: Mutex::new(VecDeque::new()),
            executions: Mutex::new(HashMap::new()),
            executed: Mutex::new(vec![]),
            delay: Mutex::new(None),
        }
    }

    /// Start scripting responses for one test case input.
    pub fn when(&self, input: &str) -> Expectation<'_> {
        Expectation {
            sandbox: self,
            input: input.to_owned(),
        }
    }

    /// Script the next compile call to fail with a compiler message.
    pub fn fail_compile(&self, message: &str) {
        self.compile_script
            .lock()
            .unwrap()
            .push_back(ScriptedCompile::Error(message.to_owned()));
    }

    /// Script the next compile call to hit an infrastructure fault.
    pub fn compile_faults(&self) {
        self.compile_script
            .lock()
            .unwrap()
            .push_back(ScriptedCompile::Fault);
    }

    /// Make every execution take this long. Lets tests observe in-flight
    /// jobs.
    pub fn set_delay(&self, delay: Duration) {
        *self.delay.lock().unwrap() = Some(delay);
    }

    /// Inputs executed so far, in order.
    pub fn executed_inputs(&self) -> Vec<String> {
        self.executed.lock().unwrap().clone()
    }

    pub fn execution_count(&self) -> usize {
        self.executed.lock().unwrap().len()
    }

    fn push(&self, input: &str, scripted: Scripted) {
        self.executions
            .lock()
            .unwrap()
            .entry(input.to_owned())
            .or_default()
            .push_back(scripted);
    }

    fn next_for(&self, input: &str) -> Result<ExecutionOutcome, SandboxFault> {
        let mut executions = self.executions.lock().unwrap();
        let queue = executions
            .get_mut(input)
            .unwrap_or_else(|| panic!("MockSandbox: no script for input {:?}", input));
        let scripted = if queue.len() > 1 {
            queue.pop_front().unwrap()
        } else {
            match queue.front() {
                Some(Scripted::Outcome(outcome)) => Scripted::Outcome(outcome.clone()),
                Some(Scripted::Fault) => Scripted::Fault,
                None => panic!("MockSandbox: script for input {:?} is empty", input),
            }
        };
        match scripted {
            Scripted::Outcome(outcome) => Ok(outcome),
            Scripted::Fault => Err(SandboxFault::Internal("scripted fault".into())),
        }
    }
}

#[async_trait]
impl Sandbox for MockSandbox {
    async fn compile(
        &self,
        code: &str,
        language: Language,
        _limits: &ResourceLimits,
    ) -> Result<CompileOutcome, SandboxFault> {
        match self.compile_script.lock().unwrap().pop_front() {
            None => Ok(CompileOutcome::Success(Artifact::Source {
                language,
                code: code.to_owned(),
            })),
            Some(ScriptedCompile::Error(message)) => Ok(CompileOutcome::Error { message }),
            Some(ScriptedCompile::Fault) => {
                Err(SandboxFault::Internal("scripted compile fault".into()))
            }
        }
    }

    async fn execute(
        &self,
        _artifact: &Artifact,
        input: &str,
        _limits: &ResourceLimits,
    ) -> Result<ExecutionOutcome, SandboxFault> {
        let delay = *self.delay.lock().unwrap();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        self.executed.lock().unwrap().push(input.to_owned());
        self.next_for(input)
    }
}

/// Builder for one input's scripted responses.
pub struct Expectation<'a> {
    sandbox: &'a MockSandbox,
    input: String,
}

impl Expectation<'_> {
    pub fn completes_with(self, stdout: &str) -> Self {
        self.completes_in(stdout, 10, 1024)
    }

    pub fn completes_in(self, stdout: &str, time_ms: u64, memory_kb: u64) -> Self {
        self.sandbox.push(
            &self.input,
            Scripted::Outcome(ExecutionOutcome::Completed {
                stdout: stdout.to_owned(),
                exit_code: 0,
                time_ms,
                memory_kb,
            }),
        );
        self
    }

    pub fn times_out(self, time_ms: u64) -> Self {
        self.sandbox.push(
            &self.input,
            Scripted::Outcome(ExecutionOutcome::TimeLimitExceeded { time_ms }),
        );
        self
    }

    pub fn exceeds_memory(self, memory_kb: u64) -> Self {
        self.sandbox.push(
            &self.input,
            Scripted::Outcome(ExecutionOutcome::MemoryLimitExceeded { memory_kb }),
        );
        self
    }

    pub fn runtime_error(self, exit_code: i64, stderr: &str) -> Self {
        self.sandbox.push(
            &self.input,
            Scripted::Outcome(ExecutionOutcome::RuntimeError {
                exit_code,
                stderr_excerpt: stderr.to_owned(),
            }),
        );
        self
    }

    pub fn floods_output(self) -> Self {
        self.sandbox
            .push(&self.input, Scripted::Outcome(ExecutionOutcome::OutputLimitExceeded));
        self
    }

    pub fn faults(self) -> Self {
        self.sandbox.push(&self.input, Scripted::Fault);
        self
    }

    pub fn finish(self) {}
}

/// A problem from (input, expected output) pairs with uniform limits.
pub fn make_problem(id: &str, cases: &[(&str, &str)]) -> Problem {
    Problem {
        id: ProblemId::new(id),
        test_cases: cases
            .iter()
            .map(|(input, expected)| TestCase {
                input: (*input).to_owned(),
                expected_output: (*expected).to_owned(),
                time_limit_ms: 1000,
                memory_limit_kb: 65536,
                output_limit_bytes: 1024 * 1024,
            })
            .collect(),
        comparator: ComparatorPolicy::Exact,
        difficulty: Difficulty::Easy,
        score_value: 100,
    }
}

pub fn make_submission(id: &str, user: &str, problem: &str, code: &str) -> Submission {
    Submission {
        id: SubmissionId::new(id),
        user_id: UserId::new(user),
        problem_id: ProblemId::new(problem),
        code: code.to_owned(),
        language: Language::Python,
        submitted_at: Utc.ymd(2024, 3, 1).and_hms(12, 0, 0),
    }
}

/// Drain every event out of a closed channel.
pub async fn collect_events(mut events: Receiver<JudgeEvent>) -> Vec<JudgeEvent> {
    let mut collected = vec![];
    while let Some(event) = events.recv().await {
        collected.push(event);
    }
    collected
}
