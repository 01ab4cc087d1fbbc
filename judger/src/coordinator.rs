//! Orchestration of the judging pipeline.
//!
//! The coordinator is the public entry point of the core: it takes
//! (problem, submission) pairs from the collaborator, guarantees at most one
//! in-flight judging attempt per submission id, bounds the number of
//! simultaneous sandbox jobs, and emits every produced record over the event
//! sink. It never persists anything itself.

use std::{
    collections::HashMap,
    sync::atomic::{AtomicUsize, Ordering},
    sync::Arc,
};

use arc_swap::ArcSwap;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tokio::{
    sync::{mpsc::Sender, Mutex, Semaphore},
    task::JoinHandle,
};
use tracing::info_span;
use tracing_futures::Instrument;

use crate::{
    model::{
        JudgeEvent, JudgeStage, Problem, ProblemConfigError, ProblemId, Submission, SubmissionId,
        Verdict, VerdictStatus,
    },
    plagiarism::{PlagiarismConfig, PlagiarismDetector},
    prelude::{CancellationTokenHandle, WithCancelExt},
    runner::{JudgeError, RetryConfig, TestRunner},
    sandbox::Sandbox,
    scoring::{Scoreboard, ScoringPolicy, VerdictRecord},
};

/// Coordinator-level configuration. Hot-swappable except for
/// `max_concurrent_jobs`, which sizes the admission semaphore once at
/// construction.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
#[serde(rename_all = "camelCase")]
pub struct JudgeConfig {
    /// Upper bound on simultaneously executing judging jobs. Excess
    /// submissions queue instead of oversubscribing the host.
    pub max_concurrent_jobs: usize,
    pub retry: RetryConfig,
    pub plagiarism: PlagiarismConfig,
}

impl Default for JudgeConfig {
    fn default() -> Self {
        JudgeConfig {
            max_concurrent_jobs: 4,
            retry: RetryConfig::default(),
            plagiarism: PlagiarismConfig::default(),
        }
    }
}

/// What happened to a submit call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubmitOutcome {
    /// The submission was queued for judging.
    Enqueued,
    /// A judging attempt for this submission id is already in flight; the
    /// duplicate request was coalesced into it.
    AlreadyRunning,
}

/// State shared between the coordinator handle and its judging tasks.
pub struct SharedJudgeData {
    /// Live configuration, swappable at runtime.
    pub cfg: ArcSwap<JudgeConfig>,
    sandbox: Arc<dyn Sandbox>,
    scoreboard: Scoreboard,
    /// Prior submissions per problem, the plagiarism corpus.
    corpus: DashMap<ProblemId, Vec<Arc<Submission>>>,
    /// Number of jobs currently executing (inside the semaphore).
    running_jobs: AtomicUsize,
    /// Join handle and cancellation handle for every tracked job.
    running_job_handles: Mutex<HashMap<SubmissionId, (JoinHandle<()>, CancellationTokenHandle)>>,
    admission: Arc<Semaphore>,
    /// Root of the cancellation tree; cancelling it aborts every job.
    abort_handle: CancellationTokenHandle,
    events: Sender<JudgeEvent>,
}

#[derive(Clone)]
pub struct Coordinator {
    data: Arc<SharedJudgeData>,
}

impl Coordinator {
    pub fn new(
        sandbox: Arc<dyn Sandbox>,
        scoring_policy: Arc<dyn ScoringPolicy>,
        cfg: JudgeConfig,
        events: Sender<JudgeEvent>,
    ) -> Coordinator {
        let admission = Arc::new(Semaphore::new(cfg.max_concurrent_jobs));
        Coordinator {
            data: Arc::new(SharedJudgeData {
                cfg: ArcSwap::new(Arc::new(cfg)),
                sandbox,
                scoreboard: Scoreboard::new(scoring_policy),
                corpus: DashMap::new(),
                running_jobs: AtomicUsize::new(0),
                running_job_handles: Mutex::new(HashMap::new()),
                admission,
                abort_handle: CancellationTokenHandle::new(),
                events,
            }),
        }
    }

    pub fn scoreboard(&self) -> &Scoreboard {
        &self.data.scoreboard
    }

    /// Number of jobs currently executing, not counting queued ones.
    pub fn running_jobs(&self) -> usize {
        self.data.running_jobs.load(Ordering::SeqCst)
    }

    /// Queue one submission for judging.
    ///
    /// Structural problems are rejected here, before anything executes.
    /// Repeated calls for the same submission id while a judging attempt is
    /// in flight coalesce into that attempt.
    pub async fn submit(
        &self,
        problem: Arc<Problem>,
        submission: Arc<Submission>,
    ) -> Result<SubmitOutcome, JudgeError> {
        problem.validate()?;
        if submission.problem_id != problem.id {
            return Err(JudgeError::InvalidProblem(
                ProblemConfigError::ProblemMismatch {
                    referenced: submission.problem_id.clone(),
                    judged: problem.id.clone(),
                },
            ));
        }

        let submission_id = submission.id.clone();
        let mut handles = self.data.running_job_handles.lock().await;
        if let Some((handle, _)) = handles.get(&submission_id) {
            if !handle.is_finished() {
                tracing::info!(%submission_id, "Judging already in flight, coalescing request");
                return Ok(SubmitOutcome::AlreadyRunning);
            }
            handles.remove(&submission_id);
        }

        self.data
            .scoreboard
            .register_problem(problem.id.clone(), problem.score_value);

        let cancel = self.data.abort_handle.child_token();
        let handle = tokio::spawn(handle_submission_wrapper(
            self.data.clone(),
            problem,
            submission,
            cancel.clone(),
        ));
        handles.insert(submission_id, (handle, cancel));
        Ok(SubmitOutcome::Enqueued)
    }

    /// Cancel an in-flight judging attempt, e.g. because the contest ended.
    /// Returns whether a job was actually cancelled. Already-recorded case
    /// results stay valid; the verdict comes out `Cancelled`.
    pub async fn cancel(&self, submission_id: &SubmissionId) -> bool {
        let removed = self
            .data
            .running_job_handles
            .lock()
            .await
            .remove(submission_id);
        match removed {
            Some((handle, cancel)) => {
                cancel.cancel();
                match handle.await {
                    Ok(()) => tracing::info!(%submission_id, "Cancelled judging"),
                    Err(e) => tracing::warn!(%submission_id, "Judging task panicked during cancel: {}", e),
                }
                true
            }
            None => false,
        }
    }

    /// Cancel every tracked job. Used on shutdown.
    pub fn abort_all(&self) {
        self.data.abort_handle.cancel();
    }

    /// The root cancellation handle. Cancelling it is equivalent to
    /// [`abort_all`](Self::abort_all); handy for wiring up signal handlers
    /// without keeping the whole coordinator alive.
    pub fn abort_handle(&self) -> CancellationTokenHandle {
        self.data.abort_handle.clone()
    }

    /// Wait until all currently tracked judging jobs have finished.
    pub async fn drain(&self) {
        loop {
            let next = {
                let mut handles = self.data.running_job_handles.lock().await;
                match handles.keys().next().cloned() {
                    Some(id) => handles.remove(&id),
                    None => break,
                }
            };
            if let Some((handle, _cancel)) = next {
                let _ = handle.await;
            }
        }
    }
}

async fn handle_submission_wrapper(
    data: Arc<SharedJudgeData>,
    problem: Arc<Problem>,
    submission: Arc<Submission>,
    cancel: CancellationTokenHandle,
) {
    let submission_id = submission.id.clone();
    let span = info_span!("judge", %submission_id);
    let result = handle_submission(&data, &problem, &submission, &cancel)
        .instrument(span)
        .await;

    // One bad submission must not take the pool down: failures land in the
    // log, never as a panic.
    if let Err(e) = result {
        tracing::error!(%submission_id, "Judging aborted: {}", e);
    }

    data.running_job_handles.lock().await.remove(&submission_id);
}

async fn handle_submission(
    data: &Arc<SharedJudgeData>,
    problem: &Arc<Problem>,
    submission: &Arc<Submission>,
    cancel: &CancellationTokenHandle,
) -> Result<(), JudgeError> {
    let events = &data.events;
    let submission_id = &submission.id;

    send_progress(events, submission_id, JudgeStage::Queued).await?;

    // Admission control: wait for a free slot rather than oversubscribing.
    let permit = match data
        .admission
        .clone()
        .acquire_owned()
        .with_cancel(cancel.cancelled())
        .await
    {
        Some(Ok(permit)) => permit,
        Some(Err(_)) => {
            tracing::warn!("Admission semaphore closed, dropping job");
            return Ok(());
        }
        None => {
            // Cancelled while still queued: no case ever ran.
            send_progress(events, submission_id, JudgeStage::Cancelled).await?;
            let verdict =
                Verdict::from_case_results(submission_id.clone(), VerdictStatus::Cancelled, vec![]);
            events
                .send(JudgeEvent::Verdict(verdict))
                .await
                .map_err(|_| JudgeError::SinkClosed)?;
            return Ok(());
        }
    };

    let cfg = data.cfg.load();
    let retry: RetryConfig = cfg.retry.clone();
    let plagiarism_cfg: PlagiarismConfig = cfg.plagiarism.clone();
    drop(cfg);

    data.running_jobs.fetch_add(1, Ordering::SeqCst);
    let runner = TestRunner::new(data.sandbox.clone(), retry);
    let verdict = runner.judge(problem, submission, cancel, events).await;
    data.running_jobs.fetch_sub(1, Ordering::SeqCst);
    drop(permit);
    let verdict = verdict?;

    let cancelled = verdict.status == VerdictStatus::Cancelled;
    send_progress(
        events,
        submission_id,
        if cancelled {
            JudgeStage::Cancelled
        } else {
            JudgeStage::Finished
        },
    )
    .await?;
    events
        .send(JudgeEvent::Verdict(verdict.clone()))
        .await
        .map_err(|_| JudgeError::SinkClosed)?;

    // Scoring sees only finalized submitter outcomes.
    if verdict.status.is_submitter_outcome() {
        data.scoreboard
            .record(VerdictRecord::of(submission, &verdict));
        if let Some(entry) = data.scoreboard.entry_for(&submission.user_id) {
            events
                .send(JudgeEvent::Leaderboard(entry))
                .await
                .map_err(|_| JudgeError::SinkClosed)?;
        }
    }

    // Plagiarism detection is advisory: it runs after the verdict is out
    // and never gates it. Cancelled runs neither get checked nor join the
    // corpus.
    if !cancelled {
        let prior = {
            let mut entry = data.corpus.entry(problem.id.clone()).or_default();
            let snapshot = entry.value().clone();
            if !entry.iter().any(|s| s.id == submission.id) {
                entry.push(submission.clone());
            }
            snapshot
        };
        let detector = PlagiarismDetector::new(plagiarism_cfg);
        for flag in detector.detect(submission, &prior) {
            events
                .send(JudgeEvent::Plagiarism(flag))
                .await
                .map_err(|_| JudgeError::SinkClosed)?;
        }
    }

    Ok(())
}

async fn send_progress(
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
