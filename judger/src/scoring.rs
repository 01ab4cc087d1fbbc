//! Scoring and the derived leaderboard.
//!
//! The scoring policy is configuration, not code baked into the pipeline:
//! the [`Scoreboard`] owns a [`ScoringPolicy`] trait object and replays
//! per-user verdict histories through it. Histories are deduplicated by
//! submission id and canonically ordered before scoring, so rebuilding the
//! board from an event log yields the same ranking no matter the replay
//! order.

use std::{collections::HashMap, sync::Arc};

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use itertools::Itertools;
use serde::{Deserialize, Serialize};

use crate::model::{
    LeaderboardEntry, ProblemId, Submission, SubmissionId, UserId, Verdict, VerdictStatus,
};

/// The slice of a verdict that scoring cares about. One per judged
/// submission; the event log the leaderboard can be rebuilt from.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VerdictRecord {
    pub submission_id: SubmissionId,
    pub user_id: UserId,
    pub problem_id: ProblemId,
    pub status: VerdictStatus,
    pub submitted_at: DateTime<Utc>,
}

impl VerdictRecord {
    pub fn of(submission: &Submission, verdict: &Verdict) -> VerdictRecord {
        VerdictRecord {
            submission_id: submission.id.clone(),
            user_id: submission.user_id.clone(),
            problem_id: submission.problem_id.clone(),
            status: verdict.status,
            submitted_at: submission.submitted_at,
        }
    }
}

/// One attempt as seen by a scoring policy: a verdict record joined with the
/// problem's declared point value.
#[derive(Debug, Clone)]
pub struct Attempt {
    pub problem_id: ProblemId,
    pub status: VerdictStatus,
    pub submitted_at: DateTime<Utc>,
    pub problem_value: u32,
}

/// A user's aggregate as computed by a policy.
#[derive(Debug, Clone, PartialEq)]
pub struct UserScore {
    pub score: i64,
    /// Tie-break key: time of the user's earliest accepted submission.
    pub earliest_accept: Option<DateTime<Utc>>,
}

/// Pluggable scoring. `attempts` arrive deduplicated and sorted by
/// (problem, submission time, submission id); implementations must be a pure
/// function of that slice so that replaying history is idempotent.
pub trait ScoringPolicy: Send + Sync {
    fn score_user(&self, attempts: &[Attempt]) -> UserScore;
}

/// Default policy: the first accepted submission per problem awards the
/// problem's point value, minus a fixed penalty per earlier failed attempt
/// on that problem (floored at zero). Attempts after the first accept
/// change nothing.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
#[serde(rename_all = "camelCase")]
pub struct FirstAcceptedPolicy {
    pub attempt_penalty: i64,
}

impl Default for FirstAcceptedPolicy {
    fn default() -> Self {
        FirstAcceptedPolicy { attempt_penalty: 10 }
    }
}

impl ScoringPolicy for FirstAcceptedPolicy {
    fn score_user(&self, attempts: &[Attempt]) -> UserScore {
        let mut score = 0i64;
        let mut earliest_accept: Option<DateTime<Utc>> = None;

        for (_problem, attempts) in &attempts.iter().group_by(|a| a.problem_id.clone()) {
            let mut failed_before_accept = 0i64;
            for attempt in attempts {
                match attempt.status {
                    VerdictStatus::Accepted => {
                        score += (attempt.problem_value as i64
                            - self.attempt_penalty * failed_before_accept)
                            .max(0);
                        earliest_accept = match earliest_accept {
                            Some(t) => Some(t.min(attempt.submitted_at)),
                            None => Some(attempt.submitted_at),
                        };
                        break;
                    }
                    // Compile errors are free: the program never ran.
                    VerdictStatus::CompileError => {}
                    _ => failed_before_accept += 1,
                }
            }
        }

        UserScore {
            score,
            earliest_accept,
        }
    }
}

/// The derived leaderboard. Mutation happens per user under the history
/// map's shard locks; rankings are computed from a snapshot on demand.
pub struct Scoreboard {
    policy: Arc<dyn ScoringPolicy>,
    problem_values: DashMap<ProblemId, u32>,
    histories: DashMap<UserId, HashMap<SubmissionId, VerdictRecord>>,
}

impl Scoreboard {
    pub fn new(policy: Arc<dyn ScoringPolicy>) -> Scoreboard {
        Scoreboard {
            policy,
            problem_values: DashMap::new(),
            histories: DashMap::new(),
        }
    }

    /// Rebuild a board from an event log. Any permutation of the same log
    /// produces the same standings.
    pub fn replay(
        policy: Arc<dyn ScoringPolicy>,
        problem_values: impl IntoIterator<Item = (ProblemId, u32)>,
        records: impl IntoIterator<Item = VerdictRecord>,
    ) -> Scoreboard {
        let board = Scoreboard::new(policy);
        for (problem, value) in problem_values {
            board.register_problem(problem, value);
        }
        for record in records {
            board.record(record);
        }
        board
    }

    /// Make a problem's point value known to the board. Values are stable
    /// for a problem's lifetime (problems are immutable once contested).
    pub fn register_problem(&self, problem: ProblemId, value: u32) {
        self.problem_values.insert(problem, value);
    }

    /// Fold one finalized verdict into the owning user's history.
    /// Idempotent: recording the same submission twice is a no-op overwrite.
    /// Infrastructure failures and cancellations never count.
    pub fn record(&self, record: VerdictRecord) {
        if !record.status.is_submitter_outcome() {
            tracing::debug!(
                submission_id = %record.submission_id,
                status = ?record.status,
                "Skipping non-submitter outcome in scoring"
            );
            return;
        }
        self.histories
            .entry(record.user_id.clone())
            .or_default()
            .insert(record.submission_id.clone(), record);
    }

    /// Current standings under competition ranking: tied scores share a
    /// rank and the next distinct score skips the tied count.
    pub fn standings(&self) -> Vec<LeaderboardEntry> {
        let mut scored: Vec<(UserId, UserScore)> = self
            .histories
            .iter()
            .map(|entry| {
                let attempts = self.attempts_of(entry.value());
                (entry.key().clone(), self.policy.score_user(&attempts))
            })
            .collect();

        // Total order for deterministic iteration; the rank numbers below
        // still only depend on the score.
        scored.sort_by(|(a_user, a), (b_user, b)| {
            b.score
                .cmp(&a.score)
                .then_with(|| match (a.earliest_accept, b.earliest_accept) {
                    (Some(x), Some(y)) => x.cmp(&y),
                    (Some(_), None) => std::cmp::Ordering::Less,
                    (None, Some(_)) => std::cmp::Ordering::Greater,
                    (None, None) => std::cmp::Ordering::Equal,
                })
                .then_with(|| a_user.cmp(b_user))
        });

        let mut entries = Vec::with_capacity(scored.len());
        let mut last_score = None;
        let mut rank = 1;
        for (index, (user_id, user_score)) in scored.into_iter().enumerate() {
            if last_score != Some(user_score.score) {
                rank = index as u32 + 1;
                last_score = Some(user_score.score);
            }
            entries.push(LeaderboardEntry {
                user_id,
                score: user_score.score,
                rank,
            });
        }
        entries
    }

    /// The single refreshed row for `user`, as emitted after each of their
    /// verdicts.
    pub fn entry_for(&self, user: &UserId) -> Option<LeaderboardEntry> {
        self.standings().into_iter().find(|e| &e.user_id == user)
    }

    fn attempts_of(&self, history: &HashMap<SubmissionId, VerdictRecord>) -> Vec<Attempt> {
        let mut attempts: Vec<(SubmissionId, Attempt)> = history
            .iter()
            .map(|(id, record)| {
                let problem_value = self
                    .problem_values
                    .get(&record.problem_id)
                    .map(|v| *v)
                    .unwrap_or(0);
                (
                    id.clone(),
                    Attempt {
                        problem_id: record.problem_id.clone(),
                        status: record.status,
                        submitted_at: record.submitted_at,
                        problem_value,
                    },
                )
            })
            .collect();
        // Canonical order: any insertion order reduces to the same slice.
        attempts.sort_by(|(a_id, a), (b_id, b)| {
            a.problem_id
                .cmp(&b.problem_id)
                .then_with(|| a.submitted_at.cmp(&b.submitted_at))
                .then_with(|| a_id.cmp(b_id))
        });
        attempts.into_iter().map(|(_, attempt)| attempt).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use pretty_assertions::assert_eq;

    fn at(minute: u32) -> DateTime<Utc> {
        Utc.ymd(2024, 3, 1).and_hms(12, minute, 0)
    }

    fn record(
        submission: &str,
        user: &str,
        problem: &str,
        status: VerdictStatus,
        minute: u32,
    ) -> VerdictRecord {
        VerdictRecord {
            submission_id: SubmissionId::new(submission),
            user_id: UserId::new(user),
            problem_id: ProblemId::new(problem),
            status,
            submitted_at: at(minute),
        }
    }

    fn board_with(records: Vec<VerdictRecord>) -> Scoreboard {
        Scoreboard::replay(
            Arc::new(FirstAcceptedPolicy::default()),
            vec![
                (ProblemId::new("p1"), 100),
                (ProblemId::new("p2"), 200),
            ],
            records,
        )
    }

    #[test]
    fn test_first_accept_awards_problem_value() {
        let board = board_with(vec![record(
            "s1",
            "alice",
            "p1",
            VerdictStatus::Accepted,
            0,
        )]);
        let entry = board.entry_for(&UserId::new("alice")).unwrap();
        assert_eq!(entry.score, 100);
        assert_eq!(entry.rank, 1);
    }

    #[test]
    fn test_failed_attempts_before_accept_are_penalized() {
        let board = board_with(vec![
            record("s1", "alice", "p1", VerdictStatus::WrongAnswer, 0),
            record("s2", "alice", "p1", VerdictStatus::TimeLimitExceeded, 1),
            record("s3", "alice", "p1", VerdictStatus::Accepted, 2),
            // After the accept: changes nothing.
            record("s4", "alice", "p1", VerdictStatus::WrongAnswer, 3),
        ]);
        let entry = board.entry_for(&UserId::new("alice")).unwrap();
        assert_eq!(entry.score, 100 - 2 * 10);
    }

    #[test]
    fn test_compile_errors_are_not_penalized() {
        let board = board_with(vec![
            record("s1", "alice", "p1", VerdictStatus::CompileError, 0),
            record("s2", "alice", "p1", VerdictStatus::Accepted, 1),
        ]);
        assert_eq!(board.entry_for(&UserId::new("alice")).unwrap().score, 100);
    }

    #[test]
    fn test_unaccepted_problem_scores_zero() {
        let board = board_with(vec![
            record("s1", "alice", "p1", VerdictStatus::WrongAnswer, 0),
            record("s2", "alice", "p1", VerdictStatus::RuntimeError, 1),
        ]);
        assert_eq!(board.entry_for(&UserId::new("alice")).unwrap().score, 0);
    }

    #[test]
    fn test_infrastructure_outcomes_never_count() {
        let board = board_with(vec![
            record("s1", "alice", "p1", VerdictStatus::SandboxError, 0),
            record("s2", "alice", "p1", VerdictStatus::Cancelled, 1),
            record("s3", "alice", "p1", VerdictStatus::Accepted, 2),
        ]);
        // No penalties from the two ignored records.
        assert_eq!(board.entry_for(&UserId::new("alice")).unwrap().score, 100);
    }

    #[test]
    fn test_competition_ranking_shares_and_skips() {
        let board = board_with(vec![
            record("s1", "alice", "p1", VerdictStatus::Accepted, 0),
            record("s2", "bob", "p1", VerdictStatus::Accepted, 1),
            record("s3", "carol", "p2", VerdictStatus::Accepted, 2),
        ]);
        let standings = board.standings();
        let ranks: Vec<(String, i64, u32)> = standings
            .iter()
            .map(|e| (e.user_id.to_string(), e.score, e.rank))
            .collect();
        assert_eq!(
            ranks,
            vec![
                ("carol".to_owned(), 200, 1),
                ("alice".to_owned(), 100, 2),
                ("bob".to_owned(), 100, 2),
            ]
        );
    }

    #[test]
    fn test_tied_leaders_skip_next_rank() {
        let board = board_with(vec![
            record("s1", "alice", "p1", VerdictStatus::Accepted, 0),
            record("s2", "bob", "p1", VerdictStatus::Accepted, 1),
            record("s3", "carol", "p1", VerdictStatus::WrongAnswer, 2),
        ]);
        let standings = board.standings();
        assert_eq!(standings[0].rank, 1);
        assert_eq!(standings[1].rank, 1);
        // Two tied at rank 1 ⇒ the next distinct score lands at rank 3.
        assert_eq!(standings[2].rank, 3);
    }

    #[test]
    fn test_replay_order_does_not_matter() {
        let records = vec![
            record("s1", "alice", "p1", VerdictStatus::WrongAnswer, 0),
            record("s2", "alice", "p1", VerdictStatus::Accepted, 1),
            record("s3", "bob", "p2", VerdictStatus::Accepted, 2),
            record("s4", "carol", "p1", VerdictStatus::Accepted, 3),
            record("s5", "bob", "p1", VerdictStatus::RuntimeError, 4),
        ];

        let forward = board_with(records.clone()).standings();

        let mut shuffled = records.clone();
        shuffled.reverse();
        shuffled.swap(0, 2);
        // Duplicate delivery must also be harmless.
        shuffled.push(records[1].clone());
        let replayed = board_with(shuffled).standings();

        assert_eq!(forward, replayed);
    }
}
