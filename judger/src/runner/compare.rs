//! Output comparison policies and mismatch diagnostics.
//!
//! Which policy applies is declared on the [`Problem`](crate::model::Problem),
//! not decided here.

use difference::{Changeset, Difference};

use crate::model::ComparatorPolicy;

/// Lines with trailing whitespace stripped and trailing blank lines dropped.
/// This is the normalization applied before exact comparison, so a missing
/// final newline never fails an otherwise correct answer.
fn normalized_lines(s: &str) -> Vec<&str> {
    let mut lines: Vec<&str> = s.lines().map(str::trim_end).collect();
    while lines.last().map_or(false, |l| l.is_empty()) {
        lines.pop();
    }
    lines
}

fn tokens_match(got: &str, expected: &str, epsilon: f64) -> bool {
    if got == expected {
        return true;
    }
    match (got.parse::<f64>(), expected.parse::<f64>()) {
        // Relative tolerance for large magnitudes, absolute for small ones.
        (Ok(a), Ok(b)) => (a - b).abs() <= epsilon * b.abs().max(1.0),
        _ => false,
    }
}

/// Check a program's output against the expected output under the problem's
/// declared policy.
pub fn outputs_match(policy: &ComparatorPolicy, got: &str, expected: &str) -> bool {
    match policy {
        ComparatorPolicy::Exact => normalized_lines(got) == normalized_lines(expected),
        ComparatorPolicy::FloatTolerance { epsilon } => {
            let got_tokens: Vec<&str> = got.split_whitespace().collect();
            let expected_tokens: Vec<&str> = expected.split_whitespace().collect();
            got_tokens.len() == expected_tokens.len()
                && got_tokens
                    .iter()
                    .zip(&expected_tokens)
                    .all(|(g, e)| tokens_match(g, e, *epsilon))
        }
    }
}

/// Generate a line-diff excerpt between actual and expected output, capped at
/// `max_bytes`. This is what the submitter sees on a `WrongAnswer`.
pub fn diff_excerpt(got: &str, expected: &str, max_bytes: usize) -> String {
    let changeset = Changeset::new(got, expected, "\n");
    let mut out = String::new();

    for diff in changeset.diffs {
        let (prefix, content) = match &diff {
            Difference::Same(s) => (' ', s),
            Difference::Add(s) => ('+', s),
            Difference::Rem(s) => ('-', s),
        };
        for line in content.lines() {
            if out.len() + line.len() > max_bytes {
                out.push_str("… (diff truncated)\n");
                return out;
            }
            out.push(prefix);
            out.push(' ');
            out.push_str(line);
            out.push('\n');
        }
    }

    out
}
