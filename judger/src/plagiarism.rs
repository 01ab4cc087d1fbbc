//! Advisory similarity detection between submissions of the same problem.
//!
//! The metric is deliberately simple and deliberately asymmetric:
//! `similarity(a, b) = |tokens(a) ∩ tokens(b)| / |tokens(a)| × 100`, so a
//! short submission copied out of a long one scores high while the long one
//! scores low against the short. Detection is advisory only and never gates
//! a verdict.

use std::collections::HashSet;
use std::sync::Arc;

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::model::{PlagiarismFlag, Submission};

/// Default percentage above which a pair gets flagged.
pub const DEFAULT_SIMILARITY_THRESHOLD: u8 = 80;

static TOKEN_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"[A-Za-z_][A-Za-z0-9_]*|\d+(?:\.\d+)?|\S").expect("Invalid token regex")
});

/// Keywords that survive identifier canonicalization. Covers the judged
/// languages; an unknown word is treated as a user identifier.
static KEYWORDS: Lazy<HashSet<&'static str>> = Lazy::new(|| {
    [
        // shared / c / c++
        "auto", "break", "case", "char", "const", "continue", "default", "do", "double", "else",
        "enum", "extern", "float", "for", "goto", "if", "int", "long", "register", "return",
        "short", "signed", "sizeof", "static", "struct", "switch", "typedef", "union", "unsigned",
        "void", "volatile", "while", "bool", "class", "delete", "namespace", "new", "nullptr",
        "operator", "private", "public", "template", "this", "throw", "try", "catch", "using",
        "virtual", "std", "include", "define",
        // python
        "and", "as", "assert", "def", "del", "elif", "except", "from", "global", "import", "in",
        "is", "lambda", "None", "not", "or", "pass", "print", "raise", "True", "False", "with",
        "yield", "range", "len", "input",
    ]
    .into_iter()
    .collect()
});

/// Tuning knobs for the detector. The threshold is a policy value, kept out
/// of the algorithm itself.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
#[serde(rename_all = "camelCase")]
pub struct PlagiarismConfig {
    /// Flag a pair when similarity strictly exceeds this percentage.
    pub threshold: u8,
    /// Fold user identifiers into positional placeholders and numeric
    /// literals into a literal bucket, so trivial renames do not evade
    /// detection.
    pub canonicalize_tokens: bool,
}

impl Default for PlagiarismConfig {
    fn default() -> Self {
        PlagiarismConfig {
            threshold: DEFAULT_SIMILARITY_THRESHOLD,
            canonicalize_tokens: true,
        }
    }
}

/// The normalized token set of one submission's code.
pub fn token_set(code: &str, canonicalize: bool) -> HashSet<String> {
    let mut tokens = HashSet::new();
    let mut ident_indices: Vec<String> = vec![];

    for token in TOKEN_RE.find_iter(code).map(|m| m.as_str()) {
        if !canonicalize {
            tokens.insert(token.to_owned());
            continue;
        }
        let first = token.chars().next().unwrap_or('\0');
        if first.is_ascii_digit() {
            tokens.insert("<num>".to_owned());
        } else if (first.is_ascii_alphabetic() || first == '_') && !KEYWORDS.contains(token) {
            // Identifiers are renamed by order of first appearance, so two
            // copies that only differ in naming produce identical sets.
            let index = match ident_indices.iter().position(|t| t == token) {
                Some(index) => index,
                None => {
                    ident_indices.push(token.to_owned());
                    ident_indices.len() - 1
                }
            };
            tokens.insert(format!("<id{}>", index));
        } else {
            tokens.insert(token.to_owned());
        }
    }

    tokens
}

/// Asymmetric similarity percentage of `a` against `b`, measured over `a`'s
/// token set. An empty `a` is 0 by definition, never a division error.
pub fn similarity(a: &HashSet<String>, b: &HashSet<String>) -> u8 {
    if a.is_empty() {
        return 0;
    }
    let shared = a.intersection(b).count();
    ((shared as f64 / a.len() as f64) * 100.0).round() as u8
}

pub struct PlagiarismDetector {
    cfg: PlagiarismConfig,
}

impl PlagiarismDetector {
    pub fn new(cfg: PlagiarismConfig) -> PlagiarismDetector {
        PlagiarismDetector { cfg }
    }

    /// Compare one ordered pair. Idempotent: the flag for (a, b) only
    /// depends on the two code blobs and the configured threshold.
    pub fn compare(&self, a: &Submission, b: &Submission) -> PlagiarismFlag {
        let a_tokens = token_set(&a.code, self.cfg.canonicalize_tokens);
        let b_tokens = token_set(&b.code, self.cfg.canonicalize_tokens);
        let similarity = similarity(&a_tokens, &b_tokens);
        PlagiarismFlag {
            submission_a: a.id.clone(),
            submission_b: b.id.clone(),
            similarity,
            flagged: similarity > self.cfg.threshold,
        }
    }

    /// Check a new submission against the corpus of prior submissions for
    /// the same problem. Only cross-user pairs are considered, and only
    /// pairs over the threshold are returned.
    ///
    /// The new submission's token set is built once, so the cost is
    /// O(|corpus| × average token count).
    pub fn detect(&self, new: &Submission, corpus: &[Arc<Submission>]) -> Vec<PlagiarismFlag> {
        let new_tokens = token_set(&new.code, self.cfg.canonicalize_tokens);
        let mut flags = vec![];

        for prior in corpus {
            if prior.user_id == new.user_id || prior.problem_id != new.problem_id {
                continue;
            }
            let prior_tokens = token_set(&prior.code, self.cfg.canonicalize_tokens);
            let similarity = similarity(&new_tokens, &prior_tokens);
            if similarity > self.cfg.threshold {
                flags.push(PlagiarismFlag {
                    submission_a: new.id.clone(),
                    submission_b: prior.id.clone(),
                    similarity,
                    flagged: true,
                });
            }
        }

        if !flags.is_empty() {
            tracing::info!(
                submission_id = %new.id,
                flags = flags.len(),
                "Submission flagged for similarity"
            );
        }
        flags
    }
}
