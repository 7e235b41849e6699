// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Match primitives (component A): the four ways a classifier or rule can
//! test a string value read off an audio-server object.

use regex::Regex;
use thiserror::Error;

/// Errors that can occur while building a [`MatchExpr`] from configuration.
#[derive(Debug, Error)]
pub enum MatchError {
    #[error("invalid regex '{pattern}': {source}")]
    BadRegex {
        pattern: String,
        #[source]
        source: regex::Error,
    },
    #[error("regex '{0}' contains a capture group, which this engine treats as a refusal to match; use a non-capturing group (?:...) instead")]
    CaptureGroupRejected(String),
    #[error("unknown match method '{0}'")]
    UnknownMethod(String),
}

/// A compiled, anchored regular expression with no first capture group.
#[derive(Debug, Clone)]
pub struct AnchoredRegex {
    pattern: String,
    inner: Regex,
}

impl AnchoredRegex {
    fn compile(pattern: &str) -> Result<Self, MatchError> {
        // Reject patterns with a capturing group up front: per spec.md §4.1/§9,
        // a match with submatches never matches, so treat it as a load-time
        // diagnostic instead of a silent always-false rule.
        if has_capture_group(pattern) {
            return Err(MatchError::CaptureGroupRejected(pattern.to_string()));
        }
        let anchored = format!("^(?:{pattern})$");
        let inner = Regex::new(&anchored).map_err(|source| MatchError::BadRegex {
            pattern: pattern.to_string(),
            source,
        })?;
        Ok(Self {
            pattern: pattern.to_string(),
            inner,
        })
    }

    fn is_match(&self, s: &str) -> bool {
        self.inner.is_match(s)
    }
}

/// Very small heuristic capture-group detector: counts unescaped `(` that
/// aren't immediately followed by `?` (non-capturing, lookaround, named with
/// `?<`, etc). Good enough for the config-time rules this engine accepts;
/// a full parse isn't needed since `regex::Regex` itself will reject any
/// syntax error before this ever matters for correctness.
fn has_capture_group(pattern: &str) -> bool {
    let bytes = pattern.as_bytes();
    let mut i = 0;
    let mut escaped = false;
    while i < bytes.len() {
        let c = bytes[i];
        if escaped {
            escaped = false;
        } else if c == b'\\' {
            escaped = true;
        } else if c == b'(' {
            let next = bytes.get(i + 1).copied();
            if next != Some(b'?') {
                return true;
            }
        }
        i += 1;
    }
    false
}

/// A match expression: one of the four primitives from spec.md §4.1.
#[derive(Debug, Clone)]
pub enum MatchExpr {
    Equals(String),
    StartsWith(String),
    Regex(AnchoredRegex),
    True,
}

impl MatchExpr {
    /// Evaluate this expression against a string.
    pub fn matches(&self, s: &str) -> bool {
        match self {
            MatchExpr::Equals(t) => s == t,
            MatchExpr::StartsWith(t) => s.starts_with(t.as_str()),
            MatchExpr::Regex(r) => r.is_match(s),
            MatchExpr::True => true,
        }
    }

    /// Build a match expression from a config-file `METHOD:ARG` pair.
    ///
    /// A regex argument of literal `"*"` is rewritten to [`MatchExpr::True`]
    /// per spec.md §4.1.
    pub fn from_method_arg(method: &str, arg: &str) -> Result<Self, MatchError> {
        match method {
            "equals" => Ok(MatchExpr::Equals(arg.to_string())),
            "startswith" => Ok(MatchExpr::StartsWith(arg.to_string())),
            "matches" => {
                if arg == "*" {
                    Ok(MatchExpr::True)
                } else {
                    Ok(MatchExpr::Regex(AnchoredRegex::compile(arg)?))
                }
            }
            "true" => Ok(MatchExpr::True),
            other => Err(MatchError::UnknownMethod(other.to_string())),
        }
    }
}

impl PartialEq for MatchExpr {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (MatchExpr::Equals(a), MatchExpr::Equals(b)) => a == b,
            (MatchExpr::StartsWith(a), MatchExpr::StartsWith(b)) => a == b,
            (MatchExpr::Regex(a), MatchExpr::Regex(b)) => a.pattern == b.pattern,
            (MatchExpr::True, MatchExpr::True) => true,
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn equals_matches_exact_string_only() {
        let m = MatchExpr::Equals("alert".to_string());
        assert!(m.matches("alert"));
        assert!(!m.matches("alerts"));
        assert!(!m.matches(""));
    }

    #[test]
    fn empty_string_compares_equal_only_to_empty() {
        let m = MatchExpr::Equals(String::new());
        assert!(m.matches(""));
        assert!(!m.matches("x"));
    }

    #[test]
    fn startswith_requires_prefix_and_length() {
        let m = MatchExpr::StartsWith("media.role".to_string());
        assert!(m.matches("media.role.music"));
        assert!(!m.matches("media.rol"));
    }

    #[test]
    fn startswith_does_not_panic_on_multibyte_boundaries() {
        let m = MatchExpr::StartsWith("m".to_string());
        assert!(!m.matches("日本語"));
        assert!(m.matches("media"));
    }

    #[test]
    fn wildcard_star_is_rewritten_to_true() {
        let m = MatchExpr::from_method_arg("matches", "*").unwrap();
        assert!(matches!(m, MatchExpr::True));
        assert!(m.matches(""));
        assert!(m.matches("anything"));
    }

    #[test]
    fn regex_is_anchored_over_the_whole_string() {
        let m = MatchExpr::from_method_arg("matches", "alert.*").unwrap();
        assert!(m.matches("alert-tone"));
        assert!(!m.matches("pre-alert-tone"));
    }

    #[test]
    fn regex_with_capture_group_is_rejected_at_construction() {
        let err = MatchExpr::from_method_arg("matches", "(alert)").unwrap_err();
        assert!(matches!(err, MatchError::CaptureGroupRejected(_)));
    }

    #[test]
    fn regex_with_non_capturing_group_is_accepted() {
        let m = MatchExpr::from_method_arg("matches", "(?:alert|ring)").unwrap();
        assert!(m.matches("ring"));
    }

    #[test]
    fn unknown_method_is_rejected() {
        assert!(MatchExpr::from_method_arg("frobnicate", "x").is_err());
    }

    #[test]
    fn true_always_matches() {
        assert!(MatchExpr::True.matches(""));
        assert!(MatchExpr::True.matches("literally anything"));
    }
}
