// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Line-oriented tokenizer for the config grammar (spec.md §4.8), grounded
//! on `examples/original_source/src/config-file.c`'s `preprocess_buffer`/
//! `section_header` pass: whitespace is stripped outside quotes, `#`
//! starts a comment outside quotes, quoted text preserves interior
//! whitespace, and any control byte below 0x20 (other than the newline
//! that ends the line) is a hard parse error.

use super::ConfigError;

/// One parsed, preprocessed physical line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Line {
    /// `[section-name]`.
    Section(String),
    /// `key=value`.
    KeyValue(String, String),
    /// Blank after stripping comments/whitespace; carries no information.
    Blank,
}

/// Strip comments and unquoted whitespace from one raw input line, the way
/// `preprocess_buffer` does, rejecting illegal control bytes.
fn preprocess(raw: &str, lineno: usize) -> Result<String, ConfigError> {
    let mut out = String::with_capacity(raw.len());
    let mut quoted = false;
    for c in raw.chars() {
        if !quoted && (c == ' ' || c == '\t') {
            continue;
        }
        if c == '#' && !quoted {
            break;
        }
        if c == '"' {
            quoted = !quoted;
            continue;
        }
        if (c as u32) < 0x20 {
            return Err(ConfigError::Parse {
                line: lineno,
                reason: format!("illegal control byte 0x{:02x}", c as u32),
            });
        }
        out.push(c);
    }
    Ok(out)
}

/// Parse one preprocessed, non-blank line into a section header or key/value pair.
fn classify(preprocessed: &str, lineno: usize) -> Result<Line, ConfigError> {
    if preprocessed.is_empty() {
        return Ok(Line::Blank);
    }
    if let Some(name) = preprocessed.strip_prefix('[').and_then(|s| s.strip_suffix(']')) {
        return Ok(Line::Section(name.to_string()));
    }
    match preprocessed.split_once('=') {
        Some((key, value)) if !key.is_empty() => Ok(Line::KeyValue(key.to_string(), value.to_string())),
        _ => Err(ConfigError::Parse {
            line: lineno,
            reason: format!("expected '[section]' or 'key=value', got '{preprocessed}'"),
        }),
    }
}

/// Parse an entire config file's text into a sequence of logical lines,
/// one result per physical line that survives comment/whitespace stripping.
pub fn parse_lines(text: &str) -> Vec<(usize, Result<Line, ConfigError>)> {
    text.lines()
        .enumerate()
        .filter_map(|(i, raw)| {
            let lineno = i + 1;
            match preprocess(raw, lineno) {
                Ok(pp) => match classify(&pp, lineno) {
                    Ok(Line::Blank) => None,
                    other => Some((lineno, other)),
                },
                Err(e) => Some((lineno, Err(e))),
            }
        })
        .collect()
}

/// Split a `PROP@METHOD:ARG` value into its property name and method/arg
/// pair (spec.md §4.8's recurring grammar for match-valued keys).
pub fn split_prop_method_arg(value: &str) -> Result<(String, String, String), ConfigError> {
    let (prop, rest) = value.split_once('@').ok_or_else(|| ConfigError::Parse {
        line: 0,
        reason: format!("expected 'PROP@METHOD:ARG', got '{value}'"),
    })?;
    let (method, arg) = rest.split_once(':').ok_or_else(|| ConfigError::Parse {
        line: 0,
        reason: format!("expected 'METHOD:ARG' after '@', got '{rest}'"),
    })?;
    Ok((prop.to_string(), method.to_string(), arg.to_string()))
}

/// Split a bare `METHOD:ARG` value (used by object-refs and `[stream] property`
/// when no leading `PROP@` segment applies).
pub fn split_method_arg(value: &str) -> Result<(String, String), ConfigError> {
    value.split_once(':').map(|(m, a)| (m.to_string(), a.to_string())).ok_or_else(|| ConfigError::Parse {
        line: 0,
        reason: format!("expected 'METHOD:ARG', got '{value}'"),
    })
}
