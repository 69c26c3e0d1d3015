//! Textual SQL safety checks.
//!
//! Raw SQL is first *neutralized*: a single left-to-right scan blanks out comments,
//! string literals, quoted identifiers and dollar-quoted bodies so that keywords or
//! placeholder characters inside them are never mistaken for live SQL. The checks
//! below then look at whole words of the neutralized text.
//!
//! This is deliberately not a parser; see DESIGN.md for the limits.

use crate::error::{DbError, DbResult};
use crate::models::{QueryParam, Statement, Vendor};

const FORBIDDEN_KEYWORDS: &[&str] = &["CREATE", "DROP", "TRUNCATE", "ALTER"];
const MUTATING_KEYWORDS: &[&str] = &["INSERT", "UPDATE", "DELETE", "REPLACE", "MERGE"];
const ROW_RETURNING_KEYWORDS: &[&str] = &[
    "SELECT", "VALUES", "SHOW", "PRAGMA", "EXPLAIN", "DESCRIBE", "DESC", "TABLE",
];
/// Words after which a PostgreSQL `?` is a value position, not the JSONB operator.
const VALUE_POSITION_KEYWORDS: &[&str] = &[
    "SELECT", "WHERE", "AND", "OR", "NOT", "IN", "IS", "LIKE", "ILIKE", "BETWEEN", "LIMIT",
    "OFFSET", "VALUES", "SET", "THEN", "ELSE", "WHEN", "CASE", "RETURN", "BY", "ON", "HAVING",
];

#[derive(Clone)]
enum State {
    Normal,
    SingleQuoted { backslash_escapes: bool },
    DoubleQuoted { backslash_escapes: bool },
    Backtick,
    LineComment,
    BlockComment(u32),
    DollarQuoted(String),
}

fn is_ident_byte(b: u8) -> bool {
    b.is_ascii_alphanumeric() || b == b'_' || b == b'$'
}

fn is_line_comment_start(bytes: &[u8], idx: usize, vendor: Vendor) -> Option<usize> {
    match bytes[idx] {
        b'-' if bytes.get(idx + 1) == Some(&b'-') => {
            // MySQL only treats `--` as a comment when followed by whitespace
            if vendor == Vendor::MySQL {
                match bytes.get(idx + 2) {
                    None => Some(2),
                    Some(b) if b.is_ascii_whitespace() || b.is_ascii_control() => Some(2),
                    Some(_) => None,
                }
            } else {
                Some(2)
            }
        }
        b'#' if vendor == Vendor::MySQL => Some(1),
        _ => None,
    }
}

fn is_block_comment_start(bytes: &[u8], idx: usize) -> bool {
    bytes.get(idx) == Some(&b'/') && bytes.get(idx + 1) == Some(&b'*')
}

fn is_block_comment_end(bytes: &[u8], idx: usize) -> bool {
    bytes.get(idx) == Some(&b'*') && bytes.get(idx + 1) == Some(&b'/')
}

/// `$tag$` opener at `start`; returns the tag and the index of the closing `$`.
fn try_start_dollar_quote(bytes: &[u8], start: usize) -> Option<(String, usize)> {
    let mut idx = start + 1;
    if let Some(first) = bytes.get(idx) {
        if first.is_ascii_digit() {
            // `$1` is a positional parameter
            return None;
        }
    }
    while idx < bytes.len() && bytes[idx] != b'$' {
        let b = bytes[idx];
        if !(b.is_ascii_alphanumeric() || b == b'_') {
            return None;
        }
        idx += 1;
    }
    if idx < bytes.len() {
        let tag = std::str::from_utf8(&bytes[start + 1..idx]).ok()?.to_string();
        Some((tag, idx))
    } else {
        None
    }
}

fn matches_tag(bytes: &[u8], idx: usize, tag: &str) -> bool {
    bytes[idx + 1..].starts_with(tag.as_bytes()) && bytes.get(idx + 1 + tag.len()) == Some(&b'$')
}

/// PostgreSQL `E'...'` strings honour backslash escapes.
fn is_escape_string_prefix(bytes: &[u8], quote_idx: usize) -> bool {
    if quote_idx == 0 || !matches!(bytes[quote_idx - 1], b'E' | b'e') {
        return false;
    }
    quote_idx < 2 || !is_ident_byte(bytes[quote_idx - 2])
}

fn blank(out: &mut [u8], start: usize, len: usize) {
    let end = (start + len).min(out.len());
    for b in &mut out[start..end] {
        if *b != b'\n' {
            *b = b' ';
        }
    }
}

/// One step inside a quoted region. Returns the next index, or `None` when the
/// byte at `idx` is the closing quote.
fn scan_quoted(bytes: &[u8], out: &mut [u8], idx: usize, quote: u8, escapes: bool) -> Option<usize> {
    let b = bytes[idx];
    if escapes && b == b'\\' {
        blank(out, idx, 2);
        return Some(idx + 2);
    }
    if b == quote {
        if bytes.get(idx + 1) == Some(&quote) {
            blank(out, idx, 2);
            return Some(idx + 2);
        }
        return None;
    }
    blank(out, idx, 1);
    Some(idx + 1)
}

/// Blank out comments, literals, quoted identifiers and dollar-quoted bodies.
///
/// The result has the same byte length as the input. Quote delimiters of literals
/// and identifiers are kept so tokens stay separated; comments vanish entirely.
pub fn neutralize_sql(sql: &str, vendor: Vendor) -> String {
    let bytes = sql.as_bytes();
    let mut out = bytes.to_vec();
    let mut state = State::Normal;
    let mut idx = 0;

    while idx < bytes.len() {
        let b = bytes[idx];
        match &mut state {
            State::Normal => {
                if let Some(width) = is_line_comment_start(bytes, idx, vendor) {
                    blank(&mut out, idx, width);
                    idx += width;
                    state = State::LineComment;
                    continue;
                }
                if is_block_comment_start(bytes, idx) {
                    // MySQL executes the body of `/*! ... */`, so only the markers go
                    if vendor == Vendor::MySQL && bytes.get(idx + 2) == Some(&b'!') {
                        blank(&mut out, idx, 3);
                        idx += 3;
                        continue;
                    }
                    blank(&mut out, idx, 2);
                    idx += 2;
                    state = State::BlockComment(1);
                    continue;
                }
                if vendor == Vendor::MySQL && is_block_comment_end(bytes, idx) {
                    blank(&mut out, idx, 2);
                    idx += 2;
                    continue;
                }
                match b {
                    b'\'' => {
                        let backslash_escapes = vendor == Vendor::MySQL
                            || (vendor == Vendor::PostgreSQL
                                && is_escape_string_prefix(bytes, idx));
                        state = State::SingleQuoted { backslash_escapes };
                    }
                    b'"' => {
                        state = State::DoubleQuoted {
                            backslash_escapes: vendor == Vendor::MySQL,
                        };
                    }
                    b'`' if vendor != Vendor::PostgreSQL => state = State::Backtick,
                    // `$` inside an identifier is part of the name, not a quote
                    b'$' if vendor == Vendor::PostgreSQL
                        && (idx == 0 || !is_ident_byte(bytes[idx - 1])) =>
                    {
                        if let Some((tag, end)) = try_start_dollar_quote(bytes, idx) {
                            blank(&mut out, idx, end - idx + 1);
                            idx = end + 1;
                            state = State::DollarQuoted(tag);
                            continue;
                        }
                    }
                    _ => {}
                }
                idx += 1;
            }
            State::SingleQuoted { backslash_escapes } => {
                let escapes = *backslash_escapes;
                match scan_quoted(bytes, &mut out, idx, b'\'', escapes) {
                    Some(next) => idx = next,
                    None => {
                        state = State::Normal;
                        idx += 1;
                    }
                }
            }
            State::DoubleQuoted { backslash_escapes } => {
                let escapes = *backslash_escapes;
                match scan_quoted(bytes, &mut out, idx, b'"', escapes) {
                    Some(next) => idx = next,
                    None => {
                        state = State::Normal;
                        idx += 1;
                    }
                }
            }
            State::Backtick => match scan_quoted(bytes, &mut out, idx, b'`', false) {
                Some(next) => idx = next,
                None => {
                    state = State::Normal;
                    idx += 1;
                }
            },
            State::LineComment => {
                if b == b'\n' {
                    state = State::Normal;
                } else {
                    blank(&mut out, idx, 1);
                }
                idx += 1;
            }
            State::BlockComment(depth) => {
                if is_block_comment_end(bytes, idx) {
                    blank(&mut out, idx, 2);
                    idx += 2;
                    *depth -= 1;
                    if *depth == 0 {
                        state = State::Normal;
                    }
                } else if vendor == Vendor::PostgreSQL && is_block_comment_start(bytes, idx) {
                    blank(&mut out, idx, 2);
                    idx += 2;
                    *depth += 1;
                } else {
                    blank(&mut out, idx, 1);
                    idx += 1;
                }
            }
            State::DollarQuoted(tag) => {
                if b == b'$' && matches_tag(bytes, idx, tag) {
                    let width = tag.len() + 2;
                    blank(&mut out, idx, width);
                    idx += width;
                    state = State::Normal;
                } else {
                    blank(&mut out, idx, 1);
                    idx += 1;
                }
            }
        }
    }

    String::from_utf8(out).unwrap_or_else(|e| String::from_utf8_lossy(e.as_bytes()).into_owned())
}

/// Identifier-like words of neutralized text with their byte offsets.
fn words(text: &str) -> impl Iterator<Item = (usize, &str)> {
    let bytes = text.as_bytes();
    let mut idx = 0;
    std::iter::from_fn(move || {
        while idx < bytes.len() && !is_ident_byte(bytes[idx]) {
            idx += 1;
        }
        if idx >= bytes.len() {
            return None;
        }
        let start = idx;
        while idx < bytes.len() && is_ident_byte(bytes[idx]) {
            idx += 1;
        }
        Some((start, &text[start..idx]))
    })
}

fn is_keyword(word: &str, list: &[&str]) -> bool {
    list.iter().any(|k| word.eq_ignore_ascii_case(k))
}

/// Non-empty statements of neutralized text.
fn statements(neutral: &str) -> impl Iterator<Item = &str> {
    neutral.split(';').filter(|s| !s.trim().is_empty())
}

/// Reject empty SQL and any statement containing DDL keywords.
pub fn validate_sql_string(sql: &str, vendor: Vendor) -> DbResult<()> {
    let neutral = neutralize_sql(sql, vendor);
    let mut seen = 0;
    for (position, statement) in statements(&neutral).enumerate() {
        seen += 1;
        if let Some((_, keyword)) = words(statement).find(|(_, w)| is_keyword(w, FORBIDDEN_KEYWORDS))
        {
            return Err(DbError::unsafe_sql(format!(
                "statement {} contains the schema-changing keyword {}; DDL is not allowed",
                position + 1,
                keyword.to_ascii_uppercase()
            )));
        }
    }
    if seen == 0 {
        return Err(DbError::invalid_input("SQL statement cannot be empty"));
    }
    Ok(())
}

fn previous_non_space(bytes: &[u8], idx: usize) -> Option<usize> {
    (0..idx).rev().find(|&i| !bytes[i].is_ascii_whitespace())
}

fn next_non_space(bytes: &[u8], idx: usize) -> Option<usize> {
    (idx + 1..bytes.len()).find(|&i| !bytes[i].is_ascii_whitespace())
}

fn word_ending_at(text: &str, end: usize) -> &str {
    let bytes = text.as_bytes();
    let mut start = end + 1;
    while start > 0 && is_ident_byte(bytes[start - 1]) {
        start -= 1;
    }
    &text[start..=end]
}

/// Whether the `?` at `idx` is one of PostgreSQL's JSONB key-exists operators.
fn is_jsonb_operator(text: &str, idx: usize) -> bool {
    let bytes = text.as_bytes();
    if matches!(bytes.get(idx + 1), Some(b'|') | Some(b'&')) {
        return true;
    }
    let Some(prev) = previous_non_space(bytes, idx) else {
        return false;
    };
    let Some(next) = next_non_space(bytes, idx) else {
        return false;
    };
    let prev_is_operand = match bytes[prev] {
        b')' | b']' | b'\'' | b'"' => true,
        b if is_ident_byte(b) => !is_keyword(word_ending_at(text, prev), VALUE_POSITION_KEYWORDS),
        _ => false,
    };
    let next_is_operand = matches!(bytes[next], b'\'' | b'"' | b'(' | b'$') || is_ident_byte(bytes[next]);
    prev_is_operand && next_is_operand
}

fn is_named_placeholder(bytes: &[u8], idx: usize) -> bool {
    let Some(&next) = bytes.get(idx + 1) else {
        return false;
    };
    if !(next.is_ascii_alphabetic() || next == b'_') {
        return false;
    }
    // `::type` casts and `a:b` slices
    idx == 0 || !(bytes[idx - 1] == b':' || is_ident_byte(bytes[idx - 1]))
}

fn contains_placeholder(neutral: &str, vendor: Vendor) -> bool {
    let bytes = neutral.as_bytes();
    (0..bytes.len()).any(|idx| match bytes[idx] {
        b'$' => {
            bytes.get(idx + 1).is_some_and(|b| b.is_ascii_digit())
                && (idx == 0 || !is_ident_byte(bytes[idx - 1]))
        }
        b'?' => vendor != Vendor::PostgreSQL || !is_jsonb_operator(neutral, idx),
        b':' => is_named_placeholder(bytes, idx),
        _ => false,
    })
}

fn statement_is_mutating(statement: &str) -> bool {
    let mut iter = words(statement);
    let Some((_, first)) = iter.next() else {
        return false;
    };
    if is_keyword(first, MUTATING_KEYWORDS) {
        return true;
    }
    if !first.eq_ignore_ascii_case("WITH") {
        return false;
    }
    let mut previous = first;
    for (_, word) in iter {
        // `FOR UPDATE` / `FOR NO KEY UPDATE` are row locks
        if is_keyword(word, MUTATING_KEYWORDS) && !is_keyword(previous, &["FOR", "KEY"]) {
            return true;
        }
        previous = word;
    }
    false
}

/// Raw SQL must bind its values: placeholders need parameters, and data-changing
/// statements must supply at least one.
pub fn enforce_parameterized_query_usage(
    sql: &str,
    vendor: Vendor,
    params: &[QueryParam],
) -> DbResult<()> {
    if !params.is_empty() {
        return Ok(());
    }
    let neutral = neutralize_sql(sql, vendor);
    if contains_placeholder(&neutral, vendor) {
        return Err(DbError::unsafe_sql(
            "SQL contains placeholders but no parameters were supplied",
        ));
    }
    if statements(&neutral).any(statement_is_mutating) {
        return Err(DbError::unsafe_sql(
            "INSERT, UPDATE and DELETE statements must pass their values as parameters",
        ));
    }
    Ok(())
}

/// Whether raw SQL produces a result set.
pub fn statement_returns_rows(sql: &str, vendor: Vendor) -> bool {
    let neutral = neutralize_sql(sql, vendor);
    let Some(statement) = statements(&neutral).next() else {
        return false;
    };
    if words(statement).any(|(_, w)| w.eq_ignore_ascii_case("RETURNING")) {
        return true;
    }
    match words(statement).next() {
        Some((_, first)) if first.eq_ignore_ascii_case("WITH") => !statement_is_mutating(statement),
        Some((_, first)) => is_keyword(first, ROW_RETURNING_KEYWORDS),
        None => false,
    }
}

/// Whether raw SQL only reads: every statement returns rows and none writes.
pub fn statement_is_read_only(sql: &str, vendor: Vendor) -> bool {
    let neutral = neutralize_sql(sql, vendor);
    let mut seen = false;
    for statement in statements(&neutral) {
        seen = true;
        if statement_is_mutating(statement) {
            return false;
        }
        match words(statement).next() {
            Some((_, first))
                if first.eq_ignore_ascii_case("WITH") || is_keyword(first, ROW_RETURNING_KEYWORDS) => {}
            _ => return false,
        }
    }
    seen
}

/// Checks applied to every statement before it reaches a driver.
pub fn check_statement(statement: &Statement, vendor: Vendor) -> DbResult<()> {
    validate_sql_string(&statement.sql, vendor)?;
    if statement.is_raw() {
        enforce_parameterized_query_usage(&statement.sql, vendor, &statement.params)?;
    }
    Ok(())
}
