//! Escape-safe chunking of file content for literal-string commands.
//!
//! File content travels to the remote as Lua literal strings, so it is
//! escaped first and then split into chunks that fit the command template.
//! A chunk boundary must never fall inside a two-character escape sequence:
//! a prefix ending in an odd-length run of backslashes would ship half an
//! escape, so the boundary is walked back until the trailing run is even.

use crate::error::{LinkError, Result};

/// Escape content for embedding in a single-quoted Lua string literal.
///
/// Backslash, newline, tab and both quote characters become their
/// two-character escaped forms. Carriage returns are stripped so uploads
/// are line-ending agnostic.
pub fn escape(content: &str) -> String {
    let mut out = String::with_capacity(content.len());
    for ch in content.chars() {
        match ch {
            '\\' => out.push_str("\\\\"),
            '\n' => out.push_str("\\n"),
            '\t' => out.push_str("\\t"),
            '\'' => out.push_str("\\'"),
            '"' => out.push_str("\\\""),
            '\r' => {}
            other => out.push(other),
        }
    }
    out
}

/// Split escaped content into chunks of at most `capacity` bytes.
///
/// Each chunk is the maximal prefix of the remaining content that fits the
/// capacity, lands on a UTF-8 character boundary, and does not end in an
/// odd run of backslashes (the final chunk is exempt from the run rule
/// because nothing follows it that could complete a split escape).
///
/// # Errors
///
/// `Chunking` if no valid prefix of length ≥ 1 exists, which happens when
/// the capacity is zero or every candidate boundary splits an escape.
pub fn chunked(escaped: &str, capacity: usize) -> Result<Vec<&str>> {
    let mut chunks = Vec::new();
    let mut rest = escaped;

    while !rest.is_empty() {
        let mut end = max_prefix_len(rest, capacity);
        if end == rest.len() {
            chunks.push(rest);
            break;
        }
        while end > 0 && trailing_backslash_run(&rest[..end]) % 2 == 1 {
            // trailing char is a backslash, one byte
            end -= 1;
        }
        if end == 0 {
            return Err(LinkError::Chunking(format!(
                "no splittable boundary within {capacity} bytes"
            )));
        }
        let (chunk, tail) = rest.split_at(end);
        chunks.push(chunk);
        rest = tail;
    }

    Ok(chunks)
}

/// Largest prefix length ≤ `capacity` that is a character boundary.
fn max_prefix_len(s: &str, capacity: usize) -> usize {
    if s.len() <= capacity {
        return s.len();
    }
    let mut end = capacity;
    while end > 0 && !s.is_char_boundary(end) {
        end -= 1;
    }
    end
}

/// Length of the backslash run ending the string.
fn trailing_backslash_run(s: &str) -> usize {
    s.bytes().rev().take_while(|&b| b == b'\\').count()
}

/// Inverse of [`escape`], for closing the round-trip loop in tests.
#[cfg(test)]
pub fn unescape(escaped: &str) -> String {
    let mut out = String::with_capacity(escaped.len());
    let mut chars = escaped.chars();
    while let Some(ch) = chars.next() {
        if ch != '\\' {
            out.push(ch);
            continue;
        }
        match chars.next() {
            Some('\\') => out.push('\\'),
            Some('n') => out.push('\n'),
            Some('t') => out.push('\t'),
            Some('\'') => out.push('\''),
            Some('"') => out.push('"'),
            other => panic!("dangling escape: {other:?}"),
        }
    }
    out
}
