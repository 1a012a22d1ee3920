//! Minimal SQL lexing helpers
//!
//! Not a parser: just enough awareness of string literals, quoted
//! identifiers and comments to find statement terminators, keywords and
//! placeholders without being fooled by text inside quotes.

use regex::Regex;

#[derive(Clone, Copy, PartialEq, Eq)]
enum State {
    Normal,
    SingleQuote { backslash_escapes: bool },
    DoubleQuote,
    LineComment,
    BlockComment(u32),
}

/// Remove `--` and `/* */` comments, leaving literals untouched.
pub fn strip_comments(sql: &str) -> String {
    scan(sql, false).0
}

/// Split at the first `;` outside literals and comments.
///
/// Returns the comment-free statement and, if a terminator was found, the
/// raw text that followed it.
pub fn split_at_terminator(sql: &str) -> (String, Option<String>) {
    scan(sql, true)
}

/// Whether text contains anything but whitespace, comments and terminators.
pub fn has_content(sql: &str) -> bool {
    let mut rest = Some(sql.to_string());
    while let Some(text) = rest {
        let (statement, tail) = split_at_terminator(&text);
        if !statement.trim().is_empty() {
            return true;
        }
        rest = tail;
    }
    false
}

fn scan(sql: &str, stop_at_terminator: bool) -> (String, Option<String>) {
    let mut out = String::with_capacity(sql.len());
    let mut state = State::Normal;
    let mut chars = sql.char_indices().peekable();
    let mut prev: Option<char> = None;

    while let Some((idx, c)) = chars.next() {
        let next = chars.peek().map(|&(_, n)| n);
        match state {
            State::Normal => match c {
                ';' if stop_at_terminator => {
                    return (out, Some(sql[idx + 1..].to_string()));
                }
                '\'' => {
                    let backslash_escapes = matches!(prev, Some('e') | Some('E'));
                    state = State::SingleQuote { backslash_escapes };
                    out.push(c);
                }
                '"' => {
                    state = State::DoubleQuote;
                    out.push(c);
                }
                '-' if next == Some('-') => {
                    chars.next();
                    state = State::LineComment;
                }
                '/' if next == Some('*') => {
                    chars.next();
                    state = State::BlockComment(1);
                    out.push(' ');
                }
                _ => out.push(c),
            },
            State::SingleQuote { backslash_escapes } => {
                out.push(c);
                if backslash_escapes && c == '\\' {
                    if let Some((_, escaped)) = chars.next() {
                        out.push(escaped);
                    }
                } else if c == '\'' {
                    if next == Some('\'') {
                        chars.next();
                        out.push('\'');
                    } else {
                        state = State::Normal;
                    }
                }
            }
            State::DoubleQuote => {
                out.push(c);
                if c == '"' {
                    if next == Some('"') {
                        chars.next();
                        out.push('"');
                    } else {
                        state = State::Normal;
                    }
                }
            }
            State::LineComment => {
                if c == '\n' {
                    out.push('\n');
                    state = State::Normal;
                }
            }
            State::BlockComment(depth) => {
                if c == '*' && next == Some('/') {
                    chars.next();
                    state = if depth == 1 {
                        State::Normal
                    } else {
                        State::BlockComment(depth - 1)
                    };
                } else if c == '/' && next == Some('*') {
                    chars.next();
                    state = State::BlockComment(depth + 1);
                }
            }
        }
        prev = Some(c);
    }
    (out, None)
}

/// Blank out the contents of single-quoted literals.
///
/// Byte offsets are preserved so positions found in the masked text can be
/// used to slice the original.
pub fn mask_literals(sql: &str) -> String {
    let mut out = String::with_capacity(sql.len());
    let mut in_literal = false;
    let mut backslash_escapes = false;
    let mut chars = sql.chars().peekable();
    let mut prev: Option<char> = None;

    while let Some(c) = chars.next() {
        if !in_literal {
            if c == '\'' {
                in_literal = true;
                backslash_escapes = matches!(prev, Some('e') | Some('E'));
            }
            out.push(c);
        } else if backslash_escapes && c == '\\' {
            out.push(' ');
            if let Some(escaped) = chars.next() {
                out.push_str(&" ".repeat(escaped.len_utf8()));
            }
        } else if c == '\'' {
            if chars.peek() == Some(&'\'') {
                chars.next();
                out.push_str("  ");
            } else {
                in_literal = false;
                out.push(c);
            }
        } else {
            out.push_str(&" ".repeat(c.len_utf8()));
        }
        prev = Some(c);
    }
    out
}

/// Parenthesis depth at every byte of (masked) text.
pub fn paren_depths(masked: &str) -> Vec<u32> {
    let mut depths = Vec::with_capacity(masked.len());
    let mut depth: u32 = 0;
    for b in masked.bytes() {
        if b == b')' {
            depth = depth.saturating_sub(1);
        }
        depths.push(depth);
        if b == b'(' {
            depth += 1;
        }
    }
    depths
}

/// Byte ranges of `pattern` matches that sit outside any parentheses.
pub fn top_level_matches(masked: &str, pattern: &Regex) -> Vec<(usize, usize)> {
    let depths = paren_depths(masked);
    pattern
        .find_iter(masked)
        .filter(|m| depths.get(m.start()).copied().unwrap_or(0) == 0)
        .map(|m| (m.start(), m.end()))
        .collect()
}

/// First top-level match starting at or after `from`.
pub fn first_top_level_after(masked: &str, pattern: &Regex, from: usize) -> Option<(usize, usize)> {
    top_level_matches(masked, pattern)
        .into_iter()
        .find(|&(start, _)| start >= from)
}

/// Positional placeholder numbers (`$n`) outside literals, in order.
pub fn placeholders(sql: &str) -> Vec<u32> {
    lazy_static::lazy_static! {
        static ref PLACEHOLDER: Regex = Regex::new(r"\$(\d+)").unwrap();
    }
    let masked = mask_literals(sql);
    PLACEHOLDER
        .captures_iter(&masked)
        .filter_map(|c| c.get(1).and_then(|m| m.as_str().parse().ok()))
        .collect()
}
