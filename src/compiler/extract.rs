//! Statement extraction
//!
//! Pulls the single read-only statement out of generator output: markdown
//! fences and leading prose are discarded, and anything after the first
//! terminator must be empty.

use crate::compiler::lexer::{has_content, split_at_terminator, strip_comments};
use crate::error::CompileFault;
use regex::Regex;

lazy_static::lazy_static! {
    static ref FENCED_BLOCK: Regex =
        Regex::new(r"(?s)```[A-Za-z0-9_-]*[ \t]*\r?\n?(.*?)```").unwrap();
    static ref LEADING_AT_LINE_START: Regex = Regex::new(
        r#"(?im)^[ \t]*(?:select\b|with\s+(?:recursive\s+)?"?[a-z_][a-z0-9_]*"?\s*(?:\([^)]*\)\s*)?as\s*(?:not\s+)?(?:materialized\s+)?\()"#
    ).unwrap();
    static ref LEADING_ANYWHERE: Regex = Regex::new(
        r#"(?is)\b(?:select\b|with\s+(?:recursive\s+)?"?[a-z_][a-z0-9_]*"?\s*(?:\([^)]*\)\s*)?as\s*(?:not\s+)?(?:materialized\s+)?\()"#
    ).unwrap();
    static ref FIRST_WORD: Regex = Regex::new(r"[A-Za-z_]+").unwrap();
}

/// Extract the statement body from raw generator output.
pub fn extract_statement(draft: &str) -> Result<String, CompileFault> {
    let body = match FENCED_BLOCK.captures(draft).and_then(|c| c.get(1)) {
        Some(inner) => inner.as_str().to_string(),
        None => draft.replace('`', " "),
    };
    let body = strip_comments(&body);
    if body.trim().is_empty() {
        return Err(CompileFault::EmptyDraft);
    }

    let start = LEADING_AT_LINE_START
        .find(&body)
        .map(|m| m.start() + (m.as_str().len() - m.as_str().trim_start().len()))
        .or_else(|| LEADING_ANYWHERE.find(&body).map(|m| m.start()));

    let start = match start {
        Some(start) => start,
        None => {
            let verb = FIRST_WORD
                .find(&body)
                .map(|m| m.as_str().to_uppercase())
                .unwrap_or_else(|| "<none>".to_string());
            return Err(CompileFault::UnsupportedVerb(verb));
        }
    };

    let preamble = &body[..start];
    if split_at_terminator(preamble).1.is_some() {
        return Err(CompileFault::MultipleStatements(
            "statement terminator before the read statement".to_string(),
        ));
    }

    let (statement, remainder) = split_at_terminator(&body[start..]);
    if let Some(rest) = remainder {
        if has_content(&rest) {
            return Err(CompileFault::MultipleStatements(summarize(&rest)));
        }
    }

    let statement = statement.trim().to_string();
    if statement.is_empty() {
        return Err(CompileFault::EmptyDraft);
    }
    Ok(statement)
}

fn summarize(text: &str) -> String {
    let flat: String = text.split_whitespace().collect::<Vec<_>>().join(" ");
    if flat.chars().count() > 60 {
        format!("{}...", flat.chars().take(60).collect::<String>())
    } else {
        flat
    }
}
