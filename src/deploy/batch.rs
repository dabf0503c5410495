//! Model-script batch splitting and statement classification.
//!
//! The rapid deploy path executes a package's model script directly, so the
//! script has to be split into top-level statements on the `GO` batch
//! separator and bucketed by DDL kind: filegroups, schemas and types are
//! created before tables, tables go through the fixpoint retry loop, logins
//! are tolerated failures, everything else runs last.
//!
//! Classification reads the leading tokens with sqlparser's MsSqlDialect
//! tokenizer so string literals and comments can't fool it. It is a
//! heuristic over token prefixes, deliberately not a full parse.

use sqlparser::dialect::MsSqlDialect;
use sqlparser::tokenizer::{Token, Tokenizer, Whitespace};

use crate::util::{contains_ci, starts_with_ci};

/// Ordered execution buckets for rapid deploy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatementKind {
    /// `ALTER DATABASE ... ADD FILEGROUP` / `ADD FILE`.
    Filegroup,
    /// `CREATE SCHEMA`.
    Schema,
    /// `CREATE TYPE`.
    Type,
    /// `CREATE TABLE` (fixpoint-retried).
    Table,
    /// `CREATE LOGIN` (failures tolerated; logins are server-scoped and
    /// commonly pre-exist).
    Login,
    /// Everything else, executed after all of the above.
    Other,
}

/// One executable batch of the model script.
#[derive(Debug, Clone)]
pub struct Statement {
    pub sql: String,
    /// 1-based line of the batch in the model script, for diagnostics.
    pub start_line: usize,
    pub kind: StatementKind,
}

/// Split a model script on `GO` separators and classify each batch.
pub fn split_statements(content: &str) -> Vec<Statement> {
    split_batches(content)
        .into_iter()
        .filter(|batch| !batch.content.trim().is_empty())
        .map(|batch| Statement {
            sql: batch.content.trim().to_string(),
            start_line: batch.start_line,
            kind: classify_statement(batch.content),
        })
        .collect()
}

struct Batch<'a> {
    content: &'a str,
    start_line: usize,
}

/// Split SQL content into batches by GO separator, tracking line numbers.
/// `GO` must sit on its own line; a trailing semicolon is tolerated.
fn split_batches(content: &str) -> Vec<Batch<'_>> {
    let mut batches = Vec::new();
    let mut current_pos = 0;
    let mut batch_start = 0;
    let mut current_line = 1;
    let mut batch_start_line = 1;

    for line in content.lines() {
        let trimmed = line.trim();
        let line_end = current_pos + line.len();
        let next_pos = if content[line_end..].starts_with("\r\n") {
            line_end + 2
        } else if content[line_end..].starts_with('\n') {
            line_end + 1
        } else {
            line_end
        };

        if trimmed.eq_ignore_ascii_case("go") || trimmed.eq_ignore_ascii_case("go;") {
            if current_pos > batch_start {
                batches.push(Batch {
                    content: &content[batch_start..current_pos],
                    start_line: batch_start_line,
                });
            }
            batch_start = next_pos;
            batch_start_line = current_line + 1;
        }

        current_pos = next_pos;
        current_line += 1;
    }

    if batch_start < content.len() {
        batches.push(Batch {
            content: &content[batch_start..],
            start_line: batch_start_line,
        });
    }

    batches
}

/// Bucket a single statement by its leading tokens.
pub fn classify_statement(sql: &str) -> StatementKind {
    match leading_words(sql, 2) {
        Some(words) => classify_words(&words, sql),
        // Tokenization failed; fall back to a plain prefix check.
        None => classify_fallback(sql.trim_start()),
    }
}

fn classify_words(words: &[String], sql: &str) -> StatementKind {
    let first = words.first().map(String::as_str).unwrap_or("");
    let second = words.get(1).map(String::as_str).unwrap_or("");

    match (first, second) {
        ("CREATE", "SCHEMA") => StatementKind::Schema,
        ("CREATE", "TYPE") => StatementKind::Type,
        ("CREATE", "TABLE") => StatementKind::Table,
        ("CREATE", "LOGIN") => StatementKind::Login,
        ("ALTER", "DATABASE")
            if contains_ci(sql, "ADD FILEGROUP") || contains_ci(sql, "ADD FILE") =>
        {
            StatementKind::Filegroup
        }
        _ => StatementKind::Other,
    }
}

fn classify_fallback(sql: &str) -> StatementKind {
    if starts_with_ci(sql, "CREATE SCHEMA") {
        StatementKind::Schema
    } else if starts_with_ci(sql, "CREATE TYPE") {
        StatementKind::Type
    } else if starts_with_ci(sql, "CREATE TABLE") {
        StatementKind::Table
    } else if starts_with_ci(sql, "CREATE LOGIN") {
        StatementKind::Login
    } else if starts_with_ci(sql, "ALTER DATABASE")
        && (contains_ci(sql, "ADD FILEGROUP") || contains_ci(sql, "ADD FILE"))
    {
        StatementKind::Filegroup
    } else {
        StatementKind::Other
    }
}

/// First `count` word tokens of a statement, uppercased, with whitespace
/// and comments skipped. `None` when tokenization fails outright.
fn leading_words(sql: &str, count: usize) -> Option<Vec<String>> {
    let dialect = MsSqlDialect {};
    let tokens = Tokenizer::new(&dialect, sql).tokenize().ok()?;

    let mut words = Vec::with_capacity(count);
    for token in tokens {
        match token {
            Token::Whitespace(
                Whitespace::Space
                | Whitespace::Newline
                | Whitespace::Tab
                | Whitespace::SingleLineComment { .. }
                | Whitespace::MultiLineComment(_),
            ) => continue,
            Token::Word(w) => {
                words.push(w.value.to_uppercase());
                if words.len() == count {
                    break;
                }
            }
            _ => break,
        }
    }
    Some(words)
}
