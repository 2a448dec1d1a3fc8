//! Router tables: interfaces, links, comtrees, routes.
//!
//! Each table is an indexed collection guarded by its own mutex at the
//! router level. Mutations keep the cross-table invariants intact or fail
//! without touching anything.

pub mod comtree;
pub mod iface;
pub mod link;
pub mod route;

pub use comtree::ComtreeTable;
pub use iface::IfaceTable;
pub use link::LinkTable;
pub use route::RouteTable;

use thiserror::Error;

/// Errors shared by all table mutations.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum TableError {
    #[error("entry already exists")]
    Exists,
    #[error("no such entry")]
    NotFound,
    #[error("entry is still in use: {0}")]
    InUse(&'static str),
    #[error("rate exceeds available capacity")]
    RateOverflow,
    #[error("invalid entry: {0}")]
    Invalid(&'static str),
    #[error("parse error at line {line}: {msg}")]
    Parse { line: usize, msg: String },
}

/// Split a table file into significant lines: comments (`#` to end of
/// line) stripped, blanks skipped. Yields (1-based line number, text).
pub(crate) fn significant_lines(input: &str) -> impl Iterator<Item = (usize, &str)> {
    input.lines().enumerate().filter_map(|(i, raw)| {
        let line = match raw.find('#') {
            Some(p) => &raw[..p],
            None => raw,
        }
        .trim();
        if line.is_empty() {
            None
        } else {
            Some((i + 1, line))
        }
    })
}

/// Parse the leading entry-count line every table file starts with.
pub(crate) fn parse_count(line: (usize, &str)) -> Result<usize, TableError> {
    line.1.parse().map_err(|_| TableError::Parse {
        line: line.0,
        msg: "expected entry count".into(),
    })
}

pub(crate) fn parse_err(line: usize, msg: impl Into<String>) -> TableError {
    TableError::Parse {
        line,
        msg: msg.into(),
    }
}
