//! Parser for whitespace-tabular pod listings (`kubectl get pods` style).
//!
//! The first non-blank line is the header. Only `NAMESPACE` and `NAME` are
//! located; the remaining columns (READY, STATUS, AGE, ...) are ignored.

#![forbid(unsafe_code)]

use crate::InstanceRow;

/// Columns the parser needs from the header.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ColumnKind {
    Namespace,
    Name,
}

impl ColumnKind {
    pub fn label(&self) -> &'static str {
        match self {
            ColumnKind::Namespace => "NAMESPACE",
            ColumnKind::Name => "NAME",
        }
    }
}

/// The table cannot be parsed at all: no row could be located.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum MalformedTableError {
    #[error("instance table is empty (no header row)")]
    MissingHeader,
    #[error("instance table header has no {} column", .0.label())]
    MissingColumn(ColumnKind),
}

#[derive(Debug)]
struct Header {
    width: usize,
    name: usize,
    namespace: Option<usize>,
}

fn locate(header: &[&str], col: ColumnKind) -> Result<usize, MalformedTableError> {
    header
        .iter()
        .position(|t| *t == col.label())
        .ok_or(MalformedTableError::MissingColumn(col))
}

fn read_header(line: &str, fixed_namespace: Option<&str>) -> Result<Header, MalformedTableError> {
    let tokens: Vec<&str> = line.split_whitespace().collect();
    let name = locate(&tokens, ColumnKind::Name)?;
    let namespace = match fixed_namespace {
        Some(_) => None,
        None => Some(locate(&tokens, ColumnKind::Namespace)?),
    };
    Ok(Header { width: tokens.len(), name, namespace })
}

/// Parse `raw` into rows, in source order.
///
/// With `fixed_namespace` set, every row takes that namespace and the header
/// does not need a `NAMESPACE` column. Data lines with fewer tokens than the
/// header has columns are skipped.
pub fn parse(raw: &str, fixed_namespace: Option<&str>) -> Result<Vec<InstanceRow>, MalformedTableError> {
    let mut lines = raw.lines().filter(|l| !l.trim().is_empty());
    let header_line = lines.next().ok_or(MalformedTableError::MissingHeader)?;
    let header = read_header(header_line, fixed_namespace)?;

    let rows = lines
        .filter_map(|line| {
            let tokens: Vec<&str> = line.split_whitespace().collect();
            if tokens.len() < header.width {
                return None;
            }
            let name = tokens[header.name];
            let namespace = match (header.namespace, fixed_namespace) {
                (Some(i), _) => tokens[i],
                (None, Some(ns)) => ns,
                (None, None) => return None,
            };
            Some(InstanceRow { namespace: namespace.to_string(), name: name.to_string() })
        })
        .collect();
    Ok(rows)
}
