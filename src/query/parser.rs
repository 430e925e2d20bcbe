//! Query Pipeline Parser
//!
//! Splits a query into its pipeline segments and pulls out the module name
//! of each, skipping tag specifiers (`tag=...`) and macro references
//! (`$NAME`). Also extracts the aggregation window (`over Ns`), which the
//! backend reports back as the search's minimum zoom window.

use nom::{
    branch::alt,
    bytes::complete::take_while,
    character::complete::{alpha1, char},
    combinator::{map, recognize},
    sequence::pair,
    IResult,
};

use crate::query::error::{QueryError, QueryResult};

/// What a query compiles into, as far as the client can tell
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueryPipeline {
    /// Module names in pipeline order
    pub modules: Vec<String>,
    /// Aggregation window in seconds, if the query has one. Fixed per
    /// query; the backend derives the minimum zoom window from it.
    pub aggregation_window_secs: Option<i64>,
}

/// Inspect a query string
pub fn inspect_query(input: &str) -> QueryResult<QueryPipeline> {
    let input = input.trim();
    if input.is_empty() {
        return Err(QueryError::Empty);
    }

    let modules = input
        .split('|')
        .filter_map(segment_module)
        .collect::<Vec<_>>();

    Ok(QueryPipeline {
        modules,
        aggregation_window_secs: aggregation_window(input)?,
    })
}

/// Extract the module name from one pipeline segment: the first bare
/// identifier that is neither a tag specifier nor a macro reference
fn segment_module(segment: &str) -> Option<String> {
    for token in segment.split_whitespace() {
        match parse_token(token) {
            Ok((_, Some(module))) => return Some(module.to_string()),
            _ => continue,
        }
    }
    None
}

/// Classify one token; yields `Some(identifier)` for a module candidate
fn parse_token(input: &str) -> IResult<&str, Option<&str>> {
    alt((
        // tag=... and other key=value specifiers are not modules
        map(recognize(pair(identifier, char('='))), |_| None),
        // $NAME macro references expand server-side
        map(recognize(pair(char('$'), identifier)), |_| None),
        map(identifier, Some),
    ))(input)
}

/// A bare identifier: alphabetic start, then alphanumerics and underscores
fn identifier(input: &str) -> IResult<&str, &str> {
    recognize(pair(
        alpha1,
        take_while(|c: char| c.is_alphanumeric() || c == '_'),
    ))(input)
}

/// Find the `over Ns` aggregation window, if present
fn aggregation_window(input: &str) -> QueryResult<Option<i64>> {
    let re = regex::Regex::new(r"\bover\s+(\d+)\s*s\b")
        .map_err(|e| QueryError::Parse(e.to_string()))?;

    match re.captures(input) {
        Some(caps) => {
            let secs: i64 = caps[1]
                .parse()
                .map_err(|_| QueryError::Parse(format!("invalid window: {}", &caps[1])))?;
            Ok(Some(secs))
        }
        None => Ok(None),
    }
}
