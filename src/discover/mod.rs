//! Unit discovery and filter-query parsing (spec.md §4.4).

use camino::{Utf8Path, Utf8PathBuf};
use globset::{Glob, GlobSet, GlobSetBuilder};
use ignore::WalkBuilder;

use crate::error::{Result, StratumError};

pub const UNIT_CONFIG_FILENAME: &str = "stratum.hcl";
pub const STACK_CONFIG_FILENAME: &str = "stratum.stack.hcl";
const STACK_STAGING_DIR: &str = ".stratum-stack";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DiscoveredKind {
    Unit,
    Stack,
}

#[derive(Debug, Clone)]
pub struct DiscoveredEntry {
    pub path: Utf8PathBuf,
    pub kind: DiscoveredKind,
}

/// Walk `root` for unit/stack config files, bounded by `max_folders`
/// (spec.md §4.4 "bounded by `--max-folders-to-check`").
pub fn discover(root: &Utf8Path, max_folders: usize) -> Result<Vec<DiscoveredEntry>> {
    let mut found = Vec::new();
    let mut visited = 0usize;

    let walker = WalkBuilder::new(root.as_std_path())
        .hidden(false)
        .git_ignore(true)
        .build();

    for entry in walker {
        let entry = entry.map_err(|e| StratumError::ConfigError { reason: e.to_string() })?;
        if !entry.file_type().is_some_and(|t| t.is_dir()) {
            continue;
        }

        visited += 1;
        if visited > max_folders {
            return Err(StratumError::DiscoveryLimitExceeded { limit: max_folders });
        }

        let dir = match Utf8PathBuf::try_from(entry.path().to_path_buf()) {
            Ok(p) => p,
            Err(_) => continue,
        };

        if dir.join(UNIT_CONFIG_FILENAME).exists() {
            found.push(DiscoveredEntry {
                path: dir,
                kind: DiscoveredKind::Unit,
            });
        } else if dir.join(STACK_CONFIG_FILENAME).exists() {
            let staging = dir.join(STACK_STAGING_DIR);
            let mut nested = if staging.exists() {
                discover(&staging, max_folders.saturating_sub(visited))?
            } else {
                Vec::new()
            };
            found.push(DiscoveredEntry {
                path: dir,
                kind: DiscoveredKind::Stack,
            });
            found.append(&mut nested);
        }
    }

    Ok(found)
}

/// One token within a filter query. Queries are a `|`-separated (AND)
/// sequence of tokens; queries are comma-separated (OR) at the CLI layer.
#[derive(Debug, Clone)]
pub enum FilterToken {
    PathGlob { glob: String, negate: bool },
    Name(String),
    Type(DiscoveredKind),
    External(bool),
}

/// Parses one `|`-joined filter query into tokens. Attribute tokens
/// (`name=`, `type=`, `external=`) require HCL-evaluated unit metadata;
/// callers operating purely on paths should reject a query containing any
/// via [`FilterToken::requires_discovery`].
pub fn parse_filter_query(query: &str) -> Result<Vec<FilterToken>> {
    query.split('|').map(|raw| parse_filter_token(raw.trim())).collect()
}

fn parse_filter_token(raw: &str) -> Result<FilterToken> {
    if let Some(rest) = raw.strip_prefix("name=") {
        return Ok(FilterToken::Name(rest.to_string()));
    }
    if let Some(rest) = raw.strip_prefix("type=") {
        return match rest {
            "unit" => Ok(FilterToken::Type(DiscoveredKind::Unit)),
            "stack" => Ok(FilterToken::Type(DiscoveredKind::Stack)),
            other => Err(StratumError::FilterParseError {
                expr: raw.to_string(),
                reason: format!("unknown type '{other}', expected unit or stack"),
            }),
        };
    }
    if let Some(rest) = raw.strip_prefix("external=") {
        return match rest {
            "true" => Ok(FilterToken::External(true)),
            "false" => Ok(FilterToken::External(false)),
            other => Err(StratumError::FilterParseError {
                expr: raw.to_string(),
                reason: format!("unknown bool '{other}', expected true or false"),
            }),
        };
    }

    let (negate, body) = raw.strip_prefix('!').map(|b| (true, b)).unwrap_or((false, raw));
    let glob = body.strip_prefix('{').and_then(|b| b.strip_suffix('}')).unwrap_or(body);
    Ok(FilterToken::PathGlob {
        glob: glob.to_string(),
        negate,
    })
}

impl FilterToken {
    pub fn requires_discovery(&self) -> bool {
        matches!(self, FilterToken::Name(_) | FilterToken::Type(_) | FilterToken::External(_))
    }
}

/// Reject a query containing attribute filters for path-only commands
/// (spec.md §4.4 `FilterQueryRequiresDiscoveryError`).
pub fn reject_attribute_filters_for_path_only(tokens: &[FilterToken], raw_query: &str) -> Result<()> {
    if tokens.iter().any(FilterToken::requires_discovery) {
        return Err(StratumError::FilterParseError {
            expr: raw_query.to_string(),
            reason: "attribute filters (name=/type=/external=) require full discovery".into(),
        });
    }
    Ok(())
}

pub fn compile_path_globs(tokens: &[FilterToken]) -> Result<GlobSet> {
    let mut builder = GlobSetBuilder::new();
    for token in tokens {
        if let FilterToken::PathGlob { glob, .. } = token {
            let compiled = Glob::new(glob).map_err(|e| StratumError::FilterParseError {
                expr: glob.clone(),
                reason: e.to_string(),
            })?;
            builder.add(compiled);
        }
    }
    builder.build().map_err(|e| StratumError::FilterParseError {
        expr: "<glob set>".into(),
        reason: e.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_mixed_intersection_query() {
        let tokens = parse_filter_query("units/** | name=vpc*").unwrap();
        assert_eq!(tokens.len(), 2);
        assert!(matches!(tokens[1], FilterToken::Name(_)));
    }

    #[test]
    fn negated_glob_token() {
        let tokens = parse_filter_query("!units/legacy/**").unwrap();
        match &tokens[0] {
            FilterToken::PathGlob { negate, .. } => assert!(*negate),
            _ => panic!("expected path glob"),
        }
    }

    #[test]
    fn attribute_filter_rejected_for_path_only_commands() {
        let tokens = parse_filter_query("type=unit").unwrap();
        assert!(reject_attribute_filters_for_path_only(&tokens, "type=unit").is_err());
    }

    #[test]
    fn path_only_query_accepted_for_path_only_commands() {
        let tokens = parse_filter_query("units/**").unwrap();
        assert!(reject_attribute_filters_for_path_only(&tokens, "units/**").is_ok());
    }

    #[test]
    fn unknown_type_value_is_a_parse_error() {
        assert!(parse_filter_query("type=bogus").is_err());
    }
}
