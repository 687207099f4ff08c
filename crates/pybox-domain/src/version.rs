//! Runtime version constraints.
//!
//! Constraints use npm-style range syntax (`~3.11`, `^3.10`, `>=3.9 <3.12`, `3.12.x`,
//! `3.9 - 3.11`, `3.10 || 3.12`). A bare version is a partial match (`3.11` accepts any
//! `3.11.z`), not a caret range. A leading `v` on a version is ignored.

use std::fmt;
use std::str::FromStr;

use semver::{Version, VersionReq};

use crate::ProvisionError;

const OPERATORS: &[&str] = &[">=", "<=", ">", "<", "=", "~", "^"];

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct VersionConstraint {
    raw: Option<String>,
    alternatives: Vec<VersionReq>,
}

impl VersionConstraint {
    /// The absent constraint: any release, latest first.
    #[must_use]
    pub fn latest() -> Self {
        Self::default()
    }

    pub fn parse(input: &str) -> Result<Self, ProvisionError> {
        let trimmed = input.trim();
        if trimmed.is_empty() {
            return Ok(Self::latest());
        }
        let invalid = |reason: String| ProvisionError::InvalidConstraint {
            constraint: trimmed.to_string(),
            reason,
        };
        let mut alternatives = Vec::new();
        for alternative in trimmed.split("||") {
            let normalized = normalize_alternative(alternative).map_err(invalid)?;
            let req = VersionReq::parse(&normalized).map_err(|err| invalid(err.to_string()))?;
            alternatives.push(req);
        }
        Ok(Self {
            raw: Some(trimmed.to_string()),
            alternatives,
        })
    }

    /// Parse an optional expression; `None` means "latest available".
    pub fn from_option(input: Option<&str>) -> Result<Self, ProvisionError> {
        input.map_or_else(|| Ok(Self::latest()), Self::parse)
    }

    #[must_use]
    pub fn is_latest(&self) -> bool {
        self.alternatives.is_empty()
    }

    #[must_use]
    pub fn as_str(&self) -> Option<&str> {
        self.raw.as_deref()
    }

    #[must_use]
    pub fn matches_version(&self, version: &Version) -> bool {
        if self.is_latest() {
            return version.pre.is_empty();
        }
        self.alternatives.iter().any(|req| req.matches(version))
    }

    /// Evaluate a concrete `x.y.z` string. Unparsable versions never satisfy.
    #[must_use]
    pub fn matches(&self, version: &str) -> bool {
        Version::parse(version.trim()).is_ok_and(|version| self.matches_version(&version))
    }
}

impl FromStr for VersionConstraint {
    type Err = ProvisionError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl fmt::Display for VersionConstraint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.raw.as_deref().unwrap_or("*"))
    }
}

fn normalize_alternative(input: &str) -> Result<String, String> {
    let tokens: Vec<&str> = input
        .split(|ch: char| ch.is_whitespace() || ch == ',')
        .filter(|token| !token.is_empty())
        .collect();
    let mut comparators: Vec<String> = Vec::new();
    let mut pending_op: Option<&str> = None;
    let mut idx = 0;
    while idx < tokens.len() {
        let token = tokens[idx];
        if tokens.get(idx + 1) == Some(&"-") {
            if let Some(op) = pending_op {
                return Err(format!("operator `{op}` cannot start a hyphen range"));
            }
            let upper = tokens
                .get(idx + 2)
                .ok_or_else(|| format!("hyphen range `{token} -` is missing an upper bound"))?;
            comparators.push(format!(">={}", strip_version_prefix(token)));
            if let Some(bound) = hyphen_upper_bound(&strip_version_prefix(upper))? {
                comparators.push(bound);
            }
            idx += 3;
            continue;
        }
        idx += 1;
        if let Some(op) = OPERATORS.iter().find(|op| **op == token) {
            if pending_op.is_some() {
                return Err(format!("dangling operator before `{token}`"));
            }
            pending_op = Some(op);
            continue;
        }
        let comparator = match pending_op.take() {
            Some(op) => format!("{op}{token}"),
            None => token.to_string(),
        };
        comparators.push(bare_to_partial(&strip_version_prefix(&comparator)));
    }
    if let Some(op) = pending_op {
        return Err(format!("operator `{op}` is missing a version"));
    }
    if comparators.is_empty() {
        return Ok("*".to_string());
    }
    Ok(comparators.join(", "))
}

/// Drop a `v` (or `V`) written between the operator and the version: `>=v3.9` -> `>=3.9`.
fn strip_version_prefix(comparator: &str) -> String {
    let split = comparator
        .find(|ch: char| !matches!(ch, '<' | '>' | '=' | '~' | '^'))
        .unwrap_or(comparator.len());
    let (op, version) = comparator.split_at(split);
    let version = version.strip_prefix(['v', 'V']).unwrap_or(version);
    format!("{op}{version}")
}

/// Upper bound of `A - B`. A full `B` is inclusive; a partial `B` admits everything below the
/// next minor or major (`- 3.11` is `<3.12.0`). `None` means unbounded.
fn hyphen_upper_bound(upper: &str) -> Result<Option<String>, String> {
    let parts: Vec<u64> = upper
        .split('.')
        .take_while(|part| !matches!(*part, "x" | "X" | "*"))
        .map(|part| {
            part.parse::<u64>()
                .map_err(|_| format!("invalid hyphen range bound `{upper}`"))
        })
        .collect::<Result<_, _>>()?;
    let bound = match parts.as_slice() {
        [] => None,
        [major] => Some(format!("<{}.0.0", major + 1)),
        [major, minor] => Some(format!("<{major}.{}.0", minor + 1)),
        _ => Some(format!("<={upper}")),
    };
    Ok(bound)
}

fn bare_to_partial(comparator: &str) -> String {
    let starts_with_digit = comparator
        .chars()
        .next()
        .is_some_and(|ch| ch.is_ascii_digit());
    let has_wildcard = comparator.contains(['*', 'x', 'X']);
    if starts_with_digit && !has_wildcard {
        format!("={comparator}")
    } else {
        comparator.to_string()
    }
}

/// Sort key ordering higher versions first.
#[must_use]
pub fn descending(left: &Version, right: &Version) -> std::cmp::Ordering {
    right.cmp(left)
}
