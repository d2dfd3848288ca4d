//! The revision selection language: a small algebra of atoms (indices,
//! tags, trust, server, special names), set union/intersection, and
//! inclusive ranges, evaluated over one repository's history.
//!
//! Grouping precedence, tightest to loosest: parenthesized function calls
//! are atoms; `..` binds a range from two atoms; `&` intersects `..`-or-atom
//! operands; `,` unions everything at the top level, preserving first-seen
//! order. This reads naturally as `1..5 & tag:daily, manual:keep` meaning
//! "(the last six revisions that are tagged daily) union (anything tagged
//! manual:keep)".

use chrono::{DateTime, Utc};

use backy_api_types::{BackyError, Trust};

use crate::revision::Revision;

/// Evaluate `spec` against `history` (ascending by timestamp, oldest
/// first), returning the matching indices in selection order. Indices may
/// repeat if the same revision is reachable through more than one branch
/// of a union — callers that need a set should dedup.
pub fn evaluate(spec: &str, history: &[Revision]) -> Result<Vec<usize>, BackyError> {
    let spec = spec.trim();
    if spec.is_empty() {
        return Err(BackyError::InvalidSelection("empty selection".to_string()));
    }
    eval_union(spec, history)
}

fn eval_union(spec: &str, history: &[Revision]) -> Result<Vec<usize>, BackyError> {
    let mut result = Vec::new();
    let mut seen = std::collections::HashSet::new();
    for part in split_top_level(spec, ',') {
        for idx in eval_intersection(part.trim(), history)? {
            if seen.insert(idx) {
                result.push(idx);
            }
        }
    }
    Ok(result)
}

fn eval_intersection(spec: &str, history: &[Revision]) -> Result<Vec<usize>, BackyError> {
    let parts: Vec<&str> = split_top_level(spec, '&');
    let mut iter = parts.into_iter();
    let first = iter
        .next()
        .ok_or_else(|| BackyError::InvalidSelection(spec.to_string()))?;
    let mut acc = eval_range_or_atom(first.trim(), history)?;
    for part in iter {
        let rhs: std::collections::HashSet<usize> =
            eval_range_or_atom(part.trim(), history)?.into_iter().collect();
        acc.retain(|idx| rhs.contains(idx));
    }
    Ok(acc)
}

fn eval_range_or_atom(spec: &str, history: &[Revision]) -> Result<Vec<usize>, BackyError> {
    if let Some((left, right)) = split_range(spec) {
        return eval_range(left.trim(), right.trim(), history);
    }
    eval_atom_or_call(spec, history)
}

/// Split `left..right` at the top-level `..`, returning the two (possibly
/// empty) sides. Returns `None` if there is no top-level `..`.
fn split_range(spec: &str) -> Option<(&str, &str)> {
    let bytes = spec.as_bytes();
    let mut depth = 0i32;
    let mut i = 0;
    while i + 1 < bytes.len() {
        match bytes[i] {
            b'(' => depth += 1,
            b')' => depth -= 1,
            b'.' if depth == 0 && bytes[i + 1] == b'.' => {
                return Some((&spec[..i], &spec[i + 2..]));
            }
            _ => {}
        }
        i += 1;
    }
    None
}

/// Split `spec` on every top-level occurrence of `delim`, ignoring
/// occurrences nested inside parentheses.
fn split_top_level(spec: &str, delim: char) -> Vec<&str> {
    let mut parts = Vec::new();
    let mut depth = 0i32;
    let mut start = 0usize;
    for (i, c) in spec.char_indices() {
        match c {
            '(' => depth += 1,
            ')' => depth -= 1,
            c if c == delim && depth == 0 => {
                parts.push(&spec[start..i]);
                start = i + c.len_utf8();
            }
            _ => {}
        }
    }
    parts.push(&spec[start..]);
    parts
}

fn eval_atom_or_call(spec: &str, history: &[Revision]) -> Result<Vec<usize>, BackyError> {
    if let Some(inner) = strip_call(spec, "not") {
        let selected: std::collections::HashSet<usize> =
            eval_union(inner, history)?.into_iter().collect();
        return Ok((0..history.len()).filter(|i| !selected.contains(i)).collect());
    }
    if let Some(inner) = strip_call(spec, "reverse") {
        let mut inner = eval_union(inner, history)?;
        inner.reverse();
        return Ok(inner);
    }
    if let Some(inner) = strip_call(spec, "first") {
        let inner = eval_union(inner, history)?;
        return Ok(inner.into_iter().take(1).collect());
    }
    if let Some(inner) = strip_call(spec, "last") {
        let inner = eval_union(inner, history)?;
        return Ok(inner.into_iter().last().into_iter().collect());
    }
    if let Some(set) = resolve_set_atom(spec, history) {
        return Ok(set);
    }
    Ok(vec![resolve_atom(spec, history)?])
}

/// `name(...)`-shaped call for exactly `name`, returning the inner text.
fn strip_call<'a>(spec: &'a str, name: &str) -> Option<&'a str> {
    let rest = spec.strip_prefix(name)?;
    let rest = rest.trim_start();
    let inner = rest.strip_prefix('(')?.strip_suffix(')')?;
    Some(inner)
}

/// Atoms naming a *set* of revisions rather than a single index: `all`,
/// `clean`, `local`, `remote`, `server:`/`tag:`/`trust:` predicates.
fn resolve_set_atom(spec: &str, history: &[Revision]) -> Option<Vec<usize>> {
    match spec {
        "all" => return Some((0..history.len()).collect()),
        "clean" => {
            return Some(
                history
                    .iter()
                    .enumerate()
                    .filter(|(_, r)| r.is_clean())
                    .map(|(i, _)| i)
                    .collect(),
            )
        }
        "local" => {
            return Some(
                history
                    .iter()
                    .enumerate()
                    .filter(|(_, r)| r.is_local())
                    .map(|(i, _)| i)
                    .collect(),
            )
        }
        "remote" => {
            return Some(
                history
                    .iter()
                    .enumerate()
                    .filter(|(_, r)| !r.is_local())
                    .map(|(i, _)| i)
                    .collect(),
            )
        }
        _ => {}
    }
    if let Some(name) = spec.strip_prefix("server:") {
        return Some(
            history
                .iter()
                .enumerate()
                .filter(|(_, r)| r.info.server == name)
                .map(|(i, _)| i)
                .collect(),
        );
    }
    if let Some(name) = spec.strip_prefix("tag:") {
        return Some(
            history
                .iter()
                .enumerate()
                .filter(|(_, r)| r.info.tags.contains(name))
                .map(|(i, _)| i)
                .collect(),
        );
    }
    if let Some(name) = spec.strip_prefix("trust:") {
        let want: Trust = name.parse().ok()?;
        return Some(
            history
                .iter()
                .enumerate()
                .filter(|(_, r)| r.info.trust == want)
                .map(|(i, _)| i)
                .collect(),
        );
    }
    None
}

/// Atoms naming a *single* revision index: bare integers (newest-relative),
/// `first`/`last`/`latest`, and bare UUIDs.
fn resolve_atom(spec: &str, history: &[Revision]) -> Result<usize, BackyError> {
    if let Ok(n) = spec.parse::<i64>() {
        return index_from_newest(n, history);
    }
    match spec {
        "first" => {
            return history
                .first()
                .map(|_| 0)
                .ok_or_else(|| BackyError::RevisionNotFound(spec.to_string()))
        }
        "last" | "latest" => {
            return history
                .len()
                .checked_sub(1)
                .ok_or_else(|| BackyError::RevisionNotFound(spec.to_string()))
        }
        _ => {}
    }
    history
        .iter()
        .position(|r| r.uuid() == spec)
        .ok_or_else(|| BackyError::InvalidSelection(format!("no such revision: {spec}")))
}

fn index_from_newest(n: i64, history: &[Revision]) -> Result<usize, BackyError> {
    if n < 0 || history.is_empty() {
        return Err(BackyError::RevisionNotFound(n.to_string()));
    }
    let idx = history.len() as i64 - 1 - n;
    if idx < 0 {
        return Err(BackyError::RevisionNotFound(n.to_string()));
    }
    Ok(idx as usize)
}

/// Resolve one side of a range expression to a (possibly fractional)
/// index. An empty side takes the documented default (`first` on the
/// left, `last` on the right). An ISO-8601 timestamp resolves to the
/// integer index of an exact match, or the midpoint between its two
/// bracketing neighbours if they are adjacent (never true for a sorted,
/// gap-free history, so this only errs when the timestamp falls outside
/// the recorded range entirely).
fn resolve_range_side(
    side: &str,
    default_first: bool,
    history: &[Revision],
) -> Result<f64, BackyError> {
    if side.is_empty() {
        return if default_first {
            Ok(0.0)
        } else {
            Ok(history.len().saturating_sub(1) as f64)
        };
    }
    if let Ok(dt) = side.parse::<DateTime<Utc>>() {
        return resolve_date_index(dt, history);
    }
    eval_atom_or_call(side, history).map(|idxs| {
        idxs.first()
            .copied()
            .map(|i| i as f64)
            .unwrap_or(if default_first { 0.0 } else { history.len().saturating_sub(1) as f64 })
    })
}

fn resolve_date_index(dt: DateTime<Utc>, history: &[Revision]) -> Result<f64, BackyError> {
    if let Some(idx) = history.iter().position(|r| r.info.timestamp == dt) {
        return Ok(idx as f64);
    }
    let mut before = None;
    let mut after = None;
    for (i, rev) in history.iter().enumerate() {
        if rev.info.timestamp < dt {
            before = Some(i);
        } else if rev.info.timestamp > dt && after.is_none() {
            after = Some(i);
        }
    }
    match (before, after) {
        (Some(b), Some(a)) if a == b + 1 => Ok((b as f64 + a as f64) / 2.0),
        _ => Err(BackyError::InvalidSelection(format!(
            "date {dt} does not fall between two adjacent revisions"
        ))),
    }
}

fn eval_range(left: &str, right: &str, history: &[Revision]) -> Result<Vec<usize>, BackyError> {
    let lo = resolve_range_side(left, true, history)?;
    let hi = resolve_range_side(right, false, history)?;
    let (lo, hi) = (lo.min(hi), lo.max(hi));
    let lo = lo.floor().max(0.0) as usize;
    let hi = (hi.ceil() as usize).min(history.len().saturating_sub(1));
    if history.is_empty() || lo > hi {
        return Ok(Vec::new());
    }
    Ok((lo..=hi).collect())
}
